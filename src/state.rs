use std::sync::Arc;

use diesel::{
    pg::PgConnection,
    r2d2::{ConnectionManager, PooledConnection},
};

use crate::{
    config::AppConfig,
    db::PgPool,
    error::{AppError, AppResult},
    extract::TextExtractor,
    jobs::RetryPolicy,
    normalize::PipelineVersion,
    provider::ExtractionProvider,
    storage::ObjectStorage,
};

pub type PgPooledConnection = PooledConnection<ConnectionManager<PgConnection>>;

#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub config: Arc<AppConfig>,
    pub storage: Arc<dyn ObjectStorage>,
    pub provider: Arc<dyn ExtractionProvider>,
    pub extractor: Arc<dyn TextExtractor>,
    pub retry_policy: RetryPolicy,
}

impl AppState {
    pub fn new(
        pool: PgPool,
        config: AppConfig,
        storage: Arc<dyn ObjectStorage>,
        provider: Arc<dyn ExtractionProvider>,
        extractor: Arc<dyn TextExtractor>,
    ) -> Self {
        Self {
            pool,
            config: Arc::new(config),
            storage,
            provider,
            extractor,
            retry_policy: RetryPolicy::default(),
        }
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    pub fn db(&self) -> AppResult<PgPooledConnection> {
        self.pool
            .get()
            .map_err(|err| AppError::unavailable(format!("database pool error: {err}")))
    }

    pub fn pipeline_version(&self) -> PipelineVersion {
        PipelineVersion::from_config(&self.config)
    }
}
