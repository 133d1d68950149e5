use std::collections::HashMap;
use std::env;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, ensure, Context, Result};
use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Method, Request, Response};
use axum::Router;
use chrono::Utc;
use diesel::connection::SimpleConnection;
use diesel::prelude::*;
use diesel::PgConnection;
use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};
use finsight::canonical::{Pepper, PEPPER_LEN};
use finsight::config::{AppConfig, SubmitMode};
use finsight::db::{self, PgPool};
use finsight::extract::{ExtractError, ExtractedText, TextExtractor};
use finsight::jobs::{self, NewUpload};
use finsight::models::DocumentJob;
use finsight::provider::{
    DocumentEnvelope, ExtractionProvider, ProviderError, ProviderJob, ProviderJobStatus,
    SubmitReceipt, SubmitSource,
};
use finsight::routes;
use finsight::state::AppState;
use finsight::storage::{content_digest, upload_key, ObjectStorage};
use finsight::{default_handlers, Worker};
use http_body_util::BodyExt;
use once_cell::sync::Lazy;
use serde_json::Value;
use tokio::sync::Mutex;
use tower::util::ServiceExt;
use uuid::Uuid;

const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations");

static DB_LOCK: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

#[derive(Default)]
pub struct FakeStorage {
    objects: Mutex<HashMap<String, Vec<u8>>>,
}

#[async_trait]
impl ObjectStorage for FakeStorage {
    async fn put_object(
        &self,
        key: &str,
        bytes: Vec<u8>,
        _content_type: Option<String>,
    ) -> Result<()> {
        let mut guard = self.objects.lock().await;
        guard.insert(key.to_string(), bytes);
        Ok(())
    }

    async fn presign_get_object(&self, key: &str, expires_in: Duration) -> Result<String> {
        let guard = self.objects.lock().await;
        ensure!(guard.contains_key(key), "object {key} missing");
        Ok(format!(
            "https://fake-storage/{key}?expires_in={}",
            expires_in.as_secs()
        ))
    }

    async fn get_object(&self, key: &str) -> Result<Vec<u8>> {
        let guard = self.objects.lock().await;
        guard
            .get(key)
            .cloned()
            .ok_or_else(|| anyhow!("object {key} missing"))
    }
}

/// What the fake provider does with the next submission.
#[allow(dead_code)]
#[derive(Clone)]
pub enum ProviderScript {
    Document(Value),
    SubmitStatus(u16),
    JobFails(String),
}

pub struct FakeProvider {
    script: Mutex<ProviderScript>,
    submissions: AtomicUsize,
}

impl Default for FakeProvider {
    fn default() -> Self {
        Self {
            script: Mutex::new(ProviderScript::SubmitStatus(503)),
            submissions: AtomicUsize::new(0),
        }
    }
}

#[allow(dead_code)]
impl FakeProvider {
    pub async fn script(&self, script: ProviderScript) {
        *self.script.lock().await = script;
    }

    pub fn submissions(&self) -> usize {
        self.submissions.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ExtractionProvider for FakeProvider {
    async fn submit(
        &self,
        _workflow_id: &str,
        _source: SubmitSource,
    ) -> Result<SubmitReceipt, ProviderError> {
        if let ProviderScript::SubmitStatus(status) = &*self.script.lock().await {
            let (status, body) = (*status, "scripted failure".to_string());
            return Err(if (400..500).contains(&status) {
                ProviderError::Rejected { status, body }
            } else {
                ProviderError::Http { status, body }
            });
        }
        let n = self.submissions.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(SubmitReceipt {
            document_id: format!("doc-{n}"),
            job_id: format!("job-{n}"),
        })
    }

    async fn job_status(&self, job_id: &str) -> Result<ProviderJob, ProviderError> {
        let script = self.script.lock().await.clone();
        let document_id = Some(job_id.replacen("job-", "doc-", 1));
        Ok(match script {
            ProviderScript::JobFails(detail) => ProviderJob {
                status: ProviderJobStatus::Failed,
                document_id,
                error: Some(Value::String(detail)),
            },
            _ => ProviderJob {
                status: ProviderJobStatus::Completed,
                document_id,
                error: None,
            },
        })
    }

    async fn fetch_document(&self, document_id: &str) -> Result<DocumentEnvelope, ProviderError> {
        match self.script.lock().await.clone() {
            ProviderScript::Document(value) => Ok(DocumentEnvelope::Bare(value)),
            _ => Err(ProviderError::NotFound {
                body: format!("document {document_id} missing"),
            }),
        }
    }
}

/// Returns fixed text for every document; `None` behaves like a file no PDF
/// engine can open.
#[derive(Default)]
pub struct FakeExtractor {
    text: std::sync::Mutex<Option<String>>,
}

#[allow(dead_code)]
impl FakeExtractor {
    pub fn set_text(&self, text: Option<&str>) {
        if let Ok(mut guard) = self.text.lock() {
            *guard = text.map(str::to_string);
        }
    }
}

impl TextExtractor for FakeExtractor {
    fn extract_text(&self, _bytes: &[u8]) -> Result<ExtractedText, ExtractError> {
        let text = self
            .text
            .lock()
            .map_err(|_| ExtractError::EngineUnavailable("poisoned".into()))?
            .clone();
        match text {
            Some(text) => Ok(ExtractedText::from_pages(vec![text])),
            None => Err(ExtractError::Unreadable("not a pdf".into())),
        }
    }
}

pub fn test_config(database_url: String) -> AppConfig {
    AppConfig {
        database_url,
        database_max_pool_size: db::DEFAULT_MAX_POOL_SIZE,
        health_host: "127.0.0.1".to_string(),
        health_port: 0,
        provider_api_key: "test-key".to_string(),
        provider_base_url: "http://provider.invalid".to_string(),
        provider_workflow_id: "wf-test".to_string(),
        provider_model: "extract-test".to_string(),
        provider_prompt_version: "1".to_string(),
        provider_submit_mode: SubmitMode::Inline,
        provider_poll_interval_ms: 5,
        provider_poll_timeout_ms: 1_000,
        pii_hash_pepper: Pepper::from_bytes([7u8; PEPPER_LEN]),
        worker_concurrency: 1,
        worker_poll_interval_ms: 10,
        job_lease_seconds: 900,
        aws_endpoint_url: None,
        aws_access_key_id: None,
        aws_secret_access_key: None,
        aws_region: "eu-west-2".to_string(),
        s3_bucket: "test-bucket".to_string(),
    }
}

pub struct TestApp {
    pub state: Arc<AppState>,
    router: Router,
    worker: Worker,
    pub storage: Arc<FakeStorage>,
    pub provider: Arc<FakeProvider>,
    pub extractor: Arc<FakeExtractor>,
}

#[allow(dead_code)]
impl TestApp {
    pub async fn new() -> Result<Self> {
        let database_url = env::var("TEST_DATABASE_URL")
            .context("TEST_DATABASE_URL must be set for integration tests")?;

        let config = test_config(database_url);
        let pool = db::init_pool_with_size(&config.database_url, config.database_max_pool_size)?;
        prepare_database(&pool).await?;

        let storage = Arc::new(FakeStorage::default());
        let provider = Arc::new(FakeProvider::default());
        let extractor = Arc::new(FakeExtractor::default());
        let state = AppState::new(
            pool,
            config,
            storage.clone(),
            provider.clone(),
            extractor.clone(),
        );
        let router = routes::create_router(state.clone());
        let state = Arc::new(state);
        let worker = Worker::new(
            state.clone(),
            default_handlers(),
            Duration::from_millis(10),
            1,
        );

        Ok(Self {
            state,
            router,
            worker,
            storage,
            provider,
            extractor,
        })
    }

    pub async fn cleanup(&self) -> Result<()> {
        self.with_conn(truncate_all).await
    }

    /// Stores the bytes and registers the job the way an upload would.
    pub async fn upload(
        &self,
        user_id: Uuid,
        name: &str,
        bytes: &[u8],
        candidate_type: &str,
    ) -> Result<DocumentJob> {
        let file_id = Uuid::new_v4();
        let storage_key = upload_key(user_id, file_id, name);
        let content_type = mime_guess::from_path(name)
            .first()
            .map(|mime| mime.essence_str().to_string());
        self.storage
            .put_object(&storage_key, bytes.to_vec(), content_type.clone())
            .await?;

        let upload = NewUpload {
            user_id,
            file_id,
            storage_key,
            original_name: name.to_string(),
            content_type,
            content_hash: content_digest(bytes),
            candidate_type: candidate_type.to_string(),
        };
        self.with_conn(move |conn| Ok(jobs::register_upload(conn, upload)?))
            .await
    }

    /// Runs one worker iteration.
    pub async fn tick(&self) -> Result<bool> {
        Ok(self.worker.tick().await?)
    }

    pub async fn job(&self, job_id: Uuid) -> Result<DocumentJob> {
        self.with_conn(move |conn| Ok(jobs::get_job(conn, job_id)?))
            .await
    }

    /// Pulls the job's retry time into the past so the next tick claims it.
    pub async fn make_due(&self, job_id: Uuid) -> Result<()> {
        self.with_conn(move |conn| {
            use finsight::schema::document_jobs;
            diesel::update(document_jobs::table.find(job_id))
                .set(document_jobs::retry_at.eq(Utc::now().naive_utc() - chrono::Duration::seconds(1)))
                .execute(conn)
                .context("failed to reschedule job")?;
            Ok(())
        })
        .await
    }

    pub async fn get(&self, path: &str) -> Result<Response<Body>> {
        let request = Request::builder()
            .method(Method::GET)
            .uri(path)
            .body(Body::empty())?;
        Ok(self
            .router
            .clone()
            .oneshot(request)
            .await
            .expect("infallible response"))
    }

    pub async fn with_conn<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut PgConnection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let pool = self.state.pool.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = pool
                .get()
                .map_err(|err| anyhow!("failed to get database connection: {err}"))?;
            f(&mut conn)
        })
        .await
        .context("connection task panicked")?
    }
}

pub async fn acquire_db_lock() -> tokio::sync::MutexGuard<'static, ()> {
    DB_LOCK.lock().await
}

#[allow(dead_code)]
pub async fn body_to_vec(body: Body) -> Result<Vec<u8>> {
    let collected = body
        .collect()
        .await
        .map_err(|err| anyhow!("failed to read response body: {err}"))?;
    Ok(collected.to_bytes().to_vec())
}

async fn prepare_database(pool: &PgPool) -> Result<()> {
    let pool = pool.clone();
    tokio::task::spawn_blocking(move || -> Result<()> {
        let mut conn = pool
            .get()
            .map_err(|err| anyhow!("failed to acquire connection: {err}"))?;
        conn.run_pending_migrations(MIGRATIONS)
            .map_err(|err| anyhow!("failed to run migrations: {err}"))?;
        truncate_all(&mut conn)?;
        Ok(())
    })
    .await
    .context("migration task panicked")?
}

fn truncate_all(conn: &mut PgConnection) -> Result<()> {
    conn.batch_execute(
        "TRUNCATE TABLE dead_letters, analytics_snapshots, accounts, insights, document_jobs CASCADE;",
    )
    .context("failed to truncate tables")?;
    Ok(())
}
