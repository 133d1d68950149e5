use std::{collections::HashMap, sync::Arc, time::Duration};

use async_trait::async_trait;
use diesel::pg::PgConnection;
use tokio::{task, task::JoinSet, time::sleep};
use tracing::{error, info, warn};

use crate::{
    error::PipelineError,
    jobs::{
        claim_job, mark_rejected, mark_skipped, mark_succeeded, record_failure,
        requeue_stale_jobs, JobFailure,
    },
    models::DocumentJob,
    state::AppState,
};

pub mod extract;
pub mod persist;

const REAP_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug)]
pub enum JobExecution {
    Success,
    /// The previous run already produced a complete insight.
    Skipped,
    Retry { error: PipelineError },
    Rejected { error: PipelineError },
}

impl From<PipelineError> for JobExecution {
    fn from(error: PipelineError) -> Self {
        if error.is_retryable() {
            JobExecution::Retry { error }
        } else {
            JobExecution::Rejected { error }
        }
    }
}

#[async_trait]
pub trait JobHandler: Send + Sync {
    /// Candidate document types this handler claims.
    fn candidate_types(&self) -> &'static [&'static str];
    async fn handle(&self, state: Arc<AppState>, job: DocumentJob) -> JobExecution;
}

/// Runs `f` with a pooled connection on the blocking thread pool.
pub async fn with_conn<T, F>(state: &Arc<AppState>, f: F) -> Result<T, PipelineError>
where
    T: Send + 'static,
    F: FnOnce(&mut PgConnection) -> Result<T, PipelineError> + Send + 'static,
{
    let state = state.clone();
    task::spawn_blocking(move || {
        let mut conn = state
            .db()
            .map_err(|err| PipelineError::Database(err.to_string()))?;
        f(&mut conn)
    })
    .await
    .map_err(|err| PipelineError::Database(format!("database task panicked: {err}")))?
}

pub struct Worker {
    state: Arc<AppState>,
    handlers: HashMap<&'static str, Arc<dyn JobHandler>>,
    poll_interval: Duration,
    concurrency: usize,
}

impl Worker {
    pub fn new(
        state: Arc<AppState>,
        handlers: Vec<Arc<dyn JobHandler>>,
        poll_interval: Duration,
        concurrency: usize,
    ) -> Self {
        let mut map = HashMap::new();
        for handler in handlers {
            for candidate in handler.candidate_types() {
                map.insert(*candidate, handler.clone());
            }
        }
        Self {
            state,
            handlers: map,
            poll_interval,
            concurrency: concurrency.max(1),
        }
    }

    /// Runs `concurrency` claim loops plus the stale-job reaper until the
    /// future is dropped.
    pub async fn run(self: Arc<Self>) {
        info!(concurrency = self.concurrency, "worker started");
        let mut loops = JoinSet::new();

        for slot in 0..self.concurrency {
            let worker = self.clone();
            loops.spawn(async move { worker.claim_loop(slot).await });
        }
        let reaper = self.clone();
        loops.spawn(async move { reaper.reap_loop().await });

        while let Some(joined) = loops.join_next().await {
            if let Err(err) = joined {
                error!(error = %err, "worker loop exited unexpectedly");
            }
        }
    }

    async fn claim_loop(&self, slot: usize) {
        loop {
            match self.tick().await {
                Ok(true) => {}
                Ok(false) => sleep(self.poll_interval).await,
                Err(err) => {
                    error!(slot, error = %err, "worker tick failed");
                    sleep(self.poll_interval).await;
                }
            }
        }
    }

    async fn reap_loop(&self) {
        let lease = Duration::from_secs(self.state.config.job_lease_seconds.max(1) as u64);
        loop {
            match with_conn(&self.state, move |conn| Ok(requeue_stale_jobs(conn, lease)?)).await {
                Ok(0) => {}
                Ok(count) => warn!(count, "requeued jobs whose lease expired"),
                Err(err) => error!(error = %err, "failed to requeue stale jobs"),
            }
            sleep(REAP_INTERVAL).await;
        }
    }

    /// Claims and processes at most one job. Returns whether a job was found.
    pub async fn tick(&self) -> Result<bool, PipelineError> {
        let candidate_types: Vec<&'static str> = self.handlers.keys().copied().collect();
        if candidate_types.is_empty() {
            return Ok(false);
        }

        let job_opt = with_conn(&self.state, move |conn| {
            Ok(claim_job(conn, &candidate_types)?)
        })
        .await?;

        let Some(job) = job_opt else {
            return Ok(false);
        };

        let Some(handler) = self.handlers.get(job.candidate_type.as_str()).cloned() else {
            error!(job_id = %job.id, candidate_type = %job.candidate_type, "no handler registered for candidate type");
            self.settle(&job, unhandled(&job)).await?;
            return Ok(true);
        };

        info!(job_id = %job.id, file_id = %job.file_id, attempts = job.attempts, "processing document job");
        let result = handler.handle(self.state.clone(), job.clone()).await;
        self.settle(&job, result).await?;
        Ok(true)
    }

    async fn settle(&self, job: &DocumentJob, result: JobExecution) -> Result<(), PipelineError> {
        let job_id = job.id;
        match result {
            JobExecution::Success => {
                let version = self.state.pipeline_version();
                with_conn(&self.state, move |conn| Ok(mark_succeeded(conn, job_id, &version)?)).await?;
                info!(%job_id, "document job succeeded");
            }
            JobExecution::Skipped => {
                with_conn(&self.state, move |conn| Ok(mark_skipped(conn, job_id)?)).await?;
                info!(%job_id, "document already processed; skipping");
            }
            JobExecution::Retry { error } => {
                let failure = JobFailure::from(&error);
                let policy = self.state.retry_policy;
                let recorded = with_conn(&self.state, move |conn| {
                    Ok(record_failure(conn, job_id, &failure, &policy)?)
                })
                .await?;

                if recorded.outcome.is_dead_letter() {
                    error!(
                        %job_id,
                        file_id = %job.file_id,
                        attempts = recorded.attempts,
                        code = %error.code(),
                        error = %error,
                        "document job dead-lettered"
                    );
                } else {
                    warn!(
                        %job_id,
                        file_id = %job.file_id,
                        attempts = recorded.attempts,
                        delay_ms = recorded.outcome.delay_ms(),
                        code = %error.code(),
                        error = %error,
                        "document job will retry"
                    );
                }
            }
            JobExecution::Rejected { error } => {
                let failure = JobFailure::from(&error);
                with_conn(&self.state, move |conn| Ok(mark_rejected(conn, job_id, &failure)?)).await?;
                warn!(%job_id, file_id = %job.file_id, code = %error.code(), error = %error, "document job rejected");
            }
        }
        Ok(())
    }
}

/// A claimed job nobody can process ends as a permanent failure rather than
/// waiting for the lease reaper.
fn unhandled(job: &DocumentJob) -> JobExecution {
    JobExecution::Rejected {
        error: PipelineError::UnsupportedDocument(format!(
            "no handler for candidate type '{}'",
            job.candidate_type
        )),
    }
}

pub fn default_handlers() -> Vec<Arc<dyn JobHandler>> {
    vec![Arc::new(extract::ExtractDocumentJob::new())]
}
