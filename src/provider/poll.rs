use std::time::Duration;

use tokio::time::{sleep, Instant};
use tracing::debug;

use super::{ExtractionProvider, ProviderDocument, ProviderError, ProviderJob, ProviderJobStatus};

const DELAY_CEILING_FLOOR: Duration = Duration::from_millis(8000);

#[derive(Debug, Clone, Copy)]
pub struct PollOptions {
    pub interval: Duration,
    pub timeout: Duration,
}

/// Linear growth by `interval`, capped at `max(interval * 4, 8s)`.
pub fn next_poll_delay(previous: Duration, interval: Duration) -> Duration {
    let ceiling = (interval * 4).max(DELAY_CEILING_FLOOR);
    (previous + interval).min(ceiling)
}

/// Polls a provider job until it reaches a terminal status.
///
/// A 404 on the very first poll means the provider accepted the job but has
/// not indexed it for reads yet, so it is retried like a queued job. Any later
/// 404 is returned to the caller.
pub async fn poll_job(
    provider: &dyn ExtractionProvider,
    job_id: &str,
    options: PollOptions,
) -> Result<ProviderJob, ProviderError> {
    let started = Instant::now();
    let mut delay = options.interval;
    let mut attempt: u32 = 0;

    loop {
        attempt += 1;
        match provider.job_status(job_id).await {
            Ok(job) => match job.status {
                ProviderJobStatus::Completed => return Ok(job),
                ProviderJobStatus::Failed => {
                    let detail = job
                        .error
                        .as_ref()
                        .map(|err| err.to_string())
                        .unwrap_or_else(|| "no error detail".to_string());
                    return Err(ProviderError::JobFailed {
                        job_id: job_id.to_string(),
                        detail,
                    });
                }
                status => debug!(job_id, attempt, ?status, "provider job not finished"),
            },
            Err(ProviderError::NotFound { .. }) if attempt == 1 => {
                debug!(job_id, "provider job not yet indexed; retrying");
            }
            Err(err) => return Err(err),
        }

        let elapsed = started.elapsed();
        if elapsed >= options.timeout {
            return Err(ProviderError::Timeout {
                job_id: job_id.to_string(),
                elapsed_ms: elapsed.as_millis() as u64,
            });
        }

        // The last wait ends at the deadline, not past it.
        sleep(delay.min(options.timeout - elapsed)).await;
        delay = next_poll_delay(delay, options.interval);
    }
}

pub async fn fetch_result(
    provider: &dyn ExtractionProvider,
    document_id: &str,
) -> Result<ProviderDocument, ProviderError> {
    provider.fetch_document(document_id).await?.into_document()
}
