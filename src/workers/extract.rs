use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use diesel::Connection;
use tokio::task;
use tracing::{debug, info, warn};

use super::{
    persist::{latest_insight, save_insight, PreparedInsight, SaveOutcome},
    with_conn, JobExecution, JobHandler,
};
use crate::{
    accounts::{identity_from_statement, resolve_account},
    analytics::{self, RebuildRequest, SnapshotStatus},
    config::SubmitMode,
    error::PipelineError,
    extract::{classify_text, document_is_pdf, ExtractError},
    jobs::{
        is_skippable, mark_upload_started, mark_uploaded, update_candidate_type,
        CANDIDATE_BANK_STATEMENT, CANDIDATE_PAYSLIP, CANDIDATE_UNKNOWN, STAGE_SUCCEEDED,
    },
    models::DocumentJob,
    normalize::{
        content_hash, join_issues, normalize_payslip, normalize_statement, DocumentKind,
        NormalizeContext, Normalized, ValidationIssue,
    },
    provider::{fetch_result, poll_job, PollOptions, ProviderDocument, SubmitSource},
    state::AppState,
    storage::content_digest,
};

const PRESIGN_TTL: Duration = Duration::from_secs(15 * 60);

/// Submits a stored upload to the extraction provider and turns the result
/// into an insight, account aliases and a refreshed monthly snapshot.
#[derive(Debug, Default, Clone, Copy)]
pub struct ExtractDocumentJob;

impl ExtractDocumentJob {
    pub fn new() -> Self {
        Self
    }
}

enum Processed {
    Completed,
    Skipped,
}

#[async_trait]
impl JobHandler for ExtractDocumentJob {
    fn candidate_types(&self) -> &'static [&'static str] {
        &[CANDIDATE_PAYSLIP, CANDIDATE_BANK_STATEMENT, CANDIDATE_UNKNOWN]
    }

    async fn handle(&self, state: Arc<AppState>, job: DocumentJob) -> JobExecution {
        match process(&state, &job).await {
            Ok(Processed::Completed) => JobExecution::Success,
            Ok(Processed::Skipped) => JobExecution::Skipped,
            Err(err) => JobExecution::from(err),
        }
    }
}

async fn process(state: &Arc<AppState>, job: &DocumentJob) -> Result<Processed, PipelineError> {
    let (user_id, file_id) = (job.user_id, job.file_id);
    let previous = with_conn(state, move |conn| Ok(latest_insight(conn, user_id, file_id)?)).await?;
    if is_skippable(job, previous.as_ref()) {
        return Ok(Processed::Skipped);
    }

    let mut kind = DocumentKind::from_catalogue_key(&job.candidate_type);
    let document = match resumable_provider_job(job) {
        Some((document_id, provider_job_id)) => {
            debug!(job_id = %job.id, %provider_job_id, "resuming provider job");
            await_document(state, document_id, provider_job_id).await?
        }
        None => {
            let bytes = load_upload(state, job).await?;
            if kind.is_none() && document_is_pdf(job.content_type.as_deref(), &job.original_name) {
                kind = preflight(state, bytes.clone()).await?;
                if let Some(found) = kind {
                    record_kind(state, job, found).await?;
                }
            }
            submit_and_wait(state, job, bytes).await?
        }
    };

    let kind = match kind {
        Some(kind) => kind,
        None => {
            let found = document
                .document_type
                .as_deref()
                .and_then(DocumentKind::from_catalogue_key)
                .ok_or_else(|| {
                    PipelineError::UnsupportedDocument(
                        document
                            .document_type
                            .clone()
                            .unwrap_or_else(|| "unclassified".to_string()),
                    )
                })?;
            record_kind(state, job, found).await?;
            found
        }
    };

    let prepared = prepare_insight(state, job, kind, &document)?;
    store_results(state, job, prepared).await?;
    Ok(Processed::Completed)
}

/// A job that already handed its document to the provider re-polls the same
/// provider job instead of uploading again.
fn resumable_provider_job(job: &DocumentJob) -> Option<(String, String)> {
    if job.upload_state != STAGE_SUCCEEDED {
        return None;
    }
    match (&job.provider_document_id, &job.provider_job_id) {
        (Some(document_id), Some(job_id)) => Some((document_id.clone(), job_id.clone())),
        _ => None,
    }
}

async fn load_upload(state: &Arc<AppState>, job: &DocumentJob) -> Result<Vec<u8>, PipelineError> {
    let bytes = state
        .storage
        .get_object(&job.storage_key)
        .await
        .map_err(|err| PipelineError::Storage(format!("{err:#}")))?;

    if bytes.is_empty() {
        return Err(PipelineError::CorruptFile("upload is empty".into()));
    }
    let digest = content_digest(&bytes);
    if digest != job.content_hash {
        return Err(PipelineError::Storage(format!(
            "stored object hash {digest} does not match upload hash {}",
            job.content_hash
        )));
    }
    Ok(bytes)
}

/// Reads the PDF text locally to reject unreadable files early and to guess
/// the document kind for uploads that arrived without one.
async fn preflight(
    state: &Arc<AppState>,
    bytes: Vec<u8>,
) -> Result<Option<DocumentKind>, PipelineError> {
    let extractor = state.extractor.clone();
    let extracted = task::spawn_blocking(move || extractor.extract_text(&bytes))
        .await
        .map_err(|err| PipelineError::Storage(format!("text extraction task failed: {err}")))?;

    match extracted {
        Ok(text) => Ok(classify_text(&text.full_text)),
        Err(ExtractError::Unreadable(reason)) => Err(PipelineError::CorruptFile(reason)),
        Err(err) => {
            debug!(error = %err, "pre-flight text unavailable; deferring to provider classification");
            Ok(None)
        }
    }
}

async fn record_kind(
    state: &Arc<AppState>,
    job: &DocumentJob,
    kind: DocumentKind,
) -> Result<(), PipelineError> {
    if job.candidate_type == kind.catalogue_key() {
        return Ok(());
    }
    let job_id = job.id;
    info!(%job_id, candidate_type = kind.catalogue_key(), "classified upload");
    with_conn(state, move |conn| {
        Ok(update_candidate_type(conn, job_id, kind.catalogue_key())?)
    })
    .await
}

async fn submit_and_wait(
    state: &Arc<AppState>,
    job: &DocumentJob,
    bytes: Vec<u8>,
) -> Result<ProviderDocument, PipelineError> {
    let job_id = job.id;
    with_conn(state, move |conn| Ok(mark_upload_started(conn, job_id)?)).await?;

    let source = match state.config.provider_submit_mode {
        SubmitMode::Inline => SubmitSource::Inline {
            filename: job.original_name.clone(),
            content_type: job.content_type.clone(),
            bytes,
        },
        SubmitMode::Url => {
            let url = state
                .storage
                .presign_get_object(&job.storage_key, PRESIGN_TTL)
                .await
                .map_err(|err| PipelineError::Storage(format!("{err:#}")))?;
            SubmitSource::Url {
                filename: job.original_name.clone(),
                url,
            }
        }
    };

    let receipt = state
        .provider
        .submit(&state.config.provider_workflow_id, source)
        .await?;
    info!(
        %job_id,
        provider_document_id = %receipt.document_id,
        provider_job_id = %receipt.job_id,
        "document submitted to provider"
    );

    let (document_id, provider_job_id) = (receipt.document_id.clone(), receipt.job_id.clone());
    with_conn(state, move |conn| {
        Ok(mark_uploaded(conn, job_id, &document_id, &provider_job_id)?)
    })
    .await?;

    await_document(state, receipt.document_id, receipt.job_id).await
}

async fn await_document(
    state: &Arc<AppState>,
    document_id: String,
    provider_job_id: String,
) -> Result<ProviderDocument, PipelineError> {
    let options = PollOptions {
        interval: state.config.poll_interval(),
        timeout: state.config.poll_timeout(),
    };
    let finished = poll_job(state.provider.as_ref(), &provider_job_id, options).await?;
    let document_id = finished.document_id.unwrap_or(document_id);
    Ok(fetch_result(state.provider.as_ref(), &document_id).await?)
}

fn prepare_insight(
    state: &Arc<AppState>,
    job: &DocumentJob,
    kind: DocumentKind,
    document: &ProviderDocument,
) -> Result<PreparedInsight, PipelineError> {
    let ctx = NormalizeContext {
        pepper: &state.config.pii_hash_pepper,
    };
    let hash = content_hash(&document.data, &state.pipeline_version());
    let encode = |err: serde_json::Error| PipelineError::InvalidExtraction(err.to_string());

    match kind {
        DocumentKind::Payslip => {
            let metrics = complete(normalize_payslip(&document.data, &ctx))?;
            metrics.validate().map_err(rejected_metrics)?;
            PreparedInsight::from_payslip(job, &metrics, hash).map_err(encode)
        }
        DocumentKind::BankStatement => {
            let metrics = complete(normalize_statement(&document.data, &ctx))?;
            if let Err(issues) = metrics.validate() {
                if let Some((expected, computed)) = metrics.balance_discrepancy() {
                    return Err(PipelineError::BalanceMismatch { expected, computed });
                }
                return Err(rejected_metrics(issues));
            }
            PreparedInsight::from_statement(job, &metrics, hash).map_err(encode)
        }
    }
}

fn complete<T>(normalized: Normalized<T>) -> Result<T, PipelineError> {
    match normalized {
        Normalized::Complete(metrics) => Ok(metrics),
        Normalized::Incomplete { missing } => Err(PipelineError::IncompleteExtraction {
            missing: missing.into_iter().map(str::to_string).collect(),
        }),
    }
}

fn rejected_metrics(issues: Vec<ValidationIssue>) -> PipelineError {
    warn!(issues = %join_issues(&issues), "extraction failed validation");
    PipelineError::InvalidExtraction(join_issues(&issues))
}

async fn store_results(
    state: &Arc<AppState>,
    job: &DocumentJob,
    prepared: PreparedInsight,
) -> Result<(), PipelineError> {
    let job_id = job.id;
    let user_id = job.user_id;

    let saved = with_conn(state, move |conn| {
        conn.transaction::<_, PipelineError, _>(|conn| {
            let saved = save_insight(conn, &prepared)?;
            if prepared.kind == DocumentKind::BankStatement {
                let metrics = serde_json::from_value(prepared.metrics_v1.clone())
                    .map_err(|err| PipelineError::InvalidExtraction(err.to_string()))?;
                let identity = identity_from_statement(&metrics)?;
                let account = resolve_account(conn, user_id, &identity)?;
                debug!(%job_id, account_id = %account.id, "statement linked to account");
            }
            Ok(saved)
        })
    })
    .await?;

    match &saved {
        SaveOutcome::Inserted(insight) => info!(%job_id, insight_id = %insight.id, "insight stored"),
        SaveOutcome::Repaired(insight) => info!(%job_id, insight_id = %insight.id, "incomplete insight repaired"),
        SaveOutcome::Unchanged(insight) => {
            debug!(%job_id, insight_id = %insight.id, "identical insight already stored")
        }
    }

    let insight = saved.insight();
    let request = RebuildRequest {
        period_month: insight.document_month.clone(),
        period_year: None,
        pay_date: insight.document_date.clone(),
        file_id: Some(insight.file_id),
    };
    let outcome = with_conn(state, move |conn| Ok(analytics::rebuild(conn, user_id, &request)?)).await?;

    if outcome.status == SnapshotStatus::Failed {
        return Err(PipelineError::AnalyticsGuard(
            outcome.reason.unwrap_or_else(|| "snapshot rebuild failed".to_string()),
        ));
    }
    Ok(())
}
