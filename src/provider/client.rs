use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use tracing::debug;

use crate::config::AppConfig;

use super::{
    DocumentEnvelope, ExtractionProvider, ProviderError, ProviderJob, SubmitReceipt, SubmitSource,
};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const USER_AGENT: &str = concat!("finsight/", env!("CARGO_PKG_VERSION"));

pub struct HttpExtractionProvider {
    http: Client,
    base_url: String,
    api_key: String,
}

impl HttpExtractionProvider {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Result<Self, ProviderError> {
        let http = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|err| ProviderError::Network(err.to_string()))?;

        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
        })
    }

    pub fn from_config(config: &AppConfig) -> Result<Self, ProviderError> {
        Self::new(&config.provider_base_url, &config.provider_api_key)
    }

    async fn send<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T, ProviderError> {
        let response = request
            .bearer_auth(&self.api_key)
            .send()
            .await
            .map_err(|err| ProviderError::Network(err.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return response
                .json::<T>()
                .await
                .map_err(|err| ProviderError::Decode(err.to_string()));
        }

        let body = response.text().await.unwrap_or_default();
        if status == StatusCode::NOT_FOUND {
            Err(ProviderError::NotFound { body })
        } else {
            Err(ProviderError::Http {
                status: status.as_u16(),
                body,
            })
        }
    }
}

#[async_trait]
impl ExtractionProvider for HttpExtractionProvider {
    async fn submit(
        &self,
        workflow_id: &str,
        source: SubmitSource,
    ) -> Result<SubmitReceipt, ProviderError> {
        let body = submit_body(workflow_id, &source);
        let url = format!("{}/document", self.base_url);
        debug!(%url, workflow_id, "submitting document to extraction provider");

        self.send(self.http.post(&url).json(&body))
            .await
            .map_err(classify_submit_error)
    }

    async fn job_status(&self, job_id: &str) -> Result<ProviderJob, ProviderError> {
        let url = format!("{}/job/{}", self.base_url, job_id);
        self.send(self.http.get(&url)).await
    }

    async fn fetch_document(&self, document_id: &str) -> Result<DocumentEnvelope, ProviderError> {
        let url = format!("{}/document/{}", self.base_url, document_id);
        self.send(self.http.get(&url)).await
    }
}

pub(crate) fn submit_body(workflow_id: &str, source: &SubmitSource) -> Value {
    let document = match source {
        SubmitSource::Inline {
            filename,
            content_type,
            bytes,
        } => json!({
            "filename": filename,
            "contentType": content_type,
            "base64": STANDARD.encode(bytes),
        }),
        SubmitSource::Url { filename, url } => json!({
            "filename": filename,
            "url": url,
        }),
    };

    json!({
        "workflowId": workflow_id,
        "document": document,
    })
}

/// Client errors on submit mean the provider will never accept this input;
/// timeouts and throttling stay transient.
pub(crate) fn classify_submit_error(err: ProviderError) -> ProviderError {
    match err {
        ProviderError::Http { status, body }
            if (400..500).contains(&status) && status != 408 && status != 429 =>
        {
            ProviderError::Rejected { status, body }
        }
        other => other,
    }
}
