use anyhow::Result;
use aws_config::{BehaviorVersion, SdkConfig};
use aws_credential_types::Credentials;
use aws_sdk_s3::{
    config::{Builder as S3ConfigBuilder, Region},
    Client as S3Client,
};
use tracing::debug;

use crate::{config::AppConfig, storage::S3Storage};

/// Storage for uploaded documents in the configured bucket.
pub async fn connect_storage(config: &AppConfig) -> Result<S3Storage> {
    let client = build_client(config).await?;
    Ok(S3Storage::new(client, config.s3_bucket.clone()))
}

async fn build_client(config: &AppConfig) -> Result<S3Client> {
    let sdk_config = load_sdk_config(config).await;
    // Path-style keeps presigned URLs valid against MinIO and other
    // S3-compatible endpoints.
    let s3_config = S3ConfigBuilder::from(&sdk_config)
        .force_path_style(config.aws_endpoint_url.is_some())
        .build();

    Ok(S3Client::from_conf(s3_config))
}

async fn load_sdk_config(config: &AppConfig) -> SdkConfig {
    let mut loader = aws_config::defaults(BehaviorVersion::latest())
        .region(Region::new(config.aws_region.clone()));

    if let Some(endpoint) = &config.aws_endpoint_url {
        debug!(%endpoint, bucket = %config.s3_bucket, "using custom object storage endpoint");
        loader = loader.endpoint_url(endpoint);
    }

    if let (Some(access_key), Some(secret_key)) = (
        config.aws_access_key_id.clone(),
        config.aws_secret_access_key.clone(),
    ) {
        loader = loader.credentials_provider(Credentials::new(
            access_key,
            secret_key,
            None,
            None,
            "finsight-env",
        ));
    }

    loader.load().await
}
