use anyhow::{Context, Result};
use async_trait::async_trait;
use aws_config::meta::region::RegionProviderChain;
use aws_credential_types::Credentials;
use aws_sdk_s3::{
    config::{http::HttpResponse, Builder as S3ConfigBuilder, Region},
    error::{DisplayErrorContext, SdkError},
    primitives::ByteStream,
    Client as S3Client,
};
use bytes::Bytes;
use serde::Deserialize;

use super::{FolderRef, StorageBackend, StorageError, StorageProvider, StoredObject};

const PROVIDER: &str = "s3";

#[derive(Debug, Clone, Deserialize)]
pub struct S3Settings {
    pub bucket: String,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub endpoint_url: Option<String>,
    #[serde(default)]
    pub prefix: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct S3Secrets {
    pub access_key_id: String,
    pub secret_access_key: String,
}

pub async fn build_client(settings: &S3Settings, secrets: Option<&S3Secrets>) -> Result<S3Client> {
    let region = settings.region.clone().map(Region::new);
    let region_provider = RegionProviderChain::first_try(region)
        .or_default_provider()
        .or_else("us-east-1");

    #[allow(deprecated)]
    let mut loader = aws_config::from_env().region(region_provider);

    if let Some(endpoint) = &settings.endpoint_url {
        loader = loader.endpoint_url(endpoint);
    }

    if let Some(secrets) = secrets {
        let credentials = Credentials::new(
            secrets.access_key_id.clone(),
            secrets.secret_access_key.clone(),
            None,
            None,
            "storage-config",
        );
        loader = loader.credentials_provider(credentials);
    }

    let base_config = loader.load().await;
    let s3_config = S3ConfigBuilder::from(&base_config)
        .force_path_style(settings.endpoint_url.is_some())
        .build();

    Ok(S3Client::from_conf(s3_config))
}

pub struct S3Backend {
    client: S3Client,
    bucket: String,
    prefix: String,
}

impl S3Backend {
    pub fn new(client: S3Client, settings: &S3Settings) -> Self {
        Self {
            client,
            bucket: settings.bucket.clone(),
            prefix: settings
                .prefix
                .as_deref()
                .unwrap_or("")
                .trim_matches('/')
                .to_string(),
        }
    }

    pub async fn from_settings(settings: &S3Settings, secrets: Option<&S3Secrets>) -> Result<Self> {
        let client = build_client(settings, secrets)
            .await
            .context("failed to build S3 client")?;
        Ok(Self::new(client, settings))
    }

    fn object_key(&self, folder: &FolderRef, filename: &str) -> String {
        [self.prefix.as_str(), folder.id.as_str(), filename]
            .iter()
            .filter(|part| !part.is_empty())
            .copied()
            .collect::<Vec<_>>()
            .join("/")
    }
}

fn sdk_error<E>(err: SdkError<E, HttpResponse>) -> StorageError
where
    E: std::error::Error + Send + Sync + 'static,
{
    let status = err.raw_response().map(|response| response.status().as_u16());
    StorageError::Sdk {
        provider: PROVIDER,
        status,
        message: DisplayErrorContext(&err).to_string(),
    }
}

#[async_trait]
impl StorageBackend for S3Backend {
    fn provider(&self) -> StorageProvider {
        StorageProvider::S3
    }

    async fn probe(&self, _token: Option<&str>) -> Result<(), StorageError> {
        self.client
            .head_bucket()
            .bucket(&self.bucket)
            .send()
            .await
            .map_err(sdk_error)?;
        Ok(())
    }

    async fn ensure_folder(&self, _token: Option<&str>, path: &str) -> Result<FolderRef, StorageError> {
        let path = path.trim_matches('/').to_string();
        Ok(FolderRef {
            id: path.clone(),
            path,
        })
    }

    async fn upload(
        &self,
        _token: Option<&str>,
        folder: &FolderRef,
        filename: &str,
        bytes: Bytes,
        mime_type: &str,
    ) -> Result<StoredObject, StorageError> {
        let key = self.object_key(folder, filename);
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(&key)
            .content_type(mime_type)
            .content_disposition(format!("attachment; filename=\"{}\"", filename.replace('"', "")))
            .body(ByteStream::from(bytes))
            .send()
            .await
            .map_err(sdk_error)?;

        Ok(StoredObject {
            location_id: key.clone(),
            path: format!("{}/{}", self.bucket, key),
            url: None,
        })
    }

    async fn verify_exists(&self, _token: Option<&str>, location_id: &str) -> Result<bool, StorageError> {
        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(location_id)
            .send()
            .await
        {
            Ok(_) => Ok(true),
            Err(err)
                if err
                    .as_service_error()
                    .map_or(false, |service| service.is_not_found()) =>
            {
                Ok(false)
            }
            Err(err) => Err(sdk_error(err)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn settings_accept_minimal_config() {
        let settings: S3Settings =
            serde_json::from_value(serde_json::json!({"bucket": "intake", "prefix": "/docs/"})).unwrap();
        assert_eq!(settings.bucket, "intake");
        assert!(settings.region.is_none());
        assert_eq!(settings.prefix.as_deref(), Some("/docs/"));
    }
}
