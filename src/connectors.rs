use std::sync::Arc;

use async_trait::async_trait;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::mail::{GmailClient, MailClient, MailProvider, OutlookClient};
use crate::models::StorageConfig;
use crate::storage::gdrive::GoogleDriveSettings;
use crate::storage::onedrive::OneDriveSettings;
use crate::storage::s3::{S3Secrets, S3Settings};
use crate::storage::{
    GoogleDriveBackend, OneDriveBackend, S3Backend, StorageBackend, StorageError, StorageProvider,
};

#[derive(Debug, Clone)]
pub struct StorageTarget<'a> {
    pub config: &'a StorageConfig,
    pub provider: StorageProvider,
    pub secrets: Option<Value>,
}

#[async_trait]
pub trait Connectors: Send + Sync {
    fn mail_client(&self, provider: MailProvider) -> Arc<dyn MailClient>;

    async fn storage_backend(
        &self,
        target: &StorageTarget<'_>,
    ) -> Result<Arc<dyn StorageBackend>, StorageError>;
}

pub struct HttpConnectors {
    http: Client,
    gmail: Arc<GmailClient>,
    outlook: Arc<OutlookClient>,
}

impl HttpConnectors {
    pub fn new(http: Client) -> Self {
        Self {
            gmail: Arc::new(GmailClient::new(http.clone())),
            outlook: Arc::new(OutlookClient::new(http.clone())),
            http,
        }
    }
}

fn settings<T: DeserializeOwned + Default>(value: &Value) -> Result<T, StorageError> {
    if value.is_null() {
        return Ok(T::default());
    }
    serde_json::from_value(value.clone()).map_err(|err| StorageError::Config(err.to_string()))
}

#[async_trait]
impl Connectors for HttpConnectors {
    fn mail_client(&self, provider: MailProvider) -> Arc<dyn MailClient> {
        match provider {
            MailProvider::Gmail => self.gmail.clone(),
            MailProvider::Outlook => self.outlook.clone(),
        }
    }

    async fn storage_backend(
        &self,
        target: &StorageTarget<'_>,
    ) -> Result<Arc<dyn StorageBackend>, StorageError> {
        match target.provider {
            StorageProvider::S3 => {
                let s3_settings: S3Settings = serde_json::from_value(target.config.config.clone())
                    .map_err(|err| StorageError::Config(format!("s3 settings: {err}")))?;
                let secrets: Option<S3Secrets> = target
                    .secrets
                    .clone()
                    .map(serde_json::from_value)
                    .transpose()
                    .map_err(|err| StorageError::Config(format!("s3 credentials: {err}")))?;
                let backend = S3Backend::from_settings(&s3_settings, secrets.as_ref())
                    .await
                    .map_err(|err| StorageError::Config(format!("{err:#}")))?;
                Ok(Arc::new(backend))
            }
            StorageProvider::OneDrive => {
                let drive: OneDriveSettings = settings(&target.config.config)?;
                Ok(Arc::new(OneDriveBackend::new(self.http.clone(), &drive)))
            }
            StorageProvider::GoogleDrive => {
                let drive: GoogleDriveSettings = settings(&target.config.config)?;
                Ok(Arc::new(GoogleDriveBackend::new(self.http.clone(), &drive)))
            }
            other => Err(StorageError::Unsupported(other)),
        }
    }
}
