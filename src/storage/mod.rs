use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::ErrorCategory;
use crate::remote::ProviderError;
use crate::tokens::store::{CredentialSink, TokenHandle};
use crate::tokens::{OAuthProvider, TokenError, TokenManager};

pub mod gdrive;
pub mod onedrive;
pub mod s3;

pub use gdrive::GoogleDriveBackend;
pub use onedrive::OneDriveBackend;
pub use s3::S3Backend;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StorageProvider {
    S3,
    OneDrive,
    GoogleDrive,
    SharePoint,
    AzureBlob,
}

impl StorageProvider {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "s3" | "object_storage" | "supabase" => Some(StorageProvider::S3),
            "onedrive" => Some(StorageProvider::OneDrive),
            "google_drive" | "gdrive" => Some(StorageProvider::GoogleDrive),
            "sharepoint" => Some(StorageProvider::SharePoint),
            "azure_blob" | "azure" => Some(StorageProvider::AzureBlob),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StorageProvider::S3 => "s3",
            StorageProvider::OneDrive => "onedrive",
            StorageProvider::GoogleDrive => "google_drive",
            StorageProvider::SharePoint => "sharepoint",
            StorageProvider::AzureBlob => "azure_blob",
        }
    }

    pub fn oauth_provider(&self) -> Option<OAuthProvider> {
        match self {
            StorageProvider::OneDrive | StorageProvider::SharePoint => {
                Some(OAuthProvider::Microsoft)
            }
            StorageProvider::GoogleDrive => Some(OAuthProvider::Google),
            StorageProvider::S3 | StorageProvider::AzureBlob => None,
        }
    }

    pub fn has_adapter(&self) -> bool {
        matches!(
            self,
            StorageProvider::S3 | StorageProvider::OneDrive | StorageProvider::GoogleDrive
        )
    }
}

impl fmt::Display for StorageProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FolderRef {
    pub id: String,
    pub path: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredObject {
    pub location_id: String,
    pub path: String,
    pub url: Option<String>,
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error("{provider} error: {message}")]
    Sdk {
        provider: &'static str,
        status: Option<u16>,
        message: String,
    },
    #[error("storage provider {0} has no upload adapter")]
    Unsupported(StorageProvider),
    #[error("storage config is misconfigured: {0}")]
    Config(String),
    #[error(transparent)]
    Token(#[from] TokenError),
    #[error("storage destination unavailable for this run: {reason}")]
    Unavailable {
        category: ErrorCategory,
        reason: String,
    },
}

impl StorageError {
    pub fn status(&self) -> Option<u16> {
        match self {
            StorageError::Provider(err) => err.status(),
            StorageError::Sdk { status, .. } => *status,
            _ => None,
        }
    }

    pub fn is_unauthorized(&self) -> bool {
        self.status() == Some(401)
    }

    /// The error later attachments see once this one has taken the
    /// destination out for the run.
    pub fn unavailable(&self) -> StorageError {
        match self {
            StorageError::Unavailable { category, reason } => StorageError::Unavailable {
                category: *category,
                reason: reason.clone(),
            },
            other => StorageError::Unavailable {
                category: other.category(),
                reason: other.to_string(),
            },
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            StorageError::Provider(err) => err.category(),
            StorageError::Unavailable { category, .. } => *category,
            StorageError::Token(_) => ErrorCategory::Token,
            StorageError::Unsupported(_) | StorageError::Config(_) => ErrorCategory::Validation,
            _ => ErrorCategory::categorize(self.status(), &self.to_string()),
        }
    }
}

/// One storage provider's native API. Token-less providers receive `None`.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    fn provider(&self) -> StorageProvider;

    async fn probe(&self, token: Option<&str>) -> Result<(), StorageError>;

    /// Creates missing folders segment by segment. Safe to call repeatedly.
    async fn ensure_folder(&self, token: Option<&str>, path: &str) -> Result<FolderRef, StorageError>;

    async fn upload(
        &self,
        token: Option<&str>,
        folder: &FolderRef,
        filename: &str,
        bytes: Bytes,
        mime_type: &str,
    ) -> Result<StoredObject, StorageError>;

    async fn verify_exists(&self, token: Option<&str>, location_id: &str) -> Result<bool, StorageError>;
}

/// Ordered from best to worst; verification may only move a document
/// towards `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationStatus {
    Verified,
    Unverified,
    Failed,
}

impl VerificationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            VerificationStatus::Verified => "verified",
            VerificationStatus::Unverified => "unverified",
            VerificationStatus::Failed => "failed",
        }
    }

    pub fn downgrade(self, observed: VerificationStatus) -> VerificationStatus {
        self.max(observed)
    }
}

#[derive(Debug, Clone)]
pub struct UploadOutcome {
    pub object: StoredObject,
    pub folder_path: String,
    pub verification: VerificationStatus,
}

#[derive(Debug)]
enum SessionState {
    Unprobed,
    Ready,
    Failed(StorageError),
}

pub struct StorageSession {
    config_id: Uuid,
    backend: Arc<dyn StorageBackend>,
    token: Option<TokenHandle>,
    access: Option<String>,
    folders: HashMap<String, FolderRef>,
    state: SessionState,
}

impl StorageSession {
    pub fn new(config_id: Uuid, backend: Arc<dyn StorageBackend>, token: Option<TokenHandle>) -> Self {
        Self {
            config_id,
            backend,
            token,
            access: None,
            folders: HashMap::new(),
            state: SessionState::Unprobed,
        }
    }

    pub fn provider(&self) -> StorageProvider {
        self.backend.provider()
    }

    pub fn config_id(&self) -> Uuid {
        self.config_id
    }

    /// Validates the token and probes the backend once per run. A 401 on the
    /// probe gets one refresh and one more probe; a second failure
    /// deactivates the config.
    pub async fn prepare(
        &mut self,
        manager: &TokenManager,
        sink: &dyn CredentialSink,
    ) -> Result<(), StorageError> {
        match &self.state {
            SessionState::Ready => return Ok(()),
            SessionState::Failed(err) => return Err(err.unavailable()),
            SessionState::Unprobed => {}
        }

        if let Some(handle) = self.token.as_mut() {
            match handle.ensure_valid(manager, sink).await {
                Ok(token) => self.access = Some(token),
                Err(err) => return Err(self.fail(err.into())),
            }
        }

        let first = self.backend.probe(self.access.as_deref()).await;
        let result = match first {
            Err(err) if err.is_unauthorized() && self.token.is_some() => {
                warn!(config_id = %self.config_id, "storage probe rejected token; refreshing");
                match self.refresh(manager, sink).await {
                    Ok(()) => match self.backend.probe(self.access.as_deref()).await {
                        Err(err) if err.is_unauthorized() => {
                            Err(self.quarantine_rejected(sink, &err))
                        }
                        other => other,
                    },
                    Err(err) => Err(err),
                }
            }
            other => other,
        };

        match result {
            Ok(()) => {
                debug!(config_id = %self.config_id, provider = %self.provider(), "storage probe ok");
                self.state = SessionState::Ready;
                Ok(())
            }
            Err(err) => Err(self.fail(err)),
        }
    }

    /// Ensures the folder, uploads and verifies. A 401 from the folder walk
    /// or the upload gets one refresh and one retry.
    pub async fn store(
        &mut self,
        manager: &TokenManager,
        sink: &dyn CredentialSink,
        folder_path: &str,
        filename: &str,
        bytes: Bytes,
        mime_type: &str,
    ) -> Result<UploadOutcome, StorageError> {
        self.prepare(manager, sink).await?;

        let mut refreshed = false;
        let object = loop {
            match self.attempt_upload(folder_path, filename, bytes.clone(), mime_type).await {
                Ok(object) => break object,
                Err(err) if err.is_unauthorized() && self.token.is_some() && !refreshed => {
                    warn!(config_id = %self.config_id, "upload rejected token; refreshing");
                    if let Err(refresh_err) = self.refresh(manager, sink).await {
                        return Err(self.fail(refresh_err));
                    }
                    refreshed = true;
                }
                Err(err) if err.is_unauthorized() && self.token.is_some() => {
                    let err = self.quarantine_rejected(sink, &err);
                    return Err(self.fail(err));
                }
                Err(err) => return Err(err),
            }
        };

        let verification = self.verify(&object).await;
        info!(
            config_id = %self.config_id,
            provider = %self.provider(),
            location = %object.location_id,
            verification = verification.as_str(),
            "stored attachment"
        );

        Ok(UploadOutcome {
            object,
            folder_path: folder_path.to_string(),
            verification,
        })
    }

    async fn attempt_upload(
        &mut self,
        folder_path: &str,
        filename: &str,
        bytes: Bytes,
        mime_type: &str,
    ) -> Result<StoredObject, StorageError> {
        let folder = match self.folders.get(folder_path) {
            Some(folder) => folder.clone(),
            None => {
                let folder = self
                    .backend
                    .ensure_folder(self.access.as_deref(), folder_path)
                    .await?;
                self.folders.insert(folder_path.to_string(), folder.clone());
                folder
            }
        };
        self.backend
            .upload(self.access.as_deref(), &folder, filename, bytes, mime_type)
            .await
    }

    async fn verify(&self, object: &StoredObject) -> VerificationStatus {
        let observed = match self
            .backend
            .verify_exists(self.access.as_deref(), &object.location_id)
            .await
        {
            Ok(true) => VerificationStatus::Verified,
            Ok(false) => {
                warn!(location = %object.location_id, "uploaded object not found on verification");
                VerificationStatus::Failed
            }
            Err(err) => {
                warn!(location = %object.location_id, error = %err, "upload verification failed");
                VerificationStatus::Unverified
            }
        };
        VerificationStatus::Verified.downgrade(observed)
    }

    async fn refresh(
        &mut self,
        manager: &TokenManager,
        sink: &dyn CredentialSink,
    ) -> Result<(), StorageError> {
        let handle = self
            .token
            .as_mut()
            .ok_or_else(|| StorageError::Config("no OAuth credentials to refresh".into()))?;
        let token = handle.refresh_after_rejection(manager, sink).await?;
        self.access = Some(token);
        Ok(())
    }

    fn quarantine_rejected(&mut self, sink: &dyn CredentialSink, err: &StorageError) -> StorageError {
        match self.token.as_mut() {
            Some(handle) => handle.quarantine_rejected(sink, &err.to_string()).into(),
            None => err.unavailable(),
        }
    }

    fn fail(&mut self, err: StorageError) -> StorageError {
        warn!(config_id = %self.config_id, error = %err, "storage destination unavailable");
        self.state = SessionState::Failed(err.unavailable());
        err
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use super::*;
    use crate::tokens::store::tests::{handle, RecordingSink};
    use crate::tokens::tests::{ScriptedRefresher, GOOD_REFRESH, MS_ACCESS};

    const REFRESHED_MS_ACCESS: &str = "eyJhbGciOiJub25lIn0.eyJzdWIiOiJ5In0.sig2";

    fn unauthorized() -> StorageError {
        StorageError::Provider(ProviderError::Http {
            provider: "onedrive",
            status: 401,
            body: "InvalidAuthenticationToken".into(),
        })
    }

    /// Fails the first `upload_failures` uploads with 401 and records the
    /// token each call used.
    struct FakeBackend {
        upload_failures: AtomicUsize,
        probe_failures: AtomicUsize,
        tokens_seen: Mutex<Vec<Option<String>>>,
        exists: bool,
        probe_status: Option<u16>,
    }

    impl FakeBackend {
        fn new(probe_failures: usize, upload_failures: usize) -> Self {
            Self {
                upload_failures: AtomicUsize::new(upload_failures),
                probe_failures: AtomicUsize::new(probe_failures),
                tokens_seen: Mutex::new(Vec::new()),
                exists: true,
                probe_status: None,
            }
        }

        fn take(counter: &AtomicUsize) -> bool {
            counter
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
        }
    }

    #[async_trait]
    impl StorageBackend for FakeBackend {
        fn provider(&self) -> StorageProvider {
            StorageProvider::OneDrive
        }

        async fn probe(&self, _token: Option<&str>) -> Result<(), StorageError> {
            if Self::take(&self.probe_failures) {
                return Err(unauthorized());
            }
            if let Some(status) = self.probe_status {
                return Err(StorageError::Sdk {
                    provider: "onedrive",
                    status: Some(status),
                    message: format!("probe failed with {status}"),
                });
            }
            Ok(())
        }

        async fn ensure_folder(&self, _token: Option<&str>, path: &str) -> Result<FolderRef, StorageError> {
            Ok(FolderRef {
                id: format!("folder:{path}"),
                path: path.to_string(),
            })
        }

        async fn upload(
            &self,
            token: Option<&str>,
            folder: &FolderRef,
            filename: &str,
            _bytes: Bytes,
            _mime_type: &str,
        ) -> Result<StoredObject, StorageError> {
            self.tokens_seen.lock().unwrap().push(token.map(str::to_string));
            if Self::take(&self.upload_failures) {
                return Err(unauthorized());
            }
            Ok(StoredObject {
                location_id: "item-1".into(),
                path: format!("{}/{}", folder.path, filename),
                url: None,
            })
        }

        async fn verify_exists(&self, _token: Option<&str>, _location_id: &str) -> Result<bool, StorageError> {
            Ok(self.exists)
        }
    }

    fn session(backend: Arc<FakeBackend>) -> StorageSession {
        StorageSession::new(
            Uuid::new_v4(),
            backend,
            Some(handle(OAuthProvider::Microsoft, MS_ACCESS, GOOD_REFRESH)),
        )
    }

    #[tokio::test]
    async fn upload_401_refreshes_once_and_retries() {
        let backend = Arc::new(FakeBackend::new(0, 1));
        let refresher = Arc::new(ScriptedRefresher::granting(REFRESHED_MS_ACCESS));
        let manager = TokenManager::new(refresher.clone());
        let sink = RecordingSink::default();
        let mut session = session(backend.clone());

        let outcome = session
            .store(&manager, &sink, "Clients/Bob", "w2.pdf", Bytes::from_static(b"%PDF"), "application/pdf")
            .await
            .unwrap();

        assert_eq!(outcome.verification, VerificationStatus::Verified);
        assert_eq!(outcome.object.path, "Clients/Bob/w2.pdf");
        assert_eq!(refresher.calls.load(Ordering::SeqCst), 1);
        assert!(sink.quarantined.lock().unwrap().is_empty());
        let seen = backend.tokens_seen.lock().unwrap();
        assert_eq!(seen[0].as_deref(), Some(MS_ACCESS));
        assert_eq!(seen[1].as_deref(), Some(REFRESHED_MS_ACCESS));
    }

    #[tokio::test]
    async fn repeated_probe_401_deactivates_config_for_the_batch() {
        let backend = Arc::new(FakeBackend::new(2, 0));
        let manager = TokenManager::new(Arc::new(ScriptedRefresher::granting(REFRESHED_MS_ACCESS)));
        let sink = RecordingSink::default();
        let mut session = session(backend.clone());

        let first = session
            .store(&manager, &sink, "a", "1.pdf", Bytes::new(), "application/pdf")
            .await;
        assert!(matches!(first, Err(StorageError::Token(_))));

        let second = session
            .store(&manager, &sink, "a", "2.pdf", Bytes::new(), "application/pdf")
            .await;
        let second = second.unwrap_err();
        assert!(matches!(second, StorageError::Unavailable { .. }));
        assert_eq!(second.category(), ErrorCategory::Token);
        assert_eq!(sink.quarantined.lock().unwrap().len(), 1);
        assert!(backend.tokens_seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn missing_object_downgrades_verification() {
        let mut backend = FakeBackend::new(0, 0);
        backend.exists = false;
        let manager = TokenManager::new(Arc::new(ScriptedRefresher::new(Vec::new())));
        let sink = RecordingSink::default();
        let mut session = session(Arc::new(backend));

        let outcome = session
            .store(&manager, &sink, "a", "1.pdf", Bytes::new(), "application/pdf")
            .await
            .unwrap();
        assert_eq!(outcome.verification, VerificationStatus::Failed);
    }

    #[test]
    fn verification_never_upgrades() {
        assert_eq!(
            VerificationStatus::Unverified.downgrade(VerificationStatus::Verified),
            VerificationStatus::Unverified
        );
        assert_eq!(
            VerificationStatus::Verified.downgrade(VerificationStatus::Failed),
            VerificationStatus::Failed
        );
    }

    #[test]
    fn categorizes_storage_errors() {
        assert_eq!(unauthorized().category(), ErrorCategory::Token);
        assert_eq!(
            StorageError::Unsupported(StorageProvider::AzureBlob).category(),
            ErrorCategory::Validation
        );
        assert!(!StorageProvider::SharePoint.has_adapter());
    }

    #[tokio::test]
    async fn rate_limited_destination_keeps_its_category_for_later_attachments() {
        let mut backend = FakeBackend::new(0, 0);
        backend.probe_status = Some(429);
        let manager = TokenManager::new(Arc::new(ScriptedRefresher::new(Vec::new())));
        let sink = RecordingSink::default();
        let mut session = session(Arc::new(backend));

        for name in ["1.pdf", "2.pdf", "3.pdf"] {
            let err = session
                .store(&manager, &sink, "a", name, Bytes::new(), "application/pdf")
                .await
                .unwrap_err();
            assert_eq!(err.category(), ErrorCategory::RateLimit, "{name}");
        }
        assert!(sink.quarantined.lock().unwrap().is_empty());
    }

    #[test]
    fn unavailable_carries_the_original_category() {
        let unsupported = StorageError::Unsupported(StorageProvider::SharePoint).unavailable();
        assert_eq!(unsupported.category(), ErrorCategory::Validation);
        assert!(unsupported.to_string().contains("no upload adapter"));
        assert_eq!(unsupported.unavailable().category(), ErrorCategory::Validation);
    }
}
