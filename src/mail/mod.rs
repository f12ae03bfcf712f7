use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};

use crate::remote::ProviderError;
use crate::tokens::OAuthProvider;

pub mod gmail;
pub mod outlook;

pub use gmail::GmailClient;
pub use outlook::OutlookClient;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MailProvider {
    Gmail,
    Outlook,
}

impl MailProvider {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "gmail" | "google" => Some(MailProvider::Gmail),
            "outlook" | "microsoft" | "office365" => Some(MailProvider::Outlook),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MailProvider::Gmail => "gmail",
            MailProvider::Outlook => "outlook",
        }
    }

    pub fn oauth_provider(&self) -> OAuthProvider {
        match self {
            MailProvider::Gmail => OAuthProvider::Google,
            MailProvider::Outlook => OAuthProvider::Microsoft,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachmentMeta {
    pub id: String,
    pub filename: String,
    pub mime_type: Option<String>,
    pub size: Option<i64>,
}

impl AttachmentMeta {
    pub fn extension(&self) -> Option<String> {
        file_extension(&self.filename)
    }
}

#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub id: String,
    pub sender_email: String,
    pub sender_name: Option<String>,
    pub recipients: Vec<String>,
    pub subject: String,
    pub received_at: DateTime<Utc>,
    pub attachments: Vec<AttachmentMeta>,
}

impl InboundMessage {
    pub fn attachment_extensions(&self) -> Vec<String> {
        self.attachments
            .iter()
            .filter_map(AttachmentMeta::extension)
            .collect()
    }
}

/// One mailbox provider. Every call takes the bearer token explicitly so the
/// caller can refresh and retry after a 401.
#[async_trait]
pub trait MailClient: Send + Sync {
    fn provider(&self) -> MailProvider;

    async fn list_message_ids(
        &self,
        token: &str,
        since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<String>, ProviderError>;

    async fn fetch_message(&self, token: &str, id: &str) -> Result<InboundMessage, ProviderError>;

    async fn fetch_attachment_bytes(
        &self,
        token: &str,
        message_id: &str,
        attachment_id: &str,
    ) -> Result<Bytes, ProviderError>;
}

pub fn parse_mailbox(raw: &str) -> (String, Option<String>) {
    let raw = raw.trim();
    if let (Some(start), Some(end)) = (raw.rfind('<'), raw.rfind('>')) {
        if start < end {
            let address = raw[start + 1..end].trim().to_lowercase();
            let name = raw[..start].trim().trim_matches('"').trim();
            let name = (!name.is_empty()).then(|| name.to_string());
            return (address, name);
        }
    }
    (raw.trim_matches('"').to_lowercase(), None)
}

pub fn file_extension(filename: &str) -> Option<String> {
    let (stem, ext) = filename.rsplit_once('.')?;
    if stem.is_empty() || ext.is_empty() {
        return None;
    }
    Some(ext.to_ascii_lowercase())
}
