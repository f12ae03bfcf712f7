use async_trait::async_trait;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Deserialize;
use tracing::debug;

use super::{parse_mailbox, AttachmentMeta, InboundMessage, MailClient, MailProvider};
use crate::remote::{check_status, ProviderError};

const PROVIDER: &str = "gmail";
const GMAIL_API_BASE: &str = "https://gmail.googleapis.com/gmail/v1/users/me";

#[derive(Clone)]
pub struct GmailClient {
    http: Client,
    base_url: String,
}

impl GmailClient {
    pub fn new(http: Client) -> Self {
        Self::with_base_url(http, GMAIL_API_BASE)
    }

    pub fn with_base_url(http: Client, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    async fn get_json<T: for<'de> Deserialize<'de>>(
        &self,
        token: &str,
        url: &str,
        query: &[(&str, String)],
    ) -> Result<T, ProviderError> {
        let response = self
            .http
            .get(url)
            .bearer_auth(token)
            .query(query)
            .send()
            .await
            .map_err(ProviderError::transport(PROVIDER))?;
        let response = check_status(PROVIDER, response).await?;
        response
            .json::<T>()
            .await
            .map_err(|err| ProviderError::decode(PROVIDER, err.to_string()))
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MessageList {
    #[serde(default)]
    messages: Vec<MessageRef>,
}

#[derive(Debug, Deserialize)]
struct MessageRef {
    id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GmailMessage {
    id: String,
    internal_date: Option<String>,
    payload: Option<MessagePart>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MessagePart {
    #[serde(default)]
    mime_type: Option<String>,
    #[serde(default)]
    filename: Option<String>,
    #[serde(default)]
    headers: Vec<Header>,
    #[serde(default)]
    body: Option<PartBody>,
    #[serde(default)]
    parts: Vec<MessagePart>,
}

#[derive(Debug, Deserialize)]
struct Header {
    name: String,
    value: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PartBody {
    attachment_id: Option<String>,
    size: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct AttachmentBody {
    data: String,
}

#[async_trait]
impl MailClient for GmailClient {
    fn provider(&self) -> MailProvider {
        MailProvider::Gmail
    }

    async fn list_message_ids(
        &self,
        token: &str,
        since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<String>, ProviderError> {
        let url = format!("{}/messages", self.base_url);
        let query = [
            ("q", format!("in:inbox after:{}", since.timestamp())),
            ("maxResults", limit.to_string()),
        ];
        let list: MessageList = self.get_json(token, &url, &query).await?;
        debug!(count = list.messages.len(), "listed gmail messages");
        Ok(list.messages.into_iter().map(|m| m.id).collect())
    }

    async fn fetch_message(&self, token: &str, id: &str) -> Result<InboundMessage, ProviderError> {
        let url = format!("{}/messages/{}", self.base_url, id);
        let message: GmailMessage = self
            .get_json(token, &url, &[("format", "full".to_string())])
            .await?;
        Ok(map_message(message))
    }

    async fn fetch_attachment_bytes(
        &self,
        token: &str,
        message_id: &str,
        attachment_id: &str,
    ) -> Result<Bytes, ProviderError> {
        let url = format!(
            "{}/messages/{}/attachments/{}",
            self.base_url, message_id, attachment_id
        );
        let body: AttachmentBody = self.get_json(token, &url, &[]).await?;
        decode_attachment_data(&body.data).map(Bytes::from)
    }
}

fn map_message(message: GmailMessage) -> InboundMessage {
    let payload = message.payload.unwrap_or_default();
    let header = |name: &str| {
        payload
            .headers
            .iter()
            .find(|h| h.name.eq_ignore_ascii_case(name))
            .map(|h| h.value.clone())
    };

    let (sender_email, sender_name) = parse_mailbox(&header("From").unwrap_or_default());
    let recipients = ["To", "Cc"]
        .into_iter()
        .filter_map(|name| header(name))
        .flat_map(|value| {
            value
                .split(',')
                .map(|entry| parse_mailbox(entry).0)
                .filter(|address| !address.is_empty())
                .collect::<Vec<_>>()
        })
        .collect();
    let subject = header("Subject").unwrap_or_default();
    let received_at = message
        .internal_date
        .as_deref()
        .and_then(|ms| ms.parse::<i64>().ok())
        .and_then(DateTime::from_timestamp_millis)
        .unwrap_or_else(Utc::now);

    let mut attachments = Vec::new();
    collect_attachments(&payload, &mut attachments);

    InboundMessage {
        id: message.id,
        sender_email,
        sender_name,
        recipients,
        subject,
        received_at,
        attachments,
    }
}

fn collect_attachments(part: &MessagePart, out: &mut Vec<AttachmentMeta>) {
    let filename = part.filename.as_deref().unwrap_or("").trim();
    if let Some(body) = &part.body {
        if let Some(attachment_id) = &body.attachment_id {
            if !filename.is_empty() {
                out.push(AttachmentMeta {
                    id: attachment_id.clone(),
                    filename: filename.to_string(),
                    mime_type: part.mime_type.clone(),
                    size: body.size,
                });
            }
        }
    }
    for child in &part.parts {
        collect_attachments(child, out);
    }
}

fn decode_attachment_data(data: &str) -> Result<Vec<u8>, ProviderError> {
    URL_SAFE_NO_PAD
        .decode(data.trim().trim_end_matches('='))
        .map_err(|err| ProviderError::decode(PROVIDER, format!("attachment data: {err}")))
}
