use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::Client;
use serde::Deserialize;
use tracing::debug;

use super::{AttachmentMeta, InboundMessage, MailClient, MailProvider};
use crate::remote::{check_status, ProviderError};

const PROVIDER: &str = "outlook";
const GRAPH_API_BASE: &str = "https://graph.microsoft.com/v1.0";
const FILE_ATTACHMENT_TYPE: &str = "#microsoft.graph.fileAttachment";

#[derive(Clone)]
pub struct OutlookClient {
    http: Client,
    base_url: String,
}

impl OutlookClient {
    pub fn new(http: Client) -> Self {
        Self::with_base_url(http, GRAPH_API_BASE)
    }

    pub fn with_base_url(http: Client, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    async fn get(
        &self,
        token: &str,
        url: &str,
        query: &[(&str, String)],
    ) -> Result<reqwest::Response, ProviderError> {
        let response = self
            .http
            .get(url)
            .bearer_auth(token)
            .header("accept", "application/json")
            .query(query)
            .send()
            .await
            .map_err(ProviderError::transport(PROVIDER))?;
        check_status(PROVIDER, response).await
    }

    async fn get_json<T: for<'de> Deserialize<'de>>(
        &self,
        token: &str,
        url: &str,
        query: &[(&str, String)],
    ) -> Result<T, ProviderError> {
        self.get(token, url, query)
            .await?
            .json::<T>()
            .await
            .map_err(|err| ProviderError::decode(PROVIDER, err.to_string()))
    }
}

#[derive(Debug, Deserialize)]
struct Page<T> {
    #[serde(default = "Vec::new")]
    value: Vec<T>,
}

#[derive(Debug, Deserialize)]
struct MessageRef {
    id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GraphMessage {
    id: String,
    subject: Option<String>,
    from: Option<GraphRecipient>,
    #[serde(default)]
    to_recipients: Vec<GraphRecipient>,
    #[serde(default)]
    cc_recipients: Vec<GraphRecipient>,
    received_date_time: Option<DateTime<Utc>>,
    #[serde(default)]
    has_attachments: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GraphRecipient {
    email_address: Option<GraphEmailAddress>,
}

#[derive(Debug, Deserialize)]
struct GraphEmailAddress {
    address: Option<String>,
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GraphAttachment {
    id: String,
    #[serde(rename = "@odata.type")]
    odata_type: Option<String>,
    name: Option<String>,
    content_type: Option<String>,
    size: Option<i64>,
    #[serde(default)]
    is_inline: bool,
}

#[async_trait]
impl MailClient for OutlookClient {
    fn provider(&self) -> MailProvider {
        MailProvider::Outlook
    }

    async fn list_message_ids(
        &self,
        token: &str,
        since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<String>, ProviderError> {
        let url = format!("{}/me/mailFolders/inbox/messages", self.base_url);
        let query = [
            (
                "$filter",
                format!(
                    "receivedDateTime ge {}",
                    since.to_rfc3339_opts(SecondsFormat::Secs, true)
                ),
            ),
            ("$orderby", "receivedDateTime asc".to_string()),
            ("$top", limit.to_string()),
            ("$select", "id".to_string()),
        ];
        let page: Page<MessageRef> = self.get_json(token, &url, &query).await?;
        debug!(count = page.value.len(), "listed outlook messages");
        Ok(page.value.into_iter().map(|m| m.id).collect())
    }

    async fn fetch_message(&self, token: &str, id: &str) -> Result<InboundMessage, ProviderError> {
        let url = format!("{}/me/messages/{}", self.base_url, id);
        let select = (
            "$select",
            "id,subject,from,toRecipients,ccRecipients,receivedDateTime,hasAttachments".to_string(),
        );
        let message: GraphMessage = self.get_json(token, &url, &[select]).await?;

        let attachments = if message.has_attachments {
            let url = format!("{}/me/messages/{}/attachments", self.base_url, id);
            let select = ("$select", "id,name,contentType,size,isInline".to_string());
            let page: Page<GraphAttachment> = self.get_json(token, &url, &[select]).await?;
            page.value
        } else {
            Vec::new()
        };

        Ok(map_message(message, attachments))
    }

    async fn fetch_attachment_bytes(
        &self,
        token: &str,
        message_id: &str,
        attachment_id: &str,
    ) -> Result<Bytes, ProviderError> {
        let url = format!(
            "{}/me/messages/{}/attachments/{}/$value",
            self.base_url, message_id, attachment_id
        );
        self.get(token, &url, &[])
            .await?
            .bytes()
            .await
            .map_err(ProviderError::transport(PROVIDER))
    }
}

fn recipient_address(recipient: &GraphRecipient) -> Option<String> {
    recipient
        .email_address
        .as_ref()
        .and_then(|email| email.address.as_deref())
        .map(|address| address.trim().to_lowercase())
        .filter(|address| !address.is_empty())
}

fn map_message(message: GraphMessage, attachments: Vec<GraphAttachment>) -> InboundMessage {
    let sender_email = message
        .from
        .as_ref()
        .and_then(recipient_address)
        .unwrap_or_default();
    let sender_name = message
        .from
        .as_ref()
        .and_then(|from| from.email_address.as_ref())
        .and_then(|email| email.name.clone())
        .filter(|name| !name.trim().is_empty());
    let recipients = message
        .to_recipients
        .iter()
        .chain(message.cc_recipients.iter())
        .filter_map(recipient_address)
        .collect();

    let attachments = attachments
        .into_iter()
        .filter(|attachment| {
            !attachment.is_inline
                && attachment
                    .odata_type
                    .as_deref()
                    .map_or(true, |kind| kind == FILE_ATTACHMENT_TYPE)
        })
        .filter_map(|attachment| {
            let filename = attachment.name?.trim().to_string();
            (!filename.is_empty()).then(|| AttachmentMeta {
                id: attachment.id,
                filename,
                mime_type: attachment.content_type,
                size: attachment.size,
            })
        })
        .collect();

    InboundMessage {
        id: message.id,
        sender_email,
        sender_name,
        recipients,
        subject: message.subject.unwrap_or_default(),
        received_at: message.received_date_time.unwrap_or_else(Utc::now),
        attachments,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn maps_graph_message_and_skips_inline_and_item_attachments() {
        let message: GraphMessage = serde_json::from_value(json!({
            "id": "AAMk1",
            "subject": "W-2 2024 attached",
            "from": {"emailAddress": {"address": "Bob@Co.com", "name": "Bob"}},
            "toRecipients": [{"emailAddress": {"address": "intake@firm.com"}}],
            "ccRecipients": [],
            "receivedDateTime": "2024-06-01T12:00:00Z",
            "hasAttachments": true
        }))
        .unwrap();
        let attachments: Vec<GraphAttachment> = serde_json::from_value(json!([
            {"@odata.type": "#microsoft.graph.fileAttachment", "id": "a1",
             "name": "w2.pdf", "contentType": "application/pdf", "size": 100, "isInline": false},
            {"@odata.type": "#microsoft.graph.fileAttachment", "id": "a2",
             "name": "logo.png", "contentType": "image/png", "size": 5, "isInline": true},
            {"@odata.type": "#microsoft.graph.itemAttachment", "id": "a3",
             "name": "Forwarded", "isInline": false}
        ]))
        .unwrap();

        let mapped = map_message(message, attachments);
        assert_eq!(mapped.sender_email, "bob@co.com");
        assert_eq!(mapped.sender_name.as_deref(), Some("Bob"));
        assert_eq!(mapped.recipients, vec!["intake@firm.com"]);
        assert_eq!(mapped.attachments.len(), 1);
        assert_eq!(mapped.attachments[0].id, "a1");
        assert_eq!(mapped.attachments[0].mime_type.as_deref(), Some("application/pdf"));
    }
}
