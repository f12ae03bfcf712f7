use async_trait::async_trait;
use bytes::Bytes;
use percent_encoding::{utf8_percent_encode, AsciiSet, CONTROLS};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use super::{FolderRef, StorageBackend, StorageError, StorageProvider, StoredObject};
use crate::remote::{check_status, ProviderError};

const PROVIDER: &str = "onedrive";
const GRAPH_API_BASE: &str = "https://graph.microsoft.com/v1.0";
/// Graph's limit for a single-request PUT.
pub const SIMPLE_UPLOAD_MAX_BYTES: usize = 4 * 1024 * 1024;
/// Upload-session chunks must be multiples of 320 KiB.
const UPLOAD_CHUNK_BYTES: usize = 320 * 1024 * 16;
const ROOT_ITEM: &str = "root";

const PATH_SEGMENT: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'/')
    .add(b'?')
    .add(b'<')
    .add(b'>')
    .add(b'\\')
    .add(b'`')
    .add(b'{')
    .add(b'}');

#[derive(Debug, Clone, Default, Deserialize)]
pub struct OneDriveSettings {
    #[serde(default)]
    pub drive_id: Option<String>,
    #[serde(default)]
    pub root_path: Option<String>,
}

#[derive(Clone)]
pub struct OneDriveBackend {
    http: Client,
    drive_url: String,
    root_path: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DriveItem {
    id: String,
    #[serde(default)]
    web_url: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UploadSession {
    upload_url: String,
}

impl OneDriveBackend {
    pub fn new(http: Client, settings: &OneDriveSettings) -> Self {
        Self::with_base_url(http, GRAPH_API_BASE, settings)
    }

    pub fn with_base_url(http: Client, base_url: &str, settings: &OneDriveSettings) -> Self {
        let base_url = base_url.trim_end_matches('/');
        let drive_url = match settings.drive_id.as_deref().filter(|id| !id.is_empty()) {
            Some(drive_id) => format!("{base_url}/drives/{drive_id}"),
            None => format!("{base_url}/me/drive"),
        };
        Self {
            http,
            drive_url,
            root_path: settings
                .root_path
                .as_deref()
                .unwrap_or("")
                .trim_matches('/')
                .to_string(),
        }
    }

    fn full_path(&self, path: &str) -> String {
        [self.root_path.as_str(), path.trim_matches('/')]
            .iter()
            .filter(|part| !part.is_empty())
            .copied()
            .collect::<Vec<_>>()
            .join("/")
    }

    async fn item_by_path(&self, token: &str, path: &str) -> Result<Option<DriveItem>, StorageError> {
        let url = format!("{}/root:/{}", self.drive_url, encode_path(path));
        let response = self
            .http
            .get(&url)
            .bearer_auth(token)
            .query(&[("$select", "id,webUrl")])
            .send()
            .await
            .map_err(ProviderError::transport(PROVIDER))?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let item = decode(check_status(PROVIDER, response).await?).await?;
        Ok(Some(item))
    }

    async fn create_folder(
        &self,
        token: &str,
        parent_id: &str,
        name: &str,
    ) -> Result<Option<DriveItem>, StorageError> {
        let url = format!("{}/items/{}/children", self.drive_url, parent_id);
        let response = self
            .http
            .post(&url)
            .bearer_auth(token)
            .json(&json!({
                "name": name,
                "folder": {},
                "@microsoft.graph.conflictBehavior": "fail",
            }))
            .send()
            .await
            .map_err(ProviderError::transport(PROVIDER))?;
        // Created concurrently by someone else; the caller re-reads it.
        if response.status() == StatusCode::CONFLICT {
            return Ok(None);
        }
        let item = decode(check_status(PROVIDER, response).await?).await?;
        Ok(Some(item))
    }

    async fn simple_upload(
        &self,
        token: &str,
        folder: &FolderRef,
        filename: &str,
        bytes: Bytes,
        mime_type: &str,
    ) -> Result<DriveItem, StorageError> {
        let url = format!(
            "{}/items/{}:/{}:/content",
            self.drive_url,
            folder.id,
            encode_segment(filename)
        );
        let response = self
            .http
            .put(&url)
            .bearer_auth(token)
            .query(&[("@microsoft.graph.conflictBehavior", "rename")])
            .header("content-type", mime_type)
            .body(bytes)
            .send()
            .await
            .map_err(ProviderError::transport(PROVIDER))?;
        decode(check_status(PROVIDER, response).await?).await
    }

    async fn session_upload(
        &self,
        token: &str,
        folder: &FolderRef,
        filename: &str,
        bytes: Bytes,
    ) -> Result<DriveItem, StorageError> {
        let url = format!(
            "{}/items/{}:/{}:/createUploadSession",
            self.drive_url,
            folder.id,
            encode_segment(filename)
        );
        let response = self
            .http
            .post(&url)
            .bearer_auth(token)
            .json(&json!({ "item": { "@microsoft.graph.conflictBehavior": "rename" } }))
            .send()
            .await
            .map_err(ProviderError::transport(PROVIDER))?;
        let session: UploadSession = decode(check_status(PROVIDER, response).await?).await?;

        let total = bytes.len();
        let mut offset = 0;
        while offset < total {
            let end = (offset + UPLOAD_CHUNK_BYTES).min(total);
            debug!(offset, end, total, "uploading onedrive chunk");
            // The pre-authenticated upload URL must not carry a bearer token.
            let response = self
                .http
                .put(&session.upload_url)
                .header("content-range", content_range(offset, end, total))
                .body(bytes.slice(offset..end))
                .send()
                .await
                .map_err(ProviderError::transport(PROVIDER))?;
            let response = check_status(PROVIDER, response).await?;
            if end == total {
                return decode(response).await;
            }
            offset = end;
        }

        Err(ProviderError::decode(PROVIDER, "upload session finished without an item").into())
    }
}

async fn decode<T: for<'de> Deserialize<'de>>(response: reqwest::Response) -> Result<T, StorageError> {
    response
        .json::<T>()
        .await
        .map_err(|err| ProviderError::decode(PROVIDER, err.to_string()).into())
}

fn require_token(token: Option<&str>) -> Result<&str, StorageError> {
    token.ok_or_else(|| StorageError::Config("OneDrive requires an OAuth access token".into()))
}

fn encode_segment(segment: &str) -> String {
    utf8_percent_encode(segment, PATH_SEGMENT).to_string()
}

fn encode_path(path: &str) -> String {
    path.split('/')
        .filter(|segment| !segment.is_empty())
        .map(encode_segment)
        .collect::<Vec<_>>()
        .join("/")
}

fn content_range(start: usize, end: usize, total: usize) -> String {
    format!("bytes {}-{}/{}", start, end - 1, total)
}

#[async_trait]
impl StorageBackend for OneDriveBackend {
    fn provider(&self) -> StorageProvider {
        StorageProvider::OneDrive
    }

    async fn probe(&self, token: Option<&str>) -> Result<(), StorageError> {
        let token = require_token(token)?;
        let response = self
            .http
            .get(&self.drive_url)
            .bearer_auth(token)
            .query(&[("$select", "id")])
            .send()
            .await
            .map_err(ProviderError::transport(PROVIDER))?;
        check_status(PROVIDER, response).await?;
        Ok(())
    }

    async fn ensure_folder(&self, token: Option<&str>, path: &str) -> Result<FolderRef, StorageError> {
        let token = require_token(token)?;
        let full = self.full_path(path);
        let mut parent_id = ROOT_ITEM.to_string();
        let mut walked = Vec::new();

        for segment in full.split('/').filter(|segment| !segment.is_empty()) {
            walked.push(segment);
            let current = walked.join("/");
            let item = match self.item_by_path(token, &current).await? {
                Some(item) => item,
                None => match self.create_folder(token, &parent_id, segment).await? {
                    Some(item) => item,
                    None => self.item_by_path(token, &current).await?.ok_or_else(|| {
                        ProviderError::decode(PROVIDER, format!("folder {current} vanished after conflict"))
                    })?,
                },
            };
            parent_id = item.id;
        }

        Ok(FolderRef {
            id: parent_id,
            path: full,
        })
    }

    async fn upload(
        &self,
        token: Option<&str>,
        folder: &FolderRef,
        filename: &str,
        bytes: Bytes,
        mime_type: &str,
    ) -> Result<StoredObject, StorageError> {
        let token = require_token(token)?;
        let item = if bytes.len() <= SIMPLE_UPLOAD_MAX_BYTES {
            self.simple_upload(token, folder, filename, bytes, mime_type)
                .await?
        } else {
            self.session_upload(token, folder, filename, bytes).await?
        };

        let path = if folder.path.is_empty() {
            filename.to_string()
        } else {
            format!("{}/{}", folder.path, filename)
        };
        Ok(StoredObject {
            location_id: item.id,
            path,
            url: item.web_url,
        })
    }

    async fn verify_exists(&self, token: Option<&str>, location_id: &str) -> Result<bool, StorageError> {
        let token = require_token(token)?;
        let url = format!("{}/items/{}", self.drive_url, location_id);
        let response = self
            .http
            .get(&url)
            .bearer_auth(token)
            .query(&[("$select", "id")])
            .send()
            .await
            .map_err(ProviderError::transport(PROVIDER))?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(false);
        }
        check_status(PROVIDER, response).await?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_drive_urls_from_settings() {
        let http = Client::new();
        let me = OneDriveBackend::with_base_url(http.clone(), "http://graph/", &OneDriveSettings::default());
        assert_eq!(me.drive_url, "http://graph/me/drive");

        let shared = OneDriveBackend::with_base_url(
            http,
            "http://graph",
            &OneDriveSettings {
                drive_id: Some("b!abc".into()),
                root_path: Some("/Intake/".into()),
            },
        );
        assert_eq!(shared.drive_url, "http://graph/drives/b!abc");
        assert_eq!(shared.full_path("/Clients/Bob/"), "Intake/Clients/Bob");
    }

    #[test]
    fn encodes_path_segments() {
        assert_eq!(encode_path("Email Attachments/2024/#1"), "Email%20Attachments/2024/%231");
        assert_eq!(encode_segment("a/b.pdf"), "a%2Fb.pdf");
    }

    #[test]
    fn content_ranges_are_inclusive() {
        assert_eq!(content_range(0, 10, 25), "bytes 0-9/25");
        assert_eq!(content_range(20, 25, 25), "bytes 20-24/25");
        assert_eq!(UPLOAD_CHUNK_BYTES % (320 * 1024), 0);
    }
}
