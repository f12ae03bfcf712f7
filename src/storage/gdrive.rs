use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use super::{FolderRef, StorageBackend, StorageError, StorageProvider, StoredObject};
use crate::remote::{check_status, ProviderError};

const PROVIDER: &str = "google_drive";
const DRIVE_API_BASE: &str = "https://www.googleapis.com/drive/v3";
const DRIVE_UPLOAD_BASE: &str = "https://www.googleapis.com/upload/drive/v3";
const FOLDER_MIME_TYPE: &str = "application/vnd.google-apps.folder";

#[derive(Debug, Clone, Default, Deserialize)]
pub struct GoogleDriveSettings {
    #[serde(default)]
    pub root_folder_id: Option<String>,
}

#[derive(Clone)]
pub struct GoogleDriveBackend {
    http: Client,
    api_base: String,
    upload_base: String,
    root_folder_id: String,
}

#[derive(Debug, Deserialize)]
struct FileList {
    #[serde(default)]
    files: Vec<DriveFile>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DriveFile {
    id: String,
    #[serde(default)]
    web_view_link: Option<String>,
    #[serde(default)]
    trashed: bool,
}

impl GoogleDriveBackend {
    pub fn new(http: Client, settings: &GoogleDriveSettings) -> Self {
        Self::with_base_urls(http, DRIVE_API_BASE, DRIVE_UPLOAD_BASE, settings)
    }

    pub fn with_base_urls(
        http: Client,
        api_base: &str,
        upload_base: &str,
        settings: &GoogleDriveSettings,
    ) -> Self {
        Self {
            http,
            api_base: api_base.trim_end_matches('/').to_string(),
            upload_base: upload_base.trim_end_matches('/').to_string(),
            root_folder_id: settings
                .root_folder_id
                .clone()
                .filter(|id| !id.is_empty())
                .unwrap_or_else(|| "root".to_string()),
        }
    }

    async fn find_folder(&self, token: &str, parent_id: &str, name: &str) -> Result<Option<String>, StorageError> {
        let query = format!(
            "name = '{}' and '{}' in parents and mimeType = '{}' and trashed = false",
            escape_query(name),
            escape_query(parent_id),
            FOLDER_MIME_TYPE
        );
        let response = self
            .http
            .get(format!("{}/files", self.api_base))
            .bearer_auth(token)
            .query(&[
                ("q", query.as_str()),
                ("fields", "files(id)"),
                ("pageSize", "1"),
                ("orderBy", "createdTime"),
            ])
            .send()
            .await
            .map_err(ProviderError::transport(PROVIDER))?;
        let list: FileList = decode(check_status(PROVIDER, response).await?).await?;
        Ok(list.files.into_iter().next().map(|file| file.id))
    }

    async fn create_folder(&self, token: &str, parent_id: &str, name: &str) -> Result<String, StorageError> {
        let response = self
            .http
            .post(format!("{}/files", self.api_base))
            .bearer_auth(token)
            .query(&[("fields", "id")])
            .json(&json!({
                "name": name,
                "mimeType": FOLDER_MIME_TYPE,
                "parents": [parent_id],
            }))
            .send()
            .await
            .map_err(ProviderError::transport(PROVIDER))?;
        let file: DriveFile = decode(check_status(PROVIDER, response).await?).await?;
        Ok(file.id)
    }
}

async fn decode<T: for<'de> Deserialize<'de>>(response: reqwest::Response) -> Result<T, StorageError> {
    response
        .json::<T>()
        .await
        .map_err(|err| ProviderError::decode(PROVIDER, err.to_string()).into())
}

fn require_token(token: Option<&str>) -> Result<&str, StorageError> {
    token.ok_or_else(|| StorageError::Config("Google Drive requires an OAuth access token".into()))
}

fn escape_query(value: &str) -> String {
    value.replace('\\', "\\\\").replace('\'', "\\'")
}

fn multipart_related(boundary: &str, metadata: &serde_json::Value, bytes: &[u8], mime_type: &str) -> Bytes {
    let mut body = BytesMut::with_capacity(bytes.len() + 512);
    body.put_slice(format!("--{boundary}\r\n").as_bytes());
    body.put_slice(b"Content-Type: application/json; charset=UTF-8\r\n\r\n");
    body.put_slice(metadata.to_string().as_bytes());
    body.put_slice(format!("\r\n--{boundary}\r\n").as_bytes());
    body.put_slice(format!("Content-Type: {mime_type}\r\n\r\n").as_bytes());
    body.put_slice(bytes);
    body.put_slice(format!("\r\n--{boundary}--\r\n").as_bytes());
    body.freeze()
}

#[async_trait]
impl StorageBackend for GoogleDriveBackend {
    fn provider(&self) -> StorageProvider {
        StorageProvider::GoogleDrive
    }

    async fn probe(&self, token: Option<&str>) -> Result<(), StorageError> {
        let token = require_token(token)?;
        let response = self
            .http
            .get(format!("{}/about", self.api_base))
            .bearer_auth(token)
            .query(&[("fields", "user(emailAddress)")])
            .send()
            .await
            .map_err(ProviderError::transport(PROVIDER))?;
        check_status(PROVIDER, response).await?;
        Ok(())
    }

    async fn ensure_folder(&self, token: Option<&str>, path: &str) -> Result<FolderRef, StorageError> {
        let token = require_token(token)?;
        let mut parent_id = self.root_folder_id.clone();
        let mut segments = Vec::new();

        for segment in path.split('/').filter(|segment| !segment.trim().is_empty()) {
            parent_id = match self.find_folder(token, &parent_id, segment).await? {
                Some(id) => id,
                None => self.create_folder(token, &parent_id, segment).await?,
            };
            segments.push(segment);
        }

        Ok(FolderRef {
            id: parent_id,
            path: segments.join("/"),
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
        let boundary = format!("intake-{}", Uuid::new_v4().simple());
        let metadata = json!({ "name": filename, "parents": [folder.id] });
        let body = multipart_related(&boundary, &metadata, &bytes, mime_type);

        let response = self
            .http
            .post(format!("{}/files", self.upload_base))
            .bearer_auth(token)
            .query(&[("uploadType", "multipart"), ("fields", "id,webViewLink")])
            .header(
                "content-type",
                format!("multipart/related; boundary={boundary}"),
            )
            .body(body)
            .send()
            .await
            .map_err(ProviderError::transport(PROVIDER))?;
        let file: DriveFile = decode(check_status(PROVIDER, response).await?).await?;

        let path = if folder.path.is_empty() {
            filename.to_string()
        } else {
            format!("{}/{}", folder.path, filename)
        };
        Ok(StoredObject {
            location_id: file.id,
            path,
            url: file.web_view_link,
        })
    }

    async fn verify_exists(&self, token: Option<&str>, location_id: &str) -> Result<bool, StorageError> {
        let token = require_token(token)?;
        let response = self
            .http
            .get(format!("{}/files/{}", self.api_base, location_id))
            .bearer_auth(token)
            .query(&[("fields", "id,trashed")])
            .send()
            .await
            .map_err(ProviderError::transport(PROVIDER))?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(false);
        }
        let file: DriveFile = decode(check_status(PROVIDER, response).await?).await?;
        Ok(!file.trashed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escapes_drive_query_literals() {
        assert_eq!(escape_query("O'Brien"), "O\\'Brien");
        assert_eq!(escape_query("a\\b"), "a\\\\b");
    }

    #[test]
    fn builds_multipart_related_body() {
        let body = multipart_related("b1", &json!({"name": "x.pdf"}), b"DATA", "application/pdf");
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(text.starts_with("--b1\r\nContent-Type: application/json"));
        assert!(text.contains("{\"name\":\"x.pdf\"}"));
        assert!(text.contains("Content-Type: application/pdf\r\n\r\nDATA\r\n--b1--"));
    }

    #[test]
    fn defaults_to_drive_root() {
        let backend = GoogleDriveBackend::new(Client::new(), &GoogleDriveSettings::default());
        assert_eq!(backend.root_folder_id, "root");
    }
}
