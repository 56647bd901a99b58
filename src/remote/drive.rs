//! Google Drive v3 over plain REST.

use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use super::{Node, NodeKind, RemoteResult, RemoteTree, FOLDER_MIME, PDF_MIME};
use crate::error::RemoteError;

const API_BASE: &str = "https://www.googleapis.com/drive/v3";
const UPLOAD_BASE: &str = "https://www.googleapis.com/upload/drive/v3";
const NODE_FIELDS: &str = "id,name,mimeType,parents";
const PAGE_SIZE: &str = "1000";
const MAX_ERROR_BODY_LENGTH: usize = 200;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DriveFile {
    id: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    mime_type: String,
    #[serde(default)]
    parents: Vec<String>,
}

impl From<DriveFile> for Node {
    fn from(file: DriveFile) -> Self {
        Node {
            kind: NodeKind::from_mime(&file.mime_type),
            id: file.id,
            name: file.name,
            parents: file.parents,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileList {
    #[serde(default)]
    files: Vec<DriveFile>,
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CreatedFile {
    id: String,
}

/// Drive client authenticated with an already-exchanged OAuth access token.
pub struct DriveClient {
    http: Client,
    access_token: String,
    api_base: String,
    upload_base: String,
}

impl std::fmt::Debug for DriveClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DriveClient")
            .field("api_base", &self.api_base)
            .finish_non_exhaustive()
    }
}

impl DriveClient {
    pub fn new(access_token: impl Into<String>) -> Self {
        Self {
            http: Client::new(),
            access_token: access_token.into(),
            api_base: API_BASE.to_string(),
            upload_base: UPLOAD_BASE.to_string(),
        }
    }

    /// Points the client at another endpoint (proxies, emulators).
    pub fn with_base_urls(mut self, api_base: &str, upload_base: &str) -> Self {
        self.api_base = api_base.trim_end_matches('/').to_string();
        self.upload_base = upload_base.trim_end_matches('/').to_string();
        self
    }

    async fn json<T: DeserializeOwned>(&self, response: Response) -> RemoteResult<T> {
        let response = check_status(response).await?;
        response
            .json::<T>()
            .await
            .map_err(|e| RemoteError::Permanent(format!("unexpected Drive response: {}", e)))
    }
}

#[async_trait]
impl RemoteTree for DriveClient {
    async fn list_children(&self, folder_id: &str) -> RemoteResult<Vec<Node>> {
        let query = format!("'{}' in parents and trashed=false", escape_query(folder_id));
        let fields = format!("nextPageToken,files({})", NODE_FIELDS);
        let mut nodes = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let mut request = self
                .http
                .get(format!("{}/files", self.api_base))
                .bearer_auth(&self.access_token)
                .query(&[
                    ("q", query.as_str()),
                    ("fields", fields.as_str()),
                    ("pageSize", PAGE_SIZE),
                ]);
            if let Some(token) = &page_token {
                request = request.query(&[("pageToken", token.as_str())]);
            }

            let page: FileList = self.json(request.send().await.map_err(network_error)?).await?;
            nodes.extend(page.files.into_iter().map(Node::from));

            match page.next_page_token {
                Some(token) if !token.is_empty() => page_token = Some(token),
                _ => break,
            }
        }

        debug!(folder_id, count = nodes.len(), "listed folder");
        Ok(nodes)
    }

    async fn get_metadata(&self, id: &str) -> RemoteResult<Node> {
        let response = self
            .http
            .get(file_url(&self.api_base, id)?)
            .bearer_auth(&self.access_token)
            .query(&[("fields", NODE_FIELDS)])
            .send()
            .await
            .map_err(network_error)?;
        let file: DriveFile = self.json(response).await?;
        Ok(file.into())
    }

    async fn create_folder(&self, name: &str, parent_id: &str) -> RemoteResult<String> {
        let mut body = json!({ "name": name, "mimeType": FOLDER_MIME });
        if !parent_id.is_empty() {
            body["parents"] = json!([parent_id]);
        }
        let response = self
            .http
            .post(format!("{}/files", self.api_base))
            .bearer_auth(&self.access_token)
            .query(&[("fields", "id")])
            .json(&body)
            .send()
            .await
            .map_err(network_error)?;
        let created: CreatedFile = self.json(response).await?;
        Ok(created.id)
    }

    async fn download(&self, file_id: &str) -> RemoteResult<Vec<u8>> {
        let response = self
            .http
            .get(file_url(&self.api_base, file_id)?)
            .bearer_auth(&self.access_token)
            .query(&[("alt", "media")])
            .send()
            .await
            .map_err(network_error)?;
        let response = check_status(response).await?;
        let bytes = response.bytes().await.map_err(network_error)?;
        Ok(bytes.to_vec())
    }

    async fn upload(&self, bytes: Vec<u8>, name: &str, parent_id: &str) -> RemoteResult<String> {
        let boundary = format!("wm-{}", uuid::Uuid::new_v4().simple());
        let metadata = json!({ "name": name, "parents": [parent_id], "mimeType": PDF_MIME });
        let body = multipart_related(&boundary, &metadata.to_string(), PDF_MIME, &bytes);

        let response = self
            .http
            .post(format!("{}/files", self.upload_base))
            .bearer_auth(&self.access_token)
            .query(&[("uploadType", "multipart"), ("fields", "id")])
            .header(
                reqwest::header::CONTENT_TYPE,
                format!("multipart/related; boundary={}", boundary),
            )
            .body(body)
            .send()
            .await
            .map_err(network_error)?;
        let created: CreatedFile = self.json(response).await?;
        Ok(created.id)
    }
}

/// `<base>/files/<id>`, with the id percent-encoded as one path segment.
fn file_url(base: &str, id: &str) -> RemoteResult<Url> {
    let mut url = Url::parse(&format!("{}/files", base))
        .map_err(|e| RemoteError::Permanent(format!("invalid endpoint {}: {}", base, e)))?;
    url.path_segments_mut()
        .map_err(|_| RemoteError::Permanent(format!("invalid endpoint {}", base)))?
        .push(id);
    Ok(url)
}

/// Single quotes and backslashes must be escaped inside a Drive `q` literal.
fn escape_query(value: &str) -> String {
    value.replace('\\', "\\\\").replace('\'', "\\'")
}

fn multipart_related(boundary: &str, metadata: &str, mime: &str, content: &[u8]) -> Vec<u8> {
    let mut body = Vec::with_capacity(content.len() + metadata.len() + 256);
    body.extend_from_slice(format!("--{}\r\n", boundary).as_bytes());
    body.extend_from_slice(b"Content-Type: application/json; charset=UTF-8\r\n\r\n");
    body.extend_from_slice(metadata.as_bytes());
    body.extend_from_slice(format!("\r\n--{}\r\n", boundary).as_bytes());
    body.extend_from_slice(format!("Content-Type: {}\r\n\r\n", mime).as_bytes());
    body.extend_from_slice(content);
    body.extend_from_slice(format!("\r\n--{}--\r\n", boundary).as_bytes());
    body
}

async fn check_status(response: Response) -> RemoteResult<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let url = response.url().path().to_string();
    let body = response.text().await.unwrap_or_default();
    Err(classify_status(status, &url, &body))
}

fn classify_status(status: StatusCode, what: &str, body: &str) -> RemoteError {
    let body = truncate(body);
    match status {
        StatusCode::UNAUTHORIZED => RemoteError::Auth(format!("{}: {}", status, body)),
        StatusCode::NOT_FOUND => RemoteError::NotFound(what.to_string()),
        StatusCode::TOO_MANY_REQUESTS => RemoteError::Transient(format!("{}: {}", status, body)),
        StatusCode::FORBIDDEN if is_rate_limited(&body) => {
            RemoteError::Transient(format!("{}: {}", status, body))
        }
        s if s.is_server_error() => RemoteError::Transient(format!("{}: {}", status, body)),
        _ => RemoteError::Permanent(format!("{} on {}: {}", status, what, body)),
    }
}

/// Drive reports per-user throttling as 403 with a rate-limit reason.
fn is_rate_limited(body: &str) -> bool {
    body.contains("rateLimitExceeded") || body.contains("RateLimitExceeded")
}

fn network_error(err: reqwest::Error) -> RemoteError {
    if err.is_timeout() || err.is_connect() || err.is_request() || err.is_body() {
        RemoteError::Transient(err.to_string())
    } else {
        RemoteError::Permanent(err.to_string())
    }
}

fn truncate(body: &str) -> String {
    if body.len() > MAX_ERROR_BODY_LENGTH {
        let mut end = MAX_ERROR_BODY_LENGTH;
        while !body.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}... (truncated)", &body[..end])
    } else {
        body.to_string()
    }
}
