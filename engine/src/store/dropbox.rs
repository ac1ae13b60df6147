//! Dropbox content API backend.
//!
//! Blocking HTTP client with bearer authentication against the
//! `upload_session/start`, `upload_session/append_v2`,
//! `upload_session/finish` and `upload` endpoints. Call arguments travel as
//! JSON in the `Dropbox-API-Arg` header; the request body is the raw chunk.

use std::fmt::Write as _;
use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE, RETRY_AFTER};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use super::{ChunkedStore, CommitInfo, Cursor, RemoteMetadata};
use crate::config::{DropboxConfig, TOKEN_ENV_VAR};
use crate::error::{EngineError, RemoteFault};

const API_ARG_HEADER: &str = "Dropbox-API-Arg";
const DEFAULT_BACKOFF: Duration = Duration::from_secs(1);
const SUMMARY_LIMIT: usize = 200;

/// Dropbox store client.
pub struct DropboxStore {
    client: Client,
    content_url: String,
}

impl DropboxStore {
    /// Build a client from the resolved store configuration.
    ///
    /// # Errors
    /// Returns EngineError::Store if no token is available or the HTTP client
    /// cannot be built
    pub fn new(config: &DropboxConfig) -> Result<Self, EngineError> {
        let token = config
            .access_token
            .as_ref()
            .filter(|token| !token.is_empty())
            .ok_or_else(|| EngineError::Store {
                reason: format!("no Dropbox access token (set access_token or {TOKEN_ENV_VAR})"),
            })?;

        let mut auth = HeaderValue::from_str(&format!("Bearer {}", token.expose())).map_err(|_| {
            EngineError::Store {
                reason: "access token is not a valid header value".to_string(),
            }
        })?;
        auth.set_sensitive(true);

        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, auth);

        let client = Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(config.timeout_secs))
            .user_agent(concat!("sealpost/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| EngineError::Store {
                reason: e.to_string(),
            })?;

        Ok(DropboxStore {
            client,
            content_url: config.content_url.trim_end_matches('/').to_string(),
        })
    }

    /// POST one content endpoint and return the raw response body.
    fn call<A: Serialize>(&self, endpoint: &str, arg: &A, body: &[u8]) -> Result<Vec<u8>, RemoteFault> {
        let arg = serde_json::to_string(arg)
            .map_err(|e| RemoteFault::Fatal(format!("failed to encode call argument: {e}")))?;
        let url = format!("{}/2/files/{}", self.content_url, endpoint);
        debug!(endpoint, bytes = body.len(), "dropbox request");

        let response = self
            .client
            .post(&url)
            .header(API_ARG_HEADER, escape_non_ascii(&arg))
            .header(CONTENT_TYPE, "application/octet-stream")
            .body(body.to_vec())
            .send()
            .map_err(|e| classify_transport(&e))?;

        let status = response.status();
        if status.is_success() {
            return response
                .bytes()
                .map(|bytes| bytes.to_vec())
                .map_err(|e| classify_transport(&e));
        }

        let retry_after = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.trim().parse::<u64>().ok())
            .map(Duration::from_secs);
        let body = response.text().unwrap_or_default();
        Err(classify_response(status, retry_after, &body))
    }
}

impl ChunkedStore for DropboxStore {
    fn start_session(&self, chunk: &[u8]) -> Result<String, RemoteFault> {
        let body = self.call("upload_session/start", &StartArg { close: false }, chunk)?;
        let result: StartResult = decode(&body)?;
        Ok(result.session_id)
    }

    fn append(&self, cursor: &Cursor, chunk: &[u8]) -> Result<(), RemoteFault> {
        let arg = AppendArg {
            cursor: CursorArg::from(cursor),
            close: false,
        };
        self.call("upload_session/append_v2", &arg, chunk)?;
        Ok(())
    }

    fn finish(&self, cursor: &Cursor, chunk: &[u8], commit: &CommitInfo) -> Result<RemoteMetadata, RemoteFault> {
        let arg = FinishArg {
            cursor: CursorArg::from(cursor),
            commit: CommitArg::from(commit),
        };
        let body = self.call("upload_session/finish", &arg, chunk)?;
        let metadata: FileMetadata = decode(&body)?;
        Ok(metadata.into_remote(commit))
    }

    fn upload(&self, data: &[u8], commit: &CommitInfo) -> Result<RemoteMetadata, RemoteFault> {
        let body = self.call("upload", &CommitArg::from(commit), data)?;
        let metadata: FileMetadata = decode(&body)?;
        Ok(metadata.into_remote(commit))
    }
}

#[derive(Serialize)]
struct StartArg {
    close: bool,
}

#[derive(Deserialize)]
struct StartResult {
    session_id: String,
}

#[derive(Serialize)]
struct CursorArg<'a> {
    session_id: &'a str,
    offset: u64,
}

impl<'a> From<&'a Cursor> for CursorArg<'a> {
    fn from(cursor: &'a Cursor) -> Self {
        CursorArg {
            session_id: &cursor.session_id,
            offset: cursor.offset,
        }
    }
}

#[derive(Serialize)]
struct AppendArg<'a> {
    cursor: CursorArg<'a>,
    close: bool,
}

#[derive(Serialize)]
struct CommitArg<'a> {
    path: &'a str,
    mode: &'static str,
    autorename: bool,
    client_modified: String,
    mute: bool,
}

impl<'a> From<&'a CommitInfo> for CommitArg<'a> {
    fn from(commit: &'a CommitInfo) -> Self {
        CommitArg {
            path: &commit.path,
            mode: "add",
            autorename: false,
            client_modified: commit.client_modified.format("%Y-%m-%dT%H:%M:%SZ").to_string(),
            mute: false,
        }
    }
}

#[derive(Serialize)]
struct FinishArg<'a> {
    cursor: CursorArg<'a>,
    commit: CommitArg<'a>,
}

#[derive(Deserialize)]
struct FileMetadata {
    #[serde(default)]
    path_display: Option<String>,
    #[serde(default)]
    path_lower: Option<String>,
    size: u64,
    #[serde(default)]
    content_hash: Option<String>,
    #[serde(default)]
    server_modified: Option<DateTime<Utc>>,
}

impl FileMetadata {
    fn into_remote(self, commit: &CommitInfo) -> RemoteMetadata {
        RemoteMetadata {
            path: self
                .path_display
                .or(self.path_lower)
                .unwrap_or_else(|| commit.path.clone()),
            size: self.size,
            content_hash: self.content_hash,
            server_modified: self.server_modified,
        }
    }
}

#[derive(Deserialize)]
struct ApiError {
    #[serde(default)]
    error_summary: String,
    #[serde(default)]
    error: Value,
}

fn decode<'a, T: Deserialize<'a>>(body: &'a [u8]) -> Result<T, RemoteFault> {
    serde_json::from_slice(body).map_err(|e| RemoteFault::Fatal(format!("unexpected response: {e}")))
}

/// Map an error response to one of the four fault categories.
///
/// # Arguments
/// * `status` - HTTP status of the response
/// * `retry_after` - Parsed `Retry-After` header, if present
/// * `body` - Response body (a Dropbox API error document, or anything)
///
/// # Behavior
/// - 409 carrying `incorrect_offset`, directly or under `lookup_failed`,
///   becomes `IncorrectOffset` with the server's offset
/// - 429, and 503 with a `Retry-After` header, become `RetryLater`; the
///   delay comes from the header, then the body's `retry_after`, then 1 s
/// - Any other 5xx is `Transient`
/// - Everything else is `Fatal`, carrying the error summary
pub fn classify_response(status: StatusCode, retry_after: Option<Duration>, body: &str) -> RemoteFault {
    let parsed: Option<ApiError> = serde_json::from_str(body).ok();
    let error = parsed.as_ref().map(|e| &e.error).unwrap_or(&Value::Null);
    let summary = match parsed.as_ref().map(|e| e.error_summary.trim()) {
        Some(summary) if !summary.is_empty() => summary.to_string(),
        _ => body.chars().take(SUMMARY_LIMIT).collect(),
    };

    if status == StatusCode::CONFLICT {
        if let Some(correct_offset) = incorrect_offset(error) {
            return RemoteFault::IncorrectOffset { correct_offset };
        }
        return RemoteFault::Fatal(summary);
    }

    if status == StatusCode::TOO_MANY_REQUESTS
        || (status == StatusCode::SERVICE_UNAVAILABLE && retry_after.is_some())
    {
        let backoff = retry_after
            .or_else(|| error.get("retry_after").and_then(Value::as_u64).map(Duration::from_secs))
            .unwrap_or(DEFAULT_BACKOFF);
        return RemoteFault::RetryLater { backoff };
    }

    if status.is_server_error() {
        return RemoteFault::Transient(format!("HTTP {}: {}", status.as_u16(), summary));
    }

    RemoteFault::Fatal(format!("HTTP {}: {}", status.as_u16(), summary))
}

fn incorrect_offset(error: &Value) -> Option<u64> {
    match error.get(".tag")?.as_str()? {
        "incorrect_offset" => error.get("correct_offset")?.as_u64(),
        "lookup_failed" => incorrect_offset(error.get("lookup_failed")?),
        _ => None,
    }
}

/// Request construction and redirect loops are not worth retrying; every
/// other transport failure (timeout, connect, reset, body) is.
fn classify_transport(err: &reqwest::Error) -> RemoteFault {
    if err.is_builder() || err.is_redirect() {
        RemoteFault::Fatal(err.to_string())
    } else {
        RemoteFault::Transient(err.to_string())
    }
}

/// HTTP headers must be ASCII; JSON permits `\uXXXX` escapes for the rest.
fn escape_non_ascii(json: &str) -> String {
    let mut escaped = String::with_capacity(json.len());
    let mut units = [0u16; 2];
    for c in json.chars() {
        if c.is_ascii() {
            escaped.push(c);
        } else {
            for unit in c.encode_utf16(&mut units) {
                let _ = write!(escaped, "\\u{:04x}", unit);
            }
        }
    }
    escaped
}
