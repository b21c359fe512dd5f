use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Utc};
use notesync_core::{RemoteMetadata, RemoteSettings, RemoteStore, SyncError, WriteOutcome};
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

/// Maximum retries for transient errors (429 / 5xx).
const MAX_RETRIES: u32 = 5;
/// Base delay for exponential backoff.
const BASE_DELAY_MS: u64 = 200;

const API_VERSION: &str = "2022-11-28";

#[derive(Debug, Deserialize)]
struct ContentsEntry {
    sha: String,
    #[serde(default)]
    size: Option<u64>,
    #[serde(rename = "type", default)]
    kind: Option<String>,
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    encoding: Option<String>,
}

#[derive(Debug, Deserialize)]
struct BlobResponse {
    content: String,
    encoding: String,
}

#[derive(Debug, Serialize)]
struct PutRequest<'a> {
    message: &'a str,
    content: String,
    branch: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    sha: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
struct PutResponse {
    content: PutContent,
}

#[derive(Debug, Deserialize)]
struct PutContent {
    sha: String,
}

#[derive(Debug, Serialize)]
struct DeleteRequest<'a> {
    message: &'a str,
    sha: &'a str,
    branch: &'a str,
}

#[derive(Debug, Deserialize)]
struct CommitEntry {
    commit: CommitDetail,
}

#[derive(Debug, Deserialize)]
struct CommitDetail {
    #[serde(default)]
    committer: Option<Signature>,
}

#[derive(Debug, Deserialize)]
struct Signature {
    date: DateTime<Utc>,
}

/// Remote store backed by one branch of a GitHub repository.
///
/// Layout: every remote path is a file path inside the repository; the
/// caller already prefixed it with the configured root directory.
/// All requests retry 429 and 5xx responses with exponential backoff.
#[derive(Clone)]
pub struct GitHubStore {
    http: Client,
    api_base: String,
    owner: String,
    repository: String,
    branch: String,
    token: String,
    retry_delay: Duration,
}

impl GitHubStore {
    pub fn new(settings: &RemoteSettings) -> Result<Self, SyncError> {
        let http = Client::builder()
            .user_agent(concat!("notesync/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| SyncError::Config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            http,
            api_base: settings.api_base.trim_end_matches('/').to_string(),
            owner: settings.owner.clone(),
            repository: settings.repository.clone(),
            branch: settings.branch.clone(),
            token: settings.token.clone(),
            retry_delay: Duration::from_millis(BASE_DELAY_MS),
        })
    }

    /// Override the first backoff delay.
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    fn repo_url(&self) -> String {
        format!("{}/repos/{}/{}", self.api_base, self.owner, self.repository)
    }

    fn contents_url(&self, path: &str) -> String {
        let encoded: Vec<_> = path
            .trim_matches('/')
            .split('/')
            .map(urlencoding::encode)
            .collect();
        format!("{}/contents/{}", self.repo_url(), encoded.join("/"))
    }

    fn request(&self, method: Method, url: &str) -> RequestBuilder {
        self.http
            .request(method, url)
            .bearer_auth(&self.token)
            .header("Accept", "application/vnd.github+json")
            .header("X-GitHub-Api-Version", API_VERSION)
    }

    /// Send a request with exponential backoff retry on 429 and 5xx.
    async fn send_with_retry(
        &self,
        build_request: impl Fn() -> RequestBuilder,
    ) -> anyhow::Result<Response> {
        let mut delay = self.retry_delay;

        for attempt in 0..=MAX_RETRIES {
            let response = build_request()
                .send()
                .await
                .context("GitHub request failed")?;

            let status = response.status();
            if status != StatusCode::TOO_MANY_REQUESTS && !status.is_server_error() {
                return Ok(response);
            }

            if attempt == MAX_RETRIES {
                let text = response.text().await.unwrap_or_default();
                anyhow::bail!(
                    "GitHub still failing with {} after {} retries: {}",
                    status,
                    MAX_RETRIES,
                    text
                );
            }

            warn!(
                attempt = attempt + 1,
                status = status.as_u16(),
                delay_ms = delay.as_millis() as u64,
                "GitHub request failed, retrying"
            );
            tokio::time::sleep(delay).await;
            delay *= 2;
        }

        unreachable!()
    }

    async fn fetch_entry(&self, path: &str) -> anyhow::Result<Option<ContentsEntry>> {
        let url = self.contents_url(path);

        let resp = self
            .send_with_retry(|| {
                self.request(Method::GET, &url)
                    .query(&[("ref", self.branch.as_str())])
            })
            .await?;

        if resp.status() == StatusCode::NOT_FOUND {
            debug!("GitHub path not found: {}", path);
            return Ok(None);
        }

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("GitHub contents error {} for {}: {}", status, path, body);
        }

        let value: serde_json::Value = resp.json().await?;
        if value.is_array() {
            anyhow::bail!("{} is a directory, not a file", path);
        }
        let entry: ContentsEntry = serde_json::from_value(value)?;
        if let Some(kind) = entry.kind.as_deref() {
            if kind != "file" {
                anyhow::bail!("{} is a {}, not a file", path, kind);
            }
        }
        Ok(Some(entry))
    }

    /// Files above the contents API inline limit come back without content.
    async fn fetch_blob(&self, sha: &str) -> anyhow::Result<Vec<u8>> {
        let url = format!("{}/git/blobs/{}", self.repo_url(), sha);

        let resp = self
            .send_with_retry(|| self.request(Method::GET, &url))
            .await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("GitHub blob error {} for {}: {}", status, sha, body);
        }

        let blob: BlobResponse = resp.json().await?;
        if blob.encoding != "base64" {
            anyhow::bail!("Unsupported blob encoding {:?}", blob.encoding);
        }
        decode_base64(&blob.content)
    }

    async fn put(
        &self,
        path: &str,
        content: &[u8],
        expected_revision: Option<&str>,
        message: &str,
    ) -> anyhow::Result<WriteOutcome> {
        let url = self.contents_url(path);
        let body = PutRequest {
            message,
            content: BASE64.encode(content),
            branch: &self.branch,
            sha: expected_revision,
        };

        let resp = self
            .send_with_retry(|| self.request(Method::PUT, &url).json(&body))
            .await?;

        let status = resp.status();
        if status == StatusCode::CONFLICT {
            debug!("GitHub PUT conflict on {}", path);
            return Ok(WriteOutcome::Conflict);
        }

        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            if status == StatusCode::UNPROCESSABLE_ENTITY && text.contains("sha") {
                debug!("GitHub PUT revision mismatch on {}", path);
                return Ok(WriteOutcome::Conflict);
            }
            anyhow::bail!("GitHub PUT error {} for {}: {}", status, path, text);
        }

        let written: PutResponse = resp.json().await?;
        debug!(
            "GitHub PUT {} ({} bytes) -> {}",
            path,
            content.len(),
            written.content.sha
        );
        Ok(WriteOutcome::Written(written.content.sha))
    }

    async fn remove(&self, path: &str, message: &str) -> Result<bool, SyncError> {
        let Some(entry) = self.fetch_entry(path).await.map_err(remote_error)? else {
            return Ok(false);
        };

        let url = self.contents_url(path);
        let body = DeleteRequest {
            message,
            sha: &entry.sha,
            branch: &self.branch,
        };

        let resp = self
            .send_with_retry(|| self.request(Method::DELETE, &url).json(&body))
            .await
            .map_err(remote_error)?;

        let status = resp.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(false);
        }
        if status == StatusCode::CONFLICT {
            return Err(SyncError::Conflict(format!(
                "{} changed while deleting it",
                path
            )));
        }
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(SyncError::Remote(format!(
                "GitHub DELETE error {} for {}: {}",
                status, path, text
            )));
        }

        debug!("GitHub DELETE {}", path);
        Ok(true)
    }

    async fn last_commit_date(&self) -> anyhow::Result<Option<DateTime<Utc>>> {
        let url = format!("{}/commits", self.repo_url());

        let resp = self
            .send_with_retry(|| {
                self.request(Method::GET, &url)
                    .query(&[("sha", self.branch.as_str()), ("per_page", "1")])
            })
            .await?;

        // Empty repository or unknown branch: no activity yet
        if resp.status() == StatusCode::CONFLICT || resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("GitHub commits error {}: {}", status, body);
        }

        let commits: Vec<CommitEntry> = resp.json().await?;
        Ok(commits
            .into_iter()
            .next()
            .and_then(|c| c.commit.committer)
            .map(|s| s.date))
    }
}

fn decode_base64(content: &str) -> anyhow::Result<Vec<u8>> {
    let compact: String = content.chars().filter(|c| !c.is_whitespace()).collect();
    BASE64
        .decode(compact)
        .context("Invalid base64 content from GitHub")
}

fn remote_error(e: anyhow::Error) -> SyncError {
    SyncError::Remote(format!("{:#}", e))
}

#[async_trait]
impl RemoteStore for GitHubStore {
    fn backend_name(&self) -> &'static str {
        "github"
    }

    #[instrument(skip(self), level = "debug")]
    async fn get_metadata(&self, path: &str) -> Result<Option<RemoteMetadata>, SyncError> {
        let entry = self.fetch_entry(path).await.map_err(remote_error)?;
        Ok(entry.map(|e| RemoteMetadata {
            revision: e.sha,
            size: e.size,
        }))
    }

    #[instrument(skip(self), level = "debug")]
    async fn read(&self, path: &str) -> Result<Option<Vec<u8>>, SyncError> {
        let Some(entry) = self.fetch_entry(path).await.map_err(remote_error)? else {
            return Ok(None);
        };

        let inline = match (entry.encoding.as_deref(), entry.content.as_deref()) {
            (Some("base64"), Some(content)) if !content.is_empty() || entry.size == Some(0) => {
                Some(decode_base64(content).map_err(remote_error)?)
            }
            _ => None,
        };

        let bytes = match inline {
            Some(bytes) => bytes,
            None => self.fetch_blob(&entry.sha).await.map_err(remote_error)?,
        };
        debug!("GitHub GET {} ({} bytes)", path, bytes.len());
        Ok(Some(bytes))
    }

    #[instrument(skip(self, content, message), level = "debug", fields(content_len = content.len()))]
    async fn write(
        &self,
        path: &str,
        content: &[u8],
        expected_revision: Option<&str>,
        message: &str,
    ) -> Result<WriteOutcome, SyncError> {
        self.put(path, content, expected_revision, message)
            .await
            .map_err(remote_error)
    }

    #[instrument(skip(self, message), level = "debug")]
    async fn delete(&self, path: &str, message: &str) -> Result<bool, SyncError> {
        self.remove(path, message).await
    }

    #[instrument(skip(self), level = "debug")]
    async fn latest_activity(&self) -> Result<Option<DateTime<Utc>>, SyncError> {
        self.last_commit_date().await.map_err(remote_error)
    }
}
