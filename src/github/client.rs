// src/github/client.rs
// GitHub REST client (contents, git trees/refs, pulls)

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use reqwest::{Client, Method, RequestBuilder, StatusCode};
use serde::Deserialize;
use serde_json::{Value, json};
use std::time::Duration;
use tracing::{debug, info};

use super::{
    EntryKind, FileContent, FileWrite, PullRequest, PullRequestDraft, RepoBackend, RepoRef,
    TreeEntry,
};
use crate::error::{PilotError, Result};

const API_VERSION: &str = "2022-11-28";
const REQUEST_TIMEOUT_SECS: u64 = 30;

/// Authenticated GitHub REST API client
#[derive(Clone)]
pub struct GitHubClient {
    http: Client,
    base_url: String,
    token: String,
}

#[derive(Debug, Deserialize)]
struct TreeResponse {
    tree: Vec<RawTreeEntry>,
    #[serde(default)]
    truncated: bool,
}

#[derive(Debug, Deserialize)]
struct RawTreeEntry {
    path: String,
    #[serde(rename = "type")]
    entry_type: String,
    #[serde(default)]
    size: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct ContentsResponse {
    #[serde(rename = "type")]
    content_type: String,
    sha: String,
    size: u64,
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    encoding: Option<String>,
}

impl GitHubClient {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Self {
        let http = Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .user_agent(concat!("repopilot/", env!("CARGO_PKG_VERSION")))
            .build()
            .unwrap_or_else(|_| Client::new());

        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
        }
    }

    fn request(&self, method: Method, url: &str) -> RequestBuilder {
        self.http
            .request(method, url)
            .bearer_auth(&self.token)
            .header("Accept", "application/vnd.github+json")
            .header("X-GitHub-Api-Version", API_VERSION)
    }

    fn repo_url(&self, repo: &RepoRef, tail: &str) -> String {
        format!(
            "{}/repos/{}/{}/{}",
            self.base_url,
            urlencoding::encode(&repo.owner),
            urlencoding::encode(&repo.repo),
            tail
        )
    }

    /// Send and decode, mapping 404 to NotFound and other failures to Repository
    async fn send_json<T: serde::de::DeserializeOwned>(
        &self,
        builder: RequestBuilder,
        what: &str,
    ) -> Result<T> {
        let response = builder.send().await?;
        let status = response.status();

        if status == StatusCode::NOT_FOUND {
            return Err(PilotError::NotFound(what.to_string()));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(PilotError::Repository {
                status: status.as_u16(),
                message: github_message(&body),
            });
        }

        Ok(response.json::<T>().await?)
    }
}

/// Percent-encode each segment of a repository path, keeping the slashes
fn encode_path(path: &str) -> String {
    path.trim_matches('/')
        .split('/')
        .map(|seg| urlencoding::encode(seg).into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

/// Pull the `message` field out of a GitHub error body when there is one
fn github_message(body: &str) -> String {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| v["message"].as_str().map(str::to_string))
        .unwrap_or_else(|| body.chars().take(300).collect())
}

fn decode_content(path: &str, raw: &str) -> Result<String> {
    let compact: String = raw.chars().filter(|c| !c.is_whitespace()).collect();
    let bytes = BASE64
        .decode(compact)
        .map_err(|e| PilotError::InvalidInput(format!("{path}: bad base64 content: {e}")))?;
    String::from_utf8(bytes)
        .map_err(|_| PilotError::InvalidInput(format!("{path} is not a UTF-8 text file")))
}

#[async_trait]
impl RepoBackend for GitHubClient {
    async fn list_tree(&self, repo: &RepoRef, branch: &str) -> Result<Vec<TreeEntry>> {
        let url = self.repo_url(
            repo,
            &format!("git/trees/{}?recursive=1", urlencoding::encode(branch)),
        );
        let tree: TreeResponse = self
            .send_json(self.request(Method::GET, &url), &format!("{repo}@{branch}"))
            .await?;

        if tree.truncated {
            info!(repo = %repo, branch, "GitHub truncated the recursive tree listing");
        }

        let entries = tree
            .tree
            .into_iter()
            .filter_map(|e| {
                let kind = match e.entry_type.as_str() {
                    "blob" => EntryKind::File,
                    "tree" => EntryKind::Dir,
                    // submodules ("commit") are not browsable
                    _ => return None,
                };
                Some(TreeEntry {
                    path: e.path,
                    kind,
                    size: e.size,
                })
            })
            .collect::<Vec<_>>();

        debug!(repo = %repo, branch, entries = entries.len(), "Fetched tree");
        Ok(entries)
    }

    async fn get_file(
        &self,
        repo: &RepoRef,
        branch: &str,
        path: &str,
        max_bytes: u64,
    ) -> Result<FileContent> {
        let url = self.repo_url(
            repo,
            &format!(
                "contents/{}?ref={}",
                encode_path(path),
                urlencoding::encode(branch)
            ),
        );
        let value: Value = self.send_json(self.request(Method::GET, &url), path).await?;

        if value.is_array() {
            return Err(PilotError::InvalidInput(format!("{path} is a directory")));
        }
        let contents: ContentsResponse = serde_json::from_value(value)?;
        if contents.content_type != "file" {
            return Err(PilotError::InvalidInput(format!(
                "{path} is a {}, not a file",
                contents.content_type
            )));
        }

        // Size is checked before decoding; the API also omits content past 1 MB
        if contents.size > max_bytes || contents.encoding.as_deref() == Some("none") {
            return Err(PilotError::FileTooLarge {
                path: path.to_string(),
                size: contents.size,
                limit: max_bytes,
            });
        }

        let content = decode_content(path, contents.content.as_deref().unwrap_or(""))?;
        Ok(FileContent {
            path: path.to_string(),
            content,
            sha: contents.sha,
        })
    }

    async fn put_file(&self, repo: &RepoRef, branch: &str, write: FileWrite<'_>) -> Result<String> {
        let url = self.repo_url(repo, &format!("contents/{}", encode_path(write.path)));

        let mut body = json!({
            "message": write.message,
            "content": BASE64.encode(write.content.as_bytes()),
            "branch": branch,
        });
        if let Some(sha) = write.sha {
            body["sha"] = json!(sha);
        }

        let response: Value = self
            .send_json(self.request(Method::PUT, &url).json(&body), write.path)
            .await?;
        let sha = response["content"]["sha"]
            .as_str()
            .unwrap_or_default()
            .to_string();

        info!(repo = %repo, branch, path = write.path, "Committed file");
        Ok(sha)
    }

    async fn default_branch(&self, repo: &RepoRef) -> Result<String> {
        let url = format!(
            "{}/repos/{}/{}",
            self.base_url,
            urlencoding::encode(&repo.owner),
            urlencoding::encode(&repo.repo)
        );
        let value: Value = self
            .send_json(self.request(Method::GET, &url), &repo.to_string())
            .await?;
        value["default_branch"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| PilotError::Repository {
                status: 200,
                message: format!("{repo} has no default_branch"),
            })
    }

    async fn create_branch(&self, repo: &RepoRef, from: &str, name: &str) -> Result<()> {
        let url = self.repo_url(repo, &format!("git/ref/heads/{}", encode_path(from)));
        let head: Value = self
            .send_json(self.request(Method::GET, &url), &format!("branch {from}"))
            .await?;
        let sha = head["object"]["sha"]
            .as_str()
            .ok_or_else(|| PilotError::Repository {
                status: 200,
                message: format!("branch {from} has no head commit"),
            })?;

        let url = self.repo_url(repo, "git/refs");
        let body = json!({ "ref": format!("refs/heads/{name}"), "sha": sha });
        let _: Value = self
            .send_json(self.request(Method::POST, &url).json(&body), name)
            .await?;

        info!(repo = %repo, from, branch = name, "Created working branch");
        Ok(())
    }

    async fn create_pull_request(
        &self,
        repo: &RepoRef,
        draft: &PullRequestDraft,
    ) -> Result<PullRequest> {
        let url = self.repo_url(repo, "pulls");
        let value: Value = self
            .send_json(self.request(Method::POST, &url).json(draft), "pulls")
            .await?;

        Ok(PullRequest {
            number: value["number"].as_u64().unwrap_or_default(),
            url: value["html_url"].as_str().unwrap_or_default().to_string(),
        })
    }
}
