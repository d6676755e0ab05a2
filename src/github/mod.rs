// src/github/mod.rs
// Source-control backend: the RepoBackend seam plus the GitHub REST implementation

mod client;
pub mod tree;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::Result;

pub use client::GitHubClient;
pub use tree::{EntryKind, RepoTree, TreeEntry, TreeNode};

/// Owner/name pair identifying a repository
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RepoRef {
    pub owner: String,
    pub repo: String,
}

impl RepoRef {
    pub fn new(owner: impl Into<String>, repo: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            repo: repo.into(),
        }
    }
}

impl fmt::Display for RepoRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.owner, self.repo)
    }
}

/// Decoded file content at a given revision
#[derive(Debug, Clone, PartialEq)]
pub struct FileContent {
    pub path: String,
    pub content: String,
    /// Blob SHA, required by the contents API to update the file
    pub sha: String,
}

/// A single-file commit
#[derive(Debug, Clone)]
pub struct FileWrite<'a> {
    pub path: &'a str,
    pub content: &'a str,
    /// Existing blob SHA; `None` creates the file
    pub sha: Option<&'a str>,
    pub message: &'a str,
}

#[derive(Debug, Clone, Serialize)]
pub struct PullRequestDraft {
    pub title: String,
    pub body: String,
    pub head: String,
    pub base: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PullRequest {
    pub number: u64,
    pub url: String,
}

/// Everything the tool layer needs from a code-hosting service.
///
/// Network failures propagate as errors; callers decide whether to surface
/// them to the model or to the client.
#[async_trait]
pub trait RepoBackend: Send + Sync {
    /// Flat recursive listing of a branch
    async fn list_tree(&self, repo: &RepoRef, branch: &str) -> Result<Vec<TreeEntry>>;

    /// Fetch one file, refusing anything over `max_bytes`
    async fn get_file(
        &self,
        repo: &RepoRef,
        branch: &str,
        path: &str,
        max_bytes: u64,
    ) -> Result<FileContent>;

    /// Commit a file; returns the new blob SHA
    async fn put_file(&self, repo: &RepoRef, branch: &str, write: FileWrite<'_>) -> Result<String>;

    async fn default_branch(&self, repo: &RepoRef) -> Result<String>;

    /// Create `name` pointing at the head of `from`
    async fn create_branch(&self, repo: &RepoRef, from: &str, name: &str) -> Result<()>;

    async fn create_pull_request(
        &self,
        repo: &RepoRef,
        draft: &PullRequestDraft,
    ) -> Result<PullRequest>;
}
