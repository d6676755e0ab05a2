// tests/common/mod.rs
// In-memory fakes for the repository and model seams

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use repopilot::chat::{ChatEvent, Connector};
use repopilot::error::{PilotError, Result};
use repopilot::github::{
    FileContent, FileWrite, PullRequest, PullRequestDraft, RepoBackend, RepoRef, TreeEntry,
};
use repopilot::llm::{
    ChatModel, ChatRequest, Completion, ContentBlock, ModelEvent, ModelInfo, TokenUsage, ToolUse,
};

pub const DEFAULT_BRANCH: &str = "main";

pub fn repo_ref() -> RepoRef {
    RepoRef::new("acme", "web")
}

// ============================================================================
// Repository
// ============================================================================

#[derive(Debug, Clone)]
struct Blob {
    content: String,
    sha: String,
}

/// Branch-aware in-memory repository with call counters
#[derive(Default)]
pub struct InMemoryRepo {
    files: Mutex<HashMap<(String, String), Blob>>,
    next_sha: AtomicUsize,
    pub tree_fetches: AtomicUsize,
    pub file_fetches: AtomicUsize,
    pub writes: AtomicUsize,
    /// While set, file reads fail as if the API were down
    pub fail_reads: AtomicBool,
    pub branches_created: Mutex<Vec<String>>,
    pub pull_requests: Mutex<Vec<PullRequestDraft>>,
}

impl InMemoryRepo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_file(self, path: &str, content: &str) -> Self {
        self.insert(DEFAULT_BRANCH, path, content);
        self
    }

    fn insert(&self, branch: &str, path: &str, content: &str) -> String {
        let sha = format!("sha{}", self.next_sha.fetch_add(1, Ordering::SeqCst));
        self.files.lock().unwrap().insert(
            (branch.to_string(), path.to_string()),
            Blob {
                content: content.to_string(),
                sha: sha.clone(),
            },
        );
        sha
    }

    pub fn content(&self, branch: &str, path: &str) -> Option<String> {
        self.files
            .lock()
            .unwrap()
            .get(&(branch.to_string(), path.to_string()))
            .map(|b| b.content.clone())
    }

    pub fn fetches(&self) -> usize {
        self.file_fetches.load(Ordering::SeqCst)
    }

    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl RepoBackend for InMemoryRepo {
    async fn list_tree(&self, _repo: &RepoRef, branch: &str) -> Result<Vec<TreeEntry>> {
        self.tree_fetches.fetch_add(1, Ordering::SeqCst);
        let files = self.files.lock().unwrap();
        Ok(files
            .iter()
            .filter(|((b, _), _)| b == branch)
            .map(|((_, path), blob)| TreeEntry::file(path.clone(), blob.content.len() as u64))
            .collect())
    }

    async fn get_file(
        &self,
        _repo: &RepoRef,
        branch: &str,
        path: &str,
        max_bytes: u64,
    ) -> Result<FileContent> {
        self.file_fetches.fetch_add(1, Ordering::SeqCst);
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(PilotError::Repository {
                status: 503,
                message: "service unavailable".to_string(),
            });
        }
        let files = self.files.lock().unwrap();
        let blob = files
            .get(&(branch.to_string(), path.to_string()))
            .ok_or_else(|| PilotError::NotFound(path.to_string()))?;
        if blob.content.len() as u64 > max_bytes {
            return Err(PilotError::FileTooLarge {
                path: path.to_string(),
                size: blob.content.len() as u64,
                limit: max_bytes,
            });
        }
        Ok(FileContent {
            path: path.to_string(),
            content: blob.content.clone(),
            sha: blob.sha.clone(),
        })
    }

    async fn put_file(&self, _repo: &RepoRef, branch: &str, write: FileWrite<'_>) -> Result<String> {
        let current = self
            .files
            .lock()
            .unwrap()
            .get(&(branch.to_string(), write.path.to_string()))
            .map(|b| b.sha.clone());
        if current.as_deref() != write.sha {
            return Err(PilotError::Repository {
                status: 409,
                message: format!("{} does not match", write.path),
            });
        }
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(self.insert(branch, write.path, write.content))
    }

    async fn default_branch(&self, _repo: &RepoRef) -> Result<String> {
        Ok(DEFAULT_BRANCH.to_string())
    }

    async fn create_branch(&self, _repo: &RepoRef, from: &str, name: &str) -> Result<()> {
        let mut files = self.files.lock().unwrap();
        let copies: Vec<_> = files
            .iter()
            .filter(|((b, _), _)| b == from)
            .map(|((_, path), blob)| ((name.to_string(), path.clone()), blob.clone()))
            .collect();
        files.extend(copies);
        self.branches_created.lock().unwrap().push(name.to_string());
        Ok(())
    }

    async fn create_pull_request(
        &self,
        repo: &RepoRef,
        draft: &PullRequestDraft,
    ) -> Result<PullRequest> {
        let mut prs = self.pull_requests.lock().unwrap();
        prs.push(draft.clone());
        let number = prs.len() as u64;
        Ok(PullRequest {
            number,
            url: format!("https://github.com/{repo}/pull/{number}"),
        })
    }
}

// ============================================================================
// Model
// ============================================================================

/// One scripted action of a model response
#[derive(Debug, Clone)]
pub enum Step {
    Text(&'static str),
    Thinking(&'static str),
    Tool(&'static str, Value),
    /// Terminal upstream failure instead of a completion
    Fail(u16, &'static str),
    /// Stall until cancelled
    Hang,
    /// End the call with `pause_turn`, as a long server-tool turn does
    Pause,
}

pub const ROUND_COST: f64 = 0.01;

pub fn round_usage() -> TokenUsage {
    TokenUsage {
        input: 1000,
        output: 100,
        cache_read: 500,
        cache_write: 0,
    }
}

/// Replays one script per inference call. When `looping`, the last script
/// repeats forever.
pub struct ScriptedModel {
    scripts: Mutex<VecDeque<Vec<Step>>>,
    looping: Option<Vec<Step>>,
    pub calls: AtomicUsize,
    pub requests: Mutex<Vec<ChatRequest>>,
}

impl ScriptedModel {
    pub fn new(scripts: Vec<Vec<Step>>) -> Self {
        Self {
            scripts: Mutex::new(scripts.into()),
            looping: None,
            calls: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn looping(script: Vec<Step>) -> Self {
        Self {
            looping: Some(script),
            ..Self::new(Vec::new())
        }
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChatModel for ScriptedModel {
    fn stream(&self, request: ChatRequest, cancel: CancellationToken) -> mpsc::Receiver<ModelEvent> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().unwrap().push(request);
        let script = self
            .scripts
            .lock()
            .unwrap()
            .pop_front()
            .or_else(|| self.looping.clone())
            .unwrap_or_else(|| vec![Step::Text("(no script)")]);

        let (tx, rx) = mpsc::channel(16);
        tokio::spawn(async move {
            let mut content = Vec::new();
            let mut stop_reason = "end_turn";
            for (i, step) in script.into_iter().enumerate() {
                match step {
                    Step::Text(text) => {
                        content.push(ContentBlock::text(text));
                        let _ = tx.send(ModelEvent::Text(text.to_string())).await;
                    }
                    Step::Thinking(text) => {
                        content.push(ContentBlock::Thinking {
                            thinking: text.to_string(),
                            signature: "sig".to_string(),
                        });
                        let _ = tx.send(ModelEvent::Thinking(text.to_string())).await;
                    }
                    Step::Tool(name, input) => {
                        let call = ToolUse {
                            id: format!("toolu_{call}_{i}"),
                            name: name.to_string(),
                            input,
                        };
                        content.push(call.clone().into());
                        let _ = tx.send(ModelEvent::ToolUse(call)).await;
                    }
                    Step::Fail(status, message) => {
                        let _ = tx
                            .send(ModelEvent::Error(PilotError::Upstream {
                                status,
                                message: message.to_string(),
                            }))
                            .await;
                        return;
                    }
                    Step::Hang => {
                        cancel.cancelled().await;
                        return;
                    }
                    Step::Pause => {
                        content.push(ContentBlock::ServerToolUse {
                            id: format!("srvtoolu_{call}_{i}"),
                            name: "web_search".to_string(),
                            input: serde_json::json!({"query": "latest release"}),
                        });
                        stop_reason = "pause_turn";
                        break;
                    }
                }
            }
            let _ = tx
                .send(ModelEvent::Done(Completion {
                    content,
                    usage: round_usage(),
                    cost: ROUND_COST,
                    stop_reason: Some(stop_reason.to_string()),
                }))
                .await;
        });
        rx
    }

    async fn list_models(&self) -> Result<Vec<ModelInfo>> {
        Ok(vec![ModelInfo {
            id: "claude-sonnet-4-5".to_string(),
            display_name: Some("Claude Sonnet 4.5".to_string()),
            pricing: None,
        }])
    }
}

// ============================================================================
// Connector and helpers
// ============================================================================

pub struct FakeConnector {
    pub model: Arc<ScriptedModel>,
    pub repo: Arc<InMemoryRepo>,
}

impl Connector for FakeConnector {
    fn chat_model(&self, _api_key: &str) -> Arc<dyn ChatModel> {
        self.model.clone()
    }

    fn repo_backend(&self, _token: &str) -> Arc<dyn RepoBackend> {
        self.repo.clone()
    }
}

/// Drain every event the turn sent
pub async fn collect(mut rx: mpsc::Receiver<ChatEvent>) -> Vec<ChatEvent> {
    let mut events = Vec::new();
    while let Some(event) = rx.recv().await {
        events.push(event);
    }
    events
}

pub fn tool_results(events: &[ChatEvent]) -> Vec<(String, String)> {
    events
        .iter()
        .filter_map(|e| match e {
            ChatEvent::ToolResult { name, result, .. } => Some((name.clone(), result.clone())),
            _ => None,
        })
        .collect()
}

pub fn all_text(events: &[ChatEvent]) -> String {
    events
        .iter()
        .filter_map(|e| match e {
            ChatEvent::Text { content } => Some(content.as_str()),
            _ => None,
        })
        .collect()
}
