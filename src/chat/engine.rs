// src/chat/engine.rs
// Turn setup: credentials, repository binding, context assembly

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::context::{
    ChatPayload, RepoSnapshot, WebSearchMode, attach_files, build_system, normalize_messages,
    tree_from_cached,
};
use super::events::ChatEvent;
use super::orchestrator::{ConversationOrchestrator, TurnRequest, TurnSummary};
use crate::cache::RepositoryCache;
use crate::config::Config;
use crate::error::{PilotError, Result};
use crate::github::{GitHubClient, RepoBackend, RepoTree};
use crate::llm::{AnthropicClient, ChatModel, CostTracker, ModelInfo, Role};
use crate::tools::{MutationSafetyGuard, ToolExecutor};

const FALLBACK_BRANCH: &str = "main";

/// Builds the two upstream clients from per-request credentials
pub trait Connector: Send + Sync {
    fn chat_model(&self, api_key: &str) -> Arc<dyn ChatModel>;
    fn repo_backend(&self, token: &str) -> Arc<dyn RepoBackend>;
}

/// Connector for the real Anthropic and GitHub APIs
pub struct HttpConnector {
    anthropic_url: String,
    github_url: String,
    idle_timeout: Duration,
}

impl HttpConnector {
    pub fn from_config(config: &Config) -> Self {
        Self {
            anthropic_url: config.anthropic_api_url.clone(),
            github_url: config.github_api_url.clone(),
            idle_timeout: config.limits.stream_idle_timeout(),
        }
    }
}

impl Connector for HttpConnector {
    fn chat_model(&self, api_key: &str) -> Arc<dyn ChatModel> {
        Arc::new(
            AnthropicClient::new(api_key, &self.anthropic_url).with_idle_timeout(self.idle_timeout),
        )
    }

    fn repo_backend(&self, token: &str) -> Arc<dyn RepoBackend> {
        Arc::new(GitHubClient::new(&self.github_url, token))
    }
}

/// Per-request credentials from headers; each falls back to the server's own
#[derive(Debug, Clone, Default)]
pub struct Credentials {
    pub api_key: Option<String>,
    pub github_token: Option<String>,
}

fn pick(request: Option<&str>, server: Option<&str>) -> Option<String> {
    request
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .or(server)
        .map(str::to_string)
}

/// Process-wide chat state: the repository cache, usage totals, and the
/// connector. Turns share nothing else.
pub struct ChatEngine {
    config: Config,
    cache: Arc<RepositoryCache>,
    connector: Arc<dyn Connector>,
    usage: Arc<Mutex<CostTracker>>,
}

impl ChatEngine {
    pub fn new(config: Config, connector: Arc<dyn Connector>) -> Self {
        Self {
            cache: Arc::new(RepositoryCache::new(config.cache.clone())),
            config,
            connector,
            usage: Arc::new(Mutex::new(CostTracker::new())),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn cache(&self) -> &Arc<RepositoryCache> {
        &self.cache
    }

    pub fn usage(&self) -> &Arc<Mutex<CostTracker>> {
        &self.usage
    }

    fn api_key(&self, creds: &Credentials) -> Result<String> {
        pick(
            creds.api_key.as_deref(),
            self.config.anthropic_api_key.as_deref(),
        )
        .ok_or_else(|| {
            PilotError::MissingCredential(
                "send an x-api-key header or configure anthropic_api_key".into(),
            )
        })
    }

    pub async fn list_models(&self, creds: &Credentials) -> Result<Vec<ModelInfo>> {
        let key = self.api_key(creds)?;
        self.connector.chat_model(&key).list_models().await
    }

    /// Validate the payload and assemble everything one turn needs
    pub async fn prepare(&self, payload: ChatPayload, creds: &Credentials) -> Result<PreparedTurn> {
        let mut messages = normalize_messages(payload.messages)?;
        attach_files(&mut messages, &payload.files)?;
        let request_text = messages
            .last()
            .filter(|m| m.role == Role::User)
            .map(|m| m.text())
            .unwrap_or_default();

        let api_key = self.api_key(creds)?;
        let model = self.connector.chat_model(&api_key);
        let settings = payload.settings;
        let model_id = settings
            .model
            .clone()
            .filter(|m| !m.trim().is_empty())
            .unwrap_or_else(|| self.config.default_model.clone());

        let mut executor = None;
        let mut branch = None;
        let mut tree: Option<Arc<RepoTree>> = None;
        let repo_ref;
        let cached_files;
        let repo_tools = payload.repo_context.is_some();

        if let Some(ctx) = payload.repo_context {
            let repo = ctx.repo_ref();
            if repo.owner.is_empty() || repo.repo.is_empty() {
                return Err(PilotError::InvalidInput(
                    "repoContext needs both owner and repo".into(),
                ));
            }
            let token = pick(
                creds.github_token.as_deref(),
                self.config.github_token.as_deref(),
            );
            let backend = token.map(|t| self.connector.repo_backend(&t));

            let name = match (ctx.branch.as_deref().map(str::trim), &backend) {
                (Some(b), _) if !b.is_empty() => b.to_string(),
                (_, Some(backend)) => backend.default_branch(&repo).await.unwrap_or_else(|e| {
                    warn!(repo = %repo, error = %e, "Could not resolve default branch");
                    FALLBACK_BRANCH.to_string()
                }),
                _ => FALLBACK_BRANCH.to_string(),
            };

            if let Some(entries) = ctx.cached_tree.as_deref() {
                debug!(entries = entries.len(), "Using caller-supplied tree");
                tree = Some(Arc::new(tree_from_cached(entries)));
            }
            if let Some(backend) = backend {
                let bound = self.cache.bind(backend, repo.clone(), name.clone());
                if tree.is_none() {
                    match bound.get_tree().await {
                        Ok(t) => tree = Some(t),
                        Err(e) => warn!(repo = %repo, error = %e, "Could not load repository tree"),
                    }
                }
                executor = Some(ToolExecutor::new(
                    bound,
                    MutationSafetyGuard::new(self.config.deploy_mode),
                    self.config.limits.clone(),
                ));
            } else {
                info!(repo = %repo, "No GitHub token, repository tools are unavailable");
            }

            branch = Some(name);
            repo_ref = Some(repo);
            cached_files = ctx.cached_files.unwrap_or_default();
        } else {
            repo_ref = None;
            cached_files = Vec::new();
        }

        let snapshot = RepoSnapshot {
            repo: repo_ref.as_ref(),
            branch: branch.as_deref(),
            tree: tree.as_deref(),
            files: &cached_files,
        };
        let system = build_system(
            &settings,
            &snapshot,
            self.config.limits.tree_prompt_max_entries,
            self.config.limits.read_file_max_chars,
        );

        let orchestrator = ConversationOrchestrator::new(
            model,
            executor,
            self.config.limits.clone(),
            self.config.deploy_mode,
        )
        .with_usage_sink(Arc::clone(&self.usage));

        Ok(PreparedTurn {
            orchestrator,
            turn: TurnRequest {
                model: model_id,
                system,
                messages,
                effort: settings.effort,
                thinking: settings.enable_thinking,
                web_search: settings.web_search_mode == WebSearchMode::Auto,
                repo_tools,
                request_text,
            },
        })
    }
}

/// A validated turn, ready to run
pub struct PreparedTurn {
    orchestrator: ConversationOrchestrator,
    turn: TurnRequest,
}

impl PreparedTurn {
    pub fn request(&self) -> &TurnRequest {
        &self.turn
    }

    pub async fn run(
        self,
        events: mpsc::Sender<ChatEvent>,
        cancel: CancellationToken,
    ) -> Result<TurnSummary> {
        self.orchestrator.run(self.turn, events, cancel).await
    }
}
