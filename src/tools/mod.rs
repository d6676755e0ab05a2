// src/tools/mod.rs
// Repository tools: the closed set of calls the model may make, and their executor
//
// Every call produces exactly one ToolOutput. Repository failures become
// error text the model can act on; nothing escapes the executor.

mod definitions;
pub mod guard;
mod search;
pub mod types;

use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, info, warn};

pub use definitions::get_tools;
pub use guard::{LineDelta, MutationSafetyGuard};
pub use types::{ChangeAction, ChangeSet, FileChange, ToolOutput, ToolResult};

use crate::cache::CachedRepo;
use crate::config::LimitsConfig;
use crate::error::PilotError;
use crate::github::PullRequest;
use crate::llm::ToolUse;

/// A validated tool invocation
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "name", content = "input", rename_all = "snake_case")]
pub enum ToolCall {
    ReadFile {
        path: String,
    },
    SearchFiles {
        query: String,
    },
    GrepSearch {
        query: String,
        #[serde(default)]
        extensions: Vec<String>,
    },
    StrReplace {
        path: String,
        old_str: String,
        new_str: String,
    },
    CreateFile {
        path: String,
        content: String,
    },
    VerifyEdit {
        path: String,
        expected_snippet: String,
    },
}

impl ToolCall {
    /// Validate a raw tool_use against the declared schemas
    pub fn parse(name: &str, input: &Value) -> Result<Self, PilotError> {
        serde_json::from_value(json!({ "name": name, "input": input }))
            .map_err(|e| PilotError::InvalidInput(format!("{name}: {e}")))
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::ReadFile { .. } => "read_file",
            Self::SearchFiles { .. } => "search_files",
            Self::GrepSearch { .. } => "grep_search",
            Self::StrReplace { .. } => "str_replace",
            Self::CreateFile { .. } => "create_file",
            Self::VerifyEdit { .. } => "verify_edit",
        }
    }

    pub fn is_mutation(&self) -> bool {
        matches!(self, Self::StrReplace { .. } | Self::CreateFile { .. })
    }

    /// Short human-readable label for progress events
    pub fn describe(&self) -> String {
        match self {
            Self::ReadFile { path } => format!("Reading {path}"),
            Self::SearchFiles { query } => format!("Searching files for \"{query}\""),
            Self::GrepSearch { query, .. } => format!("Searching code for \"{query}\""),
            Self::StrReplace { path, .. } => format!("Editing {path}"),
            Self::CreateFile { path, .. } => format!("Creating {path}"),
            Self::VerifyEdit { path, .. } => format!("Verifying {path}"),
        }
    }
}

/// Executes tool calls against one repository binding
pub struct ToolExecutor {
    repo: CachedRepo,
    guard: MutationSafetyGuard,
    limits: LimitsConfig,
}

impl ToolExecutor {
    pub fn new(repo: CachedRepo, guard: MutationSafetyGuard, limits: LimitsConfig) -> Self {
        Self {
            repo,
            guard,
            limits,
        }
    }

    pub fn repo(&self) -> &CachedRepo {
        &self.repo
    }

    /// Branch the turn's writes landed on, when one was settled
    pub fn working_branch(&self) -> Option<&str> {
        self.guard.working_branch()
    }

    /// Propose the accumulated changes as a pull request
    pub async fn open_pull_request(
        &mut self,
        changes: &ChangeSet,
        request: &str,
    ) -> crate::error::Result<Option<PullRequest>> {
        self.guard
            .open_pull_request(&self.repo, changes, request)
            .await
    }

    /// Run one tool_use to completion. Never fails.
    pub async fn execute(&mut self, call: &ToolUse) -> ToolOutput {
        let parsed = match ToolCall::parse(&call.name, &call.input) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!(tool = %call.name, error = %e, "Rejected tool call");
                return ToolOutput::error(format!("Error: {e}"));
            }
        };

        let output = self.dispatch(&parsed).await;
        debug!(
            tool = parsed.name(),
            is_error = output.is_error,
            truncated = output.truncated,
            chars = output.content.len(),
            "Tool finished"
        );

        if matches!(parsed, ToolCall::ReadFile { .. }) {
            output
        } else {
            cap_output(output, self.limits.tool_result_max_chars)
        }
    }

    async fn dispatch(&mut self, call: &ToolCall) -> ToolOutput {
        match call {
            ToolCall::ReadFile { path } => self.read_file(path).await,
            ToolCall::SearchFiles { query } => {
                search::search_files(&self.repo, query, self.limits.max_search_results).await
            }
            ToolCall::GrepSearch { query, extensions } => {
                search::grep_search(&self.repo, query, extensions, &self.limits).await
            }
            ToolCall::StrReplace {
                path,
                old_str,
                new_str,
            } => self.str_replace(path, old_str, new_str).await,
            ToolCall::CreateFile { path, content } => self.create_file(path, content).await,
            ToolCall::VerifyEdit {
                path,
                expected_snippet,
            } => self.verify_edit(path, expected_snippet).await,
        }
    }

    async fn read_file(&self, path: &str) -> ToolOutput {
        let file = match self.repo.get_file(path).await {
            Ok(file) => file,
            Err(e) => return error_output(&e),
        };

        let total = file.content.chars().count();
        let max = self.limits.read_file_max_chars;
        if total <= max {
            return ToolOutput::ok(format!(
                "File: {} ({} characters)\n\n{}",
                file.path, total, file.content
            ));
        }

        let shown: String = file.content.chars().take(max).collect();
        ToolOutput {
            content: format!(
                "File: {} ({} characters, truncated to the first {})\n\n{}\n\n[truncated: {} more characters not shown]",
                file.path,
                total,
                max,
                shown,
                total - max
            ),
            truncated: true,
            is_error: false,
            change: None,
        }
    }

    async fn str_replace(&mut self, path: &str, old: &str, new: &str) -> ToolOutput {
        match self.guard.str_replace(&mut self.repo, path, old, new).await {
            Ok(delta) => {
                info!(path, additions = delta.additions, deletions = delta.deletions, "Applied str_replace");
                let path = crate::cache::normalize_path(path);
                ToolOutput::ok(format!(
                    "Edited {path}: +{}/-{} lines (committed to {})",
                    delta.additions,
                    delta.deletions,
                    self.repo.branch()
                ))
                .with_change(FileChange::new(
                    path,
                    ChangeAction::Edit,
                    delta.additions,
                    delta.deletions,
                ))
            }
            Err(e) => error_output(&e),
        }
    }

    async fn create_file(&mut self, path: &str, content: &str) -> ToolOutput {
        match self.guard.create_file(&mut self.repo, path, content).await {
            Ok((action, delta)) => {
                let path = crate::cache::normalize_path(path);
                let verb = match action {
                    ChangeAction::Create => "Created",
                    _ => "Overwrote",
                };
                ToolOutput::ok(format!(
                    "{verb} {path}: +{}/-{} lines (committed to {})",
                    delta.additions,
                    delta.deletions,
                    self.repo.branch()
                ))
                .with_change(FileChange::new(path, action, delta.additions, delta.deletions))
            }
            Err(e) => error_output(&e),
        }
    }

    async fn verify_edit(&self, path: &str, expected: &str) -> ToolOutput {
        match self.repo.get_file_live(path).await {
            Ok(file) if file.content.contains(expected) => ToolOutput::ok(format!(
                "VERIFIED: {} contains the expected snippet",
                file.path
            )),
            Ok(file) => ToolOutput::ok(format!(
                "NOT VERIFIED: {} does not contain the expected snippet. Re-read the file and fix the edit.",
                file.path
            )),
            Err(e) => error_output(&e),
        }
    }
}

/// Error text for the model, with a hint when it can fix the call itself
fn error_output(err: &PilotError) -> ToolOutput {
    if !err.is_retryable_by_model() {
        warn!(error = %err, "Tool failed on the repository side");
    }
    let hint = match err {
        PilotError::TargetNotFound { .. } => {
            " Re-read the file and copy old_str exactly, including whitespace."
        }
        PilotError::AmbiguousTarget { .. } => {
            " Include more surrounding context so old_str matches exactly once."
        }
        PilotError::FileTooLarge { .. } => " Use grep_search to inspect it instead.",
        PilotError::NotFound(_) => " Use search_files to find the right path.",
        _ => "",
    };
    ToolOutput::error(format!("Error: {err}.{hint}"))
}

/// Clip tool text to `max` characters
pub fn cap_output(mut output: ToolOutput, max: usize) -> ToolOutput {
    let total = output.content.chars().count();
    if total > max {
        let mut clipped: String = output.content.chars().take(max).collect();
        clipped.push_str(&format!("\n\n[output truncated at {max} of {total} characters]"));
        output.content = clipped;
        output.truncated = true;
    }
    output
}
