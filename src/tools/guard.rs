// src/tools/guard.rs
// Mutation safety: unique-target replacement, safe-mode working branches, pull requests

use tracing::info;

use super::types::{ChangeAction, ChangeSet};
use crate::cache::{CachedRepo, normalize_path};
use crate::config::DeployMode;
use crate::error::{PilotError, Result};
use crate::github::{FileWrite, PullRequest, PullRequestDraft};

pub const WORKING_BRANCH_PREFIX: &str = "repopilot/";
const TITLE_MAX_CHARS: usize = 72;

/// Line-count approximation of an edit, not a true diff
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LineDelta {
    pub additions: usize,
    pub deletions: usize,
}

impl LineDelta {
    pub fn between(old: &str, new: &str) -> Self {
        Self {
            additions: new.lines().count(),
            deletions: old.lines().count(),
        }
    }
}

/// Guards every write a turn makes.
///
/// In safe mode the first write on the default branch moves the turn onto a
/// fresh `repopilot/<hex>` branch; reads and writes after that use it.
pub struct MutationSafetyGuard {
    mode: DeployMode,
    default_branch: Option<String>,
    working_branch: Option<String>,
}

impl MutationSafetyGuard {
    pub fn new(mode: DeployMode) -> Self {
        Self {
            mode,
            default_branch: None,
            working_branch: None,
        }
    }

    pub fn mode(&self) -> DeployMode {
        self.mode
    }

    /// Branch writes go to, once one has been settled
    pub fn working_branch(&self) -> Option<&str> {
        self.working_branch.as_deref()
    }

    async fn default_branch(&mut self, repo: &CachedRepo) -> Result<String> {
        if let Some(branch) = &self.default_branch {
            return Ok(branch.clone());
        }
        let branch = repo.backend().default_branch(repo.repo()).await?;
        self.default_branch = Some(branch.clone());
        Ok(branch)
    }

    async fn ensure_writable_branch(&mut self, repo: &mut CachedRepo) -> Result<()> {
        if self.mode != DeployMode::Safe || self.working_branch.is_some() {
            return Ok(());
        }

        let default = self.default_branch(repo).await?;
        if repo.branch() != default {
            self.working_branch = Some(repo.branch().to_string());
            return Ok(());
        }

        let id = uuid::Uuid::new_v4().simple().to_string();
        let name = format!("{WORKING_BRANCH_PREFIX}{}", &id[..8]);
        repo.backend()
            .create_branch(repo.repo(), &default, &name)
            .await?;
        info!(repo = %repo.repo(), from = %default, branch = %name, "Moved writes to working branch");

        repo.switch_branch(name.clone());
        self.working_branch = Some(name);
        Ok(())
    }

    /// Replace the single occurrence of `old` in the live file.
    ///
    /// Zero or several occurrences fail with distinct errors and leave the
    /// repository untouched.
    pub async fn str_replace(
        &mut self,
        repo: &mut CachedRepo,
        path: &str,
        old: &str,
        new: &str,
    ) -> Result<LineDelta> {
        let path = normalize_path(path);
        if old.is_empty() {
            return Err(PilotError::InvalidInput("old_str must not be empty".into()));
        }

        let file = repo.get_file_live(&path).await?;
        match file.content.matches(old).count() {
            0 => return Err(PilotError::TargetNotFound { path }),
            1 => {}
            count => return Err(PilotError::AmbiguousTarget { path, count }),
        }
        let updated = file.content.replacen(old, new, 1);

        // A new working branch starts at the same commit, so the blob sha still applies
        self.ensure_writable_branch(repo).await?;
        let message = format!("repopilot: edit {path}");
        repo.backend()
            .put_file(
                repo.repo(),
                repo.branch(),
                FileWrite {
                    path: &path,
                    content: &updated,
                    sha: Some(&file.sha),
                    message: &message,
                },
            )
            .await?;
        repo.invalidate_file(&path);

        Ok(LineDelta::between(old, new))
    }

    /// Write a whole file. An existing file is overwritten and reported as an edit.
    pub async fn create_file(
        &mut self,
        repo: &mut CachedRepo,
        path: &str,
        content: &str,
    ) -> Result<(ChangeAction, LineDelta)> {
        let path = normalize_path(path);
        if path.is_empty() {
            return Err(PilotError::InvalidInput("path must not be empty".into()));
        }

        let existing = match repo.get_file_live(&path).await {
            Ok(file) => Some(file),
            Err(PilotError::NotFound(_)) => None,
            Err(e) => return Err(e),
        };

        self.ensure_writable_branch(repo).await?;
        let (action, message) = match existing {
            Some(_) => (ChangeAction::Edit, format!("repopilot: overwrite {path}")),
            None => (ChangeAction::Create, format!("repopilot: create {path}")),
        };
        repo.backend()
            .put_file(
                repo.repo(),
                repo.branch(),
                FileWrite {
                    path: &path,
                    content,
                    sha: existing.as_ref().map(|f| f.sha.as_str()),
                    message: &message,
                },
            )
            .await?;
        repo.invalidate_file(&path);
        repo.invalidate_tree();

        let previous = existing.as_ref().map(|f| f.content.as_str()).unwrap_or("");
        Ok((action, LineDelta::between(previous, content)))
    }

    /// Open a pull request from the active branch into the default branch.
    ///
    /// Returns `None` when there is nothing to propose or the active branch
    /// is the default branch.
    pub async fn open_pull_request(
        &mut self,
        repo: &CachedRepo,
        changes: &ChangeSet,
        request: &str,
    ) -> Result<Option<PullRequest>> {
        if changes.is_empty() {
            return Ok(None);
        }
        let base = self.default_branch(repo).await?;
        if repo.branch() == base {
            info!(branch = %base, "Changes are on the default branch, skipping pull request");
            return Ok(None);
        }

        let draft = build_pull_request(changes, repo.branch(), &base, request);
        let pr = repo
            .backend()
            .create_pull_request(repo.repo(), &draft)
            .await?;
        info!(repo = %repo.repo(), number = pr.number, url = %pr.url, "Opened pull request");
        Ok(Some(pr))
    }
}

/// Title from the user's request, body from the change list
pub fn build_pull_request(
    changes: &ChangeSet,
    head: &str,
    base: &str,
    request: &str,
) -> PullRequestDraft {
    let first_line = request.lines().map(str::trim).find(|l| !l.is_empty());
    let title = match first_line {
        Some(line) if line.chars().count() > TITLE_MAX_CHARS => {
            let cut: String = line.chars().take(TITLE_MAX_CHARS - 3).collect();
            format!("{cut}...")
        }
        Some(line) => line.to_string(),
        None if changes.len() == 1 => format!("Update {}", changes.as_slice()[0].path),
        None => format!("Update {} files", changes.len()),
    };

    let mut body = String::from("Changes proposed by repopilot.\n\n");
    if let Some(line) = first_line {
        body.push_str(&format!("> {line}\n\n"));
    }
    body.push_str("| File | Action | + | - |\n|---|---|---|---|\n");
    for change in changes.as_slice() {
        let action = match change.action {
            ChangeAction::Create => "create",
            ChangeAction::Edit => "edit",
            ChangeAction::Delete => "delete",
        };
        body.push_str(&format!(
            "| `{}` | {} | {} | {} |\n",
            change.path, action, change.additions, change.deletions
        ));
    }
    body.push_str(&format!(
        "\n{} file(s), +{}/-{} lines (approximate)\n",
        changes.len(),
        changes.total_additions(),
        changes.total_deletions()
    ));

    PullRequestDraft {
        title,
        body,
        head: head.to_string(),
        base: base.to_string(),
    }
}
