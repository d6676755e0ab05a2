// src/tools/types.rs
// Shared types for tool execution

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeAction {
    Create,
    Edit,
    Delete,
}

/// One create/edit/delete applied to the repository during a turn
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileChange {
    pub path: String,
    pub action: ChangeAction,
    pub additions: usize,
    pub deletions: usize,
}

impl FileChange {
    pub fn new(path: impl Into<String>, action: ChangeAction, additions: usize, deletions: usize) -> Self {
        Self {
            path: path.into(),
            action,
            additions,
            deletions,
        }
    }
}

/// Changes accumulated over a turn, one entry per path in first-touched order
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChangeSet {
    changes: Vec<FileChange>,
}

impl ChangeSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge into the entry for the same path. A file created this turn
    /// stays a create however often it is edited afterwards.
    pub fn record(&mut self, change: FileChange) {
        match self.changes.iter_mut().find(|c| c.path == change.path) {
            Some(existing) => {
                existing.additions += change.additions;
                existing.deletions += change.deletions;
                if existing.action != ChangeAction::Create {
                    existing.action = change.action;
                }
            }
            None => self.changes.push(change),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.changes.len()
    }

    pub fn as_slice(&self) -> &[FileChange] {
        &self.changes
    }

    pub fn into_vec(self) -> Vec<FileChange> {
        self.changes
    }

    pub fn total_additions(&self) -> usize {
        self.changes.iter().map(|c| c.additions).sum()
    }

    pub fn total_deletions(&self) -> usize {
        self.changes.iter().map(|c| c.deletions).sum()
    }
}

/// Outcome of one tool call as surfaced to the model
#[derive(Debug, Clone, PartialEq)]
pub struct ToolOutput {
    pub content: String,
    pub truncated: bool,
    pub is_error: bool,
    /// Set for successful mutations
    pub change: Option<FileChange>,
}

impl ToolOutput {
    pub fn ok(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            truncated: false,
            is_error: false,
            change: None,
        }
    }

    pub fn error(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            truncated: false,
            is_error: true,
            change: None,
        }
    }

    pub fn with_change(mut self, change: FileChange) -> Self {
        self.change = Some(change);
        self
    }
}

/// The answer to one tool_use, paired by id
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolResult {
    pub tool_use_id: String,
    pub name: String,
    pub content: String,
    pub truncated: bool,
    pub is_error: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_changes_merge_per_path() {
        let mut set = ChangeSet::new();
        set.record(FileChange::new("utils.ts", ChangeAction::Edit, 1, 1));
        set.record(FileChange::new("README.md", ChangeAction::Edit, 3, 0));
        set.record(FileChange::new("utils.ts", ChangeAction::Edit, 2, 5));

        assert_eq!(set.len(), 2);
        assert_eq!(set.as_slice()[0], FileChange::new("utils.ts", ChangeAction::Edit, 3, 6));
        assert_eq!(set.total_additions(), 6);
        assert_eq!(set.total_deletions(), 6);
    }

    #[test]
    fn test_create_survives_later_edits() {
        let mut set = ChangeSet::new();
        set.record(FileChange::new("new.rs", ChangeAction::Create, 10, 0));
        set.record(FileChange::new("new.rs", ChangeAction::Edit, 1, 1));
        assert_eq!(set.as_slice()[0].action, ChangeAction::Create);
        assert_eq!(set.as_slice()[0].additions, 11);
    }

    #[test]
    fn test_file_change_wire_shape() {
        let v = serde_json::to_value(FileChange::new("a.rs", ChangeAction::Edit, 1, 2)).unwrap();
        assert_eq!(v["action"], "edit");
        assert_eq!(v["additions"], 1);
        assert_eq!(v["deletions"], 2);
    }
}
