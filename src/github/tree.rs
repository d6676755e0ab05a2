// src/github/tree.rs
// Hierarchical repository tree built from the flat recursive listing

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Directory names never worth showing to the model
pub const IGNORED_DIRS: &[&str] = &[
    ".git",
    ".next",
    ".nuxt",
    ".cache",
    ".venv",
    "__pycache__",
    "bower_components",
    "build",
    "coverage",
    "dist",
    "node_modules",
    "out",
    "target",
    "vendor",
    "venv",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    File,
    Dir,
}

/// One row of the flat listing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TreeEntry {
    pub path: String,
    #[serde(rename = "type")]
    pub kind: EntryKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
}

impl TreeEntry {
    pub fn file(path: impl Into<String>, size: u64) -> Self {
        Self {
            path: path.into(),
            kind: EntryKind::File,
            size: Some(size),
        }
    }

    pub fn dir(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            kind: EntryKind::Dir,
            size: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TreeNode {
    pub name: String,
    pub path: String,
    #[serde(rename = "type")]
    pub kind: EntryKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<TreeNode>,
}

/// Filtered listing plus its hierarchy
#[derive(Debug, Clone, Default)]
pub struct RepoTree {
    entries: Vec<TreeEntry>,
    index: HashMap<String, usize>,
    pub nodes: Vec<TreeNode>,
}

impl RepoTree {
    /// Filter build/vendor directories and build the hierarchy
    pub fn from_entries(entries: Vec<TreeEntry>) -> Self {
        let mut entries: Vec<TreeEntry> = entries
            .into_iter()
            .filter(|e| !is_ignored(&e.path))
            .collect();
        entries.sort_by(|a, b| a.path.cmp(&b.path));

        let index = entries
            .iter()
            .enumerate()
            .map(|(i, e)| (e.path.clone(), i))
            .collect();
        let nodes = build_nodes(&entries);

        Self {
            entries,
            index,
            nodes,
        }
    }

    /// Tree from a caller-supplied path list (no sizes known)
    pub fn from_paths<I, S>(paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let entries = paths
            .into_iter()
            .map(|p| TreeEntry {
                path: p.as_ref().trim_matches('/').to_string(),
                kind: EntryKind::File,
                size: None,
            })
            .filter(|e| !e.path.is_empty())
            .collect();
        Self::from_entries(entries)
    }

    pub fn entries(&self) -> &[TreeEntry] {
        &self.entries
    }

    pub fn get(&self, path: &str) -> Option<&TreeEntry> {
        self.index.get(path).map(|&i| &self.entries[i])
    }

    pub fn files(&self) -> impl Iterator<Item = &TreeEntry> {
        self.entries.iter().filter(|e| e.kind == EntryKind::File)
    }

    pub fn file_count(&self) -> usize {
        self.files().count()
    }

    /// Indented listing for the system prompt, capped at `max_entries` lines
    pub fn render(&self, max_entries: usize) -> String {
        let mut out = String::new();
        let mut written = 0usize;
        render_nodes(&self.nodes, 0, max_entries, &mut written, &mut out);
        let total = count_nodes(&self.nodes);
        if written < total {
            out.push_str(&format!(
                "... ({} more entries not shown)\n",
                total - written
            ));
        }
        out
    }
}

/// True when any path component is an ignored directory
pub fn is_ignored(path: &str) -> bool {
    path.split('/').any(|part| IGNORED_DIRS.contains(&part))
}

/// Node under construction; children are indexes into the same arena
struct Slot {
    name: String,
    path: String,
    kind: EntryKind,
    size: Option<u64>,
    children: Vec<usize>,
}

// Parents are inferred from the path prefix; a missing parent row becomes a synthetic dir.
fn build_nodes(entries: &[TreeEntry]) -> Vec<TreeNode> {
    let mut slots: Vec<Slot> = Vec::new();
    let mut by_path: HashMap<String, usize> = HashMap::new();
    let mut roots: Vec<usize> = Vec::new();

    for entry in entries {
        let parts: Vec<&str> = entry.path.split('/').filter(|p| !p.is_empty()).collect();
        let mut parent: Option<usize> = None;
        let mut path = String::new();

        for (i, part) in parts.iter().enumerate() {
            if i > 0 {
                path.push('/');
            }
            path.push_str(part);

            let idx = match by_path.get(&path) {
                Some(&idx) => idx,
                None => {
                    let idx = slots.len();
                    slots.push(Slot {
                        name: part.to_string(),
                        path: path.clone(),
                        kind: EntryKind::Dir,
                        size: None,
                        children: Vec::new(),
                    });
                    by_path.insert(path.clone(), idx);
                    match parent {
                        Some(p) => slots[p].children.push(idx),
                        None => roots.push(idx),
                    }
                    idx
                }
            };

            if i + 1 == parts.len() {
                slots[idx].kind = entry.kind;
                slots[idx].size = entry.size;
            }
            parent = Some(idx);
        }
    }

    let mut nodes: Vec<TreeNode> = roots.iter().map(|&i| assemble(&slots, i)).collect();
    sort_nodes(&mut nodes);
    nodes
}

fn assemble(slots: &[Slot], idx: usize) -> TreeNode {
    let slot = &slots[idx];
    TreeNode {
        name: slot.name.clone(),
        path: slot.path.clone(),
        kind: slot.kind,
        size: slot.size,
        children: slot.children.iter().map(|&c| assemble(slots, c)).collect(),
    }
}

fn sort_nodes(nodes: &mut [TreeNode]) {
    nodes.sort_by(|a, b| match (a.kind, b.kind) {
        (EntryKind::Dir, EntryKind::File) => std::cmp::Ordering::Less,
        (EntryKind::File, EntryKind::Dir) => std::cmp::Ordering::Greater,
        _ => a.name.cmp(&b.name),
    });
    for node in nodes.iter_mut() {
        sort_nodes(&mut node.children);
    }
}

fn count_nodes(nodes: &[TreeNode]) -> usize {
    nodes.iter().map(|n| 1 + count_nodes(&n.children)).sum()
}

fn render_nodes(
    nodes: &[TreeNode],
    depth: usize,
    max_entries: usize,
    written: &mut usize,
    out: &mut String,
) {
    for node in nodes {
        if *written >= max_entries {
            return;
        }
        let indent = "  ".repeat(depth);
        match node.kind {
            EntryKind::Dir => out.push_str(&format!("{}{}/\n", indent, node.name)),
            EntryKind::File => out.push_str(&format!("{}{}\n", indent, node.name)),
        }
        *written += 1;
        render_nodes(&node.children, depth + 1, max_entries, written, out);
    }
}
