// src/chat/context.rs
// Inbound request shapes and context assembly: history normalisation,
// uploaded files, and the cacheable system prefix

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::Deserialize;

use crate::error::{PilotError, Result};
use crate::github::{EntryKind, RepoRef, RepoTree, TreeEntry};
use crate::llm::{ContentBlock, Effort, MediaSource, Message, Role};

/// Body of the chat endpoints
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatPayload {
    pub messages: Vec<IncomingMessage>,
    #[serde(default)]
    pub settings: ChatSettings,
    #[serde(default)]
    pub repo_context: Option<RepoContext>,
    #[serde(default)]
    pub files: Vec<UploadedFile>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IncomingMessage {
    pub role: Role,
    #[serde(default)]
    pub content: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WebSearchMode {
    #[default]
    Off,
    Auto,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ChatSettings {
    pub model: Option<String>,
    pub effort: Effort,
    pub enable_thinking: bool,
    pub web_search_mode: WebSearchMode,
    /// Extra instructions appended to the system prompt
    pub custom_instructions: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepoContext {
    pub owner: String,
    pub repo: String,
    #[serde(default)]
    pub branch: Option<String>,
    #[serde(default)]
    pub cached_tree: Option<Vec<CachedTreeEntry>>,
    #[serde(default)]
    pub cached_files: Option<Vec<CachedFile>>,
}

impl RepoContext {
    pub fn repo_ref(&self) -> RepoRef {
        RepoRef::new(self.owner.trim(), self.repo.trim())
    }
}

/// A caller-held tree row: a bare path or a full entry
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum CachedTreeEntry {
    Path(String),
    Entry(TreeEntry),
}

#[derive(Debug, Clone, Deserialize)]
pub struct CachedFile {
    pub path: String,
    pub content: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadedFile {
    pub name: String,
    #[serde(default)]
    pub mime_type: Option<String>,
    pub base64: String,
}

/// Tree built from a caller-supplied listing
pub fn tree_from_cached(entries: &[CachedTreeEntry]) -> RepoTree {
    let rows = entries
        .iter()
        .map(|e| match e {
            CachedTreeEntry::Path(path) => TreeEntry {
                path: path.trim_matches('/').to_string(),
                kind: EntryKind::File,
                size: None,
            },
            CachedTreeEntry::Entry(entry) => entry.clone(),
        })
        .filter(|e| !e.path.is_empty())
        .collect();
    RepoTree::from_entries(rows)
}

/// Drop blank messages, merge consecutive same-role messages, and drop
/// leading assistant messages. The result must end with a user message.
pub fn normalize_messages(messages: Vec<IncomingMessage>) -> Result<Vec<Message>> {
    let mut out: Vec<Message> = Vec::new();

    for msg in messages {
        let text = msg.content.trim();
        if text.is_empty() {
            continue;
        }
        if out.is_empty() && msg.role == Role::Assistant {
            continue;
        }
        match out.last_mut() {
            Some(last) if last.role == msg.role => {
                last.content.push(ContentBlock::text(text));
            }
            _ => out.push(Message::new(msg.role, vec![ContentBlock::text(text)])),
        }
    }

    match out.last() {
        Some(last) if last.role == Role::User => Ok(out),
        Some(_) => Err(PilotError::InvalidInput(
            "the last message must be from the user".into(),
        )),
        None => Err(PilotError::InvalidInput("no non-empty messages".into())),
    }
}

/// Content block for one uploaded file
pub fn file_block(file: &UploadedFile) -> Result<ContentBlock> {
    let mime = file
        .mime_type
        .clone()
        .filter(|m| !m.trim().is_empty())
        .unwrap_or_else(|| {
            mime_guess::from_path(&file.name)
                .first_or_octet_stream()
                .to_string()
        });
    // Data URLs are accepted as well as bare base64
    let data = match file.base64.split_once(";base64,") {
        Some((_, rest)) => rest.trim(),
        None => file.base64.trim(),
    };

    if mime.starts_with("image/") {
        return Ok(ContentBlock::Image {
            source: MediaSource::base64(mime, data),
        });
    }
    if mime == "application/pdf" {
        return Ok(ContentBlock::Document {
            source: MediaSource::base64(mime, data),
        });
    }

    let bytes = BASE64
        .decode(data)
        .map_err(|e| PilotError::InvalidInput(format!("{}: invalid base64: {e}", file.name)))?;
    let text = String::from_utf8(bytes).map_err(|_| {
        PilotError::InvalidInput(format!("{} ({mime}) is not a text file", file.name))
    })?;
    Ok(ContentBlock::text(format!(
        "Attached file: {}\n```\n{}\n```",
        file.name, text
    )))
}

/// Put uploaded files on the final user message, ahead of its text
pub fn attach_files(messages: &mut [Message], files: &[UploadedFile]) -> Result<()> {
    if files.is_empty() {
        return Ok(());
    }
    let Some(last) = messages.last_mut().filter(|m| m.role == Role::User) else {
        return Err(PilotError::InvalidInput(
            "files need a user message to attach to".into(),
        ));
    };

    let mut blocks = files.iter().map(file_block).collect::<Result<Vec<_>>>()?;
    blocks.append(&mut last.content);
    last.content = blocks;
    Ok(())
}

const SYSTEM_PROMPT: &str = "You are repopilot, a coding agent working on a GitHub repository through tools.

Rules:
- Read a file with read_file before editing it. Never guess file contents.
- Use search_files to find files by name and grep_search to find code.
- Edit with str_replace. old_str must match the file exactly, whitespace included, and occur exactly once; add surrounding lines until it is unique.
- Use create_file only for new files.
- After editing, call verify_edit with a snippet of the new text.
- Every edit is committed immediately. Make focused changes and explain what you changed.";

const NO_REPO_PROMPT: &str = "You are repopilot, a coding assistant. No repository is connected to this conversation, so answer from the conversation alone.";

/// Repository facts and caller-supplied material for the context block
#[derive(Debug, Default)]
pub struct RepoSnapshot<'a> {
    pub repo: Option<&'a RepoRef>,
    pub branch: Option<&'a str>,
    pub tree: Option<&'a RepoTree>,
    pub files: &'a [CachedFile],
}

/// System blocks: fixed instructions, then the repository context. Both are
/// marked as prompt-cache breakpoints.
pub fn build_system(
    settings: &ChatSettings,
    snapshot: &RepoSnapshot<'_>,
    tree_max_entries: usize,
    file_max_chars: usize,
) -> Vec<ContentBlock> {
    let mut instructions = match snapshot.repo {
        Some(_) => SYSTEM_PROMPT.to_string(),
        None => NO_REPO_PROMPT.to_string(),
    };
    if let Some(extra) = settings
        .custom_instructions
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
    {
        instructions.push_str("\n\n");
        instructions.push_str(extra);
    }
    let mut blocks = vec![ContentBlock::cached_text(instructions)];

    let Some(repo) = snapshot.repo else {
        return blocks;
    };

    let mut context = format!(
        "Repository: {repo}\nBranch: {}\n",
        snapshot.branch.unwrap_or("(default)")
    );
    if let Some(tree) = snapshot.tree {
        context.push_str(&format!(
            "\nFile tree ({} files):\n{}",
            tree.file_count(),
            tree.render(tree_max_entries)
        ));
    }
    for file in snapshot.files {
        let total = file.content.chars().count();
        let shown: String = file.content.chars().take(file_max_chars).collect();
        context.push_str(&format!("\n--- {} ---\n{}\n", file.path, shown));
        if total > file_max_chars {
            context.push_str(&format!("[{} more characters not shown]\n", total - file_max_chars));
        }
    }
    blocks.push(ContentBlock::cached_text(context));
    blocks
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(role: Role, content: &str) -> IncomingMessage {
        IncomingMessage {
            role,
            content: content.into(),
        }
    }

    #[test]
    fn test_normalize_drops_blanks_and_merges() {
        let out = normalize_messages(vec![
            msg(Role::Assistant, "Hi! How can I help?"),
            msg(Role::User, "rename foo"),
            msg(Role::User, "   "),
            msg(Role::User, "in utils.ts"),
            msg(Role::Assistant, ""),
            msg(Role::Assistant, "Sure."),
            msg(Role::User, "thanks, go"),
        ])
        .unwrap();

        assert_eq!(out.len(), 3);
        assert_eq!(out[0].role, Role::User);
        assert_eq!(out[0].content.len(), 2);
        assert_eq!(out[1].text(), "Sure.");
        assert_eq!(out[2].text(), "thanks, go");
    }

    #[test]
    fn test_normalize_requires_trailing_user() {
        assert!(normalize_messages(vec![msg(Role::User, "a"), msg(Role::Assistant, "b")]).is_err());
        assert!(normalize_messages(vec![msg(Role::User, " ")]).is_err());
    }

    #[test]
    fn test_payload_deserializes_camel_case() {
        let payload: ChatPayload = serde_json::from_value(serde_json::json!({
            "messages": [{"role": "user", "content": "hi"}],
            "settings": {"model": "claude-haiku-4-5", "effort": "low", "enableThinking": true, "webSearchMode": "auto"},
            "repoContext": {
                "owner": "acme", "repo": "web", "branch": "main",
                "cachedTree": ["src/a.ts", {"path": "src/b.ts", "type": "file", "size": 10}],
                "cachedFiles": [{"path": "src/a.ts", "content": "export {}"}]
            },
            "files": [{"name": "notes.txt", "base64": "aGk="}]
        }))
        .unwrap();

        assert_eq!(payload.settings.effort, Effort::Low);
        assert!(payload.settings.enable_thinking);
        assert_eq!(payload.settings.web_search_mode, WebSearchMode::Auto);
        let ctx = payload.repo_context.unwrap();
        assert_eq!(tree_from_cached(ctx.cached_tree.as_deref().unwrap()).file_count(), 2);
        assert_eq!(payload.files[0].mime_type, None);
    }

    #[test]
    fn test_file_blocks_by_mime() {
        let image = UploadedFile {
            name: "shot.png".into(),
            mime_type: None,
            base64: "data:image/png;base64,iVBORw0KGgo=".into(),
        };
        match file_block(&image).unwrap() {
            ContentBlock::Image { source } => {
                assert_eq!(source.media_type, "image/png");
                assert_eq!(source.data, "iVBORw0KGgo=");
            }
            other => panic!("expected image, got {other:?}"),
        }

        let pdf = UploadedFile {
            name: "spec".into(),
            mime_type: Some("application/pdf".into()),
            base64: "JVBERi0=".into(),
        };
        assert!(matches!(file_block(&pdf).unwrap(), ContentBlock::Document { .. }));

        let text = UploadedFile {
            name: "notes.md".into(),
            mime_type: None,
            base64: BASE64.encode("# Notes"),
        };
        let block = file_block(&text).unwrap();
        assert!(block.as_text().unwrap().contains("# Notes"));

        let binary = UploadedFile {
            name: "blob.bin".into(),
            mime_type: None,
            base64: BASE64.encode([0xffu8, 0xfe]),
        };
        assert!(file_block(&binary).is_err());
    }

    #[test]
    fn test_attach_files_to_last_user_message() {
        let mut messages = vec![Message::user("look at this")];
        let files = vec![UploadedFile {
            name: "a.txt".into(),
            mime_type: Some("text/plain".into()),
            base64: BASE64.encode("alpha"),
        }];
        attach_files(&mut messages, &files).unwrap();
        assert_eq!(messages[0].content.len(), 2);
        assert!(messages[0].content[0].as_text().unwrap().contains("alpha"));
        assert_eq!(messages[0].content[1].as_text(), Some("look at this"));
    }

    #[test]
    fn test_system_blocks() {
        let settings = ChatSettings::default();
        let none = build_system(&settings, &RepoSnapshot::default(), 100, 100);
        assert_eq!(none.len(), 1);

        let repo = RepoRef::new("acme", "web");
        let tree = RepoTree::from_paths(["src/utils.ts", "README.md"]);
        let files = vec![CachedFile {
            path: "README.md".into(),
            content: "0123456789".into(),
        }];
        let snapshot = RepoSnapshot {
            repo: Some(&repo),
            branch: Some("main"),
            tree: Some(&tree),
            files: &files,
        };
        let blocks = build_system(&settings, &snapshot, 100, 4);
        assert_eq!(blocks.len(), 2);
        let context = blocks[1].as_text().unwrap();
        assert!(context.contains("Repository: acme/web"));
        assert!(context.contains("utils.ts"));
        assert!(context.contains("0123\n[6 more characters not shown]"));
        assert!(matches!(&blocks[1], ContentBlock::Text { cache_control: Some(_), .. }));
    }
}
