// src/tools/search.rs
// search_files and grep_search over the cached repository view

use tracing::debug;

use super::types::ToolOutput;
use crate::cache::CachedRepo;
use crate::config::LimitsConfig;

const MAX_LINE_CHARS: usize = 200;

pub(super) async fn search_files(repo: &CachedRepo, query: &str, max_results: usize) -> ToolOutput {
    let query = query.trim();
    if query.is_empty() {
        return ToolOutput::error("Error: query must not be empty.");
    }

    let matches = match repo.search_by_name(query).await {
        Ok(matches) => matches,
        Err(e) => return ToolOutput::error(format!("Error: {e}.")),
    };
    if matches.is_empty() {
        return ToolOutput::ok(format!("No files matching \"{query}\"."));
    }

    let mut out = format!("{} file(s) matching \"{query}\":\n", matches.len());
    for path in matches.iter().take(max_results) {
        out.push_str(path);
        out.push('\n');
    }
    if matches.len() > max_results {
        out.push_str(&format!("... and {} more\n", matches.len() - max_results));
    }
    ToolOutput::ok(out)
}

/// Extension filter entries may be written with or without the dot
fn normalize_extensions(extensions: &[String]) -> Vec<String> {
    extensions
        .iter()
        .map(|e| e.trim().trim_start_matches('.').to_ascii_lowercase())
        .filter(|e| !e.is_empty())
        .collect()
}

fn has_extension(path: &str, extensions: &[String]) -> bool {
    if extensions.is_empty() {
        return true;
    }
    let file_name = path.rsplit('/').next().unwrap_or(path);
    match file_name.rsplit_once('.') {
        Some((_, ext)) => extensions.iter().any(|e| e.eq_ignore_ascii_case(ext)),
        None => false,
    }
}

fn clip_line(line: &str) -> String {
    let line = line.trim();
    if line.chars().count() > MAX_LINE_CHARS {
        let cut: String = line.chars().take(MAX_LINE_CHARS).collect();
        format!("{cut}...")
    } else {
        line.to_string()
    }
}

/// Case-insensitive literal search across up to `max_grep_files` files
pub(super) async fn grep_search(
    repo: &CachedRepo,
    query: &str,
    extensions: &[String],
    limits: &LimitsConfig,
) -> ToolOutput {
    if query.trim().is_empty() {
        return ToolOutput::error("Error: query must not be empty.");
    }
    let needle = query.to_lowercase();
    let extensions = normalize_extensions(extensions);

    let tree = match repo.get_tree().await {
        Ok(tree) => tree,
        Err(e) => return ToolOutput::error(format!("Error: {e}.")),
    };

    let max_bytes = repo.max_file_bytes();
    let candidates: Vec<&str> = tree
        .files()
        .filter(|e| has_extension(&e.path, &extensions))
        .filter(|e| e.size.is_none_or(|size| size <= max_bytes))
        .map(|e| e.path.as_str())
        .collect();
    let scanned = candidates.len().min(limits.max_grep_files);

    let mut hits: Vec<String> = Vec::new();
    let mut more = false;
    'files: for path in candidates.iter().take(limits.max_grep_files) {
        let file = match repo.get_file(path).await {
            Ok(file) => file,
            Err(e) => {
                debug!(path, error = %e, "Skipping file in grep");
                continue;
            }
        };
        for (n, line) in file.content.lines().enumerate() {
            if line.to_lowercase().contains(&needle) {
                if hits.len() >= limits.max_grep_results {
                    more = true;
                    break 'files;
                }
                hits.push(format!("{}:{}: {}", path, n + 1, clip_line(line)));
            }
        }
    }

    let coverage = if candidates.len() > scanned {
        format!(" (searched {scanned} of {} files)", candidates.len())
    } else {
        String::new()
    };

    if hits.is_empty() {
        return ToolOutput::ok(format!("No matches for \"{query}\"{coverage}."));
    }

    let mut out = format!("{} match(es) for \"{query}\"{coverage}:\n", hits.len());
    for hit in &hits {
        out.push_str(hit);
        out.push('\n');
    }
    if more {
        out.push_str(&format!(
            "... stopped after {} matches; narrow the query or filter by extension\n",
            limits.max_grep_results
        ));
    }
    ToolOutput::ok(out)
}
