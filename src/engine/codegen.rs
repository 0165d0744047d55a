//! Parsing of code-generation responses and safe workspace writes.
//!
//! A response is expected to contain one `<files>` block wrapping
//! `<file path="…">…</file>` children. Paths are untrusted: anything
//! absolute or containing `..` is dropped, and everything else is normalized
//! to live under `src/`.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::warn;

/// One parsed file from a code-gen response.
#[derive(Debug, Clone, PartialEq)]
pub struct GeneratedFile {
    pub relative_path: String,
    pub contents: String,
}

/// Extract the generated files from a raw provider response.
///
/// Entries with unsafe or empty paths are skipped, not fatal; a response with
/// zero usable entries is the caller's failure case.
pub fn parse_response(response: &str) -> Vec<GeneratedFile> {
    let block = match extract_between(response, "<files>", "</files>") {
        Some(block) => block,
        None => return Vec::new(),
    };

    let mut files = Vec::new();
    let mut rest = block;
    while let Some(open_start) = rest.find("<file") {
        let after_open = &rest[open_start..];
        let Some(tag_end) = after_open.find('>') else {
            break;
        };
        let open_tag = &after_open[..tag_end + 1];
        let body_and_beyond = &after_open[tag_end + 1..];
        let Some(close) = body_and_beyond.find("</file>") else {
            break;
        };
        let body = &body_and_beyond[..close];
        rest = &body_and_beyond[close + "</file>".len()..];

        let Some(raw_path) = attr_value(open_tag, "path") else {
            continue;
        };
        match sanitize_path(&raw_path) {
            Some(relative_path) => files.push(GeneratedFile {
                relative_path,
                contents: strip_code_fences(body),
            }),
            None => {
                warn!(path = %raw_path, "dropping generated file with unsafe path");
            }
        }
    }
    files
}

fn extract_between<'a>(haystack: &'a str, open: &str, close: &str) -> Option<&'a str> {
    let start = haystack.find(open)? + open.len();
    let end = haystack[start..].find(close)? + start;
    Some(&haystack[start..end])
}

fn attr_value(tag: &str, name: &str) -> Option<String> {
    let marker = format!("{name}=\"");
    let start = tag.find(&marker)? + marker.len();
    let end = tag[start..].find('"')? + start;
    Some(tag[start..end].to_string())
}

/// Validate and normalize an untrusted relative path.
///
/// Rejects absolute paths and any `..` traversal; prefixes `src/` when the
/// path is not already under it. The result joined to the workspace root
/// cannot escape it.
pub fn sanitize_path(raw: &str) -> Option<String> {
    let trimmed = raw.trim().trim_start_matches("./");
    if trimmed.is_empty() || trimmed.starts_with('/') || trimmed.contains('\\') {
        return None;
    }
    if trimmed.split('/').any(|part| part == ".." || part.is_empty()) {
        return None;
    }
    if trimmed.starts_with("src/") {
        Some(trimmed.to_string())
    } else {
        Some(format!("src/{trimmed}"))
    }
}

/// Remove a wrapping markdown code fence, if present.
fn strip_code_fences(body: &str) -> String {
    let trimmed = body.trim_matches(['\n', '\r']);
    let Some(first_line) = trimmed.lines().next() else {
        return trimmed.to_string();
    };
    if !first_line.trim_start().starts_with("```") {
        return trimmed.to_string();
    }

    let after_fence = &trimmed[first_line.len()..];
    let after_fence = after_fence.strip_prefix('\n').unwrap_or(after_fence);
    match after_fence.rfind("```") {
        Some(end) => after_fence[..end].trim_end_matches(['\n', '\r']).to_string(),
        None => after_fence.to_string(),
    }
}

/// Write the files into the workspace, each atomically (temp file in the
/// destination directory, then rename). Returns the absolute paths written.
pub async fn write_files(
    workspace_dir: &Path,
    files: &[GeneratedFile],
) -> Result<Vec<PathBuf>> {
    let mut written = Vec::with_capacity(files.len());
    for file in files {
        let dest = workspace_dir.join(&file.relative_path);
        let parent = dest
            .parent()
            .context("generated file path has no parent")?;
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("Failed to create {}", parent.display()))?;

        let tmp = parent.join(format!(
            ".{}.tmp",
            dest.file_name()
                .and_then(|n| n.to_str())
                .unwrap_or("generated")
        ));
        tokio::fs::write(&tmp, &file.contents)
            .await
            .with_context(|| format!("Failed to write {}", tmp.display()))?;
        tokio::fs::rename(&tmp, &dest)
            .await
            .with_context(|| format!("Failed to move {} into place", dest.display()))?;
        written.push(dest);
    }
    Ok(written)
}
