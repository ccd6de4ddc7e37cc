//! Sandboxed filesystem tool.
//!
//! Read/write/edit/list/search with hard caps (file size, line counts,
//! match counts) that degrade via truncation flags instead of failing.
//! Paths are resolved against the tool's working directory before any
//! check, so `../../etc/passwd` normalizes to the real target before
//! the prefix denylist sees it. Write-like actions additionally refuse
//! executable and script extensions.

use super::{Tool, ToolContext, ToolDefinition, ToolResult};
use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::path::{Component, Path, PathBuf};
use tracing::{debug, warn};

/// Refuse to read files larger than this.
const MAX_FILE_SIZE: u64 = 10 * 1024 * 1024;

/// Default and maximum line window for `read`.
const DEFAULT_READ_LINES: usize = 2000;

/// Cap on `search` matches.
const MAX_SEARCH_RESULTS: usize = 500;

/// Cap on `list` recursion depth and entry count.
const MAX_LIST_DEPTH: usize = 10;
const MAX_LIST_ENTRIES: usize = 1000;

/// Sensitive path prefixes no action may touch.
const BLOCKED_PATH_PREFIXES: &[&str] = &[
    "/etc", "/sys", "/proc", "/dev", "/boot", "/var/run", "/root/.ssh",
];

/// Substrings that mark a path as sensitive wherever it lives.
const BLOCKED_PATH_FRAGMENTS: &[&str] = &["/.ssh/", "/.gnupg/", "/.aws/"];

/// Extensions `write`/`edit`/`delete` refuse.
const BLOCKED_WRITE_EXTENSIONS: &[&str] = &[
    "sh", "bash", "zsh", "exe", "bat", "cmd", "com", "scr", "ps1", "msi", "dll", "so", "dylib",
];

#[derive(Debug, Deserialize)]
#[serde(
    tag = "action",
    rename_all = "lowercase",
    rename_all_fields = "camelCase"
)]
enum FileParams {
    Read {
        path: String,
        /// 1-based first line of the window.
        offset: Option<usize>,
        limit: Option<usize>,
    },
    Write {
        path: String,
        content: String,
        #[serde(default)]
        create_dirs: bool,
        #[serde(default)]
        backup: bool,
    },
    Edit {
        path: String,
        old_string: String,
        new_string: String,
        #[serde(default)]
        replace_all: bool,
    },
    Delete {
        path: String,
    },
    List {
        path: String,
        #[serde(default)]
        recursive: bool,
        depth: Option<usize>,
        pattern: Option<String>,
        #[serde(default)]
        include_hidden: bool,
    },
    Search {
        path: String,
        pattern: String,
        max_results: Option<usize>,
    },
    Exists {
        path: String,
    },
    Stat {
        path: String,
    },
}

impl FileParams {
    fn path(&self) -> &str {
        match self {
            FileParams::Read { path, .. }
            | FileParams::Write { path, .. }
            | FileParams::Edit { path, .. }
            | FileParams::Delete { path }
            | FileParams::List { path, .. }
            | FileParams::Search { path, .. }
            | FileParams::Exists { path }
            | FileParams::Stat { path } => path,
        }
    }

    fn is_mutation(&self) -> bool {
        matches!(
            self,
            FileParams::Write { .. } | FileParams::Edit { .. } | FileParams::Delete { .. }
        )
    }
}

pub struct FileTool;

impl FileTool {
    pub fn new() -> Self {
        Self
    }

    /// Resolve the caller's path against the working directory and
    /// normalize `.`/`..` lexically, so the sandbox check sees the real
    /// target rather than a traversal-dressed relative path.
    fn resolve(path: &str, ctx: &ToolContext) -> PathBuf {
        let raw = Path::new(path);
        let joined = if raw.is_absolute() {
            raw.to_path_buf()
        } else {
            let base = ctx
                .working_dir
                .clone()
                .or_else(|| std::env::current_dir().ok())
                .unwrap_or_else(|| PathBuf::from("."));
            base.join(raw)
        };

        let mut normalized = PathBuf::new();
        for component in joined.components() {
            match component {
                Component::CurDir => {}
                Component::ParentDir => {
                    normalized.pop();
                }
                other => normalized.push(other),
            }
        }
        normalized
    }

    fn check_path(resolved: &Path, mutation: bool) -> Result<(), String> {
        let text = resolved.to_string_lossy();
        for prefix in BLOCKED_PATH_PREFIXES {
            if text.starts_with(prefix) {
                return Err(format!("blocked: path is under protected prefix '{prefix}'"));
            }
        }
        for fragment in BLOCKED_PATH_FRAGMENTS {
            if text.contains(fragment) {
                return Err(format!("blocked: path touches sensitive location '{fragment}'"));
            }
        }
        if mutation {
            if let Some(ext) = resolved.extension().and_then(|e| e.to_str()) {
                if BLOCKED_WRITE_EXTENSIONS.contains(&ext.to_lowercase().as_str()) {
                    return Err(format!(
                        "blocked: writes to executable/script extension '.{ext}' are not allowed"
                    ));
                }
            }
        }
        Ok(())
    }

    async fn read(&self, path: &Path, offset: Option<usize>, limit: Option<usize>) -> ToolResult {
        let metadata = match tokio::fs::metadata(path).await {
            Ok(metadata) => metadata,
            Err(e) => return ToolResult::fail(format!("cannot stat {}: {e}", path.display())),
        };
        if metadata.len() > MAX_FILE_SIZE {
            return ToolResult::fail(format!(
                "file is {} bytes, larger than the {MAX_FILE_SIZE} byte limit",
                metadata.len()
            ));
        }

        let content = match tokio::fs::read_to_string(path).await {
            Ok(content) => content,
            Err(e) => return ToolResult::fail(format!("cannot read {}: {e}", path.display())),
        };
        let lines: Vec<&str> = content.lines().collect();
        let total_lines = lines.len();
        let start = offset.unwrap_or(1).saturating_sub(1).min(total_lines);
        let limit = limit.unwrap_or(DEFAULT_READ_LINES).min(DEFAULT_READ_LINES);
        let end = (start + limit).min(total_lines);
        let window = lines[start..end].join("\n");

        ToolResult::ok(json!({
            "content": window,
            "totalLines": total_lines,
            "offset": start + 1,
            "linesReturned": end - start,
            "truncated": end < total_lines,
        }))
    }

    async fn write(
        &self,
        path: &Path,
        content: &str,
        create_dirs: bool,
        backup: bool,
    ) -> ToolResult {
        if create_dirs {
            if let Some(parent) = path.parent() {
                if let Err(e) = tokio::fs::create_dir_all(parent).await {
                    return ToolResult::fail(format!("cannot create parent directories: {e}"));
                }
            }
        }

        let mut backup_path = None;
        if backup && tokio::fs::try_exists(path).await.unwrap_or(false) {
            let stamped = format!(
                "{}.{}.bak",
                path.display(),
                Utc::now().format("%Y%m%d%H%M%S")
            );
            if let Err(e) = tokio::fs::copy(path, &stamped).await {
                warn!(path = %path.display(), error = %e, "failed to back up file before write");
            } else {
                backup_path = Some(stamped);
            }
        }

        match tokio::fs::write(path, content).await {
            Ok(()) => ToolResult::ok(json!({
                "bytesWritten": content.len(),
                "backup": backup_path,
            })),
            Err(e) => ToolResult::fail(format!("cannot write {}: {e}", path.display())),
        }
    }

    async fn edit(
        &self,
        path: &Path,
        old_string: &str,
        new_string: &str,
        replace_all: bool,
    ) -> ToolResult {
        if old_string.is_empty() {
            return ToolResult::fail("oldString must not be empty");
        }
        let content = match tokio::fs::read_to_string(path).await {
            Ok(content) => content,
            Err(e) => return ToolResult::fail(format!("cannot read {}: {e}", path.display())),
        };

        let occurrences = content.matches(old_string).count();
        if occurrences == 0 {
            return ToolResult::fail("oldString not found in file");
        }
        if occurrences > 1 && !replace_all {
            // Ambiguous edits are refused rather than guessed at.
            return ToolResult::fail(format!(
                "oldString appears {occurrences} times; pass replaceAll to replace every occurrence"
            ));
        }

        let (updated, replacements) = if replace_all {
            (content.replace(old_string, new_string), occurrences)
        } else {
            (content.replacen(old_string, new_string, 1), 1)
        };

        match tokio::fs::write(path, updated).await {
            Ok(()) => ToolResult::ok(json!({"replacements": replacements})),
            Err(e) => ToolResult::fail(format!("cannot write {}: {e}", path.display())),
        }
    }

    async fn delete(&self, path: &Path) -> ToolResult {
        match tokio::fs::metadata(path).await {
            Ok(metadata) if metadata.is_dir() => {
                ToolResult::fail(format!("{} is a directory", path.display()))
            }
            Ok(_) => match tokio::fs::remove_file(path).await {
                Ok(()) => ToolResult::ok(json!({"deleted": true})),
                Err(e) => ToolResult::fail(format!("cannot delete {}: {e}", path.display())),
            },
            Err(e) => ToolResult::fail(format!("cannot stat {}: {e}", path.display())),
        }
    }

    async fn list(
        &self,
        path: &Path,
        recursive: bool,
        depth: Option<usize>,
        pattern: Option<&str>,
        include_hidden: bool,
    ) -> ToolResult {
        let matcher = match pattern.map(glob::Pattern::new) {
            Some(Ok(matcher)) => Some(matcher),
            Some(Err(e)) => return ToolResult::fail(format!("invalid glob pattern: {e}")),
            None => None,
        };
        let max_depth = if recursive {
            depth.unwrap_or(MAX_LIST_DEPTH).min(MAX_LIST_DEPTH)
        } else {
            1
        };

        let mut entries = Vec::new();
        let mut truncated = false;
        let mut queue = VecDeque::from([(path.to_path_buf(), 1usize)]);
        while let Some((dir, level)) = queue.pop_front() {
            let mut reader = match tokio::fs::read_dir(&dir).await {
                Ok(reader) => reader,
                Err(e) => {
                    if entries.is_empty() && dir == path {
                        return ToolResult::fail(format!("cannot list {}: {e}", dir.display()));
                    }
                    debug!(dir = %dir.display(), error = %e, "skipping unreadable directory");
                    continue;
                }
            };
            while let Ok(Some(entry)) = reader.next_entry().await {
                let name = entry.file_name().to_string_lossy().to_string();
                if !include_hidden && name.starts_with('.') {
                    continue;
                }
                let is_dir = entry
                    .file_type()
                    .await
                    .map(|t| t.is_dir())
                    .unwrap_or(false);
                if is_dir && level < max_depth {
                    queue.push_back((entry.path(), level + 1));
                }
                if let Some(matcher) = &matcher {
                    if !matcher.matches(&name) {
                        continue;
                    }
                }
                if entries.len() >= MAX_LIST_ENTRIES {
                    truncated = true;
                    continue;
                }
                let size = entry.metadata().await.map(|m| m.len()).unwrap_or(0);
                entries.push(json!({
                    "name": name,
                    "path": entry.path().display().to_string(),
                    "isDir": is_dir,
                    "size": size,
                }));
            }
        }

        ToolResult::ok(json!({
            "entries": entries,
            "count": entries.len(),
            "truncated": truncated,
        }))
    }

    async fn search(&self, path: &Path, pattern: &str, max_results: Option<usize>) -> ToolResult {
        let regex = match regex::Regex::new(pattern) {
            Ok(regex) => regex,
            Err(e) => return ToolResult::fail(format!("invalid regex: {e}")),
        };
        let cap = max_results.unwrap_or(MAX_SEARCH_RESULTS).min(MAX_SEARCH_RESULTS);

        let mut files = Vec::new();
        let metadata = match tokio::fs::metadata(path).await {
            Ok(metadata) => metadata,
            Err(e) => return ToolResult::fail(format!("cannot stat {}: {e}", path.display())),
        };
        if metadata.is_file() {
            files.push(path.to_path_buf());
        } else {
            let mut queue = VecDeque::from([(path.to_path_buf(), 1usize)]);
            while let Some((dir, level)) = queue.pop_front() {
                let mut reader = match tokio::fs::read_dir(&dir).await {
                    Ok(reader) => reader,
                    Err(_) => continue,
                };
                while let Ok(Some(entry)) = reader.next_entry().await {
                    let name = entry.file_name().to_string_lossy().to_string();
                    if name.starts_with('.') {
                        continue;
                    }
                    match entry.file_type().await {
                        Ok(t) if t.is_dir() && level < MAX_LIST_DEPTH => {
                            queue.push_back((entry.path(), level + 1));
                        }
                        Ok(t) if t.is_file() => files.push(entry.path()),
                        _ => {}
                    }
                }
            }
        }

        let mut matches = Vec::new();
        let mut truncated = false;
        'files: for file in files {
            // Oversized or binary files are skipped, not failed on.
            match tokio::fs::metadata(&file).await {
                Ok(m) if m.len() > MAX_FILE_SIZE => continue,
                Err(_) => continue,
                _ => {}
            }
            let content = match tokio::fs::read_to_string(&file).await {
                Ok(content) => content,
                Err(_) => continue,
            };
            for (line_number, line) in content.lines().enumerate() {
                if regex.is_match(line) {
                    if matches.len() >= cap {
                        truncated = true;
                        break 'files;
                    }
                    matches.push(json!({
                        "file": file.display().to_string(),
                        "line": line_number + 1,
                        "text": line,
                    }));
                }
            }
        }

        ToolResult::ok(json!({
            "matches": matches,
            "count": matches.len(),
            "truncated": truncated,
        }))
    }

    async fn stat(&self, path: &Path) -> ToolResult {
        match tokio::fs::metadata(path).await {
            Ok(metadata) => {
                let modified = metadata
                    .modified()
                    .ok()
                    .map(chrono::DateTime::<Utc>::from)
                    .map(|t| t.to_rfc3339());
                ToolResult::ok(json!({
                    "size": metadata.len(),
                    "isDir": metadata.is_dir(),
                    "isFile": metadata.is_file(),
                    "readonly": metadata.permissions().readonly(),
                    "modified": modified,
                }))
            }
            Err(e) => ToolResult::fail(format!("cannot stat {}: {e}", path.display())),
        }
    }
}

impl Default for FileTool {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Tool for FileTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "file".to_string(),
            description: "Read, write, edit, list, search and stat files inside the \
                          working-directory sandbox"
                .to_string(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "action": {
                        "type": "string",
                        "enum": ["read", "write", "edit", "delete", "list", "search", "exists", "stat"],
                    },
                    "path": {"type": "string"},
                    "offset": {"type": "integer"},
                    "limit": {"type": "integer"},
                    "content": {"type": "string"},
                    "createDirs": {"type": "boolean"},
                    "backup": {"type": "boolean"},
                    "oldString": {"type": "string"},
                    "newString": {"type": "string"},
                    "replaceAll": {"type": "boolean"},
                    "recursive": {"type": "boolean"},
                    "depth": {"type": "integer"},
                    "pattern": {"type": "string"},
                    "includeHidden": {"type": "boolean"},
                    "maxResults": {"type": "integer"},
                },
                "required": ["action", "path"],
            }),
        }
    }

    fn validate(&self, params: &Value) -> Result<(), String> {
        let parsed: FileParams =
            serde_json::from_value(params.clone()).map_err(|e| e.to_string())?;
        if parsed.path().trim().is_empty() {
            return Err("path must not be empty".to_string());
        }
        // Absolute paths can be checked without the working directory;
        // relative ones are re-checked post-resolution in execute.
        let raw = Path::new(parsed.path());
        if raw.is_absolute() {
            Self::check_path(raw, parsed.is_mutation())?;
        }
        if let FileParams::Search { pattern, .. } = &parsed {
            regex::Regex::new(pattern).map_err(|e| format!("invalid regex: {e}"))?;
        }
        Ok(())
    }

    async fn execute(&self, params: Value, ctx: &ToolContext) -> ToolResult {
        let parsed: FileParams = match serde_json::from_value(params) {
            Ok(parsed) => parsed,
            Err(e) => return ToolResult::fail(format!("invalid file parameters: {e}")),
        };

        let resolved = Self::resolve(parsed.path(), ctx);
        if let Err(e) = Self::check_path(&resolved, parsed.is_mutation()) {
            return ToolResult::fail(e);
        }

        match parsed {
            FileParams::Read { offset, limit, .. } => self.read(&resolved, offset, limit).await,
            FileParams::Write {
                content,
                create_dirs,
                backup,
                ..
            } => self.write(&resolved, &content, create_dirs, backup).await,
            FileParams::Edit {
                old_string,
                new_string,
                replace_all,
                ..
            } => {
                self.edit(&resolved, &old_string, &new_string, replace_all)
                    .await
            }
            FileParams::Delete { .. } => self.delete(&resolved).await,
            FileParams::List {
                recursive,
                depth,
                pattern,
                include_hidden,
                ..
            } => {
                self.list(&resolved, recursive, depth, pattern.as_deref(), include_hidden)
                    .await
            }
            FileParams::Search {
                pattern,
                max_results,
                ..
            } => self.search(&resolved, &pattern, max_results).await,
            FileParams::Exists { .. } => {
                let exists = tokio::fs::try_exists(&resolved).await.unwrap_or(false);
                ToolResult::ok(json!({"exists": exists}))
            }
            FileParams::Stat { .. } => self.stat(&resolved).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn ctx_in(dir: &TempDir) -> ToolContext {
        ToolContext {
            working_dir: Some(dir.path().to_path_buf()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_write_read_roundtrip_with_windowing() {
        let dir = TempDir::new().unwrap();
        let ctx = ctx_in(&dir);
        let tool = FileTool::new();

        let content = (1..=10).map(|i| format!("line {i}")).collect::<Vec<_>>().join("\n");
        let result = tool
            .execute(
                json!({"action": "write", "path": "notes.txt", "content": content}),
                &ctx,
            )
            .await;
        assert!(result.success, "{:?}", result.error);

        let result = tool
            .execute(
                json!({"action": "read", "path": "notes.txt", "offset": 3, "limit": 2}),
                &ctx,
            )
            .await;
        let data = result.data.unwrap();
        assert_eq!(data["content"], "line 3\nline 4");
        assert_eq!(data["totalLines"], 10);
        assert_eq!(data["truncated"], true);
    }

    #[tokio::test]
    async fn test_edit_ambiguity_refused_without_replace_all() {
        let dir = TempDir::new().unwrap();
        let ctx = ctx_in(&dir);
        let tool = FileTool::new();
        tool.execute(
            json!({"action": "write", "path": "a.txt", "content": "foo bar foo"}),
            &ctx,
        )
        .await;

        let result = tool
            .execute(
                json!({"action": "edit", "path": "a.txt", "oldString": "foo", "newString": "baz"}),
                &ctx,
            )
            .await;
        assert!(!result.success);
        assert!(result.error.unwrap().contains("2 times"));

        let result = tool
            .execute(
                json!({"action": "edit", "path": "a.txt", "oldString": "foo", "newString": "baz", "replaceAll": true}),
                &ctx,
            )
            .await;
        assert!(result.success);
        assert_eq!(result.data.unwrap()["replacements"], 2);

        let result = tool
            .execute(json!({"action": "read", "path": "a.txt"}), &ctx)
            .await;
        assert_eq!(result.data.unwrap()["content"], "baz bar baz");
    }

    #[tokio::test]
    async fn test_backup_on_write() {
        let dir = TempDir::new().unwrap();
        let ctx = ctx_in(&dir);
        let tool = FileTool::new();
        tool.execute(
            json!({"action": "write", "path": "b.txt", "content": "v1"}),
            &ctx,
        )
        .await;
        let result = tool
            .execute(
                json!({"action": "write", "path": "b.txt", "content": "v2", "backup": true}),
                &ctx,
            )
            .await;
        let backup = result.data.unwrap()["backup"].as_str().unwrap().to_string();
        assert!(backup.ends_with(".bak"));
        assert_eq!(std::fs::read_to_string(backup).unwrap(), "v1");
        let current = std::fs::read_to_string(dir.path().join("b.txt")).unwrap();
        assert_eq!(current, "v2");
    }

    #[tokio::test]
    async fn test_traversal_cannot_escape_into_blocked_prefix() {
        let dir = TempDir::new().unwrap();
        let ctx = ctx_in(&dir);
        let tool = FileTool::new();
        let result = tool
            .execute(
                json!({"action": "read", "path": "../../../../../../etc/passwd"}),
                &ctx,
            )
            .await;
        assert!(!result.success);
        assert!(result.error.unwrap().contains("blocked"));
    }

    #[tokio::test]
    async fn test_script_extension_write_blocked() {
        let dir = TempDir::new().unwrap();
        let ctx = ctx_in(&dir);
        let tool = FileTool::new();
        let result = tool
            .execute(
                json!({"action": "write", "path": "run.sh", "content": "echo hi"}),
                &ctx,
            )
            .await;
        assert!(!result.success);
        assert!(result.error.unwrap().contains("blocked"));
        // Reading scripts is still allowed; only mutation is gated.
        std::fs::write(dir.path().join("ok.sh"), "echo").unwrap();
        let result = tool
            .execute(json!({"action": "read", "path": "ok.sh"}), &ctx)
            .await;
        assert!(result.success);
    }

    #[tokio::test]
    async fn test_list_with_glob_and_hidden_exclusion() {
        let dir = TempDir::new().unwrap();
        let ctx = ctx_in(&dir);
        std::fs::write(dir.path().join("a.txt"), "").unwrap();
        std::fs::write(dir.path().join("b.log"), "").unwrap();
        std::fs::write(dir.path().join(".hidden.txt"), "").unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("sub/c.txt"), "").unwrap();

        let tool = FileTool::new();
        let result = tool
            .execute(
                json!({"action": "list", "path": ".", "pattern": "*.txt", "recursive": true}),
                &ctx,
            )
            .await;
        let data = result.data.unwrap();
        let names: Vec<String> = data["entries"]
            .as_array()
            .unwrap()
            .iter()
            .map(|e| e["name"].as_str().unwrap().to_string())
            .collect();
        assert!(names.contains(&"a.txt".to_string()));
        assert!(names.contains(&"c.txt".to_string()));
        assert!(!names.contains(&"b.log".to_string()));
        assert!(!names.contains(&".hidden.txt".to_string()));
    }

    #[tokio::test]
    async fn test_search_with_cap() {
        let dir = TempDir::new().unwrap();
        let ctx = ctx_in(&dir);
        let body = "match\nmiss\nmatch\nmatch\n".repeat(10);
        std::fs::write(dir.path().join("log.txt"), body).unwrap();

        let tool = FileTool::new();
        let result = tool
            .execute(
                json!({"action": "search", "path": "log.txt", "pattern": "^match$", "maxResults": 5}),
                &ctx,
            )
            .await;
        let data = result.data.unwrap();
        assert_eq!(data["count"], 5);
        assert_eq!(data["truncated"], true);
    }

    #[tokio::test]
    async fn test_exists_and_stat_and_delete() {
        let dir = TempDir::new().unwrap();
        let ctx = ctx_in(&dir);
        let tool = FileTool::new();
        tool.execute(
            json!({"action": "write", "path": "x.txt", "content": "data"}),
            &ctx,
        )
        .await;

        let result = tool
            .execute(json!({"action": "exists", "path": "x.txt"}), &ctx)
            .await;
        assert_eq!(result.data.unwrap()["exists"], true);

        let result = tool
            .execute(json!({"action": "stat", "path": "x.txt"}), &ctx)
            .await;
        let data = result.data.unwrap();
        assert_eq!(data["size"], 4);
        assert_eq!(data["isFile"], true);

        let result = tool
            .execute(json!({"action": "delete", "path": "x.txt"}), &ctx)
            .await;
        assert!(result.success);
        let result = tool
            .execute(json!({"action": "exists", "path": "x.txt"}), &ctx)
            .await;
        assert_eq!(result.data.unwrap()["exists"], false);
    }
}
