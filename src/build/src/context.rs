//! Build context snapshots.
//!
//! A [`BuildContext`] is an immutable, path-ordered record of every file in
//! the context directory that survives the ignore rules, with a content
//! hash per entry and an aggregate root hash. Symlinks are never followed:
//! they are recorded as their own entry kind and hashed by target path.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use a3s_forge_core::config::IGNORE_FILE_NAME;
use a3s_forge_core::error::{ForgeError, Result};
use glob::{MatchOptions, Pattern};
use serde::{Deserialize, Serialize};
use walkdir::WalkDir;

use crate::hash::{sha256_bytes, sha256_file, Digest};

const MATCH_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

/// Kind of a context entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    File,
    Symlink,
}

/// A single file (or symlink) in the build context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextEntry {
    /// Path relative to the context root, `/`-separated
    pub path: String,
    pub kind: EntryKind,
    /// SHA256 of the file content, or of the link target for symlinks
    pub content_hash: String,
    /// Permission bits
    pub mode: u32,
    /// Content size, or target length for symlinks
    pub size: u64,
}

impl ContextEntry {
    /// Digest over everything that identifies this entry: path, kind,
    /// mode and content.
    pub fn digest(&self) -> String {
        let kind = match self.kind {
            EntryKind::File => "file",
            EntryKind::Symlink => "symlink",
        };
        sha256_bytes(
            format!(
                "{}\0{}\0{:o}\0{}",
                self.path, kind, self.mode, self.content_hash
            )
            .as_bytes(),
        )
    }
}

/// Glob-style exclusion rules, evaluated relative to the context root.
#[derive(Debug, Clone, Default)]
pub struct IgnoreRules {
    patterns: Vec<Pattern>,
}

impl IgnoreRules {
    /// Compile a set of patterns. Any malformed pattern fails the whole set.
    pub fn new<I, S>(patterns: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut compiled = Vec::new();
        for raw in patterns {
            let raw = raw.as_ref();
            if raw.trim().starts_with('!') {
                return Err(ForgeError::InvalidIgnoreRule {
                    pattern: raw.to_string(),
                    message: "negated patterns are not supported".to_string(),
                });
            }
            let normalized = normalize_pattern(raw);
            if normalized.is_empty() {
                return Err(ForgeError::InvalidIgnoreRule {
                    pattern: raw.to_string(),
                    message: "pattern is empty".to_string(),
                });
            }
            let pattern = Pattern::new(&normalized).map_err(|e| ForgeError::InvalidIgnoreRule {
                pattern: raw.to_string(),
                message: e.msg.to_string(),
            })?;
            compiled.push(pattern);
        }
        Ok(Self { patterns: compiled })
    }

    /// Parse ignore-file text: one pattern per line, `#` comments and blank
    /// lines skipped.
    pub fn parse(content: &str) -> Result<Self> {
        Self::new(
            content
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty() && !line.starts_with('#')),
        )
    }

    /// Load `.forgeignore` from the context root. A missing file yields no rules.
    pub fn from_context(root: &Path) -> Result<Self> {
        let path = root.join(IGNORE_FILE_NAME);
        if !path.is_file() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(&path).map_err(|e| ForgeError::ContextError {
            path: path.clone(),
            message: format!("Failed to read ignore file: {}", e),
        })?;
        Self::parse(&content)
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    /// Whether `path` (relative, `/`-separated) or any of its parent
    /// directories matches a rule.
    pub fn is_ignored(&self, path: &str) -> bool {
        !self.patterns.is_empty() && matches_self_or_ancestor(&self.patterns, path)
    }
}

/// Compiled copy-source patterns.
#[derive(Debug, Clone)]
pub struct SourceMatcher {
    patterns: Vec<Pattern>,
    match_all: bool,
}

impl SourceMatcher {
    pub fn new(sources: &[String]) -> Result<Self> {
        let mut patterns = Vec::new();
        let mut match_all = false;
        for raw in sources {
            let normalized = normalize_pattern(raw);
            if normalized.is_empty() || normalized == "." {
                match_all = true;
                continue;
            }
            let pattern = Pattern::new(&normalized).map_err(|e| ForgeError::ContextError {
                path: PathBuf::from(raw),
                message: format!("Invalid source pattern: {}", e.msg),
            })?;
            patterns.push(pattern);
        }
        Ok(Self {
            patterns,
            match_all,
        })
    }

    /// A source pattern matches a path directly or names a directory the
    /// path lives under.
    pub fn matches(&self, path: &str) -> bool {
        self.match_all || matches_self_or_ancestor(&self.patterns, path)
    }
}

/// Immutable snapshot of a build context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildContext {
    root: PathBuf,
    entries: BTreeMap<String, ContextEntry>,
    root_hash: Digest,
}

impl BuildContext {
    /// Assemble a context from already-hashed entries.
    pub fn from_entries(root: impl Into<PathBuf>, entries: Vec<ContextEntry>) -> Self {
        let entries: BTreeMap<String, ContextEntry> = entries
            .into_iter()
            .map(|entry| (entry.path.clone(), entry))
            .collect();
        let root_hash = aggregate_hash(&entries);
        Self {
            root: root.into(),
            entries,
            root_hash,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Aggregate hash over the ordered per-entry digests.
    pub fn root_hash(&self) -> &Digest {
        &self.root_hash
    }

    pub fn get(&self, path: &str) -> Option<&ContextEntry> {
        self.entries.get(path)
    }

    /// Entries in path order.
    pub fn entries(&self) -> impl Iterator<Item = &ContextEntry> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries matched by any of the copy source patterns, in path order.
    pub fn select(&self, sources: &[String]) -> Result<Vec<&ContextEntry>> {
        let matcher = SourceMatcher::new(sources)?;
        Ok(self
            .entries
            .values()
            .filter(|entry| matcher.matches(&entry.path))
            .collect())
    }
}

/// Walk `root` and hash every entry not excluded by `rules`.
///
/// Fails with a context error when the root is not a readable directory
/// or any entry below it cannot be read.
pub fn snapshot(root: &Path, rules: &IgnoreRules) -> Result<BuildContext> {
    let meta = std::fs::metadata(root).map_err(|e| ForgeError::ContextError {
        path: root.to_path_buf(),
        message: format!("Failed to read context root: {}", e),
    })?;
    if !meta.is_dir() {
        return Err(ForgeError::ContextError {
            path: root.to_path_buf(),
            message: "Context root is not a directory".to_string(),
        });
    }

    let walker = WalkDir::new(root)
        .follow_links(false)
        .sort_by_file_name()
        .min_depth(1)
        .into_iter()
        .filter_entry(|e| match relative_path(root, e.path()) {
            Some(rel) => !rules.is_ignored(&rel),
            None => true,
        });

    let mut entries = Vec::new();
    for entry in walker {
        let entry = entry.map_err(|e| ForgeError::ContextError {
            path: e.path().map(Path::to_path_buf).unwrap_or_else(|| root.to_path_buf()),
            message: format!("Failed to walk context: {}", e),
        })?;
        let path = entry.path();
        let rel = relative_path(root, path).ok_or_else(|| ForgeError::ContextError {
            path: path.to_path_buf(),
            message: "Entry is outside the context root".to_string(),
        })?;

        let file_type = entry.file_type();
        if file_type.is_dir() {
            continue;
        }

        let metadata = std::fs::symlink_metadata(path).map_err(|e| ForgeError::ContextError {
            path: path.to_path_buf(),
            message: format!("Failed to read metadata: {}", e),
        })?;

        if file_type.is_symlink() {
            let target = std::fs::read_link(path).map_err(|e| ForgeError::ContextError {
                path: path.to_path_buf(),
                message: format!("Failed to read symlink: {}", e),
            })?;
            let target = target.to_string_lossy().into_owned();
            entries.push(ContextEntry {
                path: rel,
                kind: EntryKind::Symlink,
                content_hash: sha256_bytes(target.as_bytes()),
                mode: 0o777,
                size: target.len() as u64,
            });
        } else if file_type.is_file() {
            entries.push(ContextEntry {
                path: rel,
                kind: EntryKind::File,
                content_hash: sha256_file(path)?,
                mode: file_mode(&metadata),
                size: metadata.len(),
            });
        } else {
            tracing::debug!(path = %path.display(), "Skipping special file in build context");
        }
    }

    let context = BuildContext::from_entries(root, entries);
    tracing::debug!(
        root = %root.display(),
        entries = context.len(),
        hash = %context.root_hash().short(),
        "Snapshotted build context"
    );
    Ok(context)
}

fn aggregate_hash(entries: &BTreeMap<String, ContextEntry>) -> Digest {
    let mut manifest = String::new();
    for (path, entry) in entries {
        manifest.push_str(path);
        manifest.push('\0');
        manifest.push_str(&entry.digest());
        manifest.push('\n');
    }
    Digest::of_bytes(manifest.as_bytes())
}

fn matches_self_or_ancestor(patterns: &[Pattern], path: &str) -> bool {
    let mut prefix_end = 0;
    loop {
        let next = path[prefix_end..].find('/').map(|i| prefix_end + i);
        let candidate = match next {
            Some(end) => &path[..end],
            None => path,
        };
        if patterns
            .iter()
            .any(|p| p.matches_with(candidate, MATCH_OPTIONS))
        {
            return true;
        }
        match next {
            Some(end) => prefix_end = end + 1,
            None => return false,
        }
    }
}

fn normalize_pattern(raw: &str) -> String {
    let mut s = raw.trim();
    while let Some(rest) = s.strip_prefix("./") {
        s = rest;
    }
    s.trim_start_matches('/').trim_end_matches('/').to_string()
}

fn relative_path(root: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    let parts: Vec<String> = rel
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    Some(parts.join("/"))
}

#[cfg(unix)]
fn file_mode(metadata: &std::fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
fn file_mode(metadata: &std::fs::Metadata) -> u32 {
    if metadata.permissions().readonly() {
        0o444
    } else {
        0o644
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn write(root: &Path, rel: &str, content: &str) {
        let path = root.join(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(path, content).unwrap();
    }

    fn paths(ctx: &BuildContext) -> Vec<&str> {
        ctx.entries().map(|e| e.path.as_str()).collect()
    }

    #[test]
    fn test_snapshot_empty_dir() {
        let tmp = TempDir::new().unwrap();
        let ctx = snapshot(tmp.path(), &IgnoreRules::default()).unwrap();
        assert!(ctx.is_empty());
    }

    #[test]
    fn test_snapshot_lists_files_in_path_order() {
        let tmp = TempDir::new().unwrap();
        write(tmp.path(), "b.txt", "b");
        write(tmp.path(), "a/z.txt", "z");
        write(tmp.path(), "a.txt", "a");

        let ctx = snapshot(tmp.path(), &IgnoreRules::default()).unwrap();
        assert_eq!(paths(&ctx), vec!["a.txt", "a/z.txt", "b.txt"]);
        assert_eq!(ctx.get("b.txt").unwrap().size, 1);
        assert_eq!(ctx.get("b.txt").unwrap().kind, EntryKind::File);
    }

    #[test]
    fn test_snapshot_is_deterministic() {
        let tmp = TempDir::new().unwrap();
        write(tmp.path(), "src/main.rs", "fn main() {}");
        write(tmp.path(), "Cargo.toml", "[package]");

        let first = snapshot(tmp.path(), &IgnoreRules::default()).unwrap();
        let second = snapshot(tmp.path(), &IgnoreRules::default()).unwrap();
        assert_eq!(first.root_hash(), second.root_hash());
    }

    #[test]
    fn test_snapshot_hash_changes_with_content() {
        let tmp = TempDir::new().unwrap();
        write(tmp.path(), "a.txt", "one");
        let before = snapshot(tmp.path(), &IgnoreRules::default()).unwrap();

        write(tmp.path(), "a.txt", "two");
        let after = snapshot(tmp.path(), &IgnoreRules::default()).unwrap();

        assert_ne!(before.root_hash(), after.root_hash());
    }

    #[test]
    fn test_ignored_file_has_no_effect() {
        let tmp = TempDir::new().unwrap();
        write(tmp.path(), "app.py", "print('hi')");
        write(tmp.path(), "debug.log", "first");
        let rules = IgnoreRules::new(["*.log"]).unwrap();

        let before = snapshot(tmp.path(), &rules).unwrap();
        assert!(before.get("debug.log").is_none());

        write(tmp.path(), "debug.log", "second");
        let after = snapshot(tmp.path(), &rules).unwrap();
        assert_eq!(before.root_hash(), after.root_hash());
    }

    #[test]
    fn test_ignored_directory_prunes_subtree() {
        let tmp = TempDir::new().unwrap();
        write(tmp.path(), "target/debug/app", "bin");
        write(tmp.path(), "src/lib.rs", "");

        let rules = IgnoreRules::new(["target"]).unwrap();
        let ctx = snapshot(tmp.path(), &rules).unwrap();
        assert_eq!(paths(&ctx), vec!["src/lib.rs"]);
    }

    #[test]
    fn test_star_does_not_cross_directories() {
        let rules = IgnoreRules::new(["*.log"]).unwrap();
        assert!(rules.is_ignored("a.log"));
        assert!(!rules.is_ignored("logs/a.log"));

        let rules = IgnoreRules::new(["**/*.log"]).unwrap();
        assert!(rules.is_ignored("logs/deep/a.log"));
    }

    #[test]
    fn test_ignore_rules_parse() {
        let rules = IgnoreRules::parse("# build output\n\ntarget/\n./node_modules\n").unwrap();
        assert!(rules.is_ignored("target/release/app"));
        assert!(rules.is_ignored("node_modules/x/index.js"));
        assert!(!rules.is_ignored("src/main.rs"));
    }

    #[test]
    fn test_malformed_ignore_rule() {
        let err = IgnoreRules::new(["[unterminated"]).unwrap_err();
        assert!(matches!(err, ForgeError::InvalidIgnoreRule { .. }));

        let err = IgnoreRules::new(["!keep.txt"]).unwrap_err();
        assert!(matches!(err, ForgeError::InvalidIgnoreRule { .. }));

        let err = IgnoreRules::new(["   "]).unwrap_err();
        assert!(matches!(err, ForgeError::InvalidIgnoreRule { .. }));
    }

    #[test]
    fn test_ignore_rules_from_context() {
        let tmp = TempDir::new().unwrap();
        assert!(IgnoreRules::from_context(tmp.path()).unwrap().is_empty());

        write(tmp.path(), IGNORE_FILE_NAME, "*.tmp\n");
        let rules = IgnoreRules::from_context(tmp.path()).unwrap();
        assert!(rules.is_ignored("scratch.tmp"));
    }

    #[test]
    fn test_snapshot_missing_root() {
        let err = snapshot(Path::new("/nonexistent/context"), &IgnoreRules::default()).unwrap_err();
        assert!(matches!(err, ForgeError::ContextError { .. }));
    }

    #[test]
    fn test_snapshot_root_is_file() {
        let tmp = TempDir::new().unwrap();
        write(tmp.path(), "file.txt", "x");
        let err = snapshot(&tmp.path().join("file.txt"), &IgnoreRules::default()).unwrap_err();
        assert!(err.to_string().contains("not a directory"));
    }

    #[cfg(unix)]
    #[test]
    fn test_symlink_hashed_by_target_path() {
        let tmp = TempDir::new().unwrap();
        write(tmp.path(), "real.txt", "v1");
        std::os::unix::fs::symlink("real.txt", tmp.path().join("link")).unwrap();

        let before = snapshot(tmp.path(), &IgnoreRules::default()).unwrap();
        let link = before.get("link").unwrap().clone();
        assert_eq!(link.kind, EntryKind::Symlink);
        assert_eq!(link.content_hash, sha256_bytes(b"real.txt"));

        // Changing the target's content changes the file entry, not the link
        write(tmp.path(), "real.txt", "v2");
        let after = snapshot(tmp.path(), &IgnoreRules::default()).unwrap();
        assert_eq!(after.get("link").unwrap(), &link);
        assert_ne!(after.get("real.txt"), before.get("real.txt"));
    }

    #[cfg(unix)]
    #[test]
    fn test_mode_is_part_of_entry_digest() {
        use std::os::unix::fs::PermissionsExt;

        let tmp = TempDir::new().unwrap();
        write(tmp.path(), "run.sh", "#!/bin/sh");
        let before = snapshot(tmp.path(), &IgnoreRules::default()).unwrap();

        fs::set_permissions(tmp.path().join("run.sh"), fs::Permissions::from_mode(0o755)).unwrap();
        let after = snapshot(tmp.path(), &IgnoreRules::default()).unwrap();

        assert_eq!(after.get("run.sh").unwrap().mode, 0o755);
        assert_ne!(
            before.get("run.sh").unwrap().digest(),
            after.get("run.sh").unwrap().digest()
        );
    }

    #[test]
    fn test_select_by_source_patterns() {
        let tmp = TempDir::new().unwrap();
        write(tmp.path(), "src/main.rs", "");
        write(tmp.path(), "src/util/mod.rs", "");
        write(tmp.path(), "README.md", "");
        write(tmp.path(), "Cargo.toml", "");
        let ctx = snapshot(tmp.path(), &IgnoreRules::default()).unwrap();

        let selected: Vec<&str> = ctx
            .select(&["src".to_string()])
            .unwrap()
            .iter()
            .map(|e| e.path.as_str())
            .collect();
        assert_eq!(selected, vec!["src/main.rs", "src/util/mod.rs"]);

        let selected = ctx.select(&["*.toml".to_string()]).unwrap();
        assert_eq!(selected.len(), 1);

        assert_eq!(ctx.select(&[".".to_string()]).unwrap().len(), 4);
        assert!(ctx.select(&["docs".to_string()]).unwrap().is_empty());
    }

    #[test]
    fn test_select_invalid_pattern() {
        let ctx = BuildContext::from_entries("/ctx", Vec::new());
        assert!(ctx.select(&["[".to_string()]).is_err());
    }
}
