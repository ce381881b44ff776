//! Architectural Enforcement
//!
//! Source scanners shared by the integration tests in `tests/`:
//! - No thread sleeps, and async sleeps only at the sanctioned waits
//! - No blocking I/O inside async functions
//!
//! The scanners are line-based heuristics. Everything from the first
//! `#[cfg(test)]` line of a file onward is treated as test code.

use std::fs;
use std::path::{Path, PathBuf};

/// Production source roots scanned by the enforcement tests
pub const PRODUCTION_ROOTS: [&str; 2] = ["resilience/core/src", "resilience/daemon/src"];

/// Workspace root (two levels above this crate)
pub fn workspace_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .ancestors()
        .nth(2)
        .map_or_else(|| PathBuf::from("."), Path::to_path_buf)
}

/// A loaded source file
pub struct SourceFile {
    /// Path relative to the workspace root
    pub path: PathBuf,
    /// Lines of the file
    pub lines: Vec<String>,
    test_start: usize,
}

impl SourceFile {
    /// Wrap in-memory lines (used by the scanner's own tests)
    pub fn from_lines(path: impl Into<PathBuf>, lines: &[&str]) -> Self {
        let lines: Vec<String> = lines.iter().map(|l| (*l).to_string()).collect();
        let test_start = lines
            .iter()
            .position(|l| l.trim_start().starts_with("#[cfg(test)]"))
            .unwrap_or(lines.len());
        Self {
            path: path.into(),
            lines,
            test_start,
        }
    }

    /// Code part of line `idx` (comments stripped)
    pub fn code(&self, idx: usize) -> &str {
        let line = self.lines[idx].as_str();
        let trimmed = line.trim_start();
        if trimmed.starts_with("//") {
            return "";
        }
        line.split("//").next().unwrap_or(line)
    }

    /// Whether line `idx` is test code
    pub fn is_test_code(&self, idx: usize) -> bool {
        if idx >= self.test_start {
            return true;
        }
        match self.enclosing_fn(idx) {
            Some(fn_idx) => (0..fn_idx).rev().take(3).any(|i| {
                let l = self.lines[i].trim();
                l.starts_with("#[test]") || l.starts_with("#[tokio::test")
            }),
            None => false,
        }
    }

    /// Whether the nearest enclosing function is `async`
    pub fn in_async_fn(&self, idx: usize) -> bool {
        self.enclosing_fn(idx)
            .and_then(|i| fn_signature(&self.lines[i]))
            .unwrap_or(false)
    }

    /// Index of the nearest function signature at or above `idx`
    fn enclosing_fn(&self, idx: usize) -> Option<usize> {
        (0..=idx).rev().find(|&i| fn_signature(&self.lines[i]).is_some())
    }

    /// `path:line - text`
    pub fn describe(&self, idx: usize, what: &str) -> String {
        format!("{}:{} - {what}: {}", self.path.display(), idx + 1, self.lines[idx].trim())
    }
}

/// `Some(is_async)` when `line` opens a function
pub fn fn_signature(line: &str) -> Option<bool> {
    let mut rest = line.trim_start();
    for prefix in ["pub(crate) ", "pub(super) ", "pub ", "const ", "unsafe "] {
        if let Some(stripped) = rest.strip_prefix(prefix) {
            rest = stripped;
        }
    }
    if rest.starts_with("async fn ") {
        Some(true)
    } else if rest.starts_with("fn ") {
        Some(false)
    } else {
        None
    }
}

/// Every `.rs` file under `root` (relative to the workspace)
///
/// # Panics
///
/// Panics when `root` does not exist, so a moved crate cannot silently
/// escape the scan.
pub fn rust_sources(root: &str) -> Vec<SourceFile> {
    let base = workspace_root();
    let dir = base.join(root);
    assert!(dir.is_dir(), "scan root {} does not exist", dir.display());

    walkdir::WalkDir::new(&dir)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.path().extension().and_then(|s| s.to_str()) == Some("rs"))
        .filter_map(|e| {
            let content = fs::read_to_string(e.path()).ok()?;
            let lines: Vec<&str> = content.lines().collect();
            let rel = e.path().strip_prefix(&base).unwrap_or(e.path()).to_path_buf();
            Some(SourceFile::from_lines(rel, &lines))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fn_signature_detection() {
        assert_eq!(fn_signature("    pub async fn run(&self) {"), Some(true));
        assert_eq!(fn_signature("pub(crate) fn delay() -> Duration {"), Some(false));
        assert_eq!(fn_signature("fn main() {"), Some(false));
        assert_eq!(fn_signature("let f = run_fn();"), None);
    }

    #[test]
    fn test_cfg_test_module_is_test_code() {
        let file = SourceFile::from_lines(
            "x.rs",
            &[
                "async fn prod() {",
                "    work().await;",
                "}",
                "#[cfg(test)]",
                "mod tests {",
                "    async fn helper() { std::fs::read(\"x\"); }",
                "}",
            ],
        );
        assert!(!file.is_test_code(1));
        assert!(file.is_test_code(5));
    }

    #[test]
    fn test_async_context_detection() {
        let file = SourceFile::from_lines(
            "x.rs",
            &[
                "pub fn load() {",
                "    std::fs::read_to_string(\"a\");",
                "}",
                "pub async fn fetch() {",
                "    std::fs::read_to_string(\"b\");",
                "}",
            ],
        );
        assert!(!file.in_async_fn(1));
        assert!(file.in_async_fn(4));
    }

    #[test]
    fn test_comments_are_ignored() {
        let file = SourceFile::from_lines("x.rs", &["    // std::thread::sleep(d)", "let x = 1; // sleep("]);
        assert_eq!(file.code(0), "");
        assert!(!file.code(1).contains("sleep"));
    }
}
