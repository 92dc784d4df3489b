//! Architectural Enforcement
//!
//! Source scanners shared by the enforcement tests in `tests/`:
//! - No blocking socket I/O in the transport
//! - No thread sleeps in production code
//! - No blocking file I/O inside async functions
//!
//! Scanning is line based. Everything from the first `#[cfg(test)]` of a file
//! onward counts as test code, which matches how the transport lays out its
//! modules.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

/// Directories holding production code, relative to the workspace root
pub const PRODUCTION_DIRS: &[&str] = &["wireline/core/src"];

/// Workspace root, resolved from this crate's manifest
#[must_use]
pub fn workspace_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("../..")
}

/// A rule broken at one source line
#[derive(Debug, Clone)]
pub struct Violation {
    /// File the line belongs to
    pub path: PathBuf,
    /// 1-based line number
    pub line: usize,
    /// The offending line, trimmed
    pub text: String,
    /// Which rule was broken
    pub reason: &'static str,
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{} - {}: {}",
            self.path.display(),
            self.line,
            self.reason,
            self.text
        )
    }
}

/// Kind of function a line sits in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FnKind {
    /// `async fn`
    Async,
    /// plain `fn`
    Sync,
}

/// One Rust source file split into lines
#[derive(Debug)]
pub struct SourceFile {
    /// Where the file lives
    pub path: PathBuf,
    lines: Vec<String>,
}

impl SourceFile {
    /// Read a file from disk
    ///
    /// # Errors
    ///
    /// Returns the I/O error if the file cannot be read.
    pub fn read(path: &Path) -> std::io::Result<Self> {
        Ok(Self::from_source(path, &fs::read_to_string(path)?))
    }

    /// Build from in-memory source
    #[must_use]
    pub fn from_source(path: &Path, source: &str) -> Self {
        Self {
            path: path.to_path_buf(),
            lines: source.lines().map(str::to_owned).collect(),
        }
    }

    /// Production lines as `(index, code without comments)`
    ///
    /// Stops at the first `#[cfg(test)]`.
    pub fn production_lines(&self) -> impl Iterator<Item = (usize, &str)> {
        self.lines
            .iter()
            .enumerate()
            .take_while(|(_, line)| !line.trim_start().starts_with("#[cfg(test)]"))
            .map(|(idx, line)| (idx, strip_comment(line)))
    }

    /// Kind of the closest function header at or above `idx`
    #[must_use]
    pub fn enclosing_fn(&self, idx: usize) -> Option<FnKind> {
        self.lines[..=idx.min(self.lines.len().saturating_sub(1))]
            .iter()
            .rev()
            .find_map(|line| fn_header(strip_comment(line)))
    }

    /// Check every production line with `rule`
    pub fn check<F>(&self, rule: F) -> Vec<Violation>
    where
        F: Fn(&Self, usize, &str) -> Option<&'static str>,
    {
        self.production_lines()
            .filter_map(|(idx, code)| {
                rule(self, idx, code).map(|reason| Violation {
                    path: self.path.clone(),
                    line: idx + 1,
                    text: self.lines[idx].trim().to_string(),
                    reason,
                })
            })
            .collect()
    }
}

/// Every `.rs` file under the production directories
#[must_use]
pub fn production_files() -> Vec<SourceFile> {
    let root = workspace_root();
    PRODUCTION_DIRS
        .iter()
        .flat_map(|dir| walkdir::WalkDir::new(root.join(dir)).into_iter())
        .filter_map(Result::ok)
        .filter(|entry| entry.path().extension().and_then(|s| s.to_str()) == Some("rs"))
        .filter_map(|entry| SourceFile::read(entry.path()).ok())
        .collect()
}

/// Run `rule` over every production file
pub fn scan<F>(rule: F) -> Vec<Violation>
where
    F: Fn(&SourceFile, usize, &str) -> Option<&'static str>,
{
    production_files()
        .iter()
        .flat_map(|file| file.check(&rule))
        .collect()
}

fn strip_comment(line: &str) -> &str {
    line.split("//").next().unwrap_or(line)
}

fn fn_header(code: &str) -> Option<FnKind> {
    let mut rest = code.trim_start();
    loop {
        let stripped = ["pub(crate) ", "pub(super) ", "pub ", "const ", "unsafe "]
            .iter()
            .find_map(|prefix| rest.strip_prefix(prefix));
        match stripped {
            Some(s) => rest = s,
            None => break,
        }
    }

    if rest.starts_with("async fn ") {
        Some(FnKind::Async)
    } else if rest.starts_with("fn ") {
        Some(FnKind::Sync)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file(source: &str) -> SourceFile {
        SourceFile::from_source(Path::new("sample.rs"), source)
    }

    #[test]
    fn test_fn_header_detection() {
        assert_eq!(fn_header("    pub async fn run(&self) {"), Some(FnKind::Async));
        assert_eq!(fn_header("pub(crate) fn new() -> Self {"), Some(FnKind::Sync));
        assert_eq!(fn_header("const fn ms() -> u64 {"), Some(FnKind::Sync));
        assert_eq!(fn_header("let f = 1;"), None);
    }

    #[test]
    fn test_enclosing_fn() {
        let source = file(
            "pub fn load() {\n    std::fs::read_to_string(p);\n}\nasync fn run() {\n    work().await;\n}\n",
        );
        assert_eq!(source.enclosing_fn(1), Some(FnKind::Sync));
        assert_eq!(source.enclosing_fn(4), Some(FnKind::Async));
    }

    #[test]
    fn test_test_module_is_skipped() {
        let source = file("fn a() {}\n// std::thread::sleep\n#[cfg(test)]\nmod tests {\n    std::thread::sleep(d);\n}\n");
        let violations = source.check(|_, _, code| code.contains("thread::sleep").then_some("sleep"));
        assert!(violations.is_empty());
    }

    #[test]
    fn test_violation_reports_line() {
        let source = file("fn a() {\n    std::thread::sleep(d);\n}\n");
        let violations = source.check(|_, _, code| code.contains("thread::sleep").then_some("sleep"));
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].line, 2);
        assert!(violations[0].to_string().contains("sample.rs:2 - sleep"));
    }
}
