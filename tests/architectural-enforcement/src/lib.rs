//! Architectural Enforcement Integration Tests
//!
//! This package contains tests that enforce architectural principles of the
//! bridge workspace:
//! - No `unwrap()` / `expect()` in production code
//! - No blocking sleeps on async paths
//! - `bridge-core` stays free of process concerns (CLI, log subscriber)
//!
//! These tests are designed to catch violations early in the development cycle.

use std::fs;
use std::path::{Path, PathBuf};

use walkdir::WalkDir;

/// A forbidden pattern found in production code
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    /// File containing the pattern
    pub file: PathBuf,
    /// 1-based line number
    pub line: usize,
    /// The offending line, trimmed
    pub text: String,
}

/// Workspace root (two levels above this crate)
pub fn workspace_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .ancestors()
        .nth(2)
        .map_or_else(|| PathBuf::from("."), Path::to_path_buf)
}

/// Rust sources under `<root>/<crate_dir>/src`
pub fn source_files(root: &Path, crate_dir: &str) -> Vec<PathBuf> {
    WalkDir::new(root.join(crate_dir).join("src"))
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_file())
        .filter(|e| e.path().extension().is_some_and(|ext| ext == "rs"))
        .map(walkdir::DirEntry::into_path)
        .collect()
}

/// Lines of a source file before its `#[cfg(test)]` module, comments skipped
pub fn production_lines(source: &str) -> Vec<(usize, &str)> {
    source
        .lines()
        .enumerate()
        .take_while(|(_, line)| line.trim() != "#[cfg(test)]")
        .filter(|(_, line)| !line.trim_start().starts_with("//"))
        .map(|(i, line)| (i + 1, line))
        .collect()
}

/// Find production lines containing any of `patterns`
pub fn find_violations(files: &[PathBuf], patterns: &[&str]) -> Vec<Violation> {
    let mut violations = Vec::new();
    for file in files {
        let Ok(source) = fs::read_to_string(file) else {
            continue;
        };
        for (line, text) in production_lines(&source) {
            if patterns.iter().any(|p| text.contains(p)) {
                violations.push(Violation {
                    file: file.clone(),
                    line,
                    text: text.trim().to_string(),
                });
            }
        }
    }
    violations
}

#[cfg(test)]
mod tests {
    use super::*;

    const CRATES: [&str; 2] = ["bridge/core", "bridge/daemon"];

    fn all_sources() -> Vec<PathBuf> {
        let root = workspace_root();
        CRATES
            .iter()
            .flat_map(|c| source_files(&root, c))
            .collect()
    }

    #[test]
    fn test_sources_are_found() {
        let files = source_files(&workspace_root(), "bridge/core");
        assert!(files.iter().any(|f| f.ends_with("lib.rs")));
        assert!(files.iter().any(|f| f.ends_with("dispatcher.rs")));
    }

    #[test]
    fn test_production_lines_stop_at_test_module() {
        let source = "fn a() {}\n// x.unwrap()\nfn b() {}\n#[cfg(test)]\nmod tests {}\n";
        let lines: Vec<usize> = production_lines(source).iter().map(|(n, _)| *n).collect();
        assert_eq!(lines, vec![1, 3]);
    }

    #[test]
    fn no_unwrap_or_expect_in_production_code() {
        let violations = find_violations(&all_sources(), &[".unwrap()", ".expect("]);
        assert!(
            violations.is_empty(),
            "Errors must be propagated, found: {violations:#?}"
        );
    }

    #[test]
    fn no_blocking_sleep() {
        let violations = find_violations(&all_sources(), &["std::thread::sleep", "thread::sleep("]);
        assert!(
            violations.is_empty(),
            "Use tokio::time on async paths, found: {violations:#?}"
        );
    }

    #[test]
    fn core_has_no_process_concerns() {
        let files = source_files(&workspace_root(), "bridge/core");
        let violations = find_violations(&files, &["clap::", "tracing_subscriber", "std::process::exit"]);
        assert!(
            violations.is_empty(),
            "bridge-core must stay embeddable, found: {violations:#?}"
        );
    }
}
