//! Source filtering for layer builds.
//!
//! The archive walker only asks one question, `is_ignored(relative, is_dir)`.
//! [`GitIgnoreRules`] answers it from a gitignore-style file in the source root.

use std::path::{Path, PathBuf};

use hoist_core::error::{HoistError, Result};
use ignore::gitignore::{Gitignore, GitignoreBuilder};

/// Ignore predicate over paths relative to a source root.
pub trait IgnoreRules: Send + Sync {
    fn is_ignored(&self, relative: &Path, is_dir: bool) -> bool;
}

/// Rules that ignore nothing.
pub struct NoIgnore;

impl IgnoreRules for NoIgnore {
    fn is_ignored(&self, _relative: &Path, _is_dir: bool) -> bool {
        false
    }
}

/// Gitignore-style rules rooted at a source directory.
pub struct GitIgnoreRules {
    matcher: Gitignore,
}

impl GitIgnoreRules {
    /// Load rules from `root/<file_name>`. A missing file yields empty rules.
    pub fn load(root: &Path, file_name: &str) -> Result<Self> {
        let path = root.join(file_name);
        if !path.is_file() {
            return Ok(Self {
                matcher: Gitignore::empty(),
            });
        }

        let mut builder = GitignoreBuilder::new(root);
        if let Some(e) = builder.add(&path) {
            return Err(HoistError::Archive(format!(
                "Failed to read ignore file {}: {}",
                path.display(),
                e
            )));
        }
        let matcher = builder.build().map_err(|e| {
            HoistError::Archive(format!(
                "Invalid ignore file {}: {}",
                path.display(),
                e
            ))
        })?;
        Ok(Self { matcher })
    }

    /// Build rules from literal pattern lines.
    pub fn from_lines(root: &Path, lines: &[&str]) -> Result<Self> {
        let mut builder = GitignoreBuilder::new(root);
        for line in lines {
            builder.add_line(None, line).map_err(|e| {
                HoistError::Archive(format!("Invalid ignore pattern '{}': {}", line, e))
            })?;
        }
        let matcher = builder
            .build()
            .map_err(|e| HoistError::Archive(format!("Invalid ignore patterns: {}", e)))?;
        Ok(Self { matcher })
    }
}

impl IgnoreRules for GitIgnoreRules {
    fn is_ignored(&self, relative: &Path, is_dir: bool) -> bool {
        self.matcher.matched(relative, is_dir).is_ignore()
    }
}

/// Everything that decides whether a walked entry goes into a layer.
pub struct SourceFilter {
    rules: Box<dyn IgnoreRules>,
    ignore_file: Option<PathBuf>,
    exclude: Vec<PathBuf>,
}

impl SourceFilter {
    /// Filter built from the ignore file in `root` plus absolute exclusions.
    pub fn load(root: &Path, ignore_file: &str, exclude: &[PathBuf]) -> Result<Self> {
        let rules = GitIgnoreRules::load(root, ignore_file)?;
        Ok(Self::new(Box::new(rules), Some(ignore_file), exclude))
    }

    pub fn new(rules: Box<dyn IgnoreRules>, ignore_file: Option<&str>, exclude: &[PathBuf]) -> Self {
        Self {
            rules,
            ignore_file: ignore_file.map(PathBuf::from),
            // Walked paths are canonical, so exclusions must be too
            exclude: exclude
                .iter()
                .map(|p| std::fs::canonicalize(p).unwrap_or_else(|_| p.clone()))
                .collect(),
        }
    }

    /// Filter that admits every entry.
    pub fn allow_all() -> Self {
        Self::new(Box::new(NoIgnore), None, &[])
    }

    /// Whether the entry at `absolute` (`relative` to the source root) is skipped.
    pub fn excludes(&self, absolute: &Path, relative: &Path, is_dir: bool) -> bool {
        if self.exclude.iter().any(|e| absolute == e) {
            return true;
        }
        if self.ignore_file.as_deref() == Some(relative) {
            return true;
        }
        self.rules.is_ignored(relative, is_dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_missing_ignore_file_ignores_nothing() {
        let tmp = TempDir::new().unwrap();
        let rules = GitIgnoreRules::load(tmp.path(), ".hoistignore").unwrap();
        assert!(!rules.is_ignored(Path::new("a.txt"), false));
    }

    #[test]
    fn test_ignore_file_patterns() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join(".hoistignore"), "*.log\nbuild/\n!keep.log\n").unwrap();
        let rules = GitIgnoreRules::load(tmp.path(), ".hoistignore").unwrap();

        assert!(rules.is_ignored(Path::new("debug.log"), false));
        assert!(!rules.is_ignored(Path::new("keep.log"), false));
        assert!(rules.is_ignored(Path::new("build"), true));
        assert!(!rules.is_ignored(Path::new("build"), false));
        assert!(!rules.is_ignored(Path::new("src/main.rs"), false));
    }

    #[test]
    fn test_from_lines() {
        let tmp = TempDir::new().unwrap();
        let rules = GitIgnoreRules::from_lines(tmp.path(), &["secret.txt"]).unwrap();
        assert!(rules.is_ignored(Path::new("secret.txt"), false));
        assert!(rules.is_ignored(Path::new("nested/secret.txt"), false));
    }

    #[test]
    fn test_filter_skips_ignore_file_itself() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join(".hoistignore"), "").unwrap();
        let filter = SourceFilter::load(tmp.path(), ".hoistignore", &[]).unwrap();
        let abs = tmp.path().join(".hoistignore");
        assert!(filter.excludes(&abs, Path::new(".hoistignore"), false));
        assert!(!filter.excludes(&tmp.path().join("x"), Path::new("x"), false));
    }

    #[test]
    fn test_filter_explicit_exclusion_wins() {
        let tmp = TempDir::new().unwrap();
        let scratch = tmp.path().join(".hoist");
        fs::create_dir(&scratch).unwrap();
        // A negated pattern does not rescue an explicit exclusion
        fs::write(tmp.path().join(".hoistignore"), "!.hoist\n").unwrap();
        let filter = SourceFilter::load(tmp.path(), ".hoistignore", &[scratch.clone()]).unwrap();
        let canonical = fs::canonicalize(&scratch).unwrap();
        assert!(filter.excludes(&canonical, Path::new(".hoist"), true));
    }

    #[test]
    fn test_allow_all() {
        let filter = SourceFilter::allow_all();
        assert!(!filter.excludes(Path::new("/a/b"), Path::new("b"), false));
    }
}
