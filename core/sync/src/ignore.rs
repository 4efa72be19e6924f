//! Ignore rules shared by both scanners of a pair.

use glob::{MatchOptions, Pattern};
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use tracing::{debug, warn};

use vaultsync_common::{Error, Result, SyncPath};

/// Name of the per-root ignore file.
pub const IGNORE_FILE: &str = ".vaultsyncignore";

/// Patterns ignored in every pair.
pub const DEFAULT_PATTERNS: &[&str] = &[".DS_Store", "Thumbs.db", "desktop.ini", IGNORE_FILE];

const MATCH_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: false,
    require_literal_leading_dot: false,
};

/// A list of glob patterns.
#[derive(Debug, Clone, Default)]
pub struct PatternList(Vec<Pattern>);

impl PatternList {
    pub fn new<I>(patterns: I) -> Result<PatternList>
    where
        I: IntoIterator,
        I::Item: AsRef<str>,
    {
        let patterns: std::result::Result<Vec<_>, _> = patterns
            .into_iter()
            .map(|p| Pattern::new(p.as_ref()))
            .collect();
        patterns
            .map(PatternList)
            .map_err(|e| Error::InvalidInput(format!("Invalid ignore pattern: {}", e)))
    }

    fn matches(&self, candidate: &str) -> bool {
        self.0.iter().any(|p| p.matches_with(candidate, MATCH_OPTIONS))
    }
}

/// Ignore rules of one pair: built-in defaults, configured patterns and the
/// contents of `<root>/.vaultsyncignore`.
///
/// A path is ignored when it or any ancestor matches, either by its full
/// `/a/b` form or by its name alone.
#[derive(Debug)]
pub struct IgnoreRules {
    root: PathBuf,
    fixed: PatternList,
    from_file: RwLock<PatternList>,
}

impl IgnoreRules {
    /// # Errors
    /// - A configured pattern is not a valid glob
    pub fn new(root: impl AsRef<Path>, configured: &[String]) -> Result<Self> {
        let fixed = PatternList::new(
            DEFAULT_PATTERNS
                .iter()
                .map(|p| p.to_string())
                .chain(configured.iter().cloned()),
        )?;
        Ok(Self {
            root: root.as_ref().to_path_buf(),
            fixed,
            from_file: RwLock::new(PatternList::default()),
        })
    }

    /// Re-read the ignore file. Invalid lines are skipped with a warning.
    pub async fn reload(&self) -> Result<()> {
        let path = self.root.join(IGNORE_FILE);
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(e) => return Err(e.into()),
        };

        let mut patterns = Vec::new();
        for line in content.lines().map(str::trim) {
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            match Pattern::new(line) {
                Ok(pattern) => patterns.push(pattern),
                Err(e) => warn!("Skipping invalid pattern {:?} in {:?}: {}", line, path, e),
            }
        }
        debug!("Loaded {} patterns from {:?}", patterns.len(), path);

        let mut guard = self.from_file.write().unwrap_or_else(|e| e.into_inner());
        *guard = PatternList(patterns);
        Ok(())
    }

    pub fn is_ignored(&self, path: &SyncPath) -> bool {
        let from_file = self.from_file.read().unwrap_or_else(|e| e.into_inner());
        let mut current = Some(path.clone());
        while let Some(candidate) = current {
            if candidate.is_root() {
                break;
            }
            let full = candidate.to_string_path();
            let name = candidate.name().unwrap_or_default();
            if self.fixed.matches(&full)
                || self.fixed.matches(name)
                || from_file.matches(&full)
                || from_file.matches(name)
            {
                return true;
            }
            current = candidate.parent();
        }
        false
    }
}
