use std::fs;
use std::path::Path;
use std::sync::Arc;

use glob::Pattern;
use tracing::warn;

use crate::error::Result;

/// Name-level rules shared by every ruleset of a run: the reserved
/// filenames and the dot-file policy.
#[derive(Debug)]
pub struct NameRules {
    pub index_name: String,
    pub ignore_name: String,
    pub include_dot: bool,
}

impl NameRules {
    /// Any name carrying the index-file prefix is reserved; this also
    /// covers the store's `-db`, `.bak` and `.new` companions.
    pub fn is_reserved(&self, name: &str) -> bool {
        name.starts_with(&self.index_name) || name == self.ignore_name
    }
}

struct IgnorePattern {
    /// Leading-`/` patterns bind to the directory owning the file.
    anchored: bool,
    pattern: Pattern,
}

/// One directory's exclusion ruleset, chained upward to its parent.
pub struct Ignore {
    parent: Option<Arc<Ignore>>,
    rules: Arc<NameRules>,
    /// Directory base name with a trailing slash, used to rebuild the
    /// relative path of a query while walking up the chain.
    dir_name: String,
    patterns: Vec<IgnorePattern>,
}

impl Ignore {
    /// Load the ruleset for `dir`, reading `<dir>/<ignore_name>` if present.
    pub fn load(
        rules: Arc<NameRules>,
        dir: &Path,
        parent: Option<Arc<Ignore>>,
    ) -> Result<Arc<Ignore>> {
        let mut patterns = Vec::new();
        let file = dir.join(&rules.ignore_name);
        match fs::read_to_string(&file) {
            Ok(text) => {
                for line in text.lines() {
                    let line = line.trim();
                    if line.is_empty() || line.starts_with('#') {
                        continue;
                    }
                    let (anchored, body) = match line.strip_prefix('/') {
                        Some(rest) => (true, rest),
                        None => (false, line),
                    };
                    match Pattern::new(body) {
                        Ok(pattern) => patterns.push(IgnorePattern { anchored, pattern }),
                        Err(e) => warn!("invalid ignore pattern '{}': {}", line, e),
                    }
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        let dir_name = dir
            .file_name()
            .map(|n| format!("{}/", n.to_string_lossy()))
            .unwrap_or_default();

        Ok(Arc::new(Ignore {
            parent,
            rules,
            dir_name,
            patterns,
        }))
    }

    /// Empty ruleset, used when the ignore file cannot be read.
    pub(crate) fn empty(rules: Arc<NameRules>, dir: &Path) -> Arc<Ignore> {
        let dir_name = dir
            .file_name()
            .map(|n| format!("{}/", n.to_string_lossy()))
            .unwrap_or_default();
        Arc::new(Ignore {
            parent: None,
            rules,
            dir_name,
            patterns: Vec::new(),
        })
    }

    #[cfg(test)]
    fn with_patterns(
        rules: Arc<NameRules>,
        dir_name: &str,
        items: &[&str],
        parent: Option<Arc<Ignore>>,
    ) -> Arc<Ignore> {
        let patterns = items
            .iter()
            .map(|item| {
                let (anchored, body) = match item.strip_prefix('/') {
                    Some(rest) => (true, rest),
                    None => (false, *item),
                };
                IgnorePattern {
                    anchored,
                    pattern: Pattern::new(body).unwrap(),
                }
            })
            .collect();
        Arc::new(Ignore {
            parent,
            rules,
            dir_name: dir_name.to_string(),
            patterns,
        })
    }

    /// Whether `name` in this ruleset's directory is excluded.
    pub fn should_ignore(&self, name: &str) -> bool {
        if self.rules.is_reserved(name) {
            return true;
        }
        if name.starts_with('.') && !self.rules.include_dot {
            return true;
        }
        self.matches(name, "")
    }

    /// `full_path` is the query rewritten relative to the directory owning
    /// this ruleset; empty while resolving against the starting directory.
    fn matches(&self, name: &str, full_path: &str) -> bool {
        let descended = !full_path.is_empty();
        for item in &self.patterns {
            if item.anchored && descended {
                continue;
            }
            if item.pattern.matches(name) {
                return true;
            }
            if descended && item.pattern.matches(full_path) {
                return true;
            }
        }
        if let Some(parent) = &self.parent {
            let rewritten = if descended {
                format!("{}{}", self.dir_name, full_path)
            } else {
                format!("{}{}", self.dir_name, name)
            };
            return parent.matches(name, &rewritten);
        }
        false
    }
}
