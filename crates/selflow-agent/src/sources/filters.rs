//! Path ignore rules applied before a filesystem event is built

use std::collections::HashSet;
use std::path::{Component, Path};

use glob::Pattern;
use selflow_common::{SourceError, SourceResult};

/// Extensions that are noise for activity capture (editor swap files, locks, caches)
pub const DEFAULT_IGNORE_EXTENSIONS: &[&str] = &[
    ".tmp",
    ".temp",
    ".swp",
    ".lock",
    ".log",
    ".cache",
    ".ds_store",
    ".localized",
    ".trash",
];

/// Directory names whose contents are never captured
pub const DEFAULT_IGNORE_DIRS: &[&str] = &[
    "__pycache__",
    ".git",
    ".svn",
    ".hg",
    "node_modules",
    ".vscode",
    ".idea",
    ".mypy_cache",
    ".pytest_cache",
];

/// Compiled ignore rules
#[derive(Debug, Clone)]
pub struct IgnoreRules {
    extensions: HashSet<String>,
    dirs: HashSet<String>,
    ignore_hidden: bool,
    globs: Vec<Pattern>,
}

impl IgnoreRules {
    /// Build rules; extensions match case-insensitively with or without a leading dot
    pub fn new(
        extensions: &[String],
        dirs: &[String],
        ignore_hidden: bool,
        globs: &[String],
    ) -> SourceResult<Self> {
        let extensions = extensions
            .iter()
            .map(|e| {
                let e = e.to_lowercase();
                if e.starts_with('.') {
                    e
                } else {
                    format!(".{}", e)
                }
            })
            .collect();

        let globs = globs
            .iter()
            .map(|g| {
                Pattern::new(g).map_err(|e| {
                    SourceError::InitializationFailed(format!("bad ignore glob {:?}: {}", g, e))
                })
            })
            .collect::<SourceResult<Vec<_>>>()?;

        Ok(Self {
            extensions,
            dirs: dirs.iter().cloned().collect(),
            ignore_hidden,
            globs,
        })
    }

    /// Whether events for `path` should be discarded
    pub fn is_ignored(&self, path: &Path) -> bool {
        let name = match path.file_name() {
            Some(n) => n.to_string_lossy(),
            None => return true,
        };

        if self.ignore_hidden && name.starts_with('.') {
            return true;
        }

        // Names like ".DS_Store" have no extension as far as Path is concerned
        let lower = name.to_lowercase();
        if self.extensions.contains(&lower) {
            return true;
        }
        if let Some(ext) = path.extension() {
            let ext = format!(".{}", ext.to_string_lossy().to_lowercase());
            if self.extensions.contains(&ext) {
                return true;
            }
        }

        let in_ignored_dir = path.components().any(|c| match c {
            Component::Normal(part) => {
                let part = part.to_string_lossy();
                self.dirs.contains(part.as_ref())
                    || (self.ignore_hidden && part.starts_with('.') && part.len() > 1)
            }
            _ => false,
        });
        if in_ignored_dir {
            return true;
        }

        self.globs.iter().any(|g| g.matches_path(path))
    }
}

impl Default for IgnoreRules {
    fn default() -> Self {
        Self {
            extensions: DEFAULT_IGNORE_EXTENSIONS.iter().map(|s| s.to_string()).collect(),
            dirs: DEFAULT_IGNORE_DIRS.iter().map(|s| s.to_string()).collect(),
            ignore_hidden: true,
            globs: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_rules() {
        let rules = IgnoreRules::default();

        assert!(!rules.is_ignored(Path::new("/home/user/notes/todo.md")));
        assert!(rules.is_ignored(Path::new("/home/user/notes/todo.md.swp")));
        assert!(rules.is_ignored(Path::new("/home/user/app/build.LOG")));
        assert!(rules.is_ignored(Path::new("/home/user/proj/node_modules/x/index.js")));
        assert!(rules.is_ignored(Path::new("/home/user/proj/.git/HEAD")));
        assert!(rules.is_ignored(Path::new("/home/user/.bashrc")));
        assert!(rules.is_ignored(Path::new("/Users/me/Desktop/.DS_Store")));
    }

    #[test]
    fn test_hidden_files_allowed_when_disabled() {
        let rules = IgnoreRules::new(&[], &[], false, &[]).unwrap();
        assert!(!rules.is_ignored(Path::new("/home/user/.bashrc")));
        assert!(!rules.is_ignored(Path::new("/home/user/.config/app.toml")));
    }

    #[test]
    fn test_extension_normalization() {
        let rules = IgnoreRules::new(&["BAK".to_string()], &[], false, &[]).unwrap();
        assert!(rules.is_ignored(Path::new("/a/b/report.bak")));
        assert!(!rules.is_ignored(Path::new("/a/b/report.txt")));
    }

    #[test]
    fn test_glob_rules() {
        let rules =
            IgnoreRules::new(&[], &[], false, &["*/target/*".to_string()]).unwrap();
        assert!(rules.is_ignored(Path::new("/home/user/proj/target/debug/app")));
        assert!(!rules.is_ignored(Path::new("/home/user/proj/src/main.rs")));
    }

    #[test]
    fn test_bad_glob_rejected() {
        let err = IgnoreRules::new(&[], &[], false, &["[".to_string()]).unwrap_err();
        assert!(matches!(err, SourceError::InitializationFailed(_)));
    }
}
