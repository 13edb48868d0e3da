//! Significance classification of a change set.
//!
//! A change set is worth syncing unless every path in it is noise: editor swap
//! files, logs, OS metadata, caches. Rules are an ordered list of predicates;
//! a path is trivial as soon as one rule matches it, and the set is
//! significant as soon as one path matches none.
//!
//! | Rule | Matches |
//! |------|---------|
//! | `Extension("log")` | `a/b.log` |
//! | `FileName(".DS_Store")` | `any/dir/.DS_Store` |
//! | `Suffix("_history")` | `.bash_history`, `.python_history` |
//! | `Glob("**/cache/**")` | anything under a `cache` directory |

use std::collections::BTreeSet;

use tracing::debug;

/// Extensions of editor, test and log side effects.
pub const TRIVIAL_EXTENSIONS: &[&str] = &["tmp", "swp", "test", "log", "bak"];

/// File names written by operating systems and desktop shells.
pub const TRIVIAL_FILE_NAMES: &[&str] = &[".DS_Store", "Thumbs.db", "desktop.ini", ".directory"];

/// Suffixes of caches, shell histories and editor backups.
pub const TRIVIAL_SUFFIXES: &[&str] = &["~", "_history", ".history", ".cache"];

/// Ordered set of modified paths for one cycle, relative to the source tree.
pub type ChangeSet = BTreeSet<String>;

/// One predicate over a relative path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrivialRule {
    /// Final extension, without the dot, compared case-insensitively.
    Extension(String),
    /// Exact final path component.
    FileName(String),
    /// Final path component ends with this string.
    Suffix(String),
    /// Glob over the whole forward-slash path.
    Glob(String),
}

impl TrivialRule {
    pub fn matches(&self, rel_path: &str) -> bool {
        let path = rel_path.replace('\\', "/");
        let file_name = path.rsplit('/').next().unwrap_or(&path);

        match self {
            Self::Extension(ext) => file_name
                .rsplit_once('.')
                .is_some_and(|(stem, e)| !stem.is_empty() && e.eq_ignore_ascii_case(ext)),
            Self::FileName(name) => file_name == name,
            Self::Suffix(suffix) => file_name.ends_with(suffix.as_str()),
            Self::Glob(pattern) => glob_match::glob_match(pattern, &path),
        }
    }
}

/// Decides whether a change set is significant.
#[derive(Debug, Clone)]
pub struct ChangeClassifier {
    rules: Vec<TrivialRule>,
}

impl ChangeClassifier {
    pub fn new(rules: Vec<TrivialRule>) -> Self {
        Self { rules }
    }

    /// Built-in rules plus extra glob patterns from configuration.
    pub fn with_extra_patterns(extra: &[String]) -> Self {
        let mut classifier = Self::default();
        classifier
            .rules
            .extend(extra.iter().cloned().map(TrivialRule::Glob));
        classifier
    }

    pub fn rules(&self) -> &[TrivialRule] {
        &self.rules
    }

    /// Whether `rel_path` matches at least one trivial rule.
    pub fn is_trivial(&self, rel_path: &str) -> bool {
        self.rules.iter().any(|rule| rule.matches(rel_path))
    }

    /// `false` for an empty set or one made only of trivial paths.
    pub fn is_significant<'a, I>(&self, change_set: I) -> bool
    where
        I: IntoIterator<Item = &'a String>,
    {
        for path in change_set {
            if !self.is_trivial(path) {
                debug!(path = path.as_str(), "significant change");
                return true;
            }
        }
        false
    }
}

impl Default for ChangeClassifier {
    fn default() -> Self {
        let rules = TRIVIAL_EXTENSIONS
            .iter()
            .map(|e| TrivialRule::Extension((*e).to_string()))
            .chain(
                TRIVIAL_FILE_NAMES
                    .iter()
                    .map(|n| TrivialRule::FileName((*n).to_string())),
            )
            .chain(
                TRIVIAL_SUFFIXES
                    .iter()
                    .map(|s| TrivialRule::Suffix((*s).to_string())),
            )
            .collect();
        Self { rules }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(paths: &[&str]) -> ChangeSet {
        paths.iter().map(|p| p.to_string()).collect()
    }

    #[test]
    fn test_empty_set_is_not_significant() {
        let classifier = ChangeClassifier::default();
        assert!(!classifier.is_significant(&ChangeSet::new()));
    }

    #[test]
    fn test_all_trivial_set_is_not_significant() {
        let classifier = ChangeClassifier::default();
        let changes = set(&[
            "debug.log",
            "dot_vimrc.swp",
            "notes.tmp",
            "x.test",
            "dot_zshrc.bak",
            "Library/.DS_Store",
            "Thumbs.db",
            "dot_bash_history",
            "dot_config/app/state.cache",
            "dot_profile~",
            "LOUD.LOG",
        ]);
        for path in &changes {
            assert!(classifier.is_trivial(path), "{path} should be trivial");
        }
        assert!(!classifier.is_significant(&changes));
    }

    #[test]
    fn test_one_real_edit_makes_set_significant() {
        let classifier = ChangeClassifier::default();
        let changes = set(&["debug.log", "dot_gitconfig", "x.swp"]);
        assert!(classifier.is_significant(&changes));
    }

    #[test]
    fn test_lookalikes_are_significant() {
        let classifier = ChangeClassifier::default();
        for path in ["catalog", "dot_logrotate.conf", "history.md", "backup/script.sh", ".log"] {
            assert!(!classifier.is_trivial(path), "{path} should be significant");
        }
    }

    #[test]
    fn test_extra_glob_patterns() {
        let classifier = ChangeClassifier::with_extra_patterns(&["private_*/cache/**".to_string()]);
        assert!(classifier.is_trivial("private_dot_local/cache/fonts/index"));
        assert!(!classifier.is_trivial("private_dot_local/share/fonts/index"));
        assert_eq!(
            classifier.rules().len(),
            TRIVIAL_EXTENSIONS.len() + TRIVIAL_FILE_NAMES.len() + TRIVIAL_SUFFIXES.len() + 1
        );
    }

    #[test]
    fn test_windows_separators() {
        let rule = TrivialRule::FileName("Thumbs.db".into());
        assert!(rule.matches("Pictures\\Thumbs.db"));
    }
}
