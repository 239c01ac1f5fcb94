//! Scope validation for builder file context.
//!
//! Every file loaded into a builder's context must be covered by the phase
//! scope: either a writable path or a read-only context entry. Directory
//! entries cover their descendants. A violation is fatal and must be raised
//! before the builder is invoked.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::Phase;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ScopeError {
    #[error("scope violation in phase {phase_id}: {} file(s) outside declared scope: {}", .paths.len(), .paths.join(", "))]
    Violation { phase_id: String, paths: Vec<String> },
}

/// A read-only context entry: either a bare path or `{ path: ... }`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ReadOnlyEntry {
    Path(String),
    Object { path: String },
}

impl ReadOnlyEntry {
    pub fn path(&self) -> &str {
        match self {
            Self::Path(path) | Self::Object { path } => path,
        }
    }
}

/// Declared scope of a phase.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScopeConfig {
    /// Writable files or directories.
    pub paths: Vec<String>,
    /// Files or directories the builder may read but not modify.
    pub read_only_context: Vec<ReadOnlyEntry>,
}

impl ScopeConfig {
    pub fn is_empty(&self) -> bool {
        self.paths.is_empty() && self.read_only_context.is_empty()
    }

    /// Whether `path` is covered by a writable entry.
    pub fn allows_write(&self, path: &str) -> bool {
        let normalized = normalize_path(path);
        self.paths.iter().any(|entry| covers(entry, &normalized))
    }

    /// Whether `path` is covered by any entry, writable or read-only.
    pub fn allows_read(&self, path: &str) -> bool {
        let normalized = normalize_path(path);
        self.paths.iter().any(|entry| covers(entry, &normalized))
            || self
                .read_only_context
                .iter()
                .any(|entry| covers(entry.path(), &normalized))
    }
}

/// Normalize a path independently of the host separator.
///
/// Backslashes become `/`, empty and `.` segments are dropped, and `..`
/// is resolved lexically. A `..` that climbs past the start is kept so the
/// result can never match an in-scope entry.
pub fn normalize_path(path: &str) -> String {
    let unified = path.replace('\\', "/");
    let absolute = unified.starts_with('/');
    let mut segments: Vec<&str> = Vec::new();

    for segment in unified.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                if matches!(segments.last(), Some(last) if *last != "..") {
                    segments.pop();
                } else {
                    segments.push("..");
                }
            }
            other => segments.push(other),
        }
    }

    let joined = segments.join("/");
    if absolute {
        format!("/{joined}")
    } else {
        joined
    }
}

/// Whether a scope entry covers a normalized path (exact or directory prefix).
fn covers(entry: &str, normalized_path: &str) -> bool {
    if entry.trim().is_empty() {
        return false;
    }
    let entry = normalize_path(entry);
    if entry.is_empty() {
        // "." or "./" scopes the whole workspace.
        return !normalized_path.starts_with("..") && !normalized_path.starts_with('/');
    }
    normalized_path == entry
        || normalized_path
            .strip_prefix(entry.as_str())
            .is_some_and(|rest| rest.starts_with('/'))
}

/// Validate a phase's file context against its declared scope.
///
/// Returns every offending path at once so the failure reason is complete.
pub fn validate(
    phase: &Phase,
    file_context: &[String],
    scope: &ScopeConfig,
) -> Result<(), ScopeError> {
    let violations: Vec<String> = file_context
        .iter()
        .filter(|path| !scope.allows_read(path))
        .map(|path| normalize_path(path))
        .collect();

    if violations.is_empty() {
        Ok(())
    } else {
        Err(ScopeError::Violation {
            phase_id: phase.id.to_string(),
            paths: violations,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Id;

    fn phase() -> Phase {
        Phase::new(Id::from_string("run-1"), "phase-1", 3)
    }

    fn make_scope(paths: &[&str], read_only: Vec<ReadOnlyEntry>) -> ScopeConfig {
        ScopeConfig {
            paths: paths.iter().map(ToString::to_string).collect(),
            read_only_context: read_only,
        }
    }

    fn context(paths: &[&str]) -> Vec<String> {
        paths.iter().map(ToString::to_string).collect()
    }

    #[test]
    fn normalize_is_separator_agnostic() {
        assert_eq!(normalize_path("src\\lib.rs"), "src/lib.rs");
        assert_eq!(normalize_path("./src//lib.rs"), "src/lib.rs");
        assert_eq!(normalize_path("src/./a/../lib.rs"), "src/lib.rs");
        assert_eq!(normalize_path("../outside.rs"), "../outside.rs");
        assert_eq!(normalize_path("/abs/x.rs"), "/abs/x.rs");
    }

    #[test]
    fn exact_file_match_passes() {
        let scope = make_scope(&["src/lib.rs"], vec![]);
        assert!(validate(&phase(), &context(&["src/lib.rs"]), &scope).is_ok());
        assert!(validate(&phase(), &context(&["src\\lib.rs"]), &scope).is_ok());
    }

    #[test]
    fn directory_entry_covers_descendants() {
        let scope = make_scope(&["src/"], vec![]);
        assert!(validate(&phase(), &context(&["src/a/b/c.rs", "src/lib.rs"]), &scope).is_ok());

        let without_slash = make_scope(&["src"], vec![]);
        assert!(validate(&phase(), &context(&["src/deep/file.rs"]), &without_slash).is_ok());
    }

    #[test]
    fn prefix_must_stop_at_segment_boundary() {
        let scope = make_scope(&["src"], vec![]);
        let err = validate(&phase(), &context(&["srcfoo/lib.rs"]), &scope).unwrap_err();
        assert_eq!(
            err,
            ScopeError::Violation {
                phase_id: "phase-1".to_string(),
                paths: vec!["srcfoo/lib.rs".to_string()],
            }
        );
    }

    #[test]
    fn read_only_strings_and_objects_are_accepted() {
        let scope = make_scope(
            &["src/"],
            vec![
                ReadOnlyEntry::Path("docs/".to_string()),
                ReadOnlyEntry::Object {
                    path: "config\\settings.toml".to_string(),
                },
            ],
        );
        let files = context(&["docs/guide/intro.md", "config/settings.toml", "src/main.rs"]);
        assert!(validate(&phase(), &files, &scope).is_ok());
        assert!(!scope.allows_write("docs/guide/intro.md"));
        assert!(scope.allows_write("src/main.rs"));
    }

    #[test]
    fn violations_are_all_reported() {
        let scope = make_scope(&["src/"], vec![]);
        let err = validate(
            &phase(),
            &context(&["src/ok.rs", "secrets/.env", "../escape.rs"]),
            &scope,
        )
        .unwrap_err();
        let ScopeError::Violation { paths, .. } = err;
        assert_eq!(paths, vec!["secrets/.env", "../escape.rs"]);
    }

    #[test]
    fn parent_traversal_cannot_escape_scope() {
        let scope = make_scope(&["src/"], vec![]);
        assert!(validate(&phase(), &context(&["src/../secrets.txt"]), &scope).is_err());
    }

    #[test]
    fn empty_scope_allows_only_empty_context() {
        let scope = ScopeConfig::default();
        assert!(validate(&phase(), &[], &scope).is_ok());
        assert!(validate(&phase(), &context(&["README.md"]), &scope).is_err());
    }

    #[test]
    fn read_only_entries_deserialize_from_yaml() {
        let yaml = r"
paths: [src/]
read_only_context:
  - docs/
  - path: Cargo.toml
";
        let scope: ScopeConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(scope.read_only_context.len(), 2);
        assert_eq!(scope.read_only_context[1].path(), "Cargo.toml");
    }
}
