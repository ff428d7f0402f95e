//! Commissioner trust policy: which organisations' surveys this client answers.

use crate::survey::Survey;
use serde::Deserialize;
use std::collections::BTreeSet;
use std::fs;
use std::path::Path;
use thiserror::Error;

/// Governs which commissioners this client is willing to answer surveys for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommissionerPolicy {
    allowed: BTreeSet<String>,
}

impl CommissionerPolicy {
    /// Builds a policy from an inline list of commissioner names.
    pub fn from_names<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            allowed: names
                .into_iter()
                .map(Into::into)
                .map(|name: String| name.trim().to_string())
                .filter(|name| !name.is_empty())
                .collect(),
        }
    }

    /// Loads a policy from a JSON allowlist file.
    ///
    /// The expected format is:
    ///
    /// ```json
    /// { "allowed": ["KDE", "..."] }
    /// ```
    pub fn from_allowlist_path(path: &Path) -> Result<Self, PolicyError> {
        let contents = fs::read_to_string(path).map_err(|err| PolicyError::Io(err.to_string()))?;
        let parsed: AllowListFile =
            serde_json::from_str(&contents).map_err(|err| PolicyError::Parse(err.to_string()))?;
        Ok(Self::from_names(parsed.allowed))
    }

    /// Returns true if the survey's commissioner is on the allowlist.
    ///
    /// Surveys without a commissioner are never permitted.
    pub fn permits(&self, survey: &Survey) -> bool {
        survey
            .commissioner_name()
            .map(|name| self.allowed.contains(name))
            .unwrap_or(false)
    }

    /// Allowed commissioner names, sorted.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.allowed.iter().map(String::as_str)
    }
}

#[derive(Debug, Clone, Deserialize)]
struct AllowListFile {
    allowed: Vec<String>,
}

/// Errors surfaced while loading a commissioner policy.
#[derive(Debug, Clone, Error)]
pub enum PolicyError {
    /// File-system failure while loading the allowlist.
    #[error("policy I/O error: {0}")]
    Io(String),
    /// The allowlist could not be parsed.
    #[error("policy parse error: {0}")]
    Parse(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{SystemTime, UNIX_EPOCH};

    #[test]
    fn only_listed_commissioners_are_permitted() {
        let policy = CommissionerPolicy::from_names(["KDE"]);
        assert!(policy.permits(&Survey::new("1", "a").with_commissioner("KDE")));
        assert!(!policy.permits(&Survey::new("2", "b").with_commissioner("Wrong")));
        assert!(!policy.permits(&Survey::new("3", "c")));
    }

    #[test]
    fn blank_names_are_dropped() {
        let policy = CommissionerPolicy::from_names([" KDE ", ""]);
        assert_eq!(policy.names().collect::<Vec<_>>(), vec!["KDE"]);
        assert!(!policy.permits(&Survey::new("1", "a").with_commissioner("")));
    }

    #[test]
    fn allowlist_file_accepts_only_listed_names() {
        let mut path = std::env::temp_dir();
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        path.push(format!("commissioners_{nanos}.json"));
        fs::write(&path, r#"{"allowed": ["KDE", "GNOME"]}"#).unwrap();
        let policy = CommissionerPolicy::from_allowlist_path(&path).unwrap();
        fs::remove_file(&path).unwrap();
        assert!(policy.permits(&Survey::new("1", "a").with_commissioner("GNOME")));
        assert!(!policy.permits(&Survey::new("1", "a").with_commissioner("Other")));
    }

    #[test]
    fn missing_allowlist_file_is_an_io_error() {
        let path = std::env::temp_dir().join("definitely_missing_commissioners.json");
        assert!(matches!(
            CommissionerPolicy::from_allowlist_path(&path),
            Err(PolicyError::Io(_))
        ));
    }
}
