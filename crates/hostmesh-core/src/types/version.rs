//! Software version compatibility checks performed during the join handshake

use std::collections::BTreeSet;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Version advertised by one side of a handshake
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionInfo {
    pub version_string: String,
    /// Regex of other versions this build declares itself compatible with
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compatible_pattern: Option<String>,
}

impl VersionInfo {
    pub fn new(version_string: impl Into<String>, compatible_pattern: Option<String>) -> Self {
        Self {
            version_string: version_string.into(),
            compatible_pattern,
        }
    }

    /// Whether this build declares `version` compatible
    fn accepts(&self, version: &str) -> Result<bool> {
        match &self.compatible_pattern {
            None => Ok(false),
            Some(pattern) => {
                let re = Regex::new(pattern)
                    .map_err(|e| Error::InvalidVersionPattern(format!("{}: {}", pattern, e)))?;
                Ok(re.is_match(version))
            }
        }
    }

    /// Exact match, or each side marks the other as compatible
    pub fn is_compatible(&self, remote: &VersionInfo) -> Result<bool> {
        if self.version_string == remote.version_string {
            return Ok(true);
        }
        Ok(self.accepts(&remote.version_string)? && remote.accepts(&self.version_string)?)
    }

    /// Fails with [`Error::IncompatibleVersion`] unless compatible
    pub fn check_compatible(&self, remote: &VersionInfo) -> Result<()> {
        if self.is_compatible(remote)? {
            Ok(())
        } else {
            Err(Error::IncompatibleVersion {
                local: self.version_string.clone(),
                remote: remote.version_string.clone(),
            })
        }
    }
}

/// Distinct version strings seen across all handshakes so far
#[derive(Debug, Clone)]
pub struct ActiveVersions {
    versions: BTreeSet<String>,
    cap: usize,
}

impl ActiveVersions {
    pub fn new(local_version: impl Into<String>, cap: usize) -> Self {
        let mut versions = BTreeSet::new();
        versions.insert(local_version.into());
        Self { versions, cap }
    }

    /// Record a version, failing if it would exceed the cap.
    /// A rejected version is not recorded.
    pub fn admit(&mut self, version: &str) -> Result<()> {
        if self.versions.contains(version) {
            return Ok(());
        }
        if self.versions.len() >= self.cap {
            let mut versions: Vec<String> = self.versions.iter().cloned().collect();
            versions.push(version.to_string());
            return Err(Error::TooManyVersions {
                versions,
                cap: self.cap,
            });
        }
        self.versions.insert(version.to_string());
        Ok(())
    }

    pub fn versions(&self) -> impl Iterator<Item = &str> {
        self.versions.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.versions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.versions.is_empty()
    }
}

impl Default for ActiveVersions {
    fn default() -> Self {
        Self::new(crate::VERSION, crate::MAX_ACTIVE_VERSIONS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exact_match_is_compatible() {
        let a = VersionInfo::new("11.4", None);
        let b = VersionInfo::new("11.4", None);
        assert!(a.is_compatible(&b).unwrap());
        assert!(a.check_compatible(&b).is_ok());
    }

    #[test]
    fn test_pattern_must_hold_both_ways() {
        let a = VersionInfo::new("11.4", Some(r"^11\.\d+$".into()));
        let b = VersionInfo::new("11.5", Some(r"^11\.\d+$".into()));
        assert!(a.is_compatible(&b).unwrap());

        // Only one side opts in
        let c = VersionInfo::new("11.6", None);
        assert!(!a.is_compatible(&c).unwrap());
        assert!(matches!(
            a.check_compatible(&c),
            Err(Error::IncompatibleVersion { .. })
        ));
    }

    #[test]
    fn test_invalid_pattern() {
        let a = VersionInfo::new("1.0", Some("(".into()));
        let b = VersionInfo::new("2.0", None);
        assert!(matches!(
            a.is_compatible(&b),
            Err(Error::InvalidVersionPattern(_))
        ));
    }

    #[test]
    fn test_active_version_cap() {
        let mut active = ActiveVersions::new("1.0", 2);
        assert!(active.admit("1.0").is_ok());
        assert!(active.admit("1.1").is_ok());
        assert!(active.admit("1.1").is_ok());
        assert_eq!(active.len(), 2);

        let err = active.admit("1.2").unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(active.len(), 2);
        assert_eq!(active.versions().collect::<Vec<_>>(), vec!["1.0", "1.1"]);
    }
}
