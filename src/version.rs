//! Build version exchanged during the connection handshake.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Version of a running netplay engine.
///
/// `code` is a dotted `major.minor[.revision]` string. `commit_id` and `build_time` only
/// take part in compatibility checks at the stricter levels of [`Version::similar`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Version {
    /// Dotted version code, e.g. `"3.1.002"`.
    pub code: String,
    /// Source revision the build was made from.
    pub commit_id: String,
    /// Build timestamp.
    pub build_time: String,
}

impl Version {
    /// Creates a version from its three parts.
    pub fn new(
        code: impl Into<String>,
        commit_id: impl Into<String>,
        build_time: impl Into<String>,
    ) -> Self {
        Self {
            code: code.into(),
            commit_id: commit_id.into(),
            build_time: build_time.into(),
        }
    }

    /// The version of this crate with no commit or build information.
    #[must_use]
    pub fn current() -> Self {
        Self::new(env!("CARGO_PKG_VERSION"), "", "")
    }

    /// Major component of the version code.
    #[must_use]
    pub fn major(&self) -> &str {
        self.code.split('.').next().unwrap_or_default()
    }

    /// Minor component of the version code.
    #[must_use]
    pub fn minor(&self) -> &str {
        self.code.split('.').nth(1).unwrap_or_default()
    }

    /// Checks compatibility at `level`.
    ///
    /// | level | requires equal |
    /// |-------|----------------|
    /// | 0 | nothing |
    /// | 1 | major |
    /// | 2 | major, minor |
    /// | 3 | major, minor, commit id |
    /// | 4+ | major, minor, commit id, build time |
    #[must_use]
    pub fn similar(&self, other: &Self, level: u8) -> bool {
        if level >= 1 && self.major() != other.major() {
            return false;
        }
        if level >= 2 && self.minor() != other.minor() {
            return false;
        }
        if level >= 3 && self.commit_id != other.commit_id {
            return false;
        }
        if level >= 4 && self.build_time != other.build_time {
            return false;
        }
        true
    }

    /// Description used in incompatibility reports at the given strictness.
    #[must_use]
    pub fn describe(&self, strict: u8) -> String {
        let mut text = self.code.clone();
        if strict >= 2 {
            text.push(' ');
            text.push_str(&self.commit_id);
        }
        if strict >= 3 {
            text.push(' ');
            text.push_str(&self.build_time);
        }
        text
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code)
    }
}

#[cfg(test)]
#[allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;

    #[test]
    fn level_zero_accepts_anything() {
        let a = Version::new("1.0", "a", "t1");
        let b = Version::new("9.9", "b", "t2");
        assert!(a.similar(&b, 0));
    }

    #[test]
    fn levels_add_requirements() {
        let base = Version::new("3.1.002", "abc", "2014-01-01");
        let minor = Version::new("3.2.000", "abc", "2014-01-01");
        let commit = Version::new("3.1.002", "def", "2014-01-01");
        let built = Version::new("3.1.002", "abc", "2014-02-02");

        assert!(base.similar(&minor, 1));
        assert!(!base.similar(&minor, 2));
        assert!(base.similar(&commit, 2));
        assert!(!base.similar(&commit, 3));
        assert!(base.similar(&built, 3));
        assert!(!base.similar(&built, 4));
    }

    #[test]
    fn major_mismatch_fails_level_one() {
        let a = Version::new("2.0", "", "");
        let b = Version::new("3.0", "", "");
        assert!(!a.similar(&b, 1));
    }

    #[test]
    fn describe_grows_with_strictness() {
        let v = Version::new("3.1", "abc", "now");
        assert_eq!(v.describe(0), "3.1");
        assert_eq!(v.describe(2), "3.1 abc");
        assert_eq!(v.describe(3), "3.1 abc now");
    }
}
