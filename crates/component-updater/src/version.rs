//! Component and host version identifiers.
//!
//! Grammar: `MAJOR.MINOR.PATCH[-(alpha|beta|rc).N]`. Parsing is delegated to
//! [`semver`] and then narrowed to the three supported pre-release channels, so
//! that anything accepted here has a single, total ordering:
//!
//! ```
//! use component_updater::Version;
//!
//! let stable: Version = "1.2.0".parse().unwrap();
//! let rc: Version = "1.2.0-rc.1".parse().unwrap();
//! assert!(stable > rc);
//! assert!(!rc.is_stable());
//! ```

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{Result, UpdaterError};

/// Pre-release channel. Declaration order is the channel rank.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Channel {
    Alpha,
    Beta,
    Rc,
}

impl Channel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Alpha => "alpha",
            Channel::Beta => "beta",
            Channel::Rc => "rc",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "alpha" => Some(Channel::Alpha),
            "beta" => Some(Channel::Beta),
            "rc" => Some(Channel::Rc),
            _ => None,
        }
    }
}

/// Pre-release suffix: channel first, then counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PreRelease {
    pub channel: Channel,
    pub number: u64,
}

/// A validated version identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Version {
    pub major: u64,
    pub minor: u64,
    pub patch: u64,
    pub pre: Option<PreRelease>,
}

impl Version {
    /// Create a stable version.
    pub const fn new(major: u64, minor: u64, patch: u64) -> Self {
        Self {
            major,
            minor,
            patch,
            pre: None,
        }
    }

    /// Attach a pre-release suffix.
    pub const fn with_pre(mut self, channel: Channel, number: u64) -> Self {
        self.pre = Some(PreRelease { channel, number });
        self
    }

    /// Parse a version identifier, rejecting anything outside the grammar.
    pub fn parse(input: &str) -> Result<Self> {
        let invalid = |reason: String| UpdaterError::InvalidVersion {
            version: input.to_string(),
            reason,
        };

        let parsed = semver::Version::parse(input).map_err(|err| invalid(err.to_string()))?;
        if !parsed.build.is_empty() {
            return Err(invalid("build metadata is not allowed".into()));
        }

        let pre = if parsed.pre.is_empty() {
            None
        } else {
            let (channel, number) = parsed
                .pre
                .as_str()
                .split_once('.')
                .ok_or_else(|| invalid("pre-release must be <channel>.<number>".into()))?;
            let channel = Channel::parse(channel)
                .ok_or_else(|| invalid(format!("unknown pre-release channel '{channel}'")))?;
            let number = number
                .parse::<u64>()
                .map_err(|_| invalid(format!("pre-release counter '{number}' is not numeric")))?;
            Some(PreRelease { channel, number })
        };

        Ok(Self {
            major: parsed.major,
            minor: parsed.minor,
            patch: parsed.patch,
            pre,
        })
    }

    /// True iff the version carries no pre-release suffix.
    pub fn is_stable(&self) -> bool {
        self.pre.is_none()
    }

    /// Pre-release channel, if any.
    pub fn channel(&self) -> Option<Channel> {
        self.pre.map(|pre| pre.channel)
    }
}

/// Total order over versions.
pub fn compare(a: &Version, b: &Version) -> Ordering {
    a.cmp(b)
}

/// True iff `v` has no pre-release suffix.
pub fn is_stable(v: &Version) -> bool {
    v.is_stable()
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.major, self.minor, self.patch)
            .cmp(&(other.major, other.minor, other.patch))
            .then_with(|| match (&self.pre, &other.pre) {
                (None, None) => Ordering::Equal,
                (None, Some(_)) => Ordering::Greater,
                (Some(_), None) => Ordering::Less,
                (Some(a), Some(b)) => a.cmp(b),
            })
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)?;
        if let Some(pre) = &self.pre {
            write!(f, "-{}.{}", pre.channel.as_str(), pre.number)?;
        }
        Ok(())
    }
}

impl FromStr for Version {
    type Err = UpdaterError;

    fn from_str(s: &str) -> Result<Self> {
        Version::parse(s)
    }
}

impl Serialize for Version {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Version {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Version::parse(&raw).map_err(serde::de::Error::custom)
    }
}
