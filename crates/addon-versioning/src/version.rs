//! ---
//! ems_section: "14-versioning-licensing-system"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Add-on version ordering and upgrade governance."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use semver::Prerelease;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised while parsing or comparing add-on versions.
#[derive(Debug, Error)]
pub enum VersionError {
    /// The version string was empty after trimming.
    #[error("version string is empty")]
    Empty,
    /// A dot separated segment was not an unsigned integer.
    #[error("invalid version {input}: segment '{segment}' is not numeric")]
    InvalidSegment {
        /// Offending input.
        input: String,
        /// Segment that failed to parse.
        segment: String,
    },
    /// A `-` separator was not followed by a pre-release identifier.
    #[error("invalid version {input}: empty pre-release")]
    EmptyPrerelease {
        /// Offending input.
        input: String,
    },
    /// The pre-release suffix violated SemVer identifier rules.
    #[error("invalid version {input}: {source}")]
    InvalidPrerelease {
        /// Offending input.
        input: String,
        /// Underlying parser error.
        #[source]
        source: semver::Error,
    },
    /// The requested version is older than the installed one.
    #[error("downgrade from {installed} to {requested} is not allowed")]
    Downgrade {
        /// Currently installed version.
        installed: AddOnVersion,
        /// Version the caller asked for.
        requested: AddOnVersion,
    },
}

/// Version of an add-on package.
///
/// Add-on versions follow SemVer loosely: any number of numeric segments is
/// accepted (`7.8.9.1` is valid), missing trailing segments compare as zero
/// and an optional `-prerelease` suffix is ordered with SemVer rules. Build
/// metadata after `+` is kept for display but ignored when comparing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct AddOnVersion {
    segments: Vec<u64>,
    pre: Prerelease,
    build: Option<String>,
}

impl AddOnVersion {
    /// Parse a version string, tolerating a leading `v`.
    pub fn parse(input: &str) -> Result<Self, VersionError> {
        let trimmed = input.trim();
        let body = trimmed.strip_prefix('v').unwrap_or(trimmed);
        if body.is_empty() {
            return Err(VersionError::Empty);
        }
        let (body, build) = match body.split_once('+') {
            Some((body, build)) => (body, Some(build.to_owned())),
            None => (body, None),
        };
        let (core, pre) = match body.split_once('-') {
            Some((_, "")) => {
                return Err(VersionError::EmptyPrerelease {
                    input: input.to_owned(),
                })
            }
            Some((core, pre)) => {
                let pre = Prerelease::new(pre).map_err(|source| VersionError::InvalidPrerelease {
                    input: input.to_owned(),
                    source,
                })?;
                (core, pre)
            }
            None => (body, Prerelease::EMPTY),
        };
        let segments = core
            .split('.')
            .map(|segment| {
                segment
                    .parse::<u64>()
                    .map_err(|_| VersionError::InvalidSegment {
                        input: input.to_owned(),
                        segment: segment.to_owned(),
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            segments,
            pre,
            build,
        })
    }

    /// Numeric segments in declaration order.
    pub fn segments(&self) -> &[u64] {
        &self.segments
    }

    /// Whether the version carries a pre-release suffix.
    pub fn is_prerelease(&self) -> bool {
        !self.pre.is_empty()
    }

    fn segment(&self, index: usize) -> u64 {
        self.segments.get(index).copied().unwrap_or(0)
    }
}

impl Ord for AddOnVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        let width = self.segments.len().max(other.segments.len());
        (0..width)
            .map(|index| self.segment(index).cmp(&other.segment(index)))
            .find(|ordering| ordering.is_ne())
            .unwrap_or(Ordering::Equal)
            .then_with(|| self.pre.cmp(&other.pre))
    }
}

impl PartialOrd for AddOnVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for AddOnVersion {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for AddOnVersion {}

impl fmt::Display for AddOnVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for segment in &self.segments {
            if !first {
                f.write_str(".")?;
            }
            write!(f, "{segment}")?;
            first = false;
        }
        if !self.pre.is_empty() {
            write!(f, "-{}", self.pre)?;
        }
        if let Some(build) = &self.build {
            write!(f, "+{build}")?;
        }
        Ok(())
    }
}

impl FromStr for AddOnVersion {
    type Err = VersionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for AddOnVersion {
    type Error = VersionError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<AddOnVersion> for String {
    fn from(value: AddOnVersion) -> Self {
        value.to_string()
    }
}
