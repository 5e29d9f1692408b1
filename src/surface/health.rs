use crate::error::{VidmemError, VidmemResult};
use std::fmt;

/// One of the two places a buffer's pixels can live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Location {
    System,
    Video,
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::System => f.write_str("system"),
            Self::Video => f.write_str("video"),
        }
    }
}

/// Health of one storage location.
///
/// Legal transitions, one function each:
///
/// ```text
/// INVALID --created--> RESTORE --stored--> STORED
///                         ^                  |
///                         +----outdated------+
/// (any) --invalidated--> INVALID
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Health {
    /// No storage, no data.
    #[default]
    Invalid,
    /// Storage exists but the content may be behind the other location.
    Restore,
    /// Storage holds current data.
    Stored,
}

impl Health {
    /// Storage was created for the location.
    pub(crate) fn created(self, location: Location) -> VidmemResult<Self> {
        match self {
            Self::Invalid => Ok(Self::Restore),
            other => Err(VidmemError::bug(format!(
                "{location} storage created while {other:?}"
            ))),
        }
    }

    /// The location was brought up to date.
    pub(crate) fn stored(self, location: Location) -> VidmemResult<Self> {
        match self {
            Self::Restore => Ok(Self::Stored),
            other => Err(VidmemError::bug(format!(
                "{location} storage marked stored while {other:?}"
            ))),
        }
    }

    /// The other location was written; a stored copy is now stale.
    #[must_use]
    pub(crate) const fn outdated(self) -> Self {
        match self {
            Self::Stored => Self::Restore,
            other => other,
        }
    }

    #[must_use]
    pub(crate) const fn invalidated(self) -> Self {
        Self::Invalid
    }

    #[must_use]
    pub const fn is_valid(self) -> bool {
        !matches!(self, Self::Invalid)
    }
}
