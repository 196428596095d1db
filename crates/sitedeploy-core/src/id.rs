//! Job identifiers.

use derive_more::Display;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier of a deployment job.
/// Uses UUIDv7 so ids sort by creation time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Display)]
#[display("{_0}")]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    /// Create a new unique JobId using UUIDv7.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// Create a JobId from an existing UUID.
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Get the underlying UUID.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for JobId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl From<JobId> for Uuid {
    fn from(id: JobId) -> Self {
        id.0
    }
}

impl std::str::FromStr for JobId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}
