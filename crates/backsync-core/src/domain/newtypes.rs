//! Domain newtypes with validation
//!
//! Strongly-typed wrappers for identifiers used across the engine.

use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::errors::DomainError;

// ============================================================================
// JobId
// ============================================================================

/// Identifier of a persisted backup job
///
/// Assigned by the record store on creation (an auto-increment row id).
/// A value of zero means "not yet persisted".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(i64);

impl JobId {
    /// Wrap a raw row id
    #[must_use]
    pub const fn new(raw: i64) -> Self {
        Self(raw)
    }

    /// The id of a job that has not been stored yet
    #[must_use]
    pub const fn unassigned() -> Self {
        Self(0)
    }

    /// Returns true if the record store has assigned this id
    #[must_use]
    pub const fn is_assigned(&self) -> bool {
        self.0 > 0
    }

    /// Get the raw row id
    #[must_use]
    pub const fn get(&self) -> i64 {
        self.0
    }
}

impl Display for JobId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for JobId {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim()
            .parse::<i64>()
            .map(Self)
            .map_err(|e| DomainError::InvalidId(format!("Invalid JobId '{s}': {e}")))
    }
}

impl From<i64> for JobId {
    fn from(raw: i64) -> Self {
        Self(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_id_unassigned() {
        assert!(!JobId::unassigned().is_assigned());
        assert!(JobId::new(7).is_assigned());
        assert_eq!(JobId::default(), JobId::unassigned());
    }

    #[test]
    fn test_job_id_parse() {
        let id: JobId = "42".parse().unwrap();
        assert_eq!(id.get(), 42);
        assert_eq!(id.to_string(), "42");

        let err = "abc".parse::<JobId>().unwrap_err();
        assert!(matches!(err, DomainError::InvalidId(_)));
    }

    #[test]
    fn test_job_id_serde_transparent() {
        let json = serde_json::to_string(&JobId::new(3)).unwrap();
        assert_eq!(json, "3");
        let back: JobId = serde_json::from_str("3").unwrap();
        assert_eq!(back, JobId::new(3));
    }
}
