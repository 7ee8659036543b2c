//! Error types for stowage_core.

use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Result type alias using stowage_core's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// One file whose content did not hash to the expected digest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HashFailure {
    pub key: String,
    pub expected: String,
    pub computed: String,
}

impl fmt::Display for HashFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} (expected {}, computed {})",
            self.key, self.expected, self.computed
        )
    }
}

fn join_failures(failures: &[HashFailure]) -> String {
    failures
        .iter()
        .map(|f| f.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

/// Errors that can occur while operating on storage entities.
#[derive(Error, Debug)]
pub enum Error {
    /// I/O error occurred during file operations.
    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    /// Info/Config record could not be encoded or decoded.
    #[error("State file encoding error: {source}")]
    Json {
        #[from]
        source: serde_json::Error,
    },

    /// Columnar engine failure.
    #[error("Table engine error: {source}")]
    Polars {
        #[from]
        source: polars::error::PolarsError,
    },

    /// Info on disk disagrees with the in-memory identity.
    #[error("Identity drift at {path}: stored {stored:?}, current {current:?}")]
    IdentityDrift {
        path: PathBuf,
        stored: String,
        current: String,
    },

    /// Exactly one of Info/Config exists.
    #[error("State divergence at {path}: info present = {info}, config present = {config}")]
    StateDivergence {
        path: PathBuf,
        info: bool,
        config: bool,
    },

    /// A Config write would have produced byte-identical output.
    #[error("Redundant config sync at {path}")]
    RedundantSync { path: PathBuf },

    /// Content hashes did not match.
    #[error("Integrity check failed for {entity}: {}", join_failures(.failures))]
    Integrity {
        entity: String,
        failures: Vec<HashFailure>,
    },

    /// A call was made in a state that does not permit it.
    #[error("Precondition failed for {entity}: {reason}")]
    Precondition { entity: String, reason: String },

    /// Foreign files found where only managed files are expected.
    #[error("Unknown content in {path}: {entries:?}")]
    UnknownContent { path: PathBuf, entries: Vec<String> },

    /// Non-managed leftovers in a folder being deleted.
    #[error("Refusing to remove garbage in {path}: {entries:?}")]
    Garbage { path: PathBuf, entries: Vec<String> },

    /// Expected managed files are missing.
    #[error("Missing content in {path}: {entries:?}")]
    MissingContent { path: PathBuf, entries: Vec<String> },

    #[error("{entity} is already created")]
    AlreadyCreated { entity: String },

    #[error("{entity} is not created")]
    NotCreated { entity: String },

    /// The handle refers to an entity that has been deleted.
    #[error("Handle for {entity} is no longer valid: {reason}")]
    Invalidated { entity: String, reason: String },

    /// Another holder owns the entity lock.
    #[error("Entity is locked: {path}")]
    Locked { path: PathBuf },

    #[error("Invalid filter: {reason}")]
    InvalidFilter { reason: String },

    #[error("Schema mismatch for {entity}: {reason}")]
    SchemaMismatch { entity: String, reason: String },

    /// A write targets a partition that already holds data.
    #[error("Partition {partition} of {entity} already has data")]
    PartitionExists { entity: String, partition: String },

    /// A read matched no rows.
    #[error("Nothing to read from {entity}")]
    NothingToRead { entity: String },

    /// The entity has no content producer attached.
    #[error("No producer available to create {entity}")]
    NoProducer { entity: String },

    /// A destructive call was refused by the confirmation hook.
    #[error("Deletion of {entity} was not confirmed")]
    NotConfirmed { entity: String },

    #[error("Invalid name {name:?}: {reason}")]
    InvalidName { name: String, reason: String },

    #[error("Unknown file system mount: {name}")]
    UnknownMount { name: String },

    #[error("Invalid settings: {reason}")]
    InvalidSettings { reason: String },
}

impl Error {
    /// Create a Precondition error.
    pub fn precondition(entity: impl fmt::Display, reason: impl Into<String>) -> Self {
        Error::Precondition {
            entity: entity.to_string(),
            reason: reason.into(),
        }
    }

    /// Create an IdentityDrift error.
    pub fn identity_drift(
        path: impl Into<PathBuf>,
        stored: impl Into<String>,
        current: impl Into<String>,
    ) -> Self {
        Error::IdentityDrift {
            path: path.into(),
            stored: stored.into(),
            current: current.into(),
        }
    }

    /// Create an Integrity error.
    pub fn integrity(entity: impl fmt::Display, failures: Vec<HashFailure>) -> Self {
        Error::Integrity {
            entity: entity.to_string(),
            failures,
        }
    }

    /// Create an Invalidated error.
    pub fn invalidated(entity: impl fmt::Display, reason: impl Into<String>) -> Self {
        Error::Invalidated {
            entity: entity.to_string(),
            reason: reason.into(),
        }
    }

    /// Create an InvalidFilter error.
    pub fn invalid_filter(reason: impl Into<String>) -> Self {
        Error::InvalidFilter {
            reason: reason.into(),
        }
    }

    /// Create a SchemaMismatch error.
    pub fn schema_mismatch(entity: impl fmt::Display, reason: impl Into<String>) -> Self {
        Error::SchemaMismatch {
            entity: entity.to_string(),
            reason: reason.into(),
        }
    }

    /// Create an InvalidName error.
    pub fn invalid_name(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::InvalidName {
            name: name.into(),
            reason: reason.into(),
        }
    }

    /// Create an InvalidSettings error.
    pub fn invalid_settings(reason: impl Into<String>) -> Self {
        Error::InvalidSettings {
            reason: reason.into(),
        }
    }

    /// True for errors that mean the on-disk state is inconsistent with
    /// the handle and must not be retried blindly.
    pub fn is_consistency_error(&self) -> bool {
        matches!(
            self,
            Error::IdentityDrift { .. } | Error::StateDivergence { .. }
        )
    }
}

impl From<tempfile::PersistError> for Error {
    fn from(err: tempfile::PersistError) -> Self {
        Error::Io { source: err.error }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_integrity_message_lists_every_key() {
        let err = Error::integrity(
            "fg",
            vec![
                HashFailure {
                    key: "f1".into(),
                    expected: "aa".into(),
                    computed: "bb".into(),
                },
                HashFailure {
                    key: "f2".into(),
                    expected: "cc".into(),
                    computed: "dd".into(),
                },
            ],
        );
        let msg = err.to_string();
        assert!(msg.contains("f1 (expected aa, computed bb)"));
        assert!(msg.contains("f2 (expected cc, computed dd)"));
    }

    #[test]
    fn test_consistency_errors() {
        assert!(Error::identity_drift("/x", "a", "b").is_consistency_error());
        assert!(
            Error::StateDivergence {
                path: "/x".into(),
                info: true,
                config: false
            }
            .is_consistency_error()
        );
        assert!(!Error::precondition("e", "r").is_consistency_error());
    }
}
