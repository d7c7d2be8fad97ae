//! Error taxonomy for the directory.
//!
//! Only remote failures travel through the asynchronous lookup contract.
//! Entry validation fails synchronously at `add`; persistence failures are
//! logged by the caller and never reach consumers.

use std::path::PathBuf;
use std::time::Duration;

/// An entry that cannot be registered.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EntryError {
    #[error("participant id must not be empty")]
    EmptyParticipantId,
    #[error("entry {participant_id} has an empty domain")]
    EmptyDomain { participant_id: String },
    #[error("entry {participant_id} has an empty interface name")]
    EmptyInterfaceName { participant_id: String },
}

/// Failure reported by the remote directory client.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RemoteError {
    #[error("remote directory unavailable: {0}")]
    Unavailable(String),
    #[error("remote directory did not answer within {0:?}")]
    Timeout(Duration),
    #[error("remote directory rejected the request: {0}")]
    Rejected(String),
}

/// Error delivered to a lookup callback.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LookupError {
    #[error(transparent)]
    Remote(#[from] RemoteError),
    /// The directory was cleared while the lookup was waiting.
    #[error("lookup abandoned: directory shut down")]
    Abandoned,
}

#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    #[error("failed to read {0}: {1}")]
    Read(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    Parse(PathBuf, serde_json::Error),
    #[error("failed to write {0}: {1}")]
    Write(PathBuf, std::io::Error),
    #[error("failed to serialize snapshot: {0}")]
    Serialize(serde_json::Error),
}

impl PersistenceError {
    /// True when the file simply does not exist yet.
    pub fn is_not_found(&self) -> bool {
        matches!(self, PersistenceError::Read(_, e) if e.kind() == std::io::ErrorKind::NotFound)
    }
}
