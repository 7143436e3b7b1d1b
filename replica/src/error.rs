//! Error types shared by the consensus core and its collaborators.

use serde::{Deserialize, Serialize};

use crate::raft::cluster::MemberId;
use crate::raft::protocol::RequestKind;
use crate::raft::state::StateType;

/// Errors surfaced by a replica.
///
/// Errors travel inside protocol responses, so they are plain data: cloneable,
/// serializable and comparable.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RaftError {
    #[error("invalid state {state} for {kind} request")]
    IllegalState { state: StateType, kind: RequestKind },
    #[error("stale term {term}, current term is {current}")]
    StaleTerm { term: u64, current: u64 },
    #[error("not the leader (leader: {leader:?}, address: {address:?})")]
    NotLeader {
        leader: Option<MemberId>,
        address: Option<String>,
    },
    #[error("no leader available")]
    NoLeader,
    #[error("a configuration change is already in progress")]
    ConfigurationInProgress,
    #[error("unknown member {0}")]
    UnknownMember(MemberId),
    #[error("member {member} is at commit index {index}, {required} required")]
    NotCaughtUp {
        member: MemberId,
        index: u64,
        required: u64,
    },
    #[error("transport error: {0}")]
    Transport(String),
    #[error("storage error: {0}")]
    Storage(String),
    #[error("codec error: {0}")]
    Codec(String),
    #[error("request timed out")]
    Timeout,
    #[error("replica is shut down")]
    Shutdown,
}

impl RaftError {
    /// Returns true if the client may retry the request, possibly elsewhere.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RaftError::NotLeader { .. }
                | RaftError::NoLeader
                | RaftError::ConfigurationInProgress
                | RaftError::NotCaughtUp { .. }
                | RaftError::Transport(_)
                | RaftError::Timeout
        )
    }
}

impl From<std::io::Error> for RaftError {
    fn from(e: std::io::Error) -> Self {
        RaftError::Storage(e.to_string())
    }
}

impl From<bincode::Error> for RaftError {
    fn from(e: bincode::Error) -> Self {
        RaftError::Codec(e.to_string())
    }
}

impl From<serde_json::Error> for RaftError {
    fn from(e: serde_json::Error) -> Self {
        RaftError::Codec(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, RaftError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable() {
        assert!(RaftError::NoLeader.is_retryable());
        assert!(RaftError::NotLeader {
            leader: Some(2),
            address: None
        }
        .is_retryable());
        assert!(!RaftError::Shutdown.is_retryable());
        assert!(!RaftError::IllegalState {
            state: StateType::Passive,
            kind: RequestKind::Vote
        }
        .is_retryable());
    }

    #[test]
    fn test_io_error_is_storage() {
        let e: RaftError = std::io::Error::new(std::io::ErrorKind::Other, "disk").into();
        assert!(matches!(e, RaftError::Storage(_)));
    }
}
