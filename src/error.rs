use thiserror::Error;

use crate::session::Phase;
use crate::types::{CoinId, SessionId};

pub type Result<T, E = FusionError> = std::result::Result<T, E>;

/// Errors surfaced by the coordinator and participant roles
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FusionError {
    #[error("coin {0} is already pledged to another registration")]
    Conflict(CoinId),

    #[error("malformed message: {0}")]
    Malformed(String),

    #[error("balance mismatch: inputs {inputs} != outputs {outputs} + fee {fee}")]
    BalanceMismatch { inputs: u64, outputs: u64, fee: u64 },

    #[error("deadline exceeded in phase {0:?}")]
    Timeout(Phase),

    #[error("protocol violation: {0}")]
    Misbehavior(String),

    #[error("too many blinded requests, {allowed} allowed")]
    RateLimited { allowed: usize },

    #[error("wrong phase: expected {expected:?}, session is in {actual:?}")]
    WrongPhase { expected: Phase, actual: Phase },

    #[error("unknown session {0}")]
    UnknownSession(SessionId),

    #[error("participant is not a member of this session")]
    UnknownParticipant,

    #[error("banned for another {remaining_secs}s")]
    Banned { remaining_secs: u64 },

    #[error("session {0} was aborted")]
    Aborted(SessionId),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("crypto error: {0}")]
    Crypto(String),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl FusionError {
    /// Transient failures may be retried by re-sending the current phase message.
    pub fn is_transient(&self) -> bool {
        matches!(self, FusionError::Transport(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        assert!(FusionError::Transport("reset".into()).is_transient());
        assert!(!FusionError::Misbehavior("reuse".into()).is_transient());
        assert!(!FusionError::Timeout(Phase::Registered).is_transient());
    }

    #[test]
    fn test_error_display() {
        let err = FusionError::BalanceMismatch {
            inputs: 10,
            outputs: 8,
            fee: 1,
        };
        assert_eq!(err.to_string(), "balance mismatch: inputs 10 != outputs 8 + fee 1");
    }
}
