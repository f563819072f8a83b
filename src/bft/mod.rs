//! Three-phase BFT consensus core.
//!
//! Only the pre-prepare entry step lives here in full; prepare and commit
//! handling happen in collaborating components that drive the same round
//! state machine.

pub mod core;
pub mod messages;
pub mod round;

use std::time::Duration;

use thiserror::Error;

pub use self::core::{Core, CoreEvent};
pub use messages::{ConsensusMessage, MessageCode, Preprepare, Subject, View};
pub use round::{RoundInfo, RoundState};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConsensusError {
    #[error("failed to decode preprepare message")]
    DecodePreprepare,
    /// Classification outcome, not a fault.
    #[error("message view is older than the current view")]
    OldMessage,
    /// Classification outcome; the caller queues the message.
    #[error("message view is newer than the current view")]
    FutureMessage,
    #[error("message sender is not the proposer")]
    NotProposer,
    /// Recoverable: the proposal re-enters the loop after the wait.
    #[error("proposal creation time is {0:?} in the future")]
    BlockCreateTimeInFuture(Duration),
    #[error("proposal verification failed: {0}")]
    VerifyProposal(String),
}

pub type ConsensusResult<T> = Result<T, ConsensusError>;
