//! Errors surfaced by the sync core.
//!
//! Only terminal outcomes are errors here. Anything that is recovered by a
//! retry is logged where it happens.

use std::time::Duration;

use questline_core::{CredentialError, TransportError};

/// Why a single connection attempt failed.
#[derive(Clone, Debug, thiserror::Error)]
pub enum ConnectCause {
    /// The credential could not be fetched.
    #[error(transparent)]
    Credential(#[from] CredentialError),
    /// The transport could not be opened.
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Terminal failure of a connection sequence.
#[derive(Clone, Debug, thiserror::Error)]
pub enum ConnectionError {
    /// Every attempt failed.
    #[error("connection failed after {attempts} attempts: {last}")]
    Exhausted {
        /// Attempts made.
        attempts: u32,
        /// Failure of the final attempt.
        #[source]
        last: ConnectCause,
    },
}

/// Terminal failure of a group join.
#[derive(Clone, Debug, thiserror::Error)]
pub enum GroupError {
    /// The base connection was not established within the wait window.
    #[error("base connection not established within {0:?}")]
    BaseConnectionTimeout(Duration),
    /// Every join attempt failed; the channel is now in `error`.
    #[error("joining {group} failed after {attempts} attempts: {last}")]
    RetriesExhausted {
        /// Channel name.
        group: String,
        /// Attempts made.
        attempts: u32,
        /// Failure of the final attempt.
        #[source]
        last: TransportError,
    },
    /// A join sequence for this channel is already running.
    #[error("a join for {0} is already in progress")]
    JoinInProgress(String),
}

/// Failure of a content service operation, with the step that failed.
#[derive(Debug, thiserror::Error)]
pub enum ContentError {
    /// The content identifier maps to no channel.
    #[error("invalid content identifier: {0:?}")]
    InvalidFile(String),
    /// Leaving the previous channel failed.
    #[error("failed to leave channel {group}")]
    Leave {
        /// Channel being left.
        group: String,
        /// Underlying failure.
        #[source]
        source: TransportError,
    },
    /// Joining the target channel failed.
    #[error("failed to join channel {group}")]
    Join {
        /// Channel being joined.
        group: String,
        /// Underlying failure.
        #[source]
        source: GroupError,
    },
    /// Sending the content request failed.
    #[error("failed to request content on channel {group}")]
    Request {
        /// Channel the request was sent to.
        group: String,
        /// Underlying failure.
        #[source]
        source: TransportError,
    },
}
