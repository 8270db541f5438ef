//! Top level error module for the crate

use std::sync::Arc;

use crate::client::ClientError;
use crate::primitives::ChainHead;
use crate::traits::{HandlerError, StoreError};
use crate::walker::error::ContinuityError;

/// Top level error enum encapsulating any error that may occur during sync
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// Streamed blocks do not form a hash chain. Blocks delivered before the mismatch stay
    /// applied.
    #[error("Chain mismatch. {0}")]
    ChainMismatch(#[from] ContinuityError),
    /// The fork point lies outside of the recent history cache. The account must be rescanned.
    #[error("Unresolvable fork. No common ancestor found in recent history for head {head}")]
    UnresolvableFork {
        /// Head the fork was searched from
        head: ChainHead,
    },
    /// Errors associated with the block source
    #[error("Client error. {0}")]
    Client(#[from] ClientError),
    /// A failed request shared by several callers of a request cache
    #[error("Client error. {0}")]
    CachedClient(#[from] Arc<ClientError>),
    /// Errors returned by the wallet store
    #[error("Store error. {0}")]
    Store(#[from] StoreError),
    /// Errors returned from block handler callbacks
    #[error("Block handler error. {0}")]
    Handler(HandlerError),
    /// Errors reading or writing the recent history snapshot
    #[error("History error. {0}")]
    History(#[from] std::io::Error),
    /// A spawned task panicked or was cancelled
    #[error("Task error. {0}")]
    Task(#[from] tokio::task::JoinError),
}
