//! Traits for interfacing a wallet with the sync engine

use async_trait::async_trait;
use reef_config::ChainType;

use crate::primitives::{
    AccountId, AddBlock, AssetId, Block, ChainHead, DecryptedNote, IncomingViewKey,
    NoteToDecrypt, Nullifier, RemoveBlock, StoredAsset,
};

/// Errors raised by block handler callbacks.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Error returned by a wallet store.
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct StoreError(pub String);

impl StoreError {
    pub fn new(message: impl std::fmt::Display) -> Self {
        Self(message.to_string())
    }
}

/// Receives blocks as they are connected to or disconnected from a chain head.
///
/// Calls are strictly ordered by sequence: ascending for `on_add`, descending for `on_remove`.
/// A handler must tolerate a walk being aborted between two calls.
#[async_trait]
pub trait BlockHandler: Send {
    /// Called for each block connected on top of the head
    async fn on_add(&mut self, block: &Block) -> Result<(), HandlerError>;

    /// Called for each block disconnected from the top of the head
    async fn on_remove(&mut self, block: &Block) -> Result<(), HandlerError>;
}

/// Native note decryption capability. Must be free of side effects on chain state.
pub trait NoteDecryptor: Send + Sync {
    /// Trial decrypts `encrypted_notes` with `incoming_view_key`, returning the notes owned by
    /// the key. `DecryptedNote::index` refers to the position in `encrypted_notes`.
    fn decrypt_notes_for_owner(
        &self,
        encrypted_notes: &[NoteToDecrypt<'_>],
        incoming_view_key: &IncomingViewKey,
    ) -> Vec<DecryptedNote>;
}

/// Durable wallet storage. Every call is expected to be transactional on its own; the head
/// and transactions of an [`AddBlock`] are persisted together.
#[async_trait]
pub trait WalletStore: Send + Sync {
    /// Persists the transactions of a connected block and moves the account head to it
    async fn save_block(&self, chain: ChainType, add: &AddBlock) -> Result<(), StoreError>;

    /// Reverts the account data of a disconnected block and moves the account head to its parent
    async fn remove_block(&self, chain: ChainType, remove: &RemoveBlock)
        -> Result<(), StoreError>;

    /// Returns true if `account` holds a received note with this nullifier
    async fn has_nullifier(
        &self,
        account: &AccountId,
        nullifier: &Nullifier,
        chain: ChainType,
    ) -> Result<bool, StoreError>;

    /// Returns the durable head of each account, `None` for accounts that never synced
    async fn get_account_heads(
        &self,
        chain: ChainType,
    ) -> Result<Vec<(AccountId, Option<ChainHead>)>, StoreError>;
}

/// Local storage for asset metadata.
#[async_trait]
pub trait AssetStore: Send + Sync {
    async fn get_asset(
        &self,
        chain: ChainType,
        id: &AssetId,
    ) -> Result<Option<StoredAsset>, StoreError>;

    async fn save_asset(&self, chain: ChainType, asset: StoredAsset) -> Result<(), StoreError>;
}
