//! Mocks and chain builders for testing the sync engine

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use reef_config::{ChainType, SyncConfig};
use sha2::{Digest, Sha256};

use crate::client::chunks::encode_chunk_archive;
use crate::client::{
    AssetSource, BlockResponseTransformer, BlockSource, ChunkArchive, ClientError, FeeRateSource,
};
use crate::primitives::{
    AccountId, AddBlock, Asset, AssetId, Block, BlockHash, ChainHead, Chunk, ChunksManifest,
    DecryptedNote, FeeRates, IncomingViewKey, NoteToDecrypt, Nullifier, Output, PendingWrite,
    RemoveBlock, SequenceRange, Spend, StoredAsset, Transaction, TransactionHash,
    WalletTransaction, GENESIS_SEQUENCE,
};
use crate::traits::{
    AssetStore, BlockHandler, HandlerError, NoteDecryptor, StoreError, WalletStore,
};

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn digest(parts: &[&[u8]]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().into()
}

/// Builds the block following `parent`, or a genesis block. The hash commits to `seed` so
/// chains built with different seeds diverge.
pub fn build_block(parent: Option<&Block>, seed: u64, transactions: Vec<Transaction>) -> Block {
    let (sequence, previous_block_hash, previous_note_size) = match parent {
        Some(parent) => (
            parent.sequence() + 1,
            parent.hash(),
            parent.note_size(),
        ),
        None => (GENESIS_SEQUENCE, BlockHash::default(), 0),
    };
    let hash = BlockHash(digest(&[
        &seed.to_le_bytes(),
        &sequence.to_le_bytes(),
        previous_block_hash.as_bytes(),
        &(transactions.len() as u64).to_le_bytes(),
    ]));
    let outputs: u64 = transactions.iter().map(|tx| tx.outputs().len() as u64).sum();

    Block::from_parts(
        sequence,
        hash,
        previous_block_hash,
        1_700_000_000 + sequence as i64 * 60,
        transactions,
        previous_note_size + outputs,
    )
}

/// Builds a valid chain of `len` empty blocks with sequences starting at genesis.
pub fn build_chain(len: u64, seed: u64) -> Vec<Block> {
    extend_chain(Vec::new(), len, seed)
}

/// Appends `count` empty blocks to `chain`.
pub fn extend_chain(mut chain: Vec<Block>, count: u64, seed: u64) -> Vec<Block> {
    for _ in 0..count {
        let block = build_block(chain.last(), seed, Vec::new());
        chain.push(block);
    }
    chain
}

/// Copies the blocks of `base` below `fork_sequence` and builds `len` new blocks from there.
pub fn fork_chain(base: &[Block], fork_sequence: u64, len: u64, seed: u64) -> Vec<Block> {
    let shared = base
        .iter()
        .take_while(|block| block.sequence() < fork_sequence)
        .cloned()
        .collect();
    extend_chain(shared, len, seed)
}

pub fn transaction(index: u32, spends: Vec<Nullifier>, outputs: Vec<Vec<u8>>) -> Transaction {
    let spend_bytes: Vec<u8> = spends.iter().flat_map(|nf| nf.0).collect();
    let output_bytes: Vec<u8> = outputs.iter().flatten().copied().collect();
    Transaction::from_parts(
        index,
        TransactionHash(digest(&[&index.to_le_bytes(), &spend_bytes, &output_bytes])),
        spends
            .into_iter()
            .map(|nullifier| Spend { nullifier })
            .collect(),
        outputs
            .into_iter()
            .map(|encrypted_note| Output { encrypted_note })
            .collect(),
    )
}

pub fn account_id(n: u8) -> AccountId {
    AccountId([n; 32])
}

pub fn incoming_view_key(n: u8) -> IncomingViewKey {
    IncomingViewKey(digest(&[b"ivk", &[n]]))
}

/// A config with small windows so forks beyond the retention are cheap to build.
pub fn test_config() -> SyncConfig {
    let mut config = SyncConfig::create_unconnected(ChainType::Testnet, None);
    config.recent_block_retention = 10;
    config.block_page_size = 4;
    config
}

pub fn test_chunk(start: u64, end: u64, finalized: bool) -> Chunk {
    Chunk {
        blocks_file: format!("chunks/{start}-{end}.blocks.gz"),
        byte_ranges_file: format!("chunks/{start}-{end}.ranges.csv"),
        timestamp: 1_700_000_000,
        range: SequenceRange { start, end },
        finalized,
    }
}

/// In-memory [`BlockSource`] serving a single chain, counting the requests it receives.
pub struct MockBlockSource {
    chain: ChainType,
    blocks: Mutex<Vec<Block>>,
    archives: Mutex<Vec<ChunkArchive>>,
    assets: Mutex<HashMap<AssetId, Asset>>,
    offline: AtomicBool,
    tip_requests: AtomicUsize,
    block_requests: AtomicUsize,
    chunk_requests: AtomicUsize,
    asset_requests: AtomicUsize,
    ranges: Mutex<Vec<(u64, u64)>>,
}

impl MockBlockSource {
    /// Serves `blocks`, which must start at genesis.
    pub fn new(chain: ChainType, blocks: Vec<Block>) -> Self {
        Self {
            chain,
            blocks: Mutex::new(blocks),
            archives: Mutex::new(Vec::new()),
            assets: Mutex::new(HashMap::new()),
            offline: AtomicBool::new(false),
            tip_requests: AtomicUsize::new(0),
            block_requests: AtomicUsize::new(0),
            chunk_requests: AtomicUsize::new(0),
            asset_requests: AtomicUsize::new(0),
            ranges: Mutex::new(Vec::new()),
        }
    }

    /// Replaces the served chain, as after a reorganization.
    pub fn reorg(&self, blocks: Vec<Block>) {
        *lock(&self.blocks) = blocks;
    }

    pub fn blocks(&self) -> Vec<Block> {
        lock(&self.blocks).clone()
    }

    /// Archives the served blocks `start..=end` as a chunk listed in the manifest.
    pub fn add_chunk(&self, start: u64, end: u64, finalized: bool) {
        let blocks: Vec<Block> = lock(&self.blocks)
            .iter()
            .filter(|block| (start..=end).contains(&block.sequence()))
            .cloned()
            .collect();
        let archive = encode_chunk_archive(test_chunk(start, end, finalized), &blocks)
            .expect("encoding to memory");
        lock(&self.archives).push(archive);
    }

    pub fn insert_asset(&self, asset: Asset) {
        lock(&self.assets).insert(asset.id, asset);
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn fee_rates(&self) -> FeeRates {
        FeeRates {
            slow: 1,
            average: 5,
            fast: 10,
        }
    }

    pub fn tip_requests(&self) -> usize {
        self.tip_requests.load(Ordering::SeqCst)
    }

    pub fn block_requests(&self) -> usize {
        self.block_requests.load(Ordering::SeqCst)
    }

    pub fn chunk_requests(&self) -> usize {
        self.chunk_requests.load(Ordering::SeqCst)
    }

    pub fn asset_requests(&self) -> usize {
        self.asset_requests.load(Ordering::SeqCst)
    }

    /// Every `start..=end` range requested so far.
    pub fn requested_ranges(&self) -> Vec<(u64, u64)> {
        lock(&self.ranges).clone()
    }

    fn check(&self, chain: ChainType) -> Result<(), ClientError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(ClientError::UnexpectedResponse("source offline".to_string()));
        }
        if chain != self.chain {
            return Err(ClientError::UnexpectedResponse(format!(
                "unknown network {chain}"
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl BlockSource for MockBlockSource {
    async fn get_latest_tip(&self, chain: ChainType) -> Result<ChainHead, ClientError> {
        self.tip_requests.fetch_add(1, Ordering::SeqCst);
        self.check(chain)?;
        lock(&self.blocks)
            .last()
            .map(Block::head)
            .ok_or(ClientError::MissingBlock {
                sequence: GENESIS_SEQUENCE,
            })
    }

    async fn get_block_by_sequence(
        &self,
        chain: ChainType,
        sequence: u64,
    ) -> Result<Block, ClientError> {
        self.block_requests.fetch_add(1, Ordering::SeqCst);
        self.check(chain)?;
        lock(&self.blocks)
            .iter()
            .find(|block| block.sequence() == sequence)
            .cloned()
            .ok_or(ClientError::MissingBlock { sequence })
    }

    async fn get_block_range(
        &self,
        chain: ChainType,
        start: u64,
        end: u64,
    ) -> Result<Vec<Block>, ClientError> {
        lock(&self.ranges).push((start, end));
        self.check(chain)?;
        Ok(lock(&self.blocks)
            .iter()
            .filter(|block| (start..=end).contains(&block.sequence()))
            .cloned()
            .collect())
    }

    async fn get_chunks_manifest(&self, chain: ChainType) -> Result<ChunksManifest, ClientError> {
        self.check(chain)?;
        Ok(ChunksManifest {
            chunks: lock(&self.archives)
                .iter()
                .map(|archive| archive.chunk.clone())
                .collect(),
            timestamp: 1_700_000_000,
        })
    }

    async fn fetch_chunk_archive(&self, chunk: &Chunk) -> Result<ChunkArchive, ClientError> {
        self.chunk_requests.fetch_add(1, Ordering::SeqCst);
        self.check(self.chain)?;
        lock(&self.archives)
            .iter()
            .find(|archive| archive.chunk.blocks_file == chunk.blocks_file)
            .cloned()
            .ok_or_else(|| {
                ClientError::UnexpectedResponse(format!("unknown chunk {}", chunk.blocks_file))
            })
    }
}

#[async_trait]
impl FeeRateSource for MockBlockSource {
    async fn get_fee_rates(&self, chain: ChainType) -> Result<FeeRates, ClientError> {
        self.check(chain)?;
        Ok(self.fee_rates())
    }
}

#[async_trait]
impl AssetSource for MockBlockSource {
    async fn get_asset(&self, chain: ChainType, id: &AssetId) -> Result<Asset, ClientError> {
        self.asset_requests.fetch_add(1, Ordering::SeqCst);
        self.check(chain)?;
        lock(&self.assets)
            .get(id)
            .cloned()
            .ok_or_else(|| ClientError::UnexpectedResponse(format!("unknown asset {id}")))
    }
}

/// Serves the blocks of `fork` in place of the blocks at the same sequence, dropping blocks
/// above the fork tip. The fork is expected to share its lower blocks with the source.
pub struct ForkInjector {
    fork: BTreeMap<u64, Block>,
}

impl ForkInjector {
    pub fn new(fork: Vec<Block>) -> Self {
        Self {
            fork: fork
                .into_iter()
                .map(|block| (block.sequence(), block))
                .collect(),
        }
    }

    fn tip_sequence(&self) -> u64 {
        self.fork.keys().next_back().copied().unwrap_or(0)
    }
}

impl BlockResponseTransformer for ForkInjector {
    fn transform_tip(&self, _chain: ChainType, tip: ChainHead) -> ChainHead {
        self.fork
            .values()
            .next_back()
            .map_or(tip, Block::head)
    }

    fn transform_block(&self, _chain: ChainType, block: Block) -> Block {
        self.fork.get(&block.sequence()).cloned().unwrap_or(block)
    }

    fn transform_block_range(&self, chain: ChainType, blocks: Vec<Block>) -> Vec<Block> {
        let tip = self.tip_sequence();
        blocks
            .into_iter()
            .filter(|block| block.sequence() <= tip)
            .map(|block| self.transform_block(chain, block))
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerEvent {
    Add(ChainHead),
    Remove(ChainHead),
}

/// Records the blocks it is called with.
#[derive(Default)]
pub struct RecordingHandler {
    pub events: Vec<HandlerEvent>,
    /// Fail when asked to add the block at this sequence
    pub fail_at: Option<u64>,
    /// Cancelled once this many blocks have been added
    pub cancel_after: Option<(usize, tokio_util::sync::CancellationToken)>,
}

impl RecordingHandler {
    pub fn added(&self) -> Vec<u64> {
        self.events
            .iter()
            .filter_map(|event| match event {
                HandlerEvent::Add(head) => Some(head.sequence),
                HandlerEvent::Remove(_) => None,
            })
            .collect()
    }

    pub fn removed(&self) -> Vec<u64> {
        self.events
            .iter()
            .filter_map(|event| match event {
                HandlerEvent::Remove(head) => Some(head.sequence),
                HandlerEvent::Add(_) => None,
            })
            .collect()
    }
}

#[async_trait]
impl BlockHandler for RecordingHandler {
    async fn on_add(&mut self, block: &Block) -> Result<(), HandlerError> {
        if self.fail_at == Some(block.sequence()) {
            return Err(format!("refusing block {}", block.sequence()).into());
        }
        self.events.push(HandlerEvent::Add(block.head()));
        if let Some((count, token)) = &self.cancel_after {
            if self.added().len() >= *count {
                token.cancel();
            }
        }
        Ok(())
    }

    async fn on_remove(&mut self, block: &Block) -> Result<(), HandlerError> {
        self.events.push(HandlerEvent::Remove(block.head()));
        Ok(())
    }
}

/// Encrypts `note` for the owner of `ivk`. Only understood by [`TestDecryptor`].
pub fn encrypt_note(ivk: &IncomingViewKey, note: &[u8]) -> Vec<u8> {
    let mut encrypted = ivk.0[..4].to_vec();
    encrypted.extend_from_slice(note);
    encrypted
}

pub fn test_nullifier(ivk: &IncomingViewKey, position: u64) -> Nullifier {
    Nullifier(digest(&[b"nf", ivk.as_bytes(), &position.to_le_bytes()]))
}

/// Decrypts notes built with [`encrypt_note`], deriving nullifiers from the note position.
#[derive(Default)]
pub struct TestDecryptor {
    pub calls: AtomicUsize,
}

impl NoteDecryptor for TestDecryptor {
    fn decrypt_notes_for_owner(
        &self,
        encrypted_notes: &[NoteToDecrypt<'_>],
        incoming_view_key: &IncomingViewKey,
    ) -> Vec<DecryptedNote> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        encrypted_notes
            .iter()
            .enumerate()
            .filter_map(|(index, note)| {
                note.encrypted_note
                    .strip_prefix(&incoming_view_key.0[..4])
                    .map(|plaintext| DecryptedNote {
                        index,
                        note: plaintext.to_vec(),
                        nullifier: Some(test_nullifier(incoming_view_key, note.position)),
                    })
            })
            .collect()
    }
}

#[derive(Default)]
struct MemoryState {
    heads: BTreeMap<AccountId, Option<ChainHead>>,
    transactions: BTreeMap<AccountId, BTreeMap<u64, Vec<WalletTransaction>>>,
    nullifiers: HashMap<(AccountId, Nullifier), usize>,
    assets: HashMap<(ChainType, AssetId), StoredAsset>,
    writes: Vec<PendingWrite>,
}

/// [`WalletStore`] and [`AssetStore`] keeping everything in memory.
#[derive(Default)]
pub struct MemoryWalletStore {
    state: Mutex<MemoryState>,
    fail_writes: AtomicBool,
}

impl MemoryWalletStore {
    pub fn with_accounts(accounts: &[AccountId]) -> Self {
        let store = Self::default();
        for account in accounts {
            lock(&store.state).heads.insert(*account, None);
        }
        store
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn head(&self, account: &AccountId) -> Option<ChainHead> {
        lock(&self.state).heads.get(account).copied().flatten()
    }

    pub fn set_head(&self, account: AccountId, head: Option<ChainHead>) {
        lock(&self.state).heads.insert(account, head);
    }

    /// Every committed write in commit order.
    pub fn writes(&self) -> Vec<PendingWrite> {
        lock(&self.state).writes.clone()
    }

    pub fn transactions(&self, account: &AccountId) -> Vec<(u64, WalletTransaction)> {
        lock(&self.state)
            .transactions
            .get(account)
            .into_iter()
            .flatten()
            .flat_map(|(sequence, txs)| txs.iter().map(|tx| (*sequence, tx.clone())))
            .collect()
    }

    pub fn stored_asset(&self, chain: ChainType, id: &AssetId) -> Option<StoredAsset> {
        lock(&self.state).assets.get(&(chain, *id)).cloned()
    }

    fn check_writable(&self) -> Result<(), StoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::new("database is locked"));
        }
        Ok(())
    }
}

#[async_trait]
impl WalletStore for MemoryWalletStore {
    async fn save_block(&self, _chain: ChainType, add: &AddBlock) -> Result<(), StoreError> {
        self.check_writable()?;
        let mut state = lock(&self.state);
        for nullifier in add.transactions.iter().flat_map(|tx| tx.note_nullifiers()) {
            *state
                .nullifiers
                .entry((add.account_id, nullifier))
                .or_default() += 1;
        }
        if !add.transactions.is_empty() {
            state
                .transactions
                .entry(add.account_id)
                .or_default()
                .insert(add.head.sequence, add.transactions.clone());
        }
        state.heads.insert(add.account_id, Some(add.head));
        state.writes.push(PendingWrite::Add(add.clone()));
        Ok(())
    }

    async fn remove_block(
        &self,
        _chain: ChainType,
        remove: &RemoveBlock,
    ) -> Result<(), StoreError> {
        self.check_writable()?;
        let mut state = lock(&self.state);
        let removed = state
            .transactions
            .get_mut(&remove.account_id)
            .and_then(|blocks| blocks.remove(&remove.head.sequence))
            .unwrap_or_default();
        for nullifier in removed.iter().flat_map(|tx| tx.note_nullifiers()) {
            let key = (remove.account_id, nullifier);
            if let Some(count) = state.nullifiers.get_mut(&key) {
                *count -= 1;
                if *count == 0 {
                    state.nullifiers.remove(&key);
                }
            }
        }
        state.heads.insert(remove.account_id, remove.parent_head());
        state.writes.push(PendingWrite::Remove(remove.clone()));
        Ok(())
    }

    async fn has_nullifier(
        &self,
        account: &AccountId,
        nullifier: &Nullifier,
        _chain: ChainType,
    ) -> Result<bool, StoreError> {
        Ok(lock(&self.state)
            .nullifiers
            .contains_key(&(*account, *nullifier)))
    }

    async fn get_account_heads(
        &self,
        _chain: ChainType,
    ) -> Result<Vec<(AccountId, Option<ChainHead>)>, StoreError> {
        Ok(lock(&self.state)
            .heads
            .iter()
            .map(|(account, head)| (*account, *head))
            .collect())
    }
}

#[async_trait]
impl AssetStore for MemoryWalletStore {
    async fn get_asset(
        &self,
        chain: ChainType,
        id: &AssetId,
    ) -> Result<Option<StoredAsset>, StoreError> {
        Ok(self.stored_asset(chain, id))
    }

    async fn save_asset(&self, chain: ChainType, asset: StoredAsset) -> Result<(), StoreError> {
        self.check_writable()?;
        lock(&self.state)
            .assets
            .insert((chain, asset.asset.id), asset);
        Ok(())
    }
}
