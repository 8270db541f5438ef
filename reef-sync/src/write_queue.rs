//! Staging of account head updates ahead of durable storage
//!
//! Scanning moves account heads in memory and queues the matching writes. The queue is
//! flushed to the [`WalletStore`] independently of scanning, strictly in the order the writes
//! were queued.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use reef_config::ChainType;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::primitives::{
    AccountId, AddBlock, BlockHash, ChainHead, Nullifier, PendingWrite, RemoveBlock,
    WalletTransaction,
};
use crate::traits::{StoreError, WalletStore};

/// Nullifiers of received notes whose write has not been committed yet.
///
/// Counted, so a nullifier queued by two writes stays known until both are committed.
#[derive(Debug, Default)]
pub struct NullifierSet {
    counts: HashMap<Nullifier, usize>,
}

impl NullifierSet {
    pub fn insert(&mut self, nullifier: Nullifier) {
        *self.counts.entry(nullifier).or_default() += 1;
    }

    pub fn remove(&mut self, nullifier: &Nullifier) {
        if let Some(count) = self.counts.get_mut(nullifier) {
            *count -= 1;
            if *count == 0 {
                self.counts.remove(nullifier);
            }
        }
    }

    pub fn contains(&self, nullifier: &Nullifier) -> bool {
        self.counts.contains_key(nullifier)
    }

    pub fn len(&self) -> usize {
        self.counts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }
}

#[derive(Default)]
struct QueueState {
    heads: BTreeMap<AccountId, Option<ChainHead>>,
    committed: BTreeMap<AccountId, Option<ChainHead>>,
    pending: VecDeque<PendingWrite>,
    nullifiers: HashMap<AccountId, NullifierSet>,
}

/// In-memory account heads and the writes that bring the store up to them.
pub struct WriteQueue<St> {
    chain: ChainType,
    store: Arc<St>,
    state: Mutex<QueueState>,
    flushing: tokio::sync::Mutex<()>,
}

impl<St> WriteQueue<St>
where
    St: WalletStore + 'static,
{
    pub fn new(chain: ChainType, store: Arc<St>) -> Self {
        Self {
            chain,
            store,
            state: Mutex::new(QueueState::default()),
            flushing: tokio::sync::Mutex::new(()),
        }
    }

    pub fn chain(&self) -> ChainType {
        self.chain
    }

    pub fn store(&self) -> &Arc<St> {
        &self.store
    }

    fn state(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Seeds the in-memory heads with the durable heads of every account.
    pub async fn load_heads(&self) -> Result<(), StoreError> {
        let heads = self.store.get_account_heads(self.chain).await?;
        let mut state = self.state();
        for (account, head) in heads {
            state.heads.insert(account, head);
            state.committed.insert(account, head);
        }

        Ok(())
    }

    /// Sets the in-memory head of an account without queueing a write.
    pub fn set_head(&self, account: AccountId, head: Option<ChainHead>) {
        self.state().heads.insert(account, head);
    }

    /// The in-memory head of an account, ahead of or equal to its durable head.
    pub fn get_head(&self, account: &AccountId) -> Option<ChainHead> {
        self.state().heads.get(account).copied().flatten()
    }

    /// The head of an account as of the last successful write.
    pub fn committed_head(&self, account: &AccountId) -> Option<ChainHead> {
        self.state().committed.get(account).copied().flatten()
    }

    pub fn accounts(&self) -> Vec<AccountId> {
        self.state().heads.keys().copied().collect()
    }

    pub fn pending(&self) -> Vec<PendingWrite> {
        self.state().pending.iter().cloned().collect()
    }

    pub fn pending_len(&self) -> usize {
        self.state().pending.len()
    }

    /// Queues the connection of the block at `head` for an account.
    ///
    /// A block without transactions replaces the last queued write of the account when that
    /// write is an add without transactions too, so empty blocks do not grow the queue.
    pub fn enqueue_add(
        &self,
        account: AccountId,
        head: ChainHead,
        transactions: Vec<WalletTransaction>,
    ) {
        let mut state = self.state();
        state.heads.insert(account, Some(head));

        if transactions.is_empty() {
            let last = state
                .pending
                .iter_mut()
                .rev()
                .find(|write| write.account_id() == account);
            if let Some(PendingWrite::Add(last)) = last {
                if last.transactions.is_empty() {
                    last.head = head;
                    return;
                }
            }
        }

        let nullifiers = state.nullifiers.entry(account).or_default();
        for nullifier in transactions.iter().flat_map(|tx| tx.note_nullifiers()) {
            nullifiers.insert(nullifier);
        }
        state.pending.push_back(PendingWrite::Add(AddBlock {
            account_id: account,
            head,
            transactions,
        }));
    }

    /// Queues the disconnection of the block at `head` for an account. Never coalesced.
    pub fn enqueue_remove(&self, account: AccountId, head: ChainHead, prev_hash: BlockHash) {
        let remove = RemoveBlock {
            account_id: account,
            head,
            prev_hash,
        };
        let mut state = self.state();
        state.heads.insert(account, remove.parent_head());
        state.pending.push_back(PendingWrite::Remove(remove));
    }

    /// Returns true if a note received by `account` has this nullifier, committed or not.
    pub async fn has_nullifier(
        &self,
        account: &AccountId,
        nullifier: &Nullifier,
    ) -> Result<bool, StoreError> {
        let queued = self
            .state()
            .nullifiers
            .get(account)
            .is_some_and(|nullifiers| nullifiers.contains(nullifier));
        if queued {
            return Ok(true);
        }
        self.store.has_nullifier(account, nullifier, self.chain).await
    }

    /// Applies queued writes to the store in order, returning how many were committed.
    ///
    /// Stops at the first failed write, which stays at the front of the queue to be retried
    /// by the next flush.
    pub async fn flush(&self) -> Result<usize, StoreError> {
        let _flushing = self.flushing.lock().await;
        let mut committed = 0;

        loop {
            let next = self.state().pending.pop_front();
            let Some(write) = next else {
                break;
            };

            let result = match &write {
                PendingWrite::Add(add) => self.store.save_block(self.chain, add).await,
                PendingWrite::Remove(remove) => self.store.remove_block(self.chain, remove).await,
            };

            let mut state = self.state();
            if let Err(e) = result {
                state.pending.push_front(write);
                return Err(e);
            }
            match &write {
                PendingWrite::Add(add) => {
                    if let Some(nullifiers) = state.nullifiers.get_mut(&add.account_id) {
                        for tx in &add.transactions {
                            for nullifier in tx.note_nullifiers() {
                                nullifiers.remove(&nullifier);
                            }
                        }
                        if nullifiers.is_empty() {
                            state.nullifiers.remove(&add.account_id);
                        }
                    }
                    state.committed.insert(add.account_id, Some(add.head));
                }
                PendingWrite::Remove(remove) => {
                    state
                        .committed
                        .insert(remove.account_id, remove.parent_head());
                }
            }
            committed += 1;
        }

        if committed > 0 {
            tracing::debug!("Flushed {} writes.", committed);
        }
        Ok(committed)
    }
}

/// Flushes `queue` every `period` until `cancel` is triggered, then flushes a last time.
/// Failed flushes are logged and retried on the next tick.
pub fn spawn_flush_loop<St>(
    queue: Arc<WriteQueue<St>>,
    period: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()>
where
    St: WalletStore + 'static,
{
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {}
            }
            if let Err(e) = queue.flush().await {
                tracing::warn!("Failed to flush wallet writes. {}", e);
            }
        }

        if let Err(e) = queue.flush().await {
            tracing::warn!("Failed to flush wallet writes on shutdown. {}", e);
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::primitives::{DecryptedNote, TransactionHash};
    use crate::testutils::{account_id, build_chain, MemoryWalletStore};

    fn queue(accounts: &[AccountId]) -> Arc<WriteQueue<MemoryWalletStore>> {
        Arc::new(WriteQueue::new(
            ChainType::Testnet,
            Arc::new(MemoryWalletStore::with_accounts(accounts)),
        ))
    }

    fn received(nullifier: Nullifier) -> WalletTransaction {
        WalletTransaction::from_parts(
            TransactionHash([1; 32]),
            0,
            vec![DecryptedNote {
                index: 0,
                note: vec![1, 2, 3],
                nullifier: Some(nullifier),
            }],
            vec![],
        )
    }

    #[test]
    fn empty_adds_are_coalesced() {
        let queue = queue(&[account_id(1)]);
        let chain = build_chain(20, 1);
        for block in &chain {
            queue.enqueue_add(account_id(1), block.head(), vec![]);
        }

        assert_eq!(
            queue.pending(),
            vec![PendingWrite::Add(AddBlock {
                account_id: account_id(1),
                head: chain[19].head(),
                transactions: vec![],
            })]
        );
        assert_eq!(queue.get_head(&account_id(1)), Some(chain[19].head()));
    }

    #[test]
    fn adds_with_transactions_are_kept() {
        let queue = queue(&[account_id(1)]);
        let chain = build_chain(4, 1);
        queue.enqueue_add(account_id(1), chain[0].head(), vec![]);
        queue.enqueue_add(account_id(1), chain[1].head(), vec![received(Nullifier([1; 32]))]);
        queue.enqueue_add(account_id(1), chain[2].head(), vec![]);
        queue.enqueue_add(account_id(1), chain[3].head(), vec![]);

        let heads: Vec<_> = queue.pending().iter().map(PendingWrite::head).collect();
        assert_eq!(heads, vec![chain[0].head(), chain[1].head(), chain[3].head()]);
    }

    #[test]
    fn coalescing_is_per_account() {
        let queue = queue(&[account_id(1), account_id(2)]);
        let chain = build_chain(3, 1);
        for block in &chain {
            queue.enqueue_add(account_id(1), block.head(), vec![]);
            queue.enqueue_add(account_id(2), block.head(), vec![]);
        }

        let pending = queue.pending();
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].account_id(), account_id(1));
        assert_eq!(pending[0].head(), chain[2].head());
        assert_eq!(pending[1].account_id(), account_id(2));
        assert_eq!(pending[1].head(), chain[2].head());
    }

    #[test]
    fn removes_are_never_coalesced() {
        let queue = queue(&[account_id(1)]);
        let chain = build_chain(5, 1);
        queue.enqueue_add(account_id(1), chain[4].head(), vec![]);
        queue.enqueue_remove(account_id(1), chain[4].head(), chain[3].hash());
        queue.enqueue_remove(account_id(1), chain[3].head(), chain[2].hash());
        queue.enqueue_add(account_id(1), chain[3].head(), vec![]);

        assert_eq!(queue.pending_len(), 4);
        assert_eq!(queue.get_head(&account_id(1)), Some(chain[3].head()));
    }

    #[tokio::test]
    async fn flush_applies_writes_in_order() {
        let queue = queue(&[account_id(1), account_id(2)]);
        let chain = build_chain(3, 1);
        queue.enqueue_add(account_id(1), chain[0].head(), vec![]);
        queue.enqueue_add(account_id(2), chain[0].head(), vec![received(Nullifier([2; 32]))]);
        queue.enqueue_remove(account_id(1), chain[0].head(), chain[0].previous_block_hash());
        let expected = queue.pending();

        assert_eq!(queue.flush().await.unwrap(), 3);
        assert_eq!(queue.store().writes(), expected);
        assert_eq!(queue.pending_len(), 0);
        assert_eq!(queue.committed_head(&account_id(1)), None);
        assert_eq!(queue.committed_head(&account_id(2)), Some(chain[0].head()));
        assert_eq!(queue.store().head(&account_id(2)), Some(chain[0].head()));
    }

    #[tokio::test]
    async fn failed_writes_stay_queued() {
        let queue = queue(&[account_id(1)]);
        let chain = build_chain(3, 1);
        queue.enqueue_add(account_id(1), chain[0].head(), vec![received(Nullifier([3; 32]))]);
        queue.enqueue_add(account_id(1), chain[1].head(), vec![]);
        queue.store().set_fail_writes(true);

        assert!(queue.flush().await.is_err());
        assert_eq!(queue.pending_len(), 2);
        assert_eq!(queue.pending()[0].head(), chain[0].head());
        assert_eq!(queue.committed_head(&account_id(1)), None);
        assert_eq!(queue.get_head(&account_id(1)), Some(chain[1].head()));
        assert!(queue
            .has_nullifier(&account_id(1), &Nullifier([3; 32]))
            .await
            .unwrap());

        queue.store().set_fail_writes(false);
        assert_eq!(queue.flush().await.unwrap(), 2);
        assert_eq!(queue.committed_head(&account_id(1)), Some(chain[1].head()));
    }

    #[tokio::test]
    async fn nullifiers_are_known_before_and_after_commit() {
        let account = account_id(1);
        let queue = queue(&[account]);
        let chain = build_chain(1, 1);
        let nullifier = Nullifier([4; 32]);
        assert!(!queue.has_nullifier(&account, &nullifier).await.unwrap());

        queue.enqueue_add(account, chain[0].head(), vec![received(nullifier)]);
        assert!(queue.has_nullifier(&account, &nullifier).await.unwrap());
        assert!(!queue
            .store()
            .has_nullifier(&account, &nullifier, ChainType::Testnet)
            .await
            .unwrap());

        queue.flush().await.unwrap();
        assert!(queue.state().nullifiers.is_empty());
        assert!(queue.has_nullifier(&account, &nullifier).await.unwrap());
    }

    #[tokio::test]
    async fn nullifiers_belong_to_the_receiving_account() {
        let queue = queue(&[account_id(1), account_id(2)]);
        let chain = build_chain(1, 1);
        let nullifier = Nullifier([5; 32]);

        queue.enqueue_add(account_id(1), chain[0].head(), vec![received(nullifier)]);
        assert!(queue.has_nullifier(&account_id(1), &nullifier).await.unwrap());
        assert!(!queue.has_nullifier(&account_id(2), &nullifier).await.unwrap());

        queue.flush().await.unwrap();
        assert!(queue.has_nullifier(&account_id(1), &nullifier).await.unwrap());
        assert!(!queue.has_nullifier(&account_id(2), &nullifier).await.unwrap());
    }

    #[tokio::test]
    async fn heads_are_loaded_from_the_store() {
        let store = Arc::new(MemoryWalletStore::with_accounts(&[account_id(1), account_id(2)]));
        let chain = build_chain(2, 1);
        store.set_head(account_id(2), Some(chain[1].head()));
        let queue = WriteQueue::new(ChainType::Testnet, store);

        queue.load_heads().await.unwrap();
        assert_eq!(queue.accounts(), vec![account_id(1), account_id(2)]);
        assert_eq!(queue.get_head(&account_id(1)), None);
        assert_eq!(queue.get_head(&account_id(2)), Some(chain[1].head()));
        assert_eq!(queue.committed_head(&account_id(2)), Some(chain[1].head()));
    }

    #[tokio::test(start_paused = true)]
    async fn the_flush_loop_runs_until_cancelled() {
        let queue = queue(&[account_id(1)]);
        let chain = build_chain(2, 1);
        let cancel = CancellationToken::new();
        let handle = spawn_flush_loop(queue.clone(), Duration::from_secs(1), cancel.clone());

        queue.enqueue_add(account_id(1), chain[0].head(), vec![received(Nullifier([5; 32]))]);
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(queue.pending_len(), 0);

        queue.enqueue_add(account_id(1), chain[1].head(), vec![]);
        cancel.cancel();
        handle.await.unwrap();
        assert_eq!(queue.pending_len(), 0);
        assert_eq!(queue.store().head(&account_id(1)), Some(chain[1].head()));
    }
}
