//! Entrypoint for sync engine

use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rayon::prelude::*;
use reef_config::SyncConfig;
use tokio_util::sync::CancellationToken;

use crate::client::BlockSource;
use crate::error::SyncError;
use crate::history::RecentHistoryCache;
use crate::primitives::{
    AccountId, Block, BlockHash, ChainHead, DecryptedNote, IncomingViewKey, NoteToDecrypt,
    Nullifier, WalletTransaction,
};
use crate::processor::{ChainProcessor, UpdateOutcome};
use crate::reverse::{ReverseChainWalker, UnwindOutcome};
use crate::traits::{BlockHandler, HandlerError, NoteDecryptor, WalletStore};
use crate::walker::ChainWalker;
use crate::write_queue::{spawn_flush_loop, WriteQueue};

/// An account followed by the scanner.
#[derive(Debug, Clone)]
pub struct ScanAccount {
    pub id: AccountId,
    pub incoming_view_key: IncomingViewKey,
}

/// Summary of one [`Scanner::scan`] pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanReport {
    /// Number of distinct heads the accounts were grouped by
    pub groups: usize,
    /// Accounts whose head hash changed
    pub updated: Vec<AccountId>,
    /// Accounts skipped because their walker was busy
    pub busy: Vec<AccountId>,
    /// Accounts unwound to genesis after an unresolvable fork
    pub rescanned: Vec<AccountId>,
}

/// Keeps the heads of a set of accounts on the remote chain, trial decrypting every block
/// connected on top of them and staging the results in a [`WriteQueue`].
pub struct Scanner<S, St, D> {
    config: SyncConfig,
    walker: Arc<ChainWalker<S>>,
    queue: Arc<WriteQueue<St>>,
    decryptor: Arc<D>,
    accounts: Vec<ScanAccount>,
    history_path: Option<PathBuf>,
}

impl<S, St, D> Scanner<S, St, D>
where
    S: BlockSource + 'static,
    St: WalletStore + 'static,
    D: NoteDecryptor + 'static,
{
    pub fn new(
        config: SyncConfig,
        walker: Arc<ChainWalker<S>>,
        queue: Arc<WriteQueue<St>>,
        decryptor: Arc<D>,
    ) -> Self {
        Self {
            config,
            walker,
            queue,
            decryptor,
            accounts: Vec::new(),
            history_path: None,
        }
    }

    /// Builds a scanner from the wallet data directory.
    ///
    /// Recent history is restored from the snapshot in the data directory and saved back
    /// after every scan. Account heads are seeded from the store.
    pub async fn load(
        config: SyncConfig,
        source: Arc<S>,
        store: Arc<St>,
        decryptor: Arc<D>,
    ) -> Result<Self, SyncError> {
        let history_path = config.get_history_path()?.into_path_buf();
        let retention = config.recent_block_retention;
        let snapshot = history_path.clone();
        let history = tokio::task::spawn_blocking(move || {
            RecentHistoryCache::load_from_path(&snapshot, retention)
        })
        .await??;
        tracing::info!(
            "Loaded {} recent blocks from {}.",
            history.len(config.chain),
            history_path.display()
        );

        let walker = Arc::new(ChainWalker::new(source, Arc::new(history), &config));
        let queue = Arc::new(WriteQueue::new(config.chain, store));
        queue.load_heads().await?;

        Ok(Self::new(config, walker, queue, decryptor).with_history_path(history_path))
    }

    /// Saves the recent history snapshot to `path` after each scan.
    pub fn with_history_path(mut self, path: PathBuf) -> Self {
        self.history_path = Some(path);
        self
    }

    /// Follows an account, replacing the viewing key of an account already followed.
    pub fn add_account(&mut self, id: AccountId, incoming_view_key: IncomingViewKey) {
        self.accounts.retain(|account| account.id != id);
        self.accounts.push(ScanAccount {
            id,
            incoming_view_key,
        });
    }

    pub fn accounts(&self) -> &[ScanAccount] {
        &self.accounts
    }

    pub fn walker(&self) -> &Arc<ChainWalker<S>> {
        &self.walker
    }

    pub fn queue(&self) -> &Arc<WriteQueue<St>> {
        &self.queue
    }

    /// Moves every account head to the remote tip.
    ///
    /// Accounts sharing a head are scanned together, lowest head first. A group whose fork
    /// point fell out of recent history is unwound to genesis when
    /// `rescan_on_unresolvable_fork` is set, to be scanned again on the next pass.
    pub async fn scan(&self, cancel: &CancellationToken) -> Result<ScanReport, SyncError> {
        let groups = self.group_by_head();
        let mut report = ScanReport {
            groups: groups.len(),
            ..Default::default()
        };

        for (head, accounts) in groups {
            if cancel.is_cancelled() {
                break;
            }
            let ids: Vec<AccountId> = accounts.iter().map(|account| account.id).collect();
            let mut handler = ScanHandler {
                queue: self.queue.clone(),
                decryptor: self.decryptor.clone(),
                accounts,
            };
            let mut processor = ChainProcessor::new(self.walker.clone(), head);

            match processor.update(&mut handler, cancel).await {
                Ok(UpdateOutcome::Updated { hash_changed }) => {
                    if hash_changed {
                        report.updated.extend(&ids);
                    }
                }
                Ok(UpdateOutcome::Busy) => {
                    tracing::warn!("Skipping {} accounts, walker is busy.", ids.len());
                    report.busy.extend(&ids);
                }
                Err(SyncError::UnresolvableFork { head })
                    if self.config.rescan_on_unresolvable_fork =>
                {
                    tracing::info!("Rescanning {} accounts from genesis.", ids.len());
                    let mut reverse = ReverseChainWalker::new(self.walker.clone(), Some(head));
                    match reverse.unwind(&mut handler, cancel).await? {
                        UnwindOutcome::Unwound { .. } => report.rescanned.extend(&ids),
                        UnwindOutcome::Busy => report.busy.extend(&ids),
                    }
                }
                Err(e) => return Err(e),
            }
        }

        self.save_history().await?;
        Ok(report)
    }

    /// Scans every `poll_interval` and flushes the write queue on its own interval until
    /// `cancel` is triggered. Pending writes are flushed before returning.
    pub async fn run(
        &self,
        poll_interval: Duration,
        cancel: CancellationToken,
    ) -> Result<(), SyncError> {
        tracing::info!("Syncing wallet...");
        let flush_cancel = cancel.child_token();
        let flush = spawn_flush_loop(
            self.queue.clone(),
            self.config.flush_interval,
            flush_cancel.clone(),
        );

        let mut interval = tokio::time::interval(poll_interval);
        let result = loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break Ok(()),
                _ = interval.tick() => {}
            }
            match self.scan(&cancel).await {
                Ok(report) => tracing::debug!("Scan finished. {:?}", report),
                Err(e) => break Err(e),
            }
        };

        flush_cancel.cancel();
        flush.await?;
        tracing::info!("Sync stopped.");
        result
    }

    fn group_by_head(&self) -> Vec<(Option<ChainHead>, Vec<ScanAccount>)> {
        let mut groups: BTreeMap<Option<(u64, BlockHash)>, Vec<ScanAccount>> = BTreeMap::new();
        for account in &self.accounts {
            let head = self.queue.get_head(&account.id);
            groups
                .entry(head.map(|head| (head.sequence, head.hash)))
                .or_default()
                .push(account.clone());
        }
        groups
            .into_iter()
            .map(|(key, accounts)| {
                let head = key.map(|(sequence, hash)| ChainHead::new(hash, sequence));
                (head, accounts)
            })
            .collect()
    }

    async fn save_history(&self) -> Result<(), SyncError> {
        let Some(path) = self.history_path.clone() else {
            return Ok(());
        };
        let history = self.walker.history().clone();
        tokio::task::spawn_blocking(move || history.save_to_path(&path)).await??;
        Ok(())
    }
}

/// Stages the blocks walked for a group of accounts sharing a head.
struct ScanHandler<St, D> {
    queue: Arc<WriteQueue<St>>,
    decryptor: Arc<D>,
    accounts: Vec<ScanAccount>,
}

#[async_trait]
impl<St, D> BlockHandler for ScanHandler<St, D>
where
    St: WalletStore + 'static,
    D: NoteDecryptor + 'static,
{
    async fn on_add(&mut self, block: &Block) -> Result<(), HandlerError> {
        let decryptor = self.decryptor.clone();
        let keys: Vec<IncomingViewKey> = self
            .accounts
            .iter()
            .map(|account| account.incoming_view_key)
            .collect();
        let owned = block.clone();
        let decrypted =
            tokio::task::spawn_blocking(move || decrypt_block(decryptor.as_ref(), &owned, &keys))
                .await?;

        let note_transactions = note_transaction_indices(block);
        for (account, notes) in self.accounts.iter().zip(decrypted) {
            // notes received in this block may be spent by a later transaction of the same block
            let received: HashSet<Nullifier> =
                notes.iter().filter_map(|note| note.nullifier).collect();
            let mut spent: Vec<Vec<Nullifier>> = Vec::with_capacity(block.transactions().len());
            for transaction in block.transactions() {
                let mut own = Vec::new();
                for spend in transaction.spends() {
                    if received.contains(&spend.nullifier)
                        || self
                            .queue
                            .has_nullifier(&account.id, &spend.nullifier)
                            .await?
                    {
                        own.push(spend.nullifier);
                    }
                }
                spent.push(own);
            }

            let mut notes_by_transaction: Vec<Vec<DecryptedNote>> =
                vec![Vec::new(); block.transactions().len()];
            for note in notes {
                if let Some(&transaction) = note_transactions.get(note.index) {
                    notes_by_transaction[transaction].push(note);
                }
            }

            let transactions: Vec<WalletTransaction> = block
                .transactions()
                .iter()
                .zip(notes_by_transaction)
                .zip(&spent)
                .filter(|((_, notes), spent)| !notes.is_empty() || !spent.is_empty())
                .map(|((transaction, notes), spent)| {
                    WalletTransaction::from_parts(
                        transaction.hash(),
                        transaction.index(),
                        notes,
                        spent.clone(),
                    )
                })
                .collect();
            if !transactions.is_empty() {
                tracing::debug!(
                    "Found {} transactions for account {} in block {}.",
                    transactions.len(),
                    account.id,
                    block.head()
                );
            }
            self.queue.enqueue_add(account.id, block.head(), transactions);
        }

        Ok(())
    }

    async fn on_remove(&mut self, block: &Block) -> Result<(), HandlerError> {
        for account in &self.accounts {
            self.queue
                .enqueue_remove(account.id, block.head(), block.previous_block_hash());
        }
        Ok(())
    }
}

/// Trial decrypts every output of `block` with each key in parallel. The result holds the
/// notes found for each key, in key order.
fn decrypt_block<D: NoteDecryptor + ?Sized>(
    decryptor: &D,
    block: &Block,
    keys: &[IncomingViewKey],
) -> Vec<Vec<DecryptedNote>> {
    let first_position = block.first_note_position().unwrap_or(0);
    let notes: Vec<NoteToDecrypt<'_>> = block
        .transactions()
        .iter()
        .flat_map(|transaction| transaction.outputs())
        .enumerate()
        .map(|(index, output)| NoteToDecrypt {
            position: first_position + index as u64,
            encrypted_note: &output.encrypted_note,
        })
        .collect();
    if notes.is_empty() {
        return vec![Vec::new(); keys.len()];
    }

    keys.par_iter()
        .map(|key| decryptor.decrypt_notes_for_owner(&notes, key))
        .collect()
}

/// Maps the block-wide index of each output to the position of its transaction.
fn note_transaction_indices(block: &Block) -> Vec<usize> {
    block
        .transactions()
        .iter()
        .enumerate()
        .flat_map(|(position, transaction)| {
            std::iter::repeat(position).take(transaction.outputs().len())
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use reef_config::ChainType;

    use super::*;
    use crate::primitives::PendingWrite;
    use crate::testutils::{
        account_id, build_block, build_chain, encrypt_note, extend_chain, fork_chain,
        incoming_view_key, test_config, test_nullifier, transaction, MemoryWalletStore,
        MockBlockSource, TestDecryptor,
    };

    type TestScanner = Scanner<MockBlockSource, MemoryWalletStore, TestDecryptor>;

    fn init_logging() {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    }

    fn scanner(remote: Vec<Block>, accounts: &[u8]) -> TestScanner {
        scanner_with_config(test_config(), remote, accounts)
    }

    fn scanner_with_config(config: SyncConfig, remote: Vec<Block>, accounts: &[u8]) -> TestScanner {
        let ids: Vec<AccountId> = accounts.iter().map(|n| account_id(*n)).collect();
        let history = Arc::new(RecentHistoryCache::new(config.recent_block_retention));
        let source = Arc::new(MockBlockSource::new(ChainType::Testnet, remote));
        let walker = Arc::new(ChainWalker::new(source, history, &config));
        let queue = Arc::new(WriteQueue::new(
            ChainType::Testnet,
            Arc::new(MemoryWalletStore::with_accounts(&ids)),
        ));
        let mut scanner = Scanner::new(config, walker, queue, Arc::new(TestDecryptor::default()));
        for n in accounts {
            scanner.add_account(account_id(*n), incoming_view_key(*n));
        }
        scanner
    }

    /// Genesis, a block paying account 1, a block spending that note, then empty blocks.
    fn chain_with_payment() -> Vec<Block> {
        let ivk = incoming_view_key(1);
        let genesis = build_block(None, 1, vec![]);
        let payment = build_block(
            Some(&genesis),
            1,
            vec![
                transaction(0, vec![], vec![b"noise".to_vec()]),
                transaction(1, vec![], vec![encrypt_note(&ivk, b"payment")]),
            ],
        );
        let spend = build_block(
            Some(&payment),
            1,
            vec![transaction(0, vec![test_nullifier(&ivk, 1)], vec![])],
        );
        extend_chain(vec![genesis, payment, spend], 4, 1)
    }

    #[tokio::test]
    async fn received_and_spent_notes_are_stored() {
        let chain = chain_with_payment();
        let scanner = scanner(chain.clone(), &[1]);
        let account = account_id(1);

        let report = scanner.scan(&CancellationToken::new()).await.unwrap();
        assert_eq!(report.groups, 1);
        assert_eq!(report.updated, vec![account]);
        assert_eq!(scanner.queue().get_head(&account), Some(chain[6].head()));

        scanner.queue().flush().await.unwrap();
        let store = scanner.queue().store();
        let transactions = store.transactions(&account);
        assert_eq!(transactions.len(), 2);

        let (sequence, received) = &transactions[0];
        assert_eq!(*sequence, 2);
        assert_eq!(received.index(), 1);
        assert_eq!(received.decrypted_notes()[0].note, b"payment".to_vec());
        assert_eq!(
            received.decrypted_notes()[0].nullifier,
            Some(test_nullifier(&incoming_view_key(1), 1))
        );

        let (sequence, spent) = &transactions[1];
        assert_eq!(*sequence, 3);
        assert_eq!(
            spent.spent_nullifiers(),
            &vec![test_nullifier(&incoming_view_key(1), 1)]
        );
        assert_eq!(store.head(&account), Some(chain[6].head()));
    }

    #[tokio::test]
    async fn notes_spent_in_the_block_they_arrive_in_are_detected() {
        let ivk = incoming_view_key(1);
        let genesis = build_block(None, 1, vec![]);
        let block = build_block(
            Some(&genesis),
            1,
            vec![
                transaction(0, vec![], vec![encrypt_note(&ivk, b"change")]),
                transaction(1, vec![test_nullifier(&ivk, 0)], vec![]),
            ],
        );
        let scanner = scanner(vec![genesis, block], &[1]);

        scanner.scan(&CancellationToken::new()).await.unwrap();
        scanner.queue().flush().await.unwrap();

        let transactions = scanner.queue().store().transactions(&account_id(1));
        assert_eq!(transactions.len(), 2);
        assert_eq!(transactions[1].1.spent_nullifiers().len(), 1);
    }

    #[tokio::test]
    async fn other_accounts_do_not_receive_foreign_notes() {
        let chain = chain_with_payment();
        let scanner = scanner(chain.clone(), &[1, 2]);

        let report = scanner.scan(&CancellationToken::new()).await.unwrap();
        assert_eq!(report.groups, 1);
        scanner.queue().flush().await.unwrap();

        let store = scanner.queue().store();
        assert_eq!(store.transactions(&account_id(1)).len(), 2);
        // neither the payment nor its spend belongs to account 2
        assert!(store.transactions(&account_id(2)).is_empty());
        assert_eq!(store.head(&account_id(2)), Some(chain[6].head()));
        // one decryption per key and block with outputs
        assert_eq!(scanner.decryptor.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn accounts_are_grouped_by_head() {
        let chain = build_chain(12, 1);
        let scanner = scanner(chain.clone(), &[1, 2, 3]);
        scanner.queue().set_head(account_id(2), Some(chain[4].head()));
        scanner.queue().set_head(account_id(3), Some(chain[4].head()));

        let report = scanner.scan(&CancellationToken::new()).await.unwrap();
        assert_eq!(report.groups, 2);
        assert_eq!(report.updated.len(), 3);
        for n in 1..=3 {
            assert_eq!(scanner.queue().get_head(&account_id(n)), Some(chain[11].head()));
        }

        let report = scanner.scan(&CancellationToken::new()).await.unwrap();
        assert_eq!(report.groups, 1);
        assert!(report.updated.is_empty());
    }

    #[tokio::test]
    async fn forks_are_reverted_then_followed() {
        let chain = build_chain(20, 1);
        let scanner = scanner(chain.clone(), &[1]);
        let account = account_id(1);
        scanner.scan(&CancellationToken::new()).await.unwrap();
        scanner.queue().flush().await.unwrap();

        let fork = fork_chain(&chain, 18, 5, 2);
        scanner.walker().source().reorg(fork.clone());
        let report = scanner.scan(&CancellationToken::new()).await.unwrap();
        assert_eq!(report.updated, vec![account]);
        scanner.queue().flush().await.unwrap();

        let removed: Vec<u64> = scanner
            .queue()
            .store()
            .writes()
            .iter()
            .filter_map(|write| match write {
                PendingWrite::Remove(remove) => Some(remove.head.sequence),
                PendingWrite::Add(_) => None,
            })
            .collect();
        assert_eq!(removed, vec![20, 19, 18]);
        assert_eq!(scanner.queue().store().head(&account), Some(fork[21].head()));
    }

    #[tokio::test]
    async fn forks_within_the_window_converge_for_every_group() {
        let chain = build_chain(30, 1);
        let mut scanner = scanner(chain.clone(), &[1]);
        scanner.scan(&CancellationToken::new()).await.unwrap();
        scanner.queue().flush().await.unwrap();

        // the new account syncs from genesis along the fork before account 1 reconciles
        scanner.add_account(account_id(2), incoming_view_key(2));
        let fork = fork_chain(&chain, 28, 5, 2);
        scanner.walker().source().reorg(fork.clone());
        let report = scanner.scan(&CancellationToken::new()).await.unwrap();
        assert_eq!(report.groups, 2);
        assert!(report.rescanned.is_empty());
        for n in 1..=2 {
            assert_eq!(scanner.queue().get_head(&account_id(n)), Some(fork[31].head()));
        }

        scanner.queue().flush().await.unwrap();
        let removed: Vec<u64> = scanner
            .queue()
            .store()
            .writes()
            .iter()
            .filter_map(|write| match write {
                PendingWrite::Remove(remove) => Some(remove.head.sequence),
                PendingWrite::Add(_) => None,
            })
            .collect();
        assert_eq!(removed, vec![30, 29, 28]);
    }

    #[tokio::test]
    async fn unresolvable_forks_rescan_from_genesis() {
        init_logging();
        let chain = build_chain(40, 1);
        let scanner = scanner(chain.clone(), &[1]);
        let account = account_id(1);
        scanner.scan(&CancellationToken::new()).await.unwrap();

        let fork = fork_chain(&chain, 25, 20, 2);
        scanner.walker().source().reorg(fork.clone());
        let report = scanner.scan(&CancellationToken::new()).await.unwrap();
        assert_eq!(report.rescanned, vec![account]);
        assert_eq!(scanner.queue().get_head(&account), None);

        let report = scanner.scan(&CancellationToken::new()).await.unwrap();
        assert_eq!(report.updated, vec![account]);
        assert_eq!(scanner.queue().get_head(&account), Some(fork[43].head()));

        scanner.queue().flush().await.unwrap();
        assert_eq!(scanner.queue().store().head(&account), Some(fork[43].head()));
    }

    #[tokio::test]
    async fn unresolvable_forks_fail_without_rescans() {
        let mut config = test_config();
        config.rescan_on_unresolvable_fork = false;
        let chain = build_chain(40, 1);
        let scanner = scanner_with_config(config, chain.clone(), &[1]);
        scanner.scan(&CancellationToken::new()).await.unwrap();

        scanner.walker().source().reorg(fork_chain(&chain, 25, 20, 2));
        let result = scanner.scan(&CancellationToken::new()).await;
        assert!(matches!(result, Err(SyncError::UnresolvableFork { .. })));
        assert_eq!(scanner.queue().get_head(&account_id(1)), Some(chain[39].head()));
    }

    #[tokio::test]
    async fn busy_walkers_are_reported() {
        let scanner = scanner(build_chain(5, 1), &[1]);
        let walker = scanner.walker().clone();
        let _walk = walker.try_walk().unwrap();

        let report = scanner.scan(&CancellationToken::new()).await.unwrap();
        assert_eq!(report.busy, vec![account_id(1)]);
        assert_eq!(scanner.queue().get_head(&account_id(1)), None);
    }

    #[tokio::test]
    async fn history_is_restored_across_restarts() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config();
        config.data_dir = Some(dir.path().to_path_buf());
        let chain = build_chain(15, 1);
        let source = Arc::new(MockBlockSource::new(ChainType::Testnet, chain.clone()));
        let store = Arc::new(MemoryWalletStore::with_accounts(&[account_id(1)]));

        let mut scanner = Scanner::load(
            config.clone(),
            source.clone(),
            store.clone(),
            Arc::new(TestDecryptor::default()),
        )
        .await
        .unwrap();
        scanner.add_account(account_id(1), incoming_view_key(1));
        scanner.scan(&CancellationToken::new()).await.unwrap();
        scanner.queue().flush().await.unwrap();

        let restored = Scanner::load(config, source, store, Arc::new(TestDecryptor::default()))
            .await
            .unwrap();
        assert_eq!(
            restored.queue().get_head(&account_id(1)),
            Some(chain[14].head())
        );
        assert_eq!(
            restored.walker().history().get_block(ChainType::Testnet, chain[14].head()),
            Some(chain[14].clone())
        );
    }

    #[tokio::test]
    async fn run_scans_until_cancelled() {
        init_logging();
        let mut config = test_config();
        config.flush_interval = Duration::from_millis(5);
        let chain = build_chain(10, 1);
        let scanner = Arc::new(scanner_with_config(config, chain.clone(), &[1]));
        let cancel = CancellationToken::new();

        let handle = tokio::spawn({
            let scanner = scanner.clone();
            let cancel = cancel.clone();
            async move { scanner.run(Duration::from_millis(5), cancel).await }
        });

        tokio::time::timeout(Duration::from_secs(5), async {
            while scanner.queue().store().head(&account_id(1)) != Some(chain[9].head()) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        cancel.cancel();
        handle.await.unwrap().unwrap();
        assert_eq!(scanner.queue().pending_len(), 0);
    }
}
