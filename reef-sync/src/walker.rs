//! Reconciles a local chain head with the chain of a [`BlockSource`]
//!
//! Finds the point where a local head forked from the remote chain and streams remote blocks
//! forward, verifying that every block extends the one delivered before it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::future::OptionFuture;
use reef_config::{ChainType, SyncConfig};
use tokio_util::sync::CancellationToken;

use crate::cache::RequestCache;
use crate::client::chunks::stream_chunk_blocks;
use crate::client::{BlockSource, ClientError};
use crate::error::SyncError;
use crate::history::RecentHistoryCache;
use crate::primitives::{Block, BlockHash, ChainHead, Chunk, ChunksManifest, GENESIS_SEQUENCE};
use crate::traits::BlockHandler;

#[allow(missing_docs)]
pub mod error;

use error::ContinuityError;

/// Result of comparing a local head with the remote chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ForkPoint {
    /// The local head is on the remote chain.
    Aligned,
    /// The local head forked from the remote chain.
    Divergent {
        /// Local blocks to disconnect, highest sequence first
        blocks: Vec<Block>,
        /// Last block shared by both chains
        ancestor: ChainHead,
    },
    /// No common ancestor could be found in recent history.
    Unresolvable,
}

/// Progress of a forward stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamOutcome {
    /// Last delivered block, or the start head when nothing was delivered
    pub head: ChainHead,
    pub delivered: u64,
    pub cancelled: bool,
}

/// Walks the chain of one network of a block source.
///
/// Only one walk runs at a time: walks are performed through a [`WalkGuard`] obtained from
/// [`ChainWalker::try_walk`].
pub struct ChainWalker<S> {
    source: Arc<S>,
    history: Arc<RecentHistoryCache>,
    chain: ChainType,
    page_size: u64,
    manifests: RequestCache<ChainType, ChunksManifest, ClientError>,
    walking: AtomicBool,
}

impl<S> ChainWalker<S>
where
    S: BlockSource + 'static,
{
    pub fn new(source: Arc<S>, history: Arc<RecentHistoryCache>, config: &SyncConfig) -> Self {
        Self {
            source,
            history,
            chain: config.chain,
            page_size: config.block_page_size.max(1),
            manifests: RequestCache::new(config.manifest_ttl),
            walking: AtomicBool::new(false),
        }
    }

    pub fn source(&self) -> &Arc<S> {
        &self.source
    }

    pub fn history(&self) -> &Arc<RecentHistoryCache> {
        &self.history
    }

    pub fn chain(&self) -> ChainType {
        self.chain
    }

    /// Starts a walk, or returns `None` while another walk is running.
    pub fn try_walk(&self) -> Option<WalkGuard<'_, S>> {
        if self
            .walking
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            tracing::warn!("Chain walk already in progress on {}. Skipping.", self.chain);
            return None;
        }

        Some(WalkGuard { walker: self })
    }

    pub fn is_walking(&self) -> bool {
        self.walking.load(Ordering::Acquire)
    }

    async fn manifest(&self) -> Result<ChunksManifest, SyncError> {
        let source = self.source.clone();
        let chain = self.chain;
        Ok(self
            .manifests
            .get(chain, move || async move {
                source.get_chunks_manifest(chain).await
            })
            .await?)
    }
}

/// Exclusive access to a [`ChainWalker`]. The walker is released on drop.
pub struct WalkGuard<'a, S> {
    walker: &'a ChainWalker<S>,
}

impl<S> Drop for WalkGuard<'_, S> {
    fn drop(&mut self) {
        self.walker.walking.store(false, Ordering::Release);
    }
}

// tracks the last verified block of a stream
struct Cursor {
    head: ChainHead,
    tip_sequence: u64,
    delivered: u64,
}

impl<S> WalkGuard<'_, S>
where
    S: BlockSource + 'static,
{
    pub fn chain(&self) -> ChainType {
        self.walker.chain
    }

    pub async fn latest_tip(&self) -> Result<ChainHead, SyncError> {
        Ok(self.walker.source.get_latest_tip(self.walker.chain).await?)
    }

    /// Fetches a block of the remote chain.
    pub async fn remote_block(&self, sequence: u64) -> Result<Block, SyncError> {
        Ok(self
            .walker
            .source
            .get_block_by_sequence(self.walker.chain, sequence)
            .await?)
    }

    /// Fetches the genesis block and keeps it in recent history.
    pub async fn genesis(&self, tip_sequence: u64) -> Result<Block, SyncError> {
        let genesis = self.remote_block(GENESIS_SEQUENCE).await?;
        self.remember(&genesis, tip_sequence);
        Ok(genesis)
    }

    fn remember(&self, block: &Block, tip_sequence: u64) {
        let history = &self.walker.history;
        if history.is_within_window(block.sequence(), tip_sequence) {
            history.put_block(self.walker.chain, block.clone());
        }
    }

    /// Finds where `local` forked from the chain ending at the remote `tip`.
    ///
    /// Local blocks are read from recent history. Walking down from `local`, each local block
    /// is collected until its parent matches the remote block at the same sequence. Local
    /// blocks above the remote tip are collected without a remote comparison. When the tip
    /// itself turns out to be an ancestor of `local` the source is lagging behind and the
    /// head is reported aligned.
    pub async fn find_fork_point(
        &self,
        local: ChainHead,
        tip: ChainHead,
    ) -> Result<ForkPoint, SyncError> {
        if local.sequence <= tip.sequence
            && self.remote_hash(local.sequence, tip).await? == local.hash
        {
            return Ok(ForkPoint::Aligned);
        }

        let mut blocks = Vec::new();
        let mut current = local;
        loop {
            let Some(block) = self.walker.history.get_block(self.walker.chain, current) else {
                tracing::info!("Block {} is not in recent history.", current);
                return Ok(ForkPoint::Unresolvable);
            };
            let Some(parent) = block.parent_head() else {
                tracing::info!("Reached genesis without finding a common ancestor.");
                return Ok(ForkPoint::Unresolvable);
            };
            blocks.push(block);

            if parent.sequence <= tip.sequence
                && self.remote_hash(parent.sequence, tip).await? == parent.hash
            {
                if blocks[0].sequence() > tip.sequence && parent.sequence == tip.sequence {
                    tracing::debug!("Source tip {} is behind head {}.", tip, local);
                    return Ok(ForkPoint::Aligned);
                }
                tracing::info!(
                    "Head {} forked from ancestor {}. {} blocks to disconnect.",
                    local,
                    parent,
                    blocks.len()
                );
                return Ok(ForkPoint::Divergent {
                    blocks,
                    ancestor: parent,
                });
            }
            current = parent;
        }
    }

    async fn remote_hash(
        &self,
        sequence: u64,
        tip: ChainHead,
    ) -> Result<BlockHash, SyncError> {
        if sequence == tip.sequence {
            return Ok(tip.hash);
        }
        Ok(self.remote_block(sequence).await?.hash())
    }

    /// Streams the blocks after `start` up to `end` into `handler.on_add`.
    ///
    /// Finalized chunks behind `end` are read first, remaining blocks come from the live range
    /// endpoint in pages, the next page being fetched while the current one is delivered.
    /// Blocks are delivered in sequence order and only after they are verified to extend the
    /// previously delivered block. Blocks delivered before a failure are not rolled back.
    /// Cancellation is checked before each block.
    pub async fn stream_forward<H>(
        &self,
        start: ChainHead,
        end: ChainHead,
        handler: &mut H,
        cancel: &CancellationToken,
    ) -> Result<StreamOutcome, SyncError>
    where
        H: BlockHandler + ?Sized,
    {
        let mut cursor = Cursor {
            head: start,
            tip_sequence: end.sequence,
            delivered: 0,
        };
        if end.sequence <= start.sequence {
            return Ok(cursor.outcome(false));
        }
        tracing::debug!("Streaming blocks {}..={}.", start.sequence + 1, end.sequence);

        let chunks = self.chunks_to_stream(start.sequence + 1, end.sequence).await?;
        for chunk in chunks {
            let next = cursor.head.sequence + 1;
            if chunk.range.end < next {
                continue;
            }
            if chunk.range.start > next
                && self
                    .stream_live(&mut cursor, chunk.range.start - 1, handler, cancel)
                    .await?
            {
                return Ok(cursor.outcome(true));
            }
            if self.stream_chunk(&mut cursor, chunk, handler, cancel).await? {
                return Ok(cursor.outcome(true));
            }
        }

        let cancelled = self
            .stream_live(&mut cursor, end.sequence, handler, cancel)
            .await?;
        if !cancelled && cursor.head != end {
            tracing::debug!(
                "Stream ended at {} while the requested end was {}.",
                cursor.head,
                end
            );
        }

        Ok(cursor.outcome(cancelled))
    }

    // finalized chunks strictly behind `last`, intersecting `first..=last`, in sequence order
    async fn chunks_to_stream(&self, first: u64, last: u64) -> Result<Vec<Chunk>, SyncError> {
        let mut chunks: Vec<Chunk> = self
            .walker
            .manifest()
            .await?
            .chunks
            .into_iter()
            .filter(|chunk| {
                chunk.finalized && chunk.range.end < last && chunk.range.intersects(first, last)
            })
            .collect();
        chunks.sort_by_key(|chunk| chunk.range.start);

        Ok(chunks)
    }

    // returns true when cancelled
    async fn stream_chunk<H>(
        &self,
        cursor: &mut Cursor,
        chunk: Chunk,
        handler: &mut H,
        cancel: &CancellationToken,
    ) -> Result<bool, SyncError>
    where
        H: BlockHandler + ?Sized,
    {
        if cancel.is_cancelled() {
            return Ok(true);
        }
        tracing::debug!(
            "Streaming chunk {}..={}.",
            chunk.range.start,
            chunk.range.end
        );
        let last = chunk.range.end;
        let archive = self.walker.source.fetch_chunk_archive(&chunk).await?;
        let mut blocks =
            stream_chunk_blocks(archive, cursor.head.sequence + 1, self.walker.page_size as usize);

        while let Some(block) = blocks.recv().await {
            let block = block?;
            if block.sequence() > last {
                break;
            }
            if cancel.is_cancelled() {
                return Ok(true);
            }
            self.deliver(cursor, block, handler).await?;
            if cursor.head.sequence == last {
                break;
            }
        }
        if cursor.head.sequence < last {
            return Err(ClientError::MissingBlock {
                sequence: cursor.head.sequence + 1,
            }
            .into());
        }

        Ok(false)
    }

    // returns true when cancelled
    async fn stream_live<H>(
        &self,
        cursor: &mut Cursor,
        last: u64,
        handler: &mut H,
        cancel: &CancellationToken,
    ) -> Result<bool, SyncError>
    where
        H: BlockHandler + ?Sized,
    {
        let page_size = self.walker.page_size;
        let mut page_start = cursor.head.sequence + 1;
        if page_start > last {
            return Ok(false);
        }
        if cancel.is_cancelled() {
            return Ok(true);
        }
        let mut page = self.fetch_page(page_start, last).await?;

        loop {
            if cancel.is_cancelled() {
                return Ok(true);
            }
            let next_start = page_start + page_size;
            let prefetch: OptionFuture<_> = (next_start <= last)
                .then(|| self.fetch_page(next_start, last))
                .into();

            let (delivered, next_page) = tokio::join!(
                self.deliver_page(cursor, page, handler, cancel),
                prefetch
            );
            if delivered? {
                return Ok(true);
            }

            match next_page {
                Some(next_page) => {
                    page = next_page?;
                    page_start = next_start;
                }
                None => return Ok(false),
            }
        }
    }

    // one page of at most `page_size` blocks from `start`, bounded by `last`
    async fn fetch_page(&self, start: u64, last: u64) -> Result<Vec<Block>, SyncError> {
        let end = last.min(start + self.walker.page_size - 1);
        tracing::debug!("Fetching live blocks {}..={}.", start, end);
        let blocks = self
            .walker
            .source
            .get_block_range(self.walker.chain, start, end)
            .await?;
        let expected = (end - start + 1) as usize;
        if blocks.len() < expected {
            return Err(ClientError::MissingBlock {
                sequence: start + blocks.len() as u64,
            }
            .into());
        }
        if blocks.len() > expected {
            return Err(ClientError::UnexpectedResponse(format!(
                "requested blocks {start}..={end}, received {} blocks",
                blocks.len()
            ))
            .into());
        }

        Ok(blocks)
    }

    // returns true when cancelled
    async fn deliver_page<H>(
        &self,
        cursor: &mut Cursor,
        page: Vec<Block>,
        handler: &mut H,
        cancel: &CancellationToken,
    ) -> Result<bool, SyncError>
    where
        H: BlockHandler + ?Sized,
    {
        for block in page {
            if cancel.is_cancelled() {
                return Ok(true);
            }
            self.deliver(cursor, block, handler).await?;
        }

        Ok(false)
    }

    async fn deliver<H>(
        &self,
        cursor: &mut Cursor,
        block: Block,
        handler: &mut H,
    ) -> Result<(), SyncError>
    where
        H: BlockHandler + ?Sized,
    {
        check_continuity(&cursor.head, &block)?;
        self.remember(&block, cursor.tip_sequence);
        handler.on_add(&block).await.map_err(SyncError::Handler)?;
        cursor.head = block.head();
        cursor.delivered += 1;

        Ok(())
    }
}

impl Cursor {
    fn outcome(&self, cancelled: bool) -> StreamOutcome {
        StreamOutcome {
            head: self.head,
            delivered: self.delivered,
            cancelled,
        }
    }
}

/// Checks that `block` directly extends `previous`.
pub fn check_continuity(previous: &ChainHead, block: &Block) -> Result<(), ContinuityError> {
    if block.sequence() != previous.sequence + 1 {
        return Err(ContinuityError::HeightDiscontinuity {
            sequence: block.sequence(),
            previous_sequence: previous.sequence,
        });
    }
    if block.previous_block_hash() != previous.hash {
        return Err(ContinuityError::HashDiscontinuity {
            sequence: block.sequence(),
            previous_block_hash: block.previous_block_hash(),
            expected: previous.hash,
        });
    }

    Ok(())
}
