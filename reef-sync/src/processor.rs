//! Forward scanning of a single chain head

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::client::BlockSource;
use crate::error::SyncError;
use crate::primitives::{Block, ChainHead};
use crate::traits::{BlockHandler, HandlerError};
use crate::walker::{ChainWalker, ForkPoint, WalkGuard};

/// Result of [`ChainProcessor::update`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// The head was reconciled with the remote chain, or as far as it got before cancellation.
    Updated {
        /// Whether the head hash differs from the one the update started from
        hash_changed: bool,
    },
    /// Another walk was running on the same walker. Nothing was done.
    Busy,
}

/// Moves one chain head to the tip of the remote chain.
///
/// The head is only changed by connecting or disconnecting blocks through the handler passed
/// to [`ChainProcessor::update`], one block at a time and in order, so it always reflects the
/// last block the handler accepted.
pub struct ChainProcessor<S> {
    walker: Arc<ChainWalker<S>>,
    head: Option<ChainHead>,
}

impl<S> ChainProcessor<S>
where
    S: BlockSource + 'static,
{
    /// Creates a processor for `head`, `None` for a head that never synced.
    pub fn new(walker: Arc<ChainWalker<S>>, head: Option<ChainHead>) -> Self {
        Self { walker, head }
    }

    pub fn head(&self) -> Option<ChainHead> {
        self.head
    }

    pub fn walker(&self) -> &Arc<ChainWalker<S>> {
        &self.walker
    }

    /// Reconciles the head with the remote tip.
    ///
    /// A head that never synced starts at the genesis block. When the head forked from the
    /// remote chain the blocks down to the common ancestor are removed, highest first, then
    /// the remote blocks up to the tip are added. Cancellation ends the update at a block
    /// boundary without an error.
    pub async fn update<H>(
        &mut self,
        handler: &mut H,
        cancel: &CancellationToken,
    ) -> Result<UpdateOutcome, SyncError>
    where
        H: BlockHandler + ?Sized,
    {
        let walker = self.walker.clone();
        let Some(walk) = walker.try_walk() else {
            return Ok(UpdateOutcome::Busy);
        };
        let initial_hash = self.head.map(|head| head.hash);

        self.reconcile(&walk, handler, cancel).await?;

        Ok(UpdateOutcome::Updated {
            hash_changed: self.head.map(|head| head.hash) != initial_hash,
        })
    }

    async fn reconcile<H>(
        &mut self,
        walk: &WalkGuard<'_, S>,
        handler: &mut H,
        cancel: &CancellationToken,
    ) -> Result<(), SyncError>
    where
        H: BlockHandler + ?Sized,
    {
        let tip = walk.latest_tip().await?;

        let head = match self.head {
            Some(head) => head,
            None => {
                if cancel.is_cancelled() {
                    return Ok(());
                }
                tracing::info!("Connecting genesis block of {}.", walk.chain());
                let genesis = walk.genesis(tip.sequence).await?;
                handler.on_add(&genesis).await.map_err(SyncError::Handler)?;
                self.head = Some(genesis.head());
                genesis.head()
            }
        };

        if head == tip {
            tracing::debug!("Head {} is at the tip.", head);
            return Ok(());
        }

        match walk.find_fork_point(head, tip).await? {
            ForkPoint::Aligned => {}
            ForkPoint::Unresolvable => return Err(SyncError::UnresolvableFork { head }),
            ForkPoint::Divergent { blocks, ancestor } => {
                for block in blocks {
                    if cancel.is_cancelled() {
                        return Ok(());
                    }
                    handler.on_remove(&block).await.map_err(SyncError::Handler)?;
                    self.head = block.parent_head();
                }
                debug_assert_eq!(self.head, Some(ancestor));
            }
        }

        let Some(start) = self.head else {
            return Ok(());
        };
        tracing::info!("Updating head {} to tip {}.", start, tip);
        let mut tracker = HeadTracker {
            inner: handler,
            head: &mut self.head,
        };
        let outcome = walk.stream_forward(start, tip, &mut tracker, cancel).await?;
        tracing::info!(
            "Added {} blocks, head is {}{}.",
            outcome.delivered,
            outcome.head,
            if outcome.cancelled { " (cancelled)" } else { "" }
        );

        Ok(())
    }
}

// moves the head along with every block the inner handler accepts
struct HeadTracker<'a, H: ?Sized> {
    inner: &'a mut H,
    head: &'a mut Option<ChainHead>,
}

#[async_trait]
impl<'a, H> BlockHandler for HeadTracker<'a, H>
where
    H: BlockHandler + ?Sized,
{
    async fn on_add(&mut self, block: &Block) -> Result<(), HandlerError> {
        self.inner.on_add(block).await?;
        *self.head = Some(block.head());
        Ok(())
    }

    async fn on_remove(&mut self, block: &Block) -> Result<(), HandlerError> {
        self.inner.on_remove(block).await?;
        *self.head = block.parent_head();
        Ok(())
    }
}
