//! Backward walk of a chain head to genesis

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::client::BlockSource;
use crate::error::SyncError;
use crate::primitives::ChainHead;
use crate::traits::BlockHandler;
use crate::walker::ChainWalker;

/// Result of [`ReverseChainWalker::unwind`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnwindOutcome {
    /// Blocks were removed down to genesis, or until cancelled.
    Unwound {
        /// Whether any block was removed
        removed: bool,
    },
    /// Another walk was running on the same walker. Nothing was done.
    Busy,
}

/// Disconnects every block of a chain head, highest first, for destructive rescans.
pub struct ReverseChainWalker<S> {
    walker: Arc<ChainWalker<S>>,
    head: Option<ChainHead>,
}

impl<S> ReverseChainWalker<S>
where
    S: BlockSource + 'static,
{
    pub fn new(walker: Arc<ChainWalker<S>>, head: Option<ChainHead>) -> Self {
        Self { walker, head }
    }

    /// The head left after the blocks removed so far, `None` once genesis is removed.
    pub fn head(&self) -> Option<ChainHead> {
        self.head
    }

    /// Removes blocks down to and including genesis.
    ///
    /// Blocks are read from recent history, falling back to the remote block at the same
    /// sequence when history no longer holds the head block. Cancellation stops the walk
    /// before the next removal.
    pub async fn unwind<H>(
        &mut self,
        handler: &mut H,
        cancel: &CancellationToken,
    ) -> Result<UnwindOutcome, SyncError>
    where
        H: BlockHandler + ?Sized,
    {
        let walker = self.walker.clone();
        let Some(walk) = walker.try_walk() else {
            return Ok(UnwindOutcome::Busy);
        };
        if let Some(head) = self.head {
            tracing::info!("Unwinding head {} to genesis.", head);
        }

        let mut removed = false;
        while let Some(head) = self.head {
            if cancel.is_cancelled() {
                tracing::info!("Unwind cancelled at {}.", head);
                break;
            }
            let block = match walker.history().get_block(walk.chain(), head) {
                Some(block) => block,
                None => {
                    let block = walk.remote_block(head.sequence).await?;
                    if block.hash() != head.hash {
                        tracing::debug!(
                            "Head {} is not on the remote chain, removing remote block {}.",
                            head,
                            block.head()
                        );
                    }
                    block
                }
            };

            handler.on_remove(&block).await.map_err(SyncError::Handler)?;
            self.head = block.parent_head();
            removed = true;
        }

        Ok(UnwindOutcome::Unwound { removed })
    }
}
