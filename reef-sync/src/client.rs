//! Module for handling all connections to the server

use async_trait::async_trait;
use reef_config::ChainType;
use reef_netutils::NetError;

use crate::primitives::{Asset, AssetId, Block, ChainHead, Chunk, ChunksManifest, FeeRates};

pub mod chunks;
pub mod remote;

pub use chunks::ChunkArchive;

/// Errors raised while fetching from a block source. They are never retried by the source.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("Transport error. {0}")]
    Net(#[from] NetError),
    #[error("Block {sequence} is not available from the source")]
    MissingBlock { sequence: u64 },
    #[error("Failed to decode block. {0}")]
    Decode(#[from] std::io::Error),
    #[error("Invalid byte range index at line {line}. {reason}")]
    ChunkIndex { line: usize, reason: String },
    #[error("Chunk decoding task failed. {0}")]
    ChunkTask(String),
    #[error("Unexpected response. {0}")]
    UnexpectedResponse(String),
}

/// A remote, authoritative source of blocks.
#[async_trait]
pub trait BlockSource: Send + Sync {
    /// Gets the head of the longest chain known to the source.
    async fn get_latest_tip(&self, chain: ChainType) -> Result<ChainHead, ClientError>;

    /// Gets the block at `sequence` on the source's current chain.
    async fn get_block_by_sequence(&self, chain: ChainType, sequence: u64)
        -> Result<Block, ClientError>;

    /// Gets the blocks from `start` to `end` inclusive, in ascending sequence order.
    async fn get_block_range(
        &self,
        chain: ChainType,
        start: u64,
        end: u64,
    ) -> Result<Vec<Block>, ClientError>;

    /// Gets the manifest of archived block chunks.
    async fn get_chunks_manifest(&self, chain: ChainType) -> Result<ChunksManifest, ClientError>;

    /// Downloads the blocks file and byte range index of a chunk.
    async fn fetch_chunk_archive(&self, chunk: &Chunk) -> Result<ChunkArchive, ClientError>;
}

/// Source of the current network fee rates.
#[async_trait]
pub trait FeeRateSource: Send + Sync {
    async fn get_fee_rates(&self, chain: ChainType) -> Result<FeeRates, ClientError>;
}

/// Source of asset metadata.
#[async_trait]
pub trait AssetSource: Send + Sync {
    async fn get_asset(&self, chain: ChainType, id: &AssetId) -> Result<Asset, ClientError>;
}

/// Post-processes responses of a [`BlockSource`]. Every method defaults to the identity.
///
/// Used to inject deterministic forks in tests.
pub trait BlockResponseTransformer: Send + Sync {
    fn transform_tip(&self, _chain: ChainType, tip: ChainHead) -> ChainHead {
        tip
    }

    fn transform_block(&self, _chain: ChainType, block: Block) -> Block {
        block
    }

    fn transform_block_range(&self, chain: ChainType, blocks: Vec<Block>) -> Vec<Block> {
        blocks
            .into_iter()
            .map(|block| self.transform_block(chain, block))
            .collect()
    }

    fn transform_chunks_manifest(
        &self,
        _chain: ChainType,
        manifest: ChunksManifest,
    ) -> ChunksManifest {
        manifest
    }

    fn transform_chunk_archive(&self, archive: ChunkArchive) -> ChunkArchive {
        archive
    }
}

/// Wraps a [`BlockSource`], passing every response through an ordered list of transformers.
pub struct TransformedSource<S> {
    inner: S,
    transformers: Vec<Box<dyn BlockResponseTransformer>>,
}

impl<S> TransformedSource<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            transformers: Vec::new(),
        }
    }

    /// Appends a transformer, applied after the ones already registered.
    pub fn with_transformer(mut self, transformer: impl BlockResponseTransformer + 'static) -> Self {
        self.transformers.push(Box::new(transformer));
        self
    }

    pub fn push_transformer(&mut self, transformer: Box<dyn BlockResponseTransformer>) {
        self.transformers.push(transformer);
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    fn apply<T>(&self, value: T, f: impl Fn(&dyn BlockResponseTransformer, T) -> T) -> T {
        self.transformers
            .iter()
            .fold(value, |value, transformer| f(transformer.as_ref(), value))
    }
}

#[async_trait]
impl<S: BlockSource> BlockSource for TransformedSource<S> {
    async fn get_latest_tip(&self, chain: ChainType) -> Result<ChainHead, ClientError> {
        let tip = self.inner.get_latest_tip(chain).await?;
        Ok(self.apply(tip, |t, tip| t.transform_tip(chain, tip)))
    }

    async fn get_block_by_sequence(
        &self,
        chain: ChainType,
        sequence: u64,
    ) -> Result<Block, ClientError> {
        let block = self.inner.get_block_by_sequence(chain, sequence).await?;
        Ok(self.apply(block, |t, block| t.transform_block(chain, block)))
    }

    async fn get_block_range(
        &self,
        chain: ChainType,
        start: u64,
        end: u64,
    ) -> Result<Vec<Block>, ClientError> {
        let blocks = self.inner.get_block_range(chain, start, end).await?;
        Ok(self.apply(blocks, |t, blocks| t.transform_block_range(chain, blocks)))
    }

    async fn get_chunks_manifest(&self, chain: ChainType) -> Result<ChunksManifest, ClientError> {
        let manifest = self.inner.get_chunks_manifest(chain).await?;
        Ok(self.apply(manifest, |t, manifest| {
            t.transform_chunks_manifest(chain, manifest)
        }))
    }

    async fn fetch_chunk_archive(&self, chunk: &Chunk) -> Result<ChunkArchive, ClientError> {
        let archive = self.inner.fetch_chunk_archive(chunk).await?;
        Ok(self.apply(archive, |t, archive| t.transform_chunk_archive(archive)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::primitives::BlockHash;
    use crate::testutils::{build_chain, MockBlockSource};

    struct BumpTip(u64);

    impl BlockResponseTransformer for BumpTip {
        fn transform_tip(&self, _chain: ChainType, tip: ChainHead) -> ChainHead {
            ChainHead::new(tip.hash, tip.sequence + self.0)
        }
    }

    struct ZeroTipHash;

    impl BlockResponseTransformer for ZeroTipHash {
        fn transform_tip(&self, _chain: ChainType, tip: ChainHead) -> ChainHead {
            ChainHead::new(BlockHash([0; 32]), tip.sequence * 2)
        }
    }

    #[tokio::test]
    async fn transformers_are_applied_in_order() {
        let source = MockBlockSource::new(ChainType::Testnet, build_chain(5, 1));
        let transformed = TransformedSource::new(source)
            .with_transformer(BumpTip(1))
            .with_transformer(ZeroTipHash);

        let tip = transformed.get_latest_tip(ChainType::Testnet).await.unwrap();
        assert_eq!(tip, ChainHead::new(BlockHash([0; 32]), 12));
    }

    #[tokio::test]
    async fn no_transformers_is_the_identity() {
        let chain = build_chain(5, 1);
        let transformed =
            TransformedSource::new(MockBlockSource::new(ChainType::Testnet, chain.clone()));

        let blocks = transformed
            .get_block_range(ChainType::Testnet, 2, 4)
            .await
            .unwrap();
        assert_eq!(blocks, chain[1..4].to_vec());
    }
}
