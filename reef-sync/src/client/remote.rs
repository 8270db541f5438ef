//! [`BlockSource`] backed by a wallet server over HTTP

use async_trait::async_trait;
use reef_config::ChainType;
use reef_netutils::HttpConnector;
use serde::Deserialize;

use crate::primitives::{Asset, AssetId, Block, ChainHead, Chunk, ChunksManifest, FeeRates};

use super::{AssetSource, BlockSource, ChunkArchive, ClientError, FeeRateSource};

#[derive(Deserialize)]
struct BlockRangeResponse {
    blocks: Vec<Block>,
}

/// Fetches blocks, chunks, fee rates and assets from a wallet server.
///
/// Endpoints take the network as a `network` query parameter. Chunk files are fetched from
/// the locations given in the manifest, resolved against the server uri when relative.
#[derive(Clone, Debug)]
pub struct RemoteBlockSource {
    connector: HttpConnector,
}

impl RemoteBlockSource {
    pub fn new(connector: HttpConnector) -> Self {
        Self { connector }
    }

    pub fn connector(&self) -> &HttpConnector {
        &self.connector
    }
}

fn network(chain: ChainType) -> (&'static str, String) {
    ("network", chain.to_string())
}

#[async_trait]
impl BlockSource for RemoteBlockSource {
    async fn get_latest_tip(&self, chain: ChainType) -> Result<ChainHead, ClientError> {
        tracing::debug!("Fetching chain tip.");
        Ok(self
            .connector
            .get_json("latest-block", &[network(chain)])
            .await?)
    }

    async fn get_block_by_sequence(
        &self,
        chain: ChainType,
        sequence: u64,
    ) -> Result<Block, ClientError> {
        tracing::debug!("Fetching block. {}", sequence);
        let block: Block = self
            .connector
            .get_json(
                "block",
                &[network(chain), ("sequence", sequence.to_string())],
            )
            .await?;
        if block.sequence() != sequence {
            return Err(ClientError::UnexpectedResponse(format!(
                "requested block {sequence}, received block {}",
                block.sequence()
            )));
        }

        Ok(block)
    }

    async fn get_block_range(
        &self,
        chain: ChainType,
        start: u64,
        end: u64,
    ) -> Result<Vec<Block>, ClientError> {
        tracing::debug!("Fetching blocks. {}..={}", start, end);
        let response: BlockRangeResponse = self
            .connector
            .get_json(
                "blocks",
                &[
                    network(chain),
                    ("start", start.to_string()),
                    ("end", end.to_string()),
                ],
            )
            .await?;

        Ok(response.blocks)
    }

    async fn get_chunks_manifest(&self, chain: ChainType) -> Result<ChunksManifest, ClientError> {
        tracing::debug!("Fetching chunks manifest.");
        Ok(self.connector.get_json("chunks", &[network(chain)]).await?)
    }

    async fn fetch_chunk_archive(&self, chunk: &Chunk) -> Result<ChunkArchive, ClientError> {
        tracing::debug!(
            "Fetching chunk. {}..={}",
            chunk.range.start,
            chunk.range.end
        );
        let (blocks, byte_ranges) = futures::try_join!(
            self.connector.get_bytes(&chunk.blocks_file),
            self.connector.get_bytes(&chunk.byte_ranges_file),
        )?;
        let byte_ranges = String::from_utf8(byte_ranges.to_vec()).map_err(|e| {
            ClientError::UnexpectedResponse(format!("byte range index is not utf-8. {e}"))
        })?;

        Ok(ChunkArchive {
            chunk: chunk.clone(),
            blocks,
            byte_ranges,
        })
    }
}

#[async_trait]
impl FeeRateSource for RemoteBlockSource {
    async fn get_fee_rates(&self, chain: ChainType) -> Result<FeeRates, ClientError> {
        tracing::debug!("Fetching fee rates.");
        Ok(self
            .connector
            .get_json("fee-rates", &[network(chain)])
            .await?)
    }
}

#[async_trait]
impl AssetSource for RemoteBlockSource {
    async fn get_asset(&self, chain: ChainType, id: &AssetId) -> Result<Asset, ClientError> {
        tracing::debug!("Fetching asset. {}", id);
        Ok(self
            .connector
            .get_json("asset", &[network(chain), ("id", id.to_string())])
            .await?)
    }
}
