use crate::primitives::BlockHash;

/// Streamed blocks failing to extend the chain they are connected to.
#[derive(Debug, thiserror::Error)]
pub enum ContinuityError {
    #[error("Height discontinuity. Block with sequence {sequence} is not continuous with previous block sequence {previous_sequence}")]
    HeightDiscontinuity { sequence: u64, previous_sequence: u64 },
    #[error("Hash discontinuity. Block previous_block_hash {previous_block_hash} with sequence {sequence} does not match previous block hash {expected}")]
    HashDiscontinuity {
        sequence: u64,
        previous_block_hash: BlockHash,
        expected: BlockHash,
    },
}
