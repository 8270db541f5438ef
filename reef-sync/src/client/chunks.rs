//! Archived chunks of finalized blocks
//!
//! A chunk is made of two files: the gzip compressed concatenation of encoded blocks, and a
//! plain text index with one `sequence,startByte,endByte` line per block. Byte offsets point
//! into the decompressed blocks file and the end byte is inclusive.

use std::io::{Read, Write};
use std::ops::ControlFlow;

use bytes::Bytes;
use flate2::{read::GzDecoder, write::GzEncoder, Compression};
use tokio::sync::mpsc;

use crate::primitives::{Block, Chunk};

use super::ClientError;

/// The downloaded files of a [`Chunk`].
#[derive(Debug, Clone)]
pub struct ChunkArchive {
    pub chunk: Chunk,
    /// Compressed blocks file
    pub blocks: Bytes,
    /// Byte range index
    pub byte_ranges: String,
}

/// Location of one encoded block inside a decompressed blocks file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub sequence: u64,
    pub start: usize,
    pub end: usize,
}

/// Parses a byte range index, returning the ranges sorted by sequence.
pub fn parse_byte_ranges(index: &str) -> Result<Vec<ByteRange>, ClientError> {
    let mut ranges = index
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(line_index, line)| {
            let line_number = line_index + 1;
            let invalid = |reason: &str| ClientError::ChunkIndex {
                line: line_number,
                reason: reason.to_string(),
            };
            let mut fields = line.trim().split(',');
            let mut next_field = |name: &str| -> Result<u64, ClientError> {
                fields
                    .next()
                    .ok_or_else(|| invalid(&format!("missing {name}")))?
                    .trim()
                    .parse::<u64>()
                    .map_err(|e| invalid(&format!("bad {name}: {e}")))
            };
            let sequence = next_field("sequence")?;
            let start = next_field("startByte")?;
            let end = next_field("endByte")?;
            if end < start {
                return Err(invalid("endByte before startByte"));
            }

            Ok(ByteRange {
                sequence,
                start: start as usize,
                end: end as usize,
            })
        })
        .collect::<Result<Vec<_>, _>>()?;
    ranges.sort_by_key(|range| range.sequence);

    Ok(ranges)
}

fn decompress(compressed: &[u8]) -> Result<Vec<u8>, ClientError> {
    let mut decompressed = Vec::new();
    GzDecoder::new(compressed).read_to_end(&mut decompressed)?;
    Ok(decompressed)
}

/// Decodes the blocks of an archive, calling `on_block` for every block from `from_sequence`
/// onwards in ascending sequence order until it returns [`ControlFlow::Break`].
pub fn read_chunk_blocks<F>(
    archive: &ChunkArchive,
    from_sequence: u64,
    mut on_block: F,
) -> Result<(), ClientError>
where
    F: FnMut(Block) -> ControlFlow<()>,
{
    let ranges = parse_byte_ranges(&archive.byte_ranges)?;
    let data = decompress(&archive.blocks)?;

    for range in ranges
        .into_iter()
        .filter(|range| range.sequence >= from_sequence)
    {
        let bytes = data
            .get(range.start..=range.end)
            .ok_or_else(|| ClientError::ChunkIndex {
                line: 0,
                reason: format!(
                    "range {}..={} of block {} exceeds blocks file of {} bytes",
                    range.start,
                    range.end,
                    range.sequence,
                    data.len()
                ),
            })?;
        let block = Block::read(bytes)?;
        if block.sequence() != range.sequence {
            return Err(ClientError::UnexpectedResponse(format!(
                "index entry {} points at block {}",
                range.sequence,
                block.sequence()
            )));
        }
        if on_block(block).is_break() {
            break;
        }
    }

    Ok(())
}

/// Decodes an archive on a blocking thread, sending blocks through a bounded channel so
/// decompression runs ahead of the consumer. Dropping the receiver stops decoding.
pub fn stream_chunk_blocks(
    archive: ChunkArchive,
    from_sequence: u64,
    buffer: usize,
) -> mpsc::Receiver<Result<Block, ClientError>> {
    let (sender, receiver) = mpsc::channel(buffer.max(1));
    tokio::task::spawn_blocking(move || {
        let result = read_chunk_blocks(&archive, from_sequence, |block| {
            match sender.blocking_send(Ok(block)) {
                Ok(()) => ControlFlow::Continue(()),
                Err(_) => ControlFlow::Break(()),
            }
        });
        if let Err(e) = result {
            let _ = sender.blocking_send(Err(e));
        }
    });

    receiver
}

/// Builds the files of a chunk from consecutive blocks.
pub fn encode_chunk_archive(chunk: Chunk, blocks: &[Block]) -> std::io::Result<ChunkArchive> {
    let mut data = Vec::new();
    let mut byte_ranges = String::new();
    for block in blocks {
        let start = data.len();
        block.write(&mut data)?;
        byte_ranges.push_str(&format!(
            "{},{},{}\n",
            block.sequence(),
            start,
            data.len() - 1
        ));
    }

    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&data)?;

    Ok(ChunkArchive {
        chunk,
        blocks: Bytes::from(encoder.finish()?),
        byte_ranges,
    })
}
