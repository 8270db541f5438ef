//! Cache of the most recent blocks of each network
//!
//! Only consulted to supply ancestor blocks while resolving forks and unwinding heads, when
//! the source no longer serves the blocks an account was connected to.

use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::Path;
use std::sync::{PoisonError, RwLock};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use reef_config::ChainType;
use zcash_encoding::Vector;

use crate::primitives::{Block, BlockHash, ChainHead};

/// Blocks are keyed by sequence and hash, so the blocks of competing chains are kept side by
/// side until they fall out of the retention window. Heads left on a chain that was reorganized
/// away can still find their ancestors after another head has followed the new chain.
#[derive(Debug)]
pub struct RecentHistoryCache {
    retention: u64,
    blocks: RwLock<HashMap<ChainType, BTreeMap<(u64, BlockHash), Block>>>,
}

impl RecentHistoryCache {
    pub fn serialized_version() -> u64 {
        1
    }

    /// Creates an empty cache keeping `retention` blocks behind the highest cached block.
    pub fn new(retention: u64) -> Self {
        Self {
            retention,
            blocks: RwLock::new(HashMap::new()),
        }
    }

    pub fn retention(&self) -> u64 {
        self.retention
    }

    /// Returns true when a block at `sequence` is recent enough to be cached while syncing
    /// towards `tip_sequence`.
    pub fn is_within_window(&self, sequence: u64, tip_sequence: u64) -> bool {
        sequence.saturating_add(self.retention) >= tip_sequence
    }

    /// Returns the cached block identified by `head`.
    pub fn get_block(&self, chain: ChainType, head: ChainHead) -> Option<Block> {
        self.blocks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&chain)
            .and_then(|blocks| blocks.get(&(head.sequence, head.hash)))
            .cloned()
    }

    /// Caches `block` and evicts blocks that fall outside of the retention window, measured from
    /// the highest cached sequence.
    pub fn put_block(&self, chain: ChainType, block: Block) {
        let mut networks = self.blocks.write().unwrap_or_else(PoisonError::into_inner);
        let blocks = networks.entry(chain).or_default();
        blocks.insert((block.sequence(), block.hash()), block);

        if let Some((&(highest, _), _)) = blocks.last_key_value() {
            let lowest_kept = highest.saturating_sub(self.retention);
            *blocks = blocks.split_off(&(lowest_kept, BlockHash::default()));
        }
    }

    pub fn len(&self, chain: ChainType) -> usize {
        self.blocks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&chain)
            .map_or(0, BTreeMap::len)
    }

    pub fn is_empty(&self, chain: ChainType) -> bool {
        self.len(chain) == 0
    }

    pub fn read<R: Read>(mut reader: R, retention: u64) -> io::Result<Self> {
        let version = reader.read_u64::<LittleEndian>()?;
        if version > Self::serialized_version() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "Can't read recent history of version {}, expected at most {}",
                    version,
                    Self::serialized_version()
                ),
            ));
        }

        let cache = Self::new(retention);
        let networks = Vector::read(&mut reader, |r| {
            let network_id = r.read_u8()?;
            let chain = ChainType::from_network_id(network_id).ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("Unknown network id {network_id}"),
                )
            })?;
            let blocks = Vector::read(r, |r| Block::read(r))?;
            Ok((chain, blocks))
        })?;
        for (chain, blocks) in networks {
            for block in blocks {
                cache.put_block(chain, block);
            }
        }

        Ok(cache)
    }

    pub fn write<W: Write>(&self, mut writer: W) -> io::Result<()> {
        let networks = self.blocks.read().unwrap_or_else(PoisonError::into_inner);
        let mut networks = networks
            .iter()
            .map(|(chain, blocks)| (*chain, blocks.values().collect::<Vec<_>>()))
            .collect::<Vec<_>>();
        networks.sort_by_key(|(chain, _)| *chain);

        writer.write_u64::<LittleEndian>(Self::serialized_version())?;
        Vector::write(&mut writer, &networks, |w, (chain, blocks)| {
            w.write_u8(chain.network_id())?;
            Vector::write(w, blocks, |w, block| block.write(w))
        })
    }

    /// Loads a snapshot written by [`Self::save_to_path`], starting empty if there is none.
    pub fn load_from_path(path: &Path, retention: u64) -> io::Result<Self> {
        match File::open(path) {
            Ok(file) => Self::read(BufReader::new(file), retention),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Self::new(retention)),
            Err(e) => Err(e),
        }
    }

    /// Writes a snapshot of the cache, replacing the previous one atomically.
    pub fn save_to_path(&self, path: &Path) -> io::Result<()> {
        let temp_path = path.with_extension("tmp");
        {
            let mut writer = BufWriter::new(File::create(&temp_path)?);
            self.write(&mut writer)?;
            writer.flush()?;
        }
        std::fs::rename(temp_path, path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutils::{build_chain, extend_chain, fork_chain};

    #[test]
    fn blocks_outside_of_the_window_are_evicted() {
        let cache = RecentHistoryCache::new(10);
        let chain = build_chain(30, 1);
        for block in &chain {
            cache.put_block(ChainType::Testnet, block.clone());
        }

        assert_eq!(cache.len(ChainType::Testnet), 11);
        assert!(cache.get_block(ChainType::Testnet, chain[18].head()).is_none());
        assert_eq!(
            cache.get_block(ChainType::Testnet, chain[19].head()),
            Some(chain[19].clone())
        );
        assert!(cache.is_empty(ChainType::Mainnet));
    }

    #[test]
    fn window_is_relative_to_the_tip() {
        let cache = RecentHistoryCache::new(100);
        assert!(cache.is_within_window(900, 1000));
        assert!(!cache.is_within_window(899, 1000));
        assert!(cache.is_within_window(1, 50));
    }

    #[test]
    fn competing_blocks_are_kept_side_by_side() {
        let cache = RecentHistoryCache::new(10);
        let main = build_chain(20, 1);
        let fork = fork_chain(&main, 18, 4, 2);
        for block in main.iter().chain(&fork[17..]) {
            cache.put_block(ChainType::Testnet, block.clone());
        }

        for block in &main[17..] {
            assert_eq!(cache.get_block(ChainType::Testnet, block.head()), Some(block.clone()));
        }
        for block in &fork[17..] {
            assert_eq!(cache.get_block(ChainType::Testnet, block.head()), Some(block.clone()));
        }

        // both branches age out once the fork tip moves the window past them
        let fork = extend_chain(fork, 12, 2);
        for block in &fork[21..] {
            cache.put_block(ChainType::Testnet, block.clone());
        }
        assert!(cache.get_block(ChainType::Testnet, main[19].head()).is_none());
        assert!(cache.get_block(ChainType::Testnet, fork[19].head()).is_none());
        assert!(cache.get_block(ChainType::Testnet, fork[23].head()).is_some());
    }

    #[test]
    fn snapshot_survives_a_restart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("recent-blocks.dat");

        let missing = RecentHistoryCache::load_from_path(&path, 10).unwrap();
        assert!(missing.is_empty(ChainType::Testnet));

        let cache = RecentHistoryCache::new(10);
        let blocks = build_chain(5, 1);
        let fork = fork_chain(&blocks, 4, 2, 2);
        for block in blocks.iter().chain(&fork[3..]) {
            cache.put_block(ChainType::Testnet, block.clone());
        }
        cache.put_block(ChainType::Mainnet, blocks[0].clone());
        cache.save_to_path(&path).unwrap();

        let loaded = RecentHistoryCache::load_from_path(&path, 10).unwrap();
        assert_eq!(loaded.len(ChainType::Testnet), 7);
        assert_eq!(
            loaded.get_block(ChainType::Testnet, blocks[2].head()),
            Some(blocks[2].clone())
        );
        assert_eq!(
            loaded.get_block(ChainType::Testnet, fork[3].head()),
            Some(fork[3].clone())
        );
        assert_eq!(
            loaded.get_block(ChainType::Mainnet, blocks[0].head()),
            Some(blocks[0].clone())
        );
    }
}
