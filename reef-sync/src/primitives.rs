//! Module for primitive structs associated with the sync engine

use std::io::{self, Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use getset::{CopyGetters, Getters};
use serde::{Deserialize, Serialize};
use zcash_encoding::Vector;

/// Sequence of the first block of every chain.
pub const GENESIS_SEQUENCE: u64 = 1;

macro_rules! bytes32 {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
        pub struct $name(pub [u8; 32]);

        impl $name {
            pub fn from_bytes(bytes: [u8; 32]) -> Self {
                Self(bytes)
            }

            pub fn as_bytes(&self) -> &[u8; 32] {
                &self.0
            }

            pub fn read<R: Read>(mut reader: R) -> io::Result<Self> {
                let mut bytes = [0u8; 32];
                reader.read_exact(&mut bytes)?;
                Ok(Self(bytes))
            }

            pub fn write<W: Write>(&self, mut writer: W) -> io::Result<()> {
                writer.write_all(&self.0)
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(&hex::encode(self.0))
            }
        }

        impl std::fmt::Debug for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}({})", stringify!($name), self)
            }
        }

        impl std::str::FromStr for $name {
            type Err = hex::FromHexError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let mut bytes = [0u8; 32];
                hex::decode_to_slice(s, &mut bytes)?;
                Ok(Self(bytes))
            }
        }

        impl Serialize for $name {
            fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_str(&self.to_string())
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let s = String::deserialize(deserializer)?;
                s.parse().map_err(serde::de::Error::custom)
            }
        }
    };
}

bytes32!(
    /// Hash identifying a block
    BlockHash
);
bytes32!(
    /// Hash identifying a transaction
    TransactionHash
);
bytes32!(
    /// Marks a note as spent
    Nullifier
);
bytes32!(
    /// Identifies a wallet account
    AccountId
);
bytes32!(
    /// Identifies a custom asset
    AssetId
);
bytes32!(
    /// Key used to trial-decrypt notes sent to an account
    IncomingViewKey
);

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub(super) fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        hex::decode(s).map_err(serde::de::Error::custom)
    }
}

/// The position of an account on a chain: the most recently connected block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChainHead {
    pub hash: BlockHash,
    pub sequence: u64,
}

impl ChainHead {
    pub fn new(hash: BlockHash, sequence: u64) -> Self {
        Self { hash, sequence }
    }
}

impl std::fmt::Display for ChainHead {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.sequence, self.hash)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Spend {
    pub nullifier: Nullifier,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Output {
    #[serde(with = "hex_bytes")]
    pub encrypted_note: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Getters, CopyGetters)]
pub struct Transaction {
    #[getset(get_copy = "pub")]
    index: u32,
    #[getset(get_copy = "pub")]
    hash: TransactionHash,
    #[getset(get = "pub")]
    spends: Vec<Spend>,
    #[getset(get = "pub")]
    outputs: Vec<Output>,
}

impl Transaction {
    pub fn from_parts(
        index: u32,
        hash: TransactionHash,
        spends: Vec<Spend>,
        outputs: Vec<Output>,
    ) -> Self {
        Self {
            index,
            hash,
            spends,
            outputs,
        }
    }

    pub fn read<R: Read>(mut reader: R) -> io::Result<Self> {
        let index = reader.read_u32::<LittleEndian>()?;
        let hash = TransactionHash::read(&mut reader)?;
        let spends = Vector::read(&mut reader, |r| {
            Ok(Spend {
                nullifier: Nullifier::read(r)?,
            })
        })?;
        let outputs = Vector::read(&mut reader, |r| {
            Ok(Output {
                encrypted_note: Vector::read(r, |r| r.read_u8())?,
            })
        })?;

        Ok(Self {
            index,
            hash,
            spends,
            outputs,
        })
    }

    pub fn write<W: Write>(&self, mut writer: W) -> io::Result<()> {
        writer.write_u32::<LittleEndian>(self.index)?;
        self.hash.write(&mut writer)?;
        Vector::write(&mut writer, &self.spends, |w, spend| spend.nullifier.write(w))?;
        Vector::write(&mut writer, &self.outputs, |w, output| {
            Vector::write(w, &output.encrypted_note, |w, b| w.write_u8(*b))
        })
    }
}

/// A block as served by the remote source. Immutable once fetched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Getters, CopyGetters)]
#[serde(rename_all = "camelCase")]
pub struct Block {
    #[getset(get_copy = "pub")]
    sequence: u64,
    #[getset(get_copy = "pub")]
    hash: BlockHash,
    #[getset(get_copy = "pub")]
    previous_block_hash: BlockHash,
    #[getset(get_copy = "pub")]
    timestamp: i64,
    #[getset(get = "pub")]
    transactions: Vec<Transaction>,
    /// Size of the note commitment tree after this block has been connected
    #[getset(get_copy = "pub")]
    note_size: u64,
}

impl Block {
    pub fn serialized_version() -> u64 {
        1
    }

    pub fn from_parts(
        sequence: u64,
        hash: BlockHash,
        previous_block_hash: BlockHash,
        timestamp: i64,
        transactions: Vec<Transaction>,
        note_size: u64,
    ) -> Self {
        Self {
            sequence,
            hash,
            previous_block_hash,
            timestamp,
            transactions,
            note_size,
        }
    }

    pub fn head(&self) -> ChainHead {
        ChainHead::new(self.hash, self.sequence)
    }

    /// The head an account is left at once this block has been disconnected.
    /// `None` when this is the genesis block.
    pub fn parent_head(&self) -> Option<ChainHead> {
        (self.sequence > GENESIS_SEQUENCE)
            .then(|| ChainHead::new(self.previous_block_hash, self.sequence - 1))
    }

    pub fn output_count(&self) -> u64 {
        self.transactions
            .iter()
            .map(|tx| tx.outputs.len() as u64)
            .sum()
    }

    /// Position of the first output of this block in the note commitment tree, derived by
    /// subtracting the outputs of the block from its final tree size.
    pub fn first_note_position(&self) -> Option<u64> {
        self.note_size.checked_sub(self.output_count())
    }

    pub fn read<R: Read>(mut reader: R) -> io::Result<Self> {
        let version = reader.read_u64::<LittleEndian>()?;
        if version > Self::serialized_version() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "Can't read block of version {}, expected at most {}",
                    version,
                    Self::serialized_version()
                ),
            ));
        }

        let sequence = reader.read_u64::<LittleEndian>()?;
        let hash = BlockHash::read(&mut reader)?;
        let previous_block_hash = BlockHash::read(&mut reader)?;
        let timestamp = reader.read_i64::<LittleEndian>()?;
        let note_size = reader.read_u64::<LittleEndian>()?;
        let transactions = Vector::read(&mut reader, |r| Transaction::read(r))?;

        Ok(Self {
            sequence,
            hash,
            previous_block_hash,
            timestamp,
            transactions,
            note_size,
        })
    }

    pub fn write<W: Write>(&self, mut writer: W) -> io::Result<()> {
        writer.write_u64::<LittleEndian>(Self::serialized_version())?;
        writer.write_u64::<LittleEndian>(self.sequence)?;
        self.hash.write(&mut writer)?;
        self.previous_block_hash.write(&mut writer)?;
        writer.write_i64::<LittleEndian>(self.timestamp)?;
        writer.write_u64::<LittleEndian>(self.note_size)?;
        Vector::write(&mut writer, &self.transactions, |w, tx| tx.write(w))
    }

    pub fn to_bytes(&self) -> io::Result<Vec<u8>> {
        let mut buf = Vec::new();
        self.write(&mut buf)?;
        Ok(buf)
    }
}

/// Inclusive range of block sequences.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequenceRange {
    pub start: u64,
    pub end: u64,
}

impl SequenceRange {
    pub fn contains(&self, sequence: u64) -> bool {
        self.start <= sequence && sequence <= self.end
    }

    pub fn intersects(&self, start: u64, end: u64) -> bool {
        self.start <= end && start <= self.end
    }
}

/// Manifest entry describing an immutable archive of historical blocks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Chunk {
    /// Location of the gzip compressed, concatenated, encoded blocks
    pub blocks_file: String,
    /// Location of the `sequence,startByte,endByte` index into the decompressed blocks file
    pub byte_ranges_file: String,
    pub timestamp: i64,
    pub range: SequenceRange,
    pub finalized: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunksManifest {
    pub chunks: Vec<Chunk>,
    pub timestamp: i64,
}

/// Fee rates in the smallest denomination per kilobyte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeeRates {
    pub slow: u64,
    pub average: u64,
    pub fast: u64,
}

/// Asset metadata as served by the remote source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Asset {
    pub id: AssetId,
    pub name: String,
    pub owner: String,
    pub metadata: String,
    #[serde(default)]
    pub verified: bool,
}

/// Asset metadata together with the time it was fetched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredAsset {
    pub asset: Asset,
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

/// A note handed to the native decryption capability.
#[derive(Debug, Clone, Copy)]
pub struct NoteToDecrypt<'a> {
    /// Position of the note in the note commitment tree
    pub position: u64,
    pub encrypted_note: &'a [u8],
}

/// Result of a successful trial decryption.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecryptedNote {
    /// Index into the slice of notes passed to the decryptor
    pub index: usize,
    pub note: Vec<u8>,
    /// Nullifier of the note, when the key allows deriving it
    pub nullifier: Option<Nullifier>,
}

/// A transaction relevant to an account, staged for durable storage.
#[derive(Debug, Clone, PartialEq, Eq, Getters, CopyGetters)]
pub struct WalletTransaction {
    #[getset(get_copy = "pub")]
    hash: TransactionHash,
    #[getset(get_copy = "pub")]
    index: u32,
    #[getset(get = "pub")]
    decrypted_notes: Vec<DecryptedNote>,
    /// Nullifiers of the account's own notes spent by this transaction
    #[getset(get = "pub")]
    spent_nullifiers: Vec<Nullifier>,
}

impl WalletTransaction {
    pub fn from_parts(
        hash: TransactionHash,
        index: u32,
        decrypted_notes: Vec<DecryptedNote>,
        spent_nullifiers: Vec<Nullifier>,
    ) -> Self {
        Self {
            hash,
            index,
            decrypted_notes,
            spent_nullifiers,
        }
    }

    /// Nullifiers of the notes received by the account in this transaction.
    pub fn note_nullifiers(&self) -> impl Iterator<Item = Nullifier> + '_ {
        self.decrypted_notes.iter().filter_map(|note| note.nullifier)
    }
}

/// Connect a block for an account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddBlock {
    pub account_id: AccountId,
    pub head: ChainHead,
    pub transactions: Vec<WalletTransaction>,
}

/// Disconnect a block from an account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoveBlock {
    pub account_id: AccountId,
    pub head: ChainHead,
    pub prev_hash: BlockHash,
}

impl RemoveBlock {
    /// Head of the account once this removal is applied.
    pub fn parent_head(&self) -> Option<ChainHead> {
        (self.head.sequence > GENESIS_SEQUENCE)
            .then(|| ChainHead::new(self.prev_hash, self.head.sequence - 1))
    }
}

/// A head update waiting in the write queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PendingWrite {
    Add(AddBlock),
    Remove(RemoveBlock),
}

impl PendingWrite {
    pub fn account_id(&self) -> AccountId {
        match self {
            PendingWrite::Add(add) => add.account_id,
            PendingWrite::Remove(remove) => remove.account_id,
        }
    }

    pub fn head(&self) -> ChainHead {
        match self {
            PendingWrite::Add(add) => add.head,
            PendingWrite::Remove(remove) => remove.head,
        }
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn arb_bytes32() -> impl Strategy<Value = [u8; 32]> {
        prop::array::uniform32(any::<u8>())
    }

    prop_compose! {
        fn arb_transaction()(
            index in any::<u32>(),
            hash in arb_bytes32(),
            nullifiers in prop::collection::vec(arb_bytes32(), 0..4),
            notes in prop::collection::vec(prop::collection::vec(any::<u8>(), 0..64), 0..4),
        ) -> Transaction {
            Transaction::from_parts(
                index,
                TransactionHash(hash),
                nullifiers.into_iter().map(|nf| Spend { nullifier: Nullifier(nf) }).collect(),
                notes.into_iter().map(|encrypted_note| Output { encrypted_note }).collect(),
            )
        }
    }

    prop_compose! {
        fn arb_block()(
            sequence in any::<u64>(),
            hash in arb_bytes32(),
            previous_block_hash in arb_bytes32(),
            timestamp in any::<i64>(),
            transactions in prop::collection::vec(arb_transaction(), 0..4),
            note_size in any::<u64>(),
        ) -> Block {
            Block::from_parts(
                sequence,
                BlockHash(hash),
                BlockHash(previous_block_hash),
                timestamp,
                transactions,
                note_size,
            )
        }
    }

    proptest! {
        #[test]
        fn block_encoding_is_identity_preserving(block in arb_block()) {
            let bytes = block.to_bytes().unwrap();
            let decoded = Block::read(&bytes[..]).unwrap();
            prop_assert_eq!(&decoded, &block);
            prop_assert_eq!(decoded.to_bytes().unwrap(), bytes);
        }
    }

    #[test]
    fn block_without_transactions_round_trips() {
        let block = Block::from_parts(7, BlockHash([7; 32]), BlockHash([6; 32]), -1, vec![], 0);
        let bytes = block.to_bytes().unwrap();
        assert_eq!(Block::read(&bytes[..]).unwrap(), block);
    }

    #[test]
    fn newer_block_versions_are_rejected() {
        let block = Block::from_parts(7, BlockHash([7; 32]), BlockHash([6; 32]), 0, vec![], 0);
        let mut bytes = block.to_bytes().unwrap();
        bytes[0] = 2;
        let err = Block::read(&bytes[..]).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn hashes_are_hex_encoded_in_json() {
        let head = ChainHead::new(BlockHash([0xab; 32]), 12);
        let json = serde_json::to_string(&head).unwrap();
        assert_eq!(json, format!("{{\"hash\":\"{}\",\"sequence\":12}}", "ab".repeat(32)));
        assert_eq!(serde_json::from_str::<ChainHead>(&json).unwrap(), head);
    }

    #[test]
    fn first_note_position_subtracts_block_outputs() {
        let tx = Transaction::from_parts(
            0,
            TransactionHash([1; 32]),
            vec![],
            vec![
                Output {
                    encrypted_note: vec![1],
                },
                Output {
                    encrypted_note: vec![2],
                },
            ],
        );
        let block = Block::from_parts(3, BlockHash([3; 32]), BlockHash([2; 32]), 0, vec![tx], 10);
        assert_eq!(block.first_note_position(), Some(8));
        assert_eq!(block.parent_head(), Some(ChainHead::new(BlockHash([2; 32]), 2)));

        let genesis = Block::from_parts(1, BlockHash([1; 32]), BlockHash([0; 32]), 0, vec![], 0);
        assert_eq!(genesis.parent_head(), None);
    }
}
