//! Chain payloads as seen by the peer server. Validation and storage live
//! elsewhere; these types only carry what is announced, relayed or matched
//! against bloom filters.

use std::fmt;
use std::time::SystemTime;

use serde::Deserialize;
use serde::Serialize;

pub const HASH_SIZE: usize = 32;

/// A 32-byte block or transaction hash.
#[derive(
    Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct Hash(pub [u8; HASH_SIZE]);

impl Hash {
    pub const ZERO: Hash = Hash([0u8; HASH_SIZE]);

    pub fn as_bytes(&self) -> &[u8; HASH_SIZE] {
        &self.0
    }
}

impl From<[u8; HASH_SIZE]> for Hash {
    fn from(bytes: [u8; HASH_SIZE]) -> Self {
        Self(bytes)
    }
}

/// Hex, most significant byte first, as block explorers print it.
impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.0.iter().rev() {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash({})", self)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    pub version: i32,
    pub prev_block: Hash,
    pub merkle_root: Hash,
    pub timestamp: u32,
    pub bits: u32,
    pub nonce: u32,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OutPoint {
    pub txid: Hash,
    pub index: u32,
}

impl OutPoint {
    /// The byte string bloom filters match outpoints by: txid followed by the
    /// little-endian output index.
    pub fn filter_key(&self) -> [u8; HASH_SIZE + 4] {
        let mut key = [0u8; HASH_SIZE + 4];
        key[..HASH_SIZE].copy_from_slice(&self.txid.0);
        key[HASH_SIZE..].copy_from_slice(&self.index.to_le_bytes());
        key
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxIn {
    pub previous_outpoint: OutPoint,

    /// Data pushes of the signature script.
    pub script_pushes: Vec<Vec<u8>>,
}

/// Standard script classes relevant to bloom filter updates.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScriptClass {
    #[default]
    NonStandard,
    PubKey,
    PubKeyHash,
    ScriptHash,
    MultiSig,
    WitnessPubKeyHash,
    WitnessScriptHash,
    NullData,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxOut {
    pub value: i64,
    pub class: ScriptClass,

    /// Data pushes of the public key script.
    pub script_pushes: Vec<Vec<u8>>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub txid: Hash,
    pub inputs: Vec<TxIn>,
    pub outputs: Vec<TxOut>,
    pub has_witness: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub hash: Hash,
    pub header: BlockHeader,
    pub transactions: Vec<Transaction>,
}

/// A mempool entry together with the data relay decisions need.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TxDesc {
    pub tx: Transaction,
    pub added: SystemTime,
    pub height: i32,
    pub fee: i64,
    pub fee_per_kb: i64,
}

/// Snapshot of the tip of the best chain.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BestState {
    pub hash: Hash,
    pub height: i32,
}
