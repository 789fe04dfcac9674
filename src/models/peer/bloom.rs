//! BIP0037 bloom filters, as loaded by SPV peers to limit the transactions
//! relayed to them.

use std::f64::consts::LN_2;

use serde::Deserialize;
use serde::Serialize;

use crate::models::blockchain::Block;
use crate::models::blockchain::BlockHeader;
use crate::models::blockchain::Hash;
use crate::models::blockchain::OutPoint;
use crate::models::blockchain::ScriptClass;
use crate::models::blockchain::Transaction;
use crate::models::peer::FilterLoadMessage;

/// Maximum number of hash functions a loaded filter may ask for.
pub const MAX_FILTER_LOAD_HASH_FUNCS: u32 = 50;

/// Maximum size in bytes of a loaded filter.
pub const MAX_FILTER_LOAD_FILTER_SIZE: usize = 36_000;

/// Maximum size in bytes of a single `filteradd` data element.
pub const MAX_FILTER_ADD_DATA_SIZE: usize = 520;

const LN2_SQUARED: f64 = LN_2 * LN_2;
const HASH_SEED_MULTIPLIER: u32 = 0xfba4_c795;

/// How a filter updates itself when an output script matches.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum BloomUpdateType {
    #[default]
    None,
    All,
    P2PubkeyOnly,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BloomFilter {
    data: Vec<u8>,
    hash_funcs: u32,
    tweak: u32,
    flags: BloomUpdateType,
}

impl BloomFilter {
    /// A filter sized for `elements` entries at the given false positive
    /// rate. The rate is clamped to `[1e-9, 1.0]`.
    pub fn new(elements: u32, tweak: u32, fprate: f64, flags: BloomUpdateType) -> Self {
        let fprate = fprate.clamp(1e-9, 1.0);
        let elements = elements.max(1);

        let bits = (-f64::from(elements) * fprate.ln() / LN2_SQUARED) as usize;
        let data_len = bits.min(MAX_FILTER_LOAD_FILTER_SIZE * 8) / 8;
        let hash_funcs = ((data_len * 8) as f64 / f64::from(elements) * LN_2) as u32;

        Self {
            data: vec![0u8; data_len],
            hash_funcs: hash_funcs.min(MAX_FILTER_LOAD_HASH_FUNCS),
            tweak,
            flags,
        }
    }

    pub fn from_load(message: &FilterLoadMessage) -> Self {
        Self {
            data: message.filter.clone(),
            hash_funcs: message.hash_funcs,
            tweak: message.tweak,
            flags: message.flags,
        }
    }

    pub fn to_load(&self) -> FilterLoadMessage {
        FilterLoadMessage {
            filter: self.data.clone(),
            hash_funcs: self.hash_funcs,
            tweak: self.tweak,
            flags: self.flags,
        }
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn hash_funcs(&self) -> u32 {
        self.hash_funcs
    }

    fn bit_index(&self, hash_num: u32, data: &[u8]) -> usize {
        let seed = hash_num
            .wrapping_mul(HASH_SEED_MULTIPLIER)
            .wrapping_add(self.tweak);
        let bit_count = (self.data.len() as u64) << 3;
        (u64::from(murmur_hash3(seed, data)) % bit_count) as usize
    }

    pub fn matches(&self, data: &[u8]) -> bool {
        if self.data.is_empty() {
            return false;
        }
        (0..self.hash_funcs).all(|hash_num| {
            let idx = self.bit_index(hash_num, data);
            self.data[idx >> 3] & (1 << (idx & 7)) != 0
        })
    }

    pub fn add(&mut self, data: &[u8]) {
        if self.data.is_empty() {
            return;
        }
        for hash_num in 0..self.hash_funcs {
            let idx = self.bit_index(hash_num, data);
            self.data[idx >> 3] |= 1 << (idx & 7);
        }
    }

    pub fn matches_outpoint(&self, outpoint: &OutPoint) -> bool {
        self.matches(&outpoint.filter_key())
    }

    pub fn add_outpoint(&mut self, outpoint: &OutPoint) {
        self.add(&outpoint.filter_key());
    }

    fn maybe_add_outpoint(&mut self, class: ScriptClass, outpoint: OutPoint) {
        match self.flags {
            BloomUpdateType::All => self.add_outpoint(&outpoint),
            BloomUpdateType::P2PubkeyOnly
                if matches!(class, ScriptClass::PubKey | ScriptClass::MultiSig) =>
            {
                self.add_outpoint(&outpoint)
            }
            _ => {}
        }
    }

    /// Whether the transaction is relevant to the filter's owner.
    ///
    /// Matches the txid, any output script data push, any spent outpoint or
    /// any input script data push. Matching outputs are added to the filter
    /// according to its update flags, so spends of them match later on.
    pub fn match_tx_and_update(&mut self, tx: &Transaction) -> bool {
        let mut matched = self.matches(tx.txid.as_bytes());

        for (index, output) in tx.outputs.iter().enumerate() {
            if output.script_pushes.iter().any(|push| self.matches(push)) {
                matched = true;
                let outpoint = OutPoint {
                    txid: tx.txid,
                    index: index as u32,
                };
                self.maybe_add_outpoint(output.class, outpoint);
            }
        }

        if matched {
            return true;
        }

        tx.inputs.iter().any(|input| {
            self.matches_outpoint(&input.previous_outpoint)
                || input.script_pushes.iter().any(|push| self.matches(push))
        })
    }
}

/// The filtered view of a block sent in answer to a filtered block request.
///
/// Carries the header, the total transaction count, the hashes of the
/// matched transactions and a bitmap over all transactions marking the
/// matches.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MerkleBlock {
    pub header: BlockHeader,
    pub total_transactions: u32,
    pub hashes: Vec<Hash>,
    pub flags: Vec<u8>,
}

impl MerkleBlock {
    /// Filter `block` through `filter`, updating the filter as transactions
    /// match. Returns the merkle block and the indices of the matched
    /// transactions within the block.
    pub fn new(block: &Block, filter: &mut BloomFilter) -> (Self, Vec<usize>) {
        let total = block.transactions.len();
        let mut flags = vec![0u8; total.div_ceil(8)];
        let mut hashes = vec![];
        let mut matched_indices = vec![];

        for (index, tx) in block.transactions.iter().enumerate() {
            if filter.match_tx_and_update(tx) {
                flags[index >> 3] |= 1 << (index & 7);
                hashes.push(tx.txid);
                matched_indices.push(index);
            }
        }

        let merkle_block = Self {
            header: block.header,
            total_transactions: total as u32,
            hashes,
            flags,
        };
        (merkle_block, matched_indices)
    }
}

/// 32-bit MurmurHash3 (x86 variant), as used by BIP0037.
pub fn murmur_hash3(seed: u32, data: &[u8]) -> u32 {
    const C1: u32 = 0xcc9e_2d51;
    const C2: u32 = 0x1b87_3593;

    let mut h1 = seed;
    let chunks = data.chunks_exact(4);
    let tail = chunks.remainder();

    for chunk in chunks {
        let mut k1 = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        k1 = k1.wrapping_mul(C1).rotate_left(15).wrapping_mul(C2);

        h1 ^= k1;
        h1 = h1.rotate_left(13).wrapping_mul(5).wrapping_add(0xe654_6b64);
    }

    if !tail.is_empty() {
        let mut k1 = 0u32;
        for (i, byte) in tail.iter().enumerate() {
            k1 ^= u32::from(*byte) << (8 * i);
        }
        k1 = k1.wrapping_mul(C1).rotate_left(15).wrapping_mul(C2);
        h1 ^= k1;
    }

    h1 ^= data.len() as u32;
    h1 ^= h1 >> 16;
    h1 = h1.wrapping_mul(0x85eb_ca6b);
    h1 ^= h1 >> 13;
    h1 = h1.wrapping_mul(0xc2b2_ae35);
    h1 ^= h1 >> 16;
    h1
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use proptest::prop_assert;
    use test_strategy::proptest;

    use super::*;
    use crate::models::blockchain::TxIn;
    use crate::models::blockchain::TxOut;

    fn hex(s: &str) -> Vec<u8> {
        (0..s.len())
            .step_by(2)
            .map(|i| u8::from_str_radix(&s[i..i + 2], 16).unwrap())
            .collect()
    }

    fn tx_with_txid(byte: u8) -> Transaction {
        Transaction {
            txid: Hash([byte; 32]),
            ..Default::default()
        }
    }

    #[test]
    fn murmur_hash3_reference_vectors() {
        let vectors: [(u32, u32, &str); 10] = [
            (0x0000_0000, 0x0000_0000, ""),
            (0x6a39_6f08, 0xfba4_c795, ""),
            (0x81f1_6f39, 0xffff_ffff, ""),
            (0x514e_28b7, 0x0000_0000, "00"),
            (0xea3f_0b17, 0xfba4_c795, "00"),
            (0xfd6c_f10d, 0x0000_0000, "ff"),
            (0x16c6_b7ab, 0x0000_0000, "0011"),
            (0x8eb5_1c3d, 0x0000_0000, "001122"),
            (0xb447_1bf8, 0x0000_0000, "00112233"),
            (0xe230_1fa8, 0x0000_0000, "0011223344"),
        ];

        for (expected, seed, data) in vectors {
            assert_eq!(expected, murmur_hash3(seed, &hex(data)), "seed {seed:#x} data {data}");
        }
    }

    #[test]
    fn filter_matches_reference_serialization() {
        let mut filter = BloomFilter::new(3, 0, 0.01, BloomUpdateType::All);
        filter.add(&hex("99108ad8ed9bb6274d3980bab5a85c048f0950c8"));
        assert!(filter.matches(&hex("99108ad8ed9bb6274d3980bab5a85c048f0950c8")));
        assert!(!filter.matches(&hex("19108ad8ed9bb6274d3980bab5a85c048f0950c8")));

        filter.add(&hex("b5a2c786d9ef4658287ced5914b37a1b4aa32eee"));
        filter.add(&hex("b9300670b4c5366e95b2699e8b18bc75e5f729c5"));

        assert_eq!(&[0x61, 0x4e, 0x9b], filter.data());
        assert_eq!(5, filter.hash_funcs());
    }

    #[test]
    fn empty_filter_matches_nothing() {
        let filter = BloomFilter::from_load(&FilterLoadMessage {
            filter: vec![],
            hash_funcs: 10,
            tweak: 0,
            flags: BloomUpdateType::None,
        });
        assert!(!filter.matches(b"anything"));
    }

    #[test]
    fn matching_output_adds_outpoint_with_update_all() {
        let mut filter = BloomFilter::new(10, 7, 0.0001, BloomUpdateType::All);
        let pubkey_hash = vec![0x42; 20];
        filter.add(&pubkey_hash);

        let funding = Transaction {
            txid: Hash([1; 32]),
            outputs: vec![
                TxOut::default(),
                TxOut {
                    value: 5000,
                    class: ScriptClass::PubKeyHash,
                    script_pushes: vec![pubkey_hash],
                },
            ],
            ..Default::default()
        };
        assert!(filter.match_tx_and_update(&funding));

        let spend = Transaction {
            txid: Hash([2; 32]),
            inputs: vec![TxIn {
                previous_outpoint: OutPoint {
                    txid: funding.txid,
                    index: 1,
                },
                script_pushes: vec![],
            }],
            ..Default::default()
        };
        assert!(filter.match_tx_and_update(&spend));
    }

    #[test]
    fn p2pubkey_only_skips_pubkey_hash_outputs() {
        let mut filter = BloomFilter::new(10, 0, 0.0001, BloomUpdateType::P2PubkeyOnly);
        let key = vec![0x99; 33];
        filter.add(&key);

        let funding = Transaction {
            txid: Hash([3; 32]),
            outputs: vec![TxOut {
                value: 1,
                class: ScriptClass::PubKeyHash,
                script_pushes: vec![key],
            }],
            ..Default::default()
        };
        assert!(filter.match_tx_and_update(&funding));
        assert!(!filter.matches_outpoint(&OutPoint {
            txid: funding.txid,
            index: 0
        }));
    }

    #[test]
    fn merkle_block_marks_matched_transactions() {
        let mut filter = BloomFilter::new(4, 0, 0.0001, BloomUpdateType::None);
        filter.add(&[5u8; 32]);

        let block = Block {
            hash: Hash([9; 32]),
            header: BlockHeader::default(),
            transactions: (0..10).map(tx_with_txid).collect(),
        };
        let (merkle_block, matched) = MerkleBlock::new(&block, &mut filter);

        assert_eq!(vec![5], matched);
        assert_eq!(10, merkle_block.total_transactions);
        assert_eq!(vec![Hash([5; 32])], merkle_block.hashes);
        assert_eq!(vec![0b0010_0000, 0], merkle_block.flags);
    }

    #[proptest]
    fn added_elements_always_match(
        #[strategy(proptest::collection::vec(proptest::collection::vec(proptest::prelude::any::<u8>(), 1..64), 1..20))]
        elements: Vec<Vec<u8>>,
        tweak: u32,
    ) {
        let mut filter = BloomFilter::new(elements.len() as u32, tweak, 0.001, BloomUpdateType::None);
        for element in &elements {
            filter.add(element);
        }
        for element in &elements {
            prop_assert!(filter.matches(element));
        }
    }
}
