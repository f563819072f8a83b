use serde::{Deserialize, Serialize};

use crate::crypto::hash_bytes;

use super::{Address, Amount, Hash, SignedTransaction};

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum ConsensusKind {
    Pow,
    Bft,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BlockHeader {
    pub previous_hash: String,
    pub creator: Address,
    pub height: u64,
    pub state_root: String,
    pub timestamp: u64,
    pub consensus: ConsensusKind,
    pub extra_data: Vec<u8>,
    pub second_witness: Vec<u8>,
}

impl BlockHeader {
    pub fn new(
        previous_hash: String,
        creator: Address,
        height: u64,
        state_root: String,
        timestamp: u64,
        consensus: ConsensusKind,
    ) -> Self {
        Self {
            previous_hash,
            creator,
            height,
            state_root,
            timestamp,
            consensus,
            extra_data: Vec::new(),
            second_witness: Vec::new(),
        }
    }

    pub fn canonical_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("serializing block header")
    }

    pub fn hash(&self) -> Hash {
        hash_bytes(&self.canonical_bytes())
    }
}

/// Per-transaction execution result.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Receipt {
    pub tx_hash: String,
    pub total_fee: u64,
}

/// Cross-shard settlement record applied against state without verification
/// on the BFT path; BFT blocks never carry debts.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Debt {
    pub hash: String,
    pub account: Address,
    pub amount: Amount,
    pub fee: u64,
}

impl Debt {
    pub fn size(&self) -> usize {
        bincode::serialized_size(self).map(|size| size as usize).unwrap_or(0)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Block {
    pub header: BlockHeader,
    pub transactions: Vec<SignedTransaction>,
    pub receipts: Vec<Receipt>,
    pub debts: Vec<Debt>,
    pub hash: String,
}

impl Block {
    pub fn new(
        header: BlockHeader,
        transactions: Vec<SignedTransaction>,
        receipts: Vec<Receipt>,
        debts: Vec<Debt>,
    ) -> Self {
        let hash = hex::encode(header.hash());
        Self {
            header,
            transactions,
            receipts,
            debts,
            hash,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BlockMetadata {
    pub height: u64,
    pub hash: String,
    pub timestamp: u64,
}

impl From<&Block> for BlockMetadata {
    fn from(block: &Block) -> Self {
        Self {
            height: block.header.height,
            hash: block.hash.clone(),
            timestamp: block.header.timestamp,
        }
    }
}
