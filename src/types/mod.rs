mod account;
mod block;
mod transaction;
mod witness;

pub use account::{Account, Amount};
pub use block::{Block, BlockHeader, BlockMetadata, ConsensusKind, Debt, Receipt};
pub use transaction::{tx_summary_bytes, AccountTxs, SignedTransaction, StemPayload, Transaction};
pub use witness::{
    BftExtra, BlockInfoForStem, BlockSignature, SecondWitnessInfo, BFT_EXTRA_VANITY,
};

use crate::errors::{ChainError, ChainResult};

pub type Address = String;

pub type Hash = [u8; 32];

/// Root of the empty leaf vector and the non-relay recent-tx stem.
pub const ZERO_HASH: Hash = [0u8; 32];

pub fn hash_to_hex(hash: &Hash) -> String {
    hex::encode(hash)
}

pub fn hash_from_hex(data: &str) -> ChainResult<Hash> {
    let bytes = hex::decode(data)
        .map_err(|err| ChainError::Config(format!("invalid hash encoding: {err}")))?;
    bytes
        .as_slice()
        .try_into()
        .map_err(|_| ChainError::Config("hash must be 32 bytes".into()))
}
