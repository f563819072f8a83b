use ed25519_dalek::PublicKey;
use serde::{Deserialize, Serialize};

use crate::crypto::verify_sig_bytes;
use crate::errors::{ChainError, ChainResult};

use super::{Address, BlockHeader, SignedTransaction};

/// Fixed-width zero prefix reserved for consensus padding ahead of the
/// structured payloads in `extra_data` and `second_witness`.
pub const BFT_EXTRA_VANITY: usize = 32;

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct BlockSignature {
    pub sig: Vec<u8>,
}

/// Consensus-extra payload carried on every BFT block header.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SecondWitnessInfo {
    pub challenged_txs: Vec<SignedTransaction>,
    pub deposit_vers: Vec<Address>,
    pub exit_vers: Vec<Address>,
    pub account_count: u64,
    pub tx_hash_stem: String,
    pub state_hash_stem: String,
    pub recent_tx_hash_stem: String,
    pub block_sig: BlockSignature,
}

impl SecondWitnessInfo {
    /// Serializes the payload behind the vanity prefix.
    pub fn encode(&self) -> ChainResult<Vec<u8>> {
        let mut buf = vec![0u8; BFT_EXTRA_VANITY];
        buf.extend(bincode::serialize(self)?);
        Ok(buf)
    }

    pub fn extract(header: &BlockHeader) -> ChainResult<Self> {
        if header.second_witness.len() < BFT_EXTRA_VANITY {
            return Err(ChainError::InvalidHeaderExtra);
        }
        bincode::deserialize(&header.second_witness[BFT_EXTRA_VANITY..])
            .map_err(|err| ChainError::DecodeWitness(err.to_string()))
    }

    /// Checks the creator's signature over the block-info digest, the check
    /// a peer runs before appending an imported block.
    pub fn verify_block_sig(&self, header: &BlockHeader, public_key: &PublicKey) -> ChainResult<()> {
        let info = BlockInfoForStem {
            creator: header.creator.clone(),
            height: header.height,
            tx_hash_stem: self.tx_hash_stem.clone(),
            state_hash_stem: self.state_hash_stem.clone(),
        };
        verify_sig_bytes(public_key, &info.digest()?, &self.block_sig.sig)
    }
}

/// Block summary the parent-chain relay contract consumes; its digest is
/// what the block creator signs.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct BlockInfoForStem {
    pub creator: Address,
    pub height: u64,
    pub tx_hash_stem: String,
    pub state_hash_stem: String,
}

impl BlockInfoForStem {
    pub fn encode(&self) -> ChainResult<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn digest(&self) -> ChainResult<crate::types::Hash> {
        Ok(crate::crypto::hash_bytes(&self.encode()?))
    }
}

/// Verifier roster carried in the header's `extra_data`, behind the same
/// vanity prefix as the second witness.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct BftExtra {
    pub verifiers: Vec<Address>,
}

impl BftExtra {
    pub fn encode(&self) -> ChainResult<Vec<u8>> {
        let mut buf = vec![0u8; BFT_EXTRA_VANITY];
        buf.extend(bincode::serialize(self)?);
        Ok(buf)
    }

    pub fn extract(header: &BlockHeader) -> ChainResult<Self> {
        if header.extra_data.len() < BFT_EXTRA_VANITY {
            return Err(ChainError::InvalidHeaderExtra);
        }
        bincode::deserialize(&header.extra_data[BFT_EXTRA_VANITY..])
            .map_err(|err| ChainError::DecodeWitness(err.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{hash_to_hex, ConsensusKind, ZERO_HASH};

    fn header_with_witness(witness: Vec<u8>) -> BlockHeader {
        let mut header = BlockHeader::new(
            "00".repeat(32),
            "aa".repeat(20),
            7,
            "11".repeat(32),
            1_700_000_000,
            ConsensusKind::Bft,
        );
        header.second_witness = witness;
        header
    }

    fn sample_witness() -> SecondWitnessInfo {
        SecondWitnessInfo {
            challenged_txs: Vec::new(),
            deposit_vers: vec!["bb".repeat(20)],
            exit_vers: Vec::new(),
            account_count: 3,
            tx_hash_stem: "22".repeat(32),
            state_hash_stem: "33".repeat(32),
            recent_tx_hash_stem: hash_to_hex(&ZERO_HASH),
            block_sig: BlockSignature { sig: vec![1, 2, 3] },
        }
    }

    #[test]
    fn witness_round_trip() {
        let witness = sample_witness();
        let encoded = witness.encode().unwrap();
        assert!(encoded.len() > BFT_EXTRA_VANITY);
        assert!(encoded[..BFT_EXTRA_VANITY].iter().all(|byte| *byte == 0));

        let header = header_with_witness(encoded);
        let decoded = SecondWitnessInfo::extract(&header).unwrap();
        assert_eq!(decoded.account_count, witness.account_count);
        assert_eq!(decoded.deposit_vers, witness.deposit_vers);
        assert_eq!(decoded.tx_hash_stem, witness.tx_hash_stem);
        assert_eq!(decoded.block_sig, witness.block_sig);
    }

    #[test]
    fn short_witness_is_rejected() {
        let header = header_with_witness(vec![0u8; BFT_EXTRA_VANITY - 1]);
        assert!(matches!(
            SecondWitnessInfo::extract(&header),
            Err(ChainError::InvalidHeaderExtra)
        ));
    }

    #[test]
    fn garbage_payload_is_a_decode_error() {
        let mut bytes = vec![0u8; BFT_EXTRA_VANITY];
        bytes.extend_from_slice(&[0xff; 3]);
        let header = header_with_witness(bytes);
        assert!(matches!(
            SecondWitnessInfo::extract(&header),
            Err(ChainError::DecodeWitness(_))
        ));
    }

    #[test]
    fn bft_extra_round_trip() {
        let extra = BftExtra {
            verifiers: vec!["cc".repeat(20), "dd".repeat(20)],
        };
        let mut header = header_with_witness(Vec::new());
        header.extra_data = extra.encode().unwrap();
        assert_eq!(BftExtra::extract(&header).unwrap(), extra);
    }
}
