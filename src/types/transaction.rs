use ed25519_dalek::{PublicKey, Signature};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::crypto::{hash_bytes, verify_hex_signature};
use crate::errors::{ChainError, ChainResult};

use super::{Address, Amount, Hash};

/// Stem commitment material embedded in a transaction payload.
///
/// `hash_for_stem` is the hash the parent-chain relay contract expects as the
/// transaction leaf; `sign_string_for_stem` is the matching creator signature
/// served alongside account transaction queries.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct StemPayload {
    pub hash_for_stem: String,
    pub sign_string_for_stem: String,
    pub largest_pack_height: u64,
}

impl StemPayload {
    pub fn encode(&self) -> ChainResult<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn extract(payload: &[u8]) -> ChainResult<Self> {
        bincode::deserialize(payload)
            .map_err(|err| ChainError::Transaction(format!("invalid stem payload: {err}")))
    }

    pub fn hash_for_stem(&self) -> ChainResult<Hash> {
        super::hash_from_hex(&self.hash_for_stem)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Transaction {
    pub from: Address,
    pub to: Address,
    pub amount: Amount,
    pub account_nonce: u64,
    pub gas_price: u64,
    pub gas_limit: u64,
    pub timestamp: u64,
    pub payload: Vec<u8>,
}

impl Transaction {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        from: Address,
        to: Address,
        amount: Amount,
        account_nonce: u64,
        gas_price: u64,
        gas_limit: u64,
        timestamp: u64,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            from,
            to,
            amount,
            account_nonce,
            gas_price,
            gas_limit,
            timestamp,
            payload,
        }
    }

    pub fn hash(&self) -> Hash {
        let bytes = serde_json::to_vec(self).expect("serializing transaction for hashing");
        hash_bytes(&bytes)
    }

    pub fn canonical_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("serializing transaction")
    }

    pub fn stem_payload(&self) -> ChainResult<StemPayload> {
        StemPayload::extract(&self.payload)
    }

    /// Gas fee charged on top of the transfer amount.
    pub fn fee(&self) -> u64 {
        self.gas_price.saturating_mul(self.gas_limit)
    }
}

/// Encoded transaction summaries grouped under one account, the leaf
/// material of the recent-tx commitment.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AccountTxs {
    pub txs: Vec<Vec<u8>>,
}

/// Summary form `(from, to, amount, nonce, gas_price, gas_limit)` committed
/// by the recent-tx stem and served by account transaction queries.
pub fn tx_summary_bytes(tx: &Transaction) -> ChainResult<Vec<u8>> {
    Ok(bincode::serialize(&(
        &tx.from,
        &tx.to,
        &tx.amount,
        tx.account_nonce,
        tx.gas_price,
        tx.gas_limit,
    ))?)
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SignedTransaction {
    pub id: Uuid,
    pub payload: Transaction,
    pub signature: String,
    pub public_key: String,
}

impl SignedTransaction {
    pub fn new(payload: Transaction, signature: Signature, public_key: &PublicKey) -> Self {
        Self {
            id: Uuid::new_v4(),
            signature: hex::encode(signature.to_bytes()),
            payload,
            public_key: hex::encode(public_key.to_bytes()),
        }
    }

    /// The block reward transaction carries no signature; it is synthesized
    /// by the assembly task and always sits at transaction index 0.
    pub fn reward(coinbase: Address, reward: Amount, timestamp: u64) -> Self {
        let payload = Transaction::new(
            String::new(),
            coinbase,
            reward,
            0,
            0,
            0,
            timestamp,
            Vec::new(),
        );
        Self {
            id: Uuid::new_v4(),
            payload,
            signature: String::new(),
            public_key: String::new(),
        }
    }

    pub fn is_reward(&self) -> bool {
        self.signature.is_empty() && self.payload.from.is_empty()
    }

    pub fn hash(&self) -> Hash {
        self.payload.hash()
    }

    pub fn hash_hex(&self) -> String {
        hex::encode(self.hash())
    }

    /// Encoded byte weight counted against the block byte budget.
    pub fn size(&self) -> usize {
        bincode::serialized_size(self).map(|size| size as usize).unwrap_or(0)
    }

    pub fn verify(&self) -> ChainResult<()> {
        verify_hex_signature(
            &self.public_key,
            &self.signature,
            &self.payload.canonical_bytes(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::{Keypair, SecretKey, Signer};

    fn keypair() -> Keypair {
        let secret = SecretKey::from_bytes(&[7u8; 32]).expect("secret");
        let public = PublicKey::from(&secret);
        Keypair { secret, public }
    }

    #[test]
    fn stem_payload_round_trip() {
        let payload = StemPayload {
            hash_for_stem: "11".repeat(32),
            sign_string_for_stem: "22".repeat(32),
            largest_pack_height: 42,
        };
        let encoded = payload.encode().unwrap();
        assert_eq!(StemPayload::extract(&encoded).unwrap(), payload);
    }

    #[test]
    fn signed_transaction_verifies() {
        let keypair = keypair();
        let tx = Transaction::new(
            "ab".repeat(20),
            "cd".repeat(20),
            Amount::from_u64(5),
            1,
            1,
            21_000,
            1_700_000_000,
            Vec::new(),
        );
        let signature = keypair.sign(&tx.canonical_bytes());
        let signed = SignedTransaction::new(tx, signature, &keypair.public);
        signed.verify().unwrap();
        assert!(!signed.is_reward());
    }

    #[test]
    fn reward_transaction_is_marked() {
        let reward = SignedTransaction::reward("ef".repeat(20), Amount::from_u64(0), 1);
        assert!(reward.is_reward());
        assert!(reward.payload.stem_payload().is_err());
    }
}
