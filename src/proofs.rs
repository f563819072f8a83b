//! Read-side proof service.
//!
//! Every query re-derives its leaf vector with the same ordering rules the
//! assembly task used, so emitted proofs verify against the stems committed
//! in the second witness. Running a query twice returns identical bytes.

use serde::Serialize;

use crate::account_index::AccountIndexStore;
use crate::config::GenesisConfig;
use crate::errors::{ChainError, ChainResult};
use crate::merkle::merkle_proof;
use crate::miner::RecentTxAggregation;
use crate::state::{account_state_leaf, Snapshot, StateDb};
use crate::storage::Storage;
use crate::types::{
    tx_summary_bytes, Address, Amount, BftExtra, Block, BlockInfoForStem, Hash,
    SecondWitnessInfo,
};

#[derive(Clone, Debug, Serialize)]
pub struct TxMerkleInfo {
    pub index: u64,
    pub proof: Vec<String>,
}

#[derive(Clone, Debug, Serialize)]
pub struct BalanceMerkleInfo {
    pub account: Address,
    pub balance: Amount,
    pub nonce: u64,
    pub index: u64,
    pub proof: Vec<String>,
}

#[derive(Clone, Debug, Serialize)]
pub struct RecentTxMerkleInfo {
    pub account: Address,
    pub index: u64,
    pub proof: Vec<String>,
}

#[derive(Clone, Debug, Serialize)]
pub struct AccountTxInfo {
    pub account: Address,
    pub txs: Vec<String>,
    pub signatures: Vec<String>,
}

#[derive(Clone, Debug, Serialize)]
pub struct UpdatedAccountsInfo {
    pub addresses: Vec<Address>,
    pub balances: Vec<Amount>,
}

#[derive(Clone, Debug, Serialize)]
pub struct FeeInfo {
    pub fee: Amount,
    pub verifier_count: u64,
}

pub struct ProofService {
    storage: Storage,
    state_db: StateDb,
    genesis: GenesisConfig,
    relay_interval: u64,
}

impl ProofService {
    pub fn new(storage: Storage, genesis: GenesisConfig, relay_interval: u64) -> Self {
        let state_db = storage.state_db();
        Self {
            storage,
            state_db,
            genesis,
            relay_interval,
        }
    }

    pub fn relay_interval(&self) -> u64 {
        self.relay_interval
    }

    fn block_at(&self, height: u64) -> ChainResult<Block> {
        self.storage
            .read_block(height)?
            .ok_or_else(|| ChainError::NotFound(format!("block at height {height}")))
    }

    fn witness_at(&self, height: u64) -> ChainResult<SecondWitnessInfo> {
        SecondWitnessInfo::extract(&self.block_at(height)?.header)
    }

    fn snapshot_at(&self, height: u64) -> ChainResult<Snapshot> {
        let block = self.block_at(height)?;
        self.state_db.snapshot(&block.header.state_root)
    }

    pub fn block_creator(&self, height: u64) -> ChainResult<Address> {
        Ok(self.block_at(height)?.header.creator)
    }

    pub fn balance_tree_root(&self, height: u64) -> ChainResult<String> {
        Ok(self.witness_at(height)?.state_hash_stem)
    }

    pub fn tx_tree_root(&self, height: u64) -> ChainResult<String> {
        Ok(self.witness_at(height)?.tx_hash_stem)
    }

    pub fn recent_tx_tree_root(&self, height: u64) -> ChainResult<String> {
        Ok(self.witness_at(height)?.recent_tx_hash_stem)
    }

    pub fn block_signature(&self, height: u64) -> ChainResult<String> {
        Ok(hex::encode(self.witness_at(height)?.block_sig.sig))
    }

    /// Encoded block summary the relay contract consumes.
    pub fn block_info_for_stem(&self, height: u64) -> ChainResult<Vec<u8>> {
        let block = self.block_at(height)?;
        let witness = SecondWitnessInfo::extract(&block.header)?;
        BlockInfoForStem {
            creator: block.header.creator,
            height,
            tx_hash_stem: witness.tx_hash_stem,
            state_hash_stem: witness.state_hash_stem,
        }
        .encode()
    }

    /// Merkle index and proof of a transaction inside its block's tx stem.
    pub fn tx_merkle(&self, tx_hash: &str) -> ChainResult<TxMerkleInfo> {
        let entry = self
            .storage
            .tx_index(tx_hash)?
            .ok_or_else(|| ChainError::NotFound(format!("transaction {tx_hash}")))?;
        if entry.index == 0 {
            return Err(ChainError::NotFound(
                "reward transaction has no stem leaf".into(),
            ));
        }
        let block = self
            .storage
            .read_block_by_hash(&entry.block_hash)?
            .ok_or_else(|| ChainError::NotFound(format!("block {}", entry.block_hash)))?;

        let mut leaves = Vec::new();
        for tx in block.transactions.iter().skip(1) {
            leaves.push(tx.payload.stem_payload()?.hash_for_stem()?);
        }
        let index = entry.index - 1;
        Ok(TxMerkleInfo {
            index,
            proof: encode_proof(&merkle_proof(&leaves, index as usize)),
        })
    }

    /// Merkle index and proof of an account in the state stem at `height`.
    pub fn balance_merkle(&self, account: &str, height: u64) -> ChainResult<BalanceMerkleInfo> {
        let witness = self.witness_at(height)?;
        let snapshot = self.snapshot_at(height)?;
        let index_store = self.storage.account_index();
        let index = index_store
            .index_of(account)?
            .ok_or_else(|| ChainError::NotFound(format!("account {account} is not indexed")))?;
        if index >= witness.account_count {
            return Err(ChainError::NotFound(format!(
                "account {account} was not indexed at height {height}"
            )));
        }

        let leaves = self.state_leaves(&index_store, &snapshot, witness.account_count)?;
        Ok(BalanceMerkleInfo {
            account: account.to_string(),
            balance: snapshot.balance_of(account),
            nonce: snapshot.nonce_of(account),
            index,
            proof: encode_proof(&merkle_proof(&leaves, index as usize)),
        })
    }

    fn state_leaves(
        &self,
        index_store: &AccountIndexStore,
        snapshot: &Snapshot,
        account_count: u64,
    ) -> ChainResult<Vec<Hash>> {
        let mut leaves = Vec::with_capacity(account_count as usize);
        for index in 0..account_count {
            let address = index_store
                .address_at(index)?
                .ok_or_else(|| ChainError::NotFound(format!("account at index {index}")))?;
            leaves.push(account_state_leaf(
                &address,
                &snapshot.balance_of(&address),
                snapshot.nonce_of(&address),
            )?);
        }
        Ok(leaves)
    }

    /// Merkle index and proof of an account in the recent-tx stem committed
    /// at relay height `height`.
    pub fn recent_tx_merkle(&self, account: &str, height: u64) -> ChainResult<RecentTxMerkleInfo> {
        if height < self.relay_interval || height % self.relay_interval != 0 {
            return Err(ChainError::RelayConstraint(format!(
                "height {height} is not a relay block"
            )));
        }
        let aggregation = self.window_aggregation(height)?;
        let index = aggregation
            .index_of(account)
            .ok_or_else(|| ChainError::NotFound(format!("account {account} in relay window")))?;
        let leaves = aggregation.leaves()?;
        Ok(RecentTxMerkleInfo {
            account: account.to_string(),
            index: index as u64,
            proof: encode_proof(&merkle_proof(&leaves, index)),
        })
    }

    fn window_aggregation(&self, height: u64) -> ChainResult<RecentTxAggregation> {
        let start = height + 1 - self.relay_interval;
        let mut aggregation = RecentTxAggregation::default();
        for h in start..=height {
            let block = self.block_at(h)?;
            for tx in block.transactions.iter().skip(1) {
                aggregation.push_tx(&tx.payload)?;
            }
        }
        Ok(aggregation)
    }

    /// Summaries and stem signatures of every non-reward transaction
    /// touching `account` in `[start, end]`.
    pub fn account_tx(&self, account: &str, start: u64, end: u64) -> ChainResult<AccountTxInfo> {
        let mut txs = Vec::new();
        let mut signatures = Vec::new();
        for height in start..=end {
            let block = self.block_at(height)?;
            for tx in block.transactions.iter().skip(1) {
                if tx.payload.from == account || tx.payload.to == account {
                    txs.push(hex::encode(tx_summary_bytes(&tx.payload)?));
                    signatures.push(tx.payload.stem_payload()?.sign_string_for_stem);
                }
            }
        }
        Ok(AccountTxInfo {
            account: account.to_string(),
            txs,
            signatures,
        })
    }

    /// Accounts whose balance changed over the relay window ending at
    /// `height`, with their new balances.
    pub fn updated_accounts(&self, height: u64) -> ChainResult<UpdatedAccountsInfo> {
        if height < self.relay_interval {
            return Err(ChainError::RelayConstraint(format!(
                "height {height} is below the relay interval"
            )));
        }
        let witness = self.witness_at(height)?;
        let current = self.snapshot_at(height)?;
        let previous = self.snapshot_at(height - self.relay_interval)?;
        let index_store = self.storage.account_index();

        let mut addresses = Vec::new();
        let mut balances = Vec::new();
        for index in 0..witness.account_count {
            let address = index_store
                .address_at(index)?
                .ok_or_else(|| ChainError::NotFound(format!("account at index {index}")))?;
            let current_balance = current.balance_of(&address);
            if current_balance != previous.balance_of(&address) {
                addresses.push(address);
                balances.push(current_balance);
            }
        }
        Ok(UpdatedAccountsInfo {
            addresses,
            balances,
        })
    }

    /// Per-verifier share of the fee-account inflow over the relay window.
    pub fn fee(&self, height: u64) -> ChainResult<FeeInfo> {
        if height < self.relay_interval || height % self.relay_interval != 0 {
            return Err(ChainError::RelayConstraint(format!(
                "height {height} is not a relay block"
            )));
        }
        let current = self.snapshot_at(height)?;
        let previous = self.snapshot_at(height - self.relay_interval)?;
        let fee_account = &self.genesis.root_accounts.fee_account;
        let mut fee = current.balance_of(fee_account);
        fee.saturating_sub(&previous.balance_of(fee_account));

        let block = self.block_at(height)?;
        let extra = BftExtra::extract(&block.header)?;
        let verifier_count = extra.verifiers.len() as u64;
        if verifier_count == 0 {
            return Err(ChainError::Config(
                "bft extra data carries no verifiers".into(),
            ));
        }
        Ok(FeeInfo {
            fee: fee.div_floor(verifier_count),
            verifier_count,
        })
    }
}

fn encode_proof(proof: &[Hash]) -> Vec<String> {
    proof.iter().map(|node| hex::encode(node)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{GenesisAccount, NodeConfig};
    use crate::crypto::address_from_public_key;
    use crate::merkle::{merkle_root, verify_proof};
    use crate::node::{Node, NodeHandle};
    use crate::types::{hash_from_hex, StemPayload, Transaction};
    use ed25519_dalek::{Keypair, PublicKey, SecretKey, Signer};
    use tempfile::tempdir;

    fn sender_keypair() -> Keypair {
        let secret = SecretKey::from_bytes(&[29u8; 32]).expect("secret");
        let public = PublicKey::from(&secret);
        Keypair { secret, public }
    }

    fn signed_transfer(keypair: &Keypair, to: Address, amount: u64, nonce: u64) -> crate::types::SignedTransaction {
        let stem_payload = StemPayload {
            hash_for_stem: hex::encode(crate::crypto::hash_bytes(&nonce.to_be_bytes())),
            sign_string_for_stem: hex::encode([nonce as u8; 32]),
            largest_pack_height: 0,
        };
        let tx = Transaction::new(
            address_from_public_key(&keypair.public),
            to,
            Amount::from_u64(amount),
            nonce,
            0,
            0,
            1,
            stem_payload.encode().unwrap(),
        );
        let signature = keypair.sign(&tx.canonical_bytes());
        crate::types::SignedTransaction::new(tx, signature, &keypair.public)
    }

    struct Chain {
        handle: NodeHandle,
        service: ProofService,
        keypair: Keypair,
        _dir: tempfile::TempDir,
    }

    /// Two blocks on a relay interval of 2: height 1 transfers 50 to `bob`,
    /// height 2 (a relay block) transfers another 25.
    fn relay_chain() -> Chain {
        let dir = tempdir().unwrap();
        let keypair = sender_keypair();
        let sender = address_from_public_key(&keypair.public);
        let config = NodeConfig {
            data_dir: dir.path().join("data"),
            key_path: dir.path().join("keys/node.toml"),
            relay_interval: 2,
            genesis: GenesisConfig {
                accounts: vec![GenesisAccount {
                    address: sender,
                    balance: "1000000".to_string(),
                }],
                ..GenesisConfig::default()
            },
            ..NodeConfig::default()
        };
        let node = Node::new(config).unwrap();
        let handle = node.handle();

        handle
            .submit_transaction(signed_transfer(&keypair, bob(), 50, 1))
            .unwrap();
        handle.produce_block().unwrap();
        handle
            .submit_transaction(signed_transfer(&keypair, bob(), 25, 2))
            .unwrap();
        handle.produce_block().unwrap();

        let service = handle.proof_service();
        Chain {
            handle,
            service,
            keypair,
            _dir: dir,
        }
    }

    fn bob() -> Address {
        "bc".repeat(20)
    }

    #[test]
    fn balance_proof_verifies_against_the_state_stem() {
        let chain = relay_chain();
        let alice = address_from_public_key(&chain.keypair.public);

        let info = chain.service.balance_merkle(&bob(), 2).unwrap();
        assert_eq!(info.index, 1);
        assert_eq!(info.balance, Amount::from_u64(75));
        assert_eq!(info.nonce, 0);

        let root = hash_from_hex(&chain.service.balance_tree_root(2).unwrap()).unwrap();
        let leaf = account_state_leaf(&bob(), &info.balance, info.nonce).unwrap();
        let proof: Vec<Hash> = info
            .proof
            .iter()
            .map(|node| hash_from_hex(node).unwrap())
            .collect();
        assert!(verify_proof(&leaf, info.index as usize, &proof, &root));

        // an altered leaf must not verify
        let altered = account_state_leaf(&bob(), &Amount::from_u64(76), info.nonce).unwrap();
        assert!(!verify_proof(&altered, info.index as usize, &proof, &root));

        let alice_info = chain.service.balance_merkle(&alice, 2).unwrap();
        assert_eq!(alice_info.index, 0);
        assert_eq!(alice_info.balance, Amount::from_u64(999_925));
        assert_eq!(alice_info.nonce, 2);
    }

    #[test]
    fn tx_proof_verifies_against_the_tx_stem() {
        let chain = relay_chain();
        let block = chain.handle.get_block(2).unwrap().unwrap();
        let tx = &block.transactions[1];

        let info = chain.service.tx_merkle(&tx.hash_hex()).unwrap();
        assert_eq!(info.index, 0);

        let root = hash_from_hex(&chain.service.tx_tree_root(2).unwrap()).unwrap();
        let leaf = tx.payload.stem_payload().unwrap().hash_for_stem().unwrap();
        let proof: Vec<Hash> = info
            .proof
            .iter()
            .map(|node| hash_from_hex(node).unwrap())
            .collect();
        assert!(verify_proof(&leaf, info.index as usize, &proof, &root));
    }

    #[test]
    fn reward_tx_has_no_merkle_leaf() {
        let chain = relay_chain();
        let block = chain.handle.get_block(1).unwrap().unwrap();
        let reward_hash = block.transactions[0].hash_hex();
        assert!(matches!(
            chain.service.tx_merkle(&reward_hash),
            Err(ChainError::NotFound(_))
        ));
    }

    #[test]
    fn recent_tx_proof_matches_the_committed_stem() {
        let chain = relay_chain();
        let alice = address_from_public_key(&chain.keypair.public);

        let info = chain.service.recent_tx_merkle(&alice, 2).unwrap();
        assert_eq!(info.index, 0);
        let bob_info = chain.service.recent_tx_merkle(&bob(), 2).unwrap();
        assert_eq!(bob_info.index, 1);

        let root = hash_from_hex(&chain.service.recent_tx_tree_root(2).unwrap()).unwrap();
        let aggregation = chain.service.window_aggregation(2).unwrap();
        let leaves = aggregation.leaves().unwrap();
        assert_eq!(merkle_root(&leaves), root);

        let proof: Vec<Hash> = info
            .proof
            .iter()
            .map(|node| hash_from_hex(node).unwrap())
            .collect();
        assert!(verify_proof(&leaves[0], 0, &proof, &root));
    }

    #[test]
    fn recent_tx_proof_for_absent_account_is_not_found() {
        let chain = relay_chain();
        assert!(matches!(
            chain.service.recent_tx_merkle(&"dd".repeat(20), 2),
            Err(ChainError::NotFound(_))
        ));
    }

    #[test]
    fn non_relay_heights_are_rejected() {
        let chain = relay_chain();
        assert!(matches!(
            chain.service.recent_tx_merkle(&bob(), 1),
            Err(ChainError::RelayConstraint(_))
        ));
        assert!(matches!(
            chain.service.fee(1),
            Err(ChainError::RelayConstraint(_))
        ));
        assert!(matches!(
            chain.service.updated_accounts(1),
            Err(ChainError::RelayConstraint(_))
        ));
    }

    #[test]
    fn updated_accounts_reports_balance_changes_over_the_window() {
        let chain = relay_chain();
        let alice = address_from_public_key(&chain.keypair.public);

        let info = chain.service.updated_accounts(2).unwrap();
        assert_eq!(info.addresses, vec![alice, bob()]);
        assert_eq!(
            info.balances,
            vec![Amount::from_u64(999_925), Amount::from_u64(75)]
        );
    }

    #[test]
    fn fee_splits_the_window_inflow_per_verifier() {
        let chain = relay_chain();
        let info = chain.service.fee(2).unwrap();
        assert_eq!(info.verifier_count, 1);
        assert_eq!(info.fee, Amount::zero());
    }

    #[test]
    fn account_tx_serves_summaries_and_stem_signatures() {
        let chain = relay_chain();
        let alice = address_from_public_key(&chain.keypair.public);

        let info = chain.service.account_tx(&alice, 1, 2).unwrap();
        assert_eq!(info.txs.len(), 2);
        assert_eq!(info.signatures.len(), 2);

        let block = chain.handle.get_block(1).unwrap().unwrap();
        let expected = hex::encode(tx_summary_bytes(&block.transactions[1].payload).unwrap());
        assert_eq!(info.txs[0], expected);
    }

    #[test]
    fn queries_are_idempotent() {
        let chain = relay_chain();
        let first = serde_json::to_vec(&chain.service.balance_merkle(&bob(), 2).unwrap()).unwrap();
        let second = serde_json::to_vec(&chain.service.balance_merkle(&bob(), 2).unwrap()).unwrap();
        assert_eq!(first, second);

        let first = chain.service.block_info_for_stem(2).unwrap();
        let second = chain.service.block_info_for_stem(2).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn block_info_for_stem_matches_the_witness() {
        let chain = relay_chain();
        let block = chain.handle.get_block(2).unwrap().unwrap();
        let witness = SecondWitnessInfo::extract(&block.header).unwrap();
        let expected = BlockInfoForStem {
            creator: block.header.creator.clone(),
            height: 2,
            tx_hash_stem: witness.tx_hash_stem,
            state_hash_stem: witness.state_hash_stem,
        }
        .encode()
        .unwrap();
        assert_eq!(chain.service.block_info_for_stem(2).unwrap(), expected);
    }
}
