use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use ed25519_dalek::Keypair;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::time;
use tracing::{info, warn};

use crate::config::{GenesisAccount, NodeConfig};
use crate::crypto::NodeKey;
use crate::errors::{ChainError, ChainResult};
use crate::interfaces::{ConsensusEngine, ProposalVerifyError, VerifierSet};
use crate::miner::{Task, TaskContext};
use crate::pool::{MemoryDebtPool, MemoryTxPool};
use crate::proofs::ProofService;
use crate::state::StateDb;
use crate::storage::Storage;
use crate::types::{
    hash_to_hex, Account, Address, BftExtra, Block, BlockHeader, BlockMetadata, BlockSignature,
    ConsensusKind, Debt, SecondWitnessInfo, SignedTransaction, ZERO_HASH,
};

fn now_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[derive(Clone, Debug, Serialize)]
pub struct NodeStatus {
    pub height: u64,
    pub tip_hash: String,
    pub pending_transactions: usize,
    pub pending_debts: usize,
}

pub struct Node {
    inner: Arc<NodeInner>,
}

#[derive(Clone)]
pub struct NodeHandle {
    inner: Arc<NodeInner>,
}

struct NodeInner {
    config: NodeConfig,
    node_key: NodeKey,
    storage: Storage,
    state_db: StateDb,
    tx_pool: MemoryTxPool,
    debt_pool: MemoryDebtPool,
    verifiers: Vec<Address>,
    chain_tip: RwLock<BlockMetadata>,
    block_interval: Duration,
    miner_lock: Mutex<()>,
}

impl Node {
    pub fn new(config: NodeConfig) -> ChainResult<Self> {
        config.ensure_directories()?;
        let node_key = NodeKey::load_or_generate(&config.key_path)?;
        let storage = Storage::open(&config.data_dir.join("db"))?;
        let state_db = storage.state_db();

        let verifiers = if config.genesis.verifiers.is_empty() {
            vec![node_key.address().clone()]
        } else {
            config.genesis.verifiers.clone()
        };

        if storage.tip()?.is_none() {
            bootstrap_genesis(&config, &storage, &state_db, node_key.address(), &verifiers)?;
        }
        let chain_tip = storage
            .tip()?
            .ok_or_else(|| ChainError::Config("chain tip missing after bootstrap".into()))?;
        info!(
            height = chain_tip.height,
            tip = %chain_tip.hash,
            "node initialized"
        );

        let block_interval = Duration::from_millis(config.block_time_ms.max(1));
        let tx_pool = MemoryTxPool::new(config.mempool_limit);
        let debt_pool = MemoryDebtPool::new(config.mempool_limit);
        Ok(Self {
            inner: Arc::new(NodeInner {
                config,
                node_key,
                storage,
                state_db,
                tx_pool,
                debt_pool,
                verifiers,
                chain_tip: RwLock::new(chain_tip),
                block_interval,
                miner_lock: Mutex::new(()),
            }),
        })
    }

    pub fn handle(&self) -> NodeHandle {
        NodeHandle {
            inner: self.inner.clone(),
        }
    }

    /// Produces blocks on the configured interval until the task is dropped.
    pub async fn start(&self) -> ChainResult<()> {
        info!(
            interval_ms = self.inner.block_interval.as_millis() as u64,
            "starting block production"
        );
        loop {
            time::sleep(self.inner.block_interval).await;
            match self.inner.produce_block() {
                Ok(block) => info!(
                    height = block.header.height,
                    txs = block.transactions.len(),
                    "sealed block"
                ),
                Err(err) => warn!(%err, "block production failed"),
            }
        }
    }
}

fn bootstrap_genesis(
    config: &NodeConfig,
    storage: &Storage,
    state_db: &StateDb,
    address: &str,
    verifiers: &[Address],
) -> ChainResult<()> {
    let genesis_accounts = if config.genesis.accounts.is_empty() {
        vec![GenesisAccount {
            address: address.to_string(),
            balance: "1000000000".to_string(),
        }]
    } else {
        config.genesis.accounts.clone()
    };

    let mut state = state_db.empty_working_copy();
    for genesis_account in &genesis_accounts {
        state.set_account(Account::new(
            genesis_account.address.clone(),
            genesis_account.balance_value()?,
        ));
    }

    let mut batch = storage.new_batch();
    let state_root = state_db.commit(&state, &mut batch)?;

    let mut header = BlockHeader::new(
        "00".repeat(32),
        address.to_string(),
        0,
        state_root,
        now_timestamp(),
        ConsensusKind::Bft,
    );
    header.extra_data = BftExtra {
        verifiers: verifiers.to_vec(),
    }
    .encode()?;
    header.second_witness = SecondWitnessInfo {
        challenged_txs: Vec::new(),
        deposit_vers: Vec::new(),
        exit_vers: Vec::new(),
        account_count: 0,
        tx_hash_stem: hash_to_hex(&ZERO_HASH),
        state_hash_stem: hash_to_hex(&ZERO_HASH),
        recent_tx_hash_stem: hash_to_hex(&ZERO_HASH),
        block_sig: BlockSignature::default(),
    }
    .encode()?;

    let block = Block::new(header, Vec::new(), Vec::new(), Vec::new());
    storage.stage_block(&block, &mut batch)?;
    storage.commit_batch(batch)?;
    info!(hash = %block.hash, "wrote genesis block");
    Ok(())
}

impl NodeInner {
    fn produce_block(&self) -> ChainResult<Block> {
        // one producer at a time: the task owns the working state and the
        // staged index writes for the whole round
        let _guard = self.miner_lock.lock();
        let tip = self.chain_tip.read().clone();
        let parent = self
            .storage
            .read_block(tip.height)?
            .ok_or_else(|| ChainError::NotFound(format!("tip block at height {}", tip.height)))?;

        let mut header = BlockHeader::new(
            parent.hash.clone(),
            self.node_key.address().clone(),
            tip.height + 1,
            String::new(),
            now_timestamp(),
            ConsensusKind::Bft,
        );
        header.extra_data = BftExtra {
            verifiers: self.verifiers.clone(),
        }
        .encode()?;

        let ctx = TaskContext {
            tx_pool: &self.tx_pool,
            debt_pool: &self.debt_pool,
            storage: &self.storage,
            state_db: &self.state_db,
            genesis: &self.config.genesis,
            relay_interval: self.config.relay_interval,
        };
        let mut task = Task::new(header, self.node_key.address().clone(), None);
        let mut state = self.state_db.working_copy_from(&parent.header.state_root)?;
        let mut batch = self.storage.new_batch();
        task.apply_transactions_and_debts(&ctx, &parent.header, &mut state, self, &mut batch)?;

        let block = task.generate_block();
        self.storage.stage_block(&block, &mut batch)?;
        self.storage.commit_batch(batch)?;
        *self.chain_tip.write() = BlockMetadata::from(&block);
        Ok(block)
    }
}

impl ConsensusEngine for NodeInner {
    fn private_key(&self) -> &Keypair {
        self.node_key.keypair()
    }

    fn verify(&self, proposal: &Block) -> Result<(), ProposalVerifyError> {
        let now = now_timestamp();
        if proposal.header.timestamp > now {
            return Err(ProposalVerifyError::CreateTimeInFuture {
                wait: Duration::from_secs(proposal.header.timestamp - now),
            });
        }
        match self.storage.read_block_by_hash(&proposal.header.previous_hash) {
            Ok(Some(_)) => Ok(()),
            Ok(None) => Err(ProposalVerifyError::Invalid(format!(
                "unknown parent block {}",
                proposal.header.previous_hash
            ))),
            Err(err) => Err(ProposalVerifyError::Invalid(err.to_string())),
        }
    }

    fn proposer(&self, height: u64) -> Address {
        if self.verifiers.is_empty() {
            return self.node_key.address().clone();
        }
        self.verifiers[(height % self.verifiers.len() as u64) as usize].clone()
    }

    fn parent_verifiers(&self, proposal: &Block) -> VerifierSet {
        let roster = self
            .storage
            .read_block_by_hash(&proposal.header.previous_hash)
            .ok()
            .flatten()
            .and_then(|parent| BftExtra::extract(&parent.header).ok())
            .map(|extra| extra.verifiers)
            .unwrap_or_else(|| self.verifiers.clone());
        VerifierSet::new(roster)
    }

    fn has_proposal(&self, hash: &str) -> bool {
        matches!(self.storage.read_block_by_hash(hash), Ok(Some(_)))
    }
}

impl NodeHandle {
    pub fn address(&self) -> &str {
        self.inner.node_key.address()
    }

    pub fn status(&self) -> NodeStatus {
        let tip = self.inner.chain_tip.read().clone();
        NodeStatus {
            height: tip.height,
            tip_hash: tip.hash,
            pending_transactions: self.inner.tx_pool.len(),
            pending_debts: self.inner.debt_pool.len(),
        }
    }

    pub fn submit_transaction(&self, tx: SignedTransaction) -> ChainResult<String> {
        if tx.is_reward() {
            return Err(ChainError::Transaction(
                "reward transactions cannot be submitted".into(),
            ));
        }
        tx.verify()?;
        let hash = tx.hash_hex();
        if !self.inner.tx_pool.add(tx) {
            return Err(ChainError::Transaction(
                "mempool is full or already holds this transaction".into(),
            ));
        }
        Ok(hash)
    }

    pub fn submit_debt(&self, debt: Debt) -> ChainResult<String> {
        let hash = debt.hash.clone();
        if !self.inner.debt_pool.add(debt) {
            return Err(ChainError::Debt(
                "debt pool is full or already holds this debt".into(),
            ));
        }
        Ok(hash)
    }

    pub fn produce_block(&self) -> ChainResult<Block> {
        self.inner.produce_block()
    }

    pub fn latest_block(&self) -> ChainResult<Option<Block>> {
        let tip = self.inner.chain_tip.read().clone();
        self.inner.storage.read_block(tip.height)
    }

    pub fn get_block(&self, height: u64) -> ChainResult<Option<Block>> {
        self.inner.storage.read_block(height)
    }

    pub fn get_account(&self, address: &str) -> ChainResult<Option<Account>> {
        let tip = self.inner.chain_tip.read().clone();
        let block = self
            .inner
            .storage
            .read_block(tip.height)?
            .ok_or_else(|| ChainError::NotFound(format!("tip block at height {}", tip.height)))?;
        let snapshot = self.inner.state_db.snapshot(&block.header.state_root)?;
        Ok(snapshot.get_account(address).cloned())
    }

    pub fn proof_service(&self) -> ProofService {
        ProofService::new(
            self.inner.storage.clone(),
            self.inner.config.genesis.clone(),
            self.inner.config.relay_interval,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GenesisConfig;
    use crate::crypto::address_from_public_key;
    use crate::types::{Amount, StemPayload, Transaction};
    use ed25519_dalek::{PublicKey, SecretKey, Signer};
    use tempfile::tempdir;

    fn sender_keypair() -> Keypair {
        let secret = SecretKey::from_bytes(&[23u8; 32]).expect("secret");
        let public = PublicKey::from(&secret);
        Keypair { secret, public }
    }

    fn test_node(dir: &std::path::Path, relay_interval: u64) -> Node {
        let keypair = sender_keypair();
        let sender = address_from_public_key(&keypair.public);
        let config = NodeConfig {
            data_dir: dir.join("data"),
            key_path: dir.join("keys/node.toml"),
            relay_interval,
            genesis: GenesisConfig {
                accounts: vec![GenesisAccount {
                    address: sender,
                    balance: "1000000".to_string(),
                }],
                ..GenesisConfig::default()
            },
            ..NodeConfig::default()
        };
        Node::new(config).unwrap()
    }

    fn signed_transfer(
        keypair: &Keypair,
        to: Address,
        amount: u64,
        nonce: u64,
    ) -> SignedTransaction {
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
            now_timestamp().saturating_sub(1),
            stem_payload.encode().unwrap(),
        );
        let signature = keypair.sign(&tx.canonical_bytes());
        SignedTransaction::new(tx, signature, &keypair.public)
    }

    #[test]
    fn bootstrap_writes_a_genesis_block() {
        let dir = tempdir().unwrap();
        let node = test_node(dir.path(), 4);
        let handle = node.handle();

        let status = handle.status();
        assert_eq!(status.height, 0);

        let genesis = handle.get_block(0).unwrap().expect("genesis block");
        let witness = SecondWitnessInfo::extract(&genesis.header).unwrap();
        assert_eq!(witness.account_count, 0);

        let keypair = sender_keypair();
        let sender = address_from_public_key(&keypair.public);
        let account = handle.get_account(&sender).unwrap().expect("funded");
        assert_eq!(account.balance, Amount::from_u64(1_000_000));
    }

    #[test]
    fn produced_blocks_extend_the_chain() {
        let dir = tempdir().unwrap();
        let node = test_node(dir.path(), 4);
        let handle = node.handle();
        let keypair = sender_keypair();

        handle
            .submit_transaction(signed_transfer(&keypair, "bc".repeat(20), 50, 1))
            .unwrap();
        let block = handle.produce_block().unwrap();
        assert_eq!(block.header.height, 1);
        assert_eq!(block.transactions.len(), 2);
        assert!(block.transactions[0].is_reward());

        let witness = SecondWitnessInfo::extract(&block.header).unwrap();
        assert_eq!(witness.account_count, 2);

        let status = handle.status();
        assert_eq!(status.height, 1);
        assert_eq!(status.pending_transactions, 0);
    }

    #[test]
    fn reward_submission_is_refused() {
        let dir = tempdir().unwrap();
        let node = test_node(dir.path(), 4);
        let handle = node.handle();
        let reward = SignedTransaction::reward("bc".repeat(20), Amount::zero(), now_timestamp());
        assert!(handle.submit_transaction(reward).is_err());
    }

    #[test]
    fn restart_keeps_the_tip() {
        let dir = tempdir().unwrap();
        {
            let node = test_node(dir.path(), 4);
            node.handle().produce_block().unwrap();
        }
        let node = test_node(dir.path(), 4);
        assert_eq!(node.handle().status().height, 1);
    }
}
