//! Block assembly.
//!
//! A [`Task`] exists for the duration of one mining round. It drains the
//! debt and transaction pools into a working state, commits the state into a
//! staged batch, computes the stem commitments, signs the block-info digest,
//! and freezes its outputs into a [`Block`].

use std::collections::HashMap;

use ed25519_dalek::Signer;
use rocksdb::WriteBatch;
use tracing::{info, warn};

use crate::account_index::StagedAccountIndex;
use crate::config::GenesisConfig;
use crate::errors::{ChainError, ChainResult};
use crate::interfaces::{ConsensusEngine, DebtVerifier};
use crate::merkle::merkle_root;
use crate::pool::{DebtPool, TxPool};
use crate::state::{account_state_leaf, StateDb, WorkingState};
use crate::storage::Storage;
use crate::types::{
    hash_to_hex, tx_summary_bytes, AccountTxs, Address, Amount, Block, BlockHeader,
    BlockInfoForStem, BlockSignature, ConsensusKind, Debt, Hash, Receipt, SecondWitnessInfo,
    SignedTransaction, Transaction, ZERO_HASH,
};

/// Byte budget shared by debts and transactions in one block.
pub const BLOCK_BYTE_LIMIT: usize = 1 << 20;

const BLOCKS_PER_ERA: u64 = 6_300_000;
const REWARDS_PER_ERA: [u64; 6] = [20, 16, 12, 8, 4, 2];

/// Era-based reward schedule for non-BFT blocks; BFT blocks pay zero.
pub fn get_reward(height: u64) -> Amount {
    let era = (height.saturating_sub(1) / BLOCKS_PER_ERA) as usize;
    REWARDS_PER_ERA
        .get(era)
        .map(|reward| Amount::from_u64(*reward))
        .unwrap_or_default()
}

/// Capabilities a task borrows from the node for one round.
pub struct TaskContext<'a> {
    pub tx_pool: &'a dyn TxPool,
    pub debt_pool: &'a dyn DebtPool,
    pub storage: &'a Storage,
    pub state_db: &'a StateDb,
    pub genesis: &'a GenesisConfig,
    pub relay_interval: u64,
}

pub struct Task<'a> {
    header: BlockHeader,
    txs: Vec<SignedTransaction>,
    receipts: Vec<Receipt>,
    debts: Vec<Debt>,
    coinbase: Address,
    debt_verifier: Option<&'a dyn DebtVerifier>,
    account_count: u64,
    challenged_txs: Vec<SignedTransaction>,
    deposit_vers: Vec<Address>,
    exit_vers: Vec<Address>,
}

impl<'a> Task<'a> {
    pub fn new(
        header: BlockHeader,
        coinbase: Address,
        debt_verifier: Option<&'a dyn DebtVerifier>,
    ) -> Self {
        Self {
            header,
            txs: Vec::new(),
            receipts: Vec::new(),
            debts: Vec::new(),
            coinbase,
            debt_verifier,
            account_count: 0,
            challenged_txs: Vec::new(),
            deposit_vers: Vec::new(),
            exit_vers: Vec::new(),
        }
    }

    /// Runs the whole assembly pipeline against `state`, staging every write
    /// into `batch`. Dropping the batch rolls the round back.
    pub fn apply_transactions_and_debts(
        &mut self,
        ctx: &TaskContext<'_>,
        parent: &BlockHeader,
        state: &mut WorkingState,
        engine: &dyn ConsensusEngine,
        batch: &mut WriteBatch,
    ) -> ChainResult<()> {
        // subchains do not carry debts on BFT blocks
        let budget = if self.header.consensus != ConsensusKind::Bft {
            self.choose_debts(ctx, state)
        } else {
            BLOCK_BYTE_LIMIT
        };

        let reward = self.handle_reward_tx(state);
        self.choose_transactions(ctx, state, budget);

        info!(
            height = self.header.height,
            reward = %reward,
            txs = self.txs.len(),
            debts = self.debts.len(),
            "assembled block body"
        );

        let root = ctx.state_db.commit(state, batch)?;
        self.header.state_root = root;

        if self.header.consensus == ConsensusKind::Bft {
            let parent_witness = SecondWitnessInfo::extract(parent)?;
            self.account_count = parent_witness.account_count;

            let index_store = ctx.storage.account_index();
            let mut staged = StagedAccountIndex::new(&index_store, self.account_count);
            let (tx_hash_stem, state_hash_stem) = self.stem_hashes(&mut staged, state)?;
            self.account_count = staged.account_count();
            staged.stage_into(batch)?;

            let recent_tx_hash_stem = self.recent_tx_hash_stem(ctx)?;

            let block_info = BlockInfoForStem {
                creator: self.header.creator.clone(),
                height: self.header.height,
                tx_hash_stem: hash_to_hex(&tx_hash_stem),
                state_hash_stem: hash_to_hex(&state_hash_stem),
            };
            let signature = engine.private_key().sign(&block_info.digest()?);

            info!(
                deposits = self.deposit_vers.len(),
                exits = self.exit_vers.len(),
                challenges = self.challenged_txs.len(),
                "prepared second witness"
            );
            let witness = SecondWitnessInfo {
                challenged_txs: self.challenged_txs.clone(),
                deposit_vers: self.deposit_vers.clone(),
                exit_vers: self.exit_vers.clone(),
                account_count: self.account_count,
                tx_hash_stem: block_info.tx_hash_stem,
                state_hash_stem: block_info.state_hash_stem,
                recent_tx_hash_stem: hash_to_hex(&recent_tx_hash_stem),
                block_sig: BlockSignature {
                    sig: signature.to_bytes().to_vec(),
                },
            };
            self.header.second_witness = witness.encode()?;
        }

        Ok(())
    }

    fn choose_debts(&mut self, ctx: &TaskContext<'_>, state: &mut WorkingState) -> usize {
        let mut size = BLOCK_BYTE_LIMIT;
        while size > 0 {
            let (debts, _) = ctx.debt_pool.get_processable(size);
            if debts.is_empty() {
                break;
            }
            for debt in debts {
                if let Some(verifier) = self.debt_verifier {
                    if let Err(err) = verifier.validate(&debt) {
                        warn!(hash = %debt.hash, "debt failed verification: {err}");
                        ctx.debt_pool.remove(&debt.hash);
                        continue;
                    }
                }
                if let Err(err) = state.apply_debt(&debt, &self.coinbase) {
                    warn!(hash = %debt.hash, "apply debt error: {err}");
                    ctx.debt_pool.remove(&debt.hash);
                    continue;
                }
                size = size.saturating_sub(debt.size());
                self.debts.push(debt);
            }
        }
        size
    }

    /// The reward transaction always sits at index 0 of the block.
    fn handle_reward_tx(&mut self, state: &mut WorkingState) -> Amount {
        let reward = if self.header.consensus == ConsensusKind::Bft {
            Amount::zero()
        } else {
            get_reward(self.header.height)
        };
        let reward_tx =
            SignedTransaction::reward(self.coinbase.clone(), reward.clone(), self.header.timestamp);
        let receipt = state.apply_reward(&reward_tx);
        self.txs.push(reward_tx);
        self.receipts.push(receipt);
        reward
    }

    fn choose_transactions(&mut self, ctx: &TaskContext<'_>, state: &mut WorkingState, budget: usize) {
        let mut size = budget;
        while size > 0 {
            let (txs, mut batch_size) = ctx.tx_pool.get_processable(size);
            if txs.is_empty() {
                break;
            }
            for tx in txs {
                if let Err(err) = state.validate_transaction(&tx) {
                    warn!(hash = %tx.hash_hex(), "failed to validate tx: {err}");
                    ctx.tx_pool.remove(&tx.hash_hex());
                    batch_size = batch_size.saturating_sub(tx.size());
                    continue;
                }
                let receipt = match state.apply_transaction(&tx, &self.coinbase) {
                    Ok(receipt) => receipt,
                    Err(err) => {
                        warn!(hash = %tx.hash_hex(), "failed to apply tx: {err}");
                        ctx.tx_pool.remove(&tx.hash_hex());
                        batch_size = batch_size.saturating_sub(tx.size());
                        continue;
                    }
                };

                if self.header.consensus == ConsensusKind::Bft {
                    let roots = &ctx.genesis.root_accounts;
                    // a successful challenge forces the outer round to rewind;
                    // record it and stop packing further transactions
                    if tx.payload.to == roots.challenge_account {
                        self.challenged_txs.push(tx);
                        return;
                    }
                    if tx.payload.to == roots.deposit_account {
                        self.deposit_vers.push(tx.payload.to.clone());
                    } else if tx.payload.to == roots.exit_account {
                        self.exit_vers.push(tx.payload.to.clone());
                    }
                }

                self.txs.push(tx);
                self.receipts.push(receipt);
            }
            size = size.saturating_sub(batch_size);
        }
    }

    /// Tx and state stems, allocating indices for newly seen accounts.
    fn stem_hashes(
        &self,
        staged: &mut StagedAccountIndex<'_>,
        state: &WorkingState,
    ) -> ChainResult<(Hash, Hash)> {
        let mut tx_leaves = Vec::new();
        for tx in self.txs.iter().skip(1) {
            let stem_payload = tx.payload.stem_payload()?;
            tx_leaves.push(stem_payload.hash_for_stem()?);
            for account in [&tx.payload.from, &tx.payload.to] {
                if !staged.has(account)? {
                    staged.put(account)?;
                }
            }
        }
        let tx_hash_stem = merkle_root(&tx_leaves);

        let mut state_leaves = Vec::with_capacity(staged.account_count() as usize);
        for index in 0..staged.account_count() {
            let address = staged
                .address_at(index)?
                .ok_or_else(|| ChainError::NotFound(format!("account at index {index}")))?;
            state_leaves.push(account_state_leaf(
                &address,
                &state.balance_of(&address),
                state.nonce_of(&address),
            )?);
        }
        let state_hash_stem = merkle_root(&state_leaves);

        Ok((tx_hash_stem, state_hash_stem))
    }

    /// Commits to the per-account transaction aggregation over the relay
    /// window; zero outside relay heights.
    fn recent_tx_hash_stem(&self, ctx: &TaskContext<'_>) -> ChainResult<Hash> {
        if self.header.height == 0 || self.header.height % ctx.relay_interval != 0 {
            return Ok(ZERO_HASH);
        }
        let start = self.header.height + 1 - ctx.relay_interval;
        let mut aggregation = RecentTxAggregation::default();
        for height in start..=self.header.height {
            if height != self.header.height {
                let block = ctx
                    .storage
                    .read_block(height)?
                    .ok_or_else(|| ChainError::NotFound(format!("block at height {height}")))?;
                for tx in block.transactions.iter().skip(1) {
                    aggregation.push_tx(&tx.payload)?;
                }
            } else {
                for tx in self.txs.iter().skip(1) {
                    aggregation.push_tx(&tx.payload)?;
                }
            }
        }
        Ok(merkle_root(&aggregation.leaves()?))
    }

    /// Freezes the task's outputs into a block.
    pub fn generate_block(self) -> Block {
        Block::new(self.header, self.txs, self.receipts, self.debts)
    }
}

/// Per-account aggregation of transaction summaries over the relay window.
///
/// Accounts are kept in first-appearance order; that order is a consensus
/// rule shared with the recent-tx proof path.
#[derive(Default)]
pub struct RecentTxAggregation {
    positions: HashMap<Address, usize>,
    grouped: Vec<AccountTxs>,
}

impl RecentTxAggregation {
    pub fn push_tx(&mut self, tx: &Transaction) -> ChainResult<()> {
        let summary = tx_summary_bytes(tx)?;
        self.push_for(&tx.from, &summary);
        if tx.from != tx.to {
            self.push_for(&tx.to, &summary);
        }
        Ok(())
    }

    fn push_for(&mut self, account: &str, summary: &[u8]) {
        match self.positions.get(account) {
            Some(position) => self.grouped[*position].txs.push(summary.to_vec()),
            None => {
                self.positions.insert(account.to_string(), self.grouped.len());
                self.grouped.push(AccountTxs {
                    txs: vec![summary.to_vec()],
                });
            }
        }
    }

    pub fn index_of(&self, account: &str) -> Option<usize> {
        self.positions.get(account).copied()
    }

    pub fn is_empty(&self) -> bool {
        self.grouped.is_empty()
    }

    pub fn leaves(&self) -> ChainResult<Vec<Hash>> {
        self.grouped
            .iter()
            .map(|account_txs| {
                Ok(crate::crypto::hash_bytes(&bincode::serialize(account_txs)?))
            })
            .collect()
    }
}
