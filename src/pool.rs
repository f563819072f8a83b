//! Transaction and debt pools.
//!
//! The assembly task only sees the narrow `get_processable`/`remove` surface;
//! ranking and gossip admission stay behind it. The in-memory pools here are
//! FIFO and hand out items up to the caller's byte budget.

use std::collections::VecDeque;

use parking_lot::RwLock;

use crate::types::{Debt, SignedTransaction};

pub trait TxPool: Send + Sync {
    /// Returns a batch of transactions fitting `budget` bytes plus the byte
    /// size consumed. An empty batch means the pool is drained.
    fn get_processable(&self, budget: usize) -> (Vec<SignedTransaction>, usize);
    /// Idempotent removal of a rejected or included transaction.
    fn remove(&self, tx_hash: &str);
}

pub trait DebtPool: Send + Sync {
    fn get_processable(&self, budget: usize) -> (Vec<Debt>, usize);
    fn remove(&self, debt_hash: &str);
}

pub struct MemoryTxPool {
    txs: RwLock<VecDeque<SignedTransaction>>,
    limit: usize,
}

impl MemoryTxPool {
    pub fn new(limit: usize) -> Self {
        Self {
            txs: RwLock::new(VecDeque::new()),
            limit,
        }
    }

    pub fn add(&self, tx: SignedTransaction) -> bool {
        let mut txs = self.txs.write();
        if txs.len() >= self.limit {
            return false;
        }
        if txs.iter().any(|known| known.hash() == tx.hash()) {
            return false;
        }
        txs.push_back(tx);
        true
    }

    pub fn len(&self) -> usize {
        self.txs.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.txs.read().is_empty()
    }
}

impl TxPool for MemoryTxPool {
    fn get_processable(&self, budget: usize) -> (Vec<SignedTransaction>, usize) {
        let mut txs = self.txs.write();
        let mut batch = Vec::new();
        let mut consumed = 0usize;
        while let Some(tx) = txs.front() {
            let size = tx.size();
            if consumed + size > budget {
                break;
            }
            consumed += size;
            batch.push(txs.pop_front().expect("front checked"));
        }
        (batch, consumed)
    }

    fn remove(&self, tx_hash: &str) {
        let mut txs = self.txs.write();
        txs.retain(|tx| tx.hash_hex() != tx_hash);
    }
}

pub struct MemoryDebtPool {
    debts: RwLock<VecDeque<Debt>>,
    limit: usize,
}

impl MemoryDebtPool {
    pub fn new(limit: usize) -> Self {
        Self {
            debts: RwLock::new(VecDeque::new()),
            limit,
        }
    }

    pub fn add(&self, debt: Debt) -> bool {
        let mut debts = self.debts.write();
        if debts.len() >= self.limit {
            return false;
        }
        if debts.iter().any(|known| known.hash == debt.hash) {
            return false;
        }
        debts.push_back(debt);
        true
    }

    pub fn len(&self) -> usize {
        self.debts.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.debts.read().is_empty()
    }
}

impl DebtPool for MemoryDebtPool {
    fn get_processable(&self, budget: usize) -> (Vec<Debt>, usize) {
        let mut debts = self.debts.write();
        let mut batch = Vec::new();
        let mut consumed = 0usize;
        while let Some(debt) = debts.front() {
            let size = debt.size();
            if consumed + size > budget {
                break;
            }
            consumed += size;
            batch.push(debts.pop_front().expect("front checked"));
        }
        (batch, consumed)
    }

    fn remove(&self, debt_hash: &str) {
        let mut debts = self.debts.write();
        debts.retain(|debt| debt.hash != debt_hash);
    }
}
