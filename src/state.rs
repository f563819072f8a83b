//! Account state: immutable per-root snapshots plus the mutable working copy
//! owned by a block-assembly task.

use std::collections::{hash_map::Entry, HashMap};
use std::sync::Arc;

use rocksdb::{BoundColumnFamily, DBWithThreadMode, MultiThreaded, WriteBatch};

use crate::crypto::hash_bytes;
use crate::errors::{ChainError, ChainResult};
use crate::merkle::merkle_root;
use crate::types::{Account, Address, Amount, Debt, Hash, Receipt, SignedTransaction};

pub(crate) const CF_STATES: &str = "states";

pub struct StateDb {
    db: Arc<DBWithThreadMode<MultiThreaded>>,
}

impl StateDb {
    pub(crate) fn new(db: Arc<DBWithThreadMode<MultiThreaded>>) -> Self {
        Self { db }
    }

    fn states_cf(&self) -> ChainResult<Arc<BoundColumnFamily<'_>>> {
        self.db
            .cf_handle(CF_STATES)
            .ok_or_else(|| ChainError::Config("missing states column family".into()))
    }

    fn read_accounts(&self, root: &str) -> ChainResult<Vec<Account>> {
        let cf = self.states_cf()?;
        match self.db.get_cf(&cf, root.as_bytes())? {
            Some(bytes) => Ok(bincode::deserialize(&bytes)?),
            None => Err(ChainError::NotFound(format!("state root {root}"))),
        }
    }

    /// Immutable view of the state committed under `root`.
    pub fn snapshot(&self, root: &str) -> ChainResult<Snapshot> {
        Ok(Snapshot {
            accounts: index_by_address(self.read_accounts(root)?),
        })
    }

    /// Mutable copy for block assembly, seeded from `root`.
    pub fn working_copy_from(&self, root: &str) -> ChainResult<WorkingState> {
        Ok(WorkingState {
            accounts: index_by_address(self.read_accounts(root)?),
        })
    }

    /// Empty working copy used when building the genesis state.
    pub fn empty_working_copy(&self) -> WorkingState {
        WorkingState {
            accounts: HashMap::new(),
        }
    }

    /// Stages the state under its root into `batch` and returns the root.
    pub fn commit(&self, state: &WorkingState, batch: &mut WriteBatch) -> ChainResult<String> {
        let accounts = state.sorted_accounts();
        let root = state.state_root();
        let cf = self.states_cf()?;
        batch.put_cf(&cf, root.as_bytes(), bincode::serialize(&accounts)?);
        Ok(root)
    }
}

fn index_by_address(accounts: Vec<Account>) -> HashMap<Address, Account> {
    accounts
        .into_iter()
        .map(|account| (account.address.clone(), account))
        .collect()
}

fn account_leaf(account: &Account) -> Hash {
    let bytes = serde_json::to_vec(account).expect("serialize account");
    hash_bytes(&bytes)
}

/// Leaf of the state stem: `H(encode(address, balance, nonce))`, shared by
/// block assembly and the balance proof path.
pub fn account_state_leaf(address: &str, balance: &Amount, nonce: u64) -> ChainResult<Hash> {
    let bytes = bincode::serialize(&(
        crate::crypto::address_to_bytes(address)?,
        balance,
        nonce,
    ))?;
    Ok(hash_bytes(&bytes))
}

#[derive(Clone, Debug)]
pub struct Snapshot {
    accounts: HashMap<Address, Account>,
}

impl Snapshot {
    pub fn get_account(&self, address: &str) -> Option<&Account> {
        self.accounts.get(address)
    }

    pub fn balance_of(&self, address: &str) -> Amount {
        self.accounts
            .get(address)
            .map(|account| account.balance.clone())
            .unwrap_or_default()
    }

    pub fn nonce_of(&self, address: &str) -> u64 {
        self.accounts
            .get(address)
            .map(|account| account.nonce)
            .unwrap_or_default()
    }
}

#[derive(Clone, Debug)]
pub struct WorkingState {
    accounts: HashMap<Address, Account>,
}

impl WorkingState {
    pub fn balance_of(&self, address: &str) -> Amount {
        self.accounts
            .get(address)
            .map(|account| account.balance.clone())
            .unwrap_or_default()
    }

    pub fn nonce_of(&self, address: &str) -> u64 {
        self.accounts
            .get(address)
            .map(|account| account.nonce)
            .unwrap_or_default()
    }

    pub fn set_account(&mut self, account: Account) {
        self.accounts.insert(account.address.clone(), account);
    }

    /// Checks a pool transaction against the current working state.
    pub fn validate_transaction(&self, tx: &SignedTransaction) -> ChainResult<()> {
        tx.verify()?;
        let sender = self
            .accounts
            .get(&tx.payload.from)
            .ok_or_else(|| ChainError::Transaction("sender account not found".into()))?;
        if sender.nonce + 1 != tx.payload.account_nonce {
            return Err(ChainError::Transaction("invalid nonce".into()));
        }
        let mut total = tx.payload.amount.clone();
        total.add_assign(&Amount::from_u64(tx.payload.fee()));
        if sender.balance < total {
            return Err(ChainError::Transaction("insufficient balance".into()));
        }
        Ok(())
    }

    pub fn apply_transaction(
        &mut self,
        tx: &SignedTransaction,
        coinbase: &str,
    ) -> ChainResult<Receipt> {
        let fee = tx.payload.fee();
        let mut total = tx.payload.amount.clone();
        total.add_assign(&Amount::from_u64(fee));
        {
            let sender = self
                .accounts
                .get_mut(&tx.payload.from)
                .ok_or_else(|| ChainError::Transaction("sender account not found".into()))?;
            if !sender.debit(&total) {
                return Err(ChainError::Transaction("insufficient balance".into()));
            }
            sender.nonce += 1;
        }
        self.credit(&tx.payload.to, &tx.payload.amount);
        self.credit(coinbase, &Amount::from_u64(fee));
        Ok(Receipt {
            tx_hash: tx.hash_hex(),
            total_fee: fee,
        })
    }

    /// The reward transaction is synthesized by the task and never fails
    /// validation; it only credits the coinbase.
    pub fn apply_reward(&mut self, tx: &SignedTransaction) -> Receipt {
        self.credit(&tx.payload.to, &tx.payload.amount);
        Receipt {
            tx_hash: tx.hash_hex(),
            total_fee: 0,
        }
    }

    /// Debts settle without verification: the receiving account is credited
    /// and the packing fee goes to the coinbase.
    pub fn apply_debt(&mut self, debt: &Debt, coinbase: &str) -> ChainResult<()> {
        if debt.account.is_empty() {
            return Err(ChainError::Debt("debt without target account".into()));
        }
        self.credit(&debt.account, &debt.amount);
        self.credit(coinbase, &Amount::from_u64(debt.fee));
        Ok(())
    }

    fn credit(&mut self, address: &str, amount: &Amount) {
        match self.accounts.entry(address.to_string()) {
            Entry::Occupied(mut existing) => existing.get_mut().credit(amount),
            Entry::Vacant(entry) => {
                entry.insert(Account::new(address.to_string(), amount.clone()));
            }
        }
    }

    pub fn sorted_accounts(&self) -> Vec<Account> {
        let mut accounts = self.accounts.values().cloned().collect::<Vec<_>>();
        accounts.sort_by(|a, b| a.address.cmp(&b.address));
        accounts
    }

    pub fn state_root(&self) -> String {
        let leaves = self
            .sorted_accounts()
            .iter()
            .map(account_leaf)
            .collect::<Vec<_>>();
        hex::encode(merkle_root(&leaves))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Storage;
    use crate::types::Transaction;
    use ed25519_dalek::{Keypair, PublicKey, SecretKey, Signer};
    use tempfile::tempdir;

    fn keypair(seed: u8) -> Keypair {
        let secret = SecretKey::from_bytes(&[seed; 32]).expect("secret");
        let public = PublicKey::from(&secret);
        Keypair { secret, public }
    }

    fn signed_transfer(keypair: &Keypair, from: &str, to: &str, amount: u64) -> SignedTransaction {
        let tx = Transaction::new(
            from.to_string(),
            to.to_string(),
            Amount::from_u64(amount),
            1,
            0,
            0,
            1_700_000_000,
            Vec::new(),
        );
        let signature = keypair.sign(&tx.canonical_bytes());
        SignedTransaction::new(tx, signature, &keypair.public)
    }

    #[test]
    fn transfer_moves_balance_and_bumps_nonce() {
        let keypair = keypair(5);
        let alice = crate::crypto::address_from_public_key(&keypair.public);
        let bob = "bb".repeat(20);
        let coinbase = "cc".repeat(20);

        let mut state = WorkingState {
            accounts: HashMap::new(),
        };
        state.set_account(Account::new(alice.clone(), Amount::from_u64(100)));

        let tx = signed_transfer(&keypair, &alice, &bob, 30);
        state.validate_transaction(&tx).unwrap();
        let receipt = state.apply_transaction(&tx, &coinbase).unwrap();
        assert_eq!(receipt.total_fee, 0);
        assert_eq!(state.balance_of(&alice), Amount::from_u64(70));
        assert_eq!(state.balance_of(&bob), Amount::from_u64(30));
        assert_eq!(state.nonce_of(&alice), 1);
    }

    #[test]
    fn stale_nonce_is_rejected() {
        let keypair = keypair(6);
        let alice = crate::crypto::address_from_public_key(&keypair.public);
        let mut state = WorkingState {
            accounts: HashMap::new(),
        };
        let mut account = Account::new(alice.clone(), Amount::from_u64(100));
        account.nonce = 3;
        state.set_account(account);

        let tx = signed_transfer(&keypair, &alice, &"bb".repeat(20), 1);
        assert!(state.validate_transaction(&tx).is_err());
    }

    #[test]
    fn commit_round_trips_through_snapshot() {
        let dir = tempdir().unwrap();
        let storage = Storage::open(dir.path()).unwrap();
        let state_db = storage.state_db();

        let mut state = state_db.empty_working_copy();
        state.set_account(Account::new("aa".repeat(20), Amount::from_u64(7)));
        state.set_account(Account::new("bb".repeat(20), Amount::from_u64(11)));

        let mut batch = storage.new_batch();
        let root = state_db.commit(&state, &mut batch).unwrap();
        storage.commit_batch(batch).unwrap();

        let snapshot = state_db.snapshot(&root).unwrap();
        assert_eq!(snapshot.balance_of(&"aa".repeat(20)), Amount::from_u64(7));
        assert_eq!(snapshot.balance_of(&"bb".repeat(20)), Amount::from_u64(11));
        assert_eq!(snapshot.nonce_of(&"aa".repeat(20)), 0);

        assert!(matches!(
            state_db.snapshot(&"ff".repeat(32)),
            Err(ChainError::NotFound(_))
        ));
    }

    #[test]
    fn state_root_is_order_independent() {
        let mut first = WorkingState {
            accounts: HashMap::new(),
        };
        first.set_account(Account::new("aa".repeat(20), Amount::from_u64(1)));
        first.set_account(Account::new("bb".repeat(20), Amount::from_u64(2)));

        let mut second = WorkingState {
            accounts: HashMap::new(),
        };
        second.set_account(Account::new("bb".repeat(20), Amount::from_u64(2)));
        second.set_account(Account::new("aa".repeat(20), Amount::from_u64(1)));

        assert_eq!(first.state_root(), second.state_root());
    }
}
