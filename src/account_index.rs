//! Bijective `address <-> compact index` store shared by block assembly and
//! the proof service.
//!
//! Entries are created on first appearance of an address and never deleted.
//! Allocations made while assembling a block are staged in a
//! [`StagedAccountIndex`] and only reach the database together with the
//! block's write batch; dropping the stage rolls them back.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use bincode::Options;
use rocksdb::{BoundColumnFamily, DBWithThreadMode, MultiThreaded, WriteBatch};

use crate::crypto::{address_from_bytes, address_to_bytes};
use crate::errors::{ChainError, ChainResult};
use crate::types::Address;

pub(crate) const CF_ACCOUNT_INDEX_FWD: &str = "account_index_fwd";
pub(crate) const CF_ACCOUNT_INDEX_REV: &str = "account_index_rev";

/// Canonical unsigned varint form of a persisted index.
pub fn index_to_bytes(index: u64) -> ChainResult<Vec<u8>> {
    Ok(bincode::DefaultOptions::new().serialize(&index)?)
}

pub fn index_from_bytes(bytes: &[u8]) -> ChainResult<u64> {
    Ok(bincode::DefaultOptions::new().deserialize(bytes)?)
}

pub struct AccountIndexStore {
    db: Arc<DBWithThreadMode<MultiThreaded>>,
}

impl AccountIndexStore {
    pub(crate) fn new(db: Arc<DBWithThreadMode<MultiThreaded>>) -> Self {
        Self { db }
    }

    fn fwd_cf(&self) -> ChainResult<Arc<BoundColumnFamily<'_>>> {
        self.db
            .cf_handle(CF_ACCOUNT_INDEX_FWD)
            .ok_or_else(|| ChainError::Config("missing account index column family".into()))
    }

    fn rev_cf(&self) -> ChainResult<Arc<BoundColumnFamily<'_>>> {
        self.db
            .cf_handle(CF_ACCOUNT_INDEX_REV)
            .ok_or_else(|| ChainError::Config("missing index account column family".into()))
    }

    pub fn has(&self, address: &str) -> ChainResult<bool> {
        let cf = self.fwd_cf()?;
        Ok(self.db.get_cf(&cf, address_to_bytes(address)?)?.is_some())
    }

    pub fn index_of(&self, address: &str) -> ChainResult<Option<u64>> {
        let cf = self.fwd_cf()?;
        match self.db.get_cf(&cf, address_to_bytes(address)?)? {
            Some(bytes) => Ok(Some(index_from_bytes(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn address_at(&self, index: u64) -> ChainResult<Option<Address>> {
        let cf = self.rev_cf()?;
        match self.db.get_cf(&cf, index_to_bytes(index)?)? {
            Some(bytes) => Ok(Some(address_from_bytes(&bytes))),
            None => Ok(None),
        }
    }
}

/// Index view used during assembly of one block: reads see both the
/// persisted entries and the allocations staged so far.
pub struct StagedAccountIndex<'a> {
    store: &'a AccountIndexStore,
    pending_fwd: HashMap<Address, u64>,
    pending_rev: BTreeMap<u64, Address>,
    next_index: u64,
}

impl<'a> StagedAccountIndex<'a> {
    /// `account_count` is inherited from the parent block's witness and
    /// equals the store size at that block.
    pub fn new(store: &'a AccountIndexStore, account_count: u64) -> Self {
        Self {
            store,
            pending_fwd: HashMap::new(),
            pending_rev: BTreeMap::new(),
            next_index: account_count,
        }
    }

    pub fn account_count(&self) -> u64 {
        self.next_index
    }

    pub fn has(&self, address: &str) -> ChainResult<bool> {
        if self.pending_fwd.contains_key(address) {
            return Ok(true);
        }
        self.store.has(address)
    }

    pub fn address_at(&self, index: u64) -> ChainResult<Option<Address>> {
        if let Some(address) = self.pending_rev.get(&index) {
            return Ok(Some(address.clone()));
        }
        self.store.address_at(index)
    }

    /// Allocates the next index for `address`, or returns the existing one.
    pub fn put(&mut self, address: &str) -> ChainResult<u64> {
        if let Some(index) = self.pending_fwd.get(address) {
            return Ok(*index);
        }
        if let Some(index) = self.store.index_of(address)? {
            return Ok(index);
        }
        let index = self.next_index;
        self.next_index += 1;
        self.pending_fwd.insert(address.to_string(), index);
        self.pending_rev.insert(index, address.to_string());
        Ok(index)
    }

    /// Writes the staged allocations into the block's batch. The stage stays
    /// usable for reads until the batch commits.
    pub fn stage_into(&self, batch: &mut WriteBatch) -> ChainResult<()> {
        let fwd = self.store.fwd_cf()?;
        let rev = self.store.rev_cf()?;
        for (address, index) in &self.pending_fwd {
            let address_bytes = address_to_bytes(address)?;
            let index_bytes = index_to_bytes(*index)?;
            batch.put_cf(&fwd, &address_bytes, &index_bytes);
            batch.put_cf(&rev, &index_bytes, &address_bytes);
        }
        Ok(())
    }
}
