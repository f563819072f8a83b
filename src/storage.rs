use std::convert::TryInto;
use std::path::Path;
use std::sync::Arc;

use rocksdb::{
    BoundColumnFamily, ColumnFamilyDescriptor, DBWithThreadMode, MultiThreaded, Options, WriteBatch,
};
use serde::{Deserialize, Serialize};

use crate::account_index::{AccountIndexStore, CF_ACCOUNT_INDEX_FWD, CF_ACCOUNT_INDEX_REV};
use crate::errors::{ChainError, ChainResult};
use crate::state::{StateDb, CF_STATES};
use crate::types::{Block, BlockMetadata};

pub const STORAGE_SCHEMA_VERSION: u32 = 1;

pub(crate) const CF_BLOCKS: &str = "blocks";
pub(crate) const CF_BLOCK_INDEX: &str = "block_index";
pub(crate) const CF_TX_INDEX: &str = "tx_index";
pub(crate) const CF_METADATA: &str = "metadata";
const TIP_HEIGHT_KEY: &[u8] = b"tip_height";
const TIP_HASH_KEY: &[u8] = b"tip_hash";
const TIP_TIMESTAMP_KEY: &[u8] = b"tip_timestamp";
const SCHEMA_VERSION_KEY: &[u8] = b"schema_version";

/// Location of a transaction inside the canonical chain.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TxIndexEntry {
    pub block_hash: String,
    pub index: u64,
}

pub struct Storage {
    db: Arc<DBWithThreadMode<MultiThreaded>>,
}

impl Storage {
    pub fn open(path: &Path) -> ChainResult<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);
        let cf_descriptors = vec![
            ColumnFamilyDescriptor::new(CF_BLOCKS, Options::default()),
            ColumnFamilyDescriptor::new(CF_BLOCK_INDEX, Options::default()),
            ColumnFamilyDescriptor::new(CF_TX_INDEX, Options::default()),
            ColumnFamilyDescriptor::new(CF_METADATA, Options::default()),
            ColumnFamilyDescriptor::new(CF_STATES, Options::default()),
            ColumnFamilyDescriptor::new(CF_ACCOUNT_INDEX_FWD, Options::default()),
            ColumnFamilyDescriptor::new(CF_ACCOUNT_INDEX_REV, Options::default()),
        ];
        let db = DBWithThreadMode::open_cf_descriptors(&opts, path, cf_descriptors)?;
        let storage = Self { db: Arc::new(db) };
        storage.ensure_schema_supported()?;
        Ok(storage)
    }

    pub fn account_index(&self) -> AccountIndexStore {
        AccountIndexStore::new(self.db.clone())
    }

    pub fn state_db(&self) -> StateDb {
        StateDb::new(self.db.clone())
    }

    pub fn new_batch(&self) -> WriteBatch {
        WriteBatch::default()
    }

    pub fn commit_batch(&self, batch: WriteBatch) -> ChainResult<()> {
        self.db.write(batch)?;
        Ok(())
    }

    fn blocks_cf(&self) -> ChainResult<Arc<BoundColumnFamily<'_>>> {
        self.db
            .cf_handle(CF_BLOCKS)
            .ok_or_else(|| ChainError::Config("missing blocks column family".into()))
    }

    fn block_index_cf(&self) -> ChainResult<Arc<BoundColumnFamily<'_>>> {
        self.db
            .cf_handle(CF_BLOCK_INDEX)
            .ok_or_else(|| ChainError::Config("missing block index column family".into()))
    }

    fn tx_index_cf(&self) -> ChainResult<Arc<BoundColumnFamily<'_>>> {
        self.db
            .cf_handle(CF_TX_INDEX)
            .ok_or_else(|| ChainError::Config("missing tx index column family".into()))
    }

    fn metadata_cf(&self) -> ChainResult<Arc<BoundColumnFamily<'_>>> {
        self.db
            .cf_handle(CF_METADATA)
            .ok_or_else(|| ChainError::Config("missing metadata column family".into()))
    }

    fn ensure_schema_supported(&self) -> ChainResult<()> {
        let metadata_cf = self.metadata_cf()?;
        match self.db.get_cf(&metadata_cf, SCHEMA_VERSION_KEY)? {
            Some(bytes) => {
                let bytes: [u8; 4] = bytes
                    .as_slice()
                    .try_into()
                    .map_err(|_| ChainError::Config("invalid schema version encoding".into()))?;
                let version = u32::from_be_bytes(bytes);
                if version != STORAGE_SCHEMA_VERSION {
                    return Err(ChainError::Config(format!(
                        "database schema version {version} is not supported ({STORAGE_SCHEMA_VERSION} required)"
                    )));
                }
                Ok(())
            }
            None => {
                self.db.put_cf(
                    &metadata_cf,
                    SCHEMA_VERSION_KEY,
                    STORAGE_SCHEMA_VERSION.to_be_bytes(),
                )?;
                Ok(())
            }
        }
    }

    /// Stages a block, its hash index, its tx index entries, and the tip
    /// metadata into `batch`. Everything lands atomically with the batch.
    pub fn stage_block(&self, block: &Block, batch: &mut WriteBatch) -> ChainResult<()> {
        let blocks_cf = self.blocks_cf()?;
        let key = block.header.height.to_be_bytes();
        batch.put_cf(&blocks_cf, key, bincode::serialize(block)?);

        let block_index_cf = self.block_index_cf()?;
        batch.put_cf(&block_index_cf, block.hash.as_bytes(), key);

        let tx_index_cf = self.tx_index_cf()?;
        for (index, tx) in block.transactions.iter().enumerate() {
            let entry = TxIndexEntry {
                block_hash: block.hash.clone(),
                index: index as u64,
            };
            batch.put_cf(&tx_index_cf, tx.hash_hex().as_bytes(), bincode::serialize(&entry)?);
        }

        let metadata_cf = self.metadata_cf()?;
        batch.put_cf(&metadata_cf, TIP_HEIGHT_KEY, key);
        batch.put_cf(&metadata_cf, TIP_HASH_KEY, block.hash.as_bytes());
        batch.put_cf(
            &metadata_cf,
            TIP_TIMESTAMP_KEY,
            block.header.timestamp.to_be_bytes(),
        );
        Ok(())
    }

    pub fn read_block(&self, height: u64) -> ChainResult<Option<Block>> {
        let cf = self.blocks_cf()?;
        match self.db.get_cf(&cf, height.to_be_bytes())? {
            Some(value) => Ok(Some(bincode::deserialize(&value)?)),
            None => Ok(None),
        }
    }

    pub fn read_block_by_hash(&self, hash: &str) -> ChainResult<Option<Block>> {
        let cf = self.block_index_cf()?;
        let Some(height_bytes) = self.db.get_cf(&cf, hash.as_bytes())? else {
            return Ok(None);
        };
        let height_bytes: [u8; 8] = height_bytes
            .as_slice()
            .try_into()
            .map_err(|_| ChainError::Config("invalid block height encoding".into()))?;
        self.read_block(u64::from_be_bytes(height_bytes))
    }

    pub fn tx_index(&self, tx_hash: &str) -> ChainResult<Option<TxIndexEntry>> {
        let cf = self.tx_index_cf()?;
        match self.db.get_cf(&cf, tx_hash.as_bytes())? {
            Some(value) => Ok(Some(bincode::deserialize(&value)?)),
            None => Ok(None),
        }
    }

    pub fn tip(&self) -> ChainResult<Option<BlockMetadata>> {
        let cf = self.metadata_cf()?;
        let height_bytes = match self.db.get_cf(&cf, TIP_HEIGHT_KEY)? {
            Some(bytes) => bytes,
            None => return Ok(None),
        };
        let hash_bytes = self
            .db
            .get_cf(&cf, TIP_HASH_KEY)?
            .ok_or_else(|| ChainError::Config("missing tip hash".into()))?;
        let timestamp_bytes = self
            .db
            .get_cf(&cf, TIP_TIMESTAMP_KEY)?
            .ok_or_else(|| ChainError::Config("missing tip timestamp".into()))?;
        let height = u64::from_be_bytes(
            height_bytes
                .as_slice()
                .try_into()
                .map_err(|_| ChainError::Config("invalid tip height encoding".into()))?,
        );
        let hash = String::from_utf8(hash_bytes.to_vec())
            .map_err(|err| ChainError::Config(format!("invalid tip hash encoding: {err}")))?;
        let timestamp = u64::from_be_bytes(
            timestamp_bytes
                .as_slice()
                .try_into()
                .map_err(|_| ChainError::Config("invalid tip timestamp encoding".into()))?,
        );
        Ok(Some(BlockMetadata {
            height,
            hash,
            timestamp,
        }))
    }
}

impl Clone for Storage {
    fn clone(&self) -> Self {
        Self {
            db: self.db.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Amount, BlockHeader, ConsensusKind, SignedTransaction};
    use tempfile::tempdir;

    fn sample_block(height: u64) -> Block {
        let header = BlockHeader::new(
            "00".repeat(32),
            "aa".repeat(20),
            height,
            "11".repeat(32),
            1_700_000_000 + height,
            ConsensusKind::Bft,
        );
        let reward = SignedTransaction::reward("aa".repeat(20), Amount::zero(), header.timestamp);
        Block::new(header, vec![reward], Vec::new(), Vec::new())
    }

    #[test]
    fn block_round_trip_with_indexes() {
        let dir = tempdir().unwrap();
        let storage = Storage::open(dir.path()).unwrap();
        let block = sample_block(1);

        let mut batch = storage.new_batch();
        storage.stage_block(&block, &mut batch).unwrap();
        storage.commit_batch(batch).unwrap();

        let by_height = storage.read_block(1).unwrap().expect("block by height");
        assert_eq!(by_height.hash, block.hash);

        let by_hash = storage
            .read_block_by_hash(&block.hash)
            .unwrap()
            .expect("block by hash");
        assert_eq!(by_hash.header.height, 1);

        let entry = storage
            .tx_index(&block.transactions[0].hash_hex())
            .unwrap()
            .expect("tx index");
        assert_eq!(entry.block_hash, block.hash);
        assert_eq!(entry.index, 0);

        let tip = storage.tip().unwrap().expect("tip");
        assert_eq!(tip.height, 1);
        assert_eq!(tip.hash, block.hash);
    }

    #[test]
    fn staged_block_is_invisible_until_commit() {
        let dir = tempdir().unwrap();
        let storage = Storage::open(dir.path()).unwrap();
        let block = sample_block(2);

        let mut batch = storage.new_batch();
        storage.stage_block(&block, &mut batch).unwrap();
        assert!(storage.read_block(2).unwrap().is_none());
        drop(batch);
        assert!(storage.read_block(2).unwrap().is_none());
    }
}
