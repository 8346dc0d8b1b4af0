// Copyright 2019 TiKV Project Authors. Licensed under Apache-2.0.

use byteorder::{BigEndian, ByteOrder};
use bytes::Bytes;
use sled::transaction::{TransactionError, TransactionResult};
use sled::{Batch, Db, Transactional, Tree};

use super::{plan_append, plan_delete_range, Storage, CONF_STATE_KEY, SNAPSHOT_META_KEY};
use crate::codec::Codec;
use crate::errors::{Error, Result, StorageError};
use crate::message::{Entry, SnapshotMetadata};

/// Keys are big endian so that sled's lexicographic order is index order.
fn id_to_bin(id: u64) -> [u8; 8] {
    let mut buf = [0; 8];
    BigEndian::write_u64(&mut buf, id);
    buf
}

fn bin_to_id(buf: &[u8]) -> Result<u64> {
    if buf.len() != 8 {
        return Err(Error::Store(StorageError::Corrupted(format!(
            "index key of {} bytes",
            buf.len()
        ))));
    }
    Ok(BigEndian::read_u64(buf))
}

fn corrupted(what: &str, e: impl std::fmt::Display) -> Error {
    Error::Store(StorageError::Corrupted(format!("{}: {}", what, e)))
}

/// A `Storage` on top of a shared sled database.
///
/// Every group owns two trees: `logs-<gid>` keyed by the entry index and
/// `meta-<gid>` holding the fixed metadata keys. Each mutation is applied as
/// one batch or transaction and flushed before returning.
#[derive(Clone)]
pub struct SledStorage {
    group_id: u64,
    logs: Tree,
    meta: Tree,
}

impl SledStorage {
    /// Opens, creating if needed, the trees of `group_id` in `db`.
    pub fn open(db: &Db, group_id: u64) -> Result<SledStorage> {
        Ok(SledStorage {
            group_id,
            logs: db.open_tree(format!("logs-{}", group_id))?,
            meta: db.open_tree(format!("meta-{}", group_id))?,
        })
    }

    /// The group this store belongs to.
    pub fn group_id(&self) -> u64 {
        self.group_id
    }

    fn bound(&self, kv: Option<(sled::IVec, sled::IVec)>) -> Result<u64> {
        match kv {
            Some((k, _)) => bin_to_id(&k),
            None => Ok(0),
        }
    }
}

impl Storage for SledStorage {
    fn append(&self, ents: &[Entry]) -> Result<()> {
        let first = self.first_index()?;
        let last = self.last_index()?;
        let snapshot_index = self.snapshot_meta()?.index;
        let to_write = plan_append(ents, first, last, snapshot_index, |idx| {
            self.get(idx).map(|e| e.term)
        })?;
        let start = match to_write.first() {
            Some(e) => e.index,
            None => return Ok(()),
        };

        let mut batch = Batch::default();
        if last != 0 {
            for idx in start..=last {
                batch.remove(&id_to_bin(idx)[..]);
            }
        }
        for e in to_write {
            batch.insert(&id_to_bin(e.index)[..], &e.encode_to_bytes()[..]);
        }
        self.logs.apply_batch(batch)?;
        self.logs.flush()?;
        Ok(())
    }

    fn get(&self, index: u64) -> Result<Entry> {
        match self.logs.get(id_to_bin(index))? {
            Some(v) => Entry::decode_from(&v).map_err(|e| corrupted("entry", e)),
            None => Err(Error::Store(StorageError::LogNotFound(index))),
        }
    }

    fn first_index(&self) -> Result<u64> {
        self.bound(self.logs.first()?)
    }

    fn last_index(&self) -> Result<u64> {
        self.bound(self.logs.last()?)
    }

    fn delete_range(&self, min: u64, max: u64) -> Result<()> {
        let first = self.first_index()?;
        let last = self.last_index()?;
        let (min, max) = match plan_delete_range(min, max, first, last)? {
            Some(range) => range,
            None => return Ok(()),
        };
        let mut batch = Batch::default();
        for idx in min..=max {
            batch.remove(&id_to_bin(idx)[..]);
        }
        self.logs.apply_batch(batch)?;
        self.logs.flush()?;
        Ok(())
    }

    fn set(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.meta.insert(key, value)?;
        self.meta.flush()?;
        Ok(())
    }

    fn get_bytes(&self, key: &[u8]) -> Result<Bytes> {
        match self.meta.get(key)? {
            Some(v) => Ok(Bytes::copy_from_slice(&v)),
            None => Err(Error::Store(StorageError::KeyNotFound)),
        }
    }

    fn set_u64(&self, key: &[u8], value: u64) -> Result<()> {
        self.set(key, &id_to_bin(value))
    }

    fn get_u64(&self, key: &[u8]) -> Result<u64> {
        let v = self.get_bytes(key)?;
        bin_to_id(&v)
    }

    fn apply_snapshot_meta(&self, meta: &SnapshotMetadata) -> Result<()> {
        let first = self.first_index()?;
        let last = self.last_index()?;
        let keys: Vec<[u8; 8]> = if first == 0 {
            vec![]
        } else {
            (first..=last).map(id_to_bin).collect()
        };
        let meta_bytes = meta.encode_to_bytes();
        let cs_bytes = meta.conf_state.encode_to_bytes();

        let res: TransactionResult<()> = (&self.logs, &self.meta).transaction(|(logs, m)| {
            for k in &keys {
                logs.remove(&k[..])?;
            }
            m.insert(SNAPSHOT_META_KEY, &meta_bytes[..])?;
            m.insert(CONF_STATE_KEY, &cs_bytes[..])?;
            Ok(())
        });
        match res {
            Ok(()) => {}
            Err(TransactionError::Storage(e)) => return Err(e.into()),
            Err(TransactionError::Abort(())) => {
                return Err(Error::Store(StorageError::Unavailable))
            }
        }
        self.logs.flush()?;
        self.meta.flush()?;
        Ok(())
    }
}
