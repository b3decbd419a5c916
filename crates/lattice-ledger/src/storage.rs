//! Persistent storage using RocksDB.
//!
//! Key layout:
//! - `entry:{seq:020}`: JSON [`EntryRecord`]
//! - `decision:{seq:020}`: JSON [`DecisionRecord`]
//! - `meta:next_sequence`: u64 big-endian
//! - `meta:tip_hash`: 32 raw bytes
//! - `guard:{origin}`: u64 big-endian, highest accepted directive counter
//! - `key:{name}`: 32-byte Ed25519 seed

use crate::entry::{DecisionRecord, EntryRecord};
use crate::error::{Error, Result};
use ed25519_dalek::SigningKey;
use lattice_protocol::{CounterStore, StoreError};
use rocksdb::{Direction, IteratorMode, Options, WriteBatch, DB};
use std::path::Path;

const NEXT_SEQUENCE: &[u8] = b"meta:next_sequence";
const TIP_HASH: &[u8] = b"meta:tip_hash";
const ENTRY_PREFIX: &str = "entry:";
const GUARD_PREFIX: &str = "guard:";

fn entry_key(seq: u64) -> String {
    format!("{ENTRY_PREFIX}{seq:020}")
}

fn decision_key(seq: u64) -> String {
    format!("decision:{seq:020}")
}

/// Storage backend shared by the ledger, the replay guard and the
/// coordinator identity.
pub struct Storage {
    db: DB,
}

impl Storage {
    /// Open or create storage at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        let db = DB::open(&opts, path)?;
        Ok(Self { db })
    }

    // --- Entries ---

    /// Append an entry, advancing the commit counter and chain tip in the
    /// same write batch.
    pub(crate) fn append_entry(&self, record: &EntryRecord) -> Result<()> {
        let mut batch = WriteBatch::default();
        batch.put(
            entry_key(record.sequence_number).as_bytes(),
            serde_json::to_vec(record)?,
        );
        batch.put(NEXT_SEQUENCE, (record.sequence_number + 1).to_be_bytes());
        batch.put(TIP_HASH, record.entry_hash);
        self.db.write(batch)?;
        Ok(())
    }

    pub fn get_entry(&self, seq: u64) -> Result<Option<EntryRecord>> {
        match self.db.get(entry_key(seq).as_bytes())? {
            Some(data) => Ok(Some(serde_json::from_slice(&data)?)),
            None => Ok(None),
        }
    }

    /// Up to `limit` entries with sequence numbers above `after`, in key order.
    pub fn entries_after(&self, after: u64, limit: usize) -> Result<Vec<EntryRecord>> {
        let start = entry_key(after.saturating_add(1));
        let mut entries = Vec::new();

        let iter = self
            .db
            .iterator(IteratorMode::From(start.as_bytes(), Direction::Forward));
        for item in iter {
            if entries.len() >= limit {
                break;
            }
            let (key, value) = item?;
            if !key.starts_with(ENTRY_PREFIX.as_bytes()) {
                break;
            }
            entries.push(serde_json::from_slice(&value)?);
        }

        Ok(entries)
    }

    /// Persisted commit counter, `None` on a fresh database.
    pub fn next_sequence(&self) -> Result<Option<u64>> {
        match self.db.get(NEXT_SEQUENCE)? {
            Some(data) => {
                let raw: [u8; 8] = data
                    .as_slice()
                    .try_into()
                    .map_err(|_| Error::Storage("Invalid stored sequence counter".into()))?;
                Ok(Some(u64::from_be_bytes(raw)))
            }
            None => Ok(None),
        }
    }

    pub fn tip_hash(&self) -> Result<Option<[u8; 32]>> {
        match self.db.get(TIP_HASH)? {
            Some(data) => {
                let raw: [u8; 32] = data
                    .as_slice()
                    .try_into()
                    .map_err(|_| Error::Storage("Invalid stored tip hash".into()))?;
                Ok(Some(raw))
            }
            None => Ok(None),
        }
    }

    // --- Decisions ---

    pub(crate) fn put_decision(&self, decision: &DecisionRecord) -> Result<()> {
        let value = serde_json::to_vec(decision)?;
        self.db
            .put(decision_key(decision.sequence_number).as_bytes(), value)?;
        Ok(())
    }

    pub fn get_decision(&self, seq: u64) -> Result<Option<DecisionRecord>> {
        match self.db.get(decision_key(seq).as_bytes())? {
            Some(data) => Ok(Some(serde_json::from_slice(&data)?)),
            None => Ok(None),
        }
    }

    // --- Replay counters ---

    pub fn get_counter(&self, origin: &str) -> Result<Option<u64>> {
        let key = format!("{GUARD_PREFIX}{origin}");
        match self.db.get(key.as_bytes())? {
            Some(data) => Ok(Some(decode_counter(&data)?)),
            None => Ok(None),
        }
    }

    pub fn put_counter(&self, origin: &str, counter: u64) -> Result<()> {
        let key = format!("{GUARD_PREFIX}{origin}");
        self.db.put(key.as_bytes(), counter.to_be_bytes())?;
        Ok(())
    }

    pub fn list_counters(&self) -> Result<Vec<(String, u64)>> {
        let prefix = GUARD_PREFIX.as_bytes();
        let mut counters = Vec::new();

        let iter = self.db.prefix_iterator(prefix);
        for item in iter {
            let (key, value) = item?;
            if key.starts_with(prefix) {
                let key_str = String::from_utf8_lossy(&key);
                if let Some(origin) = key_str.strip_prefix(GUARD_PREFIX) {
                    counters.push((origin.to_string(), decode_counter(&value)?));
                }
            } else {
                break;
            }
        }

        Ok(counters)
    }

    // --- Identity ---

    /// Get or create a named signing key (persistent identity).
    pub fn get_or_create_signing_key(&self, name: &str) -> Result<SigningKey> {
        let key = format!("key:{name}");

        if let Some(data) = self.db.get(key.as_bytes())? {
            let bytes: [u8; 32] = data
                .as_slice()
                .try_into()
                .map_err(|_| Error::Storage("Invalid stored key".into()))?;
            Ok(SigningKey::from_bytes(&bytes))
        } else {
            let mut rng = rand::thread_rng();
            let signing_key = SigningKey::generate(&mut rng);
            self.db.put(key.as_bytes(), signing_key.as_bytes())?;
            Ok(signing_key)
        }
    }

    /// Flush memtables to disk.
    pub fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn put_raw(&self, key: &str, value: &[u8]) -> Result<()> {
        self.db.put(key.as_bytes(), value)?;
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn delete_raw(&self, key: &str) -> Result<()> {
        self.db.delete(key.as_bytes())?;
        Ok(())
    }
}

fn decode_counter(data: &[u8]) -> Result<u64> {
    let raw: [u8; 8] = data
        .try_into()
        .map_err(|_| Error::Storage("Invalid stored replay counter".into()))?;
    Ok(u64::from_be_bytes(raw))
}

impl CounterStore for Storage {
    fn load_counters(&self) -> std::result::Result<Vec<(String, u64)>, StoreError> {
        Ok(self.list_counters()?)
    }

    fn store_counter(&self, origin: &str, counter: u64) -> std::result::Result<(), StoreError> {
        Ok(self.put_counter(origin, counter)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn counters_roundtrip() {
        let dir = tempdir().unwrap();
        let storage = Storage::open(dir.path()).unwrap();

        storage.put_counter("UI-A", 3).unwrap();
        storage.put_counter("N1", 7).unwrap();
        storage.put_counter("UI-A", 4).unwrap();

        assert_eq!(storage.get_counter("UI-A").unwrap(), Some(4));
        let mut counters = storage.list_counters().unwrap();
        counters.sort();
        assert_eq!(counters, vec![("N1".into(), 7), ("UI-A".into(), 4)]);
    }

    #[test]
    fn counter_store_trait_reads_back() {
        let dir = tempdir().unwrap();
        let storage = Storage::open(dir.path()).unwrap();
        storage.store_counter("UI-B", 12).unwrap();
        assert_eq!(storage.load_counters().unwrap(), vec![("UI-B".to_string(), 12)]);
    }

    #[test]
    fn signing_key_persists() {
        let dir = tempdir().unwrap();
        let first = {
            let storage = Storage::open(dir.path()).unwrap();
            storage.get_or_create_signing_key("coordinator").unwrap()
        };
        let storage = Storage::open(dir.path()).unwrap();
        let second = storage.get_or_create_signing_key("coordinator").unwrap();
        assert_eq!(first.to_bytes(), second.to_bytes());

        let other = storage.get_or_create_signing_key("other").unwrap();
        assert_ne!(other.to_bytes(), second.to_bytes());
    }

    #[test]
    fn fresh_database_has_no_meta() {
        let dir = tempdir().unwrap();
        let storage = Storage::open(dir.path()).unwrap();
        assert_eq!(storage.next_sequence().unwrap(), None);
        assert_eq!(storage.tip_hash().unwrap(), None);
        assert!(storage.entries_after(0, 10).unwrap().is_empty());
    }
}
