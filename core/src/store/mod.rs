// Single-writer transactional storage for the receive pipeline
//
// All reconciler mutations for one message batch happen inside one `write`
// call. There is no rollback: partially-applied message state is idempotent
// by construction (uniqueness indexes make re-application a no-op), so a
// write that raced ahead of a `stop` is left committed.

pub mod backend;
pub mod interactions;
pub mod records;

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::Mutex;

pub use backend::{MemoryBackend, SledBackend, StorageBackend, StoreError};

use records::{ConfigRecord, ProfileRecord, ThreadRecord};

/// Handle to the store. Cheap to clone; all clones share one writer lock.
#[derive(Clone)]
pub struct Storage {
    backend: Arc<dyn StorageBackend>,
    write_lock: Arc<Mutex<()>>,
}

/// Access to typed CRUD operations for the duration of one read or write
pub struct StoreTx<'a> {
    backend: &'a dyn StorageBackend,
}

impl Storage {
    pub fn new(backend: Arc<dyn StorageBackend>) -> Self {
        Self {
            backend,
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryBackend::new()))
    }

    /// Run a read block. Reads do not contend for the writer lock.
    pub fn read<T>(
        &self,
        block: impl FnOnce(&StoreTx<'_>) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let tx = StoreTx {
            backend: &*self.backend,
        };
        block(&tx)
    }

    /// Run a write block while holding the single writer lock. Awaiting the
    /// lock is the storage suspension point of a poll cycle.
    pub async fn write<T>(
        &self,
        block: impl FnOnce(&StoreTx<'_>) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let _guard = self.write_lock.lock().await;
        let tx = StoreTx {
            backend: &*self.backend,
        };
        block(&tx)
    }
}

pub(crate) fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, StoreError> {
    bincode::serialize(value).map_err(|e| StoreError::Serialization(e.to_string()))
}

pub(crate) fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, StoreError> {
    bincode::deserialize(bytes).map_err(|e| StoreError::Serialization(e.to_string()))
}

impl<'a> StoreTx<'a> {
    pub(crate) fn backend(&self) -> &'a dyn StorageBackend {
        self.backend
    }

    // Threads ----------------------------------------------------------------

    pub fn thread(&self, thread_id: &str) -> Result<Option<ThreadRecord>, StoreError> {
        match self.backend.get(&records::thread_key(thread_id))? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn put_thread(&self, thread: &ThreadRecord) -> Result<(), StoreError> {
        self.backend
            .put(&records::thread_key(&thread.id), &encode(thread)?)
    }

    // Profiles ---------------------------------------------------------------

    pub fn profile(&self, id: &str) -> Result<Option<ProfileRecord>, StoreError> {
        match self.backend.get(&records::profile_key(id))? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn put_profile(&self, profile: &ProfileRecord) -> Result<(), StoreError> {
        self.backend
            .put(&records::profile_key(&profile.id), &encode(profile)?)
    }

    // Shared config ----------------------------------------------------------

    pub fn config(&self, thread_id: &str) -> Result<Option<ConfigRecord>, StoreError> {
        match self.backend.get(&records::config_key(thread_id))? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn put_config(&self, config: &ConfigRecord) -> Result<(), StoreError> {
        self.backend
            .put(&records::config_key(&config.thread_id), &encode(config)?)
    }

    // Dedup bookkeeping ------------------------------------------------------

    /// Which node first served this hash, if any
    pub fn seen_node_for_hash(&self, hash: &str) -> Result<Option<String>, StoreError> {
        match self.backend.get(&records::seen_hash_key(hash))? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn mark_hash_seen(&self, hash: &str, node_address: &str) -> Result<(), StoreError> {
        self.backend.put(
            &records::seen_hash_key(hash),
            &encode(&node_address.to_string())?,
        )
    }

    /// Pagination cursor for one (target, namespace) pair
    pub fn last_hash(
        &self,
        target_id: &str,
        namespace_tag: &str,
    ) -> Result<Option<String>, StoreError> {
        match self
            .backend
            .get(&records::last_hash_key(target_id, namespace_tag))?
        {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn set_last_hash(
        &self,
        target_id: &str,
        namespace_tag: &str,
        hash: &str,
    ) -> Result<(), StoreError> {
        self.backend.put(
            &records::last_hash_key(target_id, namespace_tag),
            &encode(&hash.to_string())?,
        )
    }
}
