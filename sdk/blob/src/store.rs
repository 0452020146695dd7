//! Content-addressed object store.
//!
//! `get` hands back the object as an ordered list of chunks; the caller
//! reassembles them. [`MemoryStore`] is the in-process implementation used
//! by tests and the dev coordinator.

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use dashmap::DashMap;
use tracing::debug;

use crate::error::{BlobError, Result};
use crate::types::{ContentAddress, blob_hash};

pub const DEFAULT_CHUNK_SIZE: usize = 256 * 1024;

pub trait ObjectStore: Send + Sync + 'static {
    fn put(&self, bytes: Vec<u8>) -> impl Future<Output = Result<ContentAddress>> + Send;

    fn get(&self, address: &ContentAddress)
    -> impl Future<Output = Result<Vec<Vec<u8>>>> + Send;
}

/// Reassembles the chunks returned by [`ObjectStore::get`].
pub async fn fetch<S: ObjectStore + ?Sized>(store: &S, address: &ContentAddress) -> Result<Vec<u8>> {
    let chunks = store.get(address).await?;
    let mut bytes = Vec::with_capacity(chunks.iter().map(Vec::len).sum());
    for chunk in chunks {
        bytes.extend_from_slice(&chunk);
    }
    Ok(bytes)
}

pub struct MemoryStore {
    objects: DashMap<ContentAddress, Vec<u8>>,
    chunk_size: usize,
    available: AtomicBool,
    puts: AtomicU64,
    gets: AtomicU64,
}

impl MemoryStore {
    pub fn new(chunk_size: usize) -> Self {
        Self {
            objects: DashMap::new(),
            chunk_size: chunk_size.max(1),
            available: AtomicBool::new(true),
            puts: AtomicU64::new(0),
            gets: AtomicU64::new(0),
        }
    }

    /// While unavailable every call fails with `StoreUnavailable`.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    pub fn contains(&self, address: &ContentAddress) -> bool {
        self.objects.contains_key(address)
    }

    /// Number of `put` calls served so far.
    pub fn put_count(&self) -> u64 {
        self.puts.load(Ordering::SeqCst)
    }

    /// Number of `get` calls served so far.
    pub fn get_count(&self) -> u64 {
        self.gets.load(Ordering::SeqCst)
    }

    fn check_available(&self) -> Result<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(BlobError::StoreUnavailable("memory store offline".into()))
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(DEFAULT_CHUNK_SIZE)
    }
}

impl ObjectStore for MemoryStore {
    async fn put(&self, bytes: Vec<u8>) -> Result<ContentAddress> {
        tokio::task::yield_now().await;
        self.check_available()?;
        self.puts.fetch_add(1, Ordering::SeqCst);

        let address = blob_hash(&bytes);
        debug!(%address, size = bytes.len(), "store put");
        self.objects.insert(address.clone(), bytes);
        Ok(address)
    }

    async fn get(&self, address: &ContentAddress) -> Result<Vec<Vec<u8>>> {
        tokio::task::yield_now().await;
        self.check_available()?;
        self.gets.fetch_add(1, Ordering::SeqCst);

        let object = self
            .objects
            .get(address)
            .ok_or_else(|| BlobError::NotFound(address.clone()))?;
        Ok(object.chunks(self.chunk_size).map(<[u8]>::to_vec).collect())
    }
}
