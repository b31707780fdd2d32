//! Two-tier response cache: bounded in-memory LRU over a durable ndjson
//! disk tier.
//!
//! The disk tier is append-only with a lazily loaded index (last write wins)
//! and an explicit compaction pass; at rest it is a strict superset of the
//! memory tier.

use std::collections::{HashMap, VecDeque};
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Result alias for cache operations.
pub type CacheResult<T> = Result<T, CacheError>;

/// Errors surfaced by the disk tier.
#[derive(Debug, Error)]
pub enum CacheError {
    /// Filesystem failure.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Entry serialization failure.
    #[error(transparent)]
    Serde(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CacheRecord {
    key: String,
    response: String,
    created_at: DateTime<Utc>,
}

impl CacheRecord {
    fn is_live(&self, ttl: Duration, now: DateTime<Utc>) -> bool {
        let age = now.signed_duration_since(self.created_at);
        age.to_std().map_or(true, |age| age < ttl)
    }
}

struct MemoryInner {
    entries: HashMap<String, CacheRecord>,
    order: VecDeque<String>,
}

/// Bounded in-memory LRU tier.
pub struct MemoryCache {
    capacity: NonZeroUsize,
    ttl: Duration,
    inner: StdMutex<MemoryInner>,
}

impl MemoryCache {
    /// Creates a cache with the supplied capacity and entry TTL.
    #[must_use]
    pub fn new(capacity: NonZeroUsize, ttl: Duration) -> Self {
        Self {
            capacity,
            ttl,
            inner: StdMutex::new(MemoryInner {
                entries: HashMap::new(),
                order: VecDeque::new(),
            }),
        }
    }

    /// Returns the cached response when present and within TTL. A hit counts
    /// as a use and refreshes the entry's LRU position.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<String> {
        let mut inner = self.inner.lock().expect("memory cache lock poisoned");
        let record = inner.entries.get(key)?.clone();
        if !record.is_live(self.ttl, Utc::now()) {
            inner.entries.remove(key);
            inner.order.retain(|existing| existing != key);
            return None;
        }
        inner.order.retain(|existing| existing != key);
        inner.order.push_back(key.to_owned());
        Some(record.response)
    }

    /// Inserts a response, evicting the least recently used entries over
    /// capacity.
    pub fn put(&self, key: impl Into<String>, response: impl Into<String>) {
        let key = key.into();
        let mut inner = self.inner.lock().expect("memory cache lock poisoned");
        inner.order.retain(|existing| existing != &key);
        inner.order.push_back(key.clone());
        inner.entries.insert(
            key.clone(),
            CacheRecord {
                key,
                response: response.into(),
                created_at: Utc::now(),
            },
        );
        while inner.order.len() > self.capacity.get() {
            if let Some(evicted) = inner.order.pop_front() {
                inner.entries.remove(&evicted);
            }
        }
    }

    /// Drops expired entries; opportunistic cleanup also happens on lookups.
    pub fn purge_expired(&self) {
        let now = Utc::now();
        let mut guard = self.inner.lock().expect("memory cache lock poisoned");
        let inner = &mut *guard;
        let ttl = self.ttl;
        inner.entries.retain(|_, record| record.is_live(ttl, now));
        let entries = &inner.entries;
        inner.order.retain(|key| entries.contains_key(key));
    }

    /// Returns the number of cached entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .expect("memory cache lock poisoned")
            .entries
            .len()
    }

    /// Returns `true` when the cache is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Durable ndjson tier with a lazily loaded index.
pub struct DiskCache {
    path: PathBuf,
    ttl: Duration,
    index: Mutex<Option<HashMap<String, CacheRecord>>>,
}

impl DiskCache {
    /// Creates a disk tier at the supplied path. The file is opened lazily
    /// on first use.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>, ttl: Duration) -> Self {
        Self {
            path: path.into(),
            ttl,
            index: Mutex::new(None),
        }
    }

    /// Returns the backing file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn load_index(&self) -> CacheResult<HashMap<String, CacheRecord>> {
        let mut index = HashMap::new();
        let data = match fs::read(&self.path).await {
            Ok(data) => data,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(index),
            Err(err) => return Err(err.into()),
        };
        for chunk in data
            .split(|byte| *byte == b'\n')
            .filter(|chunk| !chunk.is_empty())
        {
            match serde_json::from_slice::<CacheRecord>(chunk) {
                Ok(record) => {
                    index.insert(record.key.clone(), record);
                }
                Err(err) => warn!(error = %err, "corrupt disk cache line skipped"),
            }
        }
        debug!(entries = index.len(), path = %self.path.display(), "disk cache index loaded");
        Ok(index)
    }

    /// Looks a key up, loading the index on first use.
    ///
    /// # Errors
    ///
    /// Propagates filesystem errors.
    pub async fn get(&self, key: &str) -> CacheResult<Option<String>> {
        let mut guard = self.index.lock().await;
        if guard.is_none() {
            *guard = Some(self.load_index().await?);
        }
        let index = guard.as_ref().expect("index loaded above");
        Ok(index
            .get(key)
            .filter(|record| record.is_live(self.ttl, Utc::now()))
            .map(|record| record.response.clone()))
    }

    /// Appends an entry and updates the index.
    ///
    /// # Errors
    ///
    /// Propagates filesystem and serialization errors.
    pub async fn put(&self, key: impl Into<String>, response: impl Into<String>) -> CacheResult<()> {
        let record = CacheRecord {
            key: key.into(),
            response: response.into(),
            created_at: Utc::now(),
        };

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let line = serde_json::to_vec(&record)?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(&line).await?;
        file.write_u8(b'\n').await?;
        file.flush().await?;

        let mut guard = self.index.lock().await;
        if let Some(index) = guard.as_mut() {
            index.insert(record.key.clone(), record);
        }
        Ok(())
    }

    /// Rewrites the file keeping only live, latest entries.
    ///
    /// # Errors
    ///
    /// Propagates filesystem and serialization errors.
    pub async fn compact(&self) -> CacheResult<()> {
        let mut guard = self.index.lock().await;
        if guard.is_none() {
            *guard = Some(self.load_index().await?);
        }
        let index = guard.as_mut().expect("index loaded above");
        let now = Utc::now();
        index.retain(|_, record| record.is_live(self.ttl, now));

        let mut contents = Vec::new();
        for record in index.values() {
            contents.extend_from_slice(&serde_json::to_vec(record)?);
            contents.push(b'\n');
        }
        fs::write(&self.path, contents).await?;
        Ok(())
    }
}

/// Facade over both tiers.
///
/// Writes go through to both; reads prefer memory and promote disk hits, so
/// the disk stays a superset of memory at rest.
pub struct LlmCache {
    memory: MemoryCache,
    disk: Option<DiskCache>,
}

impl LlmCache {
    /// Creates a cache with the given memory tier and optional disk tier.
    #[must_use]
    pub fn new(memory: MemoryCache, disk: Option<DiskCache>) -> Self {
        Self { memory, disk }
    }

    /// Looks a key up in memory, then on disk.
    pub async fn get(&self, key: &str) -> Option<String> {
        if let Some(hit) = self.memory.get(key) {
            return Some(hit);
        }
        let disk = self.disk.as_ref()?;
        match disk.get(key).await {
            Ok(Some(hit)) => {
                self.memory.put(key, hit.clone());
                Some(hit)
            }
            Ok(None) => None,
            Err(err) => {
                warn!(error = %err, "disk cache lookup failed");
                None
            }
        }
    }

    /// Writes an entry through both tiers.
    pub async fn put(&self, key: &str, response: &str) {
        self.memory.put(key, response);
        if let Some(disk) = &self.disk {
            if let Err(err) = disk.put(key, response).await {
                warn!(error = %err, "disk cache write failed");
            }
        }
    }

    /// Returns the number of entries in the memory tier.
    #[must_use]
    pub fn memory_len(&self) -> usize {
        self.memory.len()
    }

    /// Runs periodic maintenance on both tiers.
    pub async fn purge_expired(&self) {
        self.memory.purge_expired();
        if let Some(disk) = &self.disk {
            if let Err(err) = disk.compact().await {
                warn!(error = %err, "disk cache compaction failed");
            }
        }
    }
}
