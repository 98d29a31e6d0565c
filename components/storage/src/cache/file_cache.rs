// Copyright 2024 tsumiki
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Read-through block cache backed by local disk.
//!
//! On miss the caller's fetch runs against the remote store and the
//! result is inserted, unless the backing volume is under pressure, in
//! which case the read is served once from the fetch and nothing is
//! cached. The index is persisted so a restart keeps the working set;
//! entries whose backing file disappeared are discarded on load instead
//! of trusted blindly.

use std::{
    future::Future,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use bytes::Bytes;
use dashmap::{DashMap, DashSet};
use scopeguard::defer;
use serde::{Deserialize, Serialize};
use snafu::ResultExt;
use tokio::select;
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, warn};
use tsumiki_common::{DEFAULT_CACHE_CAPACITY, DEFAULT_MIN_FREE_RATIO};
use tsumiki_utils::{disk_usage::get_disk_usage, readable_size::ReadableSize, runtime};

use super::{CacheCounters, CacheKey, CacheStats};
use crate::err::{CapacityExceededSnafu, IndexCodecSnafu, Result, UnknownIOSnafu};

const INDEX_FILE: &str = "index.json";
const BLOCK_DIR: &str = "blocks";

pub struct FileCacheBuilder {
    pub cache_dir: PathBuf,
    pub capacity: ReadableSize,
    pub min_free_ratio: f32,
    pub evict_metadata: bool,
    pub persist_interval: Duration,
}

impl FileCacheBuilder {
    pub fn new<P: AsRef<Path>>(cache_dir: P) -> Self {
        Self {
            cache_dir: cache_dir.as_ref().to_path_buf(),
            capacity: ReadableSize(DEFAULT_CACHE_CAPACITY),
            min_free_ratio: DEFAULT_MIN_FREE_RATIO,
            evict_metadata: false,
            persist_interval: Duration::from_secs(5),
        }
    }

    pub fn with_capacity(mut self, capacity: ReadableSize) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn with_min_free_ratio(mut self, ratio: f32) -> Self {
        self.min_free_ratio = ratio;
        self
    }

    pub fn with_evict_metadata(mut self, evict: bool) -> Self {
        self.evict_metadata = evict;
        self
    }

    pub fn build(self) -> Result<FileCacheRef> {
        let block_dir = self.cache_dir.join(BLOCK_DIR);
        std::fs::create_dir_all(&block_dir).context(UnknownIOSnafu)?;

        let inner = Arc::new(Inner {
            root: self.cache_dir,
            capacity: self.capacity.as_bytes(),
            min_free_ratio: self.min_free_ratio,
            evict_metadata: AtomicBool::new(self.evict_metadata),
            index: DashMap::new(),
            pending: DashSet::new(),
            used: AtomicU64::new(0),
            counters: CacheCounters::default(),
            dirty: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            tracker: TaskTracker::new(),
        });
        inner.recover()?;

        let maintainer = Maintainer {
            inner: inner.clone(),
            interval: self.persist_interval,
        };
        inner.tracker.spawn_on(maintainer.run(), &runtime::handle());
        inner.tracker.close();

        Ok(Arc::new(FileCache(inner)))
    }
}

pub type FileCacheRef = Arc<FileCache>;

pub struct FileCache(Arc<Inner>);

struct CacheEntry {
    file_name: String,
    size: u64,
    last_access: AtomicU64,
    is_metadata: bool,
}

#[derive(Debug, Serialize, Deserialize)]
struct IndexRecord {
    key: String,
    block: u32,
    file: String,
    size: u64,
    last_access: u64,
    is_metadata: bool,
}

struct Inner {
    root: PathBuf,
    capacity: u64,
    min_free_ratio: f32,
    /// Whether index/mark blocks are eviction-eligible. Reloadable at
    /// runtime; affects future eviction decisions only.
    evict_metadata: AtomicBool,
    index: DashMap<CacheKey, Arc<CacheEntry>>,
    pending: DashSet<CacheKey>,
    used: AtomicU64,
    counters: CacheCounters,
    dirty: AtomicBool,
    cancel: CancellationToken,
    tracker: TaskTracker,
}

impl FileCache {
    /// Serve a block from local disk, or `None` on miss.
    pub async fn get(&self, key: &CacheKey) -> Option<Bytes> {
        let entry = self.0.index.get(key).map(|e| e.value().clone())?;
        let path = self.0.block_path(&entry.file_name);
        match tokio::fs::read(&path).await {
            Ok(data) if data.len() as u64 == entry.size => {
                entry.last_access.store(unix_nanos(), Ordering::Release);
                self.0.counters.record_hit();
                Some(Bytes::from(data))
            }
            other => {
                if let Err(e) = other {
                    warn!("cached block {:?} unreadable: {}, dropping it", path, e);
                }
                self.0.drop_entry(key);
                None
            }
        }
    }

    /// Read-through: a hit costs zero remote calls; a miss runs `fetch`
    /// and inserts the result unless the volume is under pressure.
    pub async fn get_or_fetch<F, Fut>(
        &self,
        key: CacheKey,
        is_metadata: bool,
        fetch: F,
    ) -> Result<Bytes>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Bytes>>,
    {
        if let Some(data) = self.get(&key).await {
            return Ok(data);
        }
        self.0.counters.record_miss();
        let data = fetch().await?;
        self.insert(key, is_metadata, data.clone()).await;
        Ok(data)
    }

    /// Best-effort insertion. Returns whether the block was cached;
    /// a skip is never an error for the surrounding read.
    pub async fn insert(&self, key: CacheKey, is_metadata: bool, data: Bytes) -> bool {
        if self.0.index.contains_key(&key) {
            return false;
        }
        if !self.0.pending.insert(key.clone()) {
            // another task is already writing this block
            return false;
        }
        let pending = key.clone();
        defer!(self.0.pending.remove(&pending););

        let size = data.len() as u64;
        if let Err(e) = self.0.reserve_room(size).await {
            // pressure degrades to no-cache, never to a failed read
            self.0.counters.record_skip();
            debug!("skipping cache insert of {:?}: {}", key, e);
            return false;
        }

        let file_name = key.file_name();
        let path = self.0.block_path(&file_name);
        if let Err(e) = tokio::fs::write(&path, &data).await {
            warn!("failed to write cache block {:?}: {}", path, e);
            self.0.used.fetch_sub(size, Ordering::AcqRel);
            self.0.counters.record_skip();
            return false;
        }

        self.0.index.insert(
            key,
            Arc::new(CacheEntry {
                file_name,
                size,
                last_access: AtomicU64::new(unix_nanos()),
                is_metadata,
            }),
        );
        self.0.dirty.store(true, Ordering::Release);
        true
    }

    /// Drop every cached block of one remote object, e.g. after the
    /// object was deleted.
    pub async fn remove_object(&self, object_key: &str) {
        let stale: Vec<CacheKey> = self
            .0
            .index
            .iter()
            .filter(|e| e.key().key == object_key)
            .map(|e| e.key().clone())
            .collect();
        for key in stale {
            if let Some((_, entry)) = self.0.index.remove(&key) {
                self.0.used.fetch_sub(entry.size, Ordering::AcqRel);
                let path = self.0.block_path(&entry.file_name);
                if let Err(e) = tokio::fs::remove_file(&path).await {
                    warn!("failed to remove cache block {:?}: {}", path, e);
                }
            }
        }
        self.0.dirty.store(true, Ordering::Release);
    }

    /// Runtime-reloadable eviction exemption for index/mark blocks.
    pub fn set_evict_metadata(&self, evict: bool) {
        self.0.evict_metadata.store(evict, Ordering::Release);
    }

    pub fn stats(&self) -> CacheStats { self.0.counters.snapshot() }

    pub fn used_bytes(&self) -> u64 { self.0.used.load(Ordering::Acquire) }

    pub fn entry_count(&self) -> usize { self.0.index.len() }

    /// Persist the index and stop background maintenance.
    pub async fn close(&self) {
        self.0.cancel.cancel();
        self.0.tracker.wait().await;
        if let Err(e) = self.0.persist() {
            warn!("failed to persist cache index on close: {}", e);
        }
    }
}

impl Inner {
    fn block_path(&self, file_name: &str) -> PathBuf { self.root.join(BLOCK_DIR).join(file_name) }

    fn drop_entry(&self, key: &CacheKey) {
        if let Some((_, entry)) = self.index.remove(key) {
            self.used.fetch_sub(entry.size, Ordering::AcqRel);
            self.dirty.store(true, Ordering::Release);
        }
    }

    /// Pressure guard plus capacity enforcement. Never suspends on a
    /// full cache: if eviction cannot make room the insert is refused.
    ///
    /// The block's size is charged to `used` up front, so two racing
    /// inserts cannot both conclude the last slot is theirs; a refusal
    /// gives the charge back.
    async fn reserve_room(&self, size: u64) -> Result<()> {
        if let Some(usage) = get_disk_usage(&self.root) {
            let free_after = usage.free.saturating_sub(size);
            let ratio = if usage.total == 0 {
                0.0
            } else {
                free_after as f32 / usage.total as f32
            };
            if ratio < self.min_free_ratio {
                return CapacityExceededSnafu {
                    dir: self.root.display().to_string(),
                }
                .fail();
            }
        }
        self.used.fetch_add(size, Ordering::AcqRel);
        while self.used.load(Ordering::Acquire) > self.capacity {
            if !self.evict_one().await {
                self.used.fetch_sub(size, Ordering::AcqRel);
                return CapacityExceededSnafu {
                    dir: self.root.display().to_string(),
                }
                .fail();
            }
        }
        Ok(())
    }

    /// Evict the least-recently-used eligible block.
    async fn evict_one(&self) -> bool {
        let evict_metadata = self.evict_metadata.load(Ordering::Acquire);
        let mut victim: Option<(CacheKey, Arc<CacheEntry>)> = None;
        for e in self.index.iter() {
            if e.value().is_metadata && !evict_metadata {
                continue;
            }
            let candidate_access = e.value().last_access.load(Ordering::Acquire);
            match &victim {
                Some((_, v)) if v.last_access.load(Ordering::Acquire) <= candidate_access => {}
                _ => victim = Some((e.key().clone(), e.value().clone())),
            }
        }
        let Some((key, entry)) = victim else {
            return false;
        };
        if self.index.remove(&key).is_none() {
            // raced with another evictor; count it as progress
            return true;
        }
        self.used.fetch_sub(entry.size, Ordering::AcqRel);
        self.counters.record_evicted(entry.size);
        self.dirty.store(true, Ordering::Release);
        let path = self.block_path(&entry.file_name);
        if let Err(e) = tokio::fs::remove_file(&path).await {
            warn!("failed to remove evicted block {:?}: {}", path, e);
        }
        debug!("evicted {:?} ({} bytes)", key, entry.size);
        true
    }

    /// Give space back to a constrained volume by shrinking the cache,
    /// so local disk pressure heals without waiting for inserts.
    async fn relieve_pressure(&self) {
        loop {
            let under_pressure = get_disk_usage(&self.root)
                .map(|usage| usage.free_ratio() < self.min_free_ratio)
                .unwrap_or(false);
            if !under_pressure || !self.evict_one().await {
                return;
            }
        }
    }

    fn persist(&self) -> Result<()> {
        let records: Vec<IndexRecord> = self
            .index
            .iter()
            .map(|e| IndexRecord {
                key: e.key().key.clone(),
                block: e.key().block,
                file: e.value().file_name.clone(),
                size: e.value().size,
                last_access: e.value().last_access.load(Ordering::Acquire),
                is_metadata: e.value().is_metadata,
            })
            .collect();
        let data = serde_json::to_vec(&records).context(IndexCodecSnafu)?;
        let tmp = self.root.join(format!("{}.tmp", INDEX_FILE));
        std::fs::write(&tmp, data).context(UnknownIOSnafu)?;
        std::fs::rename(&tmp, self.root.join(INDEX_FILE)).context(UnknownIOSnafu)?;
        Ok(())
    }

    /// Reload the durable index, keeping only entries whose backing
    /// file is still present with the recorded size.
    fn recover(&self) -> Result<()> {
        let path = self.root.join(INDEX_FILE);
        let data = match std::fs::read(&path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e).context(UnknownIOSnafu),
        };
        let records: Vec<IndexRecord> = match serde_json::from_slice(&data) {
            Ok(records) => records,
            Err(e) => {
                warn!("cache index {:?} unreadable ({}), starting empty", path, e);
                return Ok(());
            }
        };

        let mut kept = 0usize;
        let mut discarded = 0usize;
        for record in records {
            let block_path = self.block_path(&record.file);
            match std::fs::metadata(&block_path) {
                Ok(meta) if meta.len() == record.size => {
                    self.index.insert(
                        CacheKey::new(record.key, record.block),
                        Arc::new(CacheEntry {
                            file_name: record.file,
                            size: record.size,
                            last_access: AtomicU64::new(record.last_access),
                            is_metadata: record.is_metadata,
                        }),
                    );
                    self.used.fetch_add(record.size, Ordering::AcqRel);
                    kept += 1;
                }
                _ => {
                    discarded += 1;
                    let _ = std::fs::remove_file(&block_path);
                }
            }
        }
        debug!(
            "recovered cache index from {:?}: {} kept, {} discarded",
            self.root, kept, discarded
        );
        Ok(())
    }
}

/// Periodically flushes the index so a crash loses little of it.
struct Maintainer {
    inner: Arc<Inner>,
    interval: Duration,
}

impl Maintainer {
    async fn run(self) {
        let mut tick = tokio::time::interval(self.interval);
        loop {
            select! {
                _ = self.inner.cancel.cancelled() => {
                    debug!("cache maintainer stopped");
                    return;
                }
                _ = tick.tick() => {
                    self.inner.relieve_pressure().await;
                    if self.inner.dirty.swap(false, Ordering::AcqRel) {
                        if let Err(e) = self.inner.persist() {
                            warn!("failed to persist cache index: {}", e);
                        }
                    }
                }
            }
        }
    }
}

fn unix_nanos() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}
