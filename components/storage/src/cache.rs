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

pub mod file_cache;

use std::sync::atomic::{AtomicU64, Ordering};

pub use file_cache::{FileCache, FileCacheBuilder, FileCacheRef};

/// One cacheable unit: an aligned block of one remote object.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub key: String,
    pub block: u32,
}

impl CacheKey {
    pub fn new(key: impl Into<String>, block: u32) -> Self {
        Self {
            key: key.into(),
            block,
        }
    }

    /// Stable file name for the block on the cache volume.
    pub(crate) fn file_name(&self) -> String {
        format!("{}#{}", self.key.replace('/', "%2F"), self.block)
    }
}

#[derive(Debug, Default)]
pub struct CacheCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    insertions_skipped: AtomicU64,
    evicted_bytes: AtomicU64,
}

impl CacheCounters {
    pub fn record_hit(&self) { self.hits.fetch_add(1, Ordering::Relaxed); }

    pub fn record_miss(&self) { self.misses.fetch_add(1, Ordering::Relaxed); }

    pub fn record_skip(&self) { self.insertions_skipped.fetch_add(1, Ordering::Relaxed); }

    pub fn record_evicted(&self, bytes: u64) {
        self.evicted_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            insertions_skipped: self.insertions_skipped.load(Ordering::Relaxed),
            evicted_bytes: self.evicted_bytes.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    /// Reads that succeeded but were not cached because the backing
    /// volume was under pressure.
    pub insertions_skipped: u64,
    pub evicted_bytes: u64,
}
