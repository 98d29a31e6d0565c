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

use std::sync::atomic::{AtomicU64, Ordering};

use crate::Verb;

/// Request counters for one disk's client, consumed by the external
/// metrics subsystem. Cheap enough to update on every call.
#[derive(Debug, Default)]
pub struct ClientMetrics {
    puts: AtomicU64,
    gets: AtomicU64,
    heads: AtomicU64,
    lists: AtomicU64,
    deletes: AtomicU64,
    deletes_suppressed: AtomicU64,
    multipart_created: AtomicU64,
    parts_uploaded: AtomicU64,
    multipart_completed: AtomicU64,
    multipart_aborted: AtomicU64,
    retries: AtomicU64,
    bytes_uploaded: AtomicU64,
    bytes_downloaded: AtomicU64,
}

impl ClientMetrics {
    pub fn record(&self, verb: Verb) {
        let counter = match verb {
            Verb::Put => &self.puts,
            Verb::Get => &self.gets,
            Verb::Head => &self.heads,
            Verb::List => &self.lists,
            Verb::Delete => &self.deletes,
            Verb::CreateMultipart => &self.multipart_created,
            Verb::UploadPart => &self.parts_uploaded,
            Verb::CompleteMultipart => &self.multipart_completed,
            Verb::AbortMultipart => &self.multipart_aborted,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_retry(&self) { self.retries.fetch_add(1, Ordering::Relaxed); }

    pub fn record_suppressed_delete(&self, keys: u64) {
        self.deletes_suppressed.fetch_add(keys, Ordering::Relaxed);
    }

    pub fn add_bytes_uploaded(&self, n: u64) {
        self.bytes_uploaded.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_bytes_downloaded(&self, n: u64) {
        self.bytes_downloaded.fetch_add(n, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            puts: self.puts.load(Ordering::Relaxed),
            gets: self.gets.load(Ordering::Relaxed),
            heads: self.heads.load(Ordering::Relaxed),
            lists: self.lists.load(Ordering::Relaxed),
            deletes: self.deletes.load(Ordering::Relaxed),
            deletes_suppressed: self.deletes_suppressed.load(Ordering::Relaxed),
            multipart_created: self.multipart_created.load(Ordering::Relaxed),
            parts_uploaded: self.parts_uploaded.load(Ordering::Relaxed),
            multipart_completed: self.multipart_completed.load(Ordering::Relaxed),
            multipart_aborted: self.multipart_aborted.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            bytes_uploaded: self.bytes_uploaded.load(Ordering::Relaxed),
            bytes_downloaded: self.bytes_downloaded.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub puts: u64,
    pub gets: u64,
    pub heads: u64,
    pub lists: u64,
    pub deletes: u64,
    pub deletes_suppressed: u64,
    pub multipart_created: u64,
    pub parts_uploaded: u64,
    pub multipart_completed: u64,
    pub multipart_aborted: u64,
    pub retries: u64,
    pub bytes_uploaded: u64,
    pub bytes_downloaded: u64,
}
