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

//! One named disk backed by a remote object store.
//!
//! A disk owns its retrying client, an optional local block cache and a
//! settings block that can be swapped at runtime without touching
//! in-flight operations: running uploads keep the part size they
//! started with, only new writers see the new values.

use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use snafu::ResultExt;
use tokio::sync::RwLock;
use tracing::debug;
use tsumiki_client::{ClientRef, MetricsSnapshot, ObjectMeta, RetryClient, RetryConfig};

use crate::{
    cache::FileCacheRef,
    err::{ClientSnafu, Result},
    file::{RemoteFileReader, RemoteFileWriter},
    upload::UploadConfig,
};

fn default_true() -> bool { true }

/// Runtime-reloadable knobs of one disk. Everything here may change
/// between queries; nothing here requires a restart.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DiskSettings {
    #[serde(default)]
    pub upload: UploadConfig,
    /// Suppress remote deletes, turning the store into an append-only
    /// target that keeps dropped data.
    #[serde(default)]
    pub no_delete: bool,
    /// Whether cached index and mark blocks may be evicted.
    #[serde(default = "default_true")]
    pub evict_metadata: bool,
}

impl Default for DiskSettings {
    fn default() -> Self {
        Self {
            upload: UploadConfig::default(),
            no_delete: false,
            evict_metadata: true,
        }
    }
}

pub type DiskRef = Arc<ObjectDisk>;

pub struct ObjectDisk {
    name: String,
    client: Arc<RetryClient>,
    cache: Option<FileCacheRef>,
    settings: RwLock<DiskSettings>,
}

impl ObjectDisk {
    pub fn new(
        name: impl Into<String>,
        backend: ClientRef,
        retry: RetryConfig,
        cache: Option<FileCacheRef>,
        settings: DiskSettings,
    ) -> DiskRef {
        let client = Arc::new(RetryClient::new(backend, retry));
        client.set_no_delete(settings.no_delete);
        if let Some(cache) = &cache {
            cache.set_evict_metadata(settings.evict_metadata);
        }
        Arc::new(Self {
            name: name.into(),
            client,
            cache,
            settings: RwLock::new(settings),
        })
    }

    pub fn name(&self) -> &str { &self.name }

    pub fn cache(&self) -> Option<&FileCacheRef> { self.cache.as_ref() }

    pub fn metrics(&self) -> MetricsSnapshot { self.client.metrics().snapshot() }

    /// Swap the settings block. Applies immediately to the delete path
    /// and the cache; upload knobs apply to writers opened afterwards.
    pub async fn reload_settings(&self, settings: DiskSettings) {
        self.client.set_no_delete(settings.no_delete);
        if let Some(cache) = &self.cache {
            cache.set_evict_metadata(settings.evict_metadata);
        }
        debug!("disk {} settings reloaded", self.name);
        *self.settings.write().await = settings;
    }

    pub async fn settings(&self) -> DiskSettings { self.settings.read().await.clone() }

    pub async fn writer(&self, key: &str) -> RemoteFileWriter {
        let upload = self.settings.read().await.upload.clone();
        RemoteFileWriter::new(self.client.clone(), key, upload)
    }

    pub async fn reader(&self, key: &str) -> Result<RemoteFileReader> {
        RemoteFileReader::open(self.client.clone(), key, self.cache.clone()).await
    }

    pub async fn write(&self, key: &str, data: Bytes) -> Result<ObjectMeta> {
        let mut writer = self.writer(key).await;
        if let Err(e) = writer.write(&data).await {
            writer.abort().await;
            return Err(e);
        }
        let (meta, _) = writer.finish().await?;
        Ok(meta)
    }

    pub async fn read(&self, key: &str) -> Result<Bytes> {
        let mut reader = self.reader(key).await?;
        reader.read_to_end().await
    }

    pub async fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>> {
        use tsumiki_client::ObjectClient;
        self.client.list(prefix).await.context(ClientSnafu)
    }

    pub async fn exists(&self, key: &str) -> Result<bool> {
        use tsumiki_client::ObjectClient;
        match self.client.head(key).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e).context(ClientSnafu),
        }
    }

    /// Remove objects and purge their cached blocks. In no-delete mode
    /// the remote objects stay; the cache is purged either way so a
    /// later re-create never serves stale blocks.
    pub async fn remove(&self, keys: &[String]) -> Result<()> {
        use tsumiki_client::ObjectClient;
        let results = self.client.delete(keys).await.context(ClientSnafu)?;
        // purge every key that actually left the remote before
        // reporting a failure, so no deleted key keeps stale blocks
        let mut first_err = None;
        for (key, outcome) in results {
            match outcome {
                Ok(()) => {
                    if let Some(cache) = &self.cache {
                        cache.remove_object(&key).await;
                    }
                }
                Err(e) => {
                    if first_err.is_none() {
                        first_err = Some(e);
                    }
                }
            }
        }
        match first_err {
            Some(e) => Err(e).context(ClientSnafu),
            None => Ok(()),
        }
    }

    /// Server-side copy is not part of the store contract, so copy
    /// streams through this process with bounded memory.
    pub async fn copy(&self, src: &str, dst: &str) -> Result<ObjectMeta> {
        let reader = self.reader(src).await?;
        let writer = self.writer(dst).await;
        stream_copy(reader, writer, self.settings.read().await.upload.part_size).await
    }

    /// Copy one object to the same key on another disk, streaming with
    /// bounded memory.
    pub async fn copy_to(&self, dst: &DiskRef, key: &str) -> Result<ObjectMeta> {
        let reader = self.reader(key).await?;
        let writer = dst.writer(key).await;
        stream_copy(reader, writer, dst.settings.read().await.upload.part_size).await
    }
}

async fn stream_copy(
    mut reader: RemoteFileReader,
    mut writer: RemoteFileWriter,
    chunk: usize,
) -> Result<ObjectMeta> {
    loop {
        let data = reader.read(chunk).await?;
        if data.is_empty() {
            break;
        }
        if let Err(e) = writer.write(&data).await {
            writer.abort().await;
            return Err(e);
        }
    }
    let (meta, _) = writer.finish().await?;
    Ok(meta)
}

#[cfg(test)]
mod tests {
    use tsumiki_client::{mem::MemClient, ErrorKind, Verb};
    use tsumiki_utils::readable_size::ReadableSize;

    use super::*;
    use crate::cache::FileCacheBuilder;

    fn disk_with(mem: Arc<MemClient>, settings: DiskSettings) -> DiskRef {
        ObjectDisk::new("s3", mem, RetryConfig::default(), None, settings)
    }

    fn small_settings() -> DiskSettings {
        DiskSettings {
            upload: UploadConfig {
                part_size: 1 << 10,
                single_put_threshold: 1 << 10,
                inflight_limit: 2,
            },
            ..Default::default()
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn write_read_remove() {
        let mem = Arc::new(MemClient::new());
        let disk = disk_with(mem.clone(), small_settings());

        disk.write("data/t/p/x.bin", Bytes::from_static(b"abc")).await.unwrap();
        assert!(disk.exists("data/t/p/x.bin").await.unwrap());
        assert_eq!(disk.read("data/t/p/x.bin").await.unwrap().as_ref(), b"abc");

        disk.remove(&["data/t/p/x.bin".to_string()]).await.unwrap();
        assert!(!disk.exists("data/t/p/x.bin").await.unwrap());
        assert_eq!(mem.object_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn copy_streams_large_objects() {
        let mem = Arc::new(MemClient::new());
        let disk = disk_with(mem, small_settings());
        let data: Vec<u8> = (0..(10 << 10)).map(|i| (i % 233) as u8).collect();

        disk.write("src", Bytes::from(data.clone())).await.unwrap();
        let meta = disk.copy("src", "dst").await.unwrap();
        assert_eq!(meta.size, data.len() as u64);
        assert_eq!(disk.read("dst").await.unwrap().as_ref(), &data[..]);
        // source untouched
        assert_eq!(disk.read("src").await.unwrap().as_ref(), &data[..]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn failed_write_leaves_no_object_or_session() {
        let mem = Arc::new(MemClient::new());
        let disk = disk_with(mem.clone(), small_settings());
        mem.faults.fail_next(Verb::CreateMultipart, i64::MAX, ErrorKind::Fatal);

        let data: Vec<u8> = (0..(3 << 10)).map(|i| (i % 251) as u8).collect();
        disk.write("k", Bytes::from(data)).await.unwrap_err();
        assert_eq!(mem.object_count(), 0);
        assert_eq!(mem.open_session_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn partial_remove_still_purges_deleted_keys() {
        let mem = Arc::new(MemClient::new());
        let dir = tempfile::tempdir().unwrap();
        let cache = FileCacheBuilder::new(dir.path())
            .with_capacity(ReadableSize::mb(1))
            .with_min_free_ratio(0.0)
            .build()
            .unwrap();
        let disk = ObjectDisk::new(
            "s3",
            mem.clone(),
            RetryConfig::default(),
            Some(cache.clone()),
            small_settings(),
        );

        disk.write("a", Bytes::from_static(b"one")).await.unwrap();
        disk.write("b", Bytes::from_static(b"two")).await.unwrap();
        disk.read("a").await.unwrap();
        disk.read("b").await.unwrap();
        assert_eq!(cache.entry_count(), 2);

        // the first key's delete fails, the second one goes through
        mem.faults.fail_next(Verb::Delete, 1, ErrorKind::Fatal);
        disk.remove(&["a".to_string(), "b".to_string()]).await.unwrap_err();
        mem.faults.clear();

        // the deleted key's blocks are gone even though remove errored
        assert_eq!(cache.entry_count(), 1);
        assert_eq!(mem.object_count(), 1);
        assert_eq!(disk.read("a").await.unwrap().as_ref(), b"one");
        cache.close().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn settings_reload_flips_no_delete() {
        let mem = Arc::new(MemClient::new());
        let disk = disk_with(mem.clone(), small_settings());
        disk.write("k", Bytes::from_static(b"v")).await.unwrap();

        let mut settings = disk.settings().await;
        settings.no_delete = true;
        disk.reload_settings(settings).await;

        disk.remove(&["k".to_string()]).await.unwrap();
        // the delete was acknowledged but the object survives
        assert_eq!(mem.object_count(), 1);
        assert_eq!(disk.metrics().deletes_suppressed, 1);
    }
}
