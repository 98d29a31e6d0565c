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

//! Part lifecycle over object keys.
//!
//! A part is an immutable set of objects under one key prefix. It
//! becomes durable only when its writer commits; merge, move, drop and
//! freeze each leave the namespace either untouched or fully applied.
//! Remote deletions are advisory: a failed delete is logged, queued and
//! retried by a later cleanup pass, never blocking the logical
//! operation that triggered it.

use std::{fmt, future::Future, sync::Arc};

use bytes::Bytes;
use dashmap::{DashMap, DashSet};
use snafu::ensure;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};
use tsumiki_common::{MetadataVersion, DATA_PREFIX, SHADOW_PREFIX};

use crate::{
    disk::DiskRef,
    err::{
        PartExistsSnafu, PartNotActiveSnafu, PartNotFoundSnafu, Result, UploadAbortedSnafu,
    },
    policy::StoragePolicy,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartState {
    Active,
    Detached,
    Dropped,
    MergedAway,
}

impl fmt::Display for PartState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PartState::Active => "active",
            PartState::Detached => "detached",
            PartState::Dropped => "dropped",
            PartState::MergedAway => "merged-away",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone)]
pub struct FileMeta {
    pub name: String,
    pub size: u64,
}

/// What the catalog needs to know about one durable part. The exact
/// file set per part is decided by the table format, a collaborator;
/// here it is only an enumerable list.
#[derive(Debug, Clone)]
pub struct PartMeta {
    pub name: String,
    pub metadata_version: MetadataVersion,
    pub files: Vec<FileMeta>,
}

struct PartEntry {
    meta: PartMeta,
    state: PartState,
    disk: DiskRef,
}

/// A queued deletion that failed once and waits for the next pass.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CleanupTask {
    disk: String,
    prefix: String,
}

pub struct PartStore {
    inner: Arc<Inner>,
}

struct Inner {
    table: String,
    policy: StoragePolicy,
    parts: DashMap<String, PartEntry>,
    /// Names with a writer open but no committed entry yet.
    creating: DashSet<String>,
    pending_cleanup: DashSet<CleanupTask>,
}

impl PartStore {
    pub fn new(table: impl Into<String>, policy: StoragePolicy) -> Self {
        Self {
            inner: Arc::new(Inner {
                table: table.into(),
                policy,
                parts: DashMap::new(),
                creating: DashSet::new(),
                pending_cleanup: DashSet::new(),
            }),
        }
    }

    pub fn table(&self) -> &str { &self.inner.table }

    pub fn policy(&self) -> &StoragePolicy { &self.inner.policy }

    /// Key prefix of one part's objects.
    pub fn part_prefix(&self, part: &str) -> String {
        format!("{}/{}/{}/", DATA_PREFIX, self.inner.table, part)
    }

    fn shadow_prefix(&self, backup: &str) -> String {
        format!("{}/{}/{}/", SHADOW_PREFIX, backup, self.inner.table)
    }

    pub fn active_parts(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .inner
            .parts
            .iter()
            .filter(|e| e.value().state == PartState::Active)
            .map(|e| e.key().clone())
            .collect();
        names.sort();
        names
    }

    pub fn part_meta(&self, part: &str) -> Result<PartMeta> {
        self.inner
            .parts
            .get(part)
            .map(|e| e.value().meta.clone())
            .ok_or_else(|| PartNotFoundSnafu { part }.build())
    }

    pub fn part_disk(&self, part: &str) -> Result<DiskRef> {
        self.inner
            .parts
            .get(part)
            .map(|e| e.value().disk.clone())
            .ok_or_else(|| PartNotFoundSnafu { part }.build())
    }

    /// Open a writer for a brand-new part on the policy's hot volume.
    /// Nothing is durable, and the part is invisible to the catalog,
    /// until [`PartWriter::commit`] returns.
    pub fn begin_part(&self, part: &str) -> Result<PartWriter> {
        ensure!(
            !self.inner.parts.contains_key(part),
            PartExistsSnafu { part }
        );
        ensure!(self.inner.creating.insert(part.to_string()), PartExistsSnafu { part });
        let disk = self.inner.policy.disk_for_new_part();
        Ok(PartWriter {
            inner: self.inner.clone(),
            name: part.to_string(),
            prefix: self.part_prefix(part),
            disk,
            files: Vec::new(),
            metadata_version: 0,
            finished: false,
        })
    }

    /// Replace `inputs` by the part `build` writes. On any failure,
    /// including cancellation, the inputs stay fully present and the
    /// half-written output objects are removed, so the visible state is
    /// unchanged except for the attempt having cost requests.
    #[instrument(skip(self, cancel, build), fields(table = %self.inner.table))]
    pub async fn merge<F, Fut>(
        &self,
        inputs: &[&str],
        output: &str,
        cancel: CancellationToken,
        build: F,
    ) -> Result<()>
    where
        F: FnOnce(PartWriter) -> Fut,
        Fut: Future<Output = Result<PartWriter>>,
    {
        for input in inputs {
            let entry = self
                .inner
                .parts
                .get(*input)
                .ok_or_else(|| PartNotFoundSnafu { part: *input }.build())?;
            ensure!(
                entry.value().state == PartState::Active,
                PartNotActiveSnafu {
                    part: *input,
                    state: entry.value().state.to_string(),
                }
            );
        }

        let writer = self.begin_part(output)?;
        let disk = writer.disk.clone();
        let prefix = writer.prefix.clone();

        let built = tokio::select! {
            biased;
            _ = cancel.cancelled() => UploadAbortedSnafu {
                key: prefix.clone(),
                reason: "merge cancelled".to_string(),
            }
            .fail(),
            r = build(writer) => r,
        };

        let writer = match built {
            Ok(writer) => writer,
            Err(e) => {
                warn!(
                    "merge into {} failed ({}), abandoning its output objects",
                    output, e
                );
                self.inner.creating.remove(output);
                self.remove_objects(&disk, &prefix).await;
                return Err(e);
            }
        };
        writer.commit().await?;

        // inputs leave the table only after the output is durable
        for input in inputs {
            if let Some(mut entry) = self.inner.parts.get_mut(*input) {
                entry.value_mut().state = PartState::MergedAway;
            }
            let disk = self.part_disk(input)?;
            let prefix = self.part_prefix(input);
            self.remove_objects(&disk, &prefix).await;
        }
        debug!("merged {:?} into {}", inputs, output);
        Ok(())
    }

    pub async fn detach(&self, part: &str) -> Result<()> {
        self.retire(part, PartState::Detached).await
    }

    pub async fn drop_part(&self, part: &str) -> Result<()> {
        self.retire(part, PartState::Dropped).await
    }

    /// Drop every part of the table. Frozen copies under the shadow
    /// namespace are left alone.
    pub async fn drop_table(&self) -> Result<()> {
        let names: Vec<String> = self.inner.parts.iter().map(|e| e.key().clone()).collect();
        for name in names {
            let retired = {
                let mut entry = match self.inner.parts.get_mut(&name) {
                    Some(entry) => entry,
                    None => continue,
                };
                if entry.value().state == PartState::Active {
                    entry.value_mut().state = PartState::Dropped;
                    Some(entry.value().disk.clone())
                } else {
                    None
                }
            };
            if let Some(disk) = retired {
                let prefix = self.part_prefix(&name);
                self.remove_objects(&disk, &prefix).await;
            }
        }
        Ok(())
    }

    /// Copy a part's objects into the backup namespace. The live copy
    /// is untouched and outlives DROP of the table.
    pub async fn freeze(&self, part: &str, backup: &str) -> Result<()> {
        let (disk, state) = {
            let entry = self
                .inner
                .parts
                .get(part)
                .ok_or_else(|| PartNotFoundSnafu { part }.build())?;
            (entry.value().disk.clone(), entry.value().state)
        };
        ensure!(
            state == PartState::Active,
            PartNotActiveSnafu {
                part,
                state: state.to_string(),
            }
        );

        let live = self.part_prefix(part);
        let shadow = format!("{}{}/", self.shadow_prefix(backup), part);
        for object in disk.list(&live).await? {
            let dst = format!("{}{}", shadow, &object.key[live.len()..]);
            if let Err(e) = disk.copy(&object.key, &dst).await {
                warn!(
                    "freeze of {} into {} failed ({}), abandoning the partial copy",
                    part, backup, e
                );
                self.remove_objects(&disk, &shadow).await;
                return Err(e);
            }
        }
        debug!("froze {} into backup {}", part, backup);
        Ok(())
    }

    /// Remove one backup's copies across every disk of the policy.
    pub async fn unfreeze(&self, backup: &str) -> Result<()> {
        let prefix = self.shadow_prefix(backup);
        for disk in self.inner.policy.disks() {
            self.remove_objects(disk, &prefix).await;
        }
        Ok(())
    }

    /// Move a part to another disk: copy every object to the
    /// destination's key space, switch the catalog pointer, then delete
    /// the source copy. The pointer switch is the only visibility
    /// change, so the part is queryable from exactly one disk at every
    /// observable point.
    #[instrument(skip(self), fields(table = %self.inner.table))]
    pub async fn move_part(&self, part: &str, dst_disk: &str) -> Result<()> {
        let dst = self.inner.policy.disk(dst_disk)?;
        let (src, state) = {
            let entry = self
                .inner
                .parts
                .get(part)
                .ok_or_else(|| PartNotFoundSnafu { part }.build())?;
            (entry.value().disk.clone(), entry.value().state)
        };
        ensure!(
            state == PartState::Active,
            PartNotActiveSnafu {
                part,
                state: state.to_string(),
            }
        );
        if src.name() == dst.name() {
            return Ok(());
        }

        let prefix = self.part_prefix(part);
        for object in src.list(&prefix).await? {
            if let Err(e) = src.copy_to(&dst, &object.key).await {
                warn!(
                    "move of {} to {} failed ({}), abandoning the partial copy",
                    part,
                    dst.name(),
                    e
                );
                self.remove_objects(&dst, &prefix).await;
                return Err(e);
            }
        }
        if let Some(mut entry) = self.inner.parts.get_mut(part) {
            entry.value_mut().disk = dst.clone();
        }
        self.remove_objects(&src, &prefix).await;
        debug!("moved {} from {} to {}", part, src.name(), dst.name());
        Ok(())
    }

    /// Retry deletions that failed earlier. Returns how many queued
    /// prefixes were fully cleaned.
    pub async fn cleanup_pass(&self) -> usize {
        let tasks: Vec<CleanupTask> = self.inner.pending_cleanup.iter().map(|t| t.clone()).collect();
        let mut cleaned = 0;
        for task in tasks {
            let disk = match self.inner.policy.disk(&task.disk) {
                Ok(disk) => disk,
                Err(_) => {
                    // the disk left the policy; nothing we can reach
                    self.inner.pending_cleanup.remove(&task);
                    continue;
                }
            };
            if self.try_remove(&disk, &task.prefix).await {
                self.inner.pending_cleanup.remove(&task);
                cleaned += 1;
            }
        }
        cleaned
    }

    pub fn pending_cleanups(&self) -> usize { self.inner.pending_cleanup.len() }

    async fn retire(&self, part: &str, target: PartState) -> Result<()> {
        let disk = {
            let mut entry = self
                .inner
                .parts
                .get_mut(part)
                .ok_or_else(|| PartNotFoundSnafu { part }.build())?;
            ensure!(
                entry.value().state == PartState::Active,
                PartNotActiveSnafu {
                    part,
                    state: entry.value().state.to_string(),
                }
            );
            entry.value_mut().state = target;
            entry.value().disk.clone()
        };
        let prefix = self.part_prefix(part);
        self.remove_objects(&disk, &prefix).await;
        Ok(())
    }

    /// Best-effort deletion of everything under `prefix`. A failure is
    /// queued for [`cleanup_pass`](Self::cleanup_pass) instead of
    /// propagating.
    async fn remove_objects(&self, disk: &DiskRef, prefix: &str) {
        if !self.try_remove(disk, prefix).await {
            self.inner.pending_cleanup.insert(CleanupTask {
                disk: disk.name().to_string(),
                prefix: prefix.to_string(),
            });
        }
    }

    async fn try_remove(&self, disk: &DiskRef, prefix: &str) -> bool {
        let keys = match disk.list(prefix).await {
            Ok(objects) => objects.into_iter().map(|o| o.key).collect::<Vec<_>>(),
            Err(e) => {
                warn!("failed to list {} on {}: {}", prefix, disk.name(), e);
                return false;
            }
        };
        if keys.is_empty() {
            return true;
        }
        match disk.remove(&keys).await {
            Ok(()) => true,
            Err(e) => {
                warn!(
                    "failed to delete {} objects under {} on {}: {}",
                    keys.len(),
                    prefix,
                    disk.name(),
                    e
                );
                false
            }
        }
    }
}

/// Writes the files of one new part. Consumed by `commit` or `abort`;
/// dropping it without either frees the name and queues whatever it
/// wrote for the cleanup pass, never leaving a visible part.
pub struct PartWriter {
    inner: Arc<Inner>,
    name: String,
    prefix: String,
    disk: DiskRef,
    files: Vec<FileMeta>,
    metadata_version: MetadataVersion,
    finished: bool,
}

impl PartWriter {
    pub fn part_name(&self) -> &str { &self.name }

    pub fn disk(&self) -> &DiskRef { &self.disk }

    pub fn set_metadata_version(&mut self, version: MetadataVersion) {
        self.metadata_version = version;
    }

    pub async fn write_file(&mut self, file: &str, data: Bytes) -> Result<()> {
        let key = format!("{}{}", self.prefix, file);
        let meta = self.disk.write(&key, data).await?;
        self.files.push(FileMeta {
            name: file.to_string(),
            size: meta.size,
        });
        Ok(())
    }

    /// Make the part durable and visible. All objects were individually
    /// confirmed by the store before this registers the part.
    pub async fn commit(mut self) -> Result<()> {
        let files = std::mem::take(&mut self.files);
        self.inner.parts.insert(
            self.name.clone(),
            PartEntry {
                meta: PartMeta {
                    name: self.name.clone(),
                    metadata_version: self.metadata_version,
                    files,
                },
                state: PartState::Active,
                disk: self.disk.clone(),
            },
        );
        self.inner.creating.remove(&self.name);
        self.finished = true;
        debug!("committed part {}", self.name);
        Ok(())
    }

    /// Discard the part and best-effort delete whatever it wrote.
    pub async fn abort(mut self) {
        self.finished = true;
        self.inner.creating.remove(&self.name);
        let keys = match self.disk.list(&self.prefix).await {
            Ok(objects) => objects.into_iter().map(|o| o.key).collect::<Vec<_>>(),
            Err(e) => {
                warn!("failed to list aborted part {}: {}", self.name, e);
                self.inner.pending_cleanup.insert(CleanupTask {
                    disk: self.disk.name().to_string(),
                    prefix: self.prefix.clone(),
                });
                return;
            }
        };
        if keys.is_empty() {
            return;
        }
        if let Err(e) = self.disk.remove(&keys).await {
            warn!("failed to delete aborted part {}: {}", self.name, e);
            self.inner.pending_cleanup.insert(CleanupTask {
                disk: self.disk.name().to_string(),
                prefix: self.prefix.clone(),
            });
        }
    }
}

impl Drop for PartWriter {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        // release the name reservation; deletion has to wait for the
        // next cleanup pass since drop cannot block on the store
        self.inner.creating.remove(&self.name);
        if !self.files.is_empty() {
            warn!(
                "writer for part {} dropped before commit, queueing its objects",
                self.name
            );
            self.inner.pending_cleanup.insert(CleanupTask {
                disk: self.disk.name().to_string(),
                prefix: self.prefix.clone(),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use tsumiki_client::{mem::MemClient, ErrorKind, RetryConfig, Verb};

    use super::*;
    use crate::{
        disk::{DiskSettings, ObjectDisk},
        policy::Volume,
        upload::UploadConfig,
    };

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

    fn disk_on(name: &str, mem: Arc<MemClient>, settings: DiskSettings) -> DiskRef {
        // fast retries so fault tests stay quick
        let retry = RetryConfig {
            base_delay: std::time::Duration::from_millis(1),
            max_delay: std::time::Duration::from_millis(5),
            ..Default::default()
        };
        ObjectDisk::new(name, mem, retry, None, settings)
    }

    fn single_disk_store(mem: Arc<MemClient>, settings: DiskSettings) -> PartStore {
        let disk = disk_on("s3", mem, settings);
        PartStore::new("events", StoragePolicy::single(disk))
    }

    async fn make_part(store: &PartStore, name: &str, files: &[(&str, &[u8])]) {
        let mut writer = store.begin_part(name).unwrap();
        for (file, data) in files {
            writer.write_file(file, Bytes::copy_from_slice(data)).await.unwrap();
        }
        writer.commit().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn part_visible_only_after_commit() {
        let mem = Arc::new(MemClient::new());
        let store = single_disk_store(mem.clone(), small_settings());

        let mut writer = store.begin_part("p_1_1_0").unwrap();
        writer.write_file("data.bin", Bytes::from_static(b"rows")).await.unwrap();
        assert!(store.active_parts().is_empty());
        assert!(store.begin_part("p_1_1_0").is_err());

        writer.commit().await.unwrap();
        assert_eq!(store.active_parts(), vec!["p_1_1_0".to_string()]);

        let disk = store.part_disk("p_1_1_0").unwrap();
        let data = disk.read("data/events/p_1_1_0/data.bin").await.unwrap();
        assert_eq!(data.as_ref(), b"rows");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn aborted_part_leaves_nothing() {
        let mem = Arc::new(MemClient::new());
        let store = single_disk_store(mem.clone(), small_settings());

        let mut writer = store.begin_part("p").unwrap();
        writer.write_file("a.bin", Bytes::from_static(b"x")).await.unwrap();
        writer.write_file("b.bin", Bytes::from_static(b"y")).await.unwrap();
        writer.abort().await;

        assert_eq!(mem.object_count(), 0);
        assert!(store.active_parts().is_empty());
        // the name is free again
        assert!(store.begin_part("p").is_ok());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn merge_replaces_inputs_atomically() {
        let mem = Arc::new(MemClient::new());
        let store = single_disk_store(mem.clone(), small_settings());
        make_part(&store, "p_1", &[("data.bin", b"aa")]).await;
        make_part(&store, "p_2", &[("data.bin", b"bb")]).await;

        store
            .merge(&["p_1", "p_2"], "p_1_2", CancellationToken::new(), |mut w| async move {
                w.write_file("data.bin", Bytes::from_static(b"aabb")).await?;
                Ok(w)
            })
            .await
            .unwrap();

        assert_eq!(store.active_parts(), vec!["p_1_2".to_string()]);
        // only the output's objects remain
        assert_eq!(mem.object_count(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn failed_merge_leaves_inputs_and_no_output() {
        let mem = Arc::new(MemClient::new());
        let store = single_disk_store(mem.clone(), small_settings());
        make_part(&store, "p_1", &[("data.bin", b"aa")]).await;
        make_part(&store, "p_2", &[("data.bin", b"bb")]).await;

        // the first output file lands, the second hits a hard fault
        mem.faults.fail_after(Verb::Put, 1, i64::MAX, ErrorKind::Fatal);
        let err = store
            .merge(&["p_1", "p_2"], "p_1_2", CancellationToken::new(), |mut w| async move {
                w.write_file("count.txt", Bytes::from_static(b"2")).await?;
                w.write_file("data.bin", Bytes::from_static(b"aabb")).await?;
                Ok(w)
            })
            .await
            .unwrap_err();
        assert!(!err.is_not_found());
        mem.faults.clear();

        // inputs untouched, queryable, and no dangling output objects
        assert_eq!(store.active_parts(), vec!["p_1".to_string(), "p_2".to_string()]);
        store.cleanup_pass().await;
        let disk = store.part_disk("p_1").unwrap();
        assert!(disk.list("data/events/p_1_2/").await.unwrap().is_empty());
        assert_eq!(mem.object_count(), 2);
        // the output name can be merged into again
        assert!(store.begin_part("p_1_2").is_ok());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn cancelled_merge_is_a_no_op() {
        let mem = Arc::new(MemClient::new());
        let store = single_disk_store(mem.clone(), small_settings());
        make_part(&store, "p_1", &[("data.bin", b"aa")]).await;

        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = store
            .merge(&["p_1"], "p_out", cancel, |w| async move {
                // never reached once the token already fired
                Ok(w)
            })
            .await
            .unwrap_err();
        assert!(matches!(err, crate::err::Error::UploadAborted { .. }));
        assert_eq!(store.active_parts(), vec!["p_1".to_string()]);
        assert_eq!(mem.object_count(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn drop_table_honors_no_delete() {
        for no_delete in [false, true] {
            let mem = Arc::new(MemClient::new());
            let settings = DiskSettings {
                no_delete,
                ..small_settings()
            };
            let store = single_disk_store(mem.clone(), settings);
            make_part(&store, "p_1", &[("data.bin", b"aa"), ("count.txt", b"1")]).await;
            make_part(&store, "p_2", &[("data.bin", b"bb")]).await;

            let before = mem.object_count();
            store.drop_table().await.unwrap();
            assert!(store.active_parts().is_empty());
            let expected = if no_delete { before } else { 0 };
            assert_eq!(mem.object_count(), expected, "no_delete={}", no_delete);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn frozen_copies_survive_drop() {
        let mem = Arc::new(MemClient::new());
        let store = single_disk_store(mem.clone(), small_settings());
        make_part(&store, "p_1", &[("data.bin", b"aa"), ("primary.idx", b"ii")]).await;

        store.freeze("p_1", "backup1").await.unwrap();
        assert_eq!(mem.object_count(), 4);

        store.drop_table().await.unwrap();
        let disk = store.policy().disk("s3").unwrap();
        assert!(disk.list("data/").await.unwrap().is_empty());
        let frozen = disk.list("shadow/backup1/").await.unwrap();
        assert_eq!(frozen.len(), 2);

        store.unfreeze("backup1").await.unwrap();
        assert_eq!(mem.object_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn move_part_lands_on_exactly_one_disk() {
        let mem_a = Arc::new(MemClient::new());
        let mem_b = Arc::new(MemClient::new());
        let policy = StoragePolicy::new(
            "tiered",
            vec![
                Volume::new("hot", vec![disk_on("s3_hot", mem_a.clone(), small_settings())]),
                Volume::new("cold", vec![disk_on("s3_cold", mem_b.clone(), small_settings())]),
            ],
        );
        let store = PartStore::new("events", policy);
        let data: Vec<u8> = (0..(5 << 10)).map(|i| (i % 241) as u8).collect();
        make_part(&store, "p_1", &[("data.bin", &data)]).await;
        assert_eq!(mem_a.object_count(), 1);

        store.move_part("p_1", "s3_cold").await.unwrap();
        assert_eq!(mem_a.object_count(), 0);
        assert_eq!(mem_b.object_count(), 1);
        assert_eq!(store.part_disk("p_1").unwrap().name(), "s3_cold");

        let disk = store.part_disk("p_1").unwrap();
        let read = disk.read("data/events/p_1/data.bin").await.unwrap();
        assert_eq!(read.as_ref(), &data[..]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn failed_move_leaves_no_destination_leftovers() {
        let mem_a = Arc::new(MemClient::new());
        let mem_b = Arc::new(MemClient::new());
        let policy = StoragePolicy::new(
            "tiered",
            vec![
                Volume::new("hot", vec![disk_on("s3_hot", mem_a.clone(), small_settings())]),
                Volume::new("cold", vec![disk_on("s3_cold", mem_b.clone(), small_settings())]),
            ],
        );
        let store = PartStore::new("events", policy);
        make_part(&store, "p_1", &[("data.bin", b"rows"), ("primary.idx", b"ii")]).await;

        // the first copy lands on the destination, the second does not
        mem_b.faults.fail_after(Verb::Put, 1, i64::MAX, ErrorKind::Fatal);
        let err = store.move_part("p_1", "s3_cold").await.unwrap_err();
        assert!(!err.is_not_found());
        mem_b.faults.clear();

        // the part still reads from the source, the destination is clean
        assert_eq!(store.part_disk("p_1").unwrap().name(), "s3_hot");
        assert_eq!(mem_a.object_count(), 2);
        assert_eq!(mem_b.object_count(), 0);

        store.move_part("p_1", "s3_cold").await.unwrap();
        assert_eq!(mem_a.object_count(), 0);
        assert_eq!(mem_b.object_count(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn failed_freeze_leaves_no_shadow_leftovers() {
        let mem = Arc::new(MemClient::new());
        let store = single_disk_store(mem.clone(), small_settings());
        make_part(&store, "p_1", &[("data.bin", b"aa"), ("primary.idx", b"ii")]).await;

        mem.faults.fail_after(Verb::Put, 1, i64::MAX, ErrorKind::Fatal);
        store.freeze("p_1", "backup1").await.unwrap_err();
        mem.faults.clear();

        let disk = store.policy().disk("s3").unwrap();
        assert!(disk.list("shadow/").await.unwrap().is_empty());
        assert_eq!(mem.object_count(), 2);

        store.freeze("p_1", "backup1").await.unwrap();
        assert_eq!(disk.list("shadow/backup1/").await.unwrap().len(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn dropped_writer_frees_name_and_queues_cleanup() {
        let mem = Arc::new(MemClient::new());
        let store = single_disk_store(mem.clone(), small_settings());

        let mut writer = store.begin_part("p").unwrap();
        writer.write_file("data.bin", Bytes::from_static(b"x")).await.unwrap();
        drop(writer);

        assert!(store.active_parts().is_empty());
        assert_eq!(store.pending_cleanups(), 1);
        assert_eq!(mem.object_count(), 1);

        assert_eq!(store.cleanup_pass().await, 1);
        assert_eq!(mem.object_count(), 0);
        // the reservation died with the writer
        assert!(store.begin_part("p").is_ok());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn failed_delete_is_retried_by_cleanup_pass() {
        let mem = Arc::new(MemClient::new());
        let store = single_disk_store(mem.clone(), small_settings());
        make_part(&store, "p_1", &[("data.bin", b"aa")]).await;

        mem.faults.fail_next(Verb::Delete, i64::MAX, ErrorKind::Fatal);
        // the drop itself succeeds; the deletion is deferred
        store.drop_part("p_1").await.unwrap();
        assert!(store.active_parts().is_empty());
        assert_eq!(store.pending_cleanups(), 1);
        assert_eq!(mem.object_count(), 1);

        mem.faults.clear();
        assert_eq!(store.cleanup_pass().await, 1);
        assert_eq!(store.pending_cleanups(), 0);
        assert_eq!(mem.object_count(), 0);
    }
}
