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

//! End-to-end scenarios exercising the whole stack at once: client,
//! retry layer, cache, disk, policy and part lifecycle. The layer-local
//! properties live next to their modules; these tests check the seams.

#[cfg(test)]
mod scenarios {
    use std::sync::Arc;

    use bytes::Bytes;
    use tokio_util::sync::CancellationToken;
    use tsumiki_client::{mem::MemClient, opendal_store::OpendalClient, ErrorKind, RetryConfig, Verb};
    use tsumiki_storage::{
        DiskSettings, FileCacheBuilder, ObjectDisk, PartStore, StoragePolicy, UploadConfig,
    };
    use tsumiki_utils::{logger::install_fmt_log, readable_size::ReadableSize};

    fn small_settings() -> DiskSettings {
        DiskSettings {
            upload: UploadConfig {
                part_size: 1 << 10,
                single_put_threshold: 2 << 10,
                inflight_limit: 2,
            },
            ..Default::default()
        }
    }

    fn payload(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn insert_merge_cached_read_drop() {
        install_fmt_log();
        let mem = Arc::new(MemClient::new());
        let cache_dir = tempfile::tempdir().unwrap();
        let cache = FileCacheBuilder::new(cache_dir.path())
            .with_capacity(ReadableSize::mb(64))
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
        let store = PartStore::new("events", StoragePolicy::single(disk.clone()));

        // two inserts, then a background merge replaces them
        for (name, byte) in [("p_1_1_0", b'a'), ("p_2_2_0", b'b')] {
            let mut writer = store.begin_part(name).unwrap();
            writer
                .write_file("data.bin", Bytes::from(vec![byte; 3 << 10]))
                .await
                .unwrap();
            writer.write_file("count.txt", Bytes::from_static(b"1")).await.unwrap();
            writer.commit().await.unwrap();
        }
        store
            .merge(
                &["p_1_1_0", "p_2_2_0"],
                "p_1_2_1",
                CancellationToken::new(),
                |mut w| async move {
                    let mut merged = vec![b'a'; 3 << 10];
                    merged.extend_from_slice(&[b'b'; 3 << 10]);
                    w.write_file("data.bin", Bytes::from(merged)).await?;
                    w.write_file("count.txt", Bytes::from_static(b"2")).await?;
                    Ok(w)
                },
            )
            .await
            .unwrap();
        assert_eq!(store.active_parts(), vec!["p_1_2_1".to_string()]);

        // first read warms the cache, the second costs zero GETs
        let key = "data/events/p_1_2_1/data.bin";
        let first = disk.read(key).await.unwrap();
        let gets_after_first = disk.metrics().gets;
        let second = disk.read(key).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(disk.metrics().gets, gets_after_first);
        assert_eq!(first.len(), 6 << 10);

        store.drop_table().await.unwrap();
        assert_eq!(mem.object_count(), 0);
        cache.close().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn both_write_paths_round_trip_on_fs_backend() {
        let data_dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(OpendalClient::new_fs(data_dir.path().to_str().unwrap()).unwrap());
        let disk = ObjectDisk::new("fs", backend, RetryConfig::default(), None, small_settings());

        // below the threshold: one PUT
        let small = payload(1 << 10);
        disk.write("data/t/p/small.bin", Bytes::from(small.clone())).await.unwrap();
        // above it: a multipart session
        let large = payload(10 << 10);
        disk.write("data/t/p/large.bin", Bytes::from(large.clone())).await.unwrap();

        assert_eq!(disk.read("data/t/p/small.bin").await.unwrap().as_ref(), &small[..]);
        assert_eq!(disk.read("data/t/p/large.bin").await.unwrap().as_ref(), &large[..]);
        assert_eq!(disk.list("data/t/p/").await.unwrap().len(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn transient_faults_invisible_to_callers() {
        let mem = Arc::new(MemClient::new());
        let retry = RetryConfig {
            base_delay: std::time::Duration::from_millis(1),
            max_delay: std::time::Duration::from_millis(5),
            ..Default::default()
        };
        let disk = ObjectDisk::new("s3", mem.clone(), retry, None, small_settings());

        let data = payload(6 << 10);
        mem.faults.fail_next(Verb::UploadPart, 2, ErrorKind::Transient);
        disk.write("data/t/p/x.bin", Bytes::from(data.clone())).await.unwrap();

        mem.faults.fail_next(Verb::Get, 2, ErrorKind::Transient);
        assert_eq!(disk.read("data/t/p/x.bin").await.unwrap().as_ref(), &data[..]);
        assert!(disk.metrics().retries >= 4);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn peak_memory_tracks_the_inflight_bound() {
        let part_size = 1 << 16;
        for inflight_limit in [1usize, 5, 10] {
            let disk = ObjectDisk::new(
                "s3",
                Arc::new(MemClient::new()),
                RetryConfig::default(),
                None,
                DiskSettings {
                    upload: UploadConfig {
                        part_size,
                        single_put_threshold: part_size,
                        inflight_limit,
                    },
                    ..Default::default()
                },
            );
            let mut writer = disk.writer("k").await;
            let data = payload(part_size * 40);
            for chunk in data.chunks(8 << 10) {
                writer.write(chunk).await.unwrap();
            }
            let (meta, stats) = writer.finish().await.unwrap();
            assert_eq!(meta.size, data.len() as u64);

            // the producer's partial part rides on top of the in-flight ones
            let bound = (inflight_limit + 1) * part_size;
            assert!(
                stats.peak_buffered <= bound + part_size,
                "limit {}: peak {} above bound {}",
                inflight_limit,
                stats.peak_buffered,
                bound
            );
            assert!(stats.peak_buffered >= part_size);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn cache_survives_process_restart() {
        let mem = Arc::new(MemClient::new());
        let cache_dir = tempfile::tempdir().unwrap();
        let data = payload(2 << 10);

        {
            let cache = FileCacheBuilder::new(cache_dir.path())
                .with_capacity(ReadableSize::mb(8))
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
            disk.write("data/t/p/x.bin", Bytes::from(data.clone())).await.unwrap();
            disk.read("data/t/p/x.bin").await.unwrap();
            cache.close().await;
        }

        // a new process: the warmed block still serves without a GET
        let cache = FileCacheBuilder::new(cache_dir.path())
            .with_capacity(ReadableSize::mb(8))
            .with_min_free_ratio(0.0)
            .build()
            .unwrap();
        let disk = ObjectDisk::new(
            "s3",
            mem,
            RetryConfig::default(),
            Some(cache.clone()),
            small_settings(),
        );
        assert_eq!(disk.read("data/t/p/x.bin").await.unwrap().as_ref(), &data[..]);
        assert_eq!(disk.metrics().gets, 0);
        assert_eq!(cache.stats().hits, 1);
        cache.close().await;
    }
}
