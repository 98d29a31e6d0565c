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

//! Streams one object to the store while bounding memory.
//!
//! Bytes accumulate into fixed-size parts. A full part may only enter
//! flight after acquiring a semaphore permit sized to the in-flight
//! bound, so the producer suspends instead of buffering without limit;
//! peak buffered memory stays within `(in_flight + 1) * part_size` plus
//! the producer's partial buffer.

use std::{
    mem,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use snafu::ResultExt;
use tokio::{sync::Semaphore, task::JoinHandle, time::Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use tsumiki_client::{ClientRef, CompletedPart, ObjectMeta, UploadId};
use tsumiki_common::{DEFAULT_INFLIGHT_PARTS, DEFAULT_SINGLE_PUT_THRESHOLD, DEFAULT_UPLOAD_PART_SIZE};

use crate::err::{ClientSnafu, Result, UploadAbortedSnafu, WriterFinishedSnafu};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UploadConfig {
    pub part_size: usize,
    /// At or below this total size the object is sent as one PUT and no
    /// multipart session is ever opened.
    pub single_put_threshold: usize,
    pub inflight_limit: usize,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            part_size: DEFAULT_UPLOAD_PART_SIZE,
            single_put_threshold: DEFAULT_SINGLE_PUT_THRESHOLD,
            inflight_limit: DEFAULT_INFLIGHT_PARTS,
        }
    }
}

/// What one finished upload cost, for the metrics subsystem and the
/// memory-bound tests.
#[derive(Debug, Clone, Default)]
pub struct UploadStats {
    pub bytes_uploaded: u64,
    pub parts: u32,
    /// Cumulative time the producer spent suspended on the in-flight
    /// bound. Non-zero under load proves backpressure is active.
    pub backpressure_wait: Duration,
    pub peak_buffered: usize,
}

/// Write-once sequential uploader for a single object key.
pub struct PartUploader {
    key: String,
    client: ClientRef,
    config: UploadConfig,
    buf: Vec<u8>,
    written: u64,
    session: Option<UploadId>,
    next_part: u32,
    inflight: Arc<Semaphore>,
    inflight_bytes: Arc<AtomicUsize>,
    peak_buffered: Arc<AtomicUsize>,
    backpressure_wait: Duration,
    tasks: Vec<JoinHandle<Result<CompletedPart>>>,
    cancel: CancellationToken,
    finished: bool,
}

impl PartUploader {
    pub fn new(client: ClientRef, key: impl Into<String>, config: UploadConfig) -> Self {
        let permits = config.inflight_limit.max(1);
        Self {
            key: key.into(),
            client,
            config,
            buf: Vec::new(),
            written: 0,
            session: None,
            next_part: 1,
            inflight: Arc::new(Semaphore::new(permits)),
            inflight_bytes: Arc::new(AtomicUsize::new(0)),
            peak_buffered: Arc::new(AtomicUsize::new(0)),
            backpressure_wait: Duration::ZERO,
            tasks: Vec::new(),
            cancel: CancellationToken::new(),
            finished: false,
        }
    }

    /// A handle that cancels this upload from another task.
    pub fn cancellation_token(&self) -> CancellationToken { self.cancel.clone() }

    pub async fn write(&mut self, data: &[u8]) -> Result<()> {
        if self.finished || self.cancel.is_cancelled() {
            return WriterFinishedSnafu { key: self.key.clone() }.fail();
        }
        self.buf.extend_from_slice(data);
        self.written += data.len() as u64;
        self.note_buffered();

        if self.session.is_none() && self.buf.len() <= self.config.single_put_threshold {
            // still small enough for the single-PUT path
            return Ok(());
        }
        while self.buf.len() >= self.config.part_size {
            let rest = self.buf.split_off(self.config.part_size);
            let part = mem::replace(&mut self.buf, rest);
            self.dispatch_part(Bytes::from(part)).await?;
        }
        Ok(())
    }

    /// Commit the object. Returns its final metadata and the stats of
    /// this upload. On any part failure the whole session is aborted
    /// and no object becomes visible.
    pub async fn finish(mut self) -> Result<(ObjectMeta, UploadStats)> {
        if self.finished || self.cancel.is_cancelled() {
            return WriterFinishedSnafu { key: self.key.clone() }.fail();
        }
        self.finished = true;

        if self.session.is_none() {
            let data = Bytes::from(mem::take(&mut self.buf));
            let size = data.len() as u64;
            let etag = self
                .client
                .put(&self.key, data)
                .await
                .context(ClientSnafu)?;
            return Ok((
                ObjectMeta {
                    key: self.key.clone(),
                    size,
                    etag: Some(etag),
                },
                self.stats(1),
            ));
        }

        if !self.buf.is_empty() {
            let tail = Bytes::from(mem::take(&mut self.buf));
            self.dispatch_part(tail).await?;
        }

        let mut parts = Vec::with_capacity(self.tasks.len());
        let mut first_failure: Option<String> = None;
        for task in mem::take(&mut self.tasks) {
            match task.await {
                Ok(Ok(part)) => parts.push(part),
                Ok(Err(e)) => {
                    first_failure.get_or_insert_with(|| e.to_string());
                }
                Err(join) => {
                    first_failure.get_or_insert_with(|| join.to_string());
                }
            }
        }
        if let Some(reason) = first_failure {
            self.abort_session().await;
            return UploadAbortedSnafu {
                key: self.key.clone(),
                reason,
            }
            .fail();
        }

        // server assembles by part number, not by completion order
        parts.sort_by_key(|p| p.number);
        let session = self.session.clone().unwrap_or_else(|| UploadId(String::new()));
        let etag = match self
            .client
            .complete_multipart(&self.key, &session, &parts)
            .await
        {
            Ok(etag) => etag,
            Err(e) => {
                self.abort_session().await;
                return UploadAbortedSnafu {
                    key: self.key.clone(),
                    reason: e.to_string(),
                }
                .fail();
            }
        };

        let stats = self.stats(parts.len() as u32);
        Ok((
            ObjectMeta {
                key: self.key.clone(),
                size: self.written,
                etag: Some(etag),
            },
            stats,
        ))
    }

    /// Cancel the upload, abort the session and drop buffered bytes.
    /// Safe to race with in-flight part tasks.
    pub async fn abort(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;
        self.cancel.cancel();
        for task in mem::take(&mut self.tasks) {
            // tasks observe the token; outcomes no longer matter
            let _ = task.await;
        }
        self.buf = Vec::new();
        self.abort_session().await;
    }

    async fn dispatch_part(&mut self, data: Bytes) -> Result<()> {
        if self.session.is_none() {
            let id = self
                .client
                .create_multipart(&self.key)
                .await
                .context(ClientSnafu)?;
            debug!("opened multipart session {} for {}", id.0, self.key);
            self.session = Some(id);
        }
        let number = self.next_part;
        self.next_part += 1;

        let wait_start = Instant::now();
        let permit = self
            .inflight
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| {
                UploadAbortedSnafu {
                    key: self.key.clone(),
                    reason: "in-flight limiter closed".to_string(),
                }
                .build()
            })?;
        self.backpressure_wait += wait_start.elapsed();

        if self.cancel.is_cancelled() {
            return UploadAbortedSnafu {
                key: self.key.clone(),
                reason: "upload cancelled".to_string(),
            }
            .fail();
        }

        let len = data.len();
        self.inflight_bytes.fetch_add(len, Ordering::AcqRel);
        self.note_buffered();

        let client = self.client.clone();
        let key = self.key.clone();
        let id = self.session.clone().unwrap_or_else(|| UploadId(String::new()));
        let cancel = self.cancel.clone();
        let inflight_bytes = self.inflight_bytes.clone();
        let handle = tokio::spawn(async move {
            let _permit = permit;
            let upload = client.upload_part(&key, &id, number, data);
            let result = tokio::select! {
                _ = cancel.cancelled() => UploadAbortedSnafu {
                    key: key.clone(),
                    reason: "upload cancelled".to_string(),
                }
                .fail(),
                r = upload => r.context(ClientSnafu),
            };
            inflight_bytes.fetch_sub(len, Ordering::AcqRel);
            result.map(|etag| CompletedPart {
                number,
                etag,
                size: len,
            })
        });
        self.tasks.push(handle);
        Ok(())
    }

    async fn abort_session(&mut self) {
        if let Some(id) = self.session.take() {
            if let Err(e) = self.client.abort_multipart(&self.key, &id).await {
                warn!("failed to abort session {} for {}: {}", id.0, self.key, e);
            }
        }
    }

    fn note_buffered(&self) {
        let current = self.inflight_bytes.load(Ordering::Acquire) + self.buf.len();
        self.peak_buffered.fetch_max(current, Ordering::AcqRel);
    }

    fn stats(&self, parts: u32) -> UploadStats {
        UploadStats {
            bytes_uploaded: self.written,
            parts,
            backpressure_wait: self.backpressure_wait,
            peak_buffered: self.peak_buffered.load(Ordering::Acquire),
        }
    }
}
