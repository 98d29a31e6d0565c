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

use std::{
    future::Future,
    ops::Range,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use rand::Rng;
use serde::{Deserialize, Serialize};
use snafu::IntoError;
use tracing::{debug, warn};

use crate::{
    err::{RetriesExhaustedSnafu, Result, TimeoutSnafu},
    ClientMetrics, ClientRef, CompletedPart, ETag, ObjectClient, ObjectMeta, UploadId, Verb,
};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryConfig {
    pub max_attempts: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub request_timeout: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(5),
            request_timeout: Duration::from_secs(30),
        }
    }
}

impl RetryConfig {
    fn backoff(&self, attempt: usize) -> Duration {
        let exp = self
            .base_delay
            .saturating_mul(1u32 << attempt.min(16) as u32)
            .min(self.max_delay);
        // full jitter, so concurrent retries don't stampede
        let jitter = rand::thread_rng().gen_range(0..=exp.as_millis() as u64);
        Duration::from_millis(jitter.max(1))
    }
}

/// Wraps any backend and absorbs transient failures of idempotent verbs
/// with exponential backoff. Non-idempotent `complete_multipart` is
/// retried only when the backend can re-query the session outcome.
///
/// Also owns the per-disk request counters and the no-delete switch:
/// with no-delete on, `delete` succeeds without touching the remote,
/// for backing stores treated as append-only backup targets.
pub struct RetryClient {
    backend: ClientRef,
    config: RetryConfig,
    metrics: Arc<ClientMetrics>,
    no_delete: AtomicBool,
}

impl RetryClient {
    pub fn new(backend: ClientRef, config: RetryConfig) -> Self {
        Self {
            backend,
            config,
            metrics: Arc::new(ClientMetrics::default()),
            no_delete: AtomicBool::new(false),
        }
    }

    pub fn metrics(&self) -> Arc<ClientMetrics> { self.metrics.clone() }

    pub fn set_no_delete(&self, on: bool) { self.no_delete.store(on, Ordering::Release); }

    pub fn no_delete(&self) -> bool { self.no_delete.load(Ordering::Acquire) }

    async fn run<T, F, Fut>(&self, verb: Verb, key: &str, idempotent: bool, f: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let budget = if idempotent { self.config.max_attempts } else { 1 };
        let mut attempt = 0;
        loop {
            self.metrics.record(verb);
            let outcome = match tokio::time::timeout(self.config.request_timeout, f()).await {
                Ok(outcome) => outcome,
                Err(_) => TimeoutSnafu {
                    verb,
                    key,
                    timeout: self.config.request_timeout,
                }
                .fail(),
            };
            match outcome {
                Ok(v) => return Ok(v),
                Err(e) if e.is_retryable() && attempt + 1 < budget => {
                    let delay = self.config.backoff(attempt);
                    debug!(
                        "{} {} attempt {} failed ({}), backing off {:?}",
                        verb, key, attempt, e, delay
                    );
                    self.metrics.record_retry();
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) if e.is_retryable() && idempotent => {
                    return Err(e).map_err(Box::new).map_err(|source| {
                        RetriesExhaustedSnafu {
                            verb,
                            key,
                            attempts: budget,
                        }
                        .into_error(source)
                    });
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[async_trait]
impl ObjectClient for RetryClient {
    async fn put(&self, key: &str, data: Bytes) -> Result<ETag> {
        let len = data.len() as u64;
        // PUT of an immutable key is safe to repeat
        let etag = self
            .run(Verb::Put, key, true, || self.backend.put(key, data.clone()))
            .await?;
        self.metrics.add_bytes_uploaded(len);
        Ok(etag)
    }

    async fn get(&self, key: &str, range: Option<Range<u64>>) -> Result<Bytes> {
        let data = self
            .run(Verb::Get, key, true, || self.backend.get(key, range.clone()))
            .await?;
        self.metrics.add_bytes_downloaded(data.len() as u64);
        Ok(data)
    }

    async fn head(&self, key: &str) -> Result<ObjectMeta> {
        self.run(Verb::Head, key, true, || self.backend.head(key)).await
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>> {
        self.run(Verb::List, prefix, true, || self.backend.list(prefix))
            .await
    }

    async fn delete(&self, keys: &[String]) -> Result<Vec<(String, Result<()>)>> {
        if self.no_delete() {
            self.metrics.record_suppressed_delete(keys.len() as u64);
            debug!("no-delete mode, keeping {} objects", keys.len());
            return Ok(keys.iter().map(|k| (k.clone(), Ok(()))).collect());
        }
        self.run(Verb::Delete, "<batch>", true, || self.backend.delete(keys))
            .await
    }

    async fn create_multipart(&self, key: &str) -> Result<UploadId> {
        self.run(Verb::CreateMultipart, key, true, || {
            self.backend.create_multipart(key)
        })
        .await
    }

    async fn upload_part(
        &self,
        key: &str,
        upload_id: &UploadId,
        number: u32,
        data: Bytes,
    ) -> Result<ETag> {
        let len = data.len() as u64;
        // a part number can be re-uploaded, the last acknowledged wins
        let etag = self
            .run(Verb::UploadPart, key, true, || {
                self.backend.upload_part(key, upload_id, number, data.clone())
            })
            .await?;
        self.metrics.add_bytes_uploaded(len);
        Ok(etag)
    }

    async fn complete_multipart(
        &self,
        key: &str,
        upload_id: &UploadId,
        parts: &[CompletedPart],
    ) -> Result<ETag> {
        let requery = self.backend.supports_complete_requery();
        self.run(Verb::CompleteMultipart, key, requery, || {
            self.backend.complete_multipart(key, upload_id, parts)
        })
        .await
    }

    async fn abort_multipart(&self, key: &str, upload_id: &UploadId) -> Result<()> {
        let result = self
            .run(Verb::AbortMultipart, key, true, || {
                self.backend.abort_multipart(key, upload_id)
            })
            .await;
        if let Err(ref e) = result {
            // abort is best-effort cleanup; the server expires the
            // session eventually
            warn!("failed to abort multipart session for {}: {}", key, e);
        }
        result
    }

    fn supports_complete_requery(&self) -> bool { self.backend.supports_complete_requery() }
}
