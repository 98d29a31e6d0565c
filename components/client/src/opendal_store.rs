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

//! [`ObjectClient`] backed by an `opendal::Operator` (s3, fs, memory).
//!
//! The operator's writer drives the wire-level multipart upload, so
//! parts must reach it in order; out-of-order arrivals are staged until
//! their predecessor lands.

use std::{collections::BTreeMap, ops::Range, sync::Arc};

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use futures::TryStreamExt;
use snafu::ResultExt;
use tokio::io::AsyncWriteExt;
use tracing::warn;

use crate::{
    err::{FatalSnafu, NoSuchUploadSnafu, OpenDalSnafu, Result},
    CompletedPart, ETag, ObjectClient, ObjectMeta, UploadId, Verb,
};

struct SessionInner {
    writer: opendal::Writer,
    next: u32,
    staged: BTreeMap<u32, Bytes>,
}

struct Session {
    key: String,
    inner: tokio::sync::Mutex<SessionInner>,
}

pub struct OpendalClient {
    op: opendal::Operator,
    sessions: DashMap<String, Arc<Session>>,
}

impl OpendalClient {
    pub fn new(op: opendal::Operator) -> Self {
        Self {
            op,
            sessions: DashMap::new(),
        }
    }

    pub fn new_fs<P: AsRef<str>>(root: P) -> Result<Self> {
        let mut builder = opendal::services::Fs::default();
        builder.root(root.as_ref());
        let op = opendal::Operator::new(builder)
            .context(OpenDalSnafu {
                verb: Verb::Head,
                key: root.as_ref(),
            })?
            .finish();
        Ok(Self::new(op))
    }

    pub fn new_memory() -> Result<Self> {
        let builder = opendal::services::Memory::default();
        let op = opendal::Operator::new(builder)
            .context(OpenDalSnafu {
                verb: Verb::Head,
                key: "<memory>",
            })?
            .finish();
        Ok(Self::new(op))
    }

    pub fn new_s3(
        bucket: &str,
        endpoint: &str,
        region: &str,
        access_key_id: &str,
        secret_access_key: &str,
    ) -> Result<Self> {
        let mut builder = opendal::services::S3::default();
        builder
            .bucket(bucket)
            .endpoint(endpoint)
            .region(region)
            .access_key_id(access_key_id)
            .secret_access_key(secret_access_key);
        let op = opendal::Operator::new(builder)
            .context(OpenDalSnafu {
                verb: Verb::Head,
                key: bucket,
            })?
            .finish();
        Ok(Self::new(op))
    }
}

#[async_trait]
impl ObjectClient for OpendalClient {
    async fn put(&self, key: &str, data: Bytes) -> Result<ETag> {
        self.op
            .write(key, data)
            .await
            .context(OpenDalSnafu { verb: Verb::Put, key })?;
        let meta = self
            .op
            .stat(key)
            .await
            .context(OpenDalSnafu { verb: Verb::Head, key })?;
        Ok(ETag(meta.etag().unwrap_or(key).to_string()))
    }

    async fn get(&self, key: &str, range: Option<Range<u64>>) -> Result<Bytes> {
        let data = match range {
            None => self
                .op
                .read(key)
                .await
                .context(OpenDalSnafu { verb: Verb::Get, key })?,
            Some(range) => self
                .op
                .read_with(key)
                .range(range)
                .await
                .context(OpenDalSnafu { verb: Verb::Get, key })?,
        };
        Ok(Bytes::from(data))
    }

    async fn head(&self, key: &str) -> Result<ObjectMeta> {
        let meta = self
            .op
            .stat(key)
            .await
            .context(OpenDalSnafu { verb: Verb::Head, key })?;
        Ok(ObjectMeta {
            key: key.to_string(),
            size: meta.content_length(),
            etag: meta.etag().map(|e| ETag(e.to_string())),
        })
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>> {
        let mut lister = self
            .op
            .lister_with(prefix)
            .recursive(true)
            .metakey(opendal::Metakey::ContentLength | opendal::Metakey::Mode)
            .await
            .context(OpenDalSnafu { verb: Verb::List, key: prefix })?;
        let mut out = Vec::new();
        while let Some(entry) = lister
            .try_next()
            .await
            .context(OpenDalSnafu { verb: Verb::List, key: prefix })?
        {
            let meta = entry.metadata();
            if !meta.is_file() {
                continue;
            }
            out.push(ObjectMeta {
                key: entry.path().to_string(),
                size: meta.content_length(),
                etag: meta.etag().map(|e| ETag(e.to_string())),
            });
        }
        out.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(out)
    }

    async fn delete(&self, keys: &[String]) -> Result<Vec<(String, Result<()>)>> {
        let mut out = Vec::with_capacity(keys.len());
        for key in keys {
            let result = self
                .op
                .delete(key)
                .await
                .context(OpenDalSnafu { verb: Verb::Delete, key });
            let result = match result {
                Err(ref e) if e.is_not_found() => Ok(()),
                other => other,
            };
            out.push((key.clone(), result));
        }
        Ok(out)
    }

    async fn create_multipart(&self, key: &str) -> Result<UploadId> {
        let writer = self
            .op
            .writer(key)
            .await
            .context(OpenDalSnafu { verb: Verb::CreateMultipart, key })?;
        let id = UploadId(format!("od-{:016x}", tsumiki_utils::random_id()));
        self.sessions.insert(
            id.0.clone(),
            Arc::new(Session {
                key: key.to_string(),
                inner: tokio::sync::Mutex::new(SessionInner {
                    writer,
                    next: 1,
                    staged: BTreeMap::new(),
                }),
            }),
        );
        Ok(id)
    }

    async fn upload_part(
        &self,
        key: &str,
        upload_id: &UploadId,
        number: u32,
        data: Bytes,
    ) -> Result<ETag> {
        let session = self
            .session(key, upload_id)?;
        let mut inner = session.inner.lock().await;
        if number == inner.next {
            inner
                .writer
                .write_all(&data)
                .await
                .map_err(io_to_fatal(Verb::UploadPart, key))?;
            inner.next += 1;
            // drain anything unblocked by this part
            while let Some(buf) = {
                let next = inner.next;
                inner.staged.remove(&next)
            } {
                inner
                    .writer
                    .write_all(&buf)
                    .await
                    .map_err(io_to_fatal(Verb::UploadPart, key))?;
                inner.next += 1;
            }
        } else {
            inner.staged.insert(number, data);
        }
        Ok(ETag(format!("part-{}", number)))
    }

    async fn complete_multipart(
        &self,
        key: &str,
        upload_id: &UploadId,
        parts: &[CompletedPart],
    ) -> Result<ETag> {
        let session = self.session(key, upload_id)?;
        {
            let mut inner = session.inner.lock().await;
            if !inner.staged.is_empty() || inner.next as usize != parts.len() + 1 {
                return FatalSnafu {
                    verb: Verb::CompleteMultipart,
                    key,
                    message: format!(
                        "session has {} staged and {} written parts, caller listed {}",
                        inner.staged.len(),
                        inner.next - 1,
                        parts.len()
                    ),
                }
                .fail();
            }
            inner
                .writer
                .close()
                .await
                .context(OpenDalSnafu { verb: Verb::CompleteMultipart, key })?;
        }
        self.sessions.remove(&upload_id.0);
        let meta = self
            .op
            .stat(key)
            .await
            .context(OpenDalSnafu { verb: Verb::Head, key })?;
        Ok(ETag(meta.etag().unwrap_or(&upload_id.0).to_string()))
    }

    async fn abort_multipart(&self, key: &str, upload_id: &UploadId) -> Result<()> {
        self.sessions.remove(&upload_id.0);
        // dropping the writer discards the pending upload; also clear
        // any object a racing or already-acknowledged close may have
        // produced, even when the session is no longer tracked
        if let Err(e) = self.op.delete(key).await {
            if e.kind() != opendal::ErrorKind::NotFound {
                warn!("failed to clean {} after abort: {}", key, e);
            }
        }
        Ok(())
    }
}

impl OpendalClient {
    fn session(&self, key: &str, upload_id: &UploadId) -> Result<Arc<Session>> {
        let session = self
            .sessions
            .get(&upload_id.0)
            .map(|s| s.clone())
            .ok_or_else(|| {
                NoSuchUploadSnafu {
                    key,
                    upload_id: upload_id.0.clone(),
                }
                .build()
            })?;
        debug_assert_eq!(session.key, key);
        Ok(session)
    }
}

fn io_to_fatal(verb: Verb, key: &str) -> impl FnOnce(std::io::Error) -> crate::Error + '_ {
    move |e| {
        FatalSnafu {
            verb,
            key,
            message: e.to_string(),
        }
        .build()
    }
}
