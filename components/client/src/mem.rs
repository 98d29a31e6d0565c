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

//! In-process object store with fault injection.
//!
//! Plays the role of the unstable-proxy / broken-endpoint mocks the
//! original integration suite runs against: tests script the next N
//! failures of a verb and observe how the storage layer reacts.

use std::{
    collections::BTreeMap,
    ops::Range,
    sync::{
        atomic::{AtomicI64, AtomicU64, Ordering},
        Arc, Mutex,
    },
};

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use tracing::debug;

use crate::{
    err::{
        FatalSnafu, NoSuchUploadSnafu, NotFoundSnafu, PermissionDeniedSnafu,
        QuotaOrThrottledSnafu, Result, TransientSnafu,
    },
    CompletedPart, ETag, Error, ErrorKind, ObjectClient, ObjectMeta, UploadId, Verb,
};

struct FaultRule {
    skip: AtomicI64,
    remaining: AtomicI64,
    kind: ErrorKind,
}

/// Scripted failures, keyed by verb. Each matching call first consumes
/// the `skip` budget, then fails `remaining` times with the configured
/// error kind.
#[derive(Default)]
pub struct FaultInjector {
    rules: DashMap<Verb, FaultRule>,
}

impl FaultInjector {
    /// Fail the next `count` calls of `verb`.
    pub fn fail_next(&self, verb: Verb, count: i64, kind: ErrorKind) {
        self.fail_after(verb, 0, count, kind);
    }

    /// Let `skip` calls of `verb` succeed, then fail `count` of them.
    pub fn fail_after(&self, verb: Verb, skip: i64, count: i64, kind: ErrorKind) {
        self.rules.insert(
            verb,
            FaultRule {
                skip: AtomicI64::new(skip),
                remaining: AtomicI64::new(count),
                kind,
            },
        );
    }

    pub fn clear(&self) { self.rules.clear(); }

    fn check(&self, verb: Verb, key: &str) -> Result<()> {
        let Some(rule) = self.rules.get(&verb) else {
            return Ok(());
        };
        if rule.skip.fetch_sub(1, Ordering::AcqRel) > 0 {
            return Ok(());
        }
        if rule.remaining.fetch_sub(1, Ordering::AcqRel) <= 0 {
            return Ok(());
        }
        debug!("injecting {:?} fault into {} {}", rule.kind, verb, key);
        Err(make_error(rule.kind, verb, key))
    }
}

fn make_error(kind: ErrorKind, verb: Verb, key: &str) -> Error {
    let key = key.to_string();
    match kind {
        ErrorKind::Transient => TransientSnafu {
            verb,
            key,
            message: "injected fault".to_string(),
        }
        .build(),
        ErrorKind::NotFound => NotFoundSnafu { key }.build(),
        ErrorKind::PermissionDenied => PermissionDeniedSnafu { verb, key }.build(),
        ErrorKind::QuotaOrThrottled => QuotaOrThrottledSnafu { verb, key }.build(),
        ErrorKind::Fatal => FatalSnafu {
            verb,
            key,
            message: "injected fault".to_string(),
        }
        .build(),
    }
}

struct StoredObject {
    data: Bytes,
    etag: ETag,
}

struct Session {
    key: String,
    parts: Mutex<BTreeMap<u32, (ETag, Bytes)>>,
}

/// An in-memory [`ObjectClient`]. Multipart sessions stay invisible to
/// `get`/`list` until completed; completion is idempotent so a retried
/// `complete_multipart` after a lost response succeeds.
#[derive(Default)]
pub struct MemClient {
    objects: DashMap<String, StoredObject>,
    sessions: DashMap<String, Arc<Session>>,
    completed: DashMap<String, ETag>,
    pub faults: FaultInjector,
    seq: AtomicU64,
}

impl MemClient {
    pub fn new() -> Self { Self::default() }

    fn next_etag(&self) -> ETag {
        ETag(format!("mem-{:016x}", self.seq.fetch_add(1, Ordering::Relaxed)))
    }

    /// Number of stored objects, for assertions in tests.
    pub fn object_count(&self) -> usize { self.objects.len() }

    pub fn open_session_count(&self) -> usize { self.sessions.len() }
}

#[async_trait]
impl ObjectClient for MemClient {
    async fn put(&self, key: &str, data: Bytes) -> Result<ETag> {
        self.faults.check(Verb::Put, key)?;
        let etag = self.next_etag();
        self.objects.insert(
            key.to_string(),
            StoredObject {
                data,
                etag: etag.clone(),
            },
        );
        Ok(etag)
    }

    async fn get(&self, key: &str, range: Option<Range<u64>>) -> Result<Bytes> {
        self.faults.check(Verb::Get, key)?;
        let obj = self
            .objects
            .get(key)
            .ok_or_else(|| NotFoundSnafu { key }.build())?;
        match range {
            None => Ok(obj.data.clone()),
            Some(range) => {
                let len = obj.data.len() as u64;
                if range.start > len || range.start > range.end {
                    return FatalSnafu {
                        verb: Verb::Get,
                        key,
                        message: format!("invalid range {:?} for object of {} bytes", range, len),
                    }
                    .fail();
                }
                let end = range.end.min(len);
                Ok(obj.data.slice(range.start as usize..end as usize))
            }
        }
    }

    async fn head(&self, key: &str) -> Result<ObjectMeta> {
        self.faults.check(Verb::Head, key)?;
        let obj = self
            .objects
            .get(key)
            .ok_or_else(|| NotFoundSnafu { key }.build())?;
        Ok(ObjectMeta {
            key: key.to_string(),
            size: obj.data.len() as u64,
            etag: Some(obj.etag.clone()),
        })
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>> {
        self.faults.check(Verb::List, prefix)?;
        let mut out: Vec<ObjectMeta> = self
            .objects
            .iter()
            .filter(|e| e.key().starts_with(prefix))
            .map(|e| ObjectMeta {
                key: e.key().clone(),
                size: e.value().data.len() as u64,
                etag: Some(e.value().etag.clone()),
            })
            .collect();
        out.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(out)
    }

    async fn delete(&self, keys: &[String]) -> Result<Vec<(String, Result<()>)>> {
        let mut out = Vec::with_capacity(keys.len());
        for key in keys {
            let result = self.faults.check(Verb::Delete, key).map(|_| {
                // removing a missing key is a success, deletes are idempotent
                self.objects.remove(key);
            });
            out.push((key.clone(), result));
        }
        Ok(out)
    }

    async fn create_multipart(&self, key: &str) -> Result<UploadId> {
        self.faults.check(Verb::CreateMultipart, key)?;
        let id = UploadId(format!(
            "upload-{:016x}",
            self.seq.fetch_add(1, Ordering::Relaxed)
        ));
        self.sessions.insert(
            id.0.clone(),
            Arc::new(Session {
                key: key.to_string(),
                parts: Mutex::new(BTreeMap::new()),
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
        self.faults.check(Verb::UploadPart, key)?;
        let session = self
            .sessions
            .get(&upload_id.0)
            .ok_or_else(|| {
                NoSuchUploadSnafu {
                    key,
                    upload_id: upload_id.0.clone(),
                }
                .build()
            })?
            .clone();
        let etag = self.next_etag();
        session
            .parts
            .lock()
            .expect("session part map poisoned")
            .insert(number, (etag.clone(), data));
        Ok(etag)
    }

    async fn complete_multipart(
        &self,
        key: &str,
        upload_id: &UploadId,
        parts: &[CompletedPart],
    ) -> Result<ETag> {
        self.faults.check(Verb::CompleteMultipart, key)?;
        let Some((_, session)) = self.sessions.remove(&upload_id.0) else {
            // A previous attempt may have gone through and only the
            // response was lost; the session outcome is re-queryable.
            if let Some(etag) = self.completed.get(&upload_id.0) {
                return Ok(etag.clone());
            }
            return NoSuchUploadSnafu {
                key,
                upload_id: upload_id.0.clone(),
            }
            .fail();
        };

        let uploaded = session.parts.lock().expect("session part map poisoned");
        let mut assembled = Vec::new();
        for part in parts {
            match uploaded.get(&part.number) {
                Some((etag, data)) if *etag == part.etag => assembled.push(data.clone()),
                _ => {
                    return FatalSnafu {
                        verb: Verb::CompleteMultipart,
                        key,
                        message: format!("part {} missing or etag mismatch", part.number),
                    }
                    .fail();
                }
            }
        }

        let mut data = Vec::with_capacity(assembled.iter().map(Bytes::len).sum());
        for chunk in assembled {
            data.extend_from_slice(&chunk);
        }
        let etag = self.next_etag();
        self.objects.insert(
            session.key.clone(),
            StoredObject {
                data: Bytes::from(data),
                etag: etag.clone(),
            },
        );
        self.completed.insert(upload_id.0.clone(), etag.clone());
        Ok(etag)
    }

    async fn abort_multipart(&self, key: &str, upload_id: &UploadId) -> Result<()> {
        self.faults.check(Verb::AbortMultipart, key)?;
        self.sessions.remove(&upload_id.0);
        Ok(())
    }

    fn supports_complete_requery(&self) -> bool { true }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn whole_object_round_trip() {
        let client = MemClient::new();
        client.put("data/t/p/a.bin", Bytes::from_static(b"hello")).await.unwrap();
        let data = client.get("data/t/p/a.bin", None).await.unwrap();
        assert_eq!(data.as_ref(), b"hello");

        let data = client.get("data/t/p/a.bin", Some(1..3)).await.unwrap();
        assert_eq!(data.as_ref(), b"el");

        assert!(client.get("data/missing", None).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn multipart_orders_by_part_number() {
        let client = MemClient::new();
        let id = client.create_multipart("k").await.unwrap();
        // acknowledge out of order, assembly must still be 1,2
        let e2 = client.upload_part("k", &id, 2, Bytes::from_static(b"world")).await.unwrap();
        let e1 = client.upload_part("k", &id, 1, Bytes::from_static(b"hello ")).await.unwrap();

        // invisible until completed
        assert!(client.get("k", None).await.unwrap_err().is_not_found());
        assert!(client.list("k").await.unwrap().is_empty());

        let parts = vec![
            CompletedPart { number: 1, etag: e1, size: 6 },
            CompletedPart { number: 2, etag: e2, size: 5 },
        ];
        let etag = client.complete_multipart("k", &id, &parts).await.unwrap();
        assert_eq!(client.get("k", None).await.unwrap().as_ref(), b"hello world");

        // a retried completion after a lost response is idempotent
        let again = client.complete_multipart("k", &id, &parts).await.unwrap();
        assert_eq!(etag, again);
    }

    #[tokio::test]
    async fn aborted_session_leaves_nothing() {
        let client = MemClient::new();
        let id = client.create_multipart("k").await.unwrap();
        client.upload_part("k", &id, 1, Bytes::from_static(b"x")).await.unwrap();
        client.abort_multipart("k", &id).await.unwrap();
        assert!(client.get("k", None).await.unwrap_err().is_not_found());
        assert_eq!(client.open_session_count(), 0);
    }

    #[tokio::test]
    async fn fault_injection_budget() {
        let client = MemClient::new();
        client.put("k", Bytes::from_static(b"v")).await.unwrap();
        client.faults.fail_next(Verb::Get, 2, ErrorKind::Transient);

        assert!(client.get("k", None).await.unwrap_err().is_retryable());
        assert!(client.get("k", None).await.is_err());
        assert!(client.get("k", None).await.is_ok());
    }
}
