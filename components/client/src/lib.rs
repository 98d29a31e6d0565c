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

//! Thin typed adapter over a remote object endpoint.
//!
//! The wire protocol is whatever the configured backend speaks; this
//! crate only fixes the verbs (PUT/GET/LIST/DELETE plus multipart) and
//! the error taxonomy. [`retry::RetryClient`] wraps any backend and
//! absorbs transient failures; [`mem::MemClient`] is the fault-injecting
//! in-process backend the tests run against; [`opendal_store`] adapts an
//! `opendal::Operator` for real s3/fs deployments.

pub mod err;
pub mod mem;
pub mod metrics;
pub mod opendal_store;
pub mod retry;

use std::{fmt, ops::Range, sync::Arc};

use async_trait::async_trait;
use bytes::Bytes;

pub use err::{Error, ErrorKind, Result};
pub use metrics::{ClientMetrics, MetricsSnapshot};
pub use retry::{RetryClient, RetryConfig};

/// One verb of the object store contract, used for metrics and error
/// reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Verb {
    Put,
    Get,
    Head,
    List,
    Delete,
    CreateMultipart,
    UploadPart,
    CompleteMultipart,
    AbortMultipart,
}

impl fmt::Display for Verb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Verb::Put => "PUT",
            Verb::Get => "GET",
            Verb::Head => "HEAD",
            Verb::List => "LIST",
            Verb::Delete => "DELETE",
            Verb::CreateMultipart => "CREATE-MULTIPART",
            Verb::UploadPart => "UPLOAD-PART",
            Verb::CompleteMultipart => "COMPLETE-MULTIPART",
            Verb::AbortMultipart => "ABORT-MULTIPART",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ETag(pub String);

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct UploadId(pub String);

#[derive(Debug, Clone)]
pub struct ObjectMeta {
    pub key: String,
    pub size: u64,
    pub etag: Option<ETag>,
}

/// One acknowledged part of a multipart session.
#[derive(Debug, Clone)]
pub struct CompletedPart {
    pub number: tsumiki_common::PartNumber,
    pub etag: ETag,
    pub size: usize,
}

/// The object store contract. All operations address whole objects;
/// there is no partial overwrite and no rename.
#[async_trait]
pub trait ObjectClient: Send + Sync + 'static {
    async fn put(&self, key: &str, data: Bytes) -> Result<ETag>;

    /// Whole-object read when `range` is `None`, ranged read otherwise.
    async fn get(&self, key: &str, range: Option<Range<u64>>) -> Result<Bytes>;

    async fn head(&self, key: &str) -> Result<ObjectMeta>;

    /// Enumerate keys under `prefix`, recursively.
    async fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>>;

    /// Per-key outcome; a missing key reports success (idempotent delete).
    async fn delete(&self, keys: &[String]) -> Result<Vec<(String, Result<()>)>>;

    async fn create_multipart(&self, key: &str) -> Result<UploadId>;

    async fn upload_part(
        &self,
        key: &str,
        upload_id: &UploadId,
        number: tsumiki_common::PartNumber,
        data: Bytes,
    ) -> Result<ETag>;

    /// Commit the session. Parts are assembled in part-number order,
    /// independent of upload completion order. Until this returns
    /// successfully, the object is invisible to `get`/`list`.
    async fn complete_multipart(
        &self,
        key: &str,
        upload_id: &UploadId,
        parts: &[CompletedPart],
    ) -> Result<ETag>;

    /// Drop the session and any server-side reserved storage. Aborting
    /// an unknown session is not an error.
    async fn abort_multipart(&self, key: &str, upload_id: &UploadId) -> Result<()>;

    /// Whether a failed `complete_multipart` can be safely re-issued
    /// because the backend can re-query session state.
    fn supports_complete_requery(&self) -> bool { false }
}

pub type ClientRef = Arc<dyn ObjectClient>;
