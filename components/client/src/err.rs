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

use std::time::Duration;

use snafu::{Location, Snafu};

use crate::Verb;

/// Coarse classification every remote failure maps onto. Callers decide
/// per kind whether to retry, abort, or fail the enclosing operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Network blip, 5xx, timeout. Worth retrying with backoff.
    Transient,
    /// The object does not exist. Fatal for reads that expect it,
    /// benign for idempotent deletes.
    NotFound,
    /// Credential or ACL problem. Never retried.
    PermissionDenied,
    /// The provider is throttling or a quota was hit.
    QuotaOrThrottled,
    /// Malformed request, invalid session, bug. Never retried.
    Fatal,
}

#[derive(Snafu, Debug)]
#[snafu(visibility(pub))]
pub enum Error {
    #[snafu(display("{verb} {key} failed transiently: {message}"))]
    Transient {
        verb: Verb,
        key: String,
        message: String,
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display("object {key} not found"))]
    NotFound {
        key: String,
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display("permission denied on {verb} {key}"))]
    PermissionDenied {
        verb: Verb,
        key: String,
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display("{verb} {key} throttled by the provider"))]
    QuotaOrThrottled {
        verb: Verb,
        key: String,
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display("{verb} {key} failed fatally: {message}"))]
    Fatal {
        verb: Verb,
        key: String,
        message: String,
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display("{verb} {key} timed out after {timeout:?}"))]
    Timeout {
        verb: Verb,
        key: String,
        timeout: Duration,
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display("{verb} {key} still failing after {attempts} attempts: {source}"))]
    RetriesExhausted {
        verb: Verb,
        key: String,
        attempts: usize,
        #[snafu(source)]
        source: Box<Error>,
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display("no multipart session {upload_id} for {key}"))]
    NoSuchUpload {
        key: String,
        upload_id: String,
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display("OpenDAL operator failed on {verb} {key}"))]
    OpenDal {
        verb: Verb,
        key: String,
        #[snafu(implicit)]
        location: Location,
        #[snafu(source)]
        error: opendal::Error,
    },
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Transient { .. } | Error::Timeout { .. } => ErrorKind::Transient,
            Error::NotFound { .. } => ErrorKind::NotFound,
            Error::PermissionDenied { .. } => ErrorKind::PermissionDenied,
            Error::QuotaOrThrottled { .. } => ErrorKind::QuotaOrThrottled,
            Error::Fatal { .. } | Error::NoSuchUpload { .. } => ErrorKind::Fatal,
            Error::RetriesExhausted { source, .. } => source.kind(),
            Error::OpenDal { error, .. } => classify_opendal(error),
        }
    }

    /// Whether one more attempt of the same idempotent call may succeed.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Error::RetriesExhausted { .. })
            && matches!(
                self.kind(),
                ErrorKind::Transient | ErrorKind::QuotaOrThrottled
            )
    }

    pub fn is_not_found(&self) -> bool { self.kind() == ErrorKind::NotFound }
}

fn classify_opendal(error: &opendal::Error) -> ErrorKind {
    match error.kind() {
        opendal::ErrorKind::NotFound => ErrorKind::NotFound,
        opendal::ErrorKind::PermissionDenied => ErrorKind::PermissionDenied,
        opendal::ErrorKind::RateLimited => ErrorKind::QuotaOrThrottled,
        _ if error.is_temporary() => ErrorKind::Transient,
        _ => ErrorKind::Fatal,
    }
}

pub type Result<T> = std::result::Result<T, Error>;
