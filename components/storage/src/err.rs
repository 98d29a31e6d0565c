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

use snafu::{Location, Snafu};

#[derive(Snafu, Debug)]
#[snafu(visibility(pub))]
pub enum Error {
    #[snafu(display("object store client failed"))]
    Client {
        #[snafu(implicit)]
        location: Location,
        source: tsumiki_client::Error,
    },

    #[snafu(display("upload of {key} aborted: {reason}"))]
    UploadAborted {
        key: String,
        reason: String,
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display("no more space in cache dir {dir}"))]
    CapacityExceeded {
        dir: String,
        #[snafu(implicit)]
        location: Location,
    },

    UnknownIOError {
        #[snafu(implicit)]
        location: Location,
        source: std::io::Error,
    },

    #[snafu(display("failed to encode or decode the cache index"))]
    IndexCodec {
        #[snafu(implicit)]
        location: Location,
        source: serde_json::Error,
    },

    #[snafu(display("write on {key} after the handle was finished"))]
    WriterFinished {
        key: String,
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display("part {part} not found"))]
    PartNotFound {
        part: String,
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display("part {part} is {state}, expected an active part"))]
    PartNotActive {
        part: String,
        state: String,
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display("part {part} already exists"))]
    PartExists {
        part: String,
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display("unknown disk {name}"))]
    UnknownDisk {
        name: String,
        #[snafu(implicit)]
        location: Location,
    },
}

impl Error {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::Client { source, .. } if source.is_not_found())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
