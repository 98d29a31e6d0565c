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

//! Object-store-backed disks for a merge-tree table.
//!
//! The layers, bottom up: [`upload`] streams bytes into one object with
//! bounded memory; [`file`] gives those objects file-handle semantics;
//! [`cache`] keeps hot blocks on local disk; [`disk`] bundles a client,
//! a cache and reloadable settings under one name; [`policy`] arranges
//! disks into volumes; [`part`] runs the part lifecycle (create, merge,
//! move, freeze, drop) on top, keeping remote state either untouched or
//! fully applied across failures.

pub mod cache;
pub mod disk;
pub mod err;
pub mod file;
pub mod part;
pub mod policy;
pub mod upload;

pub use cache::{CacheKey, CacheStats, FileCache, FileCacheBuilder, FileCacheRef};
pub use disk::{DiskRef, DiskSettings, ObjectDisk};
pub use err::{Error, Result};
pub use file::{RemoteFileReader, RemoteFileWriter};
pub use part::{FileMeta, PartMeta, PartState, PartStore, PartWriter};
pub use policy::{StoragePolicy, Volume};
pub use upload::{PartUploader, UploadConfig, UploadStats};
