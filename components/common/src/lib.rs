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

pub const DATA_PREFIX: &str = "data";
pub const SHADOW_PREFIX: &str = "shadow";

/// The default size of one multipart upload part.
pub const DEFAULT_UPLOAD_PART_SIZE: usize = 16 << 20; // 16 MiB

/// Objects not larger than this are sent as one PUT instead of
/// opening a multipart session.
pub const DEFAULT_SINGLE_PUT_THRESHOLD: usize = 32 << 20; // 32 MiB

/// How many part uploads of one object may be outstanding at once.
pub const DEFAULT_INFLIGHT_PARTS: usize = 4;

/// The cache stores whole-object data in aligned blocks of this size,
/// so a byte range maps to a canonical set of cache keys.
pub const CACHE_BLOCK_SIZE: usize = 1 << 20; // 1 MiB

pub const DEFAULT_CACHE_CAPACITY: u64 = 10 << 30; // 10 GiB

/// Refuse new cache insertions when the backing volume would drop
/// below this free-space ratio.
pub const DEFAULT_MIN_FREE_RATIO: f32 = 0.05;

pub type PartNumber = u32;
pub type MetadataVersion = u32;

/// Index and mark files are small and read on almost every query, so
/// some configurations pin them in the cache.
pub fn is_metadata_file(logical_name: &str) -> bool {
    const SUFFIXES: [&str; 4] = [".idx", ".mrk", ".mrk2", ".mrk3"];
    const NAMES: [&str; 5] = [
        "checksums.txt",
        "columns.txt",
        "count.txt",
        "metadata_version.txt",
        "default_compression_codec.txt",
    ];
    let base = logical_name.rsplit('/').next().unwrap_or(logical_name);
    SUFFIXES.iter().any(|s| base.ends_with(s)) || NAMES.iter().any(|n| base == *n)
}
