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

//! File-shaped handles over whole remote objects.
//!
//! Writes stream through [`PartUploader`]; reads go block-aligned
//! through the cache when one is attached. Seeks are lazy: they only
//! move the cursor, the remote store is touched on `read`.

use std::io::SeekFrom;

use bytes::{Bytes, BytesMut};
use snafu::ResultExt;
use tsumiki_client::{ClientRef, ObjectMeta};
use tsumiki_common::{is_metadata_file, CACHE_BLOCK_SIZE};

use crate::{
    cache::{CacheKey, FileCacheRef},
    err::{ClientSnafu, Result, UnknownIOSnafu, WriterFinishedSnafu},
    upload::{PartUploader, UploadConfig, UploadStats},
};

/// Sequential, write-once handle. Nothing becomes visible under the key
/// until [`finish`](RemoteFileWriter::finish) returns.
pub struct RemoteFileWriter {
    key: String,
    uploader: Option<PartUploader>,
}

impl RemoteFileWriter {
    pub fn new(client: ClientRef, key: impl Into<String>, config: UploadConfig) -> Self {
        let key = key.into();
        Self {
            uploader: Some(PartUploader::new(client, key.clone(), config)),
            key,
        }
    }

    pub async fn write(&mut self, data: &[u8]) -> Result<()> {
        match self.uploader.as_mut() {
            Some(uploader) => uploader.write(data).await,
            None => WriterFinishedSnafu { key: self.key.clone() }.fail(),
        }
    }

    pub async fn finish(mut self) -> Result<(ObjectMeta, UploadStats)> {
        match self.uploader.take() {
            Some(uploader) => uploader.finish().await,
            None => WriterFinishedSnafu { key: self.key.clone() }.fail(),
        }
    }

    pub async fn abort(&mut self) {
        if let Some(mut uploader) = self.uploader.take() {
            uploader.abort().await;
        }
    }
}

/// Positioned reader over one remote object.
pub struct RemoteFileReader {
    key: String,
    client: ClientRef,
    cache: Option<FileCacheRef>,
    size: u64,
    pos: u64,
    block_size: u64,
    is_metadata: bool,
}

impl RemoteFileReader {
    /// Stat the object once to learn its size, then read lazily.
    pub async fn open(
        client: ClientRef,
        key: impl Into<String>,
        cache: Option<FileCacheRef>,
    ) -> Result<Self> {
        let key = key.into();
        let meta = client.head(&key).await.context(ClientSnafu)?;
        Ok(Self {
            is_metadata: is_metadata_file(&key),
            key,
            client,
            cache,
            size: meta.size,
            pos: 0,
            block_size: CACHE_BLOCK_SIZE as u64,
        })
    }

    #[cfg(test)]
    pub(crate) fn with_block_size(mut self, block_size: u64) -> Self {
        self.block_size = block_size;
        self
    }

    pub fn size(&self) -> u64 { self.size }

    pub fn position(&self) -> u64 { self.pos }

    /// Move the cursor without touching the store. Reading past the end
    /// later just returns fewer bytes.
    pub fn seek(&mut self, pos: SeekFrom) -> Result<u64> {
        let target = match pos {
            SeekFrom::Start(n) => Some(n),
            SeekFrom::End(delta) => self.size.checked_add_signed(delta),
            SeekFrom::Current(delta) => self.pos.checked_add_signed(delta),
        };
        match target {
            Some(n) => {
                self.pos = n;
                Ok(n)
            }
            None => Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "seek before byte 0",
            ))
            .context(UnknownIOSnafu),
        }
    }

    /// Read up to `len` bytes at the cursor and advance it. Returns an
    /// empty buffer at or past end of file.
    pub async fn read(&mut self, len: usize) -> Result<Bytes> {
        let data = self.read_at(self.pos, len).await?;
        self.pos += data.len() as u64;
        Ok(data)
    }

    pub async fn read_to_end(&mut self) -> Result<Bytes> {
        let remaining = self.size.saturating_sub(self.pos) as usize;
        self.read(remaining).await
    }

    /// Positional read that leaves the cursor alone.
    pub async fn read_at(&self, offset: u64, len: usize) -> Result<Bytes> {
        let end = offset.saturating_add(len as u64).min(self.size);
        if offset >= end {
            return Ok(Bytes::new());
        }
        let Some(cache) = &self.cache else {
            return self
                .client
                .get(&self.key, Some(offset..end))
                .await
                .context(ClientSnafu);
        };

        // Cached reads are block-aligned so every byte of a fetched
        // range is reusable by later reads.
        let mut out = BytesMut::with_capacity((end - offset) as usize);
        let first_block = offset / self.block_size;
        let last_block = (end - 1) / self.block_size;
        for block in first_block..=last_block {
            let block_start = block * self.block_size;
            let block_end = (block_start + self.block_size).min(self.size);
            let data = cache
                .get_or_fetch(
                    CacheKey::new(self.key.clone(), block as u32),
                    self.is_metadata,
                    || async {
                        self.client
                            .get(&self.key, Some(block_start..block_end))
                            .await
                            .context(ClientSnafu)
                    },
                )
                .await?;
            let from = offset.max(block_start) - block_start;
            let to = end.min(block_end) - block_start;
            out.extend_from_slice(&data[from as usize..to as usize]);
        }
        Ok(out.freeze())
    }
}
