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

//! Storage policies: ordered volumes of disks.
//!
//! New data lands on the first volume; later volumes hold colder data
//! that parts are moved to explicitly or by TTL. Within a volume, disks
//! take new parts round-robin.

use std::sync::atomic::{AtomicUsize, Ordering};

use crate::{
    disk::DiskRef,
    err::{Result, UnknownDiskSnafu},
};

pub struct Volume {
    name: String,
    disks: Vec<DiskRef>,
    next: AtomicUsize,
}

impl Volume {
    pub fn new(name: impl Into<String>, disks: Vec<DiskRef>) -> Self {
        assert!(!disks.is_empty(), "a volume needs at least one disk");
        Self {
            name: name.into(),
            disks,
            next: AtomicUsize::new(0),
        }
    }

    pub fn name(&self) -> &str { &self.name }

    pub fn disks(&self) -> &[DiskRef] { &self.disks }

    /// Round-robin placement target for the next new part.
    pub fn disk_for_new_part(&self) -> DiskRef {
        let i = self.next.fetch_add(1, Ordering::Relaxed) % self.disks.len();
        self.disks[i].clone()
    }
}

pub struct StoragePolicy {
    name: String,
    volumes: Vec<Volume>,
}

impl StoragePolicy {
    pub fn new(name: impl Into<String>, volumes: Vec<Volume>) -> Self {
        assert!(!volumes.is_empty(), "a policy needs at least one volume");
        Self {
            name: name.into(),
            volumes,
        }
    }

    /// A policy over one anonymous volume, for single-disk setups.
    pub fn single(disk: DiskRef) -> Self {
        let name = format!("{}-only", disk.name());
        Self::new(name, vec![Volume::new("default", vec![disk])])
    }

    pub fn name(&self) -> &str { &self.name }

    pub fn volumes(&self) -> &[Volume] { &self.volumes }

    /// Where brand-new parts land: the hottest volume.
    pub fn disk_for_new_part(&self) -> DiskRef { self.volumes[0].disk_for_new_part() }

    pub fn disk(&self, name: &str) -> Result<DiskRef> {
        self.volumes
            .iter()
            .flat_map(|v| v.disks())
            .find(|d| d.name() == name)
            .cloned()
            .ok_or_else(|| UnknownDiskSnafu { name }.build())
    }

    pub fn volume(&self, name: &str) -> Option<&Volume> {
        self.volumes.iter().find(|v| v.name() == name)
    }

    pub fn disks(&self) -> impl Iterator<Item = &DiskRef> {
        self.volumes.iter().flat_map(|v| v.disks())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tsumiki_client::{mem::MemClient, RetryConfig};

    use super::*;
    use crate::disk::{DiskSettings, ObjectDisk};

    fn disk(name: &str) -> DiskRef {
        ObjectDisk::new(
            name,
            Arc::new(MemClient::new()),
            RetryConfig::default(),
            None,
            DiskSettings::default(),
        )
    }

    #[test]
    fn placement_round_robins_the_hot_volume() {
        let policy = StoragePolicy::new(
            "tiered",
            vec![
                Volume::new("hot", vec![disk("s3_a"), disk("s3_b")]),
                Volume::new("cold", vec![disk("s3_cold")]),
            ],
        );

        let first = policy.disk_for_new_part();
        let second = policy.disk_for_new_part();
        let third = policy.disk_for_new_part();
        assert_ne!(first.name(), second.name());
        assert_eq!(first.name(), third.name());
        // the cold volume never takes new parts
        assert!(["s3_a", "s3_b"].contains(&first.name()));
    }

    #[test]
    fn lookup_by_name_spans_volumes() {
        let policy = StoragePolicy::new(
            "tiered",
            vec![
                Volume::new("hot", vec![disk("s3")]),
                Volume::new("cold", vec![disk("hdd")]),
            ],
        );
        assert_eq!(policy.disk("hdd").unwrap().name(), "hdd");
        assert!(policy.disk("nvme").is_err());
    }
}
