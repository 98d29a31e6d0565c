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

use std::path::Path;

#[derive(Debug, Clone, Copy)]
pub struct DiskUsage {
    pub total: u64,
    pub free: u64,
}

impl DiskUsage {
    pub fn free_ratio(&self) -> f32 {
        if self.total == 0 {
            return 0.0;
        }
        self.free as f32 / self.total as f32
    }
}

pub fn get_disk_usage<P: AsRef<Path>>(path: P) -> Option<DiskUsage> {
    let stat = rustix::fs::statvfs(path.as_ref()).ok()?;
    Some(DiskUsage {
        total: stat.f_blocks * stat.f_bsize,
        free: stat.f_bavail * stat.f_bsize,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usage_of_tmp() {
        let usage = get_disk_usage("/tmp").expect("statvfs should work on /tmp");
        assert!(usage.total > 0);
        assert!(usage.free_ratio() >= 0.0 && usage.free_ratio() <= 1.0);
    }
}
