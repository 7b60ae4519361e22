//! Disk-space policy for the reduced core. A crash report should never be the
//! thing that fills the disk, so the output is capped at a twentieth of the
//! free space with an absolute ceiling on top. Both numbers are policy carried
//! over from the original crash handler, not anything derived.
use crate::error::{Error, Result};
use std::path::Path;

pub const MAX_COREDUMP_SIZE: u64 = 256 * 1024 * 1024;

const FREE_SPACE_FRACTION: u64 = 20;

/// The size ceiling for one conversion. Constructed from the destination's
/// filesystem for real runs; tests inject an arbitrary limit.
#[derive(Clone, Copy, Debug)]
pub struct SizeBudget {
    limit: u64,
}

impl SizeBudget {
    pub fn new(limit: u64) -> Self {
        SizeBudget { limit }
    }

    /// Derives the ceiling from the free space at `path`'s filesystem.
    pub fn for_path(path: &Path) -> Result<Self> {
        let free = free_disk_space(path)?;
        Ok(SizeBudget {
            limit: (free / FREE_SPACE_FRACTION).min(MAX_COREDUMP_SIZE),
        })
    }

    pub fn limit(&self) -> u64 {
        self.limit
    }

    /// Fails if an `expected`-byte output would exceed the ceiling.
    pub fn check(&self, expected: u64) -> Result<()> {
        if expected > self.limit {
            return Err(Error::resource(format!(
                "core dump too large: {expected} bytes (limit {})",
                self.limit
            )));
        }
        Ok(())
    }
}

fn free_disk_space(path: &Path) -> Result<u64> {
    let stats = nix::sys::statvfs::statvfs(path)
        .map_err(|err| Error::resource(format!("statvfs failed for {}: {err}", path.display())))?;
    Ok(stats.blocks_available() as u64 * stats.fragment_size() as u64)
}
