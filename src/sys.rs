//! System resource probes.
//!
//! RAM and disk pre-checks run before admitting an upload or starting a
//! generation job. Probes that cannot resolve (unknown mount point, missing
//! /proc) report unbounded capacity rather than blocking work.

use std::path::Path;

use sysinfo::{Disks, System};

/// Available physical memory in bytes.
pub fn available_memory() -> u64 {
    let mut sys = System::new();
    sys.refresh_memory();
    sys.available_memory()
}

/// Available space in bytes on the disk holding `path`.
///
/// The disk is matched by the longest mount point that prefixes the
/// canonicalized path.
pub fn available_disk_space(path: &Path) -> u64 {
    let target = path
        .canonicalize()
        .unwrap_or_else(|_| path.to_path_buf());

    let disks = Disks::new_with_refreshed_list();
    let mut best: Option<(usize, u64)> = None;

    for disk in disks.list() {
        let mount = disk.mount_point();
        if target.starts_with(mount) {
            let depth = mount.components().count();
            if best.map(|(d, _)| depth > d).unwrap_or(true) {
                best = Some((depth, disk.available_space()));
            }
        }
    }

    best.map(|(_, space)| space).unwrap_or(u64::MAX)
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_available_memory_nonzero() {
        assert!(available_memory() > 0);
    }

    #[test]
    fn test_disk_space_for_cwd() {
        let space = available_disk_space(Path::new("."));
        assert!(space > 0);
    }

    #[test]
    fn test_disk_space_unknown_path_is_unbounded() {
        // A path outside any mount still yields a usable (permissive) answer.
        let space = available_disk_space(Path::new("/nonexistent/deeply/nested"));
        assert!(space > 0);
    }
}
