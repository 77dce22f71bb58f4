//! Cgroup placement for freshly launched cell init processes
//!
//! Each cell gets a child group named after it under the accounting and
//! memory hierarchies. The hierarchies themselves are mounted by the host;
//! a missing hierarchy is logged and skipped so the daemon still works on
//! kernels or boot images without one.

use crate::errors::LaunchError;
use std::{fs, io, path::Path};

const ACCOUNTING_ROOT: &str = "/sys/fs/cgroup/cpuacct";
const MEMORY_ROOT: &str = "/sys/fs/cgroup/memory";

/// Hard memory cap applied to every cell
const MEMORY_LIMIT_BYTES: u64 = 512 << 20;

/// Place `pid` into the per-cell groups, creating them if needed. Existing
/// groups from a previous run of the same cell are reused as-is.
pub fn enter_cgroups(name: &str, pid: i32) -> Result<(), LaunchError> {
    for (root, limit) in [
        (ACCOUNTING_ROOT, None),
        (MEMORY_ROOT, Some(MEMORY_LIMIT_BYTES)),
    ] {
        if !Path::new(root).is_dir() {
            log::warn!("cgroup hierarchy {:?} not mounted, skipping", root);
            continue;
        }
        enter_one(root, name, pid, limit).map_err(|source| LaunchError::Cgroup { pid, source })?;
    }
    Ok(())
}

fn enter_one(root: &str, name: &str, pid: i32, limit: Option<u64>) -> io::Result<()> {
    let group = Path::new(root).join(name);
    fs::create_dir_all(&group)?;
    if let Some(bytes) = limit {
        fs::write(group.join("memory.limit_in_bytes"), bytes.to_string())?;
    }
    fs::write(group.join("cgroup.procs"), pid.to_string())?;
    log::debug!("pid {} placed in {:?}", pid, group);
    Ok(())
}
