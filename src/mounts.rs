//! Cell filesystem construction and teardown
//!
//! Each cell's root is a tmpfs under the cells directory, populated from a
//! skeleton tree and completed with bind mounts: read-only binds of the
//! host's firmware partitions and writable binds of the cell's private
//! `<name>-rw` state directory. Setup is idempotent; already-present mounts
//! are detected through `/proc/mounts` and left alone, so a `mount` command
//! against a prepared cell is a no-op.

use crate::errors::MountError;
use nix::mount::{mount, umount2, MntFlags, MsFlags};
use std::{
    ffi::OsStr,
    fs,
    os::unix::ffi::OsStrExt,
    os::unix::fs::{chown, lchown, symlink, MetadataExt, PermissionsExt},
    path::{Path, PathBuf},
};

/// Host trees that every cell sees read-only, when the host has them
const RO_BINDS: [&str; 3] = ["/system", "/vendor", "/firmware"];

/// Private writable trees, bound from the cell's `-rw` directory
const RW_BINDS: [&str; 3] = ["data", "persist", "metadata"];

/// Mount points torn down before the catch-all scan, innermost first
const TEARDOWN_ORDER: [&str; 8] = [
    "dev/pts",
    "dev/console",
    "dev",
    "data",
    "persist",
    "metadata",
    "system",
    "vendor",
];

pub struct MountManager {
    cells_dir: PathBuf,
    skeleton_dir: PathBuf,
}

impl MountManager {
    pub fn new<P: Into<PathBuf>, Q: Into<PathBuf>>(cells_dir: P, skeleton_dir: Q) -> MountManager {
        MountManager {
            cells_dir: cells_dir.into(),
            skeleton_dir: skeleton_dir.into(),
        }
    }

    /// Root directory of a cell's filesystem view
    pub fn cell_root(&self, name: &str) -> PathBuf {
        self.cells_dir.join(name)
    }

    /// Per-cell writable state directory, outside the cell root
    pub fn rw_dir(&self, name: &str) -> PathBuf {
        self.cells_dir.join(format!("{}-rw", name))
    }

    /// Build the cell's root: tmpfs, skeleton copy, firmware and state binds
    pub fn mount_cell(&self, name: &str) -> Result<(), MountError> {
        let root = self.cell_root(name);
        fs::create_dir_all(&root)?;

        if !is_mounted(&root)? {
            mount(
                Some("tmpfs"),
                &root,
                Some("tmpfs"),
                MsFlags::empty(),
                Some("mode=0755"),
            )
            .map_err(|source| MountError::Mount {
                path: root.clone(),
                source,
            })?;
            log::info!("mounted tmpfs root for cell {:?}", name);
        }

        if self.skeleton_dir.is_dir() {
            copy_skeleton(&self.skeleton_dir, &root)?;
        } else {
            log::warn!("skeleton {:?} missing, cell root left bare", self.skeleton_dir);
        }

        for host in RO_BINDS {
            let host = Path::new(host);
            if !host.is_dir() || !is_mounted(host)? {
                log::debug!("host tree {:?} not present, skipping", host);
                continue;
            }
            let target = root.join(host.strip_prefix("/").unwrap_or(host));
            fs::create_dir_all(&target)?;
            if is_mounted(&target)? {
                continue;
            }
            bind_readonly(host, &target)?;
        }

        let rw = self.rw_dir(name);
        for tree in RW_BINDS {
            let source = rw.join(tree);
            let target = root.join(tree);
            fs::create_dir_all(&source)?;
            fs::create_dir_all(&target)?;
            if is_mounted(&target)? {
                continue;
            }
            bind(&source, &target, MsFlags::MS_BIND)?;
        }

        Ok(())
    }

    /// Fresh tmpfs over the cell's `/dev`, ready for the console bind and
    /// the devpts instance the child sets up after its clone
    pub fn mount_dev(&self, name: &str) -> Result<(), MountError> {
        let dev = self.cell_root(name).join("dev");
        fs::create_dir_all(&dev)?;
        if is_mounted(&dev)? {
            return Ok(());
        }
        bind_tmpfs(&dev, "mode=0755,size=16m")?;
        fs::create_dir_all(dev.join("pts"))?;
        Ok(())
    }

    /// Share the host's dalvik cache into the cell so it does not recompile
    /// the framework. Missing host cache is not an error.
    pub fn mount_dalvik_cache(&self, name: &str) -> Result<(), MountError> {
        let host = Path::new("/data/dalvik-cache");
        if !host.is_dir() {
            log::warn!("host dalvik cache missing, cell {:?} gets its own", name);
            return Ok(());
        }
        let target = self.cell_root(name).join("data/dalvik-cache");
        fs::create_dir_all(&target)?;
        if is_mounted(&target)? {
            return Ok(());
        }
        bind_readonly(host, &target)
    }

    /// Give the cell its own branch of the host sdcard tree
    pub fn mount_sdcard_branch(&self, name: &str) -> Result<(), MountError> {
        let host = Path::new("/mnt/sdcard").join(name);
        fs::create_dir_all(&host)?;
        let target = self.cell_root(name).join("mnt/sdcard");
        fs::create_dir_all(&target)?;
        if is_mounted(&target)? {
            return Ok(());
        }
        bind(&host, &target, MsFlags::MS_BIND)
    }

    /// Best-effort teardown of everything mounted under (and including) the
    /// cell root. Returns the number of umounts that failed.
    pub fn unmount_all(&self, name: &str) -> usize {
        let root = self.cell_root(name);
        let mut failures = 0;

        for suffix in TEARDOWN_ORDER {
            let path = root.join(suffix);
            if matches!(is_mounted(&path), Ok(true)) {
                failures += detach(&path);
            }
        }

        // Catch anything the fixed order missed, deepest paths first
        if let Ok(table) = fs::read_to_string("/proc/mounts") {
            let mut leftovers: Vec<PathBuf> = parse_mounts(&table)
                .into_iter()
                .filter(|p| p.starts_with(&root) && *p != root)
                .collect();
            leftovers.sort_by_key(|p| std::cmp::Reverse(p.components().count()));
            for path in leftovers {
                failures += detach(&path);
            }
        }

        if matches!(is_mounted(&root), Ok(true)) {
            failures += detach(&root);
        }
        failures
    }
}

fn detach(path: &Path) -> usize {
    match umount2(path, MntFlags::MNT_DETACH) {
        Ok(()) => 0,
        Err(err) => {
            log::warn!("umount of {:?} failed: {}", path, err);
            1
        }
    }
}

fn bind(source: &Path, target: &Path, flags: MsFlags) -> Result<(), MountError> {
    mount(Some(source), target, None::<&str>, flags, None::<&str>).map_err(|source| {
        MountError::Mount {
            path: target.to_path_buf(),
            source,
        }
    })
}

/// Bind then remount read-only; a plain read-only bind is silently writable
fn bind_readonly(source: &Path, target: &Path) -> Result<(), MountError> {
    bind(source, target, MsFlags::MS_BIND)?;
    bind(
        source,
        target,
        MsFlags::MS_BIND | MsFlags::MS_REMOUNT | MsFlags::MS_RDONLY,
    )
}

fn bind_tmpfs(target: &Path, options: &str) -> Result<(), MountError> {
    mount(
        Some("tmpfs"),
        target,
        Some("tmpfs"),
        MsFlags::empty(),
        Some(options),
    )
    .map_err(|source| MountError::Mount {
        path: target.to_path_buf(),
        source,
    })
}

/// Whether `path` is itself a mount point, per `/proc/mounts`
fn is_mounted(path: &Path) -> Result<bool, MountError> {
    let table = fs::read_to_string("/proc/mounts")?;
    Ok(parse_mounts(&table).iter().any(|p| p == path))
}

/// Mount targets from a `/proc/mounts` table. Octal escapes in the target
/// field (`\040` for space and friends) are decoded.
pub(crate) fn parse_mounts(table: &str) -> Vec<PathBuf> {
    table
        .lines()
        .filter_map(|line| line.split_whitespace().nth(1))
        .map(unescape_mount_path)
        .collect()
}

fn unescape_mount_path(raw: &str) -> PathBuf {
    let mut out = Vec::with_capacity(raw.len());
    let mut bytes = raw.bytes();
    while let Some(b) = bytes.next() {
        if b != b'\\' {
            out.push(b);
            continue;
        }
        // Octal escapes are raw bytes, not scalar values
        let digits: Vec<u8> = bytes.by_ref().take(3).collect();
        let parsed = std::str::from_utf8(&digits)
            .ok()
            .and_then(|text| u8::from_str_radix(text, 8).ok());
        match parsed {
            Some(byte) => out.push(byte),
            None => {
                out.push(b'\\');
                out.extend_from_slice(&digits);
            }
        }
    }
    PathBuf::from(OsStr::from_bytes(&out))
}

/// Copy the skeleton into the cell root, preserving ownership and mode and
/// translating symlinks. Files already present in the root are kept, so a
/// restart does not clobber state the cell wrote into its tmpfs.
fn copy_skeleton(skeleton: &Path, root: &Path) -> Result<(), MountError> {
    for entry in fs::read_dir(skeleton)? {
        let entry = entry?;
        let source = entry.path();
        let target = root.join(entry.file_name());
        let meta = fs::symlink_metadata(&source)?;

        if meta.file_type().is_symlink() {
            if fs::symlink_metadata(&target).is_err() {
                symlink(fs::read_link(&source)?, &target)?;
                lchown(&target, Some(meta.uid()), Some(meta.gid()))?;
            }
        } else if meta.is_dir() {
            if !target.is_dir() {
                fs::create_dir(&target)?;
                fs::set_permissions(&target, fs::Permissions::from_mode(meta.mode()))?;
                chown(&target, Some(meta.uid()), Some(meta.gid()))?;
            }
            copy_skeleton(&source, &target)?;
        } else if fs::symlink_metadata(&target).is_err() {
            fs::copy(&source, &target)?;
            fs::set_permissions(&target, fs::Permissions::from_mode(meta.mode()))?;
            chown(&target, Some(meta.uid()), Some(meta.gid()))?;
        }
    }
    Ok(())
}
