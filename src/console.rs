//! Pseudo-terminal provider for interactive cell consoles
//!
//! The slave side is bind-mounted over the cell's `/dev/console` so the
//! cell's init can open it like a real console device; the master side stays
//! with the daemon until a client claims it over the control channel.

use crate::errors::MountError;
use nix::{
    mount::{mount, MsFlags},
    pty::openpty,
};
use std::{
    fs,
    io,
    os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd},
    path::{Path, PathBuf},
};

/// One allocated console PTY pair.
///
/// The daemon-side slave descriptor is kept open so the pair stays usable
/// while no client is attached; dropping the whole struct releases both
/// ends.
#[derive(Debug)]
pub struct ConsolePty {
    master: OwnedFd,
    _slave: OwnedFd,
    slave_path: PathBuf,
}

impl ConsolePty {
    pub fn master(&self) -> BorrowedFd<'_> {
        self.master.as_fd()
    }

    /// Duplicate the master for transfer to a client
    pub fn dup_master(&self) -> io::Result<OwnedFd> {
        self.master.try_clone()
    }

    pub fn slave_path(&self) -> &Path {
        &self.slave_path
    }
}

/// Allocate a PTY pair and bind its slave onto `<root>/dev/console`.
///
/// Launch keeps going without a console if this fails; the caller downgrades
/// the cell's console to "unavailable".
pub fn create_console(root: &Path) -> Result<ConsolePty, MountError> {
    let pty = openpty(None, None).map_err(io::Error::from)?;
    let slave_path = fs::read_link(format!("/proc/self/fd/{}", pty.slave.as_raw_fd()))?;

    let console = root.join("dev/console");
    if let Some(parent) = console.parent() {
        fs::create_dir_all(parent)?;
    }
    if !console.exists() {
        fs::write(&console, b"")?;
    }
    mount(
        Some(&slave_path),
        &console,
        None::<&str>,
        MsFlags::MS_BIND,
        None::<&str>,
    )
    .map_err(|source| MountError::Mount {
        path: console,
        source,
    })?;

    log::debug!("console pty {:?} bound into {:?}", slave_path, root);
    Ok(ConsolePty {
        master: pty.master,
        _slave: pty.slave,
        slave_path,
    })
}
