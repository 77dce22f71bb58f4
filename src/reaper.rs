//! SIGCHLD reaper: collects dead cell inits and tears their cells down
//!
//! One dedicated thread blocks on SIGCHLD and drains every reapable child
//! per wakeup, since signals coalesce. Cleanup takes only the registry list
//! locks for the removal itself; unmounting and config rewrites happen
//! after the cell is out of both lists.

use crate::{daemon::Daemon, registry::ListKind};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use signal_hook::{consts::SIGCHLD, iterator::Signals};
use std::{io, sync::Arc, thread};

pub fn spawn(daemon: Arc<Daemon>) -> io::Result<()> {
    let mut signals = Signals::new([SIGCHLD])?;
    thread::Builder::new().name("reaper".to_string()).spawn(move || {
        for _ in signals.forever() {
            drain(&daemon);
        }
    })?;
    Ok(())
}

/// Collect every currently reapable child
fn drain(daemon: &Daemon) {
    loop {
        match waitpid(None, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => break,
            Ok(WaitStatus::Exited(pid, code)) => {
                log::info!("pid {} exited with code {}", pid, code);
                reap(daemon, pid.as_raw());
            }
            Ok(WaitStatus::Signaled(pid, signal, _)) => {
                log::info!("pid {} killed by {:?}", pid, signal);
                reap(daemon, pid.as_raw());
            }
            Ok(status) => {
                log::debug!("ignoring wait status {:?}", status);
            }
            Err(nix::Error::ECHILD) => break,
            Err(err) => {
                log::warn!("waitpid failed: {}", err);
                break;
            }
        }
    }
}

/// Finish one dead init: drop its registry entry, release its console,
/// unmount its tree, and clear its recorded pid
fn reap(daemon: &Daemon, pid: i32) {
    let cell = daemon
        .registry
        .remove_by_pid(ListKind::PendingReap, pid)
        .or_else(|| daemon.registry.remove_by_pid(ListKind::Live, pid));
    let cell = match cell {
        Some(cell) => cell,
        None => {
            // Not a cell init; a launch helper or a double-fork artifact
            log::debug!("reaped unregistered pid {}", pid);
            return;
        }
    };
    log::info!("reaping cell {:?} (pid {})", cell.name, pid);

    daemon.registry.clear_active_if(&cell.name);
    // Console master closes with the cell
    drop(cell.console);

    let failures = daemon.mounts.unmount_all(&cell.name);
    if failures > 0 {
        log::warn!(
            "{} mounts survived teardown of cell {:?}",
            failures,
            cell.name
        );
    }

    match daemon.store.read(&cell.name) {
        Ok(mut config) => {
            config.init_pid = 0;
            config.restart_pid = 0;
            if let Err(err) = daemon.store.write(&cell.name, &config) {
                log::warn!("could not clear pid for cell {:?}: {}", cell.name, err);
            }
        }
        Err(err) => log::warn!("config read for reaped cell {:?} failed: {}", cell.name, err),
    }
}
