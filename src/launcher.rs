//! Namespace launcher: clone, filesystem entry, cgroup placement, and the
//! three-pipe startup handshake
//!
//! The handshake pipes keep the child parked until the daemon has finished
//! its half of the work:
//!
//!   cgroup pipe   parent -> child   "your cgroups are set, proceed"
//!   child pipe    child -> parent   "namespaces entered, at the exec gate"
//!   daemon pipe   parent -> child   "registered, exec your init now"
//!
//! The daemon pipe is signaled by the command handler only after the cell is
//! in the registry, so no cell ever runs an init the daemon cannot account
//! for. A child that dies at any gate just EOFs the next read; post-clone
//! failures never try to kill it synchronously, the reaper owns exit
//! collection.

use crate::{
    cgroup,
    config::CellConfig,
    console::{create_console, ConsolePty},
    daemon::Daemon,
    errors::LaunchError,
};
use celld_protocol::StartArgs;
use nix::{
    mount::{mount, umount2, MntFlags, MsFlags},
    sched::{clone, CloneFlags},
    unistd::{self, chdir, chroot, execv, pivot_root, setsid},
};
use std::{
    ffi::CString,
    fs, io,
    os::fd::{AsFd, AsRawFd, OwnedFd, RawFd},
    path::{Path, PathBuf},
};

const CHILD_STACK_SIZE: usize = 1024 * 1024;

/// A merged launch request: stored configuration overlaid with the
/// per-invocation options from the client
pub struct LaunchRequest {
    pub config: CellConfig,
    pub wait: bool,
    pub pidfile: Option<PathBuf>,
}

/// Overlay `args` onto the stored config. With `noopt` the stored config
/// wins wholesale and only the per-invocation fields are taken from `args`.
pub fn merge_request(stored: &CellConfig, args: &StartArgs) -> LaunchRequest {
    let mut config = stored.clone();
    if !args.noopt {
        config.uts = args.uts;
        config.ipc = args.ipc;
        config.user = args.user;
        config.net = args.net;
        config.pid = args.pid;
        config.mount = args.mount;
        config.mount_rootfs = args.mount_rootfs;
        config.tmpfs_dev = args.tmpfs_dev;
        config.newpts = args.newpts;
        config.newcgroup = args.newcgroup;
        config.share_dalvik_cache = args.share_dalvik_cache;
        config.sdcard_branch = args.sdcard_branch;
        config.console = args.console;
        config.autoswitch = args.autoswitch;
    }
    LaunchRequest {
        config,
        wait: args.wait,
        pidfile: match args.pidfile.is_empty() {
            true => None,
            false => Some(PathBuf::from(&args.pidfile)),
        },
    }
}

/// Namespace set requested by a config. A pid namespace needs its own
/// `/proc` and a fresh devpts needs its own mount table, so either of those
/// flags pulls in a mount namespace as well.
pub fn namespace_flags(config: &CellConfig) -> CloneFlags {
    let mut flags = CloneFlags::empty();
    if config.uts {
        flags |= CloneFlags::CLONE_NEWUTS;
    }
    if config.ipc {
        flags |= CloneFlags::CLONE_NEWIPC;
    }
    if config.user {
        flags |= CloneFlags::CLONE_NEWUSER;
    }
    if config.net {
        flags |= CloneFlags::CLONE_NEWNET;
    }
    if config.pid {
        flags |= CloneFlags::CLONE_NEWPID;
    }
    if config.mount || config.pid || config.newpts {
        flags |= CloneFlags::CLONE_NEWNS;
    }
    flags
}

/// Parent's end of the daemon pipe. The command handler signals it once the
/// cell is registered, releasing the child into its exec.
pub struct DaemonReady(OwnedFd);

impl DaemonReady {
    pub fn signal(self) {
        if let Err(err) = unistd::write(self.0.as_fd(), &[1]) {
            log::warn!("ready signal lost, cell init likely died: {}", err);
        }
    }
}

/// A successfully launched cell, waiting on its final ready signal
pub struct Launched {
    pub pid: i32,
    pub console: Option<ConsolePty>,
    pub ready: DaemonReady,
}

/// Build the cell's filesystem, allocate its console, and clone its init.
///
/// `client_fd` is the requesting connection's descriptor; the child closes
/// it so a dying client cannot hold the socket open from inside the cell.
pub fn launch(
    daemon: &Daemon,
    name: &str,
    request: &LaunchRequest,
    client_fd: Option<RawFd>,
) -> Result<Launched, LaunchError> {
    let config = &request.config;

    // Everything up to the clone is abortable: on failure, tear down
    // whatever this attempt already mounted.
    let prepared = match prepare(daemon, name, config) {
        Ok(prepared) => prepared,
        Err(err) => {
            let failures = daemon.mounts.unmount_all(name);
            if failures > 0 {
                log::warn!("{} mounts left behind by failed launch of {:?}", failures, name);
            }
            return Err(err);
        }
    };
    let Prepared {
        console,
        init,
        cgroup_r,
        cgroup_w,
        child_r,
        child_w,
        daemon_r,
        daemon_w,
    } = prepared;
    let root = daemon.mounts.cell_root(name);
    let flags = namespace_flags(config);

    let mut stack = vec![0u8; CHILD_STACK_SIZE];
    let child = ChildSetup {
        hostname: name.to_string(),
        root: root.clone(),
        flags,
        newpts: config.newpts,
        init,
        client_fd,
        cgroup_r: cgroup_r.as_raw_fd(),
        child_w: child_w.as_raw_fd(),
        daemon_r: daemon_r.as_raw_fd(),
        close_in_child: [
            cgroup_w.as_raw_fd(),
            child_r.as_raw_fd(),
            daemon_w.as_raw_fd(),
        ],
    };

    let pid = unsafe {
        clone(
            Box::new(|| child.run()),
            &mut stack,
            flags,
            Some(libc::SIGCHLD),
        )
    }
    .map_err(LaunchError::Clone)?;
    let pid = pid.as_raw();
    log::info!("cell {:?} init cloned as pid {}", name, pid);

    // Child's pipe ends belong to the child now
    drop(cgroup_r);
    drop(child_w);
    drop(daemon_r);

    if config.newcgroup {
        // On failure the child EOFs at the cgroup gate and exits; the
        // reaper collects it like any other dead cell.
        cgroup::enter_cgroups(name, pid)?;
    }
    unistd::write(cgroup_w.as_fd(), &[1]).map_err(LaunchError::Pipe)?;
    drop(cgroup_w);

    let mut byte = [0u8; 1];
    match unistd::read(child_r.as_raw_fd(), &mut byte) {
        Ok(1) => {}
        Ok(_) => return Err(LaunchError::HandshakeAborted),
        Err(err) => return Err(LaunchError::Pipe(err)),
    }
    drop(child_r);

    if config.net {
        if let Err(err) = daemon.net.attach(name, pid) {
            log::warn!("network attach for cell {:?} failed: {}", name, err);
        }
    }

    if let Some(pidfile) = &request.pidfile {
        if let Err(err) = fs::write(pidfile, pid.to_string()) {
            log::warn!("pidfile {:?} not written: {}", pidfile, err);
        }
    }

    Ok(Launched {
        pid,
        console,
        ready: DaemonReady(daemon_w),
    })
}

struct Prepared {
    console: Option<ConsolePty>,
    init: CString,
    cgroup_r: OwnedFd,
    cgroup_w: OwnedFd,
    child_r: OwnedFd,
    child_w: OwnedFd,
    daemon_r: OwnedFd,
    daemon_w: OwnedFd,
}

/// Pre-clone half of a launch: filesystem, console, exec path, pipes
fn prepare(daemon: &Daemon, name: &str, config: &CellConfig) -> Result<Prepared, LaunchError> {
    let root = daemon.mounts.cell_root(name);

    if config.mount_rootfs {
        daemon.mounts.mount_cell(name)?;
    } else {
        // The operator manages this root themselves; only the directory
        // itself has to exist for the child to enter it.
        fs::create_dir_all(&root)?;
    }
    if config.tmpfs_dev {
        daemon.mounts.mount_dev(name)?;
    }
    if config.share_dalvik_cache {
        daemon.mounts.mount_dalvik_cache(name)?;
    }
    if config.sdcard_branch {
        daemon.mounts.mount_sdcard_branch(name)?;
    }

    let console = match config.console {
        false => None,
        true => match create_console(&root) {
            Ok(console) => Some(console),
            Err(err) => {
                log::warn!("console setup for cell {:?} failed: {}", name, err);
                None
            }
        },
    };

    let init = CString::new(daemon.settings.init_program.as_os_str().as_encoded_bytes())
        .map_err(|err| LaunchError::Io(io::Error::new(io::ErrorKind::InvalidInput, err)))?;

    let (cgroup_r, cgroup_w) = unistd::pipe().map_err(LaunchError::Pipe)?;
    let (child_r, child_w) = unistd::pipe().map_err(LaunchError::Pipe)?;
    let (daemon_r, daemon_w) = unistd::pipe().map_err(LaunchError::Pipe)?;

    Ok(Prepared {
        console,
        init,
        cgroup_r,
        cgroup_w,
        child_r,
        child_w,
        daemon_r,
        daemon_w,
    })
}

/// Everything the child needs, gathered before the clone so the child
/// closure does no allocation
struct ChildSetup {
    hostname: String,
    root: PathBuf,
    flags: CloneFlags,
    newpts: bool,
    init: CString,
    client_fd: Option<RawFd>,
    cgroup_r: RawFd,
    child_w: RawFd,
    daemon_r: RawFd,
    close_in_child: [RawFd; 3],
}

impl ChildSetup {
    fn run(&self) -> isize {
        match self.enter() {
            Ok(()) => 0,
            Err(err) => {
                eprintln!("cell init setup failed: {}", err);
                127
            }
        }
    }

    fn enter(&self) -> nix::Result<()> {
        setsid()?;
        if let Some(fd) = self.client_fd {
            unsafe { libc::close(fd) };
        }
        for fd in self.close_in_child {
            unsafe { libc::close(fd) };
        }

        if self.flags.contains(CloneFlags::CLONE_NEWUTS) {
            unistd::sethostname(&self.hostname)?;
        }

        if self.flags.contains(CloneFlags::CLONE_NEWNS) {
            // Keep our mount changes from leaking back to the host, then
            // swap the cell root in as /
            mount(
                None::<&str>,
                "/",
                None::<&str>,
                MsFlags::MS_REC | MsFlags::MS_PRIVATE,
                None::<&str>,
            )?;
            chdir(&self.root)?;
            pivot_root(".", ".")?;
            umount2(".", MntFlags::MNT_DETACH)?;
            chdir("/")?;
        } else {
            chroot(&self.root)?;
            chdir("/")?;
        }

        if self.newpts {
            mount(
                Some("devpts"),
                "/dev/pts",
                Some("devpts"),
                MsFlags::empty(),
                Some("newinstance,ptmxmode=0666,mode=0620"),
            )?;
        }

        self.wait_at_gate(self.cgroup_r)?;
        let child_w = unsafe { std::os::fd::BorrowedFd::borrow_raw(self.child_w) };
        unistd::write(child_w, &[1])?;
        self.wait_at_gate(self.daemon_r)?;

        execv(&self.init, &[self.init.as_c_str()])?;
        unreachable!()
    }

    /// Block until the parent writes a byte. EOF means the daemon gave up
    /// on this launch.
    fn wait_at_gate(&self, fd: RawFd) -> nix::Result<()> {
        let mut byte = [0u8; 1];
        match unistd::read(fd, &mut byte)? {
            1 => Ok(()),
            _ => Err(nix::Error::EPIPE),
        }
    }
}

/// Reap-safe pid probe for re-attach after a daemon restart
pub fn pid_is_alive(pid: i32) -> bool {
    Path::new("/proc").join(pid.to_string()).is_dir()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::daemon::Settings;
    use tempfile::TempDir;

    #[test]
    fn prepare_skips_rootfs_when_not_requested() {
        let dir = TempDir::new().unwrap();
        let settings = Settings {
            socket_name: "celld-test".to_string(),
            cell_dir: dir.path().join("cells"),
            config_dir: dir.path().join("conf"),
            skeleton_dir: dir.path().join("skel"),
            active_ns_file: dir.path().join("active_ns_pid"),
            init_program: dir.path().join("init"),
            autostart: false,
            reattach: false,
        };
        fs::create_dir_all(dir.path().join("skel")).unwrap();
        fs::write(dir.path().join("skel/init.rc"), "on boot\n").unwrap();
        let daemon = Daemon::new(settings).unwrap();

        let config = CellConfig {
            mount_rootfs: false,
            tmpfs_dev: false,
            console: false,
            ..CellConfig::default()
        };
        let _prepared = prepare(&daemon, "cell1", &config).unwrap();

        // The root exists but nothing was copied or bound into it
        let root = daemon.mounts.cell_root("cell1");
        assert!(root.is_dir());
        assert_eq!(fs::read_dir(&root).unwrap().count(), 0);
    }

    #[test]
    fn flags_follow_config() {
        let config = CellConfig::default();
        let flags = namespace_flags(&config);
        assert!(flags.contains(CloneFlags::CLONE_NEWUTS));
        assert!(flags.contains(CloneFlags::CLONE_NEWIPC));
        assert!(flags.contains(CloneFlags::CLONE_NEWNET));
        assert!(flags.contains(CloneFlags::CLONE_NEWPID));
        assert!(flags.contains(CloneFlags::CLONE_NEWNS));
        assert!(!flags.contains(CloneFlags::CLONE_NEWUSER));
    }

    #[test]
    fn pid_or_pts_pull_in_mount_namespace() {
        let mut config = CellConfig {
            uts: false,
            ipc: false,
            net: false,
            pid: true,
            mount: false,
            newpts: false,
            ..CellConfig::default()
        };
        assert!(namespace_flags(&config).contains(CloneFlags::CLONE_NEWNS));

        config.pid = false;
        config.newpts = true;
        assert!(namespace_flags(&config).contains(CloneFlags::CLONE_NEWNS));

        config.newpts = false;
        assert!(namespace_flags(&config).is_empty());
    }

    #[test]
    fn merge_respects_noopt() {
        let stored = CellConfig {
            net: false,
            console: false,
            ..CellConfig::default()
        };

        let merged = merge_request(&stored, &StartArgs::from_config());
        assert_eq!(merged.config, stored);
        assert!(!merged.wait);
        assert!(merged.pidfile.is_none());

        let args = StartArgs {
            net: true,
            console: true,
            wait: true,
            pidfile: "/run/cell1.pid".to_string(),
            ..StartArgs::default()
        };
        let merged = merge_request(&stored, &args);
        assert!(merged.config.net);
        assert!(merged.config.console);
        assert!(!merged.config.uts);
        assert!(merged.wait);
        assert_eq!(merged.pidfile, Some(PathBuf::from("/run/cell1.pid")));
    }
}
