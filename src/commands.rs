//! Command handlers behind the control channel
//!
//! Each handler owns the locking for its command. Check-then-mutate
//! sequences against the config directory run under the daemon's config
//! lock; registry list locks are only ever taken for short lookups and
//! moves, never across a launch, a kill, or filesystem work.

use crate::{
    daemon::Daemon,
    errors::CommandError,
    launcher::{self, merge_request},
    registry::{Cell, Direction, ListKind, SetActiveOutcome},
};
use celld_protocol::{
    reply::{command_header, encode_list, CellRecord, CellState, Reply},
    CommandArgs, ListFilter, Request, StartArgs, ToggleOp,
};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::{
    os::fd::{OwnedFd, RawFd},
    time::{Duration, Instant},
};

/// How long a `start --wait` blocks on another in-flight start of the same
/// cell before giving up
const WAIT_TIMEOUT: Duration = Duration::from_secs(10);
const WAIT_POLL: Duration = Duration::from_millis(100);

/// What the server should send back for one command
pub enum Outcome {
    Reply(Reply),
    /// A reply line followed by a raw `list` payload
    List(Vec<u8>),
    /// A reply line, an optional command header, then a descriptor transfer
    Handoff {
        reply: Reply,
        header: Option<Vec<u8>>,
        fd: OwnedFd,
    },
}

/// Route one decoded request to its handler
pub fn dispatch(daemon: &Daemon, request: &Request, client_fd: Option<RawFd>) -> Outcome {
    let name = request.name.as_str();
    let result = match &request.args {
        CommandArgs::Create { id } => create(daemon, name, *id),
        CommandArgs::Destroy => destroy(daemon, name),
        CommandArgs::List { filter } => return list(daemon, *filter),
        CommandArgs::Next => step(daemon, Direction::Next),
        CommandArgs::Prev => step(daemon, Direction::Prev),
        CommandArgs::Start(args) => start_cell(daemon, name, args, client_fd),
        CommandArgs::Stop => stop(daemon, name),
        CommandArgs::Switch => switch(daemon, name),
        CommandArgs::Console => return console(daemon, name),
        CommandArgs::Autostart(op) => toggle(daemon, name, *op, Toggle::Autostart),
        CommandArgs::Autoswitch(op) => toggle(daemon, name, *op, Toggle::Autoswitch),
        CommandArgs::GetId => get_id(daemon, name),
        CommandArgs::SetId { id } => set_id(daemon, name, *id),
        CommandArgs::GetActive => get_active(daemon),
        CommandArgs::Mount { all } => mount(daemon, name, *all),
        CommandArgs::Unmount => unmount(daemon, name),
        CommandArgs::RunCmd { command } => return run_cmd(daemon, name, command),
    };
    Outcome::Reply(result.unwrap_or_else(Reply::from))
}

fn validate_name(name: &str) -> Result<(), CommandError> {
    let ok = !name.is_empty()
        && name.len() < 64
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    match ok {
        true => Ok(()),
        false => Err(CommandError::BadName),
    }
}

/// Whether any configured cell other than `skip` already holds `id`
fn id_in_use(daemon: &Daemon, id: u8, skip: Option<&str>) -> Result<bool, CommandError> {
    for name in daemon.store.list()? {
        if skip == Some(name.as_str()) {
            continue;
        }
        if daemon.store.read(&name)?.cell_id() == Some(id) {
            return Ok(true);
        }
    }
    Ok(false)
}

fn create(daemon: &Daemon, name: &str, id: Option<u8>) -> Result<Reply, CommandError> {
    validate_name(name)?;
    let _guard = daemon.lock_config();
    if daemon.store.exists(name) {
        return Err(CommandError::AlreadyExists);
    }
    let mut config = crate::config::CellConfig::default();
    if let Some(id) = id {
        if id > 9 {
            return Err(CommandError::BadId);
        }
        if id_in_use(daemon, id, None)? {
            return Err(CommandError::IdInUse);
        }
        config.id = id as i32;
    }
    daemon.store.write(name, &config)?;
    log::info!("cell {:?} created", name);
    Ok(Reply::ok(format!("Created {}", name)))
}

fn destroy(daemon: &Daemon, name: &str) -> Result<Reply, CommandError> {
    validate_name(name)?;
    let _guard = daemon.lock_config();
    if daemon.registry.is_live(name) || daemon.registry.contains(ListKind::PendingReap, name) {
        return Err(CommandError::StillRunning);
    }
    if !daemon.store.exists(name) {
        return Err(CommandError::UnknownCell);
    }
    let failures = daemon.mounts.unmount_all(name);
    if failures > 0 {
        log::warn!("{} mounts survived teardown of cell {:?}", failures, name);
    }
    daemon.store.remove(name)?;
    log::info!("cell {:?} destroyed", name);
    Ok(Reply::ok(format!("Destroyed {}", name)))
}

fn list(daemon: &Daemon, filter: ListFilter) -> Outcome {
    let active = daemon.registry.active_name();
    let mut records = Vec::new();

    if filter != ListFilter::Zombie {
        records.extend(daemon.registry.map_cells(ListKind::Live, |cell| {
            let state = if cell.starting {
                CellState::Starting
            } else if active.as_deref() == Some(cell.name.as_str()) {
                CellState::Active
            } else {
                CellState::Running
            };
            CellRecord {
                name: cell.name.clone(),
                state,
                pid: cell.init_pid,
            }
        }));
    }

    if filter != ListFilter::Running {
        records.extend(
            daemon
                .registry
                .map_cells(ListKind::PendingReap, |cell| CellRecord {
                    name: cell.name.clone(),
                    state: CellState::Zombie,
                    pid: cell.init_pid,
                }),
        );
    }

    if filter == ListFilter::All {
        match daemon.store.list() {
            Ok(names) => {
                for name in names {
                    if records.iter().any(|r| r.name == name) {
                        continue;
                    }
                    records.push(CellRecord {
                        name,
                        state: CellState::Stopped,
                        pid: None,
                    });
                }
            }
            Err(err) => log::warn!("config scan during list failed: {}", err),
        }
    }

    Outcome::List(encode_list(&records))
}

fn step(daemon: &Daemon, direction: Direction) -> Result<Reply, CommandError> {
    let target = daemon
        .registry
        .neighbor(direction)
        .ok_or(CommandError::OnlyOneCell)?;
    switch(daemon, &target)
}

fn switch(daemon: &Daemon, name: &str) -> Result<Reply, CommandError> {
    validate_name(name)?;
    match daemon.registry.set_active(name)? {
        SetActiveOutcome::Switched => Ok(Reply::ok(format!("Switched to {}", name))),
        SetActiveOutcome::AlreadyActive => Err(CommandError::AlreadyActive),
    }
}

/// Launch one cell. Shared between the `start` command and the autostart
/// scan, which is why it takes the raw pieces instead of a [`Request`].
pub fn start_cell(
    daemon: &Daemon,
    name: &str,
    args: &StartArgs,
    client_fd: Option<RawFd>,
) -> Result<Reply, CommandError> {
    validate_name(name)?;

    if let Some(starting) = daemon
        .registry
        .with_cell(ListKind::Live, name, |cell| cell.starting)
    {
        if !starting {
            return Err(CommandError::AlreadyRunning);
        }
        if !args.wait {
            return Err(CommandError::StillStarting);
        }
        return wait_for_start(daemon, name, WAIT_TIMEOUT);
    }

    let _guard = daemon.lock_config();
    // Re-check under the lock, a concurrent start may have won the race
    if daemon.registry.is_live(name) {
        return Err(CommandError::AlreadyRunning);
    }
    if !daemon.store.exists(name) {
        return Err(CommandError::UnknownCell);
    }

    let stored = daemon.store.read(name)?;
    let request = merge_request(&stored, args);
    daemon.store.write(name, &request.config)?;
    let launched = launcher::launch(daemon, name, &request, client_fd)?;

    let cell = Cell {
        init_pid: Some(launched.pid),
        starting: true,
        console: launched.console,
        ..Cell::new(name, request.config.cell_id())
    };
    daemon.registry.insert(ListKind::Live, cell);
    launched.ready.signal();
    daemon
        .registry
        .with_cell(ListKind::Live, name, |cell| cell.starting = false);

    let mut config = request.config.clone();
    config.init_pid = launched.pid;
    config.restart_pid = launched.pid;
    config.newcell = false;
    daemon.store.write(name, &config)?;

    if config.autoswitch {
        match daemon.registry.set_active(name) {
            Ok(_) => {}
            Err(err) => log::warn!("autoswitch to {:?} failed: {}", name, err),
        }
    }

    log::info!("cell {:?} started, init pid {}", name, launched.pid);
    Ok(Reply::ok(format!("Started {}", name)))
}

/// Block until another thread's in-flight start of `name` settles
fn wait_for_start(daemon: &Daemon, name: &str, timeout: Duration) -> Result<Reply, CommandError> {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        match daemon
            .registry
            .with_cell(ListKind::Live, name, |cell| cell.starting)
        {
            Some(true) => std::thread::sleep(WAIT_POLL),
            Some(false) => return Ok(Reply::ok(format!("Started {}", name))),
            // It died while starting; the reaper already took it
            None => return Err(CommandError::NotRunning),
        }
    }
    Err(CommandError::StillStarting)
}

fn stop(daemon: &Daemon, name: &str) -> Result<Reply, CommandError> {
    validate_name(name)?;

    let starting = daemon
        .registry
        .with_cell(ListKind::Live, name, |cell| cell.starting)
        .ok_or(CommandError::NotRunning)?;
    if starting {
        return Err(CommandError::StillStarting);
    }

    daemon.registry.clear_active_if(name);
    let cell = daemon
        .registry
        .remove(ListKind::Live, name)
        .ok_or(CommandError::NotRunning)?;
    let pid = cell.init_pid;
    daemon.registry.insert(ListKind::PendingReap, cell);

    if let Some(pid) = pid {
        if let Err(err) = kill(Pid::from_raw(pid), Signal::SIGKILL) {
            log::warn!("kill of cell {:?} init pid {} failed: {}", name, pid, err);
        }
    }

    let _guard = daemon.lock_config();
    let mut config = daemon.store.read(name)?;
    config.restart_pid = 0;
    daemon.store.write(name, &config)?;

    log::info!("cell {:?} stopping, awaiting reap", name);
    Ok(Reply::ok(format!("Stopped {}", name)))
}

fn console(daemon: &Daemon, name: &str) -> Outcome {
    let result = console_fd(daemon, name);
    match result {
        Ok(fd) => Outcome::Handoff {
            reply: Reply::ok("Console attached"),
            header: None,
            fd,
        },
        Err(err) => Outcome::Reply(err.into()),
    }
}

fn run_cmd(daemon: &Daemon, name: &str, command: &str) -> Outcome {
    match console_fd(daemon, name) {
        Ok(fd) => Outcome::Handoff {
            reply: Reply::ok(format!("Running command in {}", name)),
            header: Some(command_header(command)),
            fd,
        },
        Err(err) => Outcome::Reply(err.into()),
    }
}

/// Duplicate the named cell's console master for transfer to the client
fn console_fd(daemon: &Daemon, name: &str) -> Result<OwnedFd, CommandError> {
    validate_name(name)?;
    daemon
        .registry
        .with_cell(ListKind::Live, name, |cell| {
            if cell.starting {
                return Err(CommandError::StillStarting);
            }
            match &cell.console {
                Some(console) => console.dup_master().map_err(CommandError::ConsoleIo),
                None => Err(CommandError::ConsoleUnavailable),
            }
        })
        .ok_or(CommandError::NotRunning)?
}

#[derive(Copy, Clone)]
enum Toggle {
    Autostart,
    Autoswitch,
}

fn toggle(daemon: &Daemon, name: &str, op: ToggleOp, which: Toggle) -> Result<Reply, CommandError> {
    validate_name(name)?;
    let _guard = daemon.lock_config();
    if !daemon.store.exists(name) {
        return Err(CommandError::UnknownCell);
    }
    let mut config = daemon.store.read(name)?;
    let (label, flag) = match which {
        Toggle::Autostart => ("Autostart", &mut config.autostart),
        Toggle::Autoswitch => ("Autoswitch", &mut config.autoswitch),
    };
    match op {
        ToggleOp::Query => {
            let state = if *flag { "on" } else { "off" };
            return Ok(Reply::ok(format!("{} is {} for {}", label, state, name)));
        }
        ToggleOp::On => *flag = true,
        ToggleOp::Off => *flag = false,
    }
    let state = if matches!(op, ToggleOp::On) { "on" } else { "off" };
    let message = format!("{} {} for {}", label, state, name);
    daemon.store.write(name, &config)?;
    Ok(Reply::ok(message))
}

fn get_id(daemon: &Daemon, name: &str) -> Result<Reply, CommandError> {
    validate_name(name)?;
    if !daemon.store.exists(name) {
        return Err(CommandError::UnknownCell);
    }
    let config = daemon.store.read(name)?;
    match config.cell_id() {
        Some(id) => Ok(Reply::ok(id.to_string())),
        None => Ok(Reply::ok("none")),
    }
}

fn set_id(daemon: &Daemon, name: &str, id: u8) -> Result<Reply, CommandError> {
    validate_name(name)?;
    if id > 9 {
        return Err(CommandError::BadId);
    }
    let _guard = daemon.lock_config();
    if !daemon.store.exists(name) {
        return Err(CommandError::UnknownCell);
    }
    if id_in_use(daemon, id, Some(name))? {
        return Err(CommandError::IdInUse);
    }
    let mut config = daemon.store.read(name)?;
    config.id = id as i32;
    daemon.store.write(name, &config)?;
    daemon
        .registry
        .with_cell(ListKind::Live, name, |cell| cell.id = Some(id));
    Ok(Reply::ok(format!("Changed {}'s ID to {}", name, id)))
}

fn get_active(daemon: &Daemon) -> Result<Reply, CommandError> {
    daemon
        .registry
        .active_name()
        .map(Reply::ok)
        .ok_or(CommandError::NoActiveCell)
}

fn mount(daemon: &Daemon, name: &str, all: bool) -> Result<Reply, CommandError> {
    let _guard = daemon.lock_config();
    if all {
        let mut mounted = 0;
        for name in daemon.store.list()? {
            daemon.mounts.mount_cell(&name)?;
            mounted += 1;
        }
        return Ok(Reply::ok(format!("Mounted {} cells", mounted)));
    }
    validate_name(name)?;
    if !daemon.store.exists(name) {
        return Err(CommandError::UnknownCell);
    }
    daemon.mounts.mount_cell(name)?;
    Ok(Reply::ok(format!("Mounted {}", name)))
}

fn unmount(daemon: &Daemon, name: &str) -> Result<Reply, CommandError> {
    validate_name(name)?;
    if daemon.registry.is_live(name) {
        return Err(CommandError::StillRunning);
    }
    let failures = daemon.mounts.unmount_all(name);
    match failures {
        0 => Ok(Reply::ok(format!("Unmounted {}", name))),
        n => Ok(Reply::fail(1, format!("Unmounted {} with {} failures", name, n))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::daemon::Settings;
    use tempfile::TempDir;

    fn daemon() -> (TempDir, Daemon) {
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
        (dir, Daemon::new(settings).unwrap())
    }

    #[test]
    fn wait_gives_up_on_a_stuck_start() {
        let (_dir, daemon) = daemon();
        let cell = Cell {
            init_pid: Some(1),
            starting: true,
            ..Cell::new("cell1", None)
        };
        daemon.registry.insert(ListKind::Live, cell);

        let result = wait_for_start(&daemon, "cell1", Duration::from_millis(250));
        assert!(matches!(result, Err(CommandError::StillStarting)));
    }

    #[test]
    fn wait_returns_once_start_settles() {
        let (_dir, daemon) = daemon();
        let cell = Cell {
            init_pid: Some(1),
            starting: true,
            ..Cell::new("cell1", None)
        };
        daemon.registry.insert(ListKind::Live, cell);

        std::thread::scope(|scope| {
            scope.spawn(|| {
                std::thread::sleep(Duration::from_millis(150));
                daemon
                    .registry
                    .with_cell(ListKind::Live, "cell1", |cell| cell.starting = false);
            });
            let reply = wait_for_start(&daemon, "cell1", Duration::from_secs(5)).unwrap();
            assert_eq!(reply.status, 0);
            assert_eq!(reply.message, "Started cell1");
        });
    }

    #[test]
    fn wait_reports_a_cell_that_died() {
        let (_dir, daemon) = daemon();
        // Never registered, same as reaped mid-wait
        let result = wait_for_start(&daemon, "cell1", Duration::from_secs(5));
        assert!(matches!(result, Err(CommandError::NotRunning)));
    }

    #[test]
    fn name_validation() {
        assert!(validate_name("cell1").is_ok());
        assert!(validate_name("work-phone_2").is_ok());
        assert!(validate_name("").is_err());
        assert!(validate_name("has space").is_err());
        assert!(validate_name("dot.dot").is_err());
        assert!(validate_name(&"x".repeat(64)).is_err());
        assert!(validate_name(&"x".repeat(63)).is_ok());
    }
}
