//! Error types for the daemon's orchestration core
//!
//! Only the outermost command handler turns one of these into a
//! client-visible reply; everything below returns them to its caller, which
//! decides whether to retry, abort, or keep going with partial teardown.

use celld_protocol::reply::{Reply, STATUS_ALREADY_ACTIVE};
use std::path::PathBuf;
use thiserror::Error;

/// Errors from the per-cell config store
#[derive(Error, Debug)]
pub enum ConfigError {
    /// config io error
    #[error("config io error: {0}")]
    Io(#[from] std::io::Error),

    /// no configuration stored under that cell name
    #[error("no configuration for cell {0:?}")]
    UnknownCell(String),
}

/// Errors while building a cell's filesystem view. Teardown is best-effort
/// and reports a failure count instead.
#[derive(Error, Debug)]
pub enum MountError {
    /// io error during filesystem setup
    #[error("filesystem setup io error: {0}")]
    Io(#[from] std::io::Error),

    /// mount syscall failure
    #[error("mount of {path:?} failed: {source}")]
    Mount { path: PathBuf, source: nix::Error },
}

/// Errors during one launch attempt. Anything raised before the clone call
/// aborts the attempt; after the clone, a failing child is left for the
/// reaper rather than killed synchronously.
#[derive(Error, Debug)]
pub enum LaunchError {
    /// cell config error
    #[error("cell config error: {0}")]
    Config(#[from] ConfigError),

    /// root filesystem setup failed
    #[error("rootfs setup failed: {0}")]
    Mount(#[from] MountError),

    /// clone into new namespaces failed
    #[error("clone failed: {0}")]
    Clone(nix::Error),

    /// cgroup placement failed
    #[error("cgroup setup for pid {pid} failed: {source}")]
    Cgroup { pid: i32, source: std::io::Error },

    /// pipe plumbing failed
    #[error("launch plumbing error: {0}")]
    Pipe(#[from] nix::Error),

    /// child exited before completing the launch handshake
    #[error("launch handshake aborted, cell init exited early")]
    HandshakeAborted,

    /// io error during launch
    #[error("launch io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failures reported back to the client as a non-zero reply status.
///
/// The display strings are the wire messages, so they stay short and
/// newline-free.
#[derive(Error, Debug)]
pub enum CommandError {
    #[error("Cell does not exist.")]
    UnknownCell,

    #[error("Cell already exists.")]
    AlreadyExists,

    #[error("Invalid cell name.")]
    BadName,

    #[error("ID must be between 0 and 9.")]
    BadId,

    #[error("ID is already in use.")]
    IdInUse,

    #[error("Cell is already running.")]
    AlreadyRunning,

    #[error("Cell is not running.")]
    NotRunning,

    #[error("Cell is still starting.")]
    StillStarting,

    #[error("Cell is already active.")]
    AlreadyActive,

    #[error("Only one cell running.")]
    OnlyOneCell,

    #[error("No active cell.")]
    NoActiveCell,

    #[error("Console unavailable.")]
    ConsoleUnavailable,

    #[error("Cannot destroy a running cell.")]
    StillRunning,

    #[error("Failed to start cell: {0}")]
    Launch(#[from] LaunchError),

    #[error("Config store failure: {0}")]
    Config(#[from] ConfigError),

    #[error("Mount failure: {0}")]
    Mount(#[from] MountError),

    #[error("Switch failed: {0}")]
    SwitchIo(std::io::Error),

    #[error("Console descriptor error: {0}")]
    ConsoleIo(std::io::Error),
}

impl CommandError {
    pub fn status(&self) -> u32 {
        match self {
            CommandError::AlreadyActive => STATUS_ALREADY_ACTIVE,
            _ => 1,
        }
    }
}

impl From<CommandError> for Reply {
    fn from(err: CommandError) -> Reply {
        Reply::fail(err.status(), err.to_string())
    }
}
