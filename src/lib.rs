//! celld, a privileged daemon that runs isolated Linux execution
//! environments ("cells") on a shared kernel
//!
//! Each cell is a namespaced init process with its own filesystem view,
//! cgroup limits, and console pty, orchestrated over a binary control
//! protocol on an abstract unix socket. See [`daemon::Daemon`] for the
//! assembly and [`commands`] for the operation surface.

#[cfg(not(any(target_os = "linux", target_os = "android")))]
compile_error!("celld only works on linux or android");

pub mod autostart;
pub mod cgroup;
pub mod commands;
pub mod config;
pub mod console;
pub mod daemon;
pub mod errors;
pub mod launcher;
pub mod mounts;
pub mod net;
pub mod reaper;
pub mod registry;
pub mod server;

pub use daemon::{Daemon, Settings};
