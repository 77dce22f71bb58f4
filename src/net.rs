//! Network attachment seam
//!
//! Wiring a cell's network namespace to the host (veth pairs, bridge
//! membership, address assignment) is platform policy, so it sits behind a
//! trait the daemon calls after a successful launch. The default
//! implementation attaches nothing; cells launched with a network namespace
//! simply have a loopback-only view until a real helper is installed.

use std::io;

pub trait NetworkHelper: Send + Sync {
    /// Connect the network namespace owned by `init_pid` to the host
    fn attach(&self, cell: &str, init_pid: i32) -> io::Result<()>;
}

/// Placeholder helper used when no platform networking is configured
pub struct DisabledNetwork;

impl NetworkHelper for DisabledNetwork {
    fn attach(&self, cell: &str, init_pid: i32) -> io::Result<()> {
        log::warn!(
            "no network helper configured, cell {:?} (pid {}) keeps loopback only",
            cell,
            init_pid
        );
        Ok(())
    }
}
