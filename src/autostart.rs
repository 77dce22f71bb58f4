//! Boot-time supervisor for autostart-flagged cells

use crate::{commands, daemon::Daemon};
use celld_protocol::StartArgs;
use std::{collections::HashMap, io, sync::Arc, thread, time::Duration};

const RETRY_LIMIT: u32 = 3;
const RETRY_DELAY: Duration = Duration::from_secs(1);

pub fn spawn(daemon: Arc<Daemon>) -> io::Result<thread::JoinHandle<()>> {
    thread::Builder::new()
        .name("autostart".to_string())
        .spawn(move || {
            run_once(&daemon);
            // The supervisor thread stays up for the daemon's lifetime;
            // nothing unparks it, so this never returns
            loop {
                thread::park();
            }
        })
}

/// Start every configured cell with the autostart flag, retrying each a few
/// times. Launches use the stored configuration only.
fn run_once(daemon: &Daemon) {
    let names = match daemon.store.list() {
        Ok(names) => names,
        Err(err) => {
            log::error!("autostart scan failed: {}", err);
            return;
        }
    };

    let mut attempts: HashMap<String, u32> = HashMap::new();
    let mut queue: Vec<String> = names
        .into_iter()
        .filter(|name| match daemon.store.read(name) {
            Ok(config) => config.autostart,
            Err(err) => {
                log::warn!("autostart skipped cell {:?}: {}", name, err);
                false
            }
        })
        .collect();

    while let Some(name) = queue.pop() {
        if daemon.registry.is_live(&name) {
            continue;
        }
        match commands::start_cell(daemon, &name, &StartArgs::from_config(), None) {
            Ok(reply) => log::info!("autostart: {}", reply.message),
            Err(err) => {
                let tries = attempts.entry(name.clone()).or_insert(0);
                *tries += 1;
                if *tries < RETRY_LIMIT {
                    log::warn!(
                        "autostart of cell {:?} failed (attempt {}): {}",
                        name,
                        tries,
                        err
                    );
                    thread::sleep(RETRY_DELAY);
                    queue.push(name);
                } else {
                    log::error!("autostart of cell {:?} gave up: {}", name, err);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::daemon::Settings;
    use tempfile::TempDir;

    #[test]
    fn supervisor_thread_outlives_its_scan() {
        let dir = TempDir::new().unwrap();
        let settings = Settings {
            socket_name: "celld-test".to_string(),
            cell_dir: dir.path().join("cells"),
            config_dir: dir.path().join("conf"),
            skeleton_dir: dir.path().join("skel"),
            active_ns_file: dir.path().join("active_ns_pid"),
            init_program: dir.path().join("init"),
            autostart: true,
            reattach: false,
        };
        let daemon = Arc::new(Daemon::new(settings).unwrap());

        // An empty config dir makes the scan a no-op, but the supervisor
        // must still be parked afterwards, not gone
        let handle = spawn(daemon).unwrap();
        thread::sleep(Duration::from_millis(200));
        assert!(!handle.is_finished());
    }
}
