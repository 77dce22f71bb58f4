//! Daemon assembly: settings, shared state, and the startup sequence

use crate::{
    autostart,
    config::ConfigStore,
    errors::ConfigError,
    launcher,
    mounts::MountManager,
    net::{DisabledNetwork, NetworkHelper},
    reaper,
    registry::{Cell, ListKind, Registry},
    server,
};
use std::{
    io,
    path::PathBuf,
    sync::{Arc, Mutex, MutexGuard},
};

/// Daemon-wide paths and switches, fixed at startup
#[derive(Debug, Clone)]
pub struct Settings {
    /// Abstract unix socket name for the control channel
    pub socket_name: String,
    /// Parent directory of per-cell roots and `-rw` state
    pub cell_dir: PathBuf,
    /// Per-cell config files
    pub config_dir: PathBuf,
    /// Template tree copied into each cell root
    pub skeleton_dir: PathBuf,
    /// Kernel control file the active cell's init pid is written to
    pub active_ns_file: PathBuf,
    /// Path of the init binary inside each cell root
    pub init_program: PathBuf,
    /// Launch autostart-flagged cells at boot
    pub autostart: bool,
    /// Pick up cells left running by a previous daemon instance
    pub reattach: bool,
}

impl Default for Settings {
    fn default() -> Settings {
        Settings {
            socket_name: "celld".to_string(),
            cell_dir: PathBuf::from("/data/cells"),
            config_dir: PathBuf::from("/data/cells/conf"),
            skeleton_dir: PathBuf::from("/data/cells/skel"),
            active_ns_file: PathBuf::from("/proc/dev_ns/active_ns_pid"),
            init_program: PathBuf::from("/init"),
            autostart: true,
            reattach: true,
        }
    }
}

pub struct Daemon {
    pub settings: Settings,
    pub registry: Registry,
    pub store: ConfigStore,
    pub mounts: MountManager,
    pub net: Box<dyn NetworkHelper>,
    /// Serializes config-directory check-then-mutate sequences (create,
    /// destroy, setid, start). Never held while a list mutex is taken by
    /// someone else's blocking work; the reaper never takes it at all.
    config_lock: Mutex<()>,
}

impl Daemon {
    /// Build the daemon's state and create its directories. Does not touch
    /// the control socket, so tests can drive commands directly.
    pub fn new(settings: Settings) -> Result<Daemon, ConfigError> {
        Daemon::with_network(settings, Box::new(DisabledNetwork))
    }

    pub fn with_network(
        settings: Settings,
        net: Box<dyn NetworkHelper>,
    ) -> Result<Daemon, ConfigError> {
        let store = ConfigStore::new(&settings.config_dir);
        store.ensure_dir()?;
        std::fs::create_dir_all(&settings.cell_dir)?;
        let registry = Registry::new(settings.active_ns_file.clone());
        let mounts = MountManager::new(&settings.cell_dir, &settings.skeleton_dir);
        Ok(Daemon {
            settings,
            registry,
            store,
            mounts,
            net,
            config_lock: Mutex::new(()),
        })
    }

    pub fn lock_config(&self) -> MutexGuard<'_, ()> {
        self.config_lock.lock().unwrap()
    }

    /// Adopt cells whose init survived a daemon restart. A recorded pid
    /// that is no longer alive is cleared so the cell reads as stopped.
    pub fn reattach(&self) -> Result<(), ConfigError> {
        let _guard = self.lock_config();
        for name in self.store.list()? {
            let mut config = self.store.read(&name)?;
            if config.init_pid <= 0 {
                continue;
            }
            if launcher::pid_is_alive(config.init_pid) {
                log::info!(
                    "re-attached cell {:?}, init pid {} still running",
                    name,
                    config.init_pid
                );
                let cell = Cell {
                    init_pid: Some(config.init_pid),
                    non_child: true,
                    ..Cell::new(&name, config.cell_id())
                };
                self.registry.insert(ListKind::Live, cell);
            } else {
                log::info!("cell {:?} died while the daemon was down", name);
                config.init_pid = 0;
                config.restart_pid = 0;
                self.store.write(&name, &config)?;
            }
        }
        Ok(())
    }

    /// Bring up the worker threads and serve the control socket. Only
    /// returns on a fatal socket error.
    pub fn run(self: Arc<Self>) -> io::Result<()> {
        if self.settings.reattach {
            if let Err(err) = self.reattach() {
                log::error!("re-attach scan failed: {}", err);
            }
        }
        reaper::spawn(self.clone())?;
        if self.settings.autostart {
            let _ = autostart::spawn(self.clone())?;
        }
        server::serve(self)
    }
}
