//! Durable per-cell configuration: one key/value text file per cell
//!
//! The format is line-oriented `<key> <integer>` pairs. An unknown key or a
//! malformed line invalidates the whole file; it is deleted and the defaults
//! are handed out until the next write recreates it. This keeps a corrupted
//! file from wedging the daemon while preserving the on-disk format of the
//! original console tools.

use crate::errors::ConfigError;
use std::{
    fs,
    io::ErrorKind,
    path::{Path, PathBuf},
};

/// The durable counterpart of one launch request, plus daemon bookkeeping
/// (`init_pid`, `restart_pid`) and the telephony-style `id`.
///
/// `id` and the pid fields use `-1`/`0` respectively for "unset" so every
/// field serializes as a plain integer.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct CellConfig {
    pub uts: bool,
    pub ipc: bool,
    pub user: bool,
    pub net: bool,
    pub pid: bool,
    pub mount: bool,
    pub mount_rootfs: bool,
    pub tmpfs_dev: bool,
    pub newpts: bool,
    pub newcgroup: bool,
    pub share_dalvik_cache: bool,
    pub sdcard_branch: bool,
    pub console: bool,
    pub autostart: bool,
    pub autoswitch: bool,
    pub newcell: bool,
    pub init_pid: i32,
    pub restart_pid: i32,
    pub id: i32,
}

impl Default for CellConfig {
    fn default() -> CellConfig {
        CellConfig {
            uts: true,
            ipc: true,
            user: false,
            net: true,
            pid: true,
            mount: true,
            mount_rootfs: true,
            tmpfs_dev: true,
            newpts: true,
            newcgroup: true,
            share_dalvik_cache: false,
            sdcard_branch: false,
            console: true,
            autostart: false,
            autoswitch: false,
            newcell: true,
            init_pid: 0,
            restart_pid: 0,
            id: -1,
        }
    }
}

impl CellConfig {
    pub fn cell_id(&self) -> Option<u8> {
        match self.id {
            0..=9 => Some(self.id as u8),
            _ => None,
        }
    }

    fn fields(&self) -> [(&'static str, i32); 19] {
        [
            ("uts", self.uts as i32),
            ("ipc", self.ipc as i32),
            ("user", self.user as i32),
            ("net", self.net as i32),
            ("pid", self.pid as i32),
            ("mount", self.mount as i32),
            ("mount_rootfs", self.mount_rootfs as i32),
            ("tmpfs_dev", self.tmpfs_dev as i32),
            ("newpts", self.newpts as i32),
            ("newcgroup", self.newcgroup as i32),
            ("share_dalvik_cache", self.share_dalvik_cache as i32),
            ("sdcard_branch", self.sdcard_branch as i32),
            ("console", self.console as i32),
            ("autostart", self.autostart as i32),
            ("autoswitch", self.autoswitch as i32),
            ("newcell", self.newcell as i32),
            ("initpid", self.init_pid),
            ("restartpid", self.restart_pid),
            ("id", self.id),
        ]
    }

    fn serialize(&self) -> String {
        let mut out = String::new();
        for (key, value) in self.fields() {
            out.push_str(key);
            out.push(' ');
            out.push_str(&value.to_string());
            out.push('\n');
        }
        out
    }

    /// Strict parse: any surprise invalidates the whole file
    fn parse(text: &str) -> Option<CellConfig> {
        let mut config = CellConfig::default();
        for line in text.lines() {
            let (key, raw) = line.split_once(' ')?;
            let value: i32 = raw.parse().ok()?;
            let flag = value != 0;
            match key {
                "uts" => config.uts = flag,
                "ipc" => config.ipc = flag,
                "user" => config.user = flag,
                "net" => config.net = flag,
                "pid" => config.pid = flag,
                "mount" => config.mount = flag,
                "mount_rootfs" => config.mount_rootfs = flag,
                "tmpfs_dev" => config.tmpfs_dev = flag,
                "newpts" => config.newpts = flag,
                "newcgroup" => config.newcgroup = flag,
                "share_dalvik_cache" => config.share_dalvik_cache = flag,
                "sdcard_branch" => config.sdcard_branch = flag,
                "console" => config.console = flag,
                "autostart" => config.autostart = flag,
                "autoswitch" => config.autoswitch = flag,
                "newcell" => config.newcell = flag,
                "initpid" => config.init_pid = value,
                "restartpid" => config.restart_pid = value,
                "id" => config.id = value,
                _ => return None,
            }
        }
        Some(config)
    }
}

/// File-per-cell store in a fixed directory. Callers serialize
/// check-then-mutate sequences through the daemon's config-directory lock;
/// the store itself is just dumb file io.
#[derive(Debug, Clone)]
pub struct ConfigStore {
    dir: PathBuf,
}

impl ConfigStore {
    pub fn new<P: Into<PathBuf>>(dir: P) -> ConfigStore {
        ConfigStore { dir: dir.into() }
    }

    pub fn ensure_dir(&self) -> Result<(), ConfigError> {
        fs::create_dir_all(&self.dir)?;
        Ok(())
    }

    fn path(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }

    pub fn exists(&self, name: &str) -> bool {
        self.path(name).is_file()
    }

    /// Read a cell's config. A missing file yields the documented defaults;
    /// a malformed file is deleted and also yields the defaults.
    pub fn read(&self, name: &str) -> Result<CellConfig, ConfigError> {
        let path = self.path(name);
        let text = match fs::read_to_string(&path) {
            Ok(text) => text,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(CellConfig::default()),
            Err(err) => return Err(err.into()),
        };
        match CellConfig::parse(&text) {
            Some(config) => Ok(config),
            None => {
                log::warn!("malformed config for cell {:?}, resetting to defaults", name);
                fs::remove_file(&path)?;
                Ok(CellConfig::default())
            }
        }
    }

    pub fn write(&self, name: &str, config: &CellConfig) -> Result<(), ConfigError> {
        fs::write(self.path(name), config.serialize())?;
        Ok(())
    }

    pub fn remove(&self, name: &str) -> Result<(), ConfigError> {
        match fs::remove_file(self.path(name)) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                Err(ConfigError::UnknownCell(name.to_string()))
            }
            Err(err) => Err(err.into()),
        }
    }

    /// All configured cell names, sorted
    pub fn list(&self) -> Result<Vec<String>, ConfigError> {
        let mut names = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            if let Ok(name) = entry.file_name().into_string() {
                names.push(name);
            }
        }
        names.sort();
        Ok(names)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store() -> (TempDir, ConfigStore) {
        let dir = TempDir::new().unwrap();
        let store = ConfigStore::new(dir.path());
        (dir, store)
    }

    #[test]
    fn roundtrip_every_field() {
        let (_dir, store) = store();
        let config = CellConfig {
            uts: false,
            user: true,
            net: false,
            newcgroup: false,
            share_dalvik_cache: true,
            autostart: true,
            newcell: false,
            init_pid: 4821,
            restart_pid: 4821,
            id: 7,
            ..CellConfig::default()
        };
        store.write("cell1", &config).unwrap();
        assert_eq!(store.read("cell1").unwrap(), config);
    }

    #[test]
    fn missing_file_yields_defaults() {
        let (_dir, store) = store();
        assert_eq!(store.read("nosuch").unwrap(), CellConfig::default());
        assert!(!store.exists("nosuch"));
    }

    #[test]
    fn malformed_line_resets_to_defaults() {
        let (dir, store) = store();
        std::fs::write(dir.path().join("cell1"), "uts 1\nbogus-key 3\nid 4\n").unwrap();
        assert_eq!(store.read("cell1").unwrap(), CellConfig::default());
        // The broken file is gone, not left to trip the next reader
        assert!(!store.exists("cell1"));

        std::fs::write(dir.path().join("cell2"), "uts notanumber\n").unwrap();
        assert_eq!(store.read("cell2").unwrap(), CellConfig::default());
    }

    #[test]
    fn list_is_sorted() {
        let (_dir, store) = store();
        for name in ["zeta", "alpha", "mid"] {
            store.write(name, &CellConfig::default()).unwrap();
        }
        assert_eq!(store.list().unwrap(), vec!["alpha", "mid", "zeta"]);
    }

    #[test]
    fn remove_unknown_cell() {
        let (_dir, store) = store();
        assert!(matches!(
            store.remove("ghost"),
            Err(ConfigError::UnknownCell(_))
        ));
    }
}
