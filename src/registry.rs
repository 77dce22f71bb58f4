//! In-memory cell ledger: the live list, the pending-reap list, and the
//! active-cell selector
//!
//! A cell is owned by exactly one list at a time. Every operation takes the
//! owning list's mutex for its full duration and traversal never escapes the
//! lock; blocking work (launching, unmounting, config io) always happens
//! outside. The active selector has its own mutex and is only ever taken
//! before a list mutex, never while one is held.

use crate::{console::ConsolePty, errors::CommandError};
use std::{
    fs,
    path::PathBuf,
    sync::Mutex,
    time::SystemTime,
};

/// One isolated execution environment managed by the daemon
#[derive(Debug)]
pub struct Cell {
    pub name: String,
    /// Telephony-style identifier, unique across all cells including
    /// stopped ones
    pub id: Option<u8>,
    pub init_pid: Option<i32>,
    /// True between launch and the end of the ready handshake
    pub starting: bool,
    /// True when this daemon did not fork the init process (re-attach after
    /// a daemon restart)
    pub non_child: bool,
    pub console: Option<ConsolePty>,
    pub start_time: SystemTime,
}

impl Cell {
    pub fn new(name: &str, id: Option<u8>) -> Cell {
        Cell {
            name: name.to_string(),
            id,
            init_pid: None,
            starting: false,
            non_child: false,
            console: None,
            start_time: SystemTime::now(),
        }
    }
}

/// Which registry list an operation targets
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ListKind {
    Live,
    PendingReap,
}

/// Traversal direction for the next/prev commands
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Direction {
    Next,
    Prev,
}

/// Result of a successful active-cell switch
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum SetActiveOutcome {
    Switched,
    AlreadyActive,
}

pub struct Registry {
    live: Mutex<Vec<Cell>>,
    pending_reap: Mutex<Vec<Cell>>,
    active: Mutex<Option<String>>,
    active_ns_file: PathBuf,
}

impl Registry {
    pub fn new(active_ns_file: PathBuf) -> Registry {
        Registry {
            live: Mutex::new(Vec::new()),
            pending_reap: Mutex::new(Vec::new()),
            active: Mutex::new(None),
            active_ns_file,
        }
    }

    fn list(&self, kind: ListKind) -> &Mutex<Vec<Cell>> {
        match kind {
            ListKind::Live => &self.live,
            ListKind::PendingReap => &self.pending_reap,
        }
    }

    pub fn insert(&self, kind: ListKind, cell: Cell) {
        self.list(kind).lock().unwrap().push(cell);
    }

    pub fn remove(&self, kind: ListKind, name: &str) -> Option<Cell> {
        let mut cells = self.list(kind).lock().unwrap();
        let index = cells.iter().position(|c| c.name == name)?;
        Some(cells.remove(index))
    }

    pub fn remove_by_pid(&self, kind: ListKind, pid: i32) -> Option<Cell> {
        let mut cells = self.list(kind).lock().unwrap();
        let index = cells.iter().position(|c| c.init_pid == Some(pid))?;
        Some(cells.remove(index))
    }

    pub fn contains(&self, kind: ListKind, name: &str) -> bool {
        self.list(kind)
            .lock()
            .unwrap()
            .iter()
            .any(|c| c.name == name)
    }

    pub fn is_live(&self, name: &str) -> bool {
        self.contains(ListKind::Live, name)
    }

    /// Run `f` against the named cell while holding the list lock
    pub fn with_cell<R>(
        &self,
        kind: ListKind,
        name: &str,
        f: impl FnOnce(&mut Cell) -> R,
    ) -> Option<R> {
        let mut cells = self.list(kind).lock().unwrap();
        cells.iter_mut().find(|c| c.name == name).map(f)
    }

    /// Map every cell in a list to a value, in insertion order
    pub fn map_cells<R>(&self, kind: ListKind, mut f: impl FnMut(&Cell) -> R) -> Vec<R> {
        self.list(kind).lock().unwrap().iter().map(&mut f).collect()
    }

    pub fn live_count(&self) -> usize {
        self.live.lock().unwrap().len()
    }

    pub fn active_name(&self) -> Option<String> {
        self.active.lock().unwrap().clone()
    }

    /// Drop the active reference if it points at `name`. Used before a cell
    /// leaves the live list, so the selector never dangles.
    pub fn clear_active_if(&self, name: &str) {
        let mut active = self.active.lock().unwrap();
        if active.as_deref() == Some(name) {
            log::debug!("active cell {:?} cleared", name);
            *active = None;
        }
    }

    /// Circular next/prev over the live list, starting from the active cell
    /// (or the head when none is active). Cells still starting are skipped;
    /// wrapping back to the origin with nothing found falls back to the list
    /// head. Fewer than two live cells means there is nowhere to go.
    pub fn neighbor(&self, direction: Direction) -> Option<String> {
        let origin = self.active_name();
        let cells = self.live.lock().unwrap();
        if cells.len() < 2 {
            return None;
        }
        let start = origin
            .as_deref()
            .and_then(|name| cells.iter().position(|c| c.name == name))
            .unwrap_or(0);
        let len = cells.len();
        let mut index = start;
        for _ in 1..len {
            index = match direction {
                Direction::Next => (index + 1) % len,
                Direction::Prev => (index + len - 1) % len,
            };
            if !cells[index].starting {
                return Some(cells[index].name.clone());
            }
        }
        Some(cells[0].name.clone())
    }

    /// Make `name` the active cell. The active-namespace control file is
    /// written first; if that write fails the selector is left untouched, so
    /// the switch is atomic as far as the registry is concerned.
    pub fn set_active(&self, name: &str) -> Result<SetActiveOutcome, CommandError> {
        let mut active = self.active.lock().unwrap();
        if active.as_deref() == Some(name) {
            return Ok(SetActiveOutcome::AlreadyActive);
        }

        let pid = {
            let cells = self.live.lock().unwrap();
            let cell = cells
                .iter()
                .find(|c| c.name == name)
                .ok_or(CommandError::NotRunning)?;
            if cell.starting {
                return Err(CommandError::StillStarting);
            }
            cell.init_pid.ok_or(CommandError::NotRunning)?
        };

        fs::write(&self.active_ns_file, pid.to_string()).map_err(CommandError::SwitchIo)?;
        log::info!("active cell is now {:?} (init pid {})", name, pid);
        *active = Some(name.to_string());
        Ok(SetActiveOutcome::Switched)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn registry() -> (TempDir, Registry) {
        let dir = TempDir::new().unwrap();
        let registry = Registry::new(dir.path().join("active_ns_pid"));
        (dir, registry)
    }

    fn running(name: &str, pid: i32) -> Cell {
        Cell {
            init_pid: Some(pid),
            ..Cell::new(name, None)
        }
    }

    #[test]
    fn insert_find_remove() {
        let (_dir, registry) = registry();
        registry.insert(ListKind::Live, running("cell1", 100));
        assert!(registry.is_live("cell1"));
        assert!(!registry.contains(ListKind::PendingReap, "cell1"));

        let cell = registry.remove(ListKind::Live, "cell1").unwrap();
        assert_eq!(cell.init_pid, Some(100));
        assert!(!registry.is_live("cell1"));
        assert!(registry.remove(ListKind::Live, "cell1").is_none());
    }

    #[test]
    fn lookup_by_pid() {
        let (_dir, registry) = registry();
        registry.insert(ListKind::PendingReap, running("cell1", 100));
        assert!(registry.remove_by_pid(ListKind::Live, 100).is_none());
        let cell = registry.remove_by_pid(ListKind::PendingReap, 100).unwrap();
        assert_eq!(cell.name, "cell1");
    }

    #[test]
    fn neighbor_needs_two_cells() {
        let (_dir, registry) = registry();
        assert_eq!(registry.neighbor(Direction::Next), None);
        registry.insert(ListKind::Live, running("cell1", 100));
        assert_eq!(registry.neighbor(Direction::Next), None);
        assert_eq!(registry.neighbor(Direction::Prev), None);
    }

    #[test]
    fn neighbor_wraps_and_returns_to_origin() {
        let (_dir, registry) = registry();
        for (name, pid) in [("cell1", 100), ("cell2", 101), ("cell3", 102)] {
            registry.insert(ListKind::Live, running(name, pid));
        }
        registry.set_active("cell1").unwrap();

        let next = registry.neighbor(Direction::Next).unwrap();
        assert_eq!(next, "cell2");
        registry.set_active(&next).unwrap();
        let back = registry.neighbor(Direction::Prev).unwrap();
        assert_eq!(back, "cell1");

        // Wrap around the tail
        registry.set_active("cell3").unwrap();
        assert_eq!(registry.neighbor(Direction::Next).unwrap(), "cell1");
    }

    #[test]
    fn neighbor_skips_starting_cells() {
        let (_dir, registry) = registry();
        registry.insert(ListKind::Live, running("cell1", 100));
        registry.insert(
            ListKind::Live,
            Cell {
                starting: true,
                ..running("cell2", 101)
            },
        );
        registry.insert(ListKind::Live, running("cell3", 102));
        registry.set_active("cell1").unwrap();
        assert_eq!(registry.neighbor(Direction::Next).unwrap(), "cell3");
    }

    #[test]
    fn set_active_writes_control_file() {
        let (dir, registry) = registry();
        registry.insert(ListKind::Live, running("cell1", 4821));
        assert_eq!(
            registry.set_active("cell1").unwrap(),
            SetActiveOutcome::Switched
        );
        assert_eq!(
            std::fs::read_to_string(dir.path().join("active_ns_pid")).unwrap(),
            "4821"
        );
        assert_eq!(registry.active_name().as_deref(), Some("cell1"));
        assert_eq!(
            registry.set_active("cell1").unwrap(),
            SetActiveOutcome::AlreadyActive
        );
    }

    #[test]
    fn set_active_failure_leaves_selector_untouched() {
        let dir = TempDir::new().unwrap();
        // Point the control file inside a directory that does not exist
        let registry = Registry::new(dir.path().join("missing/active_ns_pid"));
        registry.insert(ListKind::Live, running("cell1", 100));
        assert!(matches!(
            registry.set_active("cell1"),
            Err(CommandError::SwitchIo(_))
        ));
        assert_eq!(registry.active_name(), None);

        // Unknown and starting cells are refused before any side effect
        assert!(matches!(
            registry.set_active("ghost"),
            Err(CommandError::NotRunning)
        ));
    }

    #[test]
    fn clear_active_only_matches_named_cell() {
        let (_dir, registry) = registry();
        registry.insert(ListKind::Live, running("cell1", 100));
        registry.set_active("cell1").unwrap();
        registry.clear_active_if("cell2");
        assert_eq!(registry.active_name().as_deref(), Some("cell1"));
        registry.clear_active_if("cell1");
        assert_eq!(registry.active_name(), None);
    }

    #[test]
    fn concurrent_inserts_are_not_lost() {
        let (_dir, registry) = registry();
        let registry = Arc::new(registry);
        let threads: Vec<_> = (0..8)
            .map(|n| {
                let registry = registry.clone();
                std::thread::spawn(move || {
                    registry.insert(ListKind::Live, running(&format!("cell{}", n), 100 + n));
                })
            })
            .collect();
        for thread in threads {
            thread.join().unwrap();
        }
        assert_eq!(registry.live_count(), 8);
        for n in 0..8 {
            assert!(registry.is_live(&format!("cell{}", n)));
        }
    }
}
