//! Control-surface tests that need no privileges: configuration lifecycle,
//! identifiers, listing, and the failure replies for cells that are not
//! running

use celld::registry::{Cell, ListKind};
use celld::{commands, Daemon, Settings};
use celld_protocol::{
    reply::{decode_list, CellState},
    CommandArgs, ListFilter, Request, StartArgs, ToggleOp,
};
use std::sync::Arc;
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

fn reply(daemon: &Daemon, name: &str, args: CommandArgs) -> (u32, String) {
    let request = Request {
        name: name.to_string(),
        args,
    };
    match commands::dispatch(daemon, &request, None) {
        commands::Outcome::Reply(reply) => (reply.status, reply.message),
        _ => panic!("expected a plain reply"),
    }
}

fn listing(daemon: &Daemon, filter: ListFilter) -> Vec<(String, CellState)> {
    let request = Request {
        name: String::new(),
        args: CommandArgs::List { filter },
    };
    match commands::dispatch(daemon, &request, None) {
        commands::Outcome::List(payload) => decode_list(&payload)
            .unwrap()
            .into_iter()
            .map(|r| (r.name, r.state))
            .collect(),
        _ => panic!("expected a list payload"),
    }
}

#[test]
fn create_then_destroy() {
    let (_dir, daemon) = daemon();

    let (status, message) = reply(&daemon, "cell1", CommandArgs::Create { id: None });
    assert_eq!(status, 0);
    assert_eq!(message, "Created cell1");

    let (status, message) = reply(&daemon, "cell1", CommandArgs::Create { id: None });
    assert_eq!(status, 1);
    assert_eq!(message, "Cell already exists.");

    let (status, message) = reply(&daemon, "cell1", CommandArgs::Destroy);
    assert_eq!(status, 0);
    assert_eq!(message, "Destroyed cell1");

    let (status, message) = reply(&daemon, "cell1", CommandArgs::Destroy);
    assert_eq!(status, 1);
    assert_eq!(message, "Cell does not exist.");
}

#[test]
fn names_are_validated() {
    let (_dir, daemon) = daemon();
    for bad in ["", "no spaces", "dots.bad", "slash/bad"] {
        let (status, message) = reply(&daemon, bad, CommandArgs::Create { id: None });
        assert_eq!(status, 1, "accepted {:?}", bad);
        assert_eq!(message, "Invalid cell name.");
    }
}

#[test]
fn identifier_rules() {
    let (_dir, daemon) = daemon();
    reply(&daemon, "cell1", CommandArgs::Create { id: Some(3) });
    reply(&daemon, "cell2", CommandArgs::Create { id: None });

    let (status, message) = reply(&daemon, "cell1", CommandArgs::GetId);
    assert_eq!((status, message.as_str()), (0, "3"));

    let (status, message) = reply(&daemon, "cell2", CommandArgs::GetId);
    assert_eq!((status, message.as_str()), (0, "none"));

    // A taken id is refused, for create and setid alike
    let (status, message) = reply(&daemon, "cell3", CommandArgs::Create { id: Some(3) });
    assert_eq!(status, 1);
    assert_eq!(message, "ID is already in use.");

    let (status, _) = reply(&daemon, "cell2", CommandArgs::SetId { id: 3 });
    assert_eq!(status, 1);

    let (status, message) = reply(&daemon, "cell2", CommandArgs::SetId { id: 7 });
    assert_eq!(status, 0);
    assert_eq!(message, "Changed cell2's ID to 7");

    // Re-assigning a cell's own id is fine
    let (status, _) = reply(&daemon, "cell2", CommandArgs::SetId { id: 7 });
    assert_eq!(status, 0);

    let (status, _) = reply(&daemon, "cell2", CommandArgs::SetId { id: 12 });
    assert_eq!(status, 1);
}

#[test]
fn listing_shows_stopped_cells() {
    let (_dir, daemon) = daemon();
    reply(&daemon, "alpha", CommandArgs::Create { id: None });
    reply(&daemon, "beta", CommandArgs::Create { id: None });

    let records = listing(&daemon, ListFilter::All);
    assert_eq!(
        records,
        vec![
            ("alpha".to_string(), CellState::Stopped),
            ("beta".to_string(), CellState::Stopped),
        ]
    );

    assert!(listing(&daemon, ListFilter::Running).is_empty());
    assert!(listing(&daemon, ListFilter::Zombie).is_empty());
}

#[test]
fn commands_against_missing_cells_fail() {
    let (_dir, daemon) = daemon();

    let (status, message) = reply(&daemon, "ghost", CommandArgs::Stop);
    assert_eq!(status, 1);
    assert_eq!(message, "Cell is not running.");

    let (status, message) = reply(&daemon, "ghost", CommandArgs::Switch);
    assert_eq!(status, 1);
    assert_eq!(message, "Cell is not running.");

    let (status, message) = reply(&daemon, "", CommandArgs::GetActive);
    assert_eq!(status, 1);
    assert_eq!(message, "No active cell.");

    let (status, message) = reply(&daemon, "", CommandArgs::Next);
    assert_eq!(status, 1);
    assert_eq!(message, "Only one cell running.");

    let (status, message) = reply(&daemon, "ghost", CommandArgs::GetId);
    assert_eq!(status, 1);
    assert_eq!(message, "Cell does not exist.");
}

#[test]
fn toggles_persist() {
    let (_dir, daemon) = daemon();
    reply(&daemon, "cell1", CommandArgs::Create { id: None });

    let (status, message) = reply(&daemon, "cell1", CommandArgs::Autostart(ToggleOp::Query));
    assert_eq!(status, 0);
    assert_eq!(message, "Autostart is off for cell1");

    let (status, _) = reply(&daemon, "cell1", CommandArgs::Autostart(ToggleOp::On));
    assert_eq!(status, 0);

    let (_, message) = reply(&daemon, "cell1", CommandArgs::Autostart(ToggleOp::Query));
    assert_eq!(message, "Autostart is on for cell1");

    let (status, _) = reply(&daemon, "cell1", CommandArgs::Autoswitch(ToggleOp::On));
    assert_eq!(status, 0);
    let (_, message) = reply(&daemon, "cell1", CommandArgs::Autoswitch(ToggleOp::Query));
    assert_eq!(message, "Autoswitch is on for cell1");

    let (status, message) = reply(&daemon, "ghost", CommandArgs::Autostart(ToggleOp::On));
    assert_eq!(status, 1);
    assert_eq!(message, "Cell does not exist.");
}

#[test]
fn concurrent_creates_never_collide() {
    let (_dir, daemon) = daemon();
    let daemon = Arc::new(daemon);

    let threads: Vec<_> = (0..8)
        .map(|n| {
            let daemon = daemon.clone();
            std::thread::spawn(move || {
                // Everyone races for the same id; exactly one may win
                let name = format!("cell{}", n);
                let (status, _) = reply(&daemon, &name, CommandArgs::Create { id: Some(5) });
                status == 0
            })
        })
        .collect();
    let winners = threads
        .into_iter()
        .map(|t| t.join().unwrap())
        .filter(|&won| won)
        .count();
    assert_eq!(winners, 1);

    // The losers got no config file either
    let records = listing(&daemon, ListFilter::All);
    assert_eq!(records.len(), 1);
}

#[test]
fn console_replies_track_cell_state() {
    let (_dir, daemon) = daemon();

    let (status, message) = reply(&daemon, "ghost", CommandArgs::Console);
    assert_eq!(status, 1);
    assert_eq!(message, "Cell is not running.");

    // Running, but launched without a pty
    let muted = Cell {
        init_pid: Some(1),
        ..Cell::new("muted", None)
    };
    daemon.registry.insert(ListKind::Live, muted);
    let (status, message) = reply(&daemon, "muted", CommandArgs::Console);
    assert_eq!(status, 1);
    assert_eq!(message, "Console unavailable.");

    let command = CommandArgs::RunCmd {
        command: "ls".to_string(),
    };
    let (status, message) = reply(&daemon, "muted", command);
    assert_eq!(status, 1);
    assert_eq!(message, "Console unavailable.");

    // Mid-handshake cells hold the console back too
    let booting = Cell {
        init_pid: Some(2),
        starting: true,
        ..Cell::new("booting", None)
    };
    daemon.registry.insert(ListKind::Live, booting);
    let (status, message) = reply(&daemon, "booting", CommandArgs::Console);
    assert_eq!(status, 1);
    assert_eq!(message, "Cell is still starting.");
}

#[test]
fn start_while_another_start_is_in_flight() {
    let (_dir, daemon) = daemon();
    reply(&daemon, "cell1", CommandArgs::Create { id: None });
    let cell = Cell {
        init_pid: Some(1),
        starting: true,
        ..Cell::new("cell1", None)
    };
    daemon.registry.insert(ListKind::Live, cell);

    // Without --wait the caller is told to come back later
    let (status, message) = reply(&daemon, "cell1", CommandArgs::Start(StartArgs::default()));
    assert_eq!(status, 1);
    assert_eq!(message, "Cell is still starting.");
}

#[test]
fn destroy_refuses_bad_state() {
    let (_dir, daemon) = daemon();
    let (status, message) = reply(&daemon, "ghost", CommandArgs::Destroy);
    assert_eq!(status, 1);
    assert_eq!(message, "Cell does not exist.");
}
