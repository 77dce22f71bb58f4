//! Control socket round trips against a live server thread, on a private
//! abstract socket so tests never touch a real daemon

use celld::{server, Daemon, Settings};
use celld_protocol::{
    reply::{decode_list, CellState, Reply},
    write_request, CommandArgs, ListFilter, Request,
};
use std::io::{BufReader, Read};
use std::os::linux::net::SocketAddrExt;
use std::os::unix::net::{SocketAddr, UnixStream};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tempfile::TempDir;

fn spawn_daemon(socket: &str) -> (TempDir, Arc<Daemon>) {
    let dir = TempDir::new().unwrap();
    let settings = Settings {
        socket_name: socket.to_string(),
        cell_dir: dir.path().join("cells"),
        config_dir: dir.path().join("conf"),
        skeleton_dir: dir.path().join("skel"),
        active_ns_file: dir.path().join("active_ns_pid"),
        init_program: dir.path().join("init"),
        autostart: false,
        reattach: false,
    };
    let daemon = Arc::new(Daemon::new(settings).unwrap());
    let serving = daemon.clone();
    thread::spawn(move || {
        let _ = server::serve(serving);
    });
    (dir, daemon)
}

/// The listener thread may not have bound yet when the test connects
fn connect(socket: &str) -> UnixStream {
    let addr = SocketAddr::from_abstract_name(socket.as_bytes()).unwrap();
    for _ in 0..100 {
        if let Ok(stream) = UnixStream::connect_addr(&addr) {
            return stream;
        }
        thread::sleep(Duration::from_millis(10));
    }
    panic!("control socket {:?} never came up", socket);
}

#[test]
fn replies_travel_the_socket() {
    let socket = format!("celld-test-reply-{}", std::process::id());
    let (_dir, _daemon) = spawn_daemon(&socket);

    let mut stream = connect(&socket);
    let request = Request {
        name: "cell1".to_string(),
        args: CommandArgs::Create { id: None },
    };
    write_request(&mut stream, &request).unwrap();
    let reply = Reply::read_from(&mut BufReader::new(&stream)).unwrap();
    assert_eq!(reply.status, 0);
    assert_eq!(reply.message, "Created cell1");
}

#[test]
fn list_payload_is_the_whole_reply() {
    let socket = format!("celld-test-list-{}", std::process::id());
    let (_dir, _daemon) = spawn_daemon(&socket);

    let mut stream = connect(&socket);
    let request = Request {
        name: "cell1".to_string(),
        args: CommandArgs::Create { id: None },
    };
    write_request(&mut stream, &request).unwrap();
    let reply = Reply::read_from(&mut BufReader::new(&stream)).unwrap();
    assert_eq!(reply.status, 0);

    // One command per connection; list comes back as bare records with no
    // status line in front of them
    let mut stream = connect(&socket);
    let request = Request {
        name: String::new(),
        args: CommandArgs::List {
            filter: ListFilter::All,
        },
    };
    write_request(&mut stream, &request).unwrap();
    let mut payload = Vec::new();
    stream.read_to_end(&mut payload).unwrap();

    let records = decode_list(&payload).unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].name, "cell1");
    assert_eq!(records[0].state, CellState::Stopped);
    assert_eq!(records[0].pid, None);
}
