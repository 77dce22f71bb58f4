//! Control server: abstract unix socket, one thread per connection
//!
//! A connection carries exactly one command. The client sends the revision
//! word and the command envelope, the server replies with a status line and
//! whatever the command's outcome adds (a list payload, or the descriptor
//! handoff handshake), then the connection closes. A request that fails to
//! decode gets no reply at all; an incompatible client would just mis-parse
//! it.

use crate::{commands, daemon::Daemon};
use celld_protocol::{
    fdpass,
    read_request,
    reply::{CLIENT_READY, READY_TOKEN},
};
use std::{
    io::{self, Read, Write},
    os::fd::AsRawFd,
    os::linux::net::SocketAddrExt,
    os::unix::net::{SocketAddr, UnixListener, UnixStream},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    thread,
};

/// Bind the control socket and serve forever. Only the bind itself is
/// fatal; per-connection errors are logged and dropped.
pub fn serve(daemon: Arc<Daemon>) -> io::Result<()> {
    let addr = SocketAddr::from_abstract_name(daemon.settings.socket_name.as_bytes())?;
    let listener = UnixListener::bind_addr(&addr)?;
    log::info!(
        "control server listening on abstract socket {:?}",
        daemon.settings.socket_name
    );

    let counter = AtomicU64::new(0);
    loop {
        let stream = match listener.accept() {
            Ok((stream, _)) => stream,
            Err(err) => {
                log::warn!("accept failed: {}", err);
                continue;
            }
        };
        let daemon = daemon.clone();
        let n = counter.fetch_add(1, Ordering::Relaxed);
        let spawned = thread::Builder::new()
            .name(format!("client-{}", n))
            .spawn(move || {
                if let Err(err) = handle_connection(&daemon, stream) {
                    log::warn!("client {} dropped: {}", n, err);
                }
            });
        if let Err(err) = spawned {
            log::error!("could not spawn client thread: {}", err);
        }
    }
}

fn handle_connection(daemon: &Daemon, mut stream: UnixStream) -> io::Result<()> {
    let request = match read_request(&mut stream) {
        Ok(request) => request,
        Err(err) => {
            // Bad revision or garbage envelope: close without replying
            log::warn!("rejected control request: {}", err);
            return Ok(());
        }
    };
    log::debug!("{:?} command for cell {:?}", request.kind(), request.name);

    match commands::dispatch(daemon, &request, Some(stream.as_raw_fd())) {
        commands::Outcome::Reply(reply) => {
            stream.write_all(&reply.encode())?;
        }
        commands::Outcome::List(payload) => {
            // Lists carry no status line, the records are the whole reply
            stream.write_all(&payload)?;
        }
        commands::Outcome::Handoff { reply, header, fd } => {
            stream.write_all(&reply.encode())?;
            if let Some(header) = header {
                stream.write_all(&header)?;
            }
            stream.write_all(&READY_TOKEN)?;

            let mut ack = [0u8; 8];
            stream.read_exact(&mut ack)?;
            if ack != CLIENT_READY {
                log::warn!("client sent a bad handoff ack, keeping the descriptor");
                return Ok(());
            }
            fdpass::send_fd(&stream, &fd)?;
        }
    }
    stream.flush()
}
