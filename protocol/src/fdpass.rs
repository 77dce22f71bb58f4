//! SCM_RIGHTS descriptor transfer over the control socket
//!
//! Both sides must complete the ready-token round trip from [`crate::reply`]
//! before calling into here, otherwise the one-byte carrier message can be
//! misread as ordinary reply data.

use nix::{
    cmsg_space,
    sys::socket::{recvmsg, sendmsg, ControlMessage, ControlMessageOwned, MsgFlags},
};
use std::{
    io::{self, IoSlice, IoSliceMut},
    os::fd::{AsFd, AsRawFd, FromRawFd, OwnedFd, RawFd},
    os::unix::net::UnixStream,
};

/// Transmit one open descriptor as ancillary data on `stream`
pub fn send_fd<F: AsFd>(stream: &UnixStream, fd: F) -> io::Result<()> {
    let fds = [fd.as_fd().as_raw_fd()];
    let cmsgs = [ControlMessage::ScmRights(&fds)];
    let iov = [IoSlice::new(b"F")];
    sendmsg::<()>(
        stream.as_raw_fd(),
        &iov,
        &cmsgs,
        MsgFlags::empty(),
        None,
    )
    .map_err(io::Error::from)?;
    Ok(())
}

/// Receive one descriptor sent by [`send_fd`]
pub fn recv_fd(stream: &UnixStream) -> io::Result<OwnedFd> {
    let mut carrier = [0u8; 1];
    let mut iov = [IoSliceMut::new(&mut carrier)];
    let mut cmsg_buffer = cmsg_space!([RawFd; 1]);
    let message = recvmsg::<()>(
        stream.as_raw_fd(),
        &mut iov,
        Some(&mut cmsg_buffer),
        MsgFlags::empty(),
    )
    .map_err(io::Error::from)?;

    for cmsg in message.cmsgs().map_err(io::Error::from)? {
        if let ControlMessageOwned::ScmRights(fds) = cmsg {
            if let Some(fd) = fds.first() {
                return Ok(unsafe { OwnedFd::from_raw_fd(*fd) });
            }
        }
    }
    Err(io::Error::new(
        io::ErrorKind::InvalidData,
        "no descriptor in control message",
    ))
}
