//! Binary command envelope: a revision tag followed by one fixed-size record
//!
//! A client performs exactly two writes per command: the 4-byte protocol
//! revision, then the [`ENVELOPE_LEN`]-byte envelope. The envelope packs the
//! command kind, a NUL-padded cell name, and a fixed argument block whose
//! layout is selected by the kind. Anything that changes these layouts must
//! bump [`PROTOCOL_REVISION`]; the server rejects mismatched revisions
//! outright.

use crate::types::*;
use std::io::{Read, Write};
use thiserror::Error;

/// Bumped on every backward-incompatible change to the wire structs
pub const PROTOCOL_REVISION: u32 = 5;

/// Width of the cell-name field; names may use up to `CELL_NAME_MAX - 1`
/// bytes, the rest is NUL padding
pub const CELL_NAME_MAX: usize = 64;

/// Width of the per-command argument block
pub const ARGS_MAX: usize = 256;

/// Total envelope size: kind + name + argument block
pub const ENVELOPE_LEN: usize = 4 + CELL_NAME_MAX + ARGS_MAX;

/// Longest command line accepted by `runcmd`
pub const COMMAND_MAX: usize = 248;

/// Width of the pid-file path field inside the `start` argument block
pub const PIDFILE_MAX: usize = 128;

const NAME_OFFSET: usize = 4;
const ARGS_OFFSET: usize = 4 + CELL_NAME_MAX;

/// Errors raised while encoding or decoding the command envelope
#[derive(Error, Debug)]
pub enum WireError {
    /// peer speaks a different protocol revision
    #[error("protocol revision mismatch, expected {expected}, found {found}")]
    RevisionMismatch { expected: u32, found: u32 },

    /// connection ended inside a fixed-size read
    #[error("truncated command envelope")]
    Truncated,

    /// command kind enumerator not known to this build
    #[error("unknown command kind {0}")]
    UnknownCommand(u32),

    /// string field is not valid utf-8
    #[error("malformed string field")]
    BadString,

    /// string field does not fit its fixed-width slot
    #[error("string field too long for envelope")]
    FieldTooLong,

    /// io error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

fn put_u32(buf: &mut [u8], offset: usize, value: u32) {
    buf[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

fn get_u32(buf: &[u8], offset: usize) -> u32 {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&buf[offset..offset + 4]);
    u32::from_le_bytes(bytes)
}

fn put_i32(buf: &mut [u8], offset: usize, value: i32) {
    buf[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

fn get_i32(buf: &[u8], offset: usize) -> i32 {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&buf[offset..offset + 4]);
    i32::from_le_bytes(bytes)
}

/// NUL-padded fixed-width string field. The field must keep at least one
/// padding byte so the other side can always find the terminator.
fn put_str(buf: &mut [u8], offset: usize, width: usize, value: &str) -> Result<(), WireError> {
    let bytes = value.as_bytes();
    if bytes.len() >= width {
        return Err(WireError::FieldTooLong);
    }
    buf[offset..offset + bytes.len()].copy_from_slice(bytes);
    for pad in &mut buf[offset + bytes.len()..offset + width] {
        *pad = 0;
    }
    Ok(())
}

fn get_str(buf: &[u8], offset: usize, width: usize) -> Result<String, WireError> {
    let field = &buf[offset..offset + width];
    let len = field.iter().position(|b| *b == 0).unwrap_or(width);
    String::from_utf8(field[..len].to_vec()).map_err(|_| WireError::BadString)
}

fn toggle_op(value: u32) -> Result<ToggleOp, WireError> {
    Ok(match value {
        0 => ToggleOp::Off,
        1 => ToggleOp::On,
        2 => ToggleOp::Query,
        other => return Err(WireError::UnknownCommand(other)),
    })
}

// Flag order inside the start argument block. Offsets are wire format.
const START_FLAG_COUNT: usize = 16;
const START_PIDFILE_OFFSET: usize = START_FLAG_COUNT;

fn encode_start(args: &StartArgs, block: &mut [u8]) -> Result<(), WireError> {
    let flags = [
        args.uts,
        args.ipc,
        args.user,
        args.net,
        args.pid,
        args.mount,
        args.mount_rootfs,
        args.tmpfs_dev,
        args.newpts,
        args.newcgroup,
        args.share_dalvik_cache,
        args.sdcard_branch,
        args.console,
        args.autoswitch,
        args.wait,
        args.noopt,
    ];
    for (slot, flag) in block[..START_FLAG_COUNT].iter_mut().zip(flags) {
        *slot = flag as u8;
    }
    put_str(block, START_PIDFILE_OFFSET, PIDFILE_MAX, &args.pidfile)
}

fn decode_start(block: &[u8]) -> Result<StartArgs, WireError> {
    let flag = |index: usize| block[index] != 0;
    Ok(StartArgs {
        uts: flag(0),
        ipc: flag(1),
        user: flag(2),
        net: flag(3),
        pid: flag(4),
        mount: flag(5),
        mount_rootfs: flag(6),
        tmpfs_dev: flag(7),
        newpts: flag(8),
        newcgroup: flag(9),
        share_dalvik_cache: flag(10),
        sdcard_branch: flag(11),
        console: flag(12),
        autoswitch: flag(13),
        wait: flag(14),
        noopt: flag(15),
        pidfile: get_str(block, START_PIDFILE_OFFSET, PIDFILE_MAX)?,
    })
}

impl Request {
    /// Pack this request into one fixed-size envelope
    pub fn encode(&self) -> Result<[u8; ENVELOPE_LEN], WireError> {
        let mut buf = [0u8; ENVELOPE_LEN];
        put_u32(&mut buf, 0, self.kind() as u32);
        put_str(&mut buf, NAME_OFFSET, CELL_NAME_MAX, &self.name)?;

        let block = &mut buf[ARGS_OFFSET..];
        match &self.args {
            CommandArgs::Create { id } => {
                put_i32(block, 0, id.map(i32::from).unwrap_or(-1));
            }
            CommandArgs::List { filter } => put_u32(block, 0, *filter as u32),
            CommandArgs::Start(args) => encode_start(args, block)?,
            CommandArgs::Autostart(op) | CommandArgs::Autoswitch(op) => {
                put_u32(block, 0, *op as u32)
            }
            CommandArgs::SetId { id } => put_i32(block, 0, i32::from(*id)),
            CommandArgs::Mount { all } => block[0] = *all as u8,
            CommandArgs::RunCmd { command } => {
                let bytes = command.as_bytes();
                if bytes.len() > COMMAND_MAX {
                    return Err(WireError::FieldTooLong);
                }
                put_u32(block, 0, bytes.len() as u32);
                block[4..4 + bytes.len()].copy_from_slice(bytes);
            }
            CommandArgs::Destroy
            | CommandArgs::Next
            | CommandArgs::Prev
            | CommandArgs::Stop
            | CommandArgs::Switch
            | CommandArgs::Console
            | CommandArgs::GetId
            | CommandArgs::GetActive
            | CommandArgs::Unmount => {}
        }
        Ok(buf)
    }

    /// Decode one envelope. Name validation beyond utf-8 is left to the
    /// server, which reports it as an ordinary command failure.
    pub fn decode(buf: &[u8]) -> Result<Request, WireError> {
        if buf.len() < ENVELOPE_LEN {
            return Err(WireError::Truncated);
        }
        let raw_kind = get_u32(buf, 0);
        let kind = CommandKind::from_u32(raw_kind).ok_or(WireError::UnknownCommand(raw_kind))?;
        let name = get_str(buf, NAME_OFFSET, CELL_NAME_MAX)?;

        let block = &buf[ARGS_OFFSET..];
        let args = match kind {
            CommandKind::Create => CommandArgs::Create {
                id: match get_i32(block, 0) {
                    id @ 0..=255 => Some(id as u8),
                    _ => None,
                },
            },
            CommandKind::Destroy => CommandArgs::Destroy,
            CommandKind::List => CommandArgs::List {
                filter: match get_u32(block, 0) {
                    0 => ListFilter::All,
                    1 => ListFilter::Running,
                    2 => ListFilter::Zombie,
                    other => return Err(WireError::UnknownCommand(other)),
                },
            },
            CommandKind::Next => CommandArgs::Next,
            CommandKind::Prev => CommandArgs::Prev,
            CommandKind::Start => CommandArgs::Start(decode_start(block)?),
            CommandKind::Stop => CommandArgs::Stop,
            CommandKind::Switch => CommandArgs::Switch,
            CommandKind::Console => CommandArgs::Console,
            CommandKind::Autostart => CommandArgs::Autostart(toggle_op(get_u32(block, 0))?),
            CommandKind::Autoswitch => CommandArgs::Autoswitch(toggle_op(get_u32(block, 0))?),
            CommandKind::GetId => CommandArgs::GetId,
            CommandKind::SetId => {
                let id = get_i32(block, 0);
                if !(0..=255).contains(&id) {
                    return Err(WireError::FieldTooLong);
                }
                CommandArgs::SetId { id: id as u8 }
            }
            CommandKind::GetActive => CommandArgs::GetActive,
            CommandKind::Mount => CommandArgs::Mount { all: block[0] != 0 },
            CommandKind::Unmount => CommandArgs::Unmount,
            CommandKind::RunCmd => {
                let len = get_u32(block, 0) as usize;
                if len > COMMAND_MAX {
                    return Err(WireError::FieldTooLong);
                }
                let command =
                    String::from_utf8(block[4..4 + len].to_vec()).map_err(|_| WireError::BadString)?;
                CommandArgs::RunCmd { command }
            }
        };
        Ok(Request { name, args })
    }
}

/// Client side: revision tag then envelope, as two writes
pub fn write_request<W: Write>(writer: &mut W, request: &Request) -> Result<(), WireError> {
    writer.write_all(&PROTOCOL_REVISION.to_le_bytes())?;
    writer.write_all(&request.encode()?)?;
    writer.flush()?;
    Ok(())
}

/// Server side: check the revision, then read and decode one envelope
pub fn read_request<R: Read>(reader: &mut R) -> Result<Request, WireError> {
    let mut tag = [0u8; 4];
    read_full(reader, &mut tag)?;
    let found = u32::from_le_bytes(tag);
    if found != PROTOCOL_REVISION {
        return Err(WireError::RevisionMismatch {
            expected: PROTOCOL_REVISION,
            found,
        });
    }
    let mut envelope = [0u8; ENVELOPE_LEN];
    read_full(reader, &mut envelope)?;
    Request::decode(&envelope)
}

fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<(), WireError> {
    reader.read_exact(buf).map_err(|err| {
        if err.kind() == std::io::ErrorKind::UnexpectedEof {
            WireError::Truncated
        } else {
            WireError::Io(err)
        }
    })
}
