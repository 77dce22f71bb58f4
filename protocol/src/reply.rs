//! Text reply protocol and the descriptor-handoff handshake tokens
//!
//! Every command gets exactly one reply: an ASCII status integer, one space,
//! and a human-readable message terminated by a newline. Status `0` is
//! success. The `list` command instead replies with one record per cell,
//! records separated by [`RECORD_SEP`] and fields by [`FIELD_SEP`].

use crate::wire::WireError;
use std::io::{BufRead, Read};

/// Record separator inside a `list` reply
pub const RECORD_SEP: u8 = 0x18;

/// Field separator inside one `list` record
pub const FIELD_SEP: u8 = 0x19;

/// Sent by the server right before a descriptor transfer. Deliberately
/// short: a client that mis-parses it cannot accidentally consume the
/// descriptor message that follows.
pub const READY_TOKEN: [u8; 8] = *b"CELLRDY\0";

/// Acknowledgment the client sends back before the server transmits the
/// descriptor
pub const CLIENT_READY: [u8; 8] = *b"CLNTRDY\0";

/// Non-zero status a `switch` to the already-active cell replies with
pub const STATUS_ALREADY_ACTIVE: u32 = 2;

/// One status-plus-message reply
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Reply {
    pub status: u32,
    pub message: String,
}

impl Reply {
    pub fn ok<S: Into<String>>(message: S) -> Reply {
        Reply {
            status: 0,
            message: message.into(),
        }
    }

    pub fn fail<S: Into<String>>(status: u32, message: S) -> Reply {
        Reply {
            status,
            message: message.into(),
        }
    }

    pub fn success(&self) -> bool {
        self.status == 0
    }

    pub fn encode(&self) -> Vec<u8> {
        // The message must stay newline-free; the newline is the terminator.
        let message = self.message.replace('\n', " ");
        format!("{} {}\n", self.status, message).into_bytes()
    }

    pub fn read_from<R: BufRead>(reader: &mut R) -> Result<Reply, WireError> {
        let mut line = String::new();
        if reader.read_line(&mut line)? == 0 {
            return Err(WireError::Truncated);
        }
        let line = line.trim_end_matches('\n');
        let (status, message) = line.split_once(' ').ok_or(WireError::BadString)?;
        Ok(Reply {
            status: status.parse().map_err(|_| WireError::BadString)?,
            message: message.to_string(),
        })
    }
}

/// Lifecycle state reported by `list`
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum CellState {
    Stopped,
    Starting,
    Running,
    Active,
    Zombie,
}

impl CellState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CellState::Stopped => "stopped",
            CellState::Starting => "starting",
            CellState::Running => "running",
            CellState::Active => "active",
            CellState::Zombie => "zombie",
        }
    }

    pub fn from_str(value: &str) -> Option<CellState> {
        Some(match value {
            "stopped" => CellState::Stopped,
            "starting" => CellState::Starting,
            "running" => CellState::Running,
            "active" => CellState::Active,
            "zombie" => CellState::Zombie,
            _ => return None,
        })
    }

    /// Only cells with a live init process report their pid
    pub fn has_pid(&self) -> bool {
        !matches!(self, CellState::Stopped)
    }
}

/// One record of a `list` reply
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct CellRecord {
    pub name: String,
    pub state: CellState,
    pub pid: Option<i32>,
}

pub fn encode_list(records: &[CellRecord]) -> Vec<u8> {
    let mut out = Vec::new();
    for (index, record) in records.iter().enumerate() {
        if index > 0 {
            out.push(RECORD_SEP);
        }
        out.extend_from_slice(record.name.as_bytes());
        out.push(FIELD_SEP);
        out.extend_from_slice(record.state.as_str().as_bytes());
        if let Some(pid) = record.pid {
            out.push(FIELD_SEP);
            out.extend_from_slice(pid.to_string().as_bytes());
        }
    }
    out
}

pub fn decode_list(payload: &[u8]) -> Result<Vec<CellRecord>, WireError> {
    let text = std::str::from_utf8(payload).map_err(|_| WireError::BadString)?;
    if text.is_empty() {
        return Ok(Vec::new());
    }
    let mut records = Vec::new();
    for chunk in text.split(RECORD_SEP as char) {
        let mut fields = chunk.split(FIELD_SEP as char);
        let name = fields.next().ok_or(WireError::BadString)?;
        let state = fields
            .next()
            .and_then(CellState::from_str)
            .ok_or(WireError::BadString)?;
        let pid = match fields.next() {
            Some(raw) => Some(raw.parse().map_err(|_| WireError::BadString)?),
            None => None,
        };
        records.push(CellRecord {
            name: name.to_string(),
            state,
            pid,
        });
    }
    Ok(records)
}

/// Length-prefixed command text sent before the ready token of a `runcmd`
/// handoff: `L` plus four ASCII digits plus exactly that many bytes.
pub fn command_header(command: &str) -> Vec<u8> {
    let mut out = format!("L{:04}", command.len()).into_bytes();
    out.extend_from_slice(command.as_bytes());
    out
}

/// Client side of [`command_header`]
pub fn read_command<R: Read>(reader: &mut R) -> Result<String, WireError> {
    let mut header = [0u8; 5];
    reader.read_exact(&mut header)?;
    if header[0] != b'L' {
        return Err(WireError::BadString);
    }
    let digits = std::str::from_utf8(&header[1..]).map_err(|_| WireError::BadString)?;
    let len: usize = digits.parse().map_err(|_| WireError::BadString)?;
    let mut text = vec![0u8; len];
    reader.read_exact(&mut text)?;
    String::from_utf8(text).map_err(|_| WireError::BadString)
}
