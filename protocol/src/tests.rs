use crate::{reply::*, *};
use std::io::Cursor;

#[test]
fn envelope_roundtrip_create() {
    let request = Request {
        name: "cell1".to_string(),
        args: CommandArgs::Create { id: Some(2) },
    };
    let buf = request.encode().unwrap();
    assert_eq!(buf.len(), ENVELOPE_LEN);
    assert_eq!(Request::decode(&buf).unwrap(), request);

    let none = Request {
        name: "cell1".to_string(),
        args: CommandArgs::Create { id: None },
    };
    let buf = none.encode().unwrap();
    assert_eq!(Request::decode(&buf).unwrap(), none);
}

#[test]
fn envelope_roundtrip_start() {
    let request = Request {
        name: "phone".to_string(),
        args: CommandArgs::Start(StartArgs {
            uts: true,
            ipc: true,
            net: true,
            pid: true,
            mount: true,
            mount_rootfs: true,
            newpts: true,
            console: true,
            wait: true,
            pidfile: "/run/phone.pid".to_string(),
            ..StartArgs::default()
        }),
    };
    let buf = request.encode().unwrap();
    assert_eq!(Request::decode(&buf).unwrap(), request);
}

#[test]
fn envelope_roundtrip_runcmd() {
    let request = Request {
        name: "cell1".to_string(),
        args: CommandArgs::RunCmd {
            command: "am start -a android.intent.action.DIAL".to_string(),
        },
    };
    let buf = request.encode().unwrap();
    assert_eq!(Request::decode(&buf).unwrap(), request);
}

#[test]
fn oversized_fields_rejected() {
    let request = Request {
        name: "x".repeat(CELL_NAME_MAX),
        args: CommandArgs::Destroy,
    };
    assert!(matches!(request.encode(), Err(WireError::FieldTooLong)));

    let request = Request {
        name: "cell1".to_string(),
        args: CommandArgs::RunCmd {
            command: "y".repeat(COMMAND_MAX + 1),
        },
    };
    assert!(matches!(request.encode(), Err(WireError::FieldTooLong)));
}

#[test]
fn unknown_kind_rejected() {
    let mut buf = [0u8; ENVELOPE_LEN];
    buf[..4].copy_from_slice(&999u32.to_le_bytes());
    assert!(matches!(
        Request::decode(&buf),
        Err(WireError::UnknownCommand(999))
    ));
}

#[test]
fn short_envelope_rejected() {
    let buf = [0u8; ENVELOPE_LEN - 1];
    assert!(matches!(Request::decode(&buf), Err(WireError::Truncated)));
}

#[test]
fn revision_gate() {
    let request = Request {
        name: "cell1".to_string(),
        args: CommandArgs::Stop,
    };
    let mut wire = Vec::new();
    write_request(&mut wire, &request).unwrap();
    assert_eq!(wire.len(), 4 + ENVELOPE_LEN);
    assert_eq!(read_request(&mut Cursor::new(&wire)).unwrap(), request);

    // Flip one revision byte and the whole command is rejected
    wire[0] ^= 0xff;
    assert!(matches!(
        read_request(&mut Cursor::new(&wire)),
        Err(WireError::RevisionMismatch { .. })
    ));

    // A truncated envelope is a protocol error, not a partial command
    let mut wire = Vec::new();
    write_request(&mut wire, &request).unwrap();
    wire.truncate(40);
    assert!(matches!(
        read_request(&mut Cursor::new(&wire)),
        Err(WireError::Truncated)
    ));
}

#[test]
fn reply_lines() {
    let reply = Reply::ok("Created cell1");
    assert_eq!(reply.encode(), b"0 Created cell1\n");
    let parsed = Reply::read_from(&mut Cursor::new(reply.encode())).unwrap();
    assert_eq!(parsed, reply);
    assert!(parsed.success());

    let reply = Reply::fail(1, "ID is already in use.");
    assert_eq!(reply.encode(), b"1 ID is already in use.\n");
    assert!(!Reply::read_from(&mut Cursor::new(reply.encode()))
        .unwrap()
        .success());
}

#[test]
fn list_framing() {
    let records = vec![
        CellRecord {
            name: "cell1".to_string(),
            state: CellState::Active,
            pid: Some(4821),
        },
        CellRecord {
            name: "cell2".to_string(),
            state: CellState::Stopped,
            pid: None,
        },
        CellRecord {
            name: "cell3".to_string(),
            state: CellState::Starting,
            pid: Some(5009),
        },
    ];
    let payload = encode_list(&records);
    assert_eq!(payload.iter().filter(|b| **b == RECORD_SEP).count(), 2);
    assert_eq!(decode_list(&payload).unwrap(), records);

    assert!(decode_list(b"").unwrap().is_empty());
}

#[test]
fn runcmd_header() {
    let header = command_header("ls /data");
    assert_eq!(&header[..5], b"L0008");
    let text = read_command(&mut Cursor::new(&header)).unwrap();
    assert_eq!(text, "ls /data");

    assert!(read_command(&mut Cursor::new(b"X0008whatever")).is_err());
}
