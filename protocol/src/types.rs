//! Command kinds and their per-command argument records

/// Selector for one control-channel operation. The numeric value is part of
/// the wire format; renumbering requires a [`PROTOCOL_REVISION`] bump.
///
/// [`PROTOCOL_REVISION`]: crate::PROTOCOL_REVISION
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[repr(u32)]
pub enum CommandKind {
    Create = 1,
    Destroy = 2,
    List = 3,
    Next = 4,
    Prev = 5,
    Start = 6,
    Stop = 7,
    Switch = 8,
    Console = 9,
    Autostart = 10,
    Autoswitch = 11,
    GetId = 12,
    SetId = 13,
    GetActive = 14,
    Mount = 15,
    Unmount = 16,
    RunCmd = 17,
}

impl CommandKind {
    pub fn from_u32(value: u32) -> Option<CommandKind> {
        Some(match value {
            1 => CommandKind::Create,
            2 => CommandKind::Destroy,
            3 => CommandKind::List,
            4 => CommandKind::Next,
            5 => CommandKind::Prev,
            6 => CommandKind::Start,
            7 => CommandKind::Stop,
            8 => CommandKind::Switch,
            9 => CommandKind::Console,
            10 => CommandKind::Autostart,
            11 => CommandKind::Autoswitch,
            12 => CommandKind::GetId,
            13 => CommandKind::SetId,
            14 => CommandKind::GetActive,
            15 => CommandKind::Mount,
            16 => CommandKind::Unmount,
            17 => CommandKind::RunCmd,
            _ => return None,
        })
    }
}

/// Which cells a `list` request should report
#[derive(Debug, Copy, Clone, Eq, PartialEq, Default)]
#[repr(u32)]
pub enum ListFilter {
    #[default]
    All = 0,
    Running = 1,
    Zombie = 2,
}

/// On/off/query selector for the autostart and autoswitch toggles
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[repr(u32)]
pub enum ToggleOp {
    Off = 0,
    On = 1,
    Query = 2,
}

/// Per-invocation launch options carried by a `start` request.
///
/// With `noopt` set the daemon ignores every flag here and launches purely
/// from the cell's stored configuration.
#[derive(Debug, Clone, Eq, PartialEq, Default)]
pub struct StartArgs {
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
    pub autoswitch: bool,
    pub wait: bool,
    pub noopt: bool,
    pub pidfile: String,
}

impl StartArgs {
    /// Launch purely from stored configuration
    pub fn from_config() -> StartArgs {
        StartArgs {
            noopt: true,
            ..StartArgs::default()
        }
    }
}

/// The argument union of the command envelope, discriminated by
/// [`CommandKind`]
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum CommandArgs {
    Create { id: Option<u8> },
    Destroy,
    List { filter: ListFilter },
    Next,
    Prev,
    Start(StartArgs),
    Stop,
    Switch,
    Console,
    Autostart(ToggleOp),
    Autoswitch(ToggleOp),
    GetId,
    SetId { id: u8 },
    GetActive,
    Mount { all: bool },
    Unmount,
    RunCmd { command: String },
}

impl CommandArgs {
    pub fn kind(&self) -> CommandKind {
        match self {
            CommandArgs::Create { .. } => CommandKind::Create,
            CommandArgs::Destroy => CommandKind::Destroy,
            CommandArgs::List { .. } => CommandKind::List,
            CommandArgs::Next => CommandKind::Next,
            CommandArgs::Prev => CommandKind::Prev,
            CommandArgs::Start(_) => CommandKind::Start,
            CommandArgs::Stop => CommandKind::Stop,
            CommandArgs::Switch => CommandKind::Switch,
            CommandArgs::Console => CommandKind::Console,
            CommandArgs::Autostart(_) => CommandKind::Autostart,
            CommandArgs::Autoswitch(_) => CommandKind::Autoswitch,
            CommandArgs::GetId => CommandKind::GetId,
            CommandArgs::SetId { .. } => CommandKind::SetId,
            CommandArgs::GetActive => CommandKind::GetActive,
            CommandArgs::Mount { .. } => CommandKind::Mount,
            CommandArgs::Unmount => CommandKind::Unmount,
            CommandArgs::RunCmd { .. } => CommandKind::RunCmd,
        }
    }
}

/// One decoded command envelope: the target cell name plus the argument
/// record for the requested operation.
///
/// Commands that target no particular cell (`list`, `next`, `prev`,
/// `getactive`) carry an empty name.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Request {
    pub name: String,
    pub args: CommandArgs,
}

impl Request {
    pub fn kind(&self) -> CommandKind {
        self.args.kind()
    }
}
