//! `cell`, the command line client for the celld control socket

use anyhow::{bail, Context, Result};
use celld_protocol::{
    fdpass,
    reply::{decode_list, read_command, Reply, CLIENT_READY, READY_TOKEN},
    write_request, CommandArgs, ListFilter, Request, StartArgs, ToggleOp,
};
use clap::{Args, Parser, Subcommand};
use std::{
    fs::File,
    io::{self, BufReader, Read, Write},
    os::fd::OwnedFd,
    os::linux::net::SocketAddrExt,
    os::unix::net::{SocketAddr, UnixStream},
    process,
    thread,
};

#[derive(Parser)]
#[command(version, about = "Manage cells on the local celld daemon")]
struct Cli {
    /// Abstract socket name the daemon listens on
    #[arg(long, default_value = "celld", global = true)]
    socket: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create a new cell configuration
    Create {
        name: String,
        /// Telephony identifier, 0 through 9
        #[arg(long)]
        id: Option<u8>,
    },
    /// Delete a stopped cell's configuration
    Destroy { name: String },
    /// Show cells and their states
    List {
        /// Only cells with a live init
        #[arg(long, conflicts_with = "zombie")]
        running: bool,
        /// Only cells awaiting reap
        #[arg(long)]
        zombie: bool,
    },
    /// Switch to the next running cell
    Next,
    /// Switch to the previous running cell
    Prev,
    /// Launch a cell's init process
    Start {
        name: String,
        #[command(flatten)]
        opts: StartOpts,
    },
    /// Kill a running cell
    Stop { name: String },
    /// Make a cell the active one
    Switch { name: String },
    /// Attach this terminal to a cell's console
    Console { name: String },
    /// Query or set the boot-time autostart flag
    Autostart {
        name: String,
        #[command(flatten)]
        toggle: ToggleArg,
    },
    /// Query or set the switch-on-start flag
    Autoswitch {
        name: String,
        #[command(flatten)]
        toggle: ToggleArg,
    },
    /// Print a cell's telephony identifier
    Getid { name: String },
    /// Assign a cell's telephony identifier
    Setid { name: String, id: u8 },
    /// Print the active cell's name
    Getactive,
    /// Prepare a cell's filesystem without starting it
    Mount {
        name: Option<String>,
        /// Mount every configured cell
        #[arg(long)]
        all: bool,
    },
    /// Tear down a stopped cell's mounts
    Unmount { name: String },
    /// Run one command on a cell's console
    Runcmd { name: String, command: String },
}

/// Launch options. Leave them all unset to launch from the cell's stored
/// configuration; setting any one of them overrides the whole set, with
/// unset flags falling back to the daemon's defaults.
#[derive(Args)]
struct StartOpts {
    #[arg(long)]
    uts: Option<bool>,
    #[arg(long)]
    ipc: Option<bool>,
    #[arg(long)]
    user: Option<bool>,
    #[arg(long)]
    net: Option<bool>,
    #[arg(long)]
    pid: Option<bool>,
    #[arg(long)]
    mount: Option<bool>,
    #[arg(long)]
    mount_rootfs: Option<bool>,
    #[arg(long)]
    tmpfs_dev: Option<bool>,
    #[arg(long)]
    newpts: Option<bool>,
    #[arg(long)]
    newcgroup: Option<bool>,
    #[arg(long)]
    share_dalvik_cache: Option<bool>,
    #[arg(long)]
    sdcard_branch: Option<bool>,
    #[arg(long)]
    console: Option<bool>,
    #[arg(long)]
    autoswitch: Option<bool>,
    /// Block until the cell finishes starting
    #[arg(long)]
    wait: bool,
    /// Write the cell's init pid to this host path
    #[arg(long, default_value = "")]
    pidfile: String,
}

impl StartOpts {
    fn into_args(self) -> StartArgs {
        let overridden = [
            self.uts,
            self.ipc,
            self.user,
            self.net,
            self.pid,
            self.mount,
            self.mount_rootfs,
            self.tmpfs_dev,
            self.newpts,
            self.newcgroup,
            self.share_dalvik_cache,
            self.sdcard_branch,
            self.console,
            self.autoswitch,
        ]
        .iter()
        .any(Option::is_some);

        StartArgs {
            uts: self.uts.unwrap_or(true),
            ipc: self.ipc.unwrap_or(true),
            user: self.user.unwrap_or(false),
            net: self.net.unwrap_or(true),
            pid: self.pid.unwrap_or(true),
            mount: self.mount.unwrap_or(true),
            mount_rootfs: self.mount_rootfs.unwrap_or(true),
            tmpfs_dev: self.tmpfs_dev.unwrap_or(true),
            newpts: self.newpts.unwrap_or(true),
            newcgroup: self.newcgroup.unwrap_or(true),
            share_dalvik_cache: self.share_dalvik_cache.unwrap_or(false),
            sdcard_branch: self.sdcard_branch.unwrap_or(false),
            console: self.console.unwrap_or(true),
            autoswitch: self.autoswitch.unwrap_or(false),
            wait: self.wait,
            noopt: !overridden,
            pidfile: self.pidfile,
        }
    }
}

#[derive(Args)]
struct ToggleArg {
    #[arg(long, conflicts_with = "off")]
    on: bool,
    #[arg(long)]
    off: bool,
}

impl ToggleArg {
    fn op(&self) -> ToggleOp {
        match (self.on, self.off) {
            (true, _) => ToggleOp::On,
            (_, true) => ToggleOp::Off,
            _ => ToggleOp::Query,
        }
    }
}

fn main() {
    env_logger::init();
    match run(Cli::parse()) {
        Ok(status) => process::exit(status),
        Err(err) => {
            eprintln!("cell: {:#}", err);
            process::exit(1);
        }
    }
}

fn run(cli: Cli) -> Result<i32> {
    let stream = connect(&cli.socket)?;
    match cli.command {
        Command::List { running, zombie } => {
            let filter = if running {
                ListFilter::Running
            } else if zombie {
                ListFilter::Zombie
            } else {
                ListFilter::All
            };
            return list(stream, filter);
        }
        Command::Console { name } => return attach(stream, name, None),
        Command::Runcmd { name, command } => return attach(stream, name, Some(command)),
        other => {
            let request = plain_request(other);
            return simple(stream, &request);
        }
    }
}

fn plain_request(command: Command) -> Request {
    let (name, args) = match command {
        Command::Create { name, id } => (name, CommandArgs::Create { id }),
        Command::Destroy { name } => (name, CommandArgs::Destroy),
        Command::Next => (String::new(), CommandArgs::Next),
        Command::Prev => (String::new(), CommandArgs::Prev),
        Command::Start { name, opts } => (name, CommandArgs::Start(opts.into_args())),
        Command::Stop { name } => (name, CommandArgs::Stop),
        Command::Switch { name } => (name, CommandArgs::Switch),
        Command::Autostart { name, toggle } => (name, CommandArgs::Autostart(toggle.op())),
        Command::Autoswitch { name, toggle } => (name, CommandArgs::Autoswitch(toggle.op())),
        Command::Getid { name } => (name, CommandArgs::GetId),
        Command::Setid { name, id } => (name, CommandArgs::SetId { id }),
        Command::Getactive => (String::new(), CommandArgs::GetActive),
        Command::Mount { name, all } => (name.unwrap_or_default(), CommandArgs::Mount { all }),
        Command::Unmount { name } => (name, CommandArgs::Unmount),
        // Handled before we get here
        Command::List { .. } | Command::Console { .. } | Command::Runcmd { .. } => unreachable!(),
    };
    Request { name, args }
}

fn connect(socket: &str) -> Result<UnixStream> {
    let addr = SocketAddr::from_abstract_name(socket.as_bytes())?;
    UnixStream::connect_addr(&addr)
        .with_context(|| format!("daemon not reachable on abstract socket {:?}", socket))
}

/// Send one command, print the reply, exit with its status
fn simple(mut stream: UnixStream, request: &Request) -> Result<i32> {
    write_request(&mut stream, request)?;
    let reply = Reply::read_from(&mut BufReader::new(&stream))?;
    println!("{}", reply.message);
    Ok(reply.status as i32)
}

fn list(mut stream: UnixStream, filter: ListFilter) -> Result<i32> {
    let request = Request {
        name: String::new(),
        args: CommandArgs::List { filter },
    };
    write_request(&mut stream, &request)?;

    // No status line here, the payload itself is the reply
    let mut payload = Vec::new();
    stream.read_to_end(&mut payload)?;
    let records = decode_list(&payload)?;
    for record in records {
        match record.pid {
            Some(pid) => println!("{}\t{}\t{}", record.name, record.state.as_str(), pid),
            None => println!("{}\t{}", record.name, record.state.as_str()),
        }
    }
    Ok(0)
}

/// Console and runcmd: complete the handoff handshake, receive the console
/// descriptor, and bridge it to this terminal
fn attach(mut stream: UnixStream, name: String, command: Option<String>) -> Result<i32> {
    let request = Request {
        name,
        args: match &command {
            Some(command) => CommandArgs::RunCmd {
                command: command.clone(),
            },
            None => CommandArgs::Console,
        },
    };
    write_request(&mut stream, &request)?;

    let mut reader = BufReader::new(stream.try_clone()?);
    let reply = Reply::read_from(&mut reader)?;
    if !reply.success() {
        println!("{}", reply.message);
        return Ok(reply.status as i32);
    }
    log::info!("{}", reply.message);

    let echoed = match command {
        Some(_) => Some(read_command(&mut reader)?),
        None => None,
    };

    let mut token = [0u8; 8];
    reader.read_exact(&mut token)?;
    if token != READY_TOKEN {
        bail!("daemon sent an unexpected handoff token");
    }
    stream.write_all(&CLIENT_READY)?;
    let console = fdpass::recv_fd(&stream)?;

    if let Some(line) = echoed {
        let mut writer = File::from(console.try_clone()?);
        writer.write_all(line.as_bytes())?;
        writer.write_all(b"\n")?;
    }
    bridge(console)
}

/// Pump bytes between the console descriptor and this terminal until the
/// console side closes
fn bridge(console: OwnedFd) -> Result<i32> {
    let mut from_console = File::from(console.try_clone()?);
    let mut to_console = File::from(console);

    thread::spawn(move || {
        let mut stdin = io::stdin().lock();
        let _ = io::copy(&mut stdin, &mut to_console);
    });

    let mut stdout = io::stdout().lock();
    io::copy(&mut from_console, &mut stdout)?;
    Ok(0)
}
