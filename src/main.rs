use celld::{Daemon, Settings};
use clap::Parser;
use std::{path::PathBuf, process, sync::Arc};

/// Cell orchestration daemon
#[derive(Parser)]
#[command(version, about)]
struct Args {
    /// Abstract unix socket name for the control channel
    #[arg(long, default_value = "celld")]
    socket_name: String,

    /// Parent directory for cell roots and writable state
    #[arg(long, default_value = "/data/cells")]
    cell_dir: PathBuf,

    /// Per-cell config directory, defaults to <cell-dir>/conf
    #[arg(long)]
    config_dir: Option<PathBuf>,

    /// Skeleton tree copied into new cell roots, defaults to <cell-dir>/skel
    #[arg(long)]
    skeleton_dir: Option<PathBuf>,

    /// Control file the active cell's init pid is written to
    #[arg(long, default_value = "/proc/dev_ns/active_ns_pid")]
    active_ns_file: PathBuf,

    /// Init binary executed inside each cell root
    #[arg(long, default_value = "/init")]
    init_program: PathBuf,

    /// Skip launching autostart-flagged cells at boot
    #[arg(long)]
    no_autostart: bool,

    /// Skip adopting cells left running by a previous daemon instance
    #[arg(long)]
    no_reattach: bool,

    /// Log level filter, overridden by RUST_LOG
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn main() {
    let args = Args::parse();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&args.log_level))
        .init();

    let settings = Settings {
        socket_name: args.socket_name,
        config_dir: args
            .config_dir
            .unwrap_or_else(|| args.cell_dir.join("conf")),
        skeleton_dir: args
            .skeleton_dir
            .unwrap_or_else(|| args.cell_dir.join("skel")),
        cell_dir: args.cell_dir,
        active_ns_file: args.active_ns_file,
        init_program: args.init_program,
        autostart: !args.no_autostart,
        reattach: !args.no_reattach,
    };

    let daemon = match Daemon::new(settings) {
        Ok(daemon) => Arc::new(daemon),
        Err(err) => {
            log::error!("daemon startup failed: {}", err);
            process::exit(1);
        }
    };

    if let Err(err) = daemon.run() {
        log::error!("control server failed: {}", err);
        process::exit(1);
    }
}
