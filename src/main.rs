use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use clap::Parser;
use tracing::info;

use tundra_tftpd::bootstrap;
use tundra_tftpd::config;
use tundra_tftpd::datastore::Datastore;
use tundra_tftpd::error::{FailureKind, TftpError};
use tundra_tftpd::logging;
use tundra_tftpd::net::Family;
use tundra_tftpd::reactor::Reactor;
use tundra_tftpd::audit;

#[derive(Parser, Debug)]
#[command(name = "tundra-tftpd", version, about = "Standalone TFTP (RFC 1350) server")]
struct Cli {
    /// Serve IPv4 only
    #[arg(short = '4', conflicts_with = "ipv6_only")]
    ipv4_only: bool,

    /// Serve IPv6 only
    #[arg(short = '6')]
    ipv6_only: bool,

    /// Bind only to this network interface
    #[arg(short = 'i', long = "if")]
    iface: Option<String>,

    /// Datastore root directory (overrides the config file)
    #[arg(short = 'd', long)]
    datastore: Option<PathBuf>,

    /// User to drop privileges to after binding (overrides the config file)
    #[arg(short = 'u', long)]
    username: Option<String>,

    /// Enable verbose (debug) logging
    #[arg(short = 'v', long)]
    verbose: bool,

    /// Optional TOML configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Stay attached to the terminal instead of daemonizing
    #[arg(long)]
    foreground: bool,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err((kind, e)) => {
            eprintln!("tundra-tftpd: {e}");
            ExitCode::from(kind.exit_code() as u8)
        }
    }
}

fn run(cli: Cli) -> std::result::Result<(), (FailureKind, TftpError)> {
    let file_config = match &cli.config {
        Some(path) => config::load_config(path).map_err(|e| (FailureKind::Usage, e))?,
        None => config::ServerConfig::default(),
    };

    let datastore_arg = cli.datastore.clone().unwrap_or_else(|| file_config.datastore.clone());
    let username = cli.username.clone().unwrap_or_else(|| file_config.username.clone());
    let log_path = file_config.logging.file.clone();
    let max_sessions = file_config.max_sessions;

    bootstrap::require_root().map_err(|e| (FailureKind::Usage, e))?;
    bootstrap::ignore_background_signals();

    // Fork before spinning up the logging worker thread: daemonizing
    // after `logging::init` would leave the non-blocking writer's
    // background thread behind in the parent, and the child would carry
    // a half-initialized tracing subscriber across the fork.
    bootstrap::daemonize(cli.foreground).map_err(|e| (FailureKind::Os, e))?;
    let default_level = if cli.verbose { "debug" } else { file_config.logging.level.as_str() };
    let _log_guard = logging::init(&log_path, default_level).map_err(|e| (FailureKind::Software, e))?;

    let resolved_datastore =
        bootstrap::resolve_datastore_path(&datastore_arg).map_err(|e| (FailureKind::Os, e))?;

    let families = select_families(&cli);
    let listeners = bootstrap::create_listeners(&families, cli.iface.as_deref())
        .map_err(|e| (FailureKind::Os, e))?;

    let user = bootstrap::lookup_user(&username).map_err(|e| (FailureKind::Os, e))?;

    bootstrap::chroot_to_datastore(&resolved_datastore).map_err(|e| (FailureKind::Os, e))?;
    bootstrap::drop_privileges(&user).map_err(|e| (FailureKind::Os, e))?;

    let datastore = Datastore::new(PathBuf::from("/")).map_err(|e| {
        (FailureKind::Software, TftpError::Tftp(format!("datastore init failed: {e}")))
    })?;

    audit::server_started(&format!("{:?}", families), &resolved_datastore.display().to_string());
    info!("starting server, datastore={}", resolved_datastore.display());

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|e| (FailureKind::Os, TftpError::Io(e)))?;

    runtime.block_on(async move {
        let shutdown = Arc::new(AtomicBool::new(false));
        bootstrap::install_shutdown_handlers(shutdown.clone())
            .map_err(|e| (FailureKind::Os, e))?;
        let mut reactor = Reactor::with_session_limit(listeners, datastore, shutdown, max_sessions);
        reactor.run().await.map_err(|e| (FailureKind::Software, e))?;
        Ok::<(), (FailureKind, TftpError)>(())
    })?;

    audit::server_shutdown("signal");
    info!("exiting server");
    Ok(())
}

fn select_families(cli: &Cli) -> Vec<Family> {
    match (cli.ipv4_only, cli.ipv6_only) {
        (true, false) => vec![Family::V4],
        (false, true) => vec![Family::V6],
        _ => vec![Family::V4, Family::V6],
    }
}

