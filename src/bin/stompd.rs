use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{CommandFactory, Parser};
use daemonize::Daemonize;
use log::info;
use signal_hook::consts::{SIGHUP, SIGINT, SIGQUIT, SIGTERM};

use stompd::broker::{Broker, BrokerOptions};
use stompd::config::Config;
use stompd::store::Store;
use stompd::users::UserDirectory;

#[derive(Parser)]
#[command(
    name = "stompd",
    version,
    about = "Event-driven STOMP 1.0 message broker with durable ring-queue persistence"
)]
struct Cli {
    /// Path to the broker configuration file
    #[arg(short = 'c', value_name = "CONFIG")]
    config: Option<PathBuf>,

    /// Stop the broker named by the config's pid_file and exit
    #[arg(short = 't')]
    terminate: bool,

    /// Stay in the foreground instead of daemonizing
    #[arg(short = 'f')]
    foreground: bool,
}

fn main() {
    let cli = Cli::parse();

    let Some(config_path) = cli.config.clone() else {
        let _ = Cli::command().print_help();
        std::process::exit(0);
    };

    if let Err(err) = run(&cli, &config_path) {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}

fn run(cli: &Cli, config_path: &Path) -> Result<()> {
    let config = Config::load(config_path)
        .with_context(|| format!("can't load config file '{}'", config_path.display()))?;

    std::env::set_current_dir(&config.spool)
        .with_context(|| format!("can't enter spool directory '{}'", config.spool.display()))?;

    let pid = read_pid(config.pid_file.as_deref());

    if cli.terminate {
        match pid {
            None => eprintln!("stopped."),
            Some(pid) => {
                eprint!("found, pid={pid}... ");
                if unsafe { libc::kill(pid, libc::SIGTERM) } == 0 {
                    eprintln!("terminate.");
                } else {
                    eprintln!("kill: {}", std::io::Error::last_os_error());
                }
            }
        }
        return Ok(());
    }

    if let Some(pid) = pid {
        bail!("already running, pid={pid}");
    }

    if !cli.foreground {
        Daemonize::new()
            .working_directory(".")
            .start()
            .context("daemonize failed")?;
    }

    env_logger::init();
    info!("initialize...");

    if let Some(pid_file) = &config.pid_file {
        fs::write(pid_file, std::process::id().to_string())
            .with_context(|| format!("can't write pid file '{}'", pid_file.display()))?;
    }

    let shutdown = Arc::new(AtomicBool::new(false));
    let reload = Arc::new(AtomicBool::new(false));
    for sig in [SIGINT, SIGQUIT, SIGTERM] {
        signal_hook::flag::register(sig, Arc::clone(&shutdown))
            .context("install shutdown signal handler")?;
    }
    signal_hook::flag::register(SIGHUP, Arc::clone(&reload))
        .context("install reload signal handler")?;
    let _ = unsafe { libc::signal(libc::SIGPIPE, libc::SIG_IGN) };

    let store = Store::open(
        &config.persist_db,
        config.db_type,
        config.db_max_queue_size,
        false,
    )?;
    info!("open '{}' as persist queue", config.persist_db.display());

    let users = UserDirectory::open(&config.users_db, users_cache_name(&config.users_db))?;
    info!("open '{}' as user database", config.users_db.display());

    let mut broker = Broker::new(
        store,
        users,
        BrokerOptions {
            no_login: config.no_login,
            blob_dir: PathBuf::from("."),
        },
    )?;
    broker.listen(&config.listen, config.backlog)?;
    info!("initialized");

    let result = broker.run(&shutdown, &reload);
    broker.close()?;
    result?;

    if let Some(pid_file) = &config.pid_file {
        let _ = fs::remove_file(pid_file);
    }
    info!("bye.");
    Ok(())
}

/// The user cache lives next to the spool as `<source basename>.db`,
/// recreated on every start and reload.
fn users_cache_name(source: &Path) -> PathBuf {
    let mut name = source
        .file_name()
        .map(|base| base.to_os_string())
        .unwrap_or_else(|| "users".into());
    name.push(".db");
    PathBuf::from(name)
}

fn read_pid(pid_file: Option<&Path>) -> Option<i32> {
    let text = fs::read_to_string(pid_file?).ok()?;
    text.trim().parse().ok().filter(|&pid| pid > 0)
}
