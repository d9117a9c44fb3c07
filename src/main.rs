//! simbridge CLI - transport endpoint for host tooling.
//!
//! This is the main binary entry point. See the `simbridge` library for
//! the transport itself.

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand};
use mimalloc::MiMalloc;
use simbridge::{commands, constants, BridgeConfig, TransportError};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

/// Global allocator configured per M-MIMALLOC-APPS guideline.
#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

/// Global flag for signal-triggered shutdown (as Arc for signal-hook compatibility)
static SHUTDOWN_FLAG: std::sync::LazyLock<Arc<AtomicBool>> =
    std::sync::LazyLock::new(|| Arc::new(AtomicBool::new(false)));

/// Conventional exit status for a run ended by SIGINT.
const EXIT_INTERRUPTED: u8 = 130;

// CLI
#[derive(Parser)]
#[command(name = "simbridge")]
#[command(version)]
#[command(about = "Byte transport to a simulated embedded target over a virtual UART")]
struct Cli {
    /// Config file (default: platform config dir)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// More logging; -vv also traces every byte on the link
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    /// Log file (default: SIMBRIDGE_LOG_FILE, else stderr)
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Open the transport, print the marker and first chunk, then close
    Probe {
        /// How long to wait for each read, in milliseconds
        #[arg(long, default_value_t = constants::PROBE_READ_TIMEOUT.as_millis() as u64)]
        read_timeout_ms: u64,
    },
    /// Relay stdin to the target and the target to stdout
    Relay,
    /// Print the effective configuration
    Config,
}

fn init_logging(cli: &Cli) -> Result<()> {
    let level = match cli.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let mut builder = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level));
    builder.format_timestamp_secs();

    let log_path = cli
        .log_file
        .clone()
        .or_else(|| std::env::var_os("SIMBRIDGE_LOG_FILE").map(PathBuf::from));
    match log_path {
        Some(path) => {
            let log_file = std::fs::File::create(&path)
                .with_context(|| format!("Failed to create log file at {}", path.display()))?;
            builder.target(env_logger::Target::Pipe(Box::new(log_file)));
        }
        None => {
            builder.target(env_logger::Target::Stderr);
        }
    }
    builder.init();
    Ok(())
}

fn load_config(cli: &Cli) -> Result<BridgeConfig> {
    let mut config = match &cli.config {
        Some(path) => BridgeConfig::load(path)?,
        None => BridgeConfig::load_default()?,
    };
    if cli.verbose >= 2 {
        config.trace_io = true;
    }
    Ok(config)
}

fn run(cli: &Cli) -> Result<()> {
    let config = load_config(cli)?;

    match &cli.command {
        Commands::Probe { read_timeout_ms } => {
            register_shutdown_signals()?;
            commands::probe::run(&config, Duration::from_millis(*read_timeout_ms), &SHUTDOWN_FLAG)?;
        }
        Commands::Relay => {
            register_shutdown_signals()?;
            commands::relay::run(&config, &SHUTDOWN_FLAG)?;
        }
        Commands::Config => {
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
    }
    Ok(())
}

/// Route SIGINT/SIGTERM/SIGHUP to the shutdown flag so the simulator is
/// always torn down by `close()` rather than orphaned.
///
/// The flag is honoured while the transport opens as well, so an early
/// Ctrl-C abandons the open instead of waiting out its timeouts.
fn register_shutdown_signals() -> Result<()> {
    use signal_hook::consts::signal::{SIGHUP, SIGINT, SIGTERM};
    use signal_hook::flag;
    flag::register(SIGINT, Arc::clone(&SHUTDOWN_FLAG))?;
    flag::register(SIGTERM, Arc::clone(&SHUTDOWN_FLAG))?;
    flag::register(SIGHUP, Arc::clone(&SHUTDOWN_FLAG))?;
    Ok(())
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = init_logging(&cli) {
        eprintln!("Error: {e:#}");
        return ExitCode::FAILURE;
    }

    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            let transport = e.downcast_ref::<TransportError>();
            if transport.is_some_and(TransportError::is_cancelled) {
                log::info!("{e:#}");
                return ExitCode::from(EXIT_INTERRUPTED);
            }
            if transport.is_some_and(TransportError::is_fatal) {
                log::error!("Fatal: {e:#}");
                eprintln!("Fatal: {e:#}");
                std::process::abort();
            }
            log::error!("{e:#}");
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_verbose_is_repeatable_and_global() {
        let cli = Cli::try_parse_from(["simbridge", "relay", "-vv"]).expect("parse");
        assert_eq!(cli.verbose, 2);
        assert!(matches!(cli.command, Commands::Relay));
    }

    #[test]
    fn test_probe_timeout_default() {
        let cli = Cli::try_parse_from(["simbridge", "probe"]).expect("parse");
        match cli.command {
            Commands::Probe { read_timeout_ms } => assert_eq!(read_timeout_ms, 2000),
            _ => panic!("expected probe"),
        }
    }
}
