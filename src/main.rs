//! certward - client certificate lifecycle CLI
//!
//! ```bash
//! certward create alice              # issue crts/alice.crt, private/alice.key, clients/alice.pfx
//! certward revoke alice              # add alice's serial to the ledger, rebuild the CRL
//! certward renew alice [--keep-old]  # replace alice's certificate, revoking the old one
//! certward crl [--output crl.pem]    # current CRL (PEM)
//! certward bundle alice --output alice.pfx
//! certward status alice
//! certward config                    # resolved configuration
//! ```
//!
//! Results go to stdout (JSON with `--json`), logs to stderr. Log filtering
//! comes from `CERTWARD_LOG`, then `RUST_LOG`, defaulting to `certward=info`.
//!
//! Exit codes: 0 success, 2 failure, 3 conflict, 4 not found.

mod commands;

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use certward::{AppConfig, LifecycleError, LifecycleManager};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

const DEFAULT_LOG_FILTER: &str = "certward=info";

#[derive(Parser, Debug)]
#[command(name = "certward", version, about = "Single-CA client certificate lifecycle manager")]
struct Cli {
    /// Configuration file (defaults to ./certward.toml when present)
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Print results and logs as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Issue a client certificate for a new username
    Create { username: String },
    /// Revoke the certificate on file for a username
    Revoke { username: String },
    /// Replace the certificate on file for a username
    Renew {
        username: String,
        /// Do not revoke the superseded certificate
        #[arg(long)]
        keep_old: bool,
    },
    /// Print or save the current CRL
    Crl {
        #[arg(long, short, value_name = "FILE")]
        output: Option<PathBuf>,
    },
    /// Export the PKCS#12 bundle of a username
    Bundle {
        username: String,
        #[arg(long, short, value_name = "FILE")]
        output: PathBuf,
    },
    /// Show whether a username is absent, active or revoked
    Status { username: String },
    /// Show the resolved configuration
    Config,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.json);

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            let code = e
                .chain()
                .find_map(|cause| cause.downcast_ref::<LifecycleError>())
                .map_or(2, LifecycleError::exit_code);
            eprintln!("Error: {:#}", e);
            ExitCode::from(u8::try_from(code).unwrap_or(2))
        }
    }
}

fn init_logging(json: bool) {
    let filter = std::env::var("CERTWARD_LOG")
        .or_else(|_| std::env::var("RUST_LOG"))
        .ok()
        .and_then(|directives| EnvFilter::try_new(directives).ok())
        .unwrap_or_else(|| EnvFilter::new(DEFAULT_LOG_FILTER));

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}

fn run(cli: Cli) -> Result<()> {
    let config =
        AppConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;

    let json = cli.json;
    match cli.command {
        Command::Config => commands::show_config::handle_show_config(&config, json),
        command => dispatch(&LifecycleManager::new(config)?, command, json),
    }
}

fn dispatch(manager: &LifecycleManager, command: Command, json: bool) -> Result<()> {
    match command {
        Command::Create { username } => commands::create::handle_create(manager, &username, json),
        Command::Revoke { username } => commands::revoke::handle_revoke(manager, &username, json),
        Command::Renew { username, keep_old } => {
            commands::renew::handle_renew(manager, &username, !keep_old, json)
        }
        Command::Crl { output } => commands::crl::handle_crl(manager, output.as_deref()),
        Command::Bundle { username, output } => {
            commands::bundle::handle_bundle(manager, &username, &output, json)
        }
        Command::Status { username } => commands::status::handle_status(manager, &username, json),
        Command::Config => commands::show_config::handle_show_config(manager.config(), json),
    }
}
