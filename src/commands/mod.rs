//! One handler per CLI subcommand. Each prints a short human summary, or a
//! single JSON document when `--json` is given.

pub mod bundle;
pub mod create;
pub mod crl;
pub mod renew;
pub mod revoke;
pub mod show_config;
pub mod status;

use std::io::Write;

use anyhow::{Context, Result};
use serde::Serialize;

/// Write `value` to stdout as one line of JSON.
pub fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let mut stdout = std::io::stdout().lock();
    serde_json::to_writer(&mut stdout, value).context("Failed to serialize result")?;
    writeln!(stdout).context("Failed to write to stdout")?;
    Ok(())
}
