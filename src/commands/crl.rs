use std::io::Write;
use std::path::Path;

use anyhow::{Context, Result};
use certward::storage::{write_atomic, Visibility};
use certward::LifecycleManager;

/// Handle `certward crl [--output FILE]`
///
/// Without `--output` the PEM goes to stdout, so it can be piped.
pub fn handle_crl(manager: &LifecycleManager, output: Option<&Path>) -> Result<()> {
    let pem = manager.fetch_crl()?;
    match output {
        Some(path) => {
            write_atomic(path, &pem, Visibility::Public)?;
            eprintln!("✓ CRL written to {}", path.display());
        }
        None => std::io::stdout()
            .lock()
            .write_all(&pem)
            .context("Failed to write CRL to stdout")?,
    }
    Ok(())
}
