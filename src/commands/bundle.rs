use std::path::Path;

use anyhow::Result;
use certward::storage::{write_atomic, Visibility};
use certward::LifecycleManager;
use serde_json::json;

use super::print_json;

/// Handle `certward bundle <username> --output FILE`
///
/// The copy is written owner-readable only: it holds the private key.
pub fn handle_bundle(
    manager: &LifecycleManager,
    username: &str,
    output: &Path,
    json: bool,
) -> Result<()> {
    let der = manager.fetch_bundle(username)?;
    write_atomic(output, &der, Visibility::Private)?;
    if json {
        return print_json(&json!({
            "username": username,
            "bundle_path": output,
            "bytes": der.len(),
        }));
    }

    println!("✓ Bundle for '{}' written to {}", username, output.display());
    Ok(())
}
