use anyhow::Result;
use certward::LifecycleManager;

use super::print_json;

/// Handle `certward create <username>`
///
/// Issues the first certificate for `username`. Fails with a conflict
/// (exit code 3) when one is already on file.
pub fn handle_create(manager: &LifecycleManager, username: &str, json: bool) -> Result<()> {
    let issued = manager.issue(username)?;
    if json {
        return print_json(&issued);
    }

    println!("✓ Certificate issued for '{}'", issued.username);
    println!("   Serial:      {}", issued.serial);
    println!("   Valid from:  {}", issued.not_before);
    println!("   Valid until: {}", issued.not_after);
    println!("   Certificate: {}", issued.certificate_path.display());
    println!("   Private key: {}", issued.private_key_path.display());
    println!("   Bundle:      {}", issued.bundle_path.display());
    Ok(())
}
