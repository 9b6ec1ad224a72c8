use anyhow::Result;
use certward::LifecycleManager;

use super::print_json;

/// Handle `certward revoke <username>`
///
/// Revoking an already revoked username succeeds and reports the original
/// revocation time.
pub fn handle_revoke(manager: &LifecycleManager, username: &str, json: bool) -> Result<()> {
    let revoked = manager.revoke(username)?;
    if json {
        return print_json(&revoked);
    }

    println!("✓ Certificate of '{}' revoked", revoked.username);
    println!("   Serial:     {}", revoked.serial);
    println!("   Revoked at: {}", revoked.revoked_at);
    println!("   CRL regenerated");
    Ok(())
}
