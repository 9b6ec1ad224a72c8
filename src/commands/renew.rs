use anyhow::Result;
use certward::LifecycleManager;

use super::print_json;

/// Handle `certward renew <username> [--keep-old]`
pub fn handle_renew(
    manager: &LifecycleManager,
    username: &str,
    revoke_old: bool,
    json: bool,
) -> Result<()> {
    let renewed = manager.renew(username, revoke_old)?;
    if json {
        return print_json(&renewed);
    }

    println!("✓ Certificate renewed for '{}'", renewed.username);
    println!("   Serial:      {}", renewed.serial);
    println!("   Valid from:  {}", renewed.not_before);
    println!("   Valid until: {}", renewed.not_after);
    match &renewed.old_serial_revoked {
        Some(old) => println!("   Previous certificate {} revoked, CRL regenerated", old),
        None => println!("   Previous certificate left valid (--keep-old)"),
    }
    Ok(())
}
