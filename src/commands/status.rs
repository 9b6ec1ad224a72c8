use anyhow::Result;
use certward::{IdentityState, LifecycleManager};

use super::print_json;

/// Handle `certward status <username>`
pub fn handle_status(manager: &LifecycleManager, username: &str, json: bool) -> Result<()> {
    let status = manager.status(username)?;
    if json {
        return print_json(&status);
    }

    let state = match status.state {
        IdentityState::Absent => "absent",
        IdentityState::Active => "active",
        IdentityState::Revoked => "revoked",
    };
    println!("{}: {}", status.username, state);
    if let Some(serial) = &status.serial {
        println!("   Serial:      {}", serial);
    }
    if let (Some(from), Some(until)) = (status.not_before, status.not_after) {
        println!("   Valid from:  {}", from);
        println!("   Valid until: {}", until);
    }
    if let Some(at) = status.revoked_at {
        println!("   Revoked at:  {}", at);
    }
    Ok(())
}
