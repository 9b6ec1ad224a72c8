use anyhow::Result;
use certward::AppConfig;
use serde_json::json;

use super::print_json;

/// Handle `certward config`
///
/// Passphrases are reported as set or unset, never printed.
pub fn handle_show_config(config: &AppConfig, json: bool) -> Result<()> {
    let set = |present: bool| if present { "set" } else { "unset" };
    let certificates = &config.certificates;
    let subject = &config.subject;
    let storage = &config.storage;
    let key_passphrase = set(config.protection.key_passphrase.is_some());
    let bundle_passphrase = set(config.protection.bundle_passphrase.is_some());

    if json {
        return print_json(&json!({
            "certificates": {
                "cert_validity_days": certificates.cert_validity_days,
                "ca_validity_days": certificates.ca_validity_days,
                "key_size": certificates.key_size,
                "crl_validity_days": certificates.crl_validity_days,
            },
            "subject": {
                "country": subject.country,
                "state_province": subject.state_province,
                "locality": subject.locality,
                "organization": subject.organization,
                "ca_common_name": subject.ca_common_name,
            },
            "storage": {
                "ca_dir": storage.ca_dir(),
                "crts_dir": storage.crts_dir(),
                "private_dir": storage.private_dir(),
                "clients_dir": storage.clients_dir(),
            },
            "protection": {
                "key_passphrase": key_passphrase,
                "bundle_passphrase": bundle_passphrase,
            },
        }));
    }

    println!("[certificates]");
    println!("   cert_validity_days: {}", certificates.cert_validity_days);
    println!("   ca_validity_days:   {}", certificates.ca_validity_days);
    println!("   key_size:           {}", certificates.key_size);
    println!("   crl_validity_days:  {}", certificates.crl_validity_days);
    println!("[subject]");
    println!("   country:        {}", subject.country);
    println!("   state_province: {}", subject.state_province);
    println!("   locality:       {}", subject.locality);
    println!("   organization:   {}", subject.organization);
    println!("   ca_common_name: {}", subject.ca_common_name);
    println!("[storage]");
    println!("   ca_dir:      {}", storage.ca_dir().display());
    println!("   crts_dir:    {}", storage.crts_dir().display());
    println!("   private_dir: {}", storage.private_dir().display());
    println!("   clients_dir: {}", storage.clients_dir().display());
    println!("[protection]");
    println!("   key_passphrase:    {}", key_passphrase);
    println!("   bundle_passphrase: {}", bundle_passphrase);
    Ok(())
}
