//! Resolved configuration consumed by the lifecycle manager.
//!
//! Loaded from a TOML file (every field has a default), then overridden by
//! `CERTWARD_*` environment variables. The manager keeps its own copy, so a
//! configuration change never affects a running manager or material that has
//! already been issued.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Deserializer};

use crate::error::{LifecycleError, Result};

/// Config file picked up by [`AppConfig::load`] when no path is given.
pub const DEFAULT_CONFIG_PATH: &str = "certward.toml";
/// Prefix for environment overrides.
pub const ENV_PREFIX: &str = "CERTWARD_";

const MIN_KEY_SIZE: u32 = 2048;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub certificates: CertificateSettings,
    #[serde(default)]
    pub subject: SubjectSettings,
    #[serde(default)]
    pub storage: StorageSettings,
    #[serde(default)]
    pub protection: ProtectionSettings,
}

#[derive(Debug, Deserialize, Clone)]
pub struct CertificateSettings {
    #[serde(default = "default_cert_validity")]
    pub cert_validity_days: u32,
    #[serde(default = "default_ca_validity")]
    pub ca_validity_days: u32,
    #[serde(default = "default_key_size")]
    pub key_size: u32,
    /// Offset of a CRL's `nextUpdate` from its `thisUpdate`.
    #[serde(default = "default_crl_validity")]
    pub crl_validity_days: u32,
}

impl Default for CertificateSettings {
    fn default() -> Self {
        Self {
            cert_validity_days: default_cert_validity(),
            ca_validity_days: default_ca_validity(),
            key_size: default_key_size(),
            crl_validity_days: default_crl_validity(),
        }
    }
}

fn default_cert_validity() -> u32 {
    365
}

fn default_ca_validity() -> u32 {
    3650 // 10 years
}

fn default_key_size() -> u32 {
    2048
}

fn default_crl_validity() -> u32 {
    1
}

/// Distinguished-name fields shared by the CA and every leaf.
#[derive(Debug, Deserialize, Clone)]
pub struct SubjectSettings {
    #[serde(default = "default_country")]
    pub country: String,
    #[serde(default = "default_state_province")]
    pub state_province: String,
    #[serde(default = "default_locality")]
    pub locality: String,
    #[serde(default = "default_organization")]
    pub organization: String,
    #[serde(default = "default_ca_common_name")]
    pub ca_common_name: String,
}

impl Default for SubjectSettings {
    fn default() -> Self {
        Self {
            country: default_country(),
            state_province: default_state_province(),
            locality: default_locality(),
            organization: default_organization(),
            ca_common_name: default_ca_common_name(),
        }
    }
}

fn default_country() -> String {
    "ES".to_string()
}

fn default_state_province() -> String {
    "Catalonia".to_string()
}

fn default_locality() -> String {
    "Girona".to_string()
}

fn default_organization() -> String {
    "GISCE-TI".to_string()
}

fn default_ca_common_name() -> String {
    "GISCE-TI CA".to_string()
}

/// Where artifacts live. Unset directories default to subfolders of `root_dir`.
#[derive(Debug, Deserialize, Clone)]
pub struct StorageSettings {
    #[serde(default = "default_root_dir")]
    pub root_dir: PathBuf,
    #[serde(default)]
    pub ca_dir: Option<PathBuf>,
    #[serde(default)]
    pub crts_dir: Option<PathBuf>,
    #[serde(default)]
    pub private_dir: Option<PathBuf>,
    #[serde(default)]
    pub clients_dir: Option<PathBuf>,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            root_dir: default_root_dir(),
            ca_dir: None,
            crts_dir: None,
            private_dir: None,
            clients_dir: None,
        }
    }
}

fn default_root_dir() -> PathBuf {
    PathBuf::from(".")
}

impl StorageSettings {
    pub fn rooted_at(root_dir: impl Into<PathBuf>) -> Self {
        Self {
            root_dir: root_dir.into(),
            ..Self::default()
        }
    }

    pub fn ca_dir(&self) -> PathBuf {
        self.ca_dir.clone().unwrap_or_else(|| self.root_dir.join("ca"))
    }

    pub fn crts_dir(&self) -> PathBuf {
        self.crts_dir
            .clone()
            .unwrap_or_else(|| self.root_dir.join("crts"))
    }

    pub fn private_dir(&self) -> PathBuf {
        self.private_dir
            .clone()
            .unwrap_or_else(|| self.root_dir.join("private"))
    }

    pub fn clients_dir(&self) -> PathBuf {
        self.clients_dir
            .clone()
            .unwrap_or_else(|| self.root_dir.join("clients"))
    }
}

/// Optional at-rest protection. Absent passphrases mean unencrypted files.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct ProtectionSettings {
    /// Encrypts the CA key and every leaf key (PKCS#8, AES-256-CBC).
    #[serde(default, deserialize_with = "deserialize_passphrase")]
    pub key_passphrase: Option<Passphrase>,
    /// Encrypts PKCS#12 bundles.
    #[serde(default, deserialize_with = "deserialize_passphrase")]
    pub bundle_passphrase: Option<Passphrase>,
}

/// A passphrase held in a zeroizing secret; redacted in `Debug`.
pub struct Passphrase(SecretString);

impl Passphrase {
    pub fn new(value: impl Into<String>) -> Self {
        Passphrase(SecretString::from(value.into()))
    }

    pub(crate) fn expose(&self) -> &str {
        self.0.expose_secret()
    }
}

impl Clone for Passphrase {
    fn clone(&self) -> Self {
        Passphrase::new(self.expose().to_owned())
    }
}

impl fmt::Debug for Passphrase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Passphrase(<redacted>)")
    }
}

fn deserialize_passphrase<'de, D>(deserializer: D) -> std::result::Result<Option<Passphrase>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<String> = Option::deserialize(deserializer)?;
    Ok(raw.filter(|s| !s.is_empty()).map(Passphrase::new))
}

impl AppConfig {
    /// Defaults with all artifacts stored under `root_dir`.
    pub fn with_root_dir(root_dir: impl Into<PathBuf>) -> Self {
        Self {
            storage: StorageSettings::rooted_at(root_dir),
            ..Self::default()
        }
    }

    /// Parse a TOML document without applying environment overrides.
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        toml::from_str(contents)
            .map_err(|e| LifecycleError::FatalConfig(format!("Failed to parse config: {}", e)))
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .map_err(|e| LifecycleError::io_at("reading config file", path, e))?;
        Self::from_toml_str(&contents)
    }

    /// Resolve the configuration: explicit file, else `certward.toml` when
    /// present, else defaults; then `CERTWARD_*` overrides; then validation.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(p) => Self::from_file(p)?,
            None if Path::new(DEFAULT_CONFIG_PATH).exists() => {
                Self::from_file(Path::new(DEFAULT_CONFIG_PATH))?
            }
            None => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(format!("{}{}", ENV_PREFIX, key)).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Apply overrides from a lookup keyed by the un-prefixed variable name
    /// (`KEY_SIZE`, `COUNTRY`, ...).
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let number = |key: &str, target: &mut u32| -> Result<()> {
            if let Some(raw) = lookup(key) {
                *target = raw.trim().parse().map_err(|_| {
                    LifecycleError::FatalConfig(format!(
                        "{}{} must be a positive integer, got '{}'",
                        ENV_PREFIX, key, raw
                    ))
                })?;
            }
            Ok(())
        };
        number("CERT_VALIDITY_DAYS", &mut self.certificates.cert_validity_days)?;
        number("CA_VALIDITY_DAYS", &mut self.certificates.ca_validity_days)?;
        number("KEY_SIZE", &mut self.certificates.key_size)?;
        number("CRL_VALIDITY_DAYS", &mut self.certificates.crl_validity_days)?;

        let text = |key: &str, target: &mut String| {
            if let Some(value) = lookup(key) {
                *target = value;
            }
        };
        text("COUNTRY", &mut self.subject.country);
        text("STATE_PROVINCE", &mut self.subject.state_province);
        text("LOCALITY", &mut self.subject.locality);
        text("ORGANIZATION", &mut self.subject.organization);
        text("CA_COMMON_NAME", &mut self.subject.ca_common_name);

        if let Some(root) = lookup("ROOT_DIR") {
            self.storage.root_dir = PathBuf::from(root);
        }
        if let Some(pass) = lookup("KEY_PASSPHRASE").filter(|s| !s.is_empty()) {
            self.protection.key_passphrase = Some(Passphrase::new(pass));
        }
        if let Some(pass) = lookup("BUNDLE_PASSPHRASE").filter(|s| !s.is_empty()) {
            self.protection.bundle_passphrase = Some(Passphrase::new(pass));
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        let c = &self.certificates;
        if c.key_size < MIN_KEY_SIZE || c.key_size % 8 != 0 {
            return Err(LifecycleError::FatalConfig(format!(
                "key_size must be a multiple of 8 and at least {}, got {}",
                MIN_KEY_SIZE, c.key_size
            )));
        }
        for (name, days) in [
            ("cert_validity_days", c.cert_validity_days),
            ("ca_validity_days", c.ca_validity_days),
            ("crl_validity_days", c.crl_validity_days),
        ] {
            if days == 0 {
                return Err(LifecycleError::FatalConfig(format!(
                    "{} must be greater than zero",
                    name
                )));
            }
        }

        let s = &self.subject;
        if s.country.len() != 2 || !s.country.bytes().all(|b| b.is_ascii_alphabetic()) {
            return Err(LifecycleError::FatalConfig(format!(
                "country must be a two-letter ISO code, got '{}'",
                s.country
            )));
        }
        for (name, value) in [
            ("state_province", &s.state_province),
            ("locality", &s.locality),
            ("organization", &s.organization),
            ("ca_common_name", &s.ca_common_name),
        ] {
            if value.trim().is_empty() {
                return Err(LifecycleError::FatalConfig(format!(
                    "subject field {} must not be empty",
                    name
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let config = AppConfig::default();
        assert_eq!(config.certificates.cert_validity_days, 365);
        assert_eq!(config.certificates.ca_validity_days, 3650);
        assert_eq!(config.certificates.key_size, 2048);
        assert_eq!(config.subject.ca_common_name, "GISCE-TI CA");
        assert_eq!(config.storage.ca_dir(), PathBuf::from("./ca"));
        assert!(config.protection.key_passphrase.is_none());
        config.validate().unwrap();
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = AppConfig::from_toml_str(
            r#"
            [certificates]
            cert_validity_days = 30

            [subject]
            organization = "ACME"

            [storage]
            root_dir = "/srv/pki"
            crts_dir = "/srv/public"
            "#,
        )
        .unwrap();
        assert_eq!(config.certificates.cert_validity_days, 30);
        assert_eq!(config.certificates.key_size, 2048);
        assert_eq!(config.subject.organization, "ACME");
        assert_eq!(config.subject.country, "ES");
        assert_eq!(config.storage.ca_dir(), PathBuf::from("/srv/pki/ca"));
        assert_eq!(config.storage.crts_dir(), PathBuf::from("/srv/public"));
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("KEY_SIZE", "3072"),
            ("CA_COMMON_NAME", "Ops CA"),
            ("BUNDLE_PASSPHRASE", "hunter2"),
        ]
        .into_iter()
        .collect();
        let mut config = AppConfig::default();
        config
            .apply_overrides(|k| env.get(k).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.certificates.key_size, 3072);
        assert_eq!(config.subject.ca_common_name, "Ops CA");
        assert_eq!(
            config.protection.bundle_passphrase.as_ref().unwrap().expose(),
            "hunter2"
        );
    }

    #[test]
    fn test_bad_numeric_override_is_fatal() {
        let mut config = AppConfig::default();
        let err = config
            .apply_overrides(|k| (k == "KEY_SIZE").then(|| "lots".to_string()))
            .unwrap_err();
        assert!(matches!(err, LifecycleError::FatalConfig(_)));
    }

    #[test]
    fn test_validation_rejects_weak_keys_and_bad_country() {
        let mut config = AppConfig::default();
        config.certificates.key_size = 1024;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.subject.country = "ESP".to_string();
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.certificates.cert_validity_days = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_passphrase_debug_is_redacted() {
        let config = AppConfig::from_toml_str(
            r#"
            [protection]
            key_passphrase = "top-secret"
            "#,
        )
        .unwrap();
        let debug = format!("{:?}", config);
        assert!(!debug.contains("top-secret"));
        assert!(debug.contains("<redacted>"));
    }
}
