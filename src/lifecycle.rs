//! Lifecycle Manager
//!
//! The facade front ends talk to. It composes the CA store, the issuer, the
//! revocation ledger and the CRL builder into the per-identity state machine
//!
//! ```text
//! absent --issue--> active --revoke--> revoked
//!                   active --renew---> active'   (old serial optionally revoked)
//! ```
//!
//! # Locking
//! Both locks are advisory [`FileLock`]s, so they hold across threads,
//! managers and processes sharing one storage root:
//! - `<crts_dir>/<username>.crt.lock` serializes issue, renew and revoke of
//!   that identity (closes the check-then-write race on its files);
//! - `<ca_dir>/revoked_serials.txt.lock` covers every read-modify-write of
//!   the ledger together with the CRL rebuild that follows it.
//!
//! Locks are always taken identity first, ledger second.

use std::sync::Arc;

use serde::Serialize;
use time::OffsetDateTime;
use tracing::{debug, info, warn};

use crate::ca_store::{CaStore, CertificateAuthority};
use crate::certificate_issuer::{validate_username, CertificateIssuer, IssuedCertificate};
use crate::configs::AppConfig;
use crate::crl_builder::CrlBuilder;
use crate::error::{LifecycleError, Result};
use crate::file_lock::FileLock;
use crate::revocation_ledger::RevocationLedger;
use crate::serial::Serial;
use crate::storage::{read_optional, StorageLayout};

/// Outcome of a revocation.
#[derive(Debug, Clone, Serialize)]
pub struct RevokedCertificate {
    pub username: String,
    pub serial: Serial,
    #[serde(with = "time::serde::rfc3339")]
    pub revoked_at: OffsetDateTime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum IdentityState {
    Absent,
    Active,
    Revoked,
}

/// What is on file for one username.
#[derive(Debug, Clone, Serialize)]
pub struct IdentityStatus {
    pub username: String,
    pub state: IdentityState,
    pub serial: Option<Serial>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub not_before: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub not_after: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub revoked_at: Option<OffsetDateTime>,
}

pub struct LifecycleManager {
    config: AppConfig,
    layout: StorageLayout,
    ca_store: CaStore,
    issuer: CertificateIssuer,
}

impl LifecycleManager {
    /// Build a manager that owns its copy of `config`.
    pub fn new(config: AppConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            layout: StorageLayout::from_settings(&config.storage),
            ca_store: CaStore::new(&config),
            issuer: CertificateIssuer::new(&config),
            config,
        })
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// Load the CA, creating it on first use.
    pub fn ensure_ca(&self) -> Result<Arc<CertificateAuthority>> {
        self.ca_store.ensure_ca()
    }

    /// `absent -> active`. `Conflict` if a certificate is already on file.
    pub fn issue(&self, username: &str) -> Result<IssuedCertificate> {
        validate_username(username)?;
        let ca = self.ensure_ca()?;
        let _identity = self.lock_identity(username)?;

        let revoked = {
            let _ledger = self.lock_ledger()?;
            self.load_ledger()?.all()
        };
        self.issuer.issue(username, &ca, &revoked)
    }

    /// `active -> revoked`. `NotFound` if nothing is on file; revoking an
    /// already revoked identity succeeds again with the original time.
    ///
    /// The CRL is rebuilt on every call, so retrying repairs a CRL left stale
    /// by an interrupted revocation.
    pub fn revoke(&self, username: &str) -> Result<RevokedCertificate> {
        validate_username(username)?;
        let ca = self.ensure_ca()?;
        let _identity = self.lock_identity(username)?;

        let record = self
            .issuer
            .current(username)?
            .ok_or_else(|| LifecycleError::not_found(username))?;

        let revoked_at = self.revoke_serial(&ca, &record.serial)?;
        info!(username, serial = %record.serial, "Revoked certificate");
        Ok(RevokedCertificate {
            username: username.to_string(),
            serial: record.serial,
            revoked_at,
        })
    }

    /// `active -> active'`. Issues a replacement in place and, when
    /// `revoke_old` is set, revokes the superseded serial.
    ///
    /// `NotFound` if nothing is on file, `Conflict` if the certificate on
    /// file is revoked.
    pub fn renew(&self, username: &str, revoke_old: bool) -> Result<IssuedCertificate> {
        validate_username(username)?;
        let ca = self.ensure_ca()?;
        let _identity = self.lock_identity(username)?;

        let current = self
            .issuer
            .current(username)?
            .ok_or_else(|| LifecycleError::not_found(username))?;
        let revoked = {
            let _ledger = self.lock_ledger()?;
            self.load_ledger()?.all()
        };
        if revoked.contains(&current.serial) {
            return Err(LifecycleError::conflict(username, "is revoked"));
        }

        let (mut issued, previous) = self.issuer.renew(username, &ca, &revoked)?;
        if revoke_old {
            self.revoke_serial(&ca, &previous.serial)?;
            info!(username, serial = %previous.serial, "Revoked superseded certificate");
            issued.old_serial_revoked = Some(previous.serial);
        }
        Ok(issued)
    }

    /// Current CRL as PEM, built on demand when none is on file.
    pub fn fetch_crl(&self) -> Result<Vec<u8>> {
        let ca = self.ensure_ca()?;
        let _ledger = self.lock_ledger()?;
        let crl_path = self.layout.crl_path();
        if let Some(pem) = read_optional(&crl_path)? {
            return Ok(pem);
        }
        warn!(path = %crl_path.display(), "CRL missing, regenerating");
        let ledger = self.load_ledger()?;
        CrlBuilder::new(&ca, self.config.certificates.crl_validity_days).write(
            &ledger,
            OffsetDateTime::now_utc(),
            &crl_path,
        )
    }

    /// The PKCS#12 bundle for an identity with a certificate on file.
    pub fn fetch_bundle(&self, username: &str) -> Result<Vec<u8>> {
        validate_username(username)?;
        if self.issuer.current(username)?.is_none() {
            return Err(LifecycleError::not_found(username));
        }
        self.issuer
            .bundle(username)?
            .ok_or_else(|| LifecycleError::not_found(username))
    }

    pub fn status(&self, username: &str) -> Result<IdentityStatus> {
        validate_username(username)?;
        let mut status = IdentityStatus {
            username: username.to_string(),
            state: IdentityState::Absent,
            serial: None,
            not_before: None,
            not_after: None,
            revoked_at: None,
        };
        let record = match self.issuer.current(username)? {
            Some(record) => record,
            None => return Ok(status),
        };

        let revoked_at = {
            let _ledger = self.lock_ledger()?;
            self.load_ledger()?.revoked_at(&record.serial)
        };
        status.state = match revoked_at {
            Some(at) => {
                status.revoked_at = at;
                IdentityState::Revoked
            }
            None => IdentityState::Active,
        };
        status.serial = Some(record.serial);
        status.not_before = Some(record.not_before);
        status.not_after = Some(record.not_after);
        Ok(status)
    }

    /// The CA certificate as PEM, creating the CA on first use.
    pub fn ca_certificate_pem(&self) -> Result<Vec<u8>> {
        self.ensure_ca()?.certificate_pem()
    }

    /// Add `serial` to the ledger and rebuild the CRL, as one critical
    /// section. Returns the recorded revocation time.
    fn revoke_serial(&self, ca: &CertificateAuthority, serial: &Serial) -> Result<OffsetDateTime> {
        let _ledger = self.lock_ledger()?;
        let mut ledger = self.load_ledger()?;
        let now = OffsetDateTime::now_utc();
        if !ledger.add(serial, now)? {
            debug!(serial = %serial, "Serial already revoked");
        }
        CrlBuilder::new(ca, self.config.certificates.crl_validity_days).write(
            &ledger,
            now,
            &self.layout.crl_path(),
        )?;
        Ok(ledger.revoked_at(serial).flatten().unwrap_or(now))
    }

    fn load_ledger(&self) -> Result<RevocationLedger> {
        RevocationLedger::load(&self.layout.ledger_path())
    }

    fn lock_ledger(&self) -> Result<FileLock> {
        FileLock::acquire(&self.layout.ledger_path())
    }

    /// Callers must have validated `username` first.
    fn lock_identity(&self, username: &str) -> Result<FileLock> {
        FileLock::acquire(&self.layout.cert_path(username))
    }
}
