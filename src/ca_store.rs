//! CA Store
//!
//! Guarantees exactly one certificate authority per deployment. The first
//! call to [`CaStore::ensure_ca`] on an empty CA directory generates the key
//! pair and self-signed certificate, later calls load them.
//!
//! Bootstrap is serialized in-process by a mutex. Across processes the key
//! and certificate are moved into place with a no-clobber rename (key first,
//! certificate last), so a racing bootstrap fails instead of replacing a CA
//! that may already have signed something.
//!
//! Partial or unreadable CA material is a [`LifecycleError::FatalConfig`]:
//! regenerating would orphan every certificate issued so far.

use std::fmt;
use std::io;
use std::sync::{Arc, Mutex, PoisonError};

use openssl::pkey::{PKey, PKeyRef, Private};
use openssl::x509::{X509NameRef, X509Ref, X509};
use time::OffsetDateTime;
use tracing::{debug, info};

use crate::configs::{AppConfig, CertificateSettings, Passphrase, SubjectSettings};
use crate::crl_builder::CrlBuilder;
use crate::file_lock::FileLock;
use crate::error::{LifecycleError, Result};
use crate::generate_root_ca::RsaRootCABuilder;
use crate::private_key_storage::{decode_private_key, encode_private_key};
use crate::revocation_ledger::RevocationLedger;
use crate::serial::Serial;
use crate::storage::{read_optional, StagedFile, StorageLayout, Visibility};

/// The deployment's CA: certificate plus signing key.
///
/// The key is only reachable inside the crate, for signing.
pub struct CertificateAuthority {
    certificate: X509,
    private_key: PKey<Private>,
    serial: Serial,
}

impl CertificateAuthority {
    fn new(certificate: X509, private_key: PKey<Private>) -> Result<Self> {
        let serial = Serial::from_asn1(certificate.serial_number())?;
        Ok(Self {
            certificate,
            private_key,
            serial,
        })
    }

    pub fn certificate(&self) -> &X509Ref {
        &self.certificate
    }

    pub(crate) fn private_key(&self) -> &PKeyRef<Private> {
        &self.private_key
    }

    pub fn serial(&self) -> &Serial {
        &self.serial
    }

    /// Subject in `C=.., ST=.., CN=..` form, for display.
    pub fn subject(&self) -> String {
        one_line_name(self.certificate.subject_name())
    }

    pub fn certificate_pem(&self) -> Result<Vec<u8>> {
        Ok(self.certificate.to_pem()?)
    }
}

impl fmt::Debug for CertificateAuthority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertificateAuthority")
            .field("subject", &self.subject())
            .field("serial", &self.serial)
            .field("private_key", &"<redacted>")
            .finish()
    }
}

pub(crate) fn one_line_name(name: &X509NameRef) -> String {
    name.entries()
        .map(|entry| {
            let key = entry
                .object()
                .nid()
                .short_name()
                .unwrap_or("?")
                .to_string();
            let value = String::from_utf8_lossy(entry.data().as_slice());
            format!("{}={}", key, value)
        })
        .collect::<Vec<_>>()
        .join(", ")
}

pub struct CaStore {
    layout: StorageLayout,
    certificates: CertificateSettings,
    subject: SubjectSettings,
    key_passphrase: Option<Passphrase>,
    loaded: Mutex<Option<Arc<CertificateAuthority>>>,
}

impl CaStore {
    pub fn new(config: &AppConfig) -> Self {
        Self {
            layout: StorageLayout::from_settings(&config.storage),
            certificates: config.certificates.clone(),
            subject: config.subject.clone(),
            key_passphrase: config.protection.key_passphrase.clone(),
            loaded: Mutex::new(None),
        }
    }

    pub fn layout(&self) -> &StorageLayout {
        &self.layout
    }

    /// Return the CA, creating it if no CA material exists yet.
    pub fn ensure_ca(&self) -> Result<Arc<CertificateAuthority>> {
        // state lives on disk, a panicked holder leaves nothing half-done in memory
        let mut loaded = self.loaded.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(ca) = loaded.as_ref() {
            return Ok(Arc::clone(ca));
        }

        self.layout.ensure_dirs()?;
        let cert_path = self.layout.ca_cert_path();
        let key_path = self.layout.ca_key_path();
        // other processes on this root wait here and then load what we wrote
        let _bootstrap = FileLock::acquire(&key_path)?;

        let ca = match (read_optional(&cert_path)?, read_optional(&key_path)?) {
            (Some(cert_pem), Some(key_pem)) => self.load(&cert_pem, &key_pem)?,
            (None, None) => self.bootstrap()?,
            (Some(_), None) => {
                return Err(LifecycleError::FatalConfig(format!(
                    "CA certificate {} exists but its private key {} is missing",
                    cert_path.display(),
                    key_path.display()
                )))
            }
            (None, Some(_)) => {
                return Err(LifecycleError::FatalConfig(format!(
                    "CA private key {} exists but its certificate {} is missing",
                    key_path.display(),
                    cert_path.display()
                )))
            }
        };

        let ca = Arc::new(ca);
        *loaded = Some(Arc::clone(&ca));
        Ok(ca)
    }

    fn load(&self, cert_pem: &[u8], key_pem: &[u8]) -> Result<CertificateAuthority> {
        let cert_path = self.layout.ca_cert_path();
        let key_path = self.layout.ca_key_path();

        let certificate = X509::from_pem(cert_pem).map_err(|_| {
            LifecycleError::FatalConfig(format!(
                "CA certificate {} is not a valid PEM certificate",
                cert_path.display()
            ))
        })?;
        let private_key =
            decode_private_key(key_pem, self.key_passphrase.as_ref()).map_err(|_| {
                LifecycleError::FatalConfig(format!(
                    "CA private key {} cannot be decoded (corrupt, or wrong key passphrase)",
                    key_path.display()
                ))
            })?;
        if !certificate.public_key()?.public_eq(&private_key) {
            return Err(LifecycleError::FatalConfig(format!(
                "CA private key {} does not match certificate {}",
                key_path.display(),
                cert_path.display()
            )));
        }

        let ca = CertificateAuthority::new(certificate, private_key)?;
        debug!(subject = %ca.subject(), serial = %ca.serial(), "Loaded CA");
        Ok(ca)
    }

    fn bootstrap(&self) -> Result<CertificateAuthority> {
        info!(
            key_size = self.certificates.key_size,
            validity_days = self.certificates.ca_validity_days,
            "No CA found, generating a new one"
        );
        let (private_key, certificate) = RsaRootCABuilder::new()
            .subject_common_name(self.subject.ca_common_name.clone())
            .organization(self.subject.organization.clone())
            .locality(self.subject.locality.clone())
            .state(self.subject.state_province.clone())
            .country(self.subject.country.clone())
            .key_size(self.certificates.key_size)
            .validity_days(self.certificates.ca_validity_days)
            .build()?;

        let key_pem = encode_private_key(&private_key, self.key_passphrase.as_ref())?;
        let staged_key =
            StagedFile::stage(&self.layout.ca_key_path(), &key_pem, Visibility::Private)?;
        let staged_cert = StagedFile::stage(
            &self.layout.ca_cert_path(),
            &certificate.to_pem()?,
            Visibility::Public,
        )?;
        claim(staged_key)?;
        claim(staged_cert)?;

        let ca = CertificateAuthority::new(certificate, private_key)?;
        info!(
            subject = %ca.subject(),
            serial = %ca.serial(),
            path = %self.layout.ca_cert_path().display(),
            "Created CA"
        );

        let crl_path = self.layout.crl_path();
        let _ledger = FileLock::acquire(&self.layout.ledger_path())?;
        if read_optional(&crl_path)?.is_none() {
            let ledger = RevocationLedger::load(&self.layout.ledger_path())?;
            CrlBuilder::new(&ca, self.certificates.crl_validity_days).write(
                &ledger,
                OffsetDateTime::now_utc(),
                &crl_path,
            )?;
        }
        Ok(ca)
    }
}

/// Commit a staged CA file without replacing one created concurrently.
fn claim(staged: StagedFile) -> Result<()> {
    let target = staged.target().to_path_buf();
    staged.commit_new().map_err(|e| match e {
        LifecycleError::Io { ref source, .. } if source.kind() == io::ErrorKind::AlreadyExists => {
            LifecycleError::FatalConfig(format!(
                "{} was created by another process during CA bootstrap",
                target.display()
            ))
        }
        other => other,
    })
}
