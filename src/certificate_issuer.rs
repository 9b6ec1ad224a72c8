//! Certificate Issuer
//!
//! Produces a client certificate, its private key and the PKCS#12 export
//! bundle for one username, signed by the CA, and enforces one certificate
//! file per username.
//!
//! All three artifacts are fully written to temporary files before anything
//! is renamed into place. The certificate is renamed last: its presence is
//! what makes an identity exist, so a crash part-way leaves the identity
//! absent and the next issue overwrites the stray key and bundle. A rename
//! that fails puts back the key and bundle that were there before.
//!
//! The issuer does no locking of its own; callers hold the identity's
//! [`FileLock`](crate::file_lock::FileLock) around issue and renew.

use std::collections::BTreeSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use openssl::asn1::{Asn1Time, Asn1TimeRef};
use openssl::x509::X509;
use serde::Serialize;
use time::OffsetDateTime;
use tracing::{debug, error, info, warn};

use crate::ca_store::CertificateAuthority;
use crate::configs::{AppConfig, CertificateSettings, Passphrase, SubjectSettings};
use crate::error::{LifecycleError, Result};
use crate::generate_user_keypair::RsaUserKeyPairBuilder;
use crate::pfx_key::build_pfx;
use crate::private_key_storage::encode_private_key;
use crate::serial::Serial;
use crate::storage::{read_optional, write_atomic, StagedFile, StorageLayout, Visibility};

const MAX_USERNAME_LEN: usize = 64;

/// Outcome of an issuance or renewal.
#[derive(Debug, Clone, Serialize)]
pub struct IssuedCertificate {
    pub username: String,
    pub serial: Serial,
    #[serde(with = "time::serde::rfc3339")]
    pub not_before: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub not_after: OffsetDateTime,
    pub certificate_path: PathBuf,
    pub private_key_path: PathBuf,
    pub bundle_path: PathBuf,
    /// Serial of the superseded certificate, when a renewal revoked it.
    pub old_serial_revoked: Option<Serial>,
}

/// The certificate currently on file for a username.
#[derive(Debug, Clone)]
pub struct CertificateRecord {
    pub serial: Serial,
    pub not_before: OffsetDateTime,
    pub not_after: OffsetDateTime,
    pub certificate: X509,
}

impl CertificateRecord {
    fn from_certificate(certificate: X509) -> Result<Self> {
        Ok(Self {
            serial: Serial::from_asn1(certificate.serial_number())?,
            not_before: asn1_to_datetime(certificate.not_before())?,
            not_after: asn1_to_datetime(certificate.not_after())?,
            certificate,
        })
    }
}

/// Convert an ASN.1 time to a UTC timestamp.
pub(crate) fn asn1_to_datetime(time: &Asn1TimeRef) -> Result<OffsetDateTime> {
    let epoch = Asn1Time::from_unix(0)?;
    let diff = epoch.diff(time)?;
    let secs = i64::from(diff.days) * 86_400 + i64::from(diff.secs);
    OffsetDateTime::from_unix_timestamp(secs)
        .map_err(|e| LifecycleError::Encoding(format!("certificate time out of range: {}", e)))
}

/// Reject usernames that are unsafe as file names or as a CN.
///
/// Accepted: 1 to 64 characters from `[A-Za-z0-9._@-]`, not starting with `.`.
pub fn validate_username(username: &str) -> Result<()> {
    if username.is_empty() || username.len() > MAX_USERNAME_LEN {
        return Err(LifecycleError::InvalidIdentity(format!(
            "username must be 1 to {} characters long",
            MAX_USERNAME_LEN
        )));
    }
    if username.starts_with('.') {
        return Err(LifecycleError::InvalidIdentity(format!(
            "username '{}' must not start with '.'",
            username
        )));
    }
    if let Some(bad) = username
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '@' | '-')))
    {
        return Err(LifecycleError::InvalidIdentity(format!(
            "username contains unsupported character {:?}",
            bad
        )));
    }
    Ok(())
}

#[derive(Debug)]
pub struct CertificateIssuer {
    layout: StorageLayout,
    certificates: CertificateSettings,
    subject: SubjectSettings,
    key_passphrase: Option<Passphrase>,
    bundle_passphrase: Option<Passphrase>,
}

impl CertificateIssuer {
    pub fn new(config: &AppConfig) -> Self {
        Self {
            layout: StorageLayout::from_settings(&config.storage),
            certificates: config.certificates.clone(),
            subject: config.subject.clone(),
            key_passphrase: config.protection.key_passphrase.clone(),
            bundle_passphrase: config.protection.bundle_passphrase.clone(),
        }
    }

    /// Issue the first certificate for `username`.
    ///
    /// `excluded` holds serials that must not be reused (the revoked ones).
    /// Fails with `Conflict` when a certificate file already exists, leaving
    /// every file untouched.
    pub fn issue(
        &self,
        username: &str,
        ca: &CertificateAuthority,
        excluded: &BTreeSet<Serial>,
    ) -> Result<IssuedCertificate> {
        validate_username(username)?;
        if self.layout.cert_path(username).exists() {
            return Err(LifecycleError::conflict(username, "already exists"));
        }

        let serial = fresh_serial(ca, excluded, None)?;
        let issued = self.install(self.stage(username, ca, serial)?, Install::New)?;
        info!(username, serial = %issued.serial, "Issued certificate");
        Ok(issued)
    }

    /// Replace the certificate on file for `username` with a fresh one.
    ///
    /// Returns the new certificate together with the superseded record.
    /// Fails with `NotFound` when nothing is on file.
    pub fn renew(
        &self,
        username: &str,
        ca: &CertificateAuthority,
        excluded: &BTreeSet<Serial>,
    ) -> Result<(IssuedCertificate, CertificateRecord)> {
        validate_username(username)?;
        let previous = self
            .current(username)?
            .ok_or_else(|| LifecycleError::not_found(username))?;

        let serial = fresh_serial(ca, excluded, Some(&previous.serial))?;
        let issued = self.install(self.stage(username, ca, serial)?, Install::Replace)?;
        info!(
            username,
            serial = %issued.serial,
            old_serial = %previous.serial,
            "Renewed certificate"
        );
        Ok((issued, previous))
    }

    /// The certificate currently on file, if any.
    pub fn current(&self, username: &str) -> Result<Option<CertificateRecord>> {
        validate_username(username)?;
        let path = self.layout.cert_path(username);
        let pem = match read_optional(&path)? {
            Some(pem) => pem,
            None => return Ok(None),
        };
        let certificate = X509::from_pem(&pem).map_err(|_| {
            LifecycleError::Encoding(format!("{} is not a valid PEM certificate", path.display()))
        })?;
        Ok(Some(CertificateRecord::from_certificate(certificate)?))
    }

    /// The PKCS#12 bundle on file, if any.
    pub fn bundle(&self, username: &str) -> Result<Option<Vec<u8>>> {
        validate_username(username)?;
        read_optional(&self.layout.bundle_path(username))
    }

    /// Generate the key pair, certificate and bundle and write each to a
    /// temporary file beside its target. Nothing is in place yet.
    fn stage(&self, username: &str, ca: &CertificateAuthority, serial: Serial) -> Result<Staged> {
        let (private_key, certificate) =
            RsaUserKeyPairBuilder::new(ca.private_key(), ca.certificate())
                .subject_common_name(username.to_string())
                .organization(self.subject.organization.clone())
                .locality(self.subject.locality.clone())
                .state(self.subject.state_province.clone())
                .country(self.subject.country.clone())
                .key_size(self.certificates.key_size)
                .validity_days(self.certificates.cert_validity_days)
                .serial(serial)
                .build()?;

        let key_pem = encode_private_key(&private_key, self.key_passphrase.as_ref())?;
        let bundle = build_pfx(
            username,
            &private_key,
            &certificate,
            ca.certificate(),
            self.bundle_passphrase.as_ref(),
        )?;
        let cert_pem = certificate.to_pem()?;

        let certificate_path = self.layout.cert_path(username);
        let private_key_path = self.layout.key_path(username);
        let bundle_path = self.layout.bundle_path(username);

        let record = CertificateRecord::from_certificate(certificate)?;
        Ok(Staged {
            key: StagedFile::stage(&private_key_path, &key_pem, Visibility::Private)?,
            bundle: StagedFile::stage(&bundle_path, &bundle, Visibility::Private)?,
            certificate: StagedFile::stage(&certificate_path, &cert_pem, Visibility::Public)?,
            issued: IssuedCertificate {
                username: username.to_string(),
                serial: record.serial,
                not_before: record.not_before,
                not_after: record.not_after,
                certificate_path,
                private_key_path,
                bundle_path,
                old_serial_revoked: None,
            },
        })
    }

    /// Move key, bundle and certificate into place, in that order. If a
    /// later rename fails the earlier ones are undone, so the files on disk
    /// always belong to one certificate.
    fn install(&self, staged: Staged, mode: Install) -> Result<IssuedCertificate> {
        let Staged {
            key,
            bundle,
            certificate,
            issued,
        } = staged;
        let username = issued.username.as_str();

        let previous_key = Previous::capture(key.target())?;
        let previous_bundle = Previous::capture(bundle.target())?;

        key.commit()?;
        if let Err(e) = bundle.commit() {
            previous_key.restore();
            return Err(e);
        }
        debug!(username, path = %issued.private_key_path.display(), "Wrote private key and bundle");

        let committed = match mode {
            Install::New => certificate.commit_new().map_err(|e| match e {
                LifecycleError::Io { ref source, .. }
                    if source.kind() == io::ErrorKind::AlreadyExists =>
                {
                    LifecycleError::conflict(username, "already exists")
                }
                other => other,
            }),
            Install::Replace => certificate.commit(),
        };
        if let Err(e) = committed {
            previous_key.restore();
            previous_bundle.restore();
            return Err(e);
        }
        Ok(issued)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Install {
    /// The certificate must not exist yet.
    New,
    Replace,
}

/// What a target held before an install, for rolling it back.
struct Previous {
    path: PathBuf,
    contents: Option<Vec<u8>>,
}

impl Previous {
    fn capture(path: &Path) -> Result<Self> {
        Ok(Self {
            path: path.to_path_buf(),
            contents: read_optional(path)?,
        })
    }

    fn restore(self) {
        let restored = match &self.contents {
            Some(contents) => write_atomic(&self.path, contents, Visibility::Private),
            None => match fs::remove_file(&self.path) {
                Err(e) if e.kind() != io::ErrorKind::NotFound => {
                    Err(LifecycleError::io_at("removing", &self.path, e))
                }
                _ => Ok(()),
            },
        };
        if let Err(e) = restored {
            error!(path = %self.path.display(), error = %e, "Failed to roll back");
        }
    }
}

struct Staged {
    key: StagedFile,
    bundle: StagedFile,
    certificate: StagedFile,
    issued: IssuedCertificate,
}

/// Draw a random serial that is neither the CA's, nor excluded, nor `also`.
fn fresh_serial(
    ca: &CertificateAuthority,
    excluded: &BTreeSet<Serial>,
    also: Option<&Serial>,
) -> Result<Serial> {
    loop {
        let serial = Serial::random()?;
        if &serial != ca.serial() && !excluded.contains(&serial) && Some(&serial) != also {
            return Ok(serial);
        }
        warn!(serial = %serial, "Random serial already in use, drawing again");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ca_store::CaStore;
    use crate::pfx_key::{bundled_ca_certs, load_pfx};
    use crate::private_key_storage::decode_private_key;
    use openssl::nid::Nid;
    use std::fs;
    use std::sync::Arc;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        config: AppConfig,
        ca: Arc<CertificateAuthority>,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let mut config = AppConfig::with_root_dir(dir.path());
        config.certificates.cert_validity_days = 30;
        let ca = CaStore::new(&config).ensure_ca().unwrap();
        Fixture {
            _dir: dir,
            config,
            ca,
        }
    }

    #[test]
    fn test_username_validation() {
        for ok in ["alice", "bob.smith", "carol@example.com", "svc_01-a"] {
            validate_username(ok).unwrap();
        }
        for bad in ["", ".hidden", "../etc/passwd", "a/b", "with space", "ñandú"] {
            assert!(matches!(
                validate_username(bad).unwrap_err(),
                LifecycleError::InvalidIdentity(_)
            ));
        }
        assert!(validate_username(&"x".repeat(65)).is_err());
        validate_username(&"x".repeat(64)).unwrap();
    }

    #[test]
    fn test_issue_writes_three_artifacts() {
        let fx = fixture();
        let issuer = CertificateIssuer::new(&fx.config);
        let issued = issuer.issue("alice", &fx.ca, &BTreeSet::new()).unwrap();

        assert!(issued.certificate_path.ends_with("crts/alice.crt"));
        assert!(issued.private_key_path.ends_with("private/alice.key"));
        assert!(issued.bundle_path.ends_with("clients/alice.pfx"));
        assert!(issued.old_serial_revoked.is_none());

        let cert = X509::from_pem(&fs::read(&issued.certificate_path).unwrap()).unwrap();
        let key = decode_private_key(&fs::read(&issued.private_key_path).unwrap(), None).unwrap();
        assert!(cert.public_key().unwrap().public_eq(&key));
        assert!(cert.verify(fx.ca.private_key()).unwrap());

        let parsed = load_pfx(&fs::read(&issued.bundle_path).unwrap(), None).unwrap();
        assert_eq!(
            parsed.cert.as_ref().unwrap().to_der().unwrap(),
            cert.to_der().unwrap()
        );
        assert_eq!(bundled_ca_certs(&parsed).len(), 1);
    }

    #[test]
    fn test_round_trip_from_disk() {
        let fx = fixture();
        let issuer = CertificateIssuer::new(&fx.config);
        let issued = issuer.issue("dana", &fx.ca, &BTreeSet::new()).unwrap();

        let record = issuer.current("dana").unwrap().unwrap();
        assert_eq!(record.serial, issued.serial);
        assert_eq!(record.not_before, issued.not_before);
        assert_eq!(record.not_after, issued.not_after);
        assert_eq!(
            (record.not_after - record.not_before).whole_days(),
            30
        );
        let entry = record
            .certificate
            .subject_name()
            .entries_by_nid(Nid::COMMONNAME)
            .next()
            .unwrap();
        let cn = std::str::from_utf8(entry.data().as_slice()).unwrap();
        assert_eq!(cn, "dana");
    }

    #[test]
    fn test_second_issue_conflicts_and_keeps_files() {
        let fx = fixture();
        let issuer = CertificateIssuer::new(&fx.config);
        let issued = issuer.issue("alice", &fx.ca, &BTreeSet::new()).unwrap();
        let cert_before = fs::read(&issued.certificate_path).unwrap();
        let key_before = fs::read(&issued.private_key_path).unwrap();
        let bundle_before = fs::read(&issued.bundle_path).unwrap();

        let err = issuer.issue("alice", &fx.ca, &BTreeSet::new()).unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(fs::read(&issued.certificate_path).unwrap(), cert_before);
        assert_eq!(fs::read(&issued.private_key_path).unwrap(), key_before);
        assert_eq!(fs::read(&issued.bundle_path).unwrap(), bundle_before);
    }

    #[test]
    fn test_lost_certificate_slot_restores_key_and_bundle() {
        let fx = fixture();
        let issuer = CertificateIssuer::new(&fx.config);
        let issued = issuer.issue("alice", &fx.ca, &BTreeSet::new()).unwrap();
        let key_before = fs::read(&issued.private_key_path).unwrap();
        let bundle_before = fs::read(&issued.bundle_path).unwrap();

        // a second writer got past the existence check before alice.crt landed
        let serial = fresh_serial(&fx.ca, &BTreeSet::new(), Some(&issued.serial)).unwrap();
        let staged = issuer.stage("alice", &fx.ca, serial).unwrap();
        let err = issuer.install(staged, Install::New).unwrap_err();
        assert!(err.is_conflict());

        let cert = X509::from_pem(&fs::read(&issued.certificate_path).unwrap()).unwrap();
        let key = decode_private_key(&fs::read(&issued.private_key_path).unwrap(), None).unwrap();
        assert!(cert.public_key().unwrap().public_eq(&key));
        assert_eq!(fs::read(&issued.private_key_path).unwrap(), key_before);
        assert_eq!(fs::read(&issued.bundle_path).unwrap(), bundle_before);
    }

    #[test]
    fn test_lost_certificate_slot_leaves_no_stray_files() {
        let fx = fixture();
        let issuer = CertificateIssuer::new(&fx.config);
        let staged = issuer
            .stage("hank", &fx.ca, Serial::random().unwrap())
            .unwrap();
        let issued = staged.issued.clone();
        fs::write(&issued.certificate_path, b"placeholder").unwrap();

        assert!(issuer.install(staged, Install::New).unwrap_err().is_conflict());
        assert!(!issued.private_key_path.exists());
        assert!(!issued.bundle_path.exists());
        assert_eq!(fs::read(&issued.certificate_path).unwrap(), b"placeholder");
    }

    #[test]
    fn test_renew_replaces_in_place() {
        let fx = fixture();
        let issuer = CertificateIssuer::new(&fx.config);
        let first = issuer.issue("erin", &fx.ca, &BTreeSet::new()).unwrap();
        let old_key = fs::read(&first.private_key_path).unwrap();

        let (renewed, previous) = issuer.renew("erin", &fx.ca, &BTreeSet::new()).unwrap();
        assert_eq!(previous.serial, first.serial);
        assert_ne!(renewed.serial, first.serial);
        assert_ne!(fs::read(&renewed.private_key_path).unwrap(), old_key);
        assert_eq!(issuer.current("erin").unwrap().unwrap().serial, renewed.serial);
    }

    #[test]
    fn test_renew_unknown_user_is_not_found() {
        let fx = fixture();
        let issuer = CertificateIssuer::new(&fx.config);
        let err = issuer.renew("ghost", &fx.ca, &BTreeSet::new()).unwrap_err();
        assert!(err.is_not_found());
        assert!(issuer.current("ghost").unwrap().is_none());
        assert!(issuer.bundle("ghost").unwrap().is_none());
    }

    #[test]
    fn test_encrypted_leaf_key() {
        let fx = fixture();
        let mut config = fx.config.clone();
        config.protection.key_passphrase = Some(Passphrase::new("leaf-secret"));
        let issuer = CertificateIssuer::new(&config);
        let issued = issuer.issue("frank", &fx.ca, &BTreeSet::new()).unwrap();

        let pem = fs::read(&issued.private_key_path).unwrap();
        assert!(decode_private_key(&pem, None).is_err());
        decode_private_key(&pem, config.protection.key_passphrase.as_ref()).unwrap();
    }

    #[test]
    fn test_fresh_serial_avoids_known_serials() {
        let fx = fixture();
        let mut excluded = BTreeSet::new();
        excluded.insert(fx.ca.serial().clone());
        for _ in 0..16 {
            let serial = fresh_serial(&fx.ca, &excluded, None).unwrap();
            assert!(!excluded.contains(&serial));
            excluded.insert(serial);
        }
    }

    #[cfg(unix)]
    #[test]
    fn test_key_and_bundle_are_private() {
        use std::os::unix::fs::PermissionsExt;
        let fx = fixture();
        let issued = CertificateIssuer::new(&fx.config)
            .issue("gina", &fx.ca, &BTreeSet::new())
            .unwrap();
        for path in [&issued.private_key_path, &issued.bundle_path] {
            let mode = fs::metadata(path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
        let mode = fs::metadata(&issued.certificate_path)
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o644);
    }
}
