//! CRL Builder
//!
//! Derives a signed X.509 v2 CRL from the CA and a ledger snapshot. The CRL
//! is never authoritative: it can always be rebuilt from the CA and the
//! ledger, and each rebuild fully replaces the previous file.
//!
//! The `openssl` crate can parse and verify CRLs but cannot build them, so
//! the `TBSCertList` is assembled with `x509-cert` types, DER-encoded, and
//! signed with the CA key through `openssl::sign::Signer`.
//!
//! # CRL Properties
//! - **Issuer**: the CA subject
//! - **thisUpdate**: generation time; **nextUpdate**: + `crl_validity_days`
//! - **Entries**: one per ledger serial, dated with its recorded revocation
//!   time (generation time for entries without one)
//! - **Extensions**: CRL Number, Authority Key Identifier (the CA's subject
//!   key identifier)
//! - **Signature**: SHA-256 with RSA
//!
//! The CRL Number is the generation time in seconds, bumped past the number
//! of the CRL being replaced so that it strictly increases even when two
//! rebuilds land in the same second. Callers serialize `write` with the
//! ledger lock.

use std::path::Path;
use std::time::Duration as StdDuration;

use const_oid::db::rfc5280::{ID_CE_AUTHORITY_KEY_IDENTIFIER, ID_CE_CRL_NUMBER};
use const_oid::db::rfc5912::SHA_256_WITH_RSA_ENCRYPTION;
use der::asn1::{Any, BitString, GeneralizedTime, OctetString, Uint, UtcTime};
use der::{DateTime, Decode, Encode};
use openssl::hash::MessageDigest;
use openssl::sign::Signer;
use pem::{EncodeConfig, LineEnding, Pem};
use time::{Duration, OffsetDateTime};
use tracing::{info, warn};
use x509_cert::crl::{CertificateList, RevokedCert, TbsCertList};
use x509_cert::ext::pkix::{AuthorityKeyIdentifier, CrlNumber};
use x509_cert::ext::Extension;
use x509_cert::name::Name;
use x509_cert::serial_number::SerialNumber;
use x509_cert::spki::AlgorithmIdentifierOwned;
use x509_cert::time::Time;
use x509_cert::Version;

use crate::ca_store::CertificateAuthority;
use crate::error::{LifecycleError, Result};
use crate::revocation_ledger::RevocationLedger;
use crate::storage::{read_optional, write_atomic, Visibility};

const PEM_LABEL: &str = "X509 CRL";

pub struct CrlBuilder<'a> {
    ca: &'a CertificateAuthority,
    validity_days: u32,
}

impl<'a> CrlBuilder<'a> {
    pub fn new(ca: &'a CertificateAuthority, validity_days: u32) -> Self {
        Self { ca, validity_days }
    }

    /// Build the PEM-encoded CRL for the ledger's current contents, numbered
    /// after the generation time.
    pub fn build(&self, ledger: &RevocationLedger, now: OffsetDateTime) -> Result<Vec<u8>> {
        self.build_numbered(ledger, now, next_crl_number(now, None))
    }

    /// Build the CRL and atomically replace the file at `path`, numbering it
    /// above the CRL currently there.
    pub fn write(
        &self,
        ledger: &RevocationLedger,
        now: OffsetDateTime,
        path: &Path,
    ) -> Result<Vec<u8>> {
        let previous = match read_optional(path)? {
            Some(pem) => crl_number(&pem).unwrap_or_else(|e| {
                warn!(path = %path.display(), error = %e, "Ignoring unreadable CRL");
                None
            }),
            None => None,
        };
        let number = next_crl_number(now, previous);
        let pem = self.build_numbered(ledger, now, number)?;
        write_atomic(path, &pem, Visibility::Public)?;
        info!(path = %path.display(), entries = ledger.len(), number, "Regenerated CRL");
        Ok(pem)
    }

    fn build_numbered(
        &self,
        ledger: &RevocationLedger,
        now: OffsetDateTime,
        number: u64,
    ) -> Result<Vec<u8>> {
        let this_update = x509_time(now)?;
        let next_update = x509_time(now + Duration::days(i64::from(self.validity_days)))?;

        let revoked = ledger
            .entries()
            .into_iter()
            .map(|entry| -> Result<RevokedCert> {
                Ok(RevokedCert {
                    serial_number: SerialNumber::new(&entry.serial.der_integer_bytes())?,
                    revocation_date: x509_time(entry.revoked_at.unwrap_or(now))?,
                    crl_entry_extensions: None,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let signature_algorithm = AlgorithmIdentifierOwned {
            oid: SHA_256_WITH_RSA_ENCRYPTION,
            parameters: Some(Any::null()),
        };

        let tbs_cert_list = TbsCertList {
            version: Version::V2,
            signature: signature_algorithm.clone(),
            issuer: Name::from_der(&self.ca.certificate().subject_name().to_der()?)?,
            this_update,
            next_update: Some(next_update),
            // an empty SEQUENCE is not allowed here; omit it instead
            revoked_certificates: (!revoked.is_empty()).then_some(revoked),
            crl_extensions: Some(self.crl_extensions(number)?),
        };

        let tbs_der = tbs_cert_list.to_der()?;
        let mut signer = Signer::new(MessageDigest::sha256(), self.ca.private_key())?;
        let signature = signer.sign_oneshot_to_vec(&tbs_der)?;

        let crl = CertificateList {
            tbs_cert_list,
            signature_algorithm,
            signature: BitString::from_bytes(&signature)?,
        };
        let der = crl.to_der()?;
        let config = EncodeConfig::new().set_line_ending(LineEnding::LF);
        Ok(pem::encode_config(&Pem::new(PEM_LABEL, der), config).into_bytes())
    }

    fn crl_extensions(&self, number: u64) -> Result<Vec<Extension>> {
        let crl_number = CrlNumber(Uint::new(&number.to_be_bytes())?);
        let mut extensions = vec![Extension {
            extn_id: ID_CE_CRL_NUMBER,
            critical: false,
            extn_value: OctetString::new(crl_number.to_der()?)?,
        }];

        if let Some(key_id) = self.ca.certificate().subject_key_id() {
            let aki = AuthorityKeyIdentifier {
                key_identifier: Some(OctetString::new(key_id.as_slice())?),
                authority_cert_issuer: None,
                authority_cert_serial_number: None,
            };
            extensions.push(Extension {
                extn_id: ID_CE_AUTHORITY_KEY_IDENTIFIER,
                critical: false,
                extn_value: OctetString::new(aki.to_der()?)?,
            });
        }
        Ok(extensions)
    }
}

/// The CRL Number of a PEM CRL, `None` when it carries no such extension.
pub fn crl_number(pem: &[u8]) -> Result<Option<u64>> {
    let parsed = pem::parse(pem)
        .map_err(|e| LifecycleError::Encoding(format!("CRL is not valid PEM: {}", e)))?;
    let crl = CertificateList::from_der(parsed.contents())?;
    let extensions = crl.tbs_cert_list.crl_extensions.unwrap_or_default();
    let Some(extension) = extensions.iter().find(|e| e.extn_id == ID_CE_CRL_NUMBER) else {
        return Ok(None);
    };
    let CrlNumber(number) = CrlNumber::from_der(extension.extn_value.as_bytes())?;
    let bytes = number.as_bytes();
    let significant = bytes.iter().skip_while(|b| **b == 0).count();
    if significant > 8 {
        return Err(LifecycleError::Encoding("CRL Number does not fit in 64 bits".into()));
    }
    Ok(Some(bytes.iter().fold(0u64, |n, b| (n << 8) | u64::from(*b))))
}

/// Generation time in seconds, or one past `previous` if that is not lower.
fn next_crl_number(now: OffsetDateTime, previous: Option<u64>) -> u64 {
    let from_clock = u64::try_from(now.unix_timestamp()).unwrap_or(0);
    match previous {
        Some(previous) => from_clock.max(previous.saturating_add(1)),
        None => from_clock,
    }
}

/// RFC 5280 time: UTCTime through 2049, GeneralizedTime from 2050 on.
fn x509_time(at: OffsetDateTime) -> Result<Time> {
    let secs = u64::try_from(at.unix_timestamp()).map_err(|_| {
        LifecycleError::Encoding(format!("time {} predates the Unix epoch", at))
    })?;
    let date_time = DateTime::from_unix_duration(StdDuration::from_secs(secs))?;
    if date_time.year() >= 2050 {
        Ok(Time::GeneralTime(GeneralizedTime::from_date_time(date_time)))
    } else {
        Ok(Time::UtcTime(UtcTime::from_date_time(date_time)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ca_store::CaStore;
    use crate::certificate_issuer::asn1_to_datetime;
    use crate::configs::AppConfig;
    use crate::serial::Serial;
    use openssl::x509::X509Crl;
    use std::collections::BTreeSet;
    use std::sync::Arc;
    use tempfile::TempDir;
    use time::macros::datetime;

    fn setup() -> (TempDir, Arc<CertificateAuthority>) {
        let dir = TempDir::new().unwrap();
        let config = AppConfig::with_root_dir(dir.path());
        let ca = CaStore::new(&config).ensure_ca().unwrap();
        (dir, ca)
    }

    fn crl_serials(crl: &X509Crl) -> BTreeSet<Serial> {
        crl.get_revoked()
            .map(|stack| {
                stack
                    .iter()
                    .map(|r| Serial::from_asn1(r.serial_number()).unwrap())
                    .collect()
            })
            .unwrap_or_default()
    }

    #[test]
    fn test_empty_ledger_yields_empty_crl() {
        let (dir, ca) = setup();
        let ledger = RevocationLedger::load(&dir.path().join("ledger.txt")).unwrap();
        let pem = CrlBuilder::new(&ca, 1)
            .build(&ledger, OffsetDateTime::now_utc())
            .unwrap();

        let crl = X509Crl::from_pem(&pem).unwrap();
        assert!(crl.verify(ca.private_key()).unwrap());
        assert!(crl_serials(&crl).is_empty());
        assert_eq!(
            crl.issuer_name().to_der().unwrap(),
            ca.certificate().subject_name().to_der().unwrap()
        );
    }

    #[test]
    fn test_crl_entries_match_ledger() {
        let (dir, ca) = setup();
        let mut ledger = RevocationLedger::load(&dir.path().join("ledger.txt")).unwrap();
        let revoked_at = datetime!(2026-02-01 12:00:00 UTC);
        for s in ["1", "128", "340282366920938463463374607431768211455"] {
            ledger.add(&s.parse().unwrap(), revoked_at).unwrap();
        }

        let path = dir.path().join("crl.pem");
        let pem = CrlBuilder::new(&ca, 1)
            .write(&ledger, OffsetDateTime::now_utc(), &path)
            .unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), pem);

        let crl = X509Crl::from_pem(&pem).unwrap();
        assert!(crl.verify(ca.private_key()).unwrap());
        assert_eq!(crl_serials(&crl), ledger.all());
        for revoked in crl.get_revoked().unwrap() {
            assert_eq!(
                asn1_to_datetime(revoked.revocation_date()).unwrap(),
                revoked_at
            );
        }
    }

    #[test]
    fn test_next_update_offset() {
        let (dir, ca) = setup();
        let ledger = RevocationLedger::load(&dir.path().join("ledger.txt")).unwrap();
        let now = datetime!(2026-05-05 05:05:05 UTC);
        let pem = CrlBuilder::new(&ca, 3).build(&ledger, now).unwrap();
        let crl = X509Crl::from_pem(&pem).unwrap();

        assert_eq!(asn1_to_datetime(crl.last_update()).unwrap(), now);
        assert_eq!(
            asn1_to_datetime(crl.next_update().unwrap()).unwrap(),
            now + Duration::days(3)
        );
    }

    #[test]
    fn test_crl_number_increases_within_one_second() {
        let (dir, ca) = setup();
        let mut ledger = RevocationLedger::load(&dir.path().join("ledger.txt")).unwrap();
        let path = dir.path().join("crl.pem");
        let now = datetime!(2026-03-03 03:03:03 UTC);
        let builder = CrlBuilder::new(&ca, 1);

        let first = builder.write(&ledger, now, &path).unwrap();
        ledger.add(&"42".parse().unwrap(), now).unwrap();
        let second = builder.write(&ledger, now, &path).unwrap();
        let third = builder.write(&ledger, now, &path).unwrap();

        let numbers: Vec<u64> = [first, second, third]
            .iter()
            .map(|pem| crl_number(pem).unwrap().unwrap())
            .collect();
        assert_eq!(numbers[0], now.unix_timestamp() as u64);
        assert!(numbers.windows(2).all(|w| w[0] < w[1]), "{:?}", numbers);
    }

    #[test]
    fn test_crl_number_follows_clock_when_ahead() {
        let (dir, ca) = setup();
        let ledger = RevocationLedger::load(&dir.path().join("ledger.txt")).unwrap();
        let path = dir.path().join("crl.pem");
        let builder = CrlBuilder::new(&ca, 1);

        let earlier = datetime!(2026-03-03 03:03:03 UTC);
        let later = earlier + Duration::hours(1);
        builder.write(&ledger, earlier, &path).unwrap();
        let pem = builder.write(&ledger, later, &path).unwrap();
        assert_eq!(crl_number(&pem).unwrap(), Some(later.unix_timestamp() as u64));
    }

    #[test]
    fn test_generalized_time_after_2049() {
        match x509_time(datetime!(2051-01-01 00:00:00 UTC)).unwrap() {
            Time::GeneralTime(_) => {}
            other => panic!("expected GeneralizedTime, got {:?}", other),
        }
        match x509_time(datetime!(2049-12-31 23:59:59 UTC)).unwrap() {
            Time::UtcTime(_) => {}
            other => panic!("expected UTCTime, got {:?}", other),
        }
    }
}
