//! Root CA Certificate Generation Module
//!
//! Builds the single self-signed certificate authority that signs every
//! client certificate and every CRL of a deployment.
//!
//! # Certificate Properties
//! - **Self-signed**: Issuer and subject are the same
//! - **Subject**: `C, ST, L, O, CN` from the configured subject fields
//! - **Key Usage** (critical): keyCertSign, cRLSign
//! - **Basic Constraints** (critical): CA=true, no path length limit
//! - **Key identifiers**: subjectKeyIdentifier, authorityKeyIdentifier
//! - **Signature**: SHA-256 with RSA
//!
//! # Example
//! ```rust,no_run
//! use certward::generate_root_ca::RsaRootCABuilder;
//! # fn example() -> certward::Result<()> {
//! let (ca_key, ca_cert) = RsaRootCABuilder::new()
//!     .subject_common_name("Example Root CA".to_string())
//!     .organization("Example Corporation".to_string())
//!     .locality("Girona".to_string())
//!     .state("Catalonia".to_string())
//!     .country("ES".to_string())
//!     .key_size(2048)
//!     .validity_days(3650)
//!     .build()?;
//! # Ok(())
//! # }
//! ```

use openssl::asn1::Asn1Time;
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkey::{PKey, Private};
use openssl::rsa::Rsa;
use openssl::x509::extension::{
    AuthorityKeyIdentifier, BasicConstraints, KeyUsage, SubjectKeyIdentifier,
};
use openssl::x509::{X509Name, X509};

use crate::error::Result;
use crate::serial::Serial;

pub(crate) const X509_VERSION_3: i32 = 2; // X509 version 3 is represented by 2
pub(crate) const RSA_KEY_SIZE_DEFAULT: u32 = 2048;

/// Generate an RSA key pair of `bits` (public exponent 65537).
pub(crate) fn generate_rsa_key(bits: u32) -> Result<PKey<Private>> {
    let rsa = Rsa::generate(bits)?;
    Ok(PKey::from_rsa(rsa)?)
}

/// Build an X.509 name from `(nid, value)` pairs, in order.
pub(crate) fn distinguished_name(entries: &[(Nid, &str)]) -> Result<X509Name> {
    let mut name_builder = X509Name::builder()?;
    for (nid, value) in entries {
        name_builder.append_entry_by_nid(*nid, value)?;
    }
    Ok(name_builder.build())
}

/// Builder for the self-signed CA key pair and certificate.
///
/// All distinguished name fields must be set before calling `build()`.
pub struct RsaRootCABuilder {
    subject_common_name: String,
    organization: String,
    locality: String,
    state: String,
    country: String,
    key_size: u32,
    validity_days: u32,
}

impl Default for RsaRootCABuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl RsaRootCABuilder {
    pub fn new() -> Self {
        Self {
            subject_common_name: String::new(),
            organization: String::new(),
            locality: String::new(),
            state: String::new(),
            country: String::new(),
            key_size: RSA_KEY_SIZE_DEFAULT,
            validity_days: 3650,
        }
    }

    /// Set the common name (CN) for the certificate
    pub fn subject_common_name(mut self, cn: String) -> Self {
        self.subject_common_name = cn;
        self
    }

    /// Set the organization (O) for the certificate
    pub fn organization(mut self, org: String) -> Self {
        self.organization = org;
        self
    }

    /// Set the locality (L) for the certificate
    pub fn locality(mut self, locality: String) -> Self {
        self.locality = locality;
        self
    }

    /// Set the state/province (ST) for the certificate
    pub fn state(mut self, state: String) -> Self {
        self.state = state;
        self
    }

    /// Set the country (C) for the certificate (2-letter ISO code)
    pub fn country(mut self, country: String) -> Self {
        self.country = country;
        self
    }

    /// RSA modulus size in bits
    pub fn key_size(mut self, bits: u32) -> Self {
        self.key_size = bits;
        self
    }

    /// Set validity period in days, starting now
    pub fn validity_days(mut self, days: u32) -> Self {
        self.validity_days = days;
        self
    }

    /// Generate the CA key pair and its self-signed certificate.
    ///
    /// # Returns
    /// * `Ok((PKey<Private>, X509))` - Tuple of (private key, self-signed certificate)
    ///
    /// # Errors
    /// Any failure inside OpenSSL: key generation, name or extension
    /// construction, signing.
    pub fn build(self) -> Result<(PKey<Private>, X509)> {
        let private_key = generate_rsa_key(self.key_size)?;

        let mut builder = X509::builder()?;
        builder.set_version(X509_VERSION_3)?;

        let serial = Serial::random()?;
        builder.set_serial_number(&*serial.to_asn1()?)?;

        let name = distinguished_name(&[
            (Nid::COUNTRYNAME, self.country.as_str()),
            (Nid::STATEORPROVINCENAME, self.state.as_str()),
            (Nid::LOCALITYNAME, self.locality.as_str()),
            (Nid::ORGANIZATIONNAME, self.organization.as_str()),
            (Nid::COMMONNAME, self.subject_common_name.as_str()),
        ])?;
        builder.set_subject_name(&name)?;
        builder.set_issuer_name(&name)?;

        let not_before = Asn1Time::days_from_now(0)?;
        builder.set_not_before(&not_before)?;
        let not_after = Asn1Time::days_from_now(self.validity_days)?;
        builder.set_not_after(&not_after)?;

        builder.set_pubkey(&private_key)?;

        // SKI must be present before AKI can reference it on a self-signed cert
        let ski = SubjectKeyIdentifier::new().build(&builder.x509v3_context(None, None))?;
        builder.append_extension(ski)?;
        let aki = AuthorityKeyIdentifier::new()
            .keyid(false)
            .build(&builder.x509v3_context(None, None))?;
        builder.append_extension(aki)?;

        builder.append_extension(BasicConstraints::new().critical().ca().build()?)?;
        builder.append_extension(
            KeyUsage::new()
                .critical()
                .key_cert_sign()
                .crl_sign()
                .build()?,
        )?;

        builder.sign(&private_key, MessageDigest::sha256())?;
        Ok((private_key, builder.build()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build_test_ca() -> (PKey<Private>, X509) {
        RsaRootCABuilder::new()
            .subject_common_name("Test Root CA".to_string())
            .organization("Test Org".to_string())
            .locality("Girona".to_string())
            .state("Catalonia".to_string())
            .country("ES".to_string())
            .validity_days(30)
            .build()
            .unwrap()
    }

    #[test]
    fn test_ca_is_self_signed() {
        let (key, cert) = build_test_ca();
        assert!(cert.verify(&key).unwrap());
        assert_eq!(
            cert.subject_name().to_der().unwrap(),
            cert.issuer_name().to_der().unwrap()
        );
        assert!(cert.public_key().unwrap().public_eq(&key));
    }

    #[test]
    fn test_ca_subject_fields() {
        let (_, cert) = build_test_ca();
        let entry = cert
            .subject_name()
            .entries_by_nid(Nid::COMMONNAME)
            .next()
            .unwrap();
        let cn = std::str::from_utf8(entry.data().as_slice()).unwrap();
        assert_eq!(cn, "Test Root CA");
        assert!(cert.subject_key_id().is_some());
    }

    #[test]
    fn test_ca_validity_window() {
        let (_, cert) = build_test_ca();
        let diff = cert.not_before().diff(cert.not_after()).unwrap();
        assert_eq!(diff.days, 30);
    }

    #[test]
    fn test_ca_key_size() {
        let (key, _) = RsaRootCABuilder::new()
            .subject_common_name("Sized CA".to_string())
            .organization("Org".to_string())
            .locality("L".to_string())
            .state("S".to_string())
            .country("ES".to_string())
            .key_size(3072)
            .build()
            .unwrap();
        assert_eq!(key.bits(), 3072);
    }
}
