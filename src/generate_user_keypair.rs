//! Client Certificate Generation Module
//!
//! Builds end-entity certificates for client (TLS) authentication, signed
//! directly by the deployment's CA.
//!
//! # Certificate Properties
//! - **Subject**: `C, ST, L, O` from configuration, `CN` = username
//! - **Issuer**: the CA subject
//! - **Key Usage** (critical): digitalSignature, keyEncipherment
//! - **Extended Key Usage** (critical): clientAuth
//! - **Basic Constraints** (critical): CA=false
//! - **Key identifiers**: subjectKeyIdentifier, authorityKeyIdentifier
//! - **Signature**: SHA-256 with RSA
//!
//! # Example
//! ```rust,no_run
//! # use certward::generate_user_keypair::RsaUserKeyPairBuilder;
//! # use certward::serial::Serial;
//! # use openssl::pkey::{PKey, Private};
//! # use openssl::x509::X509;
//! # fn example(ca_key: &PKey<Private>, ca_cert: &X509) -> certward::Result<()> {
//! let (user_key, user_cert) = RsaUserKeyPairBuilder::new(ca_key, ca_cert)
//!     .subject_common_name("alice".to_string())
//!     .organization("Example Corp".to_string())
//!     .locality("Girona".to_string())
//!     .state("Catalonia".to_string())
//!     .country("ES".to_string())
//!     .serial(Serial::random()?)
//!     .validity_days(365)
//!     .build()?;
//! # Ok(())
//! # }
//! ```

use openssl::asn1::Asn1Time;
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkey::{PKey, PKeyRef, Private};
use openssl::x509::extension::{
    AuthorityKeyIdentifier, BasicConstraints, ExtendedKeyUsage, KeyUsage, SubjectKeyIdentifier,
};
use openssl::x509::{X509Ref, X509};

use crate::error::Result;
use crate::generate_root_ca::{
    distinguished_name, generate_rsa_key, RSA_KEY_SIZE_DEFAULT, X509_VERSION_3,
};
use crate::serial::Serial;

/// Builder for a client key pair and its CA-signed certificate.
///
/// Borrows the CA key only for the duration of `build()`.
pub struct RsaUserKeyPairBuilder<'a> {
    subject_common_name: String,
    organization: String,
    locality: String,
    state: String,
    country: String,
    key_size: u32,
    validity_days: u32,
    serial: Option<Serial>,
    signing_key: &'a PKeyRef<Private>,
    signing_cert: &'a X509Ref,
}

impl<'a> RsaUserKeyPairBuilder<'a> {
    /// # Arguments
    /// * `ca_key` - CA private key used to sign the certificate
    /// * `ca_cert` - CA certificate (issuer name and key identifier)
    pub fn new(ca_key: &'a PKeyRef<Private>, ca_cert: &'a X509Ref) -> Self {
        Self {
            subject_common_name: String::new(),
            organization: String::new(),
            locality: String::new(),
            state: String::new(),
            country: String::new(),
            key_size: RSA_KEY_SIZE_DEFAULT,
            validity_days: 365,
            serial: None,
            signing_key: ca_key,
            signing_cert: ca_cert,
        }
    }

    /// Set the common name (CN); for client certificates this is the username
    pub fn subject_common_name(mut self, cn: String) -> Self {
        self.subject_common_name = cn;
        self
    }

    pub fn organization(mut self, org: String) -> Self {
        self.organization = org;
        self
    }

    pub fn locality(mut self, locality: String) -> Self {
        self.locality = locality;
        self
    }

    pub fn state(mut self, state: String) -> Self {
        self.state = state;
        self
    }

    pub fn country(mut self, country: String) -> Self {
        self.country = country;
        self
    }

    pub fn key_size(mut self, bits: u32) -> Self {
        self.key_size = bits;
        self
    }

    /// Set validity period in days (default: 365)
    pub fn validity_days(mut self, days: u32) -> Self {
        self.validity_days = days;
        self
    }

    /// Use a caller-chosen serial instead of drawing a random one.
    pub fn serial(mut self, serial: Serial) -> Self {
        self.serial = Some(serial);
        self
    }

    /// Generate the client key pair and the CA-signed certificate.
    ///
    /// # Returns
    /// * `Ok((PKey<Private>, X509))` - Tuple of (private key, signed certificate)
    pub fn build(self) -> Result<(PKey<Private>, X509)> {
        let private_key = generate_rsa_key(self.key_size)?;

        let mut builder = X509::builder()?;
        builder.set_version(X509_VERSION_3)?;

        let serial = match self.serial {
            Some(serial) => serial,
            None => Serial::random()?,
        };
        builder.set_serial_number(&*serial.to_asn1()?)?;

        let subject_name = distinguished_name(&[
            (Nid::COUNTRYNAME, self.country.as_str()),
            (Nid::STATEORPROVINCENAME, self.state.as_str()),
            (Nid::LOCALITYNAME, self.locality.as_str()),
            (Nid::ORGANIZATIONNAME, self.organization.as_str()),
            (Nid::COMMONNAME, self.subject_common_name.as_str()),
        ])?;
        builder.set_subject_name(&subject_name)?;
        builder.set_issuer_name(self.signing_cert.subject_name())?;

        let not_before = Asn1Time::days_from_now(0)?;
        builder.set_not_before(&not_before)?;
        let not_after = Asn1Time::days_from_now(self.validity_days)?;
        builder.set_not_after(&not_after)?;

        builder.set_pubkey(&private_key)?;

        let ski = SubjectKeyIdentifier::new()
            .build(&builder.x509v3_context(Some(self.signing_cert), None))?;
        builder.append_extension(ski)?;
        let aki = AuthorityKeyIdentifier::new()
            .keyid(true)
            .build(&builder.x509v3_context(Some(self.signing_cert), None))?;
        builder.append_extension(aki)?;

        // No .ca() call - this is an end-entity certificate
        builder.append_extension(BasicConstraints::new().critical().build()?)?;
        builder.append_extension(
            KeyUsage::new()
                .critical()
                .digital_signature()
                .key_encipherment()
                .build()?,
        )?;
        builder.append_extension(ExtendedKeyUsage::new().critical().client_auth().build()?)?;

        builder.sign(self.signing_key, MessageDigest::sha256())?;
        Ok((private_key, builder.build()))
    }
}
