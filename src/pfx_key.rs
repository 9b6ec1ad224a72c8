//! PKCS#12 export bundles.
//!
//! A bundle carries the client key, the client certificate and the CA
//! certificate as trust anchor, with the username as friendly name. Without
//! a passphrase the key and certificate bags are stored unencrypted (only
//! the MAC is keyed, with the empty password).

use openssl::nid::Nid;
use openssl::pkcs12::{ParsedPkcs12_2, Pkcs12};
use openssl::pkey::{PKeyRef, Private};
use openssl::stack::Stack;
use openssl::x509::{X509Ref, X509};

use crate::configs::Passphrase;
use crate::error::Result;

/// Build the DER-encoded bundle for `username`.
pub fn build_pfx(
    username: &str,
    key: &PKeyRef<Private>,
    cert: &X509Ref,
    ca_cert: &X509Ref,
    passphrase: Option<&Passphrase>,
) -> Result<Vec<u8>> {
    let mut ca_stack = Stack::new()?;
    ca_stack.push(ca_cert.to_owned())?;

    let mut builder = Pkcs12::builder();
    builder.name(username).pkey(key).cert(cert).ca(ca_stack);

    let password = match passphrase {
        Some(p) => p.expose(),
        None => {
            // -1 tells PKCS12_create to skip bag encryption entirely
            builder
                .key_algorithm(Nid::from_raw(-1))
                .cert_algorithm(Nid::from_raw(-1));
            ""
        }
    };

    let pkcs12 = builder.build2(password)?;
    Ok(pkcs12.to_der()?)
}

/// Parse a bundle produced by [`build_pfx`].
pub fn load_pfx(der: &[u8], passphrase: Option<&Passphrase>) -> Result<ParsedPkcs12_2> {
    let password = passphrase.map(Passphrase::expose).unwrap_or("");
    Ok(Pkcs12::from_der(der)?.parse2(password)?)
}

/// Trust anchors carried by a parsed bundle.
pub fn bundled_ca_certs(parsed: &ParsedPkcs12_2) -> Vec<X509> {
    parsed
        .ca
        .as_ref()
        .map(|stack| stack.iter().map(|c| c.to_owned()).collect())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generate_root_ca::RsaRootCABuilder;
    use crate::generate_user_keypair::RsaUserKeyPairBuilder;
    use openssl::pkey::PKey;

    fn material() -> (PKey<Private>, X509, PKey<Private>, X509) {
        let (ca_key, ca_cert) = RsaRootCABuilder::new()
            .subject_common_name("Bundle CA".to_string())
            .organization("Org".to_string())
            .locality("L".to_string())
            .state("S".to_string())
            .country("ES".to_string())
            .build()
            .unwrap();
        let (key, cert) = RsaUserKeyPairBuilder::new(&ca_key, &ca_cert)
            .subject_common_name("alice".to_string())
            .organization("Org".to_string())
            .locality("L".to_string())
            .state("S".to_string())
            .country("ES".to_string())
            .build()
            .unwrap();
        (ca_key, ca_cert, key, cert)
    }

    #[test]
    fn test_bundle_holds_leaf_key_and_anchor() {
        let (_, ca_cert, key, cert) = material();
        let der = build_pfx("alice", &key, &cert, &ca_cert, None).unwrap();

        let parsed = load_pfx(&der, None).unwrap();
        assert!(parsed.pkey.as_ref().unwrap().public_eq(&key));
        assert_eq!(
            parsed.cert.as_ref().unwrap().to_der().unwrap(),
            cert.to_der().unwrap()
        );
        let anchors = bundled_ca_certs(&parsed);
        assert_eq!(anchors.len(), 1);
        assert_eq!(anchors[0].to_der().unwrap(), ca_cert.to_der().unwrap());
    }

    #[test]
    fn test_protected_bundle_requires_passphrase() {
        let (_, ca_cert, key, cert) = material();
        let pass = Passphrase::new("bundle-pass");
        let der = build_pfx("alice", &key, &cert, &ca_cert, Some(&pass)).unwrap();

        assert!(load_pfx(&der, None).is_err());
        let parsed = load_pfx(&der, Some(&pass)).unwrap();
        assert!(parsed.pkey.is_some());
    }
}
