//! certward - Single-CA Client Certificate Lifecycle Manager
//!
//! Issues client-authentication certificates signed by one locally managed
//! Certificate Authority, revokes them, and publishes a Certificate
//! Revocation List (CRL) that always reflects the revocation ledger.
//!
//! # Overview
//!
//! ```text
//! CA (self-signed, created on first use)
//!   ├── client certificate  <username>.crt / .key / .pfx
//!   ├── client certificate  ...
//!   └── CRL                 crl.pem, rebuilt from revoked_serials.txt
//! ```
//!
//! Each username moves through `absent → active → revoked`; a renewal
//! replaces an active certificate in place and can revoke the one it
//! supersedes. Nothing is ever un-revoked.
//!
//! # Features
//!
//! - **One CA per deployment**: bootstrapped once, never silently replaced
//! - **One certificate per username**: a second issue is a `Conflict`
//! - **Durable, append-only ledger**: with original revocation times
//! - **Signed v2 CRL**: CRL Number and Authority Key Identifier extensions
//! - **Crash-safe writes**: every artifact is renamed into place atomically
//! - **Optional at-rest protection**: passphrase-encrypted keys and bundles
//!
//! # Quick Start
//!
//! ```bash
//! certward create alice
//! certward revoke alice
//! certward crl --output crl.pem
//! ```
//!
//! # As a Library
//!
//! ```no_run
//! use certward::{AppConfig, LifecycleManager};
//!
//! fn main() -> certward::Result<()> {
//!     let manager = LifecycleManager::new(AppConfig::with_root_dir("/srv/pki"))?;
//!
//!     let issued = manager.issue("alice")?;
//!     println!("alice: serial {} valid until {}", issued.serial, issued.not_after);
//!
//!     let renewed = manager.renew("alice", true)?;
//!     assert_eq!(renewed.old_serial_revoked, Some(issued.serial));
//!
//!     let crl_pem = manager.fetch_crl()?;
//!     std::fs::write("crl.pem", crl_pem).ok();
//!     Ok(())
//! }
//! ```
//!
//! # Module Overview
//!
//! - [`lifecycle`]: the facade (issue, revoke, renew, fetch CRL) and its locking
//! - [`ca_store`]: loads or bootstraps the CA
//! - [`certificate_issuer`]: client certificate, key and bundle for one username
//! - [`revocation_ledger`]: persisted set of revoked serials
//! - [`crl_builder`]: signed CRL derived from the CA and the ledger
//! - [`generate_root_ca`], [`generate_user_keypair`]: X.509 builders on top of OpenSSL
//! - [`pfx_key`], [`private_key_storage`]: PKCS#12 and PKCS#8 encoding
//! - [`storage`]: on-disk layout and atomic file primitives
//! - [`file_lock`]: advisory locks that serialize writers across processes
//! - [`configs`]: TOML configuration with `CERTWARD_*` overrides
//!
//! # Error Handling
//!
//! Every operation returns [`Result<T>`] with a [`LifecycleError`]. Front
//! ends map `Conflict` and `NotFound` to their own status codes and treat
//! everything else as a generic failure. Messages never contain key
//! material.
//!
//! # Logging
//!
//! The library emits `tracing` events (target `certward`) and leaves the
//! choice of subscriber to the binary.

pub mod ca_store;
pub mod certificate_issuer;
pub mod configs;
pub mod crl_builder;
pub mod error;
pub mod file_lock;
pub mod generate_root_ca;
pub mod generate_user_keypair;
pub mod lifecycle;
pub mod pfx_key;
pub mod private_key_storage;
pub mod revocation_ledger;
pub mod serial;
pub mod storage;

pub use ca_store::{CaStore, CertificateAuthority};
pub use certificate_issuer::{CertificateIssuer, CertificateRecord, IssuedCertificate};
pub use configs::{AppConfig, Passphrase};
pub use crl_builder::CrlBuilder;
pub use error::{LifecycleError, Result};
pub use lifecycle::{IdentityState, IdentityStatus, LifecycleManager, RevokedCertificate};
pub use revocation_ledger::{RevocationEntry, RevocationLedger};
pub use serial::Serial;
