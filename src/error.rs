//! Error taxonomy for the certificate lifecycle.
//!
//! Every library operation returns [`Result<T>`]. Front ends map the variants
//! onto their own status codes:
//!
//! | Variant | HTTP-equivalent | CLI exit code |
//! |---|---|---|
//! | [`LifecycleError::Conflict`] | 409 | 3 |
//! | [`LifecycleError::NotFound`] | 404 | 4 |
//! | anything else | 500 | 2 |
//!
//! Messages carry usernames, serials and paths. They never carry key
//! material or passphrases.

use std::path::Path;

use thiserror::Error;

/// Errors produced by the CA store, issuer, ledger, CRL builder and manager.
#[derive(Error, Debug)]
pub enum LifecycleError {
    /// An active (or revoked, not yet cleaned up) certificate already exists
    /// for this identity.
    #[error("Certificate for user '{username}' {reason}")]
    Conflict { username: String, reason: String },

    /// No certificate is on file for this identity.
    #[error("Certificate for user '{username}' not found")]
    NotFound { username: String },

    /// Missing, partial or corrupt CA material, corrupt ledger, or an invalid
    /// configuration. Never retried.
    #[error("Fatal configuration error: {0}")]
    FatalConfig(String),

    /// Filesystem failure. The caller may retry; the manager does not.
    #[error("I/O error while {context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    /// Username rejected before any path was derived from it.
    #[error("Invalid identity: {0}")]
    InvalidIdentity(String),

    /// Failure inside OpenSSL (key generation, signing, PEM/PKCS#12 coding).
    #[error("Cryptographic operation failed: {0}")]
    Crypto(#[from] openssl::error::ErrorStack),

    /// DER encoding of the revocation list failed.
    #[error("Encoding error: {0}")]
    Encoding(String),
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, LifecycleError>;

impl LifecycleError {
    pub(crate) fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        LifecycleError::Io {
            context: context.into(),
            source,
        }
    }

    pub(crate) fn io_at(action: &str, path: &Path, source: std::io::Error) -> Self {
        Self::io(format!("{} {}", action, path.display()), source)
    }

    pub(crate) fn conflict(username: &str, reason: impl Into<String>) -> Self {
        LifecycleError::Conflict {
            username: username.to_string(),
            reason: reason.into(),
        }
    }

    pub(crate) fn not_found(username: &str) -> Self {
        LifecycleError::NotFound {
            username: username.to_string(),
        }
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, LifecycleError::Conflict { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, LifecycleError::NotFound { .. })
    }

    /// Process exit code for the CLI front end.
    pub fn exit_code(&self) -> i32 {
        match self {
            LifecycleError::Conflict { .. } => 3,
            LifecycleError::NotFound { .. } => 4,
            _ => 2,
        }
    }
}

impl From<der::Error> for LifecycleError {
    fn from(e: der::Error) -> Self {
        LifecycleError::Encoding(e.to_string())
    }
}
