//! Persisted layout and file primitives.
//!
//! ```text
//! <ca_dir>/ca.crt                  CA certificate (PEM)
//! <ca_dir>/ca.key                  CA private key (PKCS#8 PEM)
//! <ca_dir>/crl.pem                 current CRL (PEM)
//! <ca_dir>/revoked_serials.txt     revocation ledger
//! <crts_dir>/<username>.crt        leaf certificate (PEM)
//! <private_dir>/<username>.key     leaf private key (PKCS#8 PEM)
//! <clients_dir>/<username>.pfx     PKCS#12 export bundle
//! ```
//!
//! Every write goes through a temporary file in the destination directory
//! followed by a rename, so readers never observe a half-written artifact.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;

use crate::configs::StorageSettings;
use crate::error::{LifecycleError, Result};

const CA_CERT_FILE: &str = "ca.crt";
const CA_KEY_FILE: &str = "ca.key";
const CRL_FILE: &str = "crl.pem";
const LEDGER_FILE: &str = "revoked_serials.txt";

/// Who may read a file once it is in place (0644 or 0600 on Unix).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visibility {
    Public,
    /// Owner read/write only (0600 on Unix).
    Private,
}

#[derive(Debug, Clone)]
pub struct StorageLayout {
    ca_dir: PathBuf,
    crts_dir: PathBuf,
    private_dir: PathBuf,
    clients_dir: PathBuf,
}

impl StorageLayout {
    pub fn from_settings(settings: &StorageSettings) -> Self {
        Self {
            ca_dir: settings.ca_dir(),
            crts_dir: settings.crts_dir(),
            private_dir: settings.private_dir(),
            clients_dir: settings.clients_dir(),
        }
    }

    /// Create every directory of the layout if missing.
    pub fn ensure_dirs(&self) -> Result<()> {
        for dir in [
            &self.ca_dir,
            &self.crts_dir,
            &self.private_dir,
            &self.clients_dir,
        ] {
            fs::create_dir_all(dir)
                .map_err(|e| LifecycleError::io_at("creating directory", dir, e))?;
        }
        Ok(())
    }

    pub fn ca_cert_path(&self) -> PathBuf {
        self.ca_dir.join(CA_CERT_FILE)
    }

    pub fn ca_key_path(&self) -> PathBuf {
        self.ca_dir.join(CA_KEY_FILE)
    }

    pub fn crl_path(&self) -> PathBuf {
        self.ca_dir.join(CRL_FILE)
    }

    pub fn ledger_path(&self) -> PathBuf {
        self.ca_dir.join(LEDGER_FILE)
    }

    /// Callers must have validated `username` first.
    pub fn cert_path(&self, username: &str) -> PathBuf {
        self.crts_dir.join(format!("{}.crt", username))
    }

    pub fn key_path(&self, username: &str) -> PathBuf {
        self.private_dir.join(format!("{}.key", username))
    }

    pub fn bundle_path(&self, username: &str) -> PathBuf {
        self.clients_dir.join(format!("{}.pfx", username))
    }
}

/// A fully written temporary file waiting to be renamed onto its target.
pub struct StagedFile {
    temp: NamedTempFile,
    target: PathBuf,
}

impl StagedFile {
    /// Write `contents` to a temporary file next to `target` and fsync it.
    pub fn stage(target: &Path, contents: &[u8], visibility: Visibility) -> Result<Self> {
        let dir = target
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let mut temp = NamedTempFile::new_in(dir)
            .map_err(|e| LifecycleError::io_at("creating temporary file in", dir, e))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            // tempfile creates 0600; public artifacts must stay world-readable
            let mode = match visibility {
                Visibility::Private => 0o600,
                Visibility::Public => 0o644,
            };
            temp.as_file()
                .set_permissions(fs::Permissions::from_mode(mode))
                .map_err(|e| LifecycleError::io_at("setting permissions for", target, e))?;
        }
        #[cfg(not(unix))]
        let _ = visibility;

        temp.write_all(contents)
            .and_then(|_| temp.as_file().sync_all())
            .map_err(|e| LifecycleError::io_at("writing staged copy of", target, e))?;

        Ok(Self {
            temp,
            target: target.to_path_buf(),
        })
    }

    pub fn target(&self) -> &Path {
        &self.target
    }

    /// Atomically replace the target.
    pub fn commit(self) -> Result<()> {
        let target = self.target;
        self.temp
            .persist(&target)
            .map_err(|e| LifecycleError::io_at("moving into place", &target, e.error))?;
        Ok(())
    }

    /// Move into place only if the target does not exist yet. Fails with
    /// `ErrorKind::AlreadyExists` otherwise.
    pub fn commit_new(self) -> Result<()> {
        let target = self.target;
        self.temp
            .persist_noclobber(&target)
            .map_err(|e| LifecycleError::io_at("creating", &target, e.error))?;
        Ok(())
    }
}

/// Stage and commit in one step.
pub fn write_atomic(target: &Path, contents: &[u8], visibility: Visibility) -> Result<()> {
    StagedFile::stage(target, contents, visibility)?.commit()
}

/// Read a file, mapping "not found" to `None`.
pub fn read_optional(path: &Path) -> Result<Option<Vec<u8>>> {
    match fs::read(path) {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(LifecycleError::io_at("reading", path, e)),
    }
}

pub fn read_required(path: &Path) -> Result<Vec<u8>> {
    fs::read(path).map_err(|e| LifecycleError::io_at("reading", path, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn layout(dir: &TempDir) -> StorageLayout {
        StorageLayout::from_settings(&StorageSettings::rooted_at(dir.path()))
    }

    #[test]
    fn test_layout_paths() {
        let dir = TempDir::new().unwrap();
        let layout = layout(&dir);
        assert_eq!(layout.ca_cert_path(), dir.path().join("ca/ca.crt"));
        assert_eq!(layout.ledger_path(), dir.path().join("ca/revoked_serials.txt"));
        assert_eq!(layout.cert_path("alice"), dir.path().join("crts/alice.crt"));
        assert_eq!(layout.key_path("alice"), dir.path().join("private/alice.key"));
        assert_eq!(layout.bundle_path("alice"), dir.path().join("clients/alice.pfx"));
    }

    #[test]
    fn test_write_atomic_replaces_contents() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("file.txt");
        write_atomic(&path, b"first", Visibility::Public).unwrap();
        write_atomic(&path, b"second", Visibility::Public).unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"second");
        // no temporary files left behind
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn test_commit_new_refuses_to_clobber() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ca.key");
        StagedFile::stage(&path, b"one", Visibility::Private)
            .unwrap()
            .commit_new()
            .unwrap();
        let err = StagedFile::stage(&path, b"two", Visibility::Private)
            .unwrap()
            .commit_new()
            .unwrap_err();
        match err {
            LifecycleError::Io { source, .. } => {
                assert_eq!(source.kind(), io::ErrorKind::AlreadyExists)
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(fs::read(&path).unwrap(), b"one");
    }

    #[cfg(unix)]
    #[test]
    fn test_private_files_are_owner_only() {
        use std::os::unix::fs::PermissionsExt;
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("secret.key");
        write_atomic(&path, b"key", Visibility::Private).unwrap();
        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn test_read_optional_missing_is_none() {
        let dir = TempDir::new().unwrap();
        assert!(read_optional(&dir.path().join("absent")).unwrap().is_none());
    }
}
