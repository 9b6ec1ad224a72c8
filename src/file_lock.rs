//! Advisory file locks shared by every process working on one storage root.
//!
//! A [`FileLock`] holds an exclusive lock on a `<target>.lock` sentinel next
//! to the file it protects, taken with `flock(2)` on Unix and `LockFileEx`
//! on Windows. Locks belong to the open file, so two handles opened by the
//! same process exclude each other just like two processes do. The lock is
//! released when the guard is dropped; sentinels are left in place.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use crate::error::{LifecycleError, Result};

/// RAII guard over an exclusive advisory lock.
#[derive(Debug)]
pub struct FileLock {
    file: File,
    path: PathBuf,
}

impl FileLock {
    /// Block until the lock guarding `target` is ours.
    pub fn acquire(target: &Path) -> Result<Self> {
        let path = lock_path_for(target);
        let file = open_sentinel(&path)?;
        lock_exclusive(&file).map_err(|e| LifecycleError::io_at("locking", &path, e))?;
        Ok(Self { file, path })
    }

    /// Take the lock only if nobody holds it right now.
    pub fn try_acquire(target: &Path) -> Result<Option<Self>> {
        let path = lock_path_for(target);
        let file = open_sentinel(&path)?;
        match try_lock_exclusive(&file) {
            Ok(true) => Ok(Some(Self { file, path })),
            Ok(false) => Ok(None),
            Err(e) => Err(LifecycleError::io_at("locking", &path, e)),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        unlock(&self.file);
    }
}

fn lock_path_for(target: &Path) -> PathBuf {
    let mut lock = target.as_os_str().to_os_string();
    lock.push(".lock");
    lock.into()
}

fn open_sentinel(path: &Path) -> Result<File> {
    // never truncate: another holder may have it open
    OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(false)
        .open(path)
        .map_err(|e| LifecycleError::io_at("opening lock file", path, e))
}

#[cfg(unix)]
fn lock_exclusive(file: &File) -> io::Result<()> {
    use std::os::unix::io::AsRawFd;
    loop {
        let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX) };
        if rc == 0 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

#[cfg(unix)]
fn try_lock_exclusive(file: &File) -> io::Result<bool> {
    use std::os::unix::io::AsRawFd;
    let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
    if rc == 0 {
        return Ok(true);
    }
    let err = io::Error::last_os_error();
    if err.kind() == io::ErrorKind::WouldBlock {
        Ok(false)
    } else {
        Err(err)
    }
}

#[cfg(unix)]
fn unlock(file: &File) {
    use std::os::unix::io::AsRawFd;
    unsafe {
        libc::flock(file.as_raw_fd(), libc::LOCK_UN);
    }
}

#[cfg(windows)]
fn whole_file() -> windows_sys::Win32::System::IO::OVERLAPPED {
    // offset 0; the range length is passed to LockFileEx separately
    unsafe { std::mem::zeroed() }
}

#[cfg(windows)]
fn lock_with_flags(file: &File, flags: u32) -> i32 {
    use std::os::windows::io::AsRawHandle;
    use windows_sys::Win32::Storage::FileSystem::LockFileEx;
    let handle = file.as_raw_handle() as windows_sys::Win32::Foundation::HANDLE;
    let mut overlapped = whole_file();
    unsafe { LockFileEx(handle, flags, 0, u32::MAX, u32::MAX, &mut overlapped) }
}

#[cfg(windows)]
fn lock_exclusive(file: &File) -> io::Result<()> {
    use windows_sys::Win32::Storage::FileSystem::LOCKFILE_EXCLUSIVE_LOCK;
    if lock_with_flags(file, LOCKFILE_EXCLUSIVE_LOCK) == 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

#[cfg(windows)]
fn try_lock_exclusive(file: &File) -> io::Result<bool> {
    use windows_sys::Win32::Foundation::{ERROR_LOCK_VIOLATION, ERROR_SHARING_VIOLATION};
    use windows_sys::Win32::Storage::FileSystem::{
        LOCKFILE_EXCLUSIVE_LOCK, LOCKFILE_FAIL_IMMEDIATELY,
    };
    if lock_with_flags(file, LOCKFILE_EXCLUSIVE_LOCK | LOCKFILE_FAIL_IMMEDIATELY) != 0 {
        return Ok(true);
    }
    let err = io::Error::last_os_error();
    match err.raw_os_error() {
        Some(code)
            if code == ERROR_LOCK_VIOLATION as i32 || code == ERROR_SHARING_VIOLATION as i32 =>
        {
            Ok(false)
        }
        _ => Err(err),
    }
}

#[cfg(windows)]
fn unlock(file: &File) {
    use std::os::windows::io::AsRawHandle;
    use windows_sys::Win32::Storage::FileSystem::UnlockFileEx;
    let handle = file.as_raw_handle() as windows_sys::Win32::Foundation::HANDLE;
    let mut overlapped = whole_file();
    unsafe {
        let _ = UnlockFileEx(handle, 0, u32::MAX, u32::MAX, &mut overlapped);
    }
}

#[cfg(all(not(unix), not(windows)))]
fn lock_exclusive(_file: &File) -> io::Result<()> {
    Ok(())
}

#[cfg(all(not(unix), not(windows)))]
fn try_lock_exclusive(_file: &File) -> io::Result<bool> {
    Ok(true)
}

#[cfg(all(not(unix), not(windows)))]
fn unlock(_file: &File) {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;
    use tempfile::TempDir;

    #[test]
    fn test_sentinel_sits_next_to_target() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("revoked_serials.txt");
        let lock = FileLock::acquire(&target).unwrap();
        assert_eq!(lock.path(), dir.path().join("revoked_serials.txt.lock"));
        assert!(lock.path().exists());
        // the target itself is never created
        assert!(!target.exists());
    }

    #[cfg(any(unix, windows))]
    #[test]
    fn test_second_handle_is_excluded_until_drop() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("alice.crt");
        {
            let _held = FileLock::acquire(&target).unwrap();
            assert!(FileLock::try_acquire(&target).unwrap().is_none());
        }
        assert!(FileLock::try_acquire(&target).unwrap().is_some());
    }

    #[cfg(any(unix, windows))]
    #[test]
    fn test_acquire_blocks_while_held() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("crl.pem");
        let held = FileLock::acquire(&target).unwrap();

        let (tx, rx) = mpsc::channel();
        let waiter = {
            let target = target.clone();
            thread::spawn(move || {
                let _lock = FileLock::acquire(&target).unwrap();
                tx.send(()).unwrap();
            })
        };
        assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
        drop(held);
        rx.recv_timeout(Duration::from_secs(10)).unwrap();
        waiter.join().unwrap();
    }
}
