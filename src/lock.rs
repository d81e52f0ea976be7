use std::fs::{File, OpenOptions};
use std::path::Path;

use crate::Result;

/// An exclusive advisory lock on a sidecar file, released on drop.
///
/// Serializes read-modify-write cycles on shared files across processes.
pub(crate) struct FileLock {
    _file: File,
}

impl FileLock {
    /// Blocks until the lock is held.
    pub(crate) fn exclusive(path: &Path) -> Result<FileLock> {
        let file = open(path)?;
        flock(&file, false)?;
        Ok(FileLock { _file: file })
    }

    /// Returns `None` when another handle holds the lock.
    pub(crate) fn try_exclusive(path: &Path) -> Result<Option<FileLock>> {
        let file = open(path)?;
        if flock(&file, true)? {
            Ok(Some(FileLock { _file: file }))
        } else {
            Ok(None)
        }
    }
}

fn open(path: &Path) -> Result<File> {
    Ok(OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)?)
}

#[cfg(unix)]
fn flock(file: &File, nonblocking: bool) -> Result<bool> {
    use std::os::unix::io::AsRawFd;

    let mut op = libc::LOCK_EX;
    if nonblocking {
        op |= libc::LOCK_NB;
    }
    loop {
        let res = unsafe { libc::flock(file.as_raw_fd(), op) };
        if res == 0 {
            return Ok(true);
        }
        let err = std::io::Error::last_os_error();
        match err.kind() {
            std::io::ErrorKind::WouldBlock => return Ok(false),
            std::io::ErrorKind::Interrupted => continue,
            _ => return Err(err.into()),
        }
    }
}

#[cfg(not(unix))]
fn flock(_file: &File, _nonblocking: bool) -> Result<bool> {
    Ok(true)
}
