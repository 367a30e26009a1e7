use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::Result;
use crate::filenames::lock_file_name;
use crate::Error;

/// Exclusive advisory lock on a database directory, taken through its
/// `LOCK` file.
///
/// The lock rides on the open file handle: the OS drops it when the
/// handle closes, so a crashed process never wedges the directory and no
/// unlock bookkeeping is needed. The file itself is left behind on
/// purpose; removing it would race a concurrent opener onto a fresh
/// inode that the dying process no longer holds locked.
pub struct DbLock {
    _file: File,
    path: PathBuf,
}

impl DbLock {
    /// Locks the database at `db_path`, creating its `LOCK` file if
    /// needed. Fails without blocking when another process holds the
    /// lock.
    pub fn acquire(db_path: &Path) -> Result<Self> {
        let path = lock_file_name(db_path);
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)
            .map_err(|e| Error::Io(format!("cannot open {}: {e}", path.display())))?;

        if let Err(e) = sys::lock_exclusive(&file) {
            return Err(Error::Io(format!(
                "database {} is locked by another process: {e}",
                db_path.display()
            )));
        }

        // Record the owner pid. Purely informational: it gives a human
        // something to check before deciding a LOCK file is stale.
        let _ = writeln!(file, "{}", std::process::id());
        let _ = file.flush();

        Ok(DbLock { _file: file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(unix)]
mod sys {
    use std::fs::File;
    use std::io;
    use std::os::unix::io::AsRawFd;

    /// Non-blocking exclusive `flock`; a held lock must fail the open,
    /// not stall it.
    pub fn lock_exclusive(file: &File) -> io::Result<()> {
        match unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) } {
            0 => Ok(()),
            _ => Err(io::Error::last_os_error()),
        }
    }
}

#[cfg(windows)]
mod sys {
    use std::fs::File;
    use std::io;
    use std::os::windows::io::AsRawHandle;

    use winapi::um::fileapi::LockFileEx;
    use winapi::um::minwinbase::OVERLAPPED;
    use winapi::um::winnt::{LOCKFILE_EXCLUSIVE_LOCK, LOCKFILE_FAIL_IMMEDIATELY};

    /// Immediate-failure exclusive range lock over the whole file.
    pub fn lock_exclusive(file: &File) -> io::Result<()> {
        let mut overlapped: OVERLAPPED = unsafe { std::mem::zeroed() };
        let ok = unsafe {
            LockFileEx(
                file.as_raw_handle() as *mut _,
                LOCKFILE_EXCLUSIVE_LOCK | LOCKFILE_FAIL_IMMEDIATELY,
                0,
                u32::MAX,
                u32::MAX,
                &mut overlapped,
            )
        };
        if ok == 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(())
        }
    }
}

#[cfg(not(any(unix, windows)))]
mod sys {
    use std::fs::File;
    use std::io;

    /// No advisory locking on this platform; single-process discipline is
    /// up to the embedder.
    pub fn lock_exclusive(_file: &File) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_acquire_writes_pid() {
        let dir = tempfile::tempdir().unwrap();
        let lock = DbLock::acquire(dir.path()).expect("failed to acquire lock");

        assert!(lock.path().exists());
        assert!(lock.path().ends_with("LOCK"));
        let content = fs::read_to_string(lock.path()).unwrap();
        assert!(content.contains(&std::process::id().to_string()));
    }

    #[test]
    fn test_second_acquire_fails() {
        let dir = tempfile::tempdir().unwrap();
        let _held = DbLock::acquire(dir.path()).expect("failed to acquire lock");

        match DbLock::acquire(dir.path()) {
            Err(Error::Io(msg)) => assert!(msg.contains("locked by another process")),
            Err(other) => panic!("expected Io error, got {other}"),
            Ok(_) => panic!("second acquire should not succeed"),
        }
    }

    #[test]
    fn test_released_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        {
            let lock = DbLock::acquire(dir.path()).expect("failed to acquire lock");
            assert!(lock.path().exists());
        }
        // The LOCK file remains, but the lock itself is gone.
        let _again = DbLock::acquire(dir.path()).expect("lock should be free after drop");
    }
}
