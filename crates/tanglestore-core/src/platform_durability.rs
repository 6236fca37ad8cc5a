//! Durable sync primitives
//!
//! `KvStore::flush` promises that earlier writes survive power loss, which
//! plain `File::sync_data` does not guarantee everywhere. These helpers map
//! to the strongest primitive of each platform.

use std::fs::File;
use std::io;
use std::path::Path;

/// Block until `file`'s data reaches persistent media.
///
/// - Linux: `fdatasync`, data without metadata
/// - macOS/iOS: `fcntl(F_FULLFSYNC)`, plain fsync stops at the drive cache there
/// - Windows: `FlushFileBuffers`
/// - Elsewhere: `File::sync_data`
///
/// May block for a long time under heavy I/O. Callers must not hold locks
/// that other threads need to make progress.
pub fn durable_sync(file: &File) -> io::Result<()> {
    #[cfg(target_os = "linux")]
    {
        use std::os::unix::io::AsRawFd;
        // SAFETY: the fd comes from a live `File`, so it is open for the whole call.
        let rc = unsafe { libc::fdatasync(file.as_raw_fd()) };
        if rc == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }

    #[cfg(any(target_os = "macos", target_os = "ios"))]
    {
        use std::os::unix::io::AsRawFd;
        // SAFETY: the fd comes from a live `File`, so it is open for the whole call.
        let rc = unsafe { libc::fcntl(file.as_raw_fd(), libc::F_FULLFSYNC) };
        if rc == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }

    #[cfg(target_os = "windows")]
    {
        use std::os::windows::io::AsRawHandle;
        use winapi::um::fileapi::FlushFileBuffers;
        // SAFETY: the handle comes from a live `File`.
        let ok = unsafe { FlushFileBuffers(file.as_raw_handle() as *mut _) };
        if ok != 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }

    #[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "ios", target_os = "windows")))]
    {
        file.sync_data()
    }
}

/// Persist directory entries (creations, renames, removals) inside `dir`.
///
/// Needed after installing a WAL checkpoint, otherwise the rename itself
/// can be lost. A no-op on Windows, where directories cannot be opened
/// as files.
pub fn sync_directory(dir: &Path) -> io::Result<()> {
    #[cfg(unix)]
    {
        File::open(dir)?.sync_all()
    }

    #[cfg(not(unix))]
    {
        let _ = dir;
        Ok(())
    }
}
