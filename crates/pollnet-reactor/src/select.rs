//! Thin wrapper over `select(2)`.

use std::io;
use std::mem::MaybeUninit;
use std::os::unix::io::RawFd;
use std::time::Duration;

/// Largest descriptor value (exclusive) an `fd_set` can hold.
pub const FD_SETSIZE: usize = libc::FD_SETSIZE as usize;

pub(crate) struct FdSet(libc::fd_set);

impl FdSet {
    pub(crate) fn new() -> Self {
        let mut raw = MaybeUninit::<libc::fd_set>::uninit();
        // SAFETY: FD_ZERO initialises every byte of the set.
        unsafe {
            libc::FD_ZERO(raw.as_mut_ptr());
            FdSet(raw.assume_init())
        }
    }

    /// Callers must keep `fd` in `0..FD_SETSIZE`.
    pub(crate) fn insert(&mut self, fd: RawFd) {
        debug_assert!(fd >= 0 && (fd as usize) < FD_SETSIZE);
        // SAFETY: fd is within the bitmap.
        unsafe { libc::FD_SET(fd, &mut self.0) }
    }

    pub(crate) fn contains(&self, fd: RawFd) -> bool {
        if fd < 0 || fd as usize >= FD_SETSIZE {
            return false;
        }
        // SAFETY: fd is within the bitmap.
        unsafe { libc::FD_ISSET(fd, &self.0) }
    }
}

/// Block until a descriptor in the three sets is ready or `timeout` passes.
///
/// Returns the number of ready descriptors; the sets are rewritten in place
/// to hold only the ready ones.
pub(crate) fn select(
    nfds: RawFd,
    read: &mut FdSet,
    write: &mut FdSet,
    error: &mut FdSet,
    timeout: Duration,
) -> io::Result<usize> {
    let mut tv = libc::timeval {
        tv_sec: timeout.as_secs() as libc::time_t,
        tv_usec: timeout.subsec_micros() as libc::suseconds_t,
    };
    // SAFETY: all pointers are valid for the duration of the call.
    let n = unsafe { libc::select(nfds, &mut read.0, &mut write.0, &mut error.0, &mut tv) };
    if n < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(n as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::unix::io::AsRawFd;
    use std::os::unix::net::UnixStream;

    #[test]
    fn test_fd_set_membership() {
        let mut set = FdSet::new();
        assert!(!set.contains(3));
        set.insert(3);
        set.insert(9);
        assert!(set.contains(3));
        assert!(set.contains(9));
        assert!(!set.contains(4));
        assert!(!set.contains(-1));
    }

    #[test]
    fn test_select_reports_readable() {
        let (mut a, b) = UnixStream::pair().unwrap();
        let fd = b.as_raw_fd();

        let mut read = FdSet::new();
        let mut write = FdSet::new();
        let mut error = FdSet::new();
        read.insert(fd);
        let n = select(fd + 1, &mut read, &mut write, &mut error, Duration::ZERO).unwrap();
        assert_eq!(n, 0);

        a.write_all(b"x").unwrap();
        let mut read = FdSet::new();
        read.insert(fd);
        let n = select(
            fd + 1,
            &mut read,
            &mut write,
            &mut error,
            Duration::from_millis(500),
        )
        .unwrap();
        assert_eq!(n, 1);
        assert!(read.contains(fd));
    }
}
