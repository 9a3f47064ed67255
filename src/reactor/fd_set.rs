//! A thin safe layer over `select(2)` and its `fd_set` bitmaps.

use std::io;
use std::mem::MaybeUninit;
use std::os::fd::RawFd;
use std::time::Duration;

/// `select()` can only track descriptors below `FD_SETSIZE`
pub fn is_selectable(fd: RawFd) -> bool {
    fd >= 0 && (fd as usize) < libc::FD_SETSIZE as usize
}

pub struct FdSet(libc::fd_set);

impl FdSet {
    pub fn new() -> FdSet {
        let mut raw = MaybeUninit::<libc::fd_set>::uninit();
        unsafe {
            libc::FD_ZERO(raw.as_mut_ptr());
            FdSet(raw.assume_init())
        }
    }

    pub fn insert(&mut self, fd: RawFd) {
        assert!(is_selectable(fd));
        unsafe { libc::FD_SET(fd, &mut self.0) }
    }

    pub fn contains(&self, fd: RawFd) -> bool {
        is_selectable(fd) && unsafe { libc::FD_ISSET(fd, &self.0) }
    }

    fn as_mut_ptr(&mut self) -> *mut libc::fd_set {
        &mut self.0
    }
}

/// Waits up to `timeout` for any of the descriptors in the three sets to become ready. On return,
///  the sets contain only the ready descriptors.
pub fn select(nfds: RawFd, read: &mut FdSet, write: &mut FdSet, except: &mut FdSet, timeout: Duration) -> io::Result<usize> {
    let mut tv = libc::timeval {
        tv_sec: timeout.as_secs() as libc::time_t,
        tv_usec: timeout.subsec_micros() as libc::suseconds_t,
    };

    let rc = unsafe {
        libc::select(nfds, read.as_mut_ptr(), write.as_mut_ptr(), except.as_mut_ptr(), &mut tv)
    };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(rc as usize)
}
