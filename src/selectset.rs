//! Thin safe wrapper around POSIX `fd_set`, so the public readiness API
//! (`prepare_readiness`/`drive_readiness`, see `SPEC_FULL.md` §4.1/§6) can be
//! composed directly into a caller's own `select(2)` loop instead of hiding
//! behind an opaque event-loop token.

use std::{mem::MaybeUninit, os::unix::io::RawFd};

/// A `fd_set` a caller passes into [`crate::Coremodel::prepare_readiness`]
/// and [`crate::Coremodel::drive_readiness`].
pub struct FdSet(libc::fd_set);

impl Default for FdSet {
    fn default() -> Self {
        Self::empty()
    }
}

impl FdSet {
    #[must_use]
    pub fn empty() -> Self {
        unsafe {
            let mut raw = MaybeUninit::<libc::fd_set>::uninit();
            libc::FD_ZERO(raw.as_mut_ptr());
            Self(raw.assume_init())
        }
    }

    pub fn clear(&mut self) {
        unsafe { libc::FD_ZERO(&mut self.0) }
    }

    pub fn set(&mut self, fd: RawFd) {
        unsafe { libc::FD_SET(fd, &mut self.0) }
    }

    pub fn unset(&mut self, fd: RawFd) {
        unsafe { libc::FD_CLR(fd, &mut self.0) }
    }

    #[must_use]
    pub fn is_set(&self, fd: RawFd) -> bool {
        unsafe { libc::FD_ISSET(fd, &self.0) }
    }

    pub fn as_raw_mut(&mut self) -> *mut libc::fd_set {
        &mut self.0
    }
}
