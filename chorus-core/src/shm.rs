//! Anonymous shared-memory regions passed to clients by descriptor.

use std::ffi::{c_void, CString};
use std::num::NonZeroUsize;
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};
use std::ptr::NonNull;

use nix::sys::memfd::{memfd_create, MemFdCreateFlag};
use nix::sys::mman::{mmap, munmap, MapFlags, ProtFlags};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ShmError {
    #[error("zero-length region")]
    EmptyRegion,
    #[error("creating shared memory region: {0}")]
    Create(nix::Error),
    #[error("sizing shared memory region: {0}")]
    Truncate(nix::Error),
    #[error("mapping shared memory region: {0}")]
    Map(nix::Error),
}

/// A memfd-backed mapping. The descriptor stays open for the lifetime of the
/// region so it can be handed to a client at any point; mapping and fd are
/// both released on drop.
pub struct ShmRegion {
    fd: OwnedFd,
    ptr: NonNull<c_void>,
    len: usize,
}

// The region is plain bytes; concurrent access discipline is up to the
// structures layered on top of it.
unsafe impl Send for ShmRegion {}
unsafe impl Sync for ShmRegion {}

impl ShmRegion {
    pub fn anonymous(name: &str, len: usize) -> Result<ShmRegion, ShmError> {
        let cname = CString::new(name).expect("nul byte in shm region name");
        let fd = memfd_create(cname.as_c_str(), MemFdCreateFlag::MFD_CLOEXEC).map_err(ShmError::Create)?;
        nix::unistd::ftruncate(&fd, len as i64).map_err(ShmError::Truncate)?;
        Self::map(fd, len)
    }

    /// Map a region received from a peer.
    pub fn from_fd(fd: OwnedFd, len: usize) -> Result<ShmRegion, ShmError> {
        Self::map(fd, len)
    }

    fn map(fd: OwnedFd, len: usize) -> Result<ShmRegion, ShmError> {
        let size = NonZeroUsize::new(len).ok_or(ShmError::EmptyRegion)?;
        let ptr = unsafe {
            mmap(
                None,
                size,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
                &fd,
                0,
            )
        }
        .map_err(ShmError::Map)?;
        Ok(ShmRegion { fd, ptr, len })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr() as *mut u8
    }

    pub fn fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

impl Drop for ShmRegion {
    fn drop(&mut self) {
        if let Err(e) = unsafe { munmap(self.ptr, self.len) } {
            log::warn!("failed to unmap shm region: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_and_write() {
        let region = ShmRegion::anonymous("chorus-test", 4096).unwrap();
        assert_eq!(region.len(), 4096);
        unsafe {
            region.as_ptr().write(0xa5);
            assert_eq!(region.as_ptr().read(), 0xa5);
        }
    }

    #[test]
    fn rejects_empty() {
        assert!(matches!(
            ShmRegion::anonymous("chorus-test", 0),
            Err(ShmError::EmptyRegion)
        ));
    }
}
