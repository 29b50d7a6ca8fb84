//! Mapped shared-memory regions received from the client.
//!
//! A [`MappedRegion`] owns both the descriptor and the mapping; dropping
//! it unmaps the region and closes the descriptor, in that order. All
//! access is through bounds-checked slices, so a stale offset from a
//! client region can never read outside the mapping.

use crate::error::{Error, Result};
use rustix::fd::{AsFd, BorrowedFd, OwnedFd};
use rustix::mm::{MapFlags, ProtFlags};
use std::ptr::NonNull;

/// A shared read-write mapping over a client-passed descriptor.
pub struct MappedRegion {
    ptr: NonNull<u8>,
    len: usize,
    fd: OwnedFd,
}

// The raw pointer is only dereferenced through &self/&mut self slices,
// so the usual reference aliasing rules carry over.
unsafe impl Send for MappedRegion {}
unsafe impl Sync for MappedRegion {}

impl MappedRegion {
    /// Map `len` bytes of `fd` shared read-write.
    ///
    /// Takes ownership of the descriptor; on failure the descriptor is
    /// closed here, so the caller never holds a half-transferred fd.
    pub fn map(fd: OwnedFd, len: usize) -> Result<Self> {
        if len == 0 {
            return Err(Error::MappingFailed("zero-length mapping".into()));
        }

        let ptr = unsafe {
            rustix::mm::mmap(
                std::ptr::null_mut(),
                len,
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::SHARED,
                &fd,
                0,
            )?
        };

        let ptr = NonNull::new(ptr.cast::<u8>())
            .ok_or_else(|| Error::MappingFailed("mmap returned null".into()))?;

        Ok(Self { ptr, len, fd })
    }

    /// Length of the mapping in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// True when the mapping is empty (never constructed, kept for
    /// symmetry with slice APIs).
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Borrow the backing descriptor.
    pub fn fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }

    /// The whole mapping as a byte slice.
    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    /// The whole mapping as a mutable byte slice.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }

    /// Read a little-endian `u32` at `offset`.
    pub fn read_u32(&self, offset: usize) -> Result<u32> {
        let bytes = self
            .as_slice()
            .get(offset..offset + 4)
            .ok_or_else(|| Error::Protocol(format!("read past end of region: {}", offset)))?;
        Ok(u32::from_le_bytes(bytes.try_into().unwrap()))
    }

    /// Read a little-endian `i32` at `offset`.
    pub fn read_i32(&self, offset: usize) -> Result<i32> {
        Ok(self.read_u32(offset)? as i32)
    }

    /// Write a little-endian `u32` at `offset`.
    pub fn write_u32(&mut self, offset: usize, value: u32) -> Result<()> {
        let bytes = self
            .as_mut_slice()
            .get_mut(offset..offset + 4)
            .ok_or_else(|| Error::Protocol(format!("write past end of region: {}", offset)))?;
        bytes.copy_from_slice(&value.to_le_bytes());
        Ok(())
    }

    /// Copy `data` into the region at `offset`.
    pub fn write_bytes(&mut self, offset: usize, data: &[u8]) -> Result<()> {
        let bytes = self
            .as_mut_slice()
            .get_mut(offset..offset + data.len())
            .ok_or_else(|| Error::Protocol(format!("write past end of region: {}", offset)))?;
        bytes.copy_from_slice(data);
        Ok(())
    }
}

impl Drop for MappedRegion {
    fn drop(&mut self) {
        unsafe {
            let _ = rustix::mm::munmap(self.ptr.as_ptr().cast(), self.len);
        }
        // fd closes with the OwnedFd
    }
}

impl std::fmt::Debug for MappedRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MappedRegion").field("len", &self.len).finish()
    }
}
