// SPDX-License-Identifier: Apache-2.0

//! Shared-memory segments and bounds-checked access to their mappings.
//!
//! The client creates one POSIX shm object per queue and unlinks it again
//! when the session ends; the server maps the descriptor it received during
//! negotiation and only ever unmaps. All reads and writes of mapped memory
//! go through [`Mapping`], which checks bounds and alignment on every
//! access.

use std::ffi::CString;
use std::fs::File;
use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};
use std::sync::Arc;

use log::{debug, warn};
use vm_memory::{ByteValued, FileOffset, MmapRegion};

use crate::{Error, Result};

const PAGE_MASK: usize = 4095;

/// A POSIX shared-memory object created by this process. The backing name
/// is unlinked when the segment is dropped.
pub struct SharedSegment {
    name: String,
    file: File,
    size: usize,
}

impl SharedSegment {
    /// Creates and sizes a fresh segment named `name` (e.g. `/vring0`),
    /// replacing any leftover object with the same name.
    pub fn create(name: &str, size: usize) -> Result<Self> {
        let cname = CString::new(name).map_err(|_| {
            Error::SegmentCreate(std::io::Error::from(std::io::ErrorKind::InvalidInput))
        })?;

        // A previous crashed run may have leaked the name.
        // SAFETY: cname is a valid NUL-terminated string.
        unsafe { libc::shm_unlink(cname.as_ptr()) };

        // SAFETY: cname is a valid NUL-terminated string and the flags are a
        // constant combination.
        let fd = unsafe {
            libc::shm_open(
                cname.as_ptr(),
                libc::O_CREAT | libc::O_EXCL | libc::O_RDWR,
                libc::c_uint::from(libc::S_IRUSR | libc::S_IWUSR),
            )
        };
        if fd < 0 {
            return Err(Error::SegmentCreate(std::io::Error::last_os_error()));
        }
        // SAFETY: fd was just returned by shm_open and is owned here.
        let file = unsafe { File::from_raw_fd(fd) };

        // SAFETY: fd is a valid segment descriptor.
        if unsafe { libc::ftruncate(fd, size as libc::off_t) } < 0 {
            let err = std::io::Error::last_os_error();
            // SAFETY: cname is a valid NUL-terminated string.
            unsafe { libc::shm_unlink(cname.as_ptr()) };
            return Err(Error::SegmentCreate(err));
        }

        debug!("created shared segment {} of {} bytes", name, size);
        Ok(SharedSegment {
            name: name.to_owned(),
            file,
            size,
        })
    }

    /// The shm object name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Segment size in bytes.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Maps the whole segment read-write.
    pub fn map(&self) -> Result<Mapping> {
        let file = self.file.try_clone().map_err(Error::SegmentMap)?;
        Mapping::from_file(file, 0, self.size)
    }
}

impl AsRawFd for SharedSegment {
    fn as_raw_fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }
}

impl Drop for SharedSegment {
    fn drop(&mut self) {
        if let Ok(cname) = CString::new(self.name.as_str()) {
            // SAFETY: cname is a valid NUL-terminated string.
            if unsafe { libc::shm_unlink(cname.as_ptr()) } < 0 {
                warn!(
                    "failed to unlink shared segment {}: {}",
                    self.name,
                    std::io::Error::last_os_error()
                );
            }
        }
    }
}

/// A window into a mapped shared region.
///
/// Cloning is cheap; clones share the same underlying mapping, which stays
/// alive until the last window is dropped.
#[derive(Clone)]
pub struct Mapping {
    region: Arc<MmapRegion>,
    offset: usize,
    len: usize,
}

impl Mapping {
    /// Maps `len` bytes of `file` starting at `file_offset`.
    pub fn from_file(file: File, file_offset: u64, len: usize) -> Result<Self> {
        let region = MmapRegion::from_file(FileOffset::new(file, file_offset), len)
            .map_err(|e| Error::SegmentMap(std::io::Error::other(e)))?;
        Ok(Mapping {
            region: Arc::new(region),
            offset: 0,
            len,
        })
    }

    /// A sub-window of this mapping.
    pub fn subrange(&self, offset: usize, len: usize) -> Result<Self> {
        self.check(offset, len)?;
        Ok(Mapping {
            region: Arc::clone(&self.region),
            offset: self.offset + offset,
            len,
        })
    }

    /// Window length in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the window is empty.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The process-local address of the window start. Used by the client to
    /// name ring and buffer addresses during negotiation.
    pub fn host_addr(&self) -> u64 {
        self.region.as_ptr() as u64 + self.offset as u64
    }

    fn check(&self, offset: usize, len: usize) -> Result<()> {
        if offset
            .checked_add(len)
            .map_or(true, |end| end > self.len)
        {
            return Err(Error::OutOfBounds {
                offset,
                len,
                size: self.len,
            });
        }
        Ok(())
    }

    fn ptr_at(&self, offset: usize, len: usize) -> Result<*mut u8> {
        self.check(offset, len)?;
        // In bounds per check above; the region outlives self.
        Ok(self.region.as_ptr().wrapping_add(self.offset + offset))
    }

    /// Reads one `T` at `offset`. The offset must be aligned for `T`.
    pub fn read_obj<T: ByteValued>(&self, offset: usize) -> Result<T> {
        let ptr = self.ptr_at(offset, std::mem::size_of::<T>())?;
        if ptr as usize % std::mem::align_of::<T>() != 0 {
            return Err(Error::Misaligned(offset));
        }
        // SAFETY: ptr is in bounds, aligned, and T is plain bytes. Volatile
        // because the peer process mutates the mapping concurrently.
        Ok(unsafe { std::ptr::read_volatile(ptr as *const T) })
    }

    /// Writes one `T` at `offset`. The offset must be aligned for `T`.
    pub fn write_obj<T: ByteValued>(&self, offset: usize, val: T) -> Result<()> {
        let ptr = self.ptr_at(offset, std::mem::size_of::<T>())?;
        if ptr as usize % std::mem::align_of::<T>() != 0 {
            return Err(Error::Misaligned(offset));
        }
        // SAFETY: ptr is in bounds, aligned, and T is plain bytes.
        unsafe { std::ptr::write_volatile(ptr as *mut T, val) };
        Ok(())
    }

    /// Copies `buf.len()` bytes out of the window.
    pub fn read(&self, offset: usize, buf: &mut [u8]) -> Result<()> {
        let ptr = self.ptr_at(offset, buf.len())?;
        // SAFETY: source range is in bounds and does not overlap buf.
        unsafe { std::ptr::copy_nonoverlapping(ptr, buf.as_mut_ptr(), buf.len()) };
        Ok(())
    }

    /// Copies `buf` into the window.
    pub fn write(&self, offset: usize, buf: &[u8]) -> Result<()> {
        let ptr = self.ptr_at(offset, buf.len())?;
        // SAFETY: destination range is in bounds and does not overlap buf.
        unsafe { std::ptr::copy_nonoverlapping(buf.as_ptr(), ptr, buf.len()) };
        Ok(())
    }

    /// Zero-fills `len` bytes at `offset`.
    pub fn zero(&self, offset: usize, len: usize) -> Result<()> {
        let ptr = self.ptr_at(offset, len)?;
        // SAFETY: range is in bounds.
        unsafe { std::ptr::write_bytes(ptr, 0, len) };
        Ok(())
    }

    /// Flushes the whole window to the shared mapping so the peer process
    /// observes the writes.
    pub fn sync(&self) -> Result<()> {
        self.sync_range(0, self.len)
    }

    /// Flushes a sub-range of the window.
    pub fn sync_range(&self, offset: usize, len: usize) -> Result<()> {
        if len == 0 {
            return Ok(());
        }
        let ptr = self.ptr_at(offset, len)?;
        // msync requires a page-aligned start address.
        let shift = ptr as usize & PAGE_MASK;
        let base = (ptr as usize - shift) as *mut libc::c_void;
        // SAFETY: the rounded range is still within the region mapping,
        // which is page-granular.
        let ret = unsafe { libc::msync(base, len + shift, libc::MS_SYNC | libc::MS_INVALIDATE) };
        if ret < 0 {
            return Err(Error::SegmentSync(std::io::Error::last_os_error()));
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn test_segment(tag: &str, size: usize) -> SharedSegment {
        let name = format!("/vring-test-{}-{}", std::process::id(), tag);
        SharedSegment::create(&name, size).unwrap()
    }

    #[test]
    fn segment_create_and_map() {
        let seg = test_segment("create", 8192);
        assert_eq!(seg.size(), 8192);
        let map = seg.map().unwrap();
        assert_eq!(map.len(), 8192);
    }

    #[test]
    fn two_mappings_share_the_segment() {
        let seg = test_segment("share", 4096);
        let a = seg.map().unwrap();
        let b = seg.map().unwrap();

        a.write(100, &[7u8, 8, 9]).unwrap();
        a.sync().unwrap();
        let mut buf = [0u8; 3];
        b.read(100, &mut buf).unwrap();
        assert_eq!(buf, [7, 8, 9]);
    }

    #[test]
    fn obj_round_trip() {
        let seg = test_segment("obj", 4096);
        let map = seg.map().unwrap();

        map.write_obj::<u64>(8, 0x1122_3344_5566_7788).unwrap();
        assert_eq!(map.read_obj::<u64>(8).unwrap(), 0x1122_3344_5566_7788);
        map.write_obj::<u16>(2, 0xabcd).unwrap();
        assert_eq!(map.read_obj::<u16>(2).unwrap(), 0xabcd);
    }

    #[test]
    fn bounds_are_enforced() {
        let seg = test_segment("bounds", 4096);
        let map = seg.map().unwrap();

        assert!(map.read_obj::<u64>(4090).is_err());
        assert!(map.write(4096, &[0]).is_err());
        assert!(map.subrange(4000, 97).is_err());
        assert!(map.subrange(4000, 96).is_ok());
        // Offset arithmetic must not wrap.
        assert!(map.write(usize::MAX, &[0]).is_err());
    }

    #[test]
    fn misaligned_obj_access_rejected() {
        let seg = test_segment("align", 4096);
        let map = seg.map().unwrap();
        assert!(matches!(
            map.read_obj::<u64>(3),
            Err(Error::Misaligned(3))
        ));
    }

    #[test]
    fn subrange_offsets_are_relative() {
        let seg = test_segment("sub", 4096);
        let map = seg.map().unwrap();
        let sub = map.subrange(128, 64).unwrap();

        sub.write_obj::<u32>(0, 0xfeed_f00d).unwrap();
        assert_eq!(map.read_obj::<u32>(128).unwrap(), 0xfeed_f00d);
        assert_eq!(sub.host_addr(), map.host_addr() + 128);
    }
}
