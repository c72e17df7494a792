use std::{
    fmt, io,
    ops::Range,
    ptr::{self, NonNull},
    sync::OnceLock,
};

use bitflags::bitflags;

use crate::error::MapError;

#[cfg(unix)]
#[allow(unused)]
mod unix {
    use core::ffi::c_void;

    pub const PROT_NONE: i32 = 0x0;
    pub const PROT_READ: i32 = 0x1;
    pub const PROT_WRITE: i32 = 0x2;
    pub const PROT_EXEC: i32 = 0x4;

    pub const MAP_PRIVATE: i32 = 0x02;
    pub const MAP_FIXED: i32 = 0x10;

    #[cfg(target_os = "linux")]
    pub const MAP_ANON: i32 = 0x20;
    #[cfg(any(target_os = "macos", target_os = "ios"))]
    pub const MAP_ANON: i32 = 0x1000;

    pub const MAP_FAILED: isize = -1;

    pub const MADV_DONTNEED: i32 = 4;

    #[cfg(target_os = "linux")]
    pub const SC_PAGESIZE: i32 = 30;
    #[cfg(any(target_os = "macos", target_os = "ios"))]
    pub const SC_PAGESIZE: i32 = 29;

    /// posix mmap family
    /// # Safety
    /// see valid mmap, munmap, mprotect and madvise usage online
    unsafe extern "C" {
        pub fn mmap(
            addr: *mut c_void,
            length: usize,
            prot: i32,
            flags: i32,
            fd: i32,
            offset: isize,
        ) -> *mut c_void;

        pub fn munmap(addr: *mut c_void, length: usize) -> i32;

        pub fn mprotect(addr: *mut c_void, length: usize, prot: i32) -> i32;

        pub fn madvise(addr: *mut c_void, length: usize, advice: i32) -> i32;

        pub fn sysconf(name: i32) -> i64;
    }

    /// posix memory allocation using mmap, `hint` is only a hint
    /// # Safety
    /// null must be checked
    #[inline]
    pub unsafe fn anonymous_mmap(hint: *mut u8, len: usize, prot: i32) -> *mut u8 {
        // SAFETY: safe if contract holds
        let p = unsafe {
            mmap(hint.cast(), len, prot, MAP_PRIVATE | MAP_ANON, -1, 0)
        };
        if (p as isize) == MAP_FAILED {
            core::ptr::null_mut()
        } else {
            p as *mut u8
        }
    }

    /// posix memory deallocation using munmap
    /// # Safety
    /// must be allocated by mmmap
    #[inline]
    pub unsafe fn anonymous_munmap(ptr: *mut u8, len: usize) -> i32 {
        // SAFETY: safe if contract holds
        unsafe { munmap(ptr.cast(), len) }
    }

    /// Drops the physical backing of `[ptr, ptr + len)`. The range stays
    /// mapped and reads back as zero afterwards.
    /// # Safety
    /// range must be page aligned and inside a private anonymous mapping
    #[cfg(target_os = "linux")]
    #[inline]
    pub unsafe fn discard(ptr: *mut u8, len: usize, _prot: i32) -> i32 {
        // SAFETY: safe if contract holds
        unsafe { madvise(ptr.cast(), len, MADV_DONTNEED) }
    }

    /// Drops the physical backing of `[ptr, ptr + len)`. The range stays
    /// mapped and reads back as zero afterwards.
    /// # Safety
    /// range must be page aligned and inside a private anonymous mapping
    #[cfg(not(target_os = "linux"))]
    #[inline]
    pub unsafe fn discard(ptr: *mut u8, len: usize, prot: i32) -> i32 {
        // MADV_DONTNEED does not zero here, replace the pages instead
        // SAFETY: safe if contract holds
        let p = unsafe {
            mmap(
                ptr.cast(),
                len,
                prot,
                MAP_PRIVATE | MAP_ANON | MAP_FIXED,
                -1,
                0,
            )
        };
        if (p as isize) == MAP_FAILED { -1 } else { 0 }
    }
}

pub const OS_PAGE_SIZE: usize = 4096;

/// Page size of the running system, queried once.
pub fn page_size() -> usize {
    static PAGE_SIZE: OnceLock<usize> = OnceLock::new();
    *PAGE_SIZE.get_or_init(|| {
        // SAFETY: sysconf has no preconditions
        let size = unsafe { unix::sysconf(unix::SC_PAGESIZE) };
        if size > 0 {
            size as usize
        } else {
            OS_PAGE_SIZE
        }
    })
}

#[inline]
pub const fn round_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

#[inline]
pub const fn round_down(value: usize, align: usize) -> usize {
    value & !(align - 1)
}

bitflags! {
    /// Access rights of a mapped range.
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub struct Protection: u8 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXEC = 1 << 2;
    }
}

impl Protection {
    pub const NONE: Protection = Protection::empty();
    pub const READ_WRITE: Protection =
        Protection::READ.union(Protection::WRITE);

    fn as_prot(self) -> i32 {
        let mut prot = unix::PROT_NONE;
        if self.contains(Protection::READ) {
            prot |= unix::PROT_READ;
        }
        if self.contains(Protection::WRITE) {
            prot |= unix::PROT_WRITE;
        }
        if self.contains(Protection::EXEC) {
            prot |= unix::PROT_EXEC;
        }
        prot
    }
}

/// Changes the protection of the pages in `range`.
///
/// # Safety
/// `range` must be page aligned and lie in memory mapped by this process,
/// nothing may access the range in a way the new protection forbids.
pub unsafe fn protect(range: Range<usize>, prot: Protection) -> io::Result<()> {
    debug_assert!(range.start.is_multiple_of(page_size()));
    debug_assert!(range.end.is_multiple_of(page_size()));
    if range.is_empty() {
        return Ok(());
    }
    // SAFETY: guaranteed by caller
    let res = unsafe {
        unix::mprotect(range.start as *mut _, range.len(), prot.as_prot())
    };
    if res == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

/// Returns the physical pages of `range` to the OS while keeping the
/// addresses reserved. Pages read back as zero afterwards.
///
/// # Safety
/// `range` must be page aligned and lie in a private anonymous mapping
/// created with `prot`; its previous contents are lost.
pub unsafe fn release_pages(
    range: Range<usize>,
    prot: Protection,
) -> io::Result<()> {
    debug_assert!(range.start.is_multiple_of(page_size()));
    debug_assert!(range.end.is_multiple_of(page_size()));
    if range.is_empty() {
        return Ok(());
    }
    // SAFETY: guaranteed by caller
    let res = unsafe {
        unix::discard(range.start as *mut u8, range.len(), prot.as_prot())
    };
    if res == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

/// An anonymous memory mapping, unmapped on drop.
pub struct MemMap {
    name: String,
    begin: NonNull<u8>,
    size: usize,
    prot: Protection,
}

// SAFETY: the mapping is plain memory owned by this value
unsafe impl Send for MemMap {}
// SAFETY: MemMap itself is immutable, access to the bytes is up to the owner
unsafe impl Sync for MemMap {}

impl MemMap {
    /// Maps `size` bytes, rounded up to the page size. `requested_begin`
    /// is passed as a hint, the kernel may place the mapping elsewhere.
    pub fn map_anonymous(
        name: &str,
        requested_begin: Option<NonNull<u8>>,
        size: usize,
        prot: Protection,
    ) -> Result<MemMap, MapError> {
        if size == 0 {
            return Err(MapError::ZeroSize {
                name: name.to_owned(),
            });
        }
        let size = size
            .checked_add(page_size() - 1)
            .map(|s| round_down(s, page_size()))
            .ok_or_else(|| MapError::TooLarge {
                name: name.to_owned(),
                size,
            })?;
        let hint = requested_begin.map_or(ptr::null_mut(), NonNull::as_ptr);
        // SAFETY: result is checked for null below
        let raw = unsafe { unix::anonymous_mmap(hint, size, prot.as_prot()) };
        let Some(begin) = NonNull::new(raw) else {
            return Err(MapError::Os {
                name: name.to_owned(),
                size,
                source: io::Error::last_os_error(),
            });
        };
        Ok(MemMap {
            name: name.to_owned(),
            begin,
            size,
            prot,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn begin(&self) -> *mut u8 {
        self.begin.as_ptr()
    }

    #[inline]
    pub fn end(&self) -> *mut u8 {
        // SAFETY: one past the end of the mapping
        unsafe { self.begin.as_ptr().add(self.size) }
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    #[inline]
    pub fn has_address(&self, ptr: *const u8) -> bool {
        let addr = ptr as usize;
        addr >= self.begin() as usize && addr < self.end() as usize
    }

    /// Changes protection of `range`, which must be page aligned and
    /// inside this mapping.
    ///
    /// # Safety
    /// no live reference may be used in a way the new protection forbids
    pub unsafe fn protect(
        &self,
        range: Range<usize>,
        prot: Protection,
    ) -> io::Result<()> {
        assert!(
            range.start >= self.begin() as usize
                && range.end <= self.end() as usize,
            "protect range outside of {}",
            self.name
        );
        // SAFETY: range is inside our mapping, rest guaranteed by caller
        unsafe { protect(range, prot) }
    }

    /// Releases the physical pages of `range` (page aligned, inside this
    /// mapping). The range reads back as zero.
    ///
    /// # Safety
    /// the contents of the range are discarded
    pub unsafe fn release(&self, range: Range<usize>) -> io::Result<()> {
        assert!(
            range.start >= self.begin() as usize
                && range.end <= self.end() as usize,
            "release range outside of {}",
            self.name
        );
        // SAFETY: range is inside our private anonymous mapping
        unsafe { release_pages(range, self.prot) }
    }
}

impl Drop for MemMap {
    fn drop(&mut self) {
        // SAFETY: begin and size describe a mapping created by mmap
        let res = unsafe { unix::anonymous_munmap(self.begin.as_ptr(), self.size) };
        if res != 0 {
            log::warn!(
                "munmap of {} at {:p} ({} bytes) failed: {}",
                self.name,
                self.begin,
                self.size,
                io::Error::last_os_error()
            );
        }
    }
}

impl fmt::Debug for MemMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemMap")
            .field("name", &self.name)
            .field("begin", &self.begin)
            .field("size", &self.size)
            .field("prot", &self.prot)
            .finish()
    }
}
