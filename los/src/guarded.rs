//! Map space that surrounds every object with inaccessible pages, so reads
//! or writes just outside an object fault immediately.

use std::{fmt, ptr::NonNull};

use crate::{
    error::AllocError,
    map_space::LargeObjectMapSpace,
    space::{Allocation, LargeObjectSpace, SpaceCore},
    system::{self, Protection, page_size},
};

pub struct GuardedMapSpace {
    inner: LargeObjectMapSpace,
    guard: usize,
}

impl GuardedMapSpace {
    pub fn new(name: &str) -> Self {
        Self::with_debug_checks(name, cfg!(debug_assertions))
    }

    pub fn with_debug_checks(name: &str, debug_checks: bool) -> Self {
        Self {
            inner: LargeObjectMapSpace::with_debug_checks(name, debug_checks),
            guard: page_size(),
        }
    }

    /// Size of the guard zone on each side of an object.
    pub fn guard_size(&self) -> usize {
        self.guard
    }

    #[inline]
    fn mapping_of(&self, ptr: *const u8) -> *mut u8 {
        (ptr as usize).wrapping_sub(self.guard) as *mut u8
    }
}

impl LargeObjectSpace for GuardedMapSpace {
    fn core(&self) -> &SpaceCore {
        self.inner.core()
    }

    fn alloc(&self, num_bytes: usize) -> Result<Allocation, AllocError> {
        let total = num_bytes
            .checked_add(2 * self.guard)
            .ok_or(AllocError::Overflow { requested: num_bytes })?;
        let mapping = self.inner.alloc(total)?;
        let begin = mapping.ptr.as_ptr() as usize;
        let end = begin + mapping.bytes_allocated;

        for zone in [begin..begin + self.guard, end - self.guard..end] {
            // SAFETY: the zones lie inside the fresh mapping and are never
            // handed out
            if let Err(err) = unsafe { system::protect(zone, Protection::NONE) } {
                log::warn!("failed to protect guard zone at {begin:#x}: {err}");
            }
        }

        Ok(Allocation {
            // SAFETY: begin is non null, so is begin + guard
            ptr: unsafe { NonNull::new_unchecked((begin + self.guard) as *mut u8) },
            bytes_allocated: mapping.bytes_allocated,
            usable_size: num_bytes,
        })
    }

    fn free(&self, ptr: *mut u8) -> usize {
        self.inner.free(self.mapping_of(ptr))
    }

    fn allocation_size(&self, ptr: *const u8) -> usize {
        self.inner.allocation_size(self.mapping_of(ptr))
    }

    fn usable_size(&self, ptr: *const u8) -> usize {
        self.inner.usable_size(self.mapping_of(ptr)) - 2 * self.guard
    }

    fn contains(&self, ptr: *const u8) -> bool {
        self.inner.contains(self.mapping_of(ptr))
    }

    fn walk(&self, callback: &mut dyn FnMut(*mut u8, *mut u8, usize)) {
        let guard = self.guard;
        self.inner.walk(&mut |start, end, size| {
            if start.is_null() {
                callback(start, end, size);
            } else {
                callback(start.wrapping_add(guard), end.wrapping_sub(guard), size);
            }
        });
    }

    fn dump(&self, out: &mut dyn fmt::Write) -> fmt::Result {
        writeln!(out, "guard zones of {} bytes", self.guard)?;
        self.inner.dump(out)
    }

    fn log_fragmentation_alloc_failure(
        &self,
        out: &mut dyn fmt::Write,
        failed_bytes: usize,
    ) -> fmt::Result {
        self.inner.log_fragmentation_alloc_failure(out, failed_bytes)
    }
}

impl fmt::Debug for GuardedMapSpace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GuardedMapSpace")
            .field("inner", &self.inner)
            .field("guard", &self.guard)
            .finish()
    }
}
