//! Large object space carved out of a single mapping.
//!
//! The mapping is split into `alignment` sized slots. Every allocation
//! starts with an [`AllocationHeader`]; free memory has no header of its
//! own; a gap is recorded as `prev_free` in the header of the allocation
//! right after it. Everything past the last allocation is the trailing
//! free region of `free_end` bytes.
//!
//! ```text
//!  begin                                                  end
//!  | hdr | obj ... | gap ... | hdr(prev_free) | obj | free_end ... |
//! ```
//!
//! Headers are addressed by their offset from `begin`. Freed memory is
//! zeroed (released pages read back as zero), so a slot whose header has
//! `allocation_size == 0` is free and the next allocation can be found by
//! stepping forward one slot at a time.

use std::{
    collections::BTreeSet,
    fmt,
    mem,
    ops::Range,
    ptr::{self, NonNull},
};

use crate::{
    error::{AllocError, SpaceError},
    lock::SpaceLock,
    space::{Allocation, LargeObjectSpace, SpaceCore, heap_corruption},
    system::{MemMap, Protection, page_size, round_down, round_up},
};

#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct AllocationHeader {
    /// Size of the free gap directly in front of this header.
    prev_free: usize,
    /// Slot size including the header, zero for free memory.
    allocation_size: usize,
}

pub const HEADER_SIZE: usize = mem::size_of::<AllocationHeader>();

/// What a header says about the slot it starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slot {
    Free,
    Allocated { size: usize },
}

impl AllocationHeader {
    pub fn slot(&self) -> Slot {
        match self.allocation_size {
            0 => Slot::Free,
            size => Slot::Allocated { size },
        }
    }

    #[inline]
    pub fn is_free(&self) -> bool {
        self.allocation_size == 0
    }
}

/// A span of the space as seen by [`FreeListSpace::regions`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Region {
    /// A gap between allocations or the trailing free region.
    Free(Range<usize>),
    /// A whole slot, header included.
    Allocated(Range<usize>),
}

impl Region {
    pub fn range(&self) -> &Range<usize> {
        match self {
            Region::Free(range) | Region::Allocated(range) => range,
        }
    }

    pub fn is_free(&self) -> bool {
        matches!(self, Region::Free(_))
    }
}

#[derive(Debug)]
struct FreeListState {
    /// `(prev_free, header offset)` of every header with a gap before it,
    /// so a range query from `(size, 0)` finds the best fit.
    free_blocks: BTreeSet<(usize, usize)>,
    /// Size of the trailing free region.
    free_end: usize,
}

pub struct FreeListSpace {
    core: SpaceCore,
    map: MemMap,
    capacity: usize,
    alignment: usize,
    state: SpaceLock<FreeListState>,
}

impl FreeListSpace {
    /// Maps `capacity` bytes for the space. `capacity` must be a multiple
    /// of `alignment`, which must be a power of two and a multiple of the
    /// header size.
    pub fn create(
        name: &str,
        requested_begin: Option<NonNull<u8>>,
        capacity: usize,
        alignment: usize,
    ) -> Result<Self, SpaceError> {
        Self::create_with_checks(
            name,
            requested_begin,
            capacity,
            alignment,
            cfg!(debug_assertions),
        )
    }

    pub fn create_with_checks(
        name: &str,
        requested_begin: Option<NonNull<u8>>,
        capacity: usize,
        alignment: usize,
        debug_checks: bool,
    ) -> Result<Self, SpaceError> {
        if !alignment.is_power_of_two() || alignment < HEADER_SIZE {
            return Err(SpaceError::InvalidSettings(
                "alignment must be a power of two of at least the header size",
            ));
        }
        if capacity == 0 || !capacity.is_multiple_of(alignment) {
            return Err(SpaceError::InvalidSettings(
                "capacity must be a non zero multiple of the alignment",
            ));
        }

        let map = MemMap::map_anonymous(
            name,
            requested_begin,
            capacity,
            Protection::READ_WRITE,
        )?;
        let begin = map.begin() as usize;
        log::debug!(
            "created free list space {name} at {begin:#x}, {capacity} bytes, alignment {alignment}"
        );

        Ok(Self {
            // objects sit one header past a slot boundary
            core: SpaceCore::new(name, begin, begin + capacity, HEADER_SIZE, debug_checks),
            map,
            capacity,
            alignment,
            state: SpaceLock::new(
                "free list space lock",
                FreeListState {
                    free_blocks: BTreeSet::new(),
                    free_end: capacity,
                },
            ),
        })
    }

    pub fn alignment(&self) -> usize {
        self.alignment
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Size of the trailing free region.
    pub fn free_end(&self) -> usize {
        self.state.lock().free_end
    }

    // ── Header access ─────────────────────────────────────────────────

    #[inline]
    fn header_ptr(&self, offset: usize) -> *mut AllocationHeader {
        debug_assert!(offset.is_multiple_of(self.alignment));
        debug_assert!(offset + HEADER_SIZE <= self.capacity);
        self.map.begin().wrapping_add(offset).cast()
    }

    /// Reads a header. Taking the state proves the lock is held.
    #[inline]
    fn header(&self, _: &FreeListState, offset: usize) -> AllocationHeader {
        // SAFETY: offset is an aligned slot inside the mapping, slots are
        // always readable and only touched under the lock
        unsafe { self.header_ptr(offset).read() }
    }

    #[inline]
    fn write_header(&self, _: &mut FreeListState, offset: usize, header: AllocationHeader) {
        // SAFETY: as in `header`, and the slot is writable since it is
        // either live or was made writable by alloc
        unsafe { self.header_ptr(offset).write(header) }
    }

    fn set_prev_free(&self, state: &mut FreeListState, offset: usize, prev_free: usize) {
        let mut header = self.header(state, offset);
        header.prev_free = prev_free;
        self.write_header(state, offset, header);
    }

    /// First header in `[offset, limit)` that starts an allocation.
    fn scan_non_free(&self, state: &FreeListState, mut offset: usize, limit: usize) -> Option<usize> {
        while offset < limit {
            if !self.header(state, offset).is_free() {
                return Some(offset);
            }
            offset += self.alignment;
        }
        None
    }

    fn next_non_free(&self, state: &FreeListState, offset: usize, limit: usize) -> usize {
        match self.scan_non_free(state, offset, limit) {
            Some(live) => live,
            None => self.corrupted(
                state,
                format_args!("free run at offset {offset:#x} runs into the trailing free region"),
            ),
        }
    }

    /// Whether an allocation starts at `offset`, found by following the
    /// header chain from the start of the space.
    fn is_allocation_start(&self, state: &FreeListState, offset: usize) -> bool {
        let free_end_start = self.capacity - state.free_end;
        let mut cursor = 0;
        while let Some(live) = self.scan_non_free(state, cursor, free_end_start) {
            if live >= offset {
                return live == offset;
            }
            cursor = live + self.header(state, live).allocation_size;
        }
        false
    }

    fn remove_free_block(&self, state: &mut FreeListState, prev_free: usize, offset: usize) {
        if !state.free_blocks.remove(&(prev_free, offset)) {
            self.corrupted(
                state,
                format_args!(
                    "header at offset {offset:#x} with a {prev_free} byte gap is missing from the free blocks"
                ),
            );
        }
    }

    // ── Diagnostics ───────────────────────────────────────────────────

    fn regions_locked(&self, state: &FreeListState) -> Vec<Region> {
        let begin = self.map.begin() as usize;
        let free_end_start = self.capacity - state.free_end;
        let mut regions = Vec::new();
        let mut offset = 0;
        while offset < free_end_start {
            let Some(live) = self.scan_non_free(state, offset, free_end_start) else {
                // broken bookkeeping, show the rest as one block
                regions.push(Region::Free(begin + offset..begin + free_end_start));
                break;
            };
            if live != offset {
                regions.push(Region::Free(begin + offset..begin + live));
            }
            let size = self.header(state, live).allocation_size;
            regions.push(Region::Allocated(begin + live..begin + live + size));
            offset = live + size;
        }
        if state.free_end > 0 {
            regions.push(Region::Free(begin + free_end_start..begin + self.capacity));
        }
        regions
    }

    /// Every gap, allocation and the trailing region in address order.
    pub fn regions(&self) -> Vec<Region> {
        let state = self.state.lock();
        self.regions_locked(&state)
    }

    fn dump_locked(&self, state: &FreeListState, out: &mut dyn fmt::Write) -> fmt::Result {
        writeln!(
            out,
            "{} - begin: {:#x} end: {:#x}",
            self.core.name(),
            self.core.begin(),
            self.core.end()
        )?;
        for region in self.regions_locked(state) {
            match region {
                Region::Free(range) => writeln!(
                    out,
                    "Free block at address: {:#x} of length {} bytes",
                    range.start,
                    range.len()
                )?,
                Region::Allocated(range) => writeln!(
                    out,
                    "Large object at address: {:#x} of length {} bytes",
                    range.start + HEADER_SIZE,
                    range.len() - HEADER_SIZE
                )?,
            }
        }
        Ok(())
    }

    /// Dumps the space and panics. Only for broken heap invariants.
    #[cold]
    #[track_caller]
    fn corrupted(&self, state: &FreeListState, message: fmt::Arguments<'_>) -> ! {
        let mut dump = String::new();
        let _ = self.dump_locked(state, &mut dump);
        heap_corruption(&dump, format_args!("{}: {}", self.core.name(), message))
    }

    // ── Page maintenance ──────────────────────────────────────────────

    /// Zeroes a freed slot and hands its whole pages back to the OS.
    fn scrub(&self, range: Range<usize>) {
        let page = page_size();
        let inner = round_up(range.start, page)..round_down(range.end, page);
        if inner.start >= inner.end {
            // SAFETY: the slot was live and therefore writable
            unsafe { ptr::write_bytes(range.start as *mut u8, 0, range.len()) };
            return;
        }
        // SAFETY: partial pages are shared with live or never protected
        // memory, so they are writable
        unsafe {
            ptr::write_bytes(range.start as *mut u8, 0, inner.start - range.start);
            ptr::write_bytes(inner.end as *mut u8, 0, range.end - inner.end);
        }

        // SAFETY: the pages belong to the freed slot only
        if let Err(err) = unsafe { self.map.release(inner.clone()) } {
            log::warn!("{}: releasing pages {inner:#x?} failed: {err}", self.core.name());
            // SAFETY: as above, the pages are still mapped read/write
            unsafe { ptr::write_bytes(inner.start as *mut u8, 0, inner.len()) };
        }
        if self.core.debug_checks() {
            // stays readable for the header scan
            // SAFETY: nothing writes to free memory until alloc unprotects it
            if let Err(err) = unsafe { self.map.protect(inner.clone(), Protection::READ) } {
                log::warn!("{}: protecting {inner:#x?} failed: {err}", self.core.name());
            }
        }
    }

    fn unprotect(&self, range: Range<usize>) {
        let page = page_size();
        let pages = round_down(range.start, page)..round_up(range.end, page);
        // SAFETY: pages are inside the mapping, making them writable
        // cannot invalidate any access
        if let Err(err) = unsafe { self.map.protect(pages.clone(), Protection::READ_WRITE) } {
            log::warn!("{}: unprotecting {pages:#x?} failed: {err}", self.core.name());
        }
    }
}

impl LargeObjectSpace for FreeListSpace {
    fn core(&self) -> &SpaceCore {
        &self.core
    }

    fn alloc(&self, num_bytes: usize) -> Result<Allocation, AllocError> {
        let slot = num_bytes
            .checked_add(HEADER_SIZE + self.alignment - 1)
            .map(|n| round_down(n, self.alignment))
            .ok_or(AllocError::Overflow { requested: num_bytes })?;

        let mut state = self.state.lock();
        let best_fit = state.free_blocks.range((slot, 0)..).next().copied();
        let offset = if let Some((gap, owner)) = best_fit {
            state.free_blocks.remove(&(gap, owner));
            // the object takes the front of the gap
            let remaining = gap - slot;
            self.set_prev_free(&mut state, owner, remaining);
            if remaining > 0 {
                state.free_blocks.insert((remaining, owner));
            }
            owner - gap
        } else if state.free_end >= slot {
            let offset = self.capacity - state.free_end;
            state.free_end -= slot;
            offset
        } else {
            let free_end = state.free_end;
            drop(state);
            log::warn!(
                "{}: no room for {num_bytes} bytes ({slot} byte slot)",
                self.core.name()
            );
            return Err(AllocError::OutOfSpace {
                space: self.core.name().to_owned(),
                requested: num_bytes,
                required: slot,
                free_end,
            });
        };

        let header_addr = self.map.begin() as usize + offset;
        if self.core.debug_checks() {
            self.unprotect(header_addr..header_addr + slot);
        }
        self.write_header(
            &mut state,
            offset,
            AllocationHeader {
                prev_free: 0,
                allocation_size: slot,
            },
        );
        self.core.stats().record_alloc(slot);
        drop(state);

        let obj = (header_addr + HEADER_SIZE) as *mut u8;
        log::trace!("{}: allocated {slot} bytes at {obj:p}", self.core.name());
        Ok(Allocation {
            // SAFETY: inside the mapping, never null
            ptr: unsafe { NonNull::new_unchecked(obj) },
            bytes_allocated: slot,
            usable_size: slot - HEADER_SIZE,
        })
    }

    fn free(&self, ptr: *mut u8) -> usize {
        let mut state = self.state.lock();
        let begin = self.map.begin() as usize;
        let addr = ptr as usize;
        if addr < begin + HEADER_SIZE || addr >= begin + self.capacity {
            self.corrupted(&state, format_args!("{ptr:p} is not in this space"));
        }
        let offset = addr - HEADER_SIZE - begin;
        let free_end_start = self.capacity - state.free_end;
        if !offset.is_multiple_of(self.alignment) || offset >= free_end_start {
            self.corrupted(
                &state,
                format_args!("Attempted to free large object {ptr:p} which was not live"),
            );
        }
        let header = self.header(&state, offset);
        let Slot::Allocated { size } = header.slot() else {
            self.corrupted(
                &state,
                format_args!("Attempted to free large object {ptr:p} which was not live"),
            );
        };
        // payload bytes can look like a header
        if self.core.debug_checks() && !self.is_allocation_start(&state, offset) {
            self.corrupted(
                &state,
                format_args!("Attempted to free large object {ptr:p} which was not live"),
            );
        }

        let next = offset + size;
        let mut new_free = size;
        if header.prev_free > 0 {
            new_free += header.prev_free;
            self.remove_free_block(&mut state, header.prev_free, offset);
        }
        if next >= free_end_start {
            if next != free_end_start {
                self.corrupted(
                    &state,
                    format_args!(
                        "object {ptr:p} of {size} bytes overlaps the trailing free region"
                    ),
                );
            }
            state.free_end += new_free;
        } else {
            let owner = if self.header(&state, next).is_free() {
                let far = self.next_non_free(&state, next, free_end_start);
                let far_gap = self.header(&state, far).prev_free;
                self.remove_free_block(&mut state, far_gap, far);
                new_free += far_gap;
                far
            } else {
                next
            };
            self.set_prev_free(&mut state, owner, new_free);
            state.free_blocks.insert((new_free, owner));
        }

        self.core.stats().record_free(size);
        self.scrub(begin + offset..begin + next);
        log::trace!("{}: freed {size} bytes at {ptr:p}", self.core.name());
        size
    }

    fn allocation_size(&self, ptr: *const u8) -> usize {
        let state = self.state.lock();
        let begin = self.map.begin() as usize;
        let addr = ptr as usize;
        let offset = addr.wrapping_sub(begin + HEADER_SIZE);
        if addr < begin + HEADER_SIZE
            || offset >= self.capacity - state.free_end
            || !offset.is_multiple_of(self.alignment)
        {
            self.corrupted(&state, format_args!("{ptr:p} is not an object of this space"));
        }
        match self.header(&state, offset).slot() {
            Slot::Allocated { size }
                if !self.core.debug_checks() || self.is_allocation_start(&state, offset) =>
            {
                size
            }
            _ => self.corrupted(
                &state,
                format_args!("size query for large object {ptr:p} which was not live"),
            ),
        }
    }

    fn usable_size(&self, ptr: *const u8) -> usize {
        self.allocation_size(ptr) - HEADER_SIZE
    }

    fn contains(&self, ptr: *const u8) -> bool {
        self.state.with_shared(|_| {
            self.map.has_address(ptr)
                && (ptr as usize) < self.map.begin() as usize + self.capacity
        })
    }

    fn walk(&self, callback: &mut dyn FnMut(*mut u8, *mut u8, usize)) {
        let state = self.state.lock();
        for region in self.regions_locked(&state) {
            if let Region::Allocated(range) = region {
                callback(
                    (range.start + HEADER_SIZE) as *mut u8,
                    range.end as *mut u8,
                    range.len(),
                );
                callback(ptr::null_mut(), ptr::null_mut(), 0);
            }
        }
    }

    fn dump(&self, out: &mut dyn fmt::Write) -> fmt::Result {
        let state = self.state.lock();
        self.dump_locked(&state, out)
    }

    fn log_fragmentation_alloc_failure(
        &self,
        out: &mut dyn fmt::Write,
        failed_bytes: usize,
    ) -> fmt::Result {
        let state = self.state.lock();
        let largest_gap = state.free_blocks.last().map_or(0, |&(gap, _)| gap);
        let largest = largest_gap.max(state.free_end);
        let free_bytes = self.capacity - self.core.stats().bytes_allocated();
        write!(
            out,
            "Failed to allocate {} bytes in {}: {} bytes free in {} gaps and a {} byte \
             trailing region, largest contiguous free chunk is {} bytes ({} usable)",
            failed_bytes,
            self.core.name(),
            free_bytes,
            state.free_blocks.len(),
            state.free_end,
            largest,
            largest.saturating_sub(HEADER_SIZE)
        )
    }
}

impl fmt::Debug for FreeListSpace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FreeListSpace")
            .field("name", &self.core.name())
            .field("map", &self.map)
            .field("alignment", &self.alignment)
            .field("objects", &self.core.stats().objects_allocated())
            .field("bytes", &self.core.stats().bytes_allocated())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::space::SweepResult;
    use rand::{Rng, SeedableRng, rngs::StdRng};
    use std::sync::Arc;

    fn space(capacity: usize, alignment: usize) -> FreeListSpace {
        FreeListSpace::create_with_checks("free list test", None, capacity, alignment, true)
            .expect("create space")
    }

    fn alloc(space: &FreeListSpace, bytes: usize) -> *mut u8 {
        space.alloc(bytes).expect("alloc").ptr.as_ptr()
    }

    fn header_of(ptr: *mut u8) -> usize {
        ptr as usize - HEADER_SIZE
    }

    /// Regions cover the space exactly, no two free regions touch, and the
    /// live bytes match the counters.
    fn assert_tiles(space: &FreeListSpace) {
        let regions = space.regions();
        let mut cursor = space.begin() as usize;
        let mut live = 0;
        for region in &regions {
            let range = region.range();
            assert_eq!(range.start, cursor, "hole or overlap in {regions:#x?}");
            assert!(range.start < range.end);
            if !region.is_free() {
                live += range.len();
            }
            cursor = range.end;
        }
        assert_eq!(cursor, space.end() as usize);
        for pair in regions.windows(2) {
            assert!(
                !(pair[0].is_free() && pair[1].is_free()),
                "uncoalesced free regions {pair:#x?}"
            );
        }
        assert_eq!(live, space.bytes_allocated());
    }

    #[test]
    fn header_is_two_words() {
        assert_eq!(HEADER_SIZE, 2 * mem::size_of::<usize>());
        assert_eq!(AllocationHeader::default().slot(), Slot::Free);
    }

    #[test]
    fn create_validates_geometry() {
        for (capacity, alignment) in [(4096, 24), (4096, 8), (0, 16), (4100, 16)] {
            let err = FreeListSpace::create("bad", None, capacity, alignment)
                .expect_err("invalid geometry");
            assert!(matches!(err, SpaceError::InvalidSettings(_)));
        }
    }

    #[test]
    fn fresh_space_is_one_trailing_region() {
        let space = space(16 * page_size(), page_size());
        assert_eq!(space.free_end(), space.capacity());
        assert_eq!(
            space.regions(),
            vec![Region::Free(space.begin() as usize..space.end() as usize)]
        );
    }

    #[test]
    fn alloc_carves_trailing_region_in_address_order() {
        let page = page_size();
        let space = space(16 * page, page);
        let a = space.alloc(100).expect("alloc");
        let b = space.alloc(page).expect("alloc");

        assert_eq!(a.ptr.as_ptr() as usize, space.begin() as usize + HEADER_SIZE);
        assert_eq!(a.bytes_allocated, page);
        assert_eq!(a.usable_size, page - HEADER_SIZE);
        // the header pushes an exact page request into a second page
        assert_eq!(b.bytes_allocated, 2 * page);
        assert_eq!(header_of(b.ptr.as_ptr()), space.begin() as usize + page);
        assert_eq!(space.free_end(), 13 * page);
        assert_eq!(space.allocation_size(b.ptr.as_ptr()), 2 * page);
        assert_eq!(space.usable_size(b.ptr.as_ptr()), 2 * page - HEADER_SIZE);
        assert_tiles(&space);
    }

    #[test]
    fn freeing_last_object_extends_trailing_region() {
        let page = page_size();
        let space = space(8 * page, page);
        let a = alloc(&space, 10);
        assert_eq!(space.free(a), page);
        assert_eq!(space.free_end(), 8 * page);
        assert_eq!(space.objects_allocated(), 0);
        assert_eq!(space.bytes_allocated(), 0);
        assert_eq!(space.total_objects_allocated(), 1);
        assert_tiles(&space);
    }

    #[test]
    fn round_trip_reuses_the_same_slot() {
        let space = space(8 * 4096, 16);
        let keep = alloc(&space, 64);
        let a = alloc(&space, 500);
        let tail = alloc(&space, 64);
        space.free(a);
        assert_eq!(alloc(&space, 500), a);
        assert_tiles(&space);
        space.free(keep);
        space.free(tail);
        assert_tiles(&space);
    }

    #[test]
    fn freed_memory_reads_back_as_zero() {
        let page = page_size();
        for alignment in [16, page] {
            let space = space(16 * page, alignment);
            let first = space.alloc(3 * page).expect("alloc");
            let _guard = alloc(&space, 10);
            // SAFETY: the object owns its usable bytes
            unsafe { ptr::write_bytes(first.ptr.as_ptr(), 0xff, first.usable_size) };
            space.free(first.ptr.as_ptr());

            let again = space.alloc(3 * page).expect("alloc");
            assert_eq!(again.ptr, first.ptr);
            // SAFETY: as above
            let bytes = unsafe {
                std::slice::from_raw_parts(again.ptr.as_ptr(), again.usable_size)
            };
            assert!(bytes.iter().all(|&b| b == 0));
        }
    }

    #[test]
    fn adjacent_frees_coalesce_in_either_order() {
        let page = page_size();
        for order in [[0, 1], [1, 0]] {
            let space = space(32 * page, page);
            let objs = [alloc(&space, page), alloc(&space, 3 * page)];
            let c = alloc(&space, 10);
            let begin = space.begin() as usize;

            space.free(objs[order[0]]);
            space.free(objs[order[1]]);
            assert_eq!(
                space.regions(),
                vec![
                    Region::Free(begin..begin + 6 * page),
                    Region::Allocated(begin + 6 * page..begin + 7 * page),
                    Region::Free(begin + 7 * page..begin + 32 * page),
                ]
            );
            assert_tiles(&space);

            space.free(c);
            assert_eq!(space.free_end(), 32 * page);
            assert_tiles(&space);
        }
    }

    #[test]
    fn free_before_a_free_run_scans_to_the_next_allocation() {
        let space = space(4 * 4096, 16);
        let a = alloc(&space, 100);
        let b = alloc(&space, 200);
        let c = alloc(&space, 300);
        let d = alloc(&space, 40);
        let begin = space.begin() as usize;

        space.free(c);
        // b's successor is free, the merged gap lands on d
        space.free(b);
        space.free(a);
        let d_header = header_of(d);
        assert_eq!(
            space.regions()[..2],
            [
                Region::Free(begin..d_header),
                Region::Allocated(d_header..d_header + 64),
            ]
        );
        assert_tiles(&space);

        // the merged gap is one free block, a request spanning it fits
        assert_eq!(alloc(&space, d_header - begin - HEADER_SIZE), a);
        assert_tiles(&space);
    }

    #[test]
    fn best_fit_picks_smallest_sufficient_gap() {
        let space = space(4096, 16);
        let a = alloc(&space, 32); // 48 byte slot
        let _b = alloc(&space, 1);
        let c = alloc(&space, 96); // 112 byte slot
        let _d = alloc(&space, 1);
        let e = alloc(&space, 48); // 64 byte slot
        let _f = alloc(&space, 1);
        for obj in [a, c, e] {
            space.free(obj);
        }
        assert_tiles(&space);

        let got = space.alloc(48).expect("alloc");
        assert_eq!(got.bytes_allocated, 64);
        assert_eq!(got.ptr.as_ptr(), e);
        assert_tiles(&space);

        // a smaller request splits the 48 byte gap and leaves 16 behind
        let small = space.alloc(8).expect("alloc");
        assert_eq!(small.bytes_allocated, 32);
        assert_eq!(small.ptr.as_ptr(), a);
        assert!(
            space
                .regions()
                .contains(&Region::Free(header_of(a) + 32..header_of(a) + 48))
        );
        assert_tiles(&space);
    }

    #[test]
    fn exhaustion_is_reported_not_fatal() {
        let page = page_size();
        let space = space(4 * page, page);
        let a = alloc(&space, 2 * page);
        let err = space.alloc(2 * page).expect_err("no room");
        assert!(matches!(
            err,
            AllocError::OutOfSpace { required, free_end, .. }
                if required == 3 * page && free_end == page
        ));

        let mut report = String::new();
        space
            .log_fragmentation_alloc_failure(&mut report, 2 * page)
            .expect("report");
        assert!(report.contains(&format!("largest contiguous free chunk is {page} bytes")));

        space.free(a);
        assert!(space.alloc(2 * page).is_ok());
    }

    #[test]
    fn overflowing_request_is_an_error() {
        let space = space(4096, 16);
        assert!(matches!(
            space.alloc(usize::MAX - 4),
            Err(AllocError::Overflow { .. })
        ));
    }

    #[test]
    #[should_panic(expected = "which was not live")]
    fn double_free_is_fatal() {
        let space = space(4096, 16);
        let a = alloc(&space, 10);
        let _b = alloc(&space, 10);
        space.free(a);
        space.free(a);
    }

    #[test]
    #[should_panic(expected = "is not in this space")]
    fn free_of_foreign_pointer_is_fatal() {
        let space = space(4096, 16);
        let mut local = [0u8; 64];
        space.free(local.as_mut_ptr());
    }

    #[test]
    #[should_panic(expected = "which was not live")]
    fn free_in_trailing_region_is_fatal() {
        let space = space(4096, 16);
        let a = alloc(&space, 10);
        space.free(a.wrapping_add(64));
    }

    /// Makes the first payload bytes of `obj` read like a live header.
    fn forge_header(obj: *mut u8, allocation_size: usize) {
        // SAFETY: obj is live with at least a header worth of usable bytes
        unsafe {
            obj.cast::<AllocationHeader>().write(AllocationHeader {
                prev_free: 0,
                allocation_size,
            })
        };
    }

    #[test]
    #[should_panic(expected = "which was not live")]
    fn free_of_pointer_into_a_payload_is_fatal() {
        let space = space(4096, 16);
        let a = alloc(&space, 100); // 128 byte slot
        let _b = alloc(&space, 10);
        forge_header(a, 112);
        space.free(a.wrapping_add(HEADER_SIZE));
    }

    #[test]
    fn forged_header_does_not_disturb_accounting() {
        let space = space(4096, 16);
        let a = alloc(&space, 100);
        let b = alloc(&space, 10);
        forge_header(a, 112);
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            space.free(a.wrapping_add(HEADER_SIZE))
        }));
        assert!(result.is_err());
        assert_eq!(space.bytes_allocated(), 128 + 32);
        assert_eq!(space.allocation_size(a), 128);
        assert_eq!(space.allocation_size(b), 32);
        assert_tiles(&space);
    }

    #[test]
    #[should_panic(expected = "which was not live")]
    fn size_query_into_a_payload_is_fatal() {
        let space = space(4096, 16);
        let a = alloc(&space, 100);
        let _b = alloc(&space, 10);
        forge_header(a, 112);
        space.allocation_size(a.wrapping_add(HEADER_SIZE));
    }

    #[test]
    #[should_panic(expected = "size query for large object")]
    fn size_query_of_freed_object_is_fatal() {
        let space = space(4096, 16);
        let a = alloc(&space, 10);
        let _b = alloc(&space, 10);
        space.free(a);
        space.allocation_size(a);
    }

    #[test]
    #[should_panic(expected = "is not an object of this space")]
    fn size_query_of_foreign_pointer_is_fatal() {
        let space = space(4096, 16);
        let local = [0u8; 64];
        space.allocation_size(local.as_ptr());
    }

    #[test]
    fn walk_reports_allocations_with_sentinels() {
        let space = space(4096, 16);
        let a = alloc(&space, 10);
        let b = alloc(&space, 100);
        let c = alloc(&space, 10);
        space.free(b);

        let mut seen = Vec::new();
        space.walk(&mut |start, end, size| seen.push((start, end, size)));
        let null = ptr::null_mut();
        assert_eq!(
            seen,
            vec![
                (a, a.wrapping_add(16), 32),
                (null, null, 0),
                (c, c.wrapping_add(16), 32),
                (null, null, 0),
            ]
        );
    }

    #[test]
    fn dump_lists_gaps_objects_and_tail() {
        let space = space(4096, 16);
        let a = alloc(&space, 10);
        let _b = alloc(&space, 10);
        space.free(a);
        let mut out = String::new();
        space.dump(&mut out).expect("dump");
        let lines: Vec<_> = out.lines().collect();
        assert_eq!(lines.len(), 4);
        assert!(lines[0].starts_with("free list test - begin: "));
        assert!(lines[1].starts_with("Free block at address: "));
        assert!(lines[1].ends_with("of length 32 bytes"));
        assert!(lines[2].ends_with("of length 16 bytes"));
        assert!(lines[3].ends_with(&format!("of length {} bytes", 4096 - 64)));
    }

    #[test]
    fn contains_is_an_address_range_test() {
        let space = space(4096, 16);
        let a = alloc(&space, 10);
        assert!(space.contains(a));
        assert!(space.contains(space.begin()));
        assert!(!space.contains(space.end()));
        space.free(a);
        assert!(space.contains(a));
    }

    #[test]
    fn contains_inside_walk_does_not_relock() {
        let space = space(4096, 16);
        let a = alloc(&space, 10);
        let mut seen = Vec::new();
        space.walk(&mut |start, _, _| {
            if !start.is_null() {
                seen.push(space.contains(start));
            }
        });
        assert_eq!(seen, vec![true]);
        assert!(space.contains(a));
    }

    #[test]
    fn sweep_frees_unmarked_objects() {
        let space = space(4096, 16);
        let a = alloc(&space, 10);
        let b = alloc(&space, 50);
        let c = alloc(&space, 100);
        for obj in [a, b, c] {
            space.live_bitmap_mut().set(obj);
        }
        space.mark_bitmap_mut().set(b);

        assert_eq!(space.sweep(false), SweepResult::new(2, 32 + 128));
        assert_eq!(space.objects_allocated(), 1);
        assert_eq!(space.allocation_size(b), 80);
        assert!(!space.live_bitmap().test(a));
        assert!(space.live_bitmap().test(b));
        assert!(!space.live_bitmap().test(c));
        let begin = space.begin() as usize;
        assert_eq!(space.regions()[0], Region::Free(begin..begin + 32));
        assert_tiles(&space);
    }

    #[test]
    fn tiling_survives_random_workload() {
        let space = space(64 * 4096, 16);
        let mut live: Vec<*mut u8> = Vec::new();
        let mut rng = StdRng::seed_from_u64(0x2545_f491_4f6c_dd1d);
        for _ in 0..2000 {
            if live.is_empty() || rng.random_ratio(2, 3) {
                match space.alloc(rng.random_range(0..3000)) {
                    Ok(obj) => live.push(obj.ptr.as_ptr()),
                    Err(AllocError::OutOfSpace { .. }) => {}
                    Err(err) => panic!("unexpected error {err}"),
                }
            } else {
                let victim = live.swap_remove(rng.random_range(0..live.len()));
                space.free(victim);
            }
            assert_tiles(&space);
        }
        for obj in live {
            space.free(obj);
        }
        assert_eq!(space.free_end(), space.capacity());
    }

    #[test]
    fn concurrent_alloc_and_free() {
        let space = Arc::new(space(256 * 4096, 16));
        let threads: Vec<_> = (0..4)
            .map(|t| {
                let space = space.clone();
                std::thread::spawn(move || {
                    let mut kept = Vec::new();
                    for i in 0..200 {
                        let obj = space.alloc(64 + t * 32 + i).expect("alloc");
                        if i % 3 == 0 {
                            kept.push(obj);
                        } else {
                            space.free(obj.ptr.as_ptr());
                        }
                    }
                    kept.iter().map(|obj| obj.bytes_allocated).sum::<usize>()
                })
            })
            .collect();
        let live: usize = threads
            .into_iter()
            .map(|t| t.join().expect("thread panicked"))
            .sum();
        assert_eq!(space.bytes_allocated(), live);
        assert_eq!(space.total_objects_allocated(), 800);
        assert_tiles(&space);
    }
}
