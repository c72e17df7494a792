//! Behaviour shared by every large object space.
//!
//! [`SpaceCore`] carries the state all spaces have in common: the covered
//! extent, allocation counters and the live/mark bitmap pair. The
//! [`LargeObjectSpace`] trait is implemented by the concrete spaces and
//! provides the sweep protocol on top of their `free`.

use std::{
    fmt,
    ops::AddAssign,
    ptr::NonNull,
    sync::atomic::{AtomicUsize, Ordering},
};

use parking_lot::{
    MappedRwLockReadGuard, MappedRwLockWriteGuard, RwLock, RwLockReadGuard,
    RwLockWriteGuard,
};

use crate::{bitmap::LargeObjectBitmap, error::AllocError};

/// Result of a successful allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Allocation {
    pub ptr: NonNull<u8>,
    /// Bytes charged to the space for this object.
    pub bytes_allocated: usize,
    /// Bytes the mutator may use starting at `ptr`.
    pub usable_size: usize,
}

/// Objects and bytes reclaimed by a sweep.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepResult {
    pub objects: usize,
    pub bytes: usize,
}

impl SweepResult {
    pub fn new(objects: usize, bytes: usize) -> Self {
        Self { objects, bytes }
    }
}

impl AddAssign for SweepResult {
    fn add_assign(&mut self, rhs: Self) {
        self.objects += rhs.objects;
        self.bytes += rhs.bytes;
    }
}

#[derive(Debug)]
pub struct BitmapPair {
    pub live: LargeObjectBitmap,
    pub mark: LargeObjectBitmap,
}

/// Allocation counters. Written only while the owning space's lock is
/// held, readable at any time.
#[derive(Debug, Default)]
pub struct AllocStats {
    num_bytes_allocated: AtomicUsize,
    num_objects_allocated: AtomicUsize,
    total_bytes_allocated: AtomicUsize,
    total_objects_allocated: AtomicUsize,
}

impl AllocStats {
    pub fn record_alloc(&self, bytes: usize) {
        self.num_bytes_allocated.fetch_add(bytes, Ordering::Relaxed);
        self.num_objects_allocated.fetch_add(1, Ordering::Relaxed);
        self.total_bytes_allocated.fetch_add(bytes, Ordering::Relaxed);
        self.total_objects_allocated.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_free(&self, bytes: usize) {
        let live_bytes = self.num_bytes_allocated.load(Ordering::Relaxed);
        let live_objects = self.num_objects_allocated.load(Ordering::Relaxed);
        assert!(
            bytes <= live_bytes && live_objects > 0,
            "freeing {bytes} bytes with only {live_bytes} bytes in {live_objects} objects allocated"
        );
        self.num_bytes_allocated.store(live_bytes - bytes, Ordering::Relaxed);
        self.num_objects_allocated
            .store(live_objects - 1, Ordering::Relaxed);
    }

    pub fn bytes_allocated(&self) -> usize {
        self.num_bytes_allocated.load(Ordering::Relaxed)
    }

    pub fn objects_allocated(&self) -> usize {
        self.num_objects_allocated.load(Ordering::Relaxed)
    }

    pub fn total_bytes_allocated(&self) -> usize {
        self.total_bytes_allocated.load(Ordering::Relaxed)
    }

    pub fn total_objects_allocated(&self) -> usize {
        self.total_objects_allocated.load(Ordering::Relaxed)
    }
}

/// State shared by all large object spaces.
#[derive(Debug)]
pub struct SpaceCore {
    name: String,
    /// Covered extent, widened on allocation and never shrunk. Empty while
    /// `begin >= end`.
    begin: AtomicUsize,
    end: AtomicUsize,
    stats: AllocStats,
    bitmaps: RwLock<BitmapPair>,
    debug_checks: bool,
}

impl SpaceCore {
    pub fn new(
        name: &str,
        begin: usize,
        end: usize,
        object_alignment: usize,
        debug_checks: bool,
    ) -> Self {
        let live = LargeObjectBitmap::new(
            format!("large live objects bitmap {name}"),
            object_alignment,
        );
        let mark = LargeObjectBitmap::new(
            format!("large marked objects bitmap {name}"),
            object_alignment,
        );
        Self {
            name: name.to_owned(),
            begin: AtomicUsize::new(begin),
            end: AtomicUsize::new(end),
            stats: AllocStats::default(),
            bitmaps: RwLock::new(BitmapPair { live, mark }),
            debug_checks,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn begin(&self) -> usize {
        self.begin.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn end(&self) -> usize {
        self.end.load(Ordering::Relaxed)
    }

    /// Grows the extent so it covers `[begin, end)`. Call with the space
    /// lock held.
    pub fn widen(&self, begin: usize, end: usize) {
        let cur_begin = self.begin();
        let cur_end = self.end();
        if cur_begin >= cur_end {
            self.begin.store(begin, Ordering::Relaxed);
            self.end.store(end, Ordering::Relaxed);
            return;
        }
        if begin < cur_begin {
            self.begin.store(begin, Ordering::Relaxed);
        }
        if end > cur_end {
            self.end.store(end, Ordering::Relaxed);
        }
    }

    pub fn stats(&self) -> &AllocStats {
        &self.stats
    }

    pub fn bitmaps(&self) -> &RwLock<BitmapPair> {
        &self.bitmaps
    }

    pub fn debug_checks(&self) -> bool {
        self.debug_checks
    }
}

/// Logs the diagnostic dump and aborts the current operation. Used for
/// heap consistency violations only.
#[cold]
#[track_caller]
pub(crate) fn heap_corruption(dump: &str, message: fmt::Arguments<'_>) -> ! {
    log::error!("{dump}");
    panic!("{message}");
}

/// A space for objects too big for the regular heap.
///
/// Implementors provide allocation and release. Sweeping, bitmap
/// management and statistics come from the provided methods.
pub trait LargeObjectSpace: fmt::Debug + Send + Sync {
    fn core(&self) -> &SpaceCore;

    /// Allocates at least `num_bytes`. Failure is recoverable.
    fn alloc(&self, num_bytes: usize) -> Result<Allocation, AllocError>;

    /// Frees an object returned by `alloc`, returns the bytes reclaimed.
    /// Panics if `ptr` is not a live object of this space.
    fn free(&self, ptr: *mut u8) -> usize;

    /// Bytes charged for the live object at `ptr`.
    fn allocation_size(&self, ptr: *const u8) -> usize;

    fn usable_size(&self, ptr: *const u8) -> usize;

    fn contains(&self, ptr: *const u8) -> bool;

    /// Calls `callback(start, end, size)` for every live object followed by
    /// `callback(null, null, 0)`.
    fn walk(&self, callback: &mut dyn FnMut(*mut u8, *mut u8, usize));

    fn dump(&self, out: &mut dyn fmt::Write) -> fmt::Result;

    /// Explains why an allocation of `failed_bytes` could not be served.
    fn log_fragmentation_alloc_failure(
        &self,
        out: &mut dyn fmt::Write,
        failed_bytes: usize,
    ) -> fmt::Result;

    fn name(&self) -> &str {
        self.core().name()
    }

    fn begin(&self) -> *mut u8 {
        self.core().begin() as *mut u8
    }

    fn end(&self) -> *mut u8 {
        self.core().end() as *mut u8
    }

    fn bytes_allocated(&self) -> usize {
        self.core().stats().bytes_allocated()
    }

    fn objects_allocated(&self) -> usize {
        self.core().stats().objects_allocated()
    }

    fn total_bytes_allocated(&self) -> usize {
        self.core().stats().total_bytes_allocated()
    }

    fn total_objects_allocated(&self) -> usize {
        self.core().stats().total_objects_allocated()
    }

    fn live_bitmap(&self) -> MappedRwLockReadGuard<'_, LargeObjectBitmap> {
        RwLockReadGuard::map(self.core().bitmaps().read(), |pair| &pair.live)
    }

    fn mark_bitmap(&self) -> MappedRwLockReadGuard<'_, LargeObjectBitmap> {
        RwLockReadGuard::map(self.core().bitmaps().read(), |pair| &pair.mark)
    }

    fn live_bitmap_mut(&self) -> MappedRwLockWriteGuard<'_, LargeObjectBitmap> {
        RwLockWriteGuard::map(self.core().bitmaps().write(), |pair| {
            &mut pair.live
        })
    }

    fn mark_bitmap_mut(&self) -> MappedRwLockWriteGuard<'_, LargeObjectBitmap> {
        RwLockWriteGuard::map(self.core().bitmaps().write(), |pair| {
            &mut pair.mark
        })
    }

    /// Exchanges live and mark bitmaps. Names stay with their role.
    fn swap_bitmaps(&self) {
        let mut bitmaps = self.core().bitmaps().write();
        let pair = &mut *bitmaps;
        std::mem::swap(&mut pair.live, &mut pair.mark);
        let live_name = pair.live.name().to_owned();
        pair.live.set_name(pair.mark.name().to_owned());
        pair.mark.set_name(live_name);
    }

    fn copy_live_to_marked(&self) {
        let mut bitmaps = self.core().bitmaps().write();
        let pair = &mut *bitmaps;
        pair.mark.copy_from(&pair.live);
    }

    /// Frees every object in `ptrs`, returns the bytes reclaimed.
    fn free_list(&self, ptrs: &[*mut u8]) -> usize {
        let mut total = 0;
        for &ptr in ptrs {
            if self.core().debug_checks() && !self.contains(ptr) {
                let mut dump = String::new();
                let _ = self.dump(&mut dump);
                heap_corruption(
                    &dump,
                    format_args!(
                        "{} does not contain {:p} passed to free_list",
                        self.name(),
                        ptr
                    ),
                );
            }
            total += self.free(ptr);
        }
        total
    }

    /// Frees objects set in the live bitmap but not in the mark bitmap.
    ///
    /// With `swap_bitmaps` the roles are read the other way round, which is
    /// the state after the collector already swapped them. Otherwise the
    /// freed objects are also cleared from the live bitmap. Mutators must be
    /// stopped for the duration.
    fn sweep(&self, swap_bitmaps: bool) -> SweepResult {
        let begin = self.core().begin();
        let end = self.core().end();
        if begin >= end {
            return SweepResult::default();
        }

        let mut freed = SweepResult::default();
        let mut bitmaps = self.core().bitmaps().write();
        let pair = &mut *bitmaps;
        let (live, mark) = if swap_bitmaps {
            (&pair.mark, &pair.live)
        } else {
            (&pair.live, &pair.mark)
        };

        let mut dead = Vec::new();
        LargeObjectBitmap::sweep_walk(live, mark, begin, end, |batch| {
            if !swap_bitmaps {
                dead.extend_from_slice(batch);
            }
            freed += SweepResult::new(batch.len(), self.free_list(batch));
        });
        // the live bitmap is not going to be swapped in as mark
        for ptr in dead {
            pair.live.clear(ptr);
        }

        log::debug!(
            "swept {}: freed {} objects, {} bytes",
            self.name(),
            freed.objects,
            freed.bytes
        );
        freed
    }
}
