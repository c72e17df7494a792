//! Large object spaces for a non-moving mark-sweep heap.
//!
//! Objects too big for the regular heap are allocated here, either one
//! mapping per object ([`LargeObjectMapSpace`], optionally wrapped in
//! [`GuardedMapSpace`]) or from one reserved mapping managed by an in-band
//! free list ([`FreeListSpace`]). Both are used through the
//! [`LargeObjectSpace`] trait, which also provides sweeping against the
//! live/mark bitmap pair.

mod bitmap;
mod error;
mod free_list;
mod guarded;
mod lock;
mod map_space;
mod settings;
mod space;
mod system;

pub use bitmap::{LargeObjectBitmap, SWEEP_BATCH_SIZE};
pub use error::{AllocError, MapError, SpaceError};
pub use free_list::{AllocationHeader, FreeListSpace, HEADER_SIZE, Region, Slot};
pub use guarded::GuardedMapSpace;
pub use lock::{SpaceGuard, SpaceLock};
pub use map_space::LargeObjectMapSpace;
pub use settings::{SpaceKind, SpaceSettings, create_space};
pub use space::{
    AllocStats, Allocation, BitmapPair, LargeObjectSpace, SpaceCore, SweepResult,
};
pub use system::{
    MemMap, OS_PAGE_SIZE, Protection, page_size, protect, release_pages,
    round_down, round_up,
};
