//! Configuration of a large object space and the factory that builds one.

use std::ptr::NonNull;

use crate::{
    error::SpaceError,
    free_list::{FreeListSpace, HEADER_SIZE},
    guarded::GuardedMapSpace,
    map_space::LargeObjectMapSpace,
    space::LargeObjectSpace,
    system::{OS_PAGE_SIZE, page_size},
};

/// Allocation strategy of a large object space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SpaceKind {
    /// One anonymous mapping per object.
    #[default]
    Map,
    /// One reserved mapping split by an in-band free list.
    FreeList,
}

#[derive(Debug, Clone)]
pub struct SpaceSettings {
    pub kind: SpaceKind,
    /// Bytes reserved up front by the free list space. Must be a multiple
    /// of `alignment`. Ignored by the map space.
    pub capacity: usize,
    /// Slot alignment of the free list space, a power of two of at least
    /// the header size.
    pub alignment: usize,
    /// Surround map space objects with inaccessible pages.
    pub guard_pages: bool,
    /// Containment checks on free and read-only protection of freed pages.
    pub debug_checks: bool,
    /// Address hint for the free list mapping.
    pub requested_begin: Option<NonNull<u8>>,
}

impl Default for SpaceSettings {
    fn default() -> Self {
        Self {
            kind: SpaceKind::Map,
            capacity: 64 * 1024 * 1024, // 64 MB
            alignment: OS_PAGE_SIZE,
            guard_pages: false,
            debug_checks: cfg!(debug_assertions),
            requested_begin: None,
        }
    }
}

impl SpaceSettings {
    pub fn validate(&self) -> Result<(), &'static str> {
        match self.kind {
            SpaceKind::Map => Ok(()),
            SpaceKind::FreeList => {
                if self.guard_pages {
                    return Err("guard pages are only supported by the map space");
                }
                if !self.alignment.is_power_of_two() || self.alignment < HEADER_SIZE {
                    return Err("alignment must be a power of two of at least the header size");
                }
                if self.capacity == 0 {
                    return Err("capacity must be > 0");
                }
                if !self.capacity.is_multiple_of(self.alignment) {
                    return Err("capacity must be a multiple of alignment");
                }
                if !self.capacity.is_multiple_of(page_size()) {
                    return Err("capacity must match OS page alignment");
                }
                Ok(())
            }
        }
    }
}

/// Builds the space described by `settings`.
pub fn create_space(
    name: &str,
    settings: &SpaceSettings,
) -> Result<Box<dyn LargeObjectSpace>, SpaceError> {
    settings.validate().map_err(SpaceError::InvalidSettings)?;
    let space: Box<dyn LargeObjectSpace> = match settings.kind {
        SpaceKind::Map if settings.guard_pages => {
            Box::new(GuardedMapSpace::with_debug_checks(name, settings.debug_checks))
        }
        SpaceKind::Map => Box::new(LargeObjectMapSpace::with_debug_checks(
            name,
            settings.debug_checks,
        )),
        SpaceKind::FreeList => Box::new(FreeListSpace::create_with_checks(
            name,
            settings.requested_begin,
            settings.capacity,
            settings.alignment,
            settings.debug_checks,
        )?),
    };
    log::debug!("created {:?} large object space {name}", settings.kind);
    Ok(space)
}
