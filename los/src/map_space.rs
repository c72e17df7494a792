//! Large object space backed by one anonymous mapping per object.

use std::{fmt, ptr::NonNull};

use indexmap::IndexMap;

use crate::{
    error::AllocError,
    lock::SpaceLock,
    space::{Allocation, LargeObjectSpace, SpaceCore, heap_corruption},
    system::{MemMap, Protection, page_size},
};

/// Object address to the mapping that backs it, in allocation order.
type ObjectTable = IndexMap<usize, MemMap>;

pub struct LargeObjectMapSpace {
    core: SpaceCore,
    objects: SpaceLock<ObjectTable>,
}

impl LargeObjectMapSpace {
    pub fn new(name: &str) -> Self {
        Self::with_debug_checks(name, cfg!(debug_assertions))
    }

    pub fn with_debug_checks(name: &str, debug_checks: bool) -> Self {
        Self {
            // the extent starts empty and grows with the first allocation
            core: SpaceCore::new(name, 0, 0, page_size(), debug_checks),
            objects: SpaceLock::new("large object map space lock", IndexMap::new()),
        }
    }

    fn dump_locked(&self, objects: &ObjectTable, out: &mut dyn fmt::Write) -> fmt::Result {
        writeln!(
            out,
            "{} map space [{:#x}, {:#x}) {} objects {} bytes",
            self.core.name(),
            self.core.begin(),
            self.core.end(),
            objects.len(),
            self.core.stats().bytes_allocated()
        )?;
        for (&addr, map) in objects {
            writeln!(
                out,
                "Large object at address {:#x} of length {} bytes",
                addr,
                map.size()
            )?;
        }
        Ok(())
    }

    #[cold]
    #[track_caller]
    fn not_live(&self, objects: &ObjectTable, ptr: *const u8, action: &str) -> ! {
        let mut dump = String::new();
        let _ = self.dump_locked(objects, &mut dump);
        heap_corruption(
            &dump,
            format_args!(
                "Attempted to {action} large object {ptr:p} which was not live"
            ),
        )
    }
}

impl LargeObjectSpace for LargeObjectMapSpace {
    fn core(&self) -> &SpaceCore {
        &self.core
    }

    fn alloc(&self, num_bytes: usize) -> Result<Allocation, AllocError> {
        let map = MemMap::map_anonymous(
            "large object space allocation",
            None,
            num_bytes,
            Protection::READ_WRITE,
        )
        .inspect_err(|err| {
            log::warn!("large object allocation of {num_bytes} bytes failed: {err}");
        })?;

        let obj = map.begin();
        let size = map.size();
        let addr = obj as usize;

        let mut objects = self.objects.lock();
        objects.insert(addr, map);
        self.core.widen(addr, addr + size);
        self.core.stats().record_alloc(size);
        debug_assert!(self.contains(obj));
        drop(objects);

        log::trace!("{}: allocated {size} bytes at {obj:p}", self.core.name());
        Ok(Allocation {
            // SAFETY: MemMap::begin is never null
            ptr: unsafe { NonNull::new_unchecked(obj) },
            bytes_allocated: size,
            usable_size: size,
        })
    }

    fn free(&self, ptr: *mut u8) -> usize {
        let mut objects = self.objects.lock();
        let Some(size) = objects.get(&(ptr as usize)).map(MemMap::size) else {
            self.not_live(&objects, ptr, "free")
        };
        self.core.stats().record_free(size);
        // unmaps
        objects.shift_remove(&(ptr as usize));
        log::trace!("{}: freed {size} bytes at {ptr:p}", self.core.name());
        size
    }

    fn allocation_size(&self, ptr: *const u8) -> usize {
        let objects = self.objects.lock();
        match objects.get(&(ptr as usize)) {
            Some(map) => map.size(),
            None => self.not_live(&objects, ptr, "query the size of"),
        }
    }

    fn usable_size(&self, ptr: *const u8) -> usize {
        self.allocation_size(ptr)
    }

    fn contains(&self, ptr: *const u8) -> bool {
        self.objects
            .with_shared(|objects| objects.contains_key(&(ptr as usize)))
    }

    fn walk(&self, callback: &mut dyn FnMut(*mut u8, *mut u8, usize)) {
        let objects = self.objects.lock();
        for map in objects.values() {
            callback(map.begin(), map.end(), map.size());
            callback(std::ptr::null_mut(), std::ptr::null_mut(), 0);
        }
    }

    fn dump(&self, out: &mut dyn fmt::Write) -> fmt::Result {
        let objects = self.objects.lock();
        self.dump_locked(&objects, out)
    }

    fn log_fragmentation_alloc_failure(
        &self,
        out: &mut dyn fmt::Write,
        failed_bytes: usize,
    ) -> fmt::Result {
        let objects = self.objects.lock();
        write!(
            out,
            "Failed to allocate {} bytes in {}: every object has its own mapping, \
             {} mappings with {} bytes are live",
            failed_bytes,
            self.core.name(),
            objects.len(),
            self.core.stats().bytes_allocated()
        )
    }
}

impl fmt::Debug for LargeObjectMapSpace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LargeObjectMapSpace")
            .field("name", &self.core.name())
            .field("objects", &self.core.stats().objects_allocated())
            .field("bytes", &self.core.stats().bytes_allocated())
            .finish()
    }
}
