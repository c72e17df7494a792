//! Live/mark bitmaps for large objects.
//!
//! Large objects are few and can sit anywhere in the address space (one
//! mapping each for the map space), so the bitmap is sparse: 64-bit words
//! keyed by word index in a `BTreeMap`. One bit covers `alignment` bytes,
//! iteration is in address order.

use std::collections::BTreeMap;

const BITS_PER_WORD: usize = u64::BITS as usize;

/// Maximum number of addresses handed to a sweep callback at once.
pub const SWEEP_BATCH_SIZE: usize = 256;

#[derive(Debug, Clone)]
pub struct LargeObjectBitmap {
    name: String,
    alignment: usize,
    words: BTreeMap<usize, u64>,
}

impl LargeObjectBitmap {
    pub fn new(name: impl Into<String>, alignment: usize) -> Self {
        assert!(
            alignment.is_power_of_two(),
            "bitmap alignment must be a power of two"
        );
        Self {
            name: name.into(),
            alignment,
            words: BTreeMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    pub fn alignment(&self) -> usize {
        self.alignment
    }

    #[inline]
    fn index_of(&self, addr: usize) -> (usize, u64) {
        debug_assert!(
            addr.is_multiple_of(self.alignment),
            "{:#x} is not aligned for {}",
            addr,
            self.name
        );
        let bit = addr / self.alignment;
        (bit / BITS_PER_WORD, 1u64 << (bit % BITS_PER_WORD))
    }

    #[inline]
    fn address_of(&self, word: usize, bit: u32) -> usize {
        (word * BITS_PER_WORD + bit as usize) * self.alignment
    }

    /// Sets the bit for `ptr`, returns whether it was set before.
    pub fn set(&mut self, ptr: *const u8) -> bool {
        let (word, mask) = self.index_of(ptr as usize);
        let entry = self.words.entry(word).or_insert(0);
        let old = *entry & mask != 0;
        *entry |= mask;
        old
    }

    /// Clears the bit for `ptr`, returns whether it was set before.
    pub fn clear(&mut self, ptr: *const u8) -> bool {
        let (word, mask) = self.index_of(ptr as usize);
        let Some(entry) = self.words.get_mut(&word) else {
            return false;
        };
        let old = *entry & mask != 0;
        *entry &= !mask;
        if *entry == 0 {
            self.words.remove(&word);
        }
        old
    }

    pub fn test(&self, ptr: *const u8) -> bool {
        let (word, mask) = self.index_of(ptr as usize);
        self.words.get(&word).is_some_and(|w| w & mask != 0)
    }

    pub fn clear_all(&mut self) {
        self.words.clear();
    }

    /// Copies every bit of `other`, keeps our name.
    pub fn copy_from(&mut self, other: &LargeObjectBitmap) {
        assert_eq!(
            self.alignment, other.alignment,
            "cannot copy {} into {}: alignment mismatch",
            other.name, self.name
        );
        self.words.clone_from(&other.words);
    }

    pub fn count(&self) -> usize {
        self.words.values().map(|w| w.count_ones() as usize).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    /// Calls `callback` with batches of at most [`SWEEP_BATCH_SIZE`]
    /// addresses in `[begin, end)` that are set in `live` but clear in
    /// `mark`, in address order.
    pub fn sweep_walk(
        live: &LargeObjectBitmap,
        mark: &LargeObjectBitmap,
        begin: usize,
        end: usize,
        mut callback: impl FnMut(&[*mut u8]),
    ) {
        assert_eq!(
            live.alignment, mark.alignment,
            "sweeping {} against {}: alignment mismatch",
            live.name, mark.name
        );
        if begin >= end {
            return;
        }
        let first = begin / live.alignment / BITS_PER_WORD;
        let last = (end - 1) / live.alignment / BITS_PER_WORD;

        let mut buffer: Vec<*mut u8> = Vec::with_capacity(SWEEP_BATCH_SIZE);
        for (&word, &live_bits) in live.words.range(first..=last) {
            let mark_bits = mark.words.get(&word).copied().unwrap_or(0);
            let mut garbage = live_bits & !mark_bits;
            while garbage != 0 {
                let bit = garbage.trailing_zeros();
                garbage &= garbage - 1;
                let addr = live.address_of(word, bit);
                if addr < begin || addr >= end {
                    continue;
                }
                buffer.push(addr as *mut u8);
                if buffer.len() == SWEEP_BATCH_SIZE {
                    callback(&buffer);
                    buffer.clear();
                }
            }
        }
        if !buffer.is_empty() {
            callback(&buffer);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALIGN: usize = 4096;

    fn addr(slot: usize) -> *const u8 {
        (0x1000_0000 + slot * ALIGN) as *const u8
    }

    #[test]
    fn set_clear_test() {
        let mut bitmap = LargeObjectBitmap::new("live", ALIGN);
        assert!(!bitmap.test(addr(3)));
        assert!(!bitmap.set(addr(3)));
        assert!(bitmap.set(addr(3)));
        assert!(bitmap.test(addr(3)));
        assert!(!bitmap.test(addr(4)));
        assert_eq!(bitmap.count(), 1);
        assert!(bitmap.clear(addr(3)));
        assert!(!bitmap.clear(addr(3)));
        assert!(bitmap.is_empty());
    }

    #[test]
    fn copy_from_keeps_name() {
        let mut live = LargeObjectBitmap::new("live", ALIGN);
        let mut mark = LargeObjectBitmap::new("mark", ALIGN);
        live.set(addr(1));
        live.set(addr(100));
        mark.set(addr(7));
        mark.copy_from(&live);
        assert_eq!(mark.name(), "mark");
        assert!(mark.test(addr(1)));
        assert!(mark.test(addr(100)));
        assert!(!mark.test(addr(7)));
    }

    #[test]
    fn sweep_walk_yields_live_minus_mark_in_order() {
        let mut live = LargeObjectBitmap::new("live", ALIGN);
        let mut mark = LargeObjectBitmap::new("mark", ALIGN);
        for slot in [70, 2, 5, 64, 9] {
            live.set(addr(slot));
        }
        mark.set(addr(5));
        mark.set(addr(64));

        let mut seen = Vec::new();
        LargeObjectBitmap::sweep_walk(
            &live,
            &mark,
            addr(0) as usize,
            addr(1000) as usize,
            |batch| seen.extend_from_slice(batch),
        );
        let expected: Vec<*mut u8> =
            [2, 9, 70].iter().map(|&s| addr(s) as *mut u8).collect();
        assert_eq!(seen, expected);
    }

    #[test]
    fn sweep_walk_clips_to_range() {
        let mut live = LargeObjectBitmap::new("live", ALIGN);
        let mark = LargeObjectBitmap::new("mark", ALIGN);
        for slot in 0..10 {
            live.set(addr(slot));
        }
        let mut seen = Vec::new();
        LargeObjectBitmap::sweep_walk(
            &live,
            &mark,
            addr(3) as usize,
            addr(6) as usize,
            |batch| seen.extend_from_slice(batch),
        );
        assert_eq!(seen.len(), 3);
        assert_eq!(seen[0], addr(3) as *mut u8);
        assert_eq!(seen[2], addr(5) as *mut u8);
    }

    #[test]
    fn sweep_walk_batches() {
        let mut live = LargeObjectBitmap::new("live", ALIGN);
        let mark = LargeObjectBitmap::new("mark", ALIGN);
        let total = SWEEP_BATCH_SIZE * 2 + 17;
        for slot in 0..total {
            live.set(addr(slot));
        }
        let mut batches = Vec::new();
        LargeObjectBitmap::sweep_walk(
            &live,
            &mark,
            addr(0) as usize,
            addr(total) as usize,
            |batch| batches.push(batch.len()),
        );
        assert_eq!(batches, vec![SWEEP_BATCH_SIZE, SWEEP_BATCH_SIZE, 17]);
    }
}
