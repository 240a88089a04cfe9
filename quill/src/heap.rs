//! Non-moving mark heap.
//!
//! The heap is a fixed array of value slots with one mark bit per slot,
//! grouped into 64-bit pages. A set bit means the slot is in use, either
//! because it was just handed out by [`Heap::allocate`] or because the last
//! mark pass reached it. There is no explicit free: a block becomes
//! reusable as soon as a collection no longer reaches it.
//!
//! Heap offset 0 is mutable address `base` (the stack size), so addresses
//! handed out here can be resolved against the VM's combined memory.

use core::fmt;

use crate::address::{Address, MAX_ADDRESS_OFFSET};
use crate::value::{Array, MAX_ARRAY_LENGTH, Value};

pub const BITS_PER_PAGE: usize = u64::BITS as usize;

/// Mask of the `n` lowest bits. `n >= 64` yields a full page.
#[inline(always)]
pub const fn chunk_mask(n: usize) -> u64 {
    if n >= BITS_PER_PAGE {
        u64::MAX
    } else {
        !(u64::MAX << n)
    }
}

#[inline(always)]
const fn page_of(slot: usize) -> usize {
    slot / BITS_PER_PAGE
}

#[inline(always)]
const fn bit_of(slot: usize) -> usize {
    slot % BITS_PER_PAGE
}

// ── Public API types ──────────────────────────────────────────────────

/// Supplies live values at collection time.
///
/// Only arrays and iterators that point into the heap matter; everything
/// else is ignored by the marker.
pub trait RootProvider {
    fn visit_roots(&self, visitor: &mut dyn FnMut(Value));
}

impl RootProvider for [Value] {
    fn visit_roots(&self, visitor: &mut dyn FnMut(Value)) {
        for value in self {
            visitor(*value);
        }
    }
}

impl RootProvider for Vec<Value> {
    fn visit_roots(&self, visitor: &mut dyn FnMut(Value)) {
        self.as_slice().visit_roots(visitor)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeapError {
    Settings(&'static str),
    TooLarge { requested: usize, capacity: usize },
    Exhausted { requested: usize },
    OutOfBounds(Address),
}

impl fmt::Display for HeapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Settings(msg) => write!(f, "invalid heap settings: {msg}"),
            Self::TooLarge {
                requested,
                capacity,
            } => write!(
                f,
                "cannot allocate {requested} slots, heap holds {capacity}"
            ),
            Self::Exhausted { requested } => {
                write!(f, "not enough free memory for {requested} slots")
            }
            Self::OutOfBounds(addr) => write!(f, "address {addr} is not on the heap"),
        }
    }
}

impl std::error::Error for HeapError {}

// ── Heap settings ─────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct HeapSettings {
    /// Number of value slots in the heap.
    pub heap_size: usize,
    /// Mutable address of heap slot 0 (the size of the stack region).
    pub base: u32,
}

impl Default for HeapSettings {
    fn default() -> Self {
        Self {
            heap_size: 2048,
            base: 2048,
        }
    }
}

impl HeapSettings {
    pub fn validate(&self) -> Result<(), &'static str> {
        if self.heap_size == 0 {
            return Err("heap_size must be > 0");
        }
        let end = self.base as u64 + self.heap_size as u64;
        if end > MAX_ADDRESS_OFFSET as u64 + 1 {
            return Err("heap does not fit in the 30-bit mutable address space");
        }
        Ok(())
    }
}

// ── Heap ──────────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct Heap {
    values: Vec<Value>,
    marks: Vec<u64>,
    base: u32,
    collections: usize,
}

impl Heap {
    pub fn new(settings: HeapSettings) -> Result<Self, HeapError> {
        settings.validate().map_err(HeapError::Settings)?;
        let pages = settings.heap_size.div_ceil(BITS_PER_PAGE);
        Ok(Self {
            values: vec![Value::None; settings.heap_size],
            marks: vec![0; pages],
            base: settings.base,
            collections: 0,
        })
    }

    pub fn capacity(&self) -> usize {
        self.values.len()
    }

    /// Slots currently marked in use.
    pub fn used(&self) -> usize {
        self.marks.iter().map(|page| page.count_ones() as usize).sum()
    }

    pub fn collections(&self) -> usize {
        self.collections
    }

    pub fn base(&self) -> u32 {
        self.base
    }

    pub fn is_marked(&self, slot: usize) -> bool {
        slot < self.capacity() && self.marks[page_of(slot)] & (1u64 << bit_of(slot)) != 0
    }

    // ── Allocation ────────────────────────────────────────────────────

    /// Reserve `count` zeroed slots.
    ///
    /// When no free run exists a collection over `roots` is run and the
    /// search retried once. Empty arrays never touch the bitmap.
    pub fn allocate<R: RootProvider + ?Sized>(
        &mut self,
        count: usize,
        roots: &R,
    ) -> Result<Array, HeapError> {
        if count == 0 {
            return Ok(Array::EMPTY);
        }
        if count > self.capacity() || count > MAX_ARRAY_LENGTH as usize {
            return Err(HeapError::TooLarge {
                requested: count,
                capacity: self.capacity(),
            });
        }

        let start = match self.find_free_chunk(count) {
            Some(start) => start,
            None => {
                self.collect(roots);
                self.find_free_chunk(count).ok_or_else(|| {
                    log::error!("heap: not enough free memory for {count} slots");
                    HeapError::Exhausted { requested: count }
                })?
            }
        };

        self.mark_range(start, count);
        self.values[start..start + count].fill(Value::None);

        let address = Address::mutable(self.base + start as u32)
            .ok_or(HeapError::Exhausted { requested: count })?;
        log::trace!("heap: allocated {count} slots at {address}");
        Ok(Array::new(address, count as u32))
    }

    fn find_free_chunk(&self, count: usize) -> Option<usize> {
        let start = if count < BITS_PER_PAGE {
            self.find_small_chunk(count)
        } else {
            self.find_large_chunk(count)
        }?;
        (start + count <= self.capacity()).then_some(start)
    }

    /// First zero window of `count` bits inside a single page.
    fn find_small_chunk(&self, count: usize) -> Option<usize> {
        let mask = chunk_mask(count);
        for (page_index, &page) in self.marks.iter().enumerate() {
            if page == u64::MAX {
                continue;
            }
            for bit in 0..=(BITS_PER_PAGE - count) {
                if page & (mask << bit) == 0 {
                    let start = page_index * BITS_PER_PAGE + bit;
                    if start + count > self.capacity() {
                        return None;
                    }
                    return Some(start);
                }
            }
        }
        None
    }

    fn count_empty_pages(&self, from: usize) -> usize {
        self.marks[from..]
            .iter()
            .take_while(|&&page| page == 0)
            .count()
    }

    /// Page-aligned run of empty pages, plus the leading bits of the
    /// following page when `count` is not a multiple of the page size.
    fn find_large_chunk(&self, count: usize) -> Option<usize> {
        let full_pages = count / BITS_PER_PAGE;
        let trailing = count % BITS_PER_PAGE;
        let total = self.marks.len();

        let mut page_index = 0;
        while page_index + full_pages <= total {
            let free = self.count_empty_pages(page_index);
            if free > full_pages || (free == full_pages && trailing == 0) {
                return Some(page_index * BITS_PER_PAGE);
            }
            if free == full_pages {
                let next = page_index + free;
                if next < total && self.marks[next] & chunk_mask(trailing) == 0 {
                    return Some(page_index * BITS_PER_PAGE);
                }
            }
            page_index += free.max(1);
        }
        None
    }

    /// Set the bits for `count` slots starting at heap slot `start`:
    /// whole pages with a full word, partial pages with a shifted mask.
    fn mark_range(&mut self, start: usize, count: usize) {
        let end = start + count;
        let mut slot = start;
        while slot < end {
            let bit = bit_of(slot);
            let run = (BITS_PER_PAGE - bit).min(end - slot);
            self.marks[page_of(slot)] |= chunk_mask(run) << bit;
            slot += run;
        }
    }

    // ── Collection ────────────────────────────────────────────────────

    /// Recompute the mark bitmap from `roots`.
    ///
    /// Arrays reached from a root are marked and their elements scanned in
    /// turn, so nested arrays survive. Iterators keep the unvisited tail of
    /// their array alive.
    pub fn collect<R: RootProvider + ?Sized>(&mut self, roots: &R) {
        let before = self.used();
        self.marks.fill(0);

        let mut pending: Vec<(usize, usize)> = Vec::new();
        roots.visit_roots(&mut |value| {
            if let Some(range) = self.heap_range_of(value) {
                pending.push(range);
            }
        });

        while let Some((start, len)) = pending.pop() {
            if self.is_marked(start) {
                continue;
            }
            self.mark_range(start, len);
            for value in &self.values[start..start + len] {
                if let Some(range) = self.heap_range_of(*value) {
                    pending.push(range);
                }
            }
        }

        self.collections += 1;
        log::debug!(
            "heap: collection #{} kept {} of {} slots",
            self.collections,
            self.used(),
            before
        );
    }

    /// Heap slot range referenced by `value`, if it points into this heap.
    fn heap_range_of(&self, value: Value) -> Option<(usize, usize)> {
        let (address, len) = match value {
            Value::Array(a) => (a.address, a.length),
            Value::Iter(i) => (i.current, i.remaining),
            _ => return None,
        };
        if len == 0 {
            return None;
        }
        self.slot_range(address, len as usize)
    }

    fn slot_range(&self, address: Address, len: usize) -> Option<(usize, usize)> {
        let Address::Mutable(offset) = address else {
            return None;
        };
        let start = offset.checked_sub(self.base)? as usize;
        (start + len <= self.capacity()).then_some((start, len))
    }

    // ── Access ────────────────────────────────────────────────────────

    pub fn contains(&self, address: Address) -> bool {
        self.slot_range(address, 1).is_some()
    }

    pub fn get(&self, address: Address) -> Option<Value> {
        let (start, _) = self.slot_range(address, 1)?;
        Some(self.values[start])
    }

    /// The slots of a heap array.
    pub fn slots(&self, array: Array) -> Option<&[Value]> {
        if array.length == 0 {
            return Some(&[]);
        }
        let (start, len) = self.slot_range(array.address, array.length as usize)?;
        Some(&self.values[start..start + len])
    }

    /// Copy `src` into `dest`, truncating to the destination length.
    /// Returns the number of slots written.
    pub fn copy_into(&mut self, src: &[Value], dest: Array) -> Result<usize, HeapError> {
        let len = src.len().min(dest.length as usize);
        if len == 0 {
            return Ok(0);
        }
        let (start, _) = self
            .slot_range(dest.address, dest.length as usize)
            .ok_or(HeapError::OutOfBounds(dest.address))?;
        self.values[start..start + len].copy_from_slice(&src[..len]);
        Ok(len)
    }

    /// One line of `0`/`1` per page, lowest slot first.
    pub fn usage_map(&self) -> String {
        let mut out = String::with_capacity(self.marks.len() * (BITS_PER_PAGE + 3));
        for page in &self.marks {
            out.push_str("  ");
            for bit in 0..BITS_PER_PAGE {
                out.push(if page & (1u64 << bit) != 0 { '1' } else { '0' });
            }
            out.push('\n');
        }
        out
    }
}

// ── Tests ─────────────────────────────────────────────────────────────
