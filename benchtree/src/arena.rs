//! Per-coroutine RDMA scratch arena.
//!
//! Every coroutine slot owns one arena: a fixed, 64-byte aligned region used
//! as the local source/destination of one-sided operations. It is carved as
//!
//! ```text
//! [cas ring: CAS_SLOT_COUNT x 8B][unlock: 8B][zero: 8B]
//! [page ring: PAGE_SLOT_COUNT x page][sibling ring: SIBLING_SLOT_COUNT x page][range: page]
//! ```
//!
//! Rings are not queues. Nothing drains them; a slot becomes reusable only
//! because the cursor needs `depth` acquisitions to come back to it. A
//! coroutine must therefore never have more than `depth - 1` operations of
//! one kind outstanding (see [`MAX_INFLIGHT_CAS`] and friends). Violating that
//! does not fail here, it silently lands a late completion in a slot that was
//! already handed out again.

use std::alloc::{Layout, alloc_zeroed, dealloc};
use std::cell::Cell;
use std::marker::PhantomData;
use std::ptr::NonNull;

/// Depth of the compare-and-swap result ring.
pub const CAS_SLOT_COUNT: usize = 128;
/// Depth of the page landing ring.
pub const PAGE_SLOT_COUNT: usize = 128;
/// Depth of the sibling page ring.
pub const SIBLING_SLOT_COUNT: usize = 16;

/// Outstanding CAS operations one coroutine may have before slots alias.
pub const MAX_INFLIGHT_CAS: usize = CAS_SLOT_COUNT - 1;
/// Outstanding page reads one coroutine may have before slots alias.
pub const MAX_INFLIGHT_PAGE: usize = PAGE_SLOT_COUNT - 1;
/// Outstanding sibling reads one coroutine may have before slots alias.
pub const MAX_INFLIGHT_SIBLING: usize = SIBLING_SLOT_COUNT - 1;

pub const LEAF_PAGE_SIZE: usize = 1024;
pub const INTERNAL_PAGE_SIZE: usize = 1024;

/// Per-coroutine RDMA buffer budget in bytes.
pub const PER_CORO_RDMA_BUF: usize = 256 * 1024;

/// Alignment of the arena base (cache line, same as registered message buffers).
pub const ARENA_ALIGN: usize = 64;

const WORD: usize = std::mem::size_of::<u64>();

/// Ring depths and page geometry of an arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArenaGeometry {
    pub cas_slots: usize,
    pub page_slots: usize,
    pub sibling_slots: usize,
    /// Size of one page cell, `max(leaf, internal)`.
    pub page_size: usize,
}

impl Default for ArenaGeometry {
    fn default() -> Self {
        Self {
            cas_slots: CAS_SLOT_COUNT,
            page_slots: PAGE_SLOT_COUNT,
            sibling_slots: SIBLING_SLOT_COUNT,
            page_size: LEAF_PAGE_SIZE.max(INTERNAL_PAGE_SIZE),
        }
    }
}

impl ArenaGeometry {
    /// Total bytes spanned by all regions.
    pub const fn span(&self) -> usize {
        self.cas_slots * WORD
            + WORD // unlock
            + WORD // zero
            + self.page_size * (self.page_slots + self.sibling_slots + 1)
    }

    /// Whether the regions fit in `budget` bytes.
    #[inline]
    pub const fn fits(&self, budget: usize) -> bool {
        self.span() <= budget
    }
}

// ============================================================================
// Slot
// ============================================================================

/// Local memory as the transport sees it: an address and a length, with no
/// tie to the arena that owns it.
///
/// This is what goes into a scatter/gather entry. Only the endpoint
/// dereferences it, under the contract of [`Endpoint::post`].
///
/// [`Endpoint::post`]: crate::transport::Endpoint::post
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalBuf {
    ptr: NonNull<u8>,
    len: usize,
}

impl LocalBuf {
    #[inline]
    pub fn addr(&self) -> u64 {
        self.ptr.as_ptr() as u64
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn words(&self) -> usize {
        self.len / WORD
    }

    /// # Safety
    /// The arena owning the buffer must still be alive.
    ///
    /// # Panics
    /// Panics if the word lies outside the buffer.
    #[inline]
    pub unsafe fn read_word(&self, i: usize) -> u64 {
        assert!((i + 1) * WORD <= self.len);
        unsafe { std::ptr::read_volatile(self.ptr.as_ptr().cast::<u64>().add(i)) }
    }

    /// # Safety
    /// The arena owning the buffer must still be alive.
    ///
    /// # Panics
    /// Panics if the word lies outside the buffer.
    #[inline]
    pub unsafe fn write_word(&self, i: usize, value: u64) {
        assert!((i + 1) * WORD <= self.len);
        unsafe { std::ptr::write_volatile(self.ptr.as_ptr().cast::<u64>().add(i), value) }
    }
}

/// A local cell handed out by the arena, valid for as long as the arena is
/// borrowed.
///
/// The memory behind a slot is written by the NIC (or the simulator) while
/// the coroutine keeps going, so accessors go through raw pointers.
///
/// ```compile_fail
/// use benchtree::arena::ScratchArena;
///
/// let slot = {
///     let arena = ScratchArena::new();
///     arena.acquire_cas_slot()
/// };
/// slot.read_u64();
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Slot<'a> {
    buf: LocalBuf,
    index: usize,
    _arena: PhantomData<&'a ScratchArena>,
}

impl<'a> Slot<'a> {
    /// Local virtual address, as used in a scatter/gather entry.
    #[inline]
    pub fn addr(&self) -> u64 {
        self.buf.addr()
    }

    /// The lifetime-free view posted to an endpoint.
    #[inline]
    pub fn buf(&self) -> LocalBuf {
        self.buf
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.buf.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.buf.len == 0
    }

    /// Ring index of this slot (0 for fixed regions).
    #[inline]
    pub fn index(&self) -> usize {
        self.index
    }

    /// Read the first 8-byte word.
    #[inline]
    pub fn read_u64(&self) -> u64 {
        self.read_word(0)
    }

    /// Write the first 8-byte word.
    #[inline]
    pub fn write_u64(&self, value: u64) {
        self.write_word(0, value)
    }

    /// Read the `i`-th 8-byte word.
    ///
    /// # Panics
    /// Panics if the word lies outside the slot.
    #[inline]
    pub fn read_word(&self, i: usize) -> u64 {
        // Safety: the arena is borrowed for 'a.
        unsafe { self.buf.read_word(i) }
    }

    /// Write the `i`-th 8-byte word.
    ///
    /// # Panics
    /// Panics if the word lies outside the slot.
    #[inline]
    pub fn write_word(&self, i: usize, value: u64) {
        // Safety: the arena is borrowed for 'a.
        unsafe { self.buf.write_word(i, value) }
    }

    /// Number of whole words in the slot.
    #[inline]
    pub fn words(&self) -> usize {
        self.buf.words()
    }

    /// View the slot as bytes.
    ///
    /// # Safety
    /// No one-sided operation targeting this slot may be in flight while the
    /// returned slice is alive.
    #[inline]
    pub unsafe fn as_slice(&self) -> &'a [u8] {
        unsafe { std::slice::from_raw_parts(self.buf.ptr.as_ptr(), self.buf.len) }
    }
}

/// Read-only view of the zero cell.
#[derive(Debug, Clone, Copy)]
pub struct ZeroSentinel<'a> {
    slot: Slot<'a>,
}

impl ZeroSentinel<'_> {
    #[inline]
    pub fn addr(&self) -> u64 {
        self.slot.addr()
    }

    #[inline]
    pub fn read_u64(&self) -> u64 {
        self.slot.read_u64()
    }

    /// Source of a remote zero-write. Never pass it as a read or CAS target.
    #[inline]
    pub fn buf(&self) -> LocalBuf {
        self.slot.buf()
    }
}

// ============================================================================
// Ring
// ============================================================================

#[derive(Debug)]
struct Ring {
    offset: usize,
    stride: usize,
    depth: usize,
    cursor: Cell<usize>,
}

impl Ring {
    fn new(offset: usize, stride: usize, depth: usize) -> Self {
        assert!(depth > 0, "ring depth must be non-zero");
        Self {
            offset,
            stride,
            depth,
            cursor: Cell::new(0),
        }
    }

    /// Advance first, then hand out. Slot 0 is the implicit "previous" slot
    /// after construction.
    #[inline]
    fn advance(&self) -> usize {
        let next = (self.cursor.get() + 1) % self.depth;
        self.cursor.set(next);
        next
    }
}

// ============================================================================
// ScratchArena
// ============================================================================

/// Fixed scratch memory of one coroutine slot.
pub struct ScratchArena {
    ptr: NonNull<u8>,
    layout: Layout,
    geometry: ArenaGeometry,
    cas: Ring,
    page: Ring,
    sibling: Ring,
    unlock_offset: usize,
    zero_offset: usize,
    range_offset: usize,
}

// Safety: the arena exclusively owns its allocation; slots handed out are
// only dereferenced by the owning coroutine.
unsafe impl Send for ScratchArena {}

impl ScratchArena {
    /// Create an arena with the default geometry and budget.
    pub fn new() -> Self {
        Self::with_geometry(ArenaGeometry::default(), PER_CORO_RDMA_BUF)
    }

    /// Create an arena with the given geometry.
    ///
    /// # Panics
    /// Panics if the regions exceed `budget` bytes, or if the page size is not
    /// a non-zero multiple of 8. Both mean the arena is undersized for the
    /// configured concurrency, so there is nothing to recover.
    pub fn with_geometry(geometry: ArenaGeometry, budget: usize) -> Self {
        assert!(
            geometry.page_size > 0 && geometry.page_size % WORD == 0,
            "page size {} must be a non-zero multiple of {}",
            geometry.page_size,
            WORD
        );
        assert!(
            geometry.fits(budget),
            "scratch arena needs {} bytes, per-coroutine budget is {}",
            geometry.span(),
            budget
        );

        let cas_offset = 0;
        let unlock_offset = cas_offset + geometry.cas_slots * WORD;
        let zero_offset = unlock_offset + WORD;
        let page_offset = zero_offset + WORD;
        let sibling_offset = page_offset + geometry.page_size * geometry.page_slots;
        let range_offset = sibling_offset + geometry.page_size * geometry.sibling_slots;
        debug_assert_eq!(range_offset + geometry.page_size, geometry.span());

        let layout = Layout::from_size_align(geometry.span(), ARENA_ALIGN)
            .expect("arena layout overflows isize");
        let ptr = unsafe { alloc_zeroed(layout) };
        let Some(ptr) = NonNull::new(ptr) else {
            std::alloc::handle_alloc_error(layout);
        };

        let arena = Self {
            ptr,
            layout,
            geometry,
            cas: Ring::new(cas_offset, WORD, geometry.cas_slots),
            page: Ring::new(page_offset, geometry.page_size, geometry.page_slots),
            sibling: Ring::new(sibling_offset, geometry.page_size, geometry.sibling_slots),
            unlock_offset,
            zero_offset,
            range_offset,
        };
        arena.slot_at(zero_offset, WORD, 0).write_u64(0);
        arena
    }

    #[inline]
    fn slot_at(&self, offset: usize, len: usize, index: usize) -> Slot<'_> {
        debug_assert!(offset + len <= self.layout.size());
        Slot {
            buf: LocalBuf {
                // Safety: offset is within the allocation.
                ptr: unsafe { NonNull::new_unchecked(self.ptr.as_ptr().add(offset)) },
                len,
            },
            index,
            _arena: PhantomData,
        }
    }

    #[inline]
    fn acquire(&self, ring: &Ring) -> Slot<'_> {
        let index = ring.advance();
        self.slot_at(ring.offset + index * ring.stride, ring.stride, index)
    }

    /// Next 8-byte cell of the CAS ring.
    #[inline]
    pub fn acquire_cas_slot(&self) -> Slot<'_> {
        self.acquire(&self.cas)
    }

    /// Next page cell of the page ring.
    #[inline]
    pub fn acquire_page_slot(&self) -> Slot<'_> {
        self.acquire(&self.page)
    }

    /// Next page cell of the sibling ring.
    #[inline]
    pub fn acquire_sibling_slot(&self) -> Slot<'_> {
        self.acquire(&self.sibling)
    }

    /// Source cell of unlock writes.
    #[inline]
    pub fn unlock_slot(&self) -> Slot<'_> {
        self.slot_at(self.unlock_offset, WORD, 0)
    }

    /// Cell permanently holding 0.
    #[inline]
    pub fn zero_sentinel(&self) -> ZeroSentinel<'_> {
        ZeroSentinel {
            slot: self.slot_at(self.zero_offset, WORD, 0),
        }
    }

    /// Page-sized region for range scans.
    #[inline]
    pub fn range_slot(&self) -> Slot<'_> {
        self.slot_at(self.range_offset, self.geometry.page_size, 0)
    }

    #[inline]
    pub fn geometry(&self) -> &ArenaGeometry {
        &self.geometry
    }

    /// Base address, for memory registration.
    #[inline]
    pub fn base_addr(&self) -> u64 {
        self.ptr.as_ptr() as u64
    }

    /// Bytes spanned by the arena.
    #[inline]
    pub fn len(&self) -> usize {
        self.layout.size()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.layout.size() == 0
    }
}

impl Default for ScratchArena {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ScratchArena {
    fn drop(&mut self) {
        unsafe { dealloc(self.ptr.as_ptr(), self.layout) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small() -> ArenaGeometry {
        ArenaGeometry {
            cas_slots: 4,
            page_slots: 4,
            sibling_slots: 2,
            page_size: 64,
        }
    }

    #[test]
    fn test_first_acquisition_is_index_one() {
        let arena = ScratchArena::new();
        assert_eq!(arena.acquire_cas_slot().index(), 1);
        assert_eq!(arena.acquire_page_slot().index(), 1);
        assert_eq!(arena.acquire_sibling_slot().index(), 1);
    }

    #[test]
    fn test_cyclic_acquisition() {
        let geometry = small();
        for n in [1, 4, 5, 8] {
            let arena = ScratchArena::with_geometry(geometry, geometry.span());
            let first = arena.acquire_cas_slot();
            for _ in 0..n - 1 {
                arena.acquire_cas_slot();
            }
            // n calls after the first land `n` positions further.
            let after = arena.acquire_cas_slot();
            assert_eq!(after.index(), (first.index() + n) % geometry.cas_slots);
            if n % geometry.cas_slots == 0 {
                assert_eq!(after.addr(), first.addr());
            }
        }
    }

    #[test]
    fn test_budget_boundary_fits() {
        let geometry = small();
        let arena = ScratchArena::with_geometry(geometry, geometry.span());
        assert_eq!(arena.len(), geometry.span());
    }

    #[test]
    #[should_panic(expected = "per-coroutine budget")]
    fn test_budget_exceeded_panics() {
        let geometry = small();
        let _ = ScratchArena::with_geometry(geometry, geometry.span() - 1);
    }

    #[test]
    fn test_default_geometry_fits_budget() {
        assert!(ArenaGeometry::default().fits(PER_CORO_RDMA_BUF));
    }

    #[test]
    fn test_regions_are_disjoint_and_aligned() {
        let geometry = small();
        let arena = ScratchArena::with_geometry(geometry, geometry.span());
        let base = arena.base_addr();
        assert_eq!(base as usize % ARENA_ALIGN, 0);

        let cas = arena.acquire_cas_slot();
        let unlock = arena.unlock_slot();
        let zero = arena.zero_sentinel();
        let page = arena.acquire_page_slot();
        let sibling = arena.acquire_sibling_slot();
        let range = arena.range_slot();

        let bufs = [cas.buf(), unlock.buf(), zero.buf(), page.buf(), sibling.buf(), range.buf()];
        let mut spans: Vec<(u64, u64)> = bufs
            .iter()
            .map(|b| {
                assert_eq!(b.addr() % 8, 0);
                (b.addr(), b.addr() + b.len() as u64)
            })
            .collect();
        spans.sort();
        for w in spans.windows(2) {
            assert!(w[0].1 <= w[1].0, "overlapping regions {:?}", w);
        }
        assert!(spans.last().unwrap().1 <= base + geometry.span() as u64);
        assert_eq!(range.len(), geometry.page_size);
    }

    #[test]
    fn test_zero_sentinel_and_fixed_regions() {
        let arena = ScratchArena::new();
        assert_eq!(arena.zero_sentinel().read_u64(), 0);
        let unlock = arena.unlock_slot();
        unlock.write_u64(7);
        for _ in 0..3 * CAS_SLOT_COUNT {
            arena.acquire_cas_slot().write_u64(u64::MAX);
        }
        assert_eq!(arena.unlock_slot(), unlock);
        assert_eq!(arena.unlock_slot().read_u64(), 7);
        assert_eq!(arena.zero_sentinel().read_u64(), 0);
    }

    #[test]
    fn test_slots_share_one_borrow() {
        let arena = ScratchArena::new();
        let a = arena.acquire_page_slot();
        let b = arena.acquire_page_slot();
        a.write_u64(1);
        b.write_u64(2);
        assert_eq!((a.read_u64(), b.read_u64()), (1, 2));
        assert_eq!(a.buf().addr() + arena.geometry().page_size as u64, b.buf().addr());
        assert_eq!(arena.zero_sentinel().read_u64(), 0);
    }
}
