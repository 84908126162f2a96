use std::alloc::{alloc_zeroed, handle_alloc_error, Layout};
use std::fmt;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering::*;

use crate::bfield::{self, CycleIter};
use crate::chunk::Chunk;
use crate::common::{divide_up, Bit, BITFIELD_WIDTH, CHUNK_BITS, MAX_CHUNK_COUNT};

/// Verdict returned by the callback of [`Bitmap::try_find_and_claim`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Claim {
    /// The slice is taken; its bit stays cleared and the search returns it.
    Claimed,
    /// The slice could not be taken; its bit is set again so the slice
    /// stays visible to other searchers.
    Rejected,
    /// The slice is gone; its bit stays cleared.
    Freed,
}

#[derive(Copy, Clone)]
enum FindKind {
    One,
    Eight,
    FullField,
    Run(usize),
    Span(usize),
}

fn chunk_find(chunk: &Chunk, kind: FindKind) -> Option<usize> {
    match kind {
        FindKind::One => chunk.find_and_clear(),
        FindKind::Eight => chunk.find_and_clear8(),
        FindKind::FullField => chunk.find_and_clear_field(),
        FindKind::Run(n) => chunk.find_and_clear_run(n),
        FindKind::Span(n) => chunk.find_and_clear_span(n),
    }
}

fn alloc_chunks(chunk_count: usize) -> Box<[Chunk]> {
    let layout = Layout::array::<Chunk>(chunk_count).unwrap();
    unsafe {
        let ptr = alloc_zeroed(layout) as *mut Chunk;
        if ptr.is_null() {
            handle_alloc_error(layout);
        }
        Box::from_raw(std::ptr::slice_from_raw_parts_mut(ptr, chunk_count))
    }
}

/// A concurrent hierarchical bitmap indexing the free and abandoned slices
/// of a page-granular arena.
///
/// Bits are named by a single index `0 <= idx < bit_count`. Setting a bit
/// marks its slice as free (or abandoned), clearing claims it. A chunkmap
/// summarizes which chunks contain set bits so searches skip empty regions,
/// and searchers supply a thread sequence number (`tseq`) so concurrent
/// threads start at different offsets and collide less.
///
/// All mutation goes through atomic read-modify-writes on individual
/// machine words. There are no locks; a thread that wins the clearing CAS
/// on a bit is its unique claimer.
///
/// ## Example
///
/// ```
/// use shared_bitmap::Bitmap;
/// use std::sync::Arc;
///
/// let bitmap = Arc::new(Bitmap::new(512));
/// bitmap.set(100);
///
/// let bitmap2 = bitmap.clone();
/// let claimed = std::thread::spawn(move || {
///     bitmap2.try_find_and_clear(0)
/// });
///
/// assert_eq!(claimed.join().unwrap(), Some(100));
/// ```
pub struct Bitmap {
    /// Number of valid chunks, fixed at construction
    chunk_count: usize,
    /// Largest chunk index ever published, used to prune searches.
    /// Monotonic (except for the reset in `set_range`) and allowed to lag.
    chunk_max_accessed: AtomicUsize,
    /// Summary chunk: bit `i` is set iff chunk `i` is believed non-empty.
    /// One-sided: a set chunk always has its summary bit set, a set summary
    /// bit may be a stale overestimate.
    chunkmap: Chunk,
    chunks: Box<[Chunk]>,
}

impl Bitmap {
    /// Memory footprint and chunk count for a bitmap of `bit_count` bits.
    ///
    /// `bit_count` is aligned up to a whole number of chunks and must fit
    /// in one chunkmap.
    pub fn size(bit_count: usize) -> (usize, usize) {
        assert!(bit_count > 0);
        let chunk_count = divide_up(bit_count, CHUNK_BITS);
        assert!(
            chunk_count <= MAX_CHUNK_COUNT,
            "a bitmap is limited to {} bits, partition into several bitmaps",
            MAX_CHUNK_COUNT * CHUNK_BITS,
        );
        let bytes = std::mem::size_of::<Bitmap>() + chunk_count * std::mem::size_of::<Chunk>();
        (bytes, chunk_count)
    }

    /// Constructs an all-clear bitmap of at least `bit_count` bits
    /// (rounded up to a whole number of chunks).
    pub fn new(bit_count: usize) -> Bitmap {
        let (_, chunk_count) = Bitmap::size(bit_count);
        Bitmap {
            chunk_count,
            chunk_max_accessed: AtomicUsize::new(0),
            chunkmap: Chunk::new(),
            chunks: alloc_chunks(chunk_count),
        }
    }

    pub fn bit_count(&self) -> usize {
        self.chunk_count * CHUNK_BITS
    }

    pub fn chunk_count(&self) -> usize {
        self.chunk_count
    }

    fn chunkmap_bump_max(&self, chunk_idx: usize) {
        let old = self.chunk_max_accessed.load(Relaxed);
        if chunk_idx > old {
            // single attempt, the hint is allowed to lag
            let _ = self
                .chunk_max_accessed
                .compare_exchange(old, chunk_idx, Relaxed, Relaxed);
        }
    }

    /// Publish "chunk is non-empty". Runs after the chunk bit itself was
    /// set, so a searcher that sees the summary finds a matching bit (or a
    /// benign false positive).
    fn chunkmap_set(&self, chunk_idx: usize) {
        debug_assert!(chunk_idx < self.chunk_count);
        self.chunkmap.set(chunk_idx);
        self.chunkmap_bump_max(chunk_idx);
    }

    /// Downgrade the summary of an apparently empty chunk.
    ///
    /// A concurrent set can slip in between the emptiness probe and the
    /// summary clear; the re-check below catches that window and restores
    /// the summary bit.
    fn chunkmap_try_clear(&self, chunk_idx: usize) -> bool {
        debug_assert!(chunk_idx < self.chunk_count);
        if !self.chunks[chunk_idx].all_clear() {
            return false;
        }
        self.chunkmap.clear(chunk_idx);
        if !self.chunks[chunk_idx].all_clear() {
            self.chunkmap.set(chunk_idx);
            return false;
        }
        self.chunkmap_bump_max(chunk_idx);
        true
    }

    /// Set or clear a single bit. Returns true on a real transition.
    pub fn xset(&self, op: Bit, idx: usize) -> bool {
        debug_assert!(idx < self.bit_count());
        let chunk_idx = idx / CHUNK_BITS;
        let cidx = idx % CHUNK_BITS;
        match op {
            Bit::Set => {
                let was_clear = self.chunks[chunk_idx].set(cidx);
                self.chunkmap_set(chunk_idx);
                was_clear
            }
            Bit::Clear => {
                let (was_set, maybe_all_clear) = self.chunks[chunk_idx].clear(cidx);
                if maybe_all_clear {
                    self.chunkmap_try_clear(chunk_idx);
                }
                was_set
            }
        }
    }

    /// Marks the slice at `idx` as free. Returns true if the bit
    /// transitioned from 0 to 1.
    pub fn set(&self, idx: usize) -> bool {
        self.xset(Bit::Set, idx)
    }

    /// Claims the slice at `idx`. Returns true if the bit transitioned
    /// from 1 to 0.
    pub fn clear(&self, idx: usize) -> bool {
        self.xset(Bit::Clear, idx)
    }

    /// Set or clear `n` consecutive bits. The run may not cross a chunk
    /// boundary. Returns `(all_transitioned, already_xset)`.
    pub fn xset_n(&self, op: Bit, idx: usize, n: usize) -> (bool, usize) {
        debug_assert!(n > 0 && n <= CHUNK_BITS);
        debug_assert!(idx + n <= self.bit_count());
        if n == 1 {
            let transitioned = self.xset(op, idx);
            return (transitioned, usize::from(!transitioned));
        }

        let chunk_idx = idx / CHUNK_BITS;
        let cidx = idx % CHUNK_BITS;
        debug_assert!(cidx + n <= CHUNK_BITS, "ranged ops do not cross chunks");
        let n = n.min(CHUNK_BITS - cidx);

        if n == BITFIELD_WIDTH && cidx % BITFIELD_WIDTH == 0 {
            // aligned whole field, one exchange
            let field_idx = cidx / BITFIELD_WIDTH;
            let (transitioned, already, maybe_all_clear) =
                self.chunks[chunk_idx].xset_field(op, field_idx);
            match op {
                Bit::Set => self.chunkmap_set(chunk_idx),
                Bit::Clear => {
                    if maybe_all_clear {
                        self.chunkmap_try_clear(chunk_idx);
                    }
                }
            }
            return (transitioned, already);
        }

        match op {
            Bit::Set => {
                let (all, already) = self.chunks[chunk_idx].xset_n(Bit::Set, cidx, n);
                self.chunkmap_set(chunk_idx);
                (all, already)
            }
            Bit::Clear => {
                let (all, already) = self.chunks[chunk_idx].xset_n(Bit::Clear, cidx, n);
                if already < n {
                    self.chunkmap_try_clear(chunk_idx);
                }
                (all, already)
            }
        }
    }

    pub fn set_n(&self, idx: usize, n: usize) -> (bool, usize) {
        self.xset_n(Bit::Set, idx, n)
    }

    pub fn clear_n(&self, idx: usize, n: usize) -> (bool, usize) {
        self.xset_n(Bit::Clear, idx, n)
    }

    /// Are `n` consecutive bits all set (or all clear)? The run may not
    /// cross a chunk boundary. Relaxed reads, a hint under concurrency.
    pub fn is_xset_n(&self, op: Bit, idx: usize, n: usize) -> bool {
        debug_assert!(n > 0 && n <= CHUNK_BITS);
        debug_assert!(idx + n <= self.bit_count());
        let chunk_idx = idx / CHUNK_BITS;
        let cidx = idx % CHUNK_BITS;
        debug_assert!(cidx + n <= CHUNK_BITS, "ranged ops do not cross chunks");
        self.chunks[chunk_idx].is_xset_n(op, cidx, n)
    }

    pub fn is_set_n(&self, idx: usize, n: usize) -> bool {
        self.is_xset_n(Bit::Set, idx, n)
    }

    pub fn is_clear_n(&self, idx: usize, n: usize) -> bool {
        self.is_xset_n(Bit::Clear, idx, n)
    }

    /// Set an arbitrarily long run of bits, crossing chunks.
    ///
    /// Construction only: the exclusive borrow keeps this off the
    /// concurrent paths, which lets whole chunks and chunkmap fields be
    /// stored in one go.
    pub fn set_range(&mut self, idx: usize, n: usize) {
        assert!(n > 0);
        assert!(idx + n <= self.bit_count());

        // first chunk
        let mut chunk_idx = idx / CHUNK_BITS;
        let cidx = idx % CHUNK_BITS;
        let m = n.min(CHUNK_BITS - cidx);
        self.chunks[chunk_idx].xset_n(Bit::Set, cidx, m);
        self.chunkmap_set(chunk_idx);
        chunk_idx += 1;
        let mut remaining = n - m;

        // whole chunks
        let mid_chunks = remaining / CHUNK_BITS;
        if mid_chunks > 0 {
            let end_chunk = chunk_idx + mid_chunks;
            for chunk in &self.chunks[chunk_idx..end_chunk] {
                for b in &chunk.bfields {
                    b.store(!0, Relaxed);
                }
            }
            while chunk_idx < end_chunk {
                if chunk_idx % BITFIELD_WIDTH == 0 && chunk_idx + BITFIELD_WIDTH <= end_chunk {
                    // a whole chunkmap field at once
                    self.chunkmap.bfields[chunk_idx / BITFIELD_WIDTH].store(!0, Relaxed);
                    self.chunkmap_bump_max(chunk_idx + BITFIELD_WIDTH - 1);
                    chunk_idx += BITFIELD_WIDTH;
                } else {
                    self.chunkmap_set(chunk_idx);
                    chunk_idx += 1;
                }
            }
            remaining -= mid_chunks * CHUNK_BITS;
        }

        // last chunk
        if remaining > 0 {
            self.chunks[chunk_idx].xset_n(Bit::Set, 0, remaining);
            self.chunkmap_set(chunk_idx);
        }

        self.chunk_max_accessed.store(0, Relaxed);
    }

    /// Walk the chunks the chunkmap believes non-empty, staggered by
    /// `tseq`, until the visitor returns `Some`.
    fn find<F>(&self, tseq: usize, mut visit: F) -> Option<usize>
    where
        F: FnMut(usize) -> Option<usize>,
    {
        let cmap_field_count = divide_up(self.chunk_count, BITFIELD_WIDTH);
        let chunk_acc = self.chunk_max_accessed.load(Relaxed);
        let cmap_acc = chunk_acc / BITFIELD_WIDTH;
        let cmap_acc_bits = 1 + chunk_acc % BITFIELD_WIDTH;

        let cmap_mask = bfield::mask(cmap_field_count, 0);
        for cmap_idx in CycleIter::new(cmap_mask, tseq, cmap_acc + 1) {
            let cmap_entry = self.chunkmap.bfields[cmap_idx].load(Relaxed);
            let entry_cycle = if cmap_idx == cmap_acc {
                cmap_acc_bits
            } else {
                BITFIELD_WIDTH
            };
            for eidx in CycleIter::new(cmap_entry, tseq, entry_cycle) {
                let chunk_idx = cmap_idx * BITFIELD_WIDTH + eidx;
                debug_assert!(chunk_idx < self.chunk_count);
                if let Some(idx) = visit(chunk_idx) {
                    return Some(idx);
                }
            }
        }
        None
    }

    fn try_find_and_clear_kind(&self, tseq: usize, kind: FindKind) -> Option<usize> {
        self.find(tseq, |chunk_idx| {
            if let Some(cidx) = chunk_find(&self.chunks[chunk_idx], kind) {
                Some(chunk_idx * CHUNK_BITS + cidx)
            } else {
                // The summary may be a stale overestimate, downgrade it
                // opportunistically.
                self.chunkmap_try_clear(chunk_idx);
                None
            }
        })
    }

    /// Find a set bit and claim it atomically.
    pub fn try_find_and_clear(&self, tseq: usize) -> Option<usize> {
        self.try_find_and_clear_kind(tseq, FindKind::One)
    }

    /// Find an aligned byte of 8 set bits and claim it atomically.
    pub fn try_find_and_clear8(&self, tseq: usize) -> Option<usize> {
        self.try_find_and_clear_kind(tseq, FindKind::Eight)
    }

    /// Find a whole field of set bits and claim it atomically.
    pub fn try_find_and_clear_field(&self, tseq: usize) -> Option<usize> {
        self.try_find_and_clear_kind(tseq, FindKind::FullField)
    }

    /// Find a run of `n` consecutive set bits and claim it atomically.
    ///
    /// Runs shorter than a field never cross field boundaries; longer runs
    /// start on a field boundary. `n` up to a whole chunk.
    pub fn try_find_and_clear_n(&self, tseq: usize, n: usize) -> Option<usize> {
        let kind = match n {
            0 => return None,
            1 => FindKind::One,
            n if n < BITFIELD_WIDTH => FindKind::Run(n),
            n if n == BITFIELD_WIDTH => FindKind::FullField,
            n if n <= CHUNK_BITS => FindKind::Span(n),
            _ => return None,
        };
        self.try_find_and_clear_kind(tseq, kind)
    }

    /// Find a set bit, clear it, and offer the slice to `claim`.
    ///
    /// Used to reclaim abandoned slices: the callback decides whether the
    /// cleared bit is kept ([`Claim::Claimed`]), restored
    /// ([`Claim::Rejected`], the abandoned marker must stay visible), or
    /// dropped for good ([`Claim::Freed`]).
    pub fn try_find_and_claim<F>(&self, tseq: usize, mut claim: F) -> Option<usize>
    where
        F: FnMut(usize) -> Claim,
    {
        self.find(tseq, |chunk_idx| {
            if let Some(cidx) = self.chunks[chunk_idx].find_and_clear() {
                let slice_idx = chunk_idx * CHUNK_BITS + cidx;
                match claim(slice_idx) {
                    Claim::Claimed => Some(slice_idx),
                    Claim::Rejected => {
                        // We cleared the bit, so no one else can have
                        // claimed it in between: the re-set must transition.
                        let _was_clear = self.chunks[chunk_idx].set(cidx);
                        debug_assert!(_was_clear);
                        None
                    }
                    Claim::Freed => None,
                }
            } else {
                self.chunkmap_try_clear(chunk_idx);
                None
            }
        })
    }

    /// Clear the bit at `idx`, waiting for a concurrent publisher to set
    /// it first. Busy-waits with a yield; the producer has no wake
    /// mechanism.
    pub fn clear_once_set(&self, idx: usize) {
        debug_assert!(idx < self.bit_count());
        self.chunks[idx / CHUNK_BITS].clear_once_set(idx % CHUNK_BITS);
    }

    /// The most significant set bit, or None if the bitmap looks empty.
    pub fn last_set(&self) -> Option<usize> {
        let cmap_field_count = divide_up(self.chunk_count, BITFIELD_WIDTH);
        for i in (0..cmap_field_count).rev() {
            let cmap = self.chunkmap.bfields[i].load(Relaxed);
            if let Some(cmap_idx) = bfield::find_most_bit(cmap) {
                let chunk_idx = i * BITFIELD_WIDTH + cmap_idx;
                if let Some(cidx) = self.chunks[chunk_idx].last_set() {
                    return Some(chunk_idx * CHUNK_BITS + cidx);
                }
            }
        }
        None
    }

    /// Visit every set bit. `visit` returns false to stop early; the
    /// method returns true if the walk completed.
    ///
    /// A snapshot-ish scan: concurrent mutations may hide or repeat
    /// individual bits, but every reported bit was set at some point.
    pub fn for_each_set<F>(&self, mut visit: F) -> bool
    where
        F: FnMut(usize) -> bool,
    {
        let cmap_field_count = divide_up(self.chunk_count, BITFIELD_WIDTH);
        for i in 0..cmap_field_count {
            let mut cmap_entry = self.chunkmap.bfields[i].load(Relaxed);
            while let Some(cmap_idx) = bfield::find_least_bit(cmap_entry) {
                cmap_entry = bfield::clear_least_bit(cmap_entry);
                let chunk_idx = i * BITFIELD_WIDTH + cmap_idx;
                let chunk = &self.chunks[chunk_idx];
                for j in 0..chunk.bfields.len() {
                    let base_idx = chunk_idx * CHUNK_BITS + j * BITFIELD_WIDTH;
                    let mut b = chunk.bfields[j].load(Relaxed);
                    while let Some(bidx) = bfield::find_least_bit(b) {
                        b = bfield::clear_least_bit(b);
                        if !visit(base_idx + bidx) {
                            return false;
                        }
                    }
                }
            }
        }
        true
    }
}

impl fmt::Debug for Bitmap {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut bits_set = 0usize;
        for chunk in self.chunks.iter() {
            for b in &chunk.bfields {
                bits_set += b.load(Relaxed).count_ones() as usize;
            }
        }

        f.debug_struct("Bitmap")
            .field("bit_count", &self.bit_count())
            .field("chunk_count", &self.chunk_count)
            .field("bits_set", &bits_set)
            .finish()
    }
}
