use std::sync::atomic::Ordering::*;

use crate::bfield;
use crate::common::{
    Bit, Bitfield, BITFIELD_WIDTH, BYTE_HI_BITS, BYTE_LO_BITS, CHUNK_BITS, FIELDS_PER_CHUNK,
};

/// A cache-line-sized group of bitfields, scanned as a unit.
///
/// All mutation goes through the atomic primitives on the individual
/// bitfields; operations spanning several fields are sequences of per-field
/// atomic transitions and are not atomic as a whole (see `try_xset_n` for
/// the all-or-nothing variant).
#[cfg_attr(
    any(
        target_arch = "x86",
        target_arch = "arm",
        target_arch = "mips",
        target_arch = "powerpc",
    ),
    repr(align(32))
)]
#[cfg_attr(
    any(
        target_arch = "x86_64",
        target_arch = "aarch64",
        target_arch = "powerpc64",
        target_arch = "riscv64",
    ),
    repr(align(64))
)]
pub(crate) struct Chunk {
    pub(crate) bfields: [Bitfield; FIELDS_PER_CHUNK],
}

impl Chunk {
    pub(crate) fn new() -> Chunk {
        const ZERO: Bitfield = Bitfield::new(0);
        Chunk {
            bfields: [ZERO; FIELDS_PER_CHUNK],
        }
    }

    fn field(&self, cidx: usize) -> (&Bitfield, usize) {
        (&self.bfields[cidx / BITFIELD_WIDTH], cidx % BITFIELD_WIDTH)
    }

    /// Set a single bit. Returns true on a 0 -> 1 transition.
    pub(crate) fn set(&self, cidx: usize) -> bool {
        debug_assert!(cidx < CHUNK_BITS);
        let (b, idx) = self.field(cidx);
        bfield::set(b, idx)
    }

    /// Clear a single bit. Returns `(transitioned, maybe_all_clear)` where
    /// `maybe_all_clear` reports that the containing field became zero.
    pub(crate) fn clear(&self, cidx: usize) -> (bool, bool) {
        debug_assert!(cidx < CHUNK_BITS);
        let (b, idx) = self.field(cidx);
        bfield::clear(b, idx)
    }

    pub(crate) fn clear_once_set(&self, cidx: usize) {
        debug_assert!(cidx < CHUNK_BITS);
        let (b, idx) = self.field(cidx);
        bfield::clear_once_set(b, idx)
    }

    /// Set or clear `n` consecutive bits starting at `cidx`, walking the
    /// affected fields in order. Returns `(all_transitioned, already_xset)`.
    /// Not atomic across fields: a concurrent observer can see a partial
    /// update.
    pub(crate) fn xset_n(&self, op: Bit, cidx: usize, n: usize) -> (bool, usize) {
        debug_assert!(n > 0);
        debug_assert!(cidx + n <= CHUNK_BITS);
        let mut field = cidx / BITFIELD_WIDTH;
        let mut idx = cidx % BITFIELD_WIDTH;
        let mut remaining = n;
        let mut all_transitioned = true;
        let mut total_already = 0;
        while remaining > 0 {
            let m = remaining.min(BITFIELD_WIDTH - idx);
            let mask = bfield::mask(m, idx);
            let (transitioned, already) = bfield::xset_mask(op, &self.bfields[field], mask);
            all_transitioned = all_transitioned && transitioned;
            total_already += already;
            field += 1;
            idx = 0;
            remaining -= m;
        }
        (all_transitioned, total_already)
    }

    /// Set or clear the whole field holding `field_idx * BITFIELD_WIDTH`.
    /// Returns `(transitioned, already_xset, maybe_all_clear)`.
    pub(crate) fn xset_field(&self, op: Bit, field_idx: usize) -> (bool, usize, bool) {
        debug_assert!(field_idx < FIELDS_PER_CHUNK);
        match op {
            Bit::Set => {
                let old = bfield::set_all(&self.bfields[field_idx]);
                (old == 0, old.count_ones() as usize, false)
            }
            Bit::Clear => {
                let old = bfield::clear_all(&self.bfields[field_idx]);
                (old == !0, (!old).count_ones() as usize, true)
            }
        }
    }

    /// Set or clear `n` consecutive bits all-or-nothing. Each field is a
    /// try-transition; when a later field fails, the already-applied fields
    /// are rolled back so the targeted bits are exactly as they were at
    /// entry (bits outside the range are unaffected either way).
    ///
    /// Returns `Some(maybe_all_clear)` on success, None on failure.
    pub(crate) fn try_xset_n(&self, op: Bit, cidx: usize, n: usize) -> Option<bool> {
        debug_assert!(n > 0);
        debug_assert!(cidx + n <= CHUNK_BITS);
        let start_field = cidx / BITFIELD_WIDTH;
        let start_idx = cidx % BITFIELD_WIDTH;

        let mut field = start_field;
        let m = n.min(BITFIELD_WIDTH - start_idx);
        let mask_start = bfield::mask(m, start_idx);
        let mut all_clear = bfield::try_xset_mask(op, &self.bfields[field], mask_start)?;

        let mut remaining = n - m;
        while remaining >= BITFIELD_WIDTH {
            field += 1;
            match bfield::try_xset_mask(op, &self.bfields[field], !0) {
                Some(field_clear) => all_clear = all_clear && field_clear,
                None => {
                    self.rollback(op, start_field, field, mask_start);
                    return None;
                }
            }
            remaining -= BITFIELD_WIDTH;
        }

        if remaining > 0 {
            field += 1;
            let mask_end = bfield::mask(remaining, 0);
            match bfield::try_xset_mask(op, &self.bfields[field], mask_end) {
                Some(field_clear) => all_clear = all_clear && field_clear,
                None => {
                    self.rollback(op, start_field, field, mask_start);
                    return None;
                }
            }
        }

        Some(all_clear)
    }

    /// Undo the fields `[start_field, failed_field)` of a failed
    /// `try_xset_n` by inverting the masks it applied. The unconditional
    /// inversion is correct: only this operation could have transitioned
    /// those exact bits.
    fn rollback(&self, op: Bit, start_field: usize, failed_field: usize, mask_start: usize) {
        let mut field = failed_field;
        while field > start_field {
            field -= 1;
            let mask = if field == start_field { mask_start } else { !0 };
            bfield::xset_mask(op.flip(), &self.bfields[field], mask);
        }
    }

    /// Are `n` consecutive bits starting at `cidx` all set (or all clear)?
    /// Relaxed reads; a single masked load when the range fits in one field.
    pub(crate) fn is_xset_n(&self, op: Bit, cidx: usize, n: usize) -> bool {
        debug_assert!(n > 0);
        debug_assert!(cidx + n <= CHUNK_BITS);
        let mut field = cidx / BITFIELD_WIDTH;
        let mut idx = cidx % BITFIELD_WIDTH;
        if idx + n <= BITFIELD_WIDTH {
            return bfield::is_xset_mask(op, &self.bfields[field], bfield::mask(n, idx));
        }
        let mut remaining = n;
        while remaining > 0 {
            let m = remaining.min(BITFIELD_WIDTH - idx);
            if !bfield::is_xset_mask(op, &self.bfields[field], bfield::mask(m, idx)) {
                return false;
            }
            field += 1;
            idx = 0;
            remaining -= m;
        }
        true
    }

    fn find_and_clear_at(&self, field_idx: usize, allow_all_set: bool) -> Option<usize> {
        let mut b = self.bfields[field_idx].load(Relaxed);
        if !allow_all_set && b == !0 {
            return None;
        }
        loop {
            let idx = bfield::find_least_bit(b)?;
            if bfield::try_clear(&self.bfields[field_idx], idx).is_some() {
                return Some(field_idx * BITFIELD_WIDTH + idx);
            }
            // Lost the race on that bit, re-read and retry. A field gone
            // zero makes find_least_bit bail out to the next field.
            b = self.bfields[field_idx].load(Relaxed);
        }
    }

    /// Find the least set bit and clear it atomically.
    ///
    /// Fields that are fully set are skipped on the first pass so small
    /// claims chew on already-fragmented fields before breaking up pristine
    /// ones.
    pub(crate) fn find_and_clear(&self) -> Option<usize> {
        for i in 0..FIELDS_PER_CHUNK {
            if let Some(cidx) = self.find_and_clear_at(i, false) {
                return Some(cidx);
            }
        }
        for i in 0..FIELDS_PER_CHUNK {
            if let Some(cidx) = self.find_and_clear_at(i, true) {
                return Some(cidx);
            }
        }
        None
    }

    fn find_and_clear8_at(&self, field_idx: usize, allow_all_set: bool) -> Option<usize> {
        let mut b = self.bfields[field_idx].load(Relaxed);
        if !allow_all_set && b == !0 {
            return None;
        }
        loop {
            // has_set8 has bit 8*k set iff byte k of b is 0xFF
            let has_set8 = ((!b).wrapping_sub(BYTE_LO_BITS) & b & BYTE_HI_BITS) >> 7;
            let idx = bfield::find_least_bit(has_set8)?;
            debug_assert!(idx % 8 == 0);
            let mask = 0xFFusize << idx;
            if bfield::try_clear_mask(&self.bfields[field_idx], mask).is_some() {
                return Some(field_idx * BITFIELD_WIDTH + idx);
            }
            b = self.bfields[field_idx].load(Relaxed);
        }
    }

    /// Find the least aligned byte with all 8 bits set and clear it
    /// atomically. Same two-pass strategy as `find_and_clear`.
    pub(crate) fn find_and_clear8(&self) -> Option<usize> {
        for i in 0..FIELDS_PER_CHUNK {
            if let Some(cidx) = self.find_and_clear8_at(i, false) {
                return Some(cidx);
            }
        }
        for i in 0..FIELDS_PER_CHUNK {
            if let Some(cidx) = self.find_and_clear8_at(i, true) {
                return Some(cidx);
            }
        }
        None
    }

    /// Find a field with every bit set and clear it whole.
    pub(crate) fn find_and_clear_field(&self) -> Option<usize> {
        for i in 0..FIELDS_PER_CHUNK {
            let b = self.bfields[i].load(Relaxed);
            if b == !0 && bfield::try_clear_all(&self.bfields[i]) {
                return Some(i * BITFIELD_WIDTH);
            }
        }
        None
    }

    /// Find a run of `n` set bits within a single field (`1 < n <
    /// BITFIELD_WIDTH`, runs never cross fields) and clear it atomically.
    pub(crate) fn find_and_clear_run(&self, n: usize) -> Option<usize> {
        if n == 0 || n > BITFIELD_WIDTH {
            return None;
        }
        let mask = bfield::mask(n, 0);
        for i in 0..FIELDS_PER_CHUNK {
            let mut b = self.bfields[i].load(Relaxed);
            let mut bshift = 0;
            while let Some(idx) = bfield::find_least_bit(b) {
                b >>= idx;
                bshift += idx;
                if bshift + n > BITFIELD_WIDTH {
                    break;
                }
                if b & mask == mask {
                    if bfield::try_clear_mask(&self.bfields[i], mask << bshift).is_some() {
                        return Some(i * BITFIELD_WIDTH + bshift);
                    }
                    // Reload at the same position and retry from there
                    bshift -= idx;
                    b = self.bfields[i].load(Relaxed) >> bshift;
                } else {
                    // The run is too short, skip past it. The failed mask
                    // check guarantees a zero bit below `n`, so `ones` is
                    // in (0, n).
                    let ones = (!b).trailing_zeros() as usize;
                    b >>= ones;
                    bshift += ones;
                }
            }
        }
        None
    }

    /// Find `n` consecutive set bits spanning whole fields
    /// (`BITFIELD_WIDTH <= n <= CHUNK_BITS`) and clear them all-or-nothing.
    ///
    /// Candidate positions are field-aligned: a relaxed pre-scan checks
    /// `ceil(n / W)` fields (full fields all-ones, the last one set in its
    /// low `n % W` bits), then `try_xset_n` commits with rollback.
    pub(crate) fn find_and_clear_span(&self, n: usize) -> Option<usize> {
        if n == 0 || n > CHUNK_BITS {
            return None;
        }
        let field_count = crate::common::divide_up(n, BITFIELD_WIDTH);
        let mut i = 0;
        while i + field_count <= FIELDS_PER_CHUNK {
            let mut all_set = true;
            let mut m = n;
            for j in 0..field_count {
                let b = self.bfields[i + j].load(Relaxed);
                match bfield::find_least_bit(!b) {
                    Some(zero_idx) => {
                        if m > zero_idx {
                            all_set = false;
                            // no need to look again at the previous fields
                            i += j;
                            break;
                        }
                    }
                    None => m = m.wrapping_sub(BITFIELD_WIDTH),
                }
            }
            if all_set {
                let cidx = i * BITFIELD_WIDTH;
                if self.try_xset_n(Bit::Clear, cidx, n).is_some() {
                    return Some(cidx);
                }
            }
            i += 1;
        }
        None
    }

    /// Relaxed all-clear probe, used before a chunkmap downgrade.
    pub(crate) fn all_clear(&self) -> bool {
        self.bfields.iter().all(|b| b.load(Relaxed) == 0)
    }

    /// Most significant set bit of the chunk.
    pub(crate) fn last_set(&self) -> Option<usize> {
        for i in (0..FIELDS_PER_CHUNK).rev() {
            let b = self.bfields[i].load(Relaxed);
            if let Some(idx) = bfield::find_most_bit(b) {
                return Some(i * BITFIELD_WIDTH + idx);
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set_bits(chunk: &Chunk, bits: &[usize]) {
        for &bit in bits {
            assert!(chunk.set(bit));
        }
    }

    fn collect_set(chunk: &Chunk) -> Vec<usize> {
        let mut out = Vec::new();
        for i in 0..FIELDS_PER_CHUNK {
            let mut b = chunk.bfields[i].load(Relaxed);
            while let Some(idx) = bfield::find_least_bit(b) {
                out.push(i * BITFIELD_WIDTH + idx);
                b = bfield::clear_least_bit(b);
            }
        }
        out
    }

    #[test]
    fn xset_n_crosses_fields() {
        let chunk = Chunk::new();

        let (all, already) = chunk.xset_n(Bit::Set, 60, 8);
        assert!(all);
        assert_eq!(already, 0);
        assert!(chunk.is_xset_n(Bit::Set, 60, 8));
        assert_eq!(chunk.bfields[0].load(Relaxed), bfield::mask(4, 60));
        assert_eq!(chunk.bfields[1].load(Relaxed), bfield::mask(4, 0));

        // Overlapping set reports what was already there
        let (all, already) = chunk.xset_n(Bit::Set, 62, 4);
        assert!(!all);
        assert_eq!(already, 4);

        let (all, already) = chunk.xset_n(Bit::Clear, 60, 8);
        assert!(all);
        assert_eq!(already, 0);
        assert!(chunk.all_clear());
    }

    #[test]
    fn is_xset_n_spans_fields() {
        let chunk = Chunk::new();
        chunk.xset_n(Bit::Set, 60, 8);

        assert!(chunk.is_xset_n(Bit::Set, 60, 8));
        assert!(!chunk.is_xset_n(Bit::Set, 59, 8));
        assert!(!chunk.is_xset_n(Bit::Set, 60, 9));
        assert!(chunk.is_xset_n(Bit::Clear, 0, 60));
        assert!(chunk.is_xset_n(Bit::Clear, 68, CHUNK_BITS - 68));
    }

    #[test]
    fn try_xset_n_fails_without_touching_anything() {
        let chunk = Chunk::new();
        chunk.set(130);

        // requires bits [64, 192) all set; the very first field is empty
        assert_eq!(chunk.try_xset_n(Bit::Clear, 64, 128), None);
        assert_eq!(collect_set(&chunk), vec![130]);
    }

    #[test]
    fn try_xset_n_rolls_back_applied_fields() {
        let chunk = Chunk::new();
        chunk.xset_n(Bit::Set, 64, 64); // field 1 fully set
        chunk.set(130); // field 2, bit 2

        // field 1 clears, field 2 is not fully set: the clear of field 1
        // must be undone
        assert_eq!(chunk.try_xset_n(Bit::Clear, 64, 128), None);
        assert_eq!(chunk.bfields[1].load(Relaxed), !0);
        assert_eq!(chunk.bfields[2].load(Relaxed), 1 << 2);

        let mut expected: Vec<usize> = (64..128).collect();
        expected.push(130);
        assert_eq!(collect_set(&chunk), expected);
    }

    #[test]
    fn try_xset_n_set_rolls_back_on_conflict() {
        let chunk = Chunk::new();
        chunk.set(129); // field 2, bit 1

        // spans field 0 (bits 60..64), field 1 (whole), field 2 (bits 0..2)
        assert_eq!(chunk.try_xset_n(Bit::Set, 60, 70), None);
        assert_eq!(collect_set(&chunk), vec![129]);

        // without the conflict the same span succeeds
        let (_, all_clear) = chunk.clear(129);
        assert!(all_clear);
        assert_eq!(chunk.try_xset_n(Bit::Set, 60, 70), Some(false));
        assert!(chunk.is_xset_n(Bit::Set, 60, 70));
    }

    #[test]
    fn try_xset_n_reports_all_clear() {
        let chunk = Chunk::new();
        chunk.xset_n(Bit::Set, 0, 96);

        assert_eq!(chunk.try_xset_n(Bit::Clear, 0, 96), Some(true));
        assert!(chunk.all_clear());

        chunk.xset_n(Bit::Set, 0, 96);
        chunk.set(97); // outside the range but inside a touched field
        assert_eq!(chunk.try_xset_n(Bit::Clear, 0, 96), Some(false));
    }

    #[test]
    fn find_and_clear_prefers_fragmented_fields() {
        let chunk = Chunk::new();
        chunk.xset_field(Bit::Set, 0);
        chunk.set(64 + 5);

        // field 0 is pristine, field 1 is fragmented: take from field 1
        assert_eq!(chunk.find_and_clear(), Some(64 + 5));
        // only the full field remains
        assert_eq!(chunk.find_and_clear(), Some(0));
        assert_eq!(chunk.find_and_clear_at(0, true), Some(1));
    }

    #[test]
    fn find_and_clear_empty_chunk() {
        let chunk = Chunk::new();
        assert_eq!(chunk.find_and_clear(), None);
        assert_eq!(chunk.find_and_clear8(), None);
        assert_eq!(chunk.find_and_clear_field(), None);
        assert_eq!(chunk.find_and_clear_run(8), None);
        assert_eq!(chunk.find_and_clear_span(256), None);
    }

    #[test]
    fn find_and_clear8_takes_whole_bytes() {
        let chunk = Chunk::new();
        chunk.xset_n(Bit::Set, 8, 8);
        chunk.xset_n(Bit::Set, 17, 7); // not a whole byte

        assert_eq!(chunk.find_and_clear8(), Some(8));
        assert!(chunk.is_xset_n(Bit::Clear, 8, 8));
        assert_eq!(chunk.find_and_clear8(), None);
    }

    #[test]
    fn find_and_clear8_prefers_fragmented_fields() {
        let chunk = Chunk::new();
        chunk.xset_field(Bit::Set, 0);
        chunk.xset_n(Bit::Set, 64, 8);

        assert_eq!(chunk.find_and_clear8(), Some(64));
        assert_eq!(chunk.find_and_clear8(), Some(0));
    }

    #[test]
    fn find_and_clear_field_needs_all_ones() {
        let chunk = Chunk::new();
        chunk.xset_n(Bit::Set, 64, 64);
        chunk.xset_n(Bit::Set, 128, 63);

        assert_eq!(chunk.find_and_clear_field(), Some(64));
        assert_eq!(chunk.find_and_clear_field(), None);
    }

    #[test]
    fn find_and_clear_run_stays_within_a_field() {
        let chunk = Chunk::new();
        chunk.xset_n(Bit::Set, 60, 8);

        // the run exists but crosses a field boundary
        assert_eq!(chunk.find_and_clear_run(8), None);
        assert!(chunk.is_xset_n(Bit::Set, 60, 8));

        chunk.xset_n(Bit::Set, 8, 8);
        assert_eq!(chunk.find_and_clear_run(8), Some(8));
        assert!(chunk.is_xset_n(Bit::Clear, 8, 8));
    }

    #[test]
    fn find_and_clear_run_skips_short_runs() {
        let chunk = Chunk::new();
        chunk.xset_n(Bit::Set, 0, 3);
        chunk.xset_n(Bit::Set, 10, 8);

        assert_eq!(chunk.find_and_clear_run(8), Some(10));
        assert_eq!(collect_set(&chunk), vec![0, 1, 2]);
    }

    #[test]
    fn find_and_clear_run_unaligned() {
        let chunk = Chunk::new();
        chunk.xset_n(Bit::Set, 5, 8);

        assert_eq!(chunk.find_and_clear_run(8), Some(5));
        assert!(chunk.all_clear());
    }

    #[test]
    fn find_and_clear_span_crosses_fields() {
        let chunk = Chunk::new();
        chunk.xset_n(Bit::Set, 0, 200);

        assert_eq!(chunk.find_and_clear_span(200), Some(0));
        assert!(chunk.is_xset_n(Bit::Clear, 0, 200));
    }

    #[test]
    fn find_and_clear_span_partial_last_field() {
        let chunk = Chunk::new();
        chunk.xset_n(Bit::Set, 0, 72);

        assert_eq!(chunk.find_and_clear_span(70), Some(0));
        assert_eq!(collect_set(&chunk), vec![70, 71]);
    }

    #[test]
    fn find_and_clear_span_needs_the_whole_run() {
        let chunk = Chunk::new();
        chunk.xset_n(Bit::Set, 0, 199);

        assert_eq!(chunk.find_and_clear_span(200), None);
        assert!(chunk.is_xset_n(Bit::Set, 0, 199));

        // a whole-chunk span
        chunk.xset_n(Bit::Set, 199, CHUNK_BITS - 199);
        assert_eq!(chunk.find_and_clear_span(CHUNK_BITS), Some(0));
        assert!(chunk.all_clear());
    }

    #[test]
    fn last_set_scans_high_to_low() {
        let chunk = Chunk::new();
        assert_eq!(chunk.last_set(), None);

        chunk.set(3);
        assert_eq!(chunk.last_set(), Some(3));
        chunk.set(140);
        assert_eq!(chunk.last_set(), Some(140));
        chunk.set(255);
        assert_eq!(chunk.last_set(), Some(255));
    }

    #[test]
    fn whole_field_exchange() {
        let chunk = Chunk::new();

        let (transitioned, already, _) = chunk.xset_field(Bit::Set, 1);
        assert!(transitioned);
        assert_eq!(already, 0);

        let (transitioned, already, _) = chunk.xset_field(Bit::Set, 1);
        assert!(!transitioned);
        assert_eq!(already, BITFIELD_WIDTH);

        let (transitioned, already, maybe_all_clear) = chunk.xset_field(Bit::Clear, 1);
        assert!(transitioned);
        assert_eq!(already, 0);
        assert!(maybe_all_clear);
    }

    #[test]
    fn clear_once_set_dispatch() {
        let chunk = Chunk::new();
        set_bits(&chunk, &[70]);
        chunk.clear_once_set(70);
        assert!(chunk.all_clear());
    }
}
