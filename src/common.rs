use std::sync::atomic::AtomicUsize;
use static_assertions::const_assert;

/// Width in bits of one atomic bitfield, the unit of all RMW operations.
pub const BITFIELD_WIDTH: usize = std::mem::size_of::<AtomicUsize>() * 8;

/// Bitfields per chunk. A chunk is the unit scanned by the find operations.
pub const FIELDS_PER_CHUNK: usize = 4;

/// Bits per chunk.
pub const CHUNK_BITS: usize = FIELDS_PER_CHUNK * BITFIELD_WIDTH;

/// The chunkmap is a single chunk, so one bitmap can summarize at most
/// this many chunks.
pub(crate) const MAX_CHUNK_COUNT: usize = CHUNK_BITS;

pub(crate) type Bitfield = AtomicUsize;

/// 0x0101..01 and 0x8080..80, used by the all-set-byte detector.
pub(crate) const BYTE_LO_BITS: usize = usize::MAX / 0xFF;
pub(crate) const BYTE_HI_BITS: usize = BYTE_LO_BITS << 7;

const_assert!(std::mem::size_of::<Bitfield>() == BITFIELD_WIDTH / 8);
// the chunkmap walk masks chunkmap-field indices inside one bitfield
const_assert!(FIELDS_PER_CHUNK <= BITFIELD_WIDTH);

/// Selects the direction of the set/clear operations that share one
/// implementation.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Bit {
    Set,
    Clear,
}

impl Bit {
    pub(crate) fn flip(self) -> Bit {
        match self {
            Bit::Set => Bit::Clear,
            Bit::Clear => Bit::Set,
        }
    }
}

pub(crate) fn divide_up(value: usize, align: usize) -> usize {
    (value + align - 1) / align
}
