//! Concurrent hierarchical bitmap for page-granular arenas.
//!
//! A [`Bitmap`] tracks which fixed-size slices of an arena are free (or
//! abandoned) with one bit per slice. Many threads concurrently release
//! slices (set bits), claim them (find and clear bits), and scan the
//! currently-set bits, without any lock: every mutation is an atomic
//! read-modify-write on a single machine word.
//!
//! Two levels keep the searches cheap under contention:
//!
//! - bits are grouped into cache-line-sized *chunks* of a few atomic
//!   bitfields, scanned as a unit;
//! - a *chunkmap* summarizes which chunks contain any set bit, so searches
//!   skip empty regions, and searchers are staggered across chunks by a
//!   caller-supplied thread sequence number.

mod bfield;
mod bitmap;
mod chunk;
mod common;

pub use {
    bitmap::{Bitmap, Claim},
    common::{Bit, BITFIELD_WIDTH, CHUNK_BITS, FIELDS_PER_CHUNK},
};
