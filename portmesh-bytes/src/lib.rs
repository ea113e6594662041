//! Binary buffers and scalar reinterpretation for the portmesh transport.
//!
//! The transport moves opaque byte chunks between endpoints and never
//! interprets them; this crate provides the two pieces it builds on:
//!
//! - [`cast`]: zero-copy reinterpretation between scalar slices
//!   (`i8`…`f64`) and raw byte slices, with checked inverses;
//! - [`buffer`]: [`Buffer`](buffer::Buffer), the fixed-length binary
//!   buffer carried inside data frames, with typed views that share its
//!   storage.
//!
//! Buffers are allocated on 64-bit word boundaries so that a typed view of
//! any supported element width is always alignment-sound.

#![deny(missing_docs)]

pub mod buffer;
pub mod cast;

pub use buffer::{Buffer, ElementType, TypedSlice};
pub use cast::Scalar;

use thiserror::Error;

/// Errors produced by the byte bridge.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BufferError {
    /// The byte count does not divide evenly into elements of the
    /// requested type.
    #[error("cannot view {len} bytes as {ty}: not a multiple of {width} bytes")]
    LengthMismatch {
        /// Observed byte count.
        len: usize,
        /// Requested element type.
        ty: &'static str,
        /// Width of one element of that type.
        width: usize,
    },
    /// The byte slice does not satisfy the alignment of the requested type.
    #[error("byte slice is not aligned for {ty} (requires {align} byte alignment)")]
    Misaligned {
        /// Requested element type.
        ty: &'static str,
        /// Required alignment in bytes.
        align: usize,
    },
    /// A copy into the buffer does not fit.
    #[error("write of {len} bytes at offset {offset} exceeds buffer of {capacity} bytes")]
    OutOfRange {
        /// Offset the copy was to start at.
        offset: usize,
        /// Number of bytes to copy in.
        len: usize,
        /// Total capacity of the buffer.
        capacity: usize,
    },
    /// A copy out of an empty buffer was requested.
    #[error("refusing to copy out of an empty buffer")]
    Empty,
}
