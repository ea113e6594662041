//! The transferable binary buffer exchanged through data frames.

use std::fmt;

use bytes::Bytes;

use crate::cast::{self, Scalar};
use crate::BufferError;

/// A fixed-length binary buffer whose storage is suitable for every
/// supported typed view.
///
/// Storage is allocated in 64-bit words, so a view of any element width up
/// to eight bytes never observes a misaligned base pointer. Ownership of a
/// buffer moves with the frame that carries it; peers copy the bytes out
/// on arrival.
#[derive(Clone)]
pub struct Buffer {
    words: Box<[u64]>,
    len: usize,
}

impl Buffer {
    /// Allocate a zeroed buffer of `byte_len` bytes.
    pub fn new(byte_len: usize) -> Buffer {
        let words = vec![0u64; byte_len.div_ceil(8)].into_boxed_slice();
        Buffer {
            words,
            len: byte_len,
        }
    }

    /// Allocate a buffer holding a copy of the given scalars.
    ///
    /// The matching typed view reads the values back unchanged:
    /// `Buffer::from_slice(s).view::<T>()? == s`.
    pub fn from_slice<T: Scalar>(values: &[T]) -> Buffer {
        let src = cast::bytes_of(values);
        let mut buf = Buffer::new(src.len());
        buf.as_bytes_mut().copy_from_slice(src);
        buf
    }

    /// Length of the buffer in bytes.
    pub fn byte_len(&self) -> usize {
        self.len
    }

    /// Whether the buffer holds no bytes.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The raw bytes; shares storage with every typed view.
    pub fn as_bytes(&self) -> &[u8] {
        &cast::bytes_of(&self.words)[..self.len]
    }

    /// Mutable access to the raw bytes.
    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut cast::bytes_of_mut(&mut self.words)[..self.len]
    }

    /// A typed view over the whole buffer, element count derived from the
    /// byte length.
    ///
    /// The view shares storage with the buffer; no bytes are copied.
    pub fn view<T: Scalar>(&self) -> Result<&[T], BufferError> {
        cast::cast_slice(self.as_bytes())
    }

    /// A typed view selected at runtime.
    pub fn view_dyn(&self, ty: ElementType) -> Result<TypedSlice<'_>, BufferError> {
        Ok(match ty {
            ElementType::I8 => TypedSlice::I8(self.view()?),
            ElementType::I16 => TypedSlice::I16(self.view()?),
            ElementType::I32 => TypedSlice::I32(self.view()?),
            ElementType::I64 => TypedSlice::I64(self.view()?),
            ElementType::U8 => TypedSlice::U8(self.view()?),
            ElementType::U16 => TypedSlice::U16(self.view()?),
            ElementType::U32 => TypedSlice::U32(self.view()?),
            ElementType::U64 => TypedSlice::U64(self.view()?),
            ElementType::F32 => TypedSlice::F32(self.view()?),
            ElementType::F64 => TypedSlice::F64(self.view()?),
        })
    }

    /// Copy `src` into the buffer starting at `offset`.
    ///
    /// Fails without touching the buffer when the range does not fit; the
    /// error reports both the requested and the available extent.
    pub fn write_at(&mut self, offset: usize, src: &[u8]) -> Result<(), BufferError> {
        let end = offset.checked_add(src.len()).filter(|end| *end <= self.len);
        match end {
            Some(end) => {
                self.as_bytes_mut()[offset..end].copy_from_slice(src);
                Ok(())
            }
            None => Err(BufferError::OutOfRange {
                offset,
                len: src.len(),
                capacity: self.len,
            }),
        }
    }

    /// Copy the contents out to host memory.
    ///
    /// An empty buffer is refused: empty chunks never legitimately cross a
    /// port, so asking for one indicates a protocol error upstream.
    pub fn copy_out(&self) -> Result<Vec<u8>, BufferError> {
        if self.len == 0 {
            return Err(BufferError::Empty);
        }
        Ok(self.as_bytes().to_vec())
    }

    /// Copy the contents out as [`Bytes`] for queueing.
    pub fn to_bytes(&self) -> Result<Bytes, BufferError> {
        self.copy_out().map(Bytes::from)
    }
}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Buffer({} bytes)", self.len)
    }
}

/// Element type selector for dynamically typed buffer views.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub enum ElementType {
    I8,
    I16,
    I32,
    I64,
    U8,
    U16,
    U32,
    U64,
    F32,
    F64,
}

impl ElementType {
    /// Width of one element in bytes.
    pub fn width(self) -> usize {
        match self {
            ElementType::I8 | ElementType::U8 => 1,
            ElementType::I16 | ElementType::U16 => 2,
            ElementType::I32 | ElementType::U32 | ElementType::F32 => 4,
            ElementType::I64 | ElementType::U64 | ElementType::F64 => 8,
        }
    }

    /// Type name used in diagnostics.
    pub fn name(self) -> &'static str {
        match self {
            ElementType::I8 => "i8",
            ElementType::I16 => "i16",
            ElementType::I32 => "i32",
            ElementType::I64 => "i64",
            ElementType::U8 => "u8",
            ElementType::U16 => "u16",
            ElementType::U32 => "u32",
            ElementType::U64 => "u64",
            ElementType::F32 => "f32",
            ElementType::F64 => "f64",
        }
    }
}

/// A borrowed typed view over a [`Buffer`], selected at runtime.
#[derive(Debug, Clone, Copy, PartialEq)]
#[allow(missing_docs)]
pub enum TypedSlice<'a> {
    I8(&'a [i8]),
    I16(&'a [i16]),
    I32(&'a [i32]),
    I64(&'a [i64]),
    U8(&'a [u8]),
    U16(&'a [u16]),
    U32(&'a [u32]),
    U64(&'a [u64]),
    F32(&'a [f32]),
    F64(&'a [f64]),
}

impl TypedSlice<'_> {
    /// Number of elements in the view.
    pub fn len(&self) -> usize {
        match self {
            TypedSlice::I8(s) => s.len(),
            TypedSlice::I16(s) => s.len(),
            TypedSlice::I32(s) => s.len(),
            TypedSlice::I64(s) => s.len(),
            TypedSlice::U8(s) => s.len(),
            TypedSlice::U16(s) => s.len(),
            TypedSlice::U32(s) => s.len(),
            TypedSlice::U64(s) => s.len(),
            TypedSlice::F32(s) => s.len(),
            TypedSlice::F64(s) => s.len(),
        }
    }

    /// Whether the view holds no elements.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
