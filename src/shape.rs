//! Four-axis layout descriptor.
//!
//! A [`Shape`] names the logical extent of a tensor along its four axes:
//! `width` (fastest varying), `height`, `depth` and `batch`. Strides are
//! computed once at construction, so flat-index arithmetic is a handful of
//! multiply-adds.
//!
//! ## Layout
//!
//! ```text
//! index(w, h, d, n) = w + h * stride0 + d * stride1 + n * stride2
//!
//! stride0 = width
//! stride1 = width * height
//! stride2 = width * height * depth
//! ```
//!
//! Shapes are immutable values; [`Shape::reshape`] returns a new one.

use crate::error::{Error, Result};
use core::fmt;
use std::io::{Read, Write};

/// Immutable (width, height, depth, batch) descriptor with precomputed strides.
#[derive(Debug, Clone, Copy, Eq)]
pub struct Shape {
    dims: [usize; 4],
    strides: [usize; 3],
    len: usize,
}

impl Shape {
    /// Creates a shape from its four axes.
    #[must_use]
    pub const fn new(width: usize, height: usize, depth: usize, batch: usize) -> Self {
        let stride0 = width;
        let stride1 = stride0 * height;
        let stride2 = stride1 * depth;
        Self {
            dims: [width, height, depth, batch],
            strides: [stride0, stride1, stride2],
            len: stride2 * batch,
        }
    }

    /// [`Shape::new`] that returns `None` when the element count overflows `usize`.
    #[must_use]
    pub const fn checked(width: usize, height: usize, depth: usize, batch: usize) -> Option<Self> {
        let Some(stride1) = width.checked_mul(height) else {
            return None;
        };
        let Some(stride2) = stride1.checked_mul(depth) else {
            return None;
        };
        let Some(len) = stride2.checked_mul(batch) else {
            return None;
        };
        Some(Self {
            dims: [width, height, depth, batch],
            strides: [width, stride1, stride2],
            len,
        })
    }

    #[must_use]
    pub const fn width(&self) -> usize {
        self.dims[0]
    }

    #[must_use]
    pub const fn height(&self) -> usize {
        self.dims[1]
    }

    #[must_use]
    pub const fn depth(&self) -> usize {
        self.dims[2]
    }

    #[must_use]
    pub const fn batch(&self) -> usize {
        self.dims[3]
    }

    /// Total number of elements.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Number of elements in a single batch entry (`width * height * depth`).
    #[must_use]
    pub const fn batch_len(&self) -> usize {
        self.strides[2]
    }

    /// Number of elements in a single (depth, batch) plane (`width * height`).
    #[must_use]
    pub const fn plane_len(&self) -> usize {
        self.strides[1]
    }

    /// The four axes as `[width, height, depth, batch]`.
    #[must_use]
    pub const fn dims(&self) -> [usize; 4] {
        self.dims
    }

    /// The three non-trivial strides `[stride0, stride1, stride2]`.
    #[must_use]
    pub const fn strides(&self) -> [usize; 3] {
        self.strides
    }

    /// Same per-batch layout with a different batch size.
    #[must_use]
    pub const fn with_batch(&self, batch: usize) -> Self {
        Self::new(self.dims[0], self.dims[1], self.dims[2], batch)
    }

    /// Flat offset of the element at the given coordinates.
    ///
    /// # Panics
    ///
    /// Panics if any coordinate is outside its axis. Out-of-range access is a
    /// programming error, not a recoverable condition.
    #[must_use]
    pub fn index(&self, w: usize, h: usize, d: usize, n: usize) -> usize {
        assert!(
            w < self.dims[0] && h < self.dims[1] && d < self.dims[2] && n < self.dims[3],
            "index ({w}, {h}, {d}, {n}) out of range for shape {self}"
        );
        w + h * self.strides[0] + d * self.strides[1] + n * self.strides[2]
    }

    /// Flat offset for possibly out-of-bounds spatial coordinates.
    ///
    /// Used by padded sliding-window loops: positions outside the spatial
    /// extent yield `None` so the caller can substitute its default value.
    #[must_use]
    pub fn index_checked(&self, x: isize, y: isize, d: usize, n: usize) -> Option<usize> {
        if x < 0 || y < 0 {
            return None;
        }
        let (x, y) = (x as usize, y as usize);
        if x >= self.dims[0] || y >= self.dims[1] || d >= self.dims[2] || n >= self.dims[3] {
            return None;
        }
        Some(x + y * self.strides[0] + d * self.strides[1] + n * self.strides[2])
    }

    /// Returns a shape with the same length and the given axes.
    ///
    /// At most one axis may be the wildcard `-1`; it is resolved as
    /// `len / product(other axes)`.
    ///
    /// # Errors
    ///
    /// - more than one wildcard, or a negative axis other than `-1`
    /// - the resulting axes do not multiply to [`Shape::len`]
    pub fn reshape(&self, dims: [isize; 4]) -> Result<Self> {
        let invalid = |reason| Error::InvalidReshape {
            from: *self,
            dims,
            reason,
        };

        let wildcards = dims.iter().filter(|&&d| d == -1).count();
        if wildcards > 1 {
            return Err(invalid("more than one wildcard axis"));
        }
        if dims.iter().any(|&d| d < -1) {
            return Err(invalid("negative axis"));
        }

        let known: usize = dims.iter().filter(|&&d| d != -1).map(|&d| d as usize).product();
        let mut resolved = [0usize; 4];
        for (slot, &d) in resolved.iter_mut().zip(dims.iter()) {
            *slot = if d == -1 {
                if known == 0 || self.len % known != 0 {
                    return Err(invalid("wildcard does not divide the length"));
                }
                self.len / known
            } else {
                d as usize
            };
        }

        let shape = Self::new(resolved[0], resolved[1], resolved[2], resolved[3]);
        if shape.len != self.len {
            return Err(invalid("element count differs"));
        }
        Ok(shape)
    }

    /// Writes the shape as four little-endian `i32`s (width, height, depth, batch).
    ///
    /// # Errors
    ///
    /// Propagates I/O errors; axes above `i32::MAX` are rejected as corrupt.
    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        for &dim in &self.dims {
            let dim = i32::try_from(dim)
                .map_err(|_| Error::Corrupt(format!("axis {dim} does not fit in i32")))?;
            writer.write_all(&dim.to_le_bytes())?;
        }
        Ok(())
    }

    /// Reads a shape written by [`Shape::write_to`].
    ///
    /// # Errors
    ///
    /// Propagates I/O errors; negative axes and axes whose product overflows
    /// are reported as [`Error::Corrupt`].
    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        let mut dims = [0usize; 4];
        let mut buf = [0u8; 4];
        for dim in &mut dims {
            reader.read_exact(&mut buf)?;
            let value = i32::from_le_bytes(buf);
            *dim = usize::try_from(value)
                .map_err(|_| Error::Corrupt(format!("negative axis {value} in shape")))?;
        }
        let [w, h, d, n] = dims;
        Self::checked(w, h, d, n)
            .ok_or_else(|| Error::Corrupt(format!("shape {dims:?} overflows the element count")))
    }
}

impl PartialEq for Shape {
    fn eq(&self, other: &Self) -> bool {
        self.len == other.len && self.dims[..3] == other.dims[..3]
    }
}

impl Default for Shape {
    fn default() -> Self {
        Self::new(1, 1, 1, 1)
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [w, h, d, n] = self.dims;
        write!(f, "({w}, {h}, {d}, {n})")
    }
}

impl From<usize> for Shape {
    fn from(width: usize) -> Self {
        Self::new(width, 1, 1, 1)
    }
}

impl From<(usize, usize)> for Shape {
    fn from((width, height): (usize, usize)) -> Self {
        Self::new(width, height, 1, 1)
    }
}

impl From<(usize, usize, usize)> for Shape {
    fn from((width, height, depth): (usize, usize, usize)) -> Self {
        Self::new(width, height, depth, 1)
    }
}

impl From<(usize, usize, usize, usize)> for Shape {
    fn from((width, height, depth, batch): (usize, usize, usize, usize)) -> Self {
        Self::new(width, height, depth, batch)
    }
}

impl From<[usize; 4]> for Shape {
    fn from([width, height, depth, batch]: [usize; 4]) -> Self {
        Self::new(width, height, depth, batch)
    }
}
