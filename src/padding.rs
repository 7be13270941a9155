//! Padding policies and sliding-window geometry.
//!
//! Convolution and pooling share one rule for turning an input extent `S`,
//! a kernel extent `K` and a stride `s` into an output extent and a padding
//! amount:
//!
//! | policy  | output                 | padding each side |
//! |---------|------------------------|-------------------|
//! | `Valid` | `floor((S - K) / s) + 1` | `0`             |
//! | `Same`  | `floor(S / s)`           | `floor(K / 2)`  |
//! | `Full`  | `floor((S + K - 1) / s)` | `K - 1`         |
//!
//! Padding is never materialized: kernels read out-of-bounds positions as a
//! caller-chosen default (0 for convolution and average pooling, `f32::MIN`
//! for max pooling).

use crate::error::{Error, Result};
use crate::shape::Shape;
use core::fmt;

/// Rule deciding the output extent and the padding of a sliding window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PaddingType {
    /// Only positions where the window fits entirely inside the input.
    #[default]
    Valid,
    /// Output keeps the input extent (at stride 1).
    Same,
    /// Every position where the window overlaps the input at all.
    Full,
}

impl fmt::Display for PaddingType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Valid => "valid",
            Self::Same => "same",
            Self::Full => "full",
        })
    }
}

impl PaddingType {
    /// Output extent and padding along one axis.
    ///
    /// # Errors
    ///
    /// - `stride == 0`
    /// - `Valid` padding with `kernel > size`
    pub fn params(self, size: usize, kernel: usize, stride: usize) -> Result<(usize, usize)> {
        if stride == 0 {
            return Err(Error::InvalidWindow("stride must be positive".into()));
        }
        if kernel == 0 {
            return Err(Error::InvalidWindow("kernel extent must be positive".into()));
        }
        Ok(match self {
            Self::Valid => {
                if kernel > size {
                    return Err(Error::InvalidWindow(format!(
                        "kernel extent {kernel} exceeds input extent {size} under valid padding"
                    )));
                }
                ((size - kernel) / stride + 1, 0)
            }
            Self::Same => (size / stride, kernel / 2),
            Self::Full => ((size + kernel - 1) / stride, kernel - 1),
        })
    }
}

/// Resolved geometry of a 2-D sliding window over a tensor.
///
/// `kernel_w`/`kernel_h` are the window extents, `pad_x`/`pad_y` the conceptual
/// padding on the leading edge of each axis, and `out_w`/`out_h` the number of
/// window positions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
    pub kernel_w: usize,
    pub kernel_h: usize,
    pub stride: usize,
    pub pad_x: usize,
    pub pad_y: usize,
    pub out_w: usize,
    pub out_h: usize,
}

impl Window {
    /// Resolves the window of a `kernel_w × kernel_h` kernel sliding over
    /// `input`'s spatial axes.
    ///
    /// # Errors
    ///
    /// See [`PaddingType::params`].
    pub fn new(
        input: Shape,
        kernel_w: usize,
        kernel_h: usize,
        stride: usize,
        padding: PaddingType,
    ) -> Result<Self> {
        let (out_w, pad_x) = padding.params(input.width(), kernel_w, stride)?;
        let (out_h, pad_y) = padding.params(input.height(), kernel_h, stride)?;
        Ok(Self {
            kernel_w,
            kernel_h,
            stride,
            pad_x,
            pad_y,
            out_w,
            out_h,
        })
    }

    /// Leading-edge input x coordinate of output column `out_x`.
    #[inline]
    #[must_use]
    pub fn origin_x(&self, out_x: usize) -> isize {
        (out_x * self.stride) as isize - self.pad_x as isize
    }

    /// Leading-edge input y coordinate of output row `out_y`.
    #[inline]
    #[must_use]
    pub fn origin_y(&self, out_y: usize) -> isize {
        (out_y * self.stride) as isize - self.pad_y as isize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn output_sizes_follow_policy_formulas() {
        for size in 1..12usize {
            for kernel in 1..6usize {
                for stride in 1..4usize {
                    if kernel <= size {
                        assert_eq!(
                            PaddingType::Valid.params(size, kernel, stride).unwrap(),
                            ((size - kernel) / stride + 1, 0)
                        );
                    }
                    assert_eq!(
                        PaddingType::Same.params(size, kernel, stride).unwrap(),
                        (size / stride, kernel / 2)
                    );
                    assert_eq!(
                        PaddingType::Full.params(size, kernel, stride).unwrap(),
                        ((size + kernel - 1) / stride, kernel - 1)
                    );
                }
            }
        }
    }

    #[test]
    fn invalid_windows_are_rejected() {
        assert!(PaddingType::Valid.params(4, 3, 0).is_err());
        assert!(PaddingType::Valid.params(2, 3, 1).is_err());
        assert!(PaddingType::Same.params(4, 0, 1).is_err());
    }

    #[test]
    fn window_origins_include_padding() {
        let w = Window::new(Shape::from((5, 5)), 3, 3, 2, PaddingType::Full).unwrap();
        assert_eq!((w.out_w, w.out_h), (3, 3));
        assert_eq!(w.origin_x(0), -2);
        assert_eq!(w.origin_y(2), 2);
    }
}
