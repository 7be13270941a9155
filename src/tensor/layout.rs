//! Shape-changing host operations.
//!
//! Everything here except [`Tensor::reshape`] produces a new buffer.
//! Concatenation and splitting work batch-wise over the flattened per-batch
//! length: concatenating tensors `a` and `b` with batch `n` yields, for every
//! batch entry, `a`'s entry followed by `b`'s.

use super::Tensor;
use crate::error::{Error, Result};
use crate::shape::Shape;

impl Tensor {
    /// Copy with both spatial axes reversed: `out[x, y] = in[W-1-x, H-1-y]`
    /// for every (depth, batch) plane.
    #[must_use]
    pub fn rotated180(&self) -> Self {
        let s = self.shape;
        let (w, h) = (s.width(), s.height());
        let src = self.values();
        let mut out = vec![0.0; s.len()];
        if s.plane_len() > 0 {
            for (dst, plane) in out.chunks_exact_mut(s.plane_len()).zip(src.chunks_exact(s.plane_len())) {
                for y in 0..h {
                    for x in 0..w {
                        dst[x + y * w] = plane[(w - 1 - x) + (h - 1 - y) * w];
                    }
                }
            }
        }
        Self::from_parts(s, out)
    }

    /// Reinterprets the buffer with new axes, in place. One axis may be `-1`.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidReshape`] if the axes do not describe `len()` elements.
    pub fn reshape(&mut self, dims: [isize; 4]) -> Result<()> {
        self.shape = self.shape.reshape(dims)?;
        Ok(())
    }

    /// Reshaped copy.
    ///
    /// # Errors
    ///
    /// See [`Tensor::reshape`].
    pub fn reshaped(&self, dims: [isize; 4]) -> Result<Self> {
        let shape = self.shape.reshape(dims)?;
        Ok(Self::from_parts(shape, self.values().to_vec()))
    }

    /// Stacks tensors along the batch axis.
    ///
    /// All tensors must share width, height and depth; the result batch is
    /// the sum of their batches.
    ///
    /// # Errors
    ///
    /// - [`Error::EmptyInput`] for an empty slice
    /// - [`Error::IncompatibleShapes`] when per-batch layouts differ
    pub fn merge_into_batch(tensors: &[Self]) -> Result<Self> {
        let first = tensors.first().ok_or(Error::EmptyInput { op: "merge_into_batch" })?.shape;
        let mut batch = 0;
        for t in tensors {
            let s = t.shape;
            if (s.width(), s.height(), s.depth()) != (first.width(), first.height(), first.depth()) {
                return Err(Error::IncompatibleShapes {
                    op: "merge_into_batch",
                    lhs: first,
                    rhs: s,
                });
            }
            batch += s.batch();
        }
        let shape = first.with_batch(batch);
        let mut values = Vec::with_capacity(shape.len());
        for t in tensors {
            values.extend_from_slice(t.values());
        }
        Ok(Self::from_parts(shape, values))
    }

    /// Batch entry `index` as a batch-1 tensor.
    ///
    /// # Errors
    ///
    /// [`Error::BatchOutOfRange`] if `index >= batch`.
    pub fn get_batch(&self, index: usize) -> Result<Self> {
        let mut out = Self::zeros(self.shape.with_batch(1));
        self.copy_batch_to(index, &mut out)?;
        Ok(out)
    }

    /// Copies batch entry `index` into `target`, which must hold exactly
    /// `batch_len()` elements (its shape is otherwise free).
    ///
    /// # Errors
    ///
    /// - [`Error::BatchOutOfRange`] if `index >= batch`
    /// - [`Error::LengthMismatch`] if `target` has the wrong length
    pub fn copy_batch_to(&self, index: usize, target: &mut Self) -> Result<()> {
        let batch = self.shape.batch();
        if index >= batch {
            return Err(Error::BatchOutOfRange { index, batch });
        }
        let len = self.shape.batch_len();
        if target.len() != len {
            return Err(Error::LengthMismatch {
                shape: target.shape,
                expected: len,
                got: target.len(),
            });
        }
        let src = &self.values()[index * len..(index + 1) * len];
        target.overwrite().copy_from_slice(src);
        Ok(())
    }

    /// Concatenates tensors batch-wise over their flattened per-batch length.
    ///
    /// All tensors must have the same batch `n`; the result has shape
    /// `(Σ batch_len, 1, 1, n)`.
    ///
    /// # Errors
    ///
    /// - [`Error::EmptyInput`] for an empty slice
    /// - [`Error::IncompatibleShapes`] when batches differ
    pub fn concat(tensors: &[Self]) -> Result<Self> {
        let first = tensors.first().ok_or(Error::EmptyInput { op: "concat" })?.shape;
        let batch = first.batch();
        if let Some(t) = tensors.iter().find(|t| t.shape.batch() != batch) {
            return Err(Error::IncompatibleShapes {
                op: "concat",
                lhs: first,
                rhs: t.shape,
            });
        }
        let entry: usize = tensors.iter().map(|t| t.shape.batch_len()).sum();
        let mut values = Vec::with_capacity(entry * batch);
        for n in 0..batch {
            for t in tensors {
                let len = t.shape.batch_len();
                values.extend_from_slice(&t.values()[n * len..(n + 1) * len]);
            }
        }
        Ok(Self::from_parts(Shape::new(entry, 1, 1, batch), values))
    }

    /// Inverse of [`Tensor::concat`]: cuts every batch entry into pieces with
    /// the given per-batch layouts.
    ///
    /// The batch axis of each shape is ignored; pieces inherit `self`'s batch.
    ///
    /// # Errors
    ///
    /// [`Error::LengthMismatch`] unless the pieces' per-batch lengths add up
    /// to `self`'s.
    pub fn split(&self, shapes: &[Shape]) -> Result<Vec<Self>> {
        let mut parts: Vec<Self> = shapes
            .iter()
            .map(|s| Self::zeros(s.with_batch(self.shape.batch())))
            .collect();
        self.split_into(&mut parts)?;
        Ok(parts)
    }

    /// [`Tensor::split`] into caller-supplied tensors, which must all have
    /// `self`'s batch.
    ///
    /// # Errors
    ///
    /// - [`Error::IncompatibleShapes`] when a target's batch differs
    /// - [`Error::LengthMismatch`] when per-batch lengths do not add up
    pub fn split_into(&self, targets: &mut [Self]) -> Result<()> {
        let batch = self.shape.batch();
        if let Some(t) = targets.iter().find(|t| t.shape.batch() != batch) {
            return Err(Error::IncompatibleShapes {
                op: "split",
                lhs: self.shape,
                rhs: t.shape,
            });
        }
        let total: usize = targets.iter().map(|t| t.shape.batch_len()).sum();
        if total != self.shape.batch_len() {
            return Err(Error::LengthMismatch {
                shape: self.shape,
                expected: self.shape.batch_len(),
                got: total,
            });
        }

        let src = self.values();
        let entry = self.shape.batch_len();
        for n in 0..batch {
            let mut offset = n * entry;
            for t in targets.iter_mut() {
                let len = t.shape.batch_len();
                t.overwrite()[n * len..(n + 1) * len].copy_from_slice(&src[offset..offset + len]);
                offset += len;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rotation_reverses_both_spatial_axes() {
        let t = Tensor::new((3, 2, 2, 1), (0..12).map(|v| v as f32).collect());
        let r = t.rotated180();
        assert_eq!(r.values(), &[5.0, 4.0, 3.0, 2.0, 1.0, 0.0, 11.0, 10.0, 9.0, 8.0, 7.0, 6.0]);
        assert_eq!(r.rotated180(), t);
    }

    #[test]
    fn concat_interleaves_batch_entries() {
        let a = Tensor::new((2, 1, 1, 2), vec![1.0, 2.0, 3.0, 4.0]);
        let b = Tensor::new((1, 1, 1, 2), vec![9.0, 8.0]);
        let c = Tensor::concat(&[a.clone(), b.clone()]).unwrap();
        assert_eq!(c.shape().dims(), [3, 1, 1, 2]);
        assert_eq!(c.values(), &[1.0, 2.0, 9.0, 3.0, 4.0, 8.0]);

        let parts = c.split(&[a.shape(), b.shape()]).unwrap();
        assert_eq!(parts, vec![a, b]);
    }

    #[test]
    fn split_rejects_wrong_total() {
        let t = Tensor::zeros((4, 1, 1, 2));
        assert!(matches!(
            t.split(&[Shape::from(3)]),
            Err(Error::LengthMismatch { .. })
        ));
    }
}
