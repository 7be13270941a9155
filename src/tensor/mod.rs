//! Core tensor data structure.
//!
//! A [`Tensor`] is a [`Shape`] plus a contiguous `Vec<f32>` whose length is
//! always exactly `shape.len()`. Elements are laid out width-fastest:
//!
//! ```text
//! values[w + h * width + d * width * height + n * width * height * depth]
//! ```
//!
//! Heavy operations (arithmetic, matmul, convolution, pooling and their
//! gradients) are routed to a backend through an explicit
//! [`Context`](crate::Context) and live in `ops.rs`. Layout changes are in
//! `layout.rs`, the binary format in `io.rs` and the host/device residency
//! model in `device.rs`.
//!
//! ## Example
//!
//! ```rust
//! use neurite::{Shape, Tensor};
//!
//! let mut t = Tensor::zeros((3, 2));
//! t.fill_with_range(0.0, 1.0);
//! assert_eq!(t.get(2, 1, 0, 0), 5.0);
//! assert_eq!(t.shape(), Shape::new(3, 2, 1, 1));
//! ```

mod device;
mod io;
mod layout;
mod ops;

pub use device::Residency;

use crate::approx;
use crate::error::{Error, Result};
use crate::shape::Shape;
use core::fmt;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Dense 4-axis `f32` tensor.
pub struct Tensor {
    shape: Shape,
    values: Vec<f32>,
    #[cfg(feature = "wgpu")]
    mirror: device::DeviceMirror,
}

impl Tensor {
    /// Creates a tensor from a shape and its flat values.
    ///
    /// # Panics
    ///
    /// Panics if `values.len() != shape.len()`.
    #[must_use]
    pub fn new(shape: impl Into<Shape>, values: Vec<f32>) -> Self {
        let shape = shape.into();
        assert_eq!(
            shape.len(),
            values.len(),
            "shape {shape} is incompatible with {} values",
            values.len()
        );
        Self::from_parts(shape, values)
    }

    /// Fallible [`Tensor::new`].
    ///
    /// # Errors
    ///
    /// [`Error::LengthMismatch`] if `values.len() != shape.len()`.
    pub fn try_new(shape: impl Into<Shape>, values: Vec<f32>) -> Result<Self> {
        let shape = shape.into();
        if shape.len() != values.len() {
            return Err(Error::LengthMismatch {
                shape,
                expected: shape.len(),
                got: values.len(),
            });
        }
        Ok(Self::from_parts(shape, values))
    }

    pub(crate) fn from_parts(shape: Shape, values: Vec<f32>) -> Self {
        debug_assert_eq!(shape.len(), values.len());
        Self {
            shape,
            values,
            #[cfg(feature = "wgpu")]
            mirror: device::DeviceMirror::default(),
        }
    }

    #[must_use]
    pub fn zeros(shape: impl Into<Shape>) -> Self {
        Self::filled(shape, 0.0)
    }

    #[must_use]
    pub fn filled(shape: impl Into<Shape>, value: f32) -> Self {
        let shape = shape.into();
        Self::from_parts(shape, vec![value; shape.len()])
    }

    /// Builds a tensor by evaluating `f(w, h, d, n)` at every position.
    #[must_use]
    pub fn from_fn(shape: impl Into<Shape>, mut f: impl FnMut(usize, usize, usize, usize) -> f32) -> Self {
        let shape = shape.into();
        let mut values = Vec::with_capacity(shape.len());
        for n in 0..shape.batch() {
            for d in 0..shape.depth() {
                for h in 0..shape.height() {
                    for w in 0..shape.width() {
                        values.push(f(w, h, d, n));
                    }
                }
            }
        }
        Self::from_parts(shape, values)
    }

    #[must_use]
    pub fn shape(&self) -> Shape {
        self.shape
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.shape.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.shape.is_empty()
    }

    /// Host values.
    ///
    /// # Panics
    ///
    /// Panics if the tensor is device-resident; call
    /// [`Tensor::sync_to_host`] first.
    #[must_use]
    pub fn values(&self) -> &[f32] {
        self.assert_host_readable();
        &self.values
    }

    /// Mutable host values. Invalidates any device copy.
    ///
    /// # Panics
    ///
    /// Panics if the tensor is device-resident; call
    /// [`Tensor::sync_to_host`] first.
    pub fn values_mut(&mut self) -> &mut [f32] {
        self.assert_host_readable();
        self.claim_host();
        &mut self.values
    }

    /// Consumes the tensor, returning its host values.
    ///
    /// # Panics
    ///
    /// Panics if the tensor is device-resident.
    #[must_use]
    pub fn into_vec(self) -> Vec<f32> {
        self.assert_host_readable();
        self.values
    }

    #[must_use]
    pub fn to_vec(&self) -> Vec<f32> {
        self.values().to_vec()
    }

    /// # Panics
    ///
    /// Panics if the coordinates are out of range or the tensor is device-resident.
    #[must_use]
    pub fn get(&self, w: usize, h: usize, d: usize, n: usize) -> f32 {
        self.values()[self.shape.index(w, h, d, n)]
    }

    /// # Panics
    ///
    /// Panics if the coordinates are out of range or the tensor is device-resident.
    pub fn set(&mut self, w: usize, h: usize, d: usize, n: usize, value: f32) {
        let i = self.shape.index(w, h, d, n);
        self.values_mut()[i] = value;
    }

    /// Sets every element to `value`. Allowed on device-resident tensors.
    pub fn fill(&mut self, value: f32) {
        self.overwrite().fill(value);
    }

    pub fn zero(&mut self) {
        self.fill(0.0);
    }

    /// Sets element `i` (in flat order) to `start + i * step`.
    pub fn fill_with_range(&mut self, start: f32, step: f32) {
        for (i, v) in self.overwrite().iter_mut().enumerate() {
            *v = start + i as f32 * step;
        }
    }

    /// Fills with uniform samples from `[min, max)`.
    ///
    /// With a seed the sequence is reproducible; without one the generator is
    /// seeded from the operating system.
    ///
    /// # Panics
    ///
    /// Panics if `min >= max`.
    pub fn fill_with_rand(&mut self, seed: Option<u64>, min: f32, max: f32) {
        let mut rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        for v in self.overwrite() {
            *v = rng.random_range(min..max);
        }
    }

    /// Applies `f` to every element, returning a new tensor.
    #[must_use]
    pub fn map(&self, f: impl Fn(f32) -> f32) -> Self {
        Self::from_parts(self.shape, self.values().iter().map(|&v| f(v)).collect())
    }

    #[must_use]
    pub fn negated(&self) -> Self {
        self.map(|v| -v)
    }

    /// Every element clamped into `[min, max]`.
    #[must_use]
    pub fn clipped(&self, min: f32, max: f32) -> Self {
        self.map(|v| v.clamp(min, max))
    }

    #[must_use]
    pub fn add_scalar(&self, scalar: f32) -> Self {
        self.map(|v| v + scalar)
    }

    #[must_use]
    pub fn sub_scalar(&self, scalar: f32) -> Self {
        self.map(|v| v - scalar)
    }

    #[must_use]
    pub fn mul_scalar(&self, scalar: f32) -> Self {
        self.map(|v| v * scalar)
    }

    #[must_use]
    pub fn div_scalar(&self, scalar: f32) -> Self {
        self.map(|v| v / scalar)
    }

    fn batch_values(&self, batch: Option<usize>) -> &[f32] {
        let values = self.values();
        match batch {
            None => values,
            Some(n) => {
                assert!(
                    n < self.shape.batch(),
                    "batch {n} out of range for shape {}",
                    self.shape
                );
                let len = self.shape.batch_len();
                &values[n * len..(n + 1) * len]
            }
        }
    }

    /// Sum of all elements, or of batch entry `n` only.
    ///
    /// # Panics
    ///
    /// Panics if `batch` is out of range.
    #[must_use]
    pub fn sum(&self, batch: Option<usize>) -> f32 {
        self.batch_values(batch).iter().sum()
    }

    /// Mean of all elements (or of one batch entry). NaN when empty.
    #[must_use]
    pub fn avg(&self, batch: Option<usize>) -> f32 {
        let values = self.batch_values(batch);
        values.iter().sum::<f32>() / values.len() as f32
    }

    /// Largest element; `f32::MIN` when empty.
    #[must_use]
    pub fn max(&self, batch: Option<usize>) -> f32 {
        self.batch_values(batch).iter().copied().fold(f32::MIN, f32::max)
    }

    /// Flat index of the first largest element, relative to the start of the
    /// batch entry when `batch` is given.
    #[must_use]
    pub fn arg_max(&self, batch: Option<usize>) -> usize {
        arg_max(self.batch_values(batch))
    }

    fn per_batch(&self, f: impl Fn(&[f32]) -> f32) -> Self {
        let n = self.shape.batch();
        let len = self.shape.batch_len();
        let values = self.values();
        let out = (0..n).map(|i| f(&values[i * len..(i + 1) * len])).collect();
        Self::from_parts(Shape::new(1, 1, 1, n), out)
    }

    /// Per-batch sums, shape `(1, 1, 1, batch)`.
    #[must_use]
    pub fn sum_per_batch(&self) -> Self {
        self.per_batch(|v| v.iter().sum())
    }

    /// Per-batch maxima, shape `(1, 1, 1, batch)`.
    #[must_use]
    pub fn max_per_batch(&self) -> Self {
        self.per_batch(|v| v.iter().copied().fold(f32::MIN, f32::max))
    }

    /// Per-batch arg-max indices (relative to each batch entry), stored as
    /// `f32`, shape `(1, 1, 1, batch)`.
    #[must_use]
    pub fn arg_max_per_batch(&self) -> Self {
        self.per_batch(|v| arg_max(v) as f32)
    }

    /// Sums over the batch axis, shape `(width, height, depth, 1)`.
    #[must_use]
    pub fn sum_batches(&self) -> Self {
        let len = self.shape.batch_len();
        let mut out = vec![0.0; len];
        if len > 0 {
            for entry in self.values().chunks_exact(len) {
                for (o, &v) in out.iter_mut().zip(entry) {
                    *o += v;
                }
            }
        }
        Self::from_parts(self.shape.with_batch(1), out)
    }

    /// Equal shapes and every element within `tolerance` (absolute).
    ///
    /// A tolerance of 0 demands exact equality.
    #[must_use]
    pub fn equals(&self, other: &Self, tolerance: f32) -> bool {
        self.shape == other.shape
            && self
                .values()
                .iter()
                .zip(other.values())
                .all(|(&a, &b)| a == b || (a - b).abs() <= tolerance)
    }

    /// Equal shapes and every element pair within `atol + rtol * max(|a|, |b|)`.
    #[must_use]
    pub fn approx_eq(&self, other: &Self, rtol: f32, atol: f32) -> bool {
        self.shape == other.shape && approx::all_close(self.values(), other.values(), rtol, atol)
    }
}

fn arg_max(values: &[f32]) -> usize {
    let mut best = 0;
    for (i, &v) in values.iter().enumerate() {
        if v > values[best] {
            best = i;
        }
    }
    best
}

impl Clone for Tensor {
    fn clone(&self) -> Self {
        Self {
            shape: self.shape,
            values: self.values.clone(),
            #[cfg(feature = "wgpu")]
            mirror: self.mirror.duplicate(self.shape.len()),
        }
    }
}

impl PartialEq for Tensor {
    fn eq(&self, other: &Self) -> bool {
        self.shape == other.shape && self.values() == other.values()
    }
}

impl fmt::Debug for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct("Tensor");
        s.field("shape", &self.shape).field("residency", &self.residency());
        if self.residency() == Residency::Device {
            s.field("values", &"<device>");
        } else {
            s.field("values", &self.values);
        }
        s.finish()
    }
}

impl Default for Tensor {
    fn default() -> Self {
        Self::zeros(Shape::default())
    }
}

/// Nested-literal builder behind [`tensor!`](crate::tensor!).
#[doc(hidden)]
pub struct Literal {
    dims: Vec<usize>,
    values: Vec<f32>,
}

impl Literal {
    #[must_use]
    pub fn leaf(value: f32) -> Self {
        Self {
            dims: Vec::new(),
            values: vec![value],
        }
    }

    /// # Panics
    ///
    /// Panics on ragged input (children of differing shapes).
    #[must_use]
    pub fn nest(children: Vec<Self>) -> Self {
        let inner = children[0].dims.clone();
        assert!(
            children.iter().all(|c| c.dims == inner),
            "ragged tensor literal (rows have mismatched shapes)"
        );
        let mut dims = vec![children.len()];
        dims.extend_from_slice(&inner);
        let values = children.into_iter().flat_map(|c| c.values).collect();
        Self { dims, values }
    }

    /// # Panics
    ///
    /// Panics on more than four nesting levels.
    #[must_use]
    pub fn into_tensor(self) -> Tensor {
        assert!(self.dims.len() <= 4, "tensor literals have at most four axes");
        let mut axes = [1usize; 4];
        for (axis, &dim) in axes.iter_mut().zip(self.dims.iter().rev()) {
            *axis = dim;
        }
        Tensor::new(axes, self.values)
    }
}

/// Defines a tensor from nested literal arrays.
///
/// The innermost nesting level is the width axis, then height, depth and
/// batch. Negative values must be parenthesized.
///
/// # Example
/// ```
/// use neurite::tensor;
/// let t = tensor!([[1.0, 2.0, 3.0], [(-4.0), 5.0, 6.0]]);
/// assert_eq!(t.shape().dims(), [3, 2, 1, 1]);
/// assert_eq!(t.get(0, 1, 0, 0), -4.0);
/// ```
#[macro_export]
macro_rules! tensor {
    (@lit [ $( $inner:tt ),+ $(,)? ]) => {
        $crate::tensor::Literal::nest(vec![ $( $crate::tensor!(@lit $inner) ),+ ])
    };
    (@lit $value:expr) => {
        $crate::tensor::Literal::leaf($value as f32)
    };
    ([ $( $inner:tt ),+ $(,)? ]) => {
        $crate::tensor!(@lit [ $( $inner ),+ ]).into_tensor()
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[should_panic(expected = "incompatible")]
    fn new_rejects_wrong_length() {
        let _ = Tensor::new((2, 2), vec![1.0, 2.0, 3.0]);
    }

    #[test]
    fn macro_maps_innermost_level_to_width() {
        let t = crate::tensor!([[[1, 2]], [[3, 4]]]);
        assert_eq!(t.shape().dims(), [2, 1, 2, 1]);
        assert_eq!(t.values(), &[1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn reductions() {
        let t = Tensor::new((2, 1, 1, 3), vec![1.0, 5.0, -2.0, 0.5, 7.0, 7.0]);
        assert_eq!(t.sum(None), 18.5);
        assert_eq!(t.sum(Some(1)), -1.5);
        assert_eq!(t.max(Some(0)), 5.0);
        assert_eq!(t.arg_max(None), 4);
        assert_eq!(t.arg_max(Some(2)), 0);
        assert_eq!(t.avg(Some(2)), 7.0);
        assert_eq!(t.sum_per_batch().values(), &[6.0, -1.5, 14.0]);
        assert_eq!(t.arg_max_per_batch().values(), &[1.0, 1.0, 0.0]);
        assert_eq!(t.sum_batches().values(), &[6.0, 12.5]);
        assert_eq!(t.sum_batches().shape().dims(), [2, 1, 1, 1]);
        assert_eq!(t.max_per_batch().values(), &[5.0, 0.5, 7.0]);
        assert_eq!(t.max_per_batch().shape().dims(), [1, 1, 1, 3]);
    }

    #[test]
    fn from_fn_visits_width_fastest() {
        let t = Tensor::from_fn((2, 3, 2, 2), |w, h, d, n| (w + 10 * h + 100 * d + 1000 * n) as f32);
        assert_eq!(t.shape().dims(), [2, 3, 2, 2]);
        assert_eq!(t.values()[..3], [0.0, 1.0, 10.0]);
        assert_eq!(t.get(1, 2, 1, 1), 1121.0);
        assert_eq!(t.values()[t.len() - 1], 1121.0);
    }

    #[test]
    fn scalar_ops_write_into_result() {
        let t = Tensor::new((2, 2), vec![1.0, 2.0, 3.0, 4.0]);
        let mut result = Tensor::filled((2, 2), f32::NAN);
        t.add_scalar_into(1.0, &mut result).unwrap();
        assert_eq!(result, t.add_scalar(1.0));
        t.sub_scalar_into(1.0, &mut result).unwrap();
        assert_eq!(result.values(), &[0.0, 1.0, 2.0, 3.0]);
        t.mul_scalar_into(2.0, &mut result).unwrap();
        assert_eq!(result, t.mul_scalar(2.0));
        t.div_scalar_into(4.0, &mut result).unwrap();
        assert_eq!(result.values(), &[0.25, 0.5, 0.75, 1.0]);

        let mut wrong = Tensor::zeros((4, 1));
        assert!(matches!(
            t.add_scalar_into(1.0, &mut wrong),
            Err(Error::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn seeded_random_fill_is_reproducible() {
        let mut a = Tensor::zeros((8, 8));
        let mut b = Tensor::zeros((8, 8));
        a.fill_with_rand(Some(7), -1.0, 1.0);
        b.fill_with_rand(Some(7), -1.0, 1.0);
        assert_eq!(a, b);
        assert!(a.values().iter().all(|v| (-1.0..1.0).contains(v)));
    }

    #[test]
    fn tolerance_equality() {
        let a = Tensor::new(2, vec![1.0, 2.0]);
        let b = Tensor::new(2, vec![1.0, 2.05]);
        assert!(!a.equals(&b, 0.0));
        assert!(a.equals(&b, 0.1));
        assert!(!a.equals(&Tensor::new((1, 2), vec![1.0, 2.0]), 1.0));
    }
}
