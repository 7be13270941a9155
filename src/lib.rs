//! neurite: a dense 4-axis tensor engine for convolutional networks.
//!
//! The crate provides the numeric core a neural-network library is built on:
//! a contiguous `f32` [`Tensor`] indexed by (width, height, depth, batch), and
//! three interchangeable kernel backends that implement its heavy operations.
//!
//! # Features
//!
//! - Elementwise arithmetic with batch broadcasting, matrix multiplication,
//!   2-D convolution and max/average pooling.
//! - The backward counterparts needed for backpropagation: convolution input
//!   and kernel gradients, pooling gradients.
//! - A single-threaded reference backend, a `rayon` data-parallel backend and
//!   an optional `wgpu` compute-shader backend that agree within tolerance.
//! - A compact little-endian binary tensor format.
//!
//! # Modules
//!
//! - [`shape`]: layout descriptor and flat-index arithmetic.
//! - [`padding`]: `Valid`/`Same`/`Full` window geometry.
//! - [`tensor`]: the tensor type and its operations.
//! - [`backend`]: backend enumeration and per-backend operation table.
//! - [`ops`]: the kernel capability trait, its implementations and the
//!   execution [`Context`].
//! - [`approx`]: float tolerance helpers.
//!
//! # Feature Flags
//!
//! - `wgpu`: enables the GPU backend.
//!
//! # Example
//!
//! ```rust
//! use neurite::{tensor, Context, Tensor};
//!
//! let ctx = Context::cpu();
//! let a = tensor!([[0.0, 1.0, 2.0, 3.0], [4.0, 5.0, 6.0, 7.0]]);
//! let b = tensor!([[0.0, 1.0], [2.0, 3.0], [4.0, 5.0], [6.0, 7.0]]);
//! let c = a.matmul(&ctx, &b)?;
//! assert_eq!(c.values(), &[28.0, 34.0, 76.0, 98.0]);
//! # Ok::<(), neurite::Error>(())
//! ```

pub mod approx;
pub mod backend;
pub mod error;
pub mod ops;
pub mod padding;
pub mod shape;
pub mod tensor;

pub use backend::{Backend, Op};
pub use error::{Error, Result};
pub use ops::dispatch::{Context, ContextBuilder};
pub use ops::{Kernels, PoolType};
pub use padding::{PaddingType, Window};
pub use shape::Shape;
pub use tensor::{Residency, Tensor};
