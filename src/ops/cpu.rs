//! Reference CPU backend.
//!
//! Single-threaded nested loops. These kernels define the semantics every
//! other backend has to reproduce, so they favour the most literal reading of
//! each operation over speed.
//!
//! The work of every kernel is expressed as a routine over one disjoint output
//! partition (a flat range, a matrix row, a channel plane or one kernel). The
//! reference backend walks the partitions in order; the
//! [`parallel`](super::parallel) backend hands the same routines to `rayon`.

use super::{Kernels, PoolType};
use crate::backend::Backend;
use crate::error::Result;
use crate::padding::Window;
use crate::shape::Shape;
use crate::tensor::Tensor;

/// Single-threaded reference kernels.
#[derive(Debug, Clone, Copy, Default)]
pub struct CpuKernels;

impl Kernels for CpuKernels {
    fn backend(&self) -> Backend {
        Backend::Cpu
    }

    fn add(&self, a: &Tensor, alpha: f32, b: &Tensor, beta: f32, out: &mut Tensor) -> Result<()> {
        add_range(a.values(), alpha, b.values(), beta, 0, out.values_mut());
        Ok(())
    }

    fn sub(&self, a: &Tensor, b: &Tensor, out: &mut Tensor) -> Result<()> {
        add_range(a.values(), 1.0, b.values(), -1.0, 0, out.values_mut());
        Ok(())
    }

    fn mul_elementwise(&self, a: &Tensor, b: &Tensor, out: &mut Tensor) -> Result<()> {
        zip_range(a.values(), b.values(), 0, out.values_mut(), |x, y| x * y);
        Ok(())
    }

    fn div(&self, a: &Tensor, b: &Tensor, out: &mut Tensor) -> Result<()> {
        zip_range(a.values(), b.values(), 0, out.values_mut(), |x, y| x / y);
        Ok(())
    }

    fn matmul(&self, a: &Tensor, b: &Tensor, out: &mut Tensor) -> Result<()> {
        let row_len = out.shape().width();
        let (sa, sb) = (a.shape(), b.shape());
        for (row, chunk) in out.values_mut().chunks_mut(row_len).enumerate() {
            matmul_row(a.values(), sa, b.values(), sb, row, chunk);
        }
        Ok(())
    }

    fn transpose(&self, input: &Tensor, out: &mut Tensor) -> Result<()> {
        let shape = input.shape();
        for (plane, chunk) in out.values_mut().chunks_mut(shape.plane_len()).enumerate() {
            transpose_plane(input.values(), shape, plane, chunk);
        }
        Ok(())
    }

    fn conv2d(&self, input: &Tensor, kernels: &Tensor, window: &Window, out: &mut Tensor) -> Result<()> {
        let plane_len = out.shape().plane_len();
        let (si, sk) = (input.shape(), kernels.shape());
        for (plane, chunk) in out.values_mut().chunks_mut(plane_len).enumerate() {
            conv2d_plane(input.values(), si, kernels.values(), sk, window, plane, chunk);
        }
        Ok(())
    }

    fn conv2d_input_gradient(
        &self,
        output_gradient: &Tensor,
        kernels: &Tensor,
        window: &Window,
        out: &mut Tensor,
    ) -> Result<()> {
        let rotated = kernels.rotated180();
        let si = out.shape();
        let (sg, sk) = (output_gradient.shape(), rotated.shape());
        for (plane, chunk) in out.values_mut().chunks_mut(si.plane_len()).enumerate() {
            conv2d_input_gradient_plane(
                output_gradient.values(),
                sg,
                rotated.values(),
                sk,
                si,
                window,
                plane,
                chunk,
            );
        }
        Ok(())
    }

    fn conv2d_kernels_gradient(
        &self,
        input: &Tensor,
        output_gradient: &Tensor,
        window: &Window,
        out: &mut Tensor,
    ) -> Result<()> {
        let kernel_len = out.shape().batch_len();
        let (si, sg) = (input.shape(), output_gradient.shape());
        for (channel, chunk) in out.values_mut().chunks_mut(kernel_len).enumerate() {
            conv2d_kernels_gradient_channel(
                input.values(),
                si,
                output_gradient.values(),
                sg,
                window,
                channel,
                chunk,
            );
        }
        Ok(())
    }

    fn pool(&self, input: &Tensor, window: &Window, kind: PoolType, out: &mut Tensor) -> Result<()> {
        let plane_len = out.shape().plane_len();
        let shape = input.shape();
        for (plane, chunk) in out.values_mut().chunks_mut(plane_len).enumerate() {
            pool_plane(input.values(), shape, window, kind, plane, chunk);
        }
        Ok(())
    }

    fn pool_gradient(
        &self,
        input: &Tensor,
        output: &Tensor,
        output_gradient: &Tensor,
        window: &Window,
        kind: PoolType,
        out: &mut Tensor,
    ) -> Result<()> {
        let shape = input.shape();
        let pooled = output.shape();
        for (plane, chunk) in out.values_mut().chunks_mut(shape.plane_len()).enumerate() {
            pool_gradient_plane(
                input.values(),
                shape,
                output.values(),
                output_gradient.values(),
                pooled,
                window,
                kind,
                plane,
                chunk,
            );
        }
        Ok(())
    }
}

/// `out[i] = alpha * a[(start + i) % |a|] + beta * b[(start + i) % |b|]`.
///
/// The modulo replicates a batch-1 operand across the batches of the other.
pub(crate) fn add_range(a: &[f32], alpha: f32, b: &[f32], beta: f32, start: usize, out: &mut [f32]) {
    let (la, lb) = (a.len(), b.len());
    for (i, o) in out.iter_mut().enumerate() {
        let idx = start + i;
        *o = alpha * a[idx % la] + beta * b[idx % lb];
    }
}

pub(crate) fn zip_range(a: &[f32], b: &[f32], start: usize, out: &mut [f32], f: impl Fn(f32, f32) -> f32) {
    for (i, o) in out.iter_mut().enumerate() {
        *o = f(a[start + i], b[start + i]);
    }
}

/// Computes output row `row` of a per-slot matrix product.
///
/// Rows are numbered across all (depth, batch) slots, so `row / a.height()`
/// is the slot and `row % a.height()` the row inside it.
pub(crate) fn matmul_row(a: &[f32], sa: Shape, b: &[f32], sb: Shape, row: usize, out: &mut [f32]) {
    let (inner, rows, depth) = (sa.width(), sa.height(), sa.depth());
    let width = sb.width();

    let y = row % rows;
    let slot = row / rows;
    let (d, n) = (slot % depth, slot / depth);
    let na = n.min(sa.batch() - 1);
    let nb = n.min(sb.batch() - 1);

    let a_row = &a[(na * depth + d) * sa.plane_len() + y * inner..][..inner];
    let b_base = (nb * depth + d) * sb.plane_len();

    for (x, o) in out.iter_mut().enumerate() {
        let mut sum = 0.0;
        for (k, &av) in a_row.iter().enumerate() {
            sum += av * b[b_base + k * width + x];
        }
        *o = sum;
    }
}

/// Writes the transpose of (depth, batch) slice `plane` of `input`.
pub(crate) fn transpose_plane(input: &[f32], shape: Shape, plane: usize, out: &mut [f32]) {
    let (w, h) = (shape.width(), shape.height());
    let src = &input[plane * shape.plane_len()..][..shape.plane_len()];
    for y in 0..h {
        for x in 0..w {
            out[y + x * h] = src[x + y * w];
        }
    }
}

/// Output plane `plane` (= channel + batch · channels) of a forward convolution.
pub(crate) fn conv2d_plane(
    input: &[f32],
    si: Shape,
    kernels: &[f32],
    sk: Shape,
    window: &Window,
    plane: usize,
    out: &mut [f32],
) {
    let channels = sk.batch();
    let (o, n) = (plane % channels, plane / channels);

    for oy in 0..window.out_h {
        for ox in 0..window.out_w {
            let (x0, y0) = (window.origin_x(ox), window.origin_y(oy));
            let mut sum = 0.0;
            for kd in 0..si.depth() {
                for ky in 0..window.kernel_h {
                    for kx in 0..window.kernel_w {
                        if let Some(i) = si.index_checked(x0 + kx as isize, y0 + ky as isize, kd, n) {
                            sum += input[i] * kernels[sk.index(kx, ky, kd, o)];
                        }
                    }
                }
            }
            out[ox + oy * window.out_w] = sum;
        }
    }
}

/// Input-gradient plane `plane` (= input channel + batch · depth).
///
/// Correlates the stride-dilated output gradient with the 180°-rotated
/// kernels, padded by `K - 1 - p` per axis. Output channels of the forward
/// pass become the summed axis, input channels the produced one.
#[allow(clippy::too_many_arguments)]
pub(crate) fn conv2d_input_gradient_plane(
    gradient: &[f32],
    sg: Shape,
    rotated: &[f32],
    sk: Shape,
    si: Shape,
    window: &Window,
    plane: usize,
    out: &mut [f32],
) {
    let depth = si.depth();
    let (c, n) = (plane % depth, plane / depth);
    let (kw, kh) = (window.kernel_w, window.kernel_h);
    let pad_x = kw as isize - 1 - window.pad_x as isize;
    let pad_y = kh as isize - 1 - window.pad_y as isize;
    let stride = window.stride as isize;

    for y in 0..si.height() {
        for x in 0..si.width() {
            let mut sum = 0.0;
            for o in 0..sg.depth() {
                for ky in 0..kh {
                    let v = y as isize - pad_y + ky as isize;
                    let Some(oy) = undilate(v, stride, sg.height()) else {
                        continue;
                    };
                    for kx in 0..kw {
                        let u = x as isize - pad_x + kx as isize;
                        let Some(ox) = undilate(u, stride, sg.width()) else {
                            continue;
                        };
                        sum += gradient[sg.index(ox, oy, o, n)] * rotated[sk.index(kx, ky, c, o)];
                    }
                }
            }
            out[x + y * si.width()] = sum;
        }
    }
}

/// Maps a coordinate of the stride-dilated gradient back to the gradient.
///
/// Dilation inserts `stride - 1` zeros between neighbours, so only multiples
/// of the stride inside the original extent carry a value.
#[inline]
fn undilate(pos: isize, stride: isize, extent: usize) -> Option<usize> {
    if pos < 0 || pos % stride != 0 {
        return None;
    }
    let idx = (pos / stride) as usize;
    (idx < extent).then_some(idx)
}

/// Kernel-gradient block for output channel `channel` (one whole kernel).
pub(crate) fn conv2d_kernels_gradient_channel(
    input: &[f32],
    si: Shape,
    gradient: &[f32],
    sg: Shape,
    window: &Window,
    channel: usize,
    out: &mut [f32],
) {
    let (kw, kh) = (window.kernel_w, window.kernel_h);
    for kd in 0..si.depth() {
        for ky in 0..kh {
            for kx in 0..kw {
                let mut sum = 0.0;
                for n in 0..si.batch() {
                    for oy in 0..window.out_h {
                        let y = window.origin_y(oy) + ky as isize;
                        for ox in 0..window.out_w {
                            let x = window.origin_x(ox) + kx as isize;
                            if let Some(i) = si.index_checked(x, y, kd, n) {
                                sum += input[i] * gradient[sg.index(ox, oy, channel, n)];
                            }
                        }
                    }
                }
                out[kx + ky * kw + kd * kw * kh] = sum;
            }
        }
    }
}

/// Pools (depth, batch) plane `plane` of `input`.
pub(crate) fn pool_plane(input: &[f32], si: Shape, window: &Window, kind: PoolType, plane: usize, out: &mut [f32]) {
    let (d, n) = (plane % si.depth(), plane / si.depth());
    let area = (window.kernel_w * window.kernel_h) as f32;

    for oy in 0..window.out_h {
        for ox in 0..window.out_w {
            let (x0, y0) = (window.origin_x(ox), window.origin_y(oy));
            let mut acc = match kind {
                PoolType::Max => f32::MIN,
                PoolType::Avg => 0.0,
            };
            for fy in 0..window.kernel_h {
                for fx in 0..window.kernel_w {
                    let value = si
                        .index_checked(x0 + fx as isize, y0 + fy as isize, d, n)
                        .map(|i| input[i]);
                    acc = match kind {
                        PoolType::Max => acc.max(value.unwrap_or(f32::MIN)),
                        PoolType::Avg => acc + value.unwrap_or(0.0),
                    };
                }
            }
            out[ox + oy * window.out_w] = match kind {
                PoolType::Max => acc,
                PoolType::Avg => acc / area,
            };
        }
    }
}

/// Pooling-gradient plane `plane` of the input.
///
/// The plane is zeroed, then every window routes its output gradient back:
/// max windows to each in-bounds position equal to the recorded maximum,
/// average windows to every in-bounds position divided by the window area.
/// Contributions of overlapping windows and tied maxima add up.
#[allow(clippy::too_many_arguments)]
pub(crate) fn pool_gradient_plane(
    input: &[f32],
    si: Shape,
    output: &[f32],
    gradient: &[f32],
    so: Shape,
    window: &Window,
    kind: PoolType,
    plane: usize,
    out: &mut [f32],
) {
    let (d, n) = (plane % si.depth(), plane / si.depth());
    let area = (window.kernel_w * window.kernel_h) as f32;
    let base = plane * si.plane_len();
    out.fill(0.0);

    for oy in 0..window.out_h {
        for ox in 0..window.out_w {
            let o = so.index(ox, oy, d, n);
            let (g, recorded) = (gradient[o], output[o]);
            let (x0, y0) = (window.origin_x(ox), window.origin_y(oy));
            for fy in 0..window.kernel_h {
                for fx in 0..window.kernel_w {
                    let Some(i) = si.index_checked(x0 + fx as isize, y0 + fy as isize, d, n) else {
                        continue;
                    };
                    match kind {
                        PoolType::Max => {
                            if input[i] == recorded {
                                out[i - base] += g;
                            }
                        }
                        PoolType::Avg => out[i - base] += g / area,
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::ops::dispatch::Context;
    use crate::ops::PoolType;
    use crate::padding::PaddingType;
    use crate::tensor::Tensor;
    use approx::assert_relative_eq;

    fn range(shape: impl Into<crate::shape::Shape>) -> Tensor {
        let mut t = Tensor::zeros(shape);
        t.fill_with_range(0.0, 1.0);
        t
    }

    fn random(shape: impl Into<crate::shape::Shape>, seed: u64) -> Tensor {
        let mut t = Tensor::zeros(shape);
        t.fill_with_rand(Some(seed), -1.0, 1.0);
        t
    }

    fn dot(a: &Tensor, b: &Tensor) -> f64 {
        a.values()
            .iter()
            .zip(b.values())
            .map(|(&x, &y)| f64::from(x) * f64::from(y))
            .sum()
    }

    #[test]
    fn conv2d_valid_two_channel_input() {
        let ctx = Context::cpu();
        let out = range((6, 6, 2))
            .conv2d(&ctx, &range((3, 3, 2)), 1, PaddingType::Valid)
            .unwrap();
        assert_eq!(out.shape().dims(), [4, 4, 1, 1]);
        assert_eq!(
            out.values(),
            &[
                5511.0, 5664.0, 5817.0, 5970.0, 6429.0, 6582.0, 6735.0, 6888.0, 7347.0, 7500.0, 7653.0, 7806.0,
                8265.0, 8418.0, 8571.0, 8724.0
            ]
        );
    }

    #[test]
    fn max_pool_takes_window_maxima() {
        let ctx = Context::cpu();
        let out = range((6, 6)).pool(&ctx, 2, 2, PoolType::Max, PaddingType::Valid).unwrap();
        assert_eq!(out.shape().dims(), [3, 3, 1, 1]);
        assert_eq!(out.values(), &[7.0, 9.0, 11.0, 19.0, 21.0, 23.0, 31.0, 33.0, 35.0]);
    }

    #[test]
    fn max_pool_gradient_routes_to_maxima() {
        let ctx = Context::cpu();
        let input = range((6, 6));
        let output = input.pool(&ctx, 2, 2, PoolType::Max, PaddingType::Valid).unwrap();
        let mut gradient = Tensor::zeros(output.shape());
        gradient.fill_with_range(1.0, 1.0);

        let grad = input
            .pool_gradient(&ctx, &output, &gradient, 2, 2, PoolType::Max, PaddingType::Valid)
            .unwrap();
        for y in 0..6 {
            for x in 0..6 {
                let expected = if x % 2 == 1 && y % 2 == 1 {
                    (x / 2 + (y / 2) * 3 + 1) as f32
                } else {
                    0.0
                };
                assert_eq!(grad.get(x, y, 0, 0), expected, "at ({x}, {y})");
            }
        }
    }

    #[test]
    fn overlapping_max_windows_accumulate() {
        let ctx = Context::cpu();
        let mut input = Tensor::zeros((3, 3));
        input.set(1, 1, 0, 0, 9.0);
        let output = input.pool(&ctx, 2, 1, PoolType::Max, PaddingType::Valid).unwrap();
        assert_eq!(output.values(), &[9.0; 4]);

        let grad = input
            .pool_gradient(&ctx, &output, &Tensor::filled((2, 2), 1.0), 2, 1, PoolType::Max, PaddingType::Valid)
            .unwrap();
        assert_eq!(grad.get(1, 1, 0, 0), 4.0);
        assert_eq!(grad.sum(None), 4.0);
    }

    #[test]
    fn tied_maxima_all_receive_gradient() {
        let ctx = Context::cpu();
        let input = Tensor::filled((2, 2), 1.0);
        let output = input.pool(&ctx, 2, 2, PoolType::Max, PaddingType::Valid).unwrap();
        let grad = input
            .pool_gradient(&ctx, &output, &Tensor::filled(1, 5.0), 2, 2, PoolType::Max, PaddingType::Valid)
            .unwrap();
        assert_eq!(grad.values(), &[5.0; 4]);
    }

    #[test]
    fn avg_pool_divides_by_full_window() {
        let ctx = Context::cpu();
        let input = Tensor::new((2, 2), vec![1.0, 2.0, 3.0, 4.0]);
        let out = input.pool(&ctx, 2, 1, PoolType::Avg, PaddingType::Same).unwrap();
        assert_eq!(out.shape().dims(), [2, 2, 1, 1]);
        assert_eq!(out.values(), &[0.25, 0.75, 1.0, 2.5]);
    }

    #[test]
    fn avg_pool_gradient_spreads_evenly() {
        let ctx = Context::cpu();
        let input = range((4, 4, 2));
        let output = input.pool(&ctx, 2, 2, PoolType::Avg, PaddingType::Valid).unwrap();
        let grad = input
            .pool_gradient(&ctx, &output, &Tensor::filled(output.shape(), 2.0), 2, 2, PoolType::Avg, PaddingType::Valid)
            .unwrap();
        assert!(grad.values().iter().all(|&v| v == 0.5));
    }

    #[test]
    fn matmul_of_range_matrices() {
        let ctx = Context::cpu();
        let out = range((4, 2)).matmul(&ctx, &range((2, 4))).unwrap();
        assert_eq!(out.shape().dims(), [2, 2, 1, 1]);
        assert_eq!(out.values(), &[28.0, 34.0, 76.0, 98.0]);
    }

    #[test]
    fn transpose_swaps_axes() {
        let ctx = Context::cpu();
        let a = range((3, 2, 2));
        let t = a.transposed(&ctx).unwrap();
        assert_eq!(t.shape().dims(), [2, 3, 2, 1]);
        assert_eq!(t.get(1, 2, 1, 0), a.get(2, 1, 1, 0));
        assert_eq!(t.transposed(&ctx).unwrap(), a);
    }

    #[test]
    fn matmul_broadcasts_batch_one() {
        let ctx = Context::cpu();
        let a = range((2, 2, 1, 3));
        let b = Tensor::new((2, 2), vec![1.0, 0.0, 0.0, 1.0]);
        let out = a.matmul(&ctx, &b).unwrap();
        assert_eq!(out, a);
    }

    #[test]
    fn matmul_broadcasts_batch_one_lhs_per_depth() {
        let ctx = Context::cpu();
        let a = Tensor::new((2, 2, 2, 1), vec![1.0, 2.0, 3.0, 4.0, 0.0, 1.0, 1.0, 0.0]);
        let b = range((2, 2, 2, 2));
        let out = a.matmul(&ctx, &b).unwrap();
        assert_eq!(out.shape().dims(), [2, 2, 2, 2]);
        assert_eq!(
            out.values(),
            &[
                4.0, 7.0, 8.0, 15.0, 6.0, 7.0, 4.0, 5.0, 28.0, 31.0, 64.0, 71.0, 14.0, 15.0, 12.0, 13.0
            ]
        );
    }

    #[test]
    fn conv2d_input_gradient_is_the_adjoint() {
        let ctx = Context::cpu();
        for (stride, padding) in [
            (1, PaddingType::Valid),
            (2, PaddingType::Same),
            (2, PaddingType::Full),
            (3, PaddingType::Valid),
        ] {
            let x = random((7, 6, 2, 2), 1);
            let k = random((3, 3, 2, 3), 2);
            let y = x.conv2d(&ctx, &k, stride, padding).unwrap();
            let g = random(y.shape(), 3);
            let dx = g.conv2d_input_gradient(&ctx, &k, x.shape(), stride, padding).unwrap();
            assert_eq!(dx.shape(), x.shape());
            assert_relative_eq!(dot(&y, &g), dot(&x, &dx), max_relative = 1e-4);
        }
    }

    #[test]
    fn conv2d_kernels_gradient_is_the_adjoint() {
        let ctx = Context::cpu();
        for (stride, padding) in [(1, PaddingType::Valid), (2, PaddingType::Same), (1, PaddingType::Full)] {
            let x = random((6, 5, 2, 3), 4);
            let k = random((3, 2, 2, 2), 5);
            let y = x.conv2d(&ctx, &k, stride, padding).unwrap();
            let g = random(y.shape(), 6);
            let dk = x.conv2d_kernels_gradient(&ctx, &g, k.shape(), stride, padding).unwrap();
            assert_eq!(dk.shape(), k.shape());
            assert_relative_eq!(dot(&y, &g), dot(&k, &dk), max_relative = 1e-4);
        }
    }

    #[test]
    fn elementwise_ops_broadcast_batch() {
        let ctx = Context::cpu();
        let a = range((2, 1, 1, 2));
        let b = Tensor::new(2, vec![10.0, 20.0]);
        assert_eq!(a.add(&ctx, &b).unwrap().values(), &[10.0, 21.0, 12.0, 23.0]);
        assert_eq!(a.sub(&ctx, &b).unwrap().values(), &[-10.0, -19.0, -8.0, -17.0]);
        assert_eq!(
            a.add_scaled(&ctx, 2.0, &b, 0.5).unwrap().values(),
            &[5.0, 12.0, 9.0, 16.0]
        );
        let c = Tensor::new((2, 1, 1, 2), vec![1.0, 2.0, 4.0, 8.0]);
        assert_eq!(a.mul_elementwise(&ctx, &c).unwrap().values(), &[0.0, 2.0, 8.0, 24.0]);
        assert_eq!(a.div(&ctx, &c).unwrap().values(), &[0.0, 0.5, 0.5, 0.375]);
    }
}
