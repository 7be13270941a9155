//! Every backend must reproduce the reference CPU results within tolerance.

use neurite::*;

fn random(shape: impl Into<Shape>, seed: u64) -> Tensor {
    let mut t = Tensor::zeros(shape);
    t.fill_with_rand(Some(seed), -1.0, 1.0);
    t
}

fn assert_close(expected: &Tensor, got: &Tensor, what: &str) {
    assert_eq!(expected.shape(), got.shape(), "{what}: shape");
    // GPU results stay on the device until read back
    let mut got = got.clone();
    got.sync_to_host().unwrap();
    assert!(
        expected.approx_eq(&got, 1e-4, 1e-4),
        "{what}: max difference {:?}",
        neurite::approx::max_abs_diff(expected.values(), got.values())
    );
}

/// Runs every operation on `ctx` and compares with the reference backend.
fn check_against_reference(ctx: &Context) {
    let cpu = Context::cpu();
    let name = ctx.backend().to_string();

    let a = random((9, 7, 3, 4), 1);
    let b = random((9, 7, 3, 4), 2);
    let single = random((9, 7, 3, 1), 3);
    let positive = random((9, 7, 3, 4), 4).map(|v| v.abs() + 0.5);

    assert_close(&a.add(&cpu, &b).unwrap(), &a.add(ctx, &b).unwrap(), &format!("{name} add"));
    assert_close(
        &a.add_scaled(&cpu, 0.5, &single, -2.0).unwrap(),
        &a.add_scaled(ctx, 0.5, &single, -2.0).unwrap(),
        &format!("{name} add broadcast"),
    );
    assert_close(&single.sub(&cpu, &a).unwrap(), &single.sub(ctx, &a).unwrap(), &format!("{name} sub"));
    assert_close(
        &a.mul_elementwise(&cpu, &b).unwrap(),
        &a.mul_elementwise(ctx, &b).unwrap(),
        &format!("{name} mul"),
    );
    assert_close(&a.div(&cpu, &positive).unwrap(), &a.div(ctx, &positive).unwrap(), &format!("{name} div"));

    let lhs = random((5, 6, 3, 4), 5);
    let rhs = random((7, 5, 3, 1), 6);
    assert_close(&lhs.matmul(&cpu, &rhs).unwrap(), &lhs.matmul(ctx, &rhs).unwrap(), &format!("{name} matmul"));
    let shared = random((5, 6, 3, 1), 15);
    let batched = random((7, 5, 3, 4), 16);
    assert_close(
        &shared.matmul(&cpu, &batched).unwrap(),
        &shared.matmul(ctx, &batched).unwrap(),
        &format!("{name} matmul shared lhs"),
    );
    assert_close(&a.transposed(&cpu).unwrap(), &a.transposed(ctx).unwrap(), &format!("{name} transpose"));

    let input = random((11, 9, 3, 2), 7);
    let kernels = random((3, 3, 3, 4), 8);
    for (stride, padding) in [(1, PaddingType::Valid), (2, PaddingType::Same), (2, PaddingType::Full)] {
        let what = format!("{name} conv2d stride {stride} {padding}");
        let expected = input.conv2d(&cpu, &kernels, stride, padding).unwrap();
        assert_close(&expected, &input.conv2d(ctx, &kernels, stride, padding).unwrap(), &what);

        let g = random(expected.shape(), 9);
        assert_close(
            &g.conv2d_input_gradient(&cpu, &kernels, input.shape(), stride, padding).unwrap(),
            &g.conv2d_input_gradient(ctx, &kernels, input.shape(), stride, padding).unwrap(),
            &format!("{what} input gradient"),
        );
        assert_close(
            &input.conv2d_kernels_gradient(&cpu, &g, kernels.shape(), stride, padding).unwrap(),
            &input.conv2d_kernels_gradient(ctx, &g, kernels.shape(), stride, padding).unwrap(),
            &format!("{what} kernels gradient"),
        );
    }

    for kind in [PoolType::Max, PoolType::Avg] {
        for (filter, stride, padding) in [(2, 2, PaddingType::Valid), (3, 1, PaddingType::Same), (3, 2, PaddingType::Full)] {
            let what = format!("{name} {kind} pool {filter}/{stride} {padding}");
            let expected = input.pool(&cpu, filter, stride, kind, padding).unwrap();
            let got = input.pool(ctx, filter, stride, kind, padding).unwrap();
            assert_close(&expected, &got, &what);

            let g = random(expected.shape(), 10);
            assert_close(
                &input.pool_gradient(&cpu, &expected, &g, filter, stride, kind, padding).unwrap(),
                &input.pool_gradient(ctx, &expected, &g, filter, stride, kind, padding).unwrap(),
                &format!("{what} gradient"),
            );
        }
    }
}

#[test]
fn test_parallel_matches_reference() {
    check_against_reference(&Context::parallel());
}

#[test]
fn test_dedicated_pool_matches_reference() {
    let ctx = ContextBuilder::new(Backend::MultiCpu).threads(3).build().unwrap();
    check_against_reference(&ctx);
}

#[test]
fn test_large_elementwise_spans_many_chunks() {
    let a = random(10_000, 11);
    let b = random(10_000, 12);
    assert_eq!(
        a.add(&Context::cpu(), &b).unwrap(),
        a.add(&Context::parallel(), &b).unwrap()
    );
}

#[cfg(feature = "wgpu")]
mod gpu {
    use super::*;

    fn context() -> Option<Context> {
        match Context::new(Backend::Gpu) {
            Ok(ctx) => Some(ctx),
            Err(e) => {
                eprintln!("skipping GPU test: {e}");
                None
            }
        }
    }

    #[test]
    fn test_gpu_matches_reference() {
        let Some(ctx) = context() else { return };
        check_against_reference(&ctx);
    }

    #[test]
    fn test_gpu_input_gradient_with_asymmetric_kernels() {
        let Some(ctx) = context() else { return };
        let cpu = Context::cpu();
        let input_shape = Shape::new(9, 7, 2, 2);
        let kernels = random((3, 2, 2, 3), 17);
        for (stride, padding) in [(1, PaddingType::Valid), (2, PaddingType::Same), (3, PaddingType::Full)] {
            let forward = Tensor::zeros(input_shape).conv2d(&cpu, &kernels, stride, padding).unwrap();
            let g = random(forward.shape(), 18);
            assert_close(
                &g.conv2d_input_gradient(&cpu, &kernels, input_shape, stride, padding).unwrap(),
                &g.conv2d_input_gradient(&ctx, &kernels, input_shape, stride, padding).unwrap(),
                &format!("gpu input gradient stride {stride} {padding}"),
            );
        }
    }

    #[test]
    fn test_results_stay_on_device_until_read() {
        let Some(ctx) = context() else { return };
        let a = random((64, 32), 13);
        let b = random((16, 64), 14);
        let mut product = a.matmul(&ctx, &b).unwrap();
        assert_eq!(product.residency(), Residency::Device);

        // chained GPU ops consume the device copy directly
        let sum = product.add(&ctx, &product).unwrap();
        assert_eq!(sum.residency(), Residency::Device);

        product.sync_to_host().unwrap();
        assert_eq!(product.residency(), Residency::Synced);
        let expected = a.matmul(&Context::cpu(), &b).unwrap();
        assert!(expected.approx_eq(&product, 1e-4, 1e-4));

        // a fallback op reads device operands back transparently
        let diff = sum.sub(&ctx, &product).unwrap();
        assert!(diff.approx_eq(&expected, 1e-4, 1e-4));
    }
}
