use neurite::*;

fn range(shape: impl Into<Shape>) -> Tensor {
    let mut t = Tensor::zeros(shape);
    t.fill_with_range(0.0, 1.0);
    t
}

#[test]
fn test_tensor_shape_mismatch_panics() {
    let result = std::panic::catch_unwind(|| {
        Tensor::new((2, 2), vec![1.0, 2.0, 3.0]);
    });
    assert!(result.is_err());
    assert!(matches!(
        Tensor::try_new((2, 2), vec![1.0, 2.0, 3.0]),
        Err(Error::LengthMismatch { expected: 4, got: 3, .. })
    ));
}

#[test]
fn test_tensor_macro_axes() {
    let t = tensor!([[[1.0, 2.0], [3.0, 4.0]], [[5.0, 6.0], [7.0, 8.0]]]);
    assert_eq!(t.shape().dims(), [2, 2, 2, 1]);
    assert_eq!(t.get(1, 0, 1, 0), 6.0);
    assert_eq!(t.sum(None), 36.0);
}

#[test]
fn test_save_and_load() {
    let path = std::env::temp_dir().join(format!("neurite-core-{}.bin", std::process::id()));
    let mut t = Tensor::zeros((3, 2, 2, 2));
    t.fill_with_rand(Some(7), -5.0, 5.0);

    t.save(&path).unwrap();
    let loaded = Tensor::load(&path).unwrap();
    std::fs::remove_file(&path).unwrap();

    assert_eq!(loaded, t);
    assert_eq!(loaded.shape().batch(), 2);
}

#[test]
fn test_stream_holds_consecutive_tensors() {
    let a = range((2, 3));
    let b = range((4, 1, 1, 2));
    let mut buf = Vec::new();
    a.serialize(&mut buf).unwrap();
    b.serialize(&mut buf).unwrap();

    let mut reader = buf.as_slice();
    assert_eq!(Tensor::deserialize(&mut reader).unwrap(), a);
    assert_eq!(Tensor::deserialize(&mut reader).unwrap(), b);
    assert!(reader.is_empty());
}

#[test]
fn test_negative_axis_is_corrupt() {
    let mut bytes = range(2).to_bytes().unwrap();
    bytes[0..4].copy_from_slice(&(-2i32).to_le_bytes());
    assert!(Tensor::from_bytes(&bytes).is_err());
}

#[test]
fn test_overflowing_shape_is_corrupt() {
    let mut bytes = Vec::new();
    for dim in [65536i32; 4] {
        bytes.extend_from_slice(&dim.to_le_bytes());
    }
    bytes.extend_from_slice(&0i32.to_le_bytes());
    assert!(matches!(Tensor::from_bytes(&bytes), Err(Error::Corrupt(_))));
}

#[test]
fn test_concat_then_split_is_identity() {
    let parts = vec![range((2, 2, 1, 3)), range((5, 1, 1, 3)), range((1, 1, 2, 3))];
    let joined = Tensor::concat(&parts).unwrap();
    assert_eq!(joined.shape().dims(), [11, 1, 1, 3]);

    let shapes: Vec<Shape> = parts.iter().map(Tensor::shape).collect();
    assert_eq!(joined.split(&shapes).unwrap(), parts);
}

#[test]
fn test_merge_and_get_batch() {
    let a = range((2, 2));
    let b = range((2, 2)).add_scalar(10.0);
    let merged = Tensor::merge_into_batch(&[a.clone(), b.clone()]).unwrap();
    assert_eq!(merged.shape().dims(), [2, 2, 1, 2]);
    assert_eq!(merged.get_batch(1).unwrap(), b);
    assert!(matches!(merged.get_batch(2), Err(Error::BatchOutOfRange { index: 2, batch: 2 })));
    assert!(matches!(
        Tensor::merge_into_batch(&[a, range(3)]),
        Err(Error::IncompatibleShapes { .. })
    ));
    assert!(matches!(Tensor::merge_into_batch(&[]), Err(Error::EmptyInput { .. })));
}

#[test]
fn test_reshape_infers_one_axis() {
    let mut t = range((4, 3));
    t.reshape([2, -1, 1, 1]).unwrap();
    assert_eq!(t.shape().dims(), [2, 6, 1, 1]);
    assert!(matches!(t.reshape([5, -1, 1, 1]), Err(Error::InvalidReshape { .. })));
}

#[test]
fn test_per_batch_reductions() {
    let t = Tensor::new((3, 1, 1, 2), vec![1.0, 5.0, 2.0, -1.0, -3.0, -2.0]);
    assert_eq!(t.sum(Some(0)), 8.0);
    assert_eq!(t.max(Some(1)), -1.0);
    assert_eq!(t.arg_max(Some(0)), 1);
    assert_eq!(t.arg_max(Some(1)), 0);
    assert_eq!(t.sum_per_batch().values(), &[8.0, -6.0]);
    assert_eq!(t.arg_max_per_batch().values(), &[1.0, 0.0]);
    assert_eq!(t.sum_batches().values(), &[0.0, 2.0, 0.0]);
}

#[test]
fn test_shape_errors_leave_result_untouched() {
    let ctx = Context::cpu();
    let a = range((3, 2));
    let mut result = Tensor::filled((3, 3), 9.0);
    assert!(matches!(
        a.add_into(&ctx, &a, &mut result),
        Err(Error::ShapeMismatch { .. })
    ));
    assert!(result.values().iter().all(|&v| v == 9.0));

    assert!(matches!(a.matmul(&ctx, &a), Err(Error::IncompatibleShapes { .. })));
    assert!(matches!(a.add(&ctx, &range((2, 3))), Err(Error::IncompatibleShapes { .. })));
}

#[test]
fn test_invalid_windows() {
    let ctx = Context::cpu();
    let input = range((4, 4));
    let kernels = range((5, 5));
    assert!(matches!(
        input.conv2d(&ctx, &kernels, 1, PaddingType::Valid),
        Err(Error::InvalidWindow(_))
    ));
    assert!(matches!(
        input.pool(&ctx, 2, 0, PoolType::Max, PaddingType::Valid),
        Err(Error::InvalidWindow(_))
    ));
    assert!(matches!(
        input.conv2d(&ctx, &range((3, 3, 2)), 1, PaddingType::Valid),
        Err(Error::IncompatibleShapes { .. })
    ));
}

#[test]
fn test_padding_output_sizes() {
    let ctx = Context::cpu();
    let input = range((7, 7, 1, 2));
    let kernels = Tensor::filled((3, 3, 1, 4), 1.0);
    for (padding, side) in [(PaddingType::Valid, 3), (PaddingType::Same, 3), (PaddingType::Full, 4)] {
        let out = input.conv2d(&ctx, &kernels, 2, padding).unwrap();
        assert_eq!(out.shape().dims(), [side, side, 4, 2], "{padding}");
    }
}

#[test]
fn test_full_conv_of_ones_counts_overlap() {
    let ctx = Context::cpu();
    let out = Tensor::filled((2, 2), 1.0)
        .conv2d(&ctx, &Tensor::filled((2, 2), 1.0), 1, PaddingType::Full)
        .unwrap();
    assert_eq!(out.values(), &[1.0, 2.0, 1.0, 2.0, 4.0, 2.0, 1.0, 2.0, 1.0]);
}

#[test]
fn test_into_forms_reuse_buffers() {
    let ctx = Context::parallel();
    let a = range((4, 2));
    let b = range((2, 4));
    let mut product = Tensor::filled((2, 2), f32::NAN);
    a.matmul_into(&ctx, &b, &mut product).unwrap();
    assert_eq!(product.values(), &[28.0, 34.0, 76.0, 98.0]);

    let mut pooled = Tensor::filled((3, 3), f32::NAN);
    range((6, 6))
        .pool_into(&ctx, 2, 2, PoolType::Max, PaddingType::Valid, &mut pooled)
        .unwrap();
    assert_eq!(pooled.values(), &[7.0, 9.0, 11.0, 19.0, 21.0, 23.0, 31.0, 33.0, 35.0]);
}

#[test]
fn test_backend_names_round_trip() {
    for backend in [Backend::Cpu, Backend::MultiCpu, Backend::Gpu] {
        assert_eq!(backend.to_string().parse::<Backend>().unwrap(), backend);
    }
    assert!("tpu".parse::<Backend>().is_err());
}
