//! Utilities to approximate equality of floating point values.
//!
//! Backends accumulate in different orders, so cross-backend comparisons use a
//! mixed relative/absolute tolerance rather than exact equality.

/// Relative tolerance used for cross-backend agreement.
pub const DEFAULT_RTOL: f32 = 1e-4;

/// Absolute tolerance floor for values near zero.
pub const DEFAULT_ATOL: f32 = 1e-5;

/// Whether `a` and `b` are within `atol + rtol * max(|a|, |b|)` of each other.
///
/// Two NaNs never compare close. Infinities compare close only to themselves.
#[inline]
#[must_use]
pub fn close(a: f32, b: f32, rtol: f32, atol: f32) -> bool {
    if a == b {
        return true;
    }
    let diff = (a - b).abs();
    diff <= atol + rtol * a.abs().max(b.abs())
}

/// [`close`] applied pairwise; slices of different length are never close.
#[must_use]
pub fn all_close(a: &[f32], b: &[f32], rtol: f32, atol: f32) -> bool {
    a.len() == b.len() && a.iter().zip(b).all(|(&x, &y)| close(x, y, rtol, atol))
}

/// Largest absolute elementwise difference, or `None` for slices of different length.
#[must_use]
pub fn max_abs_diff(a: &[f32], b: &[f32]) -> Option<f32> {
    if a.len() != b.len() {
        return None;
    }
    Some(
        a.iter()
            .zip(b)
            .map(|(&x, &y)| (x - y).abs())
            .fold(0.0, f32::max),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relative_component_scales_with_magnitude() {
        assert!(close(10_000.0, 10_000.5, DEFAULT_RTOL, 0.0));
        assert!(!close(1.0, 1.5, DEFAULT_RTOL, 0.0));
        assert!(close(0.0, 1e-6, 0.0, DEFAULT_ATOL));
    }

    #[test]
    fn nan_is_never_close() {
        assert!(!close(f32::NAN, f32::NAN, 1.0, 1.0));
        assert!(close(f32::INFINITY, f32::INFINITY, 0.0, 0.0));
    }

    #[test]
    fn slices() {
        assert!(all_close(&[1.0, 2.0], &[1.0, 2.00001], 1e-4, 0.0));
        assert!(!all_close(&[1.0], &[1.0, 2.0], 1e-4, 0.0));
        assert_eq!(max_abs_diff(&[1.0, 5.0], &[1.5, 4.0]), Some(1.0));
    }
}
