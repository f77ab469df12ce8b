/// Smallest activation range used to derive a scale. Ranges that collapse
/// to a point (dead channels, constant inputs) would otherwise produce a
/// zero scale.
const MIN_RANGE: f32 = 1e-3;

/// Affine mapping between int8 values and reals: `real = scale * (q - zero_point)`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct QuantParams {
    pub scale: f32,
    pub zero_point: i32,
}

impl QuantParams {
    /// Asymmetric int8 parameters covering `[min, max]`.
    ///
    /// The range is widened to contain zero so that zero is exactly
    /// representable, which padding relies on.
    pub fn asymmetric(min: f32, max: f32) -> Self {
        let min = min.min(0.0);
        let max = max.max(0.0);
        let scale = (max - min).max(MIN_RANGE) / 255.0;
        let zero_point = (-128.0 - min / scale).round().clamp(-128.0, 127.0) as i32;

        Self { scale, zero_point }
    }

    /// Fixed output parameters of an int8 softmax.
    pub fn softmax_output() -> Self {
        Self {
            scale: 1.0 / 256.0,
            zero_point: -128,
        }
    }

    pub fn quantize(&self, value: f32) -> i8 {
        let q = (value / self.scale).round() + self.zero_point as f32;
        q.clamp(-128.0, 127.0) as i8
    }

    pub fn dequantize(&self, value: i8) -> f32 {
        (value as i32 - self.zero_point) as f32 * self.scale
    }
}

/// Scale of a symmetric int8 weight quantization of `values`.
pub fn symmetric_scale(values: &[f32]) -> f32 {
    let max = values.iter().fold(0.0f32, |acc, v| acc.max(v.abs()));
    if max > 0.0 {
        max / 127.0
    } else {
        1.0
    }
}

/// Symmetric weight quantization, restricted to `[-127, 127]`.
pub fn quantize_symmetric(value: f32, scale: f32) -> i8 {
    (value / scale).round().clamp(-127.0, 127.0) as i8
}

/// Bias quantization at `input_scale * weight_scale`. Returns the value and
/// whether it saturated.
pub fn quantize_bias(value: f32, scale: f32) -> (i32, bool) {
    let q = (value as f64 / scale as f64).round();
    let clamped = q.clamp(i32::MIN as f64, i32::MAX as f64);
    (clamped as i32, clamped != q)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unit_range_maps_to_full_int8() {
        let params = QuantParams::asymmetric(0.0, 1.0);

        assert!((params.scale - 1.0 / 255.0).abs() < 1e-9);
        assert_eq!(params.zero_point, -128);
        assert_eq!(params.quantize(0.0), -128);
        assert_eq!(params.quantize(1.0), 127);
        assert_eq!(params.quantize(2.0), 127);
    }

    #[test]
    fn range_is_widened_to_include_zero() {
        let positive = QuantParams::asymmetric(2.0, 6.0);
        assert_eq!(positive.zero_point, -128);
        assert!((positive.scale - 6.0 / 255.0).abs() < 1e-7);

        let negative = QuantParams::asymmetric(-4.0, -1.0);
        assert_eq!(negative.zero_point, 127);
        assert_eq!(negative.quantize(0.0), 127);
    }

    #[test]
    fn zero_is_exact() {
        for (min, max) in [(-1.3, 2.7), (-0.01, 6.0), (-5.0, 0.2)] {
            let params = QuantParams::asymmetric(min, max);
            assert_eq!(params.dequantize(params.quantize(0.0)), 0.0);
        }
    }

    #[test]
    fn degenerate_range_has_positive_scale() {
        let params = QuantParams::asymmetric(0.0, 0.0);
        assert!(params.scale > 0.0);
        assert_eq!(params.quantize(0.0), -128);
    }

    #[test]
    fn symmetric_weights() {
        let scale = symmetric_scale(&[0.5, -1.27, 0.0]);
        assert!((scale - 0.01).abs() < 1e-7);
        assert_eq!(quantize_symmetric(-1.27, scale), -127);
        assert_eq!(quantize_symmetric(0.5, scale), 50);
        assert_eq!(symmetric_scale(&[0.0, 0.0]), 1.0);
    }

    #[test]
    fn bias_saturates() {
        assert_eq!(quantize_bias(0.5, 0.01), (50, false));
        let (value, saturated) = quantize_bias(1.0, 1e-12);
        assert_eq!(value, i32::MAX);
        assert!(saturated);
    }
}
