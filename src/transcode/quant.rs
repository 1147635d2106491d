//! Per-product affine quantization.
//!
//! Each moment maps its physical range onto `u8` with a fixed affine table.
//! Quantized zero doubles as the no-data marker, so the smallest
//! representable echo is one step above the range floor.

use crate::decode::frame::Product;

/// Inclusive physical range quantized onto the 255 usable codes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QuantRange {
    pub min: f32,
    pub max: f32,
}

impl QuantRange {
    pub const fn new(min: f32, max: f32) -> Self {
        QuantRange { min, max }
    }

    /// Width of one quantization step.
    pub fn step(&self) -> f32 {
        (self.max - self.min) / 255.0
    }
}

/// The affine range for a product.
pub fn quant_range(product: Product) -> QuantRange {
    match product {
        Product::Reflectivity => QuantRange::new(-32.0, 94.5),
        Product::Velocity => QuantRange::new(-100.0, 100.0),
        Product::SpectrumWidth => QuantRange::new(0.0, 64.0),
        Product::DifferentialReflectivity => QuantRange::new(-8.0, 8.0),
        Product::DifferentialPhase => QuantRange::new(0.0, 360.0),
        Product::CorrelationCoefficient => QuantRange::new(0.0, 1.1),
    }
}

/// Quantize a physical value onto `u8`; out-of-range values clamp.
#[inline]
pub fn quantize(value: f32, range: QuantRange) -> u8 {
    let normalized = ((value - range.min) / (range.max - range.min)).clamp(0.0, 1.0);
    (normalized * 255.0).round() as u8
}

/// Invert [`quantize`] onto the center of the code's value.
#[inline]
pub fn dequantize(code: u8, range: QuantRange) -> f32 {
    range.min + (code as f32 / 255.0) * (range.max - range.min)
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const ALL_PRODUCTS: [Product; 6] = [
        Product::Reflectivity,
        Product::Velocity,
        Product::SpectrumWidth,
        Product::DifferentialReflectivity,
        Product::DifferentialPhase,
        Product::CorrelationCoefficient,
    ];

    #[test]
    fn test_range_endpoints() {
        for product in ALL_PRODUCTS {
            let range = quant_range(product);
            assert_eq!(quantize(range.min, range), 0);
            assert_eq!(quantize(range.max, range), 255);
        }
    }

    #[test]
    fn test_clamping() {
        let range = quant_range(Product::Reflectivity);
        assert_eq!(quantize(-1000.0, range), 0);
        assert_eq!(quantize(1000.0, range), 255);
    }

    #[test]
    fn test_velocity_midpoint() {
        let range = quant_range(Product::Velocity);
        let code = quantize(0.0, range);
        assert!(code == 127 || code == 128);
        assert!(dequantize(code, range).abs() <= range.step());
    }

    proptest! {
        /// Round-trip error never exceeds one quantization step.
        #[test]
        fn prop_roundtrip_within_step(
            product_idx in 0usize..6,
            t in 0.0f32..=1.0,
        ) {
            let range = quant_range(ALL_PRODUCTS[product_idx]);
            let value = range.min + t * (range.max - range.min);
            let recovered = dequantize(quantize(value, range), range);
            prop_assert!((recovered - value).abs() <= range.step() + 1e-5);
        }

        /// Quantization is monotone over the physical range.
        #[test]
        fn prop_monotone(
            product_idx in 0usize..6,
            a in 0.0f32..=1.0,
            b in 0.0f32..=1.0,
        ) {
            let range = quant_range(ALL_PRODUCTS[product_idx]);
            let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
            let v_lo = range.min + lo * (range.max - range.min);
            let v_hi = range.min + hi * (range.max - range.min);
            prop_assert!(quantize(v_lo, range) <= quantize(v_hi, range));
        }
    }
}
