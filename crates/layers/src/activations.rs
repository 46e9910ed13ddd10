//! Activation catalogue for feed-forward stacks.
//!
//! * **Gelu** is the erf form `0.5 * x * (1 + erf(x / sqrt(2)))` used by ViT
//!   blocks.
//! * **GeluTanh** is the tanh approximation used by GPT-2.
//! * **Identity** leaves the input untouched; the action bottleneck uses it.

use candle_core::{Result, Tensor};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivationKind {
    Identity,
    Gelu,
    GeluTanh,
}

impl ActivationKind {
    pub fn apply(&self, input: &Tensor) -> Result<Tensor> {
        match self {
            ActivationKind::Identity => Ok(input.clone()),
            ActivationKind::Gelu => input.gelu_erf(),
            ActivationKind::GeluTanh => input.gelu(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;
    use std::f32::consts::SQRT_2;

    fn erf_reference(x: f32) -> f32 {
        // Abramowitz-Stegun 7.1.26, |error| < 1.5e-7.
        let sign = x.signum();
        let x = x.abs();
        let t = 1.0 / (1.0 + 0.327_591_1 * x);
        let poly = t
            * (0.254_829_6
                + t * (-0.284_496_74 + t * (1.421_413_7 + t * (-1.453_152_1 + t * 1.061_405_4))));
        sign * (1.0 - poly * (-x * x).exp())
    }

    #[test]
    fn gelu_matches_reference_formula() -> Result<()> {
        let values = [-2.5f32, -0.5, 0.0, 1.0, 3.0];
        let input = Tensor::new(&values, &Device::Cpu)?;
        let output = ActivationKind::Gelu.apply(&input)?.to_vec1::<f32>()?;
        for (x, y) in values.iter().zip(output) {
            let expected = 0.5 * x * (1.0 + erf_reference(x / SQRT_2));
            assert!((expected - y).abs() < 1e-4, "x={x} expected={expected} got={y}");
        }
        Ok(())
    }

    #[test]
    fn identity_passes_input_through() -> Result<()> {
        let input = Tensor::new(&[-1f32, 0.0, 2.0], &Device::Cpu)?;
        assert_eq!(
            ActivationKind::Identity.apply(&input)?.to_vec1::<f32>()?,
            vec![-1.0, 0.0, 2.0]
        );
        Ok(())
    }

    #[test]
    fn tanh_gelu_stays_close_to_erf_gelu() -> Result<()> {
        let input = Tensor::new(&[-2f32, -0.5, 0.0, 0.5, 2.0], &Device::Cpu)?;
        let erf = ActivationKind::Gelu.apply(&input)?.to_vec1::<f32>()?;
        let tanh = ActivationKind::GeluTanh.apply(&input)?.to_vec1::<f32>()?;
        for (a, b) in erf.iter().zip(&tanh) {
            assert!((a - b).abs() < 2e-3, "erf={a} tanh={b}");
        }
        Ok(())
    }
}
