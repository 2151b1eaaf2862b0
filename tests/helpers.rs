//! Test utilities and fixtures for EXL3 integration tests.

use anyhow::Result;
use candle_core::{Device, Tensor};
use exl3_rs::kernels::exl3::{Exl3Linear, SignSource, TrellisTensor};

/// Deterministic pseudo-random stream for reproducible fixtures.
pub struct TestRng(u64);

impl TestRng {
    pub fn new(seed: u64) -> Self {
        Self(seed.wrapping_mul(0x9e37_79b9_7f4a_7c15) | 1)
    }

    pub fn next_u16(&mut self) -> u16 {
        self.0 = self.0.wrapping_mul(6_364_136_223_846_793_005).wrapping_add(1);
        (self.0 >> 48) as u16
    }

    /// Uniform-ish float in [-1, 1).
    pub fn next_f32(&mut self) -> f32 {
        f32::from(self.next_u16() as i16) / 32768.0
    }
}

/// Build a layer with pseudo-random codes, packed signs on both axes, and
/// optional scramble constants.
pub fn random_layer(
    in_features: usize,
    out_features: usize,
    k: usize,
    seed: u64,
    mcg_mult: u32,
    mul1_mult: u32,
) -> Result<Exl3Linear> {
    let mut rng = TestRng::new(seed);
    let shape = (in_features / 16, out_features / 16, 16 * k);
    let codes: Vec<u16> = (0..shape.0 * shape.1 * shape.2)
        .map(|_| rng.next_u16())
        .collect();
    let su: Vec<u16> = (0..in_features / 16).map(|_| rng.next_u16()).collect();
    let sv: Vec<u16> = (0..out_features / 16).map(|_| rng.next_u16()).collect();

    let layer = Exl3Linear::builder(in_features, out_features)
        .trellis(TrellisTensor::new(codes, shape)?)
        .row_signs(SignSource::Packed(su))
        .col_signs(SignSource::Packed(sv))
        .scramble(mcg_mult, mul1_mult)
        .build()?;
    Ok(layer)
}

/// Random input tensor `[batch, features]` on the CPU.
pub fn random_input(batch: usize, features: usize, seed: u64) -> Result<Tensor> {
    let mut rng = TestRng::new(seed);
    let data: Vec<f32> = (0..batch * features).map(|_| rng.next_f32()).collect();
    Ok(Tensor::from_vec(data, (batch, features), &Device::Cpu)?)
}

/// Assert element-wise closeness under a relative-plus-absolute tolerance.
pub fn assert_close(actual: &[f32], expected: &[f32], rtol: f32, context: &str) {
    assert_eq!(actual.len(), expected.len(), "{context}: length mismatch");
    for (i, (a, e)) in actual.iter().zip(expected).enumerate() {
        let tol = rtol * e.abs().max(1.0);
        assert!(
            (a - e).abs() <= tol,
            "{context}: element {i} differs: got {a}, want {e} (tol {tol})"
        );
    }
}
