//! Shared helpers for integration tests.
//!
//! Models are built from freshly initialized weights; no checkpoint download
//! is needed.

#![allow(dead_code)]

use candle_core::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};

use dccrn::{Dccrn, DccrnConfig, MaskingMode};

/// A configuration small enough to run many forward passes in a test.
pub fn small_config() -> DccrnConfig {
    DccrnConfig {
        transform_size: 32,
        hop_size: 16,
        window_size: 32,
        encoder_depth: 3,
        hidden_width: 4,
        recurrent_depth: 1,
        ..Default::default()
    }
}

pub fn small_config_with(mode: MaskingMode, complex: bool, causal: bool) -> DccrnConfig {
    DccrnConfig {
        masking_mode: mode,
        use_complex_recurrent: complex,
        causal,
        ..small_config()
    }
}

/// Build a model with random weights, keeping the VarMap alive alongside it.
pub fn random_model(config: DccrnConfig) -> (Dccrn, VarMap) {
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
    let model = Dccrn::new(config, vb).expect("model construction failed");
    (model, varmap)
}

/// A standard normal `[batch, freq, time, 2]` spectrogram.
pub fn random_spectrogram(batch: usize, freq: usize, time: usize) -> Tensor {
    Tensor::randn(0f32, 1f32, (batch, freq, time, 2), &Device::Cpu).expect("randn failed")
}

pub fn values(t: &Tensor) -> Vec<f32> {
    t.flatten_all()
        .and_then(|t| t.to_vec1::<f32>())
        .expect("tensor to vec failed")
}

pub fn assert_finite(t: &Tensor) {
    for (i, v) in values(t).iter().enumerate() {
        assert!(v.is_finite(), "non-finite value at {i}: {v}");
    }
}

pub fn max_abs_diff(a: &Tensor, b: &Tensor) -> f32 {
    values(a)
        .iter()
        .zip(values(b).iter())
        .map(|(x, y)| (x - y).abs())
        .fold(0.0f32, f32::max)
}

/// Interleaved (re, im) pairs of a `[.., 2]` tensor.
pub fn complex_pairs(t: &Tensor) -> Vec<(f32, f32)> {
    values(t).chunks(2).map(|c| (c[0], c[1])).collect()
}
