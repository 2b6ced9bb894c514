//! Output heads turning decoder features into an enhanced spectrogram.

use candle_core::{Module, Result, Tensor};
use candle_nn::{Conv2d, Conv2dConfig, VarBuilder};

use crate::complex::{complex_conv2d, ComplexConv2d, ComplexTensor, ConvGeometry};
use crate::config::MaskingMode;

/// Guard against division by zero in magnitude/phase computations.
pub const MAGNITUDE_EPS: f64 = 1e-8;

/// A reconstruction strategy applied to the final decoder map.
///
/// `features` is the single-channel decoder output `[B, 1, F, T]`; `noisy` is
/// the unmodified input with the same shape.
pub trait MaskReconstruction {
    fn reconstruct(&self, features: &ComplexTensor, noisy: &ComplexTensor)
        -> Result<ComplexTensor>;
}

fn stacked_projection(vb: VarBuilder) -> Result<Conv2d> {
    // nn.Sequential(Conv2d(2, 1, 1), activation): the conv is entry 0
    candle_nn::conv2d(2, 1, 1, Conv2dConfig::default(), vb.pp("0"))
}

fn stack_streams(features: &ComplexTensor) -> Result<Tensor> {
    Tensor::cat(&[features.re(), features.im()], 1)
}

/// Bounded magnitude mask with the noisy phase preserved.
#[derive(Debug, Clone)]
pub struct MagnitudeMask {
    projection: Conv2d,
}

impl MagnitudeMask {
    pub fn new(vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            projection: stacked_projection(vb)?,
        })
    }

    /// Mask in `[0, 1]`, shape `[B, 1, F, T]`.
    pub fn mask(&self, features: &ComplexTensor) -> Result<Tensor> {
        candle_nn::ops::sigmoid(&self.projection.forward(&stack_streams(features)?)?)
    }
}

impl MaskReconstruction for MagnitudeMask {
    fn reconstruct(
        &self,
        features: &ComplexTensor,
        noisy: &ComplexTensor,
    ) -> Result<ComplexTensor> {
        let mask = self.mask(features)?;
        let magnitude = noisy.magnitude(MAGNITUDE_EPS)?;
        let denom = magnitude.affine(1.0, MAGNITUDE_EPS)?;
        let enhanced = mask.mul(&magnitude)?;
        noisy.map(|t| enhanced.mul(&t.div(&denom)?))
    }
}

/// Unbounded complex mask, multiplied into the noisy spectrogram.
#[derive(Debug, Clone)]
pub struct ComplexMask {
    projection: ComplexConv2d,
}

impl ComplexMask {
    pub fn new(vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            projection: complex_conv2d(1, 1, ConvGeometry::pointwise(), vb)?,
        })
    }

    pub fn mask(&self, features: &ComplexTensor) -> Result<ComplexTensor> {
        self.projection.forward(features)
    }
}

impl MaskReconstruction for ComplexMask {
    fn reconstruct(
        &self,
        features: &ComplexTensor,
        noisy: &ComplexTensor,
    ) -> Result<ComplexTensor> {
        self.mask(features)?.mul(noisy)
    }
}

/// Real mask in `[-1, 1]` scaling both components alike.
#[derive(Debug, Clone)]
pub struct RealMask {
    projection: Conv2d,
}

impl RealMask {
    pub fn new(vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            projection: stacked_projection(vb)?,
        })
    }

    pub fn mask(&self, features: &ComplexTensor) -> Result<Tensor> {
        self.projection.forward(&stack_streams(features)?)?.tanh()
    }
}

impl MaskReconstruction for RealMask {
    fn reconstruct(
        &self,
        features: &ComplexTensor,
        noisy: &ComplexTensor,
    ) -> Result<ComplexTensor> {
        let mask = self.mask(features)?;
        noisy.map(|t| t.mul(&mask))
    }
}

/// The head selected by [`MaskingMode`], fixed at construction.
#[derive(Debug, Clone)]
pub enum MaskingHead {
    Magnitude(MagnitudeMask),
    Complex(ComplexMask),
    Real(RealMask),
}

impl MaskingHead {
    /// Parameters live under the `output_layer` prefix given by `vb`.
    pub fn new(mode: MaskingMode, vb: VarBuilder) -> Result<Self> {
        Ok(match mode {
            MaskingMode::Magnitude => Self::Magnitude(MagnitudeMask::new(vb)?),
            MaskingMode::ComplexMask => Self::Complex(ComplexMask::new(vb)?),
            MaskingMode::RealMask => Self::Real(RealMask::new(vb)?),
        })
    }

    pub fn mode(&self) -> MaskingMode {
        match self {
            Self::Magnitude(_) => MaskingMode::Magnitude,
            Self::Complex(_) => MaskingMode::ComplexMask,
            Self::Real(_) => MaskingMode::RealMask,
        }
    }
}

impl MaskReconstruction for MaskingHead {
    fn reconstruct(
        &self,
        features: &ComplexTensor,
        noisy: &ComplexTensor,
    ) -> Result<ComplexTensor> {
        match self {
            Self::Magnitude(head) => head.reconstruct(features, noisy),
            Self::Complex(head) => head.reconstruct(features, noisy),
            Self::Real(head) => head.reconstruct(features, noisy),
        }
    }
}
