//! Complex-valued building blocks for the DCCRN network.
//!
//! A complex feature map is carried as two real tensors of identical shape.
//! Every layer that mixes channels goes through [`ComplexPair`], which wraps two
//! independent real-valued modules and combines them with the product rule
//! `(a + jb)(c + jd) = (ac - bd) + j(ad + bc)`.
//!
//! Candle's built-in 2D convolutions take a single stride/padding for both
//! spatial axes, while DCCRN strides frequency and time differently. The
//! strided and transposed convolutions below therefore handle padding, stride
//! and dilation per axis around a stride-1 Candle convolution.

use candle_core::{bail, Module, ModuleT, Result, Tensor};
use candle_nn::{BatchNorm, BatchNormConfig, Init, VarBuilder};

/// Real/imaginary pair of equally shaped tensors.
///
/// Feature maps are `[batch, channels, frequency, time]`; the recurrent
/// bottleneck also uses this type for `[batch, time, features]` sequences.
#[derive(Debug, Clone)]
pub struct ComplexTensor {
    re: Tensor,
    im: Tensor,
}

impl ComplexTensor {
    /// Pair two streams, rejecting mismatched shapes.
    pub fn new(re: Tensor, im: Tensor) -> Result<Self> {
        if re.dims() != im.dims() {
            bail!(
                "complex streams disagree in shape: real {:?}, imaginary {:?}",
                re.dims(),
                im.dims()
            );
        }
        Ok(Self { re, im })
    }

    pub fn re(&self) -> &Tensor {
        &self.re
    }

    pub fn im(&self) -> &Tensor {
        &self.im
    }

    pub fn into_parts(self) -> (Tensor, Tensor) {
        (self.re, self.im)
    }

    pub fn dims(&self) -> &[usize] {
        self.re.dims()
    }

    pub fn dims4(&self) -> Result<(usize, usize, usize, usize)> {
        self.re.dims4()
    }

    /// `(frequency, time)` extent of a feature map.
    pub fn spatial(&self) -> Result<(usize, usize)> {
        let (_, _, f, t) = self.re.dims4()?;
        Ok((f, t))
    }

    /// Apply the same real operation to both streams independently.
    pub fn map<F>(&self, f: F) -> Result<Self>
    where
        F: Fn(&Tensor) -> Result<Tensor>,
    {
        Self::new(f(&self.re)?, f(&self.im)?)
    }

    pub fn elu(&self, alpha: f64) -> Result<Self> {
        self.map(|t| t.elu(alpha))
    }

    /// Concatenate along the channel axis.
    pub fn cat_channels(&self, other: &Self) -> Result<Self> {
        Self::new(
            Tensor::cat(&[&self.re, &other.re], 1)?,
            Tensor::cat(&[&self.im, &other.im], 1)?,
        )
    }

    /// Nearest-neighbour resample of the spatial axes.
    pub fn resize_nearest(&self, freq: usize, time: usize) -> Result<Self> {
        self.map(|t| t.upsample_nearest2d(freq, time))
    }

    /// Crop or zero-pad the frequency axis (dim 2) at its high end.
    pub fn fit_frequency(&self, bins: usize) -> Result<Self> {
        let (_, _, f, _) = self.dims4()?;
        if f == bins {
            Ok(self.clone())
        } else if f > bins {
            self.map(|t| t.narrow(2, 0, bins))
        } else {
            self.map(|t| t.pad_with_zeros(2, 0, bins - f))
        }
    }

    /// Element-wise complex product.
    pub fn mul(&self, other: &Self) -> Result<Self> {
        product_rule(
            &self.re.mul(&other.re)?,
            &self.im.mul(&other.im)?,
            &self.re.mul(&other.im)?,
            &self.im.mul(&other.re)?,
        )
    }

    /// `sqrt(re² + im² + eps)`
    pub fn magnitude(&self, eps: f64) -> Result<Tensor> {
        self.re.sqr()?.add(&self.im.sqr()?)?.affine(1.0, eps)?.sqrt()
    }
}

/// Combine the four partial products of a complex linear map.
///
/// With `A` the transform applied for the real part and `B` the one for the
/// imaginary part: `out = (A(re) - B(im)) + j(A(im) + B(re))`.
pub fn product_rule(
    a_of_re: &Tensor,
    b_of_im: &Tensor,
    a_of_im: &Tensor,
    b_of_re: &Tensor,
) -> Result<ComplexTensor> {
    ComplexTensor::new(a_of_re.sub(b_of_im)?, a_of_im.add(b_of_re)?)
}

/// Two independent real modules acting as one complex linear operator.
#[derive(Debug, Clone)]
pub struct ComplexPair<M> {
    real: M,
    imag: M,
}

impl<M> ComplexPair<M> {
    pub fn new(real: M, imag: M) -> Self {
        Self { real, imag }
    }

    pub fn real_part(&self) -> &M {
        &self.real
    }

    pub fn imag_part(&self) -> &M {
        &self.imag
    }
}

impl<M: Module> ComplexPair<M> {
    pub fn forward(&self, x: &ComplexTensor) -> Result<ComplexTensor> {
        product_rule(
            &self.real.forward(x.re())?,
            &self.imag.forward(x.im())?,
            &self.real.forward(x.im())?,
            &self.imag.forward(x.re())?,
        )
    }
}

/// Per-axis convolution geometry as `(frequency, time)` pairs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConvGeometry {
    pub kernel: (usize, usize),
    pub stride: (usize, usize),
    pub padding: (usize, usize),
    /// Only used by transposed convolutions.
    pub output_padding: (usize, usize),
}

impl ConvGeometry {
    /// 1x1 kernel, unit stride, no padding.
    pub fn pointwise() -> Self {
        Self {
            kernel: (1, 1),
            stride: (1, 1),
            padding: (0, 0),
            output_padding: (0, 0),
        }
    }

    /// Spatial size after a strided convolution, `None` if an axis collapses.
    pub fn conv_output(&self, input: (usize, usize)) -> Option<(usize, usize)> {
        fn axis(n: usize, k: usize, s: usize, p: usize) -> Option<usize> {
            let padded = n + 2 * p;
            if s == 0 || k == 0 || padded < k {
                return None;
            }
            Some((padded - k) / s + 1)
        }
        Some((
            axis(input.0, self.kernel.0, self.stride.0, self.padding.0)?,
            axis(input.1, self.kernel.1, self.stride.1, self.padding.1)?,
        ))
    }

    /// Spatial size after a transposed convolution, `None` if an axis collapses.
    pub fn transposed_output(&self, input: (usize, usize)) -> Option<(usize, usize)> {
        fn axis(n: usize, k: usize, s: usize, p: usize, op: usize) -> Option<usize> {
            if n == 0 {
                return None;
            }
            ((n - 1) * s + k + op).checked_sub(2 * p).filter(|&v| v > 0)
        }
        Some((
            axis(
                input.0,
                self.kernel.0,
                self.stride.0,
                self.padding.0,
                self.output_padding.0,
            )?,
            axis(
                input.1,
                self.kernel.1,
                self.stride.1,
                self.padding.1,
                self.output_padding.1,
            )?,
        ))
    }
}

/// 2D convolution with independent stride and padding per axis.
///
/// Weights are `[out_channels, in_channels, k_freq, k_time]`, bias `[out_channels]`.
#[derive(Debug, Clone)]
pub struct StridedConv2d {
    weight: Tensor,
    bias: Option<Tensor>,
    geometry: ConvGeometry,
}

impl StridedConv2d {
    pub fn new(
        in_channels: usize,
        out_channels: usize,
        geometry: ConvGeometry,
        vb: VarBuilder,
    ) -> Result<Self> {
        let (kh, kw) = geometry.kernel;
        let weight = vb.get_with_hints(
            (out_channels, in_channels, kh, kw),
            "weight",
            candle_nn::init::DEFAULT_KAIMING_NORMAL,
        )?;
        let bound = 1. / ((in_channels * kh * kw) as f64).sqrt();
        let bias = vb.get_with_hints(
            out_channels,
            "bias",
            Init::Uniform {
                lo: -bound,
                up: bound,
            },
        )?;
        Ok(Self::from_parts(weight, Some(bias), geometry))
    }

    pub fn from_parts(weight: Tensor, bias: Option<Tensor>, geometry: ConvGeometry) -> Self {
        Self {
            weight,
            bias,
            geometry,
        }
    }

    pub fn geometry(&self) -> &ConvGeometry {
        &self.geometry
    }
}

impl Module for StridedConv2d {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let (ph, pw) = self.geometry.padding;
        let (sh, sw) = self.geometry.stride;
        let x = x.pad_with_zeros(2, ph, ph)?.pad_with_zeros(3, pw, pw)?;
        let y = if sh == sw {
            x.conv2d(&self.weight, 0, sh, 1, 1)?
        } else {
            let y = x.conv2d(&self.weight, 0, 1, 1, 1)?;
            subsample(&subsample(&y, 2, sh)?, 3, sw)?
        };
        add_channel_bias(y, self.bias.as_ref())
    }
}

/// 2D transposed convolution with independent stride, padding and output
/// padding per axis.
///
/// Weights use the PyTorch layout `[in_channels, out_channels, k_freq, k_time]`.
/// The forward pass dilates the input with zeros, pads it, and runs an ordinary
/// convolution with the spatially flipped, channel-swapped kernel.
#[derive(Debug, Clone)]
pub struct TransposedConv2d {
    kernel: Tensor,
    bias: Option<Tensor>,
    geometry: ConvGeometry,
}

impl TransposedConv2d {
    pub fn new(
        in_channels: usize,
        out_channels: usize,
        geometry: ConvGeometry,
        vb: VarBuilder,
    ) -> Result<Self> {
        let (kh, kw) = geometry.kernel;
        let weight = vb.get_with_hints(
            (in_channels, out_channels, kh, kw),
            "weight",
            candle_nn::init::DEFAULT_KAIMING_NORMAL,
        )?;
        let bound = 1. / ((out_channels * kh * kw) as f64).sqrt();
        let bias = vb.get_with_hints(
            out_channels,
            "bias",
            Init::Uniform {
                lo: -bound,
                up: bound,
            },
        )?;
        Self::from_parts(&weight, Some(bias), geometry)
    }

    pub fn from_parts(
        weight: &Tensor,
        bias: Option<Tensor>,
        geometry: ConvGeometry,
    ) -> Result<Self> {
        let (kh, kw) = geometry.kernel;
        let (ph, pw) = geometry.padding;
        if ph >= kh || pw >= kw {
            bail!(
                "transposed convolution padding {:?} must be smaller than kernel {:?}",
                geometry.padding,
                geometry.kernel
            );
        }
        let kernel = flip(&flip(weight, 2)?, 3)?.transpose(0, 1)?.contiguous()?;
        Ok(Self {
            kernel,
            bias,
            geometry,
        })
    }

    pub fn geometry(&self) -> &ConvGeometry {
        &self.geometry
    }
}

impl Module for TransposedConv2d {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let (kh, kw) = self.geometry.kernel;
        let (sh, sw) = self.geometry.stride;
        let (ph, pw) = self.geometry.padding;
        let (oh, ow) = self.geometry.output_padding;

        let x = dilate(&dilate(x, 2, sh)?, 3, sw)?;
        let (lo_h, lo_w) = (kh - 1 - ph, kw - 1 - pw);
        let x = x
            .pad_with_zeros(2, lo_h, lo_h + oh)?
            .pad_with_zeros(3, lo_w, lo_w + ow)?;
        let y = x.conv2d(&self.kernel, 0, 1, 1, 1)?;
        add_channel_bias(y, self.bias.as_ref())
    }
}

pub type ComplexConv2d = ComplexPair<StridedConv2d>;
pub type ComplexConvTranspose2d = ComplexPair<TransposedConv2d>;

/// Complex convolution with parameters under `conv_real` / `conv_imag`.
pub fn complex_conv2d(
    in_channels: usize,
    out_channels: usize,
    geometry: ConvGeometry,
    vb: VarBuilder,
) -> Result<ComplexConv2d> {
    Ok(ComplexPair::new(
        StridedConv2d::new(in_channels, out_channels, geometry, vb.pp("conv_real"))?,
        StridedConv2d::new(in_channels, out_channels, geometry, vb.pp("conv_imag"))?,
    ))
}

/// Complex transposed convolution with parameters under `conv_real` / `conv_imag`.
pub fn complex_conv_transpose2d(
    in_channels: usize,
    out_channels: usize,
    geometry: ConvGeometry,
    vb: VarBuilder,
) -> Result<ComplexConvTranspose2d> {
    Ok(ComplexPair::new(
        TransposedConv2d::new(in_channels, out_channels, geometry, vb.pp("conv_real"))?,
        TransposedConv2d::new(in_channels, out_channels, geometry, vb.pp("conv_imag"))?,
    ))
}

/// Batch normalization applied to each stream on its own, using running
/// statistics.
#[derive(Debug, Clone)]
pub struct ComplexBatchNorm2d {
    real: BatchNorm,
    imag: BatchNorm,
}

impl ComplexBatchNorm2d {
    pub fn new(num_features: usize, vb: VarBuilder) -> Result<Self> {
        let real = candle_nn::batch_norm(num_features, BatchNormConfig::default(), vb.pp("bn_real"))?;
        let imag = candle_nn::batch_norm(num_features, BatchNormConfig::default(), vb.pp("bn_imag"))?;
        Ok(Self { real, imag })
    }

    pub fn forward(&self, x: &ComplexTensor) -> Result<ComplexTensor> {
        ComplexTensor::new(
            self.real.forward_t(x.re(), false)?,
            self.imag.forward_t(x.im(), false)?,
        )
    }
}

fn add_channel_bias(y: Tensor, bias: Option<&Tensor>) -> Result<Tensor> {
    match bias {
        Some(b) => {
            let c = b.dim(0)?;
            y.broadcast_add(&b.reshape((1, c, 1, 1))?)
        }
        None => Ok(y),
    }
}

/// Keep every `step`-th element along `dim`, starting at 0.
fn subsample(x: &Tensor, dim: usize, step: usize) -> Result<Tensor> {
    if step == 1 {
        return Ok(x.clone());
    }
    let len = x.dim(dim)?;
    let idx = Tensor::arange_step(0u32, len as u32, step as u32, x.device())?;
    x.index_select(&idx, dim)
}

/// Insert `step - 1` zeros between consecutive elements along `dim`.
fn dilate(x: &Tensor, dim: usize, step: usize) -> Result<Tensor> {
    if step == 1 {
        return Ok(x.clone());
    }
    let len = x.dim(dim)?;
    let mut dims = x.dims().to_vec();
    dims[dim] = len * step;
    x.unsqueeze(dim + 1)?
        .pad_with_zeros(dim + 1, 0, step - 1)?
        .reshape(dims)?
        .narrow(dim, 0, (len - 1) * step + 1)
}

/// Reverse the order of elements along `dim`.
fn flip(x: &Tensor, dim: usize) -> Result<Tensor> {
    let len = x.dim(dim)?;
    let idx: Vec<u32> = (0..len as u32).rev().collect();
    let idx = Tensor::from_vec(idx, len, x.device())?;
    x.index_select(&idx, dim)
}
