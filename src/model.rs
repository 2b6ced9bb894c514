//! DCCRN network
//!
//! Wires the complex encoder, the recurrent bottleneck, the decoder and the
//! masking head together, and converts between the external spectrogram
//! layout `[batch, frequency, time, 2]` and complex feature maps.

use candle_core::{Device, Tensor};
use candle_nn::VarBuilder;
use thiserror::Error;
use tracing::{debug, info};

use crate::complex::{complex_conv2d, ComplexConv2d, ComplexTensor, ConvGeometry};
use crate::config::{ConfigError, DccrnConfig, ModelDims};
use crate::mask::{MaskReconstruction, MaskingHead};
use crate::recurrent::{Bottleneck, BottleneckState};
use crate::stack::{Decoder, Encoder};

/// Environment variable enabling per-stage tensor statistics
pub const DEBUG_TENSORS_ENV: &str = "DCCRN_DEBUG_TENSORS";

/// Check if debug tensor logging is enabled
pub fn debug_tensors_enabled() -> bool {
    std::env::var(DEBUG_TENSORS_ENV).is_ok()
}

/// Log tensor statistics (shape, min, max, mean)
pub fn log_tensor_stats(name: &str, tensor: &Tensor) -> candle_core::Result<()> {
    let flat = tensor.flatten_all()?;
    let min_val = flat.min(0)?.to_scalar::<f32>()?;
    let max_val = flat.max(0)?.to_scalar::<f32>()?;
    let mean_val = flat.mean(0)?.to_scalar::<f32>()?;
    debug!(
        "{}: shape={:?}, min={:.6}, max={:.6}, mean={:.6}",
        name,
        tensor.dims(),
        min_val,
        max_val,
        mean_val
    );
    Ok(())
}

#[derive(Error, Debug)]
pub enum ModelError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Candle error: {0}")]
    Candle(#[from] candle_core::Error),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Recurrent state does not match this model's bottleneck")]
    StateMismatch,
}

/// Split `[B, F, T, 2]` into a single-channel complex map `[B, 1, F, T]`.
pub fn split_spectrogram(spectrogram: &Tensor) -> candle_core::Result<ComplexTensor> {
    let part = |i: usize| -> candle_core::Result<Tensor> {
        spectrogram
            .narrow(3, i, 1)?
            .squeeze(3)?
            .unsqueeze(1)?
            .contiguous()
    };
    ComplexTensor::new(part(0)?, part(1)?)
}

/// Inverse of [`split_spectrogram`].
pub fn merge_spectrogram(x: &ComplexTensor) -> candle_core::Result<Tensor> {
    Tensor::stack(&[x.re().squeeze(1)?, x.im().squeeze(1)?], 3)
}

/// Deep complex convolution recurrent network.
#[derive(Debug, Clone)]
pub struct Dccrn {
    config: DccrnConfig,
    dims: ModelDims,
    encoder: Encoder,
    bottleneck: Bottleneck,
    projection: ComplexConv2d,
    decoder: Decoder,
    head: MaskingHead,
    device: Device,
}

impl Dccrn {
    /// Validate `config` and load every parameter from `vb`.
    pub fn new(config: DccrnConfig, vb: VarBuilder) -> Result<Self, ModelError> {
        let dims = config.validate()?;
        let encoder = Encoder::new(&dims.encoder, vb.clone())?;
        let bottleneck = Bottleneck::new(
            dims.recurrent_input,
            config.hidden_width,
            config.recurrent_depth,
            config.use_complex_recurrent,
            config.is_bidirectional(),
            vb.pp("lstm"),
        )?;
        let projection = complex_conv2d(
            bottleneck.stream_width(),
            dims.deepest_channels(),
            ConvGeometry::pointwise(),
            vb.pp("lstm_to_conv"),
        )?;
        let decoder = Decoder::new(&dims.decoder, vb.clone())?;
        let head = MaskingHead::new(config.masking_mode, vb.pp("output_layer"))?;

        info!(
            "DCCRN ready: {} stages, hidden {}, {} recurrence ({}), {} head",
            config.encoder_depth,
            config.hidden_width,
            if config.use_complex_recurrent {
                "complex"
            } else {
                "real"
            },
            if config.causal {
                "causal"
            } else {
                "bidirectional"
            },
            config.masking_mode
        );

        Ok(Self {
            config,
            dims,
            encoder,
            bottleneck,
            projection,
            decoder,
            head,
            device: vb.device().clone(),
        })
    }

    pub fn config(&self) -> &DccrnConfig {
        &self.config
    }

    pub fn dims(&self) -> &ModelDims {
        &self.dims
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn bottleneck(&self) -> &Bottleneck {
        &self.bottleneck
    }

    pub fn encoder_depth(&self) -> usize {
        self.encoder.depth()
    }

    pub fn decoder_depth(&self) -> usize {
        self.decoder.depth()
    }

    pub fn min_time_steps(&self) -> usize {
        self.dims.min_time_steps
    }

    /// Zero recurrent state for a batch, equivalent to passing no state.
    pub fn zero_state(&self, batch: usize) -> Result<BottleneckState, ModelError> {
        Ok(self.bottleneck.zero_state(batch, &self.device)?)
    }

    /// Enhance a `[batch, frequency, time, 2]` spectrogram.
    pub fn forward(&self, noisy: &Tensor) -> Result<Tensor, ModelError> {
        Ok(self.forward_with_state(noisy, None)?.0)
    }

    /// Like [`Dccrn::forward`], starting from `state` and returning the state
    /// after the last frame.
    pub fn forward_with_state(
        &self,
        noisy: &Tensor,
        state: Option<&BottleneckState>,
    ) -> Result<(Tensor, BottleneckState), ModelError> {
        let (batch, freq, time) = self.check_input(noisy)?;
        if let Some(state) = state {
            if !self.bottleneck.accepts(state, batch) {
                return Err(ModelError::StateMismatch);
            }
        }
        debug!(batch, freq, time, "DCCRN forward");

        let noisy = split_spectrogram(noisy)?;
        let x = noisy.fit_frequency(self.dims.frequency_bins)?;

        let (deepest, mut skips) = self.encoder.forward(&x)?;
        let (hidden, next_state) = self.bottleneck.forward(&deepest, state)?;
        let x = self.projection.forward(&hidden)?;
        if debug_tensors_enabled() {
            log_tensor_stats("bottleneck", x.re())?;
        }
        let x = self.decoder.forward(x, &mut skips)?;
        let x = x.fit_frequency(freq)?;

        let enhanced = self.head.reconstruct(&x, &noisy)?;
        if debug_tensors_enabled() {
            log_tensor_stats("enhanced", enhanced.re())?;
        }
        Ok((merge_spectrogram(&enhanced)?, next_state))
    }

    fn check_input(&self, noisy: &Tensor) -> Result<(usize, usize, usize), ModelError> {
        let (batch, freq, time, parts) = noisy.dims4().map_err(|_| {
            ModelError::InvalidInput(format!(
                "expected [batch, frequency, time, 2], got {:?}",
                noisy.dims()
            ))
        })?;
        if parts != 2 {
            return Err(ModelError::InvalidInput(format!(
                "trailing axis must hold (real, imaginary), got size {parts}"
            )));
        }
        if batch == 0 || freq == 0 {
            return Err(ModelError::InvalidInput(format!(
                "empty spectrogram {:?}",
                noisy.dims()
            )));
        }
        if time < self.dims.min_time_steps {
            return Err(ModelError::InvalidInput(format!(
                "{time} time steps is below the minimum of {} for {} encoder stages",
                self.dims.min_time_steps, self.config.encoder_depth
            )));
        }
        Ok((batch, freq, time))
    }
}
