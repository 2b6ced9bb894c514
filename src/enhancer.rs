//! Speech enhancement service for DCCRN
//!
//! Wraps a shared [`Dccrn`] with input preparation, batch fan-out over worker
//! threads and chunked streaming that threads recurrent state between chunks.

use candle_core::{DType, Device, Tensor};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::config::{default_model_dir, MaskingMode};
use crate::model::{Dccrn, ModelError};
use crate::model_loader::{load_model_from_path, ModelLoaderError};
use crate::recurrent::BottleneckState;

// =============================================================================
// Error Types
// =============================================================================

/// Errors that can occur during enhancement
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EnhanceError {
    #[error("Model error: {0}")]
    ModelError(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Recurrent state mismatch: {0}")]
    StateMismatch(String),

    #[error("Model loading failed: {0}")]
    LoadError(String),

    #[error("Worker {0} panicked")]
    WorkerPanicked(usize),

    #[error("Configuration error: {0}")]
    ConfigError(String),
}

impl From<candle_core::Error> for EnhanceError {
    fn from(err: candle_core::Error) -> Self {
        EnhanceError::ModelError(err.to_string())
    }
}

impl From<ModelError> for EnhanceError {
    fn from(err: ModelError) -> Self {
        match err {
            ModelError::InvalidInput(msg) => EnhanceError::InvalidInput(msg),
            ModelError::StateMismatch => {
                EnhanceError::StateMismatch(ModelError::StateMismatch.to_string())
            }
            ModelError::Config(e) => EnhanceError::ConfigError(e.to_string()),
            ModelError::Candle(e) => EnhanceError::ModelError(e.to_string()),
        }
    }
}

impl From<ModelLoaderError> for EnhanceError {
    fn from(err: ModelLoaderError) -> Self {
        EnhanceError::LoadError(err.to_string())
    }
}

// =============================================================================
// Request/Response Types
// =============================================================================

/// Enhanced spectrogram with processing metadata
#[derive(Clone, Debug)]
pub struct EnhanceResponse {
    /// Enhanced spectrogram, same shape as the input
    pub spectrogram: Tensor,
    pub metadata: EnhanceMetadata,
}

/// Metadata about one enhancement
#[derive(Clone, Debug, Default)]
pub struct EnhanceMetadata {
    pub batch_size: usize,
    pub frequency_bins: usize,
    pub time_steps: usize,
    /// Number of chunks processed (1 unless streaming)
    pub chunks: usize,
    /// Total processing time
    pub processing_time_ms: u64,
}

/// Enhancer information
#[derive(Clone, Debug)]
pub struct EnhancerInfo {
    pub name: String,
    pub version: String,
    pub frequency_bins: usize,
    pub encoder_depth: usize,
    pub masking_mode: MaskingMode,
    pub causal: bool,
    pub min_time_steps: usize,
    pub num_workers: usize,
}

/// Configuration for [`SpeechEnhancer`]
#[derive(Clone, Debug)]
pub struct EnhancerConfig {
    /// Model directory with config.json and weights
    pub model_path: PathBuf,
    /// Device to run on
    pub device: Device,
    /// Worker threads used by `enhance_batch`
    pub num_workers: usize,
}

impl Default for EnhancerConfig {
    fn default() -> Self {
        Self {
            model_path: default_model_dir(),
            device: Device::Cpu,
            num_workers: 2,
        }
    }
}

// =============================================================================
// Speech Enhancer
// =============================================================================

/// Shared-model enhancement service
#[derive(Clone, Debug)]
pub struct SpeechEnhancer {
    model: Arc<Dccrn>,
    num_workers: usize,
}

impl SpeechEnhancer {
    /// Load the model described by `config`
    pub fn new(config: EnhancerConfig) -> Result<Self, EnhanceError> {
        if config.num_workers == 0 {
            return Err(EnhanceError::ConfigError(
                "num_workers must be at least 1".to_string(),
            ));
        }
        let model = load_model_from_path(&config.model_path, &config.device)?;
        info!(
            "Speech enhancer ready on {:?} with {} workers",
            config.device, config.num_workers
        );
        Ok(Self::from_model(model, config.num_workers))
    }

    /// Load from a model directory with default settings
    pub fn from_path(model_path: impl AsRef<Path>) -> Result<Self, EnhanceError> {
        Self::new(EnhancerConfig {
            model_path: model_path.as_ref().to_path_buf(),
            ..Default::default()
        })
    }

    /// Wrap an already constructed model
    pub fn from_model(model: Dccrn, num_workers: usize) -> Self {
        Self {
            model: Arc::new(model),
            num_workers: num_workers.max(1),
        }
    }

    pub fn model(&self) -> &Dccrn {
        &self.model
    }

    pub fn info(&self) -> EnhancerInfo {
        let config = self.model.config();
        EnhancerInfo {
            name: "DCCRN".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            frequency_bins: config.frequency_bins(),
            encoder_depth: config.encoder_depth,
            masking_mode: config.masking_mode,
            causal: config.causal,
            min_time_steps: self.model.min_time_steps(),
            num_workers: self.num_workers,
        }
    }

    /// Bring an input to `[batch, freq, time, 2]` f32 on the model device.
    /// A rank-3 input gets a batch axis; the flag says to drop it again.
    fn prepare_input(&self, noisy: &Tensor) -> Result<(Tensor, bool), EnhanceError> {
        let unbatched = noisy.rank() == 3;
        let noisy = if unbatched {
            noisy.unsqueeze(0)?
        } else {
            noisy.clone()
        };
        let noisy = noisy
            .to_dtype(DType::F32)?
            .to_device(self.model.device())?;
        Ok((noisy, unbatched))
    }

    fn respond(
        &self,
        spectrogram: Tensor,
        unbatched: bool,
        chunks: usize,
        start: Instant,
    ) -> Result<EnhanceResponse, EnhanceError> {
        let (batch_size, frequency_bins, time_steps, _) = spectrogram.dims4()?;
        let spectrogram = if unbatched {
            spectrogram.squeeze(0)?
        } else {
            spectrogram
        };
        Ok(EnhanceResponse {
            spectrogram,
            metadata: EnhanceMetadata {
                batch_size,
                frequency_bins,
                time_steps,
                chunks,
                processing_time_ms: start.elapsed().as_millis() as u64,
            },
        })
    }

    /// Enhance one spectrogram in a single pass
    #[instrument(skip_all, fields(dims = ?noisy.dims()))]
    pub fn enhance(&self, noisy: &Tensor) -> Result<EnhanceResponse, EnhanceError> {
        let start = Instant::now();
        let (noisy, unbatched) = self.prepare_input(noisy)?;
        let enhanced = self.model.forward(&noisy)?;
        let response = self.respond(enhanced, unbatched, 1, start)?;
        debug!(
            "Enhanced {} frames in {}ms",
            response.metadata.time_steps, response.metadata.processing_time_ms
        );
        Ok(response)
    }

    /// Enhance independent requests on up to `num_workers` scoped threads,
    /// each taking a contiguous slice of `inputs`.
    ///
    /// Results come back in request order. When a worker panics, every
    /// request in its slice gets `EnhanceError::WorkerPanicked` in place and
    /// the other slices are unaffected.
    pub fn enhance_batch(&self, inputs: &[Tensor]) -> Vec<Result<EnhanceResponse, EnhanceError>> {
        if inputs.is_empty() {
            return Vec::new();
        }
        let workers = self.num_workers.min(inputs.len());
        let per_worker = inputs.len().div_ceil(workers);
        debug!(
            "Enhancing {} requests on {} workers",
            inputs.len(),
            workers
        );

        std::thread::scope(|scope| {
            let handles: Vec<_> = inputs
                .chunks(per_worker)
                .map(|chunk| {
                    let handle = scope.spawn(move || {
                        chunk.iter().map(|x| self.enhance(x)).collect::<Vec<_>>()
                    });
                    (chunk.len(), handle)
                })
                .collect();

            collect_worker_results(
                handles
                    .into_iter()
                    .map(|(len, handle)| (len, handle.join().ok())),
            )
        })
    }

    /// Start a streaming session with no recurrent state
    pub fn session(&self) -> StreamingSession {
        StreamingSession::new(Arc::clone(&self.model))
    }

    /// Enhance in chunks of `chunk_frames` along time, threading recurrent
    /// state from one chunk to the next
    #[instrument(skip(self, noisy), fields(dims = ?noisy.dims()))]
    pub fn enhance_streaming(
        &self,
        noisy: &Tensor,
        chunk_frames: usize,
    ) -> Result<EnhanceResponse, EnhanceError> {
        if chunk_frames == 0 {
            return Err(EnhanceError::ConfigError(
                "chunk_frames must be at least 1".to_string(),
            ));
        }
        if !self.model.config().causal {
            warn!("Streaming a bidirectional model; backward state is carried across chunks");
        }
        let start = Instant::now();
        let (noisy, unbatched) = self.prepare_input(noisy)?;
        let time = noisy.dim(2)?;
        let bounds = chunk_bounds(time, chunk_frames, self.model.min_time_steps());

        let mut session = self.session();
        let mut outputs = Vec::with_capacity(bounds.len());
        for &(offset, len) in &bounds {
            outputs.push(session.process(&noisy.narrow(2, offset, len)?)?);
        }
        let enhanced = Tensor::cat(&outputs, 2)?;
        self.respond(enhanced, unbatched, bounds.len(), start)
    }
}

/// Flatten per-worker results in worker order. A worker that panicked
/// (`None`) yields `WorkerPanicked` for each of its `len` requests.
fn collect_worker_results<T>(
    workers: impl IntoIterator<Item = (usize, Option<Vec<Result<T, EnhanceError>>>)>,
) -> Vec<Result<T, EnhanceError>> {
    workers
        .into_iter()
        .enumerate()
        .flat_map(|(worker, (len, results))| match results {
            Some(results) => results,
            None => (0..len)
                .map(|_| Err(EnhanceError::WorkerPanicked(worker)))
                .collect(),
        })
        .collect()
}

/// Split `total` frames into `(offset, len)` chunks of `chunk` frames. Every
/// chunk holds at least `min_len` frames when `total` allows it; a short tail
/// is merged into the chunk before it.
pub fn chunk_bounds(total: usize, chunk: usize, min_len: usize) -> Vec<(usize, usize)> {
    let chunk = chunk.max(min_len).max(1);
    if total <= chunk {
        return vec![(0, total)];
    }
    let mut bounds = Vec::with_capacity(total.div_ceil(chunk));
    let mut offset = 0;
    while offset < total {
        let len = chunk.min(total - offset);
        bounds.push((offset, len));
        offset += len;
    }
    if let [.., prev, last] = bounds.as_mut_slice() {
        if last.1 < min_len {
            prev.1 += last.1;
            bounds.pop();
        }
    }
    bounds
}

// =============================================================================
// Streaming
// =============================================================================

/// Successive chunks of one stream, with the recurrent state carried over
#[derive(Debug)]
pub struct StreamingSession {
    model: Arc<Dccrn>,
    state: Option<BottleneckState>,
    chunks_processed: usize,
}

impl StreamingSession {
    pub fn new(model: Arc<Dccrn>) -> Self {
        Self {
            model,
            state: None,
            chunks_processed: 0,
        }
    }

    /// Enhance the next `[batch, freq, time, 2]` chunk
    pub fn process(&mut self, chunk: &Tensor) -> Result<Tensor, EnhanceError> {
        let (enhanced, state) = self.model.forward_with_state(chunk, self.state.as_ref())?;
        self.state = Some(state);
        self.chunks_processed += 1;
        Ok(enhanced)
    }

    pub fn state(&self) -> Option<&BottleneckState> {
        self.state.as_ref()
    }

    pub fn chunks_processed(&self) -> usize {
        self.chunks_processed
    }

    /// Forget the recurrent state
    pub fn reset(&mut self) {
        self.state = None;
        self.chunks_processed = 0;
    }
}

// =============================================================================
// Builder Pattern
// =============================================================================

/// Builder for [`SpeechEnhancer`]
pub struct SpeechEnhancerBuilder {
    config: EnhancerConfig,
}

impl SpeechEnhancerBuilder {
    pub fn new(model_path: impl AsRef<Path>) -> Self {
        Self {
            config: EnhancerConfig {
                model_path: model_path.as_ref().to_path_buf(),
                ..Default::default()
            },
        }
    }

    pub fn with_device(mut self, device: Device) -> Self {
        self.config.device = device;
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.config.num_workers = workers;
        self
    }

    pub fn build(self) -> Result<SpeechEnhancer, EnhanceError> {
        SpeechEnhancer::new(self.config)
    }
}

// =============================================================================
// Tests
// =============================================================================
