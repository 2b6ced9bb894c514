//! Configuration and CLI for DCCRN speech enhancement

use clap::{Args, Parser, Subcommand};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use thiserror::Error;

use crate::complex::ConvGeometry;
use crate::stack::{StageKind, StageSpec};

/// Command line arguments with subcommands
#[derive(Parser, Debug, Clone)]
#[command(name = "dccrn")]
#[command(about = "Complex convolutional-recurrent speech enhancement")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Log level (overridden by RUST_LOG)
    #[arg(long, default_value = "info", global = true)]
    pub log: String,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Enhance a noisy spectrogram stored as .npy
    Enhance(EnhanceArgs),
    /// Write a randomly initialized model directory
    Init(InitArgs),
    /// Show configuration, stage plan and parameter count of a model
    Inspect(InspectArgs),
    /// List available compute devices
    Devices,
}

#[derive(Args, Debug, Clone)]
pub struct EnhanceArgs {
    /// Noisy spectrogram, f32 [batch, freq, time, 2] or [freq, time, 2]
    #[arg(short, long, value_name = "FILE")]
    pub input: PathBuf,

    /// Where to write the enhanced spectrogram
    #[arg(short, long, value_name = "FILE")]
    pub output: PathBuf,

    /// Path to model directory (defaults to the cache directory)
    #[arg(long, value_name = "PATH")]
    pub model_path: Option<PathBuf>,

    /// Device to use (cpu, cuda, metal, auto)
    #[arg(long, default_value = "cpu")]
    pub device: String,

    /// Process in chunks of this many frames, carrying recurrent state
    #[arg(long, value_name = "FRAMES")]
    pub chunk_frames: Option<usize>,
}

impl EnhanceArgs {
    pub fn model_path(&self) -> PathBuf {
        self.model_path.clone().unwrap_or_else(default_model_dir)
    }
}

#[derive(Args, Debug, Clone)]
pub struct InitArgs {
    /// Directory to write config.json and model.safetensors into
    #[arg(short, long, value_name = "PATH")]
    pub output: Option<PathBuf>,

    /// Start from an existing config.json
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// STFT size the model is built for
    #[arg(long)]
    pub transform_size: Option<usize>,

    /// Number of encoder (and decoder) stages
    #[arg(long)]
    pub encoder_depth: Option<usize>,

    /// Base channel count and LSTM hidden size
    #[arg(long)]
    pub hidden_width: Option<usize>,

    /// Number of stacked LSTM layers
    #[arg(long)]
    pub recurrent_depth: Option<usize>,

    /// Output head: magnitude, complex_mask, real_mask (or E, C, R)
    #[arg(long)]
    pub masking_mode: Option<MaskingMode>,

    /// Kernel as FREQ,TIME
    #[arg(long, value_parser = parse_pair)]
    pub kernel: Option<(usize, usize)>,

    /// Stride as FREQ,TIME
    #[arg(long, value_parser = parse_pair)]
    pub stride: Option<(usize, usize)>,

    /// Unidirectional recurrence
    #[arg(long)]
    pub causal: bool,

    /// Use one real LSTM over concatenated streams
    #[arg(long)]
    pub real_recurrent: bool,

    /// Disable complex batch normalization
    #[arg(long)]
    pub no_norm: bool,

    /// Device to initialize on
    #[arg(long, default_value = "cpu")]
    pub device: String,
}

impl InitArgs {
    pub fn output(&self) -> PathBuf {
        self.output.clone().unwrap_or_else(default_model_dir)
    }

    /// Apply command-line overrides on top of `base`.
    pub fn apply(&self, base: DccrnConfig) -> DccrnConfig {
        let mut config = base;
        if let Some(v) = self.transform_size {
            config.transform_size = v;
            config.window_size = config.window_size.min(v);
            config.hop_size = config.hop_size.min(v / 2).max(1);
        }
        if let Some(v) = self.encoder_depth {
            config.encoder_depth = v;
        }
        if let Some(v) = self.hidden_width {
            config.hidden_width = v;
        }
        if let Some(v) = self.recurrent_depth {
            config.recurrent_depth = v;
        }
        if let Some(v) = self.masking_mode {
            config.masking_mode = v;
        }
        if let Some(v) = self.kernel {
            config.kernel_shape = v;
        }
        if let Some(v) = self.stride {
            config.stride_shape = v;
        }
        config.causal |= self.causal;
        if self.real_recurrent {
            config.use_complex_recurrent = false;
        }
        if self.no_norm {
            config.use_normalization = false;
        }
        config
    }
}

#[derive(Args, Debug, Clone)]
pub struct InspectArgs {
    /// Path to model directory (defaults to the cache directory)
    #[arg(long, value_name = "PATH")]
    pub model_path: Option<PathBuf>,
}

impl InspectArgs {
    pub fn model_path(&self) -> PathBuf {
        self.model_path.clone().unwrap_or_else(default_model_dir)
    }
}

/// Parse `"5,2"` into `(5, 2)`.
pub fn parse_pair(s: &str) -> Result<(usize, usize), String> {
    let (a, b) = s
        .split_once(',')
        .ok_or_else(|| format!("expected FREQ,TIME, got '{s}'"))?;
    let parse = |v: &str| {
        v.trim()
            .parse::<usize>()
            .map_err(|e| format!("invalid number '{}': {e}", v.trim()))
    };
    Ok((parse(a)?, parse(b)?))
}

/// `<cache>/dccrn-rs/models/default`
pub fn default_model_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(|| PathBuf::from(".cache"))
        .join("dccrn-rs")
        .join("models")
        .join("default")
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} must be greater than zero")]
    ZeroField(&'static str),

    #[error("window size {window} exceeds transform size {transform}")]
    WindowTooLarge { window: usize, transform: usize },

    #[error("kernel shape {0:?} must be non-zero on both axes")]
    InvalidKernel((usize, usize)),

    #[error("stride shape {0:?} must have a non-zero frequency stride and a time stride of 1")]
    InvalidStride((usize, usize)),

    #[error("transform size {transform} leaves no frequency bins at encoder stage {stage}")]
    DegenerateFrequency { transform: usize, stage: usize },

    #[error("real recurrent output width {0} must be even to split into two streams")]
    OddRecurrentSplit(usize),

    #[error("unknown masking mode '{0}' (expected magnitude, complex_mask or real_mask)")]
    UnknownMaskingMode(String),
}

/// How the decoder output is turned into the enhanced spectrogram.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum MaskingMode {
    /// Sigmoid magnitude mask, noisy phase kept.
    #[default]
    Magnitude,
    /// Unbounded complex mask.
    ComplexMask,
    /// Tanh mask shared by both components.
    RealMask,
}

impl MaskingMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Magnitude => "magnitude",
            Self::ComplexMask => "complex_mask",
            Self::RealMask => "real_mask",
        }
    }

    /// Single-letter code used by exported checkpoints.
    pub fn code(&self) -> char {
        match self {
            Self::Magnitude => 'E',
            Self::ComplexMask => 'C',
            Self::RealMask => 'R',
        }
    }
}

impl fmt::Display for MaskingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MaskingMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "e" | "magnitude" => Ok(Self::Magnitude),
            "c" | "complex" | "complex_mask" => Ok(Self::ComplexMask),
            "r" | "real" | "real_mask" => Ok(Self::RealMask),
            _ => Err(ConfigError::UnknownMaskingMode(s.to_string())),
        }
    }
}

impl TryFrom<String> for MaskingMode {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<MaskingMode> for String {
    fn from(mode: MaskingMode) -> Self {
        mode.as_str().to_string()
    }
}

/// Model configuration, stored as `config.json` next to the weights.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DccrnConfig {
    /// STFT size; the model sees `transform_size / 2 + 1` bins
    pub transform_size: usize,
    pub hop_size: usize,
    pub window_size: usize,
    pub encoder_depth: usize,
    /// Base channel count and LSTM hidden size
    pub hidden_width: usize,
    pub recurrent_depth: usize,
    pub use_complex_recurrent: bool,
    /// (frequency, time)
    pub kernel_shape: (usize, usize),
    /// (frequency, time)
    pub stride_shape: (usize, usize),
    pub use_normalization: bool,
    pub masking_mode: MaskingMode,
    /// Unidirectional recurrence when set
    pub causal: bool,
}

impl Default for DccrnConfig {
    fn default() -> Self {
        Self {
            transform_size: 512,
            hop_size: 256,
            window_size: 512,
            encoder_depth: 5,
            hidden_width: 128,
            recurrent_depth: 2,
            use_complex_recurrent: true,
            kernel_shape: (5, 2),
            stride_shape: (2, 1),
            use_normalization: true,
            masking_mode: MaskingMode::Magnitude,
            causal: false,
        }
    }
}

/// Sizes derived from a validated [`DccrnConfig`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ModelDims {
    pub frequency_bins: usize,
    pub encoder: Vec<StageSpec>,
    pub decoder: Vec<StageSpec>,
    /// Frequency size after each encoder stage
    pub encoder_frequencies: Vec<usize>,
    /// Width of each LSTM input step
    pub recurrent_input: usize,
    /// Width of each LSTM output step, directions included
    pub recurrent_output: usize,
    /// Shortest input the encoder accepts along time
    pub min_time_steps: usize,
}

impl ModelDims {
    pub fn deepest_channels(&self) -> usize {
        self.encoder.last().map(|s| s.out_channels).unwrap_or(1)
    }

    pub fn deepest_frequency(&self) -> usize {
        self.encoder_frequencies
            .last()
            .copied()
            .unwrap_or(self.frequency_bins)
    }
}

impl DccrnConfig {
    pub fn frequency_bins(&self) -> usize {
        self.transform_size / 2 + 1
    }

    pub fn is_bidirectional(&self) -> bool {
        !self.causal
    }

    /// Channel count of encoder stage `i`.
    pub fn encoder_channels(&self, i: usize) -> usize {
        self.hidden_width << i.min(3)
    }

    /// Check every field and derive the stage plan.
    pub fn validate(&self) -> Result<ModelDims, ConfigError> {
        for (name, value) in [
            ("transform_size", self.transform_size),
            ("hop_size", self.hop_size),
            ("window_size", self.window_size),
            ("encoder_depth", self.encoder_depth),
            ("hidden_width", self.hidden_width),
            ("recurrent_depth", self.recurrent_depth),
        ] {
            if value == 0 {
                return Err(ConfigError::ZeroField(name));
            }
        }
        if self.window_size > self.transform_size {
            return Err(ConfigError::WindowTooLarge {
                window: self.window_size,
                transform: self.transform_size,
            });
        }
        let (kf, kt) = self.kernel_shape;
        if kf == 0 || kt == 0 {
            return Err(ConfigError::InvalidKernel(self.kernel_shape));
        }
        let (sf, st) = self.stride_shape;
        if sf == 0 || st != 1 {
            return Err(ConfigError::InvalidStride(self.stride_shape));
        }

        let down = ConvGeometry {
            kernel: self.kernel_shape,
            stride: self.stride_shape,
            padding: (kf / 2, 0),
            output_padding: (0, 0),
        };
        let up = ConvGeometry {
            output_padding: (usize::from(sf > 1), 0),
            ..down
        };

        let frequency_bins = self.frequency_bins();
        let mut encoder = Vec::with_capacity(self.encoder_depth);
        let mut encoder_frequencies = Vec::with_capacity(self.encoder_depth);
        let mut freq = frequency_bins;
        let mut in_channels = 1;
        for i in 0..self.encoder_depth {
            let out_channels = self.encoder_channels(i);
            // Time is checked per input at run time; only frequency is fixed here.
            freq = down
                .conv_output((freq, kt))
                .map(|(f, _)| f)
                .ok_or(ConfigError::DegenerateFrequency {
                    transform: self.transform_size,
                    stage: i,
                })?;
            encoder.push(StageSpec {
                kind: StageKind::Down,
                index: i,
                in_channels,
                out_channels,
                geometry: down,
                normalized: self.use_normalization,
                activated: true,
            });
            encoder_frequencies.push(freq);
            in_channels = out_channels;
        }

        let mut decoder = Vec::with_capacity(self.encoder_depth);
        let mut current = in_channels;
        for i in 0..self.encoder_depth {
            let mirrored = self.encoder_depth - 1 - i;
            let out_channels = if mirrored == 0 {
                1
            } else {
                self.hidden_width << (mirrored - 1).min(3)
            };
            let last = mirrored == 0;
            let normalized = self.use_normalization && !last;
            decoder.push(StageSpec {
                kind: StageKind::Up,
                index: i,
                in_channels: current * 2,
                out_channels,
                geometry: up,
                normalized,
                activated: normalized,
            });
            current = out_channels;
        }

        let directions = if self.is_bidirectional() { 2 } else { 1 };
        let recurrent_output = self.hidden_width * directions;
        let per_stream = in_channels * freq;
        let recurrent_input = if self.use_complex_recurrent {
            per_stream
        } else {
            if recurrent_output % 2 != 0 {
                return Err(ConfigError::OddRecurrentSplit(recurrent_output));
            }
            per_stream * 2
        };

        Ok(ModelDims {
            frequency_bins,
            encoder,
            decoder,
            encoder_frequencies,
            recurrent_input,
            recurrent_output,
            min_time_steps: self.encoder_depth * (kt - 1) + 1,
        })
    }
}

/// Initialize tracing with given log level
pub fn init_tracing(log_level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

/// Load environment variables from .env file
pub fn load_dotenv() {
    let _ = dotenvy::dotenv();
}

/// Get device from string, falling back to CPU
pub fn parse_device(device_str: &str) -> candle_core::Device {
    match device_str.to_lowercase().as_str() {
        "cuda" | "gpu" => candle_core::Device::new_cuda(0).unwrap_or(candle_core::Device::Cpu),
        "metal" | "mps" => candle_core::Device::new_metal(0).unwrap_or(candle_core::Device::Cpu),
        "auto" => crate::model_loader::get_optimal_device(),
        _ => candle_core::Device::Cpu,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_enhance() {
        let cli = Cli::parse_from([
            "dccrn",
            "enhance",
            "--input",
            "noisy.npy",
            "--output",
            "clean.npy",
            "--chunk-frames",
            "32",
        ]);
        let args = match cli.command {
            Some(Commands::Enhance(a)) => a,
            _ => panic!("expected enhance command"),
        };
        assert_eq!(args.input, PathBuf::from("noisy.npy"));
        assert_eq!(args.chunk_frames, Some(32));
        assert_eq!(args.device, "cpu");
        assert_eq!(cli.log, "info");
    }

    #[test]
    fn test_cli_init_overrides() {
        let cli = Cli::parse_from([
            "dccrn",
            "--log",
            "debug",
            "init",
            "--hidden-width",
            "16",
            "--masking-mode",
            "C",
            "--kernel",
            "3,2",
            "--causal",
        ]);
        assert_eq!(cli.log, "debug");
        let args = match cli.command {
            Some(Commands::Init(a)) => a,
            _ => panic!("expected init command"),
        };
        let config = args.apply(DccrnConfig::default());
        assert_eq!(config.hidden_width, 16);
        assert_eq!(config.masking_mode, MaskingMode::ComplexMask);
        assert_eq!(config.kernel_shape, (3, 2));
        assert!(config.causal);
        assert!(config.use_complex_recurrent);
    }

    #[test]
    fn test_init_transform_override_keeps_window_valid() {
        let cli = Cli::parse_from(["dccrn", "init", "--transform-size", "128"]);
        let args = match cli.command {
            Some(Commands::Init(a)) => a,
            _ => panic!("expected init command"),
        };
        let config = args.apply(DccrnConfig::default());
        assert_eq!(config.transform_size, 128);
        assert_eq!(config.window_size, 128);
        assert_eq!(config.hop_size, 64);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_pair() {
        assert_eq!(parse_pair("5,2"), Ok((5, 2)));
        assert_eq!(parse_pair(" 7 , 1 "), Ok((7, 1)));
        assert!(parse_pair("5").is_err());
        assert!(parse_pair("a,2").is_err());
    }

    #[test]
    fn test_default_config() {
        let config = DccrnConfig::default();
        assert_eq!(config.transform_size, 512);
        assert_eq!(config.hop_size, 256);
        assert_eq!(config.window_size, 512);
        assert_eq!(config.encoder_depth, 5);
        assert_eq!(config.hidden_width, 128);
        assert_eq!(config.recurrent_depth, 2);
        assert!(config.use_complex_recurrent);
        assert_eq!(config.kernel_shape, (5, 2));
        assert_eq!(config.stride_shape, (2, 1));
        assert!(config.use_normalization);
        assert_eq!(config.masking_mode, MaskingMode::Magnitude);
        assert!(!config.causal);
        assert_eq!(config.frequency_bins(), 257);
    }

    #[test]
    fn test_masking_mode_parsing() {
        assert_eq!("E".parse::<MaskingMode>(), Ok(MaskingMode::Magnitude));
        assert_eq!("complex_mask".parse::<MaskingMode>(), Ok(MaskingMode::ComplexMask));
        assert_eq!("r".parse::<MaskingMode>(), Ok(MaskingMode::RealMask));
        assert_eq!(
            "X".parse::<MaskingMode>(),
            Err(ConfigError::UnknownMaskingMode("X".to_string()))
        );
        assert_eq!(MaskingMode::ComplexMask.code(), 'C');
    }

    #[test]
    fn test_config_json_round_trip() {
        let config = DccrnConfig {
            hidden_width: 32,
            masking_mode: MaskingMode::RealMask,
            causal: true,
            ..Default::default()
        };
        let json = serde_json::to_string(&config).unwrap();
        assert!(json.contains("\"real_mask\""));
        let parsed: DccrnConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_config_json_partial_and_codes() {
        let parsed: DccrnConfig =
            serde_json::from_str(r#"{"hidden_width": 16, "masking_mode": "C"}"#).unwrap();
        assert_eq!(parsed.hidden_width, 16);
        assert_eq!(parsed.masking_mode, MaskingMode::ComplexMask);
        assert_eq!(parsed.transform_size, 512);

        let bad = serde_json::from_str::<DccrnConfig>(r#"{"masking_mode": "Q"}"#);
        assert!(bad.is_err());
    }

    #[test]
    fn test_validate_default_plan() {
        let config = DccrnConfig {
            hidden_width: 64,
            ..Default::default()
        };
        let dims = config.validate().unwrap();
        assert_eq!(dims.frequency_bins, 257);
        assert_eq!(dims.encoder_frequencies, vec![129, 65, 33, 17, 9]);
        let enc: Vec<usize> = dims.encoder.iter().map(|s| s.out_channels).collect();
        assert_eq!(enc, vec![64, 128, 256, 512, 512]);
        let dec: Vec<(usize, usize)> = dims
            .decoder
            .iter()
            .map(|s| (s.in_channels, s.out_channels))
            .collect();
        assert_eq!(
            dec,
            vec![(1024, 512), (1024, 256), (512, 128), (256, 64), (128, 1)]
        );
        assert_eq!(dims.recurrent_input, 512 * 9);
        assert_eq!(dims.recurrent_output, 128);
        assert_eq!(dims.min_time_steps, 6);
        assert_eq!(dims.encoder[0].geometry.padding, (2, 0));
        assert_eq!(dims.decoder[0].geometry.output_padding, (1, 0));
        let last = dims.decoder.last().unwrap();
        assert!(!last.normalized && !last.activated);
    }

    #[test]
    fn test_channel_schedule_deep_stack() {
        let config = DccrnConfig {
            transform_size: 2048,
            window_size: 2048,
            encoder_depth: 8,
            hidden_width: 4,
            ..Default::default()
        };
        let dims = config.validate().unwrap();
        for (i, spec) in dims.encoder.iter().enumerate() {
            assert_eq!(spec.out_channels, 4 * (1 << i.min(3)));
        }
        for (i, spec) in dims.decoder.iter().enumerate() {
            let j = 7 - i;
            let expected = if j == 0 { 1 } else { 4 * (1 << (j - 1).min(3)) };
            assert_eq!(spec.out_channels, expected);
        }
    }

    #[test]
    fn test_validate_rejects_bad_fields() {
        let base = DccrnConfig::default();
        let cases = [
            (
                DccrnConfig {
                    encoder_depth: 0,
                    ..base.clone()
                },
                ConfigError::ZeroField("encoder_depth"),
            ),
            (
                DccrnConfig {
                    hop_size: 0,
                    ..base.clone()
                },
                ConfigError::ZeroField("hop_size"),
            ),
            (
                DccrnConfig {
                    window_size: 1024,
                    ..base.clone()
                },
                ConfigError::WindowTooLarge {
                    window: 1024,
                    transform: 512,
                },
            ),
            (
                DccrnConfig {
                    kernel_shape: (0, 2),
                    ..base.clone()
                },
                ConfigError::InvalidKernel((0, 2)),
            ),
            (
                DccrnConfig {
                    stride_shape: (2, 2),
                    ..base.clone()
                },
                ConfigError::InvalidStride((2, 2)),
            ),
            (
                DccrnConfig {
                    hidden_width: 7,
                    causal: true,
                    use_complex_recurrent: false,
                    ..base.clone()
                },
                ConfigError::OddRecurrentSplit(7),
            ),
        ];
        for (config, expected) in cases {
            assert_eq!(config.validate(), Err(expected));
        }
    }

    #[test]
    fn test_tiny_transform_bottoms_out_at_one_bin() {
        let config = DccrnConfig {
            transform_size: 4,
            window_size: 4,
            hop_size: 2,
            ..Default::default()
        };
        let dims = config.validate().unwrap();
        assert_eq!(dims.frequency_bins, 3);
        assert_eq!(dims.encoder_frequencies, vec![2, 1, 1, 1, 1]);
    }

    #[test]
    fn test_validate_without_normalization() {
        let config = DccrnConfig {
            use_normalization: false,
            ..Default::default()
        };
        let dims = config.validate().unwrap();
        assert_eq!(dims.encoder.len(), 5);
        assert!(dims.encoder.iter().all(|s| !s.normalized && s.activated));
        assert!(dims.decoder.iter().all(|s| !s.normalized && !s.activated));

        let normalized = DccrnConfig::default().validate().unwrap();
        let (last, inner) = normalized.decoder.split_last().unwrap();
        assert!(inner.iter().all(|s| s.normalized && s.activated));
        assert!(!last.normalized && !last.activated);
    }

    #[test]
    fn test_causal_halves_recurrent_width() {
        let config = DccrnConfig {
            hidden_width: 32,
            causal: true,
            ..Default::default()
        };
        assert_eq!(config.validate().unwrap().recurrent_output, 32);
    }

    #[test]
    fn test_parse_device_falls_back_to_cpu() {
        assert!(parse_device("cpu").is_cpu());
        assert!(parse_device("something-else").is_cpu());
    }
}
