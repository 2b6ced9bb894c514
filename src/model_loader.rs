//! Model directory handling for DCCRN
//!
//! This module provides functionality to:
//! - Detect weight formats (SafeTensors, PyTorch)
//! - Read and write `config.json`
//! - Verify a model directory against the tensor names the network expects
//! - Build a [`Dccrn`] from a directory
//! - Write randomly initialized models
//! - Pick a compute device

use candle_core::{DType, Device, Error as CandleError};
use candle_nn::{VarBuilder, VarMap};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::{ConfigError, DccrnConfig};
use crate::model::{Dccrn, ModelError};

pub const CONFIG_FILE: &str = "config.json";
pub const WEIGHTS_FILE: &str = "model.safetensors";

/// Errors that can occur during model loading
#[derive(Error, Debug)]
pub enum ModelLoaderError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Candle error: {0}")]
    Candle(#[from] CandleError),

    #[error("SafeTensors error: {0}")]
    SafeTensors(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Model error: {0}")]
    Model(#[from] ModelError),

    #[error("Invalid model format: {0}")]
    InvalidFormat(String),

    #[error("Model file not found: {0}")]
    NotFound(String),

    #[error("Other error: {0}")]
    Other(String),
}

impl From<safetensors::SafeTensorError> for ModelLoaderError {
    fn from(e: safetensors::SafeTensorError) -> Self {
        ModelLoaderError::SafeTensors(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ModelLoaderError>;

/// Supported model weight formats
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ModelFormat {
    /// SafeTensors format
    SafeTensors,
    /// PyTorch state dict
    PyTorch,
}

impl ModelFormat {
    /// Detect format from file extension
    pub fn from_path(path: &Path) -> Result<Self> {
        match path.extension().and_then(|e| e.to_str()) {
            Some("safetensors") => Ok(ModelFormat::SafeTensors),
            Some("pth") | Some("pt") => Ok(ModelFormat::PyTorch),
            _ => Err(ModelLoaderError::InvalidFormat(format!(
                "Unknown file format: {:?}",
                path
            ))),
        }
    }

    /// Get the format name as a string
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelFormat::SafeTensors => "SafeTensors",
            ModelFormat::PyTorch => "PyTorch",
        }
    }
}

/// Model verification result
#[derive(Debug, Clone)]
pub struct ModelVerification {
    pub format: Option<ModelFormat>,
    pub is_valid: bool,
    pub files_found: Vec<String>,
    pub errors: Vec<String>,
    /// Tensors in the weights file that the network does not use
    pub unused_tensors: Vec<String>,
}

/// Read `config.json`, falling back to defaults when it is absent
pub fn load_config(model_dir: &Path) -> Result<DccrnConfig> {
    let path = model_dir.join(CONFIG_FILE);
    if !path.exists() {
        warn!("No {} in {:?}, using default configuration", CONFIG_FILE, model_dir);
        return Ok(DccrnConfig::default());
    }
    let text = std::fs::read_to_string(&path)?;
    let config: DccrnConfig = serde_json::from_str(&text)?;
    debug!("Loaded configuration: {:?}", config);
    Ok(config)
}

/// Write `config.json`
pub fn save_config(model_dir: &Path, config: &DccrnConfig) -> Result<()> {
    std::fs::create_dir_all(model_dir)?;
    let text = serde_json::to_string_pretty(config)?;
    std::fs::write(model_dir.join(CONFIG_FILE), text)?;
    Ok(())
}

/// Locate the weights file, preferring `model.safetensors`, then any
/// `.safetensors`, then `.pth` / `.pt`
pub fn find_weights_file(model_dir: &Path) -> Result<PathBuf> {
    let preferred = model_dir.join(WEIGHTS_FILE);
    if preferred.is_file() {
        return Ok(preferred);
    }
    let mut candidates: Vec<PathBuf> = std::fs::read_dir(model_dir)?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.is_file() && ModelFormat::from_path(p).is_ok())
        .collect();
    candidates.sort();
    candidates
        .iter()
        .find(|p| matches!(ModelFormat::from_path(p), Ok(ModelFormat::SafeTensors)))
        .or_else(|| candidates.first())
        .cloned()
        .ok_or_else(|| {
            ModelLoaderError::NotFound(format!("No weights file found in {:?}", model_dir))
        })
}

/// Open a weights file as a `VarBuilder` producing f32 tensors on `device`
pub fn load_var_builder(path: &Path, device: &Device) -> Result<VarBuilder<'static>> {
    let vb = match ModelFormat::from_path(path)? {
        // SAFETY: the file is mapped read-only and must not change while loaded.
        ModelFormat::SafeTensors => unsafe {
            VarBuilder::from_mmaped_safetensors(&[path], DType::F32, device)?
        },
        ModelFormat::PyTorch => VarBuilder::from_pth(path, DType::F32, device)?,
    };
    Ok(vb)
}

/// Load a complete model from a directory holding `config.json` and weights
pub fn load_model_from_path(model_dir: &Path, device: &Device) -> Result<Dccrn> {
    info!("Loading model from local path: {:?}", model_dir);

    if !model_dir.exists() {
        return Err(ModelLoaderError::NotFound(format!(
            "Model path does not exist: {:?}",
            model_dir
        )));
    }

    let config = load_config(model_dir)?;
    let weights = find_weights_file(model_dir)?;
    info!(
        "Loading {} weights from {:?}",
        ModelFormat::from_path(&weights)?.as_str(),
        weights
    );
    let vb = load_var_builder(&weights, device)?;
    Ok(Dccrn::new(config, vb)?)
}

/// Total number of scalar parameters stored in a weights file
pub fn count_parameters(path: &Path) -> Result<usize> {
    match ModelFormat::from_path(path)? {
        ModelFormat::SafeTensors => {
            let file = std::fs::File::open(path)?;
            // SAFETY: read-only mapping, only the header and shapes are inspected.
            let buffer = unsafe { memmap2::Mmap::map(&file)? };
            let tensors = safetensors::SafeTensors::deserialize(&buffer)?;
            Ok(tensors
                .tensors()
                .iter()
                .map(|(_, view)| view.shape().iter().product::<usize>())
                .sum())
        }
        ModelFormat::PyTorch => Ok(candle_core::pickle::read_all(path)?
            .iter()
            .map(|(_, t)| t.elem_count())
            .sum()),
    }
}

/// Names and shapes of every tensor a model with `config` reads
pub fn expected_tensors(config: &DccrnConfig) -> Result<Vec<(String, Vec<usize>)>> {
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
    Dccrn::new(config.clone(), vb)?;
    let data = varmap
        .data()
        .lock()
        .map_err(|_| ModelLoaderError::Other("parameter map lock poisoned".to_string()))?;
    let mut names: Vec<(String, Vec<usize>)> = data
        .iter()
        .map(|(name, var)| (name.clone(), var.dims().to_vec()))
        .collect();
    names.sort();
    Ok(names)
}

fn safetensors_header(path: &Path) -> Result<Vec<(String, Vec<usize>)>> {
    let file = std::fs::File::open(path)?;
    // SAFETY: read-only mapping, only the header is inspected.
    let buffer = unsafe { memmap2::Mmap::map(&file)? };
    let tensors = safetensors::SafeTensors::deserialize(&buffer)?;
    Ok(tensors
        .tensors()
        .into_iter()
        .map(|(name, view)| (name, view.shape().to_vec()))
        .collect())
}

/// Verify a model directory contains a usable configuration and weights
pub fn verify_model(model_path: &Path) -> Result<ModelVerification> {
    info!("Verifying model at {:?}", model_path);

    let mut verification = ModelVerification {
        format: None,
        is_valid: false,
        files_found: Vec::new(),
        errors: Vec::new(),
        unused_tensors: Vec::new(),
    };

    if !model_path.exists() {
        verification
            .errors
            .push(format!("Model path does not exist: {:?}", model_path));
        return Ok(verification);
    }

    let config = if model_path.join(CONFIG_FILE).exists() {
        verification.files_found.push(CONFIG_FILE.to_string());
        match load_config(model_path) {
            Ok(config) => Some(config),
            Err(e) => {
                verification.errors.push(format!("Invalid {}: {}", CONFIG_FILE, e));
                None
            }
        }
    } else {
        verification.errors.push(format!("Missing {}", CONFIG_FILE));
        None
    };
    if let Some(Err(e)) = config.as_ref().map(|c| c.validate()) {
        verification.errors.push(format!("Invalid configuration: {}", e));
    }

    let weights = match find_weights_file(model_path) {
        Ok(path) => path,
        Err(_) => {
            verification.errors.push("Missing weights file".to_string());
            return Ok(finish(verification));
        }
    };
    if let Some(name) = weights.file_name() {
        verification.files_found.push(name.to_string_lossy().to_string());
    }
    let format = ModelFormat::from_path(&weights)?;
    verification.format = Some(format);

    // Tensor names can only be checked cheaply for SafeTensors headers.
    if let (ModelFormat::SafeTensors, Some(config)) = (format, config.as_ref()) {
        if verification.errors.is_empty() {
            match (safetensors_header(&weights), expected_tensors(config)) {
                (Ok(found), Ok(expected)) => {
                    compare_tensors(&mut verification, &found, &expected)
                }
                (Err(e), _) | (_, Err(e)) => verification
                    .errors
                    .push(format!("Could not read tensors: {}", e)),
            }
        }
    }

    Ok(finish(verification))
}

fn compare_tensors(
    verification: &mut ModelVerification,
    found: &[(String, Vec<usize>)],
    expected: &[(String, Vec<usize>)],
) {
    let expected_names: BTreeSet<&str> = expected.iter().map(|(n, _)| n.as_str()).collect();
    for (name, shape) in expected {
        match found.iter().find(|(n, _)| n == name) {
            None => verification.errors.push(format!("Missing tensor {}", name)),
            Some((_, s)) if s != shape => verification.errors.push(format!(
                "Tensor {} has shape {:?}, expected {:?}",
                name, s, shape
            )),
            Some(_) => {}
        }
    }
    verification.unused_tensors = found
        .iter()
        .filter(|(n, _)| !expected_names.contains(n.as_str()))
        .map(|(n, _)| n.clone())
        .collect();
    verification.unused_tensors.sort();
}

fn finish(mut verification: ModelVerification) -> ModelVerification {
    verification.is_valid = verification.format.is_some() && verification.errors.is_empty();
    if verification.is_valid {
        info!(
            "Model verification passed: {} format",
            verification.format.map(|f| f.as_str()).unwrap_or("unknown")
        );
        if !verification.unused_tensors.is_empty() {
            debug!("{} unused tensors", verification.unused_tensors.len());
        }
    } else {
        warn!(
            "Model verification failed with {} errors",
            verification.errors.len()
        );
    }
    verification
}

/// Write `config.json` and randomly initialized `model.safetensors`
pub fn init_random_model(model_dir: &Path, config: &DccrnConfig, device: &Device) -> Result<Dccrn> {
    std::fs::create_dir_all(model_dir)?;
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
    let model = Dccrn::new(config.clone(), vb)?;
    varmap.save(model_dir.join(WEIGHTS_FILE))?;
    save_config(model_dir, config)?;
    info!(
        "Wrote random model with {} tensors to {:?}",
        varmap.all_vars().len(),
        model_dir
    );
    Ok(model)
}

/// Utility to check if CUDA is available
pub fn cuda_available() -> bool {
    candle_core::utils::cuda_is_available()
}

/// Utility to check if Metal is available
pub fn metal_available() -> bool {
    candle_core::utils::metal_is_available()
}

/// Get the best available device
pub fn get_optimal_device() -> Device {
    if cuda_available() {
        Device::new_cuda(0).unwrap_or(Device::Cpu)
    } else if metal_available() {
        Device::new_metal(0).unwrap_or(Device::Cpu)
    } else {
        Device::Cpu
    }
}
