//! DCCRN - speech enhancement CLI
//!
//! A single binary providing:
//! - `enhance` - Enhance a noisy spectrogram stored as .npy
//! - `init` - Write a randomly initialized model directory
//! - `inspect` - Show a model's configuration and stage plan
//! - `devices` - List compute devices
//!
//! Usage:
//!   dccrn init --output ./model --hidden-width 32
//!   dccrn enhance -i noisy.npy -o clean.npy --model-path ./model
//!   dccrn inspect --model-path ./model
//!   dccrn devices

use std::time::Instant;

use candle_core::{Device, Tensor};
use clap::Parser;
use tracing::info;

use dccrn::{
    cli_style::{
        print_banner, print_box, print_device_status, print_error, print_info, print_section,
        print_stage_table, print_success, print_usage_examples, print_warning,
    },
    config::{
        init_tracing, load_dotenv, parse_device, Cli, Commands, EnhanceArgs, InitArgs,
        InspectArgs,
    },
    enhancer::{EnhancerConfig, SpeechEnhancer},
    model_loader::{
        count_parameters, cuda_available, find_weights_file, get_optimal_device,
        init_random_model, load_config, metal_available, verify_model,
    },
};

/// Main entry point with subcommand dispatch
fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load environment variables from .env file if present
    load_dotenv();

    let cli = Cli::parse();
    init_tracing(&cli.log);

    match cli.command {
        Some(Commands::Enhance(args)) => run_enhance(args),
        Some(Commands::Init(args)) => run_init(args),
        Some(Commands::Inspect(args)) => run_inspect(args),
        Some(Commands::Devices) => run_devices(),
        None => {
            print_banner();
            print_usage_examples();
            Ok(())
        }
    }
}

fn device_name(device: &Device) -> &'static str {
    match device {
        Device::Cpu => "CPU",
        Device::Cuda(_) => "CUDA",
        Device::Metal(_) => "Metal",
    }
}

/// Run the enhance subcommand
fn run_enhance(args: EnhanceArgs) -> Result<(), Box<dyn std::error::Error>> {
    let device = parse_device(&args.device);
    let model_path = args.model_path();
    let start = Instant::now();

    let enhancer = SpeechEnhancer::new(EnhancerConfig {
        model_path: model_path.clone(),
        device: device.clone(),
        num_workers: 1,
    })?;
    info!("Model loaded in {:.2?}", start.elapsed());

    let noisy = Tensor::read_npy(&args.input)?;
    info!("Read {:?} from {:?}", noisy.dims(), args.input);

    let response = match args.chunk_frames {
        Some(frames) => enhancer.enhance_streaming(&noisy, frames),
        None => enhancer.enhance(&noisy),
    };
    let response = match response {
        Ok(response) => response,
        Err(e) => {
            print_error(&format!("Enhancement failed: {}", e));
            return Err(e.into());
        }
    };

    response.spectrogram.to_device(&Device::Cpu)?.write_npy(&args.output)?;

    let meta = &response.metadata;
    print_success(&format!(
        "Enhanced {} x {} bins x {} frames in {} chunk(s), {}ms",
        meta.batch_size, meta.frequency_bins, meta.time_steps, meta.chunks, meta.processing_time_ms
    ));
    print_info(&format!("Wrote {:?}", args.output));
    Ok(())
}

/// Run the init subcommand
fn run_init(args: InitArgs) -> Result<(), Box<dyn std::error::Error>> {
    let base = match &args.config {
        Some(path) => serde_json::from_str(&std::fs::read_to_string(path)?)?,
        None => Default::default(),
    };
    let config = args.apply(base);
    let output = args.output();
    let device = parse_device(&args.device);

    let dims = config.validate()?;
    init_random_model(&output, &config, &device)?;
    let parameters = count_parameters(&find_weights_file(&output)?)?;

    print_success(&format!("Wrote random model to {:?}", output));
    print_info(&format!(
        "{} stages, {} parameters, minimum {} frames",
        config.encoder_depth, parameters, dims.min_time_steps
    ));
    Ok(())
}

/// Run the inspect subcommand
fn run_inspect(args: InspectArgs) -> Result<(), Box<dyn std::error::Error>> {
    let model_path = args.model_path();
    let verification = verify_model(&model_path)?;
    let config = load_config(&model_path)?;

    print_box(
        "Model",
        &[
            ("Path", model_path.display().to_string()),
            (
                "Format",
                verification
                    .format
                    .map(|f| f.as_str().to_string())
                    .unwrap_or_else(|| "none".to_string()),
            ),
            ("Transform", config.transform_size.to_string()),
            ("Bins", config.frequency_bins().to_string()),
            ("Hidden width", config.hidden_width.to_string()),
            ("Recurrent depth", config.recurrent_depth.to_string()),
            (
                "Recurrence",
                if config.use_complex_recurrent {
                    "complex".to_string()
                } else {
                    "real".to_string()
                },
            ),
            ("Causal", config.causal.to_string()),
            ("Head", config.masking_mode.to_string()),
        ],
    );

    match config.validate() {
        Ok(dims) => print_stage_table(&dims),
        Err(e) => print_error(&format!("Invalid configuration: {}", e)),
    }

    print_section("Verification");
    if let Ok(weights) = find_weights_file(&model_path) {
        match count_parameters(&weights) {
            Ok(n) => print_info(&format!("{} parameters in {:?}", n, weights)),
            Err(e) => print_warning(&format!("Could not count parameters: {}", e)),
        }
    }
    for name in &verification.unused_tensors {
        print_warning(&format!("Unused tensor {}", name));
    }
    if verification.is_valid {
        print_success("Model is valid");
    } else {
        for e in &verification.errors {
            print_error(e);
        }
    }
    Ok(())
}

/// Run the devices subcommand
fn run_devices() -> Result<(), Box<dyn std::error::Error>> {
    print_banner();
    print_section("Compute Devices");
    print_device_status("CPU", true);
    print_device_status("CUDA", cuda_available());
    print_device_status("Metal", metal_available());
    println!();
    print_info(&format!(
        "Recommended: {}",
        device_name(&get_optimal_device())
    ));
    print_usage_examples();
    Ok(())
}
