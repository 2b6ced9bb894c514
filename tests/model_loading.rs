//! Model directory round-trips: init, verify, load, enhance.

mod common;

use common::{max_abs_diff, random_spectrogram, small_config, small_config_with};

use candle_core::Device;

use dccrn::model_loader::{load_config, CONFIG_FILE};
use dccrn::{
    init_random_model, load_model_from_path, verify_model, DccrnConfig, MaskingMode,
    ModelFormat, ModelLoaderError, SpeechEnhancerBuilder,
};

#[test]
fn test_loaded_model_matches_initialized_model() {
    let dir = tempfile::tempdir().unwrap();
    for mode in [MaskingMode::Magnitude, MaskingMode::ComplexMask] {
        let config = small_config_with(mode, false, false);
        let written = init_random_model(dir.path(), &config, &Device::Cpu).unwrap();
        let loaded = load_model_from_path(dir.path(), &Device::Cpu).unwrap();
        assert_eq!(loaded.config(), &config);

        let noisy = random_spectrogram(1, 17, 8);
        let a = written.forward(&noisy).unwrap();
        let b = loaded.forward(&noisy).unwrap();
        assert!(max_abs_diff(&a, &b) < 1e-6, "{mode} diverged after reload");
    }
}

#[test]
fn test_verify_initialized_directory() {
    let dir = tempfile::tempdir().unwrap();
    init_random_model(dir.path(), &small_config(), &Device::Cpu).unwrap();

    let verification = verify_model(dir.path()).unwrap();
    assert!(verification.is_valid, "{:?}", verification.errors);
    assert_eq!(verification.format, Some(ModelFormat::SafeTensors));
    assert!(verification.files_found.iter().any(|f| f == CONFIG_FILE));
}

#[test]
fn test_config_mismatch_fails_verification() {
    let dir = tempfile::tempdir().unwrap();
    init_random_model(dir.path(), &small_config(), &Device::Cpu).unwrap();

    // Same weights, but a config asking for a deeper stack.
    let deeper = DccrnConfig {
        encoder_depth: 4,
        ..small_config()
    };
    std::fs::write(
        dir.path().join(CONFIG_FILE),
        serde_json::to_string_pretty(&deeper).unwrap(),
    )
    .unwrap();

    let verification = verify_model(dir.path()).unwrap();
    assert!(!verification.is_valid);
    assert!(load_model_from_path(dir.path(), &Device::Cpu).is_err());
}

#[test]
fn test_config_file_round_trips() {
    let dir = tempfile::tempdir().unwrap();
    let config = small_config_with(MaskingMode::RealMask, true, true);
    init_random_model(dir.path(), &config, &Device::Cpu).unwrap();

    let json: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(dir.path().join(CONFIG_FILE)).unwrap())
            .unwrap();
    assert_eq!(json["masking_mode"], "real_mask");
    assert_eq!(json["causal"], true);
    assert_eq!(load_config(dir.path()).unwrap(), config);

    std::fs::write(
        dir.path().join(CONFIG_FILE),
        r#"{"transform_size": 32, "masking_mode": "Q"}"#,
    )
    .unwrap();
    assert!(matches!(
        load_config(dir.path()),
        Err(ModelLoaderError::Serialization(_))
    ));
}

#[test]
fn test_builder_loads_directory() {
    let dir = tempfile::tempdir().unwrap();
    init_random_model(dir.path(), &small_config(), &Device::Cpu).unwrap();

    let enhancer = SpeechEnhancerBuilder::new(dir.path())
        .with_device(Device::Cpu)
        .with_workers(2)
        .build()
        .unwrap();
    let info = enhancer.info();
    assert_eq!(info.frequency_bins, 17);
    assert_eq!(info.num_workers, 2);

    let response = enhancer.enhance(&random_spectrogram(1, 17, 8)).unwrap();
    assert_eq!(response.spectrogram.dims(), &[1, 17, 8, 2]);
}

#[test]
fn test_missing_directory_is_reported() {
    let dir = tempfile::tempdir().unwrap();
    let missing = dir.path().join("nothing-here");
    assert!(load_model_from_path(&missing, &Device::Cpu).is_err());
    assert!(SpeechEnhancerBuilder::new(&missing).build().is_err());
}
