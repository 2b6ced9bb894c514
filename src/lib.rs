pub mod cli_style;
pub mod complex;
pub mod config;
pub mod enhancer;
pub mod mask;
pub mod model;
pub mod model_loader;
pub mod recurrent;
pub mod stack;

pub use complex::{ComplexPair, ComplexTensor, ConvGeometry};
pub use config::{Cli, Commands, ConfigError, DccrnConfig, MaskingMode, ModelDims};
pub use enhancer::{
    EnhanceError, EnhanceMetadata, EnhanceResponse, EnhancerConfig, EnhancerInfo,
    SpeechEnhancer, SpeechEnhancerBuilder, StreamingSession,
};
pub use mask::{MaskReconstruction, MaskingHead};
pub use model::{Dccrn, ModelError};
pub use recurrent::{Bottleneck, BottleneckState};
pub use stack::{SkipStack, StageKind, StageSpec};

pub use model_loader::{
    cuda_available, get_optimal_device, init_random_model, load_model_from_path, verify_model,
    ModelFormat, ModelLoaderError, ModelVerification,
};
