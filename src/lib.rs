//! Multi-modal robot policy: token layout, attention masks, query tokens,
//! sequence composition and prediction decoding, plus the training loop.

pub use attention;
pub use embedding;
pub use layers;
pub use model;
pub use training;

pub use model::{
    AttentionMaskBuilder, HeadSet, Modality, ModalityEmbeddings, ModelConfig, ModelError,
    PolicyModel, PredictionDecoder, Predictions, QueryBank, Routing, SequenceComposer,
    TokenLayout,
};
pub use training::{select_device, Trainer, TrainingConfig, TrainingError};

/// Picks the training device, honoring `CANDLE_FORCE_CPU`.
pub fn setup_device() -> candle_core::Device {
    let device = select_device();
    log::info!("selected device {:?}", device);
    device
}

/// Prints the host platform, for diagnosing backend selection.
pub fn check_available_backends() {
    println!(" System Information:");
    println!("   OS: {}", std::env::consts::OS);
    println!("   Architecture: {}", std::env::consts::ARCH);
    println!(
        "   Metal: {}  CUDA: {}",
        candle_core::utils::metal_is_available(),
        candle_core::utils::cuda_is_available()
    );
}
