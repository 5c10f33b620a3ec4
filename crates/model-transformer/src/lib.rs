//! Transformer/Conformer ASR-модель на Candle.
//!
//! Энкодер с субдискретизацией, CTC-голова и attention-декодер.
//! Имена тензоров совпадают с PyTorch state dict обучающего рецепта,
//! поэтому чекпойнты загружаются через VarBuilder без переименования.

pub mod attention;
pub mod checkpoint;
pub mod ctc;
pub mod decoder;
pub mod embedding;
pub mod encoder;
pub mod feed_forward;
pub mod mask;
pub mod model;
pub mod search;
pub mod subsampling;

/// eps всех LayerNorm модели.
pub(crate) const LAYER_NORM_EPS: f64 = 1e-12;

pub use checkpoint::load_checkpoint;
pub use model::AsrModel;
