//! Error types for the recognizer workspace.

use thiserror::Error;

/// Main error type for ASR operations.
#[derive(Error, Debug)]
pub enum AsrError {
    /// Audio processing errors.
    #[error("Audio error: {0}")]
    Audio(String),

    /// Model construction / checkpoint errors.
    #[error("Model error: {0}")]
    Model(String),

    /// Inference errors.
    #[error("Inference error: {0}")]
    Inference(String),

    /// Configuration errors.
    #[error("Config error: {0}")]
    Config(String),

    /// Data list / feature archive errors.
    #[error("Data error: {0}")]
    Data(String),

    /// Vocabulary (dict) errors.
    #[error("Vocab error: {0}")]
    Vocab(String),

    /// I/O errors.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Candle tensor errors.
    #[error("Tensor error: {0}")]
    Candle(#[from] candle_core::Error),

    /// JSON parsing errors.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML parsing errors.
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Result type alias for ASR operations.
pub type AsrResult<T> = Result<T, AsrError>;
