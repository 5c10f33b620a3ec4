//! # asr-core
//!
//! Базовые типы, трейты и определения ошибок для батчевого распознавателя.
//!
//! - Общие типы данных (`AudioBuffer`, `FeatureMatrix`, `Batch`)
//! - Конфигурация эксперимента (`ExperimentConfig`, YAML)
//! - Унифицированная обработка ошибок через `AsrError`
//! - Trait [`Recognizer`]: интерфейс модели для цикла инференса

pub mod config;
pub mod error;
pub mod traits;
pub mod types;

pub use config::{
    ActivationType, BatchType, CollateConf, DatasetConf, DecoderConf, EncoderConf, EncoderType,
    ExperimentConfig, FeatureExtractionConf, InputLayer, ModelConf, PosEncType,
    SelfAttentionType,
};
pub use error::{AsrError, AsrResult};
pub use traits::Recognizer;
pub use types::{AudioBuffer, Batch, DecodeMode, DecodeOptions, FeatureMatrix, IGNORE_ID};
