//! Цикл батчевого распознавания.
//!
//! Словарь и рендер гипотез, запись результатов и сам цикл поверх
//! любого [`asr_core::Recognizer`].

mod output;
mod pipeline;
mod vocab;

pub use output::ResultWriter;
pub use pipeline::{InferencePipeline, InferenceStats};
pub use vocab::Vocabulary;
