//! Общие типы для ASR-операций.
//!
//! Буферы аудио, матрицы признаков, батчи и опции декодирования,
//! используемые всеми крейтами workspace.

use candle_core::{Device, Tensor};
use serde::{Deserialize, Serialize};

use crate::{AsrError, AsrResult};

/// Значение, которым дополняются целевые последовательности в батче.
pub const IGNORE_ID: i64 = -1;

// ---------------------------------------------------------------------------
// Аудио-буфер
// ---------------------------------------------------------------------------

/// Буфер необработанного аудио.
#[derive(Debug, Clone)]
pub struct AudioBuffer {
    /// Аудио-сэмплы (нормализованы к [-1.0, 1.0], каналы чередуются).
    pub samples: Vec<f32>,

    /// Частота дискретизации в Гц.
    pub sample_rate: usize,

    /// Количество каналов.
    pub channels: usize,
}

impl AudioBuffer {
    /// Создать новый буфер аудио.
    pub fn new(samples: Vec<f32>, sample_rate: usize, channels: usize) -> Self {
        Self {
            samples,
            sample_rate,
            channels,
        }
    }

    /// Длительность в секундах.
    pub fn duration(&self) -> f32 {
        self.samples.len() as f32 / (self.sample_rate * self.channels) as f32
    }

    /// Количество сэмплов на канал.
    pub fn num_samples(&self) -> usize {
        self.samples.len() / self.channels
    }
}

// ---------------------------------------------------------------------------
// Матрица признаков
// ---------------------------------------------------------------------------

/// Матрица признаков одного высказывания: `num_frames × dim`, row-major.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureMatrix {
    pub data: Vec<f32>,
    pub num_frames: usize,
    pub dim: usize,
}

impl FeatureMatrix {
    pub fn new(data: Vec<f32>, num_frames: usize, dim: usize) -> AsrResult<Self> {
        if data.len() != num_frames * dim {
            return Err(AsrError::Data(format!(
                "Размер данных {} не совпадает с формой {}x{}",
                data.len(),
                num_frames,
                dim
            )));
        }
        Ok(Self {
            data,
            num_frames,
            dim,
        })
    }

    /// Строка (фрейм) матрицы.
    pub fn frame(&self, idx: usize) -> &[f32] {
        &self.data[idx * self.dim..(idx + 1) * self.dim]
    }

    pub fn frames(&self) -> std::slice::ChunksExact<'_, f32> {
        self.data.chunks_exact(self.dim.max(1))
    }

    pub fn frames_mut(&mut self) -> std::slice::ChunksExactMut<'_, f32> {
        self.data.chunks_exact_mut(self.dim.max(1))
    }
}

// ---------------------------------------------------------------------------
// Батч
// ---------------------------------------------------------------------------

/// Батч высказываний, готовый к прямому проходу модели.
#[derive(Debug, Clone)]
pub struct Batch {
    /// Идентификаторы высказываний в порядке строк тензоров.
    pub keys: Vec<String>,

    /// Признаки, дополненные нулями: (batch, max_frames, dim), f32.
    pub feats: Tensor,

    /// Целевые id, дополненные [`IGNORE_ID`]: (batch, max_tokens), i64.
    pub targets: Tensor,

    /// Реальное число фреймов каждого высказывания.
    pub feats_lengths: Vec<usize>,

    /// Реальное число целевых токенов каждого высказывания.
    pub target_lengths: Vec<usize>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Перенести тензоры батча на устройство.
    pub fn to_device(self, device: &Device) -> AsrResult<Self> {
        Ok(Self {
            feats: self.feats.to_device(device)?,
            targets: self.targets.to_device(device)?,
            ..self
        })
    }
}

// ---------------------------------------------------------------------------
// Опции декодирования
// ---------------------------------------------------------------------------

/// Алгоритм поиска гипотез.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecodeMode {
    /// Beam search по attention-декодеру.
    #[default]
    Attention,
    /// Жадный CTC: argmax по фреймам, схлопывание повторов, удаление blank.
    CtcGreedySearch,
}

/// Опции декодирования: передаются в [`Recognizer::recognize`](crate::traits::Recognizer::recognize).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecodeOptions {
    pub mode: DecodeMode,

    /// Ширина луча.
    pub beam_size: usize,

    /// Штраф за длину: к итоговому счёту гипотезы добавляется `penalty * len`.
    pub penalty: f32,
}

impl Default for DecodeOptions {
    fn default() -> Self {
        Self {
            mode: DecodeMode::Attention,
            beam_size: 10,
            penalty: 0.0,
        }
    }
}

impl DecodeOptions {
    pub fn with_mode(mut self, mode: DecodeMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_beam_size(mut self, beam_size: usize) -> Self {
        self.beam_size = beam_size;
        self
    }

    pub fn with_penalty(mut self, penalty: f32) -> Self {
        self.penalty = penalty;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_feature_matrix_shape_check() {
        assert!(FeatureMatrix::new(vec![0.0; 6], 2, 3).is_ok());
        assert!(FeatureMatrix::new(vec![0.0; 5], 2, 3).is_err());
    }

    #[test]
    fn test_feature_matrix_frames() {
        let m = FeatureMatrix::new(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0], 3, 2).unwrap();
        assert_eq!(m.frame(1), &[3.0, 4.0]);
        assert_eq!(m.frames().count(), 3);
    }

    #[test]
    fn test_decode_options_builder() {
        let opts = DecodeOptions::default()
            .with_beam_size(4)
            .with_penalty(0.5)
            .with_mode(DecodeMode::CtcGreedySearch);
        assert_eq!(opts.beam_size, 4);
        assert_eq!(opts.penalty, 0.5);
        assert_eq!(opts.mode, DecodeMode::CtcGreedySearch);
    }
}
