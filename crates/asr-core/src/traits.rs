//! Трейт распознавателя: граница между циклом инференса и моделью.
//!
//! Цикл в `asr-pipeline` знает только о [`Recognizer`], поэтому его можно
//! проверять на подставной модели без весов.

use candle_core::Tensor;

use crate::error::AsrResult;
use crate::types::DecodeOptions;

/// Батчевый распознаватель.
///
/// # Пример
/// ```ignore
/// let hyps = model.recognize(&batch.feats, &batch.feats_lengths, &DecodeOptions::default())?;
/// assert_eq!(hyps.len(), batch.len());
/// ```
pub trait Recognizer {
    /// Распознать батч.
    ///
    /// # Аргументы
    /// * `feats`: (batch, max_frames, dim), дополненные нулями.
    /// * `feats_lengths`: реальное число фреймов каждого высказывания.
    /// * `options`: алгоритм поиска, ширина луча, штраф за длину.
    ///
    /// # Возвращает
    /// По одной гипотезе (последовательности id токенов) на высказывание,
    /// в порядке строк `feats`. Гипотеза может заканчиваться токеном EOS.
    fn recognize(
        &self,
        feats: &Tensor,
        feats_lengths: &[usize],
        options: &DecodeOptions,
    ) -> AsrResult<Vec<Vec<u32>>>;
}
