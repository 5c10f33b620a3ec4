//! Цикл инференса: батч → устройство → recognize → текст → файл.

use std::io::Write;
use std::time::Instant;

use asr_core::{AsrError, AsrResult, Batch, DecodeOptions, Recognizer};
use candle_core::Device;
use tracing::{debug, info};

use crate::output::ResultWriter;
use crate::vocab::Vocabulary;

/// Итоги прогона.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InferenceStats {
    pub batches: usize,
    pub utterances: usize,
}

/// Распознаватель + словарь + устройство.
pub struct InferencePipeline<'a, R: Recognizer> {
    recognizer: &'a R,
    vocab: &'a Vocabulary,
    device: Device,
    options: DecodeOptions,
}

impl<'a, R: Recognizer> InferencePipeline<'a, R> {
    pub fn new(
        recognizer: &'a R,
        vocab: &'a Vocabulary,
        device: Device,
        options: DecodeOptions,
    ) -> Self {
        Self {
            recognizer,
            vocab,
            device,
            options,
        }
    }

    /// Распознать один батч: пары (ключ, текст) в порядке строк батча.
    pub fn decode_batch(&self, batch: Batch) -> AsrResult<Vec<(String, String)>> {
        let batch = batch.to_device(&self.device)?;
        let hyps = self
            .recognizer
            .recognize(&batch.feats, &batch.feats_lengths, &self.options)?;
        if hyps.len() != batch.keys.len() {
            return Err(AsrError::Inference(format!(
                "Получено {} гипотез на {} высказываний",
                hyps.len(),
                batch.keys.len()
            )));
        }
        batch
            .keys
            .into_iter()
            .zip(hyps)
            .map(|(key, hyp)| Ok((key, self.vocab.render(&hyp)?)))
            .collect()
    }

    /// Прогнать все батчи и записать результаты.
    ///
    /// Первая ошибка прерывает прогон; уже записанные строки сбрасываются
    /// вызывающим через [`ResultWriter::finish`].
    pub fn run<I, W>(&self, batches: I, writer: &mut ResultWriter<W>) -> AsrResult<InferenceStats>
    where
        I: IntoIterator<Item = AsrResult<Batch>>,
        W: Write,
    {
        let start = Instant::now();
        let mut stats = InferenceStats::default();

        for batch in batches {
            let batch = batch?;
            debug!("Батч {}: {} высказываний", stats.batches, batch.len());
            for (key, text) in self.decode_batch(batch)? {
                info!("{key} {text}");
                writer.write(&key, &text)?;
                stats.utterances += 1;
            }
            stats.batches += 1;
        }

        info!(
            "Распознано {} высказываний в {} батчах за {:.2}с",
            stats.utterances,
            stats.batches,
            start.elapsed().as_secs_f64()
        );
        Ok(stats)
    }
}
