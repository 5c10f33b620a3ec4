//! Сборка батча: загрузка признаков, CMVN, сортировка и дополнение.

use asr_core::{AsrError, AsrResult, Batch, CollateConf, FeatureMatrix, IGNORE_ID};
use audio::{FbankExtractor, FbankOptions, GlobalCmvn};
use candle_core::{Device, Tensor};
use tracing::{debug, warn};

use crate::data_list::DataListEntry;

/// Превращает записи одного батча в [`Batch`] на CPU.
#[derive(Debug, Clone)]
pub struct CollateFunc {
    conf: CollateConf,
    cmvn: Option<GlobalCmvn>,
    raw_wav: bool,
}

impl CollateFunc {
    pub fn new(conf: CollateConf, cmvn: Option<GlobalCmvn>, raw_wav: bool) -> Self {
        if conf.spec_aug {
            warn!("spec_aug при распознавании не применяется, игнорируем");
        }
        if conf.speed_perturb {
            warn!("speed_perturb при распознавании не применяется, игнорируем");
        }
        Self {
            conf: conf.for_inference(),
            cmvn,
            raw_wav,
        }
    }

    /// Признаки одного высказывания без CMVN.
    pub fn load_features(&self, entry: &DataListEntry) -> AsrResult<FeatureMatrix> {
        if self.raw_wav {
            let (samples, sample_rate) = audio::load_wav_pcm16(&entry.feat)?;
            let options = FbankOptions::from_conf(
                &self.conf.feature_extraction_conf,
                self.conf.feature_dither,
                sample_rate,
            );
            FbankExtractor::new(options).compute(&samples)
        } else {
            audio::read_matrix_at(&entry.feat)
        }
    }

    /// Собрать батч; `None`, если ни одно высказывание не загрузилось.
    pub fn collate(&self, entries: &[DataListEntry]) -> AsrResult<Option<Batch>> {
        let mut loaded: Vec<(&DataListEntry, FeatureMatrix)> = Vec::with_capacity(entries.len());
        for entry in entries {
            match self.load_features(entry) {
                Ok(feats) if feats.num_frames == 0 => {
                    warn!("{}: пустые признаки, пропускаем", entry.key);
                }
                Ok(mut feats) => {
                    if let Some(cmvn) = &self.cmvn {
                        cmvn.apply(&mut feats)?;
                    }
                    loaded.push((entry, feats));
                }
                Err(e) => {
                    warn!("{}: не удалось загрузить признаки: {e}, пропускаем", entry.key);
                }
            }
        }
        if loaded.is_empty() {
            return Ok(None);
        }

        // Стабильная сортировка по убыванию длины.
        loaded.sort_by(|a, b| b.1.num_frames.cmp(&a.1.num_frames));

        let dim = loaded[0].1.dim;
        if let Some((entry, m)) = loaded.iter().find(|(_, m)| m.dim != dim) {
            return Err(AsrError::Data(format!(
                "{}: размерность признаков {} вместо {dim}",
                entry.key, m.dim
            )));
        }

        let batch_size = loaded.len();
        let max_frames = loaded[0].1.num_frames;
        let max_tokens = loaded
            .iter()
            .map(|(e, _)| e.token_ids.len())
            .max()
            .unwrap_or(0);

        let mut feats = vec![0.0_f32; batch_size * max_frames * dim];
        let mut targets = vec![IGNORE_ID; batch_size * max_tokens];
        let mut keys = Vec::with_capacity(batch_size);
        let mut feats_lengths = Vec::with_capacity(batch_size);
        let mut target_lengths = Vec::with_capacity(batch_size);

        for (i, (entry, m)) in loaded.iter().enumerate() {
            let start = i * max_frames * dim;
            feats[start..start + m.data.len()].copy_from_slice(&m.data);
            let start = i * max_tokens;
            targets[start..start + entry.token_ids.len()].copy_from_slice(&entry.token_ids);

            keys.push(entry.key.clone());
            feats_lengths.push(m.num_frames);
            target_lengths.push(entry.token_ids.len());
        }

        let feats = Tensor::from_vec(feats, (batch_size, max_frames, dim), &Device::Cpu)?;
        let targets = Tensor::from_vec(targets, (batch_size, max_tokens), &Device::Cpu)?;
        debug!(
            "Батч: {} высказываний, признаки {:?}, цели {:?}",
            batch_size,
            feats.dims(),
            targets.dims()
        );

        Ok(Some(Batch {
            keys,
            feats,
            targets,
            feats_lengths,
            target_lengths,
        }))
    }
}

/// Итератор готовых батчей поверх [`AudioDataset`](crate::AudioDataset).
///
/// Пустые батчи пропускаются; ошибки сборки отдаются вызывающему.
pub struct DataLoader<'a> {
    dataset: &'a crate::AudioDataset,
    collate: &'a CollateFunc,
    next: usize,
}

impl<'a> DataLoader<'a> {
    pub fn new(dataset: &'a crate::AudioDataset, collate: &'a CollateFunc) -> Self {
        Self {
            dataset,
            collate,
            next: 0,
        }
    }
}

impl Iterator for DataLoader<'_> {
    type Item = AsrResult<Batch>;

    fn next(&mut self) -> Option<Self::Item> {
        while let Some(entries) = self.dataset.get(self.next) {
            self.next += 1;
            match self.collate.collate(entries) {
                Ok(Some(batch)) => return Some(Ok(batch)),
                Ok(None) => warn!("Батч {} пуст после загрузки, пропускаем", self.next - 1),
                Err(e) => return Some(Err(e)),
            }
        }
        None
    }
}
