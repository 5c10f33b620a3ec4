//! Фильтрация по длине, сортировка и разбиение на батчи.

use std::path::Path;

use asr_core::{AsrError, AsrResult, BatchType, DatasetConf};
use tracing::{debug, info};

use crate::data_list::{DataList, DataListEntry};

/// Набор высказываний, заранее разбитый на батчи.
#[derive(Debug, Clone)]
pub struct AudioDataset {
    batches: Vec<Vec<DataListEntry>>,
    input_dim: usize,
    output_dim: Option<usize>,
}

impl AudioDataset {
    /// Загрузить список данных и разбить его на батчи.
    ///
    /// `mel_bins` задаёт `input_dim` для сырых WAV.
    pub fn new(data_file: impl AsRef<Path>, conf: &DatasetConf, mel_bins: usize) -> AsrResult<Self> {
        let list = DataList::from_file(data_file, conf.raw_wav)?;
        Self::from_data_list(list, conf, mel_bins)
    }

    pub fn from_data_list(list: DataList, conf: &DatasetConf, mel_bins: usize) -> AsrResult<Self> {
        let total = list.entries.len();
        let mut entries: Vec<DataListEntry> = list
            .entries
            .into_iter()
            .filter(|e| e.num_frames >= conf.min_length && e.num_frames <= conf.max_length)
            .collect();
        if entries.len() < total {
            debug!(
                "Отфильтровано по длине: {} из {} (min={}, max={})",
                total - entries.len(),
                total,
                conf.min_length,
                conf.max_length
            );
        }

        if conf.sort {
            entries.sort_by_key(|e| e.num_frames);
        }

        let batches = match conf.batch_type {
            BatchType::Static => static_batches(entries, conf.batch_size)?,
            BatchType::Dynamic => dynamic_batches(entries, conf.max_frames_in_batch)?,
        };

        let input_dim = if conf.raw_wav {
            mel_bins
        } else {
            list.input_dim.unwrap_or(mel_bins)
        };

        let dataset = Self {
            batches,
            input_dim,
            output_dim: list.output_dim,
        };
        info!(
            "Датасет: {} высказываний в {} батчах ({:?})",
            dataset.num_utterances(),
            dataset.len(),
            conf.batch_type
        );
        Ok(dataset)
    }

    /// Количество батчей.
    pub fn len(&self) -> usize {
        self.batches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.batches.is_empty()
    }

    pub fn get(&self, idx: usize) -> Option<&[DataListEntry]> {
        self.batches.get(idx).map(Vec::as_slice)
    }

    pub fn batches(&self) -> impl Iterator<Item = &[DataListEntry]> {
        self.batches.iter().map(Vec::as_slice)
    }

    pub fn num_utterances(&self) -> usize {
        self.batches.iter().map(Vec::len).sum()
    }

    pub fn input_dim(&self) -> usize {
        self.input_dim
    }

    /// Размер выхода из `token_shape`; `None` для пустого списка.
    pub fn output_dim(&self) -> Option<usize> {
        self.output_dim
    }
}

fn static_batches(
    entries: Vec<DataListEntry>,
    batch_size: usize,
) -> AsrResult<Vec<Vec<DataListEntry>>> {
    if batch_size == 0 {
        return Err(AsrError::Config("batch_size должен быть > 0".to_string()));
    }
    Ok(entries.chunks(batch_size).map(<[_]>::to_vec).collect())
}

/// Копит фреймы и открывает новый батч, когда сумма превышает порог.
///
/// Высказывание длиннее порога попадает в отдельный батч.
fn dynamic_batches(
    entries: Vec<DataListEntry>,
    max_frames_in_batch: usize,
) -> AsrResult<Vec<Vec<DataListEntry>>> {
    if max_frames_in_batch == 0 {
        return Err(AsrError::Config(
            "max_frames_in_batch должен быть > 0 для dynamic".to_string(),
        ));
    }
    let mut batches: Vec<Vec<DataListEntry>> = Vec::new();
    let mut current: Vec<DataListEntry> = Vec::new();
    let mut frames = 0usize;
    for entry in entries {
        frames += entry.num_frames;
        if frames > max_frames_in_batch && !current.is_empty() {
            batches.push(std::mem::take(&mut current));
            frames = entry.num_frames;
        }
        current.push(entry);
    }
    if !current.is_empty() {
        batches.push(current);
    }
    Ok(batches)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(key: &str, frames: usize) -> DataListEntry {
        DataListEntry {
            key: key.to_string(),
            feat: format!("{key}.wav"),
            num_frames: frames,
            feat_dim: None,
            token_ids: vec![1],
            output_dim: 10,
        }
    }

    fn list(frames: &[usize]) -> DataList {
        DataList {
            entries: frames
                .iter()
                .enumerate()
                .map(|(i, &f)| entry(&format!("u{i}"), f))
                .collect(),
            input_dim: None,
            output_dim: Some(10),
            skipped: 0,
        }
    }

    fn keys(ds: &AudioDataset) -> Vec<Vec<String>> {
        ds.batches()
            .map(|b| b.iter().map(|e| e.key.clone()).collect())
            .collect()
    }

    #[test]
    fn test_static_batches_keep_order() {
        let conf = DatasetConf {
            batch_size: 2,
            sort: false,
            ..DatasetConf::default()
        };
        let ds = AudioDataset::from_data_list(list(&[30, 10, 20, 40, 50]), &conf, 80).unwrap();
        assert_eq!(
            keys(&ds),
            vec![vec!["u0", "u1"], vec!["u2", "u3"], vec!["u4"]]
        );
        assert_eq!(ds.num_utterances(), 5);
        assert_eq!(ds.input_dim(), 80);
        assert_eq!(ds.output_dim(), Some(10));
    }

    #[test]
    fn test_length_filter_and_sort() {
        let conf = DatasetConf {
            batch_size: 10,
            min_length: 15,
            max_length: 45,
            sort: true,
            ..DatasetConf::default()
        };
        let ds = AudioDataset::from_data_list(list(&[30, 10, 20, 40, 50]), &conf, 80).unwrap();
        assert_eq!(keys(&ds), vec![vec!["u2", "u0", "u3"]]);
    }

    #[test]
    fn test_dynamic_batches() {
        let conf = DatasetConf {
            batch_type: BatchType::Dynamic,
            max_frames_in_batch: 50,
            sort: false,
            ..DatasetConf::default()
        };
        let ds =
            AudioDataset::from_data_list(list(&[20, 20, 20, 70, 10]), &conf, 80).unwrap();
        assert_eq!(
            keys(&ds),
            vec![vec!["u0", "u1"], vec!["u2"], vec!["u3"], vec!["u4"]]
        );
    }

    #[test]
    fn test_zero_batch_size_is_error() {
        let conf = DatasetConf {
            batch_size: 0,
            ..DatasetConf::default()
        };
        assert!(AudioDataset::from_data_list(list(&[1]), &conf, 80).is_err());
    }

    #[test]
    fn test_feature_mode_input_dim() {
        let mut l = list(&[5]);
        l.input_dim = Some(40);
        let conf = DatasetConf {
            raw_wav: false,
            ..DatasetConf::default()
        };
        let ds = AudioDataset::from_data_list(l, &conf, 80).unwrap();
        assert_eq!(ds.input_dim(), 40);
    }
}
