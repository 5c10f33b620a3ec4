//! Восстановление весов из чекпойнта.
//!
//! `*.safetensors` отображается в память, всё остальное читается как
//! PyTorch state dict (`.pt`). Рядом с чекпойнтом может лежать
//! `<stem>.yaml` с метаданными обучения (epoch, cv_loss, ...).

use std::path::{Path, PathBuf};
use std::time::Instant;

use candle_core::{DType, Device};
use candle_nn::VarBuilder;
use tracing::{debug, info, warn};

use asr_core::{AsrError, AsrResult, ExperimentConfig};

use crate::model::AsrModel;

/// Формат файла весов.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointFormat {
    Safetensors,
    PyTorch,
}

impl CheckpointFormat {
    pub fn detect(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("safetensors") => Self::Safetensors,
            _ => Self::PyTorch,
        }
    }
}

/// Путь к `<stem>.yaml` рядом с чекпойнтом.
pub fn info_path(checkpoint: &Path) -> PathBuf {
    checkpoint.with_extension("yaml")
}

/// Скалярные записи `<stem>.yaml`, если файл есть.
pub fn read_checkpoint_info(checkpoint: &Path) -> AsrResult<Option<Vec<(String, String)>>> {
    let path = info_path(checkpoint);
    if !path.is_file() {
        return Ok(None);
    }
    let text = std::fs::read_to_string(&path)?;
    let value: serde_yaml::Value = serde_yaml::from_str(&text)?;
    let Some(map) = value.as_mapping() else {
        warn!("{}: ожидался YAML-словарь, пропускаем", path.display());
        return Ok(None);
    };
    let entries = map
        .iter()
        .filter_map(|(k, v)| {
            let key = k.as_str()?.to_string();
            let value = match v {
                serde_yaml::Value::Bool(b) => b.to_string(),
                serde_yaml::Value::Number(n) => n.to_string(),
                serde_yaml::Value::String(s) => s.clone(),
                _ => return None,
            };
            Some((key, value))
        })
        .collect();
    Ok(Some(entries))
}

/// Собрать модель и загрузить в неё веса чекпойнта.
pub fn load_checkpoint(
    config: &ExperimentConfig,
    input_dim: usize,
    vocab_size: usize,
    checkpoint: impl AsRef<Path>,
    device: &Device,
) -> AsrResult<AsrModel> {
    let checkpoint = checkpoint.as_ref();
    if !checkpoint.is_file() {
        return Err(AsrError::Model(format!(
            "Чекпойнт не найден: {}",
            checkpoint.display()
        )));
    }

    let format = CheckpointFormat::detect(checkpoint);
    info!("Чекпойнт: загрузка {} ({:?})", checkpoint.display(), format);
    let start = Instant::now();

    let vb = match format {
        // SAFETY: файл не изменяется, пока VarBuilder жив.
        CheckpointFormat::Safetensors => unsafe {
            VarBuilder::from_mmaped_safetensors(&[checkpoint], DType::F32, device)?
        },
        CheckpointFormat::PyTorch => VarBuilder::from_pth(checkpoint, DType::F32, device)?,
    };
    let model = AsrModel::load(config, input_dim, vocab_size, vb)?;

    match read_checkpoint_info(checkpoint) {
        Ok(Some(entries)) => {
            for (key, value) in entries {
                info!("Чекпойнт: {key} = {value}");
            }
        }
        Ok(None) => debug!("Чекпойнт: {} не найден", info_path(checkpoint).display()),
        Err(e) => warn!("Чекпойнт: не удалось прочитать метаданные: {e}"),
    }

    info!("Чекпойнт загружен за {:.2}с", start.elapsed().as_secs_f64());
    Ok(model)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detect_format() {
        assert_eq!(
            CheckpointFormat::detect(Path::new("exp/final.safetensors")),
            CheckpointFormat::Safetensors
        );
        assert_eq!(
            CheckpointFormat::detect(Path::new("exp/avg_10.pt")),
            CheckpointFormat::PyTorch
        );
    }

    #[test]
    fn test_read_checkpoint_info() {
        let dir = tempfile::tempdir().unwrap();
        let ckpt = dir.path().join("29.pt");
        std::fs::write(
            dir.path().join("29.yaml"),
            "epoch: 29\ncv_loss: 4.51\nlr: 0.0004\nstep: 12000\nnested:\n  a: 1\n",
        )
        .unwrap();

        let entries = read_checkpoint_info(&ckpt).unwrap().unwrap();
        assert!(entries.contains(&("epoch".to_string(), "29".to_string())));
        assert!(entries.contains(&("cv_loss".to_string(), "4.51".to_string())));
        assert!(!entries.iter().any(|(k, _)| k == "nested"));

        let missing = dir.path().join("30.pt");
        assert!(read_checkpoint_info(&missing).unwrap().is_none());
    }

    #[test]
    fn test_missing_checkpoint_is_model_error() {
        let config = ExperimentConfig::from_yaml_str(
            "encoder_conf: {}\ndecoder_conf: {}\nmodel_conf: {}\ncollate_conf: {}\n",
        )
        .unwrap();
        let err = load_checkpoint(&config, 80, 10, "/nonexistent/final.pt", &Device::Cpu)
            .err()
            .unwrap();
        assert!(matches!(err, AsrError::Model(_)));
    }
}
