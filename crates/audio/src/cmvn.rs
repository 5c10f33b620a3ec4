//! Глобальная нормализация среднего и дисперсии (CMVN).
//!
//! Статистики читаются либо из JSON (`mean_stat`, `var_stat`, `frame_num`),
//! либо из матрицы Kaldi `2 × (D+1)`, где последний столбец первой строки
//! содержит число фреймов.

use std::path::Path;

use asr_core::{AsrError, AsrResult, FeatureMatrix};
use serde::Deserialize;
use tracing::debug;

use crate::kaldi;

/// Нижняя граница дисперсии.
const VAR_FLOOR: f64 = 1.0e-20;

#[derive(Debug, Deserialize)]
struct JsonStats {
    mean_stat: Vec<f64>,
    var_stat: Vec<f64>,
    frame_num: f64,
}

/// Глобальные `mean` и `istd` по измерениям признаков.
#[derive(Debug, Clone, PartialEq)]
pub struct GlobalCmvn {
    mean: Vec<f32>,
    istd: Vec<f32>,
}

impl GlobalCmvn {
    /// Загрузить статистики; формат определяется по содержимому:
    /// первый значащий байт `{` означает JSON, иначе матрица Kaldi.
    pub fn from_file(path: impl AsRef<Path>) -> AsrResult<Self> {
        let path = path.as_ref();
        let bytes = std::fs::read(path).map_err(|e| {
            AsrError::Config(format!("Не удалось прочитать CMVN {}: {e}", path.display()))
        })?;
        let is_json = bytes
            .iter()
            .find(|b| !b.is_ascii_whitespace())
            .is_some_and(|&b| b == b'{');

        let cmvn = if is_json {
            let text = std::str::from_utf8(&bytes).map_err(|e| {
                AsrError::Config(format!("CMVN {} не в UTF-8: {e}", path.display()))
            })?;
            Self::from_json_str(text)?
        } else {
            let stats = kaldi::read_matrix(&mut bytes.as_slice())?;
            Self::from_kaldi_stats(&stats)?
        };

        debug!("CMVN: загружено {} измерений из {}", cmvn.dim(), path.display());
        Ok(cmvn)
    }

    pub fn from_json_str(text: &str) -> AsrResult<Self> {
        let stats: JsonStats = serde_json::from_str(text)?;
        Self::from_stats(&stats.mean_stat, &stats.var_stat, stats.frame_num)
    }

    /// Статистики Kaldi: строка 0 = суммы + счётчик, строка 1 = суммы квадратов.
    pub fn from_kaldi_stats(stats: &FeatureMatrix) -> AsrResult<Self> {
        if stats.num_frames != 2 || stats.dim < 2 {
            return Err(AsrError::Config(format!(
                "Статистики CMVN должны иметь форму 2x(D+1), получено {}x{}",
                stats.num_frames, stats.dim
            )));
        }
        let dim = stats.dim - 1;
        let sums: Vec<f64> = stats.frame(0)[..dim].iter().map(|&v| v as f64).collect();
        let squares: Vec<f64> = stats.frame(1)[..dim].iter().map(|&v| v as f64).collect();
        let count = stats.frame(0)[dim] as f64;
        Self::from_stats(&sums, &squares, count)
    }

    fn from_stats(sums: &[f64], squares: &[f64], count: f64) -> AsrResult<Self> {
        if sums.len() != squares.len() {
            return Err(AsrError::Config(format!(
                "Длины mean_stat ({}) и var_stat ({}) различаются",
                sums.len(),
                squares.len()
            )));
        }
        if count < 1.0 {
            return Err(AsrError::Config(format!(
                "Некорректное число фреймов в статистиках CMVN: {count}"
            )));
        }

        let mut mean = Vec::with_capacity(sums.len());
        let mut istd = Vec::with_capacity(sums.len());
        for (&s, &sq) in sums.iter().zip(squares) {
            let m = s / count;
            let var = (sq / count - m * m).max(VAR_FLOOR);
            mean.push(m as f32);
            istd.push((1.0 / var.sqrt()) as f32);
        }
        Ok(Self { mean, istd })
    }

    pub fn dim(&self) -> usize {
        self.mean.len()
    }

    pub fn mean(&self) -> &[f32] {
        &self.mean
    }

    pub fn istd(&self) -> &[f32] {
        &self.istd
    }

    /// `(x - mean) * istd` для каждого фрейма.
    pub fn apply(&self, feats: &mut FeatureMatrix) -> AsrResult<()> {
        if feats.dim != self.dim() {
            return Err(AsrError::Data(format!(
                "Размерность признаков {} не совпадает с CMVN {}",
                feats.dim,
                self.dim()
            )));
        }
        if feats.num_frames == 0 {
            return Ok(());
        }
        for frame in feats.frames_mut() {
            for ((v, m), s) in frame.iter_mut().zip(&self.mean).zip(&self.istd) {
                *v = (*v - m) * s;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_json() {
        // mean = [1, 2], E[x²] = [2, 8] => var = [1, 4], istd = [1, 0.5]
        let json = r#"{"mean_stat": [10.0, 20.0], "var_stat": [20.0, 80.0], "frame_num": 10}"#;
        let cmvn = GlobalCmvn::from_json_str(json).unwrap();
        assert_eq!(cmvn.mean(), &[1.0, 2.0]);
        assert!((cmvn.istd()[0] - 1.0).abs() < 1e-6);
        assert!((cmvn.istd()[1] - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_from_kaldi_stats_matches_json() {
        let stats = FeatureMatrix::new(vec![10.0, 20.0, 10.0, 20.0, 80.0, 0.0], 2, 3).unwrap();
        let kaldi = GlobalCmvn::from_kaldi_stats(&stats).unwrap();
        let json = GlobalCmvn::from_json_str(
            r#"{"mean_stat": [10.0, 20.0], "var_stat": [20.0, 80.0], "frame_num": 10}"#,
        )
        .unwrap();
        assert_eq!(kaldi, json);
    }

    #[test]
    fn test_variance_floor() {
        let cmvn = GlobalCmvn::from_json_str(
            r#"{"mean_stat": [5.0], "var_stat": [25.0], "frame_num": 1}"#,
        )
        .unwrap();
        assert!(cmvn.istd()[0].is_finite());
        assert!(cmvn.istd()[0] > 1.0e9);
    }

    #[test]
    fn test_apply() {
        let cmvn = GlobalCmvn::from_json_str(
            r#"{"mean_stat": [10.0, 20.0], "var_stat": [20.0, 80.0], "frame_num": 10}"#,
        )
        .unwrap();
        let mut feats = FeatureMatrix::new(vec![1.0, 2.0, 3.0, 6.0], 2, 2).unwrap();
        cmvn.apply(&mut feats).unwrap();
        assert_eq!(feats.data, vec![0.0, 0.0, 2.0, 2.0]);

        let mut wrong = FeatureMatrix::new(vec![0.0; 3], 1, 3).unwrap();
        assert!(cmvn.apply(&mut wrong).is_err());
    }

    #[test]
    fn test_from_file_detects_format_by_content() {
        let dir = tempfile::tempdir().unwrap();
        // Рецепт обучения пишет JSON в файл без расширения.
        let json_path = dir.path().join("global_cmvn");
        std::fs::write(
            &json_path,
            "\n  {\"mean_stat\":[10.0,20.0],\"var_stat\":[20.0,80.0],\"frame_num\":10}",
        )
        .unwrap();
        let text_path = dir.path().join("cmvn.ark");
        std::fs::write(&text_path, " [\n 10 20 10\n 20 80 0 ]\n").unwrap();

        let a = GlobalCmvn::from_file(&json_path).unwrap();
        let b = GlobalCmvn::from_file(&text_path).unwrap();
        assert_eq!(a.mean(), &[1.0, 2.0]);
        assert_eq!(a, b);
    }

    #[test]
    fn test_from_file_binary_kaldi_stats() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("global_cmvn.stats");
        let mut bytes = b"\0BFM ".to_vec();
        for dim in [2i32, 3] {
            bytes.push(4);
            bytes.extend_from_slice(&dim.to_le_bytes());
        }
        for v in [10.0f32, 20.0, 10.0, 20.0, 80.0, 0.0] {
            bytes.extend_from_slice(&v.to_le_bytes());
        }
        std::fs::write(&path, bytes).unwrap();

        let cmvn = GlobalCmvn::from_file(&path).unwrap();
        assert_eq!(cmvn.mean(), &[1.0, 2.0]);
        assert!((cmvn.istd()[1] - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_bad_stats_shape() {
        let stats = FeatureMatrix::new(vec![1.0; 3], 1, 3).unwrap();
        assert!(GlobalCmvn::from_kaldi_stats(&stats).is_err());
    }
}
