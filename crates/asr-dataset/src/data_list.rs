//! Парсинг списка данных.
//!
//! Одна строка на высказывание, семь полей через табуляцию, каждое в виде
//! `name:value`:
//!
//! ```text
//! utt:BAC009S0764W0121  feat:/data/wav/BAC009S0764W0121.wav  feat_shape:4.2  text:...  token:...  tokenid:12 7 301  token_shape:3,4233
//! ```
//!
//! В режиме признаков `feat` это `path.ark:offset`, а `feat_shape` равен `T,D`.

use std::path::Path;

use asr_core::{AsrError, AsrResult};
use tracing::{debug, warn};

/// Число полей в строке списка.
pub const NUM_FIELDS: usize = 7;

/// Шаг фрейма (мс), которым длительность переводится в число фреймов.
const FRAME_SHIFT_MS: f64 = 10.0;

/// Одна запись списка данных.
#[derive(Debug, Clone, PartialEq)]
pub struct DataListEntry {
    pub key: String,
    /// Путь к WAV или адрес матрицы `path.ark:offset`.
    pub feat: String,
    /// Длина в фреймах (из `feat_shape`).
    pub num_frames: usize,
    /// Размерность признаков; только в режиме признаков.
    pub feat_dim: Option<usize>,
    pub token_ids: Vec<i64>,
    /// Размер словаря из `token_shape`.
    pub output_dim: usize,
}

/// Разобранный список данных.
#[derive(Debug, Clone, Default)]
pub struct DataList {
    pub entries: Vec<DataListEntry>,
    /// Размерность признаков последней записи (режим признаков).
    pub input_dim: Option<usize>,
    /// Размер выхода последней записи.
    pub output_dim: Option<usize>,
    /// Сколько строк пропущено из-за неверного числа полей.
    pub skipped: usize,
}

impl DataList {
    pub fn from_file(path: impl AsRef<Path>, raw_wav: bool) -> AsrResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            AsrError::Data(format!(
                "Не удалось прочитать список данных {}: {e}",
                path.display()
            ))
        })?;
        let list = Self::parse(&text, raw_wav)?;
        debug!(
            "Список данных {}: {} записей, пропущено {}",
            path.display(),
            list.entries.len(),
            list.skipped
        );
        Ok(list)
    }

    pub fn parse(text: &str, raw_wav: bool) -> AsrResult<Self> {
        let mut list = Self::default();
        for (idx, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let fields: Vec<&str> = line.split('\t').collect();
            if fields.len() != NUM_FIELDS {
                warn!(
                    "Строка {}: ожидалось {NUM_FIELDS} полей, получено {}, пропускаем",
                    idx + 1,
                    fields.len()
                );
                list.skipped += 1;
                continue;
            }
            let entry = parse_fields(&fields, raw_wav)
                .map_err(|e| AsrError::Data(format!("Строка {}: {e}", idx + 1)))?;
            if entry.feat_dim.is_some() {
                list.input_dim = entry.feat_dim;
            }
            list.output_dim = Some(entry.output_dim);
            list.entries.push(entry);
        }
        Ok(list)
    }
}

/// Значение поля `name:value`; делится по первому `:`.
fn field_value<'a>(field: &'a str, name: &str) -> Result<&'a str, String> {
    match field.split_once(':') {
        Some((n, v)) if n == name => Ok(v.trim()),
        Some((n, _)) => Err(format!("ожидалось поле {name:?}, получено {n:?}")),
        None => Err(format!("поле {name:?} без ':'")),
    }
}

/// Пара `a,b` из полей формы.
fn parse_shape(value: &str, name: &str) -> Result<(usize, usize), String> {
    let (a, b) = value
        .split_once(',')
        .ok_or_else(|| format!("{name}: ожидалось 'a,b', получено {value:?}"))?;
    let a = a
        .trim()
        .parse()
        .map_err(|e| format!("{name}: {a:?}: {e}"))?;
    let b = b
        .trim()
        .parse()
        .map_err(|e| format!("{name}: {b:?}: {e}"))?;
    Ok((a, b))
}

fn parse_fields(fields: &[&str], raw_wav: bool) -> Result<DataListEntry, String> {
    let key = field_value(fields[0], "utt")?.to_string();
    let feat = field_value(fields[1], "feat")?.to_string();
    let feat_shape = field_value(fields[2], "feat_shape")?;
    let tokenid = field_value(fields[5], "tokenid")?;
    let (_, output_dim) = parse_shape(field_value(fields[6], "token_shape")?, "token_shape")?;

    let (num_frames, feat_dim) = if raw_wav {
        let duration: f64 = feat_shape
            .parse()
            .map_err(|e| format!("feat_shape {feat_shape:?}: {e}"))?;
        if !duration.is_finite() || duration < 0.0 {
            return Err(format!("некорректная длительность {duration}"));
        }
        ((duration * 1000.0 / FRAME_SHIFT_MS) as usize, None)
    } else {
        let (frames, dim) = parse_shape(feat_shape, "feat_shape")?;
        (frames, Some(dim))
    };

    let token_ids = tokenid
        .split_whitespace()
        .map(|t| t.parse::<i64>().map_err(|e| format!("tokenid {t:?}: {e}")))
        .collect::<Result<Vec<_>, _>>()?;

    Ok(DataListEntry {
        key,
        feat,
        num_frames,
        feat_dim,
        token_ids,
        output_dim,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const RAW_LINE: &str = "utt:utt1\tfeat:/data/utt1.wav\tfeat_shape:1.5\ttext:你好\ttoken:你 好\ttokenid:4 5\ttoken_shape:2,10";
    const ARK_LINE: &str = "utt:utt2\tfeat:/data/raw_fbank.ark:17\tfeat_shape:120,80\ttext:hi\ttoken:h i\ttokenid:7 8 9\ttoken_shape:3,10";

    #[test]
    fn test_parse_raw_line() {
        let list = DataList::parse(RAW_LINE, true).unwrap();
        let e = &list.entries[0];
        assert_eq!(e.key, "utt1");
        assert_eq!(e.feat, "/data/utt1.wav");
        assert_eq!(e.num_frames, 150);
        assert_eq!(e.feat_dim, None);
        assert_eq!(e.token_ids, vec![4, 5]);
        assert_eq!(list.output_dim, Some(10));
        assert_eq!(list.input_dim, None);
    }

    #[test]
    fn test_parse_ark_line_keeps_offset() {
        let list = DataList::parse(ARK_LINE, false).unwrap();
        let e = &list.entries[0];
        assert_eq!(e.feat, "/data/raw_fbank.ark:17");
        assert_eq!(e.num_frames, 120);
        assert_eq!(list.input_dim, Some(80));
    }

    #[test]
    fn test_wrong_field_count_is_skipped() {
        let text = format!("{RAW_LINE}\nutt:bad\tfeat:x\n\n{RAW_LINE}\n");
        let list = DataList::parse(&text, true).unwrap();
        assert_eq!(list.entries.len(), 2);
        assert_eq!(list.skipped, 1);
    }

    #[test]
    fn test_malformed_value_is_error() {
        let line = RAW_LINE.replace("feat_shape:1.5", "feat_shape:abc");
        let err = DataList::parse(&line, true).unwrap_err();
        assert!(err.to_string().contains("Строка 1"));
    }

    #[test]
    fn test_empty_tokenid() {
        let line = RAW_LINE.replace("tokenid:4 5", "tokenid:");
        let list = DataList::parse(&line, true).unwrap();
        assert!(list.entries[0].token_ids.is_empty());
    }
}
