//! Чтение матриц Kaldi из ark-файлов.
//!
//! Поддерживаются бинарные `FM` / `DM` (float/double), сжатые `CM`
//! (байт на значение + заголовки колонок), `CM2` (uint16) и `CM3` (uint8),
//! а также текстовый формат `[ a b c \n d e f ]`.
//!
//! Адрес вида `feats.ark:1234` указывает на байтовое смещение сразу после
//! ключа высказывания.

use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use asr_core::{AsrError, AsrResult, FeatureMatrix};

/// Разобрать `path[:offset]` на путь и смещение.
///
/// Суффикс считается смещением, только если он состоит из цифр.
pub fn parse_ark_spec(spec: &str) -> (PathBuf, u64) {
    if let Some((path, offset)) = spec.rsplit_once(':') {
        if !offset.is_empty() && offset.bytes().all(|b| b.is_ascii_digit()) {
            if let Ok(offset) = offset.parse::<u64>() {
                return (PathBuf::from(path), offset);
            }
        }
    }
    (PathBuf::from(spec), 0)
}

/// Прочитать матрицу по адресу `path[:offset]`.
pub fn read_matrix_at(spec: &str) -> AsrResult<FeatureMatrix> {
    let (path, offset) = parse_ark_spec(spec);
    read_matrix_file(&path, offset)
}

/// Прочитать матрицу из файла начиная с `offset`.
pub fn read_matrix_file(path: &Path, offset: u64) -> AsrResult<FeatureMatrix> {
    let file = File::open(path).map_err(|e| {
        AsrError::Data(format!("Не удалось открыть {}: {e}", path.display()))
    })?;
    let mut reader = BufReader::new(file);
    reader.seek(SeekFrom::Start(offset))?;
    read_matrix(&mut reader)
}

/// Прочитать одну матрицу (бинарную или текстовую) из потока.
pub fn read_matrix<R: Read>(reader: &mut R) -> AsrResult<FeatureMatrix> {
    let mut marker = [0u8; 2];
    reader.read_exact(&mut marker)?;
    if marker != *b"\0B" {
        let text = read_text_block(reader, &marker)?;
        return parse_text_matrix(&text);
    }

    let token = read_token(reader)?;
    match token.as_str() {
        "FM" => read_plain(reader, 4),
        "DM" => read_plain(reader, 8),
        "CM" => read_compressed(reader, CompressionMethod::OneByteWithColHeaders),
        "CM2" => read_compressed(reader, CompressionMethod::TwoByte),
        "CM3" => read_compressed(reader, CompressionMethod::OneByte),
        other => Err(AsrError::Data(format!(
            "Неподдерживаемый тип матрицы Kaldi: {other:?}"
        ))),
    }
}

/// Разобрать текстовую матрицу: строки между `[` и `]`.
pub fn parse_text_matrix(text: &str) -> AsrResult<FeatureMatrix> {
    let open = text
        .find('[')
        .ok_or_else(|| AsrError::Data("Текстовая матрица без '['".to_string()))?;
    let close = text[open..]
        .find(']')
        .map(|c| open + c)
        .ok_or_else(|| AsrError::Data("Текстовая матрица без ']'".to_string()))?;

    let mut data = Vec::new();
    let mut rows = 0usize;
    let mut cols: Option<usize> = None;

    for line in text[open + 1..close].lines() {
        let row: Vec<f32> = line
            .split_whitespace()
            .map(|v| {
                v.parse::<f32>()
                    .map_err(|e| AsrError::Data(format!("Некорректное число {v:?}: {e}")))
            })
            .collect::<AsrResult<_>>()?;
        if row.is_empty() {
            continue;
        }
        match cols {
            None => cols = Some(row.len()),
            Some(c) if c != row.len() => {
                return Err(AsrError::Data(format!(
                    "Строка {} имеет {} колонок, ожидалось {c}",
                    rows,
                    row.len()
                )));
            }
            _ => {}
        }
        data.extend(row);
        rows += 1;
    }

    FeatureMatrix::new(data, rows, cols.unwrap_or(0))
}

/// Прочитать текст матрицы до первой `]` после `[` включительно.
///
/// Поток дальше не читается: за матрицей в ark могут идти другие
/// высказывания, в том числе бинарные.
fn read_text_block<R: Read>(reader: &mut R, prefix: &[u8]) -> AsrResult<String> {
    let mut raw = Vec::with_capacity(256);
    let mut opened = false;
    let mut push = |b: u8, raw: &mut Vec<u8>| -> bool {
        raw.push(b);
        if b == b'[' {
            opened = true;
        }
        opened && b == b']'
    };

    for &b in prefix {
        if push(b, &mut raw) {
            return into_text(raw);
        }
    }
    let mut byte = [0u8; 1];
    loop {
        if reader.read(&mut byte)? == 0 {
            return Err(AsrError::Data(
                "Текстовая матрица оборвалась до ']'".to_string(),
            ));
        }
        if push(byte[0], &mut raw) {
            return into_text(raw);
        }
    }
}

fn into_text(raw: Vec<u8>) -> AsrResult<String> {
    String::from_utf8(raw)
        .map_err(|e| AsrError::Data(format!("Текстовая матрица не в UTF-8: {e}")))
}

// -----------------------------------------------------------------------
// Бинарные примитивы
// -----------------------------------------------------------------------

fn read_token<R: Read>(reader: &mut R) -> AsrResult<String> {
    let mut token = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        reader.read_exact(&mut byte)?;
        if byte[0] == b' ' {
            break;
        }
        token.push(byte[0]);
        if token.len() > 16 {
            return Err(AsrError::Data("Слишком длинный токен Kaldi".to_string()));
        }
    }
    Ok(String::from_utf8_lossy(&token).into_owned())
}

/// Целое с префиксом размера (`\x04` + 4 байта LE).
fn read_basic_i32<R: Read>(reader: &mut R) -> AsrResult<i32> {
    let mut size = [0u8; 1];
    reader.read_exact(&mut size)?;
    if size[0] != 4 {
        return Err(AsrError::Data(format!(
            "Ожидался int32 (размер 4), получен размер {}",
            size[0]
        )));
    }
    read_i32(reader)
}

fn read_i32<R: Read>(reader: &mut R) -> AsrResult<i32> {
    let mut buf = [0u8; 4];
    reader.read_exact(&mut buf)?;
    Ok(i32::from_le_bytes(buf))
}

fn read_f32<R: Read>(reader: &mut R) -> AsrResult<f32> {
    let mut buf = [0u8; 4];
    reader.read_exact(&mut buf)?;
    Ok(f32::from_le_bytes(buf))
}

fn dims(rows: i32, cols: i32) -> AsrResult<(usize, usize)> {
    if rows < 0 || cols < 0 {
        return Err(AsrError::Data(format!(
            "Отрицательная размерность матрицы: {rows}x{cols}"
        )));
    }
    Ok((rows as usize, cols as usize))
}

fn read_plain<R: Read>(reader: &mut R, elem_size: usize) -> AsrResult<FeatureMatrix> {
    let rows = read_basic_i32(reader)?;
    let cols = read_basic_i32(reader)?;
    let (rows, cols) = dims(rows, cols)?;

    let mut bytes = vec![0u8; rows * cols * elem_size];
    reader.read_exact(&mut bytes)?;

    let data: Vec<f32> = if elem_size == 4 {
        bytes
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect()
    } else {
        bytes
            .chunks_exact(8)
            .map(|c| {
                f64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]) as f32
            })
            .collect()
    };
    FeatureMatrix::new(data, rows, cols)
}

// -----------------------------------------------------------------------
// Сжатые матрицы
// -----------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CompressionMethod {
    OneByteWithColHeaders,
    TwoByte,
    OneByte,
}

struct GlobalHeader {
    min_value: f32,
    range: f32,
}

impl GlobalHeader {
    fn uint16_to_float(&self, value: u16) -> f32 {
        self.min_value + self.range * 1.525_902_2e-5 * value as f32
    }
}

fn char_to_float(p0: f32, p25: f32, p75: f32, p100: f32, value: u8) -> f32 {
    let v = value as f32;
    if value <= 64 {
        p0 + (p25 - p0) * v * (1.0 / 64.0)
    } else if value <= 192 {
        p25 + (p75 - p25) * (v - 64.0) * (1.0 / 128.0)
    } else {
        p75 + (p100 - p75) * (v - 192.0) * (1.0 / 63.0)
    }
}

fn read_compressed<R: Read>(
    reader: &mut R,
    method: CompressionMethod,
) -> AsrResult<FeatureMatrix> {
    let header = GlobalHeader {
        min_value: read_f32(reader)?,
        range: read_f32(reader)?,
    };
    let rows = read_i32(reader)?;
    let cols = read_i32(reader)?;
    let (rows, cols) = dims(rows, cols)?;

    let mut data = vec![0.0_f32; rows * cols];
    match method {
        CompressionMethod::OneByteWithColHeaders => {
            let mut col_headers = vec![0u8; cols * 8];
            reader.read_exact(&mut col_headers)?;
            let mut bytes = vec![0u8; rows * cols];
            reader.read_exact(&mut bytes)?;

            // Данные хранятся по колонкам.
            for (col, h) in col_headers.chunks_exact(8).enumerate() {
                let p = |i: usize| header.uint16_to_float(u16::from_le_bytes([h[2 * i], h[2 * i + 1]]));
                let (p0, p25, p75, p100) = (p(0), p(1), p(2), p(3));
                for row in 0..rows {
                    data[row * cols + col] =
                        char_to_float(p0, p25, p75, p100, bytes[col * rows + row]);
                }
            }
        }
        CompressionMethod::TwoByte => {
            let mut bytes = vec![0u8; rows * cols * 2];
            reader.read_exact(&mut bytes)?;
            let increment = header.range / 65535.0;
            for (dst, c) in data.iter_mut().zip(bytes.chunks_exact(2)) {
                *dst = header.min_value + u16::from_le_bytes([c[0], c[1]]) as f32 * increment;
            }
        }
        CompressionMethod::OneByte => {
            let mut bytes = vec![0u8; rows * cols];
            reader.read_exact(&mut bytes)?;
            let increment = header.range / 255.0;
            for (dst, &b) in data.iter_mut().zip(bytes.iter()) {
                *dst = header.min_value + b as f32 * increment;
            }
        }
    }

    FeatureMatrix::new(data, rows, cols)
}
