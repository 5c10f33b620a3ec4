//! Словарь модели: `<unit> <id>` на строку.
//!
//! Id плотные (`0..N-1`); последний id служит и `sos`, и `eos`.
//! Текст гипотезы собирается конкатенацией единиц без разделителя.

use std::collections::HashMap;
use std::path::Path;

use asr_core::{AsrError, AsrResult};
use tracing::debug;

#[derive(Debug, Clone)]
pub struct Vocabulary {
    id_to_unit: Vec<String>,
    unit_to_id: HashMap<String, u32>,
}

impl Vocabulary {
    pub fn from_file(path: impl AsRef<Path>) -> AsrResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            AsrError::Vocab(format!("Не удалось прочитать словарь {}: {e}", path.display()))
        })?;
        let vocab = Self::parse(&text)?;
        debug!(
            "Словарь {}: {} единиц, eos={}",
            path.display(),
            vocab.len(),
            vocab.eos()
        );
        Ok(vocab)
    }

    pub fn parse(text: &str) -> AsrResult<Self> {
        let mut entries: HashMap<u32, String> = HashMap::new();
        for (idx, line) in text.lines().enumerate() {
            let fields: Vec<&str> = line.split_whitespace().collect();
            let [unit, id] = fields[..] else {
                return Err(AsrError::Vocab(format!(
                    "Строка {}: ожидалось 2 поля, получено {}: {line:?}",
                    idx + 1,
                    fields.len()
                )));
            };
            let id: u32 = id.parse().map_err(|e| {
                AsrError::Vocab(format!("Строка {}: некорректный id {id:?}: {e}", idx + 1))
            })?;
            if entries.insert(id, unit.to_string()).is_some() {
                return Err(AsrError::Vocab(format!(
                    "Строка {}: повторный id {id}",
                    idx + 1
                )));
            }
        }

        let n = entries.len();
        let mut id_to_unit = Vec::with_capacity(n);
        for id in 0..n as u32 {
            let unit = entries.remove(&id).ok_or_else(|| {
                AsrError::Vocab(format!("Id не плотные: нет id {id} при {n} записях"))
            })?;
            id_to_unit.push(unit);
        }
        let unit_to_id = id_to_unit
            .iter()
            .enumerate()
            .map(|(id, unit)| (unit.clone(), id as u32))
            .collect();

        Ok(Self {
            id_to_unit,
            unit_to_id,
        })
    }

    pub fn len(&self) -> usize {
        self.id_to_unit.len()
    }

    pub fn is_empty(&self) -> bool {
        self.id_to_unit.is_empty()
    }

    /// `len - 1`; для пустого словаря не определён.
    pub fn eos(&self) -> u32 {
        self.len().saturating_sub(1) as u32
    }

    pub fn unit(&self, id: u32) -> Option<&str> {
        self.id_to_unit.get(id as usize).map(String::as_str)
    }

    pub fn id(&self, unit: &str) -> Option<u32> {
        self.unit_to_id.get(unit).copied()
    }

    /// Склеить единицы гипотезы до первого `eos` (не включая).
    pub fn render(&self, tokens: &[u32]) -> AsrResult<String> {
        let eos = self.eos();
        let mut text = String::new();
        for &id in tokens.iter().take_while(|&&id| id != eos) {
            let unit = self
                .unit(id)
                .ok_or_else(|| AsrError::Vocab(format!("Неизвестный id токена {id}")))?;
            text.push_str(unit);
        }
        Ok(text)
    }
}
