//! Запись результатов: одна строка `"<key> <text>\n"` на высказывание.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use asr_core::{AsrError, AsrResult};

pub struct ResultWriter<W: Write> {
    inner: BufWriter<W>,
    lines: usize,
}

impl ResultWriter<File> {
    /// Создать (перезаписать) файл результатов.
    pub fn create(path: impl AsRef<Path>) -> AsrResult<Self> {
        let path = path.as_ref();
        let file = File::create(path).map_err(|e| {
            AsrError::Io(std::io::Error::new(
                e.kind(),
                format!("Не удалось создать {}: {e}", path.display()),
            ))
        })?;
        Ok(Self::new(file))
    }
}

impl<W: Write> ResultWriter<W> {
    pub fn new(writer: W) -> Self {
        Self {
            inner: BufWriter::new(writer),
            lines: 0,
        }
    }

    pub fn write(&mut self, key: &str, text: &str) -> AsrResult<()> {
        writeln!(self.inner, "{key} {text}")?;
        self.lines += 1;
        Ok(())
    }

    pub fn lines(&self) -> usize {
        self.lines
    }

    /// Сбросить буфер и вернуть внутренний writer.
    pub fn finish(self) -> AsrResult<W> {
        self.inner
            .into_inner()
            .map_err(|e| AsrError::Io(e.into_error()))
    }
}
