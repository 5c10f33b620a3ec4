//! Синусоидальные позиционные кодировки.

use candle_core::{Device, Result, Tensor};
use tracing::debug;

use asr_core::PosEncType;

const DEFAULT_MAX_LEN: usize = 5000;

/// Таблица PE (max_len, d_model): sin на чётных индексах, cos на нечётных.
fn sinusoid_table(d_model: usize, max_len: usize, device: &Device) -> Result<Tensor> {
    let mut data = vec![0.0_f32; max_len * d_model];
    let log_base = -(10_000f32.ln()) / d_model as f32;
    for pos in 0..max_len {
        let row = &mut data[pos * d_model..(pos + 1) * d_model];
        for i in (0..d_model).step_by(2) {
            let angle = pos as f32 * (i as f32 * log_base).exp();
            row[i] = angle.sin();
            if i + 1 < d_model {
                row[i + 1] = angle.cos();
            }
        }
    }
    Tensor::from_vec(data, (max_len, d_model), device)
}

/// Позиционная кодировка: абсолютная (`x·√d + PE`) или относительная
/// (`x·√d`, PE отдаётся отдельно для attention).
pub struct PositionalEncoding {
    kind: PosEncType,
    d_model: usize,
    xscale: f64,
    pe: Tensor,
}

impl PositionalEncoding {
    pub fn new(kind: PosEncType, d_model: usize, device: &Device) -> Result<Self> {
        Ok(Self {
            kind,
            d_model,
            xscale: (d_model as f64).sqrt(),
            pe: sinusoid_table(d_model, DEFAULT_MAX_LEN, device)?,
        })
    }

    /// PE для первых `len` позиций: (1, len, d_model).
    pub fn position_encoding(&self, len: usize) -> Result<Tensor> {
        if len <= self.pe.dim(0)? {
            self.pe.narrow(0, 0, len)?.unsqueeze(0)
        } else {
            debug!("PE: таблица расширена до {len} позиций");
            sinusoid_table(self.d_model, len, self.pe.device())?.unsqueeze(0)
        }
    }

    /// x: (batch, T, d_model) → (x', pos_emb (1, T, d_model)).
    pub fn forward(&self, x: &Tensor) -> Result<(Tensor, Tensor)> {
        let (_b, t, _d) = x.dims3()?;
        let pos_emb = self.position_encoding(t)?;
        let x = (x * self.xscale)?;
        let x = match self.kind {
            PosEncType::AbsPos => x.broadcast_add(&pos_emb)?,
            PosEncType::RelPos => x,
        };
        Ok((x, pos_emb))
    }
}
