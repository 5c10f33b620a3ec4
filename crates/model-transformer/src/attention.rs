//! Multi-head attention (обычное и с относительными позициями).
//!
//! Ключи: `linear_q`, `linear_k`, `linear_v`, `linear_out`; для
//! относительного варианта ещё `linear_pos` (без bias), `pos_bias_u`,
//! `pos_bias_v` формы (heads, d_k).

use candle_core::{Module, Result, Tensor};
use candle_nn::{Linear, VarBuilder};

use crate::mask::masked_fill;

/// Параметры относительного позиционного внимания.
struct RelPosParams {
    linear_pos: Linear,
    /// (1, heads, 1, d_k)
    pos_bias_u: Tensor,
    /// (1, heads, 1, d_k)
    pos_bias_v: Tensor,
}

pub struct MultiHeadedAttention {
    linear_q: Linear,
    linear_k: Linear,
    linear_v: Linear,
    linear_out: Linear,
    rel: Option<RelPosParams>,
    n_heads: usize,
    d_k: usize,
}

impl MultiHeadedAttention {
    pub fn load(d_model: usize, n_heads: usize, vb: VarBuilder) -> Result<Self> {
        let d_k = d_model / n_heads;
        Ok(Self {
            linear_q: candle_nn::linear(d_model, d_model, vb.pp("linear_q"))?,
            linear_k: candle_nn::linear(d_model, d_model, vb.pp("linear_k"))?,
            linear_v: candle_nn::linear(d_model, d_model, vb.pp("linear_v"))?,
            linear_out: candle_nn::linear(d_model, d_model, vb.pp("linear_out"))?,
            rel: None,
            n_heads,
            d_k,
        })
    }

    /// Внимание с относительными позициями (без rel_shift).
    pub fn load_rel_pos(d_model: usize, n_heads: usize, vb: VarBuilder) -> Result<Self> {
        let mut attn = Self::load(d_model, n_heads, vb.clone())?;
        let d_k = attn.d_k;
        let linear_pos = candle_nn::linear_no_bias(d_model, d_model, vb.pp("linear_pos"))?;
        let pos_bias_u = vb
            .get_with_hints((n_heads, d_k), "pos_bias_u", candle_nn::init::ZERO)?
            .reshape((1, n_heads, 1, d_k))?;
        let pos_bias_v = vb
            .get_with_hints((n_heads, d_k), "pos_bias_v", candle_nn::init::ZERO)?
            .reshape((1, n_heads, 1, d_k))?;
        attn.rel = Some(RelPosParams {
            linear_pos,
            pos_bias_u,
            pos_bias_v,
        });
        Ok(attn)
    }

    /// (batch, T, d_model) → (batch, heads, T, d_k).
    fn split_heads(&self, x: &Tensor) -> Result<Tensor> {
        let (b, t, _) = x.dims3()?;
        x.reshape((b, t, self.n_heads, self.d_k))?
            .transpose(1, 2)?
            .contiguous()
    }

    /// Прямой проход.
    ///
    /// * `query`: (batch, T1, d_model); `key`, `value`: (batch, T2, d_model)
    /// * `mask`: (batch, 1|T1, T2), u8, 1 = учитывать
    /// * `pos_emb`: (1, T2, d_model), только для относительного варианта
    pub fn forward(
        &self,
        query: &Tensor,
        key: &Tensor,
        value: &Tensor,
        mask: Option<&Tensor>,
        pos_emb: Option<&Tensor>,
    ) -> Result<Tensor> {
        let (b, t1, _) = query.dims3()?;
        let q = self.split_heads(&self.linear_q.forward(query)?)?;
        let k = self.split_heads(&self.linear_k.forward(key)?)?;
        let v = self.split_heads(&self.linear_v.forward(value)?)?;
        let scale = (self.d_k as f64).sqrt();
        let k_t = k.transpose(2, 3)?.contiguous()?;

        let scores = match (&self.rel, pos_emb) {
            (Some(rel), Some(pos_emb)) => {
                let p = self.split_heads(&rel.linear_pos.forward(pos_emb)?)?; // (1, h, T2, d_k)
                let p_t = p.transpose(2, 3)?.contiguous()?;
                let ac = q.broadcast_add(&rel.pos_bias_u)?.matmul(&k_t)?;
                let bd = q.broadcast_add(&rel.pos_bias_v)?.broadcast_matmul(&p_t)?;
                ((ac + bd)? / scale)?
            }
            (Some(_), None) => {
                return Err(candle_core::Error::Msg(
                    "relative attention requires pos_emb".to_string(),
                ))
            }
            (None, _) => (q.matmul(&k_t)? / scale)?,
        };

        let attn = match mask {
            Some(mask) => {
                // (batch, 1|T1, T2) → (batch, 1, 1|T1, T2)
                let mask = mask.unsqueeze(1)?;
                let scores = masked_fill(&scores, &mask, f32::MIN)?;
                let attn = candle_nn::ops::softmax_last_dim(&scores)?;
                masked_fill(&attn, &mask, 0.0)?
            }
            None => candle_nn::ops::softmax_last_dim(&scores)?,
        };

        let context = attn
            .matmul(&v)? // (batch, heads, T1, d_k)
            .transpose(1, 2)?
            .reshape((b, t1, self.n_heads * self.d_k))?;
        self.linear_out.forward(&context)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mask::non_pad_mask;
    use candle_core::{DType, Device, IndexOp};
    use candle_nn::VarMap;

    #[test]
    fn test_padding_does_not_leak() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let attn = MultiHeadedAttention::load(8, 2, vb).unwrap();

        let x = Tensor::randn(0f32, 1.0, (1, 5, 8), &Device::Cpu).unwrap();
        let mask = non_pad_mask(&[3], 5, &Device::Cpu).unwrap();
        let full = attn.forward(&x, &x, &x, Some(&mask), None).unwrap();

        // Изменения в паддинге не влияют на валидные позиции.
        let noise = Tensor::randn(0f32, 1.0, (1, 2, 8), &Device::Cpu).unwrap();
        let x2 = Tensor::cat(&[&x.i((.., 0..3, ..)).unwrap(), &noise], 1).unwrap();
        let full2 = attn.forward(&x2, &x2, &x2, Some(&mask), None).unwrap();

        let a = full.i((.., 0..3, ..)).unwrap().flatten_all().unwrap().to_vec1::<f32>().unwrap();
        let b = full2.i((.., 0..3, ..)).unwrap().flatten_all().unwrap().to_vec1::<f32>().unwrap();
        for (x, y) in a.iter().zip(b.iter()) {
            assert!((x - y).abs() < 1e-5);
        }
    }

    #[test]
    fn test_rel_pos_shapes() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let attn = MultiHeadedAttention::load_rel_pos(8, 2, vb).unwrap();
        let x = Tensor::randn(0f32, 1.0, (2, 4, 8), &Device::Cpu).unwrap();
        let pos = Tensor::randn(0f32, 1.0, (1, 4, 8), &Device::Cpu).unwrap();
        let y = attn.forward(&x, &x, &x, None, Some(&pos)).unwrap();
        assert_eq!(y.dims(), &[2, 4, 8]);
        assert!(attn.forward(&x, &x, &x, None, None).is_err());
    }
}
