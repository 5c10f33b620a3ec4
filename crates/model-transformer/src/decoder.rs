//! Transformer-декодер (attention decoder).
//!
//! `decoder.embed.0` (Embedding) → абсолютная PE → `decoders.{i}` →
//! `after_norm` → `output_layer`.

use candle_core::{DType, IndexOp, Module, Result, Tensor, D};
use candle_nn::{Embedding, LayerNorm, Linear, VarBuilder};

use asr_core::{ActivationType, DecoderConf, PosEncType};

use crate::attention::MultiHeadedAttention;
use crate::embedding::PositionalEncoding;
use crate::feed_forward::{Activation, PositionwiseFeedForward};
use crate::mask::subsequent_mask;
use crate::LAYER_NORM_EPS;

/// Self-attention → cross-attention (на выход энкодера) → FFN.
pub struct DecoderLayer {
    self_attn: MultiHeadedAttention,
    src_attn: Option<MultiHeadedAttention>,
    feed_forward: PositionwiseFeedForward,
    norm1: LayerNorm,
    norm2: LayerNorm,
    norm3: LayerNorm,
    normalize_before: bool,
}

impl DecoderLayer {
    pub fn load(conf: &DecoderConf, d_model: usize, vb: VarBuilder) -> Result<Self> {
        let ln = |name: &str| candle_nn::layer_norm(d_model, LAYER_NORM_EPS, vb.pp(name));
        let src_attn = if conf.src_attention {
            Some(MultiHeadedAttention::load(
                d_model,
                conf.attention_heads,
                vb.pp("src_attn"),
            )?)
        } else {
            None
        };
        Ok(Self {
            self_attn: MultiHeadedAttention::load(d_model, conf.attention_heads, vb.pp("self_attn"))?,
            src_attn,
            feed_forward: PositionwiseFeedForward::load(
                d_model,
                conf.linear_units,
                Activation(ActivationType::Relu),
                vb.pp("feed_forward"),
            )?,
            norm1: ln("norm1")?,
            norm2: ln("norm2")?,
            norm3: ln("norm3")?,
            normalize_before: conf.normalize_before,
        })
    }

    fn sublayer(
        &self,
        x: &Tensor,
        norm: &LayerNorm,
        f: impl FnOnce(&Tensor) -> Result<Tensor>,
    ) -> Result<Tensor> {
        if self.normalize_before {
            x + f(&norm.forward(x)?)?
        } else {
            norm.forward(&(x + f(x)?)?)
        }
    }

    /// * `tgt`: (batch, L, d_model), `tgt_mask`: (batch, L, L)
    /// * `memory`: (batch, T, d_model), `memory_mask`: (batch, 1, T)
    pub fn forward(
        &self,
        tgt: &Tensor,
        tgt_mask: &Tensor,
        memory: &Tensor,
        memory_mask: &Tensor,
    ) -> Result<Tensor> {
        let x = self.sublayer(tgt, &self.norm1, |h| {
            self.self_attn.forward(h, h, h, Some(tgt_mask), None)
        })?;
        let x = match &self.src_attn {
            Some(src_attn) => self.sublayer(&x, &self.norm2, |h| {
                src_attn.forward(h, memory, memory, Some(memory_mask), None)
            })?,
            None => x,
        };
        self.sublayer(&x, &self.norm3, |h| self.feed_forward.forward(h))
    }
}

pub struct TransformerDecoder {
    embed: Embedding,
    pos_enc: PositionalEncoding,
    layers: Vec<DecoderLayer>,
    after_norm: Option<LayerNorm>,
    output_layer: Linear,
}

impl TransformerDecoder {
    pub fn load(
        conf: &DecoderConf,
        vocab_size: usize,
        d_model: usize,
        vb: VarBuilder,
    ) -> Result<Self> {
        let embed = candle_nn::embedding(vocab_size, d_model, vb.pp("embed.0"))?;
        let pos_enc = PositionalEncoding::new(PosEncType::AbsPos, d_model, vb.device())?;
        let layers = (0..conf.num_blocks)
            .map(|i| DecoderLayer::load(conf, d_model, vb.pp(format!("decoders.{i}"))))
            .collect::<Result<Vec<_>>>()?;
        let after_norm = if conf.normalize_before {
            Some(candle_nn::layer_norm(d_model, LAYER_NORM_EPS, vb.pp("after_norm"))?)
        } else {
            None
        };
        let output_layer = candle_nn::linear(d_model, vocab_size, vb.pp("output_layer"))?;
        Ok(Self {
            embed,
            pos_enc,
            layers,
            after_norm,
            output_layer,
        })
    }

    /// Скрытые состояния для префиксов `tokens` (batch, L), u32.
    fn hidden(
        &self,
        memory: &Tensor,
        memory_mask: &Tensor,
        tokens: &Tensor,
    ) -> Result<Tensor> {
        let (b, len) = tokens.dims2()?;
        let tgt_mask = subsequent_mask(len, tokens.device())?
            .unsqueeze(0)?
            .broadcast_as((b, len, len))?
            .contiguous()?;

        let (mut x, _) = self.pos_enc.forward(&self.embed.forward(tokens)?)?;
        for layer in &self.layers {
            x = layer.forward(&x, &tgt_mask, memory, memory_mask)?;
        }
        match &self.after_norm {
            Some(norm) => norm.forward(&x),
            None => Ok(x),
        }
    }

    /// Логиты всех позиций: (batch, L, vocab).
    pub fn forward(&self, memory: &Tensor, memory_mask: &Tensor, tokens: &Tensor) -> Result<Tensor> {
        self.output_layer
            .forward(&self.hidden(memory, memory_mask, tokens)?)
    }

    /// log-softmax следующего токена для каждого префикса: (batch, vocab).
    ///
    /// Префикс пересчитывается целиком, кэш слоёв не ведётся.
    pub fn forward_one_step(
        &self,
        memory: &Tensor,
        memory_mask: &Tensor,
        tokens: &Tensor,
    ) -> Result<Tensor> {
        let tokens = tokens.to_dtype(DType::U32)?;
        let (_, len) = tokens.dims2()?;
        let h = self.hidden(memory, memory_mask, &tokens)?;
        let last = h.i((.., len - 1, ..))?.contiguous()?;
        let logits = self.output_layer.forward(&last)?;
        candle_nn::ops::log_softmax(&logits, D::Minus1)
    }
}
