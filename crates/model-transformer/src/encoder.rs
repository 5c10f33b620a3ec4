//! Transformer- и Conformer-энкодер.
//!
//! Ключи тензоров совпадают с state dict обучающего рецепта:
//! `encoder.embed.*`, `encoder.encoders.{i}.*`, `encoder.after_norm`.

use candle_core::{Module, ModuleT, Result, Tensor};
use candle_nn::{BatchNorm, Conv1d, Conv1dConfig, LayerNorm, VarBuilder};
use tracing::debug;

use asr_core::{EncoderConf, EncoderType, SelfAttentionType};

use crate::attention::MultiHeadedAttention;
use crate::embedding::PositionalEncoding;
use crate::feed_forward::{Activation, PositionwiseFeedForward};
use crate::mask::{masked_fill, non_pad_mask};
use crate::subsampling::Subsampling;
use crate::LAYER_NORM_EPS;

// -----------------------------------------------------------------------
// Conformer Convolution Module
// -----------------------------------------------------------------------

/// Pointwise Conv1d → GLU → Depthwise Conv1d → BatchNorm → act → Pointwise Conv1d
pub struct ConvolutionModule {
    pointwise_conv1: Conv1d,
    depthwise_conv: Conv1d,
    norm: BatchNorm,
    pointwise_conv2: Conv1d,
    activation: Activation,
    channels: usize,
}

impl ConvolutionModule {
    pub fn load(
        channels: usize,
        kernel_size: usize,
        activation: Activation,
        vb: VarBuilder,
    ) -> Result<Self> {
        let pointwise_conv1 = candle_nn::conv1d(
            channels,
            2 * channels,
            1,
            Conv1dConfig::default(),
            vb.pp("pointwise_conv1"),
        )?;
        let dw_cfg = Conv1dConfig {
            padding: (kernel_size - 1) / 2,
            groups: channels,
            ..Default::default()
        };
        let depthwise_conv =
            candle_nn::conv1d(channels, channels, kernel_size, dw_cfg, vb.pp("depthwise_conv"))?;
        let norm = candle_nn::batch_norm(channels, 1e-5, vb.pp("norm"))?;
        let pointwise_conv2 = candle_nn::conv1d(
            channels,
            channels,
            1,
            Conv1dConfig::default(),
            vb.pp("pointwise_conv2"),
        )?;
        Ok(Self {
            pointwise_conv1,
            depthwise_conv,
            norm,
            pointwise_conv2,
            activation,
            channels,
        })
    }

    /// x: (batch, T, C); mask_pad: (batch, 1, T).
    pub fn forward(&self, x: &Tensor, mask_pad: &Tensor) -> Result<Tensor> {
        let h = masked_fill(&x.transpose(1, 2)?.contiguous()?, mask_pad, 0.0)?; // (b, C, T)

        let h = self.pointwise_conv1.forward(&h)?;
        let h = (h.narrow(1, 0, self.channels)?
            * candle_nn::ops::sigmoid(&h.narrow(1, self.channels, self.channels)?)?)?;

        let h = self.depthwise_conv.forward(&h)?;
        let h = self.activation.forward(&self.norm.forward_t(&h, false)?)?;
        let h = self.pointwise_conv2.forward(&h)?;

        masked_fill(&h, mask_pad, 0.0)?.transpose(1, 2)
    }
}

// -----------------------------------------------------------------------
// Encoder layers
// -----------------------------------------------------------------------

/// `x + f(norm(x))` при pre-norm, `norm(x + f(x))` при post-norm.
fn residual(
    x: &Tensor,
    norm: &LayerNorm,
    normalize_before: bool,
    scale: f64,
    f: impl FnOnce(&Tensor) -> Result<Tensor>,
) -> Result<Tensor> {
    let h = if normalize_before {
        f(&norm.forward(x)?)?
    } else {
        f(x)?
    };
    let out = (x + (h * scale)?)?;
    if normalize_before {
        Ok(out)
    } else {
        norm.forward(&out)
    }
}

/// Self-attention + FFN.
pub struct TransformerEncoderLayer {
    self_attn: MultiHeadedAttention,
    feed_forward: PositionwiseFeedForward,
    norm1: LayerNorm,
    norm2: LayerNorm,
    normalize_before: bool,
}

impl TransformerEncoderLayer {
    pub fn load(
        conf: &EncoderConf,
        self_attn: MultiHeadedAttention,
        activation: Activation,
        vb: VarBuilder,
    ) -> Result<Self> {
        let d = conf.output_size;
        Ok(Self {
            self_attn,
            feed_forward: PositionwiseFeedForward::load(
                d,
                conf.linear_units,
                activation,
                vb.pp("feed_forward"),
            )?,
            norm1: candle_nn::layer_norm(d, LAYER_NORM_EPS, vb.pp("norm1"))?,
            norm2: candle_nn::layer_norm(d, LAYER_NORM_EPS, vb.pp("norm2"))?,
            normalize_before: conf.normalize_before,
        })
    }

    pub fn forward(&self, x: &Tensor, mask: &Tensor, pos_emb: &Tensor) -> Result<Tensor> {
        let nb = self.normalize_before;
        let x = residual(x, &self.norm1, nb, 1.0, |h| {
            self.self_attn.forward(h, h, h, Some(mask), Some(pos_emb))
        })?;
        residual(&x, &self.norm2, nb, 1.0, |h| self.feed_forward.forward(h))
    }
}

/// Macaron FFN → self-attention → conv module → FFN → final norm.
pub struct ConformerEncoderLayer {
    self_attn: MultiHeadedAttention,
    feed_forward: PositionwiseFeedForward,
    feed_forward_macaron: Option<(PositionwiseFeedForward, LayerNorm)>,
    conv_module: Option<(ConvolutionModule, LayerNorm, LayerNorm)>,
    norm_ff: LayerNorm,
    norm_mha: LayerNorm,
    ff_scale: f64,
    normalize_before: bool,
}

impl ConformerEncoderLayer {
    pub fn load(
        conf: &EncoderConf,
        self_attn: MultiHeadedAttention,
        activation: Activation,
        vb: VarBuilder,
    ) -> Result<Self> {
        let d = conf.output_size;
        let ln = |name: &str| candle_nn::layer_norm(d, LAYER_NORM_EPS, vb.pp(name));

        let feed_forward_macaron = if conf.macaron_style {
            Some((
                PositionwiseFeedForward::load(
                    d,
                    conf.linear_units,
                    activation,
                    vb.pp("feed_forward_macaron"),
                )?,
                ln("norm_ff_macaron")?,
            ))
        } else {
            None
        };
        let conv_module = if conf.use_cnn_module {
            Some((
                ConvolutionModule::load(
                    d,
                    conf.cnn_module_kernel,
                    activation,
                    vb.pp("conv_module"),
                )?,
                ln("norm_conv")?,
                ln("norm_final")?,
            ))
        } else {
            None
        };

        Ok(Self {
            self_attn,
            feed_forward: PositionwiseFeedForward::load(
                d,
                conf.linear_units,
                activation,
                vb.pp("feed_forward"),
            )?,
            feed_forward_macaron,
            conv_module,
            norm_ff: ln("norm_ff")?,
            norm_mha: ln("norm_mha")?,
            ff_scale: if conf.macaron_style { 0.5 } else { 1.0 },
            normalize_before: conf.normalize_before,
        })
    }

    pub fn forward(
        &self,
        x: &Tensor,
        mask: &Tensor,
        pos_emb: &Tensor,
        mask_pad: &Tensor,
    ) -> Result<Tensor> {
        let nb = self.normalize_before;
        let mut x = x.clone();

        if let Some((ff, norm)) = &self.feed_forward_macaron {
            x = residual(&x, norm, nb, self.ff_scale, |h| ff.forward(h))?;
        }

        x = residual(&x, &self.norm_mha, nb, 1.0, |h| {
            self.self_attn.forward(h, h, h, Some(mask), Some(pos_emb))
        })?;

        if let Some((conv, norm_conv, _)) = &self.conv_module {
            x = residual(&x, norm_conv, nb, 1.0, |h| conv.forward(h, mask_pad))?;
        }

        x = residual(&x, &self.norm_ff, nb, self.ff_scale, |h| {
            self.feed_forward.forward(h)
        })?;

        match &self.conv_module {
            Some((_, _, norm_final)) => norm_final.forward(&x),
            None => Ok(x),
        }
    }
}

pub enum EncoderLayer {
    Transformer(TransformerEncoderLayer),
    Conformer(ConformerEncoderLayer),
}

impl EncoderLayer {
    fn forward(&self, x: &Tensor, mask: &Tensor, pos_emb: &Tensor) -> Result<Tensor> {
        match self {
            Self::Transformer(layer) => layer.forward(x, mask, pos_emb),
            Self::Conformer(layer) => layer.forward(x, mask, pos_emb, mask),
        }
    }
}

// -----------------------------------------------------------------------
// Encoder
// -----------------------------------------------------------------------

/// Выход энкодера.
pub struct EncoderOutput {
    /// (batch, T', d_model)
    pub hidden: Tensor,
    /// (batch, 1, T'), u8
    pub mask: Tensor,
    pub lengths: Vec<usize>,
}

/// Subsampling → positional encoding → N слоёв → after_norm.
pub struct Encoder {
    embed: Subsampling,
    pos_enc: PositionalEncoding,
    layers: Vec<EncoderLayer>,
    after_norm: Option<LayerNorm>,
    output_size: usize,
}

impl Encoder {
    pub fn load(
        kind: EncoderType,
        conf: &EncoderConf,
        input_dim: usize,
        vb: VarBuilder,
    ) -> Result<Self> {
        let d = conf.output_size;
        let pos_kind = conf.pos_enc(kind);
        let attn_kind = conf.self_attention(kind);
        let activation = Activation(conf.activation(kind));

        let embed = Subsampling::load(conf.input_layer, input_dim, d, vb.pp("embed"))?;
        let pos_enc = PositionalEncoding::new(pos_kind, d, vb.device())?;

        let mut layers = Vec::with_capacity(conf.num_blocks);
        for i in 0..conf.num_blocks {
            let lvb = vb.pp(format!("encoders.{i}"));
            let self_attn = match attn_kind {
                SelfAttentionType::Selfattn => {
                    MultiHeadedAttention::load(d, conf.attention_heads, lvb.pp("self_attn"))?
                }
                SelfAttentionType::RelSelfattn => MultiHeadedAttention::load_rel_pos(
                    d,
                    conf.attention_heads,
                    lvb.pp("self_attn"),
                )?,
            };
            layers.push(match kind {
                EncoderType::Transformer => EncoderLayer::Transformer(
                    TransformerEncoderLayer::load(conf, self_attn, activation, lvb)?,
                ),
                EncoderType::Conformer => EncoderLayer::Conformer(ConformerEncoderLayer::load(
                    conf, self_attn, activation, lvb,
                )?),
            });
        }

        let after_norm = if conf.normalize_before {
            Some(candle_nn::layer_norm(d, LAYER_NORM_EPS, vb.pp("after_norm"))?)
        } else {
            None
        };

        debug!(
            "Энкодер {:?}: {} слоёв, d_model={}, {:?}, {:?}, субдискретизация x{}",
            kind,
            conf.num_blocks,
            d,
            pos_kind,
            attn_kind,
            embed.rate()
        );

        Ok(Self {
            embed,
            pos_enc,
            layers,
            after_norm,
            output_size: d,
        })
    }

    pub fn output_size(&self) -> usize {
        self.output_size
    }

    /// feats: (batch, T, input_dim).
    pub fn forward(&self, feats: &Tensor, lengths: &[usize]) -> Result<EncoderOutput> {
        let (_b, t, _d) = feats.dims3()?;
        let x = self.embed.forward(feats)?;
        let (_, t_out, _) = x.dims3()?;
        let lengths = self.embed.output_lengths(lengths, t);
        let mask = non_pad_mask(&lengths, t_out, x.device())?;

        let (mut x, pos_emb) = self.pos_enc.forward(&x)?;
        for layer in &self.layers {
            x = layer.forward(&x, &mask, &pos_emb)?;
        }
        if let Some(norm) = &self.after_norm {
            x = norm.forward(&x)?;
        }

        Ok(EncoderOutput {
            hidden: x,
            mask,
            lengths,
        })
    }
}
