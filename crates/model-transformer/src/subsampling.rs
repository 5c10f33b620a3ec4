//! Входной слой энкодера: свёрточная субдискретизация или линейная проекция.
//!
//! Ключи весов: `embed.conv.{0,2,4}` (Conv2d), `embed.out.0` (Linear),
//! для `linear` ещё `embed.out.1` (LayerNorm).

use candle_core::{Module, Result, Tensor};
use candle_nn::{Conv2d, Conv2dConfig, LayerNorm, Linear, VarBuilder};

use asr_core::InputLayer;

use crate::LAYER_NORM_EPS;

/// Один свёрточный слой: ядро и шаг.
#[derive(Debug, Clone, Copy)]
struct ConvStage {
    kernel: usize,
    stride: usize,
}

impl ConvStage {
    /// Длина выхода свёртки без паддинга.
    fn output_len(&self, len: usize) -> usize {
        if len < self.kernel {
            0
        } else {
            (len - self.kernel) / self.stride + 1
        }
    }

    /// Число валидных позиций после прореживания маски `[:-(k-1):stride]`.
    fn masked_len(&self, valid: usize, total: usize) -> usize {
        valid.div_ceil(self.stride).min(self.output_len(total))
    }
}

fn conv_stages(layer: InputLayer) -> &'static [ConvStage] {
    const K3S2: ConvStage = ConvStage { kernel: 3, stride: 2 };
    const K5S3: ConvStage = ConvStage { kernel: 5, stride: 3 };
    match layer {
        InputLayer::Conv2d => &[K3S2, K3S2],
        InputLayer::Conv2d6 => &[K3S2, K5S3],
        InputLayer::Conv2d8 => &[K3S2, K3S2, K3S2],
        InputLayer::Linear => &[],
    }
}

enum Layers {
    Conv2d { convs: Vec<Conv2d>, out: Linear },
    Linear { out: Linear, norm: LayerNorm },
}

/// Субдискретизация входных признаков.
pub struct Subsampling {
    layers: Layers,
    stages: &'static [ConvStage],
}

impl Subsampling {
    pub fn load(layer: InputLayer, idim: usize, odim: usize, vb: VarBuilder) -> Result<Self> {
        let stages = conv_stages(layer);
        if stages.is_empty() {
            let out = candle_nn::linear(idim, odim, vb.pp("out.0"))?;
            let norm = candle_nn::layer_norm(odim, LAYER_NORM_EPS, vb.pp("out.1"))?;
            return Ok(Self {
                layers: Layers::Linear { out, norm },
                stages,
            });
        }

        let mut convs = Vec::with_capacity(stages.len());
        let mut in_ch = 1;
        let mut freq = idim;
        for (i, stage) in stages.iter().enumerate() {
            // conv.0, conv.2, ... (ReLU на нечётных позициях)
            let cfg = Conv2dConfig {
                stride: stage.stride,
                ..Default::default()
            };
            convs.push(candle_nn::conv2d(
                in_ch,
                odim,
                stage.kernel,
                cfg,
                vb.pp(format!("conv.{}", i * 2)),
            )?);
            in_ch = odim;
            freq = stage.output_len(freq);
        }
        let out = candle_nn::linear(odim * freq, odim, vb.pp("out.0"))?;
        Ok(Self {
            layers: Layers::Conv2d { convs, out },
            stages,
        })
    }

    /// Коэффициент сокращения длины.
    pub fn rate(&self) -> usize {
        self.stages.iter().map(|s| s.stride).product()
    }

    /// (batch, T, idim) → (batch, T', odim).
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        match &self.layers {
            Layers::Conv2d { convs, out } => {
                let mut h = x.unsqueeze(1)?; // (b, 1, T, idim)
                for conv in convs {
                    h = conv.forward(&h)?.relu()?;
                }
                let (b, c, t, f) = h.dims4()?;
                let h = h.transpose(1, 2)?.contiguous()?.reshape((b, t, c * f))?;
                out.forward(&h)
            }
            Layers::Linear { out, norm } => norm.forward(&out.forward(x)?)?.relu(),
        }
    }

    /// Длины после субдискретизации при общей длине батча `total`.
    pub fn output_lengths(&self, lengths: &[usize], total: usize) -> Vec<usize> {
        lengths
            .iter()
            .map(|&len| {
                let (mut valid, mut t) = (len, total);
                for stage in self.stages {
                    valid = stage.masked_len(valid, t);
                    t = stage.output_len(t);
                }
                valid
            })
            .collect()
    }

    /// Длина выхода для входа длины `total`.
    pub fn output_len(&self, total: usize) -> usize {
        self.stages.iter().fold(total, |t, s| s.output_len(t))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    fn load(layer: InputLayer, idim: usize, odim: usize) -> Subsampling {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        Subsampling::load(layer, idim, odim, vb).unwrap()
    }

    #[test]
    fn test_conv2d_shapes() {
        let sub = load(InputLayer::Conv2d, 80, 16);
        let x = Tensor::zeros((2, 100, 80), DType::F32, &Device::Cpu).unwrap();
        let y = sub.forward(&x).unwrap();
        assert_eq!(y.dims(), &[2, 24, 16]);
        assert_eq!(sub.output_len(100), 24);
        assert_eq!(sub.rate(), 4);
    }

    #[test]
    fn test_conv2d6_and_conv2d8_lengths() {
        let sub6 = load(InputLayer::Conv2d6, 40, 8);
        let x = Tensor::zeros((1, 100, 40), DType::F32, &Device::Cpu).unwrap();
        assert_eq!(sub6.forward(&x).unwrap().dims(), &[1, 15, 8]);
        assert_eq!(sub6.output_len(100), 15);

        let sub8 = load(InputLayer::Conv2d8, 40, 8);
        assert_eq!(sub8.forward(&x).unwrap().dims(), &[1, 11, 8]);
        assert_eq!(sub8.rate(), 8);
    }

    #[test]
    fn test_masked_lengths() {
        let sub = load(InputLayer::Conv2d, 80, 8);
        // Самое длинное высказывание совпадает с длиной выхода свёрток.
        assert_eq!(sub.output_lengths(&[100, 50, 10], 100), vec![24, 13, 3]);
    }

    #[test]
    fn test_linear_keeps_length() {
        let sub = load(InputLayer::Linear, 20, 8);
        let x = Tensor::zeros((3, 7, 20), DType::F32, &Device::Cpu).unwrap();
        assert_eq!(sub.forward(&x).unwrap().dims(), &[3, 7, 8]);
        assert_eq!(sub.output_lengths(&[7, 4, 1], 7), vec![7, 4, 1]);
    }
}
