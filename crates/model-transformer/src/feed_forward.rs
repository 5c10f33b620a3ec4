//! Position-wise feed-forward: `w_2(act(w_1(x)))`.

use candle_core::{Module, Result, Tensor};
use candle_nn::{Linear, VarBuilder};

use asr_core::ActivationType;

/// Функция активации из конфигурации.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Activation(pub ActivationType);

impl Module for Activation {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        match self.0 {
            ActivationType::Relu => x.relu(),
            ActivationType::Swish => candle_nn::ops::silu(x),
            ActivationType::Gelu => x.gelu_erf(),
            ActivationType::Tanh => x.tanh(),
        }
    }
}

pub struct PositionwiseFeedForward {
    w_1: Linear,
    w_2: Linear,
    activation: Activation,
}

impl PositionwiseFeedForward {
    pub fn load(
        d_model: usize,
        hidden: usize,
        activation: Activation,
        vb: VarBuilder,
    ) -> Result<Self> {
        Ok(Self {
            w_1: candle_nn::linear(d_model, hidden, vb.pp("w_1"))?,
            w_2: candle_nn::linear(hidden, d_model, vb.pp("w_2"))?,
            activation,
        })
    }
}

impl Module for PositionwiseFeedForward {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let h = self.activation.forward(&self.w_1.forward(x)?)?;
        self.w_2.forward(&h)
    }
}
