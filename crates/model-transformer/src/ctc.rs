//! CTC-голова и greedy-декодирование.
//!
//! CtcHead: Linear(d_model → vocab) (`ctc.ctc_lo`) → log_softmax.
//! CTC Greedy: argmax → удаление дублей → удаление blank.

use candle_core::{Module, Result, Tensor, D};
use candle_nn::{Linear, VarBuilder};

/// ID blank-токена.
pub const BLANK_ID: u32 = 0;

pub struct CtcHead {
    ctc_lo: Linear,
}

impl CtcHead {
    pub fn load(d_model: usize, vocab_size: usize, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            ctc_lo: candle_nn::linear(d_model, vocab_size, vb.pp("ctc_lo"))?,
        })
    }

    /// (batch, T, d_model) → log_softmax (batch, T, vocab).
    pub fn log_softmax(&self, hidden: &Tensor) -> Result<Tensor> {
        candle_nn::ops::log_softmax(&self.ctc_lo.forward(hidden)?, D::Minus1)
    }
}

/// Схлопнуть повторы, затем убрать blank.
pub fn remove_duplicates_and_blank(ids: &[u32]) -> Vec<u32> {
    let mut out = Vec::with_capacity(ids.len());
    let mut prev: Option<u32> = None;
    for &id in ids {
        if prev != Some(id) && id != BLANK_ID {
            out.push(id);
        }
        prev = Some(id);
    }
    out
}

/// Greedy-декодирование: `log_probs` (batch, T, vocab), `lengths`: валидные фреймы.
pub fn greedy_search(log_probs: &Tensor, lengths: &[usize]) -> Result<Vec<Vec<u32>>> {
    let best: Vec<Vec<u32>> = log_probs.argmax(D::Minus1)?.to_vec2()?;
    Ok(best
        .iter()
        .zip(lengths)
        .map(|(row, &len)| remove_duplicates_and_blank(&row[..len.min(row.len())]))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn test_remove_duplicates_and_blank() {
        assert_eq!(
            remove_duplicates_and_blank(&[0, 3, 3, 0, 3, 5, 5, 0, 0]),
            vec![3, 3, 5]
        );
        assert!(remove_duplicates_and_blank(&[0, 0]).is_empty());
    }

    #[test]
    fn test_greedy_search_respects_lengths() {
        // argmax по фреймам: [1, 1, 0, 2] и [2, 0, 2, 2]
        let probs = Tensor::new(
            &[
                [[0.1f32, 0.8, 0.1], [0.1, 0.8, 0.1], [0.9, 0.05, 0.05], [0.1, 0.1, 0.8]],
                [[0.1, 0.1, 0.8], [0.8, 0.1, 0.1], [0.1, 0.1, 0.8], [0.1, 0.1, 0.8]],
            ],
            &Device::Cpu,
        )
        .unwrap()
        .log()
        .unwrap();
        let hyps = greedy_search(&probs, &[4, 3]).unwrap();
        assert_eq!(hyps, vec![vec![1, 2], vec![2, 2]]);
    }
}
