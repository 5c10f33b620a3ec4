//! Батчевый beam search по attention-декодеру.
//!
//! Каждое высказывание батча получает `beam_size` лучей; на каждом шаге
//! декодер считает log-вероятности следующего токена для всех лучей сразу,
//! а отбор кандидатов выполняется на хосте. Завершённый луч (последний токен
//! `eos`) продолжает с нулевой добавкой к счёту и снова получает `eos`.

use std::cmp::Ordering;

use candle_core::{Device, Result, Tensor};
use tracing::debug;

use crate::decoder::TransformerDecoder;

/// Индексы и значения `k` наибольших элементов, по убыванию.
///
/// При равенстве значений раньше идёт меньший индекс.
pub fn top_k(values: &[f32], k: usize) -> Vec<(usize, f32)> {
    let k = k.min(values.len());
    if k == 0 {
        return Vec::new();
    }
    let order = |a: &usize, b: &usize| -> Ordering {
        values[*b].total_cmp(&values[*a]).then(a.cmp(b))
    };
    let mut idx: Vec<usize> = (0..values.len()).collect();
    if k < idx.len() {
        idx.select_nth_unstable_by(k - 1, order);
        idx.truncate(k);
    }
    idx.sort_by(order);
    idx.into_iter().map(|i| (i, values[i])).collect()
}

/// Параметры поиска.
#[derive(Debug, Clone, Copy)]
pub struct BeamSearch {
    pub sos: u32,
    pub eos: u32,
    pub beam_size: usize,
    /// Добавка `penalty * len` к итоговому счёту гипотезы.
    pub penalty: f32,
}

#[derive(Debug, Clone)]
struct Beam {
    /// Токены, начиная с `sos`.
    tokens: Vec<u32>,
    score: f32,
}

impl Beam {
    fn finished(&self, eos: u32) -> bool {
        self.tokens.len() > 1 && self.tokens.last() == Some(&eos)
    }

    /// Токены без `sos`, обрезанные сразу после первого `eos`.
    fn hypothesis(&self, eos: u32) -> Vec<u32> {
        let body = &self.tokens[1..];
        match body.iter().position(|&t| t == eos) {
            Some(p) => body[..=p].to_vec(),
            None => body.to_vec(),
        }
    }

    /// Длина без `sos`/`eos`.
    fn length(&self, eos: u32) -> usize {
        self.hypothesis(eos).iter().filter(|&&t| t != eos).count()
    }
}

impl BeamSearch {
    /// Лучшая гипотеза для каждого высказывания.
    ///
    /// * `memory`: выход энкодера (batch, T, d_model)
    /// * `memory_mask`: (batch, 1, T), u8
    ///
    /// Максимальная длина гипотезы равна `T`.
    pub fn search(
        &self,
        decoder: &TransformerDecoder,
        memory: &Tensor,
        memory_mask: &Tensor,
    ) -> Result<Vec<Vec<u32>>> {
        let (batch, max_len, _) = memory.dims3()?;
        let n = self.beam_size;
        let device = memory.device();

        // Повторить каждое высказывание n раз: (batch*n, T, d).
        let expand: Vec<u32> = (0..batch as u32)
            .flat_map(|b| std::iter::repeat(b).take(n))
            .collect();
        let expand = Tensor::from_vec(expand, batch * n, device)?;
        let memory = memory.index_select(&expand, 0)?;
        let memory_mask = memory_mask.index_select(&expand, 0)?;

        let mut beams: Vec<Beam> = (0..batch * n)
            .map(|r| Beam {
                tokens: vec![self.sos],
                score: if r % n == 0 { 0.0 } else { f32::NEG_INFINITY },
            })
            .collect();

        for step in 1..=max_len {
            if beams.iter().all(|b| b.finished(self.eos)) {
                debug!("Beam search: все лучи завершены на шаге {step}");
                break;
            }
            let log_probs = self.step_log_probs(decoder, &memory, &memory_mask, &beams, device)?;
            beams = self.advance(&beams, &log_probs, batch);
        }

        Ok(beams
            .chunks(n)
            .map(|group| {
                let best = group
                    .iter()
                    .map(|b| (b, b.score + self.penalty * b.length(self.eos) as f32))
                    .fold(None::<(&Beam, f32)>, |acc, (b, s)| match acc {
                        Some((_, best)) if best >= s => acc,
                        _ => Some((b, s)),
                    });
                best.map(|(b, _)| b.hypothesis(self.eos)).unwrap_or_default()
            })
            .collect())
    }

    fn step_log_probs(
        &self,
        decoder: &TransformerDecoder,
        memory: &Tensor,
        memory_mask: &Tensor,
        beams: &[Beam],
        device: &Device,
    ) -> Result<Vec<Vec<f32>>> {
        let len = beams[0].tokens.len();
        let flat: Vec<u32> = beams.iter().flat_map(|b| b.tokens.iter().copied()).collect();
        let tokens = Tensor::from_vec(flat, (beams.len(), len), device)?;
        decoder
            .forward_one_step(memory, memory_mask, &tokens)?
            .to_vec2::<f32>()
    }

    /// Один шаг: top-k по каждому лучу, затем top-n по n·k кандидатам высказывания.
    fn advance(&self, beams: &[Beam], log_probs: &[Vec<f32>], batch: usize) -> Vec<Beam> {
        let n = self.beam_size;
        let mut next = Vec::with_capacity(beams.len());

        for b in 0..batch {
            // (счёт, индекс луча, токен)
            let mut candidates: Vec<(f32, usize, u32)> = Vec::with_capacity(n * n);
            for r in b * n..(b + 1) * n {
                let beam = &beams[r];
                if beam.finished(self.eos) {
                    candidates.push((beam.score, r, self.eos));
                    candidates.extend((1..n).map(|_| (f32::NEG_INFINITY, r, self.eos)));
                    continue;
                }
                let mut best = top_k(&log_probs[r], n);
                best.resize(n, (self.eos as usize, f32::NEG_INFINITY));
                candidates.extend(
                    best.into_iter()
                        .map(|(tok, lp)| (beam.score + lp, r, tok as u32)),
                );
            }

            let scores: Vec<f32> = candidates.iter().map(|c| c.0).collect();
            for (i, score) in top_k(&scores, n) {
                let (_, r, tok) = candidates[i];
                let mut tokens = beams[r].tokens.clone();
                tokens.push(tok);
                next.push(Beam { tokens, score });
            }
        }
        next
    }
}
