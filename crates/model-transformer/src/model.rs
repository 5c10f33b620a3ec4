//! AsrModel: энкодер + CTC-голова + attention-декодер.
//!
//! Реализует [`Recognizer`] для цикла инференса.

use std::time::Instant;

use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use tracing::{debug, info, warn};

use asr_core::{AsrError, AsrResult, DecodeMode, DecodeOptions, ExperimentConfig, Recognizer};

use crate::ctc::{self, CtcHead};
use crate::decoder::TransformerDecoder;
use crate::encoder::Encoder;
use crate::search::BeamSearch;

pub struct AsrModel {
    encoder: Encoder,
    ctc: CtcHead,
    decoder: TransformerDecoder,
    vocab_size: usize,
    device: Device,
}

impl AsrModel {
    /// Собрать модель из конфигурации; веса берутся из `vb`.
    pub fn load(
        config: &ExperimentConfig,
        input_dim: usize,
        vocab_size: usize,
        vb: VarBuilder,
    ) -> AsrResult<Self> {
        config.validate()?;
        if vocab_size < 2 {
            return Err(AsrError::Model(format!(
                "Размер словаря должен быть >= 2, получено {vocab_size}"
            )));
        }
        let start = Instant::now();
        let d_model = config.encoder_conf.output_size;

        let encoder = Encoder::load(config.encoder, &config.encoder_conf, input_dim, vb.pp("encoder"))?;
        let ctc = CtcHead::load(d_model, vocab_size, vb.pp("ctc"))?;
        let decoder =
            TransformerDecoder::load(&config.decoder_conf, vocab_size, d_model, vb.pp("decoder"))?;

        info!(
            "Модель {:?}/{:?}: input_dim={}, vocab_size={}, собрана за {:.2}с",
            config.encoder,
            config.decoder,
            input_dim,
            vocab_size,
            start.elapsed().as_secs_f64()
        );

        Ok(Self {
            encoder,
            ctc,
            decoder,
            vocab_size,
            device: vb.device().clone(),
        })
    }

    /// Модель со случайными весами (для тестов и проверки конфигурации).
    pub fn random(
        config: &ExperimentConfig,
        input_dim: usize,
        vocab_size: usize,
        device: &Device,
    ) -> AsrResult<(Self, candle_nn::VarMap)> {
        let varmap = candle_nn::VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        let model = Self::load(config, input_dim, vocab_size, vb)?;
        Ok((model, varmap))
    }

    pub fn vocab_size(&self) -> usize {
        self.vocab_size
    }

    /// `sos` и `eos` совпадают: последний id словаря.
    pub fn eos(&self) -> u32 {
        (self.vocab_size - 1) as u32
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    fn attention_search(
        &self,
        feats: &Tensor,
        feats_lengths: &[usize],
        options: &DecodeOptions,
    ) -> AsrResult<Vec<Vec<u32>>> {
        if options.beam_size == 0 {
            return Err(AsrError::Inference("beam_size должен быть > 0".to_string()));
        }
        let enc = self.encoder.forward(feats, feats_lengths)?;
        let search = BeamSearch {
            sos: self.eos(),
            eos: self.eos(),
            beam_size: options.beam_size,
            penalty: options.penalty,
        };
        Ok(search.search(&self.decoder, &enc.hidden, &enc.mask)?)
    }

    fn ctc_greedy_search(&self, feats: &Tensor, feats_lengths: &[usize]) -> AsrResult<Vec<Vec<u32>>> {
        let enc = self.encoder.forward(feats, feats_lengths)?;
        let log_probs = self.ctc.log_softmax(&enc.hidden)?;
        Ok(ctc::greedy_search(&log_probs, &enc.lengths)?)
    }
}

impl Recognizer for AsrModel {
    fn recognize(
        &self,
        feats: &Tensor,
        feats_lengths: &[usize],
        options: &DecodeOptions,
    ) -> AsrResult<Vec<Vec<u32>>> {
        let (batch, frames, _dim) = feats.dims3()?;
        if batch != feats_lengths.len() {
            return Err(AsrError::Inference(format!(
                "Батч из {batch} высказываний, а длин {}",
                feats_lengths.len()
            )));
        }
        if let Some(&too_long) = feats_lengths.iter().find(|&&l| l > frames) {
            warn!("Длина {too_long} больше числа фреймов {frames}, обрезаем");
        }
        let lengths: Vec<usize> = feats_lengths.iter().map(|&l| l.min(frames)).collect();

        let start = Instant::now();
        let feats = feats.to_dtype(DType::F32)?;
        let hyps = match options.mode {
            DecodeMode::Attention => self.attention_search(&feats, &lengths, options)?,
            DecodeMode::CtcGreedySearch => self.ctc_greedy_search(&feats, &lengths)?,
        };
        debug!(
            "{:?}: батч {}x{} за {:.3}с",
            options.mode,
            batch,
            frames,
            start.elapsed().as_secs_f64()
        );
        Ok(hyps)
    }
}
