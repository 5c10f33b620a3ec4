//! Kaldi-совместимые log mel filterbank признаки.
//!
//! Повторяет `compute-fbank-feats` с параметрами по умолчанию:
//! snip_edges, удаление DC, pre-emphasis 0.97, окно Povey,
//! дополнение до степени двойки, спектр мощности, mel-шкала `1127 ln(1 + f/700)`,
//! нижняя граница 20 Гц, `ln(max(e, f32::EPSILON))`.

use asr_core::{AsrResult, FeatureExtractionConf, FeatureMatrix};
use rand::Rng;
use rand_distr::StandardNormal;
use rustfft::{num_complex::Complex, FftPlanner};
use std::f32::consts::PI;

/// Параметры fbank.
#[derive(Debug, Clone)]
pub struct FbankOptions {
    pub sample_rate: usize,
    pub num_mel_bins: usize,
    /// Длина окна в миллисекундах.
    pub frame_length_ms: f32,
    /// Шаг окна в миллисекундах.
    pub frame_shift_ms: f32,
    /// Амплитуда гауссова шума (0 = без dither).
    pub dither: f32,
    pub preemphasis: f32,
    pub low_freq: f32,
    /// Верхняя граница; `<= 0` означает смещение от частоты Найквиста.
    pub high_freq: f32,
    pub remove_dc_offset: bool,
}

impl Default for FbankOptions {
    fn default() -> Self {
        Self {
            sample_rate: 16000,
            num_mel_bins: 80,
            frame_length_ms: 25.0,
            frame_shift_ms: 10.0,
            dither: 0.0,
            preemphasis: 0.97,
            low_freq: 20.0,
            high_freq: 0.0,
            remove_dc_offset: true,
        }
    }
}

impl FbankOptions {
    /// Собрать параметры из `feature_extraction_conf` конфигурации.
    pub fn from_conf(conf: &FeatureExtractionConf, dither: f32, sample_rate: usize) -> Self {
        Self {
            sample_rate,
            num_mel_bins: conf.mel_bins,
            frame_length_ms: conf.frame_length,
            frame_shift_ms: conf.frame_shift,
            dither,
            ..Self::default()
        }
    }

    /// Длина окна в сэмплах.
    pub fn window_size(&self) -> usize {
        (self.sample_rate as f32 * self.frame_length_ms * 0.001) as usize
    }

    /// Шаг окна в сэмплах.
    pub fn window_shift(&self) -> usize {
        (self.sample_rate as f32 * self.frame_shift_ms * 0.001) as usize
    }

    /// Размер FFT: длина окна, округлённая вверх до степени двойки.
    pub fn padded_window_size(&self) -> usize {
        self.window_size().next_power_of_two()
    }

    /// Количество фреймов для сигнала длиной `num_samples` (snip_edges).
    pub fn num_frames(&self, num_samples: usize) -> usize {
        let window_size = self.window_size();
        let shift = self.window_shift().max(1);
        if num_samples < window_size {
            0
        } else {
            1 + (num_samples - window_size) / shift
        }
    }
}

/// Экстрактор fbank с предвычисленными окном и mel-фильтрами.
#[derive(Debug)]
pub struct FbankExtractor {
    options: FbankOptions,
    window: Vec<f32>,
    mel_banks: Vec<Vec<f32>>,
}

impl FbankExtractor {
    pub fn new(options: FbankOptions) -> Self {
        let window = povey_window(options.window_size());
        let mel_banks = kaldi_mel_banks(
            options.num_mel_bins,
            options.padded_window_size(),
            options.sample_rate as f32,
            options.low_freq,
            options.high_freq,
        );
        Self {
            options,
            window,
            mel_banks,
        }
    }

    pub fn options(&self) -> &FbankOptions {
        &self.options
    }

    /// Вычислить признаки для сигнала в 16-битной шкале амплитуд.
    ///
    /// Возвращает матрицу `num_frames × num_mel_bins`; для сигнала короче
    /// одного окна матрица пустая.
    pub fn compute(&self, samples: &[f32]) -> AsrResult<FeatureMatrix> {
        let opts = &self.options;
        let num_frames = opts.num_frames(samples.len());
        let window_size = opts.window_size();
        let shift = opts.window_shift().max(1);
        let padded = opts.padded_window_size();
        let n_bins = opts.num_mel_bins;

        let mut planner = FftPlanner::<f32>::new();
        let fft = planner.plan_fft_forward(padded);
        let mut rng = rand::thread_rng();

        let mut data = Vec::with_capacity(num_frames * n_bins);
        let mut frame = vec![0.0_f32; window_size];
        let mut buffer = vec![Complex::new(0.0_f32, 0.0); padded];

        for frame_idx in 0..num_frames {
            let start = frame_idx * shift;
            frame.copy_from_slice(&samples[start..start + window_size]);

            if opts.dither != 0.0 {
                for v in frame.iter_mut() {
                    let noise: f32 = rng.sample(StandardNormal);
                    *v += opts.dither * noise;
                }
            }

            if opts.remove_dc_offset {
                let mean = frame.iter().sum::<f32>() / window_size as f32;
                for v in frame.iter_mut() {
                    *v -= mean;
                }
            }

            // Идём с конца, чтобы x[i-1] ещё не был изменён; x[-1] := x[0].
            if opts.preemphasis != 0.0 {
                for i in (1..window_size).rev() {
                    frame[i] -= opts.preemphasis * frame[i - 1];
                }
                frame[0] -= opts.preemphasis * frame[0];
            }

            for (i, slot) in buffer.iter_mut().enumerate() {
                let v = if i < window_size {
                    frame[i] * self.window[i]
                } else {
                    0.0
                };
                *slot = Complex::new(v, 0.0);
            }

            fft.process(&mut buffer);

            for filter in &self.mel_banks {
                let energy: f32 = filter
                    .iter()
                    .zip(buffer.iter())
                    .map(|(w, c)| w * (c.re * c.re + c.im * c.im))
                    .sum();
                data.push(energy.max(f32::EPSILON).ln());
            }
        }

        FeatureMatrix::new(data, num_frames, n_bins)
    }
}

/// Окно Povey: симметричное окно Ханна в степени 0.85.
fn povey_window(length: usize) -> Vec<f32> {
    if length < 2 {
        return vec![1.0; length];
    }
    let denom = (length - 1) as f32;
    (0..length)
        .map(|n| (0.5 - 0.5 * (2.0 * PI * n as f32 / denom).cos()).powf(0.85))
        .collect()
}

/// Mel-шкала Kaldi.
fn mel_scale(hz: f32) -> f32 {
    1127.0 * (1.0 + hz / 700.0).ln()
}

/// Треугольные фильтры Kaldi, построенные в mel-области.
///
/// Каждый фильтр покрывает `padded_window_size / 2` бинов FFT
/// (бин Найквиста не используется).
fn kaldi_mel_banks(
    num_bins: usize,
    padded_window_size: usize,
    sample_rate: f32,
    low_freq: f32,
    high_freq: f32,
) -> Vec<Vec<f32>> {
    let num_fft_bins = padded_window_size / 2;
    let nyquist = 0.5 * sample_rate;
    let high_freq = if high_freq <= 0.0 {
        high_freq + nyquist
    } else {
        high_freq
    };
    let fft_bin_width = sample_rate / padded_window_size as f32;

    let mel_low = mel_scale(low_freq);
    let mel_high = mel_scale(high_freq);
    let mel_delta = (mel_high - mel_low) / (num_bins + 1) as f32;

    (0..num_bins)
        .map(|bin| {
            let left = mel_low + bin as f32 * mel_delta;
            let center = mel_low + (bin + 1) as f32 * mel_delta;
            let right = mel_low + (bin + 2) as f32 * mel_delta;

            (0..num_fft_bins)
                .map(|i| {
                    let mel = mel_scale(fft_bin_width * i as f32);
                    let up = (mel - left) / (center - left);
                    let down = (right - mel) / (right - center);
                    up.min(down).max(0.0)
                })
                .collect()
        })
        .collect()
}
