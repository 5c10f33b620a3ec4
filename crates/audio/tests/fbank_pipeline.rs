//! WAV file → fbank → global CMVN, the way raw-wav batches are prepared.

use asr_core::FeatureMatrix;
use audio::{load_wav_pcm16, FbankExtractor, FbankOptions, GlobalCmvn};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

const SAMPLE_RATE: u32 = 16000;

fn wav_spec() -> hound::WavSpec {
    hound::WavSpec {
        channels: 1,
        sample_rate: SAMPLE_RATE,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    }
}

fn write_tone(path: &std::path::Path, freq: f32, seconds: f32) {
    let mut writer = hound::WavWriter::create(path, wav_spec()).unwrap();
    let n = (SAMPLE_RATE as f32 * seconds) as usize;
    for i in 0..n {
        let t = i as f32 / 16000.0;
        let v = (2.0 * std::f32::consts::PI * freq * t).sin() * 8000.0;
        writer.write_sample(v as i16).unwrap();
    }
    writer.finalize().unwrap();
}

/// Seeded white noise: every mel bin gets non-trivial variance.
fn write_noise(path: &std::path::Path, seconds: f32) {
    let mut rng = StdRng::seed_from_u64(7);
    let mut writer = hound::WavWriter::create(path, wav_spec()).unwrap();
    let n = (SAMPLE_RATE as f32 * seconds) as usize;
    for _ in 0..n {
        writer.write_sample(rng.gen_range(-8000i16..=8000)).unwrap();
    }
    writer.finalize().unwrap();
}

/// Kaldi-style accumulated stats: row 0 = sums + count, row 1 = sums of squares.
/// Accumulated in f64, as the stats tools do.
fn accumulate_stats(feats: &FeatureMatrix) -> FeatureMatrix {
    let dim = feats.dim;
    let mut acc = vec![0.0f64; 2 * (dim + 1)];
    for frame in feats.frames() {
        for (d, &v) in frame.iter().enumerate() {
            acc[d] += v as f64;
            acc[dim + 1 + d] += (v as f64) * (v as f64);
        }
    }
    acc[dim] = feats.num_frames as f64;
    let data = acc.into_iter().map(|v| v as f32).collect();
    FeatureMatrix::new(data, 2, dim + 1).unwrap()
}

#[test]
fn test_one_second_tone_shape() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("tone.wav");
    write_tone(&path, 440.0, 1.0);

    let (samples, sample_rate) = load_wav_pcm16(&path).unwrap();
    assert_eq!(sample_rate, 16000);
    assert_eq!(samples.len(), 16000);

    let options = FbankOptions {
        num_mel_bins: 40,
        ..FbankOptions::default()
    };
    let feats = FbankExtractor::new(options).compute(&samples).unwrap();
    // 25ms window, 10ms shift, snip_edges: 1 + (16000 - 400) / 160
    assert_eq!(feats.num_frames, 98);
    assert_eq!(feats.dim, 40);
    assert!(feats.data.iter().all(|v| v.is_finite()));
}

#[test]
fn test_cmvn_from_own_stats_centres_features() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("noise.wav");
    write_noise(&path, 0.5);

    let (samples, _) = load_wav_pcm16(&path).unwrap();
    let mut feats = FbankExtractor::new(FbankOptions::default())
        .compute(&samples)
        .unwrap();

    let cmvn = GlobalCmvn::from_kaldi_stats(&accumulate_stats(&feats)).unwrap();
    assert_eq!(cmvn.dim(), 80);
    cmvn.apply(&mut feats).unwrap();

    let n = feats.num_frames as f32;
    for d in 0..feats.dim {
        let mean: f32 = feats.frames().map(|f| f[d]).sum::<f32>() / n;
        let var: f32 = feats.frames().map(|f| f[d] * f[d]).sum::<f32>() / n;
        assert!(mean.abs() < 1e-2, "dim {d}: mean {mean}");
        assert!((var - 1.0).abs() < 1e-2, "dim {d}: var {var}");
    }
}
