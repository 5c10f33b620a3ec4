//! WAV file loading.

use asr_core::{AsrError, AsrResult, AudioBuffer};
use hound::WavReader;
use std::path::Path;

/// Scale from normalized [-1.0, 1.0] samples to the 16-bit PCM range
/// the filterbank statistics are computed in.
pub const PCM16_SCALE: f32 = 32768.0;

/// Load a WAV file and return an AudioBuffer.
pub fn load_wav(path: impl AsRef<Path>) -> AsrResult<AudioBuffer> {
    let path = path.as_ref();
    let reader = WavReader::open(path).map_err(|e| {
        AsrError::Audio(format!("Failed to open WAV {}: {}", path.display(), e))
    })?;

    let spec = reader.spec();
    let sample_rate = spec.sample_rate as usize;
    let channels = spec.channels as usize;

    let samples: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Float => reader
            .into_samples::<f32>()
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| AsrError::Audio(format!("Failed to read samples: {}", e)))?,
        hound::SampleFormat::Int => {
            let bits = spec.bits_per_sample;
            let max_val = (1u32 << (bits - 1)) as f32;
            reader
                .into_samples::<i32>()
                .map(|s| s.map(|v| v as f32 / max_val))
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| AsrError::Audio(format!("Failed to read samples: {}", e)))?
        }
    };

    Ok(AudioBuffer::new(samples, sample_rate, channels))
}

/// Extract one channel of an interleaved buffer.
///
/// Feature extraction always runs on channel 0, so multi-channel recordings
/// are not mixed down.
pub fn channel(buffer: &AudioBuffer, idx: usize) -> AsrResult<Vec<f32>> {
    if idx >= buffer.channels {
        return Err(AsrError::Audio(format!(
            "Channel {} requested, buffer has {}",
            idx, buffer.channels
        )));
    }
    if buffer.channels == 1 {
        return Ok(buffer.samples.clone());
    }

    Ok(buffer
        .samples
        .chunks(buffer.channels)
        .filter_map(|frame| frame.get(idx).copied())
        .collect())
}

/// Load channel 0 of a WAV file scaled to the 16-bit PCM range.
pub fn load_wav_pcm16(path: impl AsRef<Path>) -> AsrResult<(Vec<f32>, usize)> {
    let buffer = load_wav(path)?;
    let samples = channel(&buffer, 0)?
        .into_iter()
        .map(|s| s * PCM16_SCALE)
        .collect();
    Ok((samples, buffer.sample_rate))
}
