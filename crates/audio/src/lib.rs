//! Audio and feature I/O for recognition.
//!
//! - WAV loading (channel 0, 16-bit PCM scale)
//! - Kaldi-compatible fbank extraction
//! - Kaldi matrix reading (ark offsets, binary, compressed, text)
//! - Global CMVN

pub mod cmvn;
pub mod fbank;
pub mod kaldi;
pub mod loader;

pub use cmvn::GlobalCmvn;
pub use fbank::{FbankExtractor, FbankOptions};
pub use kaldi::{read_matrix, read_matrix_at};
pub use loader::{load_wav, load_wav_pcm16};
