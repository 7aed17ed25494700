//! Audio plumbing: the capture/sink traits the embedder implements, plus
//! PCM conversions, a linear resampler, and WAV encoding for batch
//! recognition.
//!
//! Device acquisition and playback widgets live in the embedding UI; the
//! runtime only sees float frames coming in and float samples going out.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::sync::mpsc;

/// A live capture session: mono or interleaved float frames at `rate`.
pub struct CaptureStream {
    pub rate: u32,
    pub channels: u16,
    pub frames: mpsc::Receiver<Vec<f32>>,
}

/// Microphone-ish source. Opening a second stream while one is live is the
/// embedder's problem; the ASR controller enforces single ownership above
/// this trait.
pub trait CaptureSource: Send + Sync {
    fn open(&self) -> Result<CaptureStream>;
}

/// Playback sink owned by one TTS node.
#[async_trait]
pub trait AudioSink: Send + Sync {
    /// Output sample rate the sink consumes.
    fn sample_rate(&self) -> u32;

    /// Wake the sink from a suspended state.
    fn resume(&self);

    /// Queue mono float samples for playback.
    fn enqueue(&self, samples: &[f32]);

    /// Number of buffer underruns observed so far.
    fn underruns(&self) -> u64;

    /// Play an encoded blob (file-mode synthesis) to completion.
    async fn play_encoded(&self, content_type: &str, bytes: Vec<u8>) -> Result<()>;
}

/// Test/headless sink that records everything it is handed.
#[derive(Default)]
pub struct NullSink {
    rate: u32,
    samples: Mutex<Vec<f32>>,
    underruns: AtomicU64,
    blobs: Mutex<Vec<(String, usize)>>,
}

impl NullSink {
    pub fn new(rate: u32) -> Self {
        Self {
            rate,
            ..Default::default()
        }
    }

    pub fn captured(&self) -> Vec<f32> {
        self.samples.lock().unwrap().clone()
    }

    pub fn blobs(&self) -> Vec<(String, usize)> {
        self.blobs.lock().unwrap().clone()
    }
}

#[async_trait]
impl AudioSink for NullSink {
    fn sample_rate(&self) -> u32 {
        self.rate
    }

    fn resume(&self) {}

    fn enqueue(&self, samples: &[f32]) {
        self.samples.lock().unwrap().extend_from_slice(samples);
    }

    fn underruns(&self) -> u64 {
        self.underruns.load(Ordering::Relaxed)
    }

    async fn play_encoded(&self, content_type: &str, bytes: Vec<u8>) -> Result<()> {
        self.blobs
            .lock()
            .unwrap()
            .push((content_type.to_string(), bytes.len()));
        Ok(())
    }
}

/// Average interleaved channels down to mono.
pub fn downmix_mono(samples: &[f32], channels: u16) -> Vec<f32> {
    if channels <= 1 {
        return samples.to_vec();
    }
    let ch = channels as usize;
    samples
        .chunks_exact(ch)
        .map(|frame| frame.iter().sum::<f32>() / ch as f32)
        .collect()
}

/// Linear-interpolation resampler.
pub fn resample_linear(samples: &[f32], from_rate: u32, to_rate: u32) -> Vec<f32> {
    if from_rate == to_rate || samples.is_empty() {
        return samples.to_vec();
    }
    let ratio = from_rate as f64 / to_rate as f64;
    let output_len = (samples.len() as f64 / ratio).ceil() as usize;

    (0..output_len)
        .map(|i| {
            let source_pos = i as f64 * ratio;
            let idx = source_pos.floor() as usize;
            let fraction = source_pos - idx as f64;
            if idx + 1 >= samples.len() {
                samples[samples.len() - 1]
            } else {
                let left = samples[idx] as f64;
                let right = samples[idx + 1] as f64;
                (left + (right - left) * fraction) as f32
            }
        })
        .collect()
}

/// Root mean square of a frame.
pub fn rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum: f64 = samples.iter().map(|&s| (s as f64) * (s as f64)).sum();
    (sum / samples.len() as f64).sqrt() as f32
}

/// Encode float samples as PCM16 little-endian.
pub fn f32_to_pcm16le(samples: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(samples.len() * 2);
    for &s in samples {
        let clamped = (s.clamp(-1.0, 1.0) * 32767.0) as i16;
        out.extend_from_slice(&clamped.to_le_bytes());
    }
    out
}

/// Streaming PCM16LE → f32 decoder. Chunk boundaries may split a sample;
/// the odd trailing byte is carried to the next chunk.
#[derive(Debug, Default)]
pub struct Pcm16Decoder {
    carry: Option<u8>,
}

impl Pcm16Decoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, bytes: &[u8]) -> Vec<f32> {
        let mut data: Vec<u8>;
        let slice: &[u8] = match self.carry.take() {
            Some(b) => {
                data = Vec::with_capacity(bytes.len() + 1);
                data.push(b);
                data.extend_from_slice(bytes);
                &data
            }
            None => bytes,
        };

        let pairs = slice.len() / 2;
        let mut out = Vec::with_capacity(pairs);
        for chunk in slice.chunks_exact(2) {
            let v = i16::from_le_bytes([chunk[0], chunk[1]]);
            out.push(v as f32 / 32768.0);
        }
        if slice.len() % 2 == 1 {
            self.carry = Some(slice[slice.len() - 1]);
        }
        out
    }
}

/// Encode mono float samples as a 16-bit PCM WAV file.
pub fn encode_wav_pcm16(samples: &[f32], rate: u32) -> Result<Vec<u8>> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate: rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut cursor = std::io::Cursor::new(Vec::new());
    {
        let mut writer =
            hound::WavWriter::new(&mut cursor, spec).context("creating wav writer")?;
        for &s in samples {
            let v = (s.clamp(-1.0, 1.0) * 32767.0) as i16;
            writer.write_sample(v).context("writing wav sample")?;
        }
        writer.finalize().context("finalizing wav")?;
    }
    Ok(cursor.into_inner())
}

/// A run of zero samples, for TTS prerolls and spacers.
pub fn silence(rate: u32, ms: u64) -> Vec<f32> {
    vec![0.0; (rate as u64 * ms / 1000) as usize]
}
