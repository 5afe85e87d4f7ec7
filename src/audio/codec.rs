//! # Inbound Audio Decoding
//!
//! Three input formats reach the pipeline:
//! - **Text frames**: JSON `{"samples": [...], "timestamp": 1712}`; the browser
//!   client sends the samples under `audio`, which is accepted as an alias
//! - **Binary frames**: Raw little-endian `f32` samples, no timestamp
//! - **WAV uploads**: PCM or float WAV files for one-shot classification,
//!   mixed down to mono
//!
//! Every decoder rejects non-finite samples and chunks above the configured limit.

use crate::audio::InputChunk;
use byteorder::{ByteOrder, LittleEndian};
use serde::Deserialize;
use std::fmt;
use std::io::Cursor;

#[derive(Debug, Clone, PartialEq)]
pub enum CodecError {
    InvalidJson(String),
    MisalignedBinary(usize),
    NonFiniteSample(usize),
    TooManySamples { got: usize, max: usize },
    InvalidWav(String),
}

impl CodecError {
    /// Short machine-readable code sent in error frames.
    pub fn code(&self) -> &'static str {
        match self {
            CodecError::InvalidJson(_) => "invalid_json",
            CodecError::MisalignedBinary(_) => "misaligned_binary",
            CodecError::NonFiniteSample(_) => "non_finite_sample",
            CodecError::TooManySamples { .. } => "chunk_too_large",
            CodecError::InvalidWav(_) => "invalid_wav",
        }
    }
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CodecError::InvalidJson(msg) => write!(f, "Invalid audio message: {}", msg),
            CodecError::MisalignedBinary(len) => {
                write!(f, "Binary frame of {} bytes is not a whole number of f32 samples", len)
            }
            CodecError::NonFiniteSample(idx) => write!(f, "Sample {} is not a finite number", idx),
            CodecError::TooManySamples { got, max } => {
                write!(f, "Chunk has {} samples, the limit is {}", got, max)
            }
            CodecError::InvalidWav(msg) => write!(f, "Invalid WAV file: {}", msg),
        }
    }
}

impl std::error::Error for CodecError {}

#[derive(Debug, Deserialize)]
struct TextFrame {
    #[serde(alias = "audio")]
    samples: Vec<f32>,

    #[serde(default)]
    timestamp: Option<i64>,
}

fn check_samples(samples: &[f32], max_samples: usize) -> Result<(), CodecError> {
    if samples.len() > max_samples {
        return Err(CodecError::TooManySamples { got: samples.len(), max: max_samples });
    }
    match samples.iter().position(|s| !s.is_finite()) {
        Some(idx) => Err(CodecError::NonFiniteSample(idx)),
        None => Ok(()),
    }
}

/// Decode a JSON text frame.
pub fn decode_text_frame(text: &str, max_samples: usize) -> Result<InputChunk, CodecError> {
    let frame: TextFrame = serde_json::from_str(text).map_err(|e| CodecError::InvalidJson(e.to_string()))?;
    check_samples(&frame.samples, max_samples)?;
    Ok(InputChunk::new(frame.samples, frame.timestamp))
}

/// Decode a binary frame of little-endian `f32` samples.
pub fn decode_binary_frame(bytes: &[u8], max_samples: usize) -> Result<InputChunk, CodecError> {
    if bytes.len() % 4 != 0 {
        return Err(CodecError::MisalignedBinary(bytes.len()));
    }

    let count = bytes.len() / 4;
    if count > max_samples {
        return Err(CodecError::TooManySamples { got: count, max: max_samples });
    }

    let mut samples = vec![0.0f32; count];
    LittleEndian::read_f32_into(bytes, &mut samples);
    check_samples(&samples, max_samples)?;
    Ok(InputChunk::new(samples, None))
}

/// Upper bound on the text of one JSON sample, separator included.
///
/// Browsers print samples as shortest round-trip doubles, which top out near
/// `-1.2345678901234567e-10,`.
const JSON_SAMPLE_BYTES: usize = 32;

/// Room for the object keys and the timestamp around the sample array.
const FRAME_OVERHEAD_BYTES: usize = 1024;

/// Largest WebSocket frame a chunk of `max_samples` samples can arrive in.
///
/// Sized for JSON text frames, which also covers binary frames at 4 bytes per
/// sample. Anything larger would be rejected by the sample limit anyway.
pub fn max_frame_bytes(max_samples: usize) -> usize {
    max_samples
        .saturating_mul(JSON_SAMPLE_BYTES)
        .saturating_add(FRAME_OVERHEAD_BYTES)
}

/// A decoded WAV upload.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedWav {
    pub sample_rate: u32,
    pub channels: u16,

    /// Mono samples in [-1, 1]
    pub samples: Vec<f32>,
}

/// Decode a WAV file and average its channels to mono.
///
/// ## Supported Encodings:
/// 8-bit unsigned, 16/24-bit signed PCM, and 32-bit float.
pub fn decode_wav(bytes: &[u8]) -> Result<DecodedWav, CodecError> {
    let invalid = |e: hound::Error| CodecError::InvalidWav(e.to_string());
    let mut reader = hound::WavReader::new(Cursor::new(bytes)).map_err(invalid)?;
    let spec = reader.spec();

    let interleaved: Vec<f32> = match (spec.sample_format, spec.bits_per_sample) {
        (hound::SampleFormat::Int, bits @ (8 | 16 | 24)) => {
            // hound hands out 8-bit PCM already shifted to signed
            let scale = 1.0 / (1i32 << (bits - 1)) as f32;
            reader
                .samples::<i32>()
                .map(|s| s.map(|s| s as f32 * scale))
                .collect::<Result<_, _>>()
                .map_err(invalid)?
        }
        (hound::SampleFormat::Float, 32) => reader.samples::<f32>().collect::<Result<_, _>>().map_err(invalid)?,
        (format, bits) => {
            return Err(CodecError::InvalidWav(format!("unsupported encoding: {:?} at {} bits", format, bits)));
        }
    };
    if interleaved.is_empty() {
        return Err(CodecError::InvalidWav("no audio data".to_string()));
    }

    let channels = spec.channels.max(1);
    let samples = mix_to_mono(&interleaved, channels as usize);
    if let Some(idx) = samples.iter().position(|s| !s.is_finite()) {
        return Err(CodecError::NonFiniteSample(idx));
    }

    Ok(DecodedWav {
        sample_rate: spec.sample_rate,
        channels,
        samples,
    })
}

/// Average interleaved frames into a single channel. A trailing partial frame is dropped.
pub fn mix_to_mono(interleaved: &[f32], channels: usize) -> Vec<f32> {
    if channels <= 1 {
        return interleaved.to_vec();
    }
    interleaved
        .chunks_exact(channels)
        .map(|frame| frame.iter().sum::<f32>() / channels as f32)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_text_frame_accepts_samples_and_audio_keys() {
        let chunk = decode_text_frame(r#"{"samples": [0.1, -0.2], "timestamp": 1712}"#, 10).unwrap();
        assert_eq!(chunk.samples, vec![0.1, -0.2]);
        assert_eq!(chunk.timestamp, Some(1712));

        let chunk = decode_text_frame(r#"{"audio": [0.5]}"#, 10).unwrap();
        assert_eq!(chunk.samples, vec![0.5]);
        assert_eq!(chunk.timestamp, None);
    }

    #[test]
    fn test_text_frame_rejections() {
        assert_eq!(decode_text_frame("not json", 10).unwrap_err().code(), "invalid_json");
        assert_eq!(decode_text_frame(r#"{"timestamp": 1}"#, 10).unwrap_err().code(), "invalid_json");
        assert_eq!(
            decode_text_frame(r#"{"samples": [0, 0, 0]}"#, 2).unwrap_err(),
            CodecError::TooManySamples { got: 3, max: 2 }
        );
    }

    #[test]
    fn test_binary_frame_little_endian() {
        let mut bytes = Vec::new();
        for sample in [0.25f32, -1.0, 0.5] {
            bytes.extend_from_slice(&sample.to_le_bytes());
        }
        let chunk = decode_binary_frame(&bytes, 10).unwrap();
        assert_eq!(chunk.samples, vec![0.25, -1.0, 0.5]);
        assert!(chunk.timestamp.is_none());
    }

    #[test]
    fn test_binary_frame_rejections() {
        assert_eq!(decode_binary_frame(&[0, 0, 0], 10).unwrap_err(), CodecError::MisalignedBinary(3));

        let nan = f32::NAN.to_le_bytes();
        assert_eq!(decode_binary_frame(&nan, 10).unwrap_err(), CodecError::NonFiniteSample(0));

        assert_eq!(decode_binary_frame(&[0u8; 16], 2).unwrap_err().code(), "chunk_too_large");
    }

    #[test]
    fn test_mix_to_mono() {
        assert_eq!(mix_to_mono(&[0.25, 0.75, -1.0, 1.0, 0.5], 2), vec![0.5, 0.0]);
        assert_eq!(mix_to_mono(&[0.1, 0.2], 1), vec![0.1, 0.2]);
    }

    fn wav_file(spec: hound::WavSpec, write: impl FnOnce(&mut hound::WavWriter<&mut Cursor<Vec<u8>>>)) -> Vec<u8> {
        let mut cursor = Cursor::new(Vec::new());
        let mut writer = hound::WavWriter::new(&mut cursor, spec).unwrap();
        write(&mut writer);
        writer.finalize().unwrap();
        cursor.into_inner()
    }

    #[test]
    fn test_decode_wav_stereo_pcm16() {
        let spec = hound::WavSpec {
            channels: 2,
            sample_rate: 16000,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let bytes = wav_file(spec, |w| {
            for s in [16384i16, 0, -16384, -16384] {
                w.write_sample(s).unwrap();
            }
        });

        let decoded = decode_wav(&bytes).unwrap();
        assert_eq!(decoded.sample_rate, 16000);
        assert_eq!(decoded.channels, 2);
        assert_eq!(decoded.samples, vec![0.25, -0.5]);
    }

    #[test]
    fn test_decode_wav_float_and_8bit() {
        let float = hound::WavSpec {
            channels: 1,
            sample_rate: 44100,
            bits_per_sample: 32,
            sample_format: hound::SampleFormat::Float,
        };
        let bytes = wav_file(float, |w| {
            for s in [0.5f32, -0.25] {
                w.write_sample(s).unwrap();
            }
        });
        let decoded = decode_wav(&bytes).unwrap();
        assert_eq!(decoded.sample_rate, 44100);
        assert_eq!(decoded.samples, vec![0.5, -0.25]);

        let eight = hound::WavSpec {
            bits_per_sample: 8,
            sample_format: hound::SampleFormat::Int,
            ..float
        };
        let bytes = wav_file(eight, |w| {
            for s in [64i8, -128] {
                w.write_sample(s).unwrap();
            }
        });
        assert_eq!(decode_wav(&bytes).unwrap().samples, vec![0.5, -1.0]);
    }

    #[test]
    fn test_decode_wav_rejects_empty_data() {
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: 16000,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let bytes = wav_file(spec, |_| {});
        assert_eq!(decode_wav(&bytes).unwrap_err().code(), "invalid_wav");
    }

    #[test]
    fn test_max_frame_bytes_fits_json_chunks() {
        // A 16384-sample browser chunk at full double precision
        let samples = vec![-0.012345678901234567f64; 16384];
        let text = serde_json::json!({"audio": samples, "timestamp": 1712}).to_string();
        assert!(text.len() > 64 * 1024);
        assert!(text.len() <= max_frame_bytes(16384));

        assert!(max_frame_bytes(16384) >= 16384 * 4);
        assert_eq!(max_frame_bytes(usize::MAX), usize::MAX);
    }

    #[test]
    fn test_decode_wav_rejects_garbage() {
        assert_eq!(decode_wav(b"RIFF????nope").unwrap_err().code(), "invalid_wav");
    }
}
