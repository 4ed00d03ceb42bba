//! Audio Format Utilities
//!
//! Downmix, resample and PCM encoding for outbound frames.

use rubato::{FftFixedIn, Resampler};

/// Frame-scoped conversion errors. These drop only the affected frame;
/// capture continues.
#[derive(Debug, thiserror::Error)]
pub enum FormatError {
    #[error("failed to create resampler: {0}")]
    ResamplerInit(String),

    #[error("resampling failed: {0}")]
    Resample(String),
}

/// Downmix interleaved multi-channel samples to mono by averaging.
pub fn downmix_to_mono(samples: &[f32], channels: usize) -> Vec<f32> {
    if channels <= 1 {
        return samples.to_vec();
    }
    samples
        .chunks(channels)
        .map(|chunk| chunk.iter().sum::<f32>() / channels as f32)
        .collect()
}

/// Resample mono audio from `from_rate` to `to_rate`.
pub fn resample(samples: &[f32], from_rate: u32, to_rate: u32) -> Result<Vec<f32>, FormatError> {
    if from_rate == to_rate || samples.is_empty() {
        return Ok(samples.to_vec());
    }

    // Chunk size must suit the FFT resampler.
    let chunk_size = 1024;

    let mut resampler = FftFixedIn::<f32>::new(
        from_rate as usize,
        to_rate as usize,
        chunk_size,
        2, // sub_chunks
        1, // channels (mono)
    )
    .map_err(|e| FormatError::ResamplerInit(e.to_string()))?;

    let mut output = Vec::new();
    let mut pos = 0;

    while pos < samples.len() {
        let end = (pos + chunk_size).min(samples.len());
        let mut chunk = samples[pos..end].to_vec();

        if chunk.len() < chunk_size {
            chunk.resize(chunk_size, 0.0);
        }

        let input = vec![chunk];
        let resampled = resampler
            .process(&input, None)
            .map_err(|e| FormatError::Resample(e.to_string()))?;
        if !resampled.is_empty() {
            output.extend_from_slice(&resampled[0]);
        }

        pos += chunk_size;
    }

    Ok(output)
}

/// Encode f32 samples as 16-bit little-endian PCM bytes.
pub fn encode_pcm16(samples: &[f32]) -> Vec<u8> {
    let mut pcm = Vec::with_capacity(samples.len() * 2);
    for &sample in samples {
        let clamped = sample.clamp(-1.0, 1.0);
        let i16_sample = (clamped * 32767.0) as i16;
        pcm.extend_from_slice(&i16_sample.to_le_bytes());
    }
    pcm
}

/// Root-mean-square energy of a sample window.
pub fn rms_energy(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    (samples.iter().map(|s| s * s).sum::<f32>() / samples.len() as f32).sqrt()
}

/// Audio duration for a sample count at a given rate.
pub fn duration_ms(sample_count: usize, sample_rate: u32) -> u64 {
    (sample_count as u64 * 1000) / sample_rate as u64
}
