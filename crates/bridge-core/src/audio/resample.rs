//! Polyphase resampling between the telephony and provider sample rates
//! (8 kHz / 16 kHz / 24 kHz), spec §4.A.
//!
//! One [`Resampler`] is constructed per call direction and reused for the
//! lifetime of the call — `rubato`'s FFT resampler amortizes its filter
//! design cost across chunks, same rationale as `whis-core::resample`.

use anyhow::{Context, Result};
use rubato::{FftFixedIn, Resampler as _};

/// Converts little-endian PCM16 mono audio between sample rates.
pub struct Resampler {
    inner: Option<FftFixedIn<f32>>,
    source_rate: u32,
    target_rate: u32,
    chunk_size: usize,
    /// Bytes left over from the previous call that didn't make a full sample.
    carry: Vec<u8>,
}

impl Resampler {
    pub fn new(source_rate: u32, target_rate: u32) -> Result<Self> {
        if source_rate == target_rate {
            return Ok(Self {
                inner: None,
                source_rate,
                target_rate,
                chunk_size: 0,
                carry: Vec::new(),
            });
        }
        let chunk_size = (source_rate as usize) / 50; // 20ms at source rate
        let inner = FftFixedIn::<f32>::new(source_rate as usize, target_rate as usize, chunk_size, 2, 1)
            .context("failed to construct polyphase resampler")?;
        Ok(Self {
            inner: Some(inner),
            source_rate,
            target_rate,
            chunk_size,
            carry: Vec::new(),
        })
    }

    pub fn source_rate(&self) -> u32 {
        self.source_rate
    }

    pub fn target_rate(&self) -> u32 {
        self.target_rate
    }

    /// Resample a buffer of little-endian PCM16 mono bytes.
    ///
    /// Trailing bytes that don't complete a 16-bit sample are buffered
    /// internally and prefixed to the next call (spec §4.A edge case: this
    /// buffering lives in the caller-facing wrapper, never inside the
    /// underlying resampler's per-chunk math).
    pub fn process(&mut self, input: &[u8]) -> Result<Vec<u8>> {
        if input.is_empty() {
            return Ok(Vec::new());
        }

        let mut buf = std::mem::take(&mut self.carry);
        buf.extend_from_slice(input);
        if buf.len() % 2 != 0 {
            if let Some(trailing) = buf.pop() {
                self.carry = vec![trailing];
            }
        }

        if self.source_rate == self.target_rate {
            return Ok(buf);
        }

        let samples: Vec<f32> = buf
            .chunks_exact(2)
            .map(|c| i16::from_le_bytes([c[0], c[1]]) as f32 / i16::MAX as f32)
            .collect();

        let Some(resampler) = self.inner.as_mut() else {
            return Ok(buf);
        };
        let mut out_samples = Vec::with_capacity(samples.len() * 2);
        for chunk in samples.chunks(self.chunk_size) {
            let mut padded = chunk.to_vec();
            let pad_len = padded.len();
            if padded.len() < self.chunk_size {
                padded.resize(self.chunk_size, 0.0);
            }
            let result = resampler
                .process(&[padded], None)
                .context("resampling failed")?;
            // Proportionally trim padding from the tail of the last partial chunk.
            let keep = if pad_len < self.chunk_size {
                (result[0].len() * pad_len) / self.chunk_size
            } else {
                result[0].len()
            };
            out_samples.extend_from_slice(&result[0][..keep]);
        }

        let mut out_bytes = Vec::with_capacity(out_samples.len() * 2);
        for s in out_samples {
            let clamped = (s.clamp(-1.0, 1.0) * i16::MAX as f32) as i16;
            out_bytes.extend_from_slice(&clamped.to_le_bytes());
        }
        Ok(out_bytes)
    }
}
