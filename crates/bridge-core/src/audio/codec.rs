//! G.711 μ-law / A-law ↔ linear16 (PCM16) conversion.
//!
//! Chunk granularity is [`super::FRAME_MS`] at the caller's chosen sample
//! rate; these functions are pure and stateless — they never buffer partial
//! samples, any trailing-byte bookkeeping for odd-length input is the
//! caller's job (spec §4.A edge case).

const ULAW_BIAS: i16 = 0x84;
const ULAW_CLIP: i16 = 32635;

/// Encode one linear16 sample to μ-law (G.711).
pub fn linear16_to_ulaw_sample(mut sample: i16) -> u8 {
    let sign: u8 = if sample < 0 {
        sample = sample.saturating_neg();
        0x00
    } else {
        0x80
    };
    let sample = sample.min(ULAW_CLIP) + ULAW_BIAS;

    let exponent = (15 - sample.leading_zeros() as i16).clamp(0, 7);
    let mantissa = (sample >> (exponent + 3)) & 0x0f;
    let byte = (sign as i16) | (exponent << 4) | mantissa;
    !(byte as u8)
}

/// Decode one μ-law byte to a linear16 sample.
pub fn ulaw_to_linear16_sample(ulaw: u8) -> i16 {
    let ulaw = !ulaw;
    let sign = ulaw & 0x80;
    let exponent = (ulaw >> 4) & 0x07;
    let mantissa = ulaw & 0x0f;
    let mut sample = ((mantissa as i16) << 3) + ULAW_BIAS;
    sample <<= exponent;
    sample -= ULAW_BIAS;
    if sign != 0 { -sample } else { sample }
}

/// Encode a buffer of little-endian PCM16 samples to μ-law bytes.
///
/// Empty input yields empty output. An odd trailing byte is never produced
/// here — `bytes` must already be sample-aligned (an even length); callers
/// are responsible for buffering a dangling trailing byte themselves.
pub fn linear16_to_ulaw(bytes: &[u8]) -> Vec<u8> {
    bytes
        .chunks_exact(2)
        .map(|c| linear16_to_ulaw_sample(i16::from_le_bytes([c[0], c[1]])))
        .collect()
}

/// Decode μ-law bytes to little-endian PCM16.
pub fn ulaw_to_linear16(ulaw: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(ulaw.len() * 2);
    for &b in ulaw {
        out.extend_from_slice(&ulaw_to_linear16_sample(b).to_le_bytes());
    }
    out
}

const ALAW_CLIP: i16 = 32635;

/// Encode one linear16 sample to A-law (G.711).
pub fn linear16_to_alaw_sample(sample: i16) -> u8 {
    let sign: u8 = if sample >= 0 { 0x80 } else { 0x00 };
    let sample = sample.saturating_abs().min(ALAW_CLIP);

    let (exponent, mantissa) = if sample >= 256 {
        let exponent = (15 - sample.leading_zeros() as i16).clamp(1, 7);
        let mantissa = (sample >> (exponent + 3)) & 0x0f;
        (exponent, mantissa)
    } else {
        (0, sample >> 4)
    };

    let byte = sign | ((exponent as u8) << 4) | mantissa as u8;
    byte ^ 0x55
}

/// Decode one A-law byte to a linear16 sample.
pub fn alaw_to_linear16_sample(alaw: u8) -> i16 {
    let alaw = alaw ^ 0x55;
    let sign = alaw & 0x80;
    let exponent = (alaw >> 4) & 0x07;
    let mantissa = (alaw & 0x0f) as i16;

    let mut sample = if exponent == 0 {
        (mantissa << 4) + 8
    } else {
        ((mantissa << 4) + 0x108) << (exponent - 1)
    };
    if sign == 0 {
        sample = -sample;
    }
    sample
}

/// Encode a buffer of little-endian PCM16 samples to A-law bytes.
pub fn linear16_to_alaw(bytes: &[u8]) -> Vec<u8> {
    bytes
        .chunks_exact(2)
        .map(|c| linear16_to_alaw_sample(i16::from_le_bytes([c[0], c[1]])))
        .collect()
}

/// Decode A-law bytes to little-endian PCM16.
pub fn alaw_to_linear16(alaw: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(alaw.len() * 2);
    for &b in alaw {
        out.extend_from_slice(&alaw_to_linear16_sample(b).to_le_bytes());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ulaw_round_trip_identity_on_all_codes() {
        for code in 0u8..=255 {
            let linear = ulaw_to_linear16_sample(code);
            let back = linear16_to_ulaw_sample(linear);
            assert_eq!(back, code, "ulaw code {code} did not round-trip");
        }
    }

    #[test]
    fn alaw_round_trip_identity_on_all_codes() {
        for code in 0u8..=255 {
            let linear = alaw_to_linear16_sample(code);
            let back = linear16_to_alaw_sample(linear);
            assert_eq!(back, code, "alaw code {code} did not round-trip");
        }
    }

    #[test]
    fn empty_chunk_yields_empty_output() {
        assert!(linear16_to_ulaw(&[]).is_empty());
        assert!(ulaw_to_linear16(&[]).is_empty());
    }

    #[test]
    fn ulaw_buffer_round_trip() {
        let samples: Vec<i16> = vec![0, 100, -100, 32767, -32768, 1234, -1234];
        let bytes: Vec<u8> = samples.iter().flat_map(|s| s.to_le_bytes()).collect();
        let encoded = linear16_to_ulaw(&bytes);
        let decoded = ulaw_to_linear16(&encoded);
        let re_encoded = linear16_to_ulaw(&decoded);
        assert_eq!(encoded, re_encoded);
    }
}
