//! Fingerprint encodings
//!
//! The binary form is the persisted column: exactly `ceil(num_bits / 8)` bytes,
//! bit `i` at byte `i / 8`, position `i % 8`. Hex and base64 are derived from it.

use crate::bits::{byte_len, word_len, BitVector};
use crate::error::{MolvecError, Result};
use crate::types::FingerprintPayload;
use base64::{engine::general_purpose::STANDARD, Engine};

/// Stateless encoder/decoder for fingerprint bits
#[derive(Debug, Clone, Copy, Default)]
pub struct FingerprintCodec;

impl FingerprintCodec {
    /// Encode to the compact binary layout
    pub fn encode(bits: &BitVector) -> Vec<u8> {
        let len = byte_len(bits.num_bits());
        let mut out = Vec::with_capacity(len);
        for word in bits.words() {
            out.extend_from_slice(&word.to_le_bytes());
        }
        out.truncate(len);
        out
    }

    /// Decode the compact binary layout
    ///
    /// Rejects a zero width, a byte length other than `ceil(num_bits / 8)`,
    /// and set bits past `num_bits`.
    pub fn decode(bytes: &[u8], num_bits: usize) -> Result<BitVector> {
        if num_bits == 0 {
            return Err(MolvecError::MalformedFingerprint(
                "num_bits must be positive".into(),
            ));
        }
        let expected = byte_len(num_bits);
        if bytes.len() != expected {
            return Err(MolvecError::MalformedFingerprint(format!(
                "expected {} bytes for {} bits, got {}",
                expected,
                num_bits,
                bytes.len()
            )));
        }

        let mut words = Vec::with_capacity(word_len(num_bits));
        for chunk in bytes.chunks(8) {
            let mut buf = [0u8; 8];
            buf[..chunk.len()].copy_from_slice(chunk);
            words.push(u64::from_le_bytes(buf));
        }

        let tail = num_bits % 64;
        if tail != 0 {
            if let Some(last) = words.last() {
                if last >> tail != 0 {
                    return Err(MolvecError::MalformedFingerprint(format!(
                        "padding bits set beyond bit {}",
                        num_bits
                    )));
                }
            }
        }

        Ok(BitVector::from_words(words, num_bits))
    }

    /// Dense `0.0 / 1.0` vector, L2-normalized; all-zero input stays all-zero
    pub fn to_float_vector(bits: &BitVector) -> Vec<f32> {
        let mut out = vec![0.0f32; bits.num_bits()];
        let on = bits.on_bits();
        if on.is_empty() {
            return out;
        }
        let value = 1.0 / (on.len() as f32).sqrt();
        for pos in on {
            out[pos] = value;
        }
        out
    }

    /// Lowercase hex of the binary layout
    pub fn to_hex(bits: &BitVector) -> String {
        hex::encode(Self::encode(bits))
    }

    /// Inverse of [`FingerprintCodec::to_hex`]
    pub fn from_hex(s: &str, num_bits: usize) -> Result<BitVector> {
        let bytes = hex::decode(s.trim())
            .map_err(|e| MolvecError::MalformedFingerprint(format!("invalid hex: {}", e)))?;
        Self::decode(&bytes, num_bits)
    }

    /// Standard-alphabet base64 of the binary layout
    pub fn to_base64(bits: &BitVector) -> String {
        STANDARD.encode(Self::encode(bits))
    }

    /// Inverse of [`FingerprintCodec::to_base64`]
    pub fn from_base64(s: &str, num_bits: usize) -> Result<BitVector> {
        let bytes = STANDARD
            .decode(s.trim())
            .map_err(|e| MolvecError::MalformedFingerprint(format!("invalid base64: {}", e)))?;
        Self::decode(&bytes, num_bits)
    }

    /// Decode whichever representation a query carried
    pub fn decode_payload(payload: &FingerprintPayload, num_bits: usize) -> Result<BitVector> {
        match payload {
            FingerprintPayload::Bytes(bytes) => Self::decode(bytes, num_bits),
            FingerprintPayload::Hex(s) => Self::from_hex(s, num_bits),
            FingerprintPayload::Base64(s) => Self::from_base64(s, num_bits),
        }
    }
}
