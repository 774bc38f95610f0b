// Copyright 2025 Chris Custine
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Wire layer for sample payloads.
//!
//! Sample arrays travel as a self-describing `.npy` container (dtype and shape
//! header followed by raw little-endian element bytes) which is then base64
//! encoded, because the RPC transport only carries text.

mod npy;

pub use npy::{decode_npy, encode_npy, NPY_MAGIC};

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use num_complex::Complex64;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that can occur while encoding or decoding a sample payload.
#[derive(Debug, Error)]
pub enum WireError {
    #[error("invalid base64 payload: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("not an npy container (bad magic)")]
    BadMagic,

    #[error("unsupported npy format version {major}.{minor}")]
    UnsupportedVersion { major: u8, minor: u8 },

    #[error("malformed npy header: {0}")]
    Header(String),

    #[error("unsupported dtype '{descr}' with shape {shape:?}")]
    UnsupportedDtype { descr: String, shape: Vec<usize> },

    #[error("payload truncated: expected {expected} data bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// How a buffer's samples are represented on the wire.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SampleFormat {
    /// `complex128` samples.
    #[default]
    ComplexFloat,
    /// Signed 16-bit real/imaginary pairs, stored as an `(N, 2)` int16 array.
    PairedInt16,
}

/// A decoded sample array.
#[derive(Debug, Clone, PartialEq)]
pub enum SampleArray {
    /// Complex floating point samples.
    Complex(Vec<Complex64>),
    /// Quantized real/imaginary pairs.
    PairedI16(Vec<[i16; 2]>),
}

impl SampleArray {
    /// Build the wire representation of `samples` for the given format.
    ///
    /// Paired integer output truncates toward zero and saturates at the
    /// int16 range.
    #[must_use]
    pub fn from_complex(samples: &[Complex64], format: SampleFormat) -> Self {
        match format {
            SampleFormat::ComplexFloat => Self::Complex(samples.to_vec()),
            SampleFormat::PairedInt16 => Self::PairedI16(
                samples
                    .iter()
                    .map(|s| [quantize_i16(s.re), quantize_i16(s.im)])
                    .collect(),
            ),
        }
    }

    /// Number of samples.
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::Complex(v) => v.len(),
            Self::PairedI16(v) => v.len(),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Convert to complex samples.
    #[must_use]
    pub fn into_complex(self) -> Vec<Complex64> {
        match self {
            Self::Complex(v) => v,
            Self::PairedI16(v) => v
                .into_iter()
                .map(|[re, im]| Complex64::new(f64::from(re), f64::from(im)))
                .collect(),
        }
    }
}

/// Truncate toward zero into the int16 range (NaN maps to 0).
#[must_use]
pub fn quantize_i16(value: f64) -> i16 {
    #[allow(
        clippy::cast_possible_truncation,
        reason = "float to int casts saturate, truncation toward zero is the quantization rule"
    )]
    let quantized = value as i16;
    quantized
}

/// Encode an array as base64 text ready to be sent as an RPC string.
pub fn encode_payload(array: &SampleArray) -> Result<String, WireError> {
    Ok(STANDARD.encode(encode_npy(array)?))
}

/// Decode a base64 text payload.
///
/// Whitespace is ignored, since some RPC servers wrap long base64 lines.
pub fn decode_payload(text: &str) -> Result<SampleArray, WireError> {
    let compact: String = text.chars().filter(|c| !c.is_ascii_whitespace()).collect();
    let bytes = STANDARD.decode(compact.as_bytes())?;
    decode_npy(&bytes)
}

/// Decode a payload that arrived as raw bytes.
///
/// The bytes are either the npy container itself or the base64 text of one.
pub fn decode_payload_bytes(bytes: &[u8]) -> Result<SampleArray, WireError> {
    if bytes.starts_with(NPY_MAGIC) {
        return decode_npy(bytes);
    }
    let text = String::from_utf8_lossy(bytes);
    decode_payload(&text)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quantize_truncates_toward_zero() {
        assert_eq!(quantize_i16(1.9), 1);
        assert_eq!(quantize_i16(-1.9), -1);
        assert_eq!(quantize_i16(40000.0), i16::MAX);
        assert_eq!(quantize_i16(-40000.0), i16::MIN);
        assert_eq!(quantize_i16(f64::NAN), 0);
    }

    #[test]
    fn test_payload_complex_samples() {
        let samples = vec![
            Complex64::new(0.5, -0.25),
            Complex64::new(-1.0, 2.0),
            Complex64::new(0.0, 0.0),
        ];
        let text = encode_payload(&SampleArray::Complex(samples.clone())).unwrap();
        let decoded = decode_payload(&text).unwrap();
        assert_eq!(decoded, SampleArray::Complex(samples));
    }

    #[test]
    fn test_payload_tolerates_wrapped_lines() {
        let array = SampleArray::PairedI16(vec![[1, -1]; 64]);
        let text = encode_payload(&array).unwrap();
        let wrapped: String = text
            .as_bytes()
            .chunks(76)
            .map(|chunk| format!("{}\n", String::from_utf8_lossy(chunk)))
            .collect();
        assert_eq!(decode_payload(&wrapped).unwrap(), array);
    }

    #[test]
    fn test_payload_bytes_accepts_raw_and_text() {
        let array = SampleArray::PairedI16(vec![[32767, 0], [0, -32767]]);
        let raw = encode_npy(&array).unwrap();
        assert_eq!(decode_payload_bytes(&raw).unwrap(), array);

        let text = encode_payload(&array).unwrap();
        assert_eq!(decode_payload_bytes(text.as_bytes()).unwrap(), array);
    }

    #[test]
    fn test_from_complex_paired() {
        let samples = [Complex64::new(100.7, -100.7), Complex64::new(0.2, 0.9)];
        let array = SampleArray::from_complex(&samples, SampleFormat::PairedInt16);
        assert_eq!(array, SampleArray::PairedI16(vec![[100, -100], [0, 0]]));
        assert_eq!(
            array.into_complex(),
            vec![Complex64::new(100.0, -100.0), Complex64::new(0.0, 0.0)]
        );
    }

    #[test]
    fn test_invalid_base64_is_reported() {
        assert!(matches!(decode_payload("@@@"), Err(WireError::Base64(_))));
    }
}
