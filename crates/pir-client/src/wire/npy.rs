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

//! NumPy `.npy` container codec.
//!
//! Layout:
//! ```text
//! \x93NUMPY <major u8> <minor u8> <header_len u16|u32 LE> <header dict> <data>
//! ```
//! The header is a Python dict literal such as
//! `{'descr': '<c16', 'fortran_order': False, 'shape': (4096,), }`, padded with
//! spaces and terminated by a newline so that the data starts 64-byte aligned.

use std::io::{Cursor, Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use num_complex::Complex64;

use super::{SampleArray, WireError};

/// Magic prefix of every npy container.
pub const NPY_MAGIC: &[u8] = b"\x93NUMPY";

const HEADER_ALIGNMENT: usize = 64;

/// Element types understood by the decoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Dtype {
    Complex128,
    Complex64,
    Float64,
    Float32,
    Int16,
    Int32,
}

impl Dtype {
    fn parse(descr: &str) -> Option<Self> {
        match descr {
            "<c16" => Some(Self::Complex128),
            "<c8" => Some(Self::Complex64),
            "<f8" => Some(Self::Float64),
            "<f4" => Some(Self::Float32),
            "<i2" => Some(Self::Int16),
            "<i4" => Some(Self::Int32),
            _ => None,
        }
    }

    fn item_size(self) -> usize {
        match self {
            Self::Complex128 => 16,
            Self::Complex64 | Self::Float64 => 8,
            Self::Float32 | Self::Int32 => 4,
            Self::Int16 => 2,
        }
    }
}

#[derive(Debug)]
struct Header {
    descr: String,
    fortran_order: bool,
    shape: Vec<usize>,
}

/// Serialize a sample array into an npy v1.0 container.
pub fn encode_npy(array: &SampleArray) -> Result<Vec<u8>, WireError> {
    let (descr, shape) = match array {
        SampleArray::Complex(v) => ("<c16", format!("({},)", v.len())),
        SampleArray::PairedI16(v) => ("<i2", format!("({}, 2)", v.len())),
    };

    let mut header = format!("{{'descr': '{descr}', 'fortran_order': False, 'shape': {shape}, }}");
    let preamble = NPY_MAGIC.len() + 2 + 2;
    let unpadded = preamble + header.len() + 1;
    let padding = (HEADER_ALIGNMENT - unpadded % HEADER_ALIGNMENT) % HEADER_ALIGNMENT;
    header.extend(std::iter::repeat(' ').take(padding));
    header.push('\n');

    let mut out = Vec::with_capacity(unpadded + padding + array.len() * 16);
    out.write_all(NPY_MAGIC)?;
    if let Ok(len) = u16::try_from(header.len()) {
        out.write_u8(1)?;
        out.write_u8(0)?;
        out.write_u16::<LittleEndian>(len)?;
    } else {
        let len = u32::try_from(header.len())
            .map_err(|e| WireError::Header(format!("header too long: {e}")))?;
        out.write_u8(2)?;
        out.write_u8(0)?;
        out.write_u32::<LittleEndian>(len)?;
    }
    out.write_all(header.as_bytes())?;

    match array {
        SampleArray::Complex(samples) => {
            for s in samples {
                out.write_f64::<LittleEndian>(s.re)?;
                out.write_f64::<LittleEndian>(s.im)?;
            }
        }
        SampleArray::PairedI16(pairs) => {
            for [re, im] in pairs {
                out.write_i16::<LittleEndian>(*re)?;
                out.write_i16::<LittleEndian>(*im)?;
            }
        }
    }

    Ok(out)
}

/// Parse an npy container into a sample array.
///
/// One-dimensional complex and real arrays become complex samples. Integer
/// arrays must have shape `(N, 2)` and are read as real/imaginary pairs.
pub fn decode_npy(bytes: &[u8]) -> Result<SampleArray, WireError> {
    let mut cursor = Cursor::new(bytes);

    let mut magic = [0u8; 6];
    cursor.read_exact(&mut magic).map_err(|_e| WireError::BadMagic)?;
    if magic.as_slice() != NPY_MAGIC {
        return Err(WireError::BadMagic);
    }

    let major = cursor.read_u8()?;
    let minor = cursor.read_u8()?;
    let header_len = match major {
        1 => usize::from(cursor.read_u16::<LittleEndian>()?),
        2 | 3 => usize::try_from(cursor.read_u32::<LittleEndian>()?)
            .map_err(|e| WireError::Header(e.to_string()))?,
        _ => return Err(WireError::UnsupportedVersion { major, minor }),
    };

    #[allow(
        clippy::cast_possible_truncation,
        reason = "cursor position never exceeds the slice length"
    )]
    let header_start = cursor.position() as usize;
    let data_start = header_start + header_len;
    let header_bytes = bytes.get(header_start..data_start).ok_or(WireError::Truncated {
        expected: header_len,
        actual: bytes.len().saturating_sub(header_start),
    })?;
    let header_text = std::str::from_utf8(header_bytes)
        .map_err(|e| WireError::Header(format!("header is not text: {e}")))?;
    let header = parse_header(header_text)?;

    let unsupported = || WireError::UnsupportedDtype {
        descr: header.descr.clone(),
        shape: header.shape.clone(),
    };
    let dtype = Dtype::parse(&header.descr).ok_or_else(unsupported)?;

    let data = &bytes[data_start..];
    let expected = header
        .shape
        .iter()
        .try_fold(dtype.item_size(), |acc, &dim| acc.checked_mul(dim))
        .ok_or_else(|| WireError::Header(format!("shape {:?} is too large", header.shape)))?;
    if data.len() < expected {
        return Err(WireError::Truncated {
            expected,
            actual: data.len(),
        });
    }
    let mut data = Cursor::new(&data[..expected]);

    match (dtype, header.shape.as_slice()) {
        (Dtype::Complex128, [n]) => {
            let mut samples = Vec::with_capacity(*n);
            for _ in 0..*n {
                let re = data.read_f64::<LittleEndian>()?;
                let im = data.read_f64::<LittleEndian>()?;
                samples.push(Complex64::new(re, im));
            }
            Ok(SampleArray::Complex(samples))
        }
        (Dtype::Complex64, [n]) => {
            let mut samples = Vec::with_capacity(*n);
            for _ in 0..*n {
                let re = data.read_f32::<LittleEndian>()?;
                let im = data.read_f32::<LittleEndian>()?;
                samples.push(Complex64::new(f64::from(re), f64::from(im)));
            }
            Ok(SampleArray::Complex(samples))
        }
        (Dtype::Float64, [n]) => (0..*n)
            .map(|_| -> Result<Complex64, WireError> {
                Ok(Complex64::new(data.read_f64::<LittleEndian>()?, 0.0))
            })
            .collect::<Result<Vec<_>, _>>()
            .map(SampleArray::Complex),
        (Dtype::Float32, [n]) => (0..*n)
            .map(|_| -> Result<Complex64, WireError> {
                Ok(Complex64::new(f64::from(data.read_f32::<LittleEndian>()?), 0.0))
            })
            .collect::<Result<Vec<_>, _>>()
            .map(SampleArray::Complex),
        (Dtype::Int16, [n, 2]) => {
            let flat = (0..n * 2)
                .map(|_| data.read_i16::<LittleEndian>())
                .collect::<Result<Vec<_>, _>>()?;
            Ok(SampleArray::PairedI16(unflatten_pairs(
                &flat,
                *n,
                header.fortran_order,
            )))
        }
        (Dtype::Int32, [n, 2]) => {
            let flat = (0..n * 2)
                .map(|_| data.read_i32::<LittleEndian>())
                .collect::<Result<Vec<_>, _>>()?;
            let samples = unflatten_pairs(&flat, *n, header.fortran_order)
                .into_iter()
                .map(|[re, im]| Complex64::new(f64::from(re), f64::from(im)))
                .collect();
            Ok(SampleArray::Complex(samples))
        }
        _ => Err(unsupported()),
    }
}

/// Regroup a flat `(n, 2)` array into pairs, honouring the storage order.
fn unflatten_pairs<T: Copy>(flat: &[T], n: usize, fortran_order: bool) -> Vec<[T; 2]> {
    if fortran_order {
        (0..n).map(|i| [flat[i], flat[n + i]]).collect()
    } else {
        flat.chunks_exact(2).map(|c| [c[0], c[1]]).collect()
    }
}

fn parse_header(text: &str) -> Result<Header, WireError> {
    let descr_raw = dict_value(text, "descr")?;
    let quote = descr_raw
        .chars()
        .next()
        .filter(|c| *c == '\'' || *c == '"')
        .ok_or_else(|| WireError::UnsupportedDtype {
            descr: descr_raw.chars().take(32).collect(),
            shape: Vec::new(),
        })?;
    let descr_body = &descr_raw[1..];
    let end = descr_body
        .find(quote)
        .ok_or_else(|| WireError::Header("unterminated descr".to_string()))?;
    let descr = descr_body[..end].to_string();

    let fortran_raw = dict_value(text, "fortran_order")?;
    let fortran_order = if fortran_raw.starts_with("True") {
        true
    } else if fortran_raw.starts_with("False") {
        false
    } else {
        return Err(WireError::Header("invalid fortran_order".to_string()));
    };

    let shape_raw = dict_value(text, "shape")?;
    let shape_body = shape_raw
        .strip_prefix('(')
        .and_then(|s| s.find(')').map(|end| &s[..end]))
        .ok_or_else(|| WireError::Header("invalid shape".to_string()))?;
    let shape = shape_body
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<usize>()
                .map_err(|e| WireError::Header(format!("invalid shape entry '{s}': {e}")))
        })
        .collect::<Result<Vec<_>, _>>()?;

    Ok(Header {
        descr,
        fortran_order,
        shape,
    })
}

/// Locate the text following `'key':` in the header dict.
fn dict_value<'a>(text: &'a str, key: &str) -> Result<&'a str, WireError> {
    let found = [format!("'{key}'"), format!("\"{key}\"")]
        .iter()
        .find_map(|needle| text.find(needle.as_str()).map(|pos| pos + needle.len()));
    let start = found.ok_or_else(|| WireError::Header(format!("missing key '{key}'")))?;
    text[start..]
        .trim_start()
        .strip_prefix(':')
        .map(str::trim_start)
        .ok_or_else(|| WireError::Header(format!("missing value for '{key}'")))
}
