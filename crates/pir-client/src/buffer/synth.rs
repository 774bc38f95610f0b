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

//! Waveform generators for output channels.
//!
//! Tones use the sampler's quadrature convention `sin(φ) − j·cos(φ)`.

use std::f64::consts::PI;

use num_complex::Complex64;

/// Constant level.
#[must_use]
pub fn dc(len: usize, level: f64) -> Vec<Complex64> {
    vec![Complex64::new(level, 0.0); len]
}

/// Complex tone at `freq` Hz starting at `phase` radians.
#[must_use]
#[allow(clippy::cast_precision_loss, reason = "sample indices are far below 2^52")]
pub fn sine(len: usize, freq: f64, phase: f64, sample_rate: f64, amplitude: f64) -> Vec<Complex64> {
    let advance = 2.0 * PI * freq / sample_rate;
    (0..len)
        .map(|i| quadrature(phase + i as f64 * advance, amplitude))
        .collect()
}

/// Linear sweep from `freq_start` to `freq_end`, repeated `repeat_count` times
/// across `len` samples. The last repetition is cut short when `len` is not a
/// multiple of `repeat_count`.
#[must_use]
#[allow(clippy::cast_precision_loss, reason = "sample indices are far below 2^52")]
pub fn chirp(
    len: usize,
    freq_start: f64,
    freq_end: f64,
    phase: f64,
    repeat_count: usize,
    sample_rate: f64,
    amplitude: f64,
) -> Vec<Complex64> {
    if len == 0 || repeat_count == 0 {
        return Vec::new();
    }
    let segment = len.div_ceil(repeat_count);
    let duration = segment as f64 / sample_rate;
    let rate = (freq_end - freq_start) / duration;

    (0..len)
        .map(|i| {
            let t = (i % segment) as f64 / sample_rate;
            let phi = phase + 2.0 * PI * (freq_start * t + 0.5 * rate * t * t);
            quadrature(phi, amplitude)
        })
        .collect()
}

/// Zadoff–Chu sequence `A·exp(−jπ·u·k·(k + cf + 2q) / N)`, `cf = N mod 2`.
///
/// The exponent is reduced modulo `2N` in integer arithmetic so long
/// sequences keep full phase precision.
#[must_use]
pub fn zadoff_chu(length: usize, root: usize, cyclic_shift: usize, amplitude: f64) -> Vec<Complex64> {
    let n = length as u128;
    if n == 0 {
        return Vec::new();
    }
    let period = 2 * n;
    let cf = n % 2;
    let u = root as u128 % period;
    let q2 = (2 * cyclic_shift as u128) % period;

    (0..n)
        .map(|k| {
            let m = u * (k * ((k + cf + q2) % period) % period) % period;
            #[allow(clippy::cast_precision_loss, reason = "m and n are below 2N")]
            let angle = -PI * m as f64 / n as f64;
            Complex64::from_polar(amplitude, angle)
        })
        .collect()
}

fn quadrature(phi: f64, amplitude: f64) -> Complex64 {
    Complex64::new(phi.sin(), -phi.cos()) * amplitude
}
