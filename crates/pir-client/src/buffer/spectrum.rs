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

//! Derived time and frequency representations of a sample buffer.

use std::sync::{Arc, Mutex, PoisonError};

use num_complex::Complex64;
use rustfft::{Fft, FftPlanner, Length};

use super::BufferConfig;

/// Immutable view of one buffer state: raw samples plus everything derived
/// from them. All four vectors always have the same length.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    samples: Vec<Complex64>,
    time_axis: Vec<f64>,
    freq_axis: Vec<f64>,
    magnitude_db: Vec<f64>,
}

impl Snapshot {
    /// Derive time axis, zero-centred frequency axis and magnitude spectrum.
    #[must_use]
    pub fn compute(samples: Vec<Complex64>, config: &BufferConfig) -> Self {
        Self::compute_with(samples, config, &SpectrumPlanner::default())
    }

    /// Like [`Self::compute`], reusing the FFT plan held by `planner`.
    #[must_use]
    pub fn compute_with(
        samples: Vec<Complex64>,
        config: &BufferConfig,
        planner: &SpectrumPlanner,
    ) -> Self {
        let n = samples.len();
        Self {
            time_axis: time_axis(n, config.sample_rate),
            freq_axis: freq_axis(n, config.sample_rate),
            magnitude_db: planner.magnitude_db(&samples, config.db_floor, config.db_ceiling),
            samples,
        }
    }

    #[must_use]
    pub fn samples(&self) -> &[Complex64] {
        &self.samples
    }

    /// Sample timestamps in seconds.
    #[must_use]
    pub fn time_axis(&self) -> &[f64] {
        &self.time_axis
    }

    /// FFT bin frequencies in Hz, most negative first.
    #[must_use]
    pub fn freq_axis(&self) -> &[f64] {
        &self.freq_axis
    }

    /// Normalized magnitude spectrum in dB, aligned with [`Self::freq_axis`].
    #[must_use]
    pub fn magnitude_db(&self) -> &[f64] {
        &self.magnitude_db
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Strongest bin as `(frequency_hz, level_db)`.
    #[must_use]
    pub fn peak(&self) -> Option<(f64, f64)> {
        self.freq_axis
            .iter()
            .zip(&self.magnitude_db)
            .max_by(|a, b| a.1.total_cmp(b.1))
            .map(|(f, db)| (*f, *db))
    }
}

#[allow(clippy::cast_precision_loss, reason = "sample indices are far below 2^52")]
fn time_axis(n: usize, sample_rate: f64) -> Vec<f64> {
    (0..n).map(|i| i as f64 / sample_rate).collect()
}

#[allow(clippy::cast_precision_loss, reason = "sample indices are far below 2^52")]
fn freq_axis(n: usize, sample_rate: f64) -> Vec<f64> {
    let half = (n / 2) as f64;
    let bin_width = sample_rate / n as f64;
    (0..n).map(|i| (i as f64 - half) * bin_width).collect()
}

/// Forward FFT plan kept across snapshots.
///
/// Buffers rarely change length, so only the most recent plan is cached.
#[derive(Default)]
pub struct SpectrumPlanner {
    cached: Mutex<Option<Arc<dyn Fft<f64>>>>,
}

impl std::fmt::Debug for SpectrumPlanner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let len = self
            .cached
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|fft| fft.len());
        f.debug_struct("SpectrumPlanner")
            .field("planned_len", &len)
            .finish()
    }
}

impl SpectrumPlanner {
    /// Forward plan for `len` points, planned on first use of that length.
    pub fn plan(&self, len: usize) -> Arc<dyn Fft<f64>> {
        let mut cached = self.cached.lock().unwrap_or_else(PoisonError::into_inner);
        match cached.as_ref() {
            Some(fft) if fft.len() == len => Arc::clone(fft),
            _ => {
                let fft = FftPlanner::<f64>::new().plan_fft_forward(len);
                *cached = Some(Arc::clone(&fft));
                fft
            }
        }
    }

    /// See [`magnitude_db`].
    #[must_use]
    pub fn magnitude_db(&self, samples: &[Complex64], floor: f64, ceiling: f64) -> Vec<f64> {
        let n = samples.len();
        if n == 0 {
            return Vec::new();
        }

        let mut spectrum = samples.to_vec();
        self.plan(n).process(&mut spectrum);
        spectrum.rotate_right(n / 2);

        #[allow(clippy::cast_precision_loss, reason = "buffer length is far below 2^52")]
        let scale = n as f64;

        spectrum
            .iter()
            .map(|bin| {
                let magnitude = bin.norm() / scale;
                let db = if magnitude > 0.0 {
                    10.0 * magnitude.log10()
                } else {
                    floor
                };
                if db.is_nan() {
                    floor
                } else if db.is_infinite() {
                    if db > 0.0 {
                        ceiling
                    } else {
                        floor
                    }
                } else {
                    db
                }
            })
            .collect()
    }
}

/// `10·log10(|FFT(x)| / N)` after shifting DC to the centre.
///
/// Empty bins take `floor`; NaN maps to `floor`, +inf to `ceiling` and
/// -inf to `floor`, so the result is always finite.
#[must_use]
pub fn magnitude_db(samples: &[Complex64], floor: f64, ceiling: f64) -> Vec<f64> {
    SpectrumPlanner::default().magnitude_db(samples, floor, ceiling)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> BufferConfig {
        BufferConfig::default()
    }

    #[test]
    fn test_lengths_match_and_values_finite() {
        for n in [1usize, 2, 5, 64, 1000, 4096] {
            #[allow(clippy::cast_precision_loss, reason = "test indices")]
            let samples: Vec<Complex64> = (0..n)
                .map(|i| Complex64::new((i as f64 * 0.37).sin(), (i as f64 * 1.3).cos() * 3.0))
                .collect();
            let snapshot = Snapshot::compute(samples, &config());
            assert_eq!(snapshot.len(), n);
            assert_eq!(snapshot.time_axis().len(), n);
            assert_eq!(snapshot.freq_axis().len(), n);
            assert_eq!(snapshot.magnitude_db().len(), n);
            assert!(snapshot.magnitude_db().iter().all(|v| v.is_finite()));
        }
    }

    #[test]
    fn test_all_zero_samples_hit_floor() {
        let snapshot = Snapshot::compute(vec![Complex64::new(0.0, 0.0); 4096], &config());
        assert!(snapshot.magnitude_db().iter().all(|&v| v == -100.0));
    }

    #[test]
    fn test_non_finite_samples_are_clamped() {
        let mut samples = vec![Complex64::new(1.0, 0.0); 16];
        samples[3] = Complex64::new(f64::NAN, 0.0);
        let snapshot = Snapshot::compute(samples, &config());
        assert!(snapshot.magnitude_db().iter().all(|v| v.is_finite()));

        let samples = vec![Complex64::new(f64::INFINITY, 0.0); 1];
        let snapshot = Snapshot::compute(samples, &config());
        assert_eq!(snapshot.magnitude_db(), &[100.0]);
    }

    #[test]
    fn test_axes() {
        let snapshot = Snapshot::compute(vec![Complex64::new(0.0, 0.0); 4], &config());
        assert_eq!(snapshot.time_axis(), &[0.0, 0.5e-9, 1.0e-9, 1.5e-9]);
        assert_eq!(snapshot.freq_axis(), &[-1.0e9, -0.5e9, 0.0, 0.5e9]);

        let odd = Snapshot::compute(vec![Complex64::new(0.0, 0.0); 5], &config());
        assert_eq!(odd.freq_axis(), &[-0.8e9, -0.4e9, 0.0, 0.4e9, 0.8e9]);
    }

    #[test]
    fn test_dc_lands_in_centre_bin() {
        let snapshot = Snapshot::compute(vec![Complex64::new(1.0, 0.0); 8], &config());
        // |FFT| / N of a unit DC signal is 1 in bin 0, which is index N/2 after the shift.
        assert!(snapshot.magnitude_db()[4].abs() < 1e-9);
        assert!(snapshot.magnitude_db()[0] <= -100.0);
        assert_eq!(snapshot.peak(), Some((0.0, snapshot.magnitude_db()[4])));
    }

    #[test]
    fn test_planner_reuses_plan_per_length() {
        let planner = SpectrumPlanner::default();
        let first = planner.plan(64);
        assert!(Arc::ptr_eq(&first, &planner.plan(64)));

        let other = planner.plan(128);
        assert_eq!(other.len(), 128);
        assert!(!Arc::ptr_eq(&first, &other));

        let samples = vec![Complex64::new(1.0, 0.0); 128];
        assert_eq!(
            Snapshot::compute_with(samples.clone(), &config(), &planner),
            Snapshot::compute(samples, &config())
        );
        assert!(Arc::ptr_eq(&other, &planner.plan(128)));
    }

    #[test]
    fn test_empty_snapshot() {
        let snapshot = Snapshot::compute(Vec::new(), &config());
        assert!(snapshot.is_empty());
        assert!(snapshot.magnitude_db().is_empty());
        assert_eq!(snapshot.peak(), None);
    }
}
