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

//! Per-channel sample buffers.
//!
//! A [`SampleBuffer`] mirrors one channel of the sampler. Input buffers are
//! filled from the device; output buffers are written locally by the
//! synthesis operations and uploaded. Every mutation produces a new
//! [`Snapshot`] so readers always see samples and derived arrays that match.

mod spectrum;
pub mod synth;

pub use spectrum::{magnitude_db, Snapshot, SpectrumPlanner};

use std::sync::{Arc, PoisonError, RwLock};

use log::{debug, error, warn};
use num_complex::Complex64;
use thiserror::Error;
use tokio::sync::Mutex;

use crate::device::{Device, DeviceError, Direction};
use crate::wire::{SampleArray, SampleFormat};

/// Sample rate of the sampler in samples per second.
pub const DEFAULT_SAMPLE_RATE: f64 = 2e9;

/// Buffer length used before the first fetch and for zero fills.
pub const DEFAULT_NOMINAL_LEN: usize = 4096;

/// Largest amplitude representable in the paired int16 format.
pub const DEFAULT_FULL_SCALE: f64 = 32767.0;

/// Errors that can occur on a buffer operation.
#[derive(Debug, Error)]
pub enum BufferError {
    /// The operation is not valid for this buffer or these arguments.
    #[error("precondition violated: {0}")]
    PreconditionViolation(String),

    #[error(transparent)]
    Device(#[from] DeviceError),
}

/// Configuration for one sample buffer.
#[derive(Debug, Clone, PartialEq)]
pub struct BufferConfig {
    /// Samples per second, used for the time and frequency axes.
    pub sample_rate: f64,
    /// Length of the initial buffer and of zero fills.
    pub nominal_len: usize,
    /// Amplitude of chirp and Zadoff–Chu sequences, and the scale applied to
    /// DC and sine levels in the paired int16 format.
    pub full_scale: f64,
    /// Representation used when uploading.
    pub format: SampleFormat,
    /// First sample written by chirp and Zadoff–Chu synthesis.
    pub start_offset: usize,
    /// End (exclusive) of the synthesis region. `None` means the buffer end.
    pub end_offset: Option<usize>,
    /// dB value for empty and non-finite spectrum bins.
    pub db_floor: f64,
    /// dB value for infinite spectrum bins.
    pub db_ceiling: f64,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            sample_rate: DEFAULT_SAMPLE_RATE,
            nominal_len: DEFAULT_NOMINAL_LEN,
            full_scale: DEFAULT_FULL_SCALE,
            format: SampleFormat::default(),
            start_offset: 0,
            end_offset: None,
            db_floor: -100.0,
            db_ceiling: 100.0,
        }
    }
}

/// What [`SampleBuffer::refresh`] ended up doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// Samples were replaced with the device's data.
    Fetched,
    /// The device was unreachable and the buffer was zero-filled.
    ZeroFilled,
}

/// Local mirror of one device channel.
pub struct SampleBuffer {
    channel: usize,
    direction: Direction,
    config: BufferConfig,
    device: Arc<dyn Device>,
    snapshot: RwLock<Arc<Snapshot>>,
    planner: SpectrumPlanner,
    // Serializes writers so a fetch or an upload is never interleaved with
    // another mutation of the same buffer.
    writer: Mutex<()>,
}

impl std::fmt::Debug for SampleBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SampleBuffer")
            .field("channel", &self.channel)
            .field("direction", &self.direction)
            .field("len", &self.len())
            .finish_non_exhaustive()
    }
}

impl SampleBuffer {
    /// Create a buffer holding `nominal_len` zeros.
    #[must_use]
    pub fn new(
        channel: usize,
        direction: Direction,
        config: BufferConfig,
        device: Arc<dyn Device>,
    ) -> Self {
        let planner = SpectrumPlanner::default();
        let initial = Snapshot::compute_with(zeros(config.nominal_len), &config, &planner);
        Self {
            channel,
            direction,
            config,
            device,
            snapshot: RwLock::new(Arc::new(initial)),
            planner,
            writer: Mutex::new(()),
        }
    }

    #[must_use]
    pub fn channel(&self) -> usize {
        self.channel
    }

    #[must_use]
    pub fn direction(&self) -> Direction {
        self.direction
    }

    #[must_use]
    pub fn config(&self) -> &BufferConfig {
        &self.config
    }

    /// Current consistent view of the buffer.
    #[must_use]
    pub fn snapshot(&self) -> Arc<Snapshot> {
        Arc::clone(&self.snapshot.read().unwrap_or_else(PoisonError::into_inner))
    }

    /// Current number of samples.
    #[must_use]
    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Replace the samples with the device's current data.
    ///
    /// A connection failure is absorbed: the buffer becomes `nominal_len`
    /// zeros and [`RefreshOutcome::ZeroFilled`] is returned. Protocol errors
    /// and remote faults are propagated with the samples left unchanged.
    pub async fn refresh(&self) -> Result<RefreshOutcome, BufferError> {
        let _guard = self.writer.lock().await;

        match self.device.fetch_samples(self.direction, self.channel).await {
            Ok(array) => {
                debug!(
                    "{} channel {}: fetched {} samples",
                    self.direction,
                    self.channel,
                    array.len()
                );
                self.commit(array.into_complex());
                Ok(RefreshOutcome::Fetched)
            }
            Err(e) if e.is_connection() => {
                warn!(
                    "{} channel {}: {e}, zero-filling",
                    self.direction, self.channel
                );
                self.commit(zeros(self.config.nominal_len));
                Ok(RefreshOutcome::ZeroFilled)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Rebuild the derived arrays from the current samples.
    pub async fn recompute(&self) {
        let _guard = self.writer.lock().await;
        let samples = self.snapshot().samples().to_vec();
        self.commit(samples);
    }

    /// Replace the samples of an output buffer and upload them.
    ///
    /// The local state is updated before the upload and is not rolled back
    /// if the upload fails.
    pub async fn push(&self, samples: Vec<Complex64>) -> Result<(), BufferError> {
        self.ensure_output("push")?;
        let _guard = self.writer.lock().await;
        self.commit_and_upload(samples).await
    }

    /// Fill the buffer with a constant level and upload it.
    pub async fn synthesize_dc(&self, level: f64) -> Result<(), BufferError> {
        self.ensure_output("synthesize_dc")?;
        let _guard = self.writer.lock().await;
        let samples = synth::dc(self.len(), level * self.level_scale());
        self.commit_and_upload(samples).await
    }

    /// Fill the buffer with a complex tone and upload it.
    pub async fn synthesize_sine(&self, freq: f64, phase: f64) -> Result<(), BufferError> {
        self.ensure_output("synthesize_sine")?;
        let _guard = self.writer.lock().await;
        let samples = synth::sine(
            self.len(),
            freq,
            phase,
            self.config.sample_rate,
            self.level_scale(),
        );
        self.commit_and_upload(samples).await
    }

    /// Write a repeated linear chirp over the synthesis region and upload.
    pub async fn synthesize_chirp(
        &self,
        freq_start: f64,
        freq_end: f64,
        phase: f64,
        repeat_count: usize,
    ) -> Result<(), BufferError> {
        self.ensure_output("synthesize_chirp")?;
        if repeat_count == 0 {
            return Err(BufferError::PreconditionViolation(
                "chirp repeat count must be at least 1".to_string(),
            ));
        }

        let _guard = self.writer.lock().await;
        let mut samples = self.snapshot().samples().to_vec();
        let (start, end) = self.region(samples.len())?;
        let sweep = synth::chirp(
            end - start,
            freq_start,
            freq_end,
            phase,
            repeat_count,
            self.config.sample_rate,
            self.config.full_scale,
        );
        samples[start..end].copy_from_slice(&sweep);
        self.commit_and_upload(samples).await
    }

    /// Write a Zadoff–Chu sequence at the start of the synthesis region,
    /// zero the rest of the region and upload.
    pub async fn synthesize_zadoff_chu(
        &self,
        length: usize,
        root: usize,
        cyclic_shift: usize,
    ) -> Result<(), BufferError> {
        self.ensure_output("synthesize_zadoff_chu")?;
        if length == 0 {
            return Err(BufferError::PreconditionViolation(
                "Zadoff-Chu length must be at least 1".to_string(),
            ));
        }

        let _guard = self.writer.lock().await;
        let mut samples = self.snapshot().samples().to_vec();
        let (start, end) = self.region(samples.len())?;
        if length > end - start {
            return Err(BufferError::PreconditionViolation(format!(
                "Zadoff-Chu length {length} does not fit region {start}..{end}"
            )));
        }

        let sequence = synth::zadoff_chu(length, root, cyclic_shift, self.config.full_scale);
        let split = start + length;
        samples[start..split].copy_from_slice(&sequence);
        samples[split..end].fill(Complex64::new(0.0, 0.0));
        self.commit_and_upload(samples).await
    }

    /// Switch the channel between one-shot and continuous mode.
    pub async fn set_one_shot(&self, enabled: bool) -> Result<(), BufferError> {
        self.device
            .set_mode(self.channel, self.direction, enabled)
            .await?;
        Ok(())
    }

    fn commit(&self, samples: Vec<Complex64>) {
        let snapshot = Arc::new(Snapshot::compute_with(samples, &self.config, &self.planner));
        *self.snapshot.write().unwrap_or_else(PoisonError::into_inner) = snapshot;
    }

    async fn commit_and_upload(&self, samples: Vec<Complex64>) -> Result<(), BufferError> {
        let array = SampleArray::from_complex(&samples, self.config.format);
        let local = match self.config.format {
            SampleFormat::ComplexFloat => samples,
            SampleFormat::PairedInt16 => array.clone().into_complex(),
        };
        self.commit(local);

        if let Err(e) = self.device.push_samples(self.channel, &array).await {
            error!("output channel {}: upload failed: {e}", self.channel);
            return Err(e.into());
        }
        debug!("output channel {}: uploaded {} samples", self.channel, array.len());
        Ok(())
    }

    fn ensure_output(&self, operation: &str) -> Result<(), BufferError> {
        match self.direction {
            Direction::Output => Ok(()),
            Direction::Input => Err(BufferError::PreconditionViolation(format!(
                "{operation} on input channel {}",
                self.channel
            ))),
        }
    }

    fn region(&self, len: usize) -> Result<(usize, usize), BufferError> {
        let start = self.config.start_offset;
        let end = self.config.end_offset.map_or(len, |end| end.min(len));
        if start >= end {
            return Err(BufferError::PreconditionViolation(format!(
                "empty synthesis region {start}..{end} for {len} samples"
            )));
        }
        Ok((start, end))
    }

    fn level_scale(&self) -> f64 {
        match self.config.format {
            SampleFormat::ComplexFloat => 1.0,
            SampleFormat::PairedInt16 => self.config.full_scale,
        }
    }
}

fn zeros(len: usize) -> Vec<Complex64> {
    vec![Complex64::new(0.0, 0.0); len]
}
