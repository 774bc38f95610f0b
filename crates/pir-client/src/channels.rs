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

//! The sampler's fixed bank of input and output channels.

use std::future::Future;
use std::sync::Arc;

use log::{info, warn};
use tokio::task::JoinSet;

use crate::buffer::{BufferConfig, BufferError, SampleBuffer};
use crate::device::{Device, Direction};

/// Number of channels in each direction.
pub const CHANNEL_COUNT: usize = 8;

/// Base frequency of the channel identification pattern.
pub const DEFAULT_ID_BASE_FREQUENCY: f64 = 30e6;

/// Buffer configuration per direction.
#[derive(Debug, Clone, Default)]
pub struct ChannelConfig {
    pub input: BufferConfig,
    pub output: BufferConfig,
}

/// Eight input and eight output buffers sharing one device.
#[derive(Debug)]
pub struct ChannelSet {
    inputs: Vec<Arc<SampleBuffer>>,
    outputs: Vec<Arc<SampleBuffer>>,
}

impl ChannelSet {
    #[must_use]
    pub fn new(device: &Arc<dyn Device>, config: &ChannelConfig) -> Self {
        let bank = |direction: Direction, buffer_config: &BufferConfig| -> Vec<Arc<SampleBuffer>> {
            (0..CHANNEL_COUNT)
                .map(|channel| {
                    Arc::new(SampleBuffer::new(
                        channel,
                        direction,
                        buffer_config.clone(),
                        Arc::clone(device),
                    ))
                })
                .collect()
        };

        Self {
            inputs: bank(Direction::Input, &config.input),
            outputs: bank(Direction::Output, &config.output),
        }
    }

    #[must_use]
    pub fn inputs(&self) -> &[Arc<SampleBuffer>] {
        &self.inputs
    }

    #[must_use]
    pub fn outputs(&self) -> &[Arc<SampleBuffer>] {
        &self.outputs
    }

    #[must_use]
    pub fn input(&self, channel: usize) -> Option<&Arc<SampleBuffer>> {
        self.inputs.get(channel)
    }

    #[must_use]
    pub fn output(&self, channel: usize) -> Option<&Arc<SampleBuffer>> {
        self.outputs.get(channel)
    }

    /// Send the same tone to every output.
    #[must_use]
    pub fn send_sine(&self, freq: f64, phase: f64) -> SynthesisBatch {
        info!("Sending {freq} Hz sine (phase {phase}) to all outputs");
        self.each_output(move |buffer| async move { buffer.synthesize_sine(freq, phase).await })
    }

    /// Send the same DC level to every output.
    #[must_use]
    pub fn send_dc(&self, level: f64) -> SynthesisBatch {
        info!("Sending DC level {level} to all outputs");
        self.each_output(move |buffer| async move { buffer.synthesize_dc(level).await })
    }

    /// Send a distinct tone to every output: channel `i` gets `base·(i + 1)`
    /// Hz, which makes cabling easy to identify on a receiver.
    #[must_use]
    pub fn send_id(&self, base_frequency: f64) -> SynthesisBatch {
        info!("Sending channel identification tones from {base_frequency} Hz");
        self.each_output(move |buffer| async move {
            #[allow(clippy::cast_precision_loss, reason = "channel index is below 8")]
            let multiple = (buffer.channel() + 1) as f64;
            buffer.synthesize_sine(base_frequency * multiple, 0.0).await
        })
    }

    fn each_output<F, Fut>(&self, operation: F) -> SynthesisBatch
    where
        F: Fn(Arc<SampleBuffer>) -> Fut,
        Fut: Future<Output = Result<(), BufferError>> + Send + 'static,
    {
        SynthesisBatch {
            tasks: spawn_each(&self.outputs, operation),
        }
    }
}

/// Per-channel results of a fan-out, keyed by channel index.
pub type ChannelResults<T> = Vec<(usize, Result<T, BufferError>)>;

/// Run `operation` on every buffer as its own task.
pub(crate) fn spawn_each<F, Fut, T>(
    buffers: &[Arc<SampleBuffer>],
    operation: F,
) -> JoinSet<(usize, Result<T, BufferError>)>
where
    F: Fn(Arc<SampleBuffer>) -> Fut,
    Fut: Future<Output = Result<T, BufferError>> + Send + 'static,
    T: Send + 'static,
{
    let mut tasks = JoinSet::new();
    for buffer in buffers {
        let channel = buffer.channel();
        let task = operation(Arc::clone(buffer));
        tasks.spawn(async move { (channel, task.await) });
    }
    tasks
}

/// Wait for every task of a fan-out. Results are ordered by channel; a task
/// that panicked or was aborted is logged and left out.
pub(crate) async fn join_each<T: 'static>(
    mut tasks: JoinSet<(usize, Result<T, BufferError>)>,
) -> ChannelResults<T> {
    let mut results = Vec::with_capacity(tasks.len());
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(result) => results.push(result),
            Err(e) => warn!("channel task did not complete: {e}"),
        }
    }
    results.sort_by_key(|(channel, _)| *channel);
    results
}

/// Synthesis running on all outputs at once.
///
/// Dropping the batch aborts the uploads that have not finished.
#[derive(Debug)]
pub struct SynthesisBatch {
    tasks: JoinSet<(usize, Result<(), BufferError>)>,
}

impl SynthesisBatch {
    /// Wait for every channel and return the results ordered by channel.
    pub async fn join(self) -> ChannelResults<()> {
        let results = join_each(self.tasks).await;
        for (channel, result) in &results {
            if let Err(e) = result {
                warn!("output channel {channel}: synthesis failed: {e}");
            }
        }
        results
    }
}
