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

//! Background acquisition loop.
//!
//! The loop configures the sampler once, then triggers a capture and
//! refreshes all eight inputs on every poll interval. Consumers learn about
//! completed cycles through [`AcquisitionEvent`]s and read the buffers'
//! snapshots directly.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};
use thiserror::Error;
use tokio::sync::{broadcast, watch};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use crate::buffer::RefreshOutcome;
use crate::channels::{join_each, spawn_each, ChannelConfig, ChannelResults, ChannelSet};
use crate::device::Device;

/// Errors returned by the loop's control operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AcquisitionError {
    #[error("acquisition loop already started")]
    AlreadyStarted,

    #[error("acquisition loop has been stopped")]
    Stopped,
}

/// Configuration for the acquisition loop.
#[derive(Debug, Clone)]
pub struct AcquisitionConfig {
    /// Pause between the end of one poll cycle and the next trigger.
    pub poll_interval: Duration,
    /// Capacity of the event channel. Slow subscribers skip old events.
    pub event_capacity: usize,
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(500),
            event_capacity: 64,
        }
    }
}

/// Lifecycle of the loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Idle,
    Configuring,
    Polling,
    Stopping,
    Stopped,
}

/// Startup step a channel failure belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigureStep {
    /// Putting an input into one-shot mode.
    InputOneShot,
    /// Putting an output into continuous mode.
    OutputContinuous,
    /// Reading the initial contents of an output.
    OutputSnapshot,
}

/// A channel that failed during startup.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelFault {
    pub step: ConfigureStep,
    pub channel: usize,
    pub error: String,
}

/// Outcome of the startup sequence. Failures never abort it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConfigureReport {
    pub faults: Vec<ChannelFault>,
}

impl ConfigureReport {
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.faults.is_empty()
    }

    fn record<T>(&mut self, step: ConfigureStep, results: ChannelResults<T>) {
        for (channel, result) in results {
            if let Err(e) = result {
                warn!("{step:?} failed on channel {channel}: {e}");
                self.faults.push(ChannelFault {
                    step,
                    channel,
                    error: e.to_string(),
                });
            }
        }
    }
}

/// What happened to each input during one poll cycle.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CycleSummary {
    /// Channels refreshed with device data.
    pub fetched: Vec<usize>,
    /// Channels zero-filled because the device was unreachable.
    pub zero_filled: Vec<usize>,
    /// Channels whose refresh failed with a protocol error or fault.
    pub failed: Vec<(usize, String)>,
}

impl CycleSummary {
    fn from_results(results: ChannelResults<RefreshOutcome>) -> Self {
        let mut summary = Self::default();
        for (channel, result) in results {
            match result {
                Ok(RefreshOutcome::Fetched) => summary.fetched.push(channel),
                Ok(RefreshOutcome::ZeroFilled) => summary.zero_filled.push(channel),
                Err(e) => {
                    warn!("input channel {channel}: refresh failed: {e}");
                    summary.failed.push((channel, e.to_string()));
                }
            }
        }
        summary
    }
}

/// Notifications published by the loop.
#[derive(Debug, Clone, PartialEq)]
pub enum AcquisitionEvent {
    /// Startup finished; polling begins next.
    Configured(ConfigureReport),
    /// All inputs were refreshed after a trigger.
    DataReady { cycle: u64, summary: CycleSummary },
    /// The trigger failed; no input was refreshed this cycle.
    CycleFailed { cycle: u64, error: String },
}

/// Handle to the acquisition loop.
///
/// Create with [`AcquisitionLoop::new`], then [`start`](Self::start) it inside
/// a Tokio runtime. [`stop`](Self::stop) requests shutdown and
/// [`stopped`](Self::stopped) waits for it and closes the device.
pub struct AcquisitionLoop {
    device: Arc<dyn Device>,
    channels: Arc<ChannelSet>,
    config: AcquisitionConfig,
    state_tx: Arc<watch::Sender<LoopState>>,
    event_tx: broadcast::Sender<AcquisitionEvent>,
    cancel_token: CancellationToken,
    started: AtomicBool,
}

impl std::fmt::Debug for AcquisitionLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AcquisitionLoop")
            .field("device", &self.device)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl AcquisitionLoop {
    #[must_use]
    pub fn new(
        device: Arc<dyn Device>,
        channel_config: &ChannelConfig,
        config: AcquisitionConfig,
    ) -> Self {
        let channels = Arc::new(ChannelSet::new(&device, channel_config));
        let (state_tx, _) = watch::channel(LoopState::Idle);
        let (event_tx, _) = broadcast::channel(config.event_capacity.max(1));

        Self {
            device,
            channels,
            config,
            state_tx: Arc::new(state_tx),
            event_tx,
            cancel_token: CancellationToken::new(),
            started: AtomicBool::new(false),
        }
    }

    /// Spawn the loop task. Must be called from within a Tokio runtime.
    pub fn start(&self) -> Result<(), AcquisitionError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(if self.state() == LoopState::Stopped {
                AcquisitionError::Stopped
            } else {
                AcquisitionError::AlreadyStarted
            });
        }

        let runner = Runner {
            device: Arc::clone(&self.device),
            channels: Arc::clone(&self.channels),
            state_tx: Arc::clone(&self.state_tx),
            event_tx: self.event_tx.clone(),
            cancel_token: self.cancel_token.clone(),
            poll_interval: self.config.poll_interval,
        };
        tokio::spawn(runner.run());
        Ok(())
    }

    /// Request shutdown. Returns immediately.
    ///
    /// A loop that was never started goes straight to [`LoopState::Stopped`].
    pub fn stop(&self) {
        self.cancel_token.cancel();
        if !self.started.swap(true, Ordering::SeqCst) {
            self.state_tx.send_replace(LoopState::Stopped);
        }
    }

    /// Wait until the loop has stopped, then close the device.
    pub async fn stopped(&self) {
        let mut state_rx = self.state_tx.subscribe();
        // The sender lives in `self`, so this only returns once Stopped is seen.
        let _ = state_rx
            .wait_for(|state| *state == LoopState::Stopped)
            .await;
        self.device.close().await;
    }

    /// Subscribe to loop events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<AcquisitionEvent> {
        self.event_tx.subscribe()
    }

    /// Watch lifecycle changes.
    #[must_use]
    pub fn watch_state(&self) -> watch::Receiver<LoopState> {
        self.state_tx.subscribe()
    }

    #[must_use]
    pub fn state(&self) -> LoopState {
        *self.state_tx.borrow()
    }

    #[must_use]
    pub fn channels(&self) -> &Arc<ChannelSet> {
        &self.channels
    }
}

impl Drop for AcquisitionLoop {
    fn drop(&mut self) {
        self.cancel_token.cancel();
    }
}

struct Runner {
    device: Arc<dyn Device>,
    channels: Arc<ChannelSet>,
    state_tx: Arc<watch::Sender<LoopState>>,
    event_tx: broadcast::Sender<AcquisitionEvent>,
    cancel_token: CancellationToken,
    poll_interval: Duration,
}

impl Runner {
    async fn run(self) {
        self.state_tx.send_replace(LoopState::Configuring);
        info!("Configuring channels");

        tokio::select! {
            biased;
            () = self.cancel_token.cancelled() => {
                info!("Acquisition cancelled while configuring");
                self.finish();
                return;
            }
            report = configure(&self.channels) => {
                if report.is_clean() {
                    info!("All channels configured");
                } else {
                    warn!("Configured with {} channel fault(s)", report.faults.len());
                }
                let _ = self.event_tx.send(AcquisitionEvent::Configured(report));
            }
        }

        self.state_tx.send_replace(LoopState::Polling);
        info!("Polling every {:?}", self.poll_interval);

        let mut cycle: u64 = 0;
        loop {
            cycle += 1;

            tokio::select! {
                biased;
                () = self.cancel_token.cancelled() => break,
                event = self.poll(cycle) => {
                    let _ = self.event_tx.send(event);
                }
            }

            tokio::select! {
                biased;
                () = self.cancel_token.cancelled() => break,
                () = sleep(self.poll_interval) => {}
            }
        }

        info!("Acquisition cancelled after {} cycle(s)", cycle - 1);
        self.finish();
    }

    /// One trigger followed by a refresh of every input.
    async fn poll(&self, cycle: u64) -> AcquisitionEvent {
        if let Err(e) = self.device.global_trigger().await {
            error!("cycle {cycle}: trigger failed: {e}");
            return AcquisitionEvent::CycleFailed {
                cycle,
                error: e.to_string(),
            };
        }

        let tasks = spawn_each(self.channels.inputs(), |buffer| async move {
            buffer.refresh().await
        });
        let summary = CycleSummary::from_results(join_each(tasks).await);
        debug!(
            "cycle {cycle}: {} fetched, {} zero-filled, {} failed",
            summary.fetched.len(),
            summary.zero_filled.len(),
            summary.failed.len()
        );
        AcquisitionEvent::DataReady { cycle, summary }
    }

    fn finish(&self) {
        self.state_tx.send_replace(LoopState::Stopping);
        self.state_tx.send_replace(LoopState::Stopped);
        info!("Acquisition stopped");
    }
}

/// Inputs to one-shot, outputs to continuous, then read every output once.
async fn configure(channels: &ChannelSet) -> ConfigureReport {
    let mut report = ConfigureReport::default();

    let inputs = spawn_each(channels.inputs(), |buffer| async move {
        buffer.set_one_shot(true).await
    });
    report.record(ConfigureStep::InputOneShot, join_each(inputs).await);

    let outputs = spawn_each(channels.outputs(), |buffer| async move {
        buffer.set_one_shot(false).await
    });
    report.record(ConfigureStep::OutputContinuous, join_each(outputs).await);

    let snapshots = spawn_each(channels.outputs(), |buffer| async move {
        buffer.refresh().await.map(|_| ())
    });
    report.record(ConfigureStep::OutputSnapshot, join_each(snapshots).await);

    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::BufferConfig;
    use crate::channels::CHANNEL_COUNT;
    use crate::device::stub::{Call, StubDevice};
    use crate::device::Direction;
    use tokio::time::timeout;

    fn acquisition(stub: &Arc<StubDevice>, poll_interval: Duration) -> AcquisitionLoop {
        let config = ChannelConfig {
            input: BufferConfig {
                nominal_len: 16,
                ..Default::default()
            },
            output: BufferConfig {
                nominal_len: 16,
                ..Default::default()
            },
        };
        AcquisitionLoop::new(
            Arc::clone(stub) as Arc<dyn Device>,
            &config,
            AcquisitionConfig {
                poll_interval,
                ..Default::default()
            },
        )
    }

    async fn next_event(rx: &mut broadcast::Receiver<AcquisitionEvent>) -> AcquisitionEvent {
        timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for event")
            .expect("event channel closed")
    }

    async fn next_data_ready(rx: &mut broadcast::Receiver<AcquisitionEvent>) -> (u64, CycleSummary) {
        loop {
            if let AcquisitionEvent::DataReady { cycle, summary } = next_event(rx).await {
                return (cycle, summary);
            }
        }
    }

    #[tokio::test]
    async fn test_configure_sequence() {
        let stub = Arc::new(StubDevice::default());
        let acq = acquisition(&stub, Duration::from_secs(10));
        let mut rx = acq.subscribe();
        acq.start().unwrap();

        let event = next_event(&mut rx).await;
        assert_eq!(event, AcquisitionEvent::Configured(ConfigureReport::default()));

        let calls = stub.calls();
        let configure: Vec<_> = calls.iter().take(3 * CHANNEL_COUNT).collect();
        for call in &configure[..CHANNEL_COUNT] {
            assert!(matches!(call, Call::SetMode(_, Direction::Input, true)));
        }
        for call in &configure[CHANNEL_COUNT..2 * CHANNEL_COUNT] {
            assert!(matches!(call, Call::SetMode(_, Direction::Output, false)));
        }
        for call in &configure[2 * CHANNEL_COUNT..] {
            assert!(matches!(call, Call::Fetch(Direction::Output, _)));
        }

        acq.stop();
        acq.stopped().await;
    }

    #[tokio::test]
    async fn test_one_trigger_then_all_inputs_before_data_ready() {
        let stub = Arc::new(StubDevice::default());
        let acq = acquisition(&stub, Duration::from_secs(10));
        let mut rx = acq.subscribe();
        acq.start().unwrap();

        let (cycle, summary) = next_data_ready(&mut rx).await;
        assert_eq!(cycle, 1);
        assert_eq!(summary.fetched, (0..CHANNEL_COUNT).collect::<Vec<_>>());
        assert!(summary.zero_filled.is_empty());
        assert!(summary.failed.is_empty());

        let calls = stub.calls();
        let trigger_at = calls.iter().position(|c| *c == Call::Trigger).unwrap();
        assert!(!calls[..trigger_at]
            .iter()
            .any(|c| matches!(c, Call::Fetch(Direction::Input, _))));

        let after = &calls[trigger_at + 1..];
        assert_eq!(after.len(), CHANNEL_COUNT);
        let mut fetched: Vec<usize> = after
            .iter()
            .map(|c| match c {
                Call::Fetch(Direction::Input, channel) => *channel,
                other => panic!("unexpected call {other:?}"),
            })
            .collect();
        fetched.sort_unstable();
        assert_eq!(fetched, (0..CHANNEL_COUNT).collect::<Vec<_>>());
        assert_eq!(stub.count(|c| *c == Call::Trigger), 1);

        let snapshot = acq.channels().input(4).unwrap().snapshot();
        assert_eq!(snapshot.len(), 64);

        acq.stop();
        acq.stopped().await;
    }

    #[tokio::test]
    async fn test_stop_while_polling() {
        let poll_interval = Duration::from_millis(200);
        let stub = Arc::new(StubDevice::default());
        let acq = acquisition(&stub, poll_interval);
        let mut rx = acq.subscribe();
        acq.start().unwrap();

        next_data_ready(&mut rx).await;
        assert_eq!(acq.state(), LoopState::Polling);

        acq.stop();
        timeout(poll_interval, acq.stopped())
            .await
            .expect("loop did not stop within one poll interval");
        assert_eq!(acq.state(), LoopState::Stopped);

        let triggers = stub.count(|c| *c == Call::Trigger);
        sleep(poll_interval * 2).await;
        assert_eq!(stub.count(|c| *c == Call::Trigger), triggers);
        assert_eq!(stub.calls().last(), Some(&Call::Close));
    }

    #[tokio::test]
    async fn test_configure_faults_are_reported_and_polling_starts() {
        let stub = Arc::new(StubDevice::default());
        *stub.fail_mode_channel.lock().unwrap() = Some((Direction::Input, 3));
        let acq = acquisition(&stub, Duration::from_secs(10));
        let mut rx = acq.subscribe();
        acq.start().unwrap();

        let AcquisitionEvent::Configured(report) = next_event(&mut rx).await else {
            panic!("expected Configured first");
        };
        assert_eq!(report.faults.len(), 1);
        assert_eq!(report.faults[0].step, ConfigureStep::InputOneShot);
        assert_eq!(report.faults[0].channel, 3);

        let (cycle, _) = next_data_ready(&mut rx).await;
        assert_eq!(cycle, 1);

        acq.stop();
        acq.stopped().await;
    }

    #[tokio::test]
    async fn test_trigger_failure_does_not_end_loop() {
        let stub = Arc::new(StubDevice::default());
        stub.fail_trigger.store(true, Ordering::SeqCst);
        let acq = acquisition(&stub, Duration::from_millis(20));
        let mut rx = acq.subscribe();
        acq.start().unwrap();

        let failed = loop {
            if let AcquisitionEvent::CycleFailed { cycle, .. } = next_event(&mut rx).await {
                break cycle;
            }
        };
        assert_eq!(failed, 1);
        assert_eq!(stub.count(|c| matches!(c, Call::Fetch(Direction::Input, _))), 0);

        stub.fail_trigger.store(false, Ordering::SeqCst);
        let (cycle, _) = next_data_ready(&mut rx).await;
        assert!(cycle > 1);

        acq.stop();
        acq.stopped().await;
    }

    #[tokio::test]
    async fn test_unreachable_device_reports_failed_cycles() {
        let stub = Arc::new(StubDevice::default());
        let acq = acquisition(&stub, Duration::from_millis(20));
        let mut rx = acq.subscribe();
        acq.start().unwrap();
        next_data_ready(&mut rx).await;

        stub.unreachable.store(true, Ordering::SeqCst);
        // The trigger is the first call to fail once the device is gone.
        loop {
            if let AcquisitionEvent::CycleFailed { error, .. } = next_event(&mut rx).await {
                assert!(error.contains("connection"));
                break;
            }
        }
        assert_eq!(acq.state(), LoopState::Polling);

        acq.stop();
        acq.stopped().await;
        assert_eq!(acq.state(), LoopState::Stopped);
    }

    #[tokio::test]
    async fn test_start_twice_and_stop_before_start() {
        let stub = Arc::new(StubDevice::default());
        let acq = acquisition(&stub, Duration::from_secs(10));
        acq.start().unwrap();
        assert_eq!(acq.start(), Err(AcquisitionError::AlreadyStarted));
        acq.stop();
        acq.stopped().await;

        let idle = acquisition(&stub, Duration::from_secs(10));
        assert_eq!(idle.state(), LoopState::Idle);
        idle.stop();
        assert_eq!(idle.state(), LoopState::Stopped);
        assert_eq!(idle.start(), Err(AcquisitionError::Stopped));
        timeout(Duration::from_secs(1), idle.stopped()).await.unwrap();
    }
}
