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

//! Client library for a remote eight-channel RF sampler.
//!
//! The sampler exposes an XML-RPC endpoint for reading and writing sample
//! buffers. This library is organized in layers that can be used on their
//! own or together:
//!
//! - **Wire layer**: `.npy` sample payloads carried as base64 text
//! - **Device layer**: the [`Device`] trait and its XML-RPC client
//! - **Buffer layer**: per-channel samples with derived time and spectrum
//!   arrays, plus waveform synthesis for outputs
//! - **Acquisition layer**: background trigger-and-fetch loop
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use pir_client::{
//!     AcquisitionConfig, AcquisitionEvent, AcquisitionLoop, ChannelConfig, ClientConfig,
//!     Device, DeviceClient,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let device: Arc<dyn Device> = Arc::new(DeviceClient::new(ClientConfig::default())?);
//!     let acquisition =
//!         AcquisitionLoop::new(device, &ChannelConfig::default(), AcquisitionConfig::default());
//!
//!     let mut events = acquisition.subscribe();
//!     acquisition.start()?;
//!
//!     while let Ok(event) = events.recv().await {
//!         if let AcquisitionEvent::DataReady { cycle, .. } = event {
//!             let snapshot = acquisition.channels().inputs()[0].snapshot();
//!             println!("cycle {cycle}: peak {:?}", snapshot.peak());
//!         }
//!     }
//!     Ok(())
//! }
//! ```
//!
//! # Synthesizing Outputs
//!
//! ```no_run
//! # use pir_client::{AcquisitionLoop, SampleBuffer};
//! # async fn example(acquisition: &AcquisitionLoop) {
//! let results = acquisition.channels().send_sine(128e6, 0.0).join().await;
//! for (channel, result) in results {
//!     if let Err(e) = result {
//!         eprintln!("output {channel}: {e}");
//!     }
//! }
//! # }
//! ```

pub mod acquisition;
pub mod buffer;
pub mod channels;
pub mod device;
pub mod wire;

pub use acquisition::{
    AcquisitionConfig, AcquisitionError, AcquisitionEvent, AcquisitionLoop, ChannelFault,
    ConfigureReport, ConfigureStep, CycleSummary, LoopState,
};
pub use buffer::{
    BufferConfig, BufferError, RefreshOutcome, SampleBuffer, Snapshot, SpectrumPlanner,
};
pub use channels::{
    ChannelConfig, ChannelResults, ChannelSet, SynthesisBatch, CHANNEL_COUNT,
    DEFAULT_ID_BASE_FREQUENCY,
};
pub use device::{ClientConfig, Device, DeviceClient, DeviceError, Direction, DEFAULT_SERVER_URI};
pub use wire::{SampleArray, SampleFormat, WireError};
