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

//! Device layer for the remote sampler.
//!
//! The [`Device`] trait is the seam between acquisition logic and the
//! transport. [`DeviceClient`] implements it over XML-RPC; tests substitute
//! their own implementations.

mod client;
#[cfg(test)]
pub(crate) mod stub;
pub mod xmlrpc;

pub use client::{ClientConfig, DeviceClient, DEFAULT_SERVER_URI};

use std::fmt;

use async_trait::async_trait;
use thiserror::Error;

use crate::wire::{SampleArray, WireError};

/// Errors that can occur while talking to the device.
#[derive(Debug, Error)]
pub enum DeviceError {
    /// The transport could not reach the device (refused, reset, timed out).
    #[error("connection error: {0}")]
    Connection(String),

    /// The device answered with something that is not a valid response.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A sample payload could not be encoded or decoded.
    #[error("payload error: {0}")]
    Payload(#[from] WireError),

    /// The device reported an XML-RPC fault.
    #[error("remote fault {code}: {message}")]
    Fault { code: i64, message: String },

    /// The client has been closed.
    #[error("device connection is closed")]
    Closed,
}

impl DeviceError {
    /// Whether this is a transient transport failure.
    #[must_use]
    pub fn is_connection(&self) -> bool {
        matches!(self, Self::Connection(_))
    }
}

/// Channel direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Input,
    Output,
}

impl Direction {
    /// Name used on the wire.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Input => "input",
            Self::Output => "output",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Remote operations offered by the sampler.
///
/// Implementations must be shareable across the concurrent per-channel tasks
/// spawned by the acquisition loop.
#[async_trait]
pub trait Device: Send + Sync + fmt::Debug {
    /// Fetch the current samples of one channel. Never retried internally.
    async fn fetch_samples(
        &self,
        direction: Direction,
        channel: usize,
    ) -> Result<SampleArray, DeviceError>;

    /// Upload samples to an output channel.
    async fn push_samples(&self, channel: usize, samples: &SampleArray) -> Result<(), DeviceError>;

    /// Select one-shot (capture once per trigger) or continuous mode.
    async fn set_mode(
        &self,
        channel: usize,
        direction: Direction,
        one_shot: bool,
    ) -> Result<(), DeviceError>;

    /// Issue one trigger event for all channels.
    async fn global_trigger(&self) -> Result<(), DeviceError>;

    /// Release the connection. Safe to call more than once.
    async fn close(&self);
}
