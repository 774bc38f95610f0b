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

//! Recording in-memory device used by the unit tests.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use num_complex::Complex64;

use super::{Device, DeviceError, Direction};
use crate::wire::SampleArray;

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Call {
    Fetch(Direction, usize),
    Push(usize, SampleArray),
    SetMode(usize, Direction, bool),
    Trigger,
    Close,
}

#[derive(Debug)]
pub(crate) struct StubDevice {
    calls: Mutex<Vec<Call>>,
    fetch_len: usize,
    pub(crate) unreachable: AtomicBool,
    pub(crate) fail_trigger: AtomicBool,
    pub(crate) corrupt_payload: AtomicBool,
    pub(crate) fail_mode_channel: Mutex<Option<(Direction, usize)>>,
}

impl Default for StubDevice {
    fn default() -> Self {
        Self::with_fetch_len(64)
    }
}

impl StubDevice {
    pub(crate) fn with_fetch_len(fetch_len: usize) -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            fetch_len,
            unreachable: AtomicBool::new(false),
            fail_trigger: AtomicBool::new(false),
            corrupt_payload: AtomicBool::new(false),
            fail_mode_channel: Mutex::new(None),
        }
    }

    pub(crate) fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub(crate) fn count(&self, pred: impl Fn(&Call) -> bool) -> usize {
        self.calls.lock().unwrap().iter().filter(|c| pred(c)).count()
    }

    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }

    fn check_reachable(&self) -> Result<(), DeviceError> {
        if self.unreachable.load(Ordering::SeqCst) {
            Err(DeviceError::Connection("connection refused".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Device for StubDevice {
    async fn fetch_samples(
        &self,
        direction: Direction,
        channel: usize,
    ) -> Result<SampleArray, DeviceError> {
        self.record(Call::Fetch(direction, channel));
        tokio::task::yield_now().await;
        self.check_reachable()?;
        if self.corrupt_payload.load(Ordering::SeqCst) {
            return Err(DeviceError::Protocol("bad payload".to_string()));
        }
        #[allow(clippy::cast_precision_loss, reason = "small test values")]
        let level = (channel + 1) as f64;
        Ok(SampleArray::Complex(vec![
            Complex64::new(level, 0.0);
            self.fetch_len
        ]))
    }

    async fn push_samples(&self, channel: usize, samples: &SampleArray) -> Result<(), DeviceError> {
        self.record(Call::Push(channel, samples.clone()));
        self.check_reachable()
    }

    async fn set_mode(
        &self,
        channel: usize,
        direction: Direction,
        one_shot: bool,
    ) -> Result<(), DeviceError> {
        self.record(Call::SetMode(channel, direction, one_shot));
        self.check_reachable()?;
        if *self.fail_mode_channel.lock().unwrap() == Some((direction, channel)) {
            return Err(DeviceError::Fault {
                code: 2,
                message: format!("{direction} channel {channel} unavailable"),
            });
        }
        Ok(())
    }

    async fn global_trigger(&self) -> Result<(), DeviceError> {
        self.record(Call::Trigger);
        self.check_reachable()?;
        if self.fail_trigger.load(Ordering::SeqCst) {
            return Err(DeviceError::Fault {
                code: 1,
                message: "trigger busy".to_string(),
            });
        }
        Ok(())
    }

    async fn close(&self) {
        self.record(Call::Close);
    }
}
