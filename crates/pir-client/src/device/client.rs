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

//! XML-RPC client for the sampler.

use std::sync::{PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info};
use reqwest::header::CONTENT_TYPE;

use super::xmlrpc::{self, Value};
use super::{Device, DeviceError, Direction};
use crate::wire::{decode_payload, decode_payload_bytes, encode_payload, SampleArray};

/// Default server URI for the sampler's RPC endpoint.
pub const DEFAULT_SERVER_URI: &str = "http://localhost:8000/RPC2";

/// Configuration for the device client.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Server URI of the XML-RPC endpoint.
    pub url: String,
    /// Optional timeout for a whole request. No timeout when unset.
    pub request_timeout: Option<Duration>,
    /// Optional timeout for establishing the TCP connection.
    pub connect_timeout: Option<Duration>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_SERVER_URI.to_string(),
            request_timeout: None,
            connect_timeout: None,
        }
    }
}

/// Handle to the remote sampler.
///
/// Holds one HTTP connection pool; `close()` drops it and every later call
/// fails with [`DeviceError::Closed`].
pub struct DeviceClient {
    url: String,
    http: RwLock<Option<reqwest::Client>>,
}

impl std::fmt::Debug for DeviceClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceClient")
            .field("url", &self.url)
            .finish_non_exhaustive()
    }
}

impl DeviceClient {
    /// Create a client for the given configuration.
    ///
    /// No connection is made until the first call.
    pub fn new(config: ClientConfig) -> Result<Self, DeviceError> {
        let mut builder = reqwest::Client::builder();
        if let Some(timeout) = config.request_timeout {
            builder = builder.timeout(timeout);
        }
        if let Some(timeout) = config.connect_timeout {
            builder = builder.connect_timeout(timeout);
        }
        let http = builder
            .build()
            .map_err(|e| DeviceError::Connection(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            url: config.url,
            http: RwLock::new(Some(http)),
        })
    }

    /// Server URI this client talks to.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Perform one XML-RPC call.
    pub async fn call(&self, method: &str, params: &[Value]) -> Result<Value, DeviceError> {
        let http = self
            .http
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(DeviceError::Closed)?;

        debug!("RPC {method} -> {}", self.url);

        let response = http
            .post(&self.url)
            .header(CONTENT_TYPE, "text/xml")
            .body(xmlrpc::encode_call(method, params))
            .send()
            .await
            .map_err(classify)?;

        let status = response.status();
        if !status.is_success() {
            return Err(DeviceError::Protocol(format!(
                "HTTP {status} from {method}"
            )));
        }

        let body = response.text().await.map_err(classify)?;
        xmlrpc::decode_response(&body)
    }
}

/// Sort transport errors into connection failures and protocol failures.
fn classify(err: reqwest::Error) -> DeviceError {
    if err.is_decode() || err.is_status() || err.is_builder() {
        DeviceError::Protocol(err.to_string())
    } else {
        DeviceError::Connection(err.to_string())
    }
}

fn channel_param(channel: usize) -> Result<Value, DeviceError> {
    i64::try_from(channel)
        .map(Value::Int)
        .map_err(|e| DeviceError::Protocol(format!("channel {channel} out of range: {e}")))
}

#[async_trait]
impl Device for DeviceClient {
    async fn fetch_samples(
        &self,
        direction: Direction,
        channel: usize,
    ) -> Result<SampleArray, DeviceError> {
        let params = [
            Value::Str(direction.as_str().to_string()),
            channel_param(channel)?,
        ];
        match self.call("get_samples", &params).await? {
            Value::Str(text) => Ok(decode_payload(&text)?),
            Value::Base64(bytes) => Ok(decode_payload_bytes(&bytes)?),
            other => Err(DeviceError::Protocol(format!(
                "get_samples returned {other:?} instead of a payload"
            ))),
        }
    }

    async fn push_samples(&self, channel: usize, samples: &SampleArray) -> Result<(), DeviceError> {
        let params = [channel_param(channel)?, Value::Str(encode_payload(samples)?)];
        self.call("set_samples", &params).await?;
        Ok(())
    }

    async fn set_mode(
        &self,
        channel: usize,
        direction: Direction,
        one_shot: bool,
    ) -> Result<(), DeviceError> {
        let params = [
            channel_param(channel)?,
            Value::Str(direction.as_str().to_string()),
            Value::Bool(one_shot),
        ];
        self.call("one_shot", &params).await?;
        Ok(())
    }

    async fn global_trigger(&self) -> Result<(), DeviceError> {
        self.call("global_trigger", &[]).await?;
        Ok(())
    }

    async fn close(&self) {
        let previous = self
            .http
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if previous.is_some() {
            info!("Closed connection to {}", self.url);
        }
    }
}
