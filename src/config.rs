// Copyright 2025 Google LLC
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

//! Pool and per-method affinity configuration.
//!
//! The JSON document shape mirrors the service config files this pool is
//! driven by in deployments:
//!
//! ```json
//! {
//!   "channelPool": { "maxSize": 4, "maxConcurrentStreamsLowWatermark": 50 },
//!   "method": [
//!     {
//!       "name": ["/spanner.v1.Spanner/CreateSession"],
//!       "affinity": { "command": "BIND", "affinityKey": "name" }
//!     }
//!   ]
//! }
//! ```

use crate::constants::{DEFAULT_MAX_SIZE, DEFAULT_STREAMS_LOW_WATERMARK};
use crate::error::{PoolError, PoolResult};
use serde::{Deserialize, Serialize};

/// What an affinity-configured method does with its extracted key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AffinityCommand {
    /// Route by an existing binding; the key comes from the request and the
    /// index is not mutated.
    Bound,
    /// Create a binding from the first response's key to the channel that
    /// carried the call.
    Bind,
    /// Remove the request key's binding once the call has been routed.
    Unbind,
}

/// Per-method affinity descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AffinityConfig {
    pub command: AffinityCommand,
    /// Dotted-path selector applied to the payload. Empty disables
    /// extraction for the method.
    #[serde(default)]
    pub affinity_key: String,
}

impl AffinityConfig {
    pub fn new(command: AffinityCommand, affinity_key: impl Into<String>) -> Self {
        Self {
            command,
            affinity_key: affinity_key.into(),
        }
    }
}

/// Binds one affinity descriptor to a set of fully-qualified method names.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct MethodConfig {
    pub name: Vec<String>,
    pub affinity: Option<AffinityConfig>,
}

/// Pool sizing knobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ChannelPoolConfig {
    /// Hard cap on the number of channels. Must be at least 1.
    pub max_size: usize,
    /// A channel carrying fewer streams than this is considered roomy enough
    /// to reuse; the pool only grows once every channel is at or above it.
    pub max_concurrent_streams_low_watermark: usize,
}

impl Default for ChannelPoolConfig {
    fn default() -> Self {
        Self {
            max_size: DEFAULT_MAX_SIZE,
            max_concurrent_streams_low_watermark: DEFAULT_STREAMS_LOW_WATERMARK,
        }
    }
}

impl ChannelPoolConfig {
    pub fn validate(&self) -> PoolResult<()> {
        if self.max_size == 0 {
            return Err(PoolError::InvalidConfig(
                "channelPool.maxSize must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Top-level configuration document for a pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct ApiConfig {
    pub channel_pool: ChannelPoolConfig,
    pub method: Vec<MethodConfig>,
}

impl ApiConfig {
    pub fn from_json(doc: &str) -> PoolResult<Self> {
        let config: ApiConfig = serde_json::from_str(doc)
            .map_err(|e| PoolError::InvalidConfig(e.to_string()))?;
        config.channel_pool.validate()?;
        Ok(config)
    }
}
