// Copyright (c) 2026 Dispersy
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//     http://www.apache.org/licenses/LICENSE-2.0
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

//! Node configuration (TOML) and core tunables.

use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;

/// Config errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("read config")]
    Read,
    #[error("parse config")]
    Parse,
}

/// Core timing and budget tunables.
#[derive(Clone, Copy, Debug)]
pub struct CoreConfig {
    /// How long a delayed packet stays parked before it is dropped.
    pub delay_timeout: Duration,
    /// How long a pending signature request stays alive.
    pub signature_timeout: Duration,
    /// Byte budget for the packets answering one introduction request.
    pub sync_response_limit: usize,
    /// Proof counter-message burst per origin.
    pub proof_burst: u32,
    /// Proof counter-message refill per origin, per second.
    pub proof_per_sec: u32,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            delay_timeout: Duration::from_secs(10),
            signature_timeout: Duration::from_secs(10),
            sync_response_limit: 5 * 1024 * 1024,
            proof_burst: 5,
            proof_per_sec: 1,
        }
    }
}

/// Node settings.
#[derive(Clone, Debug, Deserialize)]
pub struct NodeSettings {
    /// Human-readable name.
    pub name: String,
    /// Data directory (db + keys + peer cache).
    pub data_dir: String,
}

/// Endpoint settings.
#[derive(Clone, Debug, Deserialize)]
pub struct EndpointSettings {
    /// UDP listen address, e.g. `0.0.0.0:6421`.
    pub listen_addr: String,
}

fn default_delay_timeout_secs() -> u64 {
    10
}

fn default_signature_timeout_secs() -> u64 {
    10
}

fn default_sync_response_limit() -> usize {
    5 * 1024 * 1024
}

fn default_proof_burst() -> u32 {
    5
}

fn default_proof_per_sec() -> u32 {
    1
}

/// Core tunables as they appear in the config file.
#[derive(Clone, Debug, Deserialize)]
pub struct CoreSettings {
    /// Delay-queue timeout in seconds.
    #[serde(default = "default_delay_timeout_secs")]
    pub delay_timeout_secs: u64,
    /// Signature-request timeout in seconds.
    #[serde(default = "default_signature_timeout_secs")]
    pub signature_timeout_secs: u64,
    /// Sync response byte budget.
    #[serde(default = "default_sync_response_limit")]
    pub sync_response_limit: usize,
    /// Proof burst per origin.
    #[serde(default = "default_proof_burst")]
    pub proof_burst: u32,
    /// Proof refill per origin per second.
    #[serde(default = "default_proof_per_sec")]
    pub proof_per_sec: u32,
}

impl Default for CoreSettings {
    fn default() -> Self {
        Self {
            delay_timeout_secs: default_delay_timeout_secs(),
            signature_timeout_secs: default_signature_timeout_secs(),
            sync_response_limit: default_sync_response_limit(),
            proof_burst: default_proof_burst(),
            proof_per_sec: default_proof_per_sec(),
        }
    }
}

impl CoreSettings {
    /// Convert into runtime tunables.
    pub fn to_core_config(&self) -> CoreConfig {
        CoreConfig {
            delay_timeout: Duration::from_secs(self.delay_timeout_secs),
            signature_timeout: Duration::from_secs(self.signature_timeout_secs),
            sync_response_limit: self.sync_response_limit,
            proof_burst: self.proof_burst,
            proof_per_sec: self.proof_per_sec,
        }
    }
}

/// Node configuration root.
#[derive(Clone, Debug, Deserialize)]
pub struct NodeConfig {
    /// Node settings.
    pub node: NodeSettings,
    /// Endpoint settings.
    pub endpoint: EndpointSettings,
    /// Core tunables.
    #[serde(default)]
    pub core: CoreSettings,
}

impl NodeConfig {
    /// Load a TOML config file.
    pub fn load(path: &std::path::Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|_| ConfigError::Read)?;
        Self::parse(&raw)
    }

    /// Parse TOML config text (schema only; used by fuzzing too).
    pub fn parse(raw: &str) -> Result<Self, ConfigError> {
        toml::from_str(raw).map_err(|_| ConfigError::Parse)
    }
}
