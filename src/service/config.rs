// Copyright 2025 jonefeewang@gmail.com
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

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::subnet::DuplicateLoginPolicyKind;
use crate::utils::LanePoolConfig;

use super::{AppError, AppResult};

/// Identity of this module inside the subnet.
#[derive(Debug, Default, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct GeneralConfig {
    pub module_id: String,
    /// duplicates are harmless, only used for naming and logs
    pub ordinal: u32,
    /// YYYYMMDDhhmm, 0 means take it from the local clock at startup
    pub version: u64,
    pub connect_priority: i64,
}

impl GeneralConfig {
    pub fn effective_version(&self) -> u64 {
        if self.version != 0 {
            return self.version;
        }
        chrono::Local::now()
            .format("%Y%m%d%H%M")
            .to_string()
            .parse()
            .unwrap_or_default()
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct NetworkConfig {
    pub ip: String,
    pub port: u16,
    pub max_connection: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            ip: "127.0.0.1".to_string(),
            port: 9500,
            max_connection: 1024,
        }
    }
}

impl NetworkConfig {
    pub fn listen_address(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }
}

/// Tuning of every framed connection in the subnet.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct ConnectionConfig {
    /// number of frames the outbound channel holds
    pub channel_capacity: usize,
    pub read_buffer_size: usize,
    /// a batch stops growing once it reaches this many bytes
    pub max_send_batch_bytes: usize,
    /// queued but unsent bytes above which enqueue fails with BufferFull
    pub max_queued_bytes: usize,
    pub shutdown_grace_ms: u64,
    pub max_frame_payload: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 4096,
            read_buffer_size: 64 * 1024,
            max_send_batch_bytes: 512 * 1024,
            max_queued_bytes: 32 * 1024 * 1024,
            shutdown_grace_ms: 2000,
            max_frame_payload: u16::MAX as usize,
        }
    }
}

impl ConnectionConfig {
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct SubnetConfig {
    pub handshake_timeout_ms: u64,
    /// 0 disables re-dialing
    pub reconnect_interval_ms: u64,
    /// 0 disables the liveness tick
    pub time_tick_interval_ms: u64,
    pub duplicate_login_policy: DuplicateLoginPolicyKind,
    /// module id -> address of the peers to dial at startup
    pub peers: HashMap<String, String>,
}

impl Default for SubnetConfig {
    fn default() -> Self {
        Self {
            handshake_timeout_ms: 20_000,
            reconnect_interval_ms: 5_000,
            time_tick_interval_ms: 10_000,
            duplicate_login_policy: DuplicateLoginPolicyKind::default(),
            peers: HashMap::new(),
        }
    }
}

impl SubnetConfig {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn reconnect_interval(&self) -> Option<Duration> {
        (self.reconnect_interval_ms > 0).then(|| Duration::from_millis(self.reconnect_interval_ms))
    }

    pub fn time_tick_interval(&self) -> Option<Duration> {
        (self.time_tick_interval_ms > 0).then(|| Duration::from_millis(self.time_tick_interval_ms))
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct LogConfig {
    pub dir: String,
    pub file_prefix: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            dir: "logs".to_string(),
            file_prefix: "stonemesh.log".to_string(),
        }
    }
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct NodeConfig {
    pub general: GeneralConfig,
    pub network: NetworkConfig,
    pub connection: ConnectionConfig,
    pub subnet: SubnetConfig,
    pub lane_pool: LanePoolConfig,
    pub log: LogConfig,
}

impl NodeConfig {
    pub fn set_up_config<P: AsRef<Path>>(path: P) -> AppResult<NodeConfig> {
        let path_str = path
            .as_ref()
            .to_str()
            .ok_or(AppError::InvalidValue(format!(
                "config file path: {}",
                path.as_ref().to_string_lossy()
            )))?;
        let config = config::Config::builder()
            .add_source(config::File::with_name(path_str))
            .build()?;

        let node_config: NodeConfig = config.try_deserialize()?;
        node_config.validate()?;
        Ok(node_config)
    }

    pub fn validate(&self) -> AppResult<()> {
        if self.general.module_id.is_empty() {
            return Err(AppError::InvalidValue("general.module_id is empty".into()));
        }
        if self.connection.max_frame_payload > u16::MAX as usize {
            return Err(AppError::InvalidValue(format!(
                "connection.max_frame_payload {} exceeds {}",
                self.connection.max_frame_payload,
                u16::MAX
            )));
        }
        if self.connection.channel_capacity == 0 {
            return Err(AppError::InvalidValue(
                "connection.channel_capacity must be positive".into(),
            ));
        }
        Ok(())
    }
}
