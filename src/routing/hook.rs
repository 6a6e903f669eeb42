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

use std::sync::Arc;

use bytes::Bytes;

use crate::protocol::PeerInfo;
use crate::session::Session;
use crate::AppResult;

/// Application message from another module.
#[derive(Debug, Clone)]
pub struct ModuleMessage {
    pub from: PeerInfo,
    pub msg_id: u16,
    pub data: Bytes,
}

/// Client message relayed by a gateway.
#[derive(Debug, Clone)]
pub struct ClientMessage {
    pub from_gate: PeerInfo,
    pub client_conn_id: String,
    pub msg_id: u16,
    pub data: Bytes,
}

/// Application callbacks of a module.
///
/// Called from the lane that owns the message's affinity key, so calls for
/// one sender (or one client) never overlap. An `Err` is logged and the lane
/// moves on.
pub trait ModuleHook: Send + Sync {
    fn on_module_message(&self, _message: ModuleMessage) -> AppResult<()> {
        Ok(())
    }

    fn on_client_message(&self, _session: Arc<Session>, _message: ClientMessage) -> AppResult<()> {
        Ok(())
    }

    fn on_module_joined(&self, _info: &PeerInfo) -> AppResult<()> {
        Ok(())
    }

    /// `from` asks this module to hand off its work and exit.
    fn on_safe_quit_request(&self, _from: &str) -> AppResult<()> {
        Ok(())
    }
}
