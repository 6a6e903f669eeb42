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

use bytes::Bytes;
use dashmap::DashMap;
use tracing::{debug, warn};

use crate::protocol::UpdateSession;
use crate::{AppError, AppResult};

/// Prefix of the keys recording which module of a type serves the client;
/// the module type follows the prefix.
pub const SESSION_KEY_BIND_PREFIX: &str = "_s0_bind_";
/// Connection id of the client on its gateway.
pub const SESSION_KEY_CONNECT_ID: &str = "_s0_connectid";
/// Primary key of the session in every module's session manager.
pub const SESSION_KEY_UUID: &str = "_s0_uuid";

/// Sending primitives a session needs from its module.
pub trait ModuleSender: Send + Sync {
    fn module_id(&self) -> &str;

    fn send_session_update(&self, update: UpdateSession) -> AppResult<()>;

    fn send_client_msg(&self, gate_id: &str, conn_id: &str, msg_id: u16, data: Bytes)
        -> AppResult<()>;

    fn close_client_connect(&self, gate_id: &str, conn_id: &str) -> AppResult<()>;
}

/// Key/value record of one client, replicated between the modules serving it.
///
/// Every key is read and written atomically on its own; there is no
/// transaction across keys.
#[derive(Debug, Default)]
pub struct Session {
    values: DashMap<String, String>,
}

impl Session {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_map(map: HashMap<String, String>) -> Self {
        Session {
            values: map.into_iter().collect(),
        }
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.values.get(key).map(|value| value.clone())
    }

    pub fn set(&self, key: impl Into<String>, value: impl Into<String>) {
        self.values.insert(key.into(), value.into());
    }

    pub fn has_key(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    /// `true` / `1` in any case; absent or anything else is false.
    pub fn get_bool(&self, key: &str) -> bool {
        self.get(key)
            .map(|value| value.eq_ignore_ascii_case("true") || value == "1")
            .unwrap_or(false)
    }

    /// Absent or unparsable values read as 0.
    pub fn get_i64(&self, key: &str) -> i64 {
        self.get(key)
            .and_then(|value| value.trim().parse().ok())
            .unwrap_or(0)
    }

    pub fn set_bool(&self, key: impl Into<String>, value: bool) {
        self.set(key, if value { "true" } else { "false" });
    }

    pub fn set_i64(&self, key: impl Into<String>, value: i64) {
        self.set(key, value.to_string());
    }

    pub fn uuid(&self) -> Option<String> {
        self.get(SESSION_KEY_UUID)
    }

    /// Use `SessionManager::update_uuid` for sessions held by a manager.
    pub(crate) fn set_uuid(&self, uuid: &str) {
        self.set(SESSION_KEY_UUID, uuid);
    }

    pub fn connect_id(&self) -> Option<String> {
        self.get(SESSION_KEY_CONNECT_ID)
    }

    pub fn set_connect_id(&self, conn_id: &str) {
        self.set(SESSION_KEY_CONNECT_ID, conn_id);
    }

    /// A verified session always carries a non-empty uuid.
    pub fn is_verified(&self) -> bool {
        self.uuid().is_some_and(|uuid| !uuid.is_empty())
    }

    pub fn bind(&self, module_type: &str) -> Option<String> {
        self.get(&format!("{SESSION_KEY_BIND_PREFIX}{module_type}"))
    }

    pub fn set_bind(&self, module_type: &str, module_id: &str) {
        self.set(format!("{SESSION_KEY_BIND_PREFIX}{module_type}"), module_id);
    }

    pub fn has_bind(&self, module_type: &str) -> bool {
        self.has_key(&format!("{SESSION_KEY_BIND_PREFIX}{module_type}"))
    }

    /// module type -> module id of every bound module
    pub fn bound_modules(&self) -> HashMap<String, String> {
        self.values
            .iter()
            .filter_map(|entry| {
                entry
                    .key()
                    .strip_prefix(SESSION_KEY_BIND_PREFIX)
                    .filter(|module_type| !module_type.is_empty())
                    .map(|module_type| (module_type.to_string(), entry.value().clone()))
            })
            .collect()
    }

    pub fn to_map(&self) -> HashMap<String, String> {
        self.values
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Overwrite every key present in `map`.
    pub fn update_from_map(&self, map: &HashMap<String, String>) {
        for (key, value) in map {
            self.values.insert(key.clone(), value.clone());
        }
    }

    /// Copy only the keys missing locally, returns how many were added.
    pub fn merge_missing(&self, map: &HashMap<String, String>) -> usize {
        let mut added = 0;
        for (key, value) in map {
            if let dashmap::mapref::entry::Entry::Vacant(vacant) = self.values.entry(key.clone()) {
                vacant.insert(value.clone());
                added += 1;
            }
        }
        added
    }

    pub fn merge_missing_from(&self, other: &Session) -> usize {
        self.merge_missing(&other.to_map())
    }

    fn sync_message(&self, from_module_id: &str, to_module_id: &str) -> UpdateSession {
        UpdateSession {
            from_module_id: from_module_id.to_string(),
            to_module_id: to_module_id.to_string(),
            client_conn_id: self.connect_id().unwrap_or_default(),
            session_uuid: self.uuid().unwrap_or_default(),
            session: self.to_map(),
        }
    }

    /// Push the whole session to every bound module except the sender's own.
    /// Returns how many updates were queued.
    pub fn sync_to_bound_modules(&self, sender: &dyn ModuleSender) -> usize {
        let mut sent = 0;
        for (module_type, module_id) in self.bound_modules() {
            if module_id == sender.module_id() {
                continue;
            }
            match sender.send_session_update(self.sync_message(sender.module_id(), &module_id)) {
                Ok(()) => sent += 1,
                Err(e) => warn!("session sync to {module_type} {module_id} failed: {e}"),
            }
        }
        debug!(
            "session {:?} synced to {sent} modules",
            self.uuid().unwrap_or_default()
        );
        sent
    }

    fn bound_gate(&self, gate_module_type: &str) -> AppResult<(String, String)> {
        let gate_id = self.bind(gate_module_type).ok_or_else(|| {
            AppError::UnknownPeer(format!("session has no {gate_module_type} bound"))
        })?;
        let conn_id = self
            .connect_id()
            .ok_or_else(|| AppError::UnknownClient("session has no connection id".into()))?;
        Ok((gate_id, conn_id))
    }

    /// Send bytes to the client through its bound gateway.
    pub fn send_msg(
        &self,
        sender: &dyn ModuleSender,
        gate_module_type: &str,
        msg_id: u16,
        data: Bytes,
    ) -> AppResult<()> {
        let (gate_id, conn_id) = self.bound_gate(gate_module_type)?;
        sender.send_client_msg(&gate_id, &conn_id, msg_id, data)
    }

    /// Ask the bound gateway to close the client's connection.
    pub fn close_connect(&self, sender: &dyn ModuleSender, gate_module_type: &str) -> AppResult<()> {
        let (gate_id, conn_id) = self.bound_gate(gate_module_type)?;
        sender.close_client_connect(&gate_id, &conn_id)
    }
}
