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

use parking_lot::Mutex;

use crate::protocol::PeerInfo;

/// Known peer identities, whether or not a link to them is up.
///
/// Filled from successful handshakes and NotifyAllInfo broadcasts, pruned on
/// Logout.
#[derive(Debug, Default)]
pub struct PeerRegistry {
    peers: Mutex<HashMap<String, PeerInfo>>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true when the module was not known before.
    pub fn add(&self, info: PeerInfo) -> bool {
        self.peers
            .lock()
            .insert(info.module_id.clone(), info)
            .is_none()
    }

    pub fn remove(&self, module_id: &str) -> Option<PeerInfo> {
        self.peers.lock().remove(module_id)
    }

    pub fn get(&self, module_id: &str) -> Option<PeerInfo> {
        self.peers.lock().get(module_id).cloned()
    }

    pub fn all(&self) -> Vec<PeerInfo> {
        let mut peers: Vec<_> = self.peers.lock().values().cloned().collect();
        peers.sort_by(|a, b| a.module_id.cmp(&b.module_id));
        peers
    }

    pub fn len(&self) -> usize {
        self.peers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.lock().is_empty()
    }
}
