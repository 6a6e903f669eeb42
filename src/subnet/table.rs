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
use std::sync::Arc;

use parking_lot::Mutex;
use rand::seq::IteratorRandom;

use super::peer::{PeerConnection, PeerState};
use super::policy::{DuplicateLoginPolicy, LinkCandidate, Resolution};
use crate::protocol::module_type;
use crate::{AppError, AppResult};

#[derive(Debug)]
struct JoinedLink {
    peer: Arc<PeerConnection>,
    dialer_module_id: String,
    connect_priority: i64,
}

#[derive(Debug, Default)]
struct TableInner {
    connections: HashMap<u64, Arc<PeerConnection>>,
    joined: HashMap<String, JoinedLink>,
}

#[derive(Debug)]
pub enum JoinOutcome {
    /// the peer now holds the joined slot, `superseded` lost it
    Joined {
        superseded: Option<Arc<PeerConnection>>,
    },
    /// the slot stays with `existing`
    Rejected { existing: Arc<PeerConnection> },
}

/// Every live subnet connection, plus the one joined link per remote module.
///
/// A module id maps to at most one joined connection. Promotion to joined
/// and the duplicate check happen under the same lock.
#[derive(Debug, Default)]
pub struct PeerTable {
    inner: Mutex<TableInner>,
}

impl PeerTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, peer: Arc<PeerConnection>) {
        self.inner.lock().connections.insert(peer.temp_id(), peer);
    }

    /// Track a new dial unless a link to its target already exists.
    pub fn insert_dial(&self, peer: Arc<PeerConnection>) -> bool {
        let Some((target, _)) = peer.dial_target() else {
            return false;
        };
        let mut inner = self.inner.lock();
        if Self::has_link_locked(&inner, target) {
            return false;
        }
        inner.connections.insert(peer.temp_id(), peer.clone());
        true
    }

    /// Forget a connection. Returns true when it held a joined slot.
    pub fn remove(&self, temp_id: u64) -> bool {
        let mut inner = self.inner.lock();
        let Some(peer) = inner.connections.remove(&temp_id) else {
            return false;
        };
        let Some(module_id) = peer.module_id() else {
            return false;
        };
        let holds_slot = inner
            .joined
            .get(&module_id)
            .is_some_and(|link| link.peer.temp_id() == temp_id);
        if holds_slot {
            inner.joined.remove(&module_id);
        }
        holds_slot
    }

    pub fn get(&self, temp_id: u64) -> Option<Arc<PeerConnection>> {
        self.inner.lock().connections.get(&temp_id).cloned()
    }

    pub fn get_joined(&self, module_id: &str) -> Option<Arc<PeerConnection>> {
        self.inner
            .lock()
            .joined
            .get(module_id)
            .map(|link| link.peer.clone())
    }

    /// True when a joined link exists or a dial to `module_id` is in flight.
    pub fn has_link_to(&self, module_id: &str) -> bool {
        Self::has_link_locked(&self.inner.lock(), module_id)
    }

    fn has_link_locked(inner: &TableInner, module_id: &str) -> bool {
        if inner.joined.contains_key(module_id) {
            return true;
        }
        inner.connections.values().any(|peer| {
            peer.state() != PeerState::Closed
                && peer
                    .dial_target()
                    .is_some_and(|(target, _)| target == module_id)
        })
    }

    /// Move a handshaking connection into the joined slot of its module,
    /// asking `policy` when the slot is already taken.
    pub fn promote(
        &self,
        peer: &Arc<PeerConnection>,
        candidate: LinkCandidate<'_>,
        policy: &dyn DuplicateLoginPolicy,
    ) -> AppResult<JoinOutcome> {
        let module_id = peer.module_id().ok_or_else(|| {
            AppError::IllegalState(format!("peer {} has no module id", peer.temp_id()))
        })?;

        let mut inner = self.inner.lock();
        if !inner.connections.contains_key(&peer.temp_id()) {
            return Err(AppError::IllegalState(format!(
                "peer {} is no longer tracked",
                peer.temp_id()
            )));
        }

        let mut superseded = None;
        if let Some(existing) = inner.joined.get(&module_id) {
            if existing.peer.temp_id() == peer.temp_id() {
                return Ok(JoinOutcome::Joined { superseded: None });
            }
            let existing_candidate = LinkCandidate {
                temp_id: existing.peer.temp_id(),
                dialer_module_id: &existing.dialer_module_id,
                connect_priority: existing.connect_priority,
            };
            match policy.resolve(&existing_candidate, &candidate) {
                Resolution::KeepExisting => {
                    return Ok(JoinOutcome::Rejected {
                        existing: existing.peer.clone(),
                    });
                }
                Resolution::ReplaceWithIncoming => superseded = Some(existing.peer.clone()),
            }
        }

        peer.transition(PeerState::Joined)?;
        inner.joined.insert(
            module_id,
            JoinedLink {
                peer: peer.clone(),
                dialer_module_id: candidate.dialer_module_id.to_string(),
                connect_priority: candidate.connect_priority,
            },
        );
        Ok(JoinOutcome::Joined { superseded })
    }

    pub fn joined_peers(&self) -> Vec<Arc<PeerConnection>> {
        self.inner
            .lock()
            .joined
            .values()
            .map(|link| link.peer.clone())
            .collect()
    }

    /// A random joined peer whose module id has the given type prefix.
    pub fn random_joined(&self, wanted_type: &str) -> Option<Arc<PeerConnection>> {
        self.inner
            .lock()
            .joined
            .iter()
            .filter(|(module_id, _)| module_type(module_id) == wanted_type)
            .map(|(_, link)| link.peer.clone())
            .choose(&mut rand::thread_rng())
    }

    pub fn connection_count(&self) -> usize {
        self.inner.lock().connections.len()
    }

    pub fn joined_count(&self) -> usize {
        self.inner.lock().joined.len()
    }

    pub fn all_connections(&self) -> Vec<Arc<PeerConnection>> {
        self.inner.lock().connections.values().cloned().collect()
    }
}
