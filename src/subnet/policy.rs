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

use std::fmt::Debug;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// A link competing for the joined slot of one remote module.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkCandidate<'a> {
    pub temp_id: u64,
    /// module that opened the TCP connection
    pub dialer_module_id: &'a str,
    /// priority announced by the dialer
    pub connect_priority: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    KeepExisting,
    ReplaceWithIncoming,
}

/// Decides which of two links to the same module survives.
///
/// Both ends of a mutual dial run the same policy on the same inputs, so a
/// policy must only look at values both ends agree on.
pub trait DuplicateLoginPolicy: Send + Sync + Debug {
    fn resolve(&self, existing: &LinkCandidate<'_>, incoming: &LinkCandidate<'_>) -> Resolution;
}

/// The first link to join wins, later ones are refused.
#[derive(Debug, Default, Clone, Copy)]
pub struct KeepExisting;

impl DuplicateLoginPolicy for KeepExisting {
    fn resolve(&self, _existing: &LinkCandidate<'_>, _incoming: &LinkCandidate<'_>) -> Resolution {
        Resolution::KeepExisting
    }
}

/// Higher connect priority wins. On a tie between links opened by different
/// modules the one dialed by the lexicographically smaller module id wins;
/// otherwise the link that joined first stays.
#[derive(Debug, Default, Clone, Copy)]
pub struct PriorityThenArrival;

impl DuplicateLoginPolicy for PriorityThenArrival {
    fn resolve(&self, existing: &LinkCandidate<'_>, incoming: &LinkCandidate<'_>) -> Resolution {
        if incoming.connect_priority != existing.connect_priority {
            return if incoming.connect_priority > existing.connect_priority {
                Resolution::ReplaceWithIncoming
            } else {
                Resolution::KeepExisting
            };
        }
        if incoming.dialer_module_id < existing.dialer_module_id {
            return Resolution::ReplaceWithIncoming;
        }
        Resolution::KeepExisting
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DuplicateLoginPolicyKind {
    KeepExisting,
    #[default]
    PriorityThenArrival,
}

impl DuplicateLoginPolicyKind {
    pub fn build(self) -> Arc<dyn DuplicateLoginPolicy> {
        match self {
            DuplicateLoginPolicyKind::KeepExisting => Arc::new(KeepExisting),
            DuplicateLoginPolicyKind::PriorityThenArrival => Arc::new(PriorityThenArrival),
        }
    }
}
