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

//! Subnet membership and inbound dispatch
//!
//! - `SubnetManager`: accept / dial, Login handshake, control commands
//! - `PeerTable`: live connections and the joined link of every module
//! - `DuplicateLoginPolicy`: which link survives when a module joins twice
//! - `LaneDispatcher`: per affinity key ordered hand-off to the routing layer

pub use dispatch::{affinity_key, lane_for, LaneDispatcher, SubnetHandler};
pub use manager::SubnetManager;
pub use peer::{ConnectRole, PeerConnection, PeerState};
pub use policy::{
    DuplicateLoginPolicy, DuplicateLoginPolicyKind, KeepExisting, LinkCandidate,
    PriorityThenArrival, Resolution,
};
pub use registry::PeerRegistry;
pub use table::{JoinOutcome, PeerTable};

mod dispatch;
mod manager;
mod peer;
mod policy;
mod registry;
mod table;
