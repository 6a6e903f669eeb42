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

use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::{Mutex, RwLock};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::network::{Frame, FramedConnection};
use crate::protocol::{PeerInfo, WireMessage};
use crate::{AppError, AppResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PeerState {
    /// Dialed, TCP connect not finished yet
    ///
    /// transition: connected => Handshaking
    ///             connect failed => Closed
    Connecting = 0,

    /// Socket is up, waiting for Login (acceptor) or LoginRet (dialer)
    ///
    /// transition: successful Login / LoginRet => Joined
    ///             rejection or handshake deadline => Closed
    Handshaking = 1,

    /// Identity verified, routing traffic flows
    ///
    /// transition: Logout, socket error or a superseding link => Closed
    Joined = 2,

    /// Terminal, no transitions out
    Closed = 3,
}

impl PeerState {
    pub const fn can_transition_to(current: PeerState, target: PeerState) -> bool {
        match (current, target) {
            (PeerState::Closed, _) => false,
            (_, PeerState::Closed) => true,
            (PeerState::Connecting, PeerState::Handshaking) => true,
            (PeerState::Handshaking, PeerState::Joined) => true,
            _ => false,
        }
    }
}

/// Which side of the TCP connection we are.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectRole {
    Dial,
    Accept,
}

/// One subnet connection and what we know about its remote module.
#[derive(Debug)]
pub struct PeerConnection {
    temp_id: u64,
    role: ConnectRole,
    /// module id and address we dialed, None for accepted links
    dial_target: Option<(String, String)>,
    state: Mutex<PeerState>,
    info: RwLock<Option<PeerInfo>>,
    handshake_deadline: Instant,
    /// set when the link ended on purpose and must not be re-dialed
    normal_disconnect: AtomicBool,
    connection: FramedConnection,
}

impl PeerConnection {
    pub fn accepted(connection: FramedConnection, handshake_deadline: Instant) -> Self {
        PeerConnection {
            temp_id: connection.id(),
            role: ConnectRole::Accept,
            dial_target: None,
            state: Mutex::new(PeerState::Handshaking),
            info: RwLock::new(None),
            handshake_deadline,
            normal_disconnect: AtomicBool::new(false),
            connection,
        }
    }

    pub fn dialing(
        connection: FramedConnection,
        module_id: String,
        address: String,
        handshake_deadline: Instant,
    ) -> Self {
        PeerConnection {
            temp_id: connection.id(),
            role: ConnectRole::Dial,
            dial_target: Some((module_id, address)),
            state: Mutex::new(PeerState::Connecting),
            info: RwLock::new(None),
            handshake_deadline,
            normal_disconnect: AtomicBool::new(false),
            connection,
        }
    }

    pub fn temp_id(&self) -> u64 {
        self.temp_id
    }

    pub fn role(&self) -> ConnectRole {
        self.role
    }

    pub fn dial_target(&self) -> Option<(&str, &str)> {
        self.dial_target
            .as_ref()
            .map(|(module_id, address)| (module_id.as_str(), address.as_str()))
    }

    pub fn state(&self) -> PeerState {
        *self.state.lock()
    }

    pub fn transition(&self, target: PeerState) -> AppResult<()> {
        let mut state = self.state.lock();
        if *state == target {
            return Ok(());
        }
        if !PeerState::can_transition_to(*state, target) {
            return Err(AppError::IllegalState(format!(
                "peer {} can not move from {:?} to {:?}",
                self.temp_id, *state, target
            )));
        }
        debug!("peer {} {:?} -> {:?}", self.temp_id, *state, target);
        *state = target;
        Ok(())
    }

    pub fn info(&self) -> Option<PeerInfo> {
        self.info.read().clone()
    }

    pub fn set_info(&self, info: PeerInfo) {
        *self.info.write() = Some(info);
    }

    /// Verified module id, or the dialed one before the handshake completes.
    pub fn module_id(&self) -> Option<String> {
        if let Some(info) = self.info.read().as_ref() {
            return Some(info.module_id.clone());
        }
        self.dial_target
            .as_ref()
            .map(|(module_id, _)| module_id.clone())
    }

    pub fn handshake_deadline(&self) -> Instant {
        self.handshake_deadline
    }

    pub fn is_normal_disconnect(&self) -> bool {
        self.normal_disconnect.load(Ordering::Acquire)
    }

    pub fn set_normal_disconnect(&self) {
        self.normal_disconnect.store(true, Ordering::Release);
    }

    pub fn connection(&self) -> &FramedConnection {
        &self.connection
    }

    pub fn send_message<M: WireMessage>(&self, message: &M) -> AppResult<()> {
        self.connection.send_message(message)
    }

    pub fn send_frame(&self, frame: Frame) -> AppResult<()> {
        self.connection.enqueue_frame(frame)
    }

    /// Mark the peer closed and start the connection's graceful shutdown.
    pub fn terminate(&self) {
        if let Err(e) = self.transition(PeerState::Closed) {
            warn!("{e}");
        }
        self.connection.shutdown();
    }
}
