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
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, OwnedSemaphorePermit};
use tokio::time::{self, Instant};
use tokio_stream::StreamExt;
use tracing::{debug, error, info, trace, warn};

use super::dispatch::{LaneDispatcher, SubnetHandler};
use super::peer::{ConnectRole, PeerConnection, PeerState};
use super::policy::{DuplicateLoginPolicy, LinkCandidate};
use super::registry::PeerRegistry;
use super::table::{JoinOutcome, PeerTable};
use crate::network::{attach_stream, split_stream, FrameReader, FramedConnection, InboundFrame};
use crate::protocol::{
    DecodeTable, Login, LoginRet, LoginRetCode, Logout, Message, PeerInfo, TimeTick, WireMessage,
};
use crate::service::{ConnectionConfig, NodeConfig, SubnetConfig};
use crate::{AppError, AppResult, Shutdown};

/// Membership of this module in the subnet.
///
/// Runs the Login / LoginRet handshake on every accepted and dialed
/// connection, keeps exactly one joined link per remote module, handles
/// control commands on the receive path and hands routing traffic to the
/// lane dispatcher.
pub struct SubnetManager {
    local: PeerInfo,
    connect_priority: i64,
    connection_config: ConnectionConfig,
    subnet_config: SubnetConfig,
    table: Arc<PeerTable>,
    registry: Arc<PeerRegistry>,
    decode_table: DecodeTable,
    dispatcher: LaneDispatcher,
    handler: Arc<dyn SubnetHandler>,
    policy: Arc<dyn DuplicateLoginPolicy>,
    notify_shutdown: broadcast::Sender<()>,
    shutdown_complete_tx: mpsc::Sender<()>,
    next_temp_id: AtomicU64,
    stopping: AtomicBool,
}

impl SubnetManager {
    pub fn new(
        config: &NodeConfig,
        table: Arc<PeerTable>,
        registry: Arc<PeerRegistry>,
        handler: Arc<dyn SubnetHandler>,
        notify_shutdown: broadcast::Sender<()>,
        shutdown_complete_tx: mpsc::Sender<()>,
    ) -> Arc<Self> {
        let local = PeerInfo {
            module_id: config.general.module_id.clone(),
            address: config.network.listen_address(),
            ordinal: config.general.ordinal,
            version: config.general.effective_version(),
        };
        let dispatcher = LaneDispatcher::new(
            handler.clone(),
            &config.lane_pool,
            notify_shutdown.clone(),
            shutdown_complete_tx.clone(),
        );
        info!(
            "subnet manager for {} (version {}) dispatching on {} lanes",
            local.module_id,
            local.version,
            dispatcher.lane_count()
        );

        Arc::new(SubnetManager {
            local,
            connect_priority: config.general.connect_priority,
            connection_config: config.connection.clone(),
            subnet_config: config.subnet.clone(),
            table,
            registry,
            decode_table: DecodeTable::standard(),
            dispatcher,
            handler,
            policy: config.subnet.duplicate_login_policy.build(),
            notify_shutdown,
            shutdown_complete_tx,
            next_temp_id: AtomicU64::new(1),
            stopping: AtomicBool::new(false),
        })
    }

    pub fn local_info(&self) -> &PeerInfo {
        &self.local
    }

    pub fn table(&self) -> &Arc<PeerTable> {
        &self.table
    }

    pub fn registry(&self) -> &Arc<PeerRegistry> {
        &self.registry
    }

    pub fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::Acquire)
    }

    pub fn get_peer(&self, module_id: &str) -> Option<Arc<PeerConnection>> {
        self.table.get_joined(module_id)
    }

    pub fn random_peer(&self, module_type: &str) -> Option<Arc<PeerConnection>> {
        self.table.random_joined(module_type)
    }

    pub fn joined_peers(&self) -> Vec<Arc<PeerConnection>> {
        self.table.joined_peers()
    }

    pub fn send_to<M: WireMessage>(&self, module_id: &str, message: &M) -> AppResult<()> {
        let peer = self
            .table
            .get_joined(module_id)
            .ok_or_else(|| AppError::UnknownPeer(module_id.to_string()))?;
        peer.send_message(message)
    }

    /// Send to every joined peer, returns how many accepted the frame.
    pub fn broadcast<M: WireMessage>(&self, message: &M) -> usize {
        let mut sent = 0;
        for peer in self.table.joined_peers() {
            match peer.send_message(message) {
                Ok(()) => sent += 1,
                Err(e) => warn!(
                    "broadcast {:?} to peer {} failed: {e}",
                    M::COMMAND,
                    peer.temp_id()
                ),
            }
        }
        sent
    }

    /// Dial the configured peers and start the liveness tick.
    pub fn start(self: &Arc<Self>) {
        self.bind_subnet(&self.subnet_config.peers);
        self.spawn_time_tick();
    }

    pub fn bind_subnet(self: &Arc<Self>, peers: &HashMap<String, String>) {
        for (module_id, address) in peers {
            self.try_connect(module_id, address);
        }
    }

    fn next_temp_id(&self) -> u64 {
        self.next_temp_id.fetch_add(1, Ordering::Relaxed)
    }

    fn handshake_deadline(&self) -> Instant {
        Instant::now() + self.subnet_config.handshake_timeout()
    }

    fn login_ret(&self, code: LoginRetCode) -> LoginRet {
        LoginRet {
            code,
            destination: self.local.clone(),
        }
    }

    /// Take over a freshly accepted socket. The permit is released when the
    /// connection ends.
    pub fn on_accept(self: &Arc<Self>, socket: TcpStream, permit: Option<OwnedSemaphorePermit>) {
        let temp_id = self.next_temp_id();
        let remote = socket
            .peer_addr()
            .map(|addr| addr.to_string())
            .unwrap_or_default();
        let (connection, reader) = split_stream(socket, temp_id, &self.connection_config);
        let peer = Arc::new(PeerConnection::accepted(
            connection,
            self.handshake_deadline(),
        ));
        self.table.insert(peer.clone());
        debug!("accepted peer {temp_id} from {remote}");

        let manager = self.clone();
        tokio::spawn(async move {
            manager.run_peer(peer, reader).await;
            drop(permit);
        });
    }

    /// Dial `module_id` unless it is ourselves or a link to it exists.
    pub fn try_connect(self: &Arc<Self>, module_id: &str, address: &str) -> bool {
        if module_id == self.local.module_id || self.is_stopping() {
            return false;
        }
        let temp_id = self.next_temp_id();
        let connection = FramedConnection::new(temp_id, &self.connection_config);
        let peer = Arc::new(PeerConnection::dialing(
            connection,
            module_id.to_string(),
            address.to_string(),
            self.handshake_deadline(),
        ));
        if !self.table.insert_dial(peer.clone()) {
            debug!("link to {module_id} exists, not dialing");
            return false;
        }

        let manager = self.clone();
        tokio::spawn(async move { manager.dial(peer).await });
        true
    }

    async fn dial(self: Arc<Self>, peer: Arc<PeerConnection>) {
        let Some((module_id, address)) = peer
            .dial_target()
            .map(|(module_id, address)| (module_id.to_string(), address.to_string()))
        else {
            return;
        };
        let mut shutdown = Shutdown::subscribe(&self.notify_shutdown);
        let connect = time::timeout_at(peer.handshake_deadline(), TcpStream::connect(&address));

        let socket = tokio::select! {
            result = connect => match result {
                Ok(Ok(socket)) => socket,
                Ok(Err(e)) => {
                    warn!("dial {module_id} at {address} failed: {e}");
                    self.close_peer(&peer, None);
                    return;
                }
                Err(_) => {
                    self.close_peer(&peer, Some(AppError::HandshakeTimeout));
                    return;
                }
            },
            _ = shutdown.recv() => {
                self.close_peer(&peer, None);
                return;
            }
        };

        let reader = attach_stream(peer.connection(), socket, &self.connection_config);
        let login = Login {
            info: self.local.clone(),
            connect_priority: self.connect_priority,
        };
        if let Err(e) = peer
            .transition(PeerState::Handshaking)
            .and_then(|_| peer.send_message(&login))
        {
            self.close_peer(&peer, Some(e));
            return;
        }
        debug!("peer {} dialed {module_id} at {address}", peer.temp_id());
        self.run_peer(peer, reader).await;
    }

    /// Receive loop of one connection, from handshake to close.
    async fn run_peer(self: Arc<Self>, peer: Arc<PeerConnection>, mut reader: FrameReader) {
        let mut shutdown = Shutdown::subscribe(&self.notify_shutdown);
        let _shutdown_complete = self.shutdown_complete_tx.clone();
        let deadline = peer.handshake_deadline();

        let reason = loop {
            let handshaking = peer.state() == PeerState::Handshaking;
            tokio::select! {
                next = reader.next() => match next {
                    Some(Ok(frame)) => {
                        if let Err(e) = self.on_frame(&peer, frame) {
                            if e.is_connection_fatal() {
                                break Some(e);
                            }
                            warn!("peer {} dropped a frame: {e}", peer.temp_id());
                        }
                        if peer.state() == PeerState::Closed {
                            break None;
                        }
                    }
                    Some(Err(e)) => break Some(e),
                    None => break None,
                },
                _ = time::sleep_until(deadline), if handshaking => {
                    break Some(AppError::HandshakeTimeout);
                }
                _ = peer.connection().closed() => break None,
                _ = shutdown.recv() => break None,
            }
        };
        self.close_peer(&peer, reason);
    }

    fn close_peer(self: &Arc<Self>, peer: &Arc<PeerConnection>, reason: Option<AppError>) {
        peer.terminate();
        let held_slot = self.table.remove(peer.temp_id());
        let module_id = peer.module_id().unwrap_or_default();
        match &reason {
            Some(AppError::HandshakeTimeout) => error!(
                "peer {} ({module_id}) did not finish the handshake in {:?}, closed",
                peer.temp_id(),
                self.subnet_config.handshake_timeout()
            ),
            Some(e) => warn!("peer {} ({module_id}) closed: {e}", peer.temp_id()),
            None => info!("peer {} ({module_id}) closed", peer.temp_id()),
        }
        if held_slot {
            self.handler.on_peer_closed(peer);
        }
        self.schedule_redial(peer);
    }

    fn schedule_redial(self: &Arc<Self>, peer: &PeerConnection) {
        if peer.role() != ConnectRole::Dial || peer.is_normal_disconnect() || self.is_stopping() {
            return;
        }
        let Some(interval) = self.subnet_config.reconnect_interval() else {
            return;
        };
        let Some((module_id, address)) = peer
            .dial_target()
            .map(|(module_id, address)| (module_id.to_string(), address.to_string()))
        else {
            return;
        };

        let manager = self.clone();
        tokio::spawn(async move {
            let mut shutdown = Shutdown::subscribe(&manager.notify_shutdown);
            tokio::select! {
                _ = time::sleep(interval) => {
                    debug!("re-dialing {module_id} at {address}");
                    manager.try_connect(&module_id, &address);
                }
                _ = shutdown.recv() => {}
            }
        });
    }

    fn on_frame(&self, peer: &Arc<PeerConnection>, frame: InboundFrame) -> AppResult<()> {
        let message = self.decode_table.decode(frame)?;
        if message.is_control() {
            return self.on_control(peer, message);
        }
        if peer.state() != PeerState::Joined {
            return Err(AppError::IllegalState(format!(
                "{:?} from peer {} before the handshake",
                message.command(),
                peer.temp_id()
            )));
        }
        self.dispatcher.dispatch(peer.clone(), message)
    }

    fn on_control(&self, peer: &Arc<PeerConnection>, message: Message) -> AppResult<()> {
        match message {
            Message::Test(test) => {
                debug!("test command from peer {}: {}", peer.temp_id(), test.text);
                Ok(())
            }
            Message::TimeTick(tick) => {
                trace!("time tick from peer {}: {}", peer.temp_id(), tick.unix_millis);
                Ok(())
            }
            Message::Login(login) => self.on_login(peer, login),
            Message::LoginRet(ret) => self.on_login_ret(peer, ret),
            Message::Logout(logout) => {
                let module_id = peer.module_id().unwrap_or_default();
                if logout.module_id != module_id {
                    warn!(
                        "peer {} ({module_id}) logged out as {}",
                        peer.temp_id(),
                        logout.module_id
                    );
                }
                info!("peer {} ({module_id}) logged out", peer.temp_id());
                peer.set_normal_disconnect();
                if peer.state() == PeerState::Joined {
                    self.registry.remove(&module_id);
                }
                peer.terminate();
                Ok(())
            }
            Message::NotifyAllInfo(notify) => {
                for info in notify.peers {
                    if info.module_id != self.local.module_id {
                        self.registry.add(info);
                    }
                }
                Ok(())
            }
            other => Err(AppError::IllegalState(format!(
                "{:?} is not a control command",
                other.command()
            ))),
        }
    }

    fn on_login(&self, peer: &Arc<PeerConnection>, login: Login) -> AppResult<()> {
        if peer.role() != ConnectRole::Accept || peer.state() != PeerState::Handshaking {
            return Err(AppError::IllegalState(format!(
                "unexpected login on peer {} in {:?}",
                peer.temp_id(),
                peer.state()
            )));
        }
        let module_id = login.info.module_id.clone();
        if module_id.is_empty() || module_id == self.local.module_id {
            self.refuse_login(peer, LoginRetCode::IdentityError);
            return Err(AppError::HandshakeRejected(format!(
                "peer {} presented identity {:?}",
                peer.temp_id(),
                module_id
            )));
        }

        peer.set_info(login.info.clone());
        let candidate = LinkCandidate {
            temp_id: peer.temp_id(),
            dialer_module_id: &module_id,
            connect_priority: login.connect_priority,
        };
        match self.table.promote(peer, candidate, self.policy.as_ref())? {
            JoinOutcome::Joined { superseded } => {
                if let Some(old) = superseded {
                    self.retire(&old);
                }
                peer
                    .send_message(&self.login_ret(LoginRetCode::Success))
                    .map_err(|e| {
                        AppError::HandshakeRejected(format!(
                            "login ret to peer {} not queued: {e}",
                            peer.temp_id()
                        ))
                    })?;
                self.on_joined(peer, login.info);
                Ok(())
            }
            JoinOutcome::Rejected { existing } => {
                peer.set_normal_disconnect();
                self.refuse_login(peer, LoginRetCode::DuplicateConnection);
                Err(AppError::HandshakeRejected(format!(
                    "{module_id} is already joined on peer {}",
                    existing.temp_id()
                )))
            }
        }
    }

    /// Best effort answer to a login that is about to be rejected.
    fn refuse_login(&self, peer: &PeerConnection, code: LoginRetCode) {
        if let Err(e) = peer.send_message(&self.login_ret(code)) {
            debug!("peer {} not told about {code:?}: {e}", peer.temp_id());
        }
    }

    fn on_login_ret(&self, peer: &Arc<PeerConnection>, ret: LoginRet) -> AppResult<()> {
        if peer.role() != ConnectRole::Dial {
            return Err(AppError::IllegalState(format!(
                "login ret on accepted peer {}",
                peer.temp_id()
            )));
        }
        match ret.code {
            LoginRetCode::DuplicateConnection => {
                peer.set_normal_disconnect();
                Err(AppError::HandshakeRejected(format!(
                    "{} already has a link from us",
                    ret.destination.module_id
                )))
            }
            LoginRetCode::IdentityError => Err(AppError::HandshakeRejected(format!(
                "{} rejected identity {}",
                ret.destination.module_id, self.local.module_id
            ))),
            LoginRetCode::Success => {
                if peer.state() != PeerState::Handshaking {
                    return Err(AppError::IllegalState(format!(
                        "login ret on peer {} in {:?}",
                        peer.temp_id(),
                        peer.state()
                    )));
                }
                if let Some((target, _)) = peer.dial_target() {
                    if target != ret.destination.module_id {
                        warn!(
                            "dialed {target} but {} answered",
                            ret.destination.module_id
                        );
                    }
                }
                peer.set_info(ret.destination.clone());
                let candidate = LinkCandidate {
                    temp_id: peer.temp_id(),
                    dialer_module_id: &self.local.module_id,
                    connect_priority: self.connect_priority,
                };
                match self.table.promote(peer, candidate, self.policy.as_ref())? {
                    JoinOutcome::Joined { superseded } => {
                        if let Some(old) = superseded {
                            self.retire(&old);
                        }
                        self.on_joined(peer, ret.destination);
                        Ok(())
                    }
                    JoinOutcome::Rejected { existing } => {
                        peer.set_normal_disconnect();
                        Err(AppError::HandshakeRejected(format!(
                            "{} is already joined on peer {}",
                            ret.destination.module_id,
                            existing.temp_id()
                        )))
                    }
                }
            }
        }
    }

    fn on_joined(&self, peer: &Arc<PeerConnection>, info: PeerInfo) {
        info!(
            "peer {} joined as {} ({:?}, {})",
            peer.temp_id(),
            info.module_id,
            peer.role(),
            info.address
        );
        self.registry.add(info);
        self.handler.on_peer_joined(peer);
    }

    /// Close a link that lost its joined slot; it is never re-dialed.
    fn retire(&self, old: &Arc<PeerConnection>) {
        old.set_normal_disconnect();
        if old.role() == ConnectRole::Accept {
            if let Err(e) = old.send_message(&self.login_ret(LoginRetCode::DuplicateConnection)) {
                debug!("peer {} not told about supersession: {e}", old.temp_id());
            }
        }
        info!("peer {} superseded by a preferred link", old.temp_id());
        old.terminate();
    }

    fn spawn_time_tick(self: &Arc<Self>) {
        let Some(period) = self.subnet_config.time_tick_interval() else {
            return;
        };
        let manager = self.clone();
        tokio::spawn(async move {
            let mut shutdown = Shutdown::subscribe(&manager.notify_shutdown);
            let mut interval = time::interval(period);
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let sent = manager.broadcast(&TimeTick::now());
                        trace!("time tick sent to {sent} peers");
                    }
                    _ = shutdown.recv() => break,
                }
            }
        });
    }

    /// Tell every joined peer we are leaving and close the links.
    pub fn logout_all(&self) {
        self.stopping.store(true, Ordering::Release);
        let logout = Logout {
            module_id: self.local.module_id.clone(),
        };
        for peer in self.table.all_connections() {
            peer.set_normal_disconnect();
            if peer.state() == PeerState::Joined {
                if let Err(e) = peer.send_message(&logout) {
                    debug!("logout to peer {} not queued: {e}", peer.temp_id());
                }
            }
            peer.terminate();
        }
        info!("{} logged out of the subnet", self.local.module_id);
    }
}

impl std::fmt::Debug for SubnetManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubnetManager")
            .field("local", &self.local)
            .field("connections", &self.table.connection_count())
            .field("joined", &self.table.joined_count())
            .field("dispatcher", &self.dispatcher)
            .finish()
    }
}
