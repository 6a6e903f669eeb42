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
use parking_lot::RwLock;
use tracing::{debug, error, info, trace, warn};

use super::client::{ClientLink, ClientRegistry};
use super::hook::{ClientMessage, ModuleHook, ModuleMessage};
use crate::protocol::{
    module_type, ForwardFromGate, ForwardToClient, ForwardToModule, Message, PeerInfo,
    PeerJoinedNotify, ReqCloseConnect, SafeQuitRequest, UpdateSession, WireMessage,
};
use crate::session::{ModuleSender, ReconcileMode, Session, SessionManager, SESSION_KEY_UUID};
use crate::subnet::{PeerConnection, PeerRegistry, PeerTable, SubnetHandler};
use crate::{AppError, AppResult};

/// Routing decisions of one module.
///
/// Outbound it offers "send to module X" and "send to client Y behind
/// gateway G"; inbound it receives every routing message the lanes hand
/// up, delivers locally or forwards, and keeps the local session copies in
/// step with their snapshots.
pub struct Router {
    module_id: String,
    table: Arc<PeerTable>,
    registry: Arc<PeerRegistry>,
    sessions: Arc<SessionManager>,
    clients: Option<Arc<dyn ClientRegistry>>,
    hook: RwLock<Option<Arc<dyn ModuleHook>>>,
}

impl Router {
    pub fn new(
        module_id: impl Into<String>,
        table: Arc<PeerTable>,
        registry: Arc<PeerRegistry>,
        sessions: Arc<SessionManager>,
        clients: Option<Arc<dyn ClientRegistry>>,
    ) -> Self {
        Router {
            module_id: module_id.into(),
            table,
            registry,
            sessions,
            clients,
            hook: RwLock::new(None),
        }
    }

    pub fn set_hook(&self, hook: Arc<dyn ModuleHook>) {
        *self.hook.write() = Some(hook);
    }

    fn hook(&self) -> Option<Arc<dyn ModuleHook>> {
        self.hook.read().clone()
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    /// True when this module holds client connections.
    pub fn is_gateway(&self) -> bool {
        self.clients.is_some()
    }

    fn joined_peer(&self, module_id: &str) -> AppResult<Arc<PeerConnection>> {
        self.table.get_joined(module_id).ok_or_else(|| {
            warn!("{} has no link to module {module_id}", self.module_id);
            AppError::UnknownPeer(module_id.to_string())
        })
    }

    fn send_to<M: WireMessage>(&self, module_id: &str, message: &M) -> AppResult<()> {
        self.joined_peer(module_id)?.send_message(message)
    }

    pub fn send_module_msg(&self, to: &str, msg_id: u16, data: Bytes) -> AppResult<()> {
        let forward = ForwardToModule {
            from_module_id: self.module_id.clone(),
            to_module_id: to.to_string(),
            msg_id,
            data,
        };
        self.send_to(to, &forward)
    }

    /// Returns how many modules accepted the message.
    pub fn broadcast_module_msg(&self, msg_id: u16, data: Bytes) -> usize {
        let mut sent = 0;
        for peer in self.table.joined_peers() {
            let Some(to) = peer.module_id() else {
                continue;
            };
            let forward = ForwardToModule {
                from_module_id: self.module_id.clone(),
                to_module_id: to,
                msg_id,
                data: data.clone(),
            };
            match peer.send_message(&forward) {
                Ok(()) => sent += 1,
                Err(e) => warn!("broadcast to {} failed: {e}", forward.to_module_id),
            }
        }
        sent
    }

    /// A random joined module of the given type, for load balancing.
    pub fn balance_module_id(&self, module_type: &str) -> Option<String> {
        self.table
            .random_joined(module_type)
            .and_then(|peer| peer.module_id())
    }

    pub fn send_bytes_to_client(
        &self,
        gate_id: &str,
        conn_id: &str,
        msg_id: u16,
        data: Bytes,
    ) -> AppResult<()> {
        if gate_id == self.module_id {
            return self.deliver_to_local_client(&self.module_id, conn_id, msg_id, data);
        }
        let forward = ForwardToClient {
            from_module_id: self.module_id.clone(),
            to_gate_id: gate_id.to_string(),
            to_client_id: conn_id.to_string(),
            msg_id,
            data,
        };
        self.send_to(gate_id, &forward)
    }

    fn local_client(&self, conn_id: &str) -> AppResult<Arc<dyn ClientLink>> {
        let clients = self.clients.as_ref().ok_or_else(|| {
            AppError::UnknownClient(format!("{} is not a gateway", self.module_id))
        })?;
        clients
            .get_client(conn_id)
            .ok_or_else(|| AppError::UnknownClient(conn_id.to_string()))
    }

    fn deliver_to_local_client(
        &self,
        from_module_id: &str,
        conn_id: &str,
        msg_id: u16,
        data: Bytes,
    ) -> AppResult<()> {
        let client = self.local_client(conn_id)?;
        if from_module_id != self.module_id {
            client
                .session()
                .set_bind(module_type(from_module_id), from_module_id);
        }
        client.send(msg_id, data)
    }

    /// Gateway side: relay a client message to `to` with the client session.
    pub fn forward_client_msg_to_module(
        &self,
        client: &dyn ClientLink,
        to: &str,
        msg_id: u16,
        data: Bytes,
    ) -> AppResult<()> {
        let forward = ForwardFromGate {
            from_gate_id: self.module_id.clone(),
            to_module_id: to.to_string(),
            client_conn_id: client.connection_id().to_string(),
            session: client.session().to_map(),
            msg_id,
            data,
        };
        self.send_to(to, &forward)
    }

    /// Close a client connection, locally or through its gateway.
    pub fn req_close_connect(&self, gate_id: &str, conn_id: &str) -> AppResult<()> {
        if gate_id == self.module_id {
            let client = self.local_client(conn_id)?;
            info!("closing client {conn_id} on request");
            client.terminate();
            return Ok(());
        }
        let request = ReqCloseConnect {
            from_module_id: self.module_id.clone(),
            to_gate_id: gate_id.to_string(),
            client_conn_id: conn_id.to_string(),
        };
        self.send_to(gate_id, &request)
    }

    pub fn request_safe_quit(&self, target: &str) -> AppResult<()> {
        self.send_to(
            target,
            &SafeQuitRequest {
                target_module_id: target.to_string(),
            },
        )
    }

    fn sender_info(peer: &PeerConnection, fallback_id: &str) -> PeerInfo {
        peer.info().unwrap_or_else(|| PeerInfo {
            module_id: fallback_id.to_string(),
            ..Default::default()
        })
    }

    fn on_forward_to_module(&self, peer: &PeerConnection, forward: ForwardToModule) -> AppResult<()> {
        if forward.to_module_id != self.module_id {
            return Err(AppError::IllegalState(format!(
                "module message for {} arrived at {}",
                forward.to_module_id, self.module_id
            )));
        }
        let Some(hook) = self.hook() else {
            trace!("no hook, module message {} dropped", forward.msg_id);
            return Ok(());
        };
        hook.on_module_message(ModuleMessage {
            from: Self::sender_info(peer, &forward.from_module_id),
            msg_id: forward.msg_id,
            data: forward.data,
        })
    }

    fn on_forward_from_gate(&self, peer: &PeerConnection, forward: ForwardFromGate) -> AppResult<()> {
        let uuid = forward
            .session
            .get(SESSION_KEY_UUID)
            .filter(|uuid| !uuid.is_empty())
            .cloned();
        let session = match uuid {
            Some(uuid) => {
                let session =
                    self.sessions
                        .apply_update(&uuid, &forward.session, ReconcileMode::FillGap)?;
                // the gateway is authoritative for where the client sits
                session.set_connect_id(&forward.client_conn_id);
                session.set_bind(module_type(&forward.from_gate_id), &forward.from_gate_id);
                session
            }
            None => Arc::new(Session::from_map(forward.session)),
        };

        let Some(hook) = self.hook() else {
            trace!("no hook, client message {} dropped", forward.msg_id);
            return Ok(());
        };
        hook.on_client_message(
            session,
            ClientMessage {
                from_gate: Self::sender_info(peer, &forward.from_gate_id),
                client_conn_id: forward.client_conn_id,
                msg_id: forward.msg_id,
                data: forward.data,
            },
        )
    }

    fn on_forward_to_client(&self, forward: ForwardToClient) -> AppResult<()> {
        if forward.to_gate_id == self.module_id {
            return self.deliver_to_local_client(
                &forward.from_module_id,
                &forward.to_client_id,
                forward.msg_id,
                forward.data,
            );
        }
        debug!(
            "relaying client message for {} to {}",
            forward.to_client_id, forward.to_gate_id
        );
        self.send_to(&forward.to_gate_id, &forward)
    }

    fn on_update_session(&self, update: UpdateSession) -> AppResult<()> {
        let mut connected = None;
        if let Some(clients) = &self.clients {
            if let Some(client) = clients.get_client(&update.client_conn_id) {
                let session = client.session();
                session.update_from_map(&update.session);
                connected = Some(session);
            }
        }
        if update.session_uuid.is_empty() {
            return Ok(());
        }

        match connected {
            Some(connected) => {
                if let Some(local) = self.sessions.get(&update.session_uuid) {
                    if !Arc::ptr_eq(&local, &connected) {
                        connected.merge_missing_from(&local);
                    }
                }
                self.sessions
                    .update_uuid(&connected, &update.session_uuid)?;
            }
            None => {
                self.sessions.apply_update(
                    &update.session_uuid,
                    &update.session,
                    ReconcileMode::FillGap,
                )?;
            }
        }
        trace!(
            "session {} updated from {}",
            update.session_uuid,
            update.from_module_id
        );
        Ok(())
    }

    fn on_req_close_connect(&self, request: ReqCloseConnect) -> AppResult<()> {
        self.req_close_connect(&request.to_gate_id, &request.client_conn_id)
    }

    fn on_safe_quit_request(&self, peer: &PeerConnection, request: SafeQuitRequest) -> AppResult<()> {
        if request.target_module_id != self.module_id {
            return Err(AppError::IllegalState(format!(
                "safe quit for {} arrived at {}",
                request.target_module_id, self.module_id
            )));
        }
        let from = peer.module_id().unwrap_or_default();
        info!("{} asked {} to quit safely", from, self.module_id);
        match self.hook() {
            Some(hook) => hook.on_safe_quit_request(&from),
            None => Ok(()),
        }
    }
}

impl SubnetHandler for Router {
    fn on_peer_joined(&self, peer: &Arc<PeerConnection>) {
        let Some(info) = peer.info() else {
            return;
        };
        let notify = PeerJoinedNotify { info: info.clone() };
        for other in self.table.joined_peers() {
            if other.temp_id() == peer.temp_id() {
                continue;
            }
            if let Err(e) = other.send_message(&notify) {
                debug!("peer joined notify to {} failed: {e}", other.temp_id());
            }
        }
        if let Some(hook) = self.hook() {
            if let Err(e) = hook.on_module_joined(&info) {
                error!("module joined hook for {} failed: {e}", info.module_id);
            }
        }
    }

    fn on_message(&self, peer: &Arc<PeerConnection>, message: Message) -> AppResult<()> {
        match message {
            Message::ForwardToModule(forward) => self.on_forward_to_module(peer, forward),
            Message::ForwardFromGate(forward) => self.on_forward_from_gate(peer, forward),
            Message::ForwardToClient(forward) => self.on_forward_to_client(forward),
            Message::UpdateSession(update) => self.on_update_session(update),
            Message::ReqCloseConnect(request) => self.on_req_close_connect(request),
            Message::SafeQuitRequest(request) => self.on_safe_quit_request(peer, request),
            Message::PeerJoinedNotify(notify) => {
                if notify.info.module_id != self.module_id {
                    self.registry.add(notify.info);
                }
                Ok(())
            }
            other => Err(AppError::IllegalState(format!(
                "{:?} is not a routing command",
                other.command()
            ))),
        }
    }

    fn on_peer_closed(&self, peer: &Arc<PeerConnection>) {
        debug!(
            "{} lost joined peer {} ({})",
            self.module_id,
            peer.temp_id(),
            peer.module_id().unwrap_or_default()
        );
    }
}

impl ModuleSender for Router {
    fn module_id(&self) -> &str {
        &self.module_id
    }

    fn send_session_update(&self, update: UpdateSession) -> AppResult<()> {
        self.send_to(&update.to_module_id, &update)
    }

    fn send_client_msg(
        &self,
        gate_id: &str,
        conn_id: &str,
        msg_id: u16,
        data: Bytes,
    ) -> AppResult<()> {
        self.send_bytes_to_client(gate_id, conn_id, msg_id, data)
    }

    fn close_client_connect(&self, gate_id: &str, conn_id: &str) -> AppResult<()> {
        self.req_close_connect(gate_id, conn_id)
    }
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Router")
            .field("module_id", &self.module_id)
            .field("gateway", &self.is_gateway())
            .field("sessions", &self.sessions.len())
            .finish()
    }
}
