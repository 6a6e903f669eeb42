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

use std::collections::hash_map::DefaultHasher;
use std::future::Future;
use std::hash::{Hash, Hasher};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc};
use tracing::{error, warn};

use super::peer::PeerConnection;
use crate::protocol::Message;
use crate::utils::{panic_message, LanePool, LanePoolConfig, PoolHandler};
use crate::AppResult;

/// Receiver of routing traffic once a peer has joined.
pub trait SubnetHandler: Send + Sync + 'static {
    fn on_peer_joined(&self, peer: &Arc<PeerConnection>);

    fn on_message(&self, peer: &Arc<PeerConnection>, message: Message) -> AppResult<()>;

    fn on_peer_closed(&self, _peer: &Arc<PeerConnection>) {}
}

/// A decoded message waiting in a lane.
#[derive(Debug)]
pub struct InboundTask {
    peer: Arc<PeerConnection>,
    message: Message,
}

#[derive(Clone)]
struct LaneHandler {
    handler: Arc<dyn SubnetHandler>,
}

impl PoolHandler<InboundTask> for LaneHandler {
    fn handle(&self, task: InboundTask) -> impl Future<Output = AppResult<()>> + Send {
        let handler = self.handler.clone();
        async move { handler.on_message(&task.peer, task.message) }
    }
}

/// The key whose messages must stay in order: the client for client bound
/// traffic, the sending module for everything else.
pub fn affinity_key(peer: &PeerConnection, message: &Message) -> Option<String> {
    match message {
        Message::ForwardToClient(forward) => Some(forward.to_client_id.clone()),
        _ => peer.module_id(),
    }
}

/// Lane index for `key`; messages without a key share lane 0.
pub fn lane_for(key: Option<&str>, lane_count: usize) -> usize {
    match key {
        Some(key) if !key.is_empty() && lane_count > 1 => {
            let mut hasher = DefaultHasher::new();
            key.hash(&mut hasher);
            (hasher.finish() % lane_count as u64) as usize
        }
        _ => 0,
    }
}

/// Hands routing messages to the handler, in order per affinity key.
pub enum LaneDispatcher {
    Inline(Arc<dyn SubnetHandler>),
    Lanes(LanePool<InboundTask>),
}

impl LaneDispatcher {
    pub fn new(
        handler: Arc<dyn SubnetHandler>,
        config: &LanePoolConfig,
        notify_shutdown: broadcast::Sender<()>,
        shutdown_complete_tx: mpsc::Sender<()>,
    ) -> Self {
        if config.effective_lanes() <= 1 {
            return LaneDispatcher::Inline(handler);
        }
        LaneDispatcher::Lanes(LanePool::new(
            notify_shutdown,
            shutdown_complete_tx,
            LaneHandler { handler },
            config,
        ))
    }

    pub fn lane_count(&self) -> usize {
        match self {
            LaneDispatcher::Inline(_) => 1,
            LaneDispatcher::Lanes(pool) => pool.lane_count(),
        }
    }

    /// Never waits: a full lane fails with `BufferFull` and the message is
    /// dropped. Handler errors and panics are logged here.
    pub fn dispatch(&self, peer: Arc<PeerConnection>, message: Message) -> AppResult<()> {
        match self {
            LaneDispatcher::Inline(handler) => {
                let command = message.command();
                let result =
                    panic::catch_unwind(AssertUnwindSafe(|| handler.on_message(&peer, message)));
                match result {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => warn!(
                        "handling {:?} from peer {} failed: {e}",
                        command,
                        peer.temp_id()
                    ),
                    Err(payload) => error!(
                        "handling {:?} from peer {} panicked: {}",
                        command,
                        peer.temp_id(),
                        panic_message(&payload)
                    ),
                }
                Ok(())
            }
            LaneDispatcher::Lanes(pool) => {
                let key = affinity_key(&peer, &message);
                let lane = lane_for(key.as_deref(), pool.lane_count());
                pool.try_send(InboundTask { peer, message }, lane)
            }
        }
    }
}

impl std::fmt::Debug for LaneDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LaneDispatcher")
            .field("lanes", &self.lane_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::FramedConnection;
    use crate::protocol::{ForwardToClient, ForwardToModule, PeerInfo};
    use crate::service::ConnectionConfig;
    use bytes::Bytes;
    use std::time::Duration;
    use tokio::time::Instant;

    fn joined_peer(module_id: &str) -> PeerConnection {
        let connection = FramedConnection::new(1, &ConnectionConfig::default());
        let peer = PeerConnection::accepted(connection, Instant::now() + Duration::from_secs(5));
        peer.set_info(PeerInfo {
            module_id: module_id.to_string(),
            ..Default::default()
        });
        peer
    }

    #[test]
    fn test_affinity_key() {
        let peer = joined_peer("room2");
        let to_client = Message::ForwardToClient(ForwardToClient {
            from_module_id: "room2".to_string(),
            to_gate_id: "gate1".to_string(),
            to_client_id: "c-17".to_string(),
            msg_id: 3,
            data: Bytes::new(),
        });
        assert_eq!(affinity_key(&peer, &to_client).as_deref(), Some("c-17"));

        let to_module = Message::ForwardToModule(ForwardToModule {
            from_module_id: "room2".to_string(),
            to_module_id: "gate1".to_string(),
            msg_id: 3,
            data: Bytes::new(),
        });
        assert_eq!(affinity_key(&peer, &to_module).as_deref(), Some("room2"));
    }

    #[test]
    fn test_lane_for_is_stable_and_bounded() {
        assert_eq!(lane_for(None, 8), 0);
        assert_eq!(lane_for(Some(""), 8), 0);
        assert_eq!(lane_for(Some("c-17"), 1), 0);
        for i in 0..100 {
            let key = format!("client-{i}");
            let lane = lane_for(Some(&key), 8);
            assert!(lane < 8);
            assert_eq!(lane, lane_for(Some(&key), 8));
        }
    }

    struct PanicOnModuleMessage;

    impl SubnetHandler for PanicOnModuleMessage {
        fn on_peer_joined(&self, _peer: &Arc<PeerConnection>) {}

        fn on_message(&self, _peer: &Arc<PeerConnection>, message: Message) -> AppResult<()> {
            if let Message::ForwardToModule(_) = message {
                panic!("module message handler blew up");
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_inline_dispatch_contains_panics() {
        let (notify_shutdown, _) = broadcast::channel(1);
        let (shutdown_complete_tx, _) = mpsc::channel(1);
        let config = LanePoolConfig {
            num_lanes: 1,
            ..Default::default()
        };
        let dispatcher = LaneDispatcher::new(
            Arc::new(PanicOnModuleMessage),
            &config,
            notify_shutdown,
            shutdown_complete_tx,
        );
        assert_eq!(dispatcher.lane_count(), 1);

        let peer = Arc::new(joined_peer("gate1"));
        let message = Message::ForwardToModule(ForwardToModule {
            from_module_id: "gate1".to_string(),
            to_module_id: "room1".to_string(),
            msg_id: 1,
            data: Bytes::new(),
        });
        assert!(dispatcher.dispatch(peer.clone(), message).is_ok());
        let tick = Message::TimeTick(crate::protocol::TimeTick::now());
        assert!(dispatcher.dispatch(peer, tick).is_ok());
    }
}
