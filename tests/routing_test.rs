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

mod common;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;
use rstest::{fixture, rstest};
use stonemesh::protocol::{ForwardToClient, ForwardToModule, LoginRetCode, Logout, Message};
use stonemesh::routing::{ClientMessage, ModuleMessage};
use stonemesh::session::SESSION_KEY_UUID;
use stonemesh::{setup_local_tracing, AppResult, ClientPool, ModuleHook, ModuleNode, Session};

use uuid::Uuid;

use common::{node_config, wait_for, RawPeer, RecordingClient};

#[fixture]
#[once]
fn setup() {
    let _ = setup_local_tracing();
}

#[derive(Default)]
struct RecordingHook {
    module_messages: Mutex<Vec<ModuleMessage>>,
    client_messages: Mutex<Vec<(Arc<Session>, ClientMessage)>>,
}

impl ModuleHook for RecordingHook {
    fn on_module_message(&self, message: ModuleMessage) -> AppResult<()> {
        self.module_messages.lock().push(message);
        Ok(())
    }

    fn on_client_message(&self, session: Arc<Session>, message: ClientMessage) -> AppResult<()> {
        self.client_messages.lock().push((session, message));
        Ok(())
    }
}

/// Start `backend`, then a gateway dialing it; wait until both joined.
async fn joined_pair(
    gate_id: &str,
    backend_id: &str,
    clients: Option<Arc<ClientPool>>,
) -> (ModuleNode, ModuleNode) {
    let backend = ModuleNode::new(node_config(backend_id, 0), None).unwrap();
    let backend_addr = backend.start().await.unwrap();

    let mut gate_config = node_config(gate_id, 10);
    gate_config.subnet.peers =
        HashMap::from([(backend_id.to_string(), backend_addr.to_string())]);
    let clients = clients.map(|pool| pool as Arc<dyn stonemesh::ClientRegistry>);
    let gate = ModuleNode::new(gate_config, clients).unwrap();
    gate.start().await.unwrap();

    assert!(wait_for(|| gate.subnet().get_peer(backend_id).is_some()).await);
    assert!(wait_for(|| backend.subnet().get_peer(gate_id).is_some()).await);
    (gate, backend)
}

#[rstest]
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_module_message_reaches_hook(_setup: ()) {
    let (gate1, room1) = joined_pair("gate1", "room1", None).await;
    let hook = Arc::new(RecordingHook::default());
    room1.router().set_hook(hook.clone());

    gate1
        .router()
        .send_module_msg("room1", 7, Bytes::from_static(b"hello"))
        .unwrap();
    assert!(wait_for(|| hook.module_messages.lock().len() == 1).await);
    {
        let received = hook.module_messages.lock();
        assert_eq!(received[0].from.module_id, "gate1");
        assert_eq!(received[0].msg_id, 7);
        assert_eq!(received[0].data, Bytes::from_static(b"hello"));
    }

    assert!(gate1
        .router()
        .send_module_msg("room9", 7, Bytes::new())
        .is_err());
    assert_eq!(gate1.router().broadcast_module_msg(8, Bytes::new()), 1);
    assert!(wait_for(|| hook.module_messages.lock().len() == 2).await);

    gate1.shutdown().await;
    room1.shutdown().await;
}

#[rstest]
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_client_messages_keep_order_per_client(_setup: ()) {
    let pool = Arc::new(ClientPool::new());
    let alice = RecordingClient::new("c-alice");
    let bob = RecordingClient::new("c-bob");
    pool.add(alice.clone());
    pool.add(bob.clone());

    let gate1 = ModuleNode::new(
        node_config("gate1", 0),
        Some(pool as Arc<dyn stonemesh::ClientRegistry>),
    )
    .unwrap();
    let addr = gate1.start().await.unwrap();
    assert_eq!(gate1.subnet().table().connection_count(), 0);

    let mut room = RawPeer::connect(addr).await;
    room.login("room1", 0).await;
    assert!(matches!(
        room.recv_skip_ticks().await,
        Some(Message::LoginRet(ret)) if ret.code == LoginRetCode::Success
    ));

    const PER_CLIENT: u16 = 300;
    for seq in 0..PER_CLIENT {
        for conn_id in ["c-alice", "c-bob"] {
            room.send(&ForwardToClient {
                from_module_id: "room1".into(),
                to_gate_id: "gate1".into(),
                to_client_id: conn_id.into(),
                msg_id: seq,
                data: Bytes::from(format!("{conn_id}:{seq}")),
            })
            .await;
        }
    }

    let expected = PER_CLIENT as usize;
    assert!(wait_for(|| alice.received.lock().len() == expected).await);
    assert!(wait_for(|| bob.received.lock().len() == expected).await);
    for client in [&alice, &bob] {
        let seqs: Vec<u16> = client.received.lock().iter().map(|(id, _)| *id).collect();
        assert_eq!(seqs, (0..PER_CLIENT).collect::<Vec<_>>());
    }
    assert_eq!(
        stonemesh::ClientLink::session(&*alice).bind("room").as_deref(),
        Some("room1")
    );

    gate1.shutdown().await;
}

#[rstest]
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_session_travels_with_client_messages(_setup: ()) {
    let pool = Arc::new(ClientPool::new());
    let client = RecordingClient::new("c-1");
    let client_session = stonemesh::ClientLink::session(&*client);
    let session_uuid = Uuid::new_v4().to_string();
    client_session.set(SESSION_KEY_UUID, session_uuid.as_str());
    client_session.set_connect_id("c-1");
    client_session.set_bind("gate", "gate1");
    client_session.set("token", "t-1");
    pool.add(client.clone());

    let (gate1, room1) = joined_pair("gate1", "room1", Some(pool)).await;
    let hook = Arc::new(RecordingHook::default());
    room1.router().set_hook(hook.clone());

    gate1
        .router()
        .forward_client_msg_to_module(&*client, "room1", 5, Bytes::from_static(b"join"))
        .unwrap();
    assert!(wait_for(|| hook.client_messages.lock().len() == 1).await);

    let room_session = room1.sessions().get(&session_uuid).unwrap();
    assert_eq!(room_session.get("token").as_deref(), Some("t-1"));
    assert_eq!(room_session.connect_id().as_deref(), Some("c-1"));
    assert_eq!(room_session.bind("gate").as_deref(), Some("gate1"));
    {
        let delivered = hook.client_messages.lock();
        assert!(Arc::ptr_eq(&delivered[0].0, &room_session));
        assert_eq!(delivered[0].1.client_conn_id, "c-1");
        assert_eq!(delivered[0].1.msg_id, 5);
    }

    // backend state flows back to the gateway copy
    room_session.set("gold", "9");
    assert_eq!(room_session.sync_to_bound_modules(&**room1.router()), 1);
    assert!(wait_for(|| {
        client_session.get("gold").as_deref() == Some("9") && gate1.sessions().get(&session_uuid).is_some()
    })
    .await);
    let gate_copy = gate1.sessions().get(&session_uuid).unwrap();
    assert!(Arc::ptr_eq(&gate_copy, &client_session));

    // and the backend can reach the client through the bound gateway
    room_session
        .send_msg(&**room1.router(), "gate", 11, Bytes::from_static(b"welcome"))
        .unwrap();
    assert!(wait_for(|| client.received.lock().len() == 1).await);
    assert_eq!(client.received.lock()[0].0, 11);

    room_session
        .close_connect(&**room1.router(), "gate")
        .unwrap();
    assert!(wait_for(|| *client.terminated.lock()).await);

    gate1.shutdown().await;
    room1.shutdown().await;
}

fn module_msg(to_module_id: &str, msg_id: u16) -> ForwardToModule {
    ForwardToModule {
        from_module_id: "gate1".to_string(),
        to_module_id: to_module_id.to_string(),
        msg_id,
        data: Bytes::from_static(b"payload"),
    }
}

async fn logged_in_gate(addr: std::net::SocketAddr) -> RawPeer {
    let mut gate = RawPeer::connect(addr).await;
    gate.login("gate1", 10).await;
    assert!(matches!(
        gate.recv_skip_ticks().await,
        Some(Message::LoginRet(ret)) if ret.code == LoginRetCode::Success
    ));
    gate
}

/// Holds its lane on the first module message.
#[derive(Default)]
struct StallingHook {
    stalled: AtomicBool,
    received: Mutex<Vec<u16>>,
}

impl ModuleHook for StallingHook {
    fn on_module_message(&self, message: ModuleMessage) -> AppResult<()> {
        if !self.stalled.swap(true, Ordering::SeqCst) {
            std::thread::sleep(Duration::from_millis(1_500));
        }
        self.received.lock().push(message.msg_id);
        Ok(())
    }
}

#[rstest]
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_logout_is_not_held_behind_a_full_lane(_setup: ()) {
    let mut config = node_config("room1", 0);
    config.lane_pool.num_lanes = 2;
    config.lane_pool.channel_capacity = 1;
    let room1 = ModuleNode::new(config, None).unwrap();
    let addr = room1.start().await.unwrap();
    let hook = Arc::new(StallingHook::default());
    room1.router().set_hook(hook.clone());

    let mut gate = logged_in_gate(addr).await;
    assert!(wait_for(|| room1.subnet().get_peer("gate1").is_some()).await);

    let started = Instant::now();
    for msg_id in 0..5 {
        gate.send(&module_msg("room1", msg_id)).await;
    }
    gate.send(&Logout {
        module_id: "gate1".to_string(),
    })
    .await;

    assert!(gate.closed_by_node().await);
    assert!(wait_for(|| room1.subnet().get_peer("gate1").is_none()).await);
    assert!(started.elapsed() < Duration::from_millis(1_000));

    // the overflow was shed, what got queued is still handled
    assert!(wait_for(|| !hook.received.lock().is_empty()).await);
    assert!(hook.received.lock().len() < 5);
    room1.shutdown().await;
}

/// Panics on one message id, records the rest.
#[derive(Default)]
struct PanickyHook {
    received: Mutex<Vec<u16>>,
}

impl ModuleHook for PanickyHook {
    fn on_module_message(&self, message: ModuleMessage) -> AppResult<()> {
        if message.msg_id == 13 {
            panic!("cannot handle message 13");
        }
        self.received.lock().push(message.msg_id);
        Ok(())
    }
}

#[rstest]
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_inline_dispatch_survives_a_panicking_hook(_setup: ()) {
    let mut config = node_config("room1", 0);
    config.lane_pool.num_lanes = 1;
    let room1 = ModuleNode::new(config, None).unwrap();
    let addr = room1.start().await.unwrap();
    let hook = Arc::new(PanickyHook::default());
    room1.router().set_hook(hook.clone());

    let mut gate = logged_in_gate(addr).await;
    assert!(wait_for(|| room1.subnet().get_peer("gate1").is_some()).await);
    let link = room1.subnet().get_peer("gate1").unwrap().temp_id();

    gate.send(&module_msg("room1", 13)).await;
    gate.send(&module_msg("room1", 14)).await;
    assert!(wait_for(|| hook.received.lock().as_slice() == [14]).await);

    let current = room1.subnet().get_peer("gate1").unwrap();
    assert_eq!(current.temp_id(), link);
    assert_eq!(room1.subnet().table().connection_count(), 1);

    // the link still carries traffic both ways
    room1
        .router()
        .send_module_msg("gate1", 15, Bytes::from_static(b"still here"))
        .unwrap();
    loop {
        match gate.recv_skip_ticks().await {
            Some(Message::ForwardToModule(forward)) => {
                assert_eq!(forward.msg_id, 15);
                break;
            }
            Some(_) => continue,
            None => panic!("link closed after the hook panicked"),
        }
    }
    room1.shutdown().await;
}
