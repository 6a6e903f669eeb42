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
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use rstest::{fixture, rstest};
use stonemesh::protocol::{ForwardToModule, LoginRetCode, Logout, Message};
use stonemesh::routing::ModuleMessage;
use stonemesh::subnet::PeerState;
use stonemesh::{setup_local_tracing, AppResult, ModuleHook, ModuleNode};

use common::{node_config, wait_for, RawPeer};

#[fixture]
#[once]
fn setup() {
    let _ = setup_local_tracing();
}

#[rstest]
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_dialed_peers_join_on_both_sides(_setup: ()) {
    let b1 = ModuleNode::new(node_config("b1", 0), None).unwrap();
    let b1_addr = b1.start().await.unwrap();

    let mut gate_config = node_config("gate1", 10);
    gate_config.subnet.peers = HashMap::from([("b1".to_string(), b1_addr.to_string())]);
    let gate1 = ModuleNode::new(gate_config, None).unwrap();
    gate1.start().await.unwrap();

    assert!(wait_for(|| gate1.subnet().get_peer("b1").is_some()).await);
    assert!(wait_for(|| b1.subnet().get_peer("gate1").is_some()).await);

    let link = gate1.subnet().get_peer("b1").unwrap();
    assert_eq!(link.state(), PeerState::Joined);
    assert_eq!(link.info().unwrap().module_id, "b1");
    assert!(b1.subnet().registry().get("gate1").is_some());
    assert_eq!(gate1.router().balance_module_id("b").as_deref(), Some("b1"));

    gate1.shutdown().await;
    assert!(wait_for(|| b1.subnet().get_peer("gate1").is_none()).await);
    assert!(b1.subnet().registry().get("gate1").is_none());
    b1.shutdown().await;
}

#[rstest]
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_login_is_answered_with_destination(_setup: ()) {
    let b1 = ModuleNode::new(node_config("b1", 0), None).unwrap();
    let addr = b1.start().await.unwrap();

    let mut raw = RawPeer::connect(addr).await;
    raw.login("gate1", 10).await;
    match raw.recv_skip_ticks().await {
        Some(Message::LoginRet(ret)) => {
            assert_eq!(ret.code, LoginRetCode::Success);
            assert_eq!(ret.destination.module_id, "b1");
        }
        other => panic!("expected login ret, got {other:?}"),
    }
    assert!(wait_for(|| b1.subnet().get_peer("gate1").is_some()).await);
    b1.shutdown().await;
}

#[rstest]
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_bad_identity_is_rejected(_setup: ()) {
    let b1 = ModuleNode::new(node_config("b1", 0), None).unwrap();
    let addr = b1.start().await.unwrap();

    let mut raw = RawPeer::connect(addr).await;
    raw.login("b1", 10).await;
    match raw.recv_skip_ticks().await {
        Some(Message::LoginRet(ret)) => assert_eq!(ret.code, LoginRetCode::IdentityError),
        other => panic!("expected login ret, got {other:?}"),
    }
    assert!(raw.closed_by_node().await);
    assert!(wait_for(|| b1.subnet().table().connection_count() == 0).await);
    b1.shutdown().await;
}

#[rstest]
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_duplicate_login_resolution(_setup: ()) {
    let b1 = ModuleNode::new(node_config("b1", 0), None).unwrap();
    let addr = b1.start().await.unwrap();

    let mut first = RawPeer::connect(addr).await;
    first.login("gate1", 10).await;
    assert!(matches!(
        first.recv_skip_ticks().await,
        Some(Message::LoginRet(ret)) if ret.code == LoginRetCode::Success
    ));
    let first_link = b1.subnet().get_peer("gate1").unwrap().temp_id();

    // same priority, same dialer: the live link stays
    let mut second = RawPeer::connect(addr).await;
    second.login("gate1", 10).await;
    assert!(matches!(
        second.recv_skip_ticks().await,
        Some(Message::LoginRet(ret)) if ret.code == LoginRetCode::DuplicateConnection
    ));
    assert!(second.closed_by_node().await);
    assert_eq!(b1.subnet().get_peer("gate1").unwrap().temp_id(), first_link);

    // higher priority takes the slot over
    let mut third = RawPeer::connect(addr).await;
    third.login("gate1", 20).await;
    assert!(matches!(
        third.recv_skip_ticks().await,
        Some(Message::LoginRet(ret)) if ret.code == LoginRetCode::Success
    ));
    assert!(matches!(
        first.recv_skip_ticks().await,
        Some(Message::LoginRet(ret)) if ret.code == LoginRetCode::DuplicateConnection
    ));
    assert!(first.closed_by_node().await);

    let current = b1.subnet().get_peer("gate1").unwrap();
    assert_ne!(current.temp_id(), first_link);
    assert!(wait_for(|| b1.subnet().table().connection_count() == 1).await);
    assert_eq!(b1.subnet().table().joined_count(), 1);
    b1.shutdown().await;
}

#[rstest]
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_silent_peer_times_out(_setup: ()) {
    let mut config = node_config("b1", 0);
    config.subnet.handshake_timeout_ms = 500;
    let b1 = ModuleNode::new(config, None).unwrap();
    let addr = b1.start().await.unwrap();

    let mut raw = RawPeer::connect(addr).await;
    assert!(wait_for(|| b1.subnet().table().connection_count() == 1).await);
    assert!(raw.closed_by_node().await);
    assert!(wait_for(|| b1.subnet().table().connection_count() == 0).await);
    assert!(b1.subnet().get_peer("gate1").is_none());
    b1.shutdown().await;
}

#[rstest]
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_mutual_dial_converges_to_one_link(_setup: ()) {
    let a1 = ModuleNode::new(node_config("a1", 5), None).unwrap();
    let a1_addr = a1.start().await.unwrap();

    let mut b_config = node_config("b1", 1);
    b_config.subnet.peers = HashMap::from([("a1".to_string(), a1_addr.to_string())]);
    let b1 = ModuleNode::new(b_config, None).unwrap();
    let b1_addr = b1.start().await.unwrap();
    // a1 dials back once b1 is up
    a1.subnet().try_connect("b1", &b1_addr.to_string());

    assert!(wait_for(|| a1.subnet().get_peer("b1").is_some()).await);
    assert!(wait_for(|| b1.subnet().get_peer("a1").is_some()).await);
    assert!(wait_for(|| a1.subnet().table().connection_count() == 1).await);
    assert!(wait_for(|| b1.subnet().table().connection_count() == 1).await);
    assert_eq!(a1.subnet().table().joined_count(), 1);
    assert_eq!(b1.subnet().table().joined_count(), 1);

    a1.shutdown().await;
    b1.shutdown().await;
}

#[derive(Default)]
struct ModuleInbox {
    received: Mutex<Vec<u16>>,
}

impl ModuleHook for ModuleInbox {
    fn on_module_message(&self, message: ModuleMessage) -> AppResult<()> {
        self.received.lock().push(message.msg_id);
        Ok(())
    }
}

fn module_msg(msg_id: u16) -> ForwardToModule {
    ForwardToModule {
        from_module_id: "gate1".to_string(),
        to_module_id: "b1".to_string(),
        msg_id,
        data: Bytes::from_static(b"payload"),
    }
}

#[rstest]
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_bad_payload_is_dropped_bad_header_closes(_setup: ()) {
    let mut config = node_config("b1", 0);
    config.connection.max_frame_payload = 1024;
    let b1 = ModuleNode::new(config, None).unwrap();
    let addr = b1.start().await.unwrap();
    let inbox = Arc::new(ModuleInbox::default());
    b1.router().set_hook(inbox.clone());

    let mut raw = RawPeer::connect(addr).await;
    raw.login("gate1", 10).await;
    assert!(matches!(
        raw.recv_skip_ticks().await,
        Some(Message::LoginRet(ret)) if ret.code == LoginRetCode::Success
    ));
    assert!(wait_for(|| b1.subnet().get_peer("gate1").is_some()).await);
    let link = b1.subnet().get_peer("gate1").unwrap().temp_id();

    // ForwardToModule whose payload stops inside the first string
    raw.send_raw(&[0x00, 0x10, 0x00, 0x01, 0x00]).await;
    raw.send(&module_msg(7)).await;
    assert!(wait_for(|| inbox.received.lock().as_slice() == [7]).await);
    assert_eq!(b1.subnet().get_peer("gate1").unwrap().temp_id(), link);

    // declared length above the payload limit
    raw.send_raw(&[0x00, 0x10, 0x07, 0xd0]).await;
    assert!(raw.closed_by_node().await);
    assert!(wait_for(|| b1.subnet().get_peer("gate1").is_none()).await);
    assert!(wait_for(|| b1.subnet().table().connection_count() == 0).await);
    b1.shutdown().await;
}

#[rstest]
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_logout_only_removes_the_sender(_setup: ()) {
    let b1 = ModuleNode::new(node_config("b1", 0), None).unwrap();
    let addr = b1.start().await.unwrap();

    let mut room = RawPeer::connect(addr).await;
    room.login("room1", 0).await;
    assert!(matches!(
        room.recv_skip_ticks().await,
        Some(Message::LoginRet(ret)) if ret.code == LoginRetCode::Success
    ));
    let mut gate = RawPeer::connect(addr).await;
    gate.login("gate1", 10).await;
    assert!(matches!(
        gate.recv_skip_ticks().await,
        Some(Message::LoginRet(ret)) if ret.code == LoginRetCode::Success
    ));
    assert!(wait_for(|| b1.subnet().registry().get("room1").is_some()).await);

    // gate1 claims to be room1 on the way out
    gate.send(&Logout {
        module_id: "room1".to_string(),
    })
    .await;
    assert!(gate.closed_by_node().await);
    assert!(wait_for(|| b1.subnet().get_peer("gate1").is_none()).await);
    assert!(b1.subnet().registry().get("gate1").is_none());
    assert!(b1.subnet().registry().get("room1").is_some());
    assert!(b1.subnet().get_peer("room1").is_some());
    b1.shutdown().await;
}
