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

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use stonemesh::network::FrameCodec;
use stonemesh::protocol::{DecodeTable, Login, Message, PeerInfo, WireMessage};
use stonemesh::{ClientLink, NodeConfig, Session};
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::time;
use tokio_stream::StreamExt;
use tokio_util::codec::{Encoder, FramedRead};

pub const WAIT: Duration = Duration::from_secs(5);

/// Loopback config with an ephemeral port and short timers.
pub fn node_config(module_id: &str, connect_priority: i64) -> NodeConfig {
    let mut config = NodeConfig::default();
    config.general.module_id = module_id.to_string();
    config.general.ordinal = 1;
    config.general.version = 202_501_010_000;
    config.general.connect_priority = connect_priority;
    config.network.ip = "127.0.0.1".to_string();
    config.network.port = 0;
    config.connection.shutdown_grace_ms = 20;
    config.subnet.handshake_timeout_ms = 3_000;
    config.subnet.reconnect_interval_ms = 0;
    config.subnet.time_tick_interval_ms = 0;
    config.lane_pool.num_lanes = 4;
    config.lane_pool.monitor_interval_ms = 100;
    config
}

/// Poll `condition` until it holds or `WAIT` runs out.
pub async fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = time::Instant::now() + WAIT;
    while time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

/// A subnet peer speaking the wire protocol by hand.
pub struct RawPeer {
    writer: OwnedWriteHalf,
    reader: FramedRead<OwnedReadHalf, FrameCodec>,
    codec: FrameCodec,
    decode_table: DecodeTable,
}

impl RawPeer {
    pub async fn connect(addr: SocketAddr) -> RawPeer {
        let stream = TcpStream::connect(addr).await.unwrap();
        let (read_half, writer) = stream.into_split();
        RawPeer {
            writer,
            reader: FramedRead::new(read_half, FrameCodec::default()),
            codec: FrameCodec::default(),
            decode_table: DecodeTable::standard(),
        }
    }

    pub async fn send<M: WireMessage>(&mut self, message: &M) {
        let frame = message.to_frame().unwrap();
        let mut buffer = BytesMut::new();
        self.codec.encode(&frame, &mut buffer).unwrap();
        self.writer.write_all(&buffer).await.unwrap();
    }

    /// Write bytes as they are, header included.
    pub async fn send_raw(&mut self, bytes: &[u8]) {
        self.writer.write_all(bytes).await.unwrap();
    }

    pub async fn login(&mut self, module_id: &str, connect_priority: i64) {
        let login = Login {
            info: PeerInfo {
                module_id: module_id.to_string(),
                address: "127.0.0.1:1".to_string(),
                ordinal: 1,
                version: 202_501_010_000,
            },
            connect_priority,
        };
        self.send(&login).await;
    }

    /// Next decoded message, `None` on end of stream.
    pub async fn recv(&mut self) -> Option<Message> {
        let next = time::timeout(WAIT, self.reader.next())
            .await
            .expect("timed out waiting for a frame")?;
        let frame = next.ok()?;
        Some(self.decode_table.decode(frame).unwrap())
    }

    /// Next message that is not a liveness tick.
    pub async fn recv_skip_ticks(&mut self) -> Option<Message> {
        loop {
            match self.recv().await? {
                Message::TimeTick(_) => continue,
                other => return Some(other),
            }
        }
    }

    /// True when the node closed the stream, draining whatever was still sent.
    pub async fn closed_by_node(&mut self) -> bool {
        loop {
            match time::timeout(WAIT, self.reader.next()).await {
                Ok(None) | Ok(Some(Err(_))) => return true,
                Ok(Some(Ok(_))) => continue,
                Err(_) => return false,
            }
        }
    }
}

/// Client link that records what the gateway delivers to it.
pub struct RecordingClient {
    conn_id: String,
    session: Arc<Session>,
    pub received: Mutex<Vec<(u16, Bytes)>>,
    pub terminated: Mutex<bool>,
}

impl RecordingClient {
    pub fn new(conn_id: &str) -> Arc<RecordingClient> {
        Arc::new(RecordingClient {
            conn_id: conn_id.to_string(),
            session: Arc::new(Session::new()),
            received: Mutex::new(Vec::new()),
            terminated: Mutex::new(false),
        })
    }
}

impl ClientLink for RecordingClient {
    fn connection_id(&self) -> &str {
        &self.conn_id
    }

    fn session(&self) -> Arc<Session> {
        self.session.clone()
    }

    fn send(&self, msg_id: u16, data: Bytes) -> stonemesh::AppResult<()> {
        self.received.lock().push((msg_id, data));
        Ok(())
    }

    fn terminate(&self) {
        *self.terminated.lock() = true;
    }
}
