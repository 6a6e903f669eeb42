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

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::BytesMut;
use parking_lot::Mutex;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio_util::codec::{Encoder, FramedRead};
use tracing::{debug, error, trace, warn};

use super::frame::{Frame, FrameCodec};
use crate::protocol::WireMessage;
use crate::service::ConnectionConfig;
use crate::{AppError, AppResult};

/// Upper bound of frames coalesced into a single socket write.
pub const MAX_BATCH_FRAMES: usize = 5000;
const SLOW_BATCH_THRESHOLD: Duration = Duration::from_secs(2);

pub type FrameReader = FramedRead<OwnedReadHalf, FrameCodec>;

/// Write side of a subnet connection.
///
/// Callers hand frames to [`FramedConnection::enqueue_frame`], which never
/// blocks: it either queues the frame or fails with `Closed` / `BufferFull`.
/// A single pump task owns the socket writer, drains the queue in batches and
/// writes each batch with one `write_all`. Frames enqueued on one connection
/// reach the wire in enqueue order.
#[derive(Debug)]
pub struct FramedConnection {
    id: u64,
    sender: async_channel::Sender<Frame>,
    receiver: Arc<Mutex<Option<async_channel::Receiver<Frame>>>>,
    queued_bytes: Arc<AtomicI64>,
    max_queued_bytes: i64,
    max_send_batch_bytes: usize,
    shutdown_grace: Duration,
    shutdown_started: AtomicBool,
    closed_tx: Arc<watch::Sender<bool>>,
}

impl FramedConnection {
    pub fn new(id: u64, config: &ConnectionConfig) -> Self {
        let (sender, receiver) = async_channel::bounded(config.channel_capacity.max(1));
        let (closed_tx, _) = watch::channel(false);
        FramedConnection {
            id,
            sender,
            receiver: Arc::new(Mutex::new(Some(receiver))),
            queued_bytes: Arc::new(AtomicI64::new(0)),
            max_queued_bytes: i64::try_from(config.max_queued_bytes).unwrap_or(i64::MAX),
            max_send_batch_bytes: config.max_send_batch_bytes.max(1),
            shutdown_grace: config.shutdown_grace(),
            shutdown_started: AtomicBool::new(false),
            closed_tx: Arc::new(closed_tx),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Start the outbound pump on `writer`.
    ///
    /// Returns false when the pump was already started, or the connection
    /// was shut down before it ever got a writer.
    pub fn initialize<W>(&self, writer: W) -> bool
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let Some(receiver) = self.receiver.lock().take() else {
            debug!("connection {} already initialized", self.id);
            return false;
        };

        let pump = OutboundPump {
            id: self.id,
            receiver,
            writer,
            queued_bytes: self.queued_bytes.clone(),
            max_send_batch_bytes: self.max_send_batch_bytes,
        };
        let id = self.id;
        // weak, so dropping the connection still closes the queue
        let sender = self.sender.downgrade();
        let closed_tx = self.closed_tx.clone();

        tokio::spawn(async move {
            match tokio::spawn(pump.run()).await {
                Ok(Ok(())) => debug!("connection {id} pump finished"),
                Ok(Err(e)) => warn!("connection {id} pump stopped: {e}"),
                Err(join_error) if join_error.is_panic() => {
                    error!("connection {id} pump panicked, connection closed")
                }
                Err(join_error) => error!("connection {id} pump aborted: {join_error}"),
            }
            if let Some(sender) = sender.upgrade() {
                sender.close();
            }
            closed_tx.send_replace(true);
        });
        true
    }

    /// Queue a frame for sending without waiting.
    pub fn enqueue_frame(&self, mut frame: Frame) -> AppResult<()> {
        if self.shutdown_started.load(Ordering::Acquire) || self.is_closed() {
            return Err(AppError::Closed);
        }
        let queued = self.queued_bytes.load(Ordering::Acquire);
        if queued > self.max_queued_bytes {
            warn!(
                "connection {} has {} bytes queued, limit {}",
                self.id, queued, self.max_queued_bytes
            );
            return Err(AppError::BufferFull);
        }

        let wire_len = frame.wire_len() as i64;
        frame.mark_enqueued();
        self.queued_bytes.fetch_add(wire_len, Ordering::AcqRel);
        match self.sender.try_send(frame) {
            Ok(()) => Ok(()),
            Err(async_channel::TrySendError::Full(_)) => {
                self.queued_bytes.fetch_sub(wire_len, Ordering::AcqRel);
                warn!("connection {} outbound queue is full", self.id);
                Err(AppError::BufferFull)
            }
            Err(async_channel::TrySendError::Closed(_)) => {
                self.queued_bytes.fetch_sub(wire_len, Ordering::AcqRel);
                Err(AppError::Closed)
            }
        }
    }

    pub fn send_message<M: WireMessage>(&self, message: &M) -> AppResult<()> {
        self.enqueue_frame(message.to_frame()?)
    }

    /// Stop accepting frames and close the socket after the grace period.
    ///
    /// Frames already queued are still written during the grace period.
    pub fn shutdown(&self) {
        if self.shutdown_started.swap(true, Ordering::AcqRel) {
            return;
        }
        let id = self.id;
        let grace = self.shutdown_grace;
        let sender = self.sender.clone();
        let receiver = self.receiver.clone();
        let closed_tx = self.closed_tx.clone();

        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            sender.close();
            // never got a writer, nobody else will flag it closed
            if receiver.lock().take().is_some() {
                closed_tx.send_replace(true);
            }
            trace!("connection {id} outbound queue closed");
        });
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown_started.load(Ordering::Acquire)
    }

    /// True once the pump is gone; nothing will be written anymore.
    pub fn is_closed(&self) -> bool {
        *self.closed_tx.borrow()
    }

    pub async fn closed(&self) {
        let mut closed_rx = self.closed_tx.subscribe();
        // the sender lives in self, so wait_for can only fail after close
        let _ = closed_rx.wait_for(|closed| *closed).await;
    }

    pub fn queued_bytes(&self) -> i64 {
        self.queued_bytes.load(Ordering::Acquire)
    }
}

/// Split a socket into a started connection and its frame reader.
pub fn split_stream(
    socket: TcpStream,
    id: u64,
    config: &ConnectionConfig,
) -> (FramedConnection, FrameReader) {
    let connection = FramedConnection::new(id, config);
    let reader = attach_stream(&connection, socket, config);
    (connection, reader)
}

/// Start the pump of an existing connection on `socket`, returning the reader.
pub fn attach_stream(
    connection: &FramedConnection,
    socket: TcpStream,
    config: &ConnectionConfig,
) -> FrameReader {
    if let Err(e) = socket.set_nodelay(true) {
        debug!("connection {} set_nodelay failed: {e}", connection.id());
    }
    let (read_half, write_half) = socket.into_split();
    connection.initialize(write_half);
    FramedRead::with_capacity(
        read_half,
        FrameCodec::new(config.max_frame_payload),
        config.read_buffer_size,
    )
}

/// Age of the oldest frame in `batch` when it waited past the slow threshold.
fn slow_batch_age(batch: &[Frame], now: Instant) -> Option<Duration> {
    batch
        .iter()
        .map(|frame| frame.age(now))
        .max()
        .filter(|oldest| *oldest > SLOW_BATCH_THRESHOLD)
}

struct OutboundPump<W> {
    id: u64,
    receiver: async_channel::Receiver<Frame>,
    writer: W,
    queued_bytes: Arc<AtomicI64>,
    max_send_batch_bytes: usize,
}

impl<W: AsyncWrite + Unpin + Send + 'static> OutboundPump<W> {
    async fn run(mut self) -> AppResult<()> {
        let mut codec = FrameCodec::default();
        let mut buffer = BytesMut::with_capacity(self.max_send_batch_bytes.min(1024 * 1024));

        while let Ok(first) = self.receiver.recv().await {
            let mut batch_bytes = first.wire_len();
            let mut batch = vec![first];
            while batch.len() < MAX_BATCH_FRAMES && batch_bytes < self.max_send_batch_bytes {
                match self.receiver.try_recv() {
                    Ok(frame) => {
                        batch_bytes += frame.wire_len();
                        batch.push(frame);
                    }
                    Err(_) => break,
                }
            }
            if let Some(oldest) = slow_batch_age(&batch, Instant::now()) {
                warn!(
                    "connection {} sending {} frames, oldest waited {:?}",
                    self.id,
                    batch.len(),
                    oldest
                );
            }

            buffer.clear();
            for frame in &batch {
                codec.encode(frame, &mut buffer)?;
            }
            self.writer.write_all(&buffer).await?;
            self.writer.flush().await?;
            self.queued_bytes
                .fetch_sub(batch_bytes as i64, Ordering::AcqRel);
            trace!(
                "connection {} wrote {} frames, {} bytes",
                self.id,
                batch.len(),
                batch_bytes
            );

            for mut frame in batch {
                if let Some(callback) = frame.take_callback() {
                    callback();
                }
            }
        }

        self.writer.shutdown().await?;
        Ok(())
    }
}
