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

use std::any::{type_name, Any};
use std::fmt::Debug;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, error, trace, warn};

use crate::{AppError, AppResult, Shutdown};

/// Handler trait for processing lane tasks
pub trait PoolHandler<T>: Clone + Send + 'static + Sync {
    /// Handle the task, an error is logged and the lane keeps going
    fn handle(&self, task: T) -> impl Future<Output = AppResult<()>> + Send;
}

/// Lane pool config parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LanePoolConfig {
    /// 0 means one lane per cpu, 1 means dispatch inline on the receive path
    pub num_lanes: usize,
    /// tasks a single lane holds before `try_send` reports `BufferFull`
    pub channel_capacity: usize,
    pub monitor_interval_ms: u64,
    pub worker_check_timeout_ms: u64,
}

impl Default for LanePoolConfig {
    fn default() -> Self {
        Self {
            num_lanes: 0,
            channel_capacity: 15_000,
            monitor_interval_ms: 1_000,
            worker_check_timeout_ms: 50,
        }
    }
}

impl LanePoolConfig {
    pub fn effective_lanes(&self) -> usize {
        if self.num_lanes == 0 {
            num_cpus::get()
        } else {
            self.num_lanes
        }
    }

    pub fn monitor_interval(&self) -> Duration {
        Duration::from_millis(self.monitor_interval_ms)
    }

    pub fn worker_check_timeout(&self) -> Duration {
        Duration::from_millis(self.worker_check_timeout_ms)
    }
}

/// A fixed set of independent FIFO lanes.
///
/// Each lane owns one worker, so tasks sent to the same lane are handled
/// strictly in send order while different lanes run in parallel. A monitor
/// restarts any worker that panicked; the task that caused the panic is lost,
/// the rest of the lane is not.
#[derive(Debug)]
pub struct LanePool<T> {
    _shutdown_complete_tx: mpsc::Sender<()>,
    lanes: Arc<Vec<Lane<T>>>,
}

#[derive(Debug)]
struct Lane<T> {
    sender: async_channel::Sender<T>,
    receiver: async_channel::Receiver<T>,
}

/// represent a running worker
#[derive(Debug)]
struct Worker {
    id: usize,
    handle: JoinHandle<()>,
}

impl<T: Send + Debug + 'static> LanePool<T> {
    pub fn new<H: PoolHandler<T>>(
        notify_shutdown: broadcast::Sender<()>,
        shutdown_complete_tx: mpsc::Sender<()>,
        handler: H,
        config: &LanePoolConfig,
    ) -> Self {
        let lanes = Self::spawn_lanes_with_monitor(config, notify_shutdown, handler);
        Self {
            _shutdown_complete_tx: shutdown_complete_tx,
            lanes,
        }
    }

    /// Queue a task on the given lane without waiting.
    ///
    /// A full lane fails with `BufferFull` and the task is dropped.
    pub fn try_send(&self, task: T, lane_id: usize) -> AppResult<()> {
        let lane = self
            .lanes
            .get(lane_id)
            .ok_or_else(|| AppError::IllegalState(format!("lane {lane_id} does not exist")))?;
        match lane.sender.try_send(task) {
            Ok(()) => Ok(()),
            Err(async_channel::TrySendError::Full(_)) => {
                warn!("lane {lane_id} is full, task dropped");
                Err(AppError::BufferFull)
            }
            Err(async_channel::TrySendError::Closed(_)) => {
                Err(AppError::ChannelSendError(format!("lane {lane_id} is closed")))
            }
        }
    }

    pub fn lane_count(&self) -> usize {
        self.lanes.len()
    }

    fn spawn_lanes_with_monitor<H: PoolHandler<T>>(
        config: &LanePoolConfig,
        notify_shutdown: broadcast::Sender<()>,
        handler: H,
    ) -> Arc<Vec<Lane<T>>> {
        let lane_count = config.effective_lanes().max(1);
        let mut workers = Vec::with_capacity(lane_count);
        let mut lanes = Vec::with_capacity(lane_count);

        for id in 0..lane_count {
            let (sender, receiver) = async_channel::bounded(config.channel_capacity.max(1));
            workers.push(Self::spawn_worker(
                id,
                handler.clone(),
                notify_shutdown.clone(),
                receiver.clone(),
            ));
            lanes.push(Lane { sender, receiver });
        }

        let lanes = Arc::new(lanes);
        Self::spawn_monitor(
            workers,
            lanes.clone(),
            notify_shutdown,
            handler,
            config.monitor_interval(),
            config.worker_check_timeout(),
        );
        lanes
    }

    fn spawn_worker<H: PoolHandler<T>>(
        id: usize,
        handler: H,
        notify_shutdown: broadcast::Sender<()>,
        receiver: async_channel::Receiver<T>,
    ) -> Worker {
        let mut shutdown = Shutdown::subscribe(&notify_shutdown);

        let handle = tokio::spawn(async move {
            debug!("lane {id} started");

            loop {
                tokio::select! {
                    Ok(task) = receiver.recv() => {
                        if let Err(e) = handler.handle(task).await {
                            warn!("lane {id} task failed: {e}");
                        }
                    }
                    _ = shutdown.recv() => {
                        debug!("lane {id} shutting down");
                        break;
                    }
                }
            }
        });

        Worker { id, handle }
    }

    fn spawn_monitor<H: PoolHandler<T>>(
        mut workers: Vec<Worker>,
        lanes: Arc<Vec<Lane<T>>>,
        notify_shutdown: broadcast::Sender<()>,
        handler: H,
        monitor_interval: Duration,
        worker_check_timeout: Duration,
    ) {
        tokio::spawn(async move {
            let mut interval = time::interval(monitor_interval);
            let mut shutdown = Shutdown::subscribe(&notify_shutdown);

            loop {
                tokio::select! {
                    _ = shutdown.recv() => {
                        debug!("lane monitor received shutdown signal");
                        break;
                    }
                    _ = interval.tick() => {
                        for worker in &mut workers {
                            match time::timeout(worker_check_timeout, &mut worker.handle).await {
                                Ok(join_result) => {
                                    match join_result {
                                        Ok(_) => {
                                            warn!("lane {} completed unexpectedly", worker.id);
                                        }
                                        Err(err) => {
                                            if err.is_panic() {
                                                Self::log_worker_panic(worker.id, err);
                                            } else {
                                                error!("lane {} failed with non-panic error", worker.id);
                                            }
                                        }
                                    }

                                    let Some(lane) = lanes.get(worker.id) else {
                                        continue;
                                    };
                                    warn!("lane {} stopped, restarting...", worker.id);
                                    *worker = Self::spawn_worker(
                                        worker.id,
                                        handler.clone(),
                                        notify_shutdown.clone(),
                                        lane.receiver.clone(),
                                    );
                                    debug!("lane {} restarted", worker.id);
                                }
                                Err(_) => {
                                    trace!("lane {} is running", worker.id);
                                }
                            }
                        }
                    }
                }
            }
            debug!("lane monitor exiting");
        });
    }

    fn log_worker_panic(lane_id: usize, err: tokio::task::JoinError) {
        let payload = err.into_panic();
        error!("lane {lane_id} panicked: {}", panic_message(&payload));
    }
}

/// Readable text of a panic payload.
pub fn panic_message(payload: &Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        format!("message: {message}")
    } else if let Some(message) = payload.downcast_ref::<String>() {
        format!("message: {message}")
    } else {
        format!("an unknown type: {}", get_type_name(payload))
    }
}

#[inline]
fn get_type_name<R>(_: &R) -> &'static str {
    type_name::<R>()
}
