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

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, Semaphore};
use tokio::time::{self, Duration};
use tracing::{debug, error, info};

use crate::subnet::SubnetManager;
use crate::{AppError, AppResult, Shutdown};

/// Accept loop of the subnet listener.
///
/// Every accepted socket is handed to the subnet manager, which runs the
/// handshake and owns the connection from then on.
#[derive(Debug)]
pub struct SubnetServer {
    listener: TcpListener,
    limit_connections: Arc<Semaphore>,
    notify_shutdown: broadcast::Sender<()>,
    subnet: Arc<SubnetManager>,
}

impl SubnetServer {
    pub fn new(
        listener: TcpListener,
        limit_connections: Arc<Semaphore>,
        notify_shutdown: broadcast::Sender<()>,
        subnet: Arc<SubnetManager>,
    ) -> Self {
        SubnetServer {
            listener,
            limit_connections,
            notify_shutdown,
            subnet,
        }
    }

    /// Accept connections until shutdown.
    ///
    /// A permit is taken before each accept, so at most `max_connection`
    /// inbound sockets are alive at once; the permit travels with the
    /// connection and is released when it ends.
    ///
    /// # Returns
    /// `Ok` on shutdown, an error when accepting keeps failing after the
    /// backoff is exhausted.
    pub async fn run(&self) -> AppResult<()> {
        let mut shutdown = Shutdown::new(self.notify_shutdown.subscribe());
        loop {
            let permit = tokio::select! {
                permit = self.limit_connections.clone().acquire_owned() => {
                    permit.map_err(|e| AppError::IllegalState(format!("connection limiter closed: {e}")))?
                }
                _ = shutdown.recv() => break,
            };

            let socket = tokio::select! {
                res = self.accept() => res?,
                _ = shutdown.recv() => break,
            };
            debug!("accept new subnet connection");
            self.subnet.on_accept(socket, Some(permit));
        }
        info!("subnet server stopped accepting");
        Ok(())
    }

    async fn accept(&self) -> AppResult<TcpStream> {
        let mut backoff = 1;

        loop {
            match self.listener.accept().await {
                Ok((socket, _)) => return Ok(socket),
                Err(err) => {
                    if backoff > 64 {
                        error!("accept failed, giving up: {err}");
                        return Err(AppError::IoError(err));
                    }
                    debug!("accept failed, retrying in {backoff}s: {err}");
                }
            }

            time::sleep(Duration::from_secs(backoff)).await;
            backoff *= 2;
        }
    }
}

impl Drop for SubnetServer {
    fn drop(&mut self) {
        debug!("subnet server dropped");
    }
}
