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

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::{broadcast, mpsc, Semaphore};
use tokio::time::{self, Duration};
use tracing::{error, info, trace, warn};

use super::config::NodeConfig;
use super::server::SubnetServer;
use crate::routing::{ClientRegistry, Router};
use crate::session::SessionManager;
use crate::subnet::{PeerRegistry, PeerTable, SubnetManager};
use crate::{AppError, AppResult};

const SHUTDOWN_COMPLETE_TIMEOUT: Duration = Duration::from_secs(10);

/// One module process: listener, subnet membership, routing and sessions.
///
/// Must be created inside a tokio runtime, the lane pool starts its workers
/// right away.
pub struct ModuleNode {
    config: NodeConfig,
    subnet: Arc<SubnetManager>,
    router: Arc<Router>,
    notify_shutdown: broadcast::Sender<()>,
    shutdown_complete_tx: mpsc::Sender<()>,
    shutdown_complete_rx: mpsc::Receiver<()>,
}

impl ModuleNode {
    /// `clients` is the client connection registry when this module is a
    /// gateway, `None` otherwise.
    pub fn new(config: NodeConfig, clients: Option<Arc<dyn ClientRegistry>>) -> AppResult<Self> {
        config.validate()?;
        let (notify_shutdown, _) = broadcast::channel(1);
        let (shutdown_complete_tx, shutdown_complete_rx) = mpsc::channel(1);

        let table = Arc::new(PeerTable::new());
        let registry = Arc::new(PeerRegistry::new());
        let sessions = Arc::new(SessionManager::new());
        let router = Arc::new(Router::new(
            config.general.module_id.clone(),
            table.clone(),
            registry.clone(),
            sessions,
            clients,
        ));
        let subnet = SubnetManager::new(
            &config,
            table,
            registry,
            router.clone(),
            notify_shutdown.clone(),
            shutdown_complete_tx.clone(),
        );

        Ok(ModuleNode {
            config,
            subnet,
            router,
            notify_shutdown,
            shutdown_complete_tx,
            shutdown_complete_rx,
        })
    }

    pub fn module_id(&self) -> &str {
        &self.config.general.module_id
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    pub fn subnet(&self) -> &Arc<SubnetManager> {
        &self.subnet
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        self.router.sessions()
    }

    /// Bind the subnet listener, start accepting, dial the configured peers.
    ///
    /// Returns the bound address, which differs from the configured one when
    /// the configured port is 0.
    pub async fn start(&self) -> AppResult<SocketAddr> {
        let listen_address = self.config.network.listen_address();
        let listener = TcpListener::bind(&listen_address).await.map_err(|err| {
            let error_msg =
                format!("Failed to bind subnet listener to {listen_address} - Error: {err}");
            error!(error_msg);
            AppError::IllegalState(error_msg)
        })?;
        let local_addr = listener.local_addr()?;
        info!(
            "{} listening for subnet peers on {local_addr}",
            self.module_id()
        );

        let server = SubnetServer::new(
            listener,
            Arc::new(Semaphore::new(self.config.network.max_connection)),
            self.notify_shutdown.clone(),
            self.subnet.clone(),
        );
        tokio::spawn(async move {
            if let Err(err) = server.run().await {
                error!(cause = %err, "failed to accept");
            }
        });

        self.subnet.start();
        Ok(local_addr)
    }

    /// Start, then serve until Ctrl-C and shut down gracefully.
    pub async fn run(self) -> AppResult<()> {
        self.start().await?;
        match signal::ctrl_c().await {
            Ok(()) => info!("get shutdown signal"),
            Err(err) => warn!("unable to listen for shutdown signal: {err}"),
        }
        self.shutdown().await;
        Ok(())
    }

    /// Leave the subnet and stop every task of this node.
    ///
    /// Peers get a `Logout` first, then the connections drain for the
    /// configured grace period before the shutdown broadcast goes out.
    pub async fn shutdown(self) {
        let ModuleNode {
            config,
            subnet,
            router,
            notify_shutdown,
            shutdown_complete_tx,
            mut shutdown_complete_rx,
        } = self;

        subnet.logout_all();
        time::sleep(config.connection.shutdown_grace() + Duration::from_millis(50)).await;

        // no receivers left only means every task already stopped
        let _ = notify_shutdown.send(());
        drop(subnet);
        drop(router);
        drop(shutdown_complete_tx);

        trace!("waiting for shutdown complete...");
        if time::timeout(SHUTDOWN_COMPLETE_TIMEOUT, shutdown_complete_rx.recv())
            .await
            .is_err()
        {
            warn!("shutdown did not complete in {SHUTDOWN_COMPLETE_TIMEOUT:?}");
        }
        info!("module {} shutdown complete", config.general.module_id);
    }
}

impl std::fmt::Debug for ModuleNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleNode")
            .field("module_id", &self.config.general.module_id)
            .field("subnet", &self.subnet)
            .field("router", &self.router)
            .finish()
    }
}
