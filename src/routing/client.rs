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
use dashmap::DashMap;

use crate::session::Session;
use crate::AppResult;

/// A client connection held by a gateway module.
pub trait ClientLink: Send + Sync {
    fn connection_id(&self) -> &str;

    fn session(&self) -> Arc<Session>;

    fn send(&self, msg_id: u16, data: Bytes) -> AppResult<()>;

    fn terminate(&self);
}

/// Lookup of the client connections of a gateway.
pub trait ClientRegistry: Send + Sync {
    fn get_client(&self, conn_id: &str) -> Option<Arc<dyn ClientLink>>;
}

/// Client links by connection id.
#[derive(Default)]
pub struct ClientPool {
    clients: DashMap<String, Arc<dyn ClientLink>>,
}

impl ClientPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, client: Arc<dyn ClientLink>) {
        self.clients
            .insert(client.connection_id().to_string(), client);
    }

    pub fn remove(&self, conn_id: &str) -> Option<Arc<dyn ClientLink>> {
        self.clients.remove(conn_id).map(|(_, client)| client)
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}

impl ClientRegistry for ClientPool {
    fn get_client(&self, conn_id: &str) -> Option<Arc<dyn ClientLink>> {
        self.clients.get(conn_id).map(|client| client.clone())
    }
}

impl std::fmt::Debug for ClientPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientPool")
            .field("clients", &self.clients.len())
            .finish()
    }
}
