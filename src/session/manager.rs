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

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use tracing::trace;

use super::client_session::Session;
use crate::{AppError, AppResult};

/// How an incoming snapshot meets a local copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileMode {
    /// only keys missing locally are taken
    FillGap,
    /// every incoming key overwrites the local one
    Force,
}

/// Sessions of this module, keyed by uuid.
///
/// Sessions are created on first reference and only removed by the
/// application.
#[derive(Debug, Default)]
pub struct SessionManager {
    sessions: DashMap<String, Arc<Session>>,
}

impl SessionManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, uuid: &str) -> Option<Arc<Session>> {
        self.sessions.get(uuid).map(|session| session.clone())
    }

    pub fn get_or_create(&self, uuid: &str) -> Arc<Session> {
        self.sessions
            .entry(uuid.to_string())
            .or_insert_with(|| {
                trace!("session {uuid} created");
                let session = Session::new();
                session.set_uuid(uuid);
                Arc::new(session)
            })
            .clone()
    }

    /// Register a session under the uuid it carries.
    pub fn store(&self, session: Arc<Session>) -> AppResult<()> {
        let uuid = session
            .uuid()
            .filter(|uuid| !uuid.is_empty())
            .ok_or_else(|| AppError::InvalidValue("session without uuid".into()))?;
        self.sessions.insert(uuid, session);
        Ok(())
    }

    /// Re-key a session, dropping the entry of its previous uuid.
    pub fn update_uuid(&self, session: &Arc<Session>, uuid: &str) -> AppResult<()> {
        if uuid.is_empty() {
            return Err(AppError::InvalidValue("empty session uuid".into()));
        }
        if let Some(old) = session.uuid().filter(|old| old != uuid) {
            self.sessions
                .remove_if(&old, |_, stored| Arc::ptr_eq(stored, session));
        }
        session.set_uuid(uuid);
        self.sessions.insert(uuid.to_string(), session.clone());
        Ok(())
    }

    /// Reconcile a snapshot with the local copy, adopting it when there is none.
    pub fn apply_update(
        &self,
        uuid: &str,
        snapshot: &HashMap<String, String>,
        mode: ReconcileMode,
    ) -> AppResult<Arc<Session>> {
        if uuid.is_empty() {
            return Err(AppError::InvalidValue("empty session uuid".into()));
        }
        let session = self
            .sessions
            .entry(uuid.to_string())
            .or_insert_with(|| {
                trace!("session {uuid} adopted from snapshot");
                Arc::new(Session::new())
            })
            .clone();
        match mode {
            ReconcileMode::FillGap => {
                session.merge_missing(snapshot);
            }
            ReconcileMode::Force => session.update_from_map(snapshot),
        }
        session.set_uuid(uuid);
        Ok(session)
    }

    pub fn remove(&self, uuid: &str) -> Option<Arc<Session>> {
        self.sessions.remove(uuid).map(|(_, session)| session)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_get_or_create_is_lazy_and_shared() {
        let manager = SessionManager::new();
        assert!(manager.get("u-1").is_none());
        let first = manager.get_or_create("u-1");
        let second = manager.get_or_create("u-1");
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.uuid().as_deref(), Some("u-1"));
        assert_eq!(manager.len(), 1);
    }

    #[test]
    fn test_apply_update_adopts_then_fills_gaps() {
        let manager = SessionManager::new();
        let adopted = manager
            .apply_update(
                "u-2",
                &snapshot(&[("hp", "10"), ("_s0_bind_gate", "gate1")]),
                ReconcileMode::FillGap,
            )
            .unwrap();
        assert_eq!(adopted.get("hp").as_deref(), Some("10"));
        assert_eq!(adopted.uuid().as_deref(), Some("u-2"));

        let merged = manager
            .apply_update(
                "u-2",
                &snapshot(&[("hp", "1"), ("mp", "4")]),
                ReconcileMode::FillGap,
            )
            .unwrap();
        assert!(Arc::ptr_eq(&adopted, &merged));
        assert_eq!(merged.get("hp").as_deref(), Some("10"));
        assert_eq!(merged.get("mp").as_deref(), Some("4"));

        manager
            .apply_update("u-2", &snapshot(&[("hp", "1")]), ReconcileMode::Force)
            .unwrap();
        assert_eq!(merged.get("hp").as_deref(), Some("1"));
    }

    #[test]
    fn test_snapshot_uuid_cannot_rekey() {
        let manager = SessionManager::new();
        let session = manager
            .apply_update("u-3", &snapshot(&[("_s0_uuid", "other")]), ReconcileMode::Force)
            .unwrap();
        assert_eq!(session.uuid().as_deref(), Some("u-3"));
        assert!(manager.apply_update("", &HashMap::new(), ReconcileMode::Force).is_err());
    }

    #[test]
    fn test_store_and_update_uuid() {
        let manager = SessionManager::new();
        let session = Arc::new(Session::new());
        assert!(manager.store(session.clone()).is_err());

        manager.update_uuid(&session, "u-4").unwrap();
        assert!(Arc::ptr_eq(&manager.get("u-4").unwrap(), &session));

        manager.update_uuid(&session, "u-5").unwrap();
        assert!(manager.get("u-4").is_none());
        assert!(Arc::ptr_eq(&manager.get("u-5").unwrap(), &session));

        let stored = Arc::new(Session::new());
        stored.set_uuid("u-6");
        manager.store(stored).unwrap();
        assert_eq!(manager.len(), 2);
        assert!(manager.remove("u-6").is_some());
        assert_eq!(manager.len(), 1);
    }
}
