use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::RwLock;
use tracing::info;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::{Engine, EngineError};

/// Reference records the allocators read: users, performances and session kinds.
/// Write-once; ids are assigned by the caller.
#[derive(Default)]
pub struct Catalog {
    users: DashMap<Ulid, UserInfo>,
    performances: DashMap<Ulid, PerformanceInfo>,
    session_kinds: DashMap<Ulid, SessionKindInfo>,
}

impl Catalog {
    pub fn user(&self, id: &Ulid) -> Option<UserInfo> {
        self.users.get(id).map(|e| e.value().clone())
    }

    pub fn has_user(&self, id: &Ulid) -> bool {
        self.users.contains_key(id)
    }

    pub fn performance(&self, id: &Ulid) -> Option<PerformanceInfo> {
        self.performances.get(id).map(|e| e.value().clone())
    }

    pub fn session_kind(&self, id: &Ulid) -> Option<SessionKindInfo> {
        self.session_kinds.get(id).map(|e| e.value().clone())
    }

    /// Display view of a user. Users are never deleted, so a miss only
    /// happens for ids smuggled in through a bulk team structure.
    pub(super) fn user_or_placeholder(&self, id: Ulid) -> UserInfo {
        self.user(&id).unwrap_or(UserInfo {
            id,
            name: String::new(),
        })
    }

    fn contains(&self, event: &Event) -> Option<Ulid> {
        let (id, taken) = match event {
            Event::UserRegistered { id, .. } => (id, self.users.contains_key(id)),
            Event::PerformanceRegistered { id, .. } => (id, self.performances.contains_key(id)),
            Event::SessionKindRegistered { id, .. } => (id, self.session_kinds.contains_key(id)),
            _ => return None,
        };
        taken.then_some(*id)
    }

    pub(super) fn apply(&self, event: &Event) {
        match event {
            Event::UserRegistered { id, name } => {
                self.users.insert(*id, UserInfo { id: *id, name: name.clone() });
            }
            Event::PerformanceRegistered { id, name } => {
                self.performances
                    .insert(*id, PerformanceInfo { id: *id, name: name.clone() });
            }
            Event::SessionKindRegistered { id, name } => {
                self.session_kinds
                    .insert(*id, SessionKindInfo { id: *id, name: name.clone() });
            }
            _ => {}
        }
    }

    /// Registration events recreating the catalog, for compaction.
    pub(super) fn snapshot(&self) -> Vec<Event> {
        let users = self.users.iter().map(|e| Event::UserRegistered {
            id: e.id,
            name: e.name.clone(),
        });
        let performances = self.performances.iter().map(|e| Event::PerformanceRegistered {
            id: e.id,
            name: e.name.clone(),
        });
        let kinds = self.session_kinds.iter().map(|e| Event::SessionKindRegistered {
            id: e.id,
            name: e.name.clone(),
        });
        users.chain(performances).chain(kinds).collect()
    }
}

fn check_name(name: &str) -> Result<(), EngineError> {
    if name.len() > MAX_NAME_LEN {
        return Err(EngineError::LimitExceeded("name too long"));
    }
    Ok(())
}

impl Engine {
    async fn register(&self, event: Event) -> Result<(), EngineError> {
        let _gate = self.compaction_gate.read().await;
        let _registry = self.registry_lock.lock().await;
        if let Some(id) = self.catalog.contains(&event) {
            return Err(EngineError::AlreadyExists(id));
        }
        self.wal_append(&event).await?;
        self.catalog.apply(&event);
        Ok(())
    }

    pub async fn register_user(&self, id: Ulid, name: String) -> Result<(), EngineError> {
        check_name(&name)?;
        self.register(Event::UserRegistered { id, name }).await
    }

    pub async fn register_performance(&self, id: Ulid, name: String) -> Result<(), EngineError> {
        check_name(&name)?;
        self.register(Event::PerformanceRegistered { id, name }).await
    }

    pub async fn register_session_kind(&self, id: Ulid, name: String) -> Result<(), EngineError> {
        check_name(&name)?;
        self.register(Event::SessionKindRegistered { id, name }).await
    }

    pub async fn create_resource(
        &self,
        id: Ulid,
        name: String,
        category: EquipCategory,
        is_available: bool,
    ) -> Result<(), EngineError> {
        check_name(&name)?;
        let _gate = self.compaction_gate.read().await;
        let _registry = self.registry_lock.lock().await;
        if self.resources.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }
        let event = Event::ResourceCreated {
            id,
            name: name.clone(),
            category,
            is_available,
        };
        self.wal_append(&event).await?;
        let rs = ResourceState::new(ResourceInfo {
            id,
            name,
            category,
            is_available,
        });
        self.resources.insert(id, Arc::new(RwLock::new(rs)));
        Ok(())
    }

    /// Enable or disable new reservations on a resource. Existing reservations stay.
    pub async fn set_resource_availability(
        &self,
        id: Ulid,
        is_available: bool,
    ) -> Result<(), EngineError> {
        let _gate = self.compaction_gate.read().await;
        let rs = self.resource(id)?;
        let mut guard = rs.write().await;
        if guard.info.is_available == is_available {
            return Ok(());
        }
        let event = Event::ResourceAvailabilityChanged { id, is_available };
        self.persist_and_apply(&mut guard, &event).await?;
        info!("resource {id} availability set to {is_available}");
        Ok(())
    }

    pub async fn get_resource_info(&self, id: Ulid) -> Result<ResourceInfo, EngineError> {
        let rs = self.resource(id)?;
        let guard = rs.read().await;
        Ok(guard.info.clone())
    }
}
