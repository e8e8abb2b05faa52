// Copyright 2025 dentsusoken
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

//! Registry of live directory locks.
//!
//! The registry is the quota manager's view of every lock that has been
//! acquired or queued. Locks keep a handle to the registry they were created
//! through and call back into it when they register, unregister, or need the
//! set of existing locks to build their wait graph. The registry holds
//! registered locks weakly and pending locks strongly, so a queued lock stays
//! alive until it is either granted or released.

use crate::config::LockingConfig;
use crate::locking::client::ClientType;
use crate::locking::directory_lock::{DirectoryLock, LockId, LockInner, LockLink, LockSnapshot};
use crate::locking::origin::{OriginMetadata, OriginScope};
use crate::locking::persistence::{PersistenceScope, PersistenceType};
use crate::locking::scope::{DirectoryLockCategory, IdTableUpdate, LockKind};
use log::{debug, trace};
use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::rc::{Rc, Weak};

/// Ids of acquired locks whose clients should abort outstanding work.
pub type LockIdsByClient = BTreeMap<ClientType, Vec<LockId>>;

/// Observer hooks for registry events.
pub trait LockRegistryObserver {
    /// The last registered lock for an origin went away. Quota bookkeeping
    /// updates the origin's access time here.
    fn on_origin_released(&self, _metadata: &OriginMetadata) {}

    /// An exclusive internal lock preempted the listed acquired locks.
    fn on_abort_requested(&self, _lock_ids: &LockIdsByClient) {}
}

/// Observer implementation that performs no work.
#[derive(Debug, Default)]
pub struct NoopLockRegistryObserver;

impl LockRegistryObserver for NoopLockRegistryObserver {}

type OriginLockTable = BTreeMap<String, Vec<LockId>>;

#[derive(Default)]
struct RegistryState {
    next_lock_id: LockId,
    /// Acquired or queued locks, in registration order.
    locks: Vec<LockLink>,
    pending: Vec<DirectoryLock>,
    id_table: HashMap<LockId, Weak<LockInner>>,
    origin_tables: HashMap<PersistenceType, OriginLockTable>,
}

struct RegistryInner {
    config: LockingConfig,
    observer: Rc<dyn LockRegistryObserver>,
    state: RefCell<RegistryState>,
}

/// Cloneable handle to a lock registry.
#[derive(Clone)]
pub struct LockRegistry {
    inner: Rc<RegistryInner>,
}

impl Default for LockRegistry {
    fn default() -> Self {
        Self::new(LockingConfig::default())
    }
}

impl std::fmt::Debug for LockRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.borrow();
        f.debug_struct("LockRegistry")
            .field("registered", &state.locks.len())
            .field("pending", &state.pending.len())
            .finish()
    }
}

impl LockRegistry {
    pub fn new(config: LockingConfig) -> Self {
        Self::with_observer(config, Rc::new(NoopLockRegistryObserver))
    }

    pub fn with_observer(config: LockingConfig, observer: Rc<dyn LockRegistryObserver>) -> Self {
        Self {
            inner: Rc::new(RegistryInner {
                config,
                observer,
                state: RefCell::new(RegistryState::default()),
            }),
        }
    }

    pub fn config(&self) -> &LockingConfig {
        &self.inner.config
    }

    /// Creates an external lock over one client directory of one origin.
    pub fn create_directory_lock(
        &self,
        persistence_type: PersistenceType,
        metadata: &OriginMetadata,
        client: ClientType,
        kind: LockKind,
    ) -> DirectoryLock {
        DirectoryLock::for_client(self, persistence_type, metadata, client, kind)
    }

    /// Creates an internal lock over an arbitrary scope.
    pub fn create_directory_lock_internal(
        &self,
        persistence: PersistenceScope,
        origin: OriginScope,
        client: Option<ClientType>,
        kind: LockKind,
        category: DirectoryLockCategory,
    ) -> DirectoryLock {
        DirectoryLock::internal(self, persistence, origin, client, kind, category)
    }

    /// Creates the exclusive whole-origin lock used to evict an origin.
    pub fn create_eviction_lock(
        &self,
        persistence_type: PersistenceType,
        metadata: &OriginMetadata,
    ) -> DirectoryLock {
        DirectoryLock::for_eviction(self, persistence_type, metadata)
    }

    /// Looks up a registered lock through the id table. Eviction locks are
    /// never entered there.
    pub fn lock_by_id(&self, id: LockId) -> Option<DirectoryLock> {
        self.inner
            .state
            .borrow()
            .id_table
            .get(&id)
            .and_then(Weak::upgrade)
            .map(DirectoryLock::from_inner)
    }

    pub fn registered_lock_count(&self) -> usize {
        self.registered_locks().len()
    }

    pub fn pending_lock_count(&self) -> usize {
        self.inner.state.borrow().pending.len()
    }

    /// Tests whether any external lock currently covers `origin` in the
    /// given repository. Persistent locks are not tracked.
    pub fn is_origin_locked(&self, persistence_type: PersistenceType, origin: &str) -> bool {
        self.inner
            .state
            .borrow()
            .origin_tables
            .get(&persistence_type)
            .and_then(|table| table.get(origin))
            .is_some_and(|ids| !ids.is_empty())
    }

    pub fn locks_in_category(&self, category: DirectoryLockCategory) -> Vec<DirectoryLock> {
        self.registered_locks()
            .into_iter()
            .filter(|lock| lock.category() == category)
            .collect()
    }

    /// Forgets every origin table entry, reporting each origin as released.
    pub fn clear_lock_tables(&self) {
        let released: Vec<OriginMetadata> = {
            let mut state = self.inner.state.borrow_mut();
            let tables = std::mem::take(&mut state.origin_tables);
            let mut released = Vec::new();
            for table in tables.into_values() {
                for ids in table.into_values() {
                    let first = ids
                        .first()
                        .and_then(|id| state.locks.iter().find(|link| link.id == *id))
                        .and_then(LockLink::upgrade);
                    if let Some(lock) = first {
                        released.push(lock.origin_metadata());
                    }
                }
            }
            released
        };

        debug!("Cleared directory lock tables ({} origins)", released.len());
        for metadata in &released {
            self.inner.observer.on_origin_released(metadata);
        }
    }

    /// Snapshots every registered lock in registration order.
    pub fn snapshot(&self) -> Vec<LockSnapshot> {
        self.registered_locks()
            .iter()
            .map(DirectoryLock::snapshot)
            .collect()
    }

    pub(crate) fn generate_lock_id(&self) -> LockId {
        let mut state = self.inner.state.borrow_mut();
        let id = state.next_lock_id;
        state.next_lock_id += 1;
        id
    }

    pub(crate) fn client_type_in_range(&self, client: ClientType) -> bool {
        client.index() < ClientType::type_max(self.inner.config.next_gen_local_storage)
    }

    /// Live, registered, not yet dropped locks in registration order.
    pub(crate) fn registered_locks(&self) -> Vec<DirectoryLock> {
        let state = self.inner.state.borrow();
        state
            .locks
            .iter()
            .filter_map(LockLink::upgrade)
            .filter(|lock| !lock.dropped())
            .collect()
    }

    pub(crate) fn add_pending(&self, lock: &DirectoryLock) {
        self.inner.state.borrow_mut().pending.push(lock.clone());
    }

    /// Removes a lock from the pending list. The returned handle must be
    /// dropped by the caller once it no longer borrows the registry.
    pub(crate) fn remove_pending(&self, id: LockId) -> Option<DirectoryLock> {
        let mut state = self.inner.state.borrow_mut();
        let index = state.pending.iter().position(|lock| lock.id() == id)?;
        Some(state.pending.remove(index))
    }

    pub(crate) fn register(&self, lock: &DirectoryLock) {
        let inner = lock.inner();
        {
            let mut state = self.inner.state.borrow_mut();
            state.locks.push(LockLink::new(inner));

            if inner.id_table_update() == IdTableUpdate::Yes {
                state.id_table.insert(inner.id(), Rc::downgrade(inner));
            }

            if let Some(persistence_type) = inner.lock_table_key() {
                state
                    .origin_tables
                    .entry(persistence_type)
                    .or_default()
                    .entry(inner.origin().to_string())
                    .or_default()
                    .push(inner.id());
            }
        }
        inner.set_registered(true);
        trace!("Registered directory lock {} ({})", inner.id(), inner.scope());
    }

    pub(crate) fn unregister(&self, lock: &LockInner) {
        let released_origin = {
            let mut state = self.inner.state.borrow_mut();
            state.locks.retain(|link| link.id != lock.id());

            if lock.id_table_update() == IdTableUpdate::Yes {
                state.id_table.remove(&lock.id());
            }

            match lock.lock_table_key() {
                Some(persistence_type) => {
                    let table = state.origin_tables.entry(persistence_type).or_default();
                    let origin = lock.origin();
                    let emptied = match table.get_mut(origin) {
                        Some(ids) => {
                            ids.retain(|id| *id != lock.id());
                            ids.is_empty()
                        }
                        None => false,
                    };
                    if emptied {
                        table.remove(origin);
                    }
                    emptied
                }
                None => false,
            }
        };
        lock.set_registered(false);
        trace!("Unregistered directory lock {} ({})", lock.id(), lock.scope());

        if released_origin {
            self.inner
                .observer
                .on_origin_released(&lock.origin_metadata());
        }
    }

    pub(crate) fn abort_operations_for_locks(&self, lock_ids: &LockIdsByClient) {
        if lock_ids.is_empty() {
            return;
        }
        debug!("Requesting abort of operations for locks {lock_ids:?}");
        self.inner.observer.on_abort_requested(lock_ids);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct RecordingObserver {
        released: RefCell<Vec<String>>,
    }

    impl LockRegistryObserver for RecordingObserver {
        fn on_origin_released(&self, metadata: &OriginMetadata) {
            self.released
                .borrow_mut()
                .push(format!("{}:{}", metadata.persistence_type, metadata.origin));
        }
    }

    fn metadata(origin: &str, persistence_type: PersistenceType) -> OriginMetadata {
        OriginMetadata::from_origin(origin, persistence_type)
    }

    #[test]
    fn ids_increase_monotonically() {
        let registry = LockRegistry::default();
        let first = registry.generate_lock_id();
        let second = registry.generate_lock_id();
        assert!(second > first);
    }

    #[test]
    fn id_table_skips_eviction_locks() {
        let registry = LockRegistry::default();
        let origin = metadata("https://a.example", PersistenceType::Temporary);

        let client = registry.create_directory_lock(
            PersistenceType::Temporary,
            &origin,
            ClientType::IndexedDb,
            LockKind::Shared,
        );
        client.acquire_immediately();
        assert!(registry.lock_by_id(client.id()).is_some());

        let eviction = registry.create_eviction_lock(PersistenceType::Default, &origin);
        eviction.acquire_immediately();
        assert_eq!(registry.registered_lock_count(), 2);
        assert!(registry.lock_by_id(eviction.id()).is_none());

        client.release();
        assert!(registry.lock_by_id(client.id()).is_none());
    }

    #[test]
    fn origin_table_reports_last_release_once() {
        let observer = Rc::new(RecordingObserver::default());
        let registry = LockRegistry::with_observer(LockingConfig::default(), observer.clone());
        let origin = metadata("https://a.example", PersistenceType::Default);

        let idb = registry.create_directory_lock(
            PersistenceType::Default,
            &origin,
            ClientType::IndexedDb,
            LockKind::Shared,
        );
        let cache = registry.create_directory_lock(
            PersistenceType::Default,
            &origin,
            ClientType::DomCache,
            LockKind::Shared,
        );
        idb.acquire_immediately();
        cache.acquire_immediately();
        assert!(registry.is_origin_locked(PersistenceType::Default, "https://a.example"));

        idb.release();
        assert!(observer.released.borrow().is_empty());
        cache.release();
        assert_eq!(
            observer.released.borrow().as_slice(),
            ["default:https://a.example"]
        );
        assert!(!registry.is_origin_locked(PersistenceType::Default, "https://a.example"));
    }

    #[test]
    fn persistent_and_internal_locks_skip_origin_tables() {
        let registry = LockRegistry::default();
        let origin = metadata("https://a.example", PersistenceType::Persistent);

        let persistent = registry.create_directory_lock(
            PersistenceType::Persistent,
            &origin,
            ClientType::IndexedDb,
            LockKind::Exclusive,
        );
        persistent.acquire_immediately();
        assert!(!registry.is_origin_locked(PersistenceType::Persistent, "https://a.example"));

        let internal = registry.create_directory_lock_internal(
            PersistenceScope::from_value(PersistenceType::Temporary),
            OriginScope::from_origin("https://a.example"),
            None,
            LockKind::Shared,
            DirectoryLockCategory::None,
        );
        internal.acquire_immediately();
        assert!(!registry.is_origin_locked(PersistenceType::Temporary, "https://a.example"));
    }

    #[test]
    fn clear_lock_tables_releases_every_origin() {
        let observer = Rc::new(RecordingObserver::default());
        let registry = LockRegistry::with_observer(LockingConfig::default(), observer.clone());

        let mut locks = Vec::new();
        for (origin, persistence_type) in [
            ("https://a.example", PersistenceType::Temporary),
            ("https://b.example", PersistenceType::Default),
        ] {
            let lock = registry.create_directory_lock(
                persistence_type,
                &metadata(origin, persistence_type),
                ClientType::SimpleDb,
                LockKind::Shared,
            );
            lock.acquire_immediately();
            locks.push(lock);
        }

        registry.clear_lock_tables();
        let mut released = observer.released.borrow().clone();
        released.sort();
        assert_eq!(
            released,
            ["default:https://b.example", "temporary:https://a.example"]
        );
        assert!(!registry.is_origin_locked(PersistenceType::Temporary, "https://a.example"));
    }

    #[test]
    fn locks_in_category_filters_registered_locks() {
        let registry = LockRegistry::default();
        let clearing = registry.create_directory_lock_internal(
            PersistenceScope::null(),
            OriginScope::from_prefix("https://a.example"),
            None,
            LockKind::Exclusive,
            DirectoryLockCategory::UninitOrigins,
        );
        clearing.acquire_immediately();
        let other = registry.create_directory_lock_internal(
            PersistenceScope::from_value(PersistenceType::Temporary),
            OriginScope::from_origin("https://b.example"),
            None,
            LockKind::Exclusive,
            DirectoryLockCategory::None,
        );
        other.acquire_immediately();

        let found = registry.locks_in_category(DirectoryLockCategory::UninitOrigins);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id(), clearing.id());
    }
}
