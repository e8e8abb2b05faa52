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

//! Directory locks and their wait graph.
//!
//! A [`DirectoryLock`] covers a [`LockScope`]. Acquiring it compares the
//! scope against every lock already registered with the [`LockRegistry`];
//! each older lock that conflicts is recorded in `blocked_on`, and this lock
//! is recorded in that lock's `blocking` list. The dependency set is fixed at
//! that moment and only shrinks as blockers are released. Once it is empty
//! the acquisition promise settles.
//!
//! All graph mutation happens on the thread owning the registry. Locks are
//! `Rc`-based and therefore cannot leave that thread; only the promises they
//! hand out may be awaited elsewhere.

use crate::error::LockRejection;
use crate::locking::client::ClientType;
use crate::locking::origin::{OriginMetadata, OriginScope};
use crate::locking::persistence::{PersistenceScope, PersistenceType};
use crate::locking::promise::{Promise, PromiseHolder};
use crate::locking::registry::{LockIdsByClient, LockRegistry};
use crate::locking::scope::{self, DirectoryLockCategory, IdTableUpdate, LockKind, LockScope};
use log::{debug, info, warn};
use serde::Serialize;
use std::cell::{Ref, RefCell};
use std::fmt;
use std::rc::{Rc, Weak};

pub type LockId = i64;

/// Outcome of an acquisition: granted, or withdrawn before it was granted.
pub type AcquireOutcome = std::result::Result<(), LockRejection>;
pub type AcquirePromise = Promise<AcquireOutcome>;
pub type ReleasePromise = Promise<()>;

/// Lifecycle of a directory lock. Every transition moves forward only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum LockState {
    /// Not yet submitted for acquisition.
    Created,
    /// Submitted and blocked on at least one older lock.
    Waiting,
    Acquired,
    Dropped { acquired: bool },
}

impl fmt::Display for LockState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockState::Created => f.write_str("created"),
            LockState::Waiting => f.write_str("waiting"),
            LockState::Acquired => f.write_str("acquired"),
            LockState::Dropped { .. } => f.write_str("dropped"),
        }
    }
}

/// Receives invalidation notices for a lock.
///
/// Locks only keep a weak reference to their handler; the holder owns it.
pub trait InvalidationHandler {
    fn lock_invalidated(&self, lock: &DirectoryLock);
}

impl<F> InvalidationHandler for F
where
    F: Fn(&DirectoryLock),
{
    fn lock_invalidated(&self, lock: &DirectoryLock) {
        self(lock)
    }
}

/// Carries the full description of a lock to be created.
#[derive(Debug, Clone)]
pub struct LockRequest {
    persistence: PersistenceScope,
    suffix: String,
    group: String,
    origin: OriginScope,
    storage_origin: String,
    is_private: bool,
    client: Option<ClientType>,
    kind: LockKind,
    internal: bool,
    id_table: IdTableUpdate,
    category: DirectoryLockCategory,
}

impl LockRequest {
    /// Starts a shared, external request with no client and empty metadata.
    pub fn new(persistence: PersistenceScope, origin: OriginScope) -> Self {
        Self {
            persistence,
            suffix: String::new(),
            group: String::new(),
            origin,
            storage_origin: String::new(),
            is_private: false,
            client: None,
            kind: LockKind::Shared,
            internal: false,
            id_table: IdTableUpdate::Yes,
            category: DirectoryLockCategory::None,
        }
    }

    pub fn with_origin_metadata(mut self, metadata: &OriginMetadata) -> Self {
        self.suffix = metadata.suffix.clone();
        self.group = metadata.group.clone();
        self.storage_origin = metadata.storage_origin.clone();
        self.is_private = metadata.is_private;
        self
    }

    pub fn with_suffix(mut self, suffix: impl Into<String>) -> Self {
        self.suffix = suffix.into();
        self
    }

    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group = group.into();
        self
    }

    pub fn with_storage_origin(mut self, storage_origin: impl Into<String>) -> Self {
        self.storage_origin = storage_origin.into();
        self
    }

    pub fn with_private(mut self, is_private: bool) -> Self {
        self.is_private = is_private;
        self
    }

    pub fn with_client(mut self, client: Option<ClientType>) -> Self {
        self.client = client;
        self
    }

    pub fn with_kind(mut self, kind: LockKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_internal(mut self, internal: bool) -> Self {
        self.internal = internal;
        self
    }

    pub fn with_id_table_update(mut self, id_table: IdTableUpdate) -> Self {
        self.id_table = id_table;
        self
    }

    pub fn with_category(mut self, category: DirectoryLockCategory) -> Self {
        self.category = category;
        self
    }

    /// Panics when an external request does not name exactly one client
    /// directory of one origin.
    fn validate(&self, registry: &LockRegistry) {
        if let Some(origin) = self.origin.origin() {
            assert!(!origin.is_empty(), "origin scope names an empty origin");
        }

        if self.internal {
            return;
        }

        assert!(
            self.persistence.is_value(),
            "external directory lock needs a concrete persistence type, got {}",
            self.persistence
        );
        assert!(
            !self.group.is_empty(),
            "external directory lock needs a group"
        );
        assert!(
            self.origin.is_origin(),
            "external directory lock needs a concrete origin, got {}",
            self.origin
        );
        assert!(
            !self.storage_origin.is_empty(),
            "external directory lock needs a storage origin"
        );
        match self.client {
            Some(client) => assert!(
                registry.client_type_in_range(client),
                "client type {client} is not enabled"
            ),
            None => panic!("external directory lock needs a client type"),
        }
    }
}

/// Weak edge to another lock, keyed by id so it can be removed even while
/// the target is being destroyed.
#[derive(Clone)]
pub(crate) struct LockLink {
    pub(crate) id: LockId,
    lock: Weak<LockInner>,
}

impl LockLink {
    pub(crate) fn new(lock: &Rc<LockInner>) -> Self {
        Self {
            id: lock.id,
            lock: Rc::downgrade(lock),
        }
    }

    pub(crate) fn upgrade(&self) -> Option<DirectoryLock> {
        self.lock.upgrade().map(DirectoryLock::from_inner)
    }
}

struct LockCore {
    state: LockState,
    invalidated: bool,
    registered: bool,
    blocking: Vec<LockLink>,
    blocked_on: Vec<LockLink>,
    acquire_holder: PromiseHolder<AcquireOutcome>,
    /// Kept after settlement so repeated `acquire` calls see the same promise.
    acquire_promise: Option<AcquirePromise>,
    invalidation_handler: Option<Weak<dyn InvalidationHandler>>,
}

pub(crate) struct LockInner {
    registry: LockRegistry,
    id: LockId,
    scope: LockScope,
    suffix: String,
    group: String,
    storage_origin: String,
    is_private: bool,
    kind: LockKind,
    internal: bool,
    id_table: IdTableUpdate,
    category: DirectoryLockCategory,
    core: RefCell<LockCore>,
}

impl LockInner {
    pub(crate) fn id(&self) -> LockId {
        self.id
    }

    pub(crate) fn scope(&self) -> &LockScope {
        &self.scope
    }

    pub(crate) fn id_table_update(&self) -> IdTableUpdate {
        self.id_table
    }

    pub(crate) fn set_registered(&self, registered: bool) {
        self.core.borrow_mut().registered = registered;
    }

    /// Repository whose origin table tracks this lock, if any. Internal and
    /// persistent locks do not update origin access times.
    pub(crate) fn lock_table_key(&self) -> Option<PersistenceType> {
        if self.internal {
            return None;
        }
        match self.scope.persistence.value() {
            Some(PersistenceType::Persistent) | None => None,
            Some(persistence_type) => Some(persistence_type),
        }
    }

    pub(crate) fn persistence_type(&self) -> PersistenceType {
        match self.scope.persistence.value() {
            Some(persistence_type) => persistence_type,
            None => panic!(
                "directory lock {} covers persistence scope {}, not a single type",
                self.id, self.scope.persistence
            ),
        }
    }

    pub(crate) fn origin(&self) -> &str {
        match self.scope.origin.origin() {
            Some(origin) if !origin.is_empty() => origin,
            _ => panic!(
                "directory lock {} covers origin scope {}, not a single origin",
                self.id, self.scope.origin
            ),
        }
    }

    pub(crate) fn origin_metadata(&self) -> OriginMetadata {
        assert!(
            !self.group.is_empty(),
            "directory lock {} carries no origin metadata",
            self.id
        );
        OriginMetadata {
            suffix: self.suffix.clone(),
            group: self.group.clone(),
            origin: self.origin().to_string(),
            storage_origin: self.storage_origin.clone(),
            is_private: self.is_private,
            persistence_type: self.persistence_type(),
        }
    }

    /// Unregisters from the registry, then unblocks every lock waiting on
    /// this one. The registry goes first so origin bookkeeping is current
    /// before any waiter proceeds.
    fn unregister(&self) {
        self.registry.unregister(self);

        let blocking = std::mem::take(&mut self.core.borrow_mut().blocking);
        for link in blocking {
            if let Some(blocked) = link.upgrade() {
                blocked.maybe_unblock(self.id);
            }
        }
    }
}

impl Drop for LockInner {
    fn drop(&mut self) {
        if self.core.get_mut().registered {
            warn!(
                "Directory lock {} ({}) destroyed without being released",
                self.id, self.scope
            );
            self.unregister();
        }
    }
}

/// Serializable view of a lock used for diagnostics.
#[derive(Debug, Clone, Serialize)]
pub struct LockSnapshot {
    pub id: LockId,
    pub scope: String,
    pub kind: LockKind,
    pub internal: bool,
    pub category: DirectoryLockCategory,
    pub state: LockState,
    pub invalidated: bool,
    pub blocked_on: Vec<LockId>,
    pub blocking: Vec<LockId>,
}

/// Owning handle to a directory lock.
#[derive(Clone)]
pub struct DirectoryLock {
    inner: Rc<LockInner>,
}

impl PartialEq for DirectoryLock {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for DirectoryLock {}

impl fmt::Debug for DirectoryLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DirectoryLock")
            .field("id", &self.inner.id)
            .field("scope", &self.inner.scope.label())
            .field("kind", &self.inner.kind)
            .field("state", &self.state())
            .finish()
    }
}

impl DirectoryLock {
    /// Creates a lock in the `Created` state.
    ///
    /// # Panics
    /// Panics when an external request does not name a concrete persistence
    /// type, origin, group, storage origin and enabled client type.
    pub fn create(registry: &LockRegistry, request: LockRequest) -> Self {
        request.validate(registry);

        let LockRequest {
            persistence,
            suffix,
            group,
            origin,
            storage_origin,
            is_private,
            client,
            kind,
            internal,
            id_table,
            category,
        } = request;

        let lock = Self {
            inner: Rc::new(LockInner {
                registry: registry.clone(),
                id: registry.generate_lock_id(),
                scope: LockScope::new(persistence, origin, client),
                suffix,
                group,
                storage_origin,
                is_private,
                kind,
                internal,
                id_table,
                category,
                core: RefCell::new(LockCore {
                    state: LockState::Created,
                    invalidated: false,
                    registered: false,
                    blocking: Vec::new(),
                    blocked_on: Vec::new(),
                    acquire_holder: PromiseHolder::new(),
                    acquire_promise: None,
                    invalidation_handler: None,
                }),
            }),
        };
        debug!(
            "Created {} directory lock {} over {}{}",
            lock.inner.kind,
            lock.inner.id,
            lock.inner.scope,
            if lock.inner.internal { " (internal)" } else { "" }
        );
        lock
    }

    /// Creates an external lock over one client directory of one origin.
    pub fn for_client(
        registry: &LockRegistry,
        persistence_type: PersistenceType,
        metadata: &OriginMetadata,
        client: ClientType,
        kind: LockKind,
    ) -> Self {
        let request = LockRequest::new(
            PersistenceScope::from_value(persistence_type),
            OriginScope::from_origin(metadata.origin.as_str()),
        )
        .with_origin_metadata(metadata)
        .with_client(Some(client))
        .with_kind(kind);
        Self::create(registry, request)
    }

    /// Creates the exclusive internal lock covering every client directory
    /// of an origin that is about to be evicted. Eviction locks stay out of
    /// the registry's id table.
    pub fn for_eviction(
        registry: &LockRegistry,
        persistence_type: PersistenceType,
        metadata: &OriginMetadata,
    ) -> Self {
        assert!(!metadata.origin.is_empty(), "eviction lock needs an origin");
        assert!(
            !metadata.storage_origin.is_empty(),
            "eviction lock needs a storage origin"
        );

        let request = LockRequest::new(
            PersistenceScope::from_value(persistence_type),
            OriginScope::from_origin(metadata.origin.as_str()),
        )
        .with_origin_metadata(metadata)
        .with_kind(LockKind::Exclusive)
        .with_internal(true)
        .with_id_table_update(IdTableUpdate::No);
        Self::create(registry, request)
    }

    /// Creates an internal lock over an arbitrary, possibly wildcard, scope.
    pub fn internal(
        registry: &LockRegistry,
        persistence: PersistenceScope,
        origin: OriginScope,
        client: Option<ClientType>,
        kind: LockKind,
        category: DirectoryLockCategory,
    ) -> Self {
        let request = LockRequest::new(persistence, origin)
            .with_client(client)
            .with_kind(kind)
            .with_internal(true)
            .with_category(category);
        Self::create(registry, request)
    }

    pub(crate) fn from_inner(inner: Rc<LockInner>) -> Self {
        Self { inner }
    }

    pub(crate) fn inner(&self) -> &Rc<LockInner> {
        &self.inner
    }

    fn core(&self) -> Ref<'_, LockCore> {
        self.inner.core.borrow()
    }

    fn registry(&self) -> &LockRegistry {
        &self.inner.registry
    }

    pub fn id(&self) -> LockId {
        self.inner.id
    }

    pub fn category(&self) -> DirectoryLockCategory {
        self.inner.category
    }

    pub fn kind(&self) -> LockKind {
        self.inner.kind
    }

    pub fn is_exclusive(&self) -> bool {
        self.inner.kind.is_exclusive()
    }

    pub fn is_internal(&self) -> bool {
        self.inner.internal
    }

    pub fn scope(&self) -> &LockScope {
        &self.inner.scope
    }

    pub fn persistence_scope(&self) -> &PersistenceScope {
        &self.inner.scope.persistence
    }

    pub fn origin_scope(&self) -> &OriginScope {
        &self.inner.scope.origin
    }

    /// Client type scope; `None` covers every client.
    pub fn nullable_client_type(&self) -> Option<ClientType> {
        self.inner.scope.client
    }

    pub fn state(&self) -> LockState {
        self.core().state
    }

    /// True until the lock is granted or dropped.
    pub fn is_pending(&self) -> bool {
        matches!(self.state(), LockState::Created | LockState::Waiting)
    }

    /// True once the lock has been granted, even after it is dropped.
    pub fn acquired(&self) -> bool {
        matches!(
            self.state(),
            LockState::Acquired | LockState::Dropped { acquired: true }
        )
    }

    pub fn dropped(&self) -> bool {
        matches!(self.state(), LockState::Dropped { .. })
    }

    pub fn invalidated(&self) -> bool {
        self.core().invalidated
    }

    pub fn is_registered(&self) -> bool {
        self.core().registered
    }

    /// # Panics
    /// Panics when the persistence scope is not a single type.
    pub fn persistence_type(&self) -> PersistenceType {
        self.inner.persistence_type()
    }

    /// # Panics
    /// Panics when the origin scope is not a single origin.
    pub fn origin(&self) -> &str {
        self.inner.origin()
    }

    /// # Panics
    /// Panics when the lock was not created for a single origin.
    pub fn origin_metadata(&self) -> OriginMetadata {
        self.inner.origin_metadata()
    }

    /// # Panics
    /// Panics when the lock covers every client or the client is disabled.
    pub fn client_type(&self) -> ClientType {
        match self.inner.scope.client {
            Some(client) => {
                assert!(
                    self.registry().client_type_in_range(client),
                    "client type {client} is not enabled"
                );
                client
            }
            None => panic!(
                "directory lock {} covers every client type",
                self.inner.id
            ),
        }
    }

    /// Ids of the locks this one is still waiting for.
    pub fn blocked_on_ids(&self) -> Vec<LockId> {
        self.core().blocked_on.iter().map(|link| link.id).collect()
    }

    /// Ids of the locks waiting for this one.
    pub fn blocking_ids(&self) -> Vec<LockId> {
        self.core().blocking.iter().map(|link| link.id).collect()
    }

    /// Tests whether both locks touch the same storage region.
    pub fn overlaps(&self, other: &DirectoryLock) -> bool {
        self.inner.scope.overlaps(&other.inner.scope)
    }

    /// Tests whether this lock has to wait for `other`.
    pub fn must_wait_for(&self, other: &DirectoryLock) -> bool {
        scope::must_wait_for(
            self.inner.kind,
            &self.inner.scope,
            other.inner.kind,
            &other.inner.scope,
        )
    }

    /// Tests whether acquiring now would have to wait.
    ///
    /// # Panics
    /// Panics when the lock is already registered.
    pub fn must_wait(&self) -> bool {
        assert!(
            !self.is_registered(),
            "directory lock {} is already registered",
            self.id()
        );
        self.registry()
            .registered_locks()
            .iter()
            .any(|existing| self.must_wait_for(existing))
    }

    /// Returns the registered locks acquiring now would have to wait for.
    ///
    /// # Panics
    /// Panics when the lock is already registered.
    pub fn locks_must_wait_for(&self) -> Vec<DirectoryLock> {
        assert!(
            !self.is_registered(),
            "directory lock {} is already registered",
            self.id()
        );
        self.registry()
            .registered_locks()
            .into_iter()
            .filter(|existing| self.must_wait_for(existing))
            .collect()
    }

    /// Requests the lock. The returned promise settles once every older
    /// conflicting lock has been released; it is already settled when no
    /// such lock exists. Calling this again returns the same promise.
    ///
    /// # Panics
    /// Panics when the lock was acquired immediately or already dropped.
    pub fn acquire(&self) -> AcquirePromise {
        let promise = {
            let mut core = self.inner.core.borrow_mut();
            if let Some(promise) = &core.acquire_promise {
                return promise.clone();
            }
            assert!(
                core.state == LockState::Created,
                "directory lock {} cannot be acquired while {}",
                self.inner.id,
                core.state
            );
            let promise = core.acquire_holder.ensure();
            core.acquire_promise = Some(promise.clone());
            core.state = LockState::Waiting;
            promise
        };

        self.acquire_internal();
        promise
    }

    fn acquire_internal(&self) {
        let registry = self.registry().clone();
        registry.add_pending(self);

        let blockers: Vec<DirectoryLock> = registry
            .registered_locks()
            .into_iter()
            .filter(|existing| self.must_wait_for(existing))
            .collect();
        for blocker in &blockers {
            blocker.add_blocking_lock(self);
            self.add_blocked_on_lock(blocker);
        }

        registry.register(self);

        if blockers.is_empty() {
            self.notify_open_listener();
            return;
        }

        debug!(
            "Directory lock {} ({}) waits for {:?}",
            self.inner.id,
            self.inner.scope,
            self.blocked_on_ids()
        );
        if blockers.len() >= registry.config().blocked_warning_threshold {
            warn!(
                "Directory lock {} is blocked on {} locks",
                self.inner.id,
                blockers.len()
            );
        }

        if !(self.inner.kind.is_exclusive() && self.inner.internal) {
            return;
        }

        // An exclusive internal lock preempts the external locks in its way.
        // Every blocker is flagged before any handler runs, so a waiter that
        // a handler unblocks is rejected rather than granted. Acquired
        // blockers also get their client operations aborted.
        let mut lock_ids = LockIdsByClient::new();
        let mut handlers = Vec::new();
        for blocker in blockers.iter().filter(|blocker| !blocker.is_internal()) {
            if let Some(handler) = blocker.mark_invalidated() {
                handlers.push((blocker, handler));
            }
            if !blocker.is_pending() {
                lock_ids
                    .entry(blocker.client_type())
                    .or_default()
                    .push(blocker.id());
            }
        }
        for (blocker, handler) in handlers {
            handler.lock_invalidated(blocker);
        }
        registry.abort_operations_for_locks(&lock_ids);
    }

    /// Grants the lock synchronously.
    ///
    /// # Panics
    /// Panics when the lock was already requested, or when any registered
    /// lock conflicts with it.
    pub fn acquire_immediately(&self) {
        {
            let core = self.core();
            assert!(
                core.state == LockState::Created && core.acquire_promise.is_none(),
                "directory lock {} cannot be acquired immediately while {}",
                self.inner.id,
                core.state
            );
        }

        for existing in self.registry().registered_locks() {
            assert!(
                !self.must_wait_for(&existing),
                "directory lock {} ({}) conflicts with registered lock {} ({})",
                self.inner.id,
                self.inner.scope,
                existing.id(),
                existing.scope()
            );
        }

        self.registry().register(self);
        self.inner.core.borrow_mut().state = LockState::Acquired;
        debug!("Directory lock {} acquired immediately", self.inner.id);
    }

    fn add_blocking_lock(&self, lock: &DirectoryLock) {
        self.inner
            .core
            .borrow_mut()
            .blocking
            .push(LockLink::new(&lock.inner));
    }

    fn add_blocked_on_lock(&self, lock: &DirectoryLock) {
        self.inner
            .core
            .borrow_mut()
            .blocked_on
            .push(LockLink::new(&lock.inner));
    }

    /// Forgets `completed` as a blocker; settles acquisition when it was the
    /// last one. Unknown ids are ignored.
    pub(crate) fn maybe_unblock(&self, completed: LockId) {
        let unblocked = {
            let mut core = self.inner.core.borrow_mut();
            let before = core.blocked_on.len();
            core.blocked_on.retain(|link| link.id != completed);
            before != core.blocked_on.len()
                && core.blocked_on.is_empty()
                && core.state == LockState::Waiting
        };

        if unblocked {
            self.notify_open_listener();
        }
    }

    /// Settles acquisition once nothing blocks the lock. A lock invalidated
    /// while it waited is rejected and dropped instead of granted.
    fn notify_open_listener(&self) {
        let (invalidated, mut holder) = {
            let mut core = self.inner.core.borrow_mut();
            debug_assert!(core.blocked_on.is_empty());
            let invalidated = core.invalidated;
            core.state = if invalidated {
                LockState::Dropped { acquired: false }
            } else {
                LockState::Acquired
            };
            (invalidated, std::mem::take(&mut core.acquire_holder))
        };

        let pending = self.registry().remove_pending(self.inner.id);

        if invalidated {
            info!(
                "Directory lock {} was invalidated while waiting; rejecting",
                self.inner.id
            );
            holder.settle(Err(LockRejection::Invalidated));
            self.inner.unregister();
        } else {
            debug!(
                "Directory lock {} acquired ({})",
                self.inner.id, self.inner.scope
            );
            holder.settle(Ok(()));
        }

        drop(pending);
    }

    /// Releases the lock and unblocks its waiters. A still-waiting lock has
    /// its acquisition rejected as canceled. Releasing twice is a no-op.
    pub fn release(&self) -> ReleasePromise {
        let (previous, registered, mut holder, blocked_on) = {
            let mut core = self.inner.core.borrow_mut();
            let previous = core.state;
            if let LockState::Dropped { .. } = previous {
                return ReleasePromise::settled(());
            }
            core.state = LockState::Dropped {
                acquired: previous == LockState::Acquired,
            };
            (
                previous,
                core.registered,
                std::mem::take(&mut core.acquire_holder),
                std::mem::take(&mut core.blocked_on),
            )
        };
        debug!(
            "Releasing directory lock {} ({}) from {previous}",
            self.inner.id, self.inner.scope
        );

        for link in blocked_on {
            if let Some(blocker) = link.upgrade() {
                blocker
                    .inner
                    .core
                    .borrow_mut()
                    .blocking
                    .retain(|blocked| blocked.id != self.inner.id);
            }
        }

        let pending = if previous == LockState::Waiting {
            holder.settle(Err(LockRejection::Canceled));
            self.registry().remove_pending(self.inner.id)
        } else {
            None
        };

        if registered {
            self.inner.unregister();
        }

        drop(pending);
        ReleasePromise::settled(())
    }

    /// Flags the lock as invalidated and notifies its handler. Only the
    /// first call has any effect.
    pub fn invalidate(&self) {
        if let Some(handler) = self.mark_invalidated() {
            handler.lock_invalidated(self);
        }
    }

    /// Sets the invalidation flag and returns the live handler to notify.
    /// Returns `None` when the lock was already invalidated.
    fn mark_invalidated(&self) -> Option<Rc<dyn InvalidationHandler>> {
        let handler = {
            let mut core = self.inner.core.borrow_mut();
            if core.invalidated {
                return None;
            }
            core.invalidated = true;
            core.invalidation_handler.clone()
        };
        info!(
            "Directory lock {} ({}) invalidated",
            self.inner.id, self.inner.scope
        );
        handler.and_then(|handler| handler.upgrade())
    }

    /// Registers the invalidation handler. It runs right away when the lock
    /// is already invalidated.
    ///
    /// # Panics
    /// Panics when a handler is already registered.
    pub fn on_invalidate<H>(&self, handler: &Rc<H>)
    where
        H: InvalidationHandler + 'static,
    {
        let weak: Weak<H> = Rc::downgrade(handler);
        let weak: Weak<dyn InvalidationHandler> = weak;
        let already_invalidated = {
            let mut core = self.inner.core.borrow_mut();
            assert!(
                core.invalidation_handler.is_none(),
                "directory lock {} already has an invalidation handler",
                self.inner.id
            );
            core.invalidation_handler = Some(weak);
            core.invalidated
        };

        if already_invalidated {
            handler.lock_invalidated(self);
        }
    }

    /// Derives a shared lock for one client directory from this shared,
    /// unblocked universal lock. The new lock takes over every waiter of
    /// this lock that conflicts with it and is registered as acquired.
    /// Returns `None` when this lock is exclusive or does not cover the
    /// requested directory.
    pub fn specialize_for_client(
        &self,
        persistence_type: PersistenceType,
        metadata: &OriginMetadata,
        client: ClientType,
    ) -> Option<DirectoryLock> {
        assert!(!metadata.group.is_empty(), "specialized lock needs a group");
        assert!(!metadata.origin.is_empty(), "specialized lock needs an origin");
        assert!(
            self.core().blocked_on.is_empty(),
            "directory lock {} is still blocked",
            self.inner.id
        );

        if self.is_exclusive() {
            warn!(
                "Refusing to specialize exclusive directory lock {}",
                self.inner.id
            );
            return None;
        }

        let request = LockRequest::new(
            PersistenceScope::from_value(persistence_type),
            OriginScope::from_origin(metadata.origin.as_str()),
        )
        .with_origin_metadata(metadata)
        .with_client(Some(client))
        .with_kind(LockKind::Shared)
        .with_internal(self.inner.internal)
        .with_category(self.inner.category);
        let lock = DirectoryLock::create(self.registry(), request);

        if !self.overlaps(&lock) {
            warn!(
                "Directory lock {} does not cover {}",
                self.inner.id,
                lock.scope()
            );
            return None;
        }

        let waiters: Vec<DirectoryLock> = self
            .core()
            .blocking
            .iter()
            .filter_map(LockLink::upgrade)
            .collect();
        for waiter in waiters.iter().filter(|waiter| waiter.must_wait_for(&lock)) {
            lock.add_blocking_lock(waiter);
            waiter.add_blocked_on_lock(&lock);
        }

        self.registry().register(&lock);
        lock.inner.core.borrow_mut().state = LockState::Acquired;

        if self.invalidated() {
            lock.invalidate();
        }

        Some(lock)
    }

    /// Debug-build check that this lock is an acquired exclusive internal
    /// lock and that no other acquired lock conflicts with it.
    pub fn assert_acquired_exclusively(&self) {
        if !cfg!(debug_assertions) {
            return;
        }

        {
            let core = self.core();
            debug_assert!(core.blocked_on.is_empty());
            debug_assert!(core.registered);
            debug_assert!(!core.invalidated);
            debug_assert_eq!(core.state, LockState::Acquired);
        }
        debug_assert!(self.inner.kind.is_exclusive());
        debug_assert!(self.inner.internal);

        let mut found = false;
        for existing in self.registry().registered_locks() {
            if existing == *self {
                debug_assert!(!found);
                found = true;
            } else if existing.acquired() {
                debug_assert!(
                    !self.must_wait_for(&existing),
                    "directory lock {} overlaps acquired lock {}",
                    self.inner.id,
                    existing.id()
                );
            }
        }
        debug_assert!(found);
    }

    pub fn snapshot(&self) -> LockSnapshot {
        let core = self.core();
        LockSnapshot {
            id: self.inner.id,
            scope: self.inner.scope.label(),
            kind: self.inner.kind,
            internal: self.inner.internal,
            category: self.inner.category,
            state: core.state,
            invalidated: core.invalidated,
            blocked_on: core.blocked_on.iter().map(|link| link.id).collect(),
            blocking: core.blocking.iter().map(|link| link.id).collect(),
        }
    }

    /// Writes the lock's state to the debug log.
    pub fn log(&self) {
        let snapshot = self.snapshot();
        debug!("DirectoryLock {}", snapshot.id);
        debug!("  scope: {}", snapshot.scope);
        debug!("  kind: {}", snapshot.kind);
        debug!("  internal: {}", snapshot.internal);
        debug!("  category: {}", snapshot.category);
        debug!("  state: {}", snapshot.state);
        debug!("  invalidated: {}", snapshot.invalidated);
        debug!("  blocked on: {:?}", snapshot.blocked_on);
        debug!("  blocking: {:?}", snapshot.blocking);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LockingConfig;
    use std::cell::Cell;

    fn metadata(origin: &str) -> OriginMetadata {
        OriginMetadata::from_origin(origin, PersistenceType::Temporary)
    }

    fn client_lock(registry: &LockRegistry, origin: &str, kind: LockKind) -> DirectoryLock {
        DirectoryLock::for_client(
            registry,
            PersistenceType::Temporary,
            &metadata(origin),
            ClientType::IndexedDb,
            kind,
        )
    }

    #[test]
    fn ids_follow_creation_order() {
        let registry = LockRegistry::default();
        let first = client_lock(&registry, "https://a.example", LockKind::Shared);
        let second = client_lock(&registry, "https://a.example", LockKind::Shared);
        assert!(second.id() > first.id());
    }

    #[test]
    fn unblocked_acquire_settles_synchronously() {
        let registry = LockRegistry::default();
        let lock = client_lock(&registry, "https://a.example", LockKind::Exclusive);
        let promise = lock.acquire();
        assert_eq!(promise.outcome(), Some(Ok(())));
        assert_eq!(lock.state(), LockState::Acquired);
        assert!(!lock.is_pending());
        assert_eq!(registry.pending_lock_count(), 0);
    }

    #[test]
    fn second_acquire_rides_the_same_promise() {
        let registry = LockRegistry::default();
        let first = client_lock(&registry, "https://a.example", LockKind::Exclusive);
        first.acquire();
        let second = client_lock(&registry, "https://a.example", LockKind::Exclusive);
        let promise = second.acquire();
        let again = second.acquire();
        assert_eq!(second.blocked_on_ids(), vec![first.id()]);
        assert_eq!(registry.registered_lock_count(), 2);

        first.release();
        assert_eq!(promise.outcome(), Some(Ok(())));
        assert_eq!(again.outcome(), Some(Ok(())));
        assert_eq!(second.acquire().outcome(), Some(Ok(())));
    }

    #[test]
    fn release_of_waiting_lock_cancels_and_detaches() {
        let registry = LockRegistry::default();
        let holder = client_lock(&registry, "https://a.example", LockKind::Exclusive);
        holder.acquire();
        let waiter = client_lock(&registry, "https://a.example", LockKind::Exclusive);
        let promise = waiter.acquire();
        assert_eq!(holder.blocking_ids(), vec![waiter.id()]);

        waiter.release();
        assert_eq!(promise.outcome(), Some(Err(LockRejection::Canceled)));
        assert!(holder.blocking_ids().is_empty());
        assert!(!waiter.acquired());
        assert!(waiter.dropped());
        assert_eq!(registry.pending_lock_count(), 0);
        assert_eq!(registry.registered_lock_count(), 1);
    }

    #[test]
    fn invalidated_waiter_is_rejected_when_unblocked() {
        let registry = LockRegistry::default();
        let holder = client_lock(&registry, "https://a.example", LockKind::Exclusive);
        holder.acquire();
        let waiter = client_lock(&registry, "https://a.example", LockKind::Shared);
        let promise = waiter.acquire();

        waiter.invalidate();
        assert!(promise.outcome().is_none());

        holder.release();
        assert_eq!(promise.outcome(), Some(Err(LockRejection::Invalidated)));
        assert!(waiter.dropped());
        assert!(!waiter.is_registered());
        assert_eq!(registry.registered_lock_count(), 0);
    }

    #[test]
    fn invalidation_handler_runs_once_and_late_registration_fires() {
        let registry = LockRegistry::default();
        let lock = client_lock(&registry, "https://a.example", LockKind::Shared);
        lock.acquire();

        let calls = Rc::new(Cell::new(0));
        let counter = calls.clone();
        let handler = Rc::new(move |_: &DirectoryLock| counter.set(counter.get() + 1));
        lock.on_invalidate(&handler);
        lock.invalidate();
        lock.invalidate();
        assert_eq!(calls.get(), 1);

        let late = client_lock(&registry, "https://b.example", LockKind::Shared);
        late.invalidate();
        let late_calls = Rc::new(Cell::new(0));
        let late_counter = late_calls.clone();
        let late_handler =
            Rc::new(move |_: &DirectoryLock| late_counter.set(late_counter.get() + 1));
        late.on_invalidate(&late_handler);
        assert_eq!(late_calls.get(), 1);
    }

    #[test]
    fn dropped_handler_is_not_called() {
        let registry = LockRegistry::default();
        let lock = client_lock(&registry, "https://a.example", LockKind::Shared);
        let calls = Rc::new(Cell::new(0));
        let counter = calls.clone();
        let handler = Rc::new(move |_: &DirectoryLock| counter.set(counter.get() + 1));
        lock.on_invalidate(&handler);
        drop(handler);
        lock.invalidate();
        assert_eq!(calls.get(), 0);
        assert!(lock.invalidated());
    }

    #[test]
    fn destroyed_handle_unblocks_waiters() {
        let registry = LockRegistry::default();
        let holder = client_lock(&registry, "https://a.example", LockKind::Exclusive);
        holder.acquire();
        let waiter = client_lock(&registry, "https://a.example", LockKind::Exclusive);
        let promise = waiter.acquire();

        drop(holder);
        assert_eq!(promise.outcome(), Some(Ok(())));
        assert_eq!(registry.registered_lock_count(), 1);
    }

    #[test]
    #[should_panic(expected = "conflicts with registered lock")]
    fn acquire_immediately_panics_when_blocked() {
        let registry = LockRegistry::default();
        let holder = client_lock(&registry, "https://a.example", LockKind::Exclusive);
        holder.acquire_immediately();
        let other = client_lock(&registry, "https://a.example", LockKind::Shared);
        other.acquire_immediately();
    }

    #[test]
    #[should_panic(expected = "cannot be acquired immediately")]
    fn acquire_immediately_after_acquire_panics() {
        let registry = LockRegistry::default();
        let lock = client_lock(&registry, "https://a.example", LockKind::Exclusive);
        lock.acquire();
        lock.acquire_immediately();
    }

    #[test]
    #[should_panic(expected = "needs a concrete origin")]
    fn external_lock_rejects_wildcard_origin() {
        let registry = LockRegistry::default();
        let request = LockRequest::new(
            PersistenceScope::from_value(PersistenceType::Default),
            OriginScope::null(),
        )
        .with_group("https://a.example")
        .with_storage_origin("https://a.example")
        .with_client(Some(ClientType::IndexedDb));
        DirectoryLock::create(&registry, request);
    }

    #[test]
    #[should_panic(expected = "is not enabled")]
    fn external_lock_rejects_disabled_client() {
        let config = LockingConfig {
            next_gen_local_storage: false,
            ..LockingConfig::default()
        };
        let registry = LockRegistry::new(config);
        DirectoryLock::for_client(
            &registry,
            PersistenceType::Default,
            &metadata("https://a.example"),
            ClientType::LocalStorage,
            LockKind::Shared,
        );
    }

    #[test]
    #[should_panic(expected = "covers every client type")]
    fn client_type_accessor_panics_on_wildcard() {
        let registry = LockRegistry::default();
        let lock = DirectoryLock::for_eviction(
            &registry,
            PersistenceType::Default,
            &metadata("https://a.example"),
        );
        lock.client_type();
    }

    #[test]
    fn must_wait_reports_conflicting_locks() {
        let registry = LockRegistry::default();
        let holder = client_lock(&registry, "https://a.example", LockKind::Shared);
        holder.acquire();
        let unrelated = client_lock(&registry, "https://b.example", LockKind::Exclusive);
        unrelated.acquire();

        let candidate = client_lock(&registry, "https://a.example", LockKind::Exclusive);
        assert!(candidate.must_wait());
        assert_eq!(candidate.locks_must_wait_for(), vec![holder.clone()]);

        let reader = client_lock(&registry, "https://a.example", LockKind::Shared);
        assert!(!reader.must_wait());
        assert!(reader.locks_must_wait_for().is_empty());
    }

    #[test]
    fn specialization_inherits_waiters() {
        let registry = LockRegistry::default();
        let universal = DirectoryLock::internal(
            &registry,
            PersistenceScope::from_value(PersistenceType::Temporary),
            OriginScope::from_prefix("https://a.example"),
            None,
            LockKind::Shared,
            DirectoryLockCategory::None,
        );
        universal.acquire();
        let writer = client_lock(&registry, "https://a.example", LockKind::Exclusive);
        let promise = writer.acquire();
        assert_eq!(writer.blocked_on_ids(), vec![universal.id()]);

        let specialized = universal
            .specialize_for_client(
                PersistenceType::Temporary,
                &metadata("https://a.example"),
                ClientType::IndexedDb,
            )
            .unwrap();
        assert!(specialized.acquired());
        assert_eq!(specialized.blocking_ids(), vec![writer.id()]);

        universal.release();
        assert!(promise.outcome().is_none());
        specialized.release();
        assert_eq!(promise.outcome(), Some(Ok(())));
    }

    #[test]
    fn specialization_refuses_exclusive_and_disjoint_locks() {
        let registry = LockRegistry::default();
        let exclusive = DirectoryLock::internal(
            &registry,
            PersistenceScope::null(),
            OriginScope::null(),
            None,
            LockKind::Exclusive,
            DirectoryLockCategory::None,
        );
        exclusive.acquire();
        assert!(
            exclusive
                .specialize_for_client(
                    PersistenceType::Default,
                    &metadata("https://a.example"),
                    ClientType::DomCache,
                )
                .is_none()
        );
        exclusive.release();

        let shared = DirectoryLock::internal(
            &registry,
            PersistenceScope::from_value(PersistenceType::Default),
            OriginScope::from_origin("https://a.example"),
            None,
            LockKind::Shared,
            DirectoryLockCategory::None,
        );
        shared.acquire();
        assert!(
            shared
                .specialize_for_client(
                    PersistenceType::Default,
                    &metadata("https://b.example"),
                    ClientType::DomCache,
                )
                .is_none()
        );
    }

    #[test]
    fn snapshot_reflects_graph() {
        let registry = LockRegistry::default();
        let holder = client_lock(&registry, "https://a.example", LockKind::Exclusive);
        holder.acquire();
        let waiter = client_lock(&registry, "https://a.example", LockKind::Shared);
        waiter.acquire();

        let snapshot = waiter.snapshot();
        assert_eq!(snapshot.state, LockState::Waiting);
        assert_eq!(snapshot.blocked_on, vec![holder.id()]);
        assert_eq!(holder.snapshot().blocking, vec![waiter.id()]);
        assert_eq!(snapshot.scope, "temporary/https://a.example/idb");
        waiter.log();
    }

    #[test]
    fn acquired_exclusively_holds_for_lone_internal_lock() {
        let registry = LockRegistry::default();
        let lock = DirectoryLock::internal(
            &registry,
            PersistenceScope::null(),
            OriginScope::null(),
            None,
            LockKind::Exclusive,
            DirectoryLockCategory::UninitStorage,
        );
        lock.acquire();
        lock.assert_acquired_exclusively();
    }
}
