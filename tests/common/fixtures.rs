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

//! Shared fixtures for building registries and locks in integration tests
use quota_dirlock::config::LockingConfig;
use quota_dirlock::locking::{
    ClientType, DirectoryLock, DirectoryLockCategory, LockIdsByClient, LockKind, LockRegistry,
    LockRegistryObserver, OriginMetadata, OriginScope, PersistenceScope, PersistenceType,
};
use std::cell::RefCell;
use std::path::{Path, PathBuf};
use std::rc::Rc;

#[allow(dead_code)]
pub const ORIGIN_A: &str = "https://a.example";
#[allow(dead_code)]
pub const ORIGIN_B: &str = "https://b.example";

/// Records every registry callback in arrival order.
#[allow(dead_code)]
#[derive(Default)]
pub struct RecordingObserver {
    pub released: RefCell<Vec<OriginMetadata>>,
    pub aborts: RefCell<Vec<LockIdsByClient>>,
}

impl LockRegistryObserver for RecordingObserver {
    fn on_origin_released(&self, metadata: &OriginMetadata) {
        self.released.borrow_mut().push(metadata.clone());
    }

    fn on_abort_requested(&self, lock_ids: &LockIdsByClient) {
        self.aborts.borrow_mut().push(lock_ids.clone());
    }
}

#[allow(dead_code)]
pub fn observed_registry() -> (LockRegistry, Rc<RecordingObserver>) {
    let observer = Rc::new(RecordingObserver::default());
    let registry = LockRegistry::with_observer(LockingConfig::default(), observer.clone());
    (registry, observer)
}

/// External lock over one client directory.
#[allow(dead_code)]
pub fn client_lock(
    registry: &LockRegistry,
    persistence_type: PersistenceType,
    origin: &str,
    client: ClientType,
    kind: LockKind,
) -> DirectoryLock {
    let metadata = OriginMetadata::from_origin(origin, persistence_type);
    registry.create_directory_lock(persistence_type, &metadata, client, kind)
}

/// Internal lock spanning every client of the given scope.
#[allow(dead_code)]
pub fn internal_lock(
    registry: &LockRegistry,
    persistence: PersistenceScope,
    origin: OriginScope,
    kind: LockKind,
) -> DirectoryLock {
    registry.create_directory_lock_internal(
        persistence,
        origin,
        None,
        kind,
        DirectoryLockCategory::None,
    )
}

/// Writes a scenario file into `dir` and returns its path.
#[allow(dead_code)]
pub fn write_scenario(dir: &Path, contents: &str) -> PathBuf {
    let path = dir.join("scenario.toml");
    std::fs::write(&path, contents).unwrap();
    path
}
