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

//! Directory lock arbitration for the quota manager.
//!
//! Locks cover a scope of persistence type, origin and client type. Newer
//! requests wait for every older registered request they conflict with.

pub mod client;
pub mod directory_lock;
pub mod origin;
pub mod persistence;
pub mod promise;
pub mod registry;
pub mod scope;

pub use crate::error::LockRejection;
pub use client::ClientType;
pub use directory_lock::{
    AcquireOutcome, AcquirePromise, DirectoryLock, InvalidationHandler, LockId, LockRequest,
    LockSnapshot, LockState, ReleasePromise,
};
pub use origin::{OriginAttributes, OriginAttributesPattern, OriginMetadata, OriginScope};
pub use persistence::{PersistenceScope, PersistenceType};
pub use promise::{Promise, PromiseHolder};
pub use registry::{LockIdsByClient, LockRegistry, LockRegistryObserver, NoopLockRegistryObserver};
pub use scope::{DirectoryLockCategory, IdTableUpdate, LockKind, LockScope, must_wait_for};
