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

use crate::error::{QuotaLockError, Result};
use crate::locking::client::ClientType;
use crate::locking::origin::OriginScope;
use crate::locking::persistence::PersistenceScope;
use log::trace;
use serde::Serialize;
use std::fmt;
use std::str::FromStr;

/// Indicates whether a lock should allow concurrent readers or enforce exclusivity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LockKind {
    Shared,
    Exclusive,
}

impl LockKind {
    pub fn from_exclusive(exclusive: bool) -> Self {
        if exclusive {
            LockKind::Exclusive
        } else {
            LockKind::Shared
        }
    }

    pub fn is_exclusive(self) -> bool {
        matches!(self, LockKind::Exclusive)
    }
}

impl fmt::Display for LockKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockKind::Shared => f.write_str("shared"),
            LockKind::Exclusive => f.write_str("exclusive"),
        }
    }
}

/// Tags locks taken by storage clearing and uninitialization operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum DirectoryLockCategory {
    #[default]
    None,
    UninitStorage,
    UninitOrigins,
    UninitClients,
}

impl fmt::Display for DirectoryLockCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            DirectoryLockCategory::None => "none",
            DirectoryLockCategory::UninitStorage => "uninit-storage",
            DirectoryLockCategory::UninitOrigins => "uninit-origins",
            DirectoryLockCategory::UninitClients => "uninit-clients",
        };
        f.write_str(label)
    }
}

impl FromStr for DirectoryLockCategory {
    type Err = QuotaLockError;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "none" | "" => Ok(DirectoryLockCategory::None),
            "uninit-storage" => Ok(DirectoryLockCategory::UninitStorage),
            "uninit-origins" => Ok(DirectoryLockCategory::UninitOrigins),
            "uninit-clients" => Ok(DirectoryLockCategory::UninitClients),
            other => Err(QuotaLockError::InvalidCategory(other.to_string())),
        }
    }
}

/// Whether a lock is entered into the registry's lock id table.
///
/// Eviction locks are created while the registry is already collecting
/// origins and must stay out of the id table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdTableUpdate {
    Yes,
    No,
}

/// The storage region a directory lock covers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockScope {
    pub persistence: PersistenceScope,
    pub origin: OriginScope,
    /// `None` covers every client.
    pub client: Option<ClientType>,
}

impl LockScope {
    pub fn new(
        persistence: PersistenceScope,
        origin: OriginScope,
        client: Option<ClientType>,
    ) -> Self {
        Self {
            persistence,
            origin,
            client,
        }
    }

    /// Tests whether both scopes touch the same storage region.
    pub fn overlaps(&self, other: &LockScope) -> bool {
        if !other.persistence.matches(&self.persistence) {
            trace!("{self} vs {other}: persistence scopes are disjoint");
            return false;
        }

        if !other.origin.matches(&self.origin) {
            trace!("{self} vs {other}: origin scopes are disjoint");
            return false;
        }

        if let (Some(mine), Some(theirs)) = (self.client, other.client) {
            if mine != theirs {
                trace!("{self} vs {other}: client types differ");
                return false;
            }
        }

        true
    }

    /// Human-readable label used for logging and error reporting.
    pub fn label(&self) -> String {
        let client = self
            .client
            .map(|client| client.to_string())
            .unwrap_or_else(|| "*".to_string());
        format!("{}/{}/{}", self.persistence, self.origin, client)
    }
}

impl fmt::Display for LockScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.label())
    }
}

/// Tests whether a lock of `kind` over `scope` has to wait for a lock of
/// `other_kind` over `other_scope`.
pub fn must_wait_for(
    kind: LockKind,
    scope: &LockScope,
    other_kind: LockKind,
    other_scope: &LockScope,
) -> bool {
    if !kind.is_exclusive() && !other_kind.is_exclusive() {
        return false;
    }
    scope.overlaps(other_scope)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::locking::persistence::PersistenceType;

    fn scope(persistence: &str, origin: &str, client: Option<ClientType>) -> LockScope {
        LockScope::new(
            persistence.parse().unwrap(),
            origin.parse().unwrap(),
            client,
        )
    }

    #[test]
    fn overlap_is_symmetric() {
        let scopes = [
            scope("temporary", "https://a.example", Some(ClientType::IndexedDb)),
            scope("temporary", "https://a.example", Some(ClientType::DomCache)),
            scope("default", "https://a.example", Some(ClientType::IndexedDb)),
            scope("temporary", "https://b.example", None),
            scope("*", "*", None),
            scope("temporary,default", "prefix:https://a.example", None),
            scope("*", "pattern:userContextId=1", Some(ClientType::SimpleDb)),
            scope("temporary", "https://a.example^userContextId=1", None),
        ];

        for a in &scopes {
            for b in &scopes {
                assert_eq!(a.overlaps(b), b.overlaps(a), "{a} vs {b}");
            }
        }
    }

    #[test]
    fn wildcards_absorb_concrete_values() {
        let concrete = scope("persistent", "https://a.example", Some(ClientType::FileSystem));

        let any_persistence = scope("*", "https://a.example", Some(ClientType::FileSystem));
        let any_origin = scope("persistent", "*", Some(ClientType::FileSystem));
        let any_client = scope("persistent", "https://a.example", None);

        assert!(concrete.overlaps(&any_persistence));
        assert!(concrete.overlaps(&any_origin));
        assert!(concrete.overlaps(&any_client));
    }

    #[test]
    fn one_disjoint_dimension_prevents_overlap() {
        let base = scope("temporary", "https://a.example", Some(ClientType::IndexedDb));
        assert!(!base.overlaps(&scope(
            "default",
            "https://a.example",
            Some(ClientType::IndexedDb)
        )));
        assert!(!base.overlaps(&scope(
            "temporary",
            "https://b.example",
            Some(ClientType::IndexedDb)
        )));
        assert!(!base.overlaps(&scope(
            "temporary",
            "https://a.example",
            Some(ClientType::DomCache)
        )));
    }

    #[test]
    fn exclusivity_gates_waiting() {
        let a = scope("temporary", "https://a.example", Some(ClientType::IndexedDb));
        let b = a.clone();

        assert!(!must_wait_for(LockKind::Shared, &a, LockKind::Shared, &b));
        assert!(must_wait_for(LockKind::Exclusive, &a, LockKind::Shared, &b));
        assert!(must_wait_for(LockKind::Shared, &a, LockKind::Exclusive, &b));
        assert!(must_wait_for(LockKind::Exclusive, &a, LockKind::Exclusive, &b));

        let elsewhere = scope("temporary", "https://b.example", Some(ClientType::IndexedDb));
        assert!(!must_wait_for(
            LockKind::Exclusive,
            &a,
            LockKind::Exclusive,
            &elsewhere
        ));
    }

    #[test]
    fn labels_are_human_readable() {
        let label = LockScope::new(
            PersistenceScope::from_value(PersistenceType::Default),
            OriginScope::from_origin("https://a.example"),
            Some(ClientType::IndexedDb),
        )
        .label();
        assert_eq!(label, "default/https://a.example/idb");
        assert_eq!(scope("*", "*", None).label(), "*/*/*");
    }

    #[test]
    fn category_round_trips_through_names() {
        assert_eq!(
            "uninit-origins".parse::<DirectoryLockCategory>().unwrap(),
            DirectoryLockCategory::UninitOrigins
        );
        assert_eq!(DirectoryLockCategory::default(), DirectoryLockCategory::None);
        assert!("clear".parse::<DirectoryLockCategory>().is_err());
    }
}
