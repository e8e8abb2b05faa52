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
use serde::Serialize;
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

/// Storage repository a directory belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PersistenceType {
    Persistent,
    Temporary,
    Default,
    Private,
}

impl PersistenceType {
    pub const ALL: [PersistenceType; 4] = [
        PersistenceType::Persistent,
        PersistenceType::Temporary,
        PersistenceType::Default,
        PersistenceType::Private,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            PersistenceType::Persistent => "persistent",
            PersistenceType::Temporary => "temporary",
            PersistenceType::Default => "default",
            PersistenceType::Private => "private",
        }
    }
}

impl fmt::Display for PersistenceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PersistenceType {
    type Err = QuotaLockError;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "persistent" => Ok(PersistenceType::Persistent),
            "temporary" => Ok(PersistenceType::Temporary),
            "default" => Ok(PersistenceType::Default),
            "private" => Ok(PersistenceType::Private),
            other => Err(QuotaLockError::InvalidPersistenceType(other.to_string())),
        }
    }
}

/// Set of persistence types a lock covers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PersistenceScope {
    Value(PersistenceType),
    Set(BTreeSet<PersistenceType>),
    /// Matches every persistence type.
    Null,
}

impl PersistenceScope {
    pub fn from_value(value: PersistenceType) -> Self {
        Self::Value(value)
    }

    pub fn from_set<I>(values: I) -> Self
    where
        I: IntoIterator<Item = PersistenceType>,
    {
        Self::Set(values.into_iter().collect())
    }

    pub fn null() -> Self {
        Self::Null
    }

    pub fn is_value(&self) -> bool {
        matches!(self, PersistenceScope::Value(_))
    }

    pub fn is_null(&self) -> bool {
        matches!(self, PersistenceScope::Null)
    }

    /// Returns the concrete persistence type, if this scope names exactly one.
    pub fn value(&self) -> Option<PersistenceType> {
        match self {
            PersistenceScope::Value(value) => Some(*value),
            _ => None,
        }
    }

    /// Tests whether two scopes share at least one persistence type.
    pub fn matches(&self, other: &PersistenceScope) -> bool {
        match (self, other) {
            (PersistenceScope::Null, _) | (_, PersistenceScope::Null) => true,
            (PersistenceScope::Value(a), PersistenceScope::Value(b)) => a == b,
            (PersistenceScope::Value(value), PersistenceScope::Set(set))
            | (PersistenceScope::Set(set), PersistenceScope::Value(value)) => set.contains(value),
            (PersistenceScope::Set(a), PersistenceScope::Set(b)) => !a.is_disjoint(b),
        }
    }
}

impl fmt::Display for PersistenceScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PersistenceScope::Value(value) => write!(f, "{value}"),
            PersistenceScope::Set(set) => {
                let names: Vec<&str> = set.iter().map(|value| value.as_str()).collect();
                write!(f, "{{{}}}", names.join(","))
            }
            PersistenceScope::Null => f.write_str("*"),
        }
    }
}

impl FromStr for PersistenceScope {
    type Err = QuotaLockError;

    /// Accepts `*`, a single type name, or a comma separated list of names.
    fn from_str(value: &str) -> Result<Self> {
        let trimmed = value.trim();
        if trimmed == "*" {
            return Ok(PersistenceScope::Null);
        }
        if trimmed.contains(',') {
            let values = trimmed
                .split(',')
                .map(PersistenceType::from_str)
                .collect::<Result<BTreeSet<_>>>()?;
            return Ok(PersistenceScope::Set(values));
        }
        trimmed.parse().map(PersistenceScope::Value)
    }
}
