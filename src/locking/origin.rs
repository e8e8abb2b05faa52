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

//! Origin identity and origin scopes.
//!
//! Origins are plain strings such as `https://a.example`. Partitioned origins
//! carry an attribute suffix introduced by `^`, for example
//! `https://a.example^userContextId=1&privateBrowsingId=1`. Scopes compare
//! origins either exactly, by their suffix-less prefix, or by attribute
//! pattern.

use crate::error::{QuotaLockError, Result};
use crate::locking::persistence::PersistenceType;
use std::collections::BTreeMap;
use std::fmt;

const SUFFIX_SEPARATOR: char = '^';
const PRIVATE_BROWSING_ATTRIBUTE: &str = "privateBrowsingId";

/// Attributes an origin carries even when its suffix omits them.
const DEFAULT_ATTRIBUTES: &[(&str, &str)] = &[
    ("userContextId", "0"),
    (PRIVATE_BROWSING_ATTRIBUTE, "0"),
    ("firstPartyDomain", ""),
    ("geckoViewSessionContextId", ""),
    ("partitionKey", ""),
];

/// Splits an origin into the part before the attribute suffix and the suffix
/// itself (including the leading `^`, empty when absent).
pub fn split_origin(origin: &str) -> (&str, &str) {
    match origin.find(SUFFIX_SEPARATOR) {
        Some(index) => origin.split_at(index),
        None => (origin, ""),
    }
}

/// Attribute key/value pairs parsed from an origin suffix.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OriginAttributes {
    values: BTreeMap<String, String>,
}

impl OriginAttributes {
    /// Parses a suffix with or without its leading `^`. Pairs without `=` are
    /// kept with an empty value.
    pub fn from_suffix(suffix: &str) -> Self {
        let body = suffix.strip_prefix(SUFFIX_SEPARATOR).unwrap_or(suffix);
        let values = body
            .split('&')
            .filter(|pair| !pair.is_empty())
            .map(|pair| match pair.split_once('=') {
                Some((key, value)) => (key.to_string(), value.to_string()),
                None => (pair.to_string(), String::new()),
            })
            .collect();
        Self { values }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    /// Like [`get`](Self::get), but falls back to the default value of a
    /// known attribute that the suffix leaves out.
    pub fn get_or_default(&self, key: &str) -> Option<&str> {
        self.get(key).or_else(|| {
            DEFAULT_ATTRIBUTES
                .iter()
                .find(|(name, _)| *name == key)
                .map(|(_, value)| *value)
        })
    }

    pub fn is_private(&self) -> bool {
        self.get(PRIVATE_BROWSING_ATTRIBUTE)
            .is_some_and(|value| !value.is_empty() && value != "0")
    }
}

/// Constraints over origin attributes. Unconstrained keys match anything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OriginAttributesPattern {
    constraints: BTreeMap<String, String>,
}

impl OriginAttributesPattern {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.constraints.insert(key.into(), value.into());
        self
    }

    /// Parses `key=value&key=value`.
    pub fn parse(value: &str) -> Result<Self> {
        let mut pattern = Self::new();
        for pair in value.split('&').filter(|pair| !pair.trim().is_empty()) {
            let Some((key, value)) = pair.split_once('=') else {
                return Err(QuotaLockError::InvalidOriginScope(format!(
                    "pattern entry '{pair}' is missing '='"
                )));
            };
            if key.trim().is_empty() {
                return Err(QuotaLockError::InvalidOriginScope(format!(
                    "pattern entry '{pair}' has an empty key"
                )));
            }
            pattern = pattern.with(key.trim(), value.trim());
        }
        Ok(pattern)
    }

    pub fn matches(&self, attributes: &OriginAttributes) -> bool {
        self.constraints
            .iter()
            .all(|(key, value)| attributes.get_or_default(key) == Some(value.as_str()))
    }

    /// Two patterns overlap unless they pin the same key to different values.
    pub fn overlaps(&self, other: &OriginAttributesPattern) -> bool {
        self.constraints.iter().all(|(key, value)| {
            other
                .constraints
                .get(key)
                .is_none_or(|other_value| other_value == value)
        })
    }
}

impl fmt::Display for OriginAttributesPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let pairs: Vec<String> = self
            .constraints
            .iter()
            .map(|(key, value)| format!("{key}={value}"))
            .collect();
        f.write_str(&pairs.join("&"))
    }
}

/// Which origins a lock covers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OriginScope {
    Origin {
        origin: String,
        attributes: OriginAttributes,
    },
    /// Every origin sharing this suffix-less prefix, whatever its attributes.
    Prefix { origin_no_suffix: String },
    Pattern(OriginAttributesPattern),
    /// Matches every origin.
    Null,
}

impl OriginScope {
    pub fn from_origin(origin: impl Into<String>) -> Self {
        let origin = origin.into();
        let (_, suffix) = split_origin(&origin);
        let attributes = OriginAttributes::from_suffix(suffix);
        Self::Origin { origin, attributes }
    }

    pub fn from_prefix(origin: &str) -> Self {
        let (origin_no_suffix, _) = split_origin(origin);
        Self::Prefix {
            origin_no_suffix: origin_no_suffix.to_string(),
        }
    }

    pub fn from_pattern(pattern: OriginAttributesPattern) -> Self {
        Self::Pattern(pattern)
    }

    pub fn null() -> Self {
        Self::Null
    }

    pub fn is_origin(&self) -> bool {
        matches!(self, OriginScope::Origin { .. })
    }

    pub fn is_null(&self) -> bool {
        matches!(self, OriginScope::Null)
    }

    pub fn origin(&self) -> Option<&str> {
        match self {
            OriginScope::Origin { origin, .. } => Some(origin),
            _ => None,
        }
    }

    /// Tests whether two scopes can name the same origin.
    pub fn matches(&self, other: &OriginScope) -> bool {
        use OriginScope::*;

        match (self, other) {
            (Null, _) | (_, Null) => true,
            (Origin { origin: a, .. }, Origin { origin: b, .. }) => a == b,
            (Origin { origin, .. }, Prefix { origin_no_suffix })
            | (Prefix { origin_no_suffix }, Origin { origin, .. }) => {
                split_origin(origin).0 == origin_no_suffix
            }
            (Origin { attributes, .. }, Pattern(pattern))
            | (Pattern(pattern), Origin { attributes, .. }) => pattern.matches(attributes),
            (Prefix { origin_no_suffix: a }, Prefix { origin_no_suffix: b }) => a == b,
            (Prefix { .. }, Pattern(_)) | (Pattern(_), Prefix { .. }) => true,
            (Pattern(a), Pattern(b)) => a.overlaps(b),
        }
    }
}

impl fmt::Display for OriginScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OriginScope::Origin { origin, .. } => f.write_str(origin),
            OriginScope::Prefix { origin_no_suffix } => write!(f, "prefix:{origin_no_suffix}"),
            OriginScope::Pattern(pattern) => write!(f, "pattern:{pattern}"),
            OriginScope::Null => f.write_str("*"),
        }
    }
}

impl std::str::FromStr for OriginScope {
    type Err = QuotaLockError;

    /// Accepts `*`, `prefix:<origin>`, `pattern:<k=v&...>` or a plain origin.
    fn from_str(value: &str) -> Result<Self> {
        let trimmed = value.trim();
        if trimmed == "*" {
            return Ok(OriginScope::Null);
        }
        if let Some(prefix) = trimmed.strip_prefix("prefix:") {
            if prefix.is_empty() {
                return Err(QuotaLockError::InvalidOriginScope(
                    "prefix scope needs an origin".to_string(),
                ));
            }
            return Ok(OriginScope::from_prefix(prefix));
        }
        if let Some(pattern) = trimmed.strip_prefix("pattern:") {
            return OriginAttributesPattern::parse(pattern).map(OriginScope::Pattern);
        }
        if trimmed.is_empty() {
            return Err(QuotaLockError::InvalidOriginScope(
                "origin must not be empty".to_string(),
            ));
        }
        Ok(OriginScope::from_origin(trimmed))
    }
}

/// Everything a concrete lock knows about the single origin it covers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OriginMetadata {
    pub suffix: String,
    pub group: String,
    pub origin: String,
    pub storage_origin: String,
    pub is_private: bool,
    pub persistence_type: PersistenceType,
}

impl OriginMetadata {
    /// Derives the metadata from the origin string alone: the group is the
    /// origin without its suffix and the storage origin is the origin itself.
    pub fn from_origin(origin: &str, persistence_type: PersistenceType) -> Self {
        let (origin_no_suffix, suffix) = split_origin(origin);
        let is_private = OriginAttributes::from_suffix(suffix).is_private();
        Self {
            suffix: suffix.to_string(),
            group: origin_no_suffix.to_string(),
            origin: origin.to_string(),
            storage_origin: origin.to_string(),
            is_private,
            persistence_type,
        }
    }

    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group = group.into();
        self
    }

    pub fn with_storage_origin(mut self, storage_origin: impl Into<String>) -> Self {
        self.storage_origin = storage_origin.into();
        self
    }
}
