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
use std::fmt;
use std::str::FromStr;

/// Storage engine owning a client directory inside an origin directory.
///
/// Variants are ordered; `LocalStorage` is last so it can be excluded from
/// the valid range when next-generation local storage is disabled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ClientType {
    IndexedDb,
    DomCache,
    SimpleDb,
    FileSystem,
    LocalStorage,
}

impl ClientType {
    pub const ALL: [ClientType; 5] = [
        ClientType::IndexedDb,
        ClientType::DomCache,
        ClientType::SimpleDb,
        ClientType::FileSystem,
        ClientType::LocalStorage,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ClientType::IndexedDb => "idb",
            ClientType::DomCache => "cache",
            ClientType::SimpleDb => "sdb",
            ClientType::FileSystem => "fs",
            ClientType::LocalStorage => "ls",
        }
    }

    /// Number of client types available for the given local storage mode.
    pub fn type_max(next_gen_local_storage: bool) -> usize {
        if next_gen_local_storage {
            Self::ALL.len()
        } else {
            Self::ALL.len() - 1
        }
    }

    pub fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for ClientType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ClientType {
    type Err = QuotaLockError;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "idb" | "indexeddb" => Ok(ClientType::IndexedDb),
            "cache" | "domcache" => Ok(ClientType::DomCache),
            "sdb" | "simpledb" => Ok(ClientType::SimpleDb),
            "fs" | "filesystem" => Ok(ClientType::FileSystem),
            "ls" | "localstorage" => Ok(ClientType::LocalStorage),
            other => Err(QuotaLockError::InvalidClientType(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_storage_is_out_of_range_without_next_gen() {
        assert_eq!(ClientType::type_max(true), 5);
        assert_eq!(ClientType::type_max(false), 4);
        assert!(ClientType::LocalStorage.index() >= ClientType::type_max(false));
        assert!(ClientType::FileSystem.index() < ClientType::type_max(false));
    }

    #[test]
    fn parses_short_and_long_names() {
        assert_eq!("IDB".parse::<ClientType>().unwrap(), ClientType::IndexedDb);
        assert_eq!("localStorage".parse::<ClientType>().unwrap(), ClientType::LocalStorage);
        assert!("quota".parse::<ClientType>().is_err());
        for client in ClientType::ALL {
            assert_eq!(client.as_str().parse::<ClientType>().unwrap(), client);
        }
    }
}
