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

use crate::error::QuotaLockError;
use std::fmt;

pub struct ErrorContext<'a> {
    pub error: &'a QuotaLockError,
    pub suggestion: Option<String>,
    pub details: Option<String>,
}

impl<'a> ErrorContext<'a> {
    pub fn new(error: &'a QuotaLockError) -> Self {
        let (suggestion, details) = match error {
            QuotaLockError::InvalidPersistenceType(value) => {
                let suggestion = Some(
                    "Use one of: persistent, temporary, default, private. Lists such as \
                     'temporary,default' or '*' are accepted where a scope is expected."
                        .to_string(),
                );
                let details = Some(format!("Unrecognized persistence type '{value}'."));
                (suggestion, details)
            }
            QuotaLockError::InvalidClientType(value) => {
                let suggestion =
                    Some("Use one of: idb, cache, sdb, fs, ls.".to_string());
                let details = Some(format!("Unrecognized client type '{value}'."));
                (suggestion, details)
            }
            QuotaLockError::InvalidOriginScope(msg) => {
                let suggestion = Some(
                    "Origin scopes are written as '<origin>', 'prefix:<origin>', \
                     'pattern:<key>=<value>&...' or '*'."
                        .to_string(),
                );
                let details = Some(msg.clone());
                (suggestion, details)
            }
            QuotaLockError::InvalidCategory(value) => {
                let suggestion = Some(
                    "Use one of: none, uninit-storage, uninit-origins, uninit-clients.".to_string(),
                );
                let details = Some(format!("Unrecognized lock category '{value}'."));
                (suggestion, details)
            }
            QuotaLockError::ConfigError(msg) => {
                let suggestion = Some(
                    "Check the [locking] section of the configuration file or pass --config to \
                     use a different file."
                        .to_string(),
                );
                let details = Some(msg.clone());
                (suggestion, details)
            }
            QuotaLockError::ScenarioError(msg) => {
                let suggestion = Some(
                    "Each [[step]] must name a lock declared in a [[lock]] table, and each \
                     action must be one of: acquire, acquire-immediately, release, invalidate."
                        .to_string(),
                );
                let details = Some(msg.clone());
                (suggestion, details)
            }
            QuotaLockError::Io(err) if err.kind() == std::io::ErrorKind::NotFound => {
                let suggestion = Some("Check that the file path is correct.".to_string());
                (suggestion, Some(err.to_string()))
            }
            _ => (None, None),
        };

        ErrorContext {
            error,
            suggestion,
            details,
        }
    }
}

impl<'a> fmt::Display for ErrorContext<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Error: {}", self.error)?;

        if let Some(details) = &self.details {
            write!(f, "\n\nDetails: {details}")?;
        }

        if let Some(suggestion) = &self.suggestion {
            write!(f, "\n\nSuggestion: {suggestion}")?;
        }

        Ok(())
    }
}

/// Renders an error with its details and suggestion for the terminal.
pub fn format_error_chain(error: &QuotaLockError) -> String {
    ErrorContext::new(error).to_string()
}
