// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Namespaced storage keys and the persisted record families.
//!
//! A [`StorageKey`] is `namespace.field`. The same key string is used in the
//! cache, on the remote store and (behind the `data:` family prefix) in the
//! local durable store, so one logical value always resolves to one key.
//!
//! # Example
//!
//! ```
//! use data_handler::StorageKey;
//!
//! let key = StorageKey::new("profile", "user_1").unwrap();
//! assert_eq!(key.to_string(), "profile.user_1");
//! assert_eq!(key.data_key(), "data:profile.user_1");
//! assert_eq!(key.legacy_key("_"), "profile_user_1");
//!
//! let parsed: StorageKey = "profile.user_1".parse().unwrap();
//! assert_eq!(parsed, key);
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Prefix of the durable mirror of current values.
pub const DATA_PREFIX: &str = "data:";
/// Prefix of persisted pending sync-queue items.
pub const QUEUE_PENDING_PREFIX: &str = "queue:pending:";
/// Prefix of persisted dead-lettered sync-queue items.
pub const QUEUE_DEAD_PREFIX: &str = "queue:dead:";
/// Prefix of the migration ledger.
pub const MIGRATION_PREFIX: &str = "migration:";

const RESERVED_NAMESPACES: [&str; 3] = ["data", "queue", "migration"];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KeyError {
    #[error("namespace must not be empty")]
    EmptyNamespace,
    #[error("field must not be empty")]
    EmptyField,
    #[error("namespace '{0}' contains a reserved character ('.' or ':')")]
    InvalidNamespace(String),
    #[error("namespace '{0}' is reserved")]
    ReservedNamespace(String),
    #[error("field '{0}' contains ':'")]
    InvalidField(String),
    #[error("'{0}' is not of the form namespace.field")]
    Malformed(String),
}

/// A `namespace.field` key shared by all three tiers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct StorageKey {
    namespace: String,
    field: String,
}

impl StorageKey {
    pub fn new(namespace: impl Into<String>, field: impl Into<String>) -> Result<Self, KeyError> {
        let namespace = namespace.into();
        let field = field.into();

        validate_namespace(&namespace)?;
        if field.is_empty() {
            return Err(KeyError::EmptyField);
        }
        if field.contains(':') {
            return Err(KeyError::InvalidField(field));
        }

        Ok(Self { namespace, field })
    }

    #[must_use]
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    #[must_use]
    pub fn field(&self) -> &str {
        &self.field
    }

    /// Key of the durable mirror record in the local store.
    #[must_use]
    pub fn data_key(&self) -> String {
        format!("{DATA_PREFIX}{self}")
    }

    /// Key this value had under the legacy `namespace<sep>field` convention.
    #[must_use]
    pub fn legacy_key(&self, separator: &str) -> String {
        format!("{}{}{}", self.namespace, separator, self.field)
    }

    /// Recover a key from a `data:` mirror record key.
    pub fn from_data_key(raw: &str) -> Option<Self> {
        raw.strip_prefix(DATA_PREFIX)?.parse().ok()
    }
}

/// Check a namespace against the naming rules.
pub fn validate_namespace(namespace: &str) -> Result<(), KeyError> {
    if namespace.is_empty() {
        return Err(KeyError::EmptyNamespace);
    }
    if namespace.contains('.') || namespace.contains(':') {
        return Err(KeyError::InvalidNamespace(namespace.to_string()));
    }
    if RESERVED_NAMESPACES.contains(&namespace) {
        return Err(KeyError::ReservedNamespace(namespace.to_string()));
    }
    Ok(())
}

impl fmt::Display for StorageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.namespace, self.field)
    }
}

impl FromStr for StorageKey {
    type Err = KeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (namespace, field) = s
            .split_once('.')
            .ok_or_else(|| KeyError::Malformed(s.to_string()))?;
        Self::new(namespace, field)
    }
}

impl TryFrom<String> for StorageKey {
    type Error = KeyError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<StorageKey> for String {
    fn from(key: StorageKey) -> Self {
        key.to_string()
    }
}

/// Which logical family a raw local-store key belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordFamily {
    Data,
    QueuePending,
    QueueDead,
    Migration,
    /// Anything without a family prefix (legacy records, foreign keys)
    Other,
}

impl RecordFamily {
    #[must_use]
    pub fn classify(raw: &str) -> Self {
        if raw.starts_with(DATA_PREFIX) {
            Self::Data
        } else if raw.starts_with(QUEUE_PENDING_PREFIX) {
            Self::QueuePending
        } else if raw.starts_with(QUEUE_DEAD_PREFIX) {
            Self::QueueDead
        } else if raw.starts_with(MIGRATION_PREFIX) {
            Self::Migration
        } else {
            Self::Other
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_display_and_parse() {
        let key = StorageKey::new("settings", "theme").unwrap();
        assert_eq!(key.to_string(), "settings.theme");
        assert_eq!("settings.theme".parse::<StorageKey>().unwrap(), key);
    }

    #[test]
    fn test_field_may_contain_dots() {
        let key: StorageKey = "progress.lesson.3".parse().unwrap();
        assert_eq!(key.namespace(), "progress");
        assert_eq!(key.field(), "lesson.3");
    }

    #[test]
    fn test_rejects_bad_keys() {
        assert_eq!(StorageKey::new("", "a"), Err(KeyError::EmptyNamespace));
        assert_eq!(StorageKey::new("a", ""), Err(KeyError::EmptyField));
        assert!(matches!(StorageKey::new("a:b", "c"), Err(KeyError::InvalidNamespace(_))));
        assert!(matches!(StorageKey::new("data", "c"), Err(KeyError::ReservedNamespace(_))));
        assert!(matches!(StorageKey::new("a", "b:c"), Err(KeyError::InvalidField(_))));
        assert!(matches!("nodot".parse::<StorageKey>(), Err(KeyError::Malformed(_))));
    }

    #[test]
    fn test_data_key_roundtrip() {
        let key = StorageKey::new("profile", "user_1").unwrap();
        assert_eq!(StorageKey::from_data_key(&key.data_key()), Some(key));
        assert_eq!(StorageKey::from_data_key("queue:pending:x"), None);
    }

    #[test]
    fn test_serde_as_string() {
        let key = StorageKey::new("profile", "user_1").unwrap();
        let json = serde_json::to_string(&key).unwrap();
        assert_eq!(json, "\"profile.user_1\"");
        let back: StorageKey = serde_json::from_str(&json).unwrap();
        assert_eq!(back, key);
        assert!(serde_json::from_str::<StorageKey>("\"broken\"").is_err());
    }

    #[test]
    fn test_record_family_classification() {
        assert_eq!(RecordFamily::classify("data:a.b"), RecordFamily::Data);
        assert_eq!(RecordFamily::classify("queue:pending:1"), RecordFamily::QueuePending);
        assert_eq!(RecordFamily::classify("queue:dead:1"), RecordFamily::QueueDead);
        assert_eq!(RecordFamily::classify("migration:a_b"), RecordFamily::Migration);
        assert_eq!(RecordFamily::classify("a_b"), RecordFamily::Other);
    }
}
