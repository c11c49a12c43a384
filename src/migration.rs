// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Import of records written under the legacy key convention.
//!
//! Legacy records live in the local store as `namespace<sep>field` with no
//! family prefix. Migrating one copies its value to `data:namespace.field`
//! and writes a ledger record under `migration:<legacy key>`; the ledger is
//! what makes migration at-most-once per legacy key. Legacy records are
//! never deleted.
//!
//! When both a legacy record and a current record exist, the current record
//! wins: nothing is overwritten, the ledger entry is written with
//! `conflict = true` and a warning is logged.
//!
//! Namespaces are checked lazily, the first time a namespace is touched in
//! a session, via [`MigrationEngine::ensure_namespace`].
//!
//! # Ambiguous keys
//!
//! With separator `_`, `user_settings_theme` reads as `user.settings_theme`
//! or `user_settings.theme`. A legacy key with a single valid reading is
//! migrated under it. A key with several readings is claimed by:
//!
//! 1. the longest namespace registered with
//!    [`MigrationEngine::with_namespaces`], otherwise
//! 2. the namespace being touched, only when it is the longest reading.
//!
//! Anything else is left alone and unledgered, so registering its namespace
//! later still migrates it.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::events::{EventBus, HandlerEvent};
use crate::key::{RecordFamily, StorageKey, MIGRATION_PREFIX};
use crate::storage::traits::{StorageAdapter, StorageError};

/// Ledger entry; its presence marks a legacy key as handled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationRecord {
    pub legacy_key: String,
    pub new_key: String,
    pub migrated_at: i64,
    /// Current data already existed; the legacy value was not imported
    #[serde(default)]
    pub conflict: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Migrated {
    pub key: StorageKey,
    /// JSON now stored under the key's data record
    pub payload: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MigrationReport {
    pub migrated: Vec<Migrated>,
    pub conflicts: Vec<StorageKey>,
    /// Legacy records already in the ledger
    pub skipped: usize,
    /// Legacy keys left alone because no namespace could claim them
    pub ambiguous: Vec<String>,
}

impl MigrationReport {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.migrated.is_empty() && self.conflicts.is_empty()
    }

    fn merge(&mut self, other: MigrationReport) {
        self.migrated.extend(other.migrated);
        self.conflicts.extend(other.conflicts);
        self.skipped += other.skipped;
        self.ambiguous.extend(other.ambiguous);
    }
}

/// Who a legacy key belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Claim {
    Key(StorageKey),
    /// Candidate namespaces, shortest first
    Ambiguous(Vec<String>),
}

pub struct MigrationEngine {
    storage: Arc<dyn StorageAdapter>,
    separator: String,
    /// Namespaces known to exist, used to resolve ambiguous legacy keys
    registered: HashSet<String>,
    events: EventBus,
    /// Namespaces already checked this session
    checked: RwLock<HashSet<String>>,
    /// One migration pass at a time
    running: Mutex<()>,
}

/// Legacy values that are not JSON are kept as JSON strings.
fn normalize_legacy_value(raw: &str) -> Result<String, StorageError> {
    if serde_json::from_str::<Value>(raw).is_ok() {
        return Ok(raw.to_string());
    }
    Ok(serde_json::to_string(&Value::String(raw.to_string()))?)
}

impl MigrationEngine {
    pub fn new(storage: Arc<dyn StorageAdapter>, separator: impl Into<String>, events: EventBus) -> Self {
        Self {
            storage,
            separator: separator.into(),
            registered: HashSet::new(),
            events,
            checked: RwLock::new(HashSet::new()),
            running: Mutex::new(()),
        }
    }

    /// Register namespaces that legacy data is known to use.
    #[must_use]
    pub fn with_namespaces<I, S>(mut self, namespaces: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.registered.extend(namespaces.into_iter().map(Into::into));
        self
    }

    #[must_use]
    pub fn is_checked(&self, namespace: &str) -> bool {
        self.checked.read().contains(namespace)
    }

    /// Migrate `namespace` unless it was already checked this session.
    /// Returns `None` when there was nothing to do.
    pub async fn ensure_namespace(&self, namespace: &str) -> Result<Option<MigrationReport>, StorageError> {
        if self.is_checked(namespace) {
            return Ok(None);
        }

        let _running = self.running.lock().await;
        // Another caller may have finished while we waited
        if self.is_checked(namespace) {
            return Ok(None);
        }

        let report = self.migrate_namespace(namespace).await?;
        self.checked.write().insert(namespace.to_string());
        Ok(Some(report))
    }

    /// Every valid `namespace.field` reading of a legacy key.
    fn readings(&self, legacy_key: &str) -> Vec<StorageKey> {
        legacy_key
            .match_indices(self.separator.as_str())
            .filter_map(|(at, sep)| {
                StorageKey::new(&legacy_key[..at], &legacy_key[at + sep.len()..]).ok()
            })
            .collect()
    }

    /// Resolve a legacy key. `touching` is the namespace whose lazy check is
    /// running, if any.
    fn claim(&self, legacy_key: &str, touching: Option<&str>) -> Option<Claim> {
        let mut readings = self.readings(legacy_key);
        if readings.len() <= 1 {
            return readings.pop().map(Claim::Key);
        }
        if let Some(key) = readings
            .iter()
            .rev()
            .find(|k| self.registered.contains(k.namespace()))
        {
            return Some(Claim::Key(key.clone()));
        }
        match readings.last() {
            Some(longest) if touching == Some(longest.namespace()) => Some(Claim::Key(longest.clone())),
            _ => Some(Claim::Ambiguous(
                readings.iter().map(|k| k.namespace().to_string()).collect(),
            )),
        }
    }

    /// Migrate every namespace that owns a legacy record and was not yet
    /// checked this session. Keys that no namespace can claim without a
    /// touch are reported as ambiguous. Idempotent.
    pub async fn migrate_all(&self) -> Result<MigrationReport, StorageError> {
        let mut namespaces: BTreeSet<String> = self.registered.iter().cloned().collect();
        let mut ambiguous = Vec::new();
        for record in self.storage.scan_prefix("").await? {
            if RecordFamily::classify(&record.key) != RecordFamily::Other {
                continue;
            }
            match self.claim(&record.key, None) {
                Some(Claim::Key(key)) => {
                    namespaces.insert(key.namespace().to_string());
                }
                Some(Claim::Ambiguous(_)) => ambiguous.push(record.key),
                None => {}
            }
        }

        let mut report = MigrationReport { ambiguous, ..Default::default() };
        for namespace in namespaces {
            if let Some(ns_report) = self.ensure_namespace(&namespace).await? {
                report.merge(ns_report);
            }
        }
        report.ambiguous.sort();
        report.ambiguous.dedup();

        if !report.is_empty() {
            info!(
                migrated = report.migrated.len(),
                conflicts = report.conflicts.len(),
                ambiguous = report.ambiguous.len(),
                "Legacy migration complete"
            );
        }
        Ok(report)
    }

    async fn migrate_namespace(&self, namespace: &str) -> Result<MigrationReport, StorageError> {
        let prefix = format!("{namespace}{}", self.separator);
        let mut report = MigrationReport::default();

        for record in self.storage.scan_prefix(&prefix).await? {
            if RecordFamily::classify(&record.key) != RecordFamily::Other {
                continue;
            }
            let key = match self.claim(&record.key, Some(namespace)) {
                Some(Claim::Key(key)) if key.namespace() == namespace => key,
                Some(Claim::Key(key)) => {
                    debug!(legacy_key = %record.key, owner = %key.namespace(), "Legacy key belongs to another namespace");
                    continue;
                }
                Some(Claim::Ambiguous(candidates)) => {
                    warn!(
                        legacy_key = %record.key,
                        ?candidates,
                        "Ambiguous legacy key left unmigrated, register its namespace to import it"
                    );
                    crate::metrics::record_migration("ambiguous");
                    report.ambiguous.push(record.key);
                    continue;
                }
                None => {
                    debug!(legacy_key = %record.key, "Not a migratable legacy key");
                    continue;
                }
            };

            let ledger_key = format!("{MIGRATION_PREFIX}{}", record.key);
            if self.storage.get(&ledger_key).await?.is_some() {
                report.skipped += 1;
                continue;
            }

            let conflict = self.storage.get(&key.data_key()).await?.is_some();
            if conflict {
                warn!(
                    legacy_key = %record.key,
                    key = %key,
                    "Legacy and current data both present, keeping current data"
                );
            } else {
                let payload = normalize_legacy_value(&record.value)?;
                self.storage.put(&key.data_key(), &payload).await?;
                report.migrated.push(Migrated { key: key.clone(), payload });
            }

            let ledger = MigrationRecord {
                legacy_key: record.key.clone(),
                new_key: key.to_string(),
                migrated_at: crate::now_millis(),
                conflict,
            };
            self.storage
                .put(&ledger_key, &serde_json::to_string(&ledger)?)
                .await?;

            if conflict {
                crate::metrics::record_migration("conflict");
                report.conflicts.push(key);
            } else {
                crate::metrics::record_migration("migrated");
                debug!(legacy_key = %record.key, key = %key, "Migrated legacy record");
                self.events.emit(HandlerEvent::MigrationCompleted {
                    legacy_key: record.key,
                    new_key: key.to_string(),
                });
            }
        }

        Ok(report)
    }

    /// Every ledger record, oldest first.
    pub async fn ledger(&self) -> Result<Vec<MigrationRecord>, StorageError> {
        let mut records = Vec::new();
        for record in self.storage.scan_prefix(MIGRATION_PREFIX).await? {
            records.push(serde_json::from_str(&record.value)?);
        }
        Ok(records)
    }
}
