//! Per-node fingerprint cache deciding skip-vs-reprocess.
//!
//! Every failure against the cache store fails open: the node is reprocessed
//! and the error is only logged.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use nir_core::{CacheEntry, CacheState, Clock, SourceTable, DEFAULT_CACHE_TTL_MINS};
use nir_storage::{CacheStore, RecordStore, StoreResult};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

/// Cache key of the combined feed + management fingerprint.
pub const SOURCE_KEY: &str = "feed+management";

/// Hashed in place of the checksums when neither source has rows.
pub const EMPTY_SENTINEL: &str = "empty";

#[derive(Debug, Clone, Copy)]
pub struct CacheSettings {
    pub enabled: bool,
    pub ttl: Duration,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl: Duration::minutes(DEFAULT_CACHE_TTL_MINS),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheReason {
    FirstRun,
    Unchanged,
    Changed,
    CacheUnavailable,
    Disabled,
}

impl CacheReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheReason::FirstRun => "first run",
            CacheReason::Unchanged => "unchanged",
            CacheReason::Changed => "changed",
            CacheReason::CacheUnavailable => "cache unavailable",
            CacheReason::Disabled => "cache disabled",
        }
    }
}

impl fmt::Display for CacheReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CacheDecision {
    pub reprocess: bool,
    pub reason: CacheReason,
}

impl CacheDecision {
    fn reprocess(reason: CacheReason) -> Self {
        Self {
            reprocess: true,
            reason,
        }
    }

    pub fn is_hit(&self) -> bool {
        !self.reprocess
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheTransition {
    Created,
    TtlRefreshed,
    Rotated,
}

pub fn fingerprint_from(feed: Option<i64>, management: Option<i64>) -> String {
    let input = match (feed, management) {
        (None, None) => EMPTY_SENTINEL.to_string(),
        (feed, management) => format!(
            "{}_{}",
            feed.map(|v| v.to_string()).unwrap_or_default(),
            management.map(|v| v.to_string()).unwrap_or_default()
        ),
    };
    hex::encode(Sha256::digest(input.as_bytes()))
}

pub fn plan_commit(
    existing: Option<&CacheEntry>,
    node: &str,
    source_key: &str,
    fingerprint: &str,
    records_processed: i64,
    now: DateTime<Utc>,
    ttl: Duration,
) -> (CacheTransition, CacheEntry) {
    let expires_at = now + ttl;
    match existing {
        None => (
            CacheTransition::Created,
            CacheEntry {
                node: node.to_string(),
                source_key: source_key.to_string(),
                previous_checksum: fingerprint.to_string(),
                current_checksum: fingerprint.to_string(),
                records_processed,
                last_processed_at: now,
                expires_at,
                state: CacheState::Active,
            },
        ),
        Some(entry) if entry.current_checksum == fingerprint => (
            CacheTransition::TtlRefreshed,
            CacheEntry {
                records_processed,
                last_processed_at: now,
                expires_at,
                state: CacheState::Active,
                ..entry.clone()
            },
        ),
        Some(entry) => (
            CacheTransition::Rotated,
            CacheEntry {
                previous_checksum: entry.current_checksum.clone(),
                current_checksum: fingerprint.to_string(),
                records_processed,
                last_processed_at: now,
                expires_at,
                state: CacheState::Active,
                ..entry.clone()
            },
        ),
    }
}

pub struct ChecksumCache {
    records: Arc<dyn RecordStore>,
    entries: Arc<dyn CacheStore>,
    clock: Arc<dyn Clock>,
    settings: CacheSettings,
}

impl ChecksumCache {
    pub fn new(
        records: Arc<dyn RecordStore>,
        entries: Arc<dyn CacheStore>,
        clock: Arc<dyn Clock>,
        settings: CacheSettings,
    ) -> Self {
        Self {
            records,
            entries,
            clock,
            settings,
        }
    }

    pub fn settings(&self) -> CacheSettings {
        self.settings
    }

    pub async fn compute_fingerprint(&self, node: &str) -> StoreResult<String> {
        let feed = self.records.source_checksum(SourceTable::Feed, node).await?;
        let management = self
            .records
            .source_checksum(SourceTable::Management, node)
            .await?;
        Ok(fingerprint_from(feed, management))
    }

    /// Expiry is not consulted here; expired entries only disappear through [`Self::purge_expired`].
    pub async fn needs_reprocessing(
        &self,
        node: &str,
        source_key: &str,
        fingerprint: &str,
    ) -> CacheDecision {
        if !self.settings.enabled {
            return CacheDecision::reprocess(CacheReason::Disabled);
        }
        match self.entries.active_entry(node, source_key).await {
            Ok(None) => CacheDecision::reprocess(CacheReason::FirstRun),
            Ok(Some(entry)) if entry.current_checksum == fingerprint => CacheDecision {
                reprocess: false,
                reason: CacheReason::Unchanged,
            },
            Ok(Some(_)) => CacheDecision::reprocess(CacheReason::Changed),
            Err(err) => {
                warn!(node, source_key, error = %err, "cache lookup failed; reprocessing");
                CacheDecision::reprocess(CacheReason::CacheUnavailable)
            }
        }
    }

    /// Records a successful run. Returns `None` when the cache is disabled or the write failed.
    pub async fn commit(
        &self,
        node: &str,
        source_key: &str,
        fingerprint: &str,
        records_processed: usize,
    ) -> Option<CacheTransition> {
        if !self.settings.enabled {
            return None;
        }
        let existing = match self.entries.active_entry(node, source_key).await {
            Ok(existing) => existing,
            Err(err) => {
                warn!(node, source_key, error = %err, "cache lookup before commit failed");
                return None;
            }
        };
        let (transition, entry) = plan_commit(
            existing.as_ref(),
            node,
            source_key,
            fingerprint,
            i64::try_from(records_processed).unwrap_or(i64::MAX),
            self.clock.now(),
            self.settings.ttl,
        );
        let written = match transition {
            CacheTransition::Created => self.entries.insert_entry(&entry).await,
            CacheTransition::TtlRefreshed | CacheTransition::Rotated => {
                match self.entries.update_entry(&entry).await {
                    // purged between lookup and update
                    Ok(0) => self.entries.insert_entry(&entry).await,
                    Ok(_) => Ok(()),
                    Err(err) => Err(err),
                }
            }
        };
        match written {
            Ok(()) => {
                debug!(node, source_key, ?transition, "cache entry committed");
                Some(transition)
            }
            Err(err) => {
                warn!(node, source_key, error = %err, "cache commit failed");
                None
            }
        }
    }

    pub async fn purge_expired(&self) -> u64 {
        match self.entries.purge_expired(self.clock.now()).await {
            Ok(purged) => {
                debug!(purged, "expired cache entries purged");
                purged
            }
            Err(err) => {
                warn!(error = %err, "cache purge failed");
                0
            }
        }
    }
}
