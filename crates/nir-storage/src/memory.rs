//! In-memory record and cache store with failure injection.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt::Debug;
use std::sync::Mutex as StdMutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use nir_core::{
    normalize_node, CacheEntry, CacheState, FailureProjectionRecord, FeedRecord, IncidentRecord,
    ManagementRecord, MotiveCategory, MotiveCategoryMap, NodeCounts, SourceTable,
};
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;

use crate::{
    BatchInsert, CacheStore, FeedStatusUpdate, ManualOverride, RecordStore, StoreError,
    StoreResult,
};

#[derive(Debug, Default)]
struct Tables {
    feed: Vec<FeedRecord>,
    management: Vec<ManagementRecord>,
    consolidated: BTreeMap<String, IncidentRecord>,
    projection: BTreeMap<(String, String), FailureProjectionRecord>,
    motives: Vec<(String, String)>,
    cache: BTreeMap<(String, String), CacheEntry>,
}

#[derive(Debug, Default)]
struct Faults {
    operations: HashSet<&'static str>,
    batches_before_failure: Option<usize>,
}

/// Store backed by process memory. Operation names passed to [`MemoryStore::fail_on`]
/// are the trait method names (`"feed_for_node"`, `"insert_entry"`, ...).
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
    faults: StdMutex<Faults>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every call of `operation` fail until [`MemoryStore::clear_failures`].
    pub fn fail_on(&self, operation: &'static str) {
        self.faults_mut().operations.insert(operation);
    }

    /// Batched inserts commit `batches` batches and then fail.
    pub fn fail_batches_after(&self, batches: usize) {
        self.faults_mut().batches_before_failure = Some(batches);
    }

    pub fn clear_failures(&self) {
        *self.faults_mut() = Faults::default();
    }

    fn faults_mut(&self) -> std::sync::MutexGuard<'_, Faults> {
        self.faults
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn check(&self, operation: &'static str) -> StoreResult<()> {
        if self.faults_mut().operations.contains(operation) {
            Err(StoreError::Injected(operation))
        } else {
            Ok(())
        }
    }

    fn batch_budget(&self) -> Option<usize> {
        self.faults_mut().batches_before_failure
    }

    pub async fn put_feed(&self, record: FeedRecord) {
        let mut tables = self.tables.lock().await;
        tables.feed.retain(|r| r.incident_id != record.incident_id);
        tables.feed.push(record);
    }

    pub async fn remove_feed(&self, incident_id: &str) {
        self.tables
            .lock()
            .await
            .feed
            .retain(|r| r.incident_id != incident_id);
    }

    pub async fn put_management(&self, record: ManagementRecord) {
        let mut tables = self.tables.lock().await;
        tables.management.retain(|r| r.ticket_id != record.ticket_id);
        tables.management.push(record);
    }

    pub async fn put_consolidated(&self, record: IncidentRecord) {
        self.tables
            .lock()
            .await
            .consolidated
            .insert(record.incident_id.clone(), record);
    }

    pub async fn put_motive(&self, motive: impl Into<String>, category: impl Into<String>) {
        self.tables
            .lock()
            .await
            .motives
            .push((motive.into(), category.into()));
    }

    pub async fn consolidated(&self, incident_id: &str) -> Option<IncidentRecord> {
        self.tables.lock().await.consolidated.get(incident_id).cloned()
    }

    pub async fn consolidated_rows(&self) -> Vec<IncidentRecord> {
        self.tables.lock().await.consolidated.values().cloned().collect()
    }

    pub async fn projection_rows(&self) -> Vec<FailureProjectionRecord> {
        self.tables.lock().await.projection.values().cloned().collect()
    }

    pub async fn cache_entries(&self) -> Vec<CacheEntry> {
        self.tables.lock().await.cache.values().cloned().collect()
    }
}

fn on_node(value: &str, node: &str) -> bool {
    value.trim() == node
}

/// XOR of per-row digests: independent of row order, `None` without rows.
fn xor_checksum<'a, T: Debug + 'a>(rows: impl Iterator<Item = &'a T>) -> Option<i64> {
    rows.fold(None, |acc, row| {
        let digest = Sha256::digest(format!("{row:?}").as_bytes());
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&digest[..8]);
        Some(acc.unwrap_or(0) ^ i64::from_be_bytes(bytes))
    })
}

fn insert_in_batches<K: Ord, V: Clone>(
    table: &mut BTreeMap<K, V>,
    rows: &[V],
    batch_size: usize,
    batch_budget: Option<usize>,
    key: impl Fn(&V) -> K,
    operation: &'static str,
) -> StoreResult<BatchInsert> {
    let mut totals = BatchInsert::default();
    for chunk in rows.chunks(batch_size.max(1)) {
        if batch_budget.is_some_and(|budget| totals.batches >= budget) {
            return Err(StoreError::Injected(operation));
        }
        for row in chunk {
            let k = key(row);
            if !table.contains_key(&k) {
                table.insert(k, row.clone());
                totals.inserted += 1;
            }
        }
        totals.batches += 1;
    }
    Ok(totals)
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn latest_update_since(&self, since: DateTime<Utc>) -> StoreResult<Option<DateTime<Utc>>> {
        self.check("latest_update_since")?;
        let tables = self.tables.lock().await;
        Ok(tables
            .consolidated
            .values()
            .map(|r| r.last_updated)
            .filter(|ts| *ts > since)
            .max())
    }

    async fn feed_for_node(&self, node: &str) -> StoreResult<Vec<FeedRecord>> {
        self.check("feed_for_node")?;
        let tables = self.tables.lock().await;
        let mut rows = tables
            .feed
            .iter()
            .filter(|r| on_node(&r.node, node))
            .cloned()
            .collect::<Vec<_>>();
        rows.sort_by(|a, b| a.incident_id.cmp(&b.incident_id));
        Ok(rows)
    }

    async fn feed_for_incidents(&self, incident_ids: &[String]) -> StoreResult<Vec<FeedRecord>> {
        self.check("feed_for_incidents")?;
        let wanted: HashSet<&str> = incident_ids.iter().map(String::as_str).collect();
        let tables = self.tables.lock().await;
        let mut rows = tables
            .feed
            .iter()
            .filter(|r| wanted.contains(r.incident_id.as_str()))
            .cloned()
            .collect::<Vec<_>>();
        rows.sort_by(|a, b| a.incident_id.cmp(&b.incident_id));
        Ok(rows)
    }

    async fn management_for_tickets(&self, ticket_ids: &[String]) -> StoreResult<Vec<ManagementRecord>> {
        self.check("management_for_tickets")?;
        let wanted: HashSet<&str> = ticket_ids.iter().map(String::as_str).collect();
        let tables = self.tables.lock().await;
        let mut rows = tables
            .management
            .iter()
            .filter(|r| wanted.contains(r.ticket_id.as_str()))
            .cloned()
            .collect::<Vec<_>>();
        rows.sort_by(|a, b| a.ticket_id.cmp(&b.ticket_id));
        Ok(rows)
    }

    async fn consolidated_for_node(&self, node: &str) -> StoreResult<Vec<IncidentRecord>> {
        self.check("consolidated_for_node")?;
        let tables = self.tables.lock().await;
        Ok(tables
            .consolidated
            .values()
            .filter(|r| on_node(&r.node, node))
            .cloned()
            .collect())
    }

    async fn consolidated_for_incidents(
        &self,
        incident_ids: &[String],
    ) -> StoreResult<Vec<IncidentRecord>> {
        self.check("consolidated_for_incidents")?;
        let tables = self.tables.lock().await;
        Ok(incident_ids
            .iter()
            .filter_map(|id| tables.consolidated.get(id))
            .cloned()
            .collect())
    }

    async fn close_incidents(&self, incident_ids: &[String], now: DateTime<Utc>) -> StoreResult<u64> {
        self.check("close_incidents")?;
        let mut tables = self.tables.lock().await;
        let mut affected = 0;
        for id in incident_ids {
            if let Some(row) = tables.consolidated.get_mut(id) {
                if row.closure_date.is_none() {
                    row.closure_date = Some(now);
                    row.status = Some(nir_core::STATUS_CLOSED.to_string());
                    row.last_updated = now;
                    affected += 1;
                }
            }
        }
        Ok(affected)
    }

    async fn refresh_feed_status(
        &self,
        updates: &[FeedStatusUpdate],
        now: DateTime<Utc>,
    ) -> StoreResult<u64> {
        self.check("refresh_feed_status")?;
        let mut tables = self.tables.lock().await;
        let mut affected = 0;
        for update in updates {
            if let Some(row) = tables.consolidated.get_mut(&update.incident_id) {
                row.node = update.node.clone();
                row.status = update.status.clone();
                row.last_updated = now;
                affected += 1;
            }
        }
        Ok(affected)
    }

    async fn insert_incidents(
        &self,
        rows: &[IncidentRecord],
        batch_size: usize,
    ) -> StoreResult<BatchInsert> {
        self.check("insert_incidents")?;
        let budget = self.batch_budget();
        let mut tables = self.tables.lock().await;
        insert_in_batches(
            &mut tables.consolidated,
            rows,
            batch_size,
            budget,
            |r| r.incident_id.clone(),
            "insert_incidents",
        )
    }

    async fn set_closure_dates(
        &self,
        incident_ids: &[String],
        closure_date: Option<DateTime<Utc>>,
    ) -> StoreResult<u64> {
        self.check("set_closure_dates")?;
        let mut tables = self.tables.lock().await;
        let mut affected = 0;
        for id in incident_ids {
            if let Some(row) = tables.consolidated.get_mut(id) {
                row.closure_date = closure_date;
                affected += 1;
            }
        }
        Ok(affected)
    }

    async fn apply_manual_overrides(
        &self,
        overrides: &[ManualOverride],
        now: DateTime<Utc>,
    ) -> StoreResult<u64> {
        self.check("apply_manual_overrides")?;
        let mut tables = self.tables.lock().await;
        let mut affected = 0;
        for o in overrides {
            if let Some(row) = tables.consolidated.get_mut(&o.incident_id) {
                row.managed_manually = true;
                row.status = o.status.clone();
                row.owner = o.owner.clone();
                row.closure_date = o.closure_date;
                row.last_updated = now;
                affected += 1;
            }
        }
        Ok(affected)
    }

    async fn motive_categories(&self) -> StoreResult<MotiveCategoryMap> {
        self.check("motive_categories")?;
        let tables = self.tables.lock().await;
        Ok(tables
            .motives
            .iter()
            .map(|(motive, category)| (motive.clone(), MotiveCategory::parse(category)))
            .collect())
    }

    async fn projection_for_node(&self, node: &str) -> StoreResult<Vec<FailureProjectionRecord>> {
        self.check("projection_for_node")?;
        let tables = self.tables.lock().await;
        Ok(tables
            .projection
            .values()
            .filter(|r| on_node(&r.node, node))
            .cloned()
            .collect())
    }

    async fn update_projections(&self, rows: &[FailureProjectionRecord]) -> StoreResult<u64> {
        self.check("update_projections")?;
        let mut tables = self.tables.lock().await;
        let mut affected = 0;
        for row in rows {
            let key = (row.ticket_id.clone(), row.node.clone());
            if let Some(existing) = tables.projection.get_mut(&key) {
                existing.state = row.state.clone();
                existing.event_end = row.event_end;
                existing.node_finish_date = row.node_finish_date;
                affected += 1;
            }
        }
        Ok(affected)
    }

    async fn insert_projections(
        &self,
        rows: &[FailureProjectionRecord],
        batch_size: usize,
    ) -> StoreResult<BatchInsert> {
        self.check("insert_projections")?;
        let budget = self.batch_budget();
        let mut tables = self.tables.lock().await;
        insert_in_batches(
            &mut tables.projection,
            rows,
            batch_size,
            budget,
            |r| (r.ticket_id.clone(), r.node.clone()),
            "insert_projections",
        )
    }

    async fn open_incidents(&self, node: &str) -> StoreResult<Vec<IncidentRecord>> {
        self.check("open_incidents")?;
        let tables = self.tables.lock().await;
        let mut rows = tables
            .consolidated
            .values()
            .filter(|r| on_node(&r.node, node) && r.is_reportable_open())
            .cloned()
            .collect::<Vec<_>>();
        rows.sort_by(|a, b| {
            (a.reported_date.is_none(), a.reported_date, &a.incident_id).cmp(&(
                b.reported_date.is_none(),
                b.reported_date,
                &b.incident_id,
            ))
        });
        Ok(rows)
    }

    async fn node_counts(&self, node: &str) -> StoreResult<NodeCounts> {
        self.check("node_counts")?;
        let tables = self.tables.lock().await;
        let mut counts = NodeCounts::default();
        for row in tables.consolidated.values().filter(|r| on_node(&r.node, node)) {
            counts.total += 1;
            if row.is_closed() {
                counts.closed += 1;
            } else {
                counts.open += 1;
            }
        }
        Ok(counts)
    }

    async fn distinct_nodes(&self, source: SourceTable) -> StoreResult<Vec<String>> {
        self.check("distinct_nodes")?;
        let tables = self.tables.lock().await;
        let nodes: BTreeSet<String> = match source {
            SourceTable::Management => tables
                .management
                .iter()
                .filter_map(|r| normalize_node(&r.node))
                .collect(),
            SourceTable::Feed => tables
                .feed
                .iter()
                .filter_map(|r| normalize_node(&r.node))
                .collect(),
            SourceTable::Consolidated => tables
                .consolidated
                .values()
                .filter_map(|r| normalize_node(&r.node))
                .collect(),
        };
        Ok(nodes.into_iter().collect())
    }

    async fn source_checksum(&self, source: SourceTable, node: &str) -> StoreResult<Option<i64>> {
        self.check("source_checksum")?;
        let tables = self.tables.lock().await;
        let linked: HashSet<&str> = tables
            .consolidated
            .values()
            .filter(|r| on_node(&r.node, node))
            .map(|r| r.incident_id.as_str())
            .collect();
        Ok(match source {
            SourceTable::Management => xor_checksum(
                tables
                    .management
                    .iter()
                    .filter(|r| on_node(&r.node, node) || linked.contains(r.ticket_id.as_str())),
            ),
            SourceTable::Feed => xor_checksum(
                tables
                    .feed
                    .iter()
                    .filter(|r| on_node(&r.node, node) || linked.contains(r.incident_id.as_str())),
            ),
            SourceTable::Consolidated => xor_checksum(
                tables
                    .consolidated
                    .values()
                    .filter(|r| on_node(&r.node, node)),
            ),
        })
    }
}

#[async_trait]
impl CacheStore for MemoryStore {
    async fn active_entry(&self, node: &str, source_key: &str) -> StoreResult<Option<CacheEntry>> {
        self.check("active_entry")?;
        let tables = self.tables.lock().await;
        Ok(tables
            .cache
            .get(&(node.to_string(), source_key.to_string()))
            .filter(|entry| entry.state == CacheState::Active)
            .cloned())
    }

    async fn insert_entry(&self, entry: &CacheEntry) -> StoreResult<()> {
        self.check("insert_entry")?;
        self.tables.lock().await.cache.insert(
            (entry.node.clone(), entry.source_key.clone()),
            entry.clone(),
        );
        Ok(())
    }

    async fn update_entry(&self, entry: &CacheEntry) -> StoreResult<u64> {
        self.check("update_entry")?;
        let mut tables = self.tables.lock().await;
        match tables
            .cache
            .get_mut(&(entry.node.clone(), entry.source_key.clone()))
        {
            Some(existing) => {
                *existing = entry.clone();
                Ok(1)
            }
            None => Ok(0),
        }
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> StoreResult<u64> {
        self.check("purge_expired")?;
        let mut tables = self.tables.lock().await;
        let before = tables.cache.len();
        tables.cache.retain(|_, entry| !entry.is_expired_at(now));
        Ok((before - tables.cache.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, h, m, 0).single().unwrap()
    }

    fn feed(id: &str, node: &str, status: &str) -> FeedRecord {
        FeedRecord {
            incident_id: id.into(),
            summary: Some("FIBER CUT".into()),
            reported_by: Some("monitor".into()),
            reported_date: Some(ts(8, 0)),
            node: node.into(),
            status: Some(status.into()),
            owner: Some("noc".into()),
            owner_group: Some("field".into()),
        }
    }

    #[tokio::test]
    async fn checksum_is_order_independent_and_change_sensitive() {
        let a = MemoryStore::new();
        a.put_feed(feed("T1", "N1", "OPEN")).await;
        a.put_feed(feed("T2", "N1", "OPEN")).await;

        let b = MemoryStore::new();
        b.put_feed(feed("T2", "N1", "OPEN")).await;
        b.put_feed(feed("T1", "N1", "OPEN")).await;

        let sum_a = a.source_checksum(SourceTable::Feed, "N1").await.unwrap();
        let sum_b = b.source_checksum(SourceTable::Feed, "N1").await.unwrap();
        assert!(sum_a.is_some());
        assert_eq!(sum_a, sum_b);

        b.put_feed(feed("T2", "N1", "CLOSED")).await;
        let changed = b.source_checksum(SourceTable::Feed, "N1").await.unwrap();
        assert_ne!(sum_a, changed);

        assert_eq!(
            a.source_checksum(SourceTable::Management, "N1").await.unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn batched_insert_keeps_committed_batches_on_failure() {
        let store = MemoryStore::new();
        let rows = (0..5)
            .map(|i| IncidentRecord::from_feed(&feed(&format!("T{i}"), "N1", "OPEN"), ts(9, 0)))
            .collect::<Vec<_>>();
        store.fail_batches_after(2);

        let err = store.insert_incidents(&rows, 2).await.unwrap_err();
        assert!(matches!(err, StoreError::Injected("insert_incidents")));
        assert_eq!(store.consolidated_rows().await.len(), 4);

        store.clear_failures();
        let totals = store.insert_incidents(&rows, 2).await.unwrap();
        assert_eq!(totals, BatchInsert { inserted: 1, batches: 3 });
    }

    #[tokio::test]
    async fn distinct_nodes_trim_and_skip_blank() {
        let store = MemoryStore::new();
        store.put_feed(feed("T1", "  N2 ", "OPEN")).await;
        store.put_feed(feed("T2", "N1", "OPEN")).await;
        store.put_feed(feed("T3", "   ", "OPEN")).await;
        store.put_feed(feed("T4", "N1", "OPEN")).await;

        let nodes = store.distinct_nodes(SourceTable::Feed).await.unwrap();
        assert_eq!(nodes, vec!["N1".to_string(), "N2".to_string()]);
        assert!(store
            .distinct_nodes(SourceTable::Management)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn injected_failures_surface_as_store_errors() {
        let store = MemoryStore::new();
        store.fail_on("node_counts");
        assert!(matches!(
            store.node_counts("N1").await,
            Err(StoreError::Injected("node_counts"))
        ));
        store.clear_failures();
        assert_eq!(store.node_counts("N1").await.unwrap(), NodeCounts::default());
    }

    #[tokio::test]
    async fn purge_removes_only_expired_entries() {
        let store = MemoryStore::new();
        for (node, expires_at) in [("N1", ts(9, 0)), ("N2", ts(11, 0))] {
            store
                .insert_entry(&CacheEntry {
                    node: node.into(),
                    source_key: "feed+management".into(),
                    previous_checksum: "x".into(),
                    current_checksum: "x".into(),
                    records_processed: 0,
                    last_processed_at: ts(7, 0),
                    expires_at,
                    state: CacheState::Active,
                })
                .await
                .unwrap();
        }
        assert_eq!(store.purge_expired(ts(10, 0)).await.unwrap(), 1);
        let remaining = store.cache_entries().await;
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].node, "N2");
    }
}
