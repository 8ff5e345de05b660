//! Record store adapter: typed store traits, the PostgreSQL adapter and an
//! in-memory adapter used by tests and local runs.
//!
//! Every write method commits on its own. Batched inserts commit per batch,
//! so a failure in batch `n` leaves batches `0..n` committed. Callers that
//! need all-or-nothing semantics must not rely on `insert_*` for it.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use nir_core::{
    CacheEntry, FailureProjectionRecord, FeedRecord, IncidentRecord, ManagementRecord,
    MotiveCategoryMap, NodeCounts, SourceTable,
};
use thiserror::Error;

pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::{PgStore, PgStoreConfig};

pub const CRATE_NAME: &str = "nir-storage";

pub const DEFAULT_BATCH_SIZE: usize = 1000;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{operation} failed: {source}")]
    Query {
        operation: &'static str,
        #[source]
        source: sqlx::Error,
    },
    #[error("database connection unavailable: {0}")]
    Unavailable(#[source] sqlx::Error),
    #[error("decoding column {column}: {message}")]
    Decode { column: String, message: String },
    #[error("invalid SQL identifier `{0}`")]
    InvalidIdentifier(String),
    #[error("injected failure in {0}")]
    Injected(&'static str),
}

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchInsert {
    pub inserted: u64,
    pub batches: usize,
}

/// Step 3 update for an incident already present in the consolidated table.
/// `node` follows the feed, so an incident reported under a new node moves there.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedStatusUpdate {
    pub incident_id: String,
    pub node: String,
    pub status: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManualOverride {
    pub incident_id: String,
    pub status: Option<String>,
    pub owner: Option<String>,
    pub closure_date: Option<DateTime<Utc>>,
}

impl From<&ManagementRecord> for ManualOverride {
    fn from(record: &ManagementRecord) -> Self {
        Self {
            incident_id: record.ticket_id.clone(),
            status: record.event_status.clone(),
            owner: record.technician.clone(),
            closure_date: record.event_closure_date,
        }
    }
}

/// Reads and writes against the source, consolidated and projection tables.
///
/// Node arguments are matched against trimmed node values.
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn latest_update_since(&self, since: DateTime<Utc>) -> StoreResult<Option<DateTime<Utc>>>;

    async fn feed_for_node(&self, node: &str) -> StoreResult<Vec<FeedRecord>>;

    /// Feed rows by incident id, whatever node the feed files them under.
    async fn feed_for_incidents(&self, incident_ids: &[String]) -> StoreResult<Vec<FeedRecord>>;

    /// Management rows by ticket id. The management node column is not consulted.
    async fn management_for_tickets(&self, ticket_ids: &[String]) -> StoreResult<Vec<ManagementRecord>>;

    async fn consolidated_for_node(&self, node: &str) -> StoreResult<Vec<IncidentRecord>>;

    async fn consolidated_for_incidents(
        &self,
        incident_ids: &[String],
    ) -> StoreResult<Vec<IncidentRecord>>;

    /// Sets closure date, CLOSED status and `last_updated` on still-open incidents.
    async fn close_incidents(&self, incident_ids: &[String], now: DateTime<Utc>) -> StoreResult<u64>;

    async fn refresh_feed_status(
        &self,
        updates: &[FeedStatusUpdate],
        now: DateTime<Utc>,
    ) -> StoreResult<u64>;

    /// Inserts new consolidated rows; rows whose incident id already exists are skipped.
    async fn insert_incidents(
        &self,
        rows: &[IncidentRecord],
        batch_size: usize,
    ) -> StoreResult<BatchInsert>;

    /// Sets (or clears, with `None`) the closure date only.
    async fn set_closure_dates(
        &self,
        incident_ids: &[String],
        closure_date: Option<DateTime<Utc>>,
    ) -> StoreResult<u64>;

    async fn apply_manual_overrides(
        &self,
        overrides: &[ManualOverride],
        now: DateTime<Utc>,
    ) -> StoreResult<u64>;

    async fn motive_categories(&self) -> StoreResult<MotiveCategoryMap>;

    async fn projection_for_node(&self, node: &str) -> StoreResult<Vec<FailureProjectionRecord>>;

    async fn update_projections(&self, rows: &[FailureProjectionRecord]) -> StoreResult<u64>;

    async fn insert_projections(
        &self,
        rows: &[FailureProjectionRecord],
        batch_size: usize,
    ) -> StoreResult<BatchInsert>;

    /// Consolidated rows with no closure date and a status other than CLOSED/RESOLVED.
    async fn open_incidents(&self, node: &str) -> StoreResult<Vec<IncidentRecord>>;

    async fn node_counts(&self, node: &str) -> StoreResult<NodeCounts>;

    async fn distinct_nodes(&self, source: SourceTable) -> StoreResult<Vec<String>>;

    /// Order-independent aggregate checksum; `None` when there are no rows. Feed and
    /// management rows count when they carry the node or belong to one of its
    /// consolidated incidents.
    async fn source_checksum(&self, source: SourceTable, node: &str) -> StoreResult<Option<i64>>;
}

#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn active_entry(&self, node: &str, source_key: &str) -> StoreResult<Option<CacheEntry>>;

    async fn insert_entry(&self, entry: &CacheEntry) -> StoreResult<()>;

    async fn update_entry(&self, entry: &CacheEntry) -> StoreResult<u64>;

    async fn purge_expired(&self, now: DateTime<Utc>) -> StoreResult<u64>;
}

/// Table names used by the SQL adapter. Values are validated before being
/// interpolated into statements; row values are always bound.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableNames {
    pub schema: String,
    pub feed: String,
    pub management: String,
    pub consolidated: String,
    pub projection: String,
    pub motive_map: String,
    pub cache: String,
}

impl Default for TableNames {
    fn default() -> Self {
        Self {
            schema: "public".to_string(),
            feed: "incident_feed".to_string(),
            management: "ticket_management".to_string(),
            consolidated: "incident_consolidated".to_string(),
            projection: "failure_projection".to_string(),
            motive_map: "motive_categories".to_string(),
            cache: "sync_cache".to_string(),
        }
    }
}

impl TableNames {
    pub fn validate(&self) -> StoreResult<()> {
        for name in [
            &self.schema,
            &self.feed,
            &self.management,
            &self.consolidated,
            &self.projection,
            &self.motive_map,
            &self.cache,
        ] {
            if !is_valid_identifier(name) {
                return Err(StoreError::InvalidIdentifier(name.clone()));
            }
        }
        Ok(())
    }

    pub fn qualified(&self, table: &str) -> String {
        format!("{}.{}", self.schema, table)
    }

    pub fn source(&self, source: SourceTable) -> String {
        match source {
            SourceTable::Management => self.qualified(&self.management),
            SourceTable::Feed => self.qualified(&self.feed),
            SourceTable::Consolidated => self.qualified(&self.consolidated),
        }
    }
}

fn is_valid_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) if first.is_ascii_alphabetic() || first == '_' => {}
        _ => return false,
    }
    name.len() <= 63 && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_table_names_are_valid() {
        let names = TableNames::default();
        assert!(names.validate().is_ok());
        assert_eq!(names.source(SourceTable::Feed), "public.incident_feed");
    }

    #[test]
    fn injected_identifiers_are_rejected() {
        let names = TableNames {
            feed: "incident_feed; DROP TABLE x".to_string(),
            ..TableNames::default()
        };
        assert!(matches!(
            names.validate(),
            Err(StoreError::InvalidIdentifier(name)) if name.starts_with("incident_feed;")
        ));
        assert!(!is_valid_identifier("1table"));
        assert!(!is_valid_identifier(""));
        assert!(is_valid_identifier("_staging2"));
    }
}
