//! Core domain model and record shapes for the node incident reconciler.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "nir-core";

pub const STATUS_CLOSED: &str = "CLOSED";
pub const STATUS_RESOLVED: &str = "RESOLVED";

pub const DEFAULT_FRESHNESS_WINDOW_MINS: i64 = 10;
pub const DEFAULT_PROJECTION_WINDOW_MINS: i64 = 15;
pub const DEFAULT_CACHE_TTL_MINS: i64 = 120;

/// CLOSED and RESOLVED, compared case-insensitively.
pub fn is_closed_status(status: &str) -> bool {
    let status = status.trim();
    status.eq_ignore_ascii_case(STATUS_CLOSED) || status.eq_ignore_ascii_case(STATUS_RESOLVED)
}

/// Trimmed node identifier, or `None` when nothing is left.
pub fn normalize_node(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// The three authoritative tables a node can appear in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceTable {
    Management,
    Feed,
    Consolidated,
}

impl SourceTable {
    pub const ALL: [SourceTable; 3] = [
        SourceTable::Management,
        SourceTable::Feed,
        SourceTable::Consolidated,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SourceTable::Management => "management",
            SourceTable::Feed => "feed",
            SourceTable::Consolidated => "consolidated",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedRecord {
    pub incident_id: String,
    pub summary: Option<String>,
    pub reported_by: Option<String>,
    pub reported_date: Option<DateTime<Utc>>,
    pub node: String,
    pub status: Option<String>,
    pub owner: Option<String>,
    pub owner_group: Option<String>,
}

impl FeedRecord {
    pub fn reports_closed(&self) -> bool {
        self.status.as_deref().is_some_and(is_closed_status)
    }
}

/// Row of the manually managed ticket table. `ticket_id` shares the incident id domain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManagementRecord {
    pub ticket_id: String,
    pub node: String,
    pub event_status: Option<String>,
    pub technician: Option<String>,
    pub event_closure_date: Option<DateTime<Utc>>,
}

impl ManagementRecord {
    pub fn is_open(&self) -> bool {
        self.event_closure_date.is_none()
    }
}

/// Consolidated incident row. A set `closure_date` means the incident is closed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IncidentRecord {
    pub incident_id: String,
    pub summary: Option<String>,
    pub reported_by: Option<String>,
    pub reported_date: Option<DateTime<Utc>>,
    pub node: String,
    pub status: Option<String>,
    pub owner: Option<String>,
    pub owner_group: Option<String>,
    pub closure_date: Option<DateTime<Utc>>,
    pub managed_manually: bool,
    pub last_updated: DateTime<Utc>,
}

impl IncidentRecord {
    pub fn from_feed(feed: &FeedRecord, now: DateTime<Utc>) -> Self {
        Self {
            incident_id: feed.incident_id.clone(),
            summary: feed.summary.clone(),
            reported_by: feed.reported_by.clone(),
            reported_date: feed.reported_date,
            node: feed.node.clone(),
            status: feed.status.clone(),
            owner: feed.owner.clone(),
            owner_group: feed.owner_group.clone(),
            closure_date: None,
            managed_manually: false,
            last_updated: now,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closure_date.is_some()
    }

    /// Open for reporting purposes: no closure date and a status that is not CLOSED/RESOLVED.
    /// A missing status counts as open.
    pub fn is_reportable_open(&self) -> bool {
        !self.is_closed() && !self.status.as_deref().is_some_and(is_closed_status)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureProjectionRecord {
    pub ticket_id: String,
    pub node: String,
    pub opening_motive: Option<String>,
    pub direction: String,
    pub state: Option<String>,
    pub event_start: Option<DateTime<Utc>>,
    pub event_end: Option<DateTime<Utc>>,
    pub node_finish_date: Option<DateTime<Utc>>,
    pub created_date: Option<DateTime<Utc>>,
    pub created_by: Option<String>,
    pub affected_customers: i64,
}

impl FailureProjectionRecord {
    pub fn from_incident(incident: &IncidentRecord) -> Self {
        Self {
            ticket_id: incident.incident_id.clone(),
            node: incident.node.clone(),
            opening_motive: incident.summary.clone(),
            direction: String::new(),
            state: incident.status.clone(),
            event_start: incident.reported_date,
            event_end: incident.closure_date,
            node_finish_date: incident.closure_date,
            created_date: incident.reported_date,
            created_by: incident.owner.clone(),
            affected_customers: 0,
        }
    }

    pub fn key(&self) -> (&str, &str) {
        (&self.ticket_id, &self.node)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MotiveCategory {
    Failure,
    Maintenance,
    MaintenanceWithImpact,
    PreventiveMaintenance,
    Other(String),
}

impl MotiveCategory {
    pub fn parse(raw: &str) -> Self {
        let normalized = raw.trim().to_ascii_uppercase();
        match normalized.as_str() {
            "FAILURE" => MotiveCategory::Failure,
            "MAINTENANCE" => MotiveCategory::Maintenance,
            "MAINTENANCE WITH IMPACT" => MotiveCategory::MaintenanceWithImpact,
            "PREVENTIVE MAINTENANCE" => MotiveCategory::PreventiveMaintenance,
            _ => MotiveCategory::Other(normalized),
        }
    }

    /// Failure and maintenance categories feed the failure projection.
    pub fn is_projected(&self) -> bool {
        !matches!(self, MotiveCategory::Other(_))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MotiveCategoryMap {
    entries: HashMap<String, MotiveCategory>,
}

impl MotiveCategoryMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, motive: impl Into<String>, category: MotiveCategory) {
        self.entries.insert(motive.into(), category);
    }

    pub fn category_for(&self, motive: &str) -> Option<&MotiveCategory> {
        self.entries.get(motive)
    }

    pub fn is_projected(&self, motive: &str) -> bool {
        self.category_for(motive)
            .is_some_and(MotiveCategory::is_projected)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl FromIterator<(String, MotiveCategory)> for MotiveCategoryMap {
    fn from_iter<I: IntoIterator<Item = (String, MotiveCategory)>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CacheState {
    Active,
    Expired,
}

impl CacheState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheState::Active => "ACTIVE",
            CacheState::Expired => "EXPIRED",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_uppercase().as_str() {
            "ACTIVE" => Some(CacheState::Active),
            "EXPIRED" => Some(CacheState::Expired),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub node: String,
    pub source_key: String,
    pub previous_checksum: String,
    pub current_checksum: String,
    pub records_processed: i64,
    pub last_processed_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub state: CacheState,
}

impl CacheEntry {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at < now
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TicketRecord {
    pub node: String,
    pub ticket: String,
    #[serde(rename = "type")]
    pub ticket_type: Option<String>,
    pub state: Option<String>,
    pub date: Option<DateTime<Utc>>,
    pub owner: Option<String>,
}

impl From<&IncidentRecord> for TicketRecord {
    fn from(incident: &IncidentRecord) -> Self {
        Self {
            node: incident.node.clone(),
            ticket: incident.incident_id.clone(),
            ticket_type: incident.summary.clone(),
            state: incident.status.clone(),
            date: incident.reported_date,
            owner: incident.owner.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeCounts {
    pub total: i64,
    pub open: i64,
    pub closed: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeStatusReport {
    pub success: bool,
    pub node: String,
    pub total: i64,
    pub open: i64,
    pub closed: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl NodeStatusReport {
    pub fn found(node: impl Into<String>, counts: NodeCounts) -> Self {
        Self {
            success: true,
            node: node.into(),
            total: counts.total,
            open: counts.open,
            closed: counts.closed,
            error: None,
        }
    }

    pub fn not_found(node: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            success: false,
            node: node.into(),
            total: 0,
            open: 0,
            closed: 0,
            error: Some(error.into()),
        }
    }
}

/// Node distribution across management (A), feed (B) and consolidated (C).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DistributionReport {
    pub management: Vec<String>,
    pub feed: Vec<String>,
    pub consolidated: Vec<String>,
    pub all_nodes: Vec<String>,
    pub only_in_management: Vec<String>,
    pub only_in_feed: Vec<String>,
    pub only_in_consolidated: Vec<String>,
    pub in_management_and_feed_not_consolidated: Vec<String>,
    pub in_all: Vec<String>,
    pub total_unique: usize,
}

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

#[derive(Debug)]
pub struct FixedClock {
    now: Mutex<DateTime<Utc>>,
}

impl FixedClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }

    pub fn set(&self, now: DateTime<Utc>) {
        let mut guard = self.now.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        *guard = now;
    }

    pub fn advance(&self, by: Duration) {
        let mut guard = self.now.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        *guard += by;
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, h, m, 0).single().unwrap()
    }

    #[test]
    fn closed_status_is_case_insensitive() {
        assert!(is_closed_status("closed"));
        assert!(is_closed_status(" Resolved "));
        assert!(!is_closed_status("IN PROGRESS"));
        assert!(!is_closed_status(""));
    }

    #[test]
    fn normalize_node_trims_and_drops_blank() {
        assert_eq!(normalize_node("  N1 "), Some("N1".to_string()));
        assert_eq!(normalize_node("   "), None);
    }

    #[test]
    fn reportable_open_treats_missing_status_as_open() {
        let feed = FeedRecord {
            incident_id: "T1".into(),
            summary: Some("FIBER CUT".into()),
            reported_by: None,
            reported_date: Some(ts(8, 0)),
            node: "N1".into(),
            status: None,
            owner: Some("ops".into()),
            owner_group: None,
        };
        let mut incident = IncidentRecord::from_feed(&feed, ts(9, 0));
        assert!(incident.is_reportable_open());
        assert!(!incident.managed_manually);

        incident.status = Some("resolved".into());
        assert!(!incident.is_reportable_open());

        incident.status = Some("OPEN".into());
        incident.closure_date = Some(ts(9, 5));
        assert!(!incident.is_reportable_open());
    }

    #[test]
    fn motive_map_only_projects_failure_and_maintenance() {
        let map: MotiveCategoryMap = [
            ("FIBER CUT".to_string(), MotiveCategory::parse("failure")),
            ("UPGRADE".to_string(), MotiveCategory::parse("Preventive Maintenance")),
            ("BILLING".to_string(), MotiveCategory::parse("ADMINISTRATIVE")),
        ]
        .into_iter()
        .collect();

        assert!(map.is_projected("FIBER CUT"));
        assert!(map.is_projected("UPGRADE"));
        assert!(!map.is_projected("BILLING"));
        assert!(!map.is_projected("UNKNOWN"));
        assert_eq!(
            map.category_for("BILLING"),
            Some(&MotiveCategory::Other("ADMINISTRATIVE".into()))
        );
    }

    #[test]
    fn fixed_clock_advances() {
        let clock = FixedClock::new(ts(10, 0));
        clock.advance(Duration::minutes(15));
        assert_eq!(clock.now(), ts(10, 15));
        clock.set(ts(7, 30));
        assert_eq!(clock.now(), ts(7, 30));
    }

    #[test]
    fn ticket_record_serializes_type_field() {
        let record = TicketRecord {
            node: "N1".into(),
            ticket: "T1".into(),
            ticket_type: Some("FIBER CUT".into()),
            state: Some("OPEN".into()),
            date: None,
            owner: None,
        };
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["type"], "FIBER CUT");
    }
}
