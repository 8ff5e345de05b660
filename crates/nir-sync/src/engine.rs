//! Six-step reconciliation pipeline for a single node.
//!
//! Steps run strictly in order and commit independently. A failing step is
//! logged and recorded in the step report; the next step still runs. Only the
//! final read decides `success`.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use nir_core::{
    Clock, FailureProjectionRecord, IncidentRecord, TicketRecord, DEFAULT_FRESHNESS_WINDOW_MINS,
    DEFAULT_PROJECTION_WINDOW_MINS,
};
use nir_storage::{
    FeedStatusUpdate, ManualOverride, RecordStore, StoreResult, DEFAULT_BATCH_SIZE,
};
use serde::Serialize;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy)]
pub struct PipelineSettings {
    pub freshness_window: Duration,
    pub projection_window: Duration,
    pub batch_size: usize,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            freshness_window: Duration::minutes(DEFAULT_FRESHNESS_WINDOW_MINS),
            projection_window: Duration::minutes(DEFAULT_PROJECTION_WINDOW_MINS),
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStep {
    FreshnessProbe,
    ClosureDetection,
    FeedMerge,
    StatusCloseReopen,
    ManualOverride,
    ProjectionRefresh,
    FinalRead,
}

impl PipelineStep {
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineStep::FreshnessProbe => "freshness_probe",
            PipelineStep::ClosureDetection => "closure_detection",
            PipelineStep::FeedMerge => "feed_merge",
            PipelineStep::StatusCloseReopen => "status_close_reopen",
            PipelineStep::ManualOverride => "manual_override",
            PipelineStep::ProjectionRefresh => "projection_refresh",
            PipelineStep::FinalRead => "final_read",
        }
    }
}

impl fmt::Display for PipelineStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StepOutcome {
    Ok { rows_affected: u64 },
    Failed { error: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StepReport {
    pub step: PipelineStep,
    #[serde(flatten)]
    pub outcome: StepOutcome,
}

impl StepReport {
    fn record(node: &str, step: PipelineStep, result: StoreResult<u64>) -> Self {
        let outcome = match result {
            Ok(rows_affected) => {
                info!(node, step = step.as_str(), rows_affected, "step completed");
                StepOutcome::Ok { rows_affected }
            }
            Err(err) => {
                warn!(node, step = step.as_str(), error = %err, "step failed; continuing");
                StepOutcome::Failed {
                    error: err.to_string(),
                }
            }
        };
        Self { step, outcome }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self.outcome, StepOutcome::Ok { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EngineRun {
    pub node: String,
    pub steps: Vec<StepReport>,
    pub records: Vec<TicketRecord>,
    pub error: Option<String>,
}

impl EngineRun {
    pub fn success(&self) -> bool {
        self.error.is_none()
    }

    pub fn failed_steps(&self) -> impl Iterator<Item = &StepReport> {
        self.steps.iter().filter(|s| !s.is_ok())
    }
}

pub struct ReconciliationEngine {
    store: Arc<dyn RecordStore>,
    clock: Arc<dyn Clock>,
    settings: PipelineSettings,
}

impl ReconciliationEngine {
    pub fn new(store: Arc<dyn RecordStore>, clock: Arc<dyn Clock>, settings: PipelineSettings) -> Self {
        Self {
            store,
            clock,
            settings,
        }
    }

    pub fn settings(&self) -> PipelineSettings {
        self.settings
    }

    pub async fn run(&self, node: &str) -> EngineRun {
        let now = self.clock.now();
        let mut steps = Vec::with_capacity(7);

        steps.push(StepReport::record(
            node,
            PipelineStep::FreshnessProbe,
            self.freshness_probe(node, now).await,
        ));
        steps.push(StepReport::record(
            node,
            PipelineStep::ClosureDetection,
            self.close_missing(node, now).await,
        ));
        steps.push(StepReport::record(
            node,
            PipelineStep::FeedMerge,
            self.merge_feed(node, now).await,
        ));
        steps.push(StepReport::record(
            node,
            PipelineStep::StatusCloseReopen,
            self.apply_feed_status(node, now).await,
        ));
        steps.push(StepReport::record(
            node,
            PipelineStep::ManualOverride,
            self.apply_management(node, now).await,
        ));
        steps.push(StepReport::record(
            node,
            PipelineStep::ProjectionRefresh,
            self.refresh_projection(node, now).await,
        ));

        match self.store.open_incidents(node).await {
            Ok(rows) => {
                let records = rows.iter().map(TicketRecord::from).collect::<Vec<_>>();
                steps.push(StepReport {
                    step: PipelineStep::FinalRead,
                    outcome: StepOutcome::Ok {
                        rows_affected: records.len() as u64,
                    },
                });
                EngineRun {
                    node: node.to_string(),
                    steps,
                    records,
                    error: None,
                }
            }
            Err(err) => {
                error!(node, error = %err, "reading open incidents failed");
                let message = err.to_string();
                steps.push(StepReport {
                    step: PipelineStep::FinalRead,
                    outcome: StepOutcome::Failed {
                        error: message.clone(),
                    },
                });
                EngineRun {
                    node: node.to_string(),
                    steps,
                    records: Vec::new(),
                    error: Some(message),
                }
            }
        }
    }

    /// Step 1. Advisory: reports 1 when a recent update exists, 0 otherwise.
    async fn freshness_probe(&self, node: &str, now: DateTime<Utc>) -> StoreResult<u64> {
        let since = now - self.settings.freshness_window;
        match self.store.latest_update_since(since).await? {
            Some(latest) => {
                info!(node, %latest, "consolidated table has recent updates");
                Ok(1)
            }
            None => {
                info!(node, %since, "no consolidated updates inside freshness window");
                Ok(0)
            }
        }
    }

    /// Step 2. Closes open incidents the feed no longer reports and management does not hold open.
    /// Both sources are matched by incident id, not by the node they file the row under.
    async fn close_missing(&self, node: &str, now: DateTime<Utc>) -> StoreResult<u64> {
        let open = self
            .store
            .consolidated_for_node(node)
            .await?
            .into_iter()
            .filter(|r| !r.is_closed())
            .map(|r| r.incident_id)
            .collect::<Vec<_>>();
        if open.is_empty() {
            return Ok(0);
        }
        let feed = self.store.feed_for_incidents(&open).await?;
        let management = self.store.management_for_tickets(&open).await?;

        let in_feed: HashSet<&str> = feed.iter().map(|r| r.incident_id.as_str()).collect();
        let held_open: HashSet<&str> = management
            .iter()
            .filter(|r| r.is_open())
            .map(|r| r.ticket_id.as_str())
            .collect();

        let to_close = open
            .iter()
            .filter(|id| !in_feed.contains(id.as_str()))
            .filter(|id| !held_open.contains(id.as_str()))
            .cloned()
            .collect::<Vec<_>>();
        if to_close.is_empty() {
            return Ok(0);
        }
        self.store.close_incidents(&to_close, now).await
    }

    /// Step 3. Status refresh for incidents already consolidated under any node,
    /// full insert for new ones.
    async fn merge_feed(&self, node: &str, now: DateTime<Utc>) -> StoreResult<u64> {
        let feed = self.store.feed_for_node(node).await?;
        if feed.is_empty() {
            return Ok(0);
        }
        let ids = feed.iter().map(|r| r.incident_id.clone()).collect::<Vec<_>>();
        let known: HashSet<String> = self
            .store
            .consolidated_for_incidents(&ids)
            .await?
            .into_iter()
            .map(|r| r.incident_id)
            .collect();

        let mut updates = Vec::new();
        let mut fresh = Vec::new();
        let mut seen = HashSet::new();
        for record in &feed {
            if !seen.insert(record.incident_id.as_str()) {
                continue;
            }
            if known.contains(&record.incident_id) {
                updates.push(FeedStatusUpdate {
                    incident_id: record.incident_id.clone(),
                    node: record.node.clone(),
                    status: record.status.clone(),
                });
            } else {
                fresh.push(IncidentRecord::from_feed(record, now));
            }
        }

        let mut affected = 0;
        if !updates.is_empty() {
            affected += self.store.refresh_feed_status(&updates, now).await?;
        }
        if !fresh.is_empty() {
            let totals = self
                .store
                .insert_incidents(&fresh, self.settings.batch_size)
                .await?;
            affected += totals.inserted;
        }
        Ok(affected)
    }

    /// Step 4. Closes open rows the feed marks CLOSED/RESOLVED and reopens
    /// closed rows whose feed status is anything else, a missing status included.
    async fn apply_feed_status(&self, node: &str, now: DateTime<Utc>) -> StoreResult<u64> {
        let consolidated = self.store.consolidated_for_node(node).await?;
        if consolidated.is_empty() {
            return Ok(0);
        }
        let ids = consolidated
            .iter()
            .map(|r| r.incident_id.clone())
            .collect::<Vec<_>>();
        let feed = self.store.feed_for_incidents(&ids).await?;

        let mut feed_closed: HashMap<&str, bool> = HashMap::new();
        for record in &feed {
            feed_closed
                .entry(record.incident_id.as_str())
                .or_insert_with(|| record.reports_closed());
        }

        let mut to_close = Vec::new();
        let mut to_reopen = Vec::new();
        for row in &consolidated {
            match (row.is_closed(), feed_closed.get(row.incident_id.as_str())) {
                (false, Some(true)) => to_close.push(row.incident_id.clone()),
                (true, Some(false)) => to_reopen.push(row.incident_id.clone()),
                _ => {}
            }
        }

        let mut affected = 0;
        if !to_close.is_empty() {
            affected += self.store.set_closure_dates(&to_close, Some(now)).await?;
        }
        if !to_reopen.is_empty() {
            affected += self.store.set_closure_dates(&to_reopen, None).await?;
        }
        Ok(affected)
    }

    /// Step 5. Management rows overwrite status, owner and closure unconditionally.
    async fn apply_management(&self, node: &str, now: DateTime<Utc>) -> StoreResult<u64> {
        let ids = self
            .store
            .consolidated_for_node(node)
            .await?
            .into_iter()
            .map(|r| r.incident_id)
            .collect::<Vec<_>>();
        if ids.is_empty() {
            return Ok(0);
        }

        let management = self.store.management_for_tickets(&ids).await?;
        let overrides = management
            .iter()
            .map(ManualOverride::from)
            .collect::<Vec<_>>();
        if overrides.is_empty() {
            return Ok(0);
        }
        self.store.apply_manual_overrides(&overrides, now).await
    }

    /// Step 6. Upserts projection rows for recently updated failure/maintenance incidents.
    async fn refresh_projection(&self, node: &str, now: DateTime<Utc>) -> StoreResult<u64> {
        let categories = self.store.motive_categories().await?;
        let since = now - self.settings.projection_window;
        let candidates = self
            .store
            .consolidated_for_node(node)
            .await?
            .into_iter()
            .filter(|r| r.last_updated >= since)
            .filter(|r| {
                r.summary
                    .as_deref()
                    .is_some_and(|motive| categories.is_projected(motive))
            })
            .map(|r| FailureProjectionRecord::from_incident(&r))
            .collect::<Vec<_>>();
        if candidates.is_empty() {
            return Ok(0);
        }

        let existing = self.store.projection_for_node(node).await?;
        let existing_keys: HashSet<(&str, &str)> = existing.iter().map(|r| r.key()).collect();
        let (updates, inserts): (Vec<_>, Vec<_>) = candidates
            .into_iter()
            .partition(|r| existing_keys.contains(&r.key()));

        let mut affected = 0;
        if !updates.is_empty() {
            affected += self.store.update_projections(&updates).await?;
        }
        if !inserts.is_empty() {
            affected += self
                .store
                .insert_projections(&inserts, self.settings.batch_size)
                .await?
                .inserted;
        }
        Ok(affected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{feed, incident, management, ts, ManagementExt};
    use nir_core::{FixedClock, STATUS_CLOSED};
    use nir_storage::MemoryStore;

    fn engine_over(store: &Arc<MemoryStore>, clock: &Arc<FixedClock>) -> ReconciliationEngine {
        ReconciliationEngine::new(store.clone(), clock.clone(), PipelineSettings::default())
    }

    fn tickets(run: &EngineRun) -> Vec<&str> {
        run.records.iter().map(|r| r.ticket.as_str()).collect()
    }

    #[tokio::test]
    async fn empty_node_succeeds_with_no_records() {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(FixedClock::new(ts(10, 0)));
        let run = engine_over(&store, &clock).run("N1").await;

        assert!(run.success());
        assert!(run.records.is_empty());
        assert_eq!(run.steps.len(), 7);
        assert!(run.steps.iter().all(StepReport::is_ok));
    }

    #[tokio::test]
    async fn missing_feed_row_closes_incident() {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(FixedClock::new(ts(10, 0)));
        store.put_consolidated(incident("T1", "N1", Some("OPEN"), ts(8, 0))).await;

        let run = engine_over(&store, &clock).run("N1").await;

        let t1 = store.consolidated("T1").await.unwrap();
        assert_eq!(t1.closure_date, Some(ts(10, 0)));
        assert_eq!(t1.status.as_deref(), Some(STATUS_CLOSED));
        assert_eq!(t1.last_updated, ts(10, 0));
        assert!(run.success());
        assert!(tickets(&run).is_empty());
    }

    #[tokio::test]
    async fn open_management_ticket_blocks_closure() {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(FixedClock::new(ts(10, 0)));
        store.put_consolidated(incident("T1", "N1", Some("OPEN"), ts(8, 0))).await;
        store
            .put_management(management("T1", "N1", None).with_status("IN PROGRESS"))
            .await;

        let run = engine_over(&store, &clock).run("N1").await;

        let t1 = store.consolidated("T1").await.unwrap();
        assert_eq!(t1.closure_date, None);
        assert!(t1.managed_manually);
        assert_eq!(tickets(&run), vec!["T1"]);
    }

    #[tokio::test]
    async fn feed_merge_inserts_new_and_refreshes_known() {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(FixedClock::new(ts(10, 0)));
        store.put_consolidated(incident("T1", "N1", Some("OPEN"), ts(8, 0))).await;
        store.put_feed(feed("T1", "N1", Some("IN PROGRESS"))).await;
        store.put_feed(feed("T2", "N1", Some("OPEN"))).await;

        let run = engine_over(&store, &clock).run("N1").await;

        let t1 = store.consolidated("T1").await.unwrap();
        assert_eq!(t1.status.as_deref(), Some("IN PROGRESS"));
        assert_eq!(t1.last_updated, ts(10, 0));
        let t2 = store.consolidated("T2").await.unwrap();
        assert!(!t2.managed_manually);
        assert_eq!(t2.owner_group.as_deref(), Some("field"));
        assert_eq!(tickets(&run), vec!["T1", "T2"]);
        assert_eq!(
            run.steps[2].outcome,
            StepOutcome::Ok { rows_affected: 2 }
        );
    }

    #[tokio::test]
    async fn feed_status_closes_and_reopens() {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(FixedClock::new(ts(10, 0)));
        store.put_consolidated(incident("T1", "N1", Some("OPEN"), ts(8, 0))).await;
        let mut closed = incident("T2", "N1", Some(STATUS_CLOSED), ts(8, 0));
        closed.closure_date = Some(ts(9, 0));
        store.put_consolidated(closed).await;
        store.put_feed(feed("T1", "N1", Some("resolved"))).await;
        store.put_feed(feed("T2", "N1", Some("REOPENED"))).await;

        let run = engine_over(&store, &clock).run("N1").await;

        assert_eq!(store.consolidated("T1").await.unwrap().closure_date, Some(ts(10, 0)));
        assert_eq!(store.consolidated("T2").await.unwrap().closure_date, None);
        assert_eq!(tickets(&run), vec!["T2"]);
    }

    #[tokio::test]
    async fn missing_feed_status_reopens_closed_row() {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(FixedClock::new(ts(10, 0)));
        let mut closed = incident("T1", "N1", Some(STATUS_CLOSED), ts(8, 0));
        closed.closure_date = Some(ts(9, 0));
        store.put_consolidated(closed).await;
        store.put_feed(feed("T1", "N1", None)).await;

        let run = engine_over(&store, &clock).run("N1").await;

        let t1 = store.consolidated("T1").await.unwrap();
        assert_eq!(t1.closure_date, None);
        assert_eq!(t1.status, None);
        assert_eq!(tickets(&run), vec!["T1"]);
    }

    #[tokio::test]
    async fn manual_ticket_reopens_feed_closed_incident() {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(FixedClock::new(ts(10, 0)));
        store.put_consolidated(incident("T2", "N1", Some("OPEN"), ts(8, 0))).await;
        store.put_feed(feed("T2", "N1", Some(STATUS_CLOSED))).await;
        store
            .put_management(management("T2", "N1", None).with_status("IN PROGRESS"))
            .await;

        let run = engine_over(&store, &clock).run("N1").await;

        let t2 = store.consolidated("T2").await.unwrap();
        assert!(t2.managed_manually);
        assert_eq!(t2.closure_date, None);
        assert_eq!(t2.status.as_deref(), Some("IN PROGRESS"));
        assert_eq!(t2.owner.as_deref(), Some("tech-1"));
        assert_eq!(tickets(&run), vec!["T2"]);
    }

    #[tokio::test]
    async fn management_ticket_matches_by_id_not_node() {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(FixedClock::new(ts(10, 0)));
        store.put_consolidated(incident("T1", "N1", Some("OPEN"), ts(8, 0))).await;
        store
            .put_management(management("T1", "", None).with_status("IN PROGRESS"))
            .await;

        let run = engine_over(&store, &clock).run("N1").await;

        let t1 = store.consolidated("T1").await.unwrap();
        assert_eq!(t1.closure_date, None);
        assert!(t1.managed_manually);
        assert_eq!(t1.status.as_deref(), Some("IN PROGRESS"));
        assert_eq!(tickets(&run), vec!["T1"]);
    }

    #[tokio::test]
    async fn incident_reported_under_new_node_moves_instead_of_closing() {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(FixedClock::new(ts(10, 0)));
        store.put_consolidated(incident("T1", "N1", Some("OPEN"), ts(8, 0))).await;
        store.put_feed(feed("T1", "N2", Some("IN PROGRESS"))).await;
        let engine = engine_over(&store, &clock);

        // still in the feed, so the old node keeps it open
        let old_first = engine.run("N1").await;
        assert_eq!(tickets(&old_first), vec!["T1"]);
        assert_eq!(store.consolidated("T1").await.unwrap().closure_date, None);

        let moved = engine.run("N2").await;
        assert_eq!(moved.steps[2].outcome, StepOutcome::Ok { rows_affected: 1 });
        assert_eq!(tickets(&moved), vec!["T1"]);
        let t1 = store.consolidated("T1").await.unwrap();
        assert_eq!(t1.node, "N2");
        assert_eq!(t1.status.as_deref(), Some("IN PROGRESS"));

        let old_after = engine.run("N1").await;
        assert!(tickets(&old_after).is_empty());
        assert_eq!(store.consolidated("T1").await.unwrap().closure_date, None);
    }

    #[tokio::test]
    async fn manual_closure_wins_over_open_feed() {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(FixedClock::new(ts(10, 0)));
        store.put_feed(feed("T3", "N1", Some("OPEN"))).await;
        store
            .put_management(management("T3", "N1", Some(ts(9, 30))).with_status(STATUS_CLOSED))
            .await;

        let run = engine_over(&store, &clock).run("N1").await;

        let t3 = store.consolidated("T3").await.unwrap();
        assert_eq!(t3.closure_date, Some(ts(9, 30)));
        assert!(tickets(&run).is_empty());
    }

    #[tokio::test]
    async fn second_run_returns_same_records() {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(FixedClock::new(ts(10, 0)));
        store.put_consolidated(incident("T0", "N1", Some("OPEN"), ts(7, 0))).await;
        store.put_feed(feed("T1", "N1", Some("OPEN"))).await;
        store.put_feed(feed("T2", "N1", Some("CLOSED"))).await;
        store.put_management(management("T0", "N1", None)).await;
        let engine = engine_over(&store, &clock);

        let first = engine.run("N1").await;
        let rows_after_first = store.consolidated_rows().await;
        clock.advance(Duration::minutes(1));
        let second = engine.run("N1").await;

        assert_eq!(first.records, second.records);
        assert_eq!(
            store
                .consolidated_rows()
                .await
                .iter()
                .map(|r| (&r.incident_id, r.closure_date))
                .collect::<Vec<_>>(),
            rows_after_first
                .iter()
                .map(|r| (&r.incident_id, r.closure_date))
                .collect::<Vec<_>>()
        );
    }

    #[tokio::test]
    async fn failing_step_does_not_stop_later_steps() {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(FixedClock::new(ts(10, 0)));
        store.put_consolidated(incident("T1", "N1", Some("OPEN"), ts(8, 0))).await;
        store.put_feed(feed("T2", "N1", Some("OPEN"))).await;
        store.fail_on("close_incidents");
        store.fail_on("latest_update_since");

        let run = engine_over(&store, &clock).run("N1").await;

        assert!(run.success());
        let failed = run.failed_steps().map(|s| s.step).collect::<Vec<_>>();
        assert_eq!(
            failed,
            vec![PipelineStep::FreshnessProbe, PipelineStep::ClosureDetection]
        );
        assert!(store.consolidated("T2").await.is_some());
        assert_eq!(tickets(&run), vec!["T1", "T2"]);
    }

    #[tokio::test]
    async fn final_read_failure_flips_success() {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(FixedClock::new(ts(10, 0)));
        store.put_feed(feed("T1", "N1", Some("OPEN"))).await;
        store.fail_on("open_incidents");

        let run = engine_over(&store, &clock).run("N1").await;

        assert!(!run.success());
        assert!(run.records.is_empty());
        assert!(run.error.as_deref().is_some_and(|e| e.contains("open_incidents")));
        assert_eq!(run.steps.last().map(|s| s.step), Some(PipelineStep::FinalRead));
        assert!(store.consolidated("T1").await.is_some());
    }

    #[tokio::test]
    async fn projection_covers_recent_failure_incidents_only() {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(FixedClock::new(ts(10, 0)));
        store.put_motive("FIBER CUT", "FAILURE").await;
        store.put_motive("BILLING", "ADMINISTRATIVE").await;

        let mut billing = incident("T2", "N1", Some("OPEN"), ts(9, 55));
        billing.summary = Some("BILLING".into());
        store.put_consolidated(billing).await;
        // untouched by every step, so it stays outside the window
        let mut stale = incident("T3", "N1", Some(STATUS_CLOSED), ts(9, 0));
        stale.closure_date = Some(ts(9, 0));
        store.put_consolidated(stale).await;
        store.put_feed(feed("T1", "N1", Some("OPEN"))).await;
        let mut billing_feed = feed("T2", "N1", Some("OPEN"));
        billing_feed.summary = Some("BILLING".into());
        store.put_feed(billing_feed).await;

        engine_over(&store, &clock).run("N1").await;

        let projected = store.projection_rows().await;
        assert_eq!(
            projected.iter().map(|r| r.ticket_id.as_str()).collect::<Vec<_>>(),
            vec!["T1"]
        );
        assert!(projected.iter().all(|r| r.affected_customers == 0));

        store.put_feed(feed("T1", "N1", Some(STATUS_CLOSED))).await;
        clock.advance(Duration::minutes(5));
        engine_over(&store, &clock).run("N1").await;

        let projected = store.projection_rows().await;
        assert_eq!(projected.len(), 1);
        assert_eq!(projected[0].state.as_deref(), Some(STATUS_CLOSED));
        assert_eq!(projected[0].event_end, Some(ts(10, 5)));
        assert_eq!(projected[0].node_finish_date, Some(ts(10, 5)));
    }

    #[tokio::test]
    async fn steps_scope_to_trimmed_node() {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(FixedClock::new(ts(10, 0)));
        store.put_feed(feed("T1", " N1 ", Some("OPEN"))).await;
        store.put_consolidated(incident("T9", "N2", Some("OPEN"), ts(8, 0))).await;

        let run = engine_over(&store, &clock).run("N1").await;

        assert_eq!(tickets(&run), vec!["T1"]);
        assert_eq!(store.consolidated("T9").await.unwrap().closure_date, None);
    }
}
