use chrono::{DateTime, TimeZone, Utc};
use nir_core::{FeedRecord, IncidentRecord, ManagementRecord, STATUS_CLOSED};

pub fn ts(h: u32, m: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 2, h, m, 0).single().unwrap()
}

pub fn feed(id: &str, node: &str, status: Option<&str>) -> FeedRecord {
    FeedRecord {
        incident_id: id.into(),
        summary: Some("FIBER CUT".into()),
        reported_by: Some("monitor".into()),
        reported_date: Some(ts(8, 0)),
        node: node.into(),
        status: status.map(Into::into),
        owner: Some("noc".into()),
        owner_group: Some("field".into()),
    }
}

pub fn management(ticket: &str, node: &str, closed_at: Option<DateTime<Utc>>) -> ManagementRecord {
    ManagementRecord {
        ticket_id: ticket.into(),
        node: node.into(),
        event_status: Some(if closed_at.is_some() { STATUS_CLOSED } else { "OPEN" }.into()),
        technician: Some("tech-1".into()),
        event_closure_date: closed_at,
    }
}

pub fn incident(
    id: &str,
    node: &str,
    status: Option<&str>,
    last_updated: DateTime<Utc>,
) -> IncidentRecord {
    IncidentRecord::from_feed(&feed(id, node, status), last_updated)
}

pub trait ManagementExt {
    fn with_status(self, status: &str) -> Self;
}

impl ManagementExt for ManagementRecord {
    fn with_status(mut self, status: &str) -> Self {
        self.event_status = Some(status.into());
        self
    }
}
