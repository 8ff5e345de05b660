//! Node discovery across the management (A), feed (B) and consolidated (C) tables.

use std::collections::BTreeSet;
use std::sync::Arc;

use nir_core::{normalize_node, DistributionReport, SourceTable};
use nir_storage::{RecordStore, StoreResult};

pub struct NodeDirectory {
    store: Arc<dyn RecordStore>,
}

impl NodeDirectory {
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self { store }
    }

    pub async fn list_nodes(&self) -> StoreResult<Vec<String>> {
        let mut nodes = BTreeSet::new();
        for source in SourceTable::ALL {
            nodes.extend(self.nodes_in(source).await?);
        }
        Ok(nodes.into_iter().collect())
    }

    pub async fn compare_nodes(&self) -> StoreResult<DistributionReport> {
        let management = self.nodes_in(SourceTable::Management).await?;
        let feed = self.nodes_in(SourceTable::Feed).await?;
        let consolidated = self.nodes_in(SourceTable::Consolidated).await?;
        Ok(build_report(management, feed, consolidated))
    }

    async fn nodes_in(&self, source: SourceTable) -> StoreResult<BTreeSet<String>> {
        Ok(self
            .store
            .distinct_nodes(source)
            .await?
            .iter()
            .filter_map(|n| normalize_node(n))
            .collect())
    }
}

pub fn build_report(
    management: BTreeSet<String>,
    feed: BTreeSet<String>,
    consolidated: BTreeSet<String>,
) -> DistributionReport {
    let sorted = |set: BTreeSet<&String>| set.into_iter().cloned().collect::<Vec<_>>();
    let all: BTreeSet<&String> = management.iter().chain(&feed).chain(&consolidated).collect();

    let only_in_management = sorted(
        management
            .iter()
            .filter(|n| !feed.contains(*n) && !consolidated.contains(*n))
            .collect(),
    );
    let only_in_feed = sorted(
        feed.iter()
            .filter(|n| !management.contains(*n) && !consolidated.contains(*n))
            .collect(),
    );
    let only_in_consolidated = sorted(
        consolidated
            .iter()
            .filter(|n| !management.contains(*n) && !feed.contains(*n))
            .collect(),
    );
    let in_management_and_feed_not_consolidated = sorted(
        management
            .intersection(&feed)
            .filter(|n| !consolidated.contains(*n))
            .collect(),
    );
    let in_all = sorted(
        management
            .intersection(&feed)
            .filter(|n| consolidated.contains(*n))
            .collect(),
    );

    DistributionReport {
        total_unique: all.len(),
        all_nodes: sorted(all),
        only_in_management,
        only_in_feed,
        only_in_consolidated,
        in_management_and_feed_not_consolidated,
        in_all,
        management: management.into_iter().collect(),
        feed: feed.into_iter().collect(),
        consolidated: consolidated.into_iter().collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{feed, incident, management, ts};
    use nir_storage::MemoryStore;

    fn set(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn report_derives_set_differences() {
        let report = build_report(set(&["N1", "N3"]), set(&["N1", "N2"]), set(&["N1"]));
        assert_eq!(report.all_nodes, vec!["N1", "N2", "N3"]);
        assert_eq!(report.only_in_management, vec!["N3"]);
        assert_eq!(report.only_in_feed, vec!["N2"]);
        assert!(report.only_in_consolidated.is_empty());
        assert!(report.in_management_and_feed_not_consolidated.is_empty());
        assert_eq!(report.in_all, vec!["N1"]);
        assert_eq!(report.total_unique, 3);
    }

    #[test]
    fn empty_sources_give_empty_report() {
        let report = build_report(BTreeSet::new(), BTreeSet::new(), BTreeSet::new());
        assert_eq!(report, DistributionReport::default());
    }

    #[tokio::test]
    async fn directory_reads_all_three_tables() {
        let store = Arc::new(MemoryStore::new());
        store.put_management(management("T1", "N1", None)).await;
        store.put_management(management("T3", " N3", None)).await;
        store.put_feed(feed("T1", "N1", Some("OPEN"))).await;
        store.put_feed(feed("T2", "N2 ", Some("OPEN"))).await;
        store
            .put_consolidated(incident("T1", "N1", Some("OPEN"), ts(8, 0)))
            .await;
        let directory = NodeDirectory::new(store.clone());

        assert_eq!(directory.list_nodes().await.unwrap(), vec!["N1", "N2", "N3"]);
        let report = directory.compare_nodes().await.unwrap();
        assert_eq!(report.management, vec!["N1", "N3"]);
        assert_eq!(report.only_in_management, vec!["N3"]);
        assert_eq!(report.in_all, vec!["N1"]);

        store.fail_on("distinct_nodes");
        assert!(directory.list_nodes().await.is_err());
    }

    #[tokio::test]
    async fn empty_tables_list_no_nodes() {
        let directory = NodeDirectory::new(Arc::new(MemoryStore::new()));
        assert!(directory.list_nodes().await.unwrap().is_empty());
        assert_eq!(directory.compare_nodes().await.unwrap().total_unique, 0);
    }
}
