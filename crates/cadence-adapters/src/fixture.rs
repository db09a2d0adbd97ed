use std::collections::BTreeMap;
use std::path::Path;

use anyhow::Context;
use async_trait::async_trait;
use cadence_core::{DateRange, RevisionSnapshot, WorkItem, WorkItemId};
use cadence_http::UpstreamError;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::TrackerApi;

/// On-disk fixture: work items, their revision histories, and optional
/// per-item failure statuses returned instead of a history.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FixtureData {
    #[serde(default)]
    pub work_items: Vec<WorkItem>,
    #[serde(default)]
    pub revisions: BTreeMap<WorkItemId, Vec<RevisionSnapshot>>,
    #[serde(default)]
    pub revision_failures: BTreeMap<WorkItemId, u16>,
    /// Status returned by the project check instead of success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_check_failure: Option<u16>,
}

/// Tracker served from a JSON fixture; due-date updates only touch the
/// in-memory copy.
#[derive(Debug, Default)]
pub struct FixtureTracker {
    data: RwLock<FixtureData>,
}

impl FixtureTracker {
    pub fn new(data: FixtureData) -> Self {
        Self {
            data: RwLock::new(data),
        }
    }

    pub async fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let text = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        let data: FixtureData =
            serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
        Ok(Self::new(data))
    }

    pub async fn snapshot(&self) -> FixtureData {
        self.data.read().await.clone()
    }
}

#[async_trait]
impl TrackerApi for FixtureTracker {
    fn tracker_id(&self) -> &'static str {
        "fixture"
    }

    async fn query_work_items(
        &self,
        range: Option<DateRange>,
    ) -> Result<Vec<WorkItem>, UpstreamError> {
        let data = self.data.read().await;
        let mut items = data
            .work_items
            .iter()
            .filter(|item| match (range, item.due_date) {
                (Some(range), Some(due)) => due >= range.from && due <= range.to,
                _ => true,
            })
            .cloned()
            .collect::<Vec<_>>();
        items.sort_by(|a, b| b.changed_date.cmp(&a.changed_date));
        Ok(items)
    }

    async fn fetch_revisions(
        &self,
        id: WorkItemId,
    ) -> Result<Vec<RevisionSnapshot>, UpstreamError> {
        let data = self.data.read().await;
        if let Some(status) = data.revision_failures.get(&id) {
            return Err(UpstreamError::with_status(
                *status,
                format!("fixture failure for work item {id}"),
            ));
        }
        Ok(data.revisions.get(&id).cloned().unwrap_or_default())
    }

    async fn update_due_date(
        &self,
        id: WorkItemId,
        due_date: Option<NaiveDate>,
    ) -> Result<(), UpstreamError> {
        let mut data = self.data.write().await;
        let item = data
            .work_items
            .iter_mut()
            .find(|item| item.id == id)
            .ok_or_else(|| UpstreamError::with_status(404, format!("work item {id} not found")))?;
        item.due_date = due_date;
        Ok(())
    }

    async fn check_project(&self) -> Result<(), UpstreamError> {
        match self.data.read().await.project_check_failure {
            Some(status) => Err(UpstreamError::with_status(
                status,
                "fixture project check failure",
            )),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use tempfile::tempdir;

    fn item(id: WorkItemId, due: Option<&str>, changed: &str) -> WorkItem {
        WorkItem {
            id,
            title: format!("Item {id}"),
            state: "New".into(),
            assigned_to: None,
            due_date: due.map(|d| cadence_core::parse_day(d).unwrap()),
            work_item_type: "Product Backlog Item".into(),
            changed_date: changed.into(),
            created_date: "2024-01-01T00:00:00Z".into(),
            closed_date: None,
            area_path: "Web".into(),
            iteration_path: "Web\\Sprint 1".into(),
        }
    }

    fn sample() -> FixtureData {
        let mut revisions = BTreeMap::new();
        revisions.insert(
            1,
            vec![RevisionSnapshot::new(
                "In Progress",
                Utc.with_ymd_and_hms(2024, 1, 2, 9, 0, 0).unwrap(),
            )],
        );
        let mut revision_failures = BTreeMap::new();
        revision_failures.insert(3, 503);
        FixtureData {
            work_items: vec![
                item(1, Some("2024-01-10"), "2024-01-02T00:00:00Z"),
                item(2, None, "2024-01-05T00:00:00Z"),
                item(3, Some("2024-03-01"), "2024-01-03T00:00:00Z"),
            ],
            revisions,
            revision_failures,
            project_check_failure: None,
        }
    }

    #[tokio::test]
    async fn range_keeps_due_inside_and_undated_items() {
        let tracker = FixtureTracker::new(sample());
        let range = DateRange::from_bounds(Some("2024-01-01"), Some("2024-01-31")).unwrap();
        let items = tracker.query_work_items(range).await.unwrap();
        let ids = items.iter().map(|i| i.id).collect::<Vec<_>>();
        assert_eq!(ids, vec![2, 1]);
    }

    #[tokio::test]
    async fn revision_failures_carry_status() {
        let tracker = FixtureTracker::new(sample());
        assert_eq!(tracker.fetch_revisions(1).await.unwrap().len(), 1);
        assert!(tracker.fetch_revisions(2).await.unwrap().is_empty());
        assert_eq!(tracker.fetch_revisions(3).await.unwrap_err().status, Some(503));
    }

    #[tokio::test]
    async fn project_check_failure_carries_status() {
        let tracker = FixtureTracker::new(FixtureData {
            project_check_failure: Some(401),
            ..sample()
        });
        assert_eq!(tracker.check_project().await.unwrap_err().status, Some(401));
    }

    #[tokio::test]
    async fn due_date_updates_in_memory() {
        let tracker = FixtureTracker::new(sample());
        tracker.update_due_date(2, cadence_core::parse_day("2024-01-15").ok()).await.unwrap();
        tracker.update_due_date(1, None).await.unwrap();
        let data = tracker.snapshot().await;
        assert_eq!(data.work_items[1].due_date, cadence_core::parse_day("2024-01-15").ok());
        assert_eq!(data.work_items[0].due_date, None);
        assert_eq!(tracker.update_due_date(99, None).await.unwrap_err().status, Some(404));
    }

    #[tokio::test]
    async fn loads_fixture_from_disk() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("tracker.json");
        std::fs::write(&path, serde_json::to_vec(&sample()).unwrap()).unwrap();

        let tracker = FixtureTracker::load(&path).await.expect("load fixture");
        assert_eq!(tracker.snapshot().await.work_items.len(), 3);
        assert!(tracker.check_project().await.is_ok());
    }

    #[tokio::test]
    async fn sample_fixture_in_repo_parses() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../fixtures/sample/tracker.json");
        let tracker = FixtureTracker::load(&path).await.expect("sample fixture");
        assert!(!tracker.snapshot().await.work_items.is_empty());
    }
}
