//! Cycle-time analytics: revision scanning, batched fan-out over work items,
//! and the service facade that applies retry policy to every upstream call.

use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;

use cadence_adapters::TrackerApi;
use cadence_core::{
    BatchResult, CycleTimeRecord, DateRange, RevisionSnapshot, WorkItem, WorkItemId,
    STATE_IN_PROGRESS, STATE_READY_FOR_TEST, STATE_UAT_READY_FOR_TEST,
};
use cadence_http::{env_or, BackoffPolicy, StatusCoded, UpstreamError};
use chrono::{DateTime, NaiveDate, Utc};
use futures::future::join_all;
use tracing::{info, warn};

pub const CRATE_NAME: &str = "cadence-analytics";

const MILLIS_PER_DAY: i64 = 24 * 60 * 60 * 1000;

#[derive(Debug, Clone, Default)]
struct Milestone {
    at: Option<DateTime<Utc>>,
    actor: Option<String>,
}

impl Milestone {
    fn observe(&mut self, revision: &RevisionSnapshot, label: &str) {
        if self.at.is_some() || revision.state.as_deref() != Some(label) {
            return;
        }
        if let Some(changed) = revision.changed_date {
            self.at = Some(changed);
            self.actor = revision.assigned_to.as_ref().and_then(|a| a.resolve());
        }
    }

    fn day(&self) -> Option<NaiveDate> {
        self.at.map(|at| at.date_naive())
    }
}

/// Whole days from `start` to `end`, rounded up. Negative spans are kept.
pub fn elapsed_days(start: DateTime<Utc>, end: DateTime<Utc>) -> i64 {
    let millis = (end - start).num_milliseconds();
    let days = millis.div_euclid(MILLIS_PER_DAY);
    if millis.rem_euclid(MILLIS_PER_DAY) == 0 {
        days
    } else {
        days + 1
    }
}

/// Reduces an oldest-first revision history to a cycle-time record.
///
/// Only the first entry into each tracked state counts; later regressions
/// back into a state are ignored. Returns `None` for an empty history.
pub fn scan_revisions(revisions: &[RevisionSnapshot]) -> Option<CycleTimeRecord> {
    if revisions.is_empty() {
        return None;
    }

    let mut in_progress = Milestone::default();
    let mut ready_for_test = Milestone::default();
    let mut uat_ready = Milestone::default();

    for revision in revisions {
        in_progress.observe(revision, STATE_IN_PROGRESS);
        ready_for_test.observe(revision, STATE_READY_FOR_TEST);
        uat_ready.observe(revision, STATE_UAT_READY_FOR_TEST);
    }

    let span = |from: &Milestone, to: &Milestone| match (from.at, to.at) {
        (Some(start), Some(end)) => Some(elapsed_days(start, end)),
        _ => None,
    };

    Some(CycleTimeRecord {
        in_progress_date: in_progress.day(),
        qa_ready_date: ready_for_test.day(),
        uat_ready_date: uat_ready.day(),
        cycle_time_days: span(&in_progress, &ready_for_test),
        qa_cycle_time_days: span(&ready_for_test, &uat_ready),
        assigned_to: in_progress.actor,
        qa_assigned_to: ready_for_test.actor,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchPolicy {
    /// Items fetched concurrently; groups run one after another.
    pub group_size: usize,
    pub backoff: BackoffPolicy,
}

impl Default for BatchPolicy {
    fn default() -> Self {
        Self {
            group_size: 3,
            backoff: BackoffPolicy::default(),
        }
    }
}

impl BatchPolicy {
    pub fn from_env() -> Self {
        Self {
            group_size: env_or("CADENCE_CYCLE_GROUP_SIZE", 3usize).max(1),
            backoff: BackoffPolicy::from_env(),
        }
    }

    pub fn groups<'a>(&self, ids: &'a [WorkItemId]) -> std::slice::Chunks<'a, WorkItemId> {
        ids.chunks(self.group_size.max(1))
    }
}

async fn compute_one<F, Fut, E>(
    id: WorkItemId,
    backoff: &BackoffPolicy,
    fetch: &F,
) -> Option<CycleTimeRecord>
where
    F: Fn(WorkItemId) -> Fut,
    Fut: Future<Output = Result<Vec<RevisionSnapshot>, E>>,
    E: StatusCoded + Display,
{
    match backoff.execute(|| fetch(id)).await {
        Ok(revisions) => scan_revisions(&revisions).filter(|record| !record.is_empty()),
        Err(err) => {
            warn!(work_item_id = id, status = err.status_code(), error = %err, "cycle time unavailable");
            None
        }
    }
}

/// Computes cycle-time records for `ids` in sequential groups, fetching each
/// group's members concurrently. Failed or empty items are left out.
pub async fn compute_all<F, Fut, E>(ids: &[WorkItemId], policy: &BatchPolicy, fetch: F) -> BatchResult
where
    F: Fn(WorkItemId) -> Fut,
    Fut: Future<Output = Result<Vec<RevisionSnapshot>, E>>,
    E: StatusCoded + Display,
{
    let fetch = &fetch;
    let mut result = BatchResult::new();
    let total_groups = ids.len().div_ceil(policy.group_size.max(1));

    for (index, group) in policy.groups(ids).enumerate() {
        info!(group = index + 1, total_groups, size = group.len(), "processing cycle time group");
        let records = join_all(
            group
                .iter()
                .map(|&id| async move { (id, compute_one(id, &policy.backoff, fetch).await) }),
        )
        .await;
        result.extend(records.into_iter().filter_map(|(id, record)| Some((id, record?))));
    }

    result
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ServiceConfig {
    pub batch: BatchPolicy,
}

impl ServiceConfig {
    pub fn from_env() -> Self {
        Self {
            batch: BatchPolicy::from_env(),
        }
    }
}

/// Facade over a [`TrackerApi`] that wraps each outbound call in the
/// backoff executor.
#[derive(Clone)]
pub struct SchedulingService {
    tracker: Arc<dyn TrackerApi>,
    config: ServiceConfig,
}

impl SchedulingService {
    pub fn new(tracker: Arc<dyn TrackerApi>, config: ServiceConfig) -> Self {
        Self { tracker, config }
    }

    pub fn tracker_id(&self) -> &'static str {
        self.tracker.tracker_id()
    }

    pub async fn work_items(&self, range: Option<DateRange>) -> Result<Vec<WorkItem>, UpstreamError> {
        self.config
            .batch
            .backoff
            .execute(|| self.tracker.query_work_items(range))
            .await
    }

    pub async fn update_due_date(
        &self,
        id: WorkItemId,
        due_date: Option<NaiveDate>,
    ) -> Result<(), UpstreamError> {
        self.config
            .batch
            .backoff
            .execute(|| self.tracker.update_due_date(id, due_date))
            .await
    }

    pub async fn cycle_times(&self, ids: &[WorkItemId]) -> BatchResult {
        info!(count = ids.len(), "calculating cycle time");
        compute_all(ids, &self.config.batch, |id| self.tracker.fetch_revisions(id)).await
    }

    /// Single unretried probe of the configured project.
    pub async fn health(&self) -> bool {
        match self.tracker.check_project().await {
            Ok(()) => true,
            Err(err) => {
                warn!(status = err.status, error = %err, "health check failed");
                false
            }
        }
    }
}
