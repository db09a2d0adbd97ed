//! Core domain model for the scheduling dashboard: work items, revision
//! history snapshots and derived cycle-time records.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use chrono::{DateTime, NaiveDate, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "cadence-core";

/// Upstream work item identifier. Always a positive integer.
pub type WorkItemId = u32;

/// Cycle-time records keyed by work item id. Ids without a record are absent.
pub type BatchResult = BTreeMap<WorkItemId, CycleTimeRecord>;

pub const STATE_IN_PROGRESS: &str = "In Progress";
pub const STATE_READY_FOR_TEST: &str = "Ready For Test";
pub const STATE_UAT_READY_FOR_TEST: &str = "UAT - Ready For Test";

const DAY_FORMAT: &str = "%Y-%m-%d";

static DAY_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\d{4}-\d{2}-\d{2}$").expect("static day pattern compiles"));

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("Invalid work item ID")]
    InvalidWorkItemId,
    #[error("Invalid date format. Use YYYY-MM-DD")]
    InvalidDate,
    #[error("workItemIds array is required")]
    MissingWorkItemIds,
}

/// Identity object attached to a revision's assignee field.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdentityRef {
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub unique_name: Option<String>,
    #[serde(default)]
    pub id: Option<String>,
}

/// Assignee reference as delivered upstream: either a structured identity
/// or a bare string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AssigneeRef {
    Name(String),
    Identity(IdentityRef),
}

impl AssigneeRef {
    /// Actor identifier: display name, then unique name, then the raw reference.
    /// Empty strings count as missing.
    pub fn resolve(&self) -> Option<String> {
        match self {
            AssigneeRef::Name(name) => non_empty(Some(name)),
            AssigneeRef::Identity(identity) => non_empty(identity.display_name.as_ref())
                .or_else(|| non_empty(identity.unique_name.as_ref()))
                .or_else(|| non_empty(identity.id.as_ref())),
        }
    }

    /// Display name of an identity reference, with no fallback.
    pub fn display_name(&self) -> Option<String> {
        match self {
            AssigneeRef::Name(_) => None,
            AssigneeRef::Identity(identity) => non_empty(identity.display_name.as_ref()),
        }
    }
}

fn non_empty(value: Option<&String>) -> Option<String> {
    value.filter(|v| !v.is_empty()).cloned()
}

/// One historical version of a work item, oldest first in a history.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RevisionSnapshot {
    #[serde(default)]
    pub rev: Option<u32>,
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default)]
    pub changed_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub assigned_to: Option<AssigneeRef>,
}

impl RevisionSnapshot {
    pub fn new(state: impl Into<String>, changed_date: DateTime<Utc>) -> Self {
        Self {
            rev: None,
            state: Some(state.into()),
            changed_date: Some(changed_date),
            assigned_to: None,
        }
    }

    pub fn with_assignee(mut self, assignee: AssigneeRef) -> Self {
        self.assigned_to = Some(assignee);
        self
    }
}

/// Derived per-item milestone dates and elapsed-day metrics.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CycleTimeRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub in_progress_date: Option<NaiveDate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub qa_ready_date: Option<NaiveDate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uat_ready_date: Option<NaiveDate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_to: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub qa_assigned_to: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cycle_time_days: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub qa_cycle_time_days: Option<i64>,
}

impl CycleTimeRecord {
    /// True when no milestone, actor or metric was derived.
    pub fn is_empty(&self) -> bool {
        self.in_progress_date.is_none()
            && self.qa_ready_date.is_none()
            && self.uat_ready_date.is_none()
            && self.assigned_to.is_none()
            && self.qa_assigned_to.is_none()
            && self.cycle_time_days.is_none()
            && self.qa_cycle_time_days.is_none()
    }
}

/// Scheduling view of a work item as returned by the query endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkItem {
    pub id: WorkItemId,
    pub title: String,
    pub state: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_to: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub due_date: Option<NaiveDate>,
    pub work_item_type: String,
    pub changed_date: String,
    pub created_date: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub closed_date: Option<NaiveDate>,
    pub area_path: String,
    pub iteration_path: String,
}

/// Inclusive due-date window for the work item query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    pub from: NaiveDate,
    pub to: NaiveDate,
}

impl DateRange {
    /// Builds a range only when both bounds are supplied; each supplied bound
    /// must be a valid `YYYY-MM-DD` date.
    pub fn from_bounds(
        from: Option<&str>,
        to: Option<&str>,
    ) -> Result<Option<Self>, ValidationError> {
        let from = from.map(parse_day).transpose()?;
        let to = to.map(parse_day).transpose()?;
        Ok(match (from, to) {
            (Some(from), Some(to)) => Some(Self { from, to }),
            _ => None,
        })
    }
}

/// Parses a strict `YYYY-MM-DD` calendar date.
pub fn parse_day(input: &str) -> Result<NaiveDate, ValidationError> {
    if !DAY_PATTERN.is_match(input) {
        return Err(ValidationError::InvalidDate);
    }
    NaiveDate::parse_from_str(input, DAY_FORMAT).map_err(|_| ValidationError::InvalidDate)
}

pub fn format_day(day: NaiveDate) -> String {
    day.format(DAY_FORMAT).to_string()
}

/// Parses a path segment into a positive work item id.
pub fn parse_work_item_id(input: &str) -> Result<WorkItemId, ValidationError> {
    match input.trim().parse::<WorkItemId>() {
        Ok(id) if id > 0 => Ok(id),
        _ => Err(ValidationError::InvalidWorkItemId),
    }
}

/// Validates a raw id list from a request body.
pub fn validate_work_item_ids(ids: &[i64]) -> Result<Vec<WorkItemId>, ValidationError> {
    if ids.is_empty() {
        return Err(ValidationError::MissingWorkItemIds);
    }
    ids.iter()
        .map(|&id| match WorkItemId::try_from(id) {
            Ok(id) if id > 0 => Ok(id),
            _ => Err(ValidationError::InvalidWorkItemId),
        })
        .collect()
}
