//! Upstream tracker contract plus the live Azure DevOps client and a
//! fixture-backed tracker for offline runs.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use cadence_core::{DateRange, RevisionSnapshot, WorkItem, WorkItemId};
use cadence_http::{env_or, UpstreamError};
use chrono::NaiveDate;
use thiserror::Error;

mod azure_devops;
mod fixture;

pub use azure_devops::{build_wiql, AzureDevOpsClient, DUE_DATE_FIELD};
pub use fixture::{FixtureData, FixtureTracker};

pub const CRATE_NAME: &str = "cadence-adapters";

/// The three outbound operations plus a liveness probe. Implementations
/// report failures as [`UpstreamError`] so callers can apply retry policy.
#[async_trait]
pub trait TrackerApi: Send + Sync {
    fn tracker_id(&self) -> &'static str;

    async fn query_work_items(
        &self,
        range: Option<DateRange>,
    ) -> Result<Vec<WorkItem>, UpstreamError>;

    /// Full revision history, oldest first.
    async fn fetch_revisions(
        &self,
        id: WorkItemId,
    ) -> Result<Vec<RevisionSnapshot>, UpstreamError>;

    /// `None` clears the due date.
    async fn update_due_date(
        &self,
        id: WorkItemId,
        due_date: Option<NaiveDate>,
    ) -> Result<(), UpstreamError>;

    async fn check_project(&self) -> Result<(), UpstreamError>;
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} is required but not set")]
    Missing(&'static str),
}

#[derive(Debug, Clone)]
pub struct TrackerConfig {
    pub organization_url: String,
    pub personal_access_token: String,
    pub project: String,
    pub area_path: Option<String>,
    pub work_item_type: String,
    pub timeout: Duration,
}

impl TrackerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            organization_url: required_var("ADO_ORG")?,
            personal_access_token: required_var("ADO_PAT")?,
            project: required_var("ADO_PROJECT")?,
            area_path: std::env::var("ADO_AREA_PATH")
                .ok()
                .filter(|v| !v.trim().is_empty()),
            work_item_type: std::env::var("ADO_WORK_ITEM_TYPE")
                .unwrap_or_else(|_| "Product Backlog Item".to_string()),
            timeout: Duration::from_secs(env_or("ADO_TIMEOUT_SECS", 120)),
        })
    }
}

fn required_var(key: &'static str) -> Result<String, ConfigError> {
    std::env::var(key)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .ok_or(ConfigError::Missing(key))
}

/// Picks the fixture tracker when `CADENCE_FIXTURE_PATH` is set, the live
/// client otherwise.
pub async fn tracker_from_env() -> anyhow::Result<Arc<dyn TrackerApi>> {
    if let Ok(path) = std::env::var("CADENCE_FIXTURE_PATH") {
        return tracker_from_fixture(PathBuf::from(path)).await;
    }
    let config = TrackerConfig::from_env()?;
    let client = AzureDevOpsClient::new(config).context("building Azure DevOps client")?;
    Ok(Arc::new(client))
}

pub async fn tracker_from_fixture(path: PathBuf) -> anyhow::Result<Arc<dyn TrackerApi>> {
    let tracker = FixtureTracker::load(&path)
        .await
        .with_context(|| format!("loading tracker fixture {}", path.display()))?;
    Ok(Arc::new(tracker))
}
