use async_trait::async_trait;
use cadence_core::{
    format_day, AssigneeRef, DateRange, RevisionSnapshot, WorkItem, WorkItemId,
};
use cadence_http::{build_client, HttpClientConfig, UpstreamError};
use chrono::{DateTime, NaiveDate, Utc};
use reqwest::{Method, RequestBuilder, Response, Url};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::{debug, info_span, warn, Instrument};

use crate::{TrackerApi, TrackerConfig};

pub const DUE_DATE_FIELD: &str = "Microsoft.VSTS.Scheduling.DueDate";

const API_VERSION: &str = "7.0";
const DETAILS_CHUNK: usize = 200;
const REVISIONS_PAGE: usize = 200;
const MAX_REVISION_PAGES: usize = 100;

const WORK_ITEM_FIELDS: &[&str] = &[
    "System.Id",
    "System.Title",
    "System.State",
    "System.AssignedTo",
    "System.WorkItemType",
    "System.ChangedDate",
    "System.CreatedDate",
    "Microsoft.VSTS.Common.ClosedDate",
    "System.AreaPath",
    "System.IterationPath",
    DUE_DATE_FIELD,
];

#[derive(Debug, Deserialize)]
struct ListEnvelope<T> {
    #[serde(default = "Vec::new")]
    value: Vec<T>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WiqlResult {
    #[serde(default)]
    work_items: Vec<WiqlReference>,
}

#[derive(Debug, Deserialize)]
struct WiqlReference {
    id: WorkItemId,
}

#[derive(Debug, Deserialize)]
struct WorkItemEnvelope {
    id: Option<WorkItemId>,
    fields: Option<WorkItemFields>,
}

#[derive(Debug, Default, Deserialize)]
struct WorkItemFields {
    #[serde(rename = "System.Title", default)]
    title: Option<String>,
    #[serde(rename = "System.State", default)]
    state: Option<String>,
    #[serde(rename = "System.AssignedTo", default)]
    assigned_to: Option<AssigneeRef>,
    #[serde(rename = "System.WorkItemType", default)]
    work_item_type: Option<String>,
    #[serde(rename = "System.ChangedDate", default)]
    changed_date: Option<String>,
    #[serde(rename = "System.CreatedDate", default)]
    created_date: Option<String>,
    #[serde(rename = "Microsoft.VSTS.Common.ClosedDate", default)]
    closed_date: Option<String>,
    #[serde(rename = "System.AreaPath", default)]
    area_path: Option<String>,
    #[serde(rename = "System.IterationPath", default)]
    iteration_path: Option<String>,
    #[serde(rename = "Microsoft.VSTS.Scheduling.DueDate", default)]
    due_date: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RevisionEnvelope {
    #[serde(default)]
    rev: Option<u32>,
    #[serde(default)]
    fields: Option<RevisionFields>,
}

#[derive(Debug, Default, Deserialize)]
struct RevisionFields {
    #[serde(rename = "System.State", default)]
    state: Option<String>,
    #[serde(rename = "System.ChangedDate", default)]
    changed_date: Option<DateTime<Utc>>,
    #[serde(rename = "System.AssignedTo", default)]
    assigned_to: Option<AssigneeRef>,
}

impl From<RevisionEnvelope> for RevisionSnapshot {
    fn from(envelope: RevisionEnvelope) -> Self {
        let fields = envelope.fields.unwrap_or_default();
        RevisionSnapshot {
            rev: envelope.rev,
            state: fields.state,
            changed_date: fields.changed_date,
            assigned_to: fields.assigned_to,
        }
    }
}

/// Live client for the Azure DevOps work item tracking REST API.
#[derive(Debug, Clone)]
pub struct AzureDevOpsClient {
    client: reqwest::Client,
    config: TrackerConfig,
}

impl AzureDevOpsClient {
    pub fn new(config: TrackerConfig) -> anyhow::Result<Self> {
        let client = build_client(&HttpClientConfig {
            timeout: config.timeout,
            ..Default::default()
        })?;
        Ok(Self { client, config })
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    fn endpoint(&self, project_scoped: bool, segments: &[&str]) -> Result<Url, UpstreamError> {
        let mut url = Url::parse(&self.config.organization_url).map_err(|err| {
            UpstreamError::without_status(format!(
                "invalid organization url {}: {err}",
                self.config.organization_url
            ))
        })?;
        {
            let mut path = url.path_segments_mut().map_err(|_| {
                UpstreamError::without_status(format!(
                    "organization url {} cannot be a base",
                    self.config.organization_url
                ))
            })?;
            path.pop_if_empty();
            if project_scoped {
                path.push(&self.config.project);
            }
            path.extend(segments);
        }
        url.query_pairs_mut().append_pair("api-version", API_VERSION);
        Ok(url)
    }

    fn request(&self, method: Method, url: Url) -> RequestBuilder {
        self.client
            .request(method, url)
            .basic_auth("", Some(&self.config.personal_access_token))
    }

    async fn send_json<T: DeserializeOwned>(&self, builder: RequestBuilder) -> Result<T, UpstreamError> {
        let response = builder.send().await?;
        let response = ensure_success(response).await?;
        Ok(response.json::<T>().await?)
    }

    async fn fetch_details(&self, ids: &[WorkItemId]) -> Result<Vec<WorkItem>, UpstreamError> {
        let mut items = Vec::with_capacity(ids.len());
        for chunk in ids.chunks(DETAILS_CHUNK) {
            let joined = chunk
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(",");
            let mut url = self.endpoint(true, &["_apis", "wit", "workitems"])?;
            url.query_pairs_mut()
                .append_pair("ids", &joined)
                .append_pair("fields", &WORK_ITEM_FIELDS.join(","));

            let envelope: ListEnvelope<WorkItemEnvelope> =
                self.send_json(self.request(Method::GET, url)).await?;
            items.extend(envelope.value.into_iter().filter_map(work_item_from_envelope));
        }
        Ok(items)
    }
}

async fn ensure_success(response: Response) -> Result<Response, UpstreamError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let url = response.url().to_string();
    let body = response.text().await.unwrap_or_default();
    Err(UpstreamError::from_response(status, &url, &body))
}

fn day_of(raw: Option<&str>) -> Option<NaiveDate> {
    let raw = raw?;
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc).date_naive())
        .ok()
        .or_else(|| raw.get(..10).and_then(|d| NaiveDate::parse_from_str(d, "%Y-%m-%d").ok()))
}

fn work_item_from_envelope(envelope: WorkItemEnvelope) -> Option<WorkItem> {
    let id = envelope.id?;
    let fields = envelope.fields?;
    Some(WorkItem {
        id,
        title: fields.title.unwrap_or_default(),
        state: fields.state.unwrap_or_default(),
        assigned_to: fields.assigned_to.as_ref().and_then(AssigneeRef::display_name),
        due_date: day_of(fields.due_date.as_deref()),
        work_item_type: fields.work_item_type.unwrap_or_default(),
        changed_date: fields.changed_date.unwrap_or_default(),
        created_date: fields.created_date.unwrap_or_default(),
        closed_date: day_of(fields.closed_date.as_deref()),
        area_path: fields.area_path.unwrap_or_default(),
        iteration_path: fields.iteration_path.unwrap_or_default(),
    })
}

fn quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// WIQL for the scheduling query. With a range, items due inside it or
/// without a due date are selected.
pub fn build_wiql(config: &TrackerConfig, range: Option<DateRange>) -> String {
    let mut wiql = format!(
        "SELECT [System.Id] FROM WorkItems WHERE [System.TeamProject] = {} AND [System.WorkItemType] = {}",
        quote(&config.project),
        quote(&config.work_item_type)
    );
    if let Some(area_path) = &config.area_path {
        wiql.push_str(&format!(" AND [System.AreaPath] UNDER {}", quote(area_path)));
    }
    if let Some(range) = range {
        wiql.push_str(&format!(
            " AND ([{DUE_DATE_FIELD}] >= '{}' AND [{DUE_DATE_FIELD}] <= '{}' OR [{DUE_DATE_FIELD}] = '')",
            format_day(range.from),
            format_day(range.to)
        ));
    }
    wiql.push_str(" ORDER BY [System.ChangedDate] DESC");
    wiql
}

#[async_trait]
impl TrackerApi for AzureDevOpsClient {
    fn tracker_id(&self) -> &'static str {
        "azure-devops"
    }

    async fn query_work_items(
        &self,
        range: Option<DateRange>,
    ) -> Result<Vec<WorkItem>, UpstreamError> {
        let span = info_span!("query_work_items", project = %self.config.project);
        async {
            let url = self.endpoint(true, &["_apis", "wit", "wiql"])?;
            let body = serde_json::json!({ "query": build_wiql(&self.config, range) });
            let result: WiqlResult = self
                .send_json(self.request(Method::POST, url).json(&body))
                .await?;
            let ids = result.work_items.iter().map(|r| r.id).collect::<Vec<_>>();
            if ids.is_empty() {
                return Ok(Vec::new());
            }
            let items = self.fetch_details(&ids).await?;
            debug!(count = items.len(), "work items fetched");
            Ok::<_, UpstreamError>(items)
        }
        .instrument(span)
        .await
    }

    async fn fetch_revisions(
        &self,
        id: WorkItemId,
    ) -> Result<Vec<RevisionSnapshot>, UpstreamError> {
        let span = info_span!("fetch_revisions", work_item_id = id);
        async {
            let id_segment = id.to_string();
            let mut revisions: Vec<RevisionSnapshot> = Vec::new();
            let mut last_rev = None;
            for page_index in 1..=MAX_REVISION_PAGES {
                let mut url =
                    self.endpoint(true, &["_apis", "wit", "workItems", &id_segment, "revisions"])?;
                url.query_pairs_mut()
                    .append_pair("$top", &REVISIONS_PAGE.to_string())
                    .append_pair("$skip", &revisions.len().to_string());

                let page: ListEnvelope<RevisionEnvelope> =
                    self.send_json(self.request(Method::GET, url)).await?;
                let page_len = page.value.len();
                let before = revisions.len();
                for snapshot in page.value.into_iter().map(RevisionSnapshot::from) {
                    if let (Some(rev), Some(last)) = (snapshot.rev, last_rev) {
                        if rev <= last {
                            continue;
                        }
                    }
                    last_rev = snapshot.rev.or(last_rev);
                    revisions.push(snapshot);
                }
                if page_len < REVISIONS_PAGE {
                    break;
                }
                if revisions.len() == before {
                    warn!(skip = before, "revision page repeated earlier revisions, stopping");
                    break;
                }
                if page_index == MAX_REVISION_PAGES {
                    warn!(pages = MAX_REVISION_PAGES, "revision page limit reached");
                }
            }
            debug!(count = revisions.len(), "revisions fetched");
            Ok::<_, UpstreamError>(revisions)
        }
        .instrument(span)
        .await
    }

    async fn update_due_date(
        &self,
        id: WorkItemId,
        due_date: Option<NaiveDate>,
    ) -> Result<(), UpstreamError> {
        let url = self.endpoint(true, &["_apis", "wit", "workitems", &id.to_string()])?;
        let path = format!("/fields/{DUE_DATE_FIELD}");
        let patch = match due_date {
            Some(day) => serde_json::json!([{ "op": "add", "path": path, "value": format_day(day) }]),
            None => serde_json::json!([{ "op": "remove", "path": path }]),
        };
        let body = serde_json::to_vec(&patch)
            .map_err(|err| UpstreamError::without_status(format!("encoding patch: {err}")))?;

        let response = self
            .request(Method::PATCH, url)
            .header(reqwest::header::CONTENT_TYPE, "application/json-patch+json")
            .body(body)
            .send()
            .await?;
        ensure_success(response).await?;
        Ok(())
    }

    async fn check_project(&self) -> Result<(), UpstreamError> {
        let url = self.endpoint(false, &["_apis", "projects", &self.config.project])?;
        let response = self.request(Method::GET, url).send().await?;
        ensure_success(response).await?;
        Ok(())
    }
}
