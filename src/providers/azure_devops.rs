use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use reqwest::Method;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use super::{WorkItemQuery, WorkTracker};
use crate::auth::TokenSource;
use crate::error::{AdoError, AdoResult};
use crate::model::comment::Comment;
use crate::model::history::{WorkItemHistory, WorkItemUpdate};
use crate::model::project::Project;
use crate::model::tree::{build_forest, RelationEdge, WorkItemTreeNode};
use crate::model::work_item::WorkItem;
use crate::util::text::truncate_chars;

pub const API_VERSION: &str = "7.1";
pub const COMMENTS_API_VERSION: &str = "7.1-preview.3";
const ERROR_BODY_LIMIT: usize = 200;

/// Trim whitespace, one trailing `/`, then one trailing `/_apis`.
pub fn normalize_organization_url(url: &str) -> String {
    let url = url.trim();
    let url = url.strip_suffix('/').unwrap_or(url);
    let url = url.strip_suffix("/_apis").unwrap_or(url);
    url.to_string()
}

/// Azure DevOps work item tracking over the REST API.
pub struct AzureDevOpsClient {
    http: reqwest::Client,
    tokens: Arc<dyn TokenSource>,
    organization: RwLock<Option<String>>,
    readonly: AtomicBool,
}

#[derive(Deserialize)]
struct ValueList<T> {
    #[serde(default = "Vec::new")]
    value: Vec<T>,
}

#[derive(Deserialize)]
struct CommentList {
    #[serde(default)]
    comments: Vec<Comment>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WiqlResult {
    #[serde(default)]
    work_items: Vec<WiqlReference>,
    #[serde(default)]
    work_item_relations: Vec<WiqlRelation>,
}

#[derive(Deserialize)]
struct WiqlReference {
    id: i64,
}

#[derive(Deserialize)]
struct WiqlRelation {
    source: Option<WiqlReference>,
    target: Option<WiqlReference>,
}

#[derive(Serialize)]
struct PatchOperation<'a> {
    op: &'static str,
    path: String,
    value: &'a Value,
}

enum Payload {
    Json(Value),
    Patch(Vec<u8>),
}

fn patch_document(op: &'static str, fields: &Map<String, Value>) -> AdoResult<Vec<u8>> {
    let operations: Vec<PatchOperation<'_>> = fields
        .iter()
        .map(|(name, value)| PatchOperation {
            op,
            path: format!("/fields/{name}"),
            value,
        })
        .collect();
    serde_json::to_vec(&operations).map_err(|e| AdoError::InvalidResponse(e.to_string()))
}

impl AzureDevOpsClient {
    pub fn new(http: reqwest::Client, tokens: Arc<dyn TokenSource>) -> Self {
        Self {
            http,
            tokens,
            organization: RwLock::new(None),
            readonly: AtomicBool::new(false),
        }
    }

    fn base_url(&self) -> AdoResult<String> {
        let organization = self
            .organization
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        organization.clone().ok_or(AdoError::Configuration)
    }

    fn ensure_writable(&self, operation: &'static str) -> AdoResult<()> {
        if self.is_readonly() {
            tracing::warn!(operation, "blocked by readonly mode");
            return Err(AdoError::Readonly { operation });
        }
        Ok(())
    }

    async fn send(
        &self,
        action: &'static str,
        method: Method,
        url: &str,
        payload: Option<Payload>,
    ) -> AdoResult<reqwest::Response> {
        let authorization = self.tokens.bearer_header().await?;
        tracing::debug!(%method, url, "azure devops request");

        let request = self
            .http
            .request(method, url)
            .header(AUTHORIZATION, authorization);
        let request = match payload {
            Some(Payload::Json(body)) => request.json(&body),
            Some(Payload::Patch(body)) => request
                .header(CONTENT_TYPE, "application/json-patch+json")
                .body(body),
            None => request.header(CONTENT_TYPE, "application/json"),
        };

        let response = request
            .send()
            .await
            .map_err(|e| AdoError::transport(action, e))?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        let body = truncate_chars(body.trim(), ERROR_BODY_LIMIT);
        tracing::warn!(action, status = status.as_u16(), body = %body, "azure devops request failed");
        Err(AdoError::Remote {
            action,
            status: status.as_u16(),
            body,
        })
    }

    async fn send_json<T: DeserializeOwned>(
        &self,
        action: &'static str,
        method: Method,
        url: &str,
        payload: Option<Payload>,
    ) -> AdoResult<T> {
        let response = self.send(action, method, url, payload).await?;
        response
            .json()
            .await
            .map_err(|e| AdoError::InvalidResponse(format!("{action}: {}", e.without_url())))
    }

    async fn run_wiql(&self, base: &str, query: &WorkItemQuery) -> AdoResult<WiqlResult> {
        let segments = query.scope_path()?;
        let mut url = base.to_string();
        for segment in segments {
            url.push('/');
            url.push_str(&urlencoding::encode(segment));
        }
        url.push_str(&format!("/_apis/wit/wiql?api-version={API_VERSION}"));

        tracing::debug!(scope = ?query.scope, wiql = %query.wiql, "running wiql query");
        self.send_json(
            "execute WIQL query",
            Method::POST,
            &url,
            Some(Payload::Json(json!({ "query": query.wiql }))),
        )
        .await
    }

    /// One batch call for all ids; none at all when `ids` is empty.
    async fn items_by_ids(&self, base: &str, ids: &[i64]) -> AdoResult<Vec<WorkItem>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let ids = ids
            .iter()
            .map(i64::to_string)
            .collect::<Vec<_>>()
            .join(",");
        let url = format!("{base}/_apis/wit/workitems?ids={ids}&$expand=all&api-version={API_VERSION}");
        let batch: ValueList<Value> = self
            .send_json("fetch work items", Method::GET, &url, None)
            .await?;
        Ok(batch.value.iter().map(WorkItem::from_api).collect())
    }
}

#[async_trait]
impl WorkTracker for AzureDevOpsClient {
    fn organization(&self) -> Option<String> {
        self.organization
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn set_organization(&self, url: &str) {
        let normalized = normalize_organization_url(url);
        tracing::info!(organization = %normalized, "organization set");
        let mut organization = self
            .organization
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *organization = Some(normalized).filter(|url| !url.is_empty());
    }

    fn is_readonly(&self) -> bool {
        self.readonly.load(Ordering::SeqCst)
    }

    fn set_readonly(&self, readonly: bool) {
        self.readonly.store(readonly, Ordering::SeqCst);
    }

    async fn list_projects(&self) -> AdoResult<Vec<Project>> {
        let base = self.base_url()?;
        let url = format!("{base}/_apis/projects?api-version={API_VERSION}");
        let projects: ValueList<Project> = self
            .send_json("fetch projects", Method::GET, &url, None)
            .await?;
        Ok(projects.value)
    }

    async fn query_items(&self, query: &WorkItemQuery) -> AdoResult<Vec<WorkItem>> {
        let base = self.base_url()?;
        let result = self.run_wiql(&base, query).await?;
        let ids: Vec<i64> = result
            .work_items
            .iter()
            .take(query.top)
            .map(|item| item.id)
            .collect();
        tracing::debug!(returned = result.work_items.len(), fetching = ids.len(), "wiql ids");
        self.items_by_ids(&base, &ids).await
    }

    async fn query_item_tree(&self, query: &WorkItemQuery) -> AdoResult<Vec<WorkItemTreeNode>> {
        let base = self.base_url()?;
        let result = self.run_wiql(&base, query).await?;
        let relations = &result.work_item_relations[..query.top.min(result.work_item_relations.len())];

        let mut seen = HashSet::new();
        let mut ids = Vec::new();
        let mut edges = Vec::new();
        for relation in relations {
            let source = relation.source.as_ref().map(|r| r.id);
            let target = relation.target.as_ref().map(|r| r.id);
            for id in [source, target].into_iter().flatten() {
                if seen.insert(id) {
                    ids.push(id);
                }
            }
            // Rows without a source mark top-level items, not links.
            if let (Some(source), Some(target)) = (source, target) {
                edges.push(RelationEdge::new(source, target));
            }
        }

        let items = self.items_by_ids(&base, &ids).await?;
        Ok(build_forest(&edges, items))
    }

    async fn create_item(
        &self,
        project: &str,
        work_item_type: &str,
        fields: &Map<String, Value>,
    ) -> AdoResult<WorkItem> {
        self.ensure_writable("create work item")?;
        let base = self.base_url()?;
        let url = format!(
            "{base}/{}/_apis/wit/workitems/${}?api-version={API_VERSION}",
            urlencoding::encode(project),
            urlencoding::encode(work_item_type)
        );
        let body = patch_document("add", fields)?;
        let raw: Value = self
            .send_json("create work item", Method::POST, &url, Some(Payload::Patch(body)))
            .await?;
        let item = WorkItem::from_api(&raw);
        tracing::info!(id = item.id, project, work_item_type, "work item created");
        Ok(item)
    }

    async fn update_item(&self, id: i64, fields: &Map<String, Value>) -> AdoResult<WorkItem> {
        self.ensure_writable("update work item")?;
        let base = self.base_url()?;
        let url = format!("{base}/_apis/wit/workitems/{id}?api-version={API_VERSION}");
        let body = patch_document("replace", fields)?;
        let raw: Value = self
            .send_json("update work item", Method::PATCH, &url, Some(Payload::Patch(body)))
            .await?;
        tracing::info!(id, fields = fields.len(), "work item updated");
        Ok(WorkItem::from_api(&raw))
    }

    async fn delete_item(&self, id: i64) -> AdoResult<()> {
        self.ensure_writable("delete work item")?;
        let base = self.base_url()?;
        let url = format!("{base}/_apis/wit/workitems/{id}?api-version={API_VERSION}");
        self.send("delete work item", Method::DELETE, &url, None)
            .await?;
        tracing::info!(id, "work item deleted");
        Ok(())
    }

    async fn item_history(&self, id: i64) -> AdoResult<WorkItemHistory> {
        let base = self.base_url()?;
        let url = format!("{base}/_apis/wit/workitems/{id}/updates?api-version={API_VERSION}");
        let updates: ValueList<WorkItemUpdate> = self
            .send_json("fetch work item history", Method::GET, &url, None)
            .await?;
        Ok(WorkItemHistory {
            work_item_id: id,
            updates: updates.value,
        })
    }

    async fn item_comments(&self, id: i64) -> AdoResult<Vec<Comment>> {
        let base = self.base_url()?;
        let url = format!(
            "{base}/_apis/wit/workitems/{id}/comments?api-version={COMMENTS_API_VERSION}"
        );
        let list: CommentList = self
            .send_json("fetch work item comments", Method::GET, &url, None)
            .await?;
        Ok(list.comments)
    }

    async fn add_comment(&self, id: i64, text: &str) -> AdoResult<Comment> {
        self.ensure_writable("add work item comment")?;
        let base = self.base_url()?;
        let url = format!(
            "{base}/_apis/wit/workitems/{id}/comments?api-version={COMMENTS_API_VERSION}"
        );
        let comment: Comment = self
            .send_json(
                "add work item comment",
                Method::POST,
                &url,
                Some(Payload::Json(json!({ "text": text }))),
            )
            .await?;
        tracing::info!(id, comment_id = comment.id, "comment added");
        Ok(comment)
    }

    async fn test_connection(&self) -> bool {
        let base = match self.base_url() {
            Ok(base) => base,
            Err(err) => {
                tracing::warn!(error = %err, "connection test skipped");
                return false;
            }
        };
        let url = format!("{base}/_apis/projects?api-version={API_VERSION}");
        match self.send("test connection", Method::GET, &url, None).await {
            Ok(_) => true,
            Err(err) => {
                tracing::warn!(error = %err, "connection test failed");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn organization_url_is_normalized() {
        assert_eq!(
            normalize_organization_url("  https://dev.azure.com/contoso/ "),
            "https://dev.azure.com/contoso"
        );
        assert_eq!(
            normalize_organization_url("https://dev.azure.com/contoso/_apis"),
            "https://dev.azure.com/contoso"
        );
        assert_eq!(
            normalize_organization_url("https://dev.azure.com/contoso/_apis/"),
            "https://dev.azure.com/contoso"
        );
        assert_eq!(
            normalize_organization_url("https://contoso.visualstudio.com"),
            "https://contoso.visualstudio.com"
        );
    }

    #[test]
    fn patch_document_targets_fields() {
        let mut fields = Map::new();
        fields.insert("System.Title".into(), json!("Fix login"));
        fields.insert("Microsoft.VSTS.Common.Priority".into(), json!(2));
        let body: Value = serde_json::from_slice(&patch_document("add", &fields).unwrap()).unwrap();
        assert_eq!(
            body,
            json!([
                {"op": "add", "path": "/fields/Microsoft.VSTS.Common.Priority", "value": 2},
                {"op": "add", "path": "/fields/System.Title", "value": "Fix login"}
            ])
        );
    }
}
