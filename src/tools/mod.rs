use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::auth::{AcquireMode, TokenSource};
use crate::error::{AdoError, AdoResult};
use crate::model::tree::count_nodes;
use crate::providers::{ScopeKind, WorkItemQuery, WorkTracker, DEFAULT_TOP};


#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolName {
    Login,
    ListProjects,
    QueryItems,
    QueryItemTree,
    CreateItem,
    UpdateItem,
    DeleteItem,
    GetHistory,
    GetComments,
    AddComment,
}

impl ToolName {
    pub const ALL: [ToolName; 10] = [
        ToolName::Login,
        ToolName::ListProjects,
        ToolName::QueryItems,
        ToolName::QueryItemTree,
        ToolName::CreateItem,
        ToolName::UpdateItem,
        ToolName::DeleteItem,
        ToolName::GetHistory,
        ToolName::GetComments,
        ToolName::AddComment,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ToolName::Login => "login",
            ToolName::ListProjects => "list-projects",
            ToolName::QueryItems => "query-items",
            ToolName::QueryItemTree => "query-item-tree",
            ToolName::CreateItem => "create-item",
            ToolName::UpdateItem => "update-item",
            ToolName::DeleteItem => "delete-item",
            ToolName::GetHistory => "get-history",
            ToolName::GetComments => "get-comments",
            ToolName::AddComment => "add-comment",
        }
    }

    /// Parameter summary shown by `help`.
    pub fn usage(self) -> &'static str {
        match self {
            ToolName::Login => "",
            ToolName::ListProjects => "",
            ToolName::QueryItems | ToolName::QueryItemTree => {
                "{wiqlQuery, scope, projectName?, teamName?, top?}"
            }
            ToolName::CreateItem => "{projectName, workItemType, fields}",
            ToolName::UpdateItem => "{workItemId, fields}",
            ToolName::DeleteItem | ToolName::GetHistory | ToolName::GetComments => {
                "{workItemId}"
            }
            ToolName::AddComment => "{workItemId, commentText}",
        }
    }

    fn action(self) -> &'static str {
        match self {
            ToolName::Login => "authenticate with Azure DevOps",
            ToolName::ListProjects => "fetch projects",
            ToolName::QueryItems => "execute WIQL query",
            ToolName::QueryItemTree => "execute WIQL work item links query",
            ToolName::CreateItem => "create work item",
            ToolName::UpdateItem => "update work item",
            ToolName::DeleteItem => "delete work item",
            ToolName::GetHistory => "get work item history",
            ToolName::GetComments => "get work item comments",
            ToolName::AddComment => "add work item comment",
        }
    }
}

impl fmt::Display for ToolName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ToolName {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ToolName::ALL
            .into_iter()
            .find(|tool| tool.as_str() == s)
            .ok_or_else(|| format!("unknown tool '{s}'"))
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueryParams {
    wiql_query: Option<String>,
    scope: Option<ScopeKind>,
    project_name: Option<String>,
    team_name: Option<String>,
    top: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateParams {
    project_name: Option<String>,
    work_item_type: Option<String>,
    fields: Option<Map<String, Value>>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UpdateParams {
    work_item_id: Option<i64>,
    fields: Option<Map<String, Value>>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ItemParams {
    work_item_id: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CommentParams {
    work_item_id: Option<i64>,
    comment_text: Option<String>,
}

fn parse<T: DeserializeOwned>(input: Value) -> AdoResult<T> {
    let input = match input {
        Value::Null => Value::Object(Map::new()),
        other => other,
    };
    serde_json::from_value(input).map_err(|e| AdoError::validation(format!("invalid parameters: {e}")))
}

fn required<T>(value: Option<T>, message: &str) -> AdoResult<T> {
    value.ok_or_else(|| AdoError::validation(message))
}

fn non_blank(value: Option<String>, message: &str) -> AdoResult<String> {
    required(value.filter(|v| !v.trim().is_empty()), message)
}

fn fenced_json(value: &impl Serialize) -> String {
    let json = serde_json::to_string_pretty(value).unwrap_or_else(|e| format!("\"<unserializable: {e}>\""));
    format!("```json\n{json}\n```")
}

/// The host-facing tool surface. Every call returns text; failures are
/// reported as `Failed to <action>: <reason>` rather than propagated.
pub struct Tools {
    tracker: Arc<dyn WorkTracker>,
    tokens: Arc<dyn TokenSource>,
}

impl Tools {
    pub fn new(tracker: Arc<dyn WorkTracker>, tokens: Arc<dyn TokenSource>) -> Self {
        Self { tracker, tokens }
    }

    pub async fn invoke(&self, tool: ToolName, input: Value) -> String {
        tracing::debug!(%tool, "invoking tool");
        let result = match tool {
            ToolName::Login => self.login().await,
            ToolName::ListProjects => self.list_projects().await,
            ToolName::QueryItems => self.query_items(input).await,
            ToolName::QueryItemTree => self.query_item_tree(input).await,
            ToolName::CreateItem => self.create_item(input).await,
            ToolName::UpdateItem => self.update_item(input).await,
            ToolName::DeleteItem => self.delete_item(input).await,
            ToolName::GetHistory => self.history(input).await,
            ToolName::GetComments => self.comments(input).await,
            ToolName::AddComment => self.add_comment(input).await,
        };
        match result {
            Ok(text) => text,
            Err(err) => {
                tracing::warn!(%tool, error = %err, "tool failed");
                format!("Failed to {}: {err}", tool.action())
            }
        }
    }

    async fn login(&self) -> AdoResult<String> {
        if self.tokens.token(AcquireMode::Silent).await.is_ok() {
            return Ok("Already authenticated with Azure DevOps.".into());
        }
        self.tokens.token(AcquireMode::DeviceCode).await?;
        Ok("Successfully authenticated with Azure DevOps.".into())
    }

    async fn list_projects(&self) -> AdoResult<String> {
        let projects = self.tracker.list_projects().await?;
        if projects.is_empty() {
            return Ok("No projects found in your Azure DevOps organization.".into());
        }
        let list = projects
            .iter()
            .map(|project| {
                format!(
                    "• **{}** ({})\n  {}",
                    project.name,
                    project.state,
                    project.description.as_deref().unwrap_or("No description")
                )
            })
            .collect::<Vec<_>>()
            .join("\n\n");
        Ok(format!("Found {} projects:\n\n{list}", projects.len()))
    }

    fn query(input: Value) -> AdoResult<WorkItemQuery> {
        let params: QueryParams = parse(input)?;
        let wiql = non_blank(params.wiql_query, "WIQL query is required")?;
        let scope = required(
            params.scope,
            "scope is required (organization, project or team)",
        )?;
        let mut query = WorkItemQuery::new(wiql, scope).with_top(params.top.unwrap_or(DEFAULT_TOP));
        query.project_name = params.project_name;
        query.team_name = params.team_name;
        query.scope_path()?;
        Ok(query)
    }

    async fn query_items(&self, input: Value) -> AdoResult<String> {
        let query = Self::query(input)?;
        let items = self.tracker.query_items(&query).await?;
        if items.is_empty() {
            return Ok("No work items found matching the query.".into());
        }
        Ok(format!(
            "Found {} work items:\n\n{}",
            items.len(),
            fenced_json(&items)
        ))
    }

    async fn query_item_tree(&self, input: Value) -> AdoResult<String> {
        let query = Self::query(input)?;
        let forest = self.tracker.query_item_tree(&query).await?;
        if forest.is_empty() {
            return Ok("No work item links found matching the query.".into());
        }
        Ok(format!(
            "Found {} work items in hierarchical structure:\n\n{}",
            count_nodes(&forest),
            fenced_json(&forest)
        ))
    }

    async fn create_item(&self, input: Value) -> AdoResult<String> {
        let params: CreateParams = parse(input)?;
        let missing = "project name, work item type and fields are required";
        let project = non_blank(params.project_name, missing)?;
        let work_item_type = non_blank(params.work_item_type, missing)?;
        let fields = required(params.fields.filter(|f| !f.is_empty()), missing)?;
        let item = self
            .tracker
            .create_item(&project, &work_item_type, &fields)
            .await?;
        Ok(format!("Work item created successfully:\n\n{}", fenced_json(&item)))
    }

    async fn update_item(&self, input: Value) -> AdoResult<String> {
        let params: UpdateParams = parse(input)?;
        let missing = "work item ID and fields are required";
        let id = required(params.work_item_id, missing)?;
        let fields = required(params.fields.filter(|f| !f.is_empty()), missing)?;
        let item = self.tracker.update_item(id, &fields).await?;
        Ok(format!("Work item updated successfully:\n\n{}", fenced_json(&item)))
    }

    async fn delete_item(&self, input: Value) -> AdoResult<String> {
        let params: ItemParams = parse(input)?;
        let id = required(params.work_item_id, "work item ID is required")?;
        self.tracker.delete_item(id).await?;
        Ok(format!("Work item {id} deleted successfully."))
    }

    async fn history(&self, input: Value) -> AdoResult<String> {
        let params: ItemParams = parse(input)?;
        let id = required(params.work_item_id, "work item ID is required")?;
        let history = self.tracker.item_history(id).await?;
        Ok(format!("Work item history retrieved:\n\n{}", fenced_json(&history)))
    }

    async fn comments(&self, input: Value) -> AdoResult<String> {
        let params: ItemParams = parse(input)?;
        let id = required(params.work_item_id, "work item ID is required")?;
        let comments = self.tracker.item_comments(id).await?;
        Ok(format!(
            "Work item comments retrieved ({} comments):\n\n{}",
            comments.len(),
            fenced_json(&comments)
        ))
    }

    async fn add_comment(&self, input: Value) -> AdoResult<String> {
        let params: CommentParams = parse(input)?;
        let missing = "work item ID and comment text are required";
        let id = required(params.work_item_id, missing)?;
        let text = non_blank(params.comment_text, missing)?;
        let comment = self.tracker.add_comment(id, &text).await?;
        Ok(format!("Comment added successfully:\n\n{}", fenced_json(&comment)))
    }
}
