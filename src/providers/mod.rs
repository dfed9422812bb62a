pub mod azure_devops;

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Map, Value};

use crate::auth::TokenSource;
use crate::config::AppConfig;
use crate::error::{AdoError, AdoResult};
use crate::model::comment::Comment;
use crate::model::history::WorkItemHistory;
use crate::model::project::Project;
use crate::model::tree::WorkItemTreeNode;
use crate::model::work_item::WorkItem;

pub const DEFAULT_TOP: usize = 50;

/// Where a work item query runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScopeKind {
    Organization,
    Project,
    Team,
}

/// A WIQL query plus the identifiers its scope needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkItemQuery {
    pub wiql: String,
    pub scope: ScopeKind,
    pub project_name: Option<String>,
    pub team_name: Option<String>,
    pub top: usize,
}

impl WorkItemQuery {
    pub fn new(wiql: impl Into<String>, scope: ScopeKind) -> Self {
        Self {
            wiql: wiql.into(),
            scope,
            project_name: None,
            team_name: None,
            top: DEFAULT_TOP,
        }
    }

    pub fn with_top(mut self, top: usize) -> Self {
        self.top = top;
        self
    }

    /// Path segments between the organization and `_apis`, checked against
    /// the scope. Blank names count as missing.
    pub fn scope_path(&self) -> AdoResult<Vec<&str>> {
        let project = self.project_name.as_deref().filter(|p| !p.trim().is_empty());
        let team = self.team_name.as_deref().filter(|t| !t.trim().is_empty());
        match self.scope {
            ScopeKind::Organization => Ok(Vec::new()),
            ScopeKind::Project => match project {
                Some(project) => Ok(vec![project]),
                None => Err(AdoError::validation(
                    "Project name is required when scope is 'project'",
                )),
            },
            ScopeKind::Team => match (project, team) {
                (Some(project), Some(team)) => Ok(vec![project, team]),
                _ => Err(AdoError::validation(
                    "Project name and team name are required when scope is 'team'",
                )),
            },
        }
    }
}

/// One client per remote work tracking service.
///
/// Mutating calls fail with [`AdoError::Readonly`] before touching the
/// network when readonly mode is on. Every call fails with
/// [`AdoError::Configuration`] while no organization is set.
#[async_trait]
pub trait WorkTracker: Send + Sync {
    fn organization(&self) -> Option<String>;
    fn set_organization(&self, url: &str);
    fn is_readonly(&self) -> bool;
    fn set_readonly(&self, readonly: bool);

    async fn list_projects(&self) -> AdoResult<Vec<Project>>;
    async fn query_items(&self, query: &WorkItemQuery) -> AdoResult<Vec<WorkItem>>;
    async fn query_item_tree(&self, query: &WorkItemQuery) -> AdoResult<Vec<WorkItemTreeNode>>;
    async fn create_item(
        &self,
        project: &str,
        work_item_type: &str,
        fields: &Map<String, Value>,
    ) -> AdoResult<WorkItem>;
    async fn update_item(&self, id: i64, fields: &Map<String, Value>) -> AdoResult<WorkItem>;
    async fn delete_item(&self, id: i64) -> AdoResult<()>;
    async fn item_history(&self, id: i64) -> AdoResult<WorkItemHistory>;
    async fn item_comments(&self, id: i64) -> AdoResult<Vec<Comment>>;
    async fn add_comment(&self, id: i64, text: &str) -> AdoResult<Comment>;

    /// Reachability check. Remote failures are logged, not returned.
    async fn test_connection(&self) -> bool;
}


pub fn create_tracker(
    config: &AppConfig,
    http: reqwest::Client,
    tokens: Arc<dyn TokenSource>,
) -> Arc<dyn WorkTracker> {
    let client = azure_devops::AzureDevOpsClient::new(http, tokens);
    if let Some(url) = &config.organization_url {
        client.set_organization(url);
    }
    client.set_readonly(config.readonly);
    Arc::new(client)
}
