use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A typed link from `relations[]` on a work item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItemLink {
    pub rel: String,
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attributes: Option<Value>,
}

/// Snapshot of a work item as returned by one fetch.
///
/// The well-known fields are pulled out of the raw `fields` map by their
/// reference names. `fields` keeps every raw value, including custom fields
/// defined by the organization.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkItem {
    pub id: i64,
    pub title: String,
    pub work_item_type: String,
    pub state: String,
    pub url: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub assigned_to: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_by: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub changed_by: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_date: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub changed_date: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub activated_date: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolved_date: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub closed_date: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub area_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub iteration_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub team_project: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub acceptance_criteria: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reproduction_steps: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_info: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tags: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub story_points: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub effort: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub original_estimate: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remaining_work: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_work: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub activity: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub severity: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub risk: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub business_value: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time_criticality: Option<f64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub found_in: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub integrated_in: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent: Option<i64>,

    #[serde(default)]
    pub links: Vec<WorkItemLink>,

    #[serde(default)]
    pub fields: Map<String, Value>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub rev: Option<i64>,
    #[serde(rename = "_links", skip_serializing_if = "Option::is_none")]
    pub api_links: Option<Value>,
}

impl WorkItem {
    /// Map a raw `workitems` API record. Never fails: anything missing or of
    /// an unexpected shape becomes an empty default.
    pub fn from_api(raw: &Value) -> Self {
        let fields = raw
            .get("fields")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();
        let text = |name: &str| fields.get(name).and_then(value_as_string);
        let number = |name: &str| fields.get(name).and_then(Value::as_f64);
        let identity = |name: &str| fields.get(name).and_then(identity_display_name);

        let links = raw
            .get("relations")
            .and_then(Value::as_array)
            .map(|relations| {
                relations
                    .iter()
                    .map(|relation| WorkItemLink {
                        rel: relation
                            .get("rel")
                            .and_then(Value::as_str)
                            .unwrap_or_default()
                            .to_string(),
                        url: relation
                            .get("url")
                            .and_then(Value::as_str)
                            .unwrap_or_default()
                            .to_string(),
                        attributes: relation.get("attributes").cloned(),
                    })
                    .collect()
            })
            .unwrap_or_default();

        WorkItem {
            id: raw.get("id").and_then(Value::as_i64).unwrap_or_default(),
            title: text("System.Title").unwrap_or_default(),
            work_item_type: text("System.WorkItemType").unwrap_or_default(),
            state: text("System.State").unwrap_or_default(),
            url: raw
                .pointer("/_links/html/href")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),

            assigned_to: identity("System.AssignedTo"),
            created_by: identity("System.CreatedBy"),
            changed_by: identity("System.ChangedBy"),
            created_date: text("System.CreatedDate"),
            changed_date: text("System.ChangedDate"),
            activated_date: text("Microsoft.VSTS.Common.ActivatedDate"),
            resolved_date: text("Microsoft.VSTS.Common.ResolvedDate"),
            closed_date: text("Microsoft.VSTS.Common.ClosedDate"),

            area_path: text("System.AreaPath"),
            iteration_path: text("System.IterationPath"),
            team_project: text("System.TeamProject"),
            description: text("System.Description"),
            acceptance_criteria: text("Microsoft.VSTS.Common.AcceptanceCriteria"),
            reproduction_steps: text("Microsoft.VSTS.TCM.ReproSteps"),
            system_info: text("Microsoft.VSTS.TCM.SystemInfo"),
            tags: text("System.Tags"),

            story_points: number("Microsoft.VSTS.Scheduling.StoryPoints"),
            effort: number("Microsoft.VSTS.Scheduling.Effort"),
            original_estimate: number("Microsoft.VSTS.Scheduling.OriginalEstimate"),
            remaining_work: number("Microsoft.VSTS.Scheduling.RemainingWork"),
            completed_work: number("Microsoft.VSTS.Scheduling.CompletedWork"),
            activity: text("Microsoft.VSTS.Common.Activity"),

            priority: fields
                .get("Microsoft.VSTS.Common.Priority")
                .and_then(Value::as_i64),
            severity: text("Microsoft.VSTS.Common.Severity"),
            risk: text("Microsoft.VSTS.Common.Risk"),
            business_value: number("Microsoft.VSTS.Common.BusinessValue"),
            time_criticality: number("Microsoft.VSTS.Common.TimeCriticality"),

            found_in: text("Microsoft.VSTS.Build.FoundIn"),
            integrated_in: text("Microsoft.VSTS.Build.IntegrationBuild"),

            parent: fields.get("System.Parent").and_then(Value::as_i64),

            links,
            rev: raw.get("rev").and_then(Value::as_i64),
            api_links: raw.get("_links").cloned(),
            fields,
        }
    }

    /// Raw value of any field by reference name, custom fields included.
    pub fn field(&self, reference_name: &str) -> Option<&Value> {
        self.fields.get(reference_name)
    }

    pub fn field_str(&self, reference_name: &str) -> Option<&str> {
        self.field(reference_name).and_then(Value::as_str)
    }

    /// Decode a raw field into a concrete type; `None` when absent or mistyped.
    pub fn field_as<T: DeserializeOwned>(&self, reference_name: &str) -> Option<T> {
        self.field(reference_name)
            .and_then(|value| serde_json::from_value(value.clone()).ok())
    }
}

fn value_as_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

// Identity fields come back either as an identity object or a plain string.
fn identity_display_name(value: &Value) -> Option<String> {
    match value {
        Value::Object(identity) => identity
            .get("displayName")
            .and_then(Value::as_str)
            .filter(|name| !name.is_empty())
            .or_else(|| identity.get("uniqueName").and_then(Value::as_str))
            .map(String::from),
        Value::String(s) => Some(s.clone()),
        _ => None,
    }
}
