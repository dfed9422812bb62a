use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::comment::IdentityRef;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct FieldChange {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub old_value: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new_value: Option<Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelationChanges {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub added: Option<Vec<Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub removed: Option<Vec<Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated: Option<Vec<Value>>,
}

/// One revision entry from the `updates` sub-resource.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct WorkItemUpdate {
    pub id: i64,
    pub rev: i64,
    pub revised_by: IdentityRef,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub revised_date: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fields: Option<Map<String, Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub relations: Option<RelationChanges>,
    pub url: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkItemHistory {
    pub work_item_id: i64,
    pub updates: Vec<WorkItemUpdate>,
}

impl WorkItemUpdate {
    /// Field changes decoded into old/new pairs. Entries of another shape are skipped.
    pub fn field_changes(&self) -> Vec<(String, FieldChange)> {
        self.fields
            .iter()
            .flatten()
            .filter_map(|(name, change)| {
                serde_json::from_value::<FieldChange>(change.clone())
                    .ok()
                    .map(|change| (name.clone(), change))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decodes_revision_with_field_changes() {
        let update: WorkItemUpdate = serde_json::from_value(json!({
            "id": 2,
            "rev": 2,
            "revisedBy": {"displayName": "Ops Bot", "uniqueName": "bot@contoso.com", "id": "b1"},
            "revisedDate": "2025-02-01T00:00:00Z",
            "fields": {"System.State": {"oldValue": "New", "newValue": "Active"}},
            "url": "https://dev.azure.com/org/_apis/wit/workItems/7/updates/2"
        }))
        .unwrap();
        let changes = update.field_changes();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].0, "System.State");
        assert_eq!(changes[0].1.new_value, Some(json!("Active")));
        assert!(update.relations.is_none());
    }

    #[test]
    fn bare_revision_decodes_with_defaults() {
        let update: WorkItemUpdate = serde_json::from_value(json!({"id": 1})).unwrap();
        assert_eq!(update.rev, 0);
        assert_eq!(update.revised_by, IdentityRef::default());
        assert!(update.field_changes().is_empty());
    }
}
