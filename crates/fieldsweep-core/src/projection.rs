//! Store-side derivation of search documents from aspects.
//!
//! The search index is a projection of the authoritative store: every write
//! that reaches a backend regenerates the entity's document through
//! [`project`]. Documents written by older projector versions may lack
//! fields that the current one emits; those are what sweeps repair.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::aspect::POLICY_INFO_ASPECT_NAME;
use crate::urn::POLICY_ENTITY_NAME;

/// A search index document: a flat JSON object keyed by field name.
pub type SearchDocument = serde_json::Map<String, Value>;

/// Who a policy applies to.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PolicyActors {
    pub users: Vec<String>,
    pub groups: Vec<String>,
    pub roles: Vec<String>,
    pub all_users: bool,
    pub all_groups: bool,
    pub resource_owners: bool,
}

/// Typed view of a `dataHubPolicyInfo` payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyInfo {
    pub display_name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(rename = "type")]
    pub policy_type: String,
    pub state: String,
    #[serde(default)]
    pub privileges: Vec<String>,
    #[serde(default)]
    pub actors: PolicyActors,
    #[serde(default = "default_editable")]
    pub editable: bool,
    #[serde(default)]
    pub last_updated_timestamp: Option<u64>,
}

fn default_editable() -> bool {
    true
}

impl PolicyInfo {
    /// Search document for this policy.
    pub fn to_document(&self) -> SearchDocument {
        let mut doc = SearchDocument::new();
        doc.insert("name".into(), Value::from(self.display_name.clone()));
        if let Some(description) = &self.description {
            doc.insert("description".into(), Value::from(description.clone()));
        }
        doc.insert("type".into(), Value::from(self.policy_type.clone()));
        doc.insert("state".into(), Value::from(self.state.clone()));
        doc.insert("editable".into(), Value::from(self.editable));
        doc.insert("privilege".into(), Value::from(self.privileges.clone()));
        doc.insert("users".into(), Value::from(self.actors.users.clone()));
        doc.insert("groups".into(), Value::from(self.actors.groups.clone()));
        doc.insert("roles".into(), Value::from(self.actors.roles.clone()));
        doc.insert("allUsers".into(), Value::from(self.actors.all_users));
        doc.insert("allGroups".into(), Value::from(self.actors.all_groups));
        doc.insert(
            "resourceOwners".into(),
            Value::from(self.actors.resource_owners),
        );
        if let Some(ts) = self.last_updated_timestamp {
            doc.insert("lastUpdatedTimestamp".into(), Value::from(ts));
        }
        doc
    }
}

/// Result of running the projector for one write.
#[derive(Debug, Clone, PartialEq)]
pub enum Projection {
    /// The entity is indexed; replace its document with this one.
    Document(SearchDocument),
    /// The aspect does not feed the index.
    NotIndexed,
    /// The payload does not decode as its declared aspect.
    Invalid(String),
}

/// Derive the search document for an entity from one aspect payload.
pub fn project(entity_type: &str, aspect_name: &str, value: &Value) -> Projection {
    match (entity_type, aspect_name) {
        (POLICY_ENTITY_NAME, POLICY_INFO_ASPECT_NAME) => {
            match serde_json::from_value::<PolicyInfo>(value.clone()) {
                Ok(info) => Projection::Document(info.to_document()),
                Err(e) => Projection::Invalid(e.to_string()),
            }
        }
        _ => Projection::NotIndexed,
    }
}
