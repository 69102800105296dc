//! Role definitions and the role store seam.
//!
//! Roles are opaque configuration to the engine: a named behavioral profile
//! (prompt, capabilities, constraints) consumed from project settings. The
//! [`RoleStore`] trait is the lookup contract; [`StaticRoleStore`] is the
//! in-memory implementation the roster loader builds.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// A named capability toggled per role.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Capability {
    pub name: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

/// Optional guard rails attached to a role.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RoleConstraints {
    /// Branches the role is allowed to work on. The first one, when
    /// present, is the branch checked out in the role's workspace.
    #[serde(default)]
    pub allowed_branches: Vec<String>,
    /// Paths the role must not touch.
    #[serde(default)]
    pub restricted_paths: Vec<String>,
}

impl RoleConstraints {
    pub fn is_empty(&self) -> bool {
        self.allowed_branches.is_empty() && self.restricted_paths.is_empty()
    }
}

/// A behavioral profile bound to running personas.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RoleDefinition {
    /// Stable identifier (e.g. "navigator").
    pub id: String,
    /// Display name.
    pub name: String,
    /// Scheduling kind (e.g. "worker", "reviewer").
    pub kind: String,
    #[serde(default)]
    pub description: String,
    /// System prompt the persona starts from.
    pub base_prompt: String,
    /// At most one concurrently active runtime when set.
    #[serde(default)]
    pub singleton: bool,
    #[serde(default)]
    pub capabilities: Vec<Capability>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub constraints: Option<RoleConstraints>,
}

impl RoleDefinition {
    /// Names of the enabled capabilities, in declaration order.
    pub fn enabled_capabilities(&self) -> Vec<&str> {
        self.capabilities
            .iter()
            .filter(|c| c.enabled)
            .map(|c| c.name.as_str())
            .collect()
    }
}

/// Lookup contract for role configuration.
pub trait RoleStore: Send + Sync {
    fn get_role(&self, id: &str) -> Option<RoleDefinition>;

    fn roles_by_kind(&self, kind: &str) -> Vec<RoleDefinition>;

    fn all_roles(&self) -> Vec<RoleDefinition>;

    /// Free-text project guidelines folded into the role prompt, if any.
    fn load_guidelines(&self, id: &str) -> Option<String>;
}

/// In-memory role store.
#[derive(Debug, Clone, Default)]
pub struct StaticRoleStore {
    roles: HashMap<String, RoleDefinition>,
    guidelines: HashMap<String, String>,
}

impl StaticRoleStore {
    pub fn new(roles: impl IntoIterator<Item = RoleDefinition>) -> Self {
        Self {
            roles: roles.into_iter().map(|r| (r.id.clone(), r)).collect(),
            guidelines: HashMap::new(),
        }
    }

    /// Attach guidelines text to a role id.
    pub fn with_guidelines(mut self, role_id: impl Into<String>, text: impl Into<String>) -> Self {
        self.guidelines.insert(role_id.into(), text.into());
        self
    }

    pub fn len(&self) -> usize {
        self.roles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.roles.is_empty()
    }
}

impl RoleStore for StaticRoleStore {
    fn get_role(&self, id: &str) -> Option<RoleDefinition> {
        self.roles.get(id).cloned()
    }

    fn roles_by_kind(&self, kind: &str) -> Vec<RoleDefinition> {
        let mut roles: Vec<RoleDefinition> = self
            .roles
            .values()
            .filter(|r| r.kind == kind)
            .cloned()
            .collect();
        roles.sort_by(|a, b| a.id.cmp(&b.id));
        roles
    }

    fn all_roles(&self) -> Vec<RoleDefinition> {
        let mut roles: Vec<RoleDefinition> = self.roles.values().cloned().collect();
        roles.sort_by(|a, b| a.id.cmp(&b.id));
        roles
    }

    fn load_guidelines(&self, id: &str) -> Option<String> {
        self.guidelines.get(id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_role(id: &str, kind: &str) -> RoleDefinition {
        RoleDefinition {
            id: id.to_string(),
            name: id.to_string(),
            kind: kind.to_string(),
            description: String::new(),
            base_prompt: format!("You are {id}."),
            singleton: false,
            capabilities: vec![
                Capability {
                    name: "edit".to_string(),
                    enabled: true,
                },
                Capability {
                    name: "deploy".to_string(),
                    enabled: false,
                },
            ],
            constraints: None,
        }
    }

    #[test]
    fn enabled_capabilities_filters_disabled() {
        let role = sample_role("worker-1", "worker");
        assert_eq!(role.enabled_capabilities(), vec!["edit"]);
    }

    #[test]
    fn store_lookup_by_id_and_kind() {
        let store = StaticRoleStore::new([
            sample_role("worker-1", "worker"),
            sample_role("worker-2", "worker"),
            sample_role("reviewer-1", "reviewer"),
        ]);

        assert!(store.get_role("worker-1").is_some());
        assert!(store.get_role("missing").is_none());

        let workers = store.roles_by_kind("worker");
        assert_eq!(workers.len(), 2);
        assert_eq!(workers[0].id, "worker-1");
        assert_eq!(workers[1].id, "worker-2");

        assert_eq!(store.all_roles().len(), 3);
    }

    #[test]
    fn guidelines_round_trip() {
        let store = StaticRoleStore::new([sample_role("worker-1", "worker")])
            .with_guidelines("worker-1", "Prefer small commits.");
        assert_eq!(
            store.load_guidelines("worker-1").as_deref(),
            Some("Prefer small commits.")
        );
        assert!(store.load_guidelines("missing").is_none());
    }

    #[test]
    fn role_toml_deserializes_with_defaults() {
        let toml_str = r#"
id = "scribe"
name = "Scribe"
kind = "writer"
base_prompt = "You write documentation."
"#;
        let role: RoleDefinition = toml::from_str(toml_str).expect("should parse");
        assert!(!role.singleton);
        assert!(role.capabilities.is_empty());
        assert!(role.constraints.is_none());
    }
}
