//! TOML format types for roster definition files.
//!
//! A roster file declares the roles available to the engine and a batch of
//! tasks to run against them. It deserializes via `serde` + the `toml`
//! crate and validates to a role store, a default role-kind mapping, and a
//! topologically ordered task list.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::persona::{RoleDefinition, StaticRoleStore};
use crate::scheduler::TaskPriority;

/// Errors raised while loading or validating a roster file.
#[derive(Debug, Error)]
pub enum RosterError {
    #[error("failed to read roster file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse roster TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid roster: {0}")]
    Invalid(String),
}

/// Top-level structure of a `roster.toml` file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RosterToml {
    pub roster: RosterMeta,
    #[serde(default)]
    pub roles: Vec<RoleToml>,
    #[serde(default)]
    pub tasks: Vec<TaskToml>,
}

/// Roster-level metadata in `[roster]`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RosterMeta {
    /// Human-readable roster name.
    pub name: String,
    /// Repository agents work against; defaults to the current directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repo: Option<PathBuf>,
    /// Agent runtime binary override.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime_command: Option<String>,
    /// Global active-persona cap override.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_active_personas: Option<usize>,
    /// Per-role-kind active-persona caps.
    #[serde(default)]
    pub per_kind_caps: HashMap<String, usize>,
}

/// A single `[[roles]]` entry: a role definition plus roster-only extras.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RoleToml {
    #[serde(flatten)]
    pub role: RoleDefinition,
    /// Project guidelines folded into the role prompt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guidelines: Option<String>,
}

/// A single `[[tasks]]` entry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskToml {
    /// Unique task name within the roster (referenced by `depends_on`).
    pub name: String,
    /// Role kind the task targets.
    pub kind: String,
    /// What the task should accomplish.
    pub description: String,
    #[serde(default)]
    pub priority: TaskPriority,
    /// Names of tasks that must complete first.
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Pin the task to a singleton role's runtime.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pinned_persona: Option<String>,
}

impl RosterToml {
    /// Parse a roster from TOML text.
    pub fn parse(text: &str) -> Result<Self, RosterError> {
        Ok(toml::from_str(text)?)
    }

    /// Read and parse a roster file.
    pub fn load(path: &Path) -> Result<Self, RosterError> {
        let text = std::fs::read_to_string(path).map_err(|source| RosterError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&text)
    }

    /// Check internal consistency: unique role ids and task names, known
    /// role kinds, resolvable dependencies, no dependency cycles, pinned
    /// personas referring to singleton roles.
    pub fn validate(&self) -> Result<(), RosterError> {
        let mut role_ids = HashSet::new();
        for entry in &self.roles {
            if !role_ids.insert(entry.role.id.as_str()) {
                return Err(RosterError::Invalid(format!(
                    "duplicate role id: {}",
                    entry.role.id
                )));
            }
        }

        let kinds: HashSet<&str> = self.roles.iter().map(|r| r.role.kind.as_str()).collect();

        let mut task_names = HashSet::new();
        for task in &self.tasks {
            if !task_names.insert(task.name.as_str()) {
                return Err(RosterError::Invalid(format!(
                    "duplicate task name: {}",
                    task.name
                )));
            }
            if !kinds.contains(task.kind.as_str()) {
                return Err(RosterError::Invalid(format!(
                    "task {} targets unknown role kind: {}",
                    task.name, task.kind
                )));
            }
            if let Some(pinned) = &task.pinned_persona {
                let singleton = self
                    .roles
                    .iter()
                    .any(|r| r.role.id == *pinned && r.role.singleton);
                if !singleton {
                    return Err(RosterError::Invalid(format!(
                        "task {} pins persona {pinned}, which is not a singleton role",
                        task.name
                    )));
                }
            }
        }

        for task in &self.tasks {
            for dep in &task.depends_on {
                if !task_names.contains(dep.as_str()) {
                    return Err(RosterError::Invalid(format!(
                        "task {} depends on unknown task: {dep}",
                        task.name
                    )));
                }
            }
        }

        self.topological_order().map(|_| ())
    }

    /// Tasks in an order where every dependency precedes its dependents.
    /// Fails when the dependency graph has a cycle.
    pub fn topological_order(&self) -> Result<Vec<&TaskToml>, RosterError> {
        let by_name: HashMap<&str, &TaskToml> =
            self.tasks.iter().map(|t| (t.name.as_str(), t)).collect();

        let mut ordered = Vec::with_capacity(self.tasks.len());
        let mut done: HashSet<&str> = HashSet::new();
        let mut in_progress: HashSet<&str> = HashSet::new();

        fn visit<'a>(
            name: &'a str,
            by_name: &HashMap<&'a str, &'a TaskToml>,
            done: &mut HashSet<&'a str>,
            in_progress: &mut HashSet<&'a str>,
            ordered: &mut Vec<&'a TaskToml>,
        ) -> Result<(), RosterError> {
            if done.contains(name) {
                return Ok(());
            }
            if !in_progress.insert(name) {
                return Err(RosterError::Invalid(format!(
                    "dependency cycle involving task: {name}"
                )));
            }
            let task = by_name[name];
            for dep in &task.depends_on {
                if by_name.contains_key(dep.as_str()) {
                    visit(dep, by_name, done, in_progress, ordered)?;
                }
            }
            in_progress.remove(name);
            done.insert(name);
            ordered.push(task);
            Ok(())
        }

        for task in &self.tasks {
            visit(
                task.name.as_str(),
                &by_name,
                &mut done,
                &mut in_progress,
                &mut ordered,
            )?;
        }

        Ok(ordered)
    }

    /// Build the role store, guidelines included.
    pub fn role_store(&self) -> StaticRoleStore {
        let mut store = StaticRoleStore::new(self.roles.iter().map(|r| r.role.clone()));
        for entry in &self.roles {
            if let Some(guidelines) = &entry.guidelines {
                store = store.with_guidelines(entry.role.id.clone(), guidelines.clone());
            }
        }
        store
    }

    /// Fixed role-kind to default-role-id mapping: the first role listed
    /// for each kind.
    pub fn default_roles(&self) -> HashMap<String, String> {
        let mut defaults = HashMap::new();
        for entry in &self.roles {
            defaults
                .entry(entry.role.kind.clone())
                .or_insert_with(|| entry.role.id.clone());
        }
        defaults
    }
}
