//! Per-persona memory: short-term and working maps plus an append-only
//! fact list.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// One remembered fact.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Fact {
    pub content: String,
    pub recorded_at: DateTime<Utc>,
}

/// Memory attached to a persona runtime.
///
/// Short-term entries are scratch state for the current exchange; working
/// entries persist across exchanges; facts only ever accumulate.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PersonaMemory {
    short_term: HashMap<String, serde_json::Value>,
    working: HashMap<String, serde_json::Value>,
    facts: Vec<Fact>,
}

impl PersonaMemory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_short_term(&mut self, key: impl Into<String>, value: serde_json::Value) {
        self.short_term.insert(key.into(), value);
    }

    pub fn short_term(&self, key: &str) -> Option<&serde_json::Value> {
        self.short_term.get(key)
    }

    pub fn clear_short_term(&mut self) {
        self.short_term.clear();
    }

    pub fn set_working(&mut self, key: impl Into<String>, value: serde_json::Value) {
        self.working.insert(key.into(), value);
    }

    pub fn working(&self, key: &str) -> Option<&serde_json::Value> {
        self.working.get(key)
    }

    /// Append a fact; facts are never removed.
    pub fn record_fact(&mut self, content: impl Into<String>) {
        self.facts.push(Fact {
            content: content.into(),
            recorded_at: Utc::now(),
        });
    }

    pub fn facts(&self) -> &[Fact] {
        &self.facts
    }

    pub fn short_term_len(&self) -> usize {
        self.short_term.len()
    }

    pub fn working_len(&self) -> usize {
        self.working.len()
    }
}
