//! Task and result payload types
//!
//! Tasks are flat JSON objects with a required `id` and any number of
//! project-defined fields. Fields whose key starts with [`SESSION_PREFIX`]
//! are session-only: they never reach the node in plaintext.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Key prefix marking a task field as session-only
pub const SESSION_PREFIX: &str = "#";

/// Task field carrying the encrypted session token
pub const SESSION_TOKEN_FIELD: &str = "__tr_sd__";

/// Result field carrying the decision-search discriminator
pub const DISCRIMINATOR_FIELD: &str = "__tr_result__";

/// Discriminator value: the node found no solution for the task
pub const NO_SOLUTION: u64 = 0x2;

/// Discriminator value: the node skipped the task and wants the next one
pub const NEXT_TASK: u64 = 0x4;

/// Key/value mapping submitted by a node as a result
pub type ResultData = Map<String, Value>;

/// A single unit of work issued to a node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Unique task id within its application
    pub id: String,

    /// Project-defined fields, in insertion order
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl Task {
    /// Create a task with no extension fields
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            fields: Map::new(),
        }
    }

    /// Builder-style field insertion
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    /// Session-only fields, left in place
    pub fn session_fields(&self) -> Map<String, Value> {
        self.fields
            .iter()
            .filter(|(key, _)| is_session_key(key))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect()
    }

    pub fn has_session_fields(&self) -> bool {
        self.fields.keys().any(|key| is_session_key(key))
    }

    /// Remove and return the session-only fields
    pub fn take_session_fields(&mut self) -> Map<String, Value> {
        let keys: Vec<String> = self.fields.keys().filter(|key| is_session_key(key)).cloned().collect();
        let mut taken = Map::new();
        for key in keys {
            if let Some(value) = self.fields.shift_remove(&key) {
                taken.insert(key, value);
            }
        }
        taken
    }

    /// Serialize into the flat JSON object sent to the node
    pub fn to_value(&self) -> Value {
        let mut object = Map::new();
        object.insert("id".to_string(), Value::String(self.id.clone()));
        for (key, value) in &self.fields {
            object.insert(key.clone(), value.clone());
        }
        Value::Object(object)
    }
}

/// Check if a field name follows the session-only naming convention
pub fn is_session_key(key: &str) -> bool {
    key.starts_with(SESSION_PREFIX)
}

/// Read the decision-search discriminator from a raw result, if present
pub fn discriminator(result: &ResultData) -> Option<&Value> {
    result.get(DISCRIMINATOR_FIELD)
}

/// Treat JSON null, empty objects, empty arrays and empty strings as "nothing to store"
pub fn is_null_result(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Object(map) => map.is_empty(),
        Value::Array(items) => items.is_empty(),
        Value::String(s) => s.is_empty(),
        _ => false,
    }
}
