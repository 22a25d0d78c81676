//! Serializable descriptions of side-effecting operations.

use serde::{Deserialize, Serialize};

/// Operation kind used to route a command to its handler.
///
/// Serializes as a plain string: `create`, `update`, `delete`, or the custom
/// tag itself (e.g. `ledger.upsert`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum OperationKind {
    Create,
    Update,
    Delete,
    Custom(String),
}

impl OperationKind {
    pub fn custom(kind: impl Into<String>) -> Self {
        Self::from(kind.into())
    }

    pub fn as_str(&self) -> &str {
        match self {
            OperationKind::Create => "create",
            OperationKind::Update => "update",
            OperationKind::Delete => "delete",
            OperationKind::Custom(kind) => kind,
        }
    }
}

impl From<String> for OperationKind {
    fn from(value: String) -> Self {
        match value.as_str() {
            "create" => Self::Create,
            "update" => Self::Update,
            "delete" => Self::Delete,
            _ => Self::Custom(value),
        }
    }
}

impl From<OperationKind> for String {
    fn from(value: OperationKind) -> Self {
        match value {
            OperationKind::Custom(kind) => kind,
            other => other.as_str().to_string(),
        }
    }
}

impl std::fmt::Display for OperationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Plain-data command: what to do and the data needed to do it again.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    pub kind: OperationKind,
    pub payload: serde_json::Value,
}

impl Command {
    pub fn new(kind: OperationKind, payload: serde_json::Value) -> Self {
        Self { kind, payload }
    }
}
