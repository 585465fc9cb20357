//! Database model types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle state of an attempt.
///
/// Stored as plain text; values other than the three known states are kept
/// verbatim so callers can extend the vocabulary.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Status {
    #[default]
    Pending,
    Success,
    Failed,
    Other(String),
}

impl Status {
    pub fn as_str(&self) -> &str {
        match self {
            Status::Pending => "pending",
            Status::Success => "success",
            Status::Failed => "failed",
            Status::Other(s) => s.as_str(),
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, Status::Pending)
    }
}

impl From<&str> for Status {
    fn from(s: &str) -> Self {
        match s {
            "pending" => Status::Pending,
            "success" => Status::Success,
            "failed" => Status::Failed,
            other => Status::Other(other.to_string()),
        }
    }
}

impl From<String> for Status {
    fn from(s: String) -> Self {
        Status::from(s.as_str())
    }
}

impl From<Status> for String {
    fn from(s: Status) -> Self {
        s.as_str().to_string()
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One tracked connection attempt against a target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionAttempt {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub host: String,
    pub port: String,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub pass: String,
    #[serde(default)]
    pub status: Status,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub result: String,
    #[serde(default)]
    pub logs: Vec<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub connected_at: Option<DateTime<Utc>>,
}

impl ConnectionAttempt {
    /// A fresh pending attempt with a new unique id.
    pub fn new(target: NewAttempt) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            kind: target.kind,
            host: target.host,
            port: target.port,
            user: target.user,
            pass: target.pass,
            status: Status::Pending,
            message: String::new(),
            result: String::new(),
            logs: Vec::new(),
            created_at: Utc::now(),
            connected_at: None,
        }
    }

    pub fn is_resolved(&self) -> bool {
        !self.status.is_pending()
    }
}

/// Descriptive fields of a target, as supplied by ingestion.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewAttempt {
    #[serde(rename = "type")]
    pub kind: String,
    pub host: String,
    pub port: String,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub pass: String,
}

impl NewAttempt {
    pub fn new(kind: &str, host: &str, port: &str, user: &str, pass: &str) -> Self {
        Self {
            kind: kind.to_string(),
            host: host.to_string(),
            port: port.to_string(),
            user: user.to_string(),
            pass: pass.to_string(),
        }
    }
}
