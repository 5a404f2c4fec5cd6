//! Audit records for executed operations
//!
//! A record is registered when an operator starts, updated as each command
//! begins, and finalized as completed or cancelled. A cancelled record keeps
//! the failing command and its error so the log alone explains the failure.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle state of a record
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RecordStatus {
    /// Registered, no command started yet
    #[default]
    New,
    /// A command is executing
    Running,
    /// Stopped before finishing, usually by an error
    Cancelled,
    /// Every command finished
    Completed,
}

impl std::fmt::Display for RecordStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::New => write!(f, "new"),
            Self::Running => write!(f, "running"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::Completed => write!(f, "completed"),
        }
    }
}

/// Description of one command, as stored in a record
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct Command {
    /// Command name (e.g. "image-pull")
    pub name: String,
    /// What the command acts on (node address, container, resource key)
    #[serde(default)]
    pub target: String,
    /// Free-form detail
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub detail: String,
}

impl Command {
    /// Create a command description
    pub fn new(name: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            target: target.into(),
            detail: String::new(),
        }
    }

    /// Attach detail text
    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = detail.into();
        self
    }
}

impl std::fmt::Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.name, self.target)?;
        if !self.detail.is_empty() {
            write!(f, " ({})", self.detail)?;
        }
        Ok(())
    }
}

/// One entry of the operation log
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct Record {
    /// Monotonically increasing identifier
    pub id: i64,
    /// Lifecycle state
    pub status: RecordStatus,
    /// Operator name
    pub operation: String,
    /// Node addresses or object keys affected
    #[serde(default)]
    pub targets: Vec<String>,
    /// The command running or last run
    #[serde(default)]
    pub command: Command,
    /// Error message of the failed command
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
    /// When the record was registered
    pub start_at: DateTime<Utc>,
    /// When the record was finalized
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_at: Option<DateTime<Utc>>,
}

impl Record {
    /// Create a new record for an operator
    pub fn new(id: i64, operation: impl Into<String>, targets: Vec<String>) -> Self {
        Self {
            id,
            status: RecordStatus::New,
            operation: operation.into(),
            targets,
            command: Command::default(),
            error: String::new(),
            start_at: Utc::now(),
            end_at: None,
        }
    }

    /// Mark a command as started
    pub fn set_command(&mut self, command: Command) {
        self.status = RecordStatus::Running;
        self.command = command;
    }

    /// Finalize the record after a failed command
    pub fn set_error(&mut self, error: impl std::fmt::Display) {
        self.status = RecordStatus::Cancelled;
        self.error = error.to_string();
        self.end_at = Some(Utc::now());
    }

    /// Finalize the record without error
    pub fn complete(&mut self) {
        self.status = RecordStatus::Completed;
        self.end_at = Some(Utc::now());
    }

    /// Finalize the record as cancelled without running further commands
    pub fn cancel(&mut self) {
        self.status = RecordStatus::Cancelled;
        self.end_at = Some(Utc::now());
    }

    /// True once the record has been completed or cancelled
    pub fn is_finished(&self) -> bool {
        matches!(self.status, RecordStatus::Completed | RecordStatus::Cancelled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifecycle_through_failure() {
        let mut r = Record::new(7, "etcd-bootstrap", vec!["10.0.0.1".to_string()]);
        assert_eq!(r.status, RecordStatus::New);
        assert!(!r.is_finished());

        r.set_command(Command::new("image-pull", "10.0.0.1").with_detail("etcd"));
        assert_eq!(r.status, RecordStatus::Running);

        r.set_error("connection reset");
        assert_eq!(r.status, RecordStatus::Cancelled);
        assert_eq!(r.error, "connection reset");
        assert_eq!(r.command.name, "image-pull");
        assert!(r.end_at.is_some());
        assert!(r.is_finished());
    }

    #[test]
    fn serialized_form_is_stable() {
        let mut r = Record::new(1, "upgrade", vec![]);
        r.complete();
        let json = serde_json::to_value(&r).unwrap();
        assert_eq!(json["status"], "completed");
        assert_eq!(json["operation"], "upgrade");
        assert!(json.get("error").is_none());

        let back: Record = serde_json::from_value(json).unwrap();
        assert_eq!(back, r);
    }

    #[test]
    fn command_display() {
        let c = Command::new("run-container", "10.0.0.2").with_detail("kube-apiserver");
        assert_eq!(c.to_string(), "run-container 10.0.0.2 (kube-apiserver)");
        assert_eq!(Command::new("wait", "etcd").to_string(), "wait etcd");
    }
}
