//! Wire types exchanged with the worker.
//!
//! Everything on the pipes is newline-delimited JSON. Inbound, the worker
//! writes delta lines while it runs and a status object as its last line.
//! Outbound, the host writes one [`WorkerCommand`] per line on stdin.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One batch of framed delta lines, in arrival order.
///
/// Each entry is an opaque JSON document; this crate never looks inside.
pub type DeltaBatch = Vec<String>;

/// Final status object printed by the worker before it exits.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusEnvelope {
    /// Raw error code, e.g. `ErrorAuthentication`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Service the error relates to (`imap`, `smtp`, ...).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_service: Option<String>,
    /// Worker log excerpt. May contain secrets.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log: Option<String>,
}

impl StatusEnvelope {
    /// Reads the status fields out of an arbitrary JSON object.
    ///
    /// Non-string fields are treated as absent.
    #[must_use]
    pub fn from_value(value: &Value) -> Self {
        let field = |name: &str| value.get(name).and_then(Value::as_str).map(str::to_string);
        Self {
            error: field("error"),
            error_service: field("error_service"),
            log: field("log"),
        }
    }
}

/// Command sent to a running sync worker over stdin.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum WorkerCommand {
    /// Hand a task to the worker.
    QueueTask {
        /// Serialized task record.
        task: Value,
    },
    /// Cancel a previously queued task.
    CancelTask {
        /// Id of the task.
        #[serde(rename = "taskId")]
        task_id: String,
    },
    /// Ask all worker threads to sync now.
    WakeWorkers,
    /// Request message bodies to be fetched.
    NeedBodies {
        /// Message ids.
        ids: Vec<String>,
    },
    /// Any other JSON document, written as-is.
    #[serde(untagged)]
    Raw(Value),
}

impl WorkerCommand {
    /// Serializes the command as one newline-terminated line.
    ///
    /// # Errors
    ///
    /// Returns an error if a contained value cannot be serialized.
    pub fn to_line(&self) -> serde_json::Result<Vec<u8>> {
        let mut line = serde_json::to_vec(self)?;
        line.push(b'\n');
        Ok(line)
    }
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::redundant_clone,
    clippy::manual_string_new,
    clippy::needless_collect,
    clippy::unreadable_literal,
    clippy::used_underscore_items,
    clippy::similar_names
)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_status_from_value() {
        let status = StatusEnvelope::from_value(&json!({
            "error": "ErrorParse",
            "error_service": "imap",
            "log": 7,
        }));
        assert_eq!(status.error.as_deref(), Some("ErrorParse"));
        assert_eq!(status.error_service.as_deref(), Some("imap"));
        assert_eq!(status.log, None);

        assert_eq!(StatusEnvelope::from_value(&json!([1, 2])), StatusEnvelope::default());
    }

    #[test]
    fn test_command_lines() {
        let line = WorkerCommand::WakeWorkers.to_line().unwrap();
        assert_eq!(line, b"{\"type\":\"wake-workers\"}\n");

        let line = WorkerCommand::CancelTask {
            task_id: "t1".into(),
        }
        .to_line()
        .unwrap();
        assert_eq!(line, b"{\"type\":\"cancel-task\",\"taskId\":\"t1\"}\n");

        let line = WorkerCommand::NeedBodies {
            ids: vec!["a".into(), "b".into()],
        }
        .to_line()
        .unwrap();
        assert_eq!(line, b"{\"type\":\"need-bodies\",\"ids\":[\"a\",\"b\"]}\n");
    }

    #[test]
    fn test_queue_task_and_raw() {
        let line = WorkerCommand::QueueTask {
            task: json!({"id": "t9"}),
        }
        .to_line()
        .unwrap();
        let parsed: Value = serde_json::from_slice(&line).unwrap();
        assert_eq!(parsed, json!({"type": "queue-task", "task": {"id": "t9"}}));

        let line = WorkerCommand::Raw(json!({"type": "custom", "n": 1}))
            .to_line()
            .unwrap();
        let parsed: Value = serde_json::from_slice(&line).unwrap();
        assert_eq!(parsed, json!({"type": "custom", "n": 1}));
    }
}
