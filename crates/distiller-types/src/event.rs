use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Notification published to display collaborators.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    pub properties: Value,
}

impl JobEvent {
    pub fn new(event_type: impl Into<String>, properties: Value) -> Self {
        Self {
            event_type: event_type.into(),
            properties,
        }
    }

    pub fn job_id(&self) -> Option<&str> {
        self.properties.get("jobID").and_then(Value::as_str)
    }
}
