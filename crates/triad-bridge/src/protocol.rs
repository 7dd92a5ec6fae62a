use serde::{Deserialize, Serialize};

use triad_core::types::{AgentModels, JobOverrides, JobRequest, SourceSpec};

/// Messages a subscribed client may send over its job stream.
///
/// The first frame after bind must be `start`; a `cancel` frame may follow
/// at any point while the job is live. Everything the server sends back is
/// a [`ProgressEvent`](triad_core::types::ProgressEvent) record.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Start(JobStartRequest),
    Cancel,
}

/// Wire shape of the job-start message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobStartRequest {
    /// Remote repository URL or local directory path.
    pub source: String,
    pub objective: String,
    #[serde(default)]
    pub agent_models: AgentModels,
    #[serde(default)]
    pub config: JobOverrides,
}

impl JobStartRequest {
    pub fn into_job_request(self) -> JobRequest {
        JobRequest {
            source: SourceSpec::parse(&self.source),
            objective: self.objective,
            agent_models: self.agent_models,
            overrides: self.config,
        }
    }
}

/// JSON error frame for protocol-level failures (e.g. an unparseable first
/// message), before a job exists to emit events for.
pub fn error_frame(message: &str) -> String {
    serde_json::json!({ "type": "protocol_error", "message": message }).to_string()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_message_parses_wire_shape() {
        let raw = r#"{
            "type": "start",
            "source": "https://github.com/acme/app.git",
            "objective": "add a readme",
            "agent_models": {
                "primary-1": "claude-sonnet-4",
                "primary-2": "gemini-2.5-pro",
                "primary-3": "gpt-4.1-mini",
                "integrator": "gemini-2.5-pro"
            }
        }"#;
        let msg: ClientMessage = serde_json::from_str(raw).unwrap();
        let ClientMessage::Start(start) = msg else {
            panic!("expected start");
        };
        assert_eq!(start.objective, "add a readme");
        assert_eq!(start.agent_models.primary_1.as_deref(), Some("claude-sonnet-4"));

        let request = start.into_job_request();
        assert!(matches!(request.source, SourceSpec::Remote { .. }));
    }

    #[test]
    fn start_message_defaults_optional_sections() {
        let raw = r#"{"type":"start","source":"/tmp/src","objective":"fix the bug"}"#;
        let msg: ClientMessage = serde_json::from_str(raw).unwrap();
        let ClientMessage::Start(start) = msg else {
            panic!("expected start");
        };
        assert!(start.agent_models.primary_1.is_none());
        assert!(!start.config.keep_workspaces);
        assert!(matches!(
            start.clone().into_job_request().source,
            SourceSpec::Local { .. }
        ));
    }

    #[test]
    fn cancel_message_parses() {
        let msg: ClientMessage = serde_json::from_str(r#"{"type":"cancel"}"#).unwrap();
        assert!(matches!(msg, ClientMessage::Cancel));
    }

    #[test]
    fn error_frame_is_json() {
        let frame = error_frame("bad message");
        let value: serde_json::Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(value["type"], "protocol_error");
        assert_eq!(value["message"], "bad message");
    }
}
