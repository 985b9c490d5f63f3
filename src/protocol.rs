use serde::{Deserialize, Serialize};

pub const NDJSON_CONTENT_TYPE: &str = "application/x-ndjson";

/// One line of the agent's NDJSON reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    MessageChunk {
        content: String,
    },
    ToolCall {
        #[serde(rename = "activeForm")]
        active_form: String,
    },
    Done {
        #[serde(default)]
        message: String,
    },
    Error {
        message: String,
    },
    // Reserved by the agent; carried through but not acted on.
    Actions {
        #[serde(default)]
        actions: Vec<serde_json::Value>,
    },
    #[serde(other)]
    Unknown,
}

impl StreamEvent {
    /// Encodes the event as a single newline-terminated NDJSON line.
    pub fn to_line(&self) -> Result<String, serde_json::Error> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Routing context sent alongside the conversation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatContext {
    // Absent ids decode as empty; the server rejects them in validation.
    #[serde(default)]
    pub report_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatRequest {
    pub messages: Vec<ChatMessage>,
    #[serde(flatten)]
    pub context: ChatContext,
}

/// JSON body carried by non-2xx replies.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_wire_field_names() {
        let event: StreamEvent =
            serde_json::from_str(r#"{"type":"tool_call","activeForm":"Querying metrics"}"#)
                .unwrap();
        assert_eq!(
            event,
            StreamEvent::ToolCall {
                active_form: "Querying metrics".to_string()
            }
        );

        let done: StreamEvent = serde_json::from_str(r#"{"type":"done"}"#).unwrap();
        assert_eq!(
            done,
            StreamEvent::Done {
                message: String::new()
            }
        );
    }

    #[test]
    fn unrecognized_type_decodes_as_unknown() {
        let event: StreamEvent =
            serde_json::from_str(r#"{"type":"heartbeat","ts":1}"#).unwrap();
        assert_eq!(event, StreamEvent::Unknown);
    }

    #[test]
    fn missing_type_is_rejected() {
        assert!(serde_json::from_str::<StreamEvent>(r#"{"content":"x"}"#).is_err());
    }

    #[test]
    fn to_line_is_newline_terminated() {
        let line = StreamEvent::Error {
            message: "boom".to_string(),
        }
        .to_line()
        .unwrap();
        assert_eq!(line, "{\"type\":\"error\",\"message\":\"boom\"}\n");
    }

    #[test]
    fn request_flattens_context_in_camel_case() {
        let request = ChatRequest {
            messages: vec![ChatMessage::user("why is checkout failing?")],
            context: ChatContext {
                report_id: "rpt-42".to_string(),
                project: Some("shop".to_string()),
                ..Default::default()
            },
        };

        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(
            value,
            serde_json::json!({
                "messages": [{"role": "user", "content": "why is checkout failing?"}],
                "reportId": "rpt-42",
                "project": "shop",
            })
        );

        let back: ChatRequest = serde_json::from_value(value).unwrap();
        assert_eq!(back, request);
    }

    #[test]
    fn missing_report_id_decodes_as_empty() {
        let request: ChatRequest = serde_json::from_value(serde_json::json!({
            "messages": [{"role": "user", "content": "hi"}],
        }))
        .unwrap();

        assert_eq!(request.context.report_id, "");
        assert_eq!(request.messages, vec![ChatMessage::user("hi")]);
    }
}
