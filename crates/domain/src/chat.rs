//! OpenAI chat-completion wire types.
//!
//! Everything the runtime sends upstream or returns to clients follows the
//! standard chat-completion schema; these types are the single source of
//! truth for that shape.

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Messages
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// A single tool invocation emitted by the model.
///
/// `arguments` is the raw JSON string exactly as the model produced it;
/// it is parsed (and validated) only at dispatch time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    #[serde(rename = "type", default = "function_kind")]
    pub kind: String,
    pub function: FunctionCall,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionCall {
    pub name: String,
    #[serde(default)]
    pub arguments: String,
}

fn function_kind() -> String {
    "function".into()
}

impl ToolCall {
    pub fn new(name: impl Into<String>, arguments: impl Into<String>) -> Self {
        Self {
            id: String::new(),
            kind: function_kind(),
            function: FunctionCall {
                name: name.into(),
                arguments: arguments.into(),
            },
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }
}

/// Message content: plain text, or the multi-part array used for
/// image-bearing requests.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    ImageUrl { image_url: ImageUrl },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageUrl {
    pub url: String,
}

impl From<String> for MessageContent {
    fn from(s: String) -> Self {
        MessageContent::Text(s)
    }
}

impl From<&str> for MessageContent {
    fn from(s: &str) -> Self {
        MessageContent::Text(s.to_string())
    }
}

impl MessageContent {
    /// The plain text view: the string itself, or the first text part.
    pub fn text(&self) -> &str {
        match self {
            MessageContent::Text(t) => t.as_str(),
            MessageContent::Parts(parts) => parts
                .iter()
                .find_map(|p| match p {
                    ContentPart::Text { text } => Some(text.as_str()),
                    _ => None,
                })
                .unwrap_or(""),
        }
    }
}

/// One transcript message. `content` is `None` for assistant messages
/// that carry only tool calls.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    #[serde(default)]
    pub content: Option<MessageContent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
}

impl Message {
    pub fn system(text: impl Into<String>) -> Self {
        Self::plain(Role::System, text)
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::plain(Role::User, text)
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self::plain(Role::Assistant, text)
    }

    fn plain(role: Role, text: impl Into<String>) -> Self {
        Self {
            role,
            content: Some(MessageContent::Text(text.into())),
            name: None,
            tool_call_id: None,
            tool_calls: Vec::new(),
        }
    }

    /// A user message carrying an image alongside its question.
    pub fn user_with_image(text: impl Into<String>, image_url: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: Some(MessageContent::Parts(vec![
                ContentPart::Text { text: text.into() },
                ContentPart::ImageUrl {
                    image_url: ImageUrl {
                        url: image_url.into(),
                    },
                },
            ])),
            name: None,
            tool_call_id: None,
            tool_calls: Vec::new(),
        }
    }

    /// Build a tool-role result message at the given call id.
    pub fn tool_result(
        call_id: impl Into<String>,
        tool_name: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            role: Role::Tool,
            content: Some(MessageContent::Text(content.into())),
            name: Some(tool_name.into()),
            tool_call_id: Some(call_id.into()),
            tool_calls: Vec::new(),
        }
    }

    /// The textual content, or the empty string.
    pub fn text(&self) -> &str {
        self.content.as_ref().map(|c| c.text()).unwrap_or("")
    }

    /// Replace the content with plain text.
    pub fn set_text(&mut self, text: impl Into<String>) {
        self.content = Some(MessageContent::Text(text.into()));
    }

    /// Parse `choices[0].message` out of a chat-completion response body.
    /// Missing fields degrade to an empty assistant message rather than an
    /// error; upstream quirks must not crash the loop.
    pub fn from_completion(body: &Value) -> Message {
        let msg = body
            .get("choices")
            .and_then(|c| c.as_array())
            .and_then(|a| a.first())
            .and_then(|c| c.get("message"));

        let content = msg
            .and_then(|m| m.get("content"))
            .and_then(|v| v.as_str())
            .map(|s| MessageContent::Text(s.to_string()));

        let tool_calls = msg
            .and_then(|m| m.get("tool_calls"))
            .and_then(|v| v.as_array())
            .map(|arr| {
                arr.iter()
                    .filter_map(|tc| serde_json::from_value::<ToolCall>(tc.clone()).ok())
                    .collect()
            })
            .unwrap_or_default();

        Message {
            role: Role::Assistant,
            content,
            name: None,
            tool_call_id: None,
            tool_calls,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tool definitions
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A tool advertised to the model. `parameters` is a JSON Schema object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

impl ToolDefinition {
    /// The `{"type": "function", "function": {...}}` wrapper the wire
    /// format expects.
    pub fn to_wire(&self) -> Value {
        serde_json::json!({
            "type": "function",
            "function": {
                "name": self.name,
                "description": self.description,
                "parameters": self.parameters,
            }
        })
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Request payload
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize)]
pub struct ResponseFormat {
    #[serde(rename = "type")]
    pub kind: String,
}

impl ResponseFormat {
    pub fn json_object() -> Self {
        Self {
            kind: "json_object".into(),
        }
    }
}

/// An outbound chat-completion request. The router rewrites `model` to the
/// selected node's label before sending.
#[derive(Debug, Clone, Serialize)]
pub struct ChatPayload {
    pub model: String,
    pub messages: Vec<Message>,
    pub stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_format: Option<ResponseFormat>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<String>,
}

impl ChatPayload {
    pub fn new(model: impl Into<String>, messages: Vec<Message>) -> Self {
        Self {
            model: model.into(),
            messages,
            stream: false,
            temperature: None,
            top_p: None,
            max_tokens: None,
            response_format: None,
            tools: None,
            tool_choice: None,
        }
    }

    /// Attach the given tool definitions with `tool_choice: auto`.
    pub fn with_tools(mut self, defs: &[ToolDefinition]) -> Self {
        self.tools = Some(defs.iter().map(|d| d.to_wire()).collect());
        self.tool_choice = Some("auto".into());
        self
    }

    /// Strip the tools array entirely, forcing a natural-language answer.
    pub fn without_tools(mut self) -> Self {
        self.tools = None;
        self.tool_choice = None;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tool_calls_round_trip_wire_shape() {
        let raw = serde_json::json!({
            "role": "assistant",
            "content": null,
            "tool_calls": [{
                "id": "call_ab12",
                "type": "function",
                "function": {"name": "file_system", "arguments": "{\"operation\":\"list_files\",\"path\":\".\"}"}
            }]
        });
        let msg: Message = serde_json::from_value(raw).unwrap();
        assert_eq!(msg.text(), "");
        assert_eq!(msg.tool_calls.len(), 1);
        assert_eq!(msg.tool_calls[0].function.name, "file_system");

        let back = serde_json::to_value(&msg).unwrap();
        assert_eq!(back["tool_calls"][0]["type"], "function");
        assert_eq!(back["tool_calls"][0]["id"], "call_ab12");
    }

    #[test]
    fn image_messages_serialize_as_part_arrays() {
        let msg = Message::user_with_image("what is this?", "https://x/img.png");
        let v = serde_json::to_value(&msg).unwrap();
        assert_eq!(v["content"][0]["type"], "text");
        assert_eq!(v["content"][0]["text"], "what is this?");
        assert_eq!(v["content"][1]["type"], "image_url");
        assert_eq!(v["content"][1]["image_url"]["url"], "https://x/img.png");
        assert_eq!(msg.text(), "what is this?");
    }

    #[test]
    fn from_completion_tolerates_missing_fields() {
        let msg = Message::from_completion(&serde_json::json!({"choices": []}));
        assert_eq!(msg.text(), "");
        assert!(msg.tool_calls.is_empty());

        let msg = Message::from_completion(&serde_json::json!({
            "choices": [{"message": {"role": "assistant", "content": "hi"}}]
        }));
        assert_eq!(msg.text(), "hi");
    }

    #[test]
    fn payload_omits_empty_optionals() {
        let payload = ChatPayload::new("m", vec![Message::user("x")]);
        let v = serde_json::to_value(&payload).unwrap();
        assert!(v.get("tools").is_none());
        assert!(v.get("temperature").is_none());
        assert_eq!(v["stream"], false);
    }

    #[test]
    fn with_tools_sets_auto_choice() {
        let def = ToolDefinition {
            name: "recall".into(),
            description: "search memory".into(),
            parameters: serde_json::json!({"type": "object", "properties": {}}),
        };
        let payload = ChatPayload::new("m", vec![]).with_tools(&[def]);
        assert_eq!(payload.tool_choice.as_deref(), Some("auto"));
        let tools = payload.tools.unwrap();
        assert_eq!(tools[0]["function"]["name"], "recall");
    }
}
