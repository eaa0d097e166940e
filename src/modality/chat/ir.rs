use super::ChatFormat;
use serde::{Deserialize, Serialize};

/// IR Chat Request: the universal intermediate representation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IrChatRequest {
    pub model: String,
    pub messages: Vec<IrMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    pub stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<IrTool>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<IrToolChoice>,
    /// Top-level fields with no IR counterpart, kept verbatim for the format they came from.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extra: Option<IrExtra>,
}

impl IrChatRequest {
    /// A minimal single-turn request.
    pub fn user_text(model: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            messages: vec![IrMessage::text(IrRole::User, text)],
            system: None,
            temperature: None,
            top_p: None,
            max_tokens: None,
            stream: false,
            stop: None,
            tools: None,
            tool_choice: None,
            extra: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IrExtra {
    pub format: ChatFormat,
    pub fields: serde_json::Map<String, serde_json::Value>,
}

impl IrExtra {
    /// Wrap leftover fields; `None` when there are none.
    pub fn from_fields(
        format: ChatFormat,
        fields: serde_json::Map<String, serde_json::Value>,
    ) -> Option<Self> {
        if fields.is_empty() {
            None
        } else {
            Some(Self { format, fields })
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IrMessage {
    pub role: IrRole,
    pub content: IrContent,
    /// For assistant messages with tool calls.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<IrToolCall>>,
    /// For tool result messages.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    /// Participant name, or the function name of a tool result.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl IrMessage {
    pub fn text(role: IrRole, text: impl Into<String>) -> Self {
        Self {
            role,
            content: IrContent::Text(text.into()),
            tool_calls: None,
            tool_call_id: None,
            name: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum IrRole {
    System,
    User,
    Assistant,
    Tool,
}

/// Content can be a simple string or a list of content parts (multimodal).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum IrContent {
    Text(String),
    Parts(Vec<IrContentPart>),
}

impl IrContent {
    /// Extract plain text from content, joining all text parts.
    pub fn to_text(&self) -> String {
        match self {
            IrContent::Text(s) => s.clone(),
            IrContent::Parts(parts) => parts
                .iter()
                .filter_map(|p| match p {
                    IrContentPart::Text { text } => Some(text.as_str()),
                    _ => None,
                })
                .collect::<Vec<_>>()
                .join(""),
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            IrContent::Text(s) => s.is_empty(),
            IrContent::Parts(parts) => parts.is_empty(),
        }
    }

    /// True when the content is text only (no images).
    pub fn is_text_only(&self) -> bool {
        match self {
            IrContent::Text(_) => true,
            IrContent::Parts(parts) => parts
                .iter()
                .all(|p| matches!(p, IrContentPart::Text { .. })),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum IrContentPart {
    Text {
        text: String,
    },
    /// Either `url` or `media_type` + `data` (base64) is set.
    Image {
        #[serde(skip_serializing_if = "Option::is_none")]
        url: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        media_type: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        data: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IrTool {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub parameters: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IrToolChoice {
    Auto,
    None,
    Any,
    Tool { name: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IrToolCall {
    pub id: String,
    pub name: String,
    /// JSON-encoded arguments object.
    pub arguments: String,
}

// --- Response IR ---

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IrChatResponse {
    pub id: String,
    pub model: String,
    pub message: IrMessage,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<IrFinishReason>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<IrUsage>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum IrFinishReason {
    Stop,
    Length,
    ToolCalls,
    ContentFilter,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IrUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_tokens: Option<u32>,
}

impl IrUsage {
    pub fn new(prompt_tokens: u32, completion_tokens: u32) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: Some(prompt_tokens.saturating_add(completion_tokens)),
        }
    }

    pub fn total(&self) -> u32 {
        self.total_tokens
            .unwrap_or(self.prompt_tokens.saturating_add(self.completion_tokens))
    }

    /// Fold usage reported piecemeal across stream events (each field only grows).
    pub fn merge(&mut self, other: &IrUsage) {
        self.prompt_tokens = self.prompt_tokens.max(other.prompt_tokens);
        self.completion_tokens = self.completion_tokens.max(other.completion_tokens);
        self.total_tokens = match (self.total_tokens, other.total_tokens) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };
    }
}

// --- Streaming IR ---

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IrStreamChunk {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delta_role: Option<IrRole>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delta_content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delta_tool_calls: Option<Vec<IrToolCallDelta>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<IrFinishReason>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<IrUsage>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IrToolCallDelta {
    pub index: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub arguments: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usage_merge_keeps_largest_counts() {
        let mut usage = IrUsage {
            prompt_tokens: 12,
            completion_tokens: 0,
            total_tokens: None,
        };
        usage.merge(&IrUsage {
            prompt_tokens: 0,
            completion_tokens: 30,
            total_tokens: None,
        });
        assert_eq!(usage.prompt_tokens, 12);
        assert_eq!(usage.completion_tokens, 30);
        assert_eq!(usage.total(), 42);
    }

    #[test]
    fn oversized_usage_counts_saturate() {
        let usage = IrUsage::new(u32::MAX, 10);
        assert_eq!(usage.total(), u32::MAX);

        let reported = IrUsage {
            prompt_tokens: u32::MAX - 1,
            completion_tokens: 5,
            total_tokens: None,
        };
        assert_eq!(reported.total(), u32::MAX);
    }

    #[test]
    fn text_only_detection() {
        let parts = IrContent::Parts(vec![
            IrContentPart::Text { text: "a".into() },
            IrContentPart::Image {
                url: Some("https://x/y.png".into()),
                media_type: None,
                data: None,
            },
        ]);
        assert!(!parts.is_text_only());
        assert_eq!(parts.to_text(), "a");
        assert!(IrContent::Text(String::new()).is_text_only());
    }
}
