pub mod anthropic;
pub mod gemini;
pub mod helpers;
pub mod ir;
pub mod openai_chat;

use crate::error::AppError;
use ir::{IrChatRequest, IrChatResponse, IrContent, IrContentPart, IrRole, IrStreamChunk};

/// Identifies the wire format of a request/response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatFormat {
    #[serde(alias = "openai_chat")]
    OpenaiChat,
    #[serde(alias = "claude")]
    Anthropic,
    Gemini,
}

impl ChatFormat {
    /// Parse from a route's format string or an inbound path hint.
    pub fn from_str_loose(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "openai" | "openai-chat" | "openai_chat" => Some(Self::OpenaiChat),
            "anthropic" | "claude" => Some(Self::Anthropic),
            "gemini" | "google" => Some(Self::Gemini),
            _ => None,
        }
    }

    /// Canonical name, as stored on routes.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OpenaiChat => "openai",
            Self::Anthropic => "anthropic",
            Self::Gemini => "gemini",
        }
    }

    pub fn profile(&self) -> &'static FormatProfile {
        match self {
            Self::OpenaiChat => &REGISTRY[0],
            Self::Anthropic => &REGISTRY[1],
            Self::Gemini => &REGISTRY[2],
        }
    }

    pub fn capabilities(&self) -> &'static FormatCapabilities {
        &self.profile().capabilities
    }
}

impl std::fmt::Display for ChatFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a wire format can carry. Encoding anything outside these is a conversion
/// error rather than a silent drop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FormatCapabilities {
    /// Images referenced by URL.
    pub image_urls: bool,
    /// Images inlined as base64 data.
    pub inline_images: bool,
    /// System messages between conversation turns (not just the leading prompt).
    pub interleaved_system: bool,
    /// Participant names on user/assistant messages.
    pub message_names: bool,
    /// Tool calls carry their own ids. Without them, results are matched by function name.
    pub tool_call_ids: bool,
    /// The format rejects requests without an explicit output token limit.
    pub requires_max_tokens: bool,
}

#[derive(Debug)]
pub struct FormatProfile {
    pub format: ChatFormat,
    pub capabilities: FormatCapabilities,
    /// Top-level request fields that may be dropped when converting away from this format.
    pub ignorable_fields: &'static [&'static str],
}

static REGISTRY: [FormatProfile; 3] = [
    FormatProfile {
        format: ChatFormat::OpenaiChat,
        capabilities: FormatCapabilities {
            image_urls: true,
            inline_images: true,
            interleaved_system: true,
            message_names: true,
            tool_call_ids: true,
            requires_max_tokens: false,
        },
        ignorable_fields: &["user", "stream_options"],
    },
    FormatProfile {
        format: ChatFormat::Anthropic,
        capabilities: FormatCapabilities {
            image_urls: true,
            inline_images: true,
            interleaved_system: false,
            message_names: false,
            tool_call_ids: true,
            requires_max_tokens: true,
        },
        ignorable_fields: &["metadata"],
    },
    FormatProfile {
        format: ChatFormat::Gemini,
        capabilities: FormatCapabilities {
            image_urls: false,
            inline_images: true,
            interleaved_system: false,
            message_names: false,
            tool_call_ids: false,
            requires_max_tokens: false,
        },
        ignorable_fields: &[],
    },
];

/// All registered formats.
pub fn registry() -> &'static [FormatProfile] {
    &REGISTRY
}

/// Resolve a format name, failing with a conversion error naming the route field.
pub fn resolve_format(name: &str) -> Result<ChatFormat, AppError> {
    ChatFormat::from_str_loose(name).ok_or_else(|| {
        AppError::conversion(name, "format", format!("unsupported format '{}'", name))
    })
}

/// Reject any part of `ir` that `target` cannot represent.
pub fn check_request(target: ChatFormat, ir: &IrChatRequest) -> Result<(), AppError> {
    let caps = target.capabilities();
    let fail = |field: String, message: &str| Err(AppError::conversion(target.as_str(), field, message));

    if let Some(extra) = &ir.extra {
        if extra.format != target {
            let ignorable = extra.format.profile().ignorable_fields;
            if let Some(key) = extra
                .fields
                .keys()
                .find(|k| !ignorable.contains(&k.as_str()))
            {
                return fail(
                    key.clone(),
                    &format!("field from {} request has no {} equivalent", extra.format, target),
                );
            }
        }
    }

    for (i, msg) in ir.messages.iter().enumerate() {
        if msg.role == IrRole::System && !caps.interleaved_system {
            return fail(
                format!("messages[{}].role", i),
                "system messages are only supported as the leading prompt",
            );
        }
        if msg.name.is_some() && msg.role != IrRole::Tool && !caps.message_names {
            return fail(format!("messages[{}].name", i), "participant names are not supported");
        }
        if let IrContent::Parts(parts) = &msg.content {
            for (j, part) in parts.iter().enumerate() {
                if let IrContentPart::Image { url, data, .. } = part {
                    let field = format!("messages[{}].content[{}]", i, j);
                    if data.is_some() && !caps.inline_images {
                        return fail(field, "inline images are not supported");
                    }
                    if data.is_none() && url.is_some() && !caps.image_urls {
                        return fail(field, "image urls are not supported");
                    }
                    if data.is_none() && url.is_none() {
                        return fail(field, "image has neither url nor data");
                    }
                }
            }
        }
    }
    Ok(())
}

/// Reject response content `target` cannot carry.
pub fn check_response(target: ChatFormat, ir: &IrChatResponse) -> Result<(), AppError> {
    if !ir.message.content.is_text_only() {
        return Err(AppError::conversion(
            target.as_str(),
            "message.content",
            "non-text response content cannot be converted",
        ));
    }
    Ok(())
}

/// One server-sent event as written to the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    pub event: Option<String>,
    pub data: String,
}

impl SseEvent {
    pub fn data(data: impl Into<String>) -> Self {
        Self {
            event: None,
            data: data.into(),
        }
    }

    pub fn named(event: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            event: Some(event.into()),
            data: data.into(),
        }
    }

    /// Wire framing, including the blank-line terminator.
    pub fn to_frame(&self) -> String {
        match &self.event {
            Some(event) => format!("event: {}\ndata: {}\n\n", event, self.data),
            None => format!("data: {}\n\n", self.data),
        }
    }
}

/// Decodes a provider-specific format into IR.
pub trait Decoder: Send {
    /// Decode an incoming HTTP request body into IR.
    fn decode_request(&self, body: &[u8]) -> Result<IrChatRequest, AppError>;

    /// Decode a non-streaming upstream response body into IR.
    fn decode_response(&self, body: &[u8]) -> Result<IrChatResponse, AppError>;

    /// Decode a single SSE data payload from upstream into an IR stream chunk.
    /// Returns None if the payload is a keep-alive or carries nothing the IR models.
    fn decode_stream_chunk(&mut self, data: &str) -> Result<Option<IrStreamChunk>, AppError>;

    /// Returns true if the given SSE data payload signals end-of-stream.
    fn is_stream_done(&self, data: &str) -> bool;
}

/// Encodes IR into a provider-specific format.
pub trait Encoder: Send {
    /// Encode IR request into bytes to send upstream.
    fn encode_request(&self, ir: &IrChatRequest, model: &str) -> Result<Vec<u8>, AppError>;

    /// Encode IR response into bytes to send downstream.
    fn encode_response(&self, ir: &IrChatResponse) -> Result<Vec<u8>, AppError>;

    /// Encode an IR stream chunk into zero or more SSE events.
    fn encode_stream_chunk(&mut self, chunk: &IrStreamChunk) -> Result<Vec<SseEvent>, AppError>;

    /// Events that close the stream (e.g. "[DONE]").
    fn stream_done_signal(&mut self) -> Vec<SseEvent>;
}

/// Get a decoder for a given format. Stream decoding is stateful, so use one per request.
pub fn get_decoder(format: ChatFormat) -> Box<dyn Decoder> {
    match format {
        ChatFormat::OpenaiChat => Box::new(openai_chat::OpenAiChatCodec::default()),
        ChatFormat::Anthropic => Box::new(anthropic::AnthropicCodec::default()),
        ChatFormat::Gemini => Box::new(gemini::GeminiCodec::default()),
    }
}

/// Get an encoder for a given format. Stream encoding is stateful, so use one per request.
pub fn get_encoder(format: ChatFormat) -> Box<dyn Encoder> {
    match format {
        ChatFormat::OpenaiChat => Box::new(openai_chat::OpenAiChatCodec::default()),
        ChatFormat::Anthropic => Box::new(anthropic::AnthropicCodec::default()),
        ChatFormat::Gemini => Box::new(gemini::GeminiCodec::default()),
    }
}

/// Convert a request body between formats through the IR.
pub fn convert_request(
    from: ChatFormat,
    to: ChatFormat,
    body: &[u8],
    model: &str,
) -> Result<Vec<u8>, AppError> {
    let ir = get_decoder(from).decode_request(body)?;
    check_request(to, &ir)?;
    get_encoder(to).encode_request(&ir, model)
}

/// Convert a non-streaming response body between formats through the IR.
pub fn convert_response(from: ChatFormat, to: ChatFormat, body: &[u8]) -> Result<Vec<u8>, AppError> {
    let ir = get_decoder(from).decode_response(body)?;
    check_response(to, &ir)?;
    get_encoder(to).encode_response(&ir)
}

#[cfg(test)]
mod tests {
    use super::ir::*;
    use super::*;

    fn image_request(url: Option<&str>, data: Option<&str>) -> IrChatRequest {
        let mut ir = IrChatRequest::user_text("m", "look");
        ir.messages[0].content = IrContent::Parts(vec![
            IrContentPart::Text { text: "look".into() },
            IrContentPart::Image {
                url: url.map(String::from),
                media_type: data.map(|_| "image/png".to_string()),
                data: data.map(String::from),
            },
        ]);
        ir
    }

    #[test]
    fn loose_names_resolve() {
        assert_eq!(ChatFormat::from_str_loose("Claude"), Some(ChatFormat::Anthropic));
        assert_eq!(ChatFormat::from_str_loose("openai"), Some(ChatFormat::OpenaiChat));
        assert_eq!(ChatFormat::from_str_loose(" gemini "), Some(ChatFormat::Gemini));
        assert_eq!(ChatFormat::from_str_loose("cohere"), None);
        assert_eq!(ChatFormat::Anthropic.as_str(), "anthropic");
    }

    #[test]
    fn registry_lists_every_format_once() {
        let formats: Vec<ChatFormat> = registry().iter().map(|s| s.format).collect();
        assert_eq!(
            formats,
            vec![ChatFormat::OpenaiChat, ChatFormat::Anthropic, ChatFormat::Gemini]
        );
        for profile in registry() {
            assert_eq!(profile.format.profile().format, profile.format);
        }
    }

    #[test]
    fn unknown_format_is_a_conversion_error() {
        let err = resolve_format("cohere").unwrap_err();
        match err {
            AppError::FormatConversion { field, .. } => assert_eq!(field, "format"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn gemini_rejects_image_urls_but_takes_inline_data() {
        let err = check_request(ChatFormat::Gemini, &image_request(Some("https://x/y.png"), None))
            .unwrap_err();
        match err {
            AppError::FormatConversion { format, field, .. } => {
                assert_eq!(format, "gemini");
                assert_eq!(field, "messages[0].content[1]");
            }
            other => panic!("unexpected {:?}", other),
        }
        check_request(ChatFormat::Gemini, &image_request(None, Some("aGk="))).unwrap();
        check_request(ChatFormat::Anthropic, &image_request(Some("https://x/y.png"), None)).unwrap();
    }

    #[test]
    fn interleaved_system_message_is_rejected_where_unsupported() {
        let mut ir = IrChatRequest::user_text("m", "hi");
        ir.messages.push(IrMessage::text(IrRole::System, "now be terse"));
        check_request(ChatFormat::OpenaiChat, &ir).unwrap();
        let err = check_request(ChatFormat::Anthropic, &ir).unwrap_err();
        assert!(err.to_string().contains("messages[1].role"));
    }

    #[test]
    fn foreign_extra_fields_fail_but_native_ones_pass() {
        let mut fields = serde_json::Map::new();
        fields.insert("seed".into(), serde_json::json!(7));
        let mut ir = IrChatRequest::user_text("m", "hi");
        ir.extra = IrExtra::from_fields(ChatFormat::OpenaiChat, fields);

        check_request(ChatFormat::OpenaiChat, &ir).unwrap();
        let err = check_request(ChatFormat::Anthropic, &ir).unwrap_err();
        match err {
            AppError::FormatConversion { field, .. } => assert_eq!(field, "seed"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn sse_framing() {
        assert_eq!(SseEvent::data("[DONE]").to_frame(), "data: [DONE]\n\n");
        assert_eq!(
            SseEvent::named("ping", "{}").to_frame(),
            "event: ping\ndata: {}\n\n"
        );
    }

    #[test]
    fn openai_request_converts_to_anthropic() {
        let body = serde_json::json!({
            "model": "gpt-4",
            "messages": [
                {"role": "system", "content": "be brief"},
                {"role": "user", "content": "hello"}
            ]
        })
        .to_string();
        let out = convert_request(ChatFormat::OpenaiChat, ChatFormat::Anthropic, body.as_bytes(), "claude-3")
            .unwrap();
        let v: serde_json::Value = serde_json::from_slice(&out).unwrap();
        assert_eq!(v["model"], "claude-3");
        assert_eq!(v["system"], "be brief");
        assert_eq!(v["messages"][0]["role"], "user");
        assert!(v["max_tokens"].as_u64().is_some());
    }

    #[test]
    fn gemini_response_converts_to_openai() {
        let body = serde_json::json!({
            "candidates": [{
                "content": {"role": "model", "parts": [{"text": "hi there"}]},
                "finishReason": "STOP"
            }],
            "usageMetadata": {"promptTokenCount": 3, "candidatesTokenCount": 2, "totalTokenCount": 5}
        })
        .to_string();
        let out = convert_response(ChatFormat::Gemini, ChatFormat::OpenaiChat, body.as_bytes()).unwrap();
        let v: serde_json::Value = serde_json::from_slice(&out).unwrap();
        assert_eq!(v["choices"][0]["message"]["content"], "hi there");
        assert_eq!(v["choices"][0]["finish_reason"], "stop");
        assert_eq!(v["usage"]["total_tokens"], 5);
    }
}
