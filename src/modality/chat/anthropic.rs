use super::helpers::{from_json, from_json_str, from_json_value, parse_arguments, to_json};
use super::ir::*;
use super::{check_request, check_response, ChatFormat, Decoder, Encoder, SseEvent};
use crate::error::AppError;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;

const FORMAT: ChatFormat = ChatFormat::Anthropic;
const DEFAULT_MAX_TOKENS: u32 = 4096;

/// Anthropic Messages codec.
///
/// Streaming in this format is block structured: every text run and every tool call
/// is its own indexed content block with explicit start/stop events. The codec keeps
/// the block bookkeeping for one stream in each direction, so use a fresh instance
/// per request.
#[derive(Debug, Default)]
pub struct AnthropicCodec {
    // decode: upstream block index -> tool call ordinal
    tool_ordinals: HashMap<u32, u32>,
    // encode
    started: bool,
    message_id: Option<String>,
    model: Option<String>,
    open_block: Option<u32>,
    open_block_is_text: bool,
    next_block: u32,
    tool_blocks: HashMap<u32, u32>,
    pending_stop: Option<IrFinishReason>,
    usage: IrUsage,
    finished: bool,
}

// --- Anthropic Wire Types (Request) ---

#[derive(Debug, Serialize, Deserialize)]
pub struct AnthropicRequest {
    pub model: String,
    pub messages: Vec<AnthropicMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system: Option<serde_json::Value>, // string or array of content blocks (for prompt caching)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_sequences: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<AnthropicTool>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<AnthropicToolChoice>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AnthropicMessage {
    pub role: String,
    pub content: serde_json::Value, // string or array of content blocks
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AnthropicTool {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub input_schema: serde_json::Value,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AnthropicToolChoice {
    #[serde(rename = "type")]
    pub choice_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

// --- Anthropic Wire Types (Response) ---

#[derive(Debug, Serialize, Deserialize)]
pub struct AnthropicResponse {
    pub id: String,
    #[serde(rename = "type")]
    pub resp_type: String,
    pub role: String,
    pub content: Vec<AnthropicContentBlock>,
    pub model: String,
    pub stop_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<AnthropicUsage>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum AnthropicContentBlock {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "tool_use")]
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AnthropicUsage {
    pub input_tokens: u32,
    #[serde(default)]
    pub output_tokens: u32,
}

// --- Streaming event types ---
// Anthropic SSE uses `event:` + `data:` lines.
// The `data:` payload always has a `type` field matching the event name.

#[derive(Debug, Deserialize)]
pub struct StreamMessageStart {
    pub message: StreamMessageInfo,
}

#[derive(Debug, Deserialize)]
pub struct StreamMessageInfo {
    pub id: String,
    pub model: String,
    #[serde(default)]
    pub usage: Option<AnthropicUsage>,
}

#[derive(Debug, Deserialize)]
pub struct StreamContentBlockStart {
    pub index: u32,
    pub content_block: AnthropicContentBlock,
}

#[derive(Debug, Deserialize)]
pub struct StreamContentBlockDelta {
    pub index: u32,
    pub delta: StreamDelta,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
pub enum StreamDelta {
    #[serde(rename = "text_delta")]
    TextDelta { text: String },
    #[serde(rename = "input_json_delta")]
    InputJsonDelta { partial_json: String },
}

#[derive(Debug, Deserialize)]
pub struct StreamMessageDelta {
    pub delta: StreamMessageDeltaInner,
    #[serde(default)]
    pub usage: Option<StreamMessageDeltaUsage>,
}

#[derive(Debug, Deserialize)]
pub struct StreamMessageDeltaInner {
    pub stop_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct StreamMessageDeltaUsage {
    #[serde(default)]
    pub input_tokens: Option<u32>,
    pub output_tokens: u32,
}

#[derive(Debug, Deserialize)]
pub struct StreamError {
    pub error: StreamErrorInner,
}

#[derive(Debug, Deserialize)]
pub struct StreamErrorInner {
    #[serde(rename = "type")]
    pub error_type: String,
    pub message: String,
}

// --- Conversion helpers ---

fn anthropic_stop_to_ir(reason: &Option<String>) -> Option<IrFinishReason> {
    reason.as_ref().map(|r| match r.as_str() {
        "max_tokens" => IrFinishReason::Length,
        "tool_use" => IrFinishReason::ToolCalls,
        "refusal" => IrFinishReason::ContentFilter,
        _ => IrFinishReason::Stop,
    })
}

fn ir_finish_to_anthropic(reason: IrFinishReason) -> &'static str {
    match reason {
        IrFinishReason::Stop => "end_turn",
        IrFinishReason::Length => "max_tokens",
        IrFinishReason::ToolCalls => "tool_use",
        IrFinishReason::ContentFilter => "refusal",
    }
}

fn unsupported_block(field: String, block_type: &str) -> AppError {
    AppError::conversion(
        FORMAT.as_str(),
        field,
        format!("unsupported content block '{}'", block_type),
    )
}

fn block_type(block: &serde_json::Value) -> &str {
    block.get("type").and_then(|t| t.as_str()).unwrap_or("")
}

fn str_field(block: &serde_json::Value, key: &str) -> Option<String> {
    block.get(key).and_then(|v| v.as_str()).map(String::from)
}

/// A text or image block as an IR content part.
fn anthropic_part_to_ir(block: &serde_json::Value, field: String) -> Result<IrContentPart, AppError> {
    match block_type(block) {
        "text" => Ok(IrContentPart::Text {
            text: str_field(block, "text").unwrap_or_default(),
        }),
        "image" => {
            let source = block.get("source").cloned().unwrap_or(json!({}));
            match block_type(&source) {
                "base64" => Ok(IrContentPart::Image {
                    url: None,
                    media_type: str_field(&source, "media_type"),
                    data: str_field(&source, "data"),
                }),
                "url" => Ok(IrContentPart::Image {
                    url: str_field(&source, "url"),
                    media_type: None,
                    data: None,
                }),
                other => Err(AppError::conversion(
                    FORMAT.as_str(),
                    field,
                    format!("unsupported image source '{}'", other),
                )),
            }
        }
        other => Err(unsupported_block(field, other)),
    }
}

/// A single text part collapses to plain text.
fn parts_to_content(mut parts: Vec<IrContentPart>) -> IrContent {
    match parts.len() {
        0 => IrContent::Text(String::new()),
        1 if matches!(parts[0], IrContentPart::Text { .. }) => match parts.remove(0) {
            IrContentPart::Text { text } => IrContent::Text(text),
            other => IrContent::Parts(vec![other]),
        },
        _ => IrContent::Parts(parts),
    }
}

fn tool_result_content(value: Option<&serde_json::Value>, field: &str) -> Result<IrContent, AppError> {
    match value {
        None | Some(serde_json::Value::Null) => Ok(IrContent::Text(String::new())),
        Some(serde_json::Value::String(s)) => Ok(IrContent::Text(s.clone())),
        Some(serde_json::Value::Array(blocks)) => {
            let parts = blocks
                .iter()
                .enumerate()
                .map(|(k, b)| anthropic_part_to_ir(b, format!("{}.content[{}]", field, k)))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(IrContent::Parts(parts))
        }
        Some(_) => Err(AppError::conversion(
            FORMAT.as_str(),
            format!("{}.content", field),
            "tool result content must be a string or an array of blocks",
        )),
    }
}

/// Convert IR content to Anthropic content blocks array.
fn ir_content_to_anthropic(content: &IrContent) -> Vec<serde_json::Value> {
    match content {
        IrContent::Text(s) => {
            if s.is_empty() {
                vec![]
            } else {
                vec![json!({"type": "text", "text": s})]
            }
        }
        IrContent::Parts(parts) => parts
            .iter()
            .map(|p| match p {
                IrContentPart::Text { text } => json!({"type": "text", "text": text}),
                IrContentPart::Image {
                    url,
                    media_type,
                    data,
                } => match (data, url) {
                    (Some(data), _) => json!({
                        "type": "image",
                        "source": {
                            "type": "base64",
                            "media_type": media_type.as_deref().unwrap_or("image/png"),
                            "data": data,
                        }
                    }),
                    (None, url) => json!({
                        "type": "image",
                        "source": {
                            "type": "url",
                            "url": url.as_deref().unwrap_or_default(),
                        }
                    }),
                },
            })
            .collect(),
    }
}

/// Plain text stays a string; anything richer becomes a block array.
fn ir_content_to_anthropic_value(content: &IrContent) -> serde_json::Value {
    match content {
        IrContent::Text(s) => serde_json::Value::String(s.clone()),
        parts => serde_json::Value::Array(ir_content_to_anthropic(parts)),
    }
}

fn system_to_ir(system: serde_json::Value) -> Result<String, AppError> {
    match system {
        serde_json::Value::String(text) => Ok(text),
        serde_json::Value::Array(blocks) => blocks
            .iter()
            .enumerate()
            .map(|(k, b)| match block_type(b) {
                "text" => Ok(str_field(b, "text").unwrap_or_default()),
                other => Err(unsupported_block(format!("system[{}]", k), other)),
            })
            .collect::<Result<Vec<_>, _>>()
            .map(|texts| texts.join("")),
        _ => Err(AppError::conversion(
            FORMAT.as_str(),
            "system",
            "system must be a string or an array of text blocks",
        )),
    }
}

fn usage_to_ir(u: &AnthropicUsage) -> IrUsage {
    IrUsage::new(u.input_tokens, u.output_tokens)
}

// --- Decoder impl ---

impl Decoder for AnthropicCodec {
    fn decode_request(&self, body: &[u8]) -> Result<IrChatRequest, AppError> {
        let req: AnthropicRequest = from_json(FORMAT, body)?;

        let mut messages = Vec::new();

        for (i, msg) in req.messages.iter().enumerate() {
            let field = format!("messages[{}]", i);
            let role = match msg.role.as_str() {
                "user" => IrRole::User,
                "assistant" => IrRole::Assistant,
                other => {
                    return Err(AppError::conversion(
                        FORMAT.as_str(),
                        format!("{}.role", field),
                        format!("unsupported role '{}'", other),
                    ))
                }
            };

            let blocks = match &msg.content {
                serde_json::Value::String(s) => {
                    messages.push(IrMessage::text(role, s.clone()));
                    continue;
                }
                serde_json::Value::Array(blocks) => blocks,
                _ => {
                    return Err(AppError::conversion(
                        FORMAT.as_str(),
                        format!("{}.content", field),
                        "content must be a string or an array of blocks",
                    ))
                }
            };

            let mut parts = Vec::new();
            let mut tool_calls = Vec::new();
            let mut has_tool_results = false;

            for (j, block) in blocks.iter().enumerate() {
                let block_field = format!("{}.content[{}]", field, j);
                match (role, block_type(block)) {
                    (IrRole::Assistant, "tool_use") => {
                        let input = block.get("input").cloned().unwrap_or(json!({}));
                        tool_calls.push(IrToolCall {
                            id: str_field(block, "id").unwrap_or_default(),
                            name: str_field(block, "name").unwrap_or_default(),
                            arguments: input.to_string(),
                        });
                    }
                    (IrRole::User, "tool_result") => {
                        // tool results become their own IR messages, in order
                        has_tool_results = true;
                        messages.push(IrMessage {
                            role: IrRole::Tool,
                            content: tool_result_content(block.get("content"), &block_field)?,
                            tool_calls: None,
                            tool_call_id: str_field(block, "tool_use_id"),
                            name: None,
                        });
                    }
                    _ => parts.push(anthropic_part_to_ir(block, block_field)?),
                }
            }

            if has_tool_results && parts.is_empty() {
                continue;
            }

            messages.push(IrMessage {
                role,
                content: parts_to_content(parts),
                tool_calls: if tool_calls.is_empty() {
                    None
                } else {
                    Some(tool_calls)
                },
                tool_call_id: None,
                name: None,
            });
        }

        let tools = req.tools.map(|ts| {
            ts.into_iter()
                .map(|t| IrTool {
                    name: t.name,
                    description: t.description,
                    parameters: t.input_schema,
                })
                .collect()
        });

        let tool_choice = match req.tool_choice {
            None => None,
            Some(tc) => Some(match tc.choice_type.as_str() {
                "auto" => IrToolChoice::Auto,
                "any" => IrToolChoice::Any,
                "none" => IrToolChoice::None,
                "tool" => IrToolChoice::Tool {
                    name: tc.name.unwrap_or_default(),
                },
                other => {
                    return Err(AppError::conversion(
                        FORMAT.as_str(),
                        "tool_choice",
                        format!("unsupported tool_choice '{}'", other),
                    ))
                }
            }),
        };

        let system = req.system.map(system_to_ir).transpose()?;

        Ok(IrChatRequest {
            model: req.model,
            messages,
            system,
            temperature: req.temperature,
            top_p: req.top_p,
            max_tokens: req.max_tokens,
            stream: req.stream.unwrap_or(false),
            stop: req.stop_sequences,
            tools,
            tool_choice,
            extra: IrExtra::from_fields(FORMAT, req.extra),
        })
    }

    fn decode_response(&self, body: &[u8]) -> Result<IrChatResponse, AppError> {
        let resp: AnthropicResponse = from_json(FORMAT, body)?;

        let mut text_parts = Vec::new();
        let mut tool_calls = Vec::new();

        for block in &resp.content {
            match block {
                AnthropicContentBlock::Text { text } => {
                    text_parts.push(text.clone());
                }
                AnthropicContentBlock::ToolUse { id, name, input } => {
                    tool_calls.push(IrToolCall {
                        id: id.clone(),
                        name: name.clone(),
                        arguments: input.to_string(),
                    });
                }
            }
        }

        let content = IrContent::Text(text_parts.join(""));
        let tc = if tool_calls.is_empty() {
            None
        } else {
            Some(tool_calls)
        };

        Ok(IrChatResponse {
            id: resp.id,
            model: resp.model,
            message: IrMessage {
                role: IrRole::Assistant,
                content,
                tool_calls: tc,
                tool_call_id: None,
                name: None,
            },
            finish_reason: anthropic_stop_to_ir(&resp.stop_reason),
            usage: resp.usage.as_ref().map(usage_to_ir),
        })
    }

    fn decode_stream_chunk(&mut self, data: &str) -> Result<Option<IrStreamChunk>, AppError> {
        if data.trim().is_empty() || self.is_stream_done(data) {
            return Ok(None);
        }

        // Parse the JSON to determine the event type
        let v: serde_json::Value = from_json_str(FORMAT, data)?;
        let event_type = v.get("type").and_then(|t| t.as_str()).unwrap_or("").to_string();

        match event_type.as_str() {
            "message_start" => {
                let evt: StreamMessageStart = from_json_value(FORMAT, v)?;
                Ok(Some(IrStreamChunk {
                    id: evt.message.id,
                    model: Some(evt.message.model),
                    delta_role: Some(IrRole::Assistant),
                    // totals are left open; later deltas keep adding output tokens
                    usage: evt.message.usage.map(|u| IrUsage {
                        prompt_tokens: u.input_tokens,
                        completion_tokens: u.output_tokens,
                        total_tokens: None,
                    }),
                    ..Default::default()
                }))
            }
            "content_block_start" => {
                let evt: StreamContentBlockStart = from_json_value(FORMAT, v)?;
                match evt.content_block {
                    AnthropicContentBlock::ToolUse { id, name, .. } => {
                        let ordinal = self.tool_ordinals.len() as u32;
                        self.tool_ordinals.insert(evt.index, ordinal);
                        Ok(Some(IrStreamChunk {
                            delta_tool_calls: Some(vec![IrToolCallDelta {
                                index: ordinal,
                                id: Some(id),
                                name: Some(name),
                                arguments: None,
                            }]),
                            ..Default::default()
                        }))
                    }
                    AnthropicContentBlock::Text { text } if !text.is_empty() => {
                        Ok(Some(IrStreamChunk {
                            delta_content: Some(text),
                            ..Default::default()
                        }))
                    }
                    AnthropicContentBlock::Text { .. } => Ok(None),
                }
            }
            "content_block_delta" => {
                let evt: StreamContentBlockDelta = from_json_value(FORMAT, v)?;
                match evt.delta {
                    StreamDelta::TextDelta { text } => Ok(Some(IrStreamChunk {
                        delta_content: Some(text),
                        ..Default::default()
                    })),
                    StreamDelta::InputJsonDelta { partial_json } => {
                        let ordinal = *self.tool_ordinals.get(&evt.index).ok_or_else(|| {
                            AppError::conversion(
                                FORMAT.as_str(),
                                "content_block_delta.index",
                                format!("input delta for unknown block {}", evt.index),
                            )
                        })?;
                        Ok(Some(IrStreamChunk {
                            delta_tool_calls: Some(vec![IrToolCallDelta {
                                index: ordinal,
                                id: None,
                                name: None,
                                arguments: Some(partial_json),
                            }]),
                            ..Default::default()
                        }))
                    }
                }
            }
            "message_delta" => {
                let evt: StreamMessageDelta = from_json_value(FORMAT, v)?;
                Ok(Some(IrStreamChunk {
                    finish_reason: anthropic_stop_to_ir(&evt.delta.stop_reason),
                    usage: evt.usage.map(|u| IrUsage {
                        prompt_tokens: u.input_tokens.unwrap_or(0),
                        completion_tokens: u.output_tokens,
                        total_tokens: None,
                    }),
                    ..Default::default()
                }))
            }
            "error" => {
                let evt: StreamError = from_json_value(FORMAT, v)?;
                Err(AppError::Upstream {
                    status: 502,
                    body: format!("{}: {}", evt.error.error_type, evt.error.message),
                })
            }
            _ => Ok(None),
        }
    }

    fn is_stream_done(&self, data: &str) -> bool {
        // Anthropic signals end with message_stop event
        data.contains("\"type\":\"message_stop\"") || data.contains("\"type\": \"message_stop\"")
    }
}

// --- Stream encoding state ---

impl AnthropicCodec {
    fn event(name: &str, payload: serde_json::Value) -> SseEvent {
        SseEvent::named(name, payload.to_string())
    }

    fn ensure_started(&mut self, events: &mut Vec<SseEvent>) {
        if self.started {
            return;
        }
        self.started = true;
        let id = self
            .message_id
            .get_or_insert_with(|| format!("msg_{}", uuid::Uuid::new_v4().simple()))
            .clone();
        events.push(Self::event(
            "message_start",
            json!({
                "type": "message_start",
                "message": {
                    "id": id,
                    "type": "message",
                    "role": "assistant",
                    "content": [],
                    "model": self.model.as_deref().unwrap_or(""),
                    "stop_reason": null,
                    "stop_sequence": null,
                    "usage": {
                        "input_tokens": self.usage.prompt_tokens,
                        "output_tokens": 0,
                    }
                }
            }),
        ));
    }

    fn close_block(&mut self, events: &mut Vec<SseEvent>) {
        if let Some(index) = self.open_block.take() {
            events.push(Self::event(
                "content_block_stop",
                json!({"type": "content_block_stop", "index": index}),
            ));
        }
    }

    fn start_block(&mut self, block: serde_json::Value, is_text: bool, events: &mut Vec<SseEvent>) -> u32 {
        self.close_block(events);
        let index = self.next_block;
        self.next_block += 1;
        self.open_block = Some(index);
        self.open_block_is_text = is_text;
        events.push(Self::event(
            "content_block_start",
            json!({"type": "content_block_start", "index": index, "content_block": block}),
        ));
        index
    }

    fn text_block(&mut self, events: &mut Vec<SseEvent>) -> u32 {
        match self.open_block {
            Some(index) if self.open_block_is_text => index,
            _ => self.start_block(json!({"type": "text", "text": ""}), true, events),
        }
    }
}

// --- Encoder impl ---

impl Encoder for AnthropicCodec {
    fn encode_request(&self, ir: &IrChatRequest, model: &str) -> Result<Vec<u8>, AppError> {
        check_request(FORMAT, ir)?;
        let mut messages: Vec<AnthropicMessage> = Vec::new();

        for (i, msg) in ir.messages.iter().enumerate() {
            match msg.role {
                // rejected by check_request
                IrRole::System => continue,
                IrRole::User => {
                    messages.push(AnthropicMessage {
                        role: "user".to_string(),
                        content: ir_content_to_anthropic_value(&msg.content),
                    });
                }
                IrRole::Assistant => {
                    let Some(tcs) = msg.tool_calls.as_ref().filter(|tcs| !tcs.is_empty()) else {
                        messages.push(AnthropicMessage {
                            role: "assistant".to_string(),
                            content: ir_content_to_anthropic_value(&msg.content),
                        });
                        continue;
                    };

                    let mut content_blocks = ir_content_to_anthropic(&msg.content);
                    for (k, tc) in tcs.iter().enumerate() {
                        let input = parse_arguments(
                            FORMAT,
                            format!("messages[{}].tool_calls[{}].arguments", i, k),
                            &tc.arguments,
                        )?;
                        content_blocks.push(json!({
                            "type": "tool_use",
                            "id": tc.id,
                            "name": tc.name,
                            "input": input,
                        }));
                    }

                    messages.push(AnthropicMessage {
                        role: "assistant".to_string(),
                        content: serde_json::Value::Array(content_blocks),
                    });
                }
                IrRole::Tool => {
                    let tool_use_id = msg.tool_call_id.as_deref().ok_or_else(|| {
                        AppError::conversion(
                            FORMAT.as_str(),
                            format!("messages[{}].tool_call_id", i),
                            "tool result without a tool call id",
                        )
                    })?;
                    let block = json!({
                        "type": "tool_result",
                        "tool_use_id": tool_use_id,
                        "content": ir_content_to_anthropic_value(&msg.content),
                    });

                    // Consecutive tool results share one user message
                    let merged = match messages.last_mut() {
                        Some(last) if last.role == "user" => match &mut last.content {
                            serde_json::Value::Array(arr)
                                if arr.iter().all(|b| block_type(b) == "tool_result") =>
                            {
                                arr.push(block.clone());
                                true
                            }
                            _ => false,
                        },
                        _ => false,
                    };

                    if !merged {
                        messages.push(AnthropicMessage {
                            role: "user".to_string(),
                            content: serde_json::Value::Array(vec![block]),
                        });
                    }
                }
            }
        }

        let tools = ir.tools.as_ref().map(|ts| {
            ts.iter()
                .map(|t| AnthropicTool {
                    name: t.name.clone(),
                    description: t.description.clone(),
                    input_schema: t.parameters.clone(),
                })
                .collect::<Vec<_>>()
        });

        let tool_choice = ir.tool_choice.as_ref().map(|tc| {
            let (choice_type, name) = match tc {
                IrToolChoice::Auto => ("auto", None),
                IrToolChoice::None => ("none", None),
                IrToolChoice::Any => ("any", None),
                IrToolChoice::Tool { name } => ("tool", Some(name.clone())),
            };
            AnthropicToolChoice {
                choice_type: choice_type.to_string(),
                name,
            }
        });

        let extra = match &ir.extra {
            Some(extra) if extra.format == FORMAT => extra.fields.clone(),
            _ => serde_json::Map::new(),
        };

        let req = AnthropicRequest {
            model: model.to_string(),
            messages,
            max_tokens: Some(ir.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS)),
            system: ir.system.as_deref().map(|s| serde_json::Value::String(s.to_string())),
            temperature: ir.temperature,
            top_p: ir.top_p,
            stop_sequences: ir.stop.clone(),
            stream: if ir.stream { Some(true) } else { None },
            tools,
            tool_choice,
            extra,
        };

        to_json(FORMAT, &req)
    }

    fn encode_response(&self, ir: &IrChatResponse) -> Result<Vec<u8>, AppError> {
        check_response(FORMAT, ir)?;
        let mut content = Vec::new();

        let text = ir.message.content.to_text();
        if !text.is_empty() {
            content.push(AnthropicContentBlock::Text { text });
        }

        if let Some(tcs) = &ir.message.tool_calls {
            for (k, tc) in tcs.iter().enumerate() {
                let input = parse_arguments(
                    FORMAT,
                    format!("message.tool_calls[{}].arguments", k),
                    &tc.arguments,
                )?;
                content.push(AnthropicContentBlock::ToolUse {
                    id: tc.id.clone(),
                    name: tc.name.clone(),
                    input,
                });
            }
        }

        if content.is_empty() {
            content.push(AnthropicContentBlock::Text {
                text: String::new(),
            });
        }

        let resp = AnthropicResponse {
            id: ir.id.clone(),
            resp_type: "message".to_string(),
            role: "assistant".to_string(),
            content,
            model: ir.model.clone(),
            stop_reason: ir.finish_reason.map(|r| ir_finish_to_anthropic(r).to_string()),
            usage: ir.usage.as_ref().map(|u| AnthropicUsage {
                input_tokens: u.prompt_tokens,
                output_tokens: u.completion_tokens,
            }),
        };

        to_json(FORMAT, &resp)
    }

    fn encode_stream_chunk(&mut self, chunk: &IrStreamChunk) -> Result<Vec<SseEvent>, AppError> {
        let mut events = Vec::new();

        if !chunk.id.is_empty() && self.message_id.is_none() {
            self.message_id = Some(chunk.id.clone());
        }
        if chunk.model.is_some() && self.model.is_none() {
            self.model = chunk.model.clone();
        }
        if let Some(usage) = &chunk.usage {
            self.usage.merge(usage);
        }
        self.ensure_started(&mut events);

        if let Some(text) = chunk.delta_content.as_ref().filter(|t| !t.is_empty()) {
            let index = self.text_block(&mut events);
            events.push(Self::event(
                "content_block_delta",
                json!({
                    "type": "content_block_delta",
                    "index": index,
                    "delta": {"type": "text_delta", "text": text},
                }),
            ));
        }

        if let Some(tcs) = &chunk.delta_tool_calls {
            for tc in tcs {
                let existing = self.tool_blocks.get(&tc.index).copied();
                let index = match existing {
                    Some(index) => index,
                    None => {
                        let id = tc
                            .id
                            .clone()
                            .unwrap_or_else(|| format!("toolu_{}", uuid::Uuid::new_v4().simple()));
                        let block = json!({
                            "type": "tool_use",
                            "id": id,
                            "name": tc.name.as_deref().unwrap_or(""),
                            "input": {},
                        });
                        let index = self.start_block(block, false, &mut events);
                        self.tool_blocks.insert(tc.index, index);
                        index
                    }
                };
                if let Some(args) = tc.arguments.as_ref().filter(|a| !a.is_empty()) {
                    events.push(Self::event(
                        "content_block_delta",
                        json!({
                            "type": "content_block_delta",
                            "index": index,
                            "delta": {"type": "input_json_delta", "partial_json": args},
                        }),
                    ));
                }
            }
        }

        // message_delta waits for the end of the stream, since OpenAI-style
        // upstreams report usage after the finish reason.
        if let Some(reason) = chunk.finish_reason {
            self.pending_stop = Some(reason);
        }

        Ok(events)
    }

    fn stream_done_signal(&mut self) -> Vec<SseEvent> {
        if self.finished {
            return Vec::new();
        }
        self.finished = true;

        let mut events = Vec::new();
        self.ensure_started(&mut events);
        self.close_block(&mut events);
        let stop_reason = ir_finish_to_anthropic(self.pending_stop.unwrap_or(IrFinishReason::Stop));
        events.push(Self::event(
            "message_delta",
            json!({
                "type": "message_delta",
                "delta": {"stop_reason": stop_reason, "stop_sequence": null},
                "usage": {
                    "input_tokens": self.usage.prompt_tokens,
                    "output_tokens": self.usage.completion_tokens,
                },
            }),
        ));
        events.push(Self::event("message_stop", json!({"type": "message_stop"})));
        events
    }
}
