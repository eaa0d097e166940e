use super::helpers::{data_url, from_json, from_json_str, split_data_url, to_json, to_json_str};
use super::ir::*;
use super::{check_request, ChatFormat, Decoder, Encoder, SseEvent};
use crate::error::AppError;
use serde::{Deserialize, Serialize};

const FORMAT: ChatFormat = ChatFormat::OpenaiChat;

/// OpenAI chat-completions codec. Holds the id/model of the stream being encoded so
/// chunks decoded from formats that only announce them once stay consistent.
#[derive(Debug, Default)]
pub struct OpenAiChatCodec {
    stream_id: Option<String>,
    stream_model: Option<String>,
    stream_created: Option<i64>,
}

// --- OpenAI Wire Types ---

#[derive(Debug, Serialize, Deserialize)]
pub struct OaiRequest {
    pub model: String,
    pub messages: Vec<OaiMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<OaiTool>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream_options: Option<OaiStreamOptions>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct OaiStreamOptions {
    pub include_usage: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct OaiMessage {
    pub role: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<OaiToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct OaiToolCall {
    pub id: String,
    #[serde(rename = "type")]
    pub call_type: String,
    pub function: OaiFunction,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct OaiFunction {
    pub name: String,
    pub arguments: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct OaiTool {
    #[serde(rename = "type")]
    pub tool_type: String,
    pub function: OaiToolFunction,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct OaiToolFunction {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parameters: Option<serde_json::Value>,
}

// --- Response types ---

#[derive(Debug, Serialize, Deserialize)]
pub struct OaiResponse {
    pub id: String,
    pub object: String,
    #[serde(default)]
    pub created: i64,
    pub model: String,
    pub choices: Vec<OaiChoice>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<OaiUsage>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct OaiChoice {
    pub index: u32,
    pub message: OaiMessage,
    pub finish_reason: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct OaiUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

impl From<OaiUsage> for IrUsage {
    fn from(u: OaiUsage) -> Self {
        IrUsage {
            prompt_tokens: u.prompt_tokens,
            completion_tokens: u.completion_tokens,
            total_tokens: Some(u.total_tokens),
        }
    }
}

impl From<&IrUsage> for OaiUsage {
    fn from(u: &IrUsage) -> Self {
        OaiUsage {
            prompt_tokens: u.prompt_tokens,
            completion_tokens: u.completion_tokens,
            total_tokens: u.total(),
        }
    }
}

// --- Streaming types ---

#[derive(Debug, Serialize, Deserialize)]
pub struct OaiStreamChunk {
    pub id: String,
    pub object: String,
    #[serde(default)]
    pub created: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    pub choices: Vec<OaiStreamChoice>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<OaiUsage>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct OaiStreamChoice {
    pub index: u32,
    pub delta: OaiStreamDelta,
    pub finish_reason: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct OaiStreamDelta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<OaiStreamToolCall>>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct OaiStreamToolCall {
    pub index: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub call_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub function: Option<OaiStreamFunction>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct OaiStreamFunction {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub arguments: Option<String>,
}

// --- Conversion helpers ---

fn oai_role_to_ir(role: &str, field: String) -> Result<IrRole, AppError> {
    match role {
        "system" | "developer" => Ok(IrRole::System),
        "user" => Ok(IrRole::User),
        "assistant" => Ok(IrRole::Assistant),
        "tool" => Ok(IrRole::Tool),
        other => Err(AppError::conversion(
            FORMAT.as_str(),
            field,
            format!("unsupported role '{}'", other),
        )),
    }
}

fn ir_role_to_oai(role: &IrRole) -> &'static str {
    match role {
        IrRole::System => "system",
        IrRole::User => "user",
        IrRole::Assistant => "assistant",
        IrRole::Tool => "tool",
    }
}

fn oai_part_to_ir(part: &serde_json::Value, field: String) -> Result<IrContentPart, AppError> {
    let unsupported = |what: &str| AppError::conversion(FORMAT.as_str(), field.clone(), what.to_string());
    match part.get("type").and_then(|t| t.as_str()) {
        Some("text") => {
            let text = part
                .get("text")
                .and_then(|t| t.as_str())
                .ok_or_else(|| unsupported("text part without text"))?;
            Ok(IrContentPart::Text {
                text: text.to_string(),
            })
        }
        Some("image_url") => {
            let url = part
                .get("image_url")
                .and_then(|i| i.get("url"))
                .and_then(|u| u.as_str())
                .ok_or_else(|| unsupported("image_url part without url"))?;
            Ok(match split_data_url(url) {
                Some((media_type, data)) => IrContentPart::Image {
                    url: None,
                    media_type: Some(media_type),
                    data: Some(data),
                },
                None => IrContentPart::Image {
                    url: Some(url.to_string()),
                    media_type: None,
                    data: None,
                },
            })
        }
        Some(other) => Err(unsupported(&format!("unsupported content part '{}'", other))),
        None => Err(unsupported("content part without type")),
    }
}

fn oai_content_to_ir(
    content: &Option<serde_json::Value>,
    field: &str,
) -> Result<IrContent, AppError> {
    match content {
        None | Some(serde_json::Value::Null) => Ok(IrContent::Text(String::new())),
        Some(serde_json::Value::String(s)) => Ok(IrContent::Text(s.clone())),
        Some(serde_json::Value::Array(parts)) => {
            let ir_parts = parts
                .iter()
                .enumerate()
                .map(|(j, p)| oai_part_to_ir(p, format!("{}[{}]", field, j)))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(IrContent::Parts(ir_parts))
        }
        Some(_) => Err(AppError::conversion(
            FORMAT.as_str(),
            field,
            "content must be a string or an array of parts",
        )),
    }
}

fn ir_content_to_oai(content: &IrContent) -> serde_json::Value {
    match content {
        IrContent::Text(s) => serde_json::Value::String(s.clone()),
        IrContent::Parts(parts) => {
            let oai_parts: Vec<serde_json::Value> = parts
                .iter()
                .map(|p| match p {
                    IrContentPart::Text { text } => serde_json::json!({
                        "type": "text",
                        "text": text,
                    }),
                    IrContentPart::Image {
                        url,
                        media_type,
                        data,
                    } => {
                        let url = match (data, url) {
                            (Some(data), _) => {
                                data_url(media_type.as_deref().unwrap_or("image/png"), data)
                            }
                            (None, Some(url)) => url.clone(),
                            (None, None) => String::new(),
                        };
                        serde_json::json!({
                            "type": "image_url",
                            "image_url": { "url": url },
                        })
                    }
                })
                .collect();
            serde_json::Value::Array(oai_parts)
        }
    }
}

fn oai_finish_to_ir(reason: &Option<String>) -> Option<IrFinishReason> {
    reason.as_ref().map(|r| match r.as_str() {
        "length" => IrFinishReason::Length,
        "tool_calls" | "function_call" => IrFinishReason::ToolCalls,
        "content_filter" => IrFinishReason::ContentFilter,
        _ => IrFinishReason::Stop,
    })
}

fn ir_finish_to_oai(reason: &Option<IrFinishReason>) -> Option<String> {
    reason.as_ref().map(|r| match r {
        IrFinishReason::Stop => "stop".to_string(),
        IrFinishReason::Length => "length".to_string(),
        IrFinishReason::ToolCalls => "tool_calls".to_string(),
        IrFinishReason::ContentFilter => "content_filter".to_string(),
    })
}

fn oai_tool_calls_to_ir(tcs: &Option<Vec<OaiToolCall>>) -> Option<Vec<IrToolCall>> {
    tcs.as_ref().map(|tcs| {
        tcs.iter()
            .map(|tc| IrToolCall {
                id: tc.id.clone(),
                name: tc.function.name.clone(),
                arguments: tc.function.arguments.clone(),
            })
            .collect()
    })
}

fn ir_tool_calls_to_oai(tcs: &Option<Vec<IrToolCall>>) -> Option<Vec<OaiToolCall>> {
    tcs.as_ref().map(|tcs| {
        tcs.iter()
            .map(|tc| OaiToolCall {
                id: tc.id.clone(),
                call_type: "function".to_string(),
                function: OaiFunction {
                    name: tc.name.clone(),
                    arguments: tc.arguments.clone(),
                },
            })
            .collect()
    })
}

fn oai_stop_to_ir(stop: Option<serde_json::Value>) -> Result<Option<Vec<String>>, AppError> {
    let invalid = || AppError::conversion(FORMAT.as_str(), "stop", "stop must be a string or an array of strings");
    match stop {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(serde_json::Value::String(s)) => Ok(Some(vec![s])),
        Some(serde_json::Value::Array(items)) => items
            .into_iter()
            .map(|v| match v {
                serde_json::Value::String(s) => Ok(s),
                _ => Err(invalid()),
            })
            .collect::<Result<Vec<_>, _>>()
            .map(Some),
        Some(_) => Err(invalid()),
    }
}

fn oai_tool_choice_to_ir(tc: Option<serde_json::Value>) -> Result<Option<IrToolChoice>, AppError> {
    let Some(tc) = tc else { return Ok(None) };
    let choice = match &tc {
        serde_json::Value::String(s) => match s.as_str() {
            "auto" => Some(IrToolChoice::Auto),
            "none" => Some(IrToolChoice::None),
            "required" => Some(IrToolChoice::Any),
            _ => None,
        },
        other => other
            .get("function")
            .and_then(|f| f.get("name"))
            .and_then(|n| n.as_str())
            .map(|name| IrToolChoice::Tool {
                name: name.to_string(),
            }),
    };
    choice
        .map(Some)
        .ok_or_else(|| AppError::conversion(FORMAT.as_str(), "tool_choice", format!("unsupported tool_choice {}", tc)))
}

// --- Decoder impl ---

impl Decoder for OpenAiChatCodec {
    fn decode_request(&self, body: &[u8]) -> Result<IrChatRequest, AppError> {
        let mut req: OaiRequest = from_json(FORMAT, body)?;

        // the IR models a single choice
        match req.extra.remove("n") {
            None | Some(serde_json::Value::Null) => {}
            Some(n) if n.as_u64() == Some(1) => {}
            Some(n) => {
                return Err(AppError::conversion(
                    FORMAT.as_str(),
                    "n",
                    format!("only a single choice is supported, got n={}", n),
                ))
            }
        }

        let mut system = None;
        let mut messages = Vec::new();

        for (i, msg) in req.messages.iter().enumerate() {
            let field = format!("messages[{}]", i);
            let role = oai_role_to_ir(&msg.role, format!("{}.role", field))?;
            let content = oai_content_to_ir(&msg.content, &format!("{}.content", field))?;

            // Only the leading system message is the prompt; later ones stay in place.
            if role == IrRole::System && i == 0 && msg.name.is_none() {
                system = Some(content.to_text());
                continue;
            }

            messages.push(IrMessage {
                role,
                content,
                tool_calls: oai_tool_calls_to_ir(&msg.tool_calls),
                tool_call_id: msg.tool_call_id.clone(),
                name: msg.name.clone(),
            });
        }

        let tools = req.tools.map(|ts| {
            ts.into_iter()
                .map(|t| IrTool {
                    name: t.function.name,
                    description: t.function.description,
                    parameters: t.function.parameters.unwrap_or(serde_json::json!({})),
                })
                .collect()
        });

        Ok(IrChatRequest {
            model: req.model,
            messages,
            system,
            temperature: req.temperature,
            top_p: req.top_p,
            max_tokens: req.max_tokens,
            stream: req.stream.unwrap_or(false),
            stop: oai_stop_to_ir(req.stop)?,
            tools,
            tool_choice: oai_tool_choice_to_ir(req.tool_choice)?,
            extra: IrExtra::from_fields(FORMAT, req.extra),
        })
    }

    fn decode_response(&self, body: &[u8]) -> Result<IrChatResponse, AppError> {
        let resp: OaiResponse = from_json(FORMAT, body)?;

        let choice = resp.choices.into_iter().next().ok_or_else(|| {
            AppError::conversion(FORMAT.as_str(), "choices", "no choices in response")
        })?;

        let ir_msg = IrMessage {
            role: oai_role_to_ir(&choice.message.role, "choices[0].message.role".into())?,
            content: oai_content_to_ir(&choice.message.content, "choices[0].message.content")?,
            tool_calls: oai_tool_calls_to_ir(&choice.message.tool_calls),
            tool_call_id: None,
            name: None,
        };

        Ok(IrChatResponse {
            id: resp.id,
            model: resp.model,
            message: ir_msg,
            finish_reason: oai_finish_to_ir(&choice.finish_reason),
            usage: resp.usage.map(IrUsage::from),
        })
    }

    fn decode_stream_chunk(&mut self, data: &str) -> Result<Option<IrStreamChunk>, AppError> {
        if data.trim().is_empty() || self.is_stream_done(data) {
            return Ok(None);
        }

        let chunk: OaiStreamChunk = from_json_str(FORMAT, data)?;
        let usage = chunk.usage.map(IrUsage::from);

        let choice = match chunk.choices.into_iter().next() {
            Some(c) => c,
            None => {
                // Usage-only chunk (final chunk with stream_options.include_usage)
                if usage.is_some() {
                    return Ok(Some(IrStreamChunk {
                        id: chunk.id,
                        model: chunk.model,
                        usage,
                        ..Default::default()
                    }));
                }
                return Ok(None);
            }
        };

        let delta_tool_calls = choice.delta.tool_calls.map(|tcs| {
            tcs.into_iter()
                .map(|tc| IrToolCallDelta {
                    index: tc.index,
                    id: tc.id,
                    name: tc.function.as_ref().and_then(|f| f.name.clone()),
                    arguments: tc.function.and_then(|f| f.arguments),
                })
                .collect()
        });

        let delta_role = match choice.delta.role {
            Some(r) => Some(oai_role_to_ir(&r, "choices[0].delta.role".into())?),
            None => None,
        };

        Ok(Some(IrStreamChunk {
            id: chunk.id,
            model: chunk.model,
            delta_role,
            delta_content: choice.delta.content,
            delta_tool_calls,
            finish_reason: oai_finish_to_ir(&choice.finish_reason),
            usage,
        }))
    }

    fn is_stream_done(&self, data: &str) -> bool {
        data.trim() == "[DONE]"
    }
}

// --- Encoder impl ---

impl Encoder for OpenAiChatCodec {
    fn encode_request(&self, ir: &IrChatRequest, model: &str) -> Result<Vec<u8>, AppError> {
        check_request(FORMAT, ir)?;
        let mut messages = Vec::new();

        if let Some(sys) = &ir.system {
            messages.push(OaiMessage {
                role: "system".to_string(),
                content: Some(serde_json::Value::String(sys.clone())),
                tool_calls: None,
                tool_call_id: None,
                name: None,
            });
        }

        for msg in &ir.messages {
            let has_tool_calls = msg.tool_calls.as_ref().is_some_and(|tcs| !tcs.is_empty());
            let content = if has_tool_calls && msg.content.is_empty() {
                None
            } else {
                Some(ir_content_to_oai(&msg.content))
            };

            messages.push(OaiMessage {
                role: ir_role_to_oai(&msg.role).to_string(),
                content,
                tool_calls: ir_tool_calls_to_oai(&msg.tool_calls),
                tool_call_id: msg.tool_call_id.clone(),
                name: msg.name.clone(),
            });
        }

        let tools = ir.tools.as_ref().map(|ts| {
            ts.iter()
                .map(|t| OaiTool {
                    tool_type: "function".to_string(),
                    function: OaiToolFunction {
                        name: t.name.clone(),
                        description: t.description.clone(),
                        parameters: Some(t.parameters.clone()),
                    },
                })
                .collect()
        });

        let tool_choice = ir.tool_choice.as_ref().map(|tc| match tc {
            IrToolChoice::Auto => serde_json::json!("auto"),
            IrToolChoice::None => serde_json::json!("none"),
            IrToolChoice::Any => serde_json::json!("required"),
            IrToolChoice::Tool { name } => serde_json::json!({
                "type": "function",
                "function": { "name": name }
            }),
        });

        let mut extra = match &ir.extra {
            Some(extra) if extra.format == FORMAT => extra.fields.clone(),
            _ => serde_json::Map::new(),
        };
        // typed field below owns this key
        extra.remove("stream_options");

        let req = OaiRequest {
            model: model.to_string(),
            messages,
            temperature: ir.temperature,
            top_p: ir.top_p,
            max_tokens: ir.max_tokens,
            stream: if ir.stream { Some(true) } else { None },
            stop: ir.stop.as_ref().map(|s| serde_json::json!(s)),
            tools,
            tool_choice,
            stream_options: if ir.stream {
                Some(OaiStreamOptions { include_usage: true })
            } else {
                None
            },
            extra,
        };

        to_json(FORMAT, &req)
    }

    fn encode_response(&self, ir: &IrChatResponse) -> Result<Vec<u8>, AppError> {
        let has_tool_calls = ir.message.tool_calls.as_ref().is_some_and(|tcs| !tcs.is_empty());
        let content = if has_tool_calls && ir.message.content.is_empty() {
            None
        } else {
            Some(ir_content_to_oai(&ir.message.content))
        };

        let resp = OaiResponse {
            id: ir.id.clone(),
            object: "chat.completion".to_string(),
            created: chrono::Utc::now().timestamp(),
            model: ir.model.clone(),
            choices: vec![OaiChoice {
                index: 0,
                message: OaiMessage {
                    role: ir_role_to_oai(&ir.message.role).to_string(),
                    content,
                    tool_calls: ir_tool_calls_to_oai(&ir.message.tool_calls),
                    tool_call_id: None,
                    name: None,
                },
                finish_reason: ir_finish_to_oai(&ir.finish_reason),
            }],
            usage: ir.usage.as_ref().map(OaiUsage::from),
        };

        to_json(FORMAT, &resp)
    }

    fn encode_stream_chunk(&mut self, chunk: &IrStreamChunk) -> Result<Vec<SseEvent>, AppError> {
        if !chunk.id.is_empty() && self.stream_id.is_none() {
            self.stream_id = Some(chunk.id.clone());
        }
        if chunk.model.is_some() && self.stream_model.is_none() {
            self.stream_model = chunk.model.clone();
        }
        let id = self
            .stream_id
            .get_or_insert_with(|| format!("chatcmpl-{}", uuid::Uuid::new_v4().simple()))
            .clone();
        let created = *self
            .stream_created
            .get_or_insert_with(|| chrono::Utc::now().timestamp());

        let delta_tool_calls = chunk.delta_tool_calls.as_ref().map(|tcs| {
            tcs.iter()
                .map(|tc| OaiStreamToolCall {
                    index: tc.index,
                    id: tc.id.clone(),
                    call_type: tc.id.as_ref().map(|_| "function".to_string()),
                    function: if tc.name.is_some() || tc.arguments.is_some() {
                        Some(OaiStreamFunction {
                            name: tc.name.clone(),
                            arguments: tc.arguments.clone(),
                        })
                    } else {
                        None
                    },
                })
                .collect()
        });

        let has_delta = chunk.delta_role.is_some()
            || chunk.delta_content.is_some()
            || delta_tool_calls.is_some()
            || chunk.finish_reason.is_some();
        if !has_delta && chunk.usage.is_none() {
            return Ok(Vec::new());
        }

        // usage-only chunks carry an empty choices array, as upstream sends them
        let choices = if has_delta {
            vec![OaiStreamChoice {
                index: 0,
                delta: OaiStreamDelta {
                    role: chunk.delta_role.as_ref().map(|r| ir_role_to_oai(r).to_string()),
                    content: chunk.delta_content.clone(),
                    tool_calls: delta_tool_calls,
                },
                finish_reason: ir_finish_to_oai(&chunk.finish_reason),
            }]
        } else {
            Vec::new()
        };

        let oai_chunk = OaiStreamChunk {
            id,
            object: "chat.completion.chunk".to_string(),
            created,
            model: self.stream_model.clone(),
            choices,
            usage: chunk.usage.as_ref().map(OaiUsage::from),
        };

        Ok(vec![SseEvent::data(to_json_str(FORMAT, &oai_chunk)?)])
    }

    fn stream_done_signal(&mut self) -> Vec<SseEvent> {
        vec![SseEvent::data("[DONE]")]
    }
}
