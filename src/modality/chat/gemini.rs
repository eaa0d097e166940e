use super::helpers::{from_json, from_json_str, parse_arguments, to_json, to_json_str};
use super::ir::*;
use super::{check_request, check_response, ChatFormat, Decoder, Encoder, SseEvent};
use crate::error::AppError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

const FORMAT: ChatFormat = ChatFormat::Gemini;

/// Gemini generateContent codec.
///
/// Gemini carries neither tool-call ids nor partial function calls, so the codec
/// numbers calls itself when decoding and buffers argument fragments when encoding.
#[derive(Debug, Default)]
pub struct GeminiCodec {
    // decode
    next_call: u32,
    saw_tool_calls: bool,
    // encode
    pending_calls: BTreeMap<u32, (String, String)>,
    flushed: bool,
}

// --- Gemini Wire Types (Request) ---

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeminiRequest {
    pub contents: Vec<GeminiContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_instruction: Option<GeminiSystemInstruction>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub generation_config: Option<GeminiGenerationConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<GeminiToolDeclaration>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_config: Option<GeminiToolConfig>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct GeminiContent {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default)]
    pub parts: Vec<GeminiPart>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct GeminiSystemInstruction {
    pub parts: Vec<GeminiPart>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeminiPart {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inline_data: Option<GeminiInlineData>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_data: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub function_call: Option<GeminiFunctionCall>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub function_response: Option<GeminiFunctionResponse>,
    /// Set on reasoning summaries, which are not part of the answer.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thought: Option<bool>,
}

impl GeminiPart {
    fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeminiInlineData {
    pub mime_type: String,
    pub data: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeminiFunctionCall {
    pub name: String,
    #[serde(default)]
    pub args: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeminiFunctionResponse {
    pub name: String,
    pub response: serde_json::Value,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeminiGenerationConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_output_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_sequences: Option<Vec<String>>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeminiToolDeclaration {
    pub function_declarations: Vec<GeminiFunctionDeclaration>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct GeminiFunctionDeclaration {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parameters: Option<serde_json::Value>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeminiToolConfig {
    pub function_calling_config: GeminiFunctionCallingConfig,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeminiFunctionCallingConfig {
    pub mode: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allowed_function_names: Option<Vec<String>>,
}

// --- Gemini Wire Types (Response) ---

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeminiResponse {
    #[serde(default)]
    pub candidates: Vec<GeminiCandidate>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage_metadata: Option<GeminiUsageMetadata>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeminiCandidate {
    #[serde(default = "empty_model_content")]
    pub content: GeminiContent,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<String>,
}

fn empty_model_content() -> GeminiContent {
    GeminiContent {
        role: Some("model".to_string()),
        parts: Vec::new(),
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeminiUsageMetadata {
    #[serde(default)]
    pub prompt_token_count: u32,
    #[serde(default)]
    pub candidates_token_count: u32,
    #[serde(default)]
    pub total_token_count: u32,
}

impl From<&GeminiUsageMetadata> for IrUsage {
    fn from(u: &GeminiUsageMetadata) -> Self {
        IrUsage {
            prompt_tokens: u.prompt_token_count,
            completion_tokens: u.candidates_token_count,
            total_tokens: Some(u.total_token_count),
        }
    }
}

impl From<&IrUsage> for GeminiUsageMetadata {
    fn from(u: &IrUsage) -> Self {
        GeminiUsageMetadata {
            prompt_token_count: u.prompt_tokens,
            candidates_token_count: u.completion_tokens,
            total_token_count: u.total(),
        }
    }
}

// --- Conversion helpers ---

fn gemini_role_to_ir(role: &str, field: String) -> Result<IrRole, AppError> {
    match role {
        "model" => Ok(IrRole::Assistant),
        "user" => Ok(IrRole::User),
        other => Err(AppError::conversion(
            FORMAT.as_str(),
            field,
            format!("unsupported role '{}'", other),
        )),
    }
}

fn gemini_finish_to_ir(reason: &Option<String>) -> Option<IrFinishReason> {
    reason.as_ref().map(|r| match r.as_str() {
        "MAX_TOKENS" => IrFinishReason::Length,
        "SAFETY" | "RECITATION" | "BLOCKLIST" | "PROHIBITED_CONTENT" | "SPII" => {
            IrFinishReason::ContentFilter
        }
        _ => IrFinishReason::Stop,
    })
}

fn ir_finish_to_gemini(reason: &Option<IrFinishReason>) -> Option<String> {
    reason.as_ref().map(|r| match r {
        // Gemini has no tool-call stop reason; the functionCall parts signal it
        IrFinishReason::Stop | IrFinishReason::ToolCalls => "STOP".to_string(),
        IrFinishReason::Length => "MAX_TOKENS".to_string(),
        IrFinishReason::ContentFilter => "SAFETY".to_string(),
    })
}

/// Decoded content of one turn. Tool calls get sequential `call_N` ids.
struct DecodedParts {
    content: IrContent,
    calls: Vec<(String, serde_json::Value)>,
}

fn gemini_parts_to_ir(parts: &[GeminiPart], field: &str) -> Result<DecodedParts, AppError> {
    let mut ir_parts = Vec::new();
    let mut calls = Vec::new();

    for (j, part) in parts.iter().enumerate() {
        if part.thought == Some(true) {
            continue;
        }
        if let Some(text) = &part.text {
            ir_parts.push(IrContentPart::Text { text: text.clone() });
        }
        if let Some(inline) = &part.inline_data {
            ir_parts.push(IrContentPart::Image {
                url: None,
                media_type: Some(inline.mime_type.clone()),
                data: Some(inline.data.clone()),
            });
        }
        if part.file_data.is_some() {
            return Err(AppError::conversion(
                FORMAT.as_str(),
                format!("{}.parts[{}].fileData", field, j),
                "file references are not supported",
            ));
        }
        if let Some(fc) = &part.function_call {
            calls.push((fc.name.clone(), fc.args.clone()));
        }
    }

    let content = if ir_parts.iter().all(|p| matches!(p, IrContentPart::Text { .. })) {
        IrContent::Text(
            ir_parts
                .iter()
                .map(|p| match p {
                    IrContentPart::Text { text } => text.as_str(),
                    _ => "",
                })
                .collect::<String>(),
        )
    } else {
        IrContent::Parts(ir_parts)
    };

    Ok(DecodedParts { content, calls })
}

fn ir_content_to_gemini_parts(content: &IrContent) -> Vec<GeminiPart> {
    match content {
        IrContent::Text(s) => {
            if s.is_empty() {
                vec![]
            } else {
                vec![GeminiPart::text(s.clone())]
            }
        }
        IrContent::Parts(parts) => parts
            .iter()
            .map(|p| match p {
                IrContentPart::Text { text } => GeminiPart::text(text.clone()),
                // url-only images are rejected by check_request
                IrContentPart::Image {
                    data, media_type, ..
                } => GeminiPart {
                    inline_data: Some(GeminiInlineData {
                        mime_type: media_type.as_deref().unwrap_or("image/png").to_string(),
                        data: data.clone().unwrap_or_default(),
                    }),
                    ..Default::default()
                },
            })
            .collect(),
    }
}

/// A function response body back to IR text. `{"result": "..."}` unwraps to the string.
fn function_response_to_text(response: &serde_json::Value) -> String {
    if let Some(obj) = response.as_object() {
        if obj.len() == 1 {
            if let Some(serde_json::Value::String(s)) = obj.get("result") {
                return s.clone();
            }
        }
    }
    response.to_string()
}

/// IR tool result text to a function response object. JSON objects pass through.
fn text_to_function_response(text: &str) -> serde_json::Value {
    match serde_json::from_str::<serde_json::Value>(text) {
        Ok(v @ serde_json::Value::Object(_)) => v,
        _ => serde_json::json!({ "result": text }),
    }
}

fn function_call_part(name: &str, args: serde_json::Value) -> GeminiPart {
    GeminiPart {
        function_call: Some(GeminiFunctionCall {
            name: name.to_string(),
            args,
        }),
        ..Default::default()
    }
}

// --- Decoder impl ---

impl Decoder for GeminiCodec {
    fn decode_request(&self, body: &[u8]) -> Result<IrChatRequest, AppError> {
        let req: GeminiRequest = from_json(FORMAT, body)?;

        let system = match &req.system_instruction {
            Some(si) => Some(gemini_parts_to_ir(&si.parts, "systemInstruction")?.content.to_text()),
            None => None,
        };

        let mut messages = Vec::new();
        // calls awaiting a functionResponse, matched by name in order
        let mut open_calls: Vec<(String, String)> = Vec::new();
        let mut next_call = 0u32;

        for (i, content) in req.contents.iter().enumerate() {
            let field = format!("contents[{}]", i);

            if content.parts.iter().any(|p| p.function_response.is_some()) {
                for part in &content.parts {
                    if let Some(fr) = &part.function_response {
                        let id = open_calls
                            .iter()
                            .position(|(_, name)| name == &fr.name)
                            .map(|pos| open_calls.remove(pos).0);
                        messages.push(IrMessage {
                            role: IrRole::Tool,
                            content: IrContent::Text(function_response_to_text(&fr.response)),
                            tool_calls: None,
                            tool_call_id: id,
                            name: Some(fr.name.clone()),
                        });
                    }
                }
                continue;
            }

            let role = gemini_role_to_ir(
                content.role.as_deref().unwrap_or("user"),
                format!("{}.role", field),
            )?;
            let decoded = gemini_parts_to_ir(&content.parts, &field)?;

            let tool_calls: Vec<IrToolCall> = decoded
                .calls
                .into_iter()
                .map(|(name, args)| {
                    let id = format!("call_{}", next_call);
                    next_call += 1;
                    open_calls.push((id.clone(), name.clone()));
                    IrToolCall {
                        id,
                        name,
                        arguments: args.to_string(),
                    }
                })
                .collect();

            messages.push(IrMessage {
                role,
                content: decoded.content,
                tool_calls: if tool_calls.is_empty() {
                    None
                } else {
                    Some(tool_calls)
                },
                tool_call_id: None,
                name: None,
            });
        }

        let tools = req.tools.as_ref().map(|ts| {
            ts.iter()
                .flat_map(|t| {
                    t.function_declarations.iter().map(|fd| IrTool {
                        name: fd.name.clone(),
                        description: fd.description.clone(),
                        parameters: fd.parameters.clone().unwrap_or(serde_json::json!({})),
                    })
                })
                .collect()
        });

        let tool_choice = match &req.tool_config {
            None => None,
            Some(tc) => {
                let cfg = &tc.function_calling_config;
                Some(match cfg.mode.as_str() {
                    "NONE" => IrToolChoice::None,
                    "AUTO" => IrToolChoice::Auto,
                    "ANY" => match cfg.allowed_function_names.as_deref() {
                        Some([name]) => IrToolChoice::Tool { name: name.clone() },
                        None => IrToolChoice::Any,
                        Some(_) => {
                            return Err(AppError::conversion(
                                FORMAT.as_str(),
                                "toolConfig.functionCallingConfig.allowedFunctionNames",
                                "only a single allowed function is supported",
                            ))
                        }
                    },
                    other => {
                        return Err(AppError::conversion(
                            FORMAT.as_str(),
                            "toolConfig.functionCallingConfig.mode",
                            format!("unsupported mode '{}'", other),
                        ))
                    }
                })
            }
        };

        let gen = req.generation_config.as_ref();

        Ok(IrChatRequest {
            model: String::new(), // Gemini model is in the URL path, not the body
            messages,
            system,
            temperature: gen.and_then(|g| g.temperature),
            top_p: gen.and_then(|g| g.top_p),
            max_tokens: gen.and_then(|g| g.max_output_tokens),
            stream: false, // Gemini stream is determined by the endpoint, not a body field
            stop: gen.and_then(|g| g.stop_sequences.clone()),
            tools,
            tool_choice,
            extra: IrExtra::from_fields(FORMAT, req.extra),
        })
    }

    fn decode_response(&self, body: &[u8]) -> Result<IrChatResponse, AppError> {
        let resp: GeminiResponse = from_json(FORMAT, body)?;

        let candidate = resp.candidates.into_iter().next().ok_or_else(|| {
            AppError::conversion(FORMAT.as_str(), "candidates", "no candidates in response")
        })?;

        let decoded = gemini_parts_to_ir(&candidate.content.parts, "candidates[0].content")?;
        let tool_calls: Vec<IrToolCall> = decoded
            .calls
            .into_iter()
            .enumerate()
            .map(|(k, (name, args))| IrToolCall {
                id: format!("call_{}", k),
                name,
                arguments: args.to_string(),
            })
            .collect();

        let finish_reason = if tool_calls.is_empty() {
            gemini_finish_to_ir(&candidate.finish_reason)
        } else {
            Some(IrFinishReason::ToolCalls)
        };

        Ok(IrChatResponse {
            id: resp.response_id.unwrap_or_default(),
            model: resp.model_version.unwrap_or_default(),
            message: IrMessage {
                role: IrRole::Assistant,
                content: decoded.content,
                tool_calls: if tool_calls.is_empty() {
                    None
                } else {
                    Some(tool_calls)
                },
                tool_call_id: None,
                name: None,
            },
            finish_reason,
            usage: resp.usage_metadata.as_ref().map(IrUsage::from),
        })
    }

    fn decode_stream_chunk(&mut self, data: &str) -> Result<Option<IrStreamChunk>, AppError> {
        if data.trim().is_empty() {
            return Ok(None);
        }

        // Each streaming chunk from Gemini has the same structure as a full response
        let chunk: GeminiResponse = from_json_str(FORMAT, data)?;
        let usage = chunk.usage_metadata.as_ref().map(IrUsage::from);

        let Some(candidate) = chunk.candidates.first() else {
            if usage.is_some() {
                return Ok(Some(IrStreamChunk {
                    id: chunk.response_id.unwrap_or_default(),
                    model: chunk.model_version,
                    usage,
                    ..Default::default()
                }));
            }
            return Ok(None);
        };

        let decoded = gemini_parts_to_ir(&candidate.content.parts, "candidates[0].content")?;
        let text = decoded.content.to_text();

        let delta_tool_calls: Vec<IrToolCallDelta> = decoded
            .calls
            .into_iter()
            .map(|(name, args)| {
                let index = self.next_call;
                self.next_call += 1;
                IrToolCallDelta {
                    index,
                    id: Some(format!("call_{}", index)),
                    name: Some(name),
                    arguments: Some(args.to_string()),
                }
            })
            .collect();
        if !delta_tool_calls.is_empty() {
            self.saw_tool_calls = true;
        }

        // the finish reason may arrive in a later chunk than the calls
        let finish_reason = match gemini_finish_to_ir(&candidate.finish_reason) {
            Some(IrFinishReason::Stop) if self.saw_tool_calls => Some(IrFinishReason::ToolCalls),
            other => other,
        };

        Ok(Some(IrStreamChunk {
            id: chunk.response_id.clone().unwrap_or_default(),
            model: chunk.model_version.clone(),
            delta_role: Some(IrRole::Assistant),
            delta_content: if text.is_empty() { None } else { Some(text) },
            delta_tool_calls: if delta_tool_calls.is_empty() {
                None
            } else {
                Some(delta_tool_calls)
            },
            finish_reason,
            usage,
        }))
    }

    fn is_stream_done(&self, _data: &str) -> bool {
        // Gemini streams end when the connection closes; there is no [DONE] signal.
        false
    }
}

// --- Encoder impl ---

impl GeminiCodec {
    fn flush_calls(&mut self) -> Result<Vec<GeminiPart>, AppError> {
        let pending = std::mem::take(&mut self.pending_calls);
        pending
            .into_iter()
            .map(|(index, (name, args))| {
                let args = parse_arguments(FORMAT, format!("delta_tool_calls[{}].arguments", index), &args)?;
                Ok(function_call_part(&name, args))
            })
            .collect()
    }

    fn chunk_event(
        parts: Vec<GeminiPart>,
        finish_reason: Option<String>,
        usage: Option<&IrUsage>,
    ) -> Result<SseEvent, AppError> {
        let gemini_chunk = GeminiResponse {
            candidates: vec![GeminiCandidate {
                content: GeminiContent {
                    role: Some("model".to_string()),
                    parts,
                },
                finish_reason,
            }],
            usage_metadata: usage.map(GeminiUsageMetadata::from),
            model_version: None,
            response_id: None,
        };
        Ok(SseEvent::data(to_json_str(FORMAT, &gemini_chunk)?))
    }
}

impl Encoder for GeminiCodec {
    fn encode_request(&self, ir: &IrChatRequest, _model: &str) -> Result<Vec<u8>, AppError> {
        check_request(FORMAT, ir)?;
        let mut contents: Vec<GeminiContent> = Vec::new();
        // call id -> function name, for tool results that only carry the id
        let mut call_names: Vec<(String, String)> = Vec::new();

        for (i, msg) in ir.messages.iter().enumerate() {
            match msg.role {
                // rejected by check_request
                IrRole::System => continue,
                IrRole::User => {
                    let parts = ir_content_to_gemini_parts(&msg.content);
                    if !parts.is_empty() {
                        contents.push(GeminiContent {
                            role: Some("user".to_string()),
                            parts,
                        });
                    }
                }
                IrRole::Assistant => {
                    let mut parts = ir_content_to_gemini_parts(&msg.content);

                    if let Some(tcs) = &msg.tool_calls {
                        for (k, tc) in tcs.iter().enumerate() {
                            let args = parse_arguments(
                                FORMAT,
                                format!("messages[{}].tool_calls[{}].arguments", i, k),
                                &tc.arguments,
                            )?;
                            call_names.push((tc.id.clone(), tc.name.clone()));
                            parts.push(function_call_part(&tc.name, args));
                        }
                    }

                    if !parts.is_empty() {
                        contents.push(GeminiContent {
                            role: Some("model".to_string()),
                            parts,
                        });
                    }
                }
                IrRole::Tool => {
                    if !msg.content.is_text_only() {
                        return Err(AppError::conversion(
                            FORMAT.as_str(),
                            format!("messages[{}].content", i),
                            "tool results must be text",
                        ));
                    }
                    let name = msg
                        .name
                        .clone()
                        .or_else(|| {
                            let id = msg.tool_call_id.as_ref()?;
                            call_names
                                .iter()
                                .find(|(call_id, _)| call_id == id)
                                .map(|(_, name)| name.clone())
                        })
                        .ok_or_else(|| {
                            AppError::conversion(
                                FORMAT.as_str(),
                                format!("messages[{}].name", i),
                                "tool result does not match any earlier tool call",
                            )
                        })?;

                    let part = GeminiPart {
                        function_response: Some(GeminiFunctionResponse {
                            name,
                            response: text_to_function_response(&msg.content.to_text()),
                        }),
                        ..Default::default()
                    };

                    // parallel results go back in one turn
                    match contents.last_mut() {
                        Some(last)
                            if last.role.as_deref() == Some("user")
                                && last.parts.iter().all(|p| p.function_response.is_some()) =>
                        {
                            last.parts.push(part)
                        }
                        _ => contents.push(GeminiContent {
                            role: Some("user".to_string()),
                            parts: vec![part],
                        }),
                    }
                }
            }
        }

        let system_instruction = ir.system.as_ref().map(|s| GeminiSystemInstruction {
            parts: vec![GeminiPart::text(s.clone())],
        });

        let generation_config = if ir.temperature.is_some()
            || ir.top_p.is_some()
            || ir.max_tokens.is_some()
            || ir.stop.is_some()
        {
            Some(GeminiGenerationConfig {
                temperature: ir.temperature,
                top_p: ir.top_p,
                max_output_tokens: ir.max_tokens,
                stop_sequences: ir.stop.clone(),
            })
        } else {
            None
        };

        let tools = ir.tools.as_ref().map(|ts| {
            vec![GeminiToolDeclaration {
                function_declarations: ts
                    .iter()
                    .map(|t| GeminiFunctionDeclaration {
                        name: t.name.clone(),
                        description: t.description.clone(),
                        parameters: Some(t.parameters.clone()),
                    })
                    .collect(),
            }]
        });

        let tool_config = ir.tool_choice.as_ref().map(|tc| {
            let (mode, allowed) = match tc {
                IrToolChoice::Auto => ("AUTO", None),
                IrToolChoice::None => ("NONE", None),
                IrToolChoice::Any => ("ANY", None),
                IrToolChoice::Tool { name } => ("ANY", Some(vec![name.clone()])),
            };
            GeminiToolConfig {
                function_calling_config: GeminiFunctionCallingConfig {
                    mode: mode.to_string(),
                    allowed_function_names: allowed,
                },
            }
        });

        let extra = match &ir.extra {
            Some(extra) if extra.format == FORMAT => extra.fields.clone(),
            _ => serde_json::Map::new(),
        };

        let req = GeminiRequest {
            contents,
            system_instruction,
            generation_config,
            tools,
            tool_config,
            extra,
        };

        to_json(FORMAT, &req)
    }

    fn encode_response(&self, ir: &IrChatResponse) -> Result<Vec<u8>, AppError> {
        check_response(FORMAT, ir)?;
        let mut parts = ir_content_to_gemini_parts(&ir.message.content);

        if let Some(tcs) = &ir.message.tool_calls {
            for (k, tc) in tcs.iter().enumerate() {
                let args = parse_arguments(
                    FORMAT,
                    format!("message.tool_calls[{}].arguments", k),
                    &tc.arguments,
                )?;
                parts.push(function_call_part(&tc.name, args));
            }
        }

        if parts.is_empty() {
            parts.push(GeminiPart::text(String::new()));
        }

        let resp = GeminiResponse {
            candidates: vec![GeminiCandidate {
                content: GeminiContent {
                    role: Some("model".to_string()),
                    parts,
                },
                finish_reason: ir_finish_to_gemini(&ir.finish_reason),
            }],
            usage_metadata: ir.usage.as_ref().map(GeminiUsageMetadata::from),
            model_version: Some(ir.model.clone()).filter(|m| !m.is_empty()),
            response_id: Some(ir.id.clone()).filter(|id| !id.is_empty()),
        };

        to_json(FORMAT, &resp)
    }

    fn encode_stream_chunk(&mut self, chunk: &IrStreamChunk) -> Result<Vec<SseEvent>, AppError> {
        let mut parts = Vec::new();

        if let Some(text) = chunk.delta_content.as_ref().filter(|t| !t.is_empty()) {
            parts.push(GeminiPart::text(text.clone()));
        }

        // functionCall parts must be whole; collect fragments until the turn ends
        if let Some(tcs) = &chunk.delta_tool_calls {
            for tc in tcs {
                let entry = self.pending_calls.entry(tc.index).or_default();
                if let Some(name) = &tc.name {
                    entry.0 = name.clone();
                }
                if let Some(args) = &tc.arguments {
                    entry.1.push_str(args);
                }
            }
        }

        if chunk.finish_reason.is_some() {
            parts.extend(self.flush_calls()?);
            self.flushed = true;
        }

        if parts.is_empty() && chunk.finish_reason.is_none() && chunk.usage.is_none() {
            return Ok(Vec::new());
        }

        Ok(vec![Self::chunk_event(
            parts,
            ir_finish_to_gemini(&chunk.finish_reason),
            chunk.usage.as_ref(),
        )?])
    }

    fn stream_done_signal(&mut self) -> Vec<SseEvent> {
        // Gemini streams end when the connection closes; only unflushed calls remain.
        if self.flushed || self.pending_calls.is_empty() {
            return Vec::new();
        }
        self.flushed = true;
        match self.flush_calls().and_then(|parts| Self::chunk_event(parts, Some("STOP".into()), None)) {
            Ok(event) => vec![event],
            Err(e) => {
                log::warn!("Dropping unterminated tool calls at end of stream: {}", e);
                Vec::new()
            }
        }
    }
}
