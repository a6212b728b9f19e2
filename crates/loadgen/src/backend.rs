//! Request and response shaping for the supported serving backends.
//!
//! Each backend family is a [`BackendCodec`] chosen once from
//! [`BackendKind`]. The executor only talks to the trait: it asks for the
//! endpoint path and request body, hands back the terminal payload, and
//! receives either a [`Generation`] or a [`MalformedResponse`] that is
//! retried like an endpoint-reported error.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Deserialize;
use serde_json::{json, Value};
use thiserror::Error;

use crate::config::SamplingConfig;
use crate::tokens::TokenCounter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackendKind {
    Ksana,
    Vllm,
    KsanaServer,
    VllmServer,
    TrtLlm,
    Evart,
    MindieService,
}

impl BackendKind {
    pub const ALL: [BackendKind; 7] = [
        BackendKind::Ksana,
        BackendKind::Vllm,
        BackendKind::KsanaServer,
        BackendKind::VllmServer,
        BackendKind::TrtLlm,
        BackendKind::Evart,
        BackendKind::MindieService,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Ksana => "ksana",
            BackendKind::Vllm => "vllm",
            BackendKind::KsanaServer => "ksana-server",
            BackendKind::VllmServer => "vllm-server",
            BackendKind::TrtLlm => "trt-llm",
            BackendKind::Evart => "evart",
            BackendKind::MindieService => "mindie-service",
        }
    }

    /// Online chat servers apply the chat template themselves.
    pub fn applies_server_template(&self) -> bool {
        matches!(self, BackendKind::KsanaServer | BackendKind::VllmServer)
    }

    /// Backends whose responses carry no token ids.
    pub fn needs_client_tokenizer(&self) -> bool {
        matches!(
            self,
            BackendKind::TrtLlm | BackendKind::Vllm | BackendKind::MindieService
        )
    }

    pub fn codec(&self) -> Arc<dyn BackendCodec> {
        match self {
            BackendKind::Ksana => Arc::new(KsanaCodec),
            BackendKind::TrtLlm => Arc::new(TritonCodec),
            BackendKind::Vllm => Arc::new(GenerateCodec::new(GenerateFlavor::Vllm)),
            BackendKind::Evart => Arc::new(GenerateCodec::new(GenerateFlavor::Evart)),
            BackendKind::MindieService => Arc::new(GenerateCodec::new(GenerateFlavor::Mindie)),
            BackendKind::KsanaServer => Arc::new(ChatServerCodec::new(ChatFlavor::Ksana)),
            BackendKind::VllmServer => Arc::new(ChatServerCodec::new(ChatFlavor::Vllm)),
        }
    }
}

impl FromStr for BackendKind {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let value = value.trim().to_lowercase();
        BackendKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == value)
            .ok_or_else(|| format!("unknown backend '{value}'"))
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Decoded result of one successful exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Generation {
    pub text: String,
    pub input_tokens: usize,
    pub output_tokens: usize,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("malformed response: {0}")]
pub struct MalformedResponse(pub String);

impl MalformedResponse {
    fn missing(field: &str) -> Self {
        MalformedResponse(format!("missing field `{field}`"))
    }
}

/// Which part of a streamed body carries the terminal response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadScope {
    /// Only the final message is a complete response document.
    LastMessage,
    /// The whole body is a sequence of `data:` segments to be merged.
    EventStream,
}

pub trait BackendCodec: Send + Sync + fmt::Debug {
    fn kind(&self) -> BackendKind;

    fn endpoint_path(&self) -> &'static str {
        "/generate"
    }

    fn request_body(&self, prompt: &str, sampling: &SamplingConfig, stream: bool) -> Value;

    fn stream_scope(&self) -> PayloadScope {
        PayloadScope::LastMessage
    }

    fn parse_terminal(&self, payload: &str, _stream: bool) -> Result<Value, MalformedResponse> {
        parse_json(payload)
    }

    /// An `error` key marks a response that must be retried.
    fn is_error(&self, response: &Value) -> bool {
        response.get("error").is_some()
    }

    fn decode(
        &self,
        prompt: &str,
        response: &Value,
        stream: bool,
        tokens: Option<&dyn TokenCounter>,
    ) -> Result<Generation, MalformedResponse>;
}

#[derive(Debug, Clone, Copy)]
pub struct KsanaCodec;

impl BackendCodec for KsanaCodec {
    fn kind(&self) -> BackendKind {
        BackendKind::Ksana
    }

    fn request_body(&self, prompt: &str, sampling: &SamplingConfig, stream: bool) -> Value {
        json!({
            "prompt": prompt,
            "sampling_config": {
                "temperature": sampling.temperature,
                "topk": sampling.topk,
                "topp": sampling.topp,
                "num_beams": sampling.num_beams,
                "num_return_sequences": sampling.num_return_sequences,
                "length_penalty": sampling.length_penalty,
                "repetition_penalty": sampling.repetition_penalty,
                "logprobs": sampling.logprobs,
                "max_new_tokens": sampling.max_new_tokens,
                "stop_token_ids": sampling.stop_token_ids,
            },
            "stream": stream,
        })
    }

    fn decode(
        &self,
        _prompt: &str,
        response: &Value,
        _stream: bool,
        _tokens: Option<&dyn TokenCounter>,
    ) -> Result<Generation, MalformedResponse> {
        let text = response
            .pointer("/texts/0")
            .and_then(Value::as_str)
            .unwrap_or_default();
        let (input_tokens, output_tokens) = reported_token_counts(response);
        Ok(Generation {
            text: text.trim().to_string(),
            input_tokens,
            output_tokens,
        })
    }
}

/// TensorRT-LLM ensemble endpoint.
#[derive(Debug, Clone, Copy)]
pub struct TritonCodec;

impl BackendCodec for TritonCodec {
    fn kind(&self) -> BackendKind {
        BackendKind::TrtLlm
    }

    fn endpoint_path(&self) -> &'static str {
        "/v2/models/ensemble/generate"
    }

    fn request_body(&self, prompt: &str, sampling: &SamplingConfig, _stream: bool) -> Value {
        json!({
            "text_input": prompt,
            "max_tokens": sampling.max_new_tokens,
            "bad_words": "",
            "stop_words": "",
            "top_k": sampling.topk,
        })
    }

    fn decode(
        &self,
        prompt: &str,
        response: &Value,
        _stream: bool,
        tokens: Option<&dyn TokenCounter>,
    ) -> Result<Generation, MalformedResponse> {
        let text = response
            .get("text_output")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .trim()
            .to_string();
        let (input_tokens, output_tokens) = client_token_counts(prompt, &text, tokens);
        Ok(Generation {
            text,
            input_tokens,
            output_tokens,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenerateFlavor {
    Vllm,
    Evart,
    Mindie,
}

/// vLLM-style `/generate` servers returning a `text` list.
#[derive(Debug, Clone, Copy)]
pub struct GenerateCodec {
    flavor: GenerateFlavor,
}

impl GenerateCodec {
    pub fn new(flavor: GenerateFlavor) -> Self {
        Self { flavor }
    }
}

impl BackendCodec for GenerateCodec {
    fn kind(&self) -> BackendKind {
        match self.flavor {
            GenerateFlavor::Vllm => BackendKind::Vllm,
            GenerateFlavor::Evart => BackendKind::Evart,
            GenerateFlavor::Mindie => BackendKind::MindieService,
        }
    }

    fn request_body(&self, prompt: &str, sampling: &SamplingConfig, stream: bool) -> Value {
        json!({
            "prompt": prompt,
            "use_beam_search": false,
            "n": 1,
            "temperature": sampling.temperature,
            "max_tokens": sampling.max_new_tokens,
            "logprobs": sampling.logprobs,
            "repetition_penalty": sampling.repetition_penalty,
            "stop_token_ids": sampling.stop_token_ids,
            "skip_special_tokens": false,
            "spaces_between_special_tokens": false,
            "top_p": sampling.topp,
            "top_k": sampling.topk,
            "stream": stream,
        })
    }

    fn decode(
        &self,
        prompt: &str,
        response: &Value,
        _stream: bool,
        tokens: Option<&dyn TokenCounter>,
    ) -> Result<Generation, MalformedResponse> {
        let raw = response
            .pointer("/text/0")
            .and_then(Value::as_str)
            .ok_or_else(|| MalformedResponse::missing("text[0]"))?;

        match self.flavor {
            GenerateFlavor::Evart => {
                let (input_tokens, output_tokens) = reported_token_counts(response);
                Ok(Generation {
                    text: raw.trim().to_string(),
                    input_tokens,
                    output_tokens,
                })
            }
            GenerateFlavor::Vllm | GenerateFlavor::Mindie => {
                // These servers echo the prompt ahead of the completion.
                let text = skip_chars(raw, prompt.chars().count()).trim().to_string();
                let (input_tokens, output_tokens) = client_token_counts(prompt, &text, tokens);
                Ok(Generation {
                    text,
                    input_tokens,
                    output_tokens,
                })
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatFlavor {
    Ksana,
    Vllm,
}

/// OpenAI-style `/v1/chat` servers.
#[derive(Debug, Clone, Copy)]
pub struct ChatServerCodec {
    flavor: ChatFlavor,
}

impl ChatServerCodec {
    pub fn new(flavor: ChatFlavor) -> Self {
        Self { flavor }
    }
}

impl BackendCodec for ChatServerCodec {
    fn kind(&self) -> BackendKind {
        match self.flavor {
            ChatFlavor::Ksana => BackendKind::KsanaServer,
            ChatFlavor::Vllm => BackendKind::VllmServer,
        }
    }

    fn endpoint_path(&self) -> &'static str {
        "/v1/chat"
    }

    fn request_body(&self, prompt: &str, sampling: &SamplingConfig, stream: bool) -> Value {
        let task_id = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_secs_f64())
            .unwrap_or_default();
        json!({
            "model": "default_model",
            "prompt": prompt,
            "top_p": sampling.topp,
            "temperature": sampling.temperature,
            "top_k": sampling.topk,
            "num_beams": sampling.num_beams,
            "repetition_penalty": sampling.repetition_penalty,
            "logprobs": sampling.logprobs,
            "n": 1,
            "task_id": task_id,
            "delete_prompt_from_output": 0,
            "stream": stream,
            "stop_token_ids": sampling.stop_token_ids,
        })
    }

    fn stream_scope(&self) -> PayloadScope {
        PayloadScope::EventStream
    }

    fn parse_terminal(&self, payload: &str, stream: bool) -> Result<Value, MalformedResponse> {
        if stream {
            merge_event_stream(payload)
        } else {
            parse_json(payload)
        }
    }

    fn decode(
        &self,
        prompt: &str,
        response: &Value,
        stream: bool,
        _tokens: Option<&dyn TokenCounter>,
    ) -> Result<Generation, MalformedResponse> {
        let pointer = if stream {
            "/choices/0/delta/content"
        } else {
            "/choices/0/message/content"
        };
        let content = response
            .pointer(pointer)
            .and_then(Value::as_str)
            .ok_or_else(|| MalformedResponse::missing(pointer))?;

        match self.flavor {
            ChatFlavor::Ksana => {
                let usage = |field: &str| {
                    response
                        .pointer(&format!("/usage/{field}"))
                        .and_then(Value::as_u64)
                        .map(|count| count as usize)
                        .ok_or_else(|| MalformedResponse::missing(&format!("usage.{field}")))
                };
                Ok(Generation {
                    text: content.to_string(),
                    input_tokens: usage("prompt_tokens")?,
                    output_tokens: usage("completion_tokens")?,
                })
            }
            ChatFlavor::Vllm => {
                let (input_tokens, output_tokens) = reported_token_counts(response);
                Ok(Generation {
                    text: skip_chars(content, prompt.chars().count()).trim().to_string(),
                    input_tokens,
                    output_tokens,
                })
            }
        }
    }
}

fn parse_json(payload: &str) -> Result<Value, MalformedResponse> {
    serde_json::from_str(payload).map_err(|err| MalformedResponse(err.to_string()))
}

/// Merge `data: {...}` segments, concatenating every `choices[0].delta.content`
/// into the last segment.
pub fn merge_event_stream(payload: &str) -> Result<Value, MalformedResponse> {
    let mut content = String::new();
    let mut last: Option<Value> = None;

    for segment in payload.trim().split("\n\n") {
        let segment = segment.trim();
        if segment.is_empty() {
            continue;
        }
        let (_, data) = segment
            .split_once(": ")
            .ok_or_else(|| MalformedResponse(format!("unnamed stream segment: {segment}")))?;
        if data.trim() == "[DONE]" {
            continue;
        }
        let value = parse_json(data)?;
        if let Some(delta) = value.pointer("/choices/0/delta/content").and_then(Value::as_str) {
            content.push_str(delta);
        }
        last = Some(value);
    }

    let mut last = last.ok_or_else(|| MalformedResponse("empty event stream".to_string()))?;
    if let Some(slot) = last.pointer_mut("/choices/0/delta/content") {
        *slot = Value::String(content);
    }
    Ok(last)
}

/// `(len(input_token_ids), len(output_token_ids[0]))`, zero when absent.
fn reported_token_counts(response: &Value) -> (usize, usize) {
    let input = response
        .get("input_token_ids")
        .and_then(Value::as_array)
        .map_or(0, Vec::len);
    let output = response
        .pointer("/output_token_ids/0")
        .and_then(Value::as_array)
        .map_or(0, Vec::len);
    (input, output)
}

fn client_token_counts(
    prompt: &str,
    text: &str,
    tokens: Option<&dyn TokenCounter>,
) -> (usize, usize) {
    tokens.map_or((0, 0), |counter| (counter.count(prompt), counter.count(text)))
}

fn skip_chars(text: &str, count: usize) -> &str {
    match text.char_indices().nth(count) {
        Some((offset, _)) => &text[offset..],
        None => "",
    }
}
