use axum::http::StatusCode;
use futures::stream::Stream;
use futures::StreamExt;
use lazy_static::lazy_static;
use reqwest::Client;
use secrecy::ExposeSecret;
use serde::Deserialize;
use serde_json::{json, Map, Value};

use crate::error::Error;
use crate::instance::{ModelInstance, ResponsePaths};

lazy_static! {
    static ref PLACEHOLDERS: Vec<&'static str> = vec![
        "$model",
        "$messages",
        "$stream",
        "$temperature",
        "$max_tokens",
        "$top_p",
        "$frequency_penalty",
        "$presence_penalty",
        "$user",
        "$stop",
        "$extra",
        "$idempotency_key",
    ];
}

/// The client-facing chat request.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct ChatParams {
    #[serde(default)]
    pub message: String,
    #[serde(default, alias = "idempotencyKey")]
    pub idempotency_key: Option<String>,
    /// Full messages array; legacy callers send only `message` and get it
    /// wrapped as a single user turn
    #[serde(default)]
    pub messages: Option<Value>,
    #[serde(default)]
    pub temperature: Option<Value>,
    #[serde(default)]
    pub max_tokens: Option<Value>,
    #[serde(default)]
    pub top_p: Option<Value>,
    #[serde(default)]
    pub frequency_penalty: Option<Value>,
    #[serde(default)]
    pub presence_penalty: Option<Value>,
    #[serde(default)]
    pub user: Option<Value>,
    #[serde(default)]
    pub stop: Option<Value>,
    #[serde(default)]
    pub extra: Option<Value>,
}

impl ChatParams {
    fn messages_value(&self) -> Value {
        match &self.messages {
            Some(messages) if !messages.is_null() => messages.clone(),
            _ => json!([{"role": "user", "content": self.message}]),
        }
    }
}

/// Build the downstream payload from the instance template. An absent or
/// invalid template falls back to the minimal streaming body. The `model`
/// field is overwritten with the instance's configured model name last,
/// whatever the template said.
pub fn render_payload(instance: &ModelInstance, params: &ChatParams, idempotency_key: &str) -> Value {
    let mut payload = if instance.request_template.trim().is_empty() {
        minimal_payload(instance, params)
    } else {
        match serde_json::from_str::<Value>(&instance.request_template) {
            Ok(template @ Value::Object(_)) => {
                rewrite(template, instance, params, idempotency_key)
                    .unwrap_or_else(|| minimal_payload(instance, params))
            }
            Ok(_) | Err(_) => {
                tracing::warn!(
                    "Instance `{}` has an invalid request template; using the minimal payload",
                    instance.id
                );
                minimal_payload(instance, params)
            }
        }
    };
    if let Value::Object(map) = &mut payload {
        map.insert("model".to_string(), json!(instance.model_name));
    }
    payload
}

fn minimal_payload(instance: &ModelInstance, params: &ChatParams) -> Value {
    json!({
        "stream": true,
        "model": instance.model_name,
        "messages": [{"role": "user", "content": params.message}],
    })
}

/// Recursive rewrite over the template: string values that exactly match a
/// known placeholder are replaced with the caller's value, or dropped when
/// the caller did not supply one. Everything else passes through.
fn rewrite(
    value: Value,
    instance: &ModelInstance,
    params: &ChatParams,
    idempotency_key: &str,
) -> Option<Value> {
    match value {
        Value::String(s) if PLACEHOLDERS.iter().any(|p| *p == s.as_str()) => {
            placeholder_value(&s, instance, params, idempotency_key)
        }
        Value::Object(map) => {
            let rewritten: Map<String, Value> = map
                .into_iter()
                .filter_map(|(key, value)| {
                    rewrite(value, instance, params, idempotency_key).map(|value| (key, value))
                })
                .collect();
            Some(Value::Object(rewritten))
        }
        Value::Array(items) => {
            let rewritten: Vec<Value> = items
                .into_iter()
                .filter_map(|value| rewrite(value, instance, params, idempotency_key))
                .collect();
            Some(Value::Array(rewritten))
        }
        other => Some(other),
    }
}

fn placeholder_value(
    name: &str,
    instance: &ModelInstance,
    params: &ChatParams,
    idempotency_key: &str,
) -> Option<Value> {
    match name {
        "$model" => Some(json!(instance.model_name)),
        "$messages" => Some(params.messages_value()),
        "$stream" => Some(json!(true)),
        "$temperature" => params.temperature.clone(),
        "$max_tokens" => params.max_tokens.clone(),
        "$top_p" => params.top_p.clone(),
        "$frequency_penalty" => params.frequency_penalty.clone(),
        "$presence_penalty" => params.presence_penalty.clone(),
        "$user" => params.user.clone(),
        "$stop" => params.stop.clone(),
        "$extra" => params.extra.clone(),
        "$idempotency_key" => Some(json!(idempotency_key)),
        _ => None,
    }
}

/// One normalized line from the upstream event stream.
#[derive(Clone, Debug, PartialEq)]
pub enum StreamLine {
    Done,
    Object(Value),
}

/// Normalize one upstream chunk into zero or more lines. Chunks may carry
/// several newline-separated events; anything that is neither `[DONE]` nor
/// a JSON object is dropped.
pub fn normalize_chunk(chunk: &str) -> Vec<StreamLine> {
    chunk.split('\n').filter_map(normalize_line).collect()
}

fn normalize_line(line: &str) -> Option<StreamLine> {
    let mut token = line.trim();
    // `data:` prefixes may stack; strip them all
    while let Some(rest) = token.strip_prefix("data:") {
        token = rest.trim();
    }
    if token.eq_ignore_ascii_case("[done]") {
        return Some(StreamLine::Done);
    }
    if token.starts_with('{') && token.ends_with('}') {
        return serde_json::from_str::<Value>(token)
            .ok()
            .map(StreamLine::Object);
    }
    None
}

/// Walk a dotted path through a JSON value. Segments that parse as integers
/// index into arrays; all other segments index into objects.
pub fn extract_path<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    let mut node = value;
    for segment in path.split('.') {
        if segment.is_empty() {
            return None;
        }
        node = match segment.parse::<usize>() {
            Ok(index) => node.as_array()?.get(index)?,
            Err(_) => node.as_object()?.get(segment)?,
        };
    }
    Some(node)
}

/// Per-request transform of normalized upstream objects into the uniform
/// chunk shape, with substitutes for missing fields.
#[derive(Debug)]
pub struct ChunkTransformer {
    raw_passthrough: bool,
    model_name: String,
    fallback_request_id: String,
    paths: ResponsePaths,
    next_sequence: u64,
}

impl ChunkTransformer {
    pub fn new(instance: &ModelInstance, fallback_request_id: String) -> Self {
        ChunkTransformer {
            raw_passthrough: instance.raw_passthrough,
            model_name: instance.model_name.clone(),
            fallback_request_id,
            paths: instance.response_paths.clone(),
            next_sequence: 0,
        }
    }

    pub fn transform(&mut self, value: Value) -> Value {
        if self.raw_passthrough {
            return value;
        }

        let request_id = extract_path(&value, &self.paths.request_id)
            .and_then(|v| v.as_str())
            .unwrap_or(&self.fallback_request_id)
            .to_string();

        let content = extract_path(&value, &self.paths.content)
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string();

        let sequence = match extract_path(&value, &self.paths.sequence).and_then(|v| v.as_u64()) {
            Some(sequence) => {
                self.next_sequence = sequence + 1;
                sequence
            }
            None => {
                let sequence = self.next_sequence;
                self.next_sequence += 1;
                sequence
            }
        };

        json!({
            "id": request_id,
            "object": "chat.completion.chunk",
            "model": self.model_name,
            "choices": [{"index": sequence, "delta": {"content": content}}],
        })
    }
}

/// Map a downstream HTTP error status onto the error taxonomy.
pub fn handle_downstream_error(status: StatusCode, body: &str) -> Error {
    match status {
        StatusCode::BAD_REQUEST
        | StatusCode::UNAUTHORIZED
        | StatusCode::FORBIDDEN
        | StatusCode::TOO_MANY_REQUESTS => Error::DownstreamClient {
            message: body.to_string(),
            status_code: status,
        },
        _ => Error::DownstreamServer {
            message: body.to_string(),
        },
    }
}

/// Send the rendered payload to the instance and return the open response.
/// The `azure` provider tag duplicates the key into an `api-key` header.
pub async fn open_stream(
    client: &Client,
    instance: &ModelInstance,
    payload: &Value,
    idempotency_key: &str,
) -> Result<reqwest::Response, Error> {
    let mut request = client
        .post(instance.url.clone())
        .header("Content-Type", "application/json")
        .bearer_auth(instance.api_key.expose_secret())
        .header("X-Request-Id", idempotency_key)
        .header("Idempotency-Key", idempotency_key)
        .json(payload);
    if instance.provider.eq_ignore_ascii_case("azure") {
        request = request.header("api-key", instance.api_key.expose_secret());
    }

    let response = request.send().await.map_err(|e| Error::DownstreamServer {
        message: format!("Error sending request to `{}`: {e}", instance.url),
    })?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(handle_downstream_error(status, &body));
    }
    Ok(response)
}

/// Normalize the upstream byte stream into transformed lines. Lines may span
/// chunk boundaries, so bytes are reassembled before normalization; output
/// order equals upstream arrival order, and the stream ends at the first
/// `[DONE]`.
pub fn transform_stream(
    response: reqwest::Response,
    mut transformer: ChunkTransformer,
) -> impl Stream<Item = Result<StreamLine, Error>> {
    async_stream::stream! {
        let upstream = response.bytes_stream();
        futures::pin_mut!(upstream);
        let mut buffer = String::new();
        while let Some(chunk) = upstream.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(e) => {
                    yield Err(Error::DownstreamServer {
                        message: format!("Error reading downstream stream: {e}"),
                    });
                    return;
                }
            };
            buffer.push_str(&String::from_utf8_lossy(&chunk));
            while let Some(newline) = buffer.find('\n') {
                let line: String = buffer.drain(..=newline).collect();
                match normalize_line(&line) {
                    Some(StreamLine::Done) => {
                        yield Ok(StreamLine::Done);
                        return;
                    }
                    Some(StreamLine::Object(value)) => {
                        yield Ok(StreamLine::Object(transformer.transform(value)));
                    }
                    None => {}
                }
            }
        }
        // The upstream may end without a trailing newline
        match normalize_line(&buffer) {
            Some(StreamLine::Done) => yield Ok(StreamLine::Done),
            Some(StreamLine::Object(value)) => {
                yield Ok(StreamLine::Object(transformer.transform(value)));
            }
            None => {}
        }
    }
}
