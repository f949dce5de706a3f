//! Wire codec for the plugin protocol.
//!
//! Every message is a 4-byte big-endian length followed by that many bytes of UTF-8
//! JSON holding a JSON-RPC 2.0 envelope. The host sends requests; plugins answer with
//! responses (correlated by id) and with notifications (`stream`, `complete`, `error`,
//! `log`) that carry no id.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;

pub const JSONRPC_VERSION: &str = "2.0";
/// Protocol revision a manifest must declare and `initialize` announces.
pub const PROTOCOL_VERSION: &str = "2.0";
pub const ENGINE_VERSION: &str = env!("CARGO_PKG_VERSION");

pub const HEADER_LEN: usize = 4;
pub const MAX_MESSAGE_SIZE: usize = 10 * 1024 * 1024;

pub const PING_TIMEOUT: Duration = Duration::from_millis(1_000);
pub const EXECUTE_TIMEOUT: Duration = Duration::from_millis(30_000);
/// Quiet period after which a waiting caller pings the plugin.
pub const PING_INTERVAL: Duration = Duration::from_millis(2_000);
pub const HEARTBEAT_TIMEOUT: Duration = Duration::from_millis(5_000);
pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_millis(5_000);

/// Method names used on the wire.
pub mod method {
    pub const INITIALIZE: &str = "initialize";
    pub const EXECUTE: &str = "execute";
    pub const SHUTDOWN: &str = "shutdown";
    pub const PING: &str = "ping";
    pub const INPUT: &str = "input";

    pub const STREAM: &str = "stream";
    pub const COMPLETE: &str = "complete";
    pub const ERROR: &str = "error";
    pub const LOG: &str = "log";
}

/// Numeric error codes: the JSON-RPC reserved range plus plugin-specific ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    ParseError,
    InvalidRequest,
    MethodNotFound,
    InvalidParams,
    InternalError,
    PluginError,
    Timeout,
    RateLimited,
}

impl ErrorCode {
    pub const fn code(self) -> i64 {
        match self {
            ErrorCode::ParseError => -32700,
            ErrorCode::InvalidRequest => -32600,
            ErrorCode::MethodNotFound => -32601,
            ErrorCode::InvalidParams => -32602,
            ErrorCode::InternalError => -32603,
            ErrorCode::PluginError => -1,
            ErrorCode::Timeout => -2,
            ErrorCode::RateLimited => -3,
        }
    }

    pub fn from_code(code: i64) -> Option<Self> {
        [
            ErrorCode::ParseError,
            ErrorCode::InvalidRequest,
            ErrorCode::MethodNotFound,
            ErrorCode::InvalidParams,
            ErrorCode::InternalError,
            ErrorCode::PluginError,
            ErrorCode::Timeout,
            ErrorCode::RateLimited,
        ]
        .into_iter()
        .find(|candidate| candidate.code() == code)
    }
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("frame header needs {HEADER_LEN} bytes, got {0}")]
    ShortHeader(usize),
    #[error("declared message length {len} exceeds limit of {max} bytes")]
    MessageTooLarge { len: usize, max: usize },
    #[error("message body is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unsupported jsonrpc version {0:?}")]
    Version(Option<String>),
    #[error("invalid envelope: {0}")]
    InvalidEnvelope(&'static str),
}

/// Prefix a JSON payload with its big-endian byte length.
pub fn frame(payload: &Value) -> Result<Vec<u8>, ProtocolError> {
    let body = serde_json::to_vec(payload)?;
    if body.len() > MAX_MESSAGE_SIZE {
        return Err(ProtocolError::MessageTooLarge {
            len: body.len(),
            max: MAX_MESSAGE_SIZE,
        });
    }
    let mut framed = Vec::with_capacity(HEADER_LEN + body.len());
    // Bounded by MAX_MESSAGE_SIZE above, so the cast cannot truncate.
    framed.extend_from_slice(&(body.len() as u32).to_be_bytes());
    framed.extend_from_slice(&body);
    Ok(framed)
}

pub fn decode_length(header: &[u8]) -> Result<usize, ProtocolError> {
    let bytes: [u8; HEADER_LEN] = header
        .get(..HEADER_LEN)
        .and_then(|slice| slice.try_into().ok())
        .ok_or(ProtocolError::ShortHeader(header.len()))?;
    Ok(u32::from_be_bytes(bytes) as usize)
}

/// Decode one frame body (without its header) into a classified message.
pub fn decode_body(body: &[u8]) -> Result<Message, ProtocolError> {
    let value: Value = serde_json::from_slice(body)?;
    Message::from_value(value)
}

pub fn timestamp_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or_default()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub id: u64,
    pub method: String,
    pub params: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Result(Value),
    Error(RpcError),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub id: u64,
    pub outcome: Outcome,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub method: String,
    pub params: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Request(Request),
    Response(Response),
    Notification(Notification),
}

/// One prior turn handed to a plugin alongside an `execute` call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextMessage {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecuteParams {
    pub function: String,
    #[serde(default)]
    pub arguments: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<Vec<ContextMessage>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_info: Option<String>,
}

impl Request {
    pub fn new(id: u64, method: &str, params: Value) -> Self {
        Self {
            id,
            method: method.to_string(),
            params,
        }
    }

    pub fn initialize(id: u64) -> Self {
        Self::new(
            id,
            method::INITIALIZE,
            json!({ "protocol_version": PROTOCOL_VERSION, "engine_version": ENGINE_VERSION }),
        )
    }

    pub fn execute(id: u64, params: &ExecuteParams) -> Self {
        let params = serde_json::to_value(params).unwrap_or_else(|_| json!({}));
        Self::new(id, method::EXECUTE, params)
    }

    pub fn shutdown(id: u64) -> Self {
        Self::new(id, method::SHUTDOWN, json!({}))
    }

    pub fn ping(id: u64) -> Self {
        Self::new(id, method::PING, json!({ "timestamp": timestamp_millis() }))
    }

    /// Forward one line of user text to a plugin holding an open session.
    pub fn input(id: u64, content: &str) -> Self {
        Self::new(
            id,
            method::INPUT,
            json!({ "content": content, "timestamp": timestamp_millis() }),
        )
    }
}

impl Response {
    pub fn result(id: u64, result: Value) -> Self {
        Self {
            id,
            outcome: Outcome::Result(result),
        }
    }

    pub fn error(id: u64, code: i64, message: impl Into<String>) -> Self {
        Self {
            id,
            outcome: Outcome::Error(RpcError {
                code,
                message: message.into(),
                data: None,
            }),
        }
    }

    /// Pong: a result carrying the echoed `timestamp`.
    pub fn is_pong(&self) -> bool {
        matches!(&self.outcome, Outcome::Result(Value::Object(map)) if map.contains_key("timestamp"))
    }

    /// Input acknowledgement: `{"acknowledged": true}`. The turn itself ends with `complete`.
    pub fn is_acknowledgement(&self) -> bool {
        matches!(
            &self.outcome,
            Outcome::Result(Value::Object(map)) if map.get("acknowledged") == Some(&Value::Bool(true))
        )
    }
}

impl Notification {
    pub fn new(method: &str, params: Value) -> Self {
        Self {
            method: method.to_string(),
            params,
        }
    }

    pub fn stream(data: &str) -> Self {
        Self::new(method::STREAM, json!({ "data": data }))
    }

    pub fn complete(success: bool, data: &str, keep_session: bool) -> Self {
        Self::new(
            method::COMPLETE,
            json!({ "success": success, "data": data, "keep_session": keep_session }),
        )
    }

    pub fn error(code: i64, message: &str) -> Self {
        Self::new(method::ERROR, json!({ "code": code, "message": message }))
    }

    pub fn log(level: &str, message: &str) -> Self {
        Self::new(method::LOG, json!({ "level": level, "message": message }))
    }

    /// Interpret the notification. Missing fields fall back to protocol defaults.
    pub fn event(&self) -> PluginEvent {
        let params = self.params.clone();
        match self.method.as_str() {
            method::STREAM => {
                let StreamParams { data } = serde_json::from_value(params).unwrap_or_default();
                PluginEvent::Stream { data }
            }
            method::COMPLETE => {
                let CompleteParams {
                    success,
                    data,
                    keep_session,
                } = serde_json::from_value(params).unwrap_or_default();
                PluginEvent::Complete {
                    success,
                    data,
                    keep_session,
                }
            }
            method::ERROR => {
                let ErrorParams { code, message } =
                    serde_json::from_value(params).unwrap_or_default();
                PluginEvent::Error { code, message }
            }
            method::LOG => {
                let LogParams { level, message } =
                    serde_json::from_value(params).unwrap_or_default();
                PluginEvent::Log { level, message }
            }
            other => PluginEvent::Unknown {
                method: other.to_string(),
            },
        }
    }
}

/// Notification payloads a plugin may send.
#[derive(Debug, Clone, PartialEq)]
pub enum PluginEvent {
    Stream {
        data: String,
    },
    Complete {
        success: bool,
        data: String,
        keep_session: bool,
    },
    Error {
        code: i64,
        message: String,
    },
    Log {
        level: String,
        message: String,
    },
    Unknown {
        method: String,
    },
}

#[derive(Debug, Default, Deserialize)]
struct StreamParams {
    #[serde(default)]
    data: String,
}

#[derive(Debug, Deserialize)]
struct CompleteParams {
    #[serde(default = "default_true")]
    success: bool,
    #[serde(default)]
    data: String,
    #[serde(default)]
    keep_session: bool,
}

impl Default for CompleteParams {
    fn default() -> Self {
        Self {
            success: true,
            data: String::new(),
            keep_session: false,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ErrorParams {
    #[serde(default = "default_error_code")]
    code: i64,
    #[serde(default = "default_error_message")]
    message: String,
}

impl Default for ErrorParams {
    fn default() -> Self {
        Self {
            code: default_error_code(),
            message: default_error_message(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct LogParams {
    #[serde(default = "default_log_level")]
    level: String,
    #[serde(default)]
    message: String,
}

impl Default for LogParams {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            message: String::new(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_error_code() -> i64 {
    ErrorCode::PluginError.code()
}

fn default_error_message() -> String {
    "Unknown error".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Message {
    /// Classify a decoded JSON value.
    ///
    /// A request has both `id` and `method`; a response has `id` and exactly one of
    /// `result`/`error`; a notification has `method` and no `id`.
    pub fn from_value(value: Value) -> Result<Self, ProtocolError> {
        let Value::Object(mut map) = value else {
            return Err(ProtocolError::InvalidEnvelope("message is not a JSON object"));
        };

        match map.get("jsonrpc") {
            Some(Value::String(version)) if version == JSONRPC_VERSION => {}
            Some(Value::String(version)) => {
                return Err(ProtocolError::Version(Some(version.clone())))
            }
            _ => return Err(ProtocolError::Version(None)),
        }

        let id = map.remove("id");
        let method = map.remove("method");
        let params = map.remove("params").unwrap_or_else(|| json!({}));

        match (id, method) {
            (Some(id), Some(method)) => Ok(Message::Request(Request {
                id: parse_id(&id)?,
                method: parse_method(method)?,
                params,
            })),
            (Some(id), None) => {
                let id = parse_id(&id)?;
                let outcome = match (map.remove("result"), map.remove("error")) {
                    (Some(result), None) => Outcome::Result(result),
                    (None, Some(error)) => Outcome::Error(serde_json::from_value(error)?),
                    (Some(_), Some(_)) => {
                        return Err(ProtocolError::InvalidEnvelope(
                            "response carries both result and error",
                        ))
                    }
                    (None, None) => {
                        return Err(ProtocolError::InvalidEnvelope(
                            "response carries neither result nor error",
                        ))
                    }
                };
                Ok(Message::Response(Response { id, outcome }))
            }
            (None, Some(method)) => Ok(Message::Notification(Notification {
                method: parse_method(method)?,
                params,
            })),
            (None, None) => Err(ProtocolError::InvalidEnvelope(
                "message has neither id nor method",
            )),
        }
    }

    pub fn to_value(&self) -> Value {
        let mut map = Map::new();
        map.insert("jsonrpc".into(), Value::from(JSONRPC_VERSION));
        match self {
            Message::Request(request) => {
                map.insert("id".into(), Value::from(request.id));
                map.insert("method".into(), Value::from(request.method.as_str()));
                map.insert("params".into(), request.params.clone());
            }
            Message::Response(response) => {
                map.insert("id".into(), Value::from(response.id));
                match &response.outcome {
                    Outcome::Result(result) => {
                        map.insert("result".into(), result.clone());
                    }
                    Outcome::Error(error) => {
                        map.insert("error".into(), json!(error));
                    }
                }
            }
            Message::Notification(notification) => {
                map.insert("method".into(), Value::from(notification.method.as_str()));
                map.insert("params".into(), notification.params.clone());
            }
        }
        Value::Object(map)
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        frame(&self.to_value())
    }
}

impl From<Request> for Message {
    fn from(request: Request) -> Self {
        Message::Request(request)
    }
}

impl From<Response> for Message {
    fn from(response: Response) -> Self {
        Message::Response(response)
    }
}

impl From<Notification> for Message {
    fn from(notification: Notification) -> Self {
        Message::Notification(notification)
    }
}

fn parse_id(id: &Value) -> Result<u64, ProtocolError> {
    id.as_u64()
        .ok_or(ProtocolError::InvalidEnvelope("id is not a non-negative integer"))
}

fn parse_method(method: Value) -> Result<String, ProtocolError> {
    match method {
        Value::String(name) => Ok(name),
        _ => Err(ProtocolError::InvalidEnvelope("method is not a string")),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DecodeState {
    AwaitingHeader,
    AwaitingBody(usize),
}

/// Incremental frame reader.
///
/// Bytes are pushed in whatever chunks the pipe produces; complete frames are pulled
/// out one at a time. A header declaring more than the size limit cannot be trusted,
/// so the decoder slides forward one byte at a time until a plausible header appears.
/// One error is reported per run of discarded bytes.
#[derive(Debug)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
    state: DecodeState,
    max_len: usize,
    resyncing: bool,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::with_limit(MAX_MESSAGE_SIZE)
    }
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_limit(max_len: usize) -> Self {
        Self {
            buffer: Vec::new(),
            state: DecodeState::AwaitingHeader,
            max_len,
            resyncing: false,
        }
    }

    pub fn extend(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Bytes held back waiting for the rest of a frame.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn next_frame(&mut self) -> Option<Result<Message, ProtocolError>> {
        loop {
            match self.state {
                DecodeState::AwaitingHeader => {
                    let len = decode_length(&self.buffer).ok()?;
                    if len > self.max_len {
                        self.buffer.drain(..1);
                        if !self.resyncing {
                            self.resyncing = true;
                            return Some(Err(ProtocolError::MessageTooLarge {
                                len,
                                max: self.max_len,
                            }));
                        }
                        continue;
                    }
                    self.resyncing = false;
                    self.buffer.drain(..HEADER_LEN);
                    self.state = DecodeState::AwaitingBody(len);
                }
                DecodeState::AwaitingBody(len) => {
                    if self.buffer.len() < len {
                        return None;
                    }
                    let body: Vec<u8> = self.buffer.drain(..len).collect();
                    self.state = DecodeState::AwaitingHeader;
                    return Some(decode_body(&body));
                }
            }
        }
    }
}
