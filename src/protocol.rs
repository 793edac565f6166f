//! Purpose: Transport-agnostic notebook-protocol core for the kernel.
//! Key exports: `KernelDispatcher`, `KernelHandler`, `Envelope`, `Header`, `KernelRequest`.
//! Role: Shared protocol adapter between a transport and the kernel handler.
//! Invariants: Request routing by `msg_type` is deterministic; unknown kinds get no reply.
//! Invariants: Every routed request is bracketed by `busy`/`idle` status messages.
//! Invariants: Malformed request content maps to an error reply, never a panic.
//! Invariants: Only fatal (`Contract`) or transport errors escape `dispatch` as `Err`.
use getrandom::fill as fill_random;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use crate::core::channel::{ExecutionState, OutputMessage, Publisher};
use crate::core::completeness::CompletenessVerdict;
use crate::core::error::{Error, ErrorKind};
use crate::core::execute::{ExecutionReply, ExecutionRequest, ExecutionStatus};
use crate::core::inspect::InspectResult;

pub const PROTOCOL_VERSION: &str = "5.3";
const INVALID_REQUEST_ENAME: &str = "InvalidRequest";
const REQUEST_SUFFIX: &str = "_request";
const REPLY_SUFFIX: &str = "_reply";

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    #[serde(default)]
    pub msg_id: String,
    pub msg_type: String,
    #[serde(default)]
    pub session: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub date: String,
    #[serde(default)]
    pub version: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub header: Header,
    #[serde(default = "empty_object")]
    pub parent_header: Value,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    #[serde(default = "empty_object")]
    pub content: Value,
}

impl Envelope {
    /// Build a message whose parent is `parent` (or no parent for unsolicited output).
    pub fn new(msg_type: &str, parent: Option<&Header>, content: Value) -> Result<Self, Error> {
        let header = Header {
            msg_id: new_msg_id()?,
            msg_type: msg_type.to_string(),
            session: parent.map(|p| p.session.clone()).unwrap_or_default(),
            username: parent.map(|p| p.username.clone()).unwrap_or_default(),
            date: now_rfc3339()?,
            version: PROTOCOL_VERSION.to_string(),
        };
        let parent_header = match parent {
            Some(parent) => serde_json::to_value(parent).map_err(|err| {
                Error::new(ErrorKind::Internal)
                    .with_message("failed to encode parent header")
                    .with_source(err)
            })?,
            None => empty_object(),
        };
        Ok(Self {
            header,
            parent_header,
            metadata: Map::new(),
            content,
        })
    }

    pub fn msg_type(&self) -> &str {
        &self.header.msg_type
    }
}

fn empty_object() -> Value {
    Value::Object(Map::new())
}

pub fn parse_envelope_line(line: &str) -> Result<Envelope, ProtocolError> {
    let value = serde_json::from_str::<Value>(line)
        .map_err(|_| ProtocolError::new("invalid JSON"))?;
    serde_json::from_value(value)
        .map_err(|err| ProtocolError::new(format!("invalid message envelope: {err}")))
}

/// A request the kernel could not interpret; answered with an error reply.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProtocolError {
    pub message: String,
}

impl ProtocolError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn reply_content(&self) -> Value {
        json!({
            "status": "error",
            "ename": INVALID_REQUEST_ENAME,
            "evalue": self.message,
            "traceback": [],
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum KernelRequest {
    Execute(ExecutionRequest),
    IsComplete { code: String },
    Inspect { code: String, detail_level: u8 },
    KernelInfo,
    Shutdown { restart: bool },
}

/// Parse request content for `msg_type`. `Ok(None)` means the kind is not handled.
pub fn parse_request(
    msg_type: &str,
    content: &Value,
) -> Result<Option<KernelRequest>, ProtocolError> {
    let request = match msg_type {
        "execute_request" => {
            let params = require_object(content, msg_type)?;
            KernelRequest::Execute(ExecutionRequest {
                code: require_str(params, "code", msg_type)?,
                silent: optional_bool(params, "silent", msg_type)?,
            })
        }
        "is_complete_request" => {
            let params = require_object(content, msg_type)?;
            KernelRequest::IsComplete {
                code: require_str(params, "code", msg_type)?,
            }
        }
        "inspect_request" => {
            let params = require_object(content, msg_type)?;
            let detail_level = match params.get("detail_level") {
                None | Some(Value::Null) => 0,
                Some(value) => value
                    .as_u64()
                    .and_then(|level| u8::try_from(level).ok())
                    .ok_or_else(|| {
                        ProtocolError::new(format!(
                            "{msg_type} `detail_level` must be a small non-negative integer"
                        ))
                    })?,
            };
            KernelRequest::Inspect {
                code: require_str(params, "code", msg_type)?,
                detail_level,
            }
        }
        "kernel_info_request" => KernelRequest::KernelInfo,
        "shutdown_request" => {
            let params = require_object(content, msg_type)?;
            KernelRequest::Shutdown {
                restart: optional_bool(params, "restart", msg_type)?,
            }
        }
        _ => return Ok(None),
    };
    Ok(Some(request))
}

fn require_object<'a>(
    content: &'a Value,
    msg_type: &str,
) -> Result<&'a Map<String, Value>, ProtocolError> {
    content
        .as_object()
        .ok_or_else(|| ProtocolError::new(format!("{msg_type} requires object content")))
}

fn require_str(
    params: &Map<String, Value>,
    field: &str,
    msg_type: &str,
) -> Result<String, ProtocolError> {
    params
        .get(field)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| ProtocolError::new(format!("{msg_type} requires string field `{field}`")))
}

fn optional_bool(
    params: &Map<String, Value>,
    field: &str,
    msg_type: &str,
) -> Result<bool, ProtocolError> {
    match params.get(field) {
        None | Some(Value::Null) => Ok(false),
        Some(Value::Bool(flag)) => Ok(*flag),
        Some(_) => Err(ProtocolError::new(format!(
            "{msg_type} `{field}` must be a boolean"
        ))),
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct LanguageInfo {
    pub name: String,
    pub mimetype: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct KernelInfo {
    pub protocol_version: String,
    pub implementation: String,
    pub implementation_version: String,
    pub language_info: LanguageInfo,
    pub banner: String,
}

impl Default for KernelInfo {
    fn default() -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION.to_string(),
            implementation: "imathics".to_string(),
            implementation_version: env!("CARGO_PKG_VERSION").to_string(),
            language_info: LanguageInfo {
                name: "Mathematica".to_string(),
                mimetype: "text/x-mathematica".to_string(),
            },
            banner: "Mathics kernel".to_string(),
        }
    }
}

pub trait KernelHandler {
    fn kernel_info(&self) -> KernelInfo;
    fn execute(
        &mut self,
        request: ExecutionRequest,
        publisher: &mut dyn Publisher,
    ) -> Result<ExecutionReply, Error>;
    fn is_complete(&self, code: &str) -> CompletenessVerdict;
    fn inspect(&self, name: &str, detail_level: u8) -> InspectResult;
}

#[derive(Clone, Debug, PartialEq)]
pub enum DispatchOutcome {
    Reply { msg_type: String, content: Value },
    /// Reply, then stop serving.
    Shutdown { msg_type: String, content: Value },
    NoReply,
}

pub struct KernelDispatcher<H> {
    handler: H,
}

impl<H: KernelHandler> KernelDispatcher<H> {
    pub fn new(handler: H) -> Self {
        Self { handler }
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    pub fn handler_mut(&mut self) -> &mut H {
        &mut self.handler
    }

    pub fn dispatch(
        &mut self,
        request: &Envelope,
        publisher: &mut dyn Publisher,
    ) -> Result<DispatchOutcome, Error> {
        let msg_type = request.msg_type();
        let parsed = match parse_request(msg_type, &request.content) {
            Ok(Some(kernel_request)) => Ok(kernel_request),
            Ok(None) => {
                tracing::warn!(msg_type, "ignoring unsupported request kind");
                return Ok(DispatchOutcome::NoReply);
            }
            Err(error) => Err(error),
        };
        let reply_type = reply_type_for(msg_type);
        let shutdown = matches!(parsed, Ok(KernelRequest::Shutdown { .. }));

        publisher.publish(OutputMessage::Status {
            execution_state: ExecutionState::Busy,
        })?;
        let content = match parsed {
            Ok(kernel_request) => self.route(kernel_request, publisher)?,
            Err(error) => {
                tracing::warn!(msg_type, error = %error.message, "rejecting malformed request");
                error.reply_content()
            }
        };
        publisher.publish(OutputMessage::Status {
            execution_state: ExecutionState::Idle,
        })?;

        if shutdown {
            tracing::info!("shutdown requested");
            Ok(DispatchOutcome::Shutdown {
                msg_type: reply_type,
                content,
            })
        } else {
            Ok(DispatchOutcome::Reply {
                msg_type: reply_type,
                content,
            })
        }
    }

    fn route(
        &mut self,
        request: KernelRequest,
        publisher: &mut dyn Publisher,
    ) -> Result<Value, Error> {
        match request {
            KernelRequest::Execute(execute) => {
                let reply = self.handler.execute(execute, publisher)?;
                Ok(execute_reply_content(&reply))
            }
            KernelRequest::IsComplete { code } => to_value(self.handler.is_complete(&code)),
            KernelRequest::Inspect { code, detail_level } => {
                let result = self.handler.inspect(&code, detail_level);
                Ok(json!({
                    "status": "ok",
                    "found": result.found,
                    "data": result.data.to_json(),
                    "metadata": {},
                }))
            }
            KernelRequest::KernelInfo => {
                let mut content = to_value(self.handler.kernel_info())?;
                if let Value::Object(map) = &mut content {
                    map.insert("status".to_string(), json!("ok"));
                }
                Ok(content)
            }
            KernelRequest::Shutdown { restart } => {
                Ok(json!({ "status": "ok", "restart": restart }))
            }
        }
    }
}

pub fn execute_reply_content(reply: &ExecutionReply) -> Value {
    let mut content = Map::new();
    let status = match reply.status {
        ExecutionStatus::Ok => "ok",
        ExecutionStatus::Error => "error",
    };
    content.insert("status".to_string(), json!(status));
    content.insert("execution_count".to_string(), json!(reply.execution_count));
    content.insert("payload".to_string(), json!([]));
    content.insert("user_expressions".to_string(), json!({}));
    if let Some(error) = &reply.error {
        content.insert("ename".to_string(), json!(error.name));
        content.insert("evalue".to_string(), json!(error.value));
        content.insert("traceback".to_string(), json!(error.traceback));
    }
    Value::Object(content)
}

fn reply_type_for(msg_type: &str) -> String {
    match msg_type.strip_suffix(REQUEST_SUFFIX) {
        Some(stem) => format!("{stem}{REPLY_SUFFIX}"),
        None => format!("{msg_type}{REPLY_SUFFIX}"),
    }
}

fn to_value<T: Serialize>(value: T) -> Result<Value, Error> {
    serde_json::to_value(value).map_err(|err| {
        Error::new(ErrorKind::Internal)
            .with_message("failed to encode reply")
            .with_source(err)
    })
}

fn new_msg_id() -> Result<String, Error> {
    let mut bytes = [0u8; 16];
    fill_random(&mut bytes).map_err(|err| {
        Error::new(ErrorKind::Internal).with_message(format!("failed to generate message id: {err}"))
    })?;
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        out.push_str(&format!("{byte:02x}"));
    }
    Ok(out)
}

fn now_rfc3339() -> Result<String, Error> {
    use time::format_description::well_known::Rfc3339;
    time::OffsetDateTime::now_utc().format(&Rfc3339).map_err(|err| {
        Error::new(ErrorKind::Internal)
            .with_message("failed to format timestamp")
            .with_source(err)
    })
}
