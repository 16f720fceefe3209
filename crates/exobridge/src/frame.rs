//! # Frames
//!
//! The messages that travel over a `Transport`, one JSON document each.
//!
//! ```text
//! {"frame":"call",         "seq":1, "envelope":{...}}                       host -> worker
//! {"frame":"reply",        "seq":1, "result":{"status":"ok","value":...}}   worker -> host
//! {"frame":"invoke",       "seq":7, "session_id":..., "callback_id":..., "args":[...]}
//! {"frame":"invoke_reply", "seq":7, "result":{"status":"error","error":{...}}}
//! ```
//!
//! Call and reply sequence numbers belong to the host, invoke and invoke_reply
//! sequence numbers belong to the worker. The two spaces never mix.
//!
//! ## Nesting
//! serde_json's own recursion limit counts JSON levels, and a tagged container
//! costs up to three of them (`dict` pairs). Frames are instead checked against
//! `MAX_FRAME_DEPTH` with a flat scan and then parsed without that limit, so any
//! value the codec accepts also fits in a frame.

use serde::Deserialize;
use serde::Serialize;
use serde_json::Map;
use serde_json::Value as Json;

use crate::error::Error;
use crate::error::Result;

/// A single message on the wire.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "frame", rename_all = "snake_case")]
pub enum Frame {
    Call { seq: u64, envelope: Envelope },
    Reply { seq: u64, result: Outcome },
    Invoke { seq: u64, session_id: String, callback_id: String, args: Vec<Json> },
    InvokeReply { seq: u64, result: Outcome },
}

/// JSON nesting allowed in one frame: three levels per value level, plus the
/// frame's own wrappers.
pub const MAX_FRAME_DEPTH: usize = 3 * (tagpack::MAX_DEPTH + 1) + 8;

impl Frame {
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(Error::from)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let depth = json_depth(bytes);
        if depth > MAX_FRAME_DEPTH {
            return Err(Error::Protocol(format!(
                "frame nests {} levels deep, limit is {}",
                depth, MAX_FRAME_DEPTH
            )));
        }

        let mut de = serde_json::Deserializer::from_slice(bytes);
        de.disable_recursion_limit();
        let frame = Frame::deserialize(&mut de)?;
        de.end()?;
        Ok(frame)
    }
}

/// The routing part of a frame, readable even when the rest is malformed.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct FrameHead {
    pub frame: String,
    pub seq: u64,
}

impl FrameHead {
    /// Reads `frame` and `seq` from a frame that failed to parse. `None` when
    /// even those are missing or the frame is too deep to look at.
    pub fn peek(bytes: &[u8]) -> Option<Self> {
        if json_depth(bytes) > MAX_FRAME_DEPTH {
            return None;
        }
        let mut de = serde_json::Deserializer::from_slice(bytes);
        de.disable_recursion_limit();
        Self::deserialize(&mut de).ok()
    }
}

/// Deepest bracket nesting in a JSON document, ignoring brackets inside
/// strings. Malformed input gives a meaningless but finite answer.
fn json_depth(bytes: &[u8]) -> usize {
    let mut depth = 0usize;
    let mut deepest = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for &b in bytes {
        if in_string {
            match b {
                _ if escaped => escaped = false,
                b'\\' => escaped = true,
                b'"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'[' | b'{' => {
                depth += 1;
                deepest = deepest.max(depth);
            }
            b']' | b'}' => depth = depth.saturating_sub(1),
            _ => {}
        }
    }
    deepest
}

/// The result carried by a reply. The `status` discriminator keeps a foreign
/// value that happens to look like an error from being read as one.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Outcome {
    Ok { value: Json },
    Error { error: WireError },
}

impl Outcome {
    pub fn into_result(self) -> Result<Json> {
        match self {
            Self::Ok { value } => Ok(value),
            Self::Error { error } => Err(Error::from_wire(error)),
        }
    }
}

impl From<Result<Json>> for Outcome {
    fn from(result: Result<Json>) -> Self {
        match result {
            Ok(value) => Self::Ok { value },
            Err(e) => Self::Error { error: e.to_wire() },
        }
    }
}

/// `{kind, message, detail?}`
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WireError {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NotSerializable,
    RefNotFound,
    SessionMismatch,
    InvalidRef,
    WorkerBusy,
    CallbackNotFound,
    ArityMismatch,
    Timeout,
    StreamExhausted,
    InvalidEnvelope,
    Foreign,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallType {
    DynamicCall,
    MethodCall,
    AttrGet,
    AttrSet,
    ModuleAttr,
    StreamNext,
    ReleaseRef,
    ReleaseSession,
}

impl CallType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DynamicCall => "dynamic_call",
            Self::MethodCall => "method_call",
            Self::AttrGet => "attr_get",
            Self::AttrSet => "attr_set",
            Self::ModuleAttr => "module_attr",
            Self::StreamNext => "stream_next",
            Self::ReleaseRef => "release_ref",
            Self::ReleaseSession => "release_session",
        }
    }
}

/// Per-session registry limits, sent along with calls on configured sessions.
/// Zero disables the corresponding limit.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionLimits {
    pub ttl_secs: u64,
    pub max_refs: usize,
}

/// A request to a worker.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub call_type: CallType,
    #[serde(default)]
    pub library: String,
    #[serde(default)]
    pub source_module: String,
    /// Function name for `dynamic_call`, method name for `method_call`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attr: Option<String>,
    /// The ref or stream ref a call operates on.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<Json>,
    /// The new value for `attr_set`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Json>,
    #[serde(default)]
    pub args: Vec<Json>,
    #[serde(default)]
    pub kwargs: Map<String, Json>,
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pool_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limits: Option<SessionLimits>,
}

impl Envelope {
    pub fn new(call_type: CallType) -> Self {
        Self {
            call_type,
            library: String::new(),
            source_module: String::new(),
            function: None,
            attr: None,
            target: None,
            value: None,
            args: Vec::new(),
            kwargs: Map::new(),
            session_id: String::new(),
            pool_name: None,
            limits: None,
        }
    }

    /// The function or attribute name, for diagnostics.
    pub fn name(&self) -> &str {
        self.function.as_deref().or(self.attr.as_deref()).unwrap_or("")
    }
}
