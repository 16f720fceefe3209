//! # Error Definitions
//!
//! The bridge-wide error taxonomy and its mapping to and from the wire.
//!
//! ## Invariants
//! - Every wire error kind maps onto exactly one variant, and back.
//! - Nothing here ever turns a failure into a plausible value. End of stream is
//!   the one sentinel, and it is surfaced as `StreamItem::End` by the caller.

use crate::frame::ErrorKind;
use crate::frame::WireError;
use crate::pool::WorkerId;
use crate::registry;
use crate::transport;

/// Bridge errors.
#[derive(Debug, Clone, PartialEq)]
pub enum Error {
    /// A host value has no wire representation.
    NotSerializable { type_name: String },
    /// The ref is unknown, released, expired or evicted.
    RefNotFound { ref_id: String },
    /// The ref exists but belongs to a different session.
    SessionMismatch { ref_id: String, session_id: String },
    /// A ref payload is malformed.
    InvalidRef(String),
    /// The preferred worker is busy and the affinity mode does not wait.
    WorkerBusy(WorkerId),
    /// The preferred worker is gone or tainted under a strict mode.
    PreferredWorkerUnavailable(WorkerId),
    /// No worker in the pool can take the call right now.
    NoWorkerAvailable { pool: String },
    /// The foreign iterator has no more items.
    StreamExhausted,
    /// The foreign side invoked a callback that was never registered.
    CallbackNotFound(String),
    /// A callback was invoked with the wrong number of arguments.
    ArityMismatch { callback_id: String, expected: usize, got: usize },
    /// The call did not complete before its deadline.
    Timeout,
    /// The session was released while still in use.
    SessionReleased(String),
    /// `with_session` named a session that is already open.
    SessionExists(String),
    /// No pool is registered under this name.
    PoolNotFound(String),
    /// A call option named a timeout profile that is not configured.
    UnknownProfile(String),
    /// The worker could not make sense of a request envelope.
    InvalidEnvelope(String),
    /// Foreign code raised. `detail` carries the foreign exception type.
    Foreign { message: String, detail: Option<String> },
    /// Encoding or decoding failed for a reason other than the above.
    Codec(tagpack::Error),
    Transport(transport::Error),
    /// A peer broke the frame protocol.
    Protocol(String),
    Config(String),
}

impl Error {
    /// Shorthand for a foreign exception of type `type_name`.
    pub fn foreign(type_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Foreign {
            message: message.into(),
            detail: Some(type_name.into()),
        }
    }

    /// Converts the error into its wire form.
    pub fn to_wire(&self) -> WireError {
        let (kind, detail) = match self {
            Self::NotSerializable { type_name } => (ErrorKind::NotSerializable, Some(type_name.clone())),
            Self::RefNotFound { ref_id } => (ErrorKind::RefNotFound, Some(ref_id.clone())),
            Self::SessionMismatch { ref_id, .. } => (ErrorKind::SessionMismatch, Some(ref_id.clone())),
            Self::InvalidRef(_) => (ErrorKind::InvalidRef, None),
            Self::WorkerBusy(id) => (ErrorKind::WorkerBusy, Some(id.0.to_string())),
            Self::CallbackNotFound(id) => (ErrorKind::CallbackNotFound, Some(id.clone())),
            Self::ArityMismatch { callback_id, expected, got } => {
                (ErrorKind::ArityMismatch, Some(format!("{}:{}:{}", callback_id, expected, got)))
            }
            Self::Timeout => (ErrorKind::Timeout, None),
            Self::StreamExhausted => (ErrorKind::StreamExhausted, None),
            Self::InvalidEnvelope(_) => (ErrorKind::InvalidEnvelope, None),
            Self::Foreign { detail, .. } => (ErrorKind::Foreign, detail.clone()),
            other => (ErrorKind::Foreign, Some(other.kind_name().to_string())),
        };

        let message = match self {
            Self::InvalidRef(msg) | Self::InvalidEnvelope(msg) => msg.clone(),
            Self::Foreign { message, .. } => message.clone(),
            other => other.to_string(),
        };

        WireError { kind, message, detail }
    }

    /// Rebuilds an error from its wire form.
    pub fn from_wire(wire: WireError) -> Self {
        let WireError { kind, message, detail } = wire;
        let detail_or_message = || detail.clone().unwrap_or_else(|| message.clone());

        match kind {
            ErrorKind::NotSerializable => Self::NotSerializable { type_name: detail_or_message() },
            ErrorKind::RefNotFound => Self::RefNotFound { ref_id: detail_or_message() },
            ErrorKind::SessionMismatch => Self::SessionMismatch {
                ref_id: detail_or_message(),
                session_id: String::new(),
            },
            ErrorKind::InvalidRef => Self::InvalidRef(message),
            ErrorKind::WorkerBusy => {
                let id = detail.as_deref().and_then(|d| d.parse().ok()).unwrap_or_default();
                Self::WorkerBusy(WorkerId(id))
            }
            ErrorKind::CallbackNotFound => Self::CallbackNotFound(detail_or_message()),
            ErrorKind::ArityMismatch => {
                let parsed = detail.as_deref().and_then(|d| {
                    let mut parts = d.rsplitn(3, ':');
                    let got = parts.next()?.parse().ok()?;
                    let expected = parts.next()?.parse().ok()?;
                    Some((parts.next()?.to_string(), expected, got))
                });
                match parsed {
                    Some((callback_id, expected, got)) => Self::ArityMismatch { callback_id, expected, got },
                    None => Self::Foreign { message, detail },
                }
            }
            ErrorKind::Timeout => Self::Timeout,
            ErrorKind::StreamExhausted => Self::StreamExhausted,
            ErrorKind::InvalidEnvelope => Self::InvalidEnvelope(message),
            ErrorKind::Foreign => Self::Foreign { message, detail },
        }
    }

    fn kind_name(&self) -> &'static str {
        match self {
            Self::NotSerializable { .. } => "not_serializable",
            Self::RefNotFound { .. } => "ref_not_found",
            Self::SessionMismatch { .. } => "session_mismatch",
            Self::InvalidRef(_) => "invalid_ref",
            Self::WorkerBusy(_) => "worker_busy",
            Self::PreferredWorkerUnavailable(_) => "preferred_worker_unavailable",
            Self::NoWorkerAvailable { .. } => "no_worker_available",
            Self::StreamExhausted => "stream_exhausted",
            Self::CallbackNotFound(_) => "callback_not_found",
            Self::ArityMismatch { .. } => "arity_mismatch",
            Self::Timeout => "timeout",
            Self::SessionReleased(_) => "session_released",
            Self::SessionExists(_) => "session_exists",
            Self::PoolNotFound(_) => "pool_not_found",
            Self::UnknownProfile(_) => "unknown_profile",
            Self::InvalidEnvelope(_) => "invalid_envelope",
            Self::Foreign { .. } => "foreign",
            Self::Codec(_) => "codec",
            Self::Transport(_) => "transport",
            Self::Protocol(_) => "protocol",
            Self::Config(_) => "config",
        }
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotSerializable { type_name } => write!(f, "Value of type '{}' is not serializable", type_name),
            Self::RefNotFound { ref_id } => write!(f, "Ref not found: {}", ref_id),
            Self::SessionMismatch { ref_id, session_id } => {
                write!(f, "Ref {} does not belong to session '{}'", ref_id, session_id)
            }
            Self::InvalidRef(msg) => write!(f, "Invalid ref: {}", msg),
            Self::WorkerBusy(id) => write!(f, "Preferred worker {} is busy", id),
            Self::PreferredWorkerUnavailable(id) => write!(f, "Preferred worker {} is unavailable", id),
            Self::NoWorkerAvailable { pool } => write!(f, "No worker available in pool '{}'", pool),
            Self::StreamExhausted => write!(f, "Stream exhausted"),
            Self::CallbackNotFound(id) => write!(f, "Callback not found: {}", id),
            Self::ArityMismatch { callback_id, expected, got } => {
                write!(f, "Callback {} expects {} arguments, got {}", callback_id, expected, got)
            }
            Self::Timeout => write!(f, "Call timed out"),
            Self::SessionReleased(id) => write!(f, "Session '{}' has been released", id),
            Self::SessionExists(id) => write!(f, "Session '{}' is already open", id),
            Self::PoolNotFound(name) => write!(f, "Pool not found: {}", name),
            Self::UnknownProfile(name) => write!(f, "Unknown timeout profile: {}", name),
            Self::InvalidEnvelope(msg) => write!(f, "Invalid envelope: {}", msg),
            Self::Foreign { message, detail: Some(ty) } => write!(f, "{}: {}", ty, message),
            Self::Foreign { message, detail: None } => write!(f, "Foreign error: {}", message),
            Self::Codec(e) => write!(f, "Codec error: {}", e),
            Self::Transport(e) => write!(f, "Transport error: {}", e),
            Self::Protocol(msg) => write!(f, "Protocol error: {}", msg),
            Self::Config(msg) => write!(f, "Config error: {}", msg),
        }
    }
}

impl std::error::Error for Error {}

impl From<tagpack::Error> for Error {
    fn from(e: tagpack::Error) -> Self {
        match e {
            tagpack::Error::NotSerializable { type_name } => Self::NotSerializable { type_name },
            tagpack::Error::InvalidRef(msg) => Self::InvalidRef(msg),
            other => Self::Codec(other),
        }
    }
}

impl From<transport::Error> for Error {
    fn from(e: transport::Error) -> Self {
        Self::Transport(e)
    }
}

impl From<registry::Error> for Error {
    fn from(e: registry::Error) -> Self {
        match e {
            registry::Error::NotFound(ref_id) => Self::RefNotFound { ref_id },
            registry::Error::SessionMismatch { ref_id, session_id } => Self::SessionMismatch { ref_id, session_id },
            registry::Error::SessionReleased(session_id) => Self::SessionReleased(session_id),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Protocol(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
