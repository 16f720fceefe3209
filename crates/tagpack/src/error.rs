//! # Error Definitions
//!
//! Everything that can go wrong while turning values into tagged JSON or back.

/// Codec failures.
#[derive(Debug, Clone, PartialEq)]
pub enum Error {
    /// The host value has no wire representation (a live handle, socket, ...).
    NotSerializable { type_name: String },
    /// The value nests deeper than `MAX_DEPTH`.
    DepthExceeded,
    /// A `ref` or `stream_ref` payload is malformed.
    InvalidRef(String),
    /// A known tag with a malformed payload.
    InvalidTag { tag: String, reason: String },
    /// A `__type__` marker naming a tag outside the fixed set.
    UnknownTag(String),
    /// The payload was written by a newer schema than this codec understands.
    UnsupportedSchema(u64),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotSerializable { type_name } => write!(f, "value of type '{}' is not serializable", type_name),
            Self::DepthExceeded => write!(f, "value nesting exceeds the depth limit"),
            Self::InvalidRef(reason) => write!(f, "invalid ref payload: {}", reason),
            Self::InvalidTag { tag, reason } => write!(f, "invalid '{}' payload: {}", tag, reason),
            Self::UnknownTag(tag) => write!(f, "unknown type tag '{}'", tag),
            Self::UnsupportedSchema(v) => write!(f, "unsupported schema version {}", v),
        }
    }
}

impl std::error::Error for Error {}

/// A specialized Result type for codec operations.
pub type Result<T> = std::result::Result<T, Error>;
