//! # Wire Tags
//!
//! The fixed set of type markers and the helpers that stamp them onto objects.

use serde_json::Map;
use serde_json::Value as Json;

/// Key carrying the type marker of a tagged object.
pub const TYPE_KEY: &str = "__type__";

/// Key carrying the schema version of a tagged object.
pub const SCHEMA_KEY: &str = "__schema__";

/// The schema version written by this codec.
pub const SCHEMA_VERSION: u64 = 1;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Tag {
    Bytes,
    Tuple,
    Set,
    FrozenSet,
    Complex,
    DateTime,
    Date,
    Time,
    Dict,
    Symbol,
    SpecialFloat,
    Ref,
    StreamRef,
    Callback,
}

impl Tag {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Bytes => "bytes",
            Self::Tuple => "tuple",
            Self::Set => "set",
            Self::FrozenSet => "frozenset",
            Self::Complex => "complex",
            Self::DateTime => "datetime",
            Self::Date => "date",
            Self::Time => "time",
            Self::Dict => "dict",
            Self::Symbol => "symbol",
            Self::SpecialFloat => "special_float",
            Self::Ref => "ref",
            Self::StreamRef => "stream_ref",
            Self::Callback => "callback",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        let tag = match s {
            "bytes" => Self::Bytes,
            "tuple" => Self::Tuple,
            "set" => Self::Set,
            "frozenset" => Self::FrozenSet,
            "complex" => Self::Complex,
            "datetime" => Self::DateTime,
            "date" => Self::Date,
            "time" => Self::Time,
            "dict" => Self::Dict,
            // older peers call symbols atoms
            "symbol" | "atom" => Self::Symbol,
            "special_float" => Self::SpecialFloat,
            "ref" => Self::Ref,
            "stream_ref" => Self::StreamRef,
            "callback" => Self::Callback,
            _ => return None,
        };
        Some(tag)
    }
}

/// Builds a tagged object from its payload fields.
pub fn tagged<const N: usize>(tag: Tag, fields: [(&str, Json); N]) -> Json {
    let mut map = Map::with_capacity(N + 2);
    map.insert(TYPE_KEY.to_string(), Json::String(tag.as_str().to_string()));
    map.insert(SCHEMA_KEY.to_string(), Json::from(SCHEMA_VERSION));
    for (k, v) in fields {
        map.insert(k.to_string(), v);
    }
    Json::Object(map)
}

/// Returns the tag name if the JSON value is a tagged object.
pub fn tag_of(json: &Json) -> Option<&str> {
    json.as_object()?.get(TYPE_KEY)?.as_str()
}
