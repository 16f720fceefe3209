//! # Host Values
//!
//! The host-side model of everything that can cross the bridge, plus the
//! proxies (`Ref`, `StreamRef`, `CallbackRef`) that stand in for what can't.
//!
//! `Opaque` is the odd one out: it is a live handle with identity but no data.
//! The host codec refuses to encode it; the worker-side encoder turns it into a
//! ref or stream ref.

use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use chrono::FixedOffset;
use chrono::NaiveDate;
use chrono::NaiveDateTime;
use chrono::NaiveTime;

/// A host value.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    None,
    Bool(bool),
    Int(i64),
    /// An integer above `i64::MAX`. Anything that fits in `i64` is an `Int`.
    UInt(u64),
    Float(f64),
    Str(String),
    /// Binary data that travels as a plain string when it is valid UTF-8.
    Binary(Vec<u8>),
    /// The explicit "send as bytes" wrapper. Always uses the `bytes` tag.
    Bytes(Vec<u8>),
    List(Vec<Value>),
    /// A map with string keys.
    Map(BTreeMap<String, Value>),
    /// A map with arbitrary keys, in insertion order.
    Dict(Vec<(Value, Value)>),
    Tuple(Vec<Value>),
    Set(Vec<Value>),
    FrozenSet(Vec<Value>),
    Complex { real: f64, imag: f64 },
    DateTime(DateTime),
    Date(NaiveDate),
    Time(Time),
    /// An interned name. Only allowlisted names survive decoding as symbols.
    Symbol(String),
    Ref(Ref),
    StreamRef(StreamRef),
    Callback(CallbackRef),
    Opaque(Opaque),
}

/// A datetime, with or without a UTC offset.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DateTime {
    Naive(NaiveDateTime),
    Offset(chrono::DateTime<FixedOffset>),
}

/// A time of day, with or without a UTC offset.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Time {
    Naive(NaiveTime),
    Offset(NaiveTime, FixedOffset),
}

/// Proxy for a foreign object that cannot cross the wire as data.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Ref {
    pub id: String,
    pub session_id: String,
    pub pool_name: Option<String>,
    pub type_name: String,
    pub source_module: String,
    pub library: Option<String>,
}

/// The flavour of foreign lazy sequence behind a `StreamRef`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StreamKind {
    Generator,
    Iterator,
    AsyncGenerator,
}

impl StreamKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Generator => "generator",
            Self::Iterator => "iterator",
            Self::AsyncGenerator => "async_generator",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "generator" => Some(Self::Generator),
            "iterator" => Some(Self::Iterator),
            "async_generator" => Some(Self::AsyncGenerator),
            _ => None,
        }
    }
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Proxy for a foreign generator or iterator.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct StreamRef {
    pub id: String,
    pub session_id: String,
    pub pool_name: Option<String>,
    pub stream_kind: StreamKind,
    pub exhausted: bool,
}

/// A host function the foreign side may invoke. `arity` of `None` is variadic.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct CallbackRef {
    pub id: String,
    pub arity: Option<usize>,
}

/// What an `Opaque` handle looks like to the worker-side encoder.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum OpaqueKind {
    Object,
    Stream(StreamKind),
}

/// A live handle with identity and no data representation.
///
/// Equality is identity: two `Opaque`s are equal only if they share the same
/// allocation.
#[derive(Clone)]
pub struct Opaque {
    type_name: String,
    module: String,
    kind: OpaqueKind,
    inner: Arc<dyn Any + Send + Sync>,
}

impl Opaque {
    /// Wraps any value, naming it after its Rust type.
    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        let full = std::any::type_name::<T>();
        let path_end = full.find('<').unwrap_or(full.len());
        let (module, type_name) = match full[..path_end].rfind("::") {
            Some(i) => (&full[..i], &full[i + 2..]),
            None => ("", full),
        };
        Self::object(type_name, module, value)
    }

    /// Wraps a foreign object.
    pub fn object<T: Any + Send + Sync>(type_name: impl Into<String>, module: impl Into<String>, value: T) -> Self {
        Self {
            type_name: type_name.into(),
            module: module.into(),
            kind: OpaqueKind::Object,
            inner: Arc::new(value),
        }
    }

    /// Wraps a foreign generator or iterator.
    pub fn stream<T: Any + Send + Sync>(kind: StreamKind, type_name: impl Into<String>, module: impl Into<String>, value: T) -> Self {
        Self {
            type_name: type_name.into(),
            module: module.into(),
            kind: OpaqueKind::Stream(kind),
            inner: Arc::new(value),
        }
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn module(&self) -> &str {
        &self.module
    }

    pub fn kind(&self) -> OpaqueKind {
        self.kind
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.inner.downcast_ref::<T>()
    }

    /// A stable address for the underlying allocation, used for memoization.
    pub fn identity(&self) -> usize {
        Arc::as_ptr(&self.inner) as *const () as usize
    }
}

impl PartialEq for Opaque {
    fn eq(&self, other: &Self) -> bool {
        self.identity() == other.identity()
    }
}

impl fmt::Debug for Opaque {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Opaque<{}.{}>", self.module, self.type_name)
    }
}

impl Value {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            Self::Float(f) => Some(*f),
            Self::Int(i) => Some(*i as f64),
            Self::UInt(u) => Some(*u as f64),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Self::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Self::Map(map) => Some(map),
            _ => None,
        }
    }

    pub fn as_object_ref(&self) -> Option<&Ref> {
        match self {
            Self::Ref(r) => Some(r),
            _ => None,
        }
    }

    pub fn as_stream_ref(&self) -> Option<&StreamRef> {
        match self {
            Self::StreamRef(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_opaque(&self) -> Option<&Opaque> {
        match self {
            Self::Opaque(o) => Some(o),
            _ => None,
        }
    }

    /// Short name of the variant, used in diagnostics.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Bool(_) => "bool",
            Self::Int(_) | Self::UInt(_) => "int",
            Self::Float(_) => "float",
            Self::Str(_) => "str",
            Self::Binary(_) => "binary",
            Self::Bytes(_) => "bytes",
            Self::List(_) => "list",
            Self::Map(_) => "map",
            Self::Dict(_) => "dict",
            Self::Tuple(_) => "tuple",
            Self::Set(_) => "set",
            Self::FrozenSet(_) => "frozenset",
            Self::Complex { .. } => "complex",
            Self::DateTime(_) => "datetime",
            Self::Date(_) => "date",
            Self::Time(_) => "time",
            Self::Symbol(_) => "symbol",
            Self::Ref(_) => "ref",
            Self::StreamRef(_) => "stream_ref",
            Self::Callback(_) => "callback",
            Self::Opaque(_) => "opaque",
        }
    }

    /// Visits this value and every value nested inside it, depth first.
    pub fn visit(&self, f: &mut dyn FnMut(&Value)) {
        f(self);
        match self {
            Self::List(items) | Self::Tuple(items) | Self::Set(items) | Self::FrozenSet(items) => {
                for item in items {
                    item.visit(f);
                }
            }
            Self::Map(map) => {
                for item in map.values() {
                    item.visit(f);
                }
            }
            Self::Dict(pairs) => {
                for (k, v) in pairs {
                    k.visit(f);
                    v.visit(f);
                }
            }
            _ => {}
        }
    }

    /// Builds a string-keyed map from pairs.
    pub fn map<K: Into<String>>(pairs: impl IntoIterator<Item = (K, Value)>) -> Self {
        Self::Map(pairs.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self { Self::Bool(v) }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self { Self::Int(v) }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self { Self::Int(v as i64) }
}

impl From<u64> for Value {
    fn from(v: u64) -> Self {
        i64::try_from(v).map_or(Self::UInt(v), Self::Int)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self { Self::Float(v) }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self { Self::Str(v.to_string()) }
}

impl From<String> for Value {
    fn from(v: String) -> Self { Self::Str(v) }
}

impl From<Vec<Value>> for Value {
    fn from(v: Vec<Value>) -> Self { Self::List(v) }
}

impl From<Ref> for Value {
    fn from(v: Ref) -> Self { Self::Ref(v) }
}

impl From<StreamRef> for Value {
    fn from(v: StreamRef) -> Self { Self::StreamRef(v) }
}

impl From<CallbackRef> for Value {
    fn from(v: CallbackRef) -> Self { Self::Callback(v) }
}

impl From<Opaque> for Value {
    fn from(v: Opaque) -> Self { Self::Opaque(v) }
}
