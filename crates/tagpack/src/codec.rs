//! # Codec
//!
//! The translation layer between `Value` and tagged JSON.
//!
//! ## Invariants
//! - **Recursion Safety**: All recursive operations are bounded by `MAX_DEPTH`.
//! - **Injectivity**: Two distinct values never share a wire form. Plain objects
//!   never carry `__type__`; a string-keyed map that contains that key goes
//!   through the `dict` tag instead.
//! - **Ref Safety**: `Opaque` values are handed to an `OpaqueSink`. The default
//!   sink refuses them with `NotSerializable`; nothing is ever rendered as a
//!   debug string.
//!
//! ## Numbers
//! Integers decode as `Int` when they fit in `i64` and as `UInt` up to
//! `u64::MAX`. Wider integers arrive as `Float` and lose precision. A `UInt`
//! built by hand below `i64::MAX` comes back as `Int`; `Value::from(u64)`
//! picks the right variant.

use std::collections::BTreeMap;
use std::collections::HashSet;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::DateTime as ChronoDateTime;
use chrono::FixedOffset;
use chrono::NaiveDate;
use chrono::NaiveDateTime;
use chrono::NaiveTime;
use chrono::SecondsFormat;
use serde_json::Map;
use serde_json::Value as Json;

use crate::error::Error;
use crate::error::Result;
use crate::symbol::SymbolTable;
use crate::tag::SCHEMA_KEY;
use crate::tag::SCHEMA_VERSION;
use crate::tag::TYPE_KEY;
use crate::tag::Tag;
use crate::tag::tagged;
use crate::value::CallbackRef;
use crate::value::DateTime;
use crate::value::Opaque;
use crate::value::Ref;
use crate::value::StreamKind;
use crate::value::StreamRef;
use crate::value::Time;
use crate::value::Value;

/// The maximum nesting depth of a value before the codec gives up.
pub const MAX_DEPTH: usize = 128;

const NAIVE_DATETIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.f";
const NAIVE_DATETIME_SPACED: &str = "%Y-%m-%d %H:%M:%S%.f";
const DATE_FORMAT: &str = "%Y-%m-%d";
const TIME_FORMAT: &str = "%H:%M:%S%.f";

/// Decides the wire form of values that have no data representation.
pub trait OpaqueSink {
    fn encode_opaque(&mut self, opaque: &Opaque) -> Result<Json>;
}

/// The host policy: opaque values are an error.
pub struct Refuse;

impl OpaqueSink for Refuse {
    fn encode_opaque(&mut self, opaque: &Opaque) -> Result<Json> {
        Err(Error::NotSerializable {
            type_name: opaque.type_name().to_string(),
        })
    }
}

// ============================================================================
//  ENCODING
// ============================================================================

/// Encodes a host value, refusing anything opaque.
pub fn encode(value: &Value) -> Result<Json> {
    encode_with(value, &mut Refuse)
}

/// Encodes a value, delegating opaque leaves to `sink`.
pub fn encode_with(value: &Value, sink: &mut dyn OpaqueSink) -> Result<Json> {
    encode_impl(value, sink, 0)
}

fn encode_impl(value: &Value, sink: &mut dyn OpaqueSink, depth: usize) -> Result<Json> {
    if depth > MAX_DEPTH {
        return Err(Error::DepthExceeded);
    }

    let json = match value {
        Value::None => Json::Null,
        Value::Bool(b) => Json::Bool(*b),
        Value::Int(i) => Json::from(*i),
        Value::UInt(u) => Json::from(*u),
        Value::Float(f) => encode_float(*f),
        Value::Str(s) => Json::String(s.clone()),
        Value::Binary(data) => match std::str::from_utf8(data) {
            Ok(text) => Json::String(text.to_string()),
            Err(_) => encode_bytes(data),
        },
        Value::Bytes(data) => encode_bytes(data),
        Value::List(items) => Json::Array(encode_seq(items, sink, depth)?),
        Value::Map(map) => {
            if map.contains_key(TYPE_KEY) {
                let pairs = map.iter().map(|(k, v)| (Value::Str(k.clone()), v));
                encode_pairs(pairs, sink, depth)?
            } else {
                let mut out = Map::with_capacity(map.len());
                for (k, v) in map {
                    out.insert(k.clone(), encode_impl(v, sink, depth + 1)?);
                }
                Json::Object(out)
            }
        }
        Value::Dict(pairs) => match plain_keys(pairs) {
            Some(keys) => {
                let mut out = Map::with_capacity(pairs.len());
                for (key, (_, v)) in keys.into_iter().zip(pairs) {
                    out.insert(key, encode_impl(v, sink, depth + 1)?);
                }
                Json::Object(out)
            }
            None => encode_pairs(pairs.iter().map(|(k, v)| (k.clone(), v)), sink, depth)?,
        },
        Value::Tuple(items) => tagged(Tag::Tuple, [("elements", Json::Array(encode_seq(items, sink, depth)?))]),
        Value::Set(items) => tagged(Tag::Set, [("elements", Json::Array(encode_seq(items, sink, depth)?))]),
        Value::FrozenSet(items) => tagged(Tag::FrozenSet, [("elements", Json::Array(encode_seq(items, sink, depth)?))]),
        Value::Complex { real, imag } => tagged(Tag::Complex, [("real", encode_float(*real)), ("imag", encode_float(*imag))]),
        Value::DateTime(dt) => tagged(Tag::DateTime, [("value", Json::String(format_datetime(dt)))]),
        Value::Date(d) => tagged(Tag::Date, [("value", Json::String(d.format(DATE_FORMAT).to_string()))]),
        Value::Time(t) => tagged(Tag::Time, [("value", Json::String(format_time(t)))]),
        Value::Symbol(name) => tagged(Tag::Symbol, [("value", Json::String(name.clone()))]),
        Value::Ref(r) => encode_ref(r),
        Value::StreamRef(s) => encode_stream_ref(s),
        Value::Callback(cb) => tagged(Tag::Callback, [
            ("id", Json::String(cb.id.clone())),
            ("arity", cb.arity.map_or(Json::Null, Json::from)),
        ]),
        Value::Opaque(o) => sink.encode_opaque(o)?,
    };

    Ok(json)
}

fn encode_seq(items: &[Value], sink: &mut dyn OpaqueSink, depth: usize) -> Result<Vec<Json>> {
    items.iter().map(|item| encode_impl(item, sink, depth + 1)).collect()
}

fn encode_pairs<'a>(
    pairs: impl Iterator<Item = (Value, &'a Value)>,
    sink: &mut dyn OpaqueSink,
    depth: usize,
) -> Result<Json> {
    let mut out = Vec::new();
    for (k, v) in pairs {
        let key = encode_impl(&k, sink, depth + 1)?;
        let val = encode_impl(v, sink, depth + 1)?;
        out.push(Json::Array(vec![key, val]));
    }
    Ok(tagged(Tag::Dict, [("pairs", Json::Array(out))]))
}

/// Returns the object keys if every key is a string or symbol, unique, and
/// not the reserved marker.
fn plain_keys(pairs: &[(Value, Value)]) -> Option<Vec<String>> {
    let mut seen = HashSet::with_capacity(pairs.len());
    let mut keys = Vec::with_capacity(pairs.len());
    for (k, _) in pairs {
        let key = match k {
            Value::Str(s) | Value::Symbol(s) => s.as_str(),
            _ => return None,
        };
        if key == TYPE_KEY || !seen.insert(key) {
            return None;
        }
        keys.push(key.to_string());
    }
    Some(keys)
}

fn encode_float(f: f64) -> Json {
    if f.is_nan() {
        tagged(Tag::SpecialFloat, [("value", Json::from("nan"))])
    } else if f.is_infinite() && f > 0.0 {
        tagged(Tag::SpecialFloat, [("value", Json::from("infinity"))])
    } else if f.is_infinite() {
        tagged(Tag::SpecialFloat, [("value", Json::from("neg_infinity"))])
    } else {
        // finite floats always fit a JSON number
        serde_json::Number::from_f64(f).map_or(Json::Null, Json::Number)
    }
}

fn encode_bytes(data: &[u8]) -> Json {
    tagged(Tag::Bytes, [("data", Json::String(BASE64.encode(data)))])
}

fn format_datetime(dt: &DateTime) -> String {
    match dt {
        DateTime::Naive(n) => n.format(NAIVE_DATETIME_FORMAT).to_string(),
        DateTime::Offset(o) => o.to_rfc3339_opts(SecondsFormat::AutoSi, false),
    }
}

/// Encodes a ref payload.
pub fn encode_ref(r: &Ref) -> Json {
    let mut json = tagged(Tag::Ref, [
        ("id", Json::String(r.id.clone())),
        ("session_id", Json::String(r.session_id.clone())),
        ("type_name", Json::String(r.type_name.clone())),
        ("source_module", Json::String(r.source_module.clone())),
    ]);
    if let Some(obj) = json.as_object_mut() {
        if let Some(lib) = &r.library {
            obj.insert("library".into(), Json::String(lib.clone()));
        }
        if let Some(pool) = &r.pool_name {
            obj.insert("pool_name".into(), Json::String(pool.clone()));
        }
    }
    json
}

/// Encodes a stream ref payload.
pub fn encode_stream_ref(s: &StreamRef) -> Json {
    let mut json = tagged(Tag::StreamRef, [
        ("id", Json::String(s.id.clone())),
        ("session_id", Json::String(s.session_id.clone())),
        ("stream_kind", Json::String(s.stream_kind.as_str().to_string())),
        ("exhausted", Json::Bool(s.exhausted)),
    ]);
    if let (Some(obj), Some(pool)) = (json.as_object_mut(), &s.pool_name) {
        obj.insert("pool_name".into(), Json::String(pool.clone()));
    }
    json
}

// ============================================================================
//  DECODING
// ============================================================================

/// Decodes tagged JSON into a host value.
///
/// Symbol names outside `symbols` decode as plain strings.
pub fn decode(json: &Json, symbols: &SymbolTable) -> Result<Value> {
    decode_impl(json, symbols, 0)
}

fn decode_impl(json: &Json, symbols: &SymbolTable, depth: usize) -> Result<Value> {
    if depth > MAX_DEPTH {
        return Err(Error::DepthExceeded);
    }

    let value = match json {
        Json::Null => Value::None,
        Json::Bool(b) => Value::Bool(*b),
        Json::Number(n) => match (n.as_i64(), n.as_u64(), n.as_f64()) {
            (Some(i), _, _) => Value::Int(i),
            (None, Some(u), _) => Value::UInt(u),
            (None, None, Some(f)) => Value::Float(f),
            (None, None, None) => Value::Float(f64::NAN),
        },
        Json::String(s) => Value::Str(s.clone()),
        Json::Array(items) => Value::List(decode_seq(items, symbols, depth)?),
        Json::Object(map) => match map.get(TYPE_KEY) {
            Some(Json::String(tag)) => decode_tagged(tag, map, symbols, depth)?,
            Some(_) => return Err(Error::UnknownTag("<non-string>".into())),
            None => {
                let mut out = BTreeMap::new();
                for (k, v) in map {
                    out.insert(k.clone(), decode_impl(v, symbols, depth + 1)?);
                }
                Value::Map(out)
            }
        },
    };

    Ok(value)
}

fn decode_seq(items: &[Json], symbols: &SymbolTable, depth: usize) -> Result<Vec<Value>> {
    items.iter().map(|item| decode_impl(item, symbols, depth + 1)).collect()
}

fn decode_tagged(name: &str, map: &Map<String, Json>, symbols: &SymbolTable, depth: usize) -> Result<Value> {
    let tag = Tag::parse(name).ok_or_else(|| Error::UnknownTag(name.to_string()))?;

    if let Some(schema) = map.get(SCHEMA_KEY).and_then(Json::as_u64) {
        if schema > SCHEMA_VERSION {
            return Err(Error::UnsupportedSchema(schema));
        }
    }

    let value = match tag {
        Tag::Bytes => {
            let data = field_str(map, tag, "data").or_else(|_| field_str(map, tag, "value"))?;
            let bytes = BASE64.decode(data).map_err(|e| invalid(tag, e.to_string()))?;
            Value::Bytes(bytes)
        }
        Tag::Tuple => Value::Tuple(decode_seq(elements(map, tag)?, symbols, depth)?),
        Tag::Set => Value::Set(decode_seq(elements(map, tag)?, symbols, depth)?),
        Tag::FrozenSet => Value::FrozenSet(decode_seq(elements(map, tag)?, symbols, depth)?),
        Tag::Complex => {
            let real = decode_float(map.get("real").ok_or_else(|| invalid(tag, "missing 'real'"))?, tag)?;
            let imag = decode_float(map.get("imag").ok_or_else(|| invalid(tag, "missing 'imag'"))?, tag)?;
            Value::Complex { real, imag }
        }
        Tag::DateTime => Value::DateTime(parse_datetime(field_str(map, tag, "value")?).ok_or_else(|| invalid(tag, "not ISO-8601"))?),
        Tag::Date => {
            let s = field_str(map, tag, "value")?;
            Value::Date(NaiveDate::parse_from_str(s, DATE_FORMAT).map_err(|e| invalid(tag, e.to_string()))?)
        }
        Tag::Time => {
            let s = field_str(map, tag, "value")?;
            Value::Time(parse_time(s).ok_or_else(|| invalid(tag, format!("'{}' is not a time of day", s)))?)
        }
        Tag::Dict => {
            let pairs = map.get("pairs").and_then(Json::as_array).ok_or_else(|| invalid(tag, "missing 'pairs'"))?;
            let mut out = Vec::with_capacity(pairs.len());
            for pair in pairs {
                let [k, v] = pair.as_array().map(Vec::as_slice).unwrap_or_default() else {
                    return Err(invalid(tag, "pair is not a two-element list"));
                };
                out.push((decode_impl(k, symbols, depth + 1)?, decode_impl(v, symbols, depth + 1)?));
            }
            Value::Dict(out)
        }
        Tag::Symbol => {
            let name = field_str(map, tag, "value")?;
            if symbols.contains(name) {
                Value::Symbol(name.to_string())
            } else {
                Value::Str(name.to_string())
            }
        }
        Tag::SpecialFloat => Value::Float(decode_special(map, tag)?),
        Tag::Ref => Value::Ref(decode_ref(map)?),
        Tag::StreamRef => Value::StreamRef(decode_stream_ref(map)?),
        Tag::Callback => {
            let id = field_str(map, tag, "id")?.to_string();
            let arity = map.get("arity").and_then(Json::as_u64).map(|a| a as usize);
            Value::Callback(CallbackRef { id, arity })
        }
    };

    Ok(value)
}

fn invalid(tag: Tag, reason: impl Into<String>) -> Error {
    Error::InvalidTag { tag: tag.as_str().to_string(), reason: reason.into() }
}

fn field_str<'a>(map: &'a Map<String, Json>, tag: Tag, key: &str) -> Result<&'a str> {
    map.get(key)
        .and_then(Json::as_str)
        .ok_or_else(|| invalid(tag, format!("missing string field '{}'", key)))
}

fn elements(map: &Map<String, Json>, tag: Tag) -> Result<&Vec<Json>> {
    map.get("elements")
        .or_else(|| map.get("value"))
        .and_then(Json::as_array)
        .ok_or_else(|| invalid(tag, "missing 'elements'"))
}

fn decode_float(json: &Json, tag: Tag) -> Result<f64> {
    match json {
        Json::Number(n) => n.as_f64().ok_or_else(|| invalid(tag, "number out of range")),
        Json::Object(map) if map.get(TYPE_KEY).and_then(Json::as_str) == Some("special_float") => {
            decode_special(map, Tag::SpecialFloat)
        }
        _ => Err(invalid(tag, "expected a number")),
    }
}

fn decode_special(map: &Map<String, Json>, tag: Tag) -> Result<f64> {
    match field_str(map, tag, "value")? {
        "infinity" => Ok(f64::INFINITY),
        "neg_infinity" => Ok(f64::NEG_INFINITY),
        "nan" => Ok(f64::NAN),
        other => Err(invalid(tag, format!("unknown special float '{}'", other))),
    }
}

fn parse_datetime(s: &str) -> Option<DateTime> {
    if let Ok(dt) = ChronoDateTime::parse_from_rfc3339(s) {
        return Some(DateTime::Offset(dt));
    }
    NaiveDateTime::parse_from_str(s, NAIVE_DATETIME_FORMAT)
        .or_else(|_| NaiveDateTime::parse_from_str(s, NAIVE_DATETIME_SPACED))
        .ok()
        .map(DateTime::Naive)
}

/// `HH:MM:SS[.ffffff]`, optionally followed by `Z` or `±HH:MM[:SS]`.
fn parse_time(s: &str) -> Option<Time> {
    if let Ok(t) = NaiveTime::parse_from_str(s, TIME_FORMAT) {
        return Some(Time::Naive(t));
    }
    let (clock, offset) = s.split_at(s.rfind(['+', '-', 'Z'])?);
    let time = NaiveTime::parse_from_str(clock, TIME_FORMAT).ok()?;
    Some(Time::Offset(time, parse_offset(offset)?))
}

fn parse_offset(s: &str) -> Option<FixedOffset> {
    let (sign, rest) = match s.as_bytes().first()? {
        b'Z' if s.len() == 1 => return FixedOffset::east_opt(0),
        b'+' => (1, &s[1..]),
        b'-' => (-1, &s[1..]),
        _ => return None,
    };
    let parts: Vec<&str> = rest.split(':').collect();
    if !(2..=3).contains(&parts.len()) {
        return None;
    }
    let mut seconds = 0;
    for (part, unit) in parts.iter().zip([3600, 60, 1]) {
        if part.len() != 2 || !part.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        seconds += part.parse::<i32>().ok()? * unit;
    }
    FixedOffset::east_opt(sign * seconds)
}

fn format_time(t: &Time) -> String {
    match t {
        Time::Naive(n) => n.format(TIME_FORMAT).to_string(),
        Time::Offset(n, offset) => format!("{}{}", n.format(TIME_FORMAT), offset),
    }
}

fn ref_field(map: &Map<String, Json>, key: &str) -> Result<String> {
    match map.get(key).and_then(Json::as_str) {
        Some(s) if !s.is_empty() => Ok(s.to_string()),
        _ => Err(Error::InvalidRef(format!("missing '{}'", key))),
    }
}

fn opt_str(map: &Map<String, Json>, key: &str) -> Option<String> {
    map.get(key).and_then(Json::as_str).map(str::to_string)
}

fn decode_ref(map: &Map<String, Json>) -> Result<Ref> {
    Ok(Ref {
        id: ref_field(map, "id")?,
        session_id: ref_field(map, "session_id")?,
        pool_name: opt_str(map, "pool_name"),
        type_name: opt_str(map, "type_name")
            .or_else(|| opt_str(map, "__type_name__"))
            .unwrap_or_else(|| "object".to_string()),
        source_module: opt_str(map, "source_module").unwrap_or_default(),
        library: opt_str(map, "library"),
    })
}

fn decode_stream_ref(map: &Map<String, Json>) -> Result<StreamRef> {
    let kind = ref_field(map, "stream_kind")?;
    let stream_kind = StreamKind::parse(&kind)
        .ok_or_else(|| Error::InvalidRef(format!("unknown stream kind '{}'", kind)))?;

    Ok(StreamRef {
        id: ref_field(map, "id")?,
        session_id: ref_field(map, "session_id")?,
        pool_name: opt_str(map, "pool_name"),
        stream_kind,
        exhausted: map.get("exhausted").and_then(Json::as_bool).unwrap_or(false),
    })
}
