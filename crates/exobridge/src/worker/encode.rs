//! Graceful encoding of foreign results, and the reverse trip for arguments.

use std::collections::HashMap;

use serde_json::Value as Json;
use tagpack::OpaqueKind;
use tagpack::OpaqueSink;
use tagpack::Ref;
use tagpack::StreamRef;
use tagpack::Value;
use tagpack::codec::encode_ref;
use tagpack::codec::encode_stream_ref;
use tracing::debug;

use crate::error::Error;
use crate::error::Result;
use crate::registry::Registry;

/// Turns opaque leaves into refs stored in `registry`.
///
/// The same live object met twice in one value gets the same ref.
pub(crate) struct RefEncoder<'a> {
    registry: &'a Registry<Value>,
    session_id: &'a str,
    pool_name: Option<&'a str>,
    library: &'a str,
    memo: HashMap<usize, Json>,
    created: Vec<String>,
    /// Why the registry refused a leaf. The codec only carries its own errors.
    refused: Option<Error>,
}

impl<'a> RefEncoder<'a> {
    pub fn new(
        registry: &'a Registry<Value>,
        session_id: &'a str,
        pool_name: Option<&'a str>,
        library: &'a str,
    ) -> Self {
        Self {
            registry,
            session_id,
            pool_name,
            library,
            memo: HashMap::new(),
            created: Vec::new(),
            refused: None,
        }
    }

    /// Encodes a value. If it nests too deep to encode at all, the whole value
    /// is stored and sent as a single ref instead.
    pub fn encode(mut self, value: &Value) -> Result<Json> {
        match tagpack::encode_with(value, &mut self) {
            Ok(json) => Ok(json),
            Err(tagpack::Error::DepthExceeded) => {
                self.rollback();
                debug!(session_id = self.session_id, kind = value.kind_name(), "value too deep, sending as a ref");
                let id = self.registry.store(self.session_id, value.clone())?;
                Ok(encode_ref(&self.object_ref(id, value.kind_name(), self.library)))
            }
            Err(e) => {
                self.rollback();
                Err(self.refused.take().unwrap_or_else(|| e.into()))
            }
        }
    }

    fn rollback(&mut self) {
        for id in self.created.drain(..) {
            self.registry.release(self.session_id, &id);
        }
        self.memo.clear();
    }

    fn object_ref(&self, id: String, type_name: &str, source_module: &str) -> Ref {
        Ref {
            id,
            session_id: self.session_id.to_string(),
            pool_name: self.pool_name.map(str::to_string),
            type_name: type_name.to_string(),
            source_module: source_module.to_string(),
            library: Some(self.library.to_string()),
        }
    }
}

impl OpaqueSink for RefEncoder<'_> {
    fn encode_opaque(&mut self, opaque: &tagpack::Opaque) -> tagpack::Result<Json> {
        if let Some(json) = self.memo.get(&opaque.identity()) {
            return Ok(json.clone());
        }

        let id = match self.registry.store(self.session_id, Value::Opaque(opaque.clone())) {
            Ok(id) => id,
            Err(e) => {
                self.refused = Some(e.into());
                return Err(tagpack::Error::NotSerializable {
                    type_name: opaque.type_name().to_string(),
                });
            }
        };
        self.created.push(id.clone());

        let json = match opaque.kind() {
            OpaqueKind::Object => encode_ref(&self.object_ref(id, opaque.type_name(), opaque.module())),
            OpaqueKind::Stream(stream_kind) => encode_stream_ref(&StreamRef {
                id,
                session_id: self.session_id.to_string(),
                pool_name: self.pool_name.map(str::to_string),
                stream_kind,
                exhausted: false,
            }),
        };

        self.memo.insert(opaque.identity(), json.clone());
        Ok(json)
    }
}

/// Replaces every ref in a decoded value with the object it stands for.
pub(crate) fn resolve_refs(value: Value, registry: &Registry<Value>, session_id: &str) -> Result<Value> {
    let resolve_all = |items: Vec<Value>| -> Result<Vec<Value>> {
        items
            .into_iter()
            .map(|item| resolve_refs(item, registry, session_id))
            .collect()
    };

    let resolved = match value {
        Value::Ref(r) => registry.resolve(session_id, &r.id)?,
        Value::StreamRef(s) => registry.resolve(session_id, &s.id)?,
        Value::List(items) => Value::List(resolve_all(items)?),
        Value::Tuple(items) => Value::Tuple(resolve_all(items)?),
        Value::Set(items) => Value::Set(resolve_all(items)?),
        Value::FrozenSet(items) => Value::FrozenSet(resolve_all(items)?),
        Value::Map(map) => Value::Map(
            map.into_iter()
                .map(|(k, v)| Ok((k, resolve_refs(v, registry, session_id)?)))
                .collect::<Result<_>>()?,
        ),
        Value::Dict(pairs) => Value::Dict(
            pairs
                .into_iter()
                .map(|(k, v)| {
                    Ok((
                        resolve_refs(k, registry, session_id)?,
                        resolve_refs(v, registry, session_id)?,
                    ))
                })
                .collect::<Result<_>>()?,
        ),
        other => other,
    };

    Ok(resolved)
}

/// Decodes a ref payload into the id it names.
pub(crate) fn target_id(target: &Json, symbols: &tagpack::SymbolTable) -> Result<String> {
    match tagpack::decode(target, symbols)? {
        Value::Ref(r) => Ok(r.id),
        Value::StreamRef(s) => Ok(s.id),
        other => Err(Error::InvalidRef(format!("expected a ref, got {}", other.kind_name()))),
    }
}
