//! # tagpack
//!
//! A tagged JSON codec for values that cross a language boundary.
//!
//! Plain JSON carries the common cases untouched. Everything JSON can't say
//! (tuples, sets, bytes, non-string keys, datetimes, non-finite floats) travels
//! as an object with a `__type__` marker. Values with no data representation at
//! all travel as refs that name an object living on the other side.

pub mod codec;
pub mod error;
pub mod symbol;
pub mod tag;
pub mod value;

pub use codec::MAX_DEPTH;
pub use codec::OpaqueSink;
pub use codec::Refuse;
pub use codec::decode;
pub use codec::encode;
pub use codec::encode_with;
pub use error::Error;
pub use error::Result;
pub use symbol::SymbolTable;
pub use tag::SCHEMA_KEY;
pub use tag::SCHEMA_VERSION;
pub use tag::TYPE_KEY;
pub use tag::Tag;
pub use value::CallbackRef;
pub use value::DateTime;
pub use value::Opaque;
pub use value::OpaqueKind;
pub use value::Ref;
pub use value::StreamKind;
pub use value::StreamRef;
pub use value::Time;
pub use value::Value;
