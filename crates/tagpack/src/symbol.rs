//! Allowlist of symbol names that may be decoded as `Value::Symbol`.
//!
//! Symbols are interned names; decoding arbitrary names from an untrusted peer
//! would let it grow the intern table without bound. Names not in the table
//! come back as plain strings.

use std::collections::HashSet;

#[derive(Clone, Debug, Default)]
pub struct SymbolTable {
    names: HashSet<String>,
}

impl SymbolTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allow(&mut self, name: impl Into<String>) -> &mut Self {
        self.names.insert(name.into());
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.names.contains(name)
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

impl<S: Into<String>> FromIterator<S> for SymbolTable {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self {
            names: iter.into_iter().map(Into::into).collect(),
        }
    }
}
