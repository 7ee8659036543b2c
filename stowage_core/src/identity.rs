//! Identity contract consumed by storage entities.
//!
//! An identity turns a value into canonical text, a content hash and a short
//! name. Entities never look inside an identity beyond these three calls.

use crate::error::{Error, Result};
use crate::hash::{self, Algorithm};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

/// Something that can be persisted as an entity's identity.
pub trait Identity: fmt::Debug {
    /// Stable textual form; equal identities produce equal text.
    fn canonical_text(&self) -> String;

    /// Hash of the canonical text.
    fn content_hash(&self) -> String {
        hash::hash_bytes(Algorithm::Blake3, self.canonical_text().as_bytes())
    }

    /// Short name used for the on-disk path. May contain `/` to nest.
    fn name(&self) -> String;
}

/// A plain string identity. The name is the string itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Literal(String);

impl Literal {
    pub fn new(name: impl Into<String>) -> Self {
        Literal(name.into())
    }
}

impl Identity for Literal {
    fn canonical_text(&self) -> String {
        self.0.clone()
    }

    fn name(&self) -> String {
        self.0.clone()
    }
}

/// A structured identity: a kind plus named fields.
///
/// Canonical text is compact JSON with sorted keys, so field insertion order
/// never matters. The name is `<kind>/<first 16 hash chars>` unless
/// overridden.
#[derive(Debug, Clone, PartialEq)]
pub struct Descriptor {
    kind: String,
    fields: BTreeMap<String, Value>,
    name: Option<String>,
}

impl Descriptor {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            fields: BTreeMap::new(),
            name: None,
        }
    }

    pub fn field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}

impl Identity for Descriptor {
    fn canonical_text(&self) -> String {
        let mut obj = serde_json::Map::new();
        obj.insert("kind".into(), Value::String(self.kind.clone()));
        obj.insert(
            "fields".into(),
            Value::Object(self.fields.clone().into_iter().collect()),
        );
        Value::Object(obj).to_string()
    }

    fn name(&self) -> String {
        match &self.name {
            Some(name) => name.clone(),
            None => format!("{}/{}", self.kind, &self.content_hash()[..16]),
        }
    }
}

/// Identity read back from an Info file during a folder walk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredIdentity {
    name: String,
    text: String,
}

impl StoredIdentity {
    pub fn new(name: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            text: text.into(),
        }
    }
}

impl Identity for StoredIdentity {
    fn canonical_text(&self) -> String {
        self.text.clone()
    }

    fn name(&self) -> String {
        self.name.clone()
    }
}

/// Check an entity name and split it into path segments.
pub fn name_segments(name: &str) -> Result<Vec<String>> {
    if name.is_empty() {
        return Err(Error::invalid_name(name, "empty name"));
    }
    let segments: Vec<String> = name.split('/').map(str::to_string).collect();
    for seg in &segments {
        validate_segment(name, seg)?;
    }
    Ok(segments)
}

/// Check a single directory segment.
pub fn validate_segment(name: &str, seg: &str) -> Result<()> {
    if seg.is_empty() {
        return Err(Error::invalid_name(name, "empty path segment"));
    }
    if seg == "." || seg == ".." {
        return Err(Error::invalid_name(name, "relative path segment"));
    }
    if seg.contains('\\') || seg.contains('\0') {
        return Err(Error::invalid_name(name, "forbidden character"));
    }
    if seg.ends_with(".info") || seg.ends_with(".config") || seg.ends_with(".lock") {
        return Err(Error::invalid_name(name, "reserved suffix"));
    }
    Ok(())
}
