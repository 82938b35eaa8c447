#![forbid(unsafe_code)]

//! Argument values and keyword-argument snapshots.
//!
//! Commands are parameterized by keyword arguments. [`Kwargs`] is an
//! insertion-ordered map of name → [`ArgValue`], passed by value everywhere:
//! the engine clones a snapshot into the history log and into callback
//! payloads, so no observer can mutate the arguments a command was actually
//! constructed with.
//!
//! # Invariants
//!
//! - `Kwargs` preserves insertion order (positional argv synthesis and
//!   diagnostics formatting depend on it).
//! - Inserting an existing key overwrites in place, keeping the original
//!   position.
//! - Only primitive variants of [`ArgValue`] render their contents in
//!   diagnostics output; [`ArgValue::Opaque`] always renders as a
//!   placeholder so arbitrary payloads are never stringified.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

/// A single keyword-argument value.
///
/// Commands that need structured payloads (scene handles, closures, large
/// buffers) wrap them in [`ArgValue::Opaque`]; everything else uses the
/// primitive variants, which print in diagnostics and parse from argv
/// tokens.
#[derive(Clone)]
pub enum ArgValue {
    /// Boolean flag.
    Bool(bool),
    /// Signed integer.
    Int(i64),
    /// Floating-point number.
    Float(f64),
    /// UTF-8 string.
    Str(String),
    /// Ordered list of values.
    List(Vec<ArgValue>),
    /// Arbitrary shared payload. Compared by pointer identity, rendered as
    /// a placeholder in diagnostics.
    Opaque(Arc<dyn Any + Send + Sync>),
}

impl ArgValue {
    /// Placeholder used when formatting non-primitive values.
    pub const OPAQUE_PLACEHOLDER: &'static str = "<object>";

    /// Parse an argv token into a value.
    ///
    /// Recognizes booleans and numbers; anything else is a string.
    #[must_use]
    pub fn parse_token(token: &str) -> Self {
        match token {
            "true" => return Self::Bool(true),
            "false" => return Self::Bool(false),
            _ => {}
        }
        if let Ok(i) = token.parse::<i64>() {
            return Self::Int(i);
        }
        if let Ok(f) = token.parse::<f64>() {
            return Self::Float(f);
        }
        Self::Str(token.to_string())
    }

    /// Whether this value is safe to stringify for diagnostics.
    #[must_use]
    pub fn is_primitive(&self) -> bool {
        !matches!(self, Self::Opaque(_))
    }

    /// Get the integer payload, if this is an `Int`.
    #[must_use]
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Get the boolean payload, if this is a `Bool`.
    #[must_use]
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Get the float payload, if this is a `Float`.
    #[must_use]
    pub fn as_float(&self) -> Option<f64> {
        match self {
            Self::Float(f) => Some(*f),
            _ => None,
        }
    }

    /// Get the string payload, if this is a `Str`.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Downcast an `Opaque` payload to a concrete type.
    #[must_use]
    pub fn downcast_opaque<T: Any + Send + Sync>(&self) -> Option<&T> {
        match self {
            Self::Opaque(any) => any.downcast_ref::<T>(),
            _ => None,
        }
    }
}

impl PartialEq for ArgValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::Int(a), Self::Int(b)) => a == b,
            (Self::Float(a), Self::Float(b)) => a == b,
            (Self::Str(a), Self::Str(b)) => a == b,
            (Self::List(a), Self::List(b)) => a == b,
            // Opaque payloads compare by identity only.
            (Self::Opaque(a), Self::Opaque(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl fmt::Debug for ArgValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(b) => write!(f, "{b}"),
            Self::Int(i) => write!(f, "{i}"),
            Self::Float(x) => write!(f, "{x}"),
            Self::Str(s) => write!(f, "{s:?}"),
            Self::List(items) => f.debug_list().entries(items).finish(),
            Self::Opaque(_) => f.write_str(Self::OPAQUE_PLACEHOLDER),
        }
    }
}

impl fmt::Display for ArgValue {
    /// Diagnostics rendering: primitives print their value, anything else
    /// prints the placeholder.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(b) => write!(f, "{b}"),
            Self::Int(i) => write!(f, "{i}"),
            Self::Float(x) => write!(f, "{x}"),
            Self::Str(s) => write!(f, "{s}"),
            Self::List(_) | Self::Opaque(_) => f.write_str(Self::OPAQUE_PLACEHOLDER),
        }
    }
}

#[cfg(feature = "serde")]
impl serde::Serialize for ArgValue {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Bool(b) => serializer.serialize_bool(*b),
            Self::Int(i) => serializer.serialize_i64(*i),
            Self::Float(x) => serializer.serialize_f64(*x),
            Self::Str(s) => serializer.serialize_str(s),
            Self::List(items) => items.serialize(serializer),
            Self::Opaque(_) => serializer.serialize_str(Self::OPAQUE_PLACEHOLDER),
        }
    }
}

impl From<bool> for ArgValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i64> for ArgValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<i32> for ArgValue {
    fn from(v: i32) -> Self {
        Self::Int(i64::from(v))
    }
}

impl From<f64> for ArgValue {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<&str> for ArgValue {
    fn from(v: &str) -> Self {
        Self::Str(v.to_string())
    }
}

impl From<String> for ArgValue {
    fn from(v: String) -> Self {
        Self::Str(v)
    }
}

impl From<Vec<ArgValue>> for ArgValue {
    fn from(v: Vec<ArgValue>) -> Self {
        Self::List(v)
    }
}

/// Insertion-ordered keyword-argument map.
///
/// Small by construction (a handful of arguments per command), so lookups
/// are linear scans over a `Vec` rather than a hash map.
#[derive(Clone, Default, PartialEq)]
pub struct Kwargs {
    entries: Vec<(String, ArgValue)>,
}

impl Kwargs {
    /// Create an empty map.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or overwrite a value, preserving the original position on
    /// overwrite.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<ArgValue>) {
        let key = key.into();
        let value = value.into();
        if let Some(slot) = self.entries.iter_mut().find(|(k, _)| *k == key) {
            slot.1 = value;
        } else {
            self.entries.push((key, value));
        }
    }

    /// Builder-style insert.
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<ArgValue>) -> Self {
        self.insert(key, value);
        self
    }

    /// Look up a value by key.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&ArgValue> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    /// Whether the key is present.
    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Number of arguments.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the map is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate entries in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &ArgValue)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Keys in insertion order.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(k, _)| k.as_str())
    }

    /// Diagnostics rendering: `x=1, y=2, payload=<object>`.
    #[must_use]
    pub fn render(&self) -> String {
        let mut out = String::new();
        for (i, (k, v)) in self.entries.iter().enumerate() {
            if i > 0 {
                out.push_str(", ");
            }
            out.push_str(k);
            out.push('=');
            out.push_str(&v.to_string());
        }
        out
    }
}

impl fmt::Debug for Kwargs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut map = f.debug_map();
        for (k, v) in self.iter() {
            map.entry(&k, v);
        }
        map.finish()
    }
}

#[cfg(feature = "serde")]
impl serde::Serialize for Kwargs {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        use serde::ser::SerializeMap;
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (k, v) in self.iter() {
            map.serialize_entry(k, v)?;
        }
        map.end()
    }
}

impl<K: Into<String>, V: Into<ArgValue>> FromIterator<(K, V)> for Kwargs {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut kwargs = Self::new();
        for (k, v) in iter {
            kwargs.insert(k, v);
        }
        kwargs
    }
}

// ============================================================================
// Tests
// ============================================================================
