//! Dynamic values produced and consumed by rules

use crate::identity::EntityId;
use crate::{Error, Quantity, Result};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A dynamic value held by a track
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub enum Value {
    /// No value / null
    #[default]
    Null,
    /// Boolean value
    Bool(bool),
    /// Number, possibly carrying a unit
    Number(Quantity),
    /// String value
    Text(String),
    /// Reference to an entity
    Entity(EntityId),
    /// List of values
    List(Vec<Value>),
    /// Map of string keys to values
    Map(ValueMap),
}

/// A map of string keys to dynamic values
///
/// Uses IndexMap to preserve insertion order (useful for deterministic serialization)
pub type ValueMap = IndexMap<String, Value>;

impl Value {
    /// Check if this value is null
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Try to get this value as a boolean
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Try to get this value as a quantity
    pub fn as_quantity(&self) -> Option<Quantity> {
        match self {
            Value::Number(q) => Some(*q),
            _ => None,
        }
    }

    /// Try to get the magnitude of a number, ignoring its unit
    pub fn as_number(&self) -> Option<f64> {
        self.as_quantity().map(|q| q.magnitude())
    }

    /// Try to get this value as a string
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Try to get this value as an entity reference
    pub fn as_entity(&self) -> Option<EntityId> {
        match self {
            Value::Entity(id) => Some(*id),
            _ => None,
        }
    }

    /// Try to get this value as a list
    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(list) => Some(list),
            _ => None,
        }
    }

    /// Try to get this value as a map
    pub fn as_map(&self) -> Option<&ValueMap> {
        match self {
            Value::Map(map) => Some(map),
            _ => None,
        }
    }

    /// Like [`Value::as_quantity`], failing with a type error
    pub fn quantity(&self) -> Result<Quantity> {
        self.as_quantity()
            .ok_or_else(|| Error::type_error("number", self.type_name()))
    }

    /// Get the type name of this value
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Number(_) => "number",
            Value::Text(_) => "string",
            Value::Entity(_) => "entity",
            Value::List(_) => "list",
            Value::Map(_) => "map",
        }
    }

    /// Check if this value is truthy
    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Null => false,
            Value::Bool(b) => *b,
            Value::Number(q) => q.magnitude() != 0.0,
            Value::Text(s) => !s.is_empty(),
            Value::Entity(_) => true,
            Value::List(list) => !list.is_empty(),
            Value::Map(map) => !map.is_empty(),
        }
    }

    /// The "nothing happened" value of the same shape: `false` for
    /// booleans, a zero in the same unit for numbers, null otherwise.
    pub fn zero_like(&self) -> Value {
        match self {
            Value::Bool(_) => Value::Bool(false),
            Value::Number(q) => Value::Number(q.zero_like()),
            Value::Text(_) => Value::Text(String::new()),
            Value::List(_) => Value::List(Vec::new()),
            Value::Map(_) => Value::Map(ValueMap::new()),
            Value::Null | Value::Entity(_) => Value::Null,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Number(q) => write!(f, "{}", q),
            Value::Text(s) => write!(f, "\"{}\"", s),
            Value::Entity(id) => write!(f, "{}", id),
            Value::List(list) => {
                write!(f, "[")?;
                for (i, v) in list.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", v)?;
                }
                write!(f, "]")
            }
            Value::Map(map) => {
                write!(f, "{{")?;
                for (i, (k, v)) in map.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}: {}", k, v)?;
                }
                write!(f, "}}")
            }
        }
    }
}

// Convenient From implementations
impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Number(Quantity::plain(f))
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Number(Quantity::plain(i as f64))
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Value::Number(Quantity::plain(i as f64))
    }
}

impl From<Quantity> for Value {
    fn from(q: Quantity) -> Self {
        Value::Number(q)
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Text(s)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_string())
    }
}

impl From<EntityId> for Value {
    fn from(id: EntityId) -> Self {
        Value::Entity(id)
    }
}

impl From<ValueMap> for Value {
    fn from(map: ValueMap) -> Self {
        Value::Map(map)
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(vec: Vec<T>) -> Self {
        Value::List(vec.into_iter().map(Into::into).collect())
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(opt: Option<T>) -> Self {
        opt.map(Into::into).unwrap_or_default()
    }
}
