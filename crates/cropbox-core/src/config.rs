//! Nested key-value configuration and its resolver
//!
//! Configuration is a tree of maps. Lookups walk it one level at a time;
//! at each level the caller supplies a list of candidate keys (an entity's
//! type tags, a rule's name and aliases) and the first present candidate
//! wins. Anything missing along the way means "no override".
//!
//! ```
//! # use cropbox_core::Config;
//! let config = Config::from_ron(r#"{ "Leaf": { "rate": 2.0 } }"#).unwrap();
//! let levels = [vec!["Organ".to_string(), "Leaf".to_string()], vec!["rate".to_string()]];
//! assert_eq!(config.resolve(&levels).and_then(|v| v.as_number()), Some(2.0));
//! ```

use crate::{Error, Result, Value, ValueMap};
use serde::de::{self, Deserialize, Deserializer, MapAccess, SeqAccess, Visitor};
use std::fmt;

/// External configuration consumed by `parameter` rules and the clock
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Config {
    root: ValueMap,
}

impl Config {
    /// An empty configuration: every parameter uses its own default
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_map(root: ValueMap) -> Self {
        Self { root }
    }

    /// Parse a RON document whose top level is a map
    pub fn from_ron(text: &str) -> Result<Self> {
        let raw: RawValue =
            ron::from_str(text).map_err(|e| Error::InvalidConfig(e.to_string()))?;
        match raw.0 {
            Value::Map(root) => Ok(Self { root }),
            other => Err(Error::InvalidConfig(format!(
                "top level must be a map, got {}",
                other.type_name()
            ))),
        }
    }

    /// Set `value` at `path`, creating intermediate maps
    pub fn with(mut self, path: &[&str], value: impl Into<Value>) -> Self {
        self.set(path, value);
        self
    }

    pub fn set(&mut self, path: &[&str], value: impl Into<Value>) {
        let Some((last, parents)) = path.split_last() else {
            return;
        };
        let mut map = &mut self.root;
        for key in parents {
            let entry = map
                .entry(key.to_string())
                .or_insert_with(|| Value::Map(ValueMap::new()));
            if !matches!(entry, Value::Map(_)) {
                *entry = Value::Map(ValueMap::new());
            }
            let Value::Map(next) = entry else {
                return;
            };
            map = next;
        }
        map.insert(last.to_string(), value.into());
    }

    pub fn is_empty(&self) -> bool {
        self.root.is_empty()
    }

    /// Exact-key lookup
    pub fn get(&self, path: &[&str]) -> Option<&Value> {
        let mut current: Option<&ValueMap> = Some(&self.root);
        let (last, parents) = path.split_last()?;
        for key in parents {
            current = current?.get(*key)?.as_map();
        }
        current?.get(*last)
    }

    /// Walk one candidate list per level; the first candidate present at a
    /// level wins. Returns `None` as soon as a level has no match.
    pub fn resolve<S: AsRef<str>>(&self, levels: &[Vec<S>]) -> Option<&Value> {
        let (last, parents) = levels.split_last()?;
        let mut map = &self.root;
        for candidates in parents {
            map = candidates
                .iter()
                .find_map(|k| map.get(k.as_ref()).and_then(Value::as_map))?;
        }
        last.iter().find_map(|k| map.get(k.as_ref()))
    }
}

impl From<ValueMap> for Config {
    fn from(root: ValueMap) -> Self {
        Self::from_map(root)
    }
}

impl<'de> Deserialize<'de> for Config {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        match RawValue::deserialize(deserializer)?.0 {
            Value::Map(root) => Ok(Self { root }),
            other => Err(de::Error::custom(format!(
                "configuration must be a map, got {}",
                other.type_name()
            ))),
        }
    }
}

/// Self-describing value as written in a configuration document
struct RawValue(Value);

impl<'de> Deserialize<'de> for RawValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        deserializer.deserialize_any(RawVisitor).map(RawValue)
    }
}

struct RawVisitor;

impl<'de> Visitor<'de> for RawVisitor {
    type Value = Value;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "a configuration value")
    }

    fn visit_bool<E: de::Error>(self, v: bool) -> std::result::Result<Value, E> {
        Ok(Value::Bool(v))
    }

    fn visit_i64<E: de::Error>(self, v: i64) -> std::result::Result<Value, E> {
        Ok(Value::from(v as f64))
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> std::result::Result<Value, E> {
        Ok(Value::from(v as f64))
    }

    fn visit_f64<E: de::Error>(self, v: f64) -> std::result::Result<Value, E> {
        Ok(Value::from(v))
    }

    fn visit_char<E: de::Error>(self, v: char) -> std::result::Result<Value, E> {
        Ok(Value::Text(v.to_string()))
    }

    fn visit_str<E: de::Error>(self, v: &str) -> std::result::Result<Value, E> {
        Ok(Value::Text(v.to_string()))
    }

    fn visit_string<E: de::Error>(self, v: String) -> std::result::Result<Value, E> {
        Ok(Value::Text(v))
    }

    fn visit_unit<E: de::Error>(self) -> std::result::Result<Value, E> {
        Ok(Value::Null)
    }

    fn visit_none<E: de::Error>(self) -> std::result::Result<Value, E> {
        Ok(Value::Null)
    }

    fn visit_some<D: Deserializer<'de>>(self, d: D) -> std::result::Result<Value, D::Error> {
        RawValue::deserialize(d).map(|r| r.0)
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> std::result::Result<Value, A::Error> {
        let mut list = Vec::new();
        while let Some(RawValue(v)) = seq.next_element()? {
            list.push(v);
        }
        Ok(Value::List(list))
    }

    fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> std::result::Result<Value, A::Error> {
        let mut map = ValueMap::new();
        while let Some((k, RawValue(v))) = access.next_entry::<String, RawValue>()? {
            map.insert(k, v);
        }
        Ok(Value::Map(map))
    }
}
