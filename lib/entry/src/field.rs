use std::borrow::Cow;
use std::fmt;
use std::str::FromStr;

use serde::de::{self, Deserializer};
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};

use crate::{Entry, Value};

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum FieldError {
    #[error("cannot traverse through {kind} at '{path}'")]
    TypeMismatch { kind: &'static str, path: String },

    #[error("index {index} is out of range at '{path}'")]
    IndexOutOfRange { index: usize, path: String },

    #[error("{field} values must be strings")]
    NonStringMetadata { field: &'static str },

    #[error("failed to parse field '{0}'")]
    Parse(String),
}

/// A typed path addressing part of an entry. Fields are the only way
/// operator code reads or mutates entries.
///
/// String forms accepted in configuration:
///
/// - `$` or `$body` — the whole body
/// - `$.a.b` or `$body.a.b` — nested body path
/// - `$attributes.key` — an attribute
/// - `$resource.key` — a resource entry
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Field {
    /// A path of keys descending into the body. An empty path addresses
    /// the body itself and doubles as the nil-field: setting it replaces
    /// the body wholesale.
    Body(Vec<String>),
    Attribute(String),
    Resource(String),
}

impl Field {
    pub fn body<I, S>(keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Field::Body(keys.into_iter().map(Into::into).collect())
    }

    pub fn root() -> Self {
        Field::Body(Vec::new())
    }

    pub fn attribute(key: impl Into<String>) -> Self {
        Field::Attribute(key.into())
    }

    pub fn resource(key: impl Into<String>) -> Self {
        Field::Resource(key.into())
    }

    pub fn is_root(&self) -> bool {
        matches!(self, Field::Body(keys) if keys.is_empty())
    }

    /// The parent of a body field; the root is its own parent. Attribute
    /// and resource fields have no deeper structure and return themselves.
    pub fn parent(&self) -> Field {
        match self {
            Field::Body(keys) if !keys.is_empty() => Field::Body(keys[..keys.len() - 1].to_vec()),
            other => other.clone(),
        }
    }

    /// A body field one key deeper. Returns `None` for attribute and
    /// resource fields, which are flat.
    pub fn child(&self, key: impl Into<String>) -> Option<Field> {
        match self {
            Field::Body(keys) => {
                let mut keys = keys.clone();
                keys.push(key.into());
                Some(Field::Body(keys))
            }
            _ => None,
        }
    }

    /// Reads the addressed value. Absent intermediate keys yield `None`
    /// without error. Body reads borrow; attribute and resource reads
    /// wrap the string in an owned value.
    pub fn get<'a>(&self, entry: &'a Entry) -> Option<Cow<'a, Value>> {
        match self {
            Field::Body(keys) => {
                let mut current = &entry.body;
                for key in keys {
                    current = descend(current, key)?;
                }
                Some(Cow::Borrowed(current))
            }
            Field::Attribute(key) => entry
                .attributes
                .get(key)
                .map(|s| Cow::Owned(Value::String(s.clone()))),
            Field::Resource(key) => entry
                .resource
                .get(key)
                .map(|s| Cow::Owned(Value::String(s.clone()))),
        }
    }

    /// Writes a value at the addressed path, creating intermediate maps as
    /// needed. Fails when an intermediate exists and is not a map (or an
    /// array indexed by a numeric key), or when a non-string value is
    /// written into attributes or resource.
    pub fn set(&self, entry: &mut Entry, value: Value) -> Result<(), FieldError> {
        match self {
            Field::Body(keys) => {
                let Some((last, parents)) = keys.split_last() else {
                    entry.body = value;
                    return Ok(());
                };

                let mut current = &mut entry.body;
                for key in parents {
                    current = descend_mut(current, key, false, self)?;
                }

                let slot = descend_mut(current, last, true, self)?;
                *slot = value;
                Ok(())
            }
            Field::Attribute(key) => match value {
                Value::String(s) => {
                    entry.attributes.insert(key.clone(), s);
                    Ok(())
                }
                _ => Err(FieldError::NonStringMetadata {
                    field: "attribute",
                }),
            },
            Field::Resource(key) => match value {
                Value::String(s) => {
                    entry.resource.insert(key.clone(), s);
                    Ok(())
                }
                _ => Err(FieldError::NonStringMetadata { field: "resource" }),
            },
        }
    }

    /// Removes and returns the addressed value; `None` if absent.
    pub fn delete(&self, entry: &mut Entry) -> Option<Value> {
        match self {
            Field::Body(keys) => {
                if keys.is_empty() {
                    return Some(std::mem::replace(&mut entry.body, Value::Null));
                }

                let (last, parents) = keys.split_last().expect("keys is non-empty");
                let mut current = &mut entry.body;
                for key in parents {
                    current = descend_mut_existing(current, key)?;
                }

                match current {
                    Value::Map(map) => map.remove(last),
                    Value::Array(values) => {
                        let index: usize = last.parse().ok()?;
                        if index < values.len() {
                            Some(values.remove(index))
                        } else {
                            None
                        }
                    }
                    _ => None,
                }
            }
            Field::Attribute(key) => entry.attributes.remove(key).map(Value::String),
            Field::Resource(key) => entry.resource.remove(key).map(Value::String),
        }
    }
}

/// Follows one key down a value. Numeric keys index arrays when the
/// current node is an array; for maps they are plain keys.
fn descend<'a>(current: &'a Value, key: &str) -> Option<&'a Value> {
    match current {
        Value::Map(map) => map.get(key),
        Value::Array(values) => {
            let index: usize = key.parse().ok()?;
            values.get(index)
        }
        _ => None,
    }
}

fn descend_mut_existing<'a>(current: &'a mut Value, key: &str) -> Option<&'a mut Value> {
    match current {
        Value::Map(map) => map.get_mut(key),
        Value::Array(values) => {
            let index: usize = key.parse().ok()?;
            values.get_mut(index)
        }
        _ => None,
    }
}

/// The write-path descent. Missing intermediates become maps; an
/// intermediate of any other non-container type is a type error.
fn descend_mut<'a>(
    current: &'a mut Value,
    key: &str,
    last: bool,
    field: &Field,
) -> Result<&'a mut Value, FieldError> {
    let map = match current {
        Value::Array(values) => {
            if let Ok(index) = key.parse::<usize>() {
                return values.get_mut(index).ok_or(FieldError::IndexOutOfRange {
                    index,
                    path: field.to_string(),
                });
            }
            return Err(FieldError::TypeMismatch {
                kind: "array",
                path: field.to_string(),
            });
        }
        Value::Map(map) => map,
        Value::Null => {
            *current = Value::map();
            match current {
                Value::Map(map) => map,
                _ => unreachable!(),
            }
        }
        other => {
            return Err(FieldError::TypeMismatch {
                kind: kind_of(other),
                path: field.to_string(),
            });
        }
    };

    let slot = map.entry(key.to_owned()).or_insert(Value::Null);
    if !last {
        match slot {
            Value::Map(_) | Value::Array(_) => {}
            Value::Null => *slot = Value::map(),
            other => {
                return Err(FieldError::TypeMismatch {
                    kind: kind_of(other),
                    path: field.to_string(),
                });
            }
        }
    }

    Ok(slot)
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Integer(_) => "integer",
        Value::UInteger(_) => "unsigned integer",
        Value::Float(_) => "float",
        Value::String(_) => "string",
        Value::Bytes(_) => "bytes",
        Value::Array(_) => "array",
        Value::Map(_) => "map",
    }
}

impl FromStr for Field {
    type Err = FieldError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(FieldError::Parse(s.to_owned()));
        }

        if s == "$" || s == "$body" {
            return Ok(Field::root());
        }

        if let Some(key) = s.strip_prefix("$attributes.") {
            if key.is_empty() {
                return Err(FieldError::Parse(s.to_owned()));
            }
            return Ok(Field::Attribute(key.to_owned()));
        }

        if let Some(key) = s.strip_prefix("$resource.") {
            if key.is_empty() {
                return Err(FieldError::Parse(s.to_owned()));
            }
            return Ok(Field::Resource(key.to_owned()));
        }

        let path = if let Some(rest) = s.strip_prefix("$body.") {
            rest
        } else if let Some(rest) = s.strip_prefix("$.") {
            rest
        } else if s.starts_with('$') {
            return Err(FieldError::Parse(s.to_owned()));
        } else {
            // Bare paths are body paths, matching what configurations
            // in the wild actually write.
            s
        };

        let keys: Vec<String> = path.split('.').map(str::to_owned).collect();
        if keys.iter().any(String::is_empty) {
            return Err(FieldError::Parse(s.to_owned()));
        }

        Ok(Field::Body(keys))
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Field::Body(keys) if keys.is_empty() => f.write_str("$"),
            Field::Body(keys) => write!(f, "$.{}", keys.join(".")),
            Field::Attribute(key) => write!(f, "$attributes.{key}"),
            Field::Resource(key) => write!(f, "$resource.{key}"),
        }
    }
}

impl Default for Field {
    fn default() -> Self {
        Field::root()
    }
}

impl Serialize for Field {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Field {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(de::Error::custom)
    }
}
