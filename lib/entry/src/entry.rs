use std::borrow::Cow;
use std::collections::BTreeMap;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{Field, FieldError, Severity, Value};

/// A single log record.
///
/// `severity` and `severity_text` are independent: a parser may set either
/// without the other. Attribute and resource keys are never empty.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    #[serde(default = "epoch")]
    pub timestamp: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Severity::is_default")]
    pub severity: Severity,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub severity_text: String,

    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub body: Value,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub resource: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "Option::is_none", with = "b64")]
    pub trace_id: Option<Bytes>,

    #[serde(default, skip_serializing_if = "Option::is_none", with = "b64")]
    pub span_id: Option<Bytes>,

    #[serde(default, skip_serializing_if = "Option::is_none", with = "b64")]
    pub trace_flags: Option<Bytes>,
}

fn epoch() -> DateTime<Utc> {
    DateTime::<Utc>::UNIX_EPOCH
}

impl Entry {
    /// An entry stamped with the current time and an empty body.
    pub fn new() -> Self {
        Entry {
            timestamp: Utc::now(),
            ..Entry::empty()
        }
    }

    /// The zero value: epoch timestamp, nothing set.
    pub fn empty() -> Self {
        Entry {
            timestamp: epoch(),
            severity: Severity::DEFAULT,
            severity_text: String::new(),
            body: Value::Null,
            attributes: BTreeMap::new(),
            resource: BTreeMap::new(),
            trace_id: None,
            span_id: None,
            trace_flags: None,
        }
    }

    pub fn get<'a>(&'a self, field: &Field) -> Option<Cow<'a, Value>> {
        field.get(self)
    }

    pub fn set(&mut self, field: &Field, value: impl Into<Value>) -> Result<(), FieldError> {
        field.set(self, value.into())
    }

    pub fn delete(&mut self, field: &Field) -> Option<Value> {
        field.delete(self)
    }

    pub fn add_attribute(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.attributes.insert(key.into(), value.into());
    }

    pub fn add_resource(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.resource.insert(key.into(), value.into());
    }
}

impl Default for Entry {
    fn default() -> Self {
        Entry::empty()
    }
}

/// Base64 (de)serialization for the optional trace correlation bytes.
mod b64 {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD as BASE64;
    use bytes::Bytes;
    use serde::de::Error;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(v: &Option<Bytes>, serializer: S) -> Result<S::Ok, S::Error> {
        match v {
            Some(bytes) => serializer.serialize_str(&BASE64.encode(bytes)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Bytes>, D::Error> {
        let encoded = Option::<String>::deserialize(deserializer)?;
        match encoded {
            Some(s) => BASE64
                .decode(s.as_bytes())
                .map(|raw| Some(Bytes::from(raw)))
                .map_err(D::Error::custom),
            None => Ok(None),
        }
    }
}
