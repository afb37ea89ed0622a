use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use entry::{Entry, Field, Value};
use serde::{Deserialize, Serialize};

use crate::operator::BuildContext;
use crate::{Error, Result};

/// Configuration for parsing an entry's timestamp out of a field.
///
/// ```yaml
/// time:
///   parse_from: $.timestamp
///   layout_type: strptime
///   layout: '%d/%b/%Y:%H:%M:%S %z'
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeParserConfig {
    pub parse_from: Field,

    #[serde(default)]
    pub layout_type: LayoutType,

    /// For `strptime`, the format string. For `epoch`, one of `s`, `ms`,
    /// `us`, `ns`.
    pub layout: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LayoutType {
    #[default]
    Strptime,
    Epoch,
}

impl TimeParserConfig {
    pub fn build(&self, _context: &BuildContext) -> Result<TimeParser> {
        let layout = match self.layout_type {
            LayoutType::Strptime => Layout::Strptime(self.layout.clone()),
            LayoutType::Epoch => match self.layout.as_str() {
                "s" => Layout::Epoch(1_000_000_000),
                "ms" => Layout::Epoch(1_000_000),
                "us" => Layout::Epoch(1_000),
                "ns" => Layout::Epoch(1),
                other => {
                    return Err(Error::config(format!(
                        "epoch layout must be one of s, ms, us, ns; found '{other}'"
                    )));
                }
            },
        };

        Ok(TimeParser {
            parse_from: self.parse_from.clone(),
            layout,
        })
    }
}

enum Layout {
    Strptime(String),
    /// Nanoseconds per unit.
    Epoch(i64),
}

/// Sets `timestamp` from a field's value.
pub struct TimeParser {
    parse_from: Field,
    layout: Layout,
}

impl TimeParser {
    pub fn parse(&self, entry: &mut Entry) -> Result<()> {
        let value = self.parse_from.get(entry).ok_or_else(|| {
            Error::data(format!("field {} is not present", self.parse_from))
        })?;

        let timestamp = match &self.layout {
            Layout::Strptime(format) => parse_strptime(&value.coerce_string(), format)?,
            Layout::Epoch(nanos_per_unit) => {
                let units = match value.as_ref() {
                    Value::Integer(n) => *n,
                    Value::UInteger(n) => *n as i64,
                    Value::Float(f) => *f as i64,
                    other => other
                        .coerce_string()
                        .parse::<i64>()
                        .map_err(|_| Error::data("epoch timestamp is not a number"))?,
                };
                let nanos = units
                    .checked_mul(*nanos_per_unit)
                    .ok_or_else(|| Error::data("epoch timestamp out of range"))?;
                Utc.timestamp_nanos(nanos)
            }
        };

        entry.timestamp = timestamp;
        Ok(())
    }
}

fn parse_strptime(raw: &str, format: &str) -> Result<DateTime<Utc>> {
    // Formats carrying a zone parse as absolute instants; zoneless
    // formats are taken as UTC.
    if format.contains("%z") || format.contains("%Z") || format.contains("%:z") {
        DateTime::parse_from_str(raw, format)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|err| Error::data(format!("parse timestamp '{raw}': {err}")))
    } else {
        NaiveDateTime::parse_from_str(raw, format)
            .map(|t| t.and_utc())
            .map_err(|err| Error::data(format!("parse timestamp '{raw}': {err}")))
    }
}
