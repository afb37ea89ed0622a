use std::collections::HashMap;

use entry::{Entry, Field, Severity};
use serde::{Deserialize, Serialize};

use crate::operator::BuildContext;
use crate::{Error, Result};

/// Configuration for mapping a field's value onto a numeric severity.
///
/// ```yaml
/// severity:
///   parse_from: $.status
///   mapping:
///     error: 5xx
///     info: [2xx, 3xx]
///     warn: { min: 400, max: 499 }
/// ```
///
/// Keys are severity names (or bare numbers); values are the matching
/// inputs: exact strings or numbers, `Nxx` digit shorthands, ranges, or
/// lists of any of those.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SeverityParserConfig {
    pub parse_from: Field,

    /// `default` seeds the table with the severity names themselves;
    /// `none` starts empty.
    #[serde(default)]
    pub preset: Preset,

    #[serde(default)]
    pub mapping: HashMap<String, MappingValue>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Preset {
    #[default]
    Default,
    None,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MappingValue {
    Int(i64),
    Text(String),
    Range { min: i64, max: i64 },
    List(Vec<MappingValue>),
}

impl SeverityParserConfig {
    pub fn build(&self, _context: &BuildContext) -> Result<SeverityParser> {
        let mut exact = HashMap::new();
        let mut ranges = Vec::new();

        if self.preset == Preset::Default {
            for name in [
                "default",
                "trace",
                "trace2",
                "trace3",
                "trace4",
                "debug",
                "debug2",
                "debug3",
                "debug4",
                "info",
                "notice",
                "warn",
                "warning",
                "err",
                "error",
                "error2",
                "error3",
                "error4",
                "critical",
                "alert",
                "emergency",
                "fatal",
            ] {
                let severity = Severity::from_name(name).expect("known severity name");
                exact.insert(name.to_owned(), severity);
            }
        }

        for (alias, value) in &self.mapping {
            let severity = severity_from_alias(alias)?;
            compile_mapping(value, severity, &mut exact, &mut ranges)?;
        }

        Ok(SeverityParser {
            parse_from: self.parse_from.clone(),
            exact,
            ranges,
        })
    }
}

/// A severity alias is a band name or a bare number.
fn severity_from_alias(alias: &str) -> Result<Severity> {
    if let Some(severity) = Severity::from_name(alias) {
        return Ok(severity);
    }

    alias
        .parse::<u8>()
        .map(Severity::from)
        .map_err(|_| Error::config(format!("unknown severity alias '{alias}'")))
}

fn compile_mapping(
    value: &MappingValue,
    severity: Severity,
    exact: &mut HashMap<String, Severity>,
    ranges: &mut Vec<(i64, i64, Severity)>,
) -> Result<()> {
    match value {
        MappingValue::Int(n) => {
            exact.insert(n.to_string(), severity);
        }
        MappingValue::Text(text) => {
            // "4xx" covers 400..=499.
            let lowered = text.to_lowercase();
            if let Some(hundreds) = lowered
                .strip_suffix("xx")
                .and_then(|prefix| prefix.parse::<i64>().ok())
            {
                ranges.push((hundreds * 100, hundreds * 100 + 99, severity));
            } else {
                exact.insert(lowered, severity);
            }
        }
        MappingValue::Range { min, max } => {
            if min > max {
                return Err(Error::config(format!(
                    "severity range minimum {min} is above maximum {max}"
                )));
            }
            ranges.push((*min, *max, severity));
        }
        MappingValue::List(values) => {
            for value in values {
                compile_mapping(value, severity, exact, ranges)?;
            }
        }
    }
    Ok(())
}

/// Maps a field's value onto `severity`, recording the raw text in
/// `severity_text`.
pub struct SeverityParser {
    parse_from: Field,
    exact: HashMap<String, Severity>,
    ranges: Vec<(i64, i64, Severity)>,
}

impl SeverityParser {
    pub fn parse(&self, entry: &mut Entry) -> Result<()> {
        let value = self.parse_from.get(entry).ok_or_else(|| {
            Error::data(format!("field {} is not present", self.parse_from))
        })?;

        let raw = value.coerce_string();
        let lowered = raw.to_lowercase();

        let mut severity = self.exact.get(&lowered).copied();
        if severity.is_none() {
            if let Ok(number) = lowered.parse::<i64>() {
                severity = self
                    .ranges
                    .iter()
                    .find(|(min, max, _)| (*min..=*max).contains(&number))
                    .map(|(_, _, severity)| *severity);
            }
        }

        entry.severity = severity.unwrap_or(Severity::DEFAULT);
        entry.severity_text = raw;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use entry::Value;
    use persist::Store;

    use super::*;

    fn parser(yaml: &str) -> SeverityParser {
        let config: SeverityParserConfig = serde_yaml::from_str(yaml).unwrap();
        config.build(&BuildContext::new(Store::stub())).unwrap()
    }

    fn entry_with(value: impl Into<Value>) -> Entry {
        let mut entry = Entry::empty();
        entry.set(&Field::body(["status"]), value).unwrap();
        entry
    }

    #[test]
    fn named_severities_from_preset() {
        let parser = parser("parse_from: $.status");

        let mut entry = entry_with("ERROR");
        parser.parse(&mut entry).unwrap();
        assert_eq!(entry.severity, Severity::ERROR);
        assert_eq!(entry.severity_text, "ERROR");
    }

    #[test]
    fn http_shorthand_ranges() {
        let parser = parser("parse_from: $.status\nmapping:\n  error: 4xx\n  info: 2xx\n");

        let mut entry = entry_with(404i64);
        parser.parse(&mut entry).unwrap();
        assert_eq!(entry.severity, Severity::ERROR);
        assert_eq!(entry.severity_text, "404");

        let mut entry = entry_with(200i64);
        parser.parse(&mut entry).unwrap();
        assert_eq!(entry.severity, Severity::INFO);
    }

    #[test]
    fn explicit_range_mapping() {
        let parser =
            parser("parse_from: $.status\nmapping:\n  fatal:\n    min: 550\n    max: 599\n");

        let mut entry = entry_with(560i64);
        parser.parse(&mut entry).unwrap();
        assert_eq!(entry.severity, Severity::FATAL);
    }

    #[test]
    fn unmapped_value_gets_default() {
        let parser = parser("parse_from: $.status\npreset: none");

        let mut entry = entry_with("mystery");
        parser.parse(&mut entry).unwrap();
        assert_eq!(entry.severity, Severity::DEFAULT);
        assert_eq!(entry.severity_text, "mystery");
    }

    #[test]
    fn missing_field_is_a_data_error() {
        let parser = parser("parse_from: $.absent");
        let mut entry = Entry::empty();
        assert!(parser.parse(&mut entry).is_err());
    }

    #[test]
    fn invalid_alias_fails_at_build() {
        let config: SeverityParserConfig =
            serde_yaml::from_str("parse_from: $.s\nmapping:\n  banana: 1\n").unwrap();
        assert!(config.build(&BuildContext::new(Store::stub())).is_err());
    }
}
