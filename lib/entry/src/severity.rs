use std::fmt;

use serde::{Deserialize, Serialize};

/// Numeric severity of an entry, in `[0, 100]`. Zero is reserved for
/// "default", meaning the severity was never set. The named constants mark
/// the conventional bands; values between bands are valid.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Severity(pub u8);

impl Severity {
    pub const DEFAULT: Severity = Severity(0);
    pub const TRACE: Severity = Severity(10);
    pub const TRACE2: Severity = Severity(12);
    pub const TRACE3: Severity = Severity(13);
    pub const TRACE4: Severity = Severity(14);
    pub const DEBUG: Severity = Severity(20);
    pub const DEBUG2: Severity = Severity(22);
    pub const DEBUG3: Severity = Severity(23);
    pub const DEBUG4: Severity = Severity(24);
    pub const INFO: Severity = Severity(30);
    pub const NOTICE: Severity = Severity(40);
    pub const WARN: Severity = Severity(50);
    pub const ERROR: Severity = Severity(60);
    pub const ERROR2: Severity = Severity(62);
    pub const ERROR3: Severity = Severity(63);
    pub const ERROR4: Severity = Severity(64);
    pub const CRITICAL: Severity = Severity(70);
    pub const ALERT: Severity = Severity(80);
    pub const EMERGENCY: Severity = Severity(90);
    pub const FATAL: Severity = Severity(100);

    #[inline]
    pub fn is_default(&self) -> bool {
        self.0 == 0
    }

    /// The name of the band this severity falls into.
    pub fn name(&self) -> &'static str {
        match self.0 {
            0..=9 => "default",
            10..=19 => "trace",
            20..=29 => "debug",
            30..=39 => "info",
            40..=49 => "notice",
            50..=59 => "warn",
            60..=69 => "error",
            70..=79 => "critical",
            80..=89 => "alert",
            90..=99 => "emergency",
            _ => "fatal",
        }
    }

    /// Looks up a named severity, case-insensitive. `warning` is accepted
    /// as an alias for `warn`, `err` for `error`.
    pub fn from_name(name: &str) -> Option<Severity> {
        let severity = match name.to_ascii_lowercase().as_str() {
            "default" => Severity::DEFAULT,
            "trace" => Severity::TRACE,
            "trace2" => Severity::TRACE2,
            "trace3" => Severity::TRACE3,
            "trace4" => Severity::TRACE4,
            "debug" => Severity::DEBUG,
            "debug2" => Severity::DEBUG2,
            "debug3" => Severity::DEBUG3,
            "debug4" => Severity::DEBUG4,
            "info" => Severity::INFO,
            "notice" => Severity::NOTICE,
            "warn" | "warning" => Severity::WARN,
            "err" | "error" => Severity::ERROR,
            "error2" => Severity::ERROR2,
            "error3" => Severity::ERROR3,
            "error4" => Severity::ERROR4,
            "critical" => Severity::CRITICAL,
            "alert" => Severity::ALERT,
            "emergency" => Severity::EMERGENCY,
            "fatal" => Severity::FATAL,
            _ => return None,
        };

        Some(severity)
    }
}

impl From<u8> for Severity {
    fn from(n: u8) -> Self {
        Severity(n.min(100))
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn band_names() {
        assert_eq!(Severity::DEFAULT.name(), "default");
        assert_eq!(Severity(35).name(), "info");
        assert_eq!(Severity::ERROR2.name(), "error");
        assert_eq!(Severity(100).name(), "fatal");
    }

    #[test]
    fn named_lookup() {
        assert_eq!(Severity::from_name("WARNING"), Some(Severity::WARN));
        assert_eq!(Severity::from_name("err"), Some(Severity::ERROR));
        assert_eq!(Severity::from_name("nope"), None);
    }

    #[test]
    fn clamp_on_from() {
        assert_eq!(Severity::from(130), Severity(100));
    }

    #[test]
    fn serialize_as_number() {
        let data = serde_json::to_string(&Severity::ERROR).unwrap();
        assert_eq!(data, "60");
    }
}
