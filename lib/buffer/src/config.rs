use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{Buffer, DiskBuffer, Error, MemoryBuffer};

/// Buffer configuration, tagged by `type` in operator configs:
///
/// ```yaml
/// buffer:
///   type: disk
///   path: /var/lib/lumber/buffer/stdout
///   max_size: 4294967296
/// ```
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BufferConfig {
    Memory(MemoryBufferConfig),
    Disk(DiskBufferConfig),
}

impl Default for BufferConfig {
    fn default() -> Self {
        BufferConfig::Memory(MemoryBufferConfig::default())
    }
}

impl BufferConfig {
    pub fn build(&self) -> Result<Buffer, Error> {
        match self {
            BufferConfig::Memory(config) => Ok(Buffer::Memory(MemoryBuffer::new(config))),
            BufferConfig::Disk(config) => Ok(Buffer::Disk(DiskBuffer::open(config)?)),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MemoryBufferConfig {
    #[serde(default = "default_max_entries")]
    pub max_entries: u64,

    #[serde(default = "default_max_chunk_size")]
    pub max_chunk_size: u64,

    #[serde(default = "default_max_chunk_delay", with = "duration")]
    pub max_chunk_delay: Duration,
}

impl Default for MemoryBufferConfig {
    fn default() -> Self {
        MemoryBufferConfig {
            max_entries: default_max_entries(),
            max_chunk_size: default_max_chunk_size(),
            max_chunk_delay: default_max_chunk_delay(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DiskBufferConfig {
    /// Directory holding the `data` and `metadata` files. One buffer per
    /// directory.
    pub path: PathBuf,

    /// Size of the data file in bytes.
    #[serde(default = "default_max_size")]
    pub max_size: u64,

    /// Open the data file with `O_SYNC`. Turning this off trades crash
    /// durability for throughput.
    #[serde(default = "default_sync")]
    pub sync: bool,

    #[serde(default = "default_max_chunk_size")]
    pub max_chunk_size: u64,

    #[serde(default = "default_max_chunk_delay", with = "duration")]
    pub max_chunk_delay: Duration,

    /// How often the maintenance task reclaims flushed ranges.
    #[serde(default = "default_compact_interval", with = "duration")]
    pub compact_interval: Duration,
}

impl DiskBufferConfig {
    pub fn new(path: PathBuf) -> Self {
        DiskBufferConfig {
            path,
            max_size: default_max_size(),
            sync: default_sync(),
            max_chunk_size: default_max_chunk_size(),
            max_chunk_delay: default_max_chunk_delay(),
            compact_interval: default_compact_interval(),
        }
    }
}

fn default_max_entries() -> u64 {
    1 << 20
}

fn default_max_chunk_size() -> u64 {
    1000
}

fn default_max_chunk_delay() -> Duration {
    Duration::from_secs(1)
}

fn default_max_size() -> u64 {
    1 << 32 // 4GiB
}

fn default_sync() -> bool {
    true
}

fn default_compact_interval() -> Duration {
    Duration::from_secs(60)
}

/// Durations in configuration are written the human way: `500ms`, `1s`,
/// `2m`, `1h`, or a bare number of seconds.
pub(crate) mod duration {
    use std::time::Duration;

    use serde::de::Error;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format!("{}ms", d.as_millis()))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Number(f64),
            Text(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Number(secs) if secs >= 0.0 => Ok(Duration::from_secs_f64(secs)),
            Raw::Number(secs) => Err(D::Error::custom(format!("negative duration {secs}"))),
            Raw::Text(text) => parse(&text).map_err(D::Error::custom),
        }
    }

    pub(crate) fn parse(text: &str) -> Result<Duration, String> {
        let text = text.trim();
        let split = text
            .find(|c: char| !c.is_ascii_digit() && c != '.')
            .unwrap_or(text.len());
        let (number, unit) = text.split_at(split);

        let value: f64 = number
            .parse()
            .map_err(|_| format!("invalid duration '{text}'"))?;

        let multiplier = match unit.trim() {
            "" | "s" => 1.0,
            "ms" => 1e-3,
            "us" | "µs" => 1e-6,
            "ns" => 1e-9,
            "m" => 60.0,
            "h" => 3600.0,
            other => return Err(format!("unknown duration unit '{other}'")),
        };

        Ok(Duration::from_secs_f64(value * multiplier))
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn parse_units() {
            assert_eq!(parse("500ms").unwrap(), Duration::from_millis(500));
            assert_eq!(parse("1s").unwrap(), Duration::from_secs(1));
            assert_eq!(parse("2m").unwrap(), Duration::from_secs(120));
            assert_eq!(parse("1.5h").unwrap(), Duration::from_secs(5400));
            assert_eq!(parse("10").unwrap(), Duration::from_secs(10));
            assert!(parse("10 fortnights").is_err());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_memory() {
        assert!(matches!(BufferConfig::default(), BufferConfig::Memory(_)));
    }

    #[test]
    fn deserialize_disk_config() {
        let config: BufferConfig = serde_json::from_str(
            r#"{"type": "disk", "path": "/tmp/buf", "max_size": 1024, "max_chunk_delay": "250ms"}"#,
        )
        .unwrap();

        match config {
            BufferConfig::Disk(disk) => {
                assert_eq!(disk.max_size, 1024);
                assert!(disk.sync);
                assert_eq!(disk.max_chunk_delay, Duration::from_millis(250));
                assert_eq!(disk.max_chunk_size, 1000);
            }
            other => panic!("expected disk config, got {other:?}"),
        }
    }

    #[test]
    fn unknown_buffer_type_is_rejected() {
        let result: Result<BufferConfig, _> =
            serde_json::from_str(r#"{"type": "cloud", "path": "/tmp"}"#);
        assert!(result.is_err());
    }
}
