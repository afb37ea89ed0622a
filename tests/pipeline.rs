//! End-to-end pipeline scenarios: configuration in, JSON lines out.

use std::path::PathBuf;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use entry::{Entry, Severity};
use persist::Store;
use tokio_util::sync::CancellationToken;

use lumber::config::Config;

/// Builds, starts, and drains a pipeline that writes to `out_path`,
/// returning the decoded entries once `expected` lines arrived.
async fn run_until(yaml: &str, out_path: &PathBuf, expected: usize) -> Vec<Entry> {
    let config = Config::from_str(yaml).unwrap();
    let pipeline = config.build_pipeline(Store::stub()).unwrap();

    let shutdown = CancellationToken::new();
    pipeline.start(shutdown.clone()).await.unwrap();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    let lines = loop {
        let lines = std::fs::read_to_string(out_path)
            .map(|raw| raw.lines().map(str::to_owned).collect::<Vec<_>>())
            .unwrap_or_default();
        if lines.len() >= expected {
            break lines;
        }
        if tokio::time::Instant::now() > deadline {
            panic!("expected {expected} lines, got {}", lines.len());
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    };

    shutdown.cancel();
    pipeline.stop().await;

    lines
        .iter()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect()
}

#[tokio::test]
async fn generate_json_parse_and_write() {
    let out = testify::temp_dir().join("out.jsonl");
    let yaml = format!(
        r#"
pipeline:
  - type: generate_input
    entry: '{{"test": "value"}}'
    count: 1
  - type: json_parser
  - type: file_output
    path: {}
    buffer:
      type: memory
      max_chunk_delay: 20ms
"#,
        out.display()
    );

    let entries = run_until(&yaml, &out, 1).await;

    assert_eq!(entries.len(), 1);
    assert_eq!(
        entries[0].get(&entry::Field::body(["test"])).unwrap().as_ref(),
        &entry::Value::from("value")
    );
    assert_eq!(
        entries[0].attributes.get("log_type").map(String::as_str),
        Some("generate_input")
    );
}

#[tokio::test]
async fn tomcat_access_log_chain() {
    let out = testify::temp_dir().join("tomcat.jsonl");
    let yaml = format!(
        r#"
pipeline:
  - type: generate_input
    log_type: tomcat
    entry: '10.0.0.1 - - [13/Mar/2019:10:43:00 -0400] "GET /apps/deploy HTTP/1.1" 404 9217'
    count: 7
  - type: regex_parser
    regex: '(?P<remote_host>[^\s]+) - (?P<remote_user>[^\s]+) \[(?P<timestamp>[^\]]+)\] "(?P<http_method>[A-Z]+) (?P<path>[^\s]+) [^"]+" (?P<http_status>\d+) (?P<bytes_sent>[\d-]+)'
  - type: severity_parser
    parse_from: $.http_status
    mapping:
      error: 4xx
      info: [2xx, 3xx]
  - type: time_parser
    parse_from: $.timestamp
    layout: '%d/%b/%Y:%H:%M:%S %z'
  - type: file_output
    path: {}
    buffer:
      type: memory
      max_chunk_delay: 20ms
"#,
        out.display()
    );

    let entries = run_until(&yaml, &out, 7).await;

    assert_eq!(entries.len(), 7);
    for entry in &entries {
        assert_eq!(entry.severity, Severity::ERROR);
        assert_eq!(entry.severity_text, "404");
        assert_eq!(
            entry.timestamp,
            Utc.with_ymd_and_hms(2019, 3, 13, 14, 43, 0).unwrap()
        );
        assert_eq!(
            entry.attributes.get("log_type").map(String::as_str),
            Some("tomcat")
        );
        assert_eq!(
            entry
                .get(&entry::Field::body(["http_method"]))
                .unwrap()
                .as_ref(),
            &entry::Value::from("GET")
        );
    }
}

#[tokio::test]
async fn predicate_routes_around_transform() {
    let out = testify::temp_dir().join("filtered.jsonl");
    let yaml = format!(
        r#"
pipeline:
  - type: generate_input
    entry: 'not json at all'
    count: 1
  - type: json_parser
    if: $attributes.log_type == 'nope'
  - type: file_output
    path: {}
    buffer:
      type: memory
      max_chunk_delay: 20ms
"#,
        out.display()
    );

    // The predicate is false, so the malformed body passes through
    // untouched instead of failing to parse.
    let entries = run_until(&yaml, &out, 1).await;
    assert_eq!(entries[0].body, entry::Value::from("not json at all"));
}

#[tokio::test]
async fn pipeline_with_disk_buffer_round_trips() {
    let out = testify::temp_dir().join("disk.jsonl");
    let buffer_dir = testify::temp_dir().join("buffer");
    let yaml = format!(
        r#"
pipeline:
  - type: generate_input
    entry: '{{"n": 1}}'
    count: 5
  - type: json_parser
  - type: file_output
    path: {}
    buffer:
      type: disk
      path: {}
      max_size: 65536
      sync: false
      max_chunk_delay: 20ms
"#,
        out.display(),
        buffer_dir.display()
    );

    let entries = run_until(&yaml, &out, 5).await;
    assert_eq!(entries.len(), 5);
}

#[test]
fn offsets_list_and_clear() {
    let database = testify::temp_dir().join("agent.db");

    // Pre-populate offsets for two operators.
    let store = Store::open(&database).unwrap();
    store
        .update(|txn| {
            let offsets = txn.bucket("offsets")?;
            offsets.child("$.testoperatorid1")?.put(b"k", b"v")?;
            offsets.child("$.testoperatorid2")?.put(b"k", b"v")?;
            Ok(())
        })
        .unwrap();
    store.close().unwrap();

    let scopes = lumber::app::list_offset_scopes(&database).unwrap();
    assert_eq!(
        scopes,
        vec!["$.testoperatorid1".to_owned(), "$.testoperatorid2".to_owned()]
    );

    let code = lumber::app::offsets_clear(
        &database,
        false,
        &["$.testoperatorid2".to_owned()],
    );
    assert_eq!(code, 0);

    let scopes = lumber::app::list_offset_scopes(&database).unwrap();
    assert_eq!(scopes, vec!["$.testoperatorid1".to_owned()]);

    let code = lumber::app::offsets_clear(&database, true, &[]);
    assert_eq!(code, 0);
    assert!(lumber::app::list_offset_scopes(&database).unwrap().is_empty());
}
