use persist::Store;

use crate::config::Config;
use crate::pipeline::Pipeline;

fn build(yaml: &str) -> crate::Result<Pipeline> {
    Config::from_str(yaml)?.build_pipeline(Store::stub())
}

const LINEAR: &str = r#"
pipeline:
  - type: generate_input
    entry:
      test: value
  - type: json_parser
  - type: stdout
"#;

#[test]
fn linear_pipeline_defaults_outputs_to_next() {
    let pipeline = build(LINEAR).unwrap();

    let ids: Vec<&str> = pipeline.operators().iter().map(|op| op.id()).collect();
    assert_eq!(ids, vec!["$.generate_input", "$.json_parser", "$.stdout"]);

    assert_eq!(
        pipeline.operators()[0].output_ids(),
        vec!["$.json_parser".to_owned()]
    );
    assert_eq!(
        pipeline.operators()[1].output_ids(),
        vec!["$.stdout".to_owned()]
    );
    assert!(pipeline.operators()[2].output_ids().is_empty());
}

#[test]
fn build_is_deterministic() {
    let first = build(LINEAR).unwrap().render();
    let second = build(LINEAR).unwrap().render();
    assert_eq!(first, second);
}

#[test]
fn render_lists_nodes_and_edges() {
    let rendered = build(LINEAR).unwrap().render();

    assert!(rendered.contains("\"$.generate_input\" [type=\"generate_input\"]"));
    assert!(rendered.contains("\"$.generate_input\" -> \"$.json_parser\""));
    assert!(rendered.contains("\"$.json_parser\" -> \"$.stdout\""));
}

#[test]
fn explicit_ids_and_fan_out() {
    let pipeline = build(
        r#"
pipeline:
  - type: generate_input
    entry: {}
    output: [left, right]
  - type: json_parser
    id: left
    output: out
  - type: json_parser
    id: right
    output: out
  - type: stdout
    id: out
"#,
    )
    .unwrap();

    assert_eq!(
        pipeline.operators()[0].output_ids(),
        vec!["$.left".to_owned(), "$.right".to_owned()]
    );
}

#[test]
fn duplicate_ids_are_rejected() {
    let err = build(
        r#"
pipeline:
  - type: generate_input
    entry: {}
  - type: json_parser
  - type: json_parser
  - type: stdout
"#,
    )
    .unwrap_err();
    assert!(err.to_string().contains("already exists"));
}

#[test]
fn unknown_output_is_rejected() {
    let err = build(
        r#"
pipeline:
  - type: generate_input
    entry: {}
    output: nope
  - type: stdout
"#,
    )
    .unwrap_err();
    assert!(err.to_string().contains("does not exist"));
}

#[test]
fn cycles_are_rejected() {
    let err = build(
        r#"
pipeline:
  - type: generate_input
    entry: {}
    output: a
  - type: json_parser
    id: a
    output: b
  - type: json_parser
    id: b
    output: a
  - type: stdout
"#,
    )
    .unwrap_err();
    assert!(err.to_string().contains("circular"));
}

#[test]
fn output_to_an_input_is_rejected() {
    let err = build(
        r#"
pipeline:
  - type: generate_input
    entry: {}
    output: gen2
  - type: generate_input
    id: gen2
    entry: {}
  - type: stdout
"#,
    )
    .unwrap_err();
    assert!(err.to_string().contains("can not process"));
}

#[test]
fn transformer_without_path_to_output_is_rejected() {
    let err = build(
        r#"
pipeline:
  - type: generate_input
    entry: {}
    output: dangling
  - type: stdout
  - type: json_parser
    id: dangling
"#,
    )
    .unwrap_err();
    assert!(err.to_string().contains("no path to an output"));
}

#[test]
fn operator_not_fed_by_an_input_is_rejected() {
    let err = build(
        r#"
pipeline:
  - type: generate_input
    entry: {}
    output: out
  - type: json_parser
    id: stray
    output: out
  - type: stdout
    id: out
"#,
    )
    .unwrap_err();
    assert!(err.to_string().contains("not reachable from any input"));
}

#[test]
fn empty_pipeline_is_rejected() {
    assert!(build("pipeline: []").is_err());
}

#[test]
fn unknown_operator_type_is_rejected() {
    assert!(Config::from_str(
        r#"
pipeline:
  - type: quantum_parser
"#,
    )
    .is_err());
}
