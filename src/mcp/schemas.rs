//! JSON schema builders for the MCP tools.

use serde_json::{Map, Value};

use crate::config::get_config;

/// Build the schema describing the `search` tool input.
pub(crate) fn search_input_schema() -> Map<String, Value> {
    let config = get_config();

    let mut properties = Map::new();
    let mut query_schema = Map::new();
    query_schema.insert("type".into(), Value::String("string".into()));
    query_schema.insert(
        "description".into(),
        Value::String("Natural language question about the documentation".into()),
    );
    query_schema.insert("minLength".into(), Value::Number(1.into()));
    query_schema.insert("maxLength".into(), Value::Number(10_000.into()));
    properties.insert("query".into(), Value::Object(query_schema));

    let mut count_schema = Map::new();
    count_schema.insert("type".into(), Value::String("integer".into()));
    count_schema.insert(
        "description".into(),
        Value::String("Number of ranked results to return".into()),
    );
    count_schema.insert("minimum".into(), Value::Number(1.into()));
    count_schema.insert(
        "maximum".into(),
        Value::Number(serde_json::Number::from(config.search_max_results as u64)),
    );
    count_schema.insert(
        "default".into(),
        Value::Number(serde_json::Number::from(config.search_default_results as u64)),
    );
    properties.insert("result_count".into(), Value::Object(count_schema));

    finalize_object_schema(properties, &["query"])
}

/// Build the schema describing the `fetch` tool input.
pub(crate) fn fetch_input_schema() -> Map<String, Value> {
    let mut properties = Map::new();
    let mut url_schema = Map::new();
    url_schema.insert("type".into(), Value::String("string".into()));
    url_schema.insert(
        "description".into(),
        Value::String("URL of a previously surfaced documentation page".into()),
    );
    properties.insert("url".into(), Value::Object(url_schema));

    finalize_object_schema(properties, &["url"])
}

fn finalize_object_schema(properties: Map<String, Value>, required: &[&str]) -> Map<String, Value> {
    let mut schema = Map::new();
    schema.insert("type".into(), Value::String("object".into()));
    schema.insert("properties".into(), Value::Object(properties));
    if !required.is_empty() {
        schema.insert(
            "required".into(),
            Value::Array(
                required
                    .iter()
                    .map(|&key| Value::String(key.into()))
                    .collect(),
            ),
        );
    }
    schema.insert("additionalProperties".into(), Value::Bool(false));
    schema
}
