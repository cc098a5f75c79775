//! Converts one internal tool schema (raw JSON-Schema bytes) into each vendor's native tool
//! declaration shape (§4.3).

use serde_json::{json, Value};

use crate::cloudllm::completion::ToolDefinition;

fn empty_object_schema() -> Value {
    json!({"type": "object", "properties": {}})
}

fn is_schema_malformed(schema: &Value) -> bool {
    !schema.is_object()
}

/// `{type:"function", function:{name, description, parameters:<schema>}}`. A malformed schema
/// substitutes an empty object schema rather than failing the whole request.
pub fn to_openai(tool: &ToolDefinition) -> Value {
    let parameters = if is_schema_malformed(&tool.parameters_schema) {
        empty_object_schema()
    } else {
        tool.parameters_schema.clone()
    };
    json!({
        "type": "function",
        "function": {
            "name": tool.name,
            "description": tool.description,
            "parameters": parameters,
        }
    })
}

/// `{name, description, input_schema}`. Malformed schema is a hard error so the caller can
/// surface it before the stream opens (§4.3, §8 boundary behaviors).
pub fn to_anthropic(tool: &ToolDefinition) -> Result<Value, String> {
    if is_schema_malformed(&tool.parameters_schema) {
        return Err(format!(
            "tool '{}' has a malformed input schema (expected a JSON object)",
            tool.name
        ));
    }
    Ok(json!({
        "name": tool.name,
        "description": tool.description,
        "input_schema": tool.parameters_schema,
    }))
}

/// Recursively rewrites JSON-Schema into Gemini's `Schema` shape: `type` uppercased,
/// `properties` recursed, `required` copied verbatim, `enum` filtered to string values only,
/// `items` recursed. Returns `None` when the top-level schema is malformed, signalling the
/// caller to drop the tool silently (§4.3).
pub fn to_gemini(tool: &ToolDefinition) -> Option<Value> {
    if is_schema_malformed(&tool.parameters_schema) {
        return None;
    }
    let schema = rewrite_gemini_schema(&tool.parameters_schema);
    Some(json!({
        "name": tool.name,
        "description": tool.description,
        "parameters": schema,
    }))
}

fn rewrite_gemini_schema(schema: &Value) -> Value {
    let obj = match schema.as_object() {
        Some(o) => o,
        None => return empty_object_schema(),
    };

    let mut out = serde_json::Map::new();

    if let Some(Value::String(ty)) = obj.get("type") {
        out.insert("type".to_string(), Value::String(ty.to_ascii_uppercase()));
    }

    if let Some(Value::String(desc)) = obj.get("description") {
        out.insert("description".to_string(), Value::String(desc.clone()));
    }

    if let Some(Value::Object(props)) = obj.get("properties") {
        let mut rewritten = serde_json::Map::new();
        for (key, value) in props {
            rewritten.insert(key.clone(), rewrite_gemini_schema(value));
        }
        out.insert("properties".to_string(), Value::Object(rewritten));
    }

    if let Some(required) = obj.get("required") {
        out.insert("required".to_string(), required.clone());
    }

    if let Some(Value::Array(values)) = obj.get("enum") {
        let strings: Vec<Value> = values
            .iter()
            .filter(|v| v.is_string())
            .cloned()
            .collect();
        out.insert("enum".to_string(), Value::Array(strings));
    }

    if let Some(items) = obj.get("items") {
        out.insert("items".to_string(), rewrite_gemini_schema(items));
    }

    Value::Object(out)
}

/// `ToolSpecification` with the schema passed through as a lazy JSON document. Malformed schema
/// substitutes an empty object schema, matching the OpenAI path (§4.3).
pub fn to_bedrock(tool: &ToolDefinition) -> Value {
    let schema = if is_schema_malformed(&tool.parameters_schema) {
        empty_object_schema()
    } else {
        tool.parameters_schema.clone()
    };
    json!({
        "toolSpec": {
            "name": tool.name,
            "description": tool.description,
            "inputSchema": { "json": schema },
        }
    })
}
