use anyhow::Result;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::io::{BufRead, Write};
use std::sync::Arc;

use crate::system::System;

// ---------------------------------------------------------------------------
// MCP surface: line-delimited JSON-RPC 2.0 over stdio. One tool (`search`)
// whose metadata schema is regenerated from the registry on every listing,
// plus five read-only ingestion resources. stdout carries nothing but
// protocol replies; logs go to stderr.
// ---------------------------------------------------------------------------

const PROTOCOL_VERSION: &str = "2024-11-05";

struct ResourceInfo {
    uri: &'static str,
    name: &'static str,
    description: &'static str,
}

const RESOURCES: &[ResourceInfo] = &[
    ResourceInfo {
        uri: "ingestion://status",
        name: "Ingestion status",
        description: "Document, segment, and error totals with the last ingestion time.",
    },
    ResourceInfo {
        uri: "ingestion://stats",
        name: "Per-source ingestion stats",
        description: "Matched, processed, segment, and error counters per configured source.",
    },
    ResourceInfo {
        uri: "ingestion://failures",
        name: "Recent ingestion failures",
        description: "The most recent ingestion failures (at most 20), oldest first.",
    },
    ResourceInfo {
        uri: "ingestion://metadata",
        name: "Observed captures",
        description: "Capture names and values observed per source path.",
    },
    ResourceInfo {
        uri: "ingestion://watch-stats",
        name: "Watch status",
        description: "Per-source watch status and event counters.",
    },
];

/// Handle one JSON-RPC message. Returns `None` for notifications (no id) and
/// unparseable input.
pub fn handle_message(system: &System, line: &str) -> Option<Value> {
    let message: Value = serde_json::from_str(line).ok()?;
    let id = message.get("id")?.clone();
    let method = message.get("method").and_then(|m| m.as_str()).unwrap_or("");
    let params = message.get("params").cloned().unwrap_or_else(|| json!({}));

    let reply = match method {
        "initialize" => json!({
            "jsonrpc": "2.0",
            "id": id,
            "result": {
                "protocolVersion": params
                    .get("protocolVersion")
                    .cloned()
                    .unwrap_or_else(|| json!(PROTOCOL_VERSION)),
                "capabilities": {
                    "tools": { "listChanged": true },
                    "resources": {}
                },
                "serverInfo": {
                    "name": env!("CARGO_PKG_NAME"),
                    "version": env!("CARGO_PKG_VERSION")
                }
            }
        }),
        "ping" => json!({ "jsonrpc": "2.0", "id": id, "result": {} }),
        "tools/list" => json!({
            "jsonrpc": "2.0",
            "id": id,
            "result": { "tools": [search_tool_json(system)] }
        }),
        "tools/call" => tool_call(system, id, &params),
        "resources/list" => {
            let resources: Vec<Value> = RESOURCES
                .iter()
                .map(|r| {
                    json!({
                        "uri": r.uri,
                        "name": r.name,
                        "description": r.description,
                        "mimeType": "application/json"
                    })
                })
                .collect();
            json!({ "jsonrpc": "2.0", "id": id, "result": { "resources": resources } })
        }
        "resources/read" => resources_read(system, id, &params),
        "prompts/list" => json!({ "jsonrpc": "2.0", "id": id, "result": { "prompts": [] } }),
        _ => json!({
            "jsonrpc": "2.0",
            "id": id,
            "error": { "code": -32601, "message": format!("Method not found: {method}") }
        }),
    };
    Some(reply)
}

/// The search tool definition. The `metadata` parameter schema is rebuilt
/// from the registry each time, so clients only ever see keys and values
/// that actually exist in the index.
fn search_tool_json(system: &System) -> Value {
    let mut metadata_props = serde_json::Map::new();
    for (key, values) in system.registry.snapshot() {
        metadata_props.insert(
            key.clone(),
            json!({
                "type": "string",
                "enum": values,
                "description": format!("Exact-match filter on the `{key}` metadata field.")
            }),
        );
    }

    json!({
        "name": "search",
        "description": system.description,
        "inputSchema": {
            "type": "object",
            "properties": {
                "query": {
                    "type": "string",
                    "description": "Natural-language query to embed and match against indexed segments."
                },
                "limit": {
                    "type": "integer",
                    "minimum": 1,
                    "default": 10,
                    "description": "Maximum number of results."
                },
                "metadata": {
                    "type": "object",
                    "properties": metadata_props,
                    "additionalProperties": false,
                    "description": "Optional equality filters; results must match every entry."
                }
            },
            "required": ["query"]
        }
    })
}

fn tool_call(system: &System, id: Value, params: &Value) -> Value {
    let ok = |id: Value, text: String| {
        json!({
            "jsonrpc": "2.0",
            "id": id,
            "result": { "content": [{ "type": "text", "text": text }], "isError": false }
        })
    };
    let err = |id: Value, message: String| {
        json!({
            "jsonrpc": "2.0",
            "id": id,
            "result": {
                "content": [{ "type": "text", "text": format!("Search error: {message}") }],
                "isError": true
            }
        })
    };

    let name = params.get("name").and_then(|n| n.as_str()).unwrap_or("");
    if name != "search" {
        return err(id, format!("unknown tool `{name}`"));
    }
    let args = params.get("arguments").cloned().unwrap_or_else(|| json!({}));

    let Some(query) = args.get("query").and_then(|q| q.as_str()) else {
        return err(id, "`query` is required and must be a string".to_string());
    };
    let limit = match args.get("limit") {
        None | Some(Value::Null) => 10,
        Some(v) => match v.as_u64() {
            Some(n) if n >= 1 => n as usize,
            _ => return err(id, "`limit` must be a positive integer".to_string()),
        },
    };
    let metadata = match args.get("metadata") {
        None | Some(Value::Null) => BTreeMap::new(),
        Some(Value::Object(map)) => {
            let mut filters = BTreeMap::new();
            for (key, value) in map {
                let text = match value {
                    Value::String(s) => s.clone(),
                    Value::Number(n) => n.to_string(),
                    Value::Bool(b) => b.to_string(),
                    _ => {
                        return err(
                            id,
                            format!("metadata value for `{key}` must be a scalar"),
                        )
                    }
                };
                filters.insert(key.clone(), text);
            }
            filters
        }
        Some(_) => return err(id, "`metadata` must be an object".to_string()),
    };

    match system.search(query, limit, &metadata) {
        Ok(hits) => {
            let payload: Vec<Value> = hits
                .iter()
                .map(|hit| json!({ "content": hit.text, "score": hit.score }))
                .collect();
            match serde_json::to_string(&payload) {
                Ok(text) => ok(id, text),
                Err(e) => err(id, e.to_string()),
            }
        }
        Err(e) => err(id, e.to_string()),
    }
}

fn resources_read(system: &System, id: Value, params: &Value) -> Value {
    let uri = params.get("uri").and_then(|u| u.as_str()).unwrap_or("");
    match system.resource_json(uri) {
        Some(document) => json!({
            "jsonrpc": "2.0",
            "id": id,
            "result": {
                "contents": [{
                    "uri": uri,
                    "mimeType": "application/json",
                    "text": document.to_string()
                }]
            }
        }),
        None => json!({
            "jsonrpc": "2.0",
            "id": id,
            "error": { "code": -32002, "message": format!("Unknown resource: {uri}") }
        }),
    }
}

/// Serve JSON-RPC over stdio until stdin closes.
pub fn run_stdio_server(system: Arc<System>) -> Result<()> {
    let stdin = std::io::stdin();
    let mut stdout = std::io::stdout();

    for line in stdin.lock().lines() {
        let Ok(line) = line else { continue };
        if line.trim().is_empty() {
            continue;
        }
        if let Some(reply) = handle_message(&system, &line) {
            writeln!(stdout, "{reply}")?;
            stdout.flush()?;
        }
    }
    Ok(())
}
