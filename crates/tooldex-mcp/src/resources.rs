//! Read-only documentation resources.

use serde_json::{json, Value};

/// URI of the agent-facing usage guide.
pub const GUIDE_URI: &str = "doc://tooldex/shell-guide";

const GUIDE: &str = include_str!("../../../docs/mcp/tooldex-shell-agent-guide.md");

/// Handle `resources/list`.
pub fn list() -> Value {
    json!({
        "resources": [{
            "uri": GUIDE_URI,
            "name": "tooldex shell guide",
            "description": "How to drive the primary pane with the tooldex tools",
            "mimeType": "text/markdown"
        }]
    })
}

/// Handle `resources/read`. Errors are JSON-RPC invalid-params messages.
pub fn read(params: Option<&Value>) -> Result<Value, String> {
    let uri = params
        .and_then(|p| p.get("uri"))
        .and_then(Value::as_str)
        .ok_or_else(|| "uri is required".to_string())?;
    if uri != GUIDE_URI {
        return Err(format!("unknown resource: {uri}"));
    }
    Ok(json!({
        "contents": [{
            "uri": GUIDE_URI,
            "mimeType": "text/markdown",
            "text": GUIDE
        }]
    }))
}
