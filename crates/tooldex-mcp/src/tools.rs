//! Tool descriptors and dispatch.
//!
//! Every tool acts on the primary pane fixed at startup. Arguments are
//! validated here, at the boundary; anything malformed comes back as an
//! `invalid_argument` tool error rather than a protocol error.

use serde::Serialize;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tracing::{debug, info};

use tooldex_core::capture::{CaptureOptions, DEFAULT_READ_LINES};
use tooldex_core::poll::{DEFAULT_FETCH_TIMEOUT, DEFAULT_MAX_LINES, DEFAULT_POLL_INTERVAL};
use tooldex_core::{
    ActivationId, FetchOptions, PaneId, SubscribeOptions, SubscriptionManager, ToolError,
    ToolResult,
};

pub const RUN_SHELL: &str = "run_shell";
pub const READ_PRIMARY_PANE: &str = "read_primary_pane";
pub const SUBSCRIBE_PRIMARY_PANE: &str = "subscribe_primary_pane";
pub const FETCH_PRIMARY_PANE_UPDATES: &str = "fetch_primary_pane_updates";
pub const UNSUBSCRIBE_PRIMARY_PANE: &str = "unsubscribe_primary_pane";

/// State shared by every tool call of one server.
pub struct ToolContext {
    primary: PaneId,
    subscriptions: Arc<SubscriptionManager>,
    owner: ActivationId,
}

impl ToolContext {
    pub fn new(primary: PaneId, subscriptions: Arc<SubscriptionManager>, owner: ActivationId) -> Self {
        Self {
            primary,
            subscriptions,
            owner,
        }
    }

    pub fn primary(&self) -> &PaneId {
        &self.primary
    }

    pub fn subscriptions(&self) -> &Arc<SubscriptionManager> {
        &self.subscriptions
    }

    pub fn owner(&self) -> ActivationId {
        self.owner
    }

    /// Handle `tools/call`; always produces a tool result.
    pub async fn call(&self, params: Option<Value>) -> Value {
        let params = params.unwrap_or(Value::Null);
        let name = params.get("name").and_then(Value::as_str).unwrap_or("");
        let empty = Map::new();
        let arguments = match params.get("arguments") {
            None | Some(Value::Null) => Ok(&empty),
            Some(Value::Object(map)) => Ok(map),
            Some(_) => Err(ToolError::InvalidArgument(
                "arguments must be an object".into(),
            )),
        };

        let outcome = match arguments {
            Ok(arguments) => self.dispatch(name, Args(arguments)).await,
            Err(e) => Err(e),
        };
        match outcome {
            Ok(value) => tool_success(value),
            Err(e) => {
                debug!(tool = name, code = e.code(), error = %e, "tool failed");
                let mut body = error_body(&e);
                if matches!(e, ToolError::Gap { .. }) {
                    if let Some(snapshot) = self.gap_snapshot().await {
                        body["snapshot"] = snapshot;
                    }
                }
                error_result(body)
            }
        }
    }

    /// Current pane content handed back with a gap so the caller can
    /// re-orient without another round trip.
    async fn gap_snapshot(&self) -> Option<Value> {
        let options = CaptureOptions {
            lines: DEFAULT_READ_LINES,
            include_colors: false,
        };
        match self.subscriptions.tracker().read(&self.primary, options).await {
            Ok(read) => to_value(&read).ok(),
            Err(e) => {
                debug!(pane = %self.primary, error = %e, "no snapshot for gap");
                None
            }
        }
    }

    async fn dispatch(&self, name: &str, args: Args<'_>) -> ToolResult<Value> {
        match name {
            RUN_SHELL => self.run_shell(args).await,
            READ_PRIMARY_PANE => self.read_primary_pane(args).await,
            SUBSCRIBE_PRIMARY_PANE => self.subscribe_primary_pane(args).await,
            FETCH_PRIMARY_PANE_UPDATES => self.fetch_primary_pane_updates(args).await,
            UNSUBSCRIBE_PRIMARY_PANE => self.unsubscribe_primary_pane(args).await,
            "" => Err(ToolError::InvalidArgument("missing tool name".into())),
            other => Err(ToolError::InvalidArgument(format!("unknown tool: {other}"))),
        }
    }

    async fn run_shell(&self, args: Args<'_>) -> ToolResult<Value> {
        let command = args.string("command")?;
        let send_enter = args.bool("send_enter", true)?;
        info!(pane = %self.primary, send_enter, "run_shell");

        self.subscriptions
            .tracker()
            .multiplexer()
            .send(&self.primary, command, send_enter)
            .await?;

        let note = if send_enter {
            "Command dispatched to the primary pane. Output appears in place."
        } else {
            "Command typed into the primary pane without pressing Enter."
        };
        Ok(json!({
            "command": command,
            "target_pane": self.primary,
            "submitted": true,
            "enter_sent": send_enter,
            "note": note,
        }))
    }

    async fn read_primary_pane(&self, args: Args<'_>) -> ToolResult<Value> {
        let lines = args.positive("lines", DEFAULT_READ_LINES)?;
        let include_colors = args.bool("include_colors", false)?;
        let read = self
            .subscriptions
            .tracker()
            .read(
                &self.primary,
                CaptureOptions {
                    lines,
                    include_colors,
                },
            )
            .await?;
        to_value(&read)
    }

    async fn subscribe_primary_pane(&self, args: Args<'_>) -> ToolResult<Value> {
        let options = SubscribeOptions {
            include_colors: args.bool("include_colors", false)?,
            initial_lines: args.non_negative("initial_lines", 0)?,
        };
        let info = self
            .subscriptions
            .subscribe(self.owner, &self.primary, options)
            .await?;
        to_value(&info)
    }

    async fn fetch_primary_pane_updates(&self, args: Args<'_>) -> ToolResult<Value> {
        let token = args.string("token")?;
        let options = FetchOptions::from_secs(
            args.number("timeout_seconds", DEFAULT_FETCH_TIMEOUT.as_secs_f64())?,
            args.integer("max_lines", DEFAULT_MAX_LINES as i64)?,
            args.number("poll_interval", DEFAULT_POLL_INTERVAL.as_secs_f64())?,
        )?;
        let result = self.subscriptions.fetch(token, options).await?;
        to_value(&result)
    }

    async fn unsubscribe_primary_pane(&self, args: Args<'_>) -> ToolResult<Value> {
        let token = args.string("token")?;
        self.subscriptions.unsubscribe(token).await?;
        Ok(json!({ "token": token, "unsubscribed": true }))
    }
}

/// Typed access to a call's `arguments` object.
struct Args<'a>(&'a Map<String, Value>);

impl<'a> Args<'a> {
    fn string(&self, key: &str) -> ToolResult<&'a str> {
        match self.0.get(key) {
            Some(Value::String(s)) => Ok(s),
            Some(_) => Err(invalid(key, "a string")),
            None => Err(ToolError::InvalidArgument(format!("{key} is required"))),
        }
    }

    fn bool(&self, key: &str, default: bool) -> ToolResult<bool> {
        match self.0.get(key) {
            None | Some(Value::Null) => Ok(default),
            Some(Value::Bool(b)) => Ok(*b),
            Some(_) => Err(invalid(key, "a boolean")),
        }
    }

    fn number(&self, key: &str, default: f64) -> ToolResult<f64> {
        match self.0.get(key) {
            None | Some(Value::Null) => Ok(default),
            Some(v) => v.as_f64().ok_or_else(|| invalid(key, "a number")),
        }
    }

    fn integer(&self, key: &str, default: i64) -> ToolResult<i64> {
        match self.0.get(key) {
            None | Some(Value::Null) => Ok(default),
            Some(v) => v.as_i64().ok_or_else(|| invalid(key, "an integer")),
        }
    }

    fn non_negative(&self, key: &str, default: usize) -> ToolResult<usize> {
        let value = self.integer(key, default as i64)?;
        usize::try_from(value).map_err(|_| invalid(key, "a non-negative integer"))
    }

    fn positive(&self, key: &str, default: usize) -> ToolResult<usize> {
        match self.non_negative(key, default)? {
            0 => Err(invalid(key, "at least 1")),
            n => Ok(n),
        }
    }
}

fn invalid(key: &str, expected: &str) -> ToolError {
    ToolError::InvalidArgument(format!("{key} must be {expected}"))
}

fn to_value<T: Serialize>(value: &T) -> ToolResult<Value> {
    serde_json::to_value(value).map_err(|e| ToolError::Other(format!("serialize result: {e}")))
}

/// Build a successful tool result carrying `value` both as text and structured.
pub fn tool_success(value: Value) -> Value {
    json!({
        "content": [{ "type": "text", "text": value.to_string() }],
        "structuredContent": value,
        "isError": false,
    })
}

/// Build a tool error result.
pub fn tool_error(error: &ToolError) -> Value {
    error_result(error_body(error))
}

fn error_body(error: &ToolError) -> Value {
    let mut body = json!({
        "error": error.code(),
        "message": error.to_string(),
    });
    if let ToolError::Gap {
        recorded, current, ..
    } = error
    {
        body["recorded"] = json!(recorded);
        body["current"] = json!(current);
    }
    body
}

fn error_result(body: Value) -> Value {
    json!({
        "content": [{ "type": "text", "text": body.to_string() }],
        "structuredContent": body,
        "isError": true,
    })
}

/// Handle `tools/list`.
pub fn tools_list() -> Value {
    json!({
        "tools": [
            {
                "name": RUN_SHELL,
                "description": "Type a command into the user's primary terminal pane. Output appears in place; read it back with read_primary_pane or a subscription.",
                "inputSchema": {
                    "type": "object",
                    "properties": {
                        "command": { "type": "string", "description": "Text to type into the pane" },
                        "send_enter": { "type": "boolean", "default": true, "description": "Press Enter after typing" }
                    },
                    "required": ["command"]
                }
            },
            {
                "name": READ_PRIMARY_PANE,
                "description": "Capture the most recent lines of the primary pane, including the current prompt line.",
                "inputSchema": {
                    "type": "object",
                    "properties": {
                        "lines": { "type": "integer", "minimum": 1, "default": DEFAULT_READ_LINES },
                        "include_colors": { "type": "boolean", "default": false }
                    }
                }
            },
            {
                "name": SUBSCRIBE_PRIMARY_PANE,
                "description": "Start tracking new output of the primary pane. Returns a token for fetch_primary_pane_updates.",
                "inputSchema": {
                    "type": "object",
                    "properties": {
                        "include_colors": { "type": "boolean", "default": false },
                        "initial_lines": { "type": "integer", "minimum": 0, "default": 0, "description": "Recent lines to return immediately" }
                    }
                }
            },
            {
                "name": FETCH_PRIMARY_PANE_UPDATES,
                "description": "Wait for finished lines written since the last fetch on this token. Each line is delivered exactly once.",
                "inputSchema": {
                    "type": "object",
                    "properties": {
                        "token": { "type": "string" },
                        "timeout_seconds": { "type": "number", "minimum": 0, "default": DEFAULT_FETCH_TIMEOUT.as_secs_f64() },
                        "max_lines": { "type": "integer", "minimum": 1, "default": DEFAULT_MAX_LINES },
                        "poll_interval": { "type": "number", "exclusiveMinimum": 0, "default": DEFAULT_POLL_INTERVAL.as_secs_f64() }
                    },
                    "required": ["token"]
                }
            },
            {
                "name": UNSUBSCRIBE_PRIMARY_PANE,
                "description": "Release a subscription token. Using the token afterwards fails with unknown_token.",
                "inputSchema": {
                    "type": "object",
                    "properties": {
                        "token": { "type": "string" }
                    },
                    "required": ["token"]
                }
            }
        ]
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tooldex_core::{MockMultiplexer, Multiplexer};

    fn context() -> (Arc<MockMultiplexer>, ToolContext) {
        let mux = Arc::new(MockMultiplexer::new());
        let primary = mux.add_pane(24, 1000);
        let subscriptions = Arc::new(SubscriptionManager::new(mux.clone()));
        (mux, ToolContext::new(primary, subscriptions, ActivationId(0)))
    }

    fn call_params(name: &str, arguments: Value) -> Option<Value> {
        Some(json!({ "name": name, "arguments": arguments }))
    }

    #[test]
    fn lists_all_tools() {
        let list = tools_list();
        let names: Vec<&str> = list["tools"]
            .as_array()
            .unwrap()
            .iter()
            .map(|t| t["name"].as_str().unwrap())
            .collect();
        assert_eq!(
            names,
            vec![
                RUN_SHELL,
                READ_PRIMARY_PANE,
                SUBSCRIBE_PRIMARY_PANE,
                FETCH_PRIMARY_PANE_UPDATES,
                UNSUBSCRIBE_PRIMARY_PANE
            ]
        );
    }

    #[tokio::test]
    async fn run_shell_types_into_primary() {
        let (mux, ctx) = context();
        let result = ctx
            .call(call_params(RUN_SHELL, json!({ "command": "echo hi" })))
            .await;
        assert_eq!(result["isError"], json!(false));
        assert_eq!(result["structuredContent"]["enter_sent"], json!(true));
        assert_eq!(
            result["structuredContent"]["target_pane"],
            json!(ctx.primary().as_str())
        );
        assert_eq!(mux.rows(ctx.primary()), vec!["$ echo hi", "hi", "$ "]);
    }

    #[tokio::test]
    async fn run_shell_without_enter() {
        let (mux, ctx) = context();
        let result = ctx
            .call(call_params(
                RUN_SHELL,
                json!({ "command": "ls", "send_enter": false }),
            ))
            .await;
        assert_eq!(result["structuredContent"]["enter_sent"], json!(false));
        assert_eq!(mux.rows(ctx.primary()), vec!["$ ls"]);
    }

    #[tokio::test]
    async fn subscribe_fetch_unsubscribe_flow() {
        let (mux, ctx) = context();
        let sub = ctx
            .call(call_params(SUBSCRIBE_PRIMARY_PANE, json!({})))
            .await;
        let token = sub["structuredContent"]["token"].as_str().unwrap().to_string();

        mux.send(ctx.primary(), "echo one", true).await.unwrap();
        let fetched = ctx
            .call(call_params(
                FETCH_PRIMARY_PANE_UPDATES,
                json!({ "token": token, "timeout_seconds": 0.5, "poll_interval": 0.01 }),
            ))
            .await;
        assert_eq!(fetched["isError"], json!(false));
        assert_eq!(
            fetched["structuredContent"]["lines"],
            json!(["$ echo one", "one"])
        );
        assert_eq!(fetched["structuredContent"]["timed_out"], json!(false));

        let gone = ctx
            .call(call_params(UNSUBSCRIBE_PRIMARY_PANE, json!({ "token": token })))
            .await;
        assert_eq!(gone["structuredContent"]["unsubscribed"], json!(true));

        let after = ctx
            .call(call_params(
                FETCH_PRIMARY_PANE_UPDATES,
                json!({ "token": token, "timeout_seconds": 0 }),
            ))
            .await;
        assert_eq!(after["isError"], json!(true));
        assert_eq!(after["structuredContent"]["error"], json!("unknown_token"));
    }

    #[tokio::test]
    async fn fetch_times_out_quietly() {
        let (_mux, ctx) = context();
        let sub = ctx
            .call(call_params(SUBSCRIBE_PRIMARY_PANE, json!({ "initial_lines": 5 })))
            .await;
        let token = sub["structuredContent"]["token"].as_str().unwrap();
        let fetched = ctx
            .call(call_params(
                FETCH_PRIMARY_PANE_UPDATES,
                json!({ "token": token, "timeout_seconds": 0.05, "poll_interval": 0.01 }),
            ))
            .await;
        assert_eq!(fetched["structuredContent"]["timed_out"], json!(true));
        assert_eq!(fetched["structuredContent"]["lines"], json!([]));
    }

    #[tokio::test]
    async fn read_returns_recent_lines() {
        let (mux, ctx) = context();
        mux.send(ctx.primary(), "echo x", true).await.unwrap();
        let read = ctx
            .call(call_params(READ_PRIMARY_PANE, json!({ "lines": 2 })))
            .await;
        assert_eq!(read["structuredContent"]["content"], json!(["x", "$ "]));
        assert_eq!(read["structuredContent"]["truncated"], json!(true));
    }

    #[tokio::test]
    async fn bad_arguments_are_tool_errors() {
        let (_mux, ctx) = context();
        for (name, arguments) in [
            (RUN_SHELL, json!({})),
            (RUN_SHELL, json!({ "command": 5 })),
            (READ_PRIMARY_PANE, json!({ "lines": 0 })),
            (SUBSCRIBE_PRIMARY_PANE, json!({ "initial_lines": -1 })),
            (FETCH_PRIMARY_PANE_UPDATES, json!({ "token": "t", "max_lines": 0 })),
            (FETCH_PRIMARY_PANE_UPDATES, json!({ "token": "t", "timeout_seconds": -1 })),
            (FETCH_PRIMARY_PANE_UPDATES, json!({ "token": "t", "poll_interval": 0 })),
            ("no_such_tool", json!({})),
        ] {
            let result = ctx.call(call_params(name, arguments)).await;
            assert_eq!(result["isError"], json!(true), "{name}");
            assert_eq!(
                result["structuredContent"]["error"],
                json!("invalid_argument"),
                "{name}"
            );
        }
    }

    #[tokio::test]
    async fn missing_pane_surfaces_code() {
        let (mux, ctx) = context();
        mux.remove_pane(ctx.primary());
        let result = ctx.call(call_params(READ_PRIMARY_PANE, json!({}))).await;
        assert_eq!(result["structuredContent"]["error"], json!("pane_not_found"));
    }

    #[test]
    fn gap_errors_carry_counts() {
        let body = tool_error(&ToolError::Gap {
            token: "t".into(),
            recorded: 10,
            current: 4,
        });
        assert_eq!(body["structuredContent"]["error"], json!("gap"));
        assert_eq!(body["structuredContent"]["recorded"], json!(10));
        assert_eq!(body["structuredContent"]["current"], json!(4));
        assert!(body["structuredContent"].get("snapshot").is_none());
    }

    #[tokio::test]
    async fn gap_carries_current_snapshot() {
        let (mux, ctx) = context();
        mux.write(ctx.primary(), "a\nb\nc\nd\n");
        let subscribed = ctx
            .call(call_params(SUBSCRIBE_PRIMARY_PANE, json!({})))
            .await;
        let token = subscribed["structuredContent"]["token"].clone();
        mux.reset(ctx.primary(), &["fresh", "$ "]);

        let result = ctx
            .call(call_params(
                FETCH_PRIMARY_PANE_UPDATES,
                json!({ "token": token, "timeout_seconds": 0.05, "poll_interval": 0.01 }),
            ))
            .await;
        assert_eq!(result["isError"], json!(true));
        let body = &result["structuredContent"];
        assert_eq!(body["error"], json!("gap"));
        let content = body["snapshot"]["content"].as_array().unwrap();
        assert!(content.contains(&json!("fresh")));
        let text: Value =
            serde_json::from_str(result["content"][0]["text"].as_str().unwrap()).unwrap();
        assert_eq!(text["snapshot"], body["snapshot"]);
    }
}
