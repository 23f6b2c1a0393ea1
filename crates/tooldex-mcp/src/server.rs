//! Stdio serving loop.
//!
//! Each request runs in its own task so a long fetch never holds up an
//! unsubscribe; a single writer task owns the output stream and emits one
//! response per line.

use serde_json::{json, Value};
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::jsonrpc::{
    encode, error_response, method_not_found, parse_error, success_response, IncomingMessage,
    Response, INVALID_PARAMS, INVALID_REQUEST,
};
use crate::resources;
use crate::tools::{tools_list, ToolContext};

/// MCP protocol version.
pub const PROTOCOL_VERSION: &str = "2024-11-05";

/// Server name reported during initialization.
pub const SERVER_NAME: &str = "tooldex-shell";

pub struct McpServer {
    tools: Arc<ToolContext>,
}

impl McpServer {
    pub fn new(tools: ToolContext) -> Self {
        Self {
            tools: Arc::new(tools),
        }
    }

    pub fn tools(&self) -> &Arc<ToolContext> {
        &self.tools
    }

    /// Handle one protocol line. Notifications and blank lines yield nothing.
    pub async fn handle_line(&self, line: &str) -> Option<Response> {
        handle_line(&self.tools, line).await
    }

    /// Serve until `reader` hits EOF. The owner's subscriptions are then
    /// closed, in-flight requests drain, and every response is flushed.
    pub async fn serve<R, W>(self, reader: R, writer: W) -> std::io::Result<()>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        info!(pane = %self.tools.primary(), "MCP server starting");

        let (tx, rx) = mpsc::unbounded_channel::<Response>();
        let writer_task = tokio::spawn(write_responses(writer, rx));

        let mut in_flight = JoinSet::new();
        let mut lines = reader.lines();
        let read_result = loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    let tools = self.tools.clone();
                    let tx = tx.clone();
                    in_flight.spawn(async move {
                        if let Some(response) = handle_line(&tools, &line).await {
                            let _ = tx.send(response);
                        }
                    });
                    // Reap finished tasks so the set does not grow unbounded.
                    while in_flight.try_join_next().is_some() {}
                }
                Ok(None) => break Ok(()),
                Err(e) => {
                    warn!(error = %e, "error reading stdin");
                    break Err(e);
                }
            }
        };

        let released = self
            .tools
            .subscriptions()
            .close_owner(self.tools.owner())
            .await;
        info!(released, "stdin closed, releasing subscriptions");

        while in_flight.join_next().await.is_some() {}
        drop(tx);
        match writer_task.await {
            Ok(Err(e)) => warn!(error = %e, "failed writing responses"),
            Err(e) => warn!(error = %e, "response writer panicked"),
            Ok(Ok(())) => {}
        }
        read_result
    }
}

async fn write_responses<W>(
    mut writer: W,
    mut rx: mpsc::UnboundedReceiver<Response>,
) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    while let Some(response) = rx.recv().await {
        let mut line = encode(&response);
        debug!(response = %line, "->");
        line.push('\n');
        writer.write_all(line.as_bytes()).await?;
        writer.flush().await?;
    }
    Ok(())
}

async fn handle_line(tools: &ToolContext, line: &str) -> Option<Response> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return None;
    }
    debug!(request = %trimmed, "<-");

    let msg: IncomingMessage = match serde_json::from_str(trimmed) {
        Ok(m) => m,
        Err(e) => {
            warn!(error = %e, "parse error");
            return Some(parse_error());
        }
    };

    let Some(method) = msg.method.as_deref() else {
        return msg
            .id
            .map(|id| error_response(id, INVALID_REQUEST, "Missing method"));
    };

    // Notifications get no response.
    let Some(id) = msg.id else {
        debug!(method, "notification");
        return None;
    };

    let response = match method {
        "initialize" => success_response(id, initialize_result()),
        "ping" => success_response(id, json!({})),
        "tools/list" => success_response(id, tools_list()),
        "tools/call" => success_response(id, tools.call(msg.params).await),
        "resources/list" => success_response(id, resources::list()),
        "resources/read" => match resources::read(msg.params.as_ref()) {
            Ok(result) => success_response(id, result),
            Err(message) => error_response(id, INVALID_PARAMS, message),
        },
        _ => method_not_found(id, method),
    };
    Some(response)
}

fn initialize_result() -> Value {
    json!({
        "protocolVersion": PROTOCOL_VERSION,
        "capabilities": {
            "tools": {},
            "resources": {}
        },
        "serverInfo": {
            "name": SERVER_NAME,
            "version": env!("CARGO_PKG_VERSION")
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::{FETCH_PRIMARY_PANE_UPDATES, SUBSCRIBE_PRIMARY_PANE, UNSUBSCRIBE_PRIMARY_PANE};
    use std::time::Duration;
    use tokio::io::{duplex, AsyncReadExt, BufReader};
    use tooldex_core::{ActivationId, MockMultiplexer, SubscriptionManager};

    fn server() -> (Arc<MockMultiplexer>, McpServer) {
        let mux = Arc::new(MockMultiplexer::new());
        let primary = mux.add_pane(24, 1000);
        let subscriptions = Arc::new(SubscriptionManager::new(mux.clone()));
        let tools = ToolContext::new(primary, subscriptions, ActivationId(0));
        (mux, McpServer::new(tools))
    }

    fn request(id: u64, method: &str, params: Value) -> String {
        json!({ "jsonrpc": "2.0", "id": id, "method": method, "params": params }).to_string()
    }

    fn encoded(response: Option<Response>) -> Value {
        serde_json::from_str(&encode(&response.unwrap())).unwrap()
    }

    #[tokio::test]
    async fn initialize_and_list() {
        let (_mux, server) = server();
        let init = encoded(server.handle_line(&request(1, "initialize", json!({}))).await);
        assert_eq!(init["result"]["protocolVersion"], json!(PROTOCOL_VERSION));
        assert_eq!(init["result"]["serverInfo"]["name"], json!(SERVER_NAME));

        let list = encoded(server.handle_line(&request(2, "tools/list", json!({}))).await);
        assert_eq!(list["result"]["tools"].as_array().unwrap().len(), 5);
        assert_eq!(list["id"], json!(2));
    }

    #[tokio::test]
    async fn protocol_errors() {
        let (_mux, server) = server();
        let bad = encoded(server.handle_line("{not json").await);
        assert_eq!(bad["error"]["code"], json!(-32700));

        let unknown = encoded(server.handle_line(&request(3, "bogus", json!({}))).await);
        assert_eq!(unknown["error"]["code"], json!(-32601));

        let note = r#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#;
        assert!(server.handle_line(note).await.is_none());
        assert!(server.handle_line("   ").await.is_none());
    }

    #[tokio::test]
    async fn fetch_does_not_block_unsubscribe() {
        let (_mux, server) = server();
        let (client, server_io) = duplex(64 * 1024);
        let (server_read, server_write) = tokio::io::split(server_io);
        let (mut client_read, mut client_write) = tokio::io::split(client);

        let subscribe = server
            .handle_line(&request(
                1,
                "tools/call",
                json!({ "name": SUBSCRIBE_PRIMARY_PANE, "arguments": {} }),
            ))
            .await;
        let token = encoded(subscribe)["result"]["structuredContent"]["token"]
            .as_str()
            .unwrap()
            .to_string();

        let serving = tokio::spawn(server.serve(BufReader::new(server_read), server_write));

        let fetch = request(
            2,
            "tools/call",
            json!({ "name": FETCH_PRIMARY_PANE_UPDATES, "arguments": { "token": token, "timeout_seconds": 30 } }),
        );
        let unsubscribe = request(
            3,
            "tools/call",
            json!({ "name": UNSUBSCRIBE_PRIMARY_PANE, "arguments": { "token": token } }),
        );
        client_write
            .write_all(format!("{fetch}\n").as_bytes())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        client_write
            .write_all(format!("{unsubscribe}\n").as_bytes())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        client_write.shutdown().await.unwrap();

        tokio::time::timeout(Duration::from_secs(5), serving)
            .await
            .unwrap()
            .unwrap()
            .unwrap();

        let mut output = String::new();
        client_read.read_to_string(&mut output).await.unwrap();
        let responses: Vec<Value> = output
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(responses.len(), 2);
        let by_id = |id: u64| {
            responses
                .iter()
                .find(|r| r["id"] == json!(id))
                .unwrap()
                .clone()
        };
        assert_eq!(
            by_id(3)["result"]["structuredContent"]["unsubscribed"],
            json!(true)
        );
        assert_eq!(
            by_id(2)["result"]["structuredContent"]["error"],
            json!("cancelled")
        );
    }

    #[tokio::test]
    async fn eof_cancels_pending_fetches() {
        let (_mux, server) = server();
        let subscriptions = server.tools().subscriptions().clone();
        let (client, server_io) = duplex(64 * 1024);
        let (server_read, server_write) = tokio::io::split(server_io);
        let (mut client_read, mut client_write) = tokio::io::split(client);

        let serving = tokio::spawn(server.serve(BufReader::new(server_read), server_write));
        let subscribe = request(
            1,
            "tools/call",
            json!({ "name": SUBSCRIBE_PRIMARY_PANE, "arguments": {} }),
        );
        client_write
            .write_all(format!("{subscribe}\n").as_bytes())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(subscriptions.count().await, 1);
        client_write.shutdown().await.unwrap();

        tokio::time::timeout(Duration::from_secs(5), serving)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(subscriptions.count().await, 0);

        let mut output = String::new();
        client_read.read_to_string(&mut output).await.unwrap();
        assert_eq!(output.lines().count(), 1);
    }
}
