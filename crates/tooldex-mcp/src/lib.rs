//! tooldex-mcp: MCP server over stdio giving an agent the primary pane.
//!
//! Reads line-delimited JSON-RPC 2.0 from stdin and writes responses to
//! stdout. Tools: `run_shell`, `read_primary_pane`,
//! `subscribe_primary_pane`, `fetch_primary_pane_updates`,
//! `unsubscribe_primary_pane`.

pub mod jsonrpc;
pub mod resources;
pub mod server;
pub mod tools;

pub use server::McpServer;
pub use tools::ToolContext;
