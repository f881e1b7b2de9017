pub mod config;
pub mod mcp;

pub use config::{McpConfig, ResolvedServer, ServerConfig};
pub use mcp::{McpClient, McpError, ToolOutput};

// rmcpのツール定義を再エクスポート
pub use rmcp::model::Tool;
