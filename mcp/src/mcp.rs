use rmcp::{
    model::{CallToolRequestParam, Tool},
    service::{RoleClient, RunningService, ServiceError, ServiceExt},
    transport::{ConfigureCommandExt, TokioChildProcess},
};
use serde_json::{Map, Value};
use tokio::process::Command;

use crate::config::ResolvedServer;

/// MCPクライアントのエラー型
#[derive(thiserror::Error, Debug)]
pub enum McpError {
    #[error("MCP transport error: {0}")]
    TransportError(String),

    #[error("MCP service error: {0}")]
    ServiceError(#[from] ServiceError),

    #[error("MCP client initialization error: {0}")]
    InitializationError(String),

    #[error("Task join error: {0}")]
    TaskJoinError(#[from] tokio::task::JoinError),

    #[error("MCP config error: {0}")]
    ConfigError(String),
}

/// ツール実行結果
///
/// MCPの `CallToolResult` からテキストコンテンツだけを取り出したもの。
#[derive(Debug, Clone, PartialEq)]
pub struct ToolOutput {
    /// テキストコンテンツを改行で連結したもの
    pub text: String,
    /// サーバーがエラーとして返したかどうか
    pub is_error: bool,
}

/// ローカルMCPサーバー（stdio子プロセス）との通信を管理するクライアント
///
/// エージェントのツール供給元として使われ、ツール一覧の取得と
/// `tools/call` の転送のみを担当する。
pub struct McpClient {
    /// 接続名（mcp.json のサーバー名、またはコマンド名）
    name: String,
    client: RunningService<RoleClient, ()>,
}

impl McpClient {
    /// コマンドを子プロセスとして起動し、MCPサーバーに接続する
    ///
    /// # Arguments
    /// * `command` - 起動するコマンド名（例: "uvx", "npx"）
    /// * `args` - コマンド引数（例: `["strands-agents-mcp-server"]`）
    ///
    /// # Examples
    /// ```no_run
    /// # use mcp::McpClient;
    /// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
    /// let client = McpClient::spawn("uvx", &["strands-agents-mcp-server"]).await?;
    /// # Ok(())
    /// # }
    /// ```
    pub async fn spawn<S: AsRef<str>>(command: &str, args: &[S]) -> Result<Self, McpError> {
        let server = ResolvedServer {
            command: command.to_string(),
            args: args.iter().map(|arg| arg.as_ref().to_string()).collect(),
            env: Default::default(),
            cwd: None,
        };
        Self::connect(command, &server).await
    }

    /// mcp.json から解決済みのサーバー設定で接続する
    ///
    /// 環境変数と作業ディレクトリは子プロセスにのみ適用される。
    pub async fn connect(name: &str, server: &ResolvedServer) -> Result<Self, McpError> {
        let transport = TokioChildProcess::new(Command::new(&server.command).configure(|cmd| {
            cmd.args(&server.args);
            cmd.envs(&server.env);
            if let Some(cwd) = &server.cwd {
                cmd.current_dir(cwd);
            }
        }))
        .map_err(|e| McpError::TransportError(e.to_string()))?;

        let client = ()
            .serve(transport)
            .await
            .map_err(|e| McpError::InitializationError(e.to_string()))?;

        tracing::info!(server = name, command = %server.command, "connected to MCP server");

        Ok(Self {
            name: name.to_string(),
            client,
        })
    }

    /// 接続名
    pub fn name(&self) -> &str {
        &self.name
    }

    /// サーバーが名乗った実装名（初期化応答に含まれていれば）
    pub fn server_name(&self) -> Option<String> {
        self.client
            .peer_info()
            .map(|info| info.server_info.name.clone())
    }

    /// 利用可能なツールをすべて取得する（ページングはrmcp側で処理される）
    pub async fn list_tools(&self) -> Result<Vec<Tool>, McpError> {
        Ok(self.client.list_all_tools().await?)
    }

    /// 指定されたツールを実行する
    ///
    /// # Arguments
    /// * `tool_name` - 実行するツール名
    /// * `arguments` - ツールに渡す引数（JSONオブジェクト）
    ///
    /// # Returns
    /// テキストコンテンツのみを連結した結果。画像などの非テキストは無視する。
    pub async fn call_tool(
        &self,
        tool_name: &str,
        arguments: Option<Map<String, Value>>,
    ) -> Result<ToolOutput, McpError> {
        tracing::debug!(server = %self.name, tool = tool_name, "calling MCP tool");

        let result = self
            .client
            .call_tool(CallToolRequestParam {
                name: tool_name.to_string().into(),
                arguments,
            })
            .await?;

        let text = result
            .content
            .iter()
            .filter_map(|content| content.as_text().map(|t| t.text.as_str()))
            .collect::<Vec<_>>()
            .join("\n");

        Ok(ToolOutput {
            text,
            is_error: result.is_error.unwrap_or(false),
        })
    }

    /// MCPサーバーとの接続を切断する
    pub async fn disconnect(self) -> Result<(), McpError> {
        let reason = self.client.cancel().await?;
        tracing::info!(server = %self.name, ?reason, "disconnected from MCP server");
        Ok(())
    }
}
