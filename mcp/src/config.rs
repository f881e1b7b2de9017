/// mcp.json設定ファイルの読み込み
///
/// Visual Studio Codeの`.vscode/mcp.json`と同じ形式で、
/// エージェントにツールを供給するMCPサーバーを列挙する。
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use crate::McpError;

/// `${workspaceFolder}` 変数
const WORKSPACE_FOLDER_VAR: &str = "${workspaceFolder}";

/// 現在サポートしているサーバータイプ
const STDIO_SERVER_TYPE: &str = "stdio";

/// mcp.jsonファイルのルート構造
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct McpConfig {
    /// MCPサーバーの設定マップ（名前順に保持する）
    #[serde(default)]
    pub servers: BTreeMap<String, ServerConfig>,
}

/// MCPサーバーの設定
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// サーバータイプ（"stdio"のみ接続対象）
    #[serde(rename = "type", default = "default_server_type")]
    pub server_type: String,

    /// 実行するコマンド
    pub command: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,

    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub env: HashMap<String, String>,

    /// 作業ディレクトリ
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
}

fn default_server_type() -> String {
    STDIO_SERVER_TYPE.to_string()
}

/// 変数展開済みの起動パラメータ
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResolvedServer {
    pub command: String,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    pub cwd: Option<PathBuf>,
}

impl McpConfig {
    /// mcp.jsonファイルを読み込む
    ///
    /// # Errors
    /// ファイルの読み込みやパースに失敗した場合 `McpError::ConfigError`
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self, McpError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            McpError::ConfigError(format!("Failed to read {}: {}", path.display(), e))
        })?;
        Self::from_json(&content)
    }

    /// JSON文字列からパースする
    pub fn from_json(content: &str) -> Result<Self, McpError> {
        serde_json::from_str(content)
            .map_err(|e| McpError::ConfigError(format!("Failed to parse mcp.json: {}", e)))
    }

    /// デフォルトの設定ファイルを探す
    ///
    /// `.vscode/mcp.json` → `mcp.json` の順で、最初に存在したものを返す。
    pub fn default_path() -> Option<PathBuf> {
        [".vscode/mcp.json", "mcp.json"]
            .into_iter()
            .map(PathBuf::from)
            .find(|path| path.exists())
    }

    /// 接続対象となるstdioサーバーだけを返す
    ///
    /// それ以外のタイプ（sse/http等）はログに残してスキップする。
    pub fn stdio_servers(&self) -> impl Iterator<Item = (&str, &ServerConfig)> {
        self.servers.iter().filter_map(|(name, server)| {
            if server.server_type == STDIO_SERVER_TYPE {
                Some((name.as_str(), server))
            } else {
                tracing::warn!(
                    server = name.as_str(),
                    server_type = server.server_type.as_str(),
                    "skipping unsupported MCP server type"
                );
                None
            }
        })
    }

    /// 特定のサーバー設定を取得
    pub fn get_server(&self, name: &str) -> Option<&ServerConfig> {
        self.servers.get(name)
    }
}

impl ServerConfig {
    /// `${workspaceFolder}` を展開して起動パラメータを作る
    ///
    /// 展開対象は command / args / env の値 / cwd。
    pub fn resolve(&self, workspace_folder: Option<&str>) -> ResolvedServer {
        let expand = |value: &str| match workspace_folder {
            Some(workspace) => value.replace(WORKSPACE_FOLDER_VAR, workspace),
            None => value.to_string(),
        };

        ResolvedServer {
            command: expand(&self.command),
            args: self.args.iter().map(|arg| expand(arg)).collect(),
            env: self
                .env
                .iter()
                .map(|(key, value)| (key.clone(), expand(value)))
                .collect(),
            cwd: self.cwd.as_deref().map(|cwd| PathBuf::from(expand(cwd))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_simple_config() {
        let json = r#"
        {
          "servers": {
            "strands": {
              "type": "stdio",
              "command": "uvx",
              "args": ["strands-agents-mcp-server"]
            }
          }
        }
        "#;

        let config = McpConfig::from_json(json).unwrap();
        assert_eq!(config.servers.len(), 1);

        let server = config.get_server("strands").unwrap();
        assert_eq!(server.server_type, "stdio");
        assert_eq!(server.command, "uvx");
        assert_eq!(server.args, vec!["strands-agents-mcp-server"]);
    }

    #[test]
    fn test_server_type_defaults_to_stdio() {
        let json = r#"{ "servers": { "git": { "command": "uvx" } } }"#;
        let config = McpConfig::from_json(json).unwrap();
        assert_eq!(config.get_server("git").unwrap().server_type, "stdio");
    }

    #[test]
    fn test_stdio_servers_skips_other_types() {
        let json = r#"
        {
          "servers": {
            "remote": { "type": "http", "command": "" },
            "local": { "type": "stdio", "command": "npx" }
          }
        }
        "#;

        let config = McpConfig::from_json(json).unwrap();
        let names: Vec<&str> = config.stdio_servers().map(|(name, _)| name).collect();
        assert_eq!(names, vec!["local"]);
    }

    #[test]
    fn test_invalid_json_is_config_error() {
        let err = McpConfig::from_json("{ servers: ").unwrap_err();
        assert!(matches!(err, McpError::ConfigError(_)));
    }

    #[test]
    fn test_resolve_workspace_folder() {
        let server = ServerConfig {
            server_type: "stdio".to_string(),
            command: "${workspaceFolder}/target/release/app".to_string(),
            args: vec![
                "--config".to_string(),
                "${workspaceFolder}/config.toml".to_string(),
            ],
            env: HashMap::from([(
                "DATA_DIR".to_string(),
                "${workspaceFolder}/data".to_string(),
            )]),
            cwd: Some("${workspaceFolder}".to_string()),
        };

        let resolved = server.resolve(Some("/home/user/project"));
        assert_eq!(resolved.command, "/home/user/project/target/release/app");
        assert_eq!(resolved.args[1], "/home/user/project/config.toml");
        assert_eq!(resolved.env["DATA_DIR"], "/home/user/project/data");
        assert_eq!(resolved.cwd, Some(PathBuf::from("/home/user/project")));
    }

    #[test]
    fn test_resolve_without_workspace_keeps_variables() {
        let server = ServerConfig {
            server_type: "stdio".to_string(),
            command: "${workspaceFolder}/bin".to_string(),
            args: Vec::new(),
            env: HashMap::new(),
            cwd: None,
        };

        assert_eq!(server.resolve(None).command, "${workspaceFolder}/bin");
    }
}
