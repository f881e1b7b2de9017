//! エージェントの設定
//!
//! `agent.json`（または `.bedrock/agent.json`）から読み込み、一部は環境変数で上書きする。

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::agent::AgentError;

/// 既定のモデルID（クロスリージョン推論プロファイル）
pub const DEFAULT_MODEL_ID: &str = "us.anthropic.claude-3-5-haiku-20241022-v1:0";
const DEFAULT_TEMPERATURE: f32 = 0.3;
const DEFAULT_TOP_K: i32 = 3;
const DEFAULT_MAX_CYCLES: usize = 10;
const DEFAULT_ACTOR_ID: &str = "default_user";

/// ナレッジベースIDを上書きする環境変数
pub const KNOWLEDGE_BASE_ID_ENV: &str = "KNOWLEDGE_BASE_ID";
/// AgentCore Memory のIDを上書きする環境変数
pub const MEMORY_ID_ENV: &str = "MEMORY_ID";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AgentConfig {
    pub model_id: String,
    /// 指定しない場合はプロファイルの設定、なければ us-east-1
    pub region: Option<String>,
    /// AWS プロファイル名
    pub profile: Option<String>,
    /// 既定の temperature（ステージ側で上書きできる）
    pub temperature: f32,
    /// 1回の呼び出しで回すイベントループの上限
    pub max_cycles: usize,
    pub knowledge_base_id: Option<String>,
    /// 検索件数
    pub top_k: i32,
    /// AgentCore Memory のID（未設定なら長期記憶を使わない）
    pub memory_id: Option<String>,
    /// 記憶の持ち主
    pub actor_id: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            model_id: DEFAULT_MODEL_ID.to_string(),
            region: None,
            profile: None,
            temperature: DEFAULT_TEMPERATURE,
            max_cycles: DEFAULT_MAX_CYCLES,
            knowledge_base_id: None,
            top_k: DEFAULT_TOP_K,
            memory_id: None,
            actor_id: DEFAULT_ACTOR_ID.to_string(),
        }
    }
}

impl AgentConfig {
    /// JSONファイルから読み込む
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, AgentError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            AgentError::ConfigError(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;
        Self::from_json(&content)
    }

    pub fn from_json(json: &str) -> Result<Self, AgentError> {
        serde_json::from_str(json)
            .map_err(|e| AgentError::ConfigError(format!("Failed to parse config JSON: {}", e)))
    }

    /// 既定の設定ファイルパス（`.bedrock/agent.json` を優先し、なければ `agent.json`）
    pub fn default_path() -> Option<PathBuf> {
        [".bedrock/agent.json", "agent.json"]
            .iter()
            .map(PathBuf::from)
            .find(|path| path.exists())
    }

    /// パス指定があればそれを、なければ既定パスを読み、環境変数を反映する
    ///
    /// 既定パスにファイルがない場合は既定値を使う。
    pub fn load(path: Option<&Path>) -> Result<Self, AgentError> {
        let config = match path.map(Path::to_path_buf).or_else(Self::default_path) {
            Some(path) => {
                tracing::debug!(path = %path.display(), "loading agent config");
                Self::load_from_file(path)?
            }
            None => Self::default(),
        };

        Ok(config.apply_env(|key| std::env::var(key).ok()))
    }

    /// 環境変数による上書きを反映する
    pub fn apply_env<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(id) = lookup(KNOWLEDGE_BASE_ID_ENV).filter(|id| !id.trim().is_empty()) {
            self.knowledge_base_id = Some(id);
        }
        if let Some(id) = lookup(MEMORY_ID_ENV).filter(|id| !id.trim().is_empty()) {
            self.memory_id = Some(id);
        }
        self
    }

    /// ナレッジベースIDを取り出す（未設定ならエラー）
    pub fn require_knowledge_base_id(&self) -> Result<&str, AgentError> {
        self.knowledge_base_id.as_deref().ok_or_else(|| {
            AgentError::ConfigError(format!(
                "knowledge base id is not configured (set knowledgeBaseId or {})",
                KNOWLEDGE_BASE_ID_ENV
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_for_missing_fields() {
        let config = AgentConfig::from_json(r#"{"region": "us-west-2"}"#).unwrap();
        assert_eq!(config.model_id, DEFAULT_MODEL_ID);
        assert_eq!(config.region.as_deref(), Some("us-west-2"));
        assert_eq!(config.temperature, 0.3);
        assert_eq!(config.top_k, 3);
        assert!(config.knowledge_base_id.is_none());
    }

    #[test]
    fn test_camel_case_fields() {
        let config = AgentConfig::from_json(
            r#"{"modelId": "anthropic.claude-3-5-sonnet-20240620-v1:0", "knowledgeBaseId": "KB123", "topK": 5, "maxCycles": 2}"#,
        )
        .unwrap();
        assert_eq!(config.model_id, "anthropic.claude-3-5-sonnet-20240620-v1:0");
        assert_eq!(config.require_knowledge_base_id().unwrap(), "KB123");
        assert_eq!(config.top_k, 5);
        assert_eq!(config.max_cycles, 2);
    }

    #[test]
    fn test_env_overrides_knowledge_base_id() {
        let config = AgentConfig::default().apply_env(|key| {
            (key == KNOWLEDGE_BASE_ID_ENV).then(|| "KB-ENV".to_string())
        });
        assert_eq!(config.knowledge_base_id.as_deref(), Some("KB-ENV"));

        let config = AgentConfig {
            knowledge_base_id: Some("KB-FILE".to_string()),
            ..AgentConfig::default()
        }
        .apply_env(|_| Some("  ".to_string()));
        assert_eq!(config.knowledge_base_id.as_deref(), Some("KB-FILE"));
    }

    #[test]
    fn test_memory_settings() {
        let config = AgentConfig::from_json(r#"{"memoryId": "mem-file", "actorId": "customer_1a2b3c4d"}"#)
            .unwrap();
        assert_eq!(config.memory_id.as_deref(), Some("mem-file"));
        assert_eq!(config.actor_id, "customer_1a2b3c4d");

        let config = AgentConfig::default()
            .apply_env(|key| (key == MEMORY_ID_ENV).then(|| "mem-env".to_string()));
        assert_eq!(config.memory_id.as_deref(), Some("mem-env"));
        assert_eq!(config.actor_id, "default_user");
        assert!(config.knowledge_base_id.is_none());
    }

    #[test]
    fn test_missing_knowledge_base_id_is_config_error() {
        let err = AgentConfig::default().require_knowledge_base_id().unwrap_err();
        assert!(matches!(err, AgentError::ConfigError(msg) if msg.contains(KNOWLEDGE_BASE_ID_ENV)));
    }

    #[test]
    fn test_invalid_json() {
        assert!(matches!(
            AgentConfig::from_json("{not json"),
            Err(AgentError::ConfigError(_))
        ));
    }

    #[test]
    fn test_load_from_missing_file() {
        let result = AgentConfig::load_from_file("/nonexistent/agent.json");
        assert!(matches!(result, Err(AgentError::ConfigError(msg)) if msg.contains("Failed to read")));
    }
}
