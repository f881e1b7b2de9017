//! エージェントが呼び出せるツール
//!
//! 組み込みツールと、MCPサーバーから取得したツールを同じ `Tool` トレイトで扱う。

use std::sync::Arc;

use async_trait::async_trait;
use mcp::McpClient;
use serde_json::{Value, json};

/// ツール実行のエラー型
///
/// エージェントループはこれをエラー結果としてモデルに返し、ループ自体は止めない。
#[derive(thiserror::Error, Debug)]
pub enum ToolError {
    #[error("Unknown tool: {0}")]
    UnknownTool(String),

    #[error("Invalid arguments: {0}")]
    InvalidArguments(String),

    #[error("Tool execution failed: {0}")]
    ExecutionFailed(String),

    #[error("MCP error: {0}")]
    McpError(#[from] mcp::McpError),
}

/// ツール
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    /// 入力のJSON Schema
    fn input_schema(&self) -> Value;
    async fn call(&self, input: Value) -> Result<String, ToolError>;
}

/// 登録順を保持するツール一覧
#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: Vec<Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 組み込みツールをすべて登録した状態で作る
    pub fn with_builtin_tools() -> Self {
        let mut registry = Self::new();
        registry.register(LetterCounter);
        registry.register(CurrentTime);
        registry.register(UserLocation);
        registry.register(Weather);
        registry.register(TextAnalyzer);
        registry
    }

    /// ツールを登録する。同名のツールがあれば置き換える
    pub fn register(&mut self, tool: impl Tool + 'static) {
        self.register_arc(Arc::new(tool));
    }

    fn register_arc(&mut self, tool: Arc<dyn Tool>) {
        if let Some(existing) = self.tools.iter_mut().find(|t| t.name() == tool.name()) {
            tracing::warn!(tool = tool.name(), "replacing tool with the same name");
            *existing = tool;
        } else {
            self.tools.push(tool);
        }
    }

    /// MCPサーバーが公開しているツールをすべて登録する
    ///
    /// # Returns
    /// 登録したツール数
    pub async fn register_mcp(&mut self, client: Arc<McpClient>) -> Result<usize, ToolError> {
        let tools = client.list_tools().await?;
        let count = tools.len();

        for tool in tools {
            self.register_arc(Arc::new(McpTool::new(client.clone(), &tool)));
        }

        tracing::info!(server = client.name(), tools = count, "registered MCP tools");
        Ok(count)
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Tool>> {
        self.tools.iter().find(|tool| tool.name() == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn Tool>> {
        self.tools.iter()
    }

    pub fn names(&self) -> Vec<&str> {
        self.tools.iter().map(|tool| tool.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// 名前でツールを実行する
    pub async fn execute(&self, name: &str, input: Value) -> Result<String, ToolError> {
        let tool = self
            .get(name)
            .ok_or_else(|| ToolError::UnknownTool(name.to_string()))?;

        tracing::debug!(tool = name, "executing tool");
        tool.call(input).await
    }
}

/// 引数から文字列フィールドを取り出す
fn string_arg<'a>(input: &'a Value, key: &str) -> Result<&'a str, ToolError> {
    input
        .get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| ToolError::InvalidArguments(format!("'{}' must be a string", key)))
}

/// 単語に含まれる特定の文字の数を数える（大文字小文字は区別しない）
pub struct LetterCounter;

#[async_trait]
impl Tool for LetterCounter {
    fn name(&self) -> &str {
        "letter_counter"
    }

    fn description(&self) -> &str {
        "Count occurrences of a specific letter in a word."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "word": {"type": "string", "description": "The input word to search in"},
                "letter": {"type": "string", "description": "The specific letter to count"}
            },
            "required": ["word", "letter"]
        })
    }

    async fn call(&self, input: Value) -> Result<String, ToolError> {
        // 型の検査を先に行い、その後で1文字かどうかを検査する
        let word = string_arg(&input, "word")?;
        let letter = string_arg(&input, "letter")?;

        if letter.chars().count() != 1 {
            return Err(ToolError::InvalidArguments(
                "The 'letter' parameter must be a single character".to_string(),
            ));
        }

        let count = word
            .to_lowercase()
            .matches(letter.to_lowercase().as_str())
            .count();
        Ok(count.to_string())
    }
}

/// 現在時刻（UTC, RFC 3339）
pub struct CurrentTime;

#[async_trait]
impl Tool for CurrentTime {
    fn name(&self) -> &str {
        "current_time"
    }

    fn description(&self) -> &str {
        "Get the current time in ISO 8601 format (UTC)."
    }

    fn input_schema(&self) -> Value {
        json!({"type": "object", "properties": {}})
    }

    async fn call(&self, _input: Value) -> Result<String, ToolError> {
        Ok(chrono::Utc::now().to_rfc3339())
    }
}

/// ユーザーの現在地
pub struct UserLocation;

#[async_trait]
impl Tool for UserLocation {
    fn name(&self) -> &str {
        "get_user_location"
    }

    fn description(&self) -> &str {
        "Get the user's location (city name)."
    }

    fn input_schema(&self) -> Value {
        json!({"type": "object", "properties": {}})
    }

    async fn call(&self, _input: Value) -> Result<String, ToolError> {
        Ok("Tokyo".to_string())
    }
}

/// 指定された場所の天気（ダミーデータ）
pub struct Weather;

const WEATHER_TABLE: [(&str, &str); 4] = [
    ("東京", "晴れ、気温22度"),
    ("大阪", "曇り、気温20度"),
    ("ニューヨーク", "雨、気温15度"),
    ("ロンドン", "曇り、気温12度"),
];

#[async_trait]
impl Tool for Weather {
    fn name(&self) -> &str {
        "weather"
    }

    fn description(&self) -> &str {
        "指定された場所の天気情報を取得します。"
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "location": {"type": "string", "description": "天気を確認したい場所（例: 東京、大阪、ニューヨーク）"}
            },
            "required": ["location"]
        })
    }

    async fn call(&self, input: Value) -> Result<String, ToolError> {
        let location = string_arg(&input, "location")?;

        Ok(WEATHER_TABLE
            .iter()
            .find(|(name, _)| *name == location)
            .map(|(_, weather)| weather.to_string())
            .unwrap_or_else(|| format!("{}の天気情報: 晴れのち曇り、気温18度", location)))
    }
}

/// テキストの文字数・単語数・行数
pub struct TextAnalyzer;

#[async_trait]
impl Tool for TextAnalyzer {
    fn name(&self) -> &str {
        "text_analyzer"
    }

    fn description(&self) -> &str {
        "テキストを分析して文字数や単語数を返します。"
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "text": {"type": "string", "description": "分析するテキスト"}
            },
            "required": ["text"]
        })
    }

    async fn call(&self, input: Value) -> Result<String, ToolError> {
        let text = string_arg(&input, "text")?;

        Ok(format!(
            "テキスト分析結果:\n- 文字数: {}\n- 単語数: {}\n- 行数: {}\n",
            text.chars().count(),
            text.split_whitespace().count(),
            text.split('\n').count()
        ))
    }
}

/// MCPサーバーのツールを転送する
pub struct McpTool {
    client: Arc<McpClient>,
    name: String,
    description: String,
    input_schema: Value,
}

impl McpTool {
    pub fn new(client: Arc<McpClient>, tool: &mcp::Tool) -> Self {
        Self {
            client,
            name: tool.name.to_string(),
            description: tool.description.as_deref().unwrap_or_default().to_string(),
            input_schema: Value::Object(tool.input_schema.as_ref().clone()),
        }
    }
}

#[async_trait]
impl Tool for McpTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn input_schema(&self) -> Value {
        self.input_schema.clone()
    }

    async fn call(&self, input: Value) -> Result<String, ToolError> {
        let arguments = match input {
            Value::Object(map) => Some(map),
            Value::Null => None,
            other => {
                return Err(ToolError::InvalidArguments(format!(
                    "MCP tool arguments must be an object, got: {}",
                    other
                )));
            }
        };

        let output = self.client.call_tool(&self.name, arguments).await?;
        if output.is_error {
            Err(ToolError::ExecutionFailed(output.text))
        } else {
            Ok(output.text)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_letter_counter_is_case_insensitive() {
        let result = LetterCounter
            .call(json!({"word": "Strawberry", "letter": "R"}))
            .await
            .unwrap();
        assert_eq!(result, "3");

        let result = LetterCounter
            .call(json!({"word": "Strands", "letter": "s"}))
            .await
            .unwrap();
        assert_eq!(result, "2");
    }

    #[tokio::test]
    async fn test_letter_counter_checks_types_before_length() {
        let err = LetterCounter
            .call(json!({"word": 42, "letter": "ab"}))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::InvalidArguments(msg) if msg.contains("'word'")));

        let err = LetterCounter
            .call(json!({"word": "strawberry", "letter": "rr"}))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::InvalidArguments(msg) if msg.contains("single character")));

        let err = LetterCounter
            .call(json!({"word": "strawberry", "letter": ""}))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::InvalidArguments(_)));
    }

    #[tokio::test]
    async fn test_weather_lookup_and_fallback() {
        assert_eq!(
            Weather.call(json!({"location": "東京"})).await.unwrap(),
            "晴れ、気温22度"
        );
        assert_eq!(
            Weather.call(json!({"location": "札幌"})).await.unwrap(),
            "札幌の天気情報: 晴れのち曇り、気温18度"
        );
    }

    #[tokio::test]
    async fn test_text_analyzer_counts() {
        let result = TextAnalyzer
            .call(json!({"text": "こんにちは 世界\nhello"}))
            .await
            .unwrap();
        assert!(result.contains("- 文字数: 14"));
        assert!(result.contains("- 単語数: 3"));
        assert!(result.contains("- 行数: 2"));
    }

    #[tokio::test]
    async fn test_registry_dispatch() {
        let registry = ToolRegistry::with_builtin_tools();
        assert_eq!(
            registry.names(),
            vec![
                "letter_counter",
                "current_time",
                "get_user_location",
                "weather",
                "text_analyzer"
            ]
        );

        assert_eq!(
            registry.execute("get_user_location", Value::Null).await.unwrap(),
            "Tokyo"
        );
        assert!(matches!(
            registry.execute("calculator", json!({})).await,
            Err(ToolError::UnknownTool(name)) if name == "calculator"
        ));
    }

    #[test]
    fn test_register_replaces_same_name() {
        let mut registry = ToolRegistry::new();
        registry.register(Weather);
        registry.register(Weather);
        assert_eq!(registry.len(), 1);
    }
}
