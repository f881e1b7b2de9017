//! エージェントランタイムの抽象
//!
//! ランタイムはプロンプトとモデル設定を受け取り、イベントを非同期に流す不透明なサービス。
//! Bedrock 実装は [`crate::agent::AgentClient`]。

use std::pin::Pin;

use async_trait::async_trait;
use futures_util::Stream;
use serde::{Deserialize, Serialize};

use crate::agent::AgentError;
use crate::event::StreamEvent;

/// ランタイムが返すイベントストリーム
///
/// ストリームを drop するとランタイム側の生成も止まる。
pub type EventStream = Pin<Box<dyn Stream<Item = Result<StreamEvent, AgentError>> + Send>>;

/// 会話の話者
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

/// 会話履歴の1ターン
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatTurn {
    pub role: Role,
    pub text: String,
}

impl ChatTurn {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            text: text.into(),
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            text: text.into(),
        }
    }
}

/// 1回の呼び出しの構成（ステージごとに独立して指定する）
#[derive(Debug, Clone, PartialEq)]
pub struct StageConfig {
    /// ログ用の名前
    pub name: String,
    /// システムプロンプト
    pub system_prompt: Option<String>,
    /// 指定しない場合はランタイムの既定値
    pub temperature: Option<f32>,
    /// ツールを提示するかどうか
    pub use_tools: bool,
}

impl StageConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            system_prompt: None,
            temperature: None,
            use_tools: true,
        }
    }

    pub fn with_system_prompt(mut self, system_prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(system_prompt.into());
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn without_tools(mut self) -> Self {
        self.use_tools = false;
        self
    }
}

impl Default for StageConfig {
    fn default() -> Self {
        Self::new("default")
    }
}

/// ランタイムへの呼び出し要求
#[derive(Debug, Clone, PartialEq)]
pub struct InvocationRequest {
    /// 今回のユーザーメッセージ
    pub message: String,
    pub stage: StageConfig,
    /// それ以前の会話（古い順）
    pub history: Vec<ChatTurn>,
}

impl InvocationRequest {
    pub fn new(message: impl Into<String>, stage: StageConfig) -> Self {
        Self {
            message: message.into(),
            stage,
            history: Vec::new(),
        }
    }

    pub fn with_history(mut self, history: Vec<ChatTurn>) -> Self {
        self.history = history;
        self
    }
}

/// エージェントランタイム
#[async_trait]
pub trait AgentRuntime: Send + Sync {
    /// 呼び出しを開始し、イベントストリームを返す
    ///
    /// 開始自体に失敗した場合は `Err`。開始後の失敗はストリームの `Err` 要素として届く。
    async fn invoke(&self, request: InvocationRequest) -> Result<EventStream, AgentError>;
}
