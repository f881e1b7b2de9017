//! エージェントランタイムが1ティックごとに発行するイベント
//!
//! 上流のレコードはキーが任意のマップで、キーが無いことは「該当しない」を意味する
//! （`false` とは区別する）。そのため各フィールドは `Option` で保持する。
//! 型が合わないキーは「無い」ものとして読み、レコードの他のキーは生かす。

use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::agent::AgentError;

/// `message` キーの中身
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventMessage {
    #[serde(default, deserialize_with = "lenient", skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
}

/// `current_tool_use` キーの中身
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolUseRef {
    #[serde(default, deserialize_with = "lenient", skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// ストリーミングイベント1件
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StreamEvent {
    #[serde(default, deserialize_with = "lenient", skip_serializing_if = "Option::is_none")]
    pub init_event_loop: Option<bool>,
    #[serde(default, deserialize_with = "lenient", skip_serializing_if = "Option::is_none")]
    pub start_event_loop: Option<bool>,
    #[serde(default, deserialize_with = "lenient", skip_serializing_if = "Option::is_none")]
    pub message: Option<EventMessage>,
    #[serde(default, deserialize_with = "lenient", skip_serializing_if = "Option::is_none")]
    pub complete: Option<bool>,
    #[serde(default, deserialize_with = "lenient", skip_serializing_if = "Option::is_none")]
    pub force_stop: Option<bool>,
    #[serde(default, deserialize_with = "lenient", skip_serializing_if = "Option::is_none")]
    pub force_stop_reason: Option<String>,
    #[serde(default, deserialize_with = "lenient", skip_serializing_if = "Option::is_none")]
    pub current_tool_use: Option<ToolUseRef>,
    #[serde(default, deserialize_with = "lenient", skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
}

impl StreamEvent {
    pub fn init_event_loop() -> Self {
        Self {
            init_event_loop: Some(true),
            ..Default::default()
        }
    }

    pub fn start_event_loop() -> Self {
        Self {
            start_event_loop: Some(true),
            ..Default::default()
        }
    }

    pub fn message(role: impl Into<String>) -> Self {
        Self {
            message: Some(EventMessage {
                role: Some(role.into()),
            }),
            ..Default::default()
        }
    }

    pub fn complete() -> Self {
        Self {
            complete: Some(true),
            ..Default::default()
        }
    }

    pub fn force_stop(reason: Option<String>) -> Self {
        Self {
            force_stop: Some(true),
            force_stop_reason: reason,
            ..Default::default()
        }
    }

    pub fn tool_use(name: impl Into<String>) -> Self {
        Self {
            current_tool_use: Some(ToolUseRef {
                name: Some(name.into()),
            }),
            ..Default::default()
        }
    }

    pub fn data(chunk: impl Into<String>) -> Self {
        Self {
            data: Some(chunk.into()),
            ..Default::default()
        }
    }

    /// 上流から届いた生のJSONレコードを取り込む
    ///
    /// 形の合わないレコードはエラーにせず、どの分類にも該当しないイベントとして扱う。
    pub fn from_value(value: Value) -> Self {
        if !value.is_object() {
            tracing::debug!(record = %value, "event record is not an object");
            return Self::default();
        }

        let event = serde_json::from_value(value).unwrap_or_else(|e| {
            tracing::debug!(error = %e, "event record could not be decoded");
            Self::default()
        });
        if !event.is_recognized() {
            tracing::debug!("event record has no known keys");
        }
        event
    }

    /// JSON Lines の1行を取り込む
    ///
    /// JSONとして読めない行はストリームの破損としてエラーにする。
    pub fn from_json_line(line: &str) -> Result<Self, AgentError> {
        let value: Value = serde_json::from_str(line)
            .map_err(|e| AgentError::StreamError(format!("invalid event record: {}", e)))?;
        Ok(Self::from_value(value))
    }

    /// 既知のキーを1つでも持っているか
    pub fn is_recognized(&self) -> bool {
        self != &StreamEvent::default()
    }
}

/// ライフサイクル分類（相互排他）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle<'a> {
    Initialized,
    CycleStarted,
    MessageCreated(&'a str),
    CycleCompleted,
    ForceStopped(Option<&'a str>),
}

impl Lifecycle<'_> {
    /// 進捗行のテキスト
    pub fn line(&self) -> String {
        match self {
            Lifecycle::Initialized => "🔄 Event loop initialized".to_string(),
            Lifecycle::CycleStarted => "▶️ Event loop cycle starting".to_string(),
            Lifecycle::MessageCreated(role) => format!("📬 New message created: {}", role),
            Lifecycle::CycleCompleted => "✅ Cycle completed".to_string(),
            Lifecycle::ForceStopped(reason) => format!(
                "🛑 Event loop force-stopped: {}",
                reason.unwrap_or("unknown reason")
            ),
        }
    }
}

type LifecycleRule = for<'a> fn(&'a StreamEvent) -> Option<Lifecycle<'a>>;

/// 優先順位順のライフサイクル判定表
const LIFECYCLE_RULES: [LifecycleRule; 5] = [
    initialized,
    cycle_started,
    message_created,
    cycle_completed,
    force_stopped,
];

fn initialized(event: &StreamEvent) -> Option<Lifecycle<'_>> {
    is_set(event.init_event_loop).then_some(Lifecycle::Initialized)
}

fn cycle_started(event: &StreamEvent) -> Option<Lifecycle<'_>> {
    is_set(event.start_event_loop).then_some(Lifecycle::CycleStarted)
}

fn message_created(event: &StreamEvent) -> Option<Lifecycle<'_>> {
    event
        .message
        .as_ref()
        .and_then(|message| message.role.as_deref())
        .map(Lifecycle::MessageCreated)
}

fn cycle_completed(event: &StreamEvent) -> Option<Lifecycle<'_>> {
    is_set(event.complete).then_some(Lifecycle::CycleCompleted)
}

fn force_stopped(event: &StreamEvent) -> Option<Lifecycle<'_>> {
    is_set(event.force_stop).then(|| Lifecycle::ForceStopped(event.force_stop_reason.as_deref()))
}

/// 型の合わない値は `None` として読む
fn lenient<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned,
{
    let value = Value::deserialize(deserializer)?;
    match serde_json::from_value(value) {
        Ok(parsed) => Ok(Some(parsed)),
        Err(e) => {
            tracing::debug!(error = %e, "ignoring malformed event field");
            Ok(None)
        }
    }
}

fn is_set(flag: Option<bool>) -> bool {
    flag == Some(true)
}

/// ライフサイクル分類を行う
///
/// init → start → message → complete → force_stop の順に評価し、最初に一致したものだけを返す。
/// `role` を持たない `message` は一致しなかった扱いで、次の規則に進む。
pub fn classify_lifecycle(event: &StreamEvent) -> Option<Lifecycle<'_>> {
    LIFECYCLE_RULES.iter().find_map(|rule| rule(event))
}

/// 使用中のツール名（存在し、かつ空でない場合のみ）
pub fn tool_in_use(event: &StreamEvent) -> Option<&str> {
    event
        .current_tool_use
        .as_ref()
        .and_then(|tool| tool.name.as_deref())
        .filter(|name| !name.is_empty())
}
