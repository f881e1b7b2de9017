//! 長期記憶（Bedrock AgentCore Memory）
//!
//! 会話はセッションごとのイベントとして保存する。新しいセッションを始めるときは直近のターンを
//! 履歴に読み込み、ユーザーの発話には抽出済みの記憶（嗜好・事実）を付け加える。

use std::sync::Arc;
use std::time::SystemTime;

use async_trait::async_trait;
use aws_sdk_bedrockagentcore::Client as AgentCoreClient;
use aws_sdk_bedrockagentcore::error::DisplayErrorContext;
use aws_sdk_bedrockagentcore::types::{
    Content, Conversational, MemoryContent, PayloadType, Role as MemoryRole, SearchCriteria,
};
use aws_smithy_types::DateTime;

use crate::agent::AgentError;
use crate::runtime::{ChatTurn, Role};

/// セッション開始時に読み込むターン数
pub const RECENT_TURNS: usize = 5;
/// 名前空間ごとに取得する記憶の件数
pub const MEMORY_TOP_K: i32 = 3;
const LIST_EVENTS_MAX_RESULTS: i32 = 100;

/// 過去の会話を読み込んだときにシステムプロンプトへ加える注意書き
pub const MEMORY_GUIDANCE: &str = "\
ユーザーの嗜好や事実を直接回答しないでください。
ユーザーの嗜好や事実は、ユーザーをより理解するために厳密に使用してください。
また、この情報は古い可能性があることに注意してください。";

/// 発話に付け加える記憶の種類（名前空間の末尾, 見出し）
const MEMORY_KINDS: [(&str, &str); 2] = [
    ("preferences", "これらはユーザーの嗜好です:"),
    ("facts", "これらはユーザーの事実です:"),
];

/// 長期記憶サービスの抽象
#[async_trait]
pub trait MemoryStore: Send + Sync {
    /// セッションの直近 `k` ターンを古い順に返す
    async fn recent_turns(
        &self,
        actor_id: &str,
        session_id: &str,
        k: usize,
    ) -> Result<Vec<ChatTurn>, AgentError>;

    /// 名前空間から、クエリに関連する記憶の本文を関連度順に返す
    async fn search(&self, namespace: &str, query: &str, top_k: i32) -> Result<Vec<String>, AgentError>;

    /// メッセージを順番どおりに1つのイベントとして保存する
    async fn save(&self, actor_id: &str, session_id: &str, messages: &[ChatTurn]) -> Result<(), AgentError>;
}

/// 1つのセッションに紐づいた記憶
#[derive(Clone)]
pub struct SessionMemory {
    store: Arc<dyn MemoryStore>,
    actor_id: String,
    session_id: String,
}

impl SessionMemory {
    pub fn new(
        store: Arc<dyn MemoryStore>,
        actor_id: impl Into<String>,
        session_id: impl Into<String>,
    ) -> Self {
        Self {
            store,
            actor_id: actor_id.into(),
            session_id: session_id.into(),
        }
    }

    pub async fn recent_turns(&self) -> Result<Vec<ChatTurn>, AgentError> {
        self.store
            .recent_turns(&self.actor_id, &self.session_id, RECENT_TURNS)
            .await
    }

    /// ユーザーの発話に嗜好と事実を付け加える
    ///
    /// 記憶が見つからない種類は何も付け加えない。
    pub async fn augment(&self, message: &str) -> Result<String, AgentError> {
        let mut augmented = message.to_string();

        for (kind, header) in MEMORY_KINDS {
            let namespace = format!("support/user/{}/{}", self.actor_id, kind);
            let memories = self.store.search(&namespace, message, MEMORY_TOP_K).await?;
            if memories.is_empty() {
                continue;
            }
            tracing::debug!(%namespace, count = memories.len(), "attaching memories");
            augmented.push_str(&format!("\n\n{}\n\n{}\n\n", header, memories.join("\n")));
        }

        Ok(augmented)
    }

    /// 1往復分の会話を保存する
    pub async fn save_exchange(&self, user_text: &str, assistant_text: &str) -> Result<(), AgentError> {
        self.store
            .save(
                &self.actor_id,
                &self.session_id,
                &[ChatTurn::user(user_text), ChatTurn::assistant(assistant_text)],
            )
            .await
    }
}

/// 時系列順のメッセージをユーザー発話で始まるターンにまとめ、直近 `k` ターンを返す
///
/// 応答のないユーザー発話は捨てる。1ターン内に応答が複数ある場合は改行で連結する。
/// 戻り値は必ず user → assistant の交互になる。
pub fn last_k_turns(messages: Vec<ChatTurn>, k: usize) -> Vec<ChatTurn> {
    let mut turns: Vec<(String, Option<String>)> = Vec::new();

    for message in messages {
        match message.role {
            Role::User => turns.push((message.text, None)),
            Role::Assistant => {
                if let Some((_, reply)) = turns.last_mut() {
                    match reply {
                        Some(reply) => {
                            reply.push('\n');
                            reply.push_str(&message.text);
                        }
                        None => *reply = Some(message.text),
                    }
                }
            }
        }
    }

    let complete: Vec<(String, String)> = turns
        .into_iter()
        .filter_map(|(question, reply)| reply.map(|reply| (question, reply)))
        .collect();
    let skip = complete.len().saturating_sub(k);

    complete
        .into_iter()
        .skip(skip)
        .flat_map(|(question, reply)| [ChatTurn::user(question), ChatTurn::assistant(reply)])
        .collect()
}

/// AgentCore Memory を使う記憶ストア
pub struct AgentCoreMemory {
    client: AgentCoreClient,
    memory_id: String,
}

impl AgentCoreMemory {
    /// # Arguments
    /// * `sdk_config` - 共有のAWS設定
    /// * `memory_id` - Memory リソースID
    pub fn new(sdk_config: &aws_config::SdkConfig, memory_id: impl Into<String>) -> Self {
        Self {
            client: AgentCoreClient::new(sdk_config),
            memory_id: memory_id.into(),
        }
    }
}

fn memory_error<E>(context: &str, e: E) -> AgentError
where
    E: std::error::Error,
{
    AgentError::MemoryError(format!("{}: {}", context, DisplayErrorContext(&e)))
}

#[async_trait]
impl MemoryStore for AgentCoreMemory {
    async fn recent_turns(
        &self,
        actor_id: &str,
        session_id: &str,
        k: usize,
    ) -> Result<Vec<ChatTurn>, AgentError> {
        let output = self
            .client
            .list_events()
            .memory_id(&self.memory_id)
            .actor_id(actor_id)
            .session_id(session_id)
            .include_payloads(true)
            .max_results(LIST_EVENTS_MAX_RESULTS)
            .send()
            .await
            .map_err(|e| memory_error("failed to list memory events", e))?;

        let mut events = output.events;
        events.sort_by_key(|event| event.event_timestamp);

        let messages: Vec<ChatTurn> = events
            .iter()
            .flat_map(|event| event.payload.iter())
            .filter_map(conversational_turn)
            .collect();

        tracing::debug!(session_id, messages = messages.len(), "loaded memory events");
        Ok(last_k_turns(messages, k))
    }

    async fn search(&self, namespace: &str, query: &str, top_k: i32) -> Result<Vec<String>, AgentError> {
        let criteria = SearchCriteria::builder()
            .search_query(query)
            .top_k(top_k)
            .build()
            .map_err(|e| memory_error("invalid memory search", e))?;

        let output = self
            .client
            .retrieve_memory_records()
            .memory_id(&self.memory_id)
            .namespace(namespace)
            .search_criteria(criteria)
            .send()
            .await
            .map_err(|e| memory_error("failed to retrieve memory records", e))?;

        Ok(output
            .memory_record_summaries
            .into_iter()
            .filter_map(|record| match record.content {
                Some(MemoryContent::Text(text)) => Some(text),
                _ => None,
            })
            .collect())
    }

    async fn save(&self, actor_id: &str, session_id: &str, messages: &[ChatTurn]) -> Result<(), AgentError> {
        let payload = messages
            .iter()
            .map(|turn| {
                let role = match turn.role {
                    Role::User => MemoryRole::User,
                    Role::Assistant => MemoryRole::Assistant,
                };
                Conversational::builder()
                    .content(Content::Text(turn.text.clone()))
                    .role(role)
                    .build()
                    .map(PayloadType::Conversational)
                    .map_err(|e| memory_error("invalid memory payload", e))
            })
            .collect::<Result<Vec<_>, _>>()?;

        self.client
            .create_event()
            .memory_id(&self.memory_id)
            .actor_id(actor_id)
            .session_id(session_id)
            .event_timestamp(DateTime::from(SystemTime::now()))
            .set_payload(Some(payload))
            .send()
            .await
            .map_err(|e| memory_error("failed to save memory event", e))?;

        Ok(())
    }
}

/// 会話ペイロードを履歴のターンにする（テキスト以外と user/assistant 以外は読まない）
fn conversational_turn(payload: &PayloadType) -> Option<ChatTurn> {
    let PayloadType::Conversational(conversational) = payload else {
        return None;
    };
    let Some(Content::Text(text)) = &conversational.content else {
        return None;
    };

    match conversational.role {
        MemoryRole::User => Some(ChatTurn::user(text.clone())),
        MemoryRole::Assistant => Some(ChatTurn::assistant(text.clone())),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_last_k_turns_keeps_recent_complete_turns() {
        let messages = vec![
            ChatTurn::assistant("orphan"),
            ChatTurn::user("q1"),
            ChatTurn::assistant("a1"),
            ChatTurn::user("q2"),
            ChatTurn::user("q3"),
            ChatTurn::assistant("a3"),
            ChatTurn::assistant("a3-2"),
            ChatTurn::user("q4"),
            ChatTurn::assistant("a4"),
            ChatTurn::user("pending"),
        ];

        let history = last_k_turns(messages, 2);
        assert_eq!(
            history,
            vec![
                ChatTurn::user("q3"),
                ChatTurn::assistant("a3\na3-2"),
                ChatTurn::user("q4"),
                ChatTurn::assistant("a4"),
            ]
        );
    }

    #[test]
    fn test_last_k_turns_with_fewer_turns() {
        let messages = vec![ChatTurn::user("q1"), ChatTurn::assistant("a1")];
        assert_eq!(last_k_turns(messages.clone(), 5), messages);
        assert!(last_k_turns(Vec::new(), 5).is_empty());
    }

    #[test]
    fn test_conversational_turn() {
        let payload = PayloadType::Conversational(
            Conversational::builder()
                .content(Content::Text("こんにちは".to_string()))
                .role(MemoryRole::Assistant)
                .build()
                .unwrap(),
        );
        assert_eq!(conversational_turn(&payload), Some(ChatTurn::assistant("こんにちは")));

        let tool = PayloadType::Conversational(
            Conversational::builder()
                .content(Content::Text("{}".to_string()))
                .role(MemoryRole::Tool)
                .build()
                .unwrap(),
        );
        assert_eq!(conversational_turn(&tool), None);
    }
}
