//! 会話履歴を持つチャットセッション
//!
//! ランタイムは履歴を持たないため、対話型の利用ではこのセッションが履歴を管理する。
//! 長期記憶を付けた場合は、過去の会話の読み込みと保存もここで行う。

use crate::agent::AgentError;
use crate::memory::{MEMORY_GUIDANCE, SessionMemory};
use crate::runtime::{ChatTurn, InvocationRequest, Role, StageConfig};

#[derive(Clone, Default)]
pub struct ChatSession {
    stage: StageConfig,
    history: Vec<ChatTurn>,
    memory: Option<SessionMemory>,
    /// 記憶を付け加える前のユーザー発話（保存用）
    pending_user_text: Option<String>,
    restored: bool,
}

impl ChatSession {
    pub fn new(stage: StageConfig) -> Self {
        Self {
            stage,
            history: Vec::new(),
            memory: None,
            pending_user_text: None,
            restored: false,
        }
    }

    pub fn with_memory(mut self, memory: SessionMemory) -> Self {
        self.memory = Some(memory);
        self
    }

    pub fn history(&self) -> &[ChatTurn] {
        &self.history
    }

    /// 長期記憶から直近の会話を読み込む
    ///
    /// # Returns
    /// 読み込んだターン（メッセージ）の数。記憶がない場合は0
    ///
    /// # Note
    /// 過去の会話があった場合は、記憶の扱いに関する注意書きをシステムプロンプトに加える。
    /// 読み込みは最初の1回だけ行い、失敗しても再試行しない。
    pub async fn restore(&mut self) -> Result<usize, AgentError> {
        if self.restored {
            return Ok(0);
        }
        self.restored = true;

        let Some(memory) = &self.memory else {
            return Ok(0);
        };

        let turns = memory.recent_turns().await?;
        if turns.is_empty() {
            return Ok(0);
        }

        let system_prompt = match self.stage.system_prompt.take() {
            Some(prompt) => format!("{}\n{}", prompt, MEMORY_GUIDANCE),
            None => MEMORY_GUIDANCE.to_string(),
        };
        self.stage.system_prompt = Some(system_prompt);
        self.history = turns;
        Ok(self.history.len())
    }

    /// ユーザーの発話を履歴に追加し、ランタイムへの要求を作る
    ///
    /// # Note
    /// この関数はメッセージ履歴を更新します。呼び出しが失敗した場合、
    /// 呼び出し元は `rollback_last_user_turn()` を呼び出して履歴を元に戻すことができます。
    pub fn begin_turn(&mut self, message: &str) -> InvocationRequest {
        let request = InvocationRequest::new(message, self.stage.clone())
            .with_history(self.history.clone());
        self.history.push(ChatTurn::user(message));
        request
    }

    /// 長期記憶の嗜好と事実を付け加えてから `begin_turn` する
    ///
    /// 記憶の検索に失敗した場合は履歴を変更せずにエラーを返す。
    pub async fn prepare_turn(&mut self, message: &str) -> Result<InvocationRequest, AgentError> {
        let Some(memory) = &self.memory else {
            return Ok(self.begin_turn(message));
        };

        let augmented = memory.augment(message).await?;
        self.pending_user_text = Some(message.to_string());
        Ok(self.begin_turn(&augmented))
    }

    /// アシスタントの応答を履歴に追加する
    pub fn complete_turn(&mut self, response_text: impl Into<String>) {
        self.history.push(ChatTurn::assistant(response_text));
    }

    /// 応答を履歴に追加し、長期記憶があれば1往復分を保存する
    pub async fn finish_turn(&mut self, response_text: &str) -> Result<(), AgentError> {
        self.complete_turn(response_text);

        match (&self.memory, self.pending_user_text.take()) {
            (Some(memory), Some(user_text)) => memory.save_exchange(&user_text, response_text).await,
            _ => Ok(()),
        }
    }

    /// 最後に追加されたユーザーの発話を履歴から削除する
    ///
    /// # Returns
    /// * `true` - ユーザーの発話が削除された
    /// * `false` - 最後の発話がユーザーのものでないため、何も削除されなかった
    pub fn rollback_last_user_turn(&mut self) -> bool {
        self.pending_user_text = None;

        if let Some(last_turn) = self.history.last()
            && last_turn.role == Role::User
        {
            self.history.pop();
            true
        } else {
            false
        }
    }

    pub fn clear(&mut self) {
        self.history.clear();
        self.pending_user_text = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;
    use async_trait::async_trait;
    use std::sync::{Arc, Mutex};

    /// メモリ上の記憶ストア
    #[derive(Default)]
    struct FakeMemory {
        turns: Vec<ChatTurn>,
        records: Vec<(String, String)>,
        saved: Mutex<Vec<(String, String, Vec<ChatTurn>)>>,
        fail_search: bool,
    }

    #[async_trait]
    impl MemoryStore for FakeMemory {
        async fn recent_turns(
            &self,
            _actor_id: &str,
            _session_id: &str,
            k: usize,
        ) -> Result<Vec<ChatTurn>, AgentError> {
            Ok(crate::memory::last_k_turns(self.turns.clone(), k))
        }

        async fn search(&self, namespace: &str, _query: &str, top_k: i32) -> Result<Vec<String>, AgentError> {
            if self.fail_search {
                return Err(AgentError::MemoryError("throttled".to_string()));
            }
            Ok(self
                .records
                .iter()
                .filter(|(ns, _)| ns == namespace)
                .map(|(_, text)| text.clone())
                .take(top_k as usize)
                .collect())
        }

        async fn save(&self, actor_id: &str, session_id: &str, messages: &[ChatTurn]) -> Result<(), AgentError> {
            self.saved.lock().unwrap().push((
                actor_id.to_string(),
                session_id.to_string(),
                messages.to_vec(),
            ));
            Ok(())
        }
    }

    fn session_with(store: Arc<FakeMemory>) -> ChatSession {
        ChatSession::new(StageConfig::new("chat"))
            .with_memory(SessionMemory::new(store, "customer_1", "session-1"))
    }

    #[test]
    fn test_begin_turn_sends_previous_history_only() {
        let mut session = ChatSession::new(StageConfig::new("chat"));
        let first = session.begin_turn("こんにちは");
        assert!(first.history.is_empty());
        assert_eq!(first.message, "こんにちは");
        session.complete_turn("こんにちは！何かお手伝いできますか？");

        let second = session.begin_turn("天気は？");
        assert_eq!(second.history.len(), 2);
        assert_eq!(second.history[1].role, Role::Assistant);
        assert_eq!(session.history().len(), 3);
    }

    #[test]
    fn test_rollback_only_removes_user_turn() {
        let mut session = ChatSession::default();
        assert!(!session.rollback_last_user_turn());

        session.begin_turn("q1");
        assert!(session.rollback_last_user_turn());
        assert!(session.history().is_empty());

        session.begin_turn("q2");
        session.complete_turn("a2");
        assert!(!session.rollback_last_user_turn());
        assert_eq!(session.history().len(), 2);
    }

    #[tokio::test]
    async fn test_restore_loads_recent_turns_and_guidance() {
        let store = Arc::new(FakeMemory {
            turns: vec![
                ChatTurn::user("スマートフォンを買いたい"),
                ChatTurn::assistant("用途を教えてください"),
            ],
            ..Default::default()
        });
        let mut session = session_with(store);

        assert_eq!(session.restore().await.unwrap(), 2);
        let request = session.prepare_turn("充電器は付属しますか？").await.unwrap();
        assert_eq!(request.history.len(), 2);
        assert_eq!(request.history[0].text, "スマートフォンを買いたい");
        assert_eq!(request.stage.system_prompt.as_deref(), Some(MEMORY_GUIDANCE));
    }

    #[tokio::test]
    async fn test_restore_runs_once() {
        let store = Arc::new(FakeMemory {
            turns: vec![ChatTurn::user("q1"), ChatTurn::assistant("a1")],
            ..Default::default()
        });
        let mut session = session_with(store);

        assert_eq!(session.restore().await.unwrap(), 2);
        session.begin_turn("q2");
        session.complete_turn("a2");

        assert_eq!(session.restore().await.unwrap(), 0);
        assert_eq!(session.history().len(), 4);
    }

    #[tokio::test]
    async fn test_restore_without_past_turns_keeps_prompt() {
        let mut session = session_with(Arc::new(FakeMemory::default()));
        assert_eq!(session.restore().await.unwrap(), 0);

        let request = session.prepare_turn("q").await.unwrap();
        assert!(request.stage.system_prompt.is_none());
        assert_eq!(request.message, "q");
    }

    #[tokio::test]
    async fn test_prepare_turn_attaches_preferences_and_facts() {
        let store = Arc::new(FakeMemory {
            records: vec![
                ("support/user/customer_1/preferences".to_string(), "バッテリー持ちを重視".to_string()),
                ("support/user/customer_1/facts".to_string(), "注文番号は#1234".to_string()),
                ("support/user/other/facts".to_string(), "無関係".to_string()),
            ],
            ..Default::default()
        });
        let mut session = session_with(store);

        let request = session.prepare_turn("おすすめは？").await.unwrap();
        assert_eq!(
            request.message,
            "おすすめは？\n\nこれらはユーザーの嗜好です:\n\nバッテリー持ちを重視\n\n\n\nこれらはユーザーの事実です:\n\n注文番号は#1234\n\n"
        );
        assert!(!request.message.contains("無関係"));
        assert_eq!(session.history().last().unwrap().text, request.message);
    }

    #[tokio::test]
    async fn test_finish_turn_saves_original_exchange() {
        let store = Arc::new(FakeMemory {
            records: vec![("support/user/customer_1/facts".to_string(), "黒色のカバーを購入".to_string())],
            ..Default::default()
        });
        let mut session = session_with(store.clone());

        session.prepare_turn("カバーの色は？").await.unwrap();
        session.finish_turn("黒色です").await.unwrap();

        let saved = store.saved.lock().unwrap();
        assert_eq!(saved.len(), 1);
        assert_eq!(saved[0].0, "customer_1");
        assert_eq!(saved[0].1, "session-1");
        assert_eq!(
            saved[0].2,
            vec![ChatTurn::user("カバーの色は？"), ChatTurn::assistant("黒色です")]
        );
    }

    #[tokio::test]
    async fn test_failed_turn_is_not_saved() {
        let store = Arc::new(FakeMemory::default());
        let mut session = session_with(store.clone());

        session.prepare_turn("q1").await.unwrap();
        assert!(session.rollback_last_user_turn());
        session.complete_turn("stray");
        session.finish_turn("a").await.unwrap();

        assert!(store.saved.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_memory_search_failure_leaves_history_untouched() {
        let store = Arc::new(FakeMemory {
            fail_search: true,
            ..Default::default()
        });
        let mut session = session_with(store);

        let result = session.prepare_turn("q").await;
        assert!(matches!(result, Err(AgentError::MemoryError(msg)) if msg == "throttled"));
        assert!(session.history().is_empty());
    }
}
