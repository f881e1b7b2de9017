//! WebSocket / HTTP 中継サーバー
//!
//! `GET /ws` はクライアントのメッセージを受け取り、エージェントの進捗行をそのまま中継してから
//! 最終結果を返す。`POST /invocations` と `GET /ping` はエージェント実行環境と同じ形の入口。

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use agent::{
    AgentError, AgentRuntime, ChatSession, MemoryStore, ResponseAssembler, SessionMemory,
    StageConfig, StreamOutcome, parse_sections,
};
use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::sync::mpsc;

/// 空のプロンプトに対する応答
pub const EMPTY_PROMPT_MESSAGE: &str = "メッセージが空です。質問を送信してください。";

const SESSION_ID_MIN_CHARS: usize = 33;
const SESSION_ID_MAX_CHARS: usize = 64;
/// 使われていないセッションを保持する時間
const SESSION_IDLE_TIMEOUT: Duration = Duration::from_secs(30 * 60);
const LOCAL_ACTIONS: &str = "echo, uppercase, reverse, timestamp";
const PROGRESS_CHANNEL_CAPACITY: usize = 64;

type SharedSession = Arc<tokio::sync::Mutex<ChatSession>>;

struct SessionEntry {
    session: SharedSession,
    last_used: Instant,
}

/// サーバー全体の状態
pub struct RelayState {
    runtime: Arc<dyn AgentRuntime>,
    stage: StageConfig,
    memory: Option<(Arc<dyn MemoryStore>, String)>,
    idle_timeout: Duration,
    sessions: Mutex<HashMap<String, SessionEntry>>,
}

impl RelayState {
    pub fn new(runtime: Arc<dyn AgentRuntime>, stage: StageConfig) -> Self {
        Self {
            runtime,
            stage,
            memory: None,
            idle_timeout: SESSION_IDLE_TIMEOUT,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// セッションIDごとに長期記憶を使う
    pub fn with_memory(mut self, store: Arc<dyn MemoryStore>, actor_id: impl Into<String>) -> Self {
        self.memory = Some((store, actor_id.into()));
        self
    }

    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    fn new_session(&self, session_id: Option<&str>) -> ChatSession {
        let session = ChatSession::new(self.stage.clone());
        match (&self.memory, session_id) {
            (Some((store, actor_id)), Some(id)) => {
                session.with_memory(SessionMemory::new(store.clone(), actor_id.clone(), id))
            }
            _ => session,
        }
    }

    /// セッションを取得する（なければ作る）
    ///
    /// ついでに、誰も使っておらず一定時間アクセスのないセッションを捨てる。
    fn session(&self, session_id: &str) -> SharedSession {
        let mut sessions = self
            .sessions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let now = Instant::now();
        let before = sessions.len();
        sessions.retain(|id, entry| {
            id == session_id
                || Arc::strong_count(&entry.session) > 1
                || now.duration_since(entry.last_used) < self.idle_timeout
        });
        if sessions.len() < before {
            tracing::debug!(evicted = before - sessions.len(), "evicted idle sessions");
        }

        let entry = sessions
            .entry(session_id.to_string())
            .or_insert_with(|| SessionEntry {
                session: Arc::new(tokio::sync::Mutex::new(self.new_session(Some(session_id)))),
                last_used: now,
            });
        entry.last_used = now;
        entry.session.clone()
    }

    /// 切断されたクライアントのセッションを捨てる
    ///
    /// 他のリクエストが使用中のセッションは残す。
    ///
    /// # Returns
    /// 削除したセッションの数
    pub fn release_sessions<'a>(&self, session_ids: impl IntoIterator<Item = &'a str>) -> usize {
        let mut sessions = self
            .sessions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let mut released = 0;
        for id in session_ids {
            if sessions
                .get(id)
                .is_some_and(|entry| Arc::strong_count(&entry.session) == 1)
            {
                sessions.remove(id);
                released += 1;
            }
        }
        released
    }

    #[cfg(test)]
    fn session_count(&self) -> usize {
        self.sessions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    /// セッションの履歴付きでエージェントを1回呼び出す
    ///
    /// 同じセッションへの呼び出しは順番に処理する。失敗した場合はユーザーの発話を履歴から戻す。
    async fn converse<K>(
        &self,
        session_id: Option<&str>,
        prompt: &str,
        sink: &mut K,
    ) -> Result<StreamOutcome, AgentError>
    where
        K: agent::LineSink + ?Sized,
    {
        let session = match session_id {
            Some(id) => self.session(id),
            None => Arc::new(tokio::sync::Mutex::new(self.new_session(None))),
        };
        let mut session = session.lock().await;

        match session.restore().await {
            Ok(0) => {}
            Ok(turns) => tracing::info!(session_id, turns, "restored conversation from memory"),
            Err(e) => tracing::warn!(session_id, error = %e, "failed to restore conversation"),
        }

        let request = session.prepare_turn(prompt).await?;
        let result = match self.runtime.invoke(request).await {
            Ok(events) => {
                ResponseAssembler::with_label(&self.stage.name)
                    .process(events, sink)
                    .await
            }
            Err(e) => Err(e),
        };

        match &result {
            Ok(outcome) => {
                if let Err(e) = session.finish_turn(&outcome.transcript).await {
                    tracing::warn!(session_id, error = %e, "failed to save conversation");
                }
            }
            Err(_) => {
                session.rollback_last_user_turn();
            }
        }
        result
    }
}

pub fn router(state: Arc<RelayState>) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/invocations", post(invocations))
        .route("/ping", get(ping))
        .with_state(state)
}

pub async fn serve(addr: SocketAddr, state: Arc<RelayState>) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "relay server listening");
    axum::serve(listener, router(state)).await?;
    Ok(())
}

/// セッションIDを33〜64文字に揃える
///
/// 短い場合は `-{connection_id}` を付け、それでも足りなければ `0` で埋める。長い場合は切り詰める。
pub fn normalize_session_id(session_id: &str, connection_id: &str) -> String {
    let mut id = session_id.to_string();

    if id.chars().count() < SESSION_ID_MIN_CHARS {
        id = format!("{}-{}", id, connection_id)
            .chars()
            .take(SESSION_ID_MAX_CHARS)
            .collect();
    }

    let len = id.chars().count();
    if len < SESSION_ID_MIN_CHARS {
        id.extend(std::iter::repeat_n('0', SESSION_ID_MIN_CHARS - len));
    } else if len > SESSION_ID_MAX_CHARS {
        id = id.chars().take(SESSION_ID_MAX_CHARS).collect();
    }
    id
}

/// クライアントからのメッセージ
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ClientMessage {
    action: Option<String>,
    #[serde(default)]
    data: Value,
    prompt: Option<String>,
    session_id: Option<String>,
}

impl ClientMessage {
    /// `prompt`、なければ `data.message`
    fn prompt(&self) -> String {
        self.prompt
            .clone()
            .or_else(|| {
                self.data
                    .get("message")
                    .and_then(Value::as_str)
                    .map(str::to_string)
            })
            .unwrap_or_default()
    }

    /// 正規化したセッションID（指定がなければ接続ID）
    fn session_id(&self, connection_id: &str) -> String {
        normalize_session_id(
            self.session_id.as_deref().unwrap_or(connection_id),
            connection_id,
        )
    }

    /// エージェントを呼び出すメッセージかどうか
    fn is_invocation(&self) -> bool {
        matches!(self.action.as_deref(), None | Some("invoke"))
    }
}

fn iso_timestamp() -> String {
    chrono::Utc::now()
        .format("%Y-%m-%dT%H:%M:%S%.6f")
        .to_string()
}

/// サーバー側だけで完結するアクション
fn local_action(action: &str, data: &Value, connection_id: &str) -> Value {
    let text = data.get("text").and_then(Value::as_str).unwrap_or_default();

    let mut result = match action {
        "echo" => json!({
            "action": "echo",
            "status": "success",
            "message": "Message echoed",
            "result": data,
        }),
        "uppercase" => json!({
            "action": "uppercase",
            "status": "success",
            "message": "Text converted to uppercase",
            "result": text.to_uppercase(),
        }),
        "reverse" => json!({
            "action": "reverse",
            "status": "success",
            "message": "Text reversed",
            "result": text.chars().rev().collect::<String>(),
        }),
        "timestamp" => {
            let now = chrono::Utc::now();
            json!({
                "action": "timestamp",
                "status": "success",
                "message": "Current timestamp",
                "result": {
                    "iso": iso_timestamp(),
                    "unix": now.timestamp(),
                },
            })
        }
        other => json!({
            "action": other,
            "status": "unknown_action",
            "message": format!("Unknown action: {}. Available actions: {}", other, LOCAL_ACTIONS),
            "receivedData": data,
        }),
    };

    if let Value::Object(map) = &mut result {
        map.insert("processedAt".to_string(), json!(iso_timestamp()));
        map.insert("connectionId".to_string(), json!(connection_id));
    }
    result
}

fn progress_message(line: &str) -> Value {
    json!({"action": "progress", "data": {"line": line}})
}

fn response_message(outcome: &StreamOutcome, session_id: &str) -> Value {
    let sections = parse_sections(&outcome.transcript);
    json!({
        "action": "response",
        "data": {
            "result": outcome.transcript,
            "thinking": sections.thinking,
            "answer": sections.answer,
            "sessionId": session_id,
        },
        "timestamp": chrono::Utc::now().timestamp_millis(),
    })
}

fn error_message(error: &str) -> Value {
    json!({
        "action": "error",
        "error": error,
        "timestamp": chrono::Utc::now().timestamp_millis(),
    })
}

async fn ws_handler(State(state): State<Arc<RelayState>>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(state, socket))
}

async fn handle_socket(state: Arc<RelayState>, socket: WebSocket) {
    let connection_id = uuid::Uuid::new_v4().simple().to_string();
    tracing::info!(%connection_id, "client connected");

    let (ws_sender, mut ws_receiver) = socket.split();
    let mut session_ids: HashSet<String> = HashSet::new();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Value>();

    let send_task = tokio::spawn(async move {
        let mut sender = ws_sender;
        while let Some(payload) = out_rx.recv().await {
            if sender.send(Message::Text(payload.to_string().into())).await.is_err() {
                break;
            }
        }
    });

    while let Some(msg) = ws_receiver.next().await {
        let text = match msg {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => continue,
        };

        let message: ClientMessage = match serde_json::from_str(text.as_str()) {
            Ok(message) => message,
            Err(e) => {
                let _ = out_tx.send(error_message(&format!("invalid message: {}", e)));
                continue;
            }
        };

        if !message.is_invocation() {
            let action = message.action.as_deref().unwrap_or_default();
            tracing::info!(%connection_id, action, "processing local action");
            let _ = out_tx.send(local_action(action, &message.data, &connection_id));
            continue;
        }

        session_ids.insert(message.session_id(&connection_id));
        let payload = relay_invocation(&state, &message, &connection_id, &out_tx).await;
        if out_tx.send(payload).is_err() {
            break;
        }
    }

    drop(out_tx);
    let _ = send_task.await;
    let released = state.release_sessions(session_ids.iter().map(String::as_str));
    tracing::info!(%connection_id, released, "client disconnected");
}

/// 進捗行を中継しながらエージェントを呼び出し、最終メッセージを返す
async fn relay_invocation(
    state: &RelayState,
    message: &ClientMessage,
    connection_id: &str,
    out_tx: &mpsc::UnboundedSender<Value>,
) -> Value {
    let session_id = message.session_id(connection_id);
    let prompt = message.prompt();

    if prompt.is_empty() {
        let outcome = StreamOutcome {
            transcript: EMPTY_PROMPT_MESSAGE.to_string(),
            event_logs: Vec::new(),
        };
        return response_message(&outcome, &session_id);
    }

    let (mut line_tx, mut line_rx) = mpsc::channel::<String>(PROGRESS_CHANNEL_CAPACITY);
    let forward = {
        let out_tx = out_tx.clone();
        tokio::spawn(async move {
            while let Some(line) = line_rx.recv().await {
                if out_tx.send(progress_message(&line)).is_err() {
                    break;
                }
            }
        })
    };

    let result = state
        .converse(Some(session_id.as_str()), &prompt, &mut line_tx)
        .await;
    drop(line_tx);
    let _ = forward.await;

    match result {
        Ok(outcome) => response_message(&outcome, &session_id),
        Err(e) => {
            tracing::error!(%session_id, error = %e, "invocation failed");
            error_message(&e.to_string())
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvocationPayload {
    #[serde(default)]
    pub prompt: String,
    pub session_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct InvocationResponse {
    pub result: String,
}

async fn invocations(
    State(state): State<Arc<RelayState>>,
    Json(payload): Json<InvocationPayload>,
) -> Json<InvocationResponse> {
    if payload.prompt.is_empty() {
        return Json(InvocationResponse {
            result: EMPTY_PROMPT_MESSAGE.to_string(),
        });
    }

    let mut discarded: Vec<String> = Vec::new();
    let result = match state
        .converse(payload.session_id.as_deref(), &payload.prompt, &mut discarded)
        .await
    {
        Ok(outcome) => outcome.transcript,
        Err(e) => {
            tracing::error!(error = %e, "invocation failed");
            format!("Error: {}", e)
        }
    };

    Json(InvocationResponse { result })
}

async fn ping() -> Json<Value> {
    Json(json!({"status": "Healthy"}))
}
