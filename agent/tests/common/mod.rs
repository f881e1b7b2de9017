//! 結合テスト用の台本付きランタイムと検索
#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::Mutex;

use agent::{
    AgentError, AgentRuntime, EventStream, InvocationRequest, RetrievedSnippet, Retriever,
    StreamEvent,
};
use async_trait::async_trait;
use futures_util::stream;

/// 1回の呼び出しで流すイベント列
pub enum Script {
    Events(Vec<StreamEvent>),
    /// いくつかのイベントの後に失敗する
    FailAfter(Vec<StreamEvent>, String),
    /// 呼び出しの開始自体に失敗する
    RejectInvoke(String),
}

/// テキストチャンクを1サイクルで返すイベント列
pub fn text_cycle(chunks: &[&str]) -> Vec<StreamEvent> {
    let mut events = vec![StreamEvent::init_event_loop(), StreamEvent::start_event_loop()];
    events.extend(chunks.iter().map(|chunk| StreamEvent::data(*chunk)));
    events.push(StreamEvent::message("assistant"));
    events.push(StreamEvent::complete());
    events
}

/// 台本どおりにイベントを返すランタイム
#[derive(Default)]
pub struct ScriptedRuntime {
    scripts: Mutex<VecDeque<Script>>,
    requests: Mutex<Vec<InvocationRequest>>,
}

impl ScriptedRuntime {
    pub fn new(scripts: Vec<Script>) -> Self {
        Self {
            scripts: Mutex::new(scripts.into()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn requests(&self) -> Vec<InvocationRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl AgentRuntime for ScriptedRuntime {
    async fn invoke(&self, request: InvocationRequest) -> Result<EventStream, AgentError> {
        self.requests.lock().unwrap().push(request);

        let script = self
            .scripts
            .lock()
            .unwrap()
            .pop_front()
            .expect("台本より多く呼び出された");

        let items: Vec<Result<StreamEvent, AgentError>> = match script {
            Script::Events(events) => events.into_iter().map(Ok).collect(),
            Script::FailAfter(events, message) => events
                .into_iter()
                .map(Ok)
                .chain(std::iter::once(Err(AgentError::StreamError(message))))
                .collect(),
            Script::RejectInvoke(message) => return Err(AgentError::AwsSdkError(message)),
        };

        Ok(Box::pin(stream::iter(items)))
    }
}

/// 固定の検索結果を返す
pub struct FixedRetriever {
    pub snippets: Vec<RetrievedSnippet>,
    pub queries: Mutex<Vec<String>>,
}

impl FixedRetriever {
    pub fn new(snippets: Vec<RetrievedSnippet>) -> Self {
        Self {
            snippets,
            queries: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl Retriever for FixedRetriever {
    async fn retrieve(&self, query: &str) -> Result<Vec<RetrievedSnippet>, AgentError> {
        self.queries.lock().unwrap().push(query.to_string());
        Ok(self.snippets.clone())
    }
}
