//! 検索拡張生成（RAG）
//!
//! 検索 → プロンプト組み立て → 呼び出し → 集約 → タグ解析 の順に処理する。

use std::sync::Arc;

use serde::Serialize;

use crate::agent::AgentError;
use crate::assembler::{LineSink, ResponseAssembler};
use crate::prompt::compose_prompt;
use crate::retrieval::{RetrievedSnippet, Retriever};
use crate::runtime::{AgentRuntime, InvocationRequest, StageConfig};
use crate::sections::{ParsedSections, parse_sections};

/// RAGの回答
#[derive(Debug, Clone, Serialize)]
pub struct RagAnswer {
    pub sections: ParsedSections,
    /// モデル出力の全文
    pub transcript: String,
    /// プロンプトに使った検索結果
    pub context: Vec<RetrievedSnippet>,
}

pub struct RagPipeline {
    retriever: Arc<dyn Retriever>,
    runtime: Arc<dyn AgentRuntime>,
    stage: StageConfig,
}

impl RagPipeline {
    pub fn new(retriever: Arc<dyn Retriever>, runtime: Arc<dyn AgentRuntime>) -> Self {
        Self {
            retriever,
            runtime,
            stage: StageConfig::new("rag").with_temperature(0.0).without_tools(),
        }
    }

    /// 質問に回答する（進捗行は捨てる）
    pub async fn ask(&self, question: &str) -> Result<RagAnswer, AgentError> {
        let mut discarded: Vec<String> = Vec::new();
        self.ask_with_sink(question, &mut discarded).await
    }

    /// 質問に回答する
    ///
    /// # Arguments
    /// * `question` - ユーザーの質問
    /// * `sink` - 生成中の進捗行の出力先
    pub async fn ask_with_sink<K>(&self, question: &str, sink: &mut K) -> Result<RagAnswer, AgentError>
    where
        K: LineSink + ?Sized,
    {
        let context = self.retriever.retrieve(question).await?;
        tracing::info!(snippets = context.len(), "retrieved context for question");

        let prompt = compose_prompt(question, &context)?;
        let events = self
            .runtime
            .invoke(InvocationRequest::new(prompt, self.stage.clone()))
            .await?;

        let outcome = ResponseAssembler::with_label(&self.stage.name)
            .process(events, sink)
            .await?;

        Ok(RagAnswer {
            sections: parse_sections(&outcome.transcript),
            transcript: outcome.transcript,
            context,
        })
    }
}
