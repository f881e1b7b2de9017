//! ナレッジベース検索
//!
//! 検索サービスは「クエリ → スコア付きスニペットの順序付き列」を返す不透明な関数として扱う。

use async_trait::async_trait;
use aws_sdk_bedrockagentruntime::Client as AgentRuntimeClient;
use aws_sdk_bedrockagentruntime::error::DisplayErrorContext;
use aws_sdk_bedrockagentruntime::types::{
    KnowledgeBaseQuery, KnowledgeBaseRetrievalConfiguration, KnowledgeBaseRetrievalResult,
    KnowledgeBaseVectorSearchConfiguration, SearchType,
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::agent::AgentError;
use crate::document::document_to_json;

/// スニペット本文
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SnippetContent {
    pub text: String,
}

/// 検索結果1件（プロンプトにはこの形のままJSONで埋め込む）
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RetrievedSnippet {
    pub content: SnippetContent,
    pub score: Option<f64>,
    pub metadata: Option<Map<String, Value>>,
}

impl RetrievedSnippet {
    pub fn new(text: impl Into<String>, score: Option<f64>) -> Self {
        Self {
            content: SnippetContent { text: text.into() },
            score,
            metadata: None,
        }
    }
}

/// 検索サービスの抽象
#[async_trait]
pub trait Retriever: Send + Sync {
    /// クエリに関連するスニペットを関連度順に返す
    async fn retrieve(&self, query: &str) -> Result<Vec<RetrievedSnippet>, AgentError>;
}

/// Bedrock ナレッジベース（Agent Runtime `Retrieve` API）を使う検索クライアント
pub struct KnowledgeBaseRetriever {
    client: AgentRuntimeClient,
    knowledge_base_id: String,
    top_k: i32,
}

impl KnowledgeBaseRetriever {
    /// # Arguments
    /// * `sdk_config` - 共有のAWS設定（リージョン・認証情報）
    /// * `knowledge_base_id` - ナレッジベースID
    /// * `top_k` - 取得件数
    pub fn new(
        sdk_config: &aws_config::SdkConfig,
        knowledge_base_id: impl Into<String>,
        top_k: i32,
    ) -> Self {
        Self {
            client: AgentRuntimeClient::new(sdk_config),
            knowledge_base_id: knowledge_base_id.into(),
            top_k,
        }
    }
}

#[async_trait]
impl Retriever for KnowledgeBaseRetriever {
    async fn retrieve(&self, query: &str) -> Result<Vec<RetrievedSnippet>, AgentError> {
        let retrieval_configuration = KnowledgeBaseRetrievalConfiguration::builder()
            .vector_search_configuration(
                KnowledgeBaseVectorSearchConfiguration::builder()
                    .number_of_results(self.top_k)
                    .override_search_type(SearchType::Semantic)
                    .build(),
            )
            .build();

        let output = self
            .client
            .retrieve()
            .knowledge_base_id(&self.knowledge_base_id)
            .retrieval_query(KnowledgeBaseQuery::builder().text(query).build())
            .retrieval_configuration(retrieval_configuration)
            .send()
            .await
            .map_err(|e| AgentError::RetrievalError(DisplayErrorContext(&e).to_string()))?;

        let snippets: Vec<RetrievedSnippet> = output
            .retrieval_results
            .iter()
            .map(into_snippet)
            .collect();

        tracing::debug!(
            knowledge_base_id = %self.knowledge_base_id,
            results = snippets.len(),
            "retrieved context"
        );
        Ok(snippets)
    }
}

/// SDK の検索結果をアプリケーション側の形に変換する
fn into_snippet(result: &KnowledgeBaseRetrievalResult) -> RetrievedSnippet {
    RetrievedSnippet {
        content: SnippetContent {
            text: result
                .content()
                .map(|content| content.text().to_string())
                .unwrap_or_default(),
        },
        score: result.score(),
        metadata: result.metadata().map(|metadata| {
            metadata
                .iter()
                .map(|(key, value)| (key.clone(), document_to_json(value)))
                .collect()
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snippet_serializes_in_retrieve_shape() {
        let snippet = RetrievedSnippet::new("東京都の人口は約1400万人", Some(0.82));
        let value = serde_json::to_value(&snippet).unwrap();

        assert_eq!(value["content"]["text"], "東京都の人口は約1400万人");
        assert_eq!(value["score"], 0.82);
        assert!(value["metadata"].is_null());
    }

    #[test]
    fn test_into_snippet_converts_sdk_result() {
        use aws_sdk_bedrockagentruntime::types::RetrievalResultContent;
        use aws_smithy_types::Document;

        let result = KnowledgeBaseRetrievalResult::builder()
            .content(RetrievalResultContent::builder().text("銀座線は浅草と渋谷を結ぶ").build())
            .score(0.75)
            .metadata("x-amz-bedrock-kb-chunk-id", Document::String("chunk-1".to_string()))
            .build();

        let snippet = into_snippet(&result);
        assert_eq!(snippet.content.text, "銀座線は浅草と渋谷を結ぶ");
        assert_eq!(snippet.score, Some(0.75));
        assert_eq!(
            snippet.metadata.unwrap()["x-amz-bedrock-kb-chunk-id"],
            serde_json::json!("chunk-1")
        );

        let empty = into_snippet(&KnowledgeBaseRetrievalResult::builder().build());
        assert_eq!(empty, RetrievedSnippet::default());
    }
}
