/// RAGパイプラインの結合テスト
mod common;

use std::sync::Arc;

use agent::{AgentError, RagPipeline, RetrievedSnippet};
use common::{FixedRetriever, Script, ScriptedRuntime, text_cycle};

#[tokio::test]
async fn test_ask_composes_prompt_and_parses_sections() {
    let retriever = Arc::new(FixedRetriever::new(vec![
        RetrievedSnippet::new("銀座線は浅草駅と渋谷駅を結ぶ。", Some(0.71)),
        RetrievedSnippet::new("丸ノ内線は池袋駅と荻窪駅を結ぶ。", Some(0.65)),
    ]));
    let runtime = Arc::new(ScriptedRuntime::new(vec![Script::Events(text_cycle(&[
        "<thinking>検索結果に",
        "2路線ある</thinking>\n",
        "<answer>銀座線と丸ノ内線です。</answer>",
    ]))]));
    let pipeline = RagPipeline::new(retriever.clone(), runtime.clone());

    let answer = pipeline.ask("東京都の地下鉄路線一覧を教えて。").await.unwrap();

    assert_eq!(answer.sections.thinking, "検索結果に2路線ある");
    assert_eq!(answer.sections.answer, "銀座線と丸ノ内線です。");
    assert_eq!(answer.context.len(), 2);

    let queries = retriever.queries.lock().unwrap().clone();
    assert_eq!(queries, vec!["東京都の地下鉄路線一覧を教えて。"]);

    let requests = runtime.requests();
    let request = &requests[0];
    assert_eq!(request.stage.temperature, Some(0.0));
    assert!(!request.stage.use_tools);
    assert!(request.message.contains("銀座線は浅草駅と渋谷駅を結ぶ。"));
    assert!(request.message.contains("<question>\n東京都の地下鉄路線一覧を教えて。\n</question>"));
}

#[tokio::test]
async fn test_answer_without_tags() {
    let retriever = Arc::new(FixedRetriever::new(Vec::new()));
    let runtime = Arc::new(ScriptedRuntime::new(vec![Script::Events(text_cycle(&[
        "分かりません。",
    ]))]));
    let pipeline = RagPipeline::new(retriever, runtime);

    let answer = pipeline.ask("火星の人口は？").await.unwrap();

    assert_eq!(answer.transcript, "分かりません。");
    assert_eq!(answer.sections.thinking, "");
    assert_eq!(answer.sections.answer, "");
    assert!(answer.context.is_empty());
}

#[tokio::test]
async fn test_stream_failure_propagates() {
    let retriever = Arc::new(FixedRetriever::new(Vec::new()));
    let runtime = Arc::new(ScriptedRuntime::new(vec![Script::FailAfter(
        Vec::new(),
        "model timeout".to_string(),
    )]));
    let pipeline = RagPipeline::new(retriever, runtime);

    let mut lines: Vec<String> = Vec::new();
    let result = pipeline.ask_with_sink("q", &mut lines).await;

    assert!(matches!(result, Err(AgentError::StreamError(_))));
    assert!(lines.is_empty());
}
