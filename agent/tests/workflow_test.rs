/// ワークフローの結合テスト
///
/// 台本付きランタイムで、ステージの順序と出力の順序を検証する。
mod common;

use std::sync::Arc;

use agent::assembler::{format_summary, summary_transcript};
use agent::workflow::PRIME_JUDGE_SYSTEM_PROMPT;
use agent::{AgentError, StageConfig, Workflow};
use common::{Script, ScriptedRuntime, text_cycle};

#[tokio::test]
async fn test_prime_workflow_runs_stages_in_order() {
    let runtime = Arc::new(ScriptedRuntime::new(vec![
        Script::Events(text_cycle(&["5", "3", "is prime"])),
        Script::Events(text_cycle(&["yes"])),
    ]));
    let workflow = Workflow::prime_judgement(runtime.clone());

    let mut lines: Vec<String> = Vec::new();
    let outcomes = workflow.run("3+50", &mut lines).await.unwrap();

    assert_eq!(outcomes.len(), 2);
    assert_eq!(outcomes[0].transcript, "53is prime");
    assert_eq!(outcomes[1].transcript, "yes");

    // 2段目は1段目のトランスクリプトを入力にし、判定用のシステムプロンプトを使う
    let requests = runtime.requests();
    assert_eq!(requests[0].message, "3+50");
    assert_eq!(requests[1].message, "53is prime");
    assert_eq!(
        requests[1].stage.system_prompt.as_deref(),
        Some(PRIME_JUDGE_SYSTEM_PROMPT)
    );
    assert!(requests[0].stage.system_prompt.is_none());
    assert!(requests.iter().all(|request| !request.stage.use_tools));

    // 1段目の行とまとめが、2段目のどの行よりも先に出る
    let first_summary = lines
        .iter()
        .position(|line| *line == format_summary("53is prime"))
        .unwrap();
    let first_stage2_line = lines
        .iter()
        .position(|line| line == "📟 Text: yes\n")
        .unwrap();
    assert!(first_summary < first_stage2_line);
    assert_eq!(lines[first_summary + 1], "🔄 Event loop initialized\n");

    assert_eq!(summary_transcript(lines.last().unwrap()), Some("yes"));
}

#[tokio::test]
async fn test_failed_stage_stops_workflow() {
    let runtime = Arc::new(ScriptedRuntime::new(vec![Script::FailAfter(
        vec![agent::StreamEvent::init_event_loop(), agent::StreamEvent::data("5")],
        "throttled".to_string(),
    )]));
    let workflow = Workflow::new(
        runtime.clone(),
        vec![StageConfig::new("first"), StageConfig::new("second")],
    );

    let mut lines: Vec<String> = Vec::new();
    let result = workflow.run("3+50", &mut lines).await;

    assert!(matches!(result, Err(AgentError::StreamError(msg)) if msg == "throttled"));
    assert_eq!(runtime.requests().len(), 1);
    assert_eq!(lines, vec!["🔄 Event loop initialized\n", "📟 Text: 5\n"]);
}

#[tokio::test]
async fn test_rejected_invoke_is_reported() {
    let runtime = Arc::new(ScriptedRuntime::new(vec![Script::RejectInvoke(
        "AccessDeniedException".to_string(),
    )]));
    let workflow = Workflow::prime_judgement(runtime);

    let mut lines: Vec<String> = Vec::new();
    let result = workflow.run("3+50", &mut lines).await;

    assert!(matches!(result, Err(AgentError::AwsSdkError(_))));
    assert!(lines.is_empty());
}

#[tokio::test]
async fn test_stage_lines_through_channel_sink() {
    let runtime = Arc::new(ScriptedRuntime::new(vec![
        Script::Events(text_cycle(&["42"])),
        Script::Events(text_cycle(&["no"])),
    ]));
    let workflow = Workflow::prime_judgement(runtime);

    let (mut tx, mut rx) = tokio::sync::mpsc::channel::<String>(64);
    let outcomes = workflow.run("6*7", &mut tx).await.unwrap();
    drop(tx);

    let mut received = Vec::new();
    while let Some(line) = rx.recv().await {
        received.push(line);
    }

    assert_eq!(outcomes.len(), 2);
    assert_eq!(
        received.iter().filter(|line| line.contains("📊 最終結果のまとめ")).count(),
        2
    );
}
