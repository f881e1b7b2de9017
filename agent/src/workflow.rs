//! 複数ステージのワークフロー
//!
//! 各ステージは前のステージのトランスクリプトを入力として、厳密に順番に実行する。

use std::sync::Arc;

use crate::agent::AgentError;
use crate::assembler::{LineSink, ResponseAssembler, StreamOutcome};
use crate::runtime::{AgentRuntime, InvocationRequest, StageConfig};

/// 素数判定ステージのシステムプロンプト
pub const PRIME_JUDGE_SYSTEM_PROMPT: &str = "結果が素数か判定するエージェントです。";

pub struct Workflow {
    runtime: Arc<dyn AgentRuntime>,
    stages: Vec<StageConfig>,
}

impl Workflow {
    pub fn new(runtime: Arc<dyn AgentRuntime>, stages: Vec<StageConfig>) -> Self {
        Self { runtime, stages }
    }

    /// 計算してから、その結果が素数かを判定する2段構成
    pub fn prime_judgement(runtime: Arc<dyn AgentRuntime>) -> Self {
        Self::new(
            runtime,
            vec![
                StageConfig::new("calculate").without_tools(),
                StageConfig::new("judge")
                    .with_system_prompt(PRIME_JUDGE_SYSTEM_PROMPT)
                    .without_tools(),
            ],
        )
    }

    /// ワークフローを実行する
    ///
    /// # Arguments
    /// * `input` - 最初のステージへの入力
    /// * `sink` - すべてのステージの進捗行とまとめブロックの出力先
    ///
    /// # Returns
    /// 各ステージの結果（実行順）
    ///
    /// # Note
    /// 途中のステージが失敗した場合、以降のステージは実行しない。
    pub async fn run<K>(&self, input: &str, sink: &mut K) -> Result<Vec<StreamOutcome>, AgentError>
    where
        K: LineSink + ?Sized,
    {
        let mut outcomes: Vec<StreamOutcome> = Vec::with_capacity(self.stages.len());

        for stage in &self.stages {
            let message = outcomes
                .last()
                .map(|outcome| outcome.transcript.as_str())
                .unwrap_or(input);

            tracing::info!(stage = %stage.name, "starting workflow stage");
            let events = self
                .runtime
                .invoke(InvocationRequest::new(message, stage.clone()))
                .await?;

            let outcome = ResponseAssembler::with_label(&stage.name)
                .process(events, sink)
                .await?;
            outcomes.push(outcome);
        }

        Ok(outcomes)
    }
}
