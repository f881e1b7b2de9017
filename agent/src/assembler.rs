//! ストリーミングレスポンスの組み立て
//!
//! ランタイムから届くイベントを到着順に分類し、進捗行を出力しながら
//! テキストチャンクを蓄積する。ストリームが閉じたら全文（トランスクリプト）を
//! 結合し、最後にまとめブロックを1つ出力する。

use async_trait::async_trait;
use futures_util::{Stream, StreamExt};
use tokio::sync::mpsc;

use crate::agent::AgentError;
use crate::event::{StreamEvent, classify_lifecycle, tool_in_use};

/// プレビューに表示する文字数
pub const PREVIEW_CHARS: usize = 20;

const PREVIEW_ELLIPSIS: &str = "...";
const SUMMARY_RULE_WIDTH: usize = 50;
const SUMMARY_TITLE: &str = "📊 最終結果のまとめ";

/// 進捗行の出力先
///
/// 出力先が閉じられた場合は `AgentError::OutputClosed` を返すこと。
/// アセンブラはそれを受けて上流ストリームの読み取りを中止する。
#[async_trait]
pub trait LineSink: Send {
    async fn emit(&mut self, line: String) -> Result<(), AgentError>;
}

/// すべての行をメモリに溜める
#[async_trait]
impl LineSink for Vec<String> {
    async fn emit(&mut self, line: String) -> Result<(), AgentError> {
        self.push(line);
        Ok(())
    }
}

/// 呼び出し元へ逐次送る
#[async_trait]
impl LineSink for mpsc::Sender<String> {
    async fn emit(&mut self, line: String) -> Result<(), AgentError> {
        self.send(line).await.map_err(|_| AgentError::OutputClosed)
    }
}

/// 1回のストリーミング呼び出しの結果
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StreamOutcome {
    /// 全データチャンクを到着順に連結したもの
    pub transcript: String,
    /// 出力した進捗行（改行なし）
    pub event_logs: Vec<String>,
}

impl StreamOutcome {
    /// まとめブロック
    pub fn summary(&self) -> String {
        format_summary(&self.transcript)
    }
}

/// 1回の呼び出しに閉じた蓄積状態
#[derive(Debug, Default)]
struct Accumulator {
    accumulated_data: Vec<String>,
    event_logs: Vec<String>,
}

impl Accumulator {
    /// イベントを1件取り込み、出力すべき行を分類順に返す
    fn absorb(&mut self, event: StreamEvent) -> Vec<String> {
        if !event.is_recognized() {
            tracing::trace!("event matched no classification");
        }

        let mut lines = Vec::new();

        if let Some(lifecycle) = classify_lifecycle(&event) {
            lines.push(lifecycle.line());
        }

        if let Some(tool_name) = tool_in_use(&event) {
            lines.push(format!("🔧 Using tool: {}", tool_name));
        }

        if let Some(chunk) = event.data.filter(|chunk| !chunk.is_empty()) {
            lines.push(format!("📟 Text: {}", preview(&chunk)));
            self.accumulated_data.push(chunk);
        }

        self.event_logs.extend(lines.iter().cloned());
        lines
    }

    fn finish(self) -> StreamOutcome {
        StreamOutcome {
            transcript: self.accumulated_data.concat(),
            event_logs: self.event_logs,
        }
    }
}

/// ストリーミングレスポンスのアセンブラ
///
/// 状態は `process` 呼び出しごとに作り直されるため、同じインスタンスを
/// 複数段のワークフローで使い回してよい。
#[derive(Debug, Clone, Default)]
pub struct ResponseAssembler {
    label: Option<String>,
}

impl ResponseAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// ログに付けるラベル（ステージ名など）を指定する
    pub fn with_label(label: impl Into<String>) -> Self {
        Self {
            label: Some(label.into()),
        }
    }

    /// イベントストリームを最後まで処理する
    ///
    /// # Arguments
    /// * `events` - 上流のイベントストリーム（単一パス・到着順）
    /// * `sink` - 進捗行とまとめブロックの出力先
    ///
    /// # Returns
    /// * `Ok(StreamOutcome)` - トランスクリプトと進捗行
    /// * `Err(AgentError)` - 上流のエラー（そのまま伝播する）、または出力先が閉じられた場合
    ///
    /// # Note
    /// エラー時はまとめブロックを出力しない。途中までの内容を完了扱いにはしない。
    pub async fn process<S, K>(&self, events: S, sink: &mut K) -> Result<StreamOutcome, AgentError>
    where
        S: Stream<Item = Result<StreamEvent, AgentError>>,
        K: LineSink + ?Sized,
    {
        let label = self.label.as_deref().unwrap_or("stream");
        let mut events = std::pin::pin!(events);
        let mut accumulator = Accumulator::default();

        while let Some(event) = events.next().await {
            let event = event.inspect_err(|e| {
                tracing::warn!(stage = label, error = %e, "event stream failed");
            })?;

            for line in accumulator.absorb(event) {
                sink.emit(format!("{}\n", line)).await?;
            }
        }

        let outcome = accumulator.finish();
        tracing::debug!(
            stage = label,
            chars = outcome.transcript.chars().count(),
            lines = outcome.event_logs.len(),
            "stream closed"
        );

        sink.emit(outcome.summary()).await?;
        Ok(outcome)
    }

    /// 進捗行をすべてメモリに集めて処理する
    pub async fn collect<S>(&self, events: S) -> Result<(StreamOutcome, Vec<String>), AgentError>
    where
        S: Stream<Item = Result<StreamEvent, AgentError>>,
    {
        let mut lines = Vec::new();
        let outcome = self.process(events, &mut lines).await?;
        Ok((outcome, lines))
    }
}

/// データチャンクのプレビュー（先頭20文字、超えた場合は "..." を付ける）
pub fn preview(chunk: &str) -> String {
    let mut chars = chunk.chars();
    let head: String = chars.by_ref().take(PREVIEW_CHARS).collect();
    if chars.next().is_some() {
        format!("{}{}", head, PREVIEW_ELLIPSIS)
    } else {
        head
    }
}

/// トランスクリプトを埋め込んだまとめブロック
pub fn format_summary(transcript: &str) -> String {
    let rule = "=".repeat(SUMMARY_RULE_WIDTH);
    format!("\n\n{rule}\n{SUMMARY_TITLE}\n{rule}\n\n{transcript}\n\n{rule}\n")
}

/// まとめブロックから埋め込まれたトランスクリプトを取り出す
///
/// `format_summary` の出力以外が渡された場合は `None`。
pub fn summary_transcript(summary: &str) -> Option<&str> {
    let rule = "=".repeat(SUMMARY_RULE_WIDTH);
    let header = format!("\n\n{rule}\n{SUMMARY_TITLE}\n{rule}\n\n");
    let footer = format!("\n\n{rule}\n");
    summary.strip_prefix(header.as_str())?.strip_suffix(footer.as_str())
}
