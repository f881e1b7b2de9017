use std::sync::Arc;

use async_trait::async_trait;
use aws_config::meta::region::RegionProviderChain;
use aws_config::{self, BehaviorVersion, SdkConfig};
use aws_sdk_bedrockruntime::Client;
use aws_sdk_bedrockruntime::error::DisplayErrorContext;
use aws_sdk_bedrockruntime::types::{
    ContentBlock, ContentBlockDelta, ContentBlockStart, ConversationRole, ConverseStreamOutput,
    InferenceConfiguration, Message, StopReason, SystemContentBlock, Tool as BedrockTool,
    ToolConfiguration, ToolInputSchema, ToolResultBlock, ToolResultContentBlock, ToolResultStatus,
    ToolSpecification, ToolUseBlock,
};
use futures_util::stream;
use serde_json::{Map, Value};
use tokio::sync::mpsc;

use crate::config::AgentConfig;
use crate::document::json_to_document;
use crate::event::StreamEvent;
use crate::runtime::{AgentRuntime, ChatTurn, EventStream, InvocationRequest, Role};
use crate::tools::ToolRegistry;

/// イベントチャネルの容量
const EVENT_CHANNEL_CAPACITY: usize = 64;
/// リージョンが解決できない場合のフォールバック
const FALLBACK_REGION: &str = "us-east-1";

/// AgentClientのエラー型
#[derive(thiserror::Error, Debug)]
pub enum AgentError {
    #[error("AWS Bedrock API error: {0}")]
    BedrockError(String),

    #[error("Message building error: {0}")]
    MessageBuildError(String),

    #[error("AWS SDK error: {0}")]
    AwsSdkError(String),

    #[error("MCP error: {0}")]
    McpError(#[from] mcp::McpError),

    #[error("Tool error: {0}")]
    ToolError(#[from] crate::tools::ToolError),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Event stream error: {0}")]
    StreamError(String),

    #[error("Retrieval error: {0}")]
    RetrievalError(String),

    #[error("Memory error: {0}")]
    MemoryError(String),

    #[error("Output channel closed")]
    OutputClosed,
}

/// AWS SDK の共有設定を読み込む
///
/// # Arguments
/// * `profile` - 使用する AWS プロファイル名（オプション）。指定しない場合は環境の既定
/// * `region` - リージョン（オプション）。指定しない場合はプロファイルの設定またはus-east-1を使用
pub async fn load_sdk_config(profile: Option<&str>, region: Option<&str>) -> SdkConfig {
    let region_provider =
        RegionProviderChain::first_try(region.map(|r| aws_config::Region::new(r.to_string())))
            .or_default_provider()
            .or_else(aws_config::Region::new(FALLBACK_REGION));

    let mut loader = aws_config::defaults(BehaviorVersion::latest()).region(region_provider);
    if let Some(profile) = profile {
        loader = loader.profile_name(profile);
    }
    loader.load().await
}

/// Agent クライアント構造体
///
/// Bedrock ConverseStream をイベントループとして回し、ツール呼び出しを含む
/// 1回の呼び出しを `StreamEvent` の列として返す。会話履歴は保持しない
/// （呼び出し側が `InvocationRequest::history` で渡す）。
pub struct AgentClient {
    client: Client,
    model_id: String,
    temperature: f32,
    max_cycles: usize,
    tools: Arc<ToolRegistry>,
}

impl AgentClient {
    /// 新しい AgentClient を作成する
    ///
    /// # Arguments
    /// * `sdk_config` - 共有のAWS設定
    /// * `config` - モデルIDや既定の temperature
    pub fn new(sdk_config: &SdkConfig, config: &AgentConfig) -> Self {
        Self {
            client: Client::new(sdk_config),
            model_id: config.model_id.clone(),
            temperature: config.temperature,
            max_cycles: config.max_cycles.max(1),
            tools: Arc::new(ToolRegistry::new()),
        }
    }

    /// 使用するツールを設定する
    pub fn with_tools(mut self, tools: ToolRegistry) -> Self {
        self.tools = Arc::new(tools);
        self
    }

    /// 使用しているモデルIDを取得する
    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    pub fn tools(&self) -> &ToolRegistry {
        &self.tools
    }
}

#[async_trait]
impl AgentRuntime for AgentClient {
    async fn invoke(&self, request: InvocationRequest) -> Result<EventStream, AgentError> {
        let messages = build_messages(&request.history, &request.message)?;

        let tool_config = if request.stage.use_tools && !self.tools.is_empty() {
            Some(tool_configuration(&self.tools)?)
        } else {
            None
        };

        let stage = request.stage.name.clone();
        let event_loop = EventLoop {
            cycles: BedrockCycle {
                client: self.client.clone(),
                model_id: self.model_id.clone(),
                stage: stage.clone(),
                system: request
                    .stage
                    .system_prompt
                    .map(|prompt| vec![SystemContentBlock::Text(prompt)]),
                inference: InferenceConfiguration::builder()
                    .temperature(request.stage.temperature.unwrap_or(self.temperature))
                    .build(),
                tool_config,
            },
            stage,
            tools: self.tools.clone(),
            max_cycles: self.max_cycles,
        };

        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        tokio::spawn(event_loop.run(messages, tx));

        Ok(Box::pin(stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        })))
    }
}

type EventSender = mpsc::Sender<Result<StreamEvent, AgentError>>;

/// モデルを1サイクル分呼び出す
///
/// テキストとツール開始は到着した時点で `tx` に流し、まとめた結果を返す。
#[async_trait]
trait CycleSource: Send + Sync {
    async fn converse(&self, messages: &[Message], tx: &EventSender) -> Result<CycleOutput, AgentError>;
}

/// 1回の呼び出しに閉じたイベントループ
struct EventLoop<C> {
    cycles: C,
    stage: String,
    tools: Arc<ToolRegistry>,
    max_cycles: usize,
}

/// Bedrock ConverseStream による1サイクル
struct BedrockCycle {
    client: Client,
    model_id: String,
    stage: String,
    system: Option<Vec<SystemContentBlock>>,
    inference: InferenceConfiguration,
    tool_config: Option<ToolConfiguration>,
}

/// 1サイクル分のモデル出力
#[derive(Debug, Default)]
struct CycleOutput {
    text: String,
    tool_uses: Vec<PendingToolUse>,
    stop_reason: Option<StopReason>,
}

/// ストリームで組み立て中のツール呼び出し
#[derive(Debug)]
struct PendingToolUse {
    id: String,
    name: String,
    input: String,
}

impl PendingToolUse {
    /// 入力JSONを解釈する（空入力は空オブジェクト）
    fn parsed_input(&self) -> Result<Value, String> {
        if self.input.trim().is_empty() {
            return Ok(Value::Object(Map::new()));
        }
        serde_json::from_str(&self.input)
            .map_err(|e| format!("tool input is not valid JSON: {}", e))
    }
}

async fn emit(tx: &EventSender, event: StreamEvent) -> Result<(), AgentError> {
    tx.send(Ok(event))
        .await
        .map_err(|_| AgentError::OutputClosed)
}

impl<C: CycleSource> EventLoop<C> {
    async fn run(self, mut messages: Vec<Message>, tx: EventSender) {
        match self.drive(&mut messages, &tx).await {
            Ok(()) => tracing::debug!(stage = %self.stage, "event loop finished"),
            Err(AgentError::OutputClosed) => {
                tracing::debug!(stage = %self.stage, "event stream dropped by consumer");
            }
            Err(e) => {
                tracing::warn!(stage = %self.stage, error = %e, "event loop failed");
                let _ = tx.send(Err(e)).await;
            }
        }
    }

    async fn drive(&self, messages: &mut Vec<Message>, tx: &EventSender) -> Result<(), AgentError> {
        emit(tx, StreamEvent::init_event_loop()).await?;

        for cycle in 1..=self.max_cycles {
            emit(tx, StreamEvent::start_event_loop()).await?;
            tracing::debug!(stage = %self.stage, cycle, "event loop cycle");

            let output = self.cycles.converse(messages, tx).await?;
            messages.push(assistant_message(&output)?);
            emit(tx, StreamEvent::message(Role::Assistant.as_str())).await?;

            match output.stop_reason {
                Some(StopReason::ToolUse) if !output.tool_uses.is_empty() => {
                    let results = self.run_tools(&output.tool_uses).await?;
                    messages.push(
                        Message::builder()
                            .role(ConversationRole::User)
                            .set_content(Some(results))
                            .build()
                            .map_err(|e| {
                                AgentError::MessageBuildError(format!(
                                    "Failed to build tool result message: {}",
                                    e
                                ))
                            })?,
                    );
                    emit(tx, StreamEvent::message(Role::User.as_str())).await?;
                }
                Some(StopReason::EndTurn) | Some(StopReason::StopSequence) => {
                    emit(tx, StreamEvent::complete()).await?;
                    return Ok(());
                }
                other => {
                    let reason = other.map(|reason| reason.as_str().to_string());
                    emit(tx, StreamEvent::force_stop(reason)).await?;
                    return Ok(());
                }
            }
        }

        emit(
            tx,
            StreamEvent::force_stop(Some(format!(
                "event loop exceeded {} cycles",
                self.max_cycles
            ))),
        )
        .await
    }

    /// 要求されたツールを順に実行し、結果ブロックを作る
    ///
    /// ツールの失敗はエラー結果としてモデルに返す。
    async fn run_tools(&self, tool_uses: &[PendingToolUse]) -> Result<Vec<ContentBlock>, AgentError> {
        let mut results = Vec::with_capacity(tool_uses.len());

        for tool_use in tool_uses {
            let result = match tool_use.parsed_input() {
                Ok(input) => self
                    .tools
                    .execute(&tool_use.name, input)
                    .await
                    .map_err(|e| e.to_string()),
                Err(e) => Err(e),
            };

            let (text, status) = match result {
                Ok(text) => (text, ToolResultStatus::Success),
                Err(e) => {
                    tracing::warn!(tool = %tool_use.name, error = %e, "tool call failed");
                    (e, ToolResultStatus::Error)
                }
            };

            let block = ToolResultBlock::builder()
                .tool_use_id(&tool_use.id)
                .content(ToolResultContentBlock::Text(text))
                .status(status)
                .build()
                .map_err(|e| {
                    AgentError::MessageBuildError(format!("Failed to build tool result: {}", e))
                })?;
            results.push(ContentBlock::ToolResult(block));
        }

        Ok(results)
    }
}

#[async_trait]
impl CycleSource for BedrockCycle {
    async fn converse(&self, messages: &[Message], tx: &EventSender) -> Result<CycleOutput, AgentError> {
        // AWS SDK APIが所有権を要求するため会話履歴全体をクローンする
        let response = self
            .client
            .converse_stream()
            .model_id(&self.model_id)
            .set_messages(Some(messages.to_vec()))
            .set_system(self.system.clone())
            .inference_config(self.inference.clone())
            .set_tool_config(self.tool_config.clone())
            .send()
            .await
            .map_err(|e| AgentError::AwsSdkError(DisplayErrorContext(&e).to_string()))?;

        let mut stream = response.stream;
        let mut output = CycleOutput::default();
        let mut current_tool: Option<PendingToolUse> = None;

        while let Some(event) = stream
            .recv()
            .await
            .map_err(|e| AgentError::BedrockError(DisplayErrorContext(&e).to_string()))?
        {
            match event {
                ConverseStreamOutput::ContentBlockStart(start) => {
                    if let Some(ContentBlockStart::ToolUse(tool)) = start.start {
                        emit(tx, StreamEvent::tool_use(tool.name.clone())).await?;
                        current_tool = Some(PendingToolUse {
                            id: tool.tool_use_id,
                            name: tool.name,
                            input: String::new(),
                        });
                    }
                }
                ConverseStreamOutput::ContentBlockDelta(delta) => match delta.delta {
                    Some(ContentBlockDelta::Text(text)) => {
                        output.text.push_str(&text);
                        emit(tx, StreamEvent::data(text)).await?;
                    }
                    Some(ContentBlockDelta::ToolUse(tool_delta)) => {
                        if let Some(tool) = current_tool.as_mut() {
                            tool.input.push_str(&tool_delta.input);
                        }
                    }
                    _ => {}
                },
                ConverseStreamOutput::ContentBlockStop(_) => {
                    if let Some(tool) = current_tool.take() {
                        output.tool_uses.push(tool);
                    }
                }
                ConverseStreamOutput::MessageStop(stop) => {
                    output.stop_reason = Some(stop.stop_reason);
                }
                ConverseStreamOutput::Metadata(metadata) => {
                    if let Some(usage) = metadata.usage {
                        tracing::debug!(
                            stage = %self.stage,
                            input_tokens = usage.input_tokens,
                            output_tokens = usage.output_tokens,
                            "token usage"
                        );
                    }
                }
                _ => {}
            }
        }

        Ok(output)
    }
}

/// 履歴と今回のユーザーメッセージから会話を組み立てる
fn build_messages(history: &[ChatTurn], message: &str) -> Result<Vec<Message>, AgentError> {
    history
        .iter()
        .map(|turn| text_message(turn.role, turn.text.clone()))
        .chain(std::iter::once(text_message(Role::User, message.to_string())))
        .collect()
}

fn text_message(role: Role, text: String) -> Result<Message, AgentError> {
    let role = match role {
        Role::User => ConversationRole::User,
        Role::Assistant => ConversationRole::Assistant,
    };

    Message::builder()
        .role(role)
        .content(ContentBlock::Text(text))
        .build()
        .map_err(|e| AgentError::MessageBuildError(format!("Failed to build message: {}", e)))
}

/// 1サイクルの出力をアシスタントメッセージにする
fn assistant_message(output: &CycleOutput) -> Result<Message, AgentError> {
    let mut content = Vec::new();
    if !output.text.is_empty() || output.tool_uses.is_empty() {
        content.push(ContentBlock::Text(output.text.clone()));
    }

    for tool_use in &output.tool_uses {
        let input = tool_use
            .parsed_input()
            .unwrap_or_else(|_| Value::Object(Map::new()));
        let block = ToolUseBlock::builder()
            .tool_use_id(&tool_use.id)
            .name(&tool_use.name)
            .input(json_to_document(&input))
            .build()
            .map_err(|e| AgentError::MessageBuildError(format!("Failed to build tool use: {}", e)))?;
        content.push(ContentBlock::ToolUse(block));
    }

    Message::builder()
        .role(ConversationRole::Assistant)
        .set_content(Some(content))
        .build()
        .map_err(|e| AgentError::MessageBuildError(format!("Failed to build message: {}", e)))
}

/// 登録済みツールを Bedrock のツール設定にする
fn tool_configuration(tools: &ToolRegistry) -> Result<ToolConfiguration, AgentError> {
    let specs = tools
        .iter()
        .map(|tool| {
            ToolSpecification::builder()
                .name(tool.name())
                .description(tool.description())
                .input_schema(ToolInputSchema::Json(json_to_document(&tool.input_schema())))
                .build()
                .map(BedrockTool::ToolSpec)
                .map_err(|e| {
                    AgentError::MessageBuildError(format!(
                        "Failed to build tool spec for {}: {}",
                        tool.name(),
                        e
                    ))
                })
        })
        .collect::<Result<Vec<_>, _>>()?;

    ToolConfiguration::builder()
        .set_tools(Some(specs))
        .build()
        .map_err(|e| AgentError::MessageBuildError(format!("Failed to build tool config: {}", e)))
}
