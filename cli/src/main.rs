mod relay;

use std::io::Write;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use agent::{
    AgentClient, AgentConfig, AgentCoreMemory, AgentError, AgentRuntime, ChatSession,
    InvocationRequest, KnowledgeBaseRetriever, LineSink, MemoryStore, RagPipeline,
    ResponseAssembler, SdkConfig, SessionMemory, StageConfig, StreamEvent, ToolRegistry, Workflow,
    load_sdk_config,
};
use anyhow::Context;
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use futures_util::stream;
use mcp::{McpClient, McpConfig};
use rustyline::DefaultEditor;
use rustyline::error::ReadlineError;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing_subscriber::EnvFilter;

// UI関連の設定
const USER_NAME: &str = "User";
const AGENT_NAME: &str = "Assistant";
const LOADING_ANIMATION_INTERVAL: u64 = 200;
const LOADING_ANIMATION_CHARACTER: &str = ".";
// ローディングアニメーションをクリアするためのスペース文字列
const CLEAR_LINE_SPACES: &str = "                                     "; // 37 spaces

// CLIの引数構造体定義
#[derive(Parser)]
#[command(name = "agent-relay")]
#[command(about = "Streaming AI agent relay on AWS Bedrock", long_about = None)]
struct Cli {
    /// 設定ファイル（省略時は .bedrock/agent.json または agent.json）
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// 使用するAWSプロファイル名
    #[arg(long, global = true)]
    aws_profile: Option<String>,

    /// リージョン (オプション: デフォルトはプロファイル設定またはus-east-1)
    #[arg(long, global = true)]
    region: Option<String>,

    /// ツールとして接続するMCPサーバー名（mcp.json に定義されたもの）
    #[arg(long, global = true)]
    mcp: Option<String>,

    /// MCP設定ファイル（省略時は .vscode/mcp.json または mcp.json）
    #[arg(long, global = true)]
    mcp_config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// 対話型のエージェントを起動します
    Chat {
        /// 長期記憶のセッションID（省略時は新しいセッション）
        #[arg(long)]
        session_id: Option<String>,
    },

    /// 1回だけ呼び出し、進捗とまとめを表示します
    Stream {
        #[arg(long)]
        prompt: String,

        /// システムプロンプト
        #[arg(long)]
        system: Option<String>,
    },

    /// 計算と素数判定の2段ワークフローを実行します
    Workflow {
        #[arg(long, default_value = "3+50は？")]
        prompt: String,
    },

    /// ナレッジベースを検索して回答します
    Ask {
        #[arg(long)]
        question: String,
    },

    /// WebSocket / HTTP 中継サーバーを起動します
    Serve {
        #[arg(long, default_value = "0.0.0.0:8080")]
        addr: SocketAddr,
    },

    /// 保存したイベント列（1行1JSON）を再生して表示します
    Replay {
        #[arg(long)]
        file: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 引数の解析
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    // AWSに接続しないコマンド
    if let Commands::Replay { file } = &cli.command {
        return run_replay(file).await;
    }

    let app = App::init(&cli).await?;

    let result = match cli.command {
        Commands::Chat { session_id } => run_chat(&app, session_id.as_deref()).await,
        Commands::Stream { prompt, system } => run_stream(&app, prompt, system).await,
        Commands::Workflow { prompt } => run_workflow(&app, &prompt).await,
        Commands::Ask { question } => run_ask(&app, &question).await,
        Commands::Serve { addr } => {
            let mut state = relay::RelayState::new(app.agent.clone(), StageConfig::new("relay"));
            if let Some(memory) = &app.memory {
                state = state.with_memory(memory.clone(), app.config.actor_id.clone());
            }
            relay::serve(addr, Arc::new(state)).await
        }
        Commands::Replay { .. } => Ok(()),
    };

    app.shutdown().await;
    result
}

/// コマンド共通の初期化済みリソース
struct App {
    config: AgentConfig,
    sdk_config: SdkConfig,
    agent: Arc<AgentClient>,
    memory: Option<Arc<dyn MemoryStore>>,
    mcp_client: Option<Arc<McpClient>>,
}

impl App {
    async fn init(cli: &Cli) -> anyhow::Result<Self> {
        let mut config = AgentConfig::load(cli.config.as_deref())?;
        if let Some(profile) = &cli.aws_profile {
            config.profile = Some(profile.clone());
        }
        if let Some(region) = &cli.region {
            config.region = Some(region.clone());
        }

        let sdk_config = load_sdk_config(config.profile.as_deref(), config.region.as_deref()).await;

        let mut tools = ToolRegistry::with_builtin_tools();
        let mcp_client = match &cli.mcp {
            Some(name) => {
                let client = Arc::new(connect_mcp(name, cli.mcp_config.as_deref()).await?);
                let count = tools.register_mcp(client.clone()).await?;
                println!(
                    "Connected to MCP server: {} ({} tools)",
                    client.server_name().unwrap_or_else(|| name.clone()),
                    count
                );
                Some(client)
            }
            None => None,
        };

        let agent = Arc::new(AgentClient::new(&sdk_config, &config).with_tools(tools));
        tracing::info!(model_id = agent.model_id(), tools = agent.tools().len(), "agent initialized");

        let memory = config.memory_id.as_deref().map(|memory_id| {
            tracing::info!(memory_id, actor_id = %config.actor_id, "long-term memory enabled");
            Arc::new(AgentCoreMemory::new(&sdk_config, memory_id)) as Arc<dyn MemoryStore>
        });

        Ok(Self {
            config,
            sdk_config,
            agent,
            memory,
            mcp_client,
        })
    }

    /// MCPサーバーとの接続を閉じる
    async fn shutdown(self) {
        let Self {
            agent, mcp_client, ..
        } = self;
        // ツール経由の参照を先に手放す
        drop(agent);

        if let Some(client) = mcp_client {
            match Arc::try_unwrap(client) {
                Ok(client) => {
                    if let Err(e) = client.disconnect().await {
                        tracing::warn!(error = %e, "failed to disconnect MCP server");
                    }
                }
                Err(_) => tracing::warn!("MCP client is still in use; skipping disconnect"),
            }
        }
    }
}

async fn connect_mcp(name: &str, path: Option<&Path>) -> anyhow::Result<McpClient> {
    let path = path
        .map(Path::to_path_buf)
        .or_else(McpConfig::default_path)
        .context("MCP config file not found (.vscode/mcp.json or mcp.json)")?;
    let config = McpConfig::load_from_file(&path)?;
    let server = config
        .get_server(name)
        .with_context(|| format!("MCP server '{}' is not defined in {}", name, path.display()))?;
    anyhow::ensure!(
        server.server_type == "stdio",
        "MCP server '{}' has unsupported type '{}' (only stdio is supported)",
        name,
        server.server_type
    );

    let workspace = std::env::current_dir()?;
    let client = McpClient::connect(name, &server.resolve(workspace.to_str())).await?;
    Ok(client)
}

/// 進捗行を標準出力に書き出す
///
/// ローディングアニメーションが動いている場合は、最初の行が届いた時点で止める。
struct ConsoleSink {
    loading: Option<JoinHandle<()>>,
}

impl ConsoleSink {
    fn new() -> Self {
        Self { loading: None }
    }

    fn with_loading() -> Self {
        Self {
            loading: Some(start_loading_animation()),
        }
    }

    fn stop_loading(&mut self) {
        if let Some(loading) = self.loading.take() {
            loading.abort();
            clear_loading_animation();
            println!();
        }
    }
}

#[async_trait]
impl LineSink for ConsoleSink {
    async fn emit(&mut self, line: String) -> Result<(), AgentError> {
        self.stop_loading();
        print!("{}", line);
        std::io::stdout()
            .flush()
            .map_err(|_| AgentError::OutputClosed)
    }
}

impl Drop for ConsoleSink {
    fn drop(&mut self) {
        if let Some(loading) = self.loading.take() {
            loading.abort();
        }
    }
}

/// CLI対話型エージェントを実行する
///
/// ユーザー入力の受け付け、ローディング表示、進捗の表示を担当する。
async fn run_chat(app: &App, session_id: Option<&str>) -> anyhow::Result<()> {
    let mut session = ChatSession::new(StageConfig::new("chat"));
    if let Some(memory) = &app.memory {
        // 指定されたIDは毎回同じ形に揃え、後から同じ会話を再開できるようにする
        let session_id = match session_id {
            Some(id) => relay::normalize_session_id(id, ""),
            None => relay::normalize_session_id("chat", &uuid::Uuid::new_v4().simple().to_string()),
        };
        println!("Memory session: {}", session_id);
        session = session.with_memory(SessionMemory::new(
            memory.clone(),
            app.config.actor_id.clone(),
            session_id,
        ));
        match session.restore().await {
            Ok(0) => {}
            Ok(turns) => println!("Restored {} messages from memory.", turns),
            Err(e) => tracing::warn!(error = %e, "failed to restore conversation"),
        }
    }

    // rustylineエディタの初期化（UI層）
    let mut rl = DefaultEditor::new()?;

    println!("Using Model: {}", app.agent.model_id());
    println!("+--------------------------------------------------+");
    println!("| AI Agent Started. Type 'exit' or 'quit' to stop. |");
    println!("| Type 'clear' to reset the conversation.          |");
    println!("+--------------------------------------------------+");

    loop {
        // ユーザー入力の受け付け
        let readline = rl.readline(&format!("{} > ", USER_NAME));
        match readline {
            Ok(line) => {
                let input = line.trim();

                // 空入力はスキップ
                if input.is_empty() {
                    continue;
                }

                // 終了コマンドの処理
                if input.eq_ignore_ascii_case("exit") || input.eq_ignore_ascii_case("quit") {
                    break;
                }

                // 会話履歴のリセット
                if input.eq_ignore_ascii_case("clear") {
                    session.clear();
                    println!("Conversation history cleared.");
                    continue;
                }

                // 履歴に追加
                let _ = rl.add_history_entry(input);

                // アシスタントの応答開始を表示
                print!("{} > ", AGENT_NAME);
                std::io::stdout().flush()?;

                let request = match session.prepare_turn(input).await {
                    Ok(request) => request,
                    Err(e) => {
                        println!("\n[Error] {}", e);
                        continue;
                    }
                };
                let mut sink = ConsoleSink::with_loading();
                match invoke_and_render(app.agent.as_ref(), request, &mut sink).await {
                    Ok(transcript) => {
                        if let Err(e) = session.finish_turn(&transcript).await {
                            tracing::warn!(error = %e, "failed to save conversation");
                        }
                    }
                    Err(e) => {
                        sink.stop_loading();
                        println!("\n[Error] Bedrock API call failed: {}", e);
                        // エラー時はユーザーメッセージを履歴から削除
                        session.rollback_last_user_turn();
                    }
                }
            }
            Err(ReadlineError::Interrupted) => {
                println!("CTRL-C");
                break;
            }
            Err(ReadlineError::Eof) => {
                println!("CTRL-D");
                break;
            }
            Err(err) => {
                println!("Error: {:?}", err);
                break;
            }
        }
    }

    Ok(())
}

async fn invoke_and_render(
    runtime: &dyn AgentRuntime,
    request: InvocationRequest,
    sink: &mut ConsoleSink,
) -> Result<String, AgentError> {
    let label = request.stage.name.clone();
    let events = runtime.invoke(request).await?;
    let outcome = ResponseAssembler::with_label(label).process(events, sink).await?;
    Ok(outcome.transcript)
}

async fn run_stream(app: &App, prompt: String, system: Option<String>) -> anyhow::Result<()> {
    let mut stage = StageConfig::new("stream");
    if let Some(system) = system {
        stage = stage.with_system_prompt(system);
    }

    let mut sink = ConsoleSink::new();
    invoke_and_render(app.agent.as_ref(), InvocationRequest::new(prompt, stage), &mut sink).await?;
    Ok(())
}

async fn run_workflow(app: &App, prompt: &str) -> anyhow::Result<()> {
    let workflow = Workflow::prime_judgement(app.agent.clone());
    let mut sink = ConsoleSink::new();
    workflow.run(prompt, &mut sink).await?;
    Ok(())
}

async fn run_ask(app: &App, question: &str) -> anyhow::Result<()> {
    let retriever = KnowledgeBaseRetriever::new(
        &app.sdk_config,
        app.config.require_knowledge_base_id()?,
        app.config.top_k,
    );
    let pipeline = RagPipeline::new(Arc::new(retriever), app.agent.clone());

    let mut sink = ConsoleSink::new();
    let answer = pipeline.ask_with_sink(question, &mut sink).await?;

    println!("\n=== 思考過程 ===\n{}", answer.sections.thinking);
    println!("\n=== 検索結果 ===");
    for (index, snippet) in answer.context.iter().enumerate() {
        let score = snippet
            .score
            .map(|score| format!("{:.3}", score))
            .unwrap_or_else(|| "-".to_string());
        println!("[{}] (score: {}) {}", index + 1, score, snippet.content.text);
    }
    println!("\n=== 回答 ===\n{}", answer.sections.answer);
    Ok(())
}

/// 1行1JSONのイベント記録を読む（空行は飛ばす）
///
/// 壊れた行は行番号付きのエラーとしてストリームに流す。
fn replay_events(content: &str) -> Vec<Result<StreamEvent, AgentError>> {
    content
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(index, line)| {
            StreamEvent::from_json_line(line).map_err(|e| {
                AgentError::StreamError(format!("line {}: {}", index + 1, e))
            })
        })
        .collect()
}

async fn run_replay(file: &Path) -> anyhow::Result<()> {
    let content = std::fs::read_to_string(file)
        .with_context(|| format!("failed to read event log {}", file.display()))?;
    let events = replay_events(&content);
    tracing::info!(file = %file.display(), records = events.len(), "replaying events");

    let mut sink = ConsoleSink::new();
    ResponseAssembler::with_label("replay")
        .process(stream::iter(events), &mut sink)
        .await?;
    Ok(())
}

/// ローディングアニメーションを開始する
fn start_loading_animation() -> JoinHandle<()> {
    tokio::spawn(async {
        loop {
            sleep(Duration::from_millis(LOADING_ANIMATION_INTERVAL)).await;
            print!("{}", LOADING_ANIMATION_CHARACTER);
            if std::io::stdout().flush().is_err() {
                break;
            }
        }
    })
}

/// ローディングアニメーションをクリアしてカーソルを戻す
///
/// 行頭に戻り、スペースで上書きしてから再度行頭に戻り、プロンプトを表示する。
fn clear_loading_animation() {
    print!(
        "\r{} > {}\r{} > ",
        AGENT_NAME, CLEAR_LINE_SPACES, AGENT_NAME
    );
    let _ = std::io::stdout().flush();
}
