pub mod agent;
pub mod assembler;
pub mod config;
pub mod document;
pub mod event;
pub mod memory;
pub mod prompt;
pub mod rag;
pub mod retrieval;
pub mod runtime;
pub mod sections;
pub mod session;
pub mod tools;
pub mod workflow;

pub use agent::{AgentClient, AgentError, load_sdk_config};
pub use assembler::{LineSink, ResponseAssembler, StreamOutcome};
pub use aws_config::SdkConfig;
pub use config::AgentConfig;
pub use event::StreamEvent;
pub use memory::{AgentCoreMemory, MemoryStore, SessionMemory};
pub use rag::{RagAnswer, RagPipeline};
pub use retrieval::{KnowledgeBaseRetriever, RetrievedSnippet, Retriever};
pub use runtime::{AgentRuntime, ChatTurn, EventStream, InvocationRequest, Role, StageConfig};
pub use sections::{ParsedSections, parse_sections};
pub use session::ChatSession;
pub use tools::{Tool, ToolError, ToolRegistry};
pub use workflow::Workflow;
