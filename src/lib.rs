// PRP Agent — crate root
//
// A context-augmented conversational agent: every turn retrieves prior
// knowledge from a remote SQL store (through an MCP child process),
// injects it into the model prompt, generates a reply, and appends the
// turn to the conversation log. The same store holds Product
// Requirement Prompts the agent can list, create, analyze and update.
//
// Layer map (leaves first):
//   error, config, types      — taxonomy, settings, chat-neutral types
//   mcp                       — child process transport + JSON-RPC client
//   store                     — typed SQL surface over the tool bus
//   knowledge                 — retrieval, ingest, conversations, PRPs
//   llm                       — provider adapters + retry ownership
//   session, observability    — per-conversation state, event sink
//   agent                     — the turn state machine and intents

pub mod agent;
pub mod config;
pub mod error;
pub mod knowledge;
pub mod llm;
pub mod mcp;
pub mod observability;
pub mod session;
pub mod store;
pub mod types;

pub use agent::{Agent, TurnReply};
pub use config::Settings;
pub use error::{AgentError, AgentResult};
pub use knowledge::{KnowledgeRepository, LanguagePolicy};
pub use llm::LlmClient;
pub use mcp::client::{McpClient, ToolBus};
pub use store::StoreClient;
