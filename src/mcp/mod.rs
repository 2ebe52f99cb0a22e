// PRP Agent — MCP layer
// One child process per agent, JSON-RPC over framed stdio.

pub mod client;
pub mod transport;
pub mod types;
