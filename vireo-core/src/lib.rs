pub mod agent;
pub mod config;
pub mod deadline;
pub mod jsonrpc;
pub mod mcp;
pub mod openai;
pub mod tools;
pub mod transport;
