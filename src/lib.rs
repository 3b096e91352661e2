#![forbid(unsafe_code)]

//! Embeddable client for an external agent process.
//!
//! The agent speaks JSON-RPC 2.0 framed with `Content-Length` headers, over
//! either the stdio of a child process or a TCP socket. Traffic flows both
//! ways: the client issues requests, and the agent calls back into the client
//! for tool invocations, permission prompts and hooks.

pub mod config;
pub mod connection;
pub mod errors;
pub mod rpc;
pub mod session;
pub mod transport;

pub use config::ClientConfig;
pub use connection::{AgentClient, ConnectionState, PROTOCOL_VERSION};
pub use errors::{AppError, Result};
