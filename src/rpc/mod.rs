//! JSON-RPC 2.0 framing and request correlation.
//!
//! - `message`: the request/response/notification model and classification.
//! - `codec`: `Content-Length` frame encoding and incremental decoding.
//! - `client`: the correlation engine that pairs responses with pending
//!   requests and answers requests issued by the peer.

pub mod client;
pub mod codec;
pub mod message;

pub use client::{NotificationHandler, RequestHandler, RpcClient};
pub use message::{Message, RequestId, RpcError};
