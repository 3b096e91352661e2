//! Byte-stream transports carrying framed JSON-RPC messages.
//!
//! Both concrete transports share the [`Transport`] contract:
//!
//! - [`process`]: spawns the agent binary and talks over its stdin/stdout.
//! - [`socket`]: connects to an already-running agent over TCP.
//!
//! Each is a thin shell over [`StreamTransport`], which owns the receive
//! buffer and the read/write halves. A transport that fails is dead for good;
//! callers discard it and construct a new one.

pub mod process;
pub mod socket;
mod stream;

use std::future::Future;
use std::pin::Pin;

use bytes::Bytes;

use crate::rpc::message::Message;
use crate::Result;

pub use stream::{StreamTransport, READ_CHUNK_BYTES};

/// Boxed `Send` future returned by [`Transport`] methods.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Duplex channel that moves complete frames to and from the agent.
pub trait Transport: Send + Sync {
    /// Write one pre-encoded frame to the outbound channel.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::NotConnected`](crate::AppError::NotConnected) after
    /// [`close`](Transport::close), or
    /// [`AppError::ConnectionFailed`](crate::AppError::ConnectionFailed) when
    /// the write itself fails.
    fn send(&self, frame: Bytes) -> BoxFuture<'_, Result<()>>;

    /// Wait for the next complete message on the inbound channel.
    ///
    /// Only one caller may be waiting at a time; the receive loop is that
    /// caller.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::ConnectionClosed`](crate::AppError::ConnectionClosed)
    /// at EOF or after [`close`](Transport::close), and
    /// [`AppError::InvalidResponse`](crate::AppError::InvalidResponse) when a
    /// frame cannot be decoded.
    fn receive_next(&self) -> BoxFuture<'_, Result<Message>>;

    /// Release the underlying OS resource. Closing twice is a no-op.
    ///
    /// # Errors
    ///
    /// Returns an error only if tearing down the OS resource fails; the
    /// transport is closed regardless.
    fn close(&self) -> BoxFuture<'_, Result<()>>;

    /// Whether [`close`](Transport::close) has been called.
    fn is_closed(&self) -> bool;
}
