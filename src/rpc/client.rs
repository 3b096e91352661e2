//! RPC correlation engine.
//!
//! [`RpcClient`] owns the id counter and the pending-request table for one
//! transport. A single receive loop (started with [`RpcClient::start`]) is
//! the only reader of the transport and demultiplexes every inbound message:
//!
//! | Inbound message | Action                                                 |
//! |-----------------|--------------------------------------------------------|
//! | `Response`      | resolve the matching pending request; unknown ids are dropped |
//! | `Notification`  | call the notification handler inline, in arrival order |
//! | `Request`       | spawn a task running the request handler, then reply   |
//!
//! When the loop ends (explicit [`stop`](RpcClient::stop) or a transport
//! error) every pending request fails with
//! [`AppError::ConnectionClosed`] and later requests fail with
//! [`AppError::NotConnected`].

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::rpc::codec::encode_frame;
use crate::rpc::message::{Message, RequestId, RpcError};
use crate::transport::{BoxFuture, Transport};
use crate::{AppError, Result};

/// Callback for inbound notifications: `(method, params)`.
///
/// Runs on the receive loop; it must not block. Forward to a channel for
/// anything slow.
pub type NotificationHandler = Arc<dyn Fn(String, Option<Value>) + Send + Sync>;

/// Callback for inbound requests: `(id, method, params)`.
///
/// The returned future runs on its own task; its output is sent back to the
/// peer as the `result` or `error` of the response.
pub type RequestHandler = Arc<
    dyn Fn(RequestId, String, Option<Value>) -> BoxFuture<'static, std::result::Result<Value, RpcError>>
        + Send
        + Sync,
>;

type PendingSender = oneshot::Sender<Result<Value>>;

/// Pending table plus the reason it was closed, guarded together so a
/// request can never be registered after the final flush.
#[derive(Default)]
struct PendingTable {
    entries: HashMap<RequestId, PendingSender>,
    closed: Option<String>,
}

struct Inner {
    transport: Arc<dyn Transport>,
    next_id: AtomicU64,
    pending: Mutex<PendingTable>,
    notification_handler: RwLock<Option<NotificationHandler>>,
    request_handler: RwLock<Option<RequestHandler>>,
    request_timeout: Option<Duration>,
    started: AtomicBool,
    stop: CancellationToken,
    exited: CancellationToken,
}

/// Correlation engine over one [`Transport`]. Cheap to clone.
#[derive(Clone)]
pub struct RpcClient {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for RpcClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcClient")
            .field("pending", &self.pending_count())
            .field("request_timeout", &self.inner.request_timeout)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl RpcClient {
    /// Create an engine over `transport`. No request deadline by default.
    #[must_use]
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self::with_request_timeout(transport, None)
    }

    /// Create an engine that applies `request_timeout` to every
    /// [`send_request`](Self::send_request).
    #[must_use]
    pub fn with_request_timeout(
        transport: Arc<dyn Transport>,
        request_timeout: Option<Duration>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                transport,
                next_id: AtomicU64::new(1),
                pending: Mutex::new(PendingTable::default()),
                notification_handler: RwLock::new(None),
                request_handler: RwLock::new(None),
                request_timeout,
                started: AtomicBool::new(false),
                stop: CancellationToken::new(),
                exited: CancellationToken::new(),
            }),
        }
    }

    /// Install the notification callback, replacing any previous one.
    pub fn set_notification_handler<F>(&self, handler: F)
    where
        F: Fn(String, Option<Value>) + Send + Sync + 'static,
    {
        *self
            .inner
            .notification_handler
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(handler));
    }

    /// Install the request callback, replacing any previous one.
    pub fn set_request_handler<F, Fut>(&self, handler: F)
    where
        F: Fn(RequestId, String, Option<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<Value, RpcError>> + Send + 'static,
    {
        let handler: RequestHandler = Arc::new(
            move |id, method, params| -> BoxFuture<'static, std::result::Result<Value, RpcError>> {
                Box::pin(handler(id, method, params))
            },
        );
        *self
            .inner
            .request_handler
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(handler);
    }

    /// Spawn the receive loop.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::InvalidState`] if the loop was already started;
    /// only one reader per transport is allowed.
    pub fn start(&self) -> Result<JoinHandle<()>> {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return Err(AppError::InvalidState(
                "receive loop already started for this transport".into(),
            ));
        }
        let inner = Arc::clone(&self.inner);
        Ok(tokio::spawn(run_receive_loop(inner)))
    }

    /// Stop the receive loop and fail every pending request.
    ///
    /// Does not close the transport. Idempotent.
    pub fn stop(&self) {
        self.inner.stop.cancel();
        if !self.inner.started.load(Ordering::SeqCst) {
            fail_all_pending(&self.inner, "client stopped");
            self.inner.exited.cancel();
        }
    }

    /// Resolves once the receive loop has exited and pending requests have
    /// been failed.
    pub async fn closed(&self) {
        self.inner.exited.cancelled().await;
    }

    /// Whether the receive loop has exited.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.exited.is_cancelled()
    }

    /// Number of requests awaiting a response.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.inner
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entries
            .len()
    }

    /// Send a request and wait for its response, using the engine's default
    /// deadline.
    ///
    /// # Errors
    ///
    /// - [`AppError::Rpc`] when the peer answers with an error object.
    /// - [`AppError::NotConnected`] once the receive loop has exited.
    /// - [`AppError::ConnectionClosed`] if the loop exits while waiting.
    /// - [`AppError::Timeout`] if the deadline elapses.
    /// - Any transport error from the send itself.
    pub async fn send_request(&self, method: &str, params: Option<Value>) -> Result<Value> {
        self.send_request_with_timeout(method, params, self.inner.request_timeout)
            .await
    }

    /// Send a request with an explicit deadline (`None` waits indefinitely).
    ///
    /// On expiry the pending entry is removed and the connection stays open;
    /// a late response is dropped as an unknown id.
    ///
    /// # Errors
    ///
    /// See [`send_request`](Self::send_request).
    pub async fn send_request_with_timeout(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Option<Duration>,
    ) -> Result<Value> {
        let id = self.allocate_id();
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.lock_pending();
            if let Some(reason) = &pending.closed {
                return Err(AppError::NotConnected(reason.clone()));
            }
            pending.entries.insert(id.clone(), tx);
        }
        let _guard = PendingGuard {
            inner: &self.inner,
            id: &id,
        };

        let frame = encode_frame(&Message::request(id.clone(), method, params).to_value())?;
        debug!(method, %id, "rpc: sending request");
        self.inner.transport.send(frame).await?;

        let outcome = match timeout {
            Some(limit) => tokio::time::timeout(limit, rx).await.map_err(|_| {
                AppError::Timeout(format!(
                    "no response to '{method}' (id {id}) within {limit:?}"
                ))
            })?,
            None => rx.await,
        };

        outcome.unwrap_or_else(|_| {
            Err(AppError::ConnectionClosed(format!(
                "request '{method}' (id {id}) abandoned"
            )))
        })
    }

    /// Send a notification. No id is allocated and no reply is awaited.
    ///
    /// # Errors
    ///
    /// [`AppError::NotConnected`] once the receive loop has exited, or any
    /// transport error from the send.
    pub async fn send_notification(&self, method: &str, params: Option<Value>) -> Result<()> {
        let closed = self.lock_pending().closed.clone();
        if let Some(reason) = closed {
            return Err(AppError::NotConnected(reason));
        }
        let frame = encode_frame(&Message::notification(method, params).to_value())?;
        debug!(method, "rpc: sending notification");
        self.inner.transport.send(frame).await
    }

    /// Answer a request issued by the peer.
    ///
    /// # Errors
    ///
    /// Any transport error from the send.
    pub async fn send_response(
        &self,
        id: RequestId,
        outcome: std::result::Result<Value, RpcError>,
    ) -> Result<()> {
        send_response_on(&self.inner, id, outcome).await
    }

    fn allocate_id(&self) -> RequestId {
        let n = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        RequestId::String(n.to_string())
    }

    fn lock_pending(&self) -> std::sync::MutexGuard<'_, PendingTable> {
        self.inner
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

// ── Pending entry cleanup ─────────────────────────────────────────────────────

/// Removes the pending entry when the caller's future finishes or is dropped.
///
/// Removal is a no-op if the receive loop already took the entry.
struct PendingGuard<'a> {
    inner: &'a Inner,
    id: &'a RequestId,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.inner
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entries
            .remove(self.id);
    }
}

// ── Receive loop ──────────────────────────────────────────────────────────────

async fn run_receive_loop(inner: Arc<Inner>) {
    debug!("rpc: receive loop started");

    let reason = loop {
        let next = tokio::select! {
            biased;

            () = inner.stop.cancelled() => break "client stopped".to_owned(),
            next = inner.transport.receive_next() => next,
        };

        match next {
            Ok(msg) => dispatch(&inner, msg),
            Err(e) => {
                warn!(error = %e, "rpc: receive loop stopping on transport error");
                break e.to_string();
            }
        }
    };

    fail_all_pending(&inner, &reason);
    inner.exited.cancel();
    debug!(%reason, "rpc: receive loop exited");
}

fn dispatch(inner: &Arc<Inner>, msg: Message) {
    match msg {
        Message::Response { id, outcome } => {
            let sender = inner
                .pending
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .entries
                .remove(&id);

            match sender {
                Some(tx) => {
                    // The caller may have given up already; that is fine.
                    let _ = tx.send(outcome.map_err(AppError::Rpc));
                }
                None => debug!(%id, "rpc: response for unknown id ignored"),
            }
        }

        Message::Notification { method, params } => {
            let handler = inner
                .notification_handler
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .clone();
            match handler {
                Some(handler) => handler(method, params),
                None => debug!(method, "rpc: notification dropped, no handler"),
            }
        }

        Message::Request { id, method, params } => {
            let handler = inner
                .request_handler
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .clone();
            let Some(handler) = handler else {
                warn!(method, %id, "rpc: inbound request dropped, no handler");
                return;
            };

            let inner = Arc::clone(inner);
            tokio::spawn(async move {
                debug!(method, %id, "rpc: handling inbound request");
                let outcome = handler(id.clone(), method.clone(), params).await;
                if let Err(e) = send_response_on(&inner, id.clone(), outcome).await {
                    warn!(method, %id, error = %e, "rpc: failed to send response");
                }
            });
        }
    }
}

async fn send_response_on(
    inner: &Inner,
    id: RequestId,
    outcome: std::result::Result<Value, RpcError>,
) -> Result<()> {
    let frame = encode_frame(&Message::response(id, outcome).to_value())?;
    inner.transport.send(frame).await
}

fn fail_all_pending(inner: &Inner, reason: &str) {
    let drained: Vec<PendingSender> = {
        let mut pending = inner
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if pending.closed.is_none() {
            pending.closed = Some(reason.to_owned());
        }
        pending.entries.drain().map(|(_, tx)| tx).collect()
    };

    if !drained.is_empty() {
        debug!(count = drained.len(), %reason, "rpc: failing pending requests");
    }
    for tx in drained {
        let _ = tx.send(Err(AppError::ConnectionClosed(reason.to_owned())));
    }
}
