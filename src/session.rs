//! Session collaborator interface and server-request routing.
//!
//! The agent issues requests back to the client on behalf of a session
//! (tool invocations, permission prompts, user-input prompts, hooks). Each
//! request carries a `sessionId` in its params; [`route_request`] looks the
//! session up in the [`SessionRegistry`] and hands the params to the matching
//! [`SessionHandler`] method. Whatever the handler returns is sent back
//! verbatim as the response `result`.
//!
//! | Method               | Handler method                 |
//! |----------------------|--------------------------------|
//! | `tool.call`          | [`SessionHandler::handle_tool_call`] |
//! | `permission.request` | [`SessionHandler::handle_permission_request`] |
//! | `userInput.request`  | [`SessionHandler::handle_user_input`] |
//! | `hooks.invoke`       | [`SessionHandler::handle_hook`] |

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::rpc::message::RpcError;
use crate::transport::BoxFuture;
use crate::{AppError, Result};

/// Server-initiated tool invocation.
pub const TOOL_CALL: &str = "tool.call";
/// Server-initiated permission prompt.
pub const PERMISSION_REQUEST: &str = "permission.request";
/// Server-initiated request for user input.
pub const USER_INPUT_REQUEST: &str = "userInput.request";
/// Server-initiated hook invocation.
pub const HOOKS_INVOKE: &str = "hooks.invoke";
/// Notification carrying a session event.
pub const SESSION_EVENT: &str = "session.event";
/// Client request tearing a session down on the server.
pub const SESSION_DESTROY: &str = "session.destroy";

/// Per-session callbacks for server-initiated requests.
///
/// Every method receives the full request params (including `sessionId`).
/// Returning `Err` sends an internal-error response; returning
/// `Err(AppError::Rpc(e))` sends `e` unchanged.
pub trait SessionHandler: Send + Sync {
    /// Id the server assigned to this session.
    fn session_id(&self) -> &str;

    /// Run a tool on behalf of the agent.
    fn handle_tool_call(&self, params: Value) -> BoxFuture<'_, Result<Value>>;

    /// Decide a permission prompt.
    fn handle_permission_request(&self, params: Value) -> BoxFuture<'_, Result<Value>>;

    /// Answer a request for user input.
    fn handle_user_input(&self, params: Value) -> BoxFuture<'_, Result<Value>>;

    /// Run a lifecycle hook.
    fn handle_hook(&self, params: Value) -> BoxFuture<'_, Result<Value>>;

    /// Observe a `session.event` notification. Must not block.
    fn on_event(&self, _event: &Value) {}
}

/// Shared map of live sessions keyed by session id.
#[derive(Clone, Default)]
pub struct SessionRegistry {
    sessions: Arc<Mutex<HashMap<String, Arc<dyn SessionHandler>>>>,
}

impl std::fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRegistry").finish_non_exhaustive()
    }
}

impl SessionRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` under its session id, replacing any previous entry.
    pub async fn register(&self, handler: Arc<dyn SessionHandler>) {
        let session_id = handler.session_id().to_owned();
        self.sessions
            .lock()
            .await
            .insert(session_id.clone(), handler);
        debug!(%session_id, "session registry: session registered");
    }

    /// Remove a session. Removing an unknown id is a no-op.
    pub async fn deregister(&self, session_id: &str) -> Option<Arc<dyn SessionHandler>> {
        let removed = self.sessions.lock().await.remove(session_id);
        if removed.is_some() {
            debug!(session_id, "session registry: session deregistered");
        }
        removed
    }

    /// Look a session up by id.
    pub async fn get(&self, session_id: &str) -> Option<Arc<dyn SessionHandler>> {
        self.sessions.lock().await.get(session_id).cloned()
    }

    /// Ids of every registered session.
    pub async fn session_ids(&self) -> Vec<String> {
        self.sessions.lock().await.keys().cloned().collect()
    }

    /// Number of registered sessions.
    pub async fn len(&self) -> usize {
        self.sessions.lock().await.len()
    }

    /// Whether no sessions are registered.
    pub async fn is_empty(&self) -> bool {
        self.sessions.lock().await.is_empty()
    }

    /// Remove and return every session.
    pub async fn drain(&self) -> Vec<Arc<dyn SessionHandler>> {
        self.sessions
            .lock()
            .await
            .drain()
            .map(|(_, handler)| handler)
            .collect()
    }
}

/// Route a server-initiated request to the owning session's handler.
///
/// # Errors
///
/// - `-32601` for a method outside the routing table.
/// - `-32602` when `sessionId` is missing or names no registered session.
/// - `-32603` when the handler fails with anything but [`AppError::Rpc`].
pub async fn route_request(
    registry: &SessionRegistry,
    method: &str,
    params: Option<Value>,
) -> std::result::Result<Value, RpcError> {
    if ![TOOL_CALL, PERMISSION_REQUEST, USER_INPUT_REQUEST, HOOKS_INVOKE].contains(&method) {
        return Err(RpcError::method_not_found(method));
    }

    let params = params.unwrap_or(Value::Null);
    let Some(session_id) = session_id_of(&params) else {
        return Err(RpcError::invalid_params(format!(
            "{method}: params must include a string sessionId"
        )));
    };

    let Some(session) = registry.get(session_id).await else {
        warn!(method, session_id, "session registry: request for unknown session");
        return Err(RpcError::invalid_params(format!(
            "unknown session: {session_id}"
        )));
    };

    let outcome = match method {
        TOOL_CALL => session.handle_tool_call(params).await,
        PERMISSION_REQUEST => session.handle_permission_request(params).await,
        USER_INPUT_REQUEST => session.handle_user_input(params).await,
        _ => session.handle_hook(params).await,
    };

    outcome.map_err(|e| match e {
        AppError::Rpc(err) => err,
        other => RpcError::internal_error(other.to_string()),
    })
}

/// Deliver a `session.event` notification to the session it names.
///
/// Returns `false` if the notification is not a session event or the session
/// is not registered.
pub async fn route_event(registry: &SessionRegistry, method: &str, params: Option<&Value>) -> bool {
    if method != SESSION_EVENT {
        return false;
    }
    let Some(params) = params else {
        return false;
    };
    let Some(session_id) = session_id_of(params) else {
        return false;
    };
    let Some(session) = registry.get(session_id).await else {
        debug!(session_id, "session registry: event for unknown session dropped");
        return false;
    };

    session.on_event(params.get("event").unwrap_or(params));
    true
}

fn session_id_of(params: &Value) -> Option<&str> {
    params.get("sessionId").and_then(Value::as_str)
}
