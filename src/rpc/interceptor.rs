//! Cross-cutting call concerns: authentication then logging, always in that
//! order, before any handler body runs — for unary and streaming calls alike.

use serde_json::Value;
use std::time::Instant;
use tracing::{debug, info, warn};

use super::auth::validate_bearer;
use super::wire::{RpcError, UNAUTHENTICATED};

/// Validate the bearer token in a call's metadata.
///
/// `meta.authorization` must be exactly `"Bearer {expected}"`. Runs before
/// the handler and before any stream consumption. An empty expected token
/// disables auth entirely.
pub fn authenticate(meta: Option<&Value>, expected: &str) -> Result<(), RpcError> {
    if expected.is_empty() {
        return Ok(());
    }

    let header = meta
        .and_then(|m| m.get("authorization"))
        .and_then(Value::as_str)
        .unwrap_or_default();

    if validate_bearer(header, expected) {
        Ok(())
    } else {
        warn!("call rejected: missing or invalid auth token");
        Err(RpcError {
            code: UNAUTHENTICATED,
            message: "Unauthenticated — missing or invalid token".to_string(),
        })
    }
}

/// Per-call log guard. Records method + call id at open; `finish` logs the
/// duration and outcome code. Stream lifecycle events log at debug.
pub struct CallLog {
    method: String,
    call_id: String,
    started: Instant,
}

impl CallLog {
    pub fn start(method: &str, call_id: &Value) -> Self {
        debug!(method, call_id = %call_id, "call opened");
        Self {
            method: method.to_string(),
            call_id: call_id.to_string(),
            started: Instant::now(),
        }
    }

    pub fn item_received(&self) {
        debug!(method = %self.method, call_id = %self.call_id, "stream item received");
    }

    pub fn item_sent(&self) {
        debug!(method = %self.method, call_id = %self.call_id, "stream item sent");
    }

    pub fn half_closed(&self) {
        debug!(method = %self.method, call_id = %self.call_id, "client half-closed stream");
    }

    /// Log a call cut short by transport failure. Distinct from an error
    /// outcome: no RPC code was (or could be) delivered to the caller.
    pub fn aborted(self) {
        let elapsed_ms = self.started.elapsed().as_millis() as u64;
        warn!(
            method = %self.method,
            call_id = %self.call_id,
            elapsed_ms,
            outcome = "transport",
            "call aborted"
        );
    }

    /// Log the call outcome. `code` is `None` on success, the RPC error code
    /// otherwise.
    pub fn finish(self, code: Option<i32>) {
        let elapsed_ms = self.started.elapsed().as_millis() as u64;
        match code {
            None => info!(
                method = %self.method,
                call_id = %self.call_id,
                elapsed_ms,
                outcome = "ok",
                "call finished"
            ),
            Some(code) => info!(
                method = %self.method,
                call_id = %self.call_id,
                elapsed_ms,
                outcome = "error",
                code,
                "call finished"
            ),
        }
    }
}
