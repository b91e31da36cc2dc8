//! Error taxonomy for the gateway.
//!
//! Mirrors the distinctions the retry logic in [`crate::proxy`] actually has to
//! make: whether an error is retryable, whether it carries an HTTP status, and
//! whether it is one of the two session-loss shapes a backend can report
//! (a structured JSON-RPC error, or a `-32001`/`32600` marker buried in a
//! tool's error-result text). `walk_causes` lets the retry classifier look
//! through a `std::error::Error` cause chain the same way the original
//! Python proxy's `_iter_exceptions` walked exception groups and `__cause__`.

use std::fmt;

/// The numeric JSON-RPC error code a backend uses to report that it no
/// longer recognises the session.
pub const CODE_SESSION_NOT_FOUND: i64 = -32001;
/// The numeric JSON-RPC error code a backend uses to report that the
/// session was explicitly terminated (text must also contain "Session
/// terminated" — the code alone is not distinctive enough).
pub const CODE_SESSION_TERMINATED: i64 = 32600;

#[derive(thiserror::Error)]
pub enum GatewayError {
    /// Config file missing, malformed, or failed validation. Fatal only at
    /// startup.
    #[error("configuration error: {0}")]
    Config(String),

    /// Network, TLS, or HTTP-status-shaped failure. `status` is `None` for
    /// pure transport failures (connection refused, DNS, etc).
    #[error("transport error{}: {message}", status.map(|s| format!(" (HTTP {s})")).unwrap_or_default())]
    Transport {
        status: Option<u16>,
        message: String,
    },

    /// A JSON-RPC-shaped error returned by a backend.
    #[error("protocol error {code}: {message}")]
    Protocol { code: i64, message: String },

    /// A per-call or rebuild deadline expired.
    #[error("operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// Caller-initiated cancellation. Never retried.
    #[error("operation cancelled")]
    Cancelled,

    /// The aggregator could not find a backend owning the identifier.
    #[error("not found: {0}")]
    NotFound(String),

    /// The aggregator found an owning backend, but its session was absent
    /// (a race with reconnection/teardown).
    #[error("backend unavailable: {0}")]
    Unavailable(String),

    /// Two backends expose the same identifier under `conflict_resolution = error`.
    #[error("identifier conflict: {0}")]
    Conflict(String),

    /// Anything else — wraps an arbitrary source so callers keep `?`-ergonomics.
    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl GatewayError {
    pub fn transport(status: Option<u16>, message: impl Into<String>) -> Self {
        GatewayError::Transport {
            status,
            message: message.into(),
        }
    }

    pub fn protocol(code: i64, message: impl Into<String>) -> Self {
        GatewayError::Protocol {
            code,
            message: message.into(),
        }
    }

    /// True for HTTP statuses the retry loop treats as transient: anything
    /// in `[400,500)` plus `503`. Notably *not* 500 or other 5xx — those are
    /// real server errors and propagate immediately (§4.3 "Non-retryable
    /// errors").
    pub fn is_retryable_status(status: u16) -> bool {
        (400..500).contains(&status) || status == 503
    }

    /// Whether the retry loop should absorb this error and try again.
    /// Session-loss markers are detected by walking the full cause chain,
    /// since a backend library may wrap the real error in its own type.
    pub fn is_retryable(&self) -> bool {
        match self {
            GatewayError::Transport { status, .. } => {
                status.map(Self::is_retryable_status).unwrap_or(true)
            }
            GatewayError::Timeout(_) => true,
            GatewayError::Protocol { code, message } => is_session_loss(*code, message),
            GatewayError::Internal(err) => walk_causes(err.as_ref()).any(|cause| {
                if let Some(msg) = cause.downcast_ref::<String>() {
                    contains_session_loss_text(msg)
                } else {
                    contains_session_loss_text(&cause.to_string())
                }
            }),
            GatewayError::Cancelled
            | GatewayError::Config(_)
            | GatewayError::NotFound(_)
            | GatewayError::Unavailable(_)
            | GatewayError::Conflict(_) => false,
        }
    }

    /// Whether a tool's `is_error: true` result text reports session loss —
    /// some servers return this as a 200-OK payload rather than raising, per
    /// §4.3 rule 4 (call_tool only).
    pub fn text_is_session_loss(text: &str) -> bool {
        contains_session_loss_text(text)
    }

    /// True for a transport error carrying HTTP 404 — the server has
    /// forgotten the session identifier. Drives the retry loop's "sleep 0,
    /// force a rebuild" branch (§4.3).
    pub fn is_http_404(&self) -> bool {
        matches!(self, GatewayError::Transport { status: Some(404), .. })
    }

    /// True for a logical session-loss error over what is otherwise a
    /// healthy transport (a structured JSON-RPC code, or the text markers a
    /// tool's error payload carries). Drives the retry loop's "sleep 0.2s,
    /// reinitialise" branch (§4.3).
    pub fn is_session_logical_error(&self) -> bool {
        match self {
            GatewayError::Protocol { code, message } => is_session_loss(*code, message),
            GatewayError::Internal(err) => walk_causes(err.as_ref()).any(|cause| {
                if let Some(msg) = cause.downcast_ref::<String>() {
                    contains_session_loss_text(msg)
                } else {
                    contains_session_loss_text(&cause.to_string())
                }
            }),
            _ => false,
        }
    }
}

fn is_session_loss(code: i64, message: &str) -> bool {
    if code == CODE_SESSION_NOT_FOUND {
        return true;
    }
    if code == CODE_SESSION_TERMINATED && message.contains("Session terminated") {
        return true;
    }
    contains_session_loss_text(message)
}

fn contains_session_loss_text(text: &str) -> bool {
    text.contains("Session not found")
        || text.contains("-32001")
        || text.contains("Session terminated")
        || text.contains("32600")
}

/// Walk a `dyn std::error::Error` cause chain, tolerating cycles (a
/// self-referential `source()` would otherwise loop forever). There is no
/// first-class "exception group" in `std::error::Error`; `anyhow` errors
/// built from `anyhow!(...).context(...)` chains are walked via `.source()`
/// the same way.
pub fn walk_causes(err: &(dyn std::error::Error + 'static)) -> CauseWalk<'_> {
    CauseWalk {
        current: Some(err),
        seen: 0,
    }
}

pub struct CauseWalk<'a> {
    current: Option<&'a (dyn std::error::Error + 'static)>,
    seen: usize,
}

const MAX_CAUSE_DEPTH: usize = 32;

impl<'a> Iterator for CauseWalk<'a> {
    type Item = &'a (dyn std::error::Error + 'static);

    fn next(&mut self) -> Option<Self::Item> {
        let cur = self.current?;
        self.seen += 1;
        self.current = if self.seen >= MAX_CAUSE_DEPTH {
            None
        } else {
            cur.source()
        };
        Some(cur)
    }
}

impl fmt::Debug for GatewayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_statuses_match_spec_range() {
        assert!(GatewayError::is_retryable_status(400));
        assert!(GatewayError::is_retryable_status(404));
        assert!(GatewayError::is_retryable_status(499));
        assert!(GatewayError::is_retryable_status(503));
        assert!(!GatewayError::is_retryable_status(500));
        assert!(!GatewayError::is_retryable_status(502));
        assert!(!GatewayError::is_retryable_status(200));
        assert!(!GatewayError::is_retryable_status(300));
    }

    #[test]
    fn protocol_session_not_found_is_retryable() {
        let err = GatewayError::protocol(-32001, "Session not found");
        assert!(err.is_retryable());
    }

    #[test]
    fn protocol_session_terminated_requires_message_match() {
        let matching = GatewayError::protocol(32600, "Mcp error: Session terminated");
        assert!(matching.is_retryable());

        let non_matching = GatewayError::protocol(32600, "some unrelated error");
        assert!(!non_matching.is_retryable());
    }

    #[test]
    fn generic_500_is_not_retryable() {
        let err = GatewayError::transport(Some(500), "internal server error");
        assert!(!err.is_retryable());
    }

    #[test]
    fn tool_error_text_markers_detected() {
        assert!(GatewayError::text_is_session_loss(
            "Mcp error: 32600: Session terminated"
        ));
        assert!(GatewayError::text_is_session_loss("Session not found (-32001)"));
        assert!(!GatewayError::text_is_session_loss("some other tool failure"));
    }

    #[test]
    fn cause_walk_terminates_on_cycle() {
        #[derive(Debug)]
        struct Cyclic;
        impl fmt::Display for Cyclic {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "cyclic")
            }
        }
        impl std::error::Error for Cyclic {
            fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
                Some(self)
            }
        }

        let err = Cyclic;
        let count = walk_causes(&err).count();
        assert_eq!(count, MAX_CAUSE_DEPTH);
    }
}
