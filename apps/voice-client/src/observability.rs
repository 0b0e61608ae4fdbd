//! Structured logging for the voice line.
//!
//! Logs are JSON lines on stderr so stdout stays a clean stream of session
//! events. Every record from a session carries the process trace id.

use std::sync::OnceLock;

use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};
use uuid::Uuid;

/// Used when neither a level flag nor `RUST_LOG` is given. The websocket
/// stack logs every frame at debug, which drowns out session logs.
pub const DEFAULT_LOG_FILTER: &str = "info,tungstenite=warn,tokio_tungstenite=warn";

static PROCESS_TRACE_ID: OnceLock<String> = OnceLock::new();

/// Pick the filter directive: explicit level first, then `RUST_LOG`.
pub fn filter_directive(level: Option<&str>, rust_log: Option<&str>) -> String {
    [level, rust_log]
        .into_iter()
        .flatten()
        .map(str::trim)
        .find(|directive| !directive.is_empty())
        .unwrap_or(DEFAULT_LOG_FILTER)
        .to_string()
}

/// Install the global subscriber. A second call leaves the first one in place.
pub fn init_tracing(level: Option<&str>) {
    let rust_log = std::env::var("RUST_LOG").ok();
    let directive = filter_directive(level, rust_log.as_deref());

    let (filter, rejected) = match EnvFilter::try_new(&directive) {
        Ok(filter) => (filter, None),
        Err(e) => (EnvFilter::new(DEFAULT_LOG_FILTER), Some(e)),
    };

    let json = fmt::layer()
        .json()
        .flatten_event(true)
        .with_current_span(true)
        .with_span_list(false)
        .with_writer(std::io::stderr);

    if tracing_subscriber::registry().with(filter).with(json).try_init().is_err() {
        return;
    }

    if let Some(e) = rejected {
        tracing::warn!(component = "bootstrap", directive = %directive, error = %e, "bad log filter, using default");
    }
    tracing::info!(
        component = "bootstrap",
        trace_id = %trace_id(),
        sample_rate = shared_proto::wire::SAMPLE_RATE,
        block_size = shared_proto::wire::BLOCK_SIZE,
        "logging ready"
    );
}

pub fn trace_id() -> &'static str {
    PROCESS_TRACE_ID.get_or_init(|| Uuid::new_v4().to_string())
}

/// Fallback session identifier when none was negotiated upstream.
pub fn generate_session_id() -> String {
    format!("session-{}", Uuid::new_v4().simple())
}
