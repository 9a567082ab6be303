//! Batched, best-effort error reporting.
//!
//! Entries are tagged with the subsystem that produced them, gated by a
//! master switch plus a per-source switch, and delivered to the remote
//! report endpoint in batches: every `FLUSH_INTERVAL`, or as soon as
//! `MAX_BUFFER_SIZE` entries have accumulated.
//!
//! Delivery is at-most-once. A batch that fails to send is dropped and the
//! failure is only logged locally; it is never recorded back into the
//! buffer.

use std::any::Any;
use std::fmt;
use std::mem;
use std::str::FromStr;
use std::sync::{Arc, LazyLock, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::client::RemoteResourceClient;
use crate::config::Settings;
use crate::error::Error;

/// Buffer length that triggers an immediate flush.
pub const MAX_BUFFER_SIZE: usize = 10;

/// Period of the background flush timer.
pub const FLUSH_INTERVAL: Duration = Duration::from_millis(5000);

/// Replacement for secret-looking substrings in stack text.
pub const REDACTED: &str = "[REDACTED]";

static SECRET_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"\b(?:VITE|DIRMON)_[A-Z0-9_]+=\S*|\b[A-Za-z0-9_]*(?i:secret|token|passwd|password|api_key|apikey)[A-Za-z0-9_]*=\S*",
    )
    .expect("secret pattern is valid")
});

/// Subsystem an error entry originates from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorSource {
    /// Failure while rendering output for the user.
    Rendering,
    /// Failure in the data layer (mutations, queries, validation).
    DataLayer,
    /// Failed network call.
    Transport,
    /// Uncaught fault (panic) anywhere in the process.
    UncaughtGlobal,
    /// Spawned task that ended abnormally with nobody awaiting it.
    UnhandledRejection,
}

impl ErrorSource {
    pub const ALL: [ErrorSource; 5] = [
        ErrorSource::Rendering,
        ErrorSource::DataLayer,
        ErrorSource::Transport,
        ErrorSource::UncaughtGlobal,
        ErrorSource::UnhandledRejection,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorSource::Rendering => "rendering",
            ErrorSource::DataLayer => "data_layer",
            ErrorSource::Transport => "transport",
            ErrorSource::UncaughtGlobal => "uncaught_global",
            ErrorSource::UnhandledRejection => "unhandled_rejection",
        }
    }
}

impl fmt::Display for ErrorSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ErrorSource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace('-', "_");
        ErrorSource::ALL
            .into_iter()
            .find(|source| source.as_str() == normalized)
            .ok_or_else(|| {
                let known: Vec<&str> = ErrorSource::ALL.iter().map(|s| s.as_str()).collect();
                format!("unknown error source '{}' (expected one of: {})", s, known.join(", "))
            })
    }
}

/// Per-source switches. All sources are on by default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourcePolicy {
    pub rendering: bool,
    pub data_layer: bool,
    pub transport: bool,
    pub uncaught_global: bool,
    pub unhandled_rejection: bool,
}

impl Default for SourcePolicy {
    fn default() -> Self {
        Self {
            rendering: true,
            data_layer: true,
            transport: true,
            uncaught_global: true,
            unhandled_rejection: true,
        }
    }
}

impl SourcePolicy {
    pub fn get(&self, source: ErrorSource) -> bool {
        match source {
            ErrorSource::Rendering => self.rendering,
            ErrorSource::DataLayer => self.data_layer,
            ErrorSource::Transport => self.transport,
            ErrorSource::UncaughtGlobal => self.uncaught_global,
            ErrorSource::UnhandledRejection => self.unhandled_rejection,
        }
    }

    pub fn set(&mut self, source: ErrorSource, enabled: bool) {
        let slot = match source {
            ErrorSource::Rendering => &mut self.rendering,
            ErrorSource::DataLayer => &mut self.data_layer,
            ErrorSource::Transport => &mut self.transport,
            ErrorSource::UncaughtGlobal => &mut self.uncaught_global,
            ErrorSource::UnhandledRejection => &mut self.unhandled_rejection,
        };
        *slot = enabled;
    }
}

/// Master switch plus per-source switches.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingPolicy {
    pub enabled: bool,
    pub sources: SourcePolicy,
}

impl LoggingPolicy {
    pub fn is_enabled(&self, source: ErrorSource) -> bool {
        self.enabled && self.sources.get(source)
    }
}

/// One reported error, as sent to the report endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorEntry {
    pub timestamp: DateTime<Utc>,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
    #[serde(rename = "context")]
    pub source: ErrorSource,
    #[serde(rename = "user_agent")]
    pub environment: String,
    #[serde(rename = "url")]
    pub location: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub component_stack: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub additional_info: Option<serde_json::Map<String, serde_json::Value>>,
}

/// The error being reported: a message and optional stack texts.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReportedError {
    pub message: String,
    pub stack: Option<String>,
    pub component_stack: Option<String>,
}

impl ReportedError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Self::default()
        }
    }

    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        self.stack = Some(stack.into());
        self
    }

    pub fn with_component_stack(mut self, stack: impl Into<String>) -> Self {
        self.component_stack = Some(stack.into());
        self
    }

    /// Uses the error's `Display` as message and its source chain as stack.
    pub fn from_error(err: &(dyn std::error::Error + 'static)) -> Self {
        let mut chain = Vec::new();
        let mut cause = err.source();
        while let Some(inner) = cause {
            chain.push(format!("caused by: {}", inner));
            cause = inner.source();
        }
        Self {
            message: err.to_string(),
            stack: (!chain.is_empty()).then(|| chain.join("\n")),
            component_stack: None,
        }
    }
}

impl From<&str> for ReportedError {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

impl From<String> for ReportedError {
    fn from(message: String) -> Self {
        Self::new(message)
    }
}

impl From<&Error> for ReportedError {
    fn from(err: &Error) -> Self {
        Self::from_error(err)
    }
}

/// Result of one flush attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushOutcome {
    /// Nothing was buffered.
    Empty,
    /// The batch of this many entries was delivered.
    Delivered(usize),
    /// The batch of this many entries could not be delivered and was dropped.
    Dropped(usize),
}

/// Redacts secret-looking `NAME=value` pairs from stack text.
pub fn sanitize_stack(stack: &str) -> String {
    SECRET_PATTERN.replace_all(stack, REDACTED).into_owned()
}

/// Best-effort text of a panic payload.
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Default environment string stamped on entries.
pub fn default_environment() -> String {
    format!(
        "dirmon/{} ({}; {})",
        crate::VERSION,
        std::env::consts::OS,
        std::env::consts::ARCH
    )
}

struct BufferState {
    entries: Vec<ErrorEntry>,
    sources: SourcePolicy,
    location: String,
    /// Set by `shutdown`; later entries are discarded.
    closed: bool,
}

/// Process-wide error collector.
///
/// Construct once at startup with [`TelemetryBuffer::new`] and call
/// [`TelemetryBuffer::shutdown`] before exit.
pub struct TelemetryBuffer<C: RemoteResourceClient + 'static> {
    client: Arc<C>,
    enabled: bool,
    environment: String,
    state: Mutex<BufferState>,
    timer: Mutex<Option<JoinHandle<()>>>,
}

impl<C: RemoteResourceClient + 'static> TelemetryBuffer<C> {
    /// Creates the buffer and, if the master switch is on, starts the
    /// periodic flush timer on the current tokio runtime.
    pub fn new(client: Arc<C>, policy: LoggingPolicy, environment: impl Into<String>) -> Arc<Self> {
        let buffer = Arc::new(Self {
            client,
            enabled: policy.enabled,
            environment: environment.into(),
            state: Mutex::new(BufferState {
                entries: Vec::with_capacity(MAX_BUFFER_SIZE),
                sources: policy.sources,
                location: String::new(),
                closed: false,
            }),
            timer: Mutex::new(None),
        });

        if buffer.enabled {
            buffer.start_timer();
            info!(policy = ?buffer.config(), "error logging enabled");
        } else {
            debug!("error logging disabled");
        }
        buffer
    }

    pub fn from_settings(client: Arc<C>, settings: &Settings) -> Arc<Self> {
        Self::new(client, settings.logging_policy(), settings.environment.clone())
    }

    fn lock(&self) -> MutexGuard<'_, BufferState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn start_timer(self: &Arc<Self>) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!("no tokio runtime; periodic error flush disabled");
            return;
        };
        let weak = Arc::downgrade(self);
        let handle = runtime.spawn(async move {
            let mut tick = tokio::time::interval(FLUSH_INTERVAL);
            tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // The first tick completes immediately.
            tick.tick().await;
            loop {
                tick.tick().await;
                let Some(buffer) = weak.upgrade() else {
                    break;
                };
                buffer.flush().await;
            }
        });
        *self.timer.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
    }

    /// `true` if entries from `source` are currently recorded.
    pub fn is_enabled(&self, source: ErrorSource) -> bool {
        self.enabled && self.lock().sources.get(source)
    }

    /// Turns recording for one source on or off. Already buffered entries
    /// are not affected.
    pub fn set_source_enabled(&self, source: ErrorSource, enabled: bool) {
        self.lock().sources.set(source, enabled);
        info!(source = %source, enabled, "error source logging changed");
    }

    /// Snapshot of the current policy.
    pub fn config(&self) -> LoggingPolicy {
        LoggingPolicy {
            enabled: self.enabled,
            sources: self.lock().sources,
        }
    }

    /// Sets the location string stamped on subsequent entries.
    pub fn set_location(&self, location: impl Into<String>) {
        self.lock().location = location.into();
    }

    /// Number of buffered entries.
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Records an error. Flushes inline once the buffer is full.
    pub async fn record(
        &self,
        error: impl Into<ReportedError>,
        source: ErrorSource,
        context: Option<serde_json::Map<String, serde_json::Value>>,
    ) {
        if let Some(batch) = self.push(error.into(), source, context) {
            self.deliver(batch).await;
        }
    }

    /// Records an error from a synchronous context (panic hook, drop).
    ///
    /// A full batch is swapped out immediately and delivered by a spawned
    /// task, so the buffer bound holds even though nothing is awaited here.
    pub fn record_detached(
        self: &Arc<Self>,
        error: impl Into<ReportedError>,
        source: ErrorSource,
        context: Option<serde_json::Map<String, serde_json::Value>>,
    ) {
        let Some(batch) = self.push(error.into(), source, context) else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let buffer = Arc::clone(self);
                runtime.spawn(async move {
                    buffer.deliver(batch).await;
                });
            }
            Err(_) => warn!(count = batch.len(), "no tokio runtime; error batch dropped"),
        }
    }

    /// Builds and buffers an entry. Returns the swapped-out batch if the
    /// buffer reached `MAX_BUFFER_SIZE`.
    fn push(
        &self,
        error: ReportedError,
        source: ErrorSource,
        context: Option<serde_json::Map<String, serde_json::Value>>,
    ) -> Option<Vec<ErrorEntry>> {
        let mut state = self.lock();
        if !(self.enabled && state.sources.get(source)) {
            return None;
        }
        if state.closed {
            debug!(source = %source, "error logging shut down; entry discarded");
            return None;
        }

        let entry = ErrorEntry {
            timestamp: Utc::now(),
            message: error.message,
            stack: error.stack.as_deref().map(sanitize_stack),
            source,
            environment: self.environment.clone(),
            location: state.location.clone(),
            component_stack: error.component_stack.as_deref().map(sanitize_stack),
            additional_info: context,
        };
        state.entries.push(entry);

        if state.entries.len() >= MAX_BUFFER_SIZE {
            Some(mem::take(&mut state.entries))
        } else {
            None
        }
    }

    fn take_batch(&self) -> Vec<ErrorEntry> {
        mem::take(&mut self.lock().entries)
    }

    /// Sends everything buffered so far as one batch.
    ///
    /// The buffer is swapped out before the request is issued, so entries
    /// recorded while it is in flight land in a fresh buffer and belong to
    /// the next flush.
    pub async fn flush(&self) -> FlushOutcome {
        let batch = self.take_batch();
        self.deliver(batch).await
    }

    async fn deliver(&self, batch: Vec<ErrorEntry>) -> FlushOutcome {
        if batch.is_empty() {
            return FlushOutcome::Empty;
        }
        let count = batch.len();
        match self.client.submit_error_batch(&batch).await {
            Ok(()) => {
                debug!(count, "error batch delivered");
                FlushOutcome::Delivered(count)
            }
            Err(e) => {
                let err = Error::ReportDelivery(e.to_string());
                warn!(error = %err, count, "dropping error batch");
                FlushOutcome::Dropped(count)
            }
        }
    }

    /// Stops the flush timer and makes one final flush attempt. Errors
    /// recorded afterwards are discarded.
    pub async fn shutdown(&self) -> FlushOutcome {
        self.lock().closed = true;
        let timer = self
            .timer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = timer {
            handle.abort();
        }
        let outcome = self.flush().await;
        debug!(?outcome, "error logging shut down");
        outcome
    }

    /// Awaits a spawned task, recording a panic as an unhandled rejection.
    ///
    /// Returns the task output, or `None` if it panicked or was cancelled.
    pub async fn watch_task<T>(&self, handle: JoinHandle<T>) -> Option<T> {
        match handle.await {
            Ok(value) => Some(value),
            Err(e) if e.is_panic() => {
                let message = panic_message(e.into_panic().as_ref());
                self.record(
                    format!("task panicked: {}", message),
                    ErrorSource::UnhandledRejection,
                    None,
                )
                .await;
                None
            }
            Err(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockClient, MockOp};

    fn enabled_policy() -> LoggingPolicy {
        LoggingPolicy {
            enabled: true,
            sources: SourcePolicy::default(),
        }
    }

    fn buffer_with(client: &Arc<MockClient>, policy: LoggingPolicy) -> Arc<TelemetryBuffer<MockClient>> {
        TelemetryBuffer::new(Arc::clone(client), policy, "test-env")
    }

    #[test]
    fn test_sanitize_stack_redacts_secrets() {
        let stack = "Error: boom\n    at load (VITE_SECRET=abcd1234)\n    at main";
        let sanitized = sanitize_stack(stack);
        assert!(!sanitized.contains("abcd1234"));
        assert!(sanitized.contains(REDACTED));
        assert!(sanitized.contains("at main"));

        let stack = "env DIRMON_API_URL=http://x DB_PASSWORD=hunter2 api_token=zzz";
        let sanitized = sanitize_stack(stack);
        assert!(!sanitized.contains("hunter2"));
        assert!(!sanitized.contains("zzz"));
        assert!(!sanitized.contains("http://x"));
    }

    #[test]
    fn test_sanitize_stack_keeps_plain_text() {
        let stack = "at handler (src/main.rs:10:5)";
        assert_eq!(sanitize_stack(stack), stack);
    }

    #[test]
    fn test_source_parse() {
        assert_eq!("data-layer".parse::<ErrorSource>(), Ok(ErrorSource::DataLayer));
        assert_eq!("Transport".parse::<ErrorSource>(), Ok(ErrorSource::Transport));
        assert!("network".parse::<ErrorSource>().is_err());
    }

    #[test]
    fn test_entry_wire_names() {
        let entry = ErrorEntry {
            timestamp: Utc::now(),
            message: "boom".to_string(),
            stack: None,
            source: ErrorSource::UncaughtGlobal,
            environment: "env".to_string(),
            location: "dirmon list".to_string(),
            component_stack: None,
            additional_info: None,
        };
        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["context"], "uncaught_global");
        assert_eq!(json["user_agent"], "env");
        assert_eq!(json["url"], "dirmon list");
        assert!(json.get("stack").is_none());
    }

    #[test]
    fn test_reported_error_from_error_chain() {
        #[derive(Debug)]
        struct Outer(Error);
        impl fmt::Display for Outer {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "load failed")
            }
        }
        impl std::error::Error for Outer {
            fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
                Some(&self.0)
            }
        }

        let reported = ReportedError::from_error(&Outer(Error::Transport("refused".into())));
        assert_eq!(reported.message, "load failed");
        assert_eq!(
            reported.stack.as_deref(),
            Some("caused by: Network error: refused")
        );
    }

    #[tokio::test]
    async fn test_disabled_source_records_nothing() {
        let client = Arc::new(MockClient::new());
        let buffer = buffer_with(&client, enabled_policy());
        buffer.set_source_enabled(ErrorSource::Rendering, false);

        buffer.record("hidden", ErrorSource::Rendering, None).await;
        assert!(buffer.is_empty());
        assert_eq!(buffer.flush().await, FlushOutcome::Empty);
        assert_eq!(client.call_count(MockOp::SubmitErrors), 0);

        buffer.record("shown", ErrorSource::DataLayer, None).await;
        assert_eq!(buffer.len(), 1);
        buffer.shutdown().await;
    }

    #[tokio::test]
    async fn test_master_switch_off_records_nothing() {
        let client = Arc::new(MockClient::new());
        let buffer = buffer_with(&client, LoggingPolicy::default());

        for source in ErrorSource::ALL {
            buffer.record("ignored", source, None).await;
        }
        assert!(buffer.is_empty());
        assert!(!buffer.config().enabled);
        assert_eq!(buffer.shutdown().await, FlushOutcome::Empty);
        assert_eq!(client.call_count(MockOp::SubmitErrors), 0);
    }

    #[tokio::test]
    async fn test_record_builds_sanitized_entry() {
        let client = Arc::new(MockClient::new());
        let buffer = buffer_with(&client, enabled_policy());
        buffer.set_location("dirmon toggle 3");

        let mut context = serde_json::Map::new();
        context.insert("operation".into(), "toggle".into());
        buffer
            .record(
                ReportedError::new("boom").with_stack("at x VITE_SECRET=abcd1234"),
                ErrorSource::DataLayer,
                Some(context),
            )
            .await;

        assert_eq!(buffer.flush().await, FlushOutcome::Delivered(1));
        let batches = client.submitted_batches();
        let entry = &batches[0][0];
        assert_eq!(entry.message, "boom");
        assert_eq!(entry.stack.as_deref(), Some("at x [REDACTED]"));
        assert_eq!(entry.source, ErrorSource::DataLayer);
        assert_eq!(entry.environment, "test-env");
        assert_eq!(entry.location, "dirmon toggle 3");
        assert_eq!(
            entry.additional_info.as_ref().unwrap()["operation"],
            "toggle"
        );
        buffer.shutdown().await;
    }

    #[tokio::test]
    async fn test_eleven_records_flush_once_at_ten() {
        let client = Arc::new(MockClient::new());
        let buffer = buffer_with(&client, enabled_policy());

        for i in 0..MAX_BUFFER_SIZE {
            buffer
                .record(format!("error {}", i), ErrorSource::Transport, None)
                .await;
            assert!(buffer.len() < MAX_BUFFER_SIZE);
        }
        assert_eq!(client.call_count(MockOp::SubmitErrors), 1);
        assert!(buffer.is_empty());

        buffer.record("error 10", ErrorSource::Transport, None).await;
        assert_eq!(buffer.len(), 1);
        assert_eq!(client.call_count(MockOp::SubmitErrors), 1);

        let batches = client.submitted_batches();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].len(), MAX_BUFFER_SIZE);
        assert_eq!(batches[0][0].message, "error 0");
        buffer.shutdown().await;
    }

    #[tokio::test]
    async fn test_failed_flush_drops_batch() {
        let client = Arc::new(MockClient::new());
        let buffer = buffer_with(&client, enabled_policy());
        client.fail_next(MockOp::SubmitErrors, Error::Transport("refused".into()));

        buffer.record("a", ErrorSource::Transport, None).await;
        buffer.record("b", ErrorSource::Transport, None).await;
        assert_eq!(buffer.flush().await, FlushOutcome::Dropped(2));
        assert!(buffer.is_empty());
        assert!(client.submitted_batches().is_empty());

        // Nothing is re-sent on the next flush.
        assert_eq!(buffer.flush().await, FlushOutcome::Empty);
        buffer.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_entries_recorded_during_flush_wait_for_next() {
        let client = Arc::new(MockClient::new());
        client.set_latency(MockOp::SubmitErrors, Duration::from_millis(100));
        let buffer = buffer_with(&client, enabled_policy());

        buffer.record("first", ErrorSource::DataLayer, None).await;
        buffer.record("second", ErrorSource::DataLayer, None).await;

        let (outcome, ()) = tokio::join!(buffer.flush(), async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            buffer.record("third", ErrorSource::DataLayer, None).await;
        });

        assert_eq!(outcome, FlushOutcome::Delivered(2));
        assert_eq!(buffer.len(), 1);
        let batches = client.submitted_batches();
        assert!(batches[0].iter().all(|e| e.message != "third"));
        buffer.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_flushes_periodically() {
        let client = Arc::new(MockClient::new());
        let buffer = buffer_with(&client, enabled_policy());

        buffer.record("tick", ErrorSource::Rendering, None).await;
        tokio::time::sleep(FLUSH_INTERVAL + Duration::from_millis(50)).await;

        assert!(buffer.is_empty());
        assert_eq!(client.submitted_batches().len(), 1);
        buffer.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_flushes_and_discards_later_entries() {
        let client = Arc::new(MockClient::new());
        let buffer = buffer_with(&client, enabled_policy());

        buffer.record("last words", ErrorSource::UncaughtGlobal, None).await;
        assert_eq!(buffer.shutdown().await, FlushOutcome::Delivered(1));

        buffer.record("after shutdown", ErrorSource::UncaughtGlobal, None).await;
        tokio::time::sleep(FLUSH_INTERVAL * 3).await;
        assert!(buffer.is_empty());
        assert_eq!(buffer.shutdown().await, FlushOutcome::Empty);
        assert_eq!(client.call_count(MockOp::SubmitErrors), 1);
    }

    #[tokio::test]
    async fn test_record_detached_spawns_delivery_when_full() {
        let client = Arc::new(MockClient::new());
        let buffer = buffer_with(&client, enabled_policy());

        for i in 0..MAX_BUFFER_SIZE {
            buffer.record_detached(format!("panic {}", i), ErrorSource::UncaughtGlobal, None);
        }
        // Swapped out synchronously.
        assert!(buffer.is_empty());

        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert_eq!(client.submitted_batches().len(), 1);
        buffer.shutdown().await;
    }

    #[tokio::test]
    async fn test_watch_task_records_panic() {
        let client = Arc::new(MockClient::new());
        let buffer = buffer_with(&client, enabled_policy());

        let ok = buffer.watch_task(tokio::spawn(async { 5 })).await;
        assert_eq!(ok, Some(5));
        assert!(buffer.is_empty());

        let handle = tokio::spawn(async {
            panic!("worker exploded");
        });
        let failed: Option<()> = buffer.watch_task(handle).await;
        assert!(failed.is_none());
        assert_eq!(buffer.len(), 1);

        buffer.flush().await;
        let entry = &client.submitted_batches()[0][0];
        assert_eq!(entry.source, ErrorSource::UnhandledRejection);
        assert!(entry.message.contains("worker exploded"));
        buffer.shutdown().await;
    }

    #[tokio::test]
    async fn test_config_reflects_runtime_changes() {
        let client = Arc::new(MockClient::new());
        let buffer = buffer_with(&client, enabled_policy());
        assert!(buffer.is_enabled(ErrorSource::Transport));

        buffer.set_source_enabled(ErrorSource::Transport, false);
        let config = buffer.config();
        assert!(config.enabled);
        assert!(!config.sources.transport);
        assert!(config.sources.data_layer);
        assert!(!buffer.is_enabled(ErrorSource::Transport));
        buffer.shutdown().await;
    }
}
