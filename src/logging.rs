//! Structured logging for the monitor.
//!
//! Every record is one JSON line in the run directory:
//! 1. `events.jsonl` receives info and above
//! 2. `trace.jsonl` receives trace and debug
//! 3. warn and above are echoed to stderr (stdout belongs to the surface)

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::fs::{create_dir_all, File};
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::process;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, OnceLock};
use std::time::Instant;

// =============================================================================
// Log Levels
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Trace = 0,
    Debug = 1,
    Info = 2,
    Warn = 3,
    Error = 4,
    Fatal = 5,
}

impl Level {
    pub fn from_env() -> Self {
        match std::env::var("LOG_LEVEL").as_deref() {
            Ok("trace") => Level::Trace,
            Ok("debug") => Level::Debug,
            Ok("info") => Level::Info,
            Ok("warn") => Level::Warn,
            Ok("error") => Level::Error,
            Ok("fatal") => Level::Fatal,
            _ => Level::Info,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Level::Trace => "trace",
            Level::Debug => "debug",
            Level::Info => "info",
            Level::Warn => "warn",
            Level::Error => "error",
            Level::Fatal => "fatal",
        }
    }
}

// =============================================================================
// Log Domains
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Domain {
    Upstream,  // Fetches, retries, request stats
    Fallback,  // Synthetic batches
    Reconcile, // Tick outcomes, plausibility, stale batches
    Scheduler, // Lifecycle, pause, suppressed ticks
    Render,    // Surface writes
    Storage,   // History recording
    System,    // Startup, shutdown
    Profile,   // Cycle timings
}

impl Domain {
    pub fn as_str(&self) -> &'static str {
        match self {
            Domain::Upstream => "upstream",
            Domain::Fallback => "fallback",
            Domain::Reconcile => "reconcile",
            Domain::Scheduler => "scheduler",
            Domain::Render => "render",
            Domain::Storage => "storage",
            Domain::System => "system",
            Domain::Profile => "profile",
        }
    }

    pub fn is_enabled(&self) -> bool {
        // LOG_DOMAINS is a comma-separated list or "all"
        match std::env::var("LOG_DOMAINS").as_deref() {
            Ok("all") | Err(_) => true,
            Ok(domains) => domains.split(',').any(|d| d.trim() == self.as_str()),
        }
    }
}

// =============================================================================
// Run context
// =============================================================================

static LOG_SEQ: AtomicU64 = AtomicU64::new(0);
static PROFILE_SEQ: AtomicU64 = AtomicU64::new(0);
static RUN_CONTEXT: OnceLock<RunContext> = OnceLock::new();

fn next_seq() -> u64 {
    LOG_SEQ.fetch_add(1, Ordering::SeqCst)
}

#[derive(Debug)]
struct RunContext {
    run_id: String,
    events: Option<Mutex<BufWriter<File>>>,
    trace: Option<Mutex<BufWriter<File>>>,
}

fn open_sink(path: PathBuf) -> Option<Mutex<BufWriter<File>>> {
    match File::create(&path) {
        Ok(f) => Some(Mutex::new(BufWriter::new(f))),
        Err(err) => {
            eprintln!("[log] failed to create {}: {}", path.display(), err);
            None
        }
    }
}

fn ensure_run_context() -> &'static RunContext {
    RUN_CONTEXT.get_or_init(|| {
        let run_id = std::env::var("RUN_ID")
            .unwrap_or_else(|_| format!("r-{}-{}", ts_epoch_ms(), process::id()));
        let base = std::env::var("LOG_DIR").unwrap_or_else(|_| "out/runs".to_string());
        let mut run_dir = PathBuf::from(base);
        run_dir.push(&run_id);
        if let Err(err) = create_dir_all(&run_dir) {
            eprintln!("[log] failed to create run dir: {}", err);
        }

        let _ = std::fs::write(
            run_dir.join("manifest.json"),
            json!({
                "run_id": run_id,
                "ts": ts_now(),
                "pid": process::id(),
                "log_dir": run_dir.to_string_lossy(),
                "version": env!("CARGO_PKG_VERSION"),
            })
            .to_string(),
        );

        RunContext {
            events: open_sink(run_dir.join("events.jsonl")),
            trace: open_sink(run_dir.join("trace.jsonl")),
            run_id,
        }
    })
}

fn sanitize_fields(mut fields: Map<String, Value>) -> Map<String, Value> {
    let redacted = Value::String("[REDACTED]".to_string());
    for key in ["access_token", "access-token", "authorization"] {
        if fields.contains_key(key) {
            fields.insert(key.to_string(), redacted.clone());
        }
    }
    fields
}

fn split_fields(mut fields: Map<String, Value>) -> (Map<String, Value>, Map<String, Value>) {
    let mut top = Map::new();
    for key in ["cycle", "feature_id", "msg"] {
        if let Some(value) = fields.remove(key) {
            top.insert(key.to_string(), value);
        }
    }
    (top, fields)
}

fn write_line(writer: &Option<Mutex<BufWriter<File>>>, line: &str) {
    if let Some(Ok(mut w)) = writer.as_ref().map(|m| m.lock()) {
        let _ = writeln!(w, "{}", line);
    }
}

// =============================================================================
// Core logging functions
// =============================================================================

/// RFC3339 timestamp with milliseconds
pub fn ts_now() -> String {
    Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

pub fn ts_epoch_ms() -> u64 {
    Utc::now().timestamp_millis() as u64
}

/// Emit a structured log entry
pub fn log(level: Level, domain: Domain, event: &str, fields: Map<String, Value>) {
    let min_level = Level::from_env();
    if level < min_level || !domain.is_enabled() {
        return;
    }
    emit_record(level, domain.as_str(), event, fields);
}

fn emit_record(level: Level, component: &str, event: &str, fields: Map<String, Value>) {
    let ctx = ensure_run_context();
    let fields = sanitize_fields(fields);
    let (mut top, data) = split_fields(fields);

    let msg = top.remove("msg").unwrap_or(Value::String(String::new()));
    let mut entry = Map::new();
    entry.insert("ts".to_string(), json!(ts_now()));
    entry.insert("run_id".to_string(), json!(ctx.run_id.clone()));
    entry.insert("seq".to_string(), json!(next_seq()));
    entry.insert("lvl".to_string(), json!(level.as_str().to_uppercase()));
    entry.insert("component".to_string(), json!(component));
    entry.insert("event".to_string(), json!(event));
    entry.insert("msg".to_string(), msg);
    for (k, v) in top {
        entry.insert(k, v);
    }
    entry.insert("data".to_string(), Value::Object(data));

    let line = Value::Object(entry).to_string();
    match level {
        Level::Trace | Level::Debug => write_line(&ctx.trace, &line),
        _ => write_line(&ctx.events, &line),
    }
    if level >= Level::Warn {
        eprintln!("{}", line);
    }
}

/// Flush buffered sinks; called on teardown.
pub fn flush() {
    if let Some(ctx) = RUN_CONTEXT.get() {
        for sink in [&ctx.events, &ctx.trace].into_iter().flatten() {
            if let Ok(mut w) = sink.lock() {
                let _ = w.flush();
            }
        }
    }
}

// =============================================================================
// Domain-Specific Logging Helpers
// =============================================================================

pub fn log_fetch_ok(endpoint: &str, attempts: u32, elapsed_ms: f64) {
    log(
        Level::Debug,
        Domain::Upstream,
        "fetch_ok",
        obj(&[
            ("endpoint", v_str(endpoint)),
            ("attempts", json!(attempts)),
            ("elapsed_ms", v_num(elapsed_ms)),
        ]),
    );
}

pub fn log_fetch_failed(endpoint: &str, error: &str, consecutive_failures: u32) {
    log(
        Level::Warn,
        Domain::Upstream,
        "fetch_failed",
        obj(&[
            ("endpoint", v_str(endpoint)),
            ("error", v_str(error)),
            ("consecutive_failures", json!(consecutive_failures)),
        ]),
    );
}

pub fn log_fallback_batch(present: usize, predicted: usize, reason: &str) {
    log(
        Level::Info,
        Domain::Fallback,
        "synthesized",
        obj(&[
            ("present", json!(present)),
            ("predicted", json!(predicted)),
            ("reason", v_str(reason)),
        ]),
    );
}

#[allow(clippy::too_many_arguments)]
pub fn log_tick(
    cycle: u64,
    upstream_step: u64,
    origin: &str,
    buffer_ready: bool,
    valid: usize,
    predicted: usize,
    missing: usize,
    error: usize,
) {
    log(
        Level::Info,
        Domain::Reconcile,
        "tick",
        obj(&[
            ("cycle", json!(cycle)),
            ("upstream_step", json!(upstream_step)),
            ("origin", v_str(origin)),
            ("buffer_ready", json!(buffer_ready)),
            ("valid", json!(valid)),
            ("predicted", json!(predicted)),
            ("missing", json!(missing)),
            ("error", json!(error)),
        ]),
    );
}

pub fn log_tick_discarded(error: &str) {
    log(
        Level::Error,
        Domain::Reconcile,
        "tick_discarded",
        obj(&[("msg", v_str("batch rejected, state untouched")), ("error", v_str(error))]),
    );
}

pub fn log_out_of_range(cycle: u64, feature_id: u16, value: f64, low: f64, high: f64) {
    log(
        Level::Warn,
        Domain::Reconcile,
        "out_of_range",
        obj(&[
            ("cycle", json!(cycle)),
            ("feature_id", json!(feature_id)),
            ("value", v_num(value)),
            ("low", v_num(low)),
            ("high", v_num(high)),
        ]),
    );
}

pub fn log_stale_batch(cycle: u64, fingerprint: &str, repeats: u64) {
    log(
        Level::Info,
        Domain::Reconcile,
        "stale_batch",
        obj(&[
            ("cycle", json!(cycle)),
            ("fingerprint", v_str(fingerprint)),
            ("repeats", json!(repeats)),
        ]),
    );
}

pub fn log_tick_suppressed(trigger: &str, state: &str) {
    log(
        Level::Debug,
        Domain::Scheduler,
        "tick_suppressed",
        obj(&[("trigger", v_str(trigger)), ("state", v_str(state))]),
    );
}

pub fn log_transition(from: &str, to: &str) {
    log(
        Level::Info,
        Domain::Scheduler,
        "transition",
        obj(&[("from", v_str(from)), ("to", v_str(to))]),
    );
}

/// Session summary on teardown
#[allow(clippy::too_many_arguments)]
pub fn log_session_summary(
    uptime_secs: i64,
    applied: u64,
    discarded: u64,
    fallback: u64,
    suppressed: u64,
    stale: u64,
    requests_total: u64,
    requests_failed: u64,
) {
    log(
        Level::Info,
        Domain::System,
        "session_summary",
        obj(&[
            ("uptime_secs", json!(uptime_secs)),
            ("applied_cycles", json!(applied)),
            ("discarded_cycles", json!(discarded)),
            ("fallback_cycles", json!(fallback)),
            ("suppressed_ticks", json!(suppressed)),
            ("stale_batches", json!(stale)),
            ("requests_total", json!(requests_total)),
            ("requests_failed", json!(requests_failed)),
        ]),
    );
}

// =============================================================================
// Utility Functions
// =============================================================================

pub fn obj(pairs: &[(&str, Value)]) -> Map<String, Value> {
    let mut map = Map::new();
    for (k, v) in pairs {
        map.insert((*k).to_string(), v.clone());
    }
    map
}

pub fn v_str(s: &str) -> Value {
    Value::String(s.to_string())
}

pub fn v_num(n: f64) -> Value {
    json!(n)
}

// =============================================================================
// Profiling Scope
// =============================================================================

/// Emits elapsed time on drop.
pub struct ProfileScope {
    label: &'static str,
    context: Option<Map<String, Value>>,
    started: Instant,
    enabled: bool,
}

impl ProfileScope {
    pub fn with_context(label: &'static str, fields: &[(&str, Value)]) -> Self {
        let enabled = Self::should_sample();
        Self {
            label,
            context: if enabled { Some(obj(fields)) } else { None },
            started: Instant::now(),
            enabled,
        }
    }

    fn should_sample() -> bool {
        std::env::var("PROFILE_SAMPLE")
            .ok()
            .and_then(|v| v.parse::<f64>().ok())
            .map(|p| {
                if p >= 1.0 {
                    true
                } else if p <= 0.0 {
                    false
                } else {
                    let seq = PROFILE_SEQ.fetch_add(1, Ordering::SeqCst);
                    let bucket = (seq % 10_000) as f64 / 10_000.0;
                    bucket < p
                }
            })
            .unwrap_or(true)
    }
}

impl Drop for ProfileScope {
    fn drop(&mut self) {
        if !self.enabled {
            return;
        }
        let elapsed_ms = self.started.elapsed().as_secs_f64() * 1000.0;
        let mut fields = self.context.take().unwrap_or_default();
        fields.insert("label".to_string(), v_str(self.label));
        fields.insert("elapsed_ms".to_string(), v_num(elapsed_ms));
        log(Level::Trace, Domain::Profile, "profile", fields);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_ordering() {
        assert!(Level::Trace < Level::Debug);
        assert!(Level::Debug < Level::Info);
        assert!(Level::Info < Level::Warn);
        assert!(Level::Warn < Level::Error);
        assert!(Level::Error < Level::Fatal);
    }

    #[test]
    fn test_obj_helper() {
        let m = obj(&[("key", v_str("value")), ("num", v_num(42.0)), ("none", Value::Null)]);
        assert_eq!(m.get("key").unwrap(), "value");
        assert_eq!(m.get("num").unwrap(), 42.0);
        assert!(m.get("none").unwrap().is_null());
    }

    #[test]
    fn test_token_is_redacted() {
        let m = sanitize_fields(obj(&[("access_token", v_str("secret")), ("tbm_id", v_str("X"))]));
        assert_eq!(m.get("access_token").unwrap(), "[REDACTED]");
        assert_eq!(m.get("tbm_id").unwrap(), "X");
    }

    #[test]
    fn test_split_lifts_cycle() {
        let (top, data) = split_fields(obj(&[("cycle", json!(3)), ("value", v_num(1.0))]));
        assert_eq!(top.get("cycle").unwrap(), 3);
        assert!(data.contains_key("value"));
        assert!(!data.contains_key("cycle"));
    }

    #[test]
    fn test_seq_increments() {
        let s1 = next_seq();
        let s2 = next_seq();
        assert!(s2 > s1);
    }
}
