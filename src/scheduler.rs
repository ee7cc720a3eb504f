//! Polling scheduler and the session object that owns one dashboard.
//!
//! [`Poller`] is the synchronous state machine: lifecycle, pause flag and the
//! single in-flight guard. [`Dashboard`] wires it to the upstream client, the
//! reconciliation engine and the rendering surface, and [`Dashboard::run`]
//! drives it from a timer and an operator control channel.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::json;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::catalog;
use crate::config::Config;
use crate::logging::{
    self, log, log_fetch_failed, log_out_of_range, log_session_summary, log_stale_batch, log_tick,
    log_tick_discarded, log_tick_suppressed, log_transition, obj, v_str, Domain, Level,
    ProfileScope,
};
use crate::present::{Frame, Surface};
use crate::reconcile::{Batch, BatchOrigin, Engine, FormatError, StaleDetector, TickReport};
use crate::storage::HistoryStore;
use crate::upstream::{
    ConnectionHealth, FallbackGenerator, FetchError, RequestStats, UpstreamClient, UpstreamError,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PollerState {
    Idle,
    Running,
    Paused,
    Stopped,
}

impl PollerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PollerState::Idle => "idle",
            PollerState::Running => "running",
            PollerState::Paused => "paused",
            PollerState::Stopped => "stopped",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    /// Out-of-band tick issued by `start`.
    Startup,
    Timer,
    Manual,
}

impl Trigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            Trigger::Startup => "startup",
            Trigger::Timer => "timer",
            Trigger::Manual => "manual",
        }
    }
}

/// Why a tick did not start a cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Suppressed {
    NotStarted,
    Paused,
    InFlight,
    Stopped,
}

impl Suppressed {
    pub fn as_str(&self) -> &'static str {
        match self {
            Suppressed::NotStarted => "not_started",
            Suppressed::Paused => "paused",
            Suppressed::InFlight => "in_flight",
            Suppressed::Stopped => "stopped",
        }
    }
}

#[derive(Debug, Clone)]
pub struct TransitionError {
    pub msg: String,
}

/// Admission token for one fetch + reconcile cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CycleTicket {
    generation: u64,
    pub trigger: Trigger,
}

#[derive(Debug, Clone)]
pub struct Poller {
    state: PollerState,
    generation: u64,
    in_flight: Option<u64>,
}

impl Default for Poller {
    fn default() -> Self {
        Self::new()
    }
}

impl Poller {
    pub fn new() -> Self {
        Self { state: PollerState::Idle, generation: 0, in_flight: None }
    }

    pub fn state(&self) -> PollerState {
        self.state
    }

    pub fn is_busy(&self) -> bool {
        self.in_flight.is_some()
    }

    pub fn start(&mut self) -> Result<(), TransitionError> {
        match self.state {
            PollerState::Idle => {
                self.state = PollerState::Running;
                Ok(())
            }
            other => Err(TransitionError { msg: format!("cannot start from {}", other.as_str()) }),
        }
    }

    /// Idempotent while paused.
    pub fn pause(&mut self) -> Result<(), TransitionError> {
        match self.state {
            PollerState::Running | PollerState::Paused => {
                self.state = PollerState::Paused;
                Ok(())
            }
            other => Err(TransitionError { msg: format!("cannot pause from {}", other.as_str()) }),
        }
    }

    /// Idempotent while running.
    pub fn resume(&mut self) -> Result<(), TransitionError> {
        match self.state {
            PollerState::Paused | PollerState::Running => {
                self.state = PollerState::Running;
                Ok(())
            }
            other => Err(TransitionError { msg: format!("cannot resume from {}", other.as_str()) }),
        }
    }

    /// Terminal. Any outstanding ticket is invalidated.
    pub fn stop(&mut self) {
        self.state = PollerState::Stopped;
        self.in_flight = None;
    }

    pub fn try_begin(&mut self, trigger: Trigger) -> Result<CycleTicket, Suppressed> {
        match (self.state, trigger) {
            (PollerState::Stopped, _) => return Err(Suppressed::Stopped),
            (PollerState::Idle, Trigger::Timer | Trigger::Startup) => {
                return Err(Suppressed::NotStarted)
            }
            (PollerState::Paused, Trigger::Timer | Trigger::Startup) => {
                return Err(Suppressed::Paused)
            }
            _ => {}
        }
        if self.in_flight.is_some() {
            return Err(Suppressed::InFlight);
        }
        self.generation += 1;
        self.in_flight = Some(self.generation);
        Ok(CycleTicket { generation: self.generation, trigger })
    }

    /// Releases the guard. Returns false when the result must be dropped.
    pub fn complete(&mut self, ticket: CycleTicket) -> bool {
        if self.state == PollerState::Stopped || self.in_flight != Some(ticket.generation) {
            return false;
        }
        self.in_flight = None;
        true
    }
}

/// Operator commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    TogglePause,
    Pause,
    Resume,
    Refresh,
    Stop,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SessionStats {
    pub applied: u64,
    pub discarded: u64,
    pub fallback: u64,
    pub suppressed: u64,
    pub stale: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub uptime_secs: i64,
    pub stats: SessionStats,
    pub requests: RequestStats,
}

/// A fetch that has been admitted and is running on the runtime.
pub struct InFlight {
    pub ticket: CycleTicket,
    handle: JoinHandle<Result<Batch, UpstreamError>>,
}

fn flatten_join(
    joined: Result<Result<Batch, UpstreamError>, tokio::task::JoinError>,
) -> Result<Batch, UpstreamError> {
    joined.unwrap_or_else(|e| Err(FetchError::Upstream(format!("fetch task failed: {}", e)).into()))
}

impl InFlight {
    pub async fn wait(self) -> (CycleTicket, Result<Batch, UpstreamError>) {
        (self.ticket, flatten_join(self.handle.await))
    }

    pub fn abort(&self) {
        self.handle.abort();
    }
}

async fn settle(pending: &mut Option<InFlight>) -> (CycleTicket, Result<Batch, UpstreamError>) {
    match pending {
        Some(f) => {
            let joined = (&mut f.handle).await;
            (f.ticket, flatten_join(joined))
        }
        None => std::future::pending().await,
    }
}

/// One dashboard session. Owns every piece of mutable state.
pub struct Dashboard {
    engine: Engine,
    poller: Poller,
    client: Arc<dyn UpstreamClient>,
    fallback: FallbackGenerator,
    surface: Box<dyn Surface>,
    history: Option<HistoryStore>,
    health: ConnectionHealth,
    stale: StaleDetector,
    stats: SessionStats,
    period: Duration,
}

impl Dashboard {
    pub fn new(cfg: &Config, client: Arc<dyn UpstreamClient>, surface: Box<dyn Surface>) -> Self {
        Self {
            engine: Engine::new(cfg.reconcile),
            poller: Poller::new(),
            client,
            fallback: FallbackGenerator::from_config(cfg),
            surface,
            history: None,
            health: ConnectionHealth::new(cfg.error_after_failures),
            stale: StaleDetector::new(),
            stats: SessionStats::default(),
            period: cfg.poll_period(),
        }
    }

    pub fn with_history(mut self, store: HistoryStore) -> Self {
        self.history = Some(store);
        self
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    pub fn poller(&self) -> &Poller {
        &self.poller
    }

    pub fn health(&self) -> &ConnectionHealth {
        &self.health
    }

    pub fn stats(&self) -> SessionStats {
        SessionStats { stale: self.stale.total(), ..self.stats }
    }

    /// Moves to running and issues the immediate startup tick.
    pub fn start(&mut self) -> Option<InFlight> {
        if let Err(e) = self.poller.start() {
            log(Level::Warn, Domain::Scheduler, "start_rejected", obj(&[("msg", v_str(&e.msg))]));
            return None;
        }
        log_transition("idle", "running");
        self.surface.status(self.health.status, "connecting");
        self.begin(Trigger::Startup)
    }

    pub fn pause(&mut self) {
        let from = self.poller.state();
        match self.poller.pause() {
            Ok(()) if from != PollerState::Paused => {
                log_transition(from.as_str(), "paused");
                self.surface.status(self.health.status, "paused");
            }
            Ok(()) => {}
            Err(e) => log(Level::Debug, Domain::Scheduler, "pause_ignored", obj(&[("msg", v_str(&e.msg))])),
        }
    }

    pub fn resume(&mut self) {
        let from = self.poller.state();
        match self.poller.resume() {
            Ok(()) if from != PollerState::Running => {
                log_transition(from.as_str(), "running");
                self.surface.status(self.health.status, "resumed");
            }
            Ok(()) => {}
            Err(e) => log(Level::Debug, Domain::Scheduler, "resume_ignored", obj(&[("msg", v_str(&e.msg))])),
        }
    }

    pub fn toggle_pause(&mut self) {
        if self.poller.state() == PollerState::Paused {
            self.resume();
        } else {
            self.pause();
        }
    }

    pub fn stop(&mut self) {
        let from = self.poller.state();
        self.poller.stop();
        if from != PollerState::Stopped {
            log_transition(from.as_str(), "stopped");
        }
    }

    /// Admits a cycle and spawns its fetch, or records why it was dropped.
    pub fn begin(&mut self, trigger: Trigger) -> Option<InFlight> {
        match self.poller.try_begin(trigger) {
            Ok(ticket) => {
                let client = Arc::clone(&self.client);
                let handle = tokio::spawn(async move { client.fetch_batch().await });
                Some(InFlight { ticket, handle })
            }
            Err(reason) => {
                if matches!(reason, Suppressed::InFlight | Suppressed::Paused) {
                    self.stats.suppressed += 1;
                }
                log_tick_suppressed(trigger.as_str(), reason.as_str());
                None
            }
        }
    }

    /// Applies a resolved fetch. Results for a stopped session or a stale
    /// ticket are dropped without touching state or the surface.
    pub fn finish(
        &mut self,
        ticket: CycleTicket,
        outcome: Result<Batch, UpstreamError>,
    ) -> Option<TickReport> {
        if !self.poller.complete(ticket) {
            log(
                Level::Debug,
                Domain::Scheduler,
                "result_discarded",
                obj(&[("trigger", v_str(ticket.trigger.as_str())), ("state", v_str(self.poller.state().as_str()))]),
            );
            return None;
        }
        let _scope = ProfileScope::with_context("cycle", &[("trigger", v_str(ticket.trigger.as_str()))]);

        let batch = match outcome {
            Ok(batch) => batch,
            Err(UpstreamError::Format(e)) => {
                self.reject(&e);
                return None;
            }
            Err(UpstreamError::Fetch(e)) => {
                self.health.record_failure();
                let reason = e.to_string();
                log_fetch_failed(&self.client.describe(), &reason, self.health.failures);
                self.stats.fallback += 1;
                let last_values: Vec<Option<f64>> =
                    self.engine.states().iter().map(|s| s.last_value).collect();
                self.fallback
                    .generate(self.engine.session().upstream_step, &last_values, &reason)
            }
        };

        match self.engine.reconcile_tick(&batch) {
            Ok(report) => {
                if report.origin == BatchOrigin::Upstream {
                    self.health.record_success();
                    // Only batches the engine accepted count towards staleness.
                    if let Some((fp, repeats)) = self.stale.observe(&batch) {
                        log_stale_batch(report.cycle, &fp, repeats);
                    }
                }
                self.publish(&report);
                Some(report)
            }
            Err(e) => {
                self.reject(&e);
                None
            }
        }
    }

    fn reject(&mut self, err: &FormatError) {
        self.health.record_format_error();
        self.stats.discarded += 1;
        log_tick_discarded(&err.to_string());
        self.surface.status(self.health.status, &format!("tick discarded: {}", err));
    }

    fn publish(&mut self, report: &TickReport) {
        self.stats.applied += 1;
        let c = report.counts;
        log_tick(
            report.cycle,
            report.upstream_step,
            match report.origin {
                BatchOrigin::Upstream => "upstream",
                BatchOrigin::Fallback => "fallback",
            },
            report.buffer_ready,
            c.valid,
            c.predicted,
            c.missing,
            c.error,
        );
        for rec in report.records.iter().filter(|r| r.out_of_range) {
            if let (Some(desc), Some(v)) = (catalog::descriptor(rec.feature_id), rec.current) {
                let (low, high) = desc.band.plausible;
                log_out_of_range(report.cycle, rec.feature_id, v, low, high);
            }
        }
        if let Some(store) = self.history.as_mut() {
            if let Err(e) = store.record_tick(logging::ts_epoch_ms(), report) {
                log(
                    Level::Warn,
                    Domain::Storage,
                    "record_failed",
                    obj(&[("cycle", json!(report.cycle)), ("error", v_str(&e.to_string()))]),
                );
            }
        }
        let frame = Frame::build(report, self.health.status, self.engine.session().uptime_secs());
        self.surface.render(&frame);
    }

    /// Drives the session until `Stop` arrives or the control channel closes.
    pub async fn run(mut self, mut controls: mpsc::Receiver<Control>) -> SessionSummary {
        let mut pending = self.start();
        let mut ticker =
            tokio::time::interval_at(tokio::time::Instant::now() + self.period, self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Some(f) = self.begin(Trigger::Timer) {
                        pending = Some(f);
                    }
                }
                (ticket, outcome) = settle(&mut pending) => {
                    pending = None;
                    self.finish(ticket, outcome);
                }
                cmd = controls.recv() => match cmd {
                    Some(Control::Refresh) => {
                        if let Some(f) = self.begin(Trigger::Manual) {
                            pending = Some(f);
                        }
                    }
                    Some(Control::TogglePause) => self.toggle_pause(),
                    Some(Control::Pause) => self.pause(),
                    Some(Control::Resume) => self.resume(),
                    Some(Control::Stop) | None => {
                        self.stop();
                        if let Some(f) = pending.take() {
                            f.abort();
                        }
                        break;
                    }
                },
            }
        }
        self.teardown()
    }

    /// Logs the session summary and flushes the log sinks.
    pub fn teardown(mut self) -> SessionSummary {
        self.stop();
        let summary = SessionSummary {
            uptime_secs: self.engine.session().uptime_secs(),
            stats: self.stats(),
            requests: self.client.stats(),
        };
        let s = summary.stats;
        log_session_summary(
            summary.uptime_secs,
            s.applied,
            s.discarded,
            s.fallback,
            s.suppressed,
            s.stale,
            summary.requests.total,
            summary.requests.failed,
        );
        logging::flush();
        summary
    }
}
