//! Sink-change monitor.
//!
//! Tails `pactl subscribe` under supervision and reacts to sinks coming and
//! going: auto-routes video to a newly arrived Bluetooth speaker and keeps
//! the combine sink in step with the speaker count.
//!
//! ```text
//! starting → running → exited → backoff → starting
//!                         ↘ given up (after N exits with no output)
//! ```

use std::sync::{Arc, LazyLock};
use std::time::Duration;

use regex::Regex;
use serde::Serialize;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::combine::CombineSinkManager;
use crate::events::{EventBus, StageEvent};
use crate::process::{ExitInfo, KillHandle};
use crate::pulse::PulseCli;
use crate::routing::{RoutingResolver, Stream};
use crate::sinks::{SinkCatalog, SinkType};

static EVENT_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^Event '(\w+)' on ([\w-]+) #(\d+)$").expect("static regex")
});

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkChange {
    Added(String),
    Removed(String),
}

/// Parse one `pactl subscribe` line. Only sink `new`/`remove` are reported.
pub fn parse_event_line(line: &str) -> Option<SinkChange> {
    let caps = EVENT_LINE.captures(line.trim())?;
    if &caps[2] != "sink" {
        return None;
    }
    let id = caps[3].to_string();
    match &caps[1] {
        "new" => Some(SinkChange::Added(id)),
        "remove" => Some(SinkChange::Removed(id)),
        _ => None,
    }
}

/// Backoff for restarting the subscriber.
///
/// A run that produced output resets the failure count; a silent exit bumps
/// it. Delay is `base × multiplier^failures`. Once failures reach
/// `max_failures` there is no next delay.
#[derive(Debug, Clone)]
pub struct RestartPolicy {
    base: Duration,
    multiplier: f64,
    max_failures: u32,
    failures: u32,
}

impl RestartPolicy {
    pub fn new(base: Duration, multiplier: f64, max_failures: u32) -> Self {
        Self {
            base,
            multiplier,
            max_failures,
            failures: 0,
        }
    }

    pub fn from_config(config: &stageconf::MonitorConfig) -> Self {
        Self::new(
            Duration::from_millis(config.base_delay_ms),
            config.multiplier,
            config.max_failures,
        )
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// Record an exit; returns the delay before the next start, or `None`
    /// when the monitor should give up.
    pub fn next(&mut self, produced_output: bool) -> Option<Duration> {
        if produced_output {
            self.failures = 0;
        } else {
            self.failures += 1;
        }
        if self.failures >= self.max_failures {
            return None;
        }
        let factor = self.multiplier.powi(self.failures as i32);
        Some(self.base.mul_f64(factor))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum MonitorState {
    Idle,
    Starting,
    Running,
    Backoff { failures: u32, delay_ms: u64 },
    GivenUp { failures: u32 },
    Stopped,
}

#[derive(Clone)]
pub struct SinkMonitor {
    inner: Arc<Inner>,
}

struct Inner {
    pulse: PulseCli,
    catalog: SinkCatalog,
    routing: RoutingResolver,
    combine: CombineSinkManager,
    bus: EventBus,
    config: stageconf::MonitorConfig,
    state_tx: watch::Sender<MonitorState>,
    child: Mutex<Option<KillHandle>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl SinkMonitor {
    pub fn new(
        pulse: PulseCli,
        catalog: SinkCatalog,
        routing: RoutingResolver,
        combine: CombineSinkManager,
        bus: EventBus,
        config: stageconf::MonitorConfig,
    ) -> Self {
        let (state_tx, _) = watch::channel(MonitorState::Idle);
        Self {
            inner: Arc::new(Inner {
                pulse,
                catalog,
                routing,
                combine,
                bus,
                config,
                state_tx,
                child: Mutex::new(None),
                task: Mutex::new(None),
            }),
        }
    }

    pub fn state(&self) -> MonitorState {
        *self.inner.state_tx.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<MonitorState> {
        self.inner.state_tx.subscribe()
    }

    /// Start supervising. Calling again while running is a no-op.
    pub async fn start(&self) {
        let mut task = self.inner.task.lock().await;
        if task.as_ref().is_some_and(|t| !t.is_finished()) {
            debug!("sink monitor already running");
            return;
        }
        let inner = self.inner.clone();
        *task = Some(tokio::spawn(async move { inner.supervise().await }));
    }

    /// Kill the subscriber and stop restarting it.
    pub async fn stop(&self) {
        if let Some(task) = self.inner.task.lock().await.take() {
            task.abort();
        }
        if let Some(kill) = self.inner.child.lock().await.take() {
            kill.kill();
        }
        self.inner.state_tx.send_replace(MonitorState::Stopped);
        info!("sink monitor stopped");
    }
}

impl Inner {
    async fn supervise(self: Arc<Self>) {
        let mut policy = RestartPolicy::from_config(&self.config);
        info!("🔌 sink monitor started");

        loop {
            self.state_tx.send_replace(MonitorState::Starting);
            let produced_output = match self.pulse.subscribe() {
                Ok(child) => {
                    *self.child.lock().await = Some(child.kill.clone());
                    self.state_tx.send_replace(MonitorState::Running);

                    let mut lines = child.lines;
                    let mut produced = false;
                    while let Some(line) = lines.recv().await {
                        produced = true;
                        if let Some(change) = parse_event_line(&line) {
                            self.handle_change(change).await;
                        }
                    }
                    let info = child.exit.await.unwrap_or(ExitInfo {
                        code: None,
                        killed: false,
                    });
                    self.child.lock().await.take();
                    warn!(?info, produced, "pactl subscribe exited");
                    produced
                }
                Err(e) => {
                    error!("Failed to start pactl subscribe: {}", e);
                    false
                }
            };

            match policy.next(produced_output) {
                Some(delay) => {
                    debug!(failures = policy.failures(), ?delay, "restarting sink monitor");
                    self.state_tx.send_replace(MonitorState::Backoff {
                        failures: policy.failures(),
                        delay_ms: delay.as_millis() as u64,
                    });
                    tokio::time::sleep(delay).await;
                }
                None => {
                    error!(
                        failures = policy.failures(),
                        "sink monitor gave up, restart the service to recover"
                    );
                    self.state_tx.send_replace(MonitorState::GivenUp {
                        failures: policy.failures(),
                    });
                    return;
                }
            }
        }
    }

    async fn handle_change(&self, change: SinkChange) {
        match change {
            SinkChange::Added(id) => {
                info!(id = %id, "sink added");
                self.bus.emit(StageEvent::SinkAdded { id: id.clone() });

                let sinks = self.catalog.list_sinks().await;
                let added = sinks.iter().find(|s| s.id == id);
                if let Some(sink) = added.filter(|s| s.sink_type == SinkType::Bluetooth) {
                    self.auto_route_video(&sink.name).await;
                }
                self.reconcile_combine(
                    sinks
                        .iter()
                        .filter(|s| s.sink_type == SinkType::Bluetooth)
                        .count(),
                )
                .await;
            }
            SinkChange::Removed(id) => {
                info!(id = %id, "sink removed");
                self.bus.emit(StageEvent::SinkRemoved { id });
                let count = self.catalog.list_by_type(SinkType::Bluetooth).await.len();
                self.reconcile_combine(count).await;
            }
        }
    }

    async fn auto_route_video(&self, sink_name: &str) {
        let video = Stream::Video.as_str();
        let route = match self.routing.get_route(video).await {
            Ok(route) => route,
            Err(e) => {
                warn!("Failed to read video route: {}", e);
                return;
            }
        };
        if route != SinkType::Bluetooth.as_str() && route != sink_name {
            return;
        }

        info!(sink = %sink_name, "bluetooth speaker arrived, re-routing video");
        if let Err(e) = self.routing.apply_routing(video).await {
            warn!(stream = video, "auto-route failed: {}", e);
            self.bus.emit(StageEvent::RoutingError {
                stream: video.to_string(),
                error: e.to_string(),
            });
        }
    }

    async fn reconcile_combine(&self, bluetooth_count: usize) {
        debug!(bluetooth_count, "reconciling combine sink");
        self.combine.on_bluetooth_count_changed(bluetooth_count).await;
    }
}
