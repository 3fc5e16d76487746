//! The "all speakers" combine sink.
//!
//! One null sink plus two `pw-loopback` forwarders, each copying the null
//! sink's monitor to one Bluetooth speaker. The set is all-or-nothing: a
//! partial create is torn down before the error returns, and either
//! forwarder exiting on its own tears down the other one and the module.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info, warn};

use crate::error::{Result, StageError};
use crate::events::{EventBus, StageEvent};
use crate::process::{CommandRunner, ExitInfo, KillHandle, SupervisedChild};
use crate::pulse::PulseCli;
use crate::sinks::{SinkCatalog, SinkType, COMBINE_SINK_NAME};

const COMBINE_DESCRIPTION: &str = "All_Bluetooth_Speakers";
const MEMBER_COUNT: usize = 2;

/// Snapshot of the combine sink.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CombineStatus {
    pub active: bool,
    pub module_id: Option<String>,
    pub pids: Vec<u32>,
    pub sinks: Vec<String>,
}

struct Member {
    sink: String,
    pid: Option<u32>,
    kill: KillHandle,
}

struct ActiveCombine {
    module_id: String,
    members: Vec<Member>,
}

#[derive(Default)]
struct CombineState {
    /// Bumped on every create so stale supervisors can tell they're stale
    generation: u64,
    active: Option<ActiveCombine>,
}

#[derive(Clone)]
pub struct CombineSinkManager {
    inner: Arc<Inner>,
}

struct Inner {
    catalog: SinkCatalog,
    pulse: PulseCli,
    runner: Arc<dyn CommandRunner>,
    forwarder: String,
    latency_ms: u32,
    bus: EventBus,
    state: Mutex<CombineState>,
    active_tx: watch::Sender<bool>,
}

impl CombineSinkManager {
    pub fn new(
        catalog: SinkCatalog,
        pulse: PulseCli,
        runner: Arc<dyn CommandRunner>,
        forwarder: impl Into<String>,
        latency_ms: u32,
        bus: EventBus,
    ) -> Self {
        let (active_tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                catalog,
                pulse,
                runner,
                forwarder: forwarder.into(),
                latency_ms,
                bus,
                state: Mutex::new(CombineState::default()),
                active_tx,
            }),
        }
    }

    /// Follows `active` for components that only need the flag.
    pub fn active_watch(&self) -> watch::Receiver<bool> {
        self.inner.active_tx.subscribe()
    }

    pub fn is_active(&self) -> bool {
        *self.inner.active_tx.borrow()
    }

    pub async fn status(&self) -> CombineStatus {
        let state = self.inner.state.lock().await;
        match &state.active {
            Some(active) => CombineStatus {
                active: true,
                module_id: Some(active.module_id.clone()),
                pids: active.members.iter().filter_map(|m| m.pid).collect(),
                sinks: active.members.iter().map(|m| m.sink.clone()).collect(),
            },
            None => CombineStatus::default(),
        }
    }

    /// Create the combine sink over the first two Bluetooth sinks. No-op when
    /// already active.
    pub async fn create(&self) -> Result<CombineStatus> {
        let mut state = self.inner.state.lock().await;
        if state.active.is_some() {
            debug!("combine sink already active");
            drop(state);
            return Ok(self.status().await);
        }

        let speakers = self.inner.catalog.list_by_type(SinkType::Bluetooth).await;
        if speakers.len() < MEMBER_COUNT {
            return Err(StageError::InsufficientSpeakers {
                found: speakers.len(),
            });
        }

        let module_id = self
            .inner
            .pulse
            .load_null_sink(COMBINE_SINK_NAME, COMBINE_DESCRIPTION)
            .await?;

        let mut members = Vec::with_capacity(MEMBER_COUNT);
        let mut children = Vec::with_capacity(MEMBER_COUNT);
        for speaker in speakers.iter().take(MEMBER_COUNT) {
            match self.spawn_forwarder(&speaker.name) {
                Ok(child) => {
                    members.push(Member {
                        sink: speaker.name.clone(),
                        pid: child.pid,
                        kill: child.kill.clone(),
                    });
                    children.push(child);
                }
                Err(e) => {
                    error!(sink = %speaker.name, "forwarder failed to start: {}", e);
                    self.inner
                        .teardown(ActiveCombine { module_id, members })
                        .await;
                    return Err(e);
                }
            }
        }

        state.generation += 1;
        let generation = state.generation;
        for (index, child) in children.into_iter().enumerate() {
            tokio::spawn(supervise_member(
                self.inner.clone(),
                generation,
                index,
                child,
            ));
        }

        let status = CombineStatus {
            active: true,
            module_id: Some(module_id.clone()),
            pids: members.iter().filter_map(|m| m.pid).collect(),
            sinks: members.iter().map(|m| m.sink.clone()).collect(),
        };
        state.active = Some(ActiveCombine { module_id, members });
        self.inner.active_tx.send_replace(true);

        info!(sinks = ?status.sinks, pids = ?status.pids, "🔊 combine sink created");
        self.inner.bus.emit(StageEvent::CombineSinkCreated {
            pids: status.pids.clone(),
            sinks: status.sinks.clone(),
        });
        Ok(status)
    }

    /// Tear the combine sink down. No-op when inactive.
    pub async fn destroy(&self) -> Result<()> {
        self.destroy_with_reason("explicit").await;
        Ok(())
    }

    async fn destroy_with_reason(&self, reason: &str) {
        let mut state = self.inner.state.lock().await;
        let Some(active) = state.active.take() else {
            debug!("combine sink not active");
            return;
        };
        self.inner.active_tx.send_replace(false);
        self.inner.teardown(active).await;

        info!(reason, "combine sink destroyed");
        self.inner.bus.emit(StageEvent::CombineSinkDestroyed {
            reason: reason.to_string(),
        });
    }

    /// Auto-lifecycle hook: create at two or more speakers, destroy below.
    /// Errors are logged, never returned.
    pub async fn on_bluetooth_count_changed(&self, count: usize) {
        let active = self.is_active();
        if count >= MEMBER_COUNT && !active {
            info!(count, "enough speakers, creating combine sink");
            if let Err(e) = self.create().await {
                warn!("Auto-create of combine sink failed: {}", e);
            }
        } else if count < MEMBER_COUNT && active {
            info!(count, "speaker lost, destroying combine sink");
            self.destroy_with_reason("speakers-lost").await;
        }
    }

    fn spawn_forwarder(&self, sink: &str) -> Result<SupervisedChild> {
        let capture = format!("--capture-props=node.target={}.monitor", COMBINE_SINK_NAME);
        let playback = format!("--playback-props=node.target={}", sink);
        let latency = format!("--latency={}", self.inner.latency_ms);
        self.inner
            .runner
            .spawn(&self.inner.forwarder, &[&capture, &playback, &latency])
    }
}

impl Inner {
    /// Kill every member and unload the module. Kill is idempotent, so
    /// members that already exited are fine.
    async fn teardown(&self, active: ActiveCombine) {
        for member in &active.members {
            debug!(sink = %member.sink, pid = ?member.pid, "killing forwarder");
            member.kill.kill();
        }
        if let Err(e) = self.pulse.unload_module(&active.module_id).await {
            warn!(module_id = %active.module_id, "Failed to unload combine module: {}", e);
        }
    }
}

/// Drain one forwarder's output and react to its exit.
async fn supervise_member(inner: Arc<Inner>, generation: u64, index: usize, child: SupervisedChild) {
    let SupervisedChild {
        program,
        pid,
        mut lines,
        exit,
        ..
    } = child;

    let mut exit = exit;
    let info = loop {
        tokio::select! {
            line = lines.recv() => match line {
                Some(line) => debug!(%program, ?pid, "{}", line),
                None => break (&mut exit).await.unwrap_or(ExitInfo { code: None, killed: false }),
            },
            info = &mut exit => break info.unwrap_or(ExitInfo { code: None, killed: false }),
        }
    };

    let mut state = inner.state.lock().await;
    if state.generation != generation || state.active.is_none() {
        debug!(index, ?info, "forwarder exit after teardown");
        return;
    }
    let Some(active) = state.active.take() else {
        return;
    };

    let err = StageError::MemberExited(format!(
        "{} (member {}, pid {:?}, code {:?})",
        program, index, pid, info.code
    ));
    warn!(kind = %err.kind(), "{}", err);
    inner.active_tx.send_replace(false);
    inner.teardown(active).await;
    inner.bus.emit(StageEvent::CombineSinkDestroyed {
        reason: "member-exited".to_string(),
    });
}
