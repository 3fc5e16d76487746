//! Ducking: lower a background stream while foreground streams play.
//!
//! Each duck target keeps the set of foreground sources currently holding it
//! down. The applied level is the minimum `to` across the active rules, so
//! overlapping sources always get the more conservative level. When the set
//! empties the target goes back to the volume captured before the first duck
//! of the episode (100 if capture failed).
//!
//! `handle_event` only mutates state and queues work. Volume commands run on
//! one worker task per target, in call order, and every job reads the live
//! state when it runs rather than when it was queued.

use std::collections::{BTreeSet, HashMap};
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::error::{Result, StageError};
use crate::events::{EventBus, StageEvent};
use crate::routing::{Stream, StreamVolume};

const FULL_VOLUME: u8 = 100;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DuckingRule {
    pub when: Stream,
    pub duck: Stream,
    pub to: u8,
    #[serde(default)]
    pub fade_ms: u64,
}

impl DuckingRule {
    pub fn from_seed(seed: &stageconf::DuckingRuleSeed) -> Result<Self> {
        Ok(Self {
            when: seed.when.parse()?,
            duck: seed.duck.parse()?,
            to: seed.to.min(FULL_VOLUME),
            fade_ms: seed.fade_ms,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Lifecycle {
    Started,
    Resumed,
    Completed,
    Paused,
}

impl Lifecycle {
    fn is_active(&self) -> bool {
        matches!(self, Self::Started | Self::Resumed)
    }
}

impl FromStr for Lifecycle {
    type Err = StageError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "started" => Ok(Self::Started),
            "resumed" => Ok(Self::Resumed),
            "completed" => Ok(Self::Completed),
            "paused" => Ok(Self::Paused),
            other => Err(StageError::InvalidLifecycle(other.to_string())),
        }
    }
}

/// Minimum `to` among rules ducking `target` whose source is active.
pub fn effective_volume(
    rules: &[DuckingRule],
    target: Stream,
    active: &BTreeSet<Stream>,
) -> Option<u8> {
    rules
        .iter()
        .filter(|r| r.duck == target && active.contains(&r.when))
        .map(|r| r.to)
        .min()
}

/// Observable state of one duck target.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DuckingSnapshot {
    pub active_sources: Vec<Stream>,
    pub pre_duck_volume: Option<u8>,
    pub ducked: bool,
}

#[derive(Default)]
struct TargetState {
    active_sources: BTreeSet<Stream>,
    pre_duck_volume: Option<u8>,
}

#[derive(Default)]
struct EngineState {
    rules: Vec<DuckingRule>,
    targets: HashMap<Stream, TargetState>,
    /// Bumped by `load_rules`; jobs from an older rule set are dropped
    epoch: u64,
}

enum Job {
    Capture { epoch: u64 },
    Apply { epoch: u64 },
    Restore { epoch: u64 },
    Barrier(oneshot::Sender<()>),
}

#[derive(Clone)]
pub struct DuckingEngine {
    inner: Arc<Inner>,
}

struct Inner {
    volume: Arc<dyn StreamVolume>,
    bus: EventBus,
    state: Mutex<EngineState>,
    workers: Mutex<HashMap<Stream, mpsc::UnboundedSender<Job>>>,
}

impl Inner {
    fn state(&self) -> MutexGuard<'_, EngineState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl DuckingEngine {
    pub fn new(volume: Arc<dyn StreamVolume>, bus: EventBus) -> Self {
        Self {
            inner: Arc::new(Inner {
                volume,
                bus,
                state: Mutex::new(EngineState::default()),
                workers: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Replace the rule set and forget all live ducking state.
    pub fn load_rules(&self, rules: Vec<DuckingRule>) {
        let mut state = self.inner.state();
        state.epoch += 1;
        state.targets.clear();
        info!(count = rules.len(), "ducking rules loaded");
        state.rules = rules;
    }

    pub fn rules(&self) -> Vec<DuckingRule> {
        self.inner.state().rules.clone()
    }

    pub fn state(&self, target: Stream) -> DuckingSnapshot {
        let state = self.inner.state();
        state
            .targets
            .get(&target)
            .map(|t| DuckingSnapshot {
                active_sources: t.active_sources.iter().copied().collect(),
                pre_duck_volume: t.pre_duck_volume,
                ducked: !t.active_sources.is_empty(),
            })
            .unwrap_or_default()
    }

    /// Record a lifecycle change of a foreground source.
    pub fn handle_event(&self, source: Stream, lifecycle: Lifecycle) {
        let mut jobs = Vec::new();
        {
            let mut state = self.inner.state();
            let epoch = state.epoch;
            let targets: BTreeSet<Stream> = state
                .rules
                .iter()
                .filter(|r| r.when == source)
                .map(|r| r.duck)
                .collect();
            if targets.is_empty() {
                debug!(source = %source, "no ducking rule for source");
                return;
            }

            for target in targets {
                let entry = state.targets.entry(target).or_default();
                if lifecycle.is_active() {
                    let first = entry.active_sources.is_empty();
                    if !entry.active_sources.insert(source) {
                        continue;
                    }
                    if first && entry.pre_duck_volume.is_none() {
                        jobs.push((target, Job::Capture { epoch }));
                    }
                    jobs.push((target, Job::Apply { epoch }));
                } else {
                    if !entry.active_sources.remove(&source) {
                        continue;
                    }
                    if entry.active_sources.is_empty() {
                        jobs.push((target, Job::Restore { epoch }));
                    } else {
                        jobs.push((target, Job::Apply { epoch }));
                    }
                }
            }
        }

        debug!(source = %source, ?lifecycle, jobs = jobs.len(), "ducking event");
        for (target, job) in jobs {
            self.enqueue(target, job);
        }
    }

    /// Wait until every queued volume job has run.
    pub async fn settle(&self) {
        let senders: Vec<_> = {
            let workers = self.inner.workers.lock().unwrap_or_else(|e| e.into_inner());
            workers.values().cloned().collect()
        };
        let mut waits = Vec::with_capacity(senders.len());
        for tx in senders {
            let (done_tx, done_rx) = oneshot::channel();
            if tx.send(Job::Barrier(done_tx)).is_ok() {
                waits.push(done_rx);
            }
        }
        for wait in waits {
            let _ = wait.await;
        }
    }

    fn enqueue(&self, target: Stream, job: Job) {
        let mut workers = self.inner.workers.lock().unwrap_or_else(|e| e.into_inner());
        let tx = workers.entry(target).or_insert_with(|| {
            let (tx, rx) = mpsc::unbounded_channel();
            tokio::spawn(run_worker(self.inner.clone(), target, rx));
            tx
        });
        if tx.send(job).is_err() {
            error!(target = %target, "ducking worker gone");
        }
    }
}

async fn run_worker(inner: Arc<Inner>, target: Stream, mut rx: mpsc::UnboundedReceiver<Job>) {
    while let Some(job) = rx.recv().await {
        match job {
            Job::Capture { epoch } => capture(&inner, target, epoch).await,
            Job::Apply { epoch } => apply(&inner, target, epoch).await,
            Job::Restore { epoch } => restore(&inner, target, epoch).await,
            Job::Barrier(done) => {
                let _ = done.send(());
            }
        }
    }
}

async fn capture(inner: &Inner, target: Stream, epoch: u64) {
    {
        let state = inner.state();
        let needed = state.epoch == epoch
            && state
                .targets
                .get(&target)
                .is_some_and(|t| t.pre_duck_volume.is_none());
        if !needed {
            return;
        }
    }

    let volume = match inner.volume.volume(target).await {
        Ok(volume) => volume,
        Err(e) => {
            log_volume_error(target, "capture", &e);
            return;
        }
    };

    let mut state = inner.state();
    if state.epoch != epoch {
        return;
    }
    if let Some(t) = state.targets.get_mut(&target) {
        if t.pre_duck_volume.is_none() {
            debug!(target = %target, volume, "pre-duck volume captured");
            t.pre_duck_volume = Some(volume);
        }
    }
}

async fn apply(inner: &Inner, target: Stream, epoch: u64) {
    let (level, sources, restore_volume) = {
        let state = inner.state();
        if state.epoch != epoch {
            return;
        }
        let Some(t) = state.targets.get(&target) else {
            return;
        };
        let Some(level) = effective_volume(&state.rules, target, &t.active_sources) else {
            return;
        };
        (
            level,
            t.active_sources.iter().map(|s| s.to_string()).collect(),
            t.pre_duck_volume.unwrap_or(FULL_VOLUME),
        )
    };

    if let Err(e) = inner.volume.set_volume(target, level).await {
        log_volume_error(target, "duck", &e);
    }
    info!(target = %target, volume = level, "🦆 ducked");
    inner.bus.emit(StageEvent::DuckingChanged {
        target: target.to_string(),
        ducked: true,
        active_sources: sources,
        volume: level,
        restore_volume,
    });
}

async fn restore(inner: &Inner, target: Stream, epoch: u64) {
    let volume = {
        let mut state = inner.state();
        if state.epoch != epoch {
            return;
        }
        let Some(t) = state.targets.get_mut(&target) else {
            return;
        };
        // A new episode started before this ran; it keeps the captured level
        if !t.active_sources.is_empty() {
            return;
        }
        t.pre_duck_volume.take().unwrap_or(FULL_VOLUME)
    };

    if let Err(e) = inner.volume.set_volume(target, volume).await {
        log_volume_error(target, "restore", &e);
    }
    info!(target = %target, volume, "ducking released");
    inner.bus.emit(StageEvent::DuckingChanged {
        target: target.to_string(),
        ducked: false,
        active_sources: Vec::new(),
        volume,
        restore_volume: volume,
    });
}

fn log_volume_error(target: Stream, step: &str, err: &StageError) {
    if err.is_no_active_sink_input() {
        warn!(target = %target, step, "{}", err);
    } else {
        error!(target = %target, step, kind = %err.kind(), "{}", err);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(when: Stream, duck: Stream, to: u8) -> DuckingRule {
        DuckingRule {
            when,
            duck,
            to,
            fade_ms: 0,
        }
    }

    #[test]
    fn effective_volume_is_minimum_of_active_rules() {
        let rules = vec![
            rule(Stream::Video, Stream::Spotify, 20),
            rule(Stream::Sound, Stream::Spotify, 40),
        ];
        let mut active = BTreeSet::new();
        assert_eq!(effective_volume(&rules, Stream::Spotify, &active), None);

        active.insert(Stream::Sound);
        assert_eq!(effective_volume(&rules, Stream::Spotify, &active), Some(40));

        active.insert(Stream::Video);
        assert_eq!(effective_volume(&rules, Stream::Spotify, &active), Some(20));
        assert_eq!(effective_volume(&rules, Stream::Video, &active), None);
    }

    #[test]
    fn lifecycle_parsing() {
        assert_eq!("resumed".parse::<Lifecycle>().unwrap(), Lifecycle::Resumed);
        assert!("stopped".parse::<Lifecycle>().is_err());
        assert!(Lifecycle::Started.is_active());
        assert!(!Lifecycle::Paused.is_active());
    }

    #[test]
    fn rule_from_seed() {
        let seed = stageconf::DuckingRuleSeed {
            when: "video".into(),
            duck: "spotify".into(),
            to: 150,
            fade_ms: 500,
        };
        let rule = DuckingRule::from_seed(&seed).unwrap();
        assert_eq!(rule.to, 100);
        assert_eq!(rule.fade_ms, 500);

        let bad = stageconf::DuckingRuleSeed {
            when: "radio".into(),
            ..seed
        };
        assert!(DuckingRule::from_seed(&bad).is_err());
    }
}
