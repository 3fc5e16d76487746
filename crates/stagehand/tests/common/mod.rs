//! Scripted subprocess runner shared by the integration tests.
//!
//! One-shot commands go through a handler closure and are recorded as
//! `"program arg arg"`. Spawned children are handed to the test as
//! [`FakeChild`] controllers that emit lines, read directives and exit on
//! demand. Killing a fake child ends it the way SIGKILL would.

#![allow(dead_code)]

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use stagehand::process::{CommandRunner, ExitInfo, KillHandle, SupervisedChild};
use stagehand::{Result, StageError};
use tokio::sync::{mpsc, oneshot};

pub const SHORT_SINKS: &str = include_str!("../fixtures/pactl_short_sinks.txt");

type Handler = dyn Fn(&str, &[&str]) -> Result<String> + Send + Sync;

pub struct FakeRunner {
    handler: Box<Handler>,
    calls: Mutex<Vec<String>>,
    spawns: Mutex<Vec<String>>,
    children_tx: mpsc::UnboundedSender<FakeChild>,
    children_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<FakeChild>>,
    next_pid: AtomicU32,
}

impl FakeRunner {
    pub fn new(
        handler: impl Fn(&str, &[&str]) -> Result<String> + Send + Sync + 'static,
    ) -> Arc<Self> {
        let (children_tx, children_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            handler: Box::new(handler),
            calls: Mutex::new(Vec::new()),
            spawns: Mutex::new(Vec::new()),
            children_tx,
            children_rx: tokio::sync::Mutex::new(children_rx),
            next_pid: AtomicU32::new(4000),
        })
    }

    /// Every one-shot command, in order.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_starting_with(&self, prefix: &str) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|c| c.starts_with(prefix))
            .collect()
    }

    /// Every spawned child's command line, in order.
    pub fn spawns(&self) -> Vec<String> {
        self.spawns.lock().unwrap().clone()
    }

    /// The next child the code under test spawns.
    pub async fn next_child(&self) -> FakeChild {
        let mut rx = self.children_rx.lock().await;
        tokio::time::timeout(Duration::from_secs(30), rx.recv())
            .await
            .expect("timed out waiting for a spawn")
            .expect("runner dropped")
    }

    /// A child spawned so far but not yet claimed, without waiting.
    pub fn try_next_child(&self) -> Option<FakeChild> {
        self.children_rx.try_lock().ok()?.try_recv().ok()
    }
}

fn command_line(program: &str, args: &[&str]) -> String {
    std::iter::once(program)
        .chain(args.iter().copied())
        .collect::<Vec<_>>()
        .join(" ")
}

struct ChildEnds {
    lines: mpsc::UnboundedSender<String>,
    exit: oneshot::Sender<ExitInfo>,
}

fn finish(ends: &Mutex<Option<ChildEnds>>, info: ExitInfo) {
    if let Some(ends) = ends.lock().unwrap().take() {
        drop(ends.lines);
        let _ = ends.exit.send(info);
    }
}

#[async_trait]
impl CommandRunner for FakeRunner {
    async fn run(&self, program: &str, args: &[&str], _timeout: Duration) -> Result<String> {
        self.calls.lock().unwrap().push(command_line(program, args));
        (self.handler)(program, args)
    }

    fn spawn(&self, program: &str, args: &[&str]) -> Result<SupervisedChild> {
        self.spawns.lock().unwrap().push(command_line(program, args));
        let pid = self.next_pid.fetch_add(1, Ordering::SeqCst);

        let (line_tx, line_rx) = mpsc::unbounded_channel();
        let (stdin_tx, stdin_rx) = mpsc::unbounded_channel();
        let (exit_tx, exit_rx) = oneshot::channel();
        let kill = KillHandle::new();
        let ends = Arc::new(Mutex::new(Some(ChildEnds {
            lines: line_tx,
            exit: exit_tx,
        })));

        let on_kill = ends.clone();
        let killer = kill.clone();
        tokio::spawn(async move {
            killer.killed().await;
            finish(
                &on_kill,
                ExitInfo {
                    code: None,
                    killed: true,
                },
            );
        });

        let controller = FakeChild {
            program: program.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
            pid,
            kill: kill.clone(),
            stdin: stdin_rx,
            ends,
        };
        if self.children_tx.send(controller).is_err() {
            return Err(StageError::CommandFailed {
                program: program.to_string(),
                message: "fake runner closed".to_string(),
            });
        }

        Ok(SupervisedChild {
            program: program.to_string(),
            pid: Some(pid),
            lines: line_rx,
            stdin: stdin_tx,
            exit: exit_rx,
            kill,
        })
    }
}

/// Test-side handle on a spawned child.
pub struct FakeChild {
    pub program: String,
    pub args: Vec<String>,
    pub pid: u32,
    pub kill: KillHandle,
    stdin: mpsc::UnboundedReceiver<String>,
    ends: Arc<Mutex<Option<ChildEnds>>>,
}

impl FakeChild {
    /// Write one line to the child's output.
    pub fn emit(&self, line: &str) {
        if let Some(ends) = self.ends.lock().unwrap().as_ref() {
            let _ = ends.lines.send(line.to_string());
        }
    }

    /// Exit on its own with `code`.
    pub fn exit(&self, code: i32) {
        finish(
            &self.ends,
            ExitInfo {
                code: Some(code),
                killed: false,
            },
        );
    }

    /// Next directive written to stdin, `None` once stdin closes or nothing
    /// arrives in time.
    pub async fn directive(&mut self) -> Option<String> {
        tokio::time::timeout(Duration::from_secs(30), self.stdin.recv())
            .await
            .ok()
            .flatten()
    }

    /// Every directive written so far, without waiting.
    pub fn drain_directives(&mut self) -> Vec<String> {
        std::iter::from_fn(|| self.stdin.try_recv().ok()).collect()
    }

    pub fn is_killed(&self) -> bool {
        self.kill.is_killed()
    }

    pub fn has_exited(&self) -> bool {
        self.ends.lock().unwrap().is_none()
    }
}

/// Collect every event currently buffered on a subscription.
pub fn drain_events(
    rx: &mut tokio::sync::broadcast::Receiver<stagehand::StageEvent>,
) -> Vec<stagehand::StageEvent> {
    std::iter::from_fn(|| rx.try_recv().ok()).collect()
}
