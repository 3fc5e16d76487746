//! Sink monitor supervision against a scripted `pactl subscribe`.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{FakeRunner, SHORT_SINKS};
use pretty_assertions::assert_eq;
use stageconf::StageConfig;
use stagehand::monitor::MonitorState;
use stagehand::persistence::MemoryStore;
use stagehand::process::SystemRunner;
use stagehand::{Result, Stage, StageError, StageEvent};
use tokio::sync::broadcast;

const ONE_SPEAKER: &str = "\
47\talsa_output.pci-0000_00_1f.3.hdmi-stereo\tPipeWire\ts32le 2ch 48000Hz\tSUSPENDED
52\tbluez_output.AA_BB_CC_DD_EE_FF.1\tPipeWire\ts16le 2ch 48000Hz\tRUNNING
";

const VLC: &str = r#"Sink Input #42
	Sink: 47
	Volume: front-left: 65536 / 100% / 0.00 dB,   front-right: 65536 / 100% / 0.00 dB
	Properties:
		application.name = "VLC media player (LibVLC 3.0.18)"
		application.process.binary = "vlc"
"#;

fn stage(runner: Arc<FakeRunner>) -> Stage {
    Stage::new(&StageConfig::default(), runner, Arc::new(MemoryStore::new()))
}

fn pactl(args: &[&str]) -> Result<String> {
    match args {
        ["list", "short", "sinks"] => Ok(ONE_SPEAKER.to_string()),
        ["list", "sink-inputs"] => Ok(VLC.to_string()),
        _ => Ok(String::new()),
    }
}

async fn next_event<F>(events: &mut broadcast::Receiver<StageEvent>, mut pick: F) -> StageEvent
where
    F: FnMut(&StageEvent) -> bool,
{
    let wait = async {
        loop {
            let event = events.recv().await.expect("event stream ended");
            if pick(&event) {
                return event;
            }
        }
    };
    tokio::time::timeout(Duration::from_secs(10), wait)
        .await
        .expect("timed out waiting for event")
}

#[tokio::test(start_paused = true)]
async fn test_gives_up_after_five_silent_exits() {
    let runner = FakeRunner::new(|_program: &str, args: &[&str]| pactl(args));
    let stage = stage(runner.clone());
    let mut state = stage.monitor.watch_state();

    stage.start().await;
    for _ in 0..5 {
        let child = runner.next_child().await;
        assert_eq!(child.args, vec!["subscribe".to_string()]);
        child.exit(1);
    }

    let given_up = tokio::time::timeout(
        Duration::from_secs(600),
        state.wait_for(|s| matches!(s, MonitorState::GivenUp { .. })),
    )
    .await
    .expect("monitor never gave up")
    .map(|s| *s)
    .expect("monitor dropped");
    assert_eq!(given_up, MonitorState::GivenUp { failures: 5 });

    // Long after the last backoff would have elapsed, still no sixth start
    tokio::time::sleep(Duration::from_secs(3600)).await;
    assert_eq!(runner.spawns().len(), 5);
    assert!(runner.try_next_child().is_none());
}

#[tokio::test(start_paused = true)]
async fn test_output_resets_the_failure_count() {
    let runner = FakeRunner::new(|_program: &str, args: &[&str]| pactl(args));
    let stage = stage(runner.clone());

    stage.start().await;
    for _ in 0..4 {
        runner.next_child().await.exit(1);
    }

    // The fifth run produced output, so four more silent exits are tolerated
    let child = runner.next_child().await;
    child.emit("Event 'change' on sink #47");
    child.exit(1);
    for _ in 0..4 {
        runner.next_child().await.exit(1);
    }

    let still_running = runner.next_child().await;
    assert!(!still_running.has_exited());
    assert!(!matches!(stage.monitor.state(), MonitorState::GivenUp { .. }));
    stage.monitor.stop().await;
}

#[tokio::test]
async fn test_bluetooth_arrival_reroutes_video() -> Result<()> {
    let runner = FakeRunner::new(|_program: &str, args: &[&str]| pactl(args));
    let stage = stage(runner.clone());
    stage.routing.set_route("video", "bluetooth").await?;
    let mut events = stage.bus.subscribe();

    stage.start().await;
    let child = runner.next_child().await;
    child.emit("Event 'new' on sink #52");

    assert_eq!(
        next_event(&mut events, |e| matches!(e, StageEvent::SinkAdded { .. })).await,
        StageEvent::SinkAdded { id: "52".into() }
    );
    assert_eq!(
        next_event(&mut events, |e| matches!(e, StageEvent::RoutingApplied { .. })).await,
        StageEvent::RoutingApplied {
            stream: "video".into(),
            sink: "bluez_output.AA_BB_CC_DD_EE_FF.1".into(),
            fallback: false,
        }
    );
    assert_eq!(
        runner.calls_starting_with("pactl move-sink-input"),
        vec!["pactl move-sink-input 42 bluez_output.AA_BB_CC_DD_EE_FF.1".to_string()]
    );

    stage.shutdown().await;
    assert!(child.is_killed());
    assert_eq!(stage.monitor.state(), MonitorState::Stopped);
    Ok(())
}

#[tokio::test]
async fn test_non_bluetooth_arrival_leaves_routes_alone() -> Result<()> {
    let runner = FakeRunner::new(|_program: &str, args: &[&str]| pactl(args));
    let stage = stage(runner.clone());
    stage.routing.set_route("video", "bluetooth").await?;
    let mut events = stage.bus.subscribe();

    stage.start().await;
    let child = runner.next_child().await;
    child.emit("Event 'new' on sink #47");
    child.emit("Event 'remove' on sink #47");

    next_event(&mut events, |e| matches!(e, StageEvent::SinkRemoved { .. })).await;
    assert!(runner.calls_starting_with("pactl move-sink-input").is_empty());

    stage.shutdown().await;
    Ok(())
}

#[cfg(unix)]
#[tokio::test]
async fn test_stderr_only_exits_count_as_silent() {
    use std::os::unix::fs::PermissionsExt;

    // Stand-in for pactl when the audio server is down
    let dir = tempfile::TempDir::new().expect("tempdir");
    let script = dir.path().join("pactl");
    std::fs::write(
        &script,
        "#!/bin/sh\necho 'Connection failure: Connection refused' >&2\nexit 1\n",
    )
    .expect("write stub");
    std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755))
        .expect("chmod stub");

    let mut config = StageConfig::default();
    config.infra.tools.pactl = script.display().to_string();
    config.bootstrap.monitor.base_delay_ms = 1;
    config.bootstrap.monitor.max_failures = 3;

    let stage = Stage::new(
        &config,
        Arc::new(SystemRunner::new()),
        Arc::new(MemoryStore::new()),
    );
    let mut state = stage.monitor.watch_state();
    stage.start().await;

    let given_up = tokio::time::timeout(
        Duration::from_secs(10),
        state.wait_for(|s| matches!(s, MonitorState::GivenUp { .. })),
    )
    .await
    .expect("monitor kept restarting a child that only wrote stderr")
    .map(|s| *s)
    .expect("monitor dropped");
    assert_eq!(given_up, MonitorState::GivenUp { failures: 3 });
}

#[tokio::test]
async fn test_failed_auto_route_reports_and_still_reconciles_combine() -> Result<()> {
    let runner = FakeRunner::new(|program: &str, args: &[&str]| match args {
        ["list", "short", "sinks"] => Ok(SHORT_SINKS.to_string()),
        ["list", "sink-inputs"] => Ok(VLC.to_string()),
        ["load-module", "module-null-sink", ..] => Ok("536870913\n".to_string()),
        ["move-sink-input", ..] => Err(StageError::CommandFailed {
            program: program.to_string(),
            message: "Failure: No such entity".to_string(),
        }),
        _ => Ok(String::new()),
    });
    let stage = stage(runner.clone());
    stage.routing.set_route("video", "bluetooth").await?;
    let mut events = stage.bus.subscribe();

    stage.start().await;
    let subscriber = runner.next_child().await;
    subscriber.emit("Event 'new' on sink #53");

    let mut seen = Vec::new();
    loop {
        let event = next_event(&mut events, |_| true).await;
        let done = matches!(event, StageEvent::CombineSinkCreated { .. });
        seen.push(event);
        if done {
            break;
        }
    }

    let errors: Vec<&StageEvent> = seen
        .iter()
        .filter(|e| matches!(e, StageEvent::RoutingError { .. }))
        .collect();
    assert_eq!(errors.len(), 1);
    match errors[0] {
        StageEvent::RoutingError { stream, error } => {
            assert_eq!(stream, "video");
            assert!(error.contains("No such entity"), "{}", error);
        }
        other => panic!("unexpected event {:?}", other),
    }
    assert!(!seen
        .iter()
        .any(|e| matches!(e, StageEvent::RoutingApplied { .. })));
    assert!(stage.combine.is_active());

    stage.shutdown().await;
    assert!(!stage.combine.is_active());
    Ok(())
}
