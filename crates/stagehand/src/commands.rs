//! CLI command implementations

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Serialize;
use stageconf::StageConfig;
use stagehand::ducking::effective_volume;
use stagehand::events::{StageEvent, StampedEvent};
use stagehand::persistence::{JsonFileStore, KeyValueStore, MemoryStore};
use stagehand::process::SystemRunner;
use stagehand::routing::{ApplyOutcome, Stream};
use stagehand::sinks::SinkType;
use stagehand::Stage;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::BtAction;

/// How long `bt pair` waits for the background auto-connect.
const PAIR_CONNECT_WAIT: Duration = Duration::from_secs(20);

pub fn build_stage(config: &StageConfig, ephemeral: bool) -> Result<Stage> {
    let store: Arc<dyn KeyValueStore> = if ephemeral {
        Arc::new(MemoryStore::new())
    } else {
        let dir = &config.infra.paths.state_dir;
        Arc::new(
            JsonFileStore::new(dir)
                .with_context(|| format!("Failed to open state directory {}", dir.display()))?,
        )
    };
    Ok(Stage::new(config, Arc::new(SystemRunner::new()), store))
}

pub fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Run until SIGINT/SIGTERM, printing every event as one JSON line.
pub async fn serve(stage: &Stage) -> Result<()> {
    let cancel_token = CancellationToken::new();
    let printer = tokio::spawn(print_events(stage, cancel_token.clone()));

    stage.start().await;

    // The monitor only sees changes; pick up speakers that are already here
    let speakers = stage.catalog.list_by_type(SinkType::Bluetooth).await.len();
    stage.combine.on_bluetooth_count_changed(speakers).await;

    info!("🎭 stagehand ready");
    shutdown_signal().await;

    stage.shutdown().await;
    cancel_token.cancel();
    printer.await.context("Event printer panicked")?;

    info!("Shutdown complete");
    Ok(())
}

fn print_events(
    stage: &Stage,
    cancel_token: CancellationToken,
) -> impl std::future::Future<Output = ()> + Send + 'static {
    let mut events = stage.bus.subscribe();
    async move {
        loop {
            tokio::select! {
                _ = cancel_token.cancelled() => break,
                event = events.recv() => match event {
                    Ok(event) => match serde_json::to_string(&StampedEvent::from(event)) {
                        Ok(line) => println!("{}", line),
                        Err(e) => warn!("Failed to serialize event: {}", e),
                    },
                    Err(RecvError::Lagged(skipped)) => warn!(skipped, "event printer lagged"),
                    Err(RecvError::Closed) => break,
                },
            }
        }
    }
}

async fn shutdown_signal() {
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received SIGINT, shutting down...");
        }
        _ = async {
            #[cfg(unix)]
            {
                use tokio::signal::unix::{signal, SignalKind};
                match signal(SignalKind::terminate()) {
                    Ok(mut sigterm) => {
                        sigterm.recv().await;
                    }
                    Err(e) => {
                        warn!("Failed to install SIGTERM handler: {}", e);
                        std::future::pending::<()>().await;
                    }
                }
            }
            #[cfg(not(unix))]
            {
                std::future::pending::<()>().await;
            }
        } => {
            info!("Received SIGTERM, shutting down...");
        }
    }
}

pub async fn sinks(stage: &Stage, sink_type: Option<&str>) -> Result<()> {
    let sinks = match sink_type {
        Some(t) => stage.catalog.list_by_type(t.parse()?).await,
        None => stage.catalog.list_sinks().await,
    };
    if sinks.is_empty() {
        println!("No sinks found");
        return Ok(());
    }
    for sink in sinks {
        println!(
            "{:>4}  {:<9}  {:<24}  {}",
            sink.id, sink.sink_type, sink.label, sink.name
        );
    }
    Ok(())
}

pub async fn apply(stage: &Stage, stream: &str, with_fallback: bool) -> Result<()> {
    let outcome = if with_fallback {
        stage.routing.apply_routing_with_fallback(stream).await?
    } else {
        stage.routing.apply_routing(stream).await?
    };
    match outcome {
        ApplyOutcome::Applied { sink, fallback } if fallback => {
            println!("{} → {} (fallback)", stream, sink)
        }
        ApplyOutcome::Applied { sink, .. } => println!("{} → {}", stream, sink),
        ApplyOutcome::NotPlaying => println!("{} is not playing; nothing to move", stream),
    }
    Ok(())
}

/// Create the combine sink and keep the forwarders alive until interrupted.
pub async fn combine(stage: &Stage) -> Result<()> {
    let status = stage.combine.create().await?;
    print_json(&status)?;

    let mut events = stage.bus.subscribe();
    tokio::select! {
        _ = shutdown_signal() => {}
        _ = async {
            while let Ok(event) = events.recv().await {
                if let StageEvent::CombineSinkDestroyed { reason } = event {
                    warn!(%reason, "combine sink went down");
                    break;
                }
            }
        } => {}
    }

    stage.combine.destroy().await?;
    Ok(())
}

pub fn duck_check(stage: &Stage, active: &[String]) -> Result<()> {
    let active: BTreeSet<Stream> = active
        .iter()
        .map(|s| s.parse::<Stream>())
        .collect::<Result<_, _>>()?;
    let rules = stage.ducking.rules();
    for target in Stream::ALL {
        match effective_volume(&rules, target, &active) {
            Some(volume) => println!("{:<8} ducked to {}%", target, volume),
            None => println!("{:<8} not ducked", target),
        }
    }
    Ok(())
}

pub async fn bluetooth(stage: &Stage, action: BtAction) -> Result<()> {
    let bt = &stage.bluetooth;
    match action {
        BtAction::Status => print_json(&bt.adapter_status().await?)?,
        BtAction::Paired => print_json(&bt.paired_devices().await?)?,
        BtAction::Connected => print_json(&bt.connected_devices().await?)?,
        BtAction::Info { address } => print_json(&bt.device_info(&address).await?)?,
        BtAction::Scan => print_json(&bt.scan().await?)?,
        BtAction::Pair { address } => {
            let mut events = stage.bus.subscribe();
            bt.pair(&address).await?;
            println!("Paired {}", address);

            // Auto-connect runs in the background; give it a chance to land
            let wait = async {
                while let Ok(event) = events.recv().await {
                    if let StageEvent::DeviceConnected { .. } = event {
                        return true;
                    }
                }
                false
            };
            match tokio::time::timeout(PAIR_CONNECT_WAIT, wait).await {
                Ok(true) => println!("Connected {}", address),
                _ => println!("Not connected yet; try `stagehand bt connect {}`", address),
            }
        }
        BtAction::Connect { address } => bt.connect(&address).await?,
        BtAction::Disconnect { address } => bt.disconnect(&address).await?,
        BtAction::Remove { address } => bt.unpair(&address).await?,
    }
    bt.cleanup();
    Ok(())
}
