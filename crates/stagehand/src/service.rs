//! Composition root.
//!
//! [`Stage`] builds every component from one [`StageConfig`] and owns them.
//! There is no global state: tests construct a fresh `Stage` (or individual
//! components) over a scripted runner and an in-memory store.

use std::sync::Arc;

use stageconf::StageConfig;
use tracing::{info, warn};

use crate::bluetooth::BluetoothService;
use crate::combine::CombineSinkManager;
use crate::ducking::{DuckingEngine, DuckingRule};
use crate::events::EventBus;
use crate::monitor::SinkMonitor;
use crate::persistence::KeyValueStore;
use crate::process::CommandRunner;
use crate::pulse::PulseCli;
use crate::routing::{RoutingConfig, RoutingResolver, StreamPatterns};
use crate::sinks::SinkCatalog;

pub struct Stage {
    pub bus: EventBus,
    pub catalog: SinkCatalog,
    pub routing: RoutingResolver,
    pub combine: CombineSinkManager,
    pub ducking: DuckingEngine,
    pub monitor: SinkMonitor,
    pub bluetooth: BluetoothService,
}

impl Stage {
    pub fn new(
        config: &StageConfig,
        runner: Arc<dyn CommandRunner>,
        store: Arc<dyn KeyValueStore>,
    ) -> Self {
        let bus = EventBus::default();
        let tools = &config.infra.tools;
        let bootstrap = &config.bootstrap;
        let timeout = config.command_timeout();

        let pulse = PulseCli::new(runner.clone(), tools.pactl.clone(), timeout);
        let catalog = SinkCatalog::new(pulse.clone());

        let combine = CombineSinkManager::new(
            catalog.clone(),
            pulse.clone(),
            runner.clone(),
            tools.pw_loopback.clone(),
            bootstrap.combine.latency_ms,
            bus.clone(),
        );

        let routing = RoutingResolver::load(
            catalog.clone(),
            pulse.clone(),
            store,
            bus.clone(),
            StreamPatterns::from_config(&bootstrap.streams),
            combine.active_watch(),
            RoutingConfig::from_seed(&bootstrap.routing),
        );

        let ducking = DuckingEngine::new(Arc::new(routing.clone()), bus.clone());
        ducking.load_rules(ducking_rules(&bootstrap.ducking));

        let monitor = SinkMonitor::new(
            pulse,
            catalog.clone(),
            routing.clone(),
            combine.clone(),
            bus.clone(),
            bootstrap.monitor.clone(),
        );

        let bluetooth = BluetoothService::new(
            runner,
            tools.bluetoothctl.clone(),
            timeout,
            bootstrap.bluetooth.clone(),
            bus.clone(),
        );

        Self {
            bus,
            catalog,
            routing,
            combine,
            ducking,
            monitor,
            bluetooth,
        }
    }

    /// Start background supervision.
    pub async fn start(&self) {
        self.monitor.start().await;
    }

    /// Stop the monitor, tear down the combine sink and kill every
    /// Bluetooth child. Safe to call more than once.
    pub async fn shutdown(&self) {
        info!("shutting down");
        self.monitor.stop().await;
        if let Err(e) = self.combine.destroy().await {
            warn!("Failed to destroy combine sink on shutdown: {}", e);
        }
        self.ducking.settle().await;
        self.bluetooth.cleanup();
    }
}

/// Configured rules that name unknown streams are logged and dropped.
pub fn ducking_rules(config: &stageconf::DuckingConfig) -> Vec<DuckingRule> {
    config
        .rules
        .iter()
        .filter_map(|seed| match DuckingRule::from_seed(seed) {
            Ok(rule) => Some(rule),
            Err(e) => {
                warn!("Ignoring ducking rule: {}", e);
                None
            }
        })
        .collect()
}
