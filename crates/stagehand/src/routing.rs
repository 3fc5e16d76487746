//! Stream → sink routing.
//!
//! A route names either a sink type (`hdmi`, `bluetooth`, `combine`, `other`)
//! or a concrete sink name. Resolution against the live catalog tries the
//! exact name first, then the type; when nothing matches and the route isn't
//! already the default type, the stream falls back to a default-type sink.
//!
//! The table is persisted under [`ROUTING_KEY`] on every change and loaded
//! once at startup.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, RwLock};
use tracing::{debug, info, warn};

use crate::error::{Result, StageError};
use crate::events::{EventBus, StageEvent};
use crate::persistence::KeyValueStore;
use crate::pulse::{PulseCli, SinkInput};
use crate::sinks::{Sink, SinkCatalog, SinkType};

/// Persistence key for [`RoutingConfig`].
pub const ROUTING_KEY: &str = "routing";

/// The closed set of streams the show controls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stream {
    Video,
    Spotify,
    Sound,
}

impl Stream {
    pub const ALL: [Stream; 3] = [Stream::Video, Stream::Spotify, Stream::Sound];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Video => "video",
            Self::Spotify => "spotify",
            Self::Sound => "sound",
        }
    }
}

impl fmt::Display for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for Stream {
    type Err = StageError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "video" => Ok(Self::Video),
            "spotify" => Ok(Self::Spotify),
            "sound" => Ok(Self::Sound),
            _ => Err(StageError::InvalidStream(s.to_string())),
        }
    }
}

/// Where one stream goes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "RouteValue")]
pub struct RouteEntry {
    pub sink: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback: Option<String>,
}

impl RouteEntry {
    pub fn new(sink: impl Into<String>) -> Self {
        Self {
            sink: sink.into(),
            fallback: None,
        }
    }
}

/// Older blobs stored bare strings instead of `{sink}` objects.
#[derive(Deserialize)]
#[serde(untagged)]
enum RouteValue {
    Plain(String),
    Entry {
        sink: String,
        #[serde(default)]
        fallback: Option<String>,
    },
}

impl From<RouteValue> for RouteEntry {
    fn from(value: RouteValue) -> Self {
        match value {
            RouteValue::Plain(sink) => RouteEntry::new(sink),
            RouteValue::Entry { sink, fallback } => RouteEntry { sink, fallback },
        }
    }
}

/// The persisted routing table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoutingConfig {
    #[serde(default)]
    pub routes: BTreeMap<Stream, RouteEntry>,
    pub default_sink: SinkType,
}

impl RoutingConfig {
    /// Build the initial table from configuration. Unknown streams and an
    /// unknown default type are logged and skipped.
    pub fn from_seed(seed: &stageconf::RoutingConfig) -> Self {
        let default_sink = seed.default_sink.parse().unwrap_or_else(|_| {
            warn!(
                default_sink = %seed.default_sink,
                "configured default sink is not a sink type, using hdmi"
            );
            SinkType::Hdmi
        });

        let mut routes = BTreeMap::new();
        for (name, route) in &seed.routes {
            match name.parse::<Stream>() {
                Ok(stream) => {
                    routes.insert(
                        stream,
                        RouteEntry {
                            sink: route.sink.clone(),
                            fallback: route.fallback.clone(),
                        },
                    );
                }
                Err(e) => warn!("Ignoring configured route: {}", e),
            }
        }

        Self {
            routes,
            default_sink,
        }
    }

    pub fn route_for(&self, stream: Stream) -> RouteEntry {
        self.routes
            .get(&stream)
            .cloned()
            .unwrap_or_else(|| RouteEntry::new(self.default_sink.as_str()))
    }
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            routes: BTreeMap::new(),
            default_sink: SinkType::Hdmi,
        }
    }
}

/// Case-insensitive application patterns used to find a stream's sink-input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamPatterns(BTreeMap<Stream, String>);

impl StreamPatterns {
    pub fn from_config(config: &stageconf::StreamsConfig) -> Self {
        let mut patterns = Self(BTreeMap::new());
        for (name, pattern) in config {
            match name.parse::<Stream>() {
                Ok(stream) => {
                    patterns.0.insert(stream, pattern.clone());
                }
                Err(e) => warn!("Ignoring stream pattern: {}", e),
            }
        }
        patterns
    }

    pub fn pattern(&self, stream: Stream) -> &str {
        self.0
            .get(&stream)
            .map(String::as_str)
            .unwrap_or_else(|| stream.as_str())
    }
}

impl Default for StreamPatterns {
    fn default() -> Self {
        Self::from_config(&stageconf::bootstrap::default_streams())
    }
}

/// Retry schedule for finding a sink-input that may not exist yet.
///
/// Delays start at 100ms and double; the sum never exceeds the 2s budget,
/// and the attempt after the last delay is the final one.
#[derive(Debug, Clone)]
pub struct SinkInputRetry {
    next_delay: Duration,
    remaining: Duration,
}

impl SinkInputRetry {
    pub const INITIAL: Duration = Duration::from_millis(100);
    pub const BUDGET: Duration = Duration::from_secs(2);

    pub fn new() -> Self {
        Self {
            next_delay: Self::INITIAL,
            remaining: Self::BUDGET,
        }
    }

    /// Delay before the next attempt, `None` once the budget is spent.
    pub fn next(&mut self) -> Option<Duration> {
        if self.remaining.is_zero() {
            return None;
        }
        let delay = self.next_delay.min(self.remaining);
        self.remaining -= delay;
        self.next_delay *= 2;
        Some(delay)
    }
}

impl Default for SinkInputRetry {
    fn default() -> Self {
        Self::new()
    }
}

/// Result of a successful `apply_routing` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// The stream's sink-input was moved.
    Applied { sink: String, fallback: bool },
    /// The application has no sink-input; nothing to move yet.
    NotPlaying,
}

/// Route table plus catalog, values flattened to plain strings.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoutingStatus {
    pub routes: BTreeMap<String, String>,
    pub default_sink: String,
    pub sinks: Vec<Sink>,
}

/// Per-stream volume, consumed by the ducking engine.
#[async_trait]
pub trait StreamVolume: Send + Sync {
    async fn set_volume(&self, stream: Stream, percent: u8) -> Result<()>;
    async fn volume(&self, stream: Stream) -> Result<u8>;
}

/// Resolve a route target against live sinks: exact name, then type.
pub fn resolve<'a>(target: &str, sinks: &'a [Sink]) -> Option<&'a Sink> {
    if let Some(sink) = sinks.iter().find(|s| s.name == target) {
        return Some(sink);
    }
    let sink_type = target.parse::<SinkType>().ok()?;
    sinks.iter().find(|s| s.sink_type == sink_type)
}

/// Owns the routing table and moves streams between sinks.
#[derive(Clone)]
pub struct RoutingResolver {
    inner: Arc<Inner>,
}

struct Inner {
    catalog: SinkCatalog,
    pulse: PulseCli,
    store: Arc<dyn KeyValueStore>,
    bus: EventBus,
    patterns: StreamPatterns,
    combine_active: watch::Receiver<bool>,
    config: RwLock<RoutingConfig>,
}

impl RoutingResolver {
    /// Load the persisted table, or start from `defaults` when nothing was
    /// saved or the saved blob can't be read.
    pub fn load(
        catalog: SinkCatalog,
        pulse: PulseCli,
        store: Arc<dyn KeyValueStore>,
        bus: EventBus,
        patterns: StreamPatterns,
        combine_active: watch::Receiver<bool>,
        defaults: RoutingConfig,
    ) -> Self {
        let config = match store.load(ROUTING_KEY) {
            Ok(Some(value)) => match serde_json::from_value::<RoutingConfig>(value) {
                Ok(config) => {
                    debug!(routes = config.routes.len(), "loaded persisted routing");
                    config
                }
                Err(e) => {
                    warn!("Persisted routing is unreadable, using defaults: {}", e);
                    defaults
                }
            },
            Ok(None) => defaults,
            Err(e) => {
                warn!("Failed to load routing, using defaults: {}", e);
                defaults
            }
        };

        Self {
            inner: Arc::new(Inner {
                catalog,
                pulse,
                store,
                bus,
                patterns,
                combine_active,
                config: RwLock::new(config),
            }),
        }
    }

    pub async fn config(&self) -> RoutingConfig {
        self.inner.config.read().await.clone()
    }

    /// Route `stream` to a sink type or name. An existing explicit fallback
    /// is kept.
    pub async fn set_route(&self, stream: &str, sink: &str) -> Result<()> {
        let stream: Stream = stream.parse()?;
        let fallback = self
            .update(|config| {
                let entry = config
                    .routes
                    .entry(stream)
                    .or_insert_with(|| RouteEntry::new(sink));
                entry.sink = sink.to_string();
                entry.fallback.clone()
            })
            .await?;

        info!(stream = %stream, sink, "route set");
        self.inner.bus.emit(StageEvent::RoutingChanged {
            stream: stream.to_string(),
            sink: sink.to_string(),
            fallback,
        });
        Ok(())
    }

    /// Set or clear the explicit fallback used by
    /// [`apply_routing_with_fallback`](Self::apply_routing_with_fallback).
    pub async fn set_route_fallback(&self, stream: &str, fallback: Option<&str>) -> Result<()> {
        let stream: Stream = stream.parse()?;
        let sink = self
            .update(|config| {
                let entry = config.route_for(stream);
                let entry = config.routes.entry(stream).or_insert(entry);
                entry.fallback = fallback.map(String::from);
                entry.sink.clone()
            })
            .await?;

        info!(stream = %stream, ?fallback, "route fallback set");
        self.inner.bus.emit(StageEvent::RoutingChanged {
            stream: stream.to_string(),
            sink,
            fallback: fallback.map(String::from),
        });
        Ok(())
    }

    /// Change the type used by unrouted streams.
    pub async fn set_default_sink(&self, sink_type: &str) -> Result<()> {
        let sink_type: SinkType = sink_type.parse()?;
        self.update(|config| config.default_sink = sink_type).await?;
        info!(default_sink = %sink_type, "default sink set");
        Ok(())
    }

    /// Mutate a copy, persist it, and only then commit it in memory.
    async fn update<T>(&self, f: impl FnOnce(&mut RoutingConfig) -> T) -> Result<T> {
        let mut config = self.inner.config.write().await;
        let mut next = config.clone();
        let out = f(&mut next);

        let value = serde_json::to_value(&next)
            .map_err(|e| StageError::Persistence(format!("serialize routing: {}", e)))?;
        self.inner.store.save(ROUTING_KEY, &value)?;

        *config = next;
        Ok(out)
    }

    pub async fn get_route(&self, stream: &str) -> Result<String> {
        let stream: Stream = stream.parse()?;
        Ok(self.inner.config.read().await.route_for(stream).sink)
    }

    async fn live_sinks(&self) -> Vec<Sink> {
        let combine_active = *self.inner.combine_active.borrow();
        self.inner.catalog.list_with_combine(combine_active).await
    }

    /// Move the stream to its configured sink, falling back to the default
    /// sink type when the configured one isn't present.
    pub async fn apply_routing(&self, stream: &str) -> Result<ApplyOutcome> {
        let stream: Stream = stream.parse()?;
        let (entry, default_sink) = {
            let config = self.inner.config.read().await;
            (config.route_for(stream), config.default_sink)
        };

        let sinks = self.live_sinks().await;
        let (sink, fallback) = match resolve(&entry.sink, &sinks) {
            Some(sink) => (sink.clone(), false),
            None if entry.sink != default_sink.as_str() => {
                let Some(sink) = resolve(default_sink.as_str(), &sinks) else {
                    return Err(StageError::NoSinkAvailable(stream.to_string()));
                };
                warn!(
                    stream = %stream,
                    requested = %entry.sink,
                    actual = %sink.name,
                    "configured sink unavailable, falling back"
                );
                self.inner.bus.emit(StageEvent::RoutingFallback {
                    stream: stream.to_string(),
                    requested: entry.sink.clone(),
                    actual: sink.name.clone(),
                    reason: format!("no live sink matches '{}'", entry.sink),
                });
                (sink.clone(), true)
            }
            None => return Err(StageError::NoSinkAvailable(stream.to_string())),
        };

        let Some(input) = self.find_sink_input_with_retry(stream).await else {
            info!(stream = %stream, "no sink-input yet, stream not playing");
            return Ok(ApplyOutcome::NotPlaying);
        };

        self.move_input(stream, &input, &sink).await?;
        info!(stream = %stream, sink = %sink.name, fallback, "routing applied");
        self.inner.bus.emit(StageEvent::RoutingApplied {
            stream: stream.to_string(),
            sink: sink.name.clone(),
            fallback,
        });
        Ok(ApplyOutcome::Applied {
            sink: sink.name,
            fallback,
        })
    }

    /// Try the configured sink, then the route's explicit fallback.
    pub async fn apply_routing_with_fallback(&self, stream: &str) -> Result<ApplyOutcome> {
        let stream: Stream = stream.parse()?;
        let entry = self.inner.config.read().await.route_for(stream);

        let Some(input) = self.find_sink_input_with_retry(stream).await else {
            info!(stream = %stream, "no sink-input yet, stream not playing");
            return Ok(ApplyOutcome::NotPlaying);
        };

        let sinks = self.live_sinks().await;
        let primary_error = match self.try_target(stream, &input, &entry.sink, &sinks).await {
            Ok(sink) => {
                self.inner.bus.emit(StageEvent::RoutingApplied {
                    stream: stream.to_string(),
                    sink: sink.clone(),
                    fallback: false,
                });
                return Ok(ApplyOutcome::Applied {
                    sink,
                    fallback: false,
                });
            }
            Err(e) => e,
        };

        let Some(fallback) = entry.fallback else {
            return Err(StageError::RouteFailed {
                stream: stream.to_string(),
                message: format!("'{}': {}", entry.sink, primary_error),
            });
        };

        warn!(
            stream = %stream,
            primary = %entry.sink,
            fallback = %fallback,
            "primary route failed: {}", primary_error
        );
        match self.try_target(stream, &input, &fallback, &sinks).await {
            Ok(sink) => {
                self.inner.bus.emit(StageEvent::RoutingFallback {
                    stream: stream.to_string(),
                    requested: entry.sink.clone(),
                    actual: sink.clone(),
                    reason: primary_error,
                });
                self.inner.bus.emit(StageEvent::RoutingApplied {
                    stream: stream.to_string(),
                    sink: sink.clone(),
                    fallback: true,
                });
                Ok(ApplyOutcome::Applied {
                    sink,
                    fallback: true,
                })
            }
            Err(fallback_error) => Err(StageError::RouteFailed {
                stream: stream.to_string(),
                message: format!(
                    "primary '{}': {}; fallback '{}': {}",
                    entry.sink, primary_error, fallback, fallback_error
                ),
            }),
        }
    }

    async fn try_target(
        &self,
        stream: Stream,
        input: &SinkInput,
        target: &str,
        sinks: &[Sink],
    ) -> std::result::Result<String, String> {
        let sink = resolve(target, sinks).ok_or_else(|| "no live sink matches".to_string())?;
        self.move_input(stream, input, sink)
            .await
            .map_err(|e| e.to_string())?;
        Ok(sink.name.clone())
    }

    async fn move_input(&self, stream: Stream, input: &SinkInput, sink: &Sink) -> Result<()> {
        self.inner
            .pulse
            .move_sink_input(input.index, &sink.name)
            .await
            .map_err(|e| StageError::RouteFailed {
                stream: stream.to_string(),
                message: e.to_string(),
            })
    }

    /// Single lookup, no retry. Lookup failures read as "not playing".
    async fn find_sink_input(&self, stream: Stream) -> Option<SinkInput> {
        let pattern = self.inner.patterns.pattern(stream);
        match self.inner.pulse.list_sink_inputs().await {
            Ok(inputs) => inputs.into_iter().find(|i| i.matches(pattern)),
            Err(e) => {
                debug!(stream = %stream, "sink-input lookup failed: {}", e);
                None
            }
        }
    }

    async fn find_sink_input_with_retry(&self, stream: Stream) -> Option<SinkInput> {
        let mut retry = SinkInputRetry::new();
        loop {
            if let Some(input) = self.find_sink_input(stream).await {
                return Some(input);
            }
            let delay = retry.next()?;
            tokio::time::sleep(delay).await;
        }
    }

    /// Set the stream's volume, clamped to 0..=100.
    pub async fn set_stream_volume(&self, stream: &str, percent: i64) -> Result<()> {
        let stream: Stream = stream.parse()?;
        self.set_volume(stream, percent.clamp(0, 100) as u8).await
    }

    pub async fn get_stream_volume(&self, stream: &str) -> Result<u8> {
        let stream: Stream = stream.parse()?;
        self.volume(stream).await
    }

    pub async fn get_status(&self) -> RoutingStatus {
        let config = self.config().await;
        let routes = Stream::ALL
            .iter()
            .map(|s| (s.to_string(), config.route_for(*s).sink))
            .collect();
        RoutingStatus {
            routes,
            default_sink: config.default_sink.to_string(),
            sinks: self.live_sinks().await,
        }
    }
}

#[async_trait]
impl StreamVolume for RoutingResolver {
    async fn set_volume(&self, stream: Stream, percent: u8) -> Result<()> {
        let input = self
            .find_sink_input(stream)
            .await
            .ok_or_else(|| StageError::NoActiveSinkInput(stream.to_string()))?;
        let percent = percent.min(100);
        self.inner
            .pulse
            .set_sink_input_volume(input.index, percent)
            .await?;
        debug!(stream = %stream, percent, "stream volume set");
        Ok(())
    }

    async fn volume(&self, stream: Stream) -> Result<u8> {
        let input = self
            .find_sink_input(stream)
            .await
            .ok_or_else(|| StageError::NoActiveSinkInput(stream.to_string()))?;
        Ok(input.volume_percent.unwrap_or(100).min(100))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn sink(name: &str) -> Sink {
        let sink_type = crate::sinks::classify(name);
        Sink {
            id: "1".into(),
            name: name.into(),
            driver: "PipeWire".into(),
            format: String::new(),
            state: "IDLE".into(),
            sink_type,
            label: crate::sinks::label(name, sink_type),
            is_virtual: false,
        }
    }

    #[test]
    fn retry_schedule_stays_within_budget() {
        let mut retry = SinkInputRetry::new();
        let delays: Vec<u64> = std::iter::from_fn(|| retry.next())
            .map(|d| d.as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![100, 200, 400, 800, 500]);
        assert_eq!(delays.iter().sum::<u64>(), 2_000);
        assert_eq!(retry.next(), None);
    }

    #[test]
    fn resolve_prefers_exact_name() {
        let sinks = vec![
            sink("alsa_output.hdmi-stereo"),
            sink("bluez_output.AA_BB_CC_DD_EE_FF.1"),
            sink("bluez_output.11_22_33_44_55_66.1"),
        ];
        assert_eq!(
            resolve("bluez_output.11_22_33_44_55_66.1", &sinks).map(|s| s.name.as_str()),
            Some("bluez_output.11_22_33_44_55_66.1")
        );
        assert_eq!(
            resolve("bluetooth", &sinks).map(|s| s.name.as_str()),
            Some("bluez_output.AA_BB_CC_DD_EE_FF.1")
        );
        assert_eq!(resolve("combine", &sinks), None);
        assert_eq!(resolve("nonexistent", &sinks), None);
    }

    #[test]
    fn stream_parsing() {
        assert_eq!("video".parse::<Stream>().unwrap(), Stream::Video);
        let err = "radio".parse::<Stream>().unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::InvalidInput);
    }

    #[test]
    fn config_wire_shape() {
        let mut config = RoutingConfig::default();
        config.routes.insert(Stream::Video, RouteEntry::new("bluetooth"));
        assert_eq!(
            serde_json::to_value(&config).unwrap(),
            json!({"routes": {"video": {"sink": "bluetooth"}}, "defaultSink": "hdmi"})
        );
    }

    #[test]
    fn config_accepts_plain_string_routes() {
        let config: RoutingConfig = serde_json::from_value(json!({
            "routes": {"spotify": "combine", "video": {"sink": "hdmi", "fallback": "other"}},
            "defaultSink": "hdmi"
        }))
        .unwrap();
        assert_eq!(config.route_for(Stream::Spotify), RouteEntry::new("combine"));
        assert_eq!(config.route_for(Stream::Video).fallback.as_deref(), Some("other"));
        assert_eq!(config.route_for(Stream::Sound), RouteEntry::new("hdmi"));
    }

    #[test]
    fn seed_skips_unknown_streams() {
        let mut seed = stageconf::RoutingConfig::default();
        seed.default_sink = "bluetooth".into();
        seed.routes.insert(
            "video".into(),
            stageconf::RouteSeed {
                sink: "combine".into(),
                fallback: Some("hdmi".into()),
            },
        );
        seed.routes.insert(
            "radio".into(),
            stageconf::RouteSeed {
                sink: "hdmi".into(),
                fallback: None,
            },
        );
        let config = RoutingConfig::from_seed(&seed);
        assert_eq!(config.default_sink, SinkType::Bluetooth);
        assert_eq!(config.routes.len(), 1);
        assert_eq!(config.route_for(Stream::Video).fallback.as_deref(), Some("hdmi"));
    }

    #[test]
    fn patterns_default_and_override() {
        let patterns = StreamPatterns::default();
        assert_eq!(patterns.pattern(Stream::Video), "vlc");
        assert_eq!(patterns.pattern(Stream::Sound), "pw-play");

        let mut streams = stageconf::bootstrap::default_streams();
        streams.insert("video".into(), "mpv".into());
        let patterns = StreamPatterns::from_config(&streams);
        assert_eq!(patterns.pattern(Stream::Video), "mpv");
    }
}
