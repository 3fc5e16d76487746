//! Ducking episodes against an in-memory volume backend.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use pretty_assertions::assert_eq;
use stagehand::ducking::{DuckingEngine, DuckingRule, Lifecycle};
use stagehand::routing::{Stream, StreamVolume};
use stagehand::{EventBus, Result, StageError, StageEvent};

#[derive(Default)]
struct FakeVolume {
    levels: Mutex<HashMap<Stream, u8>>,
    history: Mutex<Vec<(Stream, u8)>>,
}

impl FakeVolume {
    fn with(stream: Stream, level: u8) -> Arc<Self> {
        let fake = Self::default();
        fake.levels.lock().unwrap().insert(stream, level);
        Arc::new(fake)
    }

    fn level(&self, stream: Stream) -> Option<u8> {
        self.levels.lock().unwrap().get(&stream).copied()
    }

    fn history(&self) -> Vec<(Stream, u8)> {
        self.history.lock().unwrap().clone()
    }
}

#[async_trait]
impl StreamVolume for FakeVolume {
    async fn set_volume(&self, stream: Stream, percent: u8) -> Result<()> {
        self.levels.lock().unwrap().insert(stream, percent);
        self.history.lock().unwrap().push((stream, percent));
        Ok(())
    }

    async fn volume(&self, stream: Stream) -> Result<u8> {
        self.level(stream)
            .ok_or_else(|| StageError::NoActiveSinkInput(stream.to_string()))
    }
}

fn rule(when: Stream, duck: Stream, to: u8) -> DuckingRule {
    DuckingRule {
        when,
        duck,
        to,
        fade_ms: 0,
    }
}

fn engine(volume: Arc<FakeVolume>, bus: EventBus) -> DuckingEngine {
    let engine = DuckingEngine::new(volume, bus);
    engine.load_rules(vec![
        rule(Stream::Video, Stream::Spotify, 20),
        rule(Stream::Sound, Stream::Spotify, 40),
    ]);
    engine
}

#[tokio::test]
async fn test_overlapping_sources_use_minimum_then_restore() {
    let volume = FakeVolume::with(Stream::Spotify, 80);
    let bus = EventBus::default();
    let mut events = bus.subscribe();
    let ducking = engine(volume.clone(), bus);

    ducking.handle_event(Stream::Video, Lifecycle::Started);
    ducking.settle().await;
    assert_eq!(volume.level(Stream::Spotify), Some(20));

    ducking.handle_event(Stream::Sound, Lifecycle::Started);
    ducking.settle().await;
    assert_eq!(volume.level(Stream::Spotify), Some(20));

    ducking.handle_event(Stream::Video, Lifecycle::Completed);
    ducking.settle().await;
    assert_eq!(volume.level(Stream::Spotify), Some(40));

    ducking.handle_event(Stream::Sound, Lifecycle::Completed);
    ducking.settle().await;
    assert_eq!(volume.level(Stream::Spotify), Some(80));

    let levels: Vec<u8> = volume.history().into_iter().map(|(_, v)| v).collect();
    assert_eq!(levels, vec![20, 20, 40, 80]);

    let mut last = None;
    while let Ok(event) = events.try_recv() {
        last = Some(event);
    }
    assert_eq!(
        last,
        Some(StageEvent::DuckingChanged {
            target: "spotify".into(),
            ducked: false,
            active_sources: vec![],
            volume: 80,
            restore_volume: 80,
        })
    );
    assert!(!ducking.state(Stream::Spotify).ducked);
    assert_eq!(ducking.state(Stream::Spotify).pre_duck_volume, None);
}

#[tokio::test]
async fn test_queued_events_run_in_order() {
    let volume = FakeVolume::with(Stream::Spotify, 65);
    let ducking = engine(volume.clone(), EventBus::default());

    ducking.handle_event(Stream::Video, Lifecycle::Started);
    ducking.handle_event(Stream::Sound, Lifecycle::Started);
    ducking.handle_event(Stream::Video, Lifecycle::Paused);
    ducking.handle_event(Stream::Sound, Lifecycle::Completed);
    ducking.settle().await;

    assert_eq!(volume.level(Stream::Spotify), Some(65));
    assert_eq!(volume.history().last(), Some(&(Stream::Spotify, 65)));
}

#[tokio::test]
async fn test_repeated_start_does_not_recapture() {
    let volume = FakeVolume::with(Stream::Spotify, 90);
    let ducking = engine(volume.clone(), EventBus::default());

    ducking.handle_event(Stream::Video, Lifecycle::Started);
    ducking.settle().await;
    ducking.handle_event(Stream::Video, Lifecycle::Resumed);
    ducking.settle().await;

    let snapshot = ducking.state(Stream::Spotify);
    assert_eq!(snapshot.active_sources, vec![Stream::Video]);
    assert_eq!(snapshot.pre_duck_volume, Some(90));
    assert_eq!(volume.history(), vec![(Stream::Spotify, 20)]);

    ducking.handle_event(Stream::Video, Lifecycle::Completed);
    ducking.settle().await;
    assert_eq!(volume.level(Stream::Spotify), Some(90));
}

#[tokio::test]
async fn test_failed_capture_restores_to_full() {
    let volume = Arc::new(FakeVolume::default());
    let ducking = engine(volume.clone(), EventBus::default());

    ducking.handle_event(Stream::Video, Lifecycle::Started);
    ducking.settle().await;
    assert_eq!(ducking.state(Stream::Spotify).pre_duck_volume, None);

    ducking.handle_event(Stream::Video, Lifecycle::Completed);
    ducking.settle().await;

    assert_eq!(
        volume.history(),
        vec![(Stream::Spotify, 20), (Stream::Spotify, 100)]
    );
}

#[tokio::test]
async fn test_sources_without_rules_are_ignored() {
    let volume = FakeVolume::with(Stream::Video, 70);
    let ducking = engine(volume.clone(), EventBus::default());

    ducking.handle_event(Stream::Spotify, Lifecycle::Started);
    ducking.settle().await;

    assert!(volume.history().is_empty());
    assert!(!ducking.state(Stream::Video).ducked);
}

#[tokio::test]
async fn test_load_rules_forgets_live_state() {
    let volume = FakeVolume::with(Stream::Spotify, 80);
    let ducking = engine(volume.clone(), EventBus::default());

    ducking.handle_event(Stream::Video, Lifecycle::Started);
    ducking.settle().await;
    assert!(ducking.state(Stream::Spotify).ducked);

    ducking.load_rules(vec![rule(Stream::Video, Stream::Sound, 10)]);

    assert!(!ducking.state(Stream::Spotify).ducked);
    assert_eq!(ducking.rules(), vec![rule(Stream::Video, Stream::Sound, 10)]);
}
