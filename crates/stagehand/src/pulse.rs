//! Typed wrapper over the audio server CLI (`pactl`).

use std::sync::{Arc, LazyLock};
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{Result, StageError};
use crate::process::{CommandRunner, SupervisedChild};

static VOLUME_PERCENT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d+)%").expect("static regex"));

static PROPERTY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"^\s*([\w.]+)\s*=\s*"(.*)"\s*$"#).expect("static regex"));

/// One application stream as reported by `pactl list sink-inputs`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SinkInput {
    pub index: u32,
    pub sink: Option<String>,
    pub volume_percent: Option<u8>,
    pub application_name: Option<String>,
    pub binary: Option<String>,
}

impl SinkInput {
    fn new(index: u32) -> Self {
        Self {
            index,
            sink: None,
            volume_percent: None,
            application_name: None,
            binary: None,
        }
    }

    /// Case-insensitive substring match on the application name or binary.
    pub fn matches(&self, pattern: &str) -> bool {
        let pattern = pattern.to_lowercase();
        [&self.application_name, &self.binary]
            .into_iter()
            .flatten()
            .any(|value| value.to_lowercase().contains(&pattern))
    }
}

/// Parse the block format of `pactl list sink-inputs`.
///
/// Blocks start at `Sink Input #<n>`; anything before the first header or
/// inside a block we don't understand is ignored.
pub fn parse_sink_inputs(output: &str) -> Vec<SinkInput> {
    let mut inputs = Vec::new();
    let mut current: Option<SinkInput> = None;

    for line in output.lines() {
        if let Some(rest) = line.trim().strip_prefix("Sink Input #") {
            if let Some(done) = current.take() {
                inputs.push(done);
            }
            current = rest.trim().parse().ok().map(SinkInput::new);
            continue;
        }

        let Some(input) = current.as_mut() else {
            continue;
        };

        let trimmed = line.trim();
        if let Some(sink) = trimmed.strip_prefix("Sink:") {
            input.sink = Some(sink.trim().to_string());
        } else if trimmed.starts_with("Volume:") {
            input.volume_percent = VOLUME_PERCENT
                .captures(trimmed)
                .and_then(|c| c[1].parse::<u32>().ok())
                .map(|v| v.min(u8::MAX as u32) as u8);
        } else if let Some(caps) = PROPERTY.captures(line) {
            match &caps[1] {
                "application.name" => input.application_name = Some(caps[2].to_string()),
                "application.process.binary" => input.binary = Some(caps[2].to_string()),
                _ => {}
            }
        }
    }

    if let Some(done) = current {
        inputs.push(done);
    }
    inputs
}

/// `pactl` invocations used by the control plane.
#[derive(Clone)]
pub struct PulseCli {
    runner: Arc<dyn CommandRunner>,
    program: String,
    timeout: Duration,
}

impl PulseCli {
    pub fn new(runner: Arc<dyn CommandRunner>, program: impl Into<String>, timeout: Duration) -> Self {
        Self {
            runner,
            program: program.into(),
            timeout,
        }
    }

    async fn run(&self, args: &[&str]) -> Result<String> {
        self.runner.run(&self.program, args, self.timeout).await
    }

    /// Raw tab-delimited `list short sinks` output.
    pub async fn list_short_sinks(&self) -> Result<String> {
        self.run(&["list", "short", "sinks"]).await
    }

    pub async fn list_sink_inputs(&self) -> Result<Vec<SinkInput>> {
        let output = self.run(&["list", "sink-inputs"]).await?;
        Ok(parse_sink_inputs(&output))
    }

    pub async fn move_sink_input(&self, index: u32, sink: &str) -> Result<()> {
        self.run(&["move-sink-input", &index.to_string(), sink])
            .await
            .map(|_| ())
    }

    pub async fn set_sink_input_volume(&self, index: u32, percent: u8) -> Result<()> {
        let volume = format!("{}%", percent.min(100));
        self.run(&["set-sink-input-volume", &index.to_string(), &volume])
            .await
            .map(|_| ())
    }

    /// Load a null sink and return its module id.
    pub async fn load_null_sink(&self, sink_name: &str, description: &str) -> Result<String> {
        let name_arg = format!("sink_name={}", sink_name);
        let props_arg = format!("sink_properties=device.description={}", description);
        let output = self
            .run(&["load-module", "module-null-sink", &name_arg, &props_arg])
            .await?;

        let module_id = output.trim().to_string();
        if module_id.is_empty() {
            return Err(StageError::CommandFailed {
                program: self.program.clone(),
                message: "load-module returned no module id".to_string(),
            });
        }
        Ok(module_id)
    }

    pub async fn unload_module(&self, module_id: &str) -> Result<()> {
        self.run(&["unload-module", module_id]).await.map(|_| ())
    }

    /// Start the live change-event stream.
    pub fn subscribe(&self) -> Result<SupervisedChild> {
        self.runner.spawn(&self.program, &["subscribe"])
    }
}
