//! stagehand - audio routing control plane for unattended show installations
//!
//! Subcommands:
//! - `stagehand serve` - Run the sink monitor and print events as JSON lines
//! - `stagehand sinks` - List audio outputs
//! - `stagehand route ...` - Inspect, change and apply stream routes
//! - `stagehand volume ...` - Read or set a stream's volume
//! - `stagehand combine` - Hold the all-speakers combine sink up
//! - `stagehand duck ...` - Inspect ducking rules
//! - `stagehand bt ...` - Bluetooth adapter, scanning and pairing
//! - `stagehand config` - Print the effective configuration

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};

mod commands;

#[derive(Parser)]
#[command(name = "stagehand")]
#[command(about = "Audio routing control plane for show installations")]
#[command(version)]
struct Cli {
    /// Config file (replaces ./stagehand.toml in the search order)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Keep routing changes in memory only
    #[arg(long, global = true)]
    ephemeral: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the sink monitor until interrupted, printing events as JSON lines
    Serve,

    /// List audio outputs
    Sinks {
        /// Only sinks of this type (hdmi, bluetooth, combine, other)
        #[arg(short = 't', long = "type")]
        sink_type: Option<String>,
    },

    /// Stream routing
    Route {
        #[command(subcommand)]
        action: RouteAction,
    },

    /// Stream volume
    Volume {
        #[command(subcommand)]
        action: VolumeAction,
    },

    /// Create the all-speakers combine sink and hold it until interrupted
    Combine,

    /// Ducking rules
    Duck {
        #[command(subcommand)]
        action: DuckAction,
    },

    /// Bluetooth adapter and devices
    Bt {
        #[command(subcommand)]
        action: BtAction,
    },

    /// Print the effective configuration as TOML
    Config,
}

#[derive(Subcommand)]
enum RouteAction {
    /// Show the route table and live sinks
    Status,

    /// Show the sink a stream is routed to
    Get { stream: String },

    /// Route a stream to a sink type or sink name
    Set {
        stream: String,
        sink: String,

        /// Explicit fallback used by `route apply --with-fallback`
        #[arg(long)]
        fallback: Option<String>,
    },

    /// Clear a stream's explicit fallback
    ClearFallback { stream: String },

    /// Set the sink type used by unrouted streams
    Default { sink_type: String },

    /// Move a playing stream to its routed sink
    Apply {
        stream: String,

        /// Use the route's explicit fallback instead of the default type
        #[arg(long)]
        with_fallback: bool,
    },
}

#[derive(Subcommand)]
enum VolumeAction {
    Get { stream: String },
    Set { stream: String, percent: i64 },
}

#[derive(Subcommand)]
enum DuckAction {
    /// List the configured rules
    Rules,

    /// Show the level each target would be ducked to with these sources active
    Check { active: Vec<String> },
}

#[derive(Subcommand)]
enum BtAction {
    /// Adapter power and discovery state
    Status,
    /// Paired devices
    Paired,
    /// Connected devices
    Connected,
    /// Device details
    Info { address: String },
    /// Passive scan for nearby devices
    Scan,
    /// Pair, trust and connect a device
    Pair { address: String },
    Connect { address: String },
    Disconnect { address: String },
    /// Forget a paired device
    Remove { address: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = stageconf::StageConfig::load_from(cli.config.as_deref())?;

    stagehand::telemetry::init(&config.infra.telemetry.log_level)?;

    let stage = commands::build_stage(&config, cli.ephemeral)?;

    match cli.command {
        Commands::Serve => commands::serve(&stage).await?,
        Commands::Sinks { sink_type } => commands::sinks(&stage, sink_type.as_deref()).await?,
        Commands::Route { action } => match action {
            RouteAction::Status => commands::print_json(&stage.routing.get_status().await)?,
            RouteAction::Get { stream } => println!("{}", stage.routing.get_route(&stream).await?),
            RouteAction::Set {
                stream,
                sink,
                fallback,
            } => {
                stage.routing.set_route(&stream, &sink).await?;
                if let Some(fallback) = fallback {
                    stage
                        .routing
                        .set_route_fallback(&stream, Some(&fallback))
                        .await?;
                }
            }
            RouteAction::ClearFallback { stream } => {
                stage.routing.set_route_fallback(&stream, None).await?
            }
            RouteAction::Default { sink_type } => {
                stage.routing.set_default_sink(&sink_type).await?
            }
            RouteAction::Apply {
                stream,
                with_fallback,
            } => commands::apply(&stage, &stream, with_fallback).await?,
        },
        Commands::Volume { action } => match action {
            VolumeAction::Get { stream } => {
                println!("{}%", stage.routing.get_stream_volume(&stream).await?)
            }
            VolumeAction::Set { stream, percent } => {
                stage.routing.set_stream_volume(&stream, percent).await?
            }
        },
        Commands::Combine => commands::combine(&stage).await?,
        Commands::Duck { action } => match action {
            DuckAction::Rules => commands::print_json(&stage.ducking.rules())?,
            DuckAction::Check { active } => commands::duck_check(&stage, &active)?,
        },
        Commands::Bt { action } => commands::bluetooth(&stage, action).await?,
        Commands::Config => print!("{}", config.to_toml()),
    }

    Ok(())
}
