//! Peercall CLI
//!
//! Runs the engine against in-memory collaborators, prints the quality
//! tables, and applies the opus parameter rewrite to description files.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use peercall_core::prelude::*;
use peercall_core::sdp::{apply_audio_codec_params, audio_codec_params};
use peercall_core::sim::{
    CaptureScript, MemoryHub, MemoryTransport, NetworkConditions, SimulatedCapture, SimulatedLinks,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    /// JSON engine configuration; defaults are used when absent
    #[arg(short, long, env = "PEERCALL_CONFIG", global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a caller and a callee against each other in memory
    Simulate {
        /// Media requested by the caller
        #[arg(long, value_enum, default_value = "audio-video")]
        mode: CliMediaMode,

        /// Network phases as `preset=seconds`, applied in order
        #[arg(long = "phase", value_parser = parse_phase, default_values = ["good=10", "very-poor=15", "good=20"])]
        phases: Vec<NetworkPhase>,

        /// Override the statistics check interval
        #[arg(long)]
        check_interval_ms: Option<u64>,

        /// The callee has no camera
        #[arg(long)]
        callee_without_camera: bool,
    },

    /// Print the audio and video quality tables
    Profiles {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },

    /// Rewrite the opus parameters of a session description
    ShapeSdp {
        /// Description file, `-` for stdin
        input: PathBuf,

        /// Audio level whose parameters are applied
        #[arg(long, conflicts_with = "params")]
        level: Option<usize>,

        /// Explicit parameter string
        #[arg(long)]
        params: Option<String>,
    },
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum CliMediaMode {
    AudioOnly,
    AudioVideo,
    ScreenShare,
}

impl From<CliMediaMode> for MediaMode {
    fn from(mode: CliMediaMode) -> Self {
        match mode {
            CliMediaMode::AudioOnly => MediaMode::AudioOnly,
            CliMediaMode::AudioVideo => MediaMode::AudioVideo,
            CliMediaMode::ScreenShare => MediaMode::ScreenShare,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum NetworkPreset {
    Good,
    Fair,
    Poor,
    VeryPoor,
}

impl NetworkPreset {
    fn conditions(self) -> NetworkConditions {
        let (rtt_ms, packet_loss, jitter_ms) = match self {
            Self::Good => (40.0, 0.0, 4.0),
            Self::Fair => (150.0, 0.012, 25.0),
            Self::Poor => (200.0, 0.025, 45.0),
            Self::VeryPoor => (450.0, 0.06, 80.0),
        };
        NetworkConditions {
            rtt_ms,
            packet_loss,
            jitter_ms,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct NetworkPhase {
    preset: NetworkPreset,
    duration: Duration,
}

fn parse_phase(s: &str) -> Result<NetworkPhase, String> {
    let (name, secs) = s
        .split_once('=')
        .ok_or_else(|| format!("expected preset=seconds, got '{s}'"))?;
    let preset = NetworkPreset::from_str(name, true)?;
    let secs: u64 = secs
        .parse()
        .map_err(|e| format!("invalid duration '{secs}': {e}"))?;
    Ok(NetworkPhase {
        preset,
        duration: Duration::from_secs(secs),
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("peercall=info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Simulate {
            mode,
            phases,
            check_interval_ms,
            callee_without_camera,
        } => {
            let mut config = config;
            if let Some(ms) = check_interval_ms {
                config.adaptive.check_interval_ms = ms;
            }
            handle_simulate(config, mode.into(), &phases, callee_without_camera).await?;
        }
        Commands::Profiles { json } => {
            handle_profiles(&config, json)?;
        }
        Commands::ShapeSdp {
            input,
            level,
            params,
        } => {
            handle_shape_sdp(&config, &input, level, params)?;
        }
    }

    Ok(())
}

fn load_config(path: Option<&Path>) -> Result<CallEngineConfig> {
    let Some(path) = path else {
        return Ok(CallEngineConfig::default());
    };
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading config {}", path.display()))?;
    let config: CallEngineConfig = serde_json::from_str(&text)
        .with_context(|| format!("parsing config {}", path.display()))?;
    config.validate()?;
    tracing::info!(path = %path.display(), "Loaded configuration");
    Ok(config)
}

struct SimParty {
    id: PeerIdentityString,
    engine: CallEngine<MemoryTransport>,
    links: Arc<SimulatedLinks>,
}

impl SimParty {
    fn new(
        hub: &MemoryHub,
        id: &str,
        remote: &PeerIdentityString,
        config: CallEngineConfig,
        script: CaptureScript,
    ) -> Result<Self> {
        let id = PeerIdentityString::new(id);
        let transport = Arc::new(hub.endpoint(id.clone()));
        let links = Arc::new(SimulatedLinks::new());
        links.connect(remote);
        let engine = CallEngine::builder(
            Arc::new(SignalingHandler::new(transport)),
            Arc::new(SimulatedCapture::new(script)),
            links.clone(),
        )
        .with_config(config)
        .build()?;
        Ok(Self { id, engine, links })
    }

    fn set_network(&self, remote: &PeerIdentityString, conditions: NetworkConditions) {
        if let Some(link) = self.links.get(remote) {
            link.set_network(conditions);
        }
    }
}

async fn handle_simulate(
    config: CallEngineConfig,
    mode: MediaMode,
    phases: &[NetworkPhase],
    callee_without_camera: bool,
) -> Result<()> {
    let hub = MemoryHub::new();
    let alice_id = PeerIdentityString::new("alice");
    let bob_id = PeerIdentityString::new("bob");
    let alice = SimParty::new(&hub, "alice", &bob_id, config.clone(), CaptureScript::default())?;
    let bob_script = CaptureScript {
        has_camera: !callee_without_camera,
        ..CaptureScript::default()
    };
    let bob = SimParty::new(&hub, "bob", &alice_id, config.clone(), bob_script)?;

    println!("📞 Simulating a {mode} call from {} to {}", alice.id, bob.id);
    println!(
        "   Check interval: {} ms | Phases: {}",
        config.adaptive.check_interval_ms,
        phases
            .iter()
            .map(|p| format!("{:?} {}s", p.preset, p.duration.as_secs()))
            .collect::<Vec<_>>()
            .join(", ")
    );

    let tasks: Vec<JoinHandle<()>> = vec![
        spawn_run_loop(alice.engine.clone()),
        spawn_run_loop(bob.engine.clone()),
        spawn_event_printer("alice", alice.engine.clone(), false),
        spawn_event_printer("bob", bob.engine.clone(), true),
    ];

    alice.engine.initiate_call(bob.id.clone(), mode).await?;

    for phase in phases {
        println!("🌐 Network: {:?} for {}s", phase.preset, phase.duration.as_secs());
        let conditions = phase.preset.conditions();
        alice.set_network(&bob.id, conditions);
        bob.set_network(&alice.id, conditions);
        tokio::time::sleep(phase.duration).await;
    }

    print_summary("alice", &alice.engine, &bob.id).await;
    print_summary("bob", &bob.engine, &alice.id).await;

    if alice.engine.phase().await != CallPhase::Idle {
        alice.engine.hang_up().await?;
    }
    // let the call-end reach the callee
    tokio::time::sleep(Duration::from_millis(200)).await;

    for task in tasks {
        task.abort();
    }
    println!("📞 Simulation finished");
    Ok(())
}

fn spawn_run_loop(engine: CallEngine<MemoryTransport>) -> JoinHandle<()> {
    tokio::spawn(async move {
        if let Err(e) = engine.run().await {
            tracing::error!(error = %e, "Signaling loop stopped");
        }
    })
}

fn spawn_event_printer(
    name: &'static str,
    engine: CallEngine<MemoryTransport>,
    auto_accept: bool,
) -> JoinHandle<()> {
    let mut events = engine.subscribe_events();
    tokio::spawn(async move {
        loop {
            let event = match events.recv().await {
                Ok(event) => event,
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Event printer lagged");
                    continue;
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            };
            print_event(name, &event);
            if auto_accept && matches!(event, CallEvent::Ringing { .. }) {
                println!("[{name}] ✅ Accepting call...");
                if let Err(e) = engine.accept_call().await {
                    println!("[{name}] ❌ Accept failed: {e}");
                }
            }
        }
    })
}

fn print_event(name: &str, event: &CallEvent<PeerIdentityString>) {
    match event {
        CallEvent::Requested { peer, mode } => println!("[{name}] 📤 Calling {peer} ({mode})"),
        CallEvent::Ringing { peer, mode } => println!("[{name}] 📞 Incoming {mode} call from {peer}"),
        CallEvent::Active { peer, role } => println!("[{name}] 🎥 Call with {peer} active as {role:?}"),
        CallEvent::Ended { peer, reason } => println!("[{name}] 📴 Call with {peer} ended: {reason:?}"),
        CallEvent::ProfileChanged {
            kind,
            level_name,
            index,
            ..
        } => println!("[{name}] 📶 {kind} profile -> {level_name} (level {index})"),
        CallEvent::Notice {
            severity, message, ..
        } => println!("[{name}] ⚠️  {severity:?}: {message}"),
    }
}

async fn print_summary(
    name: &str,
    engine: &CallEngine<MemoryTransport>,
    remote: &PeerIdentityString,
) {
    let Some(snapshot) = engine.quality_snapshot(remote).await else {
        println!("[{name}] No adaptive state");
        return;
    };
    let adaptive = &engine.config().adaptive;
    let audio = adaptive
        .audio_profiles
        .get(snapshot.audio_index)
        .map_or("?", |p| p.level_name.as_str());
    let video = adaptive
        .video_profiles
        .get(snapshot.video_index)
        .map_or("?", |p| p.level_name.as_str());
    println!(
        "[{name}] 📊 Audio: {audio} | Video: {video} | Negotiated: {}",
        snapshot.negotiated_codec_params.as_deref().unwrap_or("-")
    );
}

fn handle_profiles(config: &CallEngineConfig, json: bool) -> Result<()> {
    let adaptive = &config.adaptive;
    if json {
        let tables = serde_json::json!({
            "audio": adaptive.audio_profiles,
            "video": adaptive.video_profiles,
        });
        println!("{}", serde_json::to_string_pretty(&tables)?);
        return Ok(());
    }

    println!("Audio");
    for (index, profile) in adaptive.audio_profiles.iter().enumerate() {
        println!(
            "  {index}  {:<10} {:>7} bps  {}",
            profile.level_name, profile.max_bitrate_bps, profile.codec_params
        );
        if let Some(description) = &profile.description {
            println!("            {description}");
        }
    }
    println!("Video");
    for (index, profile) in adaptive.video_profiles.iter().enumerate() {
        println!(
            "  {index}  {:<10} {:>7} bps  {:>4} fps  1/{}",
            profile.level_name,
            profile.max_bitrate_bps,
            profile.max_frame_rate,
            profile.scale_resolution_down_by
        );
        if let Some(description) = &profile.description {
            println!("            {description}");
        }
    }
    Ok(())
}

fn handle_shape_sdp(
    config: &CallEngineConfig,
    input: &Path,
    level: Option<usize>,
    params: Option<String>,
) -> Result<()> {
    let sdp = if input == Path::new("-") {
        std::io::read_to_string(std::io::stdin()).context("reading stdin")?
    } else {
        std::fs::read_to_string(input).with_context(|| format!("reading {}", input.display()))?
    };

    let params = match (params, level) {
        (Some(params), _) => params,
        (None, level) => {
            let profiles = &config.adaptive.audio_profiles;
            let index = level.unwrap_or(2);
            match profiles.get(index) {
                Some(profile) => profile.codec_params.clone(),
                None => bail!(
                    "audio level {index} does not exist (0..={})",
                    profiles.top_index()
                ),
            }
        }
    };

    let shaped = apply_audio_codec_params(&sdp, &params);
    if audio_codec_params(&shaped).is_none() {
        tracing::warn!("Description carries no opus payload, printed unchanged");
    }
    print!("{shaped}");
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn phases_parse_presets_and_seconds() {
        let phase = parse_phase("very-poor=15").unwrap();
        assert_eq!(phase.preset, NetworkPreset::VeryPoor);
        assert_eq!(phase.duration, Duration::from_secs(15));
    }

    #[test]
    fn malformed_phases_are_rejected() {
        assert!(parse_phase("good").is_err());
        assert!(parse_phase("stormy=3").is_err());
        assert!(parse_phase("good=soon").is_err());
    }

    #[test]
    fn presets_are_progressively_worse() {
        let good = NetworkPreset::Good.conditions();
        let very_poor = NetworkPreset::VeryPoor.conditions();
        assert!(good.rtt_ms < very_poor.rtt_ms);
        assert!(good.packet_loss < very_poor.packet_loss);
    }

    #[test]
    fn cli_accepts_repeated_phases() {
        let cli = Cli::try_parse_from([
            "peercall",
            "simulate",
            "--phase",
            "good=1",
            "--phase",
            "poor=2",
            "--check-interval-ms",
            "250",
        ])
        .unwrap();
        match cli.command {
            Commands::Simulate {
                phases,
                check_interval_ms,
                ..
            } => {
                assert_eq!(phases.len(), 2);
                assert_eq!(check_interval_ms, Some(250));
            }
            _ => unreachable!(),
        }
    }

    #[test]
    fn missing_config_path_gives_defaults() {
        assert_eq!(load_config(None).unwrap(), CallEngineConfig::default());
    }
}
