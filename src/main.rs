//! returnfeed-bridge daemon
//!
//! Usage:
//!   returnfeed-bridge [run]                       tally bridge + relay (default)
//!   returnfeed-bridge stream --source screen --name pd_1
//!   returnfeed-bridge stream --source "ndi:STUDIO (vMix - Output 1)" --user pd --address desk3
//!   returnfeed-bridge sources [--preview <name>] [--proxy]
//!   returnfeed-bridge paths
//!
//! Ctrl-C stops everything gracefully.

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::{Parser, Subcommand};
use env_logger::Env;
use log::{debug, error, info, warn};
use tokio::sync::{mpsc, watch};

use returnfeed_bridge::config::{Settings, DEFAULT_SETTINGS_PATH};
use returnfeed_bridge::ndi::{self, BandwidthMode, NdiReceiver, ReceiverConfig, ReceiverEvent, SimulatorContext};
use returnfeed_bridge::relay::{self, RelayConfig, RelayEvent, RelayService};
use returnfeed_bridge::stream::ffmpeg::ffmpeg_available;
use returnfeed_bridge::stream::{
    generate_stream_key, generate_unique_address, parse_bitrate, EncoderProfile, LatencyMode, LatencyPreset, MediaMtxClient,
    MediaMtxEndpoint, NetworkMonitor, StreamEvent, StreamParams, StreamSource, StreamSupervisor,
};
use returnfeed_bridge::tally::{self, BridgeConfig, BridgeEvent, NotifierConfig, VmixHttpFetcher};
use returnfeed_bridge::{crash, SettingsStore};

type BoxError = Box<dyn std::error::Error>;

/// How often a running stream logs its statistics
const STATS_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Parser)]
#[command(name = "returnfeed-bridge", version, about = "ReturnFeed tally relay, SRT streamer and NDI preview")]
struct Cli {
    /// Settings file (created with defaults if missing)
    #[arg(long, default_value = DEFAULT_SETTINGS_PATH)]
    config: PathBuf,

    /// Log filter when RUST_LOG is unset
    #[arg(long, default_value = "info")]
    log_level: String,

    /// vMix host (overrides vmix.default_ip)
    #[arg(long)]
    vmix_host: Option<String>,

    /// Relay WebSocket URL (overrides server.websocket_url)
    #[arg(long)]
    relay_url: Option<String>,

    /// Do not connect to the relay server
    #[arg(long)]
    no_relay: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Relay vMix tally to the ReturnFeed server
    Run,
    /// Publish a source to MediaMTX over SRT
    Stream {
        /// `screen` or `ndi:<source name>`
        #[arg(long)]
        source: String,
        /// Stream name; generated from --user/--address when omitted
        #[arg(long)]
        name: Option<String>,
        #[arg(long, default_value = "pd")]
        user: String,
        /// Desk address; a random 8-character id when omitted
        #[arg(long)]
        address: Option<String>,
        /// e.g. `2M`, `2500k`
        #[arg(long)]
        bitrate: Option<String>,
        #[arg(long)]
        fps: Option<u32>,
        /// x264, nvenc, qsv, amf, videotoolbox
        #[arg(long)]
        encoder: Option<String>,
        /// Milliseconds or `adaptive`
        #[arg(long)]
        latency: Option<String>,
        #[arg(long, default_value = "ffmpeg")]
        ffmpeg: String,
    },
    /// List NDI sources, optionally previewing one
    Sources {
        #[arg(long, default_value_t = 2)]
        timeout_secs: u64,
        /// Receive this source and log its statistics
        #[arg(long)]
        preview: Option<String>,
        /// Request the low-bandwidth proxy stream
        #[arg(long)]
        proxy: bool,
        #[arg(long, default_value_t = 0)]
        frame_skip: u32,
    },
    /// List MediaMTX paths
    Paths,
}

fn main() -> ExitCode {
    let mut cli = Cli::parse();
    env_logger::Builder::from_env(Env::default().default_filter_or(cli.log_level.as_str())).init();
    crash::install("logs");

    let store = match SettingsStore::load(&cli.config) {
        Ok(store) => store,
        Err(e) => {
            error!("[Config] {}", e);
            return ExitCode::FAILURE;
        }
    };
    let settings = store.settings().clone();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    if let Err(e) = ctrlc::set_handler(move || {
        info!("Shutdown requested");
        let _ = shutdown_tx.send(true);
    }) {
        warn!("Failed to install Ctrl-C handler: {}", e);
    }

    let command = cli.command.take().unwrap_or(Command::Run);
    let result = match command {
        Command::Sources {
            timeout_secs,
            preview,
            proxy,
            frame_skip,
        } => list_sources(Duration::from_secs(timeout_secs), preview, proxy, frame_skip, &shutdown_rx),
        command => match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
            Ok(runtime) => runtime.block_on(run_async(command, &cli, &settings, shutdown_rx)),
            Err(e) => Err(e.into()),
        },
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run_async(command: Command, cli: &Cli, settings: &Settings, shutdown: watch::Receiver<bool>) -> Result<(), BoxError> {
    match command {
        Command::Run => run_bridge(cli, settings, shutdown).await,
        Command::Stream {
            source,
            name,
            user,
            address,
            bitrate,
            fps,
            encoder,
            latency,
            ffmpeg,
        } => {
            let params = stream_params(settings, &source, bitrate, fps, encoder, latency)?;
            let address = address.unwrap_or_else(|| {
                let address = generate_unique_address();
                info!("[Stream] Unique address {}", address);
                address
            });
            let name = name.unwrap_or_else(|| generate_stream_key(&user, &address));
            run_stream(cli, settings, params, &name, &user, &address, &ffmpeg, shutdown).await
        }
        Command::Paths => list_paths(settings).await,
        Command::Sources { .. } => Ok(()),
    }
}

fn endpoint(settings: &Settings) -> MediaMtxEndpoint {
    MediaMtxEndpoint {
        srt_port: settings.server.media_mtx_srt_port,
        api_port: settings.server.media_mtx_api_port,
        ..MediaMtxEndpoint::new(settings.server.media_mtx_server.as_str())
    }
}

/// Spawn the relay client unless disabled; its events are logged.
fn start_relay(cli: &Cli, settings: &Settings) -> Option<RelayService> {
    if cli.no_relay {
        info!("[Relay] Disabled by --no-relay");
        return None;
    }

    let url = cli
        .relay_url
        .clone()
        .unwrap_or_else(|| settings.server.websocket_url.clone());
    let (events_tx, mut events_rx) = mpsc::channel(64);
    let service = relay::spawn(RelayConfig::new(url), events_tx);

    // ends once the client task drops its event sender
    tokio::spawn(async move {
        while let Some(event) = events_rx.recv().await {
            match event {
                RelayEvent::Connecting => debug!("[Relay] Connecting"),
                RelayEvent::Connected => info!("[Relay] Online"),
                RelayEvent::Disconnected(reason) => warn!("[Relay] Offline: {}", reason),
                RelayEvent::Received(message) => debug!("[Relay] Received {:?}", message.kind),
            }
        }
    });

    Some(service)
}

async fn run_bridge(cli: &Cli, settings: &Settings, mut shutdown: watch::Receiver<bool>) -> Result<(), BoxError> {
    let host = cli.vmix_host.clone().unwrap_or_else(|| settings.vmix.default_ip.clone());
    info!(
        "[Tally] vMix at {} (tcp {}, http {})",
        host, settings.vmix.default_tcp_port, settings.vmix.default_http_port
    );

    let relay = start_relay(cli, settings);

    let notifier = NotifierConfig {
        reconnect_delay: settings.tally.reconnect_delay(),
        ..NotifierConfig::new(host.as_str(), settings.vmix.default_tcp_port)
    };
    let fetcher = VmixHttpFetcher::new(
        &host,
        settings.vmix.default_http_port,
        &settings.tally.api_path,
        settings.tally.fetch_timeout(),
    );
    let config = BridgeConfig {
        debounce: settings.tally.debounce(),
    };

    let (events_tx, mut events) = mpsc::channel(64);
    let handle = tally::spawn(
        notifier,
        fetcher,
        config,
        relay.as_ref().map(RelayService::handle),
        events_tx,
    );

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(BridgeEvent::Connection(status)) => info!("[Tally] vMix {:?}", status),
                Some(BridgeEvent::Inputs(state)) => {
                    let names: Vec<String> = state.inputs.values().map(|i| format!("{}:{}", i.number, i.name)).collect();
                    info!("[Tally] Inputs {}", names.join(", "));
                }
                Some(BridgeEvent::Tally(state)) => {
                    let name = |n: u32| state.inputs.get(&n).map(|i| i.name.clone()).unwrap_or_default();
                    info!("[Tally] PGM {} {} | PVW {} {}", state.program, name(state.program), state.preview, name(state.preview));
                }
                Some(BridgeEvent::FetchFailed(reason)) => warn!("[Tally] Fetch failed: {}", reason),
                None => break,
            },
            _ = shutdown.changed() => break,
        }
    }

    handle.stop().await;
    if let Some(relay) = relay {
        relay.stop().await;
    }
    info!("Stopped");
    Ok(())
}

fn stream_params(
    settings: &Settings,
    source: &str,
    bitrate: Option<String>,
    fps: Option<u32>,
    encoder: Option<String>,
    latency: Option<String>,
) -> Result<StreamParams, BoxError> {
    let defaults = &settings.streaming;
    let encoder = match encoder {
        Some(name) => EncoderProfile::from_name(&name).ok_or_else(|| format!("unknown encoder {:?}", name))?,
        None => EncoderProfile::X264 {
            preset: defaults.preset.clone(),
            tune: defaults.tune.clone(),
        },
    };
    let latency = match latency.as_deref() {
        Some("adaptive") => LatencyMode::Adaptive,
        Some(ms) => LatencyMode::Manual(ms.parse().map_err(|_| format!("invalid latency {:?}", ms))?),
        None if settings.network.adaptive_latency => LatencyMode::Adaptive,
        None => LatencyMode::Manual(settings.network.manual_latency_ms),
    };

    let params = StreamParams {
        bitrate_kbps: parse_bitrate(bitrate.as_deref().unwrap_or(&defaults.default_bitrate))?,
        fps: fps.unwrap_or(defaults.default_fps),
        encoder,
        latency,
        ..StreamParams::new(StreamSource::parse(source)?)
    };
    params.validate()?;
    Ok(params)
}

#[allow(clippy::too_many_arguments)]
async fn run_stream(
    cli: &Cli,
    settings: &Settings,
    params: StreamParams,
    name: &str,
    user: &str,
    address: &str,
    ffmpeg: &str,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), BoxError> {
    if !ffmpeg_available(ffmpeg).await {
        warn!("[Stream] {} -version failed; start will likely fail", ffmpeg);
    }

    let endpoint = endpoint(settings);
    let relay = start_relay(cli, settings);
    if let Some(relay) = &relay {
        relay.handle().send_auth_info(user, address);
    }

    let monitor = if params.latency == LatencyMode::Adaptive {
        let preset = LatencyPreset::from_name(&settings.network.latency_preset).unwrap_or(LatencyPreset::Regional);
        Some(NetworkMonitor::spawn(endpoint.clone(), preset))
    } else {
        None
    };

    let (events_tx, mut events) = mpsc::channel(64);
    let mut supervisor = StreamSupervisor::new(ffmpeg, endpoint.clone(), events_tx);
    if let Some(relay) = &relay {
        supervisor = supervisor.with_relay(relay.handle());
    }
    if let Some(monitor) = &monitor {
        supervisor = supervisor.with_network_monitor(monitor.subscribe());
    }

    let session = match supervisor.start(params, name).await {
        Ok(session) => session,
        Err(e) => {
            if let Some(monitor) = monitor {
                monitor.stop().await;
            }
            if let Some(relay) = relay {
                relay.stop().await;
            }
            return Err(e.into());
        }
    };
    info!("[Stream] Publishing to {}", session.srt_url);
    info!("[Stream] Playback: {}", endpoint.read_url(name));

    let mut ticker = tokio::time::interval(STATS_INTERVAL);
    ticker.tick().await;

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(StreamEvent::Started { stream_name }) => info!("[Stream] {} started", stream_name),
                Some(StreamEvent::Error(message)) => warn!("[Stream] {}", message),
                Some(StreamEvent::Exited { code, requested, .. }) => {
                    if !requested {
                        error!("[Stream] FFmpeg exited with {:?}", code);
                    }
                    break;
                }
                None => break,
            },
            _ = ticker.tick() => {
                if let Some(stats) = supervisor.stats() {
                    info!(
                        "[Stream] frame={} fps={:.1} bitrate={} speed={} dropped={}",
                        stats.frames,
                        stats.fps,
                        stats.bitrate_kbps.map(|b| format!("{:.0}kbps", b)).unwrap_or_else(|| "-".to_string()),
                        stats.speed.map(|s| format!("{:.2}x", s)).unwrap_or_else(|| "-".to_string()),
                        stats.dropped
                    );
                }
                if let Err(e) = supervisor.verify_active().await {
                    debug!("[Stream] Server check failed: {}", e);
                }
            }
            _ = shutdown.changed() => break,
        }
    }

    if let Some(stats) = supervisor.stop().await {
        info!("[Stream] Final: {} frames, {} dropped", stats.frames, stats.dropped);
    }
    drop(supervisor);
    if let Some(monitor) = monitor {
        monitor.stop().await;
    }
    if let Some(relay) = relay {
        relay.stop().await;
    }
    Ok(())
}

async fn list_paths(settings: &Settings) -> Result<(), BoxError> {
    let client = MediaMtxClient::new(endpoint(settings));
    let paths = client.list_paths().await?;
    if paths.is_empty() {
        println!("No active paths on {}", client.endpoint().server);
    }
    for path in paths {
        println!(
            "{:<40} ready={} readers={} rx={} tx={}",
            path.name,
            path.ready,
            path.reader_count(),
            path.bytes_received,
            path.bytes_sent
        );
    }
    Ok(())
}

fn list_sources(
    timeout: Duration,
    preview: Option<String>,
    proxy: bool,
    frame_skip: u32,
    shutdown: &watch::Receiver<bool>,
) -> Result<(), BoxError> {
    let provider = ndi::default_provider(SimulatorContext::new());
    let sources = provider.discover(timeout)?;
    if sources.is_empty() {
        println!("No NDI sources found");
    }
    for (i, source) in sources.iter().enumerate() {
        println!("  {}. {}", i + 1, source);
    }

    let Some(name) = preview else {
        return Ok(());
    };

    let config = ReceiverConfig {
        bandwidth: if proxy { BandwidthMode::Lowest } else { BandwidthMode::Highest },
        frame_skip,
        ..Default::default()
    };
    let (mut receiver, events) = NdiReceiver::start(provider, &name, config)?;
    let mut last_report = std::time::Instant::now();

    while !*shutdown.borrow() {
        match events.recv_timeout(Duration::from_millis(200)) {
            Ok(ReceiverEvent::Frame(frame)) => {
                if last_report.elapsed() >= Duration::from_secs(1) {
                    last_report = std::time::Instant::now();
                    info!(
                        "[NDI] {} {} fps {} audio {:.1} dB",
                        frame.resolution, frame.fps, frame.bitrate, frame.audio_level_db
                    );
                }
            }
            Ok(ReceiverEvent::Error(message)) => warn!("[NDI] {}", message),
            Ok(ReceiverEvent::Stopped) => break,
            Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {}
            Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => break,
        }
    }

    receiver.stop();
    info!("[NDI] Preview stats: {:?}", receiver.stats());
    Ok(())
}
