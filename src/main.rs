use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use tokio::signal::unix::{signal, SignalKind};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use kvm_agent::media::{GstSettings, MediaSource, MonitorSettings, VideoSettings};
use kvm_agent::session::{Session, SessionSettings};
use kvm_agent::speech::SpeechSettings;

/// Log level for the agent
#[derive(Debug, Clone, Copy, Default, ValueEnum)]
enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

const BUILD_INFO: &str = concat!(
    "kvm-agent ",
    env!("CARGO_PKG_VERSION"),
    " (built ",
    env!("BUILD_DATE"),
    ")"
);

/// kvm-agent command line arguments
#[derive(Parser, Debug)]
#[command(name = "kvm-agent")]
#[command(version, long_version = BUILD_INFO)]
#[command(about = "KVM-over-IP endpoint agent", long_about = None)]
struct CliArgs {
    /// Device serial number
    #[arg(long, value_name = "ID")]
    id: String,

    /// MQTT broker url (mqtt:// or mqtts://)
    #[arg(long, value_name = "URL")]
    mqtt_url: Option<String>,

    /// Backend url used for OAuth and the response/speech WebSockets
    #[arg(long, value_name = "URL")]
    ws_url: Option<String>,

    /// OAuth client id
    #[arg(long, value_name = "ID", default_value = "device")]
    client_id: String,

    /// Token cache file
    #[arg(long, value_name = "FILE", default_value = "/etc/kvm-agent/config.json")]
    config_path: PathBuf,

    /// Media source: 1 framed-socket encoder, 2 gstreamer pipeline
    #[arg(long, value_name = "N", default_value_t = 1)]
    media_source: u32,

    /// Capture device
    #[arg(long, value_name = "DEV", default_value = "/dev/video0")]
    video_path: String,

    /// Encoder binary
    #[arg(long, value_name = "FILE", default_value = "/root/video")]
    video_bin_path: String,

    /// Encoder output socket
    #[arg(long, value_name = "SOCK", default_value = "/var/run/capture.sock")]
    video_socket_path: String,

    /// HDMI monitor binary
    #[arg(long, value_name = "FILE", default_value = "/root/monitor")]
    monitor_bin_path: String,

    /// Monitor output socket
    #[arg(long, value_name = "SOCK", default_value = "/var/run/monitor.sock")]
    monitor_socket_path: String,

    /// HID gadget device
    #[arg(long, value_name = "DEV", default_value = "/dev/hidg0")]
    hid_path: String,

    /// File naming the bound USB device controller (for the status probe)
    #[arg(long, value_name = "FILE", default_value = "")]
    hid_udc_path: String,

    /// Speech capture binary; speech stays off when unset
    #[arg(long, value_name = "FILE")]
    speech_bin_path: Option<String>,

    /// Speech capture socket
    #[arg(long, value_name = "SOCK", default_value = "/var/run/speech.sock")]
    speech_socket_path: String,

    /// ALSA capture device for speech
    #[arg(long, value_name = "HW", default_value = "default")]
    speech_hardware: String,

    /// Log level (error, warn, info, debug, trace)
    #[arg(short = 'l', long, value_name = "LEVEL", default_value = "info")]
    log_level: LogLevel,

    /// Increase verbosity (-v for debug, -vv for trace)
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = CliArgs::parse();

    init_logging(args.log_level, args.verbose);

    if args.mqtt_url.is_none() && args.ws_url.is_none() {
        anyhow::bail!("one of --mqtt-url or --ws-url is required");
    }

    let media_source = MediaSource::from_flag(args.media_source).ok_or_else(|| {
        anyhow::anyhow!(
            "unknown media source {} (1 encoder, 2 gstreamer)",
            args.media_source
        )
    })?;

    tracing::info!("starting {}", BUILD_INFO);

    let settings = SessionSettings {
        id: args.id,
        mqtt_url: args.mqtt_url,
        api_url: args.ws_url,
        client_id: args.client_id,
        config_path: args.config_path,
        media_source,
        video: VideoSettings {
            device_path: args.video_path.clone(),
            bin_path: args.video_bin_path,
            socket_path: args.video_socket_path,
            ..Default::default()
        },
        gst: GstSettings {
            device_path: args.video_path.clone(),
            ..Default::default()
        },
        monitor: MonitorSettings {
            device_path: args.video_path,
            bin_path: args.monitor_bin_path,
            socket_path: args.monitor_socket_path,
        },
        hid_path: args.hid_path,
        hid_udc_path: args.hid_udc_path,
        speech: args.speech_bin_path.map(|bin_path| SpeechSettings {
            bin_path,
            socket_path: args.speech_socket_path,
            hardware: args.speech_hardware,
            ..Default::default()
        }),
    };

    let session = Session::new(settings)?;
    session.open().await?;

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    tokio::select! {
        _ = sigint.recv() => tracing::info!("SIGINT received"),
        _ = sigterm.recv() => tracing::info!("SIGTERM received"),
    }

    session.close().await;
    tracing::info!("shutdown complete");

    Ok(())
}

/// Initialize logging with tracing
fn init_logging(level: LogLevel, verbose_count: u8) {
    let effective_level = match verbose_count {
        0 => level,
        1 => LogLevel::Debug,
        _ => LogLevel::Trace,
    };

    let filter = match effective_level {
        LogLevel::Error => "kvm_agent=error",
        LogLevel::Warn => "kvm_agent=warn",
        LogLevel::Info => "kvm_agent=info",
        LogLevel::Debug => "kvm_agent=debug",
        LogLevel::Trace => "kvm_agent=trace,webrtc=debug",
    };

    let env_filter =
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into());

    if let Err(err) = tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init()
    {
        eprintln!("failed to initialize tracing: {err}");
    }
}
