use std::io;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use rtsplive::encoder::EncoderSettings;
use rtsplive::{
    CaptureConfig, LifecycleEvent, StreamConfig, StreamOrchestrator, TestPatternCamera,
    TestPatternSettings, VideoQuality,
};
use tracing_subscriber::EnvFilter;

#[derive(Clone, Copy, ValueEnum)]
enum Quality {
    Low,
    High,
    Qvga,
    #[value(name = "480p")]
    P480,
    #[value(name = "720p")]
    P720,
    #[value(name = "1080p")]
    P1080,
    #[value(name = "2160p")]
    P2160,
}

impl From<Quality> for VideoQuality {
    fn from(quality: Quality) -> Self {
        match quality {
            Quality::Low => VideoQuality::Low,
            Quality::High => VideoQuality::High,
            Quality::Qvga => VideoQuality::Qvga,
            Quality::P480 => VideoQuality::P480,
            Quality::P720 => VideoQuality::P720,
            Quality::P1080 => VideoQuality::P1080,
            Quality::P2160 => VideoQuality::P2160,
        }
    }
}

#[derive(Parser)]
#[command(
    name = "rtsp-live",
    about = "Stream a synthetic test-pattern camera over RTSP"
)]
struct Args {
    /// RTSP listen port
    #[arg(long, short, default_value_t = 8554)]
    port: u16,

    /// Listen address
    #[arg(long, default_value = "0.0.0.0")]
    bind: String,

    /// Path appended to the stream URL
    #[arg(long, short = 'n', default_value = "")]
    stream_name: String,

    /// Require Basic authentication with this user name
    #[arg(long, short)]
    user: Option<String>,

    #[arg(long, requires = "user")]
    password: Option<String>,

    /// Capture quality profile
    #[arg(long, short, value_enum, default_value_t = Quality::P480)]
    quality: Quality,

    /// Test pattern frame rate
    #[arg(long, default_value_t = 30)]
    fps: u32,

    /// Sensor orientation in degrees (0, 90, 180, 270)
    #[arg(long, default_value_t = 0)]
    orientation: u32,

    /// Host to advertise in the stream URL and SDP
    #[arg(long)]
    public_host: Option<String>,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();

    let camera = TestPatternCamera::new(TestPatternSettings {
        fps: args.fps,
        orientation: args.orientation,
        ..TestPatternSettings::default()
    });

    let config = StreamConfig {
        capture: CaptureConfig {
            quality: args.quality.into(),
            ..CaptureConfig::default()
        },
        encoder: EncoderSettings {
            frame_rate: args.fps,
            ..EncoderSettings::default()
        },
        stream_name: args.stream_name,
        bind_host: args.bind,
        port: args.port,
        public_host: args.public_host,
        user_name: args.user,
        password: args.password,
        ..StreamConfig::default()
    };

    let stream = match StreamOrchestrator::new(Arc::new(camera), config) {
        Ok(stream) => stream,
        Err(e) => {
            eprintln!("Failed to build pipeline: {e}");
            return ExitCode::FAILURE;
        }
    };

    stream.start_rtsp_server();
    stream.handle_lifecycle(LifecycleEvent::Foreground);

    let Some(url) = stream.stream_url().wait_timeout(Duration::from_secs(5)) else {
        eprintln!(
            "Failed to start server (errno {}): {}",
            stream.server().errno(),
            stream.server().result_msg()
        );
        stream.handle_lifecycle(LifecycleEvent::Destroyed);
        return ExitCode::FAILURE;
    };

    println!("Streaming at {url}, press Enter to stop");
    let mut input = String::new();
    if let Err(e) = io::stdin().read_line(&mut input) {
        tracing::warn!(error = %e, "stdin closed");
    }

    stream.handle_lifecycle(LifecycleEvent::Destroyed);
    ExitCode::SUCCESS
}
