use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};

use screen_recorder::capture::{get_audio_input_devices, CpalAudio, SyntheticAudio, SyntheticDisplay};
use screen_recorder::recorder::{
    AudioSource, Capabilities, LoggingCallback, PipelineController, PipelineState,
    RecorderSettings, RecordingEvent,
};

/// Record a display and audio into a single MP4
#[derive(Parser)]
#[command(name = "screen-recorder")]
#[command(version, about)]
#[command(arg_required_else_help = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Record until the duration elapses or Ctrl-C is pressed
    Record {
        /// Stop after this many seconds
        #[arg(short, long)]
        seconds: Option<u64>,

        /// Settings file (JSON); defaults apply when missing
        #[arg(long)]
        settings: Option<PathBuf>,

        /// Directory to write the recording to
        #[arg(short, long)]
        output_dir: Option<PathBuf>,

        /// Audio to record alongside the display
        #[arg(long, value_enum)]
        audio: Option<AudioArg>,

        /// Width of the mirrored display
        #[arg(long, default_value = "640")]
        width: u32,

        /// Height of the mirrored display
        #[arg(long, default_value = "360")]
        height: u32,

        /// Use a generated tone instead of a real input device
        #[arg(long)]
        test_tone: bool,

        /// Record audio only
        #[arg(long)]
        no_video: bool,
    },

    /// List audio input devices
    Devices,
}

#[derive(Clone, Copy, ValueEnum)]
enum AudioArg {
    Mic,
    Internal,
    None,
}

impl From<AudioArg> for AudioSource {
    fn from(arg: AudioArg) -> Self {
        match arg {
            AudioArg::Mic => AudioSource::Microphone,
            AudioArg::Internal => AudioSource::Internal,
            AudioArg::None => AudioSource::Disabled,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    screen_recorder::init_tracing();
    let cli = Cli::parse();

    match cli.command {
        Commands::Devices => {
            for device in get_audio_input_devices() {
                let marker = if device.is_default { " (default)" } else { "" };
                println!("{}{}", device.name, marker);
            }
            Ok(())
        }
        Commands::Record {
            seconds,
            settings,
            output_dir,
            audio,
            width,
            height,
            test_tone,
            no_video,
        } => {
            let mut settings = match settings {
                Some(path) => RecorderSettings::load(&path)
                    .with_context(|| format!("loading settings from {:?}", path))?,
                None => RecorderSettings::default(),
            };
            if output_dir.is_some() {
                settings.output_dir = output_dir;
            }
            if let Some(audio) = audio {
                settings.audio_source = audio.into();
            }
            let options = RecordOptions {
                width,
                height,
                seconds,
                test_tone,
                video: !no_video,
            };
            record(settings, options).await
        }
    }
}

struct RecordOptions {
    width: u32,
    height: u32,
    seconds: Option<u64>,
    test_tone: bool,
    video: bool,
}

async fn record(settings: RecorderSettings, options: RecordOptions) -> Result<()> {
    tracing::info!("Starting screen-recorder v{}", env!("CARGO_PKG_VERSION"));

    let display = Arc::new(SyntheticDisplay::new(options.width, options.height));
    let caps = if options.test_tone {
        Capabilities::new(display, Arc::new(SyntheticAudio::default()))
    } else {
        Capabilities::new(display, Arc::new(CpalAudio::new()))
    };
    let controller = PipelineController::new(settings, caps, Arc::new(LoggingCallback));

    let mut events = controller.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            if let RecordingEvent::StorageLow { available, .. } = event {
                eprintln!("Storage low: {} MiB left, stopping", available / (1024 * 1024));
            }
        }
    });

    // Subscribed before start so a session ending on its own is seen
    let mut outcome = controller.subscribe();
    let (video, audio) = controller.session_configs().await?;
    let video = options.video.then_some(video);
    let session = controller.start(video, audio).await?;
    println!("Recording to {}", session.output_path.display());

    let limit = async {
        match options.seconds {
            Some(secs) => tokio::time::sleep(Duration::from_secs(secs)).await,
            None => std::future::pending().await,
        }
    };
    tokio::select! {
        _ = limit => {}
        _ = tokio::signal::ctrl_c() => println!(),
        _ = controller.wait_ended(&mut outcome) => {}
    }

    match controller.state() {
        PipelineState::Stopped => {
            println!("Recording stopped early ({:.1}s)", controller.duration_ms() / 1000.0);
            return Ok(());
        }
        PipelineState::Failed => anyhow::bail!("recording failed"),
        _ => {}
    }

    let output = controller.stop().await?;
    println!(
        "Saved {} ({:.1}s, {} bytes)",
        output.output_path.display(),
        output.total_duration_ms / 1000.0,
        output.container.file_size
    );
    Ok(())
}
