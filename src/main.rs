use std::process::ExitCode;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use echocast::tts::{SaySynthesizer, SpeechSynthesizer};
use echocast::{discovery, Config, Daemon};

/// echocast - play chat messages on your speakers
#[derive(Parser)]
#[command(name = "echocast", version, about)]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Scan the network for playback devices
    Discover {
        /// Scan duration in seconds
        #[arg(short, long, default_value = "5")]
        timeout: u64,
    },
    /// Render text to speech and print the resulting file path
    Say {
        /// Text to speak
        #[arg(default_value = "echocast is ready")]
        text: String,
    },
    /// Show the configured device
    Status,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => "info,echocast=info",
        1 => "info,echocast=debug",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("fatal: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    if let Some(cmd) = cli.command {
        return match cmd {
            Command::Discover { timeout } => cmd_discover(timeout).await,
            Command::Say { text } => cmd_say(&text).await,
            Command::Status => cmd_status(),
        };
    }

    let config = Config::load()?;
    tracing::info!("starting echocast");

    let daemon = Daemon::new(config)?;
    daemon.run().await?;

    Ok(())
}

/// Scan for devices and print what answered
async fn cmd_discover(timeout: u64) -> anyhow::Result<()> {
    println!("Scanning for devices ({timeout}s)...\n");

    let devices = discovery::discover(Duration::from_secs(timeout)).await;
    for device in &devices {
        match &device.address {
            Some(address) => println!(
                "  {} ({}) @ {}:{}",
                device.name, device.device_type, address, device.port
            ),
            None => println!("  {} ({})", device.name, device.device_type),
        }
    }
    println!("\n{} device(s) found", devices.len());

    Ok(())
}

/// Render text to an MP3 so voice settings can be checked without a bot
async fn cmd_say(text: &str) -> anyhow::Result<()> {
    let config = echocast::config::Config::load().map(|c| c.tts).unwrap_or_default();
    let synth = SaySynthesizer::new(config);

    let output = std::env::temp_dir().join(format!(
        "echocast-say-{}.mp3",
        uuid::Uuid::new_v4().simple()
    ));
    println!("Synthesizing: \"{text}\"");
    synth.synthesize(text, &output).await?;
    println!("Rendered to {}", output.display());

    Ok(())
}

/// Print the persisted device selection
fn cmd_status() -> anyhow::Result<()> {
    let dir = echocast::config::config_dir();
    let store = echocast::config::DeviceStore::new(&dir);

    match store.load()? {
        Some(device) => {
            println!("Selected device: {} ({})", device.name, device.device_type);
            if let Some(address) = &device.address {
                println!("Address: {}:{}", address, device.port);
            }
        }
        None => println!("No device selected. Start the bot and run /setup."),
    }

    Ok(())
}
