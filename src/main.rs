use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;

use proctor_media::capture::FileDevices;
use proctor_media::config::{RecordConfig, ServerConfig};
use proctor_media::manifest::StreamKind;
use proctor_media::offline_store::OfflineChunkStore;
use proctor_media::playback::{BufferSink, ManifestPlayer};
use proctor_media::recorder::{RecordingOptions, RecordingSession};
use proctor_media::serve;
use proctor_media::session_api::SessionApi;
use proctor_media::upload_queue::AlwaysOnline;

#[derive(Parser, Debug)]
#[command(author, version, about = "Exam session media capture, upload and playback coordinator")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the coordinator HTTP server
    Serve {
        /// Path to config file (TOML format)
        #[arg(short, long)]
        config: PathBuf,
    },
    /// Record capture sources into an exam session
    Record {
        /// Path to config file (TOML format)
        #[arg(short, long)]
        config: PathBuf,
    },
    /// Reconstruct a finalized recording from its manifest
    Play {
        /// Manifest URL returned by finalize or the manifest endpoint
        manifest_url: String,
        /// File the reconstructed stream is written to
        #[arg(short, long)]
        output: PathBuf,
        /// Preferred stream kind (webcam or screen)
        #[arg(long)]
        stream: Option<String>,
        /// Fetch every chunk eagerly instead of appending incrementally
        #[arg(long)]
        buffered: bool,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let args = Args::parse();

    match args.command {
        Command::Serve { config } => {
            let config: ServerConfig = load_config(&config)?;
            serve::serve(config)
        }
        Command::Record { config } => {
            let config: RecordConfig = load_config(&config)?;
            run_record(config)
        }
        Command::Play {
            manifest_url,
            output,
            stream,
            buffered,
        } => run_play(&manifest_url, &output, stream.as_deref(), buffered),
    }
}

fn load_config<T: serde::de::DeserializeOwned>(
    path: &PathBuf,
) -> Result<T, Box<dyn std::error::Error>> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| format!("Failed to read config file '{}': {}", path.display(), e))?;
    let config = toml::from_str(&content)
        .map_err(|e| format!("Failed to parse config file '{}': {}", path.display(), e))?;
    Ok(config)
}

fn run_record(config: RecordConfig) -> Result<(), Box<dyn std::error::Error>> {
    println!("Connecting to: {}", config.server_url);
    println!("Session: {}", config.session_id);

    let api = Arc::new(
        SessionApi::new(&config.server_url, &config.session_id, &config.owner_id)
            .map_err(|e| -> Box<dyn std::error::Error> { e.to_string().into() })?,
    );
    let devices = FileDevices {
        primary: config.source.clone(),
        screen: config.screen_source.clone(),
        byte_rate: config.byte_rate(),
    };
    let offline = Arc::new(OfflineChunkStore::open(config.offline_db()));

    let session = RecordingSession::new(RecordingOptions {
        api,
        devices: Box::new(devices),
        include_screen: config.include_screen.unwrap_or(false),
        offline,
        network: Arc::new(AlwaysOnline),
        lock_dir: Some(config.lock_dir()),
        content_type: None,
        backoff_base_ms: 1_000,
    });

    session
        .start()
        .map_err(|e| -> Box<dyn std::error::Error> { e.to_string().into() })?;
    println!("Recording started (capturing from {})", config.source.display());

    session.wait_for_capture();
    println!("Capture sources exhausted, waiting for uploads to drain...");

    let outcome = session
        .stop()
        .map_err(|e| -> Box<dyn std::error::Error> { e.to_string().into() })?;
    println!(
        "Recording finalized: {} stream(s), {} total ms",
        outcome.manifest.streams.len(),
        outcome.manifest.total_duration_ms
    );
    println!("Manifest: {}", outcome.manifest_url);
    Ok(())
}

fn run_play(
    manifest_url: &str,
    output: &PathBuf,
    stream: Option<&str>,
    buffered: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let preferred = match stream {
        Some(name) => Some(name.parse::<StreamKind>()?),
        None => None,
    };

    let player = ManifestPlayer::new(manifest_url, preferred)?;
    let mut sink = if buffered {
        BufferSink::new_buffered()
    } else {
        BufferSink::new_streaming()
    };
    let summary = player.load(&mut sink)?;
    std::fs::write(output, sink.data())?;

    println!(
        "Reconstructed {} stream: {} chunk(s), {} bytes, {} ms",
        summary.stream_kind, summary.chunk_count, summary.total_bytes, summary.duration_ms
    );
    println!("Written to: {}", output.display());
    Ok(())
}
