use blocktrace::config::Config;
use blocktrace::summary;
use capture::{CaptureClient, ClientState, TcpTransport};
use clap::{Parser, Subcommand};
use eyre::{Context, Result};
use profile_format::encode_writer;
use reader::BackgroundLoader;
use std::fs::File;
use std::io::BufWriter;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::sleep;
use std::time::{Duration, Instant};

#[derive(Parser)]
#[command(name = "blocktrace")]
#[command(about = "capture and inspect block profiles over the network")]
#[command(version)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Record a capture from a running profiled process
    Record {
        #[arg(short, long, help = "configuration file path (toml format)")]
        config: Option<String>,

        #[arg(short, long, help = "profiled process address (host:port)")]
        address: Option<String>,

        #[arg(
            short,
            long,
            default_value = "capture.blocks",
            help = "output file for capture data"
        )]
        output: String,

        #[arg(
            short,
            long,
            value_parser = humantime::parse_duration,
            help = "duration to record (e.g. 10s, 5m); records until ctrl+c when omitted"
        )]
        duration: Option<Duration>,
    },
    /// Print a per-thread summary of a capture file
    Report {
        #[arg(help = "capture file path")]
        file: String,

        #[arg(short, long, default_value_t = 10, help = "blocks to list per thread")]
        top: usize,
    },
}

fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    match args.command {
        Command::Record {
            config,
            address,
            output,
            duration,
        } => record(config, address, output, duration),
        Command::Report { file, top } => report(&file, top),
    }
}

fn record(
    config: Option<String>,
    address: Option<String>,
    output: String,
    duration: Option<Duration>,
) -> Result<()> {
    let config = match config {
        Some(path) => {
            Config::load(&path).with_context(|| format!("failed to load config path={path}"))?
        }
        None => Config::default(),
    };
    let address = address.unwrap_or(config.global.address);

    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        tracing::info!("received ctrl+c, stopping capture...");
        r.store(false, Ordering::SeqCst);
    })?;

    let transport = TcpTransport::connect(&address)
        .with_context(|| format!("failed to connect address={address}"))?;
    let mut client = CaptureClient::new();
    client
        .connect(transport)
        .context("status handshake failed")?;
    tracing::info!(
        address = %address,
        process_id = client.remote_process_id(),
        "connected to profiled process"
    );

    for id in &config.record.disabled_blocks {
        client.edit_block_status(*id, false)?;
    }
    if config.record.event_tracing {
        client.set_event_tracing(true)?;
        if config.record.low_priority_events {
            client.set_event_tracing_priority(true)?;
        }
    }

    client.request_start()?;
    let start_time = Instant::now();
    let heartbeat = Duration::from_secs(config.record.heartbeat_secs.max(1));
    let mut last_heartbeat = Instant::now();

    while running.load(Ordering::SeqCst) && duration.is_none_or(|d| start_time.elapsed() < d) {
        if last_heartbeat.elapsed() >= heartbeat {
            match client.check_connection(heartbeat) {
                Ok(true) => {}
                Ok(false) => tracing::warn!("heartbeat not acknowledged"),
                Err(e) => {
                    tracing::warn!(error = %e, "connection lost while recording");
                    break;
                }
            }
            last_heartbeat = Instant::now();
        }
        sleep(Duration::from_millis(10));
    }

    if client.state() != ClientState::CaptureRequested {
        eyre::bail!("connection lost before the capture could be flushed");
    }
    let stream = client.request_stop_and_collect()?;
    if !stream.complete {
        tracing::warn!("connection lost during flush, capture is partial");
    }
    let dump = stream.into_dump()?;
    tracing::info!(
        descriptors = dump.descriptors.len(),
        records = dump.records.len(),
        "capture collected"
    );

    let file = File::create(&output)
        .with_context(|| format!("failed to create output path={output}"))?;
    encode_writer(&dump, BufWriter::new(file))?;
    tracing::info!(output = %output, "capture written");
    Ok(())
}

fn report(path: &str, top: usize) -> Result<()> {
    let loader = BackgroundLoader::spawn_file(path);
    let report = loader
        .join()
        .with_context(|| format!("failed to load capture path={path}"))?;

    let stdout = std::io::stdout();
    summary::write_summary(&mut stdout.lock(), &report, top)?;
    Ok(())
}
