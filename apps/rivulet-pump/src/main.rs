//! Rivulet Pump - headless pipeline driver.
//!
//! Reads an input file through a framed source chain and writes the
//! resulting frames to an output file, running the event loop until the
//! sink reports completion. Useful for exercising pipelines from the
//! command line and as a template for embedding the core.

mod config;

use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use bytes::Bytes;
use clap::Parser;
use rivulet_core::{
    ByteStreamSource, Environment, FileSink, FrameAccumulator, FramedSource, HeaderPrefixFilter,
    MediaSink, TaskScheduler,
};

use crate::config::PumpConfig;

/// Rivulet Pump - drive a framed pipeline from one file into another.
#[derive(Parser, Debug)]
#[command(name = "rivulet-pump")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Input file to stream.
    input: PathBuf,

    /// Output file to write frames into.
    output: PathBuf,

    /// Path to the configuration file (YAML).
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace).
    #[arg(short, long, default_value = "info", env = "RIVULET_LOG_LEVEL")]
    log_level: log::LevelFilter,

    /// Preferred frame size in bytes (overrides config file).
    #[arg(short = 'f', long, env = "RIVULET_FRAME_SIZE")]
    frame_size: Option<usize>,

    /// Per-frame play time in microseconds (overrides config file).
    #[arg(short = 'p', long, env = "RIVULET_PLAY_TIME_US")]
    play_time_us: Option<u64>,

    /// Stop after this many input bytes (overrides config file).
    #[arg(short = 'l', long)]
    byte_limit: Option<u64>,
}

fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    env_logger::Builder::new()
        .filter_level(args.log_level)
        .format_timestamp_millis()
        .init();

    log::info!("Rivulet Pump v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let mut config =
        PumpConfig::load(args.config.as_deref()).context("Failed to load configuration")?;

    // Apply CLI overrides
    if let Some(frame_size) = args.frame_size {
        config.frame_size = frame_size;
    }
    if let Some(play_time_us) = args.play_time_us {
        config.play_time_us = play_time_us;
    }
    if let Some(byte_limit) = args.byte_limit {
        config.byte_limit = byte_limit;
    }

    let frame_header = config.frame_header().context("Invalid frame header")?;
    log::info!(
        "Configuration: frame_size={}, buffer_size={}, play_time_us={}, header_bytes={}, accumulate_bytes={}",
        config.frame_size,
        config.buffer_size,
        config.play_time_us,
        frame_header.len(),
        config.accumulate_bytes
    );

    let scheduler = TaskScheduler::new().context("Failed to create scheduler")?;
    let env = Environment::new(scheduler.clone());

    // Source: the input file, chunked and optionally paced.
    let mut source = ByteStreamSource::open(&env, &args.input)
        .with_context(|| format!("Failed to open input {}", args.input.display()))?
        .with_preferred_frame_size(config.frame_size);
    if config.play_time_us > 0 {
        source = source.with_play_time_per_frame(Duration::from_micros(config.play_time_us));
    }
    if config.byte_limit > 0 {
        source = source.with_byte_limit(config.byte_limit);
    }

    // Optional filters: accumulate first, then prepend the header to each
    // delivered chunk.
    let mut chain: Box<dyn FramedSource> = Box::new(source);
    if config.accumulate_bytes > 0 {
        chain = Box::new(FrameAccumulator::new(chain, config.accumulate_bytes));
    }
    if !frame_header.is_empty() {
        chain = Box::new(HeaderPrefixFilter::new(
            &env,
            chain,
            Bytes::from(frame_header),
        ));
    }

    // Sink: the output file.
    let file_sink = FileSink::create(&args.output)
        .with_context(|| format!("Failed to create output {}", args.output.display()))?
        .with_buffer_size(config.buffer_size);
    let mut sink = MediaSink::new(&env, Box::new(file_sink));

    let done = Arc::new(AtomicU32::new(0));
    let done_flag = done.clone();
    sink.start_playing(chain, move || {
        log::info!("Playback complete");
        done_flag.store(1, Ordering::Release);
    })
    .context("Failed to start playback")?;

    scheduler
        .do_event_loop(Some(&done))
        .context("Event loop failed")?;

    let last_result = env.result_msg();
    if !last_result.is_empty() {
        log::warn!("Pipeline reported: {last_result}");
        anyhow::bail!("pipeline ended with a diagnostic: {last_result}");
    }

    log::info!(
        "Wrote {} from {}",
        args.output.display(),
        args.input.display()
    );
    Ok(())
}
