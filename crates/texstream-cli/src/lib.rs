//! # Texstream CLI
//!
//! Command-line driver for the texture streaming planner.
//!
//! ## Commands
//! - `simulate` - Fly a camera over a synthetic texture set and report
//!   what the streamer did
//! - `config` - Print the default configuration, or validate a file

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use crossbeam::channel::Receiver;
use serde::Serialize;
use texstream_core::job::JobSystem;
use texstream_planner::{
    ChannelStreamEngine, FrameInfo, PlanningStreamer, StreamInRequest, StreamerStats, StreamingConfig,
    TextureDesc, TextureFormat, TextureHandle, UpdateMipFlags,
};

/// Texture streaming planner CLI
#[derive(Parser)]
#[command(name = "texstream")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Verbose output
    #[arg(short, long)]
    pub verbose: bool,

    /// Report span timings through tracing instead of plain logging
    #[arg(long)]
    pub trace_spans: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// Run a synthetic streaming simulation
    Simulate {
        /// Streaming configuration (JSON); defaults apply otherwise
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Number of textures
        #[arg(short, long, default_value = "512")]
        textures: usize,

        /// Frames to simulate
        #[arg(short, long, default_value = "120")]
        frames: i32,

        /// Override the pool size in megabytes
        #[arg(long)]
        pool_mb: Option<usize>,

        /// Frames a disk read takes
        #[arg(long, default_value = "2")]
        latency: i32,

        /// Worker threads for the planning job
        #[arg(short, long, default_value = "1")]
        workers: usize,

        /// Print per-frame statistics as JSON lines
        #[arg(long)]
        per_frame: bool,
    },

    /// Print the default configuration or validate a configuration file
    Config {
        /// File to validate and print with defaults filled in
        #[arg(short, long)]
        file: Option<PathBuf>,
    },
}

/// Simulation inputs
#[derive(Debug, Clone)]
pub struct SimulationParams {
    pub config: StreamingConfig,
    pub textures: usize,
    pub frames: i32,
    pub latency: i32,
    pub workers: usize,
    pub per_frame: bool,
}

/// What a simulation run did
#[derive(Debug, Clone, Default, Serialize)]
pub struct SimulationSummary {
    pub frames: i32,
    pub textures: usize,
    pub streams_submitted: usize,
    pub bytes_submitted: usize,
    pub streams_completed: usize,
    pub streams_cancelled: usize,
    pub bytes_trimmed: usize,
    pub bytes_kicked: usize,
    pub bytes_collected: usize,
    pub over_budget_frames: usize,
    pub final_bias: i16,
    pub final_stats: StreamerStats,
}

/// Disk stand-in: every read completes `latency` frames after submission
struct SimulatedDisk {
    receiver: Receiver<StreamInRequest>,
    in_flight: VecDeque<(i32, StreamInRequest)>,
    latency: i32,
}

impl SimulatedDisk {
    /// Complete due reads; returns (completed, cancelled)
    fn pump(&mut self, streamer: &PlanningStreamer, frame_id: i32) -> Result<(usize, usize)> {
        for request in self.receiver.try_iter() {
            self.in_flight.push_back((frame_id + self.latency, request));
        }

        let (mut completed, mut cancelled) = (0, 0);
        while self.in_flight.front().is_some_and(|(due, request)| *due <= frame_id || request.is_aborted()) {
            let Some((_, request)) = self.in_flight.pop_front() else {
                break;
            };
            if request.is_aborted() {
                streamer.complete_stream_in(request.texture, false)?;
                cancelled += 1;
                continue;
            }
            streamer.report_uploaded(request.texture, request.start_mip)?;
            streamer.complete_stream_in(request.texture, true)?;
            completed += 1;
        }
        Ok((completed, cancelled))
    }
}

/// Textures sit on a line one unit apart; the camera flies along it
fn camera_position(frame_id: i32, textures: usize) -> f32 {
    let span = textures.max(1) as f32;
    (frame_id as f32 * 4.0) % span
}

/// Mip factor of a texture `distance` units from the camera
fn mip_factor(desc_texels: f32, distance: f32) -> f32 {
    (1.0 + distance * distance) / desc_texels
}

fn texture_desc(index: usize) -> TextureDesc {
    let size = match index % 4 {
        0 => 2048,
        1 => 1024,
        2 => 512,
        _ => 256,
    };
    let format = if index % 3 == 0 {
        TextureFormat::Bc3
    } else {
        TextureFormat::Bc1
    };
    TextureDesc::new(format!("sim/texture_{index:05}"), size, size, format).with_stream_priority((index % 8) as u8)
}

/// Run the synthetic simulation
pub fn run_simulation(params: &SimulationParams) -> Result<SimulationSummary> {
    let (engine, receiver) = ChannelStreamEngine::new();
    let jobs = Arc::new(JobSystem::new(params.workers));
    let streamer = PlanningStreamer::new(params.config.clone(), Box::new(engine), jobs)?;
    let mut disk = SimulatedDisk {
        receiver,
        in_flight: VecDeque::new(),
        latency: params.latency.max(0),
    };

    let textures: Vec<(TextureHandle, f32)> = (0..params.textures)
        .map(|index| {
            let desc = texture_desc(index);
            let texels = desc.width as f32 * desc.height as f32;
            streamer.register_texture(desc).map(|handle| (handle, texels))
        })
        .collect::<Result<_, _>>()?;
    log::info!("Registered {} textures", textures.len());

    let mut summary = SimulationSummary {
        frames: params.frames,
        textures: textures.len(),
        ..Default::default()
    };

    for frame_id in 0..params.frames {
        let round = frame_id / 4;
        let camera = camera_position(frame_id, textures.len());

        for (index, &(handle, texels)) in textures.iter().enumerate() {
            let distance = (index as f32 - camera).abs();
            if distance < 32.0 {
                streamer.touch(handle, frame_id)?;
                streamer.update_mip(
                    handle,
                    mip_factor(texels, distance),
                    UpdateMipFlags::SINGLE_FRAME_PRIORITY_UPDATE,
                    round,
                )?;
            } else if distance < 96.0 {
                // Predicted zone: ahead of the camera
                let flags = if distance < 48.0 {
                    UpdateMipFlags::HIGH_PRIORITY
                } else {
                    UpdateMipFlags::empty()
                };
                streamer.update_mip(handle, mip_factor(texels, distance), flags, round)?;
            }
        }

        let frame = FrameInfo {
            frame_id,
            zone_round_ids: [round, round],
        };
        streamer.begin_update_schedule(frame);
        if let Some(report) = streamer.apply_schedule() {
            summary.streams_submitted += report.submitted;
            summary.bytes_submitted += report.submitted_bytes;
            summary.bytes_trimmed += report.trimmed_bytes;
            summary.bytes_kicked += report.kicked_bytes;
            summary.bytes_collected += report.gc_freed_bytes;
        }
        if streamer.is_overflowing() {
            summary.over_budget_frames += 1;
        }

        let (completed, cancelled) = disk.pump(&streamer, frame_id)?;
        summary.streams_completed += completed;
        summary.streams_cancelled += cancelled;

        if params.per_frame {
            println!("{}", serde_json::to_string(&streamer.stats())?);
        }
    }

    summary.final_bias = streamer.bias();
    summary.final_stats = streamer.stats();
    Ok(summary)
}

fn load_config(path: &Path) -> Result<StreamingConfig> {
    let json = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    StreamingConfig::from_json_str(&json).with_context(|| format!("parsing {}", path.display()))
}

fn init_logging(cli: &Cli) -> Result<()> {
    let level = if cli.verbose { "debug" } else { "info" };
    if cli.trace_spans {
        use tracing_subscriber::fmt::format::FmtSpan;

        let max_level = if cli.verbose {
            tracing_subscriber::filter::LevelFilter::DEBUG
        } else {
            tracing_subscriber::filter::LevelFilter::INFO
        };
        tracing_subscriber::fmt()
            .with_max_level(max_level)
            .with_span_events(FmtSpan::CLOSE)
            .try_init()
            .map_err(|err| anyhow::anyhow!(err))?;
    } else {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();
    }
    Ok(())
}

/// Execute the CLI command
pub fn execute(cli: Cli) -> Result<()> {
    init_logging(&cli)?;

    match cli.command {
        Commands::Simulate {
            config,
            textures,
            frames,
            pool_mb,
            latency,
            workers,
            per_frame,
        } => {
            let mut config = match config {
                Some(path) => load_config(&path)?,
                None => StreamingConfig::default(),
            };
            if let Some(pool_mb) = pool_mb {
                config.pool_size_mb = pool_mb;
            }

            log::info!("Simulating {} frames over {} textures...", frames, textures);
            let summary = run_simulation(&SimulationParams {
                config,
                textures,
                frames,
                latency,
                workers,
                per_frame,
            })?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }

        Commands::Config { file } => {
            let config = match file {
                Some(path) => load_config(&path)?,
                None => StreamingConfig::default(),
            };
            println!("{}", config.to_json_pretty()?);
        }
    }

    Ok(())
}
