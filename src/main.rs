//! Bayer-cam-capture binary: stream a V4L2 camera, correct frames and save
//! stills or raw buffers on request.

use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;

use bayer_cam_capture::config::Config;
use bayer_cam_capture::console::{self, run_console};
use bayer_cam_capture::{
    logging, BayerPattern, BufferPool, CameraError, CancellationToken, CaptureLoop, CaptureStore,
    ColorPipeline, LogSink, SampleFormat, SharedControls, V4L2Device, VideoDriver,
};
use clap::Parser;
use tracing::{info, warn};

/// Capture from a V4L2 bayer or YUYV camera.
#[derive(Parser, Debug)]
#[command(name = "bayer-cam-capture", version)]
struct Args {
    /// TOML config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Device index, opens /dev/video<N>
    #[arg(short, long)]
    device: Option<usize>,

    /// Frame width
    #[arg(long)]
    width: Option<u32>,

    /// Frame height
    #[arg(long)]
    height: Option<u32>,

    /// Number of mmap buffers
    #[arg(short, long)]
    buffers: Option<u32>,

    /// Sample format: 1/raw10, 2/raw12, 3/yuv422
    #[arg(short, long)]
    mode: Option<SampleFormat>,

    /// Bayer pattern: 1/bg, 2/gb, 3/rg, 4/gr
    #[arg(long)]
    bayer: Option<BayerPattern>,

    /// Initial gamma exponent
    #[arg(short, long)]
    gamma: Option<f32>,

    /// Directory for saved captures
    #[arg(short, long)]
    output_dir: Option<PathBuf>,

    /// Stop after this many frames
    #[arg(long)]
    max_frames: Option<u64>,
}

impl Args {
    fn apply(self, config: &mut Config) {
        if let Some(index) = self.device {
            config.device.index = index;
        }
        if let Some(width) = self.width {
            config.device.width = width;
        }
        if let Some(height) = self.height {
            config.device.height = height;
        }
        if let Some(buffers) = self.buffers {
            config.device.buffer_count = buffers;
        }
        if let Some(mode) = self.mode {
            config.controls.mode = mode;
        }
        if let Some(bayer) = self.bayer {
            config.controls.bayer = bayer;
        }
        if let Some(gamma) = self.gamma {
            config.controls.gamma = gamma;
        }
        if let Some(dir) = self.output_dir {
            config.capture.output_dir = dir;
        }
        if self.max_frames.is_some() {
            config.capture.max_frames = self.max_frames;
        }
    }
}

fn main() {
    if let Err(err) = run() {
        eprintln!("Error: {err}");
        std::process::exit(1);
    }
}

fn run() -> bayer_cam_capture::Result<()> {
    let args = Args::parse();
    let mut config = Config::load_or_default(args.config.as_deref())?;
    args.apply(&mut config);
    config.validate()?;

    logging::init();
    info!("bayer-cam-capture {}", env!("CARGO_PKG_VERSION"));

    let mut device = V4L2Device::open(config.device.index)?;
    let caps = device.capabilities();
    info!("Device: {}", caps.card);
    info!("Driver: {} ({})", caps.driver, caps.bus_info);

    let requested = config.device.requested_format()?;
    if let Err(err) = device.negotiate_format(&requested) {
        warn!("could not set {requested}, keeping the current format: {err}");
    }
    let format = device.format()?;
    info!("Format: {format}");

    let controls = Arc::new(SharedControls::new(&config.controls.snapshot())?);
    let token = CancellationToken::new();

    let ctrlc_token = token.clone();
    ctrlc::set_handler(move || ctrlc_token.cancel())
        .map_err(|err| CameraError::Io(io::Error::other(err)))?;

    let console_controls = Arc::clone(&controls);
    let console_token = token.clone();
    thread::Builder::new()
        .name("console".to_owned())
        .spawn(move || {
            if let Err(err) = run_console(io::stdin().lock(), &console_controls, &console_token) {
                warn!("console stopped: {err}");
            }
        })?;
    info!("{}", console::HELP);

    let mut pool = BufferPool::new(device);
    pool.allocate(config.device.buffer_count)?;

    let store = CaptureStore::new(
        config.capture.output_dir.clone(),
        config.capture.file_prefix.clone(),
    );
    let mut capture = CaptureLoop::new(pool, Arc::clone(&controls), store)?
        .with_pipeline(ColorPipeline::new(config.color.clone()))
        .with_max_frames(config.capture.max_frames);

    let frames = capture.run(&mut LogSink::default(), &token)?;

    // Buffers are released by `run`; the control page goes last.
    drop(capture);
    drop(controls);
    info!("captured {frames} frames");
    Ok(())
}
