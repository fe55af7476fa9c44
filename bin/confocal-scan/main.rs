use clap::{Parser, Subcommand};
use crossbeam_channel::{Receiver, RecvTimeoutError};
use env_logger::Env;
use log::{debug, error, info, warn, LevelFilter};
use std::{
    fs,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use rusty_confocal::{
    format_hms, frame_to_ascii, load_config_or_default, next_filename, plot_values, save_png,
    AppConfig, FrameRecord, FrameUpdate, RateHistory, RateSample, ScanAxis, ScanEvent, ScanMode,
    ScanOutcome, ScanPlan, ScanSession, SimulatedAfg, SimulatedDaq,
};
use rusty_confocal::hardware::shared_bus;

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Confocal raster scanner
#[derive(Parser, Debug)]
#[command(name = "confocal-scan")]
#[command(about = "Galvo raster scans and count-rate monitoring for confocal microscopes", long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Override log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Acquire one image (or frames until Ctrl+C with --repeat)
    Scan {
        #[arg(long, default_value_t = 1800)]
        xmin: i64,
        #[arg(long, default_value_t = 2200)]
        xmax: i64,
        #[arg(long, default_value_t = 1800)]
        ymin: i64,
        #[arg(long, default_value_t = 2300)]
        ymax: i64,
        /// Step between pixels in device units
        #[arg(short, long, default_value_t = 10)]
        increment: i64,
        /// Dwell time per pixel in seconds (defaults to counting.dwell_s)
        #[arg(short, long)]
        dwell: Option<f64>,
        /// Run odd rows backwards
        #[arg(long)]
        zigzag: bool,
        /// Report progress once per row; with --fast, load and burst one row at a time
        #[arg(long, conflicts_with = "repeat")]
        rows: bool,
        /// Use AFG waveforms and a buffered counter instead of stepping the galvos
        #[arg(long)]
        fast: bool,
        /// With --fast, keep acquiring frames until interrupted
        #[arg(long, requires = "fast")]
        repeat: bool,
        /// Do not write a record and PNG when the scan ends
        #[arg(long)]
        no_save: bool,
    },
    /// Watch the count rate with the galvos parked
    Monitor {
        /// Number of samples to take
        #[arg(short, long, default_value_t = 100)]
        samples: usize,
        /// Gate time per sample in seconds
        #[arg(short, long, default_value_t = 0.1)]
        dwell: f64,
        /// Keep only the most recent N samples
        #[arg(long)]
        limit: Option<usize>,
        /// Write the samples as JSON to the output directory
        #[arg(long)]
        save: bool,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let config = load_config_or_default(args.config.as_deref());

    let log_level = args
        .log_level
        .clone()
        .unwrap_or_else(|| config.logging.log_level.clone());
    initialize_logging(&log_level)?;
    log_startup_info(&config, args.config.as_deref());

    let shutdown_flag = setup_shutdown_handler()?;
    let mut session = setup_session(&config)?;

    match args.command {
        Command::Scan {
            xmin,
            xmax,
            ymin,
            ymax,
            increment,
            dwell,
            zigzag,
            rows,
            fast,
            repeat,
            no_save,
        } => {
            let dwell = match dwell {
                Some(secs) => Duration::try_from_secs_f64(secs)?,
                None => config.counting.dwell()?,
            };
            let plan = ScanPlan::new(
                ScanAxis::range(xmin, xmax, increment)?,
                ScanAxis::range(ymin, ymax, increment)?,
                dwell,
            )?
            .with_zigzag(zigzag);
            let mode = match (fast, rows) {
                (true, true) => ScanMode::BurstRows,
                (true, false) => ScanMode::Burst { repeat },
                (false, true) => ScanMode::PointRows,
                (false, false) => ScanMode::Point,
            };
            let output = (!no_save).then_some(config.output.directory.as_path());
            run_scan(&mut session, &plan, mode, &shutdown_flag, output)
        }
        Command::Monitor {
            samples,
            dwell,
            limit,
            save,
        } => {
            let dwell = Duration::try_from_secs_f64(dwell)?;
            let output = save.then_some(config.output.directory.as_path());
            run_monitor(&mut session, dwell, samples, limit, &shutdown_flag, output)
        }
    }
}

fn initialize_logging(log_level: &str) -> Result<(), Box<dyn std::error::Error>> {
    let level = match log_level.to_lowercase().as_str() {
        "trace" => LevelFilter::Trace,
        "debug" => LevelFilter::Debug,
        "info" => LevelFilter::Info,
        "warn" => LevelFilter::Warn,
        "error" => LevelFilter::Error,
        _ => {
            eprintln!("Warning: Invalid log level '{}', using 'info'", log_level);
            LevelFilter::Info
        }
    };

    env_logger::Builder::from_env(Env::default())
        .filter_level(level)
        .format_timestamp_millis()
        .init();

    Ok(())
}

fn log_startup_info(config: &AppConfig, config_path: Option<&Path>) {
    info!("=== Rusty Confocal ===");
    match config_path {
        Some(path) => info!("Configuration: {}", path.display()),
        None => info!("Configuration: defaults and environment"),
    }
    info!(
        "Galvos: x={} y={} ({} bits)",
        config.galvos.xgalvo, config.galvos.ygalvo, config.galvos.bits
    );
    info!(
        "Counting: {} gating {}",
        config.counting.pulsechan, config.counting.countchan
    );
    info!(
        "Fast: {} clocked by {}, AFGs {} / {}",
        config.fast.countchan, config.fast.sampleclk, config.fast.det_afg, config.fast.rf_afg
    );
}

/// Setup Ctrl+C handler for graceful shutdown
fn setup_shutdown_handler() -> Result<Arc<AtomicBool>, Box<dyn std::error::Error>> {
    let shutdown_flag = Arc::new(AtomicBool::new(false));
    let shutdown_flag_clone = shutdown_flag.clone();

    ctrlc::set_handler(move || {
        info!("Ctrl+C received - aborting after the current step...");
        shutdown_flag_clone.store(true, Ordering::SeqCst);
    })?;

    Ok(shutdown_flag)
}

/// Hardware drivers are reached through traits; this build runs against the simulator
fn setup_session(config: &AppConfig) -> Result<ScanSession, Box<dyn std::error::Error>> {
    warn!("No DAQ driver linked, using simulated hardware");
    let daq = SimulatedDaq::new().with_pace(Duration::from_millis(1));
    let afgs = (shared_bus(SimulatedAfg::new()), shared_bus(SimulatedAfg::new()));
    Ok(ScanSession::from_config(config, Box::new(daq), Some(afgs))?)
}

/// Wait for the next event, aborting the session once if Ctrl+C was pressed
fn next_event<T>(
    rx: &Receiver<ScanEvent<T>>,
    session: &ScanSession,
    shutdown_flag: &AtomicBool,
    abort_sent: &mut bool,
) -> Option<ScanEvent<T>> {
    loop {
        if !*abort_sent && shutdown_flag.load(Ordering::SeqCst) {
            session.abort();
            *abort_sent = true;
        }
        match rx.recv_timeout(POLL_INTERVAL) {
            Ok(event) => return Some(event),
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => return None,
        }
    }
}

fn report_outcome(elapsed: Duration, outcome: &ScanOutcome) {
    match outcome {
        ScanOutcome::Completed => info!("✓ Scan completed in {}", format_hms(elapsed)),
        ScanOutcome::Aborted => info!("Scan aborted after {}", format_hms(elapsed)),
        ScanOutcome::Faulted(msg) => error!("✗ Scan failed after {}: {}", format_hms(elapsed), msg),
    }
}

fn run_scan(
    session: &mut ScanSession,
    plan: &ScanPlan,
    mode: ScanMode,
    shutdown_flag: &AtomicBool,
    output: Option<&Path>,
) -> Result<(), Box<dyn std::error::Error>> {
    info!("Scan {} ({} pixels)", plan.summary(), plan.naqs());
    let (frame, rx) = session.start_scan(plan, mode)?;

    let mut abort_sent = false;
    let mut updates = 0usize;
    while let Some(event) = next_event(&rx, session, shutdown_flag, &mut abort_sent) {
        match event {
            ScanEvent::Result { data: Some(update) } => {
                updates += 1;
                match update {
                    FrameUpdate::CellWritten { row, col, value } => {
                        debug!("({row}, {col}) = {value:.0} counts/s")
                    }
                    FrameUpdate::RowWritten { row } => info!("Row {} of {}", row + 1, plan.y.len()),
                    FrameUpdate::FrameWritten { index } => info!("Frame {}", index + 1),
                }
            }
            ScanEvent::Result { data: None } => debug!("Worker acknowledged abort"),
            ScanEvent::Finished { elapsed, outcome } => {
                report_outcome(elapsed, &outcome);
                break;
            }
        }
    }
    session.join()?;

    let frame = frame.read().clone();
    info!(
        "{} updates, {} of {} pixels measured",
        updates,
        frame.filled_count(),
        plan.naqs()
    );
    println!("{}", frame_to_ascii(&frame));

    if let Some(dir) = output {
        fs::create_dir_all(dir)?;
        let record_path = next_filename(dir, "image", "json");
        FrameRecord::from_plan(&frame, plan).save(&record_path)?;
        save_png(&frame, &record_path.with_extension("png"))?;
    }
    Ok(())
}

fn run_monitor(
    session: &mut ScanSession,
    dwell: Duration,
    samples: usize,
    limit: Option<usize>,
    shutdown_flag: &AtomicBool,
    output: Option<&Path>,
) -> Result<(), Box<dyn std::error::Error>> {
    let rx = session.start_monitor(dwell)?;
    let mut history = RateHistory::new(limit);
    let mut taken = 0usize;
    let mut abort_sent = false;

    while let Some(event) = next_event(&rx, session, shutdown_flag, &mut abort_sent) {
        match event {
            ScanEvent::Result { data: Some(sample) } => {
                debug!("{:>8.2}s  {:.0} counts/s", sample.elapsed_s, sample.rate);
                history.push(sample);
                taken += 1;
                if taken >= samples && !abort_sent {
                    session.abort();
                    abort_sent = true;
                }
            }
            ScanEvent::Result { data: None } => {}
            ScanEvent::Finished { elapsed, outcome } => {
                if let ScanOutcome::Faulted(msg) = &outcome {
                    error!("✗ Monitor failed after {}: {}", format_hms(elapsed), msg);
                }
                break;
            }
        }
    }
    session.join()?;

    if history.is_empty() {
        warn!("No samples recorded");
        return Ok(());
    }
    if let Some(mean) = history.mean_rate() {
        info!("{} samples, mean {:.0} counts/s", history.len(), mean);
    }
    plot_values(&history.rates(), Some("Count rate"), None, None)?;

    if let Some(dir) = output {
        fs::create_dir_all(dir)?;
        let path = next_filename(dir, "monitor", "json");
        let samples: Vec<RateSample> = history.samples().copied().collect();
        fs::write(&path, serde_json::to_string_pretty(&samples)?)?;
        info!("Saved {} samples to {}", samples.len(), path.display());
    }
    Ok(())
}
