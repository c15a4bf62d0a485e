//! Autobill CLI - Command-line interface for the Autobill checkout
//!
//! Commands:
//! - run: Live checkout from a classifier runner and the load cell
//! - replay: Run recorded frames and weights through the checkout
//! - validate: Validate a recorded frame file
//! - price: Price a single session
//! - doctor: Diagnose devices and configuration

use clap::{Parser, Subcommand, ValueEnum};
use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use autobill::camera::{discover_cameras, select_camera, DEVICE_ROOT};
use autobill::error::{CheckoutError, ConfigError, PricingError, SourceError};
use autobill::pipeline::{run_checkout, CheckoutProcessor, RunSummary};
use autobill::pricing::PricingEngine;
use autobill::scale::{IioScale, ReplayScale, WeightSensor};
use autobill::schema::{ClassificationFrame, FrameAdapter, FrameLog};
use autobill::source::ClassifierSource;
use autobill::types::SessionRecord;
use autobill::{BillingQueue, Config, HttpBillingSink, JsonLinesSink, AUTOBILL_VERSION, PRODUCER_NAME};

/// Autobill - Weight-assisted automatic checkout
#[derive(Parser)]
#[command(name = "autobill")]
#[command(version = AUTOBILL_VERSION)]
#[command(about = "Bill items recognised by a camera and weighed on a load cell", long_about = None)]
struct Cli {
    /// Configuration file (defaults to ./autobill.toml when present)
    #[arg(long, global = true, env = "AUTOBILL_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the live checkout
    Run {
        /// Classifier model file
        model: PathBuf,

        /// Camera port; discovered when omitted
        camera: Option<u32>,

        /// Classifier runner command, started as `<runner> <model> <camera>`
        #[arg(long, env = "AUTOBILL_RUNNER", default_value = "autobill-runner")]
        runner: String,

        /// Load cell raw channel
        #[arg(long)]
        scale_device: Option<PathBuf>,

        /// Billing ledger base URL
        #[arg(long, env = "AUTOBILL_ENDPOINT")]
        endpoint: Option<String>,

        /// Print billing records to stdout instead of posting them
        #[arg(long)]
        dry_run: bool,
    },

    /// Replay recorded frames and weights
    Replay {
        /// Recorded runner output (NDJSON)
        #[arg(long)]
        frames: PathBuf,

        /// Recorded weights, one integer per line
        #[arg(long)]
        weights: PathBuf,

        /// Post records to this ledger instead of printing them
        #[arg(long)]
        endpoint: Option<String>,

        /// Honour the configured frame interval and post delay
        #[arg(long)]
        realtime: bool,
    },

    /// Validate a recorded frame file
    Validate {
        /// Input file path (use - for stdin)
        #[arg(short, long)]
        input: PathBuf,

        /// Input format
        #[arg(long, default_value = "ndjson")]
        input_format: InputFormat,

        /// Output validation report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Print the billing record for one session
    Price {
        /// Item label
        label: String,

        /// Final weight in grams
        #[arg(allow_hyphen_values = true)]
        weight: i64,

        /// Taken count of the session
        #[arg(long, default_value = "1")]
        taken: u32,
    },

    /// Diagnose devices and configuration
    Doctor {
        /// Check this model file
        #[arg(long)]
        model: Option<PathBuf>,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Clone, ValueEnum)]
enum InputFormat {
    /// Newline-delimited JSON (one runner message per line)
    Ndjson,
    /// JSON array of frames
    Json,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = Config::load(cli.config.as_deref());
    let level = config
        .as_ref()
        .map(|config| config.logging.level.clone())
        .unwrap_or_else(|_| "info".to_string());
    init_logging(&level);

    let result = config
        .map_err(AutobillCliError::from)
        .and_then(|config| run(cli.command, config));

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!(
                "{}",
                serde_json::to_string(&CliError::from(e)).unwrap_or_else(|_| "Unknown error".to_string())
            );
            ExitCode::FAILURE
        }
    }
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("autobill={level}")));
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(io::stderr))
        .try_init();
}

fn run(command: Commands, config: Config) -> Result<(), AutobillCliError> {
    match command {
        Commands::Run {
            model,
            camera,
            runner,
            scale_device,
            endpoint,
            dry_run,
        } => cmd_run(
            config,
            &model,
            camera,
            &runner,
            scale_device,
            endpoint,
            dry_run,
        ),

        Commands::Replay {
            frames,
            weights,
            endpoint,
            realtime,
        } => cmd_replay(config, &frames, &weights, endpoint, realtime),

        Commands::Validate {
            input,
            input_format,
            json,
        } => cmd_validate(&input, input_format, json),

        Commands::Price {
            label,
            weight,
            taken,
        } => cmd_price(&config, label, weight, taken),

        Commands::Doctor { model, json } => cmd_doctor(&config, model.as_deref(), json),
    }
}

fn cmd_run(
    mut config: Config,
    model: &Path,
    camera: Option<u32>,
    runner: &str,
    scale_device: Option<PathBuf>,
    endpoint: Option<String>,
    dry_run: bool,
) -> Result<(), AutobillCliError> {
    if let Some(device) = scale_device {
        config.scale.device = device;
    }
    if let Some(endpoint) = endpoint {
        config.billing.endpoint = endpoint;
    }
    config.validate()?;

    if !model.exists() {
        return Err(CheckoutError::ModelNotFound(model.to_path_buf()).into());
    }

    let mut scale = IioScale::new(&config.scale);
    scale.calibrate().map_err(CheckoutError::from)?;

    let cameras = discover_cameras(Path::new(DEVICE_ROOT));
    let port = select_camera(camera, &cameras)?;
    tracing::info!(port, "using camera");

    let runtime = tokio::runtime::Runtime::new()?;
    let summary = runtime.block_on(async {
        let source = ClassifierSource::spawn_runner(runner, model, port).await?;
        let labels = source
            .model()
            .map(|info| info.labels().to_vec())
            .unwrap_or_default();
        let checkout = CheckoutProcessor::new(&config, labels, scale);

        let queue_capacity = config.billing.queue_capacity;
        let billing = if dry_run {
            BillingQueue::spawn(JsonLinesSink::stdout(), Duration::ZERO, queue_capacity)
        } else {
            let sink = HttpBillingSink::new(&config.billing)?;
            tracing::info!(url = sink.url(), "posting billing records");
            BillingQueue::spawn(sink, config.billing.post_delay(), queue_capacity)
        };

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            trigger.cancel();
        });

        run_checkout(
            checkout,
            source,
            billing,
            config.classifier.frame_interval(),
            cancel,
        )
        .await
    })?;

    log_summary(&summary);
    Ok(())
}

fn cmd_replay(
    mut config: Config,
    frames_path: &Path,
    weights_path: &Path,
    endpoint: Option<String>,
    realtime: bool,
) -> Result<(), AutobillCliError> {
    let log = FrameAdapter::parse_ndjson(&read_input(frames_path)?)?;
    if log.frames.is_empty() {
        return Err(AutobillCliError::NoFrames);
    }
    let labels = log.labels();
    let frames = usable_frames(log);

    let mut scale = ReplayScale::from_file(weights_path)?;
    scale.calibrate().map_err(CheckoutError::from)?;
    tracing::info!(
        frames = frames.len(),
        readings = scale.remaining(),
        "replaying recording"
    );

    let (interval, post_delay) = if realtime {
        (config.classifier.frame_interval(), config.billing.post_delay())
    } else {
        (Duration::ZERO, Duration::ZERO)
    };

    let post = endpoint.is_some();
    if let Some(endpoint) = endpoint {
        config.billing.endpoint = endpoint;
    }
    config.validate()?;

    let runtime = tokio::runtime::Runtime::new()?;
    let summary = runtime.block_on(async {
        let capacity = config.classifier.channel_capacity;
        let source = ClassifierSource::from_frames(frames, capacity);
        let checkout = CheckoutProcessor::new(&config, labels, scale);

        let queue_capacity = config.billing.queue_capacity;
        let billing = if post {
            let sink = HttpBillingSink::new(&config.billing)?;
            BillingQueue::spawn(sink, post_delay, queue_capacity)
        } else {
            BillingQueue::spawn(JsonLinesSink::stdout(), post_delay, queue_capacity)
        };

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            trigger.cancel();
        });

        run_checkout(checkout, source, billing, interval, cancel).await
    })?;

    log_summary(&summary);
    println!("{}", serde_json::to_string(&summary)?);
    Ok(())
}

fn cmd_validate(
    input: &Path,
    input_format: InputFormat,
    json: bool,
) -> Result<(), AutobillCliError> {
    let input_data = read_input(input)?;

    let log = match input_format {
        InputFormat::Ndjson => FrameAdapter::parse_ndjson(&input_data)?,
        InputFormat::Json => FrameLog {
            model: None,
            frames: FrameAdapter::parse_array(&input_data)?,
        },
    };

    let results = FrameAdapter::validate_frames(&log.frames);

    let report = ValidationReport {
        model: log
            .model
            .as_ref()
            .map(|info| format!("{} / {}", info.project.owner, info.project.name)),
        labels: log.labels(),
        total_frames: log.frames.len(),
        valid_frames: log.frames.len() - results.len(),
        invalid_frames: results.len(),
        errors: results
            .iter()
            .map(|r| ValidationErrorDetail {
                index: r.index,
                error: r.error.to_string(),
            })
            .collect(),
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("Validation Report");
        println!("=================");
        println!("Model:          {}", report.model.as_deref().unwrap_or("(none)"));
        println!("Labels:         {}", report.labels.join(", "));
        println!("Total frames:   {}", report.total_frames);
        println!("Valid frames:   {}", report.valid_frames);
        println!("Invalid frames: {}", report.invalid_frames);

        if !report.errors.is_empty() {
            println!("\nErrors:");
            for err in &report.errors {
                println!("  - Frame {}: {}", err.index, err.error);
            }
        }
    }

    if report.invalid_frames > 0 {
        Err(AutobillCliError::ValidationFailed(report.invalid_frames))
    } else {
        Ok(())
    }
}

fn cmd_price(config: &Config, label: String, weight: i64, taken: u32) -> Result<(), AutobillCliError> {
    let mut engine = PricingEngine::starting_at(config.pricing.first_id, config.pricing.unknown_label);
    let record = engine.price(&SessionRecord {
        label,
        final_weight: weight,
        taken_count: taken,
    })?;
    println!("{}", serde_json::to_string_pretty(&record)?);
    Ok(())
}

fn cmd_doctor(config: &Config, model: Option<&Path>, json: bool) -> Result<(), AutobillCliError> {
    let mut checks: Vec<DoctorCheck> = Vec::new();

    checks.push(DoctorCheck {
        name: "autobill_version".to_string(),
        status: CheckStatus::Ok,
        message: format!("Autobill version {}", AUTOBILL_VERSION),
    });

    checks.push(match config.validate() {
        Ok(()) => DoctorCheck {
            name: "config".to_string(),
            status: CheckStatus::Ok,
            message: format!(
                "Threshold {}, frame interval {} ms, {:?} history",
                config.classifier.threshold,
                config.classifier.frame_interval_ms,
                config.tracker.history
            ),
        },
        Err(e) => DoctorCheck {
            name: "config".to_string(),
            status: CheckStatus::Error,
            message: e.to_string(),
        },
    });

    if let Some(model) = model {
        checks.push(if model.is_file() {
            DoctorCheck {
                name: "model".to_string(),
                status: CheckStatus::Ok,
                message: format!("Model file {}", model.display()),
            }
        } else {
            DoctorCheck {
                name: "model".to_string(),
                status: CheckStatus::Error,
                message: format!("Model file not found: {}", model.display()),
            }
        });
    }

    let cameras = discover_cameras(Path::new(DEVICE_ROOT));
    checks.push(match cameras.as_slice() {
        [] => DoctorCheck {
            name: "cameras".to_string(),
            status: CheckStatus::Error,
            message: "Cannot find any webcams".to_string(),
        },
        [port] => DoctorCheck {
            name: "cameras".to_string(),
            status: CheckStatus::Ok,
            message: format!("Camera found in port {port}"),
        },
        ports => DoctorCheck {
            name: "cameras".to_string(),
            status: CheckStatus::Warning,
            message: format!("Cameras found in ports {ports:?}; pass one to `run` explicitly"),
        },
    });

    let device = &config.scale.device;
    checks.push(match fs::read_to_string(device) {
        Ok(raw) => DoctorCheck {
            name: "scale".to_string(),
            status: CheckStatus::Ok,
            message: format!("{} reads {}", device.display(), raw.trim()),
        },
        Err(e) => DoctorCheck {
            name: "scale".to_string(),
            status: CheckStatus::Error,
            message: format!("Cannot read {}: {}", device.display(), e),
        },
    });

    checks.push(DoctorCheck {
        name: "endpoint".to_string(),
        status: CheckStatus::Ok,
        message: format!("Billing records are posted to {}", config.billing.url()),
    });

    // Dry-run records go to stdout
    let stdout_check = if atty::is(atty::Stream::Stdout) {
        DoctorCheck {
            name: "stdout".to_string(),
            status: CheckStatus::Ok,
            message: "stdout is a TTY (dry-run records are shown)".to_string(),
        }
    } else {
        DoctorCheck {
            name: "stdout".to_string(),
            status: CheckStatus::Ok,
            message: "stdout is a pipe (dry-run records can be captured)".to_string(),
        }
    };
    checks.push(stdout_check);

    let report = DoctorReport {
        producer: PRODUCER_NAME.to_string(),
        version: AUTOBILL_VERSION.to_string(),
        checks,
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("Autobill Doctor Report");
        println!("======================");
        println!("Producer: {}", report.producer);
        println!("Version:  {}", report.version);
        println!("\nChecks:");

        for check in &report.checks {
            let status_icon = match check.status {
                CheckStatus::Ok => "[OK]",
                CheckStatus::Warning => "[WARN]",
                CheckStatus::Error => "[ERR]",
            };
            println!("  {} {}: {}", status_icon, check.name, check.message);
        }
    }

    let has_errors = report.checks.iter().any(|c| matches!(c.status, CheckStatus::Error));
    if has_errors {
        Err(AutobillCliError::DoctorFailed)
    } else {
        Ok(())
    }
}

// Helper functions

fn read_input(path: &Path) -> Result<String, AutobillCliError> {
    if path.to_string_lossy() == "-" {
        let mut buffer = String::new();
        io::stdin().read_to_string(&mut buffer)?;
        Ok(buffer)
    } else {
        Ok(fs::read_to_string(path)?)
    }
}

/// Frames that pass validation; the rest are logged and dropped
fn usable_frames(log: FrameLog) -> Vec<ClassificationFrame> {
    log.frames
        .into_iter()
        .enumerate()
        .filter_map(|(index, frame)| match frame.validate() {
            Ok(()) => Some(frame),
            Err(e) => {
                tracing::warn!(index, "skipping invalid frame: {e}");
                None
            }
        })
        .collect()
}

fn log_summary(summary: &RunSummary) {
    tracing::info!(
        run_id = %summary.run_id,
        stopped_by = ?summary.stopped_by,
        frames = summary.frames,
        sessions = summary.sessions,
        attempted = summary.billing.attempted,
        delivered = summary.billing.delivered,
        "run summary"
    );
}

/// Resolves on Ctrl+C or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install signal handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Interrupted"),
        _ = terminate => tracing::info!("Received terminate signal, shutting down"),
    }
}

// Error types

#[derive(Debug)]
enum AutobillCliError {
    Io(io::Error),
    Json(serde_json::Error),
    Config(ConfigError),
    Source(SourceError),
    Checkout(CheckoutError),
    Pricing(PricingError),
    NoFrames,
    ValidationFailed(usize),
    DoctorFailed,
}

impl From<io::Error> for AutobillCliError {
    fn from(e: io::Error) -> Self {
        AutobillCliError::Io(e)
    }
}

impl From<serde_json::Error> for AutobillCliError {
    fn from(e: serde_json::Error) -> Self {
        AutobillCliError::Json(e)
    }
}

impl From<ConfigError> for AutobillCliError {
    fn from(e: ConfigError) -> Self {
        AutobillCliError::Config(e)
    }
}

impl From<SourceError> for AutobillCliError {
    fn from(e: SourceError) -> Self {
        AutobillCliError::Source(e)
    }
}

impl From<CheckoutError> for AutobillCliError {
    fn from(e: CheckoutError) -> Self {
        match e {
            CheckoutError::Config(e) => AutobillCliError::Config(e),
            CheckoutError::Source(e) => AutobillCliError::Source(e),
            other => AutobillCliError::Checkout(other),
        }
    }
}

impl From<PricingError> for AutobillCliError {
    fn from(e: PricingError) -> Self {
        AutobillCliError::Pricing(e)
    }
}

#[derive(serde::Serialize)]
struct CliError {
    code: String,
    message: String,
    hint: Option<String>,
}

impl CliError {
    fn new(code: &str, message: impl Into<String>, hint: &str) -> Self {
        CliError {
            code: code.to_string(),
            message: message.into(),
            hint: Some(hint.to_string()),
        }
    }
}

impl From<AutobillCliError> for CliError {
    fn from(e: AutobillCliError) -> Self {
        match e {
            AutobillCliError::Io(e) => {
                CliError::new("IO_ERROR", e.to_string(), "Check file paths and permissions")
            }
            AutobillCliError::Json(e) => CliError::new("JSON_ERROR", e.to_string(), "Check JSON syntax"),
            AutobillCliError::Config(e) => CliError::new(
                "CONFIG_ERROR",
                e.to_string(),
                "Check autobill.toml or the --config file",
            ),
            AutobillCliError::Source(SourceError::Spawn { command, source }) => CliError::new(
                "RUNNER_NOT_STARTED",
                format!("Failed to start classifier runner `{command}`: {source}"),
                "Install the runner or pass --runner",
            ),
            AutobillCliError::Source(e) => CliError::new(
                "MODEL_LOAD_FAILED",
                e.to_string(),
                "Check that the model matches the runner",
            ),
            AutobillCliError::Checkout(e) => checkout_error(e),
            AutobillCliError::Pricing(e) => CliError::new(
                "UNKNOWN_LABEL",
                e.to_string(),
                "Set pricing.unknown_label = \"fallback\" to bill unknown labels",
            ),
            AutobillCliError::NoFrames => CliError::new(
                "NO_FRAMES",
                "No frames found in input",
                "Ensure the recording is not empty",
            ),
            AutobillCliError::ValidationFailed(count) => CliError::new(
                "VALIDATION_FAILED",
                format!("{} frames failed validation", count),
                "Fix validation errors and retry",
            ),
            AutobillCliError::DoctorFailed => CliError::new(
                "DOCTOR_FAILED",
                "One or more health checks failed",
                "Review the doctor report for details",
            ),
        }
    }
}

fn checkout_error(e: CheckoutError) -> CliError {
    let message = e.to_string();
    match e {
        CheckoutError::ModelNotFound(_) => {
            CliError::new("MODEL_NOT_FOUND", message, "Pass the path of a model file")
        }
        CheckoutError::NoCamera => CliError::new(
            "NO_CAMERA",
            message,
            "Connect a camera or pass its port number",
        ),
        CheckoutError::AmbiguousCamera(_) => CliError::new(
            "AMBIGUOUS_CAMERA",
            message,
            "Pass the camera port after the model path",
        ),
        CheckoutError::Calibration(_) => CliError::new(
            "CALIBRATION_FAILED",
            message,
            "Check the load cell wiring and --scale-device",
        ),
        CheckoutError::Billing(_) => CliError::new(
            "BILLING_ERROR",
            message,
            "Check the billing endpoint",
        ),
        CheckoutError::Worker(_) => CliError::new(
            "WORKER_FAILED",
            message,
            "Run with RUST_LOG=autobill=debug for details",
        ),
        CheckoutError::Config(_) | CheckoutError::Source(_) => {
            CliError::new("CHECKOUT_FAILED", message, "Run 'autobill doctor'")
        }
    }
}

// Report types

#[derive(serde::Serialize)]
struct ValidationReport {
    model: Option<String>,
    labels: Vec<String>,
    total_frames: usize,
    valid_frames: usize,
    invalid_frames: usize,
    errors: Vec<ValidationErrorDetail>,
}

#[derive(serde::Serialize)]
struct ValidationErrorDetail {
    index: usize,
    error: String,
}

#[derive(serde::Serialize)]
struct DoctorReport {
    producer: String,
    version: String,
    checks: Vec<DoctorCheck>,
}

#[derive(serde::Serialize)]
struct DoctorCheck {
    name: String,
    status: CheckStatus,
    message: String,
}

#[derive(serde::Serialize)]
enum CheckStatus {
    Ok,
    Warning,
    Error,
}
