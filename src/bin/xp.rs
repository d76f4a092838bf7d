//! xp CLI - Command-line interface for the experiment engine
//!
//! Commands:
//! - analyze: Compute metric results for one experiment
//! - exposures: Compute the cumulative exposure timeseries
//! - validate: Validate event rows

use clap::{Parser, Subcommand, ValueEnum};
use std::fs;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

use experiment_engine::schema::{EventRowAdapter, InMemoryEventSource};
use experiment_engine::{ExperimentProcessor, ExperimentRequest, ENGINE_VERSION};

/// xp - Measurement engine for A/B experiments
#[derive(Parser)]
#[command(name = "xp")]
#[command(version = ENGINE_VERSION)]
#[command(about = "Compute experiment results from an event stream", long_about = None)]
struct Cli {
    /// Log pipeline progress to stderr (overridden by RUST_LOG)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Compute metric results
    Analyze {
        /// Experiment request file (experiment, metric, config)
        #[arg(short, long)]
        request: PathBuf,

        /// Events file path (use - for stdin)
        #[arg(short, long)]
        events: PathBuf,

        /// Output file path (use - for stdout)
        #[arg(short, long, default_value = "-")]
        output: PathBuf,

        /// Events format
        #[arg(long, default_value = "ndjson")]
        input_format: InputFormat,

        /// Output format
        #[arg(long, default_value = "json-pretty")]
        output_format: OutputFormat,
    },

    /// Compute cumulative daily exposures per variant
    Exposures {
        /// Experiment request file (metric is ignored)
        #[arg(short, long)]
        request: PathBuf,

        /// Events file path (use - for stdin)
        #[arg(short, long)]
        events: PathBuf,

        /// Output file path (use - for stdout)
        #[arg(short, long, default_value = "-")]
        output: PathBuf,

        /// Events format
        #[arg(long, default_value = "ndjson")]
        input_format: InputFormat,

        /// Output format
        #[arg(long, default_value = "json-pretty")]
        output_format: OutputFormat,
    },

    /// Validate event rows
    Validate {
        /// Events file path (use - for stdin)
        #[arg(short, long)]
        events: PathBuf,

        /// Events format
        #[arg(long, default_value = "ndjson")]
        input_format: InputFormat,

        /// Output validation report as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Clone, ValueEnum)]
enum InputFormat {
    /// Newline-delimited JSON (one row per line)
    Ndjson,
    /// JSON array of rows
    Json,
}

#[derive(Clone, ValueEnum)]
enum OutputFormat {
    /// Single-line JSON
    Json,
    /// Pretty-printed JSON
    JsonPretty,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!(
                "{}",
                serde_json::to_string(&CliError::from(e))
                    .unwrap_or_else(|_| "Unknown error".to_string())
            );
            ExitCode::FAILURE
        }
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "experiment_engine=debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

fn run(cli: Cli) -> Result<(), XpCliError> {
    match cli.command {
        Commands::Analyze {
            request,
            events,
            output,
            input_format,
            output_format,
        } => cmd_analyze(&request, &events, &output, input_format, output_format),

        Commands::Exposures {
            request,
            events,
            output,
            input_format,
            output_format,
        } => cmd_exposures(&request, &events, &output, input_format, output_format),

        Commands::Validate {
            events,
            input_format,
            json,
        } => cmd_validate(&events, input_format, json),
    }
}

fn cmd_analyze(
    request: &Path,
    events: &Path,
    output: &Path,
    input_format: InputFormat,
    output_format: OutputFormat,
) -> Result<(), XpCliError> {
    let request = load_request(request)?;
    let source = InMemoryEventSource::new(load_events(events, &input_format)?);
    let as_of = request.as_of();

    let processor = ExperimentProcessor::new(request.config.clone());
    let result = processor.calculate(&request.experiment, request.metric()?, &source, as_of)?;
    let payload = processor.encoder().encode(&result, as_of);

    write_output(output, &format_output(&payload, &output_format)?)
}

fn cmd_exposures(
    request: &Path,
    events: &Path,
    output: &Path,
    input_format: InputFormat,
    output_format: OutputFormat,
) -> Result<(), XpCliError> {
    let request = load_request(request)?;
    let source = InMemoryEventSource::new(load_events(events, &input_format)?);
    let as_of = request.as_of();

    let processor = ExperimentProcessor::new(request.config.clone());
    let timeseries = processor.exposure_timeseries(&request.experiment, &source, as_of)?;
    let payload = processor.encoder().encode(&timeseries, as_of);

    write_output(output, &format_output(&payload, &output_format)?)
}

fn cmd_validate(events: &Path, input_format: InputFormat, json: bool) -> Result<(), XpCliError> {
    let rows = load_events(events, &input_format)?;
    let results = EventRowAdapter::validate_rows(&rows);

    let report = ValidationReport {
        total_rows: rows.len(),
        valid_rows: rows.len() - results.len(),
        invalid_rows: results.len(),
        errors: results
            .iter()
            .map(|r| ValidationErrorDetail {
                index: r.index,
                uuid: r.uuid.clone(),
                error: r.error.to_string(),
            })
            .collect(),
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("Validation Report");
        println!("=================");
        println!("Total rows:   {}", report.total_rows);
        println!("Valid rows:   {}", report.valid_rows);
        println!("Invalid rows: {}", report.invalid_rows);

        if !report.errors.is_empty() {
            println!("\nErrors:");
            for err in &report.errors {
                println!("  - Row {} (index {}): {}", err.uuid, err.index, err.error);
            }
        }
    }

    if report.invalid_rows > 0 {
        Err(XpCliError::ValidationFailed(report.invalid_rows))
    } else {
        Ok(())
    }
}

fn read_input(path: &Path) -> Result<String, XpCliError> {
    if path.to_string_lossy() == "-" {
        let mut buffer = String::new();
        io::stdin().read_to_string(&mut buffer)?;
        Ok(buffer)
    } else {
        Ok(fs::read_to_string(path)?)
    }
}

fn load_request(path: &Path) -> Result<ExperimentRequest, XpCliError> {
    Ok(ExperimentRequest::from_json(&fs::read_to_string(path)?)?)
}

fn load_events(
    path: &Path,
    format: &InputFormat,
) -> Result<Vec<experiment_engine::EventRow>, XpCliError> {
    let data = read_input(path)?;
    let rows = match format {
        InputFormat::Ndjson => EventRowAdapter::parse_ndjson(&data)?,
        InputFormat::Json => EventRowAdapter::parse_array(&data)?,
    };
    tracing::debug!(rows = rows.len(), "loaded events");
    Ok(rows)
}

fn format_output<T: serde::Serialize>(
    payload: &T,
    format: &OutputFormat,
) -> Result<String, XpCliError> {
    Ok(match format {
        OutputFormat::Json => serde_json::to_string(payload)?,
        OutputFormat::JsonPretty => serde_json::to_string_pretty(payload)?,
    })
}

fn write_output(path: &Path, content: &str) -> Result<(), XpCliError> {
    if path.to_string_lossy() == "-" {
        let mut stdout = io::stdout().lock();
        writeln!(stdout, "{content}")?;
        stdout.flush()?;
    } else {
        fs::write(path, format!("{content}\n"))?;
    }
    Ok(())
}

// Error types

#[derive(Debug)]
enum XpCliError {
    Io(io::Error),
    Compute(experiment_engine::ComputeError),
    Json(serde_json::Error),
    ValidationFailed(usize),
}

impl From<io::Error> for XpCliError {
    fn from(e: io::Error) -> Self {
        XpCliError::Io(e)
    }
}

impl From<experiment_engine::ComputeError> for XpCliError {
    fn from(e: experiment_engine::ComputeError) -> Self {
        XpCliError::Compute(e)
    }
}

impl From<serde_json::Error> for XpCliError {
    fn from(e: serde_json::Error) -> Self {
        XpCliError::Json(e)
    }
}

#[derive(serde::Serialize)]
struct CliError {
    code: String,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    hint: Option<String>,
    retryable: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    conditions: Vec<String>,
}

impl From<XpCliError> for CliError {
    fn from(e: XpCliError) -> Self {
        match e {
            XpCliError::Io(e) => CliError {
                code: "IO_ERROR".to_string(),
                message: e.to_string(),
                hint: Some("Check file paths and permissions".to_string()),
                retryable: false,
                conditions: Vec::new(),
            },
            XpCliError::Compute(e) => {
                let user = e.user_facing();
                let hint = match user.code.as_str() {
                    "EXPERIMENT_VALIDATION" => {
                        Some("Check the flag key, variants and date range".to_string())
                    }
                    "INVALID_REQUEST" => Some("Run 'xp validate' on the events".to_string()),
                    _ => None,
                };
                CliError {
                    code: user.code,
                    message: user.message,
                    hint,
                    retryable: user.retryable,
                    conditions: user.conditions,
                }
            }
            XpCliError::Json(e) => CliError {
                code: "JSON_ERROR".to_string(),
                message: e.to_string(),
                hint: Some("Check JSON syntax".to_string()),
                retryable: false,
                conditions: Vec::new(),
            },
            XpCliError::ValidationFailed(count) => CliError {
                code: "VALIDATION_FAILED".to_string(),
                message: format!("{} rows failed validation", count),
                hint: Some("Fix validation errors and retry".to_string()),
                retryable: false,
                conditions: Vec::new(),
            },
        }
    }
}

// Report types

#[derive(serde::Serialize)]
struct ValidationReport {
    total_rows: usize,
    valid_rows: usize,
    invalid_rows: usize,
    errors: Vec<ValidationErrorDetail>,
}

#[derive(serde::Serialize)]
struct ValidationErrorDetail {
    index: usize,
    uuid: String,
    error: String,
}
