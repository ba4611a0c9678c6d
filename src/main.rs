use std::path::PathBuf;

use clap::{Parser, Subcommand};
use log::info;
use tracing_subscriber::{fmt, EnvFilter};

use nodule_viz::commands;
use nodule_viz::config::{PredictorKind, Settings, VisualizationFailurePolicy};
use nodule_viz::state::InferenceState;

#[cfg(debug_assertions)]
// ort is chatty at debug level, so only our own crate gets it.
const LOG_LEVEL: &str = "warn,nodule_viz=debug";
#[cfg(not(debug_assertions))]
const LOG_LEVEL: &str = "warn";

/// Classify chest radiographs for pulmonary nodules and render attention heatmaps.
#[derive(Parser)]
#[command(name = "nodule-viz", version, about)]
struct Cli
{
    /// Predictor implementation; the legacy names predict_nodule and predict_nodule_spatial are accepted.
    #[arg(long, env = "PREDICT_MODULE", value_enum, default_value_t = PredictorKind::Spatial)]
    predictor: PredictorKind,

    /// ONNX export of the classifier.
    #[arg(long, env = "MODEL_PATH")]
    model_path: Option<PathBuf>,

    /// Graph output holding the class scores.
    #[arg(long, env = "LOGITS_OUTPUT")]
    logits_output: Option<String>,

    /// Graph output holding the last spatial block's activations.
    #[arg(long, env = "SPATIAL_OUTPUT")]
    spatial_output: Option<String>,

    /// Graph output of a dedicated attention head, for WSOD exports.
    #[arg(long, env = "ATTENTION_OUTPUT")]
    attention_output: Option<String>,

    #[arg(long, env = "INTRA_THREADS")]
    intra_threads: Option<usize>,

    /// What to do when the heatmap fails after a successful classification.
    #[arg(long, env = "VISUALIZATION_FAILURE", value_enum, default_value = "partial-success")]
    visualization_failure: VisualizationFailurePolicy,

    /// Pretty-print the JSON output.
    #[arg(long)]
    pretty: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command
{
    /// Load the model and report the active predictor.
    Status,
    /// Print the standardized preview of an image without classifying it.
    Preview
    {
        file: PathBuf,
    },
    /// Classify one or more images.
    Predict
    {
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
}

impl Cli
{
    fn settings(&self) -> Settings
    {
        let defaults = Settings::default();
        Settings {
            predictor: self.predictor,
            model_path: self.model_path.clone().unwrap_or(defaults.model_path),
            logits_output: self.logits_output.clone().unwrap_or(defaults.logits_output),
            spatial_output: self.spatial_output.clone().or(defaults.spatial_output),
            attention_output: self.attention_output.clone(),
            intra_threads: self.intra_threads.unwrap_or(defaults.intra_threads),
            visualization_failure: self.visualization_failure,
            ..defaults
        }
    }

    fn print<T: serde::Serialize>(&self, value: &T) -> anyhow::Result<()>
    {
        let json = if self.pretty {
            serde_json::to_string_pretty(value)?
        } else {
            serde_json::to_string(value)?
        };
        println!("{}", json);
        Ok(())
    }
}

fn main() -> anyhow::Result<()>
{
    let cli = Cli::parse();

    fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(LOG_LEVEL)))
        .with_writer(std::io::stderr)
        .init();

    let now = std::time::Instant::now();
    let state = InferenceState::new(cli.settings())?;
    info!("Startup took {:?}", now.elapsed());

    match &cli.command
    {
        Command::Status => cli.print(&commands::status(&state))?,
        Command::Preview { file } => cli.print(&commands::preview_file(&state, file))?,
        Command::Predict { files } => {
            for file in files
            {
                cli.print(&commands::predict_file(&state, file))?;
            }
        },
    }

    Ok(())
}
