//! Offline trainer for the anchor classifier.
//!
//! Reads a JSON array of labelled documents
//! `[{"provider", "marketId", "text", "anchorType"}, ...]`, trains the
//! multinomial model, and writes the versioned artifact the pipeline
//! hot-reloads.

use anyhow::{Context, Result};
use clap::Parser;

use market_mover_watch::profiler::model::{train, TrainParams, TrainingDoc};
use market_mover_watch::profiler::normalize_text;
use market_mover_watch::providers::json_str;

#[derive(Parser, Debug)]
#[command(name = "train-anchor", about = "Train the anchor classifier artifact")]
struct Args {
    /// Labelled training documents (JSON array)
    #[arg(long, default_value = "anchor_training.json")]
    input: String,

    /// Artifact output path
    #[arg(long, default_value = "anchor_model.json")]
    output: String,

    /// Version stamped into the artifact
    #[arg(long, default_value = "anchor-nb-1")]
    model_version: String,

    /// Minimum document frequency for a vocabulary term
    #[arg(long, default_value = "3")]
    min_df: usize,

    /// Vocabulary size cap
    #[arg(long, default_value = "3500")]
    max_vocab: usize,

    /// Laplace smoothing constant
    #[arg(long, default_value = "1.0")]
    alpha: f64,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let data = std::fs::read_to_string(&args.input)
        .with_context(|| format!("read training file {}", args.input))?;
    let raw: Vec<serde_json::Value> =
        serde_json::from_str(&data).context("training file is not a JSON array")?;

    let docs: Vec<TrainingDoc> = raw
        .iter()
        .filter_map(|item| {
            Some(TrainingDoc {
                provider: json_str(&item["provider"])?.to_string(),
                market_id: json_str(&item["marketId"])?.to_string(),
                text: normalize_text(&[json_str(&item["text"])?]),
                anchor_type: json_str(&item["anchorType"])?.to_string(),
            })
        })
        .collect();
    if docs.len() < raw.len() {
        tracing::warn!("skipped {} malformed training row(s)", raw.len() - docs.len());
    }

    let report = train(
        &docs,
        &TrainParams {
            min_df: args.min_df,
            max_vocab: args.max_vocab,
            alpha: args.alpha,
            model_version: args.model_version,
        },
    )?;

    std::fs::write(&args.output, serde_json::to_vec_pretty(&report.model)?)
        .with_context(|| format!("write artifact {}", args.output))?;

    tracing::info!(
        "trained {} on {} doc(s) ({} held out, accuracy {})",
        report.model.model_version,
        report.train_count,
        report.test_count,
        report
            .test_accuracy
            .map(|a| format!("{:.3}", a))
            .unwrap_or_else(|| "n/a".into()),
    );
    Ok(())
}
