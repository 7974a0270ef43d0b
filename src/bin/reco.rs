//! Recommendation pipeline CLI
//!
//! Runs the full batch flow or a single stage against a run directory, and
//! answers one-off inference queries against a completed run. Exits 0 on
//! success and 1 on any fatal error.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use reco_engine::prelude::*;

#[derive(Parser)]
#[command(name = "reco")]
#[command(version)]
#[command(about = "Product recommendation pipeline for industrial distribution")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Run directory holding all pipeline artifacts
    #[arg(short, long, global = true, default_value = "run")]
    run_dir: PathBuf,
}

#[derive(Debug, Clone, clap::Args)]
struct InputArgs {
    /// Customers CSV
    #[arg(long)]
    customers: PathBuf,
    /// Products CSV
    #[arg(long)]
    products: PathBuf,
    /// Invoices CSV
    #[arg(long)]
    invoices: PathBuf,
}

impl From<&InputArgs> for PipelineInputs {
    fn from(args: &InputArgs) -> Self {
        Self {
            customers: args.customers.clone(),
            products: args.products.clone(),
            invoices: args.invoices.clone(),
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Run the full pipeline: basket, clustering, associations, ranking,
    /// calibration
    Run {
        #[command(flatten)]
        inputs: InputArgs,
    },
    /// Stage 1 only — build the market basket
    MarketBasket {
        #[command(flatten)]
        inputs: InputArgs,
    },
    /// Stage 2 only — cluster customers per segment
    Cluster,
    /// Stage 3 only — mine association rules
    Associate {
        #[command(flatten)]
        inputs: InputArgs,
    },
    /// Stage 4 only — score and rank recommendations
    Rank,
    /// Stage 5 only — calibrate with feedback and publish the final table
    Calibrate,
    /// Load the snapshot and answer one query (smoke test for inference)
    ServeCheck {
        /// Customer to query
        #[arg(long)]
        customer_id: String,
        /// Segment for cold-start resolution
        #[arg(long)]
        segment: Option<String>,
        /// Cold-start purchase vector as name=quantity pairs
        #[arg(long, value_parser = parse_feature)]
        feature: Vec<(String, f64)>,
    },
}

fn parse_feature(raw: &str) -> Result<(String, f64), String> {
    let (name, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected name=quantity, got '{raw}'"))?;
    let quantity: f64 = value
        .parse()
        .map_err(|e| format!("bad quantity in '{raw}': {e}"))?;
    Ok((name.to_string(), quantity))
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    if let Err(err) = run() {
        eprintln!("error: {err:#}");
        process::exit(1);
    }
}

fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = PipelineConfig::from_env().context("loading configuration")?;
    let store = ArtifactStore::open(&cli.run_dir).context("opening run directory")?;
    let pipeline = Pipeline::new(config, store);

    match &cli.command {
        Commands::Run { inputs } => pipeline.run(&inputs.into())?,
        Commands::MarketBasket { inputs } => pipeline.run_market_basket(&inputs.into())?,
        Commands::Cluster => pipeline.run_clustering()?,
        Commands::Associate { inputs } => pipeline.run_associations(&inputs.into())?,
        Commands::Rank => pipeline.run_ranking()?,
        Commands::Calibrate => pipeline.run_calibration()?,
        Commands::ServeCheck {
            customer_id,
            segment,
            feature,
        } => {
            let service =
                RecommendationService::load(pipeline.store()).context("loading snapshot")?;
            let purchase_vector = if feature.is_empty() {
                None
            } else {
                Some(feature.iter().cloned().collect::<BTreeMap<String, f64>>())
            };
            let response = service.handle(&InferenceRequest {
                customer_id: customer_id.clone(),
                segment: segment.clone(),
                purchase_vector,
            });
            println!("{}", serde_json::to_string_pretty(&response)?);
        }
    }
    Ok(())
}
