//! Pipeline orchestration
//!
//! Runs the five batch stages strictly sequentially; each stage reads only
//! artifacts whose producing stage has fully completed and writes exactly
//! one artifact (the clustering stage writes one archive directory). Stages
//! are idempotent: identical inputs, configuration and seed produce
//! byte-identical outputs.

use std::path::PathBuf;

use tracing::info;

use crate::associations::mine_associations;
use crate::clustering::{persist_models, train_clusters};
use crate::config::PipelineConfig;
use crate::errors::RecoResult;
use crate::feedback::calibrate;
use crate::market_basket::build_market_basket;
use crate::models::InvoiceLine;
use crate::ranking::rank_recommendations;
use crate::serialization::{read_customers, read_invoices, read_products, write_json};
use crate::store::{ArtifactStore, FEEDBACK_SUMMARY_FILE};

/// Paths to the three raw input tables.
#[derive(Debug, Clone)]
pub struct PipelineInputs {
    pub customers: PathBuf,
    pub products: PathBuf,
    pub invoices: PathBuf,
}

/// The batch pipeline: S1 market basket → S2 clustering → S3 associations
/// → S4 ranking → S5 feedback calibration.
#[derive(Debug)]
pub struct Pipeline {
    config: PipelineConfig,
    store: ArtifactStore,
}

impl Pipeline {
    pub fn new(config: PipelineConfig, store: ArtifactStore) -> Self {
        Self { config, store }
    }

    pub fn store(&self) -> &ArtifactStore {
        &self.store
    }

    fn load_invoices(&self, inputs: &PipelineInputs) -> RecoResult<(Vec<InvoiceLine>, bool)> {
        let aliases = self.config.price_alias_list();
        let (invoices, stats) = read_invoices(&inputs.invoices, &aliases)?;
        Ok((invoices, stats.price_column_found))
    }

    /// S1 — build and persist the market basket table.
    pub fn run_market_basket(&self, inputs: &PipelineInputs) -> RecoResult<()> {
        info!("stage 1/5: market basket");
        let customers = read_customers(&inputs.customers)?;
        let products = read_products(&inputs.products)?;
        let (invoices, has_price) = self.load_invoices(inputs)?;
        let basket =
            build_market_basket(&invoices, &products, &customers, has_price, &self.config)?;
        self.store.write_basket(&basket)
    }

    /// S2 — cluster customers per segment and persist the model archive.
    pub fn run_clustering(&self) -> RecoResult<()> {
        info!("stage 2/5: clustering");
        let basket = self.store.read_basket()?;
        let output = train_clusters(&basket, &self.config)?;
        persist_models(&output, &self.store.model_dir()?)?;
        self.store.write_assignments(&output.assignments)
    }

    /// S3 — mine association rules within each (segment, cluster).
    pub fn run_associations(&self, inputs: &PipelineInputs) -> RecoResult<()> {
        info!("stage 3/5: associations");
        let (invoices, _) = self.load_invoices(inputs)?;
        let assignments = self.store.read_assignments()?;
        let rules = mine_associations(&invoices, &assignments, &self.config)?;
        self.store.write_rules(&rules)
    }

    /// S4 — score and rank per-customer recommendations.
    pub fn run_ranking(&self) -> RecoResult<()> {
        info!("stage 4/5: ranking");
        let basket = self.store.read_basket()?;
        let assignments = self.store.read_assignments()?;
        let rules = self.store.read_rules()?;
        let recommendations =
            rank_recommendations(&basket, &assignments, &rules, &self.config)?;
        self.store.write_recommendations(&recommendations)
    }

    /// S5 — calibrate with feedback and publish the final table + summary.
    pub fn run_calibration(&self) -> RecoResult<()> {
        info!("stage 5/5: feedback calibration");
        let recommendations = self.store.read_recommendations()?;
        let feedback = self.store.read_feedback_optional()?;
        let (finals, summary) =
            calibrate(&recommendations, feedback.as_deref(), &self.config)?;
        self.store.write_final_recommendations(&finals)?;
        write_json(&self.store.path(FEEDBACK_SUMMARY_FILE), &summary)?;
        Ok(())
    }

    /// Run the full batch flow.
    pub fn run(&self, inputs: &PipelineInputs) -> RecoResult<()> {
        self.run_market_basket(inputs)?;
        self.run_clustering()?;
        self.run_associations(inputs)?;
        self.run_ranking()?;
        self.run_calibration()?;
        info!(run_dir = %self.store.root().display(), "pipeline complete");
        Ok(())
    }
}
