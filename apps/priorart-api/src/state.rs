//! Application state for the PriorArt API
//!
//! Every service (store, index, model, scorer) is built once at startup and
//! shared read-only through the pipeline.

use anyhow::Result;
use priorart_core::{PipelineConfig, SearchPipeline};
use tracing::info;

pub struct AppState {
    pub pipeline: SearchPipeline,
}

impl AppState {
    /// Load every artifact from environment configuration
    pub async fn new() -> Result<Self> {
        let config = PipelineConfig::from_env()?;
        info!(
            "Loading artifacts: index={}, model={}, reference={}",
            config.index_path.display(),
            config.model_path.display(),
            config.reference_path.display()
        );
        let pipeline = SearchPipeline::from_config(config).await?;
        Ok(Self { pipeline })
    }

    pub fn from_pipeline(pipeline: SearchPipeline) -> Self {
        Self { pipeline }
    }
}
