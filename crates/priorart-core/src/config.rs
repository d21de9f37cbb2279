//! Configuration management for the search pipeline
//!
//! Handles artifact locations, search limits and model/device options.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;

use crate::error::{PriorArtError, Result};

/// Default number of candidates pulled from the vector index before filtering
pub const DEFAULT_CANDIDATE_POOL: usize = 50_000;

/// Default ceiling for `top_k`
pub const DEFAULT_MAX_TOP_K: usize = 1000;

/// Default embedding cache capacity (entries)
pub const DEFAULT_EMBED_CACHE: usize = 256;

/// Compute device for the embedding model
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DevicePreference {
    /// CUDA if available, then Metal, then CPU
    #[default]
    Auto,
    Cpu,
    Cuda,
    Metal,
}

impl FromStr for DevicePreference {
    type Err = PriorArtError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "auto" => Ok(DevicePreference::Auto),
            "cpu" => Ok(DevicePreference::Cpu),
            "cuda" | "gpu" => Ok(DevicePreference::Cuda),
            "metal" | "mps" => Ok(DevicePreference::Metal),
            _ => Err(PriorArtError::Config(format!("Unknown device: {}", s))),
        }
    }
}

/// How similarity scores are turned into rejection probabilities
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Calibration {
    /// Normal distribution fitted to the reference scores
    #[default]
    Normal,
    /// Empirical CDF of the reference scores
    Empirical,
}

impl FromStr for Calibration {
    type Err = PriorArtError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "normal" | "gaussian" => Ok(Calibration::Normal),
            "empirical" | "ecdf" => Ok(Calibration::Empirical),
            _ => Err(PriorArtError::Config(format!("Unknown calibration: {}", s))),
        }
    }
}

/// Pipeline configuration
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// SQLite connection URL for the metadata store
    pub database_url: String,
    /// Flat vector index file
    pub index_path: PathBuf,
    /// Directory holding config.json, tokenizer.json and model.safetensors
    pub model_path: PathBuf,
    /// Historical rejection similarity scores
    pub reference_path: PathBuf,
    /// Candidates requested from the vector index per query
    pub candidate_pool: usize,
    /// Largest accepted `top_k`
    pub max_top_k: usize,
    /// Embedding cache capacity, 0 disables caching
    pub embed_cache: usize,
    /// L2-normalize query vectors before search
    pub normalize: bool,
    pub device: DevicePreference,
    pub calibration: Calibration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite:./data/records.db".to_string(),
            index_path: PathBuf::from("./indexes/flat_ip_norm.idx"),
            model_path: PathBuf::from("./models/encoder"),
            reference_path: PathBuf::from("./data/rejected_scoring.tsv"),
            candidate_pool: DEFAULT_CANDIDATE_POOL,
            max_top_k: DEFAULT_MAX_TOP_K,
            embed_cache: DEFAULT_EMBED_CACHE,
            normalize: true,
            device: DevicePreference::Auto,
            calibration: Calibration::Normal,
        }
    }
}

impl PipelineConfig {
    /// Load configuration from environment variables
    ///
    /// Expected variables (all optional):
    /// - PRIORART_DATABASE_URL: SQLite URL of the records database
    /// - PRIORART_INDEX_PATH: Vector index file
    /// - PRIORART_MODEL_PATH: Encoder model directory
    /// - PRIORART_REFERENCE_PATH: Reference score file
    /// - PRIORART_CANDIDATE_POOL: Candidates pulled before filtering
    /// - PRIORART_MAX_TOP_K: Largest accepted top_k
    /// - PRIORART_EMBED_CACHE: Embedding cache capacity
    /// - PRIORART_NORMALIZE: "true" or "false"
    /// - PRIORART_DEVICE: "auto", "cpu", "cuda" or "metal"
    /// - PRIORART_CALIBRATION: "normal" or "empirical"
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a configuration from any key lookup (used by `from_env` and tests)
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(url) = lookup("PRIORART_DATABASE_URL") {
            config.database_url = url;
        }
        if let Some(path) = lookup("PRIORART_INDEX_PATH") {
            config.index_path = PathBuf::from(path);
        }
        if let Some(path) = lookup("PRIORART_MODEL_PATH") {
            config.model_path = PathBuf::from(path);
        }
        if let Some(path) = lookup("PRIORART_REFERENCE_PATH") {
            config.reference_path = PathBuf::from(path);
        }
        if let Some(value) = lookup("PRIORART_CANDIDATE_POOL") {
            config.candidate_pool = parse_positive("PRIORART_CANDIDATE_POOL", &value)?;
        }
        if let Some(value) = lookup("PRIORART_MAX_TOP_K") {
            config.max_top_k = parse_positive("PRIORART_MAX_TOP_K", &value)?;
        }
        if let Some(value) = lookup("PRIORART_EMBED_CACHE") {
            config.embed_cache = value.trim().parse().map_err(|_| {
                PriorArtError::Config(format!("PRIORART_EMBED_CACHE is not a number: {}", value))
            })?;
        }
        if let Some(value) = lookup("PRIORART_NORMALIZE") {
            config.normalize = match value.to_lowercase().as_str() {
                "1" | "true" | "yes" => true,
                "0" | "false" | "no" => false,
                _ => {
                    return Err(PriorArtError::Config(format!(
                        "PRIORART_NORMALIZE must be true or false: {}",
                        value
                    )))
                }
            };
        }
        if let Some(value) = lookup("PRIORART_DEVICE") {
            config.device = value.parse()?;
        }
        if let Some(value) = lookup("PRIORART_CALIBRATION") {
            config.calibration = value.parse()?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints
    pub fn validate(&self) -> Result<()> {
        if self.max_top_k > self.candidate_pool {
            return Err(PriorArtError::Config(format!(
                "max_top_k ({}) exceeds candidate_pool ({})",
                self.max_top_k, self.candidate_pool
            )));
        }
        Ok(())
    }

    pub fn with_candidate_pool(mut self, candidate_pool: usize) -> Self {
        self.candidate_pool = candidate_pool;
        self
    }

    pub fn with_max_top_k(mut self, max_top_k: usize) -> Self {
        self.max_top_k = max_top_k;
        self
    }

    pub fn with_normalize(mut self, normalize: bool) -> Self {
        self.normalize = normalize;
        self
    }

    pub fn with_calibration(mut self, calibration: Calibration) -> Self {
        self.calibration = calibration;
        self
    }
}

fn parse_positive(key: &str, value: &str) -> Result<usize> {
    match value.trim().parse::<usize>() {
        Ok(n) if n > 0 => Ok(n),
        _ => Err(PriorArtError::Config(format!(
            "{} must be a positive integer: {}",
            key, value
        ))),
    }
}
