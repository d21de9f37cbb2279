//! Query orchestration
//!
//! One query moves through `Idle -> Encoding -> Searching -> Filtering ->
//! Scoring -> Done`. Any error moves it to `Failed` and nothing partial is
//! returned. Every transition is logged and reported to a `ProgressSink`.

use anyhow::Context;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::assemble::{assemble, RankedRecord};
use crate::config::PipelineConfig;
use crate::embeddings::{BertEncoder, Embedder};
use crate::error::{PriorArtError, Result};
use crate::index::{FlatIndex, Metric};
use crate::record::{CpcFilter, CpcOperator, DateRange, RecordId};
use crate::scoring::{ReferenceDistribution, RejectionScorer};
use crate::store::MetadataStore;

/// Stage of a single query
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStage {
    Idle,
    Encoding,
    Searching,
    Filtering,
    Scoring,
    Done,
    Failed,
}

impl PipelineStage {
    /// Progress shown when the stage is entered
    pub fn percent(self) -> u8 {
        match self {
            PipelineStage::Idle => 0,
            PipelineStage::Encoding => 10,
            PipelineStage::Searching => 30,
            PipelineStage::Filtering => 60,
            PipelineStage::Scoring => 85,
            PipelineStage::Done => 100,
            PipelineStage::Failed => 100,
        }
    }
}

/// Receives stage transitions, e.g. to drive a progress bar
pub trait ProgressSink: Send + Sync {
    fn on_stage(&self, stage: PipelineStage, percent: u8);
}

/// Sink that ignores progress
#[derive(Debug, Default, Clone, Copy)]
pub struct NoProgress;

impl ProgressSink for NoProgress {
    fn on_stage(&self, _stage: PipelineStage, _percent: u8) {}
}

fn default_top_k() -> usize {
    10
}

/// A prior-art query
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryRequest {
    /// Claim text to search with
    pub text: String,
    #[serde(default)]
    pub date_lower: Option<NaiveDate>,
    #[serde(default)]
    pub date_upper: Option<NaiveDate>,
    #[serde(default)]
    pub cpc_codes: Vec<String>,
    #[serde(default)]
    pub cpc_operator: CpcOperator,
    #[serde(default = "default_top_k")]
    pub top_k: usize,
}

impl QueryRequest {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            date_lower: None,
            date_upper: None,
            cpc_codes: Vec::new(),
            cpc_operator: CpcOperator::default(),
            top_k: default_top_k(),
        }
    }

    pub fn with_top_k(mut self, top_k: usize) -> Self {
        self.top_k = top_k;
        self
    }

    pub fn with_dates(mut self, lower: Option<NaiveDate>, upper: Option<NaiveDate>) -> Self {
        self.date_lower = lower;
        self.date_upper = upper;
        self
    }

    pub fn with_cpc<I, S>(mut self, codes: I, operator: CpcOperator) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.cpc_codes = codes.into_iter().map(Into::into).collect();
        self.cpc_operator = operator;
        self
    }
}

/// One ranked result
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryResultRow {
    pub id: RecordId,
    pub patent_number: String,
    pub date: NaiveDate,
    pub title: String,
    pub classification_codes: Vec<String>,
    pub claim_text: String,
    pub score: f32,
    pub rejection_probability: f64,
}

/// Result of a completed query
#[derive(Debug, Clone)]
pub struct SearchOutcome {
    pub rows: Vec<QueryResultRow>,
    /// Hits taken from the index before filtering
    pub candidates_considered: usize,
    pub elapsed: Duration,
}

/// Validated form of a `QueryRequest`
struct ValidatedQuery<'a> {
    text: &'a str,
    dates: DateRange,
    cpc: Option<CpcFilter>,
    top_k: usize,
}

struct StageTracker<'a> {
    sink: &'a dyn ProgressSink,
    current: PipelineStage,
}

impl<'a> StageTracker<'a> {
    fn enter(&mut self, stage: PipelineStage) {
        tracing::debug!("Pipeline stage {:?} -> {:?}", self.current, stage);
        self.current = stage;
        self.sink.on_stage(stage, stage.percent());
    }

    fn fail(&mut self) {
        let reached = self.current.percent();
        tracing::debug!("Pipeline stage {:?} -> Failed", self.current);
        self.current = PipelineStage::Failed;
        self.sink.on_stage(PipelineStage::Failed, reached);
    }
}

/// Drives a query through embedding, search, filtering and scoring
pub struct SearchPipeline {
    embedder: Arc<Embedder>,
    index: Arc<FlatIndex>,
    store: Arc<MetadataStore>,
    scorer: Arc<RejectionScorer>,
    config: PipelineConfig,
}

impl SearchPipeline {
    /// Wire the components together. The embedder and the index must agree
    /// on the vector dimension.
    pub fn new(
        embedder: Arc<Embedder>,
        index: Arc<FlatIndex>,
        store: Arc<MetadataStore>,
        scorer: Arc<RejectionScorer>,
        config: PipelineConfig,
    ) -> Result<Self> {
        config.validate()?;
        if embedder.dimension() != index.dimension() {
            return Err(PriorArtError::DimensionMismatch {
                expected: index.dimension(),
                actual: embedder.dimension(),
            });
        }
        Ok(Self {
            embedder,
            index,
            store,
            scorer,
            config,
        })
    }

    /// Load every artifact named by `config` and wire the pipeline
    pub async fn from_config(config: PipelineConfig) -> anyhow::Result<Self> {
        config.validate()?;

        let store = MetadataStore::open_read_only(&config.database_url)
            .await
            .with_context(|| format!("Failed to open {}", config.database_url))?;
        let record_count = store.count().await?;

        let index = FlatIndex::load(&config.index_path)
            .with_context(|| format!("Failed to load index {}", config.index_path.display()))?;
        if index.len() as u64 != record_count {
            tracing::warn!(
                "Index holds {} vectors but the store has {} records",
                index.len(),
                record_count
            );
        }

        let encoder = BertEncoder::load(&config.model_path, config.device)?;
        let embedder = Embedder::new(Arc::new(encoder), config.embed_cache);
        tracing::info!(
            "Embedding model ready: {} dimensions on {}",
            embedder.dimension(),
            embedder.device_label()
        );

        let reference = ReferenceDistribution::load(&config.reference_path)?;
        let scorer = RejectionScorer::from_distribution(&reference, config.calibration)?;

        Ok(Self::new(
            Arc::new(embedder),
            Arc::new(index),
            Arc::new(store),
            Arc::new(scorer),
            config,
        )?)
    }

    pub fn store(&self) -> &MetadataStore {
        &self.store
    }

    pub fn scorer(&self) -> &RejectionScorer {
        &self.scorer
    }

    pub fn index(&self) -> &FlatIndex {
        &self.index
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Device the embedding model runs on
    pub fn device_label(&self) -> String {
        self.embedder.device_label()
    }

    fn validate<'r>(&self, request: &'r QueryRequest) -> Result<ValidatedQuery<'r>> {
        let text = request.text.trim();
        if text.is_empty() {
            return Err(PriorArtError::Input("query text is empty".to_string()));
        }
        if request.top_k == 0 {
            return Err(PriorArtError::Input("top_k must be at least 1".to_string()));
        }
        if request.top_k > self.config.max_top_k {
            return Err(PriorArtError::Input(format!(
                "top_k {} exceeds the maximum of {}",
                request.top_k, self.config.max_top_k
            )));
        }
        let dates = DateRange::from_bounds(request.date_lower, request.date_upper)?;
        let cpc = CpcFilter::new(&request.cpc_codes, request.cpc_operator);
        Ok(ValidatedQuery {
            text,
            dates,
            cpc: (!cpc.is_empty()).then_some(cpc),
            top_k: request.top_k,
        })
    }

    /// Run one query to completion
    pub async fn run(
        &self,
        request: &QueryRequest,
        progress: &dyn ProgressSink,
    ) -> Result<SearchOutcome> {
        let started = Instant::now();
        let mut tracker = StageTracker {
            sink: progress,
            current: PipelineStage::Idle,
        };

        match self.execute(request, &mut tracker).await {
            Ok((rows, candidates_considered)) => {
                tracker.enter(PipelineStage::Done);
                let elapsed = started.elapsed();
                tracing::info!(
                    "Search returned {} rows from {} candidates in {:.2?} ({})",
                    rows.len(),
                    candidates_considered,
                    elapsed,
                    self.device_label()
                );
                Ok(SearchOutcome {
                    rows,
                    candidates_considered,
                    elapsed,
                })
            }
            Err(e) => {
                tracing::warn!("Search failed during {:?}: {}", tracker.current, e);
                tracker.fail();
                Err(e)
            }
        }
    }

    async fn execute(
        &self,
        request: &QueryRequest,
        tracker: &mut StageTracker<'_>,
    ) -> Result<(Vec<QueryResultRow>, usize)> {
        let query = self.validate(request)?;

        // Model inference and the exact scan are CPU bound and stay off the
        // async workers
        tracker.enter(PipelineStage::Encoding);
        let embedder = Arc::clone(&self.embedder);
        let text = query.text.to_string();
        let normalize = self.normalize_query();
        let vector =
            tokio::task::spawn_blocking(move || embedder.encode(&text, normalize)).await??;

        tracker.enter(PipelineStage::Searching);
        let index = Arc::clone(&self.index);
        let pool = self.config.candidate_pool;
        let hits = tokio::task::spawn_blocking(move || index.search(&vector, pool)).await??;
        tracing::debug!("Index returned {} candidates", hits.len());

        tracker.enter(PipelineStage::Filtering);
        let ranked = assemble(
            &self.store,
            &hits,
            query.top_k,
            &query.dates,
            query.cpc.as_ref(),
        )
        .await?;

        tracker.enter(PipelineStage::Scoring);
        let rows = ranked
            .into_iter()
            .map(|ranked| self.score_row(ranked))
            .collect();

        Ok((rows, hits.len()))
    }

    /// Queries are normalized only for inner-product indexes, which is the
    /// only metric `build-index` stores normalized vectors for
    fn normalize_query(&self) -> bool {
        self.config.normalize && self.index.metric() == Metric::InnerProduct
    }

    fn score_row(&self, ranked: RankedRecord) -> QueryResultRow {
        let RankedRecord { record, score, .. } = ranked;
        QueryResultRow {
            id: record.id,
            patent_number: record.patent_number,
            date: record.date,
            title: record.title,
            classification_codes: record.classification_codes,
            claim_text: record.claim_text,
            score,
            rejection_probability: self.scorer.probability(score as f64),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Calibration;
    use crate::embeddings::TextEncoder;
    use crate::record::Record;
    use std::sync::Mutex;

    const VOCABULARY: [&str; 6] = ["mower", "deck", "lidar", "laser", "battery", "cell"];

    /// Counts vocabulary words, plus a constant component
    struct KeywordEncoder;

    impl TextEncoder for KeywordEncoder {
        fn dimension(&self) -> usize {
            VOCABULARY.len() + 1
        }

        fn encode_raw(&self, text: &str) -> Result<Vec<f32>> {
            let lower = text.to_lowercase();
            let mut vector: Vec<f32> = VOCABULARY
                .iter()
                .map(|word| lower.matches(word).count() as f32)
                .collect();
            vector.push(0.1);
            Ok(vector)
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        stages: Mutex<Vec<(PipelineStage, u8)>>,
    }

    impl RecordingSink {
        fn stages(&self) -> Vec<PipelineStage> {
            self.stages.lock().unwrap().iter().map(|(s, _)| *s).collect()
        }
    }

    impl ProgressSink for RecordingSink {
        fn on_stage(&self, stage: PipelineStage, percent: u8) {
            self.stages.lock().unwrap().push((stage, percent));
        }
    }

    fn record(id: i64, year: i32, codes: &[&str], claims: &str) -> Record {
        Record {
            id: RecordId(id),
            patent_number: format!("US{}", 9_000_000 + id),
            date: NaiveDate::from_ymd_opt(year, 1, 1).unwrap(),
            title: format!("Patent {}", id),
            classification_codes: codes.iter().map(|c| c.to_string()).collect(),
            claim_text: claims.to_string(),
        }
    }

    async fn pipeline(dir: &tempfile::TempDir) -> SearchPipeline {
        let records = vec![
            record(1, 2001, &["A01D34/66"], "A mower deck with a mower blade"),
            record(2, 2010, &["G01S17/10"], "A lidar unit with a pulsed laser"),
            record(3, 2015, &["H01M10/04"], "A battery cell with a battery casing"),
            record(4, 2018, &["A01D34/00", "G01S17/93"], "A robotic mower using lidar"),
        ];
        let url = format!("sqlite://{}", dir.path().join("records.db").display());
        let store = MetadataStore::open_writable(&url).await.unwrap();
        store.insert_records(&records).await.unwrap();

        let embedder = Embedder::new(Arc::new(KeywordEncoder), 16);
        let vectors: Vec<Vec<f32>> = records
            .iter()
            .map(|r| embedder.encode_uncached(&r.claim_text, true).unwrap())
            .collect();
        let index = FlatIndex::build(embedder.dimension(), Metric::InnerProduct, vectors).unwrap();
        let scorer =
            RejectionScorer::fit(&[0.2, 0.4, 0.5, 0.6, 0.8], Calibration::Normal).unwrap();
        let config = PipelineConfig::default()
            .with_candidate_pool(100)
            .with_max_top_k(50);

        SearchPipeline::new(
            Arc::new(embedder),
            Arc::new(index),
            Arc::new(store),
            Arc::new(scorer),
            config,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_runs_every_stage_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = pipeline(&dir).await;
        let sink = RecordingSink::default();

        let outcome = pipeline
            .run(&QueryRequest::new("mower deck").with_top_k(2), &sink)
            .await
            .unwrap();

        assert_eq!(
            sink.stages(),
            vec![
                PipelineStage::Encoding,
                PipelineStage::Searching,
                PipelineStage::Filtering,
                PipelineStage::Scoring,
                PipelineStage::Done,
            ]
        );
        assert_eq!(outcome.candidates_considered, 4);
        assert_eq!(outcome.rows.len(), 2);
        assert_eq!(outcome.rows[0].id, RecordId(1));
        assert_eq!(outcome.rows[0].patent_number, "US9000001");
        assert_eq!(outcome.rows[1].id, RecordId(4));
        assert!(outcome.rows[0].rejection_probability >= outcome.rows[1].rejection_probability);
    }

    #[tokio::test]
    async fn test_filters_apply_after_ranking() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = pipeline(&dir).await;

        let request = QueryRequest::new("mower deck")
            .with_top_k(3)
            .with_cpc(["G01S"], CpcOperator::Or);
        let outcome = pipeline.run(&request, &NoProgress).await.unwrap();
        let ids: Vec<i64> = outcome.rows.iter().map(|r| r.id.0).collect();
        assert_eq!(ids, vec![4, 2]);
    }

    #[tokio::test]
    async fn test_empty_filtered_result_is_success() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = pipeline(&dir).await;

        let request = QueryRequest::new("battery").with_dates(
            NaiveDate::from_ymd_opt(1990, 1, 1),
            NaiveDate::from_ymd_opt(1995, 1, 1),
        );
        let outcome = pipeline.run(&request, &NoProgress).await.unwrap();
        assert!(outcome.rows.is_empty());
        assert_eq!(outcome.candidates_considered, 4);
    }

    #[tokio::test]
    async fn test_invalid_requests_fail_without_rows() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = pipeline(&dir).await;

        let bad = vec![
            QueryRequest::new("   "),
            QueryRequest::new("mower").with_top_k(0),
            QueryRequest::new("mower").with_top_k(51),
            QueryRequest::new("mower").with_dates(
                NaiveDate::from_ymd_opt(2020, 1, 1),
                NaiveDate::from_ymd_opt(2010, 1, 1),
            ),
        ];
        for request in bad {
            let sink = RecordingSink::default();
            let err = pipeline.run(&request, &sink).await.unwrap_err();
            assert!(matches!(err, PriorArtError::Input(_)), "{:?}", request);
            assert_eq!(sink.stages(), vec![PipelineStage::Failed]);
        }
    }

    #[tokio::test]
    async fn test_store_failure_aborts_in_filtering() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = pipeline(&dir).await;
        pipeline.store().close().await;
        let sink = RecordingSink::default();

        let err = pipeline
            .run(&QueryRequest::new("laser"), &sink)
            .await
            .unwrap_err();
        assert!(matches!(err, PriorArtError::StoreUnavailable(_)));
        let recorded = sink.stages.lock().unwrap().clone();
        assert_eq!(
            recorded.last(),
            Some(&(PipelineStage::Failed, PipelineStage::Filtering.percent()))
        );
    }

    #[tokio::test]
    async fn test_l2_index_queries_are_not_normalized() {
        let dir = tempfile::tempdir().unwrap();
        let base = pipeline(&dir).await;

        let embedder = Embedder::new(Arc::new(KeywordEncoder), 16);
        let claims = [
            "A mower deck with a mower blade",
            "A lidar unit with a pulsed laser",
            "A battery cell with a battery casing",
        ];
        let vectors: Vec<Vec<f32>> = claims
            .iter()
            .map(|c| embedder.encode_uncached(c, false).unwrap())
            .collect();
        let index = FlatIndex::build(embedder.dimension(), Metric::L2, vectors).unwrap();
        let pipeline = SearchPipeline::new(
            Arc::new(embedder),
            Arc::new(index),
            Arc::new(base.store().clone()),
            Arc::new(RejectionScorer::fit(&[-4.0, -2.0, -1.0, 0.0], Calibration::Normal).unwrap()),
            PipelineConfig::default().with_candidate_pool(10),
        )
        .unwrap();
        assert!(pipeline.config().normalize);

        let outcome = pipeline
            .run(&QueryRequest::new("A battery cell with a battery casing"), &NoProgress)
            .await
            .unwrap();
        assert_eq!(outcome.rows[0].id, RecordId(3));
        assert_eq!(outcome.rows[0].score, 0.0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_queries_share_the_pipeline() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = Arc::new(pipeline(&dir).await);

        let tasks: Vec<_> = ["mower", "lidar laser", "battery", "laser"]
            .into_iter()
            .map(|text| {
                let pipeline = Arc::clone(&pipeline);
                tokio::spawn(async move {
                    pipeline
                        .run(&QueryRequest::new(text).with_top_k(1), &NoProgress)
                        .await
                })
            })
            .collect();

        let mut top = Vec::new();
        for task in tasks {
            let outcome = task.await.unwrap().unwrap();
            top.push(outcome.rows[0].id.0);
        }
        assert_eq!(top, vec![1, 2, 3, 2]);
    }

    #[test]
    fn test_request_defaults_from_json() {
        let request: QueryRequest = serde_json::from_str(r#"{"text": "a mower"}"#).unwrap();
        assert_eq!(request.top_k, 10);
        assert_eq!(request.cpc_operator, CpcOperator::Or);
        assert!(request.cpc_codes.is_empty());

        let request: QueryRequest = serde_json::from_str(
            r#"{"text": "x", "date_lower": "2001-02-03", "cpc_codes": ["A01B"], "cpc_operator": "AND", "top_k": 5}"#,
        )
        .unwrap();
        assert_eq!(request.date_lower, NaiveDate::from_ymd_opt(2001, 2, 3));
        assert_eq!(request.cpc_operator, CpcOperator::And);
    }
}
