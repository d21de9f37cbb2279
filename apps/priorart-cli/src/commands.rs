//! Subcommand implementations

use anyhow::{bail, Context, Result};
use chrono::NaiveDate;
use clap::{Args, ValueEnum};
use priorart_core::embeddings::BertEncoder;
use priorart_core::{
    CpcOperator, Embedder, FlatIndex, MetadataStore, Metric, PipelineConfig, PipelineStage,
    ProgressSink, QueryRequest, RecordId, SearchOutcome, SearchPipeline,
};
use serde_json::json;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tracing::info;

/// Widest title printed in table output
const TITLE_WIDTH: usize = 72;

#[derive(Args, Debug)]
pub struct SearchArgs {
    /// Claim text to search with
    #[arg(required_unless_present = "text_file", conflicts_with = "text_file")]
    pub text: Option<String>,

    /// Read the claim text from a file instead
    #[arg(long)]
    pub text_file: Option<PathBuf>,

    /// Number of results to return
    #[arg(long, default_value_t = 10)]
    pub top_k: usize,

    /// Earliest record date (YYYY-MM-DD)
    #[arg(long)]
    pub date_lower: Option<NaiveDate>,

    /// Latest record date (YYYY-MM-DD)
    #[arg(long)]
    pub date_upper: Option<NaiveDate>,

    /// CPC codes to filter on, comma separated
    #[arg(long, value_delimiter = ',')]
    pub cpc: Vec<String>,

    /// How CPC codes combine: AND or OR
    #[arg(long, default_value = "OR")]
    pub cpc_operator: CpcOperator,

    /// Print JSON instead of a table
    #[arg(long, conflicts_with = "csv")]
    pub json: bool,

    /// Print CSV instead of a table
    #[arg(long)]
    pub csv: bool,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum MetricArg {
    /// Inner product over normalized vectors
    Ip,
    /// Euclidean distance
    L2,
}

impl From<MetricArg> for Metric {
    fn from(arg: MetricArg) -> Self {
        match arg {
            MetricArg::Ip => Metric::InnerProduct,
            MetricArg::L2 => Metric::L2,
        }
    }
}

#[derive(Args, Debug)]
pub struct BuildIndexArgs {
    /// Output file, defaults to the configured index path
    #[arg(long)]
    pub output: Option<PathBuf>,

    #[arg(long, value_enum, default_value_t = MetricArg::Ip)]
    pub metric: MetricArg,

    /// Records read from the database per batch
    #[arg(long, default_value_t = 256)]
    pub batch_size: usize,
}

/// Prints stage transitions to stderr
struct StderrProgress;

impl ProgressSink for StderrProgress {
    fn on_stage(&self, stage: PipelineStage, percent: u8) {
        eprintln!("[{:>3}%] {:?}", percent, stage);
    }
}

pub async fn search(config: PipelineConfig, args: SearchArgs) -> Result<()> {
    let text = match (args.text, args.text_file) {
        (Some(text), _) => text,
        (None, Some(path)) => std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?,
        (None, None) => bail!("Provide claim text or --text-file"),
    };

    let pipeline = SearchPipeline::from_config(config).await?;
    let request = QueryRequest::new(text)
        .with_top_k(args.top_k)
        .with_dates(args.date_lower, args.date_upper)
        .with_cpc(args.cpc, args.cpc_operator);

    let outcome = pipeline.run(&request, &StderrProgress).await?;
    let device = pipeline.device_label();

    if args.json {
        let body = json!({
            "rows": outcome.rows,
            "elapsed_ms": outcome.elapsed.as_millis() as u64,
            "device": device,
            "candidates_considered": outcome.candidates_considered,
        });
        println!("{}", serde_json::to_string_pretty(&body)?);
    } else if args.csv {
        let mut stdout = std::io::stdout().lock();
        write_csv(&mut stdout, &outcome)?;
    } else {
        print_table(&outcome);
        eprintln!(
            "{} results from {} candidates in {:.2}s using {}",
            outcome.rows.len(),
            outcome.candidates_considered,
            outcome.elapsed.as_secs_f64(),
            device
        );
    }
    Ok(())
}

fn print_table(outcome: &SearchOutcome) {
    println!(
        "{:>4}  {:>14}  {:>10}  {:>6}  {:>6}  {}",
        "rank", "patent", "date", "score", "p_rej", "title"
    );
    for (rank, row) in outcome.rows.iter().enumerate() {
        println!(
            "{:>4}  {:>14}  {:>10}  {:>6.4}  {:>6.4}  {}",
            rank + 1,
            row.patent_number,
            row.date.to_string(),
            row.score,
            row.rejection_probability,
            truncate(&row.title, TITLE_WIDTH)
        );
    }
}

const CSV_HEADER: [&str; 7] = [
    "patent_number",
    "date",
    "title",
    "cpc_codes",
    "claims",
    "similarity",
    "rejection_probability",
];

/// Quote a field when it holds a delimiter, a quote or a line break
fn csv_field(value: &str) -> String {
    if value.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

fn write_csv<W: Write>(out: &mut W, outcome: &SearchOutcome) -> std::io::Result<()> {
    writeln!(out, "{}", CSV_HEADER.join(","))?;
    for row in &outcome.rows {
        let fields = [
            csv_field(&row.patent_number),
            row.date.to_string(),
            csv_field(&row.title),
            csv_field(&row.classification_codes.join(";")),
            csv_field(&row.claim_text),
            format!("{:.6}", row.score),
            format!("{:.6}", row.rejection_probability),
        ];
        writeln!(out, "{}", fields.join(","))?;
    }
    out.flush()
}

fn truncate(text: &str, width: usize) -> String {
    if text.chars().count() <= width {
        text.to_string()
    } else {
        let mut cut: String = text.chars().take(width.saturating_sub(3)).collect();
        cut.push_str("...");
        cut
    }
}

/// Index positions must line up with ids 1, 2, 3, ...
fn check_contiguous(position: usize, id: RecordId) -> Result<()> {
    let expected = RecordId::from_position(position);
    if id != expected {
        bail!(
            "Record ids must be contiguous from 1: expected {}, found {}",
            expected,
            id
        );
    }
    Ok(())
}

pub async fn build_index(config: PipelineConfig, args: BuildIndexArgs) -> Result<()> {
    let store = MetadataStore::open_read_only(&config.database_url).await?;
    let total = store.count().await?;
    if total == 0 {
        bail!("No records in {}", config.database_url);
    }

    let encoder = BertEncoder::load(&config.model_path, config.device)?;
    let embedder = Embedder::new(Arc::new(encoder), 0);
    let metric = Metric::from(args.metric);
    let normalize = metric == Metric::InnerProduct && config.normalize;
    info!(
        "Encoding {} records ({:?}, normalize={}) on {}",
        total,
        metric,
        normalize,
        embedder.device_label()
    );

    let started = Instant::now();
    let mut index = FlatIndex::new(embedder.dimension(), metric);
    let mut after = RecordId(0);
    loop {
        let batch = store.claim_batch(after, args.batch_size.max(1)).await?;
        if batch.is_empty() {
            break;
        }
        for (id, text) in batch {
            check_contiguous(index.len(), id)?;
            let vector = embedder
                .encode_uncached(&text, normalize)
                .with_context(|| format!("Failed to encode record {}", id))?;
            index.add(&vector)?;
            after = id;
        }
        info!("Encoded {}/{} records", index.len(), total);
    }

    let output = args.output.unwrap_or(config.index_path);
    if let Some(parent) = output.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    index.save(&output)?;
    info!(
        "Wrote {} vectors to {} in {:.1}s",
        index.len(),
        output.display(),
        started.elapsed().as_secs_f64()
    );
    Ok(())
}
