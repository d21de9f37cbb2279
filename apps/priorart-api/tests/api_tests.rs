//! Router tests for the PriorArt API
//!
//! Requests go through the real router with a pipeline built over a temporary
//! SQLite store and a small letter-frequency encoder.

use std::sync::Arc;

use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use chrono::NaiveDate;
use http_body_util::BodyExt;
use pretty_assertions::assert_eq;
use priorart_api::{router, AppState};
use priorart_core::{
    Calibration, Embedder, FlatIndex, MetadataStore, Metric, PipelineConfig, Record, RecordId,
    RejectionScorer, SearchPipeline, TextEncoder,
};
use serde_json::{json, Value};
use tower::ServiceExt;

/// Counts the letters a-z
struct LetterEncoder;

impl TextEncoder for LetterEncoder {
    fn dimension(&self) -> usize {
        26
    }

    fn encode_raw(&self, text: &str) -> priorart_core::Result<Vec<f32>> {
        let mut vector = vec![0.0f32; 26];
        for c in text.to_ascii_lowercase().bytes() {
            if c.is_ascii_lowercase() {
                vector[(c - b'a') as usize] += 1.0;
            }
        }
        Ok(vector)
    }
}

fn record(id: i64, year: i32, codes: &[&str], claims: &str) -> Record {
    Record {
        id: RecordId(id),
        patent_number: format!("US{}B2", 6_000_000 + id),
        date: NaiveDate::from_ymd_opt(year, 5, 1).unwrap(),
        title: format!("Patent {}", id),
        classification_codes: codes.iter().map(|c| c.to_string()).collect(),
        claim_text: claims.to_string(),
    }
}

async fn app(dir: &tempfile::TempDir) -> (Router, MetadataStore) {
    let records = vec![
        record(1, 2003, &["A01B63/00"], "plough share with adjustable frame"),
        record(2, 2008, &["G01S17/89"], "zigzag xylophone quiz"),
        record(3, 2014, &["A01B69/00", "G01S19/00"], "plough frame steered by satellite"),
    ];
    let url = format!("sqlite://{}", dir.path().join("records.db").display());
    let store = MetadataStore::open_writable(&url).await.unwrap();
    store.insert_records(&records).await.unwrap();

    let embedder = Embedder::new(Arc::new(LetterEncoder), 8);
    let vectors: Vec<Vec<f32>> = records
        .iter()
        .map(|r| embedder.encode_uncached(&r.claim_text, true).unwrap())
        .collect();
    let index = FlatIndex::build(26, Metric::InnerProduct, vectors).unwrap();
    let scorer = RejectionScorer::fit(&[0.3, 0.5, 0.6, 0.7, 0.9], Calibration::Normal).unwrap();
    let config = PipelineConfig::default()
        .with_candidate_pool(100)
        .with_max_top_k(20);

    let pipeline = SearchPipeline::new(
        Arc::new(embedder),
        Arc::new(index),
        Arc::new(store.clone()),
        Arc::new(scorer),
        config,
    )
    .unwrap();

    (router(Arc::new(AppState::from_pipeline(pipeline))), store)
}

async fn send(app: Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, body)
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

#[tokio::test]
async fn health_reports_index_and_store() {
    let dir = tempfile::tempdir().unwrap();
    let (app, _store) = app(&dir).await;

    let (status, body) = send(app, get("/health")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["store"], "healthy");
    assert_eq!(body["vectors"], 3);
    assert_eq!(body["dimension"], 26);
    assert_eq!(body["device"], "cpu");
}

#[tokio::test]
async fn search_returns_ranked_rows() {
    let dir = tempfile::tempdir().unwrap();
    let (app, _store) = app(&dir).await;

    let (status, body) = send(
        app,
        post_json("/search", json!({"text": "zigzag xylophone quiz", "top_k": 2})),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    let rows = body["rows"].as_array().unwrap();
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0]["id"], 2);
    assert_eq!(rows[0]["patent_number"], "US6000002B2");
    assert_eq!(rows[0]["date"], "2008-05-01");
    assert!(rows[0]["score"].as_f64().unwrap() > 0.99);
    let p = rows[0]["rejection_probability"].as_f64().unwrap();
    assert!((0.0..=1.0).contains(&p));
    assert_eq!(body["candidates_considered"], 3);
    assert_eq!(body["device"], "cpu");
    assert!(body["elapsed_ms"].is_u64());
}

#[tokio::test]
async fn search_applies_cpc_filter() {
    let dir = tempfile::tempdir().unwrap();
    let (app, _store) = app(&dir).await;

    let (status, body) = send(
        app,
        post_json(
            "/search",
            json!({
                "text": "zigzag xylophone quiz",
                "cpc_codes": ["A01B", "G01S"],
                "cpc_operator": "AND",
                "top_k": 5
            }),
        ),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    let ids: Vec<i64> = body["rows"]
        .as_array()
        .unwrap()
        .iter()
        .map(|r| r["id"].as_i64().unwrap())
        .collect();
    assert_eq!(ids, vec![3]);
}

#[tokio::test]
async fn invalid_search_is_bad_request() {
    let dir = tempfile::tempdir().unwrap();
    let (app, _store) = app(&dir).await;

    let (status, body) = send(
        app.clone(),
        post_json("/search", json!({"text": "   "})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["status"], 400);
    assert!(body["error"].as_str().unwrap().contains("empty"));

    let (status, _) = send(
        app,
        post_json(
            "/search",
            json!({"text": "plough", "date_lower": "2020-01-01", "date_upper": "2010-01-01"}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn malformed_body_is_json_bad_request() {
    let dir = tempfile::tempdir().unwrap();
    let (app, _store) = app(&dir).await;

    let bodies = [
        json!({"text": "plough", "top_k": -1}),
        json!({"text": "plough", "cpc_codes": ["A01B"], "cpc_operator": "XOR"}),
        json!({"text": "plough", "date_lower": "2020-13-45"}),
        json!({"top_k": 3}),
    ];
    for request in bodies {
        let (status, body) = send(app.clone(), post_json("/search", request.clone())).await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "{}", request);
        assert_eq!(body["status"], 400);
        assert!(body["error"]
            .as_str()
            .unwrap()
            .starts_with("Invalid request body"));
    }

    let not_json = Request::builder()
        .method("POST")
        .uri("/search")
        .header("content-type", "application/json")
        .body(Body::from("{\"text\": "))
        .unwrap();
    let (status, body) = send(app, not_json).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["status"], 400);
}

#[tokio::test]
async fn non_numeric_record_id_is_bad_request() {
    let dir = tempfile::tempdir().unwrap();
    let (app, _store) = app(&dir).await;

    let (status, body) = send(app, get("/records/abc")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["status"], 400);
}

#[tokio::test]
async fn closed_store_is_service_unavailable() {
    let dir = tempfile::tempdir().unwrap();
    let (app, store) = app(&dir).await;
    store.close().await;

    let (status, body) = send(app, post_json("/search", json!({"text": "plough"}))).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["status"], 503);
}

#[tokio::test]
async fn records_are_fetched_by_id() {
    let dir = tempfile::tempdir().unwrap();
    let (app, _store) = app(&dir).await;

    let (status, body) = send(app.clone(), get("/records/3")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["title"], "Patent 3");
    assert_eq!(body["patent_number"], "US6000003B2");
    assert_eq!(body["classification_codes"], json!(["A01B69/00", "G01S19/00"]));

    let (status, body) = send(app, get("/records/42")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["status"], 404);
}

#[tokio::test]
async fn calibration_exposes_reference_curve() {
    let dir = tempfile::tempdir().unwrap();
    let (app, _store) = app(&dir).await;

    let (status, body) = send(app, get("/calibration")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["summary"]["count"], 5);
    assert_eq!(body["summary"]["calibration"], "normal");
    let ecdf = body["ecdf"].as_array().unwrap();
    assert_eq!(ecdf.len(), 5);
    assert_eq!(ecdf[4]["fraction"], 1.0);
}
