//! Joins ranked index hits to store metadata
//!
//! Ranking happens over the whole candidate pool first; the date and CPC
//! filters only remove rows afterwards, and the survivors are truncated to
//! `top_k`. A restrictive filter therefore returns fewer rows, never rows
//! pulled from deeper in the index.

use serde::Serialize;

use crate::error::Result;
use crate::index::SearchHit;
use crate::record::{CpcFilter, DateRange, Record};
use crate::store::MetadataStore;

/// A record that survived filtering, with its similarity score
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RankedRecord {
    pub record: Record,
    pub score: f32,
    /// 0-based rank in the unfiltered candidate list
    pub rank: usize,
}

/// Filter `hits` through the store and keep the best `top_k`.
///
/// Output is ordered by descending score; equal scores keep candidate rank
/// order. Hits whose record is missing or filtered out are dropped.
pub async fn assemble(
    store: &MetadataStore,
    hits: &[SearchHit],
    top_k: usize,
    dates: &DateRange,
    cpc: Option<&CpcFilter>,
) -> Result<Vec<RankedRecord>> {
    if hits.is_empty() || top_k == 0 {
        return Ok(Vec::new());
    }

    let ids: Vec<_> = hits.iter().map(SearchHit::record_id).collect();
    let mut found = store.get_records(&ids, dates, cpc).await?;

    let mut ranked: Vec<RankedRecord> = hits
        .iter()
        .enumerate()
        .filter_map(|(rank, hit)| {
            found.remove(&hit.record_id()).map(|record| RankedRecord {
                record,
                score: hit.score,
                rank,
            })
        })
        .collect();

    // stable, so ties stay in candidate order
    ranked.sort_by(|a, b| b.score.total_cmp(&a.score));
    ranked.truncate(top_k);

    tracing::debug!(
        "Assembled {} rows from {} candidates (top_k {})",
        ranked.len(),
        hits.len(),
        top_k
    );
    Ok(ranked)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{CpcOperator, RecordId};
    use chrono::NaiveDate;
    use pretty_assertions::assert_eq;

    fn record(id: i64, year: i32, codes: &[&str]) -> Record {
        Record {
            id: RecordId(id),
            patent_number: format!("US{}A1", id),
            date: NaiveDate::from_ymd_opt(year, 6, 1).unwrap(),
            title: format!("Title {}", id),
            classification_codes: codes.iter().map(|c| c.to_string()).collect(),
            claim_text: format!("claims of {}", id),
        }
    }

    async fn store(dir: &tempfile::TempDir) -> MetadataStore {
        let url = format!("sqlite://{}", dir.path().join("records.db").display());
        let store = MetadataStore::open_writable(&url).await.unwrap();
        store
            .insert_records(&[
                record(1, 2001, &["A01B1/00"]),
                record(2, 2002, &["G01S7/48"]),
                record(3, 2003, &["A01B5/00"]),
                record(4, 2004, &["H04N5/00"]),
                record(5, 2005, &["A01B9/00"]),
            ])
            .await
            .unwrap();
        store
    }

    fn hit(position: usize, score: f32) -> SearchHit {
        SearchHit { score, position }
    }

    fn result_ids(rows: &[RankedRecord]) -> Vec<i64> {
        rows.iter().map(|r| r.record.id.0).collect()
    }

    #[tokio::test]
    async fn test_returns_fewer_rows_when_filter_removes_candidates() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir).await;
        let hits = vec![hit(1, 0.9), hit(0, 0.8), hit(3, 0.7), hit(2, 0.6), hit(4, 0.5)];
        let filter = CpcFilter::new(["A01B"], CpcOperator::Or);

        let rows = assemble(&store, &hits, 5, &DateRange::unbounded(), Some(&filter))
            .await
            .unwrap();
        assert_eq!(result_ids(&rows), vec![1, 3, 5]);
        assert_eq!(rows[0].rank, 1);
        assert_eq!(rows[0].score, 0.8);
    }

    #[tokio::test]
    async fn test_filter_can_exclude_the_best_hits() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir).await;
        let hits = vec![hit(0, 0.95), hit(1, 0.9), hit(2, 0.4), hit(3, 0.3)];
        let dates = DateRange::new(
            NaiveDate::from_ymd_opt(2003, 1, 1).unwrap(),
            NaiveDate::from_ymd_opt(2010, 1, 1).unwrap(),
        )
        .unwrap();

        let rows = assemble(&store, &hits, 1, &dates, None).await.unwrap();
        assert_eq!(result_ids(&rows), vec![3]);
    }

    #[tokio::test]
    async fn test_truncates_and_keeps_tie_order() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir).await;
        let hits = vec![hit(4, 0.5), hit(2, 0.5), hit(0, 0.5), hit(1, 0.1)];

        let rows = assemble(&store, &hits, 2, &DateRange::unbounded(), None)
            .await
            .unwrap();
        assert_eq!(result_ids(&rows), vec![5, 3]);
    }

    #[tokio::test]
    async fn test_unknown_positions_are_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir).await;
        let hits = vec![hit(40, 0.99), hit(0, 0.2)];

        let rows = assemble(&store, &hits, 10, &DateRange::unbounded(), None)
            .await
            .unwrap();
        assert_eq!(result_ids(&rows), vec![1]);
        assert!(assemble(&store, &[], 10, &DateRange::unbounded(), None)
            .await
            .unwrap()
            .is_empty());
    }
}
