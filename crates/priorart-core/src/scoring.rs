//! Rejection probability calibration
//!
//! Similarity scores of past applications that were rejected for lack of
//! novelty form a reference distribution. A new score is mapped through the
//! CDF of that distribution: either a normal fit (mean and sample standard
//! deviation) or the empirical CDF itself.

use serde::Serialize;
use std::path::Path;

use crate::config::Calibration;
use crate::error::{PriorArtError, Result};

/// Below this many samples the fitted parameters are unreliable
const FEW_SAMPLES: usize = 30;

/// Column holding the scores in a delimited reference file
const SCORE_COLUMN: &str = "sim";

/// Historical similarity scores loaded from disk
#[derive(Debug, Clone, PartialEq)]
pub struct ReferenceDistribution {
    scores: Vec<f64>,
}

impl ReferenceDistribution {
    pub fn from_scores(scores: Vec<f64>) -> Self {
        Self { scores }
    }

    /// Load scores from a plain list (one per line) or from a tab/comma
    /// delimited file whose header names a `sim` column. Blank lines and
    /// empty cells are skipped.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            PriorArtError::ReferenceFile(format!("cannot read {}: {}", path.display(), e))
        })?;
        let distribution = Self::parse(&content)?;
        tracing::info!(
            "Loaded {} reference scores from {}",
            distribution.len(),
            path.display()
        );
        Ok(distribution)
    }

    pub fn parse(content: &str) -> Result<Self> {
        let mut lines = content
            .lines()
            .enumerate()
            .filter(|(_, line)| !line.trim().is_empty())
            .peekable();

        let Some(&(_, first)) = lines.peek() else {
            return Ok(Self::from_scores(Vec::new()));
        };

        let delimiter = if first.contains('\t') {
            Some('\t')
        } else if first.contains(',') {
            Some(',')
        } else {
            None
        };
        let split = |line: &str| -> Vec<String> {
            match delimiter {
                Some(d) => line.split(d).map(|f| f.trim().to_string()).collect(),
                None => vec![line.trim().to_string()],
            }
        };

        let header = split(first);
        let column = match header
            .iter()
            .position(|f| f.trim_matches('"').eq_ignore_ascii_case(SCORE_COLUMN))
        {
            Some(column) => {
                lines.next();
                column
            }
            None if header.len() == 1 => 0,
            None => {
                return Err(PriorArtError::ReferenceFile(format!(
                    "delimited file has no '{}' column",
                    SCORE_COLUMN
                )))
            }
        };

        let mut scores = Vec::new();
        for (number, line) in lines {
            let fields = split(line);
            let field = fields.get(column).ok_or_else(|| {
                PriorArtError::ReferenceFile(format!("line {}: missing score column", number + 1))
            })?;
            if field.is_empty() {
                continue;
            }
            let score: f64 = field.parse().map_err(|_| {
                PriorArtError::ReferenceFile(format!(
                    "line {}: '{}' is not a number",
                    number + 1,
                    field
                ))
            })?;
            scores.push(score);
        }

        Ok(Self::from_scores(scores))
    }

    pub fn scores(&self) -> &[f64] {
        &self.scores
    }

    pub fn len(&self) -> usize {
        self.scores.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scores.is_empty()
    }
}

/// Descriptive statistics of the reference distribution
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReferenceSummary {
    pub count: usize,
    pub mean: f64,
    pub std: f64,
    pub min: f64,
    pub max: f64,
    pub calibration: Calibration,
}

/// One step of the reference ECDF
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct EcdfPoint {
    pub score: f64,
    pub fraction: f64,
}

/// Maps similarity scores to rejection probabilities
#[derive(Debug, Clone)]
pub struct RejectionScorer {
    calibration: Calibration,
    mean: f64,
    std: f64,
    /// Reference samples, ascending
    sorted: Vec<f64>,
}

impl RejectionScorer {
    /// Fit to reference scores.
    ///
    /// # Errors
    ///
    /// `InsufficientReferenceData` with fewer than two samples, any non-finite
    /// sample, or zero spread.
    pub fn fit(scores: &[f64], calibration: Calibration) -> Result<Self> {
        if scores.len() < 2 {
            return Err(PriorArtError::InsufficientReferenceData(format!(
                "need at least 2 scores, got {}",
                scores.len()
            )));
        }
        if scores.iter().any(|s| !s.is_finite()) {
            return Err(PriorArtError::InsufficientReferenceData(
                "reference scores contain non-finite values".to_string(),
            ));
        }

        let n = scores.len() as f64;
        let mean = scores.iter().sum::<f64>() / n;
        let variance = scores.iter().map(|s| (s - mean).powi(2)).sum::<f64>() / (n - 1.0);
        let std = variance.sqrt();
        if std <= 0.0 || !std.is_finite() {
            return Err(PriorArtError::InsufficientReferenceData(
                "reference scores have zero spread".to_string(),
            ));
        }

        if scores.len() < FEW_SAMPLES {
            tracing::warn!(
                "Only {} reference scores; rejection probabilities will be unstable",
                scores.len()
            );
        }

        let mut sorted = scores.to_vec();
        sorted.sort_by(f64::total_cmp);

        tracing::info!(
            "Fitted rejection scorer ({:?}): n={}, mean={:.4}, std={:.4}",
            calibration,
            scores.len(),
            mean,
            std
        );
        Ok(Self {
            calibration,
            mean,
            std,
            sorted,
        })
    }

    pub fn from_distribution(
        distribution: &ReferenceDistribution,
        calibration: Calibration,
    ) -> Result<Self> {
        Self::fit(distribution.scores(), calibration)
    }

    pub fn mean(&self) -> f64 {
        self.mean
    }

    /// Sample standard deviation (n - 1 denominator)
    pub fn std(&self) -> f64 {
        self.std
    }

    pub fn calibration(&self) -> Calibration {
        self.calibration
    }

    /// Probability of rejection for a similarity score, in [0, 1] and
    /// non-decreasing in `score`
    pub fn probability(&self, score: f64) -> f64 {
        let p = match self.calibration {
            Calibration::Normal => normal_cdf((score - self.mean) / self.std),
            Calibration::Empirical => {
                let at_or_below = self.sorted.partition_point(|&s| s <= score);
                at_or_below as f64 / self.sorted.len() as f64
            }
        };
        if p.is_nan() {
            // only reachable for a NaN score
            0.0
        } else {
            p.clamp(0.0, 1.0)
        }
    }

    pub fn summary(&self) -> ReferenceSummary {
        ReferenceSummary {
            count: self.sorted.len(),
            mean: self.mean,
            std: self.std,
            min: self.sorted.first().copied().unwrap_or(f64::NAN),
            max: self.sorted.last().copied().unwrap_or(f64::NAN),
            calibration: self.calibration,
        }
    }

    /// Steps of the reference ECDF, one per distinct score
    pub fn ecdf_points(&self) -> Vec<EcdfPoint> {
        let n = self.sorted.len() as f64;
        let mut points: Vec<EcdfPoint> = Vec::new();
        for (i, &score) in self.sorted.iter().enumerate() {
            let fraction = (i + 1) as f64 / n;
            match points.last_mut() {
                Some(last) if last.score == score => last.fraction = fraction,
                _ => points.push(EcdfPoint { score, fraction }),
            }
        }
        points
    }
}

/// Standard normal CDF
fn normal_cdf(z: f64) -> f64 {
    0.5 * erfc(-z / std::f64::consts::SQRT_2)
}

/// Complementary error function (Abramowitz & Stegun 7.1.26, max error 1.5e-7).
fn erfc(x: f64) -> f64 {
    if x < 0.0 {
        return 2.0 - erfc(-x);
    }
    let t = 1.0 / 0.327_591_1f64.mul_add(x, 1.0);
    let poly = t
        * (0.254_829_592
            + t * (-0.284_496_736
                + t * (1.421_413_741 + t * (-1.453_152_027 + t * 1.061_405_429))));
    poly * (-x * x).exp()
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: [f64; 5] = [0.1, 0.2, 0.3, 0.4, 0.5];

    #[test]
    fn test_fit_uses_sample_std() {
        let scorer = RejectionScorer::fit(&SAMPLE, Calibration::Normal).unwrap();
        assert!((scorer.mean() - 0.3).abs() < 1e-12);
        assert!((scorer.std() - 0.158_113_883).abs() < 1e-6);
        assert!((scorer.probability(0.3) - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_probability_is_monotone_and_bounded() {
        let scorer = RejectionScorer::fit(&SAMPLE, Calibration::Normal).unwrap();
        let mut previous = 0.0;
        for i in -20..=20 {
            let p = scorer.probability(0.3 + i as f64 * 0.05);
            assert!((0.0..=1.0).contains(&p));
            assert!(p >= previous);
            previous = p;
        }
        assert!(scorer.probability(10.0) > 0.999_999);
        assert!(scorer.probability(-10.0) < 1e-6);
    }

    #[test]
    fn test_known_quantiles() {
        // one std above the mean
        let scorer = RejectionScorer::fit(&SAMPLE, Calibration::Normal).unwrap();
        let p = scorer.probability(scorer.mean() + scorer.std());
        assert!((p - 0.841_344_7).abs() < 1e-6, "p={}", p);
    }

    #[test]
    fn test_degenerate_references_are_rejected() {
        assert!(matches!(
            RejectionScorer::fit(&[0.4], Calibration::Normal),
            Err(PriorArtError::InsufficientReferenceData(_))
        ));
        assert!(matches!(
            RejectionScorer::fit(&[0.4, 0.4, 0.4], Calibration::Normal),
            Err(PriorArtError::InsufficientReferenceData(_))
        ));
        assert!(matches!(
            RejectionScorer::fit(&[0.4, f64::NAN], Calibration::Normal),
            Err(PriorArtError::InsufficientReferenceData(_))
        ));
    }

    #[test]
    fn test_empirical_calibration() {
        let scorer = RejectionScorer::fit(&SAMPLE, Calibration::Empirical).unwrap();
        assert_eq!(scorer.probability(0.05), 0.0);
        assert_eq!(scorer.probability(0.3), 0.6);
        assert_eq!(scorer.probability(0.35), 0.6);
        assert_eq!(scorer.probability(0.9), 1.0);
    }

    #[test]
    fn test_summary_and_ecdf() {
        let scorer =
            RejectionScorer::fit(&[0.5, 0.2, 0.2, 0.9], Calibration::Normal).unwrap();
        let summary = scorer.summary();
        assert_eq!(summary.count, 4);
        assert_eq!(summary.min, 0.2);
        assert_eq!(summary.max, 0.9);

        let points = scorer.ecdf_points();
        assert_eq!(
            points,
            vec![
                EcdfPoint { score: 0.2, fraction: 0.5 },
                EcdfPoint { score: 0.5, fraction: 0.75 },
                EcdfPoint { score: 0.9, fraction: 1.0 },
            ]
        );
    }

    #[test]
    fn test_parse_plain_list() {
        let dist = ReferenceDistribution::parse("0.41\n\n0.52\n 0.63 \n").unwrap();
        assert_eq!(dist.scores(), &[0.41, 0.52, 0.63]);
    }

    #[test]
    fn test_parse_tsv_with_sim_column() {
        let content = "application\tsim\tgrant\nUS1\t0.71\tUS9\nUS2\t\tUS8\nUS3\t0.64\tUS7\n";
        let dist = ReferenceDistribution::parse(content).unwrap();
        assert_eq!(dist.scores(), &[0.71, 0.64]);

        let csv = "sim,other\n0.5,x\n0.6,y\n";
        assert_eq!(ReferenceDistribution::parse(csv).unwrap().len(), 2);
    }

    #[test]
    fn test_parse_errors() {
        assert!(matches!(
            ReferenceDistribution::parse("a\tb\n1\t2\n"),
            Err(PriorArtError::ReferenceFile(_))
        ));
        assert!(matches!(
            ReferenceDistribution::parse("sim\n0.4\nhigh\n"),
            Err(PriorArtError::ReferenceFile(_))
        ));
        assert!(ReferenceDistribution::parse("").unwrap().is_empty());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rejected_scoring.tsv");
        std::fs::write(&path, "sim\n0.3\n0.4\n0.5\n").unwrap();
        let dist = ReferenceDistribution::load(&path).unwrap();
        assert_eq!(dist.len(), 3);
        assert!(ReferenceDistribution::load(&dir.path().join("missing.tsv")).is_err());
    }

    #[test]
    fn test_erfc_known_values() {
        assert!((erfc(0.0) - 1.0).abs() < 1e-6);
        assert!(erfc(5.0) < 1e-6);
        assert!((erfc(-5.0) - 2.0).abs() < 1e-6);
    }
}
