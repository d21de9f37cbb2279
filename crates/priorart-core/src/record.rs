//! Record types shared by the store, the assembler and the API layers
//!
//! A record is one granted patent: its date, title, CPC codes and the text of
//! all of its claims joined into a single string. Similarity is computed at
//! this granularity, one vector per record, never per individual claim.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::PriorArtError;

/// Separator placed between the individual claims of a record
pub const CLAIM_SEPARATOR: &str = " \n ";

/// Stable 1-based record identifier.
///
/// Vector index positions are 0-based: position `p` holds the vector of
/// record `p + 1`. Conversions between the two go through this type only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(pub i64);

impl RecordId {
    /// Record id stored at a vector index position
    pub fn from_position(position: usize) -> Self {
        RecordId(position as i64 + 1)
    }

    /// Vector index position of this record, `None` for ids below 1
    pub fn position(self) -> Option<usize> {
        if self.0 < 1 {
            None
        } else {
            usize::try_from(self.0 - 1).ok()
        }
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A stored record with its metadata and concatenated claim text
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub id: RecordId,
    /// Published patent number, e.g. "US10123456B2"
    pub patent_number: String,
    pub date: NaiveDate,
    pub title: String,
    pub classification_codes: Vec<String>,
    pub claim_text: String,
}

impl Record {
    /// Join individual claims into the text that gets embedded for a record
    pub fn join_claims<I, S>(claims: I) -> String
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        claims
            .into_iter()
            .map(|c| c.as_ref().to_string())
            .collect::<Vec<_>>()
            .join(CLAIM_SEPARATOR)
    }
}

/// Inclusive date window applied to every search
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    lower: NaiveDate,
    upper: NaiveDate,
}

impl DateRange {
    /// Earliest date an open lower bound stands for
    pub const EARLIEST: NaiveDate = match NaiveDate::from_ymd_opt(1, 1, 1) {
        Some(d) => d,
        None => NaiveDate::MIN,
    };

    /// Latest date an open upper bound stands for. Four-digit years keep the
    /// stored `YYYY-MM-DD` text comparable.
    pub const LATEST: NaiveDate = match NaiveDate::from_ymd_opt(9999, 12, 31) {
        Some(d) => d,
        None => NaiveDate::MAX,
    };

    pub fn new(lower: NaiveDate, upper: NaiveDate) -> Result<Self, PriorArtError> {
        if lower > upper {
            return Err(PriorArtError::Input(format!(
                "date_lower {} is after date_upper {}",
                lower, upper
            )));
        }
        Ok(Self { lower, upper })
    }

    /// Range from optional bounds; a missing bound is open
    pub fn from_bounds(
        lower: Option<NaiveDate>,
        upper: Option<NaiveDate>,
    ) -> Result<Self, PriorArtError> {
        Self::new(lower.unwrap_or(Self::EARLIEST), upper.unwrap_or(Self::LATEST))
    }

    pub fn unbounded() -> Self {
        Self {
            lower: Self::EARLIEST,
            upper: Self::LATEST,
        }
    }

    pub fn lower(&self) -> NaiveDate {
        self.lower
    }

    pub fn upper(&self) -> NaiveDate {
        self.upper
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        self.lower <= date && date <= self.upper
    }
}

impl Default for DateRange {
    fn default() -> Self {
        Self::unbounded()
    }
}

/// How multiple CPC codes combine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CpcOperator {
    /// Every code must match some classification of the record
    And,
    /// At least one code must match
    #[default]
    Or,
}

impl CpcOperator {
    pub(crate) fn sql_keyword(self) -> &'static str {
        match self {
            CpcOperator::And => " AND ",
            CpcOperator::Or => " OR ",
        }
    }
}

impl FromStr for CpcOperator {
    type Err = PriorArtError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "AND" => Ok(CpcOperator::And),
            "OR" => Ok(CpcOperator::Or),
            other => Err(PriorArtError::Input(format!(
                "Unknown CPC operator '{}', expected AND or OR",
                other
            ))),
        }
    }
}

impl fmt::Display for CpcOperator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CpcOperator::And => write!(f, "AND"),
            CpcOperator::Or => write!(f, "OR"),
        }
    }
}

/// Classification filter: code substrings combined with AND or OR
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CpcFilter {
    codes: Vec<String>,
    operator: CpcOperator,
}

impl CpcFilter {
    /// Build a filter; codes are trimmed and blank codes are dropped
    pub fn new<I, S>(codes: I, operator: CpcOperator) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let codes = codes
            .into_iter()
            .map(|c| c.as_ref().trim().to_string())
            .filter(|c| !c.is_empty())
            .collect();
        Self { codes, operator }
    }

    /// Parse a comma separated list such as "G01S17/10, G01S7/4865"
    pub fn parse(input: &str, operator: CpcOperator) -> Self {
        Self::new(input.split(','), operator)
    }

    pub fn codes(&self) -> &[String] {
        &self.codes
    }

    pub fn operator(&self) -> CpcOperator {
        self.operator
    }

    /// A filter without codes places no restriction
    pub fn is_empty(&self) -> bool {
        self.codes.is_empty()
    }

    /// In-memory evaluation, same semantics as the store predicate: a code
    /// hits when it is a substring of an entry, ignoring ASCII case
    pub fn matches(&self, classification_codes: &[String]) -> bool {
        if self.is_empty() {
            return true;
        }
        let entries: Vec<String> = classification_codes
            .iter()
            .map(|entry| entry.to_ascii_uppercase())
            .collect();
        let hit = |code: &String| {
            let code = code.to_ascii_uppercase();
            entries.iter().any(|entry| entry.contains(code.as_str()))
        };
        match self.operator {
            CpcOperator::And => self.codes.iter().all(hit),
            CpcOperator::Or => self.codes.iter().any(hit),
        }
    }
}
