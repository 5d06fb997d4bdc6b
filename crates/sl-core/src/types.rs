//! Shared data model

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::memory::MemoryReading;

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

/// Separates the fingerprint fields so ("ab", "c") and ("a", "bc") differ
const FINGERPRINT_SEPARATOR: char = '\u{1f}';

/// Derive the cache/dedup key for an analysis request.
///
/// The same (text, type, state) tuple always yields the same fingerprint.
pub fn fingerprint(text: &str, update_type: &str, state: &str) -> String {
    let material = format!(
        "{text}{sep}{update_type}{sep}{state}",
        sep = FINGERPRINT_SEPARATOR
    );
    format!("{:x}", md5::compute(material.as_bytes()))
}

/// A request to score one status update
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisRequest {
    pub id: String,
    pub text: String,
    pub update_type: String,
    pub state: String,
}

impl AnalysisRequest {
    pub fn new(
        id: impl Into<String>,
        text: impl Into<String>,
        update_type: impl Into<String>,
        state: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            text: text.into(),
            update_type: update_type.into(),
            state: state.into(),
        }
    }

    pub fn fingerprint(&self) -> String {
        fingerprint(&self.text, &self.update_type, &self.state)
    }
}

/// Coarse quality bucket derived from the overall score
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QualityLevel {
    Excellent,
    Good,
    Fair,
    Poor,
}

impl QualityLevel {
    /// Map a score onto its tier: ≥80 excellent, ≥60 good, ≥40 fair, else poor
    pub fn from_score(score: u8) -> Self {
        match score {
            80.. => QualityLevel::Excellent,
            60..=79 => QualityLevel::Good,
            40..=59 => QualityLevel::Fair,
            _ => QualityLevel::Poor,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            QualityLevel::Excellent => "excellent",
            QualityLevel::Good => "good",
            QualityLevel::Fair => "fair",
            QualityLevel::Poor => "poor",
        }
    }
}

impl std::fmt::Display for QualityLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Outcome of scoring one status update
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QualityResult {
    /// Always within 0..=100
    pub overall_score: u8,
    pub quality_level: QualityLevel,
    pub summary: String,
    pub missing_info: Vec<String>,
    pub recommendations: Vec<String>,
}

/// A persisted quality result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry {
    pub fingerprint: String,
    pub result: QualityResult,
    pub written_at: DateTime<Utc>,
}

/// One heap usage sample, in megabytes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemorySample {
    pub used: f64,
    pub total: f64,
    pub limit: f64,
    pub percentage: f64,
    pub timestamp: DateTime<Utc>,
}

impl MemorySample {
    pub fn from_reading(reading: MemoryReading, timestamp: DateTime<Utc>) -> Self {
        let used = reading.used_bytes as f64 / BYTES_PER_MB;
        let total = reading.total_bytes as f64 / BYTES_PER_MB;
        let limit = reading.limit_bytes as f64 / BYTES_PER_MB;
        let percentage = if limit > 0.0 { used / limit * 100.0 } else { 0.0 };

        Self {
            used,
            total,
            limit,
            percentage,
            timestamp,
        }
    }
}
