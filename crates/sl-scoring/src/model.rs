//! Scoring vocabulary and compiled patterns

use regex::Regex;
use sl_core::{Error, Result};

/// Domain-quality keywords used for keyword coverage
const QUALITY_KEYWORDS: &[&str] = &[
    "bug",
    "fix",
    "test",
    "security",
    "performance",
    "documentation",
    "refactor",
    "feature",
    "deploy",
    "migration",
    "validation",
    "monitoring",
];

/// Technical terms used for technical-term density
const TECHNICAL_TERMS: &[&str] = &[
    "api",
    "database",
    "bug",
    "fix",
    "feature",
    "test",
    "code",
    "refactor",
    "performance",
    "security",
];

/// Percentages, time and byte units, or plain decimal numbers
const MEASUREMENT_PATTERN: &str =
    r"\d+(?:\.\d+)?\s*(?:%|percent\b|ms\b|milliseconds?\b|seconds?\b|bytes?\b|[kmg]b\b)|\d+\.\d+";

/// A checklist item reported when none of its markers appear
#[derive(Debug, Clone)]
pub(crate) struct InfoCategory {
    pub label: &'static str,
    pub markers: &'static [&'static str],
}

const INFO_CATEGORIES: &[InfoCategory] = &[
    InfoCategory {
        label: "Testing information",
        markers: &["test", "qa", "verified", "verify", "coverage"],
    },
    InfoCategory {
        label: "Performance impact",
        markers: &["performance", "latency", "speed", "optimiz", "benchmark", "throughput"],
    },
    InfoCategory {
        label: "Security considerations",
        markers: &["security", "vulnerab", "auth", "permission", "encrypt"],
    },
    InfoCategory {
        label: "Documentation updates",
        markers: &["document", "docs", "readme", "guide"],
    },
    InfoCategory {
        label: "Rollback/recovery plan",
        markers: &["rollback", "roll back", "revert", "recovery", "fallback", "backup"],
    },
];

/// Everything the engine needs to score a text, built once and shared
#[derive(Debug)]
pub(crate) struct ScoringModel {
    pub quality_keywords: &'static [&'static str],
    pub technical_terms: &'static [&'static str],
    pub categories: &'static [InfoCategory],
    measurement: Regex,
}

impl ScoringModel {
    pub fn build() -> Result<Self> {
        let measurement = Regex::new(MEASUREMENT_PATTERN)
            .map_err(|e| Error::Scoring(format!("Invalid measurement pattern: {}", e)))?;

        Ok(Self {
            quality_keywords: QUALITY_KEYWORDS,
            technical_terms: TECHNICAL_TERMS,
            categories: INFO_CATEGORIES,
            measurement,
        })
    }

    /// Quality keywords present in `lower`, ordered by first occurrence
    pub fn matched_keywords(&self, lower: &str) -> Vec<&'static str> {
        let mut found: Vec<(usize, &'static str)> = self
            .quality_keywords
            .iter()
            .filter_map(|keyword| lower.find(keyword).map(|pos| (pos, *keyword)))
            .collect();

        // stable: ties keep vocabulary order
        found.sort_by_key(|(pos, _)| *pos);
        found.into_iter().map(|(_, keyword)| keyword).collect()
    }

    pub fn matched_technical_terms(&self, lower: &str) -> usize {
        self.technical_terms
            .iter()
            .filter(|term| lower.contains(*term))
            .count()
    }

    pub fn has_measurement(&self, lower: &str) -> bool {
        self.measurement.is_match(lower)
    }

    pub fn missing_categories(&self, lower: &str) -> Vec<String> {
        self.categories
            .iter()
            .filter(|category| !category.markers.iter().any(|marker| lower.contains(marker)))
            .map(|category| category.label.to_string())
            .collect()
    }
}
