//! Quality scoring engine
//!
//! Scores a status update as a weighted combination of four factors:
//!
//! | factor              | weight |
//! |---------------------|--------|
//! | keyword coverage    | 0.4    |
//! | length / structure  | 0.3    |
//! | technical density   | 0.2    |
//! | specificity         | 0.1    |
//!
//! The engine is deterministic: the same text always produces the same
//! [`QualityResult`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use sl_core::{CleanupTarget, QualityLevel, QualityResult, Result, Scorer};
use tracing::debug;

use crate::model::ScoringModel;

const KEYWORD_WEIGHT: f64 = 0.4;
const LENGTH_WEIGHT: f64 = 0.3;
const TECHNICAL_WEIGHT: f64 = 0.2;
const SPECIFICITY_WEIGHT: f64 = 0.1;

const SUMMARY_KEYWORD_LIMIT: usize = 3;

/// Per-factor scores, each within 0..=100
#[derive(Debug, Clone, PartialEq)]
pub struct FactorScores {
    pub keyword_coverage: f64,
    pub length: f64,
    pub technical_density: f64,
    pub specificity: f64,
    pub word_count: usize,
}

impl FactorScores {
    /// Weighted sum, clamped and rounded
    pub fn overall(&self) -> u8 {
        let weighted = self.keyword_coverage * KEYWORD_WEIGHT
            + self.length * LENGTH_WEIGHT
            + self.technical_density * TECHNICAL_WEIGHT
            + self.specificity * SPECIFICITY_WEIGHT;

        weighted.clamp(0.0, 100.0).round() as u8
    }
}

/// Deterministic status update scorer.
///
/// The compiled vocabulary is built lazily and can be dropped with
/// [`ScoringEngine::evict_model`]; the next call rebuilds an identical one.
#[derive(Debug, Default)]
pub struct ScoringEngine {
    model: RwLock<Option<Arc<ScoringModel>>>,
    invocations: AtomicU64,
}

impl ScoringEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the model ahead of the first request
    pub fn warm_up(&self) -> Result<()> {
        self.model().map(|_| ())
    }

    /// Score one status update.
    ///
    /// Never fails because of the input text; an error means the model could
    /// not be built.
    pub fn score(&self, text: &str) -> Result<QualityResult> {
        self.invocations.fetch_add(1, Ordering::Relaxed);

        let model = self.model()?;
        let lower = text.to_lowercase();
        let matched_keywords = model.matched_keywords(&lower);
        let factors = compute_factors(&model, &lower, text, matched_keywords.len());

        let overall_score = factors.overall();
        let quality_level = QualityLevel::from_score(overall_score);
        let has_measurement = factors.specificity >= 100.0;

        let summary = build_summary(
            quality_level,
            &matched_keywords,
            factors.word_count,
            has_measurement,
        );
        let missing_info = model.missing_categories(&lower);
        let recommendations = build_recommendations(overall_score, &missing_info);

        debug!(
            score = overall_score,
            level = %quality_level,
            words = factors.word_count,
            keywords = matched_keywords.len(),
            "scored status update"
        );

        Ok(QualityResult {
            overall_score,
            quality_level,
            summary,
            missing_info,
            recommendations,
        })
    }

    /// Factor breakdown for a text, without summary or checklist
    pub fn factors(&self, text: &str) -> Result<FactorScores> {
        let model = self.model()?;
        let lower = text.to_lowercase();
        let keyword_matches = model.matched_keywords(&lower).len();
        Ok(compute_factors(&model, &lower, text, keyword_matches))
    }

    /// Drop the compiled model
    pub fn evict_model(&self) {
        let mut slot = self.model.write().unwrap_or_else(|e| e.into_inner());
        if slot.take().is_some() {
            debug!("scoring model evicted");
        }
    }

    pub fn is_model_loaded(&self) -> bool {
        self.model
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }

    /// Number of `score` calls since construction
    pub fn invocation_count(&self) -> u64 {
        self.invocations.load(Ordering::Relaxed)
    }

    fn model(&self) -> Result<Arc<ScoringModel>> {
        if let Some(model) = self.model.read().unwrap_or_else(|e| e.into_inner()).as_ref() {
            return Ok(model.clone());
        }

        let mut slot = self.model.write().unwrap_or_else(|e| e.into_inner());
        if let Some(model) = slot.as_ref() {
            return Ok(model.clone());
        }

        let model = Arc::new(ScoringModel::build()?);
        debug!(
            keywords = model.quality_keywords.len(),
            terms = model.technical_terms.len(),
            "scoring model loaded"
        );
        *slot = Some(model.clone());
        Ok(model)
    }
}

impl Scorer for ScoringEngine {
    fn score(&self, text: &str) -> Result<QualityResult> {
        ScoringEngine::score(self, text)
    }
}

#[async_trait]
impl CleanupTarget for ScoringEngine {
    fn name(&self) -> &str {
        "scoring-model"
    }

    async fn cleanup(&self) -> Result<()> {
        self.evict_model();
        Ok(())
    }
}

fn compute_factors(
    model: &ScoringModel,
    lower: &str,
    text: &str,
    keyword_matches: usize,
) -> FactorScores {
    let keyword_coverage =
        (keyword_matches as f64 / model.quality_keywords.len() as f64 * 100.0).min(100.0);

    let word_count = text.split_whitespace().count();
    let length = ((word_count as f64 - 5.0) * 2.0).clamp(0.0, 100.0);

    let technical_density =
        model.matched_technical_terms(lower) as f64 / model.technical_terms.len() as f64 * 100.0;

    let specificity = if model.has_measurement(lower) { 100.0 } else { 50.0 };

    FactorScores {
        keyword_coverage,
        length,
        technical_density,
        specificity,
        word_count,
    }
}

fn build_summary(
    level: QualityLevel,
    matched_keywords: &[&str],
    word_count: usize,
    has_measurement: bool,
) -> String {
    let mut sentences: Vec<String> = Vec::new();

    sentences.push(
        match level {
            QualityLevel::Excellent => "Excellent status update with comprehensive detail",
            QualityLevel::Good => "Good status update with solid information",
            QualityLevel::Fair => "Fair status update covering the basics",
            QualityLevel::Poor => "This update needs significantly more detail",
        }
        .to_string(),
    );

    if !matched_keywords.is_empty() {
        let top: Vec<&str> = matched_keywords
            .iter()
            .take(SUMMARY_KEYWORD_LIMIT)
            .copied()
            .collect();
        sentences.push(format!("Mentions {}", top.join(", ")));
    }

    if word_count > 20 {
        sentences.push("Provides substantial detail".to_string());
    } else if word_count < 10 {
        sentences.push("Could use more explanation".to_string());
    }

    if has_measurement {
        sentences.push("Includes measurable outcomes".to_string());
    }

    format!("{}.", sentences.join(". "))
}

fn build_recommendations(overall_score: u8, missing_info: &[String]) -> Vec<String> {
    let mut recommendations = Vec::new();

    if overall_score < 60 {
        recommendations.push("Add more technical detail and concrete metrics".to_string());
    }

    if !missing_info.is_empty() {
        recommendations.push(format!("Consider addressing: {}", missing_info.join(", ")));
    }

    if overall_score < 40 {
        recommendations
            .push("Provide context about the problem being solved and concrete examples".to_string());
    }

    recommendations
}
