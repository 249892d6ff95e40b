//! Heuristic conversation analysis
//!
//! Turns a call transcript into business signals: sentiment, achieved
//! objectives, a BANT lead score, mentioned keywords, a 1-5 quality score and
//! next-step hints. Everything here is pure; the word lists and objective
//! rules come from the injected [`AnalyzerConfig`].

use crate::config::{AnalyzerConfig, LEAD_QUALIFICATION};
use crate::types::{ConversationAnalysis, Sentiment, QUALITY_MAX, QUALITY_MIN};
use std::collections::BTreeSet;

const MAX_SENTIMENT: f64 = 0.8;
const BASE_SENTIMENT: f64 = 0.5;
const SENTIMENT_STEP: f64 = 0.1;

pub const NEXT_STEP_FOLLOW_UP: &str = "schedule_follow_up";
pub const NEXT_STEP_PROPOSAL: &str = "send_proposal";

/// What the analyzer needs to know about one call.
#[derive(Debug, Clone, Default)]
pub struct AnalysisInput<'a> {
    pub transcript: &'a str,
    /// Provider-computed label; wins over the word-list heuristic
    pub sentiment: Option<Sentiment>,
    /// Provider-computed score; wins over the word-list heuristic
    pub sentiment_score: Option<f64>,
    /// Template category selecting the objective rules
    pub category: Option<&'a str>,
}

impl<'a> AnalysisInput<'a> {
    pub fn new(transcript: &'a str) -> Self {
        Self {
            transcript,
            ..Default::default()
        }
    }

    pub fn with_category(mut self, category: Option<&'a str>) -> Self {
        self.category = category;
        self
    }

    pub fn with_external_sentiment(
        mut self,
        sentiment: Option<Sentiment>,
        sentiment_score: Option<f64>,
    ) -> Self {
        self.sentiment = sentiment;
        self.sentiment_score = sentiment_score.filter(|s| s.is_finite());
        self
    }
}

/// Stateless analyzer over a fixed configuration.
#[derive(Debug, Clone)]
pub struct ConversationAnalyzer {
    config: AnalyzerConfig,
}

impl Default for ConversationAnalyzer {
    fn default() -> Self {
        Self::new(AnalyzerConfig::default())
    }
}

impl ConversationAnalyzer {
    /// Rule keys are normalized like incoming categories, and marker
    /// patterns lowercased, so `"Lead Qualification"` in a config file still
    /// matches.
    pub fn new(mut config: AnalyzerConfig) -> Self {
        config.objective_rules = config
            .objective_rules
            .into_iter()
            .map(|(category, mut markers)| {
                for marker in &mut markers {
                    for pattern in &mut marker.patterns {
                        *pattern = pattern.to_lowercase();
                    }
                }
                (normalize_category(&category), markers)
            })
            .collect();
        Self { config }
    }

    pub fn config(&self) -> &AnalyzerConfig {
        &self.config
    }

    /// Analyze one transcript.
    ///
    /// An empty transcript yields [`neutral_analysis`] rather than an error.
    pub fn analyze(&self, input: &AnalysisInput<'_>) -> ConversationAnalysis {
        if input.transcript.trim().is_empty() {
            return neutral_analysis();
        }

        let text = input.transcript.to_lowercase();

        let (sentiment, sentiment_score) = match (input.sentiment, input.sentiment_score) {
            (label, Some(score)) => {
                let score = score.clamp(-1.0, 1.0);
                (label.unwrap_or_else(|| Sentiment::from_score(score)), score)
            }
            (Some(label), None) => (label, default_score_for(label)),
            (None, None) => self.word_list_sentiment(&text),
        };

        let category = input.category.map(normalize_category);
        let objectives_achieved = self.detect_objectives(&text, category.as_deref());

        let lead_score = if category.as_deref() == Some(LEAD_QUALIFICATION) {
            (self.config.lead_score_per_objective * objectives_achieved.len() as u32).min(100)
        } else {
            0
        };

        let keywords_mentioned = self.extract_keywords(&text);
        let call_quality_score = quality_score(sentiment_score, objectives_achieved.len());
        let escalation_triggered = contains_any(&text, &self.config.escalation_phrases);

        let mut next_steps = Vec::new();
        if objectives_achieved.len() > 2 {
            next_steps.push(NEXT_STEP_FOLLOW_UP.to_string());
        }
        if contains_any(&text, &self.config.interest_phrases) {
            next_steps.push(NEXT_STEP_PROPOSAL.to_string());
        }

        ConversationAnalysis {
            sentiment,
            sentiment_score,
            objectives_achieved,
            lead_score,
            keywords_mentioned,
            call_quality_score,
            escalation_triggered,
            next_steps,
        }
    }

    /// Count listed words present in the (lowercased) text.
    fn word_list_sentiment(&self, text: &str) -> (Sentiment, f64) {
        let positive = count_present(text, &self.config.positive_words) as f64;
        let negative = count_present(text, &self.config.negative_words) as f64;

        if positive > negative {
            let score = (BASE_SENTIMENT + SENTIMENT_STEP * (positive - negative)).min(MAX_SENTIMENT);
            (Sentiment::Positive, score)
        } else if negative > positive {
            let score =
                (-BASE_SENTIMENT - SENTIMENT_STEP * (negative - positive)).max(-MAX_SENTIMENT);
            (Sentiment::Negative, score)
        } else {
            (Sentiment::Neutral, 0.0)
        }
    }

    fn detect_objectives(&self, text: &str, category: Option<&str>) -> Vec<String> {
        let Some(markers) = category.and_then(|c| self.config.objective_rules.get(c)) else {
            return Vec::new();
        };

        markers
            .iter()
            .filter(|marker| contains_any(text, &marker.patterns))
            .map(|marker| marker.tag.clone())
            .collect()
    }

    fn extract_keywords(&self, text: &str) -> Vec<String> {
        let words: BTreeSet<&str> = text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
            .collect();

        self.config
            .business_keywords
            .iter()
            .map(|k| k.to_lowercase())
            .filter(|k| words.contains(k.as_str()))
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }
}

/// `clamp(3.0 + sentiment_score * 2.0 + 0.5 * objectives, 1.0, 5.0)`
pub fn quality_score(sentiment_score: f64, objectives: usize) -> f64 {
    (3.0 + sentiment_score * 2.0 + 0.5 * objectives as f64).clamp(QUALITY_MIN, QUALITY_MAX)
}

/// Analysis of a call with nothing to analyze.
pub fn neutral_analysis() -> ConversationAnalysis {
    ConversationAnalysis {
        sentiment: Sentiment::Neutral,
        sentiment_score: 0.0,
        objectives_achieved: Vec::new(),
        lead_score: 0,
        keywords_mentioned: Vec::new(),
        call_quality_score: quality_score(0.0, 0),
        escalation_triggered: false,
        next_steps: Vec::new(),
    }
}

/// `Lead Qualification` and `lead-qualification` both map to `lead_qualification`.
pub fn normalize_category(category: &str) -> String {
    category
        .trim()
        .to_lowercase()
        .replace([' ', '-'], "_")
}

fn default_score_for(label: Sentiment) -> f64 {
    match label {
        Sentiment::Positive => BASE_SENTIMENT,
        Sentiment::Neutral => 0.0,
        Sentiment::Negative => -BASE_SENTIMENT,
    }
}

fn count_present(text: &str, words: &[String]) -> usize {
    words
        .iter()
        .filter(|w| !w.is_empty() && text.contains(&w.to_lowercase()))
        .count()
}

fn contains_any(text: &str, patterns: &[String]) -> bool {
    patterns
        .iter()
        .any(|p| !p.is_empty() && text.contains(&p.to_lowercase()))
}
