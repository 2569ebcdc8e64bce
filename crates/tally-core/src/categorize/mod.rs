//! Cascading transaction categorization
//!
//! Four strategies of increasing cost, cheapest first:
//!
//! - **Rules** - organization-defined deterministic rules
//! - **Patterns** - merchant→category cache with fuzzy matching
//! - **RAG** - category vote among similar, already categorized transactions
//! - **LLM** - one batched prompt for whatever the cheap stages left over
//!
//! The cheap stages share the [`Stage`] contract and are driven by the
//! [`Pipeline`] from an ordered list and a threshold table. The rate
//! limiter and the budget manager gate the LLM stage; the feedback manager
//! feeds user corrections back into rule, pattern and embedding state.
//!
//! ## Usage
//!
//! ```rust,ignore
//! let (usage, updater) = usage::channel(db.clone());
//! let stats_task = updater.spawn();
//!
//! let pipeline = Pipeline::builder(db.clone(), config)
//!     .usage(usage)
//!     .embedder(backend.clone())
//!     .chat(backend)
//!     .build()?;
//!
//! let result = pipeline.categorize(&transaction).await?;
//! ```

pub mod budget;
pub mod feedback;
pub mod llm;
pub mod patterns;
pub mod pipeline;
pub mod rag;
pub mod rate_limit;
pub mod rules;
pub mod usage;

pub use budget::{BudgetManager, Reservation};
pub use feedback::FeedbackManager;
pub use llm::{BatchItem, BatchOutcome, LlmBatchEngine};
pub use patterns::{normalize_merchant, pattern_key, PatternEngine};
pub use pipeline::{BatchEstimate, BatchReport, Pipeline, PipelineBuilder, PipelineStatus};
pub use rag::{RagEngine, RagOutcome};
pub use rate_limit::RateLimiter;
pub use rules::RuleEngine;
pub use usage::{UsageEvent, UsageRecorder, UsageUpdater};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::models::{CategorizationMethod, PatternMatch, RuleMatch, SimilarityMatch, Transaction};

/// A cheap (non-LLM) stage of the cascade
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    Rule,
    Pattern,
    Rag,
}

impl StageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Rule => "rule",
            Self::Pattern => "pattern",
            Self::Rag => "rag",
        }
    }

    /// Method recorded when this stage decides a transaction
    pub fn method(&self) -> CategorizationMethod {
        match self {
            Self::Rule => CategorizationMethod::RuleBased,
            Self::Pattern => CategorizationMethod::PatternBased,
            Self::Rag => CategorizationMethod::RagBased,
        }
    }
}

impl std::str::FromStr for StageKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "rule" | "rules" => Ok(Self::Rule),
            "pattern" | "patterns" => Ok(Self::Pattern),
            "rag" => Ok(Self::Rag),
            _ => Err(format!("Unknown stage: {}", s)),
        }
    }
}

/// What a stage saw, kept for the match trace
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Evidence {
    #[default]
    None,
    Rule(RuleMatch),
    Pattern(PatternMatch),
    Similar(Vec<SimilarityMatch>),
}

/// A stage's verdict for one transaction
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredResult {
    pub category_id: Option<i64>,
    /// 0 when the stage has no opinion
    pub confidence: f64,
    pub evidence: Evidence,
}

impl ScoredResult {
    /// No candidate
    pub fn empty() -> Self {
        Self {
            category_id: None,
            confidence: 0.0,
            evidence: Evidence::None,
        }
    }
}

/// Uniform contract for the cheap stages
#[async_trait]
pub trait Stage: Send + Sync {
    fn kind(&self) -> StageKind;

    /// Score a transaction. Non-fatal errors are absorbed by the pipeline
    /// as confidence 0.
    async fn evaluate(&self, transaction: &Transaction) -> Result<ScoredResult>;
}

/// Cooperative cancellation for batch runs
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_kind_parse() {
        assert_eq!("RULE".parse::<StageKind>(), Ok(StageKind::Rule));
        assert_eq!("patterns".parse::<StageKind>(), Ok(StageKind::Pattern));
        assert!("llm".parse::<StageKind>().is_err());
        assert_eq!(StageKind::Rag.method(), CategorizationMethod::RagBased);
    }

    #[test]
    fn test_cancel_flag_shared() {
        let flag = CancelFlag::new();
        let clone = flag.clone();
        assert!(!flag.is_cancelled());
        clone.cancel();
        assert!(flag.is_cancelled());
    }
}
