//! Tally Core Library
//!
//! Cascading, cost-aware transaction categorization:
//! - Database access and migrations
//! - Organization rules, merchant pattern cache and similarity search
//! - Batched LLM categorization behind a per-organization budget
//! - Feedback recording and periodic learning
//! - Pluggable embedding and chat capabilities
//! - Prompt library for customizable prompts

pub mod ai;
pub mod categorize;
pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod prompts;

/// Fixture helpers (seeded database, transaction builder)
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use ai::{ChatBackend, ChatCompletion, ChatMessage, ChatRequest, Embedder, MockBackend};
pub use categorize::{
    BatchEstimate, BatchReport, BudgetManager, CancelFlag, FeedbackManager, LlmBatchEngine,
    PatternEngine, Pipeline, PipelineBuilder, RagEngine, RateLimiter, RuleEngine, Stage, StageKind,
    UsageRecorder,
};
pub use config::EngineConfig;
pub use db::Database;
pub use error::{Error, Result};
pub use prompts::{Prompt, PromptId, PromptLibrary};
