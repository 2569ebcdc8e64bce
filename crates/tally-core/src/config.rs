//! Engine configuration
//!
//! Config is loaded with a two-layer resolution:
//! 1. Check for override in data dir (~/.local/share/tally/config/engine.toml)
//!    or an explicit path
//! 2. Fall back to embedded defaults (compiled into binary)
//!
//! Every key is optional in the TOML; missing keys keep their defaults.

use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::categorize::StageKind;
use crate::error::{Error, Result};
use crate::models::{LlmModel, ModelStrategy};

/// Embedded default config (compiled into binary)
const DEFAULT_CONFIG: &str = include_str!("../../../config/engine.toml");

/// Confidence each cheap stage must reach to stop the cascade
#[derive(Debug, Clone, PartialEq)]
pub struct StageThresholds {
    pub rule: f64,
    pub pattern: f64,
    pub rag: f64,
}

impl StageThresholds {
    pub fn for_stage(&self, kind: StageKind) -> f64 {
        match kind {
            StageKind::Rule => self.rule,
            StageKind::Pattern => self.pattern,
            StageKind::Rag => self.rag,
        }
    }
}

impl Default for StageThresholds {
    fn default() -> Self {
        Self {
            rule: 0.90,
            pattern: 0.80,
            rag: 0.70,
        }
    }
}

/// Where the pattern stage runs for merchants with a user-corrected mapping
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CorrectedMerchantOrder {
    PatternFirst,
    RuleFirst,
}

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub stage_order: Vec<StageKind>,
    pub corrected_merchant_order: CorrectedMerchantOrder,
    pub use_rag_hints: bool,
    pub model_strategy: ModelStrategy,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            stage_order: vec![StageKind::Rule, StageKind::Pattern, StageKind::Rag],
            corrected_merchant_order: CorrectedMerchantOrder::PatternFirst,
            use_rag_hints: true,
            model_strategy: ModelStrategy::Balanced,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PatternSettings {
    pub fuzzy_threshold: f64,
    pub partial_factor: f64,
    pub learn_floor: f64,
    pub reinforce_rate: f64,
    pub correction_penalty: f64,
    pub user_confidence: f64,
}

impl Default for PatternSettings {
    fn default() -> Self {
        Self {
            fuzzy_threshold: 0.75,
            partial_factor: 0.6,
            learn_floor: 0.6,
            reinforce_rate: 0.1,
            correction_penalty: 0.5,
            user_confidence: 1.0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RagSettings {
    pub top_k: usize,
    pub min_neighbor_similarity: f64,
    pub min_top_similarity: f64,
    pub min_vote_share: f64,
    pub hint_limit: usize,
    /// Embed transactions that a rule or pattern decided, so they vote in
    /// later RAG lookups. Off keeps cheap hits free of embedding calls;
    /// `backfill_embeddings` indexes them later.
    pub embed_decided: bool,
}

impl Default for RagSettings {
    fn default() -> Self {
        Self {
            top_k: 10,
            min_neighbor_similarity: 0.5,
            min_top_similarity: 0.7,
            min_vote_share: 0.6,
            hint_limit: 3,
            embed_decided: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LlmSettings {
    pub avg_tokens_per_transaction: u32,
    pub response_tokens_per_transaction: u32,
    pub max_batch_size: usize,
    pub temperature: f32,
    pub max_tokens: u32,
    pub models: Vec<LlmModel>,
}

impl Default for LlmSettings {
    fn default() -> Self {
        Self {
            avg_tokens_per_transaction: 150,
            response_tokens_per_transaction: 60,
            max_batch_size: 100,
            temperature: 0.3,
            max_tokens: 2000,
            models: vec![
                LlmModel {
                    name: "gpt-4o-mini".to_string(),
                    cost_per_1k_tokens: 0.00015,
                    max_tokens: 128_000,
                    accuracy_score: 0.92,
                    is_default: true,
                },
                LlmModel {
                    name: "claude-3-haiku-20240307".to_string(),
                    cost_per_1k_tokens: 0.00025,
                    max_tokens: 200_000,
                    accuracy_score: 0.90,
                    is_default: false,
                },
            ],
        }
    }
}

#[derive(Debug, Clone)]
pub struct BudgetSettings {
    pub monthly_budget: f64,
    pub daily_budget: f64,
    pub alert_thresholds: Vec<f64>,
}

impl Default for BudgetSettings {
    fn default() -> Self {
        Self {
            monthly_budget: 50.0,
            daily_budget: 5.0,
            alert_thresholds: vec![0.5, 0.8, 0.95],
        }
    }
}

/// Short-window throttle on LLM calls; 0 disables a limit
#[derive(Debug, Clone)]
pub struct RateLimitSettings {
    pub max_requests_per_minute: u32,
    pub max_requests_per_hour: u32,
    pub max_cost_per_hour: f64,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            max_requests_per_minute: 20,
            max_requests_per_hour: 200,
            max_cost_per_hour: 2.0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FeedbackSettings {
    pub relearn_after: i64,
    pub mining_min_occurrences: i64,
    pub mining_min_share: f64,
    pub mining_lookback_days: i64,
}

impl Default for FeedbackSettings {
    fn default() -> Self {
        Self {
            relearn_after: 10,
            mining_min_occurrences: 3,
            mining_min_share: 0.8,
            mining_lookback_days: 90,
        }
    }
}

/// Full engine configuration
#[derive(Debug, Clone, Default)]
pub struct EngineConfig {
    pub thresholds: StageThresholds,
    pub pipeline: PipelineSettings,
    pub patterns: PatternSettings,
    pub rag: RagSettings,
    pub llm: LlmSettings,
    pub budget: BudgetSettings,
    pub rate_limit: RateLimitSettings,
    pub feedback: FeedbackSettings,
}

impl EngineConfig {
    /// Load from the default override location, falling back to embedded defaults
    pub fn load() -> Result<Self> {
        load_config(None)
    }

    /// Load from an explicit path (embedded defaults if it does not exist)
    pub fn from_path(path: &Path) -> Result<Self> {
        load_config(Some(path))
    }

    /// Parse a TOML document, filling missing keys from defaults
    pub fn from_toml_str(content: &str) -> Result<Self> {
        parse_config(content)
    }

    /// The embedded default configuration
    pub fn embedded() -> Result<Self> {
        parse_config(DEFAULT_CONFIG)
    }

    fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("thresholds.rule", self.thresholds.rule),
            ("thresholds.pattern", self.thresholds.pattern),
            ("thresholds.rag", self.thresholds.rag),
            ("patterns.fuzzy_threshold", self.patterns.fuzzy_threshold),
            ("patterns.partial_factor", self.patterns.partial_factor),
            ("patterns.learn_floor", self.patterns.learn_floor),
            ("patterns.reinforce_rate", self.patterns.reinforce_rate),
            ("patterns.correction_penalty", self.patterns.correction_penalty),
            ("patterns.user_confidence", self.patterns.user_confidence),
            ("rag.min_neighbor_similarity", self.rag.min_neighbor_similarity),
            ("rag.min_top_similarity", self.rag.min_top_similarity),
            ("rag.min_vote_share", self.rag.min_vote_share),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(Error::Config(format!(
                    "{} must be between 0 and 1 (got {})",
                    name, value
                )));
            }
        }

        if self.patterns.correction_penalty == 0.0 {
            return Err(Error::Config(
                "patterns.correction_penalty must be greater than 0".into(),
            ));
        }
        if self.pipeline.stage_order.is_empty() {
            return Err(Error::Config("pipeline.stage_order is empty".into()));
        }
        if self.llm.models.is_empty() {
            return Err(Error::Config("llm.models must list at least one model".into()));
        }
        if self.llm.max_batch_size == 0 {
            return Err(Error::Config("llm.max_batch_size must be positive".into()));
        }
        if self.budget.monthly_budget < 0.0 || self.budget.daily_budget < 0.0 {
            return Err(Error::Config("budget limits cannot be negative".into()));
        }
        if self.rate_limit.max_cost_per_hour < 0.0 {
            return Err(Error::Config("rate_limit.max_cost_per_hour cannot be negative".into()));
        }

        Ok(())
    }
}

/// Default config override path
pub fn default_config_path() -> Option<PathBuf> {
    dirs::data_local_dir().map(|d| d.join("tally").join("config").join("engine.toml"))
}

/// Load configuration (override first, then default)
fn load_config(override_path: Option<&Path>) -> Result<EngineConfig> {
    let path = match override_path {
        Some(path) => Some(path.to_path_buf()),
        None => default_config_path(),
    };

    let content = match path {
        Some(path) if path.exists() => fs::read_to_string(&path)
            .map_err(|e| Error::Config(format!("Failed to read {}: {}", path.display(), e)))?,
        _ => DEFAULT_CONFIG.to_string(),
    };

    parse_config(&content)
}

/// Raw config structure for TOML parsing
#[derive(Debug, Deserialize)]
struct RawConfig {
    thresholds: Option<RawThresholds>,
    pipeline: Option<RawPipeline>,
    patterns: Option<RawPatterns>,
    rag: Option<RawRag>,
    llm: Option<RawLlm>,
    budget: Option<RawBudget>,
    rate_limit: Option<RawRateLimit>,
    feedback: Option<RawFeedback>,
}

#[derive(Debug, Deserialize)]
struct RawThresholds {
    rule: Option<f64>,
    pattern: Option<f64>,
    rag: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct RawPipeline {
    stage_order: Option<Vec<String>>,
    corrected_merchant_order: Option<CorrectedMerchantOrder>,
    use_rag_hints: Option<bool>,
    model_strategy: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawPatterns {
    fuzzy_threshold: Option<f64>,
    partial_factor: Option<f64>,
    learn_floor: Option<f64>,
    reinforce_rate: Option<f64>,
    correction_penalty: Option<f64>,
    user_confidence: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct RawRag {
    top_k: Option<usize>,
    min_neighbor_similarity: Option<f64>,
    min_top_similarity: Option<f64>,
    min_vote_share: Option<f64>,
    hint_limit: Option<usize>,
    embed_decided: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct RawLlm {
    avg_tokens_per_transaction: Option<u32>,
    response_tokens_per_transaction: Option<u32>,
    max_batch_size: Option<usize>,
    temperature: Option<f32>,
    max_tokens: Option<u32>,
    models: Option<Vec<LlmModel>>,
}

#[derive(Debug, Deserialize)]
struct RawBudget {
    monthly_budget: Option<f64>,
    daily_budget: Option<f64>,
    alert_thresholds: Option<Vec<f64>>,
}

#[derive(Debug, Deserialize)]
struct RawRateLimit {
    max_requests_per_minute: Option<u32>,
    max_requests_per_hour: Option<u32>,
    max_cost_per_hour: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct RawFeedback {
    relearn_after: Option<i64>,
    mining_min_occurrences: Option<i64>,
    mining_min_share: Option<f64>,
    mining_lookback_days: Option<i64>,
}

/// Parse config from TOML content
fn parse_config(content: &str) -> Result<EngineConfig> {
    let raw: RawConfig = toml::from_str(content)
        .map_err(|e| Error::Config(format!("Invalid config TOML: {}", e)))?;

    let mut config = EngineConfig::default();

    if let Some(t) = raw.thresholds {
        let th = &mut config.thresholds;
        th.rule = t.rule.unwrap_or(th.rule);
        th.pattern = t.pattern.unwrap_or(th.pattern);
        th.rag = t.rag.unwrap_or(th.rag);
    }

    if let Some(p) = raw.pipeline {
        let pipeline = &mut config.pipeline;
        if let Some(order) = p.stage_order {
            pipeline.stage_order = order
                .iter()
                .map(|s| s.parse::<StageKind>().map_err(Error::Config))
                .collect::<Result<Vec<_>>>()?;
        }
        if let Some(order) = p.corrected_merchant_order {
            pipeline.corrected_merchant_order = order;
        }
        pipeline.use_rag_hints = p.use_rag_hints.unwrap_or(pipeline.use_rag_hints);
        if let Some(strategy) = p.model_strategy {
            pipeline.model_strategy = strategy.parse().map_err(Error::Config)?;
        }
    }

    if let Some(p) = raw.patterns {
        let pat = &mut config.patterns;
        pat.fuzzy_threshold = p.fuzzy_threshold.unwrap_or(pat.fuzzy_threshold);
        pat.partial_factor = p.partial_factor.unwrap_or(pat.partial_factor);
        pat.learn_floor = p.learn_floor.unwrap_or(pat.learn_floor);
        pat.reinforce_rate = p.reinforce_rate.unwrap_or(pat.reinforce_rate);
        pat.correction_penalty = p.correction_penalty.unwrap_or(pat.correction_penalty);
        pat.user_confidence = p.user_confidence.unwrap_or(pat.user_confidence);
    }

    if let Some(r) = raw.rag {
        let rag = &mut config.rag;
        rag.top_k = r.top_k.unwrap_or(rag.top_k);
        rag.min_neighbor_similarity = r
            .min_neighbor_similarity
            .unwrap_or(rag.min_neighbor_similarity);
        rag.min_top_similarity = r.min_top_similarity.unwrap_or(rag.min_top_similarity);
        rag.min_vote_share = r.min_vote_share.unwrap_or(rag.min_vote_share);
        rag.hint_limit = r.hint_limit.unwrap_or(rag.hint_limit);
        rag.embed_decided = r.embed_decided.unwrap_or(rag.embed_decided);
    }

    if let Some(l) = raw.llm {
        let llm = &mut config.llm;
        llm.avg_tokens_per_transaction = l
            .avg_tokens_per_transaction
            .unwrap_or(llm.avg_tokens_per_transaction);
        llm.response_tokens_per_transaction = l
            .response_tokens_per_transaction
            .unwrap_or(llm.response_tokens_per_transaction);
        llm.max_batch_size = l.max_batch_size.unwrap_or(llm.max_batch_size);
        llm.temperature = l.temperature.unwrap_or(llm.temperature);
        llm.max_tokens = l.max_tokens.unwrap_or(llm.max_tokens);
        if let Some(models) = l.models {
            llm.models = models;
        }
    }

    if let Some(b) = raw.budget {
        let budget = &mut config.budget;
        budget.monthly_budget = b.monthly_budget.unwrap_or(budget.monthly_budget);
        budget.daily_budget = b.daily_budget.unwrap_or(budget.daily_budget);
        if let Some(thresholds) = b.alert_thresholds {
            budget.alert_thresholds = thresholds;
        }
    }

    if let Some(r) = raw.rate_limit {
        let limits = &mut config.rate_limit;
        limits.max_requests_per_minute = r
            .max_requests_per_minute
            .unwrap_or(limits.max_requests_per_minute);
        limits.max_requests_per_hour = r
            .max_requests_per_hour
            .unwrap_or(limits.max_requests_per_hour);
        limits.max_cost_per_hour = r.max_cost_per_hour.unwrap_or(limits.max_cost_per_hour);
    }

    if let Some(f) = raw.feedback {
        let fb = &mut config.feedback;
        fb.relearn_after = f.relearn_after.unwrap_or(fb.relearn_after);
        fb.mining_min_occurrences = f
            .mining_min_occurrences
            .unwrap_or(fb.mining_min_occurrences);
        fb.mining_min_share = f.mining_min_share.unwrap_or(fb.mining_min_share);
        fb.mining_lookback_days = f.mining_lookback_days.unwrap_or(fb.mining_lookback_days);
    }

    config.validate()?;
    Ok(config)
}
