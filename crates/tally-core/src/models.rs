//! Data models for Tally

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

// ========== Transactions & Categories ==========

/// A financial transaction owned by an organization
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transaction {
    pub id: i64,
    pub organization_id: i64,
    /// Signed amount (negative = expense)
    pub amount: f64,
    pub description: String,
    pub merchant_name: Option<String>,
    pub date: NaiveDate,
    pub category_id: Option<i64>,
    /// Metadata from the most recent categorization attempt
    pub categorization: Option<CategorizationResult>,
    pub created_at: DateTime<Utc>,
}

/// A transaction to be inserted (as delivered by the sync layer)
#[derive(Debug, Clone)]
pub struct NewTransaction {
    pub organization_id: i64,
    pub amount: f64,
    pub description: String,
    pub merchant_name: Option<String>,
    pub date: NaiveDate,
}

/// A spending category scoped to an organization
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Category {
    pub id: i64,
    pub organization_id: i64,
    pub name: String,
    pub parent_id: Option<i64>,
    pub color: Option<String>,
    pub icon: Option<String>,
}

// ========== Rules ==========

/// What a category rule matches against
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleType {
    /// Wildcard (`*`, `?`) or regex match against merchant_name
    MerchantPattern,
    /// Substring or regex match against description
    DescriptionKeyword,
    /// Inclusive "min,max" range against the signed amount
    AmountRange,
    /// Regex against "description merchant_name"
    RegexPattern,
}

impl RuleType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MerchantPattern => "merchant_pattern",
            Self::DescriptionKeyword => "description_keyword",
            Self::AmountRange => "amount_range",
            Self::RegexPattern => "regex_pattern",
        }
    }
}

impl std::str::FromStr for RuleType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "merchant_pattern" | "merchant" => Ok(Self::MerchantPattern),
            "description_keyword" | "keyword" => Ok(Self::DescriptionKeyword),
            "amount_range" | "amount" => Ok(Self::AmountRange),
            "regex_pattern" | "regex" => Ok(Self::RegexPattern),
            _ => Err(format!("Unknown rule type: {}", s)),
        }
    }
}

/// An organization-defined deterministic categorization rule
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CategoryRule {
    pub id: i64,
    pub organization_id: i64,
    pub category_id: i64,
    pub rule_type: RuleType,
    pub pattern: String,
    /// Static confidence returned when this rule matches
    pub confidence: f64,
    /// Higher priority rules are checked first
    pub priority: i32,
    pub case_sensitive: bool,
    pub is_regex: bool,
    pub usage_count: i64,
    pub correction_count: i64,
    pub success_rate: f64,
    pub created_at: DateTime<Utc>,
    pub last_used_at: Option<DateTime<Utc>>,
}

/// Rule fields supplied by a user when creating or editing a rule
#[derive(Debug, Clone)]
pub struct NewCategoryRule {
    pub organization_id: i64,
    pub category_id: i64,
    pub rule_type: RuleType,
    pub pattern: String,
    pub confidence: f64,
    pub priority: i32,
    pub case_sensitive: bool,
    pub is_regex: bool,
}

/// A rule that matched during evaluation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleMatch {
    pub rule_id: i64,
    pub category_id: i64,
    pub confidence: f64,
    pub rule_type: RuleType,
    pub pattern: String,
}

/// Result of replaying a candidate rule against categorized history
#[derive(Debug, Clone, Serialize)]
pub struct RuleTestResult {
    /// Historical transactions the rule matched
    pub matched: i64,
    /// Matches whose current category equals the rule's category
    pub agreeing: i64,
    pub accuracy: f64,
    pub examples: Vec<Transaction>,
}

// ========== Merchant Pattern Cache ==========

/// Where a cached merchant mapping came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatternSource {
    /// Learned from a confident automated decision
    Learned,
    /// Set by a user correction or confirmation
    User,
}

impl PatternSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Learned => "learned",
            Self::User => "user",
        }
    }
}

impl std::str::FromStr for PatternSource {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "learned" => Ok(Self::Learned),
            "user" => Ok(Self::User),
            _ => Err(format!("Unknown pattern source: {}", s)),
        }
    }
}

/// A merchant→category cache entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MerchantPattern {
    pub id: i64,
    pub organization_id: i64,
    /// Normalized merchant key
    pub pattern: String,
    pub category_id: i64,
    pub confidence: f64,
    pub usage_count: i64,
    pub source: PatternSource,
    pub last_used_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Quality of a pattern cache hit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchType {
    Exact,
    Fuzzy,
    Partial,
}

impl MatchType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Exact => "exact",
            Self::Fuzzy => "fuzzy",
            Self::Partial => "partial",
        }
    }
}

/// A pattern cache hit used by the Pattern stage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatternMatch {
    pub pattern_id: i64,
    pub pattern: String,
    pub category_id: i64,
    /// Confidence after scaling by match quality
    pub confidence: f64,
    pub similarity: f64,
    pub match_type: MatchType,
}

/// A cache entry ranked against a merchant for inspection
#[derive(Debug, Clone, Serialize)]
pub struct SimilarPattern {
    pub pattern: MerchantPattern,
    pub similarity: f64,
    pub score: f64,
}

// ========== Embeddings ==========

/// Stored embedding for a transaction
#[derive(Debug, Clone)]
pub struct TransactionEmbedding {
    pub transaction_id: i64,
    pub organization_id: i64,
    pub embedding: Vec<f32>,
    pub embedding_model: String,
    /// SHA-256 of the text that was embedded
    pub text_hash: String,
    /// Category label used for similarity voting
    pub category_id: Option<i64>,
}

/// A previously categorized transaction close to the one being categorized
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimilarityMatch {
    pub transaction_id: i64,
    pub category_id: i64,
    pub similarity: f64,
    pub description: String,
    pub merchant_name: Option<String>,
}

// ========== Categorization Results ==========

/// Which strategy produced a categorization result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CategorizationMethod {
    RuleBased,
    PatternBased,
    RagBased,
    LlmBased,
    BudgetExceeded,
    RateLimited,
}

impl CategorizationMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RuleBased => "rule_based",
            Self::PatternBased => "pattern_based",
            Self::RagBased => "rag_based",
            Self::LlmBased => "llm_based",
            Self::BudgetExceeded => "budget_exceeded",
            Self::RateLimited => "rate_limited",
        }
    }

    pub fn all() -> &'static [CategorizationMethod] {
        &[
            Self::RuleBased,
            Self::PatternBased,
            Self::RagBased,
            Self::LlmBased,
            Self::BudgetExceeded,
            Self::RateLimited,
        ]
    }
}

impl std::str::FromStr for CategorizationMethod {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "rule_based" => Ok(Self::RuleBased),
            "pattern_based" => Ok(Self::PatternBased),
            "rag_based" => Ok(Self::RagBased),
            "llm_based" => Ok(Self::LlmBased),
            "budget_exceeded" => Ok(Self::BudgetExceeded),
            "rate_limited" => Ok(Self::RateLimited),
            _ => Err(format!("Unknown categorization method: {}", s)),
        }
    }
}

/// Outcome of one stage within a cascade
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageTrace {
    pub stage: String,
    pub category_id: Option<i64>,
    pub confidence: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Evidence collected while categorizing a transaction
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MatchTrace {
    #[serde(default)]
    pub rule_matches: Vec<RuleMatch>,
    #[serde(default)]
    pub pattern_match: Option<PatternMatch>,
    #[serde(default)]
    pub similarity_matches: Vec<SimilarityMatch>,
    #[serde(default)]
    pub llm_model: Option<String>,
    #[serde(default)]
    pub llm_reasoning: Option<String>,
    #[serde(default)]
    pub stages: Vec<StageTrace>,
}

/// Result of one categorization attempt, stored as transaction metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategorizationResult {
    pub transaction_id: i64,
    /// Assigned category when `applied`, otherwise the best suggestion (if any)
    pub category_id: Option<i64>,
    pub confidence: f64,
    /// None when no stage produced a candidate at all
    pub method: Option<CategorizationMethod>,
    /// Whether category_id was written to the transaction
    pub applied: bool,
    pub processing_time_ms: u64,
    pub cost_estimate: f64,
    pub explanation: String,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub trace: MatchTrace,
    #[serde(default)]
    pub user_corrected: bool,
}

/// Which transactions a batch run should cover
#[derive(Debug, Clone, Default)]
pub struct BatchSelection {
    /// Explicit ids (takes precedence over the other selectors)
    pub transaction_ids: Vec<i64>,
    /// Inclusive date range
    pub date_range: Option<(NaiveDate, NaiveDate)>,
    /// Re-run transactions that already have a category
    pub force_recategorize: bool,
    /// Refuse the run if the worst-case LLM cost exceeds this
    pub max_cost: Option<f64>,
    pub limit: Option<i64>,
}

/// Aggregate categorization statistics for an organization
#[derive(Debug, Clone, Serialize)]
pub struct CategorizationStats {
    pub total_transactions: i64,
    pub categorized: i64,
    pub uncategorized: i64,
    pub by_method: Vec<(String, i64)>,
    pub avg_confidence: Option<f64>,
    pub user_corrected: i64,
}

// ========== Feedback ==========

/// Kind of user feedback on a categorization
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedbackType {
    /// User moved the transaction to a different category
    Correction,
    /// User agreed with the assigned category
    Confirmation,
    /// User marked the assigned category as wrong without choosing another
    Rejection,
}

impl FeedbackType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Correction => "correction",
            Self::Confirmation => "confirmation",
            Self::Rejection => "rejection",
        }
    }
}

impl std::str::FromStr for FeedbackType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "correction" | "correct" => Ok(Self::Correction),
            "confirmation" | "confirm" => Ok(Self::Confirmation),
            "rejection" | "reject" => Ok(Self::Rejection),
            _ => Err(format!("Unknown feedback type: {}", s)),
        }
    }
}

/// Feedback submitted by a user
#[derive(Debug, Clone)]
pub struct NewFeedback {
    pub transaction_id: i64,
    pub organization_id: i64,
    pub user_id: String,
    pub feedback_type: FeedbackType,
    /// Required for corrections; defaults to the current category for confirmations
    pub new_category_id: Option<i64>,
}

/// A recorded feedback event (append-only)
#[derive(Debug, Clone, Serialize)]
pub struct CategorizationFeedback {
    pub id: i64,
    pub transaction_id: i64,
    pub organization_id: i64,
    pub user_id: String,
    pub old_category_id: Option<i64>,
    pub new_category_id: Option<i64>,
    pub feedback_type: FeedbackType,
    pub confidence_before: Option<f64>,
    pub method_used: Option<CategorizationMethod>,
    pub created_at: DateTime<Utc>,
}

/// Returned after feedback is recorded
#[derive(Debug, Clone, Serialize)]
pub struct FeedbackReceipt {
    pub feedback_id: i64,
    /// Feedback recorded since the last learning pass
    pub pending_feedback: i64,
    pub relearn_eligible: bool,
}

/// Accuracy of one categorization method according to feedback
#[derive(Debug, Clone, Serialize)]
pub struct MethodAccuracy {
    pub method: String,
    pub total: i64,
    pub corrections: i64,
    pub accuracy: f64,
}

/// A frequent (old → new) category correction
#[derive(Debug, Clone, Serialize)]
pub struct CommonCorrection {
    pub from_category_id: Option<i64>,
    pub from_category: Option<String>,
    pub to_category_id: i64,
    pub to_category: String,
    pub count: i64,
    pub avg_confidence: Option<f64>,
}

/// A merchant whose categorizations are frequently corrected
#[derive(Debug, Clone, Serialize)]
pub struct ProblematicMerchant {
    pub merchant: String,
    pub corrections: i64,
}

/// Aggregated feedback for an organization
#[derive(Debug, Clone, Serialize)]
pub struct FeedbackAnalysis {
    pub organization_id: i64,
    pub total_feedback: i64,
    pub correction_rate: f64,
    pub confirmation_rate: f64,
    pub rejection_rate: f64,
    pub method_accuracy: Vec<MethodAccuracy>,
    pub common_corrections: Vec<CommonCorrection>,
    pub problematic_merchants: Vec<ProblematicMerchant>,
}

/// Summary of a learning pass
#[derive(Debug, Clone, Serialize)]
pub struct LearningRun {
    pub organization_id: i64,
    /// Highest feedback id consumed by this pass
    pub feedback_high_water: i64,
    pub patterns_mined: i64,
    pub embeddings_relabeled: i64,
    pub ran_at: DateTime<Utc>,
}

// ========== Costs ==========

/// Per-organization spend ledger for paid inference
#[derive(Debug, Clone, Serialize)]
pub struct CostTracker {
    pub organization_id: i64,
    /// 0 disables the monthly ceiling
    pub monthly_budget: f64,
    /// 0 disables the daily ceiling
    pub daily_budget: f64,
    /// Spend for `period_day`
    pub current_spend: f64,
    /// Spend for `period_month`
    pub monthly_spend: f64,
    pub transaction_count: i64,
    pub avg_cost_per_txn: f64,
    pub period_day: NaiveDate,
    /// "YYYY-MM"
    pub period_month: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BudgetPeriod {
    Daily,
    Monthly,
}

impl BudgetPeriod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Daily => "daily",
            Self::Monthly => "monthly",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertSeverity {
    Info,
    Warning,
    Critical,
}

impl AlertSeverity {
    pub fn for_usage(usage: f64) -> Self {
        if usage >= 0.95 {
            Self::Critical
        } else if usage >= 0.8 {
            Self::Warning
        } else {
            Self::Info
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Critical => "critical",
        }
    }
}

/// A budget usage threshold that has been reached
#[derive(Debug, Clone, Serialize)]
pub struct BudgetAlert {
    pub organization_id: i64,
    pub period: BudgetPeriod,
    pub threshold: f64,
    /// spend / budget
    pub usage: f64,
    pub severity: AlertSeverity,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SavingPriority {
    High,
    Medium,
}

impl SavingPriority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::High => "high",
            Self::Medium => "medium",
        }
    }
}

/// A way to lower LLM spend, with its expected monthly effect
#[derive(Debug, Clone, Serialize)]
pub struct CostSaving {
    pub name: &'static str,
    pub description: &'static str,
    /// Share of this month's spend it could save, in dollars
    pub estimated_savings: f64,
    pub priority: SavingPriority,
}

// ========== LLM ==========

/// Catalog entry for a chat model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LlmModel {
    pub name: String,
    pub cost_per_1k_tokens: f64,
    pub max_tokens: u32,
    pub accuracy_score: f64,
    #[serde(default)]
    pub is_default: bool,
}

/// How to pick a model from the catalog
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelStrategy {
    /// Cheapest per token
    Cost,
    /// Cheapest, then smallest context window
    Speed,
    /// Highest accuracy score
    Accuracy,
    /// Best accuracy per unit cost
    Balanced,
    /// The catalog default
    Default,
}

impl ModelStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cost => "cost",
            Self::Speed => "speed",
            Self::Accuracy => "accuracy",
            Self::Balanced => "balanced",
            Self::Default => "default",
        }
    }
}

impl std::str::FromStr for ModelStrategy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "cost" | "cost_optimized" => Ok(Self::Cost),
            "speed" | "speed_optimized" => Ok(Self::Speed),
            "accuracy" | "accuracy_optimized" => Ok(Self::Accuracy),
            "balanced" => Ok(Self::Balanced),
            "default" => Ok(Self::Default),
            _ => Err(format!("Unknown model strategy: {}", s)),
        }
    }
}

/// One LLM batch call, recorded for cost reconciliation
#[derive(Debug, Clone)]
pub struct NewLlmBatchRecord {
    pub organization_id: i64,
    pub model: String,
    pub transaction_count: i64,
    pub tokens_used: i64,
    pub estimated_cost: f64,
    pub actual_cost: f64,
    pub success_count: i64,
    pub avg_confidence: Option<f64>,
    pub processing_time_ms: i64,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct LlmBatchRecord {
    pub id: i64,
    pub organization_id: i64,
    pub model: String,
    pub transaction_count: i64,
    pub tokens_used: i64,
    pub estimated_cost: f64,
    pub actual_cost: f64,
    pub success_count: i64,
    pub avg_confidence: Option<f64>,
    pub processing_time_ms: i64,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_enum_round_trip_names() {
        for method in CategorizationMethod::all() {
            assert_eq!(method.as_str().parse::<CategorizationMethod>(), Ok(*method));
        }
        assert_eq!("regex".parse::<RuleType>(), Ok(RuleType::RegexPattern));
        assert_eq!(
            "cost_optimized".parse::<ModelStrategy>(),
            Ok(ModelStrategy::Cost)
        );
        assert!("sometimes".parse::<FeedbackType>().is_err());
    }

    #[test]
    fn test_alert_severity_bands() {
        assert_eq!(AlertSeverity::for_usage(0.5), AlertSeverity::Info);
        assert_eq!(AlertSeverity::for_usage(0.8), AlertSeverity::Warning);
        assert_eq!(AlertSeverity::for_usage(0.97), AlertSeverity::Critical);
    }

    #[test]
    fn test_result_metadata_tolerates_missing_fields() {
        let json = r#"{
            "transaction_id": 7,
            "category_id": 3,
            "confidence": 0.95,
            "method": "rule_based",
            "applied": true,
            "processing_time_ms": 2,
            "cost_estimate": 0.0,
            "explanation": "rule"
        }"#;
        let result: CategorizationResult = serde_json::from_str(json).unwrap();
        assert_eq!(result.method, Some(CategorizationMethod::RuleBased));
        assert!(result.trace.rule_matches.is_empty());
        assert!(!result.user_corrected);
    }
}
