//! CLI argument definitions using clap
//!
//! This module contains all the clap structs and enums for parsing CLI arguments.
//! The actual command implementations are in the `commands` module.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

/// Tally - Cost-aware transaction categorization
#[derive(Parser)]
#[command(name = "tally")]
#[command(about = "Cascading, cost-aware transaction categorization", long_about = None)]
#[command(version)]
pub struct Cli {
    /// Database path
    #[arg(long, default_value = "tally.db", global = true)]
    pub db: PathBuf,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Engine configuration file (defaults to the data dir override, then built-in defaults)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Embedding/chat backend used by the RAG and LLM stages
    ///
    /// `none` disables both stages: unresolved transactions are left as
    /// suggestions.
    #[arg(long, value_enum, default_value = "mock", global = true)]
    pub backend: Backend,

    /// Organization to operate on
    #[arg(long, default_value = "1", global = true)]
    pub org: i64,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Backend {
    /// Offline keyword classifier and hashed embeddings
    Mock,
    /// Cheap stages only
    None,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Initialize the database and seed default categories
    Init,

    /// Manage categories (list, add)
    Categories {
        #[command(subcommand)]
        action: Option<CategoriesAction>,
    },

    /// Manage transactions (list, add, show)
    Transactions {
        #[command(subcommand)]
        action: Option<TransactionsAction>,
    },

    /// Manage categorization rules (list, add, update, delete, test)
    Rules {
        #[command(subcommand)]
        action: Option<RulesAction>,
    },

    /// Inspect the merchant pattern cache (list, similar, clear)
    Patterns {
        #[command(subcommand)]
        action: Option<PatternsAction>,
    },

    /// Run the categorization cascade
    Categorize {
        #[command(subcommand)]
        action: CategorizeAction,
    },

    /// Record and analyze user feedback
    Feedback {
        #[command(subcommand)]
        action: FeedbackAction,
    },

    /// Show or change the LLM spend ceilings
    Budget {
        #[command(subcommand)]
        action: Option<BudgetAction>,
    },

    /// Show categorization statistics
    Stats,

    /// Check backend health, rate limit usage and remaining budget
    Status,

    /// List AI prompts and their override status
    Prompts,
}

#[derive(Subcommand)]
pub enum CategoriesAction {
    /// List categories
    List,

    /// Add a category
    Add {
        /// Category name
        name: String,

        /// Parent category name or ID
        #[arg(long)]
        parent: Option<String>,

        /// Display color (e.g. "#2ecc71")
        #[arg(long)]
        color: Option<String>,
    },
}

#[derive(Subcommand)]
pub enum TransactionsAction {
    /// List transactions
    List {
        /// Number of transactions to show
        #[arg(short, long, default_value = "20")]
        limit: i64,

        /// Only show uncategorized transactions
        #[arg(long)]
        uncategorized: bool,
    },

    /// Add a transaction
    Add {
        /// Signed amount (negative = expense)
        #[arg(long, allow_hyphen_values = true)]
        amount: f64,

        /// Bank description
        #[arg(long)]
        description: String,

        /// Merchant name
        #[arg(long)]
        merchant: Option<String>,

        /// Date (YYYY-MM-DD, defaults to today)
        #[arg(long)]
        date: Option<String>,
    },

    /// Show a transaction with its categorization metadata and feedback
    Show {
        /// Transaction ID
        id: i64,
    },
}

#[derive(Subcommand)]
pub enum RulesAction {
    /// List rules in evaluation order
    List,

    /// Add a rule
    Add {
        /// Category name or ID
        category: String,

        /// Pattern (wildcards, keyword, "min,max" amount range, or regex)
        pattern: String,

        #[command(flatten)]
        options: RuleOptions,
    },

    /// Update a rule (omitted fields keep their current values)
    Update {
        /// Rule ID
        id: i64,

        /// New category name or ID
        #[arg(long)]
        category: Option<String>,

        /// New pattern
        #[arg(long, allow_hyphen_values = true)]
        pattern: Option<String>,

        /// New rule type
        #[arg(long = "type")]
        rule_type: Option<String>,

        /// New confidence (0-1)
        #[arg(long)]
        confidence: Option<f64>,

        /// New priority
        #[arg(long, allow_hyphen_values = true)]
        priority: Option<i32>,

        /// Match case-sensitively
        #[arg(long)]
        case_sensitive: Option<bool>,

        /// Treat the pattern as a regular expression
        #[arg(long)]
        regex: Option<bool>,
    },

    /// Delete a rule
    Delete {
        /// Rule ID
        id: i64,
    },

    /// Replay a candidate rule against categorized history
    Test {
        /// Category name or ID
        category: String,

        /// Pattern to test
        pattern: String,

        #[command(flatten)]
        options: RuleOptions,

        /// Number of example matches to show
        #[arg(long, default_value = "5")]
        examples: usize,
    },
}

#[derive(Args, Debug, Clone)]
pub struct RuleOptions {
    /// Rule type: merchant, keyword, amount, regex
    #[arg(long = "type", default_value = "merchant")]
    pub rule_type: String,

    /// Confidence returned when the rule matches (0-1)
    #[arg(long, default_value = "0.95")]
    pub confidence: f64,

    /// Higher priority rules are checked first
    #[arg(long, default_value = "0", allow_hyphen_values = true)]
    pub priority: i32,

    /// Match case-sensitively
    #[arg(long)]
    pub case_sensitive: bool,

    /// Treat the pattern as a regular expression
    #[arg(long)]
    pub regex: bool,
}

#[derive(Subcommand)]
pub enum PatternsAction {
    /// List cached merchant patterns
    List,

    /// Show cache entries similar to a merchant name
    Similar {
        /// Merchant name
        merchant: String,

        /// Minimum similarity (0-1)
        #[arg(long, default_value = "0.6")]
        threshold: f64,
    },

    /// Clear the merchant pattern cache
    Clear {
        /// Skip confirmation prompt
        #[arg(long, short = 'y')]
        yes: bool,
    },
}

#[derive(Subcommand)]
pub enum CategorizeAction {
    /// Categorize one transaction
    One {
        /// Transaction ID
        id: i64,

        /// Print the full result as JSON
        #[arg(long)]
        json: bool,
    },

    /// Categorize a selection of transactions
    Batch {
        #[command(flatten)]
        selection: SelectionArgs,

        /// Refuse to run if the worst-case LLM cost exceeds this amount
        #[arg(long)]
        max_cost: Option<f64>,

        /// Print the full report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Preview the transaction count and worst-case LLM cost of a batch
    Estimate {
        #[command(flatten)]
        selection: SelectionArgs,
    },

    /// Show labeled transactions closest to one transaction
    Similar {
        /// Transaction ID
        id: i64,

        /// Minimum cosine similarity (0-1)
        #[arg(long, default_value = "0.5")]
        threshold: f64,

        /// Number of neighbors to show
        #[arg(short, long, default_value = "5")]
        limit: usize,
    },

    /// Embed already categorized transactions for the RAG stage
    Embed {
        /// Maximum transactions to embed
        #[arg(short, long, default_value = "1000")]
        limit: i64,
    },
}

#[derive(Args, Debug, Clone, Default)]
pub struct SelectionArgs {
    /// Explicit transaction IDs (comma-separated)
    #[arg(long, value_delimiter = ',')]
    pub ids: Vec<i64>,

    /// Start date (YYYY-MM-DD)
    #[arg(long)]
    pub from: Option<String>,

    /// End date (YYYY-MM-DD)
    #[arg(long)]
    pub to: Option<String>,

    /// Re-run transactions that already have a category
    #[arg(long)]
    pub force: bool,

    /// Maximum transactions to select
    #[arg(short, long)]
    pub limit: Option<i64>,
}

#[derive(Subcommand)]
pub enum FeedbackAction {
    /// Record a correction, confirmation or rejection
    Record {
        /// Transaction ID
        transaction_id: i64,

        /// Feedback type: correction, confirmation, rejection
        #[arg(long = "type", default_value = "correction")]
        kind: String,

        /// Corrected category name or ID (required for corrections)
        #[arg(long)]
        category: Option<String>,

        /// Who gave the feedback
        #[arg(long, default_value = "cli")]
        user: String,
    },

    /// List recorded feedback
    List {
        /// Only feedback for this transaction
        #[arg(long)]
        transaction: Option<i64>,

        /// Number of entries to show
        #[arg(short, long, default_value = "20")]
        limit: i64,
    },

    /// Summarize feedback: rates, method accuracy, common corrections
    Analyze,

    /// Run a learning pass over recent feedback
    Learn,
}

#[derive(Subcommand)]
pub enum BudgetAction {
    /// Show spend, remaining budget and alerts
    Show,

    /// Set the spend ceilings (0 disables a ceiling)
    Set {
        /// Monthly ceiling in dollars
        #[arg(long)]
        monthly: Option<f64>,

        /// Daily ceiling in dollars
        #[arg(long)]
        daily: Option<f64>,
    },
}
