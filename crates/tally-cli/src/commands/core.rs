//! Core command implementations and shared utilities
//!
//! This module contains:
//! - `open_db` / `load_config` / `build_pipeline` - Shared setup for every command
//! - `cmd_init` - Initialize the database
//! - `cmd_stats` - Categorization statistics
//! - `cmd_status` - Backend health, rate limit usage and budget headroom
//! - `cmd_prompts_list` - Prompt override status

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use tally_core::prompts::{default_prompts_dir, PromptId, PromptLibrary};
use tally_core::{config, Database, EngineConfig, MockBackend, Pipeline, UsageRecorder};
use tracing::debug;

use crate::cli::Backend;

/// Open (or create) the database file
pub fn open_db(db_path: &Path) -> Result<Database> {
    let path_str = db_path
        .to_str()
        .with_context(|| format!("Database path is not valid UTF-8: {}", db_path.display()))?;
    Database::new(path_str).context("Failed to open database")
}

/// Explicit --config path, else the data dir override, else built-in defaults
pub fn load_config(path: Option<&Path>) -> Result<EngineConfig> {
    let config = match path {
        Some(path) => EngineConfig::from_path(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => EngineConfig::load().context("Failed to load engine config")?,
    };
    Ok(config)
}

/// Wire the pipeline with the selected capability backend
pub fn build_pipeline(
    db: &Database,
    config: EngineConfig,
    backend: Backend,
    usage: UsageRecorder,
) -> Result<Pipeline> {
    let builder = Pipeline::builder(db.clone(), config).usage(usage);

    let builder = match backend {
        Backend::Mock => {
            let mock = Arc::new(MockBackend::new());
            builder.embedder(mock.clone()).chat(mock)
        }
        Backend::None => builder,
    };

    debug!(?backend, "Building pipeline");
    builder.build().context("Failed to build categorization pipeline")
}

pub fn cmd_init(db_path: &Path, org: i64) -> Result<()> {
    println!("🔧 Initializing database at {}...", db_path.display());

    let db = open_db(db_path)?;

    let seeded = db
        .seed_default_categories(org)
        .context("Failed to seed default categories")?;
    if seeded > 0 {
        println!("   Seeded {} default categories for organization {}", seeded, org);
    } else {
        println!("   Organization {} already has categories", org);
    }

    println!("✅ Database initialized successfully!");
    println!();
    println!("Next steps:");
    println!("  1. Add rules:        tally rules add Dining 'STARBUCKS*'");
    println!("  2. Add transactions: tally transactions add --amount -5.75 --description COFFEE --merchant 'STARBUCKS #123'");
    println!("  3. Categorize:       tally categorize batch");

    Ok(())
}

pub fn cmd_stats(pipeline: &Pipeline, org: i64) -> Result<()> {
    let stats = pipeline.stats(org)?;
    let db = pipeline.db();
    let (patterns, user_patterns, pattern_hits) = db.merchant_pattern_stats(org)?;
    let (embeddings, labeled) = db.embedding_counts(org)?;

    println!();
    println!("📊 Categorization Statistics");
    println!("   ─────────────────────────────");
    println!("   Transactions:    {}", stats.total_transactions);
    println!("   Categorized:     {}", stats.categorized);
    println!("   Uncategorized:   {}", stats.uncategorized);
    if let Some(avg) = stats.avg_confidence {
        println!("   Avg confidence:  {:.2}", avg);
    }
    println!("   User corrected:  {}", stats.user_corrected);

    if !stats.by_method.is_empty() {
        println!();
        println!("   By method:");
        for (method, count) in &stats.by_method {
            println!("     {:<16} {:>6}", method, count);
        }
    }

    println!();
    println!(
        "   Pattern cache:   {} entries ({} from users, {} hits)",
        patterns, user_patterns, pattern_hits
    );
    println!("   Embeddings:      {} ({} labeled)", embeddings, labeled);

    Ok(())
}

pub async fn cmd_status(pipeline: &Pipeline, org: i64) -> Result<()> {
    let status = pipeline.status(org).await?;
    let limits = pipeline.rate_limiter().settings();

    println!();
    println!("🩺 Pipeline Status");
    println!("   ─────────────────────────────");
    match &status.embedding_model {
        Some(model) => println!("   RAG stage:       enabled ({})", model),
        None => println!("   RAG stage:       disabled (no embedder)"),
    }
    match status.llm_healthy {
        Some(true) => println!("   LLM backend:     ✅ available"),
        Some(false) => println!("   LLM backend:     ❌ unavailable (unresolved transactions stay suggestions)"),
        None => println!("   LLM backend:     disabled"),
    }

    println!();
    println!(
        "   Requests/hour:   {} of {}",
        status.requests_last_hour,
        limit_label(f64::from(limits.max_requests_per_hour), 0)
    );
    println!(
        "   Cost/hour:       ${:.4} of {}",
        status.cost_last_hour,
        limit_label(limits.max_cost_per_hour, 2)
    );
    match status.remaining_budget {
        Some(remaining) => println!("   Budget left:     ${:.4}", remaining),
        None => println!("   Budget left:     unlimited"),
    }
    println!(
        "   Spend today:     ${:.4} (month ${:.4})",
        status.tracker.current_spend, status.tracker.monthly_spend
    );

    Ok(())
}

fn limit_label(limit: f64, decimals: usize) -> String {
    if limit > 0.0 {
        format!("{:.*}", decimals, limit)
    } else {
        "unlimited".to_string()
    }
}

/// List all available prompts and their override status
pub fn cmd_prompts_list() -> Result<()> {
    let mut library = PromptLibrary::new();

    println!("Available Prompts:\n");
    println!("{:<25} {:>7}  {:<22}  OVERRIDE", "ID", "VERSION", "TASK TYPE");
    println!("{}", "-".repeat(70));

    for id in PromptId::all() {
        let has_override = library.has_override(*id);
        let prompt = library.get(*id)?;
        println!(
            "{:<25} {:>7}  {:<22}  {}",
            id.as_str(),
            prompt.metadata.version,
            prompt.metadata.task_type,
            if has_override { "✓ Custom" } else { "Default" }
        );
    }

    println!();
    println!(
        "Override directory: {}",
        default_prompts_dir()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "(not available)".to_string())
    );
    println!(
        "Config override:    {}",
        config::default_config_path()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "(not available)".to_string())
    );

    Ok(())
}
