//! Categorization command implementations

use anyhow::{Context, Result};
use tally_core::models::{BatchSelection, CategorizationResult};
use tally_core::{BatchReport, CancelFlag, Pipeline};
use tracing::warn;

use super::{category_label, category_names, parse_date, truncate};
use crate::cli::SelectionArgs;

/// Turn the selection flags into a batch selection
pub fn selection_from_args(args: &SelectionArgs, max_cost: Option<f64>) -> Result<BatchSelection> {
    let date_range = match (&args.from, &args.to) {
        (None, None) => None,
        (Some(from), Some(to)) => Some((parse_date(from)?, parse_date(to)?)),
        (Some(_), None) | (None, Some(_)) => {
            anyhow::bail!("--from and --to must be given together")
        }
    };

    if let Some(max_cost) = max_cost {
        if !max_cost.is_finite() || max_cost < 0.0 {
            anyhow::bail!("--max-cost must be a non-negative amount");
        }
    }

    Ok(BatchSelection {
        transaction_ids: args.ids.clone(),
        date_range,
        force_recategorize: args.force,
        max_cost,
        limit: args.limit,
    })
}

pub async fn cmd_categorize_one(pipeline: &Pipeline, org: i64, id: i64, json: bool) -> Result<()> {
    let tx = pipeline
        .db()
        .get_transaction(id)?
        .filter(|tx| tx.organization_id == org)
        .ok_or_else(|| anyhow::anyhow!("Transaction not found: {}", id))?;

    let result = pipeline.categorize(&tx).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&result)?);
        return Ok(());
    }

    let names = category_names(pipeline.db(), org)?;
    println!();
    print_result(&result, &names);
    Ok(())
}

pub async fn cmd_categorize_batch(
    pipeline: &Pipeline,
    org: i64,
    args: &SelectionArgs,
    max_cost: Option<f64>,
    json: bool,
) -> Result<()> {
    let selection = selection_from_args(args, max_cost)?;

    // Ctrl-C stops the run at the next chunk boundary
    let cancel = CancelFlag::new();
    let interrupt = cancel.clone();
    let watcher = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, stopping after the current chunk");
            interrupt.cancel();
        }
    });

    let report = pipeline.categorize_selection(org, &selection, &cancel).await;
    watcher.abort();
    let report = report.context("Batch categorization failed")?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    let names = category_names(pipeline.db(), org)?;
    print_report(&report, &names);
    Ok(())
}

pub fn cmd_categorize_estimate(pipeline: &Pipeline, org: i64, args: &SelectionArgs) -> Result<()> {
    let selection = selection_from_args(args, None)?;
    let estimate = pipeline.estimate_batch(org, &selection)?;

    println!();
    println!("💰 Batch Estimate");
    println!("   ─────────────────────────────");
    println!("   Transactions:     {}", estimate.transaction_count);
    match &estimate.model {
        Some(model) => {
            println!("   Model:            {}", model);
            println!("   Worst-case cost:  ${:.6}", estimate.estimated_max_cost);
        }
        None => println!("   Model:            none (cheap stages only, no LLM cost)"),
    }
    match estimate.remaining_budget {
        Some(remaining) => println!("   Remaining budget: ${:.4}", remaining),
        None => println!("   Remaining budget: unlimited"),
    }

    println!();
    if estimate.fits_budget {
        println!("✅ Fits within the remaining budget");
    } else {
        println!("⚠️  Exceeds the remaining budget: unresolved transactions will be marked budget_exceeded");
    }
    Ok(())
}

pub async fn cmd_categorize_similar(
    pipeline: &Pipeline,
    org: i64,
    id: i64,
    threshold: f64,
    limit: usize,
) -> Result<()> {
    if !(0.0..=1.0).contains(&threshold) {
        anyhow::bail!("Threshold must be between 0 and 1");
    }
    let rag = pipeline
        .rag()
        .ok_or_else(|| anyhow::anyhow!("Similarity search needs an embedding backend"))?;
    let tx = pipeline
        .db()
        .get_transaction(id)?
        .filter(|tx| tx.organization_id == org)
        .ok_or_else(|| anyhow::anyhow!("Transaction not found: {}", id))?;

    let matches = rag.find_similar(&tx, threshold, limit).await?;
    if matches.is_empty() {
        println!("No labeled transactions at or above {:.2} similarity.", threshold);
        return Ok(());
    }

    let names = category_names(pipeline.db(), org)?;
    println!();
    println!("{:>6}  {:>5}  {:<16}  MERCHANT / DESCRIPTION", "ID", "SIM", "CATEGORY");
    println!("{}", "-".repeat(70));
    for m in &matches {
        println!(
            "{:>6}  {:>5.2}  {:<16}  {}",
            m.transaction_id,
            m.similarity,
            truncate(&category_label(&names, Some(m.category_id)), 16),
            truncate(m.merchant_name.as_deref().unwrap_or(&m.description), 36)
        );
    }
    Ok(())
}

pub async fn cmd_categorize_embed(pipeline: &Pipeline, org: i64, limit: i64) -> Result<()> {
    if limit <= 0 {
        anyhow::bail!("Limit must be positive");
    }

    println!("🧬 Embedding categorized transactions...");
    let embedded = pipeline.backfill_embeddings(org, limit).await?;
    println!("✅ {} transactions embedded and labeled", embedded);
    Ok(())
}

fn print_result(result: &CategorizationResult, names: &std::collections::HashMap<i64, String>) {
    let status = if result.applied {
        "✅"
    } else if result.error.is_some() {
        "❌"
    } else {
        "💡"
    };

    println!(
        "{} Transaction {}: {} ({:.2}) via {}{}",
        status,
        result.transaction_id,
        category_label(names, result.category_id),
        result.confidence,
        result.method.map(|m| m.as_str()).unwrap_or("none"),
        if result.applied { "" } else { " - not applied" }
    );
    println!("   {}", result.explanation);
    if let Some(error) = &result.error {
        println!("   Error: {}", error);
    }
    if result.cost_estimate > 0.0 {
        println!("   Cost: ${:.6}", result.cost_estimate);
    }
}

fn print_report(report: &BatchReport, names: &std::collections::HashMap<i64, String>) {
    println!();
    for result in &report.results {
        let marker = if result.applied { " " } else { "?" };
        println!(
            "   {} {:>5}  {:<16}  {:<16}  {:.2}",
            marker,
            result.transaction_id,
            truncate(&category_label(names, result.category_id), 16),
            result.method.map(|m| m.as_str()).unwrap_or("-"),
            result.confidence
        );
    }

    println!();
    println!("📊 Batch Results");
    println!("   ─────────────────────────────");
    println!("   Processed:     {}", report.processed);
    println!("   Applied:       {}", report.applied);
    for (method, count) in &report.by_method {
        println!("     {:<16} {:>5}", method, count);
    }
    println!("   Sent to LLM:   {}", report.llm_sent);
    if report.duplicates > 0 {
        println!("   Duplicates:    {}", report.duplicates);
    }
    println!("   Cost:          ${:.6}", report.total_cost);
    if report.cancelled {
        println!();
        println!("⚠️  Cancelled: {} transactions left untouched", report.skipped);
    }
}
