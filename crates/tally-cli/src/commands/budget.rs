//! Budget command implementations

use anyhow::Result;
use tally_core::models::{AlertSeverity, CostTracker};
use tally_core::Pipeline;

fn ceiling(budget: f64) -> String {
    if budget > 0.0 {
        format!("${:.2}", budget)
    } else {
        "unlimited".to_string()
    }
}

fn print_tracker(pipeline: &Pipeline, tracker: &CostTracker) {
    println!();
    println!("💰 LLM Budget (organization {})", tracker.organization_id);
    println!("   ─────────────────────────────");
    println!(
        "   Today ({}):      ${:.4} of {}",
        tracker.period_day,
        tracker.current_spend,
        ceiling(tracker.daily_budget)
    );
    println!(
        "   Month ({}):      ${:.4} of {}",
        tracker.period_month,
        tracker.monthly_spend,
        ceiling(tracker.monthly_budget)
    );
    match pipeline.budget().remaining(tracker) {
        Some(remaining) => println!("   Remaining:            ${:.4}", remaining),
        None => println!("   Remaining:            unlimited"),
    }
    println!("   LLM transactions:     {}", tracker.transaction_count);
    if tracker.transaction_count > 0 {
        println!("   Avg cost/transaction: ${:.6}", tracker.avg_cost_per_txn);
    }
}

pub fn cmd_budget_show(pipeline: &Pipeline, org: i64) -> Result<()> {
    let tracker = pipeline.budget().get_cost_tracker(org)?;
    print_tracker(pipeline, &tracker);

    let alerts = pipeline.budget().budget_alerts(&tracker);
    if !alerts.is_empty() {
        println!();
        for alert in &alerts {
            let icon = match alert.severity {
                AlertSeverity::Info => "ℹ️ ",
                AlertSeverity::Warning => "⚠️ ",
                AlertSeverity::Critical => "🚨",
            };
            println!("   {} {}", icon, alert.message);
        }
    }

    let savings = pipeline.budget().cost_savings(&tracker);
    if !savings.is_empty() {
        println!();
        println!("   Ways to spend less:");
        for saving in &savings {
            println!(
                "     [{}] {} (~${:.2}/month): {}",
                saving.priority.as_str(),
                saving.name,
                saving.estimated_savings,
                saving.description
            );
        }
    }
    Ok(())
}

pub fn cmd_budget_set(pipeline: &Pipeline, org: i64, monthly: Option<f64>, daily: Option<f64>) -> Result<()> {
    if monthly.is_none() && daily.is_none() {
        anyhow::bail!("Nothing to change: pass --monthly and/or --daily");
    }

    let current = pipeline.budget().get_cost_tracker(org)?;
    let tracker = pipeline.budget().update_budget(
        org,
        monthly.unwrap_or(current.monthly_budget),
        daily.unwrap_or(current.daily_budget),
    )?;

    println!(
        "✅ Budget updated: monthly {}, daily {}",
        ceiling(tracker.monthly_budget),
        ceiling(tracker.daily_budget)
    );
    Ok(())
}
