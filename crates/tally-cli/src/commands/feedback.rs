//! Feedback command implementations

use anyhow::Result;
use tally_core::models::{FeedbackType, NewFeedback};
use tally_core::Pipeline;

use super::{category_label, category_names, resolve_category};

pub fn cmd_feedback_record(
    pipeline: &Pipeline,
    org: i64,
    transaction_id: i64,
    kind: &str,
    category: Option<&str>,
    user: &str,
) -> Result<()> {
    let feedback_type: FeedbackType = kind.parse().map_err(|e: String| anyhow::anyhow!(e))?;
    let new_category_id = match category {
        Some(category) => Some(resolve_category(pipeline.db(), org, category)?.id),
        None => None,
    };

    let receipt = pipeline.feedback().record_feedback(&NewFeedback {
        transaction_id,
        organization_id: org,
        user_id: user.to_string(),
        feedback_type,
        new_category_id,
    })?;

    println!(
        "✅ Recorded {} for transaction {} (feedback {})",
        feedback_type.as_str(),
        transaction_id,
        receipt.feedback_id
    );
    if receipt.relearn_eligible {
        println!(
            "   💡 {} feedback entries since the last learning pass. Run 'tally feedback learn'.",
            receipt.pending_feedback
        );
    }
    Ok(())
}

pub fn cmd_feedback_list(pipeline: &Pipeline, org: i64, transaction: Option<i64>, limit: i64) -> Result<()> {
    let feedback = match transaction {
        Some(id) => pipeline.feedback().feedback_for_transaction(org, id)?,
        None => pipeline.feedback().list_feedback(org, limit, 0)?,
    };

    if feedback.is_empty() {
        println!("No feedback recorded.");
        return Ok(());
    }

    let names = category_names(pipeline.db(), org)?;

    println!();
    println!(
        "   {:>5}  {:<16}  {:>5}  {:<12}  {:<14}  {:<14}  {:<14}  USER",
        "ID", "WHEN", "TX", "TYPE", "FROM", "TO", "METHOD"
    );
    println!("   {}", "─".repeat(100));
    for fb in &feedback {
        println!(
            "   {:>5}  {:<16}  {:>5}  {:<12}  {:<14}  {:<14}  {:<14}  {}",
            fb.id,
            fb.created_at.format("%Y-%m-%d %H:%M"),
            fb.transaction_id,
            fb.feedback_type.as_str(),
            category_label(&names, fb.old_category_id),
            category_label(&names, fb.new_category_id),
            fb.method_used.map(|m| m.as_str()).unwrap_or("-"),
            fb.user_id
        );
    }
    Ok(())
}

pub fn cmd_feedback_analyze(pipeline: &Pipeline, org: i64) -> Result<()> {
    let analysis = pipeline.feedback().analyze_feedback(org)?;

    if analysis.total_feedback == 0 {
        println!("No feedback recorded yet.");
        return Ok(());
    }

    println!();
    println!("📈 Feedback Analysis");
    println!("   ─────────────────────────────");
    println!("   Total feedback:    {}", analysis.total_feedback);
    println!("   Corrections:       {:.0}%", analysis.correction_rate * 100.0);
    println!("   Confirmations:     {:.0}%", analysis.confirmation_rate * 100.0);
    println!("   Rejections:        {:.0}%", analysis.rejection_rate * 100.0);

    if !analysis.method_accuracy.is_empty() {
        println!();
        println!("   Accuracy by method:");
        for m in &analysis.method_accuracy {
            println!(
                "     {:<16} {:>5.0}%  ({} of {} corrected)",
                m.method,
                m.accuracy * 100.0,
                m.corrections,
                m.total
            );
        }
    }

    if !analysis.common_corrections.is_empty() {
        println!();
        println!("   Common corrections:");
        for c in &analysis.common_corrections {
            println!(
                "     {} → {}  ×{}",
                c.from_category.as_deref().unwrap_or("(none)"),
                c.to_category,
                c.count
            );
        }
    }

    if !analysis.problematic_merchants.is_empty() {
        println!();
        println!("   ⚠️  Frequently corrected merchants:");
        for m in &analysis.problematic_merchants {
            println!("     {:<30} {} corrections", m.merchant, m.corrections);
        }
    }

    Ok(())
}

pub fn cmd_feedback_learn(pipeline: &Pipeline, org: i64) -> Result<()> {
    println!("🧠 Running learning pass...");
    let run = pipeline.feedback().run_learning_pass(org)?;

    println!("✅ Learning pass complete");
    println!("   Patterns mined:       {}", run.patterns_mined);
    println!("   Embeddings relabeled: {}", run.embeddings_relabeled);
    Ok(())
}
