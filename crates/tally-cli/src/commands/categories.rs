//! Category and transaction command implementations

use anyhow::{Context, Result};
use chrono::Utc;
use tally_core::models::NewTransaction;
use tally_core::Pipeline;

use super::{category_label, category_names, parse_date, resolve_category, truncate};

pub fn cmd_categories_list(pipeline: &Pipeline, org: i64) -> Result<()> {
    let categories = pipeline.db().list_categories(org)?;

    if categories.is_empty() {
        println!("No categories found. Run 'tally init' to seed default categories.");
        return Ok(());
    }

    let names = category_names(pipeline.db(), org)?;

    println!();
    println!("🏷️  Categories");
    println!("   ─────────────────────────────────────────");
    for category in &categories {
        let parent = category
            .parent_id
            .map(|p| format!(" (under {})", category_label(&names, Some(p))))
            .unwrap_or_default();
        let color = category
            .color
            .as_ref()
            .map(|c| format!(" [{}]", c))
            .unwrap_or_default();
        println!("   {:>4}  {}{}{}", category.id, category.name, color, parent);
    }

    Ok(())
}

pub fn cmd_categories_add(
    pipeline: &Pipeline,
    org: i64,
    name: &str,
    parent: Option<&str>,
    color: Option<&str>,
) -> Result<()> {
    let db = pipeline.db();

    if db.find_category_by_name(org, name)?.is_some() {
        anyhow::bail!("Category '{}' already exists", name);
    }

    let parent_id = match parent {
        Some(parent) => Some(resolve_category(db, org, parent)?.id),
        None => None,
    };

    let id = db.create_category(org, name, parent_id, color, None)?;
    println!("✅ Created category '{}' (id: {})", name, id);

    Ok(())
}

pub fn cmd_transactions_list(pipeline: &Pipeline, org: i64, limit: i64, uncategorized: bool) -> Result<()> {
    let db = pipeline.db();
    let transactions = if uncategorized {
        db.list_uncategorized(org, limit)?
    } else {
        db.list_transactions(org, limit, 0)?
    };

    if transactions.is_empty() {
        println!("No transactions found.");
        return Ok(());
    }

    let names = category_names(db, org)?;

    println!();
    println!(
        "   {:>5}  {:<10}  {:>10}  {:<28}  {:<14}  METHOD",
        "ID", "DATE", "AMOUNT", "MERCHANT / DESCRIPTION", "CATEGORY"
    );
    println!("   {}", "─".repeat(90));

    for tx in &transactions {
        let label = tx.merchant_name.as_deref().unwrap_or(&tx.description);
        let method = tx
            .categorization
            .as_ref()
            .and_then(|c| c.method)
            .map(|m| m.as_str())
            .unwrap_or("-");
        println!(
            "   {:>5}  {}  {:>10.2}  {:<28}  {:<14}  {}",
            tx.id,
            tx.date,
            tx.amount,
            truncate(label, 28),
            truncate(&category_label(&names, tx.category_id), 14),
            method
        );
    }

    Ok(())
}

pub fn cmd_transactions_add(
    pipeline: &Pipeline,
    org: i64,
    amount: f64,
    description: &str,
    merchant: Option<&str>,
    date: Option<&str>,
) -> Result<()> {
    if !amount.is_finite() {
        anyhow::bail!("Amount must be a finite number");
    }
    if description.trim().is_empty() {
        anyhow::bail!("Description cannot be empty");
    }

    let date = match date {
        Some(date) => parse_date(date)?,
        None => Utc::now().date_naive(),
    };

    let id = pipeline
        .db()
        .insert_transaction(&NewTransaction {
            organization_id: org,
            amount,
            description: description.to_string(),
            merchant_name: merchant.map(str::to_string),
            date,
        })
        .context("Failed to insert transaction")?;

    println!("✅ Added transaction {} ({:.2} on {})", id, amount, date);
    Ok(())
}

pub fn cmd_transactions_show(pipeline: &Pipeline, org: i64, id: i64) -> Result<()> {
    let db = pipeline.db();
    let tx = db
        .get_transaction(id)?
        .filter(|tx| tx.organization_id == org)
        .ok_or_else(|| anyhow::anyhow!("Transaction not found: {}", id))?;
    let names = category_names(db, org)?;

    println!();
    println!("🧾 Transaction {}", tx.id);
    println!("   Date:        {}", tx.date);
    println!("   Amount:      {:.2}", tx.amount);
    println!("   Merchant:    {}", tx.merchant_name.as_deref().unwrap_or("-"));
    println!("   Description: {}", tx.description);
    println!("   Category:    {}", category_label(&names, tx.category_id));

    if let Some(result) = &tx.categorization {
        println!();
        println!("   Last categorization:");
        println!(
            "     Method:     {}",
            result.method.map(|m| m.as_str()).unwrap_or("-")
        );
        println!(
            "     Suggested:  {} ({:.2}){}",
            category_label(&names, result.category_id),
            result.confidence,
            if result.applied { "" } else { " - not applied" }
        );
        println!("     Reason:     {}", result.explanation);
        if result.cost_estimate > 0.0 {
            println!("     Cost:       ${:.6}", result.cost_estimate);
        }
        if let Some(error) = &result.error {
            println!("     Error:      {}", error);
        }
        if result.user_corrected {
            println!("     ✋ Set by user feedback");
        }
        for stage in &result.trace.stages {
            println!(
                "     - {:<8} {:<14} {:.2}{}",
                stage.stage,
                category_label(&names, stage.category_id),
                stage.confidence,
                stage
                    .error
                    .as_ref()
                    .map(|e| format!(" ({})", e))
                    .unwrap_or_default()
            );
        }
    }

    let feedback = pipeline.feedback().feedback_for_transaction(org, id)?;
    if !feedback.is_empty() {
        println!();
        println!("   Feedback:");
        for fb in &feedback {
            println!(
                "     {}  {:<12} {} → {}  by {}",
                fb.created_at.format("%Y-%m-%d %H:%M"),
                fb.feedback_type.as_str(),
                category_label(&names, fb.old_category_id),
                category_label(&names, fb.new_category_id),
                fb.user_id
            );
        }
    }

    Ok(())
}
