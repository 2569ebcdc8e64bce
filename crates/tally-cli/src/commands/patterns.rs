//! Merchant pattern cache commands

use std::io::{self, Write};

use anyhow::Result;
use tally_core::Pipeline;

use super::{category_label, category_names, truncate};

pub fn cmd_patterns_list(pipeline: &Pipeline, org: i64) -> Result<()> {
    let patterns = pipeline.patterns().list_patterns(org)?;

    if patterns.is_empty() {
        println!("Pattern cache is empty. Patterns are learned from confident categorizations and feedback.");
        return Ok(());
    }

    let names = category_names(pipeline.db(), org)?;

    println!();
    println!("🧠 Merchant Patterns");
    println!(
        "   {:>4}  {:<30}  {:<14}  {:>5}  {:>5}  {:<7}  LAST USED",
        "ID", "PATTERN", "CATEGORY", "CONF", "HITS", "SOURCE"
    );
    println!("   {}", "─".repeat(90));

    for p in &patterns {
        println!(
            "   {:>4}  {:<30}  {:<14}  {:>5.2}  {:>5}  {:<7}  {}",
            p.id,
            truncate(&p.pattern, 30),
            truncate(&category_label(&names, Some(p.category_id)), 14),
            p.confidence,
            p.usage_count,
            p.source.as_str(),
            p.last_used_at
                .map(|t| t.format("%Y-%m-%d").to_string())
                .unwrap_or_else(|| "never".to_string())
        );
    }

    Ok(())
}

pub fn cmd_patterns_similar(pipeline: &Pipeline, org: i64, merchant: &str, threshold: f64) -> Result<()> {
    if !(0.0..=1.0).contains(&threshold) {
        anyhow::bail!("Threshold must be between 0 and 1");
    }

    let similar = pipeline
        .patterns()
        .get_similar_patterns(org, merchant, threshold)?;

    if similar.is_empty() {
        println!("No cached patterns within {:.2} of '{}'.", threshold, merchant);
        return Ok(());
    }

    let names = category_names(pipeline.db(), org)?;

    println!();
    println!("🔎 Patterns similar to '{}'", merchant);
    for s in &similar {
        println!(
            "   {:<30}  {:<14}  similarity {:.2}  score {:.2}  ({})",
            truncate(&s.pattern.pattern, 30),
            truncate(&category_label(&names, Some(s.pattern.category_id)), 14),
            s.similarity,
            s.score,
            s.pattern.source.as_str()
        );
    }

    Ok(())
}

pub fn cmd_patterns_clear(pipeline: &Pipeline, org: i64, yes: bool) -> Result<()> {
    if !yes {
        print!(
            "⚠️  This removes every cached merchant pattern for organization {}, including user corrections. Continue? [y/N] ",
            org
        );
        io::stdout().flush()?;

        let mut answer = String::new();
        io::stdin().read_line(&mut answer)?;
        if !matches!(answer.trim().to_lowercase().as_str(), "y" | "yes") {
            println!("Aborted.");
            return Ok(());
        }
    }

    let removed = pipeline.patterns().clear_cache(org)?;
    println!("✅ Removed {} cached patterns", removed);
    Ok(())
}
