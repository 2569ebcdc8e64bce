//! Rule command implementations

use anyhow::Result;
use tally_core::models::{NewCategoryRule, RuleType};
use tally_core::Pipeline;

use super::{category_label, category_names, resolve_category, truncate};
use crate::cli::RuleOptions;

/// Fields to change on an existing rule (None keeps the current value)
#[derive(Debug, Default)]
pub struct RuleChanges {
    pub category: Option<String>,
    pub pattern: Option<String>,
    pub rule_type: Option<String>,
    pub confidence: Option<f64>,
    pub priority: Option<i32>,
    pub case_sensitive: Option<bool>,
    pub is_regex: Option<bool>,
}

fn parse_rule_type(s: &str) -> Result<RuleType> {
    s.parse().map_err(|e: String| anyhow::anyhow!(e))
}

fn new_rule(
    pipeline: &Pipeline,
    org: i64,
    category: &str,
    pattern: &str,
    options: &RuleOptions,
) -> Result<NewCategoryRule> {
    let category = resolve_category(pipeline.db(), org, category)?;
    Ok(NewCategoryRule {
        organization_id: org,
        category_id: category.id,
        rule_type: parse_rule_type(&options.rule_type)?,
        pattern: pattern.to_string(),
        confidence: options.confidence,
        priority: options.priority,
        case_sensitive: options.case_sensitive,
        is_regex: options.regex,
    })
}

pub fn cmd_rules_list(pipeline: &Pipeline, org: i64) -> Result<()> {
    let rules = pipeline.rules().list_rules(org)?;

    if rules.is_empty() {
        println!("No rules defined. Add one with 'tally rules add <category> <pattern>'.");
        return Ok(());
    }

    let names = category_names(pipeline.db(), org)?;

    println!();
    println!("📏 Rules (evaluation order)");
    println!(
        "   {:>4}  {:>4}  {:<20}  {:<24}  {:<14}  {:>5}  {:>6}  {:>7}",
        "ID", "PRI", "TYPE", "PATTERN", "CATEGORY", "CONF", "USED", "SUCCESS"
    );
    println!("   {}", "─".repeat(98));

    for rule in &rules {
        let mut flags = String::new();
        if rule.is_regex {
            flags.push_str(" [re]");
        }
        if rule.case_sensitive {
            flags.push_str(" [cs]");
        }
        println!(
            "   {:>4}  {:>4}  {:<20}  {:<24}  {:<14}  {:>5.2}  {:>6}  {:>6.0}%{}",
            rule.id,
            rule.priority,
            rule.rule_type.as_str(),
            truncate(&rule.pattern, 24),
            truncate(&category_label(&names, Some(rule.category_id)), 14),
            rule.confidence,
            rule.usage_count,
            rule.success_rate * 100.0,
            flags
        );
    }

    Ok(())
}

pub fn cmd_rules_add(
    pipeline: &Pipeline,
    org: i64,
    category: &str,
    pattern: &str,
    options: &RuleOptions,
) -> Result<()> {
    let rule = new_rule(pipeline, org, category, pattern, options)?;
    let created = pipeline.rules().add_rule(&rule)?;

    println!(
        "✅ Created {} rule {} '{}' → {} (confidence {:.2}, priority {})",
        created.rule_type.as_str(),
        created.id,
        created.pattern,
        category,
        created.confidence,
        created.priority
    );
    Ok(())
}

pub fn cmd_rules_update(pipeline: &Pipeline, org: i64, id: i64, changes: RuleChanges) -> Result<()> {
    let db = pipeline.db();
    let existing = db
        .get_rule(id)?
        .filter(|r| r.organization_id == org)
        .ok_or_else(|| anyhow::anyhow!("Rule not found: {}", id))?;

    let category_id = match &changes.category {
        Some(category) => resolve_category(db, org, category)?.id,
        None => existing.category_id,
    };
    let rule_type = match &changes.rule_type {
        Some(rule_type) => parse_rule_type(rule_type)?,
        None => existing.rule_type,
    };

    let updated = pipeline.rules().update_rule(
        id,
        &NewCategoryRule {
            organization_id: org,
            category_id,
            rule_type,
            pattern: changes.pattern.unwrap_or(existing.pattern),
            confidence: changes.confidence.unwrap_or(existing.confidence),
            priority: changes.priority.unwrap_or(existing.priority),
            case_sensitive: changes.case_sensitive.unwrap_or(existing.case_sensitive),
            is_regex: changes.is_regex.unwrap_or(existing.is_regex),
        },
    )?;

    println!(
        "✅ Updated rule {}: {} '{}' (confidence {:.2}, priority {})",
        updated.id,
        updated.rule_type.as_str(),
        updated.pattern,
        updated.confidence,
        updated.priority
    );
    Ok(())
}

pub fn cmd_rules_delete(pipeline: &Pipeline, org: i64, id: i64) -> Result<()> {
    if pipeline.rules().delete_rule(org, id)? {
        println!("✅ Deleted rule {}", id);
        Ok(())
    } else {
        anyhow::bail!("Rule not found: {}", id)
    }
}

pub fn cmd_rules_test(
    pipeline: &Pipeline,
    org: i64,
    category: &str,
    pattern: &str,
    options: &RuleOptions,
    examples: usize,
) -> Result<()> {
    let rule = new_rule(pipeline, org, category, pattern, options)?;
    let result = pipeline.rules().test_rule(&rule, examples)?;

    println!();
    println!("🧪 Testing {} rule '{}' → {}", rule.rule_type.as_str(), pattern, category);
    println!("   Matched:   {} categorized transactions", result.matched);
    if result.matched == 0 {
        println!("   No categorized transactions match this pattern.");
        return Ok(());
    }
    println!("   Agreeing:  {}", result.agreeing);
    println!("   Accuracy:  {:.0}%", result.accuracy * 100.0);

    if !result.examples.is_empty() {
        let names = category_names(pipeline.db(), org)?;
        println!();
        println!("   Examples:");
        for tx in &result.examples {
            let mark = if tx.category_id == Some(rule.category_id) {
                "✓"
            } else {
                "✗"
            };
            println!(
                "     {} {:>5}  {:<30}  {}",
                mark,
                tx.id,
                truncate(tx.merchant_name.as_deref().unwrap_or(&tx.description), 30),
                category_label(&names, tx.category_id)
            );
        }
    }

    Ok(())
}
