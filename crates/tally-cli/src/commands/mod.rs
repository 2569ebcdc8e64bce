//! CLI command implementations
//!
//! Commands are organized by domain:
//! - `core` - Core commands (init, stats, status, prompts) and shared utilities (open_db, build_pipeline)
//! - `budget` - Spend ceilings and alerts
//! - `categories` - Category and transaction listing/entry
//! - `categorize` - Cascade runs (one, batch, estimate, similar, embed)
//! - `feedback` - Feedback recording, analysis and learning passes
//! - `patterns` - Merchant pattern cache inspection
//! - `rules` - Rule management commands

pub mod budget;
pub mod categories;
pub mod categorize;
pub mod core;
pub mod feedback;
pub mod patterns;
pub mod rules;

// Re-export command functions for main.rs
pub use budget::*;
pub use categories::*;
pub use categorize::*;
pub use self::core::*;
pub use feedback::*;
pub use patterns::*;
pub use rules::*;

use std::collections::HashMap;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use tally_core::db::Database;
use tally_core::models::Category;

/// Truncate a string to a maximum length, adding "..." if truncated
pub fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}

/// Parse a YYYY-MM-DD argument
pub fn parse_date(s: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .with_context(|| format!("Invalid date '{}' (expected YYYY-MM-DD)", s))
}

/// Resolve a category argument given as an ID or a name
pub fn resolve_category(db: &Database, org: i64, name_or_id: &str) -> Result<Category> {
    if let Ok(id) = name_or_id.parse::<i64>() {
        if let Some(category) = db.get_category(id)?.filter(|c| c.organization_id == org) {
            return Ok(category);
        }
    }

    db.find_category_by_name(org, name_or_id)?
        .ok_or_else(|| anyhow::anyhow!("Category not found: {}", name_or_id))
}

/// Category id → name, for display
pub fn category_names(db: &Database, org: i64) -> Result<HashMap<i64, String>> {
    Ok(db
        .list_categories(org)?
        .into_iter()
        .map(|c| (c.id, c.name))
        .collect())
}

fn category_label(names: &HashMap<i64, String>, id: Option<i64>) -> String {
    match id {
        Some(id) => names
            .get(&id)
            .cloned()
            .unwrap_or_else(|| format!("#{}", id)),
        None => "-".to_string(),
    }
}
