//! Category rule operations

use rusqlite::{params, OptionalExtension, Row};

use super::{parse_datetime, Database};
use crate::error::{Error, Result};
use crate::models::{CategoryRule, NewCategoryRule, RuleType};

const RULE_COLUMNS: &str = "id, organization_id, category_id, rule_type, pattern, confidence, priority, case_sensitive, is_regex, usage_count, correction_count, success_rate, created_at, last_used_at";

fn row_to_rule(row: &Row) -> rusqlite::Result<CategoryRule> {
    let rule_type_str: String = row.get(3)?;
    let created_at_str: String = row.get(12)?;
    let last_used_str: Option<String> = row.get(13)?;

    Ok(CategoryRule {
        id: row.get(0)?,
        organization_id: row.get(1)?,
        category_id: row.get(2)?,
        rule_type: rule_type_str.parse().unwrap_or(RuleType::DescriptionKeyword),
        pattern: row.get(4)?,
        confidence: row.get(5)?,
        priority: row.get(6)?,
        case_sensitive: row.get(7)?,
        is_regex: row.get(8)?,
        usage_count: row.get(9)?,
        correction_count: row.get(10)?,
        success_rate: row.get(11)?,
        created_at: parse_datetime(&created_at_str),
        last_used_at: last_used_str.map(|s| parse_datetime(&s)),
    })
}

impl Database {
    /// Create a category rule (callers validate first)
    pub fn create_rule(&self, rule: &NewCategoryRule) -> Result<i64> {
        let conn = self.conn()?;

        conn.execute(
            r#"
            INSERT INTO category_rules (
                organization_id, category_id, rule_type, pattern, confidence,
                priority, case_sensitive, is_regex
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
            params![
                rule.organization_id,
                rule.category_id,
                rule.rule_type.as_str(),
                rule.pattern,
                rule.confidence,
                rule.priority,
                rule.case_sensitive,
                rule.is_regex,
            ],
        )?;

        Ok(conn.last_insert_rowid())
    }

    /// Replace a rule's user-editable fields (statistics are kept)
    pub fn update_rule(&self, id: i64, rule: &NewCategoryRule) -> Result<()> {
        let conn = self.conn()?;

        let updated = conn.execute(
            r#"
            UPDATE category_rules
            SET category_id = ?, rule_type = ?, pattern = ?, confidence = ?,
                priority = ?, case_sensitive = ?, is_regex = ?
            WHERE id = ? AND organization_id = ?
            "#,
            params![
                rule.category_id,
                rule.rule_type.as_str(),
                rule.pattern,
                rule.confidence,
                rule.priority,
                rule.case_sensitive,
                rule.is_regex,
                id,
                rule.organization_id,
            ],
        )?;

        if updated == 0 {
            return Err(Error::NotFound(format!("Rule {}", id)));
        }
        Ok(())
    }

    /// Delete a rule; returns false if it did not exist
    pub fn delete_rule(&self, organization_id: i64, id: i64) -> Result<bool> {
        let conn = self.conn()?;
        let deleted = conn.execute(
            "DELETE FROM category_rules WHERE id = ? AND organization_id = ?",
            params![id, organization_id],
        )?;
        Ok(deleted > 0)
    }

    /// Get a rule by ID
    pub fn get_rule(&self, id: i64) -> Result<Option<CategoryRule>> {
        let conn = self.conn()?;
        let rule = conn
            .query_row(
                &format!("SELECT {} FROM category_rules WHERE id = ?", RULE_COLUMNS),
                params![id],
                row_to_rule,
            )
            .optional()?;
        Ok(rule)
    }

    /// List an organization's rules in evaluation order
    pub fn list_rules(&self, organization_id: i64) -> Result<Vec<CategoryRule>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            r#"
            SELECT {} FROM category_rules
            WHERE organization_id = ?
            ORDER BY priority DESC, id ASC
            "#,
            RULE_COLUMNS
        ))?;

        let rules = stmt
            .query_map(params![organization_id], row_to_rule)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(rules)
    }

    /// Count a rule match
    pub fn record_rule_usage(&self, rule_id: i64) -> Result<()> {
        let conn = self.conn()?;
        // success_rate = (uses - corrections) / uses, floored at 0. A correction
        // can land before its match is counted, so the denominator is at least
        // the correction count.
        conn.execute(
            r#"
            UPDATE category_rules
            SET usage_count = usage_count + 1,
                last_used_at = CURRENT_TIMESTAMP,
                success_rate = CASE
                    WHEN MAX(usage_count + 1, correction_count) = 0 THEN 1.0
                    ELSE MAX(0.0, CAST(usage_count + 1 - correction_count AS REAL)
                                  / MAX(usage_count + 1, correction_count))
                END
            WHERE id = ?
            "#,
            params![rule_id],
        )?;
        Ok(())
    }

    /// Count a user correction against a rule's decision
    pub fn record_rule_correction(&self, rule_id: i64) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            r#"
            UPDATE category_rules
            SET correction_count = correction_count + 1,
                success_rate = CASE
                    WHEN MAX(usage_count, correction_count + 1) = 0 THEN 1.0
                    ELSE MAX(0.0, CAST(usage_count - correction_count - 1 AS REAL)
                                  / MAX(usage_count, correction_count + 1))
                END
            WHERE id = ?
            "#,
            params![rule_id],
        )?;
        Ok(())
    }
}
