//! Merchant pattern cache operations

use rusqlite::{params, Row};

use super::{parse_datetime, Database};
use crate::error::Result;
use crate::models::{MerchantPattern, PatternSource};

const PATTERN_COLUMNS: &str = "id, organization_id, merchant_pattern, category_id, confidence, usage_count, source, last_used_at, created_at";

fn row_to_pattern(row: &Row) -> rusqlite::Result<MerchantPattern> {
    let source_str: String = row.get(6)?;
    let last_used_str: Option<String> = row.get(7)?;
    let created_at_str: String = row.get(8)?;

    Ok(MerchantPattern {
        id: row.get(0)?,
        organization_id: row.get(1)?,
        pattern: row.get(2)?,
        category_id: row.get(3)?,
        confidence: row.get(4)?,
        usage_count: row.get(5)?,
        source: source_str.parse().unwrap_or(PatternSource::Learned),
        last_used_at: last_used_str.map(|s| parse_datetime(&s)),
        created_at: parse_datetime(&created_at_str),
    })
}

impl Database {
    /// All cache entries for an organization
    pub fn list_merchant_patterns(&self, organization_id: i64) -> Result<Vec<MerchantPattern>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            r#"
            SELECT {} FROM merchant_patterns
            WHERE organization_id = ?
            ORDER BY merchant_pattern, confidence DESC, id
            "#,
            PATTERN_COLUMNS
        ))?;

        let patterns = stmt
            .query_map(params![organization_id], row_to_pattern)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(patterns)
    }

    /// Whether a user correction or confirmation has touched this merchant
    pub fn has_user_pattern(&self, organization_id: i64, merchant_pattern: &str) -> Result<bool> {
        let conn = self.conn()?;
        let count: i64 = conn.query_row(
            r#"
            SELECT COUNT(*) FROM merchant_patterns
            WHERE organization_id = ? AND merchant_pattern = ? AND source = 'user'
            "#,
            params![organization_id, merchant_pattern],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Upsert a learned mapping: bump usage and keep the higher confidence
    pub fn learn_merchant_pattern(
        &self,
        organization_id: i64,
        merchant_pattern: &str,
        category_id: i64,
        confidence: f64,
        source: PatternSource,
    ) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            r#"
            INSERT INTO merchant_patterns (
                organization_id, merchant_pattern, category_id, confidence,
                usage_count, source, last_used_at
            ) VALUES (?, ?, ?, ?, 1, ?, CURRENT_TIMESTAMP)
            ON CONFLICT(organization_id, merchant_pattern, category_id) DO UPDATE SET
                confidence = MAX(merchant_patterns.confidence, excluded.confidence),
                usage_count = merchant_patterns.usage_count + 1,
                source = CASE WHEN excluded.source = 'user' THEN 'user' ELSE merchant_patterns.source END,
                last_used_at = CURRENT_TIMESTAMP,
                updated_at = CURRENT_TIMESTAMP
            "#,
            params![
                organization_id,
                merchant_pattern,
                category_id,
                confidence,
                source.as_str()
            ],
        )?;
        Ok(())
    }

    /// Move a mapping's confidence `rate` of the way towards 1.0, creating it
    /// at `initial_confidence` if absent. Marks the entry user-sourced.
    pub fn reinforce_merchant_pattern(
        &self,
        organization_id: i64,
        merchant_pattern: &str,
        category_id: i64,
        rate: f64,
        initial_confidence: f64,
    ) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            r#"
            INSERT INTO merchant_patterns (
                organization_id, merchant_pattern, category_id, confidence,
                usage_count, source, last_used_at
            ) VALUES (?, ?, ?, ?, 1, 'user', CURRENT_TIMESTAMP)
            ON CONFLICT(organization_id, merchant_pattern, category_id) DO UPDATE SET
                confidence = MIN(1.0, merchant_patterns.confidence + (1.0 - merchant_patterns.confidence) * ?),
                usage_count = merchant_patterns.usage_count + 1,
                source = 'user',
                last_used_at = CURRENT_TIMESTAMP,
                updated_at = CURRENT_TIMESTAMP
            "#,
            params![
                organization_id,
                merchant_pattern,
                category_id,
                initial_confidence,
                rate
            ],
        )?;
        Ok(())
    }

    /// Multiply a mapping's confidence by (1 - penalty); returns rows touched
    pub fn demote_merchant_pattern(
        &self,
        organization_id: i64,
        merchant_pattern: &str,
        category_id: i64,
        penalty: f64,
    ) -> Result<usize> {
        let conn = self.conn()?;
        let updated = conn.execute(
            r#"
            UPDATE merchant_patterns
            SET confidence = confidence * (1.0 - ?), updated_at = CURRENT_TIMESTAMP
            WHERE organization_id = ? AND merchant_pattern = ? AND category_id = ?
            "#,
            params![penalty, organization_id, merchant_pattern, category_id],
        )?;
        Ok(updated)
    }

    /// Count a cache hit
    pub fn record_pattern_hit(&self, pattern_id: i64) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            r#"
            UPDATE merchant_patterns
            SET usage_count = usage_count + 1, last_used_at = CURRENT_TIMESTAMP
            WHERE id = ?
            "#,
            params![pattern_id],
        )?;
        Ok(())
    }

    /// Delete every cache entry for an organization
    pub fn clear_merchant_patterns(&self, organization_id: i64) -> Result<usize> {
        let conn = self.conn()?;
        let deleted = conn.execute(
            "DELETE FROM merchant_patterns WHERE organization_id = ?",
            params![organization_id],
        )?;
        Ok(deleted)
    }

    /// Cache statistics: (entries, user-sourced entries, total usage)
    pub fn merchant_pattern_stats(&self, organization_id: i64) -> Result<(i64, i64, i64)> {
        let conn = self.conn()?;
        let stats = conn.query_row(
            r#"
            SELECT COUNT(*),
                   COALESCE(SUM(CASE WHEN source = 'user' THEN 1 ELSE 0 END), 0),
                   COALESCE(SUM(usage_count), 0)
            FROM merchant_patterns
            WHERE organization_id = ?
            "#,
            params![organization_id],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )?;
        Ok(stats)
    }
}
