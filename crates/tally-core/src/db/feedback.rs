//! Categorization feedback and learning-run operations

use rusqlite::{params, Row};

use super::{parse_datetime, Database};
use crate::error::Result;
use crate::models::{
    CategorizationFeedback, CategorizationMethod, CommonCorrection, FeedbackType, LearningRun,
    MethodAccuracy, ProblematicMerchant,
};

const FEEDBACK_COLUMNS: &str = "id, transaction_id, organization_id, user_id, old_category_id, new_category_id, feedback_type, confidence_before, method_used, created_at";

fn row_to_feedback(row: &Row) -> rusqlite::Result<CategorizationFeedback> {
    let feedback_type_str: String = row.get(6)?;
    let method_str: Option<String> = row.get(8)?;
    let created_at_str: String = row.get(9)?;

    Ok(CategorizationFeedback {
        id: row.get(0)?,
        transaction_id: row.get(1)?,
        organization_id: row.get(2)?,
        user_id: row.get(3)?,
        old_category_id: row.get(4)?,
        new_category_id: row.get(5)?,
        feedback_type: feedback_type_str
            .parse()
            .unwrap_or(FeedbackType::Confirmation),
        confidence_before: row.get(7)?,
        method_used: method_str.and_then(|m| m.parse().ok()),
        created_at: parse_datetime(&created_at_str),
    })
}

/// Feedback row ready to be appended
#[derive(Debug, Clone)]
pub struct FeedbackRow<'a> {
    pub transaction_id: i64,
    pub organization_id: i64,
    pub user_id: &'a str,
    pub old_category_id: Option<i64>,
    pub new_category_id: Option<i64>,
    pub feedback_type: FeedbackType,
    pub confidence_before: Option<f64>,
    pub method_used: Option<CategorizationMethod>,
    pub merchant_key: Option<&'a str>,
}

impl Database {
    /// Append a feedback event
    pub fn insert_feedback(&self, feedback: &FeedbackRow<'_>) -> Result<i64> {
        let conn = self.conn()?;

        conn.execute(
            r#"
            INSERT INTO categorization_feedback (
                transaction_id, organization_id, user_id, old_category_id, new_category_id,
                feedback_type, confidence_before, method_used, merchant_key
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
            params![
                feedback.transaction_id,
                feedback.organization_id,
                feedback.user_id,
                feedback.old_category_id,
                feedback.new_category_id,
                feedback.feedback_type.as_str(),
                feedback.confidence_before,
                feedback.method_used.map(|m| m.as_str()),
                feedback.merchant_key,
            ],
        )?;

        Ok(conn.last_insert_rowid())
    }

    /// List an organization's feedback, newest first
    pub fn list_feedback(&self, organization_id: i64, limit: i64, offset: i64) -> Result<Vec<CategorizationFeedback>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            r#"
            SELECT {} FROM categorization_feedback
            WHERE organization_id = ?
            ORDER BY id DESC
            LIMIT ? OFFSET ?
            "#,
            FEEDBACK_COLUMNS
        ))?;

        let feedback = stmt
            .query_map(params![organization_id, limit, offset], row_to_feedback)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(feedback)
    }

    /// Feedback recorded for one transaction, oldest first
    pub fn feedback_for_transaction(&self, transaction_id: i64) -> Result<Vec<CategorizationFeedback>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM categorization_feedback WHERE transaction_id = ? ORDER BY id",
            FEEDBACK_COLUMNS
        ))?;

        let feedback = stmt
            .query_map(params![transaction_id], row_to_feedback)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(feedback)
    }

    /// Feedback with id greater than `after_id`, oldest first
    pub fn feedback_since(&self, organization_id: i64, after_id: i64) -> Result<Vec<CategorizationFeedback>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            r#"
            SELECT {} FROM categorization_feedback
            WHERE organization_id = ? AND id > ?
            ORDER BY id
            "#,
            FEEDBACK_COLUMNS
        ))?;

        let feedback = stmt
            .query_map(params![organization_id, after_id], row_to_feedback)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(feedback)
    }

    /// Number of feedback events with id greater than `after_id`
    pub fn count_feedback_since(&self, organization_id: i64, after_id: i64) -> Result<i64> {
        let conn = self.conn()?;
        let count = conn.query_row(
            "SELECT COUNT(*) FROM categorization_feedback WHERE organization_id = ? AND id > ?",
            params![organization_id, after_id],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// High-water mark of the most recent learning pass (0 if none)
    pub fn last_learning_high_water(&self, organization_id: i64) -> Result<i64> {
        let conn = self.conn()?;
        let high_water = conn.query_row(
            "SELECT COALESCE(MAX(feedback_high_water), 0) FROM learning_runs WHERE organization_id = ?",
            params![organization_id],
            |row| row.get(0),
        )?;
        Ok(high_water)
    }

    /// Record a completed learning pass
    pub fn insert_learning_run(&self, run: &LearningRun) -> Result<i64> {
        let conn = self.conn()?;
        conn.execute(
            r#"
            INSERT INTO learning_runs (organization_id, feedback_high_water, patterns_mined, embeddings_relabeled)
            VALUES (?, ?, ?, ?)
            "#,
            params![
                run.organization_id,
                run.feedback_high_water,
                run.patterns_mined,
                run.embeddings_relabeled
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Feedback totals: (total, corrections, confirmations, rejections)
    pub fn feedback_type_counts(&self, organization_id: i64) -> Result<(i64, i64, i64, i64)> {
        let conn = self.conn()?;
        let counts = conn.query_row(
            r#"
            SELECT COUNT(*),
                   COALESCE(SUM(CASE WHEN feedback_type = 'correction' THEN 1 ELSE 0 END), 0),
                   COALESCE(SUM(CASE WHEN feedback_type = 'confirmation' THEN 1 ELSE 0 END), 0),
                   COALESCE(SUM(CASE WHEN feedback_type = 'rejection' THEN 1 ELSE 0 END), 0)
            FROM categorization_feedback
            WHERE organization_id = ?
            "#,
            params![organization_id],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
        )?;
        Ok(counts)
    }

    /// Per-method feedback totals; corrections and rejections count against accuracy
    pub fn method_accuracy(&self, organization_id: i64) -> Result<Vec<MethodAccuracy>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT method_used,
                   COUNT(*),
                   SUM(CASE WHEN feedback_type IN ('correction', 'rejection') THEN 1 ELSE 0 END)
            FROM categorization_feedback
            WHERE organization_id = ? AND method_used IS NOT NULL
            GROUP BY method_used
            ORDER BY method_used
            "#,
        )?;

        let rows = stmt
            .query_map(params![organization_id], |row| {
                let total: i64 = row.get(1)?;
                let corrections: i64 = row.get(2)?;
                Ok(MethodAccuracy {
                    method: row.get(0)?,
                    total,
                    corrections,
                    accuracy: if total > 0 {
                        (total - corrections) as f64 / total as f64
                    } else {
                        0.0
                    },
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(rows)
    }

    /// Most frequent (old → new) corrections
    pub fn common_corrections(&self, organization_id: i64, limit: i64) -> Result<Vec<CommonCorrection>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT f.old_category_id, oc.name, f.new_category_id, nc.name,
                   COUNT(*) AS cnt, AVG(f.confidence_before)
            FROM categorization_feedback f
            LEFT JOIN categories oc ON oc.id = f.old_category_id
            INNER JOIN categories nc ON nc.id = f.new_category_id
            WHERE f.organization_id = ? AND f.feedback_type = 'correction'
            GROUP BY f.old_category_id, f.new_category_id
            ORDER BY cnt DESC, f.new_category_id
            LIMIT ?
            "#,
        )?;

        let rows = stmt
            .query_map(params![organization_id, limit], |row| {
                Ok(CommonCorrection {
                    from_category_id: row.get(0)?,
                    from_category: row.get(1)?,
                    to_category_id: row.get(2)?,
                    to_category: row.get(3)?,
                    count: row.get(4)?,
                    avg_confidence: row.get(5)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(rows)
    }

    /// Merchants with the most corrections and rejections
    pub fn problematic_merchants(&self, organization_id: i64, limit: i64) -> Result<Vec<ProblematicMerchant>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT merchant_key, COUNT(*) AS cnt
            FROM categorization_feedback
            WHERE organization_id = ?
              AND feedback_type IN ('correction', 'rejection')
              AND merchant_key IS NOT NULL AND merchant_key != ''
            GROUP BY merchant_key
            HAVING cnt > 1
            ORDER BY cnt DESC, merchant_key
            LIMIT ?
            "#,
        )?;

        let rows = stmt
            .query_map(params![organization_id, limit], |row| {
                Ok(ProblematicMerchant {
                    merchant: row.get(0)?,
                    corrections: row.get(1)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(rows)
    }
}
