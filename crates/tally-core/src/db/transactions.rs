//! Transaction operations

use chrono::NaiveDate;
use rusqlite::{params, Row};

use super::{parse_date, parse_datetime, Database};
use crate::error::Result;
use crate::models::{CategorizationResult, CategorizationStats, NewTransaction, Transaction};

const TRANSACTION_COLUMNS: &str = "id, organization_id, amount, description, merchant_name, date, category_id, categorization, created_at";

fn row_to_transaction(row: &Row) -> rusqlite::Result<Transaction> {
    let date_str: String = row.get(5)?;
    let metadata: Option<String> = row.get(7)?;
    let created_at_str: String = row.get(8)?;

    Ok(Transaction {
        id: row.get(0)?,
        organization_id: row.get(1)?,
        amount: row.get(2)?,
        description: row.get(3)?,
        merchant_name: row.get(4)?,
        date: parse_date(&date_str),
        category_id: row.get(6)?,
        categorization: metadata.and_then(|j| serde_json::from_str(&j).ok()),
        created_at: parse_datetime(&created_at_str),
    })
}

impl Database {
    /// Insert a transaction delivered by the sync layer
    pub fn insert_transaction(&self, tx: &NewTransaction) -> Result<i64> {
        let conn = self.conn()?;

        conn.execute(
            r#"
            INSERT INTO transactions (organization_id, amount, description, merchant_name, date)
            VALUES (?, ?, ?, ?, ?)
            "#,
            params![
                tx.organization_id,
                tx.amount,
                tx.description,
                tx.merchant_name,
                tx.date.format("%Y-%m-%d").to_string(),
            ],
        )?;

        Ok(conn.last_insert_rowid())
    }

    /// Get a transaction by ID
    pub fn get_transaction(&self, id: i64) -> Result<Option<Transaction>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM transactions WHERE id = ?",
            TRANSACTION_COLUMNS
        ))?;

        let mut rows = stmt.query_map(params![id], row_to_transaction)?;
        Ok(rows.next().transpose()?)
    }

    /// Get an organization's transactions by id (ids from other organizations are ignored)
    pub fn get_transactions_by_ids(&self, organization_id: i64, ids: &[i64]) -> Result<Vec<Transaction>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let conn = self.conn()?;
        let placeholders = vec!["?"; ids.len()].join(", ");
        let sql = format!(
            "SELECT {} FROM transactions WHERE organization_id = ? AND id IN ({}) ORDER BY date, id",
            TRANSACTION_COLUMNS, placeholders
        );

        let mut params_vec: Vec<&dyn rusqlite::ToSql> = vec![&organization_id];
        for id in ids {
            params_vec.push(id);
        }

        let mut stmt = conn.prepare(&sql)?;
        let transactions = stmt
            .query_map(params_vec.as_slice(), row_to_transaction)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(transactions)
    }

    /// List an organization's transactions, newest first
    pub fn list_transactions(&self, organization_id: i64, limit: i64, offset: i64) -> Result<Vec<Transaction>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            r#"
            SELECT {} FROM transactions
            WHERE organization_id = ?
            ORDER BY date DESC, id DESC
            LIMIT ? OFFSET ?
            "#,
            TRANSACTION_COLUMNS
        ))?;

        let transactions = stmt
            .query_map(params![organization_id, limit, offset], row_to_transaction)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(transactions)
    }

    /// List transactions in an inclusive date range
    pub fn list_transactions_in_range(
        &self,
        organization_id: i64,
        from: NaiveDate,
        to: NaiveDate,
        limit: i64,
    ) -> Result<Vec<Transaction>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            r#"
            SELECT {} FROM transactions
            WHERE organization_id = ? AND date >= ? AND date <= ?
            ORDER BY date, id
            LIMIT ?
            "#,
            TRANSACTION_COLUMNS
        ))?;

        let transactions = stmt
            .query_map(
                params![
                    organization_id,
                    from.format("%Y-%m-%d").to_string(),
                    to.format("%Y-%m-%d").to_string(),
                    limit
                ],
                row_to_transaction,
            )?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(transactions)
    }

    /// List transactions with no category, oldest first
    pub fn list_uncategorized(&self, organization_id: i64, limit: i64) -> Result<Vec<Transaction>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            r#"
            SELECT {} FROM transactions
            WHERE organization_id = ? AND category_id IS NULL
            ORDER BY date, id
            LIMIT ?
            "#,
            TRANSACTION_COLUMNS
        ))?;

        let transactions = stmt
            .query_map(params![organization_id, limit], row_to_transaction)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(transactions)
    }

    /// List categorized transactions dated on or after `since`
    pub fn list_categorized_since(&self, organization_id: i64, since: NaiveDate) -> Result<Vec<Transaction>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            r#"
            SELECT {} FROM transactions
            WHERE organization_id = ? AND category_id IS NOT NULL AND date >= ?
            ORDER BY date, id
            "#,
            TRANSACTION_COLUMNS
        ))?;

        let transactions = stmt
            .query_map(
                params![organization_id, since.format("%Y-%m-%d").to_string()],
                row_to_transaction,
            )?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(transactions)
    }

    /// Categorized transactions, newest first
    pub fn list_categorized(&self, organization_id: i64, limit: i64) -> Result<Vec<Transaction>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            r#"
            SELECT {} FROM transactions
            WHERE organization_id = ? AND category_id IS NOT NULL
            ORDER BY date DESC, id DESC
            LIMIT ?
            "#,
            TRANSACTION_COLUMNS
        ))?;

        let transactions = stmt
            .query_map(params![organization_id, limit], row_to_transaction)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(transactions)
    }

    /// Store a categorization attempt; the category is only written when applied
    pub fn save_categorization(&self, result: &CategorizationResult) -> Result<()> {
        let conn = self.conn()?;
        let metadata = serde_json::to_string(result)?;

        if result.applied {
            conn.execute(
                r#"
                UPDATE transactions
                SET category_id = ?, categorization = ?, updated_at = CURRENT_TIMESTAMP
                WHERE id = ?
                "#,
                params![result.category_id, metadata, result.transaction_id],
            )?;
        } else {
            conn.execute(
                r#"
                UPDATE transactions
                SET categorization = ?, updated_at = CURRENT_TIMESTAMP
                WHERE id = ?
                "#,
                params![metadata, result.transaction_id],
            )?;
        }

        Ok(())
    }

    /// Set a transaction's category directly (user action), optionally replacing metadata
    pub fn set_transaction_category(
        &self,
        transaction_id: i64,
        category_id: Option<i64>,
        metadata: Option<&CategorizationResult>,
    ) -> Result<()> {
        let conn = self.conn()?;

        match metadata {
            Some(result) => {
                let json = serde_json::to_string(result)?;
                conn.execute(
                    r#"
                    UPDATE transactions
                    SET category_id = ?, categorization = ?, updated_at = CURRENT_TIMESTAMP
                    WHERE id = ?
                    "#,
                    params![category_id, json, transaction_id],
                )?;
            }
            None => {
                conn.execute(
                    "UPDATE transactions SET category_id = ?, updated_at = CURRENT_TIMESTAMP WHERE id = ?",
                    params![category_id, transaction_id],
                )?;
            }
        }

        Ok(())
    }

    /// Categorization counts for an organization
    pub fn categorization_stats(&self, organization_id: i64) -> Result<CategorizationStats> {
        let conn = self.conn()?;

        let (total, categorized): (i64, i64) = conn.query_row(
            r#"
            SELECT COUNT(*), COALESCE(SUM(CASE WHEN category_id IS NOT NULL THEN 1 ELSE 0 END), 0)
            FROM transactions WHERE organization_id = ?
            "#,
            params![organization_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;

        let mut stmt = conn.prepare(
            r#"
            SELECT json_extract(categorization, '$.method') AS method, COUNT(*)
            FROM transactions
            WHERE organization_id = ? AND categorization IS NOT NULL
              AND json_extract(categorization, '$.method') IS NOT NULL
            GROUP BY method
            ORDER BY COUNT(*) DESC
            "#,
        )?;
        let by_method = stmt
            .query_map(params![organization_id], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let avg_confidence: Option<f64> = conn.query_row(
            r#"
            SELECT AVG(json_extract(categorization, '$.confidence'))
            FROM transactions
            WHERE organization_id = ? AND category_id IS NOT NULL AND categorization IS NOT NULL
            "#,
            params![organization_id],
            |row| row.get(0),
        )?;

        let user_corrected: i64 = conn.query_row(
            r#"
            SELECT COUNT(*) FROM transactions
            WHERE organization_id = ? AND json_extract(categorization, '$.user_corrected') = 1
            "#,
            params![organization_id],
            |row| row.get(0),
        )?;

        Ok(CategorizationStats {
            total_transactions: total,
            categorized,
            uncategorized: total - categorized,
            by_method,
            avg_confidence,
            user_corrected,
        })
    }
}
