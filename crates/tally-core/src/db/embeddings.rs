//! Transaction embedding storage

use rusqlite::{params, OptionalExtension};

use super::Database;
use crate::error::Result;
use crate::models::TransactionEmbedding;

/// A labeled embedding with the transaction text it came from
#[derive(Debug, Clone)]
pub struct LabeledEmbedding {
    pub transaction_id: i64,
    pub organization_id: i64,
    pub category_id: i64,
    pub embedding: Vec<f32>,
    pub description: String,
    pub merchant_name: Option<String>,
}

pub(crate) fn f32_vec_to_bytes(v: &[f32]) -> Vec<u8> {
    v.iter().flat_map(|f| f.to_le_bytes()).collect()
}

pub(crate) fn bytes_to_f32_vec(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

impl Database {
    /// Get the stored embedding for a transaction
    pub fn get_embedding(&self, transaction_id: i64) -> Result<Option<TransactionEmbedding>> {
        let conn = self.conn()?;
        let embedding = conn
            .query_row(
                r#"
                SELECT transaction_id, organization_id, embedding, embedding_model, text_hash, category_id
                FROM transaction_embeddings
                WHERE transaction_id = ?
                "#,
                params![transaction_id],
                |row| {
                    let blob: Vec<u8> = row.get(2)?;
                    Ok(TransactionEmbedding {
                        transaction_id: row.get(0)?,
                        organization_id: row.get(1)?,
                        embedding: bytes_to_f32_vec(&blob),
                        embedding_model: row.get(3)?,
                        text_hash: row.get(4)?,
                        category_id: row.get(5)?,
                    })
                },
            )
            .optional()?;
        Ok(embedding)
    }

    /// Insert or replace a transaction's embedding
    pub fn upsert_embedding(&self, embedding: &TransactionEmbedding) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            r#"
            INSERT INTO transaction_embeddings (
                transaction_id, organization_id, embedding, dimensions,
                embedding_model, text_hash, category_id
            ) VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(transaction_id) DO UPDATE SET
                embedding = excluded.embedding,
                dimensions = excluded.dimensions,
                embedding_model = excluded.embedding_model,
                text_hash = excluded.text_hash,
                category_id = excluded.category_id,
                updated_at = CURRENT_TIMESTAMP
            "#,
            params![
                embedding.transaction_id,
                embedding.organization_id,
                f32_vec_to_bytes(&embedding.embedding),
                embedding.embedding.len() as i64,
                embedding.embedding_model,
                embedding.text_hash,
                embedding.category_id,
            ],
        )?;
        Ok(())
    }

    /// Change the category label without re-embedding; returns rows touched
    pub fn set_embedding_label(&self, transaction_id: i64, category_id: Option<i64>) -> Result<usize> {
        let conn = self.conn()?;
        let updated = conn.execute(
            r#"
            UPDATE transaction_embeddings
            SET category_id = ?, updated_at = CURRENT_TIMESTAMP
            WHERE transaction_id = ?
            "#,
            params![category_id, transaction_id],
        )?;
        Ok(updated)
    }

    /// Labeled embeddings for one organization and model, excluding a transaction
    pub fn labeled_embeddings(
        &self,
        organization_id: i64,
        embedding_model: &str,
        dimensions: usize,
        exclude_transaction_id: i64,
    ) -> Result<Vec<LabeledEmbedding>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT e.transaction_id, e.organization_id, e.category_id, e.embedding,
                   t.description, t.merchant_name
            FROM transaction_embeddings e
            INNER JOIN transactions t ON t.id = e.transaction_id
            WHERE e.organization_id = ?
              AND t.organization_id = e.organization_id
              AND e.category_id IS NOT NULL
              AND e.embedding_model = ?
              AND e.dimensions = ?
              AND e.transaction_id != ?
            "#,
        )?;

        let rows = stmt
            .query_map(
                params![
                    organization_id,
                    embedding_model,
                    dimensions as i64,
                    exclude_transaction_id
                ],
                |row| {
                    let blob: Vec<u8> = row.get(3)?;
                    Ok(LabeledEmbedding {
                        transaction_id: row.get(0)?,
                        organization_id: row.get(1)?,
                        category_id: row.get(2)?,
                        embedding: bytes_to_f32_vec(&blob),
                        description: row.get(4)?,
                        merchant_name: row.get(5)?,
                    })
                },
            )?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(rows)
    }

    /// Number of stored embeddings (and labeled ones) for an organization
    pub fn embedding_counts(&self, organization_id: i64) -> Result<(i64, i64)> {
        let conn = self.conn()?;
        let counts = conn.query_row(
            r#"
            SELECT COUNT(*), COALESCE(SUM(CASE WHEN category_id IS NOT NULL THEN 1 ELSE 0 END), 0)
            FROM transaction_embeddings
            WHERE organization_id = ?
            "#,
            params![organization_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        Ok(counts)
    }
}
