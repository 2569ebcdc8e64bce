//! Retrieval-augmented categorization
//!
//! Each transaction is embedded once (re-embedded only when its text or
//! the embedding model changes). A category is inferred from a
//! similarity-weighted vote among the organization's k nearest labeled
//! neighbors. Neighbors never cross the tenant boundary.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use super::{Evidence, ScoredResult, Stage, StageKind};
use crate::ai::Embedder;
use crate::config::RagSettings;
use crate::db::Database;
use crate::error::Result;
use crate::models::{SimilarityMatch, Transaction, TransactionEmbedding};

/// Text that represents a transaction for embedding
pub fn embedding_text(tx: &Transaction) -> String {
    match tx.merchant_name.as_deref().map(str::trim).filter(|m| !m.is_empty()) {
        Some(merchant) => format!("{} {}", merchant, tx.description.trim()),
        None => tx.description.trim().to_string(),
    }
}

fn text_hash(text: &str) -> String {
    hex::encode(Sha256::digest(text.as_bytes()))
}

/// Cosine similarity; 0 for mismatched or zero-length vectors
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let (mut dot, mut norm_a, mut norm_b) = (0.0f64, 0.0f64, 0.0f64);
    for (x, y) in a.iter().zip(b) {
        let (x, y) = (f64::from(*x), f64::from(*y));
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

/// Retrieval verdict for one transaction
#[derive(Debug, Clone, PartialEq)]
pub struct RagOutcome {
    /// None when the vote did not clear its minimums
    pub category_id: Option<i64>,
    pub confidence: f64,
    /// Neighbors that took part in the vote, closest first
    pub matches: Vec<SimilarityMatch>,
}

#[derive(Clone)]
pub struct RagEngine {
    db: Database,
    embedder: Arc<dyn Embedder>,
    settings: RagSettings,
}

impl RagEngine {
    pub fn new(db: Database, embedder: Arc<dyn Embedder>, settings: RagSettings) -> Self {
        Self {
            db,
            embedder,
            settings,
        }
    }

    pub fn model_name(&self) -> &str {
        self.embedder.model_name()
    }

    pub fn settings(&self) -> &RagSettings {
        &self.settings
    }

    /// Stored vector for a transaction, computing it when missing or stale
    pub async fn ensure_embedding(&self, tx: &Transaction) -> Result<Vec<f32>> {
        let text = embedding_text(tx);
        let hash = text_hash(&text);
        let model = self.embedder.model_name().to_string();

        if let Some(existing) = self.db.get_embedding(tx.id)? {
            if existing.embedding_model == model && existing.text_hash == hash {
                return Ok(existing.embedding);
            }
            debug!(transaction_id = tx.id, "Embedding stale, recomputing");
        }

        let vector = self.embedder.embed(&text).await?;
        self.db.upsert_embedding(&TransactionEmbedding {
            transaction_id: tx.id,
            organization_id: tx.organization_id,
            embedding: vector.clone(),
            embedding_model: model,
            text_hash: hash,
            category_id: tx.category_id,
        })?;

        Ok(vector)
    }

    /// Labeled neighbors at or above `threshold`, closest first
    async fn neighbors(&self, tx: &Transaction, threshold: f64, limit: usize) -> Result<Vec<SimilarityMatch>> {
        let vector = self.ensure_embedding(tx).await?;
        let candidates = self.db.labeled_embeddings(
            tx.organization_id,
            self.embedder.model_name(),
            vector.len(),
            tx.id,
        )?;

        let mut matches: Vec<SimilarityMatch> = candidates
            .into_iter()
            .filter(|c| c.organization_id == tx.organization_id && c.transaction_id != tx.id)
            .filter_map(|c| {
                let sim = cosine_similarity(&vector, &c.embedding);
                (sim >= threshold).then(|| SimilarityMatch {
                    transaction_id: c.transaction_id,
                    category_id: c.category_id,
                    similarity: sim,
                    description: c.description,
                    merchant_name: c.merchant_name,
                })
            })
            .collect();

        matches.sort_by(|a, b| {
            b.similarity
                .partial_cmp(&a.similarity)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.transaction_id.cmp(&b.transaction_id))
        });
        matches.truncate(limit);
        Ok(matches)
    }

    /// Infer a category from the k nearest labeled neighbors
    pub async fn retrieve(&self, tx: &Transaction) -> Result<RagOutcome> {
        let matches = self
            .neighbors(tx, self.settings.min_neighbor_similarity, self.settings.top_k)
            .await?;

        let Some(top) = matches.first() else {
            debug!(transaction_id = tx.id, "No labeled neighbors");
            return Ok(RagOutcome {
                category_id: None,
                confidence: 0.0,
                matches,
            });
        };
        let top_similarity = top.similarity;

        let mut votes: HashMap<i64, f64> = HashMap::new();
        for m in &matches {
            *votes.entry(m.category_id).or_default() += m.similarity;
        }
        let total: f64 = votes.values().sum();
        let winner = votes.into_iter().max_by(|(ca, wa), (cb, wb)| {
            wa.partial_cmp(wb)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(cb.cmp(ca))
        });

        let (category_id, confidence) = match winner {
            Some((category_id, weight)) if total > 0.0 => {
                let share = weight / total;
                if share >= self.settings.min_vote_share
                    && top_similarity >= self.settings.min_top_similarity
                {
                    (Some(category_id), share * top_similarity)
                } else {
                    debug!(
                        transaction_id = tx.id,
                        share,
                        top_similarity,
                        "Neighbor vote inconclusive"
                    );
                    (None, 0.0)
                }
            }
            _ => (None, 0.0),
        };

        Ok(RagOutcome {
            category_id,
            confidence,
            matches,
        })
    }

    /// Similar labeled transactions for inspection or prompt hints
    pub async fn find_similar(
        &self,
        tx: &Transaction,
        threshold: f64,
        limit: usize,
    ) -> Result<Vec<SimilarityMatch>> {
        self.neighbors(tx, threshold, limit).await
    }

    /// Backfill embeddings; returns how many transactions now have one.
    /// Capability failures skip the transaction; storage failures abort.
    pub async fn update_embeddings(&self, transactions: &[Transaction]) -> Result<usize> {
        let mut embedded = 0;
        for tx in transactions {
            match self.ensure_embedding(tx).await {
                Ok(_) => {
                    // Keep the vote label in step with the current category
                    self.db.set_embedding_label(tx.id, tx.category_id)?;
                    embedded += 1;
                }
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => warn!(transaction_id = tx.id, error = %e, "Embedding failed"),
            }
        }
        Ok(embedded)
    }

    /// Change the vote label without re-embedding
    pub fn relabel(&self, transaction_id: i64, category_id: Option<i64>) -> Result<bool> {
        Ok(self.db.set_embedding_label(transaction_id, category_id)? > 0)
    }
}

#[async_trait]
impl Stage for RagEngine {
    fn kind(&self) -> StageKind {
        StageKind::Rag
    }

    async fn evaluate(&self, transaction: &Transaction) -> Result<ScoredResult> {
        let outcome = self.retrieve(transaction).await?;
        Ok(ScoredResult {
            category_id: outcome.category_id,
            confidence: outcome.confidence,
            evidence: Evidence::Similar(outcome.matches),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ai::MockBackend;
    use crate::models::NewTransaction;
    use chrono::NaiveDate;

    struct Fixture {
        db: Database,
        mock: Arc<MockBackend>,
        engine: RagEngine,
        travel: i64,
        dining: i64,
    }

    fn fixture(mock: MockBackend) -> Fixture {
        let db = Database::in_memory().unwrap();
        let travel = db.create_category(1, "Travel", None, None, None).unwrap();
        let dining = db.create_category(1, "Dining", None, None, None).unwrap();
        let mock = Arc::new(mock);
        let engine = RagEngine::new(db.clone(), mock.clone(), RagSettings::default());
        Fixture {
            db,
            mock,
            engine,
            travel,
            dining,
        }
    }

    fn insert(db: &Database, org: i64, merchant: &str, category: Option<i64>) -> Transaction {
        let id = db
            .insert_transaction(&NewTransaction {
                organization_id: org,
                amount: -300.0,
                description: "purchase".into(),
                merchant_name: Some(merchant.into()),
                date: NaiveDate::from_ymd_opt(2024, 4, 2).unwrap(),
            })
            .unwrap();
        if category.is_some() {
            db.set_transaction_category(id, category, None).unwrap();
        }
        db.get_transaction(id).unwrap().unwrap()
    }

    fn unit(x: f32, axis: usize) -> Vec<f32> {
        let mut v = vec![0.0; 3];
        v[0] = x;
        v[axis] = (1.0 - x * x).sqrt();
        v
    }

    #[test]
    fn test_cosine() {
        assert!((cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-9);
        assert_eq!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]), 0.0);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 0.0]), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
    }

    #[tokio::test]
    async fn test_cold_start_is_zero_confidence() {
        let f = fixture(MockBackend::new());
        let tx = insert(&f.db, 1, "NEW MERCHANT", None);

        let outcome = f.engine.retrieve(&tx).await.unwrap();
        assert_eq!(outcome.category_id, None);
        assert_eq!(outcome.confidence, 0.0);
        assert!(outcome.matches.is_empty());
        assert_eq!(f.mock.embed_calls(), 1);
    }

    #[tokio::test]
    async fn test_weighted_vote() {
        let f = fixture(
            MockBackend::new()
                .with_embedding("QUERY purchase", vec![1.0, 0.0, 0.0])
                .with_embedding("AIR ONE purchase", unit(0.81, 1))
                .with_embedding("AIR TWO purchase", unit(0.77, 2))
                .with_embedding("FAR CAFE purchase", vec![0.0, 1.0, 0.0]),
        );

        let history = vec![
            insert(&f.db, 1, "AIR ONE", Some(f.travel)),
            insert(&f.db, 1, "AIR TWO", Some(f.travel)),
            insert(&f.db, 1, "FAR CAFE", Some(f.dining)),
        ];
        assert_eq!(f.engine.update_embeddings(&history).await.unwrap(), 3);

        let query = insert(&f.db, 1, "QUERY", None);
        let outcome = f.engine.retrieve(&query).await.unwrap();

        assert_eq!(outcome.category_id, Some(f.travel));
        assert!((outcome.confidence - 0.81).abs() < 1e-4);
        // The orthogonal neighbor is below min_neighbor_similarity
        assert_eq!(outcome.matches.len(), 2);
        assert_eq!(outcome.matches[0].merchant_name.as_deref(), Some("AIR ONE"));
    }

    #[tokio::test]
    async fn test_split_vote_is_inconclusive() {
        let f = fixture(
            MockBackend::new()
                .with_embedding("QUERY purchase", vec![1.0, 0.0, 0.0])
                .with_embedding("AIR ONE purchase", unit(0.9, 1))
                .with_embedding("CAFE ONE purchase", unit(0.9, 2)),
        );
        let history = vec![
            insert(&f.db, 1, "AIR ONE", Some(f.travel)),
            insert(&f.db, 1, "CAFE ONE", Some(f.dining)),
        ];
        f.engine.update_embeddings(&history).await.unwrap();

        let query = insert(&f.db, 1, "QUERY", None);
        let outcome = f.engine.retrieve(&query).await.unwrap();
        assert_eq!(outcome.category_id, None);
        assert_eq!(outcome.confidence, 0.0);
        assert_eq!(outcome.matches.len(), 2);
    }

    #[tokio::test]
    async fn test_never_crosses_organizations() {
        let f = fixture(
            MockBackend::new()
                .with_embedding("QUERY purchase", vec![1.0, 0.0, 0.0])
                .with_embedding("OTHER ORG purchase", vec![1.0, 0.0, 0.0]),
        );
        let foreign_category = f.db.create_category(2, "Travel", None, None, None).unwrap();
        let foreign = insert(&f.db, 2, "OTHER ORG", Some(foreign_category));
        f.engine.update_embeddings(&[foreign]).await.unwrap();

        let query = insert(&f.db, 1, "QUERY", None);
        let outcome = f.engine.retrieve(&query).await.unwrap();
        assert!(outcome.matches.is_empty());
        assert_eq!(outcome.confidence, 0.0);
    }

    #[tokio::test]
    async fn test_find_similar_orders_and_filters() {
        let f = fixture(
            MockBackend::new()
                .with_embedding("QUERY purchase", vec![1.0, 0.0, 0.0])
                .with_embedding("AIR ONE purchase", unit(0.9, 1))
                .with_embedding("AIR TWO purchase", unit(0.6, 2))
                .with_embedding("CAFE purchase", unit(0.3, 1))
                .with_embedding("OTHER ORG purchase", vec![1.0, 0.0, 0.0]),
        );
        let foreign_category = f.db.create_category(2, "Travel", None, None, None).unwrap();
        let history = vec![
            insert(&f.db, 1, "AIR TWO", Some(f.travel)),
            insert(&f.db, 1, "CAFE", Some(f.dining)),
            insert(&f.db, 1, "AIR ONE", Some(f.travel)),
            insert(&f.db, 2, "OTHER ORG", Some(foreign_category)),
        ];
        f.engine.update_embeddings(&history).await.unwrap();
        let query = insert(&f.db, 1, "QUERY", None);

        let similar = f.engine.find_similar(&query, 0.5, 10).await.unwrap();
        let merchants: Vec<_> = similar.iter().map(|m| m.merchant_name.as_deref()).collect();
        assert_eq!(merchants, vec![Some("AIR ONE"), Some("AIR TWO")]);
        assert!((similar[0].similarity - 0.9).abs() < 1e-4);

        let all = f.engine.find_similar(&query, 0.0, 10).await.unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all[2].category_id, f.dining);

        let top = f.engine.find_similar(&query, 0.0, 1).await.unwrap();
        assert_eq!(top.len(), 1);
        assert_eq!(top[0].merchant_name.as_deref(), Some("AIR ONE"));
    }

    #[tokio::test]
    async fn test_model_change_reembeds_and_isolates_neighbors() {
        let vectors = || {
            MockBackend::new()
                .with_embedding("QUERY purchase", vec![1.0, 0.0, 0.0])
                .with_embedding("AIR ONE purchase", unit(0.9, 1))
        };
        let f = fixture(vectors().with_embedding_model("mock-a"));
        let history = insert(&f.db, 1, "AIR ONE", Some(f.travel));
        f.engine
            .update_embeddings(std::slice::from_ref(&history))
            .await
            .unwrap();
        assert_eq!(
            f.db.get_embedding(history.id).unwrap().unwrap().embedding_model,
            "mock-a"
        );

        let mock_b = Arc::new(vectors().with_embedding_model("mock-b"));
        let engine_b = RagEngine::new(f.db.clone(), mock_b.clone(), RagSettings::default());

        // Vectors from another model never vote
        let query = insert(&f.db, 1, "QUERY", None);
        let outcome = engine_b.retrieve(&query).await.unwrap();
        assert!(outcome.matches.is_empty());
        assert_eq!(outcome.category_id, None);

        // The stale row is rewritten under the new model, label intact
        engine_b.ensure_embedding(&history).await.unwrap();
        let stored = f.db.get_embedding(history.id).unwrap().unwrap();
        assert_eq!(stored.embedding_model, "mock-b");
        assert_eq!(stored.category_id, Some(f.travel));
        assert_eq!(mock_b.embed_calls(), 2);

        let outcome = engine_b.retrieve(&query).await.unwrap();
        assert_eq!(outcome.category_id, Some(f.travel));
        assert_eq!(mock_b.embed_calls(), 2);
    }

    #[tokio::test]
    async fn test_embedding_reused_and_relabeled() {
        let f = fixture(MockBackend::new());
        let tx = insert(&f.db, 1, "HOTEL RIO", None);

        f.engine.ensure_embedding(&tx).await.unwrap();
        f.engine.ensure_embedding(&tx).await.unwrap();
        assert_eq!(f.mock.embed_calls(), 1);

        assert!(f.engine.relabel(tx.id, Some(f.travel)).unwrap());
        assert_eq!(
            f.db.get_embedding(tx.id).unwrap().unwrap().category_id,
            Some(f.travel)
        );
        assert!(!f.engine.relabel(9999, Some(f.travel)).unwrap());
    }

    #[tokio::test]
    async fn test_embedder_failure_surfaces_as_error() {
        let f = fixture(MockBackend::new());
        f.mock.set_embeddings_failing(true);
        let tx = insert(&f.db, 1, "HOTEL RIO", None);

        let err = f.engine.retrieve(&tx).await.unwrap_err();
        assert!(!err.is_fatal());
        assert_eq!(f.engine.update_embeddings(&[tx]).await.unwrap(), 0);
    }
}
