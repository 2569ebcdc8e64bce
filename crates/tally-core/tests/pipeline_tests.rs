//! Integration tests for tally-core
//!
//! These tests drive the full cascade: rules → patterns → RAG → budget → LLM,
//! with feedback flowing back into the cheaper stages.

use std::sync::Arc;

use chrono::NaiveDate;
use tally_core::{
    categorize::{usage, CancelFlag, Pipeline},
    config::{CorrectedMerchantOrder, EngineConfig},
    db::Database,
    models::{
        BatchSelection, CategorizationMethod, FeedbackType, NewCategoryRule, NewFeedback, NewTransaction,
        RuleType, Transaction,
    },
    MockBackend,
};

const ORG: i64 = 1;

struct Harness {
    db: Database,
    mock: Arc<MockBackend>,
    pipeline: Pipeline,
}

fn harness_with(mock: MockBackend, config: EngineConfig) -> Harness {
    let db = Database::in_memory().expect("Failed to create in-memory database");
    db.seed_default_categories(ORG).unwrap();
    let mock = Arc::new(mock);
    let pipeline = Pipeline::builder(db.clone(), config)
        .embedder(mock.clone())
        .chat(mock.clone())
        .build()
        .unwrap();
    Harness { db, mock, pipeline }
}

fn harness() -> Harness {
    harness_with(MockBackend::new(), EngineConfig::default())
}

impl Harness {
    fn category(&self, name: &str) -> i64 {
        self.db.find_category_by_name(ORG, name).unwrap().unwrap().id
    }

    fn insert(&self, merchant: &str, description: &str, amount: f64) -> Transaction {
        let id = self
            .db
            .insert_transaction(&NewTransaction {
                organization_id: ORG,
                amount,
                description: description.to_string(),
                merchant_name: Some(merchant.to_string()),
                date: NaiveDate::from_ymd_opt(2024, 6, 15).unwrap(),
            })
            .unwrap();
        self.db.get_transaction(id).unwrap().unwrap()
    }

    fn rule(&self, pattern: &str, category: &str, confidence: f64, priority: i32) -> i64 {
        self.pipeline
            .rules()
            .add_rule(&NewCategoryRule {
                organization_id: ORG,
                category_id: self.category(category),
                rule_type: RuleType::MerchantPattern,
                pattern: pattern.to_string(),
                confidence,
                priority,
                case_sensitive: false,
                is_regex: false,
            })
            .unwrap()
            .id
    }
}

// =============================================================================
// Cascade
// =============================================================================

#[tokio::test]
async fn test_rule_short_circuits_cascade() {
    let h = harness();
    h.rule("STARBUCKS*", "Dining", 0.95, 100);
    let tx = h.insert("STARBUCKS #123", "COFFEE", -5.75);

    let result = h.pipeline.categorize(&tx).await.unwrap();

    assert_eq!(result.category_id, Some(h.category("Dining")));
    assert_eq!(result.confidence, 0.95);
    assert_eq!(result.method, Some(CategorizationMethod::RuleBased));
    assert!(result.applied);
    assert_eq!(result.trace.stages.len(), 1);
    assert_eq!(h.mock.embed_calls(), 0);
    assert_eq!(h.mock.chat_calls(), 0);
    assert!(h.db.get_embedding(tx.id).unwrap().is_none());

    let stored = h.db.get_transaction(tx.id).unwrap().unwrap();
    assert_eq!(stored.category_id, Some(h.category("Dining")));
    assert_eq!(stored.categorization.unwrap().method, Some(CategorizationMethod::RuleBased));
}

#[tokio::test]
async fn test_rag_resolves_unseen_merchant() {
    let query = [1.0f32, 0.0, 0.0];
    let near = [0.81f32, (1.0f32 - 0.81 * 0.81).sqrt(), 0.0];
    let nearer = [0.77f32, 0.0, (1.0f32 - 0.77 * 0.77).sqrt()];
    let mock = MockBackend::new()
        .with_embedding("SKYWARD AIR TICKET 0042", query.to_vec())
        .with_embedding("DELTA AIR LINES FARE", near.to_vec())
        .with_embedding("UNITED AIRLINES FARE", nearer.to_vec());
    let h = harness_with(mock, EngineConfig::default());

    let travel = h.category("Travel");
    for merchant in ["DELTA AIR LINES", "UNITED AIRLINES"] {
        let tx = h.insert(merchant, "FARE", -320.0);
        h.db.set_transaction_category(tx.id, Some(travel), None).unwrap();
    }
    assert_eq!(h.pipeline.backfill_embeddings(ORG, 100).await.unwrap(), 2);

    let tx = h.insert("SKYWARD AIR", "TICKET 0042", -410.0);
    let result = h.pipeline.categorize(&tx).await.unwrap();

    assert_eq!(result.category_id, Some(travel));
    assert_eq!(result.method, Some(CategorizationMethod::RagBased));
    assert!((result.confidence - 0.81).abs() < 1e-4);
    assert_eq!(result.trace.similarity_matches.len(), 2);
    assert_eq!(h.mock.chat_calls(), 0);

    // The new decision is now a labeled neighbor itself
    let embedding = h.db.get_embedding(tx.id).unwrap().unwrap();
    assert_eq!(embedding.category_id, Some(travel));
}

#[tokio::test]
async fn test_rule_decision_becomes_rag_neighbor() {
    let query = [1.0f32, 0.0, 0.0];
    let near = [0.9f32, (1.0f32 - 0.9 * 0.9).sqrt(), 0.0];
    let mock = MockBackend::new()
        .with_embedding("SKYWARD AIR TICKET 0042", query.to_vec())
        .with_embedding("DELTA AIR LINES FARE", near.to_vec());
    let mut config = EngineConfig::default();
    config.rag.embed_decided = true;
    let h = harness_with(mock, config);
    h.rule("DELTA*", "Travel", 0.95, 10);

    let decided = h.insert("DELTA AIR LINES", "FARE", -320.0);
    let result = h.pipeline.categorize(&decided).await.unwrap();
    assert_eq!(result.method, Some(CategorizationMethod::RuleBased));
    assert_eq!(h.mock.embed_calls(), 1);
    let embedding = h.db.get_embedding(decided.id).unwrap().unwrap();
    assert_eq!(embedding.category_id, Some(h.category("Travel")));

    let tx = h.insert("SKYWARD AIR", "TICKET 0042", -410.0);
    let result = h.pipeline.categorize(&tx).await.unwrap();
    assert_eq!(result.method, Some(CategorizationMethod::RagBased));
    assert_eq!(result.category_id, Some(h.category("Travel")));
    assert_eq!(result.trace.similarity_matches[0].transaction_id, decided.id);
    assert_eq!(h.mock.chat_calls(), 0);
}

#[tokio::test]
async fn test_cold_start_falls_through_to_llm() {
    let h = harness();
    let tx = h.insert("NETFLIX.COM", "STREAMING", -15.49);

    let result = h.pipeline.categorize(&tx).await.unwrap();

    assert_eq!(result.method, Some(CategorizationMethod::LlmBased));
    assert_eq!(result.category_id, Some(h.category("Subscriptions")));
    assert!(result.cost_estimate > 0.0);
    assert_eq!(result.trace.llm_model.as_deref(), Some("gpt-4o-mini"));
    let rag = result.trace.stages.iter().find(|s| s.stage == "rag").unwrap();
    assert_eq!(rag.confidence, 0.0);

    // Spend was reconciled against what the call actually cost
    let tracker = h.pipeline.budget().get_cost_tracker(ORG).unwrap();
    assert!((tracker.current_spend - result.cost_estimate).abs() < 1e-12);
    assert_eq!(tracker.transaction_count, 1);
    assert_eq!(h.db.list_llm_batches(ORG, 10).unwrap().len(), 1);

    // A confident LLM decision is cached for the pattern stage
    let second = h.insert("NETFLIX.COM", "STREAMING", -15.49);
    let result = h.pipeline.categorize(&second).await.unwrap();
    assert_eq!(result.method, Some(CategorizationMethod::PatternBased));
    assert_eq!(h.mock.chat_calls(), 1);
}

#[tokio::test]
async fn test_batch_sends_only_unresolved_to_llm() {
    let h = harness();
    h.rule("STARBUCKS*", "Dining", 0.95, 10);

    let batch = vec![
        h.insert("STARBUCKS #1", "COFFEE", -4.0),
        h.insert("UBER TRIP", "RIDE", -18.0),
        h.insert("STARBUCKS #2", "COFFEE", -6.0),
        h.insert("WHOLE FOODS", "GROCERY", -80.0),
        h.insert("ZZ UNKNOWN LLC", "MISC", -1.0),
    ];

    let report = h
        .pipeline
        .categorize_batch(&batch, &CancelFlag::new())
        .await
        .unwrap();

    assert_eq!(report.processed, 5);
    assert_eq!(report.llm_sent, 3);
    assert_eq!(report.by_method.get("rule_based"), Some(&2));
    assert_eq!(report.by_method.get("llm_based"), Some(&3));
    assert_eq!(report.applied, 5);

    // One prompt for the whole remainder
    let requests = h.mock.requests();
    assert_eq!(requests.len(), 1);
    let prompt = &requests[0].messages[1].content;
    assert_eq!(prompt.matches("| Merchant: ").count(), 3);
    assert!(!prompt.contains("STARBUCKS"));

    let unknown = &report.results[4];
    assert_eq!(unknown.category_id, Some(h.category("Other")));
    assert_eq!(unknown.method, Some(CategorizationMethod::LlmBased));
    assert_eq!(report.results[1].category_id, Some(h.category("Transport")));
}

#[tokio::test]
async fn test_duplicate_ids_prompted_once() {
    let h = harness();
    let first = h.insert("MYSTERY ONE", "X", -3.0);
    let second = h.insert("MYSTERY TWO", "Y", -4.0);
    let batch = vec![first.clone(), first.clone(), second];

    let report = h
        .pipeline
        .categorize_batch(&batch, &CancelFlag::new())
        .await
        .unwrap();

    assert_eq!(report.duplicates, 1);
    assert_eq!(report.processed, 2);
    assert_eq!(report.skipped, 0);
    assert!(!report.cancelled);
    assert_eq!(report.llm_sent, 2);
    assert_eq!(report.results[0].transaction_id, first.id);

    let requests = h.mock.requests();
    assert_eq!(requests.len(), 1);
    let prompt = &requests[0].messages[1].content;
    assert_eq!(prompt.matches(&format!("ID: {} |", first.id)).count(), 1);
    assert_eq!(prompt.matches("| Merchant: ").count(), 2);
}

#[tokio::test]
async fn test_unparseable_llm_response_fails_items_not_batch() {
    let h = harness_with(
        MockBackend::new().with_chat_response("I think these are all groceries."),
        EngineConfig::default(),
    );
    let batch = vec![h.insert("MYSTERY ONE", "X", -3.0), h.insert("MYSTERY TWO", "Y", -4.0)];

    let report = h
        .pipeline
        .categorize_batch(&batch, &CancelFlag::new())
        .await
        .unwrap();

    assert_eq!(report.processed, 2);
    assert_eq!(report.applied, 0);
    for result in &report.results {
        assert_eq!(result.method, Some(CategorizationMethod::LlmBased));
        assert!(!result.applied);
        assert!(result.error.as_deref().unwrap().contains("Unparseable"));
    }
    for tx in &batch {
        assert_eq!(h.db.get_transaction(tx.id).unwrap().unwrap().category_id, None);
    }
}

// =============================================================================
// Budget
// =============================================================================

#[tokio::test]
async fn test_budget_exhausted_keeps_best_candidate() {
    let h = harness();
    h.rule("UBER*", "Transport", 0.5, 1);
    h.pipeline.budget().update_budget(ORG, 10.0, 0.0).unwrap();
    h.pipeline.budget().record_spend(ORG, 10.0, 100).unwrap();

    let tx = h.insert("UBER EATS", "DELIVERY", -25.0);
    let result = h.pipeline.categorize(&tx).await.unwrap();

    assert_eq!(result.method, Some(CategorizationMethod::BudgetExceeded));
    assert!(!result.applied);
    assert_eq!(result.category_id, Some(h.category("Transport")));
    assert_eq!(result.confidence, 0.5);
    assert_eq!(h.mock.chat_calls(), 0);

    let stored = h.db.get_transaction(tx.id).unwrap().unwrap();
    assert_eq!(stored.category_id, None);
    assert_eq!(
        stored.categorization.unwrap().method,
        Some(CategorizationMethod::BudgetExceeded)
    );
}

#[tokio::test]
async fn test_rate_limit_defers_llm_call() {
    let mut config = EngineConfig::default();
    config.rate_limit.max_requests_per_hour = 1;
    let h = harness_with(MockBackend::new(), config);

    let first = h.insert("NETFLIX.COM", "STREAMING", -15.49);
    let result = h.pipeline.categorize(&first).await.unwrap();
    assert_eq!(result.method, Some(CategorizationMethod::LlmBased));
    assert_eq!(h.pipeline.rate_limiter().usage().0, 1);

    let second = h.insert("HULU PLUS", "VIDEO", -7.99);
    let result = h.pipeline.categorize(&second).await.unwrap();
    assert_eq!(result.method, Some(CategorizationMethod::RateLimited));
    assert!(!result.applied);
    assert!(result.explanation.contains("hourly request limit"));
    assert_eq!(h.mock.chat_calls(), 1);

    // Nothing was reserved for the refused call
    let tracker = h.pipeline.budget().get_cost_tracker(ORG).unwrap();
    assert_eq!(tracker.transaction_count, 1);
    let stored = h.db.get_transaction(second.id).unwrap().unwrap();
    assert_eq!(stored.category_id, None);
    assert_eq!(
        stored.categorization.unwrap().method,
        Some(CategorizationMethod::RateLimited)
    );
}

#[tokio::test]
async fn test_estimate_and_cost_cap() {
    let h = harness();
    for i in 0..4 {
        h.insert(&format!("SHOP {}", i), "PURCHASE", -10.0);
    }

    let estimate = h
        .pipeline
        .estimate_batch(ORG, &BatchSelection::default())
        .unwrap();
    assert_eq!(estimate.transaction_count, 4);
    assert_eq!(estimate.model.as_deref(), Some("gpt-4o-mini"));
    // 4 × 150 / 1000 × 0.00015
    assert!((estimate.estimated_max_cost - 0.00009).abs() < 1e-12);
    assert!(estimate.fits_budget);

    let capped = BatchSelection {
        max_cost: Some(0.00001),
        ..BatchSelection::default()
    };
    assert!(h
        .pipeline
        .categorize_selection(ORG, &capped, &CancelFlag::new())
        .await
        .is_err());
    assert_eq!(h.mock.chat_calls(), 0);
}

// =============================================================================
// Feedback loop
// =============================================================================

async fn corrected_merchant_result(order: CorrectedMerchantOrder) -> (CategorizationMethod, bool) {
    let mut config = EngineConfig::default();
    config.pipeline.corrected_merchant_order = order;
    let h = harness_with(MockBackend::new(), config);
    let rule_id = h.rule("CAFE*", "Dining", 0.95, 1);

    let first = h.insert("CAFE ROMA", "ESPRESSO", -4.0);
    let result = h.pipeline.categorize(&first).await.unwrap();
    assert_eq!(result.method, Some(CategorizationMethod::RuleBased));

    h.pipeline
        .feedback()
        .record_feedback(&NewFeedback {
            transaction_id: first.id,
            organization_id: ORG,
            user_id: "owner".into(),
            feedback_type: FeedbackType::Correction,
            new_category_id: Some(h.category("Groceries")),
        })
        .unwrap();
    assert_eq!(h.db.get_rule(rule_id).unwrap().unwrap().correction_count, 1);

    let second = h.insert("CAFE ROMA", "BEANS", -12.0);
    let result = h.pipeline.categorize(&second).await.unwrap();
    let groceries = result.category_id == Some(h.category("Groceries"));
    (result.method.unwrap(), groceries)
}

#[tokio::test]
async fn test_corrected_merchant_pattern_first() {
    let (method, groceries) = corrected_merchant_result(CorrectedMerchantOrder::PatternFirst).await;
    assert_eq!(method, CategorizationMethod::PatternBased);
    assert!(groceries);
}

#[tokio::test]
async fn test_corrected_merchant_rule_first() {
    let (method, groceries) = corrected_merchant_result(CorrectedMerchantOrder::RuleFirst).await;
    assert_eq!(method, CategorizationMethod::RuleBased);
    assert!(!groceries);
}

// =============================================================================
// Cancellation and usage statistics
// =============================================================================

#[tokio::test]
async fn test_cancelled_batch_leaves_transactions_untouched() {
    let h = harness();
    let batch = vec![h.insert("A", "A", -1.0), h.insert("B", "B", -1.0)];
    let cancel = CancelFlag::new();
    cancel.cancel();

    let report = h.pipeline.categorize_batch(&batch, &cancel).await.unwrap();

    assert!(report.cancelled);
    assert_eq!(report.processed, 0);
    assert_eq!(report.skipped, 2);
    assert_eq!(h.mock.chat_calls(), 0);
    for tx in &batch {
        assert!(h.db.get_transaction(tx.id).unwrap().unwrap().categorization.is_none());
    }
}

#[tokio::test]
async fn test_usage_updater_counts_rule_matches() {
    let db = Database::in_memory().unwrap();
    db.seed_default_categories(ORG).unwrap();
    let (recorder, updater) = usage::channel(db.clone());
    let stats_task = updater.spawn();

    let pipeline = Pipeline::builder(db.clone(), EngineConfig::default())
        .usage(recorder)
        .build()
        .unwrap();
    let dining = db.find_category_by_name(ORG, "Dining").unwrap().unwrap().id;
    let rule = pipeline
        .rules()
        .add_rule(&NewCategoryRule {
            organization_id: ORG,
            category_id: dining,
            rule_type: RuleType::DescriptionKeyword,
            pattern: "coffee".into(),
            confidence: 0.99,
            priority: 0,
            case_sensitive: false,
            is_regex: false,
        })
        .unwrap();

    for _ in 0..3 {
        let id = db
            .insert_transaction(&NewTransaction {
                organization_id: ORG,
                amount: -3.0,
                description: "COFFEE BAR".into(),
                merchant_name: None,
                date: NaiveDate::from_ymd_opt(2024, 6, 1).unwrap(),
            })
            .unwrap();
        let tx = db.get_transaction(id).unwrap().unwrap();
        pipeline.categorize(&tx).await.unwrap();
    }

    // Dropping the pipeline drops every recorder and ends the updater
    drop(pipeline);
    let applied = stats_task.await.unwrap();

    // The first transaction teaches "coffee bar"; later ones still hit the rule first
    assert!(applied >= 3);
    let stored = db.get_rule(rule.id).unwrap().unwrap();
    assert_eq!(stored.usage_count, 3);
}
