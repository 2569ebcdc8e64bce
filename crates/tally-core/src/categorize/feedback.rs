//! User feedback and periodic learning
//!
//! Feedback is append-only. Each event updates the merchant cache, the
//! transaction's category and the RAG vote label right away; heavier work
//! (pattern mining over categorized history) runs in a learning pass that
//! an external scheduler triggers once enough feedback has accumulated.

use std::collections::{BTreeMap, HashMap, HashSet};

use chrono::{Duration, Utc};
use tracing::{debug, info};

use super::patterns::{pattern_key, PatternEngine};
use crate::config::FeedbackSettings;
use crate::db::{Database, FeedbackRow};
use crate::error::{Error, Result};
use crate::models::{
    CategorizationFeedback, CategorizationMethod, CategorizationResult, FeedbackAnalysis, FeedbackReceipt,
    FeedbackType, LearningRun, MatchTrace, NewFeedback, Transaction,
};

const ANALYSIS_LIMIT: i64 = 10;

#[derive(Clone)]
pub struct FeedbackManager {
    db: Database,
    patterns: PatternEngine,
    settings: FeedbackSettings,
}

impl FeedbackManager {
    pub fn new(db: Database, patterns: PatternEngine, settings: FeedbackSettings) -> Self {
        Self { db, patterns, settings }
    }

    /// Append a feedback event and apply its immediate effects
    pub fn record_feedback(&self, feedback: &NewFeedback) -> Result<FeedbackReceipt> {
        let user_id = feedback.user_id.trim();
        if user_id.is_empty() {
            return Err(Error::Validation("user_id is required".into()));
        }

        let tx = self
            .db
            .get_transaction(feedback.transaction_id)?
            .filter(|tx| tx.organization_id == feedback.organization_id)
            .ok_or_else(|| Error::NotFound(format!("Transaction {}", feedback.transaction_id)))?;

        let new_category_id = self.validate(&tx, feedback)?;
        let previous = tx.categorization.clone();
        let key = pattern_key(&tx);

        let feedback_id = self.db.insert_feedback(&FeedbackRow {
            transaction_id: tx.id,
            organization_id: tx.organization_id,
            user_id,
            old_category_id: tx.category_id,
            new_category_id,
            feedback_type: feedback.feedback_type,
            confidence_before: previous.as_ref().map(|p| p.confidence),
            method_used: previous.as_ref().and_then(|p| p.method),
            merchant_key: key.as_deref(),
        })?;

        match (feedback.feedback_type, new_category_id) {
            (FeedbackType::Correction, Some(new_category)) => {
                self.patterns
                    .apply_correction(&tx, tx.category_id, new_category)?;
                self.penalize_source(&tx, previous.as_ref(), key.as_deref())?;
                let metadata = user_metadata(&tx, previous, Some(new_category), "Corrected by user");
                self.db
                    .set_transaction_category(tx.id, Some(new_category), Some(&metadata))?;
                self.db.set_embedding_label(tx.id, Some(new_category))?;
            }
            (FeedbackType::Confirmation, Some(category)) => {
                self.patterns.confirm(&tx, category)?;
                self.db.set_embedding_label(tx.id, Some(category))?;
            }
            (FeedbackType::Rejection, _) => {
                if let Some(old) = tx.category_id {
                    self.patterns.reject(&tx, old)?;
                }
                self.penalize_source(&tx, previous.as_ref(), key.as_deref())?;
                let metadata = user_metadata(&tx, previous, None, "Rejected by user");
                self.db.set_transaction_category(tx.id, None, Some(&metadata))?;
                self.db.set_embedding_label(tx.id, None)?;
            }
            _ => {}
        }

        let high_water = self.db.last_learning_high_water(tx.organization_id)?;
        let pending_feedback = self.db.count_feedback_since(tx.organization_id, high_water)?;
        let relearn_eligible = pending_feedback >= self.settings.relearn_after;

        info!(
            feedback_id,
            transaction_id = tx.id,
            organization_id = tx.organization_id,
            feedback_type = feedback.feedback_type.as_str(),
            pending_feedback,
            "Recorded feedback"
        );

        Ok(FeedbackReceipt {
            feedback_id,
            pending_feedback,
            relearn_eligible,
        })
    }

    /// Resolve the category a feedback event points at
    fn validate(&self, tx: &Transaction, feedback: &NewFeedback) -> Result<Option<i64>> {
        match feedback.feedback_type {
            FeedbackType::Correction => {
                let new_category = feedback.new_category_id.ok_or_else(|| {
                    Error::Validation("A correction requires new_category_id".into())
                })?;
                if !self.db.category_belongs_to(new_category, tx.organization_id)? {
                    return Err(Error::NotFound(format!("Category {}", new_category)));
                }
                if tx.category_id == Some(new_category) {
                    return Err(Error::Validation(
                        "Correction must name a different category; use a confirmation instead".into(),
                    ));
                }
                Ok(Some(new_category))
            }
            FeedbackType::Confirmation => {
                let current = tx.category_id.ok_or_else(|| {
                    Error::Validation("Cannot confirm an uncategorized transaction".into())
                })?;
                match feedback.new_category_id {
                    Some(other) if other != current => Err(Error::Validation(format!(
                        "Confirmation names category {} but the transaction is in {}",
                        other, current
                    ))),
                    _ => Ok(Some(current)),
                }
            }
            FeedbackType::Rejection => {
                if tx.category_id.is_none() {
                    return Err(Error::Validation(
                        "Cannot reject an uncategorized transaction".into(),
                    ));
                }
                Ok(None)
            }
        }
    }

    /// Charge a wrong automated decision to the rule or cache entry that made it.
    /// Decisions the user already overrode are not charged again.
    fn penalize_source(
        &self,
        tx: &Transaction,
        previous: Option<&CategorizationResult>,
        key: Option<&str>,
    ) -> Result<()> {
        let Some(previous) = previous.filter(|p| p.applied && !p.user_corrected) else {
            return Ok(());
        };

        match previous.method {
            Some(CategorizationMethod::RuleBased) => {
                if let Some(rule) = previous.trace.rule_matches.first() {
                    self.db.record_rule_correction(rule.rule_id)?;
                    debug!(rule_id = rule.rule_id, "Rule correction recorded");
                }
            }
            Some(CategorizationMethod::PatternBased) => {
                // Fuzzy and partial hits point at a neighbouring key
                if let Some(hit) = previous
                    .trace
                    .pattern_match
                    .as_ref()
                    .filter(|hit| Some(hit.pattern.as_str()) != key)
                {
                    self.patterns
                        .demote(tx.organization_id, &hit.pattern, hit.category_id)?;
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// Mine merchant patterns from categorized history and relabel embeddings
    /// touched by feedback since the previous pass
    pub fn run_learning_pass(&self, organization_id: i64) -> Result<LearningRun> {
        let high_water = self.db.last_learning_high_water(organization_id)?;
        let pending = self.db.feedback_since(organization_id, high_water)?;
        let feedback_high_water = pending.iter().map(|f| f.id).max().unwrap_or(high_water);

        let mut relabeled = 0;
        let touched: HashSet<i64> = pending.iter().map(|f| f.transaction_id).collect();
        for transaction_id in touched {
            if let Some(tx) = self.db.get_transaction(transaction_id)? {
                relabeled += self.db.set_embedding_label(tx.id, tx.category_id)? as i64;
            }
        }

        let since = Utc::now().date_naive() - Duration::days(self.settings.mining_lookback_days);
        let mut tallies: BTreeMap<String, HashMap<i64, i64>> = BTreeMap::new();
        for tx in self.db.list_categorized_since(organization_id, since)? {
            if let (Some(key), Some(category)) = (pattern_key(&tx), tx.category_id) {
                *tallies.entry(key).or_default().entry(category).or_default() += 1;
            }
        }

        let mut mined = 0;
        for (key, counts) in tallies {
            let total: i64 = counts.values().sum();
            if total < self.settings.mining_min_occurrences {
                continue;
            }
            let Some((&category, &count)) = counts
                .iter()
                .max_by(|a, b| a.1.cmp(b.1).then(b.0.cmp(a.0)))
            else {
                continue;
            };
            let share = count as f64 / total as f64;
            if share < self.settings.mining_min_share || self.db.has_user_pattern(organization_id, &key)? {
                continue;
            }
            if self.patterns.learn_key(organization_id, &key, category, share)? {
                mined += 1;
            }
        }

        let run = LearningRun {
            organization_id,
            feedback_high_water,
            patterns_mined: mined,
            embeddings_relabeled: relabeled,
            ran_at: Utc::now(),
        };
        self.db.insert_learning_run(&run)?;

        info!(
            organization_id,
            feedback = pending.len(),
            patterns_mined = mined,
            embeddings_relabeled = relabeled,
            "Learning pass complete"
        );
        Ok(run)
    }

    pub fn analyze_feedback(&self, organization_id: i64) -> Result<FeedbackAnalysis> {
        let (total, corrections, confirmations, rejections) =
            self.db.feedback_type_counts(organization_id)?;
        let rate = |n: i64| if total > 0 { n as f64 / total as f64 } else { 0.0 };

        Ok(FeedbackAnalysis {
            organization_id,
            total_feedback: total,
            correction_rate: rate(corrections),
            confirmation_rate: rate(confirmations),
            rejection_rate: rate(rejections),
            method_accuracy: self.db.method_accuracy(organization_id)?,
            common_corrections: self.db.common_corrections(organization_id, ANALYSIS_LIMIT)?,
            problematic_merchants: self.db.problematic_merchants(organization_id, ANALYSIS_LIMIT)?,
        })
    }

    pub fn list_feedback(&self, organization_id: i64, limit: i64, offset: i64) -> Result<Vec<CategorizationFeedback>> {
        self.db.list_feedback(organization_id, limit, offset)
    }

    pub fn feedback_for_transaction(&self, organization_id: i64, transaction_id: i64) -> Result<Vec<CategorizationFeedback>> {
        let owned = self
            .db
            .get_transaction(transaction_id)?
            .is_some_and(|tx| tx.organization_id == organization_id);
        if !owned {
            return Err(Error::NotFound(format!("Transaction {}", transaction_id)));
        }
        self.db.feedback_for_transaction(transaction_id)
    }
}

/// Metadata written when a user overrides the category
fn user_metadata(
    tx: &Transaction,
    previous: Option<CategorizationResult>,
    category_id: Option<i64>,
    explanation: &str,
) -> CategorizationResult {
    let (method, trace) = previous
        .map(|p| (p.method, p.trace))
        .unwrap_or((None, MatchTrace::default()));

    CategorizationResult {
        transaction_id: tx.id,
        category_id,
        confidence: if category_id.is_some() { 1.0 } else { 0.0 },
        method,
        applied: category_id.is_some(),
        processing_time_ms: 0,
        cost_estimate: 0.0,
        explanation: explanation.to_string(),
        error: None,
        trace,
        user_corrected: true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::categorize::usage::UsageRecorder;
    use crate::config::PatternSettings;
    use crate::models::{
        MatchType, NewCategoryRule, NewTransaction, PatternMatch, PatternSource, RuleMatch, RuleType,
        TransactionEmbedding,
    };

    struct Fixture {
        db: Database,
        feedback: FeedbackManager,
        dining: i64,
        groceries: i64,
    }

    fn fixture(settings: FeedbackSettings) -> Fixture {
        let db = Database::in_memory().unwrap();
        let dining = db.create_category(1, "Dining", None, None, None).unwrap();
        let groceries = db.create_category(1, "Groceries", None, None, None).unwrap();
        let patterns = PatternEngine::new(db.clone(), PatternSettings::default(), UsageRecorder::disabled());
        Fixture {
            feedback: FeedbackManager::new(db.clone(), patterns, settings),
            db,
            dining,
            groceries,
        }
    }

    fn insert(db: &Database, merchant: &str, category: Option<i64>, result: Option<&CategorizationResult>) -> i64 {
        let id = db
            .insert_transaction(&NewTransaction {
                organization_id: 1,
                amount: -12.0,
                description: "CARD PURCHASE".into(),
                merchant_name: Some(merchant.into()),
                date: Utc::now().date_naive(),
            })
            .unwrap();
        if let Some(result) = result {
            let mut result = result.clone();
            result.transaction_id = id;
            db.save_categorization(&result).unwrap();
        } else if category.is_some() {
            db.set_transaction_category(id, category, None).unwrap();
        }
        id
    }

    fn automated(method: CategorizationMethod, category: i64, trace: MatchTrace) -> CategorizationResult {
        CategorizationResult {
            transaction_id: 0,
            category_id: Some(category),
            confidence: 0.95,
            method: Some(method),
            applied: true,
            processing_time_ms: 1,
            cost_estimate: 0.0,
            explanation: "automated".into(),
            error: None,
            trace,
            user_corrected: false,
        }
    }

    fn feedback(tx: i64, kind: FeedbackType, category: Option<i64>) -> NewFeedback {
        NewFeedback {
            transaction_id: tx,
            organization_id: 1,
            user_id: "alice".into(),
            feedback_type: kind,
            new_category_id: category,
        }
    }

    fn pattern_confidence(db: &Database, key: &str, category: i64) -> Option<f64> {
        db.list_merchant_patterns(1)
            .unwrap()
            .into_iter()
            .find(|p| p.pattern == key && p.category_id == category)
            .map(|p| p.confidence)
    }

    #[test]
    fn test_correction_updates_everything() {
        let f = fixture(FeedbackSettings::default());
        let rule_id = f
            .db
            .create_rule(&NewCategoryRule {
                organization_id: 1,
                category_id: f.dining,
                rule_type: RuleType::MerchantPattern,
                pattern: "WHOLE*".into(),
                confidence: 0.95,
                priority: 1,
                case_sensitive: false,
                is_regex: false,
            })
            .unwrap();
        let trace = MatchTrace {
            rule_matches: vec![RuleMatch {
                rule_id,
                category_id: f.dining,
                confidence: 0.95,
                rule_type: RuleType::MerchantPattern,
                pattern: "WHOLE*".into(),
            }],
            ..MatchTrace::default()
        };
        let tx = insert(
            &f.db,
            "WHOLE FOODS",
            None,
            Some(&automated(CategorizationMethod::RuleBased, f.dining, trace)),
        );
        f.db.upsert_embedding(&TransactionEmbedding {
            transaction_id: tx,
            organization_id: 1,
            embedding: vec![1.0, 0.0],
            embedding_model: "mock".into(),
            text_hash: "h".into(),
            category_id: Some(f.dining),
        })
        .unwrap();
        f.db.learn_merchant_pattern(1, "whole foods", f.dining, 0.9, PatternSource::Learned)
            .unwrap();

        let receipt = f
            .feedback
            .record_feedback(&feedback(tx, FeedbackType::Correction, Some(f.groceries)))
            .unwrap();
        assert_eq!(receipt.pending_feedback, 1);
        assert!(!receipt.relearn_eligible);

        let stored = f.db.get_transaction(tx).unwrap().unwrap();
        assert_eq!(stored.category_id, Some(f.groceries));
        assert!(stored.categorization.unwrap().user_corrected);
        assert_eq!(f.db.get_embedding(tx).unwrap().unwrap().category_id, Some(f.groceries));

        assert!(pattern_confidence(&f.db, "whole foods", f.dining).unwrap() < 0.9);
        assert_eq!(pattern_confidence(&f.db, "whole foods", f.groceries), Some(1.0));
        assert!(f.db.has_user_pattern(1, "whole foods").unwrap());

        let rule = f.db.get_rule(rule_id).unwrap().unwrap();
        assert_eq!(rule.correction_count, 1);

        let history = f.feedback.feedback_for_transaction(1, tx).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].old_category_id, Some(f.dining));
        assert_eq!(history[0].method_used, Some(CategorizationMethod::RuleBased));
        assert_eq!(history[0].confidence_before, Some(0.95));
    }

    #[test]
    fn test_second_correction_does_not_charge_rule_again() {
        let f = fixture(FeedbackSettings::default());
        let rule_id = f
            .db
            .create_rule(&NewCategoryRule {
                organization_id: 1,
                category_id: f.dining,
                rule_type: RuleType::DescriptionKeyword,
                pattern: "CARD".into(),
                confidence: 0.95,
                priority: 1,
                case_sensitive: false,
                is_regex: false,
            })
            .unwrap();
        let trace = MatchTrace {
            rule_matches: vec![RuleMatch {
                rule_id,
                category_id: f.dining,
                confidence: 0.95,
                rule_type: RuleType::DescriptionKeyword,
                pattern: "CARD".into(),
            }],
            ..MatchTrace::default()
        };
        let tx = insert(&f.db, "CAFE", None, Some(&automated(CategorizationMethod::RuleBased, f.dining, trace)));

        f.feedback
            .record_feedback(&feedback(tx, FeedbackType::Correction, Some(f.groceries)))
            .unwrap();
        f.feedback
            .record_feedback(&feedback(tx, FeedbackType::Correction, Some(f.dining)))
            .unwrap();

        assert_eq!(f.db.get_rule(rule_id).unwrap().unwrap().correction_count, 1);
    }

    #[test]
    fn test_fuzzy_pattern_source_demoted() {
        let f = fixture(FeedbackSettings::default());
        f.db.learn_merchant_pattern(1, "starbucks", f.groceries, 0.9, PatternSource::Learned)
            .unwrap();
        let trace = MatchTrace {
            pattern_match: Some(PatternMatch {
                pattern_id: 1,
                pattern: "starbucks".into(),
                category_id: f.groceries,
                confidence: 0.85,
                similarity: 0.9,
                match_type: MatchType::Fuzzy,
            }),
            ..MatchTrace::default()
        };
        let tx = insert(
            &f.db,
            "STARBUCKS 42",
            None,
            Some(&automated(CategorizationMethod::PatternBased, f.groceries, trace)),
        );

        f.feedback
            .record_feedback(&feedback(tx, FeedbackType::Correction, Some(f.dining)))
            .unwrap();

        assert!((pattern_confidence(&f.db, "starbucks", f.groceries).unwrap() - 0.45).abs() < 1e-9);
        assert_eq!(pattern_confidence(&f.db, "starbucks 42", f.dining), Some(1.0));
    }

    #[test]
    fn test_confirmation_and_rejection() {
        let f = fixture(FeedbackSettings::default());
        f.db.learn_merchant_pattern(1, "cafe", f.dining, 0.7, PatternSource::Learned)
            .unwrap();
        let tx = insert(&f.db, "CAFE", Some(f.dining), None);

        f.feedback
            .record_feedback(&feedback(tx, FeedbackType::Confirmation, None))
            .unwrap();
        let after_confirm = pattern_confidence(&f.db, "cafe", f.dining).unwrap();
        assert!(after_confirm > 0.7);

        f.feedback
            .record_feedback(&feedback(tx, FeedbackType::Rejection, None))
            .unwrap();
        assert!(pattern_confidence(&f.db, "cafe", f.dining).unwrap() < after_confirm);
        let stored = f.db.get_transaction(tx).unwrap().unwrap();
        assert_eq!(stored.category_id, None);
        assert!(stored.categorization.unwrap().user_corrected);
    }

    #[test]
    fn test_invalid_feedback_rejected() {
        let f = fixture(FeedbackSettings::default());
        let tx = insert(&f.db, "CAFE", Some(f.dining), None);
        let foreign = f.db.create_category(2, "Elsewhere", None, None, None).unwrap();

        let cases = [
            feedback(tx, FeedbackType::Correction, None),
            feedback(tx, FeedbackType::Correction, Some(f.dining)),
            feedback(tx, FeedbackType::Confirmation, Some(f.groceries)),
        ];
        for case in &cases {
            assert!(matches!(f.feedback.record_feedback(case), Err(Error::Validation(_))));
        }
        assert!(matches!(
            f.feedback
                .record_feedback(&feedback(tx, FeedbackType::Correction, Some(foreign))),
            Err(Error::NotFound(_))
        ));

        let mut other_org = feedback(tx, FeedbackType::Confirmation, None);
        other_org.organization_id = 2;
        assert!(matches!(f.feedback.record_feedback(&other_org), Err(Error::NotFound(_))));

        let mut anonymous = feedback(tx, FeedbackType::Confirmation, None);
        anonymous.user_id = "  ".into();
        assert!(matches!(f.feedback.record_feedback(&anonymous), Err(Error::Validation(_))));

        assert!(f.feedback.list_feedback(1, 10, 0).unwrap().is_empty());
    }

    #[test]
    fn test_learning_pass_mines_and_advances() {
        let f = fixture(FeedbackSettings {
            relearn_after: 2,
            ..FeedbackSettings::default()
        });
        for _ in 0..4 {
            insert(&f.db, "Blue Bottle", Some(f.dining), None);
        }
        insert(&f.db, "Blue Bottle", Some(f.groceries), None);
        // Too few occurrences
        insert(&f.db, "Corner Shop", Some(f.groceries), None);
        // No dominant category
        insert(&f.db, "Mixed", Some(f.groceries), None);
        insert(&f.db, "Mixed", Some(f.dining), None);
        insert(&f.db, "Mixed", Some(f.dining), None);

        let tx = insert(&f.db, "Deli", Some(f.dining), None);
        f.feedback
            .record_feedback(&feedback(tx, FeedbackType::Confirmation, None))
            .unwrap();
        let receipt = f
            .feedback
            .record_feedback(&feedback(tx, FeedbackType::Correction, Some(f.groceries)))
            .unwrap();
        assert!(receipt.relearn_eligible);

        let run = f.feedback.run_learning_pass(1).unwrap();
        assert_eq!(run.patterns_mined, 1);
        assert_eq!(run.feedback_high_water, receipt.feedback_id);
        assert!((pattern_confidence(&f.db, "blue bottle", f.dining).unwrap() - 0.8).abs() < 1e-9);
        assert!(pattern_confidence(&f.db, "corner shop", f.groceries).is_none());
        assert!(pattern_confidence(&f.db, "mixed", f.dining).is_none());

        let tx2 = insert(&f.db, "Deli", Some(f.groceries), None);
        let receipt = f
            .feedback
            .record_feedback(&feedback(tx2, FeedbackType::Confirmation, None))
            .unwrap();
        assert_eq!(receipt.pending_feedback, 1);
        assert!(!receipt.relearn_eligible);
    }

    #[test]
    fn test_analysis_rates() {
        let f = fixture(FeedbackSettings::default());
        let a = insert(&f.db, "Deli", Some(f.dining), None);
        let b = insert(&f.db, "Deli", Some(f.dining), None);
        let c = insert(&f.db, "Deli", Some(f.dining), None);
        let d = insert(&f.db, "Bakery", Some(f.dining), None);
        for tx in [a, b] {
            f.feedback
                .record_feedback(&feedback(tx, FeedbackType::Correction, Some(f.groceries)))
                .unwrap();
        }
        f.feedback
            .record_feedback(&feedback(c, FeedbackType::Confirmation, None))
            .unwrap();
        f.feedback
            .record_feedback(&feedback(d, FeedbackType::Rejection, None))
            .unwrap();

        let analysis = f.feedback.analyze_feedback(1).unwrap();
        assert_eq!(analysis.total_feedback, 4);
        assert_eq!(analysis.correction_rate, 0.5);
        assert_eq!(analysis.confirmation_rate, 0.25);
        assert_eq!(analysis.rejection_rate, 0.25);
        assert_eq!(analysis.common_corrections[0].to_category, "Groceries");
        assert_eq!(analysis.common_corrections[0].count, 2);
        // A merchant needs more than one correction to be flagged
        assert_eq!(analysis.problematic_merchants.len(), 1);
        assert_eq!(analysis.problematic_merchants[0].merchant, "deli");

        let empty = f.feedback.analyze_feedback(9).unwrap();
        assert_eq!(empty.total_feedback, 0);
        assert_eq!(empty.correction_rate, 0.0);
    }
}
