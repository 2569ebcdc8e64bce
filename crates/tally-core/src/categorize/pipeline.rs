//! Cascade coordinator
//!
//! Each transaction runs through the cheap stages in configured order and
//! stops at the first stage whose confidence meets its threshold. Whatever
//! the cheap stages leave unresolved is grouped per organization and sent
//! to the LLM as one batch, behind a single budget reservation.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tracing::{debug, info, warn};

use super::budget::BudgetManager;
use super::feedback::FeedbackManager;
use super::llm::{BatchOutcome, LlmBatchEngine, CANCELLED};
use super::patterns::{pattern_key, PatternEngine};
use super::rag::RagEngine;
use super::rate_limit::RateLimiter;
use super::rules::RuleEngine;
use super::usage::UsageRecorder;
use super::{CancelFlag, Evidence, Stage, StageKind};
use crate::ai::{ChatBackend, Embedder};
use crate::config::{CorrectedMerchantOrder, EngineConfig};
use crate::db::Database;
use crate::error::{Error, Result};
use crate::models::{
    BatchSelection, CategorizationMethod, CategorizationResult, CategorizationStats, CostTracker,
    MatchTrace, SimilarityMatch, StageTrace, Transaction,
};
use crate::prompts::PromptLibrary;

/// Default cap on transactions selected for one batch run
pub const DEFAULT_BATCH_LIMIT: i64 = 1000;

/// Assembles a [`Pipeline`]; the embedder and chat backend are optional
pub struct PipelineBuilder {
    db: Database,
    config: EngineConfig,
    usage: UsageRecorder,
    embedder: Option<Arc<dyn Embedder>>,
    chat: Option<Arc<dyn ChatBackend>>,
    prompts: Option<PromptLibrary>,
}

impl PipelineBuilder {
    pub fn usage(mut self, usage: UsageRecorder) -> Self {
        self.usage = usage;
        self
    }

    /// Enables the RAG stage
    pub fn embedder(mut self, embedder: Arc<dyn Embedder>) -> Self {
        self.embedder = Some(embedder);
        self
    }

    /// Enables the LLM stage
    pub fn chat(mut self, chat: Arc<dyn ChatBackend>) -> Self {
        self.chat = Some(chat);
        self
    }

    pub fn prompts(mut self, prompts: PromptLibrary) -> Self {
        self.prompts = Some(prompts);
        self
    }

    pub fn build(self) -> Result<Pipeline> {
        let Self {
            db,
            config,
            usage,
            embedder,
            chat,
            prompts,
        } = self;

        let rules = RuleEngine::new(db.clone(), usage.clone());
        let patterns = PatternEngine::new(db.clone(), config.patterns.clone(), usage);
        let rag = embedder.map(|e| RagEngine::new(db.clone(), e, config.rag.clone()));
        let llm = match chat {
            Some(chat) => {
                let mut prompts = prompts.unwrap_or_default();
                Some(LlmBatchEngine::new(
                    db.clone(),
                    chat,
                    config.llm.clone(),
                    &mut prompts,
                )?)
            }
            None => None,
        };
        let budget = BudgetManager::new(db.clone(), config.budget.clone());
        let rate_limiter = RateLimiter::new(config.rate_limit.clone());
        let feedback = FeedbackManager::new(db.clone(), patterns.clone(), config.feedback.clone());

        debug!(
            rag = rag.is_some(),
            llm = llm.is_some(),
            stages = ?config.pipeline.stage_order,
            "Pipeline ready"
        );

        Ok(Pipeline {
            db,
            config,
            rules,
            patterns,
            rag,
            llm,
            budget,
            rate_limiter,
            feedback,
        })
    }
}

/// Summary of a batch run
#[derive(Debug, Clone, Serialize)]
pub struct BatchReport {
    /// One result per attempted transaction, in input order
    pub results: Vec<CategorizationResult>,
    pub processed: usize,
    pub applied: usize,
    pub by_method: BTreeMap<String, usize>,
    /// Transactions included in LLM prompts
    pub llm_sent: usize,
    pub total_cost: f64,
    pub cancelled: bool,
    /// Transactions left untouched because of cancellation
    pub skipped: usize,
    /// Repeated transaction ids, processed once
    pub duplicates: usize,
}

impl BatchReport {
    fn new() -> Self {
        Self {
            results: Vec::new(),
            processed: 0,
            applied: 0,
            by_method: BTreeMap::new(),
            llm_sent: 0,
            total_cost: 0.0,
            cancelled: false,
            skipped: 0,
            duplicates: 0,
        }
    }
}

/// Worst-case preview of a batch run
#[derive(Debug, Clone, Serialize)]
pub struct BatchEstimate {
    pub transaction_count: usize,
    /// None without an LLM backend
    pub model: Option<String>,
    /// Upper bound: assumes no transaction is resolved by a cheap stage
    pub estimated_max_cost: f64,
    pub tracker: CostTracker,
    pub remaining_budget: Option<f64>,
    pub fits_budget: bool,
}

/// Backend availability and remaining LLM headroom
#[derive(Debug, Clone, Serialize)]
pub struct PipelineStatus {
    /// None without an embedder
    pub embedding_model: Option<String>,
    /// None without a chat backend
    pub llm_healthy: Option<bool>,
    pub requests_last_hour: u32,
    pub cost_last_hour: f64,
    pub tracker: CostTracker,
    pub remaining_budget: Option<f64>,
}

/// Cheap-stage outcome for one transaction
struct Cascade {
    decided: Option<Candidate>,
    best: Option<Candidate>,
    trace: MatchTrace,
    started: Instant,
}

#[derive(Debug, Clone, Copy)]
struct Candidate {
    stage: StageKind,
    category_id: i64,
    confidence: f64,
}

pub struct Pipeline {
    db: Database,
    config: EngineConfig,
    rules: RuleEngine,
    patterns: PatternEngine,
    rag: Option<RagEngine>,
    llm: Option<LlmBatchEngine>,
    budget: BudgetManager,
    rate_limiter: RateLimiter,
    feedback: FeedbackManager,
}

impl Pipeline {
    pub fn builder(db: Database, config: EngineConfig) -> PipelineBuilder {
        PipelineBuilder {
            db,
            config,
            usage: UsageRecorder::disabled(),
            embedder: None,
            chat: None,
            prompts: None,
        }
    }

    pub fn db(&self) -> &Database {
        &self.db
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn rules(&self) -> &RuleEngine {
        &self.rules
    }

    pub fn patterns(&self) -> &PatternEngine {
        &self.patterns
    }

    pub fn rag(&self) -> Option<&RagEngine> {
        self.rag.as_ref()
    }

    pub fn llm(&self) -> Option<&LlmBatchEngine> {
        self.llm.as_ref()
    }

    pub fn budget(&self) -> &BudgetManager {
        &self.budget
    }

    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.rate_limiter
    }

    pub fn feedback(&self) -> &FeedbackManager {
        &self.feedback
    }

    /// Categorize a single transaction through the full cascade
    pub async fn categorize(&self, transaction: &Transaction) -> Result<CategorizationResult> {
        let report = self
            .categorize_batch(std::slice::from_ref(transaction), &CancelFlag::new())
            .await?;
        report
            .results
            .into_iter()
            .next()
            .ok_or_else(|| Error::InvalidData(format!("No result for transaction {}", transaction.id)))
    }

    /// Categorize many transactions, batching the LLM remainder per organization
    pub async fn categorize_batch(&self, transactions: &[Transaction], cancel: &CancelFlag) -> Result<BatchReport> {
        let mut report = BatchReport::new();
        let mut slots: Vec<Option<CategorizationResult>> = vec![None; transactions.len()];
        let mut unresolved: BTreeMap<i64, Vec<(usize, Cascade)>> = BTreeMap::new();
        let mut seen = HashSet::with_capacity(transactions.len());

        for (index, tx) in transactions.iter().enumerate() {
            if cancel.is_cancelled() {
                report.cancelled = true;
                break;
            }
            if !seen.insert(tx.id) {
                debug!(transaction_id = tx.id, "Duplicate transaction in batch, skipping");
                report.duplicates += 1;
                continue;
            }

            let cascade = self.run_cheap_stages(tx).await?;
            match cascade.decided {
                Some(decided) => {
                    let result = self.decided_result(tx, decided, cascade);
                    self.finish_applied(tx, &result).await?;
                    slots[index] = Some(result);
                }
                None => unresolved
                    .entry(tx.organization_id)
                    .or_default()
                    .push((index, cascade)),
            }
        }

        for (organization_id, pending) in unresolved {
            if cancel.is_cancelled() {
                report.cancelled = true;
                continue;
            }
            self.resolve_remainder(organization_id, transactions, pending, cancel, &mut slots, &mut report)
                .await?;
        }

        for result in slots.into_iter().flatten() {
            report.processed += 1;
            if result.applied {
                report.applied += 1;
            }
            if let Some(method) = result.method {
                *report.by_method.entry(method.as_str().to_string()).or_default() += 1;
            }
            report.results.push(result);
        }
        report.skipped = transactions.len() - report.processed - report.duplicates;
        if report.skipped > 0 {
            report.cancelled = true;
        }

        if transactions.len() > 1 {
            info!(
                processed = report.processed,
                applied = report.applied,
                llm_sent = report.llm_sent,
                cost = report.total_cost,
                skipped = report.skipped,
                "Batch categorization complete"
            );
        }
        Ok(report)
    }

    /// Cheap stages in the order that applies to this transaction
    fn stage_order_for(&self, tx: &Transaction) -> Result<Vec<StageKind>> {
        let mut order = self.config.pipeline.stage_order.clone();
        if self.config.pipeline.corrected_merchant_order != CorrectedMerchantOrder::PatternFirst {
            return Ok(order);
        }

        let rule_at = order.iter().position(|k| *k == StageKind::Rule);
        let pattern_at = order.iter().position(|k| *k == StageKind::Pattern);
        if let (Some(rule_at), Some(pattern_at)) = (rule_at, pattern_at) {
            if pattern_at > rule_at {
                let corrected = match pattern_key(tx) {
                    Some(key) => self.db.has_user_pattern(tx.organization_id, &key)?,
                    None => false,
                };
                if corrected {
                    let pattern = order.remove(pattern_at);
                    order.insert(rule_at, pattern);
                }
            }
        }
        Ok(order)
    }

    fn stage(&self, kind: StageKind) -> Option<&dyn Stage> {
        match kind {
            StageKind::Rule => Some(&self.rules),
            StageKind::Pattern => Some(&self.patterns),
            StageKind::Rag => self.rag.as_ref().map(|rag| rag as &dyn Stage),
        }
    }

    async fn run_cheap_stages(&self, tx: &Transaction) -> Result<Cascade> {
        let mut cascade = Cascade {
            decided: None,
            best: None,
            trace: MatchTrace::default(),
            started: Instant::now(),
        };

        for kind in self.stage_order_for(tx)? {
            let Some(stage) = self.stage(kind) else {
                continue;
            };

            let scored = match stage.evaluate(tx).await {
                Ok(scored) => scored,
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    warn!(
                        transaction_id = tx.id,
                        stage = kind.as_str(),
                        error = %e,
                        "Stage failed, escalating"
                    );
                    cascade.trace.stages.push(StageTrace {
                        stage: kind.as_str().to_string(),
                        category_id: None,
                        confidence: 0.0,
                        error: Some(e.to_string()),
                    });
                    continue;
                }
            };

            cascade.trace.stages.push(StageTrace {
                stage: kind.as_str().to_string(),
                category_id: scored.category_id,
                confidence: scored.confidence,
                error: None,
            });
            match scored.evidence {
                Evidence::Rule(m) => cascade.trace.rule_matches.push(m),
                Evidence::Pattern(m) => cascade.trace.pattern_match = Some(m),
                Evidence::Similar(matches) => cascade.trace.similarity_matches = matches,
                Evidence::None => {}
            }

            let Some(category_id) = scored.category_id else {
                continue;
            };
            let candidate = Candidate {
                stage: kind,
                category_id,
                confidence: scored.confidence,
            };
            if cascade
                .best
                .map_or(true, |best| candidate.confidence > best.confidence)
            {
                cascade.best = Some(candidate);
            }
            if candidate.confidence >= self.config.thresholds.for_stage(kind) {
                debug!(
                    transaction_id = tx.id,
                    stage = kind.as_str(),
                    category_id,
                    confidence = candidate.confidence,
                    "Resolved by cheap stage"
                );
                cascade.decided = Some(candidate);
                break;
            }
        }

        Ok(cascade)
    }

    fn decided_result(&self, tx: &Transaction, decided: Candidate, cascade: Cascade) -> CategorizationResult {
        CategorizationResult {
            transaction_id: tx.id,
            category_id: Some(decided.category_id),
            confidence: decided.confidence,
            method: Some(decided.stage.method()),
            applied: true,
            processing_time_ms: cascade.started.elapsed().as_millis() as u64,
            cost_estimate: 0.0,
            explanation: explain(decided.stage, &cascade.trace),
            error: None,
            trace: cascade.trace,
            user_corrected: false,
        }
    }

    /// Best cheap candidate, recorded but not applied
    fn suggestion(
        &self,
        tx: &Transaction,
        cascade: Cascade,
        method: Option<CategorizationMethod>,
        explanation: String,
    ) -> CategorizationResult {
        CategorizationResult {
            transaction_id: tx.id,
            category_id: cascade.best.map(|b| b.category_id),
            confidence: cascade.best.map_or(0.0, |b| b.confidence),
            method,
            applied: false,
            processing_time_ms: cascade.started.elapsed().as_millis() as u64,
            cost_estimate: 0.0,
            explanation,
            error: None,
            trace: cascade.trace,
            user_corrected: false,
        }
    }

    async fn resolve_remainder(
        &self,
        organization_id: i64,
        transactions: &[Transaction],
        pending: Vec<(usize, Cascade)>,
        cancel: &CancelFlag,
        slots: &mut [Option<CategorizationResult>],
        report: &mut BatchReport,
    ) -> Result<()> {
        let Some(llm) = &self.llm else {
            for (index, cascade) in pending {
                let tx = &transactions[index];
                let method = cascade.best.map(|b| b.stage.method());
                let result = self.suggestion(
                    tx,
                    cascade,
                    method,
                    "No stage reached its threshold and no LLM backend is configured".into(),
                );
                self.db.save_categorization(&result)?;
                slots[index] = Some(result);
            }
            return Ok(());
        };

        let model = llm.select_model(self.config.pipeline.model_strategy)?.clone();
        let estimated = llm.estimate_cost(pending.len(), &model);
        let requests = pending.len().div_ceil(llm.settings().max_batch_size.max(1)) as u32;

        if let Err(e) = self.rate_limiter.check_limit(requests, estimated) {
            warn!(organization_id, transactions = pending.len(), error = %e, "LLM call deferred");
            self.hold_back(transactions, pending, CategorizationMethod::RateLimited, &e.to_string(), slots)?;
            return Ok(());
        }

        let Some(reservation) = self.budget.reserve(organization_id, estimated)? else {
            let explanation = format!("LLM budget exhausted (estimated ${:.4})", estimated);
            self.hold_back(transactions, pending, CategorizationMethod::BudgetExceeded, &explanation, slots)?;
            return Ok(());
        };

        let categories = self.db.list_categories(organization_id)?;
        let batch: Vec<Transaction> = pending
            .iter()
            .map(|(index, _)| transactions[*index].clone())
            .collect();
        let hints: HashMap<i64, Vec<SimilarityMatch>> = if self.config.pipeline.use_rag_hints {
            pending
                .iter()
                .filter(|(_, c)| !c.trace.similarity_matches.is_empty())
                .map(|(index, c)| {
                    let mut matches = c.trace.similarity_matches.clone();
                    matches.truncate(self.config.rag.hint_limit);
                    (transactions[*index].id, matches)
                })
                .collect()
        } else {
            HashMap::new()
        };

        let outcome = match llm
            .categorize_batch(organization_id, &batch, &categories, &model, &hints, cancel)
            .await
        {
            Ok(outcome) => outcome,
            Err(e) => {
                if let Err(release) = self.budget.reconcile(&reservation, 0.0, 0) {
                    warn!(organization_id, error = %release, "Could not release budget reservation");
                }
                return Err(e);
            }
        };

        let sent = outcome
            .items
            .iter()
            .filter(|i| i.error.as_deref() != Some(CANCELLED))
            .count();
        self.rate_limiter
            .record_request(outcome.chunks as u32, outcome.actual_cost);
        self.budget
            .reconcile(&reservation, outcome.actual_cost, sent as i64)?;
        report.llm_sent += sent;
        report.total_cost += outcome.actual_cost;

        self.apply_llm_outcome(transactions, pending, outcome, sent, slots)
            .await
    }

    /// Record the best cheap candidate of each pending item, unapplied
    fn hold_back(
        &self,
        transactions: &[Transaction],
        pending: Vec<(usize, Cascade)>,
        method: CategorizationMethod,
        explanation: &str,
        slots: &mut [Option<CategorizationResult>],
    ) -> Result<()> {
        for (index, cascade) in pending {
            let result = self.suggestion(&transactions[index], cascade, Some(method), explanation.to_string());
            self.db.save_categorization(&result)?;
            slots[index] = Some(result);
        }
        Ok(())
    }

    async fn apply_llm_outcome(
        &self,
        transactions: &[Transaction],
        pending: Vec<(usize, Cascade)>,
        outcome: BatchOutcome,
        sent: usize,
        slots: &mut [Option<CategorizationResult>],
    ) -> Result<()> {
        let per_transaction = if sent > 0 {
            outcome.actual_cost / sent as f64
        } else {
            0.0
        };

        for ((index, mut cascade), item) in pending.into_iter().zip(outcome.items) {
            if item.error.as_deref() == Some(CANCELLED) {
                continue;
            }
            let tx = &transactions[index];
            cascade.trace.llm_model = Some(outcome.model.clone());
            cascade.trace.llm_reasoning = item.reasoning.clone();

            let result = match item.category_id.filter(|_| item.error.is_none()) {
                Some(category_id) => CategorizationResult {
                    transaction_id: tx.id,
                    category_id: Some(category_id),
                    confidence: item.confidence,
                    method: Some(CategorizationMethod::LlmBased),
                    applied: true,
                    processing_time_ms: cascade.started.elapsed().as_millis() as u64,
                    cost_estimate: per_transaction,
                    explanation: item
                        .reasoning
                        .clone()
                        .unwrap_or_else(|| format!("Categorized by {}", outcome.model)),
                    error: None,
                    trace: cascade.trace,
                    user_corrected: false,
                },
                None => CategorizationResult {
                    transaction_id: tx.id,
                    category_id: None,
                    confidence: 0.0,
                    method: Some(CategorizationMethod::LlmBased),
                    applied: false,
                    processing_time_ms: cascade.started.elapsed().as_millis() as u64,
                    cost_estimate: per_transaction,
                    explanation: "LLM could not categorize this transaction".into(),
                    error: item.error,
                    trace: cascade.trace,
                    user_corrected: false,
                },
            };

            if result.applied {
                self.finish_applied(tx, &result).await?;
            } else {
                self.db.save_categorization(&result)?;
            }
            slots[index] = Some(result);
        }
        Ok(())
    }

    /// Persist an applied decision and feed it back into the cheaper stages
    async fn finish_applied(&self, tx: &Transaction, result: &CategorizationResult) -> Result<()> {
        self.db.save_categorization(result)?;

        if let Some(rag) = self.rag.as_ref().filter(|_| self.config.rag.embed_decided) {
            match rag.ensure_embedding(tx).await {
                Ok(_) => {}
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => warn!(transaction_id = tx.id, error = %e, "Could not embed decided transaction"),
            }
        }
        self.db.set_embedding_label(tx.id, result.category_id)?;

        if let (Some(category_id), Some(method)) = (result.category_id, result.method) {
            if method != CategorizationMethod::PatternBased
                && self.patterns.learn(tx, category_id, result.confidence)?
            {
                debug!(transaction_id = tx.id, category_id, "Learned merchant pattern");
            }
        }
        Ok(())
    }

    /// Transactions a batch run would cover
    pub fn select_transactions(&self, organization_id: i64, selection: &BatchSelection) -> Result<Vec<Transaction>> {
        let limit = selection.limit.unwrap_or(DEFAULT_BATCH_LIMIT).max(0);

        let mut selected = if !selection.transaction_ids.is_empty() {
            self.db
                .get_transactions_by_ids(organization_id, &selection.transaction_ids)?
        } else if let Some((from, to)) = selection.date_range {
            if from > to {
                return Err(Error::Validation(format!(
                    "Date range start {} is after end {}",
                    from, to
                )));
            }
            self.db
                .list_transactions_in_range(organization_id, from, to, limit)?
        } else {
            self.db.list_uncategorized(organization_id, limit)?
        };

        if !selection.force_recategorize {
            selected.retain(|tx| tx.category_id.is_none());
        }
        selected.truncate(limit as usize);
        Ok(selected)
    }

    /// Count, model and worst-case cost of a batch run
    pub fn estimate_batch(&self, organization_id: i64, selection: &BatchSelection) -> Result<BatchEstimate> {
        let count = self.select_transactions(organization_id, selection)?.len();
        self.estimate_for(organization_id, count)
    }

    fn estimate_for(&self, organization_id: i64, count: usize) -> Result<BatchEstimate> {
        let (model, estimated_max_cost) = match &self.llm {
            Some(llm) => {
                let model = llm.select_model(self.config.pipeline.model_strategy)?;
                (Some(model.name.clone()), llm.estimate_cost(count, model))
            }
            None => (None, 0.0),
        };

        let tracker = self.budget.get_cost_tracker(organization_id)?;
        let remaining_budget = self.budget.remaining(&tracker);
        Ok(BatchEstimate {
            transaction_count: count,
            model,
            estimated_max_cost,
            fits_budget: remaining_budget.map_or(true, |r| estimated_max_cost <= r + 1e-9),
            remaining_budget,
            tracker,
        })
    }

    /// Select, check the cost cap, and categorize
    pub async fn categorize_selection(
        &self,
        organization_id: i64,
        selection: &BatchSelection,
        cancel: &CancelFlag,
    ) -> Result<BatchReport> {
        let transactions = self.select_transactions(organization_id, selection)?;

        if let Some(max_cost) = selection.max_cost {
            let estimate = self.estimate_for(organization_id, transactions.len())?;
            if estimate.estimated_max_cost > max_cost {
                return Err(Error::Validation(format!(
                    "Estimated cost ${:.4} exceeds the ${:.4} cap",
                    estimate.estimated_max_cost, max_cost
                )));
            }
        }

        self.categorize_batch(&transactions, cancel).await
    }

    pub async fn status(&self, organization_id: i64) -> Result<PipelineStatus> {
        let llm_healthy = match &self.llm {
            Some(llm) => Some(llm.health_check().await),
            None => None,
        };
        let (requests_last_hour, cost_last_hour) = self.rate_limiter.usage();
        let tracker = self.budget.get_cost_tracker(organization_id)?;

        Ok(PipelineStatus {
            embedding_model: self.rag.as_ref().map(|rag| rag.model_name().to_string()),
            llm_healthy,
            requests_last_hour,
            cost_last_hour,
            remaining_budget: self.budget.remaining(&tracker),
            tracker,
        })
    }

    /// Embed already categorized transactions so they can vote in the RAG stage
    pub async fn backfill_embeddings(&self, organization_id: i64, limit: i64) -> Result<usize> {
        let rag = self
            .rag
            .as_ref()
            .ok_or_else(|| Error::Config("No embedder configured".into()))?;
        let transactions = self.db.list_categorized(organization_id, limit)?;
        rag.update_embeddings(&transactions).await
    }

    pub fn stats(&self, organization_id: i64) -> Result<CategorizationStats> {
        self.db.categorization_stats(organization_id)
    }
}

fn explain(stage: StageKind, trace: &MatchTrace) -> String {
    match stage {
        StageKind::Rule => trace
            .rule_matches
            .first()
            .map(|m| format!("Matched {} rule '{}'", m.rule_type.as_str(), m.pattern))
            .unwrap_or_else(|| "Matched rule".into()),
        StageKind::Pattern => trace
            .pattern_match
            .as_ref()
            .map(|m| format!("{} merchant pattern '{}'", capitalize(m.match_type.as_str()), m.pattern))
            .unwrap_or_else(|| "Merchant pattern".into()),
        StageKind::Rag => match trace.similarity_matches.first() {
            Some(top) => format!(
                "{} similar transactions, closest {:.2}",
                trace.similarity_matches.len(),
                top.similarity
            ),
            None => "Similar transactions".into(),
        },
    }
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ai::MockBackend;
    use crate::models::{NewCategoryRule, NewTransaction, PatternSource, RuleType};
    use chrono::NaiveDate;

    fn insert(db: &Database, merchant: &str, description: &str) -> Transaction {
        let id = db
            .insert_transaction(&NewTransaction {
                organization_id: 1,
                amount: -8.0,
                description: description.into(),
                merchant_name: Some(merchant.into()),
                date: NaiveDate::from_ymd_opt(2024, 6, 1).unwrap(),
            })
            .unwrap();
        db.get_transaction(id).unwrap().unwrap()
    }

    fn rule(db: &Database, category: i64, pattern: &str, confidence: f64) {
        db.create_rule(&NewCategoryRule {
            organization_id: 1,
            category_id: category,
            rule_type: RuleType::MerchantPattern,
            pattern: pattern.into(),
            confidence,
            priority: 1,
            case_sensitive: false,
            is_regex: false,
        })
        .unwrap();
    }

    #[test]
    fn test_stage_order_for_corrected_merchant() {
        let db = Database::in_memory().unwrap();
        let dining = db.create_category(1, "Dining", None, None, None).unwrap();
        let tx = insert(&db, "Blue Bottle", "coffee");

        let pipeline = Pipeline::builder(db.clone(), EngineConfig::default()).build().unwrap();
        assert_eq!(
            pipeline.stage_order_for(&tx).unwrap(),
            vec![StageKind::Rule, StageKind::Pattern, StageKind::Rag]
        );

        db.learn_merchant_pattern(1, "blue bottle", dining, 1.0, PatternSource::User)
            .unwrap();
        assert_eq!(
            pipeline.stage_order_for(&tx).unwrap(),
            vec![StageKind::Pattern, StageKind::Rule, StageKind::Rag]
        );

        let mut config = EngineConfig::default();
        config.pipeline.corrected_merchant_order = CorrectedMerchantOrder::RuleFirst;
        let rule_first = Pipeline::builder(db, config).build().unwrap();
        assert_eq!(rule_first.stage_order_for(&tx).unwrap()[0], StageKind::Rule);
    }

    #[tokio::test]
    async fn test_low_confidence_without_llm_is_suggestion() {
        let db = Database::in_memory().unwrap();
        let dining = db.create_category(1, "Dining", None, None, None).unwrap();
        rule(&db, dining, "CAFE*", 0.5);
        let tx = insert(&db, "CAFE ROMA", "espresso");

        let pipeline = Pipeline::builder(db.clone(), EngineConfig::default()).build().unwrap();
        let result = pipeline.categorize(&tx).await.unwrap();

        assert!(!result.applied);
        assert_eq!(result.category_id, Some(dining));
        assert_eq!(result.method, Some(CategorizationMethod::RuleBased));
        assert_eq!(result.trace.stages.len(), 2);
        assert_eq!(db.get_transaction(tx.id).unwrap().unwrap().category_id, None);
    }

    #[tokio::test]
    async fn test_applied_rule_teaches_pattern() {
        let db = Database::in_memory().unwrap();
        let dining = db.create_category(1, "Dining", None, None, None).unwrap();
        rule(&db, dining, "CAFE*", 0.95);
        let tx = insert(&db, "CAFE ROMA", "espresso");

        let pipeline = Pipeline::builder(db.clone(), EngineConfig::default()).build().unwrap();
        let result = pipeline.categorize(&tx).await.unwrap();

        assert!(result.applied);
        assert_eq!(result.explanation, "Matched merchant_pattern rule 'CAFE*'");
        let patterns = db.list_merchant_patterns(1).unwrap();
        assert_eq!(patterns.len(), 1);
        assert_eq!(patterns[0].pattern, "cafe roma");
        assert_eq!(patterns[0].source, PatternSource::Learned);
    }

    #[tokio::test]
    async fn test_embedder_failure_escalates() {
        let db = Database::in_memory().unwrap();
        db.create_category(1, "Dining", None, None, None).unwrap();
        let tx = insert(&db, "STARBUCKS", "coffee");

        let mock = Arc::new(MockBackend::new());
        mock.set_embeddings_failing(true);
        let pipeline = Pipeline::builder(db, EngineConfig::default())
            .embedder(mock.clone())
            .chat(mock.clone())
            .build()
            .unwrap();

        let result = pipeline.categorize(&tx).await.unwrap();
        assert_eq!(result.method, Some(CategorizationMethod::LlmBased));
        assert!(result.applied);
        let rag_trace = result.trace.stages.iter().find(|s| s.stage == "rag").unwrap();
        assert!(rag_trace.error.is_some());
        assert_eq!(mock.chat_calls(), 1);
    }

    #[tokio::test]
    async fn test_status_reports_backend_health() {
        let db = Database::in_memory().unwrap();

        let cheap_only = Pipeline::builder(db.clone(), EngineConfig::default()).build().unwrap();
        let status = cheap_only.status(1).await.unwrap();
        assert_eq!(status.llm_healthy, None);
        assert_eq!(status.embedding_model, None);
        assert_eq!(status.remaining_budget, Some(5.0));

        let down = Arc::new(MockBackend::unhealthy());
        let pipeline = Pipeline::builder(db, EngineConfig::default())
            .embedder(down.clone())
            .chat(down)
            .build()
            .unwrap();
        pipeline.rate_limiter().record_request(2, 0.01);

        let status = pipeline.status(1).await.unwrap();
        assert_eq!(status.llm_healthy, Some(false));
        assert_eq!(status.embedding_model.as_deref(), Some("mock-embed-v1"));
        assert_eq!(status.requests_last_hour, 2);
        assert!((status.cost_last_hour - 0.01).abs() < 1e-12);
    }

    #[test]
    fn test_select_transactions() {
        let db = Database::in_memory().unwrap();
        let dining = db.create_category(1, "Dining", None, None, None).unwrap();
        let a = insert(&db, "A", "a");
        let b = insert(&db, "B", "b");
        db.set_transaction_category(b.id, Some(dining), None).unwrap();

        let pipeline = Pipeline::builder(db, EngineConfig::default()).build().unwrap();
        let ids = BatchSelection {
            transaction_ids: vec![a.id, b.id],
            ..BatchSelection::default()
        };
        assert_eq!(pipeline.select_transactions(1, &ids).unwrap().len(), 1);

        let forced = BatchSelection {
            force_recategorize: true,
            ..ids.clone()
        };
        assert_eq!(pipeline.select_transactions(1, &forced).unwrap().len(), 2);
        assert!(pipeline.select_transactions(2, &forced).unwrap().is_empty());

        let bad_range = BatchSelection {
            date_range: Some((
                NaiveDate::from_ymd_opt(2024, 7, 1).unwrap(),
                NaiveDate::from_ymd_opt(2024, 6, 1).unwrap(),
            )),
            ..BatchSelection::default()
        };
        assert!(matches!(
            pipeline.select_transactions(1, &bad_range),
            Err(Error::Validation(_))
        ));
    }
}
