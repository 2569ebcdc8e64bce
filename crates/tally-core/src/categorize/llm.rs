//! LLM batch categorization
//!
//! Many transactions go out in one prompt and come back as one JSON array.
//! Every input transaction gets exactly one [`BatchItem`]: either a
//! resolved category or an explicit error. A failed call or an unparseable
//! response fails only the chunk it belongs to.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info, warn};

use super::CancelFlag;
use crate::ai::{decode_categorizations, ChatBackend, ChatMessage, ChatRequest, Decoded, LlmCategorization};
use crate::config::LlmSettings;
use crate::db::Database;
use crate::error::{Error, Result};
use crate::models::{Category, LlmModel, ModelStrategy, NewLlmBatchRecord, SimilarityMatch, Transaction};
use crate::prompts::{Prompt, PromptId, PromptLibrary};

pub const MISSING_FROM_RESPONSE: &str = "Transaction not found in LLM response";
pub const UNKNOWN_CATEGORY: &str = "Could not find matching category";
pub const CANCELLED: &str = "Cancelled before LLM call";

/// Pick a model from the catalog. Falls back to the default model, then
/// the first configured model.
pub fn select_model(models: &[LlmModel], strategy: ModelStrategy) -> Option<&LlmModel> {
    let by = |a: f64, b: f64| a.partial_cmp(&b).unwrap_or(std::cmp::Ordering::Equal);

    let picked = match strategy {
        ModelStrategy::Cost => models
            .iter()
            .min_by(|a, b| by(a.cost_per_1k_tokens, b.cost_per_1k_tokens)),
        ModelStrategy::Speed => models.iter().min_by(|a, b| {
            by(a.cost_per_1k_tokens, b.cost_per_1k_tokens).then(a.max_tokens.cmp(&b.max_tokens))
        }),
        ModelStrategy::Accuracy => models
            .iter()
            .max_by(|a, b| by(a.accuracy_score, b.accuracy_score)),
        ModelStrategy::Balanced => models
            .iter()
            .filter(|m| m.cost_per_1k_tokens > 0.0)
            .max_by(|a, b| {
                by(
                    a.accuracy_score / a.cost_per_1k_tokens,
                    b.accuracy_score / b.cost_per_1k_tokens,
                )
            }),
        ModelStrategy::Default => None,
    };

    picked
        .or_else(|| models.iter().find(|m| m.is_default))
        .or_else(|| models.first())
}

/// Advisory upper bound: n × avg tokens / 1000 × price
pub fn estimate_cost(settings: &LlmSettings, transactions: usize, model: &LlmModel) -> f64 {
    transactions as f64 * f64::from(settings.avg_tokens_per_transaction) / 1000.0
        * model.cost_per_1k_tokens
}

/// Outcome for one transaction in a batch
#[derive(Debug, Clone, PartialEq)]
pub struct BatchItem {
    pub transaction_id: i64,
    pub category_id: Option<i64>,
    pub confidence: f64,
    pub reasoning: Option<String>,
    pub error: Option<String>,
}

impl BatchItem {
    fn failed(transaction_id: i64, error: impl Into<String>) -> Self {
        Self {
            transaction_id,
            category_id: None,
            confidence: 0.0,
            reasoning: None,
            error: Some(error.into()),
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.category_id.is_some() && self.error.is_none()
    }
}

/// Items in input order plus the bill
#[derive(Debug, Clone)]
pub struct BatchOutcome {
    pub model: String,
    pub items: Vec<BatchItem>,
    pub tokens_used: u64,
    pub actual_cost: f64,
    pub chunks: usize,
    pub failed_chunks: usize,
}

impl BatchOutcome {
    pub fn resolved(&self) -> usize {
        self.items.iter().filter(|i| i.is_resolved()).count()
    }
}

pub struct LlmBatchEngine {
    db: Database,
    chat: Arc<dyn ChatBackend>,
    settings: LlmSettings,
    prompt: Prompt,
}

impl LlmBatchEngine {
    pub fn new(
        db: Database,
        chat: Arc<dyn ChatBackend>,
        settings: LlmSettings,
        prompts: &mut PromptLibrary,
    ) -> Result<Self> {
        if settings.models.is_empty() {
            return Err(Error::Config("llm.models must list at least one model".into()));
        }
        let prompt = prompts.get(PromptId::CategorizeBatch)?.clone();
        Ok(Self {
            db,
            chat,
            settings,
            prompt,
        })
    }

    /// Whether the chat backend is reachable
    pub async fn health_check(&self) -> bool {
        self.chat.health_check().await
    }

    pub fn settings(&self) -> &LlmSettings {
        &self.settings
    }

    pub fn select_model(&self, strategy: ModelStrategy) -> Result<&LlmModel> {
        select_model(&self.settings.models, strategy)
            .ok_or_else(|| Error::Config("No LLM models configured".into()))
    }

    pub fn estimate_cost(&self, transactions: usize, model: &LlmModel) -> f64 {
        estimate_cost(&self.settings, transactions, model)
    }

    /// Render (system, user) messages for one chunk
    pub fn build_prompt(
        &self,
        transactions: &[Transaction],
        categories: &[Category],
        hints: &HashMap<i64, Vec<SimilarityMatch>>,
    ) -> (String, String) {
        let names: HashMap<i64, &str> = categories.iter().map(|c| (c.id, c.name.as_str())).collect();

        let category_lines = categories
            .iter()
            .map(|c| format!("- {} (ID: {})", c.name, c.id))
            .collect::<Vec<_>>()
            .join("\n");

        let transaction_lines = transactions
            .iter()
            .enumerate()
            .map(|(i, tx)| {
                format!(
                    "{}. ID: {} | Amount: {:.2} | Merchant: {} | Description: {} | Date: {}",
                    i + 1,
                    tx.id,
                    tx.amount,
                    sanitize(tx.merchant_name.as_deref().unwrap_or("unknown")),
                    sanitize(&tx.description),
                    tx.date
                )
            })
            .collect::<Vec<_>>()
            .join("\n");

        let hint_lines = transactions
            .iter()
            .flat_map(|tx| {
                hints.get(&tx.id).into_iter().flatten().map(|m| {
                    format!(
                        "* Transaction {} resembles \"{}\" -> {} (similarity {:.2})",
                        tx.id,
                        sanitize(m.merchant_name.as_deref().unwrap_or(&m.description)),
                        names.get(&m.category_id).copied().unwrap_or("unknown"),
                        m.similarity
                    )
                })
            })
            .collect::<Vec<_>>()
            .join("\n");

        let mut vars = HashMap::new();
        vars.insert("categories", category_lines.as_str());
        vars.insert("transactions", transaction_lines.as_str());
        vars.insert("hints", hint_lines.as_str());

        (self.prompt.render_system(&vars), self.prompt.render_user(&vars))
    }

    /// Categorize transactions in chunks of at most `max_batch_size`
    pub async fn categorize_batch(
        &self,
        organization_id: i64,
        transactions: &[Transaction],
        categories: &[Category],
        model: &LlmModel,
        hints: &HashMap<i64, Vec<SimilarityMatch>>,
        cancel: &CancelFlag,
    ) -> Result<BatchOutcome> {
        let mut outcome = BatchOutcome {
            model: model.name.clone(),
            items: Vec::with_capacity(transactions.len()),
            tokens_used: 0,
            actual_cost: 0.0,
            chunks: 0,
            failed_chunks: 0,
        };

        for chunk in transactions.chunks(self.settings.max_batch_size.max(1)) {
            if cancel.is_cancelled() {
                outcome
                    .items
                    .extend(chunk.iter().map(|tx| BatchItem::failed(tx.id, CANCELLED)));
                continue;
            }

            outcome.chunks += 1;
            let (items, tokens, failed) = self
                .run_chunk(organization_id, chunk, categories, model, hints)
                .await?;
            if failed {
                outcome.failed_chunks += 1;
            }
            outcome.tokens_used += tokens;
            outcome.items.extend(items);
        }

        outcome.actual_cost = outcome.tokens_used as f64 / 1000.0 * model.cost_per_1k_tokens;
        info!(
            organization_id,
            model = %model.name,
            transactions = transactions.len(),
            resolved = outcome.resolved(),
            tokens = outcome.tokens_used,
            cost = outcome.actual_cost,
            "LLM batch complete"
        );
        Ok(outcome)
    }

    async fn run_chunk(
        &self,
        organization_id: i64,
        chunk: &[Transaction],
        categories: &[Category],
        model: &LlmModel,
        hints: &HashMap<i64, Vec<SimilarityMatch>>,
    ) -> Result<(Vec<BatchItem>, u64, bool)> {
        let start = Instant::now();
        let (system, user) = self.build_prompt(chunk, categories, hints);

        let wanted = self
            .settings
            .max_tokens
            .max(self.settings.response_tokens_per_transaction.saturating_mul(chunk.len() as u32));
        let request = ChatRequest {
            model: model.name.clone(),
            messages: vec![ChatMessage::system(system), ChatMessage::user(user)],
            temperature: self.settings.temperature,
            max_tokens: wanted.min(model.max_tokens),
        };

        let (items, tokens, error) = match self.chat.complete(&request).await {
            Err(e) => {
                warn!(model = %model.name, error = %e, "LLM request failed");
                let message = format!("LLM request failed: {}", e);
                (
                    chunk.iter().map(|tx| BatchItem::failed(tx.id, &message)).collect(),
                    0,
                    Some(message),
                )
            }
            Ok(completion) => {
                let tokens = u64::from(completion.tokens_used);
                match decode_categorizations(&completion.text) {
                    Decoded::Unparseable { reason, raw } => {
                        warn!(model = %model.name, %reason, %raw, "Unparseable LLM response");
                        let message = format!("Unparseable LLM response: {}", reason);
                        (
                            chunk.iter().map(|tx| BatchItem::failed(tx.id, &message)).collect(),
                            tokens,
                            Some(message),
                        )
                    }
                    decoded => {
                        debug!(state = decoded.state(), "Decoded LLM response");
                        let parsed = decoded.into_value().unwrap_or_default();
                        (match_results(chunk, categories, parsed), tokens, None)
                    }
                }
            }
        };

        let resolved: Vec<&BatchItem> = items.iter().filter(|i| i.is_resolved()).collect();
        let avg_confidence = (!resolved.is_empty())
            .then(|| resolved.iter().map(|i| i.confidence).sum::<f64>() / resolved.len() as f64);

        self.db.insert_llm_batch(&NewLlmBatchRecord {
            organization_id,
            model: model.name.clone(),
            transaction_count: chunk.len() as i64,
            tokens_used: tokens as i64,
            estimated_cost: self.estimate_cost(chunk.len(), model),
            actual_cost: tokens as f64 / 1000.0 * model.cost_per_1k_tokens,
            success_count: resolved.len() as i64,
            avg_confidence,
            processing_time_ms: start.elapsed().as_millis() as i64,
            error_message: error.clone(),
        })?;

        Ok((items, tokens, error.is_some()))
    }
}

/// Keep prompt lines parseable: the field separator never appears in values
fn sanitize(value: &str) -> String {
    value.replace(['|', '\n', '\r'], " ").trim().to_string()
}

/// Pair each transaction with its entry in the response
fn match_results(
    chunk: &[Transaction],
    categories: &[Category],
    parsed: Vec<LlmCategorization>,
) -> Vec<BatchItem> {
    let mut by_id: HashMap<i64, LlmCategorization> = HashMap::new();
    for entry in parsed {
        by_id.entry(entry.transaction_id).or_insert(entry);
    }

    chunk
        .iter()
        .map(|tx| {
            let Some(entry) = by_id.remove(&tx.id) else {
                return BatchItem::failed(tx.id, MISSING_FROM_RESPONSE);
            };

            let category = entry
                .category_id
                .and_then(|id| categories.iter().find(|c| c.id == id))
                .or_else(|| {
                    let name = entry.category_name.as_deref()?.trim();
                    categories.iter().find(|c| c.name.eq_ignore_ascii_case(name))
                });

            match category {
                Some(category) => BatchItem {
                    transaction_id: tx.id,
                    category_id: Some(category.id),
                    confidence: if entry.confidence.is_nan() {
                        0.0
                    } else {
                        entry.confidence.clamp(0.0, 1.0)
                    },
                    reasoning: entry.reasoning,
                    error: None,
                },
                None => BatchItem {
                    reasoning: entry.reasoning,
                    ..BatchItem::failed(tx.id, UNKNOWN_CATEGORY)
                },
            }
        })
        .collect()
}
