//! Mock backend for testing
//!
//! Implements both capabilities without a network:
//! - chat: scripted responses first, otherwise a keyword classifier that
//!   reads the categories and transactions out of the rendered prompt
//! - embeddings: registered vectors for exact texts, otherwise a hashed
//!   bag-of-words vector (deterministic across runs)

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use regex::Regex;
use sha2::{Digest, Sha256};

use super::{ChatBackend, ChatCompletion, ChatRequest, Embedder};
use crate::error::{Error, Result};

const MOCK_DIMENSIONS: usize = 64;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Mock AI backend for testing
pub struct MockBackend {
    /// Whether health_check should return true
    pub healthy: bool,
    model: String,
    chat_responses: Mutex<VecDeque<String>>,
    embeddings: Mutex<HashMap<String, Vec<f32>>>,
    requests: Mutex<Vec<ChatRequest>>,
    embed_calls: AtomicUsize,
    fail_chat: AtomicBool,
    fail_embeddings: AtomicBool,
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MockBackend {
    /// Create a new mock backend (healthy by default)
    pub fn new() -> Self {
        Self {
            healthy: true,
            model: "mock-embed-v1".to_string(),
            chat_responses: Mutex::new(VecDeque::new()),
            embeddings: Mutex::new(HashMap::new()),
            requests: Mutex::new(Vec::new()),
            embed_calls: AtomicUsize::new(0),
            fail_chat: AtomicBool::new(false),
            fail_embeddings: AtomicBool::new(false),
        }
    }

    /// Create an unhealthy mock backend
    pub fn unhealthy() -> Self {
        Self {
            healthy: false,
            ..Self::new()
        }
    }

    /// Queue a raw chat response (returned before falling back to the classifier)
    pub fn with_chat_response(self, response: impl Into<String>) -> Self {
        self.push_chat_response(response);
        self
    }

    /// Register a fixed vector for an exact embedding input
    pub fn with_embedding(self, text: impl Into<String>, vector: Vec<f32>) -> Self {
        lock(&self.embeddings).insert(text.into(), vector);
        self
    }

    /// Use a different embedding model name
    pub fn with_embedding_model(mut self, model: &str) -> Self {
        self.model = model.to_string();
        self
    }

    pub fn push_chat_response(&self, response: impl Into<String>) {
        lock(&self.chat_responses).push_back(response.into());
    }

    /// Make every chat call fail until reset
    pub fn set_chat_failing(&self, failing: bool) {
        self.fail_chat.store(failing, Ordering::SeqCst);
    }

    /// Make every embedding call fail until reset
    pub fn set_embeddings_failing(&self, failing: bool) {
        self.fail_embeddings.store(failing, Ordering::SeqCst);
    }

    /// Chat requests received so far
    pub fn requests(&self) -> Vec<ChatRequest> {
        lock(&self.requests).clone()
    }

    pub fn chat_calls(&self) -> usize {
        lock(&self.requests).len()
    }

    pub fn embed_calls(&self) -> usize {
        self.embed_calls.load(Ordering::SeqCst)
    }

    /// Keyword classification over the transactions listed in a prompt
    fn classify_prompt(prompt: &str) -> Result<String> {
        let category_re = Regex::new(r"(?m)^- (.+?) \(ID: (\d+)\)\s*$")?;
        let tx_re = Regex::new(
            r"(?m)^\d+\. ID: (\d+) \| Amount: [^|]* \| Merchant: ([^|]*) \| Description: ([^|]*) \|",
        )?;

        let categories: Vec<(String, i64)> = category_re
            .captures_iter(prompt)
            .filter_map(|c| Some((c[1].trim().to_string(), c[2].parse().ok()?)))
            .collect();

        let mut results = Vec::new();
        for caps in tx_re.captures_iter(prompt) {
            let Ok(transaction_id) = caps[1].parse::<i64>() else {
                continue;
            };
            let text = format!("{} {}", &caps[2], &caps[3]).to_uppercase();
            let guess = guess_category(&text);

            let entry = match categories
                .iter()
                .find(|(name, _)| name.eq_ignore_ascii_case(guess))
            {
                Some((name, id)) => serde_json::json!({
                    "transaction_id": transaction_id,
                    "category_id": id,
                    "category_name": name,
                    "confidence": 0.85,
                    "reasoning": format!("Merchant text suggests {}", name),
                }),
                None => serde_json::json!({
                    "transaction_id": transaction_id,
                    "category_name": "Other",
                    "confidence": 0.3,
                    "reasoning": "No recognizable merchant",
                }),
            };
            results.push(entry);
        }

        Ok(serde_json::Value::Array(results).to_string())
    }
}

fn guess_category(text: &str) -> &'static str {
    match text {
        t if t.contains("STARBUCKS") || t.contains("COFFEE") || t.contains("RESTAURANT") => {
            "Dining"
        }
        t if t.contains("NETFLIX") || t.contains("SPOTIFY") || t.contains("HULU") => {
            "Subscriptions"
        }
        t if t.contains("WHOLE FOODS") || t.contains("WHOLEFDS") || t.contains("SAFEWAY") => {
            "Groceries"
        }
        t if t.contains("UBER") || t.contains("LYFT") || t.contains("SHELL") || t.contains("CHEVRON") => {
            "Transport"
        }
        t if t.contains("AIRLINE") || t.contains("HOTEL") || t.contains("DELTA") || t.contains("MARRIOTT") => {
            "Travel"
        }
        t if t.contains("AMAZON") || t.contains("COSTCO") || t.contains("TARGET") => "Shopping",
        _ => "Other",
    }
}

/// Hashed bag-of-words embedding, L2-normalized
fn hashed_embedding(text: &str) -> Vec<f32> {
    let mut vector = vec![0.0f32; MOCK_DIMENSIONS];

    for token in text
        .to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
    {
        let digest = Sha256::digest(token.as_bytes());
        let bucket = u16::from_le_bytes([digest[0], digest[1]]) as usize % MOCK_DIMENSIONS;
        let sign = if digest[2] & 1 == 0 { 1.0 } else { -1.0 };
        vector[bucket] += sign;
    }

    let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in &mut vector {
            *x /= norm;
        }
    }
    vector
}

#[async_trait]
impl ChatBackend for MockBackend {
    async fn complete(&self, request: &ChatRequest) -> Result<ChatCompletion> {
        lock(&self.requests).push(request.clone());

        if self.fail_chat.load(Ordering::SeqCst) {
            return Err(Error::Ai("mock chat backend unavailable".into()));
        }

        let scripted = lock(&self.chat_responses).pop_front();
        let text = match scripted {
            Some(text) => text,
            None => {
                let prompt = request
                    .messages
                    .iter()
                    .map(|m| m.content.as_str())
                    .collect::<Vec<_>>()
                    .join("\n");
                Self::classify_prompt(&prompt)?
            }
        };

        let prompt_chars: usize = request.messages.iter().map(|m| m.content.len()).sum();
        let tokens_used = ((prompt_chars + text.len()) / 4 + 1) as u32;

        Ok(ChatCompletion { text, tokens_used })
    }

    async fn health_check(&self) -> bool {
        self.healthy && !self.fail_chat.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Embedder for MockBackend {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        self.embed_calls.fetch_add(1, Ordering::SeqCst);

        if self.fail_embeddings.load(Ordering::SeqCst) {
            return Err(Error::Ai("mock embedder unavailable".into()));
        }

        if let Some(vector) = lock(&self.embeddings).get(text) {
            return Ok(vector.clone());
        }
        Ok(hashed_embedding(text))
    }
}
