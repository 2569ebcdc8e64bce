//! Pluggable AI capability abstraction
//!
//! The pipeline consumes two opaque capabilities:
//!
//! - `Embedder`: text → fixed-length vector, used by the RAG stage
//! - `ChatBackend`: chat completion with token accounting, used by the
//!   LLM batch stage
//!
//! Concrete network clients live outside this crate and implement these
//! traits. `MockBackend` implements both deterministically for tests and
//! offline CLI runs.
//!
//! # Usage
//!
//! ```rust,ignore
//! let backend = Arc::new(MockBackend::new());
//! let pipeline = Pipeline::builder(db, config)
//!     .embedder(backend.clone())
//!     .chat(backend)
//!     .build()?;
//! ```

mod mock;
pub mod parsing;

pub use mock::MockBackend;
pub use parsing::{decode_categorizations, Decoded, LlmCategorization};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Speaker of a chat message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
        }
    }
}

/// A chat completion request
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub temperature: f32,
    pub max_tokens: u32,
}

/// A chat completion response
#[derive(Debug, Clone)]
pub struct ChatCompletion {
    pub text: String,
    /// Prompt + completion tokens billed for the call
    pub tokens_used: u32,
}

/// Chat completion capability (LLM stage)
#[async_trait]
pub trait ChatBackend: Send + Sync {
    async fn complete(&self, request: &ChatRequest) -> Result<ChatCompletion>;

    /// Check if the backend is available
    async fn health_check(&self) -> bool;
}

/// Text embedding capability (RAG stage)
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Identifier stored alongside each embedding; vectors from different
    /// models are never compared
    fn model_name(&self) -> &str;

    async fn embed(&self, text: &str) -> Result<Vec<f32>>;
}
