//! Database access layer with connection pooling and migrations
//!
//! This module is organized by domain:
//! - `transactions` - Transactions and their categorization metadata
//! - `categories` - Organization categories
//! - `rules` - Category rules and their usage statistics
//! - `patterns` - Merchant→category pattern cache
//! - `embeddings` - Transaction embeddings for similarity search
//! - `feedback` - Append-only categorization feedback and learning runs
//! - `costs` - Per-organization spend ledgers and LLM batch records

use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use tracing::debug;

use crate::error::Result;

mod categories;
mod costs;
mod embeddings;
mod feedback;
mod patterns;
mod rules;
mod transactions;


pub use costs::{SpendAdjustment, SpendReservation};
pub use embeddings::LabeledEmbedding;
pub use feedback::FeedbackRow;

pub type DbPool = Pool<SqliteConnectionManager>;
pub type DbConn = PooledConnection<SqliteConnectionManager>;

/// Parse a SQLite datetime string into a DateTime<Utc>
pub(crate) fn parse_datetime(s: &str) -> DateTime<Utc> {
    // SQLite stores as "YYYY-MM-DD HH:MM:SS" format
    chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
        .map(|dt| dt.and_utc())
        .unwrap_or_else(|_| Utc::now())
}

/// Parse a stored "YYYY-MM-DD" date
pub(crate) fn parse_date(s: &str) -> NaiveDate {
    NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap_or_default()
}

/// Database wrapper with connection pooling
#[derive(Clone)]
pub struct Database {
    pool: DbPool,
    /// Path to the database file
    db_path: String,
}

impl Database {
    /// Open (or create) a database file and run migrations
    pub fn new(path: &str) -> Result<Self> {
        let manager = SqliteConnectionManager::file(path).with_init(|conn| {
            // Budget reservations take write locks; wait instead of failing fast
            conn.busy_timeout(Duration::from_secs(5))?;
            conn.execute_batch("PRAGMA foreign_keys = ON;")?;
            Ok(())
        });

        let pool = Pool::builder().max_size(10).build(manager)?;

        let db = Self {
            pool,
            db_path: path.to_string(),
        };
        db.run_migrations()?;

        Ok(db)
    }

    /// Get the path to the database file
    pub fn path(&self) -> &str {
        &self.db_path
    }

    /// Create a throwaway database (for testing)
    ///
    /// Uses a temporary file rather than `:memory:` so every pooled
    /// connection sees the same data.
    pub fn in_memory() -> Result<Self> {
        use std::sync::atomic::{AtomicU64, Ordering};
        static COUNTER: AtomicU64 = AtomicU64::new(0);

        let id = COUNTER.fetch_add(1, Ordering::SeqCst);
        let path = std::env::temp_dir().join(format!(
            "tally_test_{}_{}.db",
            std::process::id(),
            id
        ));
        let path = path.to_string_lossy().to_string();

        // Remove any existing file
        let _ = std::fs::remove_file(&path);

        Self::new(&path)
    }

    /// Get a connection from the pool
    pub fn conn(&self) -> Result<DbConn> {
        Ok(self.pool.get()?)
    }

    fn run_migrations(&self) -> Result<()> {
        let conn = self.conn()?;

        conn.execute_batch(
            r#"
            -- WAL mode: readers don't block the budget writer
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA temp_store = MEMORY;

            -- Categories (read-only to the pipeline)
            CREATE TABLE IF NOT EXISTS categories (
                id INTEGER PRIMARY KEY,
                organization_id INTEGER NOT NULL,
                name TEXT NOT NULL,
                parent_id INTEGER REFERENCES categories(id),
                color TEXT,
                icon TEXT,
                created_at DATETIME DEFAULT CURRENT_TIMESTAMP,
                UNIQUE(organization_id, name)
            );

            -- Transactions
            -- categorization: JSON CategorizationResult from the latest attempt
            CREATE TABLE IF NOT EXISTS transactions (
                id INTEGER PRIMARY KEY,
                organization_id INTEGER NOT NULL,
                amount REAL NOT NULL,
                description TEXT NOT NULL,
                merchant_name TEXT,
                date DATE NOT NULL,
                category_id INTEGER REFERENCES categories(id),
                categorization TEXT,
                created_at DATETIME DEFAULT CURRENT_TIMESTAMP,
                updated_at DATETIME DEFAULT CURRENT_TIMESTAMP
            );

            CREATE INDEX IF NOT EXISTS idx_transactions_org_date ON transactions(organization_id, date);
            CREATE INDEX IF NOT EXISTS idx_transactions_org_category ON transactions(organization_id, category_id);

            -- Category rules (evaluated priority DESC, id ASC)
            CREATE TABLE IF NOT EXISTS category_rules (
                id INTEGER PRIMARY KEY,
                organization_id INTEGER NOT NULL,
                category_id INTEGER NOT NULL REFERENCES categories(id) ON DELETE CASCADE,
                rule_type TEXT NOT NULL,
                pattern TEXT NOT NULL,
                confidence REAL NOT NULL DEFAULT 0.9,
                priority INTEGER NOT NULL DEFAULT 0,
                case_sensitive INTEGER NOT NULL DEFAULT 0,
                is_regex INTEGER NOT NULL DEFAULT 0,
                usage_count INTEGER NOT NULL DEFAULT 0,
                correction_count INTEGER NOT NULL DEFAULT 0,
                success_rate REAL NOT NULL DEFAULT 1.0,
                created_at DATETIME DEFAULT CURRENT_TIMESTAMP,
                last_used_at DATETIME
            );

            CREATE INDEX IF NOT EXISTS idx_category_rules_org ON category_rules(organization_id, priority DESC);

            -- Merchant pattern cache
            -- One row per (merchant, category) so a correction can demote one
            -- mapping while promoting another
            CREATE TABLE IF NOT EXISTS merchant_patterns (
                id INTEGER PRIMARY KEY,
                organization_id INTEGER NOT NULL,
                merchant_pattern TEXT NOT NULL,
                category_id INTEGER NOT NULL REFERENCES categories(id) ON DELETE CASCADE,
                confidence REAL NOT NULL,
                usage_count INTEGER NOT NULL DEFAULT 0,
                source TEXT NOT NULL DEFAULT 'learned',
                last_used_at DATETIME,
                created_at DATETIME DEFAULT CURRENT_TIMESTAMP,
                updated_at DATETIME DEFAULT CURRENT_TIMESTAMP,
                UNIQUE(organization_id, merchant_pattern, category_id)
            );

            CREATE INDEX IF NOT EXISTS idx_merchant_patterns_lookup ON merchant_patterns(organization_id, merchant_pattern);

            -- Transaction embeddings (f32 little-endian BLOBs)
            CREATE TABLE IF NOT EXISTS transaction_embeddings (
                id INTEGER PRIMARY KEY,
                transaction_id INTEGER NOT NULL UNIQUE REFERENCES transactions(id) ON DELETE CASCADE,
                organization_id INTEGER NOT NULL,
                embedding BLOB NOT NULL,
                dimensions INTEGER NOT NULL,
                embedding_model TEXT NOT NULL,
                text_hash TEXT NOT NULL,
                category_id INTEGER REFERENCES categories(id),
                created_at DATETIME DEFAULT CURRENT_TIMESTAMP,
                updated_at DATETIME DEFAULT CURRENT_TIMESTAMP
            );

            CREATE INDEX IF NOT EXISTS idx_embeddings_org_label ON transaction_embeddings(organization_id, category_id);

            -- Categorization feedback (append-only)
            CREATE TABLE IF NOT EXISTS categorization_feedback (
                id INTEGER PRIMARY KEY,
                transaction_id INTEGER NOT NULL REFERENCES transactions(id),
                organization_id INTEGER NOT NULL,
                user_id TEXT NOT NULL,
                old_category_id INTEGER,
                new_category_id INTEGER,
                feedback_type TEXT NOT NULL,
                confidence_before REAL,
                method_used TEXT,
                merchant_key TEXT,
                created_at DATETIME DEFAULT CURRENT_TIMESTAMP
            );

            CREATE INDEX IF NOT EXISTS idx_feedback_org ON categorization_feedback(organization_id, id);
            CREATE INDEX IF NOT EXISTS idx_feedback_transaction ON categorization_feedback(transaction_id);

            -- Learning passes (high-water mark over feedback ids)
            CREATE TABLE IF NOT EXISTS learning_runs (
                id INTEGER PRIMARY KEY,
                organization_id INTEGER NOT NULL,
                feedback_high_water INTEGER NOT NULL,
                patterns_mined INTEGER NOT NULL DEFAULT 0,
                embeddings_relabeled INTEGER NOT NULL DEFAULT 0,
                ran_at DATETIME DEFAULT CURRENT_TIMESTAMP
            );

            CREATE INDEX IF NOT EXISTS idx_learning_runs_org ON learning_runs(organization_id, id);

            -- Per-organization spend ledger
            CREATE TABLE IF NOT EXISTS cost_trackers (
                organization_id INTEGER PRIMARY KEY,
                monthly_budget REAL NOT NULL,
                daily_budget REAL NOT NULL,
                current_spend REAL NOT NULL DEFAULT 0,
                monthly_spend REAL NOT NULL DEFAULT 0,
                transaction_count INTEGER NOT NULL DEFAULT 0,
                period_day TEXT NOT NULL,
                period_month TEXT NOT NULL,
                updated_at DATETIME DEFAULT CURRENT_TIMESTAMP
            );

            -- LLM batch calls
            CREATE TABLE IF NOT EXISTS llm_batches (
                id INTEGER PRIMARY KEY,
                organization_id INTEGER NOT NULL,
                model TEXT NOT NULL,
                transaction_count INTEGER NOT NULL,
                tokens_used INTEGER NOT NULL DEFAULT 0,
                estimated_cost REAL NOT NULL DEFAULT 0,
                actual_cost REAL NOT NULL DEFAULT 0,
                success_count INTEGER NOT NULL DEFAULT 0,
                avg_confidence REAL,
                processing_time_ms INTEGER NOT NULL DEFAULT 0,
                error_message TEXT,
                created_at DATETIME DEFAULT CURRENT_TIMESTAMP
            );

            CREATE INDEX IF NOT EXISTS idx_llm_batches_org ON llm_batches(organization_id, created_at);
            "#,
        )?;

        debug!("Migrations applied to {}", self.db_path);
        Ok(())
    }
}
