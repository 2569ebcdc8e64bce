//! Test utilities for tally-core
//!
//! Builders for the fixtures most tests need: a database with the default
//! categories, and transactions inserted with only the fields a test cares
//! about.

use std::collections::HashMap;

use chrono::NaiveDate;

use crate::db::Database;
use crate::models::{NewCategoryRule, NewTransaction, RuleType, Transaction};

/// A fresh database with the default categories seeded for `organization_id`
pub struct SeededDb {
    pub db: Database,
    pub organization_id: i64,
    categories: HashMap<String, i64>,
}

impl SeededDb {
    pub fn new(organization_id: i64) -> Self {
        let db = Database::in_memory().unwrap();
        db.seed_default_categories(organization_id).unwrap();
        let categories = db
            .list_categories(organization_id)
            .unwrap()
            .into_iter()
            .map(|c| (c.name, c.id))
            .collect();

        Self {
            db,
            organization_id,
            categories,
        }
    }

    /// Category id by name; panics if the category was not seeded
    pub fn category(&self, name: &str) -> i64 {
        *self
            .categories
            .get(name)
            .unwrap_or_else(|| panic!("no seeded category named {}", name))
    }

    pub fn tx(&self, merchant: &str) -> TransactionBuilder<'_> {
        TransactionBuilder::new(&self.db, self.organization_id).merchant(merchant)
    }

    /// Merchant wildcard rule at priority 1
    pub fn merchant_rule(&self, pattern: &str, category: &str, confidence: f64) -> i64 {
        self.db
            .create_rule(&NewCategoryRule {
                organization_id: self.organization_id,
                category_id: self.category(category),
                rule_type: RuleType::MerchantPattern,
                pattern: pattern.to_string(),
                confidence,
                priority: 1,
                case_sensitive: false,
                is_regex: false,
            })
            .unwrap()
    }
}

/// Inserts a transaction with sensible defaults
pub struct TransactionBuilder<'a> {
    db: &'a Database,
    tx: NewTransaction,
    category_id: Option<i64>,
}

impl<'a> TransactionBuilder<'a> {
    pub fn new(db: &'a Database, organization_id: i64) -> Self {
        Self {
            db,
            tx: NewTransaction {
                organization_id,
                amount: -10.0,
                description: "CARD PURCHASE".to_string(),
                merchant_name: None,
                date: NaiveDate::from_ymd_opt(2024, 6, 15).unwrap(),
            },
            category_id: None,
        }
    }

    pub fn merchant(mut self, merchant: &str) -> Self {
        self.tx.merchant_name = Some(merchant.to_string());
        self
    }

    pub fn description(mut self, description: &str) -> Self {
        self.tx.description = description.to_string();
        self
    }

    pub fn amount(mut self, amount: f64) -> Self {
        self.tx.amount = amount;
        self
    }

    pub fn date(mut self, date: NaiveDate) -> Self {
        self.tx.date = date;
        self
    }

    /// Store the transaction as already categorized
    pub fn categorized(mut self, category_id: i64) -> Self {
        self.category_id = Some(category_id);
        self
    }

    pub fn insert(self) -> Transaction {
        let id = self.db.insert_transaction(&self.tx).unwrap();
        if self.category_id.is_some() {
            self.db
                .set_transaction_category(id, self.category_id, None)
                .unwrap();
        }
        self.db.get_transaction(id).unwrap().unwrap()
    }
}
