//! Rule engine
//!
//! Rules are evaluated in a total order (priority descending, then id
//! ascending) and the first match wins with the rule's stored confidence.
//! Malformed rules are rejected when written; a rule that still fails to
//! compile at evaluation time is skipped with a warning.

use async_trait::async_trait;
use regex::{Regex, RegexBuilder};
use tracing::{debug, warn};

use super::usage::{UsageEvent, UsageRecorder};
use super::{Evidence, ScoredResult, Stage, StageKind};
use crate::db::Database;
use crate::error::{Error, Result};
use crate::models::{CategoryRule, NewCategoryRule, RuleMatch, RuleTestResult, RuleType, Transaction};

/// Categorized history replayed by `test_rule`
const RULE_TEST_HISTORY: i64 = 5000;

#[derive(Debug)]
enum Matcher {
    /// Anchored wildcard or free regex against merchant_name
    Merchant(Regex),
    /// Lowercased needle unless case-sensitive
    Keyword(String),
    KeywordRegex(Regex),
    Amount { min: Option<f64>, max: Option<f64> },
    /// Against "description merchant_name"
    Text(Regex),
}

/// A rule ready to be matched against transactions
#[derive(Debug)]
struct CompiledRule {
    matcher: Matcher,
    case_sensitive: bool,
}

impl CompiledRule {
    fn compile(rule_type: RuleType, pattern: &str, case_sensitive: bool, is_regex: bool) -> Result<Self> {
        let build = |source: &str| {
            RegexBuilder::new(source)
                .case_insensitive(!case_sensitive)
                .build()
                .map_err(|e| Error::Validation(format!("Invalid regex '{}': {}", pattern, e)))
        };

        let matcher = match rule_type {
            RuleType::MerchantPattern if is_regex => Matcher::Merchant(build(pattern)?),
            RuleType::MerchantPattern => Matcher::Merchant(build(&wildcard_to_regex(pattern))?),
            RuleType::DescriptionKeyword if is_regex => Matcher::KeywordRegex(build(pattern)?),
            RuleType::DescriptionKeyword => Matcher::Keyword(if case_sensitive {
                pattern.to_string()
            } else {
                pattern.to_lowercase()
            }),
            RuleType::AmountRange => {
                let (min, max) = parse_amount_range(pattern)?;
                Matcher::Amount { min, max }
            }
            RuleType::RegexPattern => Matcher::Text(build(pattern)?),
        };

        Ok(Self {
            matcher,
            case_sensitive,
        })
    }

    fn from_rule(rule: &CategoryRule) -> Result<Self> {
        Self::compile(rule.rule_type, &rule.pattern, rule.case_sensitive, rule.is_regex)
    }

    fn matches(&self, tx: &Transaction) -> bool {
        match &self.matcher {
            Matcher::Merchant(re) => tx.merchant_name.as_deref().is_some_and(|m| re.is_match(m)),
            Matcher::Keyword(needle) => {
                if self.case_sensitive {
                    tx.description.contains(needle.as_str())
                } else {
                    tx.description.to_lowercase().contains(needle.as_str())
                }
            }
            Matcher::KeywordRegex(re) => re.is_match(&tx.description),
            Matcher::Amount { min, max } => {
                min.map_or(true, |min| tx.amount >= min) && max.map_or(true, |max| tx.amount <= max)
            }
            Matcher::Text(re) => {
                let text = format!(
                    "{} {}",
                    tx.description,
                    tx.merchant_name.as_deref().unwrap_or("")
                );
                re.is_match(&text)
            }
        }
    }
}

/// Convert a `*` / `?` wildcard into an anchored regex
fn wildcard_to_regex(pattern: &str) -> String {
    let escaped = regex::escape(pattern)
        .replace(r"\*", ".*")
        .replace(r"\?", ".");
    format!("^{}$", escaped)
}

/// Parse "min,max" where either side may be empty
pub fn parse_amount_range(pattern: &str) -> Result<(Option<f64>, Option<f64>)> {
    let (min, max) = pattern.split_once(',').ok_or_else(|| {
        Error::Validation(format!(
            "Amount range '{}' must be \"min,max\" (either side may be empty)",
            pattern
        ))
    })?;

    let parse_bound = |s: &str| -> Result<Option<f64>> {
        let s = s.trim();
        if s.is_empty() {
            return Ok(None);
        }
        match s.parse::<f64>() {
            Ok(v) if v.is_finite() => Ok(Some(v)),
            _ => Err(Error::Validation(format!("Invalid amount bound '{}'", s))),
        }
    };

    let (min, max) = (parse_bound(min)?, parse_bound(max)?);
    if let (Some(lo), Some(hi)) = (min, max) {
        if lo > hi {
            return Err(Error::Validation(format!(
                "Amount range minimum {} exceeds maximum {}",
                lo, hi
            )));
        }
    }

    Ok((min, max))
}

/// Check rule fields without touching storage
pub fn validate_rule(rule: &NewCategoryRule) -> Result<()> {
    if !(0.0..=1.0).contains(&rule.confidence) {
        return Err(Error::Validation(format!(
            "Confidence must be between 0 and 1 (got {})",
            rule.confidence
        )));
    }
    if rule.priority < 0 {
        return Err(Error::Validation(format!(
            "Priority must be non-negative (got {})",
            rule.priority
        )));
    }
    if rule.pattern.trim().is_empty() {
        return Err(Error::Validation("Rule pattern cannot be empty".into()));
    }
    CompiledRule::compile(rule.rule_type, &rule.pattern, rule.case_sensitive, rule.is_regex)?;
    Ok(())
}

fn sort_rules(rules: &mut [CategoryRule]) {
    rules.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.id.cmp(&b.id)));
}

/// Evaluates and manages organization rules
#[derive(Clone)]
pub struct RuleEngine {
    db: Database,
    usage: UsageRecorder,
}

impl RuleEngine {
    pub fn new(db: Database, usage: UsageRecorder) -> Self {
        Self { db, usage }
    }

    /// First matching rule for a transaction, if any
    pub fn evaluate_rules(&self, tx: &Transaction) -> Result<Option<RuleMatch>> {
        let mut rules = self.db.list_rules(tx.organization_id)?;
        sort_rules(&mut rules);

        for rule in &rules {
            let compiled = match CompiledRule::from_rule(rule) {
                Ok(compiled) => compiled,
                Err(e) => {
                    warn!(rule_id = rule.id, error = %e, "Skipping malformed rule");
                    continue;
                }
            };

            if compiled.matches(tx) {
                debug!(
                    rule_id = rule.id,
                    transaction_id = tx.id,
                    category_id = rule.category_id,
                    "Rule matched"
                );
                self.usage.record(UsageEvent::RuleMatched { rule_id: rule.id });
                return Ok(Some(RuleMatch {
                    rule_id: rule.id,
                    category_id: rule.category_id,
                    confidence: rule.confidence,
                    rule_type: rule.rule_type,
                    pattern: rule.pattern.clone(),
                }));
            }
        }

        Ok(None)
    }

    /// Validate and store a new rule
    pub fn add_rule(&self, rule: &NewCategoryRule) -> Result<CategoryRule> {
        validate_rule(rule)?;
        self.check_category(rule)?;

        let id = self.db.create_rule(rule)?;
        self.db
            .get_rule(id)?
            .ok_or_else(|| Error::NotFound(format!("Rule {}", id)))
    }

    /// Validate and replace a rule's editable fields
    pub fn update_rule(&self, id: i64, rule: &NewCategoryRule) -> Result<CategoryRule> {
        let existing = self
            .db
            .get_rule(id)?
            .filter(|r| r.organization_id == rule.organization_id)
            .ok_or_else(|| Error::NotFound(format!("Rule {}", id)))?;

        validate_rule(rule)?;
        self.check_category(rule)?;

        self.db.update_rule(existing.id, rule)?;
        self.db
            .get_rule(id)?
            .ok_or_else(|| Error::NotFound(format!("Rule {}", id)))
    }

    pub fn delete_rule(&self, organization_id: i64, id: i64) -> Result<bool> {
        self.db.delete_rule(organization_id, id)
    }

    /// Rules in evaluation order
    pub fn list_rules(&self, organization_id: i64) -> Result<Vec<CategoryRule>> {
        let mut rules = self.db.list_rules(organization_id)?;
        sort_rules(&mut rules);
        Ok(rules)
    }

    /// Replay a candidate rule against categorized history
    pub fn test_rule(&self, rule: &NewCategoryRule, example_limit: usize) -> Result<RuleTestResult> {
        validate_rule(rule)?;
        let compiled =
            CompiledRule::compile(rule.rule_type, &rule.pattern, rule.case_sensitive, rule.is_regex)?;

        let history = self
            .db
            .list_categorized(rule.organization_id, RULE_TEST_HISTORY)?;

        let mut matched = 0;
        let mut agreeing = 0;
        let mut examples = Vec::new();
        for tx in history.into_iter().filter(|tx| compiled.matches(tx)) {
            matched += 1;
            if tx.category_id == Some(rule.category_id) {
                agreeing += 1;
            }
            if examples.len() < example_limit {
                examples.push(tx);
            }
        }

        Ok(RuleTestResult {
            matched,
            agreeing,
            accuracy: if matched > 0 {
                agreeing as f64 / matched as f64
            } else {
                0.0
            },
            examples,
        })
    }

    fn check_category(&self, rule: &NewCategoryRule) -> Result<()> {
        if !self
            .db
            .category_belongs_to(rule.category_id, rule.organization_id)?
        {
            return Err(Error::Validation(format!(
                "Category {} does not belong to organization {}",
                rule.category_id, rule.organization_id
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl Stage for RuleEngine {
    fn kind(&self) -> StageKind {
        StageKind::Rule
    }

    async fn evaluate(&self, transaction: &Transaction) -> Result<ScoredResult> {
        Ok(match self.evaluate_rules(transaction)? {
            Some(rule_match) => ScoredResult {
                category_id: Some(rule_match.category_id),
                confidence: rule_match.confidence,
                evidence: Evidence::Rule(rule_match),
            },
            None => ScoredResult::empty(),
        })
    }
}
