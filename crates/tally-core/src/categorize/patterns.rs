//! Merchant pattern cache
//!
//! Maps normalized merchant names to categories. Lookups try an exact key
//! first, then fuzzy (Levenshtein) and partial (substring) matches whose
//! confidence is scaled down by match quality. Confident decisions from
//! the other stages teach the cache; user feedback reinforces or demotes
//! entries. Entries are never deleted automatically.

use std::cmp::Ordering;
use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use tracing::debug;

use super::usage::{UsageEvent, UsageRecorder};
use super::{Evidence, ScoredResult, Stage, StageKind};
use crate::config::PatternSettings;
use crate::db::Database;
use crate::error::Result;
use crate::models::{MatchType, MerchantPattern, PatternMatch, PatternSource, SimilarPattern, Transaction};

/// Trim, collapse internal whitespace and case-fold
pub fn normalize_merchant(name: &str) -> String {
    name.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Card processor markers ("SQ *", "- DEBIT", "CHECKCARD", "DEBIT CARD")
static PROCESSOR_MARKERS: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(r"(?i)\*|\s*-\s*(?:debit|credit|checkcard)\b|\b(?:debit card|credit card|checkcard)\b").ok()
});

/// Store numbers, ZIP codes and reference ids
static REFERENCE_NUMBERS: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(r"(?i)\bref\s*#\s*[a-z0-9]+|\btxn\s+[a-z0-9]+|#\s*\d+|\b\d{4,}\b").ok()
});

static BUSINESS_SUFFIX: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"(?i)[\s,]+(?:llc|inc|corp|ltd|co)\.?$").ok());

const FILLER_WORDS: &[&str] = &["the", "and", "&", "of", "at", "in", "on"];

fn scrub(pattern: &LazyLock<Option<Regex>>, text: &str) -> String {
    match LazyLock::force(pattern) {
        Some(re) => re.replace_all(text, " ").into_owned(),
        None => text.to_string(),
    }
}

/// Normalized merchant name with processor markers, store numbers,
/// reference ids and business suffixes removed. Falls back to the plain
/// normalized name when cleaning would leave nothing.
pub fn clean_merchant_name(name: &str) -> String {
    let scrubbed = scrub(&REFERENCE_NUMBERS, &scrub(&PROCESSOR_MARKERS, name));
    let mut cleaned = normalize_merchant(&scrubbed);

    if let Some(suffix) = LazyLock::force(&BUSINESS_SUFFIX) {
        while let Some(m) = suffix.find(&cleaned) {
            if m.start() == 0 {
                break;
            }
            cleaned.truncate(m.start());
        }
    }

    let cleaned = cleaned
        .trim_end_matches(|c: char| c == '-' || c == ',' || c.is_whitespace())
        .to_string();
    if cleaned.is_empty() {
        normalize_merchant(name)
    } else {
        cleaned
    }
}

/// Looser spellings of a cleaned key tried by partial matching: the key
/// itself, the key without filler words, and its first significant word
pub fn merchant_variations(key: &str) -> Vec<String> {
    let mut variations = vec![key.to_string()];
    let words: Vec<&str> = key.split_whitespace().collect();
    let kept: Vec<&str> = words
        .iter()
        .copied()
        .filter(|w| !FILLER_WORDS.contains(w))
        .collect();

    if !kept.is_empty() && kept.len() < words.len() {
        variations.push(kept.join(" "));
    }
    if let Some(first) = kept.first().filter(|w| w.chars().count() > 3) {
        if kept.len() > 1 && !variations.iter().any(|v| v == first) {
            variations.push(first.to_string());
        }
    }
    variations
}

/// Cache key for a transaction: the cleaned merchant name, or the
/// description when the merchant is missing
pub fn pattern_key(tx: &Transaction) -> Option<String> {
    let source = tx
        .merchant_name
        .as_deref()
        .filter(|m| !m.trim().is_empty())
        .unwrap_or(&tx.description);
    let key = clean_merchant_name(source);
    (!key.is_empty()).then_some(key)
}

/// Levenshtein distance over chars
fn levenshtein(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    if a.is_empty() {
        return b.len();
    }
    if b.is_empty() {
        return a.len();
    }

    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut curr = vec![0; b.len() + 1];
    for (i, ca) in a.iter().enumerate() {
        curr[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let cost = usize::from(ca != cb);
            curr[j + 1] = (prev[j + 1] + 1).min(curr[j] + 1).min(prev[j] + cost);
        }
        std::mem::swap(&mut prev, &mut curr);
    }
    prev[b.len()]
}

/// 1 - distance / longer length, in [0, 1]
pub fn similarity(a: &str, b: &str) -> f64 {
    let longest = a.chars().count().max(b.chars().count());
    if longest == 0 {
        return 1.0;
    }
    1.0 - levenshtein(a, b) as f64 / longest as f64
}

/// Composite ranking for fuzzy candidates
fn fuzzy_score(similarity: f64, entry: &MerchantPattern) -> f64 {
    let usage = (entry.usage_count as f64 / 100.0).min(1.0);
    similarity * 0.7 + usage * 0.2 + entry.confidence * 0.1
}

fn cmp_f64(a: f64, b: f64) -> Ordering {
    a.partial_cmp(&b).unwrap_or(Ordering::Equal)
}

/// Merchant pattern cache lookups and learning
#[derive(Clone)]
pub struct PatternEngine {
    db: Database,
    settings: PatternSettings,
    usage: UsageRecorder,
}

impl PatternEngine {
    pub fn new(db: Database, settings: PatternSettings, usage: UsageRecorder) -> Self {
        Self {
            db,
            settings,
            usage,
        }
    }

    pub fn settings(&self) -> &PatternSettings {
        &self.settings
    }

    /// Best cache hit for a transaction's merchant
    pub fn match_pattern(&self, tx: &Transaction) -> Result<Option<PatternMatch>> {
        let Some(key) = pattern_key(tx) else {
            return Ok(None);
        };
        let entries = self.db.list_merchant_patterns(tx.organization_id)?;
        let found = self.best_match(&key, &entries);

        if let Some(m) = &found {
            debug!(
                transaction_id = tx.id,
                pattern = %m.pattern,
                match_type = m.match_type.as_str(),
                confidence = m.confidence,
                "Pattern matched"
            );
            if m.match_type == MatchType::Exact {
                self.usage.record(UsageEvent::PatternHit {
                    pattern_id: m.pattern_id,
                });
            }
        }

        Ok(found)
    }

    fn best_match(&self, key: &str, entries: &[MerchantPattern]) -> Option<PatternMatch> {
        let exact = entries
            .iter()
            .filter(|e| e.pattern == key)
            .max_by(|a, b| cmp_f64(a.confidence, b.confidence).then(b.id.cmp(&a.id)));
        if let Some(entry) = exact {
            return Some(PatternMatch {
                pattern_id: entry.id,
                pattern: entry.pattern.clone(),
                category_id: entry.category_id,
                confidence: entry.confidence,
                similarity: 1.0,
                match_type: MatchType::Exact,
            });
        }

        let fuzzy = entries
            .iter()
            .map(|e| (e, similarity(key, &e.pattern)))
            .filter(|(_, sim)| *sim >= self.settings.fuzzy_threshold)
            .max_by(|(a, sa), (b, sb)| {
                cmp_f64(fuzzy_score(*sa, a), fuzzy_score(*sb, b))
                    .then(cmp_f64(*sa, *sb))
                    .then(b.id.cmp(&a.id))
            })
            .map(|(e, sim)| PatternMatch {
                pattern_id: e.id,
                pattern: e.pattern.clone(),
                category_id: e.category_id,
                confidence: e.confidence * sim,
                similarity: sim,
                match_type: MatchType::Fuzzy,
            });

        let variations = merchant_variations(key);
        let partial = entries
            .iter()
            .filter(|e| {
                !e.pattern.is_empty()
                    && variations
                        .iter()
                        .any(|v| v.contains(&e.pattern) || e.pattern.contains(v.as_str()))
            })
            .max_by(|a, b| cmp_f64(a.confidence, b.confidence).then(b.id.cmp(&a.id)))
            .map(|e| {
                let (short, long) = if e.pattern.len() < key.len() {
                    (e.pattern.chars().count(), key.chars().count())
                } else {
                    (key.chars().count(), e.pattern.chars().count())
                };
                PatternMatch {
                    pattern_id: e.id,
                    pattern: e.pattern.clone(),
                    category_id: e.category_id,
                    confidence: e.confidence * self.settings.partial_factor,
                    similarity: short as f64 / long.max(1) as f64,
                    match_type: MatchType::Partial,
                }
            });

        match (fuzzy, partial) {
            (Some(f), Some(p)) => Some(if f.confidence >= p.confidence { f } else { p }),
            (f, p) => f.or(p),
        }
    }

    /// Remember a confident decision; returns false below the learnable floor
    pub fn learn(&self, tx: &Transaction, category_id: i64, confidence: f64) -> Result<bool> {
        match pattern_key(tx) {
            Some(key) => self.learn_key(tx.organization_id, &key, category_id, confidence),
            None => Ok(false),
        }
    }

    /// Remember a mapping for an already normalized key
    pub fn learn_key(
        &self,
        organization_id: i64,
        key: &str,
        category_id: i64,
        confidence: f64,
    ) -> Result<bool> {
        if confidence < self.settings.learn_floor {
            return Ok(false);
        }
        self.db.learn_merchant_pattern(
            organization_id,
            key,
            category_id,
            confidence.min(1.0),
            PatternSource::Learned,
        )?;
        Ok(true)
    }

    /// User agreed with a category: confidence moves towards 1.0
    pub fn confirm(&self, tx: &Transaction, category_id: i64) -> Result<()> {
        if let Some(key) = pattern_key(tx) {
            self.db.reinforce_merchant_pattern(
                tx.organization_id,
                &key,
                category_id,
                self.settings.reinforce_rate,
                self.settings.user_confidence,
            )?;
        }
        Ok(())
    }

    /// User moved a transaction: demote the old mapping, promote the new one
    pub fn apply_correction(&self, tx: &Transaction, old_category_id: Option<i64>, new_category_id: i64) -> Result<()> {
        let Some(key) = pattern_key(tx) else {
            return Ok(());
        };

        if let Some(old) = old_category_id.filter(|old| *old != new_category_id) {
            self.demote(tx.organization_id, &key, old)?;
        }
        self.db.reinforce_merchant_pattern(
            tx.organization_id,
            &key,
            new_category_id,
            self.settings.reinforce_rate,
            self.settings.user_confidence,
        )?;
        Ok(())
    }

    /// User marked a category as wrong without choosing another
    pub fn reject(&self, tx: &Transaction, category_id: i64) -> Result<()> {
        if let Some(key) = pattern_key(tx) {
            self.demote(tx.organization_id, &key, category_id)?;
        }
        Ok(())
    }

    /// Demote one cache entry by the correction penalty
    pub fn demote(&self, organization_id: i64, pattern: &str, category_id: i64) -> Result<bool> {
        let touched = self.db.demote_merchant_pattern(
            organization_id,
            pattern,
            category_id,
            self.settings.correction_penalty,
        )?;
        Ok(touched > 0)
    }

    /// Cache entries similar to a merchant name, best first
    pub fn get_similar_patterns(
        &self,
        organization_id: i64,
        merchant: &str,
        threshold: f64,
    ) -> Result<Vec<SimilarPattern>> {
        let key = clean_merchant_name(merchant);
        let mut similar: Vec<SimilarPattern> = self
            .db
            .list_merchant_patterns(organization_id)?
            .into_iter()
            .filter_map(|entry| {
                let sim = similarity(&key, &entry.pattern);
                (sim >= threshold).then(|| SimilarPattern {
                    score: fuzzy_score(sim, &entry),
                    similarity: sim,
                    pattern: entry,
                })
            })
            .collect();

        similar.sort_by(|a, b| {
            cmp_f64(b.score, a.score).then(a.pattern.id.cmp(&b.pattern.id))
        });
        Ok(similar)
    }

    pub fn list_patterns(&self, organization_id: i64) -> Result<Vec<MerchantPattern>> {
        self.db.list_merchant_patterns(organization_id)
    }

    /// Drop every cached mapping for an organization
    pub fn clear_cache(&self, organization_id: i64) -> Result<usize> {
        self.db.clear_merchant_patterns(organization_id)
    }
}

#[async_trait]
impl Stage for PatternEngine {
    fn kind(&self) -> StageKind {
        StageKind::Pattern
    }

    async fn evaluate(&self, transaction: &Transaction) -> Result<ScoredResult> {
        Ok(match self.match_pattern(transaction)? {
            Some(m) => ScoredResult {
                category_id: Some(m.category_id),
                confidence: m.confidence,
                evidence: Evidence::Pattern(m),
            },
            None => ScoredResult::empty(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn setup() -> (Database, PatternEngine, i64, i64) {
        let db = Database::in_memory().unwrap();
        let dining = db.create_category(1, "Dining", None, None, None).unwrap();
        let travel = db.create_category(1, "Travel", None, None, None).unwrap();
        let engine = PatternEngine::new(db.clone(), PatternSettings::default(), UsageRecorder::disabled());
        (db, engine, dining, travel)
    }

    fn tx(merchant: Option<&str>, description: &str) -> Transaction {
        Transaction {
            id: 1,
            organization_id: 1,
            amount: -12.0,
            description: description.into(),
            merchant_name: merchant.map(String::from),
            date: NaiveDate::from_ymd_opt(2024, 3, 1).unwrap(),
            category_id: None,
            categorization: None,
            created_at: chrono::Utc::now(),
        }
    }

    fn confidence_of(engine: &PatternEngine, key: &str, category_id: i64) -> f64 {
        engine
            .list_patterns(1)
            .unwrap()
            .into_iter()
            .find(|p| p.pattern == key && p.category_id == category_id)
            .map(|p| p.confidence)
            .unwrap()
    }

    #[test]
    fn test_normalize() {
        assert_eq!(normalize_merchant("  Blue   Bottle\tCOFFEE "), "blue bottle coffee");
        assert_eq!(pattern_key(&tx(None, "ATM  Withdrawal")).as_deref(), Some("atm withdrawal"));
        assert_eq!(pattern_key(&tx(Some("   "), "")), None);
    }

    #[test]
    fn test_clean_merchant_name() {
        assert_eq!(clean_merchant_name("STARBUCKS #123"), "starbucks");
        assert_eq!(clean_merchant_name("STARBUCKS #456"), "starbucks");
        assert_eq!(clean_merchant_name("Acme Widgets LLC"), "acme widgets");
        assert_eq!(clean_merchant_name("Acme Holdings, Inc."), "acme holdings");
        assert_eq!(clean_merchant_name("CHECKCARD 0412 SHELL OIL 57442"), "shell oil");
        assert_eq!(clean_merchant_name("SQ *BLUE BOTTLE - DEBIT"), "sq blue bottle");
        assert_eq!(clean_merchant_name("AMAZON REF #A1B2C3"), "amazon");
        // Nothing left after cleaning
        assert_eq!(clean_merchant_name("#1234"), "#1234");
    }

    #[test]
    fn test_store_numbers_share_one_entry() {
        let (_db, engine, dining, _) = setup();
        engine.learn(&tx(Some("STARBUCKS #123"), ""), dining, 0.9).unwrap();

        let m = engine
            .match_pattern(&tx(Some("STARBUCKS #456"), ""))
            .unwrap()
            .unwrap();
        assert_eq!(m.match_type, MatchType::Exact);
        assert_eq!(m.pattern, "starbucks");
        assert_eq!(engine.list_patterns(1).unwrap().len(), 1);
    }

    #[test]
    fn test_merchant_variations() {
        assert_eq!(
            merchant_variations("barnes & noble"),
            vec!["barnes & noble", "barnes noble", "barnes"]
        );
        assert_eq!(merchant_variations("the gap"), vec!["the gap", "gap"]);
        assert_eq!(merchant_variations("shell"), vec!["shell"]);
    }

    #[test]
    fn test_partial_match_through_variation() {
        let (_db, engine, dining, _) = setup();
        engine
            .learn(&tx(Some("starbucks reserve roastery"), ""), dining, 0.9)
            .unwrap();

        let m = engine
            .match_pattern(&tx(Some("STARBUCKS KIOSK"), ""))
            .unwrap()
            .unwrap();
        assert_eq!(m.match_type, MatchType::Partial);
        assert_eq!(m.category_id, dining);
    }

    #[test]
    fn test_similarity() {
        assert_eq!(similarity("abc", "abc"), 1.0);
        assert_eq!(similarity("", ""), 1.0);
        assert!((similarity("kitten", "sitting") - (1.0 - 3.0 / 7.0)).abs() < 1e-9);
        assert_eq!(similarity("abc", ""), 0.0);
    }

    #[test]
    fn test_learn_respects_floor() {
        let (_db, engine, dining, _) = setup();
        let t = tx(Some("Blue Bottle"), "coffee");

        assert!(!engine.learn(&t, dining, 0.4).unwrap());
        assert!(engine.match_pattern(&t).unwrap().is_none());

        assert!(engine.learn(&t, dining, 0.85).unwrap());
        let m = engine.match_pattern(&t).unwrap().unwrap();
        assert_eq!(m.match_type, MatchType::Exact);
        assert_eq!(m.confidence, 0.85);

        // Learning keeps the higher confidence
        engine.learn(&t, dining, 0.7).unwrap();
        assert_eq!(confidence_of(&engine, "blue bottle", dining), 0.85);
    }

    #[test]
    fn test_match_quality_ordering() {
        let (_db, engine, dining, _) = setup();
        engine.learn(&tx(Some("starbucks coffee"), ""), dining, 0.9).unwrap();

        let fuzzy = engine
            .match_pattern(&tx(Some("starbuck coffee"), ""))
            .unwrap()
            .unwrap();
        assert_eq!(fuzzy.match_type, MatchType::Fuzzy);
        assert!(fuzzy.confidence < 0.9);

        let partial = engine
            .match_pattern(&tx(Some("starbucks coffee seattle wa 98101"), ""))
            .unwrap()
            .unwrap();
        assert_eq!(partial.match_type, MatchType::Partial);
        assert!((partial.confidence - 0.9 * 0.6).abs() < 1e-9);

        assert!(engine
            .match_pattern(&tx(Some("shell oil"), ""))
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_confirmations_never_decrease() {
        let (_db, engine, dining, _) = setup();
        let t = tx(Some("Blue Bottle"), "");
        engine.learn(&t, dining, 0.7).unwrap();

        let mut last = confidence_of(&engine, "blue bottle", dining);
        for _ in 0..5 {
            engine.confirm(&t, dining).unwrap();
            let now = confidence_of(&engine, "blue bottle", dining);
            assert!(now >= last);
            assert!(now <= 1.0);
            last = now;
        }
    }

    #[test]
    fn test_correction_strictly_decreases() {
        let (_db, engine, dining, travel) = setup();
        let t = tx(Some("Airport Cafe"), "");
        engine.learn(&t, dining, 0.9).unwrap();

        engine.apply_correction(&t, Some(dining), travel).unwrap();
        assert!(confidence_of(&engine, "airport cafe", dining) < 0.9);

        // The corrected mapping now wins the exact lookup
        let m = engine.match_pattern(&t).unwrap().unwrap();
        assert_eq!(m.category_id, travel);

        let before = confidence_of(&engine, "airport cafe", travel);
        engine.reject(&t, travel).unwrap();
        assert!(confidence_of(&engine, "airport cafe", travel) < before);
    }

    #[test]
    fn test_similar_patterns_and_clear() {
        let (_db, engine, dining, travel) = setup();
        engine.learn(&tx(Some("delta air lines"), ""), travel, 0.9).unwrap();
        engine.learn(&tx(Some("delta airlines"), ""), travel, 0.8).unwrap();
        engine.learn(&tx(Some("taco bell"), ""), dining, 0.9).unwrap();

        let similar = engine.get_similar_patterns(1, "DELTA AIR LINES", 0.8).unwrap();
        assert_eq!(similar.len(), 2);
        assert_eq!(similar[0].pattern.pattern, "delta air lines");

        assert_eq!(engine.clear_cache(1).unwrap(), 3);
        assert!(engine.list_patterns(1).unwrap().is_empty());
    }
}
