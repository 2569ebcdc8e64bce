//! Fire-and-forget usage statistics
//!
//! Stages report rule matches and pattern hits as events on an unbounded
//! channel. A background updater applies them to the database, so the
//! categorization path never waits on a statistics write.

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::db::Database;
use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsageEvent {
    RuleMatched { rule_id: i64 },
    PatternHit { pattern_id: i64 },
}

/// Sending half, cloned into every engine
#[derive(Debug, Clone, Default)]
pub struct UsageRecorder {
    tx: Option<mpsc::UnboundedSender<UsageEvent>>,
}

impl UsageRecorder {
    /// A recorder that drops every event
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    pub fn record(&self, event: UsageEvent) {
        if let Some(tx) = &self.tx {
            if tx.send(event).is_err() {
                debug!(?event, "Usage updater gone, dropping event");
            }
        }
    }
}

/// Receiving half, applies events to storage
pub struct UsageUpdater {
    db: Database,
    rx: mpsc::UnboundedReceiver<UsageEvent>,
}

/// Create a connected recorder/updater pair
pub fn channel(db: Database) -> (UsageRecorder, UsageUpdater) {
    let (tx, rx) = mpsc::unbounded_channel();
    (UsageRecorder { tx: Some(tx) }, UsageUpdater { db, rx })
}

impl UsageUpdater {
    /// Apply events until every recorder has been dropped; returns the
    /// number applied
    pub async fn run(mut self) -> u64 {
        let mut applied = 0;
        while let Some(event) = self.rx.recv().await {
            if self.apply(event) {
                applied += 1;
            }
        }
        debug!(applied, "Usage updater stopped");
        applied
    }

    pub fn spawn(self) -> JoinHandle<u64> {
        tokio::spawn(self.run())
    }

    /// Apply whatever is already queued without waiting
    #[cfg(test)]
    pub(crate) fn drain_pending(&mut self) -> u64 {
        let mut applied = 0;
        while let Ok(event) = self.rx.try_recv() {
            if self.apply(event) {
                applied += 1;
            }
        }
        applied
    }

    fn apply(&self, event: UsageEvent) -> bool {
        let result: Result<()> = match event {
            UsageEvent::RuleMatched { rule_id } => self.db.record_rule_usage(rule_id),
            UsageEvent::PatternHit { pattern_id } => self.db.record_pattern_hit(pattern_id),
        };

        match result {
            Ok(()) => true,
            Err(e) => {
                warn!(?event, error = %e, "Failed to apply usage event");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{NewCategoryRule, RuleType};

    #[tokio::test]
    async fn test_updater_applies_rule_usage() {
        let db = Database::in_memory().unwrap();
        let category = db.create_category(1, "Dining", None, None, None).unwrap();
        let rule_id = db
            .create_rule(&NewCategoryRule {
                organization_id: 1,
                category_id: category,
                rule_type: RuleType::MerchantPattern,
                pattern: "CAFE*".into(),
                confidence: 0.9,
                priority: 1,
                case_sensitive: false,
                is_regex: false,
            })
            .unwrap();

        let (recorder, updater) = channel(db.clone());
        let handle = updater.spawn();

        recorder.record(UsageEvent::RuleMatched { rule_id });
        recorder.record(UsageEvent::RuleMatched { rule_id });
        drop(recorder);

        assert_eq!(handle.await.unwrap(), 2);
        assert_eq!(db.get_rule(rule_id).unwrap().unwrap().usage_count, 2);
    }

    #[test]
    fn test_disabled_recorder_is_silent() {
        UsageRecorder::disabled().record(UsageEvent::PatternHit { pattern_id: 1 });
    }

    #[test]
    fn test_drain_pending() {
        let db = Database::in_memory().unwrap();
        let (recorder, mut updater) = channel(db);
        // Unknown ids update zero rows, which is not an error
        recorder.record(UsageEvent::PatternHit { pattern_id: 42 });
        assert_eq!(updater.drain_pending(), 1);
        assert_eq!(updater.drain_pending(), 0);
    }
}
