//! Per-organization spend ceilings for paid inference
//!
//! The ledger lives in the database, so check-and-reserve is atomic across
//! pooled connections and processes. Threshold alerts are logged whenever
//! a spend crosses one of the configured usage ratios.

use chrono::{NaiveDate, Utc};
use tracing::{info, warn};

use crate::config::BudgetSettings;
use crate::db::{Database, SpendAdjustment};
use crate::error::{Error, Result};
use crate::models::{AlertSeverity, BudgetAlert, BudgetPeriod, CostSaving, CostTracker, SavingPriority};

// Average LLM cost per transaction above which rules pay off quickly
const HIGH_AVG_COST: f64 = 0.002;
// Monthly LLM volume above which larger prompt chunks are worth it
const HIGH_VOLUME: i64 = 1000;

fn utc_today() -> NaiveDate {
    Utc::now().date_naive()
}

fn check_amount(name: &str, value: f64) -> Result<()> {
    if !value.is_finite() || value < 0.0 {
        return Err(Error::Validation(format!(
            "{} must be a non-negative number (got {})",
            name, value
        )));
    }
    Ok(())
}

/// Spend held against the ledger until the call is billed
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Reservation {
    pub organization_id: i64,
    pub amount: f64,
    pub reserved_on: NaiveDate,
}

#[derive(Clone)]
pub struct BudgetManager {
    db: Database,
    settings: BudgetSettings,
    clock: fn() -> NaiveDate,
}

impl BudgetManager {
    pub fn new(db: Database, settings: BudgetSettings) -> Self {
        Self {
            db,
            settings,
            clock: utc_today,
        }
    }

    /// Use a fixed calendar (period rollover tests)
    pub fn with_clock(mut self, clock: fn() -> NaiveDate) -> Self {
        self.clock = clock;
        self
    }

    /// Atomically check both ceilings and reserve the estimate if it fits
    pub fn check_budget(&self, organization_id: i64, estimated_cost: f64) -> Result<bool> {
        Ok(self.reserve(organization_id, estimated_cost)?.is_some())
    }

    /// Like [`check_budget`](Self::check_budget), returning the reservation
    /// to hand back to [`reconcile`](Self::reconcile)
    pub fn reserve(&self, organization_id: i64, estimated_cost: f64) -> Result<Option<Reservation>> {
        check_amount("Estimated cost", estimated_cost)?;

        let today = (self.clock)();
        let reservation = self
            .db
            .reserve_spend(organization_id, estimated_cost, &self.settings, today)?;

        if !reservation.granted {
            info!(
                organization_id,
                estimated_cost,
                period = reservation.denied_by.map(|p| p.as_str()),
                monthly_spend = reservation.before.monthly_spend,
                current_spend = reservation.before.current_spend,
                "Budget ceiling reached"
            );
            return Ok(None);
        }

        self.log_crossed_alerts(&reservation.before, &reservation.after);
        Ok(Some(Reservation {
            organization_id,
            amount: estimated_cost,
            reserved_on: today,
        }))
    }

    /// Add spend unconditionally (cost already incurred)
    pub fn record_spend(&self, organization_id: i64, actual_cost: f64, transactions: i64) -> Result<CostTracker> {
        check_amount("Actual cost", actual_cost)?;
        let today = (self.clock)();
        self.adjust(
            organization_id,
            SpendAdjustment {
                actual: actual_cost,
                released: 0.0,
                reserved_on: today,
                transactions,
            },
        )
    }

    /// Replace a reservation with the cost that was actually billed. When
    /// the day or month rolled over in between, the full cost lands in the
    /// new period.
    pub fn reconcile(&self, reservation: &Reservation, actual_cost: f64, transactions: i64) -> Result<CostTracker> {
        check_amount("Actual cost", actual_cost)?;
        self.adjust(
            reservation.organization_id,
            SpendAdjustment {
                actual: actual_cost,
                released: reservation.amount,
                reserved_on: reservation.reserved_on,
                transactions,
            },
        )
    }

    fn adjust(&self, organization_id: i64, adjustment: SpendAdjustment) -> Result<CostTracker> {
        let (before, after) =
            self.db
                .adjust_spend(organization_id, &adjustment, &self.settings, (self.clock)())?;
        self.log_crossed_alerts(&before, &after);
        Ok(after)
    }

    pub fn get_cost_tracker(&self, organization_id: i64) -> Result<CostTracker> {
        self.db
            .get_cost_tracker(organization_id, &self.settings, (self.clock)())
    }

    /// Change the ceilings; 0 disables a ceiling
    pub fn update_budget(&self, organization_id: i64, monthly_budget: f64, daily_budget: f64) -> Result<CostTracker> {
        check_amount("Monthly budget", monthly_budget)?;
        check_amount("Daily budget", daily_budget)?;

        let tracker = self.db.set_budget(
            organization_id,
            monthly_budget,
            daily_budget,
            &self.settings,
            (self.clock)(),
        )?;
        info!(organization_id, monthly_budget, daily_budget, "Budget updated");
        Ok(tracker)
    }

    /// Spend still available under both ceilings (None = unlimited)
    pub fn remaining(&self, tracker: &CostTracker) -> Option<f64> {
        let daily = (tracker.daily_budget > 0.0).then(|| tracker.daily_budget - tracker.current_spend);
        let monthly =
            (tracker.monthly_budget > 0.0).then(|| tracker.monthly_budget - tracker.monthly_spend);
        match (daily, monthly) {
            (Some(d), Some(m)) => Some(d.min(m).max(0.0)),
            (Some(x), None) | (None, Some(x)) => Some(x.max(0.0)),
            (None, None) => None,
        }
    }

    /// Thresholds the tracker has reached, one alert per period at the
    /// highest threshold reached
    pub fn budget_alerts(&self, tracker: &CostTracker) -> Vec<BudgetAlert> {
        let mut alerts = Vec::new();

        for (period, spend, budget) in [
            (BudgetPeriod::Daily, tracker.current_spend, tracker.daily_budget),
            (BudgetPeriod::Monthly, tracker.monthly_spend, tracker.monthly_budget),
        ] {
            if budget <= 0.0 {
                continue;
            }
            let usage = spend / budget;
            let reached = self
                .settings
                .alert_thresholds
                .iter()
                .copied()
                .filter(|t| usage >= *t)
                .fold(None, |acc: Option<f64>, t| Some(acc.map_or(t, |a| a.max(t))));

            if let Some(threshold) = reached {
                alerts.push(BudgetAlert {
                    organization_id: tracker.organization_id,
                    period,
                    threshold,
                    usage,
                    severity: AlertSeverity::for_usage(usage),
                    message: format!(
                        "{} budget {:.0}% used (${:.2} of ${:.2})",
                        match period {
                            BudgetPeriod::Daily => "Daily",
                            BudgetPeriod::Monthly => "Monthly",
                        },
                        usage * 100.0,
                        spend,
                        budget
                    ),
                });
            }
        }

        alerts
    }

    /// Ways to cut this month's LLM spend, highest priority first. Empty
    /// until something has been spent.
    pub fn cost_savings(&self, tracker: &CostTracker) -> Vec<CostSaving> {
        let spend = tracker.monthly_spend;
        if spend <= 0.0 {
            return Vec::new();
        }

        let mut savings = Vec::new();
        if tracker.avg_cost_per_txn > HIGH_AVG_COST {
            savings.push(CostSaving {
                name: "Improve rule coverage",
                description: "Add rules for frequent merchants so they never reach the LLM",
                estimated_savings: spend * 0.30,
                priority: SavingPriority::High,
            });
        }
        savings.push(CostSaving {
            name: "Cheaper model selection",
            description: "Use the cost model strategy for routine batches",
            estimated_savings: spend * 0.25,
            priority: SavingPriority::High,
        });
        savings.push(CostSaving {
            name: "Pattern learning",
            description: "Confirm or correct results so the pattern cache catches repeats",
            estimated_savings: spend * 0.20,
            priority: SavingPriority::Medium,
        });
        if tracker.transaction_count > HIGH_VOLUME {
            savings.push(CostSaving {
                name: "Larger batches",
                description: "Raise llm.max_batch_size to share prompt overhead across more transactions",
                estimated_savings: spend * 0.15,
                priority: SavingPriority::Medium,
            });
        }
        savings.sort_by_key(|s| s.priority);
        savings
    }

    fn log_crossed_alerts(&self, before: &CostTracker, after: &CostTracker) {
        let previous = self.budget_alerts(before);
        for alert in self.budget_alerts(after) {
            let already = previous
                .iter()
                .any(|p| p.period == alert.period && p.threshold >= alert.threshold);
            if !already {
                warn!(
                    organization_id = alert.organization_id,
                    period = alert.period.as_str(),
                    threshold = alert.threshold,
                    severity = alert.severity.as_str(),
                    "{}",
                    alert.message
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> BudgetManager {
        BudgetManager::new(Database::in_memory().unwrap(), BudgetSettings::default())
    }

    #[test]
    fn test_default_tracker_created() {
        let budget = manager();
        let tracker = budget.get_cost_tracker(7).unwrap();
        assert_eq!(tracker.monthly_budget, 50.0);
        assert_eq!(tracker.daily_budget, 5.0);
        assert_eq!(tracker.current_spend, 0.0);
    }

    #[test]
    fn test_reserve_near_ceiling() {
        let budget = manager();
        budget.update_budget(1, 10.0, 0.0).unwrap();
        budget.record_spend(1, 9.99, 10).unwrap();

        assert!(!budget.check_budget(1, 0.02).unwrap());
        assert!(budget.check_budget(1, 0.005).unwrap());

        let tracker = budget.get_cost_tracker(1).unwrap();
        assert!((tracker.current_spend - 9.995).abs() < 1e-9);
        assert!((tracker.monthly_spend - 9.995).abs() < 1e-9);
    }

    #[test]
    fn test_daily_ceiling_checked() {
        let budget = manager();
        budget.update_budget(1, 100.0, 1.0).unwrap();
        assert!(budget.check_budget(1, 0.6).unwrap());
        assert!(!budget.check_budget(1, 0.6).unwrap());
        assert!(budget.check_budget(1, 0.4).unwrap());
    }

    #[test]
    fn test_zero_means_unlimited() {
        let budget = manager();
        budget.update_budget(1, 0.0, 0.0).unwrap();
        assert!(budget.check_budget(1, 1_000.0).unwrap());
        let tracker = budget.get_cost_tracker(1).unwrap();
        assert_eq!(budget.remaining(&tracker), None);
    }

    #[test]
    fn test_reconcile_replaces_reservation() {
        let budget = manager();
        let reservation = budget.reserve(1, 0.5).unwrap().unwrap();
        assert_eq!(reservation.amount, 0.5);
        let tracker = budget.reconcile(&reservation, 0.2, 4).unwrap();
        assert!((tracker.current_spend - 0.2).abs() < 1e-9);
        assert_eq!(tracker.transaction_count, 4);
        assert!((tracker.avg_cost_per_txn - 0.05).abs() < 1e-9);

        // Releasing more than was spent never goes negative
        let oversized = Reservation {
            amount: 5.0,
            ..reservation
        };
        let tracker = budget.reconcile(&oversized, 0.0, 0).unwrap();
        assert_eq!(tracker.current_spend, 0.0);
    }

    #[test]
    fn test_reconcile_across_rollover() {
        fn march_31() -> NaiveDate {
            NaiveDate::from_ymd_opt(2024, 3, 31).unwrap()
        }
        fn april_1() -> NaiveDate {
            NaiveDate::from_ymd_opt(2024, 4, 1).unwrap()
        }
        fn april_2() -> NaiveDate {
            NaiveDate::from_ymd_opt(2024, 4, 2).unwrap()
        }

        let db = Database::in_memory().unwrap();
        let settings = BudgetSettings::default();

        // Reserved before midnight at month end, billed after
        let before_midnight = BudgetManager::new(db.clone(), settings.clone()).with_clock(march_31);
        let reservation = before_midnight.reserve(1, 0.5).unwrap().unwrap();
        let next_month = BudgetManager::new(db.clone(), settings.clone()).with_clock(april_1);
        let tracker = next_month.reconcile(&reservation, 0.3, 3).unwrap();
        assert!((tracker.current_spend - 0.3).abs() < 1e-9);
        assert!((tracker.monthly_spend - 0.3).abs() < 1e-9);
        assert_eq!(tracker.transaction_count, 3);

        // Same month, next day: only the daily release is skipped
        let reservation = next_month.reserve(1, 0.4).unwrap().unwrap();
        let next_day = BudgetManager::new(db, settings).with_clock(april_2);
        let tracker = next_day.reconcile(&reservation, 0.1, 1).unwrap();
        assert!((tracker.current_spend - 0.1).abs() < 1e-9);
        assert!((tracker.monthly_spend - 0.4).abs() < 1e-9);
    }

    #[test]
    fn test_rejects_invalid_amounts() {
        let budget = manager();
        assert!(matches!(budget.check_budget(1, -1.0), Err(Error::Validation(_))));
        assert!(matches!(budget.check_budget(1, f64::NAN), Err(Error::Validation(_))));
        assert!(matches!(budget.update_budget(1, -5.0, 1.0), Err(Error::Validation(_))));
    }

    #[test]
    fn test_period_rollover() {
        fn march_1() -> NaiveDate {
            NaiveDate::from_ymd_opt(2024, 3, 1).unwrap()
        }
        fn march_2() -> NaiveDate {
            NaiveDate::from_ymd_opt(2024, 3, 2).unwrap()
        }
        fn april_1() -> NaiveDate {
            NaiveDate::from_ymd_opt(2024, 4, 1).unwrap()
        }

        let db = Database::in_memory().unwrap();
        let day1 = BudgetManager::new(db.clone(), BudgetSettings::default()).with_clock(march_1);
        day1.record_spend(1, 3.0, 2).unwrap();

        let day2 = BudgetManager::new(db.clone(), BudgetSettings::default()).with_clock(march_2);
        let tracker = day2.get_cost_tracker(1).unwrap();
        assert_eq!(tracker.current_spend, 0.0);
        assert_eq!(tracker.monthly_spend, 3.0);

        let next_month = BudgetManager::new(db, BudgetSettings::default()).with_clock(april_1);
        let tracker = next_month.get_cost_tracker(1).unwrap();
        assert_eq!(tracker.monthly_spend, 0.0);
        assert_eq!(tracker.transaction_count, 0);
        assert_eq!(tracker.period_month, "2024-04");
    }

    #[test]
    fn test_cost_savings() {
        let budget = manager();
        assert!(budget.cost_savings(&budget.get_cost_tracker(1).unwrap()).is_empty());

        // $0.05 over 100 transactions: cheap per transaction, low volume
        let tracker = budget.record_spend(1, 0.05, 100).unwrap();
        let names: Vec<_> = budget.cost_savings(&tracker).iter().map(|s| s.name).collect();
        assert_eq!(names, vec!["Cheaper model selection", "Pattern learning"]);

        // $3.50 over 1100 transactions: expensive and high volume
        let tracker = budget.record_spend(1, 3.45, 1000).unwrap();
        let savings = budget.cost_savings(&tracker);
        assert_eq!(savings.len(), 4);
        assert_eq!(savings[0].name, "Improve rule coverage");
        assert!((savings[0].estimated_savings - 1.05).abs() < 1e-9);
        assert_eq!(savings[3].name, "Larger batches");
        assert!(savings.windows(2).all(|w| w[0].priority <= w[1].priority));
    }

    #[test]
    fn test_alerts_at_highest_threshold() {
        let budget = manager();
        budget.update_budget(1, 10.0, 0.0).unwrap();
        let tracker = budget.record_spend(1, 8.5, 1).unwrap();

        let alerts = budget.budget_alerts(&tracker);
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].period, BudgetPeriod::Monthly);
        assert_eq!(alerts[0].threshold, 0.8);
        assert_eq!(alerts[0].severity, AlertSeverity::Warning);
        assert_eq!(budget.remaining(&tracker).map(|r| (r * 100.0).round()), Some(150.0));
    }
}
