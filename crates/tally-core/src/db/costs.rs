//! Cost ledger and LLM batch operations
//!
//! Every ledger mutation runs inside a `BEGIN IMMEDIATE` transaction so the
//! check-and-reserve is linearizable per organization, across pooled
//! connections and across processes sharing the database file.

use chrono::NaiveDate;
use rusqlite::{params, Connection, TransactionBehavior};

use super::{parse_date, parse_datetime, Database};
use crate::config::BudgetSettings;
use crate::error::Result;
use crate::models::{BudgetPeriod, CostTracker, LlmBatchRecord, NewLlmBatchRecord};

// Float slack so spending exactly up to a ceiling is allowed
const EPSILON: f64 = 1e-9;

/// Outcome of an atomic check-and-reserve
#[derive(Debug, Clone)]
pub struct SpendReservation {
    pub granted: bool,
    /// Which ceiling refused the reservation
    pub denied_by: Option<BudgetPeriod>,
    pub before: CostTracker,
    pub after: CostTracker,
}

/// Spend to book against the ledger
#[derive(Debug, Clone, Copy)]
pub struct SpendAdjustment {
    pub actual: f64,
    /// Reservation to give back
    pub released: f64,
    /// Day the reservation was taken
    pub reserved_on: NaiveDate,
    pub transactions: i64,
}

fn month_key(day: NaiveDate) -> String {
    day.format("%Y-%m").to_string()
}

fn with_average(mut tracker: CostTracker) -> CostTracker {
    tracker.avg_cost_per_txn = if tracker.transaction_count > 0 {
        tracker.monthly_spend / tracker.transaction_count as f64
    } else {
        0.0
    };
    tracker
}

/// Load (creating with defaults) and roll the tracker into `today`'s periods
fn load_tracker(
    conn: &Connection,
    organization_id: i64,
    defaults: &BudgetSettings,
    today: NaiveDate,
) -> Result<CostTracker> {
    let day = today.format("%Y-%m-%d").to_string();
    let month = month_key(today);

    conn.execute(
        r#"
        INSERT OR IGNORE INTO cost_trackers (organization_id, monthly_budget, daily_budget, period_day, period_month)
        VALUES (?, ?, ?, ?, ?)
        "#,
        params![
            organization_id,
            defaults.monthly_budget,
            defaults.daily_budget,
            day,
            month
        ],
    )?;

    // Period rollover: daily spend resets each day, monthly spend and the
    // transaction count reset each month
    conn.execute(
        r#"
        UPDATE cost_trackers
        SET current_spend = CASE WHEN period_day != ?1 THEN 0 ELSE current_spend END,
            period_day = ?1,
            monthly_spend = CASE WHEN period_month != ?2 THEN 0 ELSE monthly_spend END,
            transaction_count = CASE WHEN period_month != ?2 THEN 0 ELSE transaction_count END,
            period_month = ?2
        WHERE organization_id = ?3 AND (period_day != ?1 OR period_month != ?2)
        "#,
        params![day, month, organization_id],
    )?;

    let tracker = conn.query_row(
        r#"
        SELECT organization_id, monthly_budget, daily_budget, current_spend, monthly_spend,
               transaction_count, period_day, period_month
        FROM cost_trackers
        WHERE organization_id = ?
        "#,
        params![organization_id],
        |row| {
            let period_day: String = row.get(6)?;
            Ok(CostTracker {
                organization_id: row.get(0)?,
                monthly_budget: row.get(1)?,
                daily_budget: row.get(2)?,
                current_spend: row.get(3)?,
                monthly_spend: row.get(4)?,
                transaction_count: row.get(5)?,
                avg_cost_per_txn: 0.0,
                period_day: parse_date(&period_day),
                period_month: row.get(7)?,
            })
        },
    )?;

    Ok(with_average(tracker))
}

fn write_spend(conn: &Connection, tracker: &CostTracker) -> Result<()> {
    conn.execute(
        r#"
        UPDATE cost_trackers
        SET current_spend = ?, monthly_spend = ?, transaction_count = ?,
            updated_at = CURRENT_TIMESTAMP
        WHERE organization_id = ?
        "#,
        params![
            tracker.current_spend,
            tracker.monthly_spend,
            tracker.transaction_count,
            tracker.organization_id
        ],
    )?;
    Ok(())
}

impl Database {
    /// Current tracker for an organization, created from defaults on first access
    pub fn get_cost_tracker(
        &self,
        organization_id: i64,
        defaults: &BudgetSettings,
        today: NaiveDate,
    ) -> Result<CostTracker> {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let tracker = load_tracker(&tx, organization_id, defaults, today)?;
        tx.commit()?;
        Ok(tracker)
    }

    /// Atomically check both ceilings and reserve `amount` if it fits.
    /// A ceiling of 0 is treated as unlimited.
    pub fn reserve_spend(
        &self,
        organization_id: i64,
        amount: f64,
        defaults: &BudgetSettings,
        today: NaiveDate,
    ) -> Result<SpendReservation> {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let before = load_tracker(&tx, organization_id, defaults, today)?;

        let denied_by = if before.daily_budget > 0.0
            && before.current_spend + amount > before.daily_budget + EPSILON
        {
            Some(BudgetPeriod::Daily)
        } else if before.monthly_budget > 0.0
            && before.monthly_spend + amount > before.monthly_budget + EPSILON
        {
            Some(BudgetPeriod::Monthly)
        } else {
            None
        };

        if denied_by.is_some() {
            tx.commit()?;
            return Ok(SpendReservation {
                granted: false,
                denied_by,
                after: before.clone(),
                before,
            });
        }

        let mut after = before.clone();
        after.current_spend += amount;
        after.monthly_spend += amount;
        write_spend(&tx, &after)?;
        tx.commit()?;

        Ok(SpendReservation {
            granted: true,
            denied_by: None,
            before,
            after: with_average(after),
        })
    }

    /// Atomically book incurred spend and release an earlier reservation.
    /// A release only applies to periods that have not rolled over since
    /// the reservation, since rollover already cleared it. Spend never goes
    /// below zero. Returns (before, after).
    pub fn adjust_spend(
        &self,
        organization_id: i64,
        adjustment: &SpendAdjustment,
        defaults: &BudgetSettings,
        today: NaiveDate,
    ) -> Result<(CostTracker, CostTracker)> {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let before = load_tracker(&tx, organization_id, defaults, today)?;

        let daily_release = if adjustment.reserved_on == today {
            adjustment.released
        } else {
            0.0
        };
        let monthly_release = if month_key(adjustment.reserved_on) == month_key(today) {
            adjustment.released
        } else {
            0.0
        };

        let mut after = before.clone();
        after.current_spend = (after.current_spend + adjustment.actual - daily_release).max(0.0);
        after.monthly_spend = (after.monthly_spend + adjustment.actual - monthly_release).max(0.0);
        after.transaction_count += adjustment.transactions.max(0);
        write_spend(&tx, &after)?;
        tx.commit()?;

        Ok((before, with_average(after)))
    }

    /// Replace an organization's ceilings; takes effect for the next check
    pub fn set_budget(
        &self,
        organization_id: i64,
        monthly_budget: f64,
        daily_budget: f64,
        defaults: &BudgetSettings,
        today: NaiveDate,
    ) -> Result<CostTracker> {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        load_tracker(&tx, organization_id, defaults, today)?;
        tx.execute(
            r#"
            UPDATE cost_trackers
            SET monthly_budget = ?, daily_budget = ?, updated_at = CURRENT_TIMESTAMP
            WHERE organization_id = ?
            "#,
            params![monthly_budget, daily_budget, organization_id],
        )?;
        let tracker = load_tracker(&tx, organization_id, defaults, today)?;
        tx.commit()?;
        Ok(tracker)
    }

    /// Record an LLM batch call
    pub fn insert_llm_batch(&self, record: &NewLlmBatchRecord) -> Result<i64> {
        let conn = self.conn()?;
        conn.execute(
            r#"
            INSERT INTO llm_batches (
                organization_id, model, transaction_count, tokens_used, estimated_cost,
                actual_cost, success_count, avg_confidence, processing_time_ms, error_message
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
            params![
                record.organization_id,
                record.model,
                record.transaction_count,
                record.tokens_used,
                record.estimated_cost,
                record.actual_cost,
                record.success_count,
                record.avg_confidence,
                record.processing_time_ms,
                record.error_message,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Recent LLM batch calls, newest first
    pub fn list_llm_batches(&self, organization_id: i64, limit: i64) -> Result<Vec<LlmBatchRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT id, organization_id, model, transaction_count, tokens_used, estimated_cost,
                   actual_cost, success_count, avg_confidence, processing_time_ms, error_message,
                   created_at
            FROM llm_batches
            WHERE organization_id = ?
            ORDER BY id DESC
            LIMIT ?
            "#,
        )?;

        let records = stmt
            .query_map(params![organization_id, limit], |row| {
                let created_at_str: String = row.get(11)?;
                Ok(LlmBatchRecord {
                    id: row.get(0)?,
                    organization_id: row.get(1)?,
                    model: row.get(2)?,
                    transaction_count: row.get(3)?,
                    tokens_used: row.get(4)?,
                    estimated_cost: row.get(5)?,
                    actual_cost: row.get(6)?,
                    success_count: row.get(7)?,
                    avg_confidence: row.get(8)?,
                    processing_time_ms: row.get(9)?,
                    error_message: row.get(10)?,
                    created_at: parse_datetime(&created_at_str),
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(records)
    }
}
