use chrono::{Datelike, NaiveDateTime};
use sqlx::SqlitePool;

/// Daily provider-call budget, counted since local midnight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaLedger {
    pub calls_today: u32,
    /// Local day-of-month at the last counter reset.
    pub last_reset_day: u32,
    pub daily_limit: u32,
}

impl QuotaLedger {
    pub fn new(daily_limit: u32) -> Self {
        Self {
            calls_today: 0,
            last_reset_day: 0,
            daily_limit,
        }
    }

    pub fn record_calls(&mut self, calls: u32) {
        self.calls_today = self.calls_today.saturating_add(calls);
    }

    /// May be negative when the limit was overshot by a forced refetch.
    pub fn remaining_today(&self) -> i64 {
        i64::from(self.daily_limit) - i64::from(self.calls_today)
    }

    /// Zero the counter when the local calendar day has changed. Returns
    /// whether a reset happened so the caller can persist it before any
    /// other work in the scheduling cycle. Skipped while the clock is
    /// unsynchronized (no trustworthy notion of "today").
    pub fn reset_if_new_local_day(&mut self, now: Option<NaiveDateTime>) -> bool {
        let Some(now) = now else {
            return false;
        };
        let day = now.day();
        if day == self.last_reset_day {
            return false;
        }
        tracing::info!(
            day,
            previous_calls = self.calls_today,
            "New local day, resetting call counter"
        );
        self.calls_today = 0;
        self.last_reset_day = day;
        true
    }
}

/// Persistence for the single quota record. Load failures degrade to a fresh
/// ledger ("never called today") rather than taking the engine down.
pub struct QuotaStore {
    pool: SqlitePool,
}

impl QuotaStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn load(&self, daily_limit: u32) -> QuotaLedger {
        let row: Result<Option<(i64, i64)>, sqlx::Error> =
            sqlx::query_as("SELECT calls_today, last_reset_day FROM quota_ledger WHERE id = 1")
                .fetch_optional(&self.pool)
                .await;

        match row {
            Ok(Some((calls, day))) => QuotaLedger {
                calls_today: calls.max(0) as u32,
                last_reset_day: day.max(0) as u32,
                daily_limit,
            },
            Ok(None) => QuotaLedger::new(daily_limit),
            Err(e) => {
                tracing::warn!(error = %e, "Failed to load quota ledger, starting fresh");
                QuotaLedger::new(daily_limit)
            }
        }
    }

    /// Single-statement upsert: the counter is never left half-written across
    /// a restart.
    pub async fn save(&self, ledger: &QuotaLedger) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            INSERT INTO quota_ledger (id, calls_today, last_reset_day)
            VALUES (1, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                calls_today = excluded.calls_today,
                last_reset_day = excluded.last_reset_day
            "#,
        )
        .bind(i64::from(ledger.calls_today))
        .bind(i64::from(ledger.last_reset_day))
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
