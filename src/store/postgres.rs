use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use super::{AlertStore, DeviceRegistry, ReadingStore, StatusLogStore, UsageStore};
use crate::db::models::{
    Alert, AlertDraft, Device, DeviceConfig, DeviceSettings, DeviceStatus, DeviceStatusLog,
    NewReading, ObservedValues, Period, Reading, UsageStatistics,
};

const READING_COLUMNS: &str = "id, device_id, reading_time, voltage, current, power, energy, \
                               frequency, power_factor, power_connected";

const DEVICE_COLUMNS: &str = "device_id, owner_id, status, relay_state, last_connection, \
                              power_limit, current_limit, warning_threshold_percent, \
                              last_voltage, last_current, last_power, last_energy";

const ALERT_COLUMNS: &str = "id, device_id, alert_type, message, is_active, created_at, resolved_at";

const USAGE_COLUMNS: &str = "device_id, period, period_start, total_kwh, total_cost, updated_at";

/// Postgres-backed implementation of every store trait.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ReadingStore for PgStore {
    async fn append(&self, r: NewReading) -> Result<Reading> {
        let sql = format!(
            r#"
            INSERT INTO readings (device_id, reading_time, voltage, current, power, energy,
                                  frequency, power_factor, power_connected)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            RETURNING {READING_COLUMNS}
            "#
        );
        sqlx::query_as::<_, Reading>(&sql)
            .bind(&r.device_id)
            .bind(r.reading_time)
            .bind(r.voltage)
            .bind(r.current)
            .bind(r.power)
            .bind(r.energy)
            .bind(r.frequency)
            .bind(r.power_factor)
            .bind(r.power_connected)
            .fetch_one(&self.pool)
            .await
            .with_context(|| format!("failed to insert reading for device {}", r.device_id))
    }

    async fn latest(&self, device_id: &str) -> Result<Option<Reading>> {
        let sql = format!(
            "SELECT {READING_COLUMNS} FROM readings \
             WHERE device_id = $1 ORDER BY reading_time DESC LIMIT 1"
        );
        Ok(sqlx::query_as::<_, Reading>(&sql)
            .bind(device_id)
            .fetch_optional(&self.pool)
            .await?)
    }

    async fn latest_before(&self, device_id: &str, before: DateTime<Utc>) -> Result<Option<Reading>> {
        let sql = format!(
            "SELECT {READING_COLUMNS} FROM readings \
             WHERE device_id = $1 AND reading_time < $2 \
             ORDER BY reading_time DESC LIMIT 1"
        );
        Ok(sqlx::query_as::<_, Reading>(&sql)
            .bind(device_id)
            .bind(before)
            .fetch_optional(&self.pool)
            .await?)
    }

    async fn range(
        &self,
        device_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Reading>> {
        let sql = format!(
            r#"
            SELECT {READING_COLUMNS}
            FROM readings
            WHERE device_id = $1
              AND reading_time >= $2
              AND reading_time <= $3
            ORDER BY reading_time ASC
            "#
        );
        Ok(sqlx::query_as::<_, Reading>(&sql)
            .bind(device_id)
            .bind(from)
            .bind(to)
            .fetch_all(&self.pool)
            .await?)
    }
}

#[async_trait]
impl DeviceRegistry for PgStore {
    async fn get(&self, device_id: &str) -> Result<Option<Device>> {
        let sql = format!("SELECT {DEVICE_COLUMNS} FROM devices WHERE device_id = $1");
        Ok(sqlx::query_as::<_, Device>(&sql)
            .bind(device_id)
            .fetch_optional(&self.pool)
            .await?)
    }

    async fn settings(&self, device_id: &str) -> Result<Option<DeviceSettings>> {
        Ok(sqlx::query_as::<_, DeviceSettings>(
            "SELECT device_id, service_type, power_limit, warning_percentage, tax_rate \
             FROM device_settings WHERE device_id = $1",
        )
        .bind(device_id)
        .fetch_optional(&self.pool)
        .await?)
    }

    async fn record_contact(
        &self,
        device_id: &str,
        at: DateTime<Utc>,
        observed: Option<ObservedValues>,
    ) -> Result<()> {
        match observed {
            Some(v) => {
                sqlx::query(
                    r#"
                    UPDATE devices
                    SET last_connection = $2,
                        last_voltage    = $3,
                        last_current    = $4,
                        last_power      = $5
                    WHERE device_id = $1
                    "#,
                )
                .bind(device_id)
                .bind(at)
                .bind(v.voltage)
                .bind(v.current)
                .bind(v.power)
                .execute(&self.pool)
                .await?;
            }
            None => {
                sqlx::query("UPDATE devices SET last_connection = $2 WHERE device_id = $1")
                    .bind(device_id)
                    .bind(at)
                    .execute(&self.pool)
                    .await?;
            }
        }
        Ok(())
    }

    async fn swap_last_energy(&self, device_id: &str, energy: f64) -> Result<Option<f64>> {
        // The row lock taken by the sub-select serialises concurrent swaps.
        let previous: Option<Option<f64>> = sqlx::query_scalar(
            r#"
            UPDATE devices d
            SET last_energy = $2
            FROM (SELECT last_energy FROM devices WHERE device_id = $1 FOR UPDATE) old
            WHERE d.device_id = $1
            RETURNING old.last_energy
            "#,
        )
        .bind(device_id)
        .bind(energy)
        .fetch_optional(&self.pool)
        .await?;
        Ok(previous.flatten())
    }

    async fn compare_and_set_status(
        &self,
        device_id: &str,
        expected: DeviceStatus,
        next: DeviceStatus,
    ) -> Result<bool> {
        let result =
            sqlx::query("UPDATE devices SET status = $3 WHERE device_id = $1 AND status = $2")
                .bind(device_id)
                .bind(expected)
                .bind(next)
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn set_relay_state(&self, device_id: &str, state: bool) -> Result<()> {
        sqlx::query("UPDATE devices SET relay_state = $2 WHERE device_id = $1")
            .bind(device_id)
            .bind(state)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn set_config(&self, device_id: &str, config: DeviceConfig) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE devices
            SET power_limit               = $2,
                current_limit             = $3,
                warning_threshold_percent = $4
            WHERE device_id = $1
            "#,
        )
        .bind(device_id)
        .bind(config.power_limit)
        .bind(config.current_limit)
        .bind(config.warning_threshold_percent)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn stale_connected(&self, before: DateTime<Utc>) -> Result<Vec<Device>> {
        let sql = format!(
            "SELECT {DEVICE_COLUMNS} FROM devices \
             WHERE status = 'connected' AND (last_connection IS NULL OR last_connection < $1)"
        );
        Ok(sqlx::query_as::<_, Device>(&sql)
            .bind(before)
            .fetch_all(&self.pool)
            .await?)
    }
}

#[async_trait]
impl AlertStore for PgStore {
    async fn create(&self, device_id: &str, draft: AlertDraft) -> Result<Alert> {
        let sql = format!(
            "INSERT INTO alerts (device_id, alert_type, message) VALUES ($1, $2, $3) \
             RETURNING {ALERT_COLUMNS}"
        );
        sqlx::query_as::<_, Alert>(&sql)
            .bind(device_id)
            .bind(draft.alert_type)
            .bind(&draft.message)
            .fetch_one(&self.pool)
            .await
            .with_context(|| format!("failed to insert alert for device {device_id}"))
    }

    async fn active(&self, device_id: &str) -> Result<Vec<Alert>> {
        let sql = format!(
            "SELECT {ALERT_COLUMNS} FROM alerts \
             WHERE device_id = $1 AND is_active ORDER BY created_at DESC"
        );
        Ok(sqlx::query_as::<_, Alert>(&sql)
            .bind(device_id)
            .fetch_all(&self.pool)
            .await?)
    }

    async fn resolve(&self, device_id: &str, id: Uuid) -> Result<Option<Alert>> {
        let sql = format!(
            "UPDATE alerts SET is_active = FALSE, resolved_at = COALESCE(resolved_at, now()) \
             WHERE id = $1 AND device_id = $2 RETURNING {ALERT_COLUMNS}"
        );
        Ok(sqlx::query_as::<_, Alert>(&sql)
            .bind(id)
            .bind(device_id)
            .fetch_optional(&self.pool)
            .await?)
    }
}

#[async_trait]
impl UsageStore for PgStore {
    async fn increment(
        &self,
        device_id: &str,
        period: Period,
        period_start: DateTime<Utc>,
        kwh: f64,
        cost: f64,
    ) -> Result<UsageStatistics> {
        let sql = format!(
            r#"
            INSERT INTO usage_statistics (device_id, period, period_start, total_kwh, total_cost)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (device_id, period, period_start) DO UPDATE
            SET total_kwh  = usage_statistics.total_kwh + EXCLUDED.total_kwh,
                total_cost = usage_statistics.total_cost + EXCLUDED.total_cost,
                updated_at = now()
            RETURNING {USAGE_COLUMNS}
            "#
        );
        sqlx::query_as::<_, UsageStatistics>(&sql)
            .bind(device_id)
            .bind(period)
            .bind(period_start)
            .bind(kwh)
            .bind(cost)
            .fetch_one(&self.pool)
            .await
            .with_context(|| format!("failed to increment {period} usage for device {device_id}"))
    }

    async fn history(
        &self,
        device_id: &str,
        period: Period,
        since: DateTime<Utc>,
    ) -> Result<Vec<UsageStatistics>> {
        let sql = format!(
            r#"
            SELECT {USAGE_COLUMNS}
            FROM usage_statistics
            WHERE device_id = $1
              AND period = $2
              AND period_start >= $3
            ORDER BY period_start ASC
            "#
        );
        Ok(sqlx::query_as::<_, UsageStatistics>(&sql)
            .bind(device_id)
            .bind(period)
            .bind(since)
            .fetch_all(&self.pool)
            .await?)
    }
}

#[async_trait]
impl StatusLogStore for PgStore {
    async fn append(
        &self,
        device_id: &str,
        status: DeviceStatus,
        reason: &str,
        details: serde_json::Value,
    ) -> Result<DeviceStatusLog> {
        sqlx::query_as::<_, DeviceStatusLog>(
            r#"
            INSERT INTO device_status_logs (device_id, status, reason, details)
            VALUES ($1, $2, $3, $4)
            RETURNING id, device_id, timestamp, status, reason, details
            "#,
        )
        .bind(device_id)
        .bind(status)
        .bind(reason)
        .bind(details)
        .fetch_one(&self.pool)
        .await
        .with_context(|| format!("failed to log status change for device {device_id}"))
    }

    async fn recent(&self, device_id: &str, limit: i64) -> Result<Vec<DeviceStatusLog>> {
        Ok(sqlx::query_as::<_, DeviceStatusLog>(
            r#"
            SELECT id, device_id, timestamp, status, reason, details
            FROM device_status_logs
            WHERE device_id = $1
            ORDER BY timestamp DESC
            LIMIT $2
            "#,
        )
        .bind(device_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?)
    }
}
