//! On-demand analysis over a bounded window of one device's readings.
//!
//! The computations in [`metrics`], [`prediction`] and [`tariff`] are pure;
//! [`AnalyticsEngine`] only loads the readings and assembles the report.

pub mod metrics;
pub mod prediction;
pub mod tariff;

use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Duration, FixedOffset, Utc};
use serde::Serialize;
use utoipa::ToSchema;

use self::{
    metrics::{BaseMetrics, PeakHour, PowerFactorQuality, VoltageQuality},
    prediction::{Prediction, PredictionMethod},
    tariff::CostBreakdown,
};
use crate::{db::models::DeviceSettings, store::ReadingStore};

/// Lookback used for predictions when the caller does not choose one.
pub const DEFAULT_LOOKBACK_DAYS: u32 = 7;
pub const MAX_LOOKBACK_DAYS: u32 = 90;

#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
pub struct EnergyAnalysis {
    pub device_id: String,
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
    /// Absent when the supply was never connected in the window.
    pub metrics: Option<BaseMetrics>,
    pub cost: CostBreakdown,
    pub peak_hours: Vec<PeakHour>,
    pub voltage_quality: Option<VoltageQuality>,
    pub power_factor_quality: Option<PowerFactorQuality>,
    pub recommendations: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PredictionOptions {
    pub method: PredictionMethod,
    pub lookback_days: u32,
}

impl Default for PredictionOptions {
    fn default() -> Self {
        Self {
            method: PredictionMethod::default(),
            lookback_days: DEFAULT_LOOKBACK_DAYS,
        }
    }
}

#[derive(Clone)]
pub struct AnalyticsEngine {
    readings: Arc<dyn ReadingStore>,
    offset: FixedOffset,
}

impl AnalyticsEngine {
    pub fn new(readings: Arc<dyn ReadingStore>, offset: FixedOffset) -> Self {
        Self { readings, offset }
    }

    pub async fn analyze(
        &self,
        settings: &DeviceSettings,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<EnergyAnalysis> {
        let readings = self.readings.range(&settings.device_id, from, to).await?;
        let baseline = self
            .readings
            .latest_before(&settings.device_id, from)
            .await?
            .map(|r| r.energy);

        let base = metrics::base_metrics(&readings, baseline);
        let energy = base.as_ref().map_or_else(
            || metrics::consumed_kwh(&readings, baseline),
            |m| m.total_energy_kwh,
        );
        let peak_hours = metrics::peak_hours(&readings, self.offset);
        let voltage_quality = metrics::voltage_quality(&readings);
        let power_factor_quality = metrics::power_factor_quality(&readings);
        let recommendations = metrics::recommendations(
            base.as_ref(),
            settings.power_limit,
            voltage_quality.as_ref(),
            power_factor_quality.as_ref(),
            &peak_hours,
        );

        Ok(EnergyAnalysis {
            device_id: settings.device_id.clone(),
            from,
            to,
            metrics: base,
            cost: tariff::cost_breakdown(energy, settings),
            peak_hours,
            voltage_quality,
            power_factor_quality,
            recommendations,
        })
    }

    /// Forecast from the last `lookback_days` of readings up to `now`.
    pub async fn predict(
        &self,
        settings: &DeviceSettings,
        options: PredictionOptions,
        now: DateTime<Utc>,
    ) -> Result<Prediction> {
        let days = options.lookback_days.clamp(1, MAX_LOOKBACK_DAYS);
        let from = now - Duration::days(days as i64);
        let readings = self.readings.range(&settings.device_id, from, now).await?;
        Ok(prediction::predict(&readings, options.method, settings.service_type))
    }
}
