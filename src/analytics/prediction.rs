//! Consumption forecasts from recent power readings.
//!
//! Every method estimates an average power draw and projects it over the
//! daily, weekly and monthly horizons. Confidence falls as reading-to-reading
//! power swings grow relative to the mean.

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::db::models::{Reading, ServiceType};

/// Forecast horizons in hours: day, week, 30-day month.
pub const HORIZONS_HOURS: [u32; 3] = [24, 168, 720];

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum PredictionMethod {
    /// Mean power over the lookback window.
    #[default]
    Simple,
    /// Mean power with linearly increasing weight on newer readings.
    Weighted,
    /// Least-squares trend of power over time, extrapolated forward.
    Linear,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, ToSchema)]
pub struct HorizonForecast {
    pub hours: u32,
    pub energy_kwh: f64,
    /// Base energy cost at the device's tariff, before tax and fees.
    pub estimated_cost: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
pub struct Prediction {
    pub method: PredictionMethod,
    pub based_on_readings: usize,
    /// Watts
    pub average_power: f64,
    pub forecasts: Vec<HorizonForecast>,
    /// 0 (no idea) to 1 (perfectly steady load).
    pub confidence_level: f64,
}

impl Prediction {
    pub fn forecast(&self, hours: u32) -> Option<&HorizonForecast> {
        self.forecasts.iter().find(|f| f.hours == hours)
    }
}

/// Forecast from readings ordered by time. Disconnected readings count as
/// zero draw.
pub fn predict(readings: &[Reading], method: PredictionMethod, service_type: ServiceType) -> Prediction {
    let rate = service_type.rate_per_kwh();
    let powers: Vec<f64> = readings.iter().map(|r| r.power).collect();

    let horizon_kwh: Box<dyn Fn(u32) -> f64> = match method {
        PredictionMethod::Simple => {
            let avg = mean(&powers);
            Box::new(move |h| avg * h as f64 / 1000.0)
        }
        PredictionMethod::Weighted => {
            let avg = weighted_mean(&powers);
            Box::new(move |h| avg * h as f64 / 1000.0)
        }
        PredictionMethod::Linear => {
            let trend = Trend::fit(readings);
            Box::new(move |h| trend.energy_kwh(h as f64))
        }
    };

    let forecasts = HORIZONS_HOURS
        .iter()
        .map(|&hours| {
            let energy_kwh = horizon_kwh(hours).max(0.0);
            HorizonForecast { hours, energy_kwh, estimated_cost: energy_kwh * rate }
        })
        .collect::<Vec<_>>();

    let average_power = forecasts
        .first()
        .map(|f| f.energy_kwh * 1000.0 / f.hours as f64)
        .unwrap_or_default();

    Prediction {
        method,
        based_on_readings: readings.len(),
        average_power,
        forecasts,
        confidence_level: confidence(&powers),
    }
}

/// `1 / (1 + mean|Δpower| / mean power)`, in `[0, 1]`. Fewer than two
/// readings give no confidence.
pub fn confidence(powers: &[f64]) -> f64 {
    if powers.len() < 2 {
        return 0.0;
    }
    let avg = mean(powers);
    let swing = powers.windows(2).map(|w| (w[1] - w[0]).abs()).sum::<f64>()
        / (powers.len() - 1) as f64;
    if avg <= 0.0 {
        return if swing == 0.0 { 1.0 } else { 0.0 };
    }
    (1.0 / (1.0 + swing / avg)).clamp(0.0, 1.0)
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Weights 1, 2, ..., n from oldest to newest.
fn weighted_mean(values: &[f64]) -> f64 {
    let (sum, weights) = values
        .iter()
        .enumerate()
        .fold((0.0, 0.0), |(s, w), (i, v)| {
            let weight = (i + 1) as f64;
            (s + v * weight, w + weight)
        });
    if weights == 0.0 {
        0.0
    } else {
        sum / weights
    }
}

/// `power(t) = intercept + slope * t`, with `t` in hours since the first
/// reading.
#[derive(Debug, Clone, Copy)]
struct Trend {
    intercept: f64,
    slope: f64,
    /// Hours from the first to the last reading.
    end: f64,
}

impl Trend {
    fn fit(readings: &[Reading]) -> Self {
        let Some(first) = readings.first() else {
            return Trend { intercept: 0.0, slope: 0.0, end: 0.0 };
        };
        let points: Vec<(f64, f64)> = readings
            .iter()
            .map(|r| {
                let t = (r.reading_time - first.reading_time).num_seconds() as f64 / 3600.0;
                (t, r.power)
            })
            .collect();

        let n = points.len() as f64;
        let mean_t = points.iter().map(|p| p.0).sum::<f64>() / n;
        let mean_p = points.iter().map(|p| p.1).sum::<f64>() / n;
        let var_t: f64 = points.iter().map(|p| (p.0 - mean_t).powi(2)).sum();
        let cov: f64 = points.iter().map(|p| (p.0 - mean_t) * (p.1 - mean_p)).sum();

        let slope = if var_t > 0.0 { cov / var_t } else { 0.0 };
        let end = points.last().map(|p| p.0).unwrap_or_default();
        Trend { intercept: mean_p - slope * mean_t, slope, end }
    }

    /// kWh over `hours` starting at the last reading: the integral of the
    /// trend line, with negative draw clipped to zero.
    fn energy_kwh(&self, hours: f64) -> f64 {
        let at = |t: f64| self.intercept + self.slope * t;
        let (start, stop) = (self.end, self.end + hours);
        let (p0, p1) = (at(start), at(stop));

        let watt_hours = if p0 >= 0.0 && p1 >= 0.0 {
            (p0 + p1) / 2.0 * hours
        } else if p0 <= 0.0 && p1 <= 0.0 {
            0.0
        } else {
            // Line crosses zero inside the horizon; keep the positive part.
            let zero = -self.intercept / self.slope;
            if p0 > 0.0 {
                p0 / 2.0 * (zero - start)
            } else {
                p1 / 2.0 * (stop - zero)
            }
        };
        watt_hours / 1000.0
    }
}
