use std::collections::BTreeMap;

use chrono::{FixedOffset, Timelike};
use serde::Serialize;
use utoipa::ToSchema;

use crate::{
    alerts::{VOLTAGE_WARNING_MAX, VOLTAGE_WARNING_MIN},
    db::models::Reading,
    usage::energy_delta,
};

/// Power factor below this counts as poor for a sample.
pub const LOW_POWER_FACTOR: f64 = 0.85;
/// Load factor below this means the load is dominated by short peaks.
pub const PEAKY_LOAD_FACTOR: f64 = 0.3;
/// Average load above this share of the limit earns a recommendation.
pub const HIGH_AVERAGE_LOAD_PERCENT: f64 = 80.0;

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, ToSchema)]
pub struct Stats {
    pub average: f64,
    pub min: f64,
    pub max: f64,
    pub total: f64,
}

impl Stats {
    fn of(values: impl Iterator<Item = f64>) -> Option<Self> {
        let mut n = 0usize;
        let mut sum = 0.0;
        let mut min = f64::INFINITY;
        let mut max = f64::NEG_INFINITY;
        for v in values {
            n += 1;
            sum += v;
            min = min.min(v);
            max = max.max(v);
        }
        (n > 0).then(|| Stats { average: sum / n as f64, min, max, total: sum })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
pub struct BaseMetrics {
    pub reading_count: usize,
    /// Readings taken while the supply was connected.
    pub connected_count: usize,
    /// Watts
    pub power: Stats,
    /// Volts
    pub voltage: Stats,
    /// Amperes
    pub current: Stats,
    /// kWh per interval between consecutive readings. Zero when there is
    /// no interval to measure.
    pub energy: Stats,
    /// kWh consumed across the range, from counter deltas.
    pub total_energy_kwh: f64,
    /// Average power over peak power.
    pub load_factor: f64,
}

/// Electrical statistics over connected readings and energy over all of
/// them. `baseline` is the counter value from before the first reading.
/// `None` when no reading had the supply connected.
pub fn base_metrics(readings: &[Reading], baseline: Option<f64>) -> Option<BaseMetrics> {
    let connected = || readings.iter().filter(|r| r.power_connected);
    let power = Stats::of(connected().map(|r| r.power))?;
    let voltage = Stats::of(connected().map(|r| r.voltage))?;
    let current = Stats::of(connected().map(|r| r.current))?;
    let energy = Stats::of(interval_kwh(readings, baseline)).unwrap_or_default();

    Some(BaseMetrics {
        reading_count: readings.len(),
        connected_count: connected().count(),
        power,
        voltage,
        current,
        energy,
        total_energy_kwh: energy.total,
        load_factor: if power.max > 0.0 { power.average / power.max } else { 0.0 },
    })
}

/// Sum of counter deltas between consecutive readings, starting from
/// `baseline` when one is known.
pub fn consumed_kwh(readings: &[Reading], baseline: Option<f64>) -> f64 {
    interval_kwh(readings, baseline).sum()
}

fn interval_kwh(readings: &[Reading], baseline: Option<f64>) -> impl Iterator<Item = f64> + '_ {
    let mut previous = baseline;
    readings.iter().filter_map(move |r| {
        let delta = previous.map(|p| energy_delta(Some(p), r.energy));
        previous = Some(r.energy);
        delta
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, ToSchema)]
pub struct PeakHour {
    /// Local hour of day, 0-23.
    pub hour: u32,
    pub average_power: f64,
    pub reading_count: usize,
}

/// Top three local hours of the day by average power.
pub fn peak_hours(readings: &[Reading], offset: FixedOffset) -> Vec<PeakHour> {
    let mut buckets: BTreeMap<u32, (f64, usize)> = BTreeMap::new();
    for r in readings.iter().filter(|r| r.power_connected) {
        let hour = r.reading_time.with_timezone(&offset).hour();
        let bucket = buckets.entry(hour).or_default();
        bucket.0 += r.power;
        bucket.1 += 1;
    }

    let mut hours: Vec<PeakHour> = buckets
        .into_iter()
        .map(|(hour, (sum, n))| PeakHour {
            hour,
            average_power: sum / n as f64,
            reading_count: n,
        })
        .collect();
    hours.sort_by(|a, b| {
        b.average_power
            .total_cmp(&a.average_power)
            .then(a.hour.cmp(&b.hour))
    });
    hours.truncate(3);
    hours
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum QualityGrade {
    Excellent,
    Good,
    Fair,
    Poor,
}

impl QualityGrade {
    fn from_score(score: f64, excellent: f64, good: f64, fair: f64) -> Self {
        if score >= excellent {
            QualityGrade::Excellent
        } else if score >= good {
            QualityGrade::Good
        } else if score >= fair {
            QualityGrade::Fair
        } else {
            QualityGrade::Poor
        }
    }

    pub fn needs_attention(self) -> bool {
        matches!(self, QualityGrade::Fair | QualityGrade::Poor)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, ToSchema)]
pub struct VoltageQuality {
    /// Share of connected readings inside the normal band.
    pub in_range_percent: f64,
    pub min: f64,
    pub max: f64,
    pub grade: QualityGrade,
}

/// Graded on the share of readings inside 200-240 V: 95/85/70 %.
pub fn voltage_quality(readings: &[Reading]) -> Option<VoltageQuality> {
    let volts: Vec<f64> = readings
        .iter()
        .filter(|r| r.power_connected)
        .map(|r| r.voltage)
        .collect();
    let stats = Stats::of(volts.iter().copied())?;
    let in_range = volts
        .iter()
        .filter(|v| (VOLTAGE_WARNING_MIN..=VOLTAGE_WARNING_MAX).contains(*v))
        .count();
    let in_range_percent = in_range as f64 / volts.len() as f64 * 100.0;

    Some(VoltageQuality {
        in_range_percent,
        min: stats.min,
        max: stats.max,
        grade: QualityGrade::from_score(in_range_percent, 95.0, 85.0, 70.0),
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, ToSchema)]
pub struct PowerFactorQuality {
    pub average: f64,
    /// Share of samples below 0.85.
    pub low_percent: f64,
    pub grade: QualityGrade,
}

/// Graded on the average power factor: 0.95/0.85/0.7.
pub fn power_factor_quality(readings: &[Reading]) -> Option<PowerFactorQuality> {
    let pfs: Vec<f64> = readings
        .iter()
        .filter(|r| r.power_connected)
        .filter_map(|r| r.power_factor)
        .collect();
    let stats = Stats::of(pfs.iter().copied())?;
    let low = pfs.iter().filter(|pf| **pf < LOW_POWER_FACTOR).count();

    Some(PowerFactorQuality {
        average: stats.average,
        low_percent: low as f64 / pfs.len() as f64 * 100.0,
        grade: QualityGrade::from_score(stats.average, 0.95, 0.85, 0.7),
    })
}

/// Advice derived from threshold breaches in an analysis.
pub fn recommendations(
    metrics: Option<&BaseMetrics>,
    power_limit: f64,
    voltage: Option<&VoltageQuality>,
    power_factor: Option<&PowerFactorQuality>,
    peak_hours: &[PeakHour],
) -> Vec<String> {
    let mut out = Vec::new();

    if let Some(m) = metrics {
        if power_limit > 0.0 {
            let avg_percent = m.power.average / power_limit * 100.0;
            if avg_percent > HIGH_AVERAGE_LOAD_PERCENT {
                out.push(format!(
                    "Average load is {avg_percent:.0}% of the {power_limit:.0} W limit; \
                     consider upgrading the connection or reducing continuous loads"
                ));
            }
            if m.power.max > power_limit {
                out.push(format!(
                    "Peak demand of {:.0} W exceeded the {power_limit:.0} W limit; \
                     avoid running heavy appliances at the same time",
                    m.power.max
                ));
            }
        }
        if m.power.max > 0.0 && m.load_factor < PEAKY_LOAD_FACTOR {
            out.push(format!(
                "Load factor is {:.2}; spreading usage more evenly would reduce peak demand",
                m.load_factor
            ));
        }
    }

    if let Some(v) = voltage.filter(|v| v.grade.needs_attention()) {
        out.push(format!(
            "Only {:.0}% of readings were within {VOLTAGE_WARNING_MIN:.0}-{VOLTAGE_WARNING_MAX:.0} V; \
             consider a voltage stabiliser or contacting the utility",
            v.in_range_percent
        ));
    }

    if let Some(pf) = power_factor.filter(|pf| pf.grade.needs_attention()) {
        out.push(format!(
            "Average power factor is {:.2}; inductive loads such as motors or old \
             fluorescent ballasts may need correction",
            pf.average
        ));
    }

    if let Some(top) = peak_hours.first() {
        out.push(format!(
            "Highest usage is around {:02}:00 ({:.0} W on average); shifting flexible loads \
             away from this hour lowers peak demand",
            top.hour, top.average_power
        ));
    }

    out
}

#[cfg(test)]
mod tests {
    use chrono::{DateTime, Duration, Utc};
    use uuid::Uuid;

    use super::*;

    fn at(hour_utc: u32, minute: u32) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(&format!("2024-05-01T{hour_utc:02}:{minute:02}:00Z"))
            .unwrap()
            .with_timezone(&Utc)
    }

    fn reading(time: DateTime<Utc>, voltage: f64, power: f64, energy: f64, pf: Option<f64>) -> Reading {
        Reading {
            id: Uuid::new_v4(),
            device_id: "dev1".into(),
            reading_time: time,
            voltage,
            current: power / voltage,
            power,
            energy,
            frequency: Some(50.0),
            power_factor: pf,
            power_connected: true,
        }
    }

    fn off(time: DateTime<Utc>, energy: f64) -> Reading {
        Reading {
            voltage: 0.0,
            current: 0.0,
            power: 0.0,
            frequency: None,
            power_factor: None,
            power_connected: false,
            ..reading(time, 1.0, 0.0, energy, None)
        }
    }

    #[test]
    fn base_metrics_ignore_disconnected_samples_for_electrical_stats() {
        let readings = vec![
            reading(at(1, 0), 220.0, 100.0, 1.0, Some(0.9)),
            off(at(1, 10), 1.0),
            reading(at(1, 20), 230.0, 300.0, 1.5, Some(0.9)),
        ];
        let m = base_metrics(&readings, None).unwrap();
        assert_eq!(m.reading_count, 3);
        assert_eq!(m.connected_count, 2);
        assert_eq!(m.power, Stats { average: 200.0, min: 100.0, max: 300.0, total: 400.0 });
        assert_eq!(m.voltage.min, 220.0);
        assert_eq!(m.voltage.total, 450.0);
        assert!((m.total_energy_kwh - 0.5).abs() < 1e-12);
        assert!((m.load_factor - 200.0 / 300.0).abs() < 1e-12);
    }

    #[test]
    fn aggregates_cover_every_quantity() {
        let readings = vec![
            reading(at(1, 0), 200.0, 400.0, 1.0, None),
            reading(at(1, 10), 200.0, 600.0, 1.25, None),
            reading(at(1, 20), 200.0, 800.0, 2.0, None),
        ];
        let m = base_metrics(&readings, Some(0.5)).unwrap();

        assert_eq!(m.power, Stats { average: 600.0, min: 400.0, max: 800.0, total: 1800.0 });
        assert_eq!(m.voltage, Stats { average: 200.0, min: 200.0, max: 200.0, total: 600.0 });
        assert_eq!(m.current.min, 2.0);
        assert_eq!(m.current.max, 4.0);
        assert!((m.current.total - 9.0).abs() < 1e-12);

        // Intervals: 0.5 -> 1.0 -> 1.25 -> 2.0
        assert_eq!(m.energy.min, 0.25);
        assert_eq!(m.energy.max, 0.75);
        assert!((m.energy.total - 1.5).abs() < 1e-12);
        assert!((m.energy.average - 0.5).abs() < 1e-12);
        assert_eq!(m.total_energy_kwh, m.energy.total);
    }

    #[test]
    fn single_reading_has_zero_energy_stats_without_a_baseline() {
        let readings = vec![reading(at(1, 0), 220.0, 100.0, 3.0, None)];
        let m = base_metrics(&readings, None).unwrap();
        assert_eq!(m.energy, Stats::default());
        assert_eq!(m.total_energy_kwh, 0.0);
    }

    #[test]
    fn baseline_counts_the_interval_into_the_window() {
        let readings = vec![reading(at(2, 0), 220.0, 100.0, 3.0, None)];
        assert_eq!(consumed_kwh(&readings, None), 0.0);
        assert!((consumed_kwh(&readings, Some(2.2)) - 0.8).abs() < 1e-12);
    }

    #[test]
    fn no_connected_readings_means_no_metrics() {
        assert!(base_metrics(&[off(at(1, 0), 1.0)], None).is_none());
        assert!(base_metrics(&[], Some(1.0)).is_none());
    }

    #[test]
    fn consumption_survives_counter_reset() {
        let readings = vec![
            reading(at(1, 0), 220.0, 100.0, 5.0, None),
            reading(at(2, 0), 220.0, 100.0, 6.0, None),
            reading(at(3, 0), 220.0, 100.0, 0.4, None),
        ];
        assert!((consumed_kwh(&readings, None) - 1.4).abs() < 1e-12);
    }

    #[test]
    fn peak_hours_rank_local_hours_by_average_power() {
        let offset = FixedOffset::east_opt(7 * 3600).unwrap();
        let readings = vec![
            reading(at(11, 0), 220.0, 900.0, 1.0, None), // 18:00 local
            reading(at(11, 30), 220.0, 700.0, 1.0, None),
            reading(at(1, 0), 220.0, 100.0, 1.0, None), // 08:00 local
            reading(at(5, 0), 220.0, 500.0, 1.0, None), // 12:00 local
            reading(at(13, 0), 220.0, 300.0, 1.0, None), // 20:00 local
        ];

        let peaks = peak_hours(&readings, offset);

        assert_eq!(peaks.len(), 3);
        assert_eq!(peaks[0], PeakHour { hour: 18, average_power: 800.0, reading_count: 2 });
        assert_eq!(peaks[1].hour, 12);
        assert_eq!(peaks[2].hour, 20);
    }

    #[test]
    fn voltage_quality_grades_by_in_band_share() {
        let base = at(0, 0);
        let mut readings: Vec<_> = (0..9)
            .map(|i| reading(base + Duration::minutes(i), 225.0, 100.0, 1.0, None))
            .collect();
        readings.push(reading(base + Duration::minutes(10), 250.0, 100.0, 1.0, None));

        let q = voltage_quality(&readings).unwrap();
        assert_eq!(q.in_range_percent, 90.0);
        assert_eq!(q.grade, QualityGrade::Good);
        assert_eq!(q.max, 250.0);
    }

    #[test]
    fn power_factor_quality_grades_by_average() {
        let readings = vec![
            reading(at(1, 0), 220.0, 100.0, 1.0, Some(0.8)),
            reading(at(1, 1), 220.0, 100.0, 1.0, Some(0.7)),
        ];
        let q = power_factor_quality(&readings).unwrap();
        assert!((q.average - 0.75).abs() < 1e-12);
        assert_eq!(q.low_percent, 100.0);
        assert_eq!(q.grade, QualityGrade::Fair);
        assert!(power_factor_quality(&[reading(at(1, 0), 220.0, 1.0, 1.0, None)]).is_none());
    }

    #[test]
    fn recommendations_follow_breaches() {
        let readings = vec![
            reading(at(1, 0), 180.0, 1200.0, 1.0, Some(0.6)),
            reading(at(1, 5), 185.0, 900.0, 1.2, Some(0.6)),
        ];
        let m = base_metrics(&readings, None).unwrap();
        let v = voltage_quality(&readings).unwrap();
        let pf = power_factor_quality(&readings).unwrap();
        let peaks = peak_hours(&readings, FixedOffset::east_opt(0).unwrap());

        let recs = recommendations(Some(&m), 1000.0, Some(&v), Some(&pf), &peaks);

        assert!(recs.iter().any(|r| r.contains("Average load")));
        assert!(recs.iter().any(|r| r.contains("Peak demand")));
        assert!(recs.iter().any(|r| r.contains("voltage stabiliser")));
        assert!(recs.iter().any(|r| r.contains("power factor")));
        assert!(recs.iter().any(|r| r.contains("01:00")));
    }

    #[test]
    fn healthy_usage_gets_only_the_peak_hour_hint() {
        let readings = vec![
            reading(at(1, 0), 225.0, 200.0, 1.0, Some(0.98)),
            reading(at(1, 5), 226.0, 220.0, 1.1, Some(0.97)),
        ];
        let m = base_metrics(&readings, None).unwrap();
        let v = voltage_quality(&readings).unwrap();
        let pf = power_factor_quality(&readings).unwrap();
        let peaks = peak_hours(&readings, FixedOffset::east_opt(0).unwrap());

        let recs = recommendations(Some(&m), 1000.0, Some(&v), Some(&pf), &peaks);

        assert_eq!(recs.len(), 1);
    }
}
