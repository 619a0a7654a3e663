use serde::Serialize;
use utoipa::ToSchema;

use crate::db::models::{DeviceSettings, ServiceType};

/// Flat administration charge added to every bill, in IDR.
pub const ADMIN_FEE: f64 = 2_500.0;

impl ServiceType {
    /// Base energy rate in IDR per kWh.
    pub fn rate_per_kwh(self) -> f64 {
        match self {
            ServiceType::R1Va450 => 415.0,
            ServiceType::R1Va900 => 1_352.0,
            ServiceType::R1Va1300 | ServiceType::R1Va2200 => 1_444.70,
            ServiceType::R2Va3500 | ServiceType::R3Va6600 => 1_699.53,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
pub struct CostBreakdown {
    pub energy_kwh: f64,
    pub service_type: ServiceType,
    pub rate_per_kwh: f64,
    pub base_cost: f64,
    /// Percentage
    pub tax_rate: f64,
    pub tax: f64,
    pub admin_fee: f64,
    pub total: f64,
}

/// `base = kWh × rate`, `tax = base × tax_rate%`, `total = base + tax + admin fee`.
pub fn cost_breakdown(energy_kwh: f64, settings: &DeviceSettings) -> CostBreakdown {
    let rate = settings.service_type.rate_per_kwh();
    let base_cost = energy_kwh * rate;
    let tax = base_cost * settings.tax_rate / 100.0;
    CostBreakdown {
        energy_kwh,
        service_type: settings.service_type,
        rate_per_kwh: rate,
        base_cost,
        tax_rate: settings.tax_rate,
        tax,
        admin_fee: ADMIN_FEE,
        total: base_cost + tax + ADMIN_FEE,
    }
}
