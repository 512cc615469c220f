//! Value Information Field tables.
//!
//! The primary VIF table (EN 13757-3 annex) encodes a physical quantity plus
//! a decimal exponent in the low bits. `ValueKind` groups the ranges drivers
//! search for, and `scale_to_canonical` folds the exponent into one factor
//! that brings the raw integer into the canonical unit used by meter state:
//! kWh for energy, m3 for volume, kW for power, m3/h for flow, degrees
//! Celsius for temperatures.

/// Quantity ranges of the primary VIF table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    EnergyWh,
    EnergyJ,
    Volume,
    Mass,
    OnTime,
    OperatingTime,
    PowerW,
    PowerJh,
    VolumeFlow,
    VolumeFlowExt,
    MassFlow,
    FlowTemperature,
    ReturnTemperature,
    TemperatureDifference,
    ExternalTemperature,
    Pressure,
    HeatCostAllocation,
    Date,
    DateTime,
    FabricationNo,
}

impl ValueKind {
    /// True if a primary VIF byte falls inside this kind's range.
    pub fn matches(&self, vif: u8) -> bool {
        match self {
            ValueKind::EnergyWh => (0x00..=0x07).contains(&vif),
            ValueKind::EnergyJ => (0x08..=0x0F).contains(&vif),
            ValueKind::Volume => (0x10..=0x17).contains(&vif),
            ValueKind::Mass => (0x18..=0x1F).contains(&vif),
            ValueKind::OnTime => (0x20..=0x23).contains(&vif),
            ValueKind::OperatingTime => (0x24..=0x27).contains(&vif),
            ValueKind::PowerW => (0x28..=0x2F).contains(&vif),
            ValueKind::PowerJh => (0x30..=0x37).contains(&vif),
            ValueKind::VolumeFlow => (0x38..=0x3F).contains(&vif),
            ValueKind::VolumeFlowExt => (0x40..=0x4F).contains(&vif),
            ValueKind::MassFlow => (0x50..=0x57).contains(&vif),
            ValueKind::FlowTemperature => (0x58..=0x5B).contains(&vif),
            ValueKind::ReturnTemperature => (0x5C..=0x5F).contains(&vif),
            ValueKind::TemperatureDifference => (0x60..=0x63).contains(&vif),
            ValueKind::ExternalTemperature => (0x64..=0x67).contains(&vif),
            ValueKind::Pressure => (0x68..=0x6B).contains(&vif),
            ValueKind::HeatCostAllocation => vif == 0x6E,
            ValueKind::Date => vif == 0x6C,
            ValueKind::DateTime => vif == 0x6D,
            ValueKind::FabricationNo => vif == 0x78,
        }
    }
}

/// Factor that scales a raw record value into the canonical unit for its
/// quantity, or `None` when the VIF carries no numeric scaling (dates,
/// identifiers, manufacturer extensions).
pub fn scale_to_canonical(vif: u8) -> Option<f64> {
    let e = |n: i32| 10f64.powi(n);
    match vif {
        // Energy a..a+7: 10^(n-3) Wh, canonical kWh.
        0x00..=0x07 => Some(e((vif & 0x07) as i32 - 6)),
        // Energy 10^n J, canonical kWh.
        0x08..=0x0F => Some(e((vif & 0x07) as i32) / 3.6e6),
        // Volume 10^(n-6) m3.
        0x10..=0x17 => Some(e((vif & 0x07) as i32 - 6)),
        // Mass 10^(n-3) kg.
        0x18..=0x1F => Some(e((vif & 0x07) as i32 - 3)),
        // On time / operating time, canonical hours.
        0x20..=0x27 => Some(match vif & 0x03 {
            0 => 1.0 / 3600.0,
            1 => 1.0 / 60.0,
            2 => 1.0,
            _ => 24.0,
        }),
        // Power 10^(n-3) W, canonical kW.
        0x28..=0x2F => Some(e((vif & 0x07) as i32 - 6)),
        // Power 10^n J/h, canonical kW.
        0x30..=0x37 => Some(e((vif & 0x07) as i32) / 3.6e6),
        // Volume flow 10^(n-6) m3/h.
        0x38..=0x3F => Some(e((vif & 0x07) as i32 - 6)),
        // Volume flow 10^(n-7) m3/min, canonical m3/h.
        0x40..=0x47 => Some(e((vif & 0x07) as i32 - 7) * 60.0),
        // Volume flow 10^(n-9) m3/s, canonical m3/h.
        0x48..=0x4F => Some(e((vif & 0x07) as i32 - 9) * 3600.0),
        // Mass flow 10^(n-3) kg/h.
        0x50..=0x57 => Some(e((vif & 0x07) as i32 - 3)),
        // Temperatures and differences, 10^(n-3) C or K.
        0x58..=0x6B => Some(e((vif & 0x03) as i32 - 3)),
        // Heat cost allocation units are dimensionless.
        0x6E => Some(1.0),
        _ => None,
    }
}

/// Human readable canonical unit, used by explanation annotations.
pub fn canonical_unit(vif: u8) -> &'static str {
    match vif {
        0x00..=0x0F => "kwh",
        0x10..=0x17 => "m3",
        0x18..=0x1F => "kg",
        0x20..=0x27 => "h",
        0x28..=0x37 => "kw",
        0x38..=0x4F => "m3/h",
        0x50..=0x57 => "kg/h",
        0x58..=0x5B | 0x5C..=0x5F | 0x64..=0x67 => "c",
        0x60..=0x63 => "k",
        0x68..=0x6B => "bar",
        0x6E => "hca",
        _ => "",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_energy_scaling() {
        // VIF 0x06 is kWh resolution: raw 44 -> 44.000 kWh.
        assert_eq!(scale_to_canonical(0x06), Some(1.0));
        // VIF 0x04 is 10 Wh resolution.
        assert_eq!(scale_to_canonical(0x04), Some(0.01));
    }

    #[test]
    fn test_volume_and_power_scaling() {
        assert_eq!(scale_to_canonical(0x14), Some(0.01)); // 10^-2 m3
        assert_eq!(scale_to_canonical(0x2D), Some(0.1)); // 100 W -> 0.1 kW
        assert_eq!(scale_to_canonical(0x3B), Some(0.001)); // l/h -> m3/h
    }

    #[test]
    fn test_temperature_scaling() {
        assert_eq!(scale_to_canonical(0x59), Some(0.01));
        assert_eq!(scale_to_canonical(0x5D), Some(0.01));
    }

    #[test]
    fn test_kind_ranges() {
        assert!(ValueKind::EnergyWh.matches(0x06));
        assert!(!ValueKind::EnergyWh.matches(0x14));
        assert!(ValueKind::Volume.matches(0x14));
        assert!(ValueKind::VolumeFlow.matches(0x3B));
        assert!(ValueKind::FlowTemperature.matches(0x59));
        assert!(ValueKind::ReturnTemperature.matches(0x5D));
        assert!(ValueKind::Date.matches(0x6C));
    }

    #[test]
    fn test_no_scale_for_special_vifs() {
        assert_eq!(scale_to_canonical(0x6C), None); // date
        assert_eq!(scale_to_canonical(0xFF), None); // manufacturer specific
        assert_eq!(scale_to_canonical(0x78), None); // fabrication no
    }
}
