//! Kamstrup Multical 302 heat meter.

use crate::payload::{extract_dv_date, extract_dv_double, extract_dv_u8, find_key};
use crate::payload::{MeasurementType, ValueKind};
use crate::telegram::Telegram;

use super::{Driver, EllSecurityMode, FieldValue, LinkModeSet, Print, Quantity};

const INFO_VOLTAGE_INTERRUPTED: u8 = 0x01;
const INFO_WRONG_FLOW_DIRECTION: u8 = 0x02;
const INFO_SENSOR_T2_OUT_OF_RANGE: u8 = 0x04;
const INFO_SENSOR_T1_OUT_OF_RANGE: u8 = 0x08;
const INFO_FLOW_SENSOR_WEAK_OR_AIR: u8 = 0x10;
const INFO_TEMP_DIFF_WRONG_POLARITY: u8 = 0x20;
const INFO_VOLTAGE_TOO_LOW: u8 = 0x80;

const PRINTS: &[Print] = &[
    Print {
        name: "total_energy_consumption",
        quantity: Quantity::Energy,
        in_fields: true,
        in_json: true,
    },
    Print {
        name: "current_power_consumption",
        quantity: Quantity::Power,
        in_fields: true,
        in_json: true,
    },
    Print {
        name: "total_volume",
        quantity: Quantity::Volume,
        in_fields: true,
        in_json: true,
    },
    Print {
        name: "at_date",
        quantity: Quantity::Text,
        in_fields: false,
        in_json: true,
    },
    Print {
        name: "total_energy_consumption_at_date",
        quantity: Quantity::Energy,
        in_fields: false,
        in_json: true,
    },
    Print {
        name: "current_status",
        quantity: Quantity::Text,
        in_fields: true,
        in_json: true,
    },
];

#[derive(Debug, Default)]
pub struct Multical302 {
    info_codes: u8,
    total_energy_kwh: f64,
    target_energy_kwh: f64,
    current_power_kw: f64,
    total_volume_m3: f64,
    target_date: String,
}

impl Multical302 {
    pub fn status(&self) -> String {
        let mut s = String::new();
        if self.info_codes & INFO_VOLTAGE_INTERRUPTED != 0 {
            s.push_str("VOLTAGE_INTERRUPTED ");
        }
        if self.info_codes & INFO_WRONG_FLOW_DIRECTION != 0 {
            s.push_str("WRONG_FLOW_DIRECTION ");
        }
        if self.info_codes & INFO_SENSOR_T2_OUT_OF_RANGE != 0 {
            s.push_str("SENSOR_T2_OUT_OF_RANGE ");
        }
        if self.info_codes & INFO_SENSOR_T1_OUT_OF_RANGE != 0 {
            s.push_str("SENSOR_T1_OUT_OF_RANGE ");
        }
        if self.info_codes & INFO_FLOW_SENSOR_WEAK_OR_AIR != 0 {
            s.push_str("FLOW_SENSOR_WEAK_OR_AIR ");
        }
        if self.info_codes & INFO_TEMP_DIFF_WRONG_POLARITY != 0 {
            s.push_str("TEMP_DIFF_WRONG_POLARITY ");
        }
        if self.info_codes & 0x40 != 0 {
            s.push_str("UNKNOWN_64 ");
        }
        if self.info_codes & INFO_VOLTAGE_TOO_LOW != 0 {
            s.push_str("VOLTAGE_TOO_LOW ");
        }
        s.truncate(s.trim_end().len());
        s
    }
}

impl Driver for Multical302 {
    fn process_content(&mut self, t: &mut Telegram) {
        if let Some((offset, v)) = extract_dv_u8(&t.values, "01FF21") {
            self.info_codes = v;
            t.add_more_explanation(offset, &format!("info codes ({})", self.status()));
        }

        if let Some(key) = find_key(
            MeasurementType::Instantaneous,
            ValueKind::EnergyWh,
            Some(0),
            Some(0),
            &t.values,
        ) {
            if let Some((offset, v)) = extract_dv_double(&t.values, &key, true) {
                self.total_energy_kwh = v;
                t.add_more_explanation(
                    offset,
                    &format!("total energy consumption ({v:.6} kwh)"),
                );
            }
        }

        if let Some(key) = find_key(
            MeasurementType::Instantaneous,
            ValueKind::Volume,
            Some(0),
            Some(0),
            &t.values,
        ) {
            if let Some((offset, v)) = extract_dv_double(&t.values, &key, true) {
                self.total_volume_m3 = v;
                t.add_more_explanation(offset, &format!("total volume ({v:.6} m3)"));
            }
        }

        if let Some(key) = find_key(
            MeasurementType::Instantaneous,
            ValueKind::EnergyWh,
            Some(1),
            Some(0),
            &t.values,
        ) {
            if let Some((offset, v)) = extract_dv_double(&t.values, &key, true) {
                self.target_energy_kwh = v;
                t.add_more_explanation(
                    offset,
                    &format!("target energy consumption ({v:.6} kwh)"),
                );
            }
        }

        if let Some(key) = find_key(
            MeasurementType::Instantaneous,
            ValueKind::PowerW,
            Some(0),
            Some(0),
            &t.values,
        ) {
            if let Some((offset, v)) = extract_dv_double(&t.values, &key, true) {
                self.current_power_kw = v;
                t.add_more_explanation(
                    offset,
                    &format!("current power consumption ({v:.6} kw)"),
                );
            }
        }

        if let Some(key) = find_key(
            MeasurementType::Unknown,
            ValueKind::Date,
            Some(1),
            Some(0),
            &t.values,
        ) {
            if let Some((offset, dt)) = extract_dv_date(&t.values, &key) {
                self.target_date = dt.format("%Y-%m-%d %H:%M").to_string();
                t.add_more_explanation(offset, &format!("target date ({})", self.target_date));
            }
        }
    }

    fn prints(&self) -> &'static [Print] {
        PRINTS
    }

    fn value_of(&self, name: &str) -> Option<FieldValue> {
        match name {
            "total_energy_consumption" => Some(FieldValue::Double(self.total_energy_kwh)),
            "current_power_consumption" => Some(FieldValue::Double(self.current_power_kw)),
            "total_volume" => Some(FieldValue::Double(self.total_volume_m3)),
            "at_date" => Some(FieldValue::Text(self.target_date.clone())),
            "total_energy_consumption_at_date" => Some(FieldValue::Double(self.target_energy_kwh)),
            "current_status" => Some(FieldValue::Text(self.status())),
            _ => None,
        }
    }

    fn link_modes(&self) -> LinkModeSet {
        LinkModeSet::C1
    }

    fn expected_ell_mode(&self) -> EllSecurityMode {
        EllSecurityMode::AesCtr
    }
}
