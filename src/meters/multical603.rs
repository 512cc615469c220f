//! Kamstrup Multical 603 heat meter.

use crate::payload::{extract_dv_date, extract_dv_double, extract_dv_u32, extract_dv_u8, find_key};
use crate::payload::{MeasurementType, ValueKind};
use crate::telegram::Telegram;

use super::{Driver, EllSecurityMode, FieldValue, LinkModeSet, Print, Quantity};

const INFO_VOLTAGE_INTERRUPTED: u8 = 0x01;
const INFO_LOW_BATTERY_LEVEL: u8 = 0x02;
const INFO_EXTERNAL_ALARM: u8 = 0x04;
const INFO_SENSOR_T1_ABOVE_MEASURING_RANGE: u8 = 0x08;
const INFO_SENSOR_T2_ABOVE_MEASURING_RANGE: u8 = 0x10;
const INFO_SENSOR_T1_BELOW_MEASURING_RANGE: u8 = 0x20;
const INFO_SENSOR_T2_BELOW_MEASURING_RANGE: u8 = 0x40;
const INFO_TEMP_DIFF_WRONG_POLARITY: u8 = 0x80;

const PRINTS: &[Print] = &[
    Print {
        name: "total_energy_consumption",
        quantity: Quantity::Energy,
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
        name: "volume_flow",
        quantity: Quantity::Flow,
        in_fields: true,
        in_json: true,
    },
    Print {
        name: "t1_temperature",
        quantity: Quantity::Temperature,
        in_fields: true,
        in_json: true,
    },
    Print {
        name: "t2_temperature",
        quantity: Quantity::Temperature,
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
        name: "current_status",
        quantity: Quantity::Text,
        in_fields: true,
        in_json: true,
    },
    // Vendor extension counters; units undocumented, kept as raw counts.
    Print {
        name: "energy_forward",
        quantity: Quantity::Counter,
        in_fields: false,
        in_json: true,
    },
    Print {
        name: "energy_returned",
        quantity: Quantity::Counter,
        in_fields: false,
        in_json: true,
    },
];

#[derive(Debug)]
pub struct Multical603 {
    info_codes: u8,
    total_energy_kwh: f64,
    total_volume_m3: f64,
    volume_flow_m3h: f64,
    t1_temperature_c: f64,
    has_t1_temperature: bool,
    t2_temperature_c: f64,
    has_t2_temperature: bool,
    target_date: String,
    energy_forward_count: u32,
    energy_returned_count: u32,
}

impl Default for Multical603 {
    fn default() -> Self {
        Multical603 {
            info_codes: 0,
            total_energy_kwh: 0.0,
            total_volume_m3: 0.0,
            volume_flow_m3h: 0.0,
            // Sentinel until a real temperature record arrives.
            t1_temperature_c: 127.0,
            has_t1_temperature: false,
            t2_temperature_c: 127.0,
            has_t2_temperature: false,
            target_date: String::new(),
            energy_forward_count: 0,
            energy_returned_count: 0,
        }
    }
}

impl Multical603 {
    pub fn status(&self) -> String {
        let mut s = String::new();
        if self.info_codes & INFO_VOLTAGE_INTERRUPTED != 0 {
            s.push_str("VOLTAGE_INTERRUPTED ");
        }
        if self.info_codes & INFO_LOW_BATTERY_LEVEL != 0 {
            s.push_str("LOW_BATTERY_LEVEL ");
        }
        if self.info_codes & INFO_EXTERNAL_ALARM != 0 {
            s.push_str("EXTERNAL_ALARM ");
        }
        if self.info_codes & INFO_SENSOR_T1_ABOVE_MEASURING_RANGE != 0 {
            s.push_str("SENSOR_T1_ABOVE_MEASURING_RANGE ");
        }
        if self.info_codes & INFO_SENSOR_T2_ABOVE_MEASURING_RANGE != 0 {
            s.push_str("SENSOR_T2_ABOVE_MEASURING_RANGE ");
        }
        if self.info_codes & INFO_SENSOR_T1_BELOW_MEASURING_RANGE != 0 {
            s.push_str("SENSOR_T1_BELOW_MEASURING_RANGE ");
        }
        if self.info_codes & INFO_SENSOR_T2_BELOW_MEASURING_RANGE != 0 {
            s.push_str("SENSOR_T2_BELOW_MEASURING_RANGE ");
        }
        if self.info_codes & INFO_TEMP_DIFF_WRONG_POLARITY != 0 {
            s.push_str("TEMP_DIFF_WRONG_POLARITY ");
        }
        s.truncate(s.trim_end().len());
        s
    }

    pub fn has_t1_temperature(&self) -> bool {
        self.has_t1_temperature
    }

    pub fn has_t2_temperature(&self) -> bool {
        self.has_t2_temperature
    }
}

impl Driver for Multical603 {
    fn process_content(&mut self, t: &mut Telegram) {
        if let Some((offset, v)) = extract_dv_u8(&t.values, "04FF22") {
            self.info_codes = v;
            t.add_more_explanation(offset, &format!("info codes ({})", self.status()));
        }

        if let Some((offset, v)) = extract_dv_u32(&t.values, "04FF07") {
            self.energy_forward_count = v;
            t.add_more_explanation(offset, &format!("energy forward ({v})"));
        }

        if let Some((offset, v)) = extract_dv_u32(&t.values, "04FF08") {
            self.energy_returned_count = v;
            t.add_more_explanation(offset, &format!("energy returned ({v})"));
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
            MeasurementType::Unknown,
            ValueKind::VolumeFlow,
            Some(0),
            Some(0),
            &t.values,
        ) {
            if let Some((offset, v)) = extract_dv_double(&t.values, &key, true) {
                self.volume_flow_m3h = v;
                t.add_more_explanation(offset, &format!("volume flow ({v:.6} m3/h)"));
            }
        }

        if let Some(key) = find_key(
            MeasurementType::Instantaneous,
            ValueKind::FlowTemperature,
            Some(0),
            Some(0),
            &t.values,
        ) {
            if let Some((offset, v)) = extract_dv_double(&t.values, &key, true) {
                self.t1_temperature_c = v;
                self.has_t1_temperature = true;
                t.add_more_explanation(offset, &format!("T1 flow temperature ({v:.6} c)"));
            }
        }

        if let Some(key) = find_key(
            MeasurementType::Instantaneous,
            ValueKind::ReturnTemperature,
            Some(0),
            Some(0),
            &t.values,
        ) {
            if let Some((offset, v)) = extract_dv_double(&t.values, &key, true) {
                self.t2_temperature_c = v;
                self.has_t2_temperature = true;
                t.add_more_explanation(offset, &format!("T2 return temperature ({v:.6} c)"));
            }
        }

        if let Some(key) = find_key(
            MeasurementType::Unknown,
            ValueKind::Date,
            Some(0),
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
            "total_volume" => Some(FieldValue::Double(self.total_volume_m3)),
            "volume_flow" => Some(FieldValue::Double(self.volume_flow_m3h)),
            "t1_temperature" => Some(FieldValue::Double(self.t1_temperature_c)),
            "t2_temperature" => Some(FieldValue::Double(self.t2_temperature_c)),
            "at_date" => Some(FieldValue::Text(self.target_date.clone())),
            "current_status" => Some(FieldValue::Text(self.status())),
            "energy_forward" => Some(FieldValue::Double(self.energy_forward_count as f64)),
            "energy_returned" => Some(FieldValue::Double(self.energy_returned_count as f64)),
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
