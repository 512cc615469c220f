//! Techem Compact V heat meter.
//!
//! The CI field is 0xA2, so the whole application layer is manufacturer
//! specific: two little-endian 16 bit kWh counters at fixed payload offsets,
//! previous billing period at bytes 3..5 and current period at bytes 7..9.

use crate::payload::{DvEntry, MeasurementType};
use crate::telegram::Telegram;
use crate::util::hex::encode_hex_upper;

use super::{Driver, FieldValue, LinkModeSet, Print, Quantity};

const PRINTS: &[Print] = &[
    Print {
        name: "total",
        quantity: Quantity::Energy,
        in_fields: true,
        in_json: true,
    },
    Print {
        name: "current",
        quantity: Quantity::Energy,
        in_fields: true,
        in_json: true,
    },
    Print {
        name: "previous",
        quantity: Quantity::Energy,
        in_fields: true,
        in_json: true,
    },
];

#[derive(Debug, Default)]
pub struct Compact5 {
    total_energy_kwh: f64,
    curr_energy_kwh: f64,
    prev_energy_kwh: f64,
}

impl Driver for Compact5 {
    fn process_content(&mut self, t: &mut Telegram) {
        let content = t.extract_payload().to_vec();
        if content.len() < 9 {
            log::warn!(
                "(compact5) payload too short ({} bytes) from {}",
                content.len(),
                t.id_hex()
            );
            return;
        }

        let base = t.payload_offset;

        let prev = 256.0 * content[4] as f64 + content[3] as f64;
        let prev_raw = vec![content[3], content[4]];
        let prev_offset = base + 3;
        // Both periods share the 0215 pseudo key; the insert below is
        // intentionally last-writer-wins, matching how these duplicate keys
        // have always been handled.
        t.values.insert(
            "0215".to_string(),
            (prev_offset, pseudo_entry(&prev_raw)),
        );
        t.add_explanation(prev_offset, &prev_raw, "");
        t.add_more_explanation(
            prev_offset,
            &format!("energy used in previous billing period ({prev:.6} kwh)"),
        );

        let curr = 256.0 * content[8] as f64 + content[7] as f64;
        let curr_raw = vec![content[7], content[8]];
        let curr_offset = base + 7;
        t.values.insert(
            "0215".to_string(),
            (curr_offset, pseudo_entry(&curr_raw)),
        );
        t.add_explanation(curr_offset, &curr_raw, "");
        t.add_more_explanation(
            curr_offset,
            &format!("energy used in current billing period ({curr:.6} kwh)"),
        );

        self.prev_energy_kwh = prev;
        self.curr_energy_kwh = curr;
        self.total_energy_kwh = prev + curr;

        log::debug!(
            "(compact5) {} prev {} curr {} raw {}",
            t.id_hex(),
            prev,
            curr,
            encode_hex_upper(&content)
        );
    }

    fn prints(&self) -> &'static [Print] {
        PRINTS
    }

    fn value_of(&self, name: &str) -> Option<FieldValue> {
        match name {
            "total" => Some(FieldValue::Double(self.total_energy_kwh)),
            "current" => Some(FieldValue::Double(self.curr_energy_kwh)),
            "previous" => Some(FieldValue::Double(self.prev_energy_kwh)),
            _ => None,
        }
    }

    fn link_modes(&self) -> LinkModeSet {
        LinkModeSet::C1 | LinkModeSet::T1
    }
}

fn pseudo_entry(raw: &[u8]) -> DvEntry {
    DvEntry {
        measurement_type: MeasurementType::Instantaneous,
        dif: 0x02,
        vif: 0x15,
        storage_nr: 0,
        tariff: 0,
        subunit: 0,
        raw: raw.to_vec(),
        plain_text_vif: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::hex::decode_hex;

    fn telegram() -> Telegram {
        // Techem, media 0x04, CI 0xA2, proprietary payload.
        let mut body = decode_hex("446850443322114504A2").unwrap();
        body.extend_from_slice(&[
            0xAA, 0xBB, 0xCC, 0x64, 0x00, 0xDD, 0xEE, 0xC8, 0x00, 0xFF,
        ]);
        let mut frame = vec![body.len() as u8];
        frame.extend_from_slice(&body);
        Telegram::parse(&frame, None).unwrap()
    }

    #[test]
    fn test_compact5_periods() {
        let mut t = telegram();
        let mut m = Compact5::default();
        m.process_content(&mut t);

        assert_eq!(m.prev_energy_kwh, 100.0);
        assert_eq!(m.curr_energy_kwh, 200.0);
        assert_eq!(m.total_energy_kwh, 300.0);
    }

    #[test]
    fn test_duplicate_pseudo_key_keeps_current_period() {
        let mut t = telegram();
        let mut m = Compact5::default();
        m.process_content(&mut t);

        // Last writer wins on the shared 0215 key.
        let (offset, entry) = &t.values["0215"];
        assert_eq!(*offset, t.payload_offset + 7);
        assert_eq!(entry.raw, vec![0xC8, 0x00]);
    }

    #[test]
    fn test_short_payload_leaves_state_untouched() {
        let mut body = decode_hex("446850443322114504A2").unwrap();
        body.extend_from_slice(&[0x01, 0x02]);
        let mut frame = vec![body.len() as u8];
        frame.extend_from_slice(&body);
        let mut t = Telegram::parse(&frame, None).unwrap();

        let mut m = Compact5::default();
        m.process_content(&mut t);
        assert_eq!(m.total_energy_kwh, 0.0);
    }
}
