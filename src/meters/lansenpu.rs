//! Lansen pulse counter.
//!
//! Sends two 12 digit BCD counters as dimensionless records; counter b sits
//! on subunit 1. 12 BCD digits stay below 2^52, so the counters fit a double
//! without loss.

use crate::payload::extract_dv_double;
use crate::telegram::Telegram;

use super::{Driver, FieldValue, LinkModeSet, Print, Quantity, TplSecurityMode};

const PRINTS: &[Print] = &[
    Print {
        name: "counter_a",
        quantity: Quantity::Counter,
        in_fields: true,
        in_json: true,
    },
    Print {
        name: "counter_b",
        quantity: Quantity::Counter,
        in_fields: true,
        in_json: true,
    },
];

#[derive(Debug, Default)]
pub struct LansenPu {
    pulse_counter_a: f64,
    pulse_counter_b: f64,
}

impl Driver for LansenPu {
    fn process_content(&mut self, t: &mut Telegram) {
        if let Some((offset, v)) = extract_dv_double(&t.values, "0EFD3A", false) {
            self.pulse_counter_a = v;
            t.add_more_explanation(offset, &format!("pulse counter a ({v:.0})"));
        }
        if let Some((offset, v)) = extract_dv_double(&t.values, "8E40FD3A", false) {
            self.pulse_counter_b = v;
            t.add_more_explanation(offset, &format!("pulse counter b ({v:.0})"));
        }
    }

    fn prints(&self) -> &'static [Print] {
        PRINTS
    }

    fn value_of(&self, name: &str) -> Option<FieldValue> {
        match name {
            "counter_a" => Some(FieldValue::Double(self.pulse_counter_a)),
            "counter_b" => Some(FieldValue::Double(self.pulse_counter_b)),
            _ => None,
        }
    }

    fn link_modes(&self) -> LinkModeSet {
        LinkModeSet::T1
    }

    fn expected_tpl_mode(&self) -> TplSecurityMode {
        TplSecurityMode::AesCbcIv
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::hex::decode_hex;

    #[test]
    fn test_lansenpu_counters() {
        let mut body = decode_hex("443330998877661402 78").unwrap();
        body.extend_from_slice(&decode_hex("0EFD3A2143650000008E40FD3A120000000000").unwrap());
        let mut frame = vec![body.len() as u8];
        frame.extend_from_slice(&body);
        let mut t = Telegram::parse(&frame, None).unwrap();

        let mut m = LansenPu::default();
        m.process_content(&mut t);
        assert_eq!(m.pulse_counter_a, 654321.0);
        assert_eq!(m.pulse_counter_b, 12.0);
    }

    #[test]
    fn test_missing_records_leave_defaults() {
        let mut body = decode_hex("44333099887766140278").unwrap();
        body.extend_from_slice(&decode_hex("03062C0000").unwrap());
        let mut frame = vec![body.len() as u8];
        frame.extend_from_slice(&body);
        let mut t = Telegram::parse(&frame, None).unwrap();

        let mut m = LansenPu::default();
        m.process_content(&mut t);
        assert_eq!(m.pulse_counter_a, 0.0);
        assert_eq!(m.pulse_counter_b, 0.0);
    }
}
