//! Typed extraction from the DV map.
//!
//! Drivers locate records either by a literal DV-key ("04FF07") or through
//! [`find_key`], then pull a typed value out. All numeric extraction is
//! little-endian; BCD follows the EN 13757-3 rules: a nibble above 9 poisons
//! the record to NaN and a leading 0xF nibble marks a negative number.

use chrono::{NaiveDate, NaiveDateTime};

use super::vif::{scale_to_canonical, ValueKind};
use super::{DvEntryMap, MeasurementType};

/// Linear search for the first entry matching the given criteria.
///
/// `MeasurementType::Unknown` matches any function field; `None` for
/// storage or tariff matches any value.
pub fn find_key(
    measurement_type: MeasurementType,
    kind: ValueKind,
    storage_nr: Option<u32>,
    tariff: Option<u32>,
    values: &DvEntryMap,
) -> Option<String> {
    values
        .iter()
        .find(|(_, (_, entry))| {
            let mt_ok = matches!(measurement_type, MeasurementType::Unknown)
                || entry.measurement_type == measurement_type;
            // Escape codes select other tables and never match a
            // primary-table kind; a plain extension bit (VIFE combinables
            // follow) does not change the quantity.
            let vif_ok = !matches!(entry.vif, 0xEF | 0xFB | 0xFD | 0xFF)
                && kind.matches(entry.vif & 0x7F);
            let storage_ok = storage_nr.map_or(true, |s| entry.storage_nr == s);
            let tariff_ok = tariff.map_or(true, |t| entry.tariff == t);
            mt_ok && vif_ok && storage_ok && tariff_ok
        })
        .map(|(key, _)| key.clone())
}

/// Little-endian u8 from the record payload.
pub fn extract_dv_u8(values: &DvEntryMap, key: &str) -> Option<(usize, u8)> {
    let (offset, entry) = values.get(key)?;
    Some((*offset, *entry.raw.first()?))
}

/// Little-endian u16 from the record payload.
pub fn extract_dv_u16(values: &DvEntryMap, key: &str) -> Option<(usize, u16)> {
    let (offset, entry) = values.get(key)?;
    let b = entry.raw.get(..2)?;
    Some((*offset, u16::from_le_bytes([b[0], b[1]])))
}

/// Little-endian u32 from the record payload.
pub fn extract_dv_u32(values: &DvEntryMap, key: &str) -> Option<(usize, u32)> {
    let (offset, entry) = values.get(key)?;
    let b = entry.raw.get(..4)?;
    Some((*offset, u32::from_le_bytes([b[0], b[1], b[2], b[3]])))
}

/// Numeric value of the record, decoded per the DIF coding.
///
/// With `auto_scale` the VIF decimal exponent is folded in so the result is
/// in the canonical unit of its quantity (kWh, m3, kW, m3/h, degrees C).
/// Records whose VIF carries no scaling (manufacturer extensions) come back
/// raw either way.
pub fn extract_dv_double(
    values: &DvEntryMap,
    key: &str,
    auto_scale: bool,
) -> Option<(usize, f64)> {
    let (offset, entry) = values.get(key)?;

    let value = match entry.dif & 0x0F {
        0x1..=0x4 | 0x6 | 0x7 => le_uint(&entry.raw) as f64,
        0x5 => {
            let b = entry.raw.get(..4)?;
            f32::from_le_bytes([b[0], b[1], b[2], b[3]]) as f64
        }
        0x9..=0xC | 0xE => decode_bcd(&entry.raw).unwrap_or(f64::NAN),
        _ => return None,
    };

    let scaled = if auto_scale {
        match scale_to_canonical(entry.vif) {
            Some(factor) => value * factor,
            None => value,
        }
    } else {
        value
    };

    Some((*offset, scaled))
}

/// Broken-down date from a type G (2 byte) or type F (4 byte) record.
pub fn extract_dv_date(values: &DvEntryMap, key: &str) -> Option<(usize, NaiveDateTime)> {
    let (offset, entry) = values.get(key)?;
    let dt = match entry.raw.len() {
        2 => decode_type_g(&entry.raw),
        4 => decode_type_f(&entry.raw),
        _ => None,
    }?;
    Some((*offset, dt))
}

fn le_uint(raw: &[u8]) -> u64 {
    let mut v = 0u64;
    for (i, b) in raw.iter().enumerate().take(8) {
        v |= (*b as u64) << (8 * i);
    }
    v
}

/// BCD decode, least significant byte first on the wire.
///
/// Returns `None` when a digit nibble exceeds 9; the caller maps that to NaN
/// and annotates the record. A 0xF top nibble in the most significant byte
/// flags a negative value.
fn decode_bcd(raw: &[u8]) -> Option<f64> {
    let mut negative = false;
    let mut value = 0f64;
    for (idx, b) in raw.iter().enumerate().rev() {
        let hi = b >> 4;
        let lo = b & 0x0F;
        if idx == raw.len() - 1 && hi == 0x0F {
            negative = true;
        } else {
            if hi > 9 {
                return None;
            }
            value = value * 10.0 + hi as f64;
        }
        if lo > 9 {
            return None;
        }
        value = value * 10.0 + lo as f64;
    }
    Some(if negative { -value } else { value })
}

/// Type G: date only, midnight time.
fn decode_type_g(b: &[u8]) -> Option<NaiveDateTime> {
    let day = (b[0] & 0x1F) as u32;
    let month = (b[1] & 0x0F) as u32;
    let year = ((((b[0] & 0xE0) >> 5) | ((b[1] & 0xF0) >> 1)) as i32) + 2000;
    NaiveDate::from_ymd_opt(year, month, day)?.and_hms_opt(0, 0, 0)
}

/// Type F: date and time down to the minute.
fn decode_type_f(b: &[u8]) -> Option<NaiveDateTime> {
    let minute = (b[0] & 0x3F) as u32;
    let hour = (b[1] & 0x1F) as u32;
    let day = (b[2] & 0x1F) as u32;
    let month = (b[3] & 0x0F) as u32;
    let year = ((((b[2] & 0xE0) >> 5) | ((b[3] & 0xF0) >> 1)) as i32) + 2000;
    NaiveDate::from_ymd_opt(year, month, day)?.and_hms_opt(hour, minute, 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payload::parse_records;
    use crate::util::hex::decode_hex;

    fn parsed(hex: &str) -> DvEntryMap {
        let payload = decode_hex(hex).unwrap();
        let out = parse_records(&payload, 0);
        assert!(out.error.is_none(), "parse failed: {:?}", out.error);
        out.values
    }

    #[test]
    fn test_extract_uints() {
        let values = parsed("01FF2107 04FF072B010000");
        assert_eq!(extract_dv_u8(&values, "01FF21"), Some((3, 0x07)));
        assert_eq!(extract_dv_u32(&values, "04FF07"), Some((7, 0x0000012B)));
        assert_eq!(extract_dv_u8(&values, "01FF99"), None);
    }

    #[test]
    fn test_extract_double_scaled_int() {
        // Energy kWh, 24-bit 0x00002C = 44.
        let values = parsed("03062C0000");
        let (_, v) = extract_dv_double(&values, "0306", true).unwrap();
        assert_eq!(v, 44.0);

        // Volume 10^-2 m3, 0x63 = 99 -> 0.99 m3.
        let values = parsed("0314630000");
        let (_, v) = extract_dv_double(&values, "0314", true).unwrap();
        assert!((v - 0.99).abs() < 1e-9);

        // Power 10^2 W, 0x0013 = 19 -> 1.9 kW.
        let values = parsed("022D1300");
        let (_, v) = extract_dv_double(&values, "022D", true).unwrap();
        assert!((v - 1.9).abs() < 1e-9);
    }

    #[test]
    fn test_extract_double_bcd() {
        // 12 digit BCD counter, unscaled (dimensionless VIFE).
        let values = parsed("0EFD3A563412000000");
        let (_, v) = extract_dv_double(&values, "0EFD3A", false).unwrap();
        assert_eq!(v, 123456.0);
    }

    #[test]
    fn test_bcd_error_nibble_yields_nan() {
        // 0xAB in a BCD field: digit nibbles above 9.
        let values = parsed("0A15AB00");
        let (_, v) = extract_dv_double(&values, "0A15", true).unwrap();
        assert!(v.is_nan());
    }

    #[test]
    fn test_bcd_negative() {
        // Top nibble 0xF marks negative: F1 23 (LE) = -123... digits 1,2,3.
        let values = parsed("0A1523F1");
        let (_, v) = extract_dv_double(&values, "0A15", false).unwrap();
        assert_eq!(v, -123.0);
    }

    #[test]
    fn test_extract_date_type_g() {
        let values = parsed("426C7F2A");
        let (_, dt) = extract_dv_date(&values, "426C").unwrap();
        assert_eq!(dt.format("%Y-%m-%d %H:%M").to_string(), "2019-10-31 00:00");
    }

    #[test]
    fn test_extract_date_type_f() {
        // minute=30, hour=14, day=31, month=10, year=2019.
        let values = parsed("046D1E8E7F2A");
        let (_, dt) = extract_dv_date(&values, "046D").unwrap();
        assert_eq!(dt.format("%Y-%m-%d %H:%M").to_string(), "2019-10-31 14:30");
    }

    #[test]
    fn test_find_key_by_kind_and_storage() {
        let values =
            parsed("03062C000043060000000314630000426C7F2A022D130001FF2100");

        let key = find_key(
            MeasurementType::Instantaneous,
            ValueKind::EnergyWh,
            Some(0),
            Some(0),
            &values,
        );
        assert_eq!(key.as_deref(), Some("0306"));

        let key = find_key(
            MeasurementType::Instantaneous,
            ValueKind::EnergyWh,
            Some(1),
            Some(0),
            &values,
        );
        assert_eq!(key.as_deref(), Some("4306"));

        let key = find_key(
            MeasurementType::Unknown,
            ValueKind::Date,
            Some(1),
            Some(0),
            &values,
        );
        assert_eq!(key.as_deref(), Some("426C"));

        // Vendor extension keys never match primary-table kinds.
        let key = find_key(
            MeasurementType::Unknown,
            ValueKind::PowerW,
            None,
            None,
            &values,
        );
        assert_eq!(key.as_deref(), Some("022D"));
    }

    #[test]
    fn test_find_key_no_match() {
        let values = parsed("03062C0000");
        assert_eq!(
            find_key(
                MeasurementType::Instantaneous,
                ValueKind::VolumeFlow,
                None,
                None,
                &values
            ),
            None
        );
    }
}
