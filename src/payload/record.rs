//! DIF/VIF record stream walker.

use crate::constants::*;
use crate::util::hex::encode_hex_upper;

use super::{DvEntry, DvEntryMap, MeasurementType, ParserError};

/// Longest DIFE/VIFE chain accepted before the stream is declared broken.
const MAX_EXTENSIONS: usize = 10;

/// Result of walking a record stream.
///
/// `values` holds everything parsed up to the first unrecoverable defect;
/// `error` reports that defect so the caller can warn exactly once.
#[derive(Debug, Default)]
pub struct ParsedRecords {
    pub values: DvEntryMap,
    /// (absolute offset, hex) pairs for the explanation trace.
    pub trace: Vec<(usize, String)>,
    pub error: Option<ParserError>,
}

/// Walks the application-layer record stream.
///
/// `payload` starts at the first DIF byte; `base_offset` is its absolute
/// position inside the raw frame, so every reported offset points into the
/// original telegram.
pub fn parse_records(payload: &[u8], base_offset: usize) -> ParsedRecords {
    let mut out = ParsedRecords::default();
    let mut i = 0usize;

    while i < payload.len() {
        let dif = payload[i];

        if dif == DIF_IDLE_FILLER {
            out.trace.push((base_offset + i, "2F".into()));
            i += 1;
            continue;
        }

        if dif == DIF_MANUFACTURER_SPECIFIC || dif == DIF_MORE_RECORDS_FOLLOW {
            // Everything after this DIF belongs to the manufacturer block.
            let raw = payload[i + 1..].to_vec();
            let key = encode_hex_upper(&[dif]);
            out.trace.push((base_offset + i, key.clone()));
            if !raw.is_empty() {
                out.trace.push((base_offset + i + 1, encode_hex_upper(&raw)));
            }
            let data_offset = if raw.is_empty() {
                base_offset + i
            } else {
                base_offset + i + 1
            };
            out.values.insert(
                key,
                (
                    data_offset,
                    DvEntry {
                        measurement_type: MeasurementType::Instantaneous,
                        dif,
                        vif: 0,
                        storage_nr: 0,
                        tariff: 0,
                        subunit: 0,
                        raw,
                        plain_text_vif: None,
                    },
                ),
            );
            break;
        }

        if dif & DIF_MASK_DATA == 0x0F {
            // Reserved special-function DIFs; nothing after them is parseable.
            break;
        }

        match parse_one_record(payload, i, base_offset, &mut out) {
            Ok(next) => i = next,
            Err(e) => {
                out.error = Some(e);
                break;
            }
        }
    }

    out
}

fn parse_one_record(
    payload: &[u8],
    start: usize,
    base_offset: usize,
    out: &mut ParsedRecords,
) -> Result<usize, ParserError> {
    let mut i = start;
    let dif = payload[i];
    let mut key_bytes = vec![dif];
    i += 1;

    let measurement_type = MeasurementType::from_dif(dif);
    let mut storage_nr = ((dif & DIF_MASK_STORAGE_LSB) >> 6) as u32;
    let mut tariff = 0u32;
    let mut subunit = 0u32;

    // DIFE chain: each extension contributes 4 storage bits, 2 tariff bits
    // and 1 subunit bit above the ones before it.
    let mut ext = dif & EXTENSION_BIT;
    let mut n = 0usize;
    while ext != 0 {
        let dife = *payload
            .get(i)
            .ok_or(ParserError::PrematureEnd(base_offset + i))?;
        if n >= MAX_EXTENSIONS {
            return Err(ParserError::ChainTooLong(base_offset + i));
        }
        key_bytes.push(dife);
        storage_nr |= ((dife & DIFE_MASK_STORAGE) as u32) << (1 + 4 * n);
        tariff |= (((dife & DIFE_MASK_TARIFF) >> 4) as u32) << (2 * n);
        subunit |= (((dife & DIFE_MASK_SUBUNIT) >> 6) as u32) << n;
        ext = dife & EXTENSION_BIT;
        i += 1;
        n += 1;
    }

    let vif = *payload
        .get(i)
        .ok_or(ParserError::PrematureEnd(base_offset + i))?;
    key_bytes.push(vif);
    i += 1;

    // Plain-text VIF: an LVAR length plus ASCII unit characters, stored in
    // reverse on the wire.
    let mut plain_text_vif = None;
    if vif & !EXTENSION_BIT == VIF_PLAIN_TEXT {
        let len = *payload
            .get(i)
            .ok_or(ParserError::PrematureEnd(base_offset + i))? as usize;
        i += 1;
        let chars = payload
            .get(i..i + len)
            .ok_or(ParserError::PrematureEnd(base_offset + i))?;
        let text: String = chars
            .iter()
            .rev()
            .map(|b| char::from(*b))
            .collect();
        plain_text_vif = Some(text);
        i += len;
    }

    // VIFE chain. The 0xFB/0xFD/0xFF escapes carry the extension bit, so the
    // extended-table code lands in the key the same way plain VIFEs do.
    let mut ext = vif & EXTENSION_BIT;
    let mut n = 0usize;
    while ext != 0 {
        let vife = *payload
            .get(i)
            .ok_or(ParserError::PrematureEnd(base_offset + i))?;
        if n >= MAX_EXTENSIONS {
            return Err(ParserError::ChainTooLong(base_offset + i));
        }
        key_bytes.push(vife);
        ext = vife & EXTENSION_BIT;
        i += 1;
        n += 1;
    }

    // Payload width from the DIF data-field nibble; 0x0D means an LVAR byte
    // precedes the data.
    let data_len = match dif_data_length(dif) {
        Some(len) => len,
        None => {
            let lvar = *payload
                .get(i)
                .ok_or(ParserError::PrematureEnd(base_offset + i))?;
            i += 1;
            variable_data_length(lvar)?
        }
    };
    if data_len > payload.len().saturating_sub(i) {
        // A truncated final record cannot be resynced past.
        return Err(ParserError::PrematureEnd(base_offset + i));
    }

    // Zero-length records (selection for readout) anchor at their DIF so
    // the offset always lands inside the frame.
    let data_offset = if data_len == 0 {
        base_offset + start
    } else {
        base_offset + i
    };
    let raw = payload[i..i + data_len].to_vec();
    i += data_len;

    out.trace
        .push((base_offset + start, encode_hex_upper(&key_bytes)));
    if !raw.is_empty() {
        out.trace.push((data_offset, encode_hex_upper(&raw)));
    }

    // Later records with the same DV-key overwrite earlier ones. Some meters
    // (Techem Compact V) really do repeat a key per billing period; the
    // original implementation kept the last writer and drivers rely on it.
    out.values.insert(
        encode_hex_upper(&key_bytes),
        (
            data_offset,
            DvEntry {
                measurement_type,
                dif,
                vif,
                storage_nr,
                tariff,
                subunit,
                raw,
                plain_text_vif,
            },
        ),
    );

    Ok(i)
}

/// Payload width encoded in the DIF data-field nibble; `None` = variable.
pub fn dif_data_length(dif: u8) -> Option<usize> {
    match dif & DIF_MASK_DATA {
        0x0 => Some(0),
        0x1 => Some(1),
        0x2 => Some(2),
        0x3 => Some(3),
        0x4 => Some(4),
        0x5 => Some(4), // 32-bit real
        0x6 => Some(6),
        0x7 => Some(8),
        0x8 => Some(0), // selection for readout
        0x9 => Some(1),
        0xA => Some(2),
        0xB => Some(3),
        0xC => Some(4),
        0xD => None, // variable length, LVAR follows
        0xE => Some(6), // 12 digit BCD
        _ => Some(8),
    }
}

fn variable_data_length(lvar: u8) -> Result<usize, ParserError> {
    match lvar {
        0x00..=0xBF => Ok(lvar as usize),
        0xC0..=0xCF => Ok((lvar - 0xC0) as usize * 2),
        0xD0..=0xDF => Ok((lvar - 0xD0) as usize * 2 + 1),
        0xE0..=0xEF => Ok((lvar - 0xE0) as usize + 64),
        _ => Err(ParserError::BadVariableLength(lvar)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::hex::decode_hex;

    #[test]
    fn test_dif_data_length_table() {
        let cases = [
            (0x00, Some(0)),
            (0x01, Some(1)),
            (0x02, Some(2)),
            (0x03, Some(3)),
            (0x04, Some(4)),
            (0x05, Some(4)),
            (0x06, Some(6)),
            (0x07, Some(8)),
            (0x09, Some(1)),
            (0x0A, Some(2)),
            (0x0C, Some(4)),
            (0x0D, None),
            (0x0E, Some(6)),
        ];
        for (dif, expected) in cases {
            assert_eq!(dif_data_length(dif), expected, "dif {dif:#04x}");
        }
        // Function and storage bits do not change the width.
        assert_eq!(dif_data_length(0x43), Some(3));
        assert_eq!(dif_data_length(0x8E), Some(6));
    }

    #[test]
    fn test_simple_record() {
        // 03 06 2C0000: 24-bit integer, energy kWh.
        let payload = decode_hex("03062C0000").unwrap();
        let parsed = parse_records(&payload, 15);
        assert!(parsed.error.is_none());
        let (offset, entry) = parsed.values.get("0306").expect("record present");
        assert_eq!(*offset, 17);
        assert_eq!(entry.measurement_type, MeasurementType::Instantaneous);
        assert_eq!(entry.storage_nr, 0);
        assert_eq!(entry.raw, vec![0x2C, 0x00, 0x00]);
    }

    #[test]
    fn test_storage_bit_and_dife_accumulation() {
        // 43 06: DIF storage lsb set -> storagenr 1.
        let payload = decode_hex("4306000000").unwrap();
        let parsed = parse_records(&payload, 0);
        assert_eq!(parsed.values.get("4306").unwrap().1.storage_nr, 1);

        // 8E 40 FD 3A ...: DIFE 0x40 -> subunit 1, storage/tariff 0.
        let payload = decode_hex("8E40FD3A000000000000").unwrap();
        let parsed = parse_records(&payload, 0);
        let entry = &parsed.values.get("8E40FD3A").unwrap().1;
        assert_eq!(entry.subunit, 1);
        assert_eq!(entry.storage_nr, 0);
        assert_eq!(entry.tariff, 0);
    }

    #[test]
    fn test_dife_storage_pieces() {
        // DIFE low nibble extends storage above the DIF bit:
        // DIF 0xC2 (storage lsb 1, ext) + DIFE 0x04 -> storage 1 | (4 << 1) = 9.
        let payload = decode_hex("C2046C7F2A").unwrap();
        let parsed = parse_records(&payload, 0);
        let entry = &parsed.values.get("C2046C").unwrap().1;
        assert_eq!(entry.storage_nr, 9);
    }

    #[test]
    fn test_vendor_extension_key() {
        // 04 FF 07: escape table, code 0x07 joins the key.
        let payload = decode_hex("04FF072B010000").unwrap();
        let parsed = parse_records(&payload, 0);
        assert!(parsed.values.contains_key("04FF07"));
        assert_eq!(parsed.values["04FF07"].1.raw, vec![0x2B, 0x01, 0x00, 0x00]);
    }

    #[test]
    fn test_idle_filler_skipped() {
        let payload = decode_hex("2F2F03062C00002F").unwrap();
        let parsed = parse_records(&payload, 0);
        assert_eq!(parsed.values.len(), 1);
        assert!(parsed.values.contains_key("0306"));
    }

    #[test]
    fn test_duplicate_key_last_writer_wins() {
        let payload = decode_hex("0215640002 15C800").unwrap();
        let parsed = parse_records(&payload, 0);
        assert_eq!(parsed.values.len(), 1);
        assert_eq!(parsed.values["0215"].1.raw, vec![0xC8, 0x00]);
    }

    #[test]
    fn test_plain_text_vif() {
        // 01 7C 02 'h' '%': unit characters arrive reversed, so this is "%h".
        let payload = vec![0x01, 0x7C, 0x02, b'h', b'%', 0x2A];
        let parsed = parse_records(&payload, 0);
        let entry = &parsed.values.get("017C").unwrap().1;
        assert_eq!(entry.plain_text_vif.as_deref(), Some("%h"));
        assert_eq!(entry.raw, vec![0x2A]);
    }

    #[test]
    fn test_variable_length_record() {
        // 0D FD 3A LVAR=3 "abc"
        let payload = vec![0x0D, 0xFD, 0x3A, 0x03, b'a', b'b', b'c'];
        let parsed = parse_records(&payload, 0);
        assert_eq!(parsed.values["0DFD3A"].1.raw, b"abc".to_vec());
    }

    #[test]
    fn test_truncated_record_reports_error() {
        let payload = decode_hex("04062C00").unwrap(); // 32-bit value, 2 bytes present
        let parsed = parse_records(&payload, 0);
        assert!(matches!(parsed.error, Some(ParserError::PrematureEnd(_))));
        assert!(parsed.values.is_empty());
    }

    #[test]
    fn test_records_before_defect_survive() {
        let payload = decode_hex("03062C0000 0406AABB").unwrap();
        let parsed = parse_records(&payload, 0);
        assert!(parsed.error.is_some());
        assert!(parsed.values.contains_key("0306"));
    }

    #[test]
    fn test_offsets_inside_frame() {
        let payload = decode_hex("03062C000043060000000314630000426C7F2A022D130001FF2100").unwrap();
        let base = 11;
        let parsed = parse_records(&payload, base);
        assert!(parsed.error.is_none());
        assert_eq!(parsed.values.len(), 6);
        for (key, (offset, entry)) in &parsed.values {
            assert!(
                *offset >= base && *offset + entry.raw.len() <= base + payload.len(),
                "offset of {key} out of frame"
            );
        }
    }

    #[test]
    fn test_manufacturer_specific_block() {
        let payload = decode_hex("0FDEADBEEF").unwrap();
        let parsed = parse_records(&payload, 0);
        let entry = &parsed.values.get("0F").unwrap().1;
        assert_eq!(entry.raw, vec![0xDE, 0xAD, 0xBE, 0xEF]);
    }
}
