//! Telegram decoding: link layer headers, decryption, record extraction.
//!
//! A [`Telegram`] is immutable after decode apart from explanation
//! annotations added by drivers. Decode order follows the wire: DLL header,
//! optional ELL (AES-CTR), optional TPL header (AES-CBC-IV mode 5), then the
//! DIF/VIF record stream. Encrypted regions are decrypted in place inside
//! the working copy of the frame so every recorded offset keeps pointing at
//! the byte position it came from.

pub mod crypto;

use std::collections::HashMap;

use nom::bytes::complete::take;
use nom::number::complete::{be_u8, le_u16};
use nom::IResult;
use once_cell::sync::Lazy;
use thiserror::Error;

use crate::constants::*;
use crate::payload::{parse_records, DvEntryMap};
use crate::util::hex::encode_hex;

use crypto::{aes_cbc_decrypt, aes_ctr_process, build_ell_iv, build_tpl_iv, crc16_en13757, AesKey};

/// Well known manufacturer FLAG codes, for human readable explanations.
static MANUFACTURERS: Lazy<HashMap<u16, &'static str>> = Lazy::new(|| {
    let mut m = HashMap::new();
    m.insert(0x2C2D, "Kamstrup");
    m.insert(0x5068, "Techem");
    m.insert(0x3033, "Lansen");
    m.insert(0x4CAE, "Sontex");
    m.insert(0x1593, "Elster");
    m.insert(0x4DEE, "Itron");
    m
});

/// Telegram decode failures.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TelegramError {
    #[error("telegram too short: {0} bytes")]
    TooShort(usize),

    #[error("telegram from {id} is encrypted but no key is configured")]
    MissingKey { id: String },

    #[error("telegram from {id} failed the decryption integrity check")]
    Integrity { id: String },

    #[error("malformed telegram: {0}")]
    Malformed(String),
}

/// Data link layer header of a wM-Bus frame.
#[derive(Debug, Clone, PartialEq)]
pub struct DllHeader {
    pub length: u8,
    pub c_field: u8,
    /// FLAG manufacturer id, little-endian on the wire.
    pub manufacturer: u16,
    /// Meter address, least significant byte first on the wire.
    pub id: [u8; 4],
    pub version: u8,
    pub device_type: u8,
}

/// Extended link layer header (CI 0x8C/0x8D).
#[derive(Debug, Clone, PartialEq)]
pub struct EllHeader {
    pub cc: u8,
    pub acc: u8,
    /// Session number; bits 13..16 select the security mode (1 = AES-CTR).
    pub sn: [u8; 4],
}

impl EllHeader {
    pub fn is_encrypted(&self) -> bool {
        (u32::from_le_bytes(self.sn) >> 13) & 0x7 == 1
    }
}

/// Transport layer header (CI 0x72/0x7A).
#[derive(Debug, Clone, PartialEq)]
pub struct TplHeader {
    pub acc: u8,
    pub status: u8,
    pub configuration: u16,
}

impl TplHeader {
    /// Security mode from the configuration word; 5 is AES-CBC with IV.
    pub fn security_mode(&self) -> u8 {
        ((self.configuration >> 8) & 0x1F) as u8
    }

    /// Number of 16 byte blocks that are encrypted in mode 5.
    pub fn encrypted_blocks(&self) -> usize {
        ((self.configuration >> 4) & 0x0F) as usize
    }
}

/// One annotated byte range of the frame, for human/debug output only.
#[derive(Debug, Clone, PartialEq)]
pub struct Explanation {
    pub offset: usize,
    pub hex: String,
    pub info: String,
}

/// A decoded telegram.
#[derive(Debug, Clone)]
pub struct Telegram {
    /// Working copy of the frame; encrypted regions hold plaintext after
    /// decode so offsets stay meaningful.
    pub frame: Vec<u8>,
    pub dll: DllHeader,
    pub ell: Option<EllHeader>,
    pub tpl: Option<TplHeader>,
    /// Application layer CI (after the ELL, when one is present).
    pub ci: u8,
    /// Offset of the first application payload byte inside `frame`.
    pub payload_offset: usize,
    pub values: DvEntryMap,
    pub explanations: Vec<Explanation>,
}

impl Telegram {
    /// Decodes a wM-Bus frame (L-field first, CRCs already stripped).
    ///
    /// `key` is consulted only when the telegram announces encryption; a
    /// missing key or a failed post-decrypt check aborts the decode, so a
    /// telegram that fails its integrity check can never reach a driver.
    pub fn parse(frame: &[u8], key: Option<&AesKey>) -> Result<Telegram, TelegramError> {
        if frame.len() < 11 {
            return Err(TelegramError::TooShort(frame.len()));
        }

        let (_, dll) =
            parse_dll(frame).map_err(|e| TelegramError::Malformed(format!("dll: {e:?}")))?;

        let mut t = Telegram {
            frame: frame.to_vec(),
            dll,
            ell: None,
            tpl: None,
            ci: frame[10],
            payload_offset: 11,
            values: DvEntryMap::new(),
            explanations: Vec::new(),
        };
        t.explain_dll();

        let mut pos = 10;
        let ci = t.frame[pos];
        pos += 1;

        let ci = if ci == CI_ELL_SESSION || ci == CI_ELL_SHORT {
            pos = t.parse_ell(ci, pos, key)?;
            let app_ci = *t
                .frame
                .get(pos)
                .ok_or_else(|| TelegramError::Malformed("missing CI after ELL".into()))?;
            pos += 1;
            app_ci
        } else {
            ci
        };
        t.ci = ci;

        match ci {
            CI_APL_NO_HEADER => {
                t.add_explanation(pos - 1, &[ci], "tpl-ci-field (no tplh)");
                t.payload_offset = pos;
                t.parse_record_stream();
            }
            CI_TPL_SHORT => {
                t.add_explanation(pos - 1, &[ci], "tpl-ci-field (short tplh)");
                pos = t.parse_tpl_short(pos, key)?;
                t.payload_offset = pos;
                t.parse_record_stream();
            }
            CI_TPL_LONG => {
                t.add_explanation(pos - 1, &[ci], "tpl-ci-field (long tplh)");
                pos = t.parse_tpl_long(pos, key)?;
                t.payload_offset = pos;
                t.parse_record_stream();
            }
            _ => {
                // Manufacturer specific or unsupported application layer:
                // the raw payload is handed to the driver untouched.
                t.add_explanation(pos - 1, &[ci], "ci-field (manufacturer specific)");
                t.payload_offset = pos;
            }
        }

        Ok(t)
    }

    /// Decodes a wired M-Bus long-frame payload, reconstructed by the bus
    /// layer as `len C A CI ...`. The meter identity comes from the TPL long
    /// header of an RSP_UD.
    pub fn parse_mbus(payload: &[u8], key: Option<&AesKey>) -> Result<Telegram, TelegramError> {
        if payload.len() < 4 {
            return Err(TelegramError::TooShort(payload.len()));
        }
        let ci = payload[3];
        if ci != CI_TPL_LONG {
            return Err(TelegramError::Malformed(format!(
                "unsupported M-Bus CI 0x{ci:02X}"
            )));
        }

        let mut t = Telegram {
            frame: payload.to_vec(),
            dll: DllHeader {
                length: payload[0],
                c_field: payload[1],
                manufacturer: 0,
                id: [0; 4],
                version: 0,
                device_type: 0,
            },
            ell: None,
            tpl: None,
            ci,
            payload_offset: 4,
            values: DvEntryMap::new(),
            explanations: Vec::new(),
        };
        t.add_explanation(0, &payload[0..1], "length");
        t.add_explanation(1, &payload[1..2], "dll-c");
        t.add_explanation(2, &payload[2..3], "dll-a");
        t.add_explanation(3, &payload[3..4], "tpl-ci-field (long tplh)");

        let pos = t.parse_tpl_long(4, key)?;
        t.payload_offset = pos;
        t.parse_record_stream();
        Ok(t)
    }

    fn parse_ell(
        &mut self,
        ci: u8,
        mut pos: usize,
        key: Option<&AesKey>,
    ) -> Result<usize, TelegramError> {
        self.add_explanation(pos - 1, &[ci], "ell-ci-field");

        let header_len = if ci == CI_ELL_SESSION { 6 } else { 2 };
        if self.frame.len() < pos + header_len {
            return Err(TelegramError::TooShort(self.frame.len()));
        }

        let cc = self.frame[pos];
        let acc = self.frame[pos + 1];
        self.add_explanation(pos, &[cc], "ell-cc");
        self.add_explanation(pos + 1, &[acc], "ell-acc");

        let sn = if ci == CI_ELL_SESSION {
            let sn: [u8; 4] = self.frame[pos + 2..pos + 6].try_into().expect("4 bytes");
            self.add_explanation(pos + 2, &sn, "ell-sn");
            sn
        } else {
            [0; 4]
        };
        pos += header_len;

        let ell = EllHeader { cc, acc, sn };
        let encrypted = ell.is_encrypted();
        self.ell = Some(ell);

        if encrypted {
            let key = key.ok_or_else(|| TelegramError::MissingKey { id: self.id_hex() })?;
            let iv = build_ell_iv(
                self.dll.manufacturer,
                self.dll.id,
                self.dll.version,
                self.dll.device_type,
                cc,
                sn,
            );
            let decrypted = aes_ctr_process(key, &iv, &self.frame[pos..]);

            // First two plaintext bytes carry a CRC over the rest; a
            // mismatch means the wrong key or a corrupted telegram.
            if decrypted.len() < 3 {
                return Err(TelegramError::Integrity { id: self.id_hex() });
            }
            let expected = u16::from_le_bytes([decrypted[0], decrypted[1]]);
            if crc16_en13757(&decrypted[2..]) != expected {
                return Err(TelegramError::Integrity { id: self.id_hex() });
            }

            self.frame[pos..].copy_from_slice(&decrypted);
            let crc_bytes = [self.frame[pos], self.frame[pos + 1]];
            self.add_explanation(pos, &crc_bytes, "payload crc");
            // The application layer starts after the payload CRC.
            pos += 2;
        }

        Ok(pos)
    }

    fn parse_tpl_short(
        &mut self,
        mut pos: usize,
        key: Option<&AesKey>,
    ) -> Result<usize, TelegramError> {
        if self.frame.len() < pos + 4 {
            return Err(TelegramError::TooShort(self.frame.len()));
        }
        let acc = self.frame[pos];
        let status = self.frame[pos + 1];
        let configuration = u16::from_le_bytes([self.frame[pos + 2], self.frame[pos + 3]]);
        let cfg_bytes = [self.frame[pos + 2], self.frame[pos + 3]];
        self.add_explanation(pos, &[acc], "tpl-acc");
        self.add_explanation(pos + 1, &[status], "tpl-status");
        self.add_explanation(pos + 2, &cfg_bytes, "tpl-cfg");
        pos += 4;

        let tpl = TplHeader {
            acc,
            status,
            configuration,
        };
        let mode = tpl.security_mode();
        let blocks = tpl.encrypted_blocks();
        self.tpl = Some(tpl);

        match mode {
            0 => Ok(pos),
            5 => {
                let key = key.ok_or_else(|| TelegramError::MissingKey { id: self.id_hex() })?;
                self.decrypt_tpl_blocks(pos, blocks, acc, key)?;
                Ok(pos)
            }
            other => Err(TelegramError::Malformed(format!(
                "unsupported TPL security mode {other}"
            ))),
        }
    }

    fn parse_tpl_long(
        &mut self,
        mut pos: usize,
        key: Option<&AesKey>,
    ) -> Result<usize, TelegramError> {
        if self.frame.len() < pos + 12 {
            return Err(TelegramError::TooShort(self.frame.len()));
        }
        let id: [u8; 4] = self.frame[pos..pos + 4].try_into().expect("4 bytes");
        let manufacturer = u16::from_le_bytes([self.frame[pos + 4], self.frame[pos + 5]]);
        let version = self.frame[pos + 6];
        let device_type = self.frame[pos + 7];
        let acc = self.frame[pos + 8];
        let status = self.frame[pos + 9];
        let configuration = u16::from_le_bytes([self.frame[pos + 10], self.frame[pos + 11]]);

        let mfct_bytes = [self.frame[pos + 4], self.frame[pos + 5]];
        let cfg_bytes = [self.frame[pos + 10], self.frame[pos + 11]];
        self.add_explanation(pos, &id, "tpl-id");
        self.add_explanation(pos + 4, &mfct_bytes, "tpl-mfct");
        self.add_explanation(pos + 6, &[version], "tpl-version");
        self.add_explanation(pos + 7, &[device_type], "tpl-type");
        self.add_explanation(pos + 8, &[acc], "tpl-acc");
        self.add_explanation(pos + 9, &[status], "tpl-status");
        self.add_explanation(pos + 10, &cfg_bytes, "tpl-cfg");

        // An M-Bus response carries the meter identity here, not in the DLL.
        if self.dll.manufacturer == 0 {
            self.dll.manufacturer = manufacturer;
            self.dll.id = id;
            self.dll.version = version;
            self.dll.device_type = device_type;
        }
        pos += 12;

        let tpl = TplHeader {
            acc,
            status,
            configuration,
        };
        let mode = tpl.security_mode();
        let blocks = tpl.encrypted_blocks();
        self.tpl = Some(tpl);

        match mode {
            0 => Ok(pos),
            5 => {
                let key = key.ok_or_else(|| TelegramError::MissingKey { id: self.id_hex() })?;
                self.decrypt_tpl_blocks(pos, blocks, acc, key)?;
                Ok(pos)
            }
            other => Err(TelegramError::Malformed(format!(
                "unsupported TPL security mode {other}"
            ))),
        }
    }

    fn decrypt_tpl_blocks(
        &mut self,
        pos: usize,
        blocks: usize,
        acc: u8,
        key: &AesKey,
    ) -> Result<(), TelegramError> {
        let available = self.frame.len().saturating_sub(pos);
        let len = (blocks * 16).min(available - available % 16);
        if len == 0 {
            return Err(TelegramError::Integrity { id: self.id_hex() });
        }

        let iv = build_tpl_iv(
            self.dll.manufacturer,
            self.dll.id,
            self.dll.version,
            self.dll.device_type,
            acc,
        );
        let decrypted = aes_cbc_decrypt(key, &iv, &self.frame[pos..pos + len])
            .map_err(|_| TelegramError::Integrity { id: self.id_hex() })?;

        if decrypted[0..2] != TPL_DECRYPT_MARKER {
            return Err(TelegramError::Integrity { id: self.id_hex() });
        }

        self.frame[pos..pos + len].copy_from_slice(&decrypted);
        Ok(())
    }

    fn parse_record_stream(&mut self) {
        let payload = self.frame[self.payload_offset..].to_vec();
        let parsed = parse_records(&payload, self.payload_offset);
        if let Some(e) = &parsed.error {
            log::warn!(
                "(telegram) {} from {}: dropping rest of record stream",
                e,
                self.id_hex()
            );
        }
        self.values = parsed.values;
        for (offset, hex) in parsed.trace {
            self.explanations.push(Explanation {
                offset,
                hex,
                info: String::new(),
            });
        }
    }

    fn explain_dll(&mut self) {
        let frame = self.frame.clone();
        let name = manufacturer_name(self.dll.manufacturer)
            .map(str::to_string)
            .unwrap_or_else(|| self.manufacturer_flag_buf());
        self.add_explanation(0, &frame[0..1], "length");
        self.add_explanation(1, &frame[1..2], "dll-c");
        self.add_explanation(2, &frame[2..4], &format!("dll-mfct ({name})"));
        self.add_explanation(4, &frame[4..8], "dll-id");
        self.add_explanation(8, &frame[8..9], "dll-version");
        self.add_explanation(9, &frame[9..10], "dll-type");
    }

    /// Printable meter address: the id bytes most significant first.
    pub fn id_hex(&self) -> String {
        render_id(&self.dll.id)
    }

    /// Three letter FLAG manufacturer code.
    pub fn manufacturer_flag(&self) -> String {
        self.manufacturer_flag_buf()
    }

    fn manufacturer_flag_buf(&self) -> String {
        let m = self.dll.manufacturer;
        let letters = [
            ((m >> 10) & 0x1F) as u8 + 64,
            ((m >> 5) & 0x1F) as u8 + 64,
            (m & 0x1F) as u8 + 64,
        ];
        letters.iter().map(|b| char::from(*b)).collect()
    }

    /// Application payload as seen by proprietary drivers.
    pub fn extract_payload(&self) -> &[u8] {
        &self.frame[self.payload_offset..]
    }

    /// Appends an annotation entry.
    pub fn add_explanation(&mut self, offset: usize, bytes: &[u8], info: &str) {
        debug_assert!(offset < self.frame.len());
        self.explanations.push(Explanation {
            offset,
            hex: encode_hex(bytes).to_uppercase(),
            info: info.to_string(),
        });
    }

    /// Extends the annotation of the entry at `offset`, creating one when a
    /// driver annotates a byte range the parser did not trace.
    pub fn add_more_explanation(&mut self, offset: usize, info: &str) {
        if let Some(e) = self.explanations.iter_mut().find(|e| e.offset == offset) {
            if !e.info.is_empty() {
                e.info.push(' ');
            }
            e.info.push_str(info);
        } else if offset < self.frame.len() {
            self.explanations.push(Explanation {
                offset,
                hex: String::new(),
                info: info.to_string(),
            });
        }
    }
}

fn parse_dll(input: &[u8]) -> IResult<&[u8], DllHeader> {
    let (i, length) = be_u8(input)?;
    let (i, c_field) = be_u8(i)?;
    let (i, manufacturer) = le_u16(i)?;
    let (i, id) = take(4usize)(i)?;
    let (i, version) = be_u8(i)?;
    let (i, device_type) = be_u8(i)?;
    Ok((
        i,
        DllHeader {
            length,
            c_field,
            manufacturer,
            id: id.try_into().expect("4 bytes"),
            version,
            device_type,
        },
    ))
}

/// Full manufacturer name when the FLAG code is a known one.
pub fn manufacturer_name(manufacturer: u16) -> Option<&'static str> {
    MANUFACTURERS.get(&manufacturer).copied()
}

/// Parses just the DLL header, enough to learn the sender's identity
/// without touching any encrypted content.
pub fn peek_dll(frame: &[u8]) -> Option<DllHeader> {
    if frame.len() < 10 {
        return None;
    }
    parse_dll(frame).ok().map(|(_, dll)| dll)
}

/// Wired counterpart of [`peek_dll`]: reads the sender's identity from the
/// cleartext TPL long header of a reconstructed M-Bus payload
/// (`len C A CI ...`) without touching any encrypted content.
pub fn peek_mbus_header(payload: &[u8]) -> Option<DllHeader> {
    if payload.len() < 16 || payload[3] != CI_TPL_LONG {
        return None;
    }
    Some(DllHeader {
        length: payload[0],
        c_field: payload[1],
        manufacturer: u16::from_le_bytes([payload[8], payload[9]]),
        id: payload[4..8].try_into().expect("4 bytes"),
        version: payload[10],
        device_type: payload[11],
    })
}

/// Printable meter address from the wire-order id bytes.
pub fn render_id(id: &[u8; 4]) -> String {
    id.iter().rev().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::hex::decode_hex;

    /// Plaintext C1 telegram for a Kamstrup heat meter 12345678.
    fn plain_frame() -> Vec<u8> {
        let mut body = decode_hex("442D2C78563412301678").unwrap();
        body.extend_from_slice(
            &decode_hex("03062C000043060000000314630000426C7F2A022D130001FF2100").unwrap(),
        );
        let mut frame = vec![body.len() as u8];
        frame.extend_from_slice(&body);
        frame
    }

    #[test]
    fn test_parse_dll_header() {
        let t = Telegram::parse(&plain_frame(), None).unwrap();
        assert_eq!(t.dll.manufacturer, 0x2C2D);
        assert_eq!(t.dll.id, [0x78, 0x56, 0x34, 0x12]);
        assert_eq!(t.dll.version, 0x30);
        assert_eq!(t.dll.device_type, 0x16);
        assert_eq!(t.ci, 0x78);
        assert_eq!(t.id_hex(), "12345678");
        assert_eq!(t.manufacturer_flag(), "KAM");
    }

    #[test]
    fn test_records_parsed() {
        let t = Telegram::parse(&plain_frame(), None).unwrap();
        assert_eq!(t.values.len(), 6);
        assert!(t.values.contains_key("0306"));
        assert!(t.values.contains_key("01FF21"));
    }

    #[test]
    fn test_explanation_offsets_inside_frame() {
        let t = Telegram::parse(&plain_frame(), None).unwrap();
        assert!(!t.explanations.is_empty());
        for e in &t.explanations {
            assert!(e.offset < t.frame.len(), "offset {} escapes frame", e.offset);
        }
    }

    #[test]
    fn test_add_more_explanation_appends() {
        let mut t = Telegram::parse(&plain_frame(), None).unwrap();
        let offset = t.values["0306"].0;
        t.add_more_explanation(offset, "total energy consumption (44 kwh)");
        let e = t
            .explanations
            .iter()
            .find(|e| e.offset == offset)
            .expect("trace entry");
        assert!(e.info.contains("total energy"));
    }

    #[test]
    fn test_too_short() {
        assert!(matches!(
            Telegram::parse(&[0x05, 0x44], None),
            Err(TelegramError::TooShort(_))
        ));
    }

    #[test]
    fn test_manufacturer_specific_ci_keeps_raw_payload() {
        let mut body = decode_hex("446850123456784304A2").unwrap();
        body.extend_from_slice(&[0x01, 0x02, 0x03, 0x64, 0x00, 0x05, 0x06, 0xC8, 0x00]);
        let mut frame = vec![body.len() as u8];
        frame.extend_from_slice(&body);

        let t = Telegram::parse(&frame, None).unwrap();
        assert_eq!(t.ci, 0xA2);
        assert!(t.values.is_empty());
        assert_eq!(t.extract_payload().len(), 9);
    }

    #[test]
    fn test_flag_decode() {
        let t = Telegram::parse(&plain_frame(), None).unwrap();
        assert_eq!(manufacturer_name(t.dll.manufacturer), Some("Kamstrup"));
    }

    #[test]
    fn test_peek_mbus_header() {
        let payload = decode_hex("10 08 01 72 99887766 3330 14 02 55 00 0000").unwrap();
        let h = peek_mbus_header(&payload).unwrap();
        assert_eq!(h.manufacturer, 0x3033);
        assert_eq!(render_id(&h.id), "66778899");
        assert_eq!(h.version, 0x14);
        assert_eq!(h.device_type, 0x02);

        // Too short, or not a TPL long header.
        assert!(peek_mbus_header(&payload[..10]).is_none());
        let mut other_ci = payload.clone();
        other_ci[3] = 0x78;
        assert!(peek_mbus_header(&other_ci).is_none());
    }
}
