//! Application-layer record parsing.
//!
//! The record stream after the TPL CI byte is a sequence of
//! DIF [DIFEs] VIF [VIFEs] data blocks. `record::parse_records` walks the
//! stream into a DV map keyed by the hex of the information blocks, and
//! `data` holds the typed extraction helpers drivers use against that map.

pub mod data;
pub mod record;
pub mod vif;

use std::collections::BTreeMap;

use thiserror::Error;

pub use data::{
    extract_dv_date, extract_dv_double, extract_dv_u16, extract_dv_u32, extract_dv_u8, find_key,
};
pub use record::{parse_records, ParsedRecords};
pub use vif::ValueKind;

/// Function field of a data record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MeasurementType {
    Instantaneous,
    Maximum,
    Minimum,
    AtError,
    /// Wildcard in lookups; never stored on a parsed entry.
    Unknown,
}

impl MeasurementType {
    pub(crate) fn from_dif(dif: u8) -> MeasurementType {
        match (dif & crate::constants::DIF_MASK_FUNCTION) >> 4 {
            0 => MeasurementType::Instantaneous,
            1 => MeasurementType::Maximum,
            2 => MeasurementType::Minimum,
            _ => MeasurementType::AtError,
        }
    }
}

/// One parsed data record, addressed by its DV-key.
#[derive(Debug, Clone, PartialEq)]
pub struct DvEntry {
    pub measurement_type: MeasurementType,
    /// First DIF byte; decides the payload coding (int/BCD/real/variable).
    pub dif: u8,
    /// Primary VIF byte (0xFB/0xFD/0xFF for escaped tables).
    pub vif: u8,
    pub storage_nr: u32,
    pub tariff: u32,
    pub subunit: u32,
    /// Payload bytes exactly as they appeared on the wire.
    pub raw: Vec<u8>,
    /// ASCII unit from a plain-text VIF, when present.
    pub plain_text_vif: Option<String>,
}

/// Ordered map from DV-key to (absolute data offset, entry).
///
/// Later records with the same key overwrite earlier ones; see the single
/// insert site in [`record::parse_records`].
pub type DvEntryMap = BTreeMap<String, (usize, DvEntry)>;

/// Malformed record streams.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ParserError {
    #[error("record stream ended inside a record at offset {0}")]
    PrematureEnd(usize),

    #[error("DIFE/VIFE chain longer than 10 at offset {0}")]
    ChainTooLong(usize),

    #[error("variable length code 0x{0:02X} not supported")]
    BadVariableLength(u8),
}
