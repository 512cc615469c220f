//! Meter drivers, the driver registry and telegram dispatch.
//!
//! A driver is a pure transformation from parsed records to typed scalar
//! state; it never performs I/O. Meter "kinds" exist only as print-schema
//! labels, so the whole contract is [`Driver::process_content`] plus
//! schema/value accessors. The [`MeterRegistry`] matches telegrams to
//! configured meters by address pattern and keeps the per-address warning
//! and ignore sets.

pub mod compact5;
pub mod lansenpu;
pub mod multical302;
pub mod multical603;
pub mod unknown;

use std::collections::HashSet;

use bitflags::bitflags;
use chrono::{DateTime, Local, Utc};
use log::{debug, trace, warn};
use serde_json::json;

use crate::telegram::crypto::AesKey;
use crate::telegram::{peek_dll, peek_mbus_header, render_id, DllHeader, Telegram, TelegramError};

bitflags! {
    /// Radio profiles a driver expects its telegrams on.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct LinkModeSet: u8 {
        const C1 = 0x01;
        const T1 = 0x02;
        const S1 = 0x04;
        const N1 = 0x08;
    }
}

/// Security mode a driver expects on the extended link layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EllSecurityMode {
    #[default]
    None,
    AesCtr,
}

/// Security mode a driver expects on the transport layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TplSecurityMode {
    #[default]
    None,
    AesCbcIv,
}

/// Physical quantity of a printable field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Quantity {
    Energy,
    Volume,
    Flow,
    Power,
    Temperature,
    Counter,
    Text,
}

impl Quantity {
    /// Canonical unit suffix appended to field names in rendered output.
    pub fn unit_suffix(&self) -> &'static str {
        match self {
            Quantity::Energy => "_kwh",
            Quantity::Volume => "_m3",
            Quantity::Flow => "_m3h",
            Quantity::Power => "_kw",
            Quantity::Temperature => "_c",
            Quantity::Counter => "",
            Quantity::Text => "",
        }
    }
}

/// A typed field value pulled from driver state.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Double(f64),
    Text(String),
}

/// One entry of a driver's print schema.
#[derive(Debug, Clone, Copy)]
pub struct Print {
    pub name: &'static str,
    pub quantity: Quantity,
    pub in_fields: bool,
    pub in_json: bool,
}

/// The meter driver contract.
pub trait Driver: Send {
    /// Pulls records out of a decoded telegram into typed state. A missing
    /// optional record leaves the corresponding state untouched.
    fn process_content(&mut self, telegram: &mut Telegram);

    /// Ordered print schema declared by the driver.
    fn prints(&self) -> &'static [Print];

    /// Current value of a schema field.
    fn value_of(&self, name: &str) -> Option<FieldValue>;

    fn link_modes(&self) -> LinkModeSet;

    fn expected_ell_mode(&self) -> EllSecurityMode {
        EllSecurityMode::None
    }

    fn expected_tpl_mode(&self) -> TplSecurityMode {
        TplSecurityMode::None
    }
}

/// Driver selector, matched against a telegram's
/// (manufacturer, type, version) tuple.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverTag {
    Multical302,
    Multical603,
    Compact5,
    LansenPu,
    Unknown,
}

impl DriverTag {
    pub fn from_name(name: &str) -> Option<DriverTag> {
        match name {
            "multical302" => Some(DriverTag::Multical302),
            "multical603" => Some(DriverTag::Multical603),
            "compact5" => Some(DriverTag::Compact5),
            "lansenpu" => Some(DriverTag::LansenPu),
            "unknown" => Some(DriverTag::Unknown),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            DriverTag::Multical302 => "multical302",
            DriverTag::Multical603 => "multical603",
            DriverTag::Compact5 => "compact5",
            DriverTag::LansenPu => "lansenpu",
            DriverTag::Unknown => "unknown",
        }
    }

    /// Best driver for a telegram's identity tuple.
    pub fn detect(manufacturer: u16, device_type: u8, version: u8) -> Option<DriverTag> {
        match (manufacturer, device_type, version) {
            (0x2C2D, 0x04, 0x30) => Some(DriverTag::Multical302),
            (0x2C2D, 0x04, 0x35) => Some(DriverTag::Multical603),
            // Techem Compact V uses media 0x04 on C1 and 0xC3 on T1.
            (0x5068, 0x04, _) | (0x5068, 0xC3, _) => Some(DriverTag::Compact5),
            (0x3033, 0x02, _) => Some(DriverTag::LansenPu),
            _ => None,
        }
    }

    pub fn create(&self) -> Box<dyn Driver> {
        match self {
            DriverTag::Multical302 => Box::new(multical302::Multical302::default()),
            DriverTag::Multical603 => Box::new(multical603::Multical603::default()),
            DriverTag::Compact5 => Box::new(compact5::Compact5::default()),
            DriverTag::LansenPu => Box::new(lansenpu::LansenPu::default()),
            DriverTag::Unknown => Box::new(unknown::UnknownMeter::default()),
        }
    }
}

type UpdateCallback = Box<dyn Fn(&Telegram, &Meter) + Send>;

/// One configured meter: identity, keys and driver state.
pub struct Meter {
    name: String,
    tag: DriverTag,
    ids: Vec<String>,
    key: Option<AesKey>,
    driver: Box<dyn Driver>,
    num_updates: u64,
    datetime_of_update: Option<DateTime<Local>>,
    on_update: Vec<UpdateCallback>,
}

impl Meter {
    pub fn new(name: &str, tag: DriverTag, ids: Vec<String>, key: Option<AesKey>) -> Meter {
        Meter {
            name: name.to_string(),
            tag,
            ids,
            key,
            driver: tag.create(),
            num_updates: 0,
            datetime_of_update: None,
            on_update: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn tag(&self) -> DriverTag {
        self.tag
    }

    pub fn num_updates(&self) -> u64 {
        self.num_updates
    }

    pub fn key(&self) -> Option<&AesKey> {
        self.key.as_ref()
    }

    pub fn driver(&self) -> &dyn Driver {
        self.driver.as_ref()
    }

    /// Registers a sink callback fired after each successful update.
    pub fn on_update(&mut self, cb: impl Fn(&Telegram, &Meter) + Send + 'static) {
        self.on_update.push(Box::new(cb));
    }

    /// True if any configured address pattern covers `id`. A `*` matches
    /// one nibble; a trailing `*` matches the rest of the address.
    pub fn matches_address(&self, id: &str) -> bool {
        self.ids.iter().any(|pattern| matches_pattern(pattern, id))
    }

    fn process(&mut self, telegram: &mut Telegram) {
        self.driver.process_content(telegram);
        self.num_updates += 1;
        self.datetime_of_update = Some(Local::now());
        for cb in &self.on_update {
            cb(telegram, self);
        }
    }

    /// Human readable row: name, id, then every schema field marked for
    /// field output, then the update timestamp.
    pub fn render_fields(&self, telegram: &Telegram, separator: char) -> String {
        let mut cols = vec![self.name.clone(), telegram.id_hex()];
        for p in self.driver.prints().iter().filter(|p| p.in_fields) {
            match self.driver.value_of(p.name) {
                Some(FieldValue::Double(v)) => cols.push(format!("{v:.3}")),
                Some(FieldValue::Text(s)) => cols.push(s),
                None => cols.push(String::new()),
            }
        }
        cols.push(
            self.datetime_of_update
                .map(|dt| dt.format("%Y-%m-%d %H:%M:%S").to_string())
                .unwrap_or_default(),
        );
        cols.join(&separator.to_string())
    }

    /// JSON object with the schema fields marked for json output plus the
    /// three standard timestamps.
    pub fn render_json(&self, telegram: &Telegram) -> serde_json::Value {
        let now_utc = Utc::now();
        let now_lt = Local::now();
        let mut obj = serde_json::Map::new();
        obj.insert("media".into(), json!(self.tag.name()));
        obj.insert("meter".into(), json!(self.name));
        obj.insert("id".into(), json!(telegram.id_hex()));
        for p in self.driver.prints().iter().filter(|p| p.in_json) {
            let field = format!("{}{}", p.name, p.quantity.unit_suffix());
            match self.driver.value_of(p.name) {
                Some(FieldValue::Double(v)) => {
                    obj.insert(field, json!(v));
                }
                Some(FieldValue::Text(s)) => {
                    obj.insert(field, json!(s));
                }
                None => {}
            }
        }
        obj.insert("timestamp_ut".into(), json!(now_utc.timestamp()));
        obj.insert(
            "timestamp_utc".into(),
            json!(now_utc.format("%Y-%m-%dT%H:%M:%SZ").to_string()),
        );
        obj.insert(
            "timestamp_lt".into(),
            json!(now_lt.format("%Y-%m-%d %H:%M:%S").to_string()),
        );
        serde_json::Value::Object(obj)
    }
}

fn matches_pattern(pattern: &str, id: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    let mut id_chars = id.chars();
    for pc in pattern.chars() {
        match id_chars.next() {
            None => return false,
            Some(ic) => {
                if pc == '*' {
                    // A trailing star swallows the rest of the address.
                    continue;
                }
                if !pc.eq_ignore_ascii_case(&ic) {
                    return false;
                }
            }
        }
    }
    pattern.ends_with('*') || id_chars.next().is_none()
}

/// Configured meters plus the per-address warning bookkeeping.
#[derive(Default)]
pub struct MeterRegistry {
    meters: Vec<Meter>,
    warned_addresses: HashSet<String>,
    ignored_addresses: HashSet<String>,
}

impl MeterRegistry {
    pub fn new() -> MeterRegistry {
        MeterRegistry::default()
    }

    pub fn add_meter(&mut self, meter: Meter) {
        self.meters.push(meter);
    }

    pub fn meters(&self) -> &[Meter] {
        &self.meters
    }

    pub fn is_ignored(&self, id: &str) -> bool {
        self.ignored_addresses.contains(id)
    }

    /// Dispatches one wM-Bus frame. Returns true when a configured meter
    /// processed it.
    ///
    /// Policy for a detection mismatch: the telegram still goes to the
    /// driver the user configured, after a one-shot warning per address.
    pub fn handle_telegram(&mut self, frame: &[u8]) -> bool {
        let Some(header) = peek_dll(frame) else {
            debug!("(meter) discarding frame too short for a DLL header");
            return false;
        };
        self.dispatch(&header, |key| Telegram::parse(frame, key))
    }

    /// Dispatches one wired M-Bus long-frame payload. The identity comes
    /// from the cleartext TPL long header; per-meter keys, the permanent
    /// ignore set and the mismatch warning behave exactly as on the wM-Bus
    /// path.
    pub fn handle_mbus_telegram(&mut self, payload: &[u8]) -> bool {
        let Some(header) = peek_mbus_header(payload) else {
            debug!("(mbus) discarding payload without a TPL long header");
            return false;
        };
        self.dispatch(&header, |key| Telegram::parse_mbus(payload, key))
    }

    /// Shared dispatch: address matching, the one-shot detection-mismatch
    /// warning, per-meter keyed decode, and the error routing required by
    /// the integrity rules. An integrity failure poisons the address for
    /// the process lifetime with a single warning.
    fn dispatch<F>(&mut self, header: &DllHeader, parse: F) -> bool
    where
        F: Fn(Option<&AesKey>) -> Result<Telegram, TelegramError>,
    {
        let id = render_id(&header.id);

        if self.ignored_addresses.contains(&id) {
            return false;
        }

        let detected = DriverTag::detect(header.manufacturer, header.device_type, header.version);

        let mut handled = false;
        for i in 0..self.meters.len() {
            if !self.meters[i].matches_address(&id) {
                continue;
            }

            if let Some(d) = detected {
                if d != self.meters[i].tag
                    && self.meters[i].tag != DriverTag::Unknown
                    && self.warned_addresses.insert(format!("mismatch:{id}"))
                {
                    warn!(
                        "(meter) telegram from {id} looks like driver {} but meter {} is configured as {}",
                        d.name(),
                        self.meters[i].name,
                        self.meters[i].tag.name()
                    );
                }
            }

            let key = self.meters[i].key.clone();
            match parse(key.as_ref()) {
                Ok(mut telegram) => {
                    self.meters[i].process(&mut telegram);
                    handled = true;
                }
                Err(TelegramError::Integrity { .. }) => {
                    if self.ignored_addresses.insert(id.clone()) {
                        warn!("Permanently ignoring telegrams from id: {id}");
                    }
                    return false;
                }
                Err(TelegramError::MissingKey { .. }) => {
                    if self.warned_addresses.insert(format!("nokey:{id}")) {
                        warn!("(meter) telegram from {id} is encrypted but no key is configured");
                    }
                }
                Err(e) => {
                    if self.warned_addresses.insert(format!("decode:{id}")) {
                        warn!("(meter) could not decode telegram from {id}: {e}");
                    }
                }
            }
        }

        if !handled {
            trace!("(meter) no meter matched id {id}");
        }
        handled
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pattern_matching() {
        assert!(matches_pattern("*", "12345678"));
        assert!(matches_pattern("12345678", "12345678"));
        assert!(!matches_pattern("12345678", "12345679"));
        assert!(matches_pattern("1234567*", "12345679"));
        assert!(matches_pattern("123*", "12345678"));
        assert!(matches_pattern("1234567*", "12345678"));
        assert!(!matches_pattern("2234*", "12345678"));
        // Single nibble wildcard in the middle.
        assert!(matches_pattern("12*45678", "12345678"));
        assert!(!matches_pattern("12*45678", "12355678"));
        // Length still has to line up without a trailing star.
        assert!(!matches_pattern("1234", "12345678"));
    }

    #[test]
    fn test_driver_detection() {
        assert_eq!(
            DriverTag::detect(0x2C2D, 0x04, 0x30),
            Some(DriverTag::Multical302)
        );
        assert_eq!(
            DriverTag::detect(0x2C2D, 0x04, 0x35),
            Some(DriverTag::Multical603)
        );
        assert_eq!(
            DriverTag::detect(0x5068, 0xC3, 0x45),
            Some(DriverTag::Compact5)
        );
        assert_eq!(
            DriverTag::detect(0x3033, 0x02, 0x14),
            Some(DriverTag::LansenPu)
        );
        assert_eq!(DriverTag::detect(0x1111, 0x07, 0x01), None);
    }

    #[test]
    fn test_tag_names_roundtrip() {
        for tag in [
            DriverTag::Multical302,
            DriverTag::Multical603,
            DriverTag::Compact5,
            DriverTag::LansenPu,
            DriverTag::Unknown,
        ] {
            assert_eq!(DriverTag::from_name(tag.name()), Some(tag));
        }
        assert_eq!(DriverTag::from_name("nonsense"), None);
    }
}
