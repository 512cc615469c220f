//! Catch-all driver for unconfigured meters.
//!
//! Accepts any telegram and keeps no state; useful for watching what a new
//! meter sends before a real driver is configured.

use crate::telegram::Telegram;

use super::{Driver, FieldValue, LinkModeSet, Print};

#[derive(Debug, Default)]
pub struct UnknownMeter;

impl Driver for UnknownMeter {
    fn process_content(&mut self, _t: &mut Telegram) {}

    fn prints(&self) -> &'static [Print] {
        &[]
    }

    fn value_of(&self, _name: &str) -> Option<FieldValue> {
        None
    }

    fn link_modes(&self) -> LinkModeSet {
        LinkModeSet::all()
    }
}
