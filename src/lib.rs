//! # wmbusd - wM-Bus telegram ingestion
//!
//! The core pipeline of a wireless/wired M-Bus metering daemon: bytes arrive
//! on a radio dongle TTY, a sub-process, a file or an in-memory simulator;
//! the event loop multiplexes the sources; frames are located in the byte
//! stream, decrypted and integrity-checked; the DIF/VIF record stream is
//! parsed into a typed DV map; and the driver registry routes each telegram
//! to the configured meter, which updates its typed state and notifies the
//! reading sinks.
//!
//! ```no_run
//! use std::sync::{Arc, Mutex};
//! use wmbusd::bus;
//! use wmbusd::meters::{DriverTag, Meter, MeterRegistry};
//! use wmbusd::serial::SerialManager;
//!
//! let mut registry = MeterRegistry::new();
//! let mut meter = Meter::new("heat", DriverTag::Multical302, vec!["*".into()], None);
//! meter.on_update(|telegram, meter| {
//!     println!("{}", meter.render_json(telegram));
//! });
//! registry.add_meter(meter);
//! let registry = Arc::new(Mutex::new(registry));
//!
//! let manager = SerialManager::new(None);
//! let sim = bus::open_simulator(&manager, "sim", registry);
//! manager.start_event_loop();
//! sim.simulate(&manager, &["telegram=...".to_string()]);
//! manager.wait_for_stop();
//! ```

pub mod bus;
pub mod config;
pub mod constants;
pub mod error;
pub mod frame;
pub mod logging;
pub mod meters;
pub mod payload;
pub mod serial;
pub mod telegram;
pub mod util;

pub use error::Error;
pub use frame::{FrameStatus, Framing};
pub use logging::init_logger;
pub use meters::{Driver, DriverTag, Meter, MeterRegistry};
pub use serial::{SerialDevice, SerialManager};
pub use telegram::Telegram;
