//! Bus devices: the glue between byte sources and the meter registry.
//!
//! A [`BusDevice`] owns the per-source accumulation buffer, runs the frame
//! recognizer over it on every `on_data` callback, and hands complete
//! telegrams to the registry. Partial frames stay buffered; a framing error
//! drops the buffer with one warning.

use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use bytes::{Buf, BytesMut};
use log::{debug, warn};

use crate::frame::{check_frame, FrameStatus, Framing};
use crate::meters::MeterRegistry;
use crate::serial::{BaudRate, DeviceError, Parity, SerialDevice, SerialManager};
use crate::util::hex::{decode_hex, encode_hex};

/// One byte source bound to a framing dialect and the registry.
pub struct BusDevice {
    alias: String,
    framing: Framing,
    serial: Arc<SerialDevice>,
    buffer: Mutex<BytesMut>,
    registry: Arc<Mutex<MeterRegistry>>,
}

impl BusDevice {
    fn new(
        alias: &str,
        framing: Framing,
        serial: Arc<SerialDevice>,
        registry: Arc<Mutex<MeterRegistry>>,
    ) -> Arc<BusDevice> {
        Arc::new(BusDevice {
            alias: alias.to_string(),
            framing,
            serial,
            buffer: Mutex::new(BytesMut::with_capacity(512)),
            registry,
        })
    }

    pub fn alias(&self) -> &str {
        &self.alias
    }

    pub fn serial(&self) -> &Arc<SerialDevice> {
        &self.serial
    }

    /// Drains the byte source and dispatches every complete frame.
    pub fn process_serial_data(&self) {
        let data = self.serial.receive();

        let mut frames = Vec::new();
        {
            let mut buffer = self.buffer.lock().unwrap();
            buffer.extend_from_slice(&data);

            loop {
                match check_frame(self.framing, &buffer) {
                    FrameStatus::Partial => break,
                    FrameStatus::Error => {
                        warn!("({}) protocol error in message received", self.alias);
                        debug!("({}) dropping buffer \"{}\"", self.alias, encode_hex(&buffer));
                        buffer.clear();
                        break;
                    }
                    FrameStatus::Full {
                        frame_length,
                        payload_len,
                        payload_offset,
                    } => {
                        let frame = match self.framing {
                            Framing::WMBus => buffer[..frame_length].to_vec(),
                            Framing::MBus => {
                                // Rebuild len + C A CI data for the decoder;
                                // ACK frames carry nothing to dispatch.
                                if payload_len == 0 {
                                    Vec::new()
                                } else {
                                    let mut v = Vec::with_capacity(payload_len + 1);
                                    v.push(payload_len as u8);
                                    v.extend_from_slice(
                                        &buffer[payload_offset..payload_offset + payload_len],
                                    );
                                    v
                                }
                            }
                        };
                        buffer.advance(frame_length);
                        if !frame.is_empty() {
                            frames.push(frame);
                        }
                    }
                }
            }
        }

        let mut registry = self.registry.lock().unwrap();
        for frame in frames {
            match self.framing {
                Framing::WMBus => {
                    registry.handle_telegram(&frame);
                }
                Framing::MBus => {
                    registry.handle_mbus_telegram(&frame);
                }
            }
        }
    }

    /// Replays a simulator script. `telegram=<hex>` injects immediately,
    /// `telegram=<hex>|+<seconds>` at that offset from the replay start;
    /// other lines are ignored. Waits poll the manager so `stop()` cancels
    /// a replay within one tick. The manager is stopped after the last line.
    pub fn simulate(&self, manager: &SerialManager, lines: &[String]) {
        let start = Instant::now();

        for line in lines {
            let Some(rest) = line.strip_prefix("telegram=") else {
                continue;
            };

            let mut hex = String::new();
            let mut rel_time: Option<u64> = None;
            for (idx, c) in rest.char_indices() {
                match c {
                    '|' => continue,
                    '+' => {
                        rel_time = rest[idx + 1..].trim().parse().ok();
                        break;
                    }
                    _ => hex.push(c),
                }
            }

            if let Some(secs) = rel_time {
                debug!("(simulation) trigger \"{hex}\" at relative time {secs}");
                let due = Duration::from_secs(secs);
                while start.elapsed() < due {
                    if !manager.is_running() {
                        debug!("(simulation) exiting early");
                        return;
                    }
                    let remaining = due - start.elapsed();
                    std::thread::sleep(remaining.min(Duration::from_secs(1)));
                }
            }

            match decode_hex(&hex) {
                Ok(bytes) => self.serial.fill(&bytes),
                Err(e) => {
                    warn!("(simulation) not a valid string of hex bytes: {e} \"{line}\"");
                }
            }
        }

        manager.stop();
    }
}

fn attach(bus: &Arc<BusDevice>, manager: &SerialManager) {
    // The listener must not keep the bus device alive through the serial
    // device, or manager -> device -> callback -> bus -> device would cycle.
    let weak: Weak<BusDevice> = Arc::downgrade(bus);
    manager.listen_to(&bus.serial, move || {
        if let Some(bus) = weak.upgrade() {
            bus.process_serial_data();
        }
    });
    let alias = bus.alias.clone();
    manager.on_disappear(&bus.serial, move || {
        log::info!("({alias}) device disappeared");
    });
}

/// Opens a wM-Bus radio dongle on a raw TTY.
pub fn open_wmbus_tty(
    manager: &SerialManager,
    path: &str,
    baud: BaudRate,
    registry: Arc<Mutex<MeterRegistry>>,
) -> Result<Arc<BusDevice>, DeviceError> {
    let serial = manager.create_tty_device(path, baud, Parity::None, "wmbus");
    serial.open(true)?;
    let bus = BusDevice::new(path, Framing::WMBus, serial, registry);
    attach(&bus, manager);
    Ok(bus)
}

/// Opens a wired M-Bus TTY (8E1 per EN 13757-2).
pub fn open_mbus_tty(
    manager: &SerialManager,
    path: &str,
    baud: BaudRate,
    registry: Arc<Mutex<MeterRegistry>>,
) -> Result<Arc<BusDevice>, DeviceError> {
    let serial = manager.create_tty_device(path, baud, Parity::Even, "mbus");
    serial.open(true)?;
    let bus = BusDevice::new(path, Framing::MBus, serial, registry);
    attach(&bus, manager);
    Ok(bus)
}

/// Reads telegrams from a file, or stdin for the pseudo path "stdin".
pub fn open_file(
    manager: &SerialManager,
    path: &str,
    framing: Framing,
    registry: Arc<Mutex<MeterRegistry>>,
) -> Result<Arc<BusDevice>, DeviceError> {
    let serial = manager.create_file_device(path, "file");
    serial.open(true)?;
    let bus = BusDevice::new(path, framing, serial, registry);
    attach(&bus, manager);
    Ok(bus)
}

/// Runs a command and treats its stdout as the byte stream.
pub fn open_subprocess(
    manager: &SerialManager,
    identifier: &str,
    program: &str,
    args: &[String],
    envs: &[(String, String)],
    framing: Framing,
    registry: Arc<Mutex<MeterRegistry>>,
) -> Result<Arc<BusDevice>, DeviceError> {
    let serial = manager.create_subprocess_device(identifier, program, args, envs, "subprocess");
    serial.open(true)?;
    let bus = BusDevice::new(identifier, framing, serial, registry);
    attach(&bus, manager);
    Ok(bus)
}

/// Creates an in-memory simulator bus. Call [`BusDevice::simulate`] with the
/// script lines to replay telegrams.
pub fn open_simulator(
    manager: &SerialManager,
    alias: &str,
    registry: Arc<Mutex<MeterRegistry>>,
) -> Arc<BusDevice> {
    let serial = manager.create_simulator_device();
    let _ = serial.open(false);
    let bus = BusDevice::new(alias, Framing::WMBus, serial, registry);
    attach(&bus, manager);
    bus
}

/// Loads a simulator script file, one directive per line.
pub fn load_simulation_script(path: &str) -> std::io::Result<Vec<String>> {
    Ok(std::fs::read_to_string(path)?
        .lines()
        .map(str::to_string)
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meters::{DriverTag, Meter, MeterRegistry};
    use crate::util::hex::decode_hex;

    fn registry_with_meter() -> Arc<Mutex<MeterRegistry>> {
        let mut registry = MeterRegistry::new();
        registry.add_meter(Meter::new(
            "heat",
            DriverTag::Multical302,
            vec!["12345678".to_string()],
            None,
        ));
        Arc::new(Mutex::new(registry))
    }

    fn multical302_frame() -> Vec<u8> {
        let mut body = decode_hex("442D2C78563412300478").unwrap();
        body.extend_from_slice(
            &decode_hex("03062C000043060000000314630000426C7F2A022D130001FF2100").unwrap(),
        );
        let mut frame = vec![body.len() as u8];
        frame.extend_from_slice(&body);
        frame
    }

    #[test]
    fn test_simulator_dispatches_telegram() {
        let manager = SerialManager::new(None);
        let registry = registry_with_meter();
        let bus = open_simulator(&manager, "sim", registry.clone());
        manager.start_event_loop();

        bus.serial().fill(&multical302_frame());

        let registry = registry.lock().unwrap();
        assert_eq!(registry.meters()[0].num_updates(), 1);

        drop(registry);
        manager.stop();
        manager.wait_for_stop();
    }

    #[test]
    fn test_chunked_delivery_accumulates() {
        let manager = SerialManager::new(None);
        let registry = registry_with_meter();
        let bus = open_simulator(&manager, "sim", registry.clone());
        manager.start_event_loop();

        let frame = multical302_frame();
        let (a, b) = frame.split_at(7);
        bus.serial().fill(a);
        assert_eq!(registry.lock().unwrap().meters()[0].num_updates(), 0);
        bus.serial().fill(b);
        assert_eq!(registry.lock().unwrap().meters()[0].num_updates(), 1);

        manager.stop();
        manager.wait_for_stop();
    }

    #[test]
    fn test_simulate_replays_and_stops() {
        let manager = SerialManager::new(None);
        let registry = registry_with_meter();
        let bus = open_simulator(&manager, "sim", registry.clone());
        manager.start_event_loop();

        let script = vec![
            format!("telegram={}", encode_hex(&multical302_frame())),
            "# a comment line that is ignored".to_string(),
        ];
        bus.simulate(&manager, &script);

        assert!(!manager.is_running());
        assert_eq!(registry.lock().unwrap().meters()[0].num_updates(), 1);
        manager.wait_for_stop();
    }
}
