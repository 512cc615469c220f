use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;

use wmbusd::bus::{self, BusDevice};
use wmbusd::config::{Config, DeviceConfig, MeterConfig};
use wmbusd::meters::{DriverTag, Meter, MeterRegistry};
use wmbusd::serial::{BaudRate, SerialManager};
use wmbusd::telegram::crypto::AesKey;
use wmbusd::Framing;

#[derive(Parser)]
#[command(name = "wmbusd")]
#[command(about = "Ingests wM-Bus/M-Bus telegrams and emits structured meter readings")]
struct Cli {
    /// Byte sources: /dev/ttyUSB0[:baud][:mbus], a file, "stdin",
    /// a simulation_*.txt script, or cmd=<shell command>.
    devices: Vec<String>,

    /// Meters as name:driver:id[,id...][:key].
    #[arg(long = "meter")]
    meters: Vec<String>,

    /// JSON configuration file; CLI devices/meters are added on top.
    #[arg(long)]
    config: Option<String>,

    /// Stop after this many seconds.
    #[arg(long)]
    exit_after: Option<u64>,

    /// Stop when all configured devices stop working.
    #[arg(long)]
    expect_devices: bool,

    /// Output: "json" (default) or "fields".
    #[arg(long, default_value = "json")]
    format: String,
}

fn main() -> Result<()> {
    wmbusd::init_logger();
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("reading config file {path}"))?;
            Config::from_json(&text)?
        }
        None => Config::default(),
    };
    for spec in &cli.devices {
        config.devices.push(DeviceConfig::from_spec(spec));
    }
    for spec in &cli.meters {
        config.meters.push(MeterConfig::from_spec(spec)?);
    }
    if cli.exit_after.is_some() {
        config.exit_after_seconds = cli.exit_after;
    }
    config.expect_devices_to_work |= cli.expect_devices;

    if config.devices.is_empty() {
        bail!("no byte sources configured; pass a device or --config");
    }

    let registry = build_registry(&config, &cli.format)?;
    let manager = SerialManager::new(config.exit_after_seconds.map(Duration::from_secs));

    // The bus devices must outlive the event loop; their data listeners
    // only hold weak references.
    let mut buses: Vec<Arc<BusDevice>> = Vec::new();
    let mut simulations: Vec<(Arc<BusDevice>, Vec<String>)> = Vec::new();
    for device in &config.devices {
        match open_device(&manager, device, registry.clone())? {
            Opened::Bus(bus) => buses.push(bus),
            Opened::Simulation(bus, lines) => simulations.push((bus, lines)),
        }
    }

    if config.expect_devices_to_work {
        manager.expect_devices_to_work();
    }
    manager.start_event_loop();

    let manager = Arc::new(manager);
    let mut replays = Vec::new();
    for (bus, lines) in simulations {
        let manager = manager.clone();
        replays.push(std::thread::spawn(move || bus.simulate(&manager, &lines)));
    }

    manager.wait_for_stop();
    for replay in replays {
        let _ = replay.join();
    }
    drop(buses);

    Ok(())
}

enum Opened {
    Bus(Arc<BusDevice>),
    Simulation(Arc<BusDevice>, Vec<String>),
}

fn open_device(
    manager: &SerialManager,
    device: &DeviceConfig,
    registry: Arc<Mutex<MeterRegistry>>,
) -> Result<Opened> {
    let framing = match device.framing.as_deref() {
        Some("mbus") => Framing::MBus,
        _ => Framing::WMBus,
    };

    if let Some(command) = device.path.strip_prefix("cmd=") {
        let bus = bus::open_subprocess(
            manager,
            command,
            "/bin/sh",
            &["-c".to_string(), command.to_string()],
            &[],
            framing,
            registry,
        )?;
        return Ok(Opened::Bus(bus));
    }

    let file_name = device
        .path
        .rsplit('/')
        .next()
        .unwrap_or(device.path.as_str());
    if file_name.starts_with("simulation") {
        let lines = bus::load_simulation_script(&device.path)
            .with_context(|| format!("reading simulation script {}", device.path))?;
        let bus = bus::open_simulator(manager, &device.path, registry);
        return Ok(Opened::Simulation(bus, lines));
    }

    if device.path == "stdin" || std::fs::metadata(&device.path).map_or(false, |m| m.is_file()) {
        let bus = bus::open_file(manager, &device.path, framing, registry)?;
        return Ok(Opened::Bus(bus));
    }

    let baud = device.baud.unwrap_or(9600);
    let baud = BaudRate::from_u32(baud)
        .with_context(|| format!("unsupported baud rate {baud} for {}", device.path))?;
    let bus = match framing {
        Framing::WMBus => bus::open_wmbus_tty(manager, &device.path, baud, registry)?,
        Framing::MBus => bus::open_mbus_tty(manager, &device.path, baud, registry)?,
    };
    Ok(Opened::Bus(bus))
}

fn build_registry(config: &Config, format: &str) -> Result<Arc<Mutex<MeterRegistry>>> {
    let mut registry = MeterRegistry::new();
    let fields = format == "fields";

    for mc in &config.meters {
        let tag = DriverTag::from_name(&mc.driver)
            .with_context(|| format!("unknown driver \"{}\" for meter {}", mc.driver, mc.name))?;
        let key = match &mc.key {
            Some(hex) => Some(
                AesKey::from_hex(hex)
                    .map_err(|e| anyhow::anyhow!("bad key for meter {}: {e}", mc.name))?,
            ),
            None => None,
        };

        let mut meter = Meter::new(&mc.name, tag, mc.ids.clone(), key);
        meter.on_update(move |telegram, meter| {
            if fields {
                println!("{}", meter.render_fields(telegram, ';'));
            } else {
                println!("{}", meter.render_json(telegram));
            }
        });
        registry.add_meter(meter);
    }

    Ok(Arc::new(Mutex::new(registry)))
}
