//! Daemon configuration.
//!
//! The same structures back the JSON configuration file and the CLI
//! shorthand specs (`/dev/ttyUSB0:9600`, `name:driver:id:KEY`).

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// One byte source to ingest from.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeviceConfig {
    /// TTY path, file path, "stdin", a simulation script path, or
    /// `cmd=<shell command>`.
    pub path: String,
    #[serde(default)]
    pub baud: Option<u32>,
    /// "wmbus" (default) or "mbus".
    #[serde(default)]
    pub framing: Option<String>,
}

/// One configured meter.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MeterConfig {
    pub name: String,
    pub driver: String,
    /// Address patterns; `*` wildcards supported per nibble.
    pub ids: Vec<String>,
    #[serde(default)]
    pub key: Option<String>,
}

/// Whole-daemon configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub devices: Vec<DeviceConfig>,
    #[serde(default)]
    pub meters: Vec<MeterConfig>,
    #[serde(default)]
    pub exit_after_seconds: Option<u64>,
    #[serde(default)]
    pub expect_devices_to_work: bool,
}

impl Config {
    pub fn from_json(json: &str) -> Result<Config, Error> {
        serde_json::from_str(json).map_err(|e| Error::Config(e.to_string()))
    }
}

impl DeviceConfig {
    /// Parses the CLI shorthand `path[:baud][:framing]`.
    pub fn from_spec(spec: &str) -> DeviceConfig {
        let mut path = spec.to_string();
        let mut baud = None;
        let mut framing = None;

        // A command spec can contain anything; leave it alone.
        if !spec.starts_with("cmd=") {
            let parts: Vec<&str> = spec.split(':').collect();
            if parts.len() > 1 {
                path = parts[0].to_string();
                for part in &parts[1..] {
                    if let Ok(b) = part.parse::<u32>() {
                        baud = Some(b);
                    } else {
                        framing = Some(part.to_string());
                    }
                }
            }
        }

        DeviceConfig {
            path,
            baud,
            framing,
        }
    }
}

impl MeterConfig {
    /// Parses the CLI shorthand `name:driver:id[:key]`.
    pub fn from_spec(spec: &str) -> Result<MeterConfig, Error> {
        let parts: Vec<&str> = spec.split(':').collect();
        if parts.len() < 3 {
            return Err(Error::Config(format!(
                "meter spec \"{spec}\" should be name:driver:id[:key]"
            )));
        }
        Ok(MeterConfig {
            name: parts[0].to_string(),
            driver: parts[1].to_string(),
            ids: parts[2].split(',').map(str::to_string).collect(),
            key: parts.get(3).map(|s| s.to_string()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_spec_parsing() {
        assert_eq!(
            DeviceConfig::from_spec("/dev/ttyUSB0:9600"),
            DeviceConfig {
                path: "/dev/ttyUSB0".to_string(),
                baud: Some(9600),
                framing: None,
            }
        );
        assert_eq!(
            DeviceConfig::from_spec("/dev/ttyUSB1:2400:mbus"),
            DeviceConfig {
                path: "/dev/ttyUSB1".to_string(),
                baud: Some(2400),
                framing: Some("mbus".to_string()),
            }
        );
        assert_eq!(DeviceConfig::from_spec("stdin").path, "stdin");
        assert_eq!(
            DeviceConfig::from_spec("cmd=rtl_wmbus -f 868M").path,
            "cmd=rtl_wmbus -f 868M"
        );
    }

    #[test]
    fn test_meter_spec_parsing() {
        let m = MeterConfig::from_spec("heat:multical302:12345678").unwrap();
        assert_eq!(m.name, "heat");
        assert_eq!(m.driver, "multical302");
        assert_eq!(m.ids, vec!["12345678".to_string()]);
        assert_eq!(m.key, None);

        let m =
            MeterConfig::from_spec("pulse:lansenpu:66778899:000102030405060708090A0B0C0D0E0F")
                .unwrap();
        assert_eq!(m.key.as_deref(), Some("000102030405060708090A0B0C0D0E0F"));

        assert!(MeterConfig::from_spec("broken").is_err());
    }

    #[test]
    fn test_config_from_json() {
        let json = r#"{
            "devices": [{"path": "/dev/ttyUSB0", "baud": 9600}],
            "meters": [{"name": "heat", "driver": "multical302", "ids": ["*"]}],
            "exit_after_seconds": 30
        }"#;
        let config = Config::from_json(json).unwrap();
        assert_eq!(config.devices.len(), 1);
        assert_eq!(config.meters[0].driver, "multical302");
        assert_eq!(config.exit_after_seconds, Some(30));
        assert!(!config.expect_devices_to_work);

        assert!(Config::from_json("{nope").is_err());
    }
}
