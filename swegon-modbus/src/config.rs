//! Bridge configuration, read from a JSON file.

use std::{fs::File, io::BufReader, path::Path, str::FromStr};

use serde::Deserialize;

use crate::{coordinator::Settings, modbus::connection};

#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    /// Selects the register profile, e.g. `"CASA R4"`.
    #[serde(alias = "model")]
    pub device: String,

    /// Used to tell units apart in logs. Defaults to the device.
    #[serde(default)]
    pub name: Option<String>,

    #[serde(flatten)]
    pub connection: connection::Config,

    #[serde(flatten)]
    pub settings: Settings,
}

impl Config {
    pub fn from_path(path: impl AsRef<Path>) -> crate::Result<Self> {
        let reader = BufReader::new(File::open(path)?);
        Ok(serde_json::from_reader(reader)?)
    }

    pub fn name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.device)
    }
}

impl FromStr for Config {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        Ok(serde_json::from_str(s)?)
    }
}

#[cfg(all(test, feature = "tcp"))]
use crate::modbus::connection::ModbusProto;
#[cfg(test)]
use pretty_assertions::assert_eq;
#[cfg(all(test, feature = "tcp"))]
use std::time::Duration;

#[test]
#[cfg(feature = "tcp")]
fn parse_full_config() {
    let config: Config = r#"{
        "device": "CASA R4",
        "name": "attic",
        "proto": "tcp",
        "host": "10.0.0.20",
        "port": 5020,
        "unit": 3,
        "interval": "10s",
        "setpoint_staleness": "1h 30m",
        "timeout": "5s"
    }"#
    .parse()
    .unwrap();

    assert_eq!(config.device, "CASA R4");
    assert_eq!(config.name(), "attic");
    assert!(matches!(
        config.connection.settings,
        ModbusProto::Tcp { ref host, port: 5020 } if host == "10.0.0.20"
    ));
    assert_eq!(config.connection.unit, tokio_modbus::slave::Slave(3));
    assert_eq!(config.settings.interval, Duration::from_secs(10));
    assert_eq!(config.settings.setpoint_staleness, Duration::from_secs(90 * 60));
    assert_eq!(config.settings.timeout, Duration::from_secs(5));
}

#[test]
#[cfg(feature = "tcp")]
fn parse_minimal_config() {
    let config: Config = r#"{"model": "CASA R15", "proto": "tcp", "host": "casa.local", "period": "1m"}"#
        .parse()
        .unwrap();

    assert_eq!(config.device, "CASA R15");
    assert_eq!(config.name(), "CASA R15");
    assert_eq!(config.connection.address_offset, 0);
    assert_eq!(config.settings.interval, Duration::from_secs(60));
    assert_eq!(config.settings.setpoint_staleness, Duration::from_secs(3 * 60 * 60));
    assert_eq!(config.settings.timeout, Duration::from_secs(20));
}

#[test]
fn device_is_required() {
    let error = r#"{"proto": "tcp", "host": "casa.local"}"#
        .parse::<Config>()
        .unwrap_err();
    assert!(matches!(error, crate::Error::JSONError(_)));
}

#[test]
fn missing_file() {
    let error = Config::from_path("/nonexistent/swegon.json").unwrap_err();
    assert!(matches!(error, crate::Error::IOError(_)));
}
