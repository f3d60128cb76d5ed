use std::collections::HashMap;
use std::fmt;

use tracing::{debug, warn};

use crate::modbus::{self, transport::Transport, Value};
use crate::profile::{
    keys, AccessMode, DeviceProfile, Group, RegisterDefinition, DEVICE_INFO_WORDS,
    MODEL_NAME_WORDS, SERIAL_NUMBER_WORDS,
};
use crate::Error;

pub const MANUFACTURER: &str = "Swegon";

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Version {
    pub major: u16,
    pub minor: u16,
    pub build: u16,
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.build)
    }
}

/// Identity of the unit, read once from the device-info block.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DeviceInfo {
    /// `None` until the block has been read successfully.
    pub firmware: Option<Version>,
    pub parameters: Option<(u16, u16)>,
    pub model_name: String,
    pub serial_number: String,
}

/// What the presentation layer needs to register the unit.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceMetadata {
    pub manufacturer: &'static str,
    pub model: String,
    pub serial_number: String,
    pub firmware: String,
}

/// Reads and writes the fields of one unit and keeps their last decoded values.
///
/// Values are only ever replaced: a group is decoded in full before any of its fields is stored, so a failed read
/// leaves every previously decoded value in place.
pub struct DeviceClient<T> {
    transport: T,
    profile: DeviceProfile,
    values: HashMap<&'static str, Value>,
    info: DeviceInfo,
}

impl<T: Transport> DeviceClient<T> {
    pub fn new(transport: T, profile: DeviceProfile) -> Self {
        Self {
            transport,
            profile,
            values: HashMap::new(),
            info: DeviceInfo::default(),
        }
    }

    pub fn profile(&self) -> &DeviceProfile {
        &self.profile
    }

    pub fn value(&self, key: &str) -> Option<Value> {
        self.values.get(key).copied()
    }

    pub fn values(&self) -> &HashMap<&'static str, Value> {
        &self.values
    }

    pub fn device_info(&self) -> &DeviceInfo {
        &self.info
    }

    pub fn is_device_info_loaded(&self) -> bool {
        self.info.firmware.is_some()
    }

    /// Firmware as `major.minor.build`, once the device-info block has been read.
    pub fn firmware(&self) -> Option<String> {
        self.info.firmware.map(|version| version.to_string())
    }

    pub fn model_name(&self) -> &str {
        &self.info.model_name
    }

    pub fn serial_number(&self) -> &str {
        &self.info.serial_number
    }

    pub fn metadata(&self) -> Option<DeviceMetadata> {
        Some(DeviceMetadata {
            manufacturer: MANUFACTURER,
            model: self.info.model_name.clone(),
            serial_number: self.info.serial_number.clone(),
            firmware: self.firmware()?,
        })
    }

    /// Reads every field of `group` with a single batch request.
    pub async fn read_group(&mut self, group: Group) -> crate::Result<()> {
        match group {
            Group::DeviceInfo => return self.read_device_info().await,
            Group::VirtualSensors => {
                self.update_efficiency();
                return Ok(());
            }
            _ => {}
        }

        let registers = self
            .profile
            .group(group)
            .ok_or(Error::MissingGroup(group.as_str()))?;
        let Some(address) = registers.first_address() else {
            return Ok(());
        };
        let count = registers.len();

        debug!(%group, address, count, mode = ?registers.mode(), "Reading group");
        self.transport.connect().await?;
        let words = match registers.mode() {
            AccessMode::ReadOnly => {
                self.transport
                    .read_input_registers(address, count as u16)
                    .await?
            }
            AccessMode::ReadWrite => {
                self.transport
                    .read_holding_registers(address, count as u16)
                    .await?
            }
        };

        if words.len() != count {
            return Err(Error::Decode {
                group: group.as_str(),
                expected: count,
                actual: words.len(),
            });
        }

        self.values.extend(
            registers
                .fields()
                .iter()
                .zip(&words)
                .map(|(field, &word)| {
                    (
                        field.key,
                        modbus::decode_word(word, field.definition.scaling),
                    )
                }),
        );
        debug!(%group, raw = ?words, "Decoded group");
        Ok(())
    }

    /// Reads the fixed-size identity block: version numbers plus model name and serial number as text.
    pub async fn read_device_info(&mut self) -> crate::Result<()> {
        let registers = self
            .profile
            .group(Group::DeviceInfo)
            .ok_or(Error::MissingGroup(Group::DeviceInfo.as_str()))?;
        let Some(base) = registers.first_address() else {
            return Ok(());
        };

        debug!(address = base, count = DEVICE_INFO_WORDS, "Reading device info");
        self.transport.connect().await?;
        let words = self
            .transport
            .read_input_registers(base, DEVICE_INFO_WORDS)
            .await?;
        if words.len() != DEVICE_INFO_WORDS as usize {
            return Err(Error::Decode {
                group: Group::DeviceInfo.as_str(),
                expected: DEVICE_INFO_WORDS as usize,
                actual: words.len(),
            });
        }

        let offset = |key: &str| {
            registers
                .get(key)
                .and_then(|definition| definition.address.checked_sub(base))
                .map(usize::from)
        };
        // Version numbers are unsigned, unlike every other field.
        let number = |key: &str| offset(key).and_then(|at| words.get(at).copied());
        let text = |key: &str, len: usize| {
            offset(key)
                .and_then(|at| words.get(at..at + len))
                .map(modbus::decode_ascii)
                .unwrap_or_default()
        };

        let firmware = match (
            number(keys::FW_MAJOR),
            number(keys::FW_MINOR),
            number(keys::FW_BUILD),
        ) {
            (Some(major), Some(minor), Some(build)) => Some(Version {
                major,
                minor,
                build,
            }),
            _ => None,
        };
        let parameters = number(keys::PARAM_MAJOR).zip(number(keys::PARAM_MINOR));
        let numbers: Vec<(&'static str, Value)> = [
            keys::FW_MAJOR,
            keys::FW_MINOR,
            keys::FW_BUILD,
            keys::PARAM_MAJOR,
            keys::PARAM_MINOR,
        ]
        .into_iter()
        .filter_map(|key| number(key).map(|word| (key, Value::Integer(word.into()))))
        .collect();

        let info = DeviceInfo {
            firmware,
            parameters,
            model_name: text(keys::MODEL_NAME, MODEL_NAME_WORDS),
            serial_number: text(keys::SERIAL_NUMBER, SERIAL_NUMBER_WORDS),
        };
        debug!(?info, "Decoded device info");

        self.values.extend(numbers);
        self.info = info;
        Ok(())
    }

    pub async fn read_commands(&mut self) -> crate::Result<()> {
        self.read_group(Group::Commands).await
    }

    pub async fn read_setpoints(&mut self) -> crate::Result<()> {
        self.read_group(Group::Setpoints).await
    }

    pub async fn read_alarms(&mut self) -> crate::Result<()> {
        self.read_group(Group::Alarms).await
    }

    pub async fn read_unit_statuses(&mut self) -> crate::Result<()> {
        self.read_group(Group::UnitStatuses).await
    }

    /// Reads the primary sensors, recomputes heat recovery efficiency, then reads the secondary sensors.
    pub async fn read_sensors(&mut self) -> crate::Result<()> {
        self.read_group(Group::Sensors).await?;
        self.update_efficiency();
        if self.profile.group(Group::Sensors2).is_some() {
            self.read_group(Group::Sensors2).await?;
        }
        Ok(())
    }

    /// Reads whichever configuration groups the profile has.
    pub async fn read_config(&mut self) -> crate::Result<()> {
        for group in [Group::Config, Group::NightCooling, Group::AlarmReset] {
            if self.profile.group(group).is_some() {
                self.read_group(group).await?;
            }
        }
        Ok(())
    }

    fn update_efficiency(&mut self) {
        if self
            .profile
            .lookup(Group::VirtualSensors, keys::EFFICIENCY)
            .is_none()
        {
            return;
        }
        let temperature = |key: &str| self.values.get(key).map(Value::as_f64);
        if let (Some(fresh), Some(supply), Some(extract)) = (
            temperature(keys::FRESH_TEMP),
            temperature(keys::SUPPLY_TEMP),
            temperature(keys::EXTRACT_TEMP),
        ) {
            let value = efficiency(fresh, supply, extract);
            if value.is_nan() {
                warn!(fresh, extract, "Efficiency undefined, extract and fresh air temperatures are equal");
            }
            self.values.insert(keys::EFFICIENCY, Value::Float(value));
        }
    }

    /// Writes one holding register and, on success, caches `value` as given.
    ///
    /// Failures leave the cached value untouched and carry the group and key.
    pub async fn write_value(&mut self, group: Group, key: &str, value: f64) -> crate::Result<()> {
        let registers = self
            .profile
            .group(group)
            .ok_or_else(|| Error::not_found(group.as_str(), key))?;
        let field = registers
            .fields()
            .iter()
            .find(|field| field.key == key)
            .ok_or_else(|| Error::not_found(group.as_str(), key))?;
        if registers.mode() == AccessMode::ReadOnly || field.definition.derived {
            return Err(Error::ReadOnly {
                group: group.as_str(),
                key: key.to_owned(),
            });
        }

        let (key, definition) = (field.key, field.definition);
        let word = modbus::encode(value, definition.scaling).ok_or_else(|| Error::Encode {
            key: key.to_owned(),
            value,
        })?;

        debug!(%group, key, value, word, address = definition.address, "Writing value");
        self.write_word(definition.address, word)
            .await
            .map_err(|source| Error::Write {
                group: group.as_str(),
                key: key.to_owned(),
                source: Box::new(source),
            })?;

        self.values.insert(key, written(value, &definition));
        Ok(())
    }

    /// Drops the transport's connection, e.g. after a request was abandoned on timeout.
    pub async fn disconnect(&mut self) {
        self.transport.disconnect().await;
    }

    async fn write_word(&mut self, address: u16, word: u16) -> crate::Result<()> {
        self.transport.connect().await?;
        self.transport.write_register(address, word).await
    }
}

/// Share of the temperature rise across the heat exchanger, in percent with one decimal.
///
/// NaN when extract and fresh air temperatures are equal.
pub fn efficiency(fresh: f64, supply: f64, extract: f64) -> f64 {
    let denominator = extract - fresh;
    if denominator == 0.0 {
        return f64::NAN;
    }
    modbus::round_dp((supply - fresh) / denominator * 100.0, 1)
}

fn written(value: f64, definition: &RegisterDefinition) -> Value {
    if definition.is_unscaled() && value.fract() == 0.0 {
        Value::Integer(value as i64)
    } else {
        Value::Float(value)
    }
}

#[cfg(test)]
use crate::modbus::mock::{Call, MockTransport};
#[cfg(test)]
use pretty_assertions::assert_eq;

#[cfg(test)]
fn client(profile: &str) -> (DeviceClient<MockTransport>, MockTransport) {
    let transport = MockTransport::default();
    let client = DeviceClient::new(transport.clone(), DeviceProfile::resolve(profile));
    (client, transport)
}

#[cfg(test)]
fn ascii(text: &str) -> Vec<u16> {
    text.chars().map(|c| c as u16).collect()
}

#[test]
fn efficiency_of_known_temperatures() {
    assert_eq!(efficiency(0.0, 10.0, 20.0), 50.0);
    assert_eq!(efficiency(-5.0, 15.0, 21.0), 76.9);
    assert!(efficiency(20.0, 10.0, 20.0).is_nan());
}

#[tokio::test]
async fn sensor_group_is_scaled_per_field() {
    let (mut client, transport) = client("casa_r4");
    let raw: Vec<u16> = vec![
        0xFFCE, 185, 190, 215, 12, 211, 0, 0, 0, 0, 0, 650, 640, 38, 71, 80, 120, 55, 0xFFFB,
        42, 40,
    ];
    transport.set_input(6200, &raw);

    client.read_group(Group::Sensors).await.unwrap();

    assert_eq!(transport.calls(), vec![Call::ReadInput(6200, 21)]);
    let sensors = client.profile().group(Group::Sensors).unwrap().clone();
    for (field, word) in sensors.fields().iter().zip(raw) {
        let expected = if field.definition.scaling == 1.0 {
            Value::Integer(modbus::twos_complement(word))
        } else {
            Value::Float(modbus::twos_complement(word) as f64 * field.definition.scaling)
        };
        assert_eq!(client.value(field.key), Some(expected), "{}", field.key);
    }
    assert_eq!(client.value("Fresh_Temp"), Some(Value::Float(-50.0 * 0.1)));
    assert_eq!(client.value("Exhaust_Pressure"), Some(Value::Integer(-5)));
    assert_eq!(client.value("Supply_Flow"), Some(Value::Float(42.0 * 3.6)));
}

#[tokio::test]
async fn holding_groups_use_holding_reads() {
    let (mut client, transport) = client("casa_r4");
    transport.set_holding(5000, &[2, 1, 0, 0]);
    transport.set_holding(5100, &[215]);

    client.read_commands().await.unwrap();
    client.read_setpoints().await.unwrap();

    assert_eq!(
        transport.calls(),
        vec![Call::ReadHolding(5000, 4), Call::ReadHolding(5100, 1)]
    );
    assert_eq!(client.value("Op_Mode"), Some(Value::Integer(2)));
    assert_eq!(client.value("Fireplace_Mode"), Some(Value::Integer(1)));
    assert_eq!(client.value("Temp_SP"), Some(Value::Float(215.0 * 0.1)));
    assert!(transport.connects() >= 2);
}

#[tokio::test]
async fn short_response_discards_whole_group() {
    let (mut client, transport) = client("casa_r4");
    transport.set_input(6300, &[3, 2, 45, 44]);
    client.read_unit_statuses().await.unwrap();
    assert_eq!(client.value("Supply_Fan"), Some(Value::Integer(45)));

    transport.set_input(6300, &[1, 1, 10, 10]);
    transport.truncate_at(6300);
    let err = client.read_unit_statuses().await.unwrap_err();

    assert!(err.is_decode());
    assert!(matches!(
        err,
        Error::Decode {
            group: "UnitStatuses",
            expected: 17,
            actual: 16
        }
    ));
    assert_eq!(client.value("Unit_state"), Some(Value::Integer(3)));
    assert_eq!(client.value("Supply_Fan"), Some(Value::Integer(45)));
}

#[tokio::test]
async fn transport_failure_keeps_cached_values() {
    let (mut client, transport) = client("casa_r4");
    transport.set_input(6100, &[0, 1]);
    client.read_alarms().await.unwrap();

    transport.set_input(6100, &[1, 0]);
    transport.fail_at(6100);
    let err = client.read_alarms().await.unwrap_err();

    assert!(err.is_transport());
    assert_eq!(client.value("T1_Failure"), Some(Value::Integer(0)));
    assert_eq!(client.value("T2_Failure"), Some(Value::Integer(1)));
}

#[tokio::test]
async fn device_info_block_is_sliced() {
    let (mut client, transport) = client("casa_r4");
    let mut block = vec![0u16; DEVICE_INFO_WORDS as usize];
    block[..5].copy_from_slice(&[2, 14, 0x9000, 7, 3]);
    let model = ascii("CASA R4");
    block[7..7 + model.len()].copy_from_slice(&model);
    let serial = ascii("SW1234567");
    block[23..23 + serial.len()].copy_from_slice(&serial);
    transport.set_input(6000, &block);

    assert!(!client.is_device_info_loaded());
    assert_eq!(client.metadata(), None);
    client.read_device_info().await.unwrap();

    assert_eq!(transport.calls(), vec![Call::ReadInput(6000, 47)]);
    assert_eq!(client.firmware().as_deref(), Some("2.14.36864"));
    assert_eq!(client.model_name(), "CASA R4");
    assert_eq!(client.serial_number(), "SW1234567");
    assert_eq!(client.device_info().parameters, Some((7, 3)));
    assert_eq!(client.value("FW_Build"), Some(Value::Integer(36864)));
    assert_eq!(
        client.metadata(),
        Some(DeviceMetadata {
            manufacturer: "Swegon",
            model: "CASA R4".to_owned(),
            serial_number: "SW1234567".to_owned(),
            firmware: "2.14.36864".to_owned(),
        })
    );
}

#[tokio::test]
async fn short_device_info_block_is_rejected() {
    let (mut client, transport) = client("casa_r4");
    transport.set_input(6000, &[1, 2, 3]);
    transport.truncate_at(6000);

    assert!(client.read_device_info().await.unwrap_err().is_decode());
    assert!(!client.is_device_info_loaded());
    assert_eq!(client.value("FW_Maj"), None);
}

#[tokio::test]
async fn sensors_derive_efficiency() {
    let (mut client, transport) = client("casa_r4");
    transport.set_input(6200, &[0, 100, 100, 200]);
    transport.set_input(6233, &[87]);

    client.read_sensors().await.unwrap();

    assert_eq!(client.value(keys::EFFICIENCY), Some(Value::Float(50.0)));
    assert_eq!(client.value("Heat_Exchanger"), Some(Value::Integer(87)));
    assert_eq!(
        transport.calls(),
        vec![Call::ReadInput(6200, 21), Call::ReadInput(6233, 1)]
    );
}

#[tokio::test]
async fn equal_temperatures_leave_efficiency_undefined() {
    let (mut client, transport) = client("casa_r4");
    transport.set_input(6200, &[180, 150, 150, 180]);

    client.read_sensors().await.unwrap();

    let efficiency = client.value(keys::EFFICIENCY).unwrap();
    assert!(efficiency.as_f64().is_nan());
}

#[tokio::test]
async fn write_through_caches_unrounded_value() {
    let (mut client, transport) = client("casa_r4");

    client
        .write_value(Group::Setpoints, "Temp_SP", 21.46)
        .await
        .unwrap();
    client
        .write_value(Group::Commands, "Op_Mode", 3.0)
        .await
        .unwrap();

    assert_eq!(transport.holding(5100), Some(215));
    assert_eq!(transport.holding(5000), Some(3));
    assert_eq!(client.value("Temp_SP"), Some(Value::Float(21.46)));
    assert_eq!(client.value("Op_Mode"), Some(Value::Integer(3)));
    assert_eq!(
        transport.calls(),
        vec![Call::Write(5100, 215), Call::Write(5000, 3)]
    );
}

#[tokio::test]
async fn negative_values_are_written_as_twos_complement() {
    let (mut client, transport) = client("casa_r15");
    client
        .write_value(Group::Setpoints, "Temp_SP", -2.0)
        .await
        .unwrap();
    assert_eq!(transport.holding(5100), Some(0xFFFE));
    assert_eq!(client.value("Temp_SP"), Some(Value::Integer(-2)));
}

#[tokio::test]
async fn failed_write_is_tagged_and_not_cached() {
    let (mut client, transport) = client("casa_r4");
    transport.set_holding(5100, &[200]);
    client.read_setpoints().await.unwrap();

    transport.fail_at(5100);
    let err = client
        .write_value(Group::Setpoints, "Temp_SP", 22.0)
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        Error::Write { group: "Setpoints", ref key, .. } if key == "Temp_SP"
    ));
    assert!(err.is_transport());
    assert_eq!(client.value("Temp_SP"), Some(Value::Float(200.0 * 0.1)));

    transport.recover(5100);
    client
        .write_value(Group::Setpoints, "Temp_SP", 22.0)
        .await
        .unwrap();
    assert_eq!(client.value("Temp_SP"), Some(Value::Float(22.0)));
}

#[tokio::test]
async fn out_of_range_write_is_refused_without_io() {
    let (mut client, transport) = client("casa_r4");
    transport.set_holding(5000, &[2, 0, 0, 0]);
    transport.set_holding(5100, &[200]);
    client.read_commands().await.unwrap();
    client.read_setpoints().await.unwrap();
    let reads = transport.calls().len();

    let err = client
        .write_value(Group::Setpoints, "Temp_SP", 7000.0)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Encode { ref key, .. } if key == "Temp_SP"));
    let err = client
        .write_value(Group::Commands, "Op_Mode", 65538.0)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Encode { ref key, .. } if key == "Op_Mode"));

    assert_eq!(transport.calls().len(), reads);
    assert_eq!(transport.holding(5100), Some(200));
    assert_eq!(transport.holding(5000), Some(2));
    assert_eq!(client.value("Temp_SP"), Some(Value::Float(200.0 * 0.1)));
    assert_eq!(client.value("Op_Mode"), Some(Value::Integer(2)));
}

#[tokio::test]
async fn read_only_fields_are_refused_without_io() {
    let (mut client, transport) = client("casa_r4");

    let err = client
        .write_value(Group::Sensors, "Fresh_Temp", 10.0)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ReadOnly { group: "Sensors", .. }));

    let err = client
        .write_value(Group::VirtualSensors, keys::EFFICIENCY, 80.0)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ReadOnly { .. }));

    let err = client
        .write_value(Group::Setpoints, "Temp_SP", f64::INFINITY)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Encode { .. }));

    assert!(transport.calls().is_empty());
}

#[tokio::test]
async fn config_groups_are_read_separately() {
    let (mut client, transport) = client("casa_r4");
    transport.set_holding(5103, &[60, 2, 1]);
    transport.set_holding(5163, &[1, 25, 20, 23, 12]);

    client.read_config().await.unwrap();

    assert_eq!(
        transport.calls(),
        vec![
            Call::ReadHolding(5103, 3),
            Call::ReadHolding(5163, 5),
            Call::ReadHolding(5406, 1),
        ]
    );
    assert_eq!(client.value("Fireplace_Run_Time"), Some(Value::Integer(60)));
    assert_eq!(
        client.value("Night_Cooling_SupplyTemp_Min"),
        Some(Value::Integer(12))
    );
    assert_eq!(client.value("Reset_Alarms"), Some(Value::Integer(0)));
}

#[tokio::test]
async fn empty_profile_reports_not_found() {
    let (mut client, transport) = client("unknown model");

    assert!(matches!(
        client.read_group(Group::Sensors).await,
        Err(Error::MissingGroup("Sensors"))
    ));
    assert!(matches!(
        client.read_device_info().await,
        Err(Error::MissingGroup(_))
    ));
    assert!(matches!(
        client.write_value(Group::Setpoints, "Temp_SP", 20.0).await,
        Err(Error::NotFound { .. })
    ));
    assert_eq!(client.value("Temp_SP"), None);
    assert!(transport.calls().is_empty());
}
