//! Static description of where each field of a unit lives in its register space.

use std::collections::BTreeMap;
use std::fmt;

use tracing::{debug, warn};

use crate::modbus::UNSCALED;

mod casa;

/// Keys the client needs to know about by name.
pub mod keys {
    pub const FW_MAJOR: &str = "FW_Maj";
    pub const FW_MINOR: &str = "FW_Min";
    pub const FW_BUILD: &str = "FW_Build";
    pub const PARAM_MAJOR: &str = "Par_Maj";
    pub const PARAM_MINOR: &str = "Par_Min";
    pub const MODEL_NAME: &str = "Model_Name";
    pub const SERIAL_NUMBER: &str = "Serial_Number";

    pub const FRESH_TEMP: &str = "Fresh_Temp";
    pub const SUPPLY_TEMP: &str = "Supply_Temp1";
    pub const EXTRACT_TEMP: &str = "Extract_Temp";
    pub const EFFICIENCY: &str = "Efficiency";
}

/// Number of input registers making up the device-info block.
pub const DEVICE_INFO_WORDS: u16 = 47;
/// Model name length, one character per register.
pub const MODEL_NAME_WORDS: usize = 15;
/// Serial number length, one character per register.
pub const SERIAL_NUMBER_WORDS: usize = 24;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Group {
    Commands,
    Setpoints,
    DeviceInfo,
    Alarms,
    Sensors,
    Sensors2,
    VirtualSensors,
    UnitStatuses,
    Config,
    NightCooling,
    AlarmReset,
}

impl Group {
    pub const ALL: [Group; 11] = [
        Group::Commands,
        Group::Setpoints,
        Group::DeviceInfo,
        Group::Alarms,
        Group::Sensors,
        Group::Sensors2,
        Group::VirtualSensors,
        Group::UnitStatuses,
        Group::Config,
        Group::NightCooling,
        Group::AlarmReset,
    ];

    pub fn as_str(&self) -> &'static str {
        use Group::*;
        match self {
            Commands => "Commands",
            Setpoints => "Setpoints",
            DeviceInfo => "Device_Info",
            Alarms => "Alarms",
            Sensors => "Sensors",
            Sensors2 => "Sensors2",
            VirtualSensors => "VirtualSensors",
            UnitStatuses => "UnitStatuses",
            Config => "Config",
            NightCooling => "NightCooling",
            AlarmReset => "AlarmReset",
        }
    }

    pub fn from_name(name: &str) -> Option<Group> {
        Group::ALL.into_iter().find(|group| group.as_str() == name)
    }

    /// Commands, setpoints and configuration live in holding registers; everything else is an input register.
    pub fn access_mode(&self) -> AccessMode {
        use Group::*;
        match self {
            Commands | Setpoints | Config | NightCooling | AlarmReset => AccessMode::ReadWrite,
            DeviceInfo | Alarms | Sensors | Sensors2 | UnitStatuses | VirtualSensors => {
                AccessMode::ReadOnly
            }
        }
    }
}

impl fmt::Display for Group {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AccessMode {
    /// Input registers.
    ReadOnly,
    /// Holding registers.
    ReadWrite,
}

impl AccessMode {
    /// Access mode for a group given by name. Names not known to this crate are treated as read-only.
    // TODO: confirm against Swegon's register documentation before letting a new group name default to holding
    // registers.
    pub fn of(group: &str) -> AccessMode {
        Group::from_name(group)
            .map(|group| group.access_mode())
            .unwrap_or(AccessMode::ReadOnly)
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RegisterDefinition {
    pub address: u16,
    /// Multiplier from the decoded integer to engineering units. [`UNSCALED`] keeps the raw integer.
    pub scaling: f64,
    /// Computed from other fields rather than read from the device.
    pub derived: bool,
}

impl RegisterDefinition {
    pub const fn new(address: u16) -> Self {
        Self::scaled(address, UNSCALED)
    }

    pub const fn scaled(address: u16, scaling: f64) -> Self {
        Self {
            address,
            scaling,
            derived: false,
        }
    }

    pub const fn derived() -> Self {
        Self {
            address: 0,
            scaling: UNSCALED,
            derived: true,
        }
    }

    pub fn is_unscaled(&self) -> bool {
        self.scaling == UNSCALED
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Field {
    pub key: &'static str,
    pub definition: RegisterDefinition,
}

/// Named fields read together in one batch.
#[derive(Clone, Debug, PartialEq)]
pub struct RegisterGroup {
    group: Group,
    mode: AccessMode,
    fields: Vec<Field>,
}

impl RegisterGroup {
    pub fn group(&self) -> Group {
        self.group
    }

    pub fn mode(&self) -> AccessMode {
        self.mode
    }

    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn first_address(&self) -> Option<u16> {
        self.fields.first().map(|field| field.definition.address)
    }

    pub fn get(&self, key: &str) -> Option<&RegisterDefinition> {
        self.fields
            .iter()
            .find(|field| field.key == key)
            .map(|field| &field.definition)
    }

    /// Whether one batch read starting at the first address covers every field, in order.
    pub fn is_contiguous(&self) -> bool {
        self.fields
            .windows(2)
            .all(|pair| pair[0].definition.address.checked_add(1) == Some(pair[1].definition.address))
    }
}

/// Replaces one field's definition in the base table.
#[derive(Clone, Copy, Debug)]
pub struct Override {
    pub group: Group,
    pub key: &'static str,
    pub definition: RegisterDefinition,
}

pub(crate) type Table = &'static [(Group, &'static [(&'static str, RegisterDefinition)])];

/// The register layout of one unit model. Immutable once resolved.
#[derive(Clone, Debug, PartialEq)]
pub struct DeviceProfile {
    id: String,
    groups: BTreeMap<Group, RegisterGroup>,
}

impl DeviceProfile {
    /// Selects the profile for a model identifier such as `"CASA R4"` or `"casa_r15"`.
    ///
    /// Unknown identifiers give an empty profile on which every lookup misses.
    pub fn resolve(id: &str) -> DeviceProfile {
        let normalized = id.to_lowercase().replace(' ', "_");
        match casa::VARIANTS
            .iter()
            .find(|variant| variant.id == normalized)
        {
            Some(variant) => {
                let profile = Self::from_table(normalized, casa::BASE, variant.overrides);
                debug!(id = %profile.id, groups = profile.groups.len(), "Loaded device profile");
                profile
            }
            None => {
                warn!(id, "Unknown device profile, no registers will be polled");
                Self::empty(normalized)
            }
        }
    }

    pub fn empty<S: Into<String>>(id: S) -> DeviceProfile {
        DeviceProfile {
            id: id.into(),
            groups: BTreeMap::new(),
        }
    }

    pub(crate) fn from_table<S: Into<String>>(
        id: S,
        table: Table,
        overrides: &[Override],
    ) -> DeviceProfile {
        let mut groups: BTreeMap<Group, RegisterGroup> = table
            .iter()
            .map(|(group, fields)| {
                let group_fields = fields
                    .iter()
                    .map(|&(key, definition)| Field { key, definition })
                    .collect();
                (
                    *group,
                    RegisterGroup {
                        group: *group,
                        mode: group.access_mode(),
                        fields: group_fields,
                    },
                )
            })
            .collect();

        for o in overrides {
            match groups
                .get_mut(&o.group)
                .and_then(|group| group.fields.iter_mut().find(|field| field.key == o.key))
            {
                Some(field) => field.definition = o.definition,
                None => warn!(group = %o.group, key = o.key, "Override for a field missing from the base table"),
            }
        }

        DeviceProfile {
            id: id.into(),
            groups,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    pub fn group(&self, group: Group) -> Option<&RegisterGroup> {
        self.groups.get(&group)
    }

    pub fn groups(&self) -> impl Iterator<Item = &RegisterGroup> {
        self.groups.values()
    }

    pub fn lookup(&self, group: Group, key: &str) -> Option<&RegisterDefinition> {
        self.group(group)?.get(key)
    }

    /// Finds a field by key alone. Keys are unique across the whole profile.
    pub fn find(&self, key: &str) -> Option<(Group, &RegisterDefinition)> {
        self.groups
            .values()
            .find_map(|group| group.get(key).map(|definition| (group.group, definition)))
    }

    /// Access mode of a group in this profile, by name. Groups the profile lacks are read-only.
    pub fn access_mode(&self, group: &str) -> AccessMode {
        Group::from_name(group)
            .and_then(|group| self.group(group))
            .map(|group| group.mode)
            .unwrap_or(AccessMode::ReadOnly)
    }
}

#[cfg(test)]
use pretty_assertions::assert_eq;

#[test]
fn resolve_normalizes_model_identifier() {
    for id in ["casa_r4", "CASA R4", "Casa_R4"] {
        let profile = DeviceProfile::resolve(id);
        assert_eq!(profile.id(), "casa_r4");
        assert!(!profile.is_empty());
    }
}

#[test]
fn unknown_profile_is_empty() {
    let profile = DeviceProfile::resolve("CASA W100");
    assert!(profile.is_empty());
    assert_eq!(profile.groups().count(), 0);
    assert_eq!(profile.lookup(Group::Setpoints, "Temp_SP"), None);
    assert_eq!(profile.find("Temp_SP"), None);
    assert_eq!(profile.access_mode("Setpoints"), AccessMode::ReadOnly);
}

#[test]
fn variant_only_overrides_setpoint_scaling() {
    let r4 = DeviceProfile::resolve("casa_r4");
    let r15 = DeviceProfile::resolve("casa_r15");

    assert_eq!(
        r4.lookup(Group::Setpoints, "Temp_SP"),
        Some(&RegisterDefinition::scaled(5100, 0.1))
    );
    assert_eq!(
        r15.lookup(Group::Setpoints, "Temp_SP"),
        Some(&RegisterDefinition::new(5100))
    );

    let differing: Vec<&str> = r4
        .groups()
        .zip(r15.groups())
        .flat_map(|(a, b)| a.fields().iter().zip(b.fields()))
        .filter(|(a, b)| a != b)
        .map(|(a, _)| a.key)
        .collect();
    assert_eq!(differing, vec!["Temp_SP"]);
}

#[test]
fn batch_groups_are_contiguous() {
    let profile = DeviceProfile::resolve("casa_r4");
    for group in profile.groups() {
        match group.group() {
            // Fixed block layout and computed values are not read field by field.
            Group::DeviceInfo | Group::VirtualSensors => continue,
            _ => assert!(group.is_contiguous(), "{} is not contiguous", group.group()),
        }
    }
}

#[test]
fn keys_are_unique_across_groups() {
    let profile = DeviceProfile::resolve("casa_r15");
    let mut keys: Vec<&str> = profile
        .groups()
        .flat_map(|group| group.fields().iter().map(|field| field.key))
        .collect();
    let total = keys.len();
    keys.sort_unstable();
    keys.dedup();
    assert_eq!(keys.len(), total);
}

#[test]
fn access_modes_follow_register_bank() {
    let profile = DeviceProfile::resolve("casa_r4");
    assert_eq!(profile.access_mode("Commands"), AccessMode::ReadWrite);
    assert_eq!(profile.access_mode("Setpoints"), AccessMode::ReadWrite);
    assert_eq!(profile.access_mode("Config"), AccessMode::ReadWrite);
    assert_eq!(profile.access_mode("Device_Info"), AccessMode::ReadOnly);
    assert_eq!(profile.access_mode("Sensors"), AccessMode::ReadOnly);
    assert_eq!(profile.access_mode("UnitStatuses"), AccessMode::ReadOnly);
    assert_eq!(profile.access_mode("Statuses"), AccessMode::ReadOnly);
    assert_eq!(AccessMode::of("Statuses"), AccessMode::ReadOnly);
    assert_eq!(AccessMode::of("NightCooling"), AccessMode::ReadWrite);
}

#[test]
fn find_reports_owning_group() {
    let profile = DeviceProfile::resolve("casa_r4");
    assert_eq!(
        profile.find("Supply_Flow"),
        Some((Group::Sensors, &RegisterDefinition::scaled(6219, 3.6)))
    );
    assert_eq!(
        profile.find("Night_Cooling"),
        Some((Group::NightCooling, &RegisterDefinition::new(5163)))
    );
    assert!(profile.find(keys::EFFICIENCY).unwrap().1.derived);
}

#[test]
fn override_for_missing_field_is_ignored() {
    const TABLE: Table = &[(Group::Setpoints, &[("Temp_SP", RegisterDefinition::scaled(5100, 0.1))])];
    let profile = DeviceProfile::from_table(
        "test",
        TABLE,
        &[Override {
            group: Group::Setpoints,
            key: "Humidity_SP",
            definition: RegisterDefinition::new(5101),
        }],
    );
    assert_eq!(profile.group(Group::Setpoints).unwrap().len(), 1);
    assert_eq!(profile.find("Humidity_SP"), None);
}
