//! Periodic polling of one unit, with cached values served between cycles.

use std::{collections::HashMap, sync::Arc, time::Duration};

use serde::Deserialize;
use tokio::{
    select,
    sync::{mpsc, watch, Mutex},
    time::{Instant, MissedTickBehavior},
};
use tracing::{debug, info, warn};

use crate::{
    client::{DeviceClient, DeviceMetadata},
    modbus::{transport::Transport, Value},
    profile::Group,
    shutdown::Shutdown,
    Error,
};

/// Last known value of every field, keyed by field name.
pub type Snapshot = Arc<HashMap<&'static str, Value>>;

/// Read on every cycle, after the sensors.
const STATUS_GROUPS: [Group; 3] = [Group::UnitStatuses, Group::Commands, Group::Alarms];

/// Only re-read once the staleness window has passed.
const SETPOINT_GROUPS: [Group; 4] = [
    Group::Setpoints,
    Group::Config,
    Group::NightCooling,
    Group::AlarmReset,
];

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
pub struct Settings {
    #[serde(
        with = "humantime_serde",
        default = "default_interval",
        alias = "period",
        alias = "scan_interval"
    )]
    pub interval: Duration,

    #[serde(with = "humantime_serde", default = "default_setpoint_staleness")]
    pub setpoint_staleness: Duration,

    /// Upper bound on a whole poll cycle or a single write.
    #[serde(with = "humantime_serde", default = "default_timeout")]
    pub timeout: Duration,
}

fn default_interval() -> Duration {
    Duration::from_secs(5)
}

fn default_setpoint_staleness() -> Duration {
    Duration::from_secs(3 * 60 * 60)
}

fn default_timeout() -> Duration {
    Duration::from_secs(20)
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            interval: default_interval(),
            setpoint_staleness: default_setpoint_staleness(),
            timeout: default_timeout(),
        }
    }
}

fn present<T: Transport>(client: &DeviceClient<T>, groups: &[Group]) -> Vec<Group> {
    groups
        .iter()
        .copied()
        .filter(|group| client.profile().group(*group).is_some())
        .collect()
}

struct State<T> {
    client: DeviceClient<T>,
    setpoints_read_at: Option<Instant>,
    synced: bool,
}

/// Owns the client for a single unit.
///
/// Poll cycles and writes are serialised through one lock, so at most one request is ever in flight
/// to the unit. Reads of cached values never touch the lock.
pub struct Coordinator<T> {
    name: String,
    settings: Settings,
    state: Mutex<State<T>>,
    snapshot: watch::Sender<Snapshot>,
    metadata: mpsc::Sender<DeviceMetadata>,
}

impl<T: Transport> Coordinator<T> {
    /// `metadata` receives the unit's identity once, after the first successful cycle.
    pub fn new(
        name: impl Into<String>,
        client: DeviceClient<T>,
        settings: Settings,
        metadata: mpsc::Sender<DeviceMetadata>,
    ) -> Self {
        let (snapshot, _) = watch::channel(Snapshot::default());
        Self {
            name: name.into(),
            settings,
            state: Mutex::new(State {
                client,
                setpoints_read_at: None,
                synced: false,
            }),
            snapshot,
            metadata,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Last known value of `key` in any group.
    pub fn get_value(&self, key: &str) -> Option<Value> {
        self.snapshot.borrow().get(key).copied()
    }

    pub fn subscribe(&self) -> watch::Receiver<Snapshot> {
        self.snapshot.subscribe()
    }

    pub async fn is_metadata_synced(&self) -> bool {
        self.state.lock().await.synced
    }

    pub async fn metadata(&self) -> Option<DeviceMetadata> {
        self.state.lock().await.client.metadata()
    }

    /// Writes `value` to the field named `key`. Failures are logged, never returned.
    pub async fn write_value(&self, key: &str, value: f64) -> bool {
        let mut state = self.state.lock().await;
        let Some((group, _)) = state.client.profile().find(key) else {
            warn!(device = %self.name, key, "Cannot write unknown field");
            return false;
        };

        let outcome = tokio::time::timeout(
            self.settings.timeout,
            state.client.write_value(group, key, value),
        )
        .await;
        let result = match outcome {
            Ok(result) => result,
            Err(_) => Err(self.abandon(&mut state).await),
        };

        match result {
            Ok(()) => {
                info!(device = %self.name, %group, key, value, "Wrote value");
                self.publish(&state);
                true
            }
            Err(error) => {
                warn!(device = %self.name, key, value, %error, "Write failed");
                false
            }
        }
    }

    /// Runs a single poll cycle.
    ///
    /// Groups read before a failure keep their fresh values, everything else keeps its previous value.
    pub async fn poll(&self) -> crate::Result<()> {
        let mut state = self.state.lock().await;
        let outcome = tokio::time::timeout(self.settings.timeout, self.cycle(&mut state)).await;
        let result = match outcome {
            Ok(result) => result,
            Err(_) => Err(self.abandon(&mut state).await),
        };
        self.publish(&state);
        result
    }

    async fn cycle(&self, state: &mut State<T>) -> crate::Result<()> {
        let client = &mut state.client;

        if !client.is_device_info_loaded() && client.profile().group(Group::DeviceInfo).is_some() {
            client.read_device_info().await?;
        }

        let stale = state
            .setpoints_read_at
            .map_or(true, |at| at.elapsed() > self.settings.setpoint_staleness);
        if stale {
            for group in present(client, &SETPOINT_GROUPS) {
                client.read_group(group).await?;
            }
            state.setpoints_read_at = Some(Instant::now());
        }

        if client.profile().group(Group::Sensors).is_some() {
            client.read_sensors().await?;
        }
        for group in present(client, &STATUS_GROUPS) {
            client.read_group(group).await?;
        }

        if !state.synced {
            if let Some(metadata) = client.metadata() {
                info!(
                    device = %self.name,
                    model = %metadata.model,
                    serial_number = %metadata.serial_number,
                    firmware = %metadata.firmware,
                    "Device identified"
                );
                if let Err(error) = self.metadata.try_send(metadata) {
                    warn!(device = %self.name, %error, "Could not publish device metadata");
                }
                state.synced = true;
            }
        }

        Ok(())
    }

    /// The timed out request may still be answered, so the connection it was sent on is not reused.
    async fn abandon(&self, state: &mut State<T>) -> Error {
        warn!(device = %self.name, timeout = ?self.settings.timeout, "Request timed out, dropping connection");
        state.client.disconnect().await;
        Error::Timeout(self.settings.timeout)
    }

    fn publish(&self, state: &State<T>) {
        self.snapshot
            .send_replace(Arc::new(state.client.values().clone()));
    }

    /// Polls every `interval` until `shutdown` fires. A failed cycle is logged and retried on the next tick.
    pub async fn run(&self, mut shutdown: Shutdown) {
        info!(device = %self.name, interval = ?self.settings.interval, "Starting poller");
        let mut interval = tokio::time::interval(self.settings.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            select! {
                _ = interval.tick() => {
                    match self.poll().await {
                        Ok(()) => debug!(device = %self.name, "Poll cycle complete"),
                        Err(error) => warn!(
                            device = %self.name,
                            %error,
                            transport = error.is_transport(),
                            "Poll cycle failed, serving cached values"
                        ),
                    }
                }
                _ = shutdown.recv() => {
                    info!(device = %self.name, "Stopping poller");
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
use crate::{
    modbus::mock::MockTransport,
    profile::{DeviceProfile, DEVICE_INFO_WORDS},
    shutdown,
};
#[cfg(test)]
use pretty_assertions::assert_eq;

#[cfg(test)]
const HOUR: Duration = Duration::from_secs(60 * 60);

#[cfg(test)]
fn seeded() -> MockTransport {
    let transport = MockTransport::default();
    let mut block = vec![0u16; DEVICE_INFO_WORDS as usize];
    block[..3].copy_from_slice(&[2, 14, 3]);
    for (word, c) in block[7..].iter_mut().zip("CASA R4".chars()) {
        *word = c as u16;
    }
    for (word, c) in block[23..].iter_mut().zip("SW42".chars()) {
        *word = c as u16;
    }
    transport.set_input(6000, &block);
    transport.set_holding(5000, &[2, 0, 0, 0]);
    transport.set_holding(5100, &[210]);
    transport.set_input(6200, &[0, 100, 100, 200]);
    transport.set_input(6300, &[3, 2, 45, 44]);
    transport
}

#[cfg(test)]
fn coordinator(
    profile: &str,
    transport: &MockTransport,
) -> (Coordinator<MockTransport>, mpsc::Receiver<DeviceMetadata>) {
    let (tx, rx) = mpsc::channel(1);
    let client = DeviceClient::new(transport.clone(), DeviceProfile::resolve(profile));
    let coordinator = Coordinator::new("test", client, Settings::default(), tx);
    (coordinator, rx)
}

#[test]
fn settings_defaults() {
    let settings: Settings = serde_json::from_str("{}").unwrap();
    assert_eq!(settings, Settings::default());
    assert_eq!(settings.interval, Duration::from_secs(5));
    assert_eq!(settings.setpoint_staleness, 3 * HOUR);
    assert_eq!(settings.timeout, Duration::from_secs(20));

    let settings: Settings =
        serde_json::from_str(r#"{"scan_interval": "30s", "setpoint_staleness": "1h"}"#).unwrap();
    assert_eq!(settings.interval, Duration::from_secs(30));
    assert_eq!(settings.setpoint_staleness, HOUR);
}

#[tokio::test(start_paused = true)]
async fn values_are_served_flat_across_groups() {
    let transport = seeded();
    let (coordinator, _rx) = coordinator("casa_r4", &transport);
    assert_eq!(coordinator.get_value("Temp_SP"), None);

    coordinator.poll().await.unwrap();

    assert_eq!(coordinator.get_value("Temp_SP"), Some(Value::Float(21.0)));
    assert_eq!(coordinator.get_value("Op_Mode"), Some(Value::Integer(2)));
    assert_eq!(coordinator.get_value("Supply_Fan"), Some(Value::Integer(45)));
    assert_eq!(coordinator.get_value("Efficiency"), Some(Value::Float(50.0)));
    assert_eq!(coordinator.get_value("FW_Maj"), Some(Value::Integer(2)));
    assert_eq!(coordinator.get_value("No_Such_Field"), None);
}

#[tokio::test(start_paused = true)]
async fn setpoints_are_reread_only_when_stale() {
    let transport = seeded();
    let (coordinator, _rx) = coordinator("casa_r4", &transport);

    coordinator.poll().await.unwrap();
    assert_eq!(transport.calls_at(5100), 1);

    tokio::time::advance(2 * HOUR).await;
    coordinator.poll().await.unwrap();
    assert_eq!(transport.calls_at(5100), 1);
    assert_eq!(transport.calls_at(5103), 1);

    tokio::time::advance(2 * HOUR).await;
    coordinator.poll().await.unwrap();
    assert_eq!(transport.calls_at(5100), 2);
    assert_eq!(transport.calls_at(5103), 2);

    // telemetry on every cycle, device info only once
    assert_eq!(transport.calls_at(6200), 3);
    assert_eq!(transport.calls_at(6300), 3);
    assert_eq!(transport.calls_at(6000), 1);
}

#[tokio::test(start_paused = true)]
async fn failed_cycle_keeps_last_known_values() {
    let transport = seeded();
    let (coordinator, _rx) = coordinator("casa_r4", &transport);
    coordinator.poll().await.unwrap();

    transport.set_input(6200, &[50, 150, 150, 250]);
    transport.set_input(6300, &[1, 1, 10, 10]);
    transport.fail_at(6200);
    let error = coordinator.poll().await.unwrap_err();
    assert!(error.is_transport());

    assert_eq!(coordinator.get_value("Supply_Temp1"), Some(Value::Float(10.0)));
    assert_eq!(coordinator.get_value("Supply_Fan"), Some(Value::Integer(45)));
    assert_eq!(coordinator.get_value("Efficiency"), Some(Value::Float(50.0)));

    transport.recover(6200);
    coordinator.poll().await.unwrap();
    assert_eq!(coordinator.get_value("Supply_Temp1"), Some(Value::Float(15.0)));
    assert_eq!(coordinator.get_value("Supply_Fan"), Some(Value::Integer(10)));
}

#[tokio::test(start_paused = true)]
async fn metadata_is_pushed_once_after_a_full_cycle() {
    let transport = seeded();
    let (coordinator, mut rx) = coordinator("casa_r4", &transport);

    transport.fail_at(6200);
    assert!(coordinator.poll().await.is_err());
    assert!(!coordinator.is_metadata_synced().await);
    assert!(rx.try_recv().is_err());

    transport.recover(6200);
    coordinator.poll().await.unwrap();
    assert!(coordinator.is_metadata_synced().await);
    let metadata = rx.try_recv().unwrap();
    assert_eq!(
        metadata,
        DeviceMetadata {
            manufacturer: "Swegon",
            model: "CASA R4".to_owned(),
            serial_number: "SW42".to_owned(),
            firmware: "2.14.3".to_owned(),
        }
    );
    assert_eq!(coordinator.metadata().await, Some(metadata));

    coordinator.poll().await.unwrap();
    assert!(rx.try_recv().is_err());
    assert_eq!(transport.calls_at(6000), 1);
}

#[tokio::test(start_paused = true)]
async fn slow_cycle_times_out() {
    let transport = seeded();
    let (coordinator, mut rx) = coordinator("casa_r4", &transport);
    transport.set_delay(Duration::from_secs(30));

    let error = coordinator.poll().await.unwrap_err();
    assert!(matches!(error, Error::Timeout(timeout) if timeout == Duration::from_secs(20)));
    assert_eq!(coordinator.get_value("FW_Maj"), None);
    assert!(!coordinator.is_metadata_synced().await);
    assert!(rx.try_recv().is_err());
    assert_eq!(transport.disconnects(), 1);

    assert!(!coordinator.write_value("Temp_SP", 22.0).await);
    assert_eq!(coordinator.get_value("Temp_SP"), None);
    assert_eq!(transport.disconnects(), 2);

    transport.set_delay(Duration::ZERO);
    coordinator.poll().await.unwrap();
    assert_eq!(coordinator.get_value("FW_Maj"), Some(Value::Integer(2)));
    assert_eq!(transport.disconnects(), 2);
}

#[tokio::test(start_paused = true)]
async fn unknown_profile_is_inert() {
    let transport = seeded();
    let (coordinator, _rx) = coordinator("casa_r99", &transport);

    coordinator.poll().await.unwrap();
    for group in Group::ALL {
        if let Some(registers) = DeviceProfile::resolve("casa_r4").group(group) {
            for field in registers.fields() {
                assert_eq!(coordinator.get_value(field.key), None);
            }
        }
    }
    assert!(!coordinator.write_value("Temp_SP", 21.0).await);
    assert!(!coordinator.is_metadata_synced().await);
    assert!(transport.calls().is_empty());
}

#[tokio::test(start_paused = true)]
async fn writes_are_visible_immediately() {
    let transport = seeded();
    let (coordinator, _rx) = coordinator("casa_r4", &transport);
    coordinator.poll().await.unwrap();
    let mut snapshots = coordinator.subscribe();
    let _ = snapshots.borrow_and_update();

    assert!(coordinator.write_value("Temp_SP", 22.5).await);
    assert_eq!(coordinator.get_value("Temp_SP"), Some(Value::Float(22.5)));
    assert_eq!(transport.holding(5100), Some(225));
    assert!(snapshots.has_changed().unwrap());

    assert!(!coordinator.write_value("Fresh_Temp", 10.0).await);
    assert!(!coordinator.write_value("No_Such_Field", 1.0).await);

    transport.fail_at(5000);
    assert!(!coordinator.write_value("Op_Mode", 3.0).await);
    assert_eq!(coordinator.get_value("Op_Mode"), Some(Value::Integer(2)));
}

#[tokio::test(start_paused = true)]
async fn run_polls_until_shutdown() {
    let transport = seeded();
    let (coordinator, _rx) = coordinator("casa_r4", &transport);
    let coordinator = Arc::new(coordinator);
    let mut snapshots = coordinator.subscribe();
    let (trigger, shutdown) = shutdown::channel();

    let handle = tokio::spawn({
        let coordinator = coordinator.clone();
        async move { coordinator.run(shutdown).await }
    });

    snapshots.changed().await.unwrap();
    snapshots.changed().await.unwrap();
    assert!(transport.calls_at(6200) >= 2);

    trigger.fire();
    handle.await.unwrap();
    assert!(coordinator.get_value("Temp_SP").is_some());
}
