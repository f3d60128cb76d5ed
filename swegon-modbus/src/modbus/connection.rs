use crate::modbus::{self, transport::Transport};
use crate::Error;
use async_trait::async_trait;
use serde::Deserialize;
use tokio_modbus::client::Context as ModbusClient;
use tokio_modbus::prelude::{Reader, Writer};
use tracing::{debug, error, info, warn};

/// Where and how to reach the unit's Modbus interface.
#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    #[serde(flatten)]
    pub settings: ModbusProto,

    #[serde(alias = "slave", default = "default_unit", with = "Unit")]
    pub unit: modbus::Unit,

    /// Added to every register address before it goes on the wire, for gateways which number registers from 1.
    #[serde(default)]
    pub address_offset: i8,
}

#[derive(Deserialize)]
#[serde(remote = "tokio_modbus::slave::Slave")]
struct Unit(modbus::UnitId);

#[derive(Clone, Debug, Deserialize)]
#[serde(tag = "proto", rename_all = "lowercase")]
pub enum ModbusProto {
    #[cfg(feature = "tcp")]
    Tcp {
        host: String,

        #[serde(default = "default_modbus_port")]
        port: u16,
    },
    #[cfg(feature = "rtu")]
    #[serde(rename_all = "lowercase")]
    Rtu {
        tty: String,
        baud_rate: u32,

        #[serde(default = "default_modbus_data_bits")]
        data_bits: tokio_serial::DataBits,

        #[serde(default = "default_modbus_stop_bits")]
        stop_bits: tokio_serial::StopBits,

        #[serde(default = "default_modbus_flow_control")]
        flow_control: tokio_serial::FlowControl,

        #[serde(default = "default_modbus_parity")]
        parity: tokio_serial::Parity,
    },

    // Predominantly for if the binary is compiled with no default features for some reason.
    #[serde(other)]
    Unknown,
}

impl ModbusProto {
    pub async fn connect(&self, unit: modbus::Unit) -> crate::Result<ModbusClient> {
        let client = match *self {
            #[cfg(feature = "tcp")]
            ModbusProto::Tcp { ref host, port } => {
                let socket_addr = tokio::net::lookup_host((host.as_str(), port))
                    .await?
                    .next()
                    .ok_or_else(|| {
                        std::io::Error::new(
                            std::io::ErrorKind::NotFound,
                            format!("{host} did not resolve to any address"),
                        )
                    })?;
                debug!(%host, %socket_addr, "Resolved");
                tokio_modbus::client::tcp::connect_slave(socket_addr, unit).await?
            }

            #[cfg(feature = "rtu")]
            ModbusProto::Rtu {
                ref tty,
                baud_rate,
                data_bits,
                stop_bits,
                flow_control,
                parity,
            } => {
                let builder = tokio_serial::new(tty, baud_rate)
                    .data_bits(data_bits)
                    .flow_control(flow_control)
                    .parity(parity)
                    .stop_bits(stop_bits);
                let port = tokio_serial::SerialStream::open(&builder)?;
                tokio_modbus::client::rtu::connect_slave(port, unit).await?
            }

            ModbusProto::Unknown => {
                error!("Unrecognised protocol");
                Err(Error::UnrecognisedModbusProtocol)?
            }
        };
        Ok(client)
    }
}

/// [`Transport`] over a `tokio-modbus` client context.
///
/// The context is dialled lazily by [`Transport::connect`]. Any I/O failure drops it, so the next `connect` dials
/// again instead of reusing a broken socket.
pub struct ModbusTransport {
    config: Config,
    client: Option<ModbusClient>,
}

impl std::fmt::Debug for ModbusTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModbusTransport")
            .field("config", &self.config)
            .field("connected", &self.client.is_some())
            .finish()
    }
}

impl ModbusTransport {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            client: None,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.client.is_some()
    }

    fn address(&self, address: u16) -> crate::Result<u16> {
        let offset = self.config.address_offset;
        let adjusted = if offset >= 0 {
            address.checked_add(offset as u16)
        } else {
            address.checked_sub(offset.unsigned_abs() as u16)
        };
        adjusted.ok_or_else(|| format!("Address {address} out of range with offset {offset}").into())
    }

    fn client(&mut self) -> crate::Result<&mut ModbusClient> {
        self.client.as_mut().ok_or(Error::NotConnected)
    }

    fn settle<T>(&mut self, result: std::io::Result<T>) -> crate::Result<T> {
        result.map_err(|error| {
            warn!(?error, "Dropping Modbus connection after I/O failure");
            self.client = None;
            error.into()
        })
    }
}

#[async_trait]
impl Transport for ModbusTransport {
    async fn connect(&mut self) -> crate::Result<()> {
        if self.client.is_none() {
            info!(settings = ?self.config.settings, unit = self.config.unit.0, "Connecting");
            self.client = Some(self.config.settings.connect(self.config.unit).await?);
        }
        Ok(())
    }

    async fn disconnect(&mut self) {
        if self.client.take().is_some() {
            info!(settings = ?self.config.settings, "Dropped Modbus connection");
        }
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn read_input_registers(&mut self, address: u16, count: u16) -> crate::Result<Vec<u16>> {
        let address = self.address(address)?;
        let result = self.client()?.read_input_registers(address, count).await;
        let words = self.settle(result)?;
        debug!(?words, "Received input registers");
        Ok(words)
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn read_holding_registers(
        &mut self,
        address: u16,
        count: u16,
    ) -> crate::Result<Vec<u16>> {
        let address = self.address(address)?;
        let result = self.client()?.read_holding_registers(address, count).await;
        let words = self.settle(result)?;
        debug!(?words, "Received holding registers");
        Ok(words)
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn write_register(&mut self, address: u16, value: u16) -> crate::Result<()> {
        let address = self.address(address)?;
        let result = self.client()?.write_single_register(address, value).await;
        self.settle(result)
    }
}

pub(crate) fn default_unit() -> modbus::Unit {
    tokio_modbus::slave::Slave(1)
}

pub(crate) fn default_modbus_port() -> u16 {
    502
}

#[cfg(feature = "rtu")]
pub(crate) fn default_modbus_data_bits() -> tokio_serial::DataBits {
    tokio_serial::DataBits::Eight
}

#[cfg(feature = "rtu")]
pub(crate) fn default_modbus_stop_bits() -> tokio_serial::StopBits {
    tokio_serial::StopBits::One
}

#[cfg(feature = "rtu")]
pub(crate) fn default_modbus_flow_control() -> tokio_serial::FlowControl {
    tokio_serial::FlowControl::None
}

#[cfg(feature = "rtu")]
pub(crate) fn default_modbus_parity() -> tokio_serial::Parity {
    tokio_serial::Parity::None
}

#[cfg(feature = "tcp")]
#[test]
fn parse_minimal_tcp_connect_config() {
    use serde_json::json;
    let result = serde_json::from_value::<Config>(json!({
        "proto": "tcp",
        "host": "192.168.1.40"
    }));

    let connect = result.unwrap();
    assert!(matches!(
        connect.settings,
        ModbusProto::Tcp {
            ref host,
            port: 502
        } if host == "192.168.1.40"
    ));
    assert_eq!(connect.unit.0, 1);
    assert_eq!(connect.address_offset, 0);
}

#[cfg(feature = "tcp")]
#[test]
fn parse_tcp_connect_config_with_slave_alias() {
    use serde_json::json;
    let connect = serde_json::from_value::<Config>(json!({
        "proto": "tcp",
        "host": "casa.local",
        "port": 5020,
        "slave": 3,
        "address_offset": -1,
    }))
    .unwrap();

    assert!(matches!(connect.settings, ModbusProto::Tcp { port: 5020, .. }));
    assert_eq!(connect.unit.0, 3);
    assert_eq!(connect.address_offset, -1);
}

#[cfg(feature = "rtu")]
#[test]
fn parse_minimal_rtu_connect_config() {
    use serde_json::json;
    let result = serde_json::from_value::<Config>(json!({
        "proto": "rtu",
        "tty": "/dev/ttyUSB0",
        "baud_rate": 19200,
    }));

    let connect = result.unwrap();
    use tokio_serial::*;
    assert!(matches!(
        connect.settings,
        ModbusProto::Rtu {
            ref tty,
            baud_rate: 19200,
            data_bits: DataBits::Eight,
            stop_bits: StopBits::One,
            flow_control: FlowControl::None,
            parity: Parity::None,
        } if tty == "/dev/ttyUSB0"
    ))
}

#[cfg(feature = "tcp")]
#[tokio::test]
async fn io_requires_connection() {
    use serde_json::json;
    let config = serde_json::from_value::<Config>(json!({
        "proto": "tcp",
        "host": "127.0.0.1",
    }))
    .unwrap();
    let mut transport = ModbusTransport::new(config);
    assert!(!transport.is_connected());
    assert!(matches!(
        transport.read_input_registers(6200, 21).await,
        Err(Error::NotConnected)
    ));
}

#[cfg(feature = "tcp")]
#[tokio::test]
async fn hostnames_are_resolved_before_dialling() {
    use serde_json::json;
    let config = serde_json::from_value::<Config>(json!({
        "proto": "tcp",
        "host": "localhost",
        "port": 1,
    }))
    .unwrap();
    let mut transport = ModbusTransport::new(config);

    let error = transport.connect().await.unwrap_err();
    assert!(matches!(error, Error::IOError(_)), "{error:?}");
    assert!(error.is_transport());
    assert!(!transport.is_connected());

    transport.disconnect().await;
    assert!(!transport.is_connected());
}

#[cfg(feature = "tcp")]
#[test]
fn negative_offset_cannot_underflow() {
    use serde_json::json;
    let config = serde_json::from_value::<Config>(json!({
        "proto": "tcp",
        "host": "127.0.0.1",
        "address_offset": -1,
    }))
    .unwrap();
    let transport = ModbusTransport::new(config);
    assert_eq!(transport.address(5000).unwrap(), 4999);
    assert!(transport.address(0).is_err());
}
