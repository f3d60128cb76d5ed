//! Bridge between Swegon CASA ventilation units and a poll-based key/value device model.
//!
//! The [`profile`] module describes where each field lives on the device, [`client::DeviceClient`] reads and writes
//! those fields over a [`modbus::transport::Transport`], and [`coordinator::Coordinator`] polls the client on a
//! schedule and serves the last known values to consumers.

pub mod client;
pub mod config;
pub mod coordinator;
pub mod modbus;
pub mod profile;
pub mod shutdown;

mod error;
pub use error::Error;

pub type Result<T> = std::result::Result<T, Error>;
