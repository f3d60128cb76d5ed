use async_trait::async_trait;

/// The register-level operations the device client needs from a Modbus connection.
///
/// Implementations may block on network I/O and may fail; they never retry. Retrying is left to whoever schedules
/// the next call.
#[async_trait]
pub trait Transport: Send {
    /// Establishes the connection if there is none yet. Calling it on a connected transport does nothing.
    async fn connect(&mut self) -> crate::Result<()>;

    /// Drops the connection, if any, so the next [`Transport::connect`] starts afresh.
    ///
    /// Called when a request was abandoned part way, after which the connection may still deliver its late reply.
    async fn disconnect(&mut self);

    async fn read_input_registers(&mut self, address: u16, count: u16) -> crate::Result<Vec<u16>>;

    async fn read_holding_registers(&mut self, address: u16, count: u16)
        -> crate::Result<Vec<u16>>;

    async fn write_register(&mut self, address: u16, value: u16) -> crate::Result<()>;
}

