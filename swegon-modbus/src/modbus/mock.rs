//! In-memory register banks standing in for a unit during tests.

use std::collections::{HashMap, HashSet};
use std::io::{Error as IoError, ErrorKind};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;

use super::transport::Transport;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Call {
    ReadInput(u16, u16),
    ReadHolding(u16, u16),
    Write(u16, u16),
}

impl Call {
    fn address(&self) -> u16 {
        match *self {
            Call::ReadInput(address, _) | Call::ReadHolding(address, _) | Call::Write(address, _) => {
                address
            }
        }
    }
}

#[derive(Default)]
pub(crate) struct Banks {
    input: HashMap<u16, u16>,
    holding: HashMap<u16, u16>,
    failing: HashSet<u16>,
    truncated: HashSet<u16>,
    calls: Vec<Call>,
    connects: usize,
    disconnects: usize,
    delay: Duration,
}

/// Cloning shares the banks, so a test keeps a handle after moving the transport into a client.
#[derive(Clone, Default)]
pub(crate) struct MockTransport {
    banks: Arc<Mutex<Banks>>,
}

impl MockTransport {
    fn banks(&self) -> MutexGuard<'_, Banks> {
        self.banks.lock().unwrap()
    }

    pub fn set_input(&self, address: u16, words: &[u16]) {
        let mut banks = self.banks();
        for (address, word) in (address..).zip(words) {
            banks.input.insert(address, *word);
        }
    }

    pub fn set_holding(&self, address: u16, words: &[u16]) {
        let mut banks = self.banks();
        for (address, word) in (address..).zip(words) {
            banks.holding.insert(address, *word);
        }
    }

    pub fn holding(&self, address: u16) -> Option<u16> {
        self.banks().holding.get(&address).copied()
    }

    /// Any call starting at `address` fails with an I/O error until [`MockTransport::recover`].
    pub fn fail_at(&self, address: u16) {
        self.banks().failing.insert(address);
    }

    pub fn recover(&self, address: u16) {
        self.banks().failing.remove(&address);
    }

    /// Reads starting at `address` answer with one register fewer than requested.
    pub fn truncate_at(&self, address: u16) {
        self.banks().truncated.insert(address);
    }

    /// Every request waits `delay` before it is answered.
    pub fn set_delay(&self, delay: Duration) {
        self.banks().delay = delay;
    }

    async fn stall(&self) {
        let delay = self.banks().delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }

    pub fn calls(&self) -> Vec<Call> {
        self.banks().calls.clone()
    }

    pub fn calls_at(&self, address: u16) -> usize {
        self.banks()
            .calls
            .iter()
            .filter(|call| call.address() == address)
            .count()
    }

    pub fn connects(&self) -> usize {
        self.banks().connects
    }

    pub fn disconnects(&self) -> usize {
        self.banks().disconnects
    }

    fn read(&self, call: Call, address: u16, count: u16) -> crate::Result<Vec<u16>> {
        let mut banks = self.banks();
        banks.calls.push(call);
        if banks.failing.contains(&address) {
            return Err(IoError::new(ErrorKind::TimedOut, "no response").into());
        }
        let bank = match call {
            Call::ReadInput(..) => &banks.input,
            _ => &banks.holding,
        };
        let mut words: Vec<u16> = (address..address + count)
            .map(|address| bank.get(&address).copied().unwrap_or_default())
            .collect();
        if banks.truncated.contains(&address) {
            words.pop();
        }
        Ok(words)
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn connect(&mut self) -> crate::Result<()> {
        self.banks().connects += 1;
        Ok(())
    }

    async fn disconnect(&mut self) {
        self.banks().disconnects += 1;
    }

    async fn read_input_registers(&mut self, address: u16, count: u16) -> crate::Result<Vec<u16>> {
        self.stall().await;
        self.read(Call::ReadInput(address, count), address, count)
    }

    async fn read_holding_registers(
        &mut self,
        address: u16,
        count: u16,
    ) -> crate::Result<Vec<u16>> {
        self.stall().await;
        self.read(Call::ReadHolding(address, count), address, count)
    }

    async fn write_register(&mut self, address: u16, value: u16) -> crate::Result<()> {
        self.stall().await;
        let mut banks = self.banks();
        banks.calls.push(Call::Write(address, value));
        if banks.failing.contains(&address) {
            return Err(IoError::new(ErrorKind::ConnectionReset, "connection reset").into());
        }
        banks.holding.insert(address, value);
        Ok(())
    }
}
