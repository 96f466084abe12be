use crate::error::LabJackError;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info};

/// Default Modbus TCP port of T-series devices
pub const DEFAULT_MODBUS_PORT: u16 = 502;

/// Unit identifier used for all Modbus transactions
const MODBUS_UNIT_ID: u8 = 1;

/// Register width in the device register map
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterWidth {
    /// One 16-bit holding register
    Single,
    /// Two consecutive 16-bit holding registers, most significant word first
    Double,
}

/// Modbus function codes used by the T-series register map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum ModbusFunction {
    ReadHoldingRegisters = 0x03,
    WriteSingleRegister = 0x06,
    WriteMultipleRegisters = 0x10,
}

impl ModbusFunction {
    fn code(self) -> u8 {
        self as u8
    }
}

/// Whole-port registers addressed by name rather than channel index.
const NAMED_REGISTERS: &[(&str, u16, RegisterWidth)] = &[
    ("FIO_STATE", 2500, RegisterWidth::Single),
    ("EIO_STATE", 2501, RegisterWidth::Single),
    ("CIO_STATE", 2502, RegisterWidth::Single),
    ("MIO_STATE", 2503, RegisterWidth::Single),
    ("DIO_STATE", 2800, RegisterWidth::Double),
    ("DIO_DIRECTION", 2850, RegisterWidth::Double),
    ("DIO_ANALOG_ENABLE", 2880, RegisterWidth::Double),
    ("DIO_INHIBIT", 2900, RegisterWidth::Double),
];

/// Modbus address offset for each channel block
fn block_offset(prefix: &str) -> Option<u16> {
    match prefix {
        "AIN" => Some(0),
        "DAC" => Some(1000),
        "DIO" | "FIO" => Some(2000),
        "EIO" => Some(2008),
        "CIO" => Some(2016),
        "MIO" => Some(2020),
        _ => None,
    }
}

/// A named LabJack channel resolved to its Modbus address
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabJackChannel {
    pub name: String,
    pub address: u16,
    pub width: RegisterWidth,
}

impl LabJackChannel {
    /// Resolve a channel name (e.g. `CIO0`, `AIN2`, `DIO_INHIBIT`) to its
    /// Modbus address and register width.
    pub fn parse(name: &str) -> Result<Self, LabJackError> {
        for (register, address, width) in NAMED_REGISTERS {
            if name == *register {
                return Ok(Self {
                    name: name.to_string(),
                    address: *address,
                    width: *width,
                });
            }
        }

        let digits = name.find(|c: char| c.is_ascii_digit()).unwrap_or(name.len());
        let (prefix, index) = name.split_at(digits);

        let offset = block_offset(prefix).ok_or_else(|| LabJackError::InvalidChannel {
            name: name.to_string(),
        })?;
        let index: u16 = index.parse().map_err(|_| LabJackError::InvalidChannel {
            name: name.to_string(),
        })?;

        // AIN and DAC values are 32-bit wide, so each channel occupies two
        // consecutive addresses.
        let (address, width) = match prefix {
            "AIN" | "DAC" => (offset + index * 2, RegisterWidth::Double),
            _ => (offset + index, RegisterWidth::Single),
        };

        Ok(Self {
            name: name.to_string(),
            address,
            width,
        })
    }
}

/// Surface of the digital I/O device as used by the reflector controller.
///
/// `ModbusLabJack` talks to real hardware; `SimulatedLabJack` backs
/// simulation mode and tests.
#[async_trait]
pub trait DigitalIo: Send + Sync {
    /// Open the device. Fails if the device is unreachable.
    async fn connect(&mut self) -> Result<(), LabJackError>;

    /// Release the device. Idempotent.
    async fn disconnect(&mut self);

    /// Is the device handle open?
    fn connected(&self) -> bool;

    /// Read a named channel or register
    async fn read_name(&mut self, name: &str) -> Result<u32, LabJackError>;

    /// Write a named channel or register
    async fn write_name(&mut self, name: &str, value: u32) -> Result<(), LabJackError>;
}

/// LabJack T-series access over its native Modbus TCP server.
///
/// Every operation is bounded by the configured communication timeout. No
/// retries: failures surface to the caller.
pub struct ModbusLabJack {
    identifier: String,
    port: u16,
    comm_timeout: Duration,
    stream: Option<TcpStream>,
    transaction_id: u16,
}

impl ModbusLabJack {
    pub fn new(identifier: impl Into<String>, port: u16, comm_timeout: Duration) -> Self {
        Self {
            identifier: identifier.into(),
            port,
            comm_timeout,
            stream: None,
            transaction_id: 0,
        }
    }

    fn timeout_error(&self) -> LabJackError {
        LabJackError::Timeout {
            identifier: self.identifier.clone(),
            timeout_secs: self.comm_timeout.as_secs(),
        }
    }

    /// Send one request PDU and return the response PDU.
    async fn transact(&mut self, pdu: &[u8]) -> Result<Vec<u8>, LabJackError> {
        self.transaction_id = self.transaction_id.wrapping_add(1);
        let transaction_id = self.transaction_id;
        let comm_timeout = self.comm_timeout;
        let identifier = self.identifier.clone();
        let timeout_secs = comm_timeout.as_secs();

        let stream = self.stream.as_mut().ok_or(LabJackError::NotConnected)?;

        // MBAP header: transaction id, protocol id 0, length, unit id
        let mut frame = Vec::with_capacity(7 + pdu.len());
        frame.extend_from_slice(&transaction_id.to_be_bytes());
        frame.extend_from_slice(&0u16.to_be_bytes());
        frame.extend_from_slice(&(pdu.len() as u16 + 1).to_be_bytes());
        frame.push(MODBUS_UNIT_ID);
        frame.extend_from_slice(pdu);

        timeout(comm_timeout, stream.write_all(&frame))
            .await
            .map_err(|_| LabJackError::Timeout {
                identifier: identifier.clone(),
                timeout_secs,
            })?
            .map_err(|e| LabJackError::ConnectionFailed {
                identifier: identifier.clone(),
                details: e.to_string(),
            })?;

        let mut header = [0u8; 7];
        timeout(comm_timeout, stream.read_exact(&mut header))
            .await
            .map_err(|_| LabJackError::Timeout {
                identifier: identifier.clone(),
                timeout_secs,
            })?
            .map_err(|e| LabJackError::ConnectionFailed {
                identifier: identifier.clone(),
                details: e.to_string(),
            })?;

        let length = u16::from_be_bytes([header[4], header[5]]) as usize;
        if length < 2 {
            return Err(LabJackError::ConnectionFailed {
                identifier,
                details: format!("short Modbus response (length {})", length),
            });
        }

        let mut body = vec![0u8; length - 1];
        timeout(comm_timeout, stream.read_exact(&mut body))
            .await
            .map_err(|_| LabJackError::Timeout {
                identifier: identifier.clone(),
                timeout_secs,
            })?
            .map_err(|e| LabJackError::ConnectionFailed {
                identifier,
                details: e.to_string(),
            })?;

        if body[0] & 0x80 != 0 {
            return Err(LabJackError::ModbusException {
                function: body[0] & 0x7F,
                code: if body.len() > 1 { body[1] } else { 0 },
            });
        }

        Ok(body)
    }

    async fn read_registers(
        &mut self,
        address: u16,
        count: u16,
    ) -> Result<Vec<u16>, LabJackError> {
        let pdu = [
            ModbusFunction::ReadHoldingRegisters.code(),
            (address >> 8) as u8,
            (address & 0xFF) as u8,
            (count >> 8) as u8,
            (count & 0xFF) as u8,
        ];
        let body = self.transact(&pdu).await?;

        // Response: function code, byte count, data
        if body.len() < 2 + count as usize * 2 {
            return Err(LabJackError::ConnectionFailed {
                identifier: self.identifier.clone(),
                details: "truncated register read response".to_string(),
            });
        }

        let mut values = Vec::with_capacity(count as usize);
        for i in 0..count as usize {
            let high = body[2 + i * 2] as u16;
            let low = body[2 + i * 2 + 1] as u16;
            values.push((high << 8) | low);
        }
        Ok(values)
    }

    async fn write_single_register(
        &mut self,
        address: u16,
        value: u16,
    ) -> Result<(), LabJackError> {
        let pdu = [
            ModbusFunction::WriteSingleRegister.code(),
            (address >> 8) as u8,
            (address & 0xFF) as u8,
            (value >> 8) as u8,
            (value & 0xFF) as u8,
        ];
        self.transact(&pdu).await?;
        Ok(())
    }

    async fn write_registers(
        &mut self,
        address: u16,
        values: &[u16],
    ) -> Result<(), LabJackError> {
        let count = values.len() as u16;
        let mut pdu = Vec::with_capacity(6 + values.len() * 2);
        pdu.push(ModbusFunction::WriteMultipleRegisters.code());
        pdu.extend_from_slice(&address.to_be_bytes());
        pdu.extend_from_slice(&count.to_be_bytes());
        pdu.push((values.len() * 2) as u8);
        for value in values {
            pdu.extend_from_slice(&value.to_be_bytes());
        }
        self.transact(&pdu).await?;
        Ok(())
    }
}

#[async_trait]
impl DigitalIo for ModbusLabJack {
    async fn connect(&mut self) -> Result<(), LabJackError> {
        if self.stream.is_some() {
            debug!("LabJack {} already connected", self.identifier);
            return Ok(());
        }

        let addr = format!("{}:{}", self.identifier, self.port);
        info!("Connecting to LabJack at {}", addr);

        let stream = timeout(self.comm_timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| self.timeout_error())?
            .map_err(|e| LabJackError::ConnectionFailed {
                identifier: self.identifier.clone(),
                details: e.to_string(),
            })?;

        self.stream = Some(stream);
        info!("Connected to LabJack at {}", addr);
        Ok(())
    }

    async fn disconnect(&mut self) {
        if self.stream.take().is_some() {
            info!("Disconnected from LabJack at {}", self.identifier);
        }
    }

    fn connected(&self) -> bool {
        self.stream.is_some()
    }

    async fn read_name(&mut self, name: &str) -> Result<u32, LabJackError> {
        let channel = LabJackChannel::parse(name)?;
        match channel.width {
            RegisterWidth::Single => {
                let registers = self.read_registers(channel.address, 1).await?;
                Ok(registers[0] as u32)
            }
            RegisterWidth::Double => {
                let registers = self.read_registers(channel.address, 2).await?;
                Ok(((registers[0] as u32) << 16) | registers[1] as u32)
            }
        }
    }

    async fn write_name(&mut self, name: &str, value: u32) -> Result<(), LabJackError> {
        let channel = LabJackChannel::parse(name)?;
        debug!("Writing {} = {}", name, value);
        match channel.width {
            RegisterWidth::Single => {
                if value > u16::MAX as u32 {
                    return Err(LabJackError::ValueOutOfRange {
                        name: name.to_string(),
                        value,
                    });
                }
                self.write_single_register(channel.address, value as u16).await
            }
            RegisterWidth::Double => {
                self.write_registers(channel.address, &[(value >> 16) as u16, value as u16])
                    .await
            }
        }
    }
}

/// In-memory LabJack backend for simulation mode and tests.
///
/// Behaves like the demo device: unwritten digital lines read high, and
/// `CIO_STATE` mirrors the CIO0..CIO3 bits. Clones share state, so a test
/// can keep a handle for assertions after boxing one into the controller.
#[derive(Debug, Clone, Default)]
pub struct SimulatedLabJack {
    inner: Arc<Mutex<SimState>>,
}

#[derive(Debug, Default)]
struct SimState {
    connected: bool,
    registers: HashMap<String, u32>,
    fail_connect: bool,
    fail_writes: bool,
}

impl SimulatedLabJack {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next connect attempts fail
    pub fn with_connect_failure(self) -> Self {
        self.inner.lock().fail_connect = true;
        self
    }

    /// Make channel writes fail until cleared
    pub fn set_write_failure(&self, fail: bool) {
        self.inner.lock().fail_writes = fail;
    }

    /// Value last written to a register, if any
    pub fn register(&self, name: &str) -> Option<u32> {
        self.inner.lock().registers.get(name).copied()
    }

    fn cio_state(state: &SimState) -> u32 {
        (0..4)
            .map(|bit| {
                let line = state
                    .registers
                    .get(&format!("CIO{}", bit))
                    .copied()
                    .unwrap_or(1);
                (line & 1) << bit
            })
            .sum()
    }
}

#[async_trait]
impl DigitalIo for SimulatedLabJack {
    async fn connect(&mut self) -> Result<(), LabJackError> {
        let mut state = self.inner.lock();
        if state.fail_connect {
            return Err(LabJackError::ConnectionFailed {
                identifier: "simulated".to_string(),
                details: "simulated connection failure".to_string(),
            });
        }
        state.connected = true;
        debug!("Simulated LabJack connected");
        Ok(())
    }

    async fn disconnect(&mut self) {
        self.inner.lock().connected = false;
        debug!("Simulated LabJack disconnected");
    }

    fn connected(&self) -> bool {
        self.inner.lock().connected
    }

    async fn read_name(&mut self, name: &str) -> Result<u32, LabJackError> {
        LabJackChannel::parse(name)?;
        let state = self.inner.lock();
        if !state.connected {
            return Err(LabJackError::NotConnected);
        }
        if name == "CIO_STATE" {
            return Ok(Self::cio_state(&state));
        }
        Ok(state.registers.get(name).copied().unwrap_or(0))
    }

    async fn write_name(&mut self, name: &str, value: u32) -> Result<(), LabJackError> {
        LabJackChannel::parse(name)?;
        let mut state = self.inner.lock();
        if !state.connected {
            return Err(LabJackError::NotConnected);
        }
        if state.fail_writes {
            return Err(LabJackError::WriteFailed {
                name: name.to_string(),
                details: "simulated write failure".to_string(),
            });
        }
        state.registers.insert(name.to_string(), value);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_addresses() {
        assert_eq!(LabJackChannel::parse("CIO0").unwrap().address, 2016);
        assert_eq!(LabJackChannel::parse("CIO1").unwrap().address, 2017);
        assert_eq!(LabJackChannel::parse("FIO0").unwrap().address, 2000);
        assert_eq!(LabJackChannel::parse("EIO3").unwrap().address, 2011);
        assert_eq!(LabJackChannel::parse("MIO2").unwrap().address, 2022);
        assert_eq!(LabJackChannel::parse("CIO_STATE").unwrap().address, 2502);
    }

    #[test]
    fn test_analog_channels_are_double_width() {
        let ain2 = LabJackChannel::parse("AIN2").unwrap();
        assert_eq!(ain2.address, 4);
        assert_eq!(ain2.width, RegisterWidth::Double);

        let dac1 = LabJackChannel::parse("DAC1").unwrap();
        assert_eq!(dac1.address, 1002);
        assert_eq!(dac1.width, RegisterWidth::Double);
    }

    #[test]
    fn test_invalid_channel_names() {
        assert!(LabJackChannel::parse("XYZ0").is_err());
        assert!(LabJackChannel::parse("CIO").is_err());
        assert!(LabJackChannel::parse("CIOx").is_err());
        assert!(LabJackChannel::parse("").is_err());
    }

    #[tokio::test]
    async fn test_simulated_requires_connection() {
        let mut labjack = SimulatedLabJack::new();
        assert!(!labjack.connected());
        assert!(matches!(
            labjack.write_name("CIO0", 1).await,
            Err(LabJackError::NotConnected)
        ));
        assert!(matches!(
            labjack.read_name("CIO0").await,
            Err(LabJackError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_simulated_read_write() {
        let mut labjack = SimulatedLabJack::new();
        labjack.connect().await.unwrap();
        assert!(labjack.connected());

        labjack.write_name("CIO0", 1).await.unwrap();
        assert_eq!(labjack.read_name("CIO0").await.unwrap(), 1);
        assert_eq!(labjack.register("CIO0"), Some(1));

        labjack.disconnect().await;
        assert!(!labjack.connected());
    }

    #[tokio::test]
    async fn test_simulated_cio_state_tracks_lines() {
        let mut labjack = SimulatedLabJack::new();
        labjack.connect().await.unwrap();

        // Unwritten lines float high
        assert_eq!(labjack.read_name("CIO_STATE").await.unwrap(), 0b1111);

        labjack.write_name("CIO0", 1).await.unwrap();
        labjack.write_name("CIO1", 0).await.unwrap();
        assert_eq!(labjack.read_name("CIO_STATE").await.unwrap(), 13);

        labjack.write_name("CIO0", 0).await.unwrap();
        labjack.write_name("CIO1", 1).await.unwrap();
        assert_eq!(labjack.read_name("CIO_STATE").await.unwrap(), 14);
    }

    #[tokio::test]
    async fn test_simulated_failure_injection() {
        let mut failing = SimulatedLabJack::new().with_connect_failure();
        assert!(failing.connect().await.is_err());
        assert!(!failing.connected());

        let mut labjack = SimulatedLabJack::new();
        labjack.connect().await.unwrap();
        labjack.set_write_failure(true);
        assert!(matches!(
            labjack.write_name("CIO0", 1).await,
            Err(LabJackError::WriteFailed { .. })
        ));
        labjack.set_write_failure(false);
        assert!(labjack.write_name("CIO0", 1).await.is_ok());
    }

    #[tokio::test]
    async fn test_simulated_rejects_invalid_channels() {
        let mut labjack = SimulatedLabJack::new();
        labjack.connect().await.unwrap();
        assert!(matches!(
            labjack.write_name("BOGUS0", 1).await,
            Err(LabJackError::InvalidChannel { .. })
        ));
    }

    #[tokio::test]
    async fn test_modbus_backend_not_connected() {
        let mut labjack =
            ModbusLabJack::new("127.0.0.1", DEFAULT_MODBUS_PORT, Duration::from_secs(1));
        assert!(!labjack.connected());
        assert!(matches!(
            labjack.read_name("CIO_STATE").await,
            Err(LabJackError::NotConnected)
        ));
    }
}
