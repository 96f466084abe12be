pub mod config;
pub mod controller;
pub mod csc;
pub mod error;
pub mod events;
pub mod labjack;
pub mod orchestration;
pub mod status;

pub use config::{CscConfig, LabJackConfig, MtReflectorConfig, SystemConfig};
pub use controller::{ActuatorCommand, ReflectorController};
pub use csc::{command_channel, CscCommand, ReflectorCsc, ReflectorRemote, SummaryState};
pub use error::{CommandError, LabJackError, MtReflectorError, Result};
pub use events::{EventBus, ReflectorEvent};
pub use labjack::{
    DigitalIo, LabJackChannel, ModbusLabJack, RegisterWidth, SimulatedLabJack,
    DEFAULT_MODBUS_PORT,
};
pub use orchestration::{ReflectorOrchestrator, ShutdownReason};
pub use status::{ReflectorStatus, StatusReporter};
