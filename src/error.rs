use thiserror::Error;

/// Errors from the LabJack digital I/O layer.
#[derive(Error, Debug)]
pub enum LabJackError {
    #[error("Connection to {identifier} failed: {details}")]
    ConnectionFailed { identifier: String, details: String },

    #[error("Communication with {identifier} timed out after {timeout_secs}s")]
    Timeout { identifier: String, timeout_secs: u64 },

    #[error("LabJack is not connected")]
    NotConnected,

    #[error("Invalid LabJack channel name: {name}")]
    InvalidChannel { name: String },

    #[error("Write to {name} failed: {details}")]
    WriteFailed { name: String, details: String },

    #[error("Read of {name} failed: {details}")]
    ReadFailed { name: String, details: String },

    #[error("Modbus exception for function {function:#04x}: code {code:#04x}")]
    ModbusException { function: u8, code: u8 },

    #[error("Value {value} does not fit in register {name}")]
    ValueOutOfRange { name: String, value: u32 },
}

/// Errors reported back to the originator of a CSC command.
#[derive(Error, Debug)]
pub enum CommandError {
    #[error("Command {command} not allowed in state {state}")]
    NotAllowed { command: String, state: String },

    #[error("Reflector controller is not connected")]
    NotConnected,

    #[error("Reflector is in unknown state (CIO_STATE = {cio_state})")]
    UnknownCioState { cio_state: u32 },

    #[error("LabJack error: {0}")]
    LabJack(#[from] LabJackError),

    #[error("Command channel closed")]
    ChannelClosed,
}

#[derive(Error, Debug)]
pub enum MtReflectorError {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("LabJack error: {0}")]
    LabJack(#[from] LabJackError),

    #[error("Command error: {0}")]
    Command(#[from] CommandError),

    #[error("System error: {message}")]
    System { message: String },
}

impl MtReflectorError {
    pub fn system<S: Into<String>>(message: S) -> Self {
        Self::System {
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, MtReflectorError>;
