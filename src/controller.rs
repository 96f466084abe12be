use crate::config::LabJackConfig;
use crate::error::{CommandError, LabJackError};
use crate::labjack::{DigitalIo, ModbusLabJack, SimulatedLabJack};
use crate::status::ReflectorStatus;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, info};

/// CIO_STATE values reported by the reflector wiring
const CIO_STATE_OPEN: u32 = 13;
const CIO_STATE_CLOSED: u32 = 14;

/// Actuator commands accepted by the reflector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActuatorCommand {
    Open,
    Close,
}

impl fmt::Display for ActuatorCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActuatorCommand::Open => write!(f, "open"),
            ActuatorCommand::Close => write!(f, "close"),
        }
    }
}

/// Drives the reflector actuator through a digital I/O backend.
///
/// The controller owns the device handle. Connection lifecycle is driven by
/// the summary-state handler only; the command handler uses the existing
/// connection and never opens or closes it.
pub struct ReflectorController {
    io: Box<dyn DigitalIo>,
    open_channel: String,
    close_channel: String,
    state: ReflectorStatus,
}

impl ReflectorController {
    /// Create a controller with the backend selected by `simulate`
    pub fn new(config: &LabJackConfig, simulate: bool) -> Self {
        let io: Box<dyn DigitalIo> = if simulate {
            info!("Reflector controller running in simulation mode");
            Box::new(SimulatedLabJack::new())
        } else {
            Box::new(ModbusLabJack::new(
                config.identifier.clone(),
                config.port,
                config.communication_timeout(),
            ))
        };
        Self::with_io(io, config)
    }

    /// Create a controller with an explicit backend
    pub fn with_io(io: Box<dyn DigitalIo>, config: &LabJackConfig) -> Self {
        Self {
            io,
            open_channel: config.open_channel.clone(),
            close_channel: config.close_channel.clone(),
            state: ReflectorStatus::Unknown,
        }
    }

    /// Is the device handle open?
    pub fn connected(&self) -> bool {
        self.io.connected()
    }

    /// Last verified actuation outcome
    pub fn state(&self) -> ReflectorStatus {
        self.state
    }

    /// Open the device and prepare the digital lines for actuation.
    ///
    /// All DIO lines are left digital and uninhibited, as the actuation
    /// channels must accept writes immediately afterwards.
    pub async fn connect(&mut self) -> Result<(), LabJackError> {
        self.io.connect().await?;
        self.io.write_name("DIO_INHIBIT", 0x00000).await?;
        self.io.write_name("DIO_ANALOG_ENABLE", 0x00000).await?;
        Ok(())
    }

    /// Release the device. Idempotent.
    pub async fn disconnect(&mut self) {
        self.io.disconnect().await;
    }

    /// Actuate the reflector and verify the resulting CIO state.
    ///
    /// Open deasserts the close channel before asserting the open channel;
    /// close does the reverse. The two lines are never asserted together.
    pub async fn actuate(
        &mut self,
        command: ActuatorCommand,
    ) -> Result<ReflectorStatus, CommandError> {
        if !self.io.connected() {
            return Err(CommandError::NotConnected);
        }

        let begin_cio_state = self.io.read_name("CIO_STATE").await?;
        debug!("CIO state before {}: {}", command, begin_cio_state);

        match command {
            ActuatorCommand::Open => {
                self.io.write_name(&self.close_channel, 0).await?;
                self.io.write_name(&self.open_channel, 1).await?;
            }
            ActuatorCommand::Close => {
                self.io.write_name(&self.close_channel, 1).await?;
                self.io.write_name(&self.open_channel, 0).await?;
            }
        }

        let end_cio_state = self.io.read_name("CIO_STATE").await?;
        debug!("CIO state after {}: {}", command, end_cio_state);

        match end_cio_state {
            CIO_STATE_OPEN => {
                self.state = ReflectorStatus::Open;
                Ok(ReflectorStatus::Open)
            }
            CIO_STATE_CLOSED => {
                self.state = ReflectorStatus::Closed;
                Ok(ReflectorStatus::Closed)
            }
            other => Err(CommandError::UnknownCioState { cio_state: other }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MtReflectorConfig;

    fn simulated_controller() -> (ReflectorController, SimulatedLabJack) {
        let config = MtReflectorConfig::default();
        let labjack = SimulatedLabJack::new();
        let controller =
            ReflectorController::with_io(Box::new(labjack.clone()), &config.labjack);
        (controller, labjack)
    }

    #[tokio::test]
    async fn test_connect_prepares_dio_lines() {
        let (mut controller, labjack) = simulated_controller();
        controller.connect().await.unwrap();

        assert!(controller.connected());
        assert_eq!(labjack.register("DIO_INHIBIT"), Some(0));
        assert_eq!(labjack.register("DIO_ANALOG_ENABLE"), Some(0));
    }

    #[tokio::test]
    async fn test_open_asserts_only_open_channel() {
        let (mut controller, labjack) = simulated_controller();
        controller.connect().await.unwrap();

        let status = controller.actuate(ActuatorCommand::Open).await.unwrap();
        assert_eq!(status, ReflectorStatus::Open);
        assert_eq!(controller.state(), ReflectorStatus::Open);
        assert_eq!(labjack.register("CIO0"), Some(1));
        assert_eq!(labjack.register("CIO1"), Some(0));
    }

    #[tokio::test]
    async fn test_close_asserts_only_close_channel() {
        let (mut controller, labjack) = simulated_controller();
        controller.connect().await.unwrap();

        let status = controller.actuate(ActuatorCommand::Close).await.unwrap();
        assert_eq!(status, ReflectorStatus::Closed);
        assert_eq!(labjack.register("CIO0"), Some(0));
        assert_eq!(labjack.register("CIO1"), Some(1));
    }

    #[tokio::test]
    async fn test_actuate_requires_connection() {
        let (mut controller, labjack) = simulated_controller();

        let result = controller.actuate(ActuatorCommand::Open).await;
        assert!(matches!(result, Err(CommandError::NotConnected)));
        // No channel writes happened
        assert_eq!(labjack.register("CIO0"), None);
        assert_eq!(labjack.register("CIO1"), None);
    }

    #[tokio::test]
    async fn test_actuate_surfaces_write_failures() {
        let (mut controller, labjack) = simulated_controller();
        controller.connect().await.unwrap();
        labjack.set_write_failure(true);

        let result = controller.actuate(ActuatorCommand::Open).await;
        assert!(matches!(
            result,
            Err(CommandError::LabJack(LabJackError::WriteFailed { .. }))
        ));
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent() {
        let (mut controller, _labjack) = simulated_controller();
        controller.connect().await.unwrap();

        controller.disconnect().await;
        assert!(!controller.connected());
        controller.disconnect().await;
        assert!(!controller.connected());
    }
}
