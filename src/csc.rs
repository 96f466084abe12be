use crate::config::MtReflectorConfig;
use crate::controller::{ActuatorCommand, ReflectorController};
use crate::error::{CommandError, LabJackError, Result};
use crate::events::{EventBus, ReflectorEvent};
use crate::labjack::{DigitalIo, ModbusLabJack, SimulatedLabJack};
use crate::status::{ReflectorStatus, StatusReporter};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Error codes carried by fault reports on the event stream
pub mod fault_code {
    /// Connecting to the LabJack failed
    pub const CONNECTION_FAILED: i64 = 2;
    /// The open command failed
    pub const OPEN_FAILED: i64 = 3;
    /// The close command failed
    pub const CLOSE_FAILED: i64 = 4;
    /// The controller should be connected but is not
    pub const CONNECTION_LOST: i64 = 5;
}

/// CSC lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SummaryState {
    Offline,
    Standby,
    Disabled,
    Enabled,
    Fault,
}

impl SummaryState {
    /// True when the state permits hardware operation
    pub fn is_operational(self) -> bool {
        matches!(self, SummaryState::Disabled | SummaryState::Enabled)
    }
}

impl fmt::Display for SummaryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SummaryState::Offline => "Offline",
            SummaryState::Standby => "Standby",
            SummaryState::Disabled => "Disabled",
            SummaryState::Enabled => "Enabled",
            SummaryState::Fault => "Fault",
        };
        write!(f, "{}", name)
    }
}

impl FromStr for SummaryState {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "offline" => Ok(SummaryState::Offline),
            "standby" => Ok(SummaryState::Standby),
            "disabled" => Ok(SummaryState::Disabled),
            "enabled" => Ok(SummaryState::Enabled),
            "fault" => Ok(SummaryState::Fault),
            other => Err(format!("Unknown summary state: {}", other)),
        }
    }
}

/// Commands accepted over the command channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CscCommand {
    /// Standby to Disabled
    Start,
    /// Disabled to Enabled
    Enable,
    /// Enabled to Disabled
    Disable,
    /// Disabled or Fault to Standby
    Standby,
    /// Standby to Offline, ending the process
    ExitControl,
    /// Open the reflector (Enabled only)
    Open,
    /// Close the reflector (Enabled only)
    Close,
}

impl fmt::Display for CscCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CscCommand::Start => "start",
            CscCommand::Enable => "enable",
            CscCommand::Disable => "disable",
            CscCommand::Standby => "standby",
            CscCommand::ExitControl => "exitControl",
            CscCommand::Open => "open",
            CscCommand::Close => "close",
        };
        write!(f, "{}", name)
    }
}

/// A command plus the ack channel for its completion or failure
pub struct CommandRequest {
    pub command: CscCommand,
    pub ack: oneshot::Sender<std::result::Result<(), CommandError>>,
}

/// Client handle for sending commands to a running CSC.
///
/// Each send resolves when the CSC has finished (or rejected) the command.
#[derive(Clone)]
pub struct ReflectorRemote {
    sender: mpsc::Sender<CommandRequest>,
}

impl ReflectorRemote {
    /// Send a command and wait for its completion ack
    pub async fn send(&self, command: CscCommand) -> std::result::Result<(), CommandError> {
        let (ack, response) = oneshot::channel();
        self.sender
            .send(CommandRequest { command, ack })
            .await
            .map_err(|_| CommandError::ChannelClosed)?;
        response.await.map_err(|_| CommandError::ChannelClosed)?
    }
}

/// Create the command channel pair for a CSC
pub fn command_channel(capacity: usize) -> (ReflectorRemote, mpsc::Receiver<CommandRequest>) {
    let (sender, receiver) = mpsc::channel(capacity);
    (ReflectorRemote { sender }, receiver)
}

/// Factory building the digital I/O backend each time a connection is made
pub type IoFactory = Box<dyn Fn() -> Box<dyn DigitalIo> + Send + Sync>;

/// The MTReflector CSC.
///
/// Owns the summary-state machine and the reflector controller. Commands
/// arrive serialized over the command channel; events leave on the event
/// bus. Only the summary-state handler connects or disconnects the
/// hardware.
pub struct ReflectorCsc {
    config: MtReflectorConfig,
    io_factory: IoFactory,
    summary_state: SummaryState,
    controller: Option<ReflectorController>,
    should_be_connected: bool,
    event_bus: EventBus,
    status: StatusReporter,
}

impl ReflectorCsc {
    /// Create a CSC with the backend selected by `simulate`
    pub fn new(config: MtReflectorConfig, simulate: bool, event_bus: EventBus) -> Result<Self> {
        let io_factory: IoFactory = if simulate {
            Box::new(|| Box::new(SimulatedLabJack::new()) as Box<dyn DigitalIo>)
        } else {
            let labjack = config.labjack.clone();
            Box::new(move || {
                Box::new(ModbusLabJack::new(
                    labjack.identifier.clone(),
                    labjack.port,
                    labjack.communication_timeout(),
                )) as Box<dyn DigitalIo>
            })
        };
        Self::with_io_factory(config, event_bus, io_factory)
    }

    /// Create a CSC with an explicit backend factory
    pub fn with_io_factory(
        config: MtReflectorConfig,
        event_bus: EventBus,
        io_factory: IoFactory,
    ) -> Result<Self> {
        let summary_state = config.csc.initial_summary_state()?;
        Ok(Self {
            config,
            io_factory,
            summary_state,
            controller: None,
            should_be_connected: false,
            status: StatusReporter::new(event_bus.clone()),
            event_bus,
        })
    }

    pub fn summary_state(&self) -> SummaryState {
        self.summary_state
    }

    /// Is the reflector controller connected?
    pub fn connected(&self) -> bool {
        self.controller
            .as_ref()
            .map(|controller| controller.connected())
            .unwrap_or(false)
    }

    /// Announce the initial state and bring the hardware in line with it
    pub async fn start(&mut self) {
        info!("Starting MTReflector CSC in state {}", self.summary_state);
        self.status.report(ReflectorStatus::Unknown);
        self.publish_summary_state();
        self.handle_summary_state().await;
    }

    /// Handle one command, returning its completion or failure
    pub async fn handle_command(
        &mut self,
        command: CscCommand,
    ) -> std::result::Result<(), CommandError> {
        match command {
            CscCommand::Start => {
                self.transition(command, &[SummaryState::Standby], SummaryState::Disabled)
                    .await
            }
            CscCommand::Enable => {
                self.transition(command, &[SummaryState::Disabled], SummaryState::Enabled)
                    .await
            }
            CscCommand::Disable => {
                self.transition(command, &[SummaryState::Enabled], SummaryState::Disabled)
                    .await
            }
            CscCommand::Standby => {
                self.transition(
                    command,
                    &[SummaryState::Disabled, SummaryState::Fault],
                    SummaryState::Standby,
                )
                .await
            }
            CscCommand::ExitControl => {
                self.transition(command, &[SummaryState::Standby], SummaryState::Offline)
                    .await
            }
            CscCommand::Open => self.do_actuate(ActuatorCommand::Open).await,
            CscCommand::Close => self.do_actuate(ActuatorCommand::Close).await,
        }
    }

    /// Run the serialized command loop until cancellation or exitControl
    pub async fn run(
        mut self,
        mut commands: mpsc::Receiver<CommandRequest>,
        cancel: CancellationToken,
    ) -> Result<()> {
        self.start().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("CSC command loop cancelled");
                    break;
                }
                request = commands.recv() => {
                    match request {
                        Some(CommandRequest { command, ack }) => {
                            debug!("Handling command: {}", command);
                            let result = self.handle_command(command).await;
                            if let Err(e) = &result {
                                warn!("Command {} failed: {}", command, e);
                            }
                            let _ = ack.send(result);
                            if self.summary_state == SummaryState::Offline {
                                info!("CSC exited control");
                                break;
                            }
                        }
                        None => {
                            debug!("Command channel closed");
                            break;
                        }
                    }
                }
            }
        }

        self.disconnect().await;
        Ok(())
    }

    async fn transition(
        &mut self,
        command: CscCommand,
        allowed_from: &[SummaryState],
        target: SummaryState,
    ) -> std::result::Result<(), CommandError> {
        if !allowed_from.contains(&self.summary_state) {
            return Err(CommandError::NotAllowed {
                command: command.to_string(),
                state: self.summary_state.to_string(),
            });
        }

        info!("Summary state transition: {} -> {}", self.summary_state, target);
        self.summary_state = target;
        self.publish_summary_state();
        self.handle_summary_state().await;
        Ok(())
    }

    /// Bring the hardware connection in line with the summary state.
    ///
    /// Operational states require a connection; every other state tears it
    /// down. The status reported always reflects the actual outcome, not
    /// the requested state.
    async fn handle_summary_state(&mut self) {
        if self.summary_state.is_operational() {
            if self.should_be_connected && !self.connected() {
                self.fault(
                    fault_code::CONNECTION_LOST,
                    "Reflector controller should be connected but is not",
                )
                .await;
                return;
            }
            if !self.connected() {
                if let Err(e) = self.connect().await {
                    self.status.report(ReflectorStatus::Unknown);
                    self.fault(
                        fault_code::CONNECTION_FAILED,
                        format!("Failed to connect: {}", e),
                    )
                    .await;
                }
            }
        } else {
            if self.controller.is_none() {
                self.status.report(ReflectorStatus::Unknown);
            }
            self.disconnect().await;
        }
    }

    /// Build a controller and connect it, bounded by the communication
    /// timeout
    async fn connect(&mut self) -> std::result::Result<(), LabJackError> {
        let mut controller =
            ReflectorController::with_io((self.io_factory)(), &self.config.labjack);
        let comm_timeout = self.config.labjack.communication_timeout();

        match timeout(comm_timeout, controller.connect()).await {
            Ok(Ok(())) => {
                self.controller = Some(controller);
                self.should_be_connected = true;
                self.status.report(ReflectorStatus::Connected);
                Ok(())
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(LabJackError::Timeout {
                identifier: self.config.labjack.identifier.clone(),
                timeout_secs: comm_timeout.as_secs(),
            }),
        }
    }

    /// Disconnect and drop the controller. Idempotent.
    async fn disconnect(&mut self) {
        if let Some(mut controller) = self.controller.take() {
            controller.disconnect().await;
        }
        self.should_be_connected = false;
        self.status.report(ReflectorStatus::Disconnected);
    }

    async fn do_actuate(
        &mut self,
        command: ActuatorCommand,
    ) -> std::result::Result<(), CommandError> {
        self.assert_enabled(command)?;
        let controller = self
            .controller
            .as_mut()
            .ok_or(CommandError::NotConnected)?;

        match controller.actuate(command).await {
            Ok(outcome) => {
                self.status.report(outcome);
                Ok(())
            }
            Err(e) => {
                let code = match command {
                    ActuatorCommand::Open => fault_code::OPEN_FAILED,
                    ActuatorCommand::Close => fault_code::CLOSE_FAILED,
                };
                self.fault(code, format!("Command {} failed: {}", command, e))
                    .await;
                Err(e)
            }
        }
    }

    fn assert_enabled(&self, command: ActuatorCommand) -> std::result::Result<(), CommandError> {
        if self.summary_state == SummaryState::Enabled {
            Ok(())
        } else {
            Err(CommandError::NotAllowed {
                command: command.to_string(),
                state: self.summary_state.to_string(),
            })
        }
    }

    /// Report an error, move to Fault and tear the connection down
    async fn fault(&mut self, code: i64, report: impl Into<String>) {
        let report = report.into();
        error!("CSC fault (code {}): {}", code, report);
        self.event_bus.publish(ReflectorEvent::ErrorReported {
            code,
            report,
            timestamp: Utc::now(),
        });

        if self.summary_state != SummaryState::Fault {
            self.summary_state = SummaryState::Fault;
            self.publish_summary_state();
        }

        // Fault is not operational: tear the connection down directly
        // rather than re-entering the summary-state handler.
        self.disconnect().await;
    }

    fn publish_summary_state(&self) {
        self.event_bus.publish(ReflectorEvent::SummaryStateChanged {
            state: self.summary_state,
            timestamp: Utc::now(),
        });
    }
}
