use crate::config::MtReflectorConfig;
use crate::csc::{command_channel, CommandRequest, ReflectorCsc, ReflectorRemote};
use crate::error::{MtReflectorError, Result};
use crate::events::EventBus;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Reason the daemon is shutting down
#[derive(Debug, Clone)]
pub enum ShutdownReason {
    Signal(String),
    ExitControl,
    Error(String),
}

/// Wires the CSC, command channel and event bus together and runs the
/// process lifecycle with signal handling.
pub struct ReflectorOrchestrator {
    config: MtReflectorConfig,
    simulate: bool,
    event_bus: EventBus,
    remote: ReflectorRemote,
    commands: Option<mpsc::Receiver<CommandRequest>>,
    cancellation_token: CancellationToken,
}

impl ReflectorOrchestrator {
    /// Create a new orchestrator with the given configuration
    pub fn new(config: MtReflectorConfig, simulate: bool) -> Self {
        let event_bus = EventBus::new(config.system.event_bus_capacity);
        let (remote, commands) = command_channel(config.system.command_channel_capacity);

        Self {
            config,
            simulate,
            event_bus,
            remote,
            commands: Some(commands),
            cancellation_token: CancellationToken::new(),
        }
    }

    /// Event bus carrying the CSC event stream
    pub fn event_bus(&self) -> EventBus {
        self.event_bus.clone()
    }

    /// Handle for sending commands to the CSC
    pub fn remote(&self) -> ReflectorRemote {
        self.remote.clone()
    }

    /// Run the CSC until a shutdown signal arrives or it exits control
    pub async fn run(&mut self) -> Result<i32> {
        let commands = self
            .commands
            .take()
            .ok_or_else(|| MtReflectorError::system("Orchestrator already running"))?;

        let csc = ReflectorCsc::new(self.config.clone(), self.simulate, self.event_bus.clone())?;
        let mut csc_task = tokio::spawn(csc.run(commands, self.cancellation_token.clone()));

        let (shutdown_sender, shutdown_receiver) = oneshot::channel();
        self.setup_signal_handlers(shutdown_sender).await;

        let exit_code = tokio::select! {
            reason = shutdown_receiver => {
                match reason {
                    Ok(reason) => {
                        info!("Shutdown initiated: {:?}", reason);
                        self.cancellation_token.cancel();
                        match timeout(Duration::from_secs(10), &mut csc_task).await {
                            Ok(Ok(Ok(()))) => 0,
                            Ok(Ok(Err(e))) => {
                                error!("CSC error during shutdown: {}", e);
                                1
                            }
                            Ok(Err(e)) => {
                                error!("CSC task failed: {}", e);
                                1
                            }
                            Err(_) => {
                                error!("CSC did not stop within 10s");
                                1
                            }
                        }
                    }
                    Err(_) => {
                        error!("Shutdown channel closed unexpectedly");
                        1
                    }
                }
            }
            result = &mut csc_task => {
                match result {
                    Ok(Ok(())) => {
                        info!("CSC exited control");
                        0
                    }
                    Ok(Err(e)) => {
                        error!("CSC error: {}", e);
                        1
                    }
                    Err(e) => {
                        error!("CSC task failed: {}", e);
                        1
                    }
                }
            }
        };

        info!("MTReflector shutdown complete with exit code: {}", exit_code);
        Ok(exit_code)
    }

    /// Set up signal handlers for graceful shutdown
    async fn setup_signal_handlers(&self, shutdown_sender: oneshot::Sender<ShutdownReason>) {
        let shutdown_sender = Arc::new(Mutex::new(Some(shutdown_sender)));

        // Handle SIGTERM (systemd stop) - Unix only
        #[cfg(unix)]
        {
            let shutdown_sender_sigterm = Arc::clone(&shutdown_sender);
            tokio::spawn(async move {
                if let Some(()) = signal::unix::signal(signal::unix::SignalKind::terminate())
                    .expect("Failed to register SIGTERM handler")
                    .recv()
                    .await
                {
                    info!("Received SIGTERM signal");
                    if let Some(sender) = shutdown_sender_sigterm.lock().await.take() {
                        let _ = sender.send(ShutdownReason::Signal("SIGTERM".to_string()));
                    }
                }
            });
        }

        // Handle SIGINT (Ctrl+C) - Cross-platform
        let shutdown_sender_sigint = Arc::clone(&shutdown_sender);
        tokio::spawn(async move {
            if let Ok(()) = tokio::signal::ctrl_c().await {
                info!("Received SIGINT signal (Ctrl+C)");
                if let Some(sender) = shutdown_sender_sigint.lock().await.take() {
                    let _ = sender.send(ShutdownReason::Signal("SIGINT".to_string()));
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::csc::CscCommand;
    use crate::events::ReflectorEvent;
    use crate::status::ReflectorStatus;

    #[tokio::test]
    async fn test_run_exits_cleanly_on_exit_control() {
        let mut orchestrator = ReflectorOrchestrator::new(MtReflectorConfig::default(), true);
        let remote = orchestrator.remote();

        let driver = tokio::spawn(async move {
            remote.send(CscCommand::ExitControl).await.unwrap();
        });

        let exit_code = orchestrator.run().await.unwrap();
        assert_eq!(exit_code, 0);
        driver.await.unwrap();
    }

    #[tokio::test]
    async fn test_run_drives_full_command_sequence() {
        let mut orchestrator = ReflectorOrchestrator::new(MtReflectorConfig::default(), true);
        let remote = orchestrator.remote();
        let mut events = orchestrator.event_bus().subscribe();

        let driver = tokio::spawn(async move {
            remote.send(CscCommand::Start).await.unwrap();
            remote.send(CscCommand::Enable).await.unwrap();
            remote.send(CscCommand::Open).await.unwrap();
            remote.send(CscCommand::Disable).await.unwrap();
            remote.send(CscCommand::Standby).await.unwrap();
            remote.send(CscCommand::ExitControl).await.unwrap();
        });

        let exit_code = orchestrator.run().await.unwrap();
        assert_eq!(exit_code, 0);
        driver.await.unwrap();

        let mut statuses = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let ReflectorEvent::ReflectorStatusChanged { status, .. } = event {
                statuses.push(status);
            }
        }
        assert!(statuses.contains(&ReflectorStatus::Connected));
        assert!(statuses.contains(&ReflectorStatus::Open));
    }

    #[tokio::test]
    async fn test_run_twice_fails() {
        let mut orchestrator = ReflectorOrchestrator::new(MtReflectorConfig::default(), true);
        let remote = orchestrator.remote();

        let driver = tokio::spawn(async move {
            remote.send(CscCommand::ExitControl).await.unwrap();
        });
        orchestrator.run().await.unwrap();
        driver.await.unwrap();

        assert!(orchestrator.run().await.is_err());
    }
}
