//! Runtime Builder API
//!
//! Provides a builder-style API for consumers (CLI, tests) to hand over a
//! radio adapter and get command and app-event handles back.

use std::sync::Arc;
use std::time::Duration;

use blechat_core::{orchestrator::Environment, SessionConfig};
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
};
use tracing::{info, warn};

use crate::channel::{AppEvent, ChatCommand, Snapshot};
use crate::error::{Result, RuntimeError};
use crate::radio::RadioAdapter;
use crate::supervisor::{ChatSettings, SupervisorTask};

// ----------------------------------------------------------------------------
// Runtime Builder
// ----------------------------------------------------------------------------

pub struct RuntimeBuilder {
    adapter: Arc<dyn RadioAdapter>,
    config: SessionConfig,
    settings: ChatSettings,
    environment: Environment,
}

impl RuntimeBuilder {
    pub fn new(adapter: impl RadioAdapter) -> Self {
        Self::from_shared(Arc::new(adapter))
    }

    pub fn from_shared(adapter: Arc<dyn RadioAdapter>) -> Self {
        Self {
            adapter,
            config: SessionConfig::default(),
            settings: ChatSettings::default(),
            environment: Environment::ready(),
        }
    }

    /// Set the session timings and limits
    pub fn with_session_config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_chat_settings(mut self, settings: ChatSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Radio, location and permission state at startup
    pub fn with_environment(mut self, environment: Environment) -> Self {
        self.environment = environment;
        self
    }

    /// Build and start the runtime
    pub async fn build_and_start(self) -> Result<RuntimeHandle> {
        info!("Building blechat runtime");
        self.config.validate()?;

        let capabilities = self.adapter.capabilities().await?;
        let (command_sender, command_receiver) = mpsc::unbounded_channel();
        let (app_event_sender, app_event_receiver) = mpsc::unbounded_channel();

        let mut supervisor = SupervisorTask::new(
            self.adapter,
            self.config,
            self.settings,
            command_receiver,
            app_event_sender,
        );
        supervisor.start(capabilities, self.environment).await?;

        let supervisor_handle = tokio::spawn(supervisor.run());
        info!("blechat runtime started");

        Ok(RuntimeHandle {
            command_sender,
            app_event_receiver: Some(app_event_receiver),
            supervisor_handle: Some(supervisor_handle),
        })
    }
}

// ----------------------------------------------------------------------------
// Runtime Handle
// ----------------------------------------------------------------------------

/// Handle to a running blechat runtime
pub struct RuntimeHandle {
    command_sender: mpsc::UnboundedSender<ChatCommand>,
    app_event_receiver: Option<mpsc::UnboundedReceiver<AppEvent>>,
    supervisor_handle: Option<JoinHandle<Result<()>>>,
}

impl RuntimeHandle {
    pub fn command_sender(&self) -> mpsc::UnboundedSender<ChatCommand> {
        self.command_sender.clone()
    }

    /// Take the app event receiver (can only be called once)
    pub fn take_app_event_receiver(&mut self) -> Option<mpsc::UnboundedReceiver<AppEvent>> {
        self.app_event_receiver.take()
    }

    pub fn send_command(&self, command: ChatCommand) -> Result<()> {
        self.command_sender
            .send(command)
            .map_err(|_| RuntimeError::ChannelClosed("runtime commands"))
    }

    /// Ask the supervisor for its current view
    pub async fn snapshot(&self) -> Result<Snapshot> {
        let (reply, rx) = oneshot::channel();
        self.send_command(ChatCommand::Snapshot(reply))?;
        rx.await
            .map_err(|_| RuntimeError::ChannelClosed("runtime snapshot"))
    }

    pub fn is_running(&self) -> bool {
        self.supervisor_handle
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Wait for the runtime to complete
    pub async fn wait(&mut self) -> Result<()> {
        match self.supervisor_handle.take() {
            Some(handle) => handle.await?,
            None => Ok(()),
        }
    }

    /// Shutdown the runtime gracefully
    pub async fn shutdown(&mut self) -> Result<()> {
        info!("Shutting down blechat runtime");
        let _ = self.send_command(ChatCommand::Shutdown);

        if let Some(handle) = self.supervisor_handle.take() {
            match tokio::time::timeout(Duration::from_secs(10), handle).await {
                Ok(joined) => joined??,
                Err(_) => warn!("Supervisor did not stop in time"),
            }
        }
        info!("blechat runtime shut down");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedRadio;
    use blechat_core::{orchestrator::Capabilities, ConnectionBindingState, ServiceKind};

    #[tokio::test(start_paused = true)]
    async fn test_runtime_builder() {
        let mut runtime = RuntimeBuilder::new(ScriptedRadio::cooperative())
            .build_and_start()
            .await
            .expect("Failed to build runtime");
        assert!(runtime.is_running());

        let snapshot = runtime.snapshot().await.expect("snapshot");
        assert!(snapshot
            .bindings
            .contains(&(ServiceKind::Advertiser, ConnectionBindingState::Connected)));
        assert!(snapshot
            .bindings
            .contains(&(ServiceKind::GattClient, ConnectionBindingState::NotConnected)));

        runtime.shutdown().await.expect("Failed to shutdown");
        assert!(!runtime.is_running());
    }

    #[tokio::test]
    async fn test_missing_capability_refuses_to_start() {
        let capabilities = Capabilities {
            le_2m_phy: false,
            ..Capabilities::full(31)
        };
        let radio = ScriptedRadio::cooperative().with_capabilities(capabilities);
        let result = RuntimeBuilder::new(radio).build_and_start().await;
        assert!(matches!(
            result,
            Err(RuntimeError::Orchestrator(
                blechat_core::OrchestratorError::Unsupported { capability: "LE 2M PHY" }
            ))
        ));
    }

    #[tokio::test]
    async fn test_app_event_receiver_taken_once() {
        let mut runtime = RuntimeBuilder::new(ScriptedRadio::new())
            .build_and_start()
            .await
            .expect("Failed to build runtime");
        assert!(runtime.take_app_event_receiver().is_some());
        assert!(runtime.take_app_event_receiver().is_none());
        runtime.shutdown().await.expect("Failed to shutdown");
    }

    #[tokio::test]
    async fn test_invalid_config_is_rejected() {
        let config = SessionConfig::default().with_connection_timeout(Duration::ZERO);
        let result = RuntimeBuilder::new(ScriptedRadio::new())
            .with_session_config(config)
            .build_and_start()
            .await;
        assert!(matches!(result, Err(RuntimeError::Config(_))));
    }
}
