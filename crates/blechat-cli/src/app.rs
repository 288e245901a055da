//! The chat application: a runtime plus the terminal loop around it

use std::io::Write;
use std::time::Duration;

use blechat_ble::BleRadio;
use blechat_core::DiscoveredPeer;
use blechat_runtime::{AppEvent, ChatCommand, RuntimeBuilder, RuntimeHandle};
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::commands::{self, ChatInput, HELP};
use crate::config::AppConfig;
use crate::display;
use crate::error::{CliError, Result};

pub struct ChatApp {
    runtime: RuntimeHandle,
    events: mpsc::UnboundedReceiver<AppEvent>,
}

impl ChatApp {
    pub fn new(mut runtime: RuntimeHandle) -> Result<Self> {
        let events = runtime
            .take_app_event_receiver()
            .ok_or_else(|| CliError::Config("app events already taken".to_string()))?;
        Ok(Self { runtime, events })
    }

    /// Open the configured adapter and start the runtime on it
    pub async fn launch(config: &AppConfig) -> Result<Self> {
        let radio = BleRadio::new(config.ble.clone()).await?;
        let environment = radio.environment().await;
        if !environment.all_met() {
            warn!("Bluetooth is off; sessions start once it is back");
        }

        let runtime = RuntimeBuilder::new(radio)
            .with_session_config(config.session.clone())
            .with_chat_settings(config.chat.settings())
            .with_environment(environment)
            .build_and_start()
            .await?;
        Self::new(runtime)
    }

    /// Read commands from `input` and print events to `out` until `/quit`,
    /// end of input, Ctrl+C, or the runtime stopping
    pub async fn run_chat<R, W>(mut self, input: R, out: &mut W) -> Result<()>
    where
        R: AsyncBufRead + Unpin,
        W: Write,
    {
        writeln!(out, "blechat ready, /help for commands")?;
        let mut lines = input.lines();
        loop {
            tokio::select! {
                line = lines.next_line() => {
                    let Some(line) = line? else {
                        debug!("Input closed");
                        break;
                    };
                    if !self.handle_line(&line, out).await? {
                        break;
                    }
                }
                event = self.events.recv() => {
                    let Some(event) = event else { break };
                    if let Some(line) = display::render_event(&event) {
                        writeln!(out, "{}", line)?;
                    }
                    if event == AppEvent::Stopped {
                        break;
                    }
                }
                _ = tokio::signal::ctrl_c() => {
                    info!("Interrupted");
                    break;
                }
            }
            out.flush()?;
        }
        self.runtime.shutdown().await?;
        Ok(())
    }

    /// Act on one line of input; `false` once the user asked to leave
    pub async fn handle_line<W: Write>(&mut self, line: &str, out: &mut W) -> Result<bool> {
        let input = match commands::parse_line(line) {
            Ok(Some(input)) => input,
            Ok(None) => return Ok(true),
            Err(err) => {
                writeln!(out, "! {}", err)?;
                return Ok(true);
            }
        };

        let command = match input {
            ChatInput::Message(text) => ChatCommand::Send(text),
            ChatInput::Connect(index) => ChatCommand::SelectPeer(index),
            ChatInput::Scan(mode) => ChatCommand::StartScan(mode),
            ChatInput::StopScan => ChatCommand::StopScan,
            ChatInput::Filter(enabled) => {
                let enabled = match enabled {
                    Some(enabled) => enabled,
                    None => !self.runtime.snapshot().await?.rssi_filter,
                };
                writeln!(out, "* signal filter {}", if enabled { "on" } else { "off" })?;
                ChatCommand::SetRssiFilter(enabled)
            }
            ChatInput::Reset => ChatCommand::ResetPeers,
            ChatInput::Advertise(data) => ChatCommand::UpdateAdvertisement(data.into_bytes()),
            ChatInput::Disconnect => ChatCommand::Disconnect,
            ChatInput::Peers => {
                let snapshot = self.runtime.snapshot().await?;
                write!(out, "{}", display::peers(&snapshot.peers))?;
                return Ok(true);
            }
            ChatInput::Status => {
                let snapshot = self.runtime.snapshot().await?;
                write!(out, "{}", display::status(&snapshot))?;
                return Ok(true);
            }
            ChatInput::Log => {
                let snapshot = self.runtime.snapshot().await?;
                write!(out, "{}", display::log(&snapshot.messages))?;
                return Ok(true);
            }
            ChatInput::Help => {
                writeln!(out, "{}", HELP)?;
                return Ok(true);
            }
            ChatInput::Quit => return Ok(false),
        };
        self.runtime.send_command(command)?;
        Ok(true)
    }

    /// Wait for one scan to finish, or `limit` to pass, then stop the
    /// runtime and return what was found
    pub async fn scan_once(mut self, limit: Duration) -> Result<Vec<DiscoveredPeer>> {
        let deadline = tokio::time::sleep(limit);
        tokio::pin!(deadline);
        let mut started = false;
        loop {
            tokio::select! {
                event = self.events.recv() => match event {
                    Some(AppEvent::ScanStatus(true)) => started = true,
                    Some(AppEvent::ScanStatus(false)) if started => break,
                    Some(AppEvent::PeerDiscovered { index, peer }) => {
                        debug!("Found [{}] {}", index, peer);
                    }
                    Some(AppEvent::Stopped) | None => break,
                    Some(_) => {}
                },
                _ = &mut deadline => {
                    warn!("Scan did not finish in {:?}", limit);
                    break;
                }
            }
        }
        let peers = self.runtime.snapshot().await?.peers;
        self.runtime.shutdown().await?;
        Ok(peers)
    }
}
