use crate::channel::{socket_path, MessageChannel};
use crate::config::ClientConfig;
use crate::protocol::{ClientMsg, ConnectionState, DaemonMsg, RecordingMode};
use crate::supervisor::DaemonSupervisor;

use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};

const EVENT_BUFFER: usize = 32;
const COMMAND_BUFFER: usize = 8;

/// Where recognized text goes: the currently focused UI target.
///
/// The controller captures the destination handed to `toggle_recording` and
/// delivers partial/final text to it only while it is still the focused one.
pub trait Destination: Send + Sync {
    /// Show `text` as a live, uncommitted preview.
    fn show_preview(&self, text: &str);

    /// Remove any shown preview.
    fn clear_preview(&self);

    /// Commit `text` permanently.
    fn commit(&self, text: &str);
}

enum SessionCommand {
    Toggle {
        destination: Arc<dyn Destination>,
        reply: oneshot::Sender<ConnectionState>,
    },
    Cancel,
    FocusChanged(Option<Arc<dyn Destination>>),
    Shutdown(oneshot::Sender<()>),
}

/// Cloneable handle for driving a running session controller.
#[derive(Clone)]
pub struct SessionHandle {
    cmd_tx: mpsc::Sender<SessionCommand>,
    state_rx: watch::Receiver<ConnectionState>,
}

impl SessionHandle {
    /// Start recording into `destination`, or stop if already recording.
    ///
    /// Returns the state after the transition has been applied, so a caller
    /// that toggles twice in a row observes `Idle` right away even before
    /// any daemon status arrives.
    pub async fn toggle_recording(
        &self,
        destination: Arc<dyn Destination>,
    ) -> Result<ConnectionState> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(SessionCommand::Toggle { destination, reply })
            .await
            .map_err(|_| anyhow::anyhow!("session controller is gone"))?;
        rx.await.context("session controller dropped the reply")
    }

    /// Discard the current recording session, if any.
    pub async fn cancel(&self) -> Result<()> {
        self.cmd_tx
            .send(SessionCommand::Cancel)
            .await
            .map_err(|_| anyhow::anyhow!("session controller is gone"))
    }

    /// Tell the controller which destination currently has focus.
    pub async fn focus_changed(&self, destination: Option<Arc<dyn Destination>>) -> Result<()> {
        self.cmd_tx
            .send(SessionCommand::FocusChanged(destination))
            .await
            .map_err(|_| anyhow::anyhow!("session controller is gone"))
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    /// Observable state; every transition is visible here.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    /// Stop the channel worker and the daemon, then retire the controller.
    ///
    /// Returns once everything has wound down; the supervisor's escalation
    /// window makes this block for up to about a second in the worst case.
    pub async fn shutdown(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(SessionCommand::Shutdown(reply))
            .await
            .map_err(|_| anyhow::anyhow!("session controller is gone"))?;
        rx.await.context("session controller dropped the reply")
    }
}

/// State machine tying the message channel and the daemon supervisor to one
/// focused destination.
///
/// Runs as a single task; every mutation of connection state or captured
/// destination happens here, events from the channel's receive loop are
/// handed over through the event channel rather than applied in place.
pub struct SessionController {
    state: ConnectionState,
    captured: Option<Arc<dyn Destination>>,
    focused: Option<Arc<dyn Destination>>,
    channel: MessageChannel,
    supervisor: DaemonSupervisor,
    cmd_rx: mpsc::Receiver<SessionCommand>,
    event_rx: mpsc::Receiver<DaemonMsg>,
    state_tx: watch::Sender<ConnectionState>,
}

impl SessionController {
    /// Ensure a daemon exists, start the channel, and spawn the controller.
    ///
    /// A daemon spawn failure is reported here once; everything after this
    /// point surfaces as status transitions instead of errors.
    pub fn spawn(config: ClientConfig) -> Result<SessionHandle> {
        config.validate()?;

        let mut supervisor = DaemonSupervisor::new();
        supervisor.start(&config)?;

        let (event_tx, event_rx) = mpsc::channel(EVENT_BUFFER);
        let path = config.socket_path.clone().unwrap_or_else(socket_path);
        let mut channel = MessageChannel::new(path, event_tx);
        channel.start();

        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_BUFFER);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Idle);

        let controller = SessionController {
            state: ConnectionState::Idle,
            captured: None,
            focused: None,
            channel,
            supervisor,
            cmd_rx,
            event_rx,
            state_tx,
        };
        tokio::spawn(controller.run());

        Ok(SessionHandle { cmd_tx, state_rx })
    }

    async fn run(mut self) {
        loop {
            tokio::select! {
                cmd = self.cmd_rx.recv() => match cmd {
                    Some(SessionCommand::Toggle { destination, reply }) => {
                        self.handle_toggle(destination).await;
                        let _ = reply.send(self.state);
                    }
                    Some(SessionCommand::Cancel) => self.handle_cancel().await,
                    Some(SessionCommand::FocusChanged(destination)) => {
                        self.focused = destination;
                    }
                    Some(SessionCommand::Shutdown(reply)) => {
                        self.shutdown().await;
                        let _ = reply.send(());
                        break;
                    }
                    // All handles gone; wind down as if shut down.
                    None => {
                        self.shutdown().await;
                        break;
                    }
                },
                Some(event) = self.event_rx.recv() => self.handle_event(event),
            }
        }
    }

    async fn handle_toggle(&mut self, destination: Arc<dyn Destination>) {
        // A session is in flight from the moment a destination was captured,
        // even if the daemon has not acknowledged Recording yet; a second
        // toggle in that window is a stop, not a second start.
        let session_active =
            self.captured.is_some() || self.state == ConnectionState::Recording;
        if session_active {
            tracing::info!("stopping recording");
            if let Err(err) = self.channel.send(&ClientMsg::Stop).await {
                tracing::debug!("stop not delivered: {err}");
            }
            // Optimistic: report Idle right away instead of waiting for the
            // daemon's confirmation; its status push remains authoritative.
            self.set_state(ConnectionState::Idle);
        } else {
            tracing::info!("starting recording");
            self.captured = Some(destination);
            if self.state != ConnectionState::Connected {
                self.set_state(ConnectionState::Connecting);
            }
            if let Err(err) = self
                .channel
                .send(&ClientMsg::Start {
                    mode: RecordingMode::Toggle,
                })
                .await
            {
                // Not fatal: the receive loop keeps reconnecting and the
                // daemon pushes an authoritative status once reachable.
                tracing::debug!("start not delivered: {err}");
            }
        }
    }

    async fn handle_cancel(&mut self) {
        if let Err(err) = self.channel.send(&ClientMsg::Cancel).await {
            tracing::debug!("cancel not delivered: {err}");
        }
        self.set_state(ConnectionState::Idle);
    }

    fn handle_event(&mut self, event: DaemonMsg) {
        match event {
            // Peer-pushed state always overrides a local optimistic guess.
            DaemonMsg::Status { state } => self.set_state(state),
            DaemonMsg::Partial { text } => {
                if let Some(dest) = self.deliverable() {
                    dest.show_preview(&text);
                }
            }
            DaemonMsg::Final { text } => {
                if let Some(dest) = self.deliverable() {
                    dest.commit(&text);
                    dest.clear_preview();
                }
            }
            DaemonMsg::Error { message } => {
                tracing::warn!("daemon error: {message}");
                self.set_state(ConnectionState::Idle);
            }
            DaemonMsg::Other => {}
        }
    }

    fn set_state(&mut self, state: ConnectionState) {
        self.state = state;
        if state == ConnectionState::Idle {
            // The session is over; whatever preview is still showing will
            // never be committed, so take it down with the destination.
            if let Some(dest) = self.captured.take() {
                dest.clear_preview();
            }
        }
        self.state_tx.send_replace(state);
    }

    /// The captured destination, but only while it is still the focused one.
    /// Anything else means the session's text must be dropped, not rerouted.
    fn deliverable(&self) -> Option<Arc<dyn Destination>> {
        let captured = self.captured.as_ref()?;
        let focused = self.focused.as_ref()?;
        Arc::ptr_eq(captured, focused).then(|| captured.clone())
    }

    async fn shutdown(&mut self) {
        // Join the channel worker before anything else is torn down.
        self.channel.stop().await;
        self.supervisor.stop().await;
        self.set_state(ConnectionState::Idle);
    }
}
