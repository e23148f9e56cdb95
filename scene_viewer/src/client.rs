//! Viewer implementation.
//!
//! The viewer maintains:
//! - One reliable stream to the server, split into halves
//! - A background reader task feeding an inbox channel
//! - A [`SceneMirror`] rebuilt from the snapshot and kept current by diffs
//! - A console for inspecting the mirror and poking widgets

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Context;
use scene_shared::{
    config::SceneConfig,
    mirror::SceneMirror,
    net::{FrameReader, FrameWriter, NetMsg, ReliableConn, ViewerInput, PROTOCOL_VERSION},
    session::SessionId,
};
use tokio::{sync::mpsc, task::JoinHandle, time::Instant};
use tracing::{debug, info, warn};

/// Viewer connection state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ViewerState {
    /// Handshake done, waiting for the first snapshot.
    Connected,
    /// Snapshot applied; following diffs.
    Synced,
    /// The server closed the session or the stream broke.
    Disconnected,
}

/// Remote scene viewer.
pub struct SceneViewer {
    pub session_id: SessionId,
    pub state: ViewerState,
    pub mirror: SceneMirror,
    pub name: String,
    /// Reason given by the server, if it said goodbye.
    pub disconnect_reason: Option<String>,

    writer: FrameWriter,
    inbox: mpsc::UnboundedReceiver<NetMsg>,
    reader: JoinHandle<()>,
    server: SocketAddr,
}

impl SceneViewer {
    /// Connects to the server at `cfg.listen_addr` and performs handshake.
    pub async fn connect(cfg: &SceneConfig) -> anyhow::Result<Self> {
        let server: SocketAddr = cfg.listen_addr.parse().context("parse listen_addr")?;
        info!(%server, "Connecting to server");

        let mut conn = ReliableConn::connect(server).await?;
        conn.send(&NetMsg::Hello {
            protocol: PROTOCOL_VERSION,
        })
        .await?;

        let session_id = match conn.recv().await? {
            NetMsg::Welcome { session_id } => session_id,
            NetMsg::Disconnect { reason } => anyhow::bail!("server refused connection: {reason}"),
            other => anyhow::bail!("expected Welcome, got {other:?}"),
        };
        info!(session = ?session_id, "Connected to server");

        let (reader, writer) = conn.into_split();
        let (tx, inbox) = mpsc::unbounded_channel();
        let reader = tokio::spawn(read_loop(reader, tx));

        Ok(Self {
            session_id,
            state: ViewerState::Connected,
            mirror: SceneMirror::new(),
            name: cfg.viewer_name.clone(),
            disconnect_reason: None,
            writer,
            inbox,
            reader,
            server,
        })
    }

    pub fn server_addr(&self) -> SocketAddr {
        self.server
    }

    fn handle(&mut self, msg: NetMsg) -> bool {
        match msg {
            NetMsg::Disconnect { reason } => {
                info!(reason = %reason, "Disconnected by server");
                self.disconnect_reason = Some(reason);
                self.state = ViewerState::Disconnected;
                false
            }
            msg @ NetMsg::Snapshot(_) => {
                self.mirror.apply_msg(&msg);
                self.state = ViewerState::Synced;
                debug!(
                    objects = self.mirror.object_count(),
                    widgets = self.mirror.widget_count(),
                    "Snapshot applied"
                );
                true
            }
            msg @ NetMsg::Diff { .. } => {
                if self.state == ViewerState::Connected {
                    warn!("Diff before snapshot");
                }
                self.mirror.apply_msg(&msg)
            }
            other => {
                debug!(?other, "Unhandled server message");
                false
            }
        }
    }

    /// Waits up to `timeout` for one server message and applies it. Returns
    /// true if it changed the mirror.
    pub async fn recv_update(&mut self, timeout: Duration) -> anyhow::Result<bool> {
        if self.state == ViewerState::Disconnected {
            anyhow::bail!("viewer is disconnected");
        }
        match tokio::time::timeout(timeout, self.inbox.recv()).await {
            Ok(Some(msg)) => Ok(self.handle(msg)),
            Ok(None) => {
                self.state = ViewerState::Disconnected;
                Ok(false)
            }
            Err(_) => Ok(false), // Timeout
        }
    }

    /// Applies every message already received. Returns how many changed the
    /// mirror.
    pub fn poll(&mut self) -> usize {
        let mut applied = 0;
        loop {
            match self.inbox.try_recv() {
                Ok(msg) => applied += usize::from(self.handle(msg)),
                Err(mpsc::error::TryRecvError::Empty) => break,
                Err(mpsc::error::TryRecvError::Disconnected) => {
                    self.state = ViewerState::Disconnected;
                    break;
                }
            }
        }
        applied
    }

    /// Applies updates until `done` holds for the mirror or `timeout` passes.
    pub async fn wait_until(
        &mut self,
        timeout: Duration,
        done: impl Fn(&SceneMirror) -> bool,
    ) -> anyhow::Result<bool> {
        let deadline = Instant::now() + timeout;
        while !(self.state == ViewerState::Synced && done(&self.mirror)) {
            let left = deadline.saturating_duration_since(Instant::now());
            if left.is_zero() || self.state == ViewerState::Disconnected {
                return Ok(false);
            }
            self.recv_update(left).await?;
        }
        Ok(true)
    }

    pub async fn send_input(&mut self, input: ViewerInput) -> anyhow::Result<()> {
        self.writer.send(&NetMsg::Input(input)).await
    }

    pub async fn click(&mut self, key: &str) -> anyhow::Result<()> {
        self.send_input(ViewerInput::ButtonClick { key: key.to_string() })
            .await
    }

    pub async fn slide(&mut self, key: &str, value: f64) -> anyhow::Result<()> {
        self.send_input(ViewerInput::SliderChange {
            key: key.to_string(),
            value,
        })
        .await
    }

    /// Says goodbye; the server closes the session.
    pub async fn disconnect(&mut self, reason: &str) -> anyhow::Result<()> {
        self.writer
            .send(&NetMsg::Disconnect {
                reason: reason.to_string(),
            })
            .await?;
        self.state = ViewerState::Disconnected;
        Ok(())
    }

    /// Executes a console command.
    pub async fn exec_console(&mut self, line: &str) -> anyhow::Result<Vec<String>> {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        let Some(&command) = tokens.first() else {
            return Ok(Vec::new());
        };

        match (command, &tokens[1..]) {
            ("status", _) => Ok(vec![
                format!("Viewer: {}", self.name),
                format!("State: {:?}", self.state),
                format!("Session: {:?}", self.session_id),
                format!("Objects: {}", self.mirror.object_count()),
                format!("Widgets: {}", self.mirror.widget_count()),
                format!("Snapshots applied: {}", self.mirror.snapshots_applied()),
                format!("Events applied: {}", self.mirror.events_applied()),
            ]),
            ("objects", _) => Ok(self
                .mirror
                .snapshot()
                .objects
                .iter()
                .map(|o| format!("  {} {:?} at {:?}", o.key, o.shape.kind(), o.position.to_array()))
                .collect()),
            ("widgets", _) => Ok(self
                .mirror
                .snapshot()
                .widgets
                .iter()
                .map(|w| format!("  {} {}", w.key, w.kind.name()))
                .collect()),
            ("click", [key]) => {
                self.click(key).await?;
                Ok(vec![format!("Clicked {key}")])
            }
            ("slide", [key, value]) => {
                let value: f64 = value.parse().context("slider value")?;
                self.slide(key, value).await?;
                Ok(vec![format!("Set {key} to {value}")])
            }
            ("click", _) => Ok(vec!["Usage: click <button>".to_string()]),
            ("slide", _) => Ok(vec!["Usage: slide <slider> <value>".to_string()]),
            ("quit" | "exit", _) => {
                self.disconnect("viewer quit").await?;
                Ok(vec!["Disconnected".to_string()])
            }
            (other, _) => Ok(vec![format!("Unknown command: {other}")]),
        }
    }
}

impl Drop for SceneViewer {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

async fn read_loop(mut reader: FrameReader, tx: mpsc::UnboundedSender<NetMsg>) {
    loop {
        match reader.recv().await {
            Ok(msg) => {
                if tx.send(msg).is_err() {
                    break;
                }
            }
            Err(e) => {
                debug!(error = %e, "Server stream ended");
                break;
            }
        }
    }
}
