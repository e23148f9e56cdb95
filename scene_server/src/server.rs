//! Server implementation.
//!
//! Hosts one [`SceneStateMachine`] and streams it to any number of viewers.
//! It supports:
//! - Hello/Welcome handshake with protocol check and a session limit
//! - One writer task per session: snapshot first, then ordered diff batches
//! - One reader task per session: viewer input routed to the host
//! - Console commands (status, sessions, clear, flush, quit)
//!
//! Diffs are published as mutations happen but only written when a tick
//! flushes the sessions, so one tick's mutations travel as one batch.
//!
//! The tick loop never waits on a socket. Handshakes run in their own tasks
//! and report back over a channel; `step` admits whatever has arrived.

use anyhow::Context;
use scene_shared::{
    config::SceneConfig,
    net::{FrameReader, FrameWriter, NetMsg, ReliableConn, ReliableListener, PROTOCOL_VERSION},
    session::{Session, SessionId},
    state::SceneStateMachine,
};
use std::{
    collections::HashMap,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    sync::Arc,
    time::Duration,
};
use tokio::{sync::mpsc, task::JoinHandle, time::Instant};
use tracing::{debug, info, warn};

/// A viewer that never says Hello is dropped after this long.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Network tasks serving one session.
struct SessionTasks {
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl SessionTasks {
    fn is_finished(&self) -> bool {
        self.reader.is_finished() && self.writer.is_finished()
    }

    fn abort(&self) {
        self.reader.abort();
        self.writer.abort();
    }
}

/// A connection that completed its Hello and awaits admission.
struct Handshake {
    conn: ReliableConn,
    peer: SocketAddr,
}

/// Scene server.
pub struct SceneServer {
    pub cfg: SceneConfig,
    scene: Arc<SceneStateMachine>,
    tcp: ReliableListener,
    tasks: HashMap<SessionId, SessionTasks>,

    /// Handshakes and refusals still in flight.
    pending: Vec<JoinHandle<()>>,
    handshake_tx: mpsc::UnboundedSender<Handshake>,
    handshake_rx: mpsc::UnboundedReceiver<Handshake>,

    tick: u64,
    shutdown: bool,

    /// Channel for console commands from stdin.
    console_rx: Option<mpsc::Receiver<String>>,
}

impl SceneServer {
    /// Binds the listener and creates a fresh scene from `cfg`.
    pub async fn bind(cfg: SceneConfig) -> anyhow::Result<Self> {
        let scene = SceneStateMachine::new(&cfg).into_shared();
        Self::with_scene(cfg, scene).await
    }

    /// Binds the listener and serves an existing scene.
    pub async fn with_scene(cfg: SceneConfig, scene: Arc<SceneStateMachine>) -> anyhow::Result<Self> {
        let addr: SocketAddr = cfg.listen_addr.parse().context("parse listen_addr")?;
        let tcp = ReliableListener::bind(addr).await?;
        let (handshake_tx, handshake_rx) = mpsc::unbounded_channel();
        Ok(Self {
            cfg,
            scene,
            tcp,
            tasks: HashMap::new(),
            pending: Vec::new(),
            handshake_tx,
            handshake_rx,
            tick: 0,
            shutdown: false,
            console_rx: None,
        })
    }

    /// Sets the console input receiver.
    pub fn set_console_input(&mut self, rx: mpsc::Receiver<String>) {
        self.console_rx = Some(rx);
    }

    /// Returns the local address (after binding).
    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        self.tcp.local_addr()
    }

    /// The scene being served. Host code mutates it directly.
    pub fn scene(&self) -> &Arc<SceneStateMachine> {
        &self.scene
    }

    pub fn tick(&self) -> u64 {
        self.tick
    }

    /// True once `quit` was executed.
    pub fn is_shutdown(&self) -> bool {
        self.shutdown
    }

    /// Accepts a connection if one arrives within `timeout` and starts its
    /// handshake in the background. The viewer is admitted by a later
    /// [`step`](Self::step) once its Hello has arrived.
    pub async fn try_accept(&mut self, timeout: Duration) -> anyhow::Result<Option<SocketAddr>> {
        match tokio::time::timeout(timeout, self.tcp.accept()).await {
            Ok(Ok((conn, peer))) => {
                debug!(%peer, "Connection accepted, awaiting hello");
                let done = self.handshake_tx.clone();
                self.pending.push(tokio::spawn(handshake(conn, peer, done)));
                Ok(Some(peer))
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Ok(None), // Timeout
        }
    }

    /// Number of accepted connections whose handshake is still running.
    pub fn pending_handshakes(&self) -> usize {
        self.pending.iter().filter(|h| !h.is_finished()).count()
    }

    /// Registers every viewer whose handshake finished since the last call.
    pub fn admit_handshaken(&mut self) -> Vec<SessionId> {
        let mut admitted = Vec::new();
        if self.shutdown {
            return admitted;
        }
        while let Ok(Handshake { conn, peer }) = self.handshake_rx.try_recv() {
            if let Some(id) = self.admit(conn, peer) {
                admitted.push(id);
            }
        }
        admitted
    }

    fn admit(&mut self, conn: ReliableConn, peer: SocketAddr) -> Option<SessionId> {
        self.reap_finished();
        if self.scene.session_count() >= self.cfg.max_sessions {
            warn!(%peer, limit = self.cfg.max_sessions, "Session limit reached");
            self.pending.push(tokio::spawn(async move {
                let mut conn = conn;
                refuse(&mut conn, "server full".to_string()).await;
            }));
            return None;
        }

        let session = self.scene.open_session(Some(peer));
        let id = session.id();
        let (reader, writer) = conn.into_split();
        let tasks = SessionTasks {
            reader: tokio::spawn(read_loop(Arc::clone(&self.scene), id, reader)),
            writer: tokio::spawn(write_loop(Arc::clone(&self.scene), session, writer)),
        };
        self.tasks.insert(id, tasks);

        info!(session = ?id, %peer, "Viewer connected");
        Some(id)
    }

    /// Drops bookkeeping for sessions and handshakes whose tasks have ended.
    fn reap_finished(&mut self) {
        self.tasks.retain(|id, t| {
            let done = t.is_finished();
            if done {
                debug!(session = ?id, "Session tasks finished");
            }
            !done
        });
        self.pending.retain(|h| !h.is_finished());
    }

    /// Runs the server for a number of ticks.
    pub async fn run_for_ticks(&mut self, ticks: u32) -> anyhow::Result<()> {
        let dt = Duration::from_secs_f64(1.0 / self.cfg.tick_hz.max(1) as f64);
        let mut next = Instant::now();

        for _ in 0..ticks {
            next += dt;
            self.step().await?;
            tokio::time::sleep_until(next).await;
        }
        Ok(())
    }

    /// Executes one tick: console input, admission of handshaken viewers,
    /// then a flush of every session.
    pub async fn step(&mut self) -> anyhow::Result<()> {
        self.process_console_commands().await?;
        self.admit_handshaken();
        self.scene.flush();
        self.reap_finished();
        self.tick += 1;
        Ok(())
    }

    async fn process_console_commands(&mut self) -> anyhow::Result<()> {
        // Collect lines first to avoid borrow conflict
        let lines: Vec<String> = if let Some(ref mut rx) = self.console_rx {
            let mut collected = Vec::new();
            while let Ok(line) = rx.try_recv() {
                collected.push(line);
            }
            collected
        } else {
            Vec::new()
        };

        for line in lines {
            for out in self.exec_console(&line)? {
                println!("{out}");
            }
        }
        Ok(())
    }

    /// Executes a console command.
    pub fn exec_console(&mut self, line: &str) -> anyhow::Result<Vec<String>> {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        let Some(&command) = tokens.first() else {
            return Ok(Vec::new());
        };

        match command {
            "status" => Ok(vec![
                format!("Tick: {}", self.tick),
                format!("Sessions: {}/{}", self.scene.session_count(), self.cfg.max_sessions),
                format!("Handshakes: {}", self.pending_handshakes()),
                format!("Objects: {}", self.scene.object_count()),
                format!("Widgets: {}", self.scene.ui_element_count()),
                format!("Cached meshes: {}", self.scene.cached_mesh_count()),
            ]),
            "sessions" => {
                let sessions = self.scene.sessions();
                if sessions.is_empty() {
                    return Ok(vec!["No sessions".to_string()]);
                }
                Ok(sessions
                    .iter()
                    .map(|s| {
                        format!(
                            "  {:?}: peer={} since={} queued={} stale={} resyncs={} delivered={}",
                            s.id,
                            s.peer.map_or_else(|| "-".to_string(), |p| p.to_string()),
                            s.connected_at.format("%H:%M:%S"),
                            s.queued,
                            s.stale,
                            s.resyncs,
                            s.delivered
                        )
                    })
                    .collect())
            }
            "clear" => {
                self.scene.clear();
                Ok(vec!["Scene cleared".to_string()])
            }
            "flush" => {
                self.scene.flush();
                Ok(vec![format!("Flushed {} sessions", self.scene.session_count())])
            }
            "quit" | "exit" => {
                info!("Server shutting down");
                self.shutdown();
                Ok(vec!["Shutting down".to_string()])
            }
            other => Ok(vec![format!("Unknown command: {other}")]),
        }
    }

    /// Closes every session and stops its tasks.
    pub fn shutdown(&mut self) {
        self.shutdown = true;
        for handle in self.pending.drain(..) {
            handle.abort();
        }
        for (id, tasks) in self.tasks.drain() {
            tasks.reader.abort();
            self.scene.close_session(id);
        }
    }
}

impl Drop for SceneServer {
    fn drop(&mut self) {
        for tasks in self.tasks.values() {
            tasks.abort();
        }
        for handle in &self.pending {
            handle.abort();
        }
    }
}

async fn refuse(conn: &mut ReliableConn, reason: String) {
    warn!(reason = %reason, "Refusing viewer");
    if let Err(e) = conn.send(&NetMsg::Disconnect { reason }).await {
        debug!(error = %e, "Refusal not delivered");
    }
}

/// Waits for the viewer's Hello off the tick loop. Accepted connections are
/// handed back through `done`; anything else is dropped here.
async fn handshake(mut conn: ReliableConn, peer: SocketAddr, done: mpsc::UnboundedSender<Handshake>) {
    let msg = match tokio::time::timeout(HANDSHAKE_TIMEOUT, conn.recv()).await {
        Ok(Ok(msg)) => msg,
        Ok(Err(e)) => {
            debug!(%peer, error = %e, "Handshake failed");
            return;
        }
        Err(_) => {
            warn!(%peer, "Handshake timed out");
            return;
        }
    };
    match msg {
        NetMsg::Hello { protocol } if protocol == PROTOCOL_VERSION => {
            if done.send(Handshake { conn, peer }).is_err() {
                debug!(%peer, "Server stopped before admission");
            }
        }
        NetMsg::Hello { protocol } => {
            refuse(&mut conn, format!("protocol {protocol} unsupported")).await;
        }
        other => warn!(%peer, ?other, "Unexpected handshake message"),
    }
}

/// Routes viewer input until the connection ends, then closes the session.
async fn read_loop(scene: Arc<SceneStateMachine>, id: SessionId, mut reader: FrameReader) {
    loop {
        match reader.recv().await {
            Ok(NetMsg::Input(input)) => {
                if let Err(e) = scene.handle_input(id, input) {
                    warn!(session = ?id, error = %e, "Rejected viewer input");
                }
            }
            Ok(NetMsg::Disconnect { reason }) => {
                info!(session = ?id, reason = %reason, "Viewer disconnected");
                break;
            }
            Ok(other) => debug!(session = ?id, ?other, "Unexpected viewer message"),
            Err(e) => {
                debug!(session = ?id, error = %e, "Viewer connection ended");
                break;
            }
        }
    }
    scene.close_session(id);
}

/// Sends the Welcome, then delivers everything the session has pending each
/// time it is woken.
async fn write_loop(scene: Arc<SceneStateMachine>, session: Arc<Session>, mut writer: FrameWriter) {
    let id = session.id();
    if let Err(e) = writer.send(&NetMsg::Welcome { session_id: id }).await {
        debug!(session = ?id, error = %e, "Welcome not delivered");
        scene.close_session(id);
        return;
    }
    loop {
        loop {
            match scene.drain_session(id) {
                Ok(Some(msg)) => {
                    if let Err(e) = writer.send(&msg).await {
                        debug!(session = ?id, error = %e, "Write failed");
                        scene.close_session(id);
                        return;
                    }
                }
                Ok(None) => break,
                Err(_) => {
                    let reason = "session closed".to_string();
                    if let Err(e) = writer.send(&NetMsg::Disconnect { reason }).await {
                        debug!(session = ?id, error = %e, "Goodbye not delivered");
                    }
                    return;
                }
            }
        }
        session.notified().await;
    }
}

/// Helper for tests: bind to an ephemeral port.
pub async fn bind_ephemeral(tick_hz: u32) -> anyhow::Result<(SceneServer, SceneConfig)> {
    let cfg = SceneConfig {
        listen_addr: format!("{}:{}", IpAddr::V4(Ipv4Addr::LOCALHOST), 0),
        tick_hz,
        ..Default::default()
    };
    let mut server = SceneServer::bind(cfg).await?;
    server.cfg.listen_addr = server.local_addr()?.to_string();
    let cfg = server.cfg.clone();
    Ok((server, cfg))
}

#[cfg(test)]
mod tests {
    use super::*;
    use scene_shared::scene::BoxSpec;

    #[tokio::test]
    async fn console_reports_and_clears() {
        let (mut server, _cfg) = bind_ephemeral(30).await.unwrap();
        server.scene().create_box("b1", BoxSpec::default()).unwrap();

        let status = server.exec_console("status").unwrap();
        assert!(status.contains(&"Objects: 1".to_string()));
        assert_eq!(server.exec_console("sessions").unwrap(), vec!["No sessions"]);

        server.exec_console("clear").unwrap();
        assert_eq!(server.scene().object_count(), 0);

        assert!(server.exec_console("bogus").unwrap()[0].starts_with("Unknown command"));
        assert!(server.exec_console("   ").unwrap().is_empty());

        assert!(!server.is_shutdown());
        server.exec_console("quit").unwrap();
        assert!(server.is_shutdown());
    }

    #[tokio::test]
    async fn console_lines_run_on_step() {
        let (mut server, _cfg) = bind_ephemeral(30).await.unwrap();
        let (tx, rx) = mpsc::channel(4);
        server.set_console_input(rx);
        tx.send("quit".to_string()).await.unwrap();
        server.step().await.unwrap();
        assert!(server.is_shutdown());
        assert_eq!(server.tick(), 1);
    }
}
