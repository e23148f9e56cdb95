//! Standalone server binary.
//!
//! Usage:
//!   cargo run -p scene_server -- [--addr 127.0.0.1:8070] [--tick-hz 30] [--config scene.json] [--demo]
//!
//! The server listens for viewer connections and streams the scene to them,
//! flushing pending diffs once per tick.
//!
//! Console commands:
//!   status    - Show server status
//!   sessions  - List connected viewers
//!   clear     - Remove every object and widget
//!   flush     - Push pending diffs now
//!   quit      - Shutdown server

use std::io::{BufRead, Write};
use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use scene_server::server::SceneServer;
use scene_shared::{
    config::SceneConfig,
    event::{HostEvent, UiInput},
    math::{Vec2i, Vec3},
    scene::{BoxSpec, SphereSpec},
    state::SceneStateMachine,
    widget::{CallbackId, SliderSpec},
};
use tokio::sync::mpsc;
use tracing::info;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// JSON config file; flags below override its values
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Listen address
    #[arg(long)]
    addr: Option<String>,

    /// Ticks per second
    #[arg(long)]
    tick_hz: Option<u32>,

    /// Diffs a viewer may fall behind before it is resynced
    #[arg(long)]
    queue_capacity: Option<usize>,

    /// Populate a small sample scene
    #[arg(long)]
    demo: bool,
}

fn load_config(args: &Args) -> anyhow::Result<SceneConfig> {
    let mut cfg = match &args.config {
        Some(path) => SceneConfig::from_json_file(path)?,
        None => SceneConfig::default(),
    };
    if let Some(addr) = &args.addr {
        cfg.listen_addr = addr.clone();
    }
    if let Some(hz) = args.tick_hz {
        cfg.tick_hz = hz.max(1);
    }
    if let Some(cap) = args.queue_capacity {
        cfg.session_queue_capacity = cap;
    }
    Ok(cfg)
}

fn populate_demo(scene: &SceneStateMachine) -> anyhow::Result<()> {
    scene.create_box(
        "demo.floor",
        BoxSpec {
            size: Vec3::new(4.0, 4.0, 0.05),
            position: Vec3::new(0.0, 0.0, -0.025),
            ..Default::default()
        },
    )?;
    scene.create_sphere(
        "demo.ball",
        SphereSpec {
            position: Vec3::new(0.0, 0.0, 1.0),
            color: Vec3::new(0.9, 0.2, 0.2),
            ..Default::default()
        },
    )?;
    scene.create_text("demo.title", "Scene server demo", Vec2i::new(10, 10), Vec2i::new(300, 30))?;
    scene.create_button(
        "demo.reset",
        "Reset",
        Vec2i::new(10, 50),
        Vec2i::new(100, 30),
        CallbackId::new("reset"),
    )?;
    scene.create_slider(
        "demo.height",
        Vec2i::new(10, 90),
        Vec2i::new(300, 30),
        SliderSpec {
            min: 0.0,
            max: 3.0,
            value: 1.0,
            on_change: CallbackId::new("height"),
            ..Default::default()
        },
    )?;
    Ok(())
}

/// Reacts to demo widgets so a viewer sees its own input reflected.
async fn run_demo_host(scene: std::sync::Arc<SceneStateMachine>) {
    let mut events = scene.subscribe_host_events();
    while let Some(event) = events.recv().await {
        match event {
            HostEvent::Callback { callback, input, .. } => {
                let result = match (callback.as_str(), input) {
                    ("reset", UiInput::Click) => scene
                        .set_object_position("demo.ball", Vec3::new(0.0, 0.0, 1.0))
                        .and_then(|_| scene.set_slider_value("demo.height", 1.0)),
                    ("height", UiInput::SliderValue(z)) => {
                        scene.set_object_position("demo.ball", Vec3::new(0.0, 0.0, z))
                    }
                    _ => Ok(()),
                };
                if let Err(e) = result {
                    tracing::warn!(error = %e, "Demo callback failed");
                }
            }
            other => info!(event = ?other, "Host event"),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();
    let cfg = load_config(&args)?;
    info!(
        addr = %cfg.listen_addr,
        tick_hz = cfg.tick_hz,
        queue_capacity = cfg.session_queue_capacity,
        max_sessions = cfg.max_sessions,
        "Starting server"
    );

    let mut server = SceneServer::bind(cfg.clone()).await.context("create server")?;
    let local = server.local_addr()?;
    info!(%local, "Server listening");

    if args.demo {
        populate_demo(server.scene()).context("populate demo scene")?;
        tokio::spawn(run_demo_host(std::sync::Arc::clone(server.scene())));
    }

    // Set up console input channel.
    let (console_tx, console_rx) = mpsc::channel::<String>(32);
    server.set_console_input(console_rx);

    // Spawn stdin reader thread.
    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        let mut stdout = std::io::stdout();
        loop {
            print!("] ");
            let _ = stdout.flush();
            let mut line = String::new();
            match stdin.lock().read_line(&mut line) {
                Ok(0) | Err(_) => break,
                Ok(_) => {}
            }
            let line = line.trim().to_string();
            if !line.is_empty() && console_tx.blocking_send(line).is_err() {
                break;
            }
        }
    });

    println!("Server ready. Type 'status' for info, 'sessions' to list viewers, 'quit' to exit.");
    println!();

    // Main server loop.
    let tick_interval = std::time::Duration::from_secs_f64(1.0 / cfg.tick_hz.max(1) as f64);
    let mut next_tick = tokio::time::Instant::now();

    while !server.is_shutdown() {
        // Accept new viewers (non-blocking).
        match server.try_accept(std::time::Duration::from_millis(1)).await {
            Ok(Some(peer)) => info!(%peer, "Connection accepted"),
            Ok(None) => {}
            Err(e) => tracing::warn!(error = %e, "Connection attempt failed"),
        }

        server.step().await?;

        // Wait for next tick.
        next_tick += tick_interval;
        tokio::time::sleep_until(next_tick).await;
    }
    Ok(())
}
