//! Standalone viewer binary.
//!
//! Usage:
//!   cargo run -p scene_viewer -- [--addr 127.0.0.1:8070] [--name Viewer] [--click demo.reset]
//!
//! The viewer connects to the server, mirrors the scene and reports what it
//! receives. It has no renderer; it is the reference consumer of the stream.
//!
//! Console commands:
//!   status                 - Show viewer status
//!   objects                - List mirrored objects
//!   widgets                - List mirrored widgets
//!   click <button>         - Press a button
//!   slide <slider> <value> - Move a slider
//!   quit                   - Disconnect and exit

use std::io::{BufRead, Write};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use scene_shared::config::SceneConfig;
use scene_viewer::client::{SceneViewer, ViewerState};
use tokio::sync::mpsc;
use tracing::info;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// JSON config file; flags below override its values
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Server address
    #[arg(long)]
    addr: Option<String>,

    /// Display name
    #[arg(long)]
    name: Option<String>,

    /// Press this button once the first snapshot arrives
    #[arg(long)]
    click: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();
    let mut cfg = match &args.config {
        Some(path) => SceneConfig::from_json_file(path)?,
        None => SceneConfig::default(),
    };
    if let Some(addr) = args.addr {
        cfg.listen_addr = addr;
    }
    if let Some(name) = args.name {
        cfg.viewer_name = name;
    }
    info!(server = %cfg.listen_addr, name = %cfg.viewer_name, "Starting viewer");

    let mut viewer = SceneViewer::connect(&cfg).await.context("connect")?;

    if let Some(button) = &args.click {
        if viewer.wait_until(Duration::from_secs(5), |_| true).await? {
            viewer.click(button).await?;
            info!(button = %button, "Clicked");
        }
    }

    // Set up console input channel.
    let (console_tx, mut console_rx) = mpsc::channel::<String>(32);

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

    println!("Viewer connected. Type 'status' for info, 'quit' to exit.");
    println!();

    let mut last_report = (0, 0);
    loop {
        // Process console commands.
        while let Ok(line) = console_rx.try_recv() {
            match viewer.exec_console(&line).await {
                Ok(output) => {
                    for line in output {
                        println!("{line}");
                    }
                }
                Err(e) => println!("Error: {e}"),
            }
        }

        if viewer.state == ViewerState::Disconnected {
            match &viewer.disconnect_reason {
                Some(reason) => println!("Disconnected from server: {reason}"),
                None => println!("Disconnected."),
            }
            break;
        }

        viewer.recv_update(Duration::from_millis(50)).await?;
        viewer.poll();

        let counts = (viewer.mirror.object_count(), viewer.mirror.widget_count());
        if counts != last_report {
            info!(objects = counts.0, widgets = counts.1, "Scene changed");
            last_report = counts;
        }
    }

    Ok(())
}
