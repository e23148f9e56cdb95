//! Pendulum demo.
//!
//! Runs a damped pendulum chain and streams it through the render adapters,
//! so any connected viewer sees a moving skeleton, its weight force, a
//! predicted trajectory and a world basis. Widgets control gravity and reset
//! the chain.
//!
//! Usage:
//!   cargo run -p scene_tests --bin scene_demo -- [--addr 127.0.0.1:8070] [--links 3] [--ticks 600]

use std::f64::consts::FRAC_PI_4;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use scene_server::server::SceneServer;
use scene_shared::{
    config::SceneConfig,
    event::{HostEvent, UiInput},
    math::{Vec2i, Vec3},
    physics::{BodyView, ContactForce, LinkVisual, SkeletonView, VisualShape, WorldView},
    render,
    widget::{CallbackId, SliderSpec},
};
use tracing::info;

const LINK_LENGTH: f64 = 0.5;
const BOB_MASS: f64 = 1.0;
const PIVOT: Vec3 = Vec3::new(0.0, 0.0, 2.0);
const PREVIEW_STEPS: usize = 90;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Listen address
    #[arg(long, default_value = "127.0.0.1:8070")]
    addr: String,

    /// Ticks per second
    #[arg(long, default_value_t = 60)]
    tick_hz: u32,

    /// Number of links in the chain
    #[arg(long, default_value_t = 3)]
    links: usize,

    /// Stop after this many ticks; runs forever when omitted
    #[arg(long)]
    ticks: Option<u64>,
}

/// A planar chain of independent damped pendulum joints.
#[derive(Debug, Clone)]
struct Chain {
    angles: Vec<f64>,
    velocities: Vec<f64>,
    gravity: f64,
    damping: f64,
}

impl Chain {
    fn new(links: usize) -> Self {
        Self {
            angles: vec![FRAC_PI_4; links.max(1)],
            velocities: vec![0.0; links.max(1)],
            gravity: 9.81,
            damping: 0.1,
        }
    }

    fn reset(&mut self) {
        self.angles.iter_mut().for_each(|a| *a = FRAC_PI_4);
        self.velocities.iter_mut().for_each(|v| *v = 0.0);
    }

    fn step(&mut self, dt: f64) {
        for (a, v) in self.angles.iter_mut().zip(self.velocities.iter_mut()) {
            let acc = -self.gravity / LINK_LENGTH * a.sin() - self.damping * *v;
            *v += acc * dt;
            *a += *v * dt;
        }
    }

    /// Joint positions from the pivot to the tip for the given angles.
    fn joints(angles: &[f64]) -> Vec<Vec3> {
        let mut out = vec![PIVOT];
        let mut heading = 0.0_f64;
        let mut p = PIVOT;
        for a in angles {
            heading += a;
            p = p + Vec3::new(heading.sin(), 0.0, -heading.cos()) * LINK_LENGTH;
            out.push(p);
        }
        out
    }

    fn tip(&self) -> Vec3 {
        Self::joints(&self.angles).last().copied().unwrap_or(PIVOT)
    }

    /// Tip velocity by finite difference over one small step.
    fn tip_velocity(&self) -> Vec3 {
        let dt = 1e-3;
        let mut ahead = self.clone();
        ahead.step(dt);
        (ahead.tip() - self.tip()) * (1.0 / dt)
    }

    fn preview(&self, steps: usize, dt: f64) -> Vec<Vec<f64>> {
        let mut sim = self.clone();
        (0..steps)
            .map(|_| {
                sim.step(dt);
                sim.angles.clone()
            })
            .collect()
    }
}

impl SkeletonView for Chain {
    fn name(&self) -> &str {
        "pendulum"
    }

    fn visuals(&self) -> Vec<LinkVisual> {
        let joints = Self::joints(&self.angles);
        let mut heading = 0.0_f64;
        let mut visuals = Vec::new();
        for (i, pair) in joints.windows(2).enumerate() {
            heading += self.angles[i];
            visuals.push(LinkVisual {
                link: format!("link{i}"),
                index: 0,
                shape: VisualShape::Box {
                    size: Vec3::new(0.04, 0.04, LINK_LENGTH),
                },
                position: pair[0].lerp(pair[1], 0.5),
                rotation: Vec3::new(0.0, -heading, 0.0),
                color: Vec3::new(0.3, 0.5, 0.8),
            });
        }
        visuals.push(LinkVisual {
            link: "bob".into(),
            index: 0,
            shape: VisualShape::Sphere { radius: 0.08 },
            position: self.tip(),
            rotation: Vec3::ZERO,
            color: Vec3::new(0.9, 0.3, 0.2),
        });
        visuals
    }
}

impl WorldView for Chain {
    fn skeletons(&self) -> Vec<&dyn SkeletonView> {
        vec![self as &dyn SkeletonView]
    }

    fn contact_forces(&self) -> Vec<ContactForce> {
        vec![ContactForce {
            point: self.tip(),
            force: Vec3::new(0.0, 0.0, -BOB_MASS * self.gravity),
        }]
    }

    fn body_positions(&self, angles: &[f64]) -> Vec<(String, Vec3)> {
        Self::joints(angles)
            .into_iter()
            .enumerate()
            .skip(1)
            .map(|(i, p)| (format!("joint{i}"), p))
            .collect()
    }
}

impl BodyView for Chain {
    fn name(&self) -> &str {
        "bob"
    }

    fn world_position(&self) -> Vec3 {
        self.tip()
    }

    fn moving_vertices(&self) -> Vec<(Vec3, Vec3)> {
        vec![(self.tip(), self.tip_velocity())]
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
    let cfg = SceneConfig {
        listen_addr: args.addr.clone(),
        tick_hz: args.tick_hz.max(1),
        ..Default::default()
    };
    let mut server = SceneServer::bind(cfg.clone()).await.context("create server")?;
    info!(addr = %server.local_addr()?, links = args.links, "Pendulum demo listening");

    let scene = std::sync::Arc::clone(server.scene());
    let mut host_events = scene.subscribe_host_events();

    scene.create_text("ui.title", "Pendulum", Vec2i::new(10, 10), Vec2i::new(200, 24))?;
    scene.create_button(
        "ui.reset",
        "Reset",
        Vec2i::new(10, 40),
        Vec2i::new(90, 24),
        CallbackId::new("reset"),
    )?;
    scene.create_slider(
        "ui.gravity",
        Vec2i::new(10, 70),
        Vec2i::new(240, 24),
        SliderSpec {
            min: 0.0,
            max: 20.0,
            value: 9.81,
            on_change: CallbackId::new("gravity"),
            ..Default::default()
        },
    )?;
    render::render_basis(&scene, 0.5, "basis", Vec3::ZERO, Vec3::ZERO)?;

    let mut chain = Chain::new(args.links);
    let dt = 1.0 / cfg.tick_hz as f64;
    let tick_interval = Duration::from_secs_f64(dt);
    let mut next_tick = tokio::time::Instant::now();
    let mut tick: u64 = 0;

    while args.ticks.map_or(true, |limit| tick < limit) && !server.is_shutdown() {
        match server.try_accept(Duration::from_millis(1)).await {
            Ok(Some(peer)) => info!(%peer, "Connection accepted"),
            Ok(None) => {}
            Err(e) => tracing::warn!(error = %e, "Connection attempt failed"),
        }

        while let Ok(event) = host_events.try_recv() {
            match event {
                HostEvent::Callback { callback, input, .. } => match (callback.as_str(), input) {
                    ("reset", UiInput::Click) => chain.reset(),
                    ("gravity", UiInput::SliderValue(g)) => chain.gravity = g,
                    _ => {}
                },
                other => info!(event = ?other, "Host event"),
            }
        }

        chain.step(dt);
        render::render_world(&scene, &chain, "world", true, true)?;
        render::render_moving_body_node_vertices(&scene, &chain, 0.2, "velocity")?;
        if tick % u64::from(cfg.tick_hz) == 0 {
            let preview = chain.preview(PREVIEW_STEPS, dt);
            render::render_trajectory_lines(&scene, &chain, &preview, "preview")?;
            render::render_body_wrench(
                &scene,
                &chain,
                [0.0, 0.0, 0.0, 0.0, 0.0, -BOB_MASS * chain.gravity],
                0.05,
                "wrench",
            )?;
        }

        server.step().await?;
        tick += 1;

        next_tick += tick_interval;
        tokio::time::sleep_until(next_tick).await;
    }

    render::clear_body_wrench(&scene, &chain, "wrench");
    server.shutdown();
    info!(ticks = tick, "Pendulum demo finished");
    Ok(())
}
