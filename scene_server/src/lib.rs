//! `scene_server`
//!
//! Server-side systems:
//! - Accepts viewers over TCP (Hello / Welcome handshake)
//! - Streams a snapshot, then ordered diff batches, to each session
//! - Routes viewer input back to the hosting application
//! - Tick loop with an interactive console

pub mod server;

pub use server::SceneServer;
