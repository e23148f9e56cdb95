//! `scene_viewer`
//!
//! Viewer-side systems:
//! - Connection management (one reliable stream, split read/write)
//! - Scene mirror rebuilt from snapshots and diffs
//! - Widget interaction sent back as viewer input

pub mod client;

pub use client::SceneViewer;
