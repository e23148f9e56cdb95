//! Configuration system.
//!
//! Loads scene server/viewer configuration from JSON strings or files.

use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};

/// Root configuration shared by server and viewer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SceneConfig {
    /// Server listen address, e.g. `127.0.0.1:8070`.
    pub listen_addr: String,
    /// Broadcast tick rate; every tick flushes pending diffs.
    pub tick_hz: u32,
    /// Diffs a session may queue before it is dropped back to a snapshot.
    #[serde(default = "default_queue_capacity")]
    pub session_queue_capacity: usize,
    /// Connections beyond this are refused.
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
    /// Display name (viewer only).
    #[serde(default = "default_viewer_name")]
    pub viewer_name: String,
}

fn default_queue_capacity() -> usize {
    4096
}

fn default_max_sessions() -> usize {
    32
}

fn default_viewer_name() -> String {
    "Viewer".to_string()
}

impl Default for SceneConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:8070".to_string(),
            tick_hz: 30,
            session_queue_capacity: default_queue_capacity(),
            max_sessions: default_max_sessions(),
            viewer_name: default_viewer_name(),
        }
    }
}

impl SceneConfig {
    /// Parses config from JSON.
    pub fn from_json_str(s: &str) -> serde_json::Result<Self> {
        serde_json::from_str(s)
    }

    pub fn from_json_file(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("read config {}", path.display()))?;
        Self::from_json_str(&text).with_context(|| format!("parse config {}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn optional_fields_fall_back_to_defaults() {
        let cfg =
            SceneConfig::from_json_str(r#"{"listen_addr":"0.0.0.0:9000","tick_hz":60}"#).unwrap();
        assert_eq!(cfg.listen_addr, "0.0.0.0:9000");
        assert_eq!(cfg.tick_hz, 60);
        assert_eq!(cfg.session_queue_capacity, 4096);
        assert_eq!(cfg.max_sessions, 32);
        assert_eq!(cfg.viewer_name, "Viewer");
    }

    #[test]
    fn missing_required_field_is_an_error() {
        assert!(SceneConfig::from_json_str(r#"{"tick_hz":60}"#).is_err());
    }
}
