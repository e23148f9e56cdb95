//! Scene error taxonomy.

use thiserror::Error;

use crate::{diff::TargetKind, session::SessionId};

/// Errors surfaced by the scene state machine.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SceneError {
    /// Read or mutation on a key that is not registered.
    #[error("{kind} '{key}' not found")]
    NotFound { kind: TargetKind, key: String },

    /// Widget setter applied to a widget of another kind.
    #[error("widget '{key}' is not a {expected}")]
    WrongWidgetKind { key: String, expected: &'static str },

    /// NaN or infinite coordinate, color, size or widget value.
    #[error("non-finite {field} for '{key}'")]
    NonFinite { key: String, field: &'static str },

    /// Mesh or resource could not be loaded.
    #[error("failed to load asset '{path}': {reason}")]
    AssetLoad { path: String, reason: String },

    /// Session queue overflowed; recovered by re-snapshotting.
    #[error("session {session:?} fell behind and must be re-snapshotted")]
    StaleSession { session: SessionId },

    #[error("unknown session {0:?}")]
    UnknownSession(SessionId),
}

impl SceneError {
    pub fn object_not_found(key: &str) -> Self {
        SceneError::NotFound {
            kind: TargetKind::Object,
            key: key.to_string(),
        }
    }

    pub fn widget_not_found(key: &str) -> Self {
        SceneError::NotFound {
            kind: TargetKind::Widget,
            key: key.to_string(),
        }
    }

    /// True for the recoverable "no such key" family.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            SceneError::NotFound { .. } | SceneError::WrongWidgetKind { .. }
        )
    }
}

pub type SceneResult<T> = Result<T, SceneError>;
