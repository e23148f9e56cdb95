//! `scene_shared`
//!
//! Scene state machine shared by the server and viewers.
//!
//! Design goals:
//! - One authoritative registry of 3D objects and 2D widgets.
//! - Every mutation becomes exactly one ordered diff event.
//! - Viewers start from a snapshot and stay in sync from diffs; a viewer
//!   that falls behind is resynced instead of silently diverging.
//! - Simulation engines plug in through read-only views.
//! - No `unsafe`.

pub mod config;
pub mod diff;
pub mod error;
pub mod event;
pub mod math;
pub mod mesh;
pub mod mirror;
pub mod net;
pub mod physics;
pub mod render;
pub mod scene;
pub mod session;
pub mod state;
pub mod widget;

pub mod prelude {
    //! Commonly used exports.

    pub use crate::config::*;
    pub use crate::diff::*;
    pub use crate::error::*;
    pub use crate::event::*;
    pub use crate::math::*;
    pub use crate::net::*;
    pub use crate::scene::*;
    pub use crate::state::*;
    pub use crate::widget::*;
}
