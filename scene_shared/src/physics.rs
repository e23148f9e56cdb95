//! Simulation provider views.
//!
//! The scene layer never simulates anything. A physics engine exposes its
//! state through these read-only views and the render adapters translate it
//! into scene primitives.

use crate::math::Vec3;

/// Geometry of one visual attached to a link.
#[derive(Debug, Clone, PartialEq)]
pub enum VisualShape {
    Box { size: Vec3 },
    Sphere { radius: f64 },
    /// Mesh asset resolved through the scene's mesh loader.
    Mesh { path: String, scale: Vec3 },
}

/// A visual attached to a link, posed in world coordinates.
#[derive(Debug, Clone, PartialEq)]
pub struct LinkVisual {
    /// Name of the owning link; stable across ticks.
    pub link: String,
    /// Index of the visual within its link.
    pub index: usize,
    pub shape: VisualShape,
    pub position: Vec3,
    pub rotation: Vec3,
    pub color: Vec3,
}

/// An articulated body (skeleton) in its current pose.
pub trait SkeletonView {
    fn name(&self) -> &str;
    fn visuals(&self) -> Vec<LinkVisual>;
}

/// A contact force acting at a world point.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ContactForce {
    pub point: Vec3,
    pub force: Vec3,
}

/// A whole simulated world.
pub trait WorldView {
    fn skeletons(&self) -> Vec<&dyn SkeletonView>;

    fn contact_forces(&self) -> Vec<ContactForce> {
        Vec::new()
    }

    /// World positions of each named body for a generalized position vector.
    /// Must not disturb the live simulation state.
    fn body_positions(&self, positions: &[f64]) -> Vec<(String, Vec3)>;
}

/// A single rigid body.
pub trait BodyView {
    fn name(&self) -> &str;
    fn world_position(&self) -> Vec3;

    /// World-space vertices paired with their linear velocities.
    fn moving_vertices(&self) -> Vec<(Vec3, Vec3)> {
        Vec::new()
    }
}
