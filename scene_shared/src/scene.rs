//! Object registry.
//!
//! Keyed store of renderable primitives. The registry is a plain data structure:
//! every mutation returns the [`DiffEvent`] that describes it, and the state
//! machine is responsible for locking and fan-out.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::{
    diff::DiffEvent,
    error::{SceneError, SceneResult},
    math::Vec3,
    mesh::{MeshCache, MeshRef},
};

/// Default grey used by every primitive constructor.
pub const DEFAULT_COLOR: Vec3 = Vec3::splat(0.5);

bitflags::bitflags! {
    /// Shadow participation.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct ShadowFlags: u8 {
        const CAST = 1 << 0;
        const RECEIVE = 1 << 1;
    }
}

impl Default for ShadowFlags {
    fn default() -> Self {
        Self::CAST
    }
}

impl ShadowFlags {
    pub fn from_bools(cast: bool, receive: bool) -> Self {
        let mut flags = Self::empty();
        flags.set(Self::CAST, cast);
        flags.set(Self::RECEIVE, receive);
        flags
    }

    pub fn casts(self) -> bool {
        self.contains(Self::CAST)
    }

    pub fn receives(self) -> bool {
        self.contains(Self::RECEIVE)
    }
}

/// Geometry of a scene object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Shape {
    Box { size: Vec3 },
    Sphere { radius: f64 },
    /// Polyline in world coordinates.
    Line { points: Vec<Vec3> },
    Mesh { mesh: MeshRef, scale: Vec3 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShapeKind {
    Box,
    Sphere,
    Line,
    Mesh,
}

impl Shape {
    pub fn kind(&self) -> ShapeKind {
        match self {
            Shape::Box { .. } => ShapeKind::Box,
            Shape::Sphere { .. } => ShapeKind::Sphere,
            Shape::Line { .. } => ShapeKind::Line,
            Shape::Mesh { .. } => ShapeKind::Mesh,
        }
    }

    fn is_finite(&self) -> bool {
        match self {
            Shape::Box { size } => size.is_finite(),
            Shape::Sphere { radius } => radius.is_finite(),
            Shape::Line { points } => points.iter().all(|p| p.is_finite()),
            Shape::Mesh { scale, .. } => scale.is_finite(),
        }
    }

    fn mesh(&self) -> Option<&MeshRef> {
        match self {
            Shape::Mesh { mesh, .. } => Some(mesh),
            _ => None,
        }
    }
}

/// A renderable primitive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SceneObject {
    pub key: String,
    pub shape: Shape,
    pub position: Vec3,
    /// Euler angles, radians, XYZ order.
    pub rotation: Vec3,
    pub color: Vec3,
    pub shadows: ShadowFlags,
}

/// A single changed attribute of an existing object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "field", content = "value", rename_all = "snake_case")]
pub enum ObjectField {
    Shape(Shape),
    Position(Vec3),
    Rotation(Vec3),
    Color(Vec3),
    Shadows(ShadowFlags),
}

impl ObjectField {
    /// Name of this field if it carries a NaN or infinite value.
    pub fn non_finite(&self) -> Option<&'static str> {
        let (name, finite) = match self {
            ObjectField::Shape(shape) => ("shape", shape.is_finite()),
            ObjectField::Position(v) => ("position", v.is_finite()),
            ObjectField::Rotation(v) => ("rotation", v.is_finite()),
            ObjectField::Color(v) => ("color", v.is_finite()),
            ObjectField::Shadows(_) => ("shadows", true),
        };
        (!finite).then_some(name)
    }
}

impl SceneObject {
    /// First field holding a NaN or infinite value, if any.
    pub fn non_finite_field(&self) -> Option<&'static str> {
        if !self.shape.is_finite() {
            return Some("shape");
        }
        [
            ("position", self.position),
            ("rotation", self.rotation),
            ("color", self.color),
        ]
        .into_iter()
        .find_map(|(name, v)| (!v.is_finite()).then_some(name))
    }

    /// Fields of `next` that differ from `self`.
    pub fn changed_fields(&self, next: &SceneObject) -> Vec<ObjectField> {
        let mut fields = Vec::new();
        if self.shape != next.shape {
            fields.push(ObjectField::Shape(next.shape.clone()));
        }
        if self.position != next.position {
            fields.push(ObjectField::Position(next.position));
        }
        if self.rotation != next.rotation {
            fields.push(ObjectField::Rotation(next.rotation));
        }
        if self.color != next.color {
            fields.push(ObjectField::Color(next.color));
        }
        if self.shadows != next.shadows {
            fields.push(ObjectField::Shadows(next.shadows));
        }
        fields
    }

    pub fn apply(&mut self, field: ObjectField) {
        match field {
            ObjectField::Shape(shape) => self.shape = shape,
            ObjectField::Position(v) => self.position = v,
            ObjectField::Rotation(v) => self.rotation = v,
            ObjectField::Color(v) => self.color = v,
            ObjectField::Shadows(s) => self.shadows = s,
        }
    }
}

/// Parameters for a box primitive.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoxSpec {
    pub size: Vec3,
    pub position: Vec3,
    pub rotation: Vec3,
    pub color: Vec3,
    pub shadows: ShadowFlags,
}

impl Default for BoxSpec {
    fn default() -> Self {
        Self {
            size: Vec3::ONE,
            position: Vec3::ZERO,
            rotation: Vec3::ZERO,
            color: DEFAULT_COLOR,
            shadows: ShadowFlags::default(),
        }
    }
}

/// Parameters for a sphere primitive.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SphereSpec {
    pub radius: f64,
    pub position: Vec3,
    pub color: Vec3,
    pub shadows: ShadowFlags,
}

impl Default for SphereSpec {
    fn default() -> Self {
        Self {
            radius: 0.5,
            position: Vec3::ZERO,
            color: DEFAULT_COLOR,
            shadows: ShadowFlags::default(),
        }
    }
}

/// Parameters for a mesh primitive. The geometry is looked up by `path`.
#[derive(Debug, Clone, PartialEq)]
pub struct MeshSpec {
    pub path: String,
    pub position: Vec3,
    pub rotation: Vec3,
    pub scale: Vec3,
    pub color: Vec3,
    pub shadows: ShadowFlags,
}

impl MeshSpec {
    /// First placement field holding a NaN or infinite value, if any.
    pub fn non_finite_field(&self) -> Option<&'static str> {
        [
            ("position", self.position),
            ("rotation", self.rotation),
            ("scale", self.scale),
            ("color", self.color),
        ]
        .into_iter()
        .find_map(|(name, v)| (!v.is_finite()).then_some(name))
    }

    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            position: Vec3::ZERO,
            rotation: Vec3::ZERO,
            scale: Vec3::ONE,
            color: DEFAULT_COLOR,
            shadows: ShadowFlags::default(),
        }
    }
}

/// Keyed store of scene objects plus the mesh assets they reference.
#[derive(Default)]
pub struct ObjectRegistry {
    objects: HashMap<String, SceneObject>,
    meshes: MeshCache,
}

impl ObjectRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.objects.contains_key(key)
    }

    pub fn get(&self, key: &str) -> SceneResult<&SceneObject> {
        self.objects
            .get(key)
            .ok_or_else(|| SceneError::object_not_found(key))
    }

    pub fn meshes(&self) -> &MeshCache {
        &self.meshes
    }

    pub fn meshes_mut(&mut self) -> &mut MeshCache {
        &mut self.meshes
    }

    /// Inserts or replaces `object`.
    ///
    /// A new key, or a key whose shape kind changed, yields a full create
    /// event; otherwise only the differing fields are reported.
    pub fn upsert(&mut self, object: SceneObject) -> DiffEvent {
        let key = object.key.clone();
        match self.objects.get_mut(&key) {
            Some(existing) => {
                let released = existing.shape.mesh().map(|m| m.handle);
                let same_kind = existing.shape.kind() == object.shape.kind();
                let fields = existing.changed_fields(&object);
                *existing = object.clone();
                if let Some(handle) = released {
                    self.meshes.release(handle);
                }
                if same_kind {
                    DiffEvent::UpdateObject { key, fields }
                } else {
                    DiffEvent::CreateObject(object)
                }
            }
            None => {
                self.objects.insert(key, object.clone());
                DiffEvent::CreateObject(object)
            }
        }
    }

    /// Applies a single field change to an existing object.
    pub fn update(&mut self, key: &str, field: ObjectField) -> SceneResult<DiffEvent> {
        let object = self
            .objects
            .get_mut(key)
            .ok_or_else(|| SceneError::object_not_found(key))?;
        object.apply(field.clone());
        Ok(DiffEvent::UpdateObject {
            key: key.to_string(),
            fields: vec![field],
        })
    }

    /// Removes an object. A missing key is logged and reported as `None`.
    pub fn remove(&mut self, key: &str) -> Option<DiffEvent> {
        let Some(object) = self.objects.remove(key) else {
            warn!(key, "delete of unknown object ignored");
            return None;
        };
        if let Some(mesh) = object.shape.mesh() {
            self.meshes.release(mesh.handle);
        }
        Some(DiffEvent::DeleteObject {
            key: key.to_string(),
        })
    }

    pub fn clear(&mut self) {
        self.objects.clear();
        self.meshes.clear();
    }

    /// All objects sorted by key.
    pub fn sorted(&self) -> Vec<SceneObject> {
        let mut objects: Vec<SceneObject> = self.objects.values().cloned().collect();
        objects.sort_by(|a, b| a.key.cmp(&b.key));
        objects
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::mesh::MeshData;

    fn boxed(key: &str, position: Vec3) -> SceneObject {
        SceneObject {
            key: key.to_string(),
            shape: Shape::Box { size: Vec3::ONE },
            position,
            rotation: Vec3::ZERO,
            color: DEFAULT_COLOR,
            shadows: ShadowFlags::default(),
        }
    }

    #[test]
    fn shadow_flags_from_bools() {
        let flags = ShadowFlags::from_bools(false, true);
        assert!(!flags.casts());
        assert!(flags.receives());
        assert_eq!(ShadowFlags::default(), ShadowFlags::CAST);
    }

    #[test]
    fn upsert_new_key_is_create() {
        let mut reg = ObjectRegistry::new();
        let ev = reg.upsert(boxed("b", Vec3::ZERO));
        assert!(matches!(ev, DiffEvent::CreateObject(ref o) if o.key == "b"));
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn upsert_existing_key_reports_changed_fields_only() {
        let mut reg = ObjectRegistry::new();
        reg.upsert(boxed("b", Vec3::ZERO));
        let ev = reg.upsert(boxed("b", Vec3::new(1.0, 0.0, 0.0)));
        assert_eq!(
            ev,
            DiffEvent::UpdateObject {
                key: "b".into(),
                fields: vec![ObjectField::Position(Vec3::new(1.0, 0.0, 0.0))],
            }
        );
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn upsert_with_new_kind_is_create() {
        let mut reg = ObjectRegistry::new();
        reg.upsert(boxed("b", Vec3::ZERO));
        let mut sphere = boxed("b", Vec3::ZERO);
        sphere.shape = Shape::Sphere { radius: 1.0 };
        assert!(matches!(reg.upsert(sphere), DiffEvent::CreateObject(_)));
    }

    #[test]
    fn update_missing_key_is_not_found() {
        let mut reg = ObjectRegistry::new();
        let err = reg.update("nope", ObjectField::Color(Vec3::ONE)).unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn remove_releases_mesh() {
        let mut reg = ObjectRegistry::new();
        let mesh = reg
            .meshes_mut()
            .acquire_or_insert("m.obj", Arc::new(MeshData::default()));
        let mut obj = boxed("m", Vec3::ZERO);
        obj.shape = Shape::Mesh {
            mesh,
            scale: Vec3::ONE,
        };
        reg.upsert(obj);
        assert!(reg.meshes().contains("m.obj"));

        assert!(reg.remove("m").is_some());
        assert!(!reg.meshes().contains("m.obj"));
        assert!(reg.remove("m").is_none());
    }
}
