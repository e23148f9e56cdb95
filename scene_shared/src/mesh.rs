//! Mesh asset cache.
//!
//! Mesh geometry is produced by an external loader and interned here by source
//! path. Scene objects hold a [`MeshRef`] (handle + shared read-only data); the
//! cache counts references and frees an entry when the last object lets go.

use std::{collections::HashMap, sync::Arc};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{
    error::{SceneError, SceneResult},
    math::Vec3,
};

/// Axis-aligned bounding box.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct Aabb {
    pub min: Vec3,
    pub max: Vec3,
}

impl Aabb {
    pub fn extents(&self) -> Vec3 {
        self.max - self.min
    }

    pub fn volume(&self) -> f64 {
        let e = self.extents();
        e.x * e.y * e.z
    }
}

/// Triangle mesh geometry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct MeshData {
    pub vertices: Vec<Vec3>,
    pub triangles: Vec<[u32; 3]>,
}

impl MeshData {
    pub fn new(vertices: Vec<Vec3>, triangles: Vec<[u32; 3]>) -> Self {
        Self {
            vertices,
            triangles,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.vertices.is_empty()
    }

    /// Bounding box of all vertices; a zero box for an empty mesh.
    pub fn bounding_box(&self) -> Aabb {
        let mut iter = self.vertices.iter().copied();
        let Some(first) = iter.next() else {
            return Aabb::default();
        };
        let (min, max) = iter.fold((first, first), |(lo, hi), v| (lo.min(v), hi.max(v)));
        Aabb { min, max }
    }

    /// Bounding box volume after applying a per-axis scale.
    pub fn scaled_volume(&self, scale: Vec3) -> f64 {
        let e = self.bounding_box().extents();
        (e.x * scale.x * e.y * scale.y * e.z * scale.z).abs()
    }

    /// Checks that every vertex is finite and every triangle index points at
    /// a vertex.
    pub fn validate(&self) -> Result<(), String> {
        if let Some(i) = self.vertices.iter().position(|v| !v.is_finite()) {
            return Err(format!("vertex {i} is not finite"));
        }
        let n = self.vertices.len() as u32;
        match self.triangles.iter().flatten().find(|&&i| i >= n) {
            Some(bad) => Err(format!("triangle index {bad} out of range ({n} vertices)")),
            None => Ok(()),
        }
    }
}

/// External mesh loading collaborator.
pub trait MeshLoader: Send + Sync {
    fn load(&self, path: &str) -> anyhow::Result<MeshData>;
}

/// Loader used when the host did not configure one; every load fails.
#[derive(Debug, Default)]
pub struct NullMeshLoader;

impl MeshLoader for NullMeshLoader {
    fn load(&self, path: &str) -> anyhow::Result<MeshData> {
        anyhow::bail!("no mesh loader configured for '{path}'")
    }
}

/// Loader backed by geometry registered up front. Useful for tests and
/// procedurally generated meshes.
#[derive(Debug, Default)]
pub struct InMemoryMeshLoader {
    meshes: HashMap<String, MeshData>,
}

impl InMemoryMeshLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_mesh(mut self, path: &str, data: MeshData) -> Self {
        self.meshes.insert(path.to_string(), data);
        self
    }
}

impl MeshLoader for InMemoryMeshLoader {
    fn load(&self, path: &str) -> anyhow::Result<MeshData> {
        self.meshes
            .get(path)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("mesh '{path}' not registered"))
    }
}

/// Loads through `loader`, converting failures into [`SceneError::AssetLoad`].
pub fn load_mesh(loader: &dyn MeshLoader, path: &str) -> SceneResult<MeshData> {
    let data = loader.load(path).map_err(|e| SceneError::AssetLoad {
        path: path.to_string(),
        reason: format!("{e:#}"),
    })?;
    data.validate().map_err(|reason| SceneError::AssetLoad {
        path: path.to_string(),
        reason,
    })?;
    if data.is_empty() {
        warn!(path, "Loaded mesh has no vertices");
    }
    Ok(data)
}

/// Opaque mesh asset handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MeshHandle(pub u64);

/// Reference from a scene object to a cached mesh.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeshRef {
    pub handle: MeshHandle,
    pub path: String,
    pub data: Arc<MeshData>,
}

impl PartialEq for MeshRef {
    fn eq(&self, other: &Self) -> bool {
        self.handle == other.handle
            && self.path == other.path
            && (Arc::ptr_eq(&self.data, &other.data) || self.data == other.data)
    }
}

struct MeshEntry {
    path: String,
    data: Arc<MeshData>,
    refs: usize,
}

/// Reference-counted mesh arena keyed by source path.
#[derive(Default)]
pub struct MeshCache {
    next_id: u64,
    by_path: HashMap<String, MeshHandle>,
    entries: HashMap<MeshHandle, MeshEntry>,
}

impl MeshCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, path: &str) -> bool {
        self.by_path.contains_key(path)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn ref_count(&self, handle: MeshHandle) -> Option<usize> {
        self.entries.get(&handle).map(|e| e.refs)
    }

    /// Takes a new reference to an already cached mesh.
    pub fn acquire(&mut self, path: &str) -> Option<MeshRef> {
        let handle = *self.by_path.get(path)?;
        let entry = self.entries.get_mut(&handle)?;
        entry.refs += 1;
        Some(MeshRef {
            handle,
            path: entry.path.clone(),
            data: Arc::clone(&entry.data),
        })
    }

    /// Takes a reference, interning `data` if the path is not cached yet.
    pub fn acquire_or_insert(&mut self, path: &str, data: Arc<MeshData>) -> MeshRef {
        if let Some(existing) = self.acquire(path) {
            return existing;
        }
        let handle = MeshHandle(self.next_id);
        self.next_id += 1;
        self.by_path.insert(path.to_string(), handle);
        self.entries.insert(
            handle,
            MeshEntry {
                path: path.to_string(),
                data: Arc::clone(&data),
                refs: 1,
            },
        );
        debug!(path, handle = handle.0, "Mesh cached");
        MeshRef {
            handle,
            path: path.to_string(),
            data,
        }
    }

    /// Drops one reference; the entry is freed when none remain.
    pub fn release(&mut self, handle: MeshHandle) {
        let Some(entry) = self.entries.get_mut(&handle) else {
            warn!(handle = handle.0, "Release of unknown mesh handle");
            return;
        };
        entry.refs = entry.refs.saturating_sub(1);
        if entry.refs == 0 {
            if let Some(entry) = self.entries.remove(&handle) {
                self.by_path.remove(&entry.path);
                debug!(path = %entry.path, handle = handle.0, "Mesh released");
            }
        }
    }

    pub fn clear(&mut self) {
        self.by_path.clear();
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tetra() -> MeshData {
        MeshData::new(
            vec![
                Vec3::ZERO,
                Vec3::new(2.0, 0.0, 0.0),
                Vec3::new(0.0, 3.0, 0.0),
                Vec3::new(0.0, 0.0, 4.0),
            ],
            vec![[0, 1, 2], [0, 1, 3], [0, 2, 3], [1, 2, 3]],
        )
    }

    #[test]
    fn bounding_box_and_volume() {
        let mesh = tetra();
        let bb = mesh.bounding_box();
        assert_eq!(bb.min, Vec3::ZERO);
        assert_eq!(bb.max, Vec3::new(2.0, 3.0, 4.0));
        assert_eq!(bb.volume(), 24.0);
        assert_eq!(mesh.scaled_volume(Vec3::new(0.5, 1.0, 1.0)), 12.0);
        assert_eq!(MeshData::default().bounding_box(), Aabb::default());
    }

    #[test]
    fn validate_rejects_bad_indices() {
        let mut mesh = tetra();
        assert!(mesh.validate().is_ok());
        mesh.triangles.push([0, 1, 9]);
        assert!(mesh.validate().is_err());

        let mut mesh = tetra();
        mesh.vertices[2].y = f64::INFINITY;
        assert!(mesh.validate().unwrap_err().contains("vertex 2"));
    }

    #[test]
    fn cache_refcounts_and_frees() {
        let mut cache = MeshCache::new();
        let a = cache.acquire_or_insert("a.obj", Arc::new(tetra()));
        let b = cache.acquire_or_insert("a.obj", Arc::new(MeshData::default()));
        assert_eq!(a.handle, b.handle);
        assert!(Arc::ptr_eq(&a.data, &b.data));
        assert_eq!(cache.ref_count(a.handle), Some(2));

        cache.release(a.handle);
        assert!(cache.contains("a.obj"));
        cache.release(b.handle);
        assert!(!cache.contains("a.obj"));
        assert!(cache.is_empty());
    }

    #[test]
    fn load_failure_is_asset_load_error() {
        let err = load_mesh(&NullMeshLoader, "missing.stl").unwrap_err();
        assert!(matches!(err, SceneError::AssetLoad { ref path, .. } if path == "missing.stl"));

        let loader = InMemoryMeshLoader::new().with_mesh("t.obj", tetra());
        assert_eq!(load_mesh(&loader, "t.obj").unwrap().vertices.len(), 4);
    }
}
