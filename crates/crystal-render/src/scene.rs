//! Scene description consumed by the renderers.
//!
//! A [`Scene`] is plain CPU data. Renderers remember what they uploaded as
//! a [`SceneSnapshot`] and ask the scene what changed since then, so the
//! scene never needs to know who is drawing it.

use bitflags::bitflags;
use crystal_gpu::Vertex;
use glam::{Affine3A, Mat4};
use hashbrown::HashMap;

use crate::error::{RenderError, Result};

bitflags! {
    /// What changed in a scene since a snapshot.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct SceneChanges: u8 {
        /// Vertex or index data of an existing mesh changed.
        const GEOMETRY = 1 << 0;
        /// A mesh was added or removed.
        const TOPOLOGY = 1 << 1;
        /// A mesh moved.
        const TRANSFORM = 1 << 2;
    }
}

/// Stable identifier of a mesh within one [`Scene`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MeshId(u32);

impl MeshId {
    pub fn index(self) -> u32 {
        self.0
    }
}

/// Indexed triangle mesh.
#[derive(Debug, Clone, PartialEq)]
pub struct Mesh {
    pub vertices: Vec<Vertex>,
    pub indices: Vec<u32>,
    pub transform: Affine3A,
}

impl Mesh {
    pub fn new(vertices: Vec<Vertex>, indices: Vec<u32>) -> Self {
        Self {
            vertices,
            indices,
            transform: Affine3A::IDENTITY,
        }
    }

    pub fn with_transform(mut self, transform: Affine3A) -> Self {
        self.transform = transform;
        self
    }

    /// A single triangle in the XY plane.
    pub fn triangle() -> Self {
        let normal = [0.0, 0.0, 1.0];
        Self::new(
            vec![
                Vertex::new([-0.5, -0.5, 0.0], normal, [0.0, 0.0]),
                Vertex::new([0.5, -0.5, 0.0], normal, [1.0, 0.0]),
                Vertex::new([0.0, 0.5, 0.0], normal, [0.5, 1.0]),
            ],
            vec![0, 1, 2],
        )
    }

    /// Unit cube centred on the origin, four vertices per face.
    pub fn cube() -> Self {
        const FACES: [([f32; 3], [f32; 3], [f32; 3]); 6] = [
            ([1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]),
            ([-1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, -1.0]),
            ([0.0, 1.0, 0.0], [0.0, 0.0, 1.0], [1.0, 0.0, 0.0]),
            ([0.0, -1.0, 0.0], [0.0, 0.0, -1.0], [1.0, 0.0, 0.0]),
            ([0.0, 0.0, 1.0], [1.0, 0.0, 0.0], [0.0, 1.0, 0.0]),
            ([0.0, 0.0, -1.0], [-1.0, 0.0, 0.0], [0.0, 1.0, 0.0]),
        ];
        let mut vertices = Vec::with_capacity(24);
        let mut indices = Vec::with_capacity(36);
        for (normal, u, v) in FACES {
            let n = glam::Vec3::from(normal);
            let (u, v) = (glam::Vec3::from(u), glam::Vec3::from(v));
            let base = vertices.len() as u32;
            for (su, sv) in [(-1.0, -1.0), (1.0, -1.0), (1.0, 1.0), (-1.0, 1.0)] {
                let position = (n + u * su + v * sv) * 0.5;
                vertices.push(Vertex::new(
                    position.to_array(),
                    normal,
                    [(su + 1.0) * 0.5, (sv + 1.0) * 0.5],
                ));
            }
            indices.extend_from_slice(&[base, base + 1, base + 2, base, base + 2, base + 3]);
        }
        Self::new(vertices, indices)
    }

    pub fn triangle_count(&self) -> usize {
        self.indices.len() / 3
    }

    /// Check the mesh can be uploaded and used as BLAS geometry.
    pub fn validate(&self) -> Result<()> {
        if self.vertices.is_empty() || self.indices.is_empty() {
            return Err(RenderError::InvalidMesh("mesh has no triangles".to_string()));
        }
        if self.indices.len() % 3 != 0 {
            return Err(RenderError::InvalidMesh(format!(
                "index count {} is not a multiple of 3",
                self.indices.len()
            )));
        }
        let vertex_count = self.vertices.len();
        if let Some(&index) = self.indices.iter().find(|&&i| i as usize >= vertex_count) {
            return Err(RenderError::InvalidMesh(format!(
                "index {index} out of range for {vertex_count} vertices"
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
struct SceneMesh {
    mesh: Mesh,
    geometry_revision: u64,
    transform_revision: u64,
}

/// Revisions a renderer last consumed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SceneSnapshot {
    meshes: HashMap<MeshId, (u64, u64)>,
}

impl SceneSnapshot {
    pub fn is_empty(&self) -> bool {
        self.meshes.is_empty()
    }
}

/// Difference between a scene and a snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SceneDiff {
    pub changes: SceneChanges,
    /// Meshes present in both whose vertex or index data changed.
    pub geometry: Vec<MeshId>,
}

impl SceneDiff {
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }
}

/// Meshes to draw plus the camera.
#[derive(Debug, Clone)]
pub struct Scene {
    meshes: HashMap<MeshId, SceneMesh>,
    next_id: u32,
    revision: u64,
    view_projection: Mat4,
}

impl Default for Scene {
    fn default() -> Self {
        Self::new()
    }
}

impl Scene {
    pub fn new() -> Self {
        Self {
            meshes: HashMap::new(),
            next_id: 0,
            revision: 0,
            view_projection: Mat4::IDENTITY,
        }
    }

    fn next_revision(&mut self) -> u64 {
        self.revision += 1;
        self.revision
    }

    pub fn add_mesh(&mut self, mesh: Mesh) -> Result<MeshId> {
        mesh.validate()?;
        let id = MeshId(self.next_id);
        self.next_id += 1;
        let revision = self.next_revision();
        self.meshes.insert(
            id,
            SceneMesh {
                mesh,
                geometry_revision: revision,
                transform_revision: revision,
            },
        );
        Ok(id)
    }

    pub fn remove_mesh(&mut self, id: MeshId) -> Option<Mesh> {
        self.meshes.remove(&id).map(|entry| entry.mesh)
    }

    /// Replace the vertex and index data of a mesh.
    pub fn update_geometry(&mut self, id: MeshId, vertices: Vec<Vertex>, indices: Vec<u32>) -> Result<()> {
        let transform = self.mesh(id).ok_or(RenderError::UnknownMesh(id))?.transform;
        let mesh = Mesh {
            vertices,
            indices,
            transform,
        };
        mesh.validate()?;
        let revision = self.next_revision();
        if let Some(entry) = self.meshes.get_mut(&id) {
            entry.mesh = mesh;
            entry.geometry_revision = revision;
        }
        Ok(())
    }

    pub fn set_transform(&mut self, id: MeshId, transform: Affine3A) -> Result<()> {
        let revision = self.next_revision();
        let entry = self.meshes.get_mut(&id).ok_or(RenderError::UnknownMesh(id))?;
        entry.mesh.transform = transform;
        entry.transform_revision = revision;
        Ok(())
    }

    pub fn mesh(&self, id: MeshId) -> Option<&Mesh> {
        self.meshes.get(&id).map(|entry| &entry.mesh)
    }

    /// Meshes in id order.
    pub fn meshes(&self) -> Vec<(MeshId, &Mesh)> {
        let mut meshes: Vec<(MeshId, &Mesh)> =
            self.meshes.iter().map(|(&id, entry)| (id, &entry.mesh)).collect();
        meshes.sort_by_key(|(id, _)| *id);
        meshes
    }

    pub fn len(&self) -> usize {
        self.meshes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.meshes.is_empty()
    }

    pub fn view_projection(&self) -> Mat4 {
        self.view_projection
    }

    pub fn set_view_projection(&mut self, view_projection: Mat4) {
        self.view_projection = view_projection;
    }

    pub fn snapshot(&self) -> SceneSnapshot {
        SceneSnapshot {
            meshes: self
                .meshes
                .iter()
                .map(|(&id, entry)| (id, (entry.geometry_revision, entry.transform_revision)))
                .collect(),
        }
    }

    /// What changed since `since` was taken.
    pub fn diff(&self, since: &SceneSnapshot) -> SceneDiff {
        let mut diff = SceneDiff::default();
        let same_set = self.meshes.len() == since.meshes.len()
            && self.meshes.keys().all(|id| since.meshes.contains_key(id));
        if !same_set {
            diff.changes |= SceneChanges::TOPOLOGY;
        }
        for (&id, entry) in &self.meshes {
            let Some(&(geometry, transform)) = since.meshes.get(&id) else {
                continue;
            };
            if geometry != entry.geometry_revision {
                diff.changes |= SceneChanges::GEOMETRY;
                diff.geometry.push(id);
            }
            if transform != entry.transform_revision {
                diff.changes |= SceneChanges::TRANSFORM;
            }
        }
        diff.geometry.sort();
        diff
    }
}
