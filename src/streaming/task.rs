//! Geometry tasks handed over by the host simulation
//!
//! Tasks borrow the host's vertex memory for the duration of one call only;
//! everything is copied out before ingestion returns.

use std::fmt;

use glam::Vec3;
use serde::{Deserialize, Serialize};

/// Index of a chunk cell in the streaming container.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChunkKey(pub usize);

impl ChunkKey {
    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for ChunkKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "chunk#{}", self.0)
    }
}

/// Render layer of a geometry list.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GeometryType {
    Solid,
    CutoutMipped,
    Cutout,
    Translucent,
}

impl GeometryType {
    /// Only solid geometry may skip any-hit shading during traversal.
    pub fn is_opaque(self) -> bool {
        matches!(self, GeometryType::Solid)
    }
}

/// Host vertex layout. Every layout starts with a `float32x3` position.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VertexFormat {
    /// position
    Position,
    /// position, rgba8 color
    PositionColor,
    /// position, uv, rgba8 color
    PositionTexColor,
    /// position, rgba8 color, uv, packed light
    PositionColorTexLight,
    /// position, rgba8 color, uv, packed light, packed normal
    Block,
    /// position, rgba8 color, uv, overlay, packed light, packed normal
    Entity,
}

impl VertexFormat {
    /// Bytes per vertex.
    pub const fn stride(self) -> usize {
        match self {
            VertexFormat::Position => 12,
            VertexFormat::PositionColor => 16,
            VertexFormat::PositionTexColor => 24,
            VertexFormat::PositionColorTexLight => 28,
            VertexFormat::Block => 32,
            VertexFormat::Entity => 36,
        }
    }
}

/// Primitive topology of a geometry list.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DrawMode {
    Quads,
    Triangles,
    TriangleStrip,
    Lines,
    LineStrip,
}

/// One sub-list of a task: vertices sharing type, texture and layout.
#[derive(Clone, Copy, Debug)]
pub struct GeometryList<'a> {
    pub geometry_type: GeometryType,
    pub texture_id: u32,
    pub vertex_format: VertexFormat,
    pub draw_mode: DrawMode,
    /// Raw vertex bytes, `vertex_format.stride()` bytes per vertex
    pub vertices: &'a [u8],
}

/// Geometry for one chunk cell.
#[derive(Clone, Debug)]
pub struct GeometryTask<'a> {
    pub key: ChunkKey,
    /// World-space origin of the chunk, used for instancing and priority
    pub origin: Vec3,
    pub lists: Vec<GeometryList<'a>>,
}

/// Geometry for one entity, rebuilt every frame.
#[derive(Clone, Debug)]
pub struct EntityTask<'a> {
    pub entity_id: u64,
    pub origin: Vec3,
    pub lists: Vec<GeometryList<'a>>,
}

/// Who a build result belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum GeometryOwner {
    Chunk(ChunkKey),
    Entity(u64),
}

impl fmt::Display for GeometryOwner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GeometryOwner::Chunk(key) => write!(f, "{}", key),
            GeometryOwner::Entity(id) => write!(f, "entity#{}", id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strides_hold_a_position() {
        for format in [
            VertexFormat::Position,
            VertexFormat::PositionColor,
            VertexFormat::PositionTexColor,
            VertexFormat::PositionColorTexLight,
            VertexFormat::Block,
            VertexFormat::Entity,
        ] {
            assert!(format.stride() >= 12);
            assert_eq!(format.stride() % 4, 0, "{:?}", format);
        }
    }

    #[test]
    fn test_only_solid_is_opaque() {
        assert!(GeometryType::Solid.is_opaque());
        assert!(!GeometryType::Cutout.is_opaque());
        assert!(!GeometryType::CutoutMipped.is_opaque());
        assert!(!GeometryType::Translucent.is_opaque());
    }

    #[test]
    fn test_owner_display() {
        assert_eq!(GeometryOwner::Chunk(ChunkKey(7)).to_string(), "chunk#7");
        assert_eq!(GeometryOwner::Entity(3).to_string(), "entity#3");
    }
}
