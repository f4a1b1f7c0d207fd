//! Versioned chunk geometry streaming

pub mod task;
pub mod result;
pub mod compile;
pub mod gc;
pub mod cell;
pub mod priority;
pub mod scheduler;
pub mod entity;
pub mod container;

pub use task::{
    ChunkKey, DrawMode, EntityTask, GeometryList, GeometryOwner, GeometryTask,
    GeometryType, VertexFormat,
};
pub use result::{CompiledList, GeometryBuildResult, ListInfo};
pub use compile::{
    compile, prepare_lists, quad_index_count, quad_indices, record_builds,
    PreparedGeometry, PreparedList, QUAD_INDEX_PATTERN,
};
pub use gc::GarbageCollector;
pub use cell::{CommitOutcome, VersionedCell};
pub use priority::{select_top, BuildPriority, PriorityWeights};
pub use scheduler::BuildScheduler;
pub use entity::EntityFrame;
pub use container::{ReadyInstance, StreamingContainer, StreamingStats, TickReport};
