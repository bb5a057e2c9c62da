pub mod hierarchy;
pub mod loader;
pub mod record;

pub use hierarchy::{
    HierarchyModel, HierarchyNode, Level, NodeId, NodePath, TreeChange, TreeCounts,
};
pub use loader::{load_record, load_records};
pub use record::Record;
