//! Scan-tree primitives: the range node value type, its content-derived hash,
//! and the partitioner that splits a root interval into claimable leaves.

pub mod node;
pub mod partition;

pub use node::{NodeHash, ParentRef, RangeNode, RangeNodeParts};
pub use partition::{PartitionError, RangePartitioner};
